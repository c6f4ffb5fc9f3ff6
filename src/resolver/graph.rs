//! Dependency graph over manifest ids.
//!
//! Nodes keep discovery order. Edges point from a plugin to each of its
//! non-optional dependencies; optional dependencies never constrain order.

use crate::manifest::{DependencySpec, Manifest};
use std::collections::{HashMap, HashSet};

/// One graph node.
#[derive(Clone, Debug)]
pub struct GraphNode {
    /// Plugin id
    pub id: String,
    /// Plugin version
    pub version: String,
    /// All declared dependencies
    pub dependencies: Vec<DependencySpec>,
}

/// Dependency graph built from a manifest set.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build from manifests. A repeated id keeps its first occurrence.
    pub fn new(manifests: &[Manifest]) -> Self {
        let mut graph = Self::default();
        for manifest in manifests {
            if graph.index.contains_key(&manifest.id) {
                continue;
            }
            graph.index.insert(manifest.id.clone(), graph.nodes.len());
            graph.nodes.push(GraphNode {
                id: manifest.id.clone(),
                version: manifest.version.clone(),
                dependencies: manifest.dependencies.clone(),
            });
        }
        graph
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether an id is known.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Node by id.
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes in discovery order.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Known non-optional dependency positions of a node, deduplicated.
    pub(crate) fn required_edges(&self, position: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        self.nodes[position]
            .dependencies
            .iter()
            .filter(|d| !d.optional)
            .filter_map(|d| self.position(&d.id))
            .filter(|&p| seen.insert(p))
            .collect()
    }

    /// Direct dependents (nodes that require `id`), in discovery order.
    pub fn direct_dependents(&self, id: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.iter().any(|d| !d.optional && d.id == id))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Transitive non-optional dependencies of `id`, dependencies first.
    pub fn dependencies_recursive(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let Some(start) = self.position(id) else {
            return out;
        };
        let mut visited = HashSet::from([start]);
        // (node, its edges, next edge to follow)
        let mut stack = vec![(start, self.required_edges(start), 0usize)];
        while let Some((position, edges, next)) = stack.last_mut() {
            if let Some(&dep) = edges.get(*next) {
                *next += 1;
                if visited.insert(dep) {
                    stack.push((dep, self.required_edges(dep), 0));
                }
                continue;
            }
            let finished = *position;
            stack.pop();
            if finished != start {
                out.push(self.nodes[finished].id.clone());
            }
        }
        out
    }

    /// Transitive dependents of `id`, nearest first.
    pub fn dependents_recursive(&self, id: &str) -> Vec<String> {
        let mut visited: HashSet<String> = HashSet::from([id.to_string()]);
        let mut out = Vec::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for dependent in self.direct_dependents(&current) {
                if visited.insert(dependent.clone()) {
                    out.push(dependent.clone());
                    frontier.push(dependent);
                }
            }
        }
        out
    }

    /// First cycle reachable from `id`, as the ids along it.
    pub fn cycle_from(&self, id: &str) -> Option<Vec<String>> {
        let start = self.position(id)?;
        let mut state = vec![Visit::New; self.nodes.len()];
        self.find_cycle(start, &mut state)
    }

    /// First cycle among `candidates`, searched in the given order.
    pub(crate) fn cycle_among(&self, candidates: &[usize]) -> Option<Vec<String>> {
        let mut state = vec![Visit::New; self.nodes.len()];
        for &candidate in candidates {
            if state[candidate] == Visit::New {
                if let Some(cycle) = self.find_cycle(candidate, &mut state) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Depth-first search from `start`; the stack is the current path.
    fn find_cycle(&self, start: usize, state: &mut [Visit]) -> Option<Vec<String>> {
        state[start] = Visit::OnPath;
        let mut stack = vec![(start, self.required_edges(start), 0usize)];
        while let Some((position, edges, next)) = stack.last_mut() {
            let Some(&dep) = edges.get(*next) else {
                state[*position] = Visit::Done;
                stack.pop();
                continue;
            };
            *next += 1;
            match state[dep] {
                Visit::OnPath => {
                    let from = stack.iter().position(|(p, _, _)| *p == dep).unwrap_or(0);
                    return Some(stack[from..].iter().map(|(p, _, _)| self.nodes[*p].id.clone()).collect());
                }
                Visit::New => {
                    state[dep] = Visit::OnPath;
                    stack.push((dep, self.required_edges(dep), 0));
                }
                Visit::Done => {}
            }
        }
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Visit {
    New,
    OnPath,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, deps: &[&str]) -> Manifest {
        deps.iter().fold(Manifest::new(id, id, "1.0.0"), |m, d| {
            m.with_dependency(DependencySpec::required(d))
        })
    }

    #[test]
    fn test_recursive_dependencies_come_first() {
        let graph = DependencyGraph::new(&[
            manifest("a", &[]),
            manifest("b", &["a"]),
            manifest("c", &["b", "a"]),
        ]);
        assert_eq!(graph.dependencies_recursive("c"), vec!["a", "b"]);
        assert!(graph.dependencies_recursive("a").is_empty());
        assert!(graph.dependencies_recursive("unknown").is_empty());
    }

    #[test]
    fn test_dependents() {
        let graph = DependencyGraph::new(&[
            manifest("a", &[]),
            manifest("b", &["a"]),
            manifest("c", &["b"]),
            manifest("d", &["a"]),
        ]);
        assert_eq!(graph.direct_dependents("a"), vec!["b", "d"]);
        let mut all = graph.dependents_recursive("a");
        all.sort();
        assert_eq!(all, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_traversal_terminates_on_cycle() {
        let graph = DependencyGraph::new(&[manifest("a", &["b"]), manifest("b", &["a"])]);
        assert_eq!(graph.dependencies_recursive("a"), vec!["b"]);
        assert_eq!(graph.dependents_recursive("a"), vec!["b"]);
        let cycle = graph.cycle_from("a").unwrap();
        assert_eq!(cycle, vec!["a", "b"]);
    }

    #[test]
    fn test_deep_chain_does_not_exhaust_the_stack() {
        let depth = 50_000;
        let manifests: Vec<Manifest> = (0..depth)
            .map(|i| {
                let next = format!("n{}", i + 1);
                if i + 1 < depth {
                    manifest(&format!("n{i}"), &[next.as_str()])
                } else {
                    manifest(&format!("n{i}"), &[])
                }
            })
            .collect();
        let graph = DependencyGraph::new(&manifests);

        let deps = graph.dependencies_recursive("n0");
        assert_eq!(deps.len(), depth - 1);
        assert_eq!(deps.first().map(String::as_str), Some("n49999"));
        assert_eq!(deps.last().map(String::as_str), Some("n1"));
        assert!(graph.cycle_from("n0").is_none());
    }

    #[test]
    fn test_cycle_reported_along_path() {
        let graph = DependencyGraph::new(&[
            manifest("a", &["b"]),
            manifest("b", &["c"]),
            manifest("c", &["d"]),
            manifest("d", &["b"]),
        ]);
        assert_eq!(graph.cycle_from("a").unwrap(), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_optional_edges_ignored() {
        let graph = DependencyGraph::new(&[
            manifest("a", &[]).with_dependency(DependencySpec::optional("b")),
            manifest("b", &["a"]),
        ]);
        assert!(graph.cycle_from("a").is_none());
        assert!(graph.dependencies_recursive("a").is_empty());
    }
}
