//! Dependency Resolver
//!
//! Computes a deterministic load order from a manifest set:
//! - Kahn's algorithm over non-optional dependency edges
//! - Ties broken by discovery order
//! - Cycle detection and reporting
//! - Dependency presence and version checks

pub mod graph;

pub use graph::{DependencyGraph, GraphNode};

use crate::core::{Error, Result};
use crate::manifest::version;
use crate::manifest::Manifest;
use std::collections::{BTreeSet, HashSet};

/// Result of checking a manifest's non-optional dependencies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyCheck {
    /// Dependencies that are available
    pub satisfied: Vec<String>,
    /// Dependencies that are missing
    pub missing: Vec<String>,
}

impl DependencyCheck {
    /// Whether every non-optional dependency is available.
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Load plan produced by a tolerant resolve.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadPlan {
    /// Ids in load order
    pub order: Vec<String>,
    /// Ids that could not be ordered (cycle members and their dependents)
    pub blocked: Vec<String>,
    /// One detected cycle, if any
    pub cycle: Option<Vec<String>>,
}

/// Dependency resolver over a fixed manifest set.
#[derive(Clone, Debug, Default)]
pub struct DependencyResolver {
    graph: DependencyGraph,
}

impl DependencyResolver {
    /// Create a resolver for a manifest set.
    pub fn new(manifests: &[Manifest]) -> Self {
        Self {
            graph: DependencyGraph::new(manifests),
        }
    }

    /// The underlying graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Compute the load order, failing on any cycle.
    pub fn resolve_load_order(&self) -> Result<Vec<String>> {
        let plan = self.plan();
        match plan.cycle {
            Some(members) => Err(Error::CircularDependency { members }),
            None => Ok(plan.order),
        }
    }

    /// Compute the load order, setting aside whatever a cycle blocks.
    pub fn plan(&self) -> LoadPlan {
        let n = self.graph.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (position, degree) in in_degree.iter_mut().enumerate() {
            let edges = self.graph.required_edges(position);
            *degree = edges.len();
            for dep in edges {
                dependents[dep].push(position);
            }
        }

        // Lowest discovery index first among ready nodes.
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        let nodes = self.graph.nodes();
        if order.len() == n {
            return LoadPlan {
                order: order.into_iter().map(|i| nodes[i].id.clone()).collect(),
                blocked: Vec::new(),
                cycle: None,
            };
        }

        let visited: HashSet<usize> = order.iter().copied().collect();
        let remaining: Vec<usize> = (0..n).filter(|i| !visited.contains(i)).collect();
        let cycle = self.graph.cycle_among(&remaining).or_else(|| {
            // Unreachable for a consistent graph; report the remainder.
            Some(remaining.iter().map(|&i| nodes[i].id.clone()).collect())
        });

        LoadPlan {
            order: order.into_iter().map(|i| nodes[i].id.clone()).collect(),
            blocked: remaining.into_iter().map(|i| nodes[i].id.clone()).collect(),
            cycle,
        }
    }

    /// Check a manifest's non-optional dependencies against available ids.
    pub fn check_dependencies<S: AsRef<str>>(manifest: &Manifest, available: &[S]) -> DependencyCheck {
        let available: HashSet<&str> = available.iter().map(|s| s.as_ref()).collect();
        let mut check = DependencyCheck::default();
        for dep in manifest.required_dependencies() {
            if available.contains(dep.id.as_str()) {
                check.satisfied.push(dep.id.clone());
            } else {
                check.missing.push(dep.id.clone());
            }
        }
        check
    }

    /// Every unknown non-optional dependency, as errors.
    pub fn validate_dependencies(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        for node in self.graph.nodes() {
            for dep in node.dependencies.iter().filter(|d| !d.optional) {
                if !self.graph.contains(&dep.id) {
                    errors.push(Error::MissingDependency {
                        plugin_id: node.id.clone(),
                        dependency: dep.id.clone(),
                    });
                }
            }
        }
        errors
    }

    /// Version mismatches among a plugin's known dependencies.
    pub fn check_versions(&self, id: &str) -> Vec<Error> {
        let Some(node) = self.graph.node(id) else {
            return Vec::new();
        };
        node.dependencies
            .iter()
            .filter_map(|dep| {
                let required = dep.version.as_deref()?;
                let available = self.graph.node(&dep.id)?;
                if version::satisfies(&available.version, required) {
                    None
                } else {
                    Some(Error::IncompatibleDependency {
                        plugin_id: id.to_string(),
                        dependency: dep.id.clone(),
                        required: required.to_string(),
                        available: available.version.clone(),
                    })
                }
            })
            .collect()
    }

    /// Transitive non-optional dependencies, dependencies first.
    pub fn get_dependencies_recursive(&self, id: &str) -> Vec<String> {
        self.graph.dependencies_recursive(id)
    }

    /// Direct dependents of a plugin.
    pub fn get_dependents(&self, id: &str) -> Vec<String> {
        self.graph.direct_dependents(id)
    }

    /// Transitive dependents of a plugin.
    pub fn get_dependents_recursive(&self, id: &str) -> Vec<String> {
        self.graph.dependents_recursive(id)
    }

    /// A cycle reachable from `id`, if any.
    pub fn find_cycle_from(&self, id: &str) -> Option<Vec<String>> {
        self.graph.cycle_from(id)
    }
}

/// Compute the load order of a manifest set.
pub fn resolve_load_order(manifests: &[Manifest]) -> Result<Vec<String>> {
    DependencyResolver::new(manifests).resolve_load_order()
}
