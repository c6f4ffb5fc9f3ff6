//! Action and filter hooks.
//!
//! Actions are awaited one after another; filters thread a value through
//! every callback. Both run lowest priority first.

use crate::core::error::panic_message;
use crate::core::{sync, Result};
use crate::messaging::dispatch::{HandlerId, HandlerList, Snapshot};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

/// Hook registration handle.
pub type HookId = HandlerId;

/// Action callback.
pub type ActionHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Filter callback: `(value, args) -> value`.
pub type FilterHandler = Arc<dyn Fn(Value, &Value) -> Result<Value> + Send + Sync>;

/// Result of `do_action`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Callbacks ran
    Executed {
        /// Callbacks invoked
        handlers: usize,
        /// Callbacks that failed
        failures: usize,
    },
    /// The action was already running and the call was refused
    Refused,
}

/// Action and filter registries.
#[derive(Default)]
pub struct HookRegistry {
    actions: RwLock<HashMap<String, HandlerList<ActionHandler>>>,
    filters: RwLock<HashMap<String, HandlerList<FilterHandler>>>,
    executing: Mutex<HashSet<String>>,
}

/// Clears the executing mark of an action when dropped.
struct ExecutingGuard<'a> {
    executing: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        sync::lock(self.executing).remove(&self.name);
    }
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action callback.
    pub fn add_action<F, Fut>(&self, name: &str, priority: i32, owner: Option<&str>, handler: F) -> HookId
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |args| handler(args).boxed());
        sync::write(&self.actions)
            .entry(name.to_string())
            .or_default()
            .insert(priority, owner, handler)
    }

    /// Register a filter callback.
    pub fn add_filter<F>(&self, name: &str, priority: i32, owner: Option<&str>, handler: F) -> HookId
    where
        F: Fn(Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        let handler: FilterHandler = Arc::new(handler);
        sync::write(&self.filters)
            .entry(name.to_string())
            .or_default()
            .insert(priority, owner, handler)
    }

    /// Run every action callback for `name`, awaiting each in turn.
    ///
    /// A call for an action that is already running is refused.
    pub async fn do_action(&self, name: &str, args: Value) -> ActionOutcome {
        if !sync::lock(&self.executing).insert(name.to_string()) {
            warn!(action = name, "re-entrant action call refused");
            return ActionOutcome::Refused;
        }
        let _guard = ExecutingGuard {
            executing: &self.executing,
            name: name.to_string(),
        };

        let snapshot = self.action_snapshot(name);
        let handlers = snapshot.len();
        let mut failures = 0;
        for entry in snapshot {
            let call = AssertUnwindSafe((entry.handler)(args.clone())).catch_unwind();
            match call.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(action = name, owner = ?entry.owner, error = %e, "action callback failed");
                }
                Err(payload) => {
                    failures += 1;
                    warn!(
                        action = name,
                        owner = ?entry.owner,
                        panic = %panic_message(payload.as_ref()),
                        "action callback panicked"
                    );
                }
            }
        }
        debug!(action = name, handlers, failures, "action executed");
        ActionOutcome::Executed { handlers, failures }
    }

    /// Thread `value` through every filter for `name`.
    ///
    /// A failing filter is skipped and the value it received is passed on.
    pub fn apply_filters(&self, name: &str, value: Value, args: &Value) -> Value {
        let snapshot = sync::read(&self.filters)
            .get(name)
            .map(HandlerList::snapshot);
        let Some(snapshot) = snapshot else {
            return value;
        };
        snapshot.reduce(value, |current, entry| {
            let input = current.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(input, args))) {
                Ok(Ok(next)) => next,
                Ok(Err(e)) => {
                    warn!(filter = name, owner = ?entry.owner, error = %e, "filter failed, value passed through");
                    current
                }
                Err(payload) => {
                    warn!(
                        filter = name,
                        owner = ?entry.owner,
                        panic = %panic_message(payload.as_ref()),
                        "filter panicked, value passed through"
                    );
                    current
                }
            }
        })
    }

    /// Remove one action callback.
    pub fn remove_action(&self, name: &str, id: HookId) -> bool {
        remove_from(&self.actions, name, id)
    }

    /// Remove one filter callback.
    pub fn remove_filter(&self, name: &str, id: HookId) -> bool {
        remove_from(&self.filters, name, id)
    }

    /// Remove every action and filter registered by `owner`.
    pub fn remove_plugin_hooks(&self, owner: &str) -> usize {
        let removed = remove_owner_from(&self.actions, owner) + remove_owner_from(&self.filters, owner);
        if removed > 0 {
            debug!(plugin_id = owner, removed, "removed plugin hooks");
        }
        removed
    }

    /// Whether any action callback is registered for `name`.
    pub fn has_action(&self, name: &str) -> bool {
        sync::read(&self.actions).contains_key(name)
    }

    /// Whether any filter is registered for `name`.
    pub fn has_filter(&self, name: &str) -> bool {
        sync::read(&self.filters).contains_key(name)
    }

    /// Number of action callbacks for `name`.
    pub fn action_count(&self, name: &str) -> usize {
        sync::read(&self.actions).get(name).map_or(0, |l| l.len())
    }

    /// Number of filters for `name`.
    pub fn filter_count(&self, name: &str) -> usize {
        sync::read(&self.filters).get(name).map_or(0, |l| l.len())
    }

    fn action_snapshot(&self, name: &str) -> Snapshot<ActionHandler> {
        sync::read(&self.actions)
            .get(name)
            .map(HandlerList::snapshot)
            .unwrap_or_else(|| HandlerList::new().snapshot())
    }
}

fn remove_from<T>(registry: &RwLock<HashMap<String, HandlerList<T>>>, name: &str, id: HookId) -> bool {
    let mut lists = sync::write(registry);
    let Some(list) = lists.get_mut(name) else {
        return false;
    };
    let removed = list.remove(id).is_some();
    if list.is_empty() {
        lists.remove(name);
    }
    removed
}

fn remove_owner_from<T>(registry: &RwLock<HashMap<String, HandlerList<T>>>, owner: &str) -> usize {
    let mut lists = sync::write(registry);
    let removed = lists.values_mut().map(|l| l.remove_owner(owner)).sum();
    lists.retain(|_, l| !l.is_empty());
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use crate::messaging::dispatch::DEFAULT_PRIORITY;
    use serde_json::json;

    #[test]
    fn test_filters_compose_by_priority() {
        let hooks = HookRegistry::new();
        // f2 registered first but runs second.
        hooks.add_filter("title", 10, None, |v, _| {
            Ok(json!(format!("{}!", v.as_str().unwrap_or_default())))
        });
        hooks.add_filter("title", 5, None, |v, _| {
            Ok(json!(v.as_str().unwrap_or_default().to_uppercase()))
        });
        assert_eq!(hooks.apply_filters("title", json!("hello"), &json!(null)), json!("HELLO!"));
        assert_eq!(hooks.apply_filters("unknown", json!(1), &json!(null)), json!(1));
    }

    #[test]
    fn test_failing_filter_passes_value_through() {
        let hooks = HookRegistry::new();
        hooks.add_filter("n", 1, None, |v, _| Ok(json!(v.as_i64().unwrap_or(0) + 1)));
        hooks.add_filter("n", 2, None, |_, _| Err(Error::Internal("nope".to_string())));
        hooks.add_filter("n", 3, None, |v, args| {
            Ok(json!(v.as_i64().unwrap_or(0) * args.as_i64().unwrap_or(1)))
        });
        assert_eq!(hooks.apply_filters("n", json!(1), &json!(10)), json!(20));
    }

    #[tokio::test]
    async fn test_actions_run_in_order() {
        let hooks = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (label, priority) in [("b", 20), ("a", 1), ("c", 20)] {
            let log = log.clone();
            hooks.add_action("save", priority, None, move |_| {
                let log = log.clone();
                async move {
                    tokio::task::yield_now().await;
                    log.lock().unwrap().push(label);
                    Ok(())
                }
            });
        }
        let outcome = hooks.do_action("save", json!({})).await;
        assert_eq!(outcome, ActionOutcome::Executed { handlers: 3, failures: 0 });
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_reentrant_action_refused() {
        let hooks = Arc::new(HookRegistry::new());
        let nested = Arc::new(Mutex::new(None));
        let (h, n) = (hooks.clone(), nested.clone());
        hooks.add_action("loop", DEFAULT_PRIORITY, None, move |_| {
            let (h, n) = (h.clone(), n.clone());
            async move {
                let outcome = h.do_action("loop", json!(null)).await;
                *n.lock().unwrap() = Some(outcome);
                Ok(())
            }
        });

        let outer = hooks.do_action("loop", json!(null)).await;
        assert_eq!(outer, ActionOutcome::Executed { handlers: 1, failures: 0 });
        assert_eq!(*nested.lock().unwrap(), Some(ActionOutcome::Refused));
        // The mark is cleared afterwards.
        assert!(matches!(
            hooks.do_action("loop", json!(null)).await,
            ActionOutcome::Executed { .. }
        ));
    }

    #[tokio::test]
    async fn test_failing_action_does_not_stop_others() {
        let hooks = HookRegistry::new();
        let ran = Arc::new(Mutex::new(0));
        hooks.add_action("x", 1, None, |_| async { Err(Error::Internal("bad".to_string())) });
        let r = ran.clone();
        hooks.add_action("x", 2, None, move |_| {
            let r = r.clone();
            async move {
                *r.lock().unwrap() += 1;
                Ok(())
            }
        });
        let outcome = hooks.do_action("x", json!(null)).await;
        assert_eq!(outcome, ActionOutcome::Executed { handlers: 2, failures: 1 });
        assert_eq!(*ran.lock().unwrap(), 1);
    }

    #[test]
    fn test_remove_hooks() {
        let hooks = HookRegistry::new();
        let id = hooks.add_action("a", 1, Some("p"), |_| async { Ok(()) });
        hooks.add_action("a", 1, Some("q"), |_| async { Ok(()) });
        hooks.add_filter("f", 1, Some("p"), |v, _| Ok(v));
        let fid = hooks.add_filter("g", 1, None, |v, _| Ok(v));

        assert!(hooks.remove_action("a", id));
        assert!(!hooks.remove_action("a", id));
        assert!(hooks.remove_filter("g", fid));
        assert!(!hooks.has_filter("g"));

        hooks.add_action("b", 1, Some("p"), |_| async { Ok(()) });
        assert_eq!(hooks.remove_plugin_hooks("p"), 2);
        assert_eq!(hooks.action_count("a"), 1);
        assert!(!hooks.has_filter("f"));
        assert!(!hooks.has_action("b"));
    }
}
