//! Event history ring buffer.

use crate::core::{now, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Classification of an event name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Namespaced plugin event, `plugin:<id>:<name>`
    Plugin,
    /// Runtime lifecycle event such as `plugin:loaded` or `system:*`
    System,
    /// Anything else
    User,
}

impl EventKind {
    /// Classify an event name, returning the source plugin for plugin events.
    pub fn classify(event: &str) -> (EventKind, Option<String>) {
        if let Some(rest) = event.strip_prefix("plugin:") {
            if let Some((source, name)) = rest.split_once(':') {
                if !source.is_empty() && !name.is_empty() {
                    return (EventKind::Plugin, Some(source.to_string()));
                }
            }
            return (EventKind::System, None);
        }
        if event.starts_with("system:") {
            return (EventKind::System, None);
        }
        (EventKind::User, None)
    }
}

/// One recorded emission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Event name
    pub event: String,
    /// Payload
    pub data: serde_json::Value,
    /// Source plugin parsed from a namespaced name
    pub source: Option<String>,
    /// Classification
    pub kind: EventKind,
    /// Emission time
    pub timestamp: Timestamp,
}

/// Fixed-capacity history; the oldest entry is evicted first.
#[derive(Clone, Debug)]
pub struct EventHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl EventHistory {
    /// Create a history holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Record an emission.
    pub fn record(&mut self, event: &str, data: &serde_json::Value) {
        if self.capacity == 0 {
            return;
        }
        let (kind, source) = EventKind::classify(event);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            event: event.to_string(),
            data: data.clone(),
            source,
            kind,
            timestamp: now(),
        });
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, count: usize) -> Vec<HistoryEntry> {
        self.entries.iter().rev().take(count).cloned().collect()
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify() {
        assert_eq!(
            EventKind::classify("plugin:notes:saved"),
            (EventKind::Plugin, Some("notes".to_string()))
        );
        assert_eq!(EventKind::classify("plugin:loaded"), (EventKind::System, None));
        assert_eq!(EventKind::classify("system:shutdown"), (EventKind::System, None));
        assert_eq!(EventKind::classify("theme-changed"), (EventKind::User, None));
    }

    #[test]
    fn test_evicts_oldest() {
        let mut history = EventHistory::new(3);
        for i in 0..5 {
            history.record(&format!("e{i}"), &json!(i));
        }
        assert_eq!(history.len(), 3);
        let names: Vec<&str> = history.entries().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["e2", "e3", "e4"]);
        assert_eq!(history.recent(1)[0].event, "e4");
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let mut history = EventHistory::new(0);
        history.record("x", &json!(null));
        assert!(history.is_empty());
    }
}
