//! Processable-event-type filter.
//!
//! Browser probes emit many DevTools event types; only a small set feeds
//! rule evaluation. The set is process-wide, read-heavy and rarely mutated
//! (admin API), so it sits behind a read-write lock with lower-cased keys.

use lazy_static::lazy_static;
use std::collections::HashSet;
use std::sync::RwLock;

/// Event types evaluated by default.
pub const DEFAULT_PROCESSABLE_TYPES: [&str; 2] =
    ["Network.requestWillBeSent", "Network.responseReceived"];

pub struct EventFilter {
    types: RwLock<HashSet<String>>,
}

lazy_static! {
    static ref GLOBAL_FILTER: EventFilter = EventFilter::with_defaults();
}

impl EventFilter {
    pub fn new(types: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let normalized = types
            .into_iter()
            .map(|t| t.as_ref().to_lowercase())
            .collect();
        Self {
            types: RwLock::new(normalized),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_PROCESSABLE_TYPES)
    }

    /// The process-wide filter instance.
    pub fn global() -> &'static EventFilter {
        &GLOBAL_FILTER
    }

    pub fn is_processable(&self, event_type: &str) -> bool {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&event_type.to_lowercase())
    }

    pub fn add(&self, event_type: &str) {
        self.types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event_type.to_lowercase());
    }

    pub fn remove(&self, event_type: &str) {
        self.types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&event_type.to_lowercase());
    }

    /// Replace the whole set.
    pub fn set(&self, types: impl IntoIterator<Item = impl AsRef<str>>) {
        let normalized = types
            .into_iter()
            .map(|t| t.as_ref().to_lowercase())
            .collect();
        *self.types.write().unwrap_or_else(|e| e.into_inner()) = normalized;
    }

    pub fn snapshot(&self) -> HashSet<String> {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_matches_network_events_case_insensitively() {
        let filter = EventFilter::with_defaults();
        assert!(filter.is_processable("Network.requestWillBeSent"));
        assert!(filter.is_processable("network.requestwillbesent"));
        assert!(filter.is_processable("NETWORK.RESPONSERECEIVED"));
        assert!(!filter.is_processable("Page.loadEventFired"));
    }

    #[test]
    fn add_and_remove_normalize_case() {
        let filter = EventFilter::with_defaults();
        filter.add("Page.DownloadWillBegin");
        assert!(filter.is_processable("page.downloadwillbegin"));

        filter.remove("PAGE.downloadWillBegin");
        assert!(!filter.is_processable("Page.DownloadWillBegin"));
    }

    #[test]
    fn set_replaces_the_whole_set() {
        let filter = EventFilter::with_defaults();
        filter.set(["Custom.event"]);
        assert!(filter.is_processable("custom.event"));
        assert!(!filter.is_processable("Network.requestWillBeSent"));
        assert_eq!(filter.snapshot().len(), 1);
    }
}
