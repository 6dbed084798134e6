use std::collections::HashMap;

pub const DEFAULT_TYPING_TIMEOUT_MS: i64 = 5_000;

/// Sorted ids of everyone but `self_id` whose record is no older than `timeout_ms`.
pub fn active_typers(
    snapshot: &HashMap<String, i64>,
    self_id: &str,
    now: i64,
    timeout_ms: i64,
) -> Vec<String> {
    let mut ids: Vec<String> = snapshot
        .iter()
        .filter(|(user, ts)| user.as_str() != self_id && now - **ts <= timeout_ms)
        .map(|(user, _)| user.clone())
        .collect();
    ids.sort();
    ids
}

/// Users whose record has outlived the timeout and should be deleted from the store.
pub fn stale_entries(snapshot: &HashMap<String, i64>, now: i64, timeout_ms: i64) -> Vec<String> {
    let mut ids: Vec<String> = snapshot
        .iter()
        .filter(|(_, ts)| now - **ts > timeout_ms)
        .map(|(user, _)| user.clone())
        .collect();
    ids.sort();
    ids
}

/// Typing view of one open chat for one local user.
#[derive(Debug)]
pub struct TypingIndicatorTracker {
    self_id: String,
    timeout_ms: i64,
    last_snapshot: HashMap<String, i64>,
    last_emitted: Option<Vec<String>>,
}

impl TypingIndicatorTracker {
    pub fn new(self_id: &str, timeout_ms: i64) -> Self {
        Self {
            self_id: self_id.to_string(),
            timeout_ms,
            last_snapshot: HashMap::new(),
            last_emitted: None,
        }
    }

    /// Returns the new typer list only when it differs from the last one emitted.
    pub fn on_snapshot(&mut self, snapshot: HashMap<String, i64>, now: i64) -> Option<Vec<String>> {
        self.last_snapshot = snapshot;
        self.refilter(now)
    }

    /// Re-applies the timeout to the last snapshot, so expiry shows without a new one.
    pub fn refilter(&mut self, now: i64) -> Option<Vec<String>> {
        let typers = active_typers(&self.last_snapshot, &self.self_id, now, self.timeout_ms);
        if self.last_emitted.as_ref() == Some(&typers) {
            return None;
        }
        self.last_emitted = Some(typers.clone());
        Some(typers)
    }

    pub fn current(&self) -> &[String] {
        self.last_emitted.as_deref().unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(entries: &[(&str, i64)]) -> HashMap<String, i64> {
        entries.iter().map(|(u, t)| (u.to_string(), *t)).collect()
    }

    #[test]
    fn excludes_self_and_stale_entries() {
        let s = snap(&[("alice", 10_000), ("bob", 9_000), ("carol", 4_999), ("dave", 5_000)]);
        assert_eq!(
            active_typers(&s, "alice", 10_000, DEFAULT_TYPING_TIMEOUT_MS),
            vec!["bob".to_string(), "dave".to_string()]
        );
    }

    #[test]
    fn emits_only_on_change() {
        let mut t = TypingIndicatorTracker::new("alice", DEFAULT_TYPING_TIMEOUT_MS);
        assert_eq!(t.on_snapshot(snap(&[]), 0), Some(vec![]));
        assert_eq!(
            t.on_snapshot(snap(&[("bob", 100)]), 200),
            Some(vec!["bob".to_string()])
        );
        assert_eq!(t.on_snapshot(snap(&[("bob", 300)]), 400), None);
        assert_eq!(t.current(), ["bob".to_string()]);
    }

    #[test]
    fn refilter_expires_without_new_snapshot() {
        let mut t = TypingIndicatorTracker::new("alice", DEFAULT_TYPING_TIMEOUT_MS);
        t.on_snapshot(snap(&[("bob", 1_000)]), 1_000);
        assert_eq!(t.refilter(6_000), None);
        assert_eq!(t.refilter(6_001), Some(vec![]));
        assert!(t.current().is_empty());
    }

    #[test]
    fn stale_entries_lists_only_expired_records() {
        let s = snap(&[("bob", 0), ("carol", 9_000)]);
        assert_eq!(stale_entries(&s, 10_000, 5_000), vec!["bob".to_string()]);
    }
}
