//! Thread-safe in-memory store of desired ports per container, actual
//! forwards per `(container, port)`, and a bounded recent-history ring.
//!
//! All mutation goes through these methods; callers never see the internal
//! maps. Read operations return deep copies so a caller can't mutate state
//! out from under a concurrent reconcile.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

const HISTORY_MAX_ENTRIES: usize = 100;
const HISTORY_MAX_AGE: Duration = Duration::from_secs(3600);

/// The lifecycle status of one `(container, port)` actual entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Active,
    Conflict,
    Pending,
}

/// A container id truncated to its first 12 characters (or the full id if
/// shorter) for safe inclusion in logs and history reason strings.
pub fn safe_log_id(container: &str) -> &str {
    match container.char_indices().nth(12) {
        Some((idx, _)) => &container[..idx],
        None => container,
    }
}

/// One actual forward, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualEntry {
    pub container: String,
    pub port: u16,
    pub status: Status,
    pub reason: String,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// An append-only record of a former actual entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub container: String,
    pub port: u16,
    pub created_at: SystemTime,
    pub ended_at: SystemTime,
    pub end_reason: String,
    pub final_status: Status,
}

#[derive(Default)]
struct Inner {
    desired: HashMap<String, Vec<u16>>,
    actual: HashMap<(String, u16), ActualEntry>,
    history: Vec<HistoryEntry>,
}

/// The full shared store, guarded by a single reader-writer lock.
#[derive(Default)]
pub struct State {
    inner: RwLock<Inner>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the desired port set for `container`. An empty set is a
    /// legitimate desired state (used by `die`/`stop` handling and
    /// teardown), not a removal of the entry.
    pub fn set_desired(&self, container: impl Into<String>, ports: Vec<u16>) {
        self.inner.write().desired.insert(container.into(), ports);
    }

    /// Snapshot of the desired map as `(container, ports)` pairs.
    pub fn get_desired(&self) -> Vec<(String, Vec<u16>)> {
        self.inner
            .read()
            .desired
            .iter()
            .map(|(c, p)| (c.clone(), p.clone()))
            .collect()
    }

    fn upsert_actual(&self, container: &str, port: u16, status: Status, reason: String) {
        let mut inner = self.inner.write();
        let now = SystemTime::now();
        let key = (container.to_string(), port);
        let created_at = inner
            .actual
            .get(&key)
            .map(|e| e.created_at)
            .unwrap_or(now);
        inner.actual.insert(
            key,
            ActualEntry {
                container: container.to_string(),
                port,
                status,
                reason,
                created_at,
                updated_at: now,
            },
        );
    }

    pub fn mark_active(&self, container: &str, port: u16) {
        self.upsert_actual(container, port, Status::Active, String::new());
    }

    pub fn mark_conflict(&self, container: &str, port: u16, reason: impl Into<String>) {
        self.upsert_actual(container, port, Status::Conflict, reason.into());
    }

    pub fn mark_pending(&self, container: &str, port: u16, reason: impl Into<String>) {
        self.upsert_actual(container, port, Status::Pending, reason.into());
    }

    /// All actual entries across every container.
    pub fn get_actual(&self) -> Vec<ActualEntry> {
        self.inner.read().actual.values().cloned().collect()
    }

    /// Actual entries for a single container.
    pub fn get_by_container(&self, container: &str) -> Vec<ActualEntry> {
        self.inner
            .read()
            .actual
            .values()
            .filter(|e| e.container == container)
            .cloned()
            .collect()
    }

    /// Remove every actual entry for `container`. Used by teardown and by
    /// `die`/`stop` cleanup once the corresponding forwards are cancelled.
    pub fn clear(&self, container: &str) {
        self.inner
            .write()
            .actual
            .retain(|(c, _), _| c != container);
    }

    /// Remove one `(container, port)` entry.
    pub fn clear_port(&self, container: &str, port: u16) {
        self.inner
            .write()
            .actual
            .remove(&(container.to_string(), port));
    }

    /// Mark every actual entry as no longer active, so the next diff treats
    /// every desired port as unowned and re-issues every forward. Called
    /// after the control channel is recreated: the forwards the old master
    /// held didn't survive into the new one, even though these records
    /// still say `active`.
    pub fn invalidate_all_actual(&self) {
        let mut inner = self.inner.write();
        let now = SystemTime::now();
        for entry in inner.actual.values_mut() {
            entry.status = Status::Pending;
            entry.reason = "control channel recreated".to_string();
            entry.updated_at = now;
        }
    }

    /// Every container id that appears in either desired or actual state.
    pub fn all_containers(&self) -> std::collections::HashSet<String> {
        let inner = self.inner.read();
        let mut set: std::collections::HashSet<String> = inner.desired.keys().cloned().collect();
        set.extend(inner.actual.keys().map(|(c, _)| c.clone()));
        set
    }

    /// Append a history entry, then prune entries past the count or age
    /// bound. Always called paired with an actual-entry removal.
    pub fn push_history(&self, entry: HistoryEntry) {
        let mut inner = self.inner.write();
        inner.history.push(entry);
        let cutoff = SystemTime::now()
            .checked_sub(HISTORY_MAX_AGE)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        inner.history.retain(|e| e.ended_at >= cutoff);
        let len = inner.history.len();
        if len > HISTORY_MAX_ENTRIES {
            inner.history.drain(0..len - HISTORY_MAX_ENTRIES);
        }
    }

    /// Snapshot of the history ring, oldest first.
    pub fn get_history(&self) -> Vec<HistoryEntry> {
        self.inner.read().history.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_active_then_conflict_preserves_created_at() {
        let s = State::new();
        s.mark_active("c1", 80);
        let first = s.get_by_container("c1")[0].clone();
        std::thread::sleep(Duration::from_millis(5));
        s.mark_conflict("c1", 80, "taken");
        let second = s.get_by_container("c1")[0].clone();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.status, Status::Conflict);
        assert_eq!(second.reason, "taken");
    }

    #[test]
    fn clear_port_removes_only_that_entry() {
        let s = State::new();
        s.mark_active("c1", 80);
        s.mark_active("c1", 81);
        s.clear_port("c1", 80);
        let remaining = s.get_by_container("c1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].port, 81);
    }

    #[test]
    fn clear_removes_every_entry_for_container() {
        let s = State::new();
        s.mark_active("c1", 80);
        s.mark_active("c1", 81);
        s.mark_active("c2", 82);
        s.clear("c1");
        assert!(s.get_by_container("c1").is_empty());
        assert_eq!(s.get_by_container("c2").len(), 1);
    }

    #[test]
    fn history_bounded_by_count() {
        let s = State::new();
        for i in 0..150u16 {
            s.push_history(HistoryEntry {
                container: format!("c{i}"),
                port: i,
                created_at: SystemTime::now(),
                ended_at: SystemTime::now(),
                end_reason: "container stopped".into(),
                final_status: Status::Active,
            });
        }
        assert!(s.get_history().len() <= HISTORY_MAX_ENTRIES);
    }

    #[test]
    fn invalidate_all_actual_clears_active_status() {
        let s = State::new();
        s.mark_active("c1", 80);
        s.mark_active("c2", 81);
        s.invalidate_all_actual();
        for entry in s.get_actual() {
            assert_ne!(entry.status, Status::Active);
        }
    }

    #[test]
    fn all_containers_unions_desired_and_actual() {
        let s = State::new();
        s.set_desired("c1", vec![80]);
        s.mark_active("c2", 81);
        let all = s.all_containers();
        assert!(all.contains("c1"));
        assert!(all.contains("c2"));
    }
}
