use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

/// Reverse-DNS prefix every key managed by this store lives under.
pub const PREFIX: &str = "storage.pgguard.io";

const KEY_MANAGED: &str = "managed";
const KEY_PAUSED: &str = "paused";
const KEY_PAUSE_REASON: &str = "pause-reason";
const KEY_PAUSE_UNTIL: &str = "pause-until";
const KEY_POLICY_NAME: &str = "policy-name";
const KEY_POLICY_NAMESPACE: &str = "policy-namespace";
const KEY_LAST_CHECK: &str = "last-check";
const KEY_CURRENT_USAGE_PERCENT: &str = "current-usage-percent";
const KEY_TARGET_SIZE: &str = "target-size";
const KEY_EXPANSION_REQUESTED: &str = "expansion-requested";
const KEY_EXPANSION_REASON: &str = "expansion-reason";
const KEY_LAST_EXPANSION: &str = "last-expansion";
const KEY_WAL_CLEANUP_LAST: &str = "wal-cleanup-last";
const KEY_CIRCUIT_BREAKER_OPEN: &str = "circuit-breaker-open";
const KEY_RESET_CIRCUIT_BREAKER: &str = "reset-circuit-breaker";
const KEY_FAILURE_COUNT: &str = "failure-count";
const KEY_LAST_FAILURE: &str = "last-failure";

/// The string a timestamp getter reports when the stored value is absent
/// or fails to parse, per the annotation-set contract.
pub const UNSET: &str = "unset";

fn full_key(name: &str) -> String {
    format!("{PREFIX}/{name}")
}

/// Typed read/write access over the mutable annotation map living on a
/// managed cluster object. Does no I/O of its own — the caller fetches
/// the object, hands its annotation map to a `AnnotationStore`, mutates
/// through it, and writes the object back.
pub struct AnnotationStore<'a> {
    map: &'a mut BTreeMap<String, String>,
}

impl<'a> AnnotationStore<'a> {
    pub fn new(map: &'a mut BTreeMap<String, String>) -> Self {
        Self { map }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&full_key(name)).map(String::as_str)
    }

    fn set(&mut self, name: &str, value: impl Into<String>) {
        self.map.insert(full_key(name), value.into());
    }

    fn remove(&mut self, name: &str) -> Option<String> {
        self.map.remove(&full_key(name))
    }

    fn get_bool(&self, name: &str) -> bool {
        self.get(name).map(|v| v == "true").unwrap_or(false)
    }

    fn set_bool(&mut self, name: &str, value: bool) {
        self.set(name, if value { "true" } else { "false" });
    }

    /// Returns `None` if the key is absent or fails to parse as RFC3339 —
    /// the "unset" sentinel from the annotation-set contract.
    fn get_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get(name)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    fn set_timestamp(&mut self, name: &str, value: DateTime<Utc>) {
        self.set(name, value.to_rfc3339());
    }

    /* ===== managed / pause ===== */

    pub fn is_managed(&self) -> bool {
        self.get_bool(KEY_MANAGED)
    }

    pub fn set_managed(&mut self, value: bool) {
        self.set_bool(KEY_MANAGED, value);
    }

    pub fn paused(&self) -> bool {
        self.get_bool(KEY_PAUSED)
    }

    pub fn set_paused(&mut self, value: bool) {
        self.set_bool(KEY_PAUSED, value);
    }

    pub fn pause_reason(&self) -> Option<&str> {
        self.get(KEY_PAUSE_REASON)
    }

    pub fn set_pause_reason(&mut self, reason: impl Into<String>) {
        self.set(KEY_PAUSE_REASON, reason);
    }

    pub fn pause_until(&self) -> Option<DateTime<Utc>> {
        self.get_timestamp(KEY_PAUSE_UNTIL)
    }

    pub fn set_pause_until(&mut self, until: DateTime<Utc>) {
        self.set_timestamp(KEY_PAUSE_UNTIL, until);
    }

    /// `true` iff `paused` is set and the pause window has not expired.
    /// `paused=true` with an expired or absent `pause-until` is treated
    /// as not paused.
    pub fn effectively_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused() && self.pause_until().is_some_and(|until| until >= now)
    }

    /* ===== policy back-reference ===== */

    pub fn policy_name(&self) -> Option<&str> {
        self.get(KEY_POLICY_NAME)
    }

    pub fn policy_namespace(&self) -> Option<&str> {
        self.get(KEY_POLICY_NAMESPACE)
    }

    pub fn set_policy_ref(&mut self, name: impl Into<String>, namespace: impl Into<String>) {
        self.set(KEY_POLICY_NAME, name);
        self.set(KEY_POLICY_NAMESPACE, namespace);
    }

    /* ===== measurement digest ===== */

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.get_timestamp(KEY_LAST_CHECK)
    }

    pub fn set_last_check(&mut self, at: DateTime<Utc>) {
        self.set_timestamp(KEY_LAST_CHECK, at);
    }

    pub fn current_usage_percent(&self) -> Option<f64> {
        self.get(KEY_CURRENT_USAGE_PERCENT).and_then(|v| v.parse().ok())
    }

    pub fn set_current_usage_percent(&mut self, pct: f64) {
        self.set(KEY_CURRENT_USAGE_PERCENT, format!("{pct:.2}"));
    }

    pub fn target_size(&self) -> Option<i64> {
        self.get(KEY_TARGET_SIZE).and_then(|v| v.parse().ok())
    }

    pub fn set_target_size(&mut self, bytes: i64) {
        self.set(KEY_TARGET_SIZE, bytes.to_string());
    }

    /* ===== expansion state ===== */

    pub fn expansion_requested(&self) -> Option<DateTime<Utc>> {
        self.get_timestamp(KEY_EXPANSION_REQUESTED)
    }

    pub fn expansion_reason(&self) -> Option<&str> {
        self.get(KEY_EXPANSION_REASON)
    }

    pub fn set_expansion_requested(&mut self, at: DateTime<Utc>, reason: impl Into<String>) {
        self.set_timestamp(KEY_EXPANSION_REQUESTED, at);
        self.set(KEY_EXPANSION_REASON, reason);
    }

    pub fn last_expansion(&self) -> Option<DateTime<Utc>> {
        self.get_timestamp(KEY_LAST_EXPANSION)
    }

    pub fn set_last_expansion(&mut self, at: DateTime<Utc>) {
        self.set_timestamp(KEY_LAST_EXPANSION, at);
    }

    /* ===== WAL cleanup state ===== */

    pub fn wal_cleanup_last(&self) -> Option<DateTime<Utc>> {
        self.get_timestamp(KEY_WAL_CLEANUP_LAST)
    }

    pub fn set_wal_cleanup_last(&mut self, at: DateTime<Utc>) {
        self.set_timestamp(KEY_WAL_CLEANUP_LAST, at);
    }

    /* ===== circuit breaker ===== */

    pub fn circuit_breaker_open(&self) -> bool {
        self.get_bool(KEY_CIRCUIT_BREAKER_OPEN)
    }

    pub fn set_circuit_breaker_open(&mut self, open: bool) {
        self.set_bool(KEY_CIRCUIT_BREAKER_OPEN, open);
    }

    pub fn reset_circuit_breaker_requested(&self) -> bool {
        self.get_bool(KEY_RESET_CIRCUIT_BREAKER)
    }

    /// Consumes a pending manual reset request: if present, clears the
    /// breaker and failure counter and removes the request annotation so
    /// it is not acted on twice. Returns whether a reset was consumed.
    pub fn consume_reset_circuit_breaker(&mut self) -> bool {
        if !self.reset_circuit_breaker_requested() {
            return false;
        }
        self.remove(KEY_RESET_CIRCUIT_BREAKER);
        self.set_circuit_breaker_open(false);
        self.reset_failure_count();
        true
    }

    pub fn failure_count(&self) -> u32 {
        self.get(KEY_FAILURE_COUNT).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.get_timestamp(KEY_LAST_FAILURE)
    }

    /// Atomically bumps the failure counter and stamps `last-failure`.
    /// Does not by itself open the breaker — the caller (C10) compares
    /// the new count against the policy's `maxFailures` and calls
    /// `set_circuit_breaker_open` when it's crossed.
    pub fn increment_failure_count(&mut self, now: DateTime<Utc>) -> u32 {
        let next = self.failure_count().saturating_add(1);
        self.set(KEY_FAILURE_COUNT, next.to_string());
        self.set_timestamp(KEY_LAST_FAILURE, now);
        next
    }

    pub fn reset_failure_count(&mut self) {
        self.remove(KEY_FAILURE_COUNT);
        self.remove(KEY_LAST_FAILURE);
    }

    /* ===== high-level predicates ===== */

    /// Forbids expansion when paused, breaker open, or within cooldown
    /// of the last expansion.
    pub fn can_expand(&self, now: DateTime<Utc>, cooldown_minutes: i64) -> (bool, String) {
        if self.effectively_paused(now) {
            return (false, "cluster is paused".to_string());
        }
        if self.circuit_breaker_open() {
            return (false, "circuit breaker is open".to_string());
        }
        match self.last_expansion() {
            Some(last) if now - last < Duration::minutes(cooldown_minutes) => {
                let remaining = Duration::minutes(cooldown_minutes) - (now - last);
                (false, format!("expansion cooldown active, {}s remaining", remaining.num_seconds().max(0)))
            }
            _ => (true, String::new()),
        }
    }

    /// Same rules as `can_expand` but measured against `wal-cleanup-last`.
    pub fn can_wal_cleanup(&self, now: DateTime<Utc>, cooldown_minutes: i64) -> (bool, String) {
        if self.effectively_paused(now) {
            return (false, "cluster is paused".to_string());
        }
        if self.circuit_breaker_open() {
            return (false, "circuit breaker is open".to_string());
        }
        match self.wal_cleanup_last() {
            Some(last) if now - last < Duration::minutes(cooldown_minutes) => {
                let remaining = Duration::minutes(cooldown_minutes) - (now - last);
                (false, format!("WAL cleanup cooldown active, {}s remaining", remaining.num_seconds().max(0)))
            }
            _ => (true, String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn test_absent_bool_getters_default_false() {
        let mut map = store();
        let s = AnnotationStore::new(&mut map);
        assert!(!s.is_managed());
        assert!(!s.paused());
        assert!(!s.circuit_breaker_open());
        assert!(!s.reset_circuit_breaker_requested());
    }

    #[test]
    fn test_bool_round_trip() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        s.set_managed(true);
        assert!(s.is_managed());
        s.set_managed(false);
        assert!(!s.is_managed());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        let now = Utc::now();
        s.set_last_expansion(now);
        let back = s.last_expansion().unwrap();
        assert_eq!(back.timestamp(), now.timestamp());
    }

    #[test]
    fn test_malformed_timestamp_reports_unset_without_panic() {
        let mut map = store();
        map.insert(format!("{PREFIX}/last-expansion"), "not-a-date".to_string());
        let s = AnnotationStore::new(&mut map);
        assert_eq!(s.last_expansion(), None);
    }

    #[test]
    fn test_effectively_paused_true_within_window() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        let now = Utc::now();
        s.set_paused(true);
        s.set_pause_until(now + Duration::hours(1));
        assert!(s.effectively_paused(now));
    }

    #[test]
    fn test_paused_but_expired_is_not_effectively_paused() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        let now = Utc::now();
        s.set_paused(true);
        s.set_pause_until(now - Duration::hours(1));
        assert!(!s.effectively_paused(now));
    }

    #[test]
    fn test_paused_without_pause_until_is_not_effectively_paused() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        s.set_paused(true);
        assert!(!s.effectively_paused(Utc::now()));
    }

    #[test]
    fn test_increment_and_reset_failure_count() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        let now = Utc::now();
        assert_eq!(s.increment_failure_count(now), 1);
        assert_eq!(s.increment_failure_count(now), 2);
        assert_eq!(s.failure_count(), 2);
        assert!(s.last_failure().is_some());
        s.reset_failure_count();
        assert_eq!(s.failure_count(), 0);
        assert_eq!(s.last_failure(), None);
    }

    #[test]
    fn test_consume_reset_circuit_breaker_clears_state() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        let now = Utc::now();
        s.set_circuit_breaker_open(true);
        s.increment_failure_count(now);
        map.insert(format!("{PREFIX}/reset-circuit-breaker"), "true".to_string());
        let mut s = AnnotationStore::new(&mut map);
        assert!(s.consume_reset_circuit_breaker());
        assert!(!s.circuit_breaker_open());
        assert_eq!(s.failure_count(), 0);
        assert!(!s.reset_circuit_breaker_requested());
        // consuming again is a no-op
        assert!(!s.consume_reset_circuit_breaker());
    }

    #[test]
    fn test_can_expand_forbidden_when_breaker_open() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        s.set_circuit_breaker_open(true);
        let (allowed, reason) = s.can_expand(Utc::now(), 30);
        assert!(!allowed);
        assert!(reason.contains("circuit breaker"));
    }

    #[test]
    fn test_can_expand_forbidden_during_cooldown() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        let now = Utc::now();
        s.set_last_expansion(now - Duration::minutes(5));
        let (allowed, _) = s.can_expand(now, 30);
        assert!(!allowed);
    }

    #[test]
    fn test_can_expand_allowed_once_cooldown_elapses() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        let now = Utc::now();
        s.set_last_expansion(now - Duration::minutes(31));
        let (allowed, _) = s.can_expand(now, 30);
        assert!(allowed);
    }

    #[test]
    fn test_can_expand_monotone_in_elapsed_time() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        let last = Utc::now() - Duration::minutes(40);
        s.set_last_expansion(last);
        let (allowed_early, _) = s.can_expand(last + Duration::minutes(10), 30);
        let (allowed_late, _) = s.can_expand(last + Duration::minutes(60), 30);
        assert!(!allowed_early);
        assert!(allowed_late);
    }

    #[test]
    fn test_can_wal_cleanup_independent_of_expansion_cooldown() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        let now = Utc::now();
        s.set_last_expansion(now);
        let (allowed, _) = s.can_wal_cleanup(now, 30);
        assert!(allowed);
    }

    #[test]
    fn test_usage_percent_round_trip() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        s.set_current_usage_percent(87.456);
        assert_eq!(s.current_usage_percent(), Some(87.46));
    }

    #[test]
    fn test_policy_ref_round_trip() {
        let mut map = store();
        let mut s = AnnotationStore::new(&mut map);
        s.set_policy_ref("baseline", "production");
        assert_eq!(s.policy_name(), Some("baseline"));
        assert_eq!(s.policy_namespace(), Some("production"));
    }
}
