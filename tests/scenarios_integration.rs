mod common;

use chrono::Utc;
use common::{full_policy, measurement_at};
use pgguard_storage_operator::annotations::AnnotationStore;
use pgguard_storage_operator::evaluator::{self, EvaluationContext};
use pgguard_storage_operator::types::{Action, AlertSeverity, Level};

// ══════════════════════════════════════════════════════════════════
// End-to-end decision-pipeline tests (no cluster required).
//
// Exercises sample → evaluate → select-action the same way C10 does
// it per cluster, using the annotation store to derive the
// breaker/cooldown facts the evaluator needs.
// ══════════════════════════════════════════════════════════════════

const TEN_GI: i64 = 10i64 << 30;

fn eval_context_from(store: &AnnotationStore<'_>, now: chrono::DateTime<Utc>, policy: &pgguard_storage_operator::crd::StorageGuardPolicySpec) -> EvaluationContext {
    let (expand_allowed, expand_reason) = store.can_expand(now, policy.expansion().cooldown_minutes());
    let (wal_cleanup_allowed, wal_cleanup_reason) = store.can_wal_cleanup(now, policy.wal_cleanup().cooldown_minutes());
    EvaluationContext {
        circuit_breaker_open: store.circuit_breaker_open(),
        breaker_reason: Some("circuit breaker is open".to_string()),
        expand_allowed,
        expand_blocked_reason: if expand_reason.is_empty() { None } else { Some(expand_reason) },
        wal_cleanup_allowed,
        wal_cleanup_blocked_reason: if wal_cleanup_reason.is_empty() { None } else { Some(wal_cleanup_reason) },
    }
}

#[test]
fn test_scenario_warning_alert_only() {
    let policy = full_policy();
    let measurement = measurement_at(75.0, TEN_GI);
    let mut map = Default::default();
    let store = AnnotationStore::new(&mut map);
    let ctx = eval_context_from(&store, Utc::now(), &policy);

    let result = evaluator::full_evaluation(&measurement, &policy, &ctx).unwrap();

    assert_eq!(result.decision.level, Level::Warning);
    assert!(result.decision.should_alert);
    assert_eq!(result.actions.len(), 1);
    assert!(matches!(result.actions[0].action, Action::Alert { severity: AlertSeverity::Warning }));
}

#[test]
fn test_scenario_auto_expansion_triggered() {
    let policy = full_policy();
    let measurement = measurement_at(87.0, TEN_GI);
    let mut map = Default::default();
    let store = AnnotationStore::new(&mut map);
    let ctx = eval_context_from(&store, Utc::now(), &policy);

    let result = evaluator::full_evaluation(&measurement, &policy, &ctx).unwrap();

    assert_eq!(result.decision.level, Level::Expansion);
    let expand = result.actions.iter().find(|a| matches!(a.action, Action::Expand)).unwrap();
    assert!(!expand.blocked);

    let new_size = evaluator::expansion_size(TEN_GI, &policy.expansion()).unwrap();
    assert!(new_size > TEN_GI);
}

#[test]
fn test_scenario_emergency_combination_expand_and_wal_cleanup() {
    let policy = full_policy();
    let measurement = measurement_at(93.0, TEN_GI);
    let mut map = Default::default();
    let store = AnnotationStore::new(&mut map);
    let ctx = eval_context_from(&store, Utc::now(), &policy);

    let result = evaluator::full_evaluation(&measurement, &policy, &ctx).unwrap();

    assert_eq!(result.decision.level, Level::Emergency);
    let kinds: Vec<_> = result.actions.iter().map(|a| &a.action).collect();
    assert!(kinds.iter().any(|a| matches!(a, Action::Alert { .. })));
    assert!(kinds.iter().any(|a| matches!(a, Action::WalCleanup)));
    assert!(kinds.iter().any(|a| matches!(a, Action::Expand)));

    // priority ordering: alert, then wal-cleanup, then expand
    assert_eq!(result.actions[0].priority, 0);
    assert!(result.actions[1].priority < result.actions[2].priority);
}

#[test]
fn test_scenario_circuit_breaker_trips_after_repeated_failures() {
    let breaker = full_policy().circuit_breaker();
    let mut map = Default::default();
    let mut store = AnnotationStore::new(&mut map);
    let now = Utc::now();

    let mut opened = false;
    for _ in 0..breaker.max_failures() {
        let failures = store.increment_failure_count(now);
        if failures >= breaker.max_failures() {
            store.set_circuit_breaker_open(true);
            opened = true;
        }
    }

    assert!(opened);
    assert!(store.circuit_breaker_open());

    // subsequent evaluation is fully blocked, even at emergency usage
    let policy = full_policy();
    let measurement = measurement_at(95.0, TEN_GI);
    let ctx = eval_context_from(&store, now, &policy);
    let result = evaluator::full_evaluation(&measurement, &policy, &ctx).unwrap();
    assert!(result.blocked);
    assert!(result.actions.is_empty());
}

#[test]
fn test_scenario_manual_circuit_breaker_reset_restores_remediation() {
    let mut map = Default::default();
    let mut store = AnnotationStore::new(&mut map);
    let now = Utc::now();

    store.set_circuit_breaker_open(true);
    store.increment_failure_count(now);
    store.increment_failure_count(now);

    // operator annotates the managed cluster to request a reset
    map.insert("storage.pgguard.io/reset-circuit-breaker".to_string(), "true".to_string());
    let mut store = AnnotationStore::new(&mut map);
    assert!(store.consume_reset_circuit_breaker());
    assert!(!store.circuit_breaker_open());
    assert_eq!(store.failure_count(), 0);

    let policy = full_policy();
    let measurement = measurement_at(88.0, TEN_GI);
    let ctx = eval_context_from(&store, now, &policy);
    let result = evaluator::full_evaluation(&measurement, &policy, &ctx).unwrap();
    assert!(!result.blocked);
    assert!(result.actions.iter().any(|a| matches!(a.action, Action::Expand) && !a.blocked));
}

#[test]
fn test_scenario_dry_run_still_evaluates_but_policy_flags_no_write() {
    let mut policy = full_policy();
    policy.dry_run = Some(true);
    assert!(policy.dry_run());

    let measurement = measurement_at(87.0, TEN_GI);
    let mut map = Default::default();
    let store = AnnotationStore::new(&mut map);
    let ctx = eval_context_from(&store, Utc::now(), &policy);

    // dry_run only gates the executor's write path; the evaluator itself
    // still recommends expansion exactly as it would for a live run.
    let result = evaluator::full_evaluation(&measurement, &policy, &ctx).unwrap();
    assert!(result.actions.iter().any(|a| matches!(a.action, Action::Expand) && !a.blocked));
}
