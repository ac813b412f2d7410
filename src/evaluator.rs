use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::crd::{ExpansionConfig, StorageGuardPolicySpec, Thresholds};
use crate::types::{Action, ActionRecommendation, AlertSeverity, ClusterMeasurement, Decision, Level};

/// Pure, deterministic evaluation of one cluster's usage against a policy.
/// No function in this module performs I/O.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    ZeroCapacity,
    AlreadyAtMax,
}

impl std::fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvaluationError::ZeroCapacity => "reported capacity is zero",
            EvaluationError::AlreadyAtMax => "volume already at configured maximum size",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for EvaluationError {}

/// Breaker/pause/cooldown facts supplied by the caller (read from the
/// cluster's annotation store) that this pure module needs but does not
/// fetch itself.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    pub circuit_breaker_open: bool,
    pub breaker_reason: Option<String>,
    pub expand_allowed: bool,
    pub expand_blocked_reason: Option<String>,
    pub wal_cleanup_allowed: bool,
    pub wal_cleanup_blocked_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub decision: Decision,
    pub actions: Vec<ActionRecommendation>,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
}

/// Checked highest tier first; the first matching level wins. Comparison
/// is inclusive (`>=`), so `usage == threshold` belongs to that tier.
pub fn evaluate_thresholds(usage_pct: f64, thresholds: &Thresholds) -> Decision {
    let (level, breached) = if usage_pct >= thresholds.emergency() as f64 {
        (Level::Emergency, thresholds.emergency())
    } else if usage_pct >= thresholds.expansion() as f64 {
        (Level::Expansion, thresholds.expansion())
    } else if usage_pct >= thresholds.critical() as f64 {
        (Level::Critical, thresholds.critical())
    } else if usage_pct >= thresholds.warning() as f64 {
        (Level::Warning, thresholds.warning())
    } else {
        (Level::Normal, 0)
    };

    let message = if level == Level::Normal {
        format!("usage {usage_pct:.2}% is within normal range")
    } else {
        format!("usage {usage_pct:.2}% >= {level} threshold {breached}%")
    };

    Decision {
        level,
        should_alert: level != Level::Normal,
        should_expand: matches!(level, Level::Expansion | Level::Emergency),
        should_cleanup_wal: matches!(level, Level::Emergency),
        message,
    }
}

fn alert_severity_for(level: Level) -> AlertSeverity {
    match level {
        Level::Emergency | Level::Critical => AlertSeverity::Critical,
        _ => AlertSeverity::Warning,
    }
}

/// Ordered (priority ascending) list of recommended actions for a
/// decision. Alerts are always present at the triggered level, even when
/// the corresponding remediation is disabled, so operators retain
/// visibility into degraded-but-unremediated clusters.
pub fn recommend_actions(decision: &Decision, policy: &StorageGuardPolicySpec) -> Vec<ActionRecommendation> {
    let mut actions = Vec::new();
    if decision.level == Level::Normal {
        return actions;
    }

    actions.push(ActionRecommendation {
        action: Action::Alert { severity: alert_severity_for(decision.level) },
        reason: decision.message.clone(),
        priority: 0,
        parameters: BTreeMap::new(),
        blocked: false,
        blocked_reason: None,
    });

    let expansion = policy.expansion();
    let wal_cleanup = policy.wal_cleanup();

    match decision.level {
        Level::Emergency => {
            if wal_cleanup.enabled() {
                actions.push(ActionRecommendation {
                    action: Action::WalCleanup,
                    reason: decision.message.clone(),
                    priority: 1,
                    parameters: BTreeMap::new(),
                    blocked: false,
                    blocked_reason: None,
                });
            }
            if expansion.enabled() {
                actions.push(ActionRecommendation {
                    action: Action::Expand,
                    reason: decision.message.clone(),
                    priority: 2,
                    parameters: BTreeMap::new(),
                    blocked: false,
                    blocked_reason: None,
                });
            }
        }
        Level::Expansion => {
            if expansion.enabled() {
                actions.push(ActionRecommendation {
                    action: Action::Expand,
                    reason: decision.message.clone(),
                    priority: 1,
                    parameters: BTreeMap::new(),
                    blocked: false,
                    blocked_reason: None,
                });
            }
        }
        Level::Critical | Level::Warning | Level::Normal => {}
    }

    actions.sort_by_key(|a| a.priority);
    actions
}

/// `inc = current * percentage / 100`, raised to `minIncrementGi` if
/// smaller, capped at `maxSize` if set.
pub fn expansion_size(current_bytes: i64, config: &ExpansionConfig) -> Result<i64, EvaluationError> {
    if let Some(max) = config.max_size {
        if current_bytes >= max {
            return Err(EvaluationError::AlreadyAtMax);
        }
    }

    let mut inc = (current_bytes as i128 * config.percentage() as i128 / 100) as i64;
    let min_increment = config.min_increment_gi() as i64 * (1i64 << 30);
    if inc < min_increment {
        inc = min_increment;
    }

    let mut new_bytes = current_bytes + inc;
    if let Some(max) = config.max_size {
        if new_bytes > max {
            new_bytes = max;
        }
    }

    Ok(new_bytes)
}

/// `now >= lastAt + minutes` => allowed. Absent `lastAt` => allowed.
pub fn cooldown(last_at: Option<DateTime<Utc>>, minutes: i64, now: DateTime<Utc>) -> (bool, i64) {
    match last_at {
        None => (true, 0),
        Some(last) => {
            let ready_at = last + chrono::Duration::minutes(minutes);
            if now >= ready_at {
                (true, 0)
            } else {
                (false, (ready_at - now).num_seconds().max(0))
            }
        }
    }
}

/// Combines threshold evaluation, action recommendation, and
/// breaker/cooldown gating into one result. Breaker-open short-circuits
/// to a fully blocked result with no actions (per §4.2); otherwise each
/// emitted action is individually tagged blocked when its own cooldown
/// forbids it, so the caller can still report a blocked-action message.
pub fn full_evaluation(
    measurement: &ClusterMeasurement,
    policy: &StorageGuardPolicySpec,
    context: &EvaluationContext,
) -> Result<EvaluationResult, EvaluationError> {
    let usage_pct = measurement.usage_percent().ok_or(EvaluationError::ZeroCapacity)?;
    let decision = evaluate_thresholds(usage_pct, &policy.thresholds());

    if context.circuit_breaker_open {
        return Ok(EvaluationResult {
            decision,
            actions: Vec::new(),
            blocked: true,
            blocked_reason: context.breaker_reason.clone().or(Some("circuit breaker is open".to_string())),
        });
    }

    let mut actions = recommend_actions(&decision, policy);
    for action in &mut actions {
        match &action.action {
            Action::Expand if !context.expand_allowed => {
                action.blocked = true;
                action.blocked_reason = context.expand_blocked_reason.clone();
            }
            Action::WalCleanup if !context.wal_cleanup_allowed => {
                action.blocked = true;
                action.blocked_reason = context.wal_cleanup_blocked_reason.clone();
            }
            _ => {}
        }
    }

    Ok(EvaluationResult { decision, actions, blocked: false, blocked_reason: None })
}

/// Any recommended, unblocked, non-`none` action remains.
pub fn has_pending_actions(actions: &[ActionRecommendation]) -> bool {
    actions.iter().any(|a| !a.is_none() && !a.blocked)
}

/// Lowest-priority unblocked action; ties favor the first one inserted.
pub fn highest_priority_action(actions: &[ActionRecommendation]) -> Option<&ActionRecommendation> {
    actions.iter().filter(|a| !a.is_none() && !a.blocked).min_by_key(|a| a.priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CircuitBreakerConfig, WalCleanupConfig};
    use std::collections::BTreeMap as Map;

    fn default_thresholds() -> Thresholds {
        Thresholds { warning: None, critical: None, expansion: None, emergency: None }
    }

    fn policy_with(expansion_enabled: bool, wal_enabled: bool) -> StorageGuardPolicySpec {
        StorageGuardPolicySpec {
            selector: Map::new(),
            exclude: vec![],
            thresholds: None,
            expansion: Some(ExpansionConfig {
                enabled: Some(expansion_enabled),
                percentage: Some(50),
                min_increment_gi: Some(5),
                max_size: None,
                cooldown_minutes: None,
            }),
            wal_cleanup: Some(WalCleanupConfig {
                enabled: Some(wal_enabled),
                retain_count: Some(10),
                require_archived: Some(true),
                cooldown_minutes: None,
            }),
            circuit_breaker: Some(CircuitBreakerConfig { max_failures: None, reset_minutes: None, scope: None }),
            alerting: None,
            dry_run: Some(false),
        }
    }

    fn measurement(usage_pct: f64) -> ClusterMeasurement {
        ClusterMeasurement {
            total_used: (usage_pct * 1_000.0) as i64,
            total_capacity: 100_000,
            per_volume: vec![],
        }
    }

    #[test]
    fn test_level_monotone_non_decreasing_in_usage() {
        let t = default_thresholds();
        let levels: Vec<Level> = [0.0, 50.0, 70.0, 80.0, 85.0, 90.0, 99.0]
            .iter()
            .map(|pct| evaluate_thresholds(*pct, &t).level)
            .collect();
        for pair in levels.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn test_usage_equal_to_warning_triggers_warning() {
        let t = default_thresholds();
        let decision = evaluate_thresholds(70.0, &t);
        assert_eq!(decision.level, Level::Warning);
    }

    #[test]
    fn test_scenario_warning_alert() {
        let policy = policy_with(true, false);
        let decision = evaluate_thresholds(75.0, &policy.thresholds());
        assert_eq!(decision.level, Level::Warning);
        let actions = recommend_actions(&decision, &policy);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0].action, Action::Alert { severity: AlertSeverity::Warning }));
    }

    #[test]
    fn test_scenario_auto_expansion_size() {
        let expansion = ExpansionConfig {
            enabled: Some(true),
            percentage: Some(50),
            min_increment_gi: Some(5),
            max_size: None,
            cooldown_minutes: None,
        };
        let ten_gib = 10i64 << 30;
        let new_size = expansion_size(ten_gib, &expansion).unwrap();
        assert_eq!(new_size, 15i64 << 30);
    }

    #[test]
    fn test_expansion_size_saturates_at_max() {
        let expansion = ExpansionConfig {
            enabled: Some(true),
            percentage: Some(90),
            min_increment_gi: Some(5),
            max_size: Some(12i64 << 30),
            cooldown_minutes: None,
        };
        let ten_gib = 10i64 << 30;
        let new_size = expansion_size(ten_gib, &expansion).unwrap();
        assert_eq!(new_size, 12i64 << 30);
    }

    #[test]
    fn test_expansion_size_already_at_max_errors() {
        let expansion = ExpansionConfig {
            enabled: Some(true),
            percentage: Some(50),
            min_increment_gi: Some(5),
            max_size: Some(10i64 << 30),
            cooldown_minutes: None,
        };
        let ten_gib = 10i64 << 30;
        assert_eq!(expansion_size(ten_gib, &expansion), Err(EvaluationError::AlreadyAtMax));
    }

    #[test]
    fn test_scenario_emergency_combination_ordering() {
        let policy = policy_with(true, true);
        let decision = evaluate_thresholds(92.0, &policy.thresholds());
        assert_eq!(decision.level, Level::Emergency);
        let actions = recommend_actions(&decision, &policy);
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0].action, Action::Alert { .. }));
        assert_eq!(actions[0].priority, 0);
        assert!(matches!(actions[1].action, Action::WalCleanup));
        assert_eq!(actions[1].priority, 1);
        assert!(matches!(actions[2].action, Action::Expand));
        assert_eq!(actions[2].priority, 2);

        let highest = highest_priority_action(&actions).unwrap();
        assert!(matches!(highest.action, Action::Alert { .. }));
    }

    #[test]
    fn test_alerts_present_even_when_remediation_disabled() {
        let policy = policy_with(false, false);
        let decision = evaluate_thresholds(92.0, &policy.thresholds());
        let actions = recommend_actions(&decision, &policy);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0].action, Action::Alert { .. }));
    }

    #[test]
    fn test_zero_capacity_is_evaluation_error() {
        let measurement = ClusterMeasurement { total_used: 0, total_capacity: 0, per_volume: vec![] };
        let policy = policy_with(true, true);
        let ctx = EvaluationContext::default();
        assert_eq!(full_evaluation(&measurement, &policy, &ctx), Err(EvaluationError::ZeroCapacity));
    }

    #[test]
    fn test_scenario_breaker_open_blocks_all_actions() {
        let policy = policy_with(true, true);
        let ctx = EvaluationContext {
            circuit_breaker_open: true,
            breaker_reason: Some("too many failures".to_string()),
            ..Default::default()
        };
        let result = full_evaluation(&measurement(92.0), &policy, &ctx).unwrap();
        assert!(result.blocked);
        assert!(result.actions.is_empty());
    }

    #[test]
    fn test_blocked_action_still_reported_not_executed() {
        let policy = policy_with(true, false);
        let ctx = EvaluationContext {
            expand_blocked_reason: Some("expansion cooldown active".to_string()),
            expand_allowed: false,
            wal_cleanup_allowed: true,
            ..Default::default()
        };
        let result = full_evaluation(&measurement(87.0), &policy, &ctx).unwrap();
        assert!(!result.blocked);
        assert!(!has_pending_actions(&result.actions) || result.actions.iter().any(|a| matches!(a.action, Action::Alert { .. }) && !a.blocked));
        let expand = result.actions.iter().find(|a| matches!(a.action, Action::Expand)).unwrap();
        assert!(expand.blocked);
        assert!(highest_priority_action(&result.actions).is_some());
        // the highest-priority unblocked action is the alert, not the blocked expand
        assert!(matches!(highest_priority_action(&result.actions).unwrap().action, Action::Alert { .. }));
    }

    #[test]
    fn test_cooldown_absent_last_at_is_allowed() {
        assert_eq!(cooldown(None, 30, Utc::now()), (true, 0));
    }

    #[test]
    fn test_cooldown_monotone_in_elapsed() {
        let last = Utc::now();
        let (allowed_early, _) = cooldown(Some(last), 30, last + chrono::Duration::minutes(10));
        let (allowed_late, _) = cooldown(Some(last), 30, last + chrono::Duration::minutes(31));
        assert!(!allowed_early);
        assert!(allowed_late);
    }

    #[test]
    fn test_has_pending_actions_skips_none_and_blocked() {
        let actions = vec![
            ActionRecommendation { action: Action::None, reason: String::new(), priority: 0, parameters: Map::new(), blocked: false, blocked_reason: None },
            ActionRecommendation { action: Action::Expand, reason: String::new(), priority: 1, parameters: Map::new(), blocked: true, blocked_reason: None },
        ];
        assert!(!has_pending_actions(&actions));
    }

    #[test]
    fn test_highest_priority_action_tie_break_favors_first() {
        let actions = vec![
            ActionRecommendation { action: Action::Alert { severity: AlertSeverity::Warning }, reason: "a".into(), priority: 0, parameters: Map::new(), blocked: false, blocked_reason: None },
            ActionRecommendation { action: Action::Expand, reason: "b".into(), priority: 0, parameters: Map::new(), blocked: false, blocked_reason: None },
        ];
        let winner = highest_priority_action(&actions).unwrap();
        assert_eq!(winner.reason, "a");
    }
}
