use std::collections::BTreeMap;

use crate::crd::{
    AlertChannel, AlertingConfig, BreakerScope, CircuitBreakerConfig, ExpansionConfig,
    StorageGuardPolicySpec, Thresholds, WalCleanupConfig,
};

/* ============================= TYPES ============================= */

/// A pre-defined policy template with a name and description.
#[derive(Debug, Clone)]
pub struct PolicyBundle {
    pub name: String,
    pub description: String,
    pub spec: StorageGuardPolicySpec,
}

/* ============================= BUNDLES ============================= */

/// Return all built-in policy bundles.
pub fn all_bundles() -> Vec<PolicyBundle> {
    vec![baseline_bundle(), conservative_bundle(), aggressive_bundle()]
}

/// Look up a bundle by name (case-insensitive).
pub fn get_bundle(name: &str) -> Option<PolicyBundle> {
    let lower = name.to_lowercase();
    all_bundles().into_iter().find(|b| b.name == lower)
}

fn baseline_bundle() -> PolicyBundle {
    PolicyBundle {
        name: "baseline".to_string(),
        description: "Default thresholds, auto-expansion on, WAL cleanup off.".to_string(),
        spec: StorageGuardPolicySpec {
            selector: BTreeMap::new(),
            exclude: Vec::new(),
            thresholds: Some(Thresholds { warning: Some(70), critical: Some(80), expansion: Some(85), emergency: Some(90) }),
            expansion: Some(ExpansionConfig {
                enabled: Some(true),
                percentage: Some(50),
                min_increment_gi: Some(5),
                max_size: None,
                cooldown_minutes: Some(60),
            }),
            wal_cleanup: Some(WalCleanupConfig {
                enabled: Some(false),
                retain_count: Some(10),
                require_archived: Some(true),
                cooldown_minutes: Some(30),
            }),
            circuit_breaker: Some(CircuitBreakerConfig {
                max_failures: Some(3),
                reset_minutes: Some(30),
                scope: Some(BreakerScope::PerCluster),
            }),
            alerting: Some(AlertingConfig {
                channels: vec![AlertChannel::AlertBus { endpoint: "http://alert-bus.monitoring.svc:8080/v1/alerts".to_string() }],
                suppress_during_remediation: Some(true),
                escalation_minutes: Some(15),
            }),
            dry_run: Some(false),
        },
    }
}

fn conservative_bundle() -> PolicyBundle {
    PolicyBundle {
        name: "conservative".to_string(),
        description: "Higher thresholds, remediation disabled, alert-only visibility.".to_string(),
        spec: StorageGuardPolicySpec {
            selector: BTreeMap::new(),
            exclude: Vec::new(),
            thresholds: Some(Thresholds { warning: Some(80), critical: Some(90), expansion: Some(95), emergency: Some(98) }),
            expansion: Some(ExpansionConfig {
                enabled: Some(false),
                percentage: Some(25),
                min_increment_gi: Some(5),
                max_size: None,
                cooldown_minutes: Some(120),
            }),
            wal_cleanup: Some(WalCleanupConfig {
                enabled: Some(false),
                retain_count: Some(20),
                require_archived: Some(true),
                cooldown_minutes: Some(60),
            }),
            circuit_breaker: Some(CircuitBreakerConfig {
                max_failures: Some(2),
                reset_minutes: Some(60),
                scope: Some(BreakerScope::PerCluster),
            }),
            alerting: Some(AlertingConfig {
                channels: vec![AlertChannel::Chat { secret_name: "storage-guard-chat-webhook".to_string() }],
                suppress_during_remediation: Some(true),
                escalation_minutes: Some(30),
            }),
            dry_run: Some(true),
        },
    }
}

fn aggressive_bundle() -> PolicyBundle {
    PolicyBundle {
        name: "aggressive".to_string(),
        description: "Lower thresholds, both expansion and WAL cleanup enabled, paged on emergency."
            .to_string(),
        spec: StorageGuardPolicySpec {
            selector: BTreeMap::new(),
            exclude: Vec::new(),
            thresholds: Some(Thresholds { warning: Some(60), critical: Some(75), expansion: Some(82), emergency: Some(90) }),
            expansion: Some(ExpansionConfig {
                enabled: Some(true),
                percentage: Some(75),
                min_increment_gi: Some(10),
                max_size: Some(1024 * 1024 * 1024 * 1024),
                cooldown_minutes: Some(20),
            }),
            wal_cleanup: Some(WalCleanupConfig {
                enabled: Some(true),
                retain_count: Some(5),
                require_archived: Some(true),
                cooldown_minutes: Some(10),
            }),
            circuit_breaker: Some(CircuitBreakerConfig {
                max_failures: Some(5),
                reset_minutes: Some(15),
                scope: Some(BreakerScope::Global),
            }),
            alerting: Some(AlertingConfig {
                channels: vec![
                    AlertChannel::AlertBus { endpoint: "http://alert-bus.monitoring.svc:8080/v1/alerts".to_string() },
                    AlertChannel::Paging { secret_name: "storage-guard-pager-key".to_string() },
                ],
                suppress_during_remediation: Some(false),
                escalation_minutes: Some(5),
            }),
            dry_run: Some(false),
        },
    }
}

/* ============================= TESTS ============================= */
