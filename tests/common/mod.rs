use std::collections::BTreeMap;

use pgguard_storage_operator::crd::{
    AlertChannel, AlertingConfig, CircuitBreakerConfig, ExpansionConfig, StorageGuardPolicySpec,
    Thresholds, WalCleanupConfig,
};
use pgguard_storage_operator::types::{ClusterMeasurement, VolumeMeasurement};

/// A policy with every remediation knob on, at the spec's documented
/// default thresholds.
pub fn full_policy() -> StorageGuardPolicySpec {
    StorageGuardPolicySpec {
        selector: BTreeMap::from([("app".to_string(), "postgres".to_string())]),
        exclude: vec![],
        thresholds: Some(Thresholds { warning: Some(70), critical: Some(80), expansion: Some(85), emergency: Some(90) }),
        expansion: Some(ExpansionConfig {
            enabled: Some(true),
            percentage: Some(50),
            min_increment_gi: Some(5),
            max_size: None,
            cooldown_minutes: Some(60),
        }),
        wal_cleanup: Some(WalCleanupConfig {
            enabled: Some(true),
            retain_count: Some(10),
            require_archived: Some(true),
            cooldown_minutes: Some(30),
        }),
        circuit_breaker: Some(CircuitBreakerConfig { max_failures: Some(3), reset_minutes: Some(30), scope: None }),
        alerting: Some(AlertingConfig {
            channels: vec![AlertChannel::AlertBus { endpoint: "http://alert-relay.monitoring:9093/api/v1/alerts".to_string() }],
            suppress_during_remediation: Some(true),
            escalation_minutes: None,
        }),
        dry_run: Some(false),
    }
}

/// A cluster measurement for one volume at `usage_pct` of `capacity_bytes`.
pub fn measurement_at(usage_pct: f64, capacity_bytes: i64) -> ClusterMeasurement {
    let used = (capacity_bytes as f64 * usage_pct / 100.0) as i64;
    ClusterMeasurement {
        total_used: used,
        total_capacity: capacity_bytes,
        per_volume: vec![VolumeMeasurement {
            name: "pg-primary-data".to_string(),
            namespace: "production".to_string(),
            pod: "pg-primary-0".to_string(),
            node: "node-1".to_string(),
            used_bytes: used,
            capacity_bytes,
            available_bytes: capacity_bytes - used,
            inodes: Default::default(),
            collected_at: chrono::Utc::now(),
        }],
    }
}
