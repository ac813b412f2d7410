use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/* ============================= THRESHOLDS ============================= */

/// Usage-percentage tiers that drive the evaluator's decision level.
///
/// Comparison is always `>=`, checked highest tier first, so a usage
/// reading equal to a threshold belongs to that tier.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency: Option<u32>,
}

impl Thresholds {
    pub const DEFAULT_WARNING: u32 = 70;
    pub const DEFAULT_CRITICAL: u32 = 80;
    pub const DEFAULT_EXPANSION: u32 = 85;
    pub const DEFAULT_EMERGENCY: u32 = 90;

    pub fn warning(&self) -> u32 {
        self.warning.unwrap_or(Self::DEFAULT_WARNING)
    }

    pub fn critical(&self) -> u32 {
        self.critical.unwrap_or(Self::DEFAULT_CRITICAL)
    }

    pub fn expansion(&self) -> u32 {
        self.expansion.unwrap_or(Self::DEFAULT_EXPANSION)
    }

    pub fn emergency(&self) -> u32 {
        self.emergency.unwrap_or(Self::DEFAULT_EMERGENCY)
    }
}

/* ============================= EXPANSION CONFIG ============================= */

/// Automatic volume-expansion configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Percentage of current capacity to add, in [1, 500]. Default 50.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u32>,

    /// Minimum increment in GiB, regardless of percentage. Default 5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_increment_gi: Option<u32>,

    /// Hard ceiling on the resulting volume size, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_minutes: Option<i64>,
}

impl ExpansionConfig {
    pub const DEFAULT_PERCENTAGE: u32 = 50;
    pub const DEFAULT_MIN_INCREMENT_GI: u32 = 5;

    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    pub fn percentage(&self) -> u32 {
        self.percentage.unwrap_or(Self::DEFAULT_PERCENTAGE)
    }

    pub fn min_increment_gi(&self) -> u32 {
        self.min_increment_gi.unwrap_or(Self::DEFAULT_MIN_INCREMENT_GI)
    }

    pub fn cooldown_minutes(&self) -> i64 {
        self.cooldown_minutes.unwrap_or(0)
    }
}

/* ============================= WAL CLEANUP CONFIG ============================= */

/// WAL-segment cleanup configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WalCleanupConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Number of newest segments to always retain. Default 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain_count: Option<u32>,

    /// Only remove segments the archiver has confirmed as archived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_archived: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_minutes: Option<i64>,
}

impl WalCleanupConfig {
    pub const DEFAULT_RETAIN_COUNT: u32 = 10;

    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    pub fn retain_count(&self) -> u32 {
        self.retain_count.unwrap_or(Self::DEFAULT_RETAIN_COUNT)
    }

    pub fn require_archived(&self) -> bool {
        self.require_archived.unwrap_or(false)
    }

    pub fn cooldown_minutes(&self) -> i64 {
        self.cooldown_minutes.unwrap_or(0)
    }
}

/* ============================= CIRCUIT BREAKER CONFIG ============================= */

/// Scope over which a tripped circuit breaker applies.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum BreakerScope {
    #[default]
    PerCluster,
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_minutes: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<BreakerScope>,
}

impl CircuitBreakerConfig {
    pub const DEFAULT_MAX_FAILURES: u32 = 3;
    pub const DEFAULT_RESET_MINUTES: i64 = 30;

    pub fn max_failures(&self) -> u32 {
        self.max_failures.unwrap_or(Self::DEFAULT_MAX_FAILURES)
    }

    pub fn reset_minutes(&self) -> i64 {
        self.reset_minutes.unwrap_or(Self::DEFAULT_RESET_MINUTES)
    }

    pub fn scope(&self) -> BreakerScope {
        self.scope.clone().unwrap_or_default()
    }
}

/* ============================= ALERTING CONFIG ============================= */

/// A configured alert sink.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum AlertChannel {
    /// Generic alert-bus / Alertmanager-compatible endpoint.
    AlertBus { endpoint: String },
    /// Chat webhook; the URL is read from `secretName`'s `webhook-url` key.
    Chat { secret_name: String },
    /// Paging vendor integration; the routing key is read from `secretName`'s `routing-key` key.
    Paging { secret_name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AlertingConfig {
    #[serde(default)]
    pub channels: Vec<AlertChannel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress_during_remediation: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_minutes: Option<i64>,
}

impl AlertingConfig {
    pub fn suppress_during_remediation(&self) -> bool {
        self.suppress_during_remediation.unwrap_or(true)
    }
}

/* ============================= POLICY SPEC ============================= */

/// StorageGuardPolicy drives automatic disk-pressure remediation for a
/// fleet of managed PostgreSQL clusters.
///
/// Fields left unset fall back to the documented defaults on each
/// nested config type; only `selector` is required.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.pgguard.io",
    version = "v1",
    kind = "StorageGuardPolicy",
    plural = "storageguardpolicies",
    status = "StorageGuardPolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageGuardPolicySpec {
    /// Label selector matched against managed cluster objects.
    pub selector: BTreeMap<String, String>,

    /// Cluster names excluded even when they match `selector`.
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Thresholds>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion: Option<ExpansionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_cleanup: Option<WalCleanupConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerting: Option<AlertingConfig>,

    /// When true, executors compute and record but never mutate external state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

impl StorageGuardPolicySpec {
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds.clone().unwrap_or(Thresholds {
            warning: None,
            critical: None,
            expansion: None,
            emergency: None,
        })
    }

    pub fn expansion(&self) -> ExpansionConfig {
        self.expansion.clone().unwrap_or(ExpansionConfig {
            enabled: None,
            percentage: None,
            min_increment_gi: None,
            max_size: None,
            cooldown_minutes: None,
        })
    }

    pub fn wal_cleanup(&self) -> WalCleanupConfig {
        self.wal_cleanup.clone().unwrap_or(WalCleanupConfig {
            enabled: None,
            retain_count: None,
            require_archived: None,
            cooldown_minutes: None,
        })
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        self.circuit_breaker.clone().unwrap_or(CircuitBreakerConfig {
            max_failures: None,
            reset_minutes: None,
            scope: None,
        })
    }

    pub fn alerting(&self) -> AlertingConfig {
        self.alerting.clone().unwrap_or_default()
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run.unwrap_or(false)
    }
}

/* ============================= POLICY STATUS ============================= */

/// Observed usage digest for a single managed cluster, surfaced on the
/// policy's status subresource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageGuardPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub managed_clusters: Vec<ManagedClusterStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/* ============================= AUDIT EVENT CRD ============================= */

/// The kind of remediation an audit event records.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuditEventType {
    Expansion,
    WalCleanup,
    Alert,
    CircuitBreaker,
}

/// What caused the engine to act.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuditTrigger {
    ThresholdBreach,
    Manual,
    Scheduled,
    Automatic,
}

/// Lifecycle phase of an audit event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum AuditEventPhase {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Per-volume outcome recorded inside an audit event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatusEntry {
    pub volume_name: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuditEventStatus {
    #[serde(default)]
    pub phase: AuditEventPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default)]
    pub per_volume_status: Vec<VolumeStatusEntry>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A single remediation attempt, persisted as an append-only record.
///
/// The engine only ever creates and patches-status these; it never deletes
/// one except via the bounded per-cluster retention sweep in `audit.rs`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.pgguard.io",
    version = "v1",
    kind = "StorageRemediationEvent",
    plural = "storageremediationevents",
    status = "AuditEventStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageRemediationEventSpec {
    pub cluster_name: String,
    pub policy_name: String,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    pub trigger: AuditTrigger,
    pub reason: String,
    #[serde(default)]
    pub type_specific_details: BTreeMap<String, String>,
    #[serde(default)]
    pub dry_run: bool,
}

/* ============================= TESTS ============================= */
