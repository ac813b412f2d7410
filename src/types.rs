use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/* ============================= MEASUREMENTS ============================= */

/// Inode counts for a single volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InodeCounts {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// A single per-volume usage sample, as produced by the metrics sampler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeMeasurement {
    pub name: String,
    pub namespace: String,
    pub pod: String,
    pub node: String,
    pub used_bytes: i64,
    pub capacity_bytes: i64,
    pub available_bytes: i64,
    pub inodes: InodeCounts,
    pub collected_at: DateTime<Utc>,
}

/// Cluster-level aggregate across all of a cluster's volumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClusterMeasurement {
    pub total_used: i64,
    pub total_capacity: i64,
    pub per_volume: Vec<VolumeMeasurement>,
}

impl ClusterMeasurement {
    /// Usage percentage, or `None` when total capacity is zero (the caller
    /// must treat that as a fatal, skip-the-cluster condition — see
    /// evaluator::EvaluationError::ZeroCapacity).
    pub fn usage_percent(&self) -> Option<f64> {
        if self.total_capacity <= 0 {
            return None;
        }
        Some(self.total_used as f64 / self.total_capacity as f64 * 100.0)
    }
}

/* ============================= DECISION ============================= */

/// Threshold tier reached by a usage reading, ordered low to high.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Normal,
    Warning,
    Critical,
    Expansion,
    Emergency,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Normal => "normal",
            Level::Warning => "warning",
            Level::Critical => "critical",
            Level::Expansion => "expansion",
            Level::Emergency => "emergency",
        };
        write!(f, "{s}")
    }
}

/// The deterministic output of `evaluator::evaluate_thresholds`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub level: Level,
    pub should_alert: bool,
    pub should_expand: bool,
    pub should_cleanup_wal: bool,
    pub message: String,
}

/* ============================= ACTION RECOMMENDATION ============================= */

/// Severity carried on an alert recommendation/dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
            AlertSeverity::Emergency => "emergency",
        };
        write!(f, "{s}")
    }
}

/// A kind of remediation action the evaluator may recommend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Action {
    None,
    Alert { severity: AlertSeverity },
    Expand,
    WalCleanup,
}

/// One recommended action, with its dispatch priority (lower runs first)
/// and whether a cooldown/suppression/breaker currently forbids running it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecommendation {
    pub action: Action,
    pub reason: String,
    pub priority: i32,
    pub parameters: BTreeMap<String, String>,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
}

impl ActionRecommendation {
    pub fn is_none(&self) -> bool {
        matches!(self.action, Action::None)
    }
}

/* ============================= VOLUME DESCRIPTOR / RESULTS ============================= */

/// An access mode as declared on a volume claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

/// Bind phase of a volume claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumePhase {
    Pending,
    Bound,
    Lost,
}

/// Everything the preflight and expansion executor need about one volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeDescriptor {
    pub name: String,
    pub namespace: String,
    pub storage_class_name: Option<String>,
    pub phase: VolumePhase,
    pub access_modes: Vec<AccessMode>,
    pub current_bytes: i64,
}

/// Outcome of one volume within a single expansion-executor call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum VolumeOutcome {
    Success { new_bytes: i64 },
    /// Capacity converged to the requested size, but the filesystem
    /// resize was still pending when the verify deadline elapsed. Not
    /// an error: the resize is expected to finish on its own.
    PendingResize { new_bytes: i64 },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeExpansionResult {
    pub volume_name: String,
    pub outcome: VolumeOutcome,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_percent_zero_capacity_is_none() {
        let m = ClusterMeasurement { total_used: 0, total_capacity: 0, per_volume: vec![] };
        assert_eq!(m.usage_percent(), None);
    }

    #[test]
    fn test_usage_percent_computes_correctly() {
        let m = ClusterMeasurement { total_used: 87, total_capacity: 100, per_volume: vec![] };
        assert_eq!(m.usage_percent(), Some(87.0));
    }

    #[test]
    fn test_level_ordering_is_monotone() {
        assert!(Level::Normal < Level::Warning);
        assert!(Level::Warning < Level::Critical);
        assert!(Level::Critical < Level::Expansion);
        assert!(Level::Expansion < Level::Emergency);
    }

    #[test]
    fn test_action_recommendation_is_none_helper() {
        let rec = ActionRecommendation {
            action: Action::None,
            reason: String::new(),
            priority: 0,
            parameters: BTreeMap::new(),
            blocked: false,
            blocked_reason: None,
        };
        assert!(rec.is_none());
    }

    #[test]
    fn test_level_display() {
        assert_eq!(Level::Emergency.to_string(), "emergency");
        assert_eq!(AlertSeverity::Critical.to_string(), "critical");
    }
}
