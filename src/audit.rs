use chrono::Utc;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;

use crate::crd::{
    AuditEventPhase, AuditEventStatus, AuditEventType, AuditTrigger, StorageRemediationEvent,
    StorageRemediationEventSpec, VolumeStatusEntry,
};

const FIELD_MANAGER: &str = "pgguard-storage-operator";

/// Bounded per-cluster history: the reconcile loop's retention sweep
/// keeps only the newest `RETENTION_LIMIT` events for a given cluster,
/// deleting the rest. Events are otherwise append-only.
const RETENTION_LIMIT: usize = 50;

/* ============================= TYPES ============================= */

/// Everything needed to open a new audit event.
pub struct AuditEventOpen {
    pub cluster_name: String,
    pub policy_name: String,
    pub namespace: String,
    pub event_type: AuditEventType,
    pub trigger: AuditTrigger,
    pub reason: String,
    pub dry_run: bool,
}

/// Completion details applied when an audit event's remediation finishes.
pub struct AuditEventClose {
    pub phase: AuditEventPhase,
    pub per_volume_status: Vec<VolumeStatusEntry>,
    pub message: String,
}

/* ============================= WRITER ============================= */

/// Creates and updates `StorageRemediationEvent` objects. The engine
/// only ever appends new events and patches their status subresource —
/// it never deletes one except through the bounded retention sweep.
pub struct AuditWriter {
    client: Client,
}

impl AuditWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates a new event in `Pending` phase and returns its generated
    /// name, so the caller can transition it once the remediation runs.
    pub async fn open(&self, namespace: &str, open: AuditEventOpen) -> anyhow::Result<String> {
        let api: Api<StorageRemediationEvent> = Api::namespaced(self.client.clone(), namespace);
        let name = event_name(&open.cluster_name, &open.event_type, Utc::now().timestamp_millis());

        let event = StorageRemediationEvent::new(
            &name,
            StorageRemediationEventSpec {
                cluster_name: open.cluster_name,
                policy_name: open.policy_name,
                event_type: open.event_type,
                trigger: open.trigger,
                reason: open.reason,
                type_specific_details: Default::default(),
                dry_run: open.dry_run,
            },
        );

        api.create(&PostParams::default(), &event).await?;

        let status = AuditEventStatus { phase: AuditEventPhase::Pending, start_time: Some(Utc::now().to_rfc3339()), ..Default::default() };
        self.patch_status(namespace, &name, &status).await?;

        Ok(name)
    }

    /// Marks an event `InProgress`, for the (rare) case remediation spans
    /// multiple reconcile ticks (e.g. expansion verification polling).
    pub async fn mark_in_progress(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        let status = AuditEventStatus { phase: AuditEventPhase::InProgress, ..Default::default() };
        self.patch_status_merge(namespace, name, &status).await
    }

    /// Transitions an event to its terminal phase with completion time,
    /// per-volume outcome, and a human-readable message.
    pub async fn close(&self, namespace: &str, name: &str, close: AuditEventClose) -> anyhow::Result<()> {
        let status = AuditEventStatus {
            phase: close.phase,
            completion_time: Some(Utc::now().to_rfc3339()),
            per_volume_status: close.per_volume_status,
            message: Some(close.message),
            ..Default::default()
        };
        self.patch_status_merge(namespace, name, &status).await
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: &AuditEventStatus) -> anyhow::Result<()> {
        let api: Api<StorageRemediationEvent> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch)).await?;
        Ok(())
    }

    /// Like `patch_status`, but merges only the fields `status` sets
    /// rather than replacing the whole subresource, so fields a prior
    /// phase wrote (e.g. `startTime`) survive a later `InProgress`/close
    /// transition that doesn't repeat them.
    async fn patch_status_merge(&self, namespace: &str, name: &str, status: &AuditEventStatus) -> anyhow::Result<()> {
        let api: Api<StorageRemediationEvent> = Api::namespaced(self.client.clone(), namespace);
        let mut value = serde_json::to_value(status)?;
        if let Some(obj) = value.as_object_mut() {
            obj.retain(|_, v| !v.is_null());
        }
        let patch = json!({ "status": value });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch)).await?;
        Ok(())
    }

    /// Deletes the oldest events for `cluster_name` beyond the newest
    /// `RETENTION_LIMIT`, keyed by creation timestamp. Best-effort: a
    /// single delete failure is logged and does not abort the sweep.
    pub async fn sweep_retention(&self, namespace: &str, cluster_name: &str) -> anyhow::Result<usize> {
        let api: Api<StorageRemediationEvent> = Api::namespaced(self.client.clone(), namespace);
        let events = api.list(&ListParams::default()).await?;

        let mut matching: Vec<_> = events
            .items
            .into_iter()
            .filter(|e| e.spec.cluster_name == cluster_name)
            .collect();

        if matching.len() <= RETENTION_LIMIT {
            return Ok(0);
        }

        matching.sort_by_key(|e| e.metadata.creation_timestamp.clone().map(|t| t.0));
        let excess = matching.len() - RETENTION_LIMIT;

        let mut deleted = 0usize;
        for event in matching.into_iter().take(excess) {
            let Some(name) = event.metadata.name else { continue };
            match api.delete(&name, &Default::default()).await {
                Ok(_) => deleted += 1,
                Err(err) => tracing::warn!(event = %name, error = %err, "audit event retention sweep delete failed"),
            }
        }

        Ok(deleted)
    }
}

fn event_name(cluster_name: &str, event_type: &AuditEventType, timestamp_millis: i64) -> String {
    let kind = match event_type {
        AuditEventType::Expansion => "expansion",
        AuditEventType::WalCleanup => "wal-cleanup",
        AuditEventType::Alert => "alert",
        AuditEventType::CircuitBreaker => "circuit-breaker",
    };
    format!("{cluster_name}-{kind}-{timestamp_millis}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_is_deterministic_and_scoped_to_cluster() {
        let name = event_name("pg-primary", &AuditEventType::Expansion, 1_700_000_000_000);
        assert_eq!(name, "pg-primary-expansion-1700000000000");
    }

    #[test]
    fn test_event_name_varies_by_type() {
        let expansion = event_name("pg-primary", &AuditEventType::Expansion, 1);
        let wal = event_name("pg-primary", &AuditEventType::WalCleanup, 1);
        assert_ne!(expansion, wal);
    }

    #[test]
    fn test_audit_event_close_builds_completed_status() {
        let close = AuditEventClose {
            phase: AuditEventPhase::Completed,
            per_volume_status: vec![VolumeStatusEntry {
                volume_name: "data".to_string(),
                outcome: "success".to_string(),
                message: None,
            }],
            message: "expanded 1 volume".to_string(),
        };
        assert_eq!(close.phase, AuditEventPhase::Completed);
        assert_eq!(close.per_volume_status.len(), 1);
    }
}
