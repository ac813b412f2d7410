use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tokio::time::Instant;

use crate::crd::ExpansionConfig;
use crate::evaluator::expansion_size;
use crate::preflight::{preflight, StorageClassCache};
use crate::types::{VolumeDescriptor, VolumeExpansionResult, VolumeOutcome};

const VERIFY_POLL_INTERVAL: Duration = Duration::from_secs(5);
const FIELD_MANAGER: &str = "pgguard-storage-operator";

/// Input to one expansion-executor call: all volumes belonging to a
/// single cluster, evaluated and (if eligible) expanded in order.
pub struct ExpansionRequest<'a> {
    pub cluster_name: String,
    pub namespace: String,
    pub volumes: Vec<VolumeDescriptor>,
    pub config: &'a ExpansionConfig,
    pub reason: String,
    pub dry_run: bool,
    pub verify_deadline: Duration,
}

/// Aggregate outcome of an expansion-executor call across all of a
/// cluster's volumes.
#[derive(Debug, Clone)]
pub struct ExpansionCallResult {
    pub results: Vec<VolumeExpansionResult>,
    pub success: bool,
    pub total_bytes_added: i64,
}

pub struct ExpansionExecutor<'a> {
    client: Client,
    storage_classes: &'a StorageClassCache,
}

impl<'a> ExpansionExecutor<'a> {
    pub fn new(client: Client, storage_classes: &'a StorageClassCache) -> Self {
        Self { client, storage_classes }
    }

    pub async fn execute(&self, request: ExpansionRequest<'_>) -> ExpansionCallResult {
        let mut results = Vec::with_capacity(request.volumes.len());
        let mut total_bytes_added = 0i64;

        for volume in &request.volumes {
            let outcome = self.expand_one(volume, &request).await;

            match &outcome {
                VolumeOutcome::Success { new_bytes } | VolumeOutcome::PendingResize { new_bytes } => {
                    total_bytes_added += new_bytes - volume.current_bytes;
                }
                _ => {}
            }

            results.push(VolumeExpansionResult { volume_name: volume.name.clone(), outcome });
        }

        let success = !results.iter().any(|r| matches!(r.outcome, VolumeOutcome::Failed { .. }));

        ExpansionCallResult { results, success, total_bytes_added }
    }

    async fn expand_one(&self, volume: &VolumeDescriptor, request: &ExpansionRequest<'_>) -> VolumeOutcome {
        let allows_expansion = match &volume.storage_class_name {
            Some(name) => self.storage_classes.allows_expansion(&self.client, name).await.unwrap_or(false),
            None => false,
        };

        let check = preflight(volume, allows_expansion);
        if !check.can_expand {
            return VolumeOutcome::Skipped { reason: check.summary() };
        }

        let new_bytes = match expansion_size(volume.current_bytes, request.config) {
            Ok(bytes) => bytes,
            Err(err) => return VolumeOutcome::Skipped { reason: err.to_string() },
        };

        if request.dry_run {
            return VolumeOutcome::Success { new_bytes };
        }

        if let Err(err) = self.request_capacity(volume, new_bytes).await {
            return VolumeOutcome::Failed { error: err.to_string() };
        }

        match self.verify(volume, new_bytes, request.verify_deadline).await {
            Ok(false) => VolumeOutcome::Success { new_bytes },
            Ok(true) => VolumeOutcome::PendingResize { new_bytes },
            Err(err) => VolumeOutcome::Failed { error: err.to_string() },
        }
    }

    async fn request_capacity(&self, volume: &VolumeDescriptor, new_bytes: i64) -> anyhow::Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &volume.namespace);
        let patch = json!({
            "spec": {
                "resources": {
                    "requests": { "storage": new_bytes.to_string() }
                }
            }
        });
        api.patch(&volume.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch)).await?;
        Ok(())
    }

    /// Polls the volume object at a fixed interval until its observed
    /// capacity has converged and `FileSystemResizePending` is no longer
    /// set, or the deadline elapses. Returns `Ok(true)` when capacity
    /// converged but the resize condition was still pending at the
    /// deadline — that's reported back, not an error. Only bails with an
    /// error when capacity itself never converges in time.
    async fn verify(&self, volume: &VolumeDescriptor, expected_bytes: i64, deadline: Duration) -> anyhow::Result<bool> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &volume.namespace);
        let started = Instant::now();

        loop {
            let pvc = api.get(&volume.name).await?;
            let status = serde_json::to_value(&pvc)?;

            let capacity = status
                .pointer("/status/capacity/storage")
                .and_then(|v| v.as_str())
                .and_then(|s| crate::discovery::parse_quantity_bytes(s).ok())
                .unwrap_or(0);

            let resize_pending = status
                .pointer("/status/conditions")
                .and_then(|c| c.as_array())
                .map(|conditions| {
                    conditions.iter().any(|c| {
                        c.get("type").and_then(|t| t.as_str()) == Some("FileSystemResizePending")
                            && c.get("status").and_then(|s| s.as_str()) == Some("True")
                    })
                })
                .unwrap_or(false);

            if capacity >= expected_bytes {
                if !resize_pending {
                    return Ok(false);
                }
            } else if started.elapsed() >= deadline {
                anyhow::bail!("timeout");
            }

            if started.elapsed() >= deadline {
                return Ok(true);
            }

            tokio::time::sleep(VERIFY_POLL_INTERVAL.min(deadline)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessMode, VolumePhase};

    fn descriptor(current_bytes: i64) -> VolumeDescriptor {
        VolumeDescriptor {
            name: "data".to_string(),
            namespace: "production".to_string(),
            storage_class_name: Some("fast-ssd".to_string()),
            phase: VolumePhase::Bound,
            access_modes: vec![AccessMode::ReadWriteOnce],
            current_bytes,
        }
    }

    #[test]
    fn test_expansion_call_result_success_requires_no_failures() {
        let results = vec![
            VolumeExpansionResult { volume_name: "a".to_string(), outcome: VolumeOutcome::Success { new_bytes: 10 } },
            VolumeExpansionResult { volume_name: "b".to_string(), outcome: VolumeOutcome::Skipped { reason: "x".to_string() } },
        ];
        let success = !results.iter().any(|r| matches!(r.outcome, VolumeOutcome::Failed { .. }));
        assert!(success);
    }

    #[test]
    fn test_total_bytes_added_excludes_skips_and_failures() {
        let volume = descriptor(10 * (1i64 << 30));
        let outcome = VolumeOutcome::Success { new_bytes: 15 * (1i64 << 30) };
        let delta = match &outcome {
            VolumeOutcome::Success { new_bytes } => new_bytes - volume.current_bytes,
            _ => 0,
        };
        assert_eq!(delta, 5 * (1i64 << 30));
    }

    #[test]
    fn test_pending_resize_is_not_a_failure() {
        let results = vec![
            VolumeExpansionResult { volume_name: "a".to_string(), outcome: VolumeOutcome::PendingResize { new_bytes: 15 * (1i64 << 30) } },
        ];
        let success = !results.iter().any(|r| matches!(r.outcome, VolumeOutcome::Failed { .. }));
        assert!(success, "a converged-but-pending resize must not be reported as a failure");
    }
}
