use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::ApiResource;
use kube::discovery::{self, Discovery};
use kube::Client;

use crate::types::{AccessMode, VolumeDescriptor, VolumePhase};

/// Label used to relate pods and volumes to the cluster that owns them.
/// The external orchestrator project sets this; we only read it.
const CLUSTER_NAME_LABEL: &str = "cluster-name";

/// Label marking a pod as the cluster's primary (vs. replica/standby).
const PRIMARY_ROLE_LABEL: &str = "role";
const PRIMARY_ROLE_VALUE: &str = "primary";

/* ============================= BACKUP HEALTH ============================= */

/// Backup health facts extracted from a duck-typed backup-store object.
/// Every field defaults to its zero value when the object omits it, per
/// the "duck-typed orchestrator objects" design note.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupHealth {
    pub configured: bool,
    pub archiving_working: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub first_recoverability: Option<DateTime<Utc>>,
}

impl BackupHealth {
    pub fn age_hours(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_success.map(|t| (now - t).num_seconds() as f64 / 3600.0)
    }

    /// Healthy iff backups are configured and archiving is currently working.
    pub fn healthy(&self) -> bool {
        self.configured && self.archiving_working
    }
}

fn backup_health_from_object(obj: &DynamicObject) -> BackupHealth {
    let data = &obj.data;
    BackupHealth {
        configured: data.pointer("/spec/backup/enabled").and_then(|v| v.as_bool()).unwrap_or(false),
        archiving_working: data
            .pointer("/status/archivingWorking")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        last_success: data
            .pointer("/status/lastSuccessfulBackupTime")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
        first_recoverability: data
            .pointer("/status/firstRecoverabilityTime")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
    }
}

/* ============================= DISCOVERED CLUSTER ============================= */

/// One managed cluster as resolved by discovery: its volumes, pods, the
/// chosen primary pod, and (if a backup-store GVK was configured) its
/// backup health.
#[derive(Debug, Clone)]
pub struct DiscoveredCluster {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub volumes: Vec<VolumeDescriptor>,
    pub pods: Vec<String>,
    pub primary_pod: Option<String>,
    pub backup: Option<BackupHealth>,
}

/// Picks the primary pod: the one labeled `role=primary`, else the
/// alphabetically-first pod name so the choice is at least stable
/// across reconciles when no role label is present.
fn resolve_primary_pod(pods: &[Pod]) -> Option<String> {
    let primary = pods.iter().find(|p| {
        p.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(PRIMARY_ROLE_LABEL))
            .map(|v| v == PRIMARY_ROLE_VALUE)
            .unwrap_or(false)
    });

    primary
        .or_else(|| pods.iter().min_by_key(|p| p.metadata.name.clone().unwrap_or_default()))
        .and_then(|p| p.metadata.name.clone())
}

fn pvc_to_descriptor(pvc: &PersistentVolumeClaim) -> Option<VolumeDescriptor> {
    let name = pvc.metadata.name.clone()?;
    let namespace = pvc.metadata.namespace.clone()?;
    let status = pvc.status.as_ref()?;

    let phase = match status.phase.as_deref() {
        Some("Bound") => VolumePhase::Bound,
        Some("Lost") => VolumePhase::Lost,
        _ => VolumePhase::Pending,
    };

    let access_modes = status
        .access_modes
        .clone()
        .unwrap_or_default()
        .iter()
        .filter_map(|m| match m.as_str() {
            "ReadWriteOnce" => Some(AccessMode::ReadWriteOnce),
            "ReadOnlyMany" => Some(AccessMode::ReadOnlyMany),
            "ReadWriteMany" => Some(AccessMode::ReadWriteMany),
            _ => None,
        })
        .collect();

    let current_bytes = status
        .capacity
        .as_ref()
        .and_then(|c| c.get("storage"))
        .and_then(|q| parse_quantity_bytes(&q.0).ok())
        .unwrap_or(0);

    Some(VolumeDescriptor {
        name,
        namespace,
        storage_class_name: pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone()),
        phase,
        access_modes,
        current_bytes,
    })
}

/// Parses a Kubernetes resource-quantity string (e.g. `"10Gi"`, `"512Mi"`,
/// `"2000000000"`) into a byte count. Supports the binary (`Ki`..`Ei`) and
/// decimal (`k`/`M`/`G`/`T`/`P`/`E`) suffix families; bare numbers are bytes.
pub fn parse_quantity_bytes(quantity: &str) -> anyhow::Result<i64> {
    const BINARY: &[(&str, i64)] =
        &[("Ki", 1i64 << 10), ("Mi", 1i64 << 20), ("Gi", 1i64 << 30), ("Ti", 1i64 << 40), ("Pi", 1i64 << 50), ("Ei", 1i64 << 60)];
    const DECIMAL: &[(&str, i64)] =
        &[("k", 1_000), ("M", 1_000_000), ("G", 1_000_000_000), ("T", 1_000_000_000_000)];

    for (suffix, multiplier) in BINARY {
        if let Some(num) = quantity.strip_suffix(suffix) {
            let value: f64 = num.parse()?;
            return Ok((value * *multiplier as f64) as i64);
        }
    }
    for (suffix, multiplier) in DECIMAL {
        if let Some(num) = quantity.strip_suffix(suffix) {
            let value: f64 = num.parse()?;
            return Ok((value * *multiplier as f64) as i64);
        }
    }
    Ok(quantity.parse()?)
}

fn label_selector_string(selector: &BTreeMap<String, String>) -> String {
    selector.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

/* ============================= DISCOVERER ============================= */

pub struct Discoverer {
    client: Client,
}

impl Discoverer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolves a group/version/kind against the API server's discovery
    /// document. Called once at startup per configured GVK; the result
    /// is reused for every subsequent duck-typed list/get.
    pub async fn resolve_api_resource(&self, group: &str, version: &str, kind: &str) -> anyhow::Result<ApiResource> {
        let discovered = Discovery::new(self.client.clone()).run().await?;
        for group_ in discovered.groups() {
            if group_.name() != group {
                continue;
            }
            if let Some(resources) = group_.resources_by_stable_version(version) {
                for (ar, caps) in resources {
                    if ar.kind == kind && caps.supports_operation(discovery::verbs::LIST) {
                        return Ok(ar);
                    }
                }
            }
        }
        anyhow::bail!("no API resource found for {group}/{version} {kind}")
    }

    /// Enumerates clusters matching `selector`, minus `exclude` by name,
    /// resolving each cluster's volumes, pods, primary pod, and (if
    /// `backup_gvk` is given) backup health.
    pub async fn discover(
        &self,
        cluster_gvk: &ApiResource,
        selector: &BTreeMap<String, String>,
        exclude: &[String],
        backup_gvk: Option<&ApiResource>,
    ) -> anyhow::Result<Vec<DiscoveredCluster>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), cluster_gvk);
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&label_selector_string(selector));
        }
        let clusters = api.list(&lp).await?;

        let mut out = Vec::with_capacity(clusters.items.len());
        for obj in clusters.items {
            let name = obj.metadata.name.clone().unwrap_or_default();
            if exclude.iter().any(|e| e == &name) {
                continue;
            }
            let namespace = obj.metadata.namespace.clone().unwrap_or_default();
            let labels: BTreeMap<String, String> = obj.metadata.labels.clone().unwrap_or_default().into_iter().collect();

            let pods = self.list_pods(&namespace, &name).await?;
            let primary_pod = resolve_primary_pod(&pods);
            let volumes = self.list_volumes(&namespace, &name).await?;

            let backup = match backup_gvk {
                Some(gvk) => self.lookup_backup_health(gvk, &namespace, &name).await.ok(),
                None => None,
            };

            out.push(DiscoveredCluster {
                name,
                namespace,
                labels,
                volumes,
                pods: pods.iter().filter_map(|p| p.metadata.name.clone()).collect(),
                primary_pod,
                backup,
            });
        }

        Ok(out)
    }

    async fn list_pods(&self, namespace: &str, cluster_name: &str) -> anyhow::Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{CLUSTER_NAME_LABEL}={cluster_name}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn list_volumes(&self, namespace: &str, cluster_name: &str) -> anyhow::Result<Vec<VolumeDescriptor>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{CLUSTER_NAME_LABEL}={cluster_name}"));
        let pvcs = api.list(&lp).await?;
        Ok(pvcs.items.iter().filter_map(pvc_to_descriptor).collect())
    }

    async fn lookup_backup_health(
        &self,
        gvk: &ApiResource,
        namespace: &str,
        cluster_name: &str,
    ) -> anyhow::Result<BackupHealth> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, gvk);
        let obj = api.get(cluster_name).await?;
        Ok(backup_health_from_object(&obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::TypeMeta;
    use serde_json::json;

    fn pod_with(name: &str, labels: Vec<(&str, &str)>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_quantity_binary_suffix() {
        assert_eq!(parse_quantity_bytes("10Gi").unwrap(), 10 * (1i64 << 30));
        assert_eq!(parse_quantity_bytes("512Mi").unwrap(), 512 * (1i64 << 20));
    }

    #[test]
    fn test_parse_quantity_decimal_suffix() {
        assert_eq!(parse_quantity_bytes("2G").unwrap(), 2_000_000_000);
    }

    #[test]
    fn test_parse_quantity_bare_number() {
        assert_eq!(parse_quantity_bytes("1048576").unwrap(), 1_048_576);
    }

    #[test]
    fn test_parse_quantity_invalid_errors() {
        assert!(parse_quantity_bytes("not-a-size").is_err());
    }

    #[test]
    fn test_resolve_primary_pod_prefers_role_label() {
        let pods = vec![pod_with("pg-1", vec![("role", "replica")]), pod_with("pg-0", vec![("role", "primary")])];
        assert_eq!(resolve_primary_pod(&pods), Some("pg-0".to_string()));
    }

    #[test]
    fn test_resolve_primary_pod_falls_back_to_first_name() {
        let pods = vec![pod_with("pg-1", vec![]), pod_with("pg-0", vec![])];
        assert_eq!(resolve_primary_pod(&pods), Some("pg-0".to_string()));
    }

    #[test]
    fn test_resolve_primary_pod_empty_is_none() {
        assert_eq!(resolve_primary_pod(&[]), None);
    }

    #[test]
    fn test_label_selector_string_joins_sorted() {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "pgguard".to_string());
        selector.insert("tier".to_string(), "storage".to_string());
        assert_eq!(label_selector_string(&selector), "app=pgguard,tier=storage");
    }

    #[test]
    fn test_backup_health_from_object_extracts_known_fields() {
        let obj = DynamicObject {
            types: Some(TypeMeta { api_version: "backups.example.io/v1".to_string(), kind: "Backup".to_string() }),
            metadata: ObjectMeta::default(),
            data: json!({
                "spec": { "backup": { "enabled": true } },
                "status": {
                    "archivingWorking": true,
                    "lastSuccessfulBackupTime": "2026-07-28T00:00:00Z",
                },
            }),
        };

        let health = backup_health_from_object(&obj);
        assert!(health.configured);
        assert!(health.archiving_working);
        assert!(health.healthy());
        assert!(health.last_success.is_some());
        assert_eq!(health.first_recoverability, None);
    }

    #[test]
    fn test_backup_health_defaults_on_missing_fields() {
        let obj = DynamicObject {
            types: Some(TypeMeta { api_version: "backups.example.io/v1".to_string(), kind: "Backup".to_string() }),
            metadata: ObjectMeta::default(),
            data: json!({}),
        };
        let health = backup_health_from_object(&obj);
        assert_eq!(health, BackupHealth::default());
        assert!(!health.healthy());
    }
}
