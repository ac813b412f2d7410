use std::collections::HashMap;

use kube::api::Api;
use kube::Client;
use k8s_openapi::api::storage::v1::StorageClass;
use tokio::sync::RwLock;

use crate::types::{AccessMode, VolumeDescriptor, VolumePhase};

/* ============================= TYPES ============================= */

/// Outcome of a single ordered preflight check.
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Result of running all preflight checks for one volume.
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightResult {
    pub can_expand: bool,
    pub checks: Vec<PreflightCheck>,
}

impl PreflightResult {
    /// Human-readable summary for emission into audit-event messages.
    pub fn summary(&self) -> String {
        let total = self.checks.len();
        let failed = self.checks.iter().filter(|c| !c.passed).count();
        if failed == 0 {
            format!("passed all {total} checks")
        } else {
            format!("failed {failed} of {total} checks")
        }
    }
}

/* ============================= STORAGE CLASS CACHE ============================= */

/// Cached per-storage-class `allowVolumeExpansion` lookups. Process-wide
/// and shared across reconciles; reads vastly outnumber the occasional
/// fetch-and-insert, so a reader-writer lock rather than a plain mutex.
/// Invalidation is manual and per-name — C10 calls `invalidate` on
/// storage-class change events; nothing else ever evicts an entry.
/// Not durable: a restart drops it and costs one extra fetch per class.
#[derive(Default)]
pub struct StorageClassCache {
    entries: RwLock<HashMap<String, bool>>,
}

impl StorageClassCache {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    pub async fn invalidate(&self, name: &str) {
        self.entries.write().await.remove(name);
    }

    /// Returns whether `name` allows online volume expansion, fetching
    /// and caching the storage class on a miss. Repeated calls within a
    /// pass issue exactly one fetch per name.
    pub async fn allows_expansion(&self, client: &Client, name: &str) -> anyhow::Result<bool> {
        if let Some(cached) = self.entries.read().await.get(name) {
            return Ok(*cached);
        }

        let api: Api<StorageClass> = Api::all(client.clone());
        let sc = api.get(name).await?;
        let allowed = sc.allow_volume_expansion.unwrap_or(false);

        self.entries.write().await.insert(name.to_string(), allowed);

        Ok(allowed)
    }
}

/* ============================= PREFLIGHT ============================= */

/// Runs the three ordered checks against a volume descriptor, given a
/// pre-resolved `allows_expansion` fact for its storage class (the
/// caller is expected to have consulted `StorageClassCache` for this,
/// since the cache needs a live client and this function stays pure).
pub fn preflight(volume: &VolumeDescriptor, storage_class_allows_expansion: bool) -> PreflightResult {
    let mut checks = Vec::with_capacity(3);

    let sc_name = volume.storage_class_name.as_deref();
    let sc_check = match sc_name {
        None => PreflightCheck {
            name: "storage-class-expandable",
            passed: false,
            detail: "volume has no storageClassName set".to_string(),
        },
        Some(name) if storage_class_allows_expansion => PreflightCheck {
            name: "storage-class-expandable",
            passed: true,
            detail: format!("storage class '{name}' allows online expansion"),
        },
        Some(name) => PreflightCheck {
            name: "storage-class-expandable",
            passed: false,
            detail: format!("storage class '{name}' does not allow online expansion"),
        },
    };
    checks.push(sc_check);

    checks.push(PreflightCheck {
        name: "bound",
        passed: volume.phase == VolumePhase::Bound,
        detail: format!("volume phase is {:?}", volume.phase),
    });

    let supported_mode = volume
        .access_modes
        .iter()
        .any(|m| matches!(m, AccessMode::ReadWriteOnce | AccessMode::ReadWriteMany));
    checks.push(PreflightCheck {
        name: "access-mode",
        passed: supported_mode,
        detail: if supported_mode {
            "volume has a supported access mode".to_string()
        } else {
            "volume has no ReadWriteOnce or ReadWriteMany access mode".to_string()
        },
    });

    let can_expand = checks.iter().all(|c| c.passed);
    PreflightResult { can_expand, checks }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_volume() -> VolumeDescriptor {
        VolumeDescriptor {
            name: "data".to_string(),
            namespace: "production".to_string(),
            storage_class_name: Some("fast-ssd".to_string()),
            phase: VolumePhase::Bound,
            access_modes: vec![AccessMode::ReadWriteOnce],
            current_bytes: 10 * (1i64 << 30),
        }
    }

    #[test]
    fn test_all_checks_pass() {
        let result = preflight(&bound_volume(), true);
        assert!(result.can_expand);
        assert_eq!(result.summary(), "passed all 3 checks");
    }

    #[test]
    fn test_storage_class_not_expandable() {
        let result = preflight(&bound_volume(), false);
        assert!(!result.can_expand);
        assert_eq!(result.summary(), "failed 1 of 3 checks");
    }

    #[test]
    fn test_missing_storage_class() {
        let mut volume = bound_volume();
        volume.storage_class_name = None;
        let result = preflight(&volume, true);
        assert!(!result.can_expand);
        assert!(!result.checks[0].passed);
    }

    #[test]
    fn test_not_bound() {
        let mut volume = bound_volume();
        volume.phase = VolumePhase::Pending;
        let result = preflight(&volume, true);
        assert!(!result.can_expand);
    }

    #[test]
    fn test_unsupported_access_mode() {
        let mut volume = bound_volume();
        volume.access_modes = vec![AccessMode::ReadOnlyMany];
        let result = preflight(&volume, true);
        assert!(!result.can_expand);
    }

    #[test]
    fn test_read_write_many_is_supported() {
        let mut volume = bound_volume();
        volume.access_modes = vec![AccessMode::ReadWriteMany];
        let result = preflight(&volume, true);
        assert!(result.can_expand);
    }

    #[tokio::test]
    async fn test_cache_invalidate_on_empty_is_a_noop() {
        let cache = StorageClassCache::new();
        // Without a live client we can only exercise the invalidate
        // bookkeeping here; the live fetch path is covered by the
        // reconcile-loop integration tests.
        cache.invalidate("fast-ssd").await;
        assert!(cache.entries.read().await.is_empty());
    }
}
