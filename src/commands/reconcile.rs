use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use futures::{StreamExt, stream};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::core::ApiResource;
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use pgguard_storage_operator::alerts::{AlertManager, AlertRequest};
use pgguard_storage_operator::annotations::AnnotationStore;
use pgguard_storage_operator::audit::{AuditEventClose, AuditEventOpen, AuditWriter};
use pgguard_storage_operator::crd::{
    AuditEventPhase, AuditEventType, AuditTrigger, ManagedClusterStatus, StorageGuardPolicy,
    StorageGuardPolicyStatus,
};
use pgguard_storage_operator::discovery::{DiscoveredCluster, Discoverer};
use pgguard_storage_operator::evaluator::{self, EvaluationContext};
use pgguard_storage_operator::expansion::{ExpansionExecutor, ExpansionRequest};
use pgguard_storage_operator::preflight::StorageClassCache;
use pgguard_storage_operator::sampler::{SampleTarget, Sampler};
use pgguard_storage_operator::types::{Action as EngineAction, AlertSeverity, Level, VolumeDescriptor, VolumeOutcome};
use pgguard_storage_operator::wal_cleanup::{WalCleanupExecutor, WalCleanupRequest};

/* ============================= CONFIG ============================= */

const FINALIZER: &str = "storage.pgguard.io/cleanup";
const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);
const CLUSTER_WORKER_CONCURRENCY: usize = 8;
const VERIFY_DEADLINE: Duration = Duration::from_secs(300);
const FIELD_MANAGER: &str = "pgguard-storage-operator";

const DEFAULT_DATA_MOUNT_PATH: &str = "/var/lib/postgresql/data";
const DEFAULT_WAL_DIRECTORY: &str = "/var/lib/postgresql/data/pg_wal";

/// The external orchestrator's cluster CR. Configurable in principle, but
/// this engine targets the CloudNativePG cluster schema by default.
const CLUSTER_GROUP: &str = "postgresql.cnpg.io";
const CLUSTER_VERSION: &str = "v1";
const CLUSTER_KIND: &str = "Cluster";
const BACKUP_KIND: &str = "Backup";

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static USAGE_PERCENT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec("storageguard_usage_percent", "Cluster usage percentage, times 100", &["cluster", "namespace"])
});

static VOLUME_USED_BYTES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec(
        "storageguard_volume_used_bytes",
        "Per-volume used bytes",
        &["cluster", "namespace", "pvc"],
    )
});

static VOLUME_CAPACITY_BYTES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec(
        "storageguard_volume_capacity_bytes",
        "Per-volume capacity bytes",
        &["cluster", "namespace", "pvc"],
    )
});

static WAL_DIRECTORY_FILES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec(
        "storageguard_wal_directory_file_count",
        "Number of WAL segments present in the primary pod's WAL directory",
        &["cluster", "namespace"],
    )
});

static WAL_DIRECTORY_BYTES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec(
        "storageguard_wal_directory_bytes",
        "Total bytes of WAL segments present in the primary pod's WAL directory",
        &["cluster", "namespace"],
    )
});

static RECONCILE_TOTAL: LazyLock<IntCounterVec> =
    LazyLock::new(|| register_int_counter_vec("storageguard_reconcile_total", "Total policy reconciliation cycles", &["policy", "namespace"]));

static RECONCILE_ERRORS: LazyLock<IntCounterVec> =
    LazyLock::new(|| register_int_counter_vec("storageguard_reconcile_errors_total", "Reconcile errors by type", &["type"]));

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "storageguard_reconcile_duration_seconds",
        "Duration of one policy reconciliation cycle",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static COLLECTION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "storageguard_collection_duration_seconds",
        "Duration of one cluster's measurement collection",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static THRESHOLD_BREACHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec("storageguard_threshold_breaches_total", "Threshold breaches by level", &["level", "cluster", "namespace"])
});

static EXPANSION_ATTEMPTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec("storageguard_expansion_attempts_total", "Expansion attempts by outcome", &["cluster", "namespace", "result"])
});

static EXPANSION_BYTES_ADDED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec("storageguard_expansion_bytes_added_total", "Bytes added via expansion", &["cluster", "namespace"])
});

static WAL_CLEANUP_ATTEMPTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec("storageguard_wal_cleanup_attempts_total", "WAL cleanup attempts by outcome", &["cluster", "namespace", "result"])
});

static WAL_CLEANUP_FILES_REMOVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec("storageguard_wal_cleanup_files_removed_total", "WAL segments removed", &["cluster", "namespace"])
});

static CIRCUIT_BREAKER_OPEN: LazyLock<IntGaugeVec> =
    LazyLock::new(|| register_int_gauge_vec("storageguard_circuit_breaker_open", "1 when a cluster's breaker is open", &["cluster", "namespace"]));

static ALERTS_SENT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec(
        "storageguard_alerts_sent_total",
        "Alerts successfully dispatched",
        &["cluster", "namespace", "channel", "severity"],
    )
});

static ALERTS_SUPPRESSED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec("storageguard_alerts_suppressed_total", "Alerts dropped by suppression window", &["cluster", "namespace", "severity"])
});

static BACKUP_HEALTHY: LazyLock<IntGaugeVec> =
    LazyLock::new(|| register_int_gauge_vec("storageguard_backup_healthy", "1 when backups are configured and archiving", &["cluster", "namespace"]));

static BACKUP_AGE_HOURS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec("storageguard_backup_age_hours", "Hours since the last successful backup, truncated", &["cluster", "namespace"])
});

static BACKUP_CONFIGURED: LazyLock<IntGaugeVec> =
    LazyLock::new(|| register_int_gauge_vec("storageguard_backup_configured", "1 when a backup store object is configured for the cluster", &["cluster", "namespace"]));

static BACKUP_ARCHIVING_WORKING: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec("storageguard_backup_archiving_working", "1 when WAL archiving is currently working", &["cluster", "namespace"])
});

static BACKUP_LAST_SUCCESS_TIMESTAMP: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec(
        "storageguard_backup_last_success_timestamp_seconds",
        "Unix timestamp of the last successful backup",
        &["cluster", "namespace"],
    )
});

static BACKUP_FIRST_RECOVERABILITY_TIMESTAMP: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec(
        "storageguard_backup_first_recoverability_timestamp_seconds",
        "Unix timestamp of the earliest point the cluster can be recovered to",
        &["cluster", "namespace"],
    )
});

fn register_int_gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let g = IntGaugeVec::new(Opts::new(name, help), labels).expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
}

fn register_int_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
}

fn force_init_metrics() {
    LazyLock::force(&USAGE_PERCENT);
    LazyLock::force(&VOLUME_USED_BYTES);
    LazyLock::force(&VOLUME_CAPACITY_BYTES);
    LazyLock::force(&WAL_DIRECTORY_FILES);
    LazyLock::force(&WAL_DIRECTORY_BYTES);
    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&COLLECTION_DURATION);
    LazyLock::force(&THRESHOLD_BREACHES);
    LazyLock::force(&EXPANSION_ATTEMPTS);
    LazyLock::force(&EXPANSION_BYTES_ADDED);
    LazyLock::force(&WAL_CLEANUP_ATTEMPTS);
    LazyLock::force(&WAL_CLEANUP_FILES_REMOVED);
    LazyLock::force(&CIRCUIT_BREAKER_OPEN);
    LazyLock::force(&ALERTS_SENT);
    LazyLock::force(&ALERTS_SUPPRESSED);
    LazyLock::force(&BACKUP_HEALTHY);
    LazyLock::force(&BACKUP_AGE_HOURS);
    LazyLock::force(&BACKUP_CONFIGURED);
    LazyLock::force(&BACKUP_ARCHIVING_WORKING);
    LazyLock::force(&BACKUP_LAST_SUCCESS_TIMESTAMP);
    LazyLock::force(&BACKUP_FIRST_RECOVERABILITY_TIMESTAMP);
}

/* ============================= ERROR ============================= */

/// `Controller::run` requires its reconciler error to implement
/// `std::error::Error`, which `anyhow::Error` deliberately does not.
/// This just carries one across that boundary.
#[derive(Debug)]
struct ReconcileError(anyhow::Error);

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ReconcileError {}

impl From<anyhow::Error> for ReconcileError {
    fn from(err: anyhow::Error) -> Self {
        ReconcileError(err)
    }
}

/* ============================= STATE ============================= */

pub(crate) struct ReconcileState {
    pub(crate) ready: bool,
}

struct ReconcileContext {
    client: Client,
    cluster_gvk: ApiResource,
    backup_gvk: Option<ApiResource>,
    alerts: AlertManager,
    storage_classes: StorageClassCache,
}

/* ============================= ENTRY ============================= */

pub async fn run(addr: SocketAddr) -> Result<()> {
    println!("Starting storage-guard operator...\n");

    let client = Client::try_default().await.context("failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("cannot reach cluster: {e}. Is the cluster running?");
        }
    }

    let discoverer = Discoverer::new(client.clone());
    let cluster_gvk = discoverer
        .resolve_api_resource(CLUSTER_GROUP, CLUSTER_VERSION, CLUSTER_KIND)
        .await
        .context("failed to resolve managed-cluster API resource")?;
    let backup_gvk = discoverer.resolve_api_resource(CLUSTER_GROUP, CLUSTER_VERSION, BACKUP_KIND).await.ok();
    if backup_gvk.is_none() {
        warn!("backup API resource not found, backup-health metrics will be unavailable");
    }

    let policies: Api<StorageGuardPolicy> = Api::all(client.clone());

    let ctx = Arc::new(ReconcileContext {
        client: client.clone(),
        cluster_gvk,
        backup_gvk,
        alerts: AlertManager::new(client.clone()),
        storage_classes: StorageClassCache::new(),
    });

    force_init_metrics();

    println!("  CRD watch ................... StorageGuardPolicy.storage.pgguard.io/v1");
    println!("  Requeue interval ............ {}s", REQUEUE_INTERVAL.as_secs());
    println!("  Metrics server .............. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until first reconcile, then 200)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("operator_controller_started");

    let reconcile_state = Arc::new(Mutex::new(ReconcileState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = reconcile_state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move { start_metrics_server(http_state, http_shutdown, addr).await });

    let controller_state = reconcile_state.clone();
    let controller = Controller::new(policies, Default::default()).run(reconcile, error_policy, ctx).for_each(move |result| {
        let state = controller_state.clone();
        async move {
            {
                let mut s = state.lock().await;
                if !s.ready {
                    s.ready = true;
                }
            }
            if let Err(e) = result {
                warn!(error = %e, "reconcile_dispatch_error");
            }
        }
    });

    tokio::select! {
        _ = controller => {
            info!("operator_controller_stream_ended");
            println!("\nController stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");

    Ok(())
}

/* ============================= RECONCILE ============================= */

async fn reconcile(policy: Arc<StorageGuardPolicy>, ctx: Arc<ReconcileContext>) -> std::result::Result<Action, ReconcileError> {
    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();

    RECONCILE_TOTAL.with_label_values(&[&name, &namespace]).inc();
    let _timer = RECONCILE_DURATION.start_timer();

    info!(policy = %name, namespace = %namespace, "reconcile_start");

    if policy.metadata.deletion_timestamp.is_some() {
        return Ok(handle_deletion(&policy, &ctx.client).await?);
    }

    if !has_finalizer(&policy) {
        add_finalizer(&policy, &ctx.client).await?;
    }

    let discoverer = Discoverer::new(ctx.client.clone());
    let clusters = discoverer
        .discover(&ctx.cluster_gvk, &policy.spec.selector, &policy.spec.exclude, ctx.backup_gvk.as_ref())
        .await
        .context("cluster discovery failed")?;

    println!(
        "[{}] {namespace}/{name}: {} managed cluster(s) matched",
        Utc::now().format("%H:%M:%S"),
        clusters.len()
    );

    let results = stream::iter(clusters.into_iter().map(|cluster| {
        let ctx = ctx.clone();
        let policy = policy.clone();
        async move { reconcile_cluster(cluster, &policy, &ctx).await }
    }))
    .buffer_unordered(CLUSTER_WORKER_CONCURRENCY)
    .collect::<Vec<_>>()
    .await;

    let mut managed_clusters = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(status) => managed_clusters.push(status),
            Err(err) => {
                RECONCILE_ERRORS.with_label_values(&["cluster-pass"]).inc();
                warn!(policy = %name, error = %err, "cluster reconcile pass failed");
            }
        }
    }

    let status = StorageGuardPolicyStatus {
        observed_generation: policy.metadata.generation,
        managed_clusters,
        last_reconcile: Some(Utc::now().to_rfc3339()),
        message: None,
    };
    let status_patch = serde_json::json!({ "status": status });
    let policies_api: Api<StorageGuardPolicy> = Api::namespaced(ctx.client.clone(), &namespace);
    policies_api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&status_patch)).await?;

    info!(policy = %name, namespace = %namespace, "reconcile_end");

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

/// One cluster's full measure → evaluate → remediate → record pass.
/// Failures here are reported to the caller but never abort the pass for
/// other clusters in the same policy.
async fn reconcile_cluster(
    cluster: DiscoveredCluster,
    policy: &StorageGuardPolicy,
    ctx: &ReconcileContext,
) -> anyhow::Result<ManagedClusterStatus> {
    let now = Utc::now();
    let cluster_api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), &cluster.namespace, &ctx.cluster_gvk);
    let object = cluster_api.get(&cluster.name).await.context("fetching managed cluster object")?;

    let original_annotations = object.metadata.annotations.clone().unwrap_or_default();
    let mut annotations = original_annotations.clone();
    let mut store = AnnotationStore::new(&mut annotations);

    if store.effectively_paused(now) {
        info!(cluster = %cluster.name, namespace = %cluster.namespace, "cluster is paused, skipping");
        let breaker_open = store.circuit_breaker_open();
        patch_annotations(ctx, &cluster, &original_annotations, &annotations).await?;
        return Ok(ManagedClusterStatus {
            name: cluster.name,
            namespace: cluster.namespace,
            usage_percent: None,
            level: None,
            circuit_breaker_open: Some(breaker_open),
            last_check: Some(now.to_rfc3339()),
        });
    }

    if store.consume_reset_circuit_breaker() {
        info!(cluster = %cluster.name, namespace = %cluster.namespace, "circuit breaker manually reset");
        ctx.alerts.suppression().clear_suppression(&cluster.namespace, &cluster.name).await;
    }

    let breaker = policy.spec.circuit_breaker();
    if store.circuit_breaker_open() {
        if let Some(last_failure) = store.last_failure() {
            if now - last_failure >= chrono::Duration::minutes(breaker.reset_minutes()) {
                info!(cluster = %cluster.name, namespace = %cluster.namespace, "circuit breaker reset interval elapsed, closing");
                store.set_circuit_breaker_open(false);
                store.reset_failure_count();
            }
        }
    }

    let measurement = {
        let sampler = Sampler::new(ctx.client.clone());
        let targets = sample_targets(ctx, &cluster).await?;
        let _timer = COLLECTION_DURATION.start_timer();
        sampler.sample_cluster(&targets).await
    };

    let usage_pct = measurement.usage_percent();
    CIRCUIT_BREAKER_OPEN
        .with_label_values(&[&cluster.name, &cluster.namespace])
        .set(if store.circuit_breaker_open() { 1 } else { 0 });

    if let Some(backup) = &cluster.backup {
        let labels = [cluster.name.as_str(), cluster.namespace.as_str()];
        BACKUP_HEALTHY.with_label_values(&labels).set(if backup.healthy() { 1 } else { 0 });
        BACKUP_CONFIGURED.with_label_values(&labels).set(if backup.configured { 1 } else { 0 });
        BACKUP_ARCHIVING_WORKING.with_label_values(&labels).set(if backup.archiving_working { 1 } else { 0 });
        if let Some(age) = backup.age_hours(now) {
            BACKUP_AGE_HOURS.with_label_values(&labels).set(age as i64);
        }
        if let Some(last_success) = backup.last_success {
            BACKUP_LAST_SUCCESS_TIMESTAMP.with_label_values(&labels).set(last_success.timestamp());
        }
        if let Some(first_recoverability) = backup.first_recoverability {
            BACKUP_FIRST_RECOVERABILITY_TIMESTAMP.with_label_values(&labels).set(first_recoverability.timestamp());
        }
    }
    for volume in &measurement.per_volume {
        VOLUME_USED_BYTES.with_label_values(&[&cluster.name, &cluster.namespace, &volume.name]).set(volume.used_bytes);
        VOLUME_CAPACITY_BYTES.with_label_values(&[&cluster.name, &cluster.namespace, &volume.name]).set(volume.capacity_bytes);
    }

    let (expand_allowed, expand_reason) = store.can_expand(now, policy.spec.expansion().cooldown_minutes());
    let (wal_cleanup_allowed, wal_cleanup_reason) = store.can_wal_cleanup(now, policy.spec.wal_cleanup().cooldown_minutes());

    let eval_context = EvaluationContext {
        circuit_breaker_open: store.circuit_breaker_open(),
        breaker_reason: Some("circuit breaker is open".to_string()),
        expand_allowed,
        expand_blocked_reason: non_empty(expand_reason),
        wal_cleanup_allowed,
        wal_cleanup_blocked_reason: non_empty(wal_cleanup_reason),
    };

    let evaluation = match evaluator::full_evaluation(&measurement, &policy.spec, &eval_context) {
        Ok(e) => e,
        Err(err) => {
            warn!(cluster = %cluster.name, namespace = %cluster.namespace, error = %err, "evaluation failed, skipping cluster this pass");
            let breaker_open = store.circuit_breaker_open();
            patch_annotations(ctx, &cluster, &original_annotations, &annotations).await?;
            return Ok(ManagedClusterStatus {
                name: cluster.name,
                namespace: cluster.namespace,
                usage_percent: None,
                level: None,
                circuit_breaker_open: Some(breaker_open),
                last_check: Some(now.to_rfc3339()),
            });
        }
    };

    if let Some(pct) = usage_pct {
        store.set_current_usage_percent(pct);
        USAGE_PERCENT.with_label_values(&[&cluster.name, &cluster.namespace]).set(pct as i64);
    }
    store.set_last_check(now);

    if evaluation.decision.level != Level::Normal {
        THRESHOLD_BREACHES.with_label_values(&[&evaluation.decision.level.to_string(), &cluster.name, &cluster.namespace]).inc();
    }

    // Alerts are always dispatched at the triggered level, even when the
    // cluster is breaker-blocked or the corresponding remediation is
    // disabled, so operators never lose visibility into a degraded cluster.
    if evaluation.decision.should_alert {
        let severity = alert_severity_for_level(evaluation.decision.level);
        dispatch_alert(ctx, &cluster, &policy.spec.alerting().channels, severity, &evaluation.decision.message, now).await;
    }

    // At most one non-alert remediation runs per pass: the highest-
    // priority unblocked action among expand/wal-cleanup.
    let remediation = evaluation
        .actions
        .iter()
        .filter(|a| !a.blocked && matches!(a.action, EngineAction::Expand | EngineAction::WalCleanup))
        .min_by_key(|a| a.priority);

    let mut execution_failed = false;
    if let Some(action) = remediation {
        match &action.action {
            EngineAction::Expand => {
                execution_failed = !run_expansion(ctx, &cluster, policy, &mut store, now).await?;
            }
            EngineAction::WalCleanup => {
                execution_failed = !run_wal_cleanup(ctx, &cluster, policy, &mut store, now).await?;
            }
            _ => {}
        }
    }

    if execution_failed {
        let breaker = policy.spec.circuit_breaker();
        let failures = store.increment_failure_count(now);
        if failures >= breaker.max_failures() {
            store.set_circuit_breaker_open(true);
            warn!(cluster = %cluster.name, namespace = %cluster.namespace, failures, "circuit breaker opened");
        }
    }

    let breaker_open = store.circuit_breaker_open();
    CIRCUIT_BREAKER_OPEN.with_label_values(&[&cluster.name, &cluster.namespace]).set(if breaker_open { 1 } else { 0 });

    patch_annotations(ctx, &cluster, &original_annotations, &annotations).await?;

    Ok(ManagedClusterStatus {
        name: cluster.name,
        namespace: cluster.namespace,
        usage_percent: usage_pct,
        level: Some(evaluation.decision.level.to_string()),
        circuit_breaker_open: Some(breaker_open),
        last_check: Some(now.to_rfc3339()),
    })
}

fn non_empty(reason: String) -> Option<String> {
    if reason.is_empty() { None } else { Some(reason) }
}

/// Mirrors the evaluator's own level-to-severity mapping so a breaker-open
/// pass (whose action list is empty) can still alert at the right severity.
fn alert_severity_for_level(level: Level) -> AlertSeverity {
    match level {
        Level::Emergency | Level::Critical => AlertSeverity::Critical,
        _ => AlertSeverity::Warning,
    }
}

async fn dispatch_alert(
    ctx: &ReconcileContext,
    cluster: &DiscoveredCluster,
    channels: &[pgguard_storage_operator::crd::AlertChannel],
    severity: AlertSeverity,
    message: &str,
    now: chrono::DateTime<Utc>,
) {
    let request = AlertRequest {
        cluster_name: cluster.name.clone(),
        namespace: cluster.namespace.clone(),
        severity,
        message: message.to_string(),
        details: std::collections::HashMap::new(),
        timestamp: now,
    };
    let result = ctx.alerts.dispatch(&request, channels, now).await;
    if result.suppressed {
        ALERTS_SUPPRESSED.with_label_values(&[&cluster.name, &cluster.namespace, &request.severity.to_string()]).inc();
        return;
    }
    for outcome in &result.channels {
        if outcome.sent {
            ALERTS_SENT.with_label_values(&[&cluster.name, &cluster.namespace, &outcome.channel, &request.severity.to_string()]).inc();
        } else {
            warn!(cluster = %cluster.name, channel = %outcome.channel, error = ?outcome.error, "alert channel delivery failed");
        }
    }
}

async fn run_expansion(
    ctx: &ReconcileContext,
    cluster: &DiscoveredCluster,
    policy: &StorageGuardPolicy,
    store: &mut AnnotationStore<'_>,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<bool> {
    let expansion_config = policy.spec.expansion();
    let dry_run = policy.spec.dry_run();
    let audit = AuditWriter::new(ctx.client.clone());

    let event_name = audit
        .open(
            &cluster.namespace,
            AuditEventOpen {
                cluster_name: cluster.name.clone(),
                policy_name: policy.name_any(),
                namespace: cluster.namespace.clone(),
                event_type: AuditEventType::Expansion,
                trigger: AuditTrigger::ThresholdBreach,
                reason: "usage crossed the expansion threshold".to_string(),
                dry_run,
            },
        )
        .await?;

    let executor = ExpansionExecutor::new(ctx.client.clone(), &ctx.storage_classes);
    let result = executor
        .execute(ExpansionRequest {
            cluster_name: cluster.name.clone(),
            namespace: cluster.namespace.clone(),
            volumes: cluster.volumes.clone(),
            config: &expansion_config,
            reason: "usage crossed the expansion threshold".to_string(),
            dry_run,
            verify_deadline: VERIFY_DEADLINE,
        })
        .await;

    let outcome_label = if result.success { "success" } else { "failure" };
    EXPANSION_ATTEMPTS.with_label_values(&[&cluster.name, &cluster.namespace, outcome_label]).inc();
    EXPANSION_BYTES_ADDED
        .with_label_values(&[&cluster.name, &cluster.namespace])
        .inc_by(result.total_bytes_added.max(0) as u64);

    if !dry_run && result.success {
        store.set_last_expansion(now);
    }

    let per_volume = result
        .results
        .iter()
        .map(|r| {
            let (outcome, message) = match &r.outcome {
                VolumeOutcome::Success { new_bytes } => ("success".to_string(), Some(format!("new size {new_bytes} bytes"))),
                VolumeOutcome::PendingResize { new_bytes } => {
                    ("pending-resize".to_string(), Some(format!("capacity converged to {new_bytes} bytes, filesystem resize still pending")))
                }
                VolumeOutcome::Skipped { reason } => ("skipped".to_string(), Some(reason.clone())),
                VolumeOutcome::Failed { error } => ("failed".to_string(), Some(error.clone())),
            };
            pgguard_storage_operator::crd::VolumeStatusEntry { volume_name: r.volume_name.clone(), outcome, message }
        })
        .collect();

    let phase = if result.success { AuditEventPhase::Completed } else { AuditEventPhase::Failed };
    let message = format!(
        "expansion {}: {} volume(s), {:.2}Gi added",
        if result.success { "completed" } else { "failed" },
        result.results.len(),
        result.total_bytes_added as f64 / (1i64 << 30) as f64
    );
    audit.close(&cluster.namespace, &event_name, AuditEventClose { phase, per_volume_status: per_volume, message }).await?;

    Ok(result.success)
}

async fn run_wal_cleanup(
    ctx: &ReconcileContext,
    cluster: &DiscoveredCluster,
    policy: &StorageGuardPolicy,
    store: &mut AnnotationStore<'_>,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<bool> {
    let Some(primary_pod) = &cluster.primary_pod else {
        warn!(cluster = %cluster.name, namespace = %cluster.namespace, "no primary pod resolved, skipping WAL cleanup");
        return Ok(true);
    };

    let wal_config = policy.spec.wal_cleanup();
    let dry_run = policy.spec.dry_run();
    let audit = AuditWriter::new(ctx.client.clone());

    let event_name = audit
        .open(
            &cluster.namespace,
            AuditEventOpen {
                cluster_name: cluster.name.clone(),
                policy_name: policy.name_any(),
                namespace: cluster.namespace.clone(),
                event_type: AuditEventType::WalCleanup,
                trigger: AuditTrigger::ThresholdBreach,
                reason: "usage crossed the emergency threshold".to_string(),
                dry_run,
            },
        )
        .await?;

    let container = primary_container(ctx, cluster, primary_pod).await.unwrap_or_else(|| "postgres".to_string());

    let executor = WalCleanupExecutor::new(ctx.client.clone());
    let result = executor
        .execute(WalCleanupRequest {
            cluster_name: cluster.name.clone(),
            namespace: cluster.namespace.clone(),
            pod: primary_pod.clone(),
            container,
            wal_directory: DEFAULT_WAL_DIRECTORY.to_string(),
            config: &wal_config,
            dry_run,
        })
        .await?;

    let outcome_label = if result.success { "success" } else { "failure" };
    WAL_CLEANUP_ATTEMPTS.with_label_values(&[&cluster.name, &cluster.namespace, outcome_label]).inc();
    WAL_CLEANUP_FILES_REMOVED.with_label_values(&[&cluster.name, &cluster.namespace]).inc_by(result.removed.len() as u64);
    WAL_DIRECTORY_FILES
        .with_label_values(&[&cluster.name, &cluster.namespace])
        .set((result.removed.len() + result.retained.len() + result.skipped.len()) as i64);
    WAL_DIRECTORY_BYTES.with_label_values(&[&cluster.name, &cluster.namespace]).set(result.directory_bytes);

    if !dry_run && result.success {
        store.set_wal_cleanup_last(now);
    }

    let phase = if result.success { AuditEventPhase::Completed } else { AuditEventPhase::Failed };
    let message = format!(
        "WAL cleanup {}: {} removed ({:.2}Gi), {} retained, {} skipped",
        if dry_run { "would remove" } else if result.success { "completed" } else { "failed" },
        result.removed.len(),
        result.bytes_removed as f64 / (1i64 << 30) as f64,
        result.retained.len(),
        result.skipped.len()
    );
    audit.close(&cluster.namespace, &event_name, AuditEventClose { phase, per_volume_status: Vec::new(), message }).await?;

    Ok(result.success)
}

async fn primary_container(ctx: &ReconcileContext, cluster: &DiscoveredCluster, pod_name: &str) -> Option<String> {
    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &cluster.namespace);
    let pod = api.get(pod_name).await.ok()?;
    let containers: Vec<String> = pod.spec?.containers.into_iter().map(|c| c.name).collect();
    containers.iter().find(|c| c.as_str() == "postgres").cloned().or_else(|| containers.into_iter().next())
}

async fn sample_targets(ctx: &ReconcileContext, cluster: &DiscoveredCluster) -> anyhow::Result<Vec<SampleTarget>> {
    let Some(primary_pod) = &cluster.primary_pod else {
        return Ok(Vec::new());
    };
    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &cluster.namespace);
    let pod = api.get(primary_pod).await.context("fetching primary pod for sampling")?;
    let node = pod.spec.as_ref().and_then(|s| s.node_name.clone()).unwrap_or_default();
    let containers: Vec<String> = pod.spec.map(|s| s.containers.into_iter().map(|c| c.name).collect()).unwrap_or_default();

    Ok(cluster
        .volumes
        .iter()
        .map(|v: &VolumeDescriptor| SampleTarget {
            volume_name: v.name.clone(),
            namespace: v.namespace.clone(),
            pod: primary_pod.clone(),
            node: node.clone(),
            mount_path: DEFAULT_DATA_MOUNT_PATH.to_string(),
            containers: containers.clone(),
        })
        .collect())
}

/// Builds a merge patch scoped to this store's own annotation prefix:
/// changed/added keys get their new value, keys removed since `original`
/// get an explicit `null` (JSON Merge Patch delete), everything else is
/// left untouched so a concurrent writer of unrelated annotations is safe.
async fn patch_annotations(
    ctx: &ReconcileContext,
    cluster: &DiscoveredCluster,
    original: &BTreeMap<String, String>,
    mutated: &BTreeMap<String, String>,
) -> anyhow::Result<()> {
    use pgguard_storage_operator::annotations::PREFIX;

    let mut changes = serde_json::Map::new();
    for (key, value) in mutated {
        if key.starts_with(PREFIX) && original.get(key) != Some(value) {
            changes.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
    }
    for key in original.keys() {
        if key.starts_with(PREFIX) && !mutated.contains_key(key) {
            changes.insert(key.clone(), serde_json::Value::Null);
        }
    }

    if changes.is_empty() {
        return Ok(());
    }

    let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), &cluster.namespace, &ctx.cluster_gvk);
    let patch = serde_json::json!({ "metadata": { "annotations": changes } });
    api.patch(&cluster.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch)).await?;
    Ok(())
}

/* ============================= ERROR POLICY ============================= */

fn error_policy(_policy: Arc<StorageGuardPolicy>, error: &ReconcileError, _ctx: Arc<ReconcileContext>) -> Action {
    RECONCILE_ERRORS.with_label_values(&["reconcile"]).inc();
    warn!(error = %error, "reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= FINALIZER ============================= */

fn has_finalizer(policy: &StorageGuardPolicy) -> bool {
    policy.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

async fn add_finalizer(policy: &StorageGuardPolicy, client: &Client) -> anyhow::Result<()> {
    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();
    let api: Api<StorageGuardPolicy> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": [FINALIZER] } });
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch)).await?;
    info!(policy = %name, "finalizer_added");
    Ok(())
}

async fn remove_finalizer(policy: &StorageGuardPolicy, client: &Client) -> anyhow::Result<()> {
    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();
    let api: Api<StorageGuardPolicy> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": [] } });
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch)).await?;
    info!(policy = %name, "finalizer_removed");
    Ok(())
}

async fn handle_deletion(policy: &StorageGuardPolicy, client: &Client) -> anyhow::Result<Action> {
    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();
    info!(policy = %name, namespace = %namespace, "handling_deletion");

    if has_finalizer(policy) {
        remove_finalizer(policy, client).await?;
    }

    Ok(Action::await_change())
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_reconcile_router(state: Arc<Mutex<ReconcileState>>) -> Router {
    Router::new()
        .route("/metrics", get(reconcile_metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || reconcile_ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(state: Arc<Mutex<ReconcileState>>, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) -> Result<()> {
    let app = build_reconcile_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind metrics server")?;
    info!(addr = %addr, "reconcile_metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn reconcile_ready_handler(state: Arc<Mutex<ReconcileState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn reconcile_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_reconcile_state(ready: bool) -> Arc<Mutex<ReconcileState>> {
        Arc::new(Mutex::new(ReconcileState { ready }))
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let app = build_reconcile_router(test_reconcile_state(false));
        let response = app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_503_before_first_reconcile() {
        let app = build_reconcile_router(test_reconcile_state(false));
        let response = app.oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_200_once_ready() {
        let app = build_reconcile_router(test_reconcile_state(true));
        let response = app.oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_registered_families() {
        force_init_metrics();
        let app = build_reconcile_router(test_reconcile_state(true));
        let response = app.oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("storageguard_usage_percent"));
        assert!(text.contains("storageguard_circuit_breaker_open"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = build_reconcile_router(test_reconcile_state(true));
        let response = app.oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_finalizer_detection() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        let mut policy = StorageGuardPolicy::new(
            "baseline",
            pgguard_storage_operator::crd::StorageGuardPolicySpec {
                selector: BTreeMap::new(),
                exclude: vec![],
                thresholds: None,
                expansion: None,
                wal_cleanup: None,
                circuit_breaker: None,
                alerting: None,
                dry_run: None,
            },
        );
        assert!(!has_finalizer(&policy));

        policy.metadata = ObjectMeta { finalizers: Some(vec![FINALIZER.to_string()]), ..Default::default() };
        assert!(has_finalizer(&policy));
    }

    #[test]
    fn test_patch_annotations_diff_only_touches_our_prefix() {
        use pgguard_storage_operator::annotations::PREFIX;

        let mut original = BTreeMap::new();
        original.insert(format!("{PREFIX}/reset-circuit-breaker"), "true".to_string());
        original.insert("someone-else.io/note".to_string(), "keep-me".to_string());

        let mut mutated = original.clone();
        mutated.remove(&format!("{PREFIX}/reset-circuit-breaker"));
        mutated.insert(format!("{PREFIX}/circuit-breaker-open"), "false".to_string());

        let mut changes = serde_json::Map::new();
        for (key, value) in &mutated {
            if key.starts_with(PREFIX) && original.get(key) != Some(value) {
                changes.insert(key.clone(), serde_json::Value::String(value.clone()));
            }
        }
        for key in original.keys() {
            if key.starts_with(PREFIX) && !mutated.contains_key(key) {
                changes.insert(key.clone(), serde_json::Value::Null);
            }
        }

        assert_eq!(changes.get(&format!("{PREFIX}/reset-circuit-breaker")), Some(&serde_json::Value::Null));
        assert_eq!(changes.get(&format!("{PREFIX}/circuit-breaker-open")).unwrap(), "false");
        assert!(!changes.contains_key("someone-else.io/note"));
    }
}
