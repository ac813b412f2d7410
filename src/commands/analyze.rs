use anyhow::Context;
use chrono::Utc;
use kube::Client;
use std::collections::BTreeMap;

use pgguard_storage_operator::discovery::Discoverer;
use pgguard_storage_operator::evaluator::{self, EvaluationContext};
use pgguard_storage_operator::sampler::{SampleTarget, Sampler};
use pgguard_storage_operator::types::Level;

const CLUSTER_GROUP: &str = "postgresql.cnpg.io";
const CLUSTER_VERSION: &str = "v1";
const CLUSTER_KIND: &str = "Cluster";
const DEFAULT_DATA_MOUNT_PATH: &str = "/var/lib/postgresql/data";

/// One-shot, read-only pass over every managed cluster: measure usage,
/// evaluate it against baseline thresholds, and print a summary. Doesn't
/// touch annotations, doesn't remediate, doesn't need a policy CRD.
pub async fn run() -> anyhow::Result<()> {
    println!("Running storage-guard analysis...\n");

    let client = Client::try_default().await.context("Failed to connect to Kubernetes cluster. Is your kubeconfig valid?")?;

    let discoverer = Discoverer::new(client.clone());
    let cluster_gvk = discoverer
        .resolve_api_resource(CLUSTER_GROUP, CLUSTER_VERSION, CLUSTER_KIND)
        .await
        .context("failed to resolve managed-cluster API resource — is the CNPG CRD installed?")?;

    let clusters = discoverer.discover(&cluster_gvk, &BTreeMap::new(), &[], None).await.context("cluster discovery failed")?;

    if clusters.is_empty() {
        println!("No managed clusters found.");
        return Ok(());
    }

    let sampler = Sampler::new(client.clone());
    let policy = pgguard_storage_operator::crd::StorageGuardPolicySpec {
        selector: BTreeMap::new(),
        exclude: Vec::new(),
        thresholds: None,
        expansion: None,
        wal_cleanup: None,
        circuit_breaker: None,
        alerting: None,
        dry_run: Some(true),
    };

    println!("{:<24} {:<16} {:<10} {:<12} {}", "CLUSTER", "NAMESPACE", "USAGE%", "LEVEL", "NOTES");
    println!("{}", "-".repeat(90));

    let mut breached = 0usize;

    for cluster in &clusters {
        let Some(primary_pod) = &cluster.primary_pod else {
            println!("{:<24} {:<16} {:<10} {:<12} {}", cluster.name, cluster.namespace, "-", "-", "no primary pod resolved");
            continue;
        };

        let pod_api: kube::Api<k8s_openapi::api::core::v1::Pod> = kube::Api::namespaced(client.clone(), &cluster.namespace);
        let node = pod_api.get(primary_pod).await.ok().and_then(|p| p.spec.and_then(|s| s.node_name)).unwrap_or_default();

        let targets: Vec<SampleTarget> = cluster
            .volumes
            .iter()
            .map(|v| SampleTarget {
                volume_name: v.name.clone(),
                namespace: v.namespace.clone(),
                pod: primary_pod.clone(),
                node: node.clone(),
                mount_path: DEFAULT_DATA_MOUNT_PATH.to_string(),
                containers: vec!["postgres".to_string()],
            })
            .collect();

        let measurement = sampler.sample_cluster(&targets).await;
        let usage_pct = measurement.usage_percent();

        let context = EvaluationContext::default();
        let level = match evaluator::full_evaluation(&measurement, &policy, &context) {
            Ok(result) => result.decision.level,
            Err(_) => Level::Normal,
        };

        if level != Level::Normal {
            breached += 1;
        }

        let usage_display = usage_pct.map(|p| format!("{p:.1}")).unwrap_or_else(|| "-".to_string());
        let backup_note = cluster.backup.as_ref().map(|b| if b.healthy() { "backup OK".to_string() } else { "backup unhealthy".to_string() }).unwrap_or_default();

        println!("{:<24} {:<16} {:<10} {:<12} {}", cluster.name, cluster.namespace, usage_display, level.to_string(), backup_note);
    }

    println!("{}", "-".repeat(90));
    println!("{} cluster(s) analyzed, {breached} above warning threshold", clusters.len());
    println!("Analysis completed at {}", Utc::now().to_rfc3339());

    Ok(())
}
