use anyhow::Context;
use kube::Client;
use std::collections::BTreeMap;

use pgguard_storage_operator::discovery::Discoverer;

const CLUSTER_GROUP: &str = "postgresql.cnpg.io";
const CLUSTER_VERSION: &str = "v1";
const CLUSTER_KIND: &str = "Cluster";

pub async fn run(resource: String) -> anyhow::Result<()> {
    if resource != "clusters" {
        anyhow::bail!("Unsupported resource '{}'. Supported: clusters", resource);
    }

    let client = Client::try_default().await.context("Failed to connect to Kubernetes cluster. Is your kubeconfig valid?")?;

    let discoverer = Discoverer::new(client);
    let cluster_gvk = discoverer
        .resolve_api_resource(CLUSTER_GROUP, CLUSTER_VERSION, CLUSTER_KIND)
        .await
        .context("failed to resolve managed-cluster API resource — is the CNPG CRD installed?")?;

    let mut clusters = discoverer.discover(&cluster_gvk, &BTreeMap::new(), &[], None).await.context("cluster discovery failed")?;
    clusters.sort_by(|a, b| a.namespace.cmp(&b.namespace).then(a.name.cmp(&b.name)));

    println!("{:<20} {:<30} {:<10} {:<20}", "NAMESPACE", "NAME", "VOLUMES", "PRIMARY POD");
    println!("{}", "-".repeat(82));

    for cluster in &clusters {
        let primary = cluster.primary_pod.as_deref().unwrap_or("Not Found");
        println!("{:<20} {:<30} {:<10} {:<20}", cluster.namespace, cluster.name, cluster.volumes.len(), primary);
    }

    println!("\nTotal: {} managed cluster(s)", clusters.len());

    Ok(())
}
