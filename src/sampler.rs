use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use crate::types::{ClusterMeasurement, InodeCounts, VolumeMeasurement};

const NODE_AGENT_TIMEOUT: Duration = Duration::from_secs(5);
const NODE_AGENT_PORT: u16 = 9100;

/// Everything the sampler needs to take one volume measurement, as
/// resolved by cluster discovery.
#[derive(Debug, Clone)]
pub struct SampleTarget {
    pub volume_name: String,
    pub namespace: String,
    pub pod: String,
    pub node: String,
    pub mount_path: String,
    pub containers: Vec<String>,
}

impl SampleTarget {
    /// The container remote-exec should target: `postgres` if present,
    /// else the first container on the pod.
    fn exec_container(&self) -> Option<&str> {
        self.containers
            .iter()
            .find(|c| c.as_str() == "postgres")
            .or_else(|| self.containers.first())
            .map(String::as_str)
    }
}

struct RawSample {
    used_bytes: i64,
    capacity_bytes: i64,
    available_bytes: i64,
    inodes: InodeCounts,
}

#[derive(Debug, Deserialize)]
struct NodeAgentStats {
    used_bytes: i64,
    capacity_bytes: i64,
    available_bytes: i64,
    inodes_total: u64,
    inodes_used: u64,
    inodes_free: u64,
}

impl From<NodeAgentStats> for RawSample {
    fn from(s: NodeAgentStats) -> Self {
        RawSample {
            used_bytes: s.used_bytes,
            capacity_bytes: s.capacity_bytes,
            available_bytes: s.available_bytes,
            inodes: InodeCounts { total: s.inodes_total, used: s.inodes_used, free: s.inodes_free },
        }
    }
}

/// Samples per-volume usage, preferring a node-agent stats endpoint and
/// falling back to remote-exec'd `df` when the endpoint is unreachable.
pub struct Sampler {
    client: Client,
    http: reqwest::Client,
}

impl Sampler {
    pub fn new(client: Client) -> Self {
        let http = reqwest::Client::builder()
            .timeout(NODE_AGENT_TIMEOUT)
            .build()
            .expect("reqwest client builder should not fail with static config");
        Self { client, http }
    }

    /// Samples every target and returns the cluster-level aggregate.
    /// A single volume's failure is logged and excludes it from the
    /// aggregate rather than failing the whole cluster's measurement.
    pub async fn sample_cluster(&self, targets: &[SampleTarget]) -> ClusterMeasurement {
        let mut per_volume = Vec::with_capacity(targets.len());
        let mut total_used = 0i64;
        let mut total_capacity = 0i64;

        for target in targets {
            match self.sample_volume(target).await {
                Ok(m) => {
                    total_used += m.used_bytes;
                    total_capacity += m.capacity_bytes;
                    per_volume.push(m);
                }
                Err(err) => {
                    tracing::warn!(
                        volume = %target.volume_name,
                        error = %err,
                        "volume sample failed, excluding from cluster aggregate"
                    );
                }
            }
        }

        ClusterMeasurement { total_used, total_capacity, per_volume }
    }

    async fn sample_volume(&self, target: &SampleTarget) -> anyhow::Result<VolumeMeasurement> {
        let sample = match self.sample_via_node_agent(target).await {
            Ok(sample) => sample,
            Err(err) => {
                tracing::debug!(
                    volume = %target.volume_name,
                    error = %err,
                    "node-agent stats endpoint unavailable, falling back to df"
                );
                self.sample_via_df(target).await?
            }
        };

        Ok(VolumeMeasurement {
            name: target.volume_name.clone(),
            namespace: target.namespace.clone(),
            pod: target.pod.clone(),
            node: target.node.clone(),
            used_bytes: sample.used_bytes,
            capacity_bytes: sample.capacity_bytes,
            available_bytes: sample.available_bytes,
            inodes: sample.inodes,
            collected_at: Utc::now(),
        })
    }

    async fn sample_via_node_agent(&self, target: &SampleTarget) -> anyhow::Result<RawSample> {
        let url = format!(
            "http://{}:{}/stats/volume/{}/{}",
            target.node, NODE_AGENT_PORT, target.namespace, target.volume_name
        );
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        let stats: NodeAgentStats = resp.json().await?;
        Ok(stats.into())
    }

    async fn sample_via_df(&self, target: &SampleTarget) -> anyhow::Result<RawSample> {
        let container = target
            .exec_container()
            .ok_or_else(|| anyhow::anyhow!("pod '{}' has no containers to exec into", target.pod))?;

        let bytes_out = self
            .exec_capture(target, container, vec!["df", "-B1", "-P", &target.mount_path])
            .await?;
        let inodes_out = self
            .exec_capture(target, container, vec!["df", "-i", "-P", &target.mount_path])
            .await?;

        let (used_bytes, capacity_bytes, available_bytes) = parse_df_bytes(&bytes_out)?;
        let inodes = parse_df_inodes(&inodes_out)?;

        Ok(RawSample { used_bytes, capacity_bytes, available_bytes, inodes })
    }

    async fn exec_capture(
        &self,
        target: &SampleTarget,
        container: &str,
        command: Vec<&str>,
    ) -> anyhow::Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let ap = AttachParams::default().container(container).stdout(true).stderr(false);
        let mut attached = pods.exec(&target.pod, command, &ap).await?;

        let mut out = String::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout.read_to_string(&mut out).await?;
        }
        attached.join().await?;
        Ok(out)
    }
}

/// Finds the data row of a POSIX `df -P` report: the first non-empty
/// line carrying a `N%` capacity field. `-P` can wrap a long filesystem
/// name onto its own line, so scanning by content rather than position
/// handles both the one-line and wrapped forms.
fn data_line(output: &str) -> anyhow::Result<Vec<String>> {
    let line = output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .find(|l| l.split_whitespace().any(|f| f.ends_with('%')))
        .ok_or_else(|| anyhow::anyhow!("no data line found in df output: {output:?}"))?;
    Ok(line.split_whitespace().map(String::from).collect())
}

fn parse_df_bytes(output: &str) -> anyhow::Result<(i64, i64, i64)> {
    let fields = data_line(output)?;
    let pct_idx = fields
        .iter()
        .position(|f| f.ends_with('%'))
        .ok_or_else(|| anyhow::anyhow!("no capacity field in df output"))?;
    if pct_idx < 3 {
        anyhow::bail!("unexpected df output, too few fields before capacity: {fields:?}");
    }
    let total: i64 = fields[pct_idx - 3].parse()?;
    let used: i64 = fields[pct_idx - 2].parse()?;
    let available: i64 = fields[pct_idx - 1].parse()?;
    Ok((used, total, available))
}

fn parse_df_inodes(output: &str) -> anyhow::Result<InodeCounts> {
    let fields = data_line(output)?;
    let pct_idx = fields
        .iter()
        .position(|f| f.ends_with('%'))
        .ok_or_else(|| anyhow::anyhow!("no inode capacity field in df -i output"))?;
    if pct_idx < 3 {
        anyhow::bail!("unexpected df -i output, too few fields before capacity: {fields:?}");
    }
    let total: u64 = fields[pct_idx - 3].parse()?;
    let used: u64 = fields[pct_idx - 2].parse()?;
    let free: u64 = fields[pct_idx - 1].parse()?;
    Ok(InodeCounts { total, used, free })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_target() -> SampleTarget {
        SampleTarget {
            volume_name: "data".to_string(),
            namespace: "production".to_string(),
            pod: "pg-0".to_string(),
            node: "node-1".to_string(),
            mount_path: "/var/lib/postgresql/data".to_string(),
            containers: vec!["postgres".to_string(), "exporter".to_string()],
        }
    }

    #[test]
    fn test_exec_container_prefers_postgres() {
        let target = sample_target();
        assert_eq!(target.exec_container(), Some("postgres"));
    }

    #[test]
    fn test_exec_container_falls_back_to_first() {
        let mut target = sample_target();
        target.containers = vec!["sidecar".to_string(), "postgres-exporter".to_string()];
        assert_eq!(target.exec_container(), Some("sidecar"));
    }

    #[test]
    fn test_exec_container_none_when_empty() {
        let mut target = sample_target();
        target.containers = vec![];
        assert_eq!(target.exec_container(), None);
    }

    #[test]
    fn test_parse_df_bytes_single_line() {
        let out = "Filesystem     1B-blocks      Used Available Capacity Mounted on\n\
                    /dev/sda1      10737418240 8589934592 2147483648      80% /var/lib/postgresql/data\n";
        let (used, total, available) = parse_df_bytes(out).unwrap();
        assert_eq!(total, 10737418240);
        assert_eq!(used, 8589934592);
        assert_eq!(available, 2147483648);
    }

    #[test]
    fn test_parse_df_bytes_wrapped_filesystem_name() {
        let out = "Filesystem                                            1B-blocks      Used Available Capacity Mounted on\n\
                    /dev/mapper/a-very-long-logical-volume-name-indeed\n\
                     10737418240 8589934592 2147483648      80% /var/lib/postgresql/data\n";
        let (used, total, available) = parse_df_bytes(out).unwrap();
        assert_eq!(total, 10737418240);
        assert_eq!(used, 8589934592);
        assert_eq!(available, 2147483648);
    }

    #[test]
    fn test_parse_df_inodes() {
        let out = "Filesystem       Inodes  IUsed   IFree IUse% Mounted on\n\
                    /dev/sda1       6553600 123456 6430144    2% /var/lib/postgresql/data\n";
        let inodes = parse_df_inodes(out).unwrap();
        assert_eq!(inodes.total, 6553600);
        assert_eq!(inodes.used, 123456);
        assert_eq!(inodes.free, 6430144);
    }

    #[test]
    fn test_parse_df_bytes_missing_percent_errors() {
        let out = "Filesystem 1B-blocks Used Available Mounted-on\n/dev/sda1 1 2 3 /data\n";
        assert!(parse_df_bytes(out).is_err());
    }

    #[test]
    fn test_node_agent_stats_deserializes() {
        let json = r#"{"used_bytes":1,"capacity_bytes":2,"available_bytes":1,
                        "inodes_total":10,"inodes_used":3,"inodes_free":7}"#;
        let stats: NodeAgentStats = serde_json::from_str(json).unwrap();
        let raw: RawSample = stats.into();
        assert_eq!(raw.used_bytes, 1);
        assert_eq!(raw.inodes.free, 7);
    }
}
