use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncReadExt;

use crate::crd::WalCleanupConfig;

const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/* ============================= TYPES ============================= */

/// Input to one WAL-cleanup-executor call: the primary pod of a single
/// cluster and the directory its WAL segments live in.
pub struct WalCleanupRequest<'a> {
    pub cluster_name: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub wal_directory: String,
    pub config: &'a WalCleanupConfig,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSegment {
    pub name: String,
    pub reason: String,
}

/// A WAL segment file as enumerated in the primary pod's WAL directory,
/// name plus size so removal can be reported in bytes as well as count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalSegment {
    pub name: String,
    pub bytes: i64,
}

/// Outcome of one WAL-cleanup-executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalCleanupResult {
    pub removed: Vec<String>,
    pub retained: Vec<String>,
    pub skipped: Vec<SkippedSegment>,
    pub success: bool,
    /// Bytes reclaimed by `removed` (or that a dry run would have reclaimed).
    pub bytes_removed: i64,
    /// Total size of every segment observed this pass (removed + retained
    /// + skipped), i.e. the WAL directory's size before this cleanup ran.
    pub directory_bytes: i64,
}

/* ============================= SEGMENT NAMING ============================= */

/// WAL segment filenames are 24 uppercase hex characters. Anything else
/// in the directory (`archive_status`, `.history` files, partials) is
/// left untouched.
fn is_wal_segment_name(name: &str) -> bool {
    name.len() == 24 && name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
}

/// Parses one line of `ls -l` output into a name/size pair. Expects the
/// standard `<mode> <links> <owner> <group> <size> <mon> <day> <time-or-year> <name>`
/// layout; lines that don't fit (e.g. a leading "total N" line) are skipped.
fn parse_ls_l_line(line: &str) -> Option<WalSegment> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    let bytes = fields[4].parse().ok()?;
    let name = fields[8..].join(" ");
    Some(WalSegment { name, bytes })
}

/// Selects which of the chronologically-sorted segments are eligible
/// for removal: all but the newest `retain_count`, further restricted
/// to the archived set when `require_archived` is set. Pure so the
/// selection logic can be exercised without a live cluster.
fn select_removable(
    mut segments: Vec<WalSegment>,
    archived: &[String],
    config: &WalCleanupConfig,
) -> (Vec<WalSegment>, Vec<String>, Vec<SkippedSegment>) {
    segments.sort_by(|a, b| a.name.cmp(&b.name));

    let retain_count = config.retain_count() as usize;
    let boundary = segments.len().saturating_sub(retain_count);

    let mut removable = Vec::new();
    let mut retained = Vec::new();
    let mut skipped = Vec::new();

    for (i, segment) in segments.into_iter().enumerate() {
        if i >= boundary {
            retained.push(segment.name);
            continue;
        }

        if config.require_archived() && !archived.contains(&segment.name) {
            skipped.push(SkippedSegment { name: segment.name, reason: "not yet archived".to_string() });
            continue;
        }

        removable.push(segment);
    }

    (removable, retained, skipped)
}

/* ============================= EXECUTOR ============================= */

pub struct WalCleanupExecutor {
    client: Client,
}

impl WalCleanupExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Lists segments in the configured WAL directory, determines which
    /// are eligible for removal, and (unless `dry_run`) removes them one
    /// at a time, tolerating a single file's removal failure without
    /// aborting the rest. Succeeds iff at least one segment was removed,
    /// or the call was a dry run.
    pub async fn execute(&self, request: WalCleanupRequest<'_>) -> anyhow::Result<WalCleanupResult> {
        let wal_directory = sanitize_directory(&request.wal_directory)?;

        let segments = self.list_segments(&request, &wal_directory).await?;
        let directory_bytes = segments.iter().map(|s| s.bytes).sum();
        let archived = self.list_archived(&request, &wal_directory).await.unwrap_or_default();

        let (removable, retained, mut skipped) = select_removable(segments, &archived, request.config);

        if request.dry_run {
            let bytes_removed = removable.iter().map(|s| s.bytes).sum();
            let removed = removable.into_iter().map(|s| s.name).collect();
            return Ok(WalCleanupResult { removed, retained, skipped, success: true, bytes_removed, directory_bytes });
        }

        let mut removed = Vec::with_capacity(removable.len());
        let mut bytes_removed = 0i64;
        for segment in removable {
            let path = format!("{wal_directory}/{}", segment.name);
            match self.remove_file(&request, &path).await {
                Ok(()) => {
                    bytes_removed += segment.bytes;
                    removed.push(segment.name);
                }
                Err(err) => skipped.push(SkippedSegment { name: segment.name, reason: err.to_string() }),
            }
        }

        let success = !removed.is_empty();
        Ok(WalCleanupResult { removed, retained, skipped, success, bytes_removed, directory_bytes })
    }

    async fn list_segments(&self, request: &WalCleanupRequest<'_>, wal_directory: &str) -> anyhow::Result<Vec<WalSegment>> {
        let out = self.exec_capture(request, vec!["ls", "-l", wal_directory]).await?;
        Ok(out.lines().filter_map(parse_ls_l_line).filter(|s| is_wal_segment_name(&s.name)).collect())
    }

    async fn list_archived(&self, request: &WalCleanupRequest<'_>, wal_directory: &str) -> anyhow::Result<Vec<String>> {
        let archive_dir = format!("{wal_directory}/archive_status");
        let out = self.exec_capture(request, vec!["ls", "-1", &archive_dir]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter_map(|l| l.strip_suffix(".done"))
            .filter(|name| is_wal_segment_name(name))
            .map(String::from)
            .collect())
    }

    async fn remove_file(&self, request: &WalCleanupRequest<'_>, path: &str) -> anyhow::Result<()> {
        self.exec_capture(request, vec!["rm", "-f", path]).await?;
        Ok(())
    }

    async fn exec_capture(&self, request: &WalCleanupRequest<'_>, command: Vec<&str>) -> anyhow::Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);
        let ap = AttachParams::default().container(request.container.as_str()).stdout(true).stderr(false);
        let mut attached = tokio::time::timeout(EXEC_TIMEOUT, pods.exec(&request.pod, command, &ap)).await??;

        let mut out = String::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout.read_to_string(&mut out).await?;
        }
        attached.join().await?;
        Ok(out)
    }
}

/// Rejects a configured WAL directory that would let `list`/`remove`
/// escape outside the directory tree the operator was told about.
fn sanitize_directory(wal_directory: &str) -> anyhow::Result<String> {
    if wal_directory.trim().is_empty() {
        anyhow::bail!("wal directory must not be empty");
    }
    if !wal_directory.starts_with('/') {
        anyhow::bail!("wal directory must be an absolute path: {wal_directory:?}");
    }
    if wal_directory.split('/').any(|segment| segment == "..") {
        anyhow::bail!("wal directory must not contain '..': {wal_directory:?}");
    }
    Ok(wal_directory.trim_end_matches('/').to_string())
}
