use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use chrono::{DateTime, Local};
use wifi_capture_schemas::models::Band;
use wifi_capture_schemas::settings::SnifferSettings;
use crate::remote::RemoteExecutor;

/// Result of pulling one remote file. A missing remote file is an expected,
/// common case (capture never wrote anything) and is success shaped.
#[derive(Debug, PartialEq)]
pub enum FileOutcome {
    Written(u64),
    NoFile,
}

#[derive(Debug, Clone)]
pub struct RetrievedFile {
    pub local_path: PathBuf,
    pub bytes: u64,
}

/// Everything that was pulled for one capture stop. `failed` lists the remote
/// parts that could not be retrieved, so a partial loss is never silent.
#[derive(Debug)]
pub enum RetrievalOutcome {
    Files {
        files: Vec<RetrievedFile>,
        failed: Vec<String>,
    },
    NoFile,
}

/// Pulls capture artefacts off the router by streaming a remote `cat` through
/// the execution channel, since the router exposes no file transfer service.
/// Files are written to a temporary name and persisted atomically so a failed
/// transfer never leaves a partial file at the final path.
pub struct FileRetriever {
    executor: Arc<dyn RemoteExecutor>,
    settings: SnifferSettings,
}

impl FileRetriever {
    pub fn new(executor: Arc<dyn RemoteExecutor>, settings: SnifferSettings) -> Self {
        Self { executor, settings }
    }

    /// Pull every part the capture produced for `band` under `remote_base`,
    /// naming the local files after the capture stop time, then delete each
    /// remote part after its successful local write. Deletion is per file so
    /// one failure does not block the siblings.
    pub async fn retrieve_capture(
        &self,
        band: Band,
        remote_base: &str,
        stopped_at: DateTime<Local>,
    ) -> anyhow::Result<RetrievalOutcome> {
        let command_timeout = Duration::from_secs(self.settings.command_timeout_secs);
        let listing = self
            .executor
            .execute(&format!("ls -1 {remote_base}* 2>/dev/null"), command_timeout)
            .await;
        let remote_files = match listing {
            Ok(result) if result.success() => sort_rotation_order(remote_base, &result.stdout),
            _ => Vec::new(),
        };
        if remote_files.is_empty() {
            tracing::info!("no capture file on router for {band}");
            return Ok(RetrievalOutcome::NoFile);
        }

        std::fs::create_dir_all(&self.settings.download_dir)
            .context("creating download folder")?;

        let timestamp = stopped_at.format("%Y%m%d_%H%M%S");
        let multi_part = remote_files.len() > 1;
        let mut retrieved = Vec::new();
        let mut failed = Vec::new();
        for (index, remote_file) in remote_files.iter().enumerate() {
            let local_name = if multi_part {
                format!("{band}_sniffer_{timestamp}_part{:03}.pcap", index + 1)
            } else {
                format!("{band}_sniffer_{timestamp}.pcap")
            };
            let local_path = self.settings.download_dir.join(&local_name);
            match self.retrieve_file(remote_file, &local_path).await {
                Ok(FileOutcome::Written(bytes)) => {
                    tracing::info!("retrieved {remote_file} -> {local_name} ({bytes} bytes)");
                    retrieved.push(RetrievedFile { local_path, bytes });
                    // remove the remote copy now that the local write is safe
                    let delete = self
                        .executor
                        .execute(&format!("rm -f {remote_file}"), command_timeout)
                        .await;
                    if let Err(err) = delete {
                        tracing::warn!("could not delete remote file {remote_file}: {err}");
                    }
                }
                Ok(FileOutcome::NoFile) => {
                    tracing::warn!("remote file {remote_file} vanished before retrieval");
                    failed.push(remote_file.clone());
                }
                Err(err) => {
                    tracing::warn!("retrieving {remote_file} failed: {err:#}");
                    failed.push(remote_file.clone());
                }
            }
        }
        if retrieved.is_empty() {
            anyhow::bail!("found {} remote file(s) but retrieved none", remote_files.len());
        }
        Ok(RetrievalOutcome::Files {
            files: retrieved,
            failed,
        })
    }

    /// Pull one remote file into `local_path`. Uses the long retrieval timeout,
    /// captures can be far larger than any control command output.
    pub async fn retrieve_file(
        &self,
        remote_path: &str,
        local_path: &Path,
    ) -> anyhow::Result<FileOutcome> {
        let retrieval_timeout = Duration::from_secs(self.settings.retrieval_timeout_secs);
        let staging = tempfile::NamedTempFile::new_in(&self.settings.download_dir)
            .context("creating staging file for retrieval")?;
        let result = self
            .executor
            .execute_streamed(&format!("cat {remote_path}"), retrieval_timeout, staging.path())
            .await
            .context("streaming remote file")?;
        if !result.success() {
            if result.stderr.contains("No such file") {
                return Ok(FileOutcome::NoFile);
            }
            anyhow::bail!(
                "remote read of {remote_path} exited {}: {}",
                result.exit_status,
                result.stderr.trim()
            );
        }
        let bytes = staging
            .as_file()
            .metadata()
            .context("reading staged file size")?
            .len();
        staging
            .persist(local_path)
            .context("moving staged file into place")?;
        Ok(FileOutcome::Written(bytes))
    }
}

/// Order the remote part files the way tcpdump rotated them, the bare base file
/// first and then numeric suffixes ascending. A plain `ls` sorts lexically
/// which puts part 10 before part 2.
fn sort_rotation_order(remote_base: &str, listing: &str) -> Vec<String> {
    let mut files: Vec<String> = listing
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    files.sort_by_key(|f| {
        f.strip_prefix(remote_base)
            .and_then(|suffix| {
                if suffix.is_empty() {
                    Some(0u64)
                } else {
                    suffix.parse::<u64>().ok()
                }
            })
            .unwrap_or(u64::MAX)
    });
    files
}
