//! Per-transfer unit of work: turn one ready transfer (or one whole
//! session-reuse/multihop job) into a running external worker process.
//!
//! The executor is built on the dispatch-worker thread while that thread
//! still owns the handler, so bundled jobs can pull their sibling files
//! before a single process is launched for all of them. `run` then executes
//! on the pool and returns the number of files it actually scheduled.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::events::{now_millis, StatusPublisher, TransferStatus};
use crate::storage::StorageGateway;
use crate::transfer::{JobMode, TransferFile};

use super::handler::TransferFileHandler;

/// Collaborator handles shared by every executor of a dispatch pass.
#[derive(Clone)]
pub struct ExecutorContext {
    pub storage: Arc<dyn StorageGateway>,
    pub publisher: Arc<dyn StatusPublisher>,
    pub config: Arc<ServerConfig>,
}

/// Fully resolved worker-process invocation.
#[derive(Debug)]
pub struct UrlCopyCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl UrlCopyCommand {
    /// Builds the command line for one transfer, or for a bundled job when
    /// `bulk_file` is set (the worker then reads the file list from disk).
    pub fn build(
        files: &[TransferFile],
        proxy_path: &Path,
        debug_level: u32,
        config: &ServerConfig,
        bulk_file: Option<&Path>,
    ) -> Self {
        fn kv(args: &mut Vec<String>, key: &str, value: String) {
            args.push(key.to_string());
            args.push(value);
        }

        let lead = &files[0];
        let mut args: Vec<String> = Vec::new();

        kv(&mut args, "--job-id", lead.job_id.clone());
        match bulk_file {
            Some(list) => {
                match lead.job_mode {
                    JobMode::Multihop => args.push("--multi-hop".to_string()),
                    _ => args.push("--reuse".to_string()),
                }
                kv(&mut args, "--bulk-file", list.display().to_string());
            }
            None => {
                kv(&mut args, "--file-id", lead.file_id.to_string());
                kv(&mut args, "--source", lead.source_surl.clone());
                kv(&mut args, "--destination", lead.dest_surl.clone());
                if let Some(checksum) = &lead.checksum {
                    kv(&mut args, "--checksum", checksum.to_string());
                }
                kv(&mut args, "--user-filesize", lead.user_filesize.to_string());
                if let Some(metadata) = &lead.file_metadata {
                    kv(&mut args, "--file-metadata", metadata.clone());
                }
                kv(&mut args, "--activity", lead.activity.clone());
            }
        }

        kv(&mut args, "--vo", lead.vo_name.clone());
        kv(&mut args, "--user-dn", lead.user_dn.clone());
        kv(&mut args, "--proxy", proxy_path.display().to_string());
        kv(&mut args, "--log-dir", config.transfer_log_dir.display().to_string());
        kv(&mut args, "--alias", config.host_alias.clone());
        if !config.infosys.is_empty() {
            kv(&mut args, "--infosystem", config.infosys.clone());
        }
        if config.monitoring_enabled {
            args.push("--monitoring".to_string());
        }
        if debug_level > 0 {
            kv(&mut args, "--debug", debug_level.to_string());
        }

        UrlCopyCommand {
            program: config.url_copy_cmd.clone(),
            args,
        }
    }
}

pub struct FileTransferExecutor {
    files: Vec<TransferFile>,
    proxy_path: PathBuf,
    ctx: ExecutorContext,
    cancel: CancellationToken,
}

impl FileTransferExecutor {
    /// For bundled jobs the remaining sibling files are drained from the
    /// handler here, while the caller still owns it.
    pub fn new(
        file: TransferFile,
        handler: &mut TransferFileHandler,
        proxy_path: PathBuf,
        ctx: ExecutorContext,
        cancel: CancellationToken,
    ) -> Self {
        let mut files = vec![file];
        if files[0].job_mode.is_bundled() {
            let (vo, job_id) = (files[0].vo_name.clone(), files[0].job_id.clone());
            files.extend(handler.take_job_siblings(&vo, &job_id));
        }
        FileTransferExecutor {
            files,
            proxy_path,
            ctx,
            cancel,
        }
    }

    /// Number of files this executor will hand to one worker process.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Launches the worker process. Returns how many files were scheduled;
    /// 0 means nothing was (cancelled, or the launch failed and the files
    /// were marked FAILED).
    pub async fn run(self) -> usize {
        if self.cancel.is_cancelled() {
            return 0;
        }

        let lead = &self.files[0];
        let debug_level = match self
            .ctx
            .storage
            .get_debug_level(&lead.source_se, &lead.dest_se)
            .await
        {
            Ok(level) => level,
            Err(err) => {
                tracing::warn!(
                    job_id = %lead.job_id,
                    "debug level lookup failed, using 0: {err:#}"
                );
                0
            }
        };

        let bulk_file = if self.files.len() > 1 || lead.job_mode.is_bundled() {
            let path = self
                .ctx
                .config
                .messaging_dir
                .join(format!("{}.list", lead.job_id));
            if let Err(err) = write_bulk_file(&path, &self.files).await {
                tracing::error!(job_id = %lead.job_id, "cannot write bulk file: {err:#}");
                self.fail_all(&format!("Cannot write job file list: {err:#}"))
                    .await;
                return 0;
            }
            Some(path)
        } else {
            None
        };

        let command = UrlCopyCommand::build(
            &self.files,
            &self.proxy_path,
            debug_level,
            &self.ctx.config,
            bulk_file.as_deref(),
        );

        match self.spawn_worker(&command).await {
            Ok(pid) => {
                tracing::info!(
                    job_id = %lead.job_id,
                    pid,
                    files = self.files.len(),
                    "launched url-copy worker"
                );
                for file in &self.files {
                    if let Err(err) = self.ctx.storage.mark_ready(&file.job_id, file.file_id).await
                    {
                        tracing::warn!(
                            job_id = %file.job_id,
                            file_id = file.file_id,
                            "cannot mark file READY: {err:#}"
                        );
                    }
                    if self.ctx.config.monitoring_enabled {
                        let status = TransferStatus::dispatched(file, pid);
                        if let Err(err) = self.ctx.publisher.publish(&status).await {
                            tracing::warn!("cannot publish dispatch event: {err:#}");
                        }
                    }
                }
                self.files.len()
            }
            Err(err) => {
                tracing::error!(
                    job_id = %lead.job_id,
                    "failed to launch url-copy worker: {err:#}"
                );
                self.fail_all(&format!("Failed to spawn transfer process: {err:#}"))
                    .await;
                0
            }
        }
    }

    async fn spawn_worker(&self, command: &UrlCopyCommand) -> Result<u32> {
        let lead = &self.files[0];
        let log_dir = &self.ctx.config.transfer_log_dir;
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("create transfer log dir: {}", log_dir.display()))?;

        let log_path = log_dir.join(format!(
            "{}__{}__{}.log",
            now_millis(),
            lead.job_id,
            lead.file_id
        ));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open transfer log: {}", log_path.display()))?;
        let log_file_err = log_file.try_clone().context("clone transfer log handle")?;

        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .spawn()
            .with_context(|| format!("spawn {}", command.program))?;

        let pid = child.id().unwrap_or(0);

        // Reap in the background so finished workers don't linger; the
        // scheduler itself never waits on transfer completion.
        let job_id = lead.job_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::debug!(job_id = %job_id, pid, %status, "url-copy worker exited")
                }
                Err(err) => tracing::warn!(job_id = %job_id, pid, "worker wait failed: {err}"),
            }
        });

        Ok(pid)
    }

    async fn fail_all(&self, reason: &str) {
        for file in &self.files {
            if let Err(err) = self
                .ctx
                .storage
                .mark_failed(&file.job_id, file.file_id, reason)
                .await
            {
                tracing::error!(
                    job_id = %file.job_id,
                    file_id = file.file_id,
                    "cannot mark file FAILED: {err:#}"
                );
            }
            let status = TransferStatus::failed(file, reason, 0);
            if let Err(err) = self.ctx.publisher.publish(&status).await {
                tracing::warn!("cannot publish failure event: {err:#}");
            }
        }
    }
}

/// One line per file: id, source, destination, checksum, size, metadata.
/// Fields that are absent are written as `-` so the worker's parser sees a
/// fixed column count.
async fn write_bulk_file(path: &Path, files: &[TransferFile]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create spool dir: {}", parent.display()))?;
    }
    let mut body = String::new();
    for file in files {
        let checksum = file
            .checksum
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let metadata = file.file_metadata.clone().unwrap_or_else(|| "-".to_string());
        body.push_str(&format!(
            "{} {} {} {} {} {}\n",
            file.file_id, file.source_surl, file.dest_surl, checksum, file.user_filesize, metadata
        ));
    }
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("write bulk list: {}", path.display()))
}
