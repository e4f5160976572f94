//! Transfer status events for the monitoring channel.
//!
//! The scheduler publishes one status record per failed or dispatched
//! transfer. `DirPublisher` is the spool-directory edition: one JSON
//! document per event under `<messaging_dir>/status/`, written to a temp
//! name and renamed so consumers never see partial documents.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::transfer::TransferFile;

/// Errcode attached to transfers failed because their VO has no share.
pub const NO_SHARE_ERRCODE: i32 = 1;

/// Failure reason for transfers queued on an unschedulable queue.
pub const NO_SHARE_REASON: &str = "No share configured for this VO";

/// One monitoring record, mirroring what the worker-process status channel
/// emits so consumers see a single format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStatus {
    pub job_id: String,
    pub file_id: i64,
    pub transfer_status: String,
    pub source_se: String,
    pub dest_se: String,
    pub timestamp_ms: u64,
    pub transfer_message: String,
    pub retry: bool,
    pub errcode: i32,
    pub process_id: u32,
}

impl TransferStatus {
    /// Record for a transfer failed by the scheduler itself.
    pub fn failed(tf: &TransferFile, reason: &str, errcode: i32) -> Self {
        TransferStatus {
            job_id: tf.job_id.clone(),
            file_id: tf.file_id,
            transfer_status: "FAILED".to_string(),
            source_se: tf.source_se.clone(),
            dest_se: tf.dest_se.clone(),
            timestamp_ms: now_millis(),
            transfer_message: reason.to_string(),
            retry: false,
            errcode,
            process_id: 0,
        }
    }

    /// Record for a transfer handed to a worker process.
    pub fn dispatched(tf: &TransferFile, process_id: u32) -> Self {
        TransferStatus {
            job_id: tf.job_id.clone(),
            file_id: tf.file_id,
            transfer_status: "READY".to_string(),
            source_se: tf.source_se.clone(),
            dest_se: tf.dest_se.clone(),
            timestamp_ms: now_millis(),
            transfer_message: String::new(),
            retry: false,
            errcode: 0,
            process_id,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Sink for status records. The daemon injects one handle and passes it to
/// every component that publishes, so there is a single producer per
/// process rather than ad-hoc reconnects.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, status: &TransferStatus) -> Result<()>;
}

/// Spool-directory publisher.
pub struct DirPublisher {
    status_dir: PathBuf,
    seq: AtomicU64,
}

impl DirPublisher {
    /// Creates `<messaging_dir>/status` if needed.
    pub fn new(messaging_dir: &std::path::Path) -> Result<Self> {
        let status_dir = messaging_dir.join("status");
        std::fs::create_dir_all(&status_dir)
            .with_context(|| format!("create status spool dir: {}", status_dir.display()))?;
        Ok(DirPublisher {
            status_dir,
            seq: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl StatusPublisher for DirPublisher {
    async fn publish(&self, status: &TransferStatus) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}_{:06}.json", status.timestamp_ms, seq);
        let tmp_path = self.status_dir.join(format!(".{name}.tmp"));
        let final_path = self.status_dir.join(name);

        let body = serde_json::to_vec(status)?;
        tokio::fs::write(&tmp_path, &body)
            .await
            .with_context(|| format!("write status event: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("publish status event: {}", final_path.display()))?;
        Ok(())
    }
}
