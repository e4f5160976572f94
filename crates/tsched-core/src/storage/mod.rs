//! Storage gateway: the one resource shared across every scheduler thread.
//!
//! The scheduling core only ever talks to the [`StorageGateway`] trait and
//! receives its handle at construction, so the whole engine runs against a
//! fake in tests and against [`SqlStorage`] in the daemon. Every call is an
//! atomic request/response; the core holds no cross-call locks on it.

mod sql;

pub use sql::{FileRow, FileSubmission, JobRow, JobSubmission, SqlStorage};

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

use crate::transfer::{QueueId, ScheduledQueue, ShareConfig, VoQueueMap};

#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Queues (link + VO) holding at least one SUBMITTED plain transfer.
    async fn discover_pending_queues(&self) -> Result<Vec<QueueId>>;

    /// Queues holding pending session-reuse or multihop jobs.
    async fn discover_reuse_queues(&self) -> Result<Vec<QueueId>>;

    /// Ready transfers for the given queues, keyed by VO. Each queue
    /// contributes at most its quota of files; reuse queues yield whole
    /// jobs with their files adjacent so a single worker invocation can
    /// carry the job.
    async fn fetch_ready_transfers(&self, queues: &[ScheduledQueue]) -> Result<VoQueueMap>;

    /// Local path of the delegated proxy for this credential and user.
    async fn resolve_proxy(&self, cred_id: &str, user_dn: &str) -> Result<PathBuf>;

    /// Dispatch bookkeeping: SUBMITTED -> READY once a worker carries the file.
    async fn mark_ready(&self, job_id: &str, file_id: i64) -> Result<()>;

    /// SUBMITTED -> FAILED with an explicit reason (no share, launch
    /// failure, missing credential).
    async fn mark_failed(&self, job_id: &str, file_id: i64, reason: &str) -> Result<()>;

    /// VO share rows configured for a link. Empty means no configuration
    /// at all (auto allocation applies).
    async fn get_link_shares(&self, source_se: &str, dest_se: &str) -> Result<Vec<ShareConfig>>;

    /// Debug level configured for a storage pair; 0 means none.
    async fn get_debug_level(&self, source_se: &str, dest_se: &str) -> Result<u32>;

    /// Host-wide census of live worker processes with the given name.
    async fn count_url_copy_processes(&self, name: &str) -> Result<usize>;

    /// Whether this host is draining (dispatch suspended, in-flight
    /// transfers left to finish).
    async fn is_drain_active(&self) -> Result<bool>;
}
