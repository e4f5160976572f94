//! In-memory fakes of the storage gateway and status publisher, shared by
//! the scheduler tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::events::{StatusPublisher, TransferStatus};
use crate::storage::StorageGateway;
use crate::transfer::{
    JobMode, QueueId, QueueKind, ScheduledQueue, ShareConfig, TransferFile, VoQueueMap,
};

#[derive(Default)]
struct FakeState {
    pending: Vec<(QueueId, Vec<TransferFile>)>,
    shares: HashMap<(String, String), Vec<ShareConfig>>,
    credentials: HashMap<(String, String), PathBuf>,
    ready: Vec<(String, i64)>,
    failed: Vec<(String, i64, String)>,
}

/// Gateway fake: seeded queues stay pending until marked READY or FAILED,
/// mirroring how the real database only forgets SUBMITTED rows once their
/// state moves on.
#[derive(Default)]
pub struct FakeStorage {
    state: Mutex<FakeState>,
    drain: AtomicBool,
    census: AtomicUsize,
    resolve_calls: AtomicUsize,
    dispatch_calls: AtomicUsize,
    drain_checks: AtomicUsize,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_queue(&self, queue: QueueId, files: Vec<TransferFile>) {
        self.state.lock().unwrap().pending.push((queue, files));
    }

    pub fn put_share(&self, source_se: &str, dest_se: &str, vo: &str, weight: u32) {
        self.state
            .lock()
            .unwrap()
            .shares
            .entry((source_se.to_string(), dest_se.to_string()))
            .or_default()
            .push(ShareConfig {
                vo_name: vo.to_string(),
                weight,
            });
    }

    pub fn put_credential(&self, cred_id: &str, user_dn: &str, proxy_path: &str) {
        self.state
            .lock()
            .unwrap()
            .credentials
            .insert((cred_id.to_string(), user_dn.to_string()), PathBuf::from(proxy_path));
    }

    pub fn set_drain(&self, active: bool) {
        self.drain.store(active, Ordering::SeqCst);
    }

    pub fn set_census(&self, count: usize) {
        self.census.store(count, Ordering::SeqCst);
    }

    /// Gateway calls that belong to dispatching (discovery + fetch).
    pub fn dispatch_calls(&self) -> usize {
        self.dispatch_calls.load(Ordering::SeqCst)
    }

    pub fn drain_checks(&self) -> usize {
        self.drain_checks.load(Ordering::SeqCst)
    }

    pub fn proxy_resolutions(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn ready_marks(&self) -> Vec<(String, i64)> {
        self.state.lock().unwrap().ready.clone()
    }

    pub fn failed_marks(&self) -> Vec<(String, i64, String)> {
        self.state.lock().unwrap().failed.clone()
    }

    /// Files still waiting to be scheduled.
    pub fn pending_total(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|(_, files)| files.len())
            .sum()
    }

    fn remove_pending(state: &mut FakeState, job_id: &str, file_id: i64) {
        for (_, files) in state.pending.iter_mut() {
            files.retain(|f| !(f.job_id == job_id && f.file_id == file_id));
        }
    }
}

#[async_trait]
impl StorageGateway for FakeStorage {
    async fn discover_pending_queues(&self) -> Result<Vec<QueueId>> {
        self.dispatch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .unwrap()
            .pending
            .iter()
            .filter(|(q, files)| q.kind == QueueKind::Regular && !files.is_empty())
            .map(|(q, _)| q.clone())
            .collect())
    }

    async fn discover_reuse_queues(&self) -> Result<Vec<QueueId>> {
        self.dispatch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .unwrap()
            .pending
            .iter()
            .filter(|(q, files)| q.kind == QueueKind::Reuse && !files.is_empty())
            .map(|(q, _)| q.clone())
            .collect())
    }

    async fn fetch_ready_transfers(&self, queues: &[ScheduledQueue]) -> Result<VoQueueMap> {
        self.dispatch_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let mut out = VoQueueMap::new();
        for scheduled in queues {
            let Some((_, files)) = state.pending.iter().find(|(q, _)| *q == scheduled.queue)
            else {
                continue;
            };
            let take = if scheduled.queue.kind == QueueKind::Reuse {
                files.len()
            } else {
                scheduled.quota.min(files.len())
            };
            let entry = out.entry(scheduled.queue.vo_name.clone()).or_default();
            entry.extend(files.iter().take(take).cloned());
        }
        Ok(out)
    }

    async fn resolve_proxy(&self, cred_id: &str, user_dn: &str) -> Result<PathBuf> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .credentials
            .get(&(cred_id.to_string(), user_dn.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("no delegated credential for id {cred_id}"))
    }

    async fn mark_ready(&self, job_id: &str, file_id: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::remove_pending(&mut state, job_id, file_id);
        state.ready.push((job_id.to_string(), file_id));
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, file_id: i64, reason: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::remove_pending(&mut state, job_id, file_id);
        state
            .failed
            .push((job_id.to_string(), file_id, reason.to_string()));
        Ok(())
    }

    async fn get_link_shares(&self, source_se: &str, dest_se: &str) -> Result<Vec<ShareConfig>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .shares
            .get(&(source_se.to_string(), dest_se.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_debug_level(&self, _source_se: &str, _dest_se: &str) -> Result<u32> {
        Ok(0)
    }

    async fn count_url_copy_processes(&self, _name: &str) -> Result<usize> {
        Ok(self.census.load(Ordering::SeqCst))
    }

    async fn is_drain_active(&self) -> Result<bool> {
        self.drain_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.drain.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct FakePublisher {
    events: Mutex<Vec<TransferStatus>>,
}

#[async_trait]
impl StatusPublisher for FakePublisher {
    async fn publish(&self, status: &TransferStatus) -> Result<()> {
        self.events.lock().unwrap().push(status.clone());
        Ok(())
    }
}

pub fn collected_events(publisher: &FakePublisher) -> Vec<TransferStatus> {
    publisher.events.lock().unwrap().clone()
}

pub fn test_queue(source_se: &str, dest_se: &str, vo: &str, kind: QueueKind) -> QueueId {
    QueueId {
        source_se: source_se.to_string(),
        dest_se: dest_se.to_string(),
        vo_name: vo.to_string(),
        kind,
    }
}

pub fn test_file(queue: &QueueId, job_id: &str, file_id: i64, mode: JobMode) -> TransferFile {
    TransferFile {
        file_id,
        job_id: job_id.to_string(),
        vo_name: queue.vo_name.clone(),
        user_dn: "/DC=org/CN=user".to_string(),
        cred_id: "cred-1".to_string(),
        source_se: queue.source_se.clone(),
        dest_se: queue.dest_se.clone(),
        source_surl: format!("{}/f{file_id}", queue.source_se),
        dest_surl: format!("{}/f{file_id}", queue.dest_se),
        checksum: None,
        user_filesize: 0,
        file_metadata: None,
        activity: "default".to_string(),
        job_mode: mode,
    }
}
