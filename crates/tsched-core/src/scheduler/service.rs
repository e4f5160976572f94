//! Top-level transfers service: the periodic scheduling loop and one
//! dispatch round.
//!
//! The loop sleeps for the configured interval, honors drain mode, and
//! otherwise runs a dispatch round: discover queues, shuffle, apply VO
//! shares, fail the unschedulable leftovers, and fan the admitted queues
//! out across parallel dispatch workers. Errors are swallowed here and
//! only here, so a broken round never takes the daemon down.

use anyhow::Result;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::events::{StatusPublisher, TransferStatus, NO_SHARE_ERRCODE, NO_SHARE_REASON};
use crate::storage::StorageGateway;
use crate::transfer::{QueueId, ScheduledQueue};

use super::executor::{ExecutorContext, FileTransferExecutor};
use super::handler::TransferFileHandler;
use super::pool::ExecutorPool;
use super::proxy::ProxyCache;
use super::shares::apply_vo_shares;
use super::Interrupted;

/// Extra wait between drain re-checks while the host is draining.
const DRAIN_COOLDOWN: Duration = Duration::from_secs(15);

/// Queue-order randomization between rounds. Injected so tests can pin
/// the order; the daemon decorrelates rounds with a real RNG.
pub trait QueueShuffler: Send + Sync {
    fn shuffle(&self, queues: &mut [QueueId]);
}

pub struct ThreadRngShuffler;

impl QueueShuffler for ThreadRngShuffler {
    fn shuffle(&self, queues: &mut [QueueId]) {
        queues.shuffle(&mut rand::rng());
    }
}

/// Keeps the discovery order. For deterministic runs and tests.
pub struct IdentityShuffler;

impl QueueShuffler for IdentityShuffler {
    fn shuffle(&self, _queues: &mut [QueueId]) {}
}

#[derive(Clone)]
pub struct TransfersService {
    storage: Arc<dyn StorageGateway>,
    publisher: Arc<dyn StatusPublisher>,
    config: Arc<ServerConfig>,
    shuffler: Arc<dyn QueueShuffler>,
}

impl TransfersService {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        publisher: Arc<dyn StatusPublisher>,
        config: Arc<ServerConfig>,
        shuffler: Arc<dyn QueueShuffler>,
    ) -> Self {
        TransfersService {
            storage,
            publisher,
            config,
            shuffler,
        }
    }

    /// Runs scheduling rounds until the token is cancelled. Transient
    /// errors are logged and the loop proceeds to the next interval;
    /// already-launched worker processes are never touched on shutdown.
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.scheduling_interval_secs.max(1));
        tracing::info!(
            interval_secs = interval.as_secs(),
            workers = self.config.dispatch_workers,
            "transfers service started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.storage.is_drain_active().await {
                Ok(true) => {
                    tracing::info!("drain mode set, no new transfers for this instance");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(DRAIN_COOLDOWN) => {}
                    }
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::error!("drain check failed: {err:#}");
                    continue;
                }
            }

            if let Err(err) = self.execute_dispatch_round(&cancel).await {
                if err.is::<Interrupted>() {
                    tracing::info!("dispatch interrupted, shutting down");
                    break;
                }
                tracing::error!("dispatch round failed: {err:#}");
            }

            if cancel.is_cancelled() {
                break;
            }
        }

        tracing::info!("transfers service stopped");
    }

    /// One dispatch round. Errors bubble up so `run` owns the single
    /// place where they are swallowed.
    pub async fn execute_dispatch_round(&self, cancel: &CancellationToken) -> Result<()> {
        let mut queues = self.storage.discover_pending_queues().await?;
        queues.extend(self.storage.discover_reuse_queues().await?);
        if queues.is_empty() {
            return Ok(());
        }
        self.shuffler.shuffle(&mut queues);

        let mut link_shares = HashMap::new();
        for queue in &queues {
            let link = queue.link();
            if !link_shares.contains_key(&link) {
                let rows = self
                    .storage
                    .get_link_shares(&queue.source_se, &queue.dest_se)
                    .await?;
                link_shares.insert(link, rows);
            }
        }

        let allocation = apply_vo_shares(
            queues,
            &link_shares,
            self.config.fetch_batch_size,
            self.config.default_share_weight,
        );
        self.fail_unschedulable(&allocation.unschedulable).await?;

        let schedulable = allocation.schedulable;
        if schedulable.is_empty() {
            return Ok(());
        }
        if schedulable.len() == 1 {
            return self.process_queues(schedulable, cancel.clone()).await;
        }

        let mut workers = JoinSet::new();
        for slice in partition(schedulable, self.config.dispatch_workers) {
            let service = self.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { service.process_queues(slice, cancel).await });
        }

        let mut interrupted = false;
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is::<Interrupted>() => interrupted = true,
                Ok(Err(err)) => tracing::error!("dispatch worker failed: {err:#}"),
                Err(err) => tracing::error!("dispatch worker panicked: {err}"),
            }
        }
        if interrupted {
            return Err(Interrupted.into());
        }
        Ok(())
    }

    /// Transfers queued on unschedulable queues are failed with an
    /// explicit reason; an expected outcome, not an error.
    async fn fail_unschedulable(&self, unschedulable: &[QueueId]) -> Result<()> {
        if unschedulable.is_empty() {
            return Ok(());
        }
        let fetch: Vec<ScheduledQueue> = unschedulable
            .iter()
            .map(|queue| ScheduledQueue {
                queue: queue.clone(),
                quota: self.config.fetch_batch_size,
            })
            .collect();
        let vo_queues = self.storage.fetch_ready_transfers(&fetch).await?;

        let mut failed = 0usize;
        for files in vo_queues.values() {
            for file in files {
                self.storage
                    .mark_failed(&file.job_id, file.file_id, NO_SHARE_REASON)
                    .await?;
                let status = TransferStatus::failed(file, NO_SHARE_REASON, NO_SHARE_ERRCODE);
                if let Err(err) = self.publisher.publish(&status).await {
                    tracing::warn!("cannot publish no-share failure: {err:#}");
                }
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::info!(
                failed,
                queues = unschedulable.len(),
                "failed transfers queued on unschedulable queues"
            );
        }
        Ok(())
    }

    /// One dispatch worker's pass over its slice of admitted queues:
    /// fetch ready transfers, sweep the VOs round-robin, and feed the
    /// executor pool until the slice or the process cap is exhausted.
    pub async fn process_queues(
        &self,
        queues: Vec<ScheduledQueue>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if queues.is_empty() {
            return Ok(());
        }
        let vo_queues = self.storage.fetch_ready_transfers(&queues).await?;
        if vo_queues.is_empty() {
            return Ok(());
        }

        let mut handler = TransferFileHandler::new(vo_queues);
        let initial_size = handler.size();

        let max_processes = self.config.max_url_copy_processes;
        let mut url_copy_count = self
            .storage
            .count_url_copy_processes(&self.config.url_copy_cmd)
            .await?;

        let mut proxies = ProxyCache::new(self.storage.clone());
        let mut pool = ExecutorPool::new(self.config.exec_pool_size, &cancel);
        let ctx = ExecutorContext {
            storage: self.storage.clone(),
            publisher: self.publisher.clone(),
            config: self.config.clone(),
        };

        'sweep: while !handler.is_empty() {
            for vo in handler.vos() {
                if cancel.is_cancelled() {
                    pool.interrupt();
                    pool.join().await;
                    return Err(Interrupted.into());
                }

                let Some(file) = handler.get(&vo) else { continue };

                // Records missing identity fields cannot be dispatched.
                if file.file_id == 0 || file.user_dn.is_empty() || file.cred_id.is_empty() {
                    tracing::warn!(job_id = %file.job_id, "skipping malformed transfer record");
                    continue;
                }

                let proxy_path = match proxies.proxy_for(&file.cred_id, &file.user_dn).await {
                    Ok(path) => path,
                    Err(err) => {
                        let reason = format!("Failed to fetch delegated credentials: {err:#}");
                        if let Err(err) = self
                            .storage
                            .mark_failed(&file.job_id, file.file_id, &reason)
                            .await
                        {
                            tracing::error!(
                                job_id = %file.job_id,
                                file_id = file.file_id,
                                "cannot mark file FAILED: {err:#}"
                            );
                        }
                        let status = TransferStatus::failed(&file, &reason, 0);
                        if let Err(err) = self.publisher.publish(&status).await {
                            tracing::warn!("cannot publish credential failure: {err:#}");
                        }
                        continue;
                    }
                };

                if max_processes > 0 && url_copy_count >= max_processes {
                    tracing::warn!(
                        url_copy_count,
                        max_processes,
                        "reached the url-copy process cap, deferring the rest of this pass"
                    );
                    break 'sweep;
                }

                let executor = FileTransferExecutor::new(
                    file,
                    &mut handler,
                    proxy_path,
                    ctx.clone(),
                    pool.token(),
                );
                url_copy_count += 1;
                pool.start(executor.run()).await;
            }
        }

        let scheduled = pool.join().await;
        tracing::info!(
            files = initial_size,
            scheduled,
            "dispatch worker pass complete"
        );
        Ok(())
    }
}

/// Splits the admitted queues into up to `workers` disjoint contiguous
/// slices; short inputs produce fewer slices rather than empty ones.
fn partition(queues: Vec<ScheduledQueue>, workers: usize) -> Vec<Vec<ScheduledQueue>> {
    let chunk = queues.len().div_ceil(workers.max(1)).max(1);
    queues.chunks(chunk).map(<[ScheduledQueue]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{collected_events, test_file, test_queue, FakePublisher, FakeStorage};
    use crate::transfer::{JobMode, QueueKind};
    use std::path::Path;

    fn test_config(dir: &Path) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            url_copy_cmd: "true".to_string(),
            transfer_log_dir: dir.join("log"),
            messaging_dir: dir.join("spool"),
            exec_pool_size: 2,
            scheduling_interval_secs: 2,
            dispatch_workers: 2,
            fetch_batch_size: 8,
            ..ServerConfig::default()
        })
    }

    fn service(
        storage: Arc<FakeStorage>,
        publisher: Arc<FakePublisher>,
        config: Arc<ServerConfig>,
    ) -> TransfersService {
        TransfersService::new(storage, publisher, config, Arc::new(IdentityShuffler))
    }

    #[tokio::test]
    async fn round_dispatches_admitted_and_fails_unschedulable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::new());
        let publisher = Arc::new(FakePublisher::default());

        // s1->d1 has a share for atlas only; s2->d2 has no configuration.
        storage.put_share("gsiftp://s1.org", "gsiftp://d1.org", "atlas", 1);
        storage.put_credential("cred-1", "/DC=org/CN=user", "/tmp/proxy");

        let atlas = test_queue("gsiftp://s1.org", "gsiftp://d1.org", "atlas", QueueKind::Regular);
        let dteam = test_queue("gsiftp://s1.org", "gsiftp://d1.org", "dteam", QueueKind::Regular);
        let cms = test_queue("gsiftp://s2.org", "gsiftp://d2.org", "cms", QueueKind::Regular);
        storage.seed_queue(
            atlas.clone(),
            (1..=3).map(|i| test_file(&atlas, "job-a", i, JobMode::Regular)).collect(),
        );
        storage.seed_queue(
            dteam.clone(),
            (4..=5).map(|i| test_file(&dteam, "job-d", i, JobMode::Regular)).collect(),
        );
        storage.seed_queue(
            cms.clone(),
            (6..=7).map(|i| test_file(&cms, "job-c", i, JobMode::Regular)).collect(),
        );

        let svc = service(storage.clone(), publisher.clone(), test_config(dir.path()));
        svc.execute_dispatch_round(&CancellationToken::new())
            .await
            .unwrap();

        let ready = storage.ready_marks();
        let failed = storage.failed_marks();
        assert_eq!(ready.len(), 5);
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|(job, _, reason)| {
            job == "job-d" && reason == NO_SHARE_REASON
        }));
        // Conservation: every fetched file was either dispatched or failed.
        assert_eq!(storage.pending_total(), 0);

        let events = collected_events(&publisher);
        assert_eq!(events.iter().filter(|e| e.transfer_status == "READY").count(), 5);
        assert_eq!(events.iter().filter(|e| e.transfer_status == "FAILED").count(), 2);
    }

    #[tokio::test]
    async fn single_schedulable_queue_is_dispatched_inline() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::new());
        let publisher = Arc::new(FakePublisher::default());
        storage.put_credential("cred-1", "/DC=org/CN=user", "/tmp/proxy");

        let queue = test_queue("gsiftp://s.org", "gsiftp://d.org", "atlas", QueueKind::Regular);
        storage.seed_queue(
            queue.clone(),
            vec![test_file(&queue, "job-1", 1, JobMode::Regular)],
        );

        let svc = service(storage.clone(), publisher, test_config(dir.path()));
        svc.execute_dispatch_round(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(storage.ready_marks(), vec![("job-1".to_string(), 1)]);
    }

    #[tokio::test]
    async fn dispatch_ratio_follows_share_weights() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::new());
        let publisher = Arc::new(FakePublisher::default());

        storage.put_share("gsiftp://s.org", "gsiftp://d.org", "atlas", 3);
        storage.put_share("gsiftp://s.org", "gsiftp://d.org", "cms", 1);
        storage.put_credential("cred-1", "/DC=org/CN=user", "/tmp/proxy");

        let atlas = test_queue("gsiftp://s.org", "gsiftp://d.org", "atlas", QueueKind::Regular);
        let cms = test_queue("gsiftp://s.org", "gsiftp://d.org", "cms", QueueKind::Regular);
        storage.seed_queue(
            atlas.clone(),
            (1..=60).map(|i| test_file(&atlas, "job-a", i, JobMode::Regular)).collect(),
        );
        storage.seed_queue(
            cms.clone(),
            (101..=160).map(|i| test_file(&cms, "job-c", i, JobMode::Regular)).collect(),
        );

        let svc = service(storage.clone(), publisher, test_config(dir.path()));
        for _ in 0..5 {
            svc.execute_dispatch_round(&CancellationToken::new())
                .await
                .unwrap();
        }

        let ready = storage.ready_marks();
        let atlas_count = ready.iter().filter(|(job, _)| job == "job-a").count() as f64;
        let cms_count = ready.iter().filter(|(job, _)| job == "job-c").count() as f64;
        assert!(cms_count > 0.0);
        let ratio = atlas_count / cms_count;
        // Convergence to the configured 3:1 is statistical, not exact.
        assert!((2.0..=4.0).contains(&ratio), "ratio was {ratio}");
    }

    #[tokio::test(start_paused = true)]
    async fn drain_mode_makes_no_dispatch_calls() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::new());
        let publisher = Arc::new(FakePublisher::default());
        storage.set_drain(true);

        let queue = test_queue("gsiftp://s.org", "gsiftp://d.org", "atlas", QueueKind::Regular);
        storage.seed_queue(
            queue.clone(),
            vec![test_file(&queue, "job-1", 1, JobMode::Regular)],
        );

        let svc = service(storage.clone(), publisher, test_config(dir.path()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { svc.run(cancel).await }
        });

        // Several intervals plus drain cool-downs of virtual time.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(storage.drain_checks() >= 2);
        assert_eq!(storage.dispatch_calls(), 0);
        assert!(storage.ready_marks().is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_pass_returns_interrupted_and_marks_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::new());
        let publisher = Arc::new(FakePublisher::default());
        storage.put_credential("cred-1", "/DC=org/CN=user", "/tmp/proxy");

        let queue = test_queue("gsiftp://s.org", "gsiftp://d.org", "atlas", QueueKind::Regular);
        storage.seed_queue(
            queue.clone(),
            (1..=4).map(|i| test_file(&queue, "job-1", i, JobMode::Regular)).collect(),
        );

        let svc = service(storage.clone(), publisher, test_config(dir.path()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let scheduled = vec![ScheduledQueue { queue, quota: 8 }];
        let err = svc.process_queues(scheduled, cancel).await.unwrap_err();
        assert!(err.is::<Interrupted>());
        assert!(storage.ready_marks().is_empty());
        assert!(storage.failed_marks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_cleanly_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::new());
        let publisher = Arc::new(FakePublisher::default());

        let svc = service(storage, publisher, test_config(dir.path()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { svc.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn process_cap_stops_further_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::new());
        let publisher = Arc::new(FakePublisher::default());
        storage.put_credential("cred-1", "/DC=org/CN=user", "/tmp/proxy");
        storage.set_census(2);

        let queue = test_queue("gsiftp://s.org", "gsiftp://d.org", "atlas", QueueKind::Regular);
        storage.seed_queue(
            queue.clone(),
            (1..=5).map(|i| test_file(&queue, "job-1", i, JobMode::Regular)).collect(),
        );

        let config = Arc::new(ServerConfig {
            max_url_copy_processes: 4,
            ..(*test_config(dir.path())).clone()
        });
        let svc = service(storage.clone(), publisher, config);
        let scheduled = vec![ScheduledQueue { queue, quota: 8 }];
        svc.process_queues(scheduled, CancellationToken::new())
            .await
            .unwrap();

        // Census said 2 of 4 slots were taken host-wide; only 2 more fit,
        // and the remaining files stay pending for the next round.
        assert_eq!(storage.ready_marks().len(), 2);
        assert_eq!(storage.pending_total(), 3);
    }

    #[tokio::test]
    async fn cap_already_reached_submits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::new());
        let publisher = Arc::new(FakePublisher::default());
        storage.put_credential("cred-1", "/DC=org/CN=user", "/tmp/proxy");
        storage.set_census(10);

        let queue = test_queue("gsiftp://s.org", "gsiftp://d.org", "atlas", QueueKind::Regular);
        storage.seed_queue(
            queue.clone(),
            (1..=3).map(|i| test_file(&queue, "job-1", i, JobMode::Regular)).collect(),
        );

        let config = Arc::new(ServerConfig {
            max_url_copy_processes: 4,
            ..(*test_config(dir.path())).clone()
        });
        let svc = service(storage.clone(), publisher, config);
        let scheduled = vec![ScheduledQueue { queue, quota: 8 }];
        svc.process_queues(scheduled, CancellationToken::new())
            .await
            .unwrap();

        assert!(storage.ready_marks().is_empty());
        assert_eq!(storage.pending_total(), 3);
    }

    #[tokio::test]
    async fn missing_credential_fails_only_the_affected_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::new());
        let publisher = Arc::new(FakePublisher::default());
        // Only job-b's credential exists.
        storage.put_credential("cred-b", "/DC=org/CN=user", "/tmp/proxy-b");

        let queue = test_queue("gsiftp://s.org", "gsiftp://d.org", "atlas", QueueKind::Regular);
        let mut orphan = test_file(&queue, "job-a", 1, JobMode::Regular);
        orphan.cred_id = "cred-a".to_string();
        let mut good = test_file(&queue, "job-b", 2, JobMode::Regular);
        good.cred_id = "cred-b".to_string();
        storage.seed_queue(queue.clone(), vec![orphan, good]);

        let svc = service(storage.clone(), publisher.clone(), test_config(dir.path()));
        let scheduled = vec![ScheduledQueue { queue, quota: 8 }];
        svc.process_queues(scheduled, CancellationToken::new())
            .await
            .unwrap();

        let failed = storage.failed_marks();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "job-a");
        assert!(failed[0].2.contains("Failed to fetch delegated credentials"));
        assert_eq!(storage.ready_marks(), vec![("job-b".to_string(), 2)]);
    }

    #[tokio::test]
    async fn shared_credentials_resolve_once_per_pass() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::new());
        let publisher = Arc::new(FakePublisher::default());
        storage.put_credential("cred-1", "/DC=org/CN=user", "/tmp/proxy");

        let queue = test_queue("gsiftp://s.org", "gsiftp://d.org", "atlas", QueueKind::Regular);
        storage.seed_queue(
            queue.clone(),
            (1..=20).map(|i| test_file(&queue, "job-1", i, JobMode::Regular)).collect(),
        );

        let svc = service(storage.clone(), publisher, test_config(dir.path()));
        let scheduled = vec![ScheduledQueue { queue, quota: 100 }];
        svc.process_queues(scheduled, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(storage.ready_marks().len(), 20);
        assert_eq!(storage.proxy_resolutions(), 1);
    }

    #[test]
    fn partition_splits_contiguously() {
        let queue = test_queue("s", "d", "vo", QueueKind::Regular);
        let queues: Vec<ScheduledQueue> = (0..10)
            .map(|_| ScheduledQueue {
                queue: queue.clone(),
                quota: 1,
            })
            .collect();

        let slices = partition(queues.clone(), 4);
        assert_eq!(slices.len(), 4);
        assert_eq!(slices.iter().map(Vec::len).sum::<usize>(), 10);
        assert!(slices.iter().all(|s| !s.is_empty()));

        // Fewer queues than workers produce fewer slices, never empty ones.
        let slices = partition(queues[..2].to_vec(), 4);
        assert_eq!(slices.len(), 2);

        let slices = partition(queues, 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 10);
    }
}
