//! SQLite edition of the storage gateway (sqlx).
//!
//! Holds jobs, files, share configuration, delegated credentials, per-pair
//! debug levels, and the drain flag. The daemon and the CLI share this
//! type; tests run it against in-memory databases.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::StorageGateway;
use crate::transfer::{
    storage_element_of, Checksum, FileState, JobMode, QueueId, QueueKind, ScheduledQueue,
    ShareConfig, TransferFile, VoQueueMap,
};

/// One file of a job submission.
#[derive(Debug, Clone)]
pub struct FileSubmission {
    pub source_surl: String,
    pub dest_surl: String,
    pub checksum: Option<Checksum>,
    pub filesize: u64,
    pub metadata: Option<String>,
    pub activity: String,
}

/// A transfer job: credential, VO, mode, and one or more files.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub vo_name: String,
    pub user_dn: String,
    pub cred_id: String,
    pub mode: JobMode,
    pub files: Vec<FileSubmission>,
}

/// Summary row for the CLI `status` command.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_id: String,
    pub job_state: String,
    pub vo_name: String,
    pub mode: JobMode,
    pub file_total: i64,
    pub file_failed: i64,
    pub file_finished: i64,
}

/// Per-file detail row for the CLI `status --job` view.
#[derive(Debug, Clone)]
pub struct FileRow {
    pub file_id: i64,
    pub file_state: FileState,
    pub source_surl: String,
    pub dest_surl: String,
    pub reason: Option<String>,
}

/// Handle to the SQLite-backed transfer database.
#[derive(Clone)]
pub struct SqlStorage {
    pool: Pool<Sqlite>,
    hostname: String,
}

impl SqlStorage {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn open(path: &Path, hostname: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("open transfer db: {}", path.display()))?;

        let db = SqlStorage {
            pool,
            hostname: hostname.to_string(),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database for tests and dry runs.
    pub async fn open_in_memory(hostname: &str) -> Result<Self> {
        // Single connection so the pool cannot hand back a different empty DB.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = SqlStorage {
            pool,
            hostname: hostname.to_string(),
        };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS t_job (
                job_id TEXT PRIMARY KEY,
                job_state TEXT NOT NULL,
                vo_name TEXT NOT NULL,
                user_dn TEXT NOT NULL,
                cred_id TEXT NOT NULL,
                job_mode TEXT NOT NULL,
                submit_time INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS t_file (
                file_id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES t_job(job_id),
                file_state TEXT NOT NULL,
                source_se TEXT NOT NULL,
                dest_se TEXT NOT NULL,
                source_surl TEXT NOT NULL,
                dest_surl TEXT NOT NULL,
                checksum TEXT,
                user_filesize INTEGER NOT NULL DEFAULT 0,
                file_metadata TEXT,
                activity TEXT NOT NULL DEFAULT 'default',
                reason TEXT,
                start_time INTEGER,
                finish_time INTEGER
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_file_state
                ON t_file (file_state, source_se, dest_se)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS t_share_config (
                source_se TEXT NOT NULL,
                dest_se TEXT NOT NULL,
                vo_name TEXT NOT NULL,
                weight INTEGER NOT NULL,
                PRIMARY KEY (source_se, dest_se, vo_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS t_credential (
                cred_id TEXT NOT NULL,
                user_dn TEXT NOT NULL,
                proxy_path TEXT NOT NULL,
                PRIMARY KEY (cred_id, user_dn)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS t_debug (
                source_se TEXT NOT NULL,
                dest_se TEXT NOT NULL,
                debug_level INTEGER NOT NULL,
                PRIMARY KEY (source_se, dest_se)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS t_host (
                hostname TEXT PRIMARY KEY,
                drain INTEGER NOT NULL DEFAULT 0
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert a job with its files; returns the generated job id.
    pub async fn submit_job(&self, submission: &JobSubmission) -> Result<String> {
        if submission.files.is_empty() {
            return Err(anyhow!("a job needs at least one file"));
        }
        let job_id = uuid::Uuid::new_v4().to_string();
        let now = unix_timestamp();

        sqlx::query(
            r#"
            INSERT INTO t_job (job_id, job_state, vo_name, user_dn, cred_id, job_mode, submit_time)
            VALUES (?1, 'SUBMITTED', ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&job_id)
        .bind(&submission.vo_name)
        .bind(&submission.user_dn)
        .bind(&submission.cred_id)
        .bind(submission.mode.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        for file in &submission.files {
            sqlx::query(
                r#"
                INSERT INTO t_file (
                    job_id, file_state, source_se, dest_se,
                    source_surl, dest_surl, checksum, user_filesize,
                    file_metadata, activity
                ) VALUES (?1, 'SUBMITTED', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(&job_id)
            .bind(storage_element_of(&file.source_surl))
            .bind(storage_element_of(&file.dest_surl))
            .bind(&file.source_surl)
            .bind(&file.dest_surl)
            .bind(file.checksum.as_ref().map(|c| c.to_string()))
            .bind(file.filesize as i64)
            .bind(&file.metadata)
            .bind(&file.activity)
            .execute(&self.pool)
            .await?;
        }

        Ok(job_id)
    }

    /// All jobs, newest first, with per-state file counts.
    pub async fn list_jobs(&self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query(
            r#"
            SELECT j.job_id, j.job_state, j.vo_name, j.job_mode,
                   COUNT(f.file_id) AS file_total,
                   SUM(CASE WHEN f.file_state = 'FAILED' THEN 1 ELSE 0 END) AS file_failed,
                   SUM(CASE WHEN f.file_state = 'FINISHED' THEN 1 ELSE 0 END) AS file_finished
            FROM t_job j
            LEFT JOIN t_file f ON f.job_id = j.job_id
            GROUP BY j.job_id
            ORDER BY j.submit_time DESC, j.job_id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mode: String = row.get("job_mode");
            out.push(JobRow {
                job_id: row.get("job_id"),
                job_state: row.get("job_state"),
                vo_name: row.get("vo_name"),
                mode: JobMode::from_str(&mode),
                file_total: row.get("file_total"),
                file_failed: row.get::<Option<i64>, _>("file_failed").unwrap_or(0),
                file_finished: row.get::<Option<i64>, _>("file_finished").unwrap_or(0),
            });
        }
        Ok(out)
    }

    /// Files of one job, in file-id order.
    pub async fn list_files(&self, job_id: &str) -> Result<Vec<FileRow>> {
        let rows = sqlx::query(
            r#"
            SELECT file_id, file_state, source_surl, dest_surl, reason
            FROM t_file
            WHERE job_id = ?1
            ORDER BY file_id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let state: String = row.get("file_state");
            out.push(FileRow {
                file_id: row.get("file_id"),
                file_state: FileState::from_str(&state),
                source_surl: row.get("source_surl"),
                dest_surl: row.get("dest_surl"),
                reason: row.get("reason"),
            });
        }
        Ok(out)
    }

    /// Upsert a VO share row for a link.
    pub async fn add_share(
        &self,
        source_se: &str,
        dest_se: &str,
        vo_name: &str,
        weight: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO t_share_config (source_se, dest_se, vo_name, weight)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (source_se, dest_se, vo_name) DO UPDATE SET weight = ?4
            "#,
        )
        .bind(source_se)
        .bind(dest_se)
        .bind(vo_name)
        .bind(weight as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert a delegated credential's proxy path.
    pub async fn add_credential(
        &self,
        cred_id: &str,
        user_dn: &str,
        proxy_path: &Path,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO t_credential (cred_id, user_dn, proxy_path)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (cred_id, user_dn) DO UPDATE SET proxy_path = ?3
            "#,
        )
        .bind(cred_id)
        .bind(user_dn)
        .bind(proxy_path.to_string_lossy().as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert the debug level for a storage pair.
    pub async fn set_debug_level(
        &self,
        source_se: &str,
        dest_se: &str,
        level: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO t_debug (source_se, dest_se, debug_level)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (source_se, dest_se) DO UPDATE SET debug_level = ?3
            "#,
        )
        .bind(source_se)
        .bind(dest_se)
        .bind(level as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set or clear the drain flag for this host.
    pub async fn set_drain(&self, active: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO t_host (hostname, drain)
            VALUES (?1, ?2)
            ON CONFLICT (hostname) DO UPDATE SET drain = ?2
            "#,
        )
        .bind(&self.hostname)
        .bind(active as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn discover_queues_for_modes(
        &self,
        modes: &[JobMode],
        kind: QueueKind,
    ) -> Result<Vec<QueueId>> {
        let placeholders: Vec<String> = (1..=modes.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            r#"
            SELECT DISTINCT f.source_se, f.dest_se, j.vo_name
            FROM t_file f
            JOIN t_job j ON j.job_id = f.job_id
            WHERE f.file_state = 'SUBMITTED' AND j.job_mode IN ({})
            ORDER BY f.source_se, f.dest_se, j.vo_name
            "#,
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for mode in modes {
            query = query.bind(mode.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| QueueId {
                source_se: row.get("source_se"),
                dest_se: row.get("dest_se"),
                vo_name: row.get("vo_name"),
                kind,
            })
            .collect())
    }
}

fn transfer_from_row(row: &sqlx::sqlite::SqliteRow) -> TransferFile {
    let checksum: Option<String> = row.get("checksum");
    let mode: String = row.get("job_mode");
    TransferFile {
        file_id: row.get("file_id"),
        job_id: row.get("job_id"),
        vo_name: row.get("vo_name"),
        user_dn: row.get("user_dn"),
        cred_id: row.get("cred_id"),
        source_se: row.get("source_se"),
        dest_se: row.get("dest_se"),
        source_surl: row.get("source_surl"),
        dest_surl: row.get("dest_surl"),
        checksum: checksum.as_deref().map(Checksum::parse),
        user_filesize: row.get::<i64, _>("user_filesize") as u64,
        file_metadata: row.get("file_metadata"),
        activity: row.get("activity"),
        job_mode: JobMode::from_str(&mode),
    }
}

#[async_trait]
impl StorageGateway for SqlStorage {
    async fn discover_pending_queues(&self) -> Result<Vec<QueueId>> {
        self.discover_queues_for_modes(&[JobMode::Regular], QueueKind::Regular)
            .await
    }

    async fn discover_reuse_queues(&self) -> Result<Vec<QueueId>> {
        self.discover_queues_for_modes(&[JobMode::Reuse, JobMode::Multihop], QueueKind::Reuse)
            .await
    }

    async fn fetch_ready_transfers(&self, queues: &[ScheduledQueue]) -> Result<VoQueueMap> {
        let mut out = VoQueueMap::new();

        for scheduled in queues {
            let q = &scheduled.queue;
            let bundled = q.kind == QueueKind::Reuse;
            // Reuse/multihop jobs run all-at-once, so their queues are
            // fetched whole instead of being cut by the quota.
            let sql = if bundled {
                r#"
                SELECT f.file_id, f.job_id, f.source_se, f.dest_se,
                       f.source_surl, f.dest_surl, f.checksum, f.user_filesize,
                       f.file_metadata, f.activity,
                       j.vo_name, j.user_dn, j.cred_id, j.job_mode
                FROM t_file f
                JOIN t_job j ON j.job_id = f.job_id
                WHERE f.file_state = 'SUBMITTED'
                  AND f.source_se = ?1 AND f.dest_se = ?2 AND j.vo_name = ?3
                  AND j.job_mode IN ('reuse', 'multihop')
                ORDER BY j.submit_time, j.job_id, f.file_id
                "#
            } else {
                r#"
                SELECT f.file_id, f.job_id, f.source_se, f.dest_se,
                       f.source_surl, f.dest_surl, f.checksum, f.user_filesize,
                       f.file_metadata, f.activity,
                       j.vo_name, j.user_dn, j.cred_id, j.job_mode
                FROM t_file f
                JOIN t_job j ON j.job_id = f.job_id
                WHERE f.file_state = 'SUBMITTED'
                  AND f.source_se = ?1 AND f.dest_se = ?2 AND j.vo_name = ?3
                  AND j.job_mode = 'regular'
                ORDER BY f.file_id
                LIMIT ?4
                "#
            };

            let mut query = sqlx::query(sql)
                .bind(&q.source_se)
                .bind(&q.dest_se)
                .bind(&q.vo_name);
            if !bundled {
                query = query.bind(scheduled.quota.max(1) as i64);
            }

            let rows = query.fetch_all(&self.pool).await?;
            for row in rows {
                let tf = transfer_from_row(&row);
                out.entry(tf.vo_name.clone())
                    .or_insert_with(VecDeque::new)
                    .push_back(tf);
            }
        }

        Ok(out)
    }

    async fn resolve_proxy(&self, cred_id: &str, user_dn: &str) -> Result<PathBuf> {
        let row = sqlx::query(
            r#"
            SELECT proxy_path FROM t_credential
            WHERE cred_id = ?1 AND user_dn = ?2
            "#,
        )
        .bind(cred_id)
        .bind(user_dn)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(PathBuf::from(row.get::<String, _>("proxy_path"))),
            None => Err(anyhow!(
                "no delegated credential for id {cred_id} and DN {user_dn}"
            )),
        }
    }

    async fn mark_ready(&self, job_id: &str, file_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE t_file
            SET file_state = 'READY', start_time = ?1
            WHERE job_id = ?2 AND file_id = ?3 AND file_state = 'SUBMITTED'
            "#,
        )
        .bind(unix_timestamp())
        .bind(job_id)
        .bind(file_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE t_job SET job_state = 'ACTIVE'
            WHERE job_id = ?1 AND job_state = 'SUBMITTED'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, file_id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE t_file
            SET file_state = 'FAILED', reason = ?1, finish_time = ?2
            WHERE job_id = ?3 AND file_id = ?4
            "#,
        )
        .bind(reason)
        .bind(unix_timestamp())
        .bind(job_id)
        .bind(file_id)
        .execute(&self.pool)
        .await?;

        // The job fails once no file can still make progress.
        sqlx::query(
            r#"
            UPDATE t_job SET job_state = 'FAILED'
            WHERE job_id = ?1 AND NOT EXISTS (
                SELECT 1 FROM t_file
                WHERE job_id = ?1
                  AND file_state IN ('SUBMITTED', 'READY', 'ACTIVE')
            )
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_link_shares(&self, source_se: &str, dest_se: &str) -> Result<Vec<ShareConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT vo_name, weight FROM t_share_config
            WHERE source_se = ?1 AND dest_se = ?2
            "#,
        )
        .bind(source_se)
        .bind(dest_se)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ShareConfig {
                vo_name: row.get("vo_name"),
                weight: row.get::<i64, _>("weight") as u32,
            })
            .collect())
    }

    async fn get_debug_level(&self, source_se: &str, dest_se: &str) -> Result<u32> {
        let row = sqlx::query(
            r#"
            SELECT debug_level FROM t_debug
            WHERE source_se = ?1 AND dest_se = ?2
            "#,
        )
        .bind(source_se)
        .bind(dest_se)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<i64, _>("debug_level") as u32).unwrap_or(0))
    }

    async fn count_url_copy_processes(&self, name: &str) -> Result<usize> {
        Ok(count_processes_with_name(name))
    }

    async fn is_drain_active(&self) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT drain FROM t_host WHERE hostname = ?1
            "#,
        )
        .bind(&self.hostname)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<i64, _>("drain") != 0).unwrap_or(false))
    }
}

/// Census of live processes whose command name matches `name`.
///
/// `/proc/<pid>/comm` truncates names at 15 bytes, so the comparison uses
/// the truncated form of the binary's base name.
#[cfg(target_os = "linux")]
fn count_processes_with_name(name: &str) -> usize {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let want: String = base.chars().take(15).collect();

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .chars()
                .all(|c| c.is_ascii_digit())
        })
        .filter(|e| {
            std::fs::read_to_string(e.path().join("comm"))
                .map(|comm| comm.trim_end() == want)
                .unwrap_or(false)
        })
        .count()
}

#[cfg(not(target_os = "linux"))]
fn count_processes_with_name(_name: &str) -> usize {
    0
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(source: &str, dest: &str) -> FileSubmission {
        FileSubmission {
            source_surl: source.to_string(),
            dest_surl: dest.to_string(),
            checksum: Some(Checksum::parse("ADLER32:deadbeef")),
            filesize: 1024,
            metadata: None,
            activity: "default".to_string(),
        }
    }

    fn job(vo: &str, mode: JobMode, files: Vec<FileSubmission>) -> JobSubmission {
        JobSubmission {
            vo_name: vo.to_string(),
            user_dn: "/DC=org/CN=user".to_string(),
            cred_id: "cred-1".to_string(),
            mode,
            files,
        }
    }

    #[tokio::test]
    async fn submit_discover_fetch_roundtrip() {
        let db = SqlStorage::open_in_memory("fts01").await.unwrap();
        let job_id = db
            .submit_job(&job(
                "atlas",
                JobMode::Regular,
                vec![
                    file("gsiftp://src.org/a", "gsiftp://dst.org/a"),
                    file("gsiftp://src.org/b", "gsiftp://dst.org/b"),
                ],
            ))
            .await
            .unwrap();

        let queues = db.discover_pending_queues().await.unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].source_se, "gsiftp://src.org");
        assert_eq!(queues[0].dest_se, "gsiftp://dst.org");
        assert_eq!(queues[0].vo_name, "atlas");
        assert_eq!(queues[0].kind, QueueKind::Regular);
        assert!(db.discover_reuse_queues().await.unwrap().is_empty());

        let scheduled = vec![ScheduledQueue {
            queue: queues[0].clone(),
            quota: 10,
        }];
        let vo_queues = db.fetch_ready_transfers(&scheduled).await.unwrap();
        let files = vo_queues.get("atlas").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].job_id, job_id);
        assert_eq!(files[0].user_dn, "/DC=org/CN=user");
        assert_eq!(
            files[0].checksum.as_ref().unwrap().to_string(),
            "ADLER32:deadbeef"
        );
    }

    #[tokio::test]
    async fn fetch_respects_quota_and_marks() {
        let db = SqlStorage::open_in_memory("fts01").await.unwrap();
        let job_id = db
            .submit_job(&job(
                "cms",
                JobMode::Regular,
                vec![
                    file("gsiftp://s.org/1", "gsiftp://d.org/1"),
                    file("gsiftp://s.org/2", "gsiftp://d.org/2"),
                    file("gsiftp://s.org/3", "gsiftp://d.org/3"),
                ],
            ))
            .await
            .unwrap();

        let queues = db.discover_pending_queues().await.unwrap();
        let scheduled = vec![ScheduledQueue {
            queue: queues[0].clone(),
            quota: 2,
        }];
        let vo_queues = db.fetch_ready_transfers(&scheduled).await.unwrap();
        assert_eq!(vo_queues.get("cms").unwrap().len(), 2);

        // READY files leave the pending set.
        let first = vo_queues.get("cms").unwrap()[0].clone();
        db.mark_ready(&job_id, first.file_id).await.unwrap();
        let vo_queues = db.fetch_ready_transfers(&scheduled).await.unwrap();
        assert_eq!(vo_queues.get("cms").unwrap().len(), 2);
        assert!(vo_queues.get("cms").unwrap().iter().all(|f| f.file_id != first.file_id));

        let jobs = db.list_jobs().await.unwrap();
        assert_eq!(jobs[0].job_state, "ACTIVE");
    }

    #[tokio::test]
    async fn mark_failed_records_reason_and_fails_exhausted_job() {
        let db = SqlStorage::open_in_memory("fts01").await.unwrap();
        let job_id = db
            .submit_job(&job(
                "lhcb",
                JobMode::Regular,
                vec![file("gsiftp://s.org/x", "gsiftp://d.org/x")],
            ))
            .await
            .unwrap();

        let files = db.list_files(&job_id).await.unwrap();
        db.mark_failed(&job_id, files[0].file_id, "No share configured for this VO")
            .await
            .unwrap();

        let files = db.list_files(&job_id).await.unwrap();
        assert_eq!(files[0].file_state, FileState::Failed);
        assert_eq!(
            files[0].reason.as_deref(),
            Some("No share configured for this VO")
        );

        let jobs = db.list_jobs().await.unwrap();
        assert_eq!(jobs[0].job_state, "FAILED");
        assert_eq!(jobs[0].file_failed, 1);

        // Failed files are no longer discoverable.
        assert!(db.discover_pending_queues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reuse_jobs_discovered_separately_and_fetched_whole() {
        let db = SqlStorage::open_in_memory("fts01").await.unwrap();
        db.submit_job(&job(
            "atlas",
            JobMode::Reuse,
            vec![
                file("gsiftp://s.org/1", "gsiftp://d.org/1"),
                file("gsiftp://s.org/2", "gsiftp://d.org/2"),
                file("gsiftp://s.org/3", "gsiftp://d.org/3"),
            ],
        ))
        .await
        .unwrap();

        assert!(db.discover_pending_queues().await.unwrap().is_empty());
        let queues = db.discover_reuse_queues().await.unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].kind, QueueKind::Reuse);

        // Quota does not split a reuse job.
        let scheduled = vec![ScheduledQueue {
            queue: queues[0].clone(),
            quota: 1,
        }];
        let vo_queues = db.fetch_ready_transfers(&scheduled).await.unwrap();
        assert_eq!(vo_queues.get("atlas").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn credentials_shares_debug_and_drain() {
        let db = SqlStorage::open_in_memory("fts01").await.unwrap();

        db.add_credential("cred-1", "/DC=org/CN=user", Path::new("/tmp/x509up_u0"))
            .await
            .unwrap();
        let path = db.resolve_proxy("cred-1", "/DC=org/CN=user").await.unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x509up_u0"));
        assert!(db.resolve_proxy("cred-2", "/DC=org/CN=user").await.is_err());

        db.add_share("gsiftp://s.org", "gsiftp://d.org", "atlas", 3)
            .await
            .unwrap();
        db.add_share("gsiftp://s.org", "gsiftp://d.org", "cms", 1)
            .await
            .unwrap();
        let shares = db
            .get_link_shares("gsiftp://s.org", "gsiftp://d.org")
            .await
            .unwrap();
        assert_eq!(shares.len(), 2);
        assert!(db
            .get_link_shares("gsiftp://other.org", "gsiftp://d.org")
            .await
            .unwrap()
            .is_empty());

        db.set_debug_level("gsiftp://s.org", "gsiftp://d.org", 2)
            .await
            .unwrap();
        assert_eq!(
            db.get_debug_level("gsiftp://s.org", "gsiftp://d.org")
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            db.get_debug_level("gsiftp://x.org", "gsiftp://y.org")
                .await
                .unwrap(),
            0
        );

        assert!(!db.is_drain_active().await.unwrap());
        db.set_drain(true).await.unwrap();
        assert!(db.is_drain_active().await.unwrap());
        db.set_drain(false).await.unwrap();
        assert!(!db.is_drain_active().await.unwrap());
    }

    #[tokio::test]
    async fn process_census_finds_nothing_for_unknown_name() {
        let db = SqlStorage::open_in_memory("fts01").await.unwrap();
        let count = db
            .count_url_copy_processes("definitely-not-a-real-process-name")
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
