//! CLI for the tsched transfer scheduling daemon.

mod commands;


use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tsched_core::config;
use tsched_core::storage::SqlStorage;
use tsched_core::transfer::JobMode;

use commands::{run_drain, run_serve, run_status, run_submit};

/// Top-level CLI for the tsched scheduling daemon.
#[derive(Debug, Parser)]
#[command(name = "tsched")]
#[command(about = "tsched: grid file-transfer scheduling daemon", long_about = None)]
pub struct Cli {
    /// Server config file; defaults to the XDG config home.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Transfer database path; overrides the config file.
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduling daemon until interrupted.
    Serve,

    /// Submit a transfer job.
    Submit(SubmitArgs),

    /// Show jobs, or the files of one job.
    Status {
        /// Show per-file states for this job.
        #[arg(long, value_name = "JOB_ID")]
        job: Option<String>,
    },

    /// Switch drain mode for this host.
    Drain {
        #[arg(value_enum)]
        switch: DrainSwitch,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DrainSwitch {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    /// One worker process per file.
    Regular,
    /// All files of the job share one worker process and session.
    Reuse,
    /// Hops of the job run in order inside one worker process.
    Multihop,
}

impl From<ModeArg> for JobMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Regular => JobMode::Regular,
            ModeArg::Reuse => JobMode::Reuse,
            ModeArg::Multihop => JobMode::Multihop,
        }
    }
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Source SURL.
    pub source: String,

    /// Destination SURL.
    pub destination: String,

    /// Submitting VO.
    #[arg(long)]
    pub vo: String,

    /// User distinguished name.
    #[arg(long = "dn")]
    pub user_dn: String,

    /// Delegated credential id.
    #[arg(long = "cred-id")]
    pub cred_id: String,

    /// Register this proxy file for the credential before submitting.
    #[arg(long, value_name = "PATH")]
    pub proxy: Option<PathBuf>,

    /// Additional SOURCE,DESTINATION pairs for the same job.
    #[arg(long = "file", value_name = "SRC,DST")]
    pub extra_files: Vec<String>,

    /// Checksum as ALGORITHM:VALUE.
    #[arg(long)]
    pub checksum: Option<String>,

    /// Expected file size in bytes.
    #[arg(long, default_value = "0")]
    pub filesize: u64,

    /// Activity label within the VO.
    #[arg(long, default_value = "default")]
    pub activity: String,

    /// How the job's files map onto worker processes.
    #[arg(long, value_enum, default_value_t = ModeArg::Regular)]
    pub mode: ModeArg,
}

impl Cli {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();

        let cfg = match &cli.config {
            Some(path) => config::load_or_init_at(path)?,
            None => config::load_or_init()?,
        };

        let db_path = match cli.db.clone().or_else(|| cfg.db_path.clone()) {
            Some(path) => path,
            None => config::default_db_path()?,
        };
        let storage = SqlStorage::open(&db_path, &cfg.host_alias)
            .await
            .with_context(|| format!("open transfer database: {}", db_path.display()))?;

        match cli.command {
            Command::Serve => run_serve(storage, cfg).await,
            Command::Submit(args) => {
                let job_id = run_submit(&storage, &args).await?;
                println!("{job_id}");
                Ok(())
            }
            Command::Status { job } => run_status(&storage, job.as_deref()).await,
            Command::Drain { switch } => {
                run_drain(&storage, matches!(switch, DrainSwitch::On)).await
            }
        }
    }
}
