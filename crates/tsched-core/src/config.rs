use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Server configuration loaded from `~/.config/tsched/config.toml` (or an
/// explicit `--config` path). Read once when the service is constructed;
/// never re-read mid-round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name (or path) of the external worker-process binary.
    pub url_copy_cmd: String,
    /// Directory for per-transfer worker log files.
    pub transfer_log_dir: PathBuf,
    /// Spool directory: status events and bulk job lists live under here.
    pub messaging_dir: PathBuf,
    /// Concurrent executor slots per dispatch worker.
    pub exec_pool_size: usize,
    /// Host alias reported to workers and used for drain bookkeeping.
    pub host_alias: String,
    /// Information-system endpoint handed to workers.
    pub infosys: String,
    /// Whether dispatch/failure status events are published.
    pub monitoring_enabled: bool,
    /// Seconds between scheduling rounds. The sole pacing knob.
    pub scheduling_interval_secs: u64,
    /// Host-wide cap on concurrent worker processes. 0 disables the cap.
    pub max_url_copy_processes: usize,
    /// Number of parallel dispatch workers a round fans out to.
    pub dispatch_workers: usize,
    /// Base number of ready files fetched per queue, split by share weight.
    pub fetch_batch_size: usize,
    /// Weight given to a VO with no share row on a configured link.
    /// None (the default) leaves such queues unschedulable.
    #[serde(default)]
    pub default_share_weight: Option<u32>,
    /// Transfer database path; None uses the XDG state directory.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url_copy_cmd: "tsched-url-copy".to_string(),
            transfer_log_dir: PathBuf::from("/var/log/tsched/transfers"),
            messaging_dir: PathBuf::from("/var/lib/tsched"),
            exec_pool_size: 6,
            host_alias: "localhost".to_string(),
            infosys: String::new(),
            monitoring_enabled: true,
            scheduling_interval_secs: 2,
            max_url_copy_processes: 400,
            dispatch_workers: 4,
            fetch_batch_size: 100,
            default_share_weight: None,
            db_path: None,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("tsched")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Default transfer database path under the XDG state directory.
pub fn default_db_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("tsched")?;
    let state_dir = xdg_dirs.get_state_home();
    fs::create_dir_all(&state_dir)?;
    Ok(state_dir.join("transfers.db"))
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<ServerConfig> {
    let path = config_path()?;
    load_or_init_at(&path)
}

/// Like `load_or_init`, against an explicit config file path.
pub fn load_or_init_at(path: &std::path::Path) -> Result<ServerConfig> {
    if !path.exists() {
        let default_cfg = ServerConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(path)?;
    let cfg: ServerConfig = toml::from_str(&data)?;
    Ok(cfg)
}
