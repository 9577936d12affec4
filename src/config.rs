//! Process-wide configuration derived from the environment.
//!
//! Every knob is exposed both as a flag and as an environment variable so
//! the service can run unmodified under systemd, docker or a bare shell.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "filegate", version, about = "Sandboxed file-operation proxy")]
pub struct Args {
    /// Bearer token required on every /files endpoint.
    #[arg(long, env = "FILE_PROXY_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Comma-separated absolute directories operations are confined to.
    #[arg(long, env = "ALLOWED_BASE_PATHS", value_delimiter = ',')]
    pub allowed_base_paths: Vec<String>,

    #[arg(long, env = "PORT", default_value_t = 4000)]
    pub port: u16,

    #[arg(long, env = "MAX_UPLOAD_MB", default_value_t = 500)]
    pub max_upload_mb: u64,

    #[arg(long, env = "MAX_DOWNLOAD_MB", default_value_t = 5000)]
    pub max_download_mb: u64,

    #[arg(long, env = "MAX_CHUNK_SIZE_MB", default_value_t = 50)]
    pub max_chunk_size_mb: u64,

    #[arg(long, env = "SEARCH_MAX_RESULTS", default_value_t = 100)]
    pub search_max_results: usize,

    #[arg(long, env = "SEARCH_MAX_RECURSIVE_WILDCARDS", default_value_t = 10)]
    pub search_max_recursive_wildcards: usize,

    #[arg(long, env = "UPLOAD_EXPIRY_HOURS", default_value_t = 24)]
    pub upload_expiry_hours: u64,

    #[arg(long, env = "UPLOAD_TEMP_DIR", default_value = "/tmp/filegate-uploads")]
    pub upload_temp_dir: PathBuf,

    #[arg(long, env = "DISK_CLEANUP_INTERVAL_HOURS", default_value_t = 6)]
    pub disk_cleanup_interval_hours: u64,

    /// "false" disables the filesystem index; anything else enables it.
    #[arg(long, env = "ENABLE_INDEX", default_value = "true")]
    pub enable_index: String,

    #[arg(long, env = "INDEX_DATABASE_URL", default_value = "sqlite::memory:")]
    pub index_database_url: String,

    #[arg(long, env = "INDEX_RESCAN_INTERVAL_MINUTES", default_value_t = 30)]
    pub index_rescan_interval_minutes: u64,

    #[arg(long, env = "INDEX_SCAN_CONCURRENCY", default_value_t = 4)]
    pub index_scan_concurrency: usize,

    /// Development override: force this uid on every ownership application.
    #[arg(long, env = "DEV_UID_OVERRIDE")]
    pub dev_uid_override: Option<u32>,

    /// Development override: force this gid on every ownership application.
    #[arg(long, env = "DEV_GID_OVERRIDE")]
    pub dev_gid_override: Option<u32>,
}

/// Immutable runtime configuration. Built once at startup, shared as
/// `Arc<Config>` for the process lifetime.
#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub base_paths: Vec<PathBuf>,
    pub port: u16,
    pub max_upload_bytes: u64,
    pub max_download_bytes: u64,
    pub max_chunk_bytes: u64,
    pub search_max_results: usize,
    pub search_max_recursive_wildcards: usize,
    pub upload_expiry: Duration,
    pub upload_temp_dir: PathBuf,
    pub disk_cleanup_interval: Duration,
    pub index_enabled: bool,
    pub index_database_url: String,
    pub index_rescan_interval: Duration,
    pub index_scan_concurrency: usize,
    pub dev_override: Option<(u32, u32)>,
}

const MB: u64 = 1024 * 1024;

impl Config {
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        if args.token.trim().is_empty() {
            anyhow::bail!("FILE_PROXY_TOKEN must not be empty");
        }

        let mut base_paths = Vec::new();
        for raw in &args.allowed_base_paths {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if !Path::new(raw).is_absolute() {
                anyhow::bail!("base path must be absolute: {raw}");
            }
            base_paths.push(PathBuf::from(raw));
        }
        if base_paths.is_empty() {
            anyhow::bail!("ALLOWED_BASE_PATHS must list at least one directory");
        }

        let dev_override = args.dev_uid_override.zip(args.dev_gid_override);

        Ok(Self {
            token: args.token,
            base_paths,
            port: args.port,
            max_upload_bytes: args.max_upload_mb * MB,
            max_download_bytes: args.max_download_mb * MB,
            max_chunk_bytes: args.max_chunk_size_mb * MB,
            search_max_results: args.search_max_results,
            search_max_recursive_wildcards: args.search_max_recursive_wildcards,
            upload_expiry: Duration::from_secs(args.upload_expiry_hours * 3600),
            upload_temp_dir: args.upload_temp_dir,
            disk_cleanup_interval: Duration::from_secs(args.disk_cleanup_interval_hours * 3600),
            index_enabled: args.enable_index != "false",
            index_database_url: args.index_database_url,
            index_rescan_interval: Duration::from_secs(args.index_rescan_interval_minutes * 60),
            index_scan_concurrency: args.index_scan_concurrency.max(1),
            dev_override,
        })
    }
}
