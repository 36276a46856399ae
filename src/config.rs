//! Configuration.
//!
//! One TOML file holds everything the core is allowed to know about its
//! environment: the server name, the base directory for databases, the TLS
//! material, the listener the outer surfaces bind, and the scheduler and
//! pipeline tunables. The core never reads the process environment; values
//! arrive here and are injected downward.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    fetch::FetchOpts,
    sched::SliceCfg,
    vm::VmOpts,
};

pub const DEFAULT_PORT: u16 = 8448;

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_slice_warn_ms() -> u64 {
    50
}

fn default_submit_deadline_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_fetch_per_origin() -> usize {
    4
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_fetch_backoff_ms() -> u64 {
    250
}

fn default_max_fetch_depth() -> u32 {
    8
}

fn default_offload_threads() -> usize {
    2
}

/// The TLS listener the outer HTTP surface binds. The core only carries
/// these values; it never opens the socket itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cert_file: None,
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_name: String,
    pub base_dir: PathBuf,
    #[serde(default)]
    pub listen: ListenConfig,
    /// TLS key/cert directory; defaults to `<base_dir>/tls`.
    #[serde(default)]
    pub tls_dir: Option<PathBuf>,
    #[serde(default = "default_slice_warn_ms")]
    pub slice_warn_ms: u64,
    /// Off unless set; a slice past this raises an interrupt.
    #[serde(default)]
    pub slice_interrupt_ms: Option<u64>,
    #[serde(default = "default_submit_deadline_ms")]
    pub submit_deadline_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_fetch_per_origin")]
    pub fetch_per_origin: usize,
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,
    #[serde(default = "default_max_fetch_depth")]
    pub max_fetch_depth: u32,
    #[serde(default = "default_offload_threads")]
    pub offload_threads: usize,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_owned(),
            base_dir: PathBuf::from("hearth-data"),
            listen: ListenConfig::default(),
            tls_dir: None,
            slice_warn_ms: default_slice_warn_ms(),
            slice_interrupt_ms: None,
            submit_deadline_ms: default_submit_deadline_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fetch_per_origin: default_fetch_per_origin(),
            fetch_attempts: default_fetch_attempts(),
            fetch_backoff_ms: default_fetch_backoff_ms(),
            max_fetch_depth: default_max_fetch_depth(),
            offload_threads: default_offload_threads(),
            updated_at: Utc::now(),
        }
    }
}

/// Selective overrides applied by the `config set` command.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub server_name: Option<String>,
    pub base_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub slice_warn_ms: Option<u64>,
    pub slice_interrupt_ms: Option<u64>,
    pub submit_deadline_ms: Option<u64>,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("hearth.toml")
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = path.unwrap_or_else(default_config_path);

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&contents)?;
        config.ensure_dirs()?;
        Ok((config, config_path))
    } else {
        let config = Config::default();
        config.ensure_dirs()?;
        config.save(&config_path)?;
        Ok((config, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(server_name) = update.server_name {
            self.server_name = server_name;
        }
        if let Some(base_dir) = update.base_dir {
            self.base_dir = base_dir;
        }
        if let Some(port) = update.port {
            self.listen.port = port;
        }
        if let Some(warn) = update.slice_warn_ms {
            self.slice_warn_ms = warn;
        }
        if let Some(interrupt) = update.slice_interrupt_ms {
            self.slice_interrupt_ms = Some(interrupt);
        }
        if let Some(deadline) = update.submit_deadline_ms {
            self.submit_deadline_ms = deadline;
        }
        self.updated_at = Utc::now();
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)?;
        fs::create_dir_all(self.tls_dir())?;
        Ok(())
    }

    pub fn events_db_path(&self) -> PathBuf {
        self.base_dir.join("events")
    }

    pub fn key_dir(&self) -> PathBuf {
        self.base_dir.join("keys")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn tls_dir(&self) -> PathBuf {
        self.tls_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("tls"))
    }

    pub fn slice_cfg(&self) -> SliceCfg {
        SliceCfg {
            warn: Duration::from_millis(self.slice_warn_ms),
            interrupt: self.slice_interrupt_ms.map(Duration::from_millis),
        }
    }

    pub fn vm_opts(&self) -> VmOpts {
        VmOpts {
            server_name: self.server_name.clone(),
            submit_deadline: Duration::from_millis(self.submit_deadline_ms),
            retry_attempts: self.retry_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_fetch_depth: self.max_fetch_depth,
        }
    }

    pub fn fetch_opts(&self) -> FetchOpts {
        FetchOpts {
            per_origin: self.fetch_per_origin,
            attempts: self.fetch_attempts,
            backoff: Duration::from_millis(self.fetch_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.toml");
        let (config, written) = load_or_default(Some(path.clone())).unwrap();

        assert_eq!(written, path);
        assert!(path.exists());
        assert_eq!(config.listen.port, DEFAULT_PORT);
    }

    #[test]
    fn reload_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.toml");

        let (mut config, _) = load_or_default(Some(path.clone())).unwrap();
        config.apply_update(ConfigUpdate {
            server_name: Some("example.org".into()),
            port: Some(9448),
            ..ConfigUpdate::default()
        });
        config.save(&path).unwrap();

        let (reloaded, _) = load_or_default(Some(path)).unwrap();
        assert_eq!(reloaded.server_name, "example.org");
        assert_eq!(reloaded.listen.port, 9448);
    }

    #[test]
    fn derived_paths_hang_off_base_dir() {
        let mut config = Config::default();
        config.base_dir = PathBuf::from("/srv/hearth");
        assert_eq!(config.events_db_path(), PathBuf::from("/srv/hearth/events"));
        assert_eq!(config.key_dir(), PathBuf::from("/srv/hearth/keys"));
        assert_eq!(config.tls_dir(), PathBuf::from("/srv/hearth/tls"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config =
            toml::from_str("server_name = \"h\"\nbase_dir = \"/tmp/x\"\n").unwrap();
        assert_eq!(config.slice_warn_ms, 50);
        assert_eq!(config.fetch_per_origin, 4);
        assert!(config.slice_interrupt_ms.is_none());
    }
}
