//! Configuration for the xcloud worker.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (XCLOUD_HOME, XCLOUD_DATABASE, XCLOUD_LEGACY_ENDPOINT,
//!    XCLOUD_LEGACY_TOKEN)
//! 2. Config file (.xcloud/config.yaml)
//! 3. Defaults (~/.xcloud)
//!
//! Config file discovery:
//! - Searches current directory and parents for .xcloud/config.yaml
//! - Paths in config file are relative to the .xcloud/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::LegacyHttpConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub worker: Option<WorkerConfig>,
    #[serde(default)]
    pub backend: Option<BackendConfig>,
    #[serde(default)]
    pub catalog: Option<Catalog>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Worker state directory (relative to .xcloud/)
    pub home: Option<String>,
    /// SQLite database file (relative to .xcloud/)
    pub database: Option<String>,
}

/// Loop tuning as written in the config file; every field optional
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    pub tick_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub stuck_timeout_ms: Option<u64>,
    pub max_dispatch_retries: Option<u32>,
    pub adapter_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Simulated {
        #[serde(default = "default_simulated_duration_ms")]
        duration_ms: u64,
    },
    LegacyHttp(LegacyHttpConfig),
}

/// Must stay below the stuck-timeout, or every simulated job times out
fn default_simulated_duration_ms() -> u64 {
    5 * 60 * 1000
}

/// Images, server types and datacenters the request layer accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub images: Vec<String>,
    pub server_types: Vec<String>,
    pub datacenters: Vec<String>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            images: vec!["redhat-8.6".to_string(), "redhat-9.0".to_string()],
            server_types: vec!["linux-small".to_string(), "linux-large".to_string()],
            datacenters: vec!["fra1".to_string()],
        }
    }
}

/// Resolved loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub tick_interval_ms: u64,
    pub batch_size: usize,
    pub stuck_timeout_ms: u64,
    pub max_dispatch_retries: u32,
    pub adapter_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            batch_size: 10,
            stuck_timeout_ms: 600_000, // 10 min
            max_dispatch_retries: 3,
            adapter_timeout_ms: 30_000,
        }
    }
}

impl WorkerSettings {
    fn merge(config: Option<&WorkerConfig>) -> Self {
        let defaults = Self::default();
        let Some(config) = config else {
            return defaults;
        };

        Self {
            tick_interval_ms: config.tick_interval_ms.unwrap_or(defaults.tick_interval_ms),
            batch_size: config.batch_size.unwrap_or(defaults.batch_size),
            stuck_timeout_ms: config.stuck_timeout_ms.unwrap_or(defaults.stuck_timeout_ms),
            max_dispatch_retries: config
                .max_dispatch_retries
                .unwrap_or(defaults.max_dispatch_retries),
            adapter_timeout_ms: config
                .adapter_timeout_ms
                .unwrap_or(defaults.adapter_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            anyhow::bail!("worker.tick_interval_ms must be greater than 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("worker.batch_size must be greater than 0");
        }
        if self.stuck_timeout_ms == 0 {
            anyhow::bail!("worker.stuck_timeout_ms must be greater than 0");
        }
        if self.adapter_timeout_ms == 0 {
            anyhow::bail!("worker.adapter_timeout_ms must be greater than 0");
        }
        if self.adapter_timeout_ms >= self.stuck_timeout_ms {
            anyhow::bail!(
                "worker.adapter_timeout_ms ({}) must be less than worker.stuck_timeout_ms ({})",
                self.adapter_timeout_ms,
                self.stuck_timeout_ms
            );
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn stuck_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.stuck_timeout_ms).unwrap_or(i64::MAX))
    }

    /// How long after a claim a missing handle still means "start in flight"
    pub fn start_grace(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.adapter_timeout_ms).unwrap_or(i64::MAX))
    }
}

/// Which backend the worker drives
#[derive(Debug, Clone)]
pub enum BackendSettings {
    Simulated { duration: Duration },
    LegacyHttp(LegacyHttpConfig),
}

impl BackendSettings {
    pub fn validate(&self, worker: &WorkerSettings) -> Result<()> {
        if let Self::Simulated { duration } = self {
            if duration.as_millis() >= u128::from(worker.stuck_timeout_ms) {
                anyhow::bail!(
                    "backend.duration_ms ({}) must be less than worker.stuck_timeout_ms ({})",
                    duration.as_millis(),
                    worker.stuck_timeout_ms
                );
            }
        }
        Ok(())
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self::Simulated {
            duration: Duration::from_millis(default_simulated_duration_ms()),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to worker home
    pub home: PathBuf,
    /// Absolute path to the SQLite database
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub worker: WorkerSettings,
    pub backend: BackendSettings,
    pub catalog: Catalog,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".xcloud").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn parse_config(content: &str) -> Result<ConfigFile> {
    Ok(serde_yaml::from_str(content)?)
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn resolve_backend(config: Option<BackendConfig>) -> BackendSettings {
    let mut backend = match config {
        Some(BackendConfig::Simulated { duration_ms }) => BackendSettings::Simulated {
            duration: Duration::from_millis(duration_ms),
        },
        Some(BackendConfig::LegacyHttp(http)) => BackendSettings::LegacyHttp(http),
        None => BackendSettings::default(),
    };

    if let Ok(endpoint) = std::env::var("XCLOUD_LEGACY_ENDPOINT") {
        backend = match backend {
            BackendSettings::LegacyHttp(mut http) => {
                http.endpoint = endpoint;
                BackendSettings::LegacyHttp(http)
            }
            BackendSettings::Simulated { .. } => BackendSettings::LegacyHttp(LegacyHttpConfig {
                endpoint,
                token: None,
                request_timeout_ms: 30_000,
            }),
        };
    }

    if let BackendSettings::LegacyHttp(ref mut http) = backend {
        if let Ok(token) = std::env::var("XCLOUD_LEGACY_TOKEN") {
            http.token = Some(token);
        }
    }

    backend
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".xcloud");

    let config_file = find_config_file();

    let (home, database, worker, backend, catalog) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        // Paths are relative to .xcloud/
        let xcloud_dir = config_path.parent().unwrap_or(Path::new("."));

        let home = if let Ok(env_home) = std::env::var("XCLOUD_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            resolve_path(xcloud_dir, home_path)
        } else {
            default_home.clone()
        };

        let database = if let Ok(env_db) = std::env::var("XCLOUD_DATABASE") {
            PathBuf::from(env_db)
        } else if let Some(ref db_path) = config.paths.database {
            resolve_path(xcloud_dir, db_path)
        } else {
            home.join("xcloud.db")
        };

        (
            home,
            database,
            WorkerSettings::merge(config.worker.as_ref()),
            resolve_backend(config.backend),
            config.catalog.unwrap_or_default(),
        )
    } else {
        let home = std::env::var("XCLOUD_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home.clone());

        let database = std::env::var("XCLOUD_DATABASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("xcloud.db"));

        (
            home,
            database,
            WorkerSettings::default(),
            resolve_backend(None),
            Catalog::default(),
        )
    };

    worker.validate()?;
    backend.validate(&worker)?;

    Ok(ResolvedConfig {
        home,
        database,
        config_file,
        worker,
        backend,
        catalog,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_parsing() {
        let config = parse_config(
            r#"
version: "1.0"
paths:
  home: ./state
  database: ./state/worker.db
worker:
  tick_interval_ms: 250
  batch_size: 25
backend:
  kind: legacy_http
  endpoint: https://legacy.example/api
  token: abc
catalog:
  images: [debian-12]
  server_types: [linux-small]
  datacenters: [fra1, ams1]
"#,
        )
        .unwrap();

        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.database, Some("./state/worker.db".to_string()));

        let worker = WorkerSettings::merge(config.worker.as_ref());
        assert_eq!(worker.tick_interval_ms, 250);
        assert_eq!(worker.batch_size, 25);
        assert_eq!(worker.stuck_timeout_ms, 600_000);
        assert_eq!(worker.max_dispatch_retries, 3);

        match config.backend {
            Some(BackendConfig::LegacyHttp(http)) => {
                assert_eq!(http.endpoint, "https://legacy.example/api");
                assert_eq!(http.token.as_deref(), Some("abc"));
                assert_eq!(http.request_timeout_ms, 30_000);
            }
            other => panic!("unexpected backend: {:?}", other),
        }

        let catalog = config.catalog.unwrap();
        assert_eq!(catalog.datacenters, vec!["fra1", "ams1"]);
    }

    #[test]
    fn test_simulated_backend_default_duration() {
        let config = parse_config(
            r#"
version: "1.0"
backend:
  kind: simulated
"#,
        )
        .unwrap();

        match config.backend {
            Some(BackendConfig::Simulated { duration_ms }) => assert_eq!(duration_ms, 300_000),
            other => panic!("unexpected backend: {:?}", other),
        }
    }

    #[test]
    fn test_default_worker_settings() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.tick_interval(), Duration::from_millis(500));
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.stuck_timeout(), chrono::Duration::minutes(10));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_worker_settings() {
        let settings = WorkerSettings {
            batch_size: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_adapter_timeout_below_stuck_timeout() {
        let settings = WorkerSettings {
            stuck_timeout_ms: 30_000,
            adapter_timeout_ms: 30_000,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        assert_eq!(WorkerSettings::default().start_grace(), chrono::Duration::seconds(30));
    }

    #[test]
    fn test_simulated_duration_must_beat_stuck_timeout() {
        let worker = WorkerSettings::default();
        assert!(BackendSettings::default().validate(&worker).is_ok());

        let too_slow = BackendSettings::Simulated {
            duration: Duration::from_millis(worker.stuck_timeout_ms),
        };
        assert!(too_slow.validate(&worker).is_err());

        let config = parse_config(
            r#"
version: "1.0"
worker:
  stuck_timeout_ms: 60000
backend:
  kind: simulated
"#,
        )
        .unwrap();
        let worker = WorkerSettings::merge(config.worker.as_ref());
        assert!(resolve_backend(config.backend).validate(&worker).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/srv/project/.xcloud");

        assert_eq!(
            resolve_path(&base, "state/xcloud.db"),
            PathBuf::from("/srv/project/.xcloud/state/xcloud.db")
        );
        assert_eq!(
            resolve_path(&base, "/var/lib/xcloud.db"),
            PathBuf::from("/var/lib/xcloud.db")
        );
    }
}
