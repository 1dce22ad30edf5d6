use crate::error::{EngineError, Result};
use crate::task_manager::models::parse_query_window;
use env_logger::{Builder, Target};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "HOSTSYNC_CONFIG";
pub const DATABASE_URL_ENV: &str = "HOSTSYNC_DATABASE_URL";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Seconds between passes that align live triggers with persisted tasks.
    pub reconcile_interval_secs: u64,
    pub sync: SyncConfig,
    pub window_source: WindowSourceConfig,
    pub snapshot_source: SnapshotSourceConfig,
    pub verification: VerificationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:hostsync.db".to_string(),
            max_connections: 10,
            reconcile_interval_secs: 300,
            sync: SyncConfig::default(),
            window_source: WindowSourceConfig::default(),
            snapshot_source: SnapshotSourceConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub max_concurrency: usize,
    pub adapter_timeout_secs: u64,
    pub default_window: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            adapter_timeout_secs: 30,
            default_window: "15m".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WindowSourceConfig {
    pub endpoint: String,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for WindowSourceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9200".to_string(),
            index: "host-metrics-*".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotSourceConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// A cached token is refreshed once it is this close to expiry.
    pub token_refresh_margin_secs: u64,
    pub batch_size: usize,
}

impl Default for SnapshotSourceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            username: String::new(),
            password: String::new(),
            token_refresh_margin_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationConfig {
    pub endpoint: String,
    pub initial_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub ceiling_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8090".to_string(),
            initial_delay_secs: 30,
            poll_interval_secs: 30,
            ceiling_secs: 7200,
            request_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Loads the file named by `HOSTSYNC_CONFIG` (defaults when unset) and
    /// applies environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };

        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.trim().is_empty() {
                config.database_url = url.trim().to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| EngineError::Config(format!("Invalid engine config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 8] = [
            ("maxConnections", u64::from(self.max_connections)),
            ("reconcileIntervalSecs", self.reconcile_interval_secs),
            ("sync.maxConcurrency", self.sync.max_concurrency as u64),
            ("sync.adapterTimeoutSecs", self.sync.adapter_timeout_secs),
            ("snapshotSource.batchSize", self.snapshot_source.batch_size as u64),
            ("verification.pollIntervalSecs", self.verification.poll_interval_secs),
            ("verification.ceilingSecs", self.verification.ceiling_secs),
            (
                "verification.requestTimeoutSecs",
                self.verification.request_timeout_secs,
            ),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(EngineError::Config(format!("{} must be > 0", field)));
            }
        }

        parse_query_window(&self.sync.default_window)
            .map_err(|e| EngineError::Config(format!("sync.defaultWindow: {}", e)))?;
        Ok(())
    }
}

/// Installs the process logger. `RUST_LOG` wins when set; otherwise this crate
/// logs at info and dependencies at warn.
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = env_logger::try_init();
        return;
    }

    let _ = Builder::new()
        .target(Target::Stdout)
        .filter_level(LevelFilter::Warn)
        .filter_module("hostsync_lib", LevelFilter::Info)
        .filter_module("hostsync", LevelFilter::Info)
        .try_init();
}
