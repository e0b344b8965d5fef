//! Settings for the write path and the repair engine, loaded from
//! `$DSYNC_HOME/config.toml`.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use dirs::home_dir;
use dsync_failure_log::FailureLogDir;
use dsync_failure_log::FailureLogWriter;
use dsync_failure_log::LogRole;
use serde::Deserialize;
use serde::Serialize;

pub const CONFIG_TOML_FILE: &str = "config.toml";
pub const DEFAULT_VERSION: &str = "1.0.0";
pub const DEFAULT_UNIT_PREFIX: &str = "u0";
pub const DEFAULT_RECORDS_PER_BATCH: usize = 1_000;
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_REPAIR_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_LOCK_LEASE_SECS: u64 = 30;

const FAILURE_LOG_DIRNAME: &str = "failure-log";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0}")]
    Home(String),
}

/// `config.toml` as written by the operator. Every field is optional.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigToml {
    /// Deployed version; selects the failure log file set.
    pub version: Option<String>,
    /// Prefix of the administrative index that holds cell records.
    pub unit_prefix: Option<String>,
    pub failure_log: Option<FailureLogToml>,
    pub durable: Option<DurableToml>,
    pub repair: Option<RepairToml>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct FailureLogToml {
    pub dir: Option<PathBuf>,
    /// Remove drained segments instead of renaming them with `.done`.
    pub physical_delete: Option<bool>,
    pub records_per_batch: Option<usize>,
    pub rotation_interval_secs: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct DurableToml {
    /// When false, writes go to the primary store only.
    pub enabled: Option<bool>,
    pub database: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct RepairToml {
    pub interval_secs: Option<u64>,
    pub lock_lease_secs: Option<u64>,
}

/// Effective settings after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub home: PathBuf,
    pub version: String,
    pub unit_prefix: String,
    pub failure_log: FailureLogConfig,
    pub durable: DurableConfig,
    pub repair: RepairConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureLogConfig {
    pub dir: PathBuf,
    pub physical_delete: bool,
    pub records_per_batch: usize,
    pub rotation_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableConfig {
    pub enabled: bool,
    pub database: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairConfig {
    pub interval: Duration,
    pub lock_lease: Duration,
}

impl Config {
    /// Reads `home/config.toml`. A missing file yields the defaults.
    pub async fn load(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join(CONFIG_TOML_FILE);
        let toml = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => toml::from_str::<ConfigToml>(&contents)
                .map_err(|source| ConfigError::Parse { path, source })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConfigToml::default(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        Ok(Self::from_toml(toml, home.to_path_buf()))
    }

    pub fn from_toml(toml: ConfigToml, home: PathBuf) -> Self {
        let failure_log = toml.failure_log.unwrap_or_default();
        let durable = toml.durable.unwrap_or_default();
        let repair = toml.repair.unwrap_or_default();
        Self {
            version: toml.version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            unit_prefix: toml
                .unit_prefix
                .unwrap_or_else(|| DEFAULT_UNIT_PREFIX.to_string()),
            failure_log: FailureLogConfig {
                dir: resolve(&home, failure_log.dir, FAILURE_LOG_DIRNAME),
                physical_delete: failure_log.physical_delete.unwrap_or(true),
                records_per_batch: failure_log
                    .records_per_batch
                    .unwrap_or(DEFAULT_RECORDS_PER_BATCH)
                    .max(1),
                rotation_interval: Duration::from_secs(
                    failure_log
                        .rotation_interval_secs
                        .unwrap_or(DEFAULT_ROTATION_INTERVAL_SECS),
                ),
            },
            durable: DurableConfig {
                enabled: durable.enabled.unwrap_or(true),
                database: match durable.database {
                    Some(path) if path.is_relative() => home.join(path),
                    Some(path) => path,
                    None => dsync_state::mirror_db_path(&home),
                },
            },
            repair: RepairConfig {
                interval: Duration::from_secs(
                    repair
                        .interval_secs
                        .unwrap_or(DEFAULT_REPAIR_INTERVAL_SECS)
                        .max(1),
                ),
                lock_lease: Duration::from_secs(
                    repair.lock_lease_secs.unwrap_or(DEFAULT_LOCK_LEASE_SECS),
                ),
            },
            home,
        }
    }

    /// Index that holds cell records in the primary store.
    pub fn admin_index(&self) -> String {
        admin_index(&self.unit_prefix)
    }

    pub fn failure_log_dir(&self) -> FailureLogDir {
        FailureLogDir::new(
            self.failure_log.dir.clone(),
            self.version.clone(),
            self.failure_log.physical_delete,
        )
    }

    /// Opens the write path's failure log, rotating on the configured
    /// interval.
    ///
    /// Active failure segments left by an earlier process are rotated first,
    /// so the next sweep repairs them. Each process must own its failure log
    /// directory.
    pub async fn open_failure_log_writer(&self) -> dsync_failure_log::Result<FailureLogWriter> {
        let writer = FailureLogWriter::new(self.failure_log_dir(), LogRole::Failure)
            .with_rotation_interval(self.failure_log.rotation_interval);
        writer.recover().await?;
        Ok(writer)
    }
}

pub fn admin_index(unit_prefix: &str) -> String {
    format!("{unit_prefix}_ad")
}

fn resolve(home: &Path, configured: Option<PathBuf>, default: &str) -> PathBuf {
    match configured {
        Some(path) if path.is_relative() => home.join(path),
        Some(path) => path,
        None => home.join(default),
    }
}

/// Returns the dsync home directory: `$DSYNC_HOME` when set, otherwise
/// `~/.dsync`.
///
/// A `DSYNC_HOME` that does not point at an existing directory is an error.
pub fn find_dsync_home() -> Result<PathBuf, ConfigError> {
    let env = std::env::var("DSYNC_HOME")
        .ok()
        .filter(|value| !value.is_empty());
    find_dsync_home_from_env(env.as_deref())
}

fn find_dsync_home_from_env(env: Option<&str>) -> Result<PathBuf, ConfigError> {
    match env {
        Some(value) => {
            let path = PathBuf::from(value);
            match std::fs::metadata(&path) {
                Ok(metadata) if metadata.is_dir() => Ok(path),
                Ok(_) => Err(ConfigError::Home(format!(
                    "DSYNC_HOME points to {value:?}, but that path is not a directory"
                ))),
                Err(err) => Err(ConfigError::Home(format!(
                    "failed to read DSYNC_HOME {value:?}: {err}"
                ))),
            }
        }
        None => home_dir()
            .map(|home| home.join(".dsync"))
            .ok_or_else(|| ConfigError::Home("could not find home directory".to_string())),
    }
}
