//! Ingest service configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides beyond
//! the config path itself.  Default config path: `/etc/glade/ingest.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `lineage.base_url`
//! - `downstream.base_url`

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level ingest configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub lineage: EndpointConfig,
    pub downstream: EndpointConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
    /// Fragment retention; also the abandonment threshold for transfers.
    pub fragment_ttl_minutes: u32,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Wake hour used when neither device nor site carries a schedule.
    pub default_wake_hour: u32,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    storage: Option<RawStorageConfig>,
    lineage: Option<RawEndpointConfig>,
    downstream: Option<RawEndpointConfig>,
    schedule: Option<RawScheduleConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStorageConfig {
    sqlite_path: Option<String>,
    fragment_ttl_minutes: Option<u32>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawEndpointConfig {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawScheduleConfig {
    default_wake_hour: Option<u32>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load ingest config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<IngestConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load ingest config from the default path `/etc/glade/ingest.toml`.
pub fn load_config() -> Result<IngestConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/glade/ingest.toml"))
}

/// Load ingest config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<IngestConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let server = ServerConfig {
        bind: raw
            .server
            .and_then(|s| s.bind)
            .unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
    };

    let storage = match raw.storage {
        Some(s) => StorageConfig {
            sqlite_path: s
                .sqlite_path
                .unwrap_or_else(|| "/var/lib/glade/ingest.sqlite3".to_owned()),
            fragment_ttl_minutes: s.fragment_ttl_minutes.unwrap_or(60),
            sweep_interval_secs: s.sweep_interval_secs.unwrap_or(60),
        },
        None => StorageConfig {
            sqlite_path: "/var/lib/glade/ingest.sqlite3".to_owned(),
            fragment_ttl_minutes: 60,
            sweep_interval_secs: 60,
        },
    };
    if storage.fragment_ttl_minutes == 0 {
        return Err(ConfigError::InvalidValue(
            "storage.fragment_ttl_minutes must be at least 1".to_owned(),
        ));
    }
    if storage.sweep_interval_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "storage.sweep_interval_secs must be at least 1".to_owned(),
        ));
    }

    let lineage = load_endpoint(raw.lineage, "lineage")?;
    let downstream = load_endpoint(raw.downstream, "downstream")?;

    let schedule = ScheduleConfig {
        default_wake_hour: raw
            .schedule
            .and_then(|s| s.default_wake_hour)
            .unwrap_or(8),
    };
    if schedule.default_wake_hour > 23 {
        return Err(ConfigError::InvalidValue(format!(
            "schedule.default_wake_hour must be 0..=23, got {}",
            schedule.default_wake_hour
        )));
    }

    Ok(IngestConfig {
        schema_version,
        server,
        storage,
        lineage,
        downstream,
        schedule,
    })
}

fn load_endpoint(
    raw: Option<RawEndpointConfig>,
    section: &str,
) -> Result<EndpointConfig, ConfigError> {
    let raw = raw.ok_or_else(|| ConfigError::MissingField(section.to_owned()))?;
    let base_url = raw
        .base_url
        .ok_or_else(|| ConfigError::MissingField(format!("{section}.base_url")))?;
    Ok(EndpointConfig {
        base_url,
        timeout_ms: raw.timeout_ms.unwrap_or(10_000),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
