use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::pool::{PoolConfig, PoolError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Malformed { var: &'static str, value: String },
    #[error("pool: {0}")]
    Pool(#[from] PoolError),
}

/// Process configuration, read once at startup from `SLOTGATE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tax_rate_bps: u32,
    pub pool: PoolConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their default; set but
    /// malformed keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            size: parse_or(&lookup, "SLOTGATE_POOL_SIZE", defaults.size)?,
            shares: match lookup("SLOTGATE_POOL_SHARES") {
                Some(raw) => parse_shares(&raw).ok_or(ConfigError::Malformed {
                    var: "SLOTGATE_POOL_SHARES",
                    value: raw,
                })?,
                None => defaults.shares,
            },
            high_water_pct: parse_or(&lookup, "SLOTGATE_POOL_HIGH_WATER_PCT", defaults.high_water_pct)?,
            acquire_timeout: Duration::from_millis(parse_or(
                &lookup,
                "SLOTGATE_POOL_ACQUIRE_TIMEOUT_MS",
                defaults.acquire_timeout.as_millis() as u64,
            )?),
            ..defaults
        };
        pool.validate()?;

        let tax_rate_bps = parse_or(&lookup, "SLOTGATE_TAX_RATE_BPS", 1500u32)?;
        if tax_rate_bps > crate::limits::MAX_TAX_RATE_BPS {
            return Err(ConfigError::Malformed {
                var: "SLOTGATE_TAX_RATE_BPS",
                value: tax_rate_bps.to_string(),
            });
        }

        Ok(Self {
            port: parse_or(&lookup, "SLOTGATE_PORT", 5444)?,
            bind: lookup("SLOTGATE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("SLOTGATE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parse_or(&lookup, "SLOTGATE_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "SLOTGATE_COMPACT_THRESHOLD", 1000)?,
            metrics_port: match lookup("SLOTGATE_METRICS_PORT") {
                Some(raw) => Some(parse_value("SLOTGATE_METRICS_PORT", raw)?),
                None => None,
            },
            tax_rate_bps,
            pool,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotgate.wal")
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(raw) => parse_value(var, raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(var: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Malformed { var, value: raw })
}

/// `"60/30/10"` → interactive/agent/system percentages.
fn parse_shares(raw: &str) -> Option<[u32; 3]> {
    let parts: Vec<u32> = raw
        .split('/')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    <[u32; 3]>::try_from(parts).ok()
}
