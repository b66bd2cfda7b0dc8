//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::ops::retry::RetryPolicy;

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Port for the observer WebSocket and health endpoint.
    pub port: u16,
    pub grid: GridConfig,
    pub device: DeviceConfig,
    pub scheduler: SchedulerConfig,
    /// Period of the full warehouse-data broadcast.
    pub snapshot_interval: Duration,
    /// Capacity of the fan-out channel before slow observers lag.
    pub broadcast_capacity: usize,
    /// Directory for the rolling log file (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

/// Storage grid dimensions, used once to seed cells.
#[derive(Debug, Clone, Copy)]
pub struct GridConfig {
    pub rows: u32,
    pub cols: u32,
}

/// Device gateway settings.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Address registered at startup, if any.
    pub address: Option<String>,
    /// Per-command timeout.
    pub timeout: Duration,
}

/// Auto-task scheduler pacing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay after a task that reached the device (success or failure).
    pub dispatch_delay: Duration,
    /// Delay after a task that resolved to no command.
    pub noop_delay: Duration,
    /// Re-check delay while a manual command holds the gate.
    pub busy_retry_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/warehouse.db"),
            port: 5001,
            grid: GridConfig::default(),
            device: DeviceConfig::default(),
            scheduler: SchedulerConfig::default(),
            snapshot_interval: Duration::from_secs(3),
            broadcast_capacity: 256,
            log_dir: None,
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { rows: 3, cols: 4 }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_delay: Duration::from_millis(2000),
            noop_delay: Duration::from_millis(1000),
            busy_retry_delay: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

impl WarehouseConfig {
    /// Build from `WAREHOUSE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parsed(key).map(Duration::from_millis).unwrap_or(default)
        };

        let rows = parsed("WAREHOUSE_GRID_ROWS").unwrap_or(defaults.grid.rows as u64);
        let cols = parsed("WAREHOUSE_GRID_COLS").unwrap_or(defaults.grid.cols as u64);
        for (key, value) in [("WAREHOUSE_GRID_ROWS", rows), ("WAREHOUSE_GRID_COLS", cols)] {
            if value == 0 || value > u32::MAX as u64 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("grid dimension must be positive, got {value}"),
                });
            }
        }

        let max_attempts = parsed("WAREHOUSE_RETRY_ATTEMPTS")
            .unwrap_or(defaults.scheduler.retry.max_attempts as u64);
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WAREHOUSE_RETRY_ATTEMPTS".to_string(),
                message: "at least one attempt is required".to_string(),
            });
        }

        let port = lookup("WAREHOUSE_PORT")
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(defaults.port);

        Ok(Self {
            db_path: lookup("WAREHOUSE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port,
            grid: GridConfig {
                rows: rows as u32,
                cols: cols as u32,
            },
            device: DeviceConfig {
                address: lookup("WAREHOUSE_DEVICE_ADDR").filter(|a| !a.trim().is_empty()),
                timeout: parsed("WAREHOUSE_DEVICE_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.device.timeout),
            },
            scheduler: SchedulerConfig {
                dispatch_delay: millis("WAREHOUSE_DISPATCH_DELAY_MS", defaults.scheduler.dispatch_delay),
                noop_delay: millis("WAREHOUSE_NOOP_DELAY_MS", defaults.scheduler.noop_delay),
                busy_retry_delay: millis("WAREHOUSE_BUSY_RETRY_MS", defaults.scheduler.busy_retry_delay),
                retry: RetryPolicy {
                    max_attempts: max_attempts.min(u32::MAX as u64) as u32,
                    backoff: millis("WAREHOUSE_RETRY_BACKOFF_MS", defaults.scheduler.retry.backoff),
                },
            },
            snapshot_interval: parsed("WAREHOUSE_SNAPSHOT_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.snapshot_interval),
            broadcast_capacity: defaults.broadcast_capacity,
            log_dir: lookup("WAREHOUSE_LOG_DIR").map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_original_deployment() {
        let config = WarehouseConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.port, 5001);
        assert_eq!(config.grid.rows, 3);
        assert_eq!(config.grid.cols, 4);
        assert_eq!(config.device.timeout, Duration::from_secs(10));
        assert!(config.device.address.is_none());
        assert_eq!(config.scheduler.dispatch_delay, Duration::from_secs(2));
        assert_eq!(config.scheduler.noop_delay, Duration::from_secs(1));
        assert_eq!(config.scheduler.retry.max_attempts, 1);
        assert_eq!(config.snapshot_interval, Duration::from_secs(3));
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = WarehouseConfig::from_lookup(lookup_from(&[
            ("WAREHOUSE_PORT", "8088"),
            ("WAREHOUSE_GRID_ROWS", "5"),
            ("WAREHOUSE_DEVICE_ADDR", "192.168.1.40"),
            ("WAREHOUSE_DEVICE_TIMEOUT_SECS", "3"),
            ("WAREHOUSE_RETRY_ATTEMPTS", "3"),
            ("WAREHOUSE_RETRY_BACKOFF_MS", "250"),
            ("WAREHOUSE_LOG_DIR", "/var/log/warehouse"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8088);
        assert_eq!(config.grid.rows, 5);
        assert_eq!(config.grid.cols, 4);
        assert_eq!(config.device.address.as_deref(), Some("192.168.1.40"));
        assert_eq!(config.device.timeout, Duration::from_secs(3));
        assert_eq!(config.scheduler.retry.max_attempts, 3);
        assert_eq!(config.scheduler.retry.backoff, Duration::from_millis(250));
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/warehouse")));
    }

    #[test]
    fn garbage_numbers_fall_back_to_defaults() {
        let config =
            WarehouseConfig::from_lookup(lookup_from(&[("WAREHOUSE_PORT", "not-a-port")])).unwrap();
        assert_eq!(config.port, 5001);
    }

    #[test]
    fn zero_grid_is_rejected() {
        let err = WarehouseConfig::from_lookup(lookup_from(&[("WAREHOUSE_GRID_COLS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("WAREHOUSE_GRID_COLS"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        assert!(
            WarehouseConfig::from_lookup(lookup_from(&[("WAREHOUSE_RETRY_ATTEMPTS", "0")])).is_err()
        );
    }
}
