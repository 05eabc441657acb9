//! Application configuration.
//!
//! Aggregates every module's options into a single `DispatchConfig` that can
//! be loaded from a YAML file or environment variables. Environment
//! variables use the `DISPATCH` prefix with `__` as the section separator,
//! e.g. `DISPATCH__OUTBOX__POLLING_INTERVAL_MS=1000`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::audit::{AuditAlertOptions, AuditRetentionOptions};
use crate::health::HeartbeatOptions;
use crate::outbox::OutboxProcessingOptions;
use crate::pipeline::{
    BatchOptions, ChannelMode, ChannelOptions, FullMode, HybridWait, ParkWait, SpinWait,
    WaitStrategy, YieldWait,
};
use crate::saga::{CachedSagaStoreOptions, SagaHealthOptions, SagaTimeoutOptions};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "dispatch.yaml";
/// Environment variable for the configuration file path.
pub const CONFIG_ENV_VAR: &str = "DISPATCH_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DISPATCH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DISPATCH_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Serde-facing wait strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategyKind {
    /// Busy spin.
    Spin,
    /// Cooperative yield.
    Yield,
    /// OS-level park.
    Park,
    /// Spin, then yield, then park.
    #[default]
    Hybrid,
}

impl WaitStrategyKind {
    /// Build the strategy this selector names.
    pub fn build(&self) -> Arc<dyn WaitStrategy> {
        match self {
            Self::Spin => Arc::new(SpinWait),
            Self::Yield => Arc::new(YieldWait),
            Self::Park => Arc::new(ParkWait::new()),
            Self::Hybrid => Arc::new(HybridWait::default()),
        }
    }
}

/// Serde-facing channel settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// `true` for an unbounded channel.
    pub unbounded: bool,
    /// Capacity when bounded. Default: 1000.
    pub capacity: usize,
    /// Full-mode when bounded: `wait`, `drop_newest`, or `drop_oldest`.
    pub full_mode: FullModeSetting,
    /// Hint: at most one reader thread.
    pub single_reader: bool,
    /// Hint: at most one writer thread.
    pub single_writer: bool,
    /// Blocking strategy.
    pub wait_strategy: WaitStrategyKind,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            unbounded: false,
            capacity: 1000,
            full_mode: FullModeSetting::Wait,
            single_reader: false,
            single_writer: false,
            wait_strategy: WaitStrategyKind::Hybrid,
        }
    }
}

/// Serde-facing full-mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullModeSetting {
    #[default]
    Wait,
    DropNewest,
    DropOldest,
}

impl From<FullModeSetting> for FullMode {
    fn from(setting: FullModeSetting) -> Self {
        match setting {
            FullModeSetting::Wait => Self::Wait,
            FullModeSetting::DropNewest => Self::DropNewest,
            FullModeSetting::DropOldest => Self::DropOldest,
        }
    }
}

impl ChannelSettings {
    /// Convert to runtime channel options.
    pub fn to_options(&self) -> ChannelOptions {
        let mode = if self.unbounded {
            ChannelMode::Unbounded
        } else {
            ChannelMode::Bounded {
                capacity: self.capacity,
                full_mode: self.full_mode.into(),
            }
        };
        ChannelOptions {
            mode,
            single_reader: self.single_reader,
            single_writer: self.single_writer,
            wait_strategy: self.wait_strategy.build(),
        }
    }
}

/// Serde-facing batch processor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Upper bound on items per batch. Default: 100.
    pub max_batch_size: usize,
    /// Flush deadline for a partial batch, in milliseconds. Default: 50.
    pub max_batch_delay_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_delay_ms: 50,
        }
    }
}

impl BatchSettings {
    /// Convert to runtime batch options.
    pub fn to_options(&self) -> BatchOptions {
        BatchOptions {
            max_batch_size: self.max_batch_size,
            max_batch_delay: Duration::from_millis(self.max_batch_delay_ms),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Outbox background loop.
    pub outbox: OutboxProcessingOptions,
    /// Pipeline channel defaults.
    pub channel: ChannelSettings,
    /// Batch processor defaults.
    pub batch: BatchSettings,
    /// Saga timeout delivery loop.
    pub saga_timeouts: SagaTimeoutOptions,
    /// Saga store cache overlay.
    pub saga_cache: CachedSagaStoreOptions,
    /// Saga health probe thresholds.
    pub saga_health: SagaHealthOptions,
    /// Job heartbeat thresholds.
    pub heartbeats: HeartbeatOptions,
    /// Audit retention sweep.
    pub audit_retention: AuditRetentionOptions,
    /// Audit alert engine.
    pub audit_alerts: AuditAlertOptions,
}

impl DispatchConfig {
    /// Load from the default file (or `DISPATCH_CONFIG`) plus environment
    /// overrides. A missing file is fine; environment alone is enough.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from an explicit file plus environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Initialize `tracing` from `DISPATCH_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
