//! Engine configuration
//!
//! Every pooling feature can be forced on or off through debug/environment
//! overrides; the default (`-1`) leaves the decision to the platform
//! capability query. Numeric knobs for the reuse cache follow the same
//! pattern: unset means built-in default.
//!
//! # Environment Variables
//!
//! - `UNIPOOL_HOST_POOLING`, `UNIPOOL_DEVICE_POOLING`: sub-allocation
//!   pooling per memory type (`-1`/`0`/`1`)
//! - `UNIPOOL_MANAGER_MODE`: size-class pools manager vs single static pool
//! - `UNIPOOL_TRACK_RESIDENCY`: residency tracking inside pools
//! - `UNIPOOL_AGGREGATOR`: small-buffer aggregation
//! - `UNIPOOL_REUSE_BUDGET_MB`, `UNIPOOL_REUSE_MAX_SIZE_MB`,
//!   `UNIPOOL_REUSE_MAX_AGE_MS`, `UNIPOOL_REUSE_UTILIZATION_PCT`: reuse
//!   cache numeric overrides

use std::time::Duration;

use tracing::warn;

use crate::aggregate::AggregatorConfig;
use crate::backend::{MemoryType, PlatformCapabilities};
use crate::error::{PoolResult, UnipoolError};
use crate::pool::{DEFAULT_POOLING_THRESHOLD, DEFAULT_SINGLE_POOL_SIZE};
use crate::reuse::ReuseConfig;

/// Tri-state feature toggle: platform decides unless explicitly forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Toggle {
    /// `-1`: the platform capability query decides
    #[default]
    Default,
    /// `0`: forced off
    Off,
    /// `1`: forced on
    On,
}

impl Toggle {
    /// Parse the conventional `-1`/`0`/`1` override value.
    pub fn parse(value: &str) -> Option<Toggle> {
        match value.trim() {
            "-1" => Some(Toggle::Default),
            "0" => Some(Toggle::Off),
            "1" => Some(Toggle::On),
            _ => None,
        }
    }

    /// Collapse to a concrete decision given the platform's answer.
    pub fn resolve(self, platform_default: bool) -> bool {
        match self {
            Toggle::Default => platform_default,
            Toggle::Off => false,
            Toggle::On => true,
        }
    }

    fn from_env(name: &str) -> Toggle {
        match std::env::var(name) {
            Ok(value) => Toggle::parse(&value).unwrap_or_else(|| {
                warn!(name, value = %value, "unrecognized toggle override, using default");
                Toggle::Default
            }),
            Err(_) => Toggle::Default,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(name, value = %value, "unparsable numeric override ignored");
            None
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host_pooling: Toggle,
    pub device_pooling: Toggle,
    /// Pools-manager mode; off means one static pool per memory type
    pub manager_mode: Toggle,
    pub track_residency: Toggle,
    pub aggregator_enabled: Toggle,
    /// Largest request serviced in single-pool mode
    pub pooling_threshold: u64,
    /// Backing size of the single static pool
    pub single_pool_size: u64,
    pub reuse: ReuseConfig,
    pub aggregator: AggregatorConfig,
    /// Interval between background trim passes
    pub cleaner_interval: Duration,
    /// Spawn the background reuse cleaner
    pub start_cleaner: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            host_pooling: Toggle::Default,
            device_pooling: Toggle::Default,
            manager_mode: Toggle::Default,
            track_residency: Toggle::Default,
            aggregator_enabled: Toggle::Default,
            pooling_threshold: DEFAULT_POOLING_THRESHOLD,
            single_pool_size: DEFAULT_SINGLE_POOL_SIZE,
            reuse: ReuseConfig::default(),
            aggregator: AggregatorConfig::default(),
            cleaner_interval: Duration::from_secs(2),
            start_cleaner: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with environment overrides applied on top.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.host_pooling = Toggle::from_env("UNIPOOL_HOST_POOLING");
        config.device_pooling = Toggle::from_env("UNIPOOL_DEVICE_POOLING");
        config.manager_mode = Toggle::from_env("UNIPOOL_MANAGER_MODE");
        config.track_residency = Toggle::from_env("UNIPOOL_TRACK_RESIDENCY");
        config.aggregator_enabled = Toggle::from_env("UNIPOOL_AGGREGATOR");

        if let Some(mb) = env_u64("UNIPOOL_REUSE_BUDGET_MB") {
            config.reuse.byte_budget = mb * 1024 * 1024;
        }
        if let Some(mb) = env_u64("UNIPOOL_REUSE_MAX_SIZE_MB") {
            config.reuse.max_cached_size = mb * 1024 * 1024;
        }
        if let Some(ms) = env_u64("UNIPOOL_REUSE_MAX_AGE_MS") {
            config.reuse.max_age = Duration::from_millis(ms);
        }
        if let Some(pct) = env_u64("UNIPOOL_REUSE_UTILIZATION_PCT") {
            config.reuse.min_alloc_utilization = (pct.min(100)) as f64 / 100.0;
        }
        config
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.pooling_threshold == 0 {
            return Err(UnipoolError::InvalidConfiguration(
                "pooling threshold cannot be zero".to_string(),
            ));
        }
        if self.single_pool_size <= self.pooling_threshold {
            return Err(UnipoolError::InvalidConfiguration(format!(
                "single pool size {} must exceed the pooling threshold {}",
                self.single_pool_size, self.pooling_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.reuse.min_alloc_utilization) {
            return Err(UnipoolError::InvalidConfiguration(format!(
                "utilization ratio {} outside [0, 1]",
                self.reuse.min_alloc_utilization
            )));
        }
        self.aggregator.validate()
    }

    /// Collapse the toggles against the platform capability answers.
    pub fn resolve(&self, caps: &dyn PlatformCapabilities) -> ResolvedPolicy {
        let debugger = caps.debugger_attached();
        ResolvedPolicy {
            host_pooling: !debugger
                && self
                    .host_pooling
                    .resolve(caps.pooling_supported(MemoryType::Host)),
            device_pooling: !debugger
                && self
                    .device_pooling
                    .resolve(caps.pooling_supported(MemoryType::Device)),
            manager_mode: self.manager_mode.resolve(false),
            track_residency: self.track_residency.resolve(false),
            aggregator: !debugger
                && self
                    .aggregator_enabled
                    .resolve(caps.aggregation_supported()),
        }
    }

    pub fn with_manager_mode(mut self, toggle: Toggle) -> Self {
        self.manager_mode = toggle;
        self
    }

    pub fn with_host_pooling(mut self, toggle: Toggle) -> Self {
        self.host_pooling = toggle;
        self
    }

    pub fn with_device_pooling(mut self, toggle: Toggle) -> Self {
        self.device_pooling = toggle;
        self
    }

    pub fn with_track_residency(mut self, toggle: Toggle) -> Self {
        self.track_residency = toggle;
        self
    }

    pub fn with_aggregator_enabled(mut self, toggle: Toggle) -> Self {
        self.aggregator_enabled = toggle;
        self
    }

    pub fn with_pooling_threshold(mut self, threshold: u64) -> Self {
        self.pooling_threshold = threshold;
        self
    }

    pub fn with_single_pool_size(mut self, size: u64) -> Self {
        self.single_pool_size = size;
        self
    }

    pub fn with_reuse(mut self, reuse: ReuseConfig) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_cleaner_interval(mut self, interval: Duration) -> Self {
        self.cleaner_interval = interval;
        self
    }

    pub fn with_start_cleaner(mut self, start: bool) -> Self {
        self.start_cleaner = start;
        self
    }
}

/// Concrete feature decisions after toggles meet platform capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub host_pooling: bool,
    pub device_pooling: bool,
    pub manager_mode: bool,
    pub track_residency: bool,
    pub aggregator: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticCapabilities;
    use serial_test::serial;

    #[test]
    fn test_toggle_parse() {
        assert_eq!(Toggle::parse("-1"), Some(Toggle::Default));
        assert_eq!(Toggle::parse("0"), Some(Toggle::Off));
        assert_eq!(Toggle::parse("1"), Some(Toggle::On));
        assert_eq!(Toggle::parse("2"), None);
        assert_eq!(Toggle::parse(" 1 "), Some(Toggle::On));
    }

    #[test]
    fn test_toggle_resolve() {
        assert!(Toggle::Default.resolve(true));
        assert!(!Toggle::Default.resolve(false));
        assert!(!Toggle::Off.resolve(true));
        assert!(Toggle::On.resolve(false));
    }

    #[test]
    fn test_resolve_against_capabilities() {
        let caps = StaticCapabilities::all_supported().with_device_pooling(false);
        let policy = EngineConfig::default().resolve(&caps);
        assert!(policy.host_pooling);
        assert!(!policy.device_pooling);
        assert!(!policy.manager_mode);
        assert!(policy.aggregator);

        let forced = EngineConfig::default()
            .with_device_pooling(Toggle::On)
            .resolve(&caps);
        assert!(forced.device_pooling);
    }

    #[test]
    fn test_debugger_overrides_everything() {
        let caps = StaticCapabilities::all_supported();
        caps.set_debugger_attached(true);
        let policy = EngineConfig::default()
            .with_host_pooling(Toggle::On)
            .with_aggregator_enabled(Toggle::On)
            .resolve(&caps);
        assert!(!policy.host_pooling);
        assert!(!policy.device_pooling);
        assert!(!policy.aggregator);
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let bad = EngineConfig::default().with_pooling_threshold(0);
        assert!(bad.validate().is_err());

        let bad = EngineConfig::default()
            .with_pooling_threshold(1024)
            .with_single_pool_size(1024);
        assert!(bad.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_toggles() {
        std::env::set_var("UNIPOOL_MANAGER_MODE", "1");
        std::env::set_var("UNIPOOL_HOST_POOLING", "0");
        let config = EngineConfig::from_env();
        assert_eq!(config.manager_mode, Toggle::On);
        assert_eq!(config.host_pooling, Toggle::Off);
        assert_eq!(config.device_pooling, Toggle::Default);
        std::env::remove_var("UNIPOOL_MANAGER_MODE");
        std::env::remove_var("UNIPOOL_HOST_POOLING");
    }

    #[test]
    #[serial]
    fn test_env_numeric_overrides() {
        std::env::set_var("UNIPOOL_REUSE_BUDGET_MB", "64");
        std::env::set_var("UNIPOOL_REUSE_MAX_AGE_MS", "500");
        std::env::set_var("UNIPOOL_REUSE_UTILIZATION_PCT", "75");
        let config = EngineConfig::from_env();
        assert_eq!(config.reuse.byte_budget, 64 * 1024 * 1024);
        assert_eq!(config.reuse.max_age, Duration::from_millis(500));
        assert!((config.reuse.min_alloc_utilization - 0.75).abs() < 1e-9);
        std::env::remove_var("UNIPOOL_REUSE_BUDGET_MB");
        std::env::remove_var("UNIPOOL_REUSE_MAX_AGE_MS");
        std::env::remove_var("UNIPOOL_REUSE_UTILIZATION_PCT");
    }

    #[test]
    #[serial]
    fn test_env_garbage_is_ignored() {
        std::env::set_var("UNIPOOL_DEVICE_POOLING", "yes");
        std::env::set_var("UNIPOOL_REUSE_BUDGET_MB", "lots");
        let config = EngineConfig::from_env();
        assert_eq!(config.device_pooling, Toggle::Default);
        assert_eq!(
            config.reuse.byte_budget,
            ReuseConfig::default().byte_budget
        );
        std::env::remove_var("UNIPOOL_DEVICE_POOLING");
        std::env::remove_var("UNIPOOL_REUSE_BUDGET_MB");
    }
}
