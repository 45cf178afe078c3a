//! Common test fixtures for engine integration tests
//!
//! Consolidates engine construction against the simulated backend so the
//! suites share one way of wiring backend, capabilities, device context,
//! and configuration.

// Each suite compiles this module separately and uses a subset of it
#![allow(dead_code)]

use std::sync::Arc;

use unipool::{
    AllocationProperties, DeviceContext, EngineConfig, MemoryBackend, MemoryType, PoolingEngine,
    SimBackend, StaticCapabilities,
};

/// Engine plus the handles tests poke at.
pub struct EngineFixture {
    pub backend: Arc<SimBackend>,
    pub device: Arc<DeviceContext>,
    pub engine: PoolingEngine,
}

/// Build an engine over a fresh simulated backend.
pub fn engine_fixture(config: EngineConfig) -> EngineFixture {
    let backend = Arc::new(SimBackend::new());
    let device = Arc::new(DeviceContext::with_max_pools(8));
    let engine = PoolingEngine::new(
        Arc::clone(&backend) as Arc<dyn MemoryBackend>,
        Arc::new(StaticCapabilities::all_supported()),
        config,
        Arc::clone(&device),
    )
    .expect("engine construction failed");
    EngineFixture {
        backend,
        device,
        engine,
    }
}

/// A second (or third...) owner context on the same device.
pub fn attach_engine(fixture: &EngineFixture, config: EngineConfig) -> PoolingEngine {
    PoolingEngine::new(
        Arc::clone(&fixture.backend) as Arc<dyn MemoryBackend>,
        Arc::new(StaticCapabilities::all_supported()),
        config,
        Arc::clone(&fixture.device),
    )
    .expect("engine construction failed")
}

/// Fixture with an explicit device pool ceiling.
pub fn engine_fixture_with_ceiling(config: EngineConfig, max_pools: u32) -> EngineFixture {
    let backend = Arc::new(SimBackend::new());
    let device = Arc::new(DeviceContext::with_max_pools(max_pools));
    let engine = PoolingEngine::new(
        Arc::clone(&backend) as Arc<dyn MemoryBackend>,
        Arc::new(StaticCapabilities::all_supported()),
        config,
        Arc::clone(&device),
    )
    .expect("engine construction failed");
    EngineFixture {
        backend,
        device,
        engine,
    }
}

/// Default device-memory allocation properties.
pub fn device_props() -> AllocationProperties {
    AllocationProperties::new(MemoryType::Device)
}

/// Default host-memory allocation properties.
pub fn host_props() -> AllocationProperties {
    AllocationProperties::new(MemoryType::Host)
}

/// Quiet engine config for tests: no background cleaner.
pub fn test_config() -> EngineConfig {
    EngineConfig::default().with_start_cleaner(false)
}
