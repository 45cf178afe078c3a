//! Stress and inspection tool for the pooling engine.
//!
//! Drives the engine against the simulated backend with a randomized
//! allocate/free workload and prints the resulting statistics, either
//! human-readable or as JSON for scripting.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use unipool::{
    AllocationProperties, DeviceAddress, DeviceContext, EngineConfig, MemoryBackend, MemoryType,
    PoolingEngine, SimBackend, StaticCapabilities, Toggle,
};

#[derive(Parser)]
#[command(name = "unipool_stress", about = "unipool engine stress driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a randomized allocate/free workload and report stats
    Stress {
        /// Number of allocate/free operations
        #[arg(long, default_value_t = 100_000)]
        ops: u64,
        /// Largest request size in bytes
        #[arg(long, default_value_t = 256 * 1024)]
        max_size: u64,
        /// Use the size-class pools manager instead of a single pool
        #[arg(long)]
        manager: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved configuration for the current environment
    Config {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    unipool::logging::init_logging_from_env();
    let cli = Cli::parse();

    match cli.command {
        Command::Stress {
            ops,
            max_size,
            manager,
            json,
        } => run_stress(ops, max_size, manager, json),
        Command::Config { json } => show_config(json),
    }
}

fn run_stress(ops: u64, max_size: u64, manager: bool, json: bool) -> anyhow::Result<()> {
    let backend = Arc::new(SimBackend::new());
    let device = Arc::new(DeviceContext::for_backend(
        backend.as_ref(),
        2 * 1024 * 1024,
    ));

    let mut config = EngineConfig::from_env();
    if manager {
        config = config.with_manager_mode(Toggle::On);
    }
    let engine = PoolingEngine::new(
        Arc::clone(&backend) as Arc<dyn MemoryBackend>,
        Arc::new(StaticCapabilities::all_supported()),
        config,
        device,
    )?;

    // Deterministic xorshift workload; no external RNG needed here
    let mut rng_state: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut next = move || {
        rng_state ^= rng_state << 13;
        rng_state ^= rng_state >> 7;
        rng_state ^= rng_state << 17;
        rng_state
    };

    let props = AllocationProperties::new(MemoryType::Device);
    let mut live: Vec<DeviceAddress> = Vec::new();
    let started = std::time::Instant::now();

    for _ in 0..ops {
        let roll = next();
        if roll % 3 == 0 && !live.is_empty() {
            let idx = (roll as usize / 3) % live.len();
            let addr = live.swap_remove(idx);
            engine.free(addr)?;
        } else {
            let size = (next() % max_size).max(1);
            let addr = engine.allocate(size, &props)?;
            live.push(addr);
        }
    }
    for addr in live.drain(..) {
        engine.free(addr)?;
    }

    let elapsed = started.elapsed();
    let report = engine.report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let stats = report.stats;
        println!("ops:               {}", ops);
        println!("elapsed:           {:?}", elapsed);
        println!("pooled allocs:     {}", stats.pooled_allocs);
        println!("reuse hits:        {}", stats.reuse_hits);
        println!("fallback allocs:   {}", stats.fallback_allocs);
        println!("pooled frees:      {}", stats.pooled_frees);
        println!("reuse inserts:     {}", stats.reuse_inserts);
        println!("raw frees:         {}", stats.raw_frees);
        println!("pooling ratio:     {:.1}%", stats.pooling_ratio() * 100.0);
        println!(
            "pools (host/dev):  {}/{}",
            report.host_pool_count, report.device_pool_count
        );
        println!(
            "budget:            {}/{}",
            report.budget_active, report.budget_max
        );
        println!("backend live:      {}", backend.live_allocations());
    }
    Ok(())
}

fn show_config(json: bool) -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    let caps = StaticCapabilities::all_supported();
    let policy = config.resolve(&caps);

    if json {
        let value = serde_json::json!({
            "host_pooling": policy.host_pooling,
            "device_pooling": policy.device_pooling,
            "manager_mode": policy.manager_mode,
            "track_residency": policy.track_residency,
            "aggregator": policy.aggregator,
            "pooling_threshold": config.pooling_threshold,
            "single_pool_size": config.single_pool_size,
            "reuse_byte_budget": config.reuse.byte_budget,
            "reuse_max_cached_size": config.reuse.max_cached_size,
            "reuse_min_utilization": config.reuse.min_alloc_utilization,
            "reuse_max_age_ms": config.reuse.max_age.as_millis(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("resolved policy:  {:?}", policy);
        println!("threshold:        {} bytes", config.pooling_threshold);
        println!("single pool:      {} bytes", config.single_pool_size);
        println!("reuse budget:     {} bytes", config.reuse.byte_budget);
        println!("reuse max entry:  {} bytes", config.reuse.max_cached_size);
        println!("reuse util floor: {}", config.reuse.min_alloc_utilization);
        println!("reuse max age:    {:?}", config.reuse.max_age);
    }
    Ok(())
}
