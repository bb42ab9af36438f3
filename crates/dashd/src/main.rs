//! Dashboard sync driver - runs the cache engine against an in-memory backend

mod backend;
mod workload;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dashcache::{SyncConfig, SyncEngine};
use dashquery::{QueryConfig, QueryService};
use serde::Deserialize;
use tracing::info;

use crate::backend::{BackendConn, MemoryBackend};
use crate::workload::Plan;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON settings file with `sync` and `query` sections
    #[arg(long)]
    config: Option<PathBuf>,

    /// Clinic shown on the dashboard
    #[arg(long, default_value_t = 1)]
    clinic: u32,

    /// Clinics seeded in the backend
    #[arg(long, default_value_t = 3)]
    clinics: u32,

    /// Orders seeded per clinic
    #[arg(long, default_value_t = 25)]
    orders: u64,

    /// Concurrent dataset readers
    #[arg(short, long, default_value_t = 8)]
    consumers: usize,

    /// Loads per reader
    #[arg(short, long, default_value_t = 20)]
    rounds: usize,

    /// Edits made through the reconciler
    #[arg(short, long, default_value_t = 6)]
    mutations: usize,

    /// Orders inserted directly in the backend
    #[arg(long, default_value_t = 3)]
    external_writes: usize,

    /// Pause between loads (ms)
    #[arg(long, default_value_t = 50)]
    think_ms: u64,

    /// Simulated backend latency (ms)
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    /// Fail every Nth backend read (0 = never)
    #[arg(long, default_value_t = 0)]
    fail_every: u64,

    /// Connection pool capacity
    #[arg(long)]
    pool_capacity: Option<usize>,

    /// Dataset TTL (ms)
    #[arg(long)]
    ttl_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    sync: SyncConfig,
    query: QueryConfig,
}

impl Settings {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// File values, then `DASH_*` variables, then command-line flags
    fn resolve(args: &Args) -> Result<Self> {
        let loaded = Self::load(args.config.as_deref())?;
        let mut sync = loaded.sync.with_env_overrides();
        let mut query = loaded.query.with_env_overrides();

        if let Some(ttl_ms) = args.ttl_ms {
            sync.ttl_normal_ms = ttl_ms;
            sync.ttl_critical_ms = sync.ttl_critical_ms.max(ttl_ms);
        }
        if let Some(capacity) = args.pool_capacity {
            query.pool_capacity = capacity;
        }

        sync.validate()?;
        query.validate()?;
        Ok(Self { sync, query })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::resolve(&args)?;

    info!("Starting dashd v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Backend: {} clinics x {} orders, {}ms latency",
        args.clinics, args.orders, args.latency_ms
    );

    let backend = MemoryBackend::seeded(
        args.clinics,
        args.orders,
        Duration::from_millis(args.latency_ms),
        args.fail_every,
    );
    let conns = backend.clone();
    let service = Arc::new(QueryService::new(&settings.query, |n| {
        BackendConn::new(n, conns.clone())
    })?);
    let engine = SyncEngine::new(settings.sync.clone())?;

    let plan = Plan {
        clinic: args.clinic,
        consumers: args.consumers,
        rounds: args.rounds,
        mutations: args.mutations,
        external_writes: args.external_writes,
        think_time: Duration::from_millis(args.think_ms),
    };
    info!("Running workload: {:?}", plan);

    let report = workload::run(&engine, service.clone(), backend.clone(), &plan).await?;

    let stats = engine.stats();
    let query_stats = service.cache().stats();
    let pool = service.pool();

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║          dashd run complete                                  ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!("\nDATASET (clinic {}):", plan.clinic);
    println!("   Loads:            {} ok, {} failed", report.loads, report.load_failures);
    println!("   Edits:            {} persisted, {} rolled back", report.mutations, report.rollbacks);
    println!("   Orders:           {} cached, {} in backend", report.cached_orders, report.backend_orders);
    println!("   Realtime in sync: {}", if report.in_sync { "yes" } else { "no (refreshed)" });
    println!("\nCLIENT CACHE:");
    println!("   Hits / misses:    {} / {}", stats.hits(), stats.misses());
    println!("   Coalesced joins:  {}", stats.coalesced());
    println!("   Fetch failures:   {}", stats.fetch_failures());
    println!("   Hit ratio:        {:.1}%", stats.hit_ratio() * 100.0);
    println!("\nQUERY CACHE:");
    println!("   Hits / misses:    {} / {}", query_stats.hits(), query_stats.misses());
    println!("   Cached results:   {}", service.cache().len());
    println!("\nCONNECTION POOL:");
    println!("   Capacity:         {}", pool.capacity());
    println!("   Peak active:      {}", pool.peak_active());
    println!("   Acquired:         {}", pool.acquired());
    println!("   Timeouts:         {}", pool.timeouts());
    println!("\nBACKEND:");
    println!("   Reads / writes:   {} / {}", backend.reads(), backend.writes());

    engine.clear();
    Ok(())
}
