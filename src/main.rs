//! biz-router command line.
//!
//! # Architecture Overview
//!
//! ```text
//!   discovery / static config                 transport (external)
//!            │                                     ▲      │
//!            ▼                                     │      │ CallOutcome
//!   ┌─────────────────┐   ┌──────────────────┐     │      ▼
//!   │    topology     │──▶│  load_balancer   │─────┘  ┌─────────┐
//!   │ snapshot/manager│   │ selector/replica │◀───────│ health  │
//!   └─────────────────┘   └──────────────────┘        └─────────┘
//!            ▲                      ▲
//!            │                      │ backup providers
//!   ┌─────────────────┐   ┌──────────────────┐
//!   │     config      │   │    resilience    │
//!   │ policies/reload │   │ retry/rate limit │
//!   └─────────────────┘   └──────────────────┘
//! ```
//!
//! Commands: `dump` prints the topology built from a config, `route`
//! shows the call plan for a key, `simulate` drives synthetic traffic with
//! injected failures, `watch` runs the background loops until Ctrl-C.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use biz_router::config::{load_config, ConfigWatcher, RouterConfig};
use biz_router::health::CallOutcome;
use biz_router::load_balancer::{MatchTags, RequestType};
use biz_router::observability::logging;
use biz_router::{Router, Shutdown};

#[derive(Parser)]
#[command(name = "biz-router")]
#[command(about = "Adaptive provider selection, health feedback and retry decisions", long_about = None)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, default_value = "router.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the topology snapshot built from the config
    Dump,
    /// Show the providers selected for one key
    Route {
        #[arg(short, long)]
        biz: String,
        #[arg(short, long)]
        key: u64,
        /// Required tag, `name=value`; repeatable
        #[arg(short, long)]
        tag: Vec<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Send synthetic traffic and report how weights adapt
    Simulate {
        #[arg(short, long)]
        biz: String,
        #[arg(short = 'n', long, default_value_t = 10_000)]
        calls: u64,
        /// Provider address that fails; repeatable
        #[arg(short, long)]
        fail: Vec<String>,
        /// Failure probability of the failing providers
        #[arg(long, default_value_t = 1.0)]
        fail_rate: f64,
        /// Mean latency of healthy calls in milliseconds
        #[arg(long, default_value_t = 5)]
        latency_ms: u64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Run the refresh, metrics and config reload loops until Ctrl-C
    Watch,
}

#[derive(Serialize)]
struct PlannedView {
    partition: u32,
    version: i64,
    provider: String,
    request_type: &'static str,
    weight: u32,
}

#[derive(Serialize)]
struct PlanView {
    biz: String,
    key: u64,
    generation: u64,
    version: Option<i64>,
    calls: Vec<PlannedView>,
    misses: Vec<String>,
}

fn request_type_name(request_type: RequestType) -> &'static str {
    match request_type {
        RequestType::Normal => "normal",
        RequestType::Probe => "probe",
        RequestType::Copy => "copy",
    }
}

fn parse_tags(raw: &[String]) -> Result<Option<MatchTags>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut tags = BTreeMap::new();
    for entry in raw {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("tag `{entry}` is not name=value"))?;
        tags.insert(name.to_string(), value.to_string());
    }
    Ok(Some(MatchTags::require(tags)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    logging::init(&config.observability.log_level);

    tracing::info!(
        path = %cli.config.display(),
        nodes = config.topology.len(),
        policies = config.policies.len(),
        hash_policy = ?config.misc.hash_policy,
        "Configuration loaded"
    );

    let router = Router::from_config(&config)?;

    match cli.command {
        Commands::Dump => dump(&router),
        Commands::Route { biz, key, tag, json } => route(&router, &biz, key, &tag, json)?,
        Commands::Simulate {
            biz,
            calls,
            fail,
            fail_rate,
            latency_ms,
            seed,
        } => simulate(&router, &biz, calls, &fail, fail_rate, latency_ms, seed),
        Commands::Watch => watch(router, &cli.config, &config).await?,
    }
    Ok(())
}

fn dump(router: &Router) {
    let Some(snapshot) = router.snapshot() else {
        println!("no topology published");
        return;
    };
    print!("{}", snapshot.dump());
    let misc = router.topology().misc();
    for biz in snapshot.biz_names() {
        for version in snapshot.versions(&biz) {
            if let Some(info) = snapshot.version_info(&biz, version, &misc) {
                println!(
                    "{biz} v{version}: partitions={} subscribed={} healthy={} stopped={}",
                    info.part_count, info.subscribe_count, info.health_count, info.stop_count
                );
            }
        }
        println!("{biz} protocol versions: {:?}", snapshot.protocol_versions(&biz));
    }
}

fn route(router: &Router, biz: &str, key: u64, tags: &[String], json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let tags = parse_tags(tags)?;
    let plan = router.plan(biz, key, tags.as_ref());
    let view = PlanView {
        biz: plan.biz_name.clone(),
        key,
        generation: plan.generation,
        version: plan.version,
        calls: plan
            .calls
            .iter()
            .map(|c| PlannedView {
                partition: c.partition_id,
                version: c.version,
                provider: c.provider.spec().to_string(),
                request_type: request_type_name(c.request_type),
                weight: c.provider.weight(),
            })
            .collect(),
        misses: plan.misses.iter().map(|m| m.error.to_string()).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    println!("{} key={} generation={} version={:?}", view.biz, view.key, view.generation, view.version);
    for call in &view.calls {
        println!(
            "  partition {} v{} {} {} weight={}",
            call.partition, call.version, call.request_type, call.provider, call.weight
        );
    }
    for miss in &view.misses {
        println!("  miss: {miss}");
    }
    Ok(())
}

fn simulate(router: &Router, biz: &str, calls: u64, failing: &[String], fail_rate: f64, latency_ms: u64, seed: u64) {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut served: HashMap<String, u64> = HashMap::new();
    let mut misses = 0u64;

    for _ in 0..calls {
        let key = rng.u64(..);
        let plan = router.plan(biz, key, None);
        misses += plan.misses.len() as u64;
        for call in &plan.calls {
            let spec = call.provider.spec().to_string();
            let latency = Duration::from_micros(rng.u64(latency_ms * 500..=latency_ms * 1_500).max(1));
            let fails = failing.contains(&spec) && rng.f64() < fail_rate;
            let outcome = if fails {
                CallOutcome::failure(latency)
            } else {
                CallOutcome::success(latency)
            };
            router.report(call.provider.id(), &outcome);
            if call.request_type == RequestType::Normal {
                *served.entry(spec).or_default() += 1;
            }
        }
    }

    let Some(snapshot) = router.snapshot() else {
        println!("no topology published");
        return;
    };
    println!("{calls} calls, {misses} misses");
    if let Some(biz_snapshot) = snapshot.biz(biz) {
        let mut providers: Vec<_> = biz_snapshot.providers().collect();
        providers.sort_by(|a, b| a.spec().cmp(b.spec()));
        for p in providers {
            println!(
                "  {:<24} weight={:>3} current={:>3} latency_ms={:>7.2} error_ratio={:.3} served={}",
                p.spec(),
                p.weight(),
                p.current_weight(),
                p.chain().latency_ms(),
                p.chain().error_ratio(),
                served.get(p.spec()).copied().unwrap_or(0)
            );
        }
    }
    if let Some(stats) = snapshot.biz_stats(biz, &router.topology().misc()) {
        println!(
            "  avg_weight={:.1} avg_latency_ms={:.2} degrade_ratio={:.3} probes={} copies={} retries={} streams={}",
            stats.avg_weight,
            stats.avg_latency_ms,
            stats.degrade_ratio,
            stats.probe_count,
            stats.copy_count,
            stats.retry_count,
            stats.stream_count
        );
    }
}

async fn watch(router: Router, path: &std::path::Path, config: &RouterConfig) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = Shutdown::new();
    let (watcher, reloads) = ConfigWatcher::new(path, config.clone());
    let _watch_handle = watcher.run()?;

    router.spawn_background(&shutdown, router.static_topology(), Some(reloads));
    tracing::info!(bizs = config.topology.len(), "Router running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    let timeout = Duration::from_millis(config.misc.drain_timeout_ms);
    let stragglers = shutdown.shutdown(timeout).await;
    if !stragglers.is_empty() {
        tracing::warn!(?stragglers, "Some background tasks did not stop in time");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
