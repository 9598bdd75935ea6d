//! graph-herder - Distributed crawler flow control
//!
//! CLI entry point: runs a supervised pool of worker loops, watches
//! queue depths, or clears shared state.

use clap::Parser;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use graph_herder::config::{
    instance_id, parse_queue_weights, CliArgs, Command, CrawlerOptions,
};
use graph_herder::error::{ConfigError, LimiterError};
use graph_herder::limiter::{BaselineProbe, ComputeBudgetLimiter, ComputeOptions};
use graph_herder::processor::NullProcessor;
use graph_herder::providers::{ProviderOptions, ProviderRegistry, Providers};
use graph_herder::queue::{
    AttenuatedQueue, AttenuationOptions, PriorityQueueSet, QueueChain, TransportQueue,
};
use graph_herder::request::Request;
use graph_herder::supervisor::{CrawlerSupervisor, LoopContext};
use graph_herder::token::{CallCapOptions, RateLimitedTokenPool, TokenPool};
use graph_herder::tracker::{DistributedRequestTracker, TrackerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("graph_herder=info".parse().unwrap()),
        )
        .init();

    // Parse CLI arguments
    let args = CliArgs::parse();

    // Handle Ctrl+C
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        if shutdown_clone.load(Ordering::Relaxed) {
            eprintln!("\nForce shutdown!");
            std::process::exit(130);
        }
        eprintln!("\nShutting down gracefully... (press Ctrl+C again to force)");
        shutdown_clone.store(true, Ordering::SeqCst);
    })?;

    match args.command.clone() {
        Command::Run {
            tokens,
            count,
            delay_ms,
            weights,
            provider,
            orgs,
            prefix,
            seeds,
        } => {
            run_herder(
                &args, &tokens, count, delay_ms, &weights, &provider, &orgs, &prefix, &seeds,
                shutdown,
            )
            .await?
        }

        Command::Status {
            watch,
            interval,
            format,
            provider,
            prefix,
            weights,
        } => run_status(&args, watch, interval, &format, &provider, &prefix, &weights, shutdown).await?,

        Command::Flush {
            yes,
            provider,
            prefix,
            weights,
        } => run_flush(&args, yes, &provider, &prefix, &weights).await?,
    }

    Ok(())
}

/// Baseline probe that measures a transport round-trip, the closest
/// cheap stand-in for upstream latency available to every provider
struct TransportProbe {
    transport: Arc<dyn TransportQueue>,
}

#[async_trait::async_trait]
impl BaselineProbe for TransportProbe {
    async fn round_trip(&self) -> Result<(), LimiterError> {
        self.transport
            .info()
            .await
            .map(|_| ())
            .map_err(|e| LimiterError::Probe(e.to_string()))
    }
}

async fn build_providers(
    redis_url: &str,
    provider: &str,
    prefix: &str,
    queue_names: Vec<String>,
) -> anyhow::Result<Providers> {
    let registry = ProviderRegistry::with_defaults();
    let factory = registry.resolve(provider)?;
    let options = ProviderOptions {
        redis_url: redis_url.to_string(),
        key_prefix: prefix.to_string(),
        queue_names,
        ..Default::default()
    };
    Ok(factory.build(&options).await?)
}

fn build_tracker(providers: &Providers, prefix: &str) -> Arc<DistributedRequestTracker> {
    Arc::new(DistributedRequestTracker::new(
        Arc::clone(&providers.locks),
        Arc::clone(&providers.tags),
        TrackerOptions {
            key_prefix: format!("{prefix}:track"),
            ..Default::default()
        },
    ))
}

#[allow(clippy::too_many_arguments)]
async fn run_herder(
    args: &CliArgs,
    tokens: &str,
    count: usize,
    delay_ms: u64,
    weights: &str,
    provider: &str,
    orgs: &[String],
    prefix: &str,
    seeds: &[String],
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let weights = parse_queue_weights(weights)?;
    let options = CrawlerOptions::from_run_args(count, delay_ms, orgs)?;
    let queue_names: Vec<String> = weights.iter().map(|(name, _)| name.clone()).collect();

    let providers = build_providers(&args.redis, provider, prefix, queue_names.clone()).await?;
    let tracker = build_tracker(&providers, prefix);

    let queues = Arc::new(PriorityQueueSet::new());
    for (transport, (_, weight)) in providers.transports.iter().zip(weights.iter()) {
        let attenuated = Arc::new(AttenuatedQueue::new(
            Arc::clone(transport),
            AttenuationOptions::default(),
        ));
        queues
            .add_queue(
                Arc::new(QueueChain::new(attenuated, Arc::clone(&tracker))),
                *weight,
            )
            .await;
    }

    let pool = Arc::new(TokenPool::from_spec(tokens).map_err(ConfigError::TokenSpec)?);
    tracing::info!(tokens = pool.len(), "credential pool loaded");
    let limited = Arc::new(RateLimitedTokenPool::new(
        pool,
        Arc::clone(&providers.call_limiter),
        CallCapOptions::default(),
    ));

    let probe = Arc::new(TransportProbe {
        transport: Arc::clone(&providers.transports[0]),
    });
    let compute = Arc::new(ComputeBudgetLimiter::new(
        Arc::clone(&providers.compute_limiter),
        probe,
        ComputeOptions::default(),
    ));

    let ctx = LoopContext {
        queues: Arc::clone(&queues),
        tokens: limited,
        compute,
        // The traversal layer plugs in here; the built-in processor
        // acknowledges everything without touching the network.
        processor: Arc::new(NullProcessor),
        idle_delay: Duration::from_millis(500),
    };

    if !seeds.is_empty() {
        let seed_queue = if queue_names.iter().any(|n| n == "normal") {
            "normal"
        } else {
            queue_names[0].as_str()
        };
        let requests: Vec<Request> = seeds
            .iter()
            .filter_map(|seed| {
                let Some((kind, url)) = seed.split_once(':') else {
                    tracing::warn!(seed = %seed, "ignoring malformed seed, expected kind:url");
                    return None;
                };
                Some(Request::new(kind, url))
            })
            .collect();
        let seeded = requests.len();
        queues.push(seed_queue, requests).await?;
        tracing::info!(count = seeded, queue = seed_queue, "seeded requests");
    }

    let supervisor = Arc::new(CrawlerSupervisor::new(&instance_id(), ctx, options));
    supervisor.run().await?;
    tracing::info!(count, "supervisor running");

    let mut last_report = std::time::Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if last_report.elapsed() >= Duration::from_secs(60) {
            last_report = std::time::Instant::now();
            if let Ok(status) = supervisor.status().await {
                let queued: u64 = status.queues.iter().map(|q| q.count).sum();
                tracing::info!(
                    health = %status.health,
                    loops = status.loops.len(),
                    queued,
                    "herder status"
                );
            }
        }
    }

    tracing::info!("stopping worker loops");
    supervisor.stop().await?;
    Ok(())
}

async fn run_status(
    args: &CliArgs,
    watch: bool,
    interval: u64,
    format: &str,
    provider: &str,
    prefix: &str,
    weights: &str,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let queue_names: Vec<String> = parse_queue_weights(weights)?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    let providers = build_providers(&args.redis, provider, prefix, queue_names).await?;

    loop {
        let mut infos = Vec::with_capacity(providers.transports.len());
        for transport in &providers.transports {
            infos.push(transport.info().await?);
        }

        if format == "json" {
            println!("{}", serde_json::to_string_pretty(&infos)?);
        } else {
            let total: u64 = infos.iter().map(|i| i.count).sum();
            println!("queues ({total} requests):");
            for info in &infos {
                println!("  {:<12} {}", info.name, info.count);
            }
        }

        if !watch || shutdown.load(Ordering::Relaxed) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
    Ok(())
}

async fn run_flush(
    args: &CliArgs,
    yes: bool,
    provider: &str,
    prefix: &str,
    weights: &str,
) -> anyhow::Result<()> {
    if !yes {
        print!("This clears all queues and tracker tags. Continue? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let queue_names: Vec<String> = parse_queue_weights(weights)?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    let providers = build_providers(&args.redis, provider, prefix, queue_names).await?;

    for transport in &providers.transports {
        transport.flush().await?;
        println!("flushed queue '{}'", transport.name());
    }
    let tracker = build_tracker(&providers, prefix);
    let removed = tracker.flush().await?;
    println!("removed {removed} tracker tags");
    Ok(())
}
