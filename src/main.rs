use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use market_cache::cache::{CacheStore, KeyBuilder, PriceCache, RedisStore};
use market_cache::strategy::{InvalidationEvent, InvalidationReason, Invalidator};
use market_cache::telemetry::{self, DEFAULT_DIRECTIVE};
use market_cache::{AppConfig, CacheMonitor, HealthCheckResult, ResilientExecutor};

#[derive(Parser)]
#[command(name = "market-cache")]
#[command(about = "Market data cache operations", long_about = None)]
struct Cli {
    /// Redis URL (overrides MARKET_CACHE_REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// Key namespace (overrides MARKET_CACHE_NAMESPACE)
    #[arg(short, long)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One-shot detailed health check of the cache store
    Health {
        /// Retries while the store is unhealthy
        #[arg(long, default_value_t = 3)]
        retries: u32,
    },

    /// Print store memory figures and a monitor snapshot
    Stats,

    /// Run the monitor loop until Ctrl-C
    Monitor,

    /// Remove the cached price of every active symbol
    InvalidateAll,

    /// Remove the cached price of one symbol
    Invalidate {
        /// Symbol, e.g. BTCUSDT
        symbol: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing(DEFAULT_DIRECTIVE)?;

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = Arc::new(RedisStore::connect(&config.redis).await?);

    match cli.command {
        Commands::Health { retries } => {
            let result = store
                .health_check_with_retry(
                    config.monitor.degraded_latency,
                    retries,
                    Duration::from_millis(500),
                )
                .await;
            print_health(&result);
            if !result.status.is_operational() {
                std::process::exit(1);
            }
        }

        Commands::Stats => {
            let info = store.info().await?;
            println!("Cache Store:");
            println!("  Keys:         {}", info.keys);
            println!("  Used memory:  {} bytes", info.used_memory_bytes);
            if info.max_memory_bytes > 0 {
                println!("  Max memory:   {} bytes", info.max_memory_bytes);
            }
            if let Some(utilization) = info.utilization() {
                println!("  Utilization:  {:.1}%", utilization * 100.0);
            }

            let monitor = CacheMonitor::new(config.monitor.clone());
            let health = monitor.poll_health(store.as_ref()).await;
            let stats = monitor.stats();
            println!("Monitor:");
            println!("  Status:       {:?}", health.status);
            println!("  Response:     {}ms", health.response_time_ms);
            println!(
                "  Operations:   {} (hits {}, misses {}, errors {})",
                stats.total_operations, stats.hits, stats.misses, stats.errors
            );
            println!("  Hit rate:     {:.1}%", stats.hit_rate * 100.0);
        }

        Commands::Monitor => {
            let monitor = Arc::new(CacheMonitor::new(config.monitor.clone()));
            let cancel = CancellationToken::new();
            let handle = Arc::clone(&monitor).spawn(store, cancel.clone());

            println!("Monitoring cache store, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            cancel.cancel();
            handle.await?;

            if let Some(health) = monitor.last_health() {
                print_health(&health);
            }
        }

        Commands::InvalidateAll => {
            let event = invalidator(&config, store).invalidate_all().await?;
            print_event(&event);
            if !event.is_complete() {
                std::process::exit(1);
            }
        }

        Commands::Invalidate { ref symbol } => {
            let event = invalidator(&config, store)
                .invalidate_price(symbol, InvalidationReason::Manual)
                .await?;
            print_event(&event);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::from_env()?;
    if let Some(url) = &cli.redis_url {
        config.redis.url = url.clone();
    }
    if let Some(namespace) = &cli.namespace {
        config.namespace = namespace.clone();
    }
    config.validate()?;
    Ok(config)
}

fn invalidator(config: &AppConfig, store: Arc<RedisStore>) -> Invalidator {
    let store: Arc<dyn CacheStore> = store;
    let cache = PriceCache::new(
        store,
        KeyBuilder::new(config.namespace.clone()),
        config.ttl.clone(),
        Arc::new(CacheMonitor::new(config.monitor.clone())),
    );
    let cache_exec = Arc::new(ResilientExecutor::new(
        "cache",
        config.cache_retry.clone(),
        config.cache_breaker.clone(),
    ));
    Invalidator::new(cache, cache_exec)
}

fn print_health(result: &HealthCheckResult) {
    println!("Health: {:?} (HTTP {})", result.status, result.status.to_http_status_code());
    println!("  Response time: {}ms", result.response_time_ms);
    if let Some(keys) = result.keys {
        println!("  Keys:          {}", keys);
    }
    if let Some(utilization) = result.memory_utilization() {
        println!("  Memory:        {:.1}%", utilization * 100.0);
    }
    if result.retry_count > 0 {
        println!("  Retries:       {}", result.retry_count);
    }
    if let Some(error) = &result.error {
        println!("  Error:         {}", error);
    }
}

fn print_event(event: &InvalidationEvent) {
    println!("Invalidation: {}", event.reason);
    println!("  Removed {} key(s)", event.keys.len());
    for key in &event.keys {
        println!("  - {}", key);
    }
    if !event.failed.is_empty() {
        println!("  Failed: {}", event.failed.join(", "));
    }
}
