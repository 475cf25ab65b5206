//! StatsD Buffer Agent
//!
//! Runs an aggregation buffer in front of a StatsD collector and drives it
//! with a synthetic request workload, so the merge and flush behavior can be
//! watched on the wire (e.g. with `nc -ul 8125`).
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: flush every second to 127.0.0.1:8125
//! statsd-buffer-agent
//!
//! # From a config file, with environment overrides
//! STATSD_PREFIX=demo. statsd-buffer-agent agent.toml
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | STATSD_ADDR | 127.0.0.1:8125 | Collector address |
//! | STATSD_PREFIX | (none) | Prepended to every metric name |
//! | STATSD_TAGS | (none) | Global tags, `k:v,k:v` |
//! | BUFFER_FLUSH_INTERVAL_MS | 1000 | Flush interval |
//! | AGENT_RATE_PER_SEC | 1000 | Synthetic requests per second (1 to 1000000) |
//! | RUST_LOG | info | Log filter |

use rand::Rng;
use statsd_buffer::config::LogFormat;
use statsd_buffer::{
    spawn_buffer, AgentConfig, BufferError, BufferStats, StatsdBuffer, Transport, UdpTransport,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_RATE_PER_SEC: u64 = 1000;
const ROUTES: [&str; 4] = ["index", "search", "checkout", "login"];

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Highest pace the agent can hold with a one-microsecond tick
const MAX_RATE_PER_SEC: u64 = 1_000_000;

fn parse_rate(raw: Option<&str>) -> Result<u64, String> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_RATE_PER_SEC);
    };
    match raw.parse::<u64>() {
        Ok(rate) if (1..=MAX_RATE_PER_SEC).contains(&rate) => Ok(rate),
        _ => Err(format!(
            "AGENT_RATE_PER_SEC '{}' must be between 1 and {}",
            raw, MAX_RATE_PER_SEC
        )),
    }
}

/// Tick period for `rate` events per second (never zero)
fn pace_period(rate: u64) -> Duration {
    let rate = rate.clamp(1, MAX_RATE_PER_SEC);
    Duration::from_micros(1_000_000 / rate)
}

/// Flush, snapshot, then close, so the stats include the last sends
async fn shutdown_buffer<T: Transport>(buffer: &StatsdBuffer<T>) -> Option<BufferStats> {
    if let Err(e) = buffer.flush().await {
        warn!("Final flush: {}", e);
    }
    let stats = buffer.stats().await.ok();
    if let Err(e) = buffer.close().await {
        error!("Close failed: {}", e);
    }
    stats
}

/// One simulated request: a counter bump, a latency sample and an
/// occasional gauge and running total
async fn record_request<T: Transport>(
    buffer: &StatsdBuffer<T>,
    seq: u64,
    rng: &mut impl Rng,
) -> Result<(), BufferError> {
    let route = ROUTES[rng.gen_range(0..ROUTES.len())];
    buffer.increment(format!("requests.{}", route), 1).await?;
    if rng.gen_bool(0.02) {
        buffer.increment(format!("errors.{}", route), 1).await?;
    }
    let latency = Duration::from_micros(rng.gen_range(200..50_000));
    buffer.timing(format!("latency.{}", route), latency).await?;

    if seq % 100 == 0 {
        buffer.gauge("connections.active", rng.gen_range(0..512)).await?;
        buffer.total("requests.since_boot", seq as i64).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match AgentConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(config.log_format);

    let rate = match parse_rate(std::env::var("AGENT_RATE_PER_SEC").ok().as_deref()) {
        Ok(rate) => rate,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let transport = match UdpTransport::connect(&config.statsd).await {
        Ok(transport) => transport,
        Err(e) => {
            error!("Failed to open StatsD socket to {}: {}", config.statsd.addr, e);
            std::process::exit(1);
        }
    };

    let (buffer, task) = match spawn_buffer(config.buffer.clone(), transport) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("Invalid buffer configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Sending to {} (prefix '{}'), {} synthetic requests/sec, flush every {:?}",
        config.statsd.addr, config.statsd.prefix, rate, config.buffer.flush_interval
    );

    let mut rng = rand::thread_rng();
    let mut pace = tokio::time::interval(pace_period(rate));
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            _ = pace.tick() => {
                seq += 1;
                if let Err(e) = record_request(&buffer, seq, &mut rng).await {
                    warn!("Buffer stopped accepting metrics: {}", e);
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Flushing buffered metrics...");
    let stats = shutdown_buffer(&buffer).await;
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Buffer actor stopped with error: {}", e),
        Err(e) => error!("Buffer actor task failed: {}", e),
    }

    if let Some(stats) = stats {
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Could not encode stats: {}", e),
        }
    }
    info!("Agent shutdown complete");
}
