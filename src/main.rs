//! Portal Cache
//!
//! Runs a cache service instance next to a portal backend: connects to the
//! shared store, keeps the L1 sweeper and the invalidation listener running,
//! and exposes health and Prometheus endpoints.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     portal-cache                            │
//! ├────────────────────────────────────────────────────────────┤
//! │  /healthz /livez /readyz   (health server)                  │
//! │  /metrics                  (metrics server, prometheus)     │
//! ├────────────────────────────────────────────────────────────┤
//! │  CacheService ── L1 sweeper ── invalidation listener        │
//! │        │                                                    │
//! │   RedisStore (--redis-url)  or  MemoryStore (single node)   │
//! └────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use hyper::{Body, Response, StatusCode};
use prometheus::{Gauge, IntGauge};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portal_cache::{
    CacheConfig, CacheService, Error, MemoryStore, RedisStore, Result, SharedStoreRef,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Portal Cache - two-tier cache service with cross-instance invalidation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Shared store URL; runs single-instance in memory when unset
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// YAML configuration file
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Portal Cache");
    info!("  Version: {}", portal_cache::VERSION);
    info!("  Health: {}", args.health_addr);
    info!("  Metrics: {}", args.metrics_addr);

    let config = match &args.config {
        Some(path) => {
            info!("  Config: {}", path.display());
            CacheConfig::from_yaml_file(path)?
        }
        None => CacheConfig::default(),
    };

    let store: SharedStoreRef = match &args.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url)?),
        None => {
            warn!("No Redis URL given, running single-instance with an in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let cache = CacheService::new(store, config);
    if !cache.health_check().await {
        warn!("Shared store not reachable yet, serving degraded until it recovers");
    }

    let background = cache.start_background().await;

    let health_addr = parse_addr(&args.health_addr, "health")?;
    let health_cache = cache.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_cache).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    let gauges = Arc::new(CacheGauges::register()?);
    let metrics_cache = cache.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_cache, gauges).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    background.shutdown().await;
    info!("Portal cache shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", server, e)))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,redis=info", level)));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: SocketAddr, cache: CacheService) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let cache = cache.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let cache = cache.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" => {
                            if cache.health_check().await {
                                respond(StatusCode::OK, "ok")
                            } else {
                                respond(StatusCode::SERVICE_UNAVAILABLE, "shared store unavailable")
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Prometheus gauges mirroring the cache statistics
struct CacheGauges {
    hits: IntGauge,
    misses: IntGauge,
    writes: IntGauge,
    deletes: IntGauge,
    hit_rate: Gauge,
    local_entries: IntGauge,
    local_bytes: IntGauge,
    refreshes_in_flight: IntGauge,
}

impl CacheGauges {
    fn register() -> Result<Self> {
        let registered = |e: prometheus::Error| Error::Internal(format!("Failed to register metric: {}", e));
        Ok(Self {
            hits: prometheus::register_int_gauge!("portal_cache_hits", "Cache reads that found a value")
                .map_err(registered)?,
            misses: prometheus::register_int_gauge!("portal_cache_misses", "Cache reads that found nothing")
                .map_err(registered)?,
            writes: prometheus::register_int_gauge!("portal_cache_writes", "Cache writes")
                .map_err(registered)?,
            deletes: prometheus::register_int_gauge!("portal_cache_deletes", "Keys removed by invalidation")
                .map_err(registered)?,
            hit_rate: prometheus::register_gauge!("portal_cache_hit_rate", "Hits over total reads")
                .map_err(registered)?,
            local_entries: prometheus::register_int_gauge!(
                "portal_cache_local_entries",
                "Entries held in this instance's L1"
            )
            .map_err(registered)?,
            local_bytes: prometheus::register_int_gauge!(
                "portal_cache_local_bytes",
                "Payload bytes held in this instance's L1"
            )
            .map_err(registered)?,
            refreshes_in_flight: prometheus::register_int_gauge!(
                "portal_cache_refreshes_in_flight",
                "Background stale-while-revalidate refreshes running"
            )
            .map_err(registered)?,
        })
    }

    fn update(&self, cache: &CacheService) {
        let stats = cache.get_stats();
        self.hits.set(stats.hits as i64);
        self.misses.set(stats.misses as i64);
        self.writes.set(stats.writes as i64);
        self.deletes.set(stats.deletes as i64);
        self.hit_rate.set(stats.hit_rate);
        self.local_entries.set(cache.local_len() as i64);
        self.local_bytes.set(cache.local_bytes() as i64);
        self.refreshes_in_flight.set(cache.refreshes_in_flight() as i64);
    }
}

async fn run_metrics_server(addr: SocketAddr, cache: CacheService, gauges: Arc<CacheGauges>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Server};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let cache = cache.clone();
        let gauges = gauges.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let cache = cache.clone();
                let gauges = gauges.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            gauges.update(&cache);
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&prometheus::gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = respond(StatusCode::OK, buffer);
                                    response
                                        .headers_mut()
                                        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                                    response
                                }
                                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
