//! tierkv daemon
//!
//! Runs the tier engine against Redis and SQLite, consumes expiration
//! notifications and exposes health and metrics endpoints.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           tierkv                              │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐    ┌────────────┐    ┌────────────┐           │
//! │  │  Expire    │───▶│  Task      │───▶│  Engine    │           │
//! │  │  Listener  │    │  Pool      │    │  (tiers)   │           │
//! │  └────────────┘    └────────────┘    └────────────┘           │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierkv::adapters::{RedisStore, SqliteExecutor};
use tierkv::{Engine, EngineConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tierkv - keeps a local cache, Redis and SQL in step
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis connection URL
    #[arg(long, env = "TIERKV_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// SQLite database file
    #[arg(long, env = "TIERKV_SQLITE_PATH", default_value = "tierkv.db")]
    sqlite_path: PathBuf,

    /// YAML engine configuration; flags below override its values
    #[arg(long, env = "TIERKV_CONFIG")]
    config: Option<PathBuf>,

    /// Distributed store key prefix
    #[arg(long, env = "TIERKV_PREFIX")]
    prefix: Option<String>,

    /// Default id/type/value table
    #[arg(long, env = "TIERKV_DEFAULT_TABLE")]
    default_table: Option<String>,

    /// Expire policy for requests that carry none
    #[arg(long, env = "TIERKV_DEFAULT_EXPIRE")]
    default_expire: Option<String>,

    /// Do not retry failed table operations against the default table
    #[arg(long, env = "TIERKV_NO_FALLBACK")]
    no_fallback: bool,

    /// Background workers
    #[arg(long, env = "TIERKV_WORKERS")]
    workers: Option<usize>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// YAML file (or defaults) with flag overrides applied.
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_yaml_file(path)?,
            None => EngineConfig::default(),
        };

        if let Some(prefix) = &self.prefix {
            config.prefix = prefix.clone();
        }
        if let Some(table) = &self.default_table {
            config.default_table = table.clone();
        }
        if let Some(expire) = &self.default_expire {
            config.default_expire = expire.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.no_fallback {
            config.fallback_to_default = false;
        }
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.engine_config()?;
    info!("Starting tierkv {}", tierkv::version());
    info!("  Redis: {}", args.redis_url);
    info!("  SQLite: {}", args.sqlite_path.display());
    info!("  Prefix: {}", config.prefix);
    info!("  Default table: {}", config.default_table);
    info!("  Fallback to default table: {}", config.fallback_to_default);

    let store = RedisStore::connect(&args.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    store.enable_expire_notifications().await;

    let sql = SqliteExecutor::open(&args.sqlite_path).context("Failed to open SQLite database")?;

    let engine = Engine::builder(config, Arc::new(store), Arc::new(sql))
        .build()
        .await
        .context("Failed to build engine")?;

    let token = CancellationToken::new();
    let background = engine.start(token.clone());

    let health_engine = engine.clone();
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        let handler = move |req: Request<hyper::body::Incoming>| {
            let engine = health_engine.clone();
            async move { Ok::<_, Infallible>(health_response(&engine, req.uri().path()).await) }
        };
        if let Err(e) = serve("health", &health_addr, handler).await {
            error!("Health server error: {:#}", e);
        }
    });

    let metrics_engine = engine.clone();
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        let handler = move |req: Request<hyper::body::Incoming>| {
            let engine = metrics_engine.clone();
            async move { Ok::<_, Infallible>(metrics_response(&engine, req.uri().path())) }
        };
        if let Err(e) = serve("metrics", &metrics_addr, handler).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, draining background work");

    engine.pool().shutdown().await;
    background.shutdown().await;

    info!("tierkv shutdown complete");
    Ok(())
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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

// =============================================================================
// HTTP Endpoints
// =============================================================================

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn health_response(engine: &Engine, path: &str) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" => match engine.health_check().await {
            Ok(true) => text(StatusCode::OK, "ok"),
            Ok(false) => text(StatusCode::SERVICE_UNAVAILABLE, "backing store unavailable"),
            Err(e) => {
                warn!("Readiness check failed: {}", e);
                text(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        },
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

fn metrics_response(engine: &Engine, path: &str) -> Response<Full<Bytes>> {
    if path != "/metrics" {
        return text(StatusCode::NOT_FOUND, "not found");
    }

    match engine.metrics().encode() {
        Ok((content_type, buffer)) => {
            let mut response = text(StatusCode::OK, buffer);
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn serve<H, F>(name: &'static str, addr: &str, handler: H) -> anyhow::Result<()>
where
    H: Fn(Request<hyper::body::Incoming>) -> F + Clone + Send + 'static,
    F: Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
{
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid {} server address: {}", name, addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} server", name))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .with_context(|| format!("{} server accept error", name))?;

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}
