//! nscache
//!
//! Runs a lookup cache from a YAML configuration: registers every
//! configured namespace, keeps it fresh in the background and serves an
//! admin endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            nscache                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Refresh    │───▶│    Cache     │◀───│  Partition   │       │
//! │  │  Scheduler   │    │   Manager    │    │  Consumers   │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                             │                                    │
//! │                      admin: /metrics /healthz /readyz /status    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nscache::{AppConfig, CacheManager, Error, LookupRuntime};

// =============================================================================
// CLI Arguments
// =============================================================================

/// nscache - Versioned namespace lookup cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "NSCACHE_CONFIG", default_value = "nscache.yaml")]
    config: PathBuf,

    /// Override store.root_dir
    #[arg(long, env = "NSCACHE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Admin server bind address
    #[arg(long, env = "NSCACHE_ADMIN_ADDR", default_value = "0.0.0.0:8080")]
    admin_addr: SocketAddr,

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
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let mut config = AppConfig::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    if let Some(dir) = &args.data_dir {
        config.store.root_dir = dir.clone();
    }

    info!("Starting nscache");
    info!("  Config: {}", args.config.display());
    info!("  Store root: {}", config.store.root_dir.display());
    info!("  Namespaces: {}", config.namespaces.len());

    let runtime = LookupRuntime::builder(config)
        .build()
        .context("failed to build runtime")?;
    runtime
        .register_configured()
        .await
        .context("failed to register namespaces")?;
    runtime.start().await.context("failed to start runtime")?;

    let listener = TcpListener::bind(args.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin server on {}", args.admin_addr))?;
    info!("Admin server listening on {}", args.admin_addr);

    let manager = Arc::clone(runtime.manager());
    tokio::select! {
        result = run_admin_server(listener, manager) => {
            if let Err(e) = result {
                error!("Admin server error: {}", e);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        }
    }

    runtime.shutdown().await;
    info!("nscache stopped");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => args.log_level.to_lowercase(),
        _ => "info".to_string(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,tokio_postgres=warn", level))
    });

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
// Admin Server
// =============================================================================

async fn run_admin_server(listener: TcpListener, manager: Arc<CacheManager>) -> std::io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let manager = Arc::clone(&manager);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let manager = Arc::clone(&manager);
                async move { Ok::<_, Infallible>(admin_handler(&manager, req)) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Admin server connection error: {}", e);
            }
        });
    }
}

fn admin_handler(manager: &CacheManager, req: Request<Incoming>) -> Response<Full<Bytes>> {
    route(manager, req.method(), req.uri().path())
}

fn route(manager: &CacheManager, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if let Some(namespace) = path.strip_prefix("/refresh/") {
        return if method == Method::POST {
            force_refresh(manager, namespace)
        } else {
            text(StatusCode::METHOD_NOT_ALLOWED, "use POST")
        };
    }

    match path {
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" => {
            if manager.all_ready() {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
        "/metrics" => match manager.metrics().encode() {
            Ok((content_type, buffer)) => with_content_type(StatusCode::OK, &content_type, buffer),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        "/status" => match serde_json::to_vec(&manager.statuses()) {
            Ok(body) => with_content_type(StatusCode::OK, "application/json", body),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Wake the namespace's refresh loop; refused while a load is running.
fn force_refresh(manager: &CacheManager, namespace: &str) -> Response<Full<Bytes>> {
    match manager.request_refresh(namespace) {
        Ok(true) => text(StatusCode::ACCEPTED, "refresh requested"),
        Ok(false) => text(StatusCode::CONFLICT, "load already in flight"),
        Err(Error::NamespaceNotFound(_)) => text(StatusCode::NOT_FOUND, "unknown namespace"),
        Err(Error::Closed) => text(StatusCode::SERVICE_UNAVAILABLE, "closed"),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    with_content_type(status, "text/plain; charset=utf-8", body.as_bytes().to_vec())
}

fn with_content_type(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}
