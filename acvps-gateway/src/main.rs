//! ACVPS gateway - runtime enforcement of AI contracts between applications
//! and LLM backends.
//!
//! Serves the enforcement proxy (plus `/health` and `/metrics`) on the main
//! port and the admin routes alone on the admin port.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use acvps_core::cache::CacheLayer;
use acvps_core::config::{self, Config, ConfigError, find_config_file, load_and_validate};
use acvps_core::contract::registry_from_config;
use acvps_core::guardrail::{DecisionPipeline, HttpEvaluator, PipelineSettings};
use acvps_core::mitigation::MitigationEngine;
use acvps_core::telemetry::{self, GatewayMetrics};
use acvps_gateway::admin::{AdminServer, AdminServerConfig};
use acvps_gateway::backend::BackendClient;
use acvps_gateway::proxy::ProxyState;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    /// If not specified, searches: ACVPS_CONFIG env, /etc/acvps/config.yaml, ./config.yaml
    #[arg(long, env = "ACVPS_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides gateway.bind)
    #[arg(short, long)]
    bind: Option<String>,

    /// Proxy port (overrides gateway.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Admin port (overrides gateway.admin_port)
    #[arg(long)]
    admin_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Config is read before logging starts so logging.level applies.
    let loaded = load(&cli);
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());

    // The guard must live for the whole program or buffered lines are lost.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .init();

    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration, refusing to start");
            return Err(e.into());
        }
    };
    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if let Some(port) = cli.admin_port {
        config.gateway.admin_port = port;
    }

    let mut prom_registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(GatewayMetrics::new(&mut prom_registry));
    let prom_registry = Arc::new(prom_registry);

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    // ─────────────────────────────────────────────────────────────────────
    // Components
    // ─────────────────────────────────────────────────────────────────────
    let cache = Arc::new(
        CacheLayer::from_config(&config.cache, &shutdown)
            .await?
            .with_metrics(metrics.clone()),
    );
    info!(backend = cache.backend_name(), "Decision cache ready");

    let registry = registry_from_config(&config.contracts, cache.clone())?;

    // Stopped only after the listener has drained, so late requests are
    // still flushed.
    let telemetry_shutdown = CancellationToken::new();
    let (buffer, batcher) = telemetry::from_config(&config.telemetry, Some(metrics.clone()))?;
    let batcher_handle = Arc::new(batcher).spawn(telemetry_shutdown.clone());

    let evaluator = Arc::new(HttpEvaluator::new(&config.evaluator)?);
    let mitigation = Arc::new(MitigationEngine::new(&config.mitigation).with_metrics(metrics.clone()));
    let pipeline = Arc::new(
        DecisionPipeline::new(
            cache.clone(),
            evaluator,
            mitigation,
            buffer,
            PipelineSettings::from_config(&config),
        )
        .with_metrics(metrics.clone()),
    );
    let backend = Arc::new(BackendClient::new(&config.backend, config.gateway.max_body_bytes)?);

    let proxy = Arc::new(ProxyState {
        registry,
        pipeline,
        backend,
        metrics: Some(metrics),
        require_contract: config.gateway.require_contract,
        max_body_bytes: config.gateway.max_body_bytes,
        shutdown: shutdown.clone(),
    });

    // ─────────────────────────────────────────────────────────────────────
    // Listeners
    // ─────────────────────────────────────────────────────────────────────
    let admin = AdminServer::new(
        cache,
        prom_registry,
        AdminServerConfig {
            port: config.gateway.admin_port,
            bind_addr: config.gateway.bind.clone(),
        },
    );
    let app = acvps_gateway::app(proxy, &admin);

    let admin_shutdown = shutdown.clone();
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin.run(admin_shutdown).await {
            error!(error = %e, "Admin server failed");
        }
    });

    let addr = format!("{}:{}", config.gateway.bind, config.gateway.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        backend = %config.backend.url,
        evaluator = %config.evaluator.url,
        "ACVPS gateway listening"
    );

    let serve_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        serve_shutdown.cancelled().await;
        info!("Draining in-flight requests");
    })
    .await?;

    if let Err(e) = admin_handle.await {
        warn!(error = %e, "Admin server task panicked");
    }

    telemetry_shutdown.cancel();
    if let Err(e) = batcher_handle.await {
        warn!(error = %e, "Telemetry batcher task panicked");
    }

    info!("ACVPS gateway stopped");
    Ok(())
}

/// Resolve and load configuration.
///
/// An explicit `--config` path must exist. Without one, a missing file falls
/// back to defaults plus environment variables.
fn load(cli: &Cli) -> Result<Config, ConfigError> {
    match find_config_file(cli.config.as_deref()) {
        Ok(path) => load_and_validate(&path),
        Err(ConfigError::ConfigFileNotFound { .. }) if cli.config.is_none() => config::from_env(),
        Err(e) => Err(e),
    }
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                shutdown_sigint.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        let shutdown_sigterm = shutdown;
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    shutdown_sigterm.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn cli(config: Option<PathBuf>) -> Cli {
        Cli {
            config,
            bind: None,
            port: None,
            admin_port: None,
        }
    }

    #[test]
    #[serial]
    fn test_explicit_missing_config_is_fatal() {
        let err = load(&cli(Some(PathBuf::from("/nonexistent/acvps.yaml")))).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigFileNotFound { .. }));
    }

    #[test]
    #[serial]
    fn test_explicit_config_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "gateway:\n  port: 9090\nlogging:\n  level: debug").unwrap();

        let config = load(&cli(Some(file.path().to_path_buf()))).unwrap();
        assert_eq!(config.gateway.port, 9090);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    #[serial]
    fn test_config_from_environment_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "gateway:\n  admin_port: 9191").unwrap();

        // SAFETY: serialized test, no other thread reads the environment.
        unsafe { std::env::set_var("ACVPS_CONFIG", file.path()) };
        let loaded = load(&cli(None));
        unsafe { std::env::remove_var("ACVPS_CONFIG") };

        assert_eq!(loaded.unwrap().gateway.admin_port, 9191);
    }
}
