//! depot server: HTTP API plus the build worker pool.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use depot_api::{AppState, routes};
use depot_config::{StoreBackend, SystemConfig};
use depot_executor::{CosignSigner, DockerCliBackend, DockerCliSettings, SyftSbomGenerator};
use depot_queue::{MemoryQueueStore, PgQueueStore, QueueStore};
use depot_scheduler::{
    BuildRunner, CallbackDispatcher, CallbackSettings, RunnerSettings, StaleWorkerReaper,
    WorkerPool, WorkerPoolConfig,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// API and workers in one process.
    All,
    Api,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "depot-server", version, about = "Build job queue and worker pool")]
struct Args {
    /// Path to a KDL configuration file.
    #[arg(short, long, env = "DEPOT_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration.
    #[arg(long)]
    listen: Option<String>,

    #[arg(long, value_enum, default_value = "all", env = "DEPOT_MODE")]
    mode: Mode,

    #[arg(long, value_enum, default_value = "text", env = "DEPOT_LOG_FORMAT")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config =
        SystemConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    let store = connect_store(&config).await?;
    if config.store.backend == StoreBackend::Memory && args.mode != Mode::All {
        warn!("The in-memory store is not shared between processes; use --mode all");
    }

    let dispatcher = Arc::new(CallbackDispatcher::new(
        store.clone(),
        CallbackSettings {
            api_key: config.callback.api_key.clone(),
            max_attempts: config.callback.max_attempts,
            initial_backoff: config.callback.initial_backoff,
            max_backoff: config.callback.max_backoff,
            request_timeout: config.callback.request_timeout,
            public_url: config.server.public_url.clone(),
        },
    ));

    let shutdown = install_shutdown_handler();

    let workers = if args.mode != Mode::Api {
        Some(start_workers(&config, store.clone(), dispatcher.clone(), &shutdown).await?)
    } else {
        None
    };

    if args.mode != Mode::Worker {
        let state = AppState::new(store.clone(), dispatcher.clone())
            .with_internal_api_key(config.server.internal_api_key.clone());
        let app = routes::router(state)
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );

        let listener = TcpListener::bind(&config.server.listen)
            .await
            .with_context(|| format!("binding {}", config.server.listen))?;
        info!("Starting server on {}", config.server.listen);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await?;
    } else {
        shutdown.cancelled().await;
    }

    if let Some(pool) = workers {
        pool.shutdown(config.worker.shutdown_grace).await;
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn connect_store(config: &SystemConfig) -> anyhow::Result<Arc<dyn QueueStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory queue store");
            Ok(Arc::new(MemoryQueueStore::with_log_buffer(
                config.worker.log_buffer,
            )))
        }
        StoreBackend::Postgres => {
            let url = config
                .store
                .database_url
                .as_deref()
                .context("store.database-url is required for the postgres backend")?;
            info!("Connecting to database...");
            let store = PgQueueStore::connect(url, config.store.max_connections).await?;
            store.migrate().await?;
            info!("Database connected");
            Ok(Arc::new(store))
        }
    }
}

async fn start_workers(
    config: &SystemConfig,
    store: Arc<dyn QueueStore>,
    dispatcher: Arc<CallbackDispatcher>,
    shutdown: &CancellationToken,
) -> anyhow::Result<WorkerPool> {
    let build = &config.build;

    let mut docker = DockerCliSettings::new(&config.worker.work_dir, &build.registry);
    docker.registry_user = build.registry_user.clone();
    docker.registry_password = build.registry_password.clone();
    tokio::fs::create_dir_all(&config.worker.work_dir)
        .await
        .with_context(|| format!("creating {}", config.worker.work_dir.display()))?;

    let mut runner = BuildRunner::new(
        Arc::new(DockerCliBackend::new(docker)),
        RunnerSettings {
            registry: build.registry.clone(),
            image_template: build.image_template.clone(),
            sbom_format: build.sbom_format.clone(),
            build_timeout: config.worker.build_timeout,
            stop_grace: config.worker.stop_grace,
        },
    );
    if build.generate_sbom {
        runner = runner.with_sbom(Arc::new(SyftSbomGenerator::new()));
    }
    if build.sign_images {
        if build.cosign_key.is_none() {
            info!("No cosign key configured, images will be signed keylessly");
        }
        runner = runner.with_signer(Arc::new(CosignSigner::new(build.cosign_key.clone())));
    }

    let pool = WorkerPool::start(
        WorkerPoolConfig::from(&config.worker),
        store.clone(),
        Arc::new(runner),
        dispatcher.clone(),
    )
    .await?;

    let reaper = StaleWorkerReaper::new(
        store,
        dispatcher,
        config.worker.heartbeat_ttl,
        config.worker.heartbeat_interval,
    );
    let cancel = shutdown.clone();
    tokio::spawn(async move { reaper.run(cancel).await });

    Ok(pool)
}

/// Cancel the returned token on SIGINT or SIGTERM.
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
        }
        trigger.cancel();
    });

    token
}
