mod auth;
mod bootstrap;
mod error;
mod routes;
mod sse;
mod state;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use uttar_rag::chat::ChatService;
use uttar_rag::{
    HttpLlmClient, HybridRetriever, IngestOrchestrator, LanceVectorIndex, LlmGateway, MetaStore,
    ProgressBus, RagConfig, SqliteGraphStore, VersionManager,
};

use crate::state::AppState;

const EXIT_CONFIG_INVALID: u8 = 1;
const EXIT_MIGRATION_REQUIRED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Configuration. Invalid values and weak bootstrap credentials refuse to
    // boot rather than run in a broken or insecure state.
    let config = match RagConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "configuration invalid");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };
    let admin = match bootstrap::validate_admin_bootstrap() {
        Ok(admin) => {
            info!(email = %admin.email, "admin bootstrap accepted");
            admin
        }
        Err(e) => {
            error!(error = %e, "admin bootstrap rejected");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    // Stores.
    let meta = match MetaStore::connect(&config.storage.database_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "relational store unavailable");
            return ExitCode::from(EXIT_MIGRATION_REQUIRED);
        }
    };
    if let Err(e) = meta.migrate().await {
        error!(error = %e, "store migration required");
        return ExitCode::from(EXIT_MIGRATION_REQUIRED);
    }
    let graph = {
        let store = SqliteGraphStore::new(meta.pool().clone());
        if let Err(e) = store.migrate().await {
            error!(error = %e, "graph store migration required");
            return ExitCode::from(EXIT_MIGRATION_REQUIRED);
        }
        Arc::new(store)
    };
    let vector = match LanceVectorIndex::open(
        &config.storage.vector_data_dir.to_string_lossy(),
        config.llm.embedding_dim,
    )
    .await
    {
        Ok(index) => Arc::new(index),
        Err(e) => {
            error!(error = %e, "vector store unavailable");
            return ExitCode::from(EXIT_MIGRATION_REQUIRED);
        }
    };

    // LLM gateway. Unreachable at boot is soft: log and keep retrying in the
    // background while the server runs.
    let client = match HttpLlmClient::new(&config.llm) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "LLM client configuration invalid");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };
    {
        let probe_client = client.clone();
        tokio::spawn(async move {
            let mut delay = Duration::from_secs(5);
            loop {
                match probe_client.probe().await {
                    Ok(()) => {
                        info!("model server reachable");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, retry_in = ?delay, "model server unreachable");
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(300));
                    }
                }
            }
        });
    }
    let gateway = Arc::new(LlmGateway::new(
        client,
        config.llm.concurrency,
        config.llm.request_timeout_secs,
    ));

    // Core services.
    let bus = Arc::new(ProgressBus::new());
    let versions = Arc::new(VersionManager::new(
        meta.clone(),
        vector.clone(),
        graph.clone(),
        config.storage.storage_root.clone(),
    ));
    let orchestrator = Arc::new(IngestOrchestrator::new(
        meta.clone(),
        vector.clone(),
        graph.clone(),
        gateway.clone(),
        bus.clone(),
        versions.clone(),
        (*config).clone(),
    ));
    let retriever = Arc::new(HybridRetriever::new(
        gateway.clone(),
        vector.clone(),
        graph.clone(),
        config.retrieval.clone(),
    ));
    let chat = Arc::new(ChatService::new(
        meta.clone(),
        retriever.clone(),
        gateway.clone(),
        bus.clone(),
        config.chat.clone(),
    ));

    // Resume work interrupted by a previous crash, then start the pool.
    match meta
        .requeue_stale_jobs(chrono::Duration::seconds(
            config.ingest.stage_timeout_secs as i64,
        ))
        .await
    {
        Ok(0) => {}
        Ok(requeued) => info!(requeued, "requeued stale ingest jobs"),
        Err(e) => warn!(error = %e, "stale-job requeue failed"),
    }
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = orchestrator.spawn_workers(shutdown_rx);

    // Janitor: expired sessions, parked cleanups, bus expiry.
    {
        let meta = meta.clone();
        let versions = versions.clone();
        let bus = bus.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                if let Err(e) = meta.purge_expired_sessions(chrono::Duration::hours(24)).await {
                    warn!(error = %e, "session purge failed");
                }
                match versions.retry_pending_cleanups().await {
                    Ok(0) => {}
                    Ok(n) => info!(completed = n, "janitor finished pending cleanups"),
                    Err(e) => warn!(error = %e, "janitor cleanup retry failed"),
                }
                let swept = bus.sweep_expired();
                if swept > 0 {
                    info!(swept, "expired bus entries removed");
                }
            }
        });
    }

    let app_state = AppState {
        config: config.clone(),
        meta,
        vector,
        graph,
        gateway,
        bus,
        orchestrator,
        versions,
        retriever,
        chat,
        admin_token: admin.api_token.into(),
    };

    let app = routes::router(app_state).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let addr = std::env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr, error = %e, "cannot bind server address");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };
    info!(addr, "server listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await;

    // Stop the workers and let in-flight stages finish.
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }

    match serve_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}
