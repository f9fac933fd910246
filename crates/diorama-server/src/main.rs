use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use diorama_bus::ViewerHub;
use diorama_core::{DialogueTuning, LoopPacing, OrchestratorHandle, SceneOrchestrator};
use diorama_provider::ProviderRegistry;
use diorama_server::config::ServiceConfig;
use diorama_server::state::AppState;
use diorama_store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("DIORAMA_CONFIG").unwrap_or_else(|_| "diorama.yaml".to_string());
    let config = ServiceConfig::load(Path::new(&config_path))?;

    std::fs::create_dir_all(&config.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "diorama-server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("diorama_server=info,diorama_core=info,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let store =
        Arc::new(SqliteStore::open(&config.database_path).context("failed to open scene store")?);
    let registry = Arc::new(
        ProviderRegistry::from_configs(&config.providers)
            .context("failed to build provider registry")?,
    );
    let hub = Arc::new(ViewerHub::new(64));

    let (handle, rx) = OrchestratorHandle::channel();
    let orchestrator = SceneOrchestrator::new(
        store,
        hub.clone(),
        registry,
        LoopPacing::default(),
        DialogueTuning::default(),
        StdRng::from_entropy(),
    );
    tokio::spawn(async move {
        // The loop never returns on its own; an error here means startup
        // failed with no scene to run.
        if let Err(err) = orchestrator.run(rx).await {
            tracing::error!(error = %format!("{err:#}"), "scene orchestrator failed");
            std::process::exit(1);
        }
    });

    let state = AppState {
        orchestrator: handle,
        hub,
    };
    let bind = std::env::var("DIORAMA_BIND").unwrap_or_else(|_| config.bind.clone());
    diorama_server::serve(state, &bind).await
}
