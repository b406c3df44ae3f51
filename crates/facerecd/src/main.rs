use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod crypto;
mod engine;
mod error;
mod store;

use config::Config;
use crypto::EmbeddingCipher;
use engine::EngineSettings;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facerecd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facerecd starting");

    let cipher = match &config.secret {
        Some(secret) => {
            tracing::info!("embedding key derived from FACEREC_SECRET");
            EmbeddingCipher::from_passphrase(secret)
        }
        None => EmbeddingCipher::load_or_create(&config.key_path)?,
    };

    let store = Store::open(&config.db_path, cipher)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let counts = store.counts().await?;
    tracing::info!(
        persons = counts.persons,
        enrollments = counts.enrollments,
        "face database ready"
    );

    // Load both models up front so a missing file fails startup, not a request.
    let pipeline = facerec_core::OnnxPipeline::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        config.inference_threads,
    )
    .with_context(|| format!("loading models from {}", config.model_dir.display()))?;

    let engine = engine::spawn_engine(
        pipeline,
        EngineSettings {
            min_face_px: config.min_face_px,
            dark_threshold: config.dark_threshold,
        },
    )?;
    tracing::info!(models = engine.models(), "engine ready");

    let listen_address = config.listen_addr();
    let app = api::router(api::AppState::new(engine, store, config));
    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("binding {listen_address}"))?;

    tracing::info!("listening on http://{listen_address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facerecd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
