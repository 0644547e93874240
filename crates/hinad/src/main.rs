use anyhow::{Context, Result};
use hina_core::{Config, GalleryStore, MajorityVoteMatcher, OnnxFaceEncoder};
use tracing_subscriber::EnvFilter;

mod engine;
mod error;
mod http;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "hinad starting");

    let config = Config::load().context("loading configuration")?;

    let store = GalleryStore::new(&config.gallery_path);
    let gallery = store
        .load()
        .with_context(|| format!("loading gallery {}", config.gallery_path.display()))?;

    let encoder = OnnxFaceEncoder::load(&config.model_dir, config.detector_model)
        .with_context(|| format!("loading face models from {}", config.model_dir.display()))?;

    let handle = engine::spawn_engine(engine::Engine {
        encoder: Box::new(encoder),
        gallery,
        store,
        matcher: MajorityVoteMatcher::new(config.tolerance)?,
        preprocess: config.preprocess.clone(),
    })?;

    let app = http::router(handle, config.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    tracing::info!(
        addr = %config.bind_addr,
        tolerance = config.tolerance,
        detector = %config.detector_model,
        "hinad ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("hinad shutting down");
        })
        .await?;

    Ok(())
}
