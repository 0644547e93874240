use hina_core::classify::{self, Classification, ClassifyError};
use hina_core::{FaceEncoder, Gallery, GalleryError, GalleryStore, MajorityVoteMatcher};
use hina_imaging::PreprocessOptions;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of what the engine is serving.
pub struct EngineStatus {
    pub gallery: Arc<Gallery>,
    pub tolerance: f32,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Classify {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Classification, EngineError>>,
    },
    Reload {
        reply: oneshot::Sender<Result<Arc<Gallery>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Identify every face in an encoded image.
    pub async fn classify(&self, image: Vec<u8>) -> Result<Classification, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Classify { image, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Re-read the gallery file. The running gallery is only replaced after
    /// the new one loaded and validated in full.
    pub async fn reload(&self) -> Result<Arc<Gallery>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Reload { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Status { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Everything the engine thread owns.
pub struct Engine {
    pub encoder: Box<dyn FaceEncoder + Send>,
    pub gallery: Gallery,
    pub store: GalleryStore,
    pub matcher: MajorityVoteMatcher,
    pub preprocess: PreprocessOptions,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Fails fast when the gallery was built for a different vector length
/// than the encoder produces.
pub fn spawn_engine(engine: Engine) -> Result<EngineHandle, EngineError> {
    let Engine {
        mut encoder,
        gallery,
        store,
        matcher,
        preprocess,
    } = engine;

    check_compatible(encoder.as_ref(), &gallery)?;
    let mut gallery = Arc::new(gallery);

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("hina-engine".into())
        .spawn(move || {
            tracing::info!(
                gallery = %gallery.id(),
                entries = gallery.len(),
                "engine thread started"
            );
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Classify { image, reply } => {
                        let result = classify::classify_bytes(
                            &image,
                            encoder.as_mut(),
                            &matcher,
                            &gallery,
                            &preprocess,
                        )
                        .map_err(EngineError::from);
                        if let Err(e) = &result {
                            tracing::warn!(error = %e, "classification failed");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Reload { reply } => {
                        let result = load_gallery(&store, encoder.as_ref()).map(|fresh| {
                            gallery = Arc::new(fresh);
                            tracing::info!(
                                gallery = %gallery.id(),
                                entries = gallery.len(),
                                "gallery reloaded"
                            );
                            Arc::clone(&gallery)
                        });
                        if let Err(e) = &result {
                            tracing::error!(error = %e, "gallery reload failed; keeping current gallery");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(EngineStatus {
                            gallery: Arc::clone(&gallery),
                            tolerance: matcher.tolerance(),
                        });
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn load_gallery(store: &GalleryStore, encoder: &(dyn FaceEncoder + Send)) -> Result<Gallery, EngineError> {
    let gallery = store.load()?;
    check_compatible(encoder, &gallery)?;
    Ok(gallery)
}

fn check_compatible(encoder: &(dyn FaceEncoder + Send), gallery: &Gallery) -> Result<(), EngineError> {
    if gallery.dimension() != encoder.dimension() {
        return Err(GalleryError::DimensionMismatch {
            expected: encoder.dimension(),
            actual: gallery.dimension(),
        }
        .into());
    }
    if gallery.model_version() != encoder.model_version() {
        tracing::warn!(
            gallery = gallery.model_version(),
            encoder = encoder.model_version(),
            "gallery was built with a different model"
        );
    }
    Ok(())
}
