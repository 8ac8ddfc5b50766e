use crate::{
    download::{AcquisitionError, DownloadProgress, ModelAcquisition, WeightSource},
    postprocess::{PostprocessError, Postprocessor},
    preprocess::{PreprocessConfig, Preprocessor},
    registry::{ModelDescriptor, ModelRegistry, RegistryError},
    session::{InferenceBackend, SessionError, SessionManager},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{instrument, Instrument};

/// Raster formats accepted as input.
pub const SUPPORTED_FORMATS: [ImageFormat; 2] = [ImageFormat::Png, ImageFormat::Jpeg];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Initializing,
    DownloadingModel,
    LoadingModel,
    Decoding,
    Preprocessing,
    Processing,
    Finalizing,
    Done,
    Error,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Initializing => "initializing",
            PipelineStatus::DownloadingModel => "downloading_model",
            PipelineStatus::LoadingModel => "loading_model",
            PipelineStatus::Decoding => "decoding",
            PipelineStatus::Preprocessing => "preprocessing",
            PipelineStatus::Processing => "processing",
            PipelineStatus::Finalizing => "finalizing",
            PipelineStatus::Done => "done",
            PipelineStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    Status(PipelineStatus),
    DownloadProgress(DownloadProgress),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] RegistryError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Failed to decode image: {0}")]
    Decode(String),
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error(transparent)]
    Encode(#[from] PostprocessError),
    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Decodes a base64 PNG or JPEG payload.
pub fn decode_image(image_base64: &str) -> Result<DynamicImage, PipelineError> {
    let bytes = STANDARD
        .decode(image_base64.trim())
        .map_err(|e| PipelineError::Decode(format!("invalid base64: {}", e)))?;

    let format = image::guess_format(&bytes)
        .map_err(|_| PipelineError::UnsupportedFormat("unrecognized image data".into()))?;
    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(PipelineError::UnsupportedFormat(format!("{:?}", format)));
    }

    image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| PipelineError::Decode(e.to_string()))
}

/// Runs background-removal requests one at a time against a single resident
/// model, broadcasting progress as it goes.
pub struct BackgroundRemover<B: InferenceBackend, S: WeightSource> {
    core: Arc<RemoverCore<B, S>>,
}

struct RemoverCore<B: InferenceBackend, S: WeightSource> {
    registry: ModelRegistry,
    acquisition: ModelAcquisition<S>,
    sessions: Arc<Mutex<SessionManager<B>>>,
    preprocessor: Preprocessor,
    postprocessor: Postprocessor,
    events: broadcast::Sender<PipelineEvent>,
    status: watch::Sender<PipelineStatus>,
}

impl<B: InferenceBackend, S: WeightSource> BackgroundRemover<B, S> {
    pub fn new(
        registry: ModelRegistry,
        backend: B,
        source: S,
        preprocess: PreprocessConfig,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        let (status, _) = watch::channel(PipelineStatus::Initializing);
        let core = RemoverCore {
            registry,
            acquisition: ModelAcquisition::new(source),
            sessions: Arc::new(Mutex::new(SessionManager::new(backend))),
            preprocessor: Preprocessor::new(preprocess),
            postprocessor: Postprocessor::new(),
            events,
            status,
        };
        core.emit(PipelineStatus::Initializing);
        Self {
            core: Arc::new(core),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.core.events.subscribe()
    }

    /// Latest status emitted, including `Initializing` before any request.
    pub fn status(&self) -> PipelineStatus {
        *self.core.status.borrow()
    }

    pub fn models(&self) -> &'static [ModelDescriptor] {
        self.core.registry.models()
    }

    pub fn is_model_downloaded(&self, model_id: &str) -> bool {
        let registry = &self.core.registry;
        registry.validate(model_id).is_ok() && registry.is_installed(model_id)
    }

    /// Removes the background of a base64 PNG/JPEG and returns a base64 PNG.
    ///
    /// The request runs on its own task: dropping the returned future does not
    /// abort it, so it always ends in `Done` or `Error`.
    #[instrument(skip(self, image_base64), fields(input_len = image_base64.len()))]
    pub async fn remove_background(
        &self,
        image_base64: &str,
        model_id: &str,
    ) -> Result<String, PipelineError> {
        let core = Arc::clone(&self.core);
        let image_base64 = image_base64.to_owned();
        let model_id = model_id.to_owned();

        let request = tokio::spawn(
            async move { core.remove_background(&image_base64, &model_id).await }
                .in_current_span(),
        );

        request.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Background removal task failed");
            self.core.emit(PipelineStatus::Error);
            Err(PipelineError::Worker(e.to_string()))
        })
    }

    /// Releases the resident session.
    pub async fn shutdown(&self) {
        self.core.sessions.lock().await.destroy();
    }
}

impl<B: InferenceBackend, S: WeightSource> RemoverCore<B, S> {
    fn emit(&self, status: PipelineStatus) {
        tracing::debug!(status = status.as_str(), "Pipeline status");
        self.status.send_replace(status);
        // No subscribers is not an error.
        let _ = self.events.send(PipelineEvent::Status(status));
    }

    async fn remove_background(
        &self,
        image_base64: &str,
        model_id: &str,
    ) -> Result<String, PipelineError> {
        match self.process(image_base64, model_id).await {
            Ok(result) => {
                self.emit(PipelineStatus::Done);
                Ok(result)
            }
            Err(e) => {
                tracing::error!(error = %e, "Background removal failed");
                self.emit(PipelineStatus::Error);
                Err(e)
            }
        }
    }

    async fn process(&self, image_base64: &str, model_id: &str) -> Result<String, PipelineError> {
        let model = self.registry.validate(model_id)?;
        let model_path = self.registry.model_path(model.id);

        let mut sessions = Arc::clone(&self.sessions).lock_owned().await;

        if !self.registry.is_installed(model.id) {
            self.emit(PipelineStatus::DownloadingModel);
            let events = self.events.clone();
            self.acquisition
                .acquire(model.id, &model_path, move |progress| {
                    let _ = events.send(PipelineEvent::DownloadProgress(progress));
                })
                .await?;
        }

        if !sessions.is_loaded_for(&model_path) {
            self.emit(PipelineStatus::LoadingModel);
            let path = model_path.clone();
            let bindings = model.bindings;
            sessions = run_blocking(move || {
                sessions.ensure(&path, bindings)?;
                Ok(sessions)
            })
            .await?;
        }

        self.emit(PipelineStatus::Decoding);
        let image = decode_image(image_base64)?;
        let (width, height) = image.dimensions();

        self.emit(PipelineStatus::Preprocessing);
        let input = self.preprocessor.transform(&image);

        self.emit(PipelineStatus::Processing);
        let (_sessions, mask) = run_blocking(move || {
            let mask = sessions.run_inference(&input)?.to_vec();
            Ok((sessions, mask))
        })
        .await?;

        self.emit(PipelineStatus::Finalizing);
        let png = self.postprocessor.transform(&mask, &image, width, height)?;

        tracing::info!(model_id = model.id, width, height, "Background removed");
        Ok(STANDARD.encode(png))
    }
}

/// Runs CPU-bound session work off the async workers.
async fn run_blocking<T, F>(task: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| PipelineError::Worker(e.to_string()))?
}
