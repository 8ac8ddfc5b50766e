use crate::{
    download::WeightSource,
    pipeline::{BackgroundRemover, PipelineError, PipelineEvent, PipelineStatus},
    registry::ModelDescriptor,
    session::InferenceBackend,
};
use tokio::sync::broadcast;
use tonic::async_trait;

#[async_trait]
pub trait RemovalService: Send + Sync + 'static {
    fn models(&self) -> &'static [ModelDescriptor];
    fn is_model_downloaded(&self, model_id: &str) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<PipelineEvent>;
    fn status(&self) -> PipelineStatus;
    async fn remove_background(
        &self,
        image_base64: &str,
        model_id: &str,
    ) -> Result<String, PipelineError>;
}

#[async_trait]
impl<B: InferenceBackend, S: WeightSource> RemovalService for BackgroundRemover<B, S> {
    fn models(&self) -> &'static [ModelDescriptor] {
        BackgroundRemover::models(self)
    }

    fn is_model_downloaded(&self, model_id: &str) -> bool {
        BackgroundRemover::is_model_downloaded(self, model_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        BackgroundRemover::subscribe(self)
    }

    fn status(&self) -> PipelineStatus {
        BackgroundRemover::status(self)
    }

    async fn remove_background(
        &self,
        image_base64: &str,
        model_id: &str,
    ) -> Result<String, PipelineError> {
        BackgroundRemover::remove_background(self, image_base64, model_id).await
    }
}
