use crate::{
    pipeline::{PipelineError, PipelineEvent},
    registry::ModelDescriptor,
    removal_service::RemovalService,
};
use async_stream::stream;
use futures::Stream;
use rembg_proto::{
    background_removal_server::BackgroundRemoval, pipeline_event::Event, DownloadProgress, Empty,
    ModelCatalog, ModelInfo, ModelPresence, ModelQuery, RemovalRequest, RemovalResult,
    VersionInfo,
};
use std::{pin::Pin, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tonic::{async_trait, Request, Response, Status};

impl From<PipelineError> for Status {
    fn from(error: PipelineError) -> Self {
        let message = error.to_string();
        match error {
            PipelineError::Validation(_)
            | PipelineError::Decode(_)
            | PipelineError::UnsupportedFormat(_) => Status::invalid_argument(message),
            PipelineError::Acquisition(_) => Status::unavailable(message),
            PipelineError::Session(_) | PipelineError::Encode(_) | PipelineError::Worker(_) => {
                Status::internal(message)
            }
        }
    }
}

impl From<&ModelDescriptor> for ModelInfo {
    fn from(model: &ModelDescriptor) -> Self {
        ModelInfo {
            id: model.id.to_string(),
            name: model.name.to_string(),
            size_mb: model.size_mb,
            ram: model.ram.to_string(),
            speed: model.speed.to_string(),
            quality: model.quality.to_string(),
            is_default: model.is_default,
        }
    }
}

fn to_proto_event(event: PipelineEvent) -> rembg_proto::PipelineEvent {
    let event = match event {
        PipelineEvent::Status(status) => Event::Status(status.as_str().to_string()),
        PipelineEvent::DownloadProgress(progress) => Event::DownloadProgress(DownloadProgress {
            downloaded: progress.downloaded,
            total: progress.total,
        }),
    };
    rembg_proto::PipelineEvent { event: Some(event) }
}

pub struct InferenceService<M: RemovalService> {
    removal_service: Arc<M>,
}

impl<M: RemovalService> InferenceService<M> {
    pub fn new(removal_service: Arc<M>) -> Self {
        Self { removal_service }
    }
}

#[async_trait]
impl<M: RemovalService> BackgroundRemoval for InferenceService<M> {
    async fn list_models(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ModelCatalog>, Status> {
        let models = self
            .removal_service
            .models()
            .iter()
            .map(ModelInfo::from)
            .collect();

        Ok(Response::new(ModelCatalog { models }))
    }

    async fn is_model_downloaded(
        &self,
        request: Request<ModelQuery>,
    ) -> Result<Response<ModelPresence>, Status> {
        let model_id = request.into_inner().model_id;
        let downloaded = self.removal_service.is_model_downloaded(&model_id);

        Ok(Response::new(ModelPresence {
            model_id,
            downloaded,
        }))
    }

    async fn remove_background(
        &self,
        request: Request<RemovalRequest>,
    ) -> Result<Response<RemovalResult>, Status> {
        let request = request.into_inner();
        let image_base64 = self
            .removal_service
            .remove_background(&request.image_base64, &request.model_id)
            .await?;

        Ok(Response::new(RemovalResult { image_base64 }))
    }

    async fn get_version(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<VersionInfo>, Status> {
        Ok(Response::new(VersionInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    type WatchEventsStream =
        Pin<Box<dyn Stream<Item = Result<rembg_proto::PipelineEvent, Status>> + Send>>;

    async fn watch_events(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::WatchEventsStream>, Status> {
        let mut receiver = self.removal_service.subscribe();
        let current = self.removal_service.status();

        let output_stream = stream! {
            yield Ok(to_proto_event(PipelineEvent::Status(current)));
            loop {
                match receiver.recv().await {
                    Ok(event) => yield Ok(to_proto_event(event)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event watcher lagging behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        Ok(Response::new(Box::pin(output_stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        download::DownloadProgress as Progress,
        pipeline::PipelineStatus,
        registry::{RegistryError, MODEL_CATALOG},
    };
    use futures::StreamExt;
    use tokio::sync::broadcast;

    struct MockRemovalService {
        events: broadcast::Sender<PipelineEvent>,
        status: PipelineStatus,
    }

    impl MockRemovalService {
        fn new() -> Self {
            Self::with_status(PipelineStatus::Initializing)
        }

        fn with_status(status: PipelineStatus) -> Self {
            let (events, _) = broadcast::channel(16);
            Self { events, status }
        }
    }

    #[async_trait]
    impl RemovalService for MockRemovalService {
        fn models(&self) -> &'static [ModelDescriptor] {
            MODEL_CATALOG
        }

        fn is_model_downloaded(&self, model_id: &str) -> bool {
            model_id == "model_fp16.onnx"
        }

        fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
            self.events.subscribe()
        }

        fn status(&self) -> PipelineStatus {
            self.status
        }

        async fn remove_background(
            &self,
            image_base64: &str,
            model_id: &str,
        ) -> Result<String, PipelineError> {
            if model_id != "model_fp16.onnx" {
                return Err(RegistryError::UnknownModel(model_id.to_string()).into());
            }
            let _ = self.events.send(PipelineEvent::Status(PipelineStatus::Done));
            Ok(format!("cutout:{}", image_base64))
        }
    }

    #[tokio::test]
    async fn test_list_models() -> Result<(), Box<dyn std::error::Error>> {
        let service = InferenceService::new(Arc::new(MockRemovalService::new()));

        let catalog = service.list_models(Request::new(Empty {})).await?.into_inner();

        assert_eq!(catalog.models.len(), MODEL_CATALOG.len());
        let defaults: Vec<&str> = catalog
            .models
            .iter()
            .filter(|m| m.is_default)
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(defaults, vec!["model_fp16.onnx"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_background() -> Result<(), Box<dyn std::error::Error>> {
        let service = InferenceService::new(Arc::new(MockRemovalService::new()));

        let request = Request::new(RemovalRequest {
            image_base64: "aGVsbG8=".into(),
            model_id: "model_fp16.onnx".into(),
        });
        let result = service.remove_background(request).await?.into_inner();

        assert_eq!(result.image_base64, "cutout:aGVsbG8=");
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_model_maps_to_invalid_argument() {
        let service = InferenceService::new(Arc::new(MockRemovalService::new()));

        let request = Request::new(RemovalRequest {
            image_base64: "aGVsbG8=".into(),
            model_id: "nope.onnx".into(),
        });
        let status = service.remove_background(request).await.unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_is_model_downloaded() -> Result<(), Box<dyn std::error::Error>> {
        let service = InferenceService::new(Arc::new(MockRemovalService::new()));

        let presence = service
            .is_model_downloaded(Request::new(ModelQuery {
                model_id: "model.onnx".into(),
            }))
            .await?
            .into_inner();

        assert_eq!(presence.model_id, "model.onnx");
        assert!(!presence.downloaded);
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_events_streams_status_and_progress() -> Result<(), Box<dyn std::error::Error>>
    {
        let mock = Arc::new(MockRemovalService::new());
        let service = InferenceService::new(mock.clone());

        let mut stream = service
            .watch_events(Request::new(Empty {}))
            .await?
            .into_inner();

        mock.events.send(PipelineEvent::Status(PipelineStatus::Decoding))?;
        mock.events
            .send(PipelineEvent::DownloadProgress(Progress {
                downloaded: 10,
                total: 20,
            }))?;

        let current = stream.next().await.unwrap()?;
        assert_eq!(current.event, Some(Event::Status("initializing".into())));

        let first = stream.next().await.unwrap()?;
        assert_eq!(first.event, Some(Event::Status("decoding".into())));

        let second = stream.next().await.unwrap()?;
        assert_eq!(
            second.event,
            Some(Event::DownloadProgress(DownloadProgress {
                downloaded: 10,
                total: 20
            }))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_events_opens_with_current_stage() -> Result<(), Box<dyn std::error::Error>>
    {
        let mock = MockRemovalService::with_status(PipelineStatus::Processing);
        let service = InferenceService::new(Arc::new(mock));

        let mut stream = service
            .watch_events(Request::new(Empty {}))
            .await?
            .into_inner();

        let current = stream.next().await.unwrap()?;
        assert_eq!(current.event, Some(Event::Status("processing".into())));
        Ok(())
    }

    #[test]
    fn test_error_mapping() {
        let status: Status = PipelineError::UnsupportedFormat("Gif".into()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: Status = PipelineError::Acquisition(
            crate::download::AcquisitionError::HttpStatus(503),
        )
        .into();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status: Status = PipelineError::Session(crate::session::SessionError::NotLoaded).into();
        assert_eq!(status.code(), tonic::Code::Internal);

        let status: Status = PipelineError::Worker("task panicked".into()).into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
