use crate::{
    config::Config,
    download::HttpWeightSource,
    inference_service::InferenceService,
    ort_backend::OrtBackend,
    pipeline::BackgroundRemover,
    preprocess::PreprocessConfig,
    registry::ModelRegistry,
    removal_service::RemovalService,
};
use rembg_proto::background_removal_server::BackgroundRemovalServer;
use std::sync::Arc;
use tokio::{signal, sync::broadcast};
use tonic::transport::server::Router;
use tonic::transport::Server;

/// Base64 photos routinely exceed tonic's 4 MiB default.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
const EVENT_CAPACITY: usize = 64;

pub struct GrpcServer {
    router: Router,
    addr: String,
}

impl GrpcServer {
    pub async fn new<M: RemovalService>(
        removal_service: Arc<M>,
        addr: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let inference_service = InferenceService::new(removal_service);
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(rembg_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<BackgroundRemovalServer<InferenceService<M>>>()
            .await;

        let router = Server::builder()
            .add_service(
                BackgroundRemovalServer::new(inference_service)
                    .max_decoding_message_size(MAX_MESSAGE_SIZE)
                    .max_encoding_message_size(MAX_MESSAGE_SIZE),
            )
            .add_service(health_service)
            .add_service(reflection_service);

        Ok(Self {
            router,
            addr: addr.to_string(),
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let addr = self.addr.parse()?;

        tracing::info!("Background removal service listening on {}", self.addr);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        self.router.serve_with_shutdown(addr, shutdown).await?;
        Ok(())
    }
}

pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let model_dir = config.model.resolve_model_dir();
    tracing::info!(model_dir = %model_dir.display(), "Using model directory");

    let registry = ModelRegistry::new(model_dir);
    if let Some(model) = registry.default_model() {
        tracing::info!(
            default_model = model.id,
            installed = registry.is_installed(model.id),
            "Default model"
        );
    }

    let weight_source = HttpWeightSource::new(&config.model)?;
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let remover = Arc::new(BackgroundRemover::new(
        registry,
        OrtBackend,
        weight_source,
        PreprocessConfig::from(&config.preprocess),
        events,
    ));

    let addr = config.server.get_address();
    let grpc_server = GrpcServer::new(remover.clone(), &addr).await?;

    let served = grpc_server.run().await;
    remover.shutdown().await;
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
