mod inference_service;
mod ort_backend;
mod server;

pub mod config;
pub mod download;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod registry;
pub mod removal_service;
pub mod session;

pub use ort_backend::OrtBackend;
pub use pipeline::{BackgroundRemover, PipelineError, PipelineEvent, PipelineStatus};
pub use server::{start_server, GrpcServer};
