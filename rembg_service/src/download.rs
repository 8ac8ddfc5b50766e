use crate::config::ModelConfig;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tonic::async_trait;

/// Minimum spacing between two intermediate progress events.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Failed to execute download request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Failed to download (HTTP {0}). Make sure the access token is set for gated models")]
    HttpStatus(u16),
    #[error("Interrupted during download: {0}")]
    Interrupted(String),
    #[error("Failed to write model file: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    /// Zero when the server did not declare a length.
    pub total: u64,
}

/// An open response body for one weight file.
pub struct WeightDownload {
    pub total: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, AcquisitionError>>,
}

#[async_trait]
pub trait WeightSource: Send + Sync + 'static {
    async fn open(&self, model_id: &str) -> Result<WeightDownload, AcquisitionError>;
}

pub struct HttpWeightSource {
    client: reqwest::Client,
    url_template: String,
    token: Option<String>,
}

impl HttpWeightSource {
    pub fn new(model_config: &ModelConfig) -> Result<Self, AcquisitionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(model_config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url_template: model_config.download_url.clone(),
            token: model_config.token(),
        })
    }

    pub fn url_for(&self, model_id: &str) -> String {
        self.url_template.replace("{model_id}", model_id)
    }

    fn request(&self, model_id: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(self.url_for(model_id));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl WeightSource for HttpWeightSource {
    async fn open(&self, model_id: &str) -> Result<WeightDownload, AcquisitionError> {
        let response = self.request(model_id).send().await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(model_id, status = status.as_u16(), "Model download rejected");
            return Err(AcquisitionError::HttpStatus(status.as_u16()));
        }

        let total = response.content_length();
        let chunks = response
            .bytes_stream()
            .map_err(|e| AcquisitionError::Interrupted(e.to_string()))
            .boxed();

        Ok(WeightDownload { total, chunks })
    }
}

/// Rate limiter for progress notifications.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Returns true and records `now` if an emission is allowed.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

#[derive(Debug)]
struct DownloadState {
    total: Option<u64>,
    transferred: u64,
    throttle: ProgressThrottle,
}

impl DownloadState {
    fn new(total: Option<u64>, interval: Duration) -> Self {
        Self {
            total,
            transferred: 0,
            throttle: ProgressThrottle::new(interval),
        }
    }

    fn poll(&mut self, now: Instant) -> Option<DownloadProgress> {
        self.throttle.ready(now).then(|| DownloadProgress {
            downloaded: self.transferred,
            total: self.total.unwrap_or(0),
        })
    }

    fn finish(&self) -> DownloadProgress {
        DownloadProgress {
            downloaded: self.transferred,
            total: self.total.unwrap_or(self.transferred),
        }
    }
}

pub fn temp_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

pub struct ModelAcquisition<S: WeightSource> {
    source: S,
    progress_interval: Duration,
}

impl<S: WeightSource> ModelAcquisition<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            progress_interval: PROGRESS_INTERVAL,
        }
    }

    /// Downloads `model_id` to `destination`, which only appears once the
    /// whole body has been written.
    pub async fn acquire<F>(
        &self,
        model_id: &str,
        destination: &Path,
        mut on_progress: F,
    ) -> Result<u64, AcquisitionError>
    where
        F: FnMut(DownloadProgress),
    {
        let parent = destination.parent().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no parent directory", destination.display()),
            )
        })?;
        fs::create_dir_all(parent).await?;

        let download = self.source.open(model_id).await?;
        let tmp_path = temp_path(destination);
        let mut state = DownloadState::new(download.total, self.progress_interval);

        tracing::info!(model_id, total = ?download.total, "Downloading model");

        if let Err(e) = write_chunks(&tmp_path, download.chunks, &mut state, &mut on_progress).await
        {
            tracing::error!(model_id, error = %e, "Model download failed");
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        on_progress(state.finish());

        if let Err(e) = fs::rename(&tmp_path, destination).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        tracing::info!(
            model_id,
            bytes = state.transferred,
            path = %destination.display(),
            "Model installed"
        );
        Ok(state.transferred)
    }
}

async fn write_chunks<F>(
    tmp_path: &Path,
    mut chunks: BoxStream<'static, Result<Bytes, AcquisitionError>>,
    state: &mut DownloadState,
    on_progress: &mut F,
) -> Result<(), AcquisitionError>
where
    F: FnMut(DownloadProgress),
{
    let mut file = fs::File::create(tmp_path).await?;

    if let Some(progress) = state.poll(Instant::now()) {
        on_progress(progress);
    }

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        state.transferred += chunk.len() as u64;

        if let Some(progress) = state.poll(Instant::now()) {
            tracing::debug!(
                downloaded = progress.downloaded,
                total = progress.total,
                "Download progress"
            );
            on_progress(progress);
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}
