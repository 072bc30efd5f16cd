use crate::ml_model_downloader::models::ModelDownloadConditions;
use futures::StreamExt;
use http::StatusCode;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Receives `(bytes_written, total_bytes)`. `total_bytes` is 0 when unknown.
pub type TransferProgressHandler = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Error, Debug)]
pub enum FileDownloaderError {
    #[error("Middleware error: {0}")]
    Request(#[from] reqwest_middleware::Error),
    #[error("HTTP Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a finished transfer. The file at `file_path` belongs to the caller.
#[derive(Debug, Clone)]
pub struct FileDownloaderResponse {
    pub status: StatusCode,
    pub file_path: PathBuf,
}

/// Moves the bytes behind a download URL into a local temporary file.
///
/// HTTP error statuses are reported through `FileDownloaderResponse::status`;
/// only transport failures are errors.
#[async_trait::async_trait]
pub trait FileDownloader: Send + Sync {
    async fn download_file(
        &self,
        url: &Url,
        conditions: &ModelDownloadConditions,
        progress: TransferProgressHandler,
    ) -> Result<FileDownloaderResponse, FileDownloaderError>;
}

/// Streams downloads over HTTP into temporary files.
#[derive(Clone)]
pub struct HttpFileDownloader {
    client: ClientWithMiddleware,
    temp_directory: PathBuf,
}

impl HttpFileDownloader {
    /// Temporary files are created inside `temp_directory`; keeping it on the
    /// same volume as the models directory lets the final move be a rename.
    pub fn new(temp_directory: impl Into<PathBuf>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self::new_with_client(client, temp_directory)
    }

    pub fn new_with_client(client: ClientWithMiddleware, temp_directory: impl Into<PathBuf>) -> Self {
        Self {
            client,
            temp_directory: temp_directory.into(),
        }
    }
}

#[async_trait::async_trait]
impl FileDownloader for HttpFileDownloader {
    async fn download_file(
        &self,
        url: &Url,
        conditions: &ModelDownloadConditions,
        progress: TransferProgressHandler,
    ) -> Result<FileDownloaderResponse, FileDownloaderError> {
        let mut request = self.client.get(url.clone());
        if let Some(timeout) = conditions.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        let status = response.status();
        let total_bytes = response.content_length().unwrap_or(0);

        tokio::fs::create_dir_all(&self.temp_directory).await?;
        let temp_file = tempfile::Builder::new()
            .prefix("fbml_download")
            .tempfile_in(&self.temp_directory)?;
        let (std_file, file_path) = temp_file.keep().map_err(|e| e.error)?;
        let mut file = tokio::fs::File::from_std(std_file);

        let written = async {
            let mut stream = response.bytes_stream();
            let mut bytes_written: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                bytes_written += chunk.len() as u64;
                progress(bytes_written, total_bytes);
            }
            file.flush().await?;
            Ok::<u64, FileDownloaderError>(bytes_written)
        }
        .await;

        match written {
            Ok(bytes_written) => {
                tracing::debug!(%status, bytes_written, path = %file_path.display(), "file transfer finished");
                Ok(FileDownloaderResponse { status, file_path })
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&file_path).await;
                Err(e)
            }
        }
    }
}
