//! Fakes shared by the model downloader tests.

use crate::ml_model_downloader::file_downloader::{
    FileDownloader, FileDownloaderError, FileDownloaderResponse, TransferProgressHandler,
};
use crate::ml_model_downloader::models::{ModelDownloadConditions, RemoteModelInfo};
use chrono::{Duration as ChronoDuration, Utc};
use http::StatusCode;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

pub(crate) const FAKE_MODEL_NAME: &str = "fakeModelName";
pub(crate) const FAKE_MODEL_HASH: &str = "fakeModelHash";
pub(crate) const FAKE_MODEL_SIZE: u64 = 20;
pub(crate) const FAKE_DOWNLOAD_URL: &str = "https://fake-download-url.com/model";
pub(crate) const FAKE_MODEL_DATA: &[u8] = b"fakeModelData";

#[derive(Debug, Clone, Copy)]
pub(crate) enum Scripted {
    Status(StatusCode),
    TransportError,
}

/// File downloader that replays scripted outcomes and counts transfers.
pub(crate) struct ScriptedDownloader {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    calls: AtomicUsize,
    urls: Mutex<Vec<Url>>,
    temp_directory: PathBuf,
    delay: Duration,
    progress_steps: Vec<(u64, u64)>,
}

impl ScriptedDownloader {
    pub(crate) fn new(temp_directory: impl Into<PathBuf>, script: Vec<Scripted>) -> Self {
        let fallback = script.last().copied().unwrap_or(Scripted::Status(StatusCode::OK));
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            temp_directory: temp_directory.into(),
            delay: Duration::ZERO,
            progress_steps: Vec::new(),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_progress(mut self, steps: Vec<(u64, u64)>) -> Self {
        self.progress_steps = steps;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl FileDownloader for ScriptedDownloader {
    async fn download_file(
        &self,
        url: &Url,
        _conditions: &ModelDownloadConditions,
        progress: TransferProgressHandler,
    ) -> Result<FileDownloaderResponse, FileDownloaderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        let status = match outcome {
            Scripted::Status(status) => status,
            Scripted::TransportError => {
                return Err(FileDownloaderError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )))
            }
        };

        for (written, total) in &self.progress_steps {
            progress(*written, *total);
        }

        std::fs::create_dir_all(&self.temp_directory)?;
        let file_path = self.temp_directory.join(format!("download-{}.tmp", call));
        std::fs::write(&file_path, FAKE_MODEL_DATA)?;
        Ok(FileDownloaderResponse { status, file_path })
    }
}

pub(crate) fn fake_remote_model_info(expired: bool) -> RemoteModelInfo {
    let offset = if expired {
        ChronoDuration::seconds(-1000)
    } else {
        ChronoDuration::seconds(1000)
    };
    RemoteModelInfo {
        name: FAKE_MODEL_NAME.to_string(),
        download_url: Url::parse(FAKE_DOWNLOAD_URL).unwrap(),
        model_hash: FAKE_MODEL_HASH.to_string(),
        size: FAKE_MODEL_SIZE,
        url_expiry_time: Utc::now() + offset,
    }
}
