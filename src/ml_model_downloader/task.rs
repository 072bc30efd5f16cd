//! One in-flight model file transfer.
//!
//! A `ModelDownloadTask` performs exactly one transfer for one `RemoteModelInfo`
//! no matter how many callers subscribe to it. Subscribers get a clone of the
//! same shared future and all observe the same terminal result.

use crate::ml_model_downloader::file_downloader::{
    FileDownloader, FileDownloaderResponse, TransferProgressHandler,
};
use crate::ml_model_downloader::file_manager::ModelFileManager;
use crate::ml_model_downloader::models::{
    CustomModel, LocalModelInfo, ModelDownloadConditions, RemoteModelInfo,
};
use crate::ml_model_downloader::store::{KeyValueStore, StoreScope};
use crate::ml_model_downloader::DownloadError;
use futures::future::{BoxFuture, FutureExt, Shared};
use http::StatusCode;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Receives download progress as a fraction in `[0, 1]`.
pub type ProgressHandler = Arc<dyn Fn(f32) + Send + Sync>;

pub type TaskResult = Result<CustomModel, DownloadError>;

/// Future that resolves to the task's terminal result. Cheap to clone.
pub type SharedTaskResult = Shared<BoxFuture<'static, TaskResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Scheduled,
    /// Scheduled with more than one subscriber.
    Merged,
    Running,
    Completed,
    Failed,
}

/// Fan-out point for progress handlers of every subscriber.
#[derive(Clone, Default)]
pub struct ProgressHub {
    handlers: Arc<Mutex<Vec<ProgressHandler>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: ProgressHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn notify(&self, fraction: f32) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(fraction);
        }
    }
}

/// Everything the transfer needs once it is running.
pub(crate) struct TaskContext {
    pub(crate) app_name: String,
    pub(crate) scope: StoreScope,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) file_manager: ModelFileManager,
    pub(crate) downloader: Arc<dyn FileDownloader>,
    pub(crate) conditions: ModelDownloadConditions,
}

pub struct ModelDownloadTask {
    remote_model_info: RemoteModelInfo,
    state: Arc<Mutex<TaskState>>,
    subscribers: Mutex<usize>,
    progress: ProgressHub,
    result: SharedTaskResult,
}

impl ModelDownloadTask {
    pub(crate) fn new(
        remote_model_info: RemoteModelInfo,
        context: TaskContext,
        progress: ProgressHub,
    ) -> Self {
        let state = Arc::new(Mutex::new(TaskState::Scheduled));
        let result = run_transfer(
            remote_model_info.clone(),
            context,
            progress.clone(),
            state.clone(),
        )
        .boxed()
        .shared();

        Self {
            remote_model_info,
            state,
            subscribers: Mutex::new(0),
            progress,
            result,
        }
    }

    pub fn remote_model_info(&self) -> &RemoteModelInfo {
        &self.remote_model_info
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to this task's result, optionally with a progress handler.
    ///
    /// Every subscriber's future resolves exactly once with the same result.
    pub fn merge(&self, progress: Option<ProgressHandler>) -> SharedTaskResult {
        if let Some(handler) = progress {
            self.progress.register(handler);
        }
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        *subscribers += 1;
        if *subscribers > 1 {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == TaskState::Scheduled {
                *state = TaskState::Merged;
            }
        }
        self.result.clone()
    }

    /// Starts the transfer. Calling it again has no effect.
    pub fn resume(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                TaskState::Scheduled | TaskState::Merged => *state = TaskState::Running,
                _ => return,
            }
        }
        debug!(model = %self.remote_model_info.name, "starting model file transfer");
        tokio::spawn(self.result.clone());
    }
}

const SPACE_CHECK_FAILED: &str = "could not determine free space for models directory";

async fn run_transfer(
    remote: RemoteModelInfo,
    context: TaskContext,
    progress: ProgressHub,
    state: Arc<Mutex<TaskState>>,
) -> TaskResult {
    let result = transfer(&remote, &context, &progress).await;
    let terminal = if result.is_ok() {
        TaskState::Completed
    } else {
        TaskState::Failed
    };
    *state.lock().unwrap_or_else(PoisonError::into_inner) = terminal;
    result
}

async fn transfer(
    remote: &RemoteModelInfo,
    context: &TaskContext,
    progress: &ProgressHub,
) -> TaskResult {
    let file_manager = context.file_manager.clone();
    let available_space = tokio::task::spawn_blocking(move || file_manager.available_space())
        .await
        .map_err(std::io::Error::other)
        .and_then(|space| space);
    match available_space {
        Ok(available) if remote.size > available => {
            warn!(model = %remote.name, size = remote.size, available, "not enough space for model");
            return Err(DownloadError::NotEnoughSpace);
        }
        Ok(_) => {}
        Err(e) => warn!(model = %remote.name, error = %e, "{}", SPACE_CHECK_FAILED),
    }

    let expected_size = remote.size;
    let hub = progress.clone();
    let transfer_progress: TransferProgressHandler = Arc::new(move |written: u64, total: u64| {
        let total = if total > 0 { total } else { expected_size };
        if total == 0 {
            return;
        }
        let fraction = (written as f64 / total as f64).clamp(0.0, 1.0) as f32;
        hub.notify(fraction);
    });

    let response = context
        .downloader
        .download_file(&remote.download_url, &context.conditions, transfer_progress)
        .await
        .map_err(|e| {
            debug!(model = %remote.name, error = %e, "model file transfer failed");
            DownloadError::internal(format!("Failed to download model file: {}", e))
        })?;

    handle_response(remote, context, response).await
}

async fn handle_response(
    remote: &RemoteModelInfo,
    context: &TaskContext,
    response: FileDownloaderResponse,
) -> TaskResult {
    if response.status != StatusCode::OK {
        discard_temp_file(&response.file_path).await;
    }

    match response.status {
        StatusCode::OK => install_model(remote, context, &response.file_path).await,
        StatusCode::BAD_REQUEST if remote.is_url_expired() => {
            debug!(model = %remote.name, "model download URL expired");
            Err(DownloadError::ExpiredDownloadUrl)
        }
        StatusCode::BAD_REQUEST => Err(DownloadError::InvalidArgument),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DownloadError::PermissionDenied),
        StatusCode::NOT_FOUND => Err(DownloadError::NotFound),
        other => Err(DownloadError::internal(format!(
            "Model download failed with HTTP error code: {}",
            other.as_u16()
        ))),
    }
}

/// Moves the downloaded file into place and records its model info.
///
/// The previous model file is parked next to the destination until the model
/// info is saved, and put back if anything fails.
async fn install_model(
    remote: &RemoteModelInfo,
    context: &TaskContext,
    downloaded: &Path,
) -> TaskResult {
    let destination = context
        .file_manager
        .model_file_path(&context.app_name, &remote.name);
    let backup = ModelFileManager::backup_path(&destination);
    let has_previous = ModelFileManager::is_file_reachable(&destination);

    if has_previous {
        if let Err(e) = ModelFileManager::move_file(&destination, &backup).await {
            discard_temp_file(downloaded).await;
            return Err(DownloadError::internal(format!("Unable to save model file - {}", e)));
        }
    }

    let local = LocalModelInfo::from_remote(remote, destination.clone());
    let installed = match ModelFileManager::move_file(downloaded, &destination).await {
        Ok(()) => persist_model_info(context, &local).await,
        Err(e) => {
            discard_temp_file(downloaded).await;
            Err(DownloadError::internal(format!("Unable to save model file - {}", e)))
        }
    };

    match installed {
        Ok(()) => {
            if has_previous {
                if let Err(e) = ModelFileManager::remove_file(&backup).await {
                    warn!(path = %backup.display(), error = %e, "could not remove previous model file");
                }
            }
            info!(model = %remote.name, path = %local.path.display(), "model downloaded");
            Ok(local.to_custom_model())
        }
        Err(e) => {
            let restored = if has_previous {
                ModelFileManager::move_file(&backup, &destination).await
            } else if ModelFileManager::is_file_reachable(&destination) {
                ModelFileManager::remove_file(&destination).await
            } else {
                Ok(())
            };
            if let Err(restore_err) = restored {
                warn!(model = %remote.name, error = %restore_err, "could not restore previous model file");
            }
            Err(e)
        }
    }
}

async fn persist_model_info(context: &TaskContext, local: &LocalModelInfo) -> Result<(), DownloadError> {
    let scope = context.scope.clone();
    let store = context.store.clone();
    let local = local.clone();
    tokio::task::spawn_blocking(move || scope.write(store.as_ref(), &local).map_err(|e| e.to_string()))
        .await
        .map_err(|e| e.to_string())
        .and_then(|written| written)
        .map_err(|e| DownloadError::internal(format!("Unable to save model info - {}", e)))
}

async fn discard_temp_file(path: &Path) {
    if ModelFileManager::is_file_reachable(path) {
        if let Err(e) = ModelFileManager::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "could not remove temporary download");
        }
    }
}

#[cfg(test)]
mod tests;
