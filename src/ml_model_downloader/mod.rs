//! Firebase ML model downloader.
//!
//! Downloads custom models hosted by Firebase ML and keeps them on disk.
//!
//! A download is a two step cycle: fetch the model info (a conditional GET keyed
//! by the locally cached model hash), then transfer the model file from the
//! short-lived signed URL the info points at. Concurrent requests for the same
//! model join one cycle. If the signed URL expires before the transfer, the
//! model info is fetched again, up to `number_of_retries` times.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use firebase_ml_model_downloader::FirebaseApp;
//! # use firebase_ml_model_downloader::ml_model_downloader::{ModelDownloadConditions, ModelDownloadType};
//! # async fn run(app: FirebaseApp) {
//! let downloader = app.model_downloader().unwrap();
//!
//! let model = downloader
//!     .get_model("image_classifier", ModelDownloadType::LatestModel, ModelDownloadConditions::default(), None)
//!     .await;
//! # }
//! ```

pub mod file_downloader;
pub mod file_manager;
pub mod models;
pub mod registry;
pub mod retriever;
pub mod store;
pub mod task;

#[cfg(test)]
mod test_support;

use crate::core::middleware::{AuthTokenProvider, InstallationsAuthMiddleware};
use crate::core::{FirebaseOptions, ModelDownloaderConfig};
use file_downloader::{FileDownloader, HttpFileDownloader};
use file_manager::ModelFileManager;
use futures::FutureExt;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use retriever::ModelInfoRetriever;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use store::{FileStore, KeyValueStore, StoreScope};
use task::{ModelDownloadTask, ProgressHandler, ProgressHub, SharedTaskResult, TaskContext};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use models::{
    CustomModel, DownloadModelInfoResult, LocalModelInfo, ModelDownloadConditions,
    ModelDownloadType, ModelInfo, RemoteModelInfo,
};
pub use registry::ModelDownloaderRegistry;

/// Errors that can occur while downloading a model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    /// The model name was rejected by the server.
    #[error("Invalid argument")]
    InvalidArgument,
    /// No model with this name exists.
    #[error("Model not found")]
    NotFound,
    /// The app is not allowed to read the model.
    #[error("Permission denied")]
    PermissionDenied,
    /// The signed download URL expired before the transfer.
    #[error("Model download URL expired")]
    ExpiredDownloadUrl,
    /// The device does not have room for the model file.
    #[error("Not enough space for model on device")]
    NotEnoughSpace,
    #[error("Internal error: {description}")]
    InternalError { description: String },
}

impl DownloadError {
    pub fn internal(description: impl Into<String>) -> Self {
        Self::InternalError {
            description: description.into(),
        }
    }
}

/// Errors that can occur while listing or deleting downloaded models.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadedModelError {
    #[error("Model not found")]
    NotFound,
    #[error("File I/O error: {description}")]
    FileIoError { description: String },
    #[error("Internal error: {description}")]
    InternalError { description: String },
}

const EXPIRED_MODEL_INFO: &str = "Unable to update expired model info.";
const MODEL_INFO_STORE_FILE: &str = "fbml_model_info.json";
const DOWNLOADS_TEMP_DIRECTORY: &str = "downloads";

/// Pieces a `ModelDownloader` is assembled from.
pub struct ModelDownloaderComponents {
    /// Client for model info requests. Must attach the installations auth token.
    pub client: ClientWithMiddleware,
    pub store: Arc<dyn KeyValueStore>,
    pub file_manager: ModelFileManager,
    pub file_downloader: Arc<dyn FileDownloader>,
}

struct InFlightDownload {
    progress: ProgressHub,
    result: SharedTaskResult,
}

struct DownloaderInner {
    app_name: String,
    options: FirebaseOptions,
    api_base_url: String,
    client: ClientWithMiddleware,
    scope: StoreScope,
    store: Arc<dyn KeyValueStore>,
    file_manager: ModelFileManager,
    file_downloader: Arc<dyn FileDownloader>,
    number_of_retries: AtomicU32,
    in_flight: Mutex<HashMap<String, InFlightDownload>>,
}

/// Client for downloading and managing custom models of one Firebase app.
#[derive(Clone)]
pub struct ModelDownloader {
    inner: Arc<DownloaderInner>,
}

impl ModelDownloader {
    /// Creates a new `ModelDownloader` backed by HTTP and a JSON file store.
    ///
    /// This is typically called via `FirebaseApp::model_downloader()`.
    pub fn new(
        app_name: impl Into<String>,
        options: FirebaseOptions,
        token_provider: Arc<dyn AuthTokenProvider>,
        config: &ModelDownloaderConfig,
    ) -> Result<Self, DownloadError> {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .with(InstallationsAuthMiddleware::new(token_provider))
            .build();

        let models_directory = config.resolved_models_directory();
        let store: Arc<dyn KeyValueStore> = FileStore::shared(models_directory.join(MODEL_INFO_STORE_FILE))
            .map_err(|e| DownloadError::internal(format!("Unable to open model info store - {}", e)))?;
        let file_downloader =
            HttpFileDownloader::new(models_directory.join(DOWNLOADS_TEMP_DIRECTORY));

        let components = ModelDownloaderComponents {
            client,
            store,
            file_manager: ModelFileManager::new(models_directory),
            file_downloader: Arc::new(file_downloader),
        };
        Ok(Self::new_with_components(app_name, options, config, components))
    }

    /// Creates a new `ModelDownloader` from caller-supplied parts.
    pub fn new_with_components(
        app_name: impl Into<String>,
        options: FirebaseOptions,
        config: &ModelDownloaderConfig,
        components: ModelDownloaderComponents,
    ) -> Self {
        let app_name = app_name.into();
        let scope = StoreScope::new(options.bundle_id.clone(), app_name.clone());

        Self {
            inner: Arc::new(DownloaderInner {
                app_name,
                options,
                api_base_url: config.api_base_url.clone(),
                client: components.client,
                scope,
                store: components.store,
                file_manager: components.file_manager,
                file_downloader: components.file_downloader,
                number_of_retries: AtomicU32::new(config.number_of_retries),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub fn number_of_retries(&self) -> u32 {
        self.inner.number_of_retries.load(Ordering::SeqCst)
    }

    pub fn set_number_of_retries(&self, retries: u32) {
        self.inner.number_of_retries.store(retries, Ordering::SeqCst);
    }

    /// Gets a model, downloading it if `download_type` calls for it.
    ///
    /// # Arguments
    ///
    /// * `model_name` - Name of the model as configured in the Firebase console.
    /// * `download_type` - Whether a model already on the device may be used.
    /// * `conditions` - Constraints for the file transfer.
    /// * `progress` - Optional handler receiving the transfer progress in `[0, 1]`.
    pub async fn get_model(
        &self,
        model_name: &str,
        download_type: ModelDownloadType,
        conditions: ModelDownloadConditions,
        progress: Option<ProgressHandler>,
    ) -> Result<CustomModel, DownloadError> {
        if model_name.is_empty() {
            return Err(DownloadError::InvalidArgument);
        }

        match download_type {
            ModelDownloadType::LocalModel => {
                if let Some(model) = self.local_model(model_name) {
                    debug!(model = model_name, "using local model");
                    return Ok(model);
                }
            }
            ModelDownloadType::LocalModelUpdateInBackground => {
                if let Some(model) = self.local_model(model_name) {
                    debug!(model = model_name, "using local model, updating in background");
                    let downloader = self.clone();
                    let name = model_name.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = downloader
                            .download_info_and_model(&name, conditions, None)
                            .await
                        {
                            warn!(model = %name, error = %e, "background model update failed");
                        }
                    });
                    return Ok(model);
                }
            }
            ModelDownloadType::LatestModel => {}
        }

        self.download_info_and_model(model_name, conditions, progress)
            .await
    }

    /// Fetches the latest model info and, when it changed, the model file.
    ///
    /// Requests for a model that is already being downloaded join the running
    /// download instead of starting another one.
    pub async fn download_info_and_model(
        &self,
        model_name: &str,
        conditions: ModelDownloadConditions,
        progress: Option<ProgressHandler>,
    ) -> Result<CustomModel, DownloadError> {
        let result = {
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.get(model_name) {
                Some(existing) => {
                    debug!(model = model_name, "merging request with in-flight download");
                    if let Some(handler) = progress {
                        existing.progress.register(handler);
                    }
                    existing.result.clone()
                }
                None => {
                    let hub = ProgressHub::new();
                    if let Some(handler) = progress {
                        hub.register(handler);
                    }
                    let result = self
                        .clone()
                        .run_download_cycle(model_name.to_string(), conditions, hub.clone())
                        .boxed()
                        .shared();
                    in_flight.insert(
                        model_name.to_string(),
                        InFlightDownload {
                            progress: hub,
                            result: result.clone(),
                        },
                    );
                    tokio::spawn(result.clone());
                    result
                }
            }
        };

        result.await
    }

    async fn run_download_cycle(
        self,
        model_name: String,
        conditions: ModelDownloadConditions,
        progress: ProgressHub,
    ) -> Result<CustomModel, DownloadError> {
        let result = self
            .download_with_retries(&model_name, &conditions, &progress)
            .await;
        self.inner.in_flight.lock().await.remove(&model_name);
        result
    }

    async fn download_with_retries(
        &self,
        model_name: &str,
        conditions: &ModelDownloadConditions,
        progress: &ProgressHub,
    ) -> Result<CustomModel, DownloadError> {
        let mut local_info = self.local_model_info(model_name);
        let mut retry_count: u32 = 0;

        loop {
            let retriever = ModelInfoRetriever::new(
                self.inner.client.clone(),
                self.inner.api_base_url.clone(),
                &self.inner.options,
                model_name,
                local_info.clone(),
            );

            let remote = match retriever.download_model_info().await? {
                DownloadModelInfoResult::NotModified => {
                    match local_info
                        .as_ref()
                        .filter(|local| ModelFileManager::is_file_reachable(&local.path))
                    {
                        Some(local) => return Ok(local.to_custom_model()),
                        None => {
                            debug!(model = model_name, "local model file missing, fetching model info again");
                            local_info = None;
                            continue;
                        }
                    }
                }
                DownloadModelInfoResult::ModelInfo(remote) => remote,
            };

            let task = ModelDownloadTask::new(
                remote,
                self.task_context(conditions.clone()),
                progress.clone(),
            );
            let result = task.merge(None);
            task.resume();

            match result.await {
                Err(DownloadError::ExpiredDownloadUrl) => {
                    if retry_count < self.number_of_retries() {
                        retry_count += 1;
                        info!(model = model_name, retry = retry_count, "download URL expired, refreshing model info");
                        local_info = None;
                        continue;
                    }
                    warn!(model = model_name, "download URL expired, no retries left");
                    return Err(DownloadError::internal(EXPIRED_MODEL_INFO));
                }
                other => return other,
            }
        }
    }

    fn task_context(&self, conditions: ModelDownloadConditions) -> TaskContext {
        TaskContext {
            app_name: self.inner.app_name.clone(),
            scope: self.inner.scope.clone(),
            store: self.inner.store.clone(),
            file_manager: self.inner.file_manager.clone(),
            downloader: self.inner.file_downloader.clone(),
            conditions,
        }
    }

    fn local_model_info(&self, model_name: &str) -> Option<LocalModelInfo> {
        self.inner.scope.read(self.inner.store.as_ref(), model_name)
    }

    /// Local model whose info and file are both present.
    fn local_model(&self, model_name: &str) -> Option<CustomModel> {
        self.local_model_info(model_name)
            .filter(|info| ModelFileManager::is_file_reachable(&info.path))
            .map(|info| info.to_custom_model())
    }

    /// Lists the models of this app that are downloaded and on disk.
    pub async fn list_downloaded_models(&self) -> Result<Vec<CustomModel>, DownloadedModelError> {
        let files = self
            .inner
            .file_manager
            .contents_of_models_directory()
            .await
            .map_err(|e| DownloadedModelError::InternalError {
                description: format!("Could not retrieve model files in directory - {}", e),
            })?;

        let mut models = Vec::new();
        for path in files {
            let Some(model_name) = ModelFileManager::model_name_for_app(&path, &self.inner.app_name)
            else {
                continue;
            };
            match self.local_model_info(&model_name) {
                Some(info) if info.path == path => models.push(info.to_custom_model()),
                _ => debug!(path = %path.display(), "skipping model file without model info"),
            }
        }
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// Deletes a downloaded model file and its stored model info.
    pub async fn delete_downloaded_model(&self, model_name: &str) -> Result<(), DownloadedModelError> {
        let info = self
            .local_model_info(model_name)
            .ok_or(DownloadedModelError::NotFound)?;

        if ModelFileManager::is_file_reachable(&info.path) {
            ModelFileManager::remove_file(&info.path).await.map_err(|e| {
                DownloadedModelError::FileIoError {
                    description: format!("Could not delete old model file - {}", e),
                }
            })?;
        }

        let scope = self.inner.scope.clone();
        let store = self.inner.store.clone();
        let name = model_name.to_string();
        tokio::task::spawn_blocking(move || scope.remove(store.as_ref(), &name).map_err(|e| e.to_string()))
            .await
            .map_err(|e| e.to_string())
            .and_then(|removed| removed)
            .map_err(|description| DownloadedModelError::InternalError {
                description: format!("Could not delete model info - {}", description),
            })?;

        info!(model = model_name, "deleted downloaded model");
        Ok(())
    }
}
