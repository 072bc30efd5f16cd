pub mod core;
#[cfg(feature = "ml_model_downloader")]
pub mod ml_model_downloader;

use crate::core::{AuthTokenProvider, FirebaseOptions, ModelDownloaderConfig};
#[cfg(feature = "ml_model_downloader")]
use ml_model_downloader::{DownloadError, ModelDownloader, ModelDownloaderRegistry};
use std::sync::Arc;

pub const DEFAULT_APP_NAME: &str = "__FIRAPP_DEFAULT";

#[derive(Clone)]
pub struct FirebaseApp {
    name: String,
    options: FirebaseOptions,
    token_provider: Arc<dyn AuthTokenProvider>,
    config: ModelDownloaderConfig,
    #[cfg(feature = "ml_model_downloader")]
    registry: Arc<ModelDownloaderRegistry>,
}

impl FirebaseApp {
    pub fn new(options: FirebaseOptions, token_provider: Arc<dyn AuthTokenProvider>) -> Self {
        Self::with_name(DEFAULT_APP_NAME, options, token_provider)
    }

    pub fn with_name(
        name: impl Into<String>,
        options: FirebaseOptions,
        token_provider: Arc<dyn AuthTokenProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            options,
            token_provider,
            config: ModelDownloaderConfig::default(),
            #[cfg(feature = "ml_model_downloader")]
            registry: ModelDownloaderRegistry::shared(),
        }
    }

    pub fn with_config(mut self, config: ModelDownloaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `registry` instead of the process-wide one.
    #[cfg(feature = "ml_model_downloader")]
    pub fn with_registry(mut self, registry: Arc<ModelDownloaderRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &FirebaseOptions {
        &self.options
    }

    pub fn config(&self) -> &ModelDownloaderConfig {
        &self.config
    }

    pub fn token_provider(&self) -> Arc<dyn AuthTokenProvider> {
        self.token_provider.clone()
    }

    /// The model downloader of this app. Repeated calls return the same instance.
    #[cfg(feature = "ml_model_downloader")]
    pub fn model_downloader(&self) -> Result<ModelDownloader, DownloadError> {
        self.registry.model_downloader(self)
    }

    /// Deletes the app, releasing its model downloader.
    pub fn delete(self) -> bool {
        #[cfg(feature = "ml_model_downloader")]
        {
            self.registry.app_deleted(&self.name)
        }
        #[cfg(not(feature = "ml_model_downloader"))]
        {
            true
        }
    }
}
