use crate::ml_model_downloader::{DownloadError, ModelDownloader};
use crate::FirebaseApp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// One `ModelDownloader` per Firebase app name.
///
/// Entries live until the app is deleted, at which point `app_deleted` drops
/// them. Apps share the process-wide registry unless given their own.
#[derive(Default)]
pub struct ModelDownloaderRegistry {
    downloaders: Mutex<HashMap<String, ModelDownloader>>,
}

static SHARED_REGISTRY: OnceLock<Arc<ModelDownloaderRegistry>> = OnceLock::new();

impl ModelDownloaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn shared() -> Arc<ModelDownloaderRegistry> {
        SHARED_REGISTRY
            .get_or_init(|| Arc::new(ModelDownloaderRegistry::new()))
            .clone()
    }

    /// Returns the downloader for `app`, creating it on first use.
    pub fn model_downloader(&self, app: &FirebaseApp) -> Result<ModelDownloader, DownloadError> {
        let mut downloaders = self.downloaders.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(downloader) = downloaders.get(app.name()) {
            return Ok(downloader.clone());
        }

        let downloader = ModelDownloader::new(
            app.name(),
            app.options().clone(),
            app.token_provider(),
            app.config(),
        )?;
        tracing::debug!(app = app.name(), "created model downloader");
        downloaders.insert(app.name().to_string(), downloader.clone());
        Ok(downloader)
    }

    /// Registers a prebuilt downloader, replacing any existing one for the app.
    pub fn register(&self, downloader: ModelDownloader) {
        self.downloaders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(downloader.app_name().to_string(), downloader);
    }

    pub fn is_registered(&self, app_name: &str) -> bool {
        self.downloaders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(app_name)
    }

    /// Teardown hook for a deleted app. Returns whether a downloader was dropped.
    pub fn app_deleted(&self, app_name: &str) -> bool {
        let removed = self
            .downloaders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(app_name)
            .is_some();
        if removed {
            tracing::debug!(app = app_name, "removed model downloader for deleted app");
        }
        removed
    }
}
