use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Fields shared by every view of a model's metadata.
///
/// `model_hash` is the server-issued ETag for the model version. It is opaque:
/// the client never recomputes it from file contents.
pub trait ModelInfo {
    fn name(&self) -> &str;
    fn download_url(&self) -> &str;
    fn model_hash(&self) -> &str;
    fn size(&self) -> u64;
}

/// Model metadata as just reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteModelInfo {
    pub name: String,
    /// Short-lived signed URL for the model file.
    pub download_url: Url,
    pub model_hash: String,
    pub size: u64,
    pub url_expiry_time: DateTime<Utc>,
}

impl RemoteModelInfo {
    /// The server rejects the signed URL once this returns true.
    pub fn is_url_expired(&self) -> bool {
        self.url_expiry_time <= Utc::now()
    }
}

impl ModelInfo for RemoteModelInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn download_url(&self) -> &str {
        self.download_url.as_str()
    }

    fn model_hash(&self) -> &str {
        &self.model_hash
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// A model the device believes it already has on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModelInfo {
    pub name: String,
    pub download_url: String,
    pub model_hash: String,
    pub size: u64,
    pub path: PathBuf,
}

impl LocalModelInfo {
    pub fn from_remote(remote: &RemoteModelInfo, path: PathBuf) -> Self {
        Self {
            name: remote.name.clone(),
            download_url: remote.download_url.to_string(),
            model_hash: remote.model_hash.clone(),
            size: remote.size,
            path,
        }
    }

    pub fn to_custom_model(&self) -> CustomModel {
        CustomModel {
            name: self.name.clone(),
            size: self.size,
            path: self.path.clone(),
            hash: self.model_hash.clone(),
        }
    }
}

impl ModelInfo for LocalModelInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn download_url(&self) -> &str {
        &self.download_url
    }

    fn model_hash(&self) -> &str {
        &self.model_hash
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Snapshot of a downloaded model handed back to callers.
///
/// The file stays owned by the models directory; a later download of the same
/// model replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CustomModel {
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
    pub hash: String,
}

/// How `get_model` treats a model that is already on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelDownloadType {
    /// Use the local copy when there is one, otherwise download.
    LocalModel,
    /// Use the local copy when there is one and refresh it in the background.
    LocalModelUpdateInBackground,
    /// Always check the server for a newer version first.
    #[default]
    LatestModel,
}

/// Constraints handed through to the file downloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDownloadConditions {
    pub allows_cellular_access: bool,
    pub allows_background_downloading: bool,
    pub timeout: Option<Duration>,
}

impl Default for ModelDownloadConditions {
    fn default() -> Self {
        Self {
            allows_cellular_access: true,
            allows_background_downloading: false,
            timeout: None,
        }
    }
}

/// Outcome of a model info fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadModelInfoResult {
    /// The local model info is still current.
    NotModified,
    ModelInfo(RemoteModelInfo),
}

/// Body of a 200 response from the model info endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ModelInfoResponse {
    pub(crate) download_uri: String,
    pub(crate) expire_time: String,
    pub(crate) size_bytes: String,
}
