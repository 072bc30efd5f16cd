pub mod middleware;

use serde::Deserialize;
use std::path::PathBuf;

pub use middleware::{AuthTokenError, AuthTokenProvider, InstallationsAuthMiddleware, StaticTokenProvider};

/// Identifies the Firebase project and client app a `FirebaseApp` talks to.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FirebaseOptions {
    pub project_id: String,
    pub api_key: String,
    /// Bundle identifier of the client app, sent with every model info request
    /// and used to scope persisted model info.
    #[serde(default)]
    pub bundle_id: String,
}

const DEFAULT_ML_API_BASE_URL: &str = "https://firebaseml.googleapis.com";
const DEFAULT_NUMBER_OF_RETRIES: u32 = 1;

/// Tunables for the model downloader.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelDownloaderConfig {
    /// Where downloaded model files live. Defaults to the platform data directory.
    pub models_directory: Option<PathBuf>,
    /// Scheme and host of the model info endpoint.
    pub api_base_url: String,
    /// How many times an expired download URL is refreshed before giving up.
    pub number_of_retries: u32,
}

impl Default for ModelDownloaderConfig {
    fn default() -> Self {
        Self {
            models_directory: None,
            api_base_url: DEFAULT_ML_API_BASE_URL.to_string(),
            number_of_retries: DEFAULT_NUMBER_OF_RETRIES,
        }
    }
}

impl ModelDownloaderConfig {
    pub fn resolved_models_directory(&self) -> PathBuf {
        self.models_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("firebase-ml")
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct FirebaseErrorResponse {
    pub error: FirebaseErrorDetails,
}

#[derive(Debug, Deserialize)]
pub struct FirebaseErrorDetails {
    pub code: u16,
    pub message: String,
    pub status: Option<String>,
}

impl FirebaseErrorResponse {
    pub fn display_message(&self) -> String {
        format!("{} (code: {})", self.error.message, self.error.code)
    }
}

pub async fn parse_error_response(response: reqwest::Response, default_msg: &str) -> String {
    let status = response.status();
    match response.json::<FirebaseErrorResponse>().await {
        Ok(error_resp) => error_resp.display_message(),
        Err(_) => format!("{}: {}", default_msg, status),
    }
}
