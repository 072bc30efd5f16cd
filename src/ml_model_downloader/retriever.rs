use crate::core::middleware::is_auth_token_error;
use crate::core::{parse_error_response, FirebaseOptions};
use crate::ml_model_downloader::models::{
    DownloadModelInfoResult, LocalModelInfo, ModelInfoResponse, RemoteModelInfo,
};
use crate::ml_model_downloader::DownloadError;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::ETAG;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use url::Url;

const HASH_MATCH_HEADER: &str = "if-none-match";
const BUNDLE_ID_HEADER: &str = "x-ios-bundle-identifier";

const AUTH_TOKEN_ERROR: &str = "Error retrieving auth token.";
const MISSING_MODEL_HASH: &str = "Model hash missing in model info server response.";
const INVALID_FETCH_URL: &str = "Unable to create URL to fetch model info.";
const UNEXPECTED_MODEL_INFO_DELETION: &str = "Model info was deleted unexpectedly.";
const MODEL_HASH_MISMATCH: &str = "Unexpected model hash value.";
const ANOTHER_DOWNLOAD_IN_PROGRESS: &str = "Model info download already in progress.";
const DECODE_MODEL_INFO_RESPONSE: &str = "Unable to decode model info response from server.";
const INVALID_DOWNLOAD_URL: &str = "Invalid model download URL from server.";
const INVALID_URL_EXPIRY_TIME: &str = "Invalid download URL expiry time from server.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelInfoDownloadStatus {
    NotStarted,
    InProgress,
    Complete,
}

/// Fetches model metadata, validating the local copy with a conditional GET.
///
/// One retriever allows one request at a time. A call that overlaps a running
/// request fails instead of queueing; sequential calls are fine.
pub struct ModelInfoRetriever {
    client: ClientWithMiddleware,
    base_url: String,
    model_name: String,
    project_id: String,
    api_key: String,
    bundle_id: String,
    local_model_info: Option<LocalModelInfo>,
    download_status: Mutex<ModelInfoDownloadStatus>,
}

impl ModelInfoRetriever {
    /// `base_url` is the scheme and host of the ML API, e.g. `https://firebaseml.googleapis.com`.
    pub fn new(
        client: ClientWithMiddleware,
        base_url: impl Into<String>,
        options: &FirebaseOptions,
        model_name: impl Into<String>,
        local_model_info: Option<LocalModelInfo>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model_name: model_name.into(),
            project_id: options.project_id.clone(),
            api_key: options.api_key.clone(),
            bundle_id: options.bundle_id.clone(),
            local_model_info,
            download_status: Mutex::new(ModelInfoDownloadStatus::NotStarted),
        }
    }

    pub fn download_status(&self) -> ModelInfoDownloadStatus {
        *self.download_status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_download_status(&self, status: ModelInfoDownloadStatus) {
        *self.download_status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn model_info_fetch_url(&self) -> Result<Url, DownloadError> {
        let url = format!(
            "{}/v1beta2/projects/{}/models/{}:download",
            self.base_url.trim_end_matches('/'),
            self.project_id,
            self.model_name
        );
        let mut url = Url::parse(&url).map_err(|_| DownloadError::internal(INVALID_FETCH_URL))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    /// Fetches model info from the server.
    ///
    /// Returns `NotModified` when the server confirms the local model info is
    /// current, otherwise fresh `RemoteModelInfo`.
    pub async fn download_model_info(&self) -> Result<DownloadModelInfoResult, DownloadError> {
        let url = self.model_info_fetch_url()?;

        {
            let mut status = self.download_status.lock().unwrap_or_else(PoisonError::into_inner);
            if *status == ModelInfoDownloadStatus::InProgress {
                debug!(model = %self.model_name, "{}", ANOTHER_DOWNLOAD_IN_PROGRESS);
                return Err(DownloadError::internal(ANOTHER_DOWNLOAD_IN_PROGRESS));
            }
            *status = ModelInfoDownloadStatus::InProgress;
        }

        let mut request = self
            .client
            .get(url)
            .header(BUNDLE_ID_HEADER, self.bundle_id.as_str());
        if let Some(local) = &self.local_model_info {
            request = request.header(HASH_MATCH_HEADER, local.model_hash.as_str());
        }

        let result = request.send().await;
        self.set_download_status(ModelInfoDownloadStatus::Complete);

        let response = match result {
            Ok(response) => response,
            Err(e) if is_auth_token_error(&e) => {
                debug!(model = %self.model_name, "{}", AUTH_TOKEN_ERROR);
                return Err(DownloadError::internal(AUTH_TOKEN_ERROR));
            }
            Err(e) => {
                let description = format!("Failed to retrieve model info: {}", e);
                debug!(model = %self.model_name, "{}", description);
                return Err(DownloadError::internal(description));
            }
        };

        self.classify_response(response).await
    }

    async fn classify_response(
        &self,
        response: reqwest::Response,
    ) -> Result<DownloadModelInfoResult, DownloadError> {
        let status = response.status();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        debug!(model = %self.model_name, %status, "received model info response");

        match status {
            StatusCode::OK => {
                let model_hash = etag.ok_or_else(|| {
                    debug!(model = %self.model_name, "{}", MISSING_MODEL_HASH);
                    DownloadError::internal(MISSING_MODEL_HASH)
                })?;
                let body = response.bytes().await.map_err(|e| {
                    DownloadError::internal(format!("Failed to parse model info: {}", e))
                })?;
                let info = self.remote_model_info_from_response(&body, model_hash)?;
                debug!(model = %self.model_name, size = info.size, "model info downloaded");
                Ok(DownloadModelInfoResult::ModelInfo(info))
            }
            StatusCode::NOT_MODIFIED => {
                let local = self.local_model_info.as_ref().ok_or_else(|| {
                    debug!(model = %self.model_name, "{}", UNEXPECTED_MODEL_INFO_DELETION);
                    DownloadError::internal(UNEXPECTED_MODEL_INFO_DELETION)
                })?;
                let model_hash = etag.ok_or_else(|| DownloadError::internal(MISSING_MODEL_HASH))?;
                if model_hash != local.model_hash {
                    debug!(model = %self.model_name, "{}", MODEL_HASH_MISMATCH);
                    return Err(DownloadError::internal(MODEL_HASH_MISMATCH));
                }
                debug!(model = %self.model_name, "local model info matches the latest on server");
                Ok(DownloadModelInfoResult::NotModified)
            }
            StatusCode::BAD_REQUEST => {
                self.log_server_error(response).await;
                Err(DownloadError::InvalidArgument)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.log_server_error(response).await;
                Err(DownloadError::PermissionDenied)
            }
            StatusCode::NOT_FOUND => {
                self.log_server_error(response).await;
                Err(DownloadError::NotFound)
            }
            other => {
                self.log_server_error(response).await;
                Err(DownloadError::internal(format!(
                    "Model info retrieval failed with HTTP error code: {}",
                    other.as_u16()
                )))
            }
        }
    }

    async fn log_server_error(&self, response: reqwest::Response) {
        let message = parse_error_response(response, "Model info request failed").await;
        debug!(model = %self.model_name, "{}", message);
    }

    fn remote_model_info_from_response(
        &self,
        body: &[u8],
        model_hash: String,
    ) -> Result<RemoteModelInfo, DownloadError> {
        let response: ModelInfoResponse = serde_json::from_slice(body)
            .map_err(|_| DownloadError::internal(DECODE_MODEL_INFO_RESPONSE))?;
        let download_url = Url::parse(&response.download_uri)
            .map_err(|_| DownloadError::internal(INVALID_DOWNLOAD_URL))?;
        let size = response
            .size_bytes
            .trim()
            .parse::<u64>()
            .map_err(|_| DownloadError::internal(DECODE_MODEL_INFO_RESPONSE))?;
        let url_expiry_time = parse_expiry_time(&response.expire_time)
            .ok_or_else(|| DownloadError::internal(INVALID_URL_EXPIRY_TIME))?;

        Ok(RemoteModelInfo {
            name: self.model_name.clone(),
            download_url,
            model_hash,
            size,
            url_expiry_time,
        })
    }
}

/// Parses the URL expiry time: RFC 3339 first, then the fixed
/// `yyyy-MM-ddTHH:mm:ss.SSSZ` layout.
pub(crate) fn parse_expiry_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.3fZ")
                .ok()
                .map(|t| t.and_utc())
        })
}
