use std::io;
use std::path::{Path, PathBuf};

const NAME_SEPARATOR: &str = "__";
const MODEL_NAME_PREFIX: &str = "fbml_model";

/// Deterministic on-disk layout for downloaded model files.
#[derive(Debug, Clone)]
pub struct ModelFileManager {
    models_directory: PathBuf,
}

impl ModelFileManager {
    pub fn new(models_directory: impl Into<PathBuf>) -> Self {
        Self {
            models_directory: models_directory.into(),
        }
    }

    pub fn models_directory(&self) -> &Path {
        &self.models_directory
    }

    pub fn model_file_name(app_name: &str, model_name: &str) -> String {
        [MODEL_NAME_PREFIX, app_name, model_name].join(NAME_SEPARATOR)
    }

    pub fn model_file_path(&self, app_name: &str, model_name: &str) -> PathBuf {
        self.models_directory
            .join(Self::model_file_name(app_name, model_name))
    }

    /// Model name of a managed file belonging to `app_name`.
    pub fn model_name_for_app(path: &Path, app_name: &str) -> Option<String> {
        let prefix = Self::model_file_name(app_name, "");
        let model_name = path.file_name()?.to_str()?.strip_prefix(&prefix)?;
        if model_name.is_empty() {
            return None;
        }
        Some(model_name.to_string())
    }

    pub fn is_file_reachable(path: &Path) -> bool {
        path.is_file()
    }

    pub fn ensure_models_directory(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.models_directory)
    }

    /// Bytes free on the volume holding the models directory.
    pub fn available_space(&self) -> io::Result<u64> {
        self.ensure_models_directory()?;
        fs2::available_space(&self.models_directory)
    }

    /// Hidden sibling that holds the previous model file while a new one is installed.
    pub fn backup_path(path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.previous", file_name))
    }

    /// Moves `source` to `destination`, replacing whatever was there.
    pub async fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if Self::is_file_reachable(destination) {
            tokio::fs::remove_file(destination).await?;
        }
        match tokio::fs::rename(source, destination).await {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                // rename cannot cross filesystems
                tracing::debug!(error = %rename_err, "rename failed, copying model file instead");
                tokio::fs::copy(source, destination).await?;
                tokio::fs::remove_file(source).await
            }
        }
    }

    pub async fn remove_file(path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    /// Plain files in the models directory. A missing directory has no files.
    pub async fn contents_of_models_directory(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.models_directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if entry.file_type().await?.is_file() && !hidden {
                files.push(entry.path());
            }
        }
        Ok(files)
    }
}
