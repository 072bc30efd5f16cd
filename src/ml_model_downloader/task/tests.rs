use super::*;
use crate::ml_model_downloader::store::{MemoryStore, StoreError};
use crate::ml_model_downloader::test_support::*;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Fixture {
    _dir: tempfile::TempDir,
    models_dir: std::path::PathBuf,
    store: Arc<MemoryStore>,
    scope: StoreScope,
    downloader: Arc<ScriptedDownloader>,
}

fn fixture(script: Vec<Scripted>) -> Fixture {
    fixture_with(|dir| ScriptedDownloader::new(dir, script))
}

fn fixture_with(build: impl FnOnce(std::path::PathBuf) -> ScriptedDownloader) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let models_dir = dir.path().join("models");
    let downloader = Arc::new(build(dir.path().join("tmp")));
    Fixture {
        models_dir,
        store: Arc::new(MemoryStore::new()),
        scope: StoreScope::new("com.example.app", "fakeAppName"),
        downloader,
        _dir: dir,
    }
}

impl Fixture {
    fn task(&self, remote: RemoteModelInfo) -> ModelDownloadTask {
        self.task_with_store(remote, self.store.clone())
    }

    fn task_with_store(&self, remote: RemoteModelInfo, store: Arc<dyn KeyValueStore>) -> ModelDownloadTask {
        let context = TaskContext {
            app_name: "fakeAppName".to_string(),
            scope: self.scope.clone(),
            store,
            file_manager: ModelFileManager::new(&self.models_dir),
            downloader: self.downloader.clone(),
            conditions: ModelDownloadConditions::default(),
        };
        ModelDownloadTask::new(remote, context, ProgressHub::new())
    }
}

#[tokio::test]
async fn test_download_with_200_saves_model() {
    let fx = fixture_with(|dir| {
        ScriptedDownloader::new(dir, vec![Scripted::Status(StatusCode::OK)])
            .with_progress(vec![(100, 250), (100, 250)])
    });
    let task = fx.task(fake_remote_model_info(false));

    let progress_calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = progress_calls.clone();
    let result = task.merge(Some(Arc::new(move |p: f32| recorded.lock().unwrap().push(p))));
    task.resume();

    let model = result.await.unwrap();
    assert_eq!(model.name, FAKE_MODEL_NAME);
    assert_eq!(model.size, FAKE_MODEL_SIZE);
    assert_eq!(model.hash, FAKE_MODEL_HASH);
    assert_eq!(model.path, fx.models_dir.join("fbml_model__fakeAppName__fakeModelName"));
    assert_eq!(std::fs::read(&model.path).unwrap(), FAKE_MODEL_DATA);
    assert_eq!(*progress_calls.lock().unwrap(), vec![0.4, 0.4]);
    assert_eq!(fx.downloader.urls()[0].as_str(), FAKE_DOWNLOAD_URL);
    assert_eq!(task.state(), TaskState::Completed);

    let stored = fx.scope.read(&*fx.store, FAKE_MODEL_NAME).unwrap();
    assert_eq!(stored.model_hash, FAKE_MODEL_HASH);
    assert_eq!(stored.path, model.path);
}

#[tokio::test]
async fn test_download_with_400_and_expired_url() {
    let fx = fixture(vec![Scripted::Status(StatusCode::BAD_REQUEST)]);
    let task = fx.task(fake_remote_model_info(true));

    let result = task.merge(None);
    task.resume();

    assert_eq!(result.await, Err(DownloadError::ExpiredDownloadUrl));
    assert_eq!(task.state(), TaskState::Failed);
    // the temporary download is cleaned up
    assert!(!fx._dir.path().join("tmp").join("download-0.tmp").exists());
}

#[tokio::test]
async fn test_download_with_400_and_valid_url() {
    let fx = fixture(vec![Scripted::Status(StatusCode::BAD_REQUEST)]);
    let task = fx.task(fake_remote_model_info(false));

    let result = task.merge(None);
    task.resume();

    assert_eq!(result.await, Err(DownloadError::InvalidArgument));
}

#[tokio::test]
async fn test_download_http_errors_map_to_error_kinds() {
    let cases = [
        (StatusCode::NOT_FOUND, DownloadError::NotFound),
        (StatusCode::FORBIDDEN, DownloadError::PermissionDenied),
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            DownloadError::internal("Model download failed with HTTP error code: 500"),
        ),
    ];

    for (status, expected) in cases {
        let fx = fixture(vec![Scripted::Status(status)]);
        let task = fx.task(fake_remote_model_info(false));
        let result = task.merge(None);
        task.resume();
        assert_eq!(result.await, Err(expected));
    }
}

#[tokio::test]
async fn test_transport_error_is_internal() {
    let fx = fixture(vec![Scripted::TransportError]);
    let task = fx.task(fake_remote_model_info(false));

    let result = task.merge(None);
    task.resume();

    match result.await {
        Err(DownloadError::InternalError { description }) => {
            assert!(description.contains("connection reset by peer"));
        }
        other => panic!("Expected internal error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_merged_requests_share_one_transfer() {
    let fx = fixture_with(|dir| {
        ScriptedDownloader::new(dir, vec![Scripted::Status(StatusCode::OK)])
            .with_delay(std::time::Duration::from_millis(50))
            .with_progress(vec![(10, 20)])
    });
    let task = fx.task(fake_remote_model_info(false));

    let progress_count = Arc::new(AtomicUsize::new(0));
    let subscribers: Vec<_> = (0..3)
        .map(|_| {
            let count = progress_count.clone();
            task.merge(Some(Arc::new(move |_: f32| {
                count.fetch_add(1, Ordering::SeqCst);
            })))
        })
        .collect();
    assert_eq!(task.state(), TaskState::Merged);

    task.resume();
    task.resume();

    let results = futures::future::join_all(subscribers).await;
    assert_eq!(fx.downloader.calls(), 1);
    let first = results[0].clone().unwrap();
    for result in results {
        assert_eq!(result.unwrap(), first);
    }
    assert_eq!(progress_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_oversized_model_fails_without_transfer() {
    let fx = fixture(vec![Scripted::Status(StatusCode::OK)]);
    let mut remote = fake_remote_model_info(false);
    remote.size = u64::MAX / 4;
    let task = fx.task(remote);

    let result = task.merge(None);
    task.resume();

    assert_eq!(result.await, Err(DownloadError::NotEnoughSpace));
    assert_eq!(fx.downloader.calls(), 0);
}

#[tokio::test]
async fn test_failed_download_keeps_previous_model() {
    let fx = fixture(vec![Scripted::Status(StatusCode::NOT_FOUND)]);
    let previous = LocalModelInfo {
        name: FAKE_MODEL_NAME.to_string(),
        download_url: "https://old-url.com".to_string(),
        model_hash: "oldHash".to_string(),
        size: 10,
        path: fx.models_dir.join("fbml_model__fakeAppName__fakeModelName"),
    };
    std::fs::create_dir_all(&fx.models_dir).unwrap();
    std::fs::write(&previous.path, b"old").unwrap();
    fx.scope.write(&*fx.store, &previous).unwrap();

    let task = fx.task(fake_remote_model_info(false));
    let result = task.merge(None);
    task.resume();

    assert_eq!(result.await, Err(DownloadError::NotFound));
    assert_eq!(fx.scope.read(&*fx.store, FAKE_MODEL_NAME), Some(previous.clone()));
    assert_eq!(std::fs::read(&previous.path).unwrap(), b"old");
}

/// Serves reads from an in-memory store and rejects every write.
struct ReadOnlyStore {
    inner: MemoryStore,
}

impl KeyValueStore for ReadOnlyStore {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.get(key)
    }

    fn set_values(&self, _entries: Vec<(String, serde_json::Value)>) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only store",
        )))
    }

    fn remove_values(&self, _keys: &[String]) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only store",
        )))
    }
}

#[tokio::test]
async fn test_failed_model_info_save_restores_previous_model() {
    let fx = fixture(vec![Scripted::Status(StatusCode::OK)]);
    let model_path = fx.models_dir.join("fbml_model__fakeAppName__fakeModelName");
    let previous = LocalModelInfo {
        name: FAKE_MODEL_NAME.to_string(),
        download_url: "https://old-url.com".to_string(),
        model_hash: "oldHash".to_string(),
        size: 10,
        path: model_path.clone(),
    };
    std::fs::create_dir_all(&fx.models_dir).unwrap();
    std::fs::write(&model_path, b"old").unwrap();
    let store = Arc::new(ReadOnlyStore {
        inner: MemoryStore::new(),
    });
    fx.scope.write(&store.inner, &previous).unwrap();

    let task = fx.task_with_store(fake_remote_model_info(false), store.clone());
    let result = task.merge(None);
    task.resume();

    match result.await {
        Err(DownloadError::InternalError { description }) => {
            assert!(description.starts_with("Unable to save model info"));
        }
        other => panic!("Expected internal error, got {:?}", other),
    }
    assert_eq!(std::fs::read(&model_path).unwrap(), b"old");
    assert_eq!(fx.scope.read(&*store, FAKE_MODEL_NAME), Some(previous));
    assert!(!ModelFileManager::backup_path(&model_path).exists());
    assert!(!fx._dir.path().join("tmp").join("download-0.tmp").exists());
}

#[tokio::test]
async fn test_failed_model_info_save_leaves_no_model_file() {
    let fx = fixture(vec![Scripted::Status(StatusCode::OK)]);
    let store = Arc::new(ReadOnlyStore {
        inner: MemoryStore::new(),
    });

    let task = fx.task_with_store(fake_remote_model_info(false), store.clone());
    let result = task.merge(None);
    task.resume();

    assert!(result.await.is_err());
    assert!(!fx.models_dir.join("fbml_model__fakeAppName__fakeModelName").exists());
    assert!(fx.scope.read(&*store, FAKE_MODEL_NAME).is_none());
}

#[tokio::test]
async fn test_successful_download_replaces_previous_model() {
    let fx = fixture(vec![Scripted::Status(StatusCode::OK)]);
    let model_path = fx.models_dir.join("fbml_model__fakeAppName__fakeModelName");
    std::fs::create_dir_all(&fx.models_dir).unwrap();
    std::fs::write(&model_path, b"old").unwrap();

    let task = fx.task(fake_remote_model_info(false));
    let result = task.merge(None);
    task.resume();

    let model = result.await.unwrap();
    assert_eq!(std::fs::read(&model.path).unwrap(), FAKE_MODEL_DATA);
    assert!(!ModelFileManager::backup_path(&model_path).exists());
}
