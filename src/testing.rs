//! In-memory collaborators for exercising the queue without a network.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;

use crate::error::{FetchError, StorageError};
use crate::fetcher::{ByteStream, HttpFetcher, SourceMetadata};
use crate::item::TransferSnapshot;
use crate::pipeline::{PipelineDeps, PipelineOptions};
use crate::queue::{Queue, QueueOptions};
use crate::storage::{FileUpload, FolderHandle, ProgressFn, RemoteFile, StorageClient, StorageProvider};

pub const RESET_ERROR: &str = "connection reset by peer\n    at fake_stream (testing.rs)";

/// Serves a fixed body in chunks. With a gate, every chunk after the first
/// waits for a permit, which holds transfers in `Downloading`. A probe gate
/// holds them in `FetchingMetadata` instead.
pub struct FakeFetcher {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
    pub chunk_size: usize,
    pub gate: Option<Arc<Semaphore>>,
    pub probe_gate: Option<Arc<Semaphore>>,
    /// Number of upcoming `stream` calls that break after the first chunk.
    pub stream_failures: AtomicU32,
    /// Status every `stream` call answers with instead of a body.
    pub stream_status: Option<u16>,
    pub stream_calls: AtomicU32,
    pub probe_error: Option<String>,
    pub probed: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        let body = vec![7u8; 64];
        Self {
            content_type: Some("image/jpeg".to_string()),
            content_length: Some(body.len() as u64),
            body,
            chunk_size: 16,
            gate: None,
            probe_gate: None,
            stream_failures: AtomicU32::new(0),
            stream_status: None,
            stream_calls: AtomicU32::new(0),
            probe_error: None,
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(permits: usize) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(permits));
        let fetcher = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::new()
        };
        (fetcher, gate)
    }

    pub fn probe_gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Self {
            probe_gate: Some(Arc::clone(&gate)),
            ..Self::new()
        };
        (fetcher, gate)
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }

    pub fn stream_calls(&self) -> u32 {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

/// Waits for and consumes one permit when a gate is set.
async fn pass(gate: &Option<Arc<Semaphore>>) {
    let Some(gate) = gate else {
        return;
    };
    if let Ok(permit) = gate.acquire().await {
        permit.forget();
    }
}

#[async_trait]
impl HttpFetcher for FakeFetcher {
    async fn probe(&self, url: &str) -> Result<SourceMetadata, FetchError> {
        self.probed.lock().unwrap().push(url.to_string());
        pass(&self.probe_gate).await;
        if let Some(message) = &self.probe_error {
            return Err(FetchError::Transport(message.clone()));
        }
        Ok(SourceMetadata {
            content_type: self.content_type.clone(),
            content_length: self.content_length,
        })
    }

    async fn stream(&self, _url: &str) -> Result<ByteStream, FetchError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.stream_status {
            return Err(FetchError::Status(code));
        }
        let chunks: Vec<Vec<u8>> = self.body.chunks(self.chunk_size).map(<[u8]>::to_vec).collect();
        let fail = self
            .stream_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let gate = self.gate.clone();

        let stream = futures::stream::unfold(
            (0usize, chunks, gate, fail),
            |(index, chunks, gate, fail)| async move {
                if index >= chunks.len() {
                    return None;
                }
                if index > 0 {
                    if fail {
                        let err = FetchError::Transport(RESET_ERROR.to_string());
                        return Some((Err(err), (usize::MAX, chunks, gate, fail)));
                    }
                    if let Some(gate) = &gate {
                        gate.acquire().await.ok()?.forget();
                    }
                }
                let chunk = chunks[index].clone();
                Some((Ok(chunk), (index + 1, chunks, gate, fail)))
            },
        );
        Ok(stream.boxed())
    }
}

/// Reads uploads fully into memory. With a gate, each upload waits for a
/// permit after reading its body, which holds transfers in `Uploading`.
#[derive(Default)]
pub struct FakeStorage {
    pub fail_with: Option<String>,
    pub gate: Option<Arc<Semaphore>>,
    pub stored: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeStorage {
    pub fn stored_names(&self) -> Vec<String> {
        self.stored
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl StorageClient for FakeStorage {
    async fn get_or_create_folder(&self, name: &str) -> Result<FolderHandle, StorageError> {
        Ok(FolderHandle {
            id: name.to_string(),
        })
    }

    async fn create_or_update_file(
        &self,
        mut upload: FileUpload<'_>,
        on_progress: ProgressFn<'_>,
    ) -> Result<RemoteFile, StorageError> {
        let mut body = Vec::new();
        upload.body.read_to_end(&mut body).await?;
        on_progress(body.len() as u64);
        pass(&self.gate).await;
        if let Some(message) = &self.fail_with {
            return Err(StorageError::Remote(message.clone()));
        }

        let remote_id = format!("{}/{}", upload.parent.id, upload.name);
        let final_size = body.len() as u64;
        self.stored
            .lock()
            .unwrap()
            .push((upload.name.to_string(), body));
        Ok(RemoteFile {
            remote_url: format!("https://storage.test/{}", remote_id),
            remote_id,
            final_size,
        })
    }
}

pub struct FakeProvider(pub Arc<FakeStorage>);

impl StorageProvider for FakeProvider {
    fn client_for(&self, _session_id: &str) -> Arc<dyn StorageClient> {
        self.0.clone()
    }
}

pub fn test_options(concurrency_limit: usize) -> QueueOptions {
    QueueOptions {
        concurrency_limit,
        dispatch_tick: Duration::from_millis(20),
        pipeline: PipelineOptions {
            upload_folder: "Downloads".to_string(),
            work_dir: std::env::temp_dir().join("drive-relay-tests"),
            download_retries: 3,
            retry_backoff: Duration::from_millis(1),
            progress_interval: Duration::ZERO,
        },
    }
}

pub fn test_queue(
    concurrency_limit: usize,
    fetcher: Arc<FakeFetcher>,
    storage: Arc<FakeStorage>,
) -> Queue {
    let options = test_options(concurrency_limit);
    let deps = PipelineDeps {
        fetcher,
        storage,
        options: Arc::new(options.pipeline.clone()),
    };
    Queue::new("test-session", &options, deps)
}

/// Polls until the item for `url` satisfies `done`, panicking after 5s.
pub async fn wait_for(
    queue: &Queue,
    url: &str,
    done: impl Fn(&TransferSnapshot) -> bool,
) -> TransferSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = queue.get(url);
        match &snapshot {
            Some(snapshot) if done(snapshot) => return snapshot.clone(),
            _ => {}
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting on {}: last seen {:?}", url, snapshot);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
