//! The per-item pipeline: metadata → download → upload → cleanup.
//!
//! Every stage checks for cancellation before it starts, races its network
//! I/O against the item's cancellation token, and checks again once the I/O
//! returns. Stage failures never escape: [`run`] folds them into the item's
//! final state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{TransferError, first_line};
use crate::fetcher::HttpFetcher;
use crate::item::{TransferItem, TransferState};
use crate::progress::{Progress, ProgressThrottle};
use crate::storage::{FileUpload, RemoteFile, StorageClient};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub upload_folder: String,
    pub work_dir: PathBuf,
    pub download_retries: u32,
    pub retry_backoff: Duration,
    pub progress_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            upload_folder: "Downloads".to_string(),
            work_dir: std::env::temp_dir().join("drive-relay"),
            download_retries: 3,
            retry_backoff: Duration::from_millis(500),
            progress_interval: Duration::from_millis(200),
        }
    }
}

/// Collaborators a pipeline run needs; cheap to clone into each task.
#[derive(Clone)]
pub struct PipelineDeps {
    pub fetcher: Arc<dyn HttpFetcher>,
    pub storage: Arc<dyn StorageClient>,
    pub options: Arc<PipelineOptions>,
}

struct Metadata {
    content_type: String,
    content_length: u64,
}

/// Downloaded body on local disk, removed when dropped unless kept.
struct ScratchFile {
    path: PathBuf,
    keep: bool,
}

impl ScratchFile {
    fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(format!("{}.download", Uuid::new_v4())),
            keep: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Runs every stage for `item` and resolves its final state.
pub async fn run(item: Arc<TransferItem>, deps: PipelineDeps) -> TransferState {
    let outcome = execute(&item, &deps).await;
    match &outcome {
        Ok(file) => info!("Relayed {} to {}", item.url(), file.remote_url),
        Err(TransferError::Cancelled) => info!("Transfer of {} stopped by user", item.url()),
        Err(e) => warn!("Transfer of {} failed: {}", item.url(), e),
    }
    item.finish(outcome)
}

async fn execute(item: &TransferItem, deps: &PipelineDeps) -> Result<RemoteFile, TransferError> {
    let metadata = get_metadata(item, deps).await?;

    let mut scratch = ScratchFile::new(&deps.options.work_dir);
    let downloaded = download(item, deps, &metadata, &scratch).await?;

    let result = upload(item, deps, &metadata, &scratch, downloaded).await;
    if let Err(TransferError::Upload(_)) = &result {
        warn!(
            "Keeping downloaded body of {} at {:?}",
            item.url(),
            scratch.path()
        );
        scratch.keep();
    }
    result
}

fn checkpoint(item: &TransferItem) -> Result<(), TransferError> {
    if item.is_cancelled() {
        Err(TransferError::Cancelled)
    } else {
        Ok(())
    }
}

async fn get_metadata(item: &TransferItem, deps: &PipelineDeps) -> Result<Metadata, TransferError> {
    checkpoint(item)?;
    item.enter(TransferState::FetchingMetadata, "Getting metadata");

    let probe = tokio::select! {
        biased;
        _ = item.cancelled() => return Err(TransferError::Cancelled),
        probe = deps.fetcher.probe(item.url()) => probe,
    };
    checkpoint(item)?;

    let metadata = probe.map_err(|e| TransferError::Metadata(e.to_string()))?;
    let content_type = metadata
        .content_type
        .ok_or_else(|| TransferError::Metadata("No content type".to_string()))?;
    let content_length = metadata.content_length.unwrap_or(0);
    debug!(
        "Metadata for {}: {} ({} bytes)",
        item.url(),
        content_type,
        content_length
    );

    item.set_metadata(content_type.clone(), content_length);
    Ok(Metadata {
        content_type,
        content_length,
    })
}

async fn download(
    item: &TransferItem,
    deps: &PipelineDeps,
    metadata: &Metadata,
    scratch: &ScratchFile,
) -> Result<u64, TransferError> {
    checkpoint(item)?;
    item.enter(TransferState::Downloading, "Downloading...");
    fs::create_dir_all(&deps.options.work_dir)
        .await
        .map_err(|e| TransferError::Transport(format!("Failed to prepare work dir: {}", e)))?;

    let retries = deps.options.download_retries;
    let mut attempt = 0;
    loop {
        match download_once(item, deps, metadata, scratch.path()).await {
            Err(TransferError::Transport(message)) if attempt < retries => {
                attempt += 1;
                warn!(
                    "Download of {} failed (attempt {}/{}): {}",
                    item.url(),
                    attempt,
                    retries + 1,
                    message
                );
                item.report(
                    Progress::new(0, metadata.content_length).percent(),
                    format!("Retrying ({}/{}): {}", attempt, retries, first_line(&message)),
                );
                tokio::select! {
                    biased;
                    _ = item.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(deps.options.retry_backoff * attempt) => {}
                }
            }
            result => return result,
        }
    }
}

async fn download_once(
    item: &TransferItem,
    deps: &PipelineDeps,
    metadata: &Metadata,
    path: &Path,
) -> Result<u64, TransferError> {
    let write_error = |e: std::io::Error| {
        TransferError::Transport(format!("Failed to write downloaded data: {}", e))
    };
    let mut file = File::create(path).await.map_err(write_error)?;

    let stream = tokio::select! {
        biased;
        _ = item.cancelled() => return Err(TransferError::Cancelled),
        stream = deps.fetcher.stream(item.url()) => stream,
    };
    let mut stream = stream?;

    let mut throttle = ProgressThrottle::new(deps.options.progress_interval);
    let mut done = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = item.cancelled() => return Err(TransferError::Cancelled),
            next = stream.next() => next,
        };
        match next {
            None => break,
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(chunk)) => {
                file.write_all(&chunk).await.map_err(write_error)?;
                done += chunk.len() as u64;
                if throttle.should_emit() {
                    let progress = Progress::new(done, metadata.content_length);
                    item.report(progress.percent(), progress.describe("Downloading"));
                }
            }
        }
    }
    file.flush().await.map_err(write_error)?;

    let progress = Progress::new(done, metadata.content_length);
    item.report(progress.percent(), progress.describe("Downloaded"));
    Ok(done)
}

async fn upload(
    item: &TransferItem,
    deps: &PipelineDeps,
    metadata: &Metadata,
    scratch: &ScratchFile,
    downloaded: u64,
) -> Result<RemoteFile, TransferError> {
    checkpoint(item)?;
    item.enter(TransferState::Uploading, "Creating download folder...");

    let folder = tokio::select! {
        biased;
        _ = item.cancelled() => return Err(TransferError::Cancelled),
        folder = deps.storage.get_or_create_folder(&deps.options.upload_folder) => folder,
    };
    checkpoint(item)?;
    let folder = folder.map_err(|e| TransferError::Upload(e.to_string()))?;

    let body = File::open(scratch.path())
        .await
        .map_err(|e| TransferError::Upload(format!("Failed to reopen download: {}", e)))?;
    item.report(Some(0.0), "Uploading...");

    let throttle = Mutex::new(ProgressThrottle::new(deps.options.progress_interval));
    let on_progress = |stored: u64| {
        if throttle.lock().unwrap().should_emit() {
            let progress = Progress::new(stored, downloaded);
            item.report(progress.percent(), progress.describe("Uploading"));
        }
    };
    let request = FileUpload {
        name: item.name(),
        content_type: &metadata.content_type,
        parent: &folder,
        body: Box::new(body),
    };

    let stored = tokio::select! {
        biased;
        _ = item.cancelled() => return Err(TransferError::Cancelled),
        stored = deps.storage.create_or_update_file(request, &on_progress) => stored,
    };
    checkpoint(item)?;
    let file = stored.map_err(|e| TransferError::Upload(e.to_string()))?;

    if metadata.content_length > 0 && file.final_size != metadata.content_length {
        return Err(TransferError::Upload(format!(
            "Upload failed at {} (Length: {})",
            file.final_size, metadata.content_length
        )));
    }
    Ok(file)
}
