//! Remote storage collaborator and the filesystem-backed implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub remote_id: String,
    pub remote_url: String,
    pub final_size: u64,
}

/// A file to create, or to replace if one with the same name exists in `parent`.
pub struct FileUpload<'a> {
    pub name: &'a str,
    pub content_type: &'a str,
    pub parent: &'a FolderHandle,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
}

/// Called with the total number of bytes stored so far.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// An authenticated handle to one session's remote storage.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn get_or_create_folder(&self, name: &str) -> Result<FolderHandle, StorageError>;

    async fn create_or_update_file(
        &self,
        upload: FileUpload<'_>,
        on_progress: ProgressFn<'_>,
    ) -> Result<RemoteFile, StorageError>;
}

/// Hands out the storage client belonging to a session.
pub trait StorageProvider: Send + Sync {
    fn client_for(&self, session_id: &str) -> Arc<dyn StorageClient>;
}

pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "download".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Stores each session's files under `<root>/<session>/` and serves them from
/// `<public_url>/storage/`.
pub struct LocalStorageProvider {
    root: PathBuf,
    public_url: String,
}

impl LocalStorageProvider {
    pub fn new(root: PathBuf, public_url: impl Into<String>) -> Self {
        Self {
            root,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StorageProvider for LocalStorageProvider {
    fn client_for(&self, session_id: &str) -> Arc<dyn StorageClient> {
        let dir_name = utf8_percent_encode(session_id, NON_ALPHANUMERIC).to_string();
        Arc::new(LocalStorage {
            root: self.root.join(&dir_name),
            url_base: format!("{}/storage/{}", self.public_url, encode_path(&dir_name)),
        })
    }
}

pub struct LocalStorage {
    root: PathBuf,
    url_base: String,
}

#[async_trait]
impl StorageClient for LocalStorage {
    async fn get_or_create_folder(&self, name: &str) -> Result<FolderHandle, StorageError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !valid {
            return Err(StorageError::Remote(format!("Invalid folder name '{}'", name)));
        }

        let dir = self.root.join(name);
        if !fs::try_exists(&dir).await? {
            info!("Creating storage folder: {:?}", dir);
            fs::create_dir_all(&dir).await?;
        }
        Ok(FolderHandle {
            id: name.to_string(),
        })
    }

    async fn create_or_update_file(
        &self,
        upload: FileUpload<'_>,
        on_progress: ProgressFn<'_>,
    ) -> Result<RemoteFile, StorageError> {
        let file_name = sanitize_file_name(upload.name);
        let dir = self.root.join(&upload.parent.id);
        let dest = dir.join(&file_name);
        // Concurrent uploads of the same name each get their own part file.
        let part = dir.join(format!(".{}.{}.part", file_name, Uuid::new_v4()));

        if fs::try_exists(&dest).await? {
            debug!("Updating existing file {:?} ({})", dest, upload.content_type);
        } else {
            debug!("Creating new file {:?} ({})", dest, upload.content_type);
        }

        let written = match write_part(&part, upload.body, on_progress).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                return Err(e);
            }
        };
        fs::rename(&part, &dest).await?;

        let remote_id = format!("{}/{}", upload.parent.id, file_name);
        Ok(RemoteFile {
            remote_url: format!("{}/{}", self.url_base, encode_path(&remote_id)),
            remote_id,
            final_size: written,
        })
    }
}

async fn write_part(
    part: &Path,
    body: Box<dyn AsyncRead + Send + Unpin>,
    on_progress: ProgressFn<'_>,
) -> Result<u64, StorageError> {
    let mut file = File::create(part).await?;
    let mut stream = ReaderStream::new(body);
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        on_progress(written);
    }
    file.flush().await?;
    Ok(written)
}
