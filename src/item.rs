//! One URL's journey through the relay pipeline.

use std::sync::Mutex;

use percent_encoding::percent_decode_str;
use serde::Serialize;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::TransferError;
use crate::storage::RemoteFile;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    FetchingMetadata,
    Downloading,
    Uploading,
    Stopping,
    Done,
    Stopped,
    Failed,
}

impl TransferState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Stopped | Self::Failed)
    }

    /// A pipeline task currently owns the item.
    pub const fn is_running(self) -> bool {
        matches!(
            self,
            Self::FetchingMetadata | Self::Downloading | Self::Uploading | Self::Stopping
        )
    }
}

/// Read-only copy of an item handed out to callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub url: String,
    pub name: String,
    pub state: TransferState,
    pub progress: Option<f64>,
    pub status: String,
    pub content_type: String,
    pub content_length: u64,
    pub remote_url: Option<String>,
    pub cancel_requested: bool,
    pub finished: bool,
}

#[derive(Clone, Debug)]
struct ItemStatus {
    state: TransferState,
    progress: Option<f64>,
    message: String,
    content_type: String,
    content_length: u64,
    remote_url: Option<String>,
}

/// Job record shared between its queue and the pipeline task running it.
///
/// Every mutable field lives behind one lock and is replaced as a unit, so a
/// reader never pairs a fresh message with a stale percentage. Terminal items
/// ignore all further writes.
#[derive(Debug)]
pub struct TransferItem {
    url: String,
    name: String,
    cancel: CancellationToken,
    status: Mutex<ItemStatus>,
}

impl TransferItem {
    /// `url` must already be validated and normalized.
    pub(crate) fn new(url: String) -> Self {
        let name = derive_name(&url);
        Self {
            url,
            name,
            cancel: CancellationToken::new(),
            status: Mutex::new(ItemStatus {
                state: TransferState::Pending,
                progress: Some(0.0),
                message: "Pending".to_string(),
                content_type: String::new(),
                content_length: 0,
                remote_url: None,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TransferState {
        self.status.lock().unwrap().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once `stop` has been requested for this item.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        let status = self.status.lock().unwrap().clone();
        TransferSnapshot {
            url: self.url.clone(),
            name: self.name.clone(),
            finished: status.state.is_terminal(),
            state: status.state,
            progress: status.progress,
            status: status.message,
            content_type: status.content_type,
            content_length: status.content_length,
            remote_url: status.remote_url,
            cancel_requested: self.cancel.is_cancelled(),
        }
    }

    /// Moves the item into a new pipeline stage.
    pub(crate) fn enter(&self, state: TransferState, message: impl Into<String>) {
        self.update(|status| {
            status.state = state;
            status.message = message.into();
        });
    }

    pub(crate) fn report(&self, progress: Option<f64>, message: impl Into<String>) {
        self.update(|status| {
            status.progress = progress;
            status.message = message.into();
        });
    }

    /// Records the probed headers. An unknown length makes progress indeterminate.
    pub(crate) fn set_metadata(&self, content_type: String, content_length: u64) {
        self.update(|status| {
            status.progress = (content_length > 0).then_some(0.0);
            status.message = format!(
                "Content type = '{}', Length = {} bytes",
                content_type, content_length
            );
            status.content_type = content_type;
            status.content_length = content_length;
        });
    }

    /// Signals cancellation. Returns false when the item was already terminal.
    pub(crate) fn request_stop(&self) -> bool {
        let mut status = self.status.lock().unwrap();
        if status.state.is_terminal() {
            return false;
        }
        self.cancel.cancel();
        if status.state != TransferState::Stopping {
            status.state = TransferState::Stopping;
            status.message = "Stopping...".to_string();
        }
        true
    }

    /// Resolves the final state. Only the first call has any effect.
    pub(crate) fn finish(&self, outcome: Result<RemoteFile, TransferError>) -> TransferState {
        let mut status = self.status.lock().unwrap();
        if status.state.is_terminal() {
            return status.state;
        }
        match outcome {
            Ok(file) => {
                status.state = TransferState::Done;
                status.progress = Some(100.0);
                status.message = "Done".to_string();
                status.remote_url = Some(file.remote_url);
            }
            Err(_) if self.cancel.is_cancelled() => {
                status.state = TransferState::Stopped;
                status.message = "Stopped".to_string();
            }
            Err(err) => {
                status.state = TransferState::Failed;
                status.message = err.status_line();
            }
        }
        status.state
    }

    fn update(&self, apply: impl FnOnce(&mut ItemStatus)) {
        let mut status = self.status.lock().unwrap();
        if status.state.is_terminal() || status.state == TransferState::Stopping {
            return;
        }
        apply(&mut status);
    }
}

/// Last path segment of the URL, ignoring query and fragment.
fn derive_name(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);
    let after_scheme = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);

    let mut segments = after_scheme.split('/');
    let host = segments.next().unwrap_or_default();
    let last = segments.filter(|s| !s.is_empty()).next_back();

    match last {
        Some(segment) => percent_decode_str(segment).decode_utf8_lossy().to_string(),
        None => host.to_string(),
    }
}
