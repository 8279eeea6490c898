//! Per-session transfer queue.
//!
//! Items wait in a FIFO until the dispatch loop admits them under the
//! concurrency cap. Each admitted item runs its whole pipeline in its own
//! task, holding a [`RunningSlot`] that gives the slot back however the task
//! ends. The item map, the pending list and the running count share one
//! lock; item fields have their own.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::Url;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{QueueError, TransferError};
use crate::item::{TransferItem, TransferSnapshot};
use crate::pipeline::{self, PipelineDeps, PipelineOptions};

pub const DEFAULT_CONCURRENCY: usize = 3;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub concurrency_limit: usize,
    /// Upper bound on how long the dispatcher sleeps without a wake-up.
    pub dispatch_tick: Duration,
    pub pipeline: PipelineOptions,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY,
            dispatch_tick: Duration::from_millis(250),
            pipeline: PipelineOptions::default(),
        }
    }
}

/// Validates an absolute http(s) URL and strips one trailing slash.
pub fn normalize_url(raw: &str) -> Result<String, QueueError> {
    let invalid = || QueueError::InvalidUrl(raw.to_string());
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return Err(invalid());
    }

    let parsed = Url::parse(trimmed).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid());
    }

    // IP literals have no domain and are rejected along with single-label hosts.
    let host = parsed.domain().ok_or_else(invalid)?;
    let labels: Vec<&str> = host.trim_end_matches('.').split('.').collect();
    let tld = labels.last().copied().unwrap_or_default();
    let valid_host = labels.len() >= 2
        && labels.iter().all(|label| !label.is_empty())
        && (2..=63).contains(&tld.len())
        && tld.chars().all(|c| c.is_ascii_alphabetic());
    if !valid_host {
        return Err(invalid());
    }

    Ok(trimmed.strip_suffix('/').unwrap_or(trimmed).to_string())
}

fn lookup_key(url: &str) -> &str {
    let url = url.trim();
    url.strip_suffix('/').unwrap_or(url)
}

#[derive(Default)]
struct QueueState {
    items: IndexMap<String, Arc<TransferItem>>,
    pending: VecDeque<Arc<TransferItem>>,
    running: usize,
}

impl QueueState {
    fn insert(&mut self, url: String) -> Arc<TransferItem> {
        let item = Arc::new(TransferItem::new(url.clone()));
        self.items.insert(url, Arc::clone(&item));
        self.pending.push_back(Arc::clone(&item));
        item
    }

    /// Takes `item` out of the pending list if it has not been admitted yet.
    fn withdraw(&mut self, item: &Arc<TransferItem>) -> bool {
        match self.pending.iter().position(|p| Arc::ptr_eq(p, item)) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }
}

struct QueueInner {
    session_id: String,
    concurrency_limit: usize,
    deps: PipelineDeps,
    state: Mutex<QueueState>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

/// Returns its admission slot to the queue when the pipeline task ends,
/// including on panic.
struct RunningSlot {
    queue: Arc<QueueInner>,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        {
            let mut state = self.queue.state.lock().unwrap();
            state.running = state.running.saturating_sub(1);
        }
        self.queue.wake.notify_one();
    }
}

impl QueueInner {
    fn admit(self: &Arc<Self>) {
        let admitted = {
            let mut state = self.state.lock().unwrap();
            let mut admitted = Vec::new();
            while state.running < self.concurrency_limit {
                let Some(item) = state.pending.pop_front() else {
                    break;
                };
                state.running += 1;
                admitted.push(item);
            }
            admitted
        };

        for item in admitted {
            debug!("[{}] Admitting {}", self.session_id, item.url());
            let slot = RunningSlot {
                queue: Arc::clone(self),
            };
            let deps = self.deps.clone();
            tokio::spawn(async move {
                let _slot = slot;
                pipeline::run(item, deps).await;
            });
        }
    }
}

/// Bounded-concurrency scheduler for one session. Cloning shares the queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    /// Creates the queue and spawns its dispatch loop on the current runtime.
    pub fn new(session_id: impl Into<String>, options: &QueueOptions, deps: PipelineDeps) -> Self {
        let inner = Arc::new(QueueInner {
            session_id: session_id.into(),
            concurrency_limit: options.concurrency_limit.max(1),
            deps,
            state: Mutex::new(QueueState::default()),
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            Arc::clone(&inner.wake),
            inner.shutdown.clone(),
            options.dispatch_tick,
        ));

        Self { inner }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn concurrency_limit(&self) -> usize {
        self.inner.concurrency_limit
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().unwrap().running
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `url` to the queue, or returns the existing item for it. Fails
    /// with [`QueueError::Closed`] once the queue has been shut down.
    pub fn enqueue(&self, url: &str) -> Result<TransferSnapshot, QueueError> {
        let url = normalize_url(url)?;
        let snapshot = {
            let mut state = self.inner.state.lock().unwrap();
            if self.inner.shutdown.is_cancelled() {
                return Err(QueueError::Closed);
            }
            if let Some(existing) = state.items.get(&url) {
                return Ok(existing.snapshot());
            }
            state.insert(url).snapshot()
        };
        info!("[{}] Queued {}", self.inner.session_id, snapshot.url);
        self.inner.wake.notify_one();
        Ok(snapshot)
    }

    pub fn get(&self, url: &str) -> Option<TransferSnapshot> {
        let state = self.inner.state.lock().unwrap();
        state.items.get(lookup_key(url)).map(|item| item.snapshot())
    }

    /// Snapshots of every item, most recently added first.
    pub fn list(&self) -> Vec<TransferSnapshot> {
        let state = self.inner.state.lock().unwrap();
        state.items.values().rev().map(|item| item.snapshot()).collect()
    }

    /// Requests cancellation. Never waits for the pipeline to wind down.
    pub fn stop(&self, url: &str) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let Some(item) = state.items.get(lookup_key(url)).cloned() else {
            return false;
        };

        if state.withdraw(&item) {
            item.request_stop();
            item.finish(Err(TransferError::Cancelled));
        } else if item.request_stop() {
            info!("[{}] Stopping {}", self.inner.session_id, item.url());
        }
        true
    }

    /// Replaces a finished item with a fresh pending one for the same URL.
    pub fn restart(&self, url: &str) -> bool {
        let key = lookup_key(url);
        let item = {
            let mut state = self.inner.state.lock().unwrap();
            match state.items.get(key) {
                Some(item) if item.state().is_terminal() => {}
                _ => return false,
            }
            state.items.shift_remove(key);
            state.insert(key.to_string())
        };
        info!("[{}] Restarting {}", self.inner.session_id, item.url());
        self.inner.wake.notify_one();
        true
    }

    /// Deletes an item, stopping it first if it is still in flight.
    pub fn remove(&self, url: &str) -> bool {
        let (item, withdrawn) = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(item) = state.items.shift_remove(lookup_key(url)) else {
                return false;
            };
            let withdrawn = state.withdraw(&item);
            (item, withdrawn)
        };

        if item.request_stop() {
            debug!("[{}] Removed {} while in flight", self.inner.session_id, item.url());
        }
        if withdrawn {
            item.finish(Err(TransferError::Cancelled));
        }
        true
    }

    /// Cancels every item and stops the dispatch loop. Running tasks finish
    /// on their own.
    pub fn shutdown(&self) {
        let (pending, items) = {
            let mut state = self.inner.state.lock().unwrap();
            // Cancelled under the lock so no enqueue can slip in after the drain.
            self.inner.shutdown.cancel();
            let pending: Vec<_> = state.pending.drain(..).collect();
            let items: Vec<_> = state.items.values().cloned().collect();
            (pending, items)
        };

        for item in &pending {
            item.request_stop();
            item.finish(Err(TransferError::Cancelled));
        }
        for item in &items {
            item.request_stop();
        }
        info!(
            "[{}] Queue shut down ({} pending dropped)",
            self.inner.session_id,
            pending.len()
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

async fn dispatch_loop(
    queue: Weak<QueueInner>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    tick: Duration,
) {
    loop {
        match queue.upgrade() {
            Some(inner) => inner.admit(),
            None => break,
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(tick) => {}
        }
    }
    debug!("Dispatch loop finished");
}
