//! Session id → queue map owned by the server.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::error::QueueError;
use crate::fetcher::HttpFetcher;
use crate::item::TransferSnapshot;
use crate::pipeline::PipelineDeps;
use crate::queue::{Queue, QueueOptions};
use crate::storage::StorageProvider;

struct RegistryInner {
    queues: Mutex<HashMap<String, Queue>>,
    fetcher: Arc<dyn HttpFetcher>,
    storage: Arc<dyn StorageProvider>,
    options: QueueOptions,
}

/// Creates queues on first use and tears them down on logout. Cloning shares
/// the registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        options: QueueOptions,
        fetcher: Arc<dyn HttpFetcher>,
        storage: Arc<dyn StorageProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                queues: Mutex::new(HashMap::new()),
                fetcher,
                storage,
                options,
            }),
        }
    }

    /// Returns the session's queue, creating it if needed.
    pub fn queue(&self, session_id: &str) -> Queue {
        let mut queues = self.inner.queues.lock().unwrap();
        if let Some(queue) = queues.get(session_id) {
            return queue.clone();
        }

        let deps = PipelineDeps {
            fetcher: Arc::clone(&self.inner.fetcher),
            storage: self.inner.storage.client_for(session_id),
            options: Arc::new(self.inner.options.pipeline.clone()),
        };
        let queue = Queue::new(session_id, &self.inner.options, deps);
        queues.insert(session_id.to_string(), queue.clone());
        info!("Created queue for session {}", session_id);
        queue
    }

    pub fn get(&self, session_id: &str) -> Option<Queue> {
        self.inner.queues.lock().unwrap().get(session_id).cloned()
    }

    pub fn enqueue(&self, session_id: &str, url: &str) -> Result<TransferSnapshot, QueueError> {
        self.queue(session_id).enqueue(url)
    }

    /// Items of the session, most recent first; empty for unknown sessions.
    pub fn list(&self, session_id: &str) -> Vec<TransferSnapshot> {
        self.get(session_id)
            .map(|queue| queue.list())
            .unwrap_or_default()
    }

    pub fn stop(&self, session_id: &str, url: &str) -> bool {
        self.get(session_id).is_some_and(|queue| queue.stop(url))
    }

    pub fn restart(&self, session_id: &str, url: &str) -> bool {
        self.get(session_id).is_some_and(|queue| queue.restart(url))
    }

    pub fn remove(&self, session_id: &str, url: &str) -> bool {
        self.get(session_id).is_some_and(|queue| queue.remove(url))
    }

    /// Drops the session's queue after signalling all of its transfers.
    pub fn logout_session(&self, session_id: &str) -> bool {
        let removed = self.inner.queues.lock().unwrap().remove(session_id);
        match removed {
            Some(queue) => {
                queue.shutdown();
                info!("Logged out session {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn all_session_ids(&self) -> BTreeSet<String> {
        self.inner.queues.lock().unwrap().keys().cloned().collect()
    }

    /// Teardown hook for server shutdown.
    pub fn shutdown(&self) {
        let queues: Vec<Queue> = {
            let mut queues = self.inner.queues.lock().unwrap();
            queues.drain().map(|(_, queue)| queue).collect()
        };
        for queue in &queues {
            queue.shutdown();
        }
        info!("Shut down {} session queue(s)", queues.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::TransferState;
    use crate::testing::{FakeFetcher, FakeProvider, FakeStorage, test_options, wait_for};

    fn registry(fetcher: FakeFetcher) -> SessionRegistry {
        SessionRegistry::new(
            test_options(1),
            Arc::new(fetcher),
            Arc::new(FakeProvider(Arc::new(FakeStorage::default()))),
        )
    }

    #[tokio::test]
    async fn test_queues_are_created_per_session() {
        let registry = registry(FakeFetcher::new());
        assert!(registry.all_session_ids().is_empty());

        registry.enqueue("alice", "http://example.com/a.jpg").unwrap();
        registry.enqueue("bob", "http://example.com/a.jpg").unwrap();
        registry.enqueue("bob", "http://example.com/b.jpg").unwrap();

        assert_eq!(
            registry.all_session_ids().into_iter().collect::<Vec<_>>(),
            vec!["alice", "bob"]
        );
        assert_eq!(registry.list("alice").len(), 1);
        assert_eq!(registry.list("bob").len(), 2);
        assert_eq!(registry.queue("alice").session_id(), "alice");
    }

    #[tokio::test]
    async fn test_unknown_session_creates_nothing() {
        let registry = registry(FakeFetcher::new());
        assert!(registry.list("ghost").is_empty());
        assert!(!registry.stop("ghost", "http://example.com/a.jpg"));
        assert!(!registry.restart("ghost", "http://example.com/a.jpg"));
        assert!(!registry.remove("ghost", "http://example.com/a.jpg"));
        assert!(!registry.logout_session("ghost"));
        assert!(registry.all_session_ids().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_through_registry() {
        let registry = registry(FakeFetcher::new());
        assert!(registry.enqueue("alice", "not-a-url").is_err());
        assert!(registry.list("alice").is_empty());
    }

    #[tokio::test]
    async fn test_logout_stops_running_items() {
        let (fetcher, _gate) = FakeFetcher::gated(0);
        let registry = registry(fetcher);
        let url = "http://example.com/a.jpg";

        registry.enqueue("alice", url).unwrap();
        registry.enqueue("alice", "http://example.com/b.jpg").unwrap();
        let queue = registry.queue("alice");
        wait_for(&queue, url, |s| s.state.is_running()).await;

        assert!(registry.logout_session("alice"));
        assert!(registry.get("alice").is_none());
        assert!(queue.is_shut_down());

        // The running task still finishes against its own item.
        let stopped = wait_for(&queue, url, |s| s.finished).await;
        assert_eq!(stopped.state, TransferState::Stopped);
        assert_eq!(
            queue.get("http://example.com/b.jpg").unwrap().state,
            TransferState::Stopped
        );
    }

    #[tokio::test]
    async fn test_enqueue_on_logged_out_queue_is_rejected() {
        let registry = registry(FakeFetcher::new());
        let stale = registry.queue("alice");
        assert!(registry.logout_session("alice"));

        assert_eq!(
            stale.enqueue("http://example.com/a.jpg"),
            Err(QueueError::Closed)
        );
        assert!(stale.is_empty());

        // A new request for the session gets a fresh queue.
        registry.enqueue("alice", "http://example.com/a.jpg").unwrap();
        assert_eq!(registry.list("alice").len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_clears_all_sessions() {
        let registry = registry(FakeFetcher::new());
        registry.queue("alice");
        registry.queue("bob");
        registry.shutdown();
        assert!(registry.all_session_ids().is_empty());
    }
}
