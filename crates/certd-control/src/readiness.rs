//! Readiness gate shared by the Gateway and the Worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::cache::StatusCache;
use crate::queue::JobQueue;
use crate::store::CaStore;

/// Health flag a Worker clears when it can no longer sign.
#[derive(Debug, Clone)]
pub struct WorkerHealth {
    healthy: Arc<AtomicBool>,
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn mark_unhealthy(&self, reason: &str) {
        if self.healthy.swap(false, Ordering::SeqCst) {
            error!(reason, "Worker marked unhealthy; signing jobs are no longer claimed");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub database: bool,
    pub cache: bool,
    pub queue: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<bool>,
}

#[derive(Clone)]
pub struct Readiness {
    store: CaStore,
    cache: Arc<dyn StatusCache>,
    queue: Arc<dyn JobQueue>,
    worker: Option<WorkerHealth>,
}

impl Readiness {
    pub fn new(store: CaStore, cache: Arc<dyn StatusCache>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            cache,
            queue,
            worker: None,
        }
    }

    /// Also require the given worker to be healthy.
    pub fn with_worker(mut self, health: WorkerHealth) -> Self {
        self.worker = Some(health);
        self
    }

    pub async fn check(&self) -> ReadinessReport {
        let database = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Database not reachable: {}", e);
                false
            }
        };
        let cache = match self.cache.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Cache not reachable: {}", e);
                false
            }
        };
        let queue = match self.queue.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Queue not reachable: {}", e);
                false
            }
        };
        let worker = self.worker.as_ref().map(WorkerHealth::is_healthy);

        ReadinessReport {
            ready: database && cache && queue && worker.unwrap_or(true),
            database,
            cache,
            queue,
            worker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStatusCache;
    use crate::queue::{DbJobQueue, RetryPolicy};

    #[tokio::test]
    async fn test_unhealthy_worker_is_not_ready() {
        let db = certd_db::connect("sqlite::memory:").await.unwrap();
        certd_db::migrate(&db).await.unwrap();
        let health = WorkerHealth::new();
        let readiness = Readiness::new(
            CaStore::new(db.clone()),
            Arc::new(MemoryStatusCache::new()),
            Arc::new(DbJobQueue::new(db, RetryPolicy::default())),
        )
        .with_worker(health.clone());

        assert!(readiness.check().await.ready);
        health.mark_unhealthy("key gone");
        let report = readiness.check().await;
        assert!(!report.ready);
        assert_eq!(report.worker, Some(false));
        assert!(report.database);
    }
}
