//! Shared cache of open knowledge base handles

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::KnowledgeBase;
use crate::error::{PipelineError, PipelineResult};

/// Identifies one knowledge base: owners are bucketed a thousand to a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KnowledgeBaseKey {
    pub owner_id: u64,
    pub kb_id: u64,
}

impl KnowledgeBaseKey {
    pub fn new(owner_id: u64, kb_id: u64) -> Self {
        Self { owner_id, kb_id }
    }

    pub fn database(&self) -> String {
        format!("group_{}", self.owner_id / 1000)
    }

    pub fn collection(&self) -> String {
        format!("kb_{}", self.kb_id)
    }
}

impl fmt::Display for KnowledgeBaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.database(), self.collection())
    }
}

#[async_trait]
pub trait KnowledgeBaseFactory: Send + Sync {
    async fn open(&self, key: &KnowledgeBaseKey) -> Result<Arc<dyn KnowledgeBase>>;
}

struct Entry {
    handle: Arc<dyn KnowledgeBase>,
    last_used: Mutex<Instant>,
}

impl Entry {
    fn lease(&self) -> Arc<dyn KnowledgeBase> {
        *self.last_used.lock() = Instant::now();
        Arc::clone(&self.handle)
    }

    /// Only the registry holds the handle and it has sat unused past `ttl`.
    fn is_idle(&self, ttl: Duration) -> bool {
        Arc::strong_count(&self.handle) == 1 && self.last_used.lock().elapsed() >= ttl
    }
}

/// Creates handles on first use, hands out leases, and releases handles
/// nobody has leased for `idle_timeout`.
pub struct KnowledgeBaseRegistry {
    entries: DashMap<KnowledgeBaseKey, Entry>,
    create_lock: tokio::sync::Mutex<()>,
    factory: Arc<dyn KnowledgeBaseFactory>,
    idle_timeout: Duration,
}

impl KnowledgeBaseRegistry {
    pub fn new(factory: Arc<dyn KnowledgeBaseFactory>, idle_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
            factory,
            idle_timeout,
        }
    }

    pub async fn lease(&self, key: KnowledgeBaseKey) -> PipelineResult<Arc<dyn KnowledgeBase>> {
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.lease());
        }

        let _guard = self.create_lock.lock().await;
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.lease());
        }

        let handle = self.factory.open(&key).await.map_err(|e| {
            tracing::error!(kb = %key, error = %e, "Failed to open knowledge base");
            PipelineError::KnowledgeBase(format!("{}: {}", key, e))
        })?;
        tracing::info!(kb = %key, "Created knowledge base handle");

        let entry = Entry {
            handle,
            last_used: Mutex::new(Instant::now()),
        };
        let leased = entry.lease();
        self.entries.insert(key, entry);
        Ok(leased)
    }

    /// Drop handles that are unleased and idle. Returns how many were released.
    pub async fn evict_idle(&self) -> usize {
        let candidates: Vec<KnowledgeBaseKey> = self
            .entries
            .iter()
            .filter(|e| e.value().is_idle(self.idle_timeout))
            .map(|e| *e.key())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            // Re-check under the shard lock; a lease may have landed in between.
            if let Some((_, entry)) = self
                .entries
                .remove_if(&key, |_, e| e.is_idle(self.idle_timeout))
            {
                entry.handle.close().await;
                tracing::debug!(kb = %key, "Evicted idle knowledge base handle");
                evicted += 1;
            }
        }
        evicted
    }

    /// Periodically run [`evict_idle`](Self::evict_idle) until `cancel` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle().await;
                        if evicted > 0 {
                            tracing::info!(evicted, remaining = registry.len(), "Knowledge base reaper pass");
                        }
                    }
                }
            }
        })
    }

    pub async fn close_all(&self) {
        let _guard = self.create_lock.lock().await;
        let keys: Vec<KnowledgeBaseKey> = self.entries.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.handle.close().await;
            }
        }
        tracing::info!("Closed all knowledge base handles");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PassageHit;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullKb;

    #[async_trait]
    impl KnowledgeBase for NullKb {
        async fn vector_search(&self, _query: &str, _k: usize) -> Result<Vec<PassageHit>> {
            Ok(Vec::new())
        }
        async fn lexical_search(&self, _e: &str, _l: usize, _f: &[String]) -> Result<Vec<PassageHit>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl KnowledgeBaseFactory for CountingFactory {
        async fn open(&self, key: &KnowledgeBaseKey) -> Result<Arc<dyn KnowledgeBase>> {
            if key.kb_id == 0 {
                anyhow::bail!("no such collection");
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Arc::new(NullKb))
        }
    }

    #[test]
    fn test_key_naming() {
        let key = KnowledgeBaseKey::new(2345, 7);
        assert_eq!(key.database(), "group_2");
        assert_eq!(key.collection(), "kb_7");
        assert_eq!(key.to_string(), "group_2_kb_7");
    }

    #[tokio::test]
    async fn test_concurrent_lease_opens_once() {
        let factory = Arc::new(CountingFactory::default());
        let registry = Arc::new(KnowledgeBaseRegistry::new(factory.clone(), Duration::from_secs(60)));
        let key = KnowledgeBaseKey::new(1, 1);

        let leases = futures::future::join_all((0..8).map(|_| {
            let registry = Arc::clone(&registry);
            async move { registry.lease(key).await }
        }))
        .await;

        assert!(leases.iter().all(|l| l.is_ok()));
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_typed() {
        let registry = KnowledgeBaseRegistry::new(Arc::new(CountingFactory::default()), Duration::from_secs(60));
        let err = registry.lease(KnowledgeBaseKey::new(1, 0)).await.err().unwrap();
        assert!(matches!(err, PipelineError::KnowledgeBase(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_evict_skips_leased_handles() {
        let registry = KnowledgeBaseRegistry::new(Arc::new(CountingFactory::default()), Duration::ZERO);
        let held = registry.lease(KnowledgeBaseKey::new(1, 1)).await.unwrap();
        let _ = registry.lease(KnowledgeBaseKey::new(1, 2)).await.unwrap();

        assert_eq!(registry.evict_idle().await, 1);
        assert_eq!(registry.len(), 1);

        drop(held);
        assert_eq!(registry.evict_idle().await, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = KnowledgeBaseRegistry::new(Arc::new(CountingFactory::default()), Duration::from_secs(60));
        registry.lease(KnowledgeBaseKey::new(1, 1)).await.unwrap();
        registry.lease(KnowledgeBaseKey::new(5000, 1)).await.unwrap();
        registry.close_all().await;
        assert!(registry.is_empty());
    }
}
