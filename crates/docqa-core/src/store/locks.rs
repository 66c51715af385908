//! Per-document write serialization.
//!
//! Writers for the same document id queue on a shared async mutex; writers
//! for different documents and all readers proceed independently. Guards
//! are owned, so a cancelled write future releases its lock on drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct DocumentLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to `key`, a document id or, for
    /// the pipeline's supersede step, a document source.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds or waits on.
            map.retain(|id, m| id == key || Arc::strong_count(m) > 1);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of tracked documents.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_document_serializes() {
        let locks = Arc::new(DocumentLocks::new());
        let guard = locks.lock("doc-a").await;

        let l2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l2.lock("doc-a").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_documents_independent() {
        let locks = DocumentLocks::new();
        let _a = locks.lock("doc-a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("doc-b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_pruned() {
        let locks = DocumentLocks::new();
        drop(locks.lock("doc-a").await);
        drop(locks.lock("doc-b").await);
        drop(locks.lock("doc-c").await);
        assert_eq!(locks.len(), 1);
    }
}
