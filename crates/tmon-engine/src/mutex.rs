use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Process-wide named locks. Actions sharing a mutex name never overlap, across targets.
#[derive(Debug, Default)]
pub struct MutexRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl MutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `name`, creating it on first use.
    pub fn handle(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits for the named lock; `None` names need no lock.
    pub async fn acquire(&self, name: Option<&str>) -> Option<OwnedMutexGuard<()>> {
        let name = name.map(str::trim).filter(|name| !name.is_empty())?;
        Some(self.handle(name).lock_owned().await)
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn same_name_shares_one_lock() {
        let registry = MutexRegistry::new();
        let first = registry.handle("deploy");
        let second = registry.handle("deploy");
        assert!(Arc::ptr_eq(&first, &second));
        registry.handle("other");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn holders_of_one_name_never_overlap() {
        let registry = Arc::new(MutexRegistry::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire(Some("svc")).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blank_names_do_not_lock() {
        let registry = MutexRegistry::new();
        assert!(registry.acquire(None).await.is_none());
        assert!(registry.acquire(Some("  ")).await.is_none());
        assert!(registry.is_empty());
    }
}
