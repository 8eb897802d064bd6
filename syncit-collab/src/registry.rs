//! Registry of live editing sessions, keyed by file id.
//!
//! Each id maps to a slot that is initialised at most once. Racing
//! `get_or_create` callers share the slot, so exactly one loader runs and
//! every caller observes the same `Arc<Session>`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};

use crate::session::{FileId, Session};

type Slot = Arc<OnceCell<Arc<Session>>>;

/// Concurrent map of file id → session.
#[derive(Default)]
pub struct SessionRegistry {
    slots: RwLock<HashMap<FileId, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `id`, creating it from `supply` if absent.
    ///
    /// `supply` is only awaited when no session exists yet. If it fails the
    /// error goes back to this caller and a later caller may try again.
    pub async fn get_or_create<F, Fut, E>(&self, id: FileId, supply: F) -> Result<Arc<Session>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let slot = self.slot(id).await;
        let result = slot
            .get_or_try_init(|| async move {
                let content = supply().await?;
                log::debug!("Session created for file {id} ({} bytes)", content.len());
                Ok::<_, E>(Arc::new(Session::new(id, content)))
            })
            .await
            .cloned();

        if result.is_err() {
            self.discard_failed(id, slot).await;
        }
        result
    }

    /// Like [`get_or_create`](Self::get_or_create) with a ready-made seed.
    pub async fn get_or_seed(&self, id: FileId, content: String) -> Arc<Session> {
        match self
            .get_or_create(id, || async move { Ok::<_, Infallible>(content) })
            .await
        {
            Ok(session) => session,
            Err(never) => match never {},
        }
    }

    pub async fn get(&self, id: FileId) -> Option<Arc<Session>> {
        let slots = self.slots.read().await;
        slots.get(&id).and_then(|slot| slot.get().cloned())
    }

    /// Remove the session for `id`, if one exists.
    pub async fn remove(&self, id: FileId) -> Option<Arc<Session>> {
        let mut slots = self.slots.write().await;
        // A slot still being initialised has no session yet; its creator
        // would otherwise install into an orphan.
        if slots.get(&id).is_some_and(|slot| slot.initialized()) {
            return slots.remove(&id).and_then(|slot| slot.get().cloned());
        }
        None
    }

    /// Remove `session` only if it is still the registered instance for its id.
    pub async fn remove_session(&self, session: &Arc<Session>) -> bool {
        let id = session.id();
        let mut slots = self.slots.write().await;
        let current = slots.get(&id).and_then(|slot| slot.get());
        if current.is_some_and(|s| Arc::ptr_eq(s, session)) {
            slots.remove(&id);
            return true;
        }
        false
    }

    /// Point-in-time copy of every live session.
    pub async fn list_all(&self) -> Vec<Arc<Session>> {
        let slots = self.slots.read().await;
        slots.values().filter_map(|slot| slot.get().cloned()).collect()
    }

    pub async fn len(&self) -> usize {
        let slots = self.slots.read().await;
        slots.values().filter(|slot| slot.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop a slot whose loader failed once no other caller holds it.
    ///
    /// Every failed caller releases its handle under the write lock, so the
    /// last one out sees only the map's reference and removes the slot.
    async fn discard_failed(&self, id: FileId, slot: Slot) {
        let mut slots = self.slots.write().await;
        drop(slot);
        if slots
            .get(&id)
            .is_some_and(|s| !s.initialized() && Arc::strong_count(s) == 1)
        {
            slots.remove(&id);
        }
    }

    async fn slot(&self, id: FileId) -> Slot {
        // Fast path: read lock
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(&id) {
                return slot.clone();
            }
        }

        let mut slots = self.slots.write().await;
        slots
            .entry(id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_get_or_create_returns_same_instance() {
        let registry = SessionRegistry::new();

        let a = registry.get_or_seed(FileId(1), "a".into()).await;
        let b = registry.get_or_seed(FileId(1), "b".into()).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.snapshot().await, "a");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_supplier_skipped_when_present() {
        let registry = SessionRegistry::new();
        registry.get_or_seed(FileId(1), "first".into()).await;

        let calls = AtomicUsize::new(0);
        let session = registry
            .get_or_create(FileId(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>("second".to_string())
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.snapshot().await, "first");
    }

    #[tokio::test]
    async fn test_failed_supplier_leaves_no_session() {
        let registry = SessionRegistry::new();

        let result = registry
            .get_or_create(FileId(9), || async { Err::<String, _>("load failed") })
            .await;
        assert_eq!(result.unwrap_err(), "load failed");
        assert!(registry.get(FileId(9)).await.is_none());
        assert!(registry.is_empty().await);
        assert!(registry.slots.read().await.is_empty());

        let retry = registry
            .get_or_create(FileId(9), || async { Ok::<_, &str>("loaded".to_string()) })
            .await
            .unwrap();
        assert_eq!(retry.snapshot().await, "loaded");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_loads_do_not_accumulate_slots() {
        let registry = Arc::new(SessionRegistry::new());

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .get_or_create(FileId(i % 8), || async { Err::<String, _>("offline") })
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_err());
        }

        assert!(registry.slots.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_does_not_create() {
        let registry = SessionRegistry::new();
        assert!(registry.get(FileId(5)).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let registry = SessionRegistry::new();
        assert!(registry.remove(FileId(404)).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_then_recreate() {
        let registry = SessionRegistry::new();
        let first = registry.get_or_seed(FileId(2), "old".into()).await;

        let removed = registry.remove(FileId(2)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &removed));
        assert!(registry.get(FileId(2)).await.is_none());

        let second = registry.get_or_seed(FileId(2), "new".into()).await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.snapshot().await, "new");
    }

    #[tokio::test]
    async fn test_remove_session_ignores_successor() {
        let registry = SessionRegistry::new();
        let stale = registry.get_or_seed(FileId(3), "v1".into()).await;
        registry.remove(FileId(3)).await;
        let fresh = registry.get_or_seed(FileId(3), "v2".into()).await;

        assert!(!registry.remove_session(&stale).await);
        assert!(registry.get(FileId(3)).await.is_some());

        assert!(registry.remove_session(&fresh).await);
        assert!(registry.get(FileId(3)).await.is_none());
    }

    #[tokio::test]
    async fn test_list_all_is_a_snapshot() {
        let registry = SessionRegistry::new();
        registry.get_or_seed(FileId(1), String::new()).await;
        registry.get_or_seed(FileId(2), String::new()).await;

        let listed = registry.list_all().await;
        registry.remove(FileId(1)).await;
        registry.get_or_seed(FileId(3), String::new()).await;

        let mut ids: Vec<FileId> = listed.iter().map(|s| s.id()).collect();
        ids.sort();
        assert_eq!(ids, vec![FileId(1), FileId(2)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_single_instance() {
        let registry = Arc::new(SessionRegistry::new());
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            let loads = loads.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_or_create(FileId(77), || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok::<_, ()>(format!("seed-{i}"))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    }
}
