//! In-process store backend with full session semantics, used by the test
//! suite and suitable for single-node deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, watch};

use crate::error::{FleetError, Result};
use crate::store::{EphemeralEntry, KvStore, Session};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    create_revision: i64,
    session: Option<i64>,
}

struct SessionState {
    expired_tx: watch::Sender<bool>,
    expired_rx: watch::Receiver<bool>,
}

#[derive(Default)]
struct Inner {
    revision: i64,
    next_session: i64,
    data: BTreeMap<String, Entry>,
    sessions: HashMap<i64, SessionState>,
}

/// In-memory `KvStore`. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    changed: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate session expiry as the store would decide it after a
    /// partition. Identical to revocation: owned keys disappear and the
    /// expiry signal fires.
    pub async fn expire_session(&self, session_id: i64) -> Result<()> {
        self.revoke_session(session_id).await
    }

    fn remove_session_keys(inner: &mut Inner, session_id: i64) {
        inner
            .data
            .retain(|_, entry| entry.session != Some(session_id));
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner.revision += 1;
        let revision = inner.revision;
        let create_revision = inner
            .data
            .get(key)
            .map(|e| e.create_revision)
            .unwrap_or(revision);
        inner.data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                create_revision,
                session: None,
            },
        );
        drop(inner);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().expect("store mutex");
        Ok(inner.data.get(key).map(|e| e.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let inner = self.inner.lock().expect("store mutex");
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner.data.remove(key);
        drop(inner);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner.data.retain(|k, _| !k.starts_with(prefix));
        drop(inner);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn grant_session(&self, _ttl: Duration) -> Result<Session> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner.next_session += 1;
        let id = inner.next_session;
        let (expired_tx, expired_rx) = watch::channel(false);
        inner.sessions.insert(
            id,
            SessionState {
                expired_tx,
                expired_rx: expired_rx.clone(),
            },
        );
        Ok(Session {
            id,
            expired: expired_rx,
        })
    }

    async fn revoke_session(&self, session_id: i64) -> Result<()> {
        let state = {
            let mut inner = self.inner.lock().expect("store mutex");
            let state = inner.sessions.remove(&session_id);
            if state.is_some() {
                Self::remove_session_keys(&mut inner, session_id);
            }
            state
        };
        match state {
            Some(state) => {
                let _ = state.expired_tx.send(true);
                drop(state.expired_rx);
                self.changed.notify_waiters();
                Ok(())
            }
            None => Err(FleetError::not_found(format!(
                "session {session_id} does not exist"
            ))),
        }
    }

    async fn create_ephemeral(
        &self,
        prefix: &str,
        session_id: i64,
        value: &str,
    ) -> Result<(String, i64)> {
        let mut inner = self.inner.lock().expect("store mutex");
        if !inner.sessions.contains_key(&session_id) {
            return Err(FleetError::store(format!(
                "session {session_id} is not alive"
            )));
        }
        inner.revision += 1;
        let revision = inner.revision;
        let key = format!("{prefix}/{session_id:x}");
        inner.data.insert(
            key.clone(),
            Entry {
                value: value.to_string(),
                create_revision: revision,
                session: Some(session_id),
            },
        );
        drop(inner);
        self.changed.notify_waiters();
        Ok((key, revision))
    }

    async fn list_ephemeral(&self, prefix: &str) -> Result<Vec<EphemeralEntry>> {
        let inner = self.inner.lock().expect("store mutex");
        let child_prefix = format!("{prefix}/");
        Ok(inner
            .data
            .range(child_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&child_prefix))
            .filter_map(|(k, e)| {
                e.session.map(|session| EphemeralEntry {
                    key: k.clone(),
                    create_revision: e.create_revision,
                    session,
                })
            })
            .collect())
    }

    async fn wait_deleted(&self, key: &str) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            {
                let inner = self.inner.lock().expect("store mutex");
                if !inner.data.contains_key(key) {
                    return Ok(());
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let store = MemoryStore::new();
        store.put("a/k", "v1").await.unwrap();
        assert_eq!(store.get("a/k").await.unwrap(), Some("v1".to_string()));

        store.delete("a/k").await.unwrap();
        assert_eq!(store.get("a/k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prefix_scan_and_delete() {
        let store = MemoryStore::new();
        store.put("certs/a.com", "1").await.unwrap();
        store.put("certs/b.com", "2").await.unwrap();
        store.put("other/x", "3").await.unwrap();

        let map = store.get_prefix("certs/").await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["certs/a.com"], "1");

        store.delete_prefix("certs/").await.unwrap();
        assert!(store.get_prefix("certs/").await.unwrap().is_empty());
        assert_eq!(store.get("other/x").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_session_revocation_removes_owned_keys() {
        let store = MemoryStore::new();
        let session = store
            .grant_session(Duration::from_secs(30))
            .await
            .unwrap();
        let (key, rev) = store
            .create_ephemeral("locks/test", session.id, "owner")
            .await
            .unwrap();
        assert!(rev > 0);
        assert!(store.get(&key).await.unwrap().is_some());

        let mut expired = session.expired.clone();
        store.revoke_session(session.id).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        expired.changed().await.unwrap();
        assert!(*expired.borrow());
    }

    #[tokio::test]
    async fn test_wait_deleted_wakes_on_delete() {
        let store = MemoryStore::new();
        store.put("locks/x/1", "v").await.unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_deleted("locks/x/1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.delete("locks/x/1").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_ephemeral_ordering() {
        let store = MemoryStore::new();
        let s1 = store.grant_session(Duration::from_secs(30)).await.unwrap();
        let s2 = store.grant_session(Duration::from_secs(30)).await.unwrap();

        let (_, r1) = store
            .create_ephemeral("locks/m", s1.id, "a")
            .await
            .unwrap();
        let (_, r2) = store
            .create_ephemeral("locks/m", s2.id, "b")
            .await
            .unwrap();
        assert!(r1 < r2);

        let entries = store.list_ephemeral("locks/m").await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
