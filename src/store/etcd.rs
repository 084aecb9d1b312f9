//! etcd-backed store. Sessions map onto etcd leases; a background
//! keep-alive task per session fires the expiry signal when the lease can
//! no longer be refreshed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions,
};
use tokio::sync::{Mutex, watch};

use crate::error::{FleetError, Result};
use crate::store::{EphemeralEntry, KvStore, Session};

fn store_err(e: etcd_client::Error) -> FleetError {
    FleetError::store(e.to_string())
}

/// `KvStore` backed by an etcd cluster
#[derive(Clone)]
pub struct EtcdStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdStore {
    /// Connect to the given endpoints
    pub async fn connect(endpoints: Vec<String>, connect_timeout: Duration) -> Result<Self> {
        let client = Client::connect(
            endpoints,
            Some(ConnectOptions::new().with_timeout(connect_timeout)),
        )
        .await
        .map_err(|e| FleetError::fatal(format!("etcd connection failed: {e}")))?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    /// Wrap an already-connected client
    pub fn from_client(client: Client) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
        }
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut client = self.client.lock().await;
        client.put(key, value, None).await.map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.lock().await;
        let resp = client.get(key, None).await.map_err(store_err)?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(
                kv.value_str().map_err(store_err)?.to_string(),
            )),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(store_err)?;
        let mut map = BTreeMap::new();
        for kv in resp.kvs() {
            map.insert(
                kv.key_str().map_err(store_err)?.to_string(),
                kv.value_str().map_err(store_err)?.to_string(),
            );
        }
        Ok(map)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.lock().await;
        client.delete(key, None).await.map_err(store_err)?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn grant_session(&self, ttl: Duration) -> Result<Session> {
        let ttl_secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let mut client = self.client.lock().await;
        let lease = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(store_err)?;
        let lease_id = lease.id();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(store_err)?;
        drop(client);

        let (expired_tx, expired_rx) = watch::channel(false);
        let refresh = Duration::from_secs((ttl_secs as u64 / 3).max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(refresh);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    _ => break,
                }
            }
            tracing::warn!(lease_id, "store session expired");
            let _ = expired_tx.send(true);
        });

        Ok(Session {
            id: lease_id,
            expired: expired_rx,
        })
    }

    async fn revoke_session(&self, session_id: i64) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .lease_revoke(session_id)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn create_ephemeral(
        &self,
        prefix: &str,
        session_id: i64,
        value: &str,
    ) -> Result<(String, i64)> {
        let key = format!("{prefix}/{session_id:x}");
        let mut client = self.client.lock().await;
        client
            .put(
                key.as_str(),
                value,
                Some(PutOptions::new().with_lease(session_id)),
            )
            .await
            .map_err(store_err)?;
        let resp = client.get(key.as_str(), None).await.map_err(store_err)?;
        let kv = resp.kvs().first().ok_or_else(|| {
            FleetError::store(format!("ephemeral key {key} vanished after creation"))
        })?;
        Ok((key, kv.create_revision()))
    }

    async fn list_ephemeral(&self, prefix: &str) -> Result<Vec<EphemeralEntry>> {
        let child_prefix = format!("{prefix}/");
        let mut client = self.client.lock().await;
        let resp = client
            .get(
                child_prefix.as_str(),
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .map_err(store_err)?;
        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            entries.push(EphemeralEntry {
                key: kv.key_str().map_err(store_err)?.to_string(),
                create_revision: kv.create_revision(),
                session: kv.lease(),
            });
        }
        Ok(entries)
    }

    async fn wait_deleted(&self, key: &str) -> Result<()> {
        // Register the watch before checking existence so a deletion
        // between the two cannot be missed.
        let (mut watcher, mut stream) = {
            let mut client = self.client.lock().await;
            let watch = client.watch(key, None).await.map_err(store_err)?;
            let resp = client.get(key, None).await.map_err(store_err)?;
            if resp.kvs().is_empty() {
                let (mut watcher, _stream) = watch;
                let _ = watcher.cancel().await;
                return Ok(());
            }
            watch
        };

        while let Some(resp) = stream.message().await.map_err(store_err)? {
            for event in resp.events() {
                if event.event_type() == EventType::Delete {
                    let _ = watcher.cancel().await;
                    return Ok(());
                }
            }
        }
        Err(FleetError::store(format!(
            "watch on {key} ended before deletion"
        )))
    }
}
