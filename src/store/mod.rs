//! Shared KV store contract.
//!
//! The platform keeps all cluster-wide state in a linearizable key-value
//! store that also provides a session/lease primitive: a session owns a
//! lease with a TTL, the store keeps it alive while the client is
//! reachable, revokes every session-owned key on expiry and signals the
//! expiry to the client. The distributed mutex is derived from ordered,
//! session-scoped ephemeral keys (lowest creation revision wins).

pub mod etcd;
pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;

/// A live session (lease) granted by the store.
///
/// `expired` flips to `true` exactly once, when the store decides the
/// client is gone or the session is revoked.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: i64,
    pub expired: watch::Receiver<bool>,
}

/// An ephemeral key created under a mutex prefix
#[derive(Debug, Clone)]
pub struct EphemeralEntry {
    pub key: String,
    pub create_revision: i64,
    pub session: i64,
}

/// Interface to the shared store. All values are JSON-encoded UTF-8.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Returns `None` for an absent key; absence is distinguishable from
    /// an empty value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Grant a session with the requested TTL. The store keeps it alive
    /// until the client disappears or `revoke_session` is called.
    async fn grant_session(&self, ttl: Duration) -> Result<Session>;

    /// Revoke a session, deleting every key it owns atomically.
    async fn revoke_session(&self, session_id: i64) -> Result<()>;

    /// Create a session-owned ephemeral key under `prefix/` and return it
    /// together with its creation revision.
    async fn create_ephemeral(
        &self,
        prefix: &str,
        session_id: i64,
        value: &str,
    ) -> Result<(String, i64)>;

    /// List the ephemeral keys under `prefix/` with their creation
    /// revisions and owning sessions.
    async fn list_ephemeral(&self, prefix: &str) -> Result<Vec<EphemeralEntry>>;

    /// Block until `key` is deleted; returns immediately when the key is
    /// already absent.
    async fn wait_deleted(&self, key: &str) -> Result<()>;
}

/// Key layout under the operator-chosen root prefix
pub mod keys {
    /// `<root>certs/<domain>`: managed domain certificates
    pub const CERTS: &str = "certs/";
    /// `<root>dns-providers/<name>`: DNS provider credentials
    pub const DNS_PROVIDERS: &str = "dns-providers/";
    /// `<root>deploy-configs/<id>`: deployment targets
    pub const DEPLOY_CONFIGS: &str = "deploy-configs/";
    /// `<root>dns_config/config`: legacy single-valued global default
    pub const DNS_CONFIG: &str = "dns_config/config";
    /// `<root>locks/<key>`: mutex keyspace (session-owned children)
    pub const LOCKS: &str = "locks/";
    /// Suffix of the advisory metadata key written next to a held mutex
    pub const LOCK_INFO_SUFFIX: &str = "_info";
}
