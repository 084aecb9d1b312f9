//! Reentrant, session-backed distributed locks.
//!
//! One [`LockManager`] per process holds a single long-lived store session;
//! every lock it hands out shares that session. Acquisition creates a
//! session-owned ephemeral key under the lock's mutex prefix; the holder is
//! the key with the lowest creation revision, and waiters block on deletion
//! of the immediately preceding key. Session expiry fans out to every live
//! lock through its `done()` channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::store::{KvStore, Session, keys};
use crate::types::LockInfo;

/// Default TTL of the manager's shared session
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30);

/// Per-lock tuning
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Bound of a single `try_lock` attempt
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(500),
        }
    }
}

struct LockState {
    /// Reentrant acquisitions by the owner identity
    count: u32,
    /// The current epoch was lost (session expiry or force-unlock); the
    /// counter still drains through `unlock` without surfacing errors
    lost: bool,
    /// Our ephemeral key while held
    my_key: Option<String>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl LockState {
    fn new() -> Self {
        // Before the first acquisition there is no epoch to lose.
        let (done_tx, done_rx) = watch::channel(true);
        Self {
            count: 0,
            lost: false,
            my_key: None,
            done_tx,
            done_rx,
        }
    }
}

/// A distributed mutex tied to its manager's session.
///
/// The manager returns the same object for the same key, so re-entry on a
/// logical resource is honored regardless of call site. The owner identity
/// is process-scoped (`hostname-pid-nonce`): any task in the process that
/// locks an already-held lock increments the reentrant counter.
pub struct DistributedLock {
    key: String,
    mutex_prefix: String,
    info_key: String,
    store: Arc<dyn KvStore>,
    session_id: i64,
    owner: String,
    opts: LockOptions,
    expired: watch::Receiver<bool>,
    state: Mutex<LockState>,
    /// Serializes the acquisition protocol inside the process so only one
    /// task at a time creates an ephemeral key for this lock.
    gate: tokio::sync::Mutex<()>,
}

impl DistributedLock {
    /// Block until the lock is held. Returns a retryable store error on
    /// partition and `LockLost` once the manager's session has expired.
    pub async fn lock(&self) -> Result<()> {
        match self.acquire(None).await? {
            true => Ok(()),
            false => unreachable!("unbounded acquisition cannot time out"),
        }
    }

    /// A single acquisition attempt bounded by `opts.retry_interval`.
    /// Never blocks longer; returns whether the lock was acquired.
    pub async fn try_lock(&self) -> Result<bool> {
        self.acquire(Some(self.opts.retry_interval)).await
    }

    /// As [`lock`](Self::lock), bounded by `timeout`. Expiry of the bound
    /// yields a `LockTimeout` error and leaves nothing behind in the store.
    pub async fn lock_with_timeout(&self, timeout: Duration) -> Result<()> {
        match self.acquire(Some(timeout)).await? {
            true => Ok(()),
            false => Err(FleetError::lock_timeout(format!(
                "lock {} not acquired within {timeout:?}",
                self.key
            ))),
        }
    }

    /// Release one level of re-entry; only the last exit releases the
    /// underlying mutex and removes the advisory metadata.
    pub async fn unlock(&self) -> Result<()> {
        let released_key = {
            let mut st = self.state.lock().expect("lock state");
            if st.count == 0 {
                // After a loss the counter drains without surfacing errors.
                if st.lost {
                    return Ok(());
                }
                return Err(FleetError::lock_not_held(self.key.clone()));
            }
            st.count -= 1;
            if st.count > 0 {
                return Ok(());
            }
            let key = st.my_key.take();
            let _ = st.done_tx.send(true);
            if st.lost {
                return Ok(());
            }
            key
        };

        // After session loss the store already dropped our keys; draining
        // the counter is all that remains.
        if self.session_lost() {
            return Ok(());
        }
        if let Some(key) = released_key {
            if let Err(e) = self.store.delete(&self.info_key).await {
                tracing::warn!(lock = %self.key, error = %e, "failed to remove lock info");
            }
            if let Err(e) = self.store.delete(&key).await {
                tracing::warn!(lock = %self.key, error = %e, "failed to release mutex key; it will expire with the session");
            }
        }
        Ok(())
    }

    /// Whether the current owner identity holds the lock
    pub fn is_locked(&self) -> bool {
        let st = self.state.lock().expect("lock state");
        st.count > 0 && !st.lost
    }

    /// Loss signal for the current acquisition epoch: the receiver observes
    /// `true` exactly once when the lock is lost (session expiry,
    /// force-unlock or release). Safe to read any number of times.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.state.lock().expect("lock state").done_rx.clone()
    }

    fn session_lost(&self) -> bool {
        *self.expired.borrow()
    }

    /// Called by the manager when the shared session expires
    fn mark_lost(&self) {
        let mut st = self.state.lock().expect("lock state");
        if st.count > 0 || st.my_key.is_some() {
            tracing::warn!(lock = %self.key, "lock lost: session expired");
        }
        st.lost = true;
        st.my_key = None;
        let _ = st.done_tx.send(true);
    }

    async fn acquire(&self, bound: Option<Duration>) -> Result<bool> {
        if self.session_lost() {
            return Err(FleetError::lock_lost(format!(
                "session backing lock {} has expired",
                self.key
            )));
        }
        if self.reenter() {
            return Ok(true);
        }

        let started = Instant::now();
        let deadline = bound.map(|d| started + d);

        let _gate = match deadline {
            None => self.gate.lock().await,
            Some(at) => match tokio::time::timeout_at(at, self.gate.lock()).await {
                Ok(guard) => guard,
                Err(_) => return Ok(false),
            },
        };
        // Another task may have completed the protocol while we waited.
        if self.reenter() {
            return Ok(true);
        }

        let (my_key, my_revision) = self
            .store
            .create_ephemeral(&self.mutex_prefix, self.session_id, &self.owner)
            .await?;

        loop {
            let entries = match self.store.list_ephemeral(&self.mutex_prefix).await {
                Ok(entries) => entries,
                Err(e) => {
                    self.abandon(&my_key).await;
                    return Err(e);
                }
            };
            // Our own key disappearing means the session's keys were
            // revoked underneath us.
            if !entries.iter().any(|e| e.key == my_key) {
                return Err(FleetError::lock_lost(format!(
                    "waiter key for lock {} was revoked",
                    self.key
                )));
            }
            let predecessor = entries
                .iter()
                .filter(|e| e.create_revision < my_revision)
                .max_by_key(|e| e.create_revision)
                .map(|e| e.key.clone());

            let Some(predecessor) = predecessor else {
                self.install_holder(my_key.clone());
                self.write_info().await;
                return Ok(true);
            };

            let mut expired = self.expired.clone();
            let wait = self.store.wait_deleted(&predecessor);
            tokio::pin!(wait);
            let outcome = match deadline {
                Some(at) => loop {
                    tokio::select! {
                        r = &mut wait => break Some(r),
                        _ = expired.changed() => {
                            if *expired.borrow() {
                                break None;
                            }
                        }
                        _ = tokio::time::sleep_until(at) => {
                            self.abandon(&my_key).await;
                            return Ok(false);
                        }
                    }
                },
                None => loop {
                    tokio::select! {
                        r = &mut wait => break Some(r),
                        _ = expired.changed() => {
                            if *expired.borrow() {
                                break None;
                            }
                        }
                    }
                },
            };
            match outcome {
                Some(Ok(())) => continue,
                Some(Err(e)) => {
                    self.abandon(&my_key).await;
                    return Err(e);
                }
                None => {
                    return Err(FleetError::lock_lost(format!(
                        "session backing lock {} expired while waiting",
                        self.key
                    )));
                }
            }
        }
    }

    /// Increment the reentrant counter when this process already holds the
    /// lock. Returns false when the protocol has to run.
    fn reenter(&self) -> bool {
        let mut st = self.state.lock().expect("lock state");
        if st.count > 0 && !st.lost {
            st.count += 1;
            true
        } else {
            false
        }
    }

    fn install_holder(&self, my_key: String) {
        let mut st = self.state.lock().expect("lock state");
        st.count = 1;
        st.lost = false;
        st.my_key = Some(my_key);
        let (done_tx, done_rx) = watch::channel(false);
        st.done_tx = done_tx;
        st.done_rx = done_rx;
    }

    /// Advisory metadata for admins; not required for correctness
    async fn write_info(&self) {
        let info = LockInfo {
            key: self.key.clone(),
            owner: self.owner.clone(),
            create_time: Utc::now(),
            lease_id: self.session_id,
        };
        let value = match serde_json::to_string(&info) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(lock = %self.key, error = %e, "failed to encode lock info");
                return;
            }
        };
        if let Err(e) = self.store.put(&self.info_key, &value).await {
            tracing::warn!(lock = %self.key, error = %e, "failed to write lock info");
        }
    }

    async fn abandon(&self, my_key: &str) {
        if let Err(e) = self.store.delete(my_key).await {
            tracing::warn!(lock = %self.key, error = %e, "failed to remove abandoned waiter key");
        }
    }
}

/// Factory and session holder for distributed locks.
///
/// Locks live as long as the manager; the registry is cleared on
/// [`close`](Self::close).
pub struct LockManager {
    store: Arc<dyn KvStore>,
    root: String,
    session: Session,
    owner: String,
    locks: Mutex<HashMap<String, Arc<DistributedLock>>>,
}

impl LockManager {
    /// Grant the shared session and start the loss fan-out watcher.
    /// Failure here is fatal for the process: nothing else can coordinate
    /// without a session.
    pub async fn new(
        store: Arc<dyn KvStore>,
        root: &str,
        session_ttl: Duration,
    ) -> Result<Arc<Self>> {
        let session = store.grant_session(session_ttl).await.map_err(|e| {
            FleetError::fatal(format!("cannot establish store session: {e}"))
        })?;
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        let nonce = Uuid::new_v4().simple().to_string();
        let owner = format!("{host}-{}-{}", std::process::id(), &nonce[..8]);

        let manager = Arc::new(Self {
            store,
            root: normalize_root(root),
            session,
            owner,
            locks: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&manager);
        let mut expired = manager.session.expired.clone();
        tokio::spawn(async move {
            loop {
                if *expired.borrow() {
                    Self::fan_out_loss(&weak);
                    return;
                }
                if expired.changed().await.is_err() {
                    return;
                }
            }
        });

        Ok(manager)
    }

    fn fan_out_loss(weak: &Weak<LockManager>) {
        if let Some(manager) = weak.upgrade() {
            let locks: Vec<Arc<DistributedLock>> = {
                let registry = manager.locks.lock().expect("lock registry");
                registry.values().cloned().collect()
            };
            for lock in locks {
                lock.mark_lost();
            }
        }
    }

    /// Owner identity used for all locks of this manager
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Lease id of the shared session
    pub fn session_id(&self) -> i64 {
        self.session.id
    }

    /// Returns the lock object for `key`, creating it on first use.
    /// Subsequent calls for the same key return the same object; `opts`
    /// only apply to the first call.
    pub fn new_lock(&self, key: &str, opts: LockOptions) -> Arc<DistributedLock> {
        let mut registry = self.locks.lock().expect("lock registry");
        registry
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(DistributedLock {
                    key: key.to_string(),
                    mutex_prefix: format!("{}{}{}", self.root, keys::LOCKS, key),
                    info_key: format!(
                        "{}{}{}{}",
                        self.root,
                        keys::LOCKS,
                        key,
                        keys::LOCK_INFO_SUFFIX
                    ),
                    store: Arc::clone(&self.store),
                    session_id: self.session.id,
                    owner: self.owner.clone(),
                    opts,
                    expired: self.session.expired.clone(),
                    state: Mutex::new(LockState::new()),
                    gate: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }

    /// Admin operation: delete the advisory metadata and revoke the owning
    /// lease. Lease revocation removes every ephemeral key owned by it,
    /// releasing the mutex; the ex-owner observes the loss through its own
    /// session and closes its `done()`.
    pub async fn force_unlock(&self, key: &str) -> Result<()> {
        let info_key = format!(
            "{}{}{}{}",
            self.root,
            keys::LOCKS,
            key,
            keys::LOCK_INFO_SUFFIX
        );
        let raw = self
            .store
            .get(&info_key)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("lock {key} has no holder info")))?;
        let info: LockInfo = serde_json::from_str(&raw)?;
        self.store.delete(&info_key).await?;
        match self.store.revoke_session(info.lease_id).await {
            Ok(()) | Err(FleetError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Revoke the session and drop the lock registry. Every held lock
    /// observes loss through the fan-out.
    pub async fn close(&self) {
        if let Err(e) = self.store.revoke_session(self.session.id).await {
            tracing::debug!(error = %e, "session already gone at close");
        }
        self.locks.lock().expect("lock registry").clear();
    }
}

fn normalize_root(root: &str) -> String {
    if root.is_empty() {
        return String::new();
    }
    if root.ends_with('/') {
        root.to_string()
    } else {
        format!("{root}/")
    }
}
