//! Distributed lock properties: mutual exclusion, reentrancy and loss
//! notification, model-checked against the in-memory store.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use certfleet::error::FleetError;
use certfleet::lock::LockOptions;
use certfleet::store::memory::MemoryStore;

use common::lock_manager;

#[tokio::test]
async fn test_mutual_exclusion_under_contention() {
    let store = MemoryStore::new();
    let held = Arc::new(AtomicBool::new(false));
    let acquisitions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for worker in 0..3 {
        let store = store.clone();
        let held = Arc::clone(&held);
        let acquisitions = Arc::clone(&acquisitions);
        handles.push(tokio::spawn(async move {
            let manager = lock_manager(&store).await;
            let lock = manager.new_lock("exclusive", LockOptions::default());
            for round in 0..10 {
                lock.lock().await.unwrap();
                assert!(
                    !held.swap(true, Ordering::SeqCst),
                    "two holders for the same key (worker {worker}, round {round})"
                );
                // injected latency widens the window a violation would need
                tokio::time::sleep(Duration::from_millis(2)).await;
                held.store(false, Ordering::SeqCst);
                acquisitions.fetch_add(1, Ordering::SeqCst);
                lock.unlock().await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(acquisitions.load(Ordering::SeqCst), 30);
}

#[tokio::test]
async fn test_reentrancy_and_unheld_unlock() {
    let store = MemoryStore::new();
    let manager = lock_manager(&store).await;
    let lock = manager.new_lock("reentrant", LockOptions::default());

    lock.lock().await.unwrap();
    lock.lock().await.unwrap();
    lock.unlock().await.unwrap();
    assert!(lock.is_locked());
    lock.unlock().await.unwrap();
    assert!(!lock.is_locked());

    let err = lock.unlock().await.unwrap_err();
    assert!(matches!(err, FleetError::LockNotHeld(_)));
}

#[tokio::test]
async fn test_loss_notification_on_force_unlock() {
    let store = MemoryStore::new();
    let owner = lock_manager(&store).await;
    let admin = lock_manager(&store).await;

    let lock = owner.new_lock("forced", LockOptions::default());
    lock.lock().await.unwrap();
    assert!(lock.is_locked());

    admin.force_unlock("forced").await.unwrap();

    let mut done = lock.done();
    tokio::time::timeout(Duration::from_secs(2), done.wait_for(|lost| *lost))
        .await
        .expect("done should close after forced lease revocation")
        .unwrap();
    assert!(!lock.is_locked());
}

#[tokio::test]
async fn test_force_unlock_releases_for_other_waiters() {
    let store = MemoryStore::new();
    let owner = lock_manager(&store).await;
    let admin = lock_manager(&store).await;
    let contender = lock_manager(&store).await;

    owner
        .new_lock("handover", LockOptions::default())
        .lock()
        .await
        .unwrap();

    let waiter = contender.new_lock("handover", LockOptions::default());
    let waiting = {
        let waiter = Arc::clone(&waiter);
        tokio::spawn(async move { waiter.lock().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    admin.force_unlock("handover").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("waiter should acquire after force-unlock")
        .unwrap()
        .unwrap();
    assert!(waiter.is_locked());
}

#[tokio::test]
async fn test_lock_with_timeout_fails_while_held_elsewhere() {
    let store = MemoryStore::new();
    let m1 = lock_manager(&store).await;
    let m2 = lock_manager(&store).await;

    m1.new_lock("busy", LockOptions::default())
        .lock()
        .await
        .unwrap();

    let err = m2
        .new_lock("busy", LockOptions::default())
        .lock_with_timeout(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::LockTimeout(_)));

    // the timed-out waiter left nothing behind: release and re-acquire
    m1.new_lock("busy", LockOptions::default())
        .unlock()
        .await
        .unwrap();
    assert!(
        m2.new_lock("busy", LockOptions::default())
            .try_lock()
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_advisory_info_written_and_cleared() {
    let store = MemoryStore::new();
    let manager = lock_manager(&store).await;
    let lock = manager.new_lock("advisory", LockOptions::default());

    lock.lock().await.unwrap();
    let info_key = format!("{}locks/advisory_info", common::NAMESPACE);
    let raw = store_get(&store, &info_key).await;
    let info: certfleet::types::LockInfo = serde_json::from_str(&raw.unwrap()).unwrap();
    assert_eq!(info.key, "advisory");
    assert_eq!(info.lease_id, manager.session_id());
    assert!(info.owner.contains('-'));

    lock.unlock().await.unwrap();
    assert!(store_get(&store, &info_key).await.is_none());
}

async fn store_get(store: &MemoryStore, key: &str) -> Option<String> {
    use certfleet::store::KvStore;
    store.get(key).await.unwrap()
}
