//! Scheduler semantics: leadership election and failover, the clustered
//! singleton invariant, and local-task fairness.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use certfleet::scheduler::{ExecutionMode, Scheduler, SchedulerOptions, Task, TaskFn};
use certfleet::store::memory::MemoryStore;

use common::{lock_manager, wait_until};

fn counting_task(counter: &Arc<AtomicUsize>) -> TaskFn {
    let counter = Arc::clone(counter);
    Arc::new(move || {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    })
}

#[tokio::test]
async fn test_exactly_one_leader_and_failover() {
    let store = MemoryStore::new();
    let m1 = lock_manager(&store).await;
    let m2 = lock_manager(&store).await;
    let s1 = Scheduler::new(&m1, SchedulerOptions::default());
    let s2 = Scheduler::new(&m2, SchedulerOptions::default());
    s1.start();
    s2.start();

    assert!(
        wait_until(Duration::from_secs(5), || s1.is_leader() ^ s2.is_leader()).await,
        "exactly one node should report leadership"
    );

    // kill the leader's session; the other takes over within a TTL
    let (leader_mgr, follower) = if s1.is_leader() {
        (m1.session_id(), s2.clone())
    } else {
        (m2.session_id(), s1.clone())
    };
    store.expire_session(leader_mgr).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || follower.is_leader()).await,
        "the surviving node should take over leadership"
    );

    s1.shutdown().await;
    s2.shutdown().await;
}

#[tokio::test]
async fn test_clustered_task_runs_only_on_leader() {
    let store = MemoryStore::new();
    let m1 = lock_manager(&store).await;
    let m2 = lock_manager(&store).await;
    let s1 = Scheduler::new(&m1, SchedulerOptions::default());
    let s2 = Scheduler::new(&m2, SchedulerOptions::default());
    s1.start();
    s2.start();
    assert!(wait_until(Duration::from_secs(5), || s1.is_leader() ^ s2.is_leader()).await);

    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));
    for (scheduler, counter) in [(&s1, &c1), (&s2, &c2)] {
        scheduler
            .register(Task::interval(
                "clustered_tick",
                Duration::from_millis(10),
                Duration::from_millis(50),
                ExecutionMode::Clustered,
                Duration::from_secs(5),
                counting_task(counter),
            ))
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    let (leader_count, follower_count) = if s1.is_leader() {
        (c1.load(Ordering::SeqCst), c2.load(Ordering::SeqCst))
    } else {
        (c2.load(Ordering::SeqCst), c1.load(Ordering::SeqCst))
    };
    assert!(leader_count >= 2, "leader should execute the clustered task");
    assert_eq!(follower_count, 0, "follower must never execute it");

    s1.shutdown().await;
    s2.shutdown().await;
}

#[tokio::test]
async fn test_local_task_runs_on_every_node() {
    let store = MemoryStore::new();
    let m1 = lock_manager(&store).await;
    let m2 = lock_manager(&store).await;
    let s1 = Scheduler::new(&m1, SchedulerOptions::default());
    let s2 = Scheduler::new(&m2, SchedulerOptions::default());
    s1.start();
    s2.start();

    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));
    for (scheduler, counter) in [(&s1, &c1), (&s2, &c2)] {
        scheduler
            .register(Task::interval(
                "local_tick",
                Duration::from_millis(10),
                Duration::from_millis(50),
                ExecutionMode::Local,
                Duration::from_secs(5),
                counting_task(counter),
            ))
            .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            c1.load(Ordering::SeqCst) >= 3 && c2.load(Ordering::SeqCst) >= 3
        })
        .await,
        "local tasks fire on leader and follower alike"
    );

    s1.shutdown().await;
    s2.shutdown().await;
}

#[tokio::test]
async fn test_once_task_terminates_after_single_run() {
    let store = MemoryStore::new();
    let manager = lock_manager(&store).await;
    let scheduler = Scheduler::new(&manager, SchedulerOptions::default());
    scheduler.start();

    let counter = Arc::new(AtomicUsize::new(0));
    let id = scheduler
        .register(Task::once(
            "one_shot",
            chrono::Utc::now(),
            ExecutionMode::Local,
            Duration::from_secs(5),
            counting_task(&counter),
        ))
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            scheduler.task_status(id) == Some(certfleet::scheduler::TaskStatus::Completed)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_panicking_task_is_cancelled_not_requeued() {
    let store = MemoryStore::new();
    let manager = lock_manager(&store).await;
    let scheduler = Scheduler::new(&manager, SchedulerOptions::default());
    scheduler.start();

    let run: TaskFn = Arc::new(|| Box::pin(async { panic!("boom") }));
    let id = scheduler
        .register(Task::interval(
            "panicker",
            Duration::from_millis(10),
            Duration::from_millis(50),
            ExecutionMode::Local,
            Duration::from_secs(5),
            run,
        ))
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            scheduler.task_status(id) == Some(certfleet::scheduler::TaskStatus::Cancelled)
        })
        .await,
        "a panicking task is marked cancelled"
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_workers() {
    let store = MemoryStore::new();
    let manager = lock_manager(&store).await;
    let scheduler = Scheduler::new(&manager, SchedulerOptions::default());
    scheduler.start();

    let counter = Arc::new(AtomicUsize::new(0));
    scheduler
        .register(Task::interval(
            "slowpoke",
            Duration::from_millis(10),
            Duration::from_millis(100),
            ExecutionMode::Local,
            Duration::from_secs(5),
            {
                let counter = Arc::clone(&counter);
                Arc::new(move || {
                    let counter = Arc::clone(&counter);
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                })
            },
        ))
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) >= 1).await);
    scheduler.shutdown().await;
    let after = counter.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(counter.load(Ordering::SeqCst), after, "no work after drain");
}
