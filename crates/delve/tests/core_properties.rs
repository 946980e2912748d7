//! End-to-end behaviour of the assembled core.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use delve::parallel::ExecutionMode;
use delve::sync::ZoneLockManager;
use delve::tasks::{RetryStrategy, TaskConfig, TaskContext, TaskError, TaskStatus};
use delve::{CoreConfig, CoreContext};
use parking_lot::Mutex;

fn core(workers: usize) -> Arc<CoreContext> {
    Arc::new(CoreContext::new(CoreConfig::for_testing(workers)).unwrap())
}

#[test]
fn test_opposite_zone_orders_never_deadlock() {
    let core = core(1);
    let barrier = Arc::new(Barrier::new(2));
    let rounds = 200;

    let handles: Vec<_> = [vec![1, 2, 3], vec![3, 2, 1]]
        .into_iter()
        .map(|zones| {
            let core = Arc::clone(&core);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..rounds {
                    let guard = core.lock_zones(&zones).unwrap();
                    assert_eq!(guard.zones(), &[1, 2, 3]);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(core.zones().acquisition_count(2), 2 * rounds);
    assert_eq!(ZoneLockManager::acquisition_order(&[3, 2, 1, 2]), vec![1, 2, 3]);
    core.shutdown();
}

#[test]
fn test_zone_tasks_on_shared_zone_are_mutually_exclusive() {
    let core = core(4);
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let ids: Vec<_> = (0..16u32)
        .map(|i| {
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            // Every task shares zone 10 with every other
            core.schedule_zone_task(
                &[10, 20 + i],
                move |_ctx: &TaskContext| {
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(1));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                TaskConfig::default(),
                format!("dig {i}"),
            )
        })
        .collect();

    assert!(core.scheduler().wait_for_tasks(&ids, Some(Duration::from_secs(10))));
    for id in ids {
        assert_eq!(core.scheduler().task_status(id), Some(TaskStatus::Completed));
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    core.shutdown();
}

#[test]
fn test_zone_task_retries_after_lock_timeout() {
    let mut config = CoreConfig::for_testing(1);
    config.zones.task_lock_timeout_ms = 20;
    let core = Arc::new(CoreContext::new(config).unwrap());

    // Hold zone 4 on another thread so the first attempt times out
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let holder = {
        let core = Arc::clone(&core);
        thread::spawn(move || {
            let guard = core.lock_zones(&[4]).unwrap();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(guard);
        })
    };
    locked_rx.recv().unwrap();

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&attempts);
    let id = core.schedule_zone_task(
        &[4],
        move |ctx: &TaskContext| {
            seen.lock().push(ctx.attempt());
            Ok(())
        },
        TaskConfig::default().with_retries(5, RetryStrategy::Fixed(Duration::from_millis(30))),
        "blocked dig",
    );

    thread::sleep(Duration::from_millis(60));
    release_tx.send(()).unwrap();
    holder.join().unwrap();

    assert_eq!(
        core.scheduler().wait_for_task(id, Some(Duration::from_secs(5))),
        Some(TaskStatus::Completed)
    );
    // The body only ran once the zone was free
    assert_eq!(attempts.lock().len(), 1);
    assert!(core.scheduler().task_snapshot(id).unwrap().attempts > 1);
    core.shutdown();
}

#[test]
fn test_zone_task_without_retries_fails_on_timeout() {
    let mut config = CoreConfig::for_testing(1);
    config.zones.task_lock_timeout_ms = 10;
    let core = Arc::new(CoreContext::new(config).unwrap());

    let guard = core.lock_zones(&[9]).unwrap();
    let id = core.schedule_zone_task(&[9], |_ctx: &TaskContext| Ok(()), TaskConfig::default(), "starved");
    assert_eq!(
        core.scheduler().wait_for_task(id, Some(Duration::from_secs(5))),
        Some(TaskStatus::Failed)
    );
    let error = core.scheduler().task_snapshot(id).unwrap().error;
    assert!(matches!(error, Some(TaskError::Failed(_))));
    drop(guard);
    core.shutdown();
}

#[test]
fn test_locked_zone_loop_visits_each_zone_once() {
    let core = core(4);
    let visits = Mutex::new(Vec::new());

    let report = core.for_each_zone_locked(
        &[12, 3, 40, 3, 7, 12],
        |zone| {
            assert!(core.zones().is_owned_by_current_thread(zone));
            visits.lock().push(zone);
        },
        ExecutionMode::ForceParallel,
    );

    assert!(report.is_complete());
    assert_eq!(report.run.total_items, 4);
    assert_eq!(report.visited(), 4);
    let mut visits = visits.into_inner();
    visits.sort_unstable();
    assert_eq!(visits, vec![3, 7, 12, 40]);
    assert!(!core.zones().is_zone_locked(12));
    core.shutdown();
}

#[test]
fn test_locked_zone_loop_reports_zones_it_could_not_lock() {
    let mut config = CoreConfig::for_testing(2);
    config.zones.task_lock_timeout_ms = 20;
    let core = Arc::new(CoreContext::new(config).unwrap());

    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let holder = {
        let core = Arc::clone(&core);
        thread::spawn(move || {
            let guard = core.lock_zones(&[2]).unwrap();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(guard);
        })
    };
    locked_rx.recv().unwrap();

    let visits = Mutex::new(Vec::new());
    let report = core.for_each_zone_locked(&[1, 2, 3], |zone| visits.lock().push(zone), ExecutionMode::ForceParallel);

    assert!(!report.is_complete());
    assert_eq!(report.skipped, vec![2]);
    assert_eq!(report.visited(), 2);
    let mut visits = visits.into_inner();
    visits.sort_unstable();
    assert_eq!(visits, vec![1, 3]);

    release_tx.send(()).unwrap();
    holder.join().unwrap();
    let report = core.for_each_zone_locked(&[1, 2, 3], |_| {}, ExecutionMode::ForceParallel);
    assert!(report.is_complete());
    core.shutdown();
}

#[test]
fn test_locked_zone_loop_can_run_nested_loops() {
    let core = core(4);
    let cells = Arc::new((0..8 * 100).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());

    let runner = {
        let core = Arc::clone(&core);
        let cells = Arc::clone(&cells);
        thread::spawn(move || {
            core.for_each_zone_locked(
                &[0, 1, 2, 3, 4, 5, 6, 7],
                |zone| {
                    let row = zone as usize;
                    let inner = core.parallel().parallel_for(
                        100,
                        |col| {
                            cells[row * 100 + col].fetch_add(1, Ordering::Relaxed);
                        },
                        ExecutionMode::ForceParallel,
                        None,
                    );
                    assert!(inner.is_complete());
                },
                ExecutionMode::ForceParallel,
            )
        })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while !runner.is_finished() {
        assert!(Instant::now() < deadline, "nested loop inside a zone loop did not finish");
        thread::sleep(Duration::from_millis(5));
    }
    let report = runner.join().unwrap();
    assert!(report.is_complete());
    assert!(cells.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    assert!(!core.parallel().is_running());
    core.shutdown();
}
