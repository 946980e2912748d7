//! Scheduler behaviour under real worker threads.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use delve_tasks::{
    CapabilitySet, RetryStrategy, SchedulerConfig, TaskConfig, TaskError, TaskId, TaskPriority, TaskScheduler,
    TaskStatus, WorkerPriority,
};
use parking_lot::Mutex;

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

/// Occupies the only worker until the returned sender is used or dropped.
fn block_single_worker(scheduler: &TaskScheduler) -> (TaskId, crossbeam_channel::Sender<()>) {
    let (started_tx, started_rx) = bounded::<()>(1);
    let (release_tx, release_rx): (_, Receiver<()>) = bounded(1);
    let gate = scheduler.schedule_task(
        move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(())
        },
        TaskConfig::default(),
        "gate",
    );
    started_rx.recv().unwrap();
    (gate, release_tx)
}

#[test]
fn test_dependent_never_runs_before_dependency() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(4)).unwrap();
    let dependency_done = Arc::new(AtomicBool::new(false));

    let done = Arc::clone(&dependency_done);
    let first = scheduler.schedule_task(
        move |_| {
            thread::sleep(Duration::from_millis(30));
            done.store(true, Ordering::SeqCst);
            Ok(())
        },
        TaskConfig::default(),
        "excavate",
    );

    let done = Arc::clone(&dependency_done);
    let second = scheduler.schedule_task(
        move |_| {
            assert!(done.load(Ordering::SeqCst), "dependent ran early");
            Ok(())
        },
        TaskConfig::default().depends_on(first),
        "haul",
    );

    assert_eq!(scheduler.task_status(second), Some(TaskStatus::Pending));
    assert_eq!(scheduler.wait_for_task(second, WAIT), Some(TaskStatus::Completed));
    assert_eq!(scheduler.task_status(first), Some(TaskStatus::Completed));
}

#[test]
fn test_diamond_dependencies() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(3)).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let record = |name: &'static str| {
        let order = Arc::clone(&order);
        move |_: &delve_tasks::TaskContext| {
            order.lock().push(name);
            Ok::<(), TaskError>(())
        }
    };

    let root = scheduler.schedule_task(record("root"), TaskConfig::default(), "root");
    let left = scheduler.schedule_task(record("left"), TaskConfig::default().depends_on(root), "left");
    let right = scheduler.schedule_task(record("right"), TaskConfig::default().depends_on(root), "right");
    let join = scheduler.schedule_task(
        record("join"),
        TaskConfig::default().with_dependencies([left, right]),
        "join",
    );

    assert_eq!(scheduler.wait_for_task(join, WAIT), Some(TaskStatus::Completed));
    let order = order.lock();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], "root");
    assert_eq!(order[3], "join");
}

#[test]
fn test_dependency_failure_cascades() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(2)).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let failing = scheduler.schedule_task(
        |_| {
            thread::sleep(Duration::from_millis(10));
            Err(TaskError::failed("shaft flooded"))
        },
        TaskConfig::default(),
        "pump",
    );
    let counter = Arc::clone(&ran);
    let middle = scheduler.schedule_task(
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        TaskConfig::default().depends_on(failing),
        "drill",
    );
    let counter = Arc::clone(&ran);
    let last = scheduler.schedule_task(
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        TaskConfig::default().depends_on(middle),
        "blast",
    );

    assert_eq!(scheduler.wait_for_task(last, WAIT), Some(TaskStatus::Failed));
    assert_eq!(scheduler.task_status(middle), Some(TaskStatus::Failed));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(
        scheduler.task_snapshot(last).unwrap().error,
        Some(TaskError::DependencyFailed {
            dependency: middle,
            status: TaskStatus::Failed,
        })
    );
    assert_eq!(scheduler.task_snapshot(middle).unwrap().attempts, 0);
}

#[test]
fn test_cancel_pending_task_directly() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(1)).unwrap();
    let (gate, release) = block_single_worker(&scheduler);

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    let queued = scheduler.schedule_task_with_callback(
        |_| panic!("cancelled task must not run"),
        move |outcome| sink.lock().push(outcome.clone()),
        TaskConfig::default(),
        "queued",
    );

    assert!(scheduler.cancel_task(queued, false));
    assert_eq!(scheduler.task_status(queued), Some(TaskStatus::Cancelled));
    assert!(!scheduler.cancel_task(queued, false));

    release.send(()).unwrap();
    assert_eq!(scheduler.wait_for_task(gate, WAIT), Some(TaskStatus::Completed));

    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, TaskStatus::Cancelled);
    assert_eq!(outcomes[0].attempts, 0);
    assert_eq!(outcomes[0].error, Some(TaskError::Cancelled));
}

#[test]
fn test_cancel_running_task_waits() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(1)).unwrap();
    let (started_tx, started_rx) = bounded::<()>(1);

    let id = scheduler.schedule_task(
        move |ctx| {
            let _ = started_tx.try_send(());
            while !ctx.should_stop() {
                thread::sleep(Duration::from_millis(1));
            }
            Err(TaskError::Cancelled)
        },
        TaskConfig::default(),
        "survey",
    );
    started_rx.recv().unwrap();
    assert_eq!(scheduler.task_status(id), Some(TaskStatus::Running));

    assert!(scheduler.cancel_task(id, true));
    assert_eq!(scheduler.task_status(id), Some(TaskStatus::Cancelled));
    assert_eq!(scheduler.stats().cancelled, 1);
}

#[test]
fn test_completion_callback_fires_once() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(2)).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let ids: Vec<_> = (0..20)
        .map(|i| {
            let fired = Arc::clone(&fired);
            scheduler.schedule_task_with_callback(
                move |_| {
                    if i % 4 == 0 {
                        Err(TaskError::failed("bad seam"))
                    } else {
                        Ok(())
                    }
                },
                move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                TaskConfig::default(),
                format!("seam {i}"),
            )
        })
        .collect();

    assert!(scheduler.wait_for_tasks(&ids, WAIT));
    assert_eq!(fired.load(Ordering::SeqCst), 20);
    let stats = scheduler.stats();
    assert_eq!(stats.completed, 15);
    assert_eq!(stats.failed, 5);
}

#[test]
fn test_priority_order_on_single_worker() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(1)).unwrap();
    let (_gate, release) = block_single_worker(&scheduler);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for (name, priority) in [
        ("background", TaskPriority::Background),
        ("critical", TaskPriority::Critical),
        ("normal", TaskPriority::Normal),
        ("high", TaskPriority::High),
    ] {
        let order = Arc::clone(&order);
        ids.push(scheduler.schedule_task(
            move |_| {
                order.lock().push(name);
                Ok(())
            },
            TaskConfig::default().with_priority(priority),
            name,
        ));
    }

    release.send(()).unwrap();
    assert!(scheduler.wait_for_tasks(&ids, WAIT));
    assert_eq!(*order.lock(), vec!["critical", "high", "normal", "background"]);
}

#[test]
fn test_capability_routing() {
    let config = SchedulerConfig::with_workers(1).with_specialized(&["octree", "mesh"], 1, WorkerPriority::High);
    let scheduler = TaskScheduler::new(config).unwrap();

    assert_eq!(scheduler.workers().len(), 2);
    let specialists = scheduler.workers_for_capabilities(CapabilitySet::OCTREE);
    assert_eq!(specialists.len(), 1);
    assert!(scheduler
        .workers_for_capabilities(CapabilitySet::GPU_DISPATCH)
        .is_empty());

    let thread_name = || thread::current().name().unwrap_or_default().to_string();
    let names = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for _ in 0..10 {
        let names = Arc::clone(&names);
        ids.push(scheduler.schedule_task(
            move |_| {
                names.lock().push(("octree", thread_name()));
                Ok(())
            },
            TaskConfig::default().with_capabilities(CapabilitySet::OCTREE),
            "octree rebuild",
        ));
    }
    // No specialist supports GPU dispatch, so a generic worker takes it
    let names_gpu = Arc::clone(&names);
    ids.push(scheduler.schedule_task(
        move |_| {
            names_gpu.lock().push(("gpu", thread_name()));
            Ok(())
        },
        TaskConfig::default().with_capabilities(CapabilitySet::GPU_DISPATCH),
        "gpu dispatch",
    ));

    assert!(scheduler.wait_for_tasks(&ids, WAIT));
    for (kind, name) in names.lock().iter() {
        match *kind {
            "octree" => assert!(name.starts_with("delve-special-"), "{name}"),
            _ => assert!(name.starts_with("delve-worker-"), "{name}"),
        }
    }
    let special = scheduler
        .workers()
        .into_iter()
        .find(|w| w.capabilities.is_some())
        .unwrap();
    assert_eq!(special.priority, WorkerPriority::High);
    assert_eq!(special.tasks_executed, 10);
}

#[test]
fn test_progress_reports_reach_callback() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(1)).unwrap();
    let (_gate, release) = block_single_worker(&scheduler);

    let id = scheduler.schedule_task(
        |ctx| {
            for step in 1..=4u8 {
                ctx.report_progress(f32::from(step) / 4.0, Some("sifting"));
            }
            Ok(())
        },
        TaskConfig::default().with_progress_interval(Duration::from_secs(60)),
        "sift",
    );

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    assert!(scheduler.set_progress_callback(id, move |p| sink.lock().push(p.fraction)));

    release.send(()).unwrap();
    assert_eq!(scheduler.wait_for_task(id, WAIT), Some(TaskStatus::Completed));

    // First report plus the always-delivered final one
    assert_eq!(*reports.lock(), vec![0.25, 1.0]);
    assert_eq!(scheduler.task_progress(id), Some(1.0));
    assert!(!scheduler.set_progress_callback(id, |_| {}));
}

#[test]
fn test_shutdown_cancels_pending_work() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(1)).unwrap();
    let (gate, release) = block_single_worker(&scheduler);

    let waiting = scheduler.schedule_task(|_| Ok(()), TaskConfig::default(), "never");
    let parked = scheduler.schedule_task(|_| Ok(()), TaskConfig::default().depends_on(waiting), "parked");

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let _ = release.send(());
    });
    scheduler.shutdown();
    releaser.join().unwrap();

    assert_eq!(scheduler.task_status(gate), Some(TaskStatus::Completed));
    assert_eq!(scheduler.task_status(waiting), Some(TaskStatus::Cancelled));
    // Either cancelled directly or failed because `waiting` was cancelled first
    assert!(matches!(
        scheduler.task_status(parked),
        Some(TaskStatus::Cancelled | TaskStatus::Failed)
    ));
    assert!(scheduler.is_shutdown());
}

/// Schedules `count` tasks that fail their first attempt and then wait
/// `delay` before retrying. Returns once all of them are delayed.
fn schedule_delayed_retries(
    scheduler: &TaskScheduler,
    count: usize,
    delay: Duration,
    config: TaskConfig,
) -> Vec<TaskId> {
    let before = scheduler.stats().delayed;
    let ids: Vec<_> = (0..count)
        .map(|i| {
            scheduler.schedule_task(
                |ctx| {
                    if ctx.attempt() == 1 {
                        Err(TaskError::failed("seam not stable yet"))
                    } else {
                        Ok(())
                    }
                },
                config.clone().with_retries(1, RetryStrategy::Fixed(delay)),
                format!("reinforce {i}"),
            )
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.stats().delayed < before + count {
        assert!(Instant::now() < deadline, "retries never became delayed");
        thread::sleep(Duration::from_millis(1));
    }
    ids
}

#[test]
fn test_delayed_retries_do_not_block_ready_work() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(1)).unwrap();
    let delayed = schedule_delayed_retries(
        &scheduler,
        6,
        Duration::from_secs(3),
        TaskConfig::default().with_priority(TaskPriority::Critical),
    );

    let ready = scheduler.schedule_task(|_| Ok(()), TaskConfig::default(), "sweep");
    assert_eq!(
        scheduler.wait_for_task(ready, Some(Duration::from_millis(1_500))),
        Some(TaskStatus::Completed)
    );
    for id in delayed {
        assert_eq!(scheduler.task_status(id), Some(TaskStatus::Pending));
        assert!(scheduler.cancel_task(id, false));
    }
}

#[test]
fn test_delayed_retry_does_not_block_specialist() {
    let config = SchedulerConfig::with_workers(1).with_specialized(&["octree"], 1, WorkerPriority::Normal);
    let scheduler = TaskScheduler::new(config).unwrap();
    let tagged = TaskConfig::default().with_capabilities(CapabilitySet::OCTREE);

    let delayed = schedule_delayed_retries(&scheduler, 1, Duration::from_secs(3), tagged.clone());
    let ready = scheduler.schedule_task(|_| Ok(()), tagged, "rebalance octree");
    assert_eq!(
        scheduler.wait_for_task(ready, Some(Duration::from_millis(1_500))),
        Some(TaskStatus::Completed)
    );
    assert!(scheduler.cancel_task(delayed[0], false));
}

#[test]
fn test_delayed_retry_runs_once_due() {
    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(1)).unwrap();
    let ids = schedule_delayed_retries(&scheduler, 2, Duration::from_millis(50), TaskConfig::default());
    assert!(scheduler.wait_for_tasks(&ids, WAIT));
    for id in ids {
        assert_eq!(scheduler.task_status(id), Some(TaskStatus::Completed));
        assert_eq!(scheduler.task_snapshot(id).unwrap().attempts, 2);
    }
    assert_eq!(scheduler.stats().delayed, 0);
}

#[test]
fn test_failure_cascades_down_a_long_chain() {
    const LINKS: usize = 20_000;

    let scheduler = TaskScheduler::new(SchedulerConfig::with_workers(2)).unwrap();
    let (release_tx, release_rx) = bounded::<()>(1);
    let head = scheduler.schedule_task(
        move |_| {
            let _ = release_rx.recv();
            Err(TaskError::failed("shaft flooded"))
        },
        TaskConfig::default(),
        "pump shaft",
    );

    let mut previous = head;
    let mut chain = Vec::with_capacity(LINKS);
    for i in 0..LINKS {
        previous = scheduler.schedule_task(|_| Ok(()), TaskConfig::default().depends_on(previous), format!("tunnel {i}"));
        chain.push(previous);
    }
    release_tx.send(()).unwrap();

    let last = chain[LINKS - 1];
    assert_eq!(scheduler.wait_for_task(last, Some(Duration::from_secs(30))), Some(TaskStatus::Failed));
    assert_eq!(
        scheduler.task_snapshot(last).unwrap().error,
        Some(TaskError::DependencyFailed {
            dependency: chain[LINKS - 2],
            status: TaskStatus::Failed,
        })
    );
    assert_eq!(scheduler.stats().failed, 1 + LINKS as u64);

    // Workers survived the cascade
    let after = scheduler.schedule_task(|_| Ok(()), TaskConfig::default(), "after");
    assert_eq!(scheduler.wait_for_task(after, WAIT), Some(TaskStatus::Completed));
}
