//! Integration tests for the threaded core loop.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tandem_scheduler::{
    CommandError, CoreThread, QueueFlags, RunState, SchedulerConfig, SchedulerError, WorkerBudget,
    WorkerSlots,
};

fn start() -> Arc<CoreThread> {
    Arc::new(CoreThread::start(SchedulerConfig::threaded()).unwrap())
}

#[test]
fn test_blocking_submit_runs_everything_queued() {
    let core = start();
    let x = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let x = Arc::clone(&x);
        core.queue_command(
            move || {
                x.fetch_add(1, Ordering::SeqCst);
            },
            QueueFlags::empty(),
        )
        .unwrap();
    }
    core.submit(true).unwrap();

    assert_eq!(x.load(Ordering::SeqCst), 3);
}

#[test]
fn test_concurrent_producer_does_not_disturb_order() {
    let core = start();
    let x = Arc::new(AtomicU32::new(0));
    let a_log = Arc::new(Mutex::new(Vec::new()));
    let b_count = Arc::new(AtomicU32::new(0));

    let producer_b = {
        let core = Arc::clone(&core);
        let b_count = Arc::clone(&b_count);
        thread::spawn(move || {
            for _ in 0..200 {
                let b_count = Arc::clone(&b_count);
                core.queue_command(
                    move || {
                        b_count.fetch_add(1, Ordering::SeqCst);
                    },
                    QueueFlags::empty(),
                )
                .unwrap();
                core.submit(false).unwrap();
            }
        })
    };

    let producer_a = {
        let core = Arc::clone(&core);
        let x = Arc::clone(&x);
        let a_log = Arc::clone(&a_log);
        thread::spawn(move || {
            for step in 0..3 {
                let x = Arc::clone(&x);
                let a_log = Arc::clone(&a_log);
                core.queue_command(
                    move || {
                        x.fetch_add(1, Ordering::SeqCst);
                        a_log.lock().push(step);
                    },
                    QueueFlags::empty(),
                )
                .unwrap();
            }
            core.submit(true).unwrap();
            x.load(Ordering::SeqCst)
        })
    };

    assert_eq!(producer_a.join().unwrap(), 3);
    assert_eq!(*a_log.lock(), vec![0, 1, 2]);

    producer_b.join().unwrap();
    core.submit_all(true).unwrap();
    assert_eq!(b_count.load(Ordering::SeqCst), 200);
}

#[test]
fn test_fifo_per_producer() {
    let core = start();
    let log = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..4u32)
        .map(|producer| {
            let core = Arc::clone(&core);
            let log = Arc::clone(&log);
            thread::spawn(move || {
                for seq in 0..100u32 {
                    let log = Arc::clone(&log);
                    core.queue_command(move || log.lock().push((producer, seq)), QueueFlags::empty())
                        .unwrap();
                    if seq % 10 == 9 {
                        core.submit(false).unwrap();
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    core.submit_all(true).unwrap();

    let log = log.lock();
    assert_eq!(log.len(), 400);
    for producer in 0..4 {
        let seen: Vec<u32> = log
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}

#[test]
fn test_submit_all_runs_workers_before_main() {
    let core = start();
    let log = Arc::new(Mutex::new(Vec::new()));

    {
        let log = Arc::clone(&log);
        core.queue_command(move || log.lock().push("main"), QueueFlags::empty())
            .unwrap();
    }

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let core = Arc::clone(&core);
            let log = Arc::clone(&log);
            thread::spawn(move || {
                core.queue_command(move || log.lock().push("worker"), QueueFlags::empty())
                    .unwrap();
                assert_eq!(core.pending_commands(), 1);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    core.submit_all(true).unwrap();
    assert_eq!(*log.lock(), vec!["worker", "worker", "main"]);
}

#[test]
fn test_internal_blocking_returns_after_run() {
    let core = start();
    let ran = Arc::new(AtomicU32::new(0));

    let flag = Arc::clone(&ran);
    core.queue_command(
        move || {
            thread::sleep(Duration::from_millis(10));
            flag.store(1, Ordering::SeqCst);
        },
        QueueFlags::INTERNAL_BLOCKING,
    )
    .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_internal_queue_skips_pending_commands() {
    let core = start();
    let deferred = Arc::new(AtomicU32::new(0));

    let flag = Arc::clone(&deferred);
    core.queue_command(
        move || {
            flag.store(1, Ordering::SeqCst);
        },
        QueueFlags::empty(),
    )
    .unwrap();
    core.queue_command(|| {}, QueueFlags::INTERNAL_BLOCKING).unwrap();

    // The internal command ran; the deferred one is still waiting.
    assert_eq!(deferred.load(Ordering::SeqCst), 0);
    assert_eq!(core.pending_commands(), 1);
}

#[test]
fn test_blocking_return_command() {
    let core = start();
    let op = core
        .queue_return_command(|| Ok(vec![1u8, 2, 3]), QueueFlags::BLOCK_UNTIL_COMPLETE)
        .unwrap();

    assert!(op.has_completed());
    assert_eq!(op.wait(), Ok(vec![1, 2, 3]));
}

#[test]
fn test_unsubmitted_return_stays_pending() {
    let core = start();
    let op = core
        .queue_return_command(|| Ok(7u32), QueueFlags::empty())
        .unwrap();

    assert!(!op.wait_timeout(Duration::from_millis(50)));
    assert!(op.take().is_none());

    drop(core);
    assert_eq!(op.wait(), Err(CommandError::Abandoned));
}

#[test]
fn test_reentry_fails_fast_on_core_thread() {
    let core = start();
    let inner = Arc::clone(&core);

    let op = core
        .queue_return_command(
            move || {
                Ok((
                    inner.queue_command(|| {}, QueueFlags::empty()),
                    inner.submit(true),
                    inner.assert_core_thread(),
                    inner.assert_not_core_thread(),
                ))
            },
            QueueFlags::INTERNAL_QUEUE,
        )
        .unwrap();

    let (queued, submitted, on_core, not_core) = op.wait().unwrap();
    assert_eq!(queued, Err(SchedulerError::QueuedFromCoreThread));
    assert_eq!(submitted, Err(SchedulerError::WaitOnCoreThread));
    assert_eq!(on_core, Ok(()));
    assert_eq!(not_core, Err(SchedulerError::OnCoreThread));
}

#[test]
fn test_frame_payload_reaches_core_thread() {
    let core = start();

    let ptr = {
        let alloc = core.frame_alloc().unwrap();
        alloc.stage([1.5f32, 2.5, 3.5, 4.5])
    };
    let frames = Arc::clone(core.frames());
    let op = core
        .queue_return_command(
            move || frames.read(&ptr).map_err(|e| CommandError::Failed(e.to_string())),
            QueueFlags::BLOCK_UNTIL_COMPLETE,
        )
        .unwrap();
    assert_eq!(op.wait(), Ok([1.5, 2.5, 3.5, 4.5]));

    core.update().unwrap();
    assert!(core.frames().read(&ptr).is_ok());
    core.update().unwrap();
    assert!(core.frames().read(&ptr).is_err());
}

#[test]
fn test_update_rejected_off_sim_thread() {
    let core = start();
    let other = Arc::clone(&core);
    let result = thread::spawn(move || other.update()).join().unwrap();
    assert_eq!(result, Err(SchedulerError::NotSimThread));
}

#[test]
fn test_worker_slot_returned_on_shutdown() {
    let slots = Arc::new(WorkerSlots::new(4));
    let budget: Arc<dyn WorkerBudget> = Arc::clone(&slots) as Arc<dyn WorkerBudget>;
    let core = CoreThread::with_worker_budget(SchedulerConfig::threaded(), budget).unwrap();

    for _ in 0..5 {
        core.queue_command(|| {}, QueueFlags::empty()).unwrap();
        core.submit(true).unwrap();
    }
    core.shutdown();

    assert_eq!(slots.available(), 4);
}

#[test]
fn test_submit_after_shutdown_drops_commands() {
    let core = start();
    core.queue_command(|| {}, QueueFlags::empty()).unwrap();
    core.shutdown();
    assert_eq!(core.state(), RunState::Stopped);

    core.queue_command(|| {}, QueueFlags::empty()).unwrap();
    assert_eq!(core.submit(true), Err(SchedulerError::ShutDown));
    assert_eq!(core.stats().commands_dropped, 2);
}

#[test]
fn test_panicking_command_releases_waiters() {
    let core = start();
    core.queue_command(|| panic!("device lost"), QueueFlags::empty())
        .unwrap();

    assert_eq!(core.submit(true), Err(SchedulerError::ShutDown));
    core.shutdown();
    assert_eq!(core.state(), RunState::Stopped);
}

#[test]
fn test_last_reference_dropped_on_core_thread() {
    let slots = Arc::new(WorkerSlots::new(2));
    let budget: Arc<dyn WorkerBudget> = Arc::clone(&slots) as Arc<dyn WorkerBudget>;
    let core = Arc::new(
        CoreThread::with_worker_budget(SchedulerConfig::threaded(), budget).unwrap(),
    );

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let held = Arc::clone(&core);
    core.queue_command(
        move || {
            let _ = release_rx.recv();
            drop(held);
        },
        QueueFlags::INTERNAL_QUEUE,
    )
    .unwrap();

    drop(core);
    release_tx.send(()).unwrap();

    // The exiting loop drops the last handle on the budget. An idle loop
    // would keep it alive forever.
    let mut waited = Duration::ZERO;
    while Arc::strong_count(&slots) > 1 {
        assert!(waited < Duration::from_secs(5), "core thread never exited");
        thread::sleep(Duration::from_millis(5));
        waited += Duration::from_millis(5);
    }
    assert_eq!(slots.available(), 2);
}
