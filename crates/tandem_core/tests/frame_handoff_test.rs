//! Integration test for handing frame payloads from a producer thread to a consumer thread.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;
use tandem_core::{FrameAllocs, FrameError, FramePtr};

#[test]
fn test_payloads_cross_threads_in_order() {
    let frames = Arc::new(FrameAllocs::new(4096, thread::current().id()));
    let (tx, rx) = unbounded::<FramePtr<[u32; 2]>>();

    let consumer = {
        let frames = Arc::clone(&frames);
        thread::spawn(move || {
            rx.iter()
                .map(|ptr| frames.read(&ptr).unwrap())
                .collect::<Vec<_>>()
        })
    };

    {
        let handle = frames.handle();
        for i in 0..100u32 {
            tx.send(handle.stage([i, i * 2])).unwrap();
        }
    }
    drop(tx);

    let received = consumer.join().unwrap();
    assert_eq!(received.len(), 100);
    for (i, pair) in received.iter().enumerate() {
        let i = u32::try_from(i).unwrap();
        assert_eq!(*pair, [i, i * 2]);
    }
}

#[test]
fn test_frame_pipeline_detects_late_reads() {
    let me = thread::current().id();
    let frames = FrameAllocs::new(4096, me);

    // Frame N: stage.
    let early = frames.handle().stage(1u64);
    // Frame N+1: consumer may still read frame N.
    frames.rotate(me, me);
    let late = frames.handle().stage(2u64);
    assert_eq!(frames.read(&early), Ok(1));

    // Frame N+2: frame N's arena is recycled.
    frames.rotate(me, me);
    assert!(matches!(frames.read(&early), Err(FrameError::Stale { .. })));
    assert_eq!(frames.read(&late), Ok(2));
}

#[test]
fn test_arena_capacity_settles() {
    let me = thread::current().id();
    let frames = FrameAllocs::new(256, me);

    let mut capacities = Vec::new();
    for _ in 0..6 {
        {
            let handle = frames.handle();
            for i in 0..64u64 {
                let _ = handle.stage([i; 4]);
            }
            capacities.push(handle.capacity());
        }
        frames.rotate(me, me);
    }

    // Each arena grows during its first frame, then reuses one coalesced block.
    assert_eq!(capacities[2], capacities[4]);
    assert_eq!(capacities[3], capacities[5]);
}
