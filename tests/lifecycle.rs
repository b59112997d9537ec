// Controller lifecycle driven end to end with real worker threads.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use priority_pipeline::config::{MillisRange, SystemConfig, WorkerTiming};
use priority_pipeline::controller::{SystemController, SystemStatus};
use priority_pipeline::error::ControllerError;
use priority_pipeline::events::{SystemEvent, WorkerRole};
use priority_pipeline::metrics::MAX_WINDOW_SAMPLES;
use priority_pipeline::priority::Priority;
use priority_pipeline::worker::PriorityDistribution;

const POLL: Duration = Duration::from_millis(5);

fn config(producers: usize, consumers: usize, items: usize, buffer_size: usize) -> SystemConfig {
    SystemConfig {
        num_producers: producers,
        num_consumers: consumers,
        items_per_producer: items,
        buffer_size,
    }
}

fn slow_consumers() -> WorkerTiming {
    WorkerTiming {
        processing_time: MillisRange::new(150, 150),
        ..WorkerTiming::immediate()
    }
}

#[test]
fn full_session_conserves_every_item() {
    let controller = SystemController::with_timing(WorkerTiming::immediate());
    controller.start(config(3, 2, 40, 5)).unwrap();

    assert!(controller.wait_until(Duration::from_secs(10), POLL, |s| {
        s.active_producer_count == 0 && s.buffer.as_ref().is_some_and(|b| b.size == 0)
    }));
    let report = controller.stop().unwrap();

    assert_eq!(report.snapshot.total_produced, 120);
    assert_eq!(report.snapshot.total_consumed, 120);
    assert_eq!(report.items_by(WorkerRole::Consumer), 120);
    let waited: u64 = report.wait_stats.iter().map(|w| w.item_count).sum();
    assert_eq!(waited, 120);
}

#[test]
fn stop_unblocks_producers_waiting_on_full_buffer() {
    let controller = SystemController::with_timing(slow_consumers());
    controller.start(config(4, 1, 50, 2)).unwrap();

    // Both slots taken and every producer parked on a full buffer.
    assert!(controller.wait_until(Duration::from_secs(5), POLL, |s| {
        s.buffer.as_ref().is_some_and(|b| b.size == b.capacity)
    }));
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    let report = controller.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    let snapshot = &report.snapshot;
    assert_eq!(snapshot.total_produced, report.items_by(WorkerRole::Producer));
    assert_eq!(snapshot.total_consumed, report.items_by(WorkerRole::Consumer));
    assert_eq!(
        snapshot.total_produced - snapshot.total_consumed,
        snapshot.size as u64
    );
    assert!(snapshot.total_produced < 200);
    assert!(report.workers.iter().all(|w| w.clean_exit));

    let status = controller.get_status();
    assert_eq!(status.active_producer_count, 0);
    assert_eq!(status.active_consumer_count, 0);
}

#[test]
fn stop_unblocks_idle_consumers() {
    let controller = SystemController::with_timing(WorkerTiming {
        consumer_poll_ms: 100,
        ..WorkerTiming::immediate()
    });
    controller.start(config(1, 4, 1, 4)).unwrap();
    assert!(controller.wait_until(Duration::from_secs(5), POLL, |s| {
        s.active_producer_count == 0 && s.buffer.as_ref().is_some_and(|b| b.size == 0)
    }));

    let started = Instant::now();
    let report = controller.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.snapshot.total_consumed, 1);
}

#[test]
fn concurrent_starts_admit_exactly_one() {
    let controller = Arc::new(SystemController::with_timing(slow_consumers()));
    let gate = Arc::new(Barrier::new(8));

    let attempts: Vec<_> = (0..8)
        .map(|i| {
            let controller = controller.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                gate.wait();
                controller.start(config(1, 1, 5, 2 + i))
            })
        })
        .collect();
    let results: Vec<_> = attempts.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, ControllerError::AlreadyRunning)));

    let status = controller.get_status();
    assert_eq!(status.producer_count, 1);
    assert_eq!(status.consumer_count, 1);
    controller.stop().unwrap();
}

#[test]
fn concurrent_stops_succeed_once() {
    let controller = Arc::new(SystemController::with_timing(WorkerTiming::immediate()));
    controller.start(config(2, 2, 10, 3)).unwrap();
    let gate = Arc::new(Barrier::new(4));

    let attempts: Vec<_> = (0..4)
        .map(|_| {
            let controller = controller.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                gate.wait();
                controller.stop().map(|_| ())
            })
        })
        .collect();
    let results: Vec<_> = attempts.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, ControllerError::NotRunning)));
}

#[test]
fn repeated_cycles_use_fresh_buffers() {
    let controller = SystemController::with_timing(WorkerTiming::immediate());
    for cycle in 1..=5 {
        controller.start(config(1, 1, cycle, cycle)).unwrap();
        assert!(controller.wait_until(Duration::from_secs(5), POLL, |s| {
            s.active_producer_count == 0
        }));
        let report = controller.stop().unwrap();
        assert_eq!(report.snapshot.capacity, cycle);
        assert_eq!(report.snapshot.total_produced, cycle as u64);
    }
}

#[test]
fn manual_items_are_counted_with_producer_items() {
    let controller = SystemController::with_timing(WorkerTiming {
        manual_put_timeout_ms: 2_000,
        ..WorkerTiming::immediate()
    })
    .with_distribution(PriorityDistribution::Fixed(Priority::Low));
    controller.start(config(2, 2, 10, 4)).unwrap();

    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(controller.add_manual_item(Priority::Critical, format!("manual-{i}")).unwrap());
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    assert!(controller.wait_until(Duration::from_secs(10), POLL, |s| {
        s.active_producer_count == 0 && s.buffer.as_ref().is_some_and(|b| b.size == 0)
    }));
    let report = controller.stop().unwrap();
    assert_eq!(report.snapshot.total_produced, 30);
    assert_eq!(report.snapshot.produced_by_priority[Priority::Critical], 10);
    assert_eq!(report.snapshot.produced_by_priority[Priority::Low], 20);
    assert_eq!(report.items_by(WorkerRole::Producer), 20);
}

#[test]
fn subscribers_observe_the_whole_run() {
    let controller = SystemController::with_timing(WorkerTiming::immediate());
    let events = controller.subscribe(100_000);
    controller.start(config(1, 1, 5, 2)).unwrap();
    assert!(controller.wait_until(Duration::from_secs(5), POLL, |s| {
        s.active_producer_count == 0 && s.buffer.as_ref().is_some_and(|b| b.size == 0)
    }));
    controller.stop().unwrap();

    let events: Vec<SystemEvent> = events.try_iter().collect();
    let changes = events
        .iter()
        .filter(|e| matches!(e, SystemEvent::BufferChanged { .. }))
        .count();
    assert_eq!(changes, 10);
    let finished = events
        .iter()
        .filter(|e| matches!(e, SystemEvent::WorkerFinished { .. }))
        .count();
    assert_eq!(finished, 2);
    assert!(matches!(events.last(), Some(SystemEvent::SystemStopped { .. })));
}

#[test]
fn status_wait_windows_stay_bounded_after_heavy_run() {
    let controller = SystemController::with_timing(WorkerTiming::immediate());
    controller.start(config(4, 4, 5_000, 32)).unwrap();
    let recorded = |s: &SystemStatus| s.wait_stats.iter().map(|w| w.item_count).sum::<u64>();
    assert!(controller.wait_until(Duration::from_secs(30), POLL, |s| recorded(s) == 20_000));

    let status = controller.get_status();
    assert!(status
        .wait_stats
        .iter()
        .all(|w| w.window_count <= MAX_WINDOW_SAMPLES));
    controller.stop().unwrap();
}
