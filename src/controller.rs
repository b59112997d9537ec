//! Lifecycle authority for one buffer and its worker pools.
//!
//! The controller is a two-state machine (STOPPED, RUNNING). `start` and `stop` are serialised on
//! a lifecycle lock so two pools can never overlap. Every run's state lives in a [`Run`] behind an
//! `RwLock<Option<Arc<Run>>>`: status reads and manual inserts clone the `Arc` and never contend
//! with the lifecycle lock, and the last run stays readable after it has been stopped.

use crate::buffer::{BufferSnapshot, PriorityBoundedBuffer};
use crate::config::{SystemConfig, WorkerTiming};
use crate::error::{BufferError, ControllerError};
use crate::events::{EventBus, SystemEvent, WorkerRole};
use crate::item::{ItemSource, PriorityItem};
use crate::metrics::{MetricsCollector, Throughput, WaitSummary};
use crate::priority::Priority;
use crate::worker::{
    spawn_consumer, spawn_producer, ConsumerWorker, PriorityDistribution, ProducerWorker,
    StopToken, WorkerHandle, WorkerSummary,
};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Read-only view returned by [`SystemController::get_status`].
///
/// When no run has ever been started, counts are zero and the optional sections are `None`.
/// After a stop, the last run's counts and snapshot are kept with `running = false`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub producer_count: usize,
    pub active_producer_count: usize,
    pub consumer_count: usize,
    pub active_consumer_count: usize,
    pub config: Option<SystemConfig>,
    pub buffer: Option<BufferSnapshot>,
    pub wait_stats: Vec<WaitSummary>,
    pub throughput: Option<Throughput>,
}

/// Final accounting returned by a successful [`SystemController::stop`].
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub workers: Vec<WorkerSummary>,
    pub snapshot: BufferSnapshot,
    pub wait_stats: Vec<WaitSummary>,
    pub throughput: Throughput,
}

impl StopReport {
    /// Total items handled by workers of `role`.
    pub fn items_by(&self, role: WorkerRole) -> u64 {
        self.workers
            .iter()
            .filter(|w| w.role == role)
            .map(|w| w.items)
            .sum()
    }
}

/// State of one start/stop cycle.
#[derive(Debug)]
struct Run {
    config: SystemConfig,
    buffer: Arc<PriorityBoundedBuffer>,
    stop: StopToken,
    metrics: Arc<MetricsCollector>,
    running: AtomicBool,
    started: Instant,
    stopped_at: Mutex<Option<Instant>>,
    producers_alive: Vec<Arc<AtomicBool>>,
    consumers_alive: Vec<Arc<AtomicBool>>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl Run {
    fn new(
        config: SystemConfig,
        buffer: Arc<PriorityBoundedBuffer>,
        stop: StopToken,
        metrics: Arc<MetricsCollector>,
        workers: Vec<WorkerHandle>,
    ) -> Self {
        let liveness = |role| {
            workers
                .iter()
                .filter(|w| w.role() == role)
                .map(WorkerHandle::liveness)
                .collect::<Vec<_>>()
        };
        Self {
            producers_alive: liveness(WorkerRole::Producer),
            consumers_alive: liveness(WorkerRole::Consumer),
            config,
            buffer,
            stop,
            metrics,
            running: AtomicBool::new(true),
            started: Instant::now(),
            stopped_at: Mutex::new(None),
            workers: Mutex::new(workers),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn elapsed(&self) -> Duration {
        match *self.stopped_at.lock() {
            Some(stopped) => stopped.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }

    fn throughput(&self, snapshot: &BufferSnapshot) -> Throughput {
        Throughput::over(
            self.elapsed(),
            snapshot.total_produced,
            snapshot.total_consumed,
        )
    }

    fn status(&self) -> SystemStatus {
        let alive = |flags: &[Arc<AtomicBool>]| {
            flags
                .iter()
                .filter(|flag| flag.load(Ordering::Acquire))
                .count()
        };
        let snapshot = self.buffer.snapshot();
        SystemStatus {
            running: self.is_running(),
            producer_count: self.producers_alive.len(),
            active_producer_count: alive(&self.producers_alive),
            consumer_count: self.consumers_alive.len(),
            active_consumer_count: alive(&self.consumers_alive),
            config: Some(self.config.clone()),
            throughput: Some(self.throughput(&snapshot)),
            buffer: Some(snapshot),
            wait_stats: self.metrics.wait_summaries(),
        }
    }
}

/// Owns the buffer and worker pools and exposes the control entry points.
#[derive(Debug)]
pub struct SystemController {
    lifecycle: Mutex<()>,
    current: RwLock<Option<Arc<Run>>>,
    events: Arc<EventBus>,
    timing: WorkerTiming,
    distribution: PriorityDistribution,
}

impl Default for SystemController {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemController {
    /// Controller with default worker timing and uniform priorities.
    pub fn new() -> Self {
        Self::with_timing(WorkerTiming::default())
    }

    pub fn with_timing(timing: WorkerTiming) -> Self {
        Self {
            lifecycle: Mutex::new(()),
            current: RwLock::new(None),
            events: Arc::new(EventBus::new()),
            timing,
            distribution: PriorityDistribution::default(),
        }
    }

    /// Replace the priority distribution used by producers of future runs.
    pub fn with_distribution(mut self, distribution: PriorityDistribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Subscribe to buffer and lifecycle events. Subscriptions survive restarts.
    pub fn subscribe(&self, capacity: usize) -> Receiver<SystemEvent> {
        self.events.subscribe(capacity)
    }

    pub fn is_running(&self) -> bool {
        self.current_run().is_some_and(|run| run.is_running())
    }

    fn current_run(&self) -> Option<Arc<Run>> {
        self.current.read().clone()
    }

    /// Validate `config`, build a fresh buffer and spawn both worker pools.
    ///
    /// Consumers are spawned before producers. If any thread fails to spawn, the workers already
    /// started are stopped and joined, and the controller stays STOPPED.
    ///
    /// # Arguments
    /// * `config` - Pool sizes, per-producer quota and buffer capacity for the new run
    ///
    /// # Returns
    /// `Ok(())` once every worker is running. `InvalidConfig` and `AlreadyRunning` leave the
    /// controller untouched; `Spawn` reports an OS thread failure after rollback.
    pub fn start(&self, config: SystemConfig) -> Result<(), ControllerError> {
        // Reject bad input before taking the lifecycle lock
        if let Err(err) = config.validate() {
            warn!(%err, "rejected start request");
            return Err(err);
        }

        let _lifecycle = self.lifecycle.lock();
        if self.is_running() {
            warn!("start requested while already running");
            return Err(ControllerError::AlreadyRunning);
        }

        // Every run gets a fresh buffer and its own metrics
        let buffer = Arc::new(PriorityBoundedBuffer::with_events(
            config.buffer_size,
            self.events.clone(),
        ));
        let stop = StopToken::new();
        let metrics = Arc::new(MetricsCollector::default());

        let workers = match self.spawn_pools(&config, &buffer, &stop, &metrics) {
            Ok(workers) => workers,
            Err((err, spawned)) => {
                warn!(%err, "worker spawn failed, rolling back");
                stop.stop();
                buffer.close();
                for handle in spawned {
                    handle.join();
                }
                return Err(ControllerError::Spawn(err));
            }
        };

        // Publish the run; status readers see it from here on
        let run = Arc::new(Run::new(config.clone(), buffer, stop, metrics, workers));
        *self.current.write() = Some(run);
        info!(
            producers = config.num_producers,
            consumers = config.num_consumers,
            items_per_producer = config.items_per_producer,
            buffer_size = config.buffer_size,
            "system started"
        );
        self.events.publish(SystemEvent::SystemStarted { config });
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn spawn_pools(
        &self,
        config: &SystemConfig,
        buffer: &Arc<PriorityBoundedBuffer>,
        stop: &StopToken,
        metrics: &Arc<MetricsCollector>,
    ) -> Result<Vec<WorkerHandle>, (std::io::Error, Vec<WorkerHandle>)> {
        let mut workers = Vec::with_capacity(config.num_producers + config.num_consumers);

        for id in 1..=config.num_consumers {
            let worker = ConsumerWorker {
                id,
                buffer: buffer.clone(),
                stop: stop.clone(),
                poll_timeout: self.timing.consumer_poll(),
                processing_time: self.timing.processing_time,
                metrics: metrics.clone(),
            };
            match spawn_consumer(worker, self.events.clone()) {
                Ok(handle) => workers.push(handle),
                Err(err) => return Err((err, workers)),
            }
        }

        for id in 1..=config.num_producers {
            let worker = ProducerWorker {
                id,
                items: config.items_per_producer,
                buffer: buffer.clone(),
                distribution: self.distribution.clone(),
                delay: self.timing.producer_delay,
                stop: stop.clone(),
            };
            match spawn_producer(worker, self.events.clone()) {
                Ok(handle) => workers.push(handle),
                Err(err) => return Err((err, workers)),
            }
        }

        Ok(workers)
    }

    /// Signal consumers, close the buffer and join every worker.
    ///
    /// Items still queued at close time are not consumed; they remain in the returned snapshot.
    /// Returns within roughly one consumer poll interval plus one in-flight processing time.
    ///
    /// # Returns
    /// A [`StopReport`] with per-worker counts and the final snapshot, or `NotRunning` if no run
    /// is active (including when a concurrent `stop` got there first)
    pub fn stop(&self) -> Result<StopReport, ControllerError> {
        let _lifecycle = self.lifecycle.lock();
        let run = match self.current_run() {
            Some(run) if run.is_running() => run,
            _ => {
                warn!("stop requested while not running");
                return Err(ControllerError::NotRunning);
            }
        };

        info!("stopping system");
        // Flip to STOPPED first so manual inserts are refused from now on
        run.running.store(false, Ordering::Release);
        // Stop signal ends producer delays; close wakes every worker blocked on the buffer
        run.stop.stop();
        run.buffer.close();

        // Workers exit promptly once woken; join them all before reporting
        let handles = std::mem::take(&mut *run.workers.lock());
        let workers: Vec<WorkerSummary> = handles.into_iter().map(WorkerHandle::join).collect();
        *run.stopped_at.lock() = Some(Instant::now());

        let snapshot = run.buffer.snapshot();
        let report = StopReport {
            throughput: run.throughput(&snapshot),
            wait_stats: run.metrics.wait_summaries(),
            snapshot: snapshot.clone(),
            workers,
        };
        info!(
            produced = snapshot.total_produced,
            consumed = snapshot.total_consumed,
            remaining = snapshot.size,
            "system stopped"
        );
        self.events.publish(SystemEvent::SystemStopped { snapshot });
        Ok(report)
    }

    /// Insert an item tagged as manual, waiting at most the configured manual timeout for space.
    ///
    /// Returns the new item's id. The insert is all-or-nothing: on `BufferFull` nothing changed.
    pub fn add_manual_item(
        &self,
        priority: Priority,
        payload: impl Into<String>,
    ) -> Result<u64, ControllerError> {
        let run = match self.current_run() {
            Some(run) if run.is_running() => run,
            _ => return Err(ControllerError::NotRunning),
        };

        let item = PriorityItem::new(priority, payload, ItemSource::Manual);
        let item_id = item.id();
        match run.buffer.put(item, Some(self.timing.manual_put_timeout())) {
            Ok(()) => {
                info!(item_id, %priority, "manual item added");
                Ok(item_id)
            }
            Err(BufferError::TimedOut) => {
                warn!(%priority, "manual item rejected, buffer full");
                Err(ControllerError::BufferFull)
            }
            Err(BufferError::Closed) => Err(ControllerError::NotRunning),
        }
    }

    /// Cheap, non-blocking status read, valid in any state.
    pub fn get_status(&self) -> SystemStatus {
        match self.current_run() {
            Some(run) => run.status(),
            None => SystemStatus {
                running: false,
                producer_count: 0,
                active_producer_count: 0,
                consumer_count: 0,
                active_consumer_count: 0,
                config: None,
                buffer: None,
                wait_stats: Vec::new(),
                throughput: None,
            },
        }
    }

    /// Poll the status until `condition` holds or `timeout` elapses. Returns whether it held.
    ///
    /// A timeout too large to represent as a deadline waits indefinitely.
    pub fn wait_until<F>(&self, timeout: Duration, poll: Duration, mut condition: F) -> bool
    where
        F: FnMut(&SystemStatus) -> bool,
    {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if condition(&self.get_status()) {
                return true;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return false;
            }
            std::thread::sleep(poll);
        }
    }
}

impl Drop for SystemController {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(buffer_size: usize) -> SystemConfig {
        SystemConfig {
            num_producers: 1,
            num_consumers: 1,
            items_per_producer: 5,
            buffer_size,
        }
    }

    /// Install a RUNNING run with no workers, so nothing drains or fills the buffer.
    fn install_idle_run(controller: &SystemController, config: SystemConfig) -> Arc<Run> {
        let run = Arc::new(Run::new(
            config.clone(),
            Arc::new(PriorityBoundedBuffer::new(config.buffer_size)),
            StopToken::new(),
            Arc::new(MetricsCollector::default()),
            Vec::new(),
        ));
        *controller.current.write() = Some(run.clone());
        run
    }

    #[test]
    fn status_before_first_start_is_empty() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        let status = controller.get_status();
        assert!(!status.running);
        assert_eq!(status.producer_count, 0);
        assert!(status.buffer.is_none());
        assert!(status.throughput.is_none());
    }

    #[test]
    fn invalid_config_is_rejected_without_state_change() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        let err = controller
            .start(SystemConfig {
                num_producers: 0,
                ..small_config(2)
            })
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(msg) if msg.contains("num_producers")));
        assert!(!controller.is_running());
        assert!(controller.get_status().config.is_none());
    }

    #[test]
    fn start_twice_reports_already_running() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        controller.start(small_config(4)).unwrap();
        let before = controller.get_status();

        assert!(matches!(
            controller.start(small_config(9)),
            Err(ControllerError::AlreadyRunning)
        ));
        let after = controller.get_status();
        assert_eq!(after.config, before.config);
        assert_eq!(after.buffer.map(|b| b.capacity), Some(4));

        controller.stop().unwrap();
    }

    #[test]
    fn stop_while_stopped_reports_not_running() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        assert!(matches!(controller.stop(), Err(ControllerError::NotRunning)));

        controller.start(small_config(2)).unwrap();
        controller.stop().unwrap();
        assert!(matches!(controller.stop(), Err(ControllerError::NotRunning)));
    }

    #[test]
    fn manual_add_requires_running() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        assert!(matches!(
            controller.add_manual_item(Priority::High, "x"),
            Err(ControllerError::NotRunning)
        ));
    }

    #[test]
    fn manual_adds_beyond_capacity_report_buffer_full() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        let capacity = 3;
        let run = install_idle_run(&controller, small_config(capacity));

        let results: Vec<_> = (0..=capacity)
            .map(|i| controller.add_manual_item(Priority::Medium, format!("manual-{i}")))
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), capacity);
        assert!(matches!(results[capacity], Err(ControllerError::BufferFull)));
        let snapshot = run.buffer.snapshot();
        assert_eq!(snapshot.size, capacity);
        assert_eq!(snapshot.total_produced, capacity as u64);
    }

    #[test]
    fn manual_add_after_close_reports_not_running() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        let run = install_idle_run(&controller, small_config(2));
        run.buffer.close();
        assert!(matches!(
            controller.add_manual_item(Priority::Low, "late"),
            Err(ControllerError::NotRunning)
        ));
    }

    #[test]
    fn status_tracks_finished_producers() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        controller
            .start(SystemConfig {
                num_producers: 2,
                num_consumers: 2,
                items_per_producer: 3,
                buffer_size: 2,
            })
            .unwrap();

        assert!(controller.wait_until(Duration::from_secs(5), Duration::from_millis(5), |s| {
            s.active_producer_count == 0
        }));
        let status = controller.get_status();
        assert!(status.running);
        assert_eq!(status.producer_count, 2);
        assert_eq!(status.consumer_count, 2);
        assert_eq!(status.active_consumer_count, 2);

        let report = controller.stop().unwrap();
        assert_eq!(report.items_by(WorkerRole::Producer), 6);
        assert_eq!(report.snapshot.total_produced, 6);
        assert_eq!(
            report.items_by(WorkerRole::Consumer),
            report.snapshot.total_consumed
        );
        assert!(report.workers.iter().all(|w| w.clean_exit));
    }

    #[test]
    fn status_after_stop_keeps_last_run() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        controller.start(small_config(3)).unwrap();
        let report = controller.stop().unwrap();

        let status = controller.get_status();
        assert!(!status.running);
        assert_eq!(status.active_producer_count, 0);
        assert_eq!(status.active_consumer_count, 0);
        assert_eq!(status.buffer.as_ref(), Some(&report.snapshot));
        assert!(status.buffer.is_some_and(|b| b.closed));
    }

    #[test]
    fn controller_restarts_with_fresh_buffer() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        controller.start(small_config(2)).unwrap();
        controller.stop().unwrap();

        controller.start(small_config(5)).unwrap();
        let snapshot = controller.get_status().buffer.unwrap();
        assert_eq!(snapshot.capacity, 5);
        assert!(!snapshot.closed);
        controller.stop().unwrap();
    }

    #[test]
    fn lifecycle_events_are_published() {
        let controller = SystemController::with_timing(WorkerTiming::immediate());
        let rx = controller.subscribe(4096);
        controller.start(small_config(2)).unwrap();
        controller.stop().unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, SystemEvent::SystemStarted { .. })));
        assert!(matches!(events.last(), Some(SystemEvent::SystemStopped { .. })));
    }
}
