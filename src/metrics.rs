//! Wait-time and throughput statistics.
//!
//! Consumers record how long each item sat between creation and dequeue. Measurements are kept
//! per priority in a time window (10 seconds by default) so a burst long ago does not skew the
//! current picture. The window is also capped at [`MAX_WINDOW_SAMPLES`] entries, so summarising
//! it costs the same under any load. Summaries are computed on demand outside the collector lock.

use crate::priority::{Priority, PriorityTable};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default history window for wait-time measurements.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Most recent measurements kept per priority, regardless of the time window.
pub const MAX_WINDOW_SAMPLES: usize = 4096;

#[derive(Debug, Clone)]
struct WaitMeasurement {
    wait_us: f64,
    recorded_at: Instant,
}

/// Rolling wait-time history for one priority class.
#[derive(Debug, Clone)]
pub struct WaitMetrics {
    pub priority: Priority,
    /// All-time number of recorded items (not windowed).
    pub item_count: u64,
    waits: VecDeque<WaitMeasurement>,
    pub time_window: Duration,
}

impl WaitMetrics {
    pub fn new(priority: Priority, time_window: Duration) -> Self {
        Self {
            priority,
            item_count: 0,
            waits: VecDeque::with_capacity(1024),
            time_window,
        }
    }

    /// Record one wait measurement and evict entries older than the window or beyond the cap.
    pub fn record_wait(&mut self, wait: Duration) {
        self.record_wait_at(wait, Instant::now());
    }

    fn record_wait_at(&mut self, wait: Duration, now: Instant) {
        self.item_count += 1;
        self.waits.push_back(WaitMeasurement {
            wait_us: wait.as_secs_f64() * 1_000_000.0,
            recorded_at: now,
        });
        if self.waits.len() > MAX_WINDOW_SAMPLES {
            self.waits.pop_front();
        }
        self.evict_before(now);
    }

    /// Drop measurements that fell out of the window, even when no new items arrive.
    pub fn cleanup_old_measurements(&mut self) {
        self.evict_before(Instant::now());
    }

    fn evict_before(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.time_window).unwrap_or(now);
        while let Some(front) = self.waits.front() {
            if front.recorded_at < cutoff {
                self.waits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Measurements currently inside the window.
    pub fn window_len(&self) -> usize {
        self.waits.len()
    }

    /// Summarise the window: sorts once and extracts every percentile from the sorted copy.
    pub fn summary(&self) -> WaitSummary {
        if self.waits.is_empty() {
            return WaitSummary {
                priority: self.priority,
                item_count: self.item_count,
                ..WaitSummary::empty(self.priority)
            };
        }

        let mut sorted: Vec<f64> = self.waits.iter().map(|m| m.wait_us).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let len = sorted.len();
        let percentile = |p: f64| {
            let idx = ((len as f64 * p / 100.0).ceil() as usize).saturating_sub(1);
            Duration::from_secs_f64(sorted[idx.min(len - 1)] / 1_000_000.0)
        };
        let mean = sorted.iter().sum::<f64>() / len as f64;

        WaitSummary {
            priority: self.priority,
            item_count: self.item_count,
            window_count: len,
            avg_wait: Duration::from_secs_f64(mean / 1_000_000.0),
            min_wait: Some(Duration::from_secs_f64(sorted[0] / 1_000_000.0)),
            max_wait: Some(Duration::from_secs_f64(sorted[len - 1] / 1_000_000.0)),
            p50: Some(percentile(50.0)),
            p95: Some(percentile(95.0)),
            p99: Some(percentile(99.0)),
        }
    }
}

/// Wait-time summary emitted to observers. Durations serialise as fractional milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitSummary {
    pub priority: Priority,
    pub item_count: u64,
    pub window_count: usize,
    #[serde(with = "duration_millis")]
    pub avg_wait: Duration,
    #[serde(with = "duration_millis_option")]
    pub min_wait: Option<Duration>,
    #[serde(with = "duration_millis_option")]
    pub max_wait: Option<Duration>,
    #[serde(with = "duration_millis_option")]
    pub p50: Option<Duration>,
    #[serde(with = "duration_millis_option")]
    pub p95: Option<Duration>,
    #[serde(with = "duration_millis_option")]
    pub p99: Option<Duration>,
}

impl WaitSummary {
    fn empty(priority: Priority) -> Self {
        Self {
            priority,
            item_count: 0,
            window_count: 0,
            avg_wait: Duration::ZERO,
            min_wait: None,
            max_wait: None,
            p50: None,
            p95: None,
            p99: None,
        }
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64() * 1_000.0)
    }
}

mod duration_millis_option {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_secs_f64() * 1_000.0)),
            None => serializer.serialize_none(),
        }
    }
}

/// Items per second over a run, for the produced and consumed totals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Throughput {
    pub elapsed_secs: f64,
    pub produced_per_sec: f64,
    pub consumed_per_sec: f64,
}

impl Throughput {
    /// Rates over a fixed elapsed time, e.g. a run that has already stopped.
    pub fn over(elapsed: Duration, total_produced: u64, total_consumed: u64) -> Self {
        let elapsed = elapsed.as_secs_f64();
        let rate = |count: u64| {
            if elapsed > 0.0 {
                count as f64 / elapsed
            } else {
                0.0
            }
        };
        Self {
            elapsed_secs: elapsed,
            produced_per_sec: rate(total_produced),
            consumed_per_sec: rate(total_consumed),
        }
    }
}

/// Per-priority wait metrics shared by all consumers of one run.
///
/// The lock is held only to push a measurement or to copy the (capped) windows; percentiles are
/// computed on the copy.
#[derive(Debug)]
pub struct MetricsCollector {
    waits: Mutex<PriorityTable<WaitMetrics>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl MetricsCollector {
    pub fn new(time_window: Duration) -> Self {
        Self {
            waits: Mutex::new(PriorityTable::from_fn(|priority| {
                WaitMetrics::new(priority, time_window)
            })),
        }
    }

    /// Record how long an item of `priority` waited before being consumed.
    pub fn record_wait(&self, priority: Priority, wait: Duration) {
        self.waits.lock()[priority].record_wait(wait);
    }

    /// Summaries for every priority, most urgent first.
    pub fn wait_summaries(&self) -> Vec<WaitSummary> {
        let tables = {
            let mut waits = self.waits.lock();
            for priority in Priority::ALL {
                waits[priority].cleanup_old_measurements();
            }
            waits.clone()
        };
        tables.iter().map(|(_, metrics)| metrics.summary()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metrics_summarise_to_none() {
        let metrics = WaitMetrics::new(Priority::High, DEFAULT_WINDOW);
        let summary = metrics.summary();
        assert_eq!(summary.item_count, 0);
        assert_eq!(summary.avg_wait, Duration::ZERO);
        assert!(summary.p50.is_none());
    }

    #[test]
    fn summary_reports_min_max_and_average() {
        let mut metrics = WaitMetrics::new(Priority::High, DEFAULT_WINDOW);
        metrics.record_wait(Duration::from_millis(10));
        metrics.record_wait(Duration::from_millis(20));
        metrics.record_wait(Duration::from_millis(30));

        let summary = metrics.summary();
        assert_eq!(summary.item_count, 3);
        assert_eq!(summary.window_count, 3);
        let min = summary.min_wait.unwrap();
        let max = summary.max_wait.unwrap();
        assert!(min >= Duration::from_micros(9_999) && min <= Duration::from_micros(10_001));
        assert!(max >= Duration::from_micros(29_999) && max <= Duration::from_micros(30_001));
        let avg = summary.avg_wait;
        assert!(
            avg >= Duration::from_millis(19) && avg <= Duration::from_millis(21),
            "average should be around 20ms, got {avg:?}"
        );
        let p50 = summary.p50.unwrap();
        assert!(p50 >= Duration::from_millis(19) && p50 <= Duration::from_millis(21));
    }

    #[test]
    fn old_measurements_leave_the_window() {
        let mut metrics = WaitMetrics::new(Priority::Low, Duration::from_millis(50));
        let long_ago = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
        metrics.record_wait_at(Duration::from_millis(5), long_ago);
        metrics.cleanup_old_measurements();
        assert_eq!(metrics.window_len(), 0);
        assert_eq!(metrics.item_count, 1);
    }

    #[test]
    fn collector_keeps_priorities_apart() {
        let collector = MetricsCollector::default();
        collector.record_wait(Priority::Critical, Duration::from_millis(1));
        collector.record_wait(Priority::Critical, Duration::from_millis(3));
        collector.record_wait(Priority::Low, Duration::from_millis(40));

        let summaries = collector.wait_summaries();
        assert_eq!(summaries.len(), 4);
        assert_eq!(summaries[0].priority, Priority::Critical);
        assert_eq!(summaries[0].item_count, 2);
        assert_eq!(summaries[1].item_count, 0);
        assert_eq!(summaries[3].item_count, 1);
    }

    #[test]
    fn window_is_capped_under_sustained_load() {
        let mut metrics = WaitMetrics::new(Priority::Medium, DEFAULT_WINDOW);
        // A slow burst first, then enough fast items to push it out of the window.
        for _ in 0..100 {
            metrics.record_wait(Duration::from_millis(500));
        }
        for _ in 0..MAX_WINDOW_SAMPLES {
            metrics.record_wait(Duration::from_millis(1));
        }

        assert_eq!(metrics.window_len(), MAX_WINDOW_SAMPLES);
        assert_eq!(metrics.item_count, (MAX_WINDOW_SAMPLES + 100) as u64);
        let summary = metrics.summary();
        assert_eq!(summary.window_count, MAX_WINDOW_SAMPLES);
        assert!(summary.max_wait.unwrap() < Duration::from_millis(2));
    }

    #[test]
    fn collector_summaries_stay_bounded() {
        let collector = MetricsCollector::default();
        for i in 0..3 * MAX_WINDOW_SAMPLES {
            collector.record_wait(Priority::ALL[i % 2], Duration::from_micros(i as u64));
        }
        let summaries = collector.wait_summaries();
        assert_eq!(summaries[0].window_count, MAX_WINDOW_SAMPLES);
        assert_eq!(summaries[1].window_count, MAX_WINDOW_SAMPLES);
        assert_eq!(summaries[0].item_count, (3 * MAX_WINDOW_SAMPLES / 2) as u64);
        assert_eq!(summaries[2].window_count, 0);
    }

    #[test]
    fn throughput_is_zero_without_items() {
        let rates = Throughput::over(Duration::from_secs(1), 0, 0);
        assert_eq!(rates.produced_per_sec, 0.0);
        assert_eq!(rates.consumed_per_sec, 0.0);
    }

    #[test]
    fn throughput_over_fixed_elapsed() {
        let rates = Throughput::over(Duration::from_secs(4), 20, 10);
        assert_eq!(rates.elapsed_secs, 4.0);
        assert_eq!(rates.produced_per_sec, 5.0);
        assert_eq!(rates.consumed_per_sec, 2.5);
        assert_eq!(Throughput::over(Duration::ZERO, 3, 3).produced_per_sec, 0.0);
    }
}
