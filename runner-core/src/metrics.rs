//! Per-stage latency observability for the execution pipeline

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Retained completion records
const RING_CAPACITY: usize = 500;

/// Records slower than this land in the slow log, milliseconds
const SLOW_THRESHOLD_MS: u64 = 1000;

/// How many slow records the stats expose
const SLOW_LOG_LEN: usize = 50;

/// Per-completion stage timings
#[derive(Debug, Clone, Serialize)]
pub struct PipelineTimings {
    pub queue_ms: u64,
    pub network_ms: u64,
    pub container_ms: u64,
    pub file_transfer_ms: u64,
    pub execution_ms: u64,
    pub cleanup_ms: u64,
    pub total_ms: u64,
    pub container_reused: bool,
    pub language: String,
}

/// Percentiles and mean for one stage
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StageStats {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub avg: u64,
}

/// Per-language aggregate
#[derive(Debug, Clone, Serialize)]
pub struct LanguageStats {
    pub count: usize,
    pub avg_total_ms: u64,
}

/// Stats snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub count: usize,
    /// Percentage of completions served by a warm container
    pub reuse_rate: f64,
    pub by_stage: HashMap<&'static str, StageStats>,
    pub by_language: HashMap<String, LanguageStats>,
    /// Most recent completions whose total exceeded the slow threshold
    pub slow_executions: Vec<PipelineTimings>,
}

/// Ring buffer of recent completions plus derived stats
#[derive(Default)]
pub struct PipelineMetrics {
    records: Mutex<VecDeque<PipelineTimings>>,
}

const STAGES: &[(&str, fn(&PipelineTimings) -> u64)] = &[
    ("queue_ms", |t| t.queue_ms),
    ("network_ms", |t| t.network_ms),
    ("container_ms", |t| t.container_ms),
    ("file_transfer_ms", |t| t.file_transfer_ms),
    ("execution_ms", |t| t.execution_ms),
    ("cleanup_ms", |t| t.cleanup_ms),
    ("total_ms", |t| t.total_ms),
];

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completion, evicting the oldest past capacity
    pub fn record(&self, timings: PipelineTimings) {
        let mut records = self.records.lock();
        if records.len() == RING_CAPACITY {
            records.pop_front();
        }
        records.push_back(timings);
    }

    /// Snapshot: per-stage percentiles, reuse rate, per-language averages,
    /// and the slow log
    pub fn get_stats(&self) -> PipelineStats {
        let records = self.records.lock();
        let count = records.len();

        let mut by_stage = HashMap::new();
        for (name, extract) in STAGES {
            let mut values: Vec<u64> = records.iter().map(extract).collect();
            values.sort_unstable();
            by_stage.insert(*name, stage_stats(&values));
        }

        let mut by_language: HashMap<String, (usize, u64)> = HashMap::new();
        for record in records.iter() {
            let entry = by_language.entry(record.language.clone()).or_default();
            entry.0 += 1;
            entry.1 += record.total_ms;
        }
        let by_language = by_language
            .into_iter()
            .map(|(language, (count, total))| {
                (
                    language,
                    LanguageStats {
                        count,
                        avg_total_ms: total / count.max(1) as u64,
                    },
                )
            })
            .collect();

        let reused = records.iter().filter(|r| r.container_reused).count();
        let reuse_rate = if count == 0 {
            0.0
        } else {
            reused as f64 * 100.0 / count as f64
        };

        let slow_executions: Vec<PipelineTimings> = records
            .iter()
            .filter(|r| r.total_ms > SLOW_THRESHOLD_MS)
            .rev()
            .take(SLOW_LOG_LEN)
            .cloned()
            .collect();

        PipelineStats {
            count,
            reuse_rate,
            by_stage,
            by_language,
            slow_executions,
        }
    }

    /// The most recent `n` records, newest last
    pub fn recent(&self, n: usize) -> Vec<PipelineTimings> {
        let records = self.records.lock();
        records
            .iter()
            .skip(records.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    /// Drop all retained records
    pub fn reset(&self) {
        self.records.lock().clear();
    }

    /// A stopwatch for staging one submission's timings
    pub fn create_stopwatch(&self) -> Stopwatch {
        Stopwatch::start()
    }
}

fn stage_stats(sorted: &[u64]) -> StageStats {
    if sorted.is_empty() {
        return StageStats {
            p50: 0,
            p95: 0,
            p99: 0,
            avg: 0,
        };
    }
    let avg = sorted.iter().sum::<u64>() / sorted.len() as u64;
    StageStats {
        p50: percentile(sorted, 50.0),
        p95: percentile(sorted, 95.0),
        p99: percentile(sorted, 99.0),
        avg,
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Measures per-stage laps and the overall elapsed time
#[derive(Debug)]
pub struct Stopwatch {
    created: Instant,
    last: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            created: now,
            last: now,
        }
    }

    /// Milliseconds since the previous lap (or creation)
    pub fn lap(&mut self) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_millis() as u64;
        self.last = now;
        elapsed
    }

    /// Milliseconds since creation
    pub fn total(&self) -> u64 {
        self.created.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings(total_ms: u64, language: &str, reused: bool) -> PipelineTimings {
        PipelineTimings {
            queue_ms: 1,
            network_ms: 2,
            container_ms: 3,
            file_transfer_ms: 4,
            execution_ms: total_ms.saturating_sub(10),
            cleanup_ms: 0,
            total_ms,
            container_reused: reused,
            language: language.to_string(),
        }
    }

    #[test]
    fn test_empty_stats() {
        let metrics = PipelineMetrics::new();
        let stats = metrics.get_stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.reuse_rate, 0.0);
        assert_eq!(stats.by_stage["total_ms"].p99, 0);
        assert!(stats.slow_executions.is_empty());
    }

    #[test]
    fn test_percentiles() {
        let metrics = PipelineMetrics::new();
        for total in 1..=100 {
            metrics.record(timings(total, "python", false));
        }
        let stats = metrics.get_stats();
        let total = &stats.by_stage["total_ms"];
        assert_eq!(total.p50, 50);
        assert_eq!(total.p95, 95);
        assert_eq!(total.p99, 99);
        assert_eq!(total.avg, 50);
    }

    #[test]
    fn test_reuse_rate_and_by_language() {
        let metrics = PipelineMetrics::new();
        metrics.record(timings(10, "python", true));
        metrics.record(timings(20, "python", false));
        metrics.record(timings(40, "java", true));

        let stats = metrics.get_stats();
        assert!((stats.reuse_rate - 66.666).abs() < 0.01);
        assert_eq!(stats.by_language["python"].count, 2);
        assert_eq!(stats.by_language["python"].avg_total_ms, 15);
        assert_eq!(stats.by_language["java"].avg_total_ms, 40);
    }

    #[test]
    fn test_ring_capacity() {
        let metrics = PipelineMetrics::new();
        for total in 0..600 {
            metrics.record(timings(total, "python", false));
        }
        let stats = metrics.get_stats();
        assert_eq!(stats.count, 500);
        // The earliest 100 records were evicted
        assert_eq!(stats.by_stage["total_ms"].p50, 349);
    }

    #[test]
    fn test_slow_log_keeps_recent() {
        let metrics = PipelineMetrics::new();
        for total in 0..60 {
            metrics.record(timings(2000 + total, "python", false));
        }
        metrics.record(timings(5, "python", false));

        let stats = metrics.get_stats();
        assert_eq!(stats.slow_executions.len(), 50);
        // Most recent slow record first
        assert_eq!(stats.slow_executions[0].total_ms, 2059);
    }

    #[test]
    fn test_reset() {
        let metrics = PipelineMetrics::new();
        metrics.record(timings(10, "python", false));
        metrics.reset();
        assert_eq!(metrics.get_stats().count, 0);
    }

    #[test]
    fn test_stopwatch_laps() {
        let mut watch = Stopwatch::start();
        std::thread::sleep(std::time::Duration::from_millis(15));
        let lap = watch.lap();
        assert!(lap >= 10);
        let immediate = watch.lap();
        assert!(immediate <= lap);
        assert!(watch.total() >= lap);
    }
}
