use std::collections::VecDeque;
use std::time::Duration;

use paperdrop_protocol::{GlobalProgress, ProgressSnapshot};
use tokio::time::Instant;

/// Default sliding window for throughput.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Default cap on retained samples.
const DEFAULT_MAX_SAMPLES: usize = 100;

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of byte deltas.
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2),
            window_size: window_size.unwrap_or(DEFAULT_WINDOW),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    /// Records `bytes` transferred at `timestamp`.
    pub fn add_sample_at(&mut self, bytes: u64, timestamp: Instant) {
        self.samples.push_back(SpeedSample { bytes, timestamp });
        self.prune(timestamp);
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window_size) else {
            return;
        };
        while self
            .samples
            .front()
            .is_some_and(|sample| sample.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples or once the window has
    /// drained (a stalled transfer reports zero, not its old speed).
    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_second_at(Instant::now())
    }

    pub fn bytes_per_second_at(&self, now: Instant) -> f64 {
        let in_window: Vec<&SpeedSample> = self
            .samples
            .iter()
            .filter(|s| now.saturating_duration_since(s.timestamp) <= self.window_size)
            .collect();
        if in_window.len() < 2 {
            return 0.0;
        }

        let first = in_window[0];
        let last = in_window[in_window.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        // The first sample marks the window start; its bytes predate it.
        let total_bytes: u64 = in_window[1..].iter().map(|s| s.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        eta_for(remaining_bytes, self.bytes_per_second())
    }

    /// Clears all recorded samples.
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

fn eta_for(remaining_bytes: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Rolls per-chunk byte counts into a job snapshot.
///
/// Recomputed from scratch on every call; the only input that is not a
/// chunk record is the throughput window.
pub fn aggregate<I>(
    job_id: &str,
    bytes_total: u64,
    chunk_bytes_sent: I,
    speed: &SpeedCalculator,
) -> ProgressSnapshot
where
    I: IntoIterator<Item = u64>,
{
    let bytes_sent = chunk_bytes_sent.into_iter().sum::<u64>().min(bytes_total);
    let throughput = speed.bytes_per_second();
    let eta_secs = eta_for(bytes_total - bytes_sent, throughput).map(|d| d.as_secs_f64());

    ProgressSnapshot {
        job_id: job_id.to_string(),
        bytes_sent,
        bytes_total,
        throughput,
        eta_secs,
    }
}

/// Sums job snapshots into one figure for the whole pipeline.
///
/// Throughputs add up since jobs share the link concurrently; the ETA is the
/// remaining bytes over that combined rate.
pub fn aggregate_global<'a, I>(snapshots: I) -> GlobalProgress
where
    I: IntoIterator<Item = &'a ProgressSnapshot>,
{
    let mut global = GlobalProgress::default();
    for snapshot in snapshots {
        global.jobs += 1;
        global.bytes_sent += snapshot.bytes_sent;
        global.bytes_total += snapshot.bytes_total;
        global.throughput += snapshot.throughput;
    }
    let remaining = global.bytes_total.saturating_sub(global.bytes_sent);
    global.eta_secs = eta_for(remaining, global.throughput).map(|d| d.as_secs_f64());
    global
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_calculator_no_samples() {
        let calc = SpeedCalculator::new(None, None);
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn speed_calculator_single_sample() {
        let mut calc = SpeedCalculator::new(None, None);
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_calculator_steady_rate() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        let start = Instant::now();
        for i in 0..=4u64 {
            calc.add_sample_at(1000, start + Duration::from_secs(i));
        }
        // 4000 bytes after the window start over 4 seconds.
        let speed = calc.bytes_per_second_at(start + Duration::from_secs(4));
        assert!((speed - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn speed_calculator_window_drains_when_stalled() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(5)), None);
        let start = Instant::now();
        calc.add_sample_at(500, start);
        calc.add_sample_at(500, start + Duration::from_secs(1));
        assert!(calc.bytes_per_second_at(start + Duration::from_secs(1)) > 0.0);
        assert_eq!(calc.bytes_per_second_at(start + Duration::from_secs(30)), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_calculator_eta() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        calc.add_sample(0);
        tokio::time::advance(Duration::from_secs(1)).await;
        calc.add_sample(1000);

        let eta = calc.eta(10_000).unwrap();
        assert!((eta.as_secs_f64() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn speed_calculator_reset() {
        let mut calc = SpeedCalculator::new(None, None);
        calc.add_sample(100);
        calc.add_sample(200);
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_calculator_max_samples() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        assert!(calc.samples.len() <= 5);
    }

    #[test]
    fn aggregate_sums_chunks() {
        let calc = SpeedCalculator::default();
        let snap = aggregate("job", 100, [10, 20, 0, 5], &calc);
        assert_eq!(snap.job_id, "job");
        assert_eq!(snap.bytes_sent, 35);
        assert_eq!(snap.bytes_total, 100);
        assert_eq!(snap.throughput, 0.0);
        assert!(snap.eta_secs.is_none());
    }

    #[test]
    fn aggregate_never_exceeds_total() {
        let calc = SpeedCalculator::default();
        let snap = aggregate("job", 10, [8, 8], &calc);
        assert_eq!(snap.bytes_sent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_derives_eta_from_throughput() {
        let mut calc = SpeedCalculator::default();
        calc.add_sample(0);
        tokio::time::advance(Duration::from_secs(2)).await;
        calc.add_sample(400);

        let snap = aggregate("job", 1000, [400], &calc);
        assert!((snap.throughput - 200.0).abs() < 1e-6);
        assert!((snap.eta_secs.unwrap() - 3.0).abs() < 1e-6);
    }

    fn snapshot(job: &str, sent: u64, total: u64, throughput: f64) -> ProgressSnapshot {
        ProgressSnapshot {
            throughput,
            bytes_sent: sent,
            ..ProgressSnapshot::empty(job, total)
        }
    }

    #[test]
    fn global_sums_every_job() {
        let jobs = [
            snapshot("a", 100, 400, 50.0),
            snapshot("b", 200, 200, 0.0),
            snapshot("c", 0, 400, 150.0),
        ];
        let global = aggregate_global(&jobs);
        assert_eq!(global.jobs, 3);
        assert_eq!(global.bytes_sent, 300);
        assert_eq!(global.bytes_total, 1000);
        assert!((global.throughput - 200.0).abs() < 1e-9);
        // 700 bytes left at 200 B/s.
        assert!((global.eta_secs.unwrap() - 3.5).abs() < 1e-9);
    }

    #[test]
    fn global_of_nothing_is_empty() {
        let global = aggregate_global(&[]);
        assert_eq!(global, GlobalProgress::default());
        assert!(global.eta_secs.is_none());
    }

    #[test]
    fn global_without_throughput_has_no_eta() {
        let global = aggregate_global(&[snapshot("a", 10, 40, 0.0)]);
        assert_eq!(global.bytes_sent, 10);
        assert!(global.eta_secs.is_none());
    }
}
