// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Throughput and jitter measurement on the consumer side.

use crate::{
    device::{ConsumerModel, UpdateBatch, UpdateKind},
    errors::SamplerError,
    helpers::lock,
    stop::StopSignal,
};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::info;

/// Update-arrival timestamps collected over a fixed duration.
///
/// Timestamps are only appended while the window is open. Once [`close`](Self::close) has been
/// called, or the duration has elapsed, further updates are ignored.
#[derive(Clone, Debug)]
pub struct SampleWindow {
    inner: Arc<WindowInner>,
}

#[derive(Debug)]
struct WindowInner {
    opened: Instant,
    duration: Duration,
    closed: AtomicBool,
    timestamps: Mutex<Vec<Instant>>,
}

impl SampleWindow {
    /// Opens a window lasting `duration` from now.
    pub fn open(duration: Duration) -> Self {
        Self {
            inner: Arc::new(WindowInner {
                opened: Instant::now(),
                duration,
                closed: AtomicBool::new(false),
                timestamps: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The window's duration.
    pub fn duration(&self) -> Duration {
        self.inner.duration
    }

    /// Records `count` updates that arrived now.
    pub fn record(&self, count: usize) {
        self.record_at(Instant::now(), count);
    }

    fn record_at(&self, at: Instant, count: usize) {
        if self.inner.closed.load(Ordering::Acquire)
            || at.saturating_duration_since(self.inner.opened) >= self.inner.duration
        {
            return;
        }
        lock(&self.inner.timestamps).extend(std::iter::repeat_n(at, count));
    }

    /// Closes the window and returns the timestamps, sorted.
    pub fn close(&self) -> Vec<Instant> {
        self.inner.closed.store(true, Ordering::Release);
        let mut timestamps = lock(&self.inner.timestamps).clone();
        timestamps.sort_unstable();
        timestamps
    }
}

/// Throughput and interval statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThroughputStats {
    /// Updates received.
    pub count: usize,
    /// Updates per second over the sampling duration.
    pub rate_hz: f64,
    /// Mean interval between updates, in milliseconds.
    pub avg_ms: f64,
    /// Shortest interval, in milliseconds.
    pub min_ms: f64,
    /// Longest interval, in milliseconds.
    pub max_ms: f64,
}

impl ThroughputStats {
    /// Computes statistics from arrival timestamps collected over `duration`.
    ///
    /// Intervals are taken between consecutive sorted timestamps. Intervals of zero, from updates
    /// delivered in the same report, are discarded. With no positive intervals, the interval
    /// statistics are zero.
    pub fn from_timestamps(
        timestamps: &[Instant],
        duration: Duration,
    ) -> Result<Self, SamplerError> {
        if timestamps.is_empty() {
            return Err(SamplerError::NoDataReceived { duration });
        }

        let mut sorted = timestamps.to_vec();
        sorted.sort_unstable();
        let intervals: Vec<f64> = sorted
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs_f64() * 1000.0)
            .filter(|interval| *interval > 0.0)
            .collect();

        let (avg_ms, min_ms, max_ms) = if intervals.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = intervals.iter().sum();
            let min = intervals.iter().copied().fold(f64::INFINITY, f64::min);
            let max = intervals.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (sum / intervals.len() as f64, min, max)
        };

        Ok(Self {
            count: timestamps.len(),
            rate_hz: timestamps.len() as f64 / duration.as_secs_f64(),
            avg_ms,
            min_ms,
            max_ms,
        })
    }
}

/// Samples metric updates from a consumer model.
pub struct ThroughputSampler<'a> {
    model: &'a dyn ConsumerModel,
}

impl<'a> ThroughputSampler<'a> {
    /// Creates a sampler for `model`.
    pub fn new(model: &'a dyn ConsumerModel) -> Self {
        Self { model }
    }

    /// Records one timestamp per updated metric state for `duration`, then computes statistics.
    ///
    /// If `stop` is raised, sampling ends early and the statistics cover the shortened window.
    pub async fn sample(
        &self,
        duration: Duration,
        stop: &StopSignal,
    ) -> Result<ThroughputStats, SamplerError> {
        let window = SampleWindow::open(duration);
        let binding = self.model.bind(UpdateKind::Metric, {
            let window = window.clone();
            Arc::new(move |batch: &UpdateBatch| window.record(batch.states.len()))
        });

        info!("sampling updates for {}", humantime::format_duration(duration));
        let started = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = stop.stopped() => {}
        }
        let sampled = started.elapsed().min(duration);

        self.model.unbind(binding);
        let timestamps = window.close();
        if sampled.is_zero() {
            return Err(SamplerError::NoDataReceived { duration });
        }
        ThroughputStats::from_timestamps(&timestamps, sampled)
    }
}
