// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fault injection against the reference provider.
//!
//! [`FaultInjector::run`] drives the provider for a fixed duration, on a fixed tick. Every tick it
//! writes legitimate vitals. On a sub-cadence of ticks it also writes a floating-point value
//! where the model requires a fixed-point decimal, and every few seconds it takes the provider
//! and discovery down for a short outage.

use crate::{
    config::FaultSettings,
    device::{MetricValue, Transaction, handles},
    errors::one_line,
    provider::{ReferenceProvider, VitalSigns},
    stop::{StopReason, StopSignal},
};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What the fault injector did.
///
/// Returned by [`FaultInjector::run`] once the loop is over.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FaultCounters {
    /// Wrongly-typed writes that the model rejected.
    pub bad_value_writes: u64,
    /// Wrongly-typed writes that the model accepted.
    pub uncaught_bad_values: u64,
    /// Simulated outages.
    pub reconnects: u64,
}

/// Returns true if the tick that started `elapsed` into the run carries a bad value.
///
/// Ticks are numbered from the start of the run, so ticks skipped during an outage don't shift
/// the cadence. `every == 0` disables bad values.
pub fn should_inject_bad_value(elapsed: Duration, tick: Duration, every: u64) -> bool {
    if every == 0 || tick.is_zero() {
        return false;
    }
    let index = elapsed.as_nanos() / tick.as_nanos();
    index % u128::from(every) == 0
}

/// Injects faults into a running reference provider.
#[derive(Clone, Debug)]
pub struct FaultInjector {
    settings: FaultSettings,
}

impl FaultInjector {
    /// Creates a new injector.
    pub fn new(settings: FaultSettings) -> Self {
        Self { settings }
    }

    /// Runs until the configured duration has elapsed or `stop` is raised.
    ///
    /// When the duration elapses, `stop` is raised with [`StopReason::DurationElapsed`]. Failed
    /// writes are logged and never end the loop.
    pub async fn run(&self, provider: &ReferenceProvider, stop: &StopSignal) -> FaultCounters {
        let settings = &self.settings;
        let mut counters = FaultCounters::default();
        let mut vitals = VitalSigns::random();

        let started = Instant::now();
        let mut last_outage = started;
        let mut ticks = tokio::time::interval_at(started, settings.tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "injecting faults for {}",
            humantime::format_duration(settings.duration)
        );

        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                _ = stop.stopped() => break,
            }
            if stop.is_stopped() {
                break;
            }

            let elapsed = started.elapsed();
            if elapsed >= settings.duration {
                stop.trigger(StopReason::DurationElapsed);
                break;
            }

            if last_outage.elapsed() >= settings.reconnect_interval {
                counters.reconnects += 1;
                info!("simulating outage {}", counters.reconnects);
                provider.shutdown();
                if !pause(settings.outage, stop).await {
                    break;
                }
                if let Err(error) = provider.restart() {
                    warn!("failed to restart provider after outage: {}", one_line(&error));
                }
                last_outage = Instant::now();
                if !pause(settings.settle, stop).await {
                    break;
                }
            }

            vitals.step();
            provider.write_vitals(&vitals);

            if should_inject_bad_value(elapsed, settings.tick, settings.bad_value_every) {
                let value = MetricValue::Float(vitals.heart_rate() as f64 + 0.5);
                let transaction = Transaction::new().metric_value(handles::HEART_RATE, value);
                match provider.model().commit(transaction) {
                    Ok(()) => {
                        counters.uncaught_bad_values += 1;
                        warn!("floating-point heart rate was accepted by the model");
                    }
                    Err(error) => {
                        counters.bad_value_writes += 1;
                        debug!("bad value rejected: {}", one_line(&error));
                    }
                }
            }
        }

        info!(
            "fault injection finished: {} rejected bad values, {} accepted, {} outages",
            counters.bad_value_writes, counters.uncaught_bad_values, counters.reconnects
        );
        counters
    }
}

/// Sleeps for `duration`. Returns false if `stop` was raised first.
async fn pause(duration: Duration, stop: &StopSignal) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stop.stopped() => false,
    }
}
