// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reference provider: a vital-signs monitor with a patient and a location.

use crate::{
    config::HarnessConfig,
    device::{
        Decimal, DeviceStack, Discovery, Epr, MetricValue, PatientDemographics, Provider,
        ProviderModel, ProviderSettings, TlsMaterial, Transaction, handles,
    },
    errors::{DeviceError, ProviderRunError, TransactionError, one_line},
    stop::StopSignal,
    supervisor::ReadinessReporter,
};
use rand::RngExt;
use std::{ops::RangeInclusive, sync::Arc, time::Duration};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const HEART_RATE_START: RangeInclusive<i64> = 60..=90;
const HEART_RATE_STEP: i64 = 3;
const HEART_RATE_LIMITS: RangeInclusive<i64> = 50..=100;
const SPO2_START: RangeInclusive<i64> = 96..=99;
const SPO2_STEP: i64 = 1;
const SPO2_LIMITS: RangeInclusive<i64> = 94..=100;

/// Heart rate and SpO2, following a bounded random walk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VitalSigns {
    heart_rate: i64,
    spo2: i64,
}

impl VitalSigns {
    /// Creates vitals at the given values, clamped to their limits.
    pub fn new(heart_rate: i64, spo2: i64) -> Self {
        Self {
            heart_rate: clamp(heart_rate, &HEART_RATE_LIMITS),
            spo2: clamp(spo2, &SPO2_LIMITS),
        }
    }

    /// Creates vitals at random starting values.
    pub fn random() -> Self {
        Self::new(uniform(&HEART_RATE_START), uniform(&SPO2_START))
    }

    /// The heart rate, in beats per minute.
    pub fn heart_rate(&self) -> i64 {
        self.heart_rate
    }

    /// The oxygen saturation, in percent.
    pub fn spo2(&self) -> i64 {
        self.spo2
    }

    /// Takes one random step.
    pub fn step(&mut self) {
        self.step_by(
            uniform(&(-HEART_RATE_STEP..=HEART_RATE_STEP)),
            uniform(&(-SPO2_STEP..=SPO2_STEP)),
        );
    }

    /// Moves both values by the given deltas, clamped to their limits.
    pub fn step_by(&mut self, heart_rate_delta: i64, spo2_delta: i64) {
        *self = Self::new(self.heart_rate + heart_rate_delta, self.spo2 + spo2_delta);
    }

    /// Returns true if these vitals should raise the alert condition.
    pub fn alert_present(&self) -> bool {
        self.heart_rate > 95 || self.heart_rate < 55 || self.spo2 < 95
    }
}

fn clamp(value: i64, limits: &RangeInclusive<i64>) -> i64 {
    value.clamp(*limits.start(), *limits.end())
}

/// Picks an integer from `range`, all values equally likely.
fn uniform(range: &RangeInclusive<i64>) -> i64 {
    rand::rng().random_range(range.clone())
}

/// What the update loop did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProviderRunSummary {
    /// Loop iterations.
    pub iterations: u64,
    /// Transactions that were rejected.
    pub failed_writes: u64,
}

/// A running reference provider.
///
/// Owns the discovery instance and provider it created. [`shutdown`](Self::shutdown) stops both;
/// [`run`](Self::run) does so when it returns.
pub struct ReferenceProvider {
    discovery: Arc<dyn Discovery>,
    provider: Arc<dyn Provider>,
}

impl ReferenceProvider {
    /// The patient associated with the reference provider.
    pub fn patient() -> PatientDemographics {
        PatientDemographics {
            given_name: "Max".to_owned(),
            family_name: "Mustermann".to_owned(),
            birth_name: "Mustermann".to_owned(),
        }
    }

    /// Starts discovery and a provider announcing `epr`, then writes the reference data.
    ///
    /// If anything fails, whatever was started is stopped again.
    pub fn start(
        stack: &dyn DeviceStack,
        config: &HarnessConfig,
        epr: Epr,
        tls: Option<TlsMaterial>,
    ) -> Result<Self, ProviderRunError> {
        let adapter = config.select_adapter(&stack.adapters())?;
        let discovery = stack.discovery(&adapter)?;
        discovery.start()?;

        let provider = match stack.provider(discovery.clone(), ProviderSettings { epr, tls }) {
            Ok(provider) => provider,
            Err(error) => {
                discovery.stop();
                return Err(error.into());
            }
        };
        let this = Self {
            discovery,
            provider,
        };

        match this.setup(config) {
            Ok(()) => {
                info!(
                    "provider `{epr}` started on {} ({}), location {}",
                    adapter.name, adapter.ip, config.location
                );
                Ok(this)
            }
            Err(error) => {
                this.shutdown();
                Err(error)
            }
        }
    }

    fn setup(&self, config: &HarnessConfig) -> Result<(), ProviderRunError> {
        let model = self.model();
        for handle in [handles::HEART_RATE, handles::SPO2, handles::VITALS_ALERT] {
            if model.descriptor(handle).is_none() {
                return Err(ProviderRunError::MissingDescriptor {
                    handle: handle.into(),
                });
            }
        }

        self.provider.start()?;

        model
            .commit(Transaction::new().location(
                config.location.clone(),
                vec!["Validator/System".to_owned()],
            ))
            .map_err(ProviderRunError::ReferenceData)?;
        model
            .commit(Transaction::new().patient(Self::patient()))
            .map_err(ProviderRunError::ReferenceData)?;

        // Metrics must carry a value before the first update.
        let initial = VitalSigns::random();
        let mut transaction = Transaction::new();
        for (handle, value) in [
            (handles::HEART_RATE, initial.heart_rate()),
            (handles::SPO2, initial.spo2()),
        ] {
            if model.metric_value(handle).is_none() {
                transaction = transaction.metric_value(handle, decimal(value));
            }
        }
        if !transaction.writes().is_empty() {
            model
                .commit(transaction)
                .map_err(ProviderRunError::ReferenceData)?;
        }
        Ok(())
    }

    /// The provider.
    pub fn provider(&self) -> &dyn Provider {
        &*self.provider
    }

    /// The discovery instance the provider announces itself through.
    pub fn discovery(&self) -> &dyn Discovery {
        &*self.discovery
    }

    /// The provider's information model.
    pub fn model(&self) -> &dyn ProviderModel {
        self.provider.model()
    }

    /// Restarts discovery and the provider after [`shutdown`](Self::shutdown).
    pub fn restart(&self) -> Result<(), DeviceError> {
        self.discovery.start()?;
        self.provider.start()
    }

    /// Writes `vitals` to the model: heart rate, SpO2 and alert presence, each in its own
    /// transaction. Returns the number of transactions that failed.
    pub fn write_vitals(&self, vitals: &VitalSigns) -> u64 {
        let transactions = [
            (
                "heart rate",
                Transaction::new().metric_value(handles::HEART_RATE, decimal(vitals.heart_rate())),
            ),
            (
                "SpO2",
                Transaction::new().metric_value(handles::SPO2, decimal(vitals.spo2())),
            ),
            (
                "alert presence",
                Transaction::new().alert_presence(handles::VITALS_ALERT, vitals.alert_present()),
            ),
        ];

        let mut failed = 0;
        for (what, transaction) in transactions {
            if let Err(error) = self.model().commit(transaction) {
                log_write_error(what, &error);
                failed += 1;
            }
        }
        failed
    }

    /// Updates the vitals every `send_interval` until `stop` is raised, then shuts down.
    pub async fn run(self, send_interval: Duration, stop: StopSignal) -> ProviderRunSummary {
        let mut summary = ProviderRunSummary::default();
        let mut vitals = VitalSigns::random();
        let mut interval = tokio::time::interval_at(Instant::now(), send_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.stopped() => break,
            }
            if stop.is_stopped() {
                break;
            }

            vitals.step();
            summary.iterations += 1;
            summary.failed_writes += self.write_vitals(&vitals);
            debug!(
                "vitals: heart rate {}, SpO2 {}, alert {}",
                vitals.heart_rate(),
                vitals.spo2(),
                vitals.alert_present()
            );
        }

        info!(
            "provider stopping after {} iterations ({} failed writes)",
            summary.iterations, summary.failed_writes
        );
        self.shutdown();
        summary
    }

    /// Stops the provider and discovery.
    pub fn shutdown(&self) {
        self.provider.stop();
        self.discovery.stop();
    }
}

/// Everything a provider task needs, owned so the task can be spawned.
#[derive(Clone)]
pub struct ProviderLaunch {
    /// The device stack to create the provider with.
    pub stack: Arc<dyn DeviceStack>,
    /// The harness configuration.
    pub config: HarnessConfig,
    /// The endpoint reference to announce.
    pub epr: Epr,
    /// TLS material, if TLS is enabled.
    pub tls: Option<TlsMaterial>,
}

impl ProviderLaunch {
    /// Starts the provider and reports readiness through `reporter`.
    ///
    /// Returns the provider if startup succeeded. A startup failure is reported and returned.
    pub fn start(self, reporter: ReadinessReporter) -> Result<ReferenceProvider, ProviderRunError> {
        match ReferenceProvider::start(&*self.stack, &self.config, self.epr, self.tls) {
            Ok(provider) => {
                reporter.ready();
                Ok(provider)
            }
            Err(error) => {
                reporter.failed(one_line(&error));
                Err(error)
            }
        }
    }

    /// Runs the reference provider's update loop as a supervised task.
    pub async fn run(
        self,
        send_interval: Duration,
        reporter: ReadinessReporter,
        stop: StopSignal,
    ) -> Result<ProviderRunSummary, ProviderRunError> {
        let provider = self.start(reporter)?;
        Ok(provider.run(send_interval, stop).await)
    }
}

fn decimal(value: i64) -> MetricValue {
    MetricValue::Decimal(Decimal::from_integer(value))
}

fn log_write_error(what: &str, error: &TransactionError) {
    warn!("failed to write {what}: {}", one_line(error));
}
