// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The harness commands: suite, failure and throughput runs.
//!
//! Each run acquires the comm-log first and releases it last. Everything in between is torn down
//! before the run returns, whether it passed, failed or was interrupted.

use crate::{
    commlog::{CommLogSink, DirectoryLogger, default_commlog_dir},
    config::HarnessConfig,
    device::{DeviceStack, TlsMaterial},
    errors::{HarnessError, ProviderRunError, StartupError, one_line},
    fault::{FaultCounters, FaultInjector},
    helpers::FormattedDuration,
    provider::ProviderLaunch,
    reporter::RunReport,
    sampler::{ThroughputSampler, ThroughputStats},
    sequencer::{CheckId, ResultCollector, SequenceEnd, TestSequencer, Verdict},
    stop::{StopReason, StopSignal},
    supervisor::ProviderSupervisor,
    time::stopwatch,
};
use sdc_soak_metadata::RunKind;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// Runs harness commands against a device stack.
pub struct Harness {
    stack: Arc<dyn DeviceStack>,
    config: HarnessConfig,
    stop: StopSignal,
}

impl Harness {
    /// Creates a new harness. `stop` ends any run early when raised.
    pub fn new(stack: Arc<dyn DeviceStack>, config: HarnessConfig, stop: StopSignal) -> Self {
        Self {
            stack,
            config,
            stop,
        }
    }

    /// Runs the reference provider in the background and the consumer sequence against it.
    pub async fn run_suite(&self) -> Result<RunReport, HarnessError> {
        let send_interval = self.config.send_interval;
        self.run(RunKind::Suite, |tls| async move {
            let mut results = ResultCollector::new();
            let launch = self.launch(tls.clone());
            let stop = self.stop.clone();
            let supervised = self
                .supervisor()
                .supervise(|reporter| launch.run(send_interval, reporter, stop))
                .await;

            if self.check_startup(&supervised.startup, &mut results) {
                let outcome = TestSequencer::new(&*self.stack, &self.config, tls, self.stop.clone())
                    .run()
                    .await;
                debug!("sequence ended: {:?}", outcome.end);
                for record in outcome.results.records() {
                    results.push(record.clone());
                }
            }

            self.stop.trigger(StopReason::RunFinished);
            match supervised.task.join().await {
                Ok(Ok(summary)) => debug!(
                    "provider sent {} updates ({} failed writes)",
                    summary.iterations, summary.failed_writes
                ),
                Ok(Err(error)) => debug!("provider task failed: {}", one_line(&error)),
                Err(error) => warn!("provider task did not finish cleanly: {}", join_detail(&error)),
            }

            RunOutput {
                results,
                faults: None,
                throughput: None,
            }
        })
        .await
    }

    /// Injects faults into the reference provider for the configured duration.
    pub async fn run_failure(&self) -> Result<RunReport, HarnessError> {
        self.run(RunKind::Failure, |tls| async move {
            let mut results = ResultCollector::new();
            let launch = self.launch(tls);
            let stop = self.stop.clone();
            let injector = FaultInjector::new(self.config.fault.clone());
            let supervised = self
                .supervisor()
                .supervise(|reporter| async move {
                    let provider = launch.start(reporter)?;
                    let counters = injector.run(&provider, &stop).await;
                    provider.shutdown();
                    Ok::<_, ProviderRunError>(counters)
                })
                .await;

            if !self.check_startup(&supervised.startup, &mut results) {
                self.stop.trigger(StopReason::RunFinished);
            }

            const MESSAGE: &str = "Fault injection";
            let faults = match supervised.task.join().await {
                Ok(Ok(counters)) => {
                    let verdict = if counters.uncaught_bad_values == 0 {
                        Verdict::Passed
                    } else {
                        Verdict::Failed
                    };
                    results.record_with_detail(
                        CheckId::FaultInjection,
                        MESSAGE,
                        verdict,
                        fault_detail(&counters),
                    );
                    Some(counters)
                }
                Ok(Err(error)) => {
                    if !results.contains(CheckId::ProviderStartup) {
                        results.record_with_detail(
                            CheckId::FaultInjection,
                            MESSAGE,
                            Verdict::Failed,
                            one_line(&error),
                        );
                    }
                    None
                }
                Err(error) => {
                    results.record_with_detail(
                        CheckId::FaultInjection,
                        MESSAGE,
                        Verdict::Failed,
                        join_detail(&error),
                    );
                    None
                }
            };

            RunOutput {
                results,
                faults,
                throughput: None,
            }
        })
        .await
    }

    /// Starts the reference provider, connects to it and samples its update rate.
    pub async fn run_throughput(&self) -> Result<RunReport, HarnessError> {
        let settings = self.config.throughput.clone();
        self.run(RunKind::Throughput, |tls| async move {
            let mut results = ResultCollector::new();
            let launch = self.launch(tls.clone());
            let stop = self.stop.clone();
            let supervised = self
                .supervisor()
                .supervise(|reporter| launch.run(settings.send_interval, reporter, stop))
                .await;

            let mut throughput = None;
            if self.check_startup(&supervised.startup, &mut results) {
                throughput = self
                    .sample_throughput(tls, settings.duration, &mut results)
                    .await;
            }

            self.stop.trigger(StopReason::RunFinished);
            if let Err(error) = supervised.task.join().await {
                warn!("provider task did not finish cleanly: {}", join_detail(&error));
            }

            RunOutput {
                results,
                faults: None,
                throughput,
            }
        })
        .await
    }

    async fn sample_throughput(
        &self,
        tls: Option<TlsMaterial>,
        duration: Duration,
        results: &mut ResultCollector,
    ) -> Option<ThroughputStats> {
        const MESSAGE: &str = "Update throughput";

        let sequencer = TestSequencer::new(&*self.stack, &self.config, tls, self.stop.clone());
        let connection = match sequencer.establish(results).await {
            Ok(connection) => connection,
            Err(SequenceEnd::Interrupted) => return None,
            Err(_) => {
                results.record_with_detail(
                    CheckId::Throughput,
                    MESSAGE,
                    Verdict::Skipped,
                    "not attempted: no connection to the provider",
                );
                return None;
            }
        };

        let sampled = ThroughputSampler::new(connection.model())
            .sample(duration, &self.stop)
            .await;
        connection.close().await;

        match sampled {
            Ok(stats) => {
                results.record_with_detail(
                    CheckId::Throughput,
                    MESSAGE,
                    Verdict::Passed,
                    format!("{} updates at {:.2} Hz", stats.count, stats.rate_hz),
                );
                Some(stats)
            }
            Err(error) => {
                results.record_with_detail(
                    CheckId::Throughput,
                    MESSAGE,
                    Verdict::Failed,
                    one_line(&error),
                );
                None
            }
        }
    }

    // ---
    // Helper methods
    // ---

    /// Wraps a run with the comm-log, a stopwatch and report assembly.
    async fn run<'a, F, Fut>(&'a self, kind: RunKind, body: F) -> Result<RunReport, HarnessError>
    where
        F: FnOnce(Option<TlsMaterial>) -> Fut,
        Fut: Future<Output = RunOutput> + 'a,
    {
        let stopwatch = stopwatch();
        let comm_log = self.start_comm_log();

        let output = match self.config.tls_material() {
            Ok(tls) => Ok(body(tls).await),
            Err(error) => Err(HarnessError::from(error)),
        };

        self.stop_comm_log(comm_log);
        let output = output?;

        let snapshot = stopwatch.snapshot();
        info!(
            "{} run finished in {}",
            kind,
            FormattedDuration(snapshot.duration)
        );
        Ok(RunReport {
            kind,
            start_time: snapshot.start_time,
            duration: snapshot.duration,
            results: output.results,
            faults: output.faults,
            throughput: output.throughput,
            interrupted: self.stop.reason() == Some(StopReason::Interrupted),
        })
    }

    fn supervisor(&self) -> ProviderSupervisor {
        ProviderSupervisor::new(self.config.startup.clone(), self.stop.clone())
    }

    fn launch(&self, tls: Option<TlsMaterial>) -> ProviderLaunch {
        ProviderLaunch {
            stack: self.stack.clone(),
            config: self.config.clone(),
            epr: self.config.search_epr,
            tls,
        }
    }

    /// Records the startup outcome. Returns true if the run should go on.
    fn check_startup(
        &self,
        startup: &Result<(), StartupError>,
        results: &mut ResultCollector,
    ) -> bool {
        const MESSAGE: &str = "Provider startup";
        match startup {
            Ok(()) => {
                results.record(CheckId::ProviderStartup, MESSAGE, Verdict::Passed);
                true
            }
            Err(StartupError::Interrupted) => false,
            Err(error) if !error.is_fatal() => {
                warn!("{error}, continuing anyway");
                true
            }
            Err(error) => {
                results.record_with_detail(
                    CheckId::ProviderStartup,
                    MESSAGE,
                    Verdict::Failed,
                    one_line(error),
                );
                false
            }
        }
    }

    fn start_comm_log(&self) -> Option<Arc<DirectoryLogger>> {
        if !self.config.enable_commlog {
            return None;
        }

        let started = match &self.config.commlog_dir {
            Some(dir) => DirectoryLogger::start(dir),
            None => default_commlog_dir().and_then(|dir| DirectoryLogger::start(&dir)),
        };
        match started {
            Ok(logger) => {
                info!("capturing protocol traffic to `{}`", logger.path());
                let logger = Arc::new(logger);
                let sink: Arc<dyn CommLogSink> = logger.clone();
                self.stack.set_comm_log(Some(sink));
                Some(logger)
            }
            Err(error) => {
                warn!("comm-log disabled: {}", one_line(&error));
                None
            }
        }
    }

    fn stop_comm_log(&self, logger: Option<Arc<DirectoryLogger>>) {
        let Some(logger) = logger else {
            return;
        };
        self.stack.set_comm_log(None);
        if let Err(error) = logger.stop() {
            warn!("failed to finish comm-log: {}", one_line(&error));
        }
    }
}

/// What a run body produces.
struct RunOutput {
    results: ResultCollector,
    faults: Option<FaultCounters>,
    throughput: Option<ThroughputStats>,
}

fn fault_detail(counters: &FaultCounters) -> String {
    format!(
        "{} rejected bad values, {} accepted, {} outages",
        counters.bad_value_writes, counters.uncaught_bad_values, counters.reconnects
    )
}

fn join_detail(error: &JoinError) -> String {
    if error.is_panic() {
        "provider task panicked".to_owned()
    } else {
        "provider task was cancelled".to_owned()
    }
}
