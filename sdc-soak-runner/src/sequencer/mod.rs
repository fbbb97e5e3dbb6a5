// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The consumer-side test sequence.
//!
//! [`TestSequencer`] runs the [`Phase`]s in order against a provider and records the outcome of
//! every check in a [`ResultCollector`]. What a failing phase does to the rest of the sequence is
//! decided by [`Phase::failure_policy`]. Resources acquired along the way are released in reverse
//! order once the sequence ends, however it ends.

mod collector;
mod discovery;

pub use collector::*;
pub use discovery::*;

use crate::{
    config::HarnessConfig,
    device::{
        ConsumerModel, ContextKind, Decimal, DeviceStack, DiscoveredService, Discovery, Handle,
        OperationArgument, OperationKind, OperationRequest, Session, TlsMaterial, UpdateBatch,
        UpdateCallback, UpdateKind, epr_urn, handles,
    },
    errors::{ConnectError, DiscoveryError, InvocationError, ModelInitError, one_line},
    helpers::{FormattedDuration, lock, plural},
    stop::StopSignal,
};
use indexmap::IndexMap;
use std::{
    fmt,
    ops::ControlFlow,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// The string sent with set-string and activate invocations.
const OPERATION_ARGUMENT: &str = "hoppeldipop";

/// The value sent with set-value invocations.
const OPERATION_VALUE: i64 = 42;

/// How often to report progress while waiting for updates.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// A phase of the test sequence, in run order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    /// Find the provider under test.
    Discovery,
    /// Connect to it.
    Connect,
    /// Load its information model and subscribe to reports.
    ModelInit,
    /// Check for patient and location contexts.
    Contexts,
    /// Count metric and alert updates.
    Updates,
    /// Invoke operations.
    Operations,
    /// End all subscriptions.
    Teardown,
}

/// What a failed phase does to the rest of the sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailurePolicy {
    /// No further phases run.
    AbortSequence,
    /// The failure is recorded and the next phase runs.
    IsolateAndContinue,
}

impl Phase {
    /// Every phase, in run order.
    pub const ALL: [Self; 7] = [
        Self::Discovery,
        Self::Connect,
        Self::ModelInit,
        Self::Contexts,
        Self::Updates,
        Self::Operations,
        Self::Teardown,
    ];

    /// Returns what a failure of this phase does to the rest of the sequence.
    pub fn failure_policy(self) -> FailurePolicy {
        match self {
            Self::Discovery | Self::Connect | Self::ModelInit => FailurePolicy::AbortSequence,
            Self::Contexts | Self::Updates | Self::Operations | Self::Teardown => {
                FailurePolicy::IsolateAndContinue
            }
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovery => f.write_str("service discovery"),
            Self::Connect => f.write_str("connect"),
            Self::ModelInit => f.write_str("model initialization"),
            Self::Contexts => f.write_str("context checks"),
            Self::Updates => f.write_str("update collection"),
            Self::Operations => f.write_str("operation invocation"),
            Self::Teardown => f.write_str("teardown"),
        }
    }
}

/// How a sequence run ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SequenceEnd {
    /// Every phase ran.
    Completed,
    /// A phase with [`FailurePolicy::AbortSequence`] failed.
    Aborted(Phase),
    /// The stop signal was raised.
    Interrupted,
}

/// The result of [`TestSequencer::run`].
#[derive(Clone, Debug)]
pub struct SequenceOutcome {
    /// Every recorded check.
    pub results: ResultCollector,
    /// How the run ended.
    pub end: SequenceEnd,
}

impl SequenceOutcome {
    /// Returns true if the run was interrupted.
    pub fn interrupted(&self) -> bool {
        self.end == SequenceEnd::Interrupted
    }
}

enum PhaseOutcome {
    Succeeded,
    Failed,
    Interrupted,
}

/// Resources acquired by the sequence, released in reverse order.
#[derive(Default)]
struct SequenceState {
    discovery: Option<Arc<dyn Discovery>>,
    service: Option<DiscoveredService>,
    session: Option<Box<dyn Session>>,
    model: Option<Arc<dyn ConsumerModel>>,
}

/// Runs the consumer-side test sequence against a provider.
pub struct TestSequencer<'a> {
    stack: &'a dyn DeviceStack,
    config: &'a HarnessConfig,
    tls: Option<TlsMaterial>,
    stop: StopSignal,
}

impl<'a> TestSequencer<'a> {
    /// Creates a new sequencer.
    pub fn new(
        stack: &'a dyn DeviceStack,
        config: &'a HarnessConfig,
        tls: Option<TlsMaterial>,
        stop: StopSignal,
    ) -> Self {
        Self {
            stack,
            config,
            tls,
            stop,
        }
    }

    /// Runs every phase and returns the recorded results.
    pub async fn run(&self) -> SequenceOutcome {
        let mut results = ResultCollector::new();
        let mut state = SequenceState::default();

        let end = match self.run_phases(&Phase::ALL, &mut state, &mut results).await {
            ControlFlow::Continue(()) => SequenceEnd::Completed,
            ControlFlow::Break(end) => end,
        };
        release(state).await;

        SequenceOutcome { results, end }
    }

    /// Runs discovery, connect and model initialization, recording them into `results`, and
    /// hands the connection to the caller.
    ///
    /// If any of these phases doesn't succeed, whatever was acquired is released and the reason
    /// is returned.
    pub async fn establish(
        &self,
        results: &mut ResultCollector,
    ) -> Result<ConsumerConnection, SequenceEnd> {
        const PHASES: [Phase; 3] = [Phase::Discovery, Phase::Connect, Phase::ModelInit];

        let mut state = SequenceState::default();
        if let ControlFlow::Break(end) = self.run_phases(&PHASES, &mut state, results).await {
            release(state).await;
            return Err(end);
        }
        match state.model.clone() {
            Some(model) => Ok(ConsumerConnection { state, model }),
            None => {
                release(state).await;
                Err(SequenceEnd::Aborted(Phase::ModelInit))
            }
        }
    }

    async fn run_phases(
        &self,
        phases: &[Phase],
        state: &mut SequenceState,
        results: &mut ResultCollector,
    ) -> ControlFlow<SequenceEnd> {
        for &phase in phases {
            if self.stop.is_stopped() {
                return ControlFlow::Break(SequenceEnd::Interrupted);
            }

            info!("running {phase}");
            let outcome = match phase {
                Phase::Discovery => self.discover(state, results).await,
                Phase::Connect => self.connect(state, results).await,
                Phase::ModelInit => self.init_model(state, results).await,
                Phase::Contexts => self.check_contexts(state, results),
                Phase::Updates => self.collect_updates(state, results).await,
                Phase::Operations => self.invoke_operations(state, results).await,
                Phase::Teardown => self.unsubscribe(state, results).await,
            };

            match outcome {
                PhaseOutcome::Succeeded => {}
                PhaseOutcome::Interrupted => return ControlFlow::Break(SequenceEnd::Interrupted),
                PhaseOutcome::Failed => match phase.failure_policy() {
                    FailurePolicy::AbortSequence => {
                        warn!("{phase} failed, aborting the sequence");
                        return ControlFlow::Break(SequenceEnd::Aborted(phase));
                    }
                    FailurePolicy::IsolateAndContinue => {
                        debug!("{phase} failed, continuing");
                    }
                },
            }
        }

        ControlFlow::Continue(())
    }

    // ---
    // Phases
    // ---

    async fn discover(
        &self,
        state: &mut SequenceState,
        results: &mut ResultCollector,
    ) -> PhaseOutcome {
        const MESSAGE: &str = "Service discovery";

        match self.find_service(state).await {
            Ok(service) => {
                results.record_with_detail(
                    CheckId::Discovery,
                    MESSAGE,
                    Verdict::Passed,
                    format!("found `{}` at {}", service.epr, service.address),
                );
                state.service = Some(service);
                PhaseOutcome::Succeeded
            }
            Err(DiscoveryError::Interrupted) => PhaseOutcome::Interrupted,
            Err(error) => {
                results.record_with_detail(
                    CheckId::Discovery,
                    MESSAGE,
                    Verdict::Failed,
                    one_line(&error),
                );
                PhaseOutcome::Failed
            }
        }
    }

    async fn find_service(
        &self,
        state: &mut SequenceState,
    ) -> Result<DiscoveredService, DiscoveryError> {
        let adapter = self.config.select_adapter(&self.stack.adapters())?;
        info!("using network adapter {} ({})", adapter.name, adapter.ip);

        let discovery = self
            .stack
            .discovery(&adapter)
            .map_err(DiscoveryError::Start)?;
        discovery.start().map_err(DiscoveryError::Start)?;
        state.discovery = Some(discovery.clone());

        info!(
            "searching for service `{}`",
            epr_urn(self.config.search_epr)
        );
        discover_service(
            &*discovery,
            self.config.search_epr,
            &self.config.discovery,
            &self.stop,
        )
        .await
    }

    async fn connect(
        &self,
        state: &mut SequenceState,
        results: &mut ResultCollector,
    ) -> PhaseOutcome {
        const MESSAGE: &str = "Connect to device";

        let Some(service) = state.service.clone() else {
            return skip(results, CheckId::Connect, MESSAGE, "no service was discovered");
        };

        let timeout = self.config.connect_timeout;
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, self.stack.connect(service, self.tls.clone())) => {
                match result {
                    Ok(Ok(session)) => Ok(session),
                    Ok(Err(error)) => Err(ConnectError::Device(error)),
                    Err(_) => Err(ConnectError::Timeout { timeout }),
                }
            }
            _ = self.stop.stopped() => return PhaseOutcome::Interrupted,
        };

        match result {
            Ok(session) => {
                results.record(CheckId::Connect, MESSAGE, Verdict::Passed);
                state.session = Some(session);
                PhaseOutcome::Succeeded
            }
            Err(error) => {
                results.record_with_detail(
                    CheckId::Connect,
                    MESSAGE,
                    Verdict::Failed,
                    one_line(&error),
                );
                PhaseOutcome::Failed
            }
        }
    }

    async fn init_model(
        &self,
        state: &mut SequenceState,
        results: &mut ResultCollector,
    ) -> PhaseOutcome {
        const INIT_MESSAGE: &str = "Information model initialization";
        const SUBSCRIBE_MESSAGE: &str = "Subscription setup";

        let Some(session) = &state.session else {
            skip(results, CheckId::ModelInit, INIT_MESSAGE, "not connected");
            return skip(results, CheckId::Subscribe, SUBSCRIBE_MESSAGE, "not connected");
        };

        let timeout = self.config.connect_timeout;
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, session.init_model()) => {
                match result {
                    Ok(Ok(model)) => Ok(model),
                    Ok(Err(error)) => Err(ModelInitError::Device(error)),
                    Err(_) => Err(ModelInitError::Timeout { timeout }),
                }
            }
            _ = self.stop.stopped() => return PhaseOutcome::Interrupted,
        };

        match result {
            Ok(model) => {
                // Loading the model subscribes to reports, so both succeed together.
                results.record(CheckId::ModelInit, INIT_MESSAGE, Verdict::Passed);
                results.record(CheckId::Subscribe, SUBSCRIBE_MESSAGE, Verdict::Passed);
                state.model = Some(model);
                PhaseOutcome::Succeeded
            }
            Err(error) => {
                let detail = one_line(&error);
                results.record_with_detail(
                    CheckId::ModelInit,
                    INIT_MESSAGE,
                    Verdict::Failed,
                    detail.clone(),
                );
                results.record_with_detail(
                    CheckId::Subscribe,
                    SUBSCRIBE_MESSAGE,
                    Verdict::Failed,
                    detail,
                );
                PhaseOutcome::Failed
            }
        }
    }

    fn check_contexts(
        &self,
        state: &SequenceState,
        results: &mut ResultCollector,
    ) -> PhaseOutcome {
        let checks = [
            (CheckId::PatientContext, ContextKind::Patient, "Patient context", "patient"),
            (CheckId::LocationContext, ContextKind::Location, "Location context", "location"),
        ];

        let Some(model) = &state.model else {
            for (id, _, message, _) in checks {
                skip(results, id, message, "information model not loaded");
            }
            return PhaseOutcome::Failed;
        };

        let mut outcome = PhaseOutcome::Succeeded;
        for (id, kind, message, noun) in checks {
            let states = model.context_states(kind);
            if states.is_empty() {
                results.record_with_detail(
                    id,
                    message,
                    Verdict::Failed,
                    format!("no {noun} context states found"),
                );
                outcome = PhaseOutcome::Failed;
            } else {
                let found = states
                    .iter()
                    .map(|context| context.handle.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                results.record_with_detail(id, message, Verdict::Passed, format!("found {found}"));
            }
        }
        outcome
    }

    async fn collect_updates(
        &self,
        state: &SequenceState,
        results: &mut ResultCollector,
    ) -> PhaseOutcome {
        let Some(model) = &state.model else {
            skip(
                results,
                CheckId::MetricUpdates,
                "Metric updates",
                "information model not loaded",
            );
            return skip(
                results,
                CheckId::AlertUpdates,
                "Alert updates",
                "information model not loaded",
            );
        };

        let metric_counts = UpdateCounts::default();
        let alert_counts = UpdateCounts::default();
        let metric_binding = model.bind(UpdateKind::Metric, metric_counts.callback());
        let alert_binding = model.bind(UpdateKind::Alert, alert_counts.callback());

        let threshold = self.config.update_threshold();
        info!(
            "waiting {} for updates (at least {threshold} {} per handle expected)",
            FormattedDuration(self.config.metric_wait),
            plural::updates_str(threshold),
        );
        let interrupted = self.wait_for_updates().await;

        model.unbind(metric_binding);
        model.unbind(alert_binding);
        if interrupted {
            return PhaseOutcome::Interrupted;
        }

        let metrics_ok = evaluate_updates(
            results,
            CheckId::MetricUpdates,
            "Metric updates",
            metric_counts.take(),
            threshold,
        );
        let alerts_ok = evaluate_updates(
            results,
            CheckId::AlertUpdates,
            "Alert updates",
            alert_counts.take(),
            threshold,
        );
        if metrics_ok && alerts_ok {
            PhaseOutcome::Succeeded
        } else {
            PhaseOutcome::Failed
        }
    }

    /// Waits for the metric-wait duration. Returns true if interrupted.
    async fn wait_for_updates(&self) -> bool {
        let deadline = Instant::now() + self.config.metric_wait;
        let mut progress =
            tokio::time::interval_at(Instant::now() + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                _ = self.stop.stopped() => return true,
                _ = progress.tick() => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    info!("{} remaining", FormattedDuration(remaining));
                }
            }
        }
    }

    async fn invoke_operations(
        &self,
        state: &SequenceState,
        results: &mut ResultCollector,
    ) -> PhaseOutcome {
        let (Some(session), Some(model)) = (&state.session, &state.model) else {
            for kind in OperationKind::ALL {
                skip(
                    results,
                    CheckId::Operation(kind),
                    format!("{kind} operation"),
                    "information model not loaded",
                );
            }
            return PhaseOutcome::Failed;
        };

        let mut outcome = PhaseOutcome::Succeeded;
        for kind in OperationKind::ALL {
            if self.stop.is_stopped() {
                return PhaseOutcome::Interrupted;
            }

            let request = operation_request(kind);
            let target = request.target.clone();
            let found = model
                .descriptors(kind.descriptor_kind())
                .iter()
                .any(|descriptor| descriptor.handle == target);
            if !found {
                results.record_with_detail(
                    CheckId::OperationDescriptor(kind),
                    format!("{kind} operation descriptor"),
                    Verdict::Failed,
                    format!("descriptor `{target}` not found"),
                );
                outcome = PhaseOutcome::Failed;
                continue;
            }
            results.record_with_detail(
                CheckId::OperationDescriptor(kind),
                format!("{kind} operation descriptor"),
                Verdict::Passed,
                format!("descriptor `{target}` found"),
            );

            let timeout = self.config.operation_timeout;
            let result = tokio::select! {
                result = tokio::time::timeout(timeout, session.invoke(request)) => {
                    match result {
                        Ok(Ok(invocation)) => Ok(invocation),
                        Ok(Err(error)) => Err(InvocationError::Device(error)),
                        Err(_) => Err(InvocationError::Timeout { timeout }),
                    }
                }
                _ = self.stop.stopped() => return PhaseOutcome::Interrupted,
            };

            let message = format!("{kind} on `{target}`");
            match result {
                Ok(invocation) if invocation.is_success() => {
                    results.record_with_detail(
                        CheckId::Operation(kind),
                        message,
                        Verdict::Passed,
                        format!("state: {invocation}"),
                    );
                }
                Ok(invocation) => {
                    results.record_with_detail(
                        CheckId::Operation(kind),
                        message,
                        Verdict::Failed,
                        format!("state: {invocation}"),
                    );
                    outcome = PhaseOutcome::Failed;
                }
                Err(error) => {
                    results.record_with_detail(
                        CheckId::Operation(kind),
                        message,
                        Verdict::Failed,
                        one_line(&error),
                    );
                    outcome = PhaseOutcome::Failed;
                }
            }
        }
        outcome
    }

    async fn unsubscribe(
        &self,
        state: &SequenceState,
        results: &mut ResultCollector,
    ) -> PhaseOutcome {
        const MESSAGE: &str = "Unsubscribe all";

        let Some(session) = &state.session else {
            return skip(results, CheckId::Unsubscribe, MESSAGE, "not connected");
        };

        let timeout = self.config.operation_timeout;
        match tokio::time::timeout(timeout, session.unsubscribe_all()).await {
            Ok(Ok(true)) => {
                results.record(CheckId::Unsubscribe, MESSAGE, Verdict::Passed);
                PhaseOutcome::Succeeded
            }
            Ok(Ok(false)) => {
                results.record_with_detail(
                    CheckId::Unsubscribe,
                    MESSAGE,
                    Verdict::Failed,
                    "not every subscription could be ended",
                );
                PhaseOutcome::Failed
            }
            Ok(Err(error)) => {
                results.record_with_detail(
                    CheckId::Unsubscribe,
                    MESSAGE,
                    Verdict::Failed,
                    one_line(&error),
                );
                PhaseOutcome::Failed
            }
            Err(_) => {
                results.record_with_detail(
                    CheckId::Unsubscribe,
                    MESSAGE,
                    Verdict::Failed,
                    format!("timed out after {}", FormattedDuration(timeout)),
                );
                PhaseOutcome::Failed
            }
        }
    }
}

/// A consumer connection established by [`TestSequencer::establish`].
pub struct ConsumerConnection {
    state: SequenceState,
    model: Arc<dyn ConsumerModel>,
}

impl ConsumerConnection {
    /// The provider's information model, as mirrored by the consumer.
    pub fn model(&self) -> &dyn ConsumerModel {
        &*self.model
    }

    /// Closes the session and stops discovery.
    pub async fn close(self) {
        drop(self.model);
        release(self.state).await;
    }
}

/// Releases sequence resources in reverse order of acquisition.
async fn release(state: SequenceState) {
    let SequenceState {
        discovery,
        service: _,
        session,
        model,
    } = state;

    drop(model);
    if let Some(session) = session {
        session.stop().await;
        debug!("session stopped");
    }
    if let Some(discovery) = discovery {
        discovery.stop();
        debug!("discovery stopped");
    }
}

/// Records a check that couldn't run because something it depends on is unavailable.
fn skip(
    results: &mut ResultCollector,
    id: CheckId,
    message: impl Into<String>,
    reason: &str,
) -> PhaseOutcome {
    results.record_with_detail(id, message, Verdict::Skipped, format!("not attempted: {reason}"));
    PhaseOutcome::Failed
}

fn operation_request(kind: OperationKind) -> OperationRequest {
    let (target, argument) = match kind {
        OperationKind::SetString => (
            handles::SET_STRING_OPERATION,
            OperationArgument::String(OPERATION_ARGUMENT.to_owned()),
        ),
        OperationKind::SetValue => (
            handles::SET_VALUE_OPERATION,
            OperationArgument::Value(Decimal::from_integer(OPERATION_VALUE)),
        ),
        OperationKind::Activate => (
            handles::ACTIVATE_OPERATION,
            OperationArgument::Activate(vec![OPERATION_ARGUMENT.to_owned()]),
        ),
    };
    OperationRequest {
        kind,
        target: Handle::new(target),
        argument,
    }
}

/// Per-handle update counts, shared with the callbacks that fill them.
#[derive(Clone, Default)]
struct UpdateCounts(Arc<Mutex<IndexMap<Handle, usize>>>);

impl UpdateCounts {
    fn callback(&self) -> UpdateCallback {
        let counts = self.0.clone();
        Arc::new(move |batch: &UpdateBatch| {
            let mut counts = lock(&counts);
            for state in &batch.states {
                *counts.entry(state.handle.clone()).or_default() += 1;
            }
        })
    }

    fn take(&self) -> IndexMap<Handle, usize> {
        std::mem::take(&mut *lock(&self.0))
    }
}

/// Records one check per handle. Returns true if all of them passed.
fn evaluate_updates(
    results: &mut ResultCollector,
    id: CheckId,
    title: &str,
    counts: IndexMap<Handle, usize>,
    threshold: usize,
) -> bool {
    if counts.is_empty() {
        results.record_with_detail(
            id,
            title,
            Verdict::Failed,
            format!("no {} received", title.to_lowercase()),
        );
        return false;
    }

    let mut all_passed = true;
    for (handle, count) in counts {
        let verdict = if count >= threshold {
            Verdict::Passed
        } else {
            all_passed = false;
            Verdict::Failed
        };
        results.record_with_detail(
            id,
            format!("{title} for `{handle}`"),
            verdict,
            format!(
                "received {count} {}, expected at least {threshold}",
                plural::updates_str(count)
            ),
        );
    }
    all_passed
}
