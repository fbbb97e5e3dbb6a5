// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An in-process device stack.
//!
//! [`SimStack`] implements every trait in [`crate::device`] without touching the network:
//! discovery instances share a registry, providers own a reference information model, and
//! connected sessions receive updates over a broadcast channel. Its [`SimBehavior`] switches
//! on the failure modes the harness has to cope with.

use super::{
    BindingId, ConsumerModel, ContextAssociation, ContextKind, ContextState, Descriptor,
    DescriptorKind, DeviceStack, DiscoveredService, Discovery, Epr, Handle, InvocationState,
    MetricValue, NetworkAdapter, OperationRequest, Provider, ProviderModel, ProviderSettings,
    Session, StateUpdate, StateWrite, TlsMaterial, Transaction, UpdateBatch, UpdateCallback,
    UpdateKind, UpdateValue, epr_urn, handles,
};
use crate::{
    commlog::{CommLogSink, Direction},
    errors::{DeviceError, TransactionError},
    helpers::lock,
};
use futures::future::BoxFuture;
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::debug;

const MULTICAST_PEER: &str = "239.255.255.250";
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Failure modes and timings of a [`SimStack`].
#[derive(Clone, Debug)]
pub struct SimBehavior {
    /// Accept floating-point values for numeric metrics instead of rejecting them.
    pub accept_float_values: bool,

    /// How long a discovery search takes.
    pub search_delay: Duration,

    /// How long an operation invocation takes to reach its terminal state.
    pub operation_delay: Duration,

    /// The terminal state every valid invocation ends in. `None` means `Finished`.
    pub invocation_state: Option<InvocationState>,

    /// Whether ending subscriptions succeeds.
    pub unsubscribe_succeeds: bool,

    /// Make every provider fail to start.
    pub fail_provider_start: bool,

    /// Refuse every consumer connection.
    pub refuse_connections: bool,

    /// Make loading the information model fail.
    pub fail_model_init: bool,

    /// Descriptors to leave out of the reference information model.
    pub omit_descriptors: Vec<Handle>,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            accept_float_values: false,
            search_delay: Duration::from_millis(10),
            operation_delay: Duration::from_millis(20),
            invocation_state: None,
            unsubscribe_succeeds: true,
            fail_provider_start: false,
            refuse_connections: false,
            fail_model_init: false,
            omit_descriptors: Vec::new(),
        }
    }
}

/// An in-process [`DeviceStack`].
#[derive(Clone)]
pub struct SimStack {
    network: Arc<Network>,
    behavior: Arc<SimBehavior>,
    adapters: Vec<NetworkAdapter>,
}

impl SimStack {
    /// Creates a stack with default behavior and two adapters: loopback and a non-loopback
    /// documentation address.
    pub fn new() -> Self {
        Self::with_behavior(SimBehavior::default())
    }

    /// Creates a stack with the given behavior.
    pub fn with_behavior(behavior: SimBehavior) -> Self {
        Self {
            network: Arc::new(Network::default()),
            behavior: Arc::new(behavior),
            adapters: vec![
                NetworkAdapter::new("lo", IpAddr::V4(Ipv4Addr::LOCALHOST)),
                NetworkAdapter::new("eth0", IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))),
            ],
        }
    }

    /// Replaces the adapters the stack reports.
    pub fn with_adapters(mut self, adapters: Vec<NetworkAdapter>) -> Self {
        self.adapters = adapters;
        self
    }

    /// The behavior this stack was created with.
    pub fn behavior(&self) -> &SimBehavior {
        &self.behavior
    }

    fn find_provider(&self, service: &DiscoveredService) -> Option<Arc<SimProvider>> {
        lock(&self.network.providers)
            .iter()
            .filter_map(Weak::upgrade)
            .find(|provider| epr_urn(provider.epr) == service.epr)
    }
}

impl Default for SimStack {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStack for SimStack {
    fn adapters(&self) -> Vec<NetworkAdapter> {
        self.adapters.clone()
    }

    fn discovery(&self, adapter: &NetworkAdapter) -> Result<Arc<dyn Discovery>, DeviceError> {
        if !self.adapters.contains(adapter) {
            return Err(DeviceError::Other {
                message: format!("no adapter `{}` with address {}", adapter.name, adapter.ip),
            });
        }

        let discovery = Arc::new(SimDiscovery {
            address: adapter.ip,
            running: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            network: self.network.clone(),
            search_delay: self.behavior.search_delay,
        });
        let mut discoveries = lock(&self.network.discoveries);
        discoveries.retain(|entry| entry.strong_count() > 0);
        discoveries.push(Arc::downgrade(&discovery));

        Ok(discovery)
    }

    fn provider(
        &self,
        discovery: Arc<dyn Discovery>,
        settings: ProviderSettings,
    ) -> Result<Arc<dyn Provider>, DeviceError> {
        let port = self.network.next_port.fetch_add(1, Ordering::Relaxed);
        let address = format!("https://{}:{port}/{}", discovery.address(), settings.epr);
        let running = Arc::new(AtomicBool::new(false));

        let provider = Arc::new(SimProvider {
            epr: settings.epr,
            tls: settings.tls.is_some(),
            discovery,
            address,
            running: running.clone(),
            mdib: SimMdib::reference(&self.behavior, running),
            fail_start: self.behavior.fail_provider_start,
        });
        let mut providers = lock(&self.network.providers);
        providers.retain(|entry| entry.strong_count() > 0);
        providers.push(Arc::downgrade(&provider));

        Ok(provider)
    }

    fn connect(
        &self,
        service: DiscoveredService,
        tls: Option<TlsMaterial>,
    ) -> BoxFuture<'_, Result<Box<dyn Session>, DeviceError>> {
        Box::pin(async move {
            self.network
                .comm_log
                .record(Direction::Outbound, &service.address, "GetMetadata");
            if self.behavior.refuse_connections {
                return Err(DeviceError::Other {
                    message: format!("connection to {} refused", service.address),
                });
            }

            let provider = self
                .find_provider(&service)
                .filter(|provider| provider.is_running())
                .ok_or_else(|| DeviceError::ProviderUnreachable {
                    epr: service.epr.clone(),
                })?;
            if provider.tls != tls.is_some() {
                return Err(DeviceError::TlsMismatch {
                    provider_tls: provider.tls,
                    consumer_tls: tls.is_some(),
                });
            }

            let session: Box<dyn Session> = Box::new(SimSession {
                service,
                provider,
                behavior: self.behavior.clone(),
                network: self.network.clone(),
                closed: AtomicBool::new(false),
                forwarder: Mutex::new(None),
            });
            Ok(session)
        })
    }

    fn set_comm_log(&self, sink: Option<Arc<dyn CommLogSink>>) {
        self.network.comm_log.set(sink);
    }
}

/// State shared by everything created from one [`SimStack`].
struct Network {
    discoveries: Mutex<Vec<Weak<SimDiscovery>>>,
    providers: Mutex<Vec<Weak<SimProvider>>>,
    comm_log: CommLogRoute,
    next_port: AtomicU16,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            discoveries: Mutex::new(Vec::new()),
            providers: Mutex::new(Vec::new()),
            comm_log: CommLogRoute::default(),
            next_port: AtomicU16::new(50000),
        }
    }
}

impl Network {
    fn visible_services(&self) -> Vec<DiscoveredService> {
        lock(&self.discoveries)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|discovery| discovery.is_running())
            .flat_map(|discovery| lock(&discovery.published).clone())
            .collect()
    }
}

#[derive(Clone, Default)]
struct CommLogRoute(Arc<Mutex<Option<Arc<dyn CommLogSink>>>>);

impl CommLogRoute {
    fn set(&self, sink: Option<Arc<dyn CommLogSink>>) {
        *lock(&self.0) = sink;
    }

    fn record(&self, direction: Direction, peer: &str, message: &str) {
        // Clone the sink out so the sink runs without our lock held.
        let sink = lock(&self.0).clone();
        if let Some(sink) = sink {
            sink.record(direction, peer, message);
        }
    }
}

/// Discovery over the shared in-process registry.
pub struct SimDiscovery {
    address: IpAddr,
    running: AtomicBool,
    published: Mutex<Vec<DiscoveredService>>,
    network: Arc<Network>,
    search_delay: Duration,
}

impl Discovery for SimDiscovery {
    fn address(&self) -> IpAddr {
        self.address
    }

    fn start(&self) -> Result<(), DeviceError> {
        self.running.store(true, Ordering::SeqCst);
        debug!("discovery started on {}", self.address);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        debug!("discovery stopped on {}", self.address);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn publish(&self, service: DiscoveredService) {
        if self.is_running() {
            self.network
                .comm_log
                .record(Direction::Outbound, MULTICAST_PEER, &format!("Hello {}", service.epr));
        }
        let mut published = lock(&self.published);
        published.retain(|existing| existing.epr != service.epr);
        published.push(service);
    }

    fn withdraw(&self, epr: Epr) {
        lock(&self.published).retain(|service| !service.matches(epr));
    }

    fn search_services(&self) -> BoxFuture<'_, Result<Vec<DiscoveredService>, DeviceError>> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(DeviceError::DiscoveryStopped);
            }
            let comm_log = &self.network.comm_log;
            comm_log.record(Direction::Outbound, MULTICAST_PEER, "Probe MedicalDevice");

            tokio::time::sleep(self.search_delay).await;
            if !self.is_running() {
                return Err(DeviceError::DiscoveryStopped);
            }

            let services = self.network.visible_services();
            for service in &services {
                comm_log.record(
                    Direction::Inbound,
                    &service.address,
                    &format!("ProbeMatches {}", service.epr),
                );
            }
            Ok(services)
        })
    }
}

/// A provider hosting the reference information model.
pub struct SimProvider {
    epr: Epr,
    tls: bool,
    discovery: Arc<dyn Discovery>,
    address: String,
    running: Arc<AtomicBool>,
    mdib: SimMdib,
    fail_start: bool,
}

impl Provider for SimProvider {
    fn epr(&self) -> Epr {
        self.epr
    }

    fn start(&self) -> Result<(), DeviceError> {
        if self.fail_start {
            return Err(DeviceError::StartFailed {
                reason: "simulated start failure".to_owned(),
            });
        }
        self.running.store(true, Ordering::SeqCst);
        self.discovery.publish(DiscoveredService {
            epr: epr_urn(self.epr),
            address: self.address.clone(),
        });
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.discovery.withdraw(self.epr);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn model(&self) -> &dyn ProviderModel {
        &self.mdib
    }
}

#[derive(Default)]
struct MdibStates {
    metrics: HashMap<Handle, Option<MetricValue>>,
    alerts: HashMap<Handle, bool>,
    contexts: Vec<ContextState>,
}

impl MdibStates {
    fn associate(&mut self, kind: ContextKind, descriptor: Handle, summary: String) {
        for state in self.contexts.iter_mut().filter(|state| state.kind == kind) {
            if state.association == ContextAssociation::Associated {
                state.association = ContextAssociation::Disassociated;
            }
        }
        let index = self.contexts.iter().filter(|state| state.kind == kind).count();
        self.contexts.push(ContextState {
            handle: Handle::new(format!("{descriptor}.state{index}")),
            descriptor,
            kind,
            association: ContextAssociation::Associated,
            summary,
        });
    }
}

/// The provider-side information model.
pub struct SimMdib {
    descriptors: Vec<Descriptor>,
    states: Mutex<MdibStates>,
    updates: broadcast::Sender<UpdateBatch>,
    // Notifications are only sent while the owning provider runs.
    running: Arc<AtomicBool>,
    accept_float_values: bool,
}

impl SimMdib {
    fn reference(behavior: &SimBehavior, running: Arc<AtomicBool>) -> Self {
        let descriptors: Vec<_> = [
            (handles::HEART_RATE, DescriptorKind::NumericMetric),
            (handles::SPO2, DescriptorKind::NumericMetric),
            (handles::VITALS_ALERT, DescriptorKind::AlertCondition),
            (handles::PATIENT_CONTEXT, DescriptorKind::PatientContext),
            (handles::LOCATION_CONTEXT, DescriptorKind::LocationContext),
            ("string.ch0.vmd1", DescriptorKind::StringMetric),
            ("numeric.ch0.vmd1", DescriptorKind::NumericMetric),
            (
                handles::SET_STRING_OPERATION,
                DescriptorKind::SetStringOperation,
            ),
            (handles::SET_VALUE_OPERATION, DescriptorKind::SetValueOperation),
            (handles::ACTIVATE_OPERATION, DescriptorKind::ActivateOperation),
        ]
        .into_iter()
        .filter(|(handle, _)| {
            !behavior
                .omit_descriptors
                .iter()
                .any(|omitted| omitted.as_str() == *handle)
        })
        .map(|(handle, kind)| Descriptor::new(handle, kind))
        .collect();

        let mut states = MdibStates::default();
        for descriptor in &descriptors {
            match descriptor.kind {
                DescriptorKind::NumericMetric | DescriptorKind::StringMetric => {
                    states.metrics.insert(descriptor.handle.clone(), None);
                }
                DescriptorKind::AlertCondition => {
                    states.alerts.insert(descriptor.handle.clone(), false);
                }
                _ => {}
            }
        }

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            descriptors,
            states: Mutex::new(states),
            updates,
            running,
            accept_float_values: behavior.accept_float_values,
        }
    }

    fn context_states(&self, kind: ContextKind) -> Vec<ContextState> {
        lock(&self.states)
            .contexts
            .iter()
            .filter(|state| state.kind == kind)
            .cloned()
            .collect()
    }

    fn require(&self, handle: &Handle) -> Result<&Descriptor, TransactionError> {
        self.descriptors
            .iter()
            .find(|descriptor| &descriptor.handle == handle)
            .ok_or_else(|| TransactionError::UnknownHandle {
                handle: handle.clone(),
            })
    }

    fn context_descriptor(&self, kind: ContextKind) -> Result<Handle, TransactionError> {
        let descriptor_kind = kind.descriptor_kind();
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.kind == descriptor_kind)
            .map(|descriptor| descriptor.handle.clone())
            .ok_or_else(|| TransactionError::UnknownHandle {
                handle: Handle::new(match kind {
                    ContextKind::Patient => handles::PATIENT_CONTEXT,
                    ContextKind::Location => handles::LOCATION_CONTEXT,
                }),
            })
    }

    fn validate(&self, write: &StateWrite) -> Result<(), TransactionError> {
        match write {
            StateWrite::MetricValue { handle, value } => {
                let descriptor = self.require(handle)?;
                match (descriptor.kind, value) {
                    (DescriptorKind::NumericMetric, MetricValue::Decimal(_)) => Ok(()),
                    (DescriptorKind::NumericMetric, MetricValue::Float(_))
                        if self.accept_float_values =>
                    {
                        Ok(())
                    }
                    (DescriptorKind::NumericMetric, other) => {
                        Err(TransactionError::WrongRepresentation {
                            handle: handle.clone(),
                            expected: "decimal",
                            found: other.representation(),
                        })
                    }
                    (DescriptorKind::StringMetric, MetricValue::Text(_)) => Ok(()),
                    (DescriptorKind::StringMetric, other) => {
                        Err(TransactionError::WrongRepresentation {
                            handle: handle.clone(),
                            expected: "string",
                            found: other.representation(),
                        })
                    }
                    (actual, _) => Err(TransactionError::KindMismatch {
                        handle: handle.clone(),
                        expected: DescriptorKind::NumericMetric,
                        actual,
                    }),
                }
            }
            StateWrite::AlertPresence { handle, .. } => {
                let descriptor = self.require(handle)?;
                if descriptor.kind == DescriptorKind::AlertCondition {
                    Ok(())
                } else {
                    Err(TransactionError::KindMismatch {
                        handle: handle.clone(),
                        expected: DescriptorKind::AlertCondition,
                        actual: descriptor.kind,
                    })
                }
            }
            StateWrite::Location { .. } => self.context_descriptor(ContextKind::Location).map(drop),
            StateWrite::Patient(_) => self.context_descriptor(ContextKind::Patient).map(drop),
        }
    }
}

impl ProviderModel for SimMdib {
    fn descriptor(&self, handle: &str) -> Option<Descriptor> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.handle.as_str() == handle)
            .cloned()
    }

    fn descriptors(&self, kind: DescriptorKind) -> Vec<Descriptor> {
        self.descriptors
            .iter()
            .filter(|descriptor| descriptor.kind == kind)
            .cloned()
            .collect()
    }

    fn metric_value(&self, handle: &str) -> Option<MetricValue> {
        lock(&self.states).metrics.get(handle).cloned().flatten()
    }

    fn commit(&self, transaction: Transaction) -> Result<(), TransactionError> {
        let mut states = lock(&self.states);
        // Nothing is applied unless every write is valid.
        for write in transaction.writes() {
            self.validate(write)?;
        }

        let mut metrics = Vec::new();
        let mut alerts = Vec::new();
        for write in transaction.into_writes() {
            match write {
                StateWrite::MetricValue { handle, value } => {
                    states.metrics.insert(handle.clone(), Some(value.clone()));
                    metrics.push(StateUpdate {
                        handle,
                        value: UpdateValue::Metric(Some(value)),
                    });
                }
                StateWrite::AlertPresence { handle, presence } => {
                    states.alerts.insert(handle.clone(), presence);
                    alerts.push(StateUpdate {
                        handle,
                        value: UpdateValue::AlertPresence(presence),
                    });
                }
                StateWrite::Location { detail, validators } => {
                    let descriptor = self.context_descriptor(ContextKind::Location)?;
                    let summary = if validators.is_empty() {
                        detail.to_string()
                    } else {
                        format!("{detail} (validated by {})", validators.join(", "))
                    };
                    states.associate(ContextKind::Location, descriptor, summary);
                }
                StateWrite::Patient(patient) => {
                    let descriptor = self.context_descriptor(ContextKind::Patient)?;
                    states.associate(ContextKind::Patient, descriptor, patient.to_string());
                }
            }
        }
        drop(states);

        if self.running.load(Ordering::SeqCst) {
            // A send error only means nobody is subscribed.
            if !metrics.is_empty() {
                let _ = self.updates.send(UpdateBatch {
                    kind: UpdateKind::Metric,
                    states: metrics,
                });
            }
            if !alerts.is_empty() {
                let _ = self.updates.send(UpdateBatch {
                    kind: UpdateKind::Alert,
                    states: alerts,
                });
            }
        }
        Ok(())
    }
}

/// A consumer session connected to a [`SimProvider`].
pub struct SimSession {
    service: DiscoveredService,
    provider: Arc<SimProvider>,
    behavior: Arc<SimBehavior>,
    network: Arc<Network>,
    closed: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl SimSession {
    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DeviceError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn ensure_reachable(&self) -> Result<(), DeviceError> {
        if self.provider.is_running() {
            Ok(())
        } else {
            Err(DeviceError::ProviderUnreachable {
                epr: self.service.epr.clone(),
            })
        }
    }

    fn record(&self, direction: Direction, message: &str) {
        self.network
            .comm_log
            .record(direction, &self.service.address, message);
    }

    fn stop_forwarding(&self) -> bool {
        match lock(&self.forwarder).take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Session for SimSession {
    fn service(&self) -> &DiscoveredService {
        &self.service
    }

    fn init_model(&self) -> BoxFuture<'_, Result<Arc<dyn ConsumerModel>, DeviceError>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.record(Direction::Outbound, "GetMdib");
            self.ensure_reachable()?;
            if self.behavior.fail_model_init {
                return Err(DeviceError::Other {
                    message: "GetMdib returned a fault".to_owned(),
                });
            }
            self.record(Direction::Outbound, "Subscribe");

            let model = Arc::new(SimConsumerModel {
                provider: self.provider.clone(),
                bindings: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            });

            let mut receiver = self.provider.mdib.updates.subscribe();
            let forward_to = model.clone();
            let comm_log = self.network.comm_log.clone();
            let peer = self.service.address.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(batch) => {
                            let report = match batch.kind {
                                UpdateKind::Metric => "EpisodicMetricReport",
                                UpdateKind::Alert => "EpisodicAlertReport",
                            };
                            comm_log.record(
                                Direction::Inbound,
                                &peer,
                                &format!("{report} ({} states)", batch.states.len()),
                            );
                            forward_to.deliver(&batch);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("update forwarding lagged, {skipped} reports dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            if let Some(previous) = lock(&self.forwarder).replace(handle) {
                previous.abort();
            }

            let model: Arc<dyn ConsumerModel> = model;
            Ok(model)
        })
    }

    fn invoke(
        &self,
        request: OperationRequest,
    ) -> BoxFuture<'_, Result<InvocationState, DeviceError>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.record(
                Direction::Outbound,
                &format!("{} {}", request.kind, request.target),
            );
            if !self.behavior.operation_delay.is_zero() {
                tokio::time::sleep(self.behavior.operation_delay).await;
            }
            self.ensure_reachable()?;

            let valid_target = self
                .provider
                .mdib
                .descriptor(request.target.as_str())
                .is_some_and(|descriptor| descriptor.kind == request.kind.descriptor_kind());
            let state = if valid_target {
                self.behavior
                    .invocation_state
                    .unwrap_or(InvocationState::Finished)
            } else {
                InvocationState::Failed
            };
            self.record(
                Direction::Inbound,
                &format!("OperationInvokedReport {state}"),
            );
            Ok(state)
        })
    }

    fn unsubscribe_all(&self) -> BoxFuture<'_, Result<bool, DeviceError>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.record(Direction::Outbound, "Unsubscribe");
            self.stop_forwarding();
            Ok(self.behavior.unsubscribe_succeeds && self.provider.is_running())
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.stop_forwarding();
        })
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        self.stop_forwarding();
    }
}

struct Binding {
    id: BindingId,
    kind: UpdateKind,
    callback: UpdateCallback,
}

/// The consumer's mirror of a [`SimMdib`].
pub struct SimConsumerModel {
    provider: Arc<SimProvider>,
    bindings: Mutex<Vec<Binding>>,
    next_id: AtomicU64,
}

impl SimConsumerModel {
    fn deliver(&self, batch: &UpdateBatch) {
        // Callbacks may bind or unbind, so they run without the lock held.
        let callbacks: Vec<_> = lock(&self.bindings)
            .iter()
            .filter(|binding| binding.kind == batch.kind)
            .map(|binding| binding.callback.clone())
            .collect();
        for callback in callbacks {
            callback(batch);
        }
    }
}

impl ConsumerModel for SimConsumerModel {
    fn context_states(&self, kind: ContextKind) -> Vec<ContextState> {
        self.provider.mdib.context_states(kind)
    }

    fn descriptors(&self, kind: DescriptorKind) -> Vec<Descriptor> {
        self.provider.mdib.descriptors(kind)
    }

    fn bind(&self, kind: UpdateKind, callback: UpdateCallback) -> BindingId {
        let id = BindingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.bindings).push(Binding { id, kind, callback });
        id
    }

    fn unbind(&self, id: BindingId) {
        lock(&self.bindings).retain(|binding| binding.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Decimal, LocationDetail, OperationArgument, OperationKind};
    use std::sync::atomic::AtomicUsize;

    fn start_provider(stack: &SimStack) -> (Arc<dyn Discovery>, Arc<dyn Provider>) {
        let adapter = stack.adapters()[0].clone();
        let discovery = stack.discovery(&adapter).unwrap();
        discovery.start().unwrap();
        let provider = stack
            .provider(
                discovery.clone(),
                ProviderSettings {
                    epr: Epr::new_v4(),
                    tls: None,
                },
            )
            .unwrap();
        provider.start().unwrap();
        (discovery, provider)
    }

    fn decimal(value: i64) -> MetricValue {
        MetricValue::Decimal(Decimal::from_integer(value))
    }

    #[test]
    fn float_values_are_rejected_by_default() {
        let stack = SimStack::new();
        let (_discovery, provider) = start_provider(&stack);

        let err = provider
            .model()
            .commit(Transaction::new().metric_value(handles::HEART_RATE, MetricValue::Float(72.0)))
            .unwrap_err();
        assert!(
            matches!(
                err,
                TransactionError::WrongRepresentation {
                    expected: "decimal",
                    found: "float",
                    ..
                }
            ),
            "unexpected error: {err}"
        );
        assert_eq!(provider.model().metric_value(handles::HEART_RATE), None);
    }

    #[test]
    fn float_values_can_be_accepted() {
        let stack = SimStack::with_behavior(SimBehavior {
            accept_float_values: true,
            ..Default::default()
        });
        let (_discovery, provider) = start_provider(&stack);

        provider
            .model()
            .commit(Transaction::new().metric_value(handles::HEART_RATE, MetricValue::Float(72.5)))
            .unwrap();
        assert_eq!(
            provider.model().metric_value(handles::HEART_RATE),
            Some(MetricValue::Float(72.5))
        );
    }

    #[test]
    fn transactions_are_atomic() {
        let stack = SimStack::new();
        let (_discovery, provider) = start_provider(&stack);

        let result = provider.model().commit(
            Transaction::new()
                .metric_value(handles::HEART_RATE, decimal(70))
                .alert_presence(handles::SPO2, true),
        );
        assert!(matches!(
            result,
            Err(TransactionError::KindMismatch {
                expected: DescriptorKind::AlertCondition,
                actual: DescriptorKind::NumericMetric,
                ..
            })
        ));
        assert_eq!(provider.model().metric_value(handles::HEART_RATE), None);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_sees_only_running_services() {
        let stack = SimStack::new();
        let (provider_discovery, provider) = start_provider(&stack);

        let consumer_discovery = stack.discovery(&stack.adapters()[0]).unwrap();
        assert!(matches!(
            consumer_discovery.search_services().await,
            Err(DeviceError::DiscoveryStopped)
        ));
        consumer_discovery.start().unwrap();

        let services = consumer_discovery.search_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert!(services[0].matches(provider.epr()));

        provider_discovery.stop();
        assert_eq!(consumer_discovery.search_services().await.unwrap(), vec![]);

        provider_discovery.start().unwrap();
        provider.stop();
        assert_eq!(consumer_discovery.search_services().await.unwrap(), vec![]);
    }

    #[tokio::test(start_paused = true)]
    async fn updates_flow_only_while_provider_runs() {
        let stack = SimStack::new();
        let (discovery, provider) = start_provider(&stack);
        let service = discovery.search_services().await.unwrap().remove(0);

        let session = stack.connect(service, None).await.unwrap();
        let model = session.init_model().await.unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        model.bind(UpdateKind::Metric, {
            let received = received.clone();
            Arc::new(move |batch: &UpdateBatch| {
                received.fetch_add(batch.states.len(), Ordering::SeqCst);
            })
        });

        provider
            .model()
            .commit(
                Transaction::new()
                    .metric_value(handles::HEART_RATE, decimal(70))
                    .metric_value(handles::SPO2, decimal(97)),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(received.load(Ordering::SeqCst), 2);

        provider.stop();
        provider
            .model()
            .commit(Transaction::new().metric_value(handles::HEART_RATE, decimal(71)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(received.load(Ordering::SeqCst), 2);

        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn contexts_are_reassociated() {
        let stack = SimStack::new();
        let (discovery, provider) = start_provider(&stack);
        let location = |bed: &str| LocationDetail {
            facility: "r_fac".to_owned(),
            point_of_care: "r_poc".to_owned(),
            bed: bed.to_owned(),
        };
        provider
            .model()
            .commit(Transaction::new().location(location("r_bed"), vec![]))
            .unwrap();
        provider
            .model()
            .commit(Transaction::new().location(location("r_bed2"), vec!["Validator".to_owned()]))
            .unwrap();

        let service = discovery.search_services().await.unwrap().remove(0);
        let session = stack.connect(service, None).await.unwrap();
        let model = session.init_model().await.unwrap();

        let states = model.context_states(ContextKind::Location);
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].association, ContextAssociation::Disassociated);
        assert_eq!(states[1].association, ContextAssociation::Associated);
        assert_eq!(states[1].summary, "r_fac/r_poc/r_bed2 (validated by Validator)");
        assert!(model.context_states(ContextKind::Patient).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tls_mismatch_is_reported() {
        let stack = SimStack::new();
        let (discovery, _provider) = start_provider(&stack);
        let service = discovery.search_services().await.unwrap().remove(0);

        let tls = TlsMaterial {
            ca_folder: "certs".into(),
            private_key: "certs/user_private_key_encrypted.pem".into(),
            certificate: "certs/user_certificate_root_signed.pem".into(),
            ca_public_key: "certs/root_certificate.pem".into(),
            passphrase: None,
        };
        let err = stack.connect(service, Some(tls)).await.err().unwrap();
        assert!(matches!(
            err,
            DeviceError::TlsMismatch {
                provider_tls: false,
                consumer_tls: true
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn invocations_follow_behavior() {
        let stack = SimStack::with_behavior(SimBehavior {
            invocation_state: Some(InvocationState::FinishedWithModification),
            unsubscribe_succeeds: false,
            ..Default::default()
        });
        let (discovery, _provider) = start_provider(&stack);
        let service = discovery.search_services().await.unwrap().remove(0);
        let session = stack.connect(service, None).await.unwrap();
        session.init_model().await.unwrap();

        let state = session
            .invoke(OperationRequest {
                kind: OperationKind::SetValue,
                target: Handle::new(handles::SET_VALUE_OPERATION),
                argument: OperationArgument::Value(Decimal::from_integer(42)),
            })
            .await
            .unwrap();
        assert_eq!(state, InvocationState::FinishedWithModification);

        // An operation of the wrong kind fails.
        let state = session
            .invoke(OperationRequest {
                kind: OperationKind::Activate,
                target: Handle::new(handles::SET_VALUE_OPERATION),
                argument: OperationArgument::Activate(vec![]),
            })
            .await
            .unwrap();
        assert_eq!(state, InvocationState::Failed);

        assert!(!session.unsubscribe_all().await.unwrap());
        session.stop().await;
        assert!(matches!(
            session.unsubscribe_all().await,
            Err(DeviceError::SessionClosed)
        ));
    }

    #[test]
    fn start_failure_is_reported() {
        let stack = SimStack::with_behavior(SimBehavior {
            fail_provider_start: true,
            ..Default::default()
        });
        let discovery = stack.discovery(&stack.adapters()[0]).unwrap();
        let provider = stack
            .provider(
                discovery,
                ProviderSettings {
                    epr: Epr::new_v4(),
                    tls: None,
                },
            )
            .unwrap();
        assert!(matches!(
            provider.start(),
            Err(DeviceError::StartFailed { .. })
        ));
        assert!(!provider.is_running());
    }
}
