// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The seam between sdc-soak and the device-communication library.
//!
//! sdc-soak doesn't implement discovery, transport or the information model (MDIB) itself. It
//! drives a library that does, through the object-safe traits in this module:
//!
//! * [`DeviceStack`] is the entry point: it enumerates network adapters, creates discovery
//!   instances and providers, and connects consumers.
//! * [`Discovery`] publishes and searches for services.
//! * [`Provider`] and [`ProviderModel`] are the device side: the provider owns the model and
//!   mutates it through [`Transaction`]s.
//! * [`Session`] and [`ConsumerModel`] are the consumer side: a connected session mirrors the
//!   provider's model and delivers updates to bound callbacks.
//!
//! [`sim::SimStack`] is an in-process implementation of all of these.

mod model;
pub mod sim;

pub use model::*;

use crate::{
    commlog::CommLogSink,
    errors::{DeviceError, TransactionError},
};
use futures::future::BoxFuture;
use std::{net::IpAddr, sync::Arc};

/// A network adapter that discovery can bind to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkAdapter {
    /// The adapter's name, as reported by the operating system.
    pub name: String,

    /// The IP address to bind to.
    pub ip: IpAddr,
}

impl NetworkAdapter {
    /// Creates a new adapter description.
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
        }
    }

    /// Returns true if this is a loopback adapter.
    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }
}

/// TLS material handed to the library when connecting or providing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlsMaterial {
    /// The folder the certificates were loaded from.
    pub ca_folder: camino::Utf8PathBuf,
    /// The encrypted private key.
    pub private_key: camino::Utf8PathBuf,
    /// The certificate signed by the root.
    pub certificate: camino::Utf8PathBuf,
    /// The root certificate.
    pub ca_public_key: camino::Utf8PathBuf,
    /// The passphrase for the private key.
    pub passphrase: Option<String>,
}

/// Settings a provider is created with.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    /// The endpoint reference the provider announces itself with.
    pub epr: Epr,
    /// TLS material, if TLS is enabled.
    pub tls: Option<TlsMaterial>,
}

/// Entry point into a device-communication library.
pub trait DeviceStack: Send + Sync {
    /// Returns the network adapters available to the library.
    fn adapters(&self) -> Vec<NetworkAdapter>;

    /// Creates a discovery instance bound to `adapter`. The instance is not started.
    fn discovery(&self, adapter: &NetworkAdapter) -> Result<Arc<dyn Discovery>, DeviceError>;

    /// Creates a provider that publishes itself through `discovery`. The provider is not
    /// started.
    fn provider(
        &self,
        discovery: Arc<dyn Discovery>,
        settings: ProviderSettings,
    ) -> Result<Arc<dyn Provider>, DeviceError>;

    /// Connects a consumer to a discovered service.
    fn connect(
        &self,
        service: DiscoveredService,
        tls: Option<TlsMaterial>,
    ) -> BoxFuture<'_, Result<Box<dyn Session>, DeviceError>>;

    /// Routes protocol traffic to `sink`, or stops routing it if `None`.
    fn set_comm_log(&self, sink: Option<Arc<dyn CommLogSink>>);
}

/// Service discovery.
pub trait Discovery: Send + Sync {
    /// The address this instance is bound to.
    fn address(&self) -> IpAddr;

    /// Starts answering discovery searches and sending announcements.
    fn start(&self) -> Result<(), DeviceError>;

    /// Stops discovery. Published services become invisible until it is started again.
    fn stop(&self);

    /// Returns true if discovery is running.
    fn is_running(&self) -> bool;

    /// Announces a service.
    fn publish(&self, service: DiscoveredService);

    /// Withdraws a previously published service.
    fn withdraw(&self, epr: Epr);

    /// Sends one search for medical devices and returns every service that answered.
    fn search_services(&self) -> BoxFuture<'_, Result<Vec<DiscoveredService>, DeviceError>>;
}

/// The device side: owns the information model and publishes it.
pub trait Provider: Send + Sync {
    /// The endpoint reference of this provider.
    fn epr(&self) -> Epr;

    /// Starts hosting services and announces them through discovery.
    fn start(&self) -> Result<(), DeviceError>;

    /// Stops hosting services. Existing subscriptions stop receiving notifications.
    fn stop(&self);

    /// Returns true if the provider is running.
    fn is_running(&self) -> bool;

    /// The provider's information model.
    fn model(&self) -> &dyn ProviderModel;
}

/// The provider's view of the information model.
pub trait ProviderModel: Send + Sync {
    /// Looks up a descriptor by handle.
    fn descriptor(&self, handle: &str) -> Option<Descriptor>;

    /// Returns every descriptor of the given kind, in document order.
    fn descriptors(&self, kind: DescriptorKind) -> Vec<Descriptor>;

    /// Returns the current value of a metric, if it has one.
    fn metric_value(&self, handle: &str) -> Option<MetricValue>;

    /// Validates and applies `transaction` atomically. Either every write is applied and
    /// notifications are sent, or none is.
    fn commit(&self, transaction: Transaction) -> Result<(), TransactionError>;
}

/// A consumer connected to a provider.
pub trait Session: Send + Sync {
    /// The provider this session is connected to.
    fn service(&self) -> &DiscoveredService;

    /// Loads the provider's information model and subscribes to its reports.
    fn init_model(&self) -> BoxFuture<'_, Result<Arc<dyn ConsumerModel>, DeviceError>>;

    /// Invokes an operation. The returned future completes once the provider reports a terminal
    /// invocation state.
    fn invoke(
        &self,
        request: OperationRequest,
    ) -> BoxFuture<'_, Result<InvocationState, DeviceError>>;

    /// Ends every subscription. Returns false if any of them could not be ended.
    fn unsubscribe_all(&self) -> BoxFuture<'_, Result<bool, DeviceError>>;

    /// Closes the session.
    fn stop(&self) -> BoxFuture<'_, ()>;
}

/// A callback invoked with every batch of updates of the kind it was bound to.
///
/// Callbacks may be invoked concurrently with the code that bound them.
pub type UpdateCallback = Arc<dyn Fn(&UpdateBatch) + Send + Sync>;

/// The consumer's mirror of the provider's information model.
pub trait ConsumerModel: Send + Sync {
    /// Returns every context state of the given kind.
    fn context_states(&self, kind: ContextKind) -> Vec<ContextState>;

    /// Returns every descriptor of the given kind, in document order.
    fn descriptors(&self, kind: DescriptorKind) -> Vec<Descriptor>;

    /// Binds `callback` to updates of `kind`.
    fn bind(&self, kind: UpdateKind, callback: UpdateCallback) -> BindingId;

    /// Removes a binding. Unknown ids are ignored.
    fn unbind(&self, id: BindingId);
}
