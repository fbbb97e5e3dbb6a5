// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Information-model types exchanged with the device library.

use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use smol_str::SmolStr;
use std::{borrow::Borrow, fmt};

/// Marker for endpoint-reference UUIDs.
pub enum EprKind {}

impl TypedUuidKind for EprKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("epr");
        TAG
    }
}

/// An endpoint reference: the unique id a provider announces itself with.
pub type Epr = TypedUuid<EprKind>;

/// Returns the URN form of an endpoint reference, as announced by discovery.
pub fn epr_urn(epr: Epr) -> String {
    format!("urn:uuid:{epr}")
}

/// The handle of a descriptor or state in the information model.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Handle(SmolStr);

impl Handle {
    /// Creates a new handle.
    pub fn new(handle: impl AsRef<str>) -> Self {
        Self(SmolStr::new(handle))
    }

    /// Returns the handle as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Handle {
    fn from(handle: &str) -> Self {
        Self::new(handle)
    }
}

impl Borrow<str> for Handle {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handles defined by the reference information model.
pub mod handles {
    /// Heart-rate numeric metric.
    pub const HEART_RATE: &str = "numeric.ch0.vmd0";
    /// SpO2 numeric metric.
    pub const SPO2: &str = "numeric.ch1.vmd0";
    /// Alert condition raised for out-of-range vitals.
    pub const VITALS_ALERT: &str = "ac0.mds0";
    /// Set-string operation target.
    pub const SET_STRING_OPERATION: &str = "string.ch0.vmd1_sco_0";
    /// Set-value operation target.
    pub const SET_VALUE_OPERATION: &str = "numeric.ch0.vmd1_sco_0";
    /// Activate operation target.
    pub const ACTIVATE_OPERATION: &str = "actop.vmd1_sco_0";
    /// Patient context descriptor.
    pub const PATIENT_CONTEXT: &str = "patient_context.mds0";
    /// Location context descriptor.
    pub const LOCATION_CONTEXT: &str = "location_context.mds0";
}

/// A fixed-point decimal, the representation the information model requires for numeric
/// metric values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Decimal {
    mantissa: i64,
    scale: u32,
}

impl Decimal {
    const MAX_SCALE: u32 = 9;

    /// Creates a decimal with no fractional digits.
    pub const fn from_integer(value: i64) -> Self {
        Self {
            mantissa: value,
            scale: 0,
        }
    }

    /// Rounds `value` to `scale` fractional digits.
    ///
    /// Returns `None` if `value` isn't finite, `scale` is larger than 9, or the result doesn't
    /// fit.
    pub fn from_f64(value: f64, scale: u32) -> Option<Self> {
        if !value.is_finite() || scale > Self::MAX_SCALE {
            return None;
        }
        let scaled = (value * 10f64.powi(scale as i32)).round();
        if scaled.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(Self {
            mantissa: scaled as i64,
            scale,
        })
    }

    /// Returns the closest floating-point value.
    pub fn to_f64(self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.scale as i32)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let divisor = 10u64.pow(self.scale);
        let abs = self.mantissa.unsigned_abs();
        let sign = if self.mantissa < 0 { "-" } else { "" };
        write!(
            f,
            "{sign}{}.{:0width$}",
            abs / divisor,
            abs % divisor,
            width = self.scale as usize
        )
    }
}

/// A metric value as written through a transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// A fixed-point decimal.
    Decimal(Decimal),
    /// A floating-point number. Numeric metrics don't accept these.
    Float(f64),
    /// A string, for string metrics.
    Text(String),
}

impl MetricValue {
    /// The name of this value's representation.
    pub fn representation(&self) -> &'static str {
        match self {
            Self::Decimal(_) => "decimal",
            Self::Float(_) => "float",
            Self::Text(_) => "string",
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decimal(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// The kind of a descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DescriptorKind {
    /// A numeric metric.
    NumericMetric,
    /// A string metric.
    StringMetric,
    /// An alert condition.
    AlertCondition,
    /// The patient context.
    PatientContext,
    /// The location context.
    LocationContext,
    /// A set-string operation.
    SetStringOperation,
    /// A set-value operation.
    SetValueOperation,
    /// An activate operation.
    ActivateOperation,
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NumericMetric => "numeric metric",
            Self::StringMetric => "string metric",
            Self::AlertCondition => "alert condition",
            Self::PatientContext => "patient context",
            Self::LocationContext => "location context",
            Self::SetStringOperation => "set-string operation",
            Self::SetValueOperation => "set-value operation",
            Self::ActivateOperation => "activate operation",
        };
        f.write_str(name)
    }
}

/// A descriptor in the information model.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Descriptor {
    /// The descriptor's handle.
    pub handle: Handle,
    /// What kind of entity this describes.
    pub kind: DescriptorKind,
}

impl Descriptor {
    /// Creates a new descriptor.
    pub fn new(handle: impl Into<Handle>, kind: DescriptorKind) -> Self {
        Self {
            handle: handle.into(),
            kind,
        }
    }
}

/// The kind of a context.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ContextKind {
    /// The patient associated with the device.
    Patient,
    /// Where the device is located.
    Location,
}

impl ContextKind {
    /// The descriptor kind that holds states of this context kind.
    pub fn descriptor_kind(self) -> DescriptorKind {
        match self {
            Self::Patient => DescriptorKind::PatientContext,
            Self::Location => DescriptorKind::LocationContext,
        }
    }
}

/// Whether a context state is associated with the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContextAssociation {
    /// Not associated.
    NotAssociated,
    /// Associated.
    Associated,
    /// Previously associated.
    Disassociated,
}

/// A context state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContextState {
    /// The state's own handle.
    pub handle: Handle,
    /// The descriptor the state belongs to.
    pub descriptor: Handle,
    /// Which kind of context this is.
    pub kind: ContextKind,
    /// The association state.
    pub association: ContextAssociation,
    /// A human-readable summary of the context's content.
    pub summary: String,
}

/// The location of a device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocationDetail {
    /// Facility.
    pub facility: String,
    /// Point of care.
    pub point_of_care: String,
    /// Bed.
    pub bed: String,
}

impl fmt::Display for LocationDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.facility, self.point_of_care, self.bed)
    }
}

/// Patient demographics, written to the patient context.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PatientDemographics {
    /// Given name.
    pub given_name: String,
    /// Family name.
    pub family_name: String,
    /// Birth name.
    pub birth_name: String,
}

impl fmt::Display for PatientDemographics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.given_name, self.family_name)
    }
}

/// A single write within a [`Transaction`].
#[derive(Clone, Debug, PartialEq)]
pub enum StateWrite {
    /// Sets a metric's value.
    MetricValue {
        /// The metric to write.
        handle: Handle,
        /// The new value.
        value: MetricValue,
    },
    /// Sets whether an alert condition is present.
    AlertPresence {
        /// The alert condition to write.
        handle: Handle,
        /// Whether the condition is present.
        presence: bool,
    },
    /// Associates a new location.
    Location {
        /// The location.
        detail: LocationDetail,
        /// Identifiers of whoever validated the location.
        validators: Vec<String>,
    },
    /// Associates a new patient.
    Patient(PatientDemographics),
}

/// An atomic mutation of the information model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transaction {
    writes: Vec<StateWrite>,
}

impl Transaction {
    /// Creates an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a metric write.
    pub fn metric_value(mut self, handle: impl Into<Handle>, value: MetricValue) -> Self {
        self.writes.push(StateWrite::MetricValue {
            handle: handle.into(),
            value,
        });
        self
    }

    /// Adds an alert-presence write.
    pub fn alert_presence(mut self, handle: impl Into<Handle>, presence: bool) -> Self {
        self.writes.push(StateWrite::AlertPresence {
            handle: handle.into(),
            presence,
        });
        self
    }

    /// Adds a location association.
    pub fn location(mut self, detail: LocationDetail, validators: Vec<String>) -> Self {
        self.writes.push(StateWrite::Location { detail, validators });
        self
    }

    /// Adds a patient association.
    pub fn patient(mut self, patient: PatientDemographics) -> Self {
        self.writes.push(StateWrite::Patient(patient));
        self
    }

    /// Returns the writes in this transaction.
    pub fn writes(&self) -> &[StateWrite] {
        &self.writes
    }

    /// Consumes the transaction, returning its writes.
    pub fn into_writes(self) -> Vec<StateWrite> {
        self.writes
    }
}

/// The kind of update a callback can be bound to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum UpdateKind {
    /// Metric state updates.
    Metric,
    /// Alert state updates.
    Alert,
}

/// The new content of a state.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateValue {
    /// A metric's new value, if it has one.
    Metric(Option<MetricValue>),
    /// An alert condition's new presence.
    AlertPresence(bool),
}

/// One updated state.
#[derive(Clone, Debug, PartialEq)]
pub struct StateUpdate {
    /// The state that changed.
    pub handle: Handle,
    /// Its new content.
    pub value: UpdateValue,
}

/// A report delivered to the consumer. Each report can carry several states.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateBatch {
    /// The kind of states in this report.
    pub kind: UpdateKind,
    /// The updated states.
    pub states: Vec<StateUpdate>,
}

/// Identifies a callback bound with [`ConsumerModel::bind`](super::ConsumerModel::bind).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BindingId(pub u64);

/// The operations sdc-soak invokes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OperationKind {
    /// Set a string metric.
    SetString,
    /// Set a numeric metric.
    SetValue,
    /// Trigger an activation.
    Activate,
}

impl OperationKind {
    /// All operation kinds, in invocation order.
    pub const ALL: [Self; 3] = [Self::SetString, Self::SetValue, Self::Activate];

    /// The descriptor kind of operations of this kind.
    pub fn descriptor_kind(self) -> DescriptorKind {
        match self {
            Self::SetString => DescriptorKind::SetStringOperation,
            Self::SetValue => DescriptorKind::SetValueOperation,
            Self::Activate => DescriptorKind::ActivateOperation,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetString => f.write_str("SetString"),
            Self::SetValue => f.write_str("SetValue"),
            Self::Activate => f.write_str("Activate"),
        }
    }
}

/// The argument of an operation invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationArgument {
    /// A string for a set-string operation.
    String(String),
    /// A value for a set-value operation.
    Value(Decimal),
    /// Arguments for an activate operation.
    Activate(Vec<String>),
}

/// A request to invoke an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationRequest {
    /// The kind of operation.
    pub kind: OperationKind,
    /// The operation descriptor's handle.
    pub target: Handle,
    /// The argument.
    pub argument: OperationArgument,
}

/// The state of an invoked operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum InvocationState {
    /// Queued.
    Waiting,
    /// Running.
    Started,
    /// Cancelled by the device.
    Cancelled,
    /// Cancelled by a user.
    CancelledManually,
    /// Completed.
    Finished,
    /// Completed, with the request modified by the device.
    FinishedWithModification,
    /// Failed.
    Failed,
}

impl InvocationState {
    /// Returns true if this state denotes successful completion.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Finished | Self::FinishedWithModification)
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "Wait",
            Self::Started => "Start",
            Self::Cancelled => "Cnclld",
            Self::CancelledManually => "CnclldMan",
            Self::Finished => "Fin",
            Self::FinishedWithModification => "FinMod",
            Self::Failed => "Fail",
        };
        f.write_str(name)
    }
}

/// A service found by discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveredService {
    /// The endpoint reference URN the service announced.
    pub epr: String,
    /// Where the service can be reached.
    pub address: String,
}

impl DiscoveredService {
    /// Returns true if this service announced `epr`.
    pub fn matches(&self, epr: Epr) -> bool {
        self.epr.ends_with(&epr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Decimal::from_integer(72), "72"; "integer")]
    #[test_case(Decimal::from_f64(96.25, 2).unwrap(), "96.25"; "two digits")]
    #[test_case(Decimal::from_f64(-0.5, 1).unwrap(), "-0.5"; "negative fraction")]
    #[test_case(Decimal::from_f64(60.004, 2).unwrap(), "60.00"; "rounds down")]
    fn decimal_display(value: Decimal, expected: &str) {
        assert_eq!(value.to_string(), expected);
    }

    #[test]
    fn decimal_rejects_non_finite() {
        assert_eq!(Decimal::from_f64(f64::NAN, 2), None);
        assert_eq!(Decimal::from_f64(f64::INFINITY, 0), None);
        assert_eq!(Decimal::from_f64(1.0, 12), None);
    }

    #[test]
    fn service_matches_epr_suffix() {
        let epr = Epr::new_v4();
        let service = DiscoveredService {
            epr: epr_urn(epr),
            address: "https://127.0.0.1:6464".to_owned(),
        };
        assert!(service.matches(epr));
        assert!(!service.matches(Epr::new_v4()));
    }
}
