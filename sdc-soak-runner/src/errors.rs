// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by sdc-soak.

use crate::device::{DescriptorKind, Handle};
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{error::Error, fmt, time::Duration};
use swrite::{SWrite, swrite};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error(
    "failed to parse sdc-soak config{}",
    .config_file.as_ref().map(|file| format!(" at `{file}`")).unwrap_or_default()
)]
pub struct ConfigParseError {
    config_file: Option<Utf8PathBuf>,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: Option<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self { config_file, kind }
    }

    /// Returns the config file that failed to parse, if one was specified.
    pub fn config_file(&self) -> Option<&Utf8PathBuf> {
        self.config_file.as_ref()
    }

    /// Returns the kind of error that occurred.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of [`ConfigParseError`] that occurred.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the layered config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// A value deserialized correctly but is out of range.
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue {
        /// The key with the invalid value.
        key: &'static str,

        /// Why the value is invalid.
        reason: String,
    },
}

/// An error that occurred while locating TLS material.
#[derive(Debug, Error)]
pub enum TlsConfigError {
    /// None of the candidate certificate folders exist.
    #[error(
        "no certificate folder found (searched: {})",
        .searched.iter().map(|path| format!("`{path}`")).collect::<Vec<_>>().join(", ")
    )]
    NoCertificateFolder {
        /// The folders that were searched, in order.
        searched: Vec<Utf8PathBuf>,
    },

    /// The certificate folder is missing required files.
    #[error("certificate folder `{folder}` is missing {}", .missing.join(", "))]
    MissingFiles {
        /// The certificate folder.
        folder: Utf8PathBuf,

        /// The names of the missing files.
        missing: Vec<&'static str>,
    },
}

/// An error that occurred while selecting a network adapter.
#[derive(Clone, Debug, Error)]
pub enum AdapterSelectionError {
    /// The device library reported no network adapters at all.
    #[error("no network adapters found")]
    NoAdapters,
}

/// An error reported by the device-communication library.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum DeviceError {
    /// Discovery was used while stopped.
    #[error("discovery is not running")]
    DiscoveryStopped,

    /// The provider isn't reachable.
    #[error("provider `{epr}` is not reachable")]
    ProviderUnreachable {
        /// The endpoint reference that was contacted.
        epr: String,
    },

    /// One side of the connection uses TLS and the other doesn't.
    #[error("TLS mismatch between provider (tls: {provider_tls}) and consumer (tls: {consumer_tls})")]
    TlsMismatch {
        /// Whether the provider uses TLS.
        provider_tls: bool,

        /// Whether the consumer uses TLS.
        consumer_tls: bool,
    },

    /// The session has been closed.
    #[error("session is closed")]
    SessionClosed,

    /// The provider could not be started.
    #[error("provider failed to start: {reason}")]
    StartFailed {
        /// Why the provider failed to start.
        reason: String,
    },

    /// Any other error reported by the library.
    #[error("{message}")]
    Other {
        /// The library's message.
        message: String,
    },
}

/// A transaction against the information model was rejected.
#[derive(Clone, Debug, Error)]
pub enum TransactionError {
    /// The transaction refers to a handle that doesn't exist.
    #[error("unknown handle `{handle}`")]
    UnknownHandle {
        /// The unknown handle.
        handle: Handle,
    },

    /// The transaction writes a state of the wrong kind.
    #[error("`{handle}` is a {actual}, not a {expected}")]
    KindMismatch {
        /// The handle that was written.
        handle: Handle,

        /// The kind the write requires.
        expected: DescriptorKind,

        /// The kind of the descriptor.
        actual: DescriptorKind,
    },

    /// A value has the wrong representation, for example a float where a decimal is required.
    #[error("`{handle}` requires a {expected} value, got {found}")]
    WrongRepresentation {
        /// The handle that was written.
        handle: Handle,

        /// The required representation.
        expected: &'static str,

        /// The representation that was written.
        found: &'static str,
    },

    /// The device library failed to apply the transaction.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// The background provider failed to start, or didn't start in time.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The provider didn't report readiness within the timeout.
    ///
    /// This is a soft failure: the caller may continue in degraded mode.
    #[error("provider did not report readiness within {timeout:?}")]
    Timeout {
        /// The startup timeout.
        timeout: Duration,
    },

    /// The provider task reported a failure.
    #[error("provider reported a startup failure: {reason}")]
    Failed {
        /// The reported reason.
        reason: String,
    },

    /// The provider task terminated before it reported readiness.
    #[error("provider task terminated unexpectedly: {detail}")]
    Exited {
        /// How the task terminated.
        detail: String,
    },

    /// The stop signal was raised while waiting.
    #[error("interrupted while waiting for the provider to start")]
    Interrupted,
}

impl StartupError {
    /// Returns true if the harness can't proceed after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout { .. })
    }
}

/// An error that stopped a provider task.
#[derive(Debug, Error)]
pub enum ProviderRunError {
    /// No usable network adapter.
    #[error("failed to select a network adapter")]
    Adapter(#[from] AdapterSelectionError),

    /// The device library failed.
    #[error("device library error")]
    Device(#[from] DeviceError),

    /// The reference data couldn't be written.
    #[error("failed to write reference data")]
    ReferenceData(#[source] TransactionError),

    /// A descriptor the provider needs is missing from the model.
    #[error("descriptor `{handle}` not found in the information model")]
    MissingDescriptor {
        /// The missing handle.
        handle: Handle,
    },
}

/// Discovery didn't find the provider under test.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No usable network adapter.
    #[error("failed to select a network adapter")]
    Adapter(#[from] AdapterSelectionError),

    /// Discovery couldn't be started.
    #[error("failed to start discovery")]
    Start(#[source] DeviceError),

    /// A search failed.
    #[error("service search failed")]
    Search(#[source] DeviceError),

    /// The timeout elapsed without a matching service.
    #[error("no matching service within {timeout:?}")]
    Timeout {
        /// The discovery timeout.
        timeout: Duration,
    },

    /// The attempt cap was reached without a matching service.
    #[error("no matching service after {attempts} attempts")]
    AttemptsExhausted {
        /// The number of searches performed.
        attempts: usize,
    },

    /// The stop signal was raised during discovery.
    #[error("interrupted during discovery")]
    Interrupted,
}

/// Connecting to the discovered provider failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The device library failed to connect.
    #[error("failed to connect to device")]
    Device(#[source] DeviceError),

    /// The connection didn't complete in time.
    #[error("connection did not complete within {timeout:?}")]
    Timeout {
        /// The connect timeout.
        timeout: Duration,
    },
}

/// Loading the information model or subscribing failed.
#[derive(Debug, Error)]
pub enum ModelInitError {
    /// The device library failed.
    #[error("failed to initialize the information model")]
    Device(#[source] DeviceError),

    /// Initialization didn't complete in time.
    #[error("model initialization did not complete within {timeout:?}")]
    Timeout {
        /// The timeout.
        timeout: Duration,
    },
}

/// An operation invocation didn't produce a terminal state.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The invocation didn't complete within the operation timeout.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// The operation timeout.
        timeout: Duration,
    },

    /// The device library failed.
    #[error(transparent)]
    Device(DeviceError),
}

/// The throughput sampler didn't receive any data.
#[derive(Debug, Error)]
pub enum SamplerError {
    /// Zero updates arrived during the sampling window.
    #[error("no updates received within {duration:?}")]
    NoDataReceived {
        /// The sampling window.
        duration: Duration,
    },
}

/// An error that occurred while capturing protocol traffic.
#[derive(Debug, Error)]
pub enum CommLogError {
    /// The log directory couldn't be created.
    #[error("failed to create comm-log directory `{dir}`")]
    CreateDir {
        /// The directory.
        dir: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The log file couldn't be created.
    #[error("failed to create comm-log file `{path}`")]
    CreateFile {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Writing to the log file failed.
    #[error("failed to write comm-log file `{path}`")]
    Write {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// No home directory to put the default comm-log directory in.
    #[error("could not determine the home directory for the default comm-log directory")]
    NoHomeDir,
}

/// A fatal error in one of the harness commands.
///
/// Failures of the run itself are recorded in its report. These errors mean the run couldn't be
/// set up at all.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// TLS was requested but the material couldn't be loaded.
    #[error("failed to load TLS material")]
    Tls(#[from] TlsConfigError),
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// An error that occurred while writing a report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteReportError {
    /// Writing to the output stream failed.
    #[error("error writing to output")]
    Io(#[from] std::io::Error),

    /// Serializing the JSON summary failed.
    #[error("error serializing JSON summary")]
    Json(#[from] serde_json::Error),

    /// Creating the JUnit report or its parent directory failed.
    #[error("error creating `{path}` for JUnit report")]
    JunitFs {
        /// The file or directory being created.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Writing the JUnit report failed.
    #[error("error writing JUnit report to `{path}`")]
    Junit {
        /// The report path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: quick_junit::SerializeError,
    },
}

/// Displays an error along with its chain of sources.
///
/// The top-level message is printed first, followed by one `caused by:` line per source.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        let mut source = self.error.source();
        while let Some(err) = source {
            write!(f, "\n  caused by: {err}")?;
            source = err.source();
        }

        Ok(())
    }
}

/// Formats an error and its sources on one line, separated by `: `.
///
/// Used for detail strings in summaries, which are single-line by convention.
pub(crate) fn one_line(error: &dyn Error) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(err) = source {
        swrite!(out, ": {err}");
        source = err.source();
    }
    out
}
