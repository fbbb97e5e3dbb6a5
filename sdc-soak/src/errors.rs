// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use sdc_soak_metadata::SoakExitCode;
use sdc_soak_runner::errors::*;
use std::error::Error;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// Note that the #[error()] strings are mostly placeholder messages -- the expected way to print out
// errors is with the display_to_stderr method.

/// An error that sdc-soak expects to occur and reports without a backtrace.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("could not determine the current directory")]
    CurrentDir {
        #[source]
        err: std::io::Error,
    },
    #[error("TLS setup error")]
    TlsSetup {
        #[source]
        err: TlsConfigError,
    },
    #[error("failed to create Tokio runtime")]
    TokioRuntimeCreate {
        #[source]
        err: std::io::Error,
    },
    #[error("signal handler setup error")]
    SignalHandlerSetupError {
        #[from]
        err: SignalHandlerSetupError,
    },
    #[error("harness error")]
    HarnessError {
        #[from]
        err: HarnessError,
    },
    #[error("error writing report")]
    WriteReportError {
        #[from]
        err: WriteReportError,
    },
}

impl ExpectedError {
    /// Returns the exit code for the process. Setup errors exit like a failed run.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigParseError { .. }
            | Self::CurrentDir { .. }
            | Self::TlsSetup { .. }
            | Self::TokioRuntimeCreate { .. }
            | Self::SignalHandlerSetupError { .. }
            | Self::HarnessError { .. }
            | Self::WriteReportError { .. } => SoakExitCode::RUN_FAILED,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self) {
        let mut next_error = match &self {
            Self::ConfigParseError { err } => {
                error!("{err}");
                err.source()
            }
            Self::CurrentDir { err } => {
                error!("could not determine the current directory");
                Some(err as &dyn Error)
            }
            Self::TlsSetup { err } => {
                error!("failed to set up TLS");
                Some(err as &dyn Error)
            }
            Self::TokioRuntimeCreate { err } => {
                error!("failed to create Tokio runtime");
                Some(err as &dyn Error)
            }
            Self::SignalHandlerSetupError { err } => {
                error!("failed to set up signal handler");
                Some(err as &dyn Error)
            }
            Self::HarnessError { err } => {
                error!("{err}");
                err.source()
            }
            Self::WriteReportError { err } => {
                error!("{err}");
                err.source()
            }
        };

        while let Some(err) = next_error {
            error!(target: "sdc_soak::no_heading", "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
