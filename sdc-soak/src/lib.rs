// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A conformance and soak-test harness for SDC (IEEE 11073) medical-device communication.
//!
//! The `sdc-soak` binary starts a reference provider and exercises it from the consumer side.
//! The logic lives in [`sdc_soak_runner`]; this crate is the command-line front end.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
