// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for sdc-soak, a conformance and soak-test harness for SDC (IEEE 11073)
//! medical-device communication.
//!
//! A run starts a reference provider in the background, then exercises it from the consumer
//! side: discovery, connection, context and metric checks, operation invocations, fault
//! injection and throughput sampling. Device communication goes through the traits in
//! [`device`]; [`device::sim::SimStack`] is an in-process implementation of them.
//!
//! The entry point is [`harness::Harness`].

pub mod commlog;
pub mod config;
pub mod device;
pub mod errors;
pub mod fault;
pub mod harness;
mod helpers;
pub mod provider;
pub mod reporter;
pub mod sampler;
pub mod sequencer;
pub mod signal;
pub mod stop;
pub mod supervisor;
mod time;
