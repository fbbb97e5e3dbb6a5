// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable output for [sdc-soak](https://crates.io/crates/sdc-soak).
//!
//! The types in this crate are what `sdc-soak --message-format json` prints, and
//! the exit codes the binary documents.

mod exit_codes;
mod summary;

pub use exit_codes::*;
pub use summary::*;
