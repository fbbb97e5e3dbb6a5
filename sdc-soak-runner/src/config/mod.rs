// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for sdc-soak.
//!
//! Configuration is layered: the embedded default config, an optional config file, `ref_*`
//! environment variables, and finally command-line overrides. The result is compiled into a
//! [`HarnessConfig`].

mod imp;
mod tls;

pub use imp::*;
pub use tls::*;
