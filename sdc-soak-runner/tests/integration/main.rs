// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end runs of the harness against the in-process device stack.

mod fixtures;
mod harness;
mod sequencer;
