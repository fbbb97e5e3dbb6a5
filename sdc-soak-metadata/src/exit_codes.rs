// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `sdc-soak` runs.
///
/// Unknown/unexpected failures will always result in exit code 1, the same as a failed run.
pub enum SoakExitCode {}

impl SoakExitCode {
    /// Every recorded phase passed.
    pub const OK: i32 = 0;

    /// At least one phase failed or was skipped, or the provider could not be started.
    pub const RUN_FAILED: i32 = 1;

    /// The run was interrupted by the user (Ctrl-C or a termination signal).
    pub const USER_ABORT: i32 = 2;
}
