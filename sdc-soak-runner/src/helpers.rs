// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for sdc-soak-runner.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// Utilities for pluralizing various words based on count.
pub mod plural {
    /// Returns "record" if `count` is 1, otherwise "records".
    pub fn records_str(count: usize) -> &'static str {
        if count == 1 { "record" } else { "records" }
    }

    /// Returns "update" if `count` is 1, otherwise "updates".
    pub fn updates_str(count: usize) -> &'static str {
        if count == 1 { "update" } else { "updates" }
    }

    /// Returns "service" if `count` is 1, otherwise "services".
    pub fn services_str(count: usize) -> &'static str {
        if count == 1 { "service" } else { "services" }
    }
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Every mutex in this crate guards plain data that stays consistent across a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub(crate) struct FormattedDuration(pub(crate) Duration);

impl fmt::Display for FormattedDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let duration = self.0.as_secs_f64();
        if duration > 60.0 {
            write!(f, "{}m {:.2}s", duration as u32 / 60, duration % 60.0)
        } else {
            write!(f, "{duration:.2}s")
        }
    }
}
