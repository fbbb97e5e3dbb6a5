// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The stop signal shared by the provider loop, the supervisor and the sequencer.

use std::{fmt, sync::Arc};
use tokio::sync::watch;

/// Why a run was asked to stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// The configured run duration elapsed.
    DurationElapsed,

    /// The consuming side finished and no longer needs the provider.
    RunFinished,

    /// The user interrupted the run.
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DurationElapsed => f.write_str("run duration elapsed"),
            Self::RunFinished => f.write_str("run finished"),
            Self::Interrupted => f.write_str("interrupted by user"),
        }
    }
}

/// A one-shot, cloneable stop signal.
///
/// The signal is raised at most once; later calls to [`trigger`](Self::trigger) are ignored and
/// the first reason sticks.
#[derive(Clone, Debug)]
pub struct StopSignal {
    sender: Arc<watch::Sender<Option<StopReason>>>,
}

impl StopSignal {
    /// Creates a new, unraised stop signal.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Raises the signal. Returns true if this call raised it.
    pub fn trigger(&self, reason: StopReason) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Returns the reason the signal was raised with, if it was.
    pub fn reason(&self) -> Option<StopReason> {
        *self.sender.borrow()
    }

    /// Returns true if the signal has been raised.
    pub fn is_stopped(&self) -> bool {
        self.reason().is_some()
    }

    /// Waits until the signal is raised and returns the reason.
    pub async fn stopped(&self) -> StopReason {
        let mut receiver = self.sender.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(reason) => reason.unwrap_or(StopReason::RunFinished),
            // The sender lives as long as `self`, so the channel can't close while we wait.
            Err(_) => StopReason::RunFinished,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
