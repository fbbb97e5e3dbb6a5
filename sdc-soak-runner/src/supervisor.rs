// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Supervision of the background provider task.
//!
//! The provider runs as an independent tokio task. It reports its [`Readiness`] exactly once
//! through a [`ReadinessReporter`]; [`ProviderSupervisor::supervise`] waits for that report, for
//! the task to end, for the startup timeout or for the stop signal, whichever comes first.

use crate::{
    config::StartupSettings, errors::StartupError, helpers::FormattedDuration, stop::StopSignal,
};
use std::future::Future;
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

/// The startup state of a provider task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Readiness {
    /// The task hasn't reported yet.
    Pending,
    /// The provider is up.
    Ready,
    /// Setup failed.
    Failed(String),
}

/// The provider task's half of the readiness channel.
///
/// Reporting consumes the reporter, so readiness is written at most once. Dropping it without
/// reporting is treated as the task giving up.
#[derive(Debug)]
pub struct ReadinessReporter {
    sender: watch::Sender<Readiness>,
}

impl ReadinessReporter {
    /// Creates a reporter along with the receiver the supervisor waits on.
    pub fn new() -> (Self, watch::Receiver<Readiness>) {
        let (sender, receiver) = watch::channel(Readiness::Pending);
        (Self { sender }, receiver)
    }

    /// Reports that the provider is up.
    pub fn ready(self) {
        self.sender.send_replace(Readiness::Ready);
    }

    /// Reports that setup failed.
    pub fn failed(self, reason: impl Into<String>) {
        self.sender.send_replace(Readiness::Failed(reason.into()));
    }
}

/// A supervised provider task.
///
/// The task may already have finished while the supervisor was waiting, in which case its
/// output is kept here.
#[derive(Debug)]
pub struct ProviderTask<T> {
    state: TaskState<T>,
}

#[derive(Debug)]
enum TaskState<T> {
    Running(JoinHandle<T>),
    Finished(Result<T, JoinError>),
}

impl<T> ProviderTask<T> {
    /// Returns true if the task has finished.
    pub fn is_finished(&self) -> bool {
        match &self.state {
            TaskState::Running(handle) => handle.is_finished(),
            TaskState::Finished(_) => true,
        }
    }

    /// Aborts the task if it is still running.
    pub fn abort(&self) {
        if let TaskState::Running(handle) = &self.state {
            handle.abort();
        }
    }

    /// Waits for the task to finish and returns its output.
    pub async fn join(self) -> Result<T, JoinError> {
        match self.state {
            TaskState::Running(handle) => handle.await,
            TaskState::Finished(result) => result,
        }
    }
}

/// The result of [`ProviderSupervisor::supervise`].
#[derive(Debug)]
pub struct Supervised<T> {
    /// `Ok` if the provider reported readiness.
    ///
    /// [`StartupError::Timeout`] is a soft failure: the task keeps running and the caller may
    /// proceed in degraded mode.
    pub startup: Result<(), StartupError>,

    /// The provider task.
    pub task: ProviderTask<T>,
}

/// Launches provider tasks and waits for them to become ready.
#[derive(Clone, Debug)]
pub struct ProviderSupervisor {
    settings: StartupSettings,
    stop: StopSignal,
}

impl ProviderSupervisor {
    /// Creates a new supervisor.
    pub fn new(settings: StartupSettings, stop: StopSignal) -> Self {
        Self { settings, stop }
    }

    /// Spawns the task produced by `start` and waits for its startup to resolve.
    ///
    /// `start` is called with the reporter the task must use to signal readiness.
    pub async fn supervise<F, Fut, T>(&self, start: F) -> Supervised<T>
    where
        F: FnOnce(ReadinessReporter) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reporter, receiver) = ReadinessReporter::new();
        let handle = tokio::spawn(start(reporter));
        self.wait(handle, receiver).await
    }

    async fn wait<T>(
        &self,
        mut handle: JoinHandle<T>,
        mut receiver: watch::Receiver<Readiness>,
    ) -> Supervised<T> {
        let started = Instant::now();
        let deadline = started + self.settings.timeout;
        let mut poll = tokio::time::interval_at(
            started + self.settings.poll_interval,
            self.settings.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let readiness = async {
            receiver
                .wait_for(|readiness| *readiness != Readiness::Pending)
                .await
                .map(|readiness| (*readiness).clone())
        };
        tokio::pin!(readiness);
        // Set once the reporter is dropped without reporting.
        let mut reporter_gone = false;

        loop {
            tokio::select! {
                // A report always wins over the task exiting right after it.
                biased;

                result = &mut readiness, if !reporter_gone => match result {
                    Ok(Readiness::Ready) => {
                        debug!(
                            "provider ready after {}",
                            FormattedDuration(started.elapsed())
                        );
                        return Supervised {
                            startup: Ok(()),
                            task: running(handle),
                        };
                    }
                    Ok(Readiness::Failed(reason)) => {
                        return Supervised {
                            startup: Err(StartupError::Failed { reason }),
                            task: running(handle),
                        };
                    }
                    Ok(Readiness::Pending) | Err(_) => {
                        // The task is about to end; its exit is picked up below.
                        reporter_gone = true;
                    }
                },
                result = &mut handle => {
                    let startup = Err(StartupError::Exited {
                        detail: exit_detail(&result),
                    });
                    return Supervised {
                        startup,
                        task: ProviderTask {
                            state: TaskState::Finished(result),
                        },
                    };
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Supervised {
                        startup: Err(StartupError::Timeout {
                            timeout: self.settings.timeout,
                        }),
                        task: running(handle),
                    };
                }
                _ = self.stop.stopped() => {
                    return Supervised {
                        startup: Err(StartupError::Interrupted),
                        task: running(handle),
                    };
                }
                _ = poll.tick() => {
                    debug!(
                        "waiting for provider readiness ({} elapsed)",
                        FormattedDuration(started.elapsed())
                    );
                }
            }
        }
    }
}

fn running<T>(handle: JoinHandle<T>) -> ProviderTask<T> {
    ProviderTask {
        state: TaskState::Running(handle),
    }
}

fn exit_detail<T>(result: &Result<T, JoinError>) -> String {
    match result {
        Ok(_) => "task returned before reporting readiness".to_owned(),
        Err(error) if error.is_panic() => "task panicked".to_owned(),
        Err(_) => "task was cancelled".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopReason;
    use std::time::Duration;

    fn supervisor(stop: StopSignal) -> ProviderSupervisor {
        ProviderSupervisor::new(
            StartupSettings {
                timeout: Duration::from_secs(10),
                poll_interval: Duration::from_secs(2),
            },
            stop,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn ready_resolves_before_timeout() {
        let started = Instant::now();
        let supervised = supervisor(StopSignal::new())
            .supervise(|reporter| async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                reporter.ready();
                tokio::time::sleep(Duration::from_secs(60)).await;
                7
            })
            .await;

        supervised.startup.expect("provider is ready");
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert!(!supervised.task.is_finished());
        assert_eq!(supervised.task.join().await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn reported_failure_is_returned() {
        let supervised = supervisor(StopSignal::new())
            .supervise(|reporter| async move {
                reporter.failed("no adapter");
            })
            .await;

        match supervised.startup {
            Err(StartupError::Failed { reason }) => assert_eq!(reason, "no adapter"),
            other => panic!("unexpected startup result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_exit_is_an_error() {
        let supervised = supervisor(StopSignal::new())
            .supervise(|reporter| async move {
                drop(reporter);
                "done"
            })
            .await;

        let err = supervised.startup.unwrap_err();
        assert!(matches!(err, StartupError::Exited { .. }), "{err}");
        assert!(err.is_fatal());
        assert!(supervised.task.is_finished());
        assert_eq!(supervised.task.join().await.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_soft() {
        let started = Instant::now();
        let supervised = supervisor(StopSignal::new())
            .supervise(|reporter| async move {
                tokio::time::sleep(Duration::from_secs(15)).await;
                reporter.ready();
            })
            .await;

        let err = supervised.startup.unwrap_err();
        assert!(matches!(err, StartupError::Timeout { .. }), "{err}");
        assert!(!err.is_fatal());
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        supervised.task.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_interrupts_wait() {
        let stop = StopSignal::new();
        tokio::spawn({
            let stop = stop.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                stop.trigger(StopReason::Interrupted);
            }
        });

        let supervised = supervisor(stop)
            .supervise(|reporter| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                reporter.ready();
            })
            .await;

        assert!(matches!(
            supervised.startup,
            Err(StartupError::Interrupted)
        ));
        supervised.task.abort();
    }
}
