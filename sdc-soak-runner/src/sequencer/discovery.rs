// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::DiscoverySettings,
    device::{DiscoveredService, Discovery, Epr},
    errors::DiscoveryError,
    helpers::plural,
    stop::StopSignal,
};
use tokio::time::Instant;
use tracing::{debug, info};

/// Searches for the service announcing `epr` until it is found, the timeout elapses, the attempt
/// cap is reached or `stop` is raised.
///
/// The attempt cap only applies to searches that didn't find the service: a search that finds it
/// always succeeds, even if it is the last allowed attempt.
pub async fn discover_service(
    discovery: &dyn Discovery,
    epr: Epr,
    settings: &DiscoverySettings,
    stop: &StopSignal,
) -> Result<DiscoveredService, DiscoveryError> {
    let deadline = Instant::now() + settings.timeout;
    let mut attempts = 0;

    loop {
        if stop.is_stopped() {
            return Err(DiscoveryError::Interrupted);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DiscoveryError::Timeout {
                timeout: settings.timeout,
            });
        }

        let services = tokio::select! {
            result = tokio::time::timeout(remaining, discovery.search_services()) => {
                match result {
                    Ok(Ok(services)) => services,
                    Ok(Err(error)) => return Err(DiscoveryError::Search(error)),
                    Err(_) => {
                        return Err(DiscoveryError::Timeout {
                            timeout: settings.timeout,
                        });
                    }
                }
            }
            _ = stop.stopped() => return Err(DiscoveryError::Interrupted),
        };
        attempts += 1;

        debug!(
            "search {attempts} found {} {}: {:?}",
            services.len(),
            plural::services_str(services.len()),
            services.iter().map(|service| &service.epr).collect::<Vec<_>>(),
        );
        if let Some(service) = services.into_iter().find(|service| service.matches(epr)) {
            info!("found service `{}` at {}", service.epr, service.address);
            return Ok(service);
        }

        if settings
            .max_attempts
            .is_some_and(|max_attempts| attempts >= max_attempts)
        {
            return Err(DiscoveryError::AttemptsExhausted { attempts });
        }
        debug!("search {attempts}: no matching service, retrying");

        tokio::select! {
            _ = tokio::time::sleep(settings.retry_interval) => {}
            _ = stop.stopped() => return Err(DiscoveryError::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceStack, Provider, ProviderSettings, sim::SimStack},
        stop::StopReason,
    };
    use std::{sync::Arc, time::Duration};

    fn settings(max_attempts: Option<usize>) -> DiscoverySettings {
        DiscoverySettings {
            timeout: Duration::from_secs(5),
            max_attempts,
            retry_interval: Duration::from_millis(100),
        }
    }

    fn started_discovery(stack: &SimStack) -> Arc<dyn Discovery> {
        let discovery = stack.discovery(&stack.adapters()[0]).unwrap();
        discovery.start().unwrap();
        discovery
    }

    fn started_provider(stack: &SimStack, epr: Epr) -> Arc<dyn Provider> {
        let provider = stack
            .provider(started_discovery(stack), ProviderSettings { epr, tls: None })
            .unwrap();
        provider.start().unwrap();
        provider
    }

    #[tokio::test(start_paused = true)]
    async fn finds_matching_service() {
        let stack = SimStack::new();
        let epr = Epr::new_v4();
        let _other = started_provider(&stack, Epr::new_v4());
        let _provider = started_provider(&stack, epr);

        let discovery = started_discovery(&stack);
        let service = discover_service(&*discovery, epr, &settings(None), &StopSignal::new())
            .await
            .unwrap();
        assert!(service.matches(epr));
    }

    #[tokio::test(start_paused = true)]
    async fn finds_late_provider() {
        let stack = SimStack::new();
        let epr = Epr::new_v4();
        let discovery = started_discovery(&stack);

        let late = tokio::spawn({
            let stack = stack.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                started_provider(&stack, epr)
            }
        });

        let service = discover_service(&*discovery, epr, &settings(None), &StopSignal::new())
            .await
            .unwrap();
        assert!(service.matches(epr));
        late.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let stack = SimStack::new();
        let discovery = started_discovery(&stack);

        let start = Instant::now();
        let err = discover_service(&*discovery, Epr::new_v4(), &settings(None), &StopSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Timeout { .. }), "{err}");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_applies_after_failed_searches() {
        let stack = SimStack::new();
        let discovery = started_discovery(&stack);

        let err = discover_service(
            &*discovery,
            Epr::new_v4(),
            &settings(Some(3)),
            &StopSignal::new(),
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, DiscoveryError::AttemptsExhausted { attempts: 3 }),
            "{err}"
        );

        // A single allowed attempt that finds the service succeeds.
        let epr = Epr::new_v4();
        let _provider = started_provider(&stack, epr);
        discover_service(&*discovery, epr, &settings(Some(1)), &StopSignal::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_discovery_fails_search() {
        let stack = SimStack::new();
        let discovery = started_discovery(&stack);
        discovery.stop();

        let err = discover_service(&*discovery, Epr::new_v4(), &settings(None), &StopSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Search(_)), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn observes_stop_signal() {
        let stack = SimStack::new();
        let discovery = started_discovery(&stack);
        let stop = StopSignal::new();

        tokio::spawn({
            let stop = stop.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                stop.trigger(StopReason::Interrupted);
            }
        });

        let err = discover_service(&*discovery, Epr::new_v4(), &settings(None), &stop)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Interrupted), "{err}");
    }
}
