// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8Path;
use sdc_soak_runner::{
    config::{ConfigOverrides, EnvironmentSource, HarnessConfig},
    device::{
        DeviceStack, Discovery, Provider, ProviderSettings,
        sim::{SimBehavior, SimStack},
    },
    harness::Harness,
    sequencer::{CheckId, TestRecord, Verdict},
    stop::StopSignal,
};
use std::sync::Arc;

/// Loads the default config with short waits and the comm-log turned off.
///
/// The process environment is ignored so that `ref_*` variables on the machine running the tests
/// don't leak in.
pub(crate) fn test_config(extra: &[(&str, &str)]) -> HarnessConfig {
    let mut overrides = ConfigOverrides::new();
    overrides
        .set("enable_commlog", false)
        .set("metric_wait", 5)
        .set("min_updates", 3)
        .set("discovery_timeout", 5)
        .set("fault.duration", 12);
    for (key, value) in extra {
        overrides.set(*key, *value);
    }
    HarnessConfig::from_sources(
        None,
        EnvironmentSource::Custom(Default::default()),
        &overrides,
    )
    .expect("test config is valid")
}

/// Like [`test_config`], but capturing protocol traffic to `dir`.
pub(crate) fn test_config_with_commlog(dir: &Utf8Path) -> HarnessConfig {
    test_config(&[("enable_commlog", "true"), ("commlog_dir", dir.as_str())])
}

pub(crate) fn harness(behavior: SimBehavior, config: HarnessConfig) -> (Harness, StopSignal) {
    let stop = StopSignal::new();
    let stack = Arc::new(SimStack::with_behavior(behavior));
    (Harness::new(stack, config, stop.clone()), stop)
}

/// Starts a bare provider on `stack` that announces the EPR `config` searches for.
///
/// The handles must be kept alive for as long as the provider should be reachable.
pub(crate) fn start_provider(
    stack: &SimStack,
    config: &HarnessConfig,
) -> (Arc<dyn Discovery>, Arc<dyn Provider>) {
    let adapter = config
        .select_adapter(&stack.adapters())
        .expect("the sim stack has adapters");
    let discovery = stack.discovery(&adapter).expect("adapter exists");
    discovery.start().expect("discovery starts");
    let provider = stack
        .provider(
            discovery.clone(),
            ProviderSettings {
                epr: config.search_epr,
                tls: None,
            },
        )
        .expect("provider is created");
    provider.start().expect("provider starts");
    (discovery, provider)
}

pub(crate) fn verdicts_for(records: &[TestRecord], id: CheckId) -> Vec<Verdict> {
    records
        .iter()
        .filter(|record| record.id == id)
        .map(|record| record.verdict)
        .collect()
}

pub(crate) fn failed_ids(records: &[TestRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|record| record.verdict == Verdict::Failed)
        .map(|record| record.id.to_string())
        .collect()
}
