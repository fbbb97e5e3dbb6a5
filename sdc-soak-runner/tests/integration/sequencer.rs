// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use pretty_assertions::assert_eq;
use sdc_soak_runner::{
    device::sim::{SimBehavior, SimStack},
    sequencer::{CheckId, Phase, SequenceEnd, TestSequencer, Verdict},
    stop::StopSignal,
};

#[tokio::test(start_paused = true)]
async fn discovery_failure_aborts_the_sequence() {
    let stack = SimStack::new();
    let config = test_config(&[("discovery_timeout", "2")]);

    let outcome = TestSequencer::new(&stack, &config, None, StopSignal::new())
        .run()
        .await;

    assert_eq!(outcome.end, SequenceEnd::Aborted(Phase::Discovery));
    let records = outcome.results.records();
    assert_eq!(records.len(), 1, "nothing after discovery: {records:?}");
    assert_eq!(records[0].id, CheckId::Discovery);
    assert_eq!(records[0].verdict, Verdict::Failed);
    assert!(
        records[0]
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("no matching service")),
        "{records:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn discovery_attempt_cap_is_honored() {
    let stack = SimStack::new();
    let config = test_config(&[("discovery_runs", "3")]);

    let outcome = TestSequencer::new(&stack, &config, None, StopSignal::new())
        .run()
        .await;

    assert_eq!(outcome.end, SequenceEnd::Aborted(Phase::Discovery));
    assert_eq!(
        outcome.results.detail(CheckId::Discovery),
        Some("no matching service after 3 attempts")
    );
}

#[tokio::test(start_paused = true)]
async fn connect_failure_aborts_the_sequence() {
    let stack = SimStack::with_behavior(SimBehavior {
        refuse_connections: true,
        ..Default::default()
    });
    let config = test_config(&[]);
    let _provider = start_provider(&stack, &config);

    let outcome = TestSequencer::new(&stack, &config, None, StopSignal::new())
        .run()
        .await;

    assert_eq!(outcome.end, SequenceEnd::Aborted(Phase::Connect));
    let records = outcome.results.records();
    let ids: Vec<_> = records.iter().map(|record| record.id).collect();
    assert_eq!(ids, vec![CheckId::Discovery, CheckId::Connect]);
    assert_eq!(records[0].verdict, Verdict::Passed);
    assert_eq!(records[1].verdict, Verdict::Failed);
    assert!(
        records[1]
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("refused")),
        "{records:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn model_init_failure_aborts_the_sequence() {
    let stack = SimStack::with_behavior(SimBehavior {
        fail_model_init: true,
        ..Default::default()
    });
    let config = test_config(&[]);
    let _provider = start_provider(&stack, &config);

    let outcome = TestSequencer::new(&stack, &config, None, StopSignal::new())
        .run()
        .await;

    assert_eq!(outcome.end, SequenceEnd::Aborted(Phase::ModelInit));
    let records = outcome.results.records();
    let ids: Vec<_> = records.iter().map(|record| record.id).collect();
    assert_eq!(
        ids,
        vec![
            CheckId::Discovery,
            CheckId::Connect,
            CheckId::ModelInit,
            CheckId::Subscribe,
        ]
    );
    assert_eq!(records[2].verdict, Verdict::Failed);
    assert_eq!(records[3].verdict, Verdict::Failed);
    assert_eq!(
        outcome.results.detail(CheckId::Subscribe),
        outcome.results.detail(CheckId::ModelInit)
    );
    assert!(!outcome.results.contains(CheckId::PatientContext));
    assert!(!outcome.results.contains(CheckId::LocationContext));
}

#[tokio::test(start_paused = true)]
async fn interrupted_before_start_records_nothing() {
    let stack = SimStack::new();
    let config = test_config(&[]);
    let stop = StopSignal::new();
    stop.trigger(sdc_soak_runner::stop::StopReason::Interrupted);

    let outcome = TestSequencer::new(&stack, &config, None, stop).run().await;

    assert!(outcome.interrupted());
    assert!(outcome.results.is_empty());
}
