// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use sdc_soak_metadata::{RunKind, SoakExitCode};
use sdc_soak_runner::{
    device::{InvocationState, OperationKind, handles, sim::SimBehavior},
    sequencer::{CheckId, Verdict},
    stop::StopReason,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn suite_passes_against_reference_provider() -> Result<()> {
    let (harness, _stop) = harness(SimBehavior::default(), test_config(&[]));
    let report = harness.run_suite().await?;

    let records = report.results.records();
    assert_eq!(failed_ids(records), Vec::<String>::new());
    assert_eq!(report.kind, RunKind::Suite);
    assert_eq!(report.verdict(), Verdict::Passed);
    assert_eq!(report.exit_code(), SoakExitCode::OK);
    assert!(!report.interrupted);

    for id in [
        CheckId::ProviderStartup,
        CheckId::Discovery,
        CheckId::Connect,
        CheckId::ModelInit,
        CheckId::Subscribe,
        CheckId::PatientContext,
        CheckId::LocationContext,
        CheckId::Unsubscribe,
    ] {
        assert_eq!(verdicts_for(records, id), vec![Verdict::Passed], "{id}");
    }
    // Heart rate and SpO2 are updated by the provider.
    assert_eq!(verdicts_for(records, CheckId::MetricUpdates).len(), 2);
    assert_eq!(
        verdicts_for(records, CheckId::AlertUpdates),
        vec![Verdict::Passed]
    );
    for kind in OperationKind::ALL {
        assert_eq!(
            verdicts_for(records, CheckId::Operation(kind)),
            vec![Verdict::Passed],
            "{kind}"
        );
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_operation_descriptor_is_isolated() -> Result<()> {
    let behavior = SimBehavior {
        omit_descriptors: vec![handles::SET_VALUE_OPERATION.into()],
        ..Default::default()
    };
    let (harness, _stop) = harness(behavior, test_config(&[]));
    let report = harness.run_suite().await?;
    let records = report.results.records();

    assert_eq!(
        verdicts_for(records, CheckId::OperationDescriptor(OperationKind::SetValue)),
        vec![Verdict::Failed]
    );
    // Only the descriptor check is recorded for an operation that can't be invoked.
    assert!(verdicts_for(records, CheckId::Operation(OperationKind::SetValue)).is_empty());
    // The other operations and teardown still run.
    assert_eq!(
        verdicts_for(records, CheckId::Operation(OperationKind::Activate)),
        vec![Verdict::Passed]
    );
    assert_eq!(
        verdicts_for(records, CheckId::Unsubscribe),
        vec![Verdict::Passed]
    );
    assert_eq!(report.verdict(), Verdict::Failed);
    assert_eq!(report.exit_code(), SoakExitCode::RUN_FAILED);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn operation_timeouts_are_isolated() -> Result<()> {
    let behavior = SimBehavior {
        operation_delay: Duration::from_secs(60),
        ..Default::default()
    };
    let (harness, _stop) = harness(behavior, test_config(&[("operation_timeout", "2")]));
    let report = harness.run_suite().await?;
    let records = report.results.records();

    for kind in OperationKind::ALL {
        assert_eq!(
            verdicts_for(records, CheckId::OperationDescriptor(kind)),
            vec![Verdict::Passed],
            "{kind}"
        );
        assert_eq!(
            verdicts_for(records, CheckId::Operation(kind)),
            vec![Verdict::Failed],
            "{kind}"
        );
        assert_eq!(
            report.results.detail(CheckId::Operation(kind)),
            Some("timed out after 2s"),
            "{kind}"
        );
    }
    assert_eq!(
        verdicts_for(records, CheckId::Unsubscribe),
        vec![Verdict::Passed]
    );
    assert_eq!(report.exit_code(), SoakExitCode::RUN_FAILED);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_invocation_state_is_recorded() -> Result<()> {
    let behavior = SimBehavior {
        invocation_state: Some(InvocationState::Failed),
        ..Default::default()
    };
    let (harness, _stop) = harness(behavior, test_config(&[]));
    let report = harness.run_suite().await?;
    let records = report.results.records();

    for kind in OperationKind::ALL {
        assert_eq!(
            verdicts_for(records, CheckId::Operation(kind)),
            vec![Verdict::Failed],
            "{kind}"
        );
        assert_eq!(
            report.results.detail(CheckId::Operation(kind)),
            Some("state: Fail"),
            "{kind}"
        );
    }
    assert_eq!(
        verdicts_for(records, CheckId::Unsubscribe),
        vec![Verdict::Passed]
    );
    assert_eq!(report.verdict(), Verdict::Failed);
    assert_eq!(report.exit_code(), SoakExitCode::RUN_FAILED);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_unsubscribe_fails_the_run() -> Result<()> {
    let behavior = SimBehavior {
        unsubscribe_succeeds: false,
        ..Default::default()
    };
    let (harness, _stop) = harness(behavior, test_config(&[]));
    let report = harness.run_suite().await?;

    assert_eq!(failed_ids(report.results.records()), vec!["unsubscribe"]);
    assert_eq!(report.exit_code(), SoakExitCode::RUN_FAILED);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn provider_start_failure_stops_the_suite() -> Result<()> {
    let behavior = SimBehavior {
        fail_provider_start: true,
        ..Default::default()
    };
    let (harness, _stop) = harness(behavior, test_config(&[]));
    let report = harness.run_suite().await?;

    let records = report.results.records();
    assert_eq!(records.len(), 1, "only the startup record: {records:?}");
    assert_eq!(records[0].id, CheckId::ProviderStartup);
    assert_eq!(records[0].verdict, Verdict::Failed);
    assert_eq!(report.exit_code(), SoakExitCode::RUN_FAILED);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_updates_ends_the_suite() -> Result<()> {
    let (harness, stop) = harness(SimBehavior::default(), test_config(&[("metric_wait", "60")]));
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        stop.trigger(StopReason::Interrupted);
    });

    let report = harness.run_suite().await?;
    let records = report.results.records();

    assert!(report.interrupted);
    assert_eq!(report.exit_code(), SoakExitCode::USER_ABORT);
    assert_eq!(
        verdicts_for(records, CheckId::ModelInit),
        vec![Verdict::Passed]
    );
    assert!(verdicts_for(records, CheckId::MetricUpdates).is_empty());
    assert!(verdicts_for(records, CheckId::Unsubscribe).is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failure_run_rejects_every_bad_value() -> Result<()> {
    let (harness, _stop) = harness(SimBehavior::default(), test_config(&[]));
    let report = harness.run_failure().await?;

    assert_eq!(report.kind, RunKind::Failure);
    assert_eq!(
        verdicts_for(report.results.records(), CheckId::FaultInjection),
        vec![Verdict::Passed]
    );
    let faults = report.faults.expect("failure runs report fault counters");
    assert!(faults.bad_value_writes > 0, "{faults:?}");
    assert_eq!(faults.uncaught_bad_values, 0);
    assert!(faults.reconnects >= 1, "{faults:?}");
    assert_eq!(report.exit_code(), SoakExitCode::OK);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failure_run_flags_accepted_bad_values() -> Result<()> {
    let behavior = SimBehavior {
        accept_float_values: true,
        ..Default::default()
    };
    let (harness, _stop) = harness(behavior, test_config(&[]));
    let report = harness.run_failure().await?;

    assert_eq!(
        verdicts_for(report.results.records(), CheckId::FaultInjection),
        vec![Verdict::Failed]
    );
    let faults = report.faults.expect("failure runs report fault counters");
    assert!(faults.uncaught_bad_values > 0, "{faults:?}");
    assert_eq!(report.exit_code(), SoakExitCode::RUN_FAILED);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn throughput_run_measures_updates() -> Result<()> {
    let (harness, _stop) = harness(SimBehavior::default(), test_config(&[]));
    let report = harness.run_throughput().await?;

    assert_eq!(report.kind, RunKind::Throughput);
    assert_eq!(
        verdicts_for(report.results.records(), CheckId::Throughput),
        vec![Verdict::Passed]
    );
    let stats = report
        .throughput
        .expect("throughput runs report statistics");
    assert!(stats.count > 0);
    assert!(stats.rate_hz > 0.0);
    assert!(stats.min_ms <= stats.max_ms);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn comm_log_captures_traffic() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let commlog_dir = dir.path().join("commlog");
    let (harness, _stop) = harness(
        SimBehavior::default(),
        test_config_with_commlog(&commlog_dir),
    );
    let report = harness.run_suite().await?;
    assert_eq!(report.verdict(), Verdict::Passed);

    let files: Vec<_> = commlog_dir.read_dir_utf8()?.collect::<Result<_, _>>()?;
    assert_eq!(files.len(), 1);
    let contents = std::fs::read_to_string(files[0].path())?;
    assert!(contents.contains("GetMdib"), "{contents}");
    assert!(contents.contains("Unsubscribe"), "{contents}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_tls_material_is_an_error() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let (harness, _stop) = harness(
        SimBehavior::default(),
        test_config(&[("ca", dir.path().as_str())]),
    );

    let error = harness
        .run_suite()
        .await
        .expect_err("the certificate folder is empty");
    assert!(
        error.to_string().contains("TLS"),
        "unexpected error: {error}"
    );
    Ok(())
}
