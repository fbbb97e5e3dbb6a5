// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of run a [`RunSummary`] describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum RunKind {
    /// Provider and consumer conformance suite.
    Suite,
    /// Fault injection soak run.
    Failure,
    /// Throughput and jitter measurement.
    Throughput,
}

impl RunKind {
    /// Returns the name of this kind, as used on the command line and in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suite => "suite",
            Self::Failure => "failure",
            Self::Throughput => "throughput",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The verdict of a single phase record or of a whole run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictSummary {
    /// The phase passed.
    Passed,
    /// The phase failed.
    Failed,
    /// The phase was not attempted.
    Skipped,
}

/// A serializable summary of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunSummary {
    /// What kind of run this was.
    pub kind: RunKind,

    /// When the run started.
    pub start_time: DateTime<FixedOffset>,

    /// How long the run took, in seconds.
    pub duration_secs: f64,

    /// The aggregate verdict.
    pub verdict: VerdictSummary,

    /// Every recorded phase, in evaluation order.
    #[serde(default)]
    pub records: Vec<RecordSummary>,

    /// Fault counters, for failure runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faults: Option<FaultSummary>,

    /// Throughput statistics, for throughput runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<ThroughputSummary>,
}

impl RunSummary {
    /// Parses a summary previously produced with `--message-format json`.
    pub fn parse_json(json: impl AsRef<str>) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json.as_ref())
    }

    /// Serializes this summary to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// One phase record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecordSummary {
    /// The phase identifier, for example `discovery` or `metric-updates`.
    pub phase: String,

    /// Human-readable description of what was checked.
    pub message: String,

    /// The verdict for this record.
    pub verdict: VerdictSummary,

    /// Details captured for this record, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Counters collected by the fault injector.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FaultSummary {
    /// Wrongly-typed writes that the transaction layer rejected.
    pub bad_value_writes: u64,

    /// Wrongly-typed writes that the transaction layer accepted.
    pub uncaught_bad_values: u64,

    /// Simulated connection drops.
    pub reconnects: u64,
}

/// Interval statistics collected by the throughput sampler.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ThroughputSummary {
    /// Number of updates received.
    pub count: u64,
    /// Updates per second over the sampling window.
    pub rate_hz: f64,
    /// Mean interval between updates, in milliseconds.
    pub avg_interval_ms: f64,
    /// Shortest interval between updates, in milliseconds.
    pub min_interval_ms: f64,
    /// Longest interval between updates, in milliseconds.
    pub max_interval_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(VerdictSummary::Passed, "\"PASSED\""; "passed")]
    #[test_case(VerdictSummary::Failed, "\"FAILED\""; "failed")]
    #[test_case(VerdictSummary::Skipped, "\"SKIPPED\""; "skipped")]
    fn verdict_wire_names(verdict: VerdictSummary, expected: &str) {
        assert_eq!(serde_json::to_string(&verdict).unwrap(), expected);
    }

    #[test]
    fn parse_summary_without_optional_sections() {
        let json = r#"{
            "kind": "suite",
            "start-time": "2026-01-05T10:00:00+01:00",
            "duration-secs": 12.5,
            "verdict": "FAILED",
            "records": [
                { "phase": "discovery", "message": "Service discovery", "verdict": "FAILED",
                  "detail": "no matching service after 3 attempts" }
            ]
        }"#;
        let summary = RunSummary::parse_json(json).expect("summary parses");
        assert_eq!(summary.kind, RunKind::Suite);
        assert_eq!(summary.verdict, VerdictSummary::Failed);
        assert_eq!(summary.records.len(), 1);
        assert_eq!(
            summary.records[0].detail.as_deref(),
            Some("no matching service after 3 attempts")
        );
        assert!(summary.faults.is_none());
        assert!(summary.throughput.is_none());
    }
}
