// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collecting per-check verdicts into an aggregate verdict.

use crate::device::OperationKind;
use indexmap::IndexMap;
use sdc_soak_metadata::SoakExitCode;
use std::fmt;

/// The outcome of a single check.
///
/// The ordering is the aggregation order: `Passed < Skipped < Failed`. The aggregate of a set of
/// verdicts is its maximum.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Verdict {
    /// The check passed.
    Passed,
    /// The check wasn't performed.
    Skipped,
    /// The check failed.
    Failed,
}

impl Verdict {
    /// Returns the name of this verdict as shown in summaries.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies what a [`TestRecord`] checks.
///
/// Several records can share an id, for example one metric-update record per metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CheckId {
    /// The background provider reported readiness.
    ProviderStartup,
    /// The provider under test was discovered.
    Discovery,
    /// A session was established.
    Connect,
    /// The information model was loaded.
    ModelInit,
    /// Report subscriptions were set up.
    Subscribe,
    /// A patient context exists.
    PatientContext,
    /// A location context exists.
    LocationContext,
    /// Metric updates arrived.
    MetricUpdates,
    /// Alert updates arrived.
    AlertUpdates,
    /// The descriptor for an operation exists.
    OperationDescriptor(OperationKind),
    /// An operation completed.
    Operation(OperationKind),
    /// Subscriptions were ended.
    Unsubscribe,
    /// Injected bad values were all rejected.
    FaultInjection,
    /// Updates arrived during the sampling window.
    Throughput,
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderStartup => f.write_str("provider-startup"),
            Self::Discovery => f.write_str("discovery"),
            Self::Connect => f.write_str("connect"),
            Self::ModelInit => f.write_str("model-init"),
            Self::Subscribe => f.write_str("subscribe"),
            Self::PatientContext => f.write_str("patient-context"),
            Self::LocationContext => f.write_str("location-context"),
            Self::MetricUpdates => f.write_str("metric-updates"),
            Self::AlertUpdates => f.write_str("alert-updates"),
            Self::OperationDescriptor(kind) => {
                write!(f, "operation-descriptor-{}", kind_slug(*kind))
            }
            Self::Operation(kind) => write!(f, "operation-{}", kind_slug(*kind)),
            Self::Unsubscribe => f.write_str("unsubscribe"),
            Self::FaultInjection => f.write_str("fault-injection"),
            Self::Throughput => f.write_str("throughput"),
        }
    }
}

fn kind_slug(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::SetString => "set-string",
        OperationKind::SetValue => "set-value",
        OperationKind::Activate => "activate",
    }
}

/// One recorded check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestRecord {
    /// What was checked.
    pub id: CheckId,
    /// A human-readable description of the check.
    pub message: String,
    /// The outcome.
    pub verdict: Verdict,
    /// Additional detail, such as why the check failed.
    pub detail: Option<String>,
}

/// Counts of records by verdict.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VerdictCounts {
    /// Passed records.
    pub passed: usize,
    /// Failed records.
    pub failed: usize,
    /// Skipped records.
    pub skipped: usize,
}

impl VerdictCounts {
    /// The total number of records.
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }
}

/// The results of one sequence run.
///
/// Records are kept in the order they were added. The aggregate verdict is folded in as records
/// are added, and the latest detail for each [`CheckId`] is kept.
#[derive(Clone, Debug)]
pub struct ResultCollector {
    records: Vec<TestRecord>,
    aggregate: Verdict,
    details: IndexMap<CheckId, String>,
}

impl ResultCollector {
    /// Creates an empty collector. Its aggregate verdict is `Passed`.
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            aggregate: Verdict::Passed,
            details: IndexMap::new(),
        }
    }

    /// Records a check without detail.
    pub fn record(&mut self, id: CheckId, message: impl Into<String>, verdict: Verdict) {
        self.push(TestRecord {
            id,
            message: message.into(),
            verdict,
            detail: None,
        });
    }

    /// Records a check with detail.
    pub fn record_with_detail(
        &mut self,
        id: CheckId,
        message: impl Into<String>,
        verdict: Verdict,
        detail: impl Into<String>,
    ) {
        self.push(TestRecord {
            id,
            message: message.into(),
            verdict,
            detail: Some(detail.into()),
        });
    }

    /// Adds a record.
    pub fn push(&mut self, record: TestRecord) {
        self.aggregate = self.aggregate.max(record.verdict);
        if let Some(detail) = &record.detail {
            self.details.insert(record.id, detail.clone());
        }
        self.records.push(record);
    }

    /// The records, in the order they were added.
    pub fn records(&self) -> &[TestRecord] {
        &self.records
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The aggregate verdict.
    pub fn aggregate(&self) -> Verdict {
        self.aggregate
    }

    /// The most recent detail recorded for `id`.
    pub fn detail(&self, id: CheckId) -> Option<&str> {
        self.details.get(&id).map(String::as_str)
    }

    /// Returns true if any record has the given id.
    pub fn contains(&self, id: CheckId) -> bool {
        self.records.iter().any(|record| record.id == id)
    }

    /// Counts the records by verdict.
    pub fn counts(&self) -> VerdictCounts {
        let mut counts = VerdictCounts::default();
        for record in &self.records {
            match record.verdict {
                Verdict::Passed => counts.passed += 1,
                Verdict::Skipped => counts.skipped += 1,
                Verdict::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// The process exit code for these results: success only if the aggregate is `Passed`.
    pub fn exit_code(&self) -> i32 {
        match self.aggregate {
            Verdict::Passed => SoakExitCode::OK,
            Verdict::Skipped | Verdict::Failed => SoakExitCode::RUN_FAILED,
        }
    }
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{
        prop_assert_eq, prop_oneof,
        strategy::{Just, Strategy},
    };
    use test_case::test_case;
    use test_strategy::proptest;

    fn verdict_strategy() -> impl Strategy<Value = Verdict> {
        prop_oneof![
            Just(Verdict::Passed),
            Just(Verdict::Skipped),
            Just(Verdict::Failed),
        ]
    }

    fn collect(verdicts: &[Verdict]) -> ResultCollector {
        let mut results = ResultCollector::new();
        for (index, verdict) in verdicts.iter().enumerate() {
            results.record(CheckId::MetricUpdates, format!("check {index}"), *verdict);
        }
        results
    }

    #[test_case(&[], Verdict::Passed; "empty")]
    #[test_case(&[Verdict::Passed, Verdict::Skipped, Verdict::Passed], Verdict::Skipped; "skipped")]
    #[test_case(&[Verdict::Passed, Verdict::Failed, Verdict::Skipped], Verdict::Failed; "failed")]
    #[test_case(&[Verdict::Failed, Verdict::Passed], Verdict::Failed; "failed first")]
    fn aggregate(verdicts: &[Verdict], expected: Verdict) {
        assert_eq!(collect(verdicts).aggregate(), expected);
    }

    #[proptest]
    fn aggregate_is_failed_iff_any_failed(
        #[strategy(proptest::collection::vec(verdict_strategy(), 0..16))] verdicts: Vec<Verdict>,
    ) {
        let results = collect(&verdicts);
        prop_assert_eq!(
            results.aggregate() == Verdict::Failed,
            verdicts.contains(&Verdict::Failed)
        );

        // Insertion order doesn't matter.
        let mut reversed = verdicts.clone();
        reversed.reverse();
        prop_assert_eq!(collect(&reversed).aggregate(), results.aggregate());

        let counts = results.counts();
        prop_assert_eq!(counts.total(), verdicts.len());
        prop_assert_eq!(results.exit_code() == 0, results.aggregate() == Verdict::Passed);
    }

    #[test]
    fn details_keep_the_latest_write() {
        let mut results = ResultCollector::new();
        results.record_with_detail(
            CheckId::MetricUpdates,
            "metric updates for `numeric.ch0.vmd0`",
            Verdict::Passed,
            "received 12, expected at least 3",
        );
        results.record(CheckId::MetricUpdates, "no detail", Verdict::Passed);
        results.record_with_detail(
            CheckId::MetricUpdates,
            "metric updates for `numeric.ch1.vmd0`",
            Verdict::Failed,
            "received 2, expected at least 3",
        );

        assert_eq!(results.records().len(), 3);
        assert_eq!(
            results.detail(CheckId::MetricUpdates),
            Some("received 2, expected at least 3")
        );
        assert_eq!(results.detail(CheckId::Connect), None);
    }

    #[test]
    fn check_ids_display() {
        assert_eq!(
            CheckId::Operation(OperationKind::SetString).to_string(),
            "operation-set-string"
        );
        assert_eq!(
            CheckId::OperationDescriptor(OperationKind::Activate).to_string(),
            "operation-descriptor-activate"
        );
    }
}
