// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reporting the outcome of a run.
//!
//! A finished run is described by a [`RunReport`]. It can be rendered as a human-readable summary
//! with [`HumanReporter`], serialized as JSON via [`RunReport::to_summary`], and written out as a
//! JUnit report with [`write_junit`].

mod human;
mod junit;

pub use human::*;
pub use junit::*;

use crate::{
    errors::WriteReportError,
    fault::FaultCounters,
    sampler::ThroughputStats,
    sequencer::{ResultCollector, Verdict},
};
use chrono::{DateTime, Local};
use sdc_soak_metadata::{
    FaultSummary, RecordSummary, RunKind, RunSummary, SoakExitCode, ThroughputSummary,
    VerdictSummary,
};
use std::{io::Write, time::Duration};

/// Everything known about a finished run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// The kind of run.
    pub kind: RunKind,
    /// When the run started.
    pub start_time: DateTime<Local>,
    /// How long the run took.
    pub duration: Duration,
    /// The recorded checks.
    pub results: ResultCollector,
    /// Fault counters, for failure runs.
    pub faults: Option<FaultCounters>,
    /// Throughput statistics, for throughput runs.
    pub throughput: Option<ThroughputStats>,
    /// True if the run was cut short by the user.
    pub interrupted: bool,
}

impl RunReport {
    /// The aggregate verdict.
    pub fn verdict(&self) -> Verdict {
        self.results.aggregate()
    }

    /// The process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            SoakExitCode::USER_ABORT
        } else {
            self.results.exit_code()
        }
    }

    /// Converts this report into its machine-readable form.
    pub fn to_summary(&self) -> RunSummary {
        RunSummary {
            kind: self.kind,
            start_time: self.start_time.fixed_offset(),
            duration_secs: self.duration.as_secs_f64(),
            verdict: verdict_summary(self.verdict()),
            records: self
                .results
                .records()
                .iter()
                .map(|record| RecordSummary {
                    phase: record.id.to_string(),
                    message: record.message.clone(),
                    verdict: verdict_summary(record.verdict),
                    detail: record.detail.clone(),
                })
                .collect(),
            faults: self.faults.map(|faults| FaultSummary {
                bad_value_writes: faults.bad_value_writes,
                uncaught_bad_values: faults.uncaught_bad_values,
                reconnects: faults.reconnects,
            }),
            throughput: self.throughput.map(|stats| ThroughputSummary {
                count: stats.count as u64,
                rate_hz: stats.rate_hz,
                avg_interval_ms: stats.avg_ms,
                min_interval_ms: stats.min_ms,
                max_interval_ms: stats.max_ms,
            }),
        }
    }

    /// Writes the machine-readable summary as pretty-printed JSON.
    pub fn write_json(&self, writer: &mut dyn Write) -> Result<(), WriteReportError> {
        let json = self.to_summary().to_json()?;
        writeln!(writer, "{json}")?;
        Ok(())
    }
}

fn verdict_summary(verdict: Verdict) -> VerdictSummary {
    match verdict {
        Verdict::Passed => VerdictSummary::Passed,
        Verdict::Skipped => VerdictSummary::Skipped,
        Verdict::Failed => VerdictSummary::Failed,
    }
}
