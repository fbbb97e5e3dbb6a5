// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::RunReport;
use crate::{helpers::plural, sequencer::Verdict};
use owo_colors::{OwoColorize, Style};
use std::io::{self, Write};

/// Renders run reports for humans.
///
/// Rendering only reads the report, so the same report always renders to the same text.
#[derive(Clone, Debug, Default)]
pub struct HumanReporter {
    styles: Styles,
}

impl HumanReporter {
    /// Creates a reporter that writes plain text.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns on colored output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Writes the summary of `report`.
    pub fn write_summary(&self, report: &RunReport, writer: &mut dyn Write) -> io::Result<()> {
        let styles = &self.styles;
        let counts = report.results.counts();

        writeln!(writer, "------------")?;
        write!(
            writer,
            "{:>12} [{:>8.3}s] {} run: {} {}",
            "Summary".style(styles.label),
            report.duration.as_secs_f64(),
            report.kind,
            counts.total().style(styles.count),
            plural::records_str(counts.total()),
        )?;
        if counts.total() > 0 {
            write!(
                writer,
                ": {} {}, {} {}, {} {}",
                counts.passed.style(styles.count),
                "passed".style(styles.pass),
                counts.failed.style(styles.count),
                "failed".style(styles.fail),
                counts.skipped.style(styles.count),
                "skipped".style(styles.skip),
            )?;
        }
        writeln!(writer)?;

        for record in report.results.records() {
            writeln!(
                writer,
                "{:>12} [{}] {}",
                record.verdict.as_str().style(styles.verdict(record.verdict)),
                record.id,
                record.message,
            )?;
            if let Some(detail) = &record.detail {
                writeln!(writer, "{:>12} {detail}", "")?;
            }
        }

        if let Some(faults) = &report.faults {
            writeln!(
                writer,
                "{:>12} {} rejected bad values, {} accepted bad values, {} outages",
                "Faults".style(styles.label),
                faults.bad_value_writes.style(styles.count),
                faults.uncaught_bad_values.style(styles.count),
                faults.reconnects.style(styles.count),
            )?;
        }

        if let Some(stats) = &report.throughput {
            writeln!(
                writer,
                "{:>12} {} {} at {:.2} Hz; interval avg {:.1} ms, min {:.1} ms, max {:.1} ms",
                "Throughput".style(styles.label),
                stats.count.style(styles.count),
                plural::updates_str(stats.count),
                stats.rate_hz,
                stats.avg_ms,
                stats.min_ms,
                stats.max_ms,
            )?;
        }

        if report.interrupted {
            writeln!(
                writer,
                "{:>12} run interrupted by user",
                "Cancelled".style(styles.fail),
            )?;
        }

        let verdict = report.verdict();
        writeln!(
            writer,
            "{:>12} {}",
            "Verdict".style(styles.label),
            verdict.as_str().style(styles.verdict(verdict)),
        )
    }
}

#[derive(Clone, Debug, Default)]
struct Styles {
    label: Style,
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.label = Style::new().green().bold();
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
    }

    fn verdict(&self, verdict: Verdict) -> Style {
        match verdict {
            Verdict::Passed => self.pass,
            Verdict::Skipped => self.skip,
            Verdict::Failed => self.fail,
        }
    }
}
