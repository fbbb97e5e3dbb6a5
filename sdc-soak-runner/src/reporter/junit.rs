// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::RunReport;
use crate::{errors::WriteReportError, sequencer::Verdict};
use camino::Utf8Path;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use std::fs::File;

/// The name of the JUnit report and its single test suite.
const REPORT_NAME: &str = "sdc-soak";

/// Builds a JUnit report with one test case per record.
pub fn junit_report(report: &RunReport) -> Report {
    let suite_name = format!("{REPORT_NAME}-{}", report.kind);
    let mut test_suite = TestSuite::new(suite_name.as_str());
    test_suite
        .set_timestamp(report.start_time)
        .set_time(report.duration);

    for record in report.results.records() {
        let status = match record.verdict {
            Verdict::Passed => TestCaseStatus::success(),
            Verdict::Skipped => {
                let mut status = TestCaseStatus::skipped();
                if let Some(detail) = &record.detail {
                    status.set_message(detail.as_str());
                }
                status
            }
            Verdict::Failed => {
                let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
                status.set_type(record.id.to_string());
                if let Some(detail) = &record.detail {
                    status.set_message(detail.as_str());
                }
                status
            }
        };

        let mut test_case = TestCase::new(record.message.as_str(), status);
        test_case.set_classname(format!("{suite_name}::{}", record.id));
        test_suite.add_test_case(test_case);
    }

    let mut junit = Report::new(REPORT_NAME);
    junit
        .set_timestamp(report.start_time)
        .set_time(report.duration)
        .add_test_suite(test_suite);
    junit
}

/// Writes the JUnit report for `report` to `path`, creating parent directories as needed.
pub fn write_junit(report: &RunReport, path: &Utf8Path) -> Result<(), WriteReportError> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|err| WriteReportError::JunitFs {
            path: dir.to_path_buf(),
            err,
        })?;
    }

    let file = File::create(path).map_err(|err| WriteReportError::JunitFs {
        path: path.to_path_buf(),
        err,
    })?;
    junit_report(report)
        .serialize(file)
        .map_err(|err| WriteReportError::Junit {
            path: path.to_path_buf(),
            err,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::test_helpers::suite_report;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn one_test_case_per_record() {
        let junit = junit_report(&suite_report());

        assert_eq!(junit.test_suites.len(), 1);
        let suite = &junit.test_suites[0];
        assert_eq!(suite.name.as_str(), "sdc-soak-suite");
        assert_eq!(suite.test_cases.len(), 4);
        assert_eq!(suite.tests, 4);
        assert_eq!(suite.failures, 1);
        assert_eq!(suite.disabled, 1);
    }

    #[test]
    fn written_report_contains_failure_detail() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("reports/junit.xml");

        write_junit(&suite_report(), &path).unwrap();

        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains(r#"<testsuite name="sdc-soak-suite""#), "{xml}");
        assert!(
            xml.contains("received 2 updates, expected at least 3"),
            "{xml}"
        );
        assert!(xml.contains("<skipped"), "{xml}");
    }
}
