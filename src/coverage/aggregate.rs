//! Reducing a report to a single coverage figure

use std::path::PathBuf;

use serde::Deserialize;

use super::{matches, ratio, CoverageReport, FileCoverage};

/// Which part of a report the validation loop scores
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageScope {
    /// Coverage of one source file
    File(PathBuf),
    /// Line-weighted coverage of the whole report
    Report,
}

/// Scope as written in configuration; `file` is resolved against the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    #[default]
    File,
    Report,
}

/// Coverage of the report entry matching `target_path`
///
/// Returns the first matching entry in report order together with `true`,
/// or zero coverage and `false` when no entry matches. A file that is in the
/// report with 0% coverage and a file that is absent only differ in the flag.
pub fn single_file_coverage(report: &CoverageReport, target_path: &str) -> (FileCoverage, bool) {
    report
        .iter()
        .find(|(path, _)| matches(path, target_path))
        .map(|(_, coverage)| (coverage.clone(), true))
        .unwrap_or_else(|| (FileCoverage::default(), false))
}

/// Line-weighted coverage across every file in the report
///
/// Files with more instrumented lines weigh more; this is not the mean of
/// per-file percentages.
pub fn total_coverage(report: &CoverageReport) -> f64 {
    let (covered, missed) = report.iter().fold((0usize, 0usize), |(c, m), (_, cov)| {
        (c + cov.covered_lines().len(), m + cov.missed_lines().len())
    });
    ratio(covered, missed)
}

/// Score a report according to `scope`
pub fn scoped_coverage(report: &CoverageReport, scope: &CoverageScope) -> f64 {
    match scope {
        CoverageScope::Report => total_coverage(report),
        CoverageScope::File(path) => {
            let target = path.to_string_lossy();
            let (coverage, found) = single_file_coverage(report, &target);
            if !found {
                tracing::warn!(file = %target, "source file not found in coverage report");
            }
            coverage.percentage()
        }
    }
}
