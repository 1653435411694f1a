//! Coverage module
//!
//! Provides:
//! - Cobertura XML, LCOV and diff-cover JSON parsing into one normalized model
//! - Report path matching against a target source file
//! - Single-file and whole-report aggregation
//! - Stale report detection and coverage comparison

mod aggregate;
mod cobertura;
mod diff_cover;
mod lcov;
mod paths;
mod threshold;

pub use aggregate::*;
pub use cobertura::*;
pub use diff_cover::*;
pub use lcov::*;
pub use paths::*;
pub use threshold::*;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::error::CoverageError;

/// Filesystem timestamps can trail the wall clock by a scheduler tick.
const REPORT_MTIME_TOLERANCE: Duration = Duration::from_millis(50);

/// Supported coverage report formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum CoverageFormat {
    #[default]
    Cobertura,
    Lcov,
    Jacoco,
    DiffCoverJson,
}

impl CoverageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageFormat::Cobertura => "cobertura",
            CoverageFormat::Lcov => "lcov",
            CoverageFormat::Jacoco => "jacoco",
            CoverageFormat::DiffCoverJson => "diff_cover_json",
        }
    }
}

impl FromStr for CoverageFormat {
    type Err = CoverageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cobertura" => Ok(CoverageFormat::Cobertura),
            "lcov" => Ok(CoverageFormat::Lcov),
            "jacoco" => Ok(CoverageFormat::Jacoco),
            "diff_cover_json" | "diff-cover-json" => Ok(CoverageFormat::DiffCoverJson),
            _ => Err(CoverageError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for CoverageFormat {
    type Error = CoverageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for CoverageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line coverage for a single file
///
/// `covered_lines` and `missed_lines` are always disjoint, and `percentage`
/// is always `covered / (covered + missed)`, or `0.0` for a file with no
/// instrumented lines.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileCoverage {
    covered_lines: BTreeSet<u32>,
    missed_lines: BTreeSet<u32>,
    percentage: f64,
}

impl FileCoverage {
    /// Build from raw line sets. A line present in both sets counts as covered.
    pub fn new(covered_lines: BTreeSet<u32>, missed_lines: BTreeSet<u32>) -> Self {
        let missed_lines: BTreeSet<u32> = missed_lines
            .into_iter()
            .filter(|line| !covered_lines.contains(line))
            .collect();

        let percentage = ratio(covered_lines.len(), missed_lines.len());

        Self {
            covered_lines,
            missed_lines,
            percentage,
        }
    }

    pub fn from_lines(
        covered: impl IntoIterator<Item = u32>,
        missed: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self::new(covered.into_iter().collect(), missed.into_iter().collect())
    }

    pub fn covered_lines(&self) -> &BTreeSet<u32> {
        &self.covered_lines
    }

    pub fn missed_lines(&self) -> &BTreeSet<u32> {
        &self.missed_lines
    }

    /// Fraction of instrumented lines that were hit, in `[0, 1]`
    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    pub fn lines_covered(&self) -> usize {
        self.covered_lines.len()
    }

    pub fn lines_total(&self) -> usize {
        self.covered_lines.len() + self.missed_lines.len()
    }

    /// Union of two observations of the same file
    fn merge(self, other: FileCoverage) -> FileCoverage {
        let mut covered = self.covered_lines;
        covered.extend(other.covered_lines);
        let mut missed = self.missed_lines;
        missed.extend(other.missed_lines);
        FileCoverage::new(covered, missed)
    }
}

pub(crate) fn ratio(covered: usize, missed: usize) -> f64 {
    let total = covered + missed;
    if total == 0 {
        return 0.0;
    }
    covered as f64 / total as f64
}

/// Normalized coverage of every file in a report, in report order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoverageReport {
    files: Vec<(String, FileCoverage)>,
    index: HashMap<String, usize>,
}

impl CoverageReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert coverage for `path`, replacing any earlier entry for the same path
    pub fn insert(&mut self, path: &str, coverage: FileCoverage) {
        let key = normalize_path(path);
        match self.index.get(&key) {
            Some(&slot) => self.files[slot].1 = coverage,
            None => {
                self.index.insert(key.clone(), self.files.len());
                self.files.push((key, coverage));
            }
        }
    }

    /// Insert coverage for `path`, merging with any earlier entry for the same path
    pub(crate) fn merge(&mut self, path: &str, coverage: FileCoverage) {
        let key = normalize_path(path);
        match self.index.get(&key) {
            Some(&slot) => {
                let existing = std::mem::take(&mut self.files[slot].1);
                self.files[slot].1 = existing.merge(coverage);
            }
            None => self.insert(path, coverage),
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileCoverage> {
        self.index
            .get(&normalize_path(path))
            .map(|&slot| &self.files[slot].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileCoverage)> {
        self.files.iter().map(|(path, cov)| (path.as_str(), cov))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Parse a coverage report file in the given format
pub fn parse_coverage(path: &Path, format: CoverageFormat) -> Result<CoverageReport, CoverageError> {
    if format == CoverageFormat::Jacoco {
        return Ok(parse_jacoco());
    }

    let content = fs::read_to_string(path).map_err(|source| CoverageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_coverage_str(&content, format)
}

/// Parse coverage report content held in memory
pub fn parse_coverage_str(content: &str, format: CoverageFormat) -> Result<CoverageReport, CoverageError> {
    match format {
        CoverageFormat::Cobertura => parse_cobertura_string(content),
        CoverageFormat::Lcov => parse_lcov_string(content),
        CoverageFormat::DiffCoverJson => parse_diff_cover_string(content),
        CoverageFormat::Jacoco => Ok(parse_jacoco()),
    }
}

/// JaCoCo reports are accepted but never inspected.
fn parse_jacoco() -> CoverageReport {
    tracing::warn!("jacoco reports are not analysed; returning an empty coverage report");
    CoverageReport::new()
}

/// Reject a report that was not rewritten after `command_started`
pub fn verify_report_fresh(path: &Path, command_started: SystemTime) -> Result<(), CoverageError> {
    let io_err = |source| CoverageError::Io {
        path: path.to_path_buf(),
        source,
    };
    let modified = fs::metadata(path).and_then(|m| m.modified()).map_err(io_err)?;

    if modified + REPORT_MTIME_TOLERANCE < command_started {
        return Err(CoverageError::StaleReport {
            path: path.to_path_buf(),
            report_ms: epoch_ms(modified),
            command_ms: epoch_ms(command_started),
        });
    }

    Ok(())
}

fn epoch_ms(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Verify freshness, then parse
pub fn load_fresh_coverage(
    path: &Path,
    format: CoverageFormat,
    command_started: SystemTime,
) -> Result<CoverageReport, CoverageError> {
    if format != CoverageFormat::Jacoco {
        verify_report_fresh(path, command_started)?;
    }
    parse_coverage(path, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_coverage_invariants() {
        let cov = FileCoverage::from_lines([1, 2, 3], [3, 4]);

        assert!(cov.covered_lines().is_disjoint(cov.missed_lines()));
        assert_eq!(cov.lines_total(), 4);
        assert!((cov.percentage() - 0.75).abs() < 1e-9);

        let empty = FileCoverage::default();
        assert_eq!(empty.percentage(), 0.0);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("lcov".parse::<CoverageFormat>().unwrap(), CoverageFormat::Lcov);
        assert_eq!("Cobertura".parse::<CoverageFormat>().unwrap(), CoverageFormat::Cobertura);
        assert_eq!(
            "diff_cover_json".parse::<CoverageFormat>().unwrap(),
            CoverageFormat::DiffCoverJson
        );
        assert!(matches!(
            "clover".parse::<CoverageFormat>(),
            Err(CoverageError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_report_insert_replaces_in_place() {
        let mut report = CoverageReport::new();
        report.insert("./src/a.py", FileCoverage::from_lines([1], [2]));
        report.insert("src/b.py", FileCoverage::from_lines([1], []));
        report.insert("src/a.py", FileCoverage::from_lines([1, 2], []));

        assert_eq!(report.len(), 2);
        let paths: Vec<&str> = report.iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["src/a.py", "src/b.py"]);
        assert_eq!(report.get("src/a.py").unwrap().percentage(), 1.0);
    }

    #[test]
    fn test_jacoco_is_empty_not_error() {
        let report = parse_coverage(Path::new("/does/not/exist.xml"), CoverageFormat::Jacoco).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_stale_report_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "SF:a.py\nDA:1,1\nend_of_record").unwrap();

        let later = SystemTime::now() + Duration::from_secs(60);
        let err = load_fresh_coverage(file.path(), CoverageFormat::Lcov, later).unwrap_err();
        assert!(matches!(err, CoverageError::StaleReport { .. }));

        let earlier = SystemTime::now() - Duration::from_secs(60);
        let report = load_fresh_coverage(file.path(), CoverageFormat::Lcov, earlier).unwrap();
        assert_eq!(report.len(), 1);
    }

    #[test]
    fn test_report_within_mtime_tolerance_is_accepted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "SF:a.py\nDA:1,1\nend_of_record").unwrap();
        let modified = fs::metadata(file.path()).unwrap().modified().unwrap();

        // Up to REPORT_MTIME_TOLERANCE older than the command start still counts as fresh
        let inside = modified + REPORT_MTIME_TOLERANCE;
        assert!(verify_report_fresh(file.path(), inside).is_ok());

        let outside = modified + REPORT_MTIME_TOLERANCE + Duration::from_millis(1);
        assert!(matches!(
            verify_report_fresh(file.path(), outside),
            Err(CoverageError::StaleReport { .. })
        ));
    }

    #[test]
    fn test_missing_report_is_io_error() {
        let err = parse_coverage(Path::new("/does/not/exist.info"), CoverageFormat::Lcov).unwrap_err();
        assert!(matches!(err, CoverageError::Io { .. }));
    }
}
