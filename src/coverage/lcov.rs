//! LCOV format parser

use std::collections::BTreeSet;

use super::{CoverageReport, FileCoverage};
use crate::error::CoverageError;

/// Parse LCOV content from a string
///
/// Each `SF:` record is accumulated from scratch; when the same path appears
/// in several records, the last complete record wins.
pub fn parse_lcov_string(content: &str) -> Result<CoverageReport, CoverageError> {
    let mut report = CoverageReport::new();

    let mut current_file: Option<String> = None;
    let mut covered: BTreeSet<u32> = BTreeSet::new();
    let mut missed: BTreeSet<u32> = BTreeSet::new();

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();

        if let Some(path) = line.strip_prefix("SF:") {
            // Source file start
            current_file = Some(path.trim().to_string());
            covered.clear();
            missed.clear();
        } else if let Some(data) = line.strip_prefix("DA:") {
            // Line data: DA:<line>,<hits>[,<checksum>]
            if current_file.is_none() {
                continue;
            }
            let (line_number, hits) = parse_da(data).ok_or_else(|| {
                CoverageError::parse("lcov", format!("line {}: malformed entry `{}`", idx + 1, line))
            })?;

            if hits > 0 {
                missed.remove(&line_number);
                covered.insert(line_number);
            } else if !covered.contains(&line_number) {
                missed.insert(line_number);
            }
        } else if line == "end_of_record" {
            // End of file record
            if let Some(file_path) = current_file.take() {
                let coverage = FileCoverage::new(
                    std::mem::take(&mut covered),
                    std::mem::take(&mut missed),
                );
                report.insert(&file_path, coverage);
            }
        }
    }

    if let Some(file_path) = current_file {
        tracing::warn!(file = %file_path, "lcov record without end_of_record ignored");
    }

    Ok(report)
}

fn parse_da(data: &str) -> Option<(u32, u64)> {
    let mut parts = data.split(',');
    let line_number = parts.next()?.trim().parse::<u32>().ok()?;
    // Some generators emit negative or fractional hit counts; only the sign matters.
    let hits = parts.next()?.trim();
    let hits = match hits.parse::<u64>() {
        Ok(hits) => hits,
        Err(_) => {
            let value = hits.parse::<f64>().ok()?;
            if value > 0.0 {
                1
            } else {
                0
            }
        }
    };
    Some((line_number, hits))
}
