//! diff-cover JSON report parser

use indexmap::IndexMap;
use serde::Deserialize;

use super::{CoverageReport, FileCoverage};
use crate::error::CoverageError;

#[derive(Debug, Deserialize)]
struct DiffCoverDocument {
    /// Keeps document order so first-match lookups follow the report
    src_stats: IndexMap<String, DiffCoverFile>,
}

#[derive(Debug, Deserialize)]
struct DiffCoverFile {
    #[serde(default)]
    covered_lines: Vec<u32>,
    #[serde(default)]
    missing_lines: Vec<u32>,
}

/// Parse diff-cover JSON (`diff-cover --json-report`) from a string
pub fn parse_diff_cover_string(content: &str) -> Result<CoverageReport, CoverageError> {
    let document: DiffCoverDocument = serde_json::from_str(content)
        .map_err(|e| CoverageError::parse("diff_cover_json", e.to_string()))?;

    let mut report = CoverageReport::new();
    for (path, stats) in document.src_stats {
        report.insert(&path, FileCoverage::from_lines(stats.covered_lines, stats.missing_lines));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diff_cover() {
        let json = r#"{
            "report_name": "XML",
            "diff_name": "origin/main...HEAD",
            "src_stats": {
                "app/calc.py": {
                    "percent_covered": 75.0,
                    "violation_lines": [12],
                    "covered_lines": [10, 11, 13],
                    "missing_lines": [12]
                },
                "app/util.py": {
                    "covered_lines": [],
                    "missing_lines": []
                }
            },
            "total_num_lines": 4,
            "total_num_violations": 1
        }"#;

        let report = parse_diff_cover_string(json).unwrap();

        assert_eq!(report.len(), 2);
        let calc = report.get("app/calc.py").unwrap();
        assert!((calc.percentage() - 0.75).abs() < 1e-9);
        assert_eq!(calc.missed_lines().iter().copied().collect::<Vec<_>>(), vec![12]);
        assert_eq!(report.get("app/util.py").unwrap().percentage(), 0.0);
    }

    #[test]
    fn test_entries_keep_document_order() {
        let json = r#"{"src_stats": {
            "z/calc.py": {"covered_lines": [1, 2], "missing_lines": []},
            "b/calc.py": {"covered_lines": [], "missing_lines": [1, 2]}
        }}"#;

        let report = parse_diff_cover_string(json).unwrap();

        let paths: Vec<&str> = report.iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["z/calc.py", "b/calc.py"]);

        // Only the basename matches, so the first entry in the document wins
        let (coverage, found) = crate::coverage::single_file_coverage(&report, "/x/calc.py");
        assert!(found);
        assert_eq!(coverage.percentage(), 1.0);
    }

    #[test]
    fn test_missing_src_stats_is_parse_error() {
        let err = parse_diff_cover_string(r#"{"report_name": "XML"}"#).unwrap_err();
        assert!(matches!(err, CoverageError::Parse { format: "diff_cover_json", .. }));
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        assert!(parse_diff_cover_string("{not json").is_err());
    }
}
