//! Run history stored in SQLite

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::agent::RunSummary;

pub const DEFAULT_DB_FILE: &str = ".covgen.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS test_runs (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    source_file TEXT NOT NULL,
    test_file TEXT NOT NULL,
    initial_coverage REAL NOT NULL,
    final_coverage REAL NOT NULL,
    desired_coverage REAL NOT NULL,
    iterations INTEGER NOT NULL,
    tests_generated INTEGER NOT NULL,
    tests_passed INTEGER NOT NULL,
    target_reached INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_test_runs_timestamp ON test_runs(timestamp);
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_file: String,
    pub test_file: String,
    pub initial_coverage: f64,
    pub final_coverage: f64,
    pub desired_coverage: f64,
    pub iterations: u32,
    pub tests_generated: u32,
    pub tests_passed: u32,
    pub target_reached: bool,
}

impl RunRecord {
    pub fn from_summary(source_file: &Path, test_file: &Path, summary: &RunSummary) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source_file: source_file.display().to_string(),
            test_file: test_file.display().to_string(),
            initial_coverage: summary.initial_coverage,
            final_coverage: summary.final_coverage,
            desired_coverage: summary.desired_coverage,
            iterations: summary.iterations,
            tests_generated: summary.tests_generated as u32,
            tests_passed: summary.tests_passed as u32,
            target_reached: summary.target_reached,
        }
    }
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open history database {}", path.display()))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn insert_run(&self, record: &RunRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO test_runs (id, timestamp, source_file, test_file, initial_coverage,
                                    final_coverage, desired_coverage, iterations,
                                    tests_generated, tests_passed, target_reached)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id,
                record.timestamp.to_rfc3339(),
                record.source_file,
                record.test_file,
                record.initial_coverage,
                record.final_coverage,
                record.desired_coverage,
                record.iterations,
                record.tests_generated,
                record.tests_passed,
                record.target_reached,
            ],
        )?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, source_file, test_file, initial_coverage, final_coverage,
                    desired_coverage, iterations, tests_generated, tests_passed, target_reached
             FROM test_runs ORDER BY timestamp DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit], |row| {
            let timestamp: String = row.get(1)?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
                })?
                .with_timezone(&Utc);

            Ok(RunRecord {
                id: row.get(0)?,
                timestamp,
                source_file: row.get(2)?,
                test_file: row.get(3)?,
                initial_coverage: row.get(4)?,
                final_coverage: row.get(5)?,
                desired_coverage: row.get(6)?,
                iterations: row.get(7)?,
                tests_generated: row.get(8)?,
                tests_passed: row.get(9)?,
                target_reached: row.get(10)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }
}

/// Print stored runs, newest first
pub fn print_history(records: &[RunRecord]) {
    if records.is_empty() {
        println!("{}", "No runs recorded yet".dimmed());
        return;
    }

    println!("{}", "Recent runs".bold());
    println!("{}", "─".repeat(70).dimmed());

    for record in records {
        let marker = if record.target_reached {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "{} {}  {}  {:.2}% → {:.2}%  ({}/{} tests kept, {} iteration(s))",
            marker,
            record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            record.source_file.cyan(),
            record.initial_coverage * 100.0,
            record.final_coverage * 100.0,
            record.tests_passed,
            record.tests_generated,
            record.iterations,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(final_coverage: f64, target_reached: bool) -> RunSummary {
        RunSummary {
            initial_coverage: 0.4,
            final_coverage,
            desired_coverage: 70.0,
            iterations: 2,
            tests_generated: 6,
            tests_passed: 3,
            duplicates_skipped: 0,
            target_reached,
        }
    }

    #[test]
    fn test_insert_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("history.db")).unwrap();

        let record = RunRecord::from_summary(Path::new("calc.py"), Path::new("test_calc.py"), &summary(0.75, true));
        db.insert_run(&record).unwrap();

        let runs = db.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, record.id);
        assert_eq!(runs[0].source_file, "calc.py");
        assert_eq!(runs[0].tests_passed, 3);
        assert!(runs[0].target_reached);
        assert!((runs[0].final_coverage - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_recent_runs_newest_first_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("history.db")).unwrap();

        for (i, coverage) in [0.5, 0.6, 0.7].into_iter().enumerate() {
            let mut record =
                RunRecord::from_summary(Path::new("calc.py"), Path::new("test_calc.py"), &summary(coverage, false));
            record.timestamp = Utc::now() + chrono::Duration::seconds(i as i64);
            db.insert_run(&record).unwrap();
        }

        let runs = db.recent_runs(2).unwrap();
        assert_eq!(runs.len(), 2);
        assert!((runs[0].final_coverage - 0.7).abs() < 1e-12);
        assert!((runs[1].final_coverage - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");

        {
            let db = Database::open(&path).unwrap();
            let record =
                RunRecord::from_summary(Path::new("calc.py"), Path::new("test_calc.py"), &summary(0.5, false));
            db.insert_run(&record).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.recent_runs(10).unwrap().len(), 1);
    }
}
