//! Candidate test validation
//!
//! One attempt walks `Idle → BackedUp → BaselineMeasured → TestInserted →
//! RunExecuted` and ends in `Committed` or `RolledBack` (or `Aborted` when the
//! backup or the insertion itself fails). The test file is only ever left
//! modified when the suite passed and coverage strictly improved, except in
//! `RollbackFailed`, where the original could not be put back.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use colored::Colorize;

use crate::coverage::{
    load_fresh_coverage, scoped_coverage, single_file_coverage, CoverageFormat, CoverageScope,
};
use crate::error::{RunnerError, ValidationError};
use crate::test_runner::{TestCommandResult, TestCommandRunner};

const BACKUP_SUFFIX: &str = ".backup";
const DISCARD_ATTEMPTS: u32 = 3;
const DISCARD_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Everything needed to run the suite and score one test file
#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub test_file: PathBuf,
    pub test_command: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub report_path: PathBuf,
    pub report_format: CoverageFormat,
    pub scope: CoverageScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Pass,
    Fail,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStatus::Pass => f.write_str("PASS"),
            ValidationStatus::Fail => f.write_str("FAIL"),
        }
    }
}

/// States of a single validation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Idle,
    BackedUp,
    BaselineMeasured,
    TestInserted,
    RunExecuted,
    Committed,
    RolledBack,
    /// Restoring the backup failed; the test file may still hold the candidate
    RollbackFailed,
    Aborted,
}

/// Verdict on one candidate test
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub status: ValidationStatus,
    pub reason: String,
    pub coverage_before: f64,
    pub coverage_after: f64,
    /// Terminal state the attempt reached
    pub state: ValidationState,
    /// Result of the run that included the candidate, when it happened
    pub run: Option<TestCommandResult>,
}

impl ValidationOutcome {
    fn aborted(reason: impl Into<String>, coverage_before: f64) -> Self {
        Self {
            status: ValidationStatus::Fail,
            reason: reason.into(),
            coverage_before,
            coverage_after: coverage_before,
            state: ValidationState::Aborted,
            run: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == ValidationStatus::Pass
    }

    pub fn print_summary(&self) {
        let status = match self.status {
            ValidationStatus::Pass => "✓ PASS".green().bold(),
            ValidationStatus::Fail => "✗ FAIL".red().bold(),
        };
        println!(
            "  {} {} ({:.2}% → {:.2}%)",
            status,
            self.reason,
            self.coverage_before * 100.0,
            self.coverage_after * 100.0
        );
    }
}

/// One suite run plus the coverage it produced
#[derive(Debug, Clone)]
pub struct Measurement {
    pub run: TestCommandResult,
    pub coverage: f64,
    /// Uncovered lines of the scored source file (empty for whole-report scope)
    pub missed_lines: BTreeSet<u32>,
}

/// Validates candidate tests against one test file, one attempt at a time
pub struct Validator {
    settings: ValidationSettings,
    runner: TestCommandRunner,
}

impl Validator {
    pub fn new(settings: ValidationSettings) -> Self {
        Self {
            settings,
            runner: TestCommandRunner::new(),
        }
    }

    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    pub fn backup_path(&self) -> PathBuf {
        backup_path_for(&self.settings.test_file)
    }

    /// Run the suite once and score the report it produced
    ///
    /// Report problems (missing, stale, malformed) are logged and count as
    /// zero coverage. Only a launch failure is returned as an error.
    pub fn measure(&self) -> Result<Measurement, RunnerError> {
        let s = &self.settings;
        let (started, run) = self
            .runner
            .run_timed(&s.test_command, &s.working_dir, s.timeout)?;

        let (coverage, missed_lines) =
            match load_fresh_coverage(&s.report_path, s.report_format, started) {
                Ok(report) => {
                    let missed_lines = match &s.scope {
                        CoverageScope::File(path) => single_file_coverage(&report, &path.to_string_lossy())
                            .0
                            .missed_lines()
                            .clone(),
                        CoverageScope::Report => BTreeSet::new(),
                    };
                    (scoped_coverage(&report, &s.scope), missed_lines)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "coverage unavailable, treating as 0%");
                    (0.0, BTreeSet::new())
                }
            };

        Ok(Measurement {
            run,
            coverage,
            missed_lines,
        })
    }

    /// Insert `candidate`, run the suite, and keep it only on strict improvement
    ///
    /// Takes `&mut self` so attempts on the same test file never overlap: they
    /// share the backup path.
    pub fn validate(&mut self, candidate: &str) -> ValidationOutcome {
        let test_file = self.settings.test_file.clone();

        if candidate.trim().is_empty() {
            return ValidationOutcome::aborted("no test code provided", 0.0);
        }

        if let Err(e) = recover_leftover_backup(&test_file) {
            tracing::error!(error = %e, "could not recover leftover backup");
            return ValidationOutcome::aborted("backup failed", 0.0);
        }

        // Idle → BackedUp
        let backup = match BackupGuard::acquire(&test_file) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!(error = %e, "backup failed, candidate not attempted");
                return ValidationOutcome::aborted("backup failed", 0.0);
            }
        };
        let mut state = ValidationState::BackedUp;
        tracing::debug!(?state, backup = %backup.backup.display(), "test file backed up");

        // BackedUp → BaselineMeasured
        let coverage_before = match self.measure() {
            Ok(baseline) => {
                if !baseline.run.success() {
                    tracing::warn!(exit_code = baseline.run.exit_code, "baseline test run failed");
                }
                baseline.coverage
            }
            Err(e) => {
                tracing::warn!(error = %e, "baseline test run could not be launched");
                0.0
            }
        };
        state = ValidationState::BaselineMeasured;
        tracing::debug!(?state, coverage_before, "baseline measured");

        // BaselineMeasured → TestInserted
        if let Err(e) = append_candidate(&test_file, candidate) {
            tracing::error!(error = %e, "candidate insertion failed");
            if let Err(e) = backup.restore() {
                tracing::error!(error = %e, "restore after failed insertion failed");
            }
            return ValidationOutcome::aborted("failed to insert candidate test", coverage_before);
        }
        state = ValidationState::TestInserted;
        tracing::debug!(?state, "candidate inserted");

        // TestInserted → RunExecuted
        let measured = self.measure();
        state = ValidationState::RunExecuted;
        tracing::debug!(?state, "candidate run finished");

        let (run, coverage_after, verdict) = match measured {
            Err(e) => (None, coverage_before, Err(format!("test command could not be launched: {}", e))),
            Ok(m) if m.run.timed_out => {
                let reason = format!(
                    "test command timed out after {:.1}s",
                    self.settings.timeout.as_secs_f64()
                );
                (Some(m.run), coverage_before, Err(reason))
            }
            Ok(m) if m.run.exit_code != 0 => {
                let reason = format!("test run failed with exit code {}", m.run.exit_code);
                (Some(m.run), coverage_before, Err(reason))
            }
            Ok(m) if m.coverage > coverage_before => {
                (Some(m.run), m.coverage, Ok("test passed and increased coverage".to_string()))
            }
            Ok(m) => (
                Some(m.run),
                m.coverage,
                Err("test passed but did not increase coverage".to_string()),
            ),
        };

        // RunExecuted → Committed | RolledBack | RollbackFailed
        let backup_file = backup.backup.clone();
        let rolled_back = |reason: String, restored: Result<(), ValidationError>| match restored {
            Ok(()) => (ValidationStatus::Fail, reason, ValidationState::RolledBack),
            Err(e) => {
                tracing::error!(error = %e, "rollback failed");
                let reason = format!("{}; rollback failed: {}", reason, e);
                (ValidationStatus::Fail, reason, ValidationState::RollbackFailed)
            }
        };

        let (status, reason, state) = match verdict {
            Ok(reason) => match backup.commit() {
                Ok(()) => (ValidationStatus::Pass, reason, ValidationState::Committed),
                Err(e) => {
                    // A stale backup would revert the candidate on the next attempt
                    tracing::error!(error = %e, "could not discard backup, reverting candidate");
                    let reason = format!("could not discard backup after commit: {}", e);
                    rolled_back(reason, restore_backup(&backup_file, &test_file))
                }
            },
            Err(reason) => rolled_back(reason, backup.restore()),
        };

        tracing::info!(
            %status,
            ?state,
            coverage_before,
            coverage_after,
            reason = %reason,
            "candidate validated"
        );

        ValidationOutcome {
            status,
            reason,
            coverage_before,
            coverage_after,
            state,
            run,
        }
    }
}

pub fn backup_path_for(test_file: &Path) -> PathBuf {
    let mut name = test_file.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// A backup left behind by an interrupted attempt means the test file may
/// still hold an unvalidated candidate; put the original back first.
fn recover_leftover_backup(test_file: &Path) -> Result<(), ValidationError> {
    let backup = backup_path_for(test_file);
    if !backup.is_file() {
        return Ok(());
    }

    tracing::warn!(backup = %backup.display(), "restoring leftover backup from an interrupted attempt");
    fs::rename(&backup, test_file).map_err(|source| ValidationError::Restore {
        path: test_file.to_path_buf(),
        source,
    })
}

fn append_candidate(test_file: &Path, candidate: &str) -> Result<(), ValidationError> {
    let insert_err = |source| ValidationError::Insert {
        path: test_file.to_path_buf(),
        source,
    };

    let mut content = match fs::read(test_file) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(insert_err(e)),
    };

    if !content.is_empty() {
        content.extend_from_slice(b"\n\n");
    }
    content.extend_from_slice(candidate.as_bytes());

    fs::write(test_file, content).map_err(insert_err)
}

/// Scoped ownership of `<test_file>.backup`
///
/// Released exactly once, by [`commit`](Self::commit) (delete the copy) or
/// [`restore`](Self::restore) (rename it back over the test file). If neither
/// runs, e.g. while unwinding from a panic, `Drop` restores.
struct BackupGuard {
    target: PathBuf,
    backup: PathBuf,
    released: bool,
}

impl BackupGuard {
    fn acquire(target: &Path) -> Result<Self, ValidationError> {
        let backup = backup_path_for(target);
        let backup_err = |source| ValidationError::Backup {
            path: target.to_path_buf(),
            source,
        };

        if target.exists() {
            fs::copy(target, &backup).map_err(backup_err)?;
        } else {
            fs::write(&backup, b"").map_err(backup_err)?;
        }

        Ok(Self {
            target: target.to_path_buf(),
            backup,
            released: false,
        })
    }

    fn commit(mut self) -> Result<(), ValidationError> {
        self.released = true;
        discard_backup(&self.target, &self.backup, |path| fs::remove_file(path))
    }

    fn restore(mut self) -> Result<(), ValidationError> {
        self.released = true;
        restore_backup(&self.backup, &self.target)
    }
}

fn restore_backup(backup: &Path, target: &Path) -> Result<(), ValidationError> {
    let restore_err = |source| ValidationError::Restore {
        path: target.to_path_buf(),
        source,
    };

    if fs::rename(backup, target).is_ok() {
        return Ok(());
    }
    // Fall back to copy + delete, e.g. when the target is held open elsewhere
    fs::copy(backup, target).map_err(restore_err)?;
    fs::remove_file(backup).map_err(restore_err)
}

/// Remove the backup of a committed test file
///
/// Retries a few times. If the file still cannot be removed it is overwritten
/// with the committed content, so leftover-backup recovery keeps the new test.
/// An error means the backup still holds the pre-commit content.
fn discard_backup(
    target: &Path,
    backup: &Path,
    remove: impl Fn(&Path) -> io::Result<()>,
) -> Result<(), ValidationError> {
    let mut attempt = 1;
    let last_error = loop {
        match remove(backup) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt >= DISCARD_ATTEMPTS => break e,
            Err(e) => {
                tracing::warn!(error = %e, attempt, "could not remove backup, retrying");
                attempt += 1;
                thread::sleep(DISCARD_RETRY_DELAY);
            }
        }
    };

    tracing::warn!(
        error = %last_error,
        backup = %backup.display(),
        "backup could not be removed, overwriting it with the committed test file"
    );
    fs::copy(target, backup)
        .map(|_| ())
        .map_err(|source| ValidationError::Backup {
            path: target.to_path_buf(),
            source,
        })
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = restore_backup(&self.backup, &self.target) {
            tracing::error!(error = %e, backup = %self.backup.display(), "backup could not be restored");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    // Line coverage of calc.py grows by one line per `def test_` in the test file:
    // 10/20 with no tests, 11/20 with one.
    const SUITE: &str = r#"
n=$(grep -c '^def test_' test_calc.py)
{
  echo "SF:calc.py"
  i=1
  while [ $i -le 20 ]; do
    if [ $i -le $((10 + n)) ]; then echo "DA:$i,1"; else echo "DA:$i,0"; fi
    i=$((i + 1))
  done
  echo "end_of_record"
} > cov.info
if grep -q 'SLEEP' test_calc.py; then sleep 100; fi
if grep -q 'assert False' test_calc.py; then exit 1; fi
exit 0
"#;

    const ORIGINAL: &str = "import calc\n";

    fn setup(timeout: Duration) -> (tempfile::TempDir, Validator) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("run_tests.sh"), SUITE).unwrap();
        fs::write(dir.path().join("test_calc.py"), ORIGINAL).unwrap();

        let validator = Validator::new(ValidationSettings {
            test_file: dir.path().join("test_calc.py"),
            test_command: "sh run_tests.sh".to_string(),
            working_dir: dir.path().to_path_buf(),
            timeout,
            report_path: dir.path().join("cov.info"),
            report_format: CoverageFormat::Lcov,
            scope: CoverageScope::File(dir.path().join("calc.py")),
        });

        (dir, validator)
    }

    fn test_file_content(dir: &tempfile::TempDir) -> String {
        fs::read_to_string(dir.path().join("test_calc.py")).unwrap()
    }

    #[test]
    fn test_improving_candidate_is_committed() {
        let (dir, mut validator) = setup(Duration::from_secs(20));
        let candidate = "def test_add():\n    assert calc.add(1, 2) == 3\n";

        let outcome = validator.validate(candidate);

        assert_eq!(outcome.status, ValidationStatus::Pass);
        assert_eq!(outcome.state, ValidationState::Committed);
        assert!((outcome.coverage_before - 0.50).abs() < 1e-9);
        assert!((outcome.coverage_after - 0.55).abs() < 1e-9);
        assert_eq!(test_file_content(&dir), format!("{}\n\n{}", ORIGINAL, candidate));
        assert!(!validator.backup_path().exists());
    }

    #[test]
    fn test_non_improving_candidate_is_rolled_back() {
        let (dir, mut validator) = setup(Duration::from_secs(20));

        let outcome = validator.validate("# just a comment\n");

        assert_eq!(outcome.status, ValidationStatus::Fail);
        assert_eq!(outcome.state, ValidationState::RolledBack);
        assert!((outcome.coverage_before - 0.50).abs() < 1e-9);
        assert!((outcome.coverage_after - 0.50).abs() < 1e-9);
        assert_eq!(test_file_content(&dir), ORIGINAL);
        assert!(!validator.backup_path().exists());
    }

    #[test]
    fn test_failing_candidate_is_rolled_back() {
        let (dir, mut validator) = setup(Duration::from_secs(20));

        let outcome = validator.validate("def test_broken():\n    assert False\n");

        assert_eq!(outcome.status, ValidationStatus::Fail);
        assert_eq!(outcome.state, ValidationState::RolledBack);
        assert!(outcome.reason.contains("exit code 1"));
        assert_eq!(outcome.run.as_ref().map(|r| r.exit_code), Some(1));
        assert_eq!(test_file_content(&dir), ORIGINAL);
        assert!(!validator.backup_path().exists());
    }

    #[test]
    fn test_timed_out_candidate_is_rolled_back() {
        let (dir, mut validator) = setup(Duration::from_secs(1));

        let outcome = validator.validate("def test_slow():\n    SLEEP\n");

        assert_eq!(outcome.status, ValidationStatus::Fail);
        assert_eq!(outcome.state, ValidationState::RolledBack);
        let run = outcome.run.expect("candidate run recorded");
        assert!(run.timed_out);
        assert_eq!(run.exit_code, -1);
        assert_eq!(test_file_content(&dir), ORIGINAL);
        assert!(!validator.backup_path().exists());
    }

    #[test]
    fn test_missing_report_counts_as_no_improvement() {
        let (dir, mut validator) = setup(Duration::from_secs(20));
        validator.settings.test_command = "true".to_string();

        let outcome = validator.validate("def test_add():\n    pass\n");

        assert_eq!(outcome.status, ValidationStatus::Fail);
        assert_eq!(outcome.coverage_before, 0.0);
        assert_eq!(outcome.coverage_after, 0.0);
        assert_eq!(test_file_content(&dir), ORIGINAL);
    }

    #[test]
    fn test_missing_test_file_rolls_back_to_empty() {
        let (dir, mut validator) = setup(Duration::from_secs(20));
        fs::remove_file(dir.path().join("test_calc.py")).unwrap();
        // The suite needs the file to exist to count tests
        validator.settings.test_command = "touch test_calc.py; sh run_tests.sh".to_string();

        let outcome = validator.validate("# nothing useful\n");

        assert_eq!(outcome.state, ValidationState::RolledBack);
        assert_eq!(test_file_content(&dir), "");
        assert!(!validator.backup_path().exists());
    }

    #[test]
    fn test_backup_failure_aborts_before_mutation() {
        let (dir, mut validator) = setup(Duration::from_secs(20));
        // A directory squatting on the backup path makes the copy fail
        fs::create_dir(validator.backup_path()).unwrap();

        let outcome = validator.validate("def test_add():\n    pass\n");

        assert_eq!(outcome.status, ValidationStatus::Fail);
        assert_eq!(outcome.state, ValidationState::Aborted);
        assert_eq!(outcome.reason, "backup failed");
        assert_eq!(test_file_content(&dir), ORIGINAL);
    }

    #[test]
    fn test_leftover_backup_is_recovered_first() {
        let (dir, mut validator) = setup(Duration::from_secs(20));
        // Simulate a crash mid-attempt: file holds an unvalidated candidate
        fs::write(validator.backup_path(), ORIGINAL).unwrap();
        fs::write(dir.path().join("test_calc.py"), "import calc\n\ndef test_junk(): pass\n").unwrap();

        let outcome = validator.validate("# comment only\n");

        assert_eq!(outcome.state, ValidationState::RolledBack);
        assert_eq!(test_file_content(&dir), ORIGINAL);
        assert!(!validator.backup_path().exists());
    }

    #[test]
    fn test_empty_candidate_is_rejected() {
        let (dir, mut validator) = setup(Duration::from_secs(20));

        let outcome = validator.validate("   \n");

        assert_eq!(outcome.state, ValidationState::Aborted);
        assert_eq!(test_file_content(&dir), ORIGINAL);
        assert!(!validator.backup_path().exists());
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t.py");
        fs::write(&target, "before").unwrap();

        {
            let _guard = BackupGuard::acquire(&target).unwrap();
            fs::write(&target, "after").unwrap();
        }

        assert_eq!(fs::read_to_string(&target).unwrap(), "before");
        assert!(!backup_path_for(&target).exists());
    }

    #[test]
    fn test_failed_rollback_is_reported() {
        let (dir, mut validator) = setup(Duration::from_secs(20));
        // The suite deletes the backup, so there is nothing to restore from
        validator.settings.test_command = "rm -f test_calc.py.backup; sh run_tests.sh".to_string();

        let outcome = validator.validate("# comment only\n");

        assert_eq!(outcome.status, ValidationStatus::Fail);
        assert_eq!(outcome.state, ValidationState::RollbackFailed);
        assert!(outcome.reason.contains("rollback failed"));
        assert!(test_file_content(&dir).contains("# comment only"));
    }

    #[test]
    fn test_discard_backup_retries_then_removes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t.py");
        let backup = backup_path_for(&target);
        fs::write(&target, "committed").unwrap();
        fs::write(&backup, "original").unwrap();

        let calls = std::cell::Cell::new(0);
        discard_backup(&target, &backup, |path| {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "busy"))
            } else {
                fs::remove_file(path)
            }
        })
        .unwrap();

        assert_eq!(calls.get(), 2);
        assert!(!backup.exists());
    }

    #[test]
    fn test_undeletable_backup_cannot_revert_committed_test() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t.py");
        let backup = backup_path_for(&target);
        fs::write(&target, "original\n\ndef test_new(): pass\n").unwrap();
        fs::write(&backup, "original\n").unwrap();

        discard_backup(&target, &backup, |_| {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
        })
        .unwrap();

        // A later attempt recovering the leftover keeps the committed test
        recover_leftover_backup(&target).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "original\n\ndef test_new(): pass\n");
        assert!(!backup.exists());
    }

    #[test]
    fn test_sequential_attempts_accumulate() {
        let (dir, mut validator) = setup(Duration::from_secs(20));

        let first = validator.validate("def test_one():\n    pass\n");
        let second = validator.validate("def test_two():\n    pass\n");

        assert!(first.passed());
        assert!(second.passed());
        assert!((second.coverage_before - 0.55).abs() < 1e-9);
        assert!((second.coverage_after - 0.60).abs() < 1e-9);
        let content = test_file_content(&dir);
        assert!(content.contains("def test_one"));
        assert!(content.contains("def test_two"));
    }
}
