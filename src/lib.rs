//! Covgen - coverage-driven test generation
//!
//! A library for growing a test suite one validated test at a time:
//! - Coverage report parsing (Cobertura XML, LCOV, diff-cover JSON)
//! - Path matching between report entries and source files
//! - Test command execution with timeouts and process-group cleanup
//! - Crash-safe validation of candidate tests with backup and rollback
//! - An iteration driver fed by a language model

pub mod agent;
pub mod ai;
pub mod config;
pub mod coverage;
pub mod error;
pub mod history;
pub mod test_runner;
pub mod validator;

pub use agent::{AgentSettings, CandidateSource, CoverAgent, FailedAttempt, GenerationContext, RunSummary};
pub use coverage::{
    parse_coverage, scoped_coverage, single_file_coverage, total_coverage, CoverageFormat, CoverageReport,
    CoverageScope, FileCoverage,
};
pub use error::{CoverageError, RunnerError, ValidationError};
pub use test_runner::{TestCommandResult, TestCommandRunner};
pub use validator::{ValidationOutcome, ValidationState, ValidationStatus, Validator};
