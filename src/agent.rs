//! Iterative test generation driver
//!
//! Measures the baseline, then for each iteration asks a [`CandidateSource`]
//! for new tests and validates them one at a time. Stops when the target
//! coverage is reached or the iteration budget is spent.

use anyhow::Result;
use colored::Colorize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::coverage::{meets_target, CoverageDelta};
use crate::validator::{ValidationOutcome, Validator};

/// Lines of test output kept when feeding a failure back to the generator
const ERROR_EXCERPT_LINES: usize = 20;

/// A rejected candidate and why it was rejected
#[derive(Debug, Clone, PartialEq)]
pub struct FailedAttempt {
    pub code: String,
    pub reason: String,
    pub error_excerpt: String,
}

/// What a candidate source gets to look at
#[derive(Debug)]
pub struct GenerationContext<'a> {
    pub source_file: &'a Path,
    pub source_code: &'a str,
    pub test_file: &'a Path,
    pub test_code: &'a str,
    /// Current coverage as a fraction
    pub coverage: f64,
    pub missed_lines: &'a BTreeSet<u32>,
    pub failed_attempts: &'a [FailedAttempt],
    pub max_tests: usize,
}

/// Supplies candidate test texts, e.g. from a language model
pub trait CandidateSource {
    fn generate(&mut self, ctx: &GenerationContext<'_>) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub source_file: PathBuf,
    pub max_iterations: u32,
    /// Target coverage in percent
    pub desired_coverage: f64,
    pub max_tests_per_iteration: usize,
    pub failed_feedback: usize,
}

/// Final report of a generation run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub initial_coverage: f64,
    pub final_coverage: f64,
    pub desired_coverage: f64,
    pub iterations: u32,
    pub tests_generated: usize,
    pub tests_passed: usize,
    pub duplicates_skipped: usize,
    pub target_reached: bool,
}

impl RunSummary {
    pub fn print(&self) {
        println!("{}", "─".repeat(50).dimmed());
        println!("{}", "Test generation summary".bold());

        CoverageDelta::new(self.initial_coverage, self.final_coverage).print_summary("Coverage");
        println!("  Target coverage:   {:.2}%", self.desired_coverage);
        println!("  Iterations:        {}", self.iterations);
        println!("  Tests generated:   {}", self.tests_generated);
        println!("  Tests passed:      {}", self.tests_passed);
        if self.duplicates_skipped > 0 {
            println!("  Duplicates skipped: {}", self.duplicates_skipped);
        }

        if self.target_reached {
            println!(
                "{} Target coverage {:.2}% reached",
                "✓".green().bold(),
                self.desired_coverage
            );
        } else {
            println!(
                "{} Target coverage {:.2}% not reached ({:.2}%)",
                "✗".red().bold(),
                self.desired_coverage,
                self.final_coverage * 100.0
            );
        }
    }
}

/// Drives generation and validation for one source/test file pair
pub struct CoverAgent<S: CandidateSource> {
    settings: AgentSettings,
    validator: Validator,
    source: S,
    failed: Vec<FailedAttempt>,
    seen: HashSet<String>,
}

impl<S: CandidateSource> CoverAgent<S> {
    pub fn new(settings: AgentSettings, validator: Validator, source: S) -> Self {
        Self {
            settings,
            validator,
            source,
            failed: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn run(&mut self) -> RunSummary {
        let (initial_coverage, mut missed_lines) = self.measure();

        let mut summary = RunSummary {
            initial_coverage,
            final_coverage: initial_coverage,
            desired_coverage: self.settings.desired_coverage,
            iterations: 0,
            tests_generated: 0,
            tests_passed: 0,
            duplicates_skipped: 0,
            target_reached: meets_target(initial_coverage, self.settings.desired_coverage),
        };

        println!(
            "\n{} Baseline coverage: {:.2}% (target {:.2}%)",
            "→".blue(),
            initial_coverage * 100.0,
            self.settings.desired_coverage
        );

        if summary.target_reached {
            println!("{} Target already reached, nothing to generate", "✓".green().bold());
            return summary;
        }

        for iteration in 1..=self.settings.max_iterations {
            summary.iterations = iteration;
            println!(
                "\n{} {}",
                "▶".cyan(),
                format!("Iteration {}/{}", iteration, self.settings.max_iterations).bold()
            );

            let candidates = match self.request_candidates(summary.final_coverage, &missed_lines) {
                Ok(candidates) if !candidates.is_empty() => candidates,
                Ok(_) => {
                    println!("  {} No tests were generated this iteration", "!".yellow());
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %format!("{:#}", e), "candidate generation failed");
                    println!("  {} Generation failed: {}", "!".yellow(), e);
                    continue;
                }
            };

            summary.tests_generated += candidates.len();
            let mut passed_this_iteration = 0;

            for candidate in &candidates {
                if !self.seen.insert(fingerprint(candidate)) {
                    tracing::info!("skipping candidate identical to an earlier attempt");
                    summary.duplicates_skipped += 1;
                    continue;
                }

                let outcome = self.validator.validate(candidate);
                outcome.print_summary();

                if outcome.passed() {
                    passed_this_iteration += 1;
                    summary.tests_passed += 1;
                } else {
                    self.remember_failure(candidate, &outcome);
                }
            }

            println!(
                "  {} {}/{} candidate(s) kept",
                "•".dimmed(),
                passed_this_iteration,
                candidates.len()
            );

            let previous = summary.final_coverage;
            let (coverage, missed) = self.measure();
            missed_lines = missed;
            summary.final_coverage = coverage;
            CoverageDelta::new(previous, coverage).print_summary("Coverage");

            if meets_target(coverage, self.settings.desired_coverage) {
                summary.target_reached = true;
                break;
            }
        }

        summary
    }

    fn measure(&self) -> (f64, BTreeSet<u32>) {
        match self.validator.measure() {
            Ok(m) => {
                if !m.run.success() {
                    tracing::warn!(exit_code = m.run.exit_code, "test suite did not pass while measuring coverage");
                }
                (m.coverage, m.missed_lines)
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not measure coverage, assuming 0%");
                (0.0, BTreeSet::new())
            }
        }
    }

    fn request_candidates(&mut self, coverage: f64, missed_lines: &BTreeSet<u32>) -> Result<Vec<String>> {
        let source_file = self.settings.source_file.clone();
        let test_file = self.validator.settings().test_file.clone();
        let source_code = read_or_empty(&source_file);
        let test_code = read_or_empty(&test_file);

        let ctx = GenerationContext {
            source_file: &source_file,
            source_code: &source_code,
            test_file: &test_file,
            test_code: &test_code,
            coverage,
            missed_lines,
            failed_attempts: &self.failed,
            max_tests: self.settings.max_tests_per_iteration,
        };

        let mut candidates = self.source.generate(&ctx)?;
        candidates.retain(|c| !c.trim().is_empty());
        candidates.truncate(self.settings.max_tests_per_iteration);
        Ok(candidates)
    }

    fn remember_failure(&mut self, candidate: &str, outcome: &ValidationOutcome) {
        if self.settings.failed_feedback == 0 {
            return;
        }

        let error_excerpt = outcome
            .run
            .as_ref()
            .filter(|run| !run.success())
            .map(|run| tail_lines(&format!("{}\n{}", run.stdout, run.stderr), ERROR_EXCERPT_LINES))
            .unwrap_or_default();

        self.failed.push(FailedAttempt {
            code: candidate.to_string(),
            reason: outcome.reason.clone(),
            error_excerpt,
        });

        if self.failed.len() > self.settings.failed_feedback {
            let excess = self.failed.len() - self.settings.failed_feedback;
            self.failed.drain(..excess);
        }
    }
}

fn read_or_empty(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "could not read file for prompt");
        String::new()
    })
}

/// Hash of a candidate ignoring surrounding whitespace
fn fingerprint(candidate: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(candidate.trim().as_bytes());
    hex::encode(hasher.finalize())
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
