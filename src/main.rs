use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use covgen::agent::{AgentSettings, CoverAgent};
use covgen::ai::LlmCandidateSource;
use covgen::config::Config;
use covgen::coverage::{self, CoverageFormat};
use covgen::history::{self, Database, RunRecord};
use covgen::validator::Validator;

const CONFIG_FILE: &str = "covgen.toml";

#[derive(Parser)]
#[command(name = "covgen")]
#[command(about = "Generate tests that raise coverage, keeping only the ones that help")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: covgen.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and validate tests until the target coverage is reached
    Run {
        /// Override generation.max_iterations
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Override generation.desired_coverage (percent)
        #[arg(long)]
        desired_coverage: Option<f64>,
    },

    /// Print the coverage found in a report
    Coverage {
        /// Report file to read
        report: PathBuf,

        /// Report format: cobertura, lcov, jacoco, diff_cover_json
        #[arg(short, long, default_value = "cobertura")]
        format: CoverageFormat,

        /// Only show the entry matching this source file
        #[arg(long)]
        file: Option<String>,
    },

    /// Show recent generation runs
    History {
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

    match cli.command {
        Commands::Run {
            max_iterations,
            desired_coverage,
        } => {
            let config_path = std::fs::canonicalize(&config_path)
                .with_context(|| format!("Could not find config file: {}", config_path.display()))?;
            let mut config = Config::load(&config_path)
                .with_context(|| format!("Could not load {}", config_path.display()))?;

            if let Some(n) = max_iterations {
                config.generation.max_iterations = n;
            }
            if let Some(pct) = desired_coverage {
                if !(0.0..=100.0).contains(&pct) {
                    anyhow::bail!("--desired-coverage must be between 0 and 100, got {}", pct);
                }
                config.generation.desired_coverage = pct;
            }

            cmd_run(&config)
        }
        Commands::Coverage { report, format, file } => cmd_coverage(&report, format, file.as_deref()),
        Commands::History { limit } => cmd_history(&db_path(&config_path), limit),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// History lives next to the config file
fn db_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(history::DEFAULT_DB_FILE)
}

fn cmd_run(config: &Config) -> Result<()> {
    let source = LlmCandidateSource::new(&config.ai)?;

    println!("\n{} {}", "📦".cyan(), config.project_name().bold());
    println!("  {} {}", "source:".dimmed(), config.source_file().display());
    println!("  {} {}", "tests:".dimmed(), config.test_file().display());
    println!("  {} {}", "command:".dimmed(), config.test.command);
    println!("  {} {}", "model:".dimmed(), source.model());

    if !config.source_file().is_file() {
        anyhow::bail!("Source file not found: {}", config.source_file().display());
    }

    let settings = AgentSettings {
        source_file: config.source_file(),
        max_iterations: config.generation.max_iterations,
        desired_coverage: config.generation.desired_coverage,
        max_tests_per_iteration: config.generation.max_tests_per_iteration,
        failed_feedback: config.generation.failed_feedback,
    };

    let validator = Validator::new(config.validation_settings());
    let mut agent = CoverAgent::new(settings, validator, source);
    let summary = agent.run();
    summary.print();

    let record = RunRecord::from_summary(&config.source_file(), &config.test_file(), &summary);
    let db_file = config.base_dir.join(history::DEFAULT_DB_FILE);
    match Database::open(&db_file).and_then(|db| db.insert_run(&record)) {
        Ok(()) => tracing::debug!(id = %record.id, "run recorded"),
        Err(e) => tracing::warn!(error = %format!("{:#}", e), "could not record run history"),
    }

    if !summary.target_reached {
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_coverage(report_path: &Path, format: CoverageFormat, file: Option<&str>) -> Result<()> {
    let report = coverage::parse_coverage(report_path, format)?;

    match file {
        Some(source) => {
            let (file_coverage, found) = coverage::single_file_coverage(&report, source);
            if !found {
                anyhow::bail!("No entry in {} matches {}", report_path.display(), source);
            }
            print_file_line(source, file_coverage.percentage(), file_coverage.lines_covered(), file_coverage.lines_total());
            if !file_coverage.missed_lines().is_empty() {
                let missed: Vec<String> = file_coverage.missed_lines().iter().map(|l| l.to_string()).collect();
                println!("    {} {}", "missed:".dimmed(), missed.join(", "));
            }
        }
        None => {
            if report.is_empty() {
                println!("{}", "No files in report".dimmed());
                return Ok(());
            }
            for (path, file_coverage) in report.iter() {
                print_file_line(path, file_coverage.percentage(), file_coverage.lines_covered(), file_coverage.lines_total());
            }
            println!("{}", "─".repeat(50).dimmed());
            println!(
                "  {} {:.2}%",
                "Total:".bold(),
                coverage::total_coverage(&report) * 100.0
            );
        }
    }

    Ok(())
}

fn print_file_line(path: &str, percentage: f64, covered: usize, total: usize) {
    let pct = format!("{:>7.2}%", percentage * 100.0);
    let pct = if percentage >= 0.8 {
        pct.green()
    } else if percentage >= 0.5 {
        pct.yellow()
    } else {
        pct.red()
    };
    println!("  {} {} {}", pct, path.cyan(), format!("({}/{})", covered, total).dimmed());
}

fn cmd_history(db_file: &Path, limit: u32) -> Result<()> {
    let db = Database::open(db_file)?;
    let records = db.recent_runs(limit)?;
    history::print_history(&records);
    Ok(())
}
