use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ai::AiConfig;
use crate::coverage::{CoverageFormat, CoverageScope, ScopeKind};
use crate::validator::ValidationSettings;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub project: Project,
    pub test: TestSettings,
    pub coverage: CoverageSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub ai: AiConfig,
    /// Directory the config was loaded from; relative paths resolve against it
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub name: Option<String>,
    pub source_file: PathBuf,
    pub test_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestSettings {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Timeout in seconds for one run of the test command (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoverageSettings {
    pub report_path: PathBuf,
    #[serde(default)]
    pub format: CoverageFormat,
    /// Score the source file only (`file`) or the whole report (`report`)
    #[serde(default)]
    pub scope: ScopeKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSettings {
    /// Generation rounds before giving up (default: 3)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Target coverage in percent (default: 70)
    #[serde(default = "default_desired_coverage")]
    pub desired_coverage: f64,
    /// Upper bound on candidates requested per round (default: 5)
    #[serde(default = "default_max_tests_per_iteration")]
    pub max_tests_per_iteration: usize,
    /// Failed candidates fed back into the next round (default: 3)
    #[serde(default = "default_failed_feedback")]
    pub failed_feedback: usize,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_iterations() -> u32 {
    3
}

fn default_desired_coverage() -> f64 {
    70.0
}

fn default_max_tests_per_iteration() -> usize {
    5
}

fn default_failed_feedback() -> usize {
    3
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            desired_coverage: default_desired_coverage(),
            max_tests_per_iteration: default_max_tests_per_iteration(),
            failed_feedback: default_failed_feedback(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::from_toml(&content, &base_dir)
    }

    pub fn from_toml(content: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).with_context(|| "Failed to parse covgen.toml")?;
        config.base_dir = base_dir.to_path_buf();

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.test.command.trim().is_empty() {
            anyhow::bail!("test.command must not be empty");
        }
        if self.test.timeout_secs == 0 {
            anyhow::bail!("test.timeout_secs must be greater than 0");
        }
        let desired = self.generation.desired_coverage;
        if !desired.is_finite() || !(0.0..=100.0).contains(&desired) {
            anyhow::bail!("generation.desired_coverage must be between 0 and 100, got {}", desired);
        }
        if self.generation.max_tests_per_iteration == 0 {
            anyhow::bail!("generation.max_tests_per_iteration must be at least 1");
        }

        Ok(())
    }

    /// Resolve a configured path against the config directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn project_name(&self) -> String {
        self.project.name.clone().unwrap_or_else(|| {
            self.project
                .source_file
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string())
        })
    }

    pub fn source_file(&self) -> PathBuf {
        self.resolve(&self.project.source_file)
    }

    pub fn test_file(&self) -> PathBuf {
        self.resolve(&self.project.test_file)
    }

    pub fn working_dir(&self) -> PathBuf {
        match &self.test.cwd {
            Some(cwd) => self.resolve(cwd),
            None => self.base_dir.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.test.timeout_secs)
    }

    pub fn scope(&self) -> CoverageScope {
        match self.coverage.scope {
            ScopeKind::File => CoverageScope::File(self.source_file()),
            ScopeKind::Report => CoverageScope::Report,
        }
    }

    pub fn validation_settings(&self) -> ValidationSettings {
        ValidationSettings {
            test_file: self.test_file(),
            test_command: self.test.command.clone(),
            working_dir: self.working_dir(),
            timeout: self.timeout(),
            report_path: self.resolve(&self.coverage.report_path),
            report_format: self.coverage.format,
            scope: self.scope(),
        }
    }
}
