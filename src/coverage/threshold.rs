//! Coverage comparison and target checks

use colored::Colorize;

/// Change in coverage between two measurements, as fractions in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageDelta {
    pub before: f64,
    pub after: f64,
    pub delta: f64,
}

impl CoverageDelta {
    pub fn new(before: f64, after: f64) -> Self {
        Self {
            before,
            after,
            delta: after - before,
        }
    }

    /// Strictly greater coverage; equal coverage is not an improvement
    pub fn improved(&self) -> bool {
        self.after > self.before
    }

    pub fn degraded(&self) -> bool {
        self.after < self.before
    }

    pub fn print_summary(&self, label: &str) {
        let points = self.delta * 100.0;

        let indicator = if self.improved() {
            "↑".green()
        } else if self.degraded() {
            "↓".red()
        } else {
            "→".dimmed()
        };

        let delta_str = if self.improved() {
            format!("+{:.2}%", points).green()
        } else if self.degraded() {
            format!("{:.2}%", points).red()
        } else {
            "0%".dimmed()
        };

        println!(
            "  {} {}: {:.2}% → {:.2}% ({})",
            indicator,
            label,
            self.before * 100.0,
            self.after * 100.0,
            delta_str
        );
    }
}

/// Has `coverage` (a fraction) reached `desired_percent` (0-100)?
pub fn meets_target(coverage: f64, desired_percent: f64) -> bool {
    coverage * 100.0 + 1e-9 >= desired_percent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coverage_delta() {
        let delta = CoverageDelta::new(0.50, 0.55);
        assert!(delta.improved());
        assert!(!delta.degraded());
        assert!((delta.delta - 0.05).abs() < 1e-9);

        let flat = CoverageDelta::new(0.5, 0.5);
        assert!(!flat.improved());
        assert!(!flat.degraded());
    }

    #[test]
    fn test_meets_target() {
        assert!(meets_target(0.70, 70.0));
        assert!(meets_target(0.9, 70.0));
        assert!(!meets_target(0.69, 70.0));
        assert!(meets_target(0.0, 0.0));
    }
}
