use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::eval::{DEFAULT_GAP_THRESHOLD_POINTS, WalkRules};

pub const GAP_THRESHOLD_ENV: &str = "MONGO_EVAL_GAP_THRESHOLD";

/// Harness settings. Every field has a default, so a config file only lists
/// what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub gap_threshold_points: f64,
    pub grouping_operators: Vec<String>,
    pub implicit_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        let rules = WalkRules::default();
        Self {
            gap_threshold_points: DEFAULT_GAP_THRESHOLD_POINTS,
            grouping_operators: rules.grouping_operators,
            implicit_fields: rules.implicit_fields,
            workers: None,
        }
    }
}

impl EvalConfig {
    /// Load from `path` (or defaults), then apply the environment override.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let config: Self = serde_json::from_slice(&raw)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                info!(path = %path.display(), "loaded harness config");
                config
            }
            None => Self::default(),
        };

        let from_env = std::env::var(GAP_THRESHOLD_ENV).ok();
        if let Some(threshold) = parse_gap_threshold(from_env.as_deref())? {
            config.gap_threshold_points = threshold;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides, which win over file and environment.
    pub fn with_overrides(
        mut self,
        gap_threshold_points: Option<f64>,
        workers: Option<usize>,
    ) -> Result<Self> {
        if let Some(threshold) = gap_threshold_points {
            self.gap_threshold_points = threshold;
        }
        if workers.is_some() {
            self.workers = workers;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.gap_threshold_points.is_finite() || self.gap_threshold_points < 0.0 {
            bail!(
                "gap threshold must be a non-negative number of percentage points, got {}",
                self.gap_threshold_points
            );
        }
        if let Some(operator) = self
            .grouping_operators
            .iter()
            .find(|operator| !crate::eval::is_operator_shaped(operator))
        {
            bail!("grouping operator {operator:?} does not start with '$'");
        }
        if self.workers == Some(0) {
            bail!("workers must be at least 1");
        }
        Ok(())
    }

    pub fn walk_rules(&self) -> WalkRules {
        WalkRules {
            grouping_operators: self.grouping_operators.clone(),
            implicit_fields: self.implicit_fields.clone(),
        }
    }
}

fn parse_gap_threshold(raw: Option<&str>) -> Result<Option<f64>> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    let threshold = raw
        .parse::<f64>()
        .with_context(|| format!("{GAP_THRESHOLD_ENV} is not a number: {raw}"))?;
    Ok(Some(threshold))
}
