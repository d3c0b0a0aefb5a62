//! Engine configuration.
//!
//! Mirrors a TOML file with two optional tables:
//! ```toml
//! [analysis]
//! p_value = 0.1
//! allocation = [0.5, 0.5]
//! srm_p_value = 0.01
//! average_order_value = 42.0
//!
//! [simulation]
//! base_conversion_rate = 0.05
//! variants = 2
//! visitors_per_day = 1000000
//! batch_size = 10000
//! seed = 7
//! experiments = 10
//! dev_capacity = 2
//! average_effect_pct = -0.05
//! average_effect_stddev_pct = 0.5
//! total_days = 28
//! ```
//! Every field has a default, so an empty file is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StatsError};

// ---------------------------------------------------------------------------
// AnalysisConfig
// ---------------------------------------------------------------------------

/// Settings consumed by [`crate::experiment::ExperimentState`] and
/// [`crate::estimator::EffectEstimator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Significance threshold for the G-test and the two-sided interval level.
    pub p_value: f64,
    /// Traffic weight per variant; `None` means a uniform split.
    pub allocation: Option<Vec<f64>>,
    /// A sample ratio mismatch is flagged when its p-value falls below this.
    pub srm_p_value: f64,
    /// Fixed revenue per conversion, used only by the revenue projection.
    pub average_order_value: Option<f64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            p_value: 0.1,
            allocation: None,
            srm_p_value: 0.01,
            average_order_value: None,
        }
    }
}

impl AnalysisConfig {
    /// Default settings at a different significance threshold.
    pub fn with_p_value(p_value: f64) -> Self {
        Self { p_value, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.p_value > 0.0 && self.p_value < 1.0) {
            return Err(StatsError::Config(format!("p_value must be in (0, 1), got {}", self.p_value)));
        }
        if !(self.srm_p_value > 0.0 && self.srm_p_value < 1.0) {
            return Err(StatsError::Config(format!(
                "srm_p_value must be in (0, 1), got {}",
                self.srm_p_value
            )));
        }
        if let Some(weights) = &self.allocation {
            if weights.len() < 2 {
                return Err(StatsError::Config("allocation needs at least 2 weights".into()));
            }
            if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w <= 0.0) {
                return Err(StatsError::Config(format!("allocation weights must be > 0, got {}", bad)));
            }
        }
        if let Some(aov) = self.average_order_value {
            if !aov.is_finite() || aov <= 0.0 {
                return Err(StatsError::Config(format!("average_order_value must be > 0, got {}", aov)));
            }
        }
        Ok(())
    }

    /// Traffic weights for `variants` arms, checking any configured vector
    /// has the matching length.
    pub fn allocation_for(&self, variants: usize) -> Result<Vec<f64>> {
        match &self.allocation {
            None => Ok(vec![1.0; variants]),
            Some(weights) if weights.len() == variants => Ok(weights.clone()),
            Some(weights) => Err(StatsError::Config(format!(
                "allocation has {} weights but the experiment has {} variants",
                weights.len(),
                variants
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// SimulationConfig
// ---------------------------------------------------------------------------

/// Settings for [`crate::simulator::ExperimentSimulator`] and
/// [`crate::portfolio::Portfolio`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// True conversion probability of the baseline.
    pub base_conversion_rate: f64,
    /// Arms per experiment, baseline included.
    pub variants: usize,
    pub visitors_per_day: u64,
    /// Visitors simulated per call before control returns to the host.
    pub batch_size: u64,
    /// Fixed RNG seed; system entropy when absent.
    pub seed: Option<u64>,
    /// Concurrent experiments in a portfolio.
    pub experiments: usize,
    /// Ended experiments that may be restarted per day.
    pub dev_capacity: usize,
    /// Mean of a new experiment's true effect, in percent.
    pub average_effect_pct: f64,
    /// Standard deviation of a new experiment's true effect, in percent.
    pub average_effect_stddev_pct: f64,
    pub total_days: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            base_conversion_rate: 0.05,
            variants: 2,
            visitors_per_day: 1_000_000,
            batch_size: 10_000,
            seed: None,
            experiments: 10,
            dev_capacity: 2,
            average_effect_pct: -0.05,
            average_effect_stddev_pct: 0.5,
            total_days: 28,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.base_conversion_rate) {
            return Err(StatsError::Config(format!(
                "base_conversion_rate must be in [0, 1], got {}",
                self.base_conversion_rate
            )));
        }
        if self.variants < 2 {
            return Err(StatsError::Config("variants must be >= 2".into()));
        }
        if self.batch_size == 0 {
            return Err(StatsError::Config("batch_size must be >= 1".into()));
        }
        if self.experiments == 0 {
            return Err(StatsError::Config("experiments must be >= 1".into()));
        }
        if !self.average_effect_pct.is_finite() {
            return Err(StatsError::Config("average_effect_pct must be finite".into()));
        }
        if !self.average_effect_stddev_pct.is_finite() || self.average_effect_stddev_pct < 0.0 {
            return Err(StatsError::Config(format!(
                "average_effect_stddev_pct must be >= 0, got {}",
                self.average_effect_stddev_pct
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub analysis: AnalysisConfig,
    pub simulation: SimulationConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()?;
        self.simulation.validate()?;
        if self.analysis.allocation.is_some() {
            self.analysis.allocation_for(self.simulation.variants)?;
        }
        Ok(())
    }
}
