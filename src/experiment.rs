//! # Stage: Experiment State
//!
//! ## Responsibility
//! Per-variant visit/conversion counts for one experiment, its significance
//! threshold, and its lifecycle `Inactive → Active → Ended`.
//!
//! ## Guarantees
//! - `conversions <= visits` for every variant, at all times
//! - Single owner: only the holder of `&mut ExperimentState` mutates counts;
//!   estimators borrow it immutably
//! - `Ended` is terminal: counts are frozen but remain queryable
//!
//! ## NOT Responsible For
//! - Drawing visitors or outcomes (see [`crate::simulator`])
//! - Computing statistics (see [`crate::estimator`])

use serde::Serialize;
use tracing::info;

use crate::config::AnalysisConfig;
use crate::distributions::chi_square_quantile;
use crate::error::{Result, StatsError};

// ---------------------------------------------------------------------------
// VariantObservation
// ---------------------------------------------------------------------------

/// Visits and conversions seen by one variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VariantObservation {
    visits: u64,
    conversions: u64,
}

impl VariantObservation {
    pub fn new(visits: u64, conversions: u64) -> Result<Self> {
        if conversions > visits {
            return Err(StatsError::InvalidObservation { visits, conversions });
        }
        Ok(Self { visits, conversions })
    }

    pub fn visits(&self) -> u64 { self.visits }

    pub fn conversions(&self) -> u64 { self.conversions }

    /// `conversions / visits`; NaN when there are no visits.
    pub fn conversion_rate(&self) -> f64 {
        self.conversions as f64 / self.visits as f64
    }

    /// Binomial standard error `sqrt(p(1-p)/n)`; NaN when there are no visits.
    pub fn standard_error(&self) -> f64 {
        let p = self.conversion_rate();
        (p * (1.0 - p) / self.visits as f64).sqrt()
    }

    fn record(&mut self, converted: bool) {
        self.visits += 1;
        if converted {
            self.conversions += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Created but never started.
    Inactive,
    /// Accepting visitors.
    Active,
    /// Stopped for good; counts are frozen.
    Ended,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Inactive => write!(f, "inactive"),
            Phase::Active   => write!(f, "active"),
            Phase::Ended    => write!(f, "ended"),
        }
    }
}

// ---------------------------------------------------------------------------
// ExperimentState
// ---------------------------------------------------------------------------

/// Counts for every variant of one experiment (index 0 is the baseline),
/// plus the G-test cutoff derived from the configured p-value.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentState {
    observations: Vec<VariantObservation>,
    phase: Phase,
    p_value: f64,
    cutoff: f64,
    days: u32,
}

impl ExperimentState {
    /// A fresh, `Inactive` experiment with `variants` zeroed arms.
    pub fn new(variants: usize, config: &AnalysisConfig) -> Result<Self> {
        if variants < 2 {
            return Err(StatsError::Config(format!(
                "an experiment needs at least 2 variants, got {}",
                variants
            )));
        }
        config.validate()?;
        let cutoff = chi_square_quantile((variants - 1) as u32, config.p_value)?;
        Ok(Self {
            observations: vec![VariantObservation::default(); variants],
            phase: Phase::Inactive,
            p_value: config.p_value,
            cutoff,
            days: 0,
        })
    }

    /// State for counts gathered elsewhere, ready for analysis.
    pub fn from_counts(visits: &[u64], conversions: &[u64], config: &AnalysisConfig) -> Result<Self> {
        if visits.len() != conversions.len() {
            return Err(StatsError::Config(format!(
                "{} visit counts but {} conversion counts",
                visits.len(),
                conversions.len()
            )));
        }
        let mut state = Self::new(visits.len(), config)?;
        state.observations = visits
            .iter()
            .zip(conversions)
            .map(|(&v, &c)| VariantObservation::new(v, c))
            .collect::<Result<_>>()?;
        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Zero all counts and enter `Active`. Rejected once the experiment has ended.
    pub fn reset(&mut self) -> Result<()> {
        if self.phase == Phase::Ended {
            return Err(StatsError::InvalidTransition { phase: self.phase, action: "reset" });
        }
        self.observations.iter_mut().for_each(|o| *o = VariantObservation::default());
        self.days = 0;
        self.phase = Phase::Active;
        info!(variants = self.observations.len(), "experiment reset");
        Ok(())
    }

    /// Enter the terminal `Ended` phase. Idempotent.
    pub fn end(&mut self) {
        if self.phase != Phase::Ended {
            info!(days = self.days, visits = self.total_visits(), "experiment ended");
        }
        self.phase = Phase::Ended;
    }

    /// Count one visitor for `variant`, converting or not.
    pub fn record_visitor(&mut self, variant: usize, converted: bool) -> Result<()> {
        if self.phase != Phase::Active {
            return Err(StatsError::InvalidTransition { phase: self.phase, action: "record a visitor" });
        }
        let count = self.observations.len();
        self.observations
            .get_mut(variant)
            .ok_or(StatsError::UnknownVariant { index: variant, count })?
            .record(converted);
        Ok(())
    }

    /// Bump the runtime counter; only running experiments age.
    pub fn advance_day(&mut self) {
        if self.phase == Phase::Active {
            self.days += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn observations(&self) -> &[VariantObservation] { &self.observations }

    pub fn observation(&self, index: usize) -> Result<&VariantObservation> {
        self.observations
            .get(index)
            .ok_or(StatsError::UnknownVariant { index, count: self.observations.len() })
    }

    pub fn variant_count(&self) -> usize { self.observations.len() }

    pub fn phase(&self) -> Phase { self.phase }

    pub fn is_active(&self) -> bool { self.phase == Phase::Active }

    pub fn days(&self) -> u32 { self.days }

    /// Configured significance threshold.
    pub fn p_value(&self) -> f64 { self.p_value }

    /// Chi-square critical value at `variants - 1` degrees of freedom.
    pub fn cutoff(&self) -> f64 { self.cutoff }

    /// Saturates at `u64::MAX`.
    pub fn total_visits(&self) -> u64 {
        self.observations.iter().fold(0u64, |acc, o| acc.saturating_add(o.visits))
    }

    pub fn total_conversions(&self) -> u64 {
        self.observations.iter().fold(0u64, |acc, o| acc.saturating_add(o.conversions))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
