//! # Stage: Experiment Simulator
//!
//! ## Responsibility
//! Stochastic harness for one experiment: assigns synthetic visitors to
//! variants, draws Bernoulli conversions from each variant's true rate and
//! feeds the outcomes into an [`ExperimentState`].
//!
//! ## Guarantees
//! - Deterministic under a seeded RNG: the generator is injected, never global
//! - Batched: [`ExperimentSimulator::simulate_batch`] returns after `n`
//!   visitors so a host loop can yield between batches
//! - Simulating on an experiment that is not `Active` is rejected up front,
//!   before any visitor is drawn
//!
//! ## NOT Responsible For
//! - Statistics (see [`crate::estimator`])
//! - Running several experiments on a shared visitor stream (see [`crate::portfolio`])

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{AnalysisConfig, EngineConfig};
use crate::error::{Result, StatsError};
use crate::estimator::EffectEstimator;
use crate::experiment::{ExperimentState, Phase};

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Assignment {
    Uniform(usize),
    Weighted(WeightedIndex<f64>),
}

impl Assignment {
    fn new(variants: usize, allocation: Option<&[f64]>) -> Result<Self> {
        match allocation {
            None => Ok(Assignment::Uniform(variants)),
            Some(weights) if weights.len() != variants => Err(StatsError::Config(format!(
                "allocation has {} weights but the experiment has {} variants",
                weights.len(),
                variants
            ))),
            Some(weights) => WeightedIndex::new(weights)
                .map(Assignment::Weighted)
                .map_err(|e| StatsError::Config(format!("allocation: {}", e))),
        }
    }

    fn draw<R: Rng>(&self, rng: &mut R) -> usize {
        match self {
            Assignment::Uniform(k) => rng.gen_range(0..*k),
            Assignment::Weighted(dist) => dist.sample(rng),
        }
    }
}

// ---------------------------------------------------------------------------
// SimulatedExperiment
// ---------------------------------------------------------------------------

/// An [`ExperimentState`] paired with the true effect multiplier of each
/// variant. Index 0 is the baseline and always has multiplier 1.
#[derive(Debug, Clone)]
pub struct SimulatedExperiment {
    state: ExperimentState,
    effects: Vec<f64>,
    assignment: Assignment,
}

impl SimulatedExperiment {
    /// A fresh `Inactive` experiment with every multiplier at 1.
    pub fn new(variants: usize, config: &AnalysisConfig) -> Result<Self> {
        let state = ExperimentState::new(variants, config)?;
        let assignment = Assignment::new(variants, config.allocation.as_deref())?;
        Ok(Self { state, effects: vec![1.0; variants], assignment })
    }

    /// Start (or restart) with `effect` as every treatment arm's multiplier.
    pub fn reset(&mut self, effect: f64) -> Result<()> {
        let mut effects = vec![effect; self.effects.len()];
        effects[0] = 1.0;
        self.reset_with_effects(&effects)
    }

    /// Start (or restart) with an explicit multiplier per variant.
    pub fn reset_with_effects(&mut self, effects: &[f64]) -> Result<()> {
        if effects.len() != self.effects.len() {
            return Err(StatsError::Config(format!(
                "{} effect multipliers for {} variants",
                effects.len(),
                self.effects.len()
            )));
        }
        if let Some(bad) = effects.iter().find(|e| !e.is_finite() || **e < 0.0) {
            return Err(StatsError::Domain(format!("effect multiplier must be finite and >= 0, got {}", bad)));
        }
        self.state.reset()?;
        self.effects.copy_from_slice(effects);
        Ok(())
    }

    pub fn end_experiment(&mut self) { self.state.end(); }

    /// Variant for the next visitor; the baseline when not running.
    pub fn assign_variant<R: Rng>(&self, rng: &mut R) -> usize {
        if self.state.is_active() { self.assignment.draw(rng) } else { 0 }
    }

    pub fn record(&mut self, variant: usize, converted: bool) -> Result<()> {
        self.state.record_visitor(variant, converted)
    }

    pub fn advance_day(&mut self) { self.state.advance_day(); }

    pub fn state(&self) -> &ExperimentState { &self.state }

    pub fn effects(&self) -> &[f64] { &self.effects }

    pub fn effect(&self, variant: usize) -> Result<f64> {
        self.effects
            .get(variant)
            .copied()
            .ok_or(StatsError::UnknownVariant { index: variant, count: self.effects.len() })
    }

    pub fn is_active(&self) -> bool { self.state.is_active() }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one simulated visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VisitorOutcome {
    pub variant: usize,
    pub converted: bool,
}

/// Totals for one call to `simulate_batch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub visitors: u64,
    pub conversions: u64,
}

impl BatchSummary {
    pub(crate) fn add(&mut self, converted: bool) {
        self.visitors += 1;
        if converted {
            self.conversions += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// ExperimentSimulator
// ---------------------------------------------------------------------------

/// One simulated experiment driven by an injectable RNG.
#[derive(Debug)]
pub struct ExperimentSimulator<R: Rng = StdRng> {
    experiment: SimulatedExperiment,
    base_rate: f64,
    rng: R,
}

impl ExperimentSimulator<StdRng> {
    /// Seeded from `simulation.seed`, or from system entropy when unset.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let rng = match config.simulation.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, rng)
    }
}

impl<R: Rng> ExperimentSimulator<R> {
    pub fn with_rng(config: &EngineConfig, rng: R) -> Result<Self> {
        config.validate()?;
        let experiment = SimulatedExperiment::new(config.simulation.variants, &config.analysis)?;
        Ok(Self { experiment, base_rate: config.simulation.base_conversion_rate, rng })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Zero the counts, set the treatment multiplier and enter `Active`.
    pub fn reset(&mut self, effect: f64) -> Result<()> {
        self.experiment.reset(effect)?;
        info!(effect, base_rate = self.base_rate, "simulation started");
        Ok(())
    }

    pub fn reset_with_effects(&mut self, effects: &[f64]) -> Result<()> {
        self.experiment.reset_with_effects(effects)?;
        info!(?effects, base_rate = self.base_rate, "simulation started");
        Ok(())
    }

    pub fn end_experiment(&mut self) { self.experiment.end_experiment(); }

    // -----------------------------------------------------------------------
    // Simulation
    // -----------------------------------------------------------------------

    pub fn assign_variant(&mut self) -> usize {
        self.experiment.assign_variant(&mut self.rng)
    }

    /// True conversion probability of `variant`: base rate times its multiplier.
    pub fn true_rate(&self, variant: usize) -> Result<f64> {
        Ok(self.base_rate * self.experiment.effect(variant)?)
    }

    fn ensure_active(&self, action: &'static str) -> Result<()> {
        match self.experiment.state().phase() {
            Phase::Active => Ok(()),
            phase => Err(StatsError::InvalidTransition { phase, action }),
        }
    }

    /// Assign one visitor, draw its outcome and record it.
    pub fn simulate_visitor(&mut self) -> Result<VisitorOutcome> {
        self.ensure_active("simulate a visitor")?;
        let variant = self.assign_variant();
        let converted = self.rng.gen::<f64>() < self.true_rate(variant)?;
        self.experiment.record(variant, converted)?;
        Ok(VisitorOutcome { variant, converted })
    }

    /// Simulate `visitors` visitors and return.
    pub fn simulate_batch(&mut self, visitors: u64) -> Result<BatchSummary> {
        self.ensure_active("simulate a batch")?;
        let mut summary = BatchSummary::default();
        for _ in 0..visitors {
            summary.add(self.simulate_visitor()?.converted);
        }
        debug!(
            visitors = summary.visitors,
            conversions = summary.conversions,
            total_visits = self.experiment.state().total_visits(),
            "batch simulated"
        );
        Ok(summary)
    }

    pub fn advance_day(&mut self) { self.experiment.advance_day(); }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> &ExperimentState { self.experiment.state() }

    pub fn experiment(&self) -> &SimulatedExperiment { &self.experiment }

    pub fn base_rate(&self) -> f64 { self.base_rate }

    /// Estimator over the current counts.
    pub fn estimator<'a>(&'a self, config: &'a AnalysisConfig) -> Result<EffectEstimator<'a>> {
        EffectEstimator::new(self.experiment.state(), config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> ExperimentSimulator {
        let mut config = EngineConfig::default();
        config.simulation.seed = Some(seed);
        ExperimentSimulator::from_config(&config).unwrap()
    }

    // ===== Lifecycle =====

    #[test]
    fn test_new_simulator_is_inactive() {
        let sim = seeded(1);
        assert_eq!(sim.state().phase(), Phase::Inactive);
        assert_eq!(sim.experiment().effects(), &[1.0, 1.0]);
    }

    #[test]
    fn test_simulate_rejected_when_inactive() {
        let mut sim = seeded(1);
        assert!(matches!(
            sim.simulate_visitor(),
            Err(StatsError::InvalidTransition { phase: Phase::Inactive, .. })
        ));
    }

    #[test]
    fn test_reset_sets_treatment_multiplier() {
        let mut sim = seeded(1);
        sim.reset(1.2).unwrap();
        assert!(sim.state().is_active());
        assert_eq!(sim.experiment().effects(), &[1.0, 1.2]);
        assert!((sim.true_rate(1).unwrap() - 0.06).abs() < 1e-12);
    }

    #[test]
    fn test_reset_rejects_negative_effect() {
        let mut sim = seeded(1);
        assert!(matches!(sim.reset(-0.5), Err(StatsError::Domain(_))));
        assert!(matches!(sim.reset(f64::NAN), Err(StatsError::Domain(_))));
        assert!(!sim.state().is_active());
    }

    #[test]
    fn test_reset_with_effects_length_checked() {
        let mut sim = seeded(1);
        assert!(sim.reset_with_effects(&[1.0, 1.1, 1.2]).is_err());
        sim.reset_with_effects(&[1.0, 0.9]).unwrap();
        assert_eq!(sim.experiment().effects(), &[1.0, 0.9]);
    }

    #[test]
    fn test_ended_rejects_simulation_and_keeps_counts() {
        let mut sim = seeded(1);
        sim.reset(1.0).unwrap();
        sim.simulate_batch(100).unwrap();
        sim.end_experiment();
        assert!(sim.simulate_batch(10).is_err());
        assert!(sim.reset(1.0).is_err());
        assert_eq!(sim.state().total_visits(), 100);
    }

    // ===== Assignment =====

    #[test]
    fn test_assign_variant_inactive_is_baseline() {
        let mut sim = seeded(3);
        assert!((0..50).all(|_| sim.assign_variant() == 0));
    }

    #[test]
    fn test_uniform_assignment_covers_variants() {
        let mut sim = seeded(3);
        sim.reset(1.0).unwrap();
        let ones = (0..1_000).filter(|_| sim.assign_variant() == 1).count();
        assert!(ones > 400 && ones < 600, "ones={}", ones);
    }

    #[test]
    fn test_weighted_assignment_follows_allocation() {
        let mut config = EngineConfig::default();
        config.analysis.allocation = Some(vec![1.0, 3.0]);
        let mut sim = ExperimentSimulator::with_rng(&config, StdRng::seed_from_u64(11)).unwrap();
        sim.reset(1.0).unwrap();
        let ones = (0..4_000).filter(|_| sim.assign_variant() == 1).count();
        assert!(ones > 2_800 && ones < 3_200, "ones={}", ones);
    }

    // ===== Batches =====

    #[test]
    fn test_batch_counts_match_state() {
        let mut sim = seeded(5);
        sim.reset(1.0).unwrap();
        let a = sim.simulate_batch(1_000).unwrap();
        let b = sim.simulate_batch(500).unwrap();
        assert_eq!(a.visitors + b.visitors, 1_500);
        assert_eq!(sim.state().total_visits(), 1_500);
        assert_eq!(sim.state().total_conversions(), a.conversions + b.conversions);
    }

    #[test]
    fn test_zero_effect_never_converts() {
        let mut sim = seeded(5);
        sim.reset(0.0).unwrap();
        sim.simulate_batch(2_000).unwrap();
        assert_eq!(sim.state().observation(1).unwrap().conversions(), 0);
    }

    #[test]
    fn test_same_seed_same_counts() {
        let mut a = seeded(42);
        let mut b = seeded(42);
        a.reset(1.1).unwrap();
        b.reset(1.1).unwrap();
        a.simulate_batch(5_000).unwrap();
        b.simulate_batch(5_000).unwrap();
        assert_eq!(a.state().observations(), b.state().observations());
    }

    #[test]
    fn test_estimator_over_simulated_counts() {
        let mut sim = seeded(9);
        sim.reset(1.0).unwrap();
        sim.simulate_batch(2_000).unwrap();
        let cfg = AnalysisConfig::default();
        let m = sim.estimator(&cfg).unwrap().conversion_mean(0).unwrap();
        assert!(m.is_finite());
    }
}
