//! # Stage: Portfolio Simulation
//!
//! ## Responsibility
//! Runs several experiments at once on a single visitor stream. Every
//! visitor is assigned a variant in every experiment; the visitor converts
//! with probability `base_rate × Π effect[assigned]`, and the outcome is
//! recorded in each experiment that is still running. Days advance in
//! batches, decisions ship or discard an experiment, and idle slots are
//! refilled with fresh experiments up to the development capacity.
//!
//! ## Guarantees
//! - Deterministic under a seeded RNG
//! - Ended experiments keep their frozen counts until their slot is refilled
//! - Shipping ("full on") compounds the experiment's true multiplier into the
//!   base rate seen by every later visitor
//!
//! ## NOT Responsible For
//! - Scoring decisions or narrating outcomes (presentation concern)

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{AnalysisConfig, EngineConfig, SimulationConfig};
use crate::error::{Result, StatsError};
use crate::estimator::EffectEstimator;
use crate::simulator::{BatchSummary, SimulatedExperiment};

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// What to do with a running experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Ship variant 1 to all traffic.
    FullOn,
    /// Discard the change.
    Stop,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::FullOn => write!(f, "full on"),
            Decision::Stop   => write!(f, "stop"),
        }
    }
}

/// What was decided and what was really true at that moment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub experiment: usize,
    pub decision: Decision,
    /// True multiplier of variant 1.
    pub true_effect: f64,
    pub days: u32,
    pub significant: bool,
    /// Observed relative lift of variant 1 (NaN without data).
    pub observed_lift: f64,
    pub base_rate_after: f64,
}

/// Totals for one simulated day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub day: u32,
    pub visitors: u64,
    pub conversions: u64,
    /// Ended experiments replaced by fresh ones at the end of the day.
    pub restarted: usize,
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Portfolio<R: Rng = StdRng> {
    experiments: Vec<SimulatedExperiment>,
    assignments: Vec<usize>,
    base_rate: f64,
    visitors: u64,
    conversions: u64,
    day: u32,
    settings: SimulationConfig,
    analysis: AnalysisConfig,
    effect_distribution: Normal<f64>,
    rng: R,
}

impl Portfolio<StdRng> {
    /// Seeded from `simulation.seed`, or from system entropy when unset.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let rng = match config.simulation.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, rng)
    }
}

impl<R: Rng> Portfolio<R> {
    /// Build the portfolio and start every experiment with a drawn effect.
    pub fn with_rng(config: &EngineConfig, rng: R) -> Result<Self> {
        config.validate()?;
        let settings = config.simulation.clone();
        let effect_distribution = Normal::new(settings.average_effect_pct, settings.average_effect_stddev_pct)
            .map_err(|e| StatsError::Config(format!("effect distribution: {}", e)))?;

        let mut portfolio = Self {
            experiments: Vec::with_capacity(settings.experiments),
            assignments: vec![0; settings.experiments],
            base_rate: settings.base_conversion_rate,
            visitors: 0,
            conversions: 0,
            day: 0,
            analysis: config.analysis.clone(),
            effect_distribution,
            settings,
            rng,
        };
        for _ in 0..portfolio.settings.experiments {
            let experiment = portfolio.fresh_experiment()?;
            portfolio.experiments.push(experiment);
        }
        info!(
            experiments = portfolio.experiments.len(),
            base_rate = portfolio.base_rate,
            "portfolio started"
        );
        Ok(portfolio)
    }

    /// `1 + N(mean, sd) / 100`, floored at 0.
    fn draw_effect(&mut self) -> f64 {
        (1.0 + self.effect_distribution.sample(&mut self.rng) / 100.0).max(0.0)
    }

    fn fresh_experiment(&mut self) -> Result<SimulatedExperiment> {
        let mut experiment = SimulatedExperiment::new(self.settings.variants, &self.analysis)?;
        experiment.reset(self.draw_effect())?;
        Ok(experiment)
    }

    // -----------------------------------------------------------------------
    // Simulation
    // -----------------------------------------------------------------------

    /// One visitor through every experiment; returns whether it converted.
    pub fn simulate_visitor(&mut self) -> Result<bool> {
        let mut rate = self.base_rate;
        for (slot, experiment) in self.assignments.iter_mut().zip(&self.experiments) {
            *slot = experiment.assign_variant(&mut self.rng);
            rate *= experiment.effects()[*slot];
        }
        let converted = self.rng.gen::<f64>() < rate;

        for (&variant, experiment) in self.assignments.iter().zip(self.experiments.iter_mut()) {
            if experiment.is_active() {
                experiment.record(variant, converted)?;
            }
        }
        self.visitors += 1;
        if converted {
            self.conversions += 1;
        }
        Ok(converted)
    }

    pub fn simulate_batch(&mut self, visitors: u64) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        for _ in 0..visitors {
            summary.add(self.simulate_visitor()?);
        }
        debug!(visitors = summary.visitors, conversions = summary.conversions, day = self.day, "portfolio batch");
        Ok(summary)
    }

    /// Simulate one day of traffic, age the running experiments and refill
    /// idle slots. `None` once `total_days` have elapsed.
    pub fn run_day(&mut self) -> Result<Option<DaySummary>> {
        if self.is_finished() {
            return Ok(None);
        }
        let mut remaining = self.settings.visitors_per_day;
        let (mut visitors, mut conversions) = (0, 0);
        while remaining > 0 {
            let batch = self.simulate_batch(remaining.min(self.settings.batch_size))?;
            visitors += batch.visitors;
            conversions += batch.conversions;
            remaining -= batch.visitors;
        }
        self.day += 1;
        self.experiments.iter_mut().for_each(SimulatedExperiment::advance_day);
        let restarted = self.restart_idle()?;

        info!(day = self.day, visitors, conversions, restarted, base_rate = self.base_rate, "day complete");
        Ok(Some(DaySummary { day: self.day, visitors, conversions, restarted }))
    }

    /// Replace up to `dev_capacity` non-running experiments with fresh ones.
    pub fn restart_idle(&mut self) -> Result<usize> {
        let idle: Vec<usize> = (0..self.experiments.len())
            .filter(|&i| !self.experiments[i].is_active())
            .take(self.settings.dev_capacity)
            .collect();
        for &i in &idle {
            let fresh = self.fresh_experiment()?;
            self.experiments[i] = fresh;
        }
        Ok(idle.len())
    }

    /// Ship or discard a running experiment. Both end it.
    pub fn decide(&mut self, index: usize, decision: Decision) -> Result<DecisionRecord> {
        let count = self.experiments.len();
        let experiment = self
            .experiments
            .get_mut(index)
            .ok_or(StatsError::UnknownExperiment { index, count })?;
        if !experiment.is_active() {
            return Err(StatsError::InvalidTransition {
                phase: experiment.state().phase(),
                action: "decide",
            });
        }

        let estimator = EffectEstimator::new(experiment.state(), &self.analysis)?;
        let significant = estimator.is_significant();
        let observed_lift = estimator.relative_effect(1)?.estimate;
        let true_effect = experiment.effect(1)?;
        let days = experiment.state().days();

        if decision == Decision::FullOn {
            self.base_rate *= true_effect;
        }
        experiment.end_experiment();
        info!(experiment = index, %decision, true_effect, significant, "decision");

        Ok(DecisionRecord {
            experiment: index,
            decision,
            true_effect,
            days,
            significant,
            observed_lift,
            base_rate_after: self.base_rate,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn experiments(&self) -> &[SimulatedExperiment] { &self.experiments }

    pub fn experiment(&self, index: usize) -> Result<&SimulatedExperiment> {
        self.experiments
            .get(index)
            .ok_or(StatsError::UnknownExperiment { index, count: self.experiments.len() })
    }

    pub fn analysis(&self) -> &AnalysisConfig { &self.analysis }

    pub fn base_rate(&self) -> f64 { self.base_rate }

    pub fn day(&self) -> u32 { self.day }

    pub fn visitors(&self) -> u64 { self.visitors }

    pub fn conversions(&self) -> u64 { self.conversions }

    pub fn is_finished(&self) -> bool { self.day >= self.settings.total_days }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Phase;

    fn small(seed: u64) -> Portfolio {
        let mut config = EngineConfig::default();
        config.simulation.seed = Some(seed);
        config.simulation.experiments = 3;
        config.simulation.visitors_per_day = 1_000;
        config.simulation.batch_size = 300;
        config.simulation.total_days = 3;
        Portfolio::from_config(&config).unwrap()
    }

    // ===== Construction =====

    #[test]
    fn test_all_experiments_start_active() {
        let p = small(1);
        assert_eq!(p.experiments().len(), 3);
        for e in p.experiments() {
            assert!(e.is_active());
            assert_eq!(e.effects()[0], 1.0);
            assert!((e.effects()[1] - 1.0).abs() < 0.05, "effect={}", e.effects()[1]);
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.simulation.average_effect_stddev_pct = -1.0;
        assert!(Portfolio::from_config(&config).is_err());
    }

    // ===== Days =====

    #[test]
    fn test_run_day_simulates_full_day_in_batches() {
        let mut p = small(2);
        let day = p.run_day().unwrap().unwrap();
        assert_eq!(day.day, 1);
        assert_eq!(day.visitors, 1_000);
        assert_eq!(day.restarted, 0);
        assert_eq!(p.visitors(), 1_000);
        for e in p.experiments() {
            assert_eq!(e.state().total_visits(), 1_000);
            assert_eq!(e.state().days(), 1);
        }
    }

    #[test]
    fn test_run_day_stops_after_total_days() {
        let mut p = small(3);
        for _ in 0..3 {
            assert!(p.run_day().unwrap().is_some());
        }
        assert!(p.is_finished());
        assert!(p.run_day().unwrap().is_none());
        assert_eq!(p.day(), 3);
    }

    #[test]
    fn test_same_seed_same_portfolio() {
        let mut a = small(7);
        let mut b = small(7);
        a.run_day().unwrap();
        b.run_day().unwrap();
        assert_eq!(a.conversions(), b.conversions());
        assert_eq!(a.experiments()[2].state().observations(), b.experiments()[2].state().observations());
    }

    // ===== Decisions =====

    #[test]
    fn test_full_on_compounds_base_rate() {
        let mut p = small(4);
        p.run_day().unwrap();
        let effect = p.experiments()[0].effects()[1];
        let record = p.decide(0, Decision::FullOn).unwrap();
        assert!((p.base_rate() - 0.05 * effect).abs() < 1e-12);
        assert_eq!(record.base_rate_after, p.base_rate());
        assert_eq!(record.days, 1);
        assert_eq!(p.experiments()[0].state().phase(), Phase::Ended);
    }

    #[test]
    fn test_stop_leaves_base_rate() {
        let mut p = small(4);
        let record = p.decide(1, Decision::Stop).unwrap();
        assert_eq!(p.base_rate(), 0.05);
        assert!(!p.experiments()[1].is_active());
        // nothing recorded yet
        assert!(record.observed_lift.is_nan());
        assert!(!record.significant);
    }

    #[test]
    fn test_decide_twice_rejected() {
        let mut p = small(5);
        p.decide(0, Decision::Stop).unwrap();
        assert!(matches!(
            p.decide(0, Decision::FullOn),
            Err(StatsError::InvalidTransition { phase: Phase::Ended, .. })
        ));
        assert!(p.decide(9, Decision::Stop).is_err());
    }

    #[test]
    fn test_unknown_experiment_index() {
        let mut p = small(9);
        let err = p.decide(7, Decision::Stop).unwrap_err();
        assert!(matches!(err, StatsError::UnknownExperiment { index: 7, count: 3 }));
        assert_eq!(err.to_string(), "experiment index 7 out of range (3 experiments)");
        assert!(matches!(p.experiment(3), Err(StatsError::UnknownExperiment { index: 3, count: 3 })));
    }

    #[test]
    fn test_ended_experiment_counts_frozen() {
        let mut p = small(6);
        p.run_day().unwrap();
        p.decide(2, Decision::Stop).unwrap();
        let frozen = p.experiments()[2].state().total_visits();
        p.simulate_batch(200).unwrap();
        assert_eq!(p.experiments()[2].state().total_visits(), frozen);
        assert_eq!(p.experiments()[0].state().total_visits(), frozen + 200);
    }

    #[test]
    fn test_restart_respects_dev_capacity() {
        let mut p = small(8);
        for i in 0..3 {
            p.decide(i, Decision::Stop).unwrap();
        }
        let day = p.run_day().unwrap().unwrap();
        assert_eq!(day.restarted, 2);
        assert_eq!(p.experiments().iter().filter(|e| e.is_active()).count(), 2);
        let day = p.run_day().unwrap().unwrap();
        assert_eq!(day.restarted, 1);
        assert!(p.experiments().iter().all(|e| e.is_active()));
        // restarted experiments begin from zero
        assert_eq!(p.experiments()[0].state().days(), 1);
    }
}
