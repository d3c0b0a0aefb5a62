//! Simulation harness: seeded determinism, lifecycle rules, batch accounting,
//! and the portfolio loop.

use ab_inference::{Decision, EngineConfig, ExperimentSimulator, Phase, Portfolio, StatsError};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn config(seed: u64) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.simulation.seed = Some(seed);
    config
}

// ---------------------------------------------------------------------------
// ExperimentSimulator
// ---------------------------------------------------------------------------

#[test]
fn test_injected_rng_matches_configured_seed() {
    let mut a = ExperimentSimulator::from_config(&config(99)).unwrap();
    let mut b = ExperimentSimulator::with_rng(&EngineConfig::default(), StdRng::seed_from_u64(99)).unwrap();
    a.reset(1.05).unwrap();
    b.reset(1.05).unwrap();
    a.simulate_batch(3_000).unwrap();
    b.simulate_batch(3_000).unwrap();
    assert_eq!(a.state().observations(), b.state().observations());
}

#[test]
fn test_lifecycle_inactive_active_ended() {
    let mut sim = ExperimentSimulator::from_config(&config(1)).unwrap();
    assert_eq!(sim.state().phase(), Phase::Inactive);
    assert!(matches!(sim.simulate_batch(1), Err(StatsError::InvalidTransition { .. })));

    sim.reset(1.0).unwrap();
    assert_eq!(sim.state().phase(), Phase::Active);
    sim.simulate_batch(250).unwrap();

    sim.end_experiment();
    assert_eq!(sim.state().phase(), Phase::Ended);
    assert!(matches!(
        sim.simulate_visitor(),
        Err(StatsError::InvalidTransition { phase: Phase::Ended, .. })
    ));
    assert_eq!(sim.state().total_visits(), 250);
}

#[test]
fn test_batches_accumulate_like_one_run() {
    let mut batched = ExperimentSimulator::from_config(&config(17)).unwrap();
    let mut single = ExperimentSimulator::from_config(&config(17)).unwrap();
    batched.reset(1.1).unwrap();
    single.reset(1.1).unwrap();
    for _ in 0..10 {
        batched.simulate_batch(1_000).unwrap();
    }
    single.simulate_batch(10_000).unwrap();
    assert_eq!(batched.state().observations(), single.state().observations());
}

#[test]
fn test_observed_rate_near_true_rate() {
    let mut sim = ExperimentSimulator::from_config(&config(23)).unwrap();
    sim.reset(1.0).unwrap();
    sim.simulate_batch(200_000).unwrap();
    let rate = sim.state().total_conversions() as f64 / sim.state().total_visits() as f64;
    assert!((rate - 0.05).abs() < 0.003, "rate={}", rate);
}

#[test]
fn test_strong_effect_becomes_significant() {
    let mut sim = ExperimentSimulator::from_config(&config(31)).unwrap();
    sim.reset(1.5).unwrap();
    sim.simulate_batch(100_000).unwrap();
    let analysis = EngineConfig::default().analysis;
    let est = sim.estimator(&analysis).unwrap();
    assert!(est.is_significant(), "g={}", est.g_test());
    let rel = est.relative_effect(1).unwrap();
    assert!((rel.estimate - 0.5).abs() < 0.2, "{:?}", rel);
    assert!(rel.lower() > 0.0, "{:?}", rel);
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

fn portfolio(seed: u64) -> Portfolio {
    let mut config = config(seed);
    config.simulation.experiments = 4;
    config.simulation.visitors_per_day = 2_000;
    config.simulation.batch_size = 500;
    config.simulation.total_days = 5;
    Portfolio::from_config(&config).unwrap()
}

#[test]
fn test_portfolio_runs_to_completion() {
    let mut p = portfolio(2);
    let mut days = 0;
    while let Some(day) = p.run_day().unwrap() {
        days += 1;
        assert_eq!(day.visitors, 2_000);
    }
    assert_eq!(days, 5);
    assert_eq!(p.visitors(), 10_000);
    for e in p.experiments() {
        assert_eq!(e.state().days(), 5);
        assert_eq!(e.state().total_visits(), 10_000);
    }
}

#[test]
fn test_portfolio_decision_then_restart() {
    let mut p = portfolio(3);
    p.run_day().unwrap();
    let record = p.decide(1, Decision::FullOn).unwrap();
    assert_eq!(record.experiment, 1);
    assert!((p.base_rate() - 0.05 * record.true_effect).abs() < 1e-12);

    let day = p.run_day().unwrap().unwrap();
    assert_eq!(day.restarted, 1);
    let restarted = &p.experiments()[1];
    assert!(restarted.is_active());
    assert_eq!(restarted.state().total_visits(), 0);
}
