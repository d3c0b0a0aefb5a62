//! Statistical inference engine for simulated A/B experiments.
//!
//! Data flows leaf-first: [`simulator`] accumulates visitor counts into an
//! [`experiment::ExperimentState`], [`estimator`] turns those counts into
//! estimates and a G-test verdict using [`distributions`] and
//! [`contingency`], and [`report`] packages the numbers for display.

pub mod cli;
pub mod config;
pub mod contingency;
pub mod distributions;
pub mod error;
pub mod estimator;
pub mod experiment;
pub mod portfolio;
pub mod report;
pub mod simulator;

pub use config::{AnalysisConfig, EngineConfig, SimulationConfig};
pub use contingency::{g_test, ContingencyTable};
pub use error::{Result, StatsError};
pub use estimator::{fieller_relative_interval, EffectEstimate, EffectEstimator, SampleRatioCheck};
pub use experiment::{ExperimentState, Phase, VariantObservation};
pub use portfolio::{DaySummary, Decision, DecisionRecord, Portfolio};
pub use report::{ExperimentReport, PortfolioReport};
pub use simulator::{BatchSummary, ExperimentSimulator, SimulatedExperiment, VisitorOutcome};
