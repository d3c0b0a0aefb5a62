use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use crate::config::EngineConfig;
use crate::distributions::{
    chi_square_quantile, chi_square_upper_tail, degrees_of_freedom, f_quantile, f_upper_tail, normal_quantile,
    normal_upper_tail, student_t_quantile, student_t_upper_tail,
};
use crate::error::{Result, StatsError};
use crate::estimator::EffectEstimator;
use crate::experiment::ExperimentState;
use crate::portfolio::Portfolio;
use crate::report::{render_portfolio, render_table, ExperimentReport, PortfolioReport};
use crate::simulator::ExperimentSimulator;

#[derive(Parser, Debug)]
#[command(name = "ab-inference")]
#[command(version = "0.3.0")]
#[command(about = "Simulate and analyze A/B experiments: G-test, Wald and Fieller intervals, SRM checks")]
pub struct Args {
    /// TOML configuration file ([analysis] and [simulation] tables)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print JSON instead of a table
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Analyze observed counts (variant 0 is the baseline)
    Analyze {
        /// Visits per variant, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        visits: Vec<u64>,

        /// Conversions per variant, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        conversions: Vec<u64>,

        /// Significance threshold (overrides the config file)
        #[arg(long)]
        p_value: Option<f64>,
    },

    /// Simulate one experiment and report on it
    Simulate {
        /// True multiplier of every treatment arm
        #[arg(long, default_value = "1.0")]
        effect: f64,

        /// Total visitors to simulate
        #[arg(long, default_value = "100000")]
        visitors: u64,

        /// Visitors per batch
        #[arg(long)]
        batch: Option<u64>,

        #[arg(long)]
        seed: Option<u64>,

        /// Baseline conversion rate
        #[arg(long)]
        base_rate: Option<f64>,
    },

    /// Run a portfolio of concurrent experiments without decisions
    Portfolio {
        /// Days to simulate (defaults to total_days)
        #[arg(long)]
        days: Option<u32>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        visitors_per_day: Option<u64>,
    },

    /// Upper critical value for probability p
    Quantile {
        #[arg(value_enum)]
        family: Family,

        p: f64,

        /// Degrees of freedom (numerator for F)
        #[arg(long)]
        df: Option<f64>,

        /// Denominator degrees of freedom for F
        #[arg(long)]
        df2: Option<f64>,
    },

    /// Upper-tail probability at x
    Tail {
        #[arg(value_enum)]
        family: Family,

        #[arg(allow_negative_numbers = true)]
        x: f64,

        #[arg(long)]
        df: Option<f64>,

        #[arg(long)]
        df2: Option<f64>,
    },
}

/// Distribution family for `quantile` and `tail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Family {
    Normal,
    ChiSquare,
    T,
    F,
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Normal    => write!(f, "normal"),
            Family::ChiSquare => write!(f, "chi-square"),
            Family::T         => write!(f, "t"),
            Family::F         => write!(f, "f"),
        }
    }
}

fn required_df(value: Option<f64>, family: Family, flag: &str) -> Result<u32> {
    let value = value.ok_or_else(|| StatsError::Domain(format!("{} needs {}", family, flag)))?;
    degrees_of_freedom(value)
}

/// Critical value of `family` at upper-tail probability `p`.
pub fn evaluate_quantile(family: Family, p: f64, df: Option<f64>, df2: Option<f64>) -> Result<f64> {
    match family {
        Family::Normal => normal_quantile(p),
        Family::ChiSquare => chi_square_quantile(required_df(df, family, "--df")?, p),
        Family::T => student_t_quantile(required_df(df, family, "--df")?, p),
        Family::F => f_quantile(required_df(df, family, "--df")?, required_df(df2, family, "--df2")?, p),
    }
}

/// Upper-tail probability of `family` at `x`.
pub fn evaluate_tail(family: Family, x: f64, df: Option<f64>, df2: Option<f64>) -> Result<f64> {
    match family {
        Family::Normal => Ok(normal_upper_tail(x)),
        Family::ChiSquare => chi_square_upper_tail(required_df(df, family, "--df")?, x),
        Family::T => student_t_upper_tail(required_df(df, family, "--df")?, x),
        Family::F => f_upper_tail(required_df(df, family, "--df")?, required_df(df2, family, "--df2")?, x),
    }
}

/// Defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::load(p),
        None => Ok(EngineConfig::default()),
    }
}

/// Execute the parsed command and return what should be printed.
pub fn run(args: &Args) -> Result<String> {
    let mut config = load_config(args.config.as_deref())?;

    match &args.command {
        Command::Analyze { visits, conversions, p_value } => {
            if let Some(p) = p_value {
                config.analysis.p_value = *p;
            }
            let state = ExperimentState::from_counts(visits, conversions, &config.analysis)?;
            let report = ExperimentReport::build(&EffectEstimator::new(&state, &config.analysis)?)?;
            render(args.json, &report, render_table)
        }

        Command::Simulate { effect, visitors, batch, seed, base_rate } => {
            if let Some(b) = batch {
                config.simulation.batch_size = *b;
            }
            if seed.is_some() {
                config.simulation.seed = *seed;
            }
            if let Some(rate) = base_rate {
                config.simulation.base_conversion_rate = *rate;
            }
            let mut sim = ExperimentSimulator::from_config(&config)?;
            sim.reset(*effect)?;
            let mut remaining = *visitors;
            while remaining > 0 {
                remaining -= sim.simulate_batch(remaining.min(config.simulation.batch_size))?.visitors;
            }
            sim.end_experiment();
            let report = ExperimentReport::build(&sim.estimator(&config.analysis)?)?;
            render(args.json, &report, render_table)
        }

        Command::Portfolio { days, seed, visitors_per_day } => {
            if let Some(d) = days {
                config.simulation.total_days = *d;
            }
            if seed.is_some() {
                config.simulation.seed = *seed;
            }
            if let Some(v) = visitors_per_day {
                config.simulation.visitors_per_day = *v;
            }
            let mut portfolio = Portfolio::from_config(&config)?;
            while portfolio.run_day()?.is_some() {}
            let report = PortfolioReport::build(&portfolio)?;
            render(args.json, &report, render_portfolio)
        }

        Command::Quantile { family, p, df, df2 } => {
            let value = evaluate_quantile(*family, *p, *df, *df2)?;
            scalar(args.json, json!({ "family": family.to_string(), "p": p, "quantile": value }), value)
        }

        Command::Tail { family, x, df, df2 } => {
            let value = evaluate_tail(*family, *x, *df, *df2)?;
            scalar(args.json, json!({ "family": family.to_string(), "x": x, "upper_tail": value }), value)
        }
    }
}

fn render<T: serde::Serialize>(as_json: bool, report: &T, table: fn(&T) -> String) -> Result<String> {
    if as_json {
        Ok(serde_json::to_string_pretty(report)?)
    } else {
        Ok(table(report))
    }
}

fn scalar(as_json: bool, body: serde_json::Value, value: f64) -> Result<String> {
    if as_json {
        Ok(serde_json::to_string_pretty(&body)?)
    } else {
        Ok(value.to_string())
    }
}
