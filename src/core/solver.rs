use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::engine::simulate;
use super::error::{Result, ScenarioError};
use super::stats::percentile;
use super::types::{MAX_ITERATIONS, ScenarioInput};

/// Spending multipliers probed by [`estimate_withdrawal_range`].
pub const WITHDRAWAL_MULTIPLIERS: [f64; 7] = [0.7, 0.8, 0.9, 1.0, 1.1, 1.2, 1.3];
const RANGE_LOW_SUCCESS: f64 = 0.9;
const RANGE_HIGH_SUCCESS: f64 = 0.7;
const MIN_RANGE_ITERATIONS: u32 = 200;
/// Floor for the default upper search bound.
pub const MIN_SEARCH_MAX: f64 = 1_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRange {
    pub low: f64,
    pub high: f64,
    pub iterations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingSolveConfig {
    pub target_success_rate: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub simulations_per_iteration: u32,
    pub final_simulations: u32,
}

impl SpendingSolveConfig {
    /// Searches up to twice the scenario's spending, or a tenth of its assets if larger,
    /// never below [`MIN_SEARCH_MAX`].
    pub fn for_scenario(input: &ScenarioInput) -> Self {
        let search_max = (input.annual_spending * 2.0)
            .max(input.initial_assets * 0.1)
            .max(MIN_SEARCH_MAX);
        Self {
            target_success_rate: 0.9,
            search_min: 0.0,
            search_max,
            tolerance: (search_max * 1e-3).max(1.0),
            max_iterations: 32,
            simulations_per_iteration: input.iterations.min(500),
            final_simulations: input.iterations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_spending: f64,
    pub success_rate: f64,
    pub success_ci_half_width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingSolveResult {
    pub config: SpendingSolveConfig,
    pub solved_spending: Option<f64>,
    pub achieved_success_rate: Option<f64>,
    pub achieved_success_ci_half_width: Option<f64>,
    pub iterations: Vec<SpendingSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationStrategy {
    pub label: String,
    pub stock_allocation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOutcome {
    pub label: String,
    pub stock_allocation: f64,
    pub bond_allocation: f64,
    pub success_rate: f64,
    pub median_ending_assets: f64,
}

#[derive(Debug, Clone, Copy)]
struct Evaluation {
    success_rate: f64,
    success_ci_half_width: f64,
}

/// Brackets the sustainable annual spend by probing fixed multipliers of the
/// scenario's spending.
///
/// `low` is the smallest multiplier reaching 90% success (0.7 if none do),
/// `high` the largest reaching 70% (1.0 if none do).
pub fn estimate_withdrawal_range(input: &ScenarioInput) -> Result<WithdrawalRange> {
    input.validate()?;

    let iterations = (input.iterations / 2).max(MIN_RANGE_ITERATIONS);
    let outcomes: Vec<(f64, f64)> = WITHDRAWAL_MULTIPLIERS
        .par_iter()
        .map(|&multiplier| {
            let scenario = ScenarioInput {
                annual_spending: input.annual_spending * multiplier,
                iterations,
                ..input.clone()
            };
            (multiplier, simulate(&scenario).success_rate)
        })
        .collect();

    let low = outcomes
        .iter()
        .find(|(_, rate)| *rate >= RANGE_LOW_SUCCESS)
        .map(|(multiplier, _)| *multiplier)
        .unwrap_or(WITHDRAWAL_MULTIPLIERS[0]);
    let high = outcomes
        .iter()
        .rev()
        .find(|(_, rate)| *rate >= RANGE_HIGH_SUCCESS)
        .map(|(multiplier, _)| *multiplier)
        .unwrap_or(1.0);

    Ok(WithdrawalRange {
        low: input.annual_spending * low,
        high: input.annual_spending * high,
        iterations,
    })
}

/// Bisects for the largest annual spend whose success rate meets the target.
pub fn solve_max_spending(
    input: &ScenarioInput,
    config: SpendingSolveConfig,
) -> Result<SpendingSolveResult> {
    input.validate()?;
    validate_config(config)?;

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let low_eval = evaluate_spending(input, config.search_min, config.simulations_per_iteration);
    let high_eval = evaluate_spending(input, config.search_max, config.simulations_per_iteration);

    let mut solved_spending = None;
    let mut converged = false;
    let feasible;
    let message;

    if low_eval.success_rate + 1e-12 < config.target_success_rate {
        feasible = false;
        message = "No feasible spending found within the search bounds.".to_string();
    } else if high_eval.success_rate + 1e-12 >= config.target_success_rate {
        solved_spending = Some(config.search_max);
        converged = true;
        feasible = true;
        message = "Upper spending bound is still feasible; increase search max for a higher target."
            .to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = evaluate_spending(input, mid, config.simulations_per_iteration);
            iterations.push(SpendingSolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_spending: mid,
                success_rate: eval.success_rate,
                success_ci_half_width: eval.success_ci_half_width,
            });

            if eval.success_rate + 1e-12 >= config.target_success_rate {
                lo = mid;
            } else {
                hi = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                break;
            }
        }
        solved_spending = Some(lo);
        feasible = true;
        message = if converged {
            "Solved maximum sustainable spending.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let final_eval =
        solved_spending.map(|spending| evaluate_spending(input, spending, config.final_simulations));
    debug!(
        feasible,
        converged,
        steps = iterations.len(),
        solved_spending = ?solved_spending,
        "spending solve finished"
    );

    Ok(SpendingSolveResult {
        config,
        solved_spending,
        achieved_success_rate: final_eval.map(|e| e.success_rate),
        achieved_success_ci_half_width: final_eval.map(|e| e.success_ci_half_width),
        iterations,
        converged,
        feasible,
        message,
    })
}

fn validate_config(config: SpendingSolveConfig) -> Result<()> {
    let invalid = |msg: &str| Err(ScenarioError::InvalidSearch(msg.to_string()));

    if !(0.0..=1.0).contains(&config.target_success_rate) {
        return invalid("targetSuccessRate must be between 0 and 1");
    }
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return invalid("search bounds must be finite numbers");
    }
    if config.search_min < 0.0 {
        return invalid("searchMin must be >= 0");
    }
    if config.search_max <= config.search_min {
        return invalid("searchMax must be > searchMin");
    }
    if !(config.tolerance > 0.0) {
        return invalid("tolerance must be > 0");
    }
    if config.max_iterations == 0 {
        return invalid("maxIterations must be > 0");
    }
    if config.simulations_per_iteration == 0 || config.final_simulations == 0 {
        return invalid("simulation counts must be > 0");
    }
    if config.simulations_per_iteration.max(config.final_simulations) > MAX_ITERATIONS {
        return invalid(&format!("simulation counts must be <= {MAX_ITERATIONS}"));
    }
    Ok(())
}

fn evaluate_spending(input: &ScenarioInput, annual_spending: f64, simulations: u32) -> Evaluation {
    let scenario = ScenarioInput {
        annual_spending,
        iterations: simulations,
        ..input.clone()
    };
    let success_rate = simulate(&scenario).success_rate;
    let n = f64::from(simulations);
    Evaluation {
        success_rate,
        success_ci_half_width: 1.96 * (success_rate * (1.0 - success_rate) / n).sqrt(),
    }
}

/// 60/40, 80/20 and the scenario's own split.
pub fn default_allocation_strategies(input: &ScenarioInput) -> Vec<AllocationStrategy> {
    [("60/40", 0.6), ("80/20", 0.8), ("current", input.stock_allocation)]
        .into_iter()
        .map(|(label, stock_allocation)| AllocationStrategy {
            label: label.to_string(),
            stock_allocation,
        })
        .collect()
}

/// Runs the scenario once per stock allocation, bonds taking the remainder.
pub fn compare_allocations(
    input: &ScenarioInput,
    strategies: &[AllocationStrategy],
) -> Result<Vec<StrategyOutcome>> {
    input.validate()?;

    let scenarios = strategies
        .iter()
        .map(|strategy| {
            let scenario = ScenarioInput {
                stock_allocation: strategy.stock_allocation,
                bond_allocation: 1.0 - strategy.stock_allocation,
                ..input.clone()
            };
            scenario.validate().map_err(|err| match err {
                ScenarioError::InvalidScenario(msg) => {
                    ScenarioError::InvalidScenario(format!("strategy {}: {msg}", strategy.label))
                }
                other => other,
            })?;
            Ok(scenario)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(strategies
        .par_iter()
        .zip(&scenarios)
        .map(|(strategy, scenario)| {
            let mut result = simulate(scenario);
            StrategyOutcome {
                label: strategy.label.clone(),
                stock_allocation: scenario.stock_allocation,
                bond_allocation: scenario.bond_allocation,
                success_rate: result.success_rate,
                median_ending_assets: percentile(&mut result.ending_assets, 50.0),
            }
        })
        .collect())
}
