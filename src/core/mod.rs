mod engine;
mod error;
mod sensitivity;
mod solver;
mod stats;
mod types;

pub use engine::run_monte_carlo;
pub use error::{Result, ScenarioError};
pub use sensitivity::{DEFAULT_SENSITIVITY_DELTAS, run_sensitivity, run_sensitivity_by_name};
pub use solver::{
    AllocationStrategy, MIN_SEARCH_MAX, SpendingSolveConfig, SpendingSolveIteration, SpendingSolveResult,
    StrategyOutcome, WITHDRAWAL_MULTIPLIERS, WithdrawalRange, compare_allocations,
    default_allocation_strategies, estimate_withdrawal_range, solve_max_spending,
};
pub use stats::{
    FanChartPoint, MissingYears, PercentileBands, ResultSummary, fan_chart, percentile, summarize,
};
pub use types::{
    BankruptcyPoint, MAX_ITERATIONS, MAX_TERMINAL_AGE, MonteCarloResult, ScenarioInput,
    ScenarioKey, SensitivityParameter, SensitivityPoint, SimulationYearPoint, SpendingRule,
};
