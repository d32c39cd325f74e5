use axum::{
    Router,
    extract::Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::core::{
    DEFAULT_SENSITIVITY_DELTAS, FanChartPoint, MissingYears, MonteCarloResult, ResultSummary,
    ScenarioError, ScenarioInput, SensitivityParameter, SensitivityPoint, SpendingRule,
    SpendingSolveConfig, SpendingSolveResult, StrategyOutcome, WithdrawalRange,
    compare_allocations, default_allocation_strategies, estimate_withdrawal_range, fan_chart,
    run_monte_carlo, run_sensitivity, solve_max_spending, summarize,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliSpendingRule {
    InflationLinked,
    Flat,
}

impl From<CliSpendingRule> for SpendingRule {
    fn from(value: CliSpendingRule) -> Self {
        match value {
            CliSpendingRule::InflationLinked => SpendingRule::InflationLinked,
            CliSpendingRule::Flat => SpendingRule::Flat,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliMissingYears {
    Zero,
    Exclude,
}

impl From<CliMissingYears> for MissingYears {
    fn from(value: CliMissingYears) -> Self {
        match value {
            CliMissingYears::Zero => MissingYears::Zero,
            CliMissingYears::Exclude => MissingYears::Exclude,
        }
    }
}

/// Scenario flags shared by the CLI subcommands. Rates are given in percent.
#[derive(Args, Debug, Clone)]
pub struct ScenarioArgs {
    #[arg(long, default_value_t = 35)]
    pub current_age: u32,
    #[arg(long, default_value_t = 60)]
    pub retirement_age: u32,
    #[arg(long, default_value_t = 95)]
    pub terminal_age: u32,
    #[arg(long, default_value_t = 8_000_000.0)]
    pub initial_assets: f64,
    #[arg(long, default_value_t = 420_000.0, help = "Annual spending at year 0")]
    pub annual_spending: f64,
    #[arg(
        long,
        default_value_t = 5.5,
        help = "Expected annual portfolio return in percent, e.g. 5.5"
    )]
    pub expected_return: f64,
    #[arg(
        long,
        default_value_t = 12.0,
        help = "Annual return volatility in percent"
    )]
    pub return_volatility: f64,
    #[arg(long, default_value_t = 2.0, help = "Annual spending growth in percent")]
    pub inflation_rate: f64,
    #[arg(
        long,
        default_value_t = 12.0,
        help = "Share of each withdrawal lost to tax, in percent"
    )]
    pub tax_rate: f64,
    #[arg(
        long,
        default_value_t = 5.0,
        help = "Allocation drift magnitude in percent"
    )]
    pub rebalance_threshold: f64,
    #[arg(long, default_value_t = 60.0, help = "Stock allocation in percent")]
    pub stock_allocation: f64,
    #[arg(
        long,
        help = "Bond allocation in percent, defaults to 100 - stock-allocation"
    )]
    pub bond_allocation: Option<f64>,
    #[arg(long, default_value_t = 1_000)]
    pub iterations: u32,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    #[arg(long, value_enum, default_value_t = CliSpendingRule::InflationLinked)]
    pub spending_rule: CliSpendingRule,
}

pub fn build_scenario(args: &ScenarioArgs) -> Result<ScenarioInput, ScenarioError> {
    let scenario = ScenarioInput {
        current_age: args.current_age,
        retirement_age: args.retirement_age,
        terminal_age: args.terminal_age,
        initial_assets: args.initial_assets,
        annual_spending: args.annual_spending,
        expected_return: args.expected_return / 100.0,
        return_volatility: args.return_volatility / 100.0,
        inflation_rate: args.inflation_rate / 100.0,
        tax_rate: args.tax_rate / 100.0,
        rebalance_threshold: args.rebalance_threshold / 100.0,
        stock_allocation: args.stock_allocation / 100.0,
        bond_allocation: args.bond_allocation.unwrap_or(100.0 - args.stock_allocation) / 100.0,
        iterations: args.iterations,
        seed: args.seed,
    }
    .with_spending_rule(args.spending_rule.into());

    scenario.validate()?;
    Ok(scenario)
}

/// Everything the results view shows for one scenario.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub scenario: ScenarioInput,
    pub summary: ResultSummary,
    pub withdrawal_range: WithdrawalRange,
    pub strategies: Vec<StrategyOutcome>,
    pub fan_chart: Vec<FanChartPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<MonteCarloResult>,
}

pub fn build_simulation_report(
    scenario: ScenarioInput,
    missing: MissingYears,
    include_result: bool,
) -> Result<SimulationReport, ScenarioError> {
    let result = run_monte_carlo(&scenario)?;
    let strategies = compare_allocations(&scenario, &default_allocation_strategies(&scenario))?;
    let withdrawal_range = estimate_withdrawal_range(&scenario)?;

    Ok(SimulationReport {
        summary: summarize(&result),
        fan_chart: fan_chart(&result, missing),
        withdrawal_range,
        strategies,
        result: include_result.then_some(result),
        scenario,
    })
}

/// Scenario fields a request may override; anything absent keeps its default.
/// Rates are decimals, matching the serialized [`ScenarioInput`].
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ScenarioOverrides {
    current_age: Option<u32>,
    retirement_age: Option<u32>,
    terminal_age: Option<u32>,
    initial_assets: Option<f64>,
    annual_spending: Option<f64>,
    expected_return: Option<f64>,
    return_volatility: Option<f64>,
    inflation_rate: Option<f64>,
    tax_rate: Option<f64>,
    rebalance_threshold: Option<f64>,
    stock_allocation: Option<f64>,
    bond_allocation: Option<f64>,
    iterations: Option<u32>,
    seed: Option<u64>,
    spending_rule: Option<SpendingRule>,
}

impl ScenarioOverrides {
    fn resolve(self) -> Result<ScenarioInput, ScenarioError> {
        let base = ScenarioInput::default();
        let stock_allocation = self.stock_allocation.unwrap_or(base.stock_allocation);
        let bond_allocation = match (self.bond_allocation, self.stock_allocation) {
            (Some(bond), _) => bond,
            (None, Some(stock)) => 1.0 - stock,
            (None, None) => base.bond_allocation,
        };

        let scenario = ScenarioInput {
            current_age: self.current_age.unwrap_or(base.current_age),
            retirement_age: self.retirement_age.unwrap_or(base.retirement_age),
            terminal_age: self.terminal_age.unwrap_or(base.terminal_age),
            initial_assets: self.initial_assets.unwrap_or(base.initial_assets),
            annual_spending: self.annual_spending.unwrap_or(base.annual_spending),
            expected_return: self.expected_return.unwrap_or(base.expected_return),
            return_volatility: self.return_volatility.unwrap_or(base.return_volatility),
            inflation_rate: self.inflation_rate.unwrap_or(base.inflation_rate),
            tax_rate: self.tax_rate.unwrap_or(base.tax_rate),
            rebalance_threshold: self.rebalance_threshold.unwrap_or(base.rebalance_threshold),
            stock_allocation,
            bond_allocation,
            iterations: self.iterations.unwrap_or(base.iterations),
            seed: self.seed.unwrap_or(base.seed),
        }
        .with_spending_rule(self.spending_rule.unwrap_or_default());

        scenario.validate()?;
        Ok(scenario)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    #[serde(flatten)]
    scenario: ScenarioOverrides,
    missing_years: Option<MissingYears>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SensitivityPayload {
    #[serde(flatten)]
    scenario: ScenarioOverrides,
    parameter: Option<String>,
    deltas: Option<Vec<f64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SolvePayload {
    #[serde(flatten)]
    scenario: ScenarioOverrides,
    target_success_rate: Option<f64>,
    search_min: Option<f64>,
    search_max: Option<f64>,
    tolerance: Option<f64>,
    max_iterations: Option<u32>,
    simulations_per_iteration: Option<u32>,
    final_simulations: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SensitivityResponse {
    scenario: ScenarioInput,
    parameter: SensitivityParameter,
    points: Vec<SensitivityPoint>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolveResponse {
    scenario: ScenarioInput,
    solve: SpendingSolveResult,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn simulate_from_payload(payload: SimulatePayload) -> Result<SimulationReport, ScenarioError> {
    let scenario = payload.scenario.resolve()?;
    build_simulation_report(scenario, payload.missing_years.unwrap_or_default(), true)
}

fn sensitivity_from_payload(
    payload: SensitivityPayload,
) -> Result<SensitivityResponse, ScenarioError> {
    let parameter = payload
        .parameter
        .as_deref()
        .unwrap_or(SensitivityParameter::ExpectedReturn.name())
        .parse::<SensitivityParameter>()?;
    let scenario = payload.scenario.resolve()?;
    let deltas = payload
        .deltas
        .unwrap_or_else(|| DEFAULT_SENSITIVITY_DELTAS.to_vec());
    let points = run_sensitivity(&scenario, parameter, &deltas)?;

    Ok(SensitivityResponse {
        scenario,
        parameter,
        points,
    })
}

fn solve_from_payload(payload: SolvePayload) -> Result<SolveResponse, ScenarioError> {
    let scenario = payload.scenario.resolve()?;
    let defaults = SpendingSolveConfig::for_scenario(&scenario);
    let config = SpendingSolveConfig {
        target_success_rate: payload
            .target_success_rate
            .unwrap_or(defaults.target_success_rate),
        search_min: payload.search_min.unwrap_or(defaults.search_min),
        search_max: payload.search_max.unwrap_or(defaults.search_max),
        tolerance: payload.tolerance.unwrap_or(defaults.tolerance),
        max_iterations: payload.max_iterations.unwrap_or(defaults.max_iterations),
        simulations_per_iteration: payload
            .simulations_per_iteration
            .unwrap_or(defaults.simulations_per_iteration),
        final_simulations: payload
            .final_simulations
            .unwrap_or(defaults.final_simulations),
    };
    let solve = solve_max_spending(&scenario, config)?;
    Ok(SolveResponse { scenario, solve })
}

pub fn router() -> Router {
    Router::new()
        .route("/api/defaults", get(defaults_handler))
        .route("/api/simulate", post(simulate_handler))
        .route("/api/sensitivity", post(sensitivity_handler))
        .route("/api/solve", post(solve_handler))
        .fallback(not_found_handler)
}

pub async fn run_http_server(addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "retirement simulation API listening");
    axum::serve(listener, router()).await
}

async fn defaults_handler() -> Response {
    json_response(StatusCode::OK, ScenarioInput::default())
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_handler(Json(payload): Json<SimulatePayload>) -> Response {
    run_blocking("simulate", move || simulate_from_payload(payload)).await
}

async fn sensitivity_handler(Json(payload): Json<SensitivityPayload>) -> Response {
    run_blocking("sensitivity", move || sensitivity_from_payload(payload)).await
}

async fn solve_handler(Json(payload): Json<SolvePayload>) -> Response {
    run_blocking("solve", move || solve_from_payload(payload)).await
}

/// Runs CPU-bound simulation work off the async reactor.
async fn run_blocking<T, F>(endpoint: &'static str, job: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Result<T, ScenarioError> + Send + 'static,
{
    match tokio::task::spawn_blocking(job).await {
        Ok(Ok(body)) => {
            info!(endpoint, "request served");
            json_response(StatusCode::OK, body)
        }
        Ok(Err(err)) => {
            warn!(endpoint, %err, "request rejected");
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Err(err) => {
            error!(endpoint, %err, "simulation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Simulation failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
