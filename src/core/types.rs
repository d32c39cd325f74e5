use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{Result, ScenarioError};

const ALLOCATION_TOLERANCE: f64 = 1e-6;
/// Oldest age a horizon may reach.
pub const MAX_TERMINAL_AGE: u32 = 150;
/// Upper bound on trials per run.
pub const MAX_ITERATIONS: u32 = 10_000;

fn default_seed() -> u64 {
    42
}

/// Inputs for one Monte Carlo run. Rates are decimals (0.055 == 5.5%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioInput {
    pub current_age: u32,
    pub retirement_age: u32,
    pub terminal_age: u32,
    pub initial_assets: f64,
    pub annual_spending: f64,
    pub expected_return: f64,
    pub return_volatility: f64,
    pub inflation_rate: f64,
    pub tax_rate: f64,
    pub rebalance_threshold: f64,
    pub stock_allocation: f64,
    pub bond_allocation: f64,
    pub iterations: u32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ScenarioInput {
    fn default() -> Self {
        Self {
            current_age: 35,
            retirement_age: 60,
            terminal_age: 95,
            initial_assets: 8_000_000.0,
            annual_spending: 420_000.0,
            expected_return: 0.055,
            return_volatility: 0.12,
            inflation_rate: 0.02,
            tax_rate: 0.12,
            rebalance_threshold: 0.05,
            stock_allocation: 0.6,
            bond_allocation: 0.4,
            iterations: 1_000,
            seed: default_seed(),
        }
    }
}

impl ScenarioInput {
    /// Number of simulated years, `terminal_age - current_age`.
    pub fn years(&self) -> u32 {
        self.terminal_age.saturating_sub(self.current_age)
    }

    pub fn with_spending_rule(&self, rule: SpendingRule) -> Self {
        match rule {
            SpendingRule::InflationLinked => self.clone(),
            SpendingRule::Flat => Self {
                inflation_rate: 0.0,
                ..self.clone()
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.current_age >= self.retirement_age {
            return invalid("retirementAge must be > currentAge");
        }
        if self.retirement_age > self.terminal_age {
            return invalid("terminalAge must be >= retirementAge");
        }
        if self.terminal_age > MAX_TERMINAL_AGE {
            return invalid(&format!("terminalAge must be <= {MAX_TERMINAL_AGE}"));
        }
        if self.iterations == 0 {
            return invalid("iterations must be > 0");
        }
        if self.iterations > MAX_ITERATIONS {
            return invalid(&format!("iterations must be <= {MAX_ITERATIONS}"));
        }

        for (name, value) in [
            ("initialAssets", self.initial_assets),
            ("annualSpending", self.annual_spending),
            ("expectedReturn", self.expected_return),
            ("returnVolatility", self.return_volatility),
            ("inflationRate", self.inflation_rate),
            ("taxRate", self.tax_rate),
            ("rebalanceThreshold", self.rebalance_threshold),
            ("stockAllocation", self.stock_allocation),
            ("bondAllocation", self.bond_allocation),
        ] {
            if !value.is_finite() {
                return invalid(&format!("{name} must be a finite number"));
            }
        }

        if self.initial_assets < 0.0 {
            return invalid("initialAssets must be >= 0");
        }
        if self.annual_spending < 0.0 {
            return invalid("annualSpending must be >= 0");
        }
        if self.return_volatility < 0.0 {
            return invalid("returnVolatility must be >= 0");
        }
        if self.rebalance_threshold < 0.0 {
            return invalid("rebalanceThreshold must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.tax_rate) {
            return invalid("taxRate must be between 0 and 1");
        }
        if !(0.0..=1.0).contains(&self.stock_allocation) {
            return invalid("stockAllocation must be between 0 and 1");
        }
        if !(0.0..=1.0).contains(&self.bond_allocation) {
            return invalid("bondAllocation must be between 0 and 1");
        }
        if (self.stock_allocation + self.bond_allocation - 1.0).abs() > ALLOCATION_TOLERANCE {
            return invalid("stockAllocation + bondAllocation must equal 1");
        }

        Ok(())
    }

    /// Bitwise identity of every field, usable as a hash key.
    pub fn cache_key(&self) -> ScenarioKey {
        ScenarioKey([
            u64::from(self.current_age),
            u64::from(self.retirement_age),
            u64::from(self.terminal_age),
            self.initial_assets.to_bits(),
            self.annual_spending.to_bits(),
            self.expected_return.to_bits(),
            self.return_volatility.to_bits(),
            self.inflation_rate.to_bits(),
            self.tax_rate.to_bits(),
            self.rebalance_threshold.to_bits(),
            self.stock_allocation.to_bits(),
            self.bond_allocation.to_bits(),
            u64::from(self.iterations),
            self.seed,
        ])
    }
}

fn invalid(msg: &str) -> Result<()> {
    Err(ScenarioError::InvalidScenario(msg.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScenarioKey([u64; 14]);

/// How nominal spending evolves over time.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpendingRule {
    #[default]
    InflationLinked,
    /// Spending stays at its year-0 amount.
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationYearPoint {
    pub year: u32,
    pub age: u32,
    pub starting_assets: f64,
    pub withdrawal: f64,
    pub taxes: f64,
    pub ending_assets: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankruptcyPoint {
    pub year: u32,
    pub age: u32,
    pub bankruptcy_probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloResult {
    pub success_rate: f64,
    /// Final assets per trial, in trial order.
    pub ending_assets: Vec<f64>,
    /// Full path of trial 0.
    pub sampled_path: Vec<SimulationYearPoint>,
    /// Year-end assets per trial. Bankrupt trials stop at their bankruptcy year.
    pub yearly_ending_assets: Vec<Vec<f64>>,
    pub bankruptcy_timeline: Vec<BankruptcyPoint>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SensitivityParameter {
    ExpectedReturn,
    AnnualSpending,
    TaxRate,
}

impl SensitivityParameter {
    pub fn all() -> [Self; 3] {
        [Self::ExpectedReturn, Self::AnnualSpending, Self::TaxRate]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ExpectedReturn => "expectedReturn",
            Self::AnnualSpending => "annualSpending",
            Self::TaxRate => "taxRate",
        }
    }

    pub fn value_of(self, input: &ScenarioInput) -> f64 {
        match self {
            Self::ExpectedReturn => input.expected_return,
            Self::AnnualSpending => input.annual_spending,
            Self::TaxRate => input.tax_rate,
        }
    }

    pub fn apply(self, input: &mut ScenarioInput, value: f64) {
        match self {
            Self::ExpectedReturn => input.expected_return = value,
            Self::AnnualSpending => input.annual_spending = value,
            Self::TaxRate => input.tax_rate = value,
        }
    }
}

impl fmt::Display for SensitivityParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SensitivityParameter {
    type Err = ScenarioError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| ScenarioError::InvalidSweepParameter(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitivityPoint {
    pub parameter: SensitivityParameter,
    pub delta: f64,
    pub value: f64,
    pub success_rate: f64,
}
