use thiserror::Error;

/// Failures surfaced by the engine entry points.
///
/// Trials themselves never fail; everything here is detected up front while
/// validating the caller's request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScenarioError {
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),

    #[error(
        "invalid sensitivity parameter `{0}`: expected one of expectedReturn, annualSpending, taxRate"
    )]
    InvalidSweepParameter(String),

    #[error("invalid search: {0}")]
    InvalidSearch(String),
}

pub type Result<T> = std::result::Result<T, ScenarioError>;
