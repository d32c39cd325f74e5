use serde::{Deserialize, Serialize};

use super::types::MonteCarloResult;

/// How per-year bands treat trials that went bankrupt before that year.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingYears {
    /// A bankrupt trial holds zero assets for the rest of the horizon.
    #[default]
    Zero,
    /// Only trials still solvent in a year contribute to that year's bands.
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileBands {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

impl PercentileBands {
    /// Sorts `values` in place.
    pub fn from_values(values: &mut [f64]) -> Self {
        Self {
            p10: percentile(values, 10.0),
            p25: percentile(values, 25.0),
            p50: percentile(values, 50.0),
            p75: percentile(values, 75.0),
            p90: percentile(values, 90.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanChartPoint {
    pub year: u32,
    pub age: u32,
    /// Trials contributing to this year's bands.
    pub trials: usize,
    #[serde(flatten)]
    pub bands: PercentileBands,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub success_rate: f64,
    pub ending_assets: PercentileBands,
    pub worst_ending_assets: f64,
    pub final_bankruptcy_probability: f64,
}

/// Linear-interpolated percentile, `p` in [0, 100]. Empty input yields 0.
pub fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

/// Per-year percentile bands across all trial trajectories.
pub fn fan_chart(result: &MonteCarloResult, missing: MissingYears) -> Vec<FanChartPoint> {
    let mut year_values = Vec::with_capacity(result.yearly_ending_assets.len());

    result
        .bankruptcy_timeline
        .iter()
        .map(|point| {
            let year = point.year as usize;
            year_values.clear();
            year_values.extend(result.yearly_ending_assets.iter().filter_map(|trajectory| {
                match (trajectory.get(year), missing) {
                    (Some(value), _) => Some(*value),
                    (None, MissingYears::Zero) => Some(0.0),
                    (None, MissingYears::Exclude) => None,
                }
            }));

            FanChartPoint {
                year: point.year,
                age: point.age,
                trials: year_values.len(),
                bands: PercentileBands::from_values(&mut year_values),
            }
        })
        .collect()
}

pub fn summarize(result: &MonteCarloResult) -> ResultSummary {
    let mut ending = result.ending_assets.clone();
    let bands = PercentileBands::from_values(&mut ending);

    ResultSummary {
        success_rate: result.success_rate,
        ending_assets: bands,
        worst_ending_assets: ending.first().copied().unwrap_or(0.0),
        final_bankruptcy_probability: result
            .bankruptcy_timeline
            .last()
            .map(|p| p.bankruptcy_probability)
            .unwrap_or(0.0),
    }
}
