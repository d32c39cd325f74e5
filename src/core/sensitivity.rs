use std::collections::HashMap;

use rayon::prelude::*;
use tracing::debug;

use super::engine::simulate;
use super::error::{Result, ScenarioError};
use super::types::{ScenarioInput, ScenarioKey, SensitivityParameter, SensitivityPoint};

pub const DEFAULT_SENSITIVITY_DELTAS: [f64; 5] = [-0.2, -0.1, 0.0, 0.1, 0.2];

/// Re-runs the simulation once per delta with `parameter` scaled by `1 + delta`.
///
/// Deltas are independent of each other and the output follows their order.
/// Deltas that produce an identical scenario are simulated once.
pub fn run_sensitivity(
    input: &ScenarioInput,
    parameter: SensitivityParameter,
    deltas: &[f64],
) -> Result<Vec<SensitivityPoint>> {
    input.validate()?;

    let scenarios = deltas
        .iter()
        .map(|&delta| perturb(input, parameter, delta).map(|scenario| (delta, scenario)))
        .collect::<Result<Vec<_>>>()?;

    let mut unique: Vec<&ScenarioInput> = Vec::new();
    let mut slot_by_key: HashMap<ScenarioKey, usize> = HashMap::new();
    let slots: Vec<usize> = scenarios
        .iter()
        .map(|(_, scenario)| {
            *slot_by_key.entry(scenario.cache_key()).or_insert_with(|| {
                unique.push(scenario);
                unique.len() - 1
            })
        })
        .collect();

    let success_rates: Vec<f64> = unique
        .par_iter()
        .map(|scenario| simulate(scenario).success_rate)
        .collect();

    debug!(
        parameter = %parameter,
        deltas = deltas.len(),
        simulated = unique.len(),
        "sensitivity sweep complete"
    );

    Ok(scenarios
        .iter()
        .zip(slots)
        .map(|((delta, scenario), slot)| SensitivityPoint {
            parameter,
            delta: *delta,
            value: parameter.value_of(scenario),
            success_rate: success_rates[slot],
        })
        .collect())
}

pub fn run_sensitivity_by_name(
    input: &ScenarioInput,
    parameter: &str,
    deltas: &[f64],
) -> Result<Vec<SensitivityPoint>> {
    let parameter = parameter.parse::<SensitivityParameter>()?;
    run_sensitivity(input, parameter, deltas)
}

fn perturb(
    input: &ScenarioInput,
    parameter: SensitivityParameter,
    delta: f64,
) -> Result<ScenarioInput> {
    if !delta.is_finite() {
        return Err(ScenarioError::InvalidScenario(format!(
            "sensitivity delta {delta} must be a finite number"
        )));
    }

    let mut scenario = input.clone();
    parameter.apply(&mut scenario, parameter.value_of(input) * (1.0 + delta));
    scenario.validate().map_err(|err| match err {
        ScenarioError::InvalidScenario(msg) => {
            ScenarioError::InvalidScenario(format!("{parameter} delta {delta}: {msg}"))
        }
        other => other,
    })?;
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::run_monte_carlo;

    const EPS: f64 = 1e-12;

    fn sweep_inputs() -> ScenarioInput {
        ScenarioInput {
            iterations: 200,
            ..ScenarioInput::default()
        }
    }

    #[test]
    fn tax_rate_sweep_scales_value_per_delta() {
        let input = sweep_inputs();
        let deltas = [-0.1, 0.0, 0.1];
        let points =
            run_sensitivity(&input, SensitivityParameter::TaxRate, &deltas).expect("valid sweep");

        assert_eq!(points.len(), 3);
        for (point, (delta, factor)) in points.iter().zip(deltas.iter().zip([0.9, 1.0, 1.1])) {
            assert_eq!(point.parameter, SensitivityParameter::TaxRate);
            assert_eq!(point.delta, *delta);
            assert!((point.value - input.tax_rate * factor).abs() <= EPS);
            assert!((0.0..=1.0).contains(&point.value));
            assert!((0.0..=1.0).contains(&point.success_rate));
        }
    }

    #[test]
    fn zero_delta_matches_a_plain_run() {
        let input = sweep_inputs();
        let points = run_sensitivity(&input, SensitivityParameter::ExpectedReturn, &[0.0])
            .expect("valid sweep");
        let base = run_monte_carlo(&input).expect("valid");
        assert_eq!(points[0].success_rate, base.success_rate);
        assert_eq!(points[0].value, input.expected_return);
    }

    #[test]
    fn output_order_follows_deltas_including_repeats() {
        let input = sweep_inputs();
        let deltas = [0.2, -0.2, 0.0, 0.2];
        let points = run_sensitivity(&input, SensitivityParameter::AnnualSpending, &deltas)
            .expect("valid sweep");

        let seen: Vec<f64> = points.iter().map(|p| p.delta).collect();
        assert_eq!(seen, deltas.to_vec());
        assert_eq!(points[0], points[3]);
        assert!(points[1].value < points[2].value && points[2].value < points[0].value);
    }

    #[test]
    fn perturb_changes_only_the_selected_field() {
        let input = sweep_inputs();
        for parameter in SensitivityParameter::all() {
            let scenario = perturb(&input, parameter, 0.1).expect("valid");
            let expected = parameter.value_of(&input) * 1.1;
            assert!((parameter.value_of(&scenario) - expected).abs() <= EPS);

            let mut restored = scenario.clone();
            parameter.apply(&mut restored, parameter.value_of(&input));
            assert_eq!(restored, input);
        }
    }

    #[test]
    fn higher_spending_never_improves_success() {
        let input = sweep_inputs();
        let points = run_sensitivity(&input, SensitivityParameter::AnnualSpending, &[-0.3, 0.0, 0.3])
            .expect("valid sweep");
        assert!(points[0].success_rate >= points[1].success_rate);
        assert!(points[1].success_rate >= points[2].success_rate);
    }

    #[test]
    fn higher_expected_return_never_hurts_success() {
        let input = sweep_inputs();
        let points = run_sensitivity(&input, SensitivityParameter::ExpectedReturn, &[-0.2, 0.0, 0.2])
            .expect("valid sweep");
        assert!(points[0].success_rate <= points[1].success_rate);
        assert!(points[1].success_rate <= points[2].success_rate);
    }

    #[test]
    fn empty_deltas_yield_no_points() {
        let points = run_sensitivity(&sweep_inputs(), SensitivityParameter::TaxRate, &[])
            .expect("valid sweep");
        assert!(points.is_empty());
    }

    #[test]
    fn unknown_parameter_name_is_rejected() {
        let err = run_sensitivity_by_name(&sweep_inputs(), "stockAllocation", &[0.1])
            .expect_err("must reject");
        assert_eq!(
            err,
            ScenarioError::InvalidSweepParameter("stockAllocation".to_string())
        );
    }

    #[test]
    fn parameter_names_route_to_the_typed_sweep() {
        let points = run_sensitivity_by_name(&sweep_inputs(), "annualSpending", &[0.0])
            .expect("valid sweep");
        assert_eq!(points[0].parameter, SensitivityParameter::AnnualSpending);
    }

    #[test]
    fn perturbation_out_of_range_is_rejected() {
        let mut input = sweep_inputs();
        input.tax_rate = 0.9;
        let err = run_sensitivity(&input, SensitivityParameter::TaxRate, &[0.0, 0.2])
            .expect_err("tax rate above 1 must be rejected");
        assert!(matches!(err, ScenarioError::InvalidScenario(msg) if msg.contains("taxRate")));

        let err = run_sensitivity(&input, SensitivityParameter::TaxRate, &[f64::NAN])
            .expect_err("non-finite delta must be rejected");
        assert!(matches!(err, ScenarioError::InvalidScenario(_)));
    }

    #[test]
    fn invalid_base_scenario_is_rejected() {
        let mut input = sweep_inputs();
        input.iterations = 0;
        assert!(run_sensitivity(&input, SensitivityParameter::TaxRate, &[0.0]).is_err());
    }
}
