use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::debug;

use super::error::Result;
use super::types::{BankruptcyPoint, MonteCarloResult, ScenarioInput, SimulationYearPoint};

/// Share of the escalated spend drawn each year before retirement.
const PRE_RETIREMENT_DRAW_FRACTION: f64 = 0.3;
/// Bonds earn this fraction of the expected return, with no volatility of their own.
const BOND_RETURN_FRACTION: f64 = 0.4;

#[derive(Debug, Clone)]
pub(crate) struct TrialOutcome {
    pub path: Vec<SimulationYearPoint>,
    pub final_assets: f64,
    pub bankrupt_year: Option<u32>,
}

pub fn run_monte_carlo(input: &ScenarioInput) -> Result<MonteCarloResult> {
    input.validate()?;
    Ok(simulate(input))
}

/// Runs every trial of an already validated scenario.
pub(crate) fn simulate(input: &ScenarioInput) -> MonteCarloResult {
    let trials: Vec<TrialOutcome> = (0..input.iterations)
        .into_par_iter()
        .map(|trial_id| {
            let mut rng = trial_rng(input.seed, trial_id);
            simulate_trial(input, &mut rng)
        })
        .collect();

    let result = aggregate_trials(input, trials);
    debug!(
        iterations = input.iterations,
        years = input.years(),
        seed = input.seed,
        success_rate = result.success_rate,
        "monte carlo run complete"
    );
    result
}

pub(crate) fn simulate_trial<R: Rng + ?Sized>(input: &ScenarioInput, rng: &mut R) -> TrialOutcome {
    let years = input.years();
    let mut path = Vec::with_capacity(years as usize);
    let mut assets = input.initial_assets;
    let mut bankrupt_year = None;

    for year in 0..years {
        let age = input.current_age + year;
        let retired = age >= input.retirement_age;

        let escalated_spend = input.annual_spending * (1.0 + input.inflation_rate).powi(year as i32);
        let withdrawal = if retired {
            escalated_spend
        } else {
            escalated_spend * PRE_RETIREMENT_DRAW_FRACTION
        };
        let taxes = (withdrawal * input.tax_rate).max(0.0);

        let starting_assets = assets;
        assets = (assets - (withdrawal + taxes)).max(0.0);

        let annual_return = gaussian(rng, input.expected_return, input.return_volatility);
        let allocation_drift = gaussian(rng, 0.0, input.rebalance_threshold / 2.0);
        let stock_weight = (input.stock_allocation + allocation_drift).clamp(0.0, 1.0);
        let bond_weight = 1.0 - stock_weight;
        let blended_return = annual_return * stock_weight
            + input.expected_return * BOND_RETURN_FRACTION * bond_weight;

        assets = (assets * (1.0 + blended_return)).max(0.0);

        path.push(SimulationYearPoint {
            year,
            age,
            starting_assets,
            withdrawal,
            taxes,
            ending_assets: assets,
        });

        if assets <= 0.0 {
            bankrupt_year = Some(year);
            break;
        }
    }

    TrialOutcome {
        path,
        final_assets: assets,
        bankrupt_year,
    }
}

fn aggregate_trials(input: &ScenarioInput, trials: Vec<TrialOutcome>) -> MonteCarloResult {
    let years = input.years() as usize;
    let mut bankruptcies_by_year = vec![0_u32; years];
    let mut successes = 0_u32;
    let mut ending_assets = Vec::with_capacity(trials.len());
    let mut yearly_ending_assets = Vec::with_capacity(trials.len());
    let mut sampled_path = Vec::new();

    for (trial_id, trial) in trials.into_iter().enumerate() {
        ending_assets.push(trial.final_assets);
        yearly_ending_assets.push(trial.path.iter().map(|p| p.ending_assets).collect());

        if trial.final_assets > 0.0 {
            successes += 1;
        } else if let Some(count) = trial
            .bankrupt_year
            .and_then(|year| bankruptcies_by_year.get_mut(year as usize))
        {
            *count += 1;
        }

        if trial_id == 0 {
            sampled_path = trial.path;
        }
    }

    let iterations = f64::from(input.iterations);
    let mut cumulative = 0_u32;
    let bankruptcy_timeline = bankruptcies_by_year
        .iter()
        .zip(0_u32..)
        .map(|(count, year)| {
            cumulative += count;
            BankruptcyPoint {
                year,
                age: input.current_age + year,
                bankruptcy_probability: f64::from(cumulative) / iterations,
            }
        })
        .collect();

    MonteCarloResult {
        success_rate: f64::from(successes) / iterations,
        ending_assets,
        sampled_path,
        yearly_ending_assets,
        bankruptcy_timeline,
    }
}

fn gaussian<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    mean + std_dev * z
}

fn trial_rng(base_seed: u64, trial_id: u32) -> StdRng {
    StdRng::seed_from_u64(derive_seed(base_seed, trial_id))
}

fn derive_seed(base_seed: u64, trial_id: u32) -> u64 {
    splitmix64(base_seed ^ splitmix64(u64::from(trial_id)))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ScenarioError;
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn deterministic_inputs() -> ScenarioInput {
        ScenarioInput {
            current_age: 30,
            retirement_age: 31,
            terminal_age: 33,
            initial_assets: 1_000.0,
            annual_spending: 100.0,
            expected_return: 0.1,
            return_volatility: 0.0,
            inflation_rate: 0.1,
            tax_rate: 0.1,
            rebalance_threshold: 0.0,
            stock_allocation: 0.5,
            bond_allocation: 0.5,
            iterations: 4,
            seed: 7,
        }
    }

    fn assert_result_invariants(input: &ScenarioInput, result: &MonteCarloResult) {
        let iterations = input.iterations as usize;
        assert!((0.0..=1.0).contains(&result.success_rate));
        assert_eq!(result.ending_assets.len(), iterations);
        assert_eq!(result.yearly_ending_assets.len(), iterations);
        assert_eq!(result.bankruptcy_timeline.len(), input.years() as usize);

        let mut previous = 0.0;
        for (idx, point) in result.bankruptcy_timeline.iter().enumerate() {
            assert_eq!(point.year as usize, idx);
            assert_eq!(point.age, input.current_age + point.year);
            assert!(point.bankruptcy_probability >= previous);
            assert!(point.bankruptcy_probability <= 1.0);
            previous = point.bankruptcy_probability;
        }

        let last = result.sampled_path.last().expect("sampled path is never empty");
        assert_eq!(last.ending_assets, result.ending_assets[0]);
        for point in &result.sampled_path {
            assert!(point.starting_assets >= 0.0);
            assert!(point.ending_assets >= 0.0);
        }
        for (trajectory, ending) in result.yearly_ending_assets.iter().zip(&result.ending_assets) {
            assert!(!trajectory.is_empty());
            assert!(trajectory.len() <= input.years() as usize);
            assert!(trajectory.iter().all(|v| *v >= 0.0));
            assert_eq!(trajectory.last().copied(), Some(*ending));
        }
    }

    #[test]
    fn deterministic_trial_matches_hand_computed_path() {
        let input = deterministic_inputs();
        let mut rng = trial_rng(input.seed, 0);
        let trial = simulate_trial(&input, &mut rng);

        assert_eq!(trial.path.len(), 3);
        assert_eq!(trial.bankrupt_year, None);

        // Blended return: 0.1 * 0.5 + 0.1 * 0.4 * 0.5 = 0.07.
        let first = trial.path[0];
        assert_eq!((first.year, first.age), (0, 30));
        assert_approx(first.starting_assets, 1_000.0);
        assert_approx(first.withdrawal, 30.0);
        assert_approx(first.taxes, 3.0);
        assert_approx(first.ending_assets, 967.0 * 1.07);

        let second = trial.path[1];
        assert_eq!((second.year, second.age), (1, 31));
        assert_approx(second.withdrawal, 110.0);
        assert_approx(second.taxes, 11.0);
        assert_approx(second.ending_assets, (967.0 * 1.07 - 121.0) * 1.07);

        let third = trial.path[2];
        assert_approx(third.withdrawal, 121.0);
        assert_approx(third.taxes, 12.1);
        assert_approx(
            third.ending_assets,
            ((967.0 * 1.07 - 121.0) * 1.07 - 133.1) * 1.07,
        );
        assert_approx(trial.final_assets, third.ending_assets);
    }

    #[test]
    fn deterministic_run_succeeds_in_every_trial() {
        let input = deterministic_inputs();
        let result = run_monte_carlo(&input).expect("valid scenario");
        assert_result_invariants(&input, &result);
        assert_approx(result.success_rate, 1.0);
        assert!(
            result
                .bankruptcy_timeline
                .iter()
                .all(|p| p.bankruptcy_probability == 0.0)
        );
        let first = result.ending_assets[0];
        assert!(result.ending_assets.iter().all(|v| (*v - first).abs() <= EPS));
    }

    #[test]
    fn bankruptcy_stops_trial_and_fills_timeline_from_that_year() {
        let input = ScenarioInput {
            current_age: 30,
            retirement_age: 31,
            terminal_age: 35,
            initial_assets: 250.0,
            annual_spending: 100.0,
            expected_return: 0.0,
            return_volatility: 0.0,
            inflation_rate: 0.0,
            tax_rate: 0.0,
            rebalance_threshold: 0.0,
            stock_allocation: 1.0,
            bond_allocation: 0.0,
            iterations: 10,
            seed: 1,
        };
        let result = run_monte_carlo(&input).expect("valid scenario");
        assert_result_invariants(&input, &result);

        // 250 - 30 - 100 - 100 leaves 20, which cannot cover year 3.
        assert_approx(result.success_rate, 0.0);
        assert!(result.ending_assets.iter().all(|v| *v == 0.0));
        assert!(result.yearly_ending_assets.iter().all(|t| t.len() == 4));
        let probabilities: Vec<f64> = result
            .bankruptcy_timeline
            .iter()
            .map(|p| p.bankruptcy_probability)
            .collect();
        assert_eq!(probabilities, vec![0.0, 0.0, 0.0, 1.0, 1.0]);

        let last = result.sampled_path.last().expect("path");
        assert_eq!(last.year, 3);
        assert_approx(last.starting_assets, 20.0);
        assert_eq!(last.ending_assets, 0.0);
    }

    #[test]
    fn empty_portfolio_goes_bankrupt_in_first_year() {
        let mut input = ScenarioInput::default();
        input.initial_assets = 0.0;
        input.iterations = 25;
        let result = run_monte_carlo(&input).expect("valid scenario");
        assert_result_invariants(&input, &result);
        assert_eq!(result.success_rate, 0.0);
        assert_eq!(result.sampled_path.len(), 1);
        assert!(
            result
                .bankruptcy_timeline
                .iter()
                .all(|p| p.bankruptcy_probability == 1.0)
        );
    }

    #[test]
    fn fixed_seed_reruns_are_identical() {
        let mut input = ScenarioInput::default();
        input.iterations = 200;
        let a = run_monte_carlo(&input).expect("valid");
        let b = run_monte_carlo(&input).expect("valid");
        assert_eq!(a, b);
    }

    #[test]
    fn different_seeds_draw_different_paths() {
        let mut input = ScenarioInput::default();
        input.iterations = 50;
        let a = run_monte_carlo(&input).expect("valid");
        input.seed += 1;
        let b = run_monte_carlo(&input).expect("valid");
        assert_ne!(a.ending_assets, b.ending_assets);
    }

    #[test]
    fn default_scenario_success_rate_is_stable_across_seeds() {
        let mut input = ScenarioInput::default();
        let a = run_monte_carlo(&input).expect("valid");
        input.seed = 2024;
        let b = run_monte_carlo(&input).expect("valid");
        assert_result_invariants(&input, &b);
        assert!(
            (a.success_rate - b.success_rate).abs() <= 0.05,
            "{} vs {}",
            a.success_rate,
            b.success_rate
        );
    }

    #[test]
    fn zero_volatility_removes_randomness() {
        let mut input = ScenarioInput::default();
        input.return_volatility = 0.0;
        input.rebalance_threshold = 0.0;
        input.iterations = 300;
        let a = run_monte_carlo(&input).expect("valid");
        input.seed = 99_999;
        let b = run_monte_carlo(&input).expect("valid");

        assert!(a.success_rate == 0.0 || a.success_rate == 1.0);
        assert_eq!(a.success_rate, b.success_rate);
        assert_eq!(a.ending_assets, b.ending_assets);
    }

    #[test]
    fn invalid_scenario_is_rejected_before_simulating() {
        let mut input = ScenarioInput::default();
        input.terminal_age = input.current_age;
        assert!(matches!(
            run_monte_carlo(&input),
            Err(ScenarioError::InvalidScenario(_))
        ));
    }

    #[test]
    fn derive_seed_changes_per_trial_and_base() {
        assert_ne!(derive_seed(42, 0), derive_seed(42, 1));
        assert_ne!(derive_seed(42, 0), derive_seed(43, 0));
        assert_eq!(derive_seed(42, 5), derive_seed(42, 5));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]

        #[test]
        fn prop_results_respect_shape_and_bounds(
            seed in any::<u64>(),
            current_age in 20u32..60,
            working_years in 1u32..15,
            retired_years in 0u32..30,
            iterations in 1u32..40,
            initial_assets in 0u32..5_000_000,
            annual_spending in 0u32..400_000,
            mean_bp in -500i32..1500,
            vol_bp in 0u32..4000,
            inflation_bp in -200i32..800,
            tax_bp in 0u32..=10_000,
            rebalance_bp in 0u32..3000,
            stock_bp in 0u32..=10_000
        ) {
            let input = ScenarioInput {
                current_age,
                retirement_age: current_age + working_years,
                terminal_age: current_age + working_years + retired_years,
                initial_assets: f64::from(initial_assets),
                annual_spending: f64::from(annual_spending),
                expected_return: f64::from(mean_bp) / 10_000.0,
                return_volatility: f64::from(vol_bp) / 10_000.0,
                inflation_rate: f64::from(inflation_bp) / 10_000.0,
                tax_rate: f64::from(tax_bp) / 10_000.0,
                rebalance_threshold: f64::from(rebalance_bp) / 10_000.0,
                stock_allocation: f64::from(stock_bp) / 10_000.0,
                bond_allocation: 1.0 - f64::from(stock_bp) / 10_000.0,
                iterations,
                seed,
            };
            let result = run_monte_carlo(&input).expect("generated scenarios are valid");
            assert_result_invariants(&input, &result);

            let bankrupt = result.ending_assets.iter().filter(|v| **v <= 0.0).count();
            let final_probability = result
                .bankruptcy_timeline
                .last()
                .map(|p| p.bankruptcy_probability)
                .unwrap_or(0.0);
            prop_assert!((final_probability - bankrupt as f64 / f64::from(iterations)).abs() < 1e-12);
            prop_assert!((result.success_rate + final_probability - 1.0).abs() < 1e-12);
            prop_assert_eq!(result.sampled_path.len(), result.yearly_ending_assets[0].len());
        }
    }
}
