//! Multi-start BFGS over unconstrained raw parameters.
//!
//! The restricted likelihood surface of the interaction model is multimodal in the
//! kernel length-scales, so each gene is optimized from a small grid of starting
//! points around its initial state plus a few seeded random perturbations. The best
//! converged value wins; a start that fails outright only counts as a failure.

use crate::model::EstimationError;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashSet;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Objective value handed to BFGS when an evaluation fails.
const FAILED_COST: f64 = 1e10;

/// Half-width of the uniform random perturbations.
const RANDOM_SPREAD: f64 = 2.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedStrategy {
    Exhaustive,
    Light,
    Single,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub strategy: SeedStrategy,
    /// Extra starts drawn uniformly around the initial point.
    pub random_starts: usize,
    pub seed: u64,
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Raw values are clamped into this box, both for seeds and during line searches.
    pub raw_bounds: (f64, f64),
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: SeedStrategy::Light,
            random_starts: 2,
            seed: 42,
            tolerance: 1e-6,
            max_iterations: 200,
            raw_bounds: (-25.0, 25.0),
        }
    }
}

/// Best point found across all starts.
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    pub point: Array1<f64>,
    pub value: f64,
    pub iterations: usize,
    pub successful_starts: usize,
    pub failed_starts: usize,
}

fn uniform_offsets(strategy: SeedStrategy) -> Vec<f64> {
    match strategy {
        SeedStrategy::Single => Vec::new(),
        SeedStrategy::Light => vec![2.0, -2.0],
        SeedStrategy::Exhaustive => vec![4.0, 2.0, -2.0, -4.0],
    }
}

fn single_axis_offsets(strategy: SeedStrategy) -> Vec<f64> {
    match strategy {
        SeedStrategy::Exhaustive => vec![4.0, -4.0],
        SeedStrategy::Light | SeedStrategy::Single => Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct MultiStartOptimizer {
    config: OptimizerConfig,
}

impl MultiStartOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn clamp(&self, value: f64) -> f64 {
        let (lo, hi) = self.config.raw_bounds;
        if lo <= hi { value.clamp(lo, hi) } else { value.clamp(hi, lo) }
    }

    /// Deterministic starting points around `initial`: the point itself, uniform
    /// shifts, single-axis shifts, then seeded random perturbations. Duplicates
    /// after clamping are dropped.
    pub fn starting_points(&self, initial: &Array1<f64>) -> Vec<Array1<f64>> {
        let n = initial.len();
        let mut candidates = vec![initial.clone()];
        for offset in uniform_offsets(self.config.strategy) {
            candidates.push(initial.mapv(|v| v + offset));
        }
        for offset in single_axis_offsets(self.config.strategy) {
            for idx in 0..n {
                let mut seed = initial.clone();
                seed[idx] += offset;
                candidates.push(seed);
            }
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        for _ in 0..self.config.random_starts {
            candidates.push(initial.mapv(|v| v + rng.gen_range(-RANDOM_SPREAD..RANDOM_SPREAD)));
        }

        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .map(|c| c.mapv(|v| if v.is_finite() { self.clamp(v) } else { v }))
            .filter(|c| seen.insert(c.iter().map(|v| v.to_bits()).collect::<Vec<u64>>()))
            .collect()
    }

    /// Minimizes `objective` from every start and returns the lowest value reached.
    ///
    /// A start is abandoned if it contains a non-finite entry or its first
    /// evaluation fails. BFGS errors after that point fall back to the best finite
    /// evaluation seen during the run. Only when every start is abandoned does the
    /// whole optimization fail.
    pub fn minimize<F>(
        &self,
        gene: &str,
        starts: &[Array1<f64>],
        objective: F,
    ) -> Result<OptimizationOutcome, EstimationError>
    where
        F: Fn(&Array1<f64>) -> Result<(f64, Array1<f64>), EstimationError>,
    {
        let mut best: Option<OptimizationOutcome> = None;
        let mut failed = 0;
        let mut succeeded = 0;
        let mut last_error = String::from("no starting points");

        for (index, start) in starts.iter().enumerate() {
            if start.iter().any(|v| !v.is_finite()) {
                failed += 1;
                last_error = format!("start {} has a non-finite entry", index);
                log::debug!("Gene '{}': skipping start {}: {}", gene, index, last_error);
                continue;
            }
            match objective(start) {
                Ok((value, _)) if value.is_finite() => {}
                Ok((value, _)) => {
                    failed += 1;
                    last_error = format!("initial cost is not finite: {}", value);
                    log::debug!("Gene '{}': skipping start {}: {}", gene, index, last_error);
                    continue;
                }
                Err(e) => {
                    failed += 1;
                    last_error = e.to_string();
                    log::debug!("Gene '{}': skipping start {}: {}", gene, index, last_error);
                    continue;
                }
            }

            let (point, value, iterations) = self.run_start(gene, start, &objective);
            succeeded += 1;
            let improves = best.as_ref().is_none_or(|b| value < b.value);
            if improves {
                best = Some(OptimizationOutcome {
                    point,
                    value,
                    iterations,
                    successful_starts: 0,
                    failed_starts: 0,
                });
            }
        }

        match best {
            Some(mut outcome) => {
                outcome.successful_starts = succeeded;
                outcome.failed_starts = failed;
                Ok(outcome)
            }
            None => Err(EstimationError::OptimizationFailed {
                gene: gene.to_string(),
                starts: starts.len(),
                last_error,
            }),
        }
    }

    /// One BFGS run from a start whose first evaluation is known to succeed.
    fn run_start<F>(&self, gene: &str, start: &Array1<f64>, objective: &F) -> (Array1<f64>, f64, usize)
    where
        F: Fn(&Array1<f64>) -> Result<(f64, Array1<f64>), EstimationError>,
    {
        let best_seen: RefCell<Option<(Array1<f64>, f64)>> = RefCell::new(None);
        let cost_and_grad = |raw: &Array1<f64>| -> (f64, Array1<f64>) {
            let safe = raw.mapv(|v| self.clamp(v));
            match objective(&safe) {
                Ok((value, grad)) if value.is_finite() && grad.iter().all(|g| g.is_finite()) => {
                    let mut best = best_seen.borrow_mut();
                    if best.as_ref().is_none_or(|(_, b)| value < *b) {
                        *best = Some((safe, value));
                    }
                    (value, grad)
                }
                Ok((value, _)) => {
                    log::debug!("Gene '{}': non-finite cost {} during line search.", gene, value);
                    (FAILED_COST, Array1::zeros(raw.len()))
                }
                Err(e) => {
                    log::debug!("Gene '{}': cost evaluation failed: {}", gene, e);
                    (FAILED_COST, Array1::zeros(raw.len()))
                }
            }
        };

        let result = Bfgs::new(start.clone(), cost_and_grad)
            .with_tolerance(self.config.tolerance)
            .with_max_iterations(self.config.max_iterations)
            .run();

        match result {
            Ok(BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            }) if final_value.is_finite() && final_value < FAILED_COST => {
                let point = final_point.mapv(|v| self.clamp(v));
                (point, final_value, iterations)
            }
            other => {
                if let Err(e) = &other {
                    log::debug!(
                        "Gene '{}': BFGS stopped early ({:?}); keeping the best evaluation seen.",
                        gene,
                        e
                    );
                }
                match best_seen.borrow_mut().take() {
                    Some((point, value)) => (point, value, self.config.max_iterations),
                    None => {
                        let value = objective(start).map(|(v, _)| v).unwrap_or(FAILED_COST);
                        (start.clone(), value, 0)
                    }
                }
            }
        }
    }
}
