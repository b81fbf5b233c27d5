// svca/score_test.rs

//! # Score test for the interaction component
//!
//! Screens genes for spatial interactions without fitting the alternative model.
//! Only the null model (intrinsic + noise, interaction weight fixed at zero) is
//! optimized; the test then evaluates the gradient of the full restricted
//! likelihood with respect to the interaction variance at zero.
//!
//! With `P₀ = P̃ / ŝ` the restricted projection of the fitted null covariance, the
//! statistic is
//!
//! ```text
//! Q = ½ yᵀ P₀ K_env P₀ y
//! ```
//!
//! Under the null `Q` is a weighted sum of χ²₁ variables. It is approximated by a
//! scaled chi-squared `κ·χ²_ν` whose first two moments match the exact mean
//! `e = ½ tr(P₀ K_env)` and the efficient information
//!
//! ```text
//! Ĩ = I_ee - I_eθ I_θθ⁻¹ I_θe,    I_ab = ½ tr(P₀ K_a P₀ K_b)
//! ```
//!
//! where `θ` are the null variance parameters (intrinsic and noise). This gives
//! `κ = Ĩ / 2e` and `ν = 2e² / Ĩ`, and the p-value is the chi-squared survival
//! function at `Q / κ`.

use crate::kernel::SpectralMixture;
use crate::model::{EstimationError, ModelParameters, SvcaData, VarianceComponentModel};
use crate::optimizer::MultiStartOptimizer;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Relative size below which an information quantity is treated as rounding
/// noise: the nuisance determinant relative to `I_ii · I_nn`, and the efficient
/// information relative to `I_ee`.
const SINGULAR_INFORMATION: f64 = 1e-10;

/// Fitted null model of one gene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NullFit {
    pub gene_index: usize,
    pub intrinsic_weight: f64,
    /// Profiled noise variance.
    pub scale: f64,
    pub log_reml: f64,
}

/// Moments and raw p-value of the interaction score statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreStatistic {
    pub statistic: f64,
    /// Null mean of the statistic.
    pub expected: f64,
    /// Efficient information for the interaction variance.
    pub information: f64,
    pub scale: f64,
    pub dof: f64,
    /// Survival-function value before clipping.
    pub raw_pvalue: f64,
}

#[derive(Debug, Clone)]
pub struct ScoreTestResult {
    pub gene: String,
    pub time: Duration,
    pub statistic: ScoreStatistic,
    /// Clipped to `[0, 1]`.
    pub pval: f64,
    pub null: NullFit,
}

impl ScoreTestResult {
    /// Assembles a result, clipping the raw p-value into `[0, 1]`.
    pub fn new(gene: String, time: Duration, statistic: ScoreStatistic, null: NullFit) -> Self {
        let pval = clip_pvalue(statistic.raw_pvalue, &gene);
        Self {
            gene,
            time,
            statistic,
            pval,
            null,
        }
    }
}

/// `½ tr(A B)`.
fn half_trace(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    0.5 * (a * &b.t()).sum()
}

/// Score statistic for the interaction component at the model's current (null)
/// parameters. The interaction covariance uses the model's current kernel whether or
/// not interactions are enabled.
pub fn score_statistic(model: &VarianceComponentModel) -> Result<ScoreStatistic, EstimationError> {
    let proj = model.restricted_projection()?;
    let p0 = &proj.projection / proj.scale;
    let u = &proj.residual / proj.scale;
    let k_env = model.interaction_matrix();
    let a_env = p0.dot(&k_env);
    let a_int = p0.dot(model.intrinsic_matrix());

    let statistic = 0.5 * u.dot(&k_env.dot(&u));
    let expected = 0.5 * a_env.diag().sum();

    let i_ee = half_trace(&a_env, &a_env);
    let i_ei = half_trace(&a_env, &a_int);
    let i_en = half_trace(&a_env, &p0);
    let i_ii = half_trace(&a_int, &a_int);
    let i_in = half_trace(&a_int, &p0);
    let i_nn = half_trace(&p0, &p0);

    let det = i_ii * i_nn - i_in * i_in;
    let information = if det > SINGULAR_INFORMATION * i_ii * i_nn {
        i_ee - (i_ei * i_ei * i_nn - 2.0 * i_ei * i_en * i_in + i_en * i_en * i_ii) / det
    } else {
        i_ee - i_en * i_en / i_nn
    };

    let degenerate = ScoreStatistic {
        statistic,
        expected,
        information,
        scale: f64::NAN,
        dof: f64::NAN,
        raw_pvalue: 1.0,
    };
    if !(information > SINGULAR_INFORMATION * i_ee && expected > 0.0 && statistic.is_finite()) {
        log::warn!(
            "Gene '{}': degenerate score statistic (Q={:.3e}, e={:.3e}, I={:.3e}); reporting p=1.",
            model.gene_name(),
            statistic,
            expected,
            information
        );
        return Ok(degenerate);
    }

    let scale = information / (2.0 * expected);
    let dof = 2.0 * expected * expected / information;
    let raw_pvalue = match ChiSquared::new(dof) {
        Ok(dist) => dist.sf(statistic / scale),
        Err(e) => {
            log::warn!(
                "Gene '{}': invalid chi-squared degrees of freedom {}: {}; reporting p=1.",
                model.gene_name(),
                dof,
                e
            );
            return Ok(degenerate);
        }
    };
    Ok(ScoreStatistic {
        statistic,
        expected,
        information,
        scale,
        dof,
        raw_pvalue,
    })
}

/// Maps a raw survival-function value into `[0, 1]`.
///
/// The survival function is a probability, but its floating-point evaluation can
/// land marginally above one for statistics deep in the lower tail. Such values
/// are corrected to exactly one here, with a warning, before they reach any
/// multiple-testing adjustment. A NaN is reported as one and a negative value as
/// zero.
pub fn clip_pvalue(raw: f64, gene: &str) -> f64 {
    if raw.is_nan() {
        log::warn!("Gene '{}': p-value is NaN; reporting 1.", gene);
        1.0
    } else if raw > 1.0 {
        log::warn!("Gene '{}': p-value {} exceeds 1; clipping to 1.", gene, raw);
        1.0
    } else if raw < 0.0 {
        0.0
    } else {
        raw
    }
}

/// Benjamini-Hochberg adjusted p-values, in input order.
pub fn benjamini_hochberg(pvals: &[f64]) -> Vec<f64> {
    let n = pvals.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| pvals[a].total_cmp(&pvals[b]));

    let mut adjusted = vec![0.0; n];
    let mut running = 1.0_f64;
    for rank in (0..n).rev() {
        let idx = order[rank];
        let value = (pvals[idx] * n as f64 / (rank + 1) as f64).min(1.0);
        running = running.min(value);
        adjusted[idx] = running;
    }
    adjusted
}

/// Per-gene interaction score test against a fixed kernel.
///
/// Each instance owns its own model state; clone it to test genes concurrently.
#[derive(Debug, Clone)]
pub struct ScoreTest {
    model: VarianceComponentModel,
    optimizer: MultiStartOptimizer,
}

impl ScoreTest {
    pub fn new(
        data: Arc<SvcaData>,
        kernel: SpectralMixture,
        optimizer: MultiStartOptimizer,
    ) -> Result<Self, EstimationError> {
        let mut model = VarianceComponentModel::new(data, ModelParameters::new(kernel))?;
        model.use_interactions(false);
        Ok(Self { model, optimizer })
    }

    pub fn kernel(&self) -> &SpectralMixture {
        &self.model.parameters().kernel
    }

    pub fn model(&self) -> &VarianceComponentModel {
        &self.model
    }

    /// Tests one gene. A `null_fit` for the same gene is reused as is; one for
    /// another gene only seeds the null optimization.
    pub fn call(
        &mut self,
        gene: usize,
        null_fit: Option<NullFit>,
    ) -> Result<(ScoreTestResult, NullFit), EstimationError> {
        let started = Instant::now();
        self.model.set_gene(gene)?;

        let null = match null_fit {
            Some(fit) if fit.gene_index == gene => {
                self.model
                    .parameters_mut()
                    .intrinsic
                    .set_values(&[fit.intrinsic_weight]);
                fit
            }
            other => {
                let params = self.model.parameters_mut();
                params.reset_weights();
                if let Some(seed) = other {
                    params.intrinsic.set_values(&[seed.intrinsic_weight]);
                }
                let summary = self.model.optimize(&self.optimizer)?;
                let proj = self.model.restricted_projection()?;
                NullFit {
                    gene_index: gene,
                    intrinsic_weight: self.model.parameters().intrinsic.value(0),
                    scale: proj.scale,
                    log_reml: summary.log_reml,
                }
            }
        };

        let statistic = score_statistic(&self.model)?;
        let result = ScoreTestResult::new(
            self.model.gene_name().to_string(),
            started.elapsed(),
            statistic,
            null,
        );
        log::debug!(
            "Gene '{}': Q={:.4}, κ={:.4}, ν={:.3}, p={:.3e}",
            result.gene,
            statistic.statistic,
            statistic.scale,
            statistic.dof,
            result.pval
        );
        Ok((result, null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ExpressionData;
    use crate::optimizer::OptimizerConfig;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn score_test(n: usize, genes: usize, seed: u64) -> ScoreTest {
        let mut rng = StdRng::seed_from_u64(seed);
        let coords = Array2::from_shape_fn((n, 2), |_| rng.gen_range(0.0..5.0));
        let counts = Array2::from_shape_fn((n, genes), |_| rng.gen_range(0.0..30.0_f64).round());
        let names = (0..genes).map(|g| format!("g{g}")).collect();
        let expression = ExpressionData::new(counts, names).unwrap();
        let data = Arc::new(SvcaData::new(&expression, coords, Array1::ones(n)).unwrap());
        let kernel = SpectralMixture::geometric(data.cache(), 1, false).unwrap();
        ScoreTest::new(data, kernel, MultiStartOptimizer::new(OptimizerConfig::default())).unwrap()
    }

    #[test]
    fn pvalue_above_one_is_clipped() {
        assert_eq!(clip_pvalue(1.0 + 1e-12, "g"), 1.0);
        assert_eq!(clip_pvalue(f64::NAN, "g"), 1.0);
        assert_eq!(clip_pvalue(-1e-17, "g"), 0.0);
        assert_eq!(clip_pvalue(0.25, "g"), 0.25);
        assert_eq!(clip_pvalue(1.0, "g"), 1.0);
    }

    #[test]
    fn result_clips_raw_pvalue_above_one() {
        let statistic = ScoreStatistic {
            statistic: 0.0,
            expected: 1.0,
            information: 2.0,
            scale: 1.0,
            dof: 1.0,
            raw_pvalue: 1.0 + 1e-9,
        };
        let null = NullFit {
            gene_index: 0,
            intrinsic_weight: 1.0,
            scale: 1.0,
            log_reml: -3.0,
        };
        let result = ScoreTestResult::new("g0".into(), Duration::ZERO, statistic, null);
        assert_eq!(result.pval, 1.0);
        assert_eq!(result.statistic.raw_pvalue, 1.0 + 1e-9);
        let adjusted = benjamini_hochberg(&[result.pval, 0.01]);
        assert!(adjusted.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn collinear_interaction_reports_pvalue_one() {
        // Two observations leave a one-dimensional residual space, so the
        // interaction covariance cannot be separated from the nuisance terms.
        let counts = ndarray::array![[1.0, 3.0], [5.0, 2.0]];
        let expression = ExpressionData::new(counts, vec!["a".into(), "b".into()]).unwrap();
        let coords = ndarray::array![[0.0, 0.0], [1.0, 0.0]];
        let data = Arc::new(SvcaData::new(&expression, coords, Array1::ones(2)).unwrap());
        let kernel = SpectralMixture::geometric(data.cache(), 1, false).unwrap();
        let mut test =
            ScoreTest::new(data, kernel, MultiStartOptimizer::new(OptimizerConfig::default())).unwrap();

        let (result, _) = test.call(1, None).unwrap();
        assert_eq!(result.pval, 1.0);
        assert_eq!(result.statistic.raw_pvalue, 1.0);
        assert!(result.statistic.dof.is_nan());
    }

    #[test]
    fn benjamini_hochberg_matches_hand_computation() {
        let adjusted = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.5]);
        let expected = [0.04, 0.04 * 4.0 / 3.0, 0.04 * 4.0 / 3.0, 0.5];
        for (a, e) in adjusted.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-12);
        }
        assert!(benjamini_hochberg(&[]).is_empty());
    }

    #[test]
    fn benjamini_hochberg_is_capped_at_one() {
        let adjusted = benjamini_hochberg(&[0.9, 1.0, 0.95]);
        assert!(adjusted.iter().all(|&p| p <= 1.0));
        assert_abs_diff_eq!(adjusted[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn pvalues_are_probabilities() {
        let mut test = score_test(20, 5, 3);
        for gene in 0..5 {
            let (result, null) = test.call(gene, None).unwrap();
            assert!((0.0..=1.0).contains(&result.pval), "p={} for gene {}", result.pval, gene);
            assert_eq!(null.gene_index, gene);
            assert_eq!(result.gene, format!("g{gene}"));
            assert!(result.statistic.statistic >= 0.0);
        }
    }

    #[test]
    fn precomputed_null_fit_is_reused() {
        let mut test = score_test(15, 4, 5);
        let (first, null) = test.call(2, None).unwrap();
        test.call(0, None).unwrap();
        let (second, reused) = test.call(2, Some(null)).unwrap();
        assert_eq!(reused, null);
        assert_abs_diff_eq!(second.statistic.statistic, first.statistic.statistic, epsilon = 1e-10);
        assert_abs_diff_eq!(second.pval, first.pval, epsilon = 1e-10);
    }

    #[test]
    fn statistic_is_the_likelihood_slope_at_zero_interaction() {
        let mut test = score_test(12, 4, 9);
        let (result, null) = test.call(1, None).unwrap();
        let stat = result.statistic;

        let mut alternative = test.model().clone();
        alternative.use_interactions(true);
        alternative.parameters_mut().kernel.set_trainable(false);
        alternative
            .parameters_mut()
            .interaction
            .set_values(&[2.0 * crate::model::WEIGHT_LOWER_BOUND]);
        let raw = alternative.trainable_raw();
        assert_eq!(raw.len(), 2);
        let (_, grad) = alternative.negative_reml_and_gradient(&raw).unwrap();
        let slope = -grad[1] / alternative.parameters().interaction.derivative(0);

        // dℓ/dw_env = ŝ · dℓ/dσ²_env = ŝ · (Q - e)
        let expected = null.scale * (stat.statistic - stat.expected);
        assert!(
            (slope - expected).abs() <= 1e-5 * expected.abs().max(1e-3),
            "slope {slope} vs {expected}"
        );
    }

    #[test]
    fn kernel_is_not_trained_by_the_test() {
        let mut test = score_test(10, 3, 11);
        let before = test.kernel().clone();
        test.call(0, None).unwrap();
        test.call(1, None).unwrap();
        assert_eq!(test.kernel(), &before);
    }
}
