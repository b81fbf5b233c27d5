// svca/model.rs

//! # Spatial variance-component model
//!
//! For one gene with normalized expression `y` the model is
//!
//! ```text
//! y ~ N(μ·1, s · (w_int · K_int + w_env · K_env + I))
//! ```
//!
//! - `K_int` is the intrinsic covariance: a linear kernel over the standardized
//!   expression of every *other* gene at the same location.
//! - `K_env = Z K_int Zᵀ` is the interaction covariance: `Z` is the spectral mixture
//!   evaluated over pairwise distances with its diagonal removed, so each location
//!   aggregates the intrinsic state of its neighbours but never its own.
//! - `s` is the noise variance. It is profiled out of the restricted likelihood, so
//!   only the relative weights `w` and the kernel parameters are optimized.
//!
//! The intercept `μ` is eliminated by working with the restricted (REML)
//! likelihood, which keeps the variance estimates free of mean-level confounding.
//!
//! Per-gene state lives in a [`GeneContext`]; the expensive shared state (distance
//! cache, normalized expression, cross-gene Gram matrix) lives in [`SvcaData`]
//! behind an `Arc`, so each worker owns an independent model over the same data.

use crate::data::{DataError, ExpressionData, normalize_expression, validate_size_factors};
use crate::distance::{DistanceCache, DistanceError};
use crate::faer_ndarray::{FaerCholesky, FaerCholeskyFactor};
use crate::kernel::SpectralMixture;
use crate::optimizer::{MultiStartOptimizer, OptimizationOutcome};
use crate::transform::{KernelParameter, Transform};
use faer::Side;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lower bound of the relative variance weights.
pub const WEIGHT_LOWER_BOUND: f64 = 1e-9;

/// Floor on the profiled noise variance; reached only by (near-)constant genes.
const SCALE_FLOOR: f64 = 1e-12;

const MAX_JITTER_RETRIES: usize = 5;
const INITIAL_JITTER: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error(
        "Covariance matrix is not positive definite after {retries} jitter retries (last relative jitter {jitter:.1e})."
    )]
    NumericalInstability { retries: usize, jitter: f64 },

    #[error("Optimization failed for gene '{gene}': all {starts} starts failed. Last error: {last_error}")]
    OptimizationFailed {
        gene: String,
        starts: usize,
        last_error: String,
    },

    #[error("Gene index {index} is out of range for {n_genes} genes.")]
    GeneIndexOutOfRange { index: usize, n_genes: usize },

    #[error("Gene '{0}' is not present in the expression matrix.")]
    UnknownGene(String),

    #[error("No stored parameters for gene '{0}'.")]
    MissingParameters(String),

    #[error("Expected {expected} raw parameters, found {found}.")]
    ParameterCount { expected: usize, found: usize },

    #[error("At least 2 observations are required, found {0}.")]
    InsufficientObservations(usize),

    #[error("Coordinates have {coordinates} rows but expression has {expression} observations.")]
    CoordinateCount { coordinates: usize, expression: usize },

    #[error("Input validation failed: {0}")]
    Data(#[from] DataError),

    #[error("Length-scale bounds could not be derived: {0}")]
    Distance(#[from] DistanceError),
}

/// Read-only state shared by every gene and every worker.
#[derive(Debug)]
pub struct SvcaData {
    cache: Arc<DistanceCache>,
    normalized: Array2<f64>,
    standardized: Array2<f64>,
    gram: Array2<f64>,
    size_factors: Array1<f64>,
    gene_names: Vec<String>,
}

/// Centres each column and scales it to unit variance; constant columns become zero.
fn standardize_columns(matrix: &Array2<f64>) -> Array2<f64> {
    let mut out = matrix.clone();
    for mut column in out.axis_iter_mut(Axis(1)) {
        let mean = column.mean().unwrap_or(0.0);
        column.mapv_inplace(|v| v - mean);
        let sd = (column.iter().map(|v| v * v).sum::<f64>() / column.len() as f64).sqrt();
        if sd > 0.0 {
            column.mapv_inplace(|v| v / sd);
        } else {
            column.fill(0.0);
        }
    }
    out
}

impl SvcaData {
    pub fn new(
        expression: &ExpressionData,
        coordinates: Array2<f64>,
        size_factors: Array1<f64>,
    ) -> Result<Self, EstimationError> {
        Self::with_cache(expression, Arc::new(DistanceCache::new(coordinates)), size_factors)
    }

    /// Builds the shared state around an existing distance cache. The distance
    /// matrix is materialized here, before any worker can evaluate a kernel.
    pub fn with_cache(
        expression: &ExpressionData,
        cache: Arc<DistanceCache>,
        size_factors: Array1<f64>,
    ) -> Result<Self, EstimationError> {
        let n = expression.n_observations();
        if n < 2 {
            return Err(EstimationError::InsufficientObservations(n));
        }
        if cache.n_points() != n {
            return Err(EstimationError::CoordinateCount {
                coordinates: cache.n_points(),
                expression: n,
            });
        }
        validate_size_factors(&size_factors, n)?;

        cache.distances();
        let normalized = normalize_expression(&expression.counts, &size_factors);
        let standardized = standardize_columns(&normalized);
        let gram = standardized.dot(&standardized.t());
        log::debug!(
            "Prepared shared SVCA state: {} observations, {} genes.",
            n,
            expression.n_genes()
        );
        Ok(Self {
            cache,
            normalized,
            standardized,
            gram,
            size_factors,
            gene_names: expression.gene_names.clone(),
        })
    }

    pub fn cache(&self) -> &Arc<DistanceCache> {
        &self.cache
    }

    pub fn n_observations(&self) -> usize {
        self.normalized.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.normalized.ncols()
    }

    pub fn gene_names(&self) -> &[String] {
        &self.gene_names
    }

    pub fn size_factors(&self) -> &Array1<f64> {
        &self.size_factors
    }

    fn check_gene(&self, gene: usize) -> Result<(), EstimationError> {
        if gene >= self.n_genes() {
            return Err(EstimationError::GeneIndexOutOfRange {
                index: gene,
                n_genes: self.n_genes(),
            });
        }
        Ok(())
    }

    /// Normalized expression column of one gene.
    pub fn expression(&self, gene: usize) -> Result<Array1<f64>, EstimationError> {
        self.check_gene(gene)?;
        Ok(self.normalized.column(gene).to_owned())
    }

    /// `K_int` for one gene: the Gram matrix of the other genes, scaled by their count.
    /// With a single gene there is nothing to build it from, and the identity is used.
    pub fn intrinsic_matrix(&self, gene: usize) -> Result<Array2<f64>, EstimationError> {
        self.check_gene(gene)?;
        let n = self.n_observations();
        let n_genes = self.n_genes();
        if n_genes == 1 {
            return Ok(Array2::eye(n));
        }
        let own = self.standardized.column(gene);
        let mut k = self.gram.clone();
        for i in 0..n {
            for j in 0..n {
                k[(i, j)] -= own[i] * own[j];
            }
        }
        Ok(k / (n_genes - 1) as f64)
    }
}

/// The trainable parameter set of one gene.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParameters {
    /// Relative weight of the intrinsic covariance.
    pub intrinsic: KernelParameter,
    /// Relative weight of the interaction covariance.
    pub interaction: KernelParameter,
    pub kernel: SpectralMixture,
}

impl ModelParameters {
    /// Unit weights around the given kernel.
    pub fn new(kernel: SpectralMixture) -> Self {
        let weight = Transform::Positive {
            lower: WEIGHT_LOWER_BOUND,
        };
        Self {
            intrinsic: KernelParameter::scalar(1.0, weight),
            interaction: KernelParameter::scalar(1.0, weight),
            kernel,
        }
    }

    /// Resets both weights to one, leaving the kernel untouched.
    pub fn reset_weights(&mut self) {
        self.intrinsic.set_values(&[1.0]);
        self.interaction.set_values(&[1.0]);
    }
}

/// Everything that changes from one gene to the next.
#[derive(Debug, Clone)]
pub struct GeneContext {
    pub gene_index: usize,
    pub expression: Array1<f64>,
    pub parameters: ModelParameters,
}

/// Variance fractions at the current parameters; non-negative and summing to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractionVariance {
    pub intrinsic: f64,
    pub interaction: f64,
    pub noise: f64,
}

/// The restricted projection at the current parameters.
#[derive(Debug, Clone)]
pub struct RestrictedProjection {
    /// `P̃ = Σ̃⁻¹ - Σ̃⁻¹1(1ᵀΣ̃⁻¹1)⁻¹1ᵀΣ̃⁻¹` for the relative covariance `Σ̃`.
    pub projection: Array2<f64>,
    /// `P̃ y`.
    pub residual: Array1<f64>,
    /// Profiled noise variance `ŝ`.
    pub scale: f64,
    pub log_reml: f64,
}

#[derive(Debug, Clone)]
pub struct OptimizationSummary {
    pub log_reml: f64,
    pub iterations: usize,
    pub successful_starts: usize,
    pub failed_starts: usize,
    pub elapsed: Duration,
}

/// Covariance pieces needed for one likelihood evaluation.
struct Covariance {
    /// Neighbour weights `Z` and their raw-parameter derivatives.
    z: Option<(Array2<f64>, Vec<Array2<f64>>)>,
    k_env: Option<Array2<f64>>,
    sigma: Array2<f64>,
}

fn zero_diagonal(m: &mut Array2<f64>) {
    m.diag_mut().fill(0.0);
}

/// Cholesky with bounded jitter retries on the diagonal.
fn stable_cholesky(sigma: &Array2<f64>) -> Result<FaerCholeskyFactor, EstimationError> {
    let n = sigma.nrows();
    let mean_diag = (sigma.diag().sum() / n as f64).abs().max(f64::MIN_POSITIVE);
    let mut jitter = 0.0;
    for attempt in 0..=MAX_JITTER_RETRIES {
        let candidate = if attempt == 0 {
            None
        } else {
            let mut jittered = sigma.clone();
            jittered.diag_mut().mapv_inplace(|d| d + jitter * mean_diag);
            Some(jittered)
        };
        let matrix = candidate.as_ref().unwrap_or(sigma);
        if let Ok(factor) = matrix.cholesky(Side::Lower) {
            if factor.log_det().is_finite() {
                if attempt > 0 {
                    log::debug!("Cholesky succeeded after adding relative jitter {:.1e}.", jitter);
                }
                return Ok(factor);
            }
        }
        jitter = if attempt == 0 { INITIAL_JITTER } else { jitter * 10.0 };
    }
    Err(EstimationError::NumericalInstability {
        retries: MAX_JITTER_RETRIES,
        jitter: jitter / 10.0,
    })
}

/// `tr(A B)` for square matrices with `B` symmetric.
fn trace_product(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    (a * b).sum()
}

#[derive(Debug, Clone)]
pub struct VarianceComponentModel {
    data: Arc<SvcaData>,
    context: GeneContext,
    intrinsic: Array2<f64>,
    interactions: bool,
}

impl VarianceComponentModel {
    /// A model positioned on gene 0, with interactions disabled.
    pub fn new(data: Arc<SvcaData>, parameters: ModelParameters) -> Result<Self, EstimationError> {
        let expression = data.expression(0)?;
        let intrinsic = data.intrinsic_matrix(0)?;
        Ok(Self {
            data,
            context: GeneContext {
                gene_index: 0,
                expression,
                parameters,
            },
            intrinsic,
            interactions: false,
        })
    }

    pub fn data(&self) -> &Arc<SvcaData> {
        &self.data
    }

    /// Points the model at another gene. Parameters are left as they are.
    pub fn set_gene(&mut self, gene: usize) -> Result<(), EstimationError> {
        if gene == self.context.gene_index {
            return Ok(());
        }
        self.context.expression = self.data.expression(gene)?;
        self.intrinsic = self.data.intrinsic_matrix(gene)?;
        self.context.gene_index = gene;
        Ok(())
    }

    /// Replaces the whole per-gene context, returning the previous one.
    pub fn set_context(&mut self, context: GeneContext) -> Result<GeneContext, EstimationError> {
        let intrinsic = self.data.intrinsic_matrix(context.gene_index)?;
        if context.expression.len() != self.data.n_observations() {
            return Err(EstimationError::ParameterCount {
                expected: self.data.n_observations(),
                found: context.expression.len(),
            });
        }
        self.intrinsic = intrinsic;
        Ok(std::mem::replace(&mut self.context, context))
    }

    pub fn context(&self) -> &GeneContext {
        &self.context
    }

    pub fn into_context(self) -> GeneContext {
        self.context
    }

    pub fn current_gene(&self) -> usize {
        self.context.gene_index
    }

    pub fn gene_name(&self) -> &str {
        &self.data.gene_names[self.context.gene_index]
    }

    pub fn parameters(&self) -> &ModelParameters {
        &self.context.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ModelParameters {
        &mut self.context.parameters
    }

    pub fn use_interactions(&mut self, enabled: bool) {
        self.interactions = enabled;
    }

    pub fn interactions_enabled(&self) -> bool {
        self.interactions
    }

    pub fn intrinsic_matrix(&self) -> &Array2<f64> {
        &self.intrinsic
    }

    /// `K_env` for the current gene and kernel, whether or not interactions are on.
    pub fn interaction_matrix(&self) -> Array2<f64> {
        let mut z = self.context.parameters.kernel.evaluate(self.data.cache());
        zero_diagonal(&mut z);
        z.dot(&self.intrinsic).dot(&z.t())
    }

    /// Trainable raw values: intrinsic weight, interaction weight (with interactions
    /// on), then trainable kernel parameters (with interactions on).
    pub fn trainable_raw(&self) -> Array1<f64> {
        Self::pack(&self.context.parameters, self.interactions)
    }

    fn pack(params: &ModelParameters, interactions: bool) -> Array1<f64> {
        let mut raw = Vec::new();
        if params.intrinsic.is_trainable() {
            raw.extend_from_slice(params.intrinsic.raw());
        }
        if interactions {
            if params.interaction.is_trainable() {
                raw.extend_from_slice(params.interaction.raw());
            }
            raw.extend(params.kernel.trainable_raw());
        }
        Array1::from_vec(raw)
    }

    fn unpack(
        params: &mut ModelParameters,
        interactions: bool,
        raw: &Array1<f64>,
    ) -> Result<(), EstimationError> {
        let expected = Self::pack(params, interactions).len();
        if raw.len() != expected {
            return Err(EstimationError::ParameterCount {
                expected,
                found: raw.len(),
            });
        }
        let raw = raw.to_vec();
        let mut offset = 0;
        if params.intrinsic.is_trainable() {
            params.intrinsic.set_raw(&raw[offset..offset + 1]);
            offset += 1;
        }
        if interactions {
            if params.interaction.is_trainable() {
                params.interaction.set_raw(&raw[offset..offset + 1]);
                offset += 1;
            }
            params.kernel.set_trainable_raw(&raw[offset..]);
        }
        Ok(())
    }

    pub fn set_trainable_raw(&mut self, raw: &Array1<f64>) -> Result<(), EstimationError> {
        Self::unpack(&mut self.context.parameters, self.interactions, raw)
    }

    fn covariance(&self, params: &ModelParameters, with_kernel_gradients: bool) -> Covariance {
        let mut sigma = &self.intrinsic * params.intrinsic.value(0);
        let (z, k_env) = if self.interactions {
            let (mut z, mut dz) = if with_kernel_gradients {
                params.kernel.evaluate_with_gradients(self.data.cache())
            } else {
                (params.kernel.evaluate(self.data.cache()), Vec::new())
            };
            zero_diagonal(&mut z);
            for d in dz.iter_mut() {
                zero_diagonal(d);
            }
            let k_env = z.dot(&self.intrinsic).dot(&z.t());
            sigma.scaled_add(params.interaction.value(0), &k_env);
            (Some((z, dz)), Some(k_env))
        } else {
            (None, None)
        };
        sigma.diag_mut().mapv_inplace(|d| d + 1.0);
        Covariance { z, k_env, sigma }
    }

    fn projection(&self, covariance: &Covariance) -> Result<RestrictedProjection, EstimationError> {
        let n = self.data.n_observations();
        let y = &self.context.expression;
        let factor = stable_cholesky(&covariance.sigma)?;
        let inverse = factor.inverse(n);
        let u = inverse.sum_axis(Axis(1));
        let denom = u.sum();
        let mut projection = inverse;
        for i in 0..n {
            for j in 0..n {
                projection[(i, j)] -= u[i] * u[j] / denom;
            }
        }
        let residual = projection.dot(y);
        let r = y.dot(&residual).max(0.0);
        let m = (n - 1) as f64;
        let scale = (r / m).max(SCALE_FLOOR);
        let log_reml = -0.5
            * (m * scale.ln() + r / scale + factor.log_det() + denom.ln() + m * (2.0 * PI).ln());
        if !log_reml.is_finite() {
            return Err(EstimationError::NumericalInstability {
                retries: 0,
                jitter: 0.0,
            });
        }
        Ok(RestrictedProjection {
            projection,
            residual,
            scale,
            log_reml,
        })
    }

    /// Restricted log-likelihood with the noise variance profiled out.
    pub fn profile_log_reml(&self) -> Result<f64, EstimationError> {
        let covariance = self.covariance(&self.context.parameters, false);
        Ok(self.projection(&covariance)?.log_reml)
    }

    pub fn restricted_projection(&self) -> Result<RestrictedProjection, EstimationError> {
        let covariance = self.covariance(&self.context.parameters, false);
        self.projection(&covariance)
    }

    /// Negative restricted log-likelihood and its gradient at the raw point `raw`,
    /// without touching the model's own parameters.
    pub fn negative_reml_and_gradient(
        &self,
        raw: &Array1<f64>,
    ) -> Result<(f64, Array1<f64>), EstimationError> {
        let mut params = self.context.parameters.clone();
        Self::unpack(&mut params, self.interactions, raw)?;
        let covariance = self.covariance(&params, true);
        let proj = self.projection(&covariance)?;
        let p = &proj.projection;
        let v = &proj.residual;
        let s = proj.scale;

        // dℓ/dθ = ½ [vᵀ Σ̃' v / ŝ - tr(P̃ Σ̃')]
        let term = |k: &Array2<f64>| 0.5 * (v.dot(&k.dot(v)) / s - trace_product(p, k));

        let mut grad = Vec::with_capacity(raw.len());
        if params.intrinsic.is_trainable() {
            grad.push(params.intrinsic.derivative(0) * term(&self.intrinsic));
        }
        if let (Some((z, dz)), Some(k_env)) = (&covariance.z, &covariance.k_env) {
            if params.interaction.is_trainable() {
                grad.push(params.interaction.derivative(0) * term(k_env));
            }
            if !dz.is_empty() {
                let w_env = params.interaction.value(0);
                let zt_v = z.t().dot(v);
                let q = self.intrinsic.dot(&zt_v);
                let b = self.intrinsic.dot(&z.t()).dot(p);
                for d in dz {
                    let quad = 2.0 * d.t().dot(v).dot(&q);
                    let trace = 2.0 * (d * &b.t()).sum();
                    grad.push(0.5 * w_env * (quad / s - trace));
                }
            }
        }

        let grad = Array1::from_vec(grad);
        Ok((-proj.log_reml, -grad))
    }

    /// Maximizes the restricted likelihood over the trainable parameters and keeps the
    /// best state found.
    pub fn optimize(
        &mut self,
        optimizer: &MultiStartOptimizer,
    ) -> Result<OptimizationSummary, EstimationError> {
        let started = Instant::now();
        let initial = self.trainable_raw();
        if initial.is_empty() {
            let log_reml = self.profile_log_reml()?;
            return Ok(OptimizationSummary {
                log_reml,
                iterations: 0,
                successful_starts: 1,
                failed_starts: 0,
                elapsed: started.elapsed(),
            });
        }
        let starts = optimizer.starting_points(&initial);
        self.optimize_from(optimizer, &starts, started)
    }

    /// Like [`optimize`](Self::optimize) but with caller-supplied starting points.
    pub fn optimize_from_starts(
        &mut self,
        optimizer: &MultiStartOptimizer,
        starts: &[Array1<f64>],
    ) -> Result<OptimizationSummary, EstimationError> {
        self.optimize_from(optimizer, starts, Instant::now())
    }

    fn optimize_from(
        &mut self,
        optimizer: &MultiStartOptimizer,
        starts: &[Array1<f64>],
        started: Instant,
    ) -> Result<OptimizationSummary, EstimationError> {
        let gene = self.gene_name().to_string();
        let OptimizationOutcome {
            point,
            value,
            iterations,
            successful_starts,
            failed_starts,
        } = optimizer.minimize(&gene, starts, |raw| self.negative_reml_and_gradient(raw))?;
        self.set_trainable_raw(&point)?;
        log::debug!(
            "Gene '{}': restricted log-likelihood {:.6} after {} iterations ({} of {} starts usable).",
            gene,
            -value,
            iterations,
            successful_starts,
            successful_starts + failed_starts
        );
        Ok(OptimizationSummary {
            log_reml: -value,
            iterations,
            successful_starts,
            failed_starts,
            elapsed: started.elapsed(),
        })
    }

    /// Shares of intrinsic, interaction and noise variance at the current parameters,
    /// each weight scaled by the mean diagonal of its covariance.
    pub fn fraction_variance(&self) -> FractionVariance {
        let n = self.data.n_observations() as f64;
        let params = &self.context.parameters;
        let intrinsic = params.intrinsic.value(0) * self.intrinsic.diag().sum() / n;
        let interaction = if self.interactions {
            params.interaction.value(0) * self.interaction_matrix().diag().sum() / n
        } else {
            0.0
        };
        let intrinsic = intrinsic.max(0.0);
        let interaction = interaction.max(0.0);
        let total = intrinsic + interaction + 1.0;
        FractionVariance {
            intrinsic: intrinsic / total,
            interaction: interaction / total,
            noise: 1.0 / total,
        }
    }
}
