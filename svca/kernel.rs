//! # Spectral covariance kernels
//!
//! A single component is
//!
//! ```text
//! k(d) = variance · exp(-2π² d² / l²) · cos(2π d / period)
//! ```
//!
//! evaluated elementwise over the distance matrix. With per-dimension length-scales
//! and periods (ARD) the component becomes a product over axes of the same factor
//! applied to the absolute coordinate difference along that axis, which is the
//! spectral-mixture component of a Gaussian spectral density and therefore PSD.
//!
//! A [`SpectralMixture`] sums components whose length-scales are spread
//! geometrically over the spatial extent of the data.

use crate::distance::DistanceCache;
use crate::transform::{KernelParameter, Transform};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Length-scales and periods are bounded to `[LOWER_FACTOR · l_min, UPPER_FACTOR · l_max]`.
pub const LOWER_BOUND_FACTOR: f64 = 0.5;
pub const UPPER_BOUND_FACTOR: f64 = 2.0;

const VARIANCE_FLOOR: f64 = 1e-6;

/// Clamps a requested component count to the smallest valid value, warning rather
/// than failing.
pub fn normalize_ncomponents(requested: i64) -> usize {
    if requested < 1 {
        log::warn!(
            "ncomponents must be 1 or larger, but received {}. Setting ncomponents=1",
            requested
        );
        1
    } else {
        requested as usize
    }
}

/// One spectral component with named, independently bounded parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralKernel {
    pub variance: KernelParameter,
    pub lengthscales: KernelParameter,
    pub periods: KernelParameter,
}

/// Per-axis factors of an ARD component at one pair of locations.
struct AxisFactor {
    value: f64,
    d_lengthscale: f64,
    d_period: f64,
}

fn axis_value(d: f64, lengthscale: f64, period: f64) -> f64 {
    (-2.0 * PI * PI * d * d / (lengthscale * lengthscale)).exp() * (2.0 * PI * d / period).cos()
}

fn axis_factor(d: f64, lengthscale: f64, period: f64) -> AxisFactor {
    let envelope = (-2.0 * PI * PI * d * d / (lengthscale * lengthscale)).exp();
    let phase = 2.0 * PI * d / period;
    let (sin, cos) = phase.sin_cos();
    AxisFactor {
        value: envelope * cos,
        d_lengthscale: envelope * cos * 4.0 * PI * PI * d * d / lengthscale.powi(3),
        d_period: envelope * sin * 2.0 * PI * d / (period * period),
    }
}

impl SpectralKernel {
    /// A component with unit, non-trainable variance and the given bounded
    /// length-scales and periods. A single value gives the isotropic kernel; one value
    /// per spatial dimension gives the ARD kernel.
    pub fn new(lengthscales: &[f64], periods: &[f64], bounds: (f64, f64)) -> Self {
        let (low, high) = bounds;
        let bounded = Transform::Sigmoid { low, high };
        Self {
            variance: KernelParameter::scalar(1.0, Transform::Positive { lower: VARIANCE_FLOOR })
                .fixed(),
            lengthscales: KernelParameter::new(lengthscales, bounded),
            periods: KernelParameter::new(periods, bounded),
        }
    }

    pub fn is_ard(&self) -> bool {
        self.lengthscales.len() > 1
    }

    fn parameters(&self) -> [&KernelParameter; 3] {
        [&self.variance, &self.lengthscales, &self.periods]
    }

    fn parameters_mut(&mut self) -> [&mut KernelParameter; 3] {
        [&mut self.variance, &mut self.lengthscales, &mut self.periods]
    }

    /// Number of trainable raw scalars, in the order variance, length-scales, periods.
    pub fn n_trainable(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|p| p.is_trainable())
            .map(|p| p.len())
            .sum()
    }

    pub fn trainable_raw(&self) -> Vec<f64> {
        self.parameters()
            .iter()
            .filter(|p| p.is_trainable())
            .flat_map(|p| p.raw().to_vec())
            .collect()
    }

    /// Writes trainable raw values from the front of `raw`, returning how many were
    /// consumed.
    pub fn set_trainable_raw(&mut self, raw: &[f64]) -> usize {
        let mut offset = 0;
        for p in self.parameters_mut() {
            if p.is_trainable() {
                let n = p.len();
                p.set_raw(&raw[offset..offset + n]);
                offset += n;
            }
        }
        offset
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.lengthscales.set_trainable(trainable);
        self.periods.set_trainable(trainable);
    }

    /// Covariance only; no derivative matrices are built.
    pub fn evaluate(&self, cache: &DistanceCache) -> Array2<f64> {
        let variance = self.variance.value(0);
        let lengthscales = self.lengthscales.values();
        let periods = self.periods.values();
        if !self.is_ard() {
            let (l, p) = (lengthscales[0], periods[0]);
            return cache.distances().mapv(|d| variance * axis_value(d, l, p));
        }
        let n = cache.n_points();
        let mut k = Array2::from_elem((n, n), variance);
        for (a, diff) in cache.axis_differences().iter().enumerate() {
            let (l, p) = (lengthscales[a], periods[a]);
            Zip::from(&mut k)
                .and(diff)
                .for_each(|k, &d| *k *= axis_value(d, l, p));
        }
        k
    }

    /// Covariance plus its derivative with respect to every trainable raw scalar.
    pub fn evaluate_with_gradients(&self, cache: &DistanceCache) -> (Array2<f64>, Vec<Array2<f64>>) {
        let (shape, mut grads) = if self.is_ard() {
            self.ard_shape(cache)
        } else {
            self.isotropic_shape(cache)
        };
        let variance = self.variance.value(0);
        for g in grads.iter_mut() {
            g.mapv_inplace(|v| v * variance);
        }
        if self.variance.is_trainable() {
            let dvar = self.variance.derivative(0);
            grads.insert(0, shape.mapv(|v| v * dvar));
        }
        (shape * variance, grads)
    }

    /// Unit-variance isotropic covariance and raw-parameter gradients.
    fn isotropic_shape(&self, cache: &DistanceCache) -> (Array2<f64>, Vec<Array2<f64>>) {
        let distances = cache.distances();
        let l = self.lengthscales.value(0);
        let p = self.periods.value(0);
        let dim = distances.dim();
        let mut k = Array2::<f64>::zeros(dim);
        let mut dl = Array2::<f64>::zeros(dim);
        let mut dp = Array2::<f64>::zeros(dim);
        Zip::from(&mut k)
            .and(&mut dl)
            .and(&mut dp)
            .and(distances)
            .for_each(|k, dl, dp, &d| {
                let f = axis_factor(d, l, p);
                *k = f.value;
                *dl = f.d_lengthscale;
                *dp = f.d_period;
            });

        let mut grads = Vec::with_capacity(2);
        if self.lengthscales.is_trainable() {
            let chain = self.lengthscales.derivative(0);
            grads.push(dl.mapv(|v| v * chain));
        }
        if self.periods.is_trainable() {
            let chain = self.periods.derivative(0);
            grads.push(dp.mapv(|v| v * chain));
        }
        (k, grads)
    }

    /// Unit-variance ARD covariance and raw-parameter gradients.
    fn ard_shape(&self, cache: &DistanceCache) -> (Array2<f64>, Vec<Array2<f64>>) {
        let axes = cache.axis_differences();
        let n = cache.n_points();
        let n_dims = axes.len();
        let lengthscales = self.lengthscales.values();
        let periods = self.periods.values();

        let mut k = Array2::<f64>::zeros((n, n));
        let mut dl: Vec<Array2<f64>> = (0..n_dims).map(|_| Array2::zeros((n, n))).collect();
        let mut dp: Vec<Array2<f64>> = (0..n_dims).map(|_| Array2::zeros((n, n))).collect();
        let mut factors = Vec::with_capacity(n_dims);
        for i in 0..n {
            for j in 0..n {
                factors.clear();
                factors.extend(
                    (0..n_dims).map(|a| axis_factor(axes[a][(i, j)], lengthscales[a], periods[a])),
                );
                k[(i, j)] = factors.iter().map(|f| f.value).product();
                for a in 0..n_dims {
                    let others: f64 = factors
                        .iter()
                        .enumerate()
                        .filter(|&(b, _)| b != a)
                        .map(|(_, f)| f.value)
                        .product();
                    dl[a][(i, j)] = others * factors[a].d_lengthscale;
                    dp[a][(i, j)] = others * factors[a].d_period;
                }
            }
        }

        let mut grads = Vec::with_capacity(2 * n_dims);
        if self.lengthscales.is_trainable() {
            for (a, g) in dl.into_iter().enumerate() {
                let chain = self.lengthscales.derivative(a);
                grads.push(g.mapv(|v| v * chain));
            }
        }
        if self.periods.is_trainable() {
            for (a, g) in dp.into_iter().enumerate() {
                let chain = self.periods.derivative(a);
                grads.push(g.mapv(|v| v * chain));
            }
        }
        (k, grads)
    }
}

/// An ordered sum of spectral components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralMixture {
    components: Vec<SpectralKernel>,
}

impl SpectralMixture {
    pub fn new(components: Vec<SpectralKernel>) -> Self {
        Self { components }
    }

    /// Builds `ncomponents` components with length-scales at the centres of equal
    /// log-width bins over `[l_min, l_max]` and periods starting at `l_max`; all
    /// length-scales and periods share the bounds `[0.5 · l_min, 2 · l_max]`.
    pub fn geometric(
        cache: &DistanceCache,
        ncomponents: i64,
        ard: bool,
    ) -> Result<Self, crate::distance::DistanceError> {
        let n = normalize_ncomponents(ncomponents);
        let (l_min, l_max) = cache.length_scale_bounds()?;
        let bounds = (LOWER_BOUND_FACTOR * l_min, UPPER_BOUND_FACTOR * l_max);
        let width = if ard { cache.n_dims().max(1) } else { 1 };
        let ratio = l_max / l_min;
        let components = (0..n)
            .map(|i| {
                let l = l_min * ratio.powf((i as f64 + 0.5) / n as f64);
                SpectralKernel::new(&vec![l; width], &vec![l_max; width], bounds)
            })
            .collect();
        Ok(Self { components })
    }

    pub fn components(&self) -> &[SpectralKernel] {
        &self.components
    }

    pub fn components_mut(&mut self) -> &mut [SpectralKernel] {
        &mut self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn is_ard(&self) -> bool {
        self.components.iter().any(SpectralKernel::is_ard)
    }

    pub fn n_trainable(&self) -> usize {
        self.components.iter().map(SpectralKernel::n_trainable).sum()
    }

    pub fn trainable_raw(&self) -> Vec<f64> {
        self.components.iter().flat_map(SpectralKernel::trainable_raw).collect()
    }

    pub fn set_trainable_raw(&mut self, raw: &[f64]) {
        let mut offset = 0;
        for c in self.components.iter_mut() {
            offset += c.set_trainable_raw(&raw[offset..]);
        }
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        for c in self.components.iter_mut() {
            c.set_trainable(trainable);
        }
    }

    pub fn evaluate(&self, cache: &DistanceCache) -> Array2<f64> {
        let n = cache.n_points();
        self.components
            .iter()
            .fold(Array2::zeros((n, n)), |acc, c| acc + c.evaluate(cache))
    }

    pub fn evaluate_with_gradients(&self, cache: &DistanceCache) -> (Array2<f64>, Vec<Array2<f64>>) {
        let n = cache.n_points();
        let mut total = Array2::<f64>::zeros((n, n));
        let mut grads = Vec::with_capacity(self.n_trainable());
        for c in &self.components {
            let (k, g) = c.evaluate_with_gradients(cache);
            total += &k;
            grads.extend(g);
        }
        (total, grads)
    }
}
