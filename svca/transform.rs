//! Constrained scalar and per-dimension parameters.
//!
//! Every hyperparameter is stored as an unconstrained raw value together with a
//! transform kind that maps it into its admissible domain. The optimizer only ever
//! sees raw values; kernels and the model only ever see transformed values.

use serde::{Deserialize, Serialize};

/// Offset from the interval ends used when inverting a bounded transform, so that a
/// value sitting exactly on a bound maps to a finite raw value.
const BOUNDARY_MARGIN: f64 = 1e-12;

/// Above this magnitude softplus and its inverse are the identity in `f64`.
const SOFTPLUS_CUTOFF: f64 = 20.0;

/// Monotonic bijection from the real line into a parameter domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    Identity,
    /// `lower + softplus(raw)`, mapping onto `(lower, ∞)`.
    Positive { lower: f64 },
    /// `low + (high - low) · sigmoid(raw)`, mapping onto `(low, high)`. In `f64` the
    /// sigmoid rounds to exactly 0 or 1 once `|raw|` exceeds about 37, so the bounds
    /// themselves are reachable there; raw values inside the optimizer's default box
    /// of ±25 stay strictly inside.
    Sigmoid { low: f64, high: f64 },
}

fn softplus(x: f64) -> f64 {
    if x > SOFTPLUS_CUTOFF { x } else { x.exp().ln_1p() }
}

fn softplus_inv(x: f64) -> f64 {
    if x > SOFTPLUS_CUTOFF { x } else { x.exp_m1().ln() }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl Transform {
    pub fn forward(&self, raw: f64) -> f64 {
        match *self {
            Transform::Identity => raw,
            Transform::Positive { lower } => lower + softplus(raw),
            Transform::Sigmoid { low, high } => low + (high - low) * sigmoid(raw),
        }
    }

    pub fn inverse(&self, value: f64) -> f64 {
        match *self {
            Transform::Identity => value,
            Transform::Positive { lower } => softplus_inv((value - lower).max(f64::MIN_POSITIVE)),
            Transform::Sigmoid { low, high } => {
                let unit = ((value - low) / (high - low)).clamp(BOUNDARY_MARGIN, 1.0 - BOUNDARY_MARGIN);
                (unit / (1.0 - unit)).ln()
            }
        }
    }

    /// `d forward / d raw`.
    pub fn derivative(&self, raw: f64) -> f64 {
        match *self {
            Transform::Identity => 1.0,
            Transform::Positive { .. } => sigmoid(raw),
            Transform::Sigmoid { low, high } => {
                let s = sigmoid(raw);
                (high - low) * s * (1.0 - s)
            }
        }
    }
}

/// A scalar or per-dimension hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelParameter {
    raw: Vec<f64>,
    transform: Transform,
    trainable: bool,
}

impl KernelParameter {
    pub fn new(values: &[f64], transform: Transform) -> Self {
        Self {
            raw: values.iter().map(|&v| transform.inverse(v)).collect(),
            transform,
            trainable: true,
        }
    }

    pub fn scalar(value: f64, transform: Transform) -> Self {
        Self::new(&[value], transform)
    }

    pub fn fixed(mut self) -> Self {
        self.trainable = false;
        self
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn raw(&self) -> &[f64] {
        &self.raw
    }

    pub fn set_raw(&mut self, raw: &[f64]) {
        self.raw.copy_from_slice(raw);
    }

    pub fn value(&self, index: usize) -> f64 {
        self.transform.forward(self.raw[index])
    }

    pub fn values(&self) -> Vec<f64> {
        self.raw.iter().map(|&r| self.transform.forward(r)).collect()
    }

    /// Assigns constrained values; lengths must match.
    pub fn set_values(&mut self, values: &[f64]) {
        for (raw, &v) in self.raw.iter_mut().zip(values) {
            *raw = self.transform.inverse(v);
        }
    }

    pub fn derivative(&self, index: usize) -> f64 {
        self.transform.derivative(self.raw[index])
    }
}
