//! Pairwise distances between spatial locations, computed once per analysis.
//!
//! Every kernel evaluation for every gene reads the same N×N matrix, so the cache
//! is built lazily behind a [`OnceLock`] and shared through an `Arc` by all workers.
//! The per-axis difference matrices used by anisotropic kernels follow the same
//! discipline.

use ndarray::{Array2, ArrayView2};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Distances at or below this value are treated as coincident locations when
/// deriving length-scale bounds.
const COINCIDENT_DISTANCE: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum DistanceError {
    #[error(
        "All {0} spatial locations coincide; no non-zero pairwise distance is available to bound the length-scales."
    )]
    DegenerateCoordinates(usize),
}

#[derive(Debug)]
pub struct DistanceCache {
    coordinates: Array2<f64>,
    distances: OnceLock<Array2<f64>>,
    axis_differences: OnceLock<Vec<Array2<f64>>>,
    computations: AtomicUsize,
}

impl DistanceCache {
    /// Takes ownership of an N×D coordinate matrix (one row per observation).
    pub fn new(coordinates: Array2<f64>) -> Self {
        Self {
            coordinates,
            distances: OnceLock::new(),
            axis_differences: OnceLock::new(),
            computations: AtomicUsize::new(0),
        }
    }

    pub fn coordinates(&self) -> ArrayView2<'_, f64> {
        self.coordinates.view()
    }

    pub fn n_points(&self) -> usize {
        self.coordinates.nrows()
    }

    pub fn n_dims(&self) -> usize {
        self.coordinates.ncols()
    }

    /// The symmetric N×N Euclidean distance matrix.
    pub fn distances(&self) -> &Array2<f64> {
        self.distances.get_or_init(|| {
            self.computations.fetch_add(1, Ordering::Relaxed);
            let n = self.n_points();
            let mut out = Array2::<f64>::zeros((n, n));
            for i in 0..n {
                let xi = self.coordinates.row(i);
                for j in (i + 1)..n {
                    let xj = self.coordinates.row(j);
                    let d = xi
                        .iter()
                        .zip(xj.iter())
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f64>()
                        .sqrt();
                    out[(i, j)] = d;
                    out[(j, i)] = d;
                }
            }
            out
        })
    }

    /// One N×N matrix of absolute coordinate differences per spatial dimension.
    pub fn axis_differences(&self) -> &[Array2<f64>] {
        self.axis_differences.get_or_init(|| {
            let n = self.n_points();
            (0..self.n_dims())
                .map(|dim| {
                    let column = self.coordinates.column(dim);
                    Array2::from_shape_fn((n, n), |(i, j)| (column[i] - column[j]).abs())
                })
                .collect()
        })
    }

    /// How many times the distance matrix has been materialized. Never exceeds one.
    pub fn computation_count(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }

    /// `(l_min, l_max)`: the smallest non-zero and the largest pairwise distance.
    pub fn length_scale_bounds(&self) -> Result<(f64, f64), DistanceError> {
        let mut l_min = f64::INFINITY;
        let mut l_max = 0.0_f64;
        for &d in self.distances().iter() {
            if d > COINCIDENT_DISTANCE {
                l_min = l_min.min(d);
                l_max = l_max.max(d);
            }
        }
        if !l_min.is_finite() {
            return Err(DistanceError::DegenerateCoordinates(self.n_points()));
        }
        Ok((l_min, l_max))
    }
}
