#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

//! Spatial variance component analysis.
//!
//! Decomposes the variance of each gene's spatially resolved expression into an
//! intrinsic component (driven by the cell's own state), an interaction component
//! (driven by the state of neighbouring cells through a spectral distance kernel),
//! and noise. Genes are either screened cheaply with a score test against the
//! intrinsic-only model or fitted in full by restricted maximum likelihood.

pub mod config;
pub mod data;
pub mod distance;
pub mod faer_ndarray;
pub mod kernel;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod pipeline;
pub mod progress;
pub mod score_test;
pub mod transform;
