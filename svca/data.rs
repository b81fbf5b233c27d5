//! # Expression and coordinate inputs
//!
//! Reads the tab-separated count matrix and spatial coordinates consumed by the
//! analysis, validates them, and derives per-observation size factors.
//!
//! - Expression TSV: a header row `<id>\t<gene_1>\t...\t<gene_G>`, then one row per
//!   observation with its identifier followed by G non-negative counts.
//! - Coordinates TSV: a header row `<id>\t<x>\t<y>...`, then one row per observation
//!   with its identifier followed by D coordinates, in the same order as the
//!   expression rows.

use ndarray::{Array1, Array2, Axis};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse tab-separated input: {0}")]
    CsvError(#[from] csv::Error),
    #[error("'{path}' has no data columns after the identifier column.")]
    NoDataColumns { path: String },
    #[error("Row {row} of '{path}' has {found} fields, but the header has {expected}.")]
    RaggedRow {
        path: String,
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("Value '{value}' in row {row}, column '{column}' of '{path}' is not a finite number.")]
    NonNumericValue {
        path: String,
        row: usize,
        column: String,
        value: String,
    },
    #[error("Negative count {value} for observation {row}, gene '{gene}'.")]
    NegativeCount { row: usize, gene: String, value: f64 },
    #[error("Count {value} for observation {row}, gene '{gene}' is not finite.")]
    NonFiniteCount { row: usize, gene: String, value: f64 },
    #[error("Expression has {expression} observations but coordinates have {coordinates}.")]
    ObservationCountMismatch { expression: usize, coordinates: usize },
    #[error("Observation {row} is '{expression}' in the expression table but '{coordinates}' in the coordinates table.")]
    ObservationOrderMismatch {
        row: usize,
        expression: String,
        coordinates: String,
    },
    #[error("Observation {0} has a total count of zero; its size factor would not be strictly positive.")]
    ZeroLibrarySize(usize),
    #[error("Expected {expected} size factors, found {found}.")]
    SizeFactorLength { expected: usize, found: usize },
    #[error("Size factor {value} for observation {row} is not strictly positive.")]
    NonPositiveSizeFactor { row: usize, value: f64 },
    #[error("Expression matrix has {found} gene names for {expected} columns.")]
    GeneNameCount { expected: usize, found: usize },
}

/// The N×G count matrix with its gene and observation labels.
#[derive(Debug, Clone)]
pub struct ExpressionData {
    pub counts: Array2<f64>,
    pub gene_names: Vec<String>,
    pub observation_ids: Vec<String>,
}

impl ExpressionData {
    pub fn new(counts: Array2<f64>, gene_names: Vec<String>) -> Result<Self, DataError> {
        if gene_names.len() != counts.ncols() {
            return Err(DataError::GeneNameCount {
                expected: counts.ncols(),
                found: gene_names.len(),
            });
        }
        for ((row, col), &value) in counts.indexed_iter() {
            if !value.is_finite() {
                return Err(DataError::NonFiniteCount {
                    row,
                    gene: gene_names[col].clone(),
                    value,
                });
            }
            if value < 0.0 {
                return Err(DataError::NegativeCount {
                    row,
                    gene: gene_names[col].clone(),
                    value,
                });
            }
        }
        let observation_ids = (1..=counts.nrows()).map(|i| i.to_string()).collect();
        Ok(Self {
            counts,
            gene_names,
            observation_ids,
        })
    }

    pub fn n_observations(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.ncols()
    }

    pub fn gene_index(&self, gene: &str) -> Option<usize> {
        self.gene_names.iter().position(|g| g == gene)
    }
}

/// Library size of each observation divided by the mean library size.
pub fn calc_size_factors(counts: &Array2<f64>) -> Result<Array1<f64>, DataError> {
    let totals = counts.sum_axis(Axis(1));
    if let Some(row) = totals.iter().position(|&t| t <= 0.0) {
        return Err(DataError::ZeroLibrarySize(row));
    }
    let mean = totals.mean().unwrap_or(1.0);
    Ok(totals / mean)
}

/// Checks that size factors match the observation count and are strictly positive.
pub fn validate_size_factors(size_factors: &Array1<f64>, n_observations: usize) -> Result<(), DataError> {
    if size_factors.len() != n_observations {
        return Err(DataError::SizeFactorLength {
            expected: n_observations,
            found: size_factors.len(),
        });
    }
    if let Some((row, &value)) = size_factors
        .iter()
        .enumerate()
        .find(|&(_, &v)| !(v > 0.0 && v.is_finite()))
    {
        return Err(DataError::NonPositiveSizeFactor { row, value });
    }
    Ok(())
}

/// Size-factor normalized, log-transformed expression: `ln(1 + count / size_factor)`.
pub fn normalize_expression(counts: &Array2<f64>, size_factors: &Array1<f64>) -> Array2<f64> {
    let mut normalized = counts.clone();
    for (mut row, &sf) in normalized.axis_iter_mut(Axis(0)).zip(size_factors.iter()) {
        row.mapv_inplace(|c| (c / sf).ln_1p());
    }
    normalized
}

struct Table {
    header: Vec<String>,
    ids: Vec<String>,
    values: Array2<f64>,
}

fn read_table(path: &Path) -> Result<Table, DataError> {
    let display = path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let header: Vec<String> = reader.headers()?.iter().skip(1).map(str::to_string).collect();
    if header.is_empty() {
        return Err(DataError::NoDataColumns { path: display });
    }

    let mut ids = Vec::new();
    let mut buffer = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != header.len() + 1 {
            return Err(DataError::RaggedRow {
                path: display,
                row: row + 1,
                found: record.len(),
                expected: header.len() + 1,
            });
        }
        ids.push(record[0].to_string());
        for (col, field) in record.iter().skip(1).enumerate() {
            match field.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => buffer.push(v),
                _ => {
                    return Err(DataError::NonNumericValue {
                        path: display,
                        row: row + 1,
                        column: header[col].clone(),
                        value: field.to_string(),
                    });
                }
            }
        }
    }

    let values = Array2::from_shape_vec((ids.len(), header.len()), buffer)
        .map_err(|_| DataError::NoDataColumns { path: display })?;
    Ok(Table { header, ids, values })
}

pub fn load_expression(path: &Path) -> Result<ExpressionData, DataError> {
    let table = read_table(path)?;
    log::info!(
        "Loaded expression for {} observations and {} genes from '{}'.",
        table.ids.len(),
        table.header.len(),
        path.display()
    );
    let mut data = ExpressionData::new(table.values, table.header)?;
    data.observation_ids = table.ids;
    Ok(data)
}

/// Loads coordinates and checks that their rows line up with the expression rows.
pub fn load_coordinates(path: &Path, expression: &ExpressionData) -> Result<Array2<f64>, DataError> {
    let table = read_table(path)?;
    if table.ids.len() != expression.n_observations() {
        return Err(DataError::ObservationCountMismatch {
            expression: expression.n_observations(),
            coordinates: table.ids.len(),
        });
    }
    if let Some((row, (e, c))) = expression
        .observation_ids
        .iter()
        .zip(table.ids.iter())
        .enumerate()
        .find(|(_, (e, c))| e != c)
    {
        return Err(DataError::ObservationOrderMismatch {
            row: row + 1,
            expression: e.clone(),
            coordinates: c.clone(),
        });
    }
    log::info!(
        "Loaded {}-dimensional coordinates for {} observations.",
        table.header.len(),
        table.ids.len()
    );
    Ok(table.values)
}
