// svca/params.rs

//! Persisted per-gene kernel parameters.
//!
//! A batch run can save everything needed to refit genes later with the kernel
//! held fixed: the component count, the ARD flag, the size factors, the kernel
//! bounds, and per gene the kernel values plus the fitted weights. The store is a
//! human-readable TOML document keyed by gene name.

use crate::kernel::{SpectralKernel, SpectralMixture};
use crate::model::{ModelParameters, VarianceComponentModel};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParameterStoreError {
    #[error("Failed to read or write parameter file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML parameter file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize parameters to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Stored parameters for gene '{gene}' have {found} kernel components, expected {expected}.")]
    ComponentCount {
        gene: String,
        expected: usize,
        found: usize,
    },
    #[error("Stored parameters for gene '{gene}' have {found} values per length-scale or period, expected {expected}.")]
    ParameterWidth {
        gene: String,
        expected: usize,
        found: usize,
    },
    #[error("Stored size factors cover {found} observations, but the data has {expected}.")]
    SizeFactorCount { expected: usize, found: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentParameters {
    pub variance: f64,
    pub lengthscales: Vec<f64>,
    pub periods: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneParameters {
    pub intrinsic_weight: f64,
    /// Absent when only the null model was fitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_reml: Option<f64>,
    pub components: Vec<ComponentParameters>,
}

impl GeneParameters {
    /// Snapshot of the model's current state. The interaction weight is recorded only
    /// when interactions are enabled.
    pub fn from_model(model: &VarianceComponentModel, log_reml: Option<f64>) -> Self {
        let params = model.parameters();
        Self {
            intrinsic_weight: params.intrinsic.value(0),
            interaction_weight: model
                .interactions_enabled()
                .then(|| params.interaction.value(0)),
            log_reml,
            components: params
                .kernel
                .components()
                .iter()
                .map(|c| ComponentParameters {
                    variance: c.variance.value(0),
                    lengthscales: c.lengthscales.values(),
                    periods: c.periods.values(),
                })
                .collect(),
        }
    }

    /// Rebuilds the kernel and weights. Kernel parameters come back non-trainable;
    /// a missing interaction weight starts at one.
    pub fn to_parameters(&self, bounds: (f64, f64)) -> ModelParameters {
        let components = self
            .components
            .iter()
            .map(|c| {
                let mut kernel = SpectralKernel::new(&c.lengthscales, &c.periods, bounds);
                kernel.variance.set_values(&[c.variance]);
                kernel.set_trainable(false);
                kernel
            })
            .collect();
        let mut params = ModelParameters::new(SpectralMixture::new(components));
        params.intrinsic.set_values(&[self.intrinsic_weight]);
        params
            .interaction
            .set_values(&[self.interaction_weight.unwrap_or(1.0)]);
        params
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterStore {
    pub ncomponents: usize,
    pub ard: bool,
    /// `[lower, upper]` bound shared by all length-scales and periods.
    pub bounds: (f64, f64),
    pub size_factors: Vec<f64>,
    #[serde(default)]
    pub genes: BTreeMap<String, GeneParameters>,
}

impl ParameterStore {
    pub fn new(ncomponents: usize, ard: bool, bounds: (f64, f64), size_factors: &Array1<f64>) -> Self {
        Self {
            ncomponents,
            ard,
            bounds,
            size_factors: size_factors.to_vec(),
            genes: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, gene: &str, params: GeneParameters) {
        self.genes.insert(gene.to_string(), params);
    }

    pub fn get(&self, gene: &str) -> Option<&GeneParameters> {
        self.genes.get(gene)
    }

    pub fn size_factors(&self) -> Array1<f64> {
        Array1::from_vec(self.size_factors.clone())
    }

    /// Checks the stored shapes against the data they are about to be applied to.
    pub fn validate(&self, n_observations: usize, n_dims: usize) -> Result<(), ParameterStoreError> {
        if self.size_factors.len() != n_observations {
            return Err(ParameterStoreError::SizeFactorCount {
                expected: n_observations,
                found: self.size_factors.len(),
            });
        }
        let width = if self.ard { n_dims } else { 1 };
        for (gene, params) in &self.genes {
            if params.components.len() != self.ncomponents {
                return Err(ParameterStoreError::ComponentCount {
                    gene: gene.clone(),
                    expected: self.ncomponents,
                    found: params.components.len(),
                });
            }
            for c in &params.components {
                for found in [c.lengthscales.len(), c.periods.len()] {
                    if found != width {
                        return Err(ParameterStoreError::ParameterWidth {
                            gene: gene.clone(),
                            expected: width,
                            found,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ParameterStoreError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        log::info!(
            "Saved parameters for {} genes to '{}'.",
            self.genes.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ParameterStoreError> {
        let toml_string = fs::read_to_string(path)?;
        let store: Self = toml::from_str(&toml_string)?;
        log::info!(
            "Loaded parameters for {} genes from '{}'.",
            store.genes.len(),
            path.display()
        );
        Ok(store)
    }
}
