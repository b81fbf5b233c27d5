// svca/pipeline.rs

//! # Batch drivers
//!
//! Runs the score test or the full fit over many genes. Shared state (distance
//! cache, normalized expression) is built once and handed to workers behind an
//! `Arc`; each rayon worker clones its own model so no two genes ever touch the same
//! trainable parameters. A gene that fails is reported with its error and the batch
//! carries on. Results come back in the order the genes were requested.

use crate::config::AnalysisConfig;
use crate::data::{ExpressionData, calc_size_factors};
use crate::kernel::{LOWER_BOUND_FACTOR, SpectralMixture, UPPER_BOUND_FACTOR, normalize_ncomponents};
use crate::model::{EstimationError, ModelParameters, SvcaData, VarianceComponentModel};
use crate::optimizer::MultiStartOptimizer;
use crate::params::{GeneParameters, ParameterStore, ParameterStoreError};
use crate::progress::{AnalysisStage, ProgressObserver};
use crate::score_test::{ScoreTest, benjamini_hochberg};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Parameters(#[from] ParameterStoreError),
    #[error("Failed to write results: {0}")]
    Output(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One unit of batch work.
#[derive(Debug, Clone)]
pub struct GeneJob {
    /// Position in the requested gene list; results are sorted back by it.
    pub position: usize,
    pub gene_index: usize,
    pub gene: String,
}

/// Lazily yields [`GeneJob`]s over the requested genes.
#[derive(Debug, Clone)]
pub struct GeneJobs {
    data: Arc<SvcaData>,
    indices: Vec<usize>,
    next: usize,
}

impl GeneJobs {
    pub fn new(data: Arc<SvcaData>, indices: Vec<usize>) -> Self {
        Self {
            data,
            indices,
            next: 0,
        }
    }

    pub fn all(data: Arc<SvcaData>) -> Self {
        let indices = (0..data.n_genes()).collect();
        Self::new(data, indices)
    }
}

impl Iterator for GeneJobs {
    type Item = GeneJob;

    fn next(&mut self) -> Option<GeneJob> {
        let gene_index = *self.indices.get(self.next)?;
        let job = GeneJob {
            position: self.next,
            gene_index,
            gene: self.data.gene_names()[gene_index].clone(),
        };
        self.next += 1;
        Some(job)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.indices.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for GeneJobs {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneFailure {
    pub gene: String,
    pub error: String,
}

#[derive(Debug)]
pub struct BatchReport<T> {
    pub results: Vec<T>,
    pub failures: Vec<GeneFailure>,
}

/// Runs `task` for every job on the rayon pool. Each worker gets its own clone of
/// `prototype`.
pub fn dispatch<T, W, F>(
    jobs: GeneJobs,
    prototype: &W,
    stage: AnalysisStage,
    progress: &dyn ProgressObserver,
    task: F,
) -> BatchReport<T>
where
    T: Send,
    W: Clone + Send + Sync,
    F: Fn(&mut W, &GeneJob) -> Result<T, EstimationError> + Sync,
{
    progress.on_start(stage, jobs.len());
    let mut outcomes: Vec<(usize, Result<T, GeneFailure>)> = jobs
        .par_bridge()
        .map_init(
            || prototype.clone(),
            |worker, job| {
                let outcome = task(worker, &job).map_err(|e| {
                    log::warn!("{} failed for gene '{}': {}", stage, job.gene, e);
                    GeneFailure {
                        gene: job.gene.clone(),
                        error: e.to_string(),
                    }
                });
                progress.on_gene_finished(stage, &job.gene);
                (job.position, outcome)
            },
        )
        .collect();
    progress.on_finish(stage);

    outcomes.sort_by_key(|(position, _)| *position);
    let mut report = BatchReport {
        results: Vec::with_capacity(outcomes.len()),
        failures: Vec::new(),
    };
    for (_, outcome) in outcomes {
        match outcome {
            Ok(result) => report.results.push(result),
            Err(failure) => report.failures.push(failure),
        }
    }
    report
}

/// One row of the score-test output table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreTestRecord {
    pub gene: String,
    pub pval: f64,
    pub padj: f64,
    pub statistic: f64,
    pub dof: f64,
    /// Seconds.
    pub time: f64,
}

/// One row of the fit output table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitRecord {
    pub gene: String,
    pub intrinsic: f64,
    pub interaction: f64,
    pub noise: f64,
    pub log_reml: f64,
    pub iterations: usize,
    /// Seconds.
    pub time: f64,
}

#[derive(Debug)]
pub struct ScoreTestOutput {
    pub records: Vec<ScoreTestRecord>,
    pub failures: Vec<GeneFailure>,
    pub parameters: ParameterStore,
}

#[derive(Debug)]
pub struct FitOutput {
    pub records: Vec<FitRecord>,
    pub failures: Vec<GeneFailure>,
    pub parameters: ParameterStore,
}

fn kernel_bounds(data: &SvcaData) -> Result<(f64, f64), EstimationError> {
    let (l_min, l_max) = data.cache().length_scale_bounds()?;
    Ok((LOWER_BOUND_FACTOR * l_min, UPPER_BOUND_FACTOR * l_max))
}

fn resolve_size_factors(
    expression: &ExpressionData,
    size_factors: Option<Array1<f64>>,
) -> Result<Array1<f64>, EstimationError> {
    match size_factors {
        Some(sf) => Ok(sf),
        None => Ok(calc_size_factors(&expression.counts)?),
    }
}

/// Score-tests every gene for a spatial interaction component.
///
/// The kernel is built once from the coordinates and shared by all genes; only the
/// null model is fitted per gene. P-values are clipped to `[0, 1]` before the
/// Benjamini-Hochberg adjustment across the genes that succeeded.
pub fn test_spatial_interactions(
    expression: &ExpressionData,
    coordinates: Array2<f64>,
    size_factors: Option<Array1<f64>>,
    config: &AnalysisConfig,
    progress: &dyn ProgressObserver,
) -> Result<ScoreTestOutput, EstimationError> {
    let ncomponents = normalize_ncomponents(config.ncomponents);
    let size_factors = resolve_size_factors(expression, size_factors)?;
    let data = Arc::new(SvcaData::new(expression, coordinates, size_factors)?);
    let kernel = SpectralMixture::geometric(data.cache(), ncomponents as i64, config.ard)?;
    let optimizer = MultiStartOptimizer::new(config.optimizer.clone());
    let prototype = ScoreTest::new(data.clone(), kernel, optimizer)?;
    log::info!(
        "Score-testing {} genes with {} spectral component(s){}.",
        data.n_genes(),
        ncomponents,
        if config.ard { " (ARD)" } else { "" }
    );

    let report = dispatch(
        GeneJobs::all(data.clone()),
        &prototype,
        AnalysisStage::ScoreTest,
        progress,
        |test, job| {
            let (result, _null) = test.call(job.gene_index, None)?;
            let params = GeneParameters::from_model(test.model(), Some(result.null.log_reml));
            Ok((result, params))
        },
    );

    let pvals: Vec<f64> = report.results.iter().map(|(r, _)| r.pval).collect();
    let padj = benjamini_hochberg(&pvals);
    let mut parameters = ParameterStore::new(ncomponents, config.ard, kernel_bounds(&data)?, data.size_factors());
    let mut records = Vec::with_capacity(report.results.len());
    for ((result, params), padj) in report.results.into_iter().zip(padj) {
        parameters.insert(&result.gene, params);
        records.push(ScoreTestRecord {
            gene: result.gene,
            pval: result.pval,
            padj,
            statistic: result.statistic.statistic,
            dof: result.statistic.dof,
            time: result.time.as_secs_f64(),
        });
    }
    log::info!(
        "Score test finished: {} genes tested, {} failed.",
        records.len(),
        report.failures.len()
    );
    Ok(ScoreTestOutput {
        records,
        failures: report.failures,
        parameters,
    })
}

/// Fits the full interaction model and reports variance fractions.
///
/// Without `stored` parameters every gene is fitted ab initio: the kernel starts from
/// its geometric default and is optimized together with the weights. With `stored`
/// parameters the size factors, component count, ARD flag and per-gene kernel values
/// come from the store, the kernel is held fixed, and only the weights are optimized.
/// Genes not in the expression matrix, or without stored parameters in restricted
/// mode, are reported as failures.
pub fn fit_spatial_interactions(
    expression: &ExpressionData,
    coordinates: Array2<f64>,
    genes: Option<&[String]>,
    size_factors: Option<Array1<f64>>,
    config: &AnalysisConfig,
    stored: Option<&ParameterStore>,
    progress: &dyn ProgressObserver,
) -> Result<FitOutput, PipelineError> {
    let (ncomponents, ard, size_factors) = match stored {
        Some(store) => {
            if genes.is_none() {
                log::warn!("No genes given. Fitting all genes.");
            }
            (store.ncomponents, store.ard, store.size_factors())
        }
        None => {
            log::info!("No stored SVCA parameters given. Performing ab initio fitting.");
            (
                normalize_ncomponents(config.ncomponents),
                config.ard,
                resolve_size_factors(expression, size_factors)?,
            )
        }
    };
    if let Some(store) = stored {
        store.validate(expression.n_observations(), coordinates.ncols())?;
    }

    let data = Arc::new(SvcaData::new(expression, coordinates, size_factors)?);
    let bounds = match stored {
        Some(store) => store.bounds,
        None => kernel_bounds(&data)?,
    };
    let kernel = SpectralMixture::geometric(data.cache(), ncomponents as i64, ard)
        .map_err(EstimationError::from)?;
    let initial = ModelParameters::new(kernel);
    let mut prototype = VarianceComponentModel::new(data.clone(), initial.clone())?;
    prototype.use_interactions(true);
    let optimizer = MultiStartOptimizer::new(config.optimizer.clone());

    let mut failures = Vec::new();
    let indices = match genes {
        None => (0..data.n_genes()).collect(),
        Some(requested) => {
            let lookup: HashMap<&str, usize> = data
                .gene_names()
                .iter()
                .enumerate()
                .map(|(i, g)| (g.as_str(), i))
                .collect();
            let mut indices = Vec::with_capacity(requested.len());
            for gene in requested {
                match lookup.get(gene.as_str()) {
                    Some(&i) => indices.push(i),
                    None => {
                        let error = EstimationError::UnknownGene(gene.clone());
                        log::warn!("{}", error);
                        failures.push(GeneFailure {
                            gene: gene.clone(),
                            error: error.to_string(),
                        });
                    }
                }
            }
            indices
        }
    };

    let report = dispatch(
        GeneJobs::new(data.clone(), indices),
        &prototype,
        AnalysisStage::Fit,
        progress,
        |model, job| {
            let started = Instant::now();
            model.set_gene(job.gene_index)?;
            *model.parameters_mut() = match stored {
                Some(store) => store
                    .get(&job.gene)
                    .ok_or_else(|| EstimationError::MissingParameters(job.gene.clone()))?
                    .to_parameters(bounds),
                None => initial.clone(),
            };
            let summary = model.optimize(&optimizer)?;
            let fractions = model.fraction_variance();
            let record = FitRecord {
                gene: job.gene.clone(),
                intrinsic: fractions.intrinsic,
                interaction: fractions.interaction,
                noise: fractions.noise,
                log_reml: summary.log_reml,
                iterations: summary.iterations,
                time: started.elapsed().as_secs_f64(),
            };
            Ok((record, GeneParameters::from_model(model, Some(summary.log_reml))))
        },
    );
    failures.extend(report.failures);

    let mut parameters = ParameterStore::new(ncomponents, ard, bounds, data.size_factors());
    let mut records = Vec::with_capacity(report.results.len());
    for (record, params) in report.results {
        parameters.insert(&record.gene, params);
        records.push(record);
    }
    log::info!(
        "Fit finished: {} genes fitted, {} failed.",
        records.len(),
        failures.len()
    );
    Ok(FitOutput {
        records,
        failures,
        parameters,
    })
}

fn write_tsv<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), PipelineError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    log::info!("Wrote {} rows to '{}'.", rows.len(), path.display());
    Ok(())
}

pub fn write_score_tests(path: &Path, records: &[ScoreTestRecord]) -> Result<(), PipelineError> {
    write_tsv(path, records)
}

pub fn write_fits(path: &Path, records: &[FitRecord]) -> Result<(), PipelineError> {
    write_tsv(path, records)
}

pub fn write_failures(path: &Path, failures: &[GeneFailure]) -> Result<(), PipelineError> {
    write_tsv(path, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    fn small_data(seed: u64) -> (ExpressionData, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = 12;
        let coords = Array2::from_shape_fn((n, 2), |_| rng.gen_range(0.0..4.0));
        let counts = Array2::from_shape_fn((n, 4), |_| rng.gen_range(1.0..25.0_f64).round());
        let names = ["Gfap", "Sox2", "Olig2", "Pdgfra"].iter().map(|s| s.to_string()).collect();
        (ExpressionData::new(counts, names).unwrap(), coords)
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl ProgressObserver for Counter {
        fn on_gene_finished(&self, _stage: AnalysisStage, _gene: &str) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn jobs_are_yielded_in_request_order() {
        let (expression, coords) = small_data(1);
        let data = Arc::new(SvcaData::new(&expression, coords, Array1::ones(12)).unwrap());
        let jobs: Vec<GeneJob> = GeneJobs::new(data, vec![2, 0]).collect();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].gene, "Olig2");
        assert_eq!(jobs[0].position, 0);
        assert_eq!(jobs[1].gene_index, 0);
        assert_eq!(jobs[1].position, 1);
    }

    #[test]
    fn dispatch_keeps_order_and_reports_failures() {
        let (expression, coords) = small_data(2);
        let data = Arc::new(SvcaData::new(&expression, coords, Array1::ones(12)).unwrap());
        let counter = Counter::default();
        let report = dispatch(
            GeneJobs::all(data),
            &0usize,
            AnalysisStage::Fit,
            &counter,
            |_, job| {
                if job.gene == "Sox2" {
                    Err(EstimationError::UnknownGene(job.gene.clone()))
                } else {
                    Ok(job.gene_index)
                }
            },
        );
        assert_eq!(report.results, vec![0, 2, 3]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].gene, "Sox2");
        assert_eq!(counter.0.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn score_test_batch_reports_every_gene() {
        let (expression, coords) = small_data(3);
        let output = test_spatial_interactions(
            &expression,
            coords,
            None,
            &AnalysisConfig::default(),
            &NoopProgress,
        )
        .unwrap();
        assert_eq!(output.records.len(), 4);
        assert!(output.failures.is_empty());
        for record in &output.records {
            assert!((0.0..=1.0).contains(&record.pval));
            assert!(record.padj >= record.pval && record.padj <= 1.0);
        }
        assert_eq!(output.parameters.genes.len(), 4);
        assert!(output.parameters.validate(12, 2).is_ok());
    }

    #[test]
    fn inseparable_interaction_is_never_significant() {
        let expression = ExpressionData::new(
            ndarray::array![[1.0, 3.0], [5.0, 2.0]],
            vec!["Gfap".into(), "Aqp4".into()],
        )
        .unwrap();
        let coords = ndarray::array![[0.0, 0.0], [1.0, 0.0]];
        let output = test_spatial_interactions(
            &expression,
            coords,
            Some(Array1::ones(2)),
            &AnalysisConfig::default(),
            &NoopProgress,
        )
        .unwrap();
        assert!(output.failures.is_empty(), "{:?}", output.failures);
        for record in &output.records {
            assert_eq!(record.pval, 1.0, "gene {}", record.gene);
            assert_eq!(record.padj, 1.0);
        }
    }

    #[test]
    fn unknown_genes_do_not_abort_the_fit() {
        let (expression, coords) = small_data(4);
        let genes = vec!["Sox2".to_string(), "Nope".to_string()];
        let output = fit_spatial_interactions(
            &expression,
            coords,
            Some(genes.as_slice()),
            None,
            &AnalysisConfig::default(),
            None,
            &NoopProgress,
        )
        .unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].gene, "Sox2");
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].gene, "Nope");
    }

    #[test]
    fn restricted_fit_requires_stored_parameters() {
        let (expression, coords) = small_data(5);
        let genes = vec!["Gfap".to_string(), "Sox2".to_string()];
        let first = fit_spatial_interactions(
            &expression,
            coords.clone(),
            Some(&genes[..1]),
            None,
            &AnalysisConfig::default(),
            None,
            &NoopProgress,
        )
        .unwrap();
        let refit = fit_spatial_interactions(
            &expression,
            coords,
            Some(genes.as_slice()),
            None,
            &AnalysisConfig::default(),
            Some(&first.parameters),
            &NoopProgress,
        )
        .unwrap();
        assert_eq!(refit.records.len(), 1);
        assert_eq!(refit.failures.len(), 1);
        assert!(refit.failures[0].error.contains("No stored parameters"));
    }

    #[test]
    fn results_are_written_as_tab_separated_tables() {
        let file = NamedTempFile::new().unwrap();
        let records = vec![ScoreTestRecord {
            gene: "Gfap".into(),
            pval: 0.5,
            padj: 1.0,
            statistic: 2.0,
            dof: 1.5,
            time: 0.01,
        }];
        write_score_tests(file.path(), &records).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("gene\tpval\tpadj\tstatistic\tdof\ttime"));
        assert_eq!(lines.next(), Some("Gfap\t0.5\t1.0\t2.0\t1.5\t0.01"));
    }
}
