#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use svca::config::AnalysisConfig;
use svca::data::{load_coordinates, load_expression};
use svca::params::ParameterStore;
use svca::pipeline::{
    GeneFailure, fit_spatial_interactions, test_spatial_interactions, write_failures, write_fits,
    write_score_tests,
};
use svca::progress::IndicatifProgress;

#[derive(Parser)]
#[command(
    name = "svca",
    about = "Spatial variance component analysis of gene expression",
    long_about = "Decomposes each gene's expression variance into intrinsic, cell-cell interaction \
                  and noise components, or screens genes for interactions with a score test."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct InputArgs {
    /// Expression TSV: observation id column followed by one count column per gene
    #[arg(long, value_name = "PATH")]
    expression: PathBuf,

    /// Coordinates TSV: observation id column followed by one column per spatial axis
    #[arg(long, value_name = "PATH")]
    coordinates: PathBuf,

    /// Optional TOML file with analysis and optimizer settings
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of spectral kernel components (overrides the config file)
    #[arg(long, allow_negative_numbers = true)]
    ncomponents: Option<i64>,

    /// One length-scale and period per spatial axis (overrides the config file)
    #[arg(long)]
    ard: bool,

    /// Output TSV for per-gene results
    #[arg(long, short, value_name = "PATH")]
    output: PathBuf,

    /// Where to write genes that failed, if any
    #[arg(long, value_name = "PATH")]
    failures: Option<PathBuf>,

    /// Save the fitted per-gene parameters to this TOML file
    #[arg(long, value_name = "PATH")]
    save_params: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score-test every gene for a spatial interaction component
    #[command(about = "Score test for interactions (outputs: gene, pval, padj, ...)")]
    Test {
        #[command(flatten)]
        input: InputArgs,
    },

    /// Fit the full model and report variance fractions
    #[command(about = "Fit variance components (outputs: gene, intrinsic, interaction, noise, ...)")]
    Fit {
        #[command(flatten)]
        input: InputArgs,

        /// Genes to fit; all genes when omitted
        #[arg(long, value_delimiter = ',')]
        genes: Option<Vec<String>>,

        /// Stored parameters from an earlier run; the kernel is then held fixed
        #[arg(long, value_name = "PATH")]
        params: Option<PathBuf>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Test { input } => test_command(&input),
        Commands::Fit {
            input,
            genes,
            params,
        } => fit_command(&input, genes.as_deref(), params.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(input: &InputArgs) -> Result<AnalysisConfig, Box<dyn std::error::Error>> {
    let mut config = match &input.config {
        Some(path) => AnalysisConfig::load(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(n) = input.ncomponents {
        config.ncomponents = n;
    }
    if input.ard {
        config.ard = true;
    }
    Ok(config)
}

fn report_failures(input: &InputArgs, failures: &[GeneFailure]) -> Result<(), Box<dyn std::error::Error>> {
    if failures.is_empty() {
        return Ok(());
    }
    eprintln!("{} gene(s) failed.", failures.len());
    if let Some(path) = &input.failures {
        write_failures(path, failures)?;
    }
    Ok(())
}

fn test_command(input: &InputArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(input)?;
    let expression = load_expression(&input.expression)?;
    let coordinates = load_coordinates(&input.coordinates, &expression)?;
    let progress = IndicatifProgress::new();

    let output = test_spatial_interactions(&expression, coordinates, None, &config, &progress)?;
    write_score_tests(&input.output, &output.records)?;
    if let Some(path) = &input.save_params {
        output.parameters.save(path)?;
    }
    report_failures(input, &output.failures)?;
    println!(
        "Tested {} genes; results written to {}",
        output.records.len(),
        input.output.display()
    );
    Ok(())
}

fn fit_command(
    input: &InputArgs,
    genes: Option<&[String]>,
    params: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(input)?;
    let expression = load_expression(&input.expression)?;
    let coordinates = load_coordinates(&input.coordinates, &expression)?;
    let stored = params.map(ParameterStore::load).transpose()?;
    let progress = IndicatifProgress::new();

    let output = fit_spatial_interactions(
        &expression,
        coordinates,
        genes,
        None,
        &config,
        stored.as_ref(),
        &progress,
    )?;
    write_fits(&input.output, &output.records)?;
    if let Some(path) = &input.save_params {
        output.parameters.save(path)?;
    }
    report_failures(input, &output.failures)?;
    println!(
        "Fitted {} genes; results written to {}",
        output.records.len(),
        input.output.display()
    );
    Ok(())
}
