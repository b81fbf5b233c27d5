use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;

/// Per-gene batch analyses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnalysisStage {
    ScoreTest,
    Fit,
}

impl AnalysisStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::ScoreTest => "interaction score test",
            Self::Fit => "variance-component fit",
        }
    }
}

impl fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for batch progress. Genes finish on worker threads in any order.
pub trait ProgressObserver: Sync {
    fn on_start(&self, stage: AnalysisStage, total_genes: usize) {
        let _ = (stage, total_genes);
    }
    fn on_gene_finished(&self, stage: AnalysisStage, gene: &str) {
        let _ = (stage, gene);
    }
    fn on_finish(&self, stage: AnalysisStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}

/// Terminal progress bar; hidden when stderr is not a terminal.
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatifProgress {
    pub fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(None, draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl ProgressObserver for IndicatifProgress {
    fn on_start(&self, stage: AnalysisStage, total_genes: usize) {
        self.bar.reset();
        self.bar.set_length(total_genes as u64);
        self.bar.set_message(stage.describe());
    }

    fn on_gene_finished(&self, _stage: AnalysisStage, _gene: &str) {
        self.bar.inc(1);
    }

    fn on_finish(&self, stage: AnalysisStage) {
        self.bar.finish_with_message(format!("{} complete", stage));
    }
}
