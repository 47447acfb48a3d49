pub mod coordinator;
mod run;
pub mod select;
mod stages;

pub use run::Run;

use crate::config::RunConfig;
use crate::logging::RunLog;
use crate::models::{EnrichedProduct, RunResult, RunStatus, Stage};
use crate::providers::{Providers, SearchRequest};
use crate::report::ReportContext;
use coordinator::BatchPolicy;
use run::Artifact;
use select::SelectionCriteria;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Drives one query through discovery, enrichment, collection, analysis and
/// rendering.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<RunConfig>,
    providers: Providers,
    run_log: Option<RunLog>,
}

impl Pipeline {
    pub fn new(config: RunConfig, providers: Providers) -> Self {
        Self {
            config: Arc::new(config),
            providers,
            run_log: None,
        }
    }

    /// Mirrors the run's events into `pipeline.log` inside its directory.
    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    /// Validates the config, claims a run directory and executes every stage.
    ///
    /// Errors are only returned when no run directory could be set up; any
    /// later failure is reported through [`RunResult::failure`].
    pub async fn run(&self) -> Result<RunResult, PipelineError> {
        self.config
            .validate()
            .map_err(|err| PipelineError::validation(Stage::Discovery, err.to_string()))?;
        let mut run = Run::create(&self.config).await?;
        if let Some(run_log) = &self.run_log
            && let Err(err) = run_log.attach(run.dir())
        {
            warn!(target = "insights.pipeline", run_id = run.id(), error = %err, "run log unavailable");
        }
        let result = self.execute(&mut run).await;
        if let Some(run_log) = &self.run_log {
            run_log.detach();
        }
        Ok(result)
    }

    pub async fn execute(&self, run: &mut Run) -> RunResult {
        info!(
            target = "insights.pipeline",
            run_id = run.id(),
            query = %self.config.query,
            review_source = self.providers.reviews.name(),
            "run started"
        );
        let outcome = self.drive(run).await;
        if let Err(err) = &outcome {
            error!(
                target = "insights.pipeline",
                run_id = run.id(),
                stage = %err.stage(),
                kind = %err.kind(),
                error = %err,
                "run failed"
            );
        }

        let mut result = run.finish(&outcome);
        if let Err(fault) = run.write_manifest(&result).await {
            result.faults.push(fault);
        }
        if result.status == RunStatus::Completed {
            info!(
                target = "insights.pipeline",
                run_id = run.id(),
                saved_stages = run.completed().len(),
                faults = run.faults().len(),
                dir = %result.run_directory.display(),
                "run completed"
            );
        }
        result
    }

    async fn drive(&self, run: &mut Run) -> Result<PathBuf, PipelineError> {
        let config = &self.config;
        let request = SearchRequest::from_config(config);
        let criteria = SelectionCriteria::from_config(config);
        let domain = request.amazon_domain.as_str();

        let selected = run
            .capture_stage(
                Stage::Discovery,
                stages::discover(self.providers.search.as_ref(), &request, &criteria),
            )
            .await?;
        if selected.is_empty() {
            return Err(PipelineError::provider(
                Stage::Discovery,
                "no search result passed the selection filters",
            ));
        }
        let mut products: Vec<EnrichedProduct> =
            selected.into_iter().map(EnrichedProduct::new).collect();

        let details = run
            .capture_stage(
                Stage::Enrichment,
                stages::enrich(
                    self.providers.detail.as_ref(),
                    &products,
                    domain,
                    BatchPolicy::parallel(config.timeouts.enrichment),
                ),
            )
            .await?;
        for (product, detail) in products.iter_mut().zip(details) {
            if let Some(detail) = detail {
                product.attach_detail(detail);
            }
        }

        let reviews = run
            .capture_stage(
                Stage::Collection,
                stages::collect_reviews(
                    self.providers.reviews.as_ref(),
                    &products,
                    domain,
                    BatchPolicy::sequential(config.timeouts.collection),
                ),
            )
            .await?;
        for (product, reviews) in products.iter_mut().zip(reviews) {
            if let Some(reviews) = reviews {
                product.attach_reviews(reviews);
            }
        }

        let analyses = run
            .capture_stage(
                Stage::Analysis,
                stages::analyze(
                    self.providers.analysis.as_ref(),
                    &products,
                    BatchPolicy::parallel(config.timeouts.analysis),
                ),
            )
            .await?;
        for (product, analysis) in products.iter_mut().zip(analyses) {
            if let Some(analysis) = analysis {
                product.attach_analysis(analysis);
            }
        }

        let context = ReportContext::from_config(config);
        run.capture_stage(Stage::Rendering, stages::render(&context, &products))
            .await?;
        Ok(run.dir().join("report.html"))
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed ({kind}): {message}")]
pub struct PipelineError {
    stage: Stage,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    Provider,
    Timeout,
    Persistence,
    Validation,
    Render,
}

impl fmt::Display for PipelineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineErrorKind::Provider => "provider",
            PipelineErrorKind::Timeout => "timeout",
            PipelineErrorKind::Persistence => "persistence",
            PipelineErrorKind::Validation => "validation",
            PipelineErrorKind::Render => "render",
        })
    }
}

impl PipelineError {
    fn new(stage: Stage, kind: PipelineErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn provider(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Provider, message)
    }

    pub fn timeout(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Timeout, message)
    }

    pub fn persistence(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Persistence, message)
    }

    pub fn validation(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Validation, message)
    }

    pub fn render(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Render, message)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// What a stage hands back to the runner: the value for the next stage, the
/// files to persist and a short JSON summary for the run manifest.
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub artifacts: Vec<Artifact>,
    pub summary: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, artifacts: Vec<Artifact>, summary: Value) -> Self {
        Self {
            value,
            artifacts,
            summary,
        }
    }
}
