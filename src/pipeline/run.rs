use super::{PipelineError, StageOutcome};
use crate::config::RunConfig;
use crate::models::{
    PersistenceFault, RunFailure, RunResult, RunStatus, Stage, StageReport,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

const SLUG_MAX_CHARS: usize = 30;
const MANIFEST: &str = "run.json";

/// One file a stage wants written into the run directory.
#[derive(Debug)]
pub struct Artifact {
    file_name: String,
    body: Result<Vec<u8>, String>,
    required: bool,
}

impl Artifact {
    /// Pretty JSON. An encoding failure is reported like a failed write.
    pub fn json<S: Serialize + ?Sized>(name: &str, value: &S) -> Self {
        Self {
            file_name: format!("{name}.json"),
            body: serde_json::to_vec_pretty(value).map_err(|err| err.to_string()),
            required: false,
        }
    }

    /// The rendered report; losing it fails the stage.
    pub fn html(name: &str, html: String) -> Self {
        Self {
            file_name: format!("{name}.html"),
            body: Ok(html.into_bytes()),
            required: true,
        }
    }

    /// Turns a failed write of this artifact into a stage failure.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// The on-disk side of one pipeline execution.
///
/// The id and directory are fixed at creation. Afterwards the run only grows:
/// stage reports, completed stages and persistence faults are appended as
/// stages finish.
#[derive(Debug)]
pub struct Run {
    id: String,
    dir: PathBuf,
    started_at: DateTime<Utc>,
    completed: Vec<Stage>,
    reports: Vec<StageReport>,
    faults: Vec<PersistenceFault>,
}

impl Run {
    /// Claims a fresh directory under `output.base_dir` and snapshots the
    /// config into it.
    pub async fn create(config: &RunConfig) -> Result<Self, PipelineError> {
        let started_at = Utc::now();
        let base_id = run_id(started_at, config.output.prefix.as_deref(), &config.query);
        let base_dir = &config.output.base_dir;
        tokio::fs::create_dir_all(base_dir).await.map_err(|err| {
            PipelineError::persistence(
                Stage::Discovery,
                format!("cannot create {}: {err}", base_dir.display()),
            )
        })?;

        let (id, dir) = claim_dir(base_dir, &base_id).await?;
        info!(target = "insights.pipeline", run_id = %id, dir = %dir.display(), "run directory created");

        let mut run = Self {
            id,
            dir,
            started_at,
            completed: Vec::new(),
            reports: Vec::new(),
            faults: Vec::new(),
        };
        run.snapshot(config).await?;
        Ok(run)
    }

    /// Writes `config.json`. Unlike stage outputs, a failed write is fatal.
    async fn snapshot(&mut self, config: &RunConfig) -> Result<(), PipelineError> {
        self.persist(Stage::Discovery, Artifact::json("config", config).required())
            .await
            .map(|_| ())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn completed(&self) -> &[Stage] {
        &self.completed
    }

    pub fn faults(&self) -> &[PersistenceFault] {
        &self.faults
    }

    /// Runs one stage, times it and writes its artifacts.
    ///
    /// An operation error is returned as is. A failed optional write is
    /// recorded as a fault and the value is still returned; the stage only
    /// counts as completed when every artifact reached disk.
    pub async fn capture_stage<T, Fut>(&mut self, stage: Stage, fut: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        debug!(target = "insights.pipeline", run_id = %self.id, stage = %stage, "stage started");
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(stage.as_str(), elapsed_ms);

        let mut names = Vec::with_capacity(outcome.artifacts.len());
        let mut saved = true;
        for artifact in outcome.artifacts {
            names.push(artifact.file_name.clone());
            saved &= self.persist(stage, artifact).await?;
        }
        if saved {
            self.completed.push(stage);
        }
        info!(target = "insights.pipeline", run_id = %self.id, stage = %stage, elapsed_ms, saved, "stage finished");
        self.reports
            .push(StageReport::new(stage, names, elapsed_ms, saved, outcome.summary));
        Ok(outcome.value)
    }

    async fn persist(&mut self, stage: Stage, artifact: Artifact) -> Result<bool, PipelineError> {
        let path = self.dir.join(&artifact.file_name);
        let written = match artifact.body {
            Ok(bytes) => tokio::fs::write(&path, bytes)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(format!("encoding failed: {err}")),
        };
        match written {
            Ok(()) => {
                debug!(target = "insights.pipeline", stage = %stage, path = %path.display(), "artifact saved");
                Ok(true)
            }
            Err(message) if artifact.required => Err(PipelineError::persistence(
                stage,
                format!("{}: {message}", path.display()),
            )),
            Err(message) => {
                warn!(
                    target = "insights.pipeline",
                    stage = %stage,
                    path = %path.display(),
                    error = %message,
                    "artifact not saved, continuing with in-memory result"
                );
                self.faults.push(PersistenceFault {
                    stage,
                    artifact: artifact.file_name,
                    message,
                });
                Ok(false)
            }
        }
    }

    pub fn finish(&self, outcome: &Result<PathBuf, PipelineError>) -> RunResult {
        let (status, failure, report) = match outcome {
            Ok(report) => (RunStatus::Completed, None, Some(report.clone())),
            Err(err) => (
                RunStatus::Failed,
                Some(RunFailure {
                    stage: err.stage(),
                    kind: err.kind().to_string(),
                    detail: err.detail().to_string(),
                }),
                None,
            ),
        };
        RunResult {
            run_id: self.id.clone(),
            status,
            run_directory: self.dir.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            completed: self.completed.clone(),
            stages: self.reports.clone(),
            faults: self.faults.clone(),
            failure,
            report,
        }
    }

    /// Writes `run.json`. A failure here is returned as a fault for the
    /// caller to attach to the result.
    pub async fn write_manifest(&self, result: &RunResult) -> Result<(), PersistenceFault> {
        let path = self.dir.join(MANIFEST);
        let stage = result
            .failure
            .as_ref()
            .map(|failure| failure.stage)
            .unwrap_or(Stage::Rendering);
        let fault = |message: String| PersistenceFault {
            stage,
            artifact: MANIFEST.to_string(),
            message,
        };
        let body = serde_json::to_vec_pretty(result).map_err(|err| fault(err.to_string()))?;
        tokio::fs::write(&path, body).await.map_err(|err| {
            warn!(target = "insights.pipeline", path = %path.display(), error = %err, "run manifest not saved");
            fault(err.to_string())
        })
    }
}

/// `[prefix-]YYYYMMDD-HHMMSS-<slug>`, UTC.
pub fn run_id(started_at: DateTime<Utc>, prefix: Option<&str>, query: &str) -> String {
    let stamp = started_at.format("%Y%m%d-%H%M%S").to_string();
    let mut id = match prefix.map(str::trim).filter(|prefix| !prefix.is_empty()) {
        Some(prefix) => format!("{prefix}-{stamp}"),
        None => stamp,
    };
    let slug = query_slug(query);
    if !slug.is_empty() {
        id.push('-');
        id.push_str(&slug);
    }
    id
}

/// Alphanumerics and spaces survive; words are joined with `-`.
fn query_slug(query: &str) -> String {
    let kept: String = query
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    let joined = kept.split_whitespace().collect::<Vec<_>>().join("-");
    joined
        .chars()
        .take(SLUG_MAX_CHARS)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

async fn claim_dir(base_dir: &Path, base_id: &str) -> Result<(String, PathBuf), PipelineError> {
    let mut attempt = 1;
    loop {
        let id = if attempt == 1 {
            base_id.to_string()
        } else {
            format!("{base_id}-{attempt}")
        };
        let dir = base_dir.join(&id);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => return Ok((id, dir)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists && attempt < 100 => attempt += 1,
            Err(err) => {
                return Err(PipelineError::persistence(
                    Stage::Discovery,
                    format!("cannot create {}: {err}", dir.display()),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineErrorKind;
    use chrono::TimeZone;
    use serde_json::json;

    fn config(base: &Path) -> RunConfig {
        let mut config =
            RunConfig::from_yaml("query: \"Kids' water bottle (BPA free!)\"\namazon_domain: amazon.com\n")
                .expect("config");
        config.output.base_dir = base.to_path_buf();
        config
    }

    #[test]
    fn run_id_format() {
        let at = Utc.with_ymd_and_hms(2024, 11, 5, 9, 30, 7).unwrap();
        assert_eq!(
            run_id(at, None, "wireless  earbuds"),
            "20241105-093007-wireless-earbuds"
        );
        assert_eq!(
            run_id(at, Some("au"), "Kids' water bottle (BPA free!)"),
            "au-20241105-093007-Kids-water-bottle-BPA-free"
        );
        assert_eq!(run_id(at, Some(" "), "!!!"), "20241105-093007");
    }

    #[test]
    fn slug_is_capped() {
        let slug = query_slug("ergonomic mechanical keyboard with wrist rest");
        assert_eq!(slug, "ergonomic-mechanical-keyboard");
        assert!(slug.chars().count() <= SLUG_MAX_CHARS);
    }

    #[tokio::test]
    async fn create_claims_unique_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let first = Run::create(&config).await.expect("first");
        let second = Run::create(&config).await.expect("second");
        assert_ne!(first.dir(), second.dir());
        assert!(first.dir().join("config.json").is_file());
        assert!(first.faults().is_empty());
    }

    #[tokio::test]
    async fn capture_stage_persists_and_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::create(&config(tmp.path())).await.unwrap();
        let value = run
            .capture_stage(Stage::Enrichment, async {
                Ok(StageOutcome::new(
                    7,
                    vec![Artifact::json("enrichment-output", &json!({"B1": {"rank": 1}}))],
                    json!({"items": 1}),
                ))
            })
            .await
            .expect("stage");

        assert_eq!(value, 7);
        assert_eq!(run.completed(), &[Stage::Enrichment]);
        let saved: serde_json::Value = serde_json::from_slice(
            &std::fs::read(run.dir().join("enrichment-output.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved["B1"]["rank"], 1);
    }

    #[tokio::test]
    async fn failed_optional_write_is_a_fault() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::create(&config(tmp.path())).await.unwrap();
        // A directory squatting on the artifact path makes the write fail.
        std::fs::create_dir(run.dir().join("collection-output.json")).unwrap();

        let value = run
            .capture_stage(Stage::Collection, async {
                Ok(StageOutcome::new(
                    "in memory",
                    vec![Artifact::json("collection-output", &json!([]))],
                    json!({}),
                ))
            })
            .await
            .expect("value survives");

        assert_eq!(value, "in memory");
        assert!(run.completed().is_empty());
        assert_eq!(run.faults().len(), 1);
        assert_eq!(run.faults()[0].stage, Stage::Collection);
        assert_eq!(run.faults()[0].artifact, "collection-output.json");
        let result = run.finish(&Ok(run.dir().join("report.html")));
        assert!(result.partially_saved());
        assert!(!result.stages[0].saved);
    }

    #[tokio::test]
    async fn failed_required_write_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::create(&config(tmp.path())).await.unwrap();
        std::fs::create_dir(run.dir().join("report.html")).unwrap();

        let err = run
            .capture_stage(Stage::Rendering, async {
                Ok(StageOutcome::new((), vec![Artifact::html("report", "<html></html>".into())], json!({})))
            })
            .await
            .expect_err("report write must fail");
        assert_eq!(err.kind(), PipelineErrorKind::Persistence);
        assert_eq!(err.stage(), Stage::Rendering);
    }

    #[tokio::test]
    async fn failed_config_snapshot_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let mut run = Run::create(&config).await.unwrap();
        std::fs::remove_file(run.dir().join("config.json")).unwrap();
        std::fs::create_dir(run.dir().join("config.json")).unwrap();

        let err = run.snapshot(&config).await.expect_err("snapshot must fail");
        assert_eq!(err.kind(), PipelineErrorKind::Persistence);
        assert_eq!(err.stage(), Stage::Discovery);
        assert!(run.faults().is_empty());
    }

    #[tokio::test]
    async fn operation_error_propagates_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::create(&config(tmp.path())).await.unwrap();
        let err = run
            .capture_stage::<(), _>(Stage::Discovery, async {
                Err(PipelineError::provider(Stage::Discovery, "search unavailable"))
            })
            .await
            .expect_err("propagates");
        assert_eq!(err.kind(), PipelineErrorKind::Provider);
        assert!(run.completed().is_empty());

        let result = run.finish(&Err(err));
        assert_eq!(result.status, RunStatus::Failed);
        run.write_manifest(&result).await.expect("manifest");
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run.dir().join("run.json")).unwrap()).unwrap();
        assert_eq!(manifest["status"], "failed");
        assert_eq!(manifest["failure"]["stage"], "discovery");
        assert_eq!(manifest["failure"]["kind"], "provider");
    }
}
