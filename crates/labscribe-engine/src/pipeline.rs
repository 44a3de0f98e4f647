use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::ImageFormat;
use labscribe_contracts::events::EventWriter;
use labscribe_contracts::fhir::ResourceKind;
use labscribe_contracts::models::{ModelSelector, VISION};
use labscribe_contracts::records::{Artifact, SubjectFields};
use labscribe_contracts::runs::summary::{write_summary, RunSummary};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::chat::OpenAiChatBackend;
use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::convert::{Converter, OpenAiConverter};
use crate::error::RecordError;
use crate::records::{HttpRecordTransport, RecordClient, RecordTransport};
use crate::repair::{BlockReport, RepairLoop, RepairReport};
use crate::{map_object, now_utc_iso, sha256_hex};

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: String,
    pub out_dir: PathBuf,
    pub query_id: Option<String>,
    pub artifact_path: PathBuf,
    pub resource_paths: Vec<PathBuf>,
    pub summary_path: PathBuf,
    pub events_path: PathBuf,
    pub repair: RepairReport,
}

struct RunContext {
    run_id: String,
    started_at: String,
    events: EventWriter,
}

/// One subject end to end: records authority in, validated resources out.
pub struct Pipeline<T = HttpRecordTransport, C = SystemClock, V = OpenAiConverter<OpenAiChatBackend>>
{
    config: PipelineConfig,
    records: RecordClient<T, C>,
    converter: V,
}

impl Pipeline {
    pub fn from_config(mut config: PipelineConfig) -> Result<Self> {
        let selection = ModelSelector::default()
            .select(Some(&config.model.model), VISION)
            .map_err(anyhow::Error::msg)?;
        if let Some(reason) = &selection.fallback_reason {
            warn!(model = %selection.model.name, reason = %reason, "model selection fell back");
        }
        config.model.model = selection.model.name;
        let records = RecordClient::from_config(config.records.clone())?;
        let backend = OpenAiChatBackend::new(&config.model)?;
        let converter = OpenAiConverter::new(backend, &config.model, config.repair.block_policy);
        Ok(Self::new(config, records, converter))
    }
}

impl<T: RecordTransport, C: Clock, V: Converter> Pipeline<T, C, V> {
    pub fn new(config: PipelineConfig, records: RecordClient<T, C>, converter: V) -> Self {
        Self {
            config,
            records,
            converter,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&mut self, subject: &SubjectFields, cancel: &CancelToken) -> Result<PipelineReport> {
        let run = self.start_run("records")?;
        let (query_id, artifact) = match self.fetch_from_records(subject, cancel, &run.events) {
            Ok(fetched) => fetched,
            Err(err) => return Err(fail_run(&run, err)),
        };
        let artifact_path = self
            .config
            .out_dir
            .join(format!("artifact.{}", artifact_extension(&artifact.content_type)));
        if let Err(err) = fs::write(&artifact_path, &artifact.bytes) {
            let err = anyhow::Error::new(err)
                .context(format!("failed writing {}", artifact_path.display()));
            return Err(fail_run(&run, err));
        }
        run.events.emit(
            "artifact_fetched",
            map_object(json!({
                "query_id": query_id,
                "file_id": artifact.file_id,
                "content_type": artifact.content_type,
                "bytes": artifact.bytes.len(),
                "sha256": sha256_hex(&artifact.bytes),
                "path": artifact_path.to_string_lossy(),
            })),
        )?;
        self.finish(run, &artifact, artifact_path, Some(query_id), cancel)
    }

    /// Runs the repair loop on an image already on disk.
    pub fn convert_local(&mut self, path: &Path, cancel: &CancelToken) -> Result<PipelineReport> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let content_type = image::guess_format(&bytes)
            .or_else(|_| ImageFormat::from_path(path))
            .map(|format| format.to_mime_type().to_string())
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        let artifact = Artifact {
            query_id: "local".to_string(),
            file_id: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "artifact".to_string()),
            bytes,
            content_type,
        };
        let run = self.start_run("local")?;
        run.events.emit(
            "artifact_fetched",
            map_object(json!({
                "file_id": artifact.file_id,
                "content_type": artifact.content_type,
                "bytes": artifact.bytes.len(),
                "sha256": sha256_hex(&artifact.bytes),
                "path": path.to_string_lossy(),
            })),
        )?;
        self.finish(run, &artifact, path.to_path_buf(), None, cancel)
    }

    fn start_run(&self, mode: &str) -> Result<RunContext> {
        fs::create_dir_all(&self.config.out_dir)
            .with_context(|| format!("failed creating {}", self.config.out_dir.display()))?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let events = EventWriter::new(self.config.events_path(), run_id.clone());
        events.emit(
            "run_started",
            map_object(json!({
                "mode": mode,
                "model": self.config.model.model,
                "max_attempts": self.config.repair.effective_max_attempts(),
                "out_dir": self.config.out_dir.to_string_lossy(),
            })),
        )?;
        info!(run_id = %run_id, mode, "run started");
        Ok(RunContext {
            run_id,
            started_at: now_utc_iso(),
            events,
        })
    }

    fn fetch_from_records(
        &mut self,
        subject: &SubjectFields,
        cancel: &CancelToken,
        events: &EventWriter,
    ) -> Result<(String, Artifact)> {
        let credential = self.records.authenticate()?;
        events.emit(
            "authenticated",
            map_object(json!({"expires_in": credential.expires_in})),
        )?;

        let query = self.records.submit_query(subject)?;
        events.emit(
            "query_submitted",
            map_object(json!({"query_id": query.id, "status": query.status.as_str()})),
        )?;

        let poll_interval = self.records.config().poll_interval;
        let max_wait = self.records.config().max_wait;
        let query = self
            .records
            .await_completion(&query.id, poll_interval, max_wait, cancel)?;
        let files: Vec<&str> = query.files.iter().map(|file| file.id.as_str()).collect();
        events.emit(
            "query_completed",
            map_object(json!({"query_id": query.id, "files": files})),
        )?;

        let file_id = match self.config.file_id.clone() {
            Some(file_id) => file_id,
            None => query
                .files
                .first()
                .map(|file| file.id.clone())
                .ok_or_else(|| RecordError::ArtifactFetch {
                    status: 0,
                    message: format!("query {} lists no files", query.id),
                })?,
        };
        let artifact = self.records.fetch_artifact(&query, &file_id)?;
        Ok((query.id, artifact))
    }

    fn finish(
        &self,
        run: RunContext,
        artifact: &Artifact,
        artifact_path: PathBuf,
        query_id: Option<String>,
        cancel: &CancelToken,
    ) -> Result<PipelineReport> {
        let repair = match RepairLoop::new(&self.converter)
            .with_events(&run.events)
            .run(
                artifact,
                &self.config.repair.instruction,
                self.config.repair.max_attempts,
                cancel,
            ) {
            Ok(report) => report,
            Err(err) => return Err(fail_run(&run, err)),
        };

        let (resource_paths, summary_path) =
            match self.write_outputs(&run, artifact, query_id.as_deref(), &repair) {
                Ok(paths) => paths,
                Err(err) => return Err(fail_run(&run, err)),
            };

        run.events.emit(
            "run_finished",
            map_object(json!({
                "outcome": repair.outcome.as_str(),
                "attempts": repair.attempts,
                "valid": repair.valid.len(),
                "invalid": repair.invalid.len(),
                "summary": summary_path.to_string_lossy(),
            })),
        )?;
        info!(
            run_id = %run.run_id,
            outcome = repair.outcome.as_str(),
            resources = resource_paths.len(),
            "run finished"
        );

        Ok(PipelineReport {
            run_id: run.run_id,
            out_dir: self.config.out_dir.clone(),
            query_id,
            artifact_path,
            resource_paths,
            summary_path,
            events_path: run.events.path().to_path_buf(),
            repair,
        })
    }

    /// Writes `resources/NN-<kind>.json` for each valid block, then `summary.json`.
    fn write_outputs(
        &self,
        run: &RunContext,
        artifact: &Artifact,
        query_id: Option<&str>,
        repair: &RepairReport,
    ) -> Result<(Vec<PathBuf>, PathBuf)> {
        let out_dir = &self.config.out_dir;
        clear_resources(&out_dir.join("resources"))?;
        let mut resource_paths = Vec::new();
        let mut valid_rows = Vec::new();
        for (position, block) in repair.valid.iter().enumerate() {
            let relative = format!("resources/{:02}-{}.json", position + 1, resource_stem(block));
            let path = out_dir.join(&relative);
            write_resource(&path, block)?;
            valid_rows.push(map_object(json!({
                "index": block.index,
                "kind": block.kind().map(ResourceKind::as_str),
                "path": relative,
                "attempt": block.attempt,
                "repairs": block.repairs,
            })));
            resource_paths.push(path);
        }
        let invalid_rows: Vec<Map<String, Value>> = repair
            .invalid
            .iter()
            .map(|block| {
                map_object(json!({
                    "index": block.index,
                    "kind": block.kind().map(ResourceKind::as_str),
                    "message": block.result.message,
                    "payload": block.payload,
                }))
            })
            .collect();

        let summary = RunSummary {
            run_id: run.run_id.clone(),
            started_at: run.started_at.clone(),
            finished_at: now_utc_iso(),
            outcome: repair.outcome.as_str().to_string(),
            attempts: u64::from(repair.attempts),
            valid: valid_rows,
            invalid: invalid_rows,
        };
        let summary_path = out_dir.join("summary.json");
        let extra = map_object(json!({
            "query_id": query_id,
            "file_id": artifact.file_id,
            "content_type": artifact.content_type,
            "artifact_sha256": sha256_hex(&artifact.bytes),
            "model": self.config.model.model,
        }));
        write_summary(&summary_path, &summary, Some(&extra))
            .with_context(|| format!("failed writing {}", summary_path.display()))?;
        Ok((resource_paths, summary_path))
    }
}

/// Records the failure as the run's last event and hands the error back.
fn fail_run(run: &RunContext, err: impl Into<anyhow::Error>) -> anyhow::Error {
    let err = err.into();
    warn!(run_id = %run.run_id, error = %format!("{err:#}"), "run failed");
    if let Err(emit_err) = run.events.emit(
        "run_finished",
        map_object(json!({"outcome": "ERROR", "error": format!("{err:#}")})),
    ) {
        warn!(error = %emit_err, "failed to write run event");
    }
    err
}

/// Removes resource files left by an earlier run in the same output directory.
fn clear_resources(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("failed reading {}", dir.display())),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            fs::remove_file(&path)
                .with_context(|| format!("failed removing stale {}", path.display()))?;
        }
    }
    Ok(())
}

fn write_resource(path: &Path, block: &BlockReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = match &block.value {
        Some(value) => serde_json::to_string_pretty(value)?,
        None => block.payload.clone(),
    };
    fs::write(path, text).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}

fn resource_stem(block: &BlockReport) -> &'static str {
    match block.kind() {
        Some(ResourceKind::Observation) => "observation",
        Some(ResourceKind::DiagnosticReport) => "diagnostic-report",
        _ => "resource",
    }
}

fn artifact_extension(content_type: &str) -> &'static str {
    let mime = content_type.trim().to_ascii_lowercase();
    if mime == "application/pdf" {
        return "pdf";
    }
    ImageFormat::from_mime_type(&mime)
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("bin")
}
