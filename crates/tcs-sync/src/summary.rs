//! Run summaries and where they are published.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tcs_core::{CommitResult, SourceKind};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub kind: SourceKind,
    pub status: SourceStatus,
    pub fetched_bytes: usize,
    pub candidates: usize,
    pub inserted: usize,
    pub updated: usize,
    pub noop: usize,
    pub archived: usize,
    pub skipped_parse: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
}

impl SourceOutcome {
    pub fn new(source_id: &str, kind: SourceKind) -> Self {
        Self {
            source_id: source_id.to_string(),
            kind,
            status: SourceStatus::Succeeded,
            fetched_bytes: 0,
            candidates: 0,
            inserted: 0,
            updated: 0,
            noop: 0,
            archived: 0,
            skipped_parse: 0,
            conflicts: 0,
            errors: Vec::new(),
        }
    }

    pub fn record_commit(&mut self, result: CommitResult) {
        self.inserted = result.inserted;
        self.updated = result.updated;
        self.noop = result.noop;
        self.archived = result.archived;
    }

    /// Nothing from a failed source is reported as persisted.
    pub fn fail(&mut self, error: impl std::fmt::Display) {
        self.status = SourceStatus::Failed;
        self.inserted = 0;
        self.updated = 0;
        self.noop = 0;
        self.archived = 0;
        self.errors.push(error.to_string());
    }

    pub fn succeeded(&self) -> bool {
        self.status == SourceStatus::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sources: Vec<SourceOutcome>,
}

impl RunSummary {
    pub fn source(&self, source_id: &str) -> Option<&SourceOutcome> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| !s.succeeded())
            .map(|s| s.source_id.as_str())
            .collect()
    }

    pub fn totals(&self) -> CommitResult {
        self.sources.iter().fold(CommitResult::default(), |acc, s| CommitResult {
            inserted: acc.inserted + s.inserted,
            updated: acc.updated + s.updated,
            noop: acc.noop + s.noop,
            archived: acc.archived + s.archived,
        })
    }

    pub fn to_markdown(&self) -> String {
        let totals = self.totals();
        let mut lines = vec![
            "# Tournament Sync Run".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Duration: {} ms", self.duration_ms),
            format!(
                "- Totals: {} inserted, {} updated, {} unchanged, {} archived",
                totals.inserted, totals.updated, totals.noop, totals.archived
            ),
            String::new(),
            "## Sources".to_string(),
            String::new(),
            concat!(
                "| source | kind | status | bytes | candidates | skipped ",
                "| inserted | updated | unchanged | archived | conflicts |"
            )
            .to_string(),
            "|---|---|---|---|---|---|---|---|---|---|---|".to_string(),
        ];
        for s in &self.sources {
            lines.push(format!(
                "| {} | {} | {:?} | {} | {} | {} | {} | {} | {} | {} | {} |",
                s.source_id,
                s.kind,
                s.status,
                s.fetched_bytes,
                s.candidates,
                s.skipped_parse,
                s.inserted,
                s.updated,
                s.noop,
                s.archived,
                s.conflicts
            ));
        }
        let failures = self
            .sources
            .iter()
            .flat_map(|s| s.errors.iter().map(move |e| format!("- `{}`: {e}", s.source_id)))
            .collect::<Vec<_>>();
        if !failures.is_empty() {
            lines.push(String::new());
            lines.push("## Errors".to_string());
            lines.push(String::new());
            lines.extend(failures);
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Monitoring collaborator that receives every completed run.
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn publish(&self, summary: &RunSummary) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LogSummarySink;

#[async_trait]
impl SummarySink for LogSummarySink {
    async fn publish(&self, summary: &RunSummary) -> Result<()> {
        for s in &summary.sources {
            if s.succeeded() {
                info!(
                    run_id = %summary.run_id,
                    source_id = %s.source_id,
                    candidates = s.candidates,
                    skipped = s.skipped_parse,
                    inserted = s.inserted,
                    updated = s.updated,
                    noop = s.noop,
                    archived = s.archived,
                    conflicts = s.conflicts,
                    "source synced"
                );
            } else {
                warn!(
                    run_id = %summary.run_id,
                    source_id = %s.source_id,
                    errors = ?s.errors,
                    "source failed"
                );
            }
        }
        info!(
            run_id = %summary.run_id,
            duration_ms = summary.duration_ms,
            failed = summary.failed_sources().len(),
            "sync run finished"
        );
        Ok(())
    }
}

/// Writes `<root>/<run_id>/run_summary.json` and `summary.md`.
#[derive(Debug, Clone)]
pub struct ReportDirSink {
    root: PathBuf,
}

impl ReportDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }
}

#[async_trait]
impl SummarySink for ReportDirSink {
    async fn publish(&self, summary: &RunSummary) -> Result<()> {
        let dir = self.run_dir(summary.run_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;
        fs::write(dir.join("summary.md"), summary.to_markdown())
            .await
            .context("writing summary.md")?;
        Ok(())
    }
}

/// Markdown digest of the newest `runs` summaries under `reports_dir`.
pub fn report_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
    {
        let entry = entry.with_context(|| format!("listing {}", reports_dir.display()))?;
        let path = entry.path().join("run_summary.json");
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Tournament Sync Report".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for summary in summaries.into_iter().take(runs.max(1)) {
        let totals = summary.totals();
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- duration: {} ms", summary.duration_ms));
        lines.push(format!(
            "- inserted {} / updated {} / unchanged {} / archived {}",
            totals.inserted, totals.updated, totals.noop, totals.archived
        ));
        let failed = summary.failed_sources();
        if failed.is_empty() {
            lines.push("- all sources succeeded".to_string());
        } else {
            lines.push(format!("- failed sources: {}", failed.join(", ")));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
