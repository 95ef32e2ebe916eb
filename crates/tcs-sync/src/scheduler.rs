//! Run orchestration: the per-run pipeline and the periodic scheduler around it.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tcs_adapters::parser_for_kind;
use tcs_core::SourceConfig;
use tcs_storage::{PayloadFetcher, PersistenceGateway};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::Reconciler;
use crate::summary::{RunSummary, SourceOutcome, SummarySink};
use crate::SourceError;

/// One fetch → parse → reconcile → commit cycle over every enabled source.
#[derive(Clone)]
pub struct SyncPipeline {
    sources: Arc<Vec<SourceConfig>>,
    fetcher: Arc<dyn PayloadFetcher>,
    gateway: Arc<dyn PersistenceGateway>,
    reconciler: Arc<Reconciler>,
    /// Serializes reconcile + commit so each source sees its siblings' writes.
    reconcile_gate: Arc<Mutex<()>>,
    run_timeout: Duration,
}

impl SyncPipeline {
    pub fn new(
        sources: Vec<SourceConfig>,
        fetcher: Arc<dyn PayloadFetcher>,
        gateway: Arc<dyn PersistenceGateway>,
        reconciler: Reconciler,
        run_timeout: Duration,
    ) -> Self {
        Self {
            sources: Arc::new(sources),
            fetcher,
            gateway,
            reconciler: Arc::new(reconciler),
            reconcile_gate: Arc::new(Mutex::new(())),
            run_timeout,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    pub async fn run_once(&self) -> RunSummary {
        self.run_once_at(Utc::now()).await
    }

    /// Runs every enabled source concurrently, stamping writes with `now`.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = tokio::time::Instant::now() + self.run_timeout;
        let span = info_span!("sync_run", %run_id);

        async {
            let handles = self
                .sources
                .iter()
                .filter(|s| s.enabled)
                .map(|source| {
                    let pipeline = self.clone();
                    let source = source.clone();
                    let task_source = source.clone();
                    let task = async move { pipeline.run_source(&task_source, now).await };
                    let handle: JoinHandle<SourceOutcome> =
                        tokio::spawn(task.in_current_span());
                    (source, handle)
                })
                .collect::<Vec<_>>();
            info!(sources = handles.len(), "sync run started");

            let mut outcomes = Vec::with_capacity(handles.len());
            for (source, mut handle) in handles {
                let outcome = match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(join_err)) => {
                        let mut outcome = SourceOutcome::new(&source.source_id, source.kind);
                        outcome.fail(SourceError::TaskFailed(join_err.to_string()));
                        outcome
                    }
                    Err(_) => {
                        // Dropping the in-flight commit rolls it back.
                        handle.abort();
                        warn!(source_id = %source.source_id, "source exceeded the run deadline");
                        let mut outcome = SourceOutcome::new(&source.source_id, source.kind);
                        outcome.fail(SourceError::DeadlineExceeded);
                        outcome
                    }
                };
                outcomes.push(outcome);
            }

            RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
                sources: outcomes,
            }
        }
        .instrument(span)
        .await
    }

    async fn run_source(&self, source: &SourceConfig, now: DateTime<Utc>) -> SourceOutcome {
        let span = info_span!("source_sync", source_id = %source.source_id, kind = %source.kind);
        async {
            let mut outcome = SourceOutcome::new(&source.source_id, source.kind);
            if let Err(err) = self.sync_source(source, now, &mut outcome).await {
                warn!(error = %err, "source sync failed");
                outcome.fail(err);
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn sync_source(
        &self,
        source: &SourceConfig,
        now: DateTime<Utc>,
        outcome: &mut SourceOutcome,
    ) -> Result<(), SourceError> {
        let payload = self.fetcher.fetch(source).await?;
        outcome.fetched_bytes = payload.body.len();

        let parsed = parser_for_kind(source.kind).parse(&payload)?;
        outcome.candidates = parsed.candidates.len();
        outcome.skipped_parse = parsed.skipped;
        if parsed.skipped > 0 {
            warn!(skipped = parsed.skipped, "skipped malformed entries");
        }

        let _gate = self.reconcile_gate.lock().await;
        let batch = self
            .reconciler
            .reconcile(&source.source_id, &parsed.candidates, &*self.gateway, now)
            .await?;
        outcome.conflicts = batch.conflicts.len();
        let committed = self.gateway.commit(&batch).await?;
        outcome.record_commit(committed);
        info!(
            inserted = committed.inserted,
            updated = committed.updated,
            noop = committed.noop,
            archived = committed.archived,
            "batch committed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

struct SchedulerInner {
    pipeline: SyncPipeline,
    sinks: Vec<Arc<dyn SummarySink>>,
    state: StdMutex<SchedulerState>,
    /// Held for the whole of a run; `stop` waits on it.
    run_lock: Mutex<()>,
}

impl SchedulerInner {
    fn set_state(&self, f: impl FnOnce(SchedulerState) -> SchedulerState) -> SchedulerState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = f(*state);
        *state
    }

    fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idle → Running with the run lock held; anything else means the tick is dropped.
    ///
    /// The lock is taken first so `stop` can never slip in between the state
    /// change and the start of the run.
    fn try_begin(&self) -> Option<MutexGuard<'_, ()>> {
        let running = self.run_lock.try_lock().ok()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SchedulerState::Idle {
            *state = SchedulerState::Running;
            Some(running)
        } else {
            None
        }
    }

    async fn trigger(&self) -> Option<RunSummary> {
        let Some(_running) = self.try_begin() else {
            info!(state = ?self.state(), "sync tick dropped");
            return None;
        };
        let summary = self.pipeline.run_once().await;
        for sink in &self.sinks {
            if let Err(err) = sink.publish(&summary).await {
                warn!(run_id = %summary.run_id, error = %err, "publishing run summary failed");
            }
        }
        self.set_state(|s| match s {
            SchedulerState::Running => SchedulerState::Idle,
            other => other,
        });
        Some(summary)
    }
}

/// Periodic driver for [`SyncPipeline`] with an explicit start/stop lifecycle.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    interval: Duration,
    run_on_start: bool,
    jobs: Mutex<Option<JobScheduler>>,
}

impl Scheduler {
    pub fn new(pipeline: SyncPipeline, interval: Duration, run_on_start: bool) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                pipeline,
                sinks: Vec::new(),
                state: StdMutex::new(SchedulerState::Idle),
                run_lock: Mutex::new(()),
            }),
            interval,
            run_on_start,
            jobs: Mutex::new(None),
        }
    }

    /// Must be called before `start`; sinks are fixed once the scheduler is shared.
    pub fn with_sink(mut self, sink: Arc<dyn SummarySink>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.sinks.push(sink);
        }
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.state()
    }

    /// Run now unless a run is already in progress or the scheduler is stopped.
    pub async fn trigger(&self) -> Option<RunSummary> {
        self.inner.trigger().await
    }

    pub async fn start(&self) -> Result<()> {
        if self.state() == SchedulerState::Stopped {
            bail!("scheduler has been stopped");
        }
        let mut jobs = self.jobs.lock().await;
        if jobs.is_some() {
            return Ok(());
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let inner = Arc::clone(&self.inner);
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                inner.trigger().await;
            })
        })
        .with_context(|| format!("creating sync job every {:?}", self.interval))?;
        sched.add(job).await.context("adding sync job")?;
        sched.start().await.context("starting scheduler")?;
        *jobs = Some(sched);
        info!(interval_secs = self.interval.as_secs(), "scheduler started");

        if self.run_on_start {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.trigger().await;
            });
        }
        Ok(())
    }

    /// Stops the timer and waits for an in-flight run to finish.
    pub async fn stop(&self) -> Result<()> {
        self.inner.set_state(|_| SchedulerState::Stopped);
        if let Some(mut sched) = self.jobs.lock().await.take() {
            sched.shutdown().await.context("shutting down scheduler")?;
        }
        let _drained = self.inner.run_lock.lock().await;
        info!("scheduler stopped");
        Ok(())
    }
}
