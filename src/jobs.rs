use crate::{
    models::RunRequest,
    pipeline::{Pipeline, PipelineError, ProgressEvent, ProgressSink, RunContext, RunOutcome},
};
use serde::Serialize;
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Stopping,
    Completed,
    Cancelled,
    Failed,
}

/// What the front end polls.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatus {
    pub state: RunState,
    pub run_id: Option<Uuid>,
    pub position: usize,
    pub total: usize,
    pub accepted_images: usize,
    pub records: usize,
    pub message: Option<String>,
}

/// Folds progress events into the latest [`RunStatus`].
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<RunStatus>,
}

impl StatusBoard {
    pub fn snapshot(&self) -> RunStatus {
        self.lock().clone()
    }

    fn begin(&self, run_id: Uuid) {
        *self.lock() = RunStatus {
            state: RunState::Running,
            run_id: Some(run_id),
            message: Some("run queued".into()),
            ..RunStatus::default()
        };
    }

    fn stopping(&self) {
        let mut status = self.lock();
        if status.state == RunState::Running {
            status.state = RunState::Stopping;
            status.message = Some(format!("stopping after entry {}", status.position));
        }
    }

    fn fail(&self, err: &PipelineError) {
        let mut status = self.lock();
        status.state = RunState::Failed;
        status.message = Some(err.detail().to_string());
    }

    fn lock(&self) -> MutexGuard<'_, RunStatus> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProgressSink for StatusBoard {
    fn emit(&self, event: ProgressEvent) {
        let mut status = self.lock();
        match event {
            ProgressEvent::RunStarted { run_id, total } => {
                status.run_id = Some(run_id);
                status.total = total;
                status.message = Some(format!("{total} entries selected"));
            }
            ProgressEvent::EntryStarted {
                position,
                total,
                sku,
                manufacturer,
            } => {
                status.position = position;
                status.total = total;
                status.message = Some(format!("({position}/{total}) {manufacturer} {sku}"));
            }
            ProgressEvent::TierAttempted { tier, scope, .. } => {
                status.message = Some(match scope {
                    Some(host) => format!("searching {tier} site:{host}"),
                    None => format!("searching {tier}"),
                });
            }
            ProgressEvent::EntryFinalizing { candidates, .. } => {
                status.message = Some(format!("downloading {candidates} candidates"));
            }
            ProgressEvent::EntryFinished { sku, accepted, .. } => {
                status.accepted_images += accepted;
                status.records += 1;
                status.message = Some(format!("{sku}: {accepted} images kept"));
            }
            ProgressEvent::EntryEmpty { sku, .. } => {
                status.message = Some(format!("{sku}: no images found"));
            }
            ProgressEvent::RunFinished {
                outcome, records, ..
            } => {
                status.records = records;
                status.state = match outcome {
                    RunOutcome::Completed => RunState::Completed,
                    RunOutcome::Cancelled => RunState::Cancelled,
                };
                status.message = Some(match outcome {
                    RunOutcome::Completed => "run finished".to_string(),
                    RunOutcome::Cancelled => format!("stopped at entry {}", status.position),
                });
            }
        }
    }
}

/// Releases the run slot when the worker task ends, however it ends.
struct ActiveRun {
    flag: Arc<AtomicBool>,
}

impl ActiveRun {
    fn claim(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns the single run slot: starts runs on a worker task, stops them, reports status.
#[derive(Clone)]
pub struct RunController {
    pipeline: Pipeline,
    active: Arc<AtomicBool>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
    status: Arc<StatusBoard>,
}

impl RunController {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            active: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Mutex::new(None)),
            status: Arc::new(StatusBoard::default()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn status(&self) -> RunStatus {
        self.status.snapshot()
    }

    pub fn start(&self, request: RunRequest) -> Result<(Uuid, JoinHandle<()>), PipelineError> {
        let slot = ActiveRun::claim(&self.active)
            .ok_or_else(|| PipelineError::conflict("start_run", "a run is already in progress"))?;

        let ctx = RunContext::new(self.status.clone());
        let run_id = ctx.run_id;
        *lock(&self.cancel) = Some(ctx.cancel.clone());
        self.status.begin(run_id);

        let pipeline = self.pipeline.clone();
        let status = self.status.clone();
        let handle = tokio::spawn(async move {
            let _slot = slot;
            match pipeline.run(&request, &ctx).await {
                Ok(summary) => info!(
                    target = "imagery.api",
                    run_id = %summary.run_id,
                    outcome = ?summary.outcome,
                    records = summary.records.len(),
                    "run_completed"
                ),
                Err(err) => {
                    warn!(target = "imagery.api", run_id = %run_id, stage = err.stage(), error = %err, "run_failed");
                    status.fail(&err);
                }
            }
        });
        info!(target = "imagery.api", run_id = %run_id, "run_accepted");
        Ok((run_id, handle))
    }

    /// Signals the active run to stop before its next entry. Returns false when idle.
    pub fn stop(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        if let Some(token) = lock(&self.cancel).as_ref() {
            token.cancel();
        }
        self.status.stopping();
        info!(target = "imagery.api", "run_stop_requested");
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
