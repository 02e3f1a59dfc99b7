use crate::acquire::CandidateAcquirer;
use crate::config::PipelineConfig;
use crate::finalize::{StagingFinalizer, clear_staging, destination_dir, staging_dir};
use crate::http::build_client;
use crate::indexer::MetadataIndexer;
use crate::ingest;
use crate::models::{Candidate, ContextHost, Entry, RunRequest, SkuRecord, Tier};
use crate::resolver::TierCache;
use crate::search::{CandidateExtractor, build_query};
use crate::sidecar::SidecarBuilder;
use serde::Serialize;
use std::{
    collections::HashSet,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const METADATA_FILE: &str = "sku_metadata.json";

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    extractor: CandidateExtractor,
    acquirer: CandidateAcquirer,
    finalizer: StagingFinalizer,
    indexer: Option<MetadataIndexer>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let http = build_client(&config);
        let sidecars =
            SidecarBuilder::from_flag(config.scraper_version.clone(), config.perceptual_hash);
        let extractor = CandidateExtractor::new(http.clone(), &config);
        let acquirer = CandidateAcquirer::new(http.clone(), &config, sidecars);
        let finalizer = StagingFinalizer::with_variants(config.variants.clone());
        let indexer = config
            .metadata_store
            .clone()
            .map(|store| MetadataIndexer::new(http, store));
        Self {
            config: Arc::new(config),
            extractor,
            acquirer,
            finalizer,
            indexer,
        }
    }

    /// Processes every selected entry in input order. Only unusable inputs fail the run;
    /// everything past that point is contained per candidate or per entry.
    pub async fn run(
        &self,
        request: &RunRequest,
        ctx: &RunContext,
    ) -> Result<RunSummary, PipelineError> {
        let output_dir = request
            .output_dir
            .clone()
            .unwrap_or_else(|| self.config.output_dir.clone());

        let entries = ingest::read_entries(&request.entries_path);
        if entries.is_empty() {
            return Err(PipelineError::invalid_input(
                "load_inputs",
                format!("no valid entries in {}", request.entries_path.display()),
            ));
        }
        let host_table = ingest::read_context_hosts(&request.context_hosts_path);
        if host_table.is_empty() {
            return Err(PipelineError::invalid_input(
                "load_inputs",
                format!(
                    "no context hosts in {}",
                    request.context_hosts_path.display()
                ),
            ));
        }

        let staging = staging_dir(&output_dir);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|err| PipelineError::internal("prepare_staging", err.to_string()))?;
        let leftovers = clear_staging(&staging)
            .map_err(|err| PipelineError::internal("prepare_staging", err.to_string()))?;
        if leftovers > 0 {
            warn!(target = "imagery.pipeline", removed = leftovers, "stale_staging_cleared");
        }

        let range = request.range();
        let selected: Vec<&Entry> = entries
            .iter()
            .enumerate()
            .filter(|(index, _)| range.contains(*index))
            .map(|(_, entry)| entry)
            .collect();
        let total = selected.len();
        info!(
            target = "imagery.pipeline",
            run_id = %ctx.run_id,
            entries = entries.len(),
            selected = total,
            hosts = host_table.len(),
            "run_started"
        );
        ctx.progress.emit(ProgressEvent::RunStarted {
            run_id: ctx.run_id,
            total,
        });

        let mut tiers = TierCache::default();
        let mut records = Vec::new();
        let mut processed = 0;
        let mut accepted_images = 0;
        let mut outcome = RunOutcome::Completed;

        for (offset, entry) in selected.into_iter().enumerate() {
            let position = offset + 1;
            if ctx.cancel.is_cancelled() {
                info!(target = "imagery.pipeline", run_id = %ctx.run_id, position, "run_cancelled");
                outcome = RunOutcome::Cancelled;
                break;
            }
            ctx.progress.emit(ProgressEvent::EntryStarted {
                position,
                total,
                sku: entry.sku_id.clone(),
                manufacturer: entry.manufacturer.clone(),
            });
            info!(
                target = "imagery.pipeline",
                position,
                total,
                manufacturer = %entry.manufacturer,
                part_number = entry.part_number.as_deref().unwrap_or("-"),
                sku = %entry.sku_id,
                "entry_started"
            );

            let attempts = plan_attempts(tiers.resolve(&entry.manufacturer, &host_table));
            let found = capture_stage("search", self.first_success(entry, &attempts, ctx)).await;
            processed += 1;

            let Some((attempt, candidates)) = found else {
                info!(target = "imagery.pipeline", sku = %entry.sku_id, "entry_empty");
                ctx.progress.emit(ProgressEvent::EntryEmpty {
                    position,
                    sku: entry.sku_id.clone(),
                });
                continue;
            };

            ctx.progress.emit(ProgressEvent::EntryFinalizing {
                position,
                sku: entry.sku_id.clone(),
                tier: attempt.tier,
                candidates: candidates.len(),
            });
            let accepted = self
                .finalize_entry(entry, &attempt, &candidates, &staging, &output_dir)
                .await;
            accepted_images += accepted;

            records.push(SkuRecord {
                sku: entry.sku_id.clone(),
                manufacturer: entry.manufacturer.clone(),
                part_number: entry.part_number.clone(),
                image_urls: candidates.into_iter().map(|c| c.url).collect(),
            });
            ctx.progress.emit(ProgressEvent::EntryFinished {
                position,
                sku: entry.sku_id.clone(),
                accepted,
            });
        }

        let metadata_path = output_dir.join(METADATA_FILE);
        if let Err(err) = write_run_metadata(&metadata_path, &records).await {
            error!(target = "imagery.pipeline", path = %metadata_path.display(), error = %err, "run_metadata_write_failed");
        }

        info!(
            target = "imagery.pipeline",
            run_id = %ctx.run_id,
            outcome = ?outcome,
            processed,
            records = records.len(),
            accepted_images,
            "run_finished"
        );
        ctx.progress.emit(ProgressEvent::RunFinished {
            run_id: ctx.run_id,
            outcome,
            records: records.len(),
        });

        Ok(RunSummary {
            run_id: ctx.run_id,
            outcome,
            processed,
            accepted_images,
            metadata_path,
            records,
        })
    }

    /// Tries each attempt in order and stops at the first that yields any candidate.
    async fn first_success(
        &self,
        entry: &Entry,
        attempts: &[SearchAttempt],
        ctx: &RunContext,
    ) -> Option<(SearchAttempt, Vec<Candidate>)> {
        for attempt in attempts {
            let query = build_query(
                &entry.manufacturer,
                entry.part_number.as_deref(),
                entry.description.as_deref(),
                attempt.scope.as_deref(),
            );
            ctx.progress.emit(ProgressEvent::TierAttempted {
                sku: entry.sku_id.clone(),
                tier: attempt.tier,
                scope: attempt.scope.clone(),
            });
            let candidates = self.extractor.extract(&query, attempt.scope.as_deref()).await;
            if !candidates.is_empty() {
                info!(
                    target = "imagery.pipeline",
                    tier = %attempt.tier,
                    scope = attempt.scope.as_deref().unwrap_or("-"),
                    candidates = candidates.len(),
                    "tier_found_candidates"
                );
                return Some((attempt.clone(), candidates));
            }
            debug!(
                target = "imagery.pipeline",
                tier = %attempt.tier,
                scope = attempt.scope.as_deref().unwrap_or("-"),
                "tier_exhausted"
            );
        }
        None
    }

    /// Acquire, finalize into the destination tree, then index. Staging is cleared
    /// whatever happens in between. Returns the number of accepted images.
    async fn finalize_entry(
        &self,
        entry: &Entry,
        attempt: &SearchAttempt,
        candidates: &[Candidate],
        staging: &Path,
        output_dir: &Path,
    ) -> usize {
        let staged =
            capture_stage("acquire", self.acquirer.acquire(candidates, entry, staging)).await;
        debug!(
            target = "imagery.pipeline",
            sku = %entry.sku_id,
            accepted = staged.len(),
            bytes = staged.iter().map(|image| image.filesize).sum::<usize>() as u64,
            without_sidecar = staged.iter().filter(|image| image.sidecar.is_none()).count(),
            "entry_acquired"
        );

        let dest = destination_dir(
            output_dir,
            attempt.scope.is_some(),
            &entry.manufacturer,
            &entry.sku_id,
        );
        let finalizer = self.finalizer.clone();
        let (from, to) = (staging.to_path_buf(), dest.clone());
        let finalized = capture_stage(
            "finalize",
            tokio::task::spawn_blocking(move || finalizer.finalize(&from, &to)),
        )
        .await;
        match finalized {
            Ok(Ok(report)) => debug!(
                target = "imagery.pipeline",
                dest = %dest.display(),
                variants = report.variants_written,
                sidecars = report.sidecars_copied,
                "entry_finalized"
            ),
            Ok(Err(err)) => {
                error!(target = "imagery.finalize", dest = %dest.display(), error = %err, "finalize_failed")
            }
            Err(err) => {
                error!(target = "imagery.finalize", dest = %dest.display(), error = %err, "finalize_task_failed")
            }
        }
        if let Err(err) = clear_staging(staging) {
            warn!(target = "imagery.finalize", dir = %staging.display(), error = %err, "staging_clear_failed");
        }

        if let Some(indexer) = &self.indexer {
            let urls: Vec<String> = staged.iter().map(|image| image.url.clone()).collect();
            capture_stage(
                "index",
                indexer.index_all(
                    &urls,
                    &entry.manufacturer,
                    entry.part_number.as_deref(),
                    entry.description.as_deref(),
                ),
            )
            .await;
        }
        staged.len()
    }
}

async fn capture_stage<T, Fut>(name: &'static str, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    let started = Instant::now();
    let value = fut.await;
    crate::metrics::stage_elapsed(name, started.elapsed().as_millis());
    value
}

async fn write_run_metadata(path: &Path, records: &[SkuRecord]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(records).map_err(std::io::Error::other)?;
    tokio::fs::write(path, body).await?;
    info!(target = "imagery.pipeline", path = %path.display(), records = records.len(), "run_metadata_saved");
    Ok(())
}

/// One search strategy: a tier and, for host tiers, the host the query is pinned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchAttempt {
    pub tier: Tier,
    pub scope: Option<String>,
}

/// Resolved hosts in tier order, each host at most once, then the unscoped fallback.
pub fn plan_attempts(hosts: &[ContextHost]) -> Vec<SearchAttempt> {
    let mut tried = HashSet::new();
    let mut attempts: Vec<SearchAttempt> = hosts
        .iter()
        .filter(|host| tried.insert(host.host.clone()))
        .map(|host| SearchAttempt {
            tier: host.tier,
            scope: Some(host.host.clone()),
        })
        .collect();
    attempts.push(SearchAttempt {
        tier: Tier::General,
        scope: None,
    });
    attempts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: Uuid,
        total: usize,
    },
    EntryStarted {
        position: usize,
        total: usize,
        sku: String,
        manufacturer: String,
    },
    TierAttempted {
        sku: String,
        tier: Tier,
        scope: Option<String>,
    },
    EntryFinalizing {
        position: usize,
        sku: String,
        tier: Tier,
        candidates: usize,
    },
    EntryFinished {
        position: usize,
        sku: String,
        accepted: usize,
    },
    EntryEmpty {
        position: usize,
        sku: String,
    },
    RunFinished {
        run_id: Uuid,
        outcome: RunOutcome,
        records: usize,
    },
}

/// Receives run progress. Called inline from the run loop, so implementations must not
/// block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Everything a single run owns: its id, its stop signal, where progress goes.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub cancel: CancellationToken,
    pub progress: Arc<dyn ProgressSink>,
}

impl RunContext {
    pub fn new(progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            progress,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub processed: usize,
    pub accepted_images: usize,
    pub metadata_path: PathBuf,
    pub records: Vec<SkuRecord>,
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Conflict,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn conflict(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Conflict,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}
