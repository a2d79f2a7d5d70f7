//! Scrape-parse-dedup-persist pipeline orchestration.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use solvelog_adapters::{ExtractError, SubmissionExtractor};
use solvelog_core::{SubmissionRecord, Username};
use solvelog_storage::{
    DuplicateFilter, HttpFetcher, PgStore, StoreError, SubmissionStore, UserDirectory,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;

pub use config::{
    ConfigError, SyncConfig, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_DATABASE_URL, MAX_CONCURRENCY_LIMIT,
};

pub const CRATE_NAME: &str = "solvelog-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("cannot enumerate tracked users: {0}")]
    DirectoryRead(#[source] StoreError),
    #[error("cannot reach submission store: {0}")]
    StoreConnect(#[source] StoreError),
    #[error("pipeline setup failed: {0}")]
    Setup(#[from] anyhow::Error),
}

impl From<ExtractError> for PipelineError {
    fn from(err: ExtractError) -> Self {
        Self::Setup(anyhow::Error::new(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Fetching,
    Aggregating,
    Persisting,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: RunPhase,
    pub tracked_users: usize,
    pub failed_users: usize,
    pub accepted: usize,
    pub persisted: usize,
    pub persist_failed: usize,
}

/// What the single entry point hands back to its invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResponse {
    pub status_code: u16,
    pub body: String,
}

impl RunResponse {
    pub fn from_outcome(outcome: &Result<SyncRunSummary, PipelineError>) -> Self {
        match outcome {
            Ok(summary) => Self {
                status_code: 200,
                body: format!("Successfully processed {} submissions", summary.persisted),
            },
            Err(err) => Self {
                status_code: 500,
                body: format!("Scrap failed: {err}"),
            },
        }
    }
}

/// A user's task produced nothing usable; already logged where it happened.
struct UserFailed;

/// Owns the shared HTTP client, the concurrency limiter and the store handles for a run.
pub struct SyncPipeline {
    fetcher: Arc<HttpFetcher>,
    extractor: Arc<SubmissionExtractor>,
    directory: Arc<dyn UserDirectory>,
    store: Arc<dyn SubmissionStore>,
    filter: DuplicateFilter,
    limiter: Arc<Semaphore>,
}

impl SyncPipeline {
    pub fn new(
        config: &SyncConfig,
        directory: Arc<dyn UserDirectory>,
        store: Arc<dyn SubmissionStore>,
    ) -> Result<Self, PipelineError> {
        let fetcher = HttpFetcher::new(config.base_url.clone(), config.http_client_config())?;
        let extractor =
            SubmissionExtractor::new(config.base_url.clone())?.with_site_offset(config.site_offset);
        let filter = DuplicateFilter::new(store.clone(), config.dedup_failure_policy);

        Ok(Self {
            fetcher: Arc::new(fetcher),
            extractor: Arc::new(extractor),
            directory,
            store,
            filter,
            limiter: Arc::new(Semaphore::new(
                config.concurrency_limit.clamp(1, MAX_CONCURRENCY_LIMIT),
            )),
        })
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, PipelineError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_phases(run_id, started_at).instrument(span).await
    }

    async fn run_phases(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<SyncRunSummary, PipelineError> {
        info!(phase = ?RunPhase::Idle, "listing tracked users");
        let users = match self.directory.list_tracked_users().await {
            Ok(users) => distinct_users(users),
            Err(err) => {
                error!(phase = ?RunPhase::Failed, error = %err, "tracked user directory unavailable");
                return Err(PipelineError::DirectoryRead(err));
            }
        };
        if users.is_empty() {
            info!("no tracked users; nothing to do");
        }

        info!(phase = ?RunPhase::Fetching, users = users.len(), "fetching status pages");
        let (per_user, failed_users) = self.collect(&users, started_at).await;

        info!(phase = ?RunPhase::Aggregating, failed_users, "aggregating accepted submissions");
        let accepted: Vec<SubmissionRecord> = per_user.into_iter().flatten().collect();

        info!(phase = ?RunPhase::Persisting, accepted = accepted.len(), "persisting");
        let report = if accepted.is_empty() {
            Default::default()
        } else {
            self.store.save_all(&accepted).await
        };
        for key in &report.failed {
            warn!(username = %key.username, problem_id = %key.problem_id, "submission not saved");
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            phase: RunPhase::Done,
            tracked_users: users.len(),
            failed_users,
            accepted: accepted.len(),
            persisted: report.written,
            persist_failed: report.failed_count(),
        };
        info!(
            phase = ?summary.phase,
            persisted = summary.persisted,
            persist_failed = summary.persist_failed,
            "sync run complete"
        );
        Ok(summary)
    }

    /// One task per user; results come back in completion order.
    async fn collect(
        &self,
        users: &[Username],
        now: DateTime<Utc>,
    ) -> (Vec<Vec<SubmissionRecord>>, usize) {
        let mut tasks = JoinSet::new();
        for username in users {
            let span = info_span!("scrape_user", username = %username);
            tasks.spawn(
                scrape_user(
                    self.fetcher.clone(),
                    self.extractor.clone(),
                    self.filter.clone(),
                    self.limiter.clone(),
                    username.clone(),
                    now,
                )
                .instrument(span),
            );
        }

        let mut per_user = Vec::with_capacity(users.len());
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(records)) => per_user.push(records),
                Ok(Err(UserFailed)) => failed += 1,
                Err(err) => {
                    warn!(error = %err, "user task aborted");
                    failed += 1;
                }
            }
        }
        (per_user, failed)
    }
}

async fn scrape_user(
    fetcher: Arc<HttpFetcher>,
    extractor: Arc<SubmissionExtractor>,
    filter: DuplicateFilter,
    limiter: Arc<Semaphore>,
    username: Username,
    now: DateTime<Utc>,
) -> Result<Vec<SubmissionRecord>, UserFailed> {
    let Ok(_permit) = limiter.acquire_owned().await else {
        warn!(username = %username, "concurrency limiter closed");
        return Err(UserFailed);
    };

    let html = fetcher.fetch(&username).await.ok_or(UserFailed)?;
    match extractor.extract(&html, &username, now, &filter).await {
        Ok(records) => {
            info!(username = %username, accepted = records.len(), "extracted submissions");
            Ok(records)
        }
        Err(err) => {
            warn!(username = %username, error = %err, "status page unusable; user contributes no records");
            Err(UserFailed)
        }
    }
}

/// Drops blank and repeated usernames, keeping directory order.
fn distinct_users(users: Vec<Username>) -> Vec<Username> {
    let mut seen = HashSet::new();
    users
        .into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// Postgres-backed pipeline for a loaded configuration.
pub async fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline, PipelineError> {
    let pool_size = u32::try_from(config.concurrency_limit.saturating_add(2)).unwrap_or(u32::MAX);
    let store = Arc::new(
        PgStore::connect(&config.database_url, pool_size)
            .await
            .map_err(PipelineError::StoreConnect)?,
    );
    SyncPipeline::new(config, store.clone(), store)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, PipelineError> {
    let config = SyncConfig::from_env()?;
    let pipeline = pipeline_from_config(&config).await?;
    pipeline.run_once().await
}

/// The invocation surface: configuration through persistence, folded into a response.
pub async fn handle_invocation() -> RunResponse {
    let outcome = run_sync_once_from_env().await;
    if let Err(err) = &outcome {
        error!(error = %err, "sync run failed");
    }
    RunResponse::from_outcome(&outcome)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
) -> anyhow::Result<Option<JobScheduler>> {
    use anyhow::Context;

    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let outcome = pipeline.run_once().await;
            let response = RunResponse::from_outcome(&outcome);
            if response.status_code == 200 {
                info!(body = %response.body, "scheduled sync finished");
            } else {
                error!(body = %response.body, "scheduled sync failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
