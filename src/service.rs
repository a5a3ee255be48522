//! Composition root of the execution core.
//!
//! [`ExecutionService`] owns the job queue, the status store and the worker
//! pool. It is built once at start-up, shared behind an `Arc`, and stopped
//! with an explicit [`ExecutionService::shutdown`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, LanguageConfig};
use crate::create_timestamp;
use crate::error::{CancelError, SubmitError};
use crate::judge::JudgeOutcome;
use crate::queue::{CancelAttempt, ExecutionJob, JobId, JobQueue, QueueStats, SubmissionId};
use crate::sandbox::{SandboxSettings, create_sandbox_runner};
use crate::status::{JobStatus, StatusStore};
use crate::store::{ProblemProvider, SubmissionStore};
use crate::worker::{RunnerFactory, WorkerContext, record_terminal, worker};

/// A validated submission handed over by the boundary layer
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub submission_id: SubmissionId,
    /// Verified caller identity, opaque to the core
    pub user_id: String,
    pub problem_id: u32,
    pub code: String,
    pub language: String,
    pub priority: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub submission_id: SubmissionId,
    pub job_id: JobId,
    pub accepted_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was removed from the queue and is now `CANCELLED`
    Cancelled,
    /// The job is running; it becomes `CANCELLED` once its sandbox is torn down
    CancellationRequested,
}

pub struct ExecutionService {
    ctx: Arc<WorkerContext>,
    problems: Arc<dyn ProblemProvider>,
    languages: HashMap<String, Arc<LanguageConfig>>,
    max_source_bytes: usize,
    workers: Mutex<JoinSet<anyhow::Result<()>>>,
    shutdown_token: CancellationToken,
}

impl ExecutionService {
    /// Starts the worker pool with the sandbox backend selected by `config`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &Config,
        problems: Arc<dyn ProblemProvider>,
        submissions: Arc<dyn SubmissionStore>,
    ) -> anyhow::Result<Self> {
        let backend = config.execution.sandbox;
        let settings = SandboxSettings::from(config);
        let factory: RunnerFactory =
            Arc::new(move |id| create_sandbox_runner(id, backend, settings));
        Self::start_with_runners(config, problems, submissions, factory)
    }

    /// Starts the worker pool, building each worker's sandbox with `factory`
    pub fn start_with_runners(
        config: &Config,
        problems: Arc<dyn ProblemProvider>,
        submissions: Arc<dyn SubmissionStore>,
        factory: RunnerFactory,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let execution = &config.execution;

        let ctx = Arc::new(WorkerContext {
            queue: Arc::new(JobQueue::new(execution.queue_capacity)),
            statuses: Arc::new(StatusStore::new(execution.status_retention)),
            submissions,
            policy: execution.judge_policy,
        });
        let languages = config
            .languages
            .iter()
            .map(|l| (l.name.clone(), Arc::new(l.clone())))
            .collect();
        let shutdown_token = CancellationToken::new();

        let mut workers = JoinSet::new();
        for i in 1..=execution.workers {
            // `validate` caps the pool at u8::MAX workers
            workers.spawn(worker(
                i as u8,
                factory.clone(),
                ctx.clone(),
                shutdown_token.clone(),
            ));
        }
        log::info!(
            "Execution service started with {} workers, capacity {}, policy {:?}",
            execution.workers,
            execution.queue_capacity,
            execution.judge_policy
        );

        Ok(Self {
            ctx,
            problems,
            languages,
            max_source_bytes: execution.max_source_bytes,
            workers: Mutex::new(workers),
            shutdown_token,
        })
    }

    /// Validates a submission and admits it into the queue
    ///
    /// Never blocks on capacity: a full queue is rejected immediately.
    pub async fn submit(&self, request: SubmissionRequest) -> Result<SubmitReceipt, SubmitError> {
        if self.ctx.queue.is_draining() {
            return Err(SubmitError::Draining);
        }

        let language = self
            .languages
            .get(&request.language)
            .cloned()
            .ok_or_else(|| {
                SubmitError::Validation(format!("unsupported language {}", request.language))
            })?;
        if request.code.trim().is_empty() {
            return Err(SubmitError::Validation("code must not be empty".to_string()));
        }
        if request.code.len() > self.max_source_bytes {
            return Err(SubmitError::Validation(format!(
                "code exceeds {} bytes",
                self.max_source_bytes
            )));
        }

        let problem = self
            .problems
            .problem(request.problem_id)
            .await
            .map_err(SubmitError::Provider)?
            .ok_or_else(|| {
                SubmitError::Validation(format!("unknown problem {}", request.problem_id))
            })?;
        if problem.cases.is_empty() {
            return Err(SubmitError::Validation(format!(
                "problem {} has no test cases",
                request.problem_id
            )));
        }

        let submission_id = request.submission_id;
        let total = problem.cases.len() as u32;
        let job = ExecutionJob {
            job_id: JobId(0),
            submission_id,
            user_id: request.user_id,
            problem,
            language,
            code: Arc::from(request.code),
            priority: request.priority.unwrap_or(0),
            enqueued_at: Utc::now(),
            sequence: 0,
            attempt: 0,
        };

        let statuses = &self.ctx.statuses;
        let job_id = self.ctx.queue.admit(job, |job| {
            statuses.insert_queued(job.job_id, job.submission_id, total);
        })?;
        log::info!("Submission {submission_id} admitted as job {job_id}");

        Ok(SubmitReceipt {
            submission_id,
            job_id,
            accepted_at: create_timestamp(),
        })
    }

    pub fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.ctx.statuses.get(job_id)
    }

    pub fn stats(&self) -> QueueStats {
        self.ctx.queue.stats()
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, CancelError> {
        match self.ctx.queue.cancel(job_id) {
            CancelAttempt::Removed(job) => {
                let outcome = JudgeOutcome::cancelled(job.problem.cases.len() as u32);
                record_terminal(&self.ctx, &job, &outcome).await;
                log::info!("Job {job_id} cancelled before dispatch");
                Ok(CancelOutcome::Cancelled)
            }
            // The verdict may already be published while the slot is still held
            CancelAttempt::Signalled if self.is_finished(job_id) => {
                Err(CancelError::AlreadyFinished(job_id))
            }
            CancelAttempt::Signalled => {
                log::info!("Cancellation of running job {job_id} requested");
                Ok(CancelOutcome::CancellationRequested)
            }
            CancelAttempt::NotFound if self.is_finished(job_id) => {
                Err(CancelError::AlreadyFinished(job_id))
            }
            CancelAttempt::NotFound => Err(CancelError::NotFound(job_id)),
        }
    }

    fn is_finished(&self, job_id: JobId) -> bool {
        self.ctx
            .statuses
            .state(job_id)
            .is_some_and(|state| state.is_terminal())
    }

    /// Resolves when a worker task ends, which only happens on shutdown or failure
    pub async fn join_next_worker(&self) -> Option<Result<anyhow::Result<()>, JoinError>> {
        self.workers.lock().await.join_next().await
    }

    /// Stops admission, lets in-flight jobs finish, then stops the workers
    ///
    /// Jobs still queued or running once `grace` has elapsed are cancelled.
    pub async fn shutdown(&self, grace: Duration) {
        let queue = &self.ctx.queue;
        queue.begin_drain();
        let stats = queue.stats();
        log::info!(
            "Draining execution service: {} queued, {} running",
            stats.queued,
            stats.running
        );

        if tokio::time::timeout(grace, queue.wait_idle()).await.is_err() {
            let pending = queue.drain_pending();
            log::warn!(
                "Drain grace elapsed, cancelling {} queued jobs",
                pending.len()
            );
            for job in pending {
                let outcome = JudgeOutcome::cancelled(job.problem.cases.len() as u32);
                record_terminal(&self.ctx, &job, &outcome).await;
            }

            let running = queue.cancel_running();
            log::warn!("Cancelling {running} running jobs");
            queue.wait_idle().await;
        }

        // Broadcast shutdown signal to workers and wait until every one terminates
        self.shutdown_token.cancel();
        let mut workers = self.workers.lock().await;
        while let Some(res) = workers.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Worker finished with error: {e:#}"),
                Err(e) if e.is_panic() => log::error!("Worker handle panicked: {e:?}"),
                Err(e) => log::error!("Worker handle finished with error: {e:?}"),
            }
        }

        log::info!("Execution service stopped");
    }
}
