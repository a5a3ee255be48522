use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::JudgePolicy;
use crate::judge::{JudgeOutcome, judge_submission};
use crate::queue::{ClaimedJob, ExecutionJob, JobQueue};
use crate::sandbox::SandboxRunner;
use crate::status::StatusStore;
use crate::store::{SubmissionResult, SubmissionStore};

/// Attempts granted to a job whose sandbox faults
pub const MAX_ATTEMPTS: u32 = 2;

/// Builds the sandbox owned by the worker with the given id
pub type RunnerFactory =
    Arc<dyn Fn(u8) -> anyhow::Result<Box<dyn SandboxRunner>> + Send + Sync>;

/// State shared by every worker of the pool
pub struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub statuses: Arc<StatusStore>,
    pub submissions: Arc<dyn SubmissionStore>,
    pub policy: JudgePolicy,
}

/// Releases the sandbox when judging ends, even by panic
struct SandboxLease<'a>(&'a dyn SandboxRunner);

impl Drop for SandboxLease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.release() {
            log::error!("Failed to release sandbox {}: {e:#}", self.0.id());
        }
    }
}

pub async fn worker(
    id: u8,
    factory: RunnerFactory,
    ctx: Arc<WorkerContext>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let mut sandbox: Arc<dyn SandboxRunner> = Arc::from(factory(id)?);
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            claimed = ctx.queue.pop() => {
                let faulted = run_job(id, &sandbox, &ctx, claimed).await;

                // A faulted sandbox may be left in any state; start over with a fresh one
                if faulted {
                    match factory(id) {
                        Ok(fresh) => {
                            sandbox = Arc::from(fresh);
                            log::info!("Worker {id} rebuilt its sandbox");
                        }
                        Err(e) => log::error!("Worker {id} failed to rebuild its sandbox: {e:#}"),
                    }
                }
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// Drives one claimed job to a terminal state or back into the queue
///
/// Returns whether the sandbox faulted.
async fn run_job(
    id: u8,
    sandbox: &Arc<dyn SandboxRunner>,
    ctx: &WorkerContext,
    claimed: ClaimedJob,
) -> bool {
    let ClaimedJob { job, cancel } = claimed;
    let job_id = job.job_id;
    let total = job.problem.cases.len() as u32;

    ctx.statuses.mark_running(job_id, job.attempt);
    log::info!(
        "Worker {id} got job {job_id} (submission {}, attempt {})",
        job.submission_id,
        job.attempt
    );

    let runner = Arc::clone(sandbox);
    let task_job = job.clone();
    let task_cancel = cancel.clone();
    let policy = ctx.policy;
    let result_handle = tokio::task::spawn_blocking(move || {
        let _lease = SandboxLease(runner.as_ref());
        judge_submission(runner.as_ref(), &task_job, policy, &task_cancel)
    });

    let fault = match result_handle.await {
        Ok(Ok(outcome)) => {
            log::info!("Job {job_id} finished on worker {id}: {}", outcome.state);
            record_terminal(ctx, &job, &outcome).await;
            ctx.queue.complete(job_id);
            return false;
        }
        Ok(Err(e)) => format!("{e:#}"),
        Err(e) => format!("judging task failed: {e}"),
    };

    if cancel.is_cancelled() {
        log::info!("Job {job_id} cancelled on worker {id} after a sandbox fault: {fault}");
        record_terminal(ctx, &job, &JudgeOutcome::cancelled(total)).await;
        ctx.queue.complete(job_id);
    } else if job.attempt < MAX_ATTEMPTS {
        match ctx.queue.requeue(job) {
            Ok(()) => log::warn!(
                "Job {job_id} hit an internal fault on worker {id}, retrying: {fault}"
            ),
            Err(job) => {
                log::info!(
                    "Job {job_id} hit an internal fault on worker {id} during shutdown: {fault}"
                );
                record_terminal(ctx, &job, &JudgeOutcome::cancelled(total)).await;
                ctx.queue.complete(job_id);
            }
        }
    } else {
        log::error!(
            "Job {job_id} hit an internal fault on worker {id} again, giving up: {fault}"
        );
        record_terminal(ctx, &job, &JudgeOutcome::internal_error(total)).await;
        ctx.queue.complete(job_id);
    }

    true
}

/// Publishes a terminal outcome and writes it back to the submission store
pub(crate) async fn record_terminal(
    ctx: &WorkerContext,
    job: &ExecutionJob,
    outcome: &JudgeOutcome,
) {
    if !ctx.statuses.publish(job.job_id, outcome) {
        return;
    }

    let result = SubmissionResult::from(outcome);
    if let Err(e) = ctx
        .submissions
        .record_result(job.submission_id, &result)
        .await
    {
        log::error!(
            "Failed to save result of submission {}: {e:#}",
            job.submission_id
        );
    }
}
