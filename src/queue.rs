use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::LanguageConfig;
use crate::error::SubmitError;
use crate::store::Problem;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub type SubmissionId = u64;

/// Transient unit of work for one submission
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub job_id: JobId,
    pub submission_id: SubmissionId,
    pub user_id: String,
    pub problem: Arc<Problem>,
    pub language: Arc<LanguageConfig>,
    pub code: Arc<str>,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub sequence: u64,
    pub attempt: u32,
}

/// A job claimed by exactly one worker, with the token used to cancel it
pub struct ClaimedJob {
    pub job: ExecutionJob,
    pub cancel: CancellationToken,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub capacity: usize,
    pub rejected_total: u64,
}

pub enum CancelAttempt {
    /// The job was still queued and has been removed before dispatch
    Removed(ExecutionJob),
    /// The job is running; its sandbox has been signalled
    Signalled,
    NotFound,
}

/// Heap entry: higher priority first, then lower sequence number
struct Pending(ExecutionJob);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

struct RunningJob {
    submission_id: SubmissionId,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<Pending>,
    running: HashMap<JobId, RunningJob>,
    /// Submission ids with a queued or running job
    active: HashMap<SubmissionId, JobId>,
    next_sequence: u64,
    rejected_total: u64,
    draining: bool,
    /// Set once the queued jobs were cancelled by shutdown; nothing may re-enter
    halted: bool,
}

impl QueueState {
    fn in_flight(&self) -> usize {
        self.pending.len() + self.running.len()
    }
}

/// Bounded job queue shared by every worker of the pool
///
/// Capacity bounds queued plus running jobs. Admission never blocks: a full
/// queue rejects immediately.
pub struct JobQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
    idle: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            notify: Notify::new(),
            idle: Notify::new(),
        }
    }

    /// Admits a job, assigning its id and sequence number
    ///
    /// `on_admit` runs under the queue lock before any worker can claim the
    /// job. A rejected job leaves no trace other than `rejected_total`.
    pub fn admit(
        &self,
        mut job: ExecutionJob,
        on_admit: impl FnOnce(&ExecutionJob),
    ) -> Result<JobId, SubmitError> {
        let mut state = self.state.lock();

        if state.draining {
            return Err(SubmitError::Draining);
        }
        if state.active.contains_key(&job.submission_id) {
            return Err(SubmitError::DuplicateSubmission(job.submission_id));
        }
        if state.in_flight() >= self.capacity {
            state.rejected_total += 1;
            return Err(SubmitError::AdmissionRejected {
                capacity: self.capacity,
            });
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        job.sequence = sequence;
        job.job_id = JobId(sequence);
        job.attempt = 0;

        let job_id = job.job_id;
        on_admit(&job);
        state.active.insert(job.submission_id, job_id);
        state.pending.push(Pending(job));
        drop(state);

        self.notify.notify_one();
        Ok(job_id)
    }

    /// Waits until a job is available and claims it
    pub async fn pop(&self) -> ClaimedJob {
        loop {
            if let Some(claimed) = self.try_claim() {
                return claimed;
            }
            self.notify.notified().await;
        }
    }

    fn try_claim(&self) -> Option<ClaimedJob> {
        let mut state = self.state.lock();
        let Pending(mut job) = state.pending.pop()?;
        job.attempt += 1;

        let cancel = CancellationToken::new();
        state.running.insert(
            job.job_id,
            RunningJob {
                submission_id: job.submission_id,
                cancel: cancel.clone(),
            },
        );
        Some(ClaimedJob { job, cancel })
    }

    /// Puts a claimed job back at its original position for another attempt
    ///
    /// Once shutdown has cancelled the queued jobs the job is handed back
    /// instead, still registered as running.
    pub fn requeue(&self, job: ExecutionJob) -> Result<(), ExecutionJob> {
        let mut state = self.state.lock();
        if state.halted {
            return Err(job);
        }
        state.running.remove(&job.job_id);
        state.pending.push(Pending(job));
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Releases the slot of a job whose terminal result has been recorded
    pub fn complete(&self, job_id: JobId) {
        let mut state = self.state.lock();
        if let Some(running) = state.running.remove(&job_id) {
            state.active.remove(&running.submission_id);
        }
        let idle = state.in_flight() == 0;
        drop(state);

        if idle {
            self.idle.notify_waiters();
        }
    }

    pub fn cancel(&self, job_id: JobId) -> CancelAttempt {
        let mut state = self.state.lock();

        if let Some(running) = state.running.get(&job_id) {
            running.cancel.cancel();
            return CancelAttempt::Signalled;
        }

        let Some(job) = remove_pending(&mut state.pending, |j| j.job_id == job_id) else {
            return CancelAttempt::NotFound;
        };
        state.active.remove(&job.submission_id);
        let idle = state.in_flight() == 0;
        drop(state);

        if idle {
            self.idle.notify_waiters();
        }
        CancelAttempt::Removed(job)
    }

    /// Removes every queued job, returning them in dispatch order
    ///
    /// Later retries are refused by [`JobQueue::requeue`].
    pub fn drain_pending(&self) -> Vec<ExecutionJob> {
        let mut state = self.state.lock();
        state.halted = true;
        let jobs = std::mem::take(&mut state.pending).into_sorted_vec();
        for Pending(job) in &jobs {
            state.active.remove(&job.submission_id);
        }
        let idle = state.in_flight() == 0;
        drop(state);

        if idle {
            self.idle.notify_waiters();
        }
        jobs.into_iter().rev().map(|Pending(job)| job).collect()
    }

    /// Signals the sandboxes of every running job
    pub fn cancel_running(&self) -> usize {
        let state = self.state.lock();
        for running in state.running.values() {
            running.cancel.cancel();
        }
        state.running.len()
    }

    /// Stops admission; already admitted jobs still run
    pub fn begin_drain(&self) {
        self.state.lock().draining = true;
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// Resolves once no job is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state.lock().in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            queued: state.pending.len(),
            running: state.running.len(),
            capacity: self.capacity,
            rejected_total: state.rejected_total,
        }
    }
}

fn remove_pending(
    pending: &mut BinaryHeap<Pending>,
    predicate: impl Fn(&ExecutionJob) -> bool,
) -> Option<ExecutionJob> {
    let mut removed = None;
    let kept: Vec<Pending> = std::mem::take(pending)
        .into_vec()
        .into_iter()
        .filter_map(|entry| {
            if removed.is_none() && predicate(&entry.0) {
                removed = Some(entry.0);
                None
            } else {
                Some(entry)
            }
        })
        .collect();
    *pending = BinaryHeap::from(kept);
    removed
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{JudgeType, ResourceLimits};

    fn job(submission_id: SubmissionId, priority: i32) -> ExecutionJob {
        ExecutionJob {
            job_id: JobId(0),
            submission_id,
            user_id: "tester".to_string(),
            problem: Arc::new(Problem {
                id: 0,
                judge_type: JudgeType::Standard,
                limits: ResourceLimits::default(),
                cases: Vec::new(),
            }),
            language: Arc::new(LanguageConfig {
                name: "sh".to_string(),
                file_name: "main.sh".to_string(),
                compile: None,
                run: vec!["/bin/sh".to_string(), "%INPUT%".to_string()],
            }),
            code: Arc::from("echo hi"),
            priority,
            enqueued_at: Utc::now(),
            sequence: 0,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = JobQueue::new(8);
        let a = queue.admit(job(1, 0), |_| {}).unwrap();
        let b = queue.admit(job(2, 0), |_| {}).unwrap();
        let c = queue.admit(job(3, 5), |_| {}).unwrap();

        assert_eq!(queue.pop().await.job.job_id, c);
        assert_eq!(queue.pop().await.job.job_id, a);
        assert_eq!(queue.pop().await.job.job_id, b);
    }

    #[tokio::test]
    async fn test_capacity_counts_running_jobs() {
        let queue = JobQueue::new(2);
        queue.admit(job(1, 0), |_| {}).unwrap();
        queue.admit(job(2, 0), |_| {}).unwrap();
        let _claimed = queue.pop().await;

        let before = queue.stats();
        assert_eq!((before.queued, before.running), (1, 1));

        let err = queue.admit(job(3, 0), |_| {}).unwrap_err();
        assert!(matches!(err, SubmitError::AdmissionRejected { capacity: 2 }));

        let after = queue.stats();
        assert_eq!((after.queued, after.running), (1, 1));
        assert_eq!(after.rejected_total, 1);
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected_until_complete() {
        let queue = JobQueue::new(4);
        queue.admit(job(9, 0), |_| {}).unwrap();
        assert!(matches!(
            queue.admit(job(9, 0), |_| {}),
            Err(SubmitError::DuplicateSubmission(9))
        ));

        let claimed = queue.pop().await;
        queue.complete(claimed.job.job_id);
        queue.admit(job(9, 0), |_| {}).unwrap();
        assert_eq!(queue.stats().rejected_total, 0);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(JobQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.job.submission_id })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.admit(job(42, 0), |_| {}).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, 42);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let queue = JobQueue::new(4);
        let first = queue.admit(job(1, 0), |_| {}).unwrap();
        let second = queue.admit(job(2, 0), |_| {}).unwrap();

        let claimed = queue.pop().await;
        assert_eq!(claimed.job.job_id, first);

        assert!(matches!(queue.cancel(second), CancelAttempt::Removed(j) if j.submission_id == 2));
        assert!(matches!(queue.cancel(first), CancelAttempt::Signalled));
        assert!(claimed.cancel.is_cancelled());
        assert!(matches!(queue.cancel(JobId(99)), CancelAttempt::NotFound));
    }

    #[tokio::test]
    async fn test_requeue_keeps_sequence_and_counts_attempts() {
        let queue = JobQueue::new(4);
        let first = queue.admit(job(1, 0), |_| {}).unwrap();
        queue.admit(job(2, 0), |_| {}).unwrap();

        let claimed = queue.pop().await;
        assert_eq!(claimed.job.attempt, 1);
        queue.requeue(claimed.job).unwrap();
        assert_eq!(queue.stats().running, 0);

        let again = queue.pop().await;
        assert_eq!(again.job.job_id, first);
        assert_eq!(again.job.attempt, 2);
    }

    #[tokio::test]
    async fn test_draining_rejects_and_wait_idle() {
        let queue = Arc::new(JobQueue::new(4));
        queue.admit(job(1, 0), |_| {}).unwrap();
        queue.begin_drain();
        assert!(matches!(queue.admit(job(2, 0), |_| {}), Err(SubmitError::Draining)));

        let claimed = queue.pop().await;
        let idle = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!idle.is_finished());

        queue.complete(claimed.job.job_id);
        tokio::time::timeout(Duration::from_secs(1), idle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_pending_returns_dispatch_order() {
        let queue = JobQueue::new(4);
        queue.admit(job(1, 0), |_| {}).unwrap();
        queue.admit(job(2, 3), |_| {}).unwrap();
        queue.admit(job(3, 0), |_| {}).unwrap();

        let drained: Vec<_> = queue.drain_pending().iter().map(|j| j.submission_id).collect();
        assert_eq!(drained, vec![2, 1, 3]);
        assert_eq!(queue.stats().queued, 0);
        queue.admit(job(1, 0), |_| {}).unwrap();
    }

    #[tokio::test]
    async fn test_requeue_refused_after_pending_jobs_were_drained() {
        let queue = JobQueue::new(4);
        let first = queue.admit(job(1, 0), |_| {}).unwrap();
        queue.admit(job(2, 0), |_| {}).unwrap();
        let claimed = queue.pop().await;

        queue.begin_drain();
        assert_eq!(queue.drain_pending().len(), 1);

        let refused = queue.requeue(claimed.job).unwrap_err();
        assert_eq!(refused.job_id, first);
        assert_eq!(
            (queue.stats().queued, queue.stats().running),
            (0, 1)
        );

        queue.complete(first);
        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .unwrap();
    }
}
