use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::create_timestamp;
use crate::judge::JudgeOutcome;
use crate::queue::{JobId, SubmissionId};

/// Lifecycle state of a job; everything after `Running` is terminal
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompilationError,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: JobState) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Accepted => "ACCEPTED",
            Self::WrongAnswer => "WRONG_ANSWER",
            Self::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            Self::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::CompilationError => "COMPILATION_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned to pollers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: JobId,
    pub submission_id: SubmissionId,
    pub status: JobState,
    pub test_cases_passed: u32,
    pub total_test_cases: u32,
    /// Milliseconds, max over executed cases
    pub runtime: Option<u64>,
    /// Kilobytes, max over executed cases
    pub memory: Option<u64>,
    pub error_message: Option<String>,
    pub attempt: u32,
    pub updated_at: String,
}

#[derive(Default)]
struct StatusMap {
    entries: HashMap<JobId, JobStatus>,
    /// Terminal jobs in the order they finished, used for eviction
    finished: VecDeque<JobId>,
}

/// Concurrency-safe map from job id to its current status
///
/// Every write happens under the write lock and replaces whole fields of one
/// entry, so readers never observe a half-published result.
pub struct StatusStore {
    inner: RwLock<StatusMap>,
    retention: usize,
}

impl StatusStore {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: RwLock::new(StatusMap::default()),
            retention: retention.max(1),
        }
    }

    pub fn insert_queued(&self, job_id: JobId, submission_id: SubmissionId, total_test_cases: u32) {
        let status = JobStatus {
            job_id,
            submission_id,
            status: JobState::Queued,
            test_cases_passed: 0,
            total_test_cases,
            runtime: None,
            memory: None,
            error_message: None,
            attempt: 0,
            updated_at: create_timestamp(),
        };
        self.inner.write().entries.insert(job_id, status);
    }

    /// Moves a job to `Running`; a retried job stays `Running` with a bumped attempt
    pub fn mark_running(&self, job_id: JobId, attempt: u32) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.entries.get_mut(&job_id) else {
            log::warn!("Cannot mark unknown job {job_id} as running");
            return false;
        };

        match entry.status {
            JobState::Queued | JobState::Running => {
                entry.status = JobState::Running;
                entry.attempt = attempt;
                entry.updated_at = create_timestamp();
                true
            }
            state => {
                log::warn!("Refusing to move job {job_id} from {state} to RUNNING");
                false
            }
        }
    }

    /// Publishes a terminal outcome in a single write
    pub fn publish(&self, job_id: JobId, outcome: &JudgeOutcome) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.entries.get_mut(&job_id) else {
            log::warn!("Cannot publish result of unknown job {job_id}");
            return false;
        };

        if !entry.status.can_transition_to(outcome.state) {
            log::warn!(
                "Refusing to move job {job_id} from {} to {}",
                entry.status,
                outcome.state
            );
            return false;
        }

        entry.status = outcome.state;
        entry.test_cases_passed = outcome.test_cases_passed;
        entry.total_test_cases = outcome.total_test_cases;
        entry.runtime = outcome.runtime_ms;
        entry.memory = outcome.memory_kb;
        entry.error_message = outcome.error_message.clone();
        entry.updated_at = create_timestamp();

        inner.finished.push_back(job_id);
        while inner.finished.len() > self.retention {
            if let Some(evicted) = inner.finished.pop_front() {
                inner.entries.remove(&evicted);
                log::debug!("Evicted status of finished job {evicted}");
            }
        }

        true
    }

    pub fn get(&self, job_id: JobId) -> Option<JobStatus> {
        self.inner.read().entries.get(&job_id).cloned()
    }

    pub fn state(&self, job_id: JobId) -> Option<JobState> {
        self.inner.read().entries.get(&job_id).map(|s| s.status)
    }
}
