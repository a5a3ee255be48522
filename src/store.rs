//! Collaborators consumed by the execution core.
//!
//! The core never owns submissions or problems. It reads test cases through
//! a [`ProblemProvider`] and writes a terminal result back through a
//! [`SubmissionStore`], exactly once per job.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::{Config, JudgeType, ProblemConfig, ResourceLimits};
use crate::judge::JudgeOutcome;
use crate::queue::SubmissionId;
use crate::status::JobState;

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    pub hidden: bool,
}

/// Read-only problem snapshot taken at admission time
#[derive(Debug, Clone)]
pub struct Problem {
    pub id: u32,
    pub judge_type: JudgeType,
    pub limits: ResourceLimits,
    /// Ordered as defined by the problem
    pub cases: Vec<TestCase>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmission {
    pub user_id: String,
    pub problem_id: u32,
    pub code: String,
    pub language: String,
}

/// Terminal fields written back to the submission record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub status: JobState,
    pub runtime: Option<u64>,
    pub memory: Option<u64>,
    pub test_cases_passed: u32,
    pub total_test_cases: u32,
    pub error_message: Option<String>,
}

impl From<&JudgeOutcome> for SubmissionResult {
    fn from(outcome: &JudgeOutcome) -> Self {
        Self {
            status: outcome.state,
            runtime: outcome.runtime_ms,
            memory: outcome.memory_kb,
            test_cases_passed: outcome.test_cases_passed,
            total_test_cases: outcome.total_test_cases,
            error_message: outcome.error_message.clone(),
        }
    }
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn create(&self, submission: &NewSubmission) -> anyhow::Result<SubmissionId>;

    /// Called by the core exactly once per job, with its terminal verdict
    async fn record_result(
        &self,
        id: SubmissionId,
        result: &SubmissionResult,
    ) -> anyhow::Result<()>;

    /// Drops a record the boundary created but the core refused to admit
    async fn discard(&self, id: SubmissionId) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ProblemProvider: Send + Sync {
    async fn problem(&self, problem_id: u32) -> anyhow::Result<Option<Arc<Problem>>>;
}

/// Submission store kept in process memory
#[derive(Default)]
pub struct MemorySubmissionStore {
    next_id: AtomicU64,
    records: Mutex<HashMap<SubmissionId, MemoryRecord>>,
}

#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub submission: NewSubmission,
    pub status: JobState,
    pub result: Option<SubmissionResult>,
    /// Number of terminal writes received
    pub writes: u32,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: SubmissionId) -> Option<MemoryRecord> {
        self.records.lock().get(&id).cloned()
    }
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn create(&self, submission: &NewSubmission) -> anyhow::Result<SubmissionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.records.lock().insert(
            id,
            MemoryRecord {
                submission: submission.clone(),
                status: JobState::Queued,
                result: None,
                writes: 0,
            },
        );
        Ok(id)
    }

    async fn record_result(
        &self,
        id: SubmissionId,
        result: &SubmissionResult,
    ) -> anyhow::Result<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&id)
            .with_context(|| format!("Submission {id} not found"))?;
        record.status = result.status;
        record.result = Some(result.clone());
        record.writes += 1;
        Ok(())
    }

    async fn discard(&self, id: SubmissionId) -> anyhow::Result<()> {
        self.records.lock().remove(&id);
        Ok(())
    }
}

/// Serves the problems declared in the configuration file
///
/// Input and answer files are read on first use and cached.
pub struct ConfigProblemProvider {
    problems: Vec<ProblemConfig>,
    defaults: ResourceLimits,
    loaded: RwLock<HashMap<u32, Arc<Problem>>>,
}

impl ConfigProblemProvider {
    pub fn new(config: &Config) -> Self {
        Self {
            problems: config.problems.clone(),
            defaults: config.limits,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    async fn load(&self, config: &ProblemConfig) -> anyhow::Result<Problem> {
        let mut cases = Vec::with_capacity(config.cases.len());
        for case in &config.cases {
            let input = tokio::fs::read_to_string(&case.input_file)
                .await
                .with_context(|| format!("Failed to read input file {}", case.input_file))?;
            let expected_output = tokio::fs::read_to_string(&case.answer_file)
                .await
                .with_context(|| format!("Failed to read answer file {}", case.answer_file))?;
            cases.push(TestCase {
                input,
                expected_output,
                hidden: case.hidden,
            });
        }

        let mut limits = self.defaults;
        if let Some(time_limit) = config.time_limit {
            limits.time_limit = time_limit;
        }
        if let Some(memory_limit) = config.memory_limit {
            limits.memory_limit = memory_limit;
        }

        Ok(Problem {
            id: config.id,
            judge_type: config.judge_type,
            limits,
            cases,
        })
    }
}

#[async_trait]
impl ProblemProvider for ConfigProblemProvider {
    async fn problem(&self, problem_id: u32) -> anyhow::Result<Option<Arc<Problem>>> {
        let cached = self.loaded.read().get(&problem_id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let Some(config) = self.problems.iter().find(|p| p.id == problem_id) else {
            return Ok(None);
        };

        let problem = Arc::new(self.load(config).await?);
        log::debug!(
            "Loaded problem {problem_id} with {} test cases",
            problem.cases.len()
        );
        self.loaded.write().insert(problem_id, problem.clone());
        Ok(Some(problem))
    }
}
