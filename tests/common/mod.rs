#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use oj_exec::config::{
    Config, JudgeType, KiloByte, LanguageConfig, MicroSecond, ResourceLimits,
};
use oj_exec::queue::JobId;
use oj_exec::sandbox::{CompileOutcome, ExecutionOutcome, ExitKind, SandboxRunner, SandboxSettings};
use oj_exec::service::{ExecutionService, SubmissionRequest, SubmitReceipt};
use oj_exec::status::{JobState, JobStatus};
use oj_exec::queue::SubmissionId;
use oj_exec::store::{
    MemorySubmissionStore, NewSubmission, Problem, ProblemProvider, SubmissionResult,
    SubmissionStore, TestCase,
};
use oj_exec::error::SubmitError;
use oj_exec::worker::RunnerFactory;

/// Problem with five cases whose answers equal their inputs
pub const FIVE_CASES: u32 = 1;
/// Problem without any test case
pub const NO_CASES: u32 = 2;

pub const LANGUAGE: &str = "Fake";

/// Counters shared by every scripted sandbox of one service
#[derive(Default)]
pub struct Probe {
    pub builds: AtomicUsize,
    pub compilations: AtomicUsize,
    pub executions: AtomicUsize,
    pub flaky_failed: AtomicBool,
}

/// Sandbox whose behaviour is picked by the submitted code
///
/// * `accept` echoes the input, which is the expected answer
/// * `wrong` prints garbage
/// * `compile-error` fails to compile
/// * `tle-on-N` times out on the case whose input is `N`
/// * `block` runs until cancelled
/// * `fault` fails every execution with an infrastructure error
/// * `flaky` fails the very first execution of the service, then accepts
pub struct ScriptedRunner {
    id: u8,
    code: Mutex<String>,
    probe: Arc<Probe>,
}

impl ScriptedRunner {
    fn new(id: u8, probe: Arc<Probe>) -> Self {
        probe.builds.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            code: Mutex::new(String::new()),
            probe,
        }
    }
}

impl SandboxRunner for ScriptedRunner {
    fn build(id: u8, _settings: SandboxSettings) -> Result<Self> {
        Ok(Self::new(id, Arc::new(Probe::default())))
    }

    fn id(&self) -> u8 {
        self.id
    }

    fn prepare(&self, source: &str, _language: &LanguageConfig) -> Result<()> {
        *self.code.lock() = source.to_string();
        Ok(())
    }

    fn compile(
        &self,
        _language: &LanguageConfig,
        _cancel: &CancellationToken,
    ) -> Result<CompileOutcome> {
        self.probe.compilations.fetch_add(1, Ordering::SeqCst);
        if *self.code.lock() == "compile-error" {
            return Ok(CompileOutcome::Failed {
                message: "main.fake:1: syntax error".to_string(),
            });
        }
        Ok(CompileOutcome::Success)
    }

    fn execute(
        &self,
        _language: &LanguageConfig,
        input: &str,
        _limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        self.probe.executions.fetch_add(1, Ordering::SeqCst);
        let code = self.code.lock().clone();

        let status = match code.as_str() {
            "fault" => bail!("sandbox vanished"),
            "flaky" if !self.probe.flaky_failed.swap(true, Ordering::SeqCst) => {
                bail!("sandbox hiccup")
            }
            "block" => {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !cancel.is_cancelled() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                ExitKind::Cancelled
            }
            tle if tle.strip_prefix("tle-on-") == Some(input) => ExitKind::TimedOut,
            _ => ExitKind::Exited(0),
        };

        let stdout = if code == "wrong" {
            "garbage\n".to_string()
        } else {
            format!("{input}\n")
        };

        Ok(ExecutionOutcome {
            status,
            stdout,
            stderr: String::new(),
            runtime_ms: 3,
            memory_kb: 1024,
        })
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Problems kept in memory
pub struct StaticProblems(HashMap<u32, Arc<Problem>>);

impl StaticProblems {
    pub fn new() -> Self {
        let limits = ResourceLimits {
            time_limit: MicroSecond(1_000_000),
            memory_limit: KiloByte(65_536),
            output_limit: KiloByte(1024),
            processes: 4,
        };
        let five = Problem {
            id: FIVE_CASES,
            judge_type: JudgeType::Standard,
            limits,
            cases: (1..=5)
                .map(|i| TestCase {
                    input: i.to_string(),
                    expected_output: format!("{i}\n"),
                    hidden: i == 5,
                })
                .collect(),
        };
        let empty = Problem {
            id: NO_CASES,
            judge_type: JudgeType::Standard,
            limits,
            cases: Vec::new(),
        };
        Self(HashMap::from([
            (FIVE_CASES, Arc::new(five)),
            (NO_CASES, Arc::new(empty)),
        ]))
    }
}

#[async_trait]
impl ProblemProvider for StaticProblems {
    async fn problem(&self, problem_id: u32) -> Result<Option<Arc<Problem>>> {
        Ok(self.0.get(&problem_id).cloned())
    }
}

/// Memory store whose result writes take a while to land
pub struct SlowResults {
    inner: Arc<MemorySubmissionStore>,
    delay: Duration,
}

#[async_trait]
impl SubmissionStore for SlowResults {
    async fn create(&self, submission: &NewSubmission) -> Result<SubmissionId> {
        self.inner.create(submission).await
    }

    async fn record_result(&self, id: SubmissionId, result: &SubmissionResult) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.record_result(id, result).await
    }

    async fn discard(&self, id: SubmissionId) -> Result<()> {
        self.inner.discard(id).await
    }
}

pub fn config(workers: usize, capacity: usize) -> Config {
    serde_json::from_value(json!({
        "execution": {
            "workers": workers,
            "queue_capacity": capacity,
            "max_source_bytes": 64,
        },
        "languages": [
            {
                "name": LANGUAGE,
                "file_name": "main.fake",
                "compile": ["fakec", "%INPUT%", "-o", "%OUTPUT%"],
            }
        ]
    }))
    .unwrap()
}

pub struct Harness {
    pub service: Arc<ExecutionService>,
    pub store: Arc<MemorySubmissionStore>,
    pub probe: Arc<Probe>,
}

impl Harness {
    pub fn start(workers: usize, capacity: usize) -> Self {
        Self::start_with_result_delay(workers, capacity, Duration::ZERO)
    }

    /// Starts a service whose result writes are held back by `delay`
    pub fn start_with_result_delay(workers: usize, capacity: usize, delay: Duration) -> Self {
        let probe = Arc::new(Probe::default());
        let factory_probe = probe.clone();
        let factory: RunnerFactory = Arc::new(move |id| {
            Ok(Box::new(ScriptedRunner::new(id, factory_probe.clone())) as Box<dyn SandboxRunner>)
        });
        let store = Arc::new(MemorySubmissionStore::new());
        let submissions: Arc<dyn SubmissionStore> = if delay.is_zero() {
            store.clone()
        } else {
            Arc::new(SlowResults {
                inner: store.clone(),
                delay,
            })
        };
        let service = ExecutionService::start_with_runners(
            &config(workers, capacity),
            Arc::new(StaticProblems::new()),
            submissions,
            factory,
        )
        .unwrap();

        Self {
            service: Arc::new(service),
            store,
            probe,
        }
    }

    /// Creates the submission record, then hands it to the core
    pub async fn submit(&self, code: &str) -> Result<SubmitReceipt, SubmitError> {
        self.submit_to(FIVE_CASES, code).await
    }

    pub async fn submit_to(&self, problem_id: u32, code: &str) -> Result<SubmitReceipt, SubmitError> {
        let submission_id = self
            .store
            .create(&NewSubmission {
                user_id: "alice".to_string(),
                problem_id,
                code: code.to_string(),
                language: LANGUAGE.to_string(),
            })
            .await
            .unwrap();
        self.service
            .submit(SubmissionRequest {
                submission_id,
                user_id: "alice".to_string(),
                problem_id,
                code: code.to_string(),
                language: LANGUAGE.to_string(),
                priority: None,
            })
            .await
    }

    /// Polls until the job reaches `state`
    pub async fn wait_for(&self, job_id: JobId, state: JobState) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.service.status(job_id).map(|s| s.status) != Some(state) {
            assert!(Instant::now() < deadline, "job {job_id} never reached {state}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Polls until the job is terminal, recording every distinct state seen
    pub async fn poll_until_terminal(&self, job_id: JobId) -> (JobStatus, Vec<JobState>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen: Vec<JobState> = Vec::new();
        loop {
            let status = self.service.status(job_id).expect("status must exist");
            if seen.last() != Some(&status.status) {
                seen.push(status.status);
            }
            if status.status.is_terminal() {
                return (status, seen);
            }
            assert!(Instant::now() < deadline, "job {job_id} never finished");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

/// Whether `seen` is a prefix of QUEUED → RUNNING → terminal
pub fn is_lifecycle_prefix(seen: &[JobState]) -> bool {
    let rank = |state: &JobState| match state {
        JobState::Queued => 0,
        JobState::Running => 1,
        _ => 2,
    };
    seen.windows(2).all(|pair| rank(&pair[0]) < rank(&pair[1]))
        && seen.iter().filter(|s| s.is_terminal()).count() <= 1
}
