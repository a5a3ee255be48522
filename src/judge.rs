use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::{JudgePolicy, JudgeType};
use crate::queue::ExecutionJob;
use crate::sandbox::{CompileOutcome, ExecutionOutcome, ExitKind, SandboxRunner, truncate_message};
use crate::status::JobState;
use crate::store::TestCase;

/// Why a single test case failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    WrongAnswer,
    TimeLimit,
    MemoryLimit,
    RuntimeFault,
    Cancelled,
}

impl FailureKind {
    pub fn verdict(self) -> JobState {
        match self {
            Self::WrongAnswer => JobState::WrongAnswer,
            Self::TimeLimit => JobState::TimeLimitExceeded,
            Self::MemoryLimit => JobState::MemoryLimitExceeded,
            Self::RuntimeFault => JobState::RuntimeError,
            Self::Cancelled => JobState::Cancelled,
        }
    }
}

/// Result of one test case
#[derive(Debug, Clone, PartialEq)]
pub struct CaseResult {
    /// 1-based position in the problem's case list
    pub index: usize,
    pub passed: bool,
    pub actual_output: String,
    pub runtime_ms: u64,
    pub memory_kb: u64,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
}

/// Terminal verdict of a job, published to the status store as one unit
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeOutcome {
    pub state: JobState,
    pub test_cases_passed: u32,
    pub total_test_cases: u32,
    pub runtime_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    pub error_message: Option<String>,
    pub cases: Vec<CaseResult>,
}

impl JudgeOutcome {
    pub fn cancelled(total_test_cases: u32) -> Self {
        Self {
            state: JobState::Cancelled,
            test_cases_passed: 0,
            total_test_cases,
            runtime_ms: None,
            memory_kb: None,
            error_message: Some("Cancelled".to_string()),
            cases: Vec::new(),
        }
    }

    pub fn compilation_error(total_test_cases: u32, message: String) -> Self {
        Self {
            state: JobState::CompilationError,
            test_cases_passed: 0,
            total_test_cases,
            runtime_ms: None,
            memory_kb: None,
            error_message: Some(message),
            cases: Vec::new(),
        }
    }

    /// Terminal result of a job whose sandbox kept failing
    pub fn internal_error(total_test_cases: u32) -> Self {
        Self {
            state: JobState::RuntimeError,
            test_cases_passed: 0,
            total_test_cases,
            runtime_ms: None,
            memory_kb: None,
            error_message: Some("Internal error while executing the submission".to_string()),
            cases: Vec::new(),
        }
    }

    /// Aggregates executed cases into a verdict
    ///
    /// The verdict is the kind of the first failing case, or `Accepted` when
    /// none failed. Runtime and memory are maxima over executed cases.
    pub fn from_cases(total_test_cases: u32, cases: Vec<CaseResult>) -> Self {
        let first_failure = cases.iter().find(|c| !c.passed);
        let (state, error_message) = match first_failure {
            Some(case) => (
                case.failure.unwrap_or(FailureKind::RuntimeFault).verdict(),
                case.message.clone(),
            ),
            None => (JobState::Accepted, None),
        };

        Self {
            state,
            test_cases_passed: cases.iter().filter(|c| c.passed).count() as u32,
            total_test_cases,
            runtime_ms: cases.iter().map(|c| c.runtime_ms).max(),
            memory_kb: cases.iter().map(|c| c.memory_kb).max(),
            error_message,
            cases,
        }
    }
}

/// Compiles and runs a job against every test case of its problem
///
/// Returns `Err` only for infrastructure faults; every verdict, including
/// compile failures and cancellation, is an `Ok` outcome.
pub fn judge_submission(
    runner: &dyn SandboxRunner,
    job: &ExecutionJob,
    policy: JudgePolicy,
    cancel: &CancellationToken,
) -> Result<JudgeOutcome> {
    let problem = &job.problem;
    let total = problem.cases.len() as u32;

    runner.prepare(&job.code, &job.language)?;

    if job.language.needs_compilation() {
        match runner.compile(&job.language, cancel)? {
            CompileOutcome::Success => {
                log::debug!("Job {} compiled on sandbox {}", job.job_id, runner.id());
            }
            CompileOutcome::Failed { message } => {
                return Ok(JudgeOutcome::compilation_error(total, message));
            }
            CompileOutcome::Cancelled => return Ok(JudgeOutcome::cancelled(total)),
        }
    }

    let mut results = Vec::with_capacity(problem.cases.len());
    for (idx, case) in problem.cases.iter().enumerate() {
        if cancel.is_cancelled() {
            let mut outcome = JudgeOutcome::from_cases(total, results);
            outcome.state = JobState::Cancelled;
            outcome.error_message = Some("Cancelled".to_string());
            return Ok(outcome);
        }

        let execution = runner.execute(&job.language, &case.input, &problem.limits, cancel)?;
        let result = classify_case(idx + 1, case, problem.judge_type, execution);
        let stop = !result.passed
            && (policy == JudgePolicy::StopOnFirstFailure
                || result.failure == Some(FailureKind::Cancelled));
        results.push(result);

        if stop {
            break;
        }
    }

    Ok(JudgeOutcome::from_cases(total, results))
}

/// Turns a single sandbox run into a case result
pub fn classify_case(
    index: usize,
    case: &TestCase,
    judge_type: JudgeType,
    execution: ExecutionOutcome,
) -> CaseResult {
    let ExecutionOutcome {
        status,
        stdout,
        stderr,
        runtime_ms,
        memory_kb,
    } = execution;

    let failure = match status {
        ExitKind::Exited(0) if outputs_match(judge_type, &stdout, &case.expected_output) => None,
        ExitKind::Exited(0) => Some((
            FailureKind::WrongAnswer,
            format!("Wrong answer on test case {index}"),
        )),
        ExitKind::Exited(code) => Some((
            FailureKind::RuntimeFault,
            runtime_message(
                format!("Runtime error on test case {index}: exited with code {code}"),
                case,
                &stderr,
            ),
        )),
        ExitKind::Signaled(signal) => Some((
            FailureKind::RuntimeFault,
            runtime_message(
                format!("Runtime error on test case {index}: killed by signal {signal}"),
                case,
                &stderr,
            ),
        )),
        ExitKind::OutputExceeded => Some((
            FailureKind::RuntimeFault,
            format!("Output limit exceeded on test case {index}"),
        )),
        ExitKind::TimedOut => Some((
            FailureKind::TimeLimit,
            format!("Time limit exceeded on test case {index}"),
        )),
        ExitKind::MemoryExceeded => Some((
            FailureKind::MemoryLimit,
            format!("Memory limit exceeded on test case {index}"),
        )),
        ExitKind::Cancelled => Some((FailureKind::Cancelled, "Cancelled".to_string())),
    };

    let (failure, message) = failure.unzip();
    CaseResult {
        index,
        passed: failure.is_none(),
        actual_output: truncate_message(&stdout),
        runtime_ms,
        memory_kb,
        failure,
        message,
    }
}

/// Appends a stderr excerpt, except for hidden cases
fn runtime_message(headline: String, case: &TestCase, stderr: &str) -> String {
    let stderr = stderr.trim();
    if case.hidden || stderr.is_empty() {
        headline
    } else {
        truncate_message(&format!("{headline}\n{stderr}"))
    }
}

/// Compares program output with expected output under the problem's judge type
pub fn outputs_match(judge_type: JudgeType, program_output: &str, expected_output: &str) -> bool {
    match judge_type {
        JudgeType::Standard => compare_output_standard(program_output, expected_output),
        JudgeType::Strict => compare_output_strict(program_output, expected_output),
        JudgeType::Numeric { tolerance } => {
            compare_output_numeric(program_output, expected_output, tolerance)
        }
    }
}

/// Compares program output with expected output using standard mode
///
/// Standard mode ignores trailing empty lines and trailing spaces on each line.
fn compare_output_standard(program_output: &str, expected_output: &str) -> bool {
    let normalize = |s: &str| -> String {
        s.lines()
            .map(|line| line.trim_end())
            .collect::<Vec<_>>()
            .join("\n")
            .trim_end()
            .to_string()
    };

    normalize(program_output) == normalize(expected_output)
}

#[inline]
fn compare_output_strict(program_output: &str, expected_output: &str) -> bool {
    program_output == expected_output
}

/// Token-wise comparison where numbers may differ by `tolerance`
///
/// Two numeric tokens match when their absolute or relative difference is
/// within the tolerance. Any other token must match exactly.
fn compare_output_numeric(program_output: &str, expected_output: &str, tolerance: f64) -> bool {
    let actual: Vec<&str> = program_output.split_whitespace().collect();
    let expected: Vec<&str> = expected_output.split_whitespace().collect();

    actual.len() == expected.len()
        && actual
            .iter()
            .zip(&expected)
            .all(|(a, e)| a == e || numbers_close(a, e, tolerance))
}

fn numbers_close(actual: &str, expected: &str, tolerance: f64) -> bool {
    let (Ok(a), Ok(e)) = (actual.parse::<f64>(), expected.parse::<f64>()) else {
        return false;
    };
    if !a.is_finite() || !e.is_finite() {
        return false;
    }
    let diff = (a - e).abs();
    diff <= tolerance || diff <= tolerance * e.abs()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{KiloByte, LanguageConfig, MicroSecond, ResourceLimits};
    use crate::queue::JobId;
    use crate::sandbox::SandboxSettings;
    use crate::store::Problem;

    /// Runner whose behaviour is scripted by test case input
    struct ScriptedRunner {
        compile: CompileOutcome,
        by_input: HashMap<String, ExitKind>,
        executions: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(compile: CompileOutcome, by_input: &[(&str, ExitKind)]) -> Self {
            Self {
                compile,
                by_input: by_input
                    .iter()
                    .map(|(input, kind)| (input.to_string(), *kind))
                    .collect(),
                executions: AtomicUsize::new(0),
            }
        }
    }

    impl SandboxRunner for ScriptedRunner {
        fn build(_id: u8, _settings: SandboxSettings) -> Result<Self> {
            Ok(Self::new(CompileOutcome::Success, &[]))
        }

        fn id(&self) -> u8 {
            0
        }

        fn prepare(&self, _source: &str, _language: &LanguageConfig) -> Result<()> {
            Ok(())
        }

        fn compile(
            &self,
            _language: &LanguageConfig,
            _cancel: &CancellationToken,
        ) -> Result<CompileOutcome> {
            Ok(self.compile.clone())
        }

        fn execute(
            &self,
            _language: &LanguageConfig,
            input: &str,
            _limits: &ResourceLimits,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionOutcome> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            // Echo the expected answer, which tests keep equal to the input
            Ok(ExecutionOutcome {
                status: self
                    .by_input
                    .get(input)
                    .copied()
                    .unwrap_or(ExitKind::Exited(0)),
                stdout: format!("{input}\n"),
                stderr: "boom".to_string(),
                runtime_ms: input.len() as u64,
                memory_kb: 1000 + input.len() as u64,
            })
        }

        fn release(&self) -> Result<()> {
            Ok(())
        }
    }

    fn job(inputs: &[&str]) -> ExecutionJob {
        let cases = inputs
            .iter()
            .map(|input| TestCase {
                input: input.to_string(),
                expected_output: format!("{input}\n"),
                hidden: false,
            })
            .collect();
        ExecutionJob {
            job_id: JobId(1),
            submission_id: 1,
            user_id: "alice".to_string(),
            problem: Arc::new(Problem {
                id: 0,
                judge_type: JudgeType::Standard,
                limits: ResourceLimits {
                    time_limit: MicroSecond(1_000_000),
                    memory_limit: KiloByte(65_536),
                    output_limit: KiloByte(1024),
                    processes: 4,
                },
                cases,
            }),
            language: Arc::new(LanguageConfig {
                name: "C".to_string(),
                file_name: "main.c".to_string(),
                compile: Some(vec!["cc".to_string(), "%INPUT%".to_string()]),
                run: vec!["./main".to_string()],
            }),
            code: Arc::from("int main() {}"),
            priority: 0,
            enqueued_at: Utc::now(),
            sequence: 1,
            attempt: 1,
        }
    }

    #[test]
    fn test_all_cases_pass() {
        let runner = ScriptedRunner::new(CompileOutcome::Success, &[]);
        let outcome = judge_submission(
            &runner,
            &job(&["a", "bb", "ccc"]),
            JudgePolicy::StopOnFirstFailure,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(outcome.state, JobState::Accepted);
        assert_eq!(outcome.test_cases_passed, 3);
        assert_eq!(outcome.total_test_cases, 3);
        assert_eq!(outcome.runtime_ms, Some(3));
        assert_eq!(outcome.memory_kb, Some(1003));
        assert_eq!(outcome.error_message, None);
    }

    #[test]
    fn test_time_limit_on_second_of_five_stops_judging() {
        let runner = ScriptedRunner::new(CompileOutcome::Success, &[("2", ExitKind::TimedOut)]);
        let outcome = judge_submission(
            &runner,
            &job(&["1", "2", "3", "4", "5"]),
            JudgePolicy::StopOnFirstFailure,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(outcome.state, JobState::TimeLimitExceeded);
        assert_eq!(outcome.test_cases_passed, 1);
        assert_eq!(outcome.total_test_cases, 5);
        assert_eq!(runner.executions.load(Ordering::SeqCst), 2);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("Time limit exceeded on test case 2")
        );
    }

    #[test]
    fn test_run_all_counts_every_pass() {
        let runner = ScriptedRunner::new(
            CompileOutcome::Success,
            &[("2", ExitKind::Exited(1)), ("4", ExitKind::TimedOut)],
        );
        let outcome = judge_submission(
            &runner,
            &job(&["1", "2", "3", "4", "5"]),
            JudgePolicy::RunAll,
            &CancellationToken::new(),
        )
        .unwrap();

        // Verdict is the first failure, count covers every passing case
        assert_eq!(outcome.state, JobState::RuntimeError);
        assert_eq!(outcome.test_cases_passed, 3);
        assert_eq!(runner.executions.load(Ordering::SeqCst), 5);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("Runtime error on test case 2: exited with code 1\nboom")
        );
    }

    #[test]
    fn test_compilation_error_runs_nothing() {
        let runner = ScriptedRunner::new(
            CompileOutcome::Failed {
                message: "main.c:1: error: expected ';'".to_string(),
            },
            &[],
        );
        let outcome = judge_submission(
            &runner,
            &job(&["1", "2"]),
            JudgePolicy::StopOnFirstFailure,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(outcome.state, JobState::CompilationError);
        assert_eq!(outcome.test_cases_passed, 0);
        assert_eq!(outcome.total_test_cases, 2);
        assert_eq!(runner.executions.load(Ordering::SeqCst), 0);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("main.c:1: error: expected ';'")
        );
    }

    #[test]
    fn test_cancelled_before_execution() {
        let runner = ScriptedRunner::new(CompileOutcome::Success, &[]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = judge_submission(
            &runner,
            &job(&["1", "2"]),
            JudgePolicy::StopOnFirstFailure,
            &cancel,
        )
        .unwrap();

        assert_eq!(outcome.state, JobState::Cancelled);
        assert_eq!(runner.executions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancelled_run_stops_even_when_running_all() {
        let runner = ScriptedRunner::new(CompileOutcome::Success, &[("2", ExitKind::Cancelled)]);
        let outcome = judge_submission(
            &runner,
            &job(&["1", "2", "3"]),
            JudgePolicy::RunAll,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(outcome.state, JobState::Cancelled);
        assert_eq!(outcome.test_cases_passed, 1);
        assert_eq!(runner.executions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hidden_case_hides_stderr() {
        let case = TestCase {
            input: "secret".to_string(),
            expected_output: "42\n".to_string(),
            hidden: true,
        };
        let result = classify_case(
            3,
            &case,
            JudgeType::Standard,
            ExecutionOutcome {
                status: ExitKind::Signaled(11),
                stdout: String::new(),
                stderr: "secret stack trace".to_string(),
                runtime_ms: 5,
                memory_kb: 512,
            },
        );

        assert!(!result.passed);
        assert_eq!(result.failure, Some(FailureKind::RuntimeFault));
        assert_eq!(
            result.message.as_deref(),
            Some("Runtime error on test case 3: killed by signal 11")
        );
    }

    #[test]
    fn test_output_exceeded_is_a_runtime_fault() {
        let case = TestCase {
            input: String::new(),
            expected_output: "1\n".to_string(),
            hidden: false,
        };
        let result = classify_case(
            1,
            &case,
            JudgeType::Standard,
            ExecutionOutcome {
                status: ExitKind::OutputExceeded,
                stdout: "1".repeat(100),
                stderr: String::new(),
                runtime_ms: 5,
                memory_kb: 512,
            },
        );
        assert_eq!(result.failure.map(FailureKind::verdict), Some(JobState::RuntimeError));
    }

    #[test]
    fn test_compare_standard() {
        assert!(outputs_match(JudgeType::Standard, "3  \n\n\n", "3\n"));
        assert!(outputs_match(JudgeType::Standard, "1 2\r\n3", "1 2\n3\n"));
        assert!(!outputs_match(JudgeType::Standard, "1  2\n", "1 2\n"));
        assert!(!outputs_match(JudgeType::Standard, "\n3\n", "3\n"));
    }

    #[test]
    fn test_compare_strict() {
        assert!(outputs_match(JudgeType::Strict, "3\n", "3\n"));
        assert!(!outputs_match(JudgeType::Strict, "3", "3\n"));
        assert!(!outputs_match(JudgeType::Strict, "3 \n", "3\n"));
    }

    #[test]
    fn test_compare_numeric() {
        let numeric = JudgeType::Numeric { tolerance: 1e-6 };
        assert!(outputs_match(numeric, "3.0000001\n", "3\n"));
        assert!(outputs_match(numeric, "1000000.5", "1000000.0"));
        assert!(outputs_match(numeric, "YES 0.5", "YES\n0.5"));
        assert!(!outputs_match(numeric, "3.01", "3"));
        assert!(!outputs_match(numeric, "3 4", "3"));
        assert!(!outputs_match(numeric, "NaN", "1"));
        assert!(!outputs_match(numeric, "yes 0.5", "YES 0.5"));
    }
}
