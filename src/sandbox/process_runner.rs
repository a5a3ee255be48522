use std::fs;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{LanguageConfig, ResourceLimits, apply_template};

use super::{
    CompileOutcome, EXECUTABLE_NAME, ExecutionOutcome, ExitKind, SandboxRunner, SandboxSettings,
    truncate_message,
};

const STDERR_CAPTURE_LIMIT: u64 = 64 * 1024;
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(5);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Per-process data segment ceiling, as a multiple of the memory limit
///
/// The watchdog enforces the limit itself; this only bounds what a single
/// process can grab between two samples.
const DATA_BACKSTOP_FACTOR: u64 = 4;

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A runner that executes code as plain child processes
///
/// Every program runs in its own process group with CPU-time and file-size
/// rlimits. Wall clock, resident memory of the whole group and stdout size are
/// enforced by the supervisor, which kills the whole group on breach. There is no
/// filesystem or network isolation; use `IsolateRunner` for untrusted hosts.
pub struct ProcessRunner {
    /// Unique identifier for this instance
    id: u8,
    /// Path to the working directory for this runner
    work_dir: PathBuf,
    settings: SandboxSettings,
}

enum Stop {
    Exited(ExitStatus),
    WaitFailed(io::Error),
    TimedOut,
    MemoryExceeded,
    OutputExceeded,
    Cancelled,
}

impl SandboxRunner for ProcessRunner {
    fn build(id: u8, settings: SandboxSettings) -> Result<Self> {
        let work_dir = Self::create_work_directory(id)?;

        log::info!("ProcessRunner {id} initialized in {}", work_dir.display());
        log::warn!(
            "ProcessRunner provides NO filesystem or network isolation - use only in trusted environments"
        );

        Ok(Self {
            id,
            work_dir,
            settings,
        })
    }

    fn id(&self) -> u8 {
        self.id
    }

    fn prepare(&self, source: &str, language: &LanguageConfig) -> Result<()> {
        self.cleanup_work_dir()?;
        fs::write(
            self.work_dir.join(&language.file_name),
            format!("{source}\n"),
        )
        .context("Failed to stage source file")?;
        Ok(())
    }

    fn compile(
        &self,
        language: &LanguageConfig,
        cancel: &CancellationToken,
    ) -> Result<CompileOutcome> {
        let Some(template) = language.compile.as_ref().filter(|c| !c.is_empty()) else {
            return Ok(CompileOutcome::Success);
        };
        let command = apply_template(template, &language.file_name, EXECUTABLE_NAME);

        let outcome = tokio::runtime::Handle::current().block_on(self.supervise(
            &command,
            String::new(),
            &self.settings.compile_limits,
            cancel,
        ))?;

        let message = |reason: &str| {
            let output = format!("{}{}", outcome.stdout, outcome.stderr);
            if output.trim().is_empty() {
                reason.to_string()
            } else {
                truncate_message(&output)
            }
        };

        Ok(match outcome.status {
            ExitKind::Exited(0) => CompileOutcome::Success,
            ExitKind::Cancelled => CompileOutcome::Cancelled,
            ExitKind::TimedOut => CompileOutcome::Failed {
                message: "Compilation timed out".to_string(),
            },
            ExitKind::MemoryExceeded => CompileOutcome::Failed {
                message: "Compiler exceeded the memory limit".to_string(),
            },
            ExitKind::OutputExceeded => CompileOutcome::Failed {
                message: "Compiler output exceeded the output limit".to_string(),
            },
            ExitKind::Exited(code) => CompileOutcome::Failed {
                message: message(&format!("Compiler exited with code {code}")),
            },
            ExitKind::Signaled(signal) => CompileOutcome::Failed {
                message: message(&format!("Compiler killed by signal {signal}")),
            },
        })
    }

    fn execute(
        &self,
        language: &LanguageConfig,
        input: &str,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let command = apply_template(&language.run, &language.file_name, EXECUTABLE_NAME);
        tokio::runtime::Handle::current().block_on(self.supervise(
            &command,
            input.to_string(),
            limits,
            cancel,
        ))
    }

    fn release(&self) -> Result<()> {
        self.cleanup_work_dir()
    }
}

impl ProcessRunner {
    /// Creates a working directory unique to this runner instance
    fn create_work_directory(id: u8) -> Result<PathBuf> {
        let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let work_dir = std::env::temp_dir()
            .join("oj-exec")
            .join(format!("{}-{instance}-{id}", std::process::id()));
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;
        Ok(work_dir)
    }

    /// Cleans the working directory
    fn cleanup_work_dir(&self) -> Result<()> {
        if self.work_dir.exists() {
            fs::remove_dir_all(&self.work_dir)?;
        }
        fs::create_dir_all(&self.work_dir)?;
        Ok(())
    }

    /// Resolves `./program` against the work directory
    fn resolve_program(&self, program: &str) -> PathBuf {
        match program.strip_prefix("./") {
            Some(relative) => self.work_dir.join(relative),
            None => PathBuf::from(program),
        }
    }

    /// Spawns `command` and supervises it until it ends or breaks a ceiling
    async fn supervise(
        &self,
        command: &[String],
        input: String,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("Empty command"))?;

        let cpu_seconds = limits.time_limit.0.div_ceil(1_000_000) + 1;
        let file_bytes = limits.output_limit.as_bytes();
        let data_bytes = limits
            .memory_limit
            .as_bytes()
            .saturating_mul(DATA_BACKSTOP_FACTOR);

        let mut cmd = tokio::process::Command::new(self.resolve_program(program));
        cmd.args(args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // SAFETY: only async-signal-safe libc calls run between fork and exec
        unsafe {
            cmd.pre_exec(move || apply_process_limits(cpu_seconds, file_bytes, data_bytes));
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {program}"))?;
        let pid = child
            .id()
            .context("Sandboxed process exited before supervision")? as i32;
        let start = Instant::now();

        let stdin = child.stdin.take();
        let feeder = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // A closed pipe only means the program stopped reading
                let _ = stdin.write_all(input.as_bytes()).await;
                let _ = stdin.shutdown().await;
            }
        });

        let overflow = CancellationToken::new();
        let stdout = child.stdout.take().context("stdout was not captured")?;
        let stderr = child.stderr.take().context("stderr was not captured")?;
        let stdout_task = tokio::spawn(read_capped(
            stdout,
            limits.output_limit.as_bytes(),
            Some(overflow.clone()),
        ));
        let stderr_task = tokio::spawn(read_capped(stderr, STDERR_CAPTURE_LIMIT, None));

        let wall_budget =
            Duration::from(limits.time_limit) + Duration::from(self.settings.wall_grace);
        let deadline = tokio::time::sleep(wall_budget);
        tokio::pin!(deadline);
        let mut sampler = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);
        let mut peak_kb = 0;

        let stop = loop {
            tokio::select! {
                status = child.wait() => break match status {
                    Ok(status) => Stop::Exited(status),
                    Err(e) => Stop::WaitFailed(e),
                },
                _ = &mut deadline => break Stop::TimedOut,
                _ = cancel.cancelled() => break Stop::Cancelled,
                _ = overflow.cancelled() => break Stop::OutputExceeded,
                _ = sampler.tick() => {
                    // The group total catches memory held by forked children
                    let leader_peak = status_field_kb(pid, "VmHWM:").unwrap_or_default();
                    let group_now = group_resident_kb(pid).unwrap_or_default();
                    peak_kb = peak_kb.max(leader_peak).max(group_now);
                    if peak_kb > limits.memory_limit.0 {
                        break Stop::MemoryExceeded;
                    }
                }
            }
        };
        let elapsed = start.elapsed();

        // Take down the whole group, including anything the program forked
        kill_process_group(pid);
        if !matches!(stop, Stop::Exited(_)) {
            let _ = child.wait().await;
        }
        feeder.abort();

        let (stdout, stdout_overflowed) = collect_output(stdout_task).await;
        let (stderr, _) = collect_output(stderr_task).await;

        let status = match stop {
            Stop::WaitFailed(e) => {
                return Err(e).context("Failed to wait for sandboxed process");
            }
            _ if stdout_overflowed => ExitKind::OutputExceeded,
            Stop::Exited(status) => classify_exit(status, elapsed, limits),
            Stop::TimedOut => ExitKind::TimedOut,
            Stop::MemoryExceeded => ExitKind::MemoryExceeded,
            Stop::OutputExceeded => ExitKind::OutputExceeded,
            Stop::Cancelled => ExitKind::Cancelled,
        };

        log::debug!(
            "ProcessRunner {} finished {program}: {status:?} in {}ms, peak {peak_kb}KB",
            self.id,
            elapsed.as_millis()
        );

        Ok(ExecutionOutcome {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            runtime_ms: elapsed.as_millis() as u64,
            memory_kb: peak_kb,
        })
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.work_dir) {
            log::debug!(
                "Failed to remove work dir {}: {e}",
                self.work_dir.display()
            );
        }
    }
}

/// Runs in the forked child right before `exec`
fn apply_process_limits(cpu_seconds: u64, file_bytes: u64, data_bytes: u64) -> io::Result<()> {
    unsafe {
        if libc::setpgid(0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }

        let cpu = libc::rlimit {
            rlim_cur: cpu_seconds as libc::rlim_t,
            rlim_max: (cpu_seconds + 1) as libc::rlim_t,
        };
        if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
            return Err(io::Error::last_os_error());
        }

        let fsize = libc::rlimit {
            rlim_cur: file_bytes as libc::rlim_t,
            rlim_max: file_bytes as libc::rlim_t,
        };
        if libc::setrlimit(libc::RLIMIT_FSIZE, &fsize) != 0 {
            return Err(io::Error::last_os_error());
        }

        let data = libc::rlimit {
            rlim_cur: data_bytes as libc::rlim_t,
            rlim_max: data_bytes as libc::rlim_t,
        };
        if libc::setrlimit(libc::RLIMIT_DATA, &data) != 0 {
            return Err(io::Error::last_os_error());
        }

        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let _ = libc::setrlimit(libc::RLIMIT_CORE, &core);
    }
    Ok(())
}

fn kill_process_group(pgid: i32) {
    // ESRCH just means the group is already gone
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

/// Reads a `kB` field such as `VmHWM:` from `/proc/<pid>/status`
fn status_field_kb(pid: i32, field: &str) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|value| value.trim().trim_end_matches("kB").trim().parse().ok())
}

/// Process group of a live process, the fifth field of `/proc/<pid>/stat`
fn process_group(pid: i32) -> Option<i32> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces or parentheses; fields resume after the last ')'
    let (_, fields) = stat.rsplit_once(')')?;
    fields.split_whitespace().nth(2)?.parse().ok()
}

/// Current resident memory summed over every live process of the group
fn group_resident_kb(pgid: i32) -> Option<u64> {
    let mut total = None;
    for entry in fs::read_dir("/proc").ok()?.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        if process_group(pid) != Some(pgid) {
            continue;
        }
        if let Some(kb) = status_field_kb(pid, "VmRSS:") {
            *total.get_or_insert(0) += kb;
        }
    }
    total
}

fn classify_exit(status: ExitStatus, elapsed: Duration, limits: &ResourceLimits) -> ExitKind {
    if elapsed > Duration::from(limits.time_limit) {
        return ExitKind::TimedOut;
    }

    if let Some(signal) = status.signal() {
        return match signal {
            libc::SIGXCPU => ExitKind::TimedOut,
            libc::SIGXFSZ => ExitKind::OutputExceeded,
            _ => ExitKind::Signaled(signal),
        };
    }

    ExitKind::Exited(status.code().unwrap_or(-1))
}

/// Reads a stream to its end, keeping at most `limit` bytes
///
/// Bytes past the limit are drained and dropped so the writer never blocks;
/// `overflow` is fired the first time the limit is crossed.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: u64,
    overflow: Option<CancellationToken>,
) -> io::Result<(Vec<u8>, bool)> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut overflowed = false;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok((buffer, overflowed));
        }

        let room = limit.saturating_sub(buffer.len() as u64) as usize;
        buffer.extend_from_slice(&chunk[..n.min(room)]);
        if n > room && !overflowed {
            overflowed = true;
            if let Some(token) = &overflow {
                token.cancel();
            }
        }
    }
}

async fn collect_output(task: JoinHandle<io::Result<(Vec<u8>, bool)>>) -> (Vec<u8>, bool) {
    let abort = task.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(Ok(output))) => output,
        Ok(Ok(Err(e))) => {
            log::warn!("Failed to read sandbox output: {e}");
            (Vec::new(), false)
        }
        Ok(Err(e)) => {
            log::warn!("Sandbox output reader failed: {e}");
            (Vec::new(), false)
        }
        Err(_) => {
            // A descendant escaped the process group and still holds the pipe
            abort.abort();
            log::warn!("Timed out draining sandbox output");
            (Vec::new(), false)
        }
    }
}
