use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio_util::sync::CancellationToken;

use crate::config::{LanguageConfig, MicroSecond, ResourceLimits, apply_template};

use super::{
    CompileOutcome, EXECUTABLE_NAME, ExecutionOutcome, ExitKind, SandboxRunner, SandboxSettings,
    truncate_message,
};

const RUNTIME_OPEN_FILES: u32 = 30;
const COMPILE_OPEN_FILES: u32 = 512;

// Sandbox cache directory permissions
const CACHE_DIR_PERMISSIONS: u32 = 0o700;

const INPUT_FILE: &str = "input.txt";
const OUTPUT_FILE: &str = "output.txt";
const ERROR_FILE: &str = "error.txt";
const COMPILE_OUTPUT_FILE: &str = "compile_output.txt";

/// A sandbox environment for compiling and executing code safely using isolate
///
/// Every run happens inside an isolate box with its own namespaces and a
/// control group enforcing memory, process count and file size ceilings.
pub struct IsolateRunner {
    /// Unique identifier for this sandbox instance
    id: u8,
    /// Path to the sandbox's working directory (inside isolate)
    box_dir: PathBuf,
    /// Path to the cache directory holding meta files
    cache_dir: PathBuf,
    settings: SandboxSettings,
}

/// Fields of an isolate meta file
#[derive(Debug, Default, Clone, PartialEq)]
struct Meta {
    status: Option<String>,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    killed: bool,
    oom_killed: bool,
    /// Seconds of CPU time
    time: Option<f64>,
    /// Seconds of wall time
    wall_time: Option<f64>,
    /// Peak control group memory in KB
    memory_kb: Option<u64>,
    message: Option<String>,
}

impl SandboxRunner for IsolateRunner {
    fn build(id: u8, settings: SandboxSettings) -> Result<Self> {
        let cache_dir = Self::setup_cache_directory(id)?;
        let box_dir = Self::initialize_isolate_sandbox(id)?;

        log::info!("IsolateRunner {id} initialized successfully");
        Ok(Self {
            id,
            box_dir,
            cache_dir,
            settings,
        })
    }

    fn id(&self) -> u8 {
        self.id
    }

    fn prepare(&self, source: &str, language: &LanguageConfig) -> Result<()> {
        // Re-running --init wipes the box of a previous job
        Self::initialize_isolate_sandbox(self.id)?;
        fs::write(
            self.box_dir.join(&language.file_name),
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
        let limits = self.settings.compile_limits;
        let meta_path = self.cache_dir.join("compile.meta");
        let mut args = self.limit_args(&limits, COMPILE_OPEN_FILES, &meta_path);
        args.extend(
            ["--stderr-to-stdout", "-o", COMPILE_OUTPUT_FILE, "--"].map(String::from),
        );
        args.extend(boxed_command(template, language));

        let Some(meta) = self.run_with_meta(&args, &meta_path, cancel)? else {
            return Ok(CompileOutcome::Cancelled);
        };
        let compiler_output =
            fs::read_to_string(self.box_dir.join(COMPILE_OUTPUT_FILE)).unwrap_or_default();

        Ok(
            match classify_meta(&meta, &limits, Duration::from(limits.time_limit))? {
                ExitKind::Exited(0) => CompileOutcome::Success,
                ExitKind::TimedOut => CompileOutcome::Failed {
                    message: "Compilation timed out".to_string(),
                },
                ExitKind::MemoryExceeded => CompileOutcome::Failed {
                    message: "Compiler exceeded the memory limit".to_string(),
                },
                _ if compiler_output.trim().is_empty() => CompileOutcome::Failed {
                    message: meta
                        .message
                        .unwrap_or_else(|| "Compilation failed".to_string()),
                },
                _ => CompileOutcome::Failed {
                    message: truncate_message(&compiler_output),
                },
            },
        )
    }

    fn execute(
        &self,
        language: &LanguageConfig,
        input: &str,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        fs::write(self.box_dir.join(INPUT_FILE), input).context("Failed to stage input")?;
        for stale in [OUTPUT_FILE, ERROR_FILE] {
            let _ = fs::remove_file(self.box_dir.join(stale));
        }

        let meta_path = self.cache_dir.join("run.meta");
        let mut args = self.limit_args(limits, RUNTIME_OPEN_FILES, &meta_path);
        args.extend(
            [
                "-i",
                INPUT_FILE,
                "-o",
                OUTPUT_FILE,
                "-r",
                ERROR_FILE,
                "--",
            ]
            .map(String::from),
        );
        args.extend(boxed_command(&language.run, language));

        let Some(meta) = self.run_with_meta(&args, &meta_path, cancel)? else {
            return Ok(ExecutionOutcome {
                status: ExitKind::Cancelled,
                stdout: String::new(),
                stderr: String::new(),
                runtime_ms: 0,
                memory_kb: 0,
            });
        };
        let status = classify_meta(&meta, limits, Duration::from(limits.time_limit))?;
        let stdout = read_lossy(&self.box_dir.join(OUTPUT_FILE), limits.output_limit.as_bytes());
        let stderr = read_lossy(&self.box_dir.join(ERROR_FILE), limits.output_limit.as_bytes());

        Ok(ExecutionOutcome {
            status,
            stdout,
            stderr,
            runtime_ms: meta
                .wall_time
                .or(meta.time)
                .map(|secs| (secs * 1000.0) as u64)
                .unwrap_or_default(),
            memory_kb: meta.memory_kb.unwrap_or_default(),
        })
    }

    fn release(&self) -> Result<()> {
        self.cleanup()
    }
}

impl IsolateRunner {
    /// Sets up the cache directory for the sandbox
    fn setup_cache_directory(id: u8) -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "oj-exec")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        let cache_base_dir = proj_dirs.cache_dir();
        fs::create_dir_all(cache_base_dir)?;
        fs::set_permissions(
            cache_base_dir,
            fs::Permissions::from_mode(CACHE_DIR_PERMISSIONS),
        )?;

        let cache_dir = cache_base_dir.join(id.to_string());
        fs::create_dir_all(&cache_dir)?;

        Ok(cache_dir)
    }

    /// Initializes the isolate sandbox and returns the box directory
    fn initialize_isolate_sandbox(id: u8) -> Result<PathBuf> {
        let output = Command::new("isolate")
            .arg("-b")
            .arg(id.to_string())
            .arg("--cg")
            .arg("--init")
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate --init: {}", e))?;

        if !output.status.success() {
            bail!(
                "isolate --init exited with non-zero status; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let root_dir_absolute = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir_absolute.is_empty() {
            bail!(
                "isolate --init produced empty stdout; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(PathBuf::from(root_dir_absolute).join("box"))
    }

    /// Tears down the box, killing anything still running inside it
    fn cleanup(&self) -> Result<()> {
        let output = Command::new("isolate")
            .arg("-b")
            .arg(self.id.to_string())
            .arg("--cg")
            .arg("--cleanup")
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate --cleanup: {}", e))?;

        if !output.status.success() {
            bail!("isolate --cleanup exited with non-zero status");
        }

        log::debug!("IsolateRunner {} cleaned up", self.id);
        Ok(())
    }

    fn limit_args(&self, limits: &ResourceLimits, open_files: u32, meta: &Path) -> Vec<String> {
        let wall = MicroSecond(limits.time_limit.0 + self.settings.wall_grace.0);
        vec![
            "-b".to_string(),
            self.id.to_string(),
            "--cg".to_string(),
            "--run".to_string(),
            format!("--time={}", seconds_arg(limits.time_limit)),
            format!("--wall-time={}", seconds_arg(wall)),
            format!("--cg-mem={}", limits.memory_limit.0),
            format!("--fsize={}", limits.output_limit.0),
            format!("--processes={}", limits.processes),
            format!("--open-files={open_files}"),
            "-E".to_string(),
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "-M".to_string(),
            meta.to_string_lossy().into_owned(),
            "--silent".to_string(),
        ]
    }

    /// Runs isolate and reads the meta file it wrote for this very run
    ///
    /// Returns `None` when the run was cancelled.
    fn run_with_meta(
        &self,
        args: &[String],
        meta_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<Meta>> {
        remove_stale_meta(meta_path)?;
        if !self.run_isolate(args, cancel)? {
            return Ok(None);
        }
        read_meta(meta_path).map(Some)
    }

    /// Runs isolate to completion, or until `cancel` fires
    ///
    /// Returns `false` when the run was cancelled.
    fn run_isolate(&self, args: &[String], cancel: &CancellationToken) -> Result<bool> {
        tokio::runtime::Handle::current().block_on(async {
            let mut child = tokio::process::Command::new("isolate")
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .context("Failed to spawn isolate --run")?;

            tokio::select! {
                status = child.wait() => {
                    let status = status.context("Failed to wait for isolate")?;
                    check_isolate_exit(status.code())?;
                    Ok(true)
                }
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    log::debug!("IsolateRunner {} run cancelled", self.id);
                    Ok(false)
                }
            }
        })
    }
}

impl Drop for IsolateRunner {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("IsolateRunner {} failed to clean up: {e}", self.id);
        }
    }
}

fn seconds_arg(time: MicroSecond) -> String {
    format!("{:.3}", time.0 as f64 / 1_000_000.0)
}

/// Prefixes the program with `env` so it is looked up in the box `PATH`
fn boxed_command(template: &[String], language: &LanguageConfig) -> Vec<String> {
    let mut command = vec!["/usr/bin/env".to_string()];
    command.extend(apply_template(template, &language.file_name, EXECUTABLE_NAME));
    command
}

/// Isolate exits with 0 or 1 for a finished program; anything else is its own failure
fn check_isolate_exit(code: Option<i32>) -> Result<()> {
    match code {
        Some(0 | 1) => Ok(()),
        Some(code) => bail!("isolate --run failed with exit status {code}"),
        None => bail!("isolate --run was killed by a signal"),
    }
}

fn remove_stale_meta(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

fn read_meta(path: &Path) -> Result<Meta> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read meta file {}", path.display()))?;
    Ok(parse_meta(&content))
}

fn read_lossy(path: &Path, limit: u64) -> String {
    let mut bytes = fs::read(path).unwrap_or_default();
    bytes.truncate(limit as usize);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parses the `key:value` lines isolate writes with `-M`
fn parse_meta(content: &str) -> Meta {
    let mut meta = Meta::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "status" => meta.status = Some(value.to_string()),
            "exitcode" => meta.exit_code = value.parse().ok(),
            "exitsig" => meta.exit_signal = value.parse().ok(),
            "killed" => meta.killed = value == "1",
            "cg-oom-killed" => meta.oom_killed = value == "1",
            "time" => meta.time = value.parse().ok(),
            "time-wall" => meta.wall_time = value.parse().ok(),
            "cg-mem" => meta.memory_kb = value.parse().ok(),
            "message" => meta.message = Some(value.to_string()),
            _ => {}
        }
    }
    meta
}

/// Maps isolate's verdict onto an exit kind
///
/// An `XX` status is a failure of isolate itself and surfaces as an error.
fn classify_meta(meta: &Meta, limits: &ResourceLimits, time_limit: Duration) -> Result<ExitKind> {
    if meta.status.as_deref() == Some("XX") {
        bail!(
            "isolate internal error: {}",
            meta.message.as_deref().unwrap_or("no message")
        );
    }

    if meta.oom_killed {
        return Ok(ExitKind::MemoryExceeded);
    }

    let over_time = [meta.time, meta.wall_time]
        .into_iter()
        .flatten()
        .any(|secs| Duration::from_secs_f64(secs.max(0.0)) > time_limit);
    if meta.status.as_deref() == Some("TO") || over_time {
        return Ok(ExitKind::TimedOut);
    }

    if meta.memory_kb.is_some_and(|kb| kb > limits.memory_limit.0) {
        return Ok(ExitKind::MemoryExceeded);
    }

    Ok(match meta.status.as_deref() {
        Some("SG") => match meta.exit_signal {
            Some(signal) if signal == libc::SIGXFSZ => ExitKind::OutputExceeded,
            Some(signal) => ExitKind::Signaled(signal),
            None => ExitKind::Signaled(libc::SIGKILL),
        },
        Some("RE") => ExitKind::Exited(meta.exit_code.unwrap_or(1)),
        _ => ExitKind::Exited(meta.exit_code.unwrap_or(0)),
    })
}
