mod isolate_runner;
mod process_runner;
mod runner;

pub use isolate_runner::IsolateRunner;
pub use process_runner::ProcessRunner;
pub use runner::SandboxRunner;

use anyhow::Result;

use crate::config::{Config, MicroSecond, ResourceLimits, SandboxBackend};

/// Name of the executable a compile command must produce
pub const EXECUTABLE_NAME: &str = "main";

/// Longest compiler or runtime message kept for reporting
pub const MESSAGE_LIMIT: usize = 4096;

/// Settings shared by every sandbox of the pool
#[derive(Debug, Clone, Copy)]
pub struct SandboxSettings {
    pub compile_limits: ResourceLimits,
    /// Extra wall-clock time before a run is forcibly killed
    pub wall_grace: MicroSecond,
}

impl From<&Config> for SandboxSettings {
    fn from(config: &Config) -> Self {
        Self {
            compile_limits: config.compile_limits,
            wall_grace: config.execution.wall_grace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Success,
    Failed { message: String },
    Cancelled,
}

/// How a sandboxed run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    MemoryExceeded,
    OutputExceeded,
    Cancelled,
}

/// Result of running one program against one input
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExitKind,
    pub stdout: String,
    pub stderr: String,
    pub runtime_ms: u64,
    pub memory_kb: u64,
}

/// Creates the sandbox runner selected by the configuration
///
/// `Auto` picks `isolate` when it is installed and falls back to plain
/// process execution otherwise.
pub fn create_sandbox_runner(
    id: u8,
    backend: SandboxBackend,
    settings: SandboxSettings,
) -> Result<Box<dyn SandboxRunner>> {
    let use_isolate = match backend {
        SandboxBackend::Isolate => true,
        SandboxBackend::Process => false,
        SandboxBackend::Auto => isolate_available(),
    };

    if use_isolate {
        log::info!("Creating IsolateRunner {id} (full isolation mode)");
        Ok(Box::new(IsolateRunner::build(id, settings)?))
    } else {
        log::info!("Creating ProcessRunner {id} (process group mode)");
        Ok(Box::new(ProcessRunner::build(id, settings)?))
    }
}

fn isolate_available() -> bool {
    std::process::Command::new("which")
        .arg("isolate")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Truncates a message to `MESSAGE_LIMIT` bytes on a char boundary
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MESSAGE_LIMIT {
        return message.to_string();
    }
    let mut end = MESSAGE_LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
