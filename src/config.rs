use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "oj-exec", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing submission database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Override the number of sandbox workers from the configuration file
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<usize>,
}

impl CliArgs {
    /// Load the configuration from the specified file and apply CLI overrides
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let file = std::fs::File::open(&self.config_path)
            .with_context(|| format!("Failed to open config file {}", self.config_path))?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config file {}", self.config_path))?;

        if let Some(workers) = self.workers {
            config.execution.workers = workers;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default = "ResourceLimits::compile_default")]
    pub compile_limits: ResourceLimits,
    #[serde(default)]
    pub problems: Vec<ProblemConfig>,
    pub languages: Vec<LanguageConfig>,
}

impl Config {
    /// Rejects configurations the pool cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.execution.workers == 0 {
            bail!("The number of sandbox workers must not be 0");
        }
        if self.execution.workers > u8::MAX as usize {
            bail!("At most {} sandbox workers are supported", u8::MAX);
        }
        if self.execution.queue_capacity == 0 {
            bail!("The queue capacity must not be 0");
        }

        let mut names = HashSet::new();
        for language in &self.languages {
            if !names.insert(language.name.as_str()) {
                bail!("Duplicate language name {}", language.name);
            }
            if language.run.is_empty() {
                bail!("Language {} has an empty run command", language.name);
            }
        }

        let mut ids = HashSet::new();
        for problem in &self.problems {
            if !ids.insert(problem.id) {
                bail!("Duplicate problem id {}", problem.id);
            }
        }

        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Number of workers, which is also the ceiling on parallel sandboxes
    pub workers: usize,
    /// Maximum number of queued plus running jobs
    pub queue_capacity: usize,
    pub judge_policy: JudgePolicy,
    pub sandbox: SandboxBackend,
    /// Extra wall-clock time granted before a run is forcibly killed
    pub wall_grace: MicroSecond,
    /// Number of finished job statuses kept for polling
    pub status_retention: usize,
    pub max_source_bytes: usize,
    /// How long shutdown waits for in-flight jobs before cancelling them
    pub shutdown_grace: MicroSecond,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            judge_policy: JudgePolicy::default(),
            sandbox: SandboxBackend::default(),
            wall_grace: MicroSecond(500_000),
            status_retention: 10_000,
            max_source_bytes: 64 * 1024,
            shutdown_grace: MicroSecond(30_000_000),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JudgePolicy {
    /// Stop at the first failing case; passed count covers the cases before it
    #[default]
    StopOnFirstFailure,
    /// Run every case; verdict is the first failure, passed count covers all cases
    RunAll,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    /// Use `isolate` when it is installed, plain processes otherwise
    #[default]
    Auto,
    Isolate,
    Process,
}

/// Ceilings applied to one sandboxed process
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU and wall-clock budget of a single run
    pub time_limit: MicroSecond,
    /// Peak resident memory
    pub memory_limit: KiloByte,
    /// Captured stdout and written files
    pub output_limit: KiloByte,
    /// Process count inside the box, only enforced by `isolate`
    pub processes: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_limit: MicroSecond(1_000_000),
            memory_limit: KiloByte(262_144),
            output_limit: KiloByte(65_536),
            processes: 4,
        }
    }
}

impl ResourceLimits {
    pub fn compile_default() -> Self {
        Self {
            time_limit: MicroSecond(30_000_000),
            memory_limit: KiloByte(524_288),
            output_limit: KiloByte(65_536),
            processes: 10,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProblemConfig {
    pub id: u32,
    pub name: String,
    #[serde(flatten)]
    pub judge_type: JudgeType,
    pub time_limit: Option<MicroSecond>,
    pub memory_limit: Option<KiloByte>,
    pub cases: Vec<ProblemCaseConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProblemCaseConfig {
    pub input_file: String,
    pub answer_file: String,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct MicroSecond(pub u64);

impl From<MicroSecond> for Duration {
    fn from(value: MicroSecond) -> Self {
        Duration::from_micros(value.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct KiloByte(pub u64);

impl KiloByte {
    pub fn as_bytes(self) -> u64 {
        self.0.saturating_mul(1024)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct LanguageConfig {
    pub name: String,
    /// Name of the staged source file
    pub file_name: String,
    /// Compile command template; `%INPUT%` is the source, `%OUTPUT%` the executable
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    /// Run command template, same placeholders as `compile`
    #[serde(default = "default_run_command")]
    pub run: Vec<String>,
}

fn default_run_command() -> Vec<String> {
    vec!["./main".to_string()]
}

impl LanguageConfig {
    pub fn needs_compilation(&self) -> bool {
        self.compile.as_ref().is_some_and(|c| !c.is_empty())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JudgeType {
    /// Ignores trailing spaces on each line and trailing blank lines
    Standard,
    /// Byte-exact comparison
    Strict,
    /// Token-wise comparison with absolute or relative float tolerance
    Numeric { tolerance: f64 },
}

/// Substitutes `%INPUT%` / `%OUTPUT%` placeholders in a command template
pub fn apply_template(cmd_template: &[String], input: &str, output: &str) -> Vec<String> {
    cmd_template
        .iter()
        .map(|s| s.replace("%INPUT%", input).replace("%OUTPUT%", output))
        .collect()
}
