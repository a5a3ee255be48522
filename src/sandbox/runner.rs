use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::{LanguageConfig, ResourceLimits};

use super::{CompileOutcome, ExecutionOutcome, SandboxSettings};

/// Trait for different sandbox execution implementations
///
/// A runner is owned by exactly one worker and is driven from a blocking
/// thread. Errors returned from any method are infrastructure faults, not
/// verdicts: a program that crashes or runs out of time is reported through
/// the outcome types.
pub trait SandboxRunner: Send + Sync {
    /// Creates a new sandbox runner instance with the given ID
    fn build(id: u8, settings: SandboxSettings) -> Result<Self>
    where
        Self: Sized;

    fn id(&self) -> u8;

    /// Resets the workspace and stages the source file
    fn prepare(&self, source: &str, language: &LanguageConfig) -> Result<()>;

    /// Compiles the staged source under the compile ceilings
    fn compile(&self, language: &LanguageConfig, cancel: &CancellationToken)
    -> Result<CompileOutcome>;

    /// Runs the program once against `input` under `limits`
    fn execute(
        &self,
        language: &LanguageConfig,
        input: &str,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome>;

    /// Kills leftover processes and removes everything the job left behind
    fn release(&self) -> Result<()>;
}
