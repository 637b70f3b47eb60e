//! Script-based side effects for mode transitions.
//!
//! Entering training spawns a monitor, entering gaming runs an optimisation
//! script and leaving gaming for companion runs a restore script. All of them
//! are fire-and-forget: the switcher only learns whether the process could be
//! spawned, never how it exited.
//!
//! Scripts are executed via `sh -c`, so they can be either a path to an
//! executable or an inline shell script.

use crate::config::ScriptsConfig;
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideEffect {
    TrainingMonitor,
    GamingOptimize,
    GamingRestore,
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SideEffect::TrainingMonitor => "training-monitor",
            SideEffect::GamingOptimize => "gaming-optimize",
            SideEffect::GamingRestore => "gaming-restore",
        })
    }
}

/// Errors from spawning a side-effect script
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("failed to spawn {effect}: {source}")]
    Spawn {
        effect: SideEffect,
        #[source]
        source: std::io::Error,
    },
}

/// Launches side effects without waiting for them.
pub trait SideEffectRunner: Send + Sync {
    fn spawn(&self, effect: SideEffect) -> Result<(), HookError>;
}

/// Runs configured scripts as detached processes.
pub struct ScriptRunner {
    scripts: ScriptsConfig,
}

impl ScriptRunner {
    pub fn new(scripts: ScriptsConfig) -> Self {
        Self { scripts }
    }

    fn script_for(&self, effect: SideEffect) -> Option<&str> {
        match effect {
            SideEffect::TrainingMonitor => self.scripts.training_monitor.as_deref(),
            SideEffect::GamingOptimize => self.scripts.gaming_optimize.as_deref(),
            SideEffect::GamingRestore => self.scripts.gaming_restore.as_deref(),
        }
    }
}

impl SideEffectRunner for ScriptRunner {
    fn spawn(&self, effect: SideEffect) -> Result<(), HookError> {
        let Some(script) = self.script_for(effect) else {
            debug!(effect = %effect, "No script configured, skipping");
            return Ok(());
        };

        info!(effect = %effect, script = %script, "Spawning side-effect script");

        // Own process group: signals sent to the daemon must not reach the script.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .env("GPUMODE_EFFECT", effect.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| HookError::Spawn { effect, source })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, effect, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, effect, "stderr"));
        }

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(effect = %effect, "Side-effect script exited successfully");
                }
                Ok(status) => {
                    warn!(effect = %effect, code = ?status.code(), "Side-effect script failed");
                    metrics::counter!("gpumode_side_effect_failures_total", "effect" => effect.to_string())
                        .increment(1);
                }
                Err(e) => {
                    warn!(effect = %effect, error = %e, "Failed to wait for side-effect script");
                }
            }
        });

        Ok(())
    }
}

/// Forward script output as debug-level events under the "script" target,
/// filterable via RUST_LOG (e.g. RUST_LOG=info,script=debug).
async fn forward_output<R>(stream: R, effect: SideEffect, name: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "script", effect = %effect, stream = name, "{}", line);
    }
}

/// Runner that does nothing. Used for dry runs.
pub struct NoopRunner;

impl SideEffectRunner for NoopRunner {
    fn spawn(&self, effect: SideEffect) -> Result<(), HookError> {
        info!(effect = %effect, "Dry run, not spawning side effect");
        Ok(())
    }
}
