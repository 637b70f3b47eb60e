//! Mode Switcher — sequences container stops and starts between modes.
//!
//! A switch runs pre-flight checks, snapshots the current mode, stops the
//! target's stop set, waits for the GPU driver to settle, then starts the
//! target's start set. Failing to issue a start (or stop) command after
//! retries rolls back to the snapshot mode through the same machinery.
//! Verification timeouts only produce warnings.

use crate::config::{MAX_WAIT, TimingConfig};
use crate::detector::ModeDetector;
use crate::gpu::GpuProbe;
use crate::hooks::{SideEffect, SideEffectRunner};
use crate::inspector::ContainerInspector;
use crate::preflight::PreflightValidator;
use crate::registry::ModeRegistry;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::types::{Mode, ModeDefinition, SwitchError, SwitchResult};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A command that could not be issued after exhausting its retries.
#[derive(Debug, thiserror::Error)]
enum CommandFailed {
    #[error("failed to stop {container}: {source}")]
    Stop {
        container: String,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to start {container}: {source}")]
    Start {
        container: String,
        #[source]
        source: RuntimeError,
    },
}

/// Result of forcing a single container restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartOutcome {
    pub success: bool,
    pub message: String,
}

struct SwitcherInner {
    registry: Arc<ModeRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    inspector: ContainerInspector,
    preflight: PreflightValidator,
    detector: ModeDetector,
    effects: Arc<dyn SideEffectRunner>,
    timing: TimingConfig,
    /// Serialises switches and restarts
    switch_lock: Mutex<()>,
}

/// Coordinates mode switches. Cheap to clone.
pub struct ModeSwitcher {
    inner: Arc<SwitcherInner>,
}

impl Clone for ModeSwitcher {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ModeSwitcher {
    pub fn new(
        registry: Arc<ModeRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        gpu: Arc<dyn GpuProbe>,
        effects: Arc<dyn SideEffectRunner>,
        timing: TimingConfig,
    ) -> Self {
        let inspector = ContainerInspector::new(runtime.clone());
        let preflight = PreflightValidator::new(inspector.clone(), gpu.clone());
        let detector = ModeDetector::new(registry.clone(), runtime.clone(), gpu);

        Self {
            inner: Arc::new(SwitcherInner {
                registry,
                runtime,
                inspector,
                preflight,
                detector,
                effects,
                timing,
                switch_lock: Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &ModeRegistry {
        &self.inner.registry
    }

    pub fn detector(&self) -> &ModeDetector {
        &self.inner.detector
    }

    pub fn inspector(&self) -> &ContainerInspector {
        &self.inner.inspector
    }

    /// Switch to the named mode.
    ///
    /// Returns `Err` only for names outside the closed mode set; every other
    /// failure is reported through [`SwitchResult::success`].
    pub async fn switch_to(&self, name: &str) -> Result<SwitchResult, SwitchError> {
        let (mode, definition) = self.inner.registry.lookup(name)?;

        let _guard = self.inner.switch_lock.lock().await;
        let switch_start = Instant::now();
        info!(mode = %mode, "Mode switch requested");

        let report = self.inner.preflight.validate(definition).await;
        if !report.ok {
            record_switch(mode, "preflight_failed", switch_start);
            return Ok(SwitchResult {
                success: false,
                message: format!("Pre-flight checks failed: {}", report.issues.join("; ")),
                warnings: vec![],
                new_mode: self.inner.detector.detect().await,
            });
        }

        let previous = self.inner.detector.detect().await;
        info!(from = %previous, to = %mode, "Starting mode switch");

        let mut warnings = Vec::new();
        if let Err(e) = self.apply(definition, self.inner.timing.retries, false, &mut warnings).await {
            error!(mode = %mode, error = %e, "Mode switch failed, rolling back");
            warnings.extend(self.rollback(previous).await);
            record_switch(mode, "rolled_back", switch_start);
            return Ok(SwitchResult {
                success: false,
                message: format!("{}; rolled back to {} mode", e, previous),
                warnings,
                new_mode: previous,
            });
        }

        self.run_side_effects(previous, mode, &mut warnings);

        let detected = self.inner.detector.detect().await;
        if detected != mode {
            warn!(expected = %mode, detected = %detected, "Detected mode does not match target");
            warnings.push(format!(
                "Expected {} mode after switch but detected {}",
                mode, detected
            ));
        }

        info!(
            mode = %mode,
            duration = ?switch_start.elapsed(),
            warnings = warnings.len(),
            "Mode switch complete"
        );
        record_switch(mode, "success", switch_start);

        Ok(SwitchResult {
            success: true,
            message: format!("Switched to {} mode", definition.display_name),
            warnings,
            new_mode: mode,
        })
    }

    /// Restart one registry container to recover its GPU access.
    ///
    /// Success means the container came back up with an NVIDIA device request.
    pub async fn restart_container(&self, name: &str) -> Result<RestartOutcome, SwitchError> {
        if !self.inner.registry.is_known_container(name) {
            return Err(SwitchError::UnknownContainer(name.to_string()));
        }

        let _guard = self.inner.switch_lock.lock().await;
        info!(container = %name, "Restarting container to restore GPU access");

        let runtime = &self.inner.runtime;
        self.with_retries("restart", name, self.inner.timing.retries, || runtime.restart(name))
            .await?;

        let timeout = self.inner.timing.start_timeout();
        let running = self.wait_for(name, true, timeout).await;
        let gpu = self.inner.inspector.has_gpu_access(name).await;

        let message = if !running {
            format!("Container {} did not report running within {:?}", name, timeout)
        } else if !gpu {
            format!("Container {} restarted but still has no GPU access", name)
        } else {
            format!("Container {} restarted with GPU access", name)
        };

        Ok(RestartOutcome {
            success: running && gpu,
            message,
        })
    }

    // -----------------------------------------------------------------------
    // Private
    // -----------------------------------------------------------------------

    /// Drive the containers to `definition`'s state.
    ///
    /// With `best_effort`, command failures become warnings and every
    /// container is still attempted.
    async fn apply(
        &self,
        definition: &ModeDefinition,
        retries: u32,
        best_effort: bool,
        warnings: &mut Vec<String>,
    ) -> Result<(), CommandFailed> {
        let stopped = self.stop_phase(definition, retries, best_effort, warnings).await?;

        if stopped > 0 {
            let settle = self.inner.timing.settle_delay();
            debug!(settle = ?settle, "Waiting for GPU memory to be released");
            tokio::time::sleep(settle).await;
        }

        self.start_phase(definition, retries, best_effort, warnings).await
    }

    async fn stop_phase(
        &self,
        definition: &ModeDefinition,
        retries: u32,
        best_effort: bool,
        warnings: &mut Vec<String>,
    ) -> Result<usize, CommandFailed> {
        let runtime = &self.inner.runtime;
        let timeout = self.inner.timing.stop_timeout();
        let mut stopped = 0;

        for name in &definition.stop {
            if !self.inner.inspector.get_state(name).await.running {
                debug!(container = %name, "Already stopped");
                continue;
            }

            info!(container = %name, "Stopping container");
            if let Err(source) = self.with_retries("stop", name, retries, || runtime.stop(name)).await {
                let failed = CommandFailed::Stop {
                    container: name.clone(),
                    source,
                };
                if !best_effort {
                    return Err(failed);
                }
                warnings.push(failed.to_string());
                continue;
            }
            stopped += 1;

            if !self.wait_for(name, false, timeout).await {
                warn!(container = %name, "Container still running after stop");
                warnings.push(format!("Container {} did not stop within {:?}", name, timeout));
            }
        }

        Ok(stopped)
    }

    async fn start_phase(
        &self,
        definition: &ModeDefinition,
        retries: u32,
        best_effort: bool,
        warnings: &mut Vec<String>,
    ) -> Result<(), CommandFailed> {
        let runtime = &self.inner.runtime;
        let timeout = self.inner.timing.start_timeout();

        for name in &definition.start {
            let mut running = self.inner.inspector.get_state(name).await.running;
            if running {
                debug!(container = %name, "Already running");
            } else {
                info!(container = %name, "Starting container");
                if let Err(source) = self.with_retries("start", name, retries, || runtime.start(name)).await {
                    let failed = CommandFailed::Start {
                        container: name.clone(),
                        source,
                    };
                    if !best_effort {
                        return Err(failed);
                    }
                    warnings.push(failed.to_string());
                    continue;
                }

                running = self.wait_for(name, true, timeout).await;
                if !running {
                    warn!(container = %name, "Container not running after start");
                    warnings.push(format!("Container {} did not start within {:?}", name, timeout));
                }
            }

            if !self.inner.inspector.has_gpu_access(name).await {
                warn!(container = %name, running, "Container has no GPU access");
                if running {
                    warnings.push(format!("Container {} is running without GPU access", name));
                } else {
                    warnings.push(format!("Container {} has no GPU access", name));
                }
            }
        }

        Ok(())
    }

    /// Replay `previous`'s definition with reduced retries. Never fails; problems
    /// come back as warnings.
    async fn rollback(&self, previous: Mode) -> Vec<String> {
        metrics::counter!("gpumode_rollback_total", "mode" => previous.as_str()).increment(1);
        warn!(mode = %previous, "Rolling back");

        let mut warnings = Vec::new();
        let definition = self.inner.registry.definition(previous);
        let retries = self.inner.timing.rollback_retries;

        // Best-effort apply reports failures through `warnings` and never errs.
        let _ = self.apply(definition, retries, true, &mut warnings).await;

        for w in &warnings {
            warn!(mode = %previous, warning = %w, "Rollback warning");
        }
        warnings
            .into_iter()
            .map(|w| format!("Rollback: {}", w))
            .collect()
    }

    fn run_side_effects(&self, from: Mode, to: Mode, warnings: &mut Vec<String>) {
        let effect = match (from, to) {
            (_, Mode::Training) => SideEffect::TrainingMonitor,
            (_, Mode::Gaming) => SideEffect::GamingOptimize,
            (Mode::Gaming, Mode::Companion) => SideEffect::GamingRestore,
            _ => return,
        };

        if let Err(e) = self.inner.effects.spawn(effect) {
            warn!(effect = %effect, error = %e, "Side effect failed");
            metrics::counter!("gpumode_side_effect_failures_total", "effect" => effect.to_string())
                .increment(1);
            warnings.push(e.to_string());
        }
    }

    /// Run `op` up to `attempts` times, sleeping `n × backoff` after failed attempt `n`.
    async fn with_retries<F, Fut>(
        &self,
        action: &'static str,
        container: &str,
        attempts: u32,
        mut op: F,
    ) -> Result<(), RuntimeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), RuntimeError>>,
    {
        let attempts = attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    let backoff = self
                        .inner
                        .timing
                        .retry_backoff()
                        .saturating_mul(attempt)
                        .min(MAX_WAIT);
                    warn!(
                        container = %container,
                        action,
                        attempt,
                        attempts,
                        error = %e,
                        "Container command failed, retrying in {:?}",
                        backoff
                    );
                    metrics::counter!("gpumode_container_command_retries_total", "action" => action)
                        .increment(1);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(container = %container, action, attempts, error = %e, "Container command failed");
                    return Err(e);
                }
            }
        }
    }

    /// Poll until the container's running flag equals `running` or `timeout` passes.
    async fn wait_for(&self, name: &str, running: bool, timeout: Duration) -> bool {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + MAX_WAIT);
        let poll = self.inner.timing.poll_interval();

        loop {
            if self.inner.inspector.get_state(name).await.running == running {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}

fn record_switch(mode: Mode, outcome: &'static str, started: Instant) {
    metrics::counter!("gpumode_switch_total", "mode" => mode.as_str(), "outcome" => outcome)
        .increment(1);
    metrics::histogram!("gpumode_switch_duration_seconds", "mode" => mode.as_str())
        .record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModesConfig;
    use crate::fake::{FakeGpu, FakeRuntime, Operation, RecordingRunner};

    fn def(start: &[&str], stop: &[&str]) -> ModeDefinition {
        ModeDefinition {
            display_name: String::new(),
            description: String::new(),
            start: start.iter().map(|s| s.to_string()).collect(),
            stop: stop.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn fast_timing() -> TimingConfig {
        TimingConfig {
            retries: 3,
            rollback_retries: 1,
            retry_backoff_ms: 0,
            stop_timeout_secs: 0,
            start_timeout_secs: 0,
            poll_interval_ms: 0,
            settle_delay_ms: 0,
        }
    }

    fn make_switcher(runtime: Arc<FakeRuntime>, runner: Arc<RecordingRunner>) -> ModeSwitcher {
        make_switcher_with(runtime, runner, fast_timing())
    }

    fn make_switcher_with(
        runtime: Arc<FakeRuntime>,
        runner: Arc<RecordingRunner>,
        timing: TimingConfig,
    ) -> ModeSwitcher {
        let registry = ModeRegistry::new(ModesConfig {
            companion: def(&["a", "b"], &[]),
            training: def(&["c"], &["a", "b"]),
            gaming: def(&[], &["a", "b", "c"]),
        })
        .unwrap();
        ModeSwitcher::new(
            Arc::new(registry),
            runtime,
            Arc::new(FakeGpu::default()),
            runner,
            timing,
        )
    }

    fn companion_runtime() -> Arc<FakeRuntime> {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add("a", true, true);
        runtime.add("b", true, true);
        runtime.add("c", false, true);
        runtime
    }

    #[tokio::test]
    async fn test_invalid_mode_touches_nothing() {
        let runtime = companion_runtime();
        let switcher = make_switcher(runtime.clone(), Arc::new(RecordingRunner::new()));

        let result = switcher.switch_to("overclock").await;
        assert!(matches!(result, Err(SwitchError::InvalidMode(_))));
        assert!(runtime.operations().is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_rolls_back() {
        let runtime = companion_runtime();
        runtime.fail_stop("b", u32::MAX);
        let switcher = make_switcher(runtime.clone(), Arc::new(RecordingRunner::new()));

        let result = switcher.switch_to("training").await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("failed to stop b"));
        assert!(result.message.contains("rolled back to companion"));
        // a was stopped before b failed; rollback brings it back
        assert!(runtime.is_running("a"));
        assert!(!runtime.is_running("c"));
    }

    #[tokio::test]
    async fn test_transient_start_failure_is_retried() {
        let runtime = companion_runtime();
        runtime.fail_start("c", 2);
        let switcher = make_switcher(runtime.clone(), Arc::new(RecordingRunner::new()));

        let result = switcher.switch_to("training").await.unwrap();
        assert!(result.success, "{}", result.message);
        let starts = runtime
            .operations()
            .into_iter()
            .filter(|op| *op == Operation::Start("c".to_string()))
            .count();
        assert_eq!(starts, 3);
    }

    #[tokio::test]
    async fn test_stuck_start_is_a_warning() {
        let runtime = companion_runtime();
        runtime.set_start_stuck("c");
        let switcher = make_switcher(runtime.clone(), Arc::new(RecordingRunner::new()));

        let result = switcher.switch_to("training").await.unwrap();
        assert!(result.success);
        assert!(result.warnings.iter().any(|w| w.contains("did not start")));
        // Nothing runs, so detection disagrees with the target
        assert!(result.warnings.iter().any(|w| w.contains("detected gaming")));
    }

    #[tokio::test]
    async fn test_start_timeout_still_checks_gpu() {
        let runtime = companion_runtime();
        runtime.set_start_stuck("c");
        runtime.lose_gpu_on_start("c");
        let switcher = make_switcher(runtime.clone(), Arc::new(RecordingRunner::new()));

        let result = switcher.switch_to("training").await.unwrap();
        assert!(result.success);
        assert!(result.warnings.iter().any(|w| w.contains("Container c did not start")));
        assert!(result.warnings.iter().any(|w| w == "Container c has no GPU access"));
    }

    #[tokio::test]
    async fn test_gpu_lost_after_start_is_a_warning() {
        let runtime = companion_runtime();
        runtime.lose_gpu_on_start("c");
        let switcher = make_switcher(runtime.clone(), Arc::new(RecordingRunner::new()));

        let result = switcher.switch_to("training").await.unwrap();
        assert!(result.success);
        assert_eq!(result.new_mode, Mode::Training);
        assert_eq!(
            result.warnings,
            vec!["Container c is running without GPU access".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stuck_stop_is_a_warning() {
        let runtime = companion_runtime();
        runtime.set_stop_stuck("a");
        let switcher = make_switcher(runtime.clone(), Arc::new(RecordingRunner::new()));

        let result = switcher.switch_to("training").await.unwrap();
        assert!(result.success, "{}", result.message);
        assert!(result.warnings.iter().any(|w| w.starts_with("Container a did not stop within")));
        assert!(!result.warnings.iter().any(|w| w.contains("Container b")));
        assert!(runtime.is_running("a"));
        assert!(runtime.is_running("c"));
    }

    #[tokio::test]
    async fn test_settle_delay_only_after_stopping() {
        let settle = Duration::from_millis(300);
        let mut timing = fast_timing();
        timing.settle_delay_ms = settle.as_millis() as u64;

        let runtime = Arc::new(FakeRuntime::new());
        runtime.add("a", false, true);
        runtime.add("b", false, true);
        runtime.add("c", false, true);
        let switcher = make_switcher_with(runtime.clone(), Arc::new(RecordingRunner::new()), timing);

        // gaming -> companion stops nothing
        let started = Instant::now();
        assert!(switcher.switch_to("companion").await.unwrap().success);
        assert!(started.elapsed() < settle);

        // companion -> training stops a and b
        let started = Instant::now();
        assert!(switcher.switch_to("training").await.unwrap().success);
        assert!(started.elapsed() >= settle);
    }

    #[tokio::test]
    async fn test_oversized_timeouts_are_capped() {
        let mut timing = fast_timing();
        timing.stop_timeout_secs = u64::MAX;
        timing.start_timeout_secs = u64::MAX;
        let runtime = companion_runtime();
        let switcher = make_switcher_with(runtime.clone(), Arc::new(RecordingRunner::new()), timing);

        let result = switcher.switch_to("training").await.unwrap();
        assert!(result.success, "{}", result.message);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        assert!(switcher.restart_container("c").await.unwrap().success);
    }

    #[tokio::test]
    async fn test_side_effect_failure_is_a_warning() {
        let runtime = companion_runtime();
        let switcher = make_switcher(runtime.clone(), Arc::new(RecordingRunner::failing()));

        let result = switcher.switch_to("gaming").await.unwrap();
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("gaming-optimize"));
    }

    #[tokio::test]
    async fn test_leaving_gaming_runs_restore() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add("a", false, true);
        runtime.add("b", false, true);
        runtime.add("c", false, true);
        let runner = Arc::new(RecordingRunner::new());
        let switcher = make_switcher(runtime.clone(), runner.clone());

        let result = switcher.switch_to("companion").await.unwrap();
        assert!(result.success);
        assert_eq!(result.new_mode, Mode::Companion);
        assert_eq!(runner.spawned(), vec![SideEffect::GamingRestore]);
    }

    #[tokio::test]
    async fn test_restart_container() {
        let runtime = companion_runtime();
        let switcher = make_switcher(runtime.clone(), Arc::new(RecordingRunner::new()));

        let outcome = switcher.restart_container("a").await.unwrap();
        assert!(outcome.success);
        assert_eq!(runtime.operations(), vec![Operation::Restart("a".to_string())]);

        runtime.set_gpu("b", false);
        let outcome = switcher.restart_container("b").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("no GPU access"));

        let err = switcher.restart_container("postgres").await.unwrap_err();
        assert!(matches!(err, SwitchError::UnknownContainer(_)));
    }

    #[tokio::test]
    async fn test_restart_command_failure() {
        let runtime = companion_runtime();
        runtime.fail_start("a", u32::MAX);
        let switcher = make_switcher(runtime.clone(), Arc::new(RecordingRunner::new()));

        let err = switcher.restart_container("a").await.unwrap_err();
        assert!(matches!(err, SwitchError::Runtime(_)));
        assert_eq!(runtime.operations().len(), 3);
    }
}
