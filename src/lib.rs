//! # gpumode
//!
//! Switches a single shared GPU between mutually exclusive usage profiles by
//! starting and stopping Docker containers.
//!
//! This crate provides:
//! - **Registry**: the closed set of modes and the containers each one needs
//! - **Switcher**: pre-flight checks, stop/settle/start sequencing, rollback
//! - **Detector**: infers the active mode from whatever is running right now
//! - **Control API**: Axum router for status, switching and container restarts
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         gpumode                            │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ Control API   GET / POST / PUT  /api/gpu-mode        │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          │                                 │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ ModeSwitcher                                         │  │
//! │  │ - Pre-flight → snapshot → stop → settle → start      │  │
//! │  │ - Rollback on failed commands, side-effect scripts   │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │          │                   │                  │          │
//! │   [ModeDetector]     [ContainerInspector]   [GpuProbe]     │
//! │          └─────────┬─────────┘                  │          │
//! │                    ▼                            ▼          │
//! │               docker CLI                   nvidia-smi      │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod detector;
pub mod fake;
pub mod gpu;
pub mod hooks;
pub mod inspector;
pub mod preflight;
pub mod registry;
pub mod runtime;
pub mod status;
pub mod switcher;
pub mod telemetry;
mod types;

pub use config::{Config, ModesConfig, ScriptsConfig, TimingConfig};
pub use detector::ModeDetector;
pub use hooks::{SideEffect, SideEffectRunner};
pub use registry::{ModeRegistry, RegistryError};
pub use runtime::{ContainerRuntime, RuntimeError};
pub use switcher::{ModeSwitcher, RestartOutcome};
pub use types::{
    ContainerState, GpuMemory, Mode, ModeDefinition, ModeError, SwitchError, SwitchResult,
    TrainingStatus,
};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Build the switcher against the real `docker` and `nvidia-smi`, or against
/// an in-memory runtime when `dry_run` is set.
pub fn build_switcher(config: &Config, dry_run: bool) -> Result<ModeSwitcher> {
    let registry = Arc::new(
        ModeRegistry::new(config.modes.clone()).context("Invalid mode configuration")?,
    );

    let (runtime, gpu, effects): (
        Arc<dyn ContainerRuntime>,
        Arc<dyn gpu::GpuProbe>,
        Arc<dyn SideEffectRunner>,
    ) = if dry_run {
        info!("Dry run: using an in-memory container runtime");
        let runtime = fake::FakeRuntime::new();
        let companion = &registry.definition(Mode::Companion).start;
        for name in registry.containers() {
            let running = companion.contains(&name);
            runtime.add(&name, running, true);
        }
        (
            Arc::new(runtime),
            Arc::new(fake::FakeGpu::default()),
            Arc::new(hooks::NoopRunner),
        )
    } else {
        (
            Arc::new(runtime::DockerCli::new(config.docker_command.clone())),
            Arc::new(gpu::NvidiaSmi::new(config.nvidia_smi_command.clone())),
            Arc::new(hooks::ScriptRunner::new(config.scripts.clone())),
        )
    };

    Ok(ModeSwitcher::new(
        registry,
        runtime,
        gpu,
        effects,
        config.timing.clone(),
    ))
}

/// Build the complete gpumode stack
///
/// Returns:
/// - The control API router
/// - An optional metrics router (when `config.metrics_port > 0`)
/// - The switcher, for one-shot commands
pub fn build_app(
    config: &Config,
    dry_run: bool,
) -> Result<(axum::Router, Option<axum::Router>, ModeSwitcher)> {
    info!(dry_run, "Building gpumode");

    let switcher = build_switcher(config, dry_run)?;
    let control = control::control_router(switcher.clone());

    let metrics_router = if config.metrics_port > 0 {
        telemetry::install().map(telemetry::metrics_router)
    } else {
        None
    };

    Ok((control, metrics_router, switcher))
}
