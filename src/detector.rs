//! Infers the active mode from live container state.
//!
//! There is no stored "current mode": the container runtime is the source of
//! truth and every read samples it again.

use crate::gpu::GpuProbe;
use crate::registry::ModeRegistry;
use crate::runtime::ContainerRuntime;
use crate::types::{Mode, TrainingStatus};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ModeDetector {
    registry: Arc<ModeRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    gpu: Arc<dyn GpuProbe>,
}

impl ModeDetector {
    pub fn new(
        registry: Arc<ModeRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        gpu: Arc<dyn GpuProbe>,
    ) -> Self {
        Self {
            registry,
            runtime,
            gpu,
        }
    }

    /// Classify the running container set.
    ///
    /// - training: every training container runs and no companion container does
    /// - gaming: none of the registry's containers run
    /// - companion: anything else, including partially switched states
    pub async fn detect(&self) -> Mode {
        let running = match self.running_set().await {
            Some(running) => running,
            None => return Mode::Companion,
        };

        let mode = classify(&self.registry, &running);
        debug!(mode = %mode, running = ?running, "Detected mode");
        mode
    }

    /// Report whether training is running, with a GPU memory sample when available.
    pub async fn check_training(&self) -> TrainingStatus {
        let training = &self.registry.definition(Mode::Training).start;
        let is_training = match self.running_set().await {
            Some(running) => !training.is_empty() && training.iter().all(|c| running.contains(c)),
            None => false,
        };

        TrainingStatus {
            is_training,
            queue_size: 0,
            gpu_memory: self.gpu.memory().await,
        }
    }

    async fn running_set(&self) -> Option<HashSet<String>> {
        match self.runtime.running_containers().await {
            Ok(names) => Some(names.into_iter().collect()),
            Err(e) => {
                warn!(error = %e, "Failed to list running containers");
                None
            }
        }
    }
}

fn classify(registry: &ModeRegistry, running: &HashSet<String>) -> Mode {
    let training = &registry.definition(Mode::Training).start;
    let companion = &registry.definition(Mode::Companion).start;

    if !training.is_empty()
        && training.iter().all(|c| running.contains(c))
        && !companion.iter().any(|c| running.contains(c))
    {
        return Mode::Training;
    }

    if !registry.containers().iter().any(|c| running.contains(c)) {
        return Mode::Gaming;
    }

    Mode::Companion
}
