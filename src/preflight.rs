//! Pre-flight checks run before any container is touched.

use crate::gpu::GpuProbe;
use crate::inspector::ContainerInspector;
use crate::types::ModeDefinition;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub ok: bool,
    pub issues: Vec<String>,
}

pub struct PreflightValidator {
    inspector: ContainerInspector,
    gpu: Arc<dyn GpuProbe>,
}

impl PreflightValidator {
    pub fn new(inspector: ContainerInspector, gpu: Arc<dyn GpuProbe>) -> Self {
        Self { inspector, gpu }
    }

    /// Collect every problem that would make switching to `definition` unsafe.
    ///
    /// Any issue blocks the switch; nothing here changes container state.
    pub async fn validate(&self, definition: &ModeDefinition) -> PreflightReport {
        let mut issues = Vec::new();

        for name in definition.containers() {
            let state = self.inspector.get_state(name).await;
            if !state.is_found() {
                issues.push(format!("Container {} not found", name));
            } else if !state.gpu_attached {
                issues.push(format!("Container {} has no NVIDIA GPU device request", name));
            }
        }

        if !self.gpu.driver_responds().await {
            issues.push("GPU driver (nvidia-smi) is not responding".to_string());
        }

        if issues.is_empty() {
            debug!(mode = %definition.display_name, "Pre-flight checks passed");
        } else {
            warn!(mode = %definition.display_name, ?issues, "Pre-flight checks failed");
        }

        PreflightReport {
            ok: issues.is_empty(),
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeGpu, FakeRuntime, Operation};

    fn definition() -> ModeDefinition {
        ModeDefinition {
            display_name: "Training".to_string(),
            description: String::new(),
            start: vec!["c".to_string()],
            stop: vec!["a".to_string(), "b".to_string()],
        }
    }

    fn validator(runtime: Arc<FakeRuntime>, gpu: FakeGpu) -> PreflightValidator {
        PreflightValidator::new(ContainerInspector::new(runtime), Arc::new(gpu))
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add("a", true, true);
        runtime.add("b", true, true);
        runtime.add("c", false, true);

        let report = validator(runtime.clone(), FakeGpu::default())
            .validate(&definition())
            .await;
        assert!(report.ok);
        assert!(report.issues.is_empty());
        assert!(runtime.operations().is_empty());
    }

    #[tokio::test]
    async fn test_collects_every_issue() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add("a", true, true);
        runtime.add("b", true, false);

        let gpu = FakeGpu {
            responds: false,
            memory: None,
        };
        let report = validator(runtime.clone(), gpu).validate(&definition()).await;

        assert!(!report.ok);
        assert_eq!(
            report.issues,
            vec![
                "Container c not found".to_string(),
                "Container b has no NVIDIA GPU device request".to_string(),
                "GPU driver (nvidia-smi) is not responding".to_string(),
            ]
        );
        assert!(!runtime
            .operations()
            .iter()
            .any(|op| matches!(op, Operation::Start(_) | Operation::Stop(_))));
    }
}
