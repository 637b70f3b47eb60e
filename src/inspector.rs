//! Point-in-time container observations.
//!
//! Lookup failures never propagate from here: a container the runtime cannot
//! describe is reported with the synthetic `"not found"` status, and GPU
//! access fails closed.

use crate::runtime::ContainerRuntime;
use crate::types::ContainerState;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct ContainerInspector {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerInspector {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn get_state(&self, name: &str) -> ContainerState {
        match self.runtime.inspect(name).await {
            Ok(info) => ContainerState {
                name: name.to_string(),
                running: info.running,
                gpu_attached: info.device_requests.iter().any(|r| r.is_nvidia()),
                status: info.status,
            },
            Err(e) => {
                debug!(container = %name, error = %e, "Inspect failed, reporting not found");
                ContainerState::not_found(name)
            }
        }
    }

    pub async fn has_gpu_access(&self, name: &str) -> bool {
        match self.runtime.inspect(name).await {
            Ok(info) => info.device_requests.iter().any(|r| r.is_nvidia()),
            Err(e) => {
                debug!(container = %name, error = %e, "Inspect failed, assuming no GPU access");
                false
            }
        }
    }
}
