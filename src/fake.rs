//! In-memory runtime, GPU probe and side-effect runner.
//!
//! Backs `--dry-run` and the test suites. State changes are instantaneous.
//! With the `testing` feature, failures can be injected per container and the
//! lifecycle commands received are recorded.

use crate::gpu::GpuProbe;
#[cfg(any(test, feature = "testing"))]
use crate::hooks::{HookError, SideEffect, SideEffectRunner};
use crate::runtime::{ContainerInfo, ContainerRuntime, DeviceRequest, RuntimeError};
use crate::types::GpuMemory;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// A lifecycle command received by [`FakeRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Start(String),
    Stop(String),
    Restart(String),
}

#[derive(Debug, Clone, Default)]
struct FakeContainer {
    running: bool,
    gpu: bool,
    /// Remaining start commands that fail
    start_failures: u32,
    /// Remaining stop commands that fail
    stop_failures: u32,
    /// Start succeeds but the container never reports running
    start_stuck: bool,
    /// Stop succeeds but the container keeps running
    stop_stuck: bool,
    /// A successful start comes up without the GPU device request
    gpu_lost_on_start: bool,
}

#[derive(Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    #[cfg(any(test, feature = "testing"))]
    operations: Vec<Operation>,
    unavailable: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container. `gpu` controls whether it carries an NVIDIA device request.
    pub fn add(&self, name: &str, running: bool, gpu: bool) {
        self.lock().containers.insert(
            name.to_string(),
            FakeContainer {
                running,
                gpu,
                ..Default::default()
            },
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lifecycle(&self, op: Operation) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(unavailable());
        }
        #[cfg(any(test, feature = "testing"))]
        state.operations.push(op.clone());

        let (name, verb) = match &op {
            Operation::Start(n) => (n, "start"),
            Operation::Stop(n) => (n, "stop"),
            Operation::Restart(n) => (n, "restart"),
        };
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.clone()))?;

        let failures = match op {
            Operation::Stop(_) => &mut container.stop_failures,
            _ => &mut container.start_failures,
        };
        if *failures > 0 {
            *failures -= 1;
            return Err(RuntimeError::Failed {
                command: format!("fake {} {}", verb, name),
                code: 1,
                stderr: "injected failure".to_string(),
            });
        }

        match op {
            Operation::Stop(_) => container.running = container.stop_stuck,
            _ => {
                container.running = !container.start_stuck;
                if container.gpu_lost_on_start {
                    container.gpu = false;
                }
            }
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "testing"))]
impl FakeRuntime {
    pub fn fail_start(&self, name: &str, times: u32) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.start_failures = times;
        }
    }

    pub fn fail_stop(&self, name: &str, times: u32) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.stop_failures = times;
        }
    }

    /// `start` succeeds but the container never reports running.
    pub fn set_start_stuck(&self, name: &str) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.start_stuck = true;
        }
    }

    /// `stop` succeeds but the container keeps running.
    pub fn set_stop_stuck(&self, name: &str) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.stop_stuck = true;
        }
    }

    /// The next successful start or restart drops the GPU device request.
    pub fn lose_gpu_on_start(&self, name: &str) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.gpu_lost_on_start = true;
        }
    }

    pub fn set_gpu(&self, name: &str, gpu: bool) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.gpu = gpu;
        }
    }

    /// Make every call fail as if the runtime daemon were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock()
            .containers
            .get(name)
            .is_some_and(|c| c.running)
    }

    /// Lifecycle commands received so far, including failed attempts.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }
}

fn unavailable() -> RuntimeError {
    RuntimeError::Failed {
        command: "fake".to_string(),
        code: 1,
        stderr: "Cannot connect to the container runtime".to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect(&self, name: &str) -> Result<ContainerInfo, RuntimeError> {
        let state = self.lock();
        if state.unavailable {
            return Err(unavailable());
        }
        let c = state
            .containers
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;

        let device_requests = if c.gpu {
            vec![DeviceRequest {
                driver: "nvidia".to_string(),
                capabilities: vec![vec!["gpu".to_string()]],
            }]
        } else {
            vec![]
        };

        Ok(ContainerInfo {
            running: c.running,
            status: if c.running { "running" } else { "exited" }.to_string(),
            device_requests,
        })
    }

    async fn running_containers(&self) -> Result<Vec<String>, RuntimeError> {
        let state = self.lock();
        if state.unavailable {
            return Err(unavailable());
        }
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.lifecycle(Operation::Start(name.to_string()))
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.lifecycle(Operation::Stop(name.to_string()))
    }

    async fn restart(&self, name: &str) -> Result<(), RuntimeError> {
        self.lifecycle(Operation::Restart(name.to_string()))
    }
}

pub struct FakeGpu {
    pub responds: bool,
    pub memory: Option<GpuMemory>,
}

impl Default for FakeGpu {
    fn default() -> Self {
        Self {
            responds: true,
            memory: Some(GpuMemory {
                used_mib: 0,
                total_mib: 24576,
            }),
        }
    }
}

#[async_trait]
impl GpuProbe for FakeGpu {
    async fn driver_responds(&self) -> bool {
        self.responds
    }

    async fn memory(&self) -> Option<GpuMemory> {
        self.memory
    }
}

/// Records side effects instead of running them.
#[cfg(any(test, feature = "testing"))]
#[derive(Default)]
pub struct RecordingRunner {
    spawned: Mutex<Vec<SideEffect>>,
    fail: bool,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner whose every spawn fails.
    pub fn failing() -> Self {
        Self {
            spawned: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn spawned(&self) -> Vec<SideEffect> {
        self.spawned
            .lock()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[cfg(any(test, feature = "testing"))]
impl SideEffectRunner for RecordingRunner {
    fn spawn(&self, effect: SideEffect) -> Result<(), HookError> {
        if self.fail {
            return Err(HookError::Spawn {
                effect,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "script missing"),
            });
        }
        if let Ok(mut spawned) = self.spawned.lock() {
            spawned.push(effect);
        }
        Ok(())
    }
}
