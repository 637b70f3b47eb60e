//! GPU driver queries via `nvidia-smi`.

use crate::types::GpuMemory;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

#[async_trait]
pub trait GpuProbe: Send + Sync {
    /// Whether the driver CLI runs and exits successfully.
    async fn driver_responds(&self) -> bool;

    /// Memory used and total, summed across all GPUs. `None` if unavailable.
    async fn memory(&self) -> Option<GpuMemory>;
}

pub struct NvidiaSmi {
    command: String,
}

impl NvidiaSmi {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn query(&self, args: &[&str]) -> Option<String> {
        let output = Command::new(&self.command).args(args).output().await;

        match output {
            Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
            Ok(out) => {
                warn!(
                    "{} failed with status {}: {}",
                    self.command,
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim_end()
                );
                None
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(command = %self.command, "GPU driver CLI not found");
                None
            }
            Err(e) => {
                warn!(command = %self.command, error = %e, "Failed to run GPU driver CLI");
                None
            }
        }
    }
}

#[async_trait]
impl GpuProbe for NvidiaSmi {
    async fn driver_responds(&self) -> bool {
        self.query(&["--query-gpu=name", "--format=csv,noheader"])
            .await
            .is_some()
    }

    async fn memory(&self) -> Option<GpuMemory> {
        let text = self
            .query(&[
                "--query-gpu=memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .await?;
        parse_memory_csv(&text)
    }
}

/// Sum `used, total` rows (one per GPU). Returns `None` if no row parses.
pub fn parse_memory_csv(text: &str) -> Option<GpuMemory> {
    let mut parsed = false;
    let mut memory = GpuMemory {
        used_mib: 0,
        total_mib: 0,
    };

    for line in text.lines() {
        let mut parts = line.split(',');
        let used = parts.next().and_then(|v| v.trim().parse::<u64>().ok());
        let total = parts.next().and_then(|v| v.trim().parse::<u64>().ok());
        if let (Some(used), Some(total)) = (used, total) {
            memory.used_mib += used;
            memory.total_mib += total;
            parsed = true;
        }
    }

    parsed.then_some(memory)
}
