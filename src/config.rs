//! Configuration for gpumode

use crate::types::ModeDefinition;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Container runtime CLI (default: "docker")
    #[serde(default = "default_docker_command")]
    pub docker_command: String,

    /// GPU driver query CLI (default: "nvidia-smi")
    #[serde(default = "default_nvidia_smi_command")]
    pub nvidia_smi_command: String,

    /// Container sets per mode
    #[serde(default)]
    pub modes: ModesConfig,

    /// Fire-and-forget scripts run on mode transitions
    #[serde(default)]
    pub scripts: ScriptsConfig,

    /// Retry, polling and settle timings
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            metrics_port: default_metrics_port(),
            docker_command: default_docker_command(),
            nvidia_smi_command: default_nvidia_smi_command(),
            modes: ModesConfig::default(),
            scripts: ScriptsConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

/// One definition per mode. The set of modes is fixed; only their
/// containers and labels are configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModesConfig {
    #[serde(default = "default_companion")]
    pub companion: ModeDefinition,
    #[serde(default = "default_training")]
    pub training: ModeDefinition,
    #[serde(default = "default_gaming")]
    pub gaming: ModeDefinition,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            companion: default_companion(),
            training: default_training(),
            gaming: default_gaming(),
        }
    }
}

/// Scripts are run via `sh -c`, so each entry can be an absolute path or an
/// inline command. `None` disables the hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptsConfig {
    /// Detached monitor spawned when entering training mode
    #[serde(default = "default_training_monitor")]
    pub training_monitor: Option<String>,

    /// Run when entering gaming mode
    #[serde(default = "default_gaming_optimize")]
    pub gaming_optimize: Option<String>,

    /// Run when leaving gaming mode for companion mode
    #[serde(default = "default_gaming_restore")]
    pub gaming_restore: Option<String>,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            training_monitor: default_training_monitor(),
            gaming_optimize: default_gaming_optimize(),
            gaming_restore: default_gaming_restore(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Attempts per start/stop/restart command
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Attempts per command while rolling back
    #[serde(default = "default_rollback_retries")]
    pub rollback_retries: u32,

    /// Backoff unit in milliseconds; attempt `n` waits `n` units
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long to wait for a stopped container to report not running
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// How long to wait for a started container to report running
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    /// State polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pause between the stop and start phases so the driver can free memory
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            rollback_retries: default_rollback_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
            start_timeout_secs: default_start_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

/// Upper bound on any single configured wait.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

impl TimingConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms).min(MAX_WAIT)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs).min(MAX_WAIT)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs).min(MAX_WAIT)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).min(MAX_WAIT)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms).min(MAX_WAIT)
    }

    fn exceeds_max_wait(&self) -> bool {
        [
            Duration::from_millis(self.retry_backoff_ms),
            Duration::from_secs(self.stop_timeout_secs),
            Duration::from_secs(self.start_timeout_secs),
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_millis(self.settle_delay_ms),
        ]
        .iter()
        .any(|d| *d > MAX_WAIT)
    }
}

fn default_port() -> u16 {
    3000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_docker_command() -> String {
    "docker".to_string()
}

fn default_nvidia_smi_command() -> String {
    "nvidia-smi".to_string()
}

fn default_companion() -> ModeDefinition {
    ModeDefinition {
        display_name: "Companion".to_string(),
        description: "LLM and image generation services for the companion apps".to_string(),
        start: vec!["ollama".to_string(), "comfyui".to_string()],
        stop: vec!["kohya-trainer".to_string()],
    }
}

fn default_training() -> ModeDefinition {
    ModeDefinition {
        display_name: "Training".to_string(),
        description: "Full GPU for image-model training runs".to_string(),
        start: vec!["kohya-trainer".to_string()],
        stop: vec!["ollama".to_string(), "comfyui".to_string()],
    }
}

fn default_gaming() -> ModeDefinition {
    ModeDefinition {
        display_name: "Gaming".to_string(),
        description: "All GPU containers stopped, GPU handed back to the host".to_string(),
        start: vec![],
        stop: vec![
            "ollama".to_string(),
            "comfyui".to_string(),
            "kohya-trainer".to_string(),
        ],
    }
}

fn default_training_monitor() -> Option<String> {
    Some("/opt/gpumode/scripts/training-monitor.sh".to_string())
}

fn default_gaming_optimize() -> Option<String> {
    Some("/opt/gpumode/scripts/gaming-optimize.sh".to_string())
}

fn default_gaming_restore() -> Option<String> {
    Some("/opt/gpumode/scripts/gaming-restore.sh".to_string())
}

fn default_retries() -> u32 {
    3
}

fn default_rollback_retries() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_start_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_settle_delay_ms() -> u64 {
    5000
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Warn about settings that are legal but probably wrong.
    ///
    /// Structural problems (overlapping start/stop sets) are rejected when the
    /// registry is built, not here.
    pub fn validate(&self) {
        let scripts = [
            ("training_monitor", &self.scripts.training_monitor),
            ("gaming_optimize", &self.scripts.gaming_optimize),
            ("gaming_restore", &self.scripts.gaming_restore),
        ];
        for (name, script) in scripts {
            if let Some(path) = script
                && !path.contains(' ')
                && !Path::new(path).is_absolute()
            {
                warn!(
                    script = name,
                    path = %path,
                    "Script is not an absolute path; it will be resolved against the daemon's PATH"
                );
            }
        }

        if self.modes.companion.start.is_empty() {
            warn!("Companion mode starts no containers; mode detection will never report it cleanly");
        }
        if self.modes.training.start.is_empty() {
            warn!("Training mode starts no containers; mode detection will never report training");
        }

        if self.timing.retries == 0 {
            warn!("timing.retries is 0; treating it as a single attempt");
        }
        if self.timing.exceeds_max_wait() {
            warn!(max = ?MAX_WAIT, "A timing value exceeds the maximum wait and will be capped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "port": 8080,
            "modes": {
                "training": {
                    "displayName": "Train",
                    "description": "LoRA runs",
                    "start": ["trainer"],
                    "stop": ["llm"]
                }
            },
            "scripts": { "gaming_restore": null },
            "timing": { "retries": 5, "settle_delay_ms": 0 }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.modes.training.start, vec!["trainer".to_string()]);
        // Unspecified modes keep their defaults
        assert_eq!(config.modes.companion, default_companion());
        assert!(config.scripts.gaming_restore.is_none());
        assert!(config.scripts.gaming_optimize.is_some());
        assert_eq!(config.timing.retries, 5);
        assert_eq!(config.timing.settle_delay(), Duration::ZERO);
        assert_eq!(config.timing.start_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.docker_command, "docker");
        assert_eq!(config.timing.rollback_retries, 1);
        assert_eq!(config.modes.gaming.stop.len(), 3);
    }

    #[test]
    fn test_default_modes_are_disjoint() {
        let modes = ModesConfig::default();
        for def in [&modes.companion, &modes.training, &modes.gaming] {
            assert!(def.start.iter().all(|c| !def.stop.contains(c)));
        }
    }

    #[test]
    fn test_timing_is_capped() {
        let json = r#"{
            "timing": {
                "retry_backoff_ms": 18446744073709551615,
                "stop_timeout_secs": 18446744073709551615,
                "settle_delay_ms": 2000
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.timing.exceeds_max_wait());
        assert_eq!(config.timing.retry_backoff(), MAX_WAIT);
        assert_eq!(config.timing.stop_timeout(), MAX_WAIT);
        assert_eq!(config.timing.retry_backoff().saturating_mul(3).min(MAX_WAIT), MAX_WAIT);
        assert_eq!(config.timing.settle_delay(), Duration::from_millis(2000));
        assert!(!TimingConfig::default().exceeds_max_wait());
    }
}
