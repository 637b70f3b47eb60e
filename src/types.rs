//! Shared domain types used across the codebase.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// GPU usage profile. The set is closed: anything else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// AI-companion services (LLM, image generation) hold the GPU
    Companion,
    /// Image-model training owns the GPU
    Training,
    /// Every GPU container is stopped so the host can game
    Gaming,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Companion, Mode::Training, Mode::Gaming];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Companion => "companion",
            Mode::Training => "training",
            Mode::Gaming => "gaming",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "companion" => Ok(Mode::Companion),
            "training" => Ok(Mode::Training),
            "gaming" => Ok(Mode::Gaming),
            other => Err(ModeError::InvalidMode(other.to_string())),
        }
    }
}

/// Errors from mode lookup
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModeError {
    #[error("invalid mode: {0} (expected companion, training or gaming)")]
    InvalidMode(String),
}

/// Static description of which containers a mode needs running and stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeDefinition {
    pub display_name: String,
    pub description: String,
    /// Containers that must be running in this mode
    #[serde(default)]
    pub start: Vec<String>,
    /// Containers that must be stopped in this mode
    #[serde(default)]
    pub stop: Vec<String>,
}

impl ModeDefinition {
    /// Every container this mode touches, start set first.
    pub fn containers(&self) -> impl Iterator<Item = &String> {
        self.start.iter().chain(self.stop.iter())
    }
}

/// Point-in-time observation of one container. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    #[serde(skip)]
    pub name: String,
    pub running: bool,
    pub gpu_attached: bool,
    /// Raw runtime status, or [`ContainerState::NOT_FOUND`]
    pub status: String,
}

impl ContainerState {
    pub const NOT_FOUND: &'static str = "not found";

    pub fn not_found(name: &str) -> Self {
        Self {
            name: name.to_string(),
            running: false,
            gpu_attached: false,
            status: Self::NOT_FOUND.to_string(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.status != Self::NOT_FOUND
    }
}

/// Outcome of one mode switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub new_mode: Mode,
}

/// Summed GPU memory across all devices, in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuMemory {
    pub used_mib: u64,
    pub total_mib: u64,
}

/// Coarse view of whether training is happening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingStatus {
    pub is_training: bool,
    /// No job queue is introspected; always 0
    pub queue_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_memory: Option<GpuMemory>,
}

/// Errors from the switcher that are not expressible as a failed [`SwitchResult`].
#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error(transparent)]
    InvalidMode(#[from] ModeError),

    #[error("unknown container: {0}")]
    UnknownContainer(String),

    #[error(transparent)]
    Runtime(#[from] crate::runtime::RuntimeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("training".parse::<Mode>(), Ok(Mode::Training));
        assert_eq!(
            "turbo".parse::<Mode>(),
            Err(ModeError::InvalidMode("turbo".to_string()))
        );
        // Case matters, like the wire format
        assert!("Gaming".parse::<Mode>().is_err());
    }

    #[test]
    fn test_switch_result_omits_empty_warnings() {
        let result = SwitchResult {
            success: true,
            message: "ok".to_string(),
            warnings: vec![],
            new_mode: Mode::Gaming,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("warnings").is_none());
        assert_eq!(json["newMode"], "gaming");
    }
}
