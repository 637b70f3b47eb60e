//! Container runtime access.
//!
//! Everything the orchestrator knows about containers comes through the
//! [`ContainerRuntime`] trait. The production implementation shells out to
//! the `docker` CLI; tests substitute an in-memory runtime.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

/// Errors from the container runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed (exit code {code}): {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("unexpected output from {command}: {reason}")]
    Parse { command: String, reason: String },
}

/// Runtime view of a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub running: bool,
    pub status: String,
    pub device_requests: Vec<DeviceRequest>,
}

/// One entry of `HostConfig.DeviceRequests`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRequest {
    #[serde(default)]
    pub driver: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub capabilities: Vec<Vec<String>>,
}

impl DeviceRequest {
    /// Whether this request is served by the NVIDIA driver.
    ///
    /// `docker run --gpus` records an empty driver with a `gpu` capability,
    /// which Docker resolves to the NVIDIA runtime.
    pub fn is_nvidia(&self) -> bool {
        if self.driver.eq_ignore_ascii_case("nvidia") {
            return true;
        }
        self.driver.is_empty()
            && self
                .capabilities
                .iter()
                .flatten()
                .any(|cap| cap.eq_ignore_ascii_case("gpu"))
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect(&self, name: &str) -> Result<ContainerInfo, RuntimeError>;

    /// Names of all currently running containers.
    async fn running_containers(&self) -> Result<Vec<String>, RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    async fn restart(&self, name: &str) -> Result<(), RuntimeError>;
}

/// [`ContainerRuntime`] backed by the `docker` CLI.
pub struct DockerCli {
    command: String,
}

impl DockerCli {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let cmdline = format!("{} {}", self.command, args.join(" "));
        debug!(command = %cmdline, "Running container runtime command");

        let output = Command::new(&self.command)
            .args(args)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                command: cmdline.clone(),
                source,
            })?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            debug!(command = %cmdline, code, stderr = %stderr, "Container runtime command failed");
            return Err(RuntimeError::Failed {
                command: cmdline,
                code,
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn lifecycle(&self, verb: &str, name: &str) -> Result<(), RuntimeError> {
        match self.run(&[verb, name]).await {
            Err(RuntimeError::Failed { ref stderr, .. }) if is_missing(stderr) => {
                Err(RuntimeError::NotFound(name.to_string()))
            }
            other => other.map(|_| ()),
        }
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect(&self, name: &str) -> Result<ContainerInfo, RuntimeError> {
        let stdout = match self.run(&["inspect", "--type", "container", name]).await {
            Err(RuntimeError::Failed { ref stderr, .. }) if is_missing(stderr) => {
                return Err(RuntimeError::NotFound(name.to_string()));
            }
            other => other?,
        };
        parse_inspect(&stdout).map_err(|reason| RuntimeError::Parse {
            command: format!("{} inspect {}", self.command, name),
            reason,
        })
    }

    async fn running_containers(&self) -> Result<Vec<String>, RuntimeError> {
        let stdout = self.run(&["ps", "--format", "{{.Names}}"]).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.lifecycle("start", name).await
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.lifecycle("stop", name).await
    }

    async fn restart(&self, name: &str) -> Result<(), RuntimeError> {
        self.lifecycle("restart", name).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDocument {
    state: InspectState,
    #[serde(default)]
    host_config: Option<InspectHostConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default, deserialize_with = "null_as_empty")]
    device_requests: Vec<DeviceRequest>,
}

/// Parse the JSON array printed by `docker inspect` for a single container.
pub fn parse_inspect(stdout: &str) -> Result<ContainerInfo, String> {
    let mut docs: Vec<InspectDocument> =
        serde_json::from_str(stdout).map_err(|e| e.to_string())?;

    if docs.len() > 1 {
        warn!(count = docs.len(), "docker inspect returned several objects, using the first");
    }
    if docs.is_empty() {
        return Err("empty inspect result".to_string());
    }
    let doc = docs.swap_remove(0);

    Ok(ContainerInfo {
        running: doc.state.running,
        status: doc.state.status,
        device_requests: doc
            .host_config
            .map(|hc| hc.device_requests)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_with_gpus_flag() {
        let json = r#"[{
            "Id": "abc123",
            "State": { "Status": "running", "Running": true, "Pid": 4242 },
            "HostConfig": {
                "DeviceRequests": [
                    { "Driver": "", "Count": -1, "DeviceIDs": null, "Capabilities": [["gpu"]], "Options": {} }
                ]
            }
        }]"#;

        let info = parse_inspect(json).unwrap();
        assert!(info.running);
        assert_eq!(info.status, "running");
        assert_eq!(info.device_requests.len(), 1);
        assert!(info.device_requests[0].is_nvidia());
    }

    #[test]
    fn test_parse_inspect_without_device_requests() {
        let json = r#"[{
            "State": { "Status": "exited", "Running": false },
            "HostConfig": { "DeviceRequests": null }
        }]"#;

        let info = parse_inspect(json).unwrap();
        assert!(!info.running);
        assert_eq!(info.status, "exited");
        assert!(info.device_requests.is_empty());
    }

    #[test]
    fn test_parse_inspect_rejects_garbage() {
        assert!(parse_inspect("[]").is_err());
        assert!(parse_inspect("Error: No such object").is_err());
    }

    #[test]
    fn test_device_request_driver_matching() {
        let explicit = DeviceRequest {
            driver: "nvidia".to_string(),
            capabilities: vec![],
        };
        assert!(explicit.is_nvidia());

        let other = DeviceRequest {
            driver: "amd".to_string(),
            capabilities: vec![vec!["gpu".to_string()]],
        };
        assert!(!other.is_nvidia());

        let no_caps = DeviceRequest::default();
        assert!(!no_caps.is_nvidia());
    }

    #[tokio::test]
    async fn test_docker_cli_missing_binary() {
        let docker = DockerCli::new("/nonexistent/docker-binary");
        let err = docker.running_containers().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }
}
