//! Status snapshot served by the control API and `--status`.

use crate::switcher::ModeSwitcher;
use crate::types::{ContainerState, Mode, ModeDefinition, TrainingStatus};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub current_mode: Mode,
    pub modes: BTreeMap<&'static str, ModeDefinition>,
    pub training: TrainingStatus,
    pub containers: BTreeMap<String, ContainerState>,
    pub health: Health,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub gpu_accessible: bool,
    pub issues: Vec<String>,
}

/// Flag every running container that lacks GPU attachment.
pub fn health<'a>(states: impl IntoIterator<Item = &'a ContainerState>) -> Health {
    let issues: Vec<String> = states
        .into_iter()
        .filter(|s| s.running && !s.gpu_attached)
        .map(|s| format!("Container {} is running without GPU access", s.name))
        .collect();

    Health {
        gpu_accessible: issues.is_empty(),
        issues,
    }
}

pub async fn collect(switcher: &ModeSwitcher) -> StatusReport {
    let registry = switcher.registry();
    let detector = switcher.detector();

    let current_mode = detector.detect().await;
    let training = detector.check_training().await;

    let mut containers = BTreeMap::new();
    for name in registry.containers() {
        let state = switcher.inspector().get_state(&name).await;
        containers.insert(name, state);
    }

    StatusReport {
        current_mode,
        modes: registry
            .iter()
            .map(|(mode, def)| (mode.as_str(), def.clone()))
            .collect(),
        training,
        health: health(containers.values()),
        containers,
    }
}
