//! Static mode table. Built once from configuration, never mutated.

use crate::config::ModesConfig;
use crate::types::{Mode, ModeDefinition, ModeError};
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("mode {mode}: container {container} is in both the start and stop sets")]
    Overlap { mode: Mode, container: String },

    #[error("mode {mode}: empty container name")]
    EmptyName { mode: Mode },
}

#[derive(Debug, Clone)]
pub struct ModeRegistry {
    companion: ModeDefinition,
    training: ModeDefinition,
    gaming: ModeDefinition,
}

impl ModeRegistry {
    pub fn new(modes: ModesConfig) -> Result<Self, RegistryError> {
        let registry = Self {
            companion: modes.companion,
            training: modes.training,
            gaming: modes.gaming,
        };

        for (mode, def) in registry.iter() {
            if def.containers().any(|c| c.trim().is_empty()) {
                return Err(RegistryError::EmptyName { mode });
            }
            if let Some(container) = def.start.iter().find(|c| def.stop.contains(c)) {
                return Err(RegistryError::Overlap {
                    mode,
                    container: container.clone(),
                });
            }
        }

        Ok(registry)
    }

    /// Resolve a mode name to its definition.
    pub fn lookup(&self, name: &str) -> Result<(Mode, &ModeDefinition), ModeError> {
        let mode: Mode = name.parse()?;
        Ok((mode, self.definition(mode)))
    }

    pub fn definition(&self, mode: Mode) -> &ModeDefinition {
        match mode {
            Mode::Companion => &self.companion,
            Mode::Training => &self.training,
            Mode::Gaming => &self.gaming,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Mode, &ModeDefinition)> {
        Mode::ALL.into_iter().map(|m| (m, self.definition(m)))
    }

    /// Every container referenced by any mode, sorted and de-duplicated.
    pub fn containers(&self) -> BTreeSet<String> {
        self.iter()
            .flat_map(|(_, def)| def.containers().cloned())
            .collect()
    }

    pub fn is_known_container(&self, name: &str) -> bool {
        self.iter().any(|(_, def)| def.containers().any(|c| c == name))
    }
}
