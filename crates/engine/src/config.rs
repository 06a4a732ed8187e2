use serde::{Deserialize, Serialize};

use contactsave_core::{AggregationMode, CoreError};

/// Tunables for the save path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveConfig {
    /// Apply attempts per save, including the first.
    pub persist_tries: u32,
    /// Mode written back after a local raw contact's edit bracket closes.
    pub restore_mode_for_local: AggregationMode,
    /// Strip `( ) - . / ;` and spaces from numbers before they reach a card.
    pub strip_number_separators: bool,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            persist_tries: 3,
            restore_mode_for_local: AggregationMode::Default,
            strip_number_separators: true,
        }
    }
}

impl SaveConfig {
    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SaveConfig::default();
        assert_eq!(config.persist_tries, 3);
        assert_eq!(config.restore_mode_for_local, AggregationMode::Default);
        assert!(config.strip_number_separators);
    }

    #[test]
    fn msgpack_roundtrip() {
        let config = SaveConfig {
            persist_tries: 5,
            ..SaveConfig::default()
        };
        assert_eq!(SaveConfig::from_msgpack(&config.to_msgpack().unwrap()).unwrap(), config);
    }
}
