//! Settings of a chip read.

use crate::{lds::DataGroupId, EmrtdError};
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Which optional files to read and which protocols to run.
///
/// Missing JSON fields take their default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Fingerprints, usually protected by terminal authentication.
    pub read_dg3: bool,
    /// Displayed portrait.
    pub read_dg5: bool,
    /// Displayed signature or usual mark.
    pub read_dg7: bool,
    pub read_dg11: bool,
    pub read_dg12: bool,
    /// Active Authentication public key.
    pub read_dg15: bool,
    pub attempt_pace: bool,
    pub chip_authentication: bool,
    pub active_authentication: bool,
    pub passive_authentication: bool,
    /// Largest READ BINARY chunk.
    pub max_read_length: u8,
    /// Per command timeout the transport is expected to apply.
    pub timeout_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_dg3: false,
            read_dg5: true,
            read_dg7: true,
            read_dg11: true,
            read_dg12: true,
            read_dg15: true,
            attempt_pace: true,
            chip_authentication: true,
            active_authentication: true,
            passive_authentication: true,
            max_read_length: 0xDF,
            timeout_ms: 5000,
        }
    }
}

impl ReaderConfig {
    /// # Errors
    ///
    /// `EmrtdError::JsonError` if `json` is not a valid configuration.
    pub fn from_json(json: &str) -> Result<Self, EmrtdError> {
        serde_json::from_str(json).map_err(|e| {
            error!("Invalid reader configuration: {e}");
            EmrtdError::JsonError(e)
        })
    }

    /// Optional data groups to read after DG1 and DG2, in file order.
    #[must_use]
    pub fn optional_groups(&self) -> Vec<DataGroupId> {
        [
            (self.read_dg3, DataGroupId::Dg3),
            (self.read_dg5, DataGroupId::Dg5),
            (self.read_dg7, DataGroupId::Dg7),
            (self.read_dg11, DataGroupId::Dg11),
            (self.read_dg12, DataGroupId::Dg12),
        ]
        .into_iter()
        .filter_map(|(wanted, id)| wanted.then_some(id))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() -> Result<(), EmrtdError> {
        let config = ReaderConfig::from_json(r#"{"read_dg3": true, "attempt_pace": false, "max_read_length": 160}"#)?;
        assert!(config.read_dg3);
        assert!(!config.attempt_pace);
        assert_eq!(config.max_read_length, 0xA0);
        assert_eq!(config.timeout_ms, 5000);
        assert!(config.chip_authentication);
        assert_eq!(
            config.optional_groups(),
            vec![
                DataGroupId::Dg3,
                DataGroupId::Dg5,
                DataGroupId::Dg7,
                DataGroupId::Dg11,
                DataGroupId::Dg12
            ]
        );

        assert_eq!(ReaderConfig::from_json("{}")?, ReaderConfig::default());
        assert!(ReaderConfig::from_json(r#"{"max_read_length": 300}"#).is_err());
        Ok(())
    }

    #[test]
    fn test_serialize() -> Result<(), EmrtdError> {
        let json = serde_json::to_string(&ReaderConfig::default()).map_err(EmrtdError::JsonError)?;
        assert!(json.contains("\"max_read_length\":223"));
        assert_eq!(ReaderConfig::from_json(&json)?, ReaderConfig::default());
        Ok(())
    }
}
