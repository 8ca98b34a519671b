//! Session-wide configuration.
//!
//! Every field has a documented default, so a partial JSON document such as
//! `{"tracker": {"max_misses": 20}}` is a complete configuration.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::speedview_heatmap::HeatmapConfig;
use crate::speedview_speed::SpeedConfig;
use crate::speedview_tracking::TrackerConfig;

/// Configuration for a `Session`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tracker: TrackerConfig,
    pub speed: SpeedConfig,
    pub heatmap: HeatmapConfig,
}

impl EngineConfig {
    /// Check every sub-configuration.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.tracker.validate()?;
        self.speed.validate()?;
        self.heatmap.validate()?;
        Ok(())
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::invalid_dimension(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::invalid_dimension(format!("config encode error: {}", e)))
    }
}
