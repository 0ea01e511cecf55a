use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::path::Path;

use crate::matcher::MatcherConfig;
use crate::smoother::SmootherConfig;
use crate::source::OverpassConfig;
use crate::stabilizer::StabilizerConfig;

/// Engine configuration. Every field has a default, so a config file only
/// needs the values it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub matcher: MatcherConfig,
    pub smoother: SmootherConfig,
    pub stabilizer: StabilizerConfig,
    pub overpass: OverpassConfig,
    /// Look up the segments following the current one
    pub predict_continuations: bool,
    /// Log a GeoJSON dump of every matching cycle at trace level
    pub debug_geojson: bool,
    /// Capacity of the fix channel between sensor and session
    pub fix_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            smoother: SmootherConfig::default(),
            stabilizer: StabilizerConfig::default(),
            overpass: OverpassConfig::default(),
            predict_continuations: true,
            debug_geojson: false,
            fix_buffer: 16,
        }
    }
}

impl EngineConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_slice(bytes).map_err(|e| anyhow!("Invalid config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_json(&bytes)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.smoother;
        if !(s.min_duration_ms > 0.0 && s.min_duration_ms <= s.max_duration_ms) {
            return Err(anyhow!(
                "Invalid animation duration range [{}, {}]",
                s.min_duration_ms,
                s.max_duration_ms
            ));
        }
        if s.duration_window == 0 || self.stabilizer.window == 0 {
            return Err(anyhow!("Averaging windows must hold at least one sample"));
        }
        if self.matcher.search_radius_m <= 0.0 {
            return Err(anyhow!(
                "Search radius must be positive, got {}",
                self.matcher.search_radius_m
            ));
        }
        Ok(())
    }
}
