//! Data layer configuration
//!
//! Plain serde structs with defaults, loadable from JSON. Every field may be
//! omitted; missing fields take their default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// How pending rerenders are flushed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FlushMode {
    /// A timer armed by the first change in a window flushes it.
    Auto { window_ms: u64 },
    /// Nothing is flushed until `flush()` is called.
    Manual,
}

impl Default for FlushMode {
    fn default() -> Self {
        FlushMode::Auto { window_ms: 16 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Deepest reference hop the resolver will follow.
    pub max_depth: usize,
    /// How long an unwatched subscription lingers before teardown.
    pub grace_period_ms: u64,
    pub flush: FlushMode,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            max_depth: crate::resolver::DEFAULT_MAX_DEPTH,
            grace_period_ms: 5_000,
            flush: FlushMode::default(),
        }
    }
}

impl LayerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Flush window, or `None` in manual mode.
    pub fn flush_window(&self) -> Option<Duration> {
        match self.flush {
            FlushMode::Auto { window_ms } => Some(Duration::from_millis(window_ms)),
            FlushMode::Manual => None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| WeftError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(WeftError::Config("max_depth must be at least 1".into()));
        }
        Ok(())
    }
}
