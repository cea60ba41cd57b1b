//! # Scheduler Configuration
//!
//! Loaded once at startup, usually from a TOML file:
//!
//! ```toml
//! mode = "threaded"
//! thread_name = "tandem-core"
//! frame_alloc_block_size = 1048576
//! initial_queue_capacity = 256
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tandem_core::DEFAULT_BLOCK_SIZE;

use crate::error::ConfigError;

/// How submitted commands are executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// A dedicated core thread runs every command.
    Threaded,
    /// No core thread; submitted commands run on the submitting thread.
    Inline,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        if cfg!(feature = "single-threaded") {
            Self::Inline
        } else {
            Self::Threaded
        }
    }
}

/// Configuration for [`CoreThread`](crate::CoreThread).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Execution mode.
    pub mode: ExecutionMode,
    /// Name given to the spawned core thread.
    pub thread_name: String,
    /// Minimum block size of each frame allocator, in bytes.
    pub frame_alloc_block_size: usize,
    /// Initial command capacity of each per-thread queue.
    pub initial_queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            thread_name: "tandem-core".to_string(),
            frame_alloc_block_size: DEFAULT_BLOCK_SIZE,
            initial_queue_capacity: 256,
        }
    }
}

impl SchedulerConfig {
    /// Inline configuration: no core thread is spawned.
    #[must_use]
    pub fn inline() -> Self {
        Self {
            mode: ExecutionMode::Inline,
            ..Self::default()
        }
    }

    /// Threaded configuration regardless of the `single-threaded` feature.
    #[must_use]
    pub fn threaded() -> Self {
        Self {
            mode: ExecutionMode::Threaded,
            ..Self::default()
        }
    }

    /// Parses a configuration from TOML text. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on malformed TOML, unknown keys, or
    /// out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_name.is_empty() {
            return Err(ConfigError::Invalid("thread_name must not be empty".into()));
        }
        if self.thread_name.contains('\0') {
            return Err(ConfigError::Invalid(
                "thread_name must not contain NUL bytes".into(),
            ));
        }
        if self.frame_alloc_block_size == 0 {
            return Err(ConfigError::Invalid(
                "frame_alloc_block_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
