//! vmframe configuration system
//!
//! Diagnostics and platform switches are loaded once, then passed explicitly
//! to the frame layer (see [`crate::vm::frame::FrameEnv`]). Nothing in this
//! crate reads process-wide mutable flags.
//!
//! # Configuration file
//!
//! ```toml
//! [diagnostics]
//! trace_pc_patching = true
//! profile_interpreter = true
//!
//! [platform]
//! needs_deopt_suspend = false
//!
//! [gc]
//! parallel_root_scan = true
//!
//! [log]
//! level = "debug"
//! ```
//!
//! # Usage
//!
//! ```rust
//! use vmframe::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_toml_str("[diagnostics]\nprofile_interpreter = true").unwrap();
//! assert!(config.diagnostics.profile_interpreter);
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::util::logger::LogLevel;

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeConfig {
    /// Tracing and verification switches
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    /// Platform properties
    #[serde(default)]
    pub platform: PlatformConfig,
    /// Root scanning settings
    #[serde(default)]
    pub gc: GcConfig,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Diagnostics switches consulted by frame operations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    /// Log every return-address patch at info level
    #[serde(default)]
    pub trace_pc_patching: bool,
    /// Log deoptimization dependency checks
    #[serde(default)]
    pub trace_dependencies: bool,
    /// Log each sender step at trace level
    #[serde(default)]
    pub trace_frame_walk: bool,
    /// Interpreter keeps a profiling cursor (mdx) next to bcx
    #[serde(default)]
    pub profile_interpreter: bool,
    /// Check monitor addresses against the monitor block while scanning
    #[serde(default = "default_verify_monitors")]
    pub verify_monitors: bool,
}

fn default_verify_monitors() -> bool {
    cfg!(debug_assertions)
}

impl DiagnosticsConfig {
    /// Everything off.
    pub const QUIET: DiagnosticsConfig = DiagnosticsConfig {
        trace_pc_patching: false,
        trace_dependencies: false,
        trace_frame_walk: false,
        profile_interpreter: false,
        verify_monitors: false,
    };
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            verify_monitors: default_verify_monitors(),
            ..Self::QUIET
        }
    }
}

/// Platform properties
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Patching another thread's return address must happen at a safepoint
    /// and must not race a thread returning from native code.
    #[serde(default)]
    pub needs_deopt_suspend: bool,
}

/// Root scanning configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GcConfig {
    /// Scan thread stacks in parallel
    #[serde(default = "default_parallel_root_scan")]
    pub parallel_root_scan: bool,
}

fn default_parallel_root_scan() -> bool {
    true
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            parallel_root_scan: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum level
    #[serde(default)]
    pub level: LogLevel,
}

impl RuntimeConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::ParseError)
    }

    /// Load configuration from a file.
    /// Returns default config if the file doesn't exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a file
    pub fn save(
        &self,
        path: &Path,
    ) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::SerializeError)?;
        fs::write(path, content).map_err(ConfigError::IoError)?;
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(std::io::Error),
    #[error("Config parse error: {0}")]
    ParseError(toml::de::Error),
    #[error("Config serialize error: {0}")]
    SerializeError(toml::ser::Error),
}
