//! vmframe
//!
//! Stack introspection and execution coordination for a managed bytecode VM.
//!
//! The crate describes activation records living on a word-addressed thread
//! stack, walks them from callee to caller whatever produced them
//! (interpreter, compiler, native wrapper, call stub or adapter), enumerates
//! the object references they hold, redirects compiled activations to a
//! deoptimization handler, and drives interpreted activations through the
//! engine/frame-manager message protocol.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! fn main() -> vmframe::Result<()> {
//!     let config = vmframe::load_runtime(Path::new("vmframe.toml"))?;
//!     assert!(!config.platform.needs_deopt_suspend);
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

// Public modules
pub mod interpreter;
pub mod runtime;
pub mod vm;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use interpreter::{FrameManager, InterpreterState, Message, ProtocolError};
pub use runtime::code::{CodeBlob, CodeCache, CodeRegistry};
pub use runtime::stack::{Address, StackBounds, ThreadStack, Word};
pub use util::config::RuntimeConfig;
pub use vm::errors::{FrameError, FrameResult};
pub use vm::frame::{Frame, FrameEnv, FrameKind, RegisterLocationMap};

use tracing::debug;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "vmframe";

/// Load the runtime configuration and install the logger at its level.
///
/// A missing file yields the default configuration.
pub fn load_runtime(path: &::std::path::Path) -> Result<RuntimeConfig> {
    let config = RuntimeConfig::load(path)
        .with_context(|| format!("Failed to load runtime config: {}", path.display()))?;
    util::logger::try_init_with_level(config.log.level);
    debug!(path = %path.display(), "runtime configuration loaded");
    Ok(config)
}
