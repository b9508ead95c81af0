//! Frames and stack walking
//!
//! This module contains the frame abstraction and everything that operates
//! on it: sender computation, validation, oop scanning and deoptimization.

pub mod errors;
pub mod frame;

pub use errors::{FrameError, FrameResult};
pub use frame::{Frame, FrameEnv, FrameKind, RegisterLocationMap, StackFrameStream};

#[cfg(test)]
pub(crate) mod tests;
