//! Runtime collaborators of the frame layer
//!
//! This module contains the simulated thread stacks, the code space, method
//! metadata, threads with their safepoint service, and the GC root scanner.

pub mod code;
pub mod gc;
pub mod layout;
pub mod metadata;
pub mod stack;
pub mod thread;
