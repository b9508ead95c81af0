//! Engine / frame-manager protocol
//!
//! The bytecode engine runs one interpreted activation until it needs
//! something only the owner of the physical stack can provide: a new
//! activation for a call, the caller resumed after a return, more monitor
//! space, an unwind for an exception, or a hand-off to compiled code. It
//! posts exactly one request into its [`InterpreterState`] and returns; the
//! [`FrameManager`] services the request and resumes an engine run with a
//! response message.
//!
//! ```text
//!   FrameManager                        BytecodeEngine
//!   ------------                        --------------
//!   start / push activation  -- method_entry -->  run
//!                            <-- call_method ---
//!   push callee activation   -- method_entry -->  run (callee)
//!                            <-- return_from_method
//!   pop callee, push result  -- method_resume --> run (caller)
//! ```

mod manager;
mod message;
mod state;

pub use manager::{
    BytecodeEngine, DeoptimizedActivation, EntryPoints, FrameManager, OsrHandler, StepOutcome,
};
pub use message::{
    CallMessage, Direction, FrameManagerMessage, Message, OsrMessage, OsrResult, ReturnKind,
};
pub use state::InterpreterState;

use thiserror::Error;

use crate::runtime::stack::{Address, Word};
use crate::vm::errors::FrameError;

/// Protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Protocol violations and resource exhaustion.
///
/// Every variant means the engine/manager pairing is broken or the thread
/// ran out of stack. The activation chain must not be driven further.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{requested} posted while {pending} is still pending")]
    RequestPending { pending: Message, requested: Message },

    #[error("{message} is not an engine request")]
    NotARequest { message: Message },

    #[error("{message} is not a frame manager response")]
    NotAResponse { message: Message },

    #[error("Cannot resume with {resume} while {pending} is pending")]
    IncompatibleResume { pending: Message, resume: Message },

    #[error("Activation still waits on {pending}")]
    NotResumed { pending: Message },

    #[error("Engine returned from method {method:#x} without a request")]
    NoRequest { method: Word },

    #[error("Engine posted {message} during initialization")]
    UnexpectedRequest { message: Message },

    #[error("Frame manager not initialized")]
    NotInitialized,

    #[error("Frame manager already has an entry frame")]
    AlreadyStarted,

    #[error("No interpreted activation")]
    NoActivation,

    #[error("Thread stack exhausted: need {needed:#x}, limit {limit:#x}")]
    StackOverflow { needed: Address, limit: Address },

    #[error("Expression stack overflow in method {method:#x}")]
    ExpressionStackOverflow { method: Word },

    #[error("Expression stack underflow in method {method:#x}")]
    ExpressionStackUnderflow { method: Word },

    #[error("Local {index} out of range in method {method:#x}")]
    LocalOutOfRange { method: Word, index: usize },

    #[error("Expected {expected} argument words, got {found}")]
    ArgumentCount { expected: usize, found: usize },

    #[error("Callee {callee:#x} at {entry:#x} is not interpreted")]
    UnsupportedCallee { callee: Word, entry: Address },

    #[error("Return kind {found} does not match declared {expected}")]
    ReturnKindMismatch { expected: ReturnKind, found: ReturnKind },

    #[error("Exception request without an exception")]
    MissingException,

    #[error("Cannot pop the outermost activation")]
    PopOutermost,

    #[error("No on-stack replacement handler installed")]
    OsrUnavailable,

    #[error("No on-stack replacement in progress")]
    NoOsrPending,

    #[error("Engine failure: {0}")]
    Engine(String),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[cfg(test)]
mod tests;
