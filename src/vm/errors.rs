//! Frame layer errors

use thiserror::Error;

use crate::runtime::layout::Reg;
use crate::runtime::stack::{Address, Word};
use crate::vm::frame::FrameKind;

/// Frame result
pub type FrameResult<T> = Result<T, FrameError>;

/// Frame errors
///
/// Everything except the validator reports corruption through this type.
/// A caller that receives one must stop walking the stack it came from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Stack address {addr:#x} out of bounds")]
    OutOfBounds { addr: Address },

    #[error("Misaligned stack address {addr:#x}")]
    Misaligned { addr: Address },

    #[error("Zero frame size for code blob '{name}'")]
    ZeroFrameSize { name: String },

    #[error("Sender pc {pc:#x} is not in any known code region")]
    UnknownSenderPc { pc: Address },

    #[error("Sender sp {sender_sp:#x} does not move up the stack from sp {sp:#x}")]
    NoProgress { sp: Address, sender_sp: Address },

    #[error("Walked past the first frame")]
    PastFirstFrame,

    #[error("Thread has no last Java frame")]
    NoLastJavaFrame,

    #[error("Unknown method {method:#x}")]
    UnknownMethod { method: Word },

    #[error("Invalid bytecode index {bcx:#x} for method '{method}'")]
    InvalidBcx { method: String, bcx: Word },

    #[error("Method '{method}' has no profiling data")]
    MissingMethodData { method: String },

    #[error("No oop map at pc {pc:#x} in '{name}'")]
    MissingOopMap { name: String, pc: Address },

    #[error("No interpreter oop map at bci {bci} in '{method}'")]
    MissingInterpreterOopMap { method: String, bci: u32 },

    #[error("No saved location for register {reg}")]
    MissingRegisterLocation { reg: Reg },

    #[error("Frame at sp {sp:#x} cannot be deoptimized")]
    NotDeoptimizable { sp: Address },

    #[error("Expected {expected} frame, found {found}")]
    WrongKind { expected: FrameKind, found: FrameKind },

    #[error("No adapter resolver for ricochet frame at pc {pc:#x}")]
    UnsupportedAdapter { pc: Address },

    #[error("Frame kind {kind} cannot be scanned for oops")]
    UnscannableFrame { kind: FrameKind },

    #[error("Operation requires a safepoint")]
    NotAtSafepoint,

    #[error("No Java frame above sp {sp:#x}")]
    NotJavaFrame { sp: Address },

    #[error("Interpreter frame at fp {fp:#x} has a corrupt {field}")]
    CorruptInterpreterFrame { fp: Address, field: &'static str },
}
