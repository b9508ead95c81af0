//! Protocol vocabulary and the request payload union

use std::fmt;

use crate::runtime::metadata::BasicType;
use crate::runtime::stack::{Address, Word};

/// Which side a message travels to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frame manager to engine
    ToEngine,
    /// Engine to frame manager
    ToManager,
    /// Placeholder of a state with nothing pending
    None,
}

/// Protocol message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Message {
    #[default]
    NoRequest,
    /// One-off engine initialization
    Initialize,
    MethodEntry,
    /// Callee returned normally
    MethodResume,
    /// Resuming an activation rebuilt from a deoptimized compiled frame
    DeoptResume,
    /// Callee was popped; the invoke is executed again
    DeoptResume2,
    GotMonitors,
    /// Callee threw; the exception is on top of the expression stack
    RethrowException,

    CallMethod,
    CallMethodHandle,
    ReturnFromMethod,
    MoreMonitors,
    ThrowingException,
    PoppingFrame,
    DoOsr,
}

impl Message {
    pub fn direction(self) -> Direction {
        use Message::*;
        match self {
            NoRequest => Direction::None,
            Initialize | MethodEntry | MethodResume | DeoptResume | DeoptResume2 | GotMonitors
            | RethrowException => Direction::ToEngine,
            CallMethod | CallMethodHandle | ReturnFromMethod | MoreMonitors | ThrowingException
            | PoppingFrame | DoOsr => Direction::ToManager,
        }
    }

    /// Engine to manager
    pub fn is_request(self) -> bool {
        self.direction() == Direction::ToManager
    }

    /// Manager to engine
    pub fn is_response(self) -> bool {
        self.direction() == Direction::ToEngine
    }

    pub fn is_call(self) -> bool {
        matches!(self, Message::CallMethod | Message::CallMethodHandle)
    }

    pub fn name(self) -> &'static str {
        use Message::*;
        match self {
            NoRequest => "no_request",
            Initialize => "initialize",
            MethodEntry => "method_entry",
            MethodResume => "method_resume",
            DeoptResume => "deopt_resume",
            DeoptResume2 => "deopt_resume2",
            GotMonitors => "got_monitors",
            RethrowException => "rethrow_exception",
            CallMethod => "call_method",
            CallMethodHandle => "call_method_handle",
            ReturnFromMethod => "return_from_method",
            MoreMonitors => "more_monitors",
            ThrowingException => "throwing_exception",
            PoppingFrame => "popping_frame",
            DoOsr => "do_osr",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Callee description of a call request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallMessage {
    /// Method word of the callee
    pub callee: Word,
    /// Code address the call would jump to
    pub entry_point: Address,
    /// Length of the invoke bytecode, skipped when the call returns
    pub bcp_advance: u8,
}

/// Result kind of a returning method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    Void,
    Int,
    Long,
    Float,
    Double,
    Object,
}

impl ReturnKind {
    /// Expression stack words the result occupies
    pub fn size(self) -> usize {
        match self {
            ReturnKind::Void => 0,
            ReturnKind::Long | ReturnKind::Double => 2,
            _ => 1,
        }
    }
}

impl From<BasicType> for ReturnKind {
    fn from(ty: BasicType) -> Self {
        match ty {
            BasicType::Void => ReturnKind::Void,
            BasicType::Long => ReturnKind::Long,
            BasicType::Float => ReturnKind::Float,
            BasicType::Double => ReturnKind::Double,
            BasicType::Object | BasicType::Array => ReturnKind::Object,
            _ => ReturnKind::Int,
        }
    }
}

impl fmt::Display for ReturnKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            ReturnKind::Void => "return",
            ReturnKind::Int => "ireturn",
            ReturnKind::Long => "lreturn",
            ReturnKind::Float => "freturn",
            ReturnKind::Double => "dreturn",
            ReturnKind::Object => "areturn",
        };
        f.write_str(name)
    }
}

/// On-stack replacement request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsrMessage {
    /// Buffer holding the migrated locals and monitors
    pub buffer: Address,
    /// Entry of the compiled OSR code
    pub entry: Address,
}

/// Outcome of an on-stack replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsrResult {
    /// Start of the compiled code now running the activation
    pub nm: Address,
    /// Return address the compiled code resumes its caller through
    pub return_addr: Address,
}

/// Payload carried next to the message; only the variant named by the
/// pending message is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameManagerMessage {
    #[default]
    Empty,
    Call(CallMessage),
    Return(ReturnKind),
    Osr(OsrMessage),
    OsrResult(OsrResult),
}

impl FrameManagerMessage {
    fn variant(&self) -> &'static str {
        match self {
            FrameManagerMessage::Empty => "empty",
            FrameManagerMessage::Call(_) => "call",
            FrameManagerMessage::Return(_) => "return kind",
            FrameManagerMessage::Osr(_) => "osr request",
            FrameManagerMessage::OsrResult(_) => "osr result",
        }
    }

    /// Callee of a call request.
    ///
    /// # Panics
    ///
    /// Panics if the payload is not a call.
    pub fn call(&self) -> &CallMessage {
        match self {
            FrameManagerMessage::Call(call) => call,
            other => panic!("frame manager message holds {}, not a call", other.variant()),
        }
    }

    /// Kind of a return request.
    ///
    /// # Panics
    ///
    /// Panics if the payload is not a return kind.
    pub fn return_kind(&self) -> ReturnKind {
        match self {
            FrameManagerMessage::Return(kind) => *kind,
            other => panic!(
                "frame manager message holds {}, not a return kind",
                other.variant()
            ),
        }
    }

    /// # Panics
    ///
    /// Panics if the payload is not an OSR request.
    pub fn osr(&self) -> &OsrMessage {
        match self {
            FrameManagerMessage::Osr(osr) => osr,
            other => panic!(
                "frame manager message holds {}, not an osr request",
                other.variant()
            ),
        }
    }

    /// # Panics
    ///
    /// Panics if the payload is not an OSR result.
    pub fn osr_result(&self) -> &OsrResult {
        match self {
            FrameManagerMessage::OsrResult(result) => result,
            other => panic!(
                "frame manager message holds {}, not an osr result",
                other.variant()
            ),
        }
    }
}
