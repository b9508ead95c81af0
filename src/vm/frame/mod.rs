//! Frames
//!
//! A [`Frame`] is a copyable view of one activation record: stack pointer,
//! unextended stack pointer, frame pointer, pc, the code blob containing
//! the pc and the lazily known deoptimization state. It owns nothing and
//! must be rebuilt after anything moves the stack or patches a return
//! address it depends on.
//!
//! Operations are split by concern:
//! - `interpreted`: interpreter frame fields (method, bcx/mdx, locals,
//!   expression stack, monitors)
//! - `sender`: caller computation for every kind
//! - `validate`: the non-faulting "safe for sender" predicate
//! - `oops`: reference enumeration and the GC prologue/epilogue
//! - `deopt`: return address patching and the deferred self-deopt protocol
//! - `stream`: iteration over a stopped thread's frames

mod deopt;
mod interpreted;
mod oops;
mod register_map;
mod sender;
mod stream;
mod validate;

use std::fmt;

use crate::runtime::code::{BlobKind, CodeBlob, CodeRegistry, CompiledMethod};
use crate::runtime::layout::FrameLayout;
use crate::runtime::metadata::MethodResolver;
use crate::runtime::stack::{word_offset, Address, ThreadStack, Word, WORD_SIZE};
use crate::runtime::thread::CallWrapper;
use crate::util::config::DiagnosticsConfig;
use crate::vm::errors::{FrameError, FrameResult};

pub use deopt::{DeoptOutcome, DeoptSource, Deoptimizer};
pub use interpreted::InterpretedResult;
pub use oops::{CodeBlobVisitor, OopVisitor};
pub use register_map::RegisterLocationMap;
pub use sender::{AdapterResolver, NoAdapters};
pub use stream::{StackFrameStream, WalkedFrame};

/// Everything a frame needs to interpret raw stack words
#[derive(Clone, Copy)]
pub struct FrameEnv<'a> {
    pub stack: &'a ThreadStack,
    pub code: &'a dyn CodeRegistry,
    pub methods: &'a dyn MethodResolver,
    pub adapters: &'a dyn AdapterResolver,
    pub layout: &'a FrameLayout,
    pub diagnostics: DiagnosticsConfig,
}

impl<'a> FrameEnv<'a> {
    pub fn new(
        stack: &'a ThreadStack,
        code: &'a dyn CodeRegistry,
        methods: &'a dyn MethodResolver,
    ) -> Self {
        Self {
            stack,
            code,
            methods,
            adapters: &NoAdapters,
            layout: &FrameLayout::X86_64,
            diagnostics: DiagnosticsConfig::default(),
        }
    }

    pub fn with_adapters(
        mut self,
        adapters: &'a dyn AdapterResolver,
    ) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_layout(
        mut self,
        layout: &'a FrameLayout,
    ) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_diagnostics(
        mut self,
        diagnostics: DiagnosticsConfig,
    ) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

impl fmt::Debug for FrameEnv<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FrameEnv")
            .field("stack", &self.stack.bounds())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

/// Kind of activation, decided by the pc and the blob containing it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Boundary where the VM called into managed code
    Entry,
    Interpreted,
    /// Compiled Java method
    Compiled,
    /// Compiled wrapper of a native method
    NativeWrapper,
    /// Method-handle adapter frame
    Ricochet,
    /// Runtime stub, adapter or safepoint blob
    Stub,
    /// Code outside the code space
    Native,
}

impl fmt::Display for FrameKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            FrameKind::Entry => "entry",
            FrameKind::Interpreted => "interpreted",
            FrameKind::Compiled => "compiled",
            FrameKind::NativeWrapper => "native wrapper",
            FrameKind::Ricochet => "ricochet",
            FrameKind::Stub => "stub",
            FrameKind::Native => "native",
        };
        f.write_str(name)
    }
}

/// Whether a compiled frame has been redirected to a deopt handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptState {
    Unknown,
    NotDeoptimized,
    Deoptimized,
}

/// One activation record
#[derive(Clone, Copy)]
pub struct Frame<'a> {
    env: FrameEnv<'a>,
    sp: Address,
    unextended_sp: Address,
    fp: Address,
    pc: Address,
    cb: Option<&'a CodeBlob>,
    deopt_state: DeoptState,
}

impl<'a> Frame<'a> {
    /// Frame whose unextended sp equals its sp
    pub fn new(
        env: FrameEnv<'a>,
        sp: Address,
        fp: Address,
        pc: Address,
    ) -> Self {
        let mut frame = Self::raw(env, sp, sp, fp, pc);
        frame.init_deopt_state();
        frame
    }

    /// Frame whose caller may have extended the stack below `unextended_sp`
    pub fn with_unextended(
        env: FrameEnv<'a>,
        sp: Address,
        unextended_sp: Address,
        fp: Address,
        pc: Address,
    ) -> Self {
        let mut frame = Self::raw(env, sp, unextended_sp, fp, pc);
        frame.adjust_unextended_sp();
        frame.init_deopt_state();
        frame
    }

    fn raw(
        env: FrameEnv<'a>,
        sp: Address,
        unextended_sp: Address,
        fp: Address,
        pc: Address,
    ) -> Self {
        Self {
            env,
            sp,
            unextended_sp,
            fp,
            pc,
            cb: env.code.find(pc),
            deopt_state: DeoptState::Unknown,
        }
    }

    /// Returning to a method-handle call site means the saved fp slot
    /// actually holds the caller's unextended sp.
    fn adjust_unextended_sp(&mut self) {
        let Some(nm) = self.compiled_method() else {
            return;
        };
        if nm.is_deopt_mh_entry(self.pc) || nm.is_method_handle_return(self.pc) {
            self.unextended_sp = self.fp;
        }
    }

    fn init_deopt_state(&mut self) {
        match self.deopt_original_pc() {
            Some(original) => {
                self.pc = original;
                self.deopt_state = DeoptState::Deoptimized;
            }
            None => self.deopt_state = DeoptState::NotDeoptimized,
        }
    }

    /// Original pc if this frame's pc is a deopt handler entry
    fn deopt_original_pc(&self) -> Option<Address> {
        let nm = self.compiled_method()?;
        if !nm.is_deopt_pc(self.pc) {
            return None;
        }
        let original = nm.original_pc(self.id());
        if original.is_none() {
            tracing::warn!(
                sp = self.sp,
                pc = self.pc,
                "frame at a deopt handler has no recorded original pc"
            );
        }
        original
    }

    pub fn env(&self) -> FrameEnv<'a> {
        self.env
    }

    pub fn sp(&self) -> Address {
        self.sp
    }

    pub fn unextended_sp(&self) -> Address {
        self.unextended_sp
    }

    pub fn fp(&self) -> Address {
        self.fp
    }

    /// Resume pc; for a deoptimized frame, the pc before patching
    pub fn pc(&self) -> Address {
        self.pc
    }

    pub fn cb(&self) -> Option<&'a CodeBlob> {
        self.cb
    }

    pub fn deopt_state(&self) -> DeoptState {
        self.deopt_state
    }

    /// Stable identity of the activation
    pub fn id(&self) -> Address {
        self.unextended_sp
    }

    /// Pc the hardware will return to
    pub fn raw_pc(&self) -> Address {
        let deoptimized = self.deopt_state == DeoptState::Deoptimized;
        match (deoptimized, self.compiled_method()) {
            (true, Some(nm)) if nm.is_method_handle_return(self.pc) => nm.deopt_mh_handler(),
            (true, Some(nm)) => nm.deopt_handler(),
            _ => self.pc,
        }
    }

    /// Change the pc of this view only; the stack is untouched.
    pub fn set_pc(
        &mut self,
        pc: Address,
    ) {
        debug_assert!(
            !self.compiled_method().is_some_and(|nm| nm.is_deopt_pc(self.pc)),
            "a resolved frame never holds a deopt pc"
        );
        self.deopt_state = DeoptState::Unknown;
        self.pc = pc;
        self.cb = self.env.code.find(pc);
    }

    pub(crate) fn compiled_method(&self) -> Option<&'a CompiledMethod> {
        self.cb.and_then(CodeBlob::as_compiled)
    }

    pub fn kind(&self) -> FrameKind {
        let Some(cb) = self.cb else {
            return FrameKind::Native;
        };
        match cb.kind() {
            BlobKind::Interpreter => FrameKind::Interpreted,
            BlobKind::CallStub { return_pc } if *return_pc == self.pc => FrameKind::Entry,
            BlobKind::Compiled(nm) if nm.is_java_method() => FrameKind::Compiled,
            BlobKind::Compiled(_) => FrameKind::NativeWrapper,
            BlobKind::Ricochet { bounce_pc } if *bounce_pc == self.pc => FrameKind::Ricochet,
            _ => FrameKind::Stub,
        }
    }

    pub fn is_entry_frame(&self) -> bool {
        self.kind() == FrameKind::Entry
    }

    pub fn is_interpreted_frame(&self) -> bool {
        self.kind() == FrameKind::Interpreted
    }

    pub fn is_compiled_frame(&self) -> bool {
        self.kind() == FrameKind::Compiled
    }

    /// Compiled wrapper of a native method
    pub fn is_native_frame(&self) -> bool {
        self.kind() == FrameKind::NativeWrapper
    }

    pub fn is_ricochet_frame(&self) -> bool {
        self.kind() == FrameKind::Ricochet
    }

    pub fn is_runtime_frame(&self) -> bool {
        self.cb.is_some_and(CodeBlob::is_runtime_stub)
    }

    pub fn is_safepoint_blob_frame(&self) -> bool {
        self.cb.is_some_and(CodeBlob::is_safepoint_stub)
    }

    pub fn is_java_frame(&self) -> bool {
        matches!(self.kind(), FrameKind::Interpreted | FrameKind::Compiled)
    }

    pub fn is_deoptimized_frame(&self) -> bool {
        debug_assert!(self.deopt_state != DeoptState::Unknown, "not answerable");
        self.deopt_state == DeoptState::Deoptimized
    }

    /// Entry frame with no managed activation above it
    pub fn is_first_frame(&self) -> FrameResult<bool> {
        Ok(self.is_entry_frame() && self.entry_frame_is_first()?)
    }

    /// Size of this frame in words, measured up to the sender's sp
    pub fn frame_size(
        &self,
        map: &mut RegisterLocationMap,
    ) -> FrameResult<usize> {
        let sender = self.sender(map)?;
        Ok(sender.sp.wrapping_sub(self.sp) / WORD_SIZE)
    }

    /// Marked for deoptimization and not already returning
    pub fn should_be_deoptimized(&self) -> bool {
        if self.deopt_state == DeoptState::Deoptimized || !self.is_compiled_frame() {
            return false;
        }
        let Some(nm) = self.compiled_method() else {
            return false;
        };
        if self.env.diagnostics.trace_dependencies {
            tracing::info!(
                marked = nm.is_marked_for_deoptimization(),
                blob = self.cb.map(CodeBlob::name).unwrap_or_default(),
                "checking deoptimization dependency"
            );
        }
        nm.is_marked_for_deoptimization() && !nm.is_at_poll_return(self.pc)
    }

    pub fn can_be_deoptimized(&self) -> bool {
        if !self.is_compiled_frame() {
            return false;
        }
        self.compiled_method()
            .is_some_and(|nm| nm.can_be_deoptimized() && !nm.is_at_poll_return(self.pc))
    }

    // Raw slot access relative to fp.

    pub(crate) fn addr_at(
        &self,
        offset: isize,
    ) -> Address {
        self.env.layout.slot(self.fp, offset)
    }

    pub(crate) fn at(
        &self,
        offset: isize,
    ) -> FrameResult<Word> {
        self.env.stack.read(self.addr_at(offset))
    }

    pub(crate) fn put_at(
        &self,
        offset: isize,
        value: Word,
    ) -> FrameResult<()> {
        self.env.stack.write(self.addr_at(offset), value)
    }

    /// Saved frame pointer of the caller
    pub fn link(&self) -> FrameResult<Address> {
        self.at(self.env.layout.link)
    }

    /// Return address into the caller, read through fp
    pub fn sender_pc(&self) -> FrameResult<Address> {
        self.at(self.env.layout.return_addr)
    }

    /// Caller's sp, just above the return address
    pub fn sender_sp(&self) -> Address {
        self.addr_at(self.env.layout.sender_sp)
    }

    // Entry frames

    fn expect_kind(
        &self,
        expected: FrameKind,
    ) -> FrameResult<()> {
        let found = self.kind();
        if found != expected {
            return Err(FrameError::WrongKind { expected, found });
        }
        Ok(())
    }

    /// Address of the call wrapper record
    pub fn entry_frame_call_wrapper_addr(&self) -> FrameResult<Address> {
        self.at(self.env.layout.entry_call_wrapper)
    }

    pub fn entry_frame_call_wrapper(&self) -> FrameResult<CallWrapper<'a>> {
        self.expect_kind(FrameKind::Entry)?;
        let addr = self.entry_frame_call_wrapper_addr()?;
        Ok(CallWrapper::at(self.env.stack, addr))
    }

    pub fn entry_frame_is_first(&self) -> FrameResult<bool> {
        Ok(self.entry_frame_call_wrapper()?.anchor()?.is_empty())
    }

    /// Argument slot `offset`; the last argument is at offset 0
    pub fn entry_frame_argument_at(
        &self,
        offset: usize,
    ) -> Address {
        word_offset(self.unextended_sp, offset as isize)
    }
}

impl PartialEq for Frame<'_> {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.sp == other.sp
            && self.unextended_sp == other.unextended_sp
            && self.fp == other.fp
            && self.pc == other.pc
    }
}

impl Eq for Frame<'_> {}

impl fmt::Debug for Frame<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind())
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("unextended_sp", &format_args!("{:#x}", self.unextended_sp))
            .field("fp", &format_args!("{:#x}", self.fp))
            .field("pc", &format_args!("{:#x}", self.pc))
            .field("blob", &self.cb.map(CodeBlob::name))
            .field("deopt_state", &self.deopt_state)
            .finish()
    }
}

impl fmt::Display for Frame<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "{} frame (sp={:#x} unextended_sp={:#x}, fp={:#x}, pc={:#x})",
            self.kind(),
            self.sp,
            self.unextended_sp,
            self.fp,
            self.pc
        )?;
        if let Some(cb) = self.cb {
            write!(f, " in {}", cb.name())?;
        }
        Ok(())
    }
}
