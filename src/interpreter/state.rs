//! Shared record of one interpreted activation

use crate::runtime::layout::{FrameLayout, ScratchSaveArea};
use crate::runtime::stack::{word_offset, Address, ThreadStack, Word, WORD_SIZE};
use crate::runtime::thread::ThreadId;

use super::message::{CallMessage, FrameManagerMessage, Message, OsrMessage, ReturnKind};
use super::{ProtocolError, ProtocolResult};

/// State the engine and the frame manager share for one activation.
///
/// Expression stack entries live on the thread stack below the monitor
/// block. `stack` addresses the top entry and equals `stack_base + 1 word`
/// when the expression stack is empty. Locals grow downward from `locals`.
#[derive(Debug, Clone)]
pub struct InterpreterState {
    thread: ThreadId,
    method: Word,
    bcp: Address,
    locals: Address,
    max_locals: usize,
    constants: Word,
    mdx: Word,
    stack: Address,
    stack_base: Address,
    stack_limit: Address,
    monitor_base: Address,
    monitor_words: usize,
    fp: Address,
    oop_temp: Word,
    msg: Message,
    result: FrameManagerMessage,
    prev_link: Option<usize>,
    pending_exception: Option<Word>,
    scratch: ScratchSaveArea,
}

/// Fields the frame manager fixes when it lays out an activation
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActivationShape {
    pub method: Word,
    pub bcp: Address,
    pub locals: Address,
    pub max_locals: usize,
    pub constants: Word,
    pub fp: Address,
    pub monitor_base: Address,
    pub max_stack: usize,
    pub prev_link: Option<usize>,
}

impl InterpreterState {
    pub(crate) fn new(
        thread: ThreadId,
        shape: ActivationShape,
        layout: &FrameLayout,
    ) -> Self {
        // No monitors yet: the expression stack starts right below the block.
        let stack_base = word_offset(shape.monitor_base, -1);
        Self {
            thread,
            method: shape.method,
            bcp: shape.bcp,
            locals: shape.locals,
            max_locals: shape.max_locals,
            constants: shape.constants,
            mdx: 0,
            stack: shape.monitor_base,
            stack_base,
            stack_limit: Self::limit_for(stack_base, shape.max_stack),
            monitor_base: shape.monitor_base,
            monitor_words: layout.monitor_words,
            fp: shape.fp,
            oop_temp: 0,
            msg: Message::NoRequest,
            result: FrameManagerMessage::Empty,
            prev_link: shape.prev_link,
            pending_exception: None,
            scratch: ScratchSaveArea::for_layout(layout),
        }
    }

    /// State used only for the one-off initialization run
    pub(crate) fn for_initialize(
        thread: ThreadId,
        layout: &FrameLayout,
    ) -> Self {
        let shape = ActivationShape {
            method: 0,
            bcp: 0,
            locals: 0,
            max_locals: 0,
            constants: 0,
            fp: 0,
            monitor_base: 0,
            max_stack: 0,
            prev_link: None,
        };
        let mut state = Self::new(thread, shape, layout);
        state.msg = Message::Initialize;
        state
    }

    /// Lowest address an entry may occupy, for `max_stack` entries below `base`
    fn limit_for(
        stack_base: Address,
        max_stack: usize,
    ) -> Address {
        word_offset(stack_base, 1 - max_stack as isize)
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn method(&self) -> Word {
        self.method
    }

    pub fn bcp(&self) -> Address {
        self.bcp
    }

    pub fn set_bcp(
        &mut self,
        bcp: Address,
    ) {
        self.bcp = bcp;
    }

    pub fn locals(&self) -> Address {
        self.locals
    }

    pub fn constants(&self) -> Word {
        self.constants
    }

    pub fn mdx(&self) -> Word {
        self.mdx
    }

    pub fn set_mdx(
        &mut self,
        mdx: Word,
    ) {
        self.mdx = mdx;
    }

    pub fn oop_temp(&self) -> Word {
        self.oop_temp
    }

    pub fn set_oop_temp(
        &mut self,
        value: Word,
    ) {
        self.oop_temp = value;
    }

    /// Address of the top expression stack entry
    pub fn stack(&self) -> Address {
        self.stack
    }

    pub fn stack_base(&self) -> Address {
        self.stack_base
    }

    pub fn stack_limit(&self) -> Address {
        self.stack_limit
    }

    /// One past the highest monitor
    pub fn monitor_base(&self) -> Address {
        self.monitor_base
    }

    /// Lowest monitor; equal to the base when there are none
    pub fn monitor_end(&self) -> Address {
        word_offset(self.stack_base, 1)
    }

    pub fn monitor_count(&self) -> usize {
        (self.monitor_base - self.monitor_end()) / (self.monitor_words * WORD_SIZE)
    }

    /// Address of monitor `index`, counting from the highest one
    pub fn monitor_at(
        &self,
        index: usize,
    ) -> Option<Address> {
        (index < self.monitor_count())
            .then(|| word_offset(self.monitor_base, -(((index + 1) * self.monitor_words) as isize)))
    }

    pub fn fp(&self) -> Address {
        self.fp
    }

    pub fn msg(&self) -> Message {
        self.msg
    }

    pub fn result(&self) -> &FrameManagerMessage {
        &self.result
    }

    /// Caller activation, as an index into the manager's chain
    pub fn prev(&self) -> Option<usize> {
        self.prev_link
    }

    pub fn pending_exception(&self) -> Option<Word> {
        self.pending_exception
    }

    pub fn scratch(&self) -> &ScratchSaveArea {
        &self.scratch
    }

    pub fn scratch_mut(&mut self) -> &mut ScratchSaveArea {
        &mut self.scratch
    }

    // Expression stack and locals

    pub fn stack_depth(&self) -> usize {
        (self.monitor_end() - self.stack) / WORD_SIZE
    }

    pub fn push(
        &mut self,
        stack: &ThreadStack,
        value: Word,
    ) -> ProtocolResult<()> {
        let next = word_offset(self.stack, -1);
        if next < self.stack_limit {
            return Err(ProtocolError::ExpressionStackOverflow {
                method: self.method,
            });
        }
        stack.write(next, value)?;
        self.stack = next;
        Ok(())
    }

    pub fn pop(
        &mut self,
        stack: &ThreadStack,
    ) -> ProtocolResult<Word> {
        if self.stack_depth() == 0 {
            return Err(ProtocolError::ExpressionStackUnderflow {
                method: self.method,
            });
        }
        let value = stack.read(self.stack)?;
        self.stack = word_offset(self.stack, 1);
        Ok(value)
    }

    /// Entry `depth` words below the top, 0 being the top
    pub fn peek(
        &self,
        stack: &ThreadStack,
        depth: usize,
    ) -> ProtocolResult<Word> {
        if depth >= self.stack_depth() {
            return Err(ProtocolError::ExpressionStackUnderflow {
                method: self.method,
            });
        }
        Ok(stack.read(word_offset(self.stack, depth as isize))?)
    }

    fn local_addr(
        &self,
        index: usize,
    ) -> ProtocolResult<Address> {
        if index >= self.max_locals {
            return Err(ProtocolError::LocalOutOfRange {
                method: self.method,
                index,
            });
        }
        Ok(word_offset(self.locals, -(index as isize)))
    }

    pub fn local(
        &self,
        stack: &ThreadStack,
        index: usize,
    ) -> ProtocolResult<Word> {
        Ok(stack.read(self.local_addr(index)?)?)
    }

    pub fn set_local(
        &mut self,
        stack: &ThreadStack,
        index: usize,
        value: Word,
    ) -> ProtocolResult<()> {
        Ok(stack.write(self.local_addr(index)?, value)?)
    }

    // Engine requests

    fn post(
        &mut self,
        msg: Message,
        result: FrameManagerMessage,
    ) -> ProtocolResult<()> {
        if !msg.is_request() {
            return Err(ProtocolError::NotARequest { message: msg });
        }
        if self.msg.is_request() {
            return Err(ProtocolError::RequestPending {
                pending: self.msg,
                requested: msg,
            });
        }
        tracing::trace!(thread = %self.thread, method = self.method, "engine posts {}", msg);
        self.msg = msg;
        self.result = result;
        Ok(())
    }

    pub fn request_call(
        &mut self,
        call: CallMessage,
    ) -> ProtocolResult<()> {
        self.post(Message::CallMethod, FrameManagerMessage::Call(call))
    }

    pub fn request_call_method_handle(
        &mut self,
        call: CallMessage,
    ) -> ProtocolResult<()> {
        self.post(Message::CallMethodHandle, FrameManagerMessage::Call(call))
    }

    /// Return; a result of `kind` must be on top of the expression stack
    pub fn request_return(
        &mut self,
        kind: ReturnKind,
    ) -> ProtocolResult<()> {
        self.post(Message::ReturnFromMethod, FrameManagerMessage::Return(kind))
    }

    pub fn request_more_monitors(&mut self) -> ProtocolResult<()> {
        self.post(Message::MoreMonitors, FrameManagerMessage::Empty)
    }

    pub fn request_throw(
        &mut self,
        exception: Word,
    ) -> ProtocolResult<()> {
        self.post(Message::ThrowingException, FrameManagerMessage::Empty)?;
        self.pending_exception = Some(exception);
        Ok(())
    }

    pub fn request_pop_frame(&mut self) -> ProtocolResult<()> {
        self.post(Message::PoppingFrame, FrameManagerMessage::Empty)
    }

    pub fn request_osr(
        &mut self,
        osr: OsrMessage,
    ) -> ProtocolResult<()> {
        self.post(Message::DoOsr, FrameManagerMessage::Osr(osr))
    }

    // Manager responses

    /// Whether `resume` answers what this state has pending
    pub fn accepts(
        &self,
        resume: Message,
    ) -> bool {
        use Message::*;
        match resume {
            Initialize | MethodEntry | DeoptResume => self.msg == NoRequest,
            MethodResume | RethrowException | DeoptResume2 => self.msg.is_call(),
            GotMonitors => self.msg == MoreMonitors,
            _ => false,
        }
    }

    /// Hand control back to the engine with `resume`
    pub fn resume(
        &mut self,
        resume: Message,
    ) -> ProtocolResult<()> {
        if !resume.is_response() {
            return Err(ProtocolError::NotAResponse { message: resume });
        }
        if !self.accepts(resume) {
            tracing::error!(pending = %self.msg, resume = %resume, "incompatible resume");
            return Err(ProtocolError::IncompatibleResume {
                pending: self.msg,
                resume,
            });
        }
        tracing::trace!(thread = %self.thread, method = self.method, "manager sends {}", resume);
        self.msg = resume;
        self.result = FrameManagerMessage::Empty;
        Ok(())
    }

    // Manager-side adjustments

    pub(crate) fn take_exception(&mut self) -> Option<Word> {
        self.pending_exception.take()
    }

    pub(crate) fn set_stack(
        &mut self,
        tos: Address,
    ) {
        self.stack = tos;
    }

    /// Drop every expression stack entry
    pub(crate) fn clear_stack(&mut self) {
        self.stack = self.monitor_end();
    }

    /// Move the expression stack down to make room for one more monitor
    pub(crate) fn grow_monitors(
        &mut self,
        stack: &ThreadStack,
    ) -> ProtocolResult<Address> {
        let delta = self.monitor_words as isize;
        let depth = self.stack_depth();
        let new_stack = word_offset(self.stack, -delta);
        stack.copy_words(self.stack, new_stack, depth)?;

        self.stack = new_stack;
        self.stack_base = word_offset(self.stack_base, -delta);
        self.stack_limit = word_offset(self.stack_limit, -delta);
        let monitor = self.monitor_end();
        stack.zero_words(monitor, self.monitor_words)?;
        Ok(monitor)
    }
}
