//! Frame manager: owns the physical stack of interpreted activations

use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use crate::runtime::code::CodeRegistry;
use crate::runtime::metadata::{Method, MethodResolver};
use crate::runtime::stack::{word_offset, Address, ThreadStack, Word};
use crate::runtime::thread::{CallWrapper, FrameAnchor, ManagedThread, ThreadState};
use crate::vm::errors::FrameError;
use crate::vm::frame::{DeoptSource, Frame, FrameEnv};

use super::message::{Message, OsrMessage, OsrResult, ReturnKind};
use super::state::{ActivationShape, InterpreterState};
use super::{ProtocolError, ProtocolResult};

/// Bytecode engine driven by the frame manager.
///
/// One `run` executes the activation in `state` until it posts a request.
pub trait BytecodeEngine {
    fn run(
        &mut self,
        state: &mut InterpreterState,
        stack: &ThreadStack,
    ) -> ProtocolResult<()>;
}

impl<F> BytecodeEngine for F
where
    F: FnMut(&mut InterpreterState, &ThreadStack) -> ProtocolResult<()>,
{
    fn run(
        &mut self,
        state: &mut InterpreterState,
        stack: &ThreadStack,
    ) -> ProtocolResult<()> {
        self(state, stack)
    }
}

/// Migrates an interpreted activation into compiled code
pub trait OsrHandler {
    fn migrate(
        &mut self,
        method: &Method,
        state: &InterpreterState,
        osr: &OsrMessage,
    ) -> ProtocolResult<OsrResult>;
}

/// Code addresses the manager stores as return addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoints {
    /// Return address into the interpreter, used by every callee and the anchor
    pub interpreter_return_pc: Address,
    /// Return address into the call stub, used by the outermost activation
    pub call_stub_return_pc: Address,
}

/// What one serviced request did to the activation chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A callee activation was pushed
    Called { depth: usize },
    /// An existing activation was resumed with `message`
    Resumed { depth: usize, message: Message },
    /// The outermost activation returned
    Returned {
        kind: ReturnKind,
        value: SmallVec<[Word; 2]>,
    },
    /// An exception left the outermost activation
    Threw { exception: Word },
    /// The top activation now runs as compiled code
    OnStackReplaced { result: OsrResult },
}

impl StepOutcome {
    /// Whether the manager has nothing left to drive
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepOutcome::Returned { .. }
                | StepOutcome::Threw { .. }
                | StepOutcome::OnStackReplaced { .. }
        )
    }
}

/// Interpreter image of a deoptimized compiled activation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeoptimizedActivation {
    pub method: Word,
    pub bci: u32,
    /// Locals, index 0 first
    pub locals: Vec<Word>,
    /// Expression stack, deepest entry first
    pub expressions: Vec<Word>,
    /// Owner of each held monitor, outermost first
    pub monitors: Vec<Word>,
    /// Compiled frame being replaced, released once the image is pushed
    pub source: Option<DeoptSource>,
}

#[derive(Debug)]
struct Activation {
    state: InterpreterState,
    /// Parameter words the caller pushed for this activation
    params: usize,
}

#[derive(Debug, Clone, Copy)]
struct EntryRecord {
    wrapper: Address,
    saved_anchor: FrameAnchor,
}

/// Caller side of an activation that left for compiled code
#[derive(Debug, Clone, Copy)]
struct PendingOsr {
    caller: Option<usize>,
    params: usize,
    kind: ReturnKind,
}

/// Lays out interpreted activations on a thread stack and services the
/// requests their engine posts.
pub struct FrameManager<'a> {
    thread: &'a ManagedThread,
    env: FrameEnv<'a>,
    entry_points: EntryPoints,
    activations: Vec<Activation>,
    entry: Option<EntryRecord>,
    osr_handler: Option<Box<dyn OsrHandler + 'a>>,
    pending_osr: Option<PendingOsr>,
    initialized: bool,
}

impl<'a> FrameManager<'a> {
    pub fn new(
        thread: &'a ManagedThread,
        env: FrameEnv<'a>,
        entry_points: EntryPoints,
    ) -> Self {
        debug_assert!(
            std::ptr::eq(env.stack, thread.stack()),
            "frame environment must describe the thread's own stack"
        );
        Self {
            thread,
            env,
            entry_points,
            activations: Vec::new(),
            entry: None,
            osr_handler: None,
            pending_osr: None,
            initialized: false,
        }
    }

    pub fn with_osr_handler(
        mut self,
        handler: impl OsrHandler + 'a,
    ) -> Self {
        self.osr_handler = Some(Box::new(handler));
        self
    }

    pub fn thread(&self) -> &'a ManagedThread {
        self.thread
    }

    pub fn env(&self) -> FrameEnv<'a> {
        self.env
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of live interpreted activations
    pub fn depth(&self) -> usize {
        self.activations.len()
    }

    pub fn state(
        &self,
        index: usize,
    ) -> Option<&InterpreterState> {
        self.activations.get(index).map(|a| &a.state)
    }

    pub fn top(&self) -> Option<&InterpreterState> {
        self.activations.last().map(|a| &a.state)
    }

    /// Activations from the top to the outermost, following caller links
    pub fn chain(&self) -> impl Iterator<Item = &InterpreterState> + '_ {
        std::iter::successors(self.top(), move |state| {
            state.prev().and_then(|index| self.state(index))
        })
    }

    /// Physical frame of the top activation
    pub fn top_frame(&self) -> Option<Frame<'a>> {
        self.top().map(|state| self.frame_of(state))
    }

    /// Call wrapper of the current entry frame
    pub fn entry_wrapper(&self) -> Option<Address> {
        self.entry.map(|entry| entry.wrapper)
    }

    fn frame_of(
        &self,
        state: &InterpreterState,
    ) -> Frame<'a> {
        Frame::new(
            self.env,
            state.stack(),
            state.fp(),
            self.entry_points.interpreter_return_pc,
        )
    }

    fn resolve(
        &self,
        method: Word,
    ) -> ProtocolResult<&'a Method> {
        let methods: &'a dyn MethodResolver = self.env.methods;
        methods
            .resolve(method)
            .ok_or(ProtocolError::Frame(FrameError::UnknownMethod { method }))
    }

    /// One-off engine initialization; later calls do nothing
    pub fn initialize(
        &mut self,
        engine: &mut dyn BytecodeEngine,
    ) -> ProtocolResult<()> {
        if self.initialized {
            return Ok(());
        }
        let mut state = InterpreterState::for_initialize(self.thread.id(), self.env.layout);
        engine.run(&mut state, self.env.stack)?;
        if state.msg().is_request() {
            return Err(ProtocolError::UnexpectedRequest {
                message: state.msg(),
            });
        }
        self.initialized = true;
        debug!(thread = %self.thread.id(), "interpreter initialized");
        Ok(())
    }

    /// Call into `method` from outside managed code.
    ///
    /// Writes a call wrapper and an entry frame below the current top of
    /// the thread's managed stack, then pushes the first activation.
    pub fn start(
        &mut self,
        method: Word,
        args: &[Word],
        handles: &[Word],
    ) -> ProtocolResult<()> {
        if !self.initialized {
            return Err(ProtocolError::NotInitialized);
        }
        if self.entry.is_some() {
            return Err(ProtocolError::AlreadyStarted);
        }
        let callee = self.resolve(method)?;
        let params = callee.size_of_parameters();
        if args.len() != params {
            return Err(ProtocolError::ArgumentCount {
                expected: params,
                found: args.len(),
            });
        }

        let stack = self.env.stack;
        let layout = self.env.layout;
        let saved_anchor = self.thread.anchor();
        let top = if saved_anchor.is_empty() {
            stack.base()
        } else {
            saved_anchor.last_java_sp
        };
        let wrapper = word_offset(top, -(CallWrapper::size_words(handles.len()) as isize));
        let entry_fp = word_offset(wrapper, -2);
        let usp = word_offset(entry_fp, -((layout.entry_fixed_words() + params) as isize));
        check_headroom(stack, usp, top)?;

        CallWrapper::write(stack, wrapper, method, saved_anchor, handles)?;
        stack.write(layout.slot(entry_fp, layout.link), 0)?;
        stack.write(layout.slot(entry_fp, layout.return_addr), 0)?;
        stack.write(layout.slot(entry_fp, layout.entry_call_wrapper), wrapper)?;
        // The receiver or first argument sits highest.
        for (j, arg) in args.iter().enumerate() {
            stack.write(word_offset(usp, (params - 1 - j) as isize), *arg)?;
        }
        self.entry = Some(EntryRecord {
            wrapper,
            saved_anchor,
        });
        debug!(
            thread = %self.thread.id(),
            method = callee.name(),
            entry_fp = format_args!("{:#x}", entry_fp),
            "entered managed code"
        );

        let index = self.push_activation(
            callee,
            usp,
            entry_fp,
            self.entry_points.call_stub_return_pc,
            None,
        )?;
        self.activations[index].state.resume(Message::MethodEntry)?;
        self.commit(index)?;
        self.commit_anchor();
        self.thread.set_state(ThreadState::InJava);
        Ok(())
    }

    /// Lay out an activation of `method` whose arguments end at `usp`
    fn push_activation(
        &mut self,
        method: &Method,
        usp: Address,
        caller_fp: Address,
        return_pc: Address,
        prev: Option<usize>,
    ) -> ProtocolResult<usize> {
        let stack = self.env.stack;
        let layout = self.env.layout;
        let params = method.size_of_parameters();
        let words = method.max_locals().max(params);

        let locals = word_offset(usp, params as isize - 1);
        let lowest_local = word_offset(locals, 1 - words as isize);
        let return_slot = word_offset(lowest_local, -1);
        let fp = word_offset(return_slot, -1);
        let monitor_base = layout.slot(fp, layout.monitor_block_bottom);
        let lowest = word_offset(monitor_base, -(method.max_stack() as isize));
        check_headroom(stack, lowest, usp)?;

        for i in params..words {
            stack.write(word_offset(locals, -(i as isize)), 0)?;
        }
        stack.write(return_slot, return_pc)?;
        let put = |offset: isize, value: Word| stack.write(layout.slot(fp, offset), value);
        put(layout.link, caller_fp)?;
        put(layout.interpreter_sender_sp, usp)?;
        put(layout.last_sp, monitor_base)?;
        put(layout.method, method.id())?;
        put(layout.mdx, 0)?;
        put(layout.cache, method.constants())?;
        put(layout.locals, locals)?;
        put(layout.bcx, method.code_base())?;
        put(layout.oop_temp, 0)?;
        put(layout.monitor_block_top, monitor_base)?;

        let shape = ActivationShape {
            method: method.id(),
            bcp: method.code_base(),
            locals,
            max_locals: words,
            constants: method.constants(),
            fp,
            monitor_base,
            max_stack: method.max_stack(),
            prev_link: prev,
        };
        self.activations.push(Activation {
            state: InterpreterState::new(self.thread.id(), shape, layout),
            params,
        });
        trace!(
            method = method.name(),
            depth = self.activations.len(),
            fp = format_args!("{:#x}", fp),
            "pushed activation"
        );
        Ok(self.activations.len() - 1)
    }

    /// Publish activation `index`'s engine registers into its frame slots
    fn commit(
        &self,
        index: usize,
    ) -> ProtocolResult<()> {
        let layout = self.env.layout;
        let state = &self.activations[index].state;
        let frame = self.frame_of(state);
        frame.interpreter_frame_set_bcx(state.bcp())?;
        self.env
            .stack
            .write(layout.slot(state.fp(), layout.mdx), state.mdx())?;
        frame.interpreter_frame_set_monitor_end(state.monitor_end())?;
        frame.interpreter_frame_set_last_sp(state.stack())?;
        self.env
            .stack
            .write(frame.interpreter_frame_oop_temp_addr(), state.oop_temp())?;
        Ok(())
    }

    /// Point the thread anchor at the top activation, or clear it
    fn commit_anchor(&self) {
        match self.top() {
            Some(state) => self.thread.set_last_java_frame(FrameAnchor {
                last_java_sp: state.stack(),
                last_java_fp: state.fp(),
                last_java_pc: self.entry_points.interpreter_return_pc,
            }),
            None => self.thread.clear_last_java_frame(),
        }
    }

    /// Drop the entry frame and give the thread its previous anchor back
    fn finish_entry(&mut self) {
        if let Some(entry) = self.entry.take() {
            if entry.saved_anchor.is_empty() {
                self.thread.clear_last_java_frame();
            } else {
                self.thread.set_last_java_frame(entry.saved_anchor);
            }
            self.thread.set_state(ThreadState::InVm);
            debug!(thread = %self.thread.id(), "left managed code");
        }
    }

    /// Run the top activation's engine once and service its request
    pub fn step(
        &mut self,
        engine: &mut dyn BytecodeEngine,
    ) -> ProtocolResult<StepOutcome> {
        if !self.initialized {
            return Err(ProtocolError::NotInitialized);
        }
        let index = self
            .activations
            .len()
            .checked_sub(1)
            .ok_or(ProtocolError::NoActivation)?;

        let state = &mut self.activations[index].state;
        if !state.msg().is_response() {
            return Err(ProtocolError::NotResumed {
                pending: state.msg(),
            });
        }
        self.thread.set_state(ThreadState::InJava);
        let ran = engine.run(state, self.env.stack);
        self.thread.set_state(ThreadState::InVm);
        ran?;
        if !state.msg().is_request() {
            return Err(ProtocolError::NoRequest {
                method: state.method(),
            });
        }
        let msg = state.msg();
        self.commit(index)?;

        match msg {
            Message::CallMethod | Message::CallMethodHandle => self.service_call(index),
            Message::ReturnFromMethod => self.service_return(index),
            Message::MoreMonitors => self.service_more_monitors(index),
            Message::ThrowingException => self.service_throw(index),
            Message::PoppingFrame => self.service_pop_frame(index),
            Message::DoOsr => self.service_osr(index),
            message => Err(ProtocolError::NotARequest { message }),
        }
    }

    /// Step until the outermost activation returns, throws, or leaves for
    /// compiled code
    pub fn run(
        &mut self,
        engine: &mut dyn BytecodeEngine,
    ) -> ProtocolResult<StepOutcome> {
        loop {
            let outcome = self.step(engine)?;
            if outcome.is_terminal() {
                return Ok(outcome);
            }
        }
    }

    fn service_call(
        &mut self,
        index: usize,
    ) -> ProtocolResult<StepOutcome> {
        let caller = &self.activations[index].state;
        let call = *caller.result().call();
        if !self.env.code.interpreter_contains(call.entry_point) {
            error!(
                callee = call.callee,
                entry = format_args!("{:#x}", call.entry_point),
                "callee entry is not interpreter code"
            );
            return Err(ProtocolError::UnsupportedCallee {
                callee: call.callee,
                entry: call.entry_point,
            });
        }
        let callee = self.resolve(call.callee)?;
        let params = callee.size_of_parameters();
        if caller.stack_depth() < params {
            return Err(ProtocolError::ArgumentCount {
                expected: params,
                found: caller.stack_depth(),
            });
        }
        let (usp, caller_fp) = (caller.stack(), caller.fp());

        let new = self.push_activation(
            callee,
            usp,
            caller_fp,
            self.entry_points.interpreter_return_pc,
            Some(index),
        )?;
        self.activations[new].state.resume(Message::MethodEntry)?;
        self.commit(new)?;
        self.commit_anchor();
        Ok(StepOutcome::Called {
            depth: self.activations.len(),
        })
    }

    fn service_return(
        &mut self,
        index: usize,
    ) -> ProtocolResult<StepOutcome> {
        let stack = self.env.stack;
        let state = &self.activations[index].state;
        let kind = state.result().return_kind();
        let declared = ReturnKind::from(self.resolve(state.method())?.result_type());
        if kind != declared {
            return Err(ProtocolError::ReturnKindMismatch {
                expected: declared,
                found: kind,
            });
        }
        if state.stack_depth() < kind.size() {
            return Err(ProtocolError::ExpressionStackUnderflow {
                method: state.method(),
            });
        }
        let value = (0..kind.size())
            .map(|i| stack.read(word_offset(state.stack(), i as isize)))
            .collect::<Result<SmallVec<[Word; 2]>, _>>()?;

        let popped = self.pop_activation()?;
        match popped.state.prev() {
            None => {
                self.finish_entry();
                Ok(StepOutcome::Returned { kind, value })
            }
            Some(caller) => self.return_into_caller(caller, popped.params, &value),
        }
    }

    /// Replace the caller's arguments with `value` and continue after its invoke
    fn return_into_caller(
        &mut self,
        caller: usize,
        params: usize,
        value: &[Word],
    ) -> ProtocolResult<StepOutcome> {
        let stack = self.env.stack;
        let state = &mut self.activations[caller].state;
        if !state.accepts(Message::MethodResume) {
            return Err(ProtocolError::IncompatibleResume {
                pending: state.msg(),
                resume: Message::MethodResume,
            });
        }
        let call = *state.result().call();
        let tos = word_offset(state.stack(), params as isize - value.len() as isize);
        if tos < state.stack_limit() {
            return Err(ProtocolError::ExpressionStackOverflow {
                method: state.method(),
            });
        }
        for (i, word) in value.iter().enumerate() {
            stack.write(word_offset(tos, i as isize), *word)?;
        }
        state.set_stack(tos);
        state.set_bcp(state.bcp() + usize::from(call.bcp_advance));
        state.resume(Message::MethodResume)?;

        self.commit(caller)?;
        self.commit_anchor();
        Ok(StepOutcome::Resumed {
            depth: self.activations.len(),
            message: Message::MethodResume,
        })
    }

    fn pop_activation(&mut self) -> ProtocolResult<Activation> {
        let popped = self.activations.pop().ok_or(ProtocolError::NoActivation)?;
        trace!(
            method = popped.state.method(),
            depth = self.activations.len(),
            "popped activation"
        );
        Ok(popped)
    }

    fn service_more_monitors(
        &mut self,
        index: usize,
    ) -> ProtocolResult<StepOutcome> {
        let stack = self.env.stack;
        let grow = self.env.layout.monitor_words as isize;
        let state = &mut self.activations[index].state;
        check_headroom(
            stack,
            word_offset(state.stack_limit(), -grow),
            state.stack_limit(),
        )?;
        let monitor = state.grow_monitors(stack)?;
        state.resume(Message::GotMonitors)?;
        trace!(monitor = format_args!("{:#x}", monitor), "grew monitor block");

        self.commit(index)?;
        self.commit_anchor();
        Ok(StepOutcome::Resumed {
            depth: self.activations.len(),
            message: Message::GotMonitors,
        })
    }

    fn service_throw(
        &mut self,
        index: usize,
    ) -> ProtocolResult<StepOutcome> {
        let exception = self.activations[index]
            .state
            .take_exception()
            .ok_or(ProtocolError::MissingException)?;
        let popped = self.pop_activation()?;
        let Some(caller) = popped.state.prev() else {
            self.finish_entry();
            return Ok(StepOutcome::Threw { exception });
        };

        let stack = self.env.stack;
        let state = &mut self.activations[caller].state;
        if !state.accepts(Message::RethrowException) {
            return Err(ProtocolError::IncompatibleResume {
                pending: state.msg(),
                resume: Message::RethrowException,
            });
        }
        state.clear_stack();
        state.push(stack, exception)?;
        state.resume(Message::RethrowException)?;
        debug!(
            exception = format_args!("{:#x}", exception),
            method = state.method(),
            "exception unwound into caller"
        );

        self.commit(caller)?;
        self.commit_anchor();
        Ok(StepOutcome::Resumed {
            depth: self.activations.len(),
            message: Message::RethrowException,
        })
    }

    fn service_pop_frame(
        &mut self,
        index: usize,
    ) -> ProtocolResult<StepOutcome> {
        let caller = self.activations[index]
            .state
            .prev()
            .ok_or(ProtocolError::PopOutermost)?;
        let state = &self.activations[caller].state;
        if !state.accepts(Message::DeoptResume2) {
            return Err(ProtocolError::IncompatibleResume {
                pending: state.msg(),
                resume: Message::DeoptResume2,
            });
        }
        self.pop_activation()?;
        // The caller re-executes its invoke with the arguments still pushed.
        self.activations[caller]
            .state
            .resume(Message::DeoptResume2)?;

        self.commit(caller)?;
        self.commit_anchor();
        Ok(StepOutcome::Resumed {
            depth: self.activations.len(),
            message: Message::DeoptResume2,
        })
    }

    fn service_osr(
        &mut self,
        index: usize,
    ) -> ProtocolResult<StepOutcome> {
        let method = self.resolve(self.activations[index].state.method())?;
        let state = &self.activations[index].state;
        let osr = *state.result().osr();
        let handler = self
            .osr_handler
            .as_deref_mut()
            .ok_or(ProtocolError::OsrUnavailable)?;
        let result = handler.migrate(method, state, &osr)?;

        let popped = self.pop_activation()?;
        self.pending_osr = Some(PendingOsr {
            caller: popped.state.prev(),
            params: popped.params,
            kind: ReturnKind::from(method.result_type()),
        });
        self.commit_anchor();
        debug!(
            method = method.name(),
            nm = format_args!("{:#x}", result.nm),
            "activation migrated to compiled code"
        );
        Ok(StepOutcome::OnStackReplaced { result })
    }

    /// Deliver the result of a method that finished in compiled code after
    /// on-stack replacement.
    pub fn complete_osr(
        &mut self,
        kind: ReturnKind,
        value: &[Word],
    ) -> ProtocolResult<StepOutcome> {
        let pending = self.pending_osr.ok_or(ProtocolError::NoOsrPending)?;
        if kind != pending.kind {
            return Err(ProtocolError::ReturnKindMismatch {
                expected: pending.kind,
                found: kind,
            });
        }
        if value.len() != kind.size() {
            return Err(ProtocolError::ArgumentCount {
                expected: kind.size(),
                found: value.len(),
            });
        }
        self.pending_osr = None;
        match pending.caller {
            None => {
                self.finish_entry();
                Ok(StepOutcome::Returned {
                    kind,
                    value: SmallVec::from_slice(value),
                })
            }
            Some(caller) => self.return_into_caller(caller, pending.params, value),
        }
    }

    /// Rebuild an interpreted activation from a deoptimized compiled one.
    ///
    /// The top activation must be waiting on the call that reached the
    /// compiled code. The new activation resumes at `image.bci`.
    pub fn push_deoptimized(
        &mut self,
        image: &DeoptimizedActivation,
    ) -> ProtocolResult<()> {
        if !self.initialized {
            return Err(ProtocolError::NotInitialized);
        }
        let stack = self.env.stack;
        let method = self.resolve(image.method)?;
        let caller = self
            .activations
            .len()
            .checked_sub(1)
            .ok_or(ProtocolError::NoActivation)?;
        let caller_state = &self.activations[caller].state;
        if !caller_state.msg().is_call() {
            return Err(ProtocolError::IncompatibleResume {
                pending: caller_state.msg(),
                resume: Message::DeoptResume,
            });
        }
        let params = method.size_of_parameters();
        if caller_state.stack_depth() < params {
            return Err(ProtocolError::ArgumentCount {
                expected: params,
                found: caller_state.stack_depth(),
            });
        }
        let bcp = method.bcp_from(image.bci);
        if method.validate_bci_from_bcx(bcp).is_none() {
            return Err(FrameError::InvalidBcx {
                method: method.name().to_string(),
                bcx: bcp,
            }
            .into());
        }
        let (usp, caller_fp) = (caller_state.stack(), caller_state.fp());
        // Compiled code that took over this call is gone now.
        if self
            .pending_osr
            .is_some_and(|pending| pending.caller == Some(caller))
        {
            self.pending_osr = None;
        }

        let index = self.push_activation(
            method,
            usp,
            caller_fp,
            self.entry_points.interpreter_return_pc,
            Some(caller),
        )?;
        let state = &mut self.activations[index].state;
        for (i, word) in image.locals.iter().enumerate() {
            state.set_local(stack, i, *word)?;
        }
        let mut monitors = SmallVec::<[Address; 4]>::new();
        for _ in &image.monitors {
            let grow = self.env.layout.monitor_words as isize;
            check_headroom(
                stack,
                word_offset(state.stack_limit(), -grow),
                state.stack_limit(),
            )?;
            monitors.push(state.grow_monitors(stack)?);
        }
        for word in &image.expressions {
            state.push(stack, *word)?;
        }
        state.set_bcp(bcp);
        state.resume(Message::DeoptResume)?;

        self.commit(index)?;
        let frame = self.frame_of(&self.activations[index].state);
        for (monitor, owner) in monitors.iter().zip(&image.monitors) {
            stack.write(frame.monitor_obj_addr(*monitor), *owner)?;
        }
        self.commit_anchor();
        if let Some(source) = image.source {
            if source.release(self.env.code).is_none() {
                warn!(frame_id = source.frame_id, "no original pc recorded for replaced frame");
            }
        }
        debug!(
            method = method.name(),
            bci = image.bci,
            monitors = image.monitors.len(),
            "rebuilt deoptimized activation"
        );
        Ok(())
    }
}

impl std::fmt::Debug for FrameManager<'_> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("FrameManager")
            .field("thread", &self.thread.id())
            .field("depth", &self.activations.len())
            .field("entry", &self.entry)
            .field("initialized", &self.initialized)
            .field("osr_pending", &self.pending_osr.is_some())
            .finish()
    }
}

/// Fail unless `[lowest, top)` fits above the stack limit
fn check_headroom(
    stack: &ThreadStack,
    lowest: Address,
    top: Address,
) -> ProtocolResult<()> {
    // A wrapped address lands above `top`.
    if lowest < stack.limit() || lowest > top {
        return Err(ProtocolError::StackOverflow {
            needed: lowest,
            limit: stack.limit(),
        });
    }
    Ok(())
}
