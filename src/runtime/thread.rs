//! Managed threads and the safepoint service.
//!
//! A [`ManagedThread`] owns one [`ThreadStack`] and publishes the frame
//! anchor (last Java sp/fp/pc) other threads use to start a walk. The
//! deoptimization handshake state (`must_deopt_id`, `deopt_suspend`) also
//! lives here.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::runtime::layout::call_wrapper;
use crate::runtime::stack::{word_offset, Address, ThreadStack, Word};
use crate::vm::errors::{FrameError, FrameResult};
use crate::vm::frame::{Frame, FrameEnv, OopVisitor};

/// Unique managed thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub usize);

impl ThreadId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl From<usize> for ThreadId {
    fn from(val: usize) -> Self {
        Self(val)
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread state as seen by the safepoint machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    New,
    /// Running managed code.
    InJava,
    /// Running inside the VM.
    InVm,
    /// Running native code.
    InNative,
    /// Returning from native code.
    InNativeTrans,
    /// Blocked at a safepoint or on a lock.
    Blocked,
    /// Waking up from blocked.
    BlockedTrans,
}

impl ThreadState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => ThreadState::New,
            1 => ThreadState::InJava,
            2 => ThreadState::InVm,
            3 => ThreadState::InNative,
            4 => ThreadState::InNativeTrans,
            5 => ThreadState::Blocked,
            6 => ThreadState::BlockedTrans,
            _ => ThreadState::New,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            ThreadState::New => 0,
            ThreadState::InJava => 1,
            ThreadState::InVm => 2,
            ThreadState::InNative => 3,
            ThreadState::InNativeTrans => 4,
            ThreadState::Blocked => 5,
            ThreadState::BlockedTrans => 6,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, ThreadState::InNative | ThreadState::InNativeTrans)
    }
}

/// Last managed frame of a thread that left managed code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameAnchor {
    pub last_java_sp: Address,
    pub last_java_fp: Address,
    pub last_java_pc: Address,
}

impl FrameAnchor {
    pub fn is_empty(&self) -> bool {
        self.last_java_sp == 0
    }
}

/// Managed thread
#[derive(Debug)]
pub struct ManagedThread {
    id: ThreadId,
    owner: std::thread::ThreadId,
    stack: ThreadStack,
    state: AtomicU8,
    last_java_sp: AtomicUsize,
    last_java_fp: AtomicUsize,
    last_java_pc: AtomicUsize,
    must_deopt_id: AtomicUsize,
    deopt_suspend: AtomicBool,
}

impl ManagedThread {
    /// Create a thread owned by the calling OS thread
    pub fn new(
        id: ThreadId,
        stack: ThreadStack,
    ) -> Self {
        Self {
            id,
            owner: std::thread::current().id(),
            stack,
            state: AtomicU8::new(ThreadState::New.as_u8()),
            last_java_sp: AtomicUsize::new(0),
            last_java_fp: AtomicUsize::new(0),
            last_java_pc: AtomicUsize::new(0),
            must_deopt_id: AtomicUsize::new(0),
            deopt_suspend: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn stack(&self) -> &ThreadStack {
        &self.stack
    }

    /// Whether the caller runs on the OS thread that owns this thread
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.owner
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(
        &self,
        state: ThreadState,
    ) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn anchor(&self) -> FrameAnchor {
        FrameAnchor {
            last_java_sp: self.last_java_sp.load(Ordering::Acquire),
            last_java_fp: self.last_java_fp.load(Ordering::Relaxed),
            last_java_pc: self.last_java_pc.load(Ordering::Relaxed),
        }
    }

    /// Publish the last managed frame; sp goes last so readers see a whole anchor
    pub fn set_last_java_frame(
        &self,
        anchor: FrameAnchor,
    ) {
        self.last_java_sp.store(0, Ordering::Release);
        self.last_java_fp.store(anchor.last_java_fp, Ordering::Relaxed);
        self.last_java_pc.store(anchor.last_java_pc, Ordering::Relaxed);
        self.last_java_sp.store(anchor.last_java_sp, Ordering::Release);
    }

    pub fn clear_last_java_frame(&self) {
        self.set_last_java_frame(FrameAnchor::default());
    }

    pub fn has_last_java_frame(&self) -> bool {
        !self.anchor().is_empty()
    }

    /// Top managed frame, built from the anchor
    pub fn last_frame<'a>(
        &self,
        env: FrameEnv<'a>,
    ) -> FrameResult<Frame<'a>> {
        let anchor = self.anchor();
        if anchor.is_empty() {
            return Err(FrameError::NoLastJavaFrame);
        }
        Ok(Frame::new(
            env,
            anchor.last_java_sp,
            anchor.last_java_fp,
            anchor.last_java_pc,
        ))
    }

    /// Frame id the thread must deoptimize itself, 0 if none
    pub fn must_deopt_id(&self) -> Address {
        self.must_deopt_id.load(Ordering::Acquire)
    }

    pub fn set_must_deopt_id(
        &self,
        id: Address,
    ) {
        self.must_deopt_id.store(id, Ordering::Release);
    }

    pub fn is_deopt_suspend(&self) -> bool {
        self.deopt_suspend.load(Ordering::Acquire)
    }

    pub fn set_deopt_suspend(
        &self,
        suspend: bool,
    ) {
        self.deopt_suspend.store(suspend, Ordering::Release);
    }
}

/// View of a call wrapper record on a thread stack.
///
/// The record is written by whoever calls into managed code; the entry
/// frame points at it.
#[derive(Debug, Clone, Copy)]
pub struct CallWrapper<'a> {
    stack: &'a ThreadStack,
    addr: Address,
}

impl<'a> CallWrapper<'a> {
    pub fn at(
        stack: &'a ThreadStack,
        addr: Address,
    ) -> Self {
        Self { stack, addr }
    }

    /// Write a record at `addr` holding `handles`
    pub fn write(
        stack: &'a ThreadStack,
        addr: Address,
        callee_method: Word,
        anchor: FrameAnchor,
        handles: &[Word],
    ) -> FrameResult<Self> {
        let slot = |offset| word_offset(addr, offset);
        stack.write(slot(call_wrapper::CALLEE_METHOD), callee_method)?;
        stack.write(slot(call_wrapper::ANCHOR_SP), anchor.last_java_sp)?;
        stack.write(slot(call_wrapper::ANCHOR_FP), anchor.last_java_fp)?;
        stack.write(slot(call_wrapper::ANCHOR_PC), anchor.last_java_pc)?;
        stack.write(slot(call_wrapper::HANDLE_COUNT), handles.len())?;
        for (i, handle) in handles.iter().enumerate() {
            stack.write(slot(call_wrapper::HANDLES + i as isize), *handle)?;
        }
        Ok(Self { stack, addr })
    }

    /// Words a record with `handles` handles occupies
    pub fn size_words(handles: usize) -> usize {
        call_wrapper::HANDLES as usize + handles
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    fn field(
        &self,
        offset: isize,
    ) -> FrameResult<Word> {
        self.stack.read(word_offset(self.addr, offset))
    }

    pub fn callee_method(&self) -> FrameResult<Word> {
        self.field(call_wrapper::CALLEE_METHOD)
    }

    pub fn anchor(&self) -> FrameResult<FrameAnchor> {
        Ok(FrameAnchor {
            last_java_sp: self.field(call_wrapper::ANCHOR_SP)?,
            last_java_fp: self.field(call_wrapper::ANCHOR_FP)?,
            last_java_pc: self.field(call_wrapper::ANCHOR_PC)?,
        })
    }

    pub fn handle_count(&self) -> FrameResult<usize> {
        self.field(call_wrapper::HANDLE_COUNT)
    }

    /// Visit every handle slot of the record
    pub fn oops_do(
        &self,
        visitor: &mut dyn OopVisitor,
    ) -> FrameResult<()> {
        let count = self.handle_count()?;
        for i in 0..count {
            let slot = word_offset(self.addr, call_wrapper::HANDLES + i as isize);
            // Make sure the slot exists before handing it out.
            self.stack.read(slot)?;
            visitor.do_oop(slot);
        }
        Ok(())
    }
}

/// Global pause queries consumed by deoptimization and root scanning
pub trait SafepointService: Send + Sync {
    fn is_at_safepoint(&self) -> bool;

    /// State of `thread` when the current safepoint began
    fn orig_thread_state(
        &self,
        thread: ThreadId,
    ) -> Option<ThreadState>;
}

/// Minimal safepoint bookkeeping: an active flag and a state snapshot
#[derive(Debug, Default)]
pub struct SafepointSynchronizer {
    active: AtomicBool,
    snapshot: Mutex<HashMap<ThreadId, ThreadState>>,
}

impl SafepointSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a safepoint, recording each thread's current state
    pub fn begin(
        &self,
        threads: &[&ManagedThread],
    ) {
        let mut snapshot = self.snapshot.lock();
        snapshot.clear();
        for thread in threads {
            snapshot.insert(thread.id(), thread.state());
        }
        self.active.store(true, Ordering::Release);
        tracing::debug!(threads = threads.len(), "safepoint begin");
    }

    pub fn end(&self) {
        self.active.store(false, Ordering::Release);
        self.snapshot.lock().clear();
        tracing::debug!("safepoint end");
    }
}

impl SafepointService for SafepointSynchronizer {
    fn is_at_safepoint(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn orig_thread_state(
        &self,
        thread: ThreadId,
    ) -> Option<ThreadState> {
        self.snapshot.lock().get(&thread).copied()
    }
}
