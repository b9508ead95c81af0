//! Deoptimization
//!
//! A compiled frame is sent back to the interpreter by overwriting the
//! return address its callee will use with the compiled unit's deopt
//! handler. The original pc goes into the unit's side table, keyed by
//! frame id, so walkers keep resolving the frame with the pc it really
//! had.
//!
//! On platforms that must patch at a safepoint, a thread that was in
//! native code when the pause began may be about to return into exactly
//! the frame being patched. That thread is marked instead and patches
//! the frame itself later through [`Deoptimizer::process_deferred`].

use crate::runtime::code::{CodeBlob, CodeRegistry};
use crate::runtime::stack::{word_offset, Address};
use crate::runtime::thread::{ManagedThread, SafepointService};
use crate::util::config::PlatformConfig;
use crate::vm::errors::{FrameError, FrameResult};

use super::{DeoptState, Frame, FrameEnv, FrameKind, RegisterLocationMap, StackFrameStream};

/// What a deoptimization request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptOutcome {
    /// Return address now points at `handler`
    Patched { handler: Address },
    /// Owning thread will deoptimize the frame itself
    Deferred,
    /// Same frame is already marked for deferred deoptimization
    AlreadyPending,
    AlreadyDeoptimized,
}

/// Deoptimized compiled frame an interpreter image was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptSource {
    pub frame_id: Address,
    /// Any pc inside the compiled unit
    pub pc: Address,
}

impl DeoptSource {
    pub fn of(frame: &Frame<'_>) -> Self {
        Self {
            frame_id: frame.id(),
            pc: frame.pc(),
        }
    }

    /// Drop the unit's record of the frame's original pc once the frame
    /// has been replaced. Returns the pc that was recorded.
    pub fn release(
        &self,
        code: &dyn CodeRegistry,
    ) -> Option<Address> {
        code.find(self.pc)
            .and_then(CodeBlob::as_compiled)
            .and_then(|nm| nm.forget_original_pc(self.frame_id))
    }
}

/// Deoptimization coordinator
pub struct Deoptimizer<'s> {
    safepoints: &'s dyn SafepointService,
    needs_deopt_suspend: bool,
}

impl<'s> Deoptimizer<'s> {
    pub fn new(
        safepoints: &'s dyn SafepointService,
        platform: &PlatformConfig,
    ) -> Self {
        Self {
            safepoints,
            needs_deopt_suspend: platform.needs_deopt_suspend,
        }
    }

    /// Redirect `frame` to its deopt handler.
    ///
    /// Idempotent: a frame that is already deoptimized keeps its single
    /// recorded original pc.
    pub fn deoptimize(
        &self,
        frame: &mut Frame<'_>,
        thread: &ManagedThread,
    ) -> FrameResult<DeoptOutcome> {
        if !frame.is_compiled_frame() {
            return Err(FrameError::WrongKind {
                expected: FrameKind::Compiled,
                found: frame.kind(),
            });
        }
        if frame.deopt_state == DeoptState::Deoptimized {
            return Ok(DeoptOutcome::AlreadyDeoptimized);
        }
        if !frame.can_be_deoptimized() {
            return Err(FrameError::NotDeoptimizable { sp: frame.sp });
        }
        let Some(nm) = frame.compiled_method() else {
            return Err(FrameError::NotDeoptimizable { sp: frame.sp });
        };

        if self.needs_deopt_suspend && !thread.is_current() {
            if !self.safepoints.is_at_safepoint() {
                return Err(FrameError::NotAtSafepoint);
            }
            if thread.is_deopt_suspend() && thread.must_deopt_id() == frame.id() {
                return Ok(DeoptOutcome::AlreadyPending);
            }
            if self.returning_from_native_into(frame, thread)? {
                thread.set_must_deopt_id(frame.id());
                thread.set_deopt_suspend(true);
                tracing::debug!(
                    thread = %thread.id(),
                    frame_id = frame.id(),
                    "deoptimization deferred to the owning thread"
                );
                return Ok(DeoptOutcome::Deferred);
            }
        }

        let handler = if nm.is_method_handle_return(frame.pc) {
            nm.deopt_mh_handler()
        } else {
            nm.deopt_handler()
        };
        nm.set_original_pc(frame.id(), frame.pc);
        frame.patch_pc(handler)?;
        Ok(DeoptOutcome::Patched { handler })
    }

    /// Whether `thread` sat in native code when the pause began and its
    /// next return lands in `frame`
    fn returning_from_native_into(
        &self,
        frame: &Frame<'_>,
        thread: &ManagedThread,
    ) -> FrameResult<bool> {
        let was_native = self
            .safepoints
            .orig_thread_state(thread.id())
            .is_some_and(|state| state.is_native());
        if !was_native || !thread.has_last_java_frame() {
            return Ok(false);
        }
        let last = thread.last_frame(frame.env)?;
        let mut map = RegisterLocationMap::new(false);
        Ok(last.sender(&mut map)?.id() == frame.id())
    }

    /// Carry out a deferred request on the thread that owns `thread`.
    ///
    /// Returns `None` when nothing was pending or the marked frame is gone.
    pub fn process_deferred(
        &self,
        thread: &ManagedThread,
        env: FrameEnv<'_>,
    ) -> FrameResult<Option<DeoptOutcome>> {
        if !thread.is_deopt_suspend() {
            return Ok(None);
        }
        debug_assert!(thread.is_current(), "deferred deoptimization runs on the owning thread");
        let target = thread.must_deopt_id();

        let mut outcome = None;
        for walked in StackFrameStream::new(thread, env, false)? {
            let mut frame = walked?.frame;
            if frame.id() == target && frame.is_compiled_frame() {
                outcome = Some(self.deoptimize(&mut frame, thread)?);
                break;
            }
        }
        if outcome.is_none() {
            tracing::warn!(thread = %thread.id(), frame_id = target, "marked frame no longer on stack");
        }
        thread.set_must_deopt_id(0);
        thread.set_deopt_suspend(false);
        Ok(outcome)
    }
}

impl<'a> Frame<'a> {
    /// Overwrite the return address this frame resumes at.
    ///
    /// When `pc` is a deopt handler whose original pc was recorded, the
    /// view keeps the original pc and becomes deoptimized.
    pub fn patch_pc(
        &mut self,
        pc: Address,
    ) -> FrameResult<()> {
        let pc_addr = word_offset(self.sp, -1);
        if self.env.diagnostics.trace_pc_patching {
            tracing::info!(
                pc_addr,
                old = self.env.stack.read(pc_addr)?,
                new = pc,
                "patch_pc"
            );
        } else {
            tracing::debug!(pc_addr, new = pc, "patch_pc");
        }
        self.env.stack.write(pc_addr, pc)?;

        self.cb = self.env.code.find(pc);
        let original = self
            .cb
            .and_then(CodeBlob::as_compiled)
            .filter(|nm| nm.is_deopt_pc(pc))
            .and_then(|nm| nm.original_pc(self.id()));
        match original {
            Some(_) => self.deopt_state = DeoptState::Deoptimized,
            None => {
                self.deopt_state = DeoptState::NotDeoptimized;
                self.pc = pc;
            }
        }
        Ok(())
    }
}
