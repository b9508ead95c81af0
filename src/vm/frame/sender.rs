//! Sender computation
//!
//! `sender` dispatches on the kind of the current frame, never on the kind
//! of the result. Compiled and interpreted steps go through
//! [`Frame::with_unextended`], which applies the method-handle unextended
//! sp correction and resolves deoptimized return addresses to their
//! original pc.

use crate::runtime::layout::Reg;
use crate::runtime::stack::{word_offset, Address};
use crate::vm::errors::{FrameError, FrameResult};

use super::{Frame, FrameEnv, FrameKind, OopVisitor, RegisterLocationMap};

/// Layout knowledge for method-handle adapter frames
pub trait AdapterResolver: Send + Sync {
    fn ricochet_sender<'a>(
        &self,
        env: FrameEnv<'a>,
        frame: &Frame<'a>,
        map: &mut RegisterLocationMap,
    ) -> FrameResult<Frame<'a>>;

    fn ricochet_oops_do(
        &self,
        frame: &Frame<'_>,
        map: &RegisterLocationMap,
        visitor: &mut dyn OopVisitor,
    ) -> FrameResult<()>;
}

/// Resolver for runtimes without adapter frames
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdapters;

impl AdapterResolver for NoAdapters {
    fn ricochet_sender<'a>(
        &self,
        _env: FrameEnv<'a>,
        frame: &Frame<'a>,
        _map: &mut RegisterLocationMap,
    ) -> FrameResult<Frame<'a>> {
        Err(FrameError::UnsupportedAdapter { pc: frame.pc() })
    }

    fn ricochet_oops_do(
        &self,
        frame: &Frame<'_>,
        _map: &RegisterLocationMap,
        _visitor: &mut dyn OopVisitor,
    ) -> FrameResult<()> {
        Err(FrameError::UnsupportedAdapter { pc: frame.pc() })
    }
}

impl<'a> Frame<'a> {
    /// The caller of this frame.
    ///
    /// Resets `include_argument_oops` on `map`; the step for this frame's
    /// kind decides whether the caller's outgoing arguments are live.
    pub fn sender(
        &self,
        map: &mut RegisterLocationMap,
    ) -> FrameResult<Frame<'a>> {
        map.set_include_argument_oops(false);

        let kind = self.kind();
        let sender = match kind {
            FrameKind::Entry => self.sender_for_entry_frame(map),
            FrameKind::Interpreted => self.sender_for_interpreter_frame(map),
            FrameKind::Ricochet => self.env.adapters.ricochet_sender(self.env, self, map),
            FrameKind::Compiled | FrameKind::NativeWrapper | FrameKind::Stub => {
                self.sender_for_compiled_frame(map)
            }
            // Marshaling code outside the code space.
            FrameKind::Native => Ok(Frame::new(
                self.env,
                self.sender_sp(),
                self.link()?,
                self.sender_pc()?,
            )),
        }?;

        if self.env.diagnostics.trace_frame_walk {
            tracing::trace!(from = %self, to = %sender, "sender");
        }
        Ok(sender)
    }

    fn sender_for_entry_frame(
        &self,
        map: &mut RegisterLocationMap,
    ) -> FrameResult<Frame<'a>> {
        // Skip the native frames between this entry and the last managed frame.
        let anchor = self.entry_frame_call_wrapper()?.anchor()?;
        if anchor.is_empty() {
            return Err(FrameError::PastFirstFrame);
        }
        if anchor.last_java_sp <= self.sp {
            return Err(FrameError::NoProgress {
                sp: self.sp,
                sender_sp: anchor.last_java_sp,
            });
        }
        map.clear();
        let pc = if anchor.last_java_pc != 0 {
            anchor.last_java_pc
        } else {
            self.env.stack.read(word_offset(anchor.last_java_sp, -1))?
        };
        Ok(Frame::new(
            self.env,
            anchor.last_java_sp,
            anchor.last_java_fp,
            pc,
        ))
    }

    fn sender_for_interpreter_frame(
        &self,
        map: &mut RegisterLocationMap,
    ) -> FrameResult<Frame<'a>> {
        // Raw sp includes any extra locals this activation pushed.
        let sender_sp = self.sender_sp();
        let unextended_sp = self.interpreter_frame_sender_sp()?;

        if map.update_map() {
            self.update_map_with_saved_link(map, self.addr_at(self.env.layout.link));
        }

        Ok(Frame::with_unextended(
            self.env,
            sender_sp,
            unextended_sp,
            self.link()?,
            self.sender_pc()?,
        ))
    }

    fn sender_for_compiled_frame(
        &self,
        map: &mut RegisterLocationMap,
    ) -> FrameResult<Frame<'a>> {
        let Some(cb) = self.cb else {
            return Err(FrameError::UnknownSenderPc { pc: self.pc });
        };
        if cb.frame_size() == 0 {
            tracing::error!(blob = cb.name(), pc = self.pc, "compiled frame with zero frame size");
            return Err(FrameError::ZeroFrameSize {
                name: cb.name().to_string(),
            });
        }

        let sender_sp = word_offset(self.unextended_sp, cb.frame_size() as isize);
        let sender_pc = self.env.stack.read(word_offset(sender_sp, -1))?;
        // Saved rbp, which is only a real frame pointer for some callers.
        let saved_fp_addr = word_offset(sender_sp, -self.env.layout.sender_sp);

        if map.update_map() {
            map.set_include_argument_oops(cb.caller_must_gc_arguments());
            if let Some(oop_map) = cb.oop_map_at(self.pc) {
                for (reg, slot) in oop_map.callee_saved() {
                    map.set_location(*reg, word_offset(self.unextended_sp, *slot as isize));
                }
            }
            // The prologue saves rbp without an oop map entry.
            self.update_map_with_saved_link(map, saved_fp_addr);
        }

        let saved_fp = self.env.stack.read(saved_fp_addr)?;
        Ok(Frame::with_unextended(
            self.env, sender_sp, sender_sp, saved_fp, sender_pc,
        ))
    }

    fn update_map_with_saved_link(
        &self,
        map: &mut RegisterLocationMap,
        link_addr: Address,
    ) {
        map.set_location(Reg::RBP, link_addr);
    }

    /// Like `sender`, but skips runtime stub and ricochet frames
    pub fn real_sender(
        &self,
        map: &mut RegisterLocationMap,
    ) -> FrameResult<Frame<'a>> {
        let mut result = self.sender(map)?;
        while result.is_runtime_frame() || result.is_ricochet_frame() {
            result = result.sender(map)?;
        }
        Ok(result)
    }

    /// First interpreted or compiled frame above this one
    pub fn java_sender(&self) -> FrameResult<Frame<'a>> {
        let mut map = RegisterLocationMap::new(false);
        let mut s = self.sender(&mut map)?;
        while !(s.is_java_frame() || s.is_first_frame()?) {
            s = s.sender(&mut map)?;
        }
        if !s.is_java_frame() {
            return Err(FrameError::NotJavaFrame { sp: self.sp });
        }
        Ok(s)
    }

    /// Whether no Java frame exists above this one
    pub fn is_first_java_frame(&self) -> FrameResult<bool> {
        let mut map = RegisterLocationMap::new(false);
        let mut s = self.sender(&mut map)?;
        while !(s.is_java_frame() || s.is_first_frame()?) {
            s = s.sender(&mut map)?;
        }
        s.is_first_frame()
    }

    /// First Java frame at or above this one, for a sampler that does not
    /// own the thread. Every step is validated first; any doubt ends the
    /// search with `None`.
    pub fn profile_find_java_sender_frame(
        &self,
        bounds: crate::runtime::stack::StackBounds,
    ) -> Option<Frame<'a>> {
        if self.is_java_frame() {
            return Some(*self);
        }
        if !self.is_safe_for_sender(bounds) {
            return None;
        }
        let mut map = RegisterLocationMap::new(false);
        let mut current = *self;
        loop {
            let sender = current.sender(&mut map).ok()?;
            if sender.sp <= current.sp
                || !sender.is_safe_for_sender(bounds)
                || sender.is_first_frame().unwrap_or(true)
            {
                return None;
            }
            if sender.is_java_frame() {
                return Some(sender);
            }
            current = sender;
        }
    }
}
