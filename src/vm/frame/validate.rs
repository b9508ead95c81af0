//! Frame validation for readers that do not own the stack
//!
//! Profilers and crash reporters sample threads that keep running. These
//! checks read only through [`ThreadStack::read_within`], never follow
//! more than one speculative link, and answer `false` instead of failing.
//!
//! [`ThreadStack::read_within`]: crate::runtime::stack::ThreadStack::read_within

use crate::runtime::stack::{word_offset, Address, StackBounds, Word, WORD_SIZE};

use super::{Frame, FrameKind};

macro_rules! reject {
    ($frame:expr, $reason:expr) => {{
        tracing::trace!(sp = $frame.sp, pc = $frame.pc, reason = $reason, "unsafe frame");
        return false;
    }};
}

impl<'a> Frame<'a> {
    fn peek(
        &self,
        bounds: StackBounds,
        addr: Address,
    ) -> Option<Word> {
        self.env.stack.read_within(bounds, addr)
    }

    /// Whether this frame is well formed enough to compute its sender
    pub fn is_safe_for_sender(
        &self,
        bounds: StackBounds,
    ) -> bool {
        let sp = self.sp;
        let fp = self.fp;
        let unextended_sp = self.unextended_sp;

        if !bounds.within(sp) {
            reject!(self, "sp outside stack");
        }
        if !(bounds.below_base(unextended_sp) && unextended_sp >= sp) {
            reject!(self, "unextended sp outside stack or below sp");
        }
        // fp is only required by some kinds.
        let fp_safe = bounds.below_base(fp) && fp > sp;

        let Some(cb) = self.cb else {
            // Native frame: the sender is found through fp.
            if !fp_safe {
                reject!(self, "native frame without a usable fp");
            }
            let ret = self.peek(bounds, self.addr_at(self.env.layout.return_addr));
            if ret.unwrap_or(0) == 0 {
                reject!(self, "native frame without a return address");
            }
            return true;
        };

        if !cb.is_frame_complete_at(self.pc)
            && (cb.is_compiled() || cb.is_adapter() || cb.is_runtime_stub())
        {
            reject!(self, "frame not complete at pc");
        }

        if self.kind() == FrameKind::Entry {
            if !fp_safe {
                reject!(self, "entry frame without a usable fp");
            }
            return self.call_wrapper_is_safe(bounds, fp);
        }

        let (sender_sp, sender_pc) = if self.kind() == FrameKind::Interpreted {
            if !fp_safe {
                reject!(self, "interpreted frame without a usable fp");
            }
            let sender_pc = self.peek(bounds, self.addr_at(self.env.layout.return_addr));
            (self.sender_sp(), sender_pc)
        } else {
            // Compiled or stub; fp need not be a frame pointer here.
            let Some(offset) = cb.frame_size().checked_mul(WORD_SIZE) else {
                reject!(self, "frame size overflow");
            };
            let Some(sender_sp) = unextended_sp.checked_add(offset) else {
                reject!(self, "frame size overflow");
            };
            (sender_sp, self.peek(bounds, word_offset(sender_sp, -1)))
        };

        let sender_pc = match sender_pc {
            Some(pc) if pc != 0 => pc,
            _ => reject!(self, "no sender pc"),
        };
        let Some(sender_blob) = self.env.code.find(sender_pc) else {
            reject!(self, "sender pc not in code space");
        };

        if self.env.code.interpreter_contains(sender_pc) {
            let Some(saved_fp) = self.saved_fp_if_safe(bounds, sender_sp) else {
                reject!(self, "interpreted sender has a bad saved fp");
            };
            let sender = Frame::new(self.env, sender_sp, saved_fp, sender_pc);
            return sender.is_interpreted_frame_valid(bounds);
        }

        if !sender_blob.code_contains(sender_pc) {
            reject!(self, "sender pc in blob header");
        }
        if sender_blob.is_adapter() {
            reject!(self, "adapter sender of a code space frame");
        }

        if self.env.code.returns_to_call_stub(sender_pc) {
            let Some(saved_fp) = self.saved_fp_if_safe(bounds, sender_sp) else {
                reject!(self, "entry sender has a bad saved fp");
            };
            let sender = Frame::new(self.env, sender_sp, saved_fp, sender_pc);
            return sender.call_wrapper_is_safe(bounds, saved_fp);
        }

        // A frame returning to a deopt handler is being unpacked.
        if sender_blob
            .as_compiled()
            .is_some_and(|nm| nm.is_deopt_entry(sender_pc) || nm.is_deopt_mh_entry(sender_pc))
        {
            reject!(self, "sender pc is a deopt entry");
        }

        // Every compiled unit counts at least its return address.
        if sender_blob.frame_size() == 0 {
            reject!(self, "sender blob with zero frame size");
        }
        true
    }

    /// Saved fp of a sender whose sp is `sender_sp`, if it lies above it
    fn saved_fp_if_safe(
        &self,
        bounds: StackBounds,
        sender_sp: Address,
    ) -> Option<Address> {
        let saved_fp = self.peek(bounds, word_offset(sender_sp, -self.env.layout.sender_sp))?;
        (bounds.below_base(saved_fp) && saved_fp > sender_sp).then_some(saved_fp)
    }

    fn call_wrapper_is_safe(
        &self,
        bounds: StackBounds,
        fp: Address,
    ) -> bool {
        let wrapper = self.peek(bounds, self.env.layout.slot(fp, self.env.layout.entry_call_wrapper));
        matches!(wrapper, Some(jcw) if bounds.below_base(jcw) && jcw > fp)
    }

    /// Plausibility of an interpreted frame, checked field by field
    pub fn is_interpreted_frame_valid(
        &self,
        bounds: StackBounds,
    ) -> bool {
        let sp = self.sp;
        let fp = self.fp;
        let layout = self.env.layout;

        if fp == 0 || fp % WORD_SIZE != 0 {
            reject!(self, "bad fp");
        }
        if sp == 0 || sp % WORD_SIZE != 0 {
            reject!(self, "bad sp");
        }
        if fp <= sp || layout.slot(fp, layout.monitor_block_top) < sp {
            reject!(self, "fixed slots below sp");
        }

        let Some(method) = self
            .peek(bounds, self.addr_at(layout.method))
            .and_then(|word| self.env.methods.resolve(word))
        else {
            reject!(self, "unknown method");
        };

        if (fp - sp) / WORD_SIZE > layout.interpreter_frame_slack_words + method.max_stack() {
            reject!(self, "frame larger than max_stack allows");
        }

        let bcx = self.peek(bounds, self.addr_at(layout.bcx));
        if bcx.and_then(|bcx| method.validate_bci_from_bcx(bcx)).is_none() {
            reject!(self, "bad bcx");
        }

        match self.peek(bounds, self.addr_at(layout.cache)) {
            Some(cp) if cp != 0 && cp % WORD_SIZE == 0 && cp == method.constants() => {}
            _ => reject!(self, "bad constant pool cache"),
        }

        match self.peek(bounds, self.addr_at(layout.locals)) {
            Some(locals) if bounds.below_base(locals) && locals >= fp => true,
            _ => reject!(self, "locals outside frame"),
        }
    }
}
