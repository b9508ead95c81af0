//! Reference enumeration
//!
//! Visitors receive slot addresses, not values, so a collector can update
//! references in place. Every slot that may hold a reference is visited
//! exactly once per scan.

use crate::runtime::code::CodeBlob;
use crate::runtime::layout::{java_calling_convention, VMReg, RECEIVER_REG};
use crate::runtime::metadata::Signature;
use crate::runtime::stack::{word_offset, Address, Word};
use crate::vm::errors::{FrameError, FrameResult};

use super::{Frame, FrameKind, RegisterLocationMap};

/// Called once per reference slot
pub trait OopVisitor {
    fn do_oop(
        &mut self,
        slot: Address,
    );
}

impl<F: FnMut(Address)> OopVisitor for F {
    fn do_oop(
        &mut self,
        slot: Address,
    ) {
        self(slot)
    }
}

/// Called for compiled code active on a stack
pub trait CodeBlobVisitor {
    fn do_code_blob(
        &mut self,
        blob: &CodeBlob,
    );
}

impl<F: FnMut(&CodeBlob)> CodeBlobVisitor for F {
    fn do_code_blob(
        &mut self,
        blob: &CodeBlob,
    ) {
        self(blob)
    }
}

impl<'a> Frame<'a> {
    /// Visit every reference slot of this frame.
    ///
    /// `map` must be the map produced by the step that reached this frame.
    pub fn oops_do(
        &self,
        visitor: &mut dyn OopVisitor,
        blobs: Option<&mut dyn CodeBlobVisitor>,
        map: &RegisterLocationMap,
    ) -> FrameResult<()> {
        match self.kind() {
            FrameKind::Interpreted => self.oops_interpreted_do(visitor, map),
            FrameKind::Entry => self.oops_entry_do(visitor, map),
            FrameKind::Native => Err(FrameError::UnscannableFrame { kind: FrameKind::Native }),
            _ => self.oops_code_blob_do(visitor, blobs, map),
        }
    }

    pub fn oops_interpreted_do(
        &self,
        visitor: &mut dyn OopVisitor,
        map: &RegisterLocationMap,
    ) -> FrameResult<()> {
        let method = self.interpreter_frame_method()?;
        let bci = self.interpreter_frame_bci()?;

        for monitor in self.interpreter_frame_monitors()? {
            if self.env.diagnostics.verify_monitors && !self.interpreter_frame_verify_monitor(monitor)? {
                tracing::error!(monitor, sp = self.sp, "misaligned monitor in interpreter frame");
                return Err(FrameError::Misaligned { addr: monitor });
            }
            visitor.do_oop(self.monitor_obj_addr(monitor));
        }

        // Fixed part
        visitor.do_oop(self.interpreter_frame_method_addr());
        visitor.do_oop(self.interpreter_frame_cache_addr());
        if method.is_native() {
            visitor.do_oop(self.interpreter_frame_oop_temp_addr());
        }

        // Suspended at an invoke: the outgoing arguments belong to the callee.
        if !method.is_native() {
            if let Some(site) = method.invoke_at(bci) {
                let stack_size = self.interpreter_frame_expression_stack_size()?;
                if map.include_argument_oops() && stack_size > 0 {
                    if site.args_size() <= stack_size {
                        self.oops_interpreted_arguments_do(
                            &site.signature,
                            site.has_receiver,
                            visitor,
                        )?;
                    } else {
                        tracing::debug!(
                            method = method.name(),
                            bci,
                            stack_size,
                            "arguments no longer on the expression stack"
                        );
                    }
                }
            }
        }

        let mask = method
            .mask_for(bci)
            .ok_or_else(|| FrameError::MissingInterpreterOopMap {
                method: method.name().to_string(),
                bci,
            })?;
        let max_locals = if method.is_native() {
            method.size_of_parameters()
        } else {
            method.max_locals()
        };

        for index in mask.oop_locals().filter(|i| *i < max_locals) {
            let addr = self.interpreter_frame_local_at(index)?;
            debug_assert!(addr >= self.sp, "local must be inside the frame");
            visitor.do_oop(addr);
        }

        // After an exception the stack is reset; skip entries above the top.
        let tos = self.interpreter_frame_tos_address()?;
        for index in mask.oop_stack().filter(|i| *i < method.max_stack()) {
            let addr = self.interpreter_frame_expression_stack_at(index)?;
            if addr >= tos {
                visitor.do_oop(addr);
            }
        }
        Ok(())
    }

    /// Visit the references among the outgoing arguments on top of the
    /// expression stack; the receiver is the deepest.
    pub fn oops_interpreted_arguments_do(
        &self,
        signature: &Signature,
        has_receiver: bool,
        visitor: &mut dyn OopVisitor,
    ) -> FrameResult<()> {
        let mut offset = signature.size() + usize::from(has_receiver);
        if has_receiver {
            offset -= 1;
            visitor.do_oop(self.interpreter_frame_tos_at(offset)?);
        }
        for ty in signature.params() {
            offset -= ty.size();
            if ty.is_reference() {
                visitor.do_oop(self.interpreter_frame_tos_at(offset)?);
            }
        }
        Ok(())
    }

    /// Receiver slot of a pending call with `signature`
    pub fn interpreter_callee_receiver_addr(
        &self,
        signature: &Signature,
    ) -> FrameResult<Address> {
        self.interpreter_frame_tos_at(signature.size())
    }

    pub fn oops_entry_do(
        &self,
        visitor: &mut dyn OopVisitor,
        map: &RegisterLocationMap,
    ) -> FrameResult<()> {
        let wrapper = self.entry_frame_call_wrapper()?;
        if map.include_argument_oops() {
            // Nobody else scans the arguments the VM passed in.
            let word = wrapper.callee_method()?;
            let method = self
                .env
                .methods
                .resolve(word)
                .ok_or(FrameError::UnknownMethod { method: word })?;
            let signature = method.signature();
            let mut offset = signature.size() as isize - 1;
            if !method.is_static() {
                visitor.do_oop(self.entry_frame_argument_at((offset + 1) as usize));
            }
            for ty in signature.params() {
                if ty.is_reference() {
                    visitor.do_oop(self.entry_frame_argument_at(offset as usize));
                }
                offset -= ty.size() as isize;
            }
        }
        wrapper.oops_do(visitor)
    }

    pub fn oops_code_blob_do(
        &self,
        visitor: &mut dyn OopVisitor,
        blobs: Option<&mut dyn CodeBlobVisitor>,
        map: &RegisterLocationMap,
    ) -> FrameResult<()> {
        let Some(cb) = self.cb else {
            return Err(FrameError::UnscannableFrame { kind: self.kind() });
        };
        if self.is_ricochet_frame() {
            self.env.adapters.ricochet_oops_do(self, map, visitor)?;
        }
        if cb.oop_maps().is_some() {
            let oop_map = cb.oop_map_at(self.pc).ok_or_else(|| FrameError::MissingOopMap {
                name: cb.name().to_string(),
                pc: self.pc,
            })?;
            for reg in oop_map.oop_registers() {
                let loc = map
                    .location(reg)
                    .ok_or(FrameError::MissingRegisterLocation { reg })?;
                visitor.do_oop(loc);
            }
            for slot in oop_map.oop_slots() {
                visitor.do_oop(word_offset(self.unextended_sp, slot as isize));
            }

            if map.include_argument_oops() {
                self.preserve_callee_argument_oops(map, visitor)?;
            }
        }
        // Lets the collector keep code alive that is active on a stack.
        if let Some(blobs) = blobs {
            blobs.do_code_blob(cb);
        }
        Ok(())
    }

    /// Keep alive the arguments of a call whose callee has not yet built
    /// its own frame.
    fn preserve_callee_argument_oops(
        &self,
        map: &RegisterLocationMap,
        visitor: &mut dyn OopVisitor,
    ) -> FrameResult<()> {
        let Some(nm) = self.compiled_method() else {
            return Ok(());
        };
        if nm.is_native_method() {
            return Ok(());
        }
        if let Some(callee) = nm.call_site_at(self.pc) {
            self.oops_compiled_arguments_do(&callee.signature, callee.has_receiver, map, visitor)?;
        }
        Ok(())
    }

    /// Visit the reference arguments of a compiled call, located with the
    /// Java calling convention.
    pub fn oops_compiled_arguments_do(
        &self,
        signature: &Signature,
        has_receiver: bool,
        map: &RegisterLocationMap,
        visitor: &mut dyn OopVisitor,
    ) -> FrameResult<()> {
        let regs = java_calling_convention(signature, has_receiver);
        let mut offset = 0usize;
        let mut handle = |offset: usize, visitor: &mut dyn OopVisitor| -> FrameResult<()> {
            match regs.get(offset).copied().flatten() {
                Some(reg) => {
                    visitor.do_oop(self.oopmapreg_to_location(reg, map)?);
                    Ok(())
                }
                None => Ok(()),
            }
        };
        if has_receiver {
            handle(offset, visitor)?;
            offset += 1;
        }
        for ty in signature.params() {
            if ty.is_reference() {
                handle(offset, visitor)?;
            }
            offset += ty.size();
        }
        Ok(())
    }

    /// Stack address of an argument location
    pub fn oopmapreg_to_location(
        &self,
        reg: VMReg,
        map: &RegisterLocationMap,
    ) -> FrameResult<Address> {
        match reg {
            // Register arguments were spilled by the callee's stub frame.
            VMReg::Reg(reg) => map
                .location(reg)
                .ok_or(FrameError::MissingRegisterLocation { reg }),
            VMReg::Xmm(_) => Err(FrameError::UnscannableFrame { kind: self.kind() }),
            VMReg::Stack(slot) => Ok(word_offset(self.unextended_sp, slot as isize)),
        }
    }

    /// Receiver of the call this frame is making
    pub fn retrieve_receiver(
        &self,
        map: &RegisterLocationMap,
    ) -> FrameResult<Word> {
        let loc = self.oopmapreg_to_location(VMReg::Reg(RECEIVER_REG), map)?;
        self.env.stack.read(loc)
    }

    /// Report the compiled method this frame runs in
    pub fn nmethods_do(
        &self,
        blobs: &mut dyn CodeBlobVisitor,
    ) {
        if let Some(cb) = self.cb.filter(|cb| cb.is_compiled()) {
            blobs.do_code_blob(cb);
        }
    }

    /// Make an interpreted frame independent of the method's code address
    pub fn gc_prologue(&self) -> FrameResult<()> {
        if self.is_interpreted_frame() {
            let bci = self.interpreter_frame_bci()?;
            self.interpreter_frame_set_bcx(bci as Word)?;
        }
        Ok(())
    }

    /// Undo `gc_prologue`, turning the bci back into a bcp
    pub fn gc_epilogue(&self) -> FrameResult<()> {
        if self.is_interpreted_frame() {
            let bcp = self.interpreter_frame_bcp()?;
            self.interpreter_frame_set_bcx(bcp)?;
        }
        Ok(())
    }
}
