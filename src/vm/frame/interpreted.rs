//! Interpreter frame fields
//!
//! Locals grow downward from the locals pointer. The monitor block sits
//! right below the fixed slots, each monitor being a lock word followed
//! by its owner. The expression stack starts one word below the lowest
//! monitor and also grows downward; its top is `last_sp` while a call is
//! in flight, otherwise the frame's sp.

use crate::runtime::metadata::{is_bci, BasicType, Method};
use crate::runtime::stack::{word_offset, Address, Word, WORD_SIZE};
use crate::vm::errors::{FrameError, FrameResult};

use super::{Frame, FrameKind};

/// Value an interpreted method is returning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpretedResult {
    pub ty: BasicType,
    /// Raw result word; zero for void
    pub value: Word,
}

impl<'a> Frame<'a> {
    fn expect_interpreted(&self) -> FrameResult<()> {
        if !self.is_interpreted_frame() {
            return Err(FrameError::WrongKind {
                expected: FrameKind::Interpreted,
                found: self.kind(),
            });
        }
        Ok(())
    }

    pub fn interpreter_frame_method_word(&self) -> FrameResult<Word> {
        self.at(self.env.layout.method)
    }

    pub fn interpreter_frame_method_addr(&self) -> Address {
        self.addr_at(self.env.layout.method)
    }

    pub fn interpreter_frame_method(&self) -> FrameResult<&'a Method> {
        self.expect_interpreted()?;
        let word = self.interpreter_frame_method_word()?;
        self.env
            .methods
            .resolve(word)
            .ok_or(FrameError::UnknownMethod { method: word })
    }

    pub fn interpreter_frame_set_method(
        &self,
        method: &Method,
    ) -> FrameResult<()> {
        self.put_at(self.env.layout.method, method.id())
    }

    pub fn interpreter_frame_cache_addr(&self) -> Address {
        self.addr_at(self.env.layout.cache)
    }

    pub fn interpreter_frame_oop_temp_addr(&self) -> Address {
        self.addr_at(self.env.layout.oop_temp)
    }

    // bcx / mdx

    pub fn interpreter_frame_bcx(&self) -> FrameResult<Word> {
        self.at(self.env.layout.bcx)
    }

    /// Store `bcx`; when profiling, convert mdx alongside a bci/bcp switch
    pub fn interpreter_frame_set_bcx(
        &self,
        bcx: Word,
    ) -> FrameResult<()> {
        self.expect_interpreted()?;
        if !self.env.diagnostics.profile_interpreter {
            return self.put_at(self.env.layout.bcx, bcx);
        }

        let formerly_bci = is_bci(self.interpreter_frame_bcx()?);
        let is_now_bci = is_bci(bcx);
        let mdx = self.interpreter_frame_mdx()?;
        if mdx == 0 || formerly_bci == is_now_bci {
            return self.put_at(self.env.layout.bcx, bcx);
        }

        // Convert mdx first; neither slot changes if it fails.
        let method = self.interpreter_frame_method()?;
        let data = method
            .method_data()
            .ok_or_else(|| FrameError::MissingMethodData {
                method: method.name().to_string(),
            })?;
        let converted = if formerly_bci {
            // mdi is stored plus one so a valid index never reads as zero.
            data.di_to_dp(mdx - 1)
        } else {
            let di = data.dp_to_di(mdx).ok_or_else(|| FrameError::InvalidBcx {
                method: method.name().to_string(),
                bcx: mdx,
            })?;
            di + 1
        };
        self.put_at(self.env.layout.bcx, bcx)?;
        self.interpreter_frame_set_mdx(converted)
    }

    pub fn interpreter_frame_bci(&self) -> FrameResult<u32> {
        let bcx = self.interpreter_frame_bcx()?;
        let method = self.interpreter_frame_method()?;
        method
            .validate_bci_from_bcx(bcx)
            .ok_or_else(|| FrameError::InvalidBcx {
                method: method.name().to_string(),
                bcx,
            })
    }

    pub fn interpreter_frame_set_bci(
        &self,
        bci: u32,
    ) -> FrameResult<()> {
        debug_assert!(
            !is_bci(self.interpreter_frame_bcx()?),
            "should not set bci during GC"
        );
        let bcp = self.interpreter_frame_method()?.bcp_from(bci);
        self.interpreter_frame_set_bcx(bcp)
    }

    pub fn interpreter_frame_bcp(&self) -> FrameResult<Address> {
        let bcx = self.interpreter_frame_bcx()?;
        if is_bci(bcx) {
            Ok(self.interpreter_frame_method()?.bcp_from(bcx as u32))
        } else {
            Ok(bcx)
        }
    }

    pub fn interpreter_frame_set_bcp(
        &self,
        bcp: Address,
    ) -> FrameResult<()> {
        debug_assert!(
            !is_bci(self.interpreter_frame_bcx()?),
            "should not set bcp during GC"
        );
        self.interpreter_frame_set_bcx(bcp)
    }

    pub fn interpreter_frame_mdx(&self) -> FrameResult<Word> {
        self.at(self.env.layout.mdx)
    }

    pub fn interpreter_frame_set_mdx(
        &self,
        mdx: Word,
    ) -> FrameResult<()> {
        debug_assert!(
            self.env.diagnostics.profile_interpreter,
            "must be profiling interpreter"
        );
        self.put_at(self.env.layout.mdx, mdx)
    }

    /// Profiling data pointer; only meaningful outside GC
    pub fn interpreter_frame_mdp(&self) -> FrameResult<Address> {
        debug_assert!(
            !is_bci(self.interpreter_frame_bcx()?),
            "should not access mdp during GC"
        );
        self.interpreter_frame_mdx()
    }

    pub fn interpreter_frame_set_mdp(
        &self,
        mdp: Address,
    ) -> FrameResult<()> {
        debug_assert!(
            mdp == 0 || !is_bci(self.interpreter_frame_bcx()?),
            "should not set mdp during GC"
        );
        self.interpreter_frame_set_mdx(mdp)
    }

    // Locals

    pub fn interpreter_frame_locals(&self) -> FrameResult<Address> {
        self.at(self.env.layout.locals)
    }

    pub fn interpreter_frame_set_locals(
        &self,
        locals: Address,
    ) -> FrameResult<()> {
        self.put_at(self.env.layout.locals, locals)
    }

    /// Address of local `index`
    pub fn interpreter_frame_local_at(
        &self,
        index: usize,
    ) -> FrameResult<Address> {
        Ok(word_offset(self.interpreter_frame_locals()?, -(index as isize)))
    }

    // Sender sp

    /// Caller's sp before this activation extended it with extra locals
    pub fn interpreter_frame_sender_sp(&self) -> FrameResult<Address> {
        self.at(self.env.layout.interpreter_sender_sp)
    }

    pub fn set_interpreter_frame_sender_sp(
        &self,
        sender_sp: Address,
    ) -> FrameResult<()> {
        self.put_at(self.env.layout.interpreter_sender_sp, sender_sp)
    }

    pub fn interpreter_frame_last_sp(&self) -> FrameResult<Address> {
        self.at(self.env.layout.last_sp)
    }

    pub fn interpreter_frame_set_last_sp(
        &self,
        sp: Address,
    ) -> FrameResult<()> {
        self.put_at(self.env.layout.last_sp, sp)
    }

    // Monitors

    /// One past the highest monitor
    pub fn interpreter_frame_monitor_begin(&self) -> Address {
        self.addr_at(self.env.layout.monitor_block_bottom)
    }

    /// Lowest monitor
    pub fn interpreter_frame_monitor_end(&self) -> FrameResult<Address> {
        let end = self.at(self.env.layout.monitor_block_top)?;
        debug_assert!(self.sp <= end, "monitor end should be above the stack pointer");
        debug_assert!(end < self.fp, "monitor end should be strictly below the frame pointer");
        Ok(end)
    }

    pub fn interpreter_frame_set_monitor_end(
        &self,
        end: Address,
    ) -> FrameResult<()> {
        self.put_at(self.env.layout.monitor_block_top, end)
    }

    pub fn interpreter_frame_monitor_size(&self) -> usize {
        self.env.layout.monitor_words
    }

    pub fn next_monitor_in_interpreter_frame(
        &self,
        current: Address,
    ) -> Address {
        word_offset(current, self.interpreter_frame_monitor_size() as isize)
    }

    pub fn previous_monitor_in_interpreter_frame(
        &self,
        current: Address,
    ) -> Address {
        word_offset(current, -(self.interpreter_frame_monitor_size() as isize))
    }

    /// Monitor addresses, lowest first
    ///
    /// The block must lie between sp and the fixed slots and hold a whole
    /// number of monitors.
    pub fn interpreter_frame_monitors(&self) -> FrameResult<Vec<Address>> {
        let begin = self.interpreter_frame_monitor_begin();
        let end = self.at(self.env.layout.monitor_block_top)?;
        let size = self.interpreter_frame_monitor_size() * WORD_SIZE;
        let block = match begin.checked_sub(end) {
            Some(block) if end >= self.sp && block % size == 0 => block,
            _ => {
                return Err(FrameError::CorruptInterpreterFrame {
                    fp: self.fp,
                    field: "monitor block",
                })
            }
        };
        Ok((0..block / size).map(|i| end + i * size).collect())
    }

    /// Check that `monitor` is a monitor boundary inside the block
    pub fn interpreter_frame_verify_monitor(
        &self,
        monitor: Address,
    ) -> FrameResult<bool> {
        let low = self.interpreter_frame_monitor_end()?;
        let high = self.interpreter_frame_monitor_begin();
        let size = self.interpreter_frame_monitor_size() * WORD_SIZE;
        Ok(monitor >= low
            && monitor < high
            && (high - monitor) % size == 0
            && (monitor - low) % size == 0)
    }

    /// Address of a monitor's owner slot
    pub fn monitor_obj_addr(
        &self,
        monitor: Address,
    ) -> Address {
        word_offset(monitor, 1)
    }

    // Expression stack

    /// Address of the deepest expression stack entry
    pub fn interpreter_frame_expression_stack(&self) -> FrameResult<Address> {
        Ok(word_offset(self.interpreter_frame_monitor_end()?, -1))
    }

    /// Address of the top entry
    pub fn interpreter_frame_tos_address(&self) -> FrameResult<Address> {
        let last_sp = self.interpreter_frame_last_sp()?;
        Ok(if last_sp == 0 { self.sp } else { last_sp })
    }

    /// Entry `offset` counted from the deepest one
    pub fn interpreter_frame_expression_stack_at(
        &self,
        offset: usize,
    ) -> FrameResult<Address> {
        Ok(word_offset(
            self.interpreter_frame_expression_stack()?,
            -(offset as isize),
        ))
    }

    /// Entry `offset` counted from the top
    pub fn interpreter_frame_tos_at(
        &self,
        offset: usize,
    ) -> FrameResult<Address> {
        Ok(word_offset(self.interpreter_frame_tos_address()?, offset as isize))
    }

    /// Number of entries on the expression stack
    pub fn interpreter_frame_expression_stack_size(&self) -> FrameResult<usize> {
        // One word above the base means empty.
        let above_base = word_offset(self.interpreter_frame_expression_stack()?, 1);
        let tos = self.interpreter_frame_tos_address()?;
        above_base
            .checked_sub(tos)
            .map(|bytes| bytes / WORD_SIZE)
            .ok_or(FrameError::CorruptInterpreterFrame {
                fp: self.fp,
                field: "expression stack top",
            })
    }

    /// Value the method is about to return
    pub fn interpreter_frame_result(&self) -> FrameResult<InterpretedResult> {
        let method = self.interpreter_frame_method()?;
        let ty = method.result_type();
        let tos = if method.is_native() {
            // Native results are pushed on the machine stack; floating
            // results sit above the saved integer result.
            match ty {
                BasicType::Float | BasicType::Double => word_offset(self.sp, 2),
                _ => self.sp,
            }
        } else {
            self.interpreter_frame_tos_address()?
        };

        let value = match ty {
            BasicType::Void => 0,
            BasicType::Object | BasicType::Array if method.is_native() => {
                self.at(self.env.layout.oop_temp)?
            }
            _ => self.env.stack.read(tos)?,
        };
        Ok(InterpretedResult { ty, value })
    }
}
