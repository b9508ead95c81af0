//! Per-architecture frame layout
//!
//! Every logical field of an activation (saved link, method, bcx, monitor
//! block and so on) lives at a fixed word offset from the frame pointer.
//! Frame code reaches those fields only through a [`FrameLayout`] table.

use std::fmt;

use smallvec::SmallVec;

use crate::runtime::metadata::{BasicType, Signature};
use crate::runtime::stack::{word_offset, Address, Word};

/// General purpose machine register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u8);

impl Reg {
    pub const RAX: Reg = Reg(0);
    pub const RCX: Reg = Reg(1);
    pub const RDX: Reg = Reg(2);
    pub const RBX: Reg = Reg(3);
    pub const RSP: Reg = Reg(4);
    pub const RBP: Reg = Reg(5);
    pub const RSI: Reg = Reg(6);
    pub const RDI: Reg = Reg(7);
    pub const R8: Reg = Reg(8);
    pub const R9: Reg = Reg(9);
    pub const R10: Reg = Reg(10);
    pub const R11: Reg = Reg(11);
    pub const R12: Reg = Reg(12);
    pub const R13: Reg = Reg(13);
    pub const R14: Reg = Reg(14);
    pub const R15: Reg = Reg(15);

    /// Number of general purpose registers
    pub const COUNT: usize = 16;

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

const REG_NAMES: [&str; Reg::COUNT] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

impl fmt::Display for Reg {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match REG_NAMES.get(self.index()) {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "r?{}", self.0),
        }
    }
}

/// Location of one argument word under a calling convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VMReg {
    /// Integer register
    Reg(Reg),
    /// Floating point register
    Xmm(u8),
    /// Outgoing stack slot, in words from the caller's unextended sp
    Stack(u32),
}

impl VMReg {
    pub fn is_reg(&self) -> bool {
        !matches!(self, VMReg::Stack(_))
    }
}

/// Integer argument registers of the Java calling convention
pub const JAVA_INT_ARG_REGS: [Reg; 6] = [Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9, Reg::RDI];

/// Number of floating point argument registers
pub const JAVA_FLOAT_ARG_REGS: u8 = 8;

/// Register the receiver is passed in
pub const RECEIVER_REG: Reg = JAVA_INT_ARG_REGS[0];

/// Argument locations for a call, one entry per argument slot.
///
/// The second slot of a long or double has no location of its own.
pub fn java_calling_convention(
    signature: &Signature,
    has_receiver: bool,
) -> SmallVec<[Option<VMReg>; 8]> {
    let mut regs = SmallVec::new();
    let mut next_int = 0usize;
    let mut next_float = 0u8;
    let mut next_stack = 0u32;
    let mut stack_slot = || {
        let slot = next_stack;
        next_stack += 1;
        VMReg::Stack(slot)
    };

    let receiver = has_receiver.then_some(BasicType::Object);
    for ty in receiver.into_iter().chain(signature.params().iter().copied()) {
        let loc = match ty {
            BasicType::Float | BasicType::Double => {
                if next_float < JAVA_FLOAT_ARG_REGS {
                    next_float += 1;
                    VMReg::Xmm(next_float - 1)
                } else {
                    stack_slot()
                }
            }
            _ => match JAVA_INT_ARG_REGS.get(next_int) {
                Some(reg) => {
                    next_int += 1;
                    VMReg::Reg(*reg)
                }
                None => stack_slot(),
            },
        };
        regs.push(Some(loc));
        if ty.size() == 2 {
            regs.push(None);
        }
    }
    regs
}

/// Word offsets of activation fields, relative to the frame pointer
/// unless stated otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Saved frame pointer of the caller
    pub link: isize,
    pub return_addr: isize,
    /// Caller's sp, just above the return address
    pub sender_sp: isize,

    // Interpreter frame
    pub interpreter_sender_sp: isize,
    pub last_sp: isize,
    pub method: isize,
    pub mdx: isize,
    pub cache: isize,
    pub locals: isize,
    pub bcx: isize,
    pub oop_temp: isize,
    /// Slot holding the lowest monitor address (the monitor block top)
    pub monitor_block_top: isize,
    /// Highest monitor boundary, exclusive
    pub monitor_block_bottom: isize,
    /// Words per monitor: lock word then owner
    pub monitor_words: usize,
    /// Extra words an interpreter frame may span beyond `max_stack`
    pub interpreter_frame_slack_words: usize,

    // Entry frame
    pub entry_call_wrapper: isize,

    /// Scratch words the engine may spill registers into
    pub scratch_words: usize,
}

impl FrameLayout {
    pub const X86_64: FrameLayout = FrameLayout {
        link: 0,
        return_addr: 1,
        sender_sp: 2,
        interpreter_sender_sp: -1,
        last_sp: -2,
        method: -3,
        mdx: -4,
        cache: -5,
        locals: -6,
        bcx: -7,
        oop_temp: -8,
        monitor_block_top: -9,
        monitor_block_bottom: -9,
        monitor_words: 2,
        interpreter_frame_slack_words: 1024,
        entry_call_wrapper: -6,
        scratch_words: 4,
    };

    /// Address of the field at `offset` words from `fp`
    #[inline]
    pub fn slot(
        &self,
        fp: Address,
        offset: isize,
    ) -> Address {
        word_offset(fp, offset)
    }

    /// Words between fp and the lowest fixed interpreter slot, inclusive
    pub fn interpreter_fixed_words(&self) -> usize {
        (-self.monitor_block_top) as usize
    }

    /// Words an entry frame occupies below its fp
    pub fn entry_fixed_words(&self) -> usize {
        (-self.entry_call_wrapper) as usize
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::X86_64
    }
}

/// Word offsets inside a call wrapper record, upward from its address
pub mod call_wrapper {
    pub const CALLEE_METHOD: isize = 0;
    pub const ANCHOR_SP: isize = 1;
    pub const ANCHOR_FP: isize = 2;
    pub const ANCHOR_PC: isize = 3;
    pub const HANDLE_COUNT: isize = 4;
    pub const HANDLES: isize = 5;
}

/// Per-architecture register spill block owned by an interpreter state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchSaveArea {
    words: SmallVec<[Word; 4]>,
}

impl ScratchSaveArea {
    pub fn for_layout(layout: &FrameLayout) -> Self {
        Self {
            words: SmallVec::from_elem(0, layout.scratch_words),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Spill `value` into slot `index`; returns false if there is no such slot
    pub fn save(
        &mut self,
        index: usize,
        value: Word,
    ) -> bool {
        match self.words.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn restore(
        &self,
        index: usize,
    ) -> Option<Word> {
        self.words.get(index).copied()
    }
}
