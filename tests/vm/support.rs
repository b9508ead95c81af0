//! Shared runtime for the integration tests
//!
//! One interpreter blob, one call stub and a recursive `sum` method driven by
//! a closure engine.

use vmframe::interpreter::{
    CallMessage, EntryPoints, FrameManager, InterpreterState, Message, ProtocolError,
    ProtocolResult, ReturnKind,
};
use vmframe::runtime::code::{BlobKind, CodeBlob, CodeCache};
use vmframe::runtime::metadata::{InterpreterOopMap, Method, MethodTable, Signature, SlotKind};
use vmframe::runtime::stack::{Address, ThreadStack, Word};
use vmframe::runtime::thread::{ManagedThread, ThreadId};
use vmframe::vm::frame::FrameEnv;

pub const STACK_BASE: Address = 0x100_0000;
pub const STACK_WORDS: usize = 4096;

pub const INTERP_START: Address = 0x1000;
pub const INTERP_RETURN_PC: Address = 0x1100;
pub const INTERP_ENTRY: Address = 0x1200;
pub const CALL_STUB_START: Address = 0x3000;
pub const CALL_STUB_RETURN_PC: Address = 0x3040;

pub const ENTRY_POINTS: EntryPoints = EntryPoints {
    interpreter_return_pc: INTERP_RETURN_PC,
    call_stub_return_pc: CALL_STUB_RETURN_PC,
};

/// `static int sum(int n)`
pub const SUM: Word = 0x50_0000;
pub const SUM_CODE: Address = 0x60_0000;

pub struct Runtime {
    pub code: CodeCache,
    pub methods: MethodTable,
    pub thread: ManagedThread,
}

impl Runtime {
    pub fn new(id: usize) -> Self {
        let mut code = CodeCache::new();
        code.insert(CodeBlob::new("interpreter", INTERP_START, 0x2000, BlobKind::Interpreter))
            .unwrap();
        code.insert(CodeBlob::new(
            "call_stub",
            CALL_STUB_START,
            0x3100,
            BlobKind::CallStub {
                return_pc: CALL_STUB_RETURN_PC,
            },
        ))
        .unwrap();

        let mut methods = MethodTable::new();
        methods.insert(
            Method::builder(SUM, "Sum.sum", Signature::parse("(I)I").unwrap())
                .code(SUM_CODE, 32)
                .max_locals(1)
                .max_stack(2)
                .is_static()
                .constants(0x70_0000)
                .oop_map(0, InterpreterOopMap::new(&[SlotKind::Value], &[SlotKind::Value]))
                .build(),
        );

        Self {
            code,
            methods,
            thread: ManagedThread::new(ThreadId(id), ThreadStack::new(STACK_BASE, STACK_WORDS)),
        }
    }

    pub fn env(&self) -> FrameEnv<'_> {
        FrameEnv::new(self.thread.stack(), &self.code, &self.methods)
    }

    pub fn manager(&self) -> FrameManager<'_> {
        let mut manager = FrameManager::new(&self.thread, self.env(), ENTRY_POINTS);
        manager
            .initialize(&mut |_: &mut InterpreterState, _: &ThreadStack| Ok(()))
            .unwrap();
        manager
    }
}

/// `sum(n) = n == 0 ? 0 : n + sum(n - 1)`
pub fn sum_engine(
    state: &mut InterpreterState,
    stack: &ThreadStack,
) -> ProtocolResult<()> {
    match state.msg() {
        Message::MethodEntry => {
            let n = state.local(stack, 0)?;
            if n == 0 {
                state.push(stack, 0)?;
                return state.request_return(ReturnKind::Int);
            }
            state.push(stack, n - 1)?;
            state.request_call(CallMessage {
                callee: SUM,
                entry_point: INTERP_ENTRY,
                bcp_advance: 3,
            })
        }
        Message::MethodResume => {
            let partial = state.pop(stack)?;
            let n = state.local(stack, 0)?;
            state.push(stack, partial + n)?;
            state.request_return(ReturnKind::Int)
        }
        msg => Err(ProtocolError::Engine(format!("unexpected {}", msg))),
    }
}
