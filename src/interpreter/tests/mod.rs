//! 解释器协议单元测试
//!
//! 用闭包充当字节码引擎，驱动 FrameManager 在模拟线程栈上压入、
//! 恢复和弹出解释帧，并用帧层 API 检查物理布局。

use smallvec::smallvec;

use super::state::ActivationShape;
use super::*;
use crate::runtime::code::{BlobKind, CodeBlob, CodeCache, CodeRegistry, CompiledMethod};
use crate::runtime::gc::{RootScanner, ScanStats};
use crate::runtime::layout::{call_wrapper, FrameLayout};
use crate::runtime::metadata::{
    BasicType, InterpreterOopMap, Method, MethodTable, Signature, SlotKind,
};
use crate::runtime::stack::ThreadStack;
use crate::runtime::thread::{
    CallWrapper, FrameAnchor, ManagedThread, SafepointSynchronizer, ThreadId, ThreadState,
};
use crate::util::config::{DiagnosticsConfig, GcConfig};
use crate::vm::frame::{DeoptSource, FrameEnv, FrameKind, StackFrameStream};

const STACK_BASE: Address = 0x20_0000;
const STACK_WORDS: usize = 1024;

const INTERP_START: Address = 0x1000;
const INTERP_RETURN_PC: Address = 0x1100;
const INTERP_ENTRY: Address = 0x1200;
const CALL_STUB_START: Address = 0x3000;
const CALL_STUB_RETURN_PC: Address = 0x3040;
const COMPILED_ENTRY: Address = 0x4000;

const ENTRY_POINTS: EntryPoints = EntryPoints {
    interpreter_return_pc: INTERP_RETURN_PC,
    call_stub_return_pc: CALL_STUB_RETURN_PC,
};

// 方法：CALLER 调用可配置的被调者
const CALLER: Word = 0x50_0000;
const CALLEE: Word = 0x50_0040;
const THROWER: Word = 0x50_0080;
const POPPER: Word = 0x50_00C0;
const OSR_M: Word = 0x50_0100;
const WRONG_KIND: Word = 0x50_0140;
const IDLE: Word = 0x50_0180;
const LOCKER: Word = 0x50_01C0;

// 被逆优化的编译版本
const HOT_START: Address = 0x7000;
const HOT_DEOPT: Address = 0x70C0;
const HOT_FRAME_ID: Address = 0x1F_F000;

const EXCEPTION: Word = 0xE000_0040;
const OSR_BUFFER: Address = 0x9000;
const OSR_RESULT: OsrResult = OsrResult {
    nm: COMPILED_ENTRY,
    return_addr: 0x4080,
};

fn code_of(method: Word) -> Address {
    0x60_0000 + (method - CALLER) * 4
}

/// 静态方法 `(I)I`，bci 0 处有 oop map
fn int_method(
    id: Word,
    name: &str,
    max_locals: usize,
    max_stack: usize,
) -> Method {
    let locals = vec![SlotKind::Value; max_locals];
    Method::builder(id, name, Signature::parse("(I)I").unwrap())
        .code(code_of(id), 16)
        .max_locals(max_locals)
        .max_stack(max_stack)
        .is_static()
        .constants(id + 0x10_0000)
        .oop_map(0, InterpreterOopMap::new(&locals, &[SlotKind::Value]))
        .build()
}

struct Harness {
    code: CodeCache,
    methods: MethodTable,
    thread: ManagedThread,
}

impl Harness {
    fn new() -> Self {
        Self::with_words(STACK_WORDS)
    }

    fn with_words(words: usize) -> Self {
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
        methods.insert(int_method(CALLER, "Main.run", 2, 4));
        methods.insert(int_method(CALLEE, "Main.twice", 1, 2));
        methods.insert(int_method(THROWER, "Main.fail", 1, 2));
        methods.insert(int_method(POPPER, "Main.popped", 1, 2));
        methods.insert(int_method(OSR_M, "Main.hot", 1, 2));
        methods.insert(int_method(WRONG_KIND, "Main.wrong", 1, 2));
        methods.insert(int_method(IDLE, "Main.idle", 1, 2));
        methods.insert(
            Method::builder(LOCKER, "Main.locked", Signature::parse("()V").unwrap())
                .code(code_of(LOCKER), 16)
                .max_stack(2)
                .is_static()
                .constants(LOCKER + 0x10_0000)
                .build(),
        );

        Self {
            code,
            methods,
            thread: ManagedThread::new(ThreadId(3), ThreadStack::new(STACK_BASE, words)),
        }
    }

    fn env(&self) -> FrameEnv<'_> {
        FrameEnv::new(self.thread.stack(), &self.code, &self.methods)
    }

    fn manager(&self) -> FrameManager<'_> {
        let mut manager = FrameManager::new(&self.thread, self.env(), ENTRY_POINTS);
        manager.initialize(&mut idle).unwrap();
        manager
    }

    fn stack(&self) -> &ThreadStack {
        self.thread.stack()
    }
}

fn idle(
    _state: &mut InterpreterState,
    _stack: &ThreadStack,
) -> ProtocolResult<()> {
    Ok(())
}

fn call(callee: Word) -> CallMessage {
    CallMessage {
        callee,
        entry_point: INTERP_ENTRY,
        bcp_advance: 3,
    }
}

/// CALLER 计算 `callee(x) + 1`；各被调者按方法区分行为
fn program(call: CallMessage) -> impl FnMut(&mut InterpreterState, &ThreadStack) -> ProtocolResult<()> {
    move |state: &mut InterpreterState, stack: &ThreadStack| match (state.method(), state.msg()) {
        (CALLER, Message::MethodEntry) => {
            let x = state.local(stack, 0)?;
            state.push(stack, x)?;
            state.request_call(call)
        }
        (CALLER, Message::MethodResume) => {
            let r = state.pop(stack)?;
            state.push(stack, r + 1)?;
            state.request_return(ReturnKind::Int)
        }
        (CALLER, Message::RethrowException) => {
            let exception = state.pop(stack)?;
            state.request_throw(exception)
        }
        // 重新执行 invoke，参数仍在栈上
        (CALLER, Message::DeoptResume2) => state.request_call(self::call(CALLEE)),
        (CALLEE, Message::MethodEntry) => {
            let x = state.local(stack, 0)?;
            state.push(stack, x * 2)?;
            state.request_return(ReturnKind::Int)
        }
        (OSR_M, Message::DeoptResume) => {
            let v = state.pop(stack)?;
            let x = state.local(stack, 0)?;
            state.push(stack, v + x)?;
            state.request_return(ReturnKind::Int)
        }
        (THROWER, Message::MethodEntry) => state.request_throw(EXCEPTION),
        (POPPER, Message::MethodEntry) => state.request_pop_frame(),
        (OSR_M, Message::MethodEntry) => state.request_osr(OsrMessage {
            buffer: OSR_BUFFER,
            entry: COMPILED_ENTRY,
        }),
        (WRONG_KIND, Message::MethodEntry) => state.request_return(ReturnKind::Void),
        (IDLE, Message::MethodEntry) => Ok(()),
        (LOCKER, Message::MethodEntry) => {
            state.push(stack, 1)?;
            state.push(stack, 2)?;
            state.request_more_monitors()
        }
        (LOCKER, Message::GotMonitors) => {
            state.pop(stack)?;
            state.pop(stack)?;
            state.request_return(ReturnKind::Void)
        }
        (method, msg) => Err(ProtocolError::Engine(format!(
            "unexpected {} in {:#x}",
            msg, method
        ))),
    }
}

struct FixedOsr;

impl OsrHandler for FixedOsr {
    fn migrate(
        &mut self,
        method: &Method,
        state: &InterpreterState,
        osr: &OsrMessage,
    ) -> ProtocolResult<OsrResult> {
        assert_eq!(method.id(), OSR_M);
        assert_eq!(state.msg(), Message::DoOsr);
        assert_eq!(osr.buffer, OSR_BUFFER);
        Ok(OSR_RESULT)
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;

    #[test]
    fn test_directions() {
        assert_eq!(Message::NoRequest.direction(), Direction::None);
        assert!(Message::CallMethod.is_request());
        assert!(Message::DoOsr.is_request());
        assert!(Message::MethodResume.is_response());
        assert!(Message::Initialize.is_response());
        assert!(!Message::GotMonitors.is_request());
        assert!(Message::CallMethodHandle.is_call());
        assert_eq!(Message::ReturnFromMethod.to_string(), "return_from_method");
    }

    #[test]
    fn test_return_kinds() {
        assert_eq!(ReturnKind::from(BasicType::Long).size(), 2);
        assert_eq!(ReturnKind::from(BasicType::Boolean), ReturnKind::Int);
        assert_eq!(ReturnKind::from(BasicType::Array), ReturnKind::Object);
        assert_eq!(ReturnKind::Void.size(), 0);
        assert_eq!(ReturnKind::Double.to_string(), "dreturn");
    }

    #[test]
    #[should_panic(expected = "not a call")]
    fn test_empty_payload_is_not_a_call() {
        FrameManagerMessage::Empty.call();
    }

    #[test]
    #[should_panic(expected = "holds call, not a return kind")]
    fn test_call_payload_is_not_a_return() {
        FrameManagerMessage::Call(call(CALLEE)).return_kind();
    }

    #[test]
    fn test_payload_accessors() {
        let osr = OsrMessage {
            buffer: OSR_BUFFER,
            entry: COMPILED_ENTRY,
        };
        assert_eq!(FrameManagerMessage::Osr(osr).osr(), &osr);
        assert_eq!(
            FrameManagerMessage::OsrResult(OSR_RESULT).osr_result(),
            &OSR_RESULT
        );
        assert_eq!(FrameManagerMessage::default(), FrameManagerMessage::Empty);
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    fn bare_state(
        stack: &ThreadStack,
        max_stack: usize,
    ) -> InterpreterState {
        let fp = stack.base() - 0x100;
        let shape = ActivationShape {
            method: CALLER,
            bcp: code_of(CALLER),
            locals: fp + 0x20,
            max_locals: 2,
            constants: CALLER + 0x10_0000,
            fp,
            monitor_base: fp - 72,
            max_stack,
            prev_link: None,
        };
        InterpreterState::new(ThreadId(9), shape, &FrameLayout::X86_64)
    }

    #[test]
    fn test_second_request_rejected() {
        let stack = ThreadStack::new(STACK_BASE, 64);
        let mut state = bare_state(&stack, 2);
        state.request_more_monitors().unwrap();
        let err = state.request_return(ReturnKind::Int).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::RequestPending {
                pending: Message::MoreMonitors,
                requested: Message::ReturnFromMethod,
            }
        );
    }

    #[test]
    fn test_resume_compatibility() {
        let stack = ThreadStack::new(STACK_BASE, 64);
        let mut state = bare_state(&stack, 2);
        state.request_call(call(CALLEE)).unwrap();
        assert!(state.accepts(Message::MethodResume));
        assert!(state.accepts(Message::DeoptResume2));
        assert!(!state.accepts(Message::GotMonitors));
        assert!(!state.accepts(Message::MethodEntry));

        assert_eq!(
            state.resume(Message::GotMonitors).unwrap_err(),
            ProtocolError::IncompatibleResume {
                pending: Message::CallMethod,
                resume: Message::GotMonitors,
            }
        );
        assert_eq!(
            state.resume(Message::CallMethod).unwrap_err(),
            ProtocolError::NotAResponse {
                message: Message::CallMethod
            }
        );

        state.resume(Message::RethrowException).unwrap();
        assert_eq!(state.msg(), Message::RethrowException);
        assert_eq!(state.result(), &FrameManagerMessage::Empty);
    }

    #[test]
    fn test_expression_stack_bounds() {
        let stack = ThreadStack::new(STACK_BASE, 64);
        let mut state = bare_state(&stack, 2);
        assert_eq!(state.stack_depth(), 0);
        state.push(&stack, 1).unwrap();
        state.push(&stack, 2).unwrap();
        assert_eq!(
            state.push(&stack, 3).unwrap_err(),
            ProtocolError::ExpressionStackOverflow { method: CALLER }
        );
        assert_eq!(state.peek(&stack, 1).unwrap(), 1);
        assert_eq!(state.pop(&stack).unwrap(), 2);
        assert_eq!(state.pop(&stack).unwrap(), 1);
        assert_eq!(
            state.pop(&stack).unwrap_err(),
            ProtocolError::ExpressionStackUnderflow { method: CALLER }
        );
    }

    #[test]
    fn test_locals() {
        let stack = ThreadStack::new(STACK_BASE, 64);
        let mut state = bare_state(&stack, 2);
        state.set_local(&stack, 1, 9).unwrap();
        assert_eq!(state.local(&stack, 1).unwrap(), 9);
        assert_eq!(stack.read(state.locals() - 8).unwrap(), 9);
        assert_eq!(
            state.local(&stack, 2).unwrap_err(),
            ProtocolError::LocalOutOfRange {
                method: CALLER,
                index: 2
            }
        );
    }

    #[test]
    fn test_grow_monitors_keeps_expressions() {
        let stack = ThreadStack::new(STACK_BASE, 64);
        let mut state = bare_state(&stack, 4);
        state.push(&stack, 1).unwrap();
        state.push(&stack, 2).unwrap();
        let limit = state.stack_limit();

        let monitor = state.grow_monitors(&stack).unwrap();
        assert_eq!(monitor, state.monitor_end());
        assert_eq!(state.monitor_count(), 1);
        assert_eq!(state.monitor_at(0), Some(monitor));
        assert_eq!(state.monitor_at(1), None);
        assert_eq!(state.stack_limit(), limit - 16);
        assert_eq!(state.stack_depth(), 2);
        assert_eq!(state.peek(&stack, 0).unwrap(), 2);
        assert_eq!(state.peek(&stack, 1).unwrap(), 1);
    }
}

#[cfg(test)]
mod manager_tests {
    use super::*;

    #[test]
    fn test_requires_initialize() {
        let h = Harness::new();
        let mut manager = FrameManager::new(&h.thread, h.env(), ENTRY_POINTS);
        assert_eq!(
            manager.start(CALLER, &[5], &[]).unwrap_err(),
            ProtocolError::NotInitialized
        );
        assert_eq!(
            manager.step(&mut idle).unwrap_err(),
            ProtocolError::NotInitialized
        );
    }

    #[test]
    fn test_initialize_must_not_request() {
        let h = Harness::new();
        let mut manager = FrameManager::new(&h.thread, h.env(), ENTRY_POINTS);
        let mut engine = |state: &mut InterpreterState, _: &ThreadStack| state.request_more_monitors();
        assert_eq!(
            manager.initialize(&mut engine).unwrap_err(),
            ProtocolError::UnexpectedRequest {
                message: Message::MoreMonitors
            }
        );
        assert!(!manager.is_initialized());
    }

    #[test]
    fn test_call_and_return() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[]).unwrap();
        assert_eq!(manager.depth(), 1);
        assert_eq!(h.thread.state(), ThreadState::InJava);

        let outcome = manager.run(&mut program(call(CALLEE))).unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Returned {
                kind: ReturnKind::Int,
                value: smallvec![11],
            }
        );
        assert_eq!(manager.depth(), 0);
        assert!(!h.thread.has_last_java_frame());
        assert_eq!(h.thread.state(), ThreadState::InVm);
    }

    #[test]
    fn test_argument_count_checked() {
        let h = Harness::new();
        let mut manager = h.manager();
        assert_eq!(
            manager.start(CALLER, &[], &[]).unwrap_err(),
            ProtocolError::ArgumentCount {
                expected: 1,
                found: 0
            }
        );
        manager.start(CALLER, &[5], &[]).unwrap();
        assert_eq!(
            manager.start(CALLER, &[5], &[]).unwrap_err(),
            ProtocolError::AlreadyStarted
        );
    }

    #[test]
    fn test_paused_chain_is_walkable() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[0xA000_0010]).unwrap();
        let outcome = manager.step(&mut program(call(CALLEE))).unwrap();
        assert_eq!(outcome, StepOutcome::Called { depth: 2 });

        let methods: Vec<Word> = manager.chain().map(|s| s.method()).collect();
        assert_eq!(methods, vec![CALLEE, CALLER]);

        let frames = StackFrameStream::new(&h.thread, h.env(), false)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let kinds: Vec<FrameKind> = frames.iter().map(|w| w.frame.kind()).collect();
        assert_eq!(
            kinds,
            vec![FrameKind::Interpreted, FrameKind::Interpreted, FrameKind::Entry]
        );

        let callee = &frames[0].frame;
        let caller = &frames[1].frame;
        let caller_state = manager.state(0).unwrap();
        assert_eq!(callee.interpreter_frame_method().unwrap().id(), CALLEE);
        assert_eq!(callee.interpreter_frame_locals().unwrap(), caller_state.stack());
        assert_eq!(caller.fp(), caller_state.fp());
        assert_eq!(caller.interpreter_frame_bcp().unwrap(), code_of(CALLER));
        assert_eq!(h.stack().read(callee.interpreter_frame_locals().unwrap()).unwrap(), 5);

        let bounds = h.stack().bounds();
        assert!(callee.is_interpreted_frame_valid(bounds));
        assert!(caller.is_interpreted_frame_valid(bounds));

        let wrapper = frames[2].frame.entry_frame_call_wrapper().unwrap();
        assert_eq!(Some(wrapper.addr()), manager.entry_wrapper());
        assert_eq!(wrapper.callee_method().unwrap(), CALLER);
        assert_eq!(wrapper.handle_count().unwrap(), 1);
    }

    #[test]
    fn test_paused_chain_scans_roots() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[0xA000_0010]).unwrap();
        manager.step(&mut program(call(CALLEE))).unwrap();

        let safepoints = SafepointSynchronizer::new();
        safepoints.begin(&[&h.thread]);
        let mut slots = Vec::new();
        let stats = RootScanner::new(GcConfig::default(), &safepoints)
            .scan_thread(&h.thread, h.env(), &mut |slot: Address| slots.push(slot))
            .unwrap();
        safepoints.end();

        // 每个解释帧的 method 和 cache 槽，外加一个 handle
        assert_eq!(
            stats,
            ScanStats {
                threads: 1,
                frames: 3,
                compiled_frames: 0,
                oops: 5,
            }
        );
        let wrapper = manager.entry_wrapper().unwrap();
        assert!(slots.contains(&(wrapper + call_wrapper::HANDLES as usize * 8)));
        assert!(slots.contains(&(manager.state(1).unwrap().fp() - 24)));

        // bcx 恢复为 bcp 形式，继续执行不受影响
        let outcome = manager.run(&mut program(call(CALLEE))).unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Returned {
                kind: ReturnKind::Int,
                value: smallvec![11],
            }
        );
    }

    #[test]
    fn test_failed_prologue_restores_earlier_frames() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[]).unwrap();
        manager.step(&mut program(call(CALLEE))).unwrap();

        // 调用者带 mdx 但没有 profiling 数据；被调者先完成 prologue
        let callee_fp = manager.state(1).unwrap().fp();
        let caller_fp = manager.state(0).unwrap().fp();
        h.stack().write(caller_fp - 32, 0x70_0010).unwrap();
        let env = h.env().with_diagnostics(DiagnosticsConfig {
            profile_interpreter: true,
            ..DiagnosticsConfig::default()
        });

        let safepoints = SafepointSynchronizer::new();
        safepoints.begin(&[&h.thread]);
        let err = RootScanner::new(GcConfig::default(), &safepoints)
            .scan_thread(&h.thread, env, &mut |_: Address| {})
            .unwrap_err();
        safepoints.end();

        assert_eq!(
            err,
            FrameError::MissingMethodData {
                method: "Main.run".to_string()
            }
        );
        assert_eq!(h.stack().read(callee_fp - 56).unwrap(), code_of(CALLEE));
        assert_eq!(h.stack().read(caller_fp - 56).unwrap(), code_of(CALLER));
        assert_eq!(h.stack().read(caller_fp - 32).unwrap(), 0x70_0010);
    }

    #[test]
    fn test_nested_entry_restores_anchor() {
        let h = Harness::new();
        let outer = FrameAnchor {
            last_java_sp: STACK_BASE - 0x100,
            last_java_fp: STACK_BASE - 0xF0,
            last_java_pc: INTERP_RETURN_PC,
        };
        h.thread.set_last_java_frame(outer);

        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[]).unwrap();
        let wrapper = manager.entry_wrapper().unwrap();
        assert!(wrapper < outer.last_java_sp);
        assert_eq!(
            CallWrapper::at(h.stack(), wrapper).anchor().unwrap(),
            outer
        );
        assert_ne!(h.thread.anchor(), outer);

        manager.run(&mut program(call(CALLEE))).unwrap();
        assert_eq!(h.thread.anchor(), outer);
    }

    #[test]
    fn test_more_monitors() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(LOCKER, &[], &[]).unwrap();
        let mut engine = program(call(CALLEE));

        let outcome = manager.step(&mut engine).unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Resumed {
                depth: 1,
                message: Message::GotMonitors
            }
        );
        let state = manager.top().unwrap();
        assert_eq!(state.monitor_count(), 1);
        assert_eq!(state.stack_depth(), 2);
        assert_eq!(state.peek(h.stack(), 0).unwrap(), 2);

        let frame = manager.top_frame().unwrap();
        assert_eq!(frame.interpreter_frame_monitor_end().unwrap(), state.monitor_end());
        assert!(frame.is_interpreted_frame_valid(h.stack().bounds()));

        let outcome = manager.run(&mut engine).unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Returned {
                kind: ReturnKind::Void,
                value: smallvec![],
            }
        );
    }

    #[test]
    fn test_exception_unwinds_through_caller() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[]).unwrap();
        let mut engine = program(call(THROWER));

        assert_eq!(
            manager.step(&mut engine).unwrap(),
            StepOutcome::Called { depth: 2 }
        );
        assert_eq!(
            manager.step(&mut engine).unwrap(),
            StepOutcome::Resumed {
                depth: 1,
                message: Message::RethrowException
            }
        );
        let state = manager.top().unwrap();
        assert_eq!(state.stack_depth(), 1);
        assert_eq!(state.peek(h.stack(), 0).unwrap(), EXCEPTION);

        assert_eq!(
            manager.step(&mut engine).unwrap(),
            StepOutcome::Threw {
                exception: EXCEPTION
            }
        );
        assert!(!h.thread.has_last_java_frame());
    }

    #[test]
    fn test_pop_frame_reexecutes_invoke() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[]).unwrap();
        let mut engine = program(call(POPPER));

        manager.step(&mut engine).unwrap();
        assert_eq!(
            manager.step(&mut engine).unwrap(),
            StepOutcome::Resumed {
                depth: 1,
                message: Message::DeoptResume2
            }
        );
        let state = manager.top().unwrap();
        assert_eq!(state.bcp(), code_of(CALLER));
        assert_eq!(state.stack_depth(), 1);

        // 重新执行的 invoke 调用 CALLEE
        assert_eq!(
            manager.run(&mut engine).unwrap(),
            StepOutcome::Returned {
                kind: ReturnKind::Int,
                value: smallvec![11],
            }
        );
    }

    #[test]
    fn test_cannot_pop_outermost() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(POPPER, &[5], &[]).unwrap();
        assert_eq!(
            manager.step(&mut program(call(CALLEE))).unwrap_err(),
            ProtocolError::PopOutermost
        );
    }

    #[test]
    fn test_callee_must_be_interpreted() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[]).unwrap();
        let compiled = CallMessage {
            entry_point: COMPILED_ENTRY,
            ..call(CALLEE)
        };
        assert_eq!(
            manager.step(&mut program(compiled)).unwrap_err(),
            ProtocolError::UnsupportedCallee {
                callee: CALLEE,
                entry: COMPILED_ENTRY
            }
        );
    }

    #[test]
    fn test_return_kind_checked() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[]).unwrap();
        let mut engine = program(call(WRONG_KIND));
        manager.step(&mut engine).unwrap();
        assert_eq!(
            manager.step(&mut engine).unwrap_err(),
            ProtocolError::ReturnKindMismatch {
                expected: ReturnKind::Int,
                found: ReturnKind::Void
            }
        );
    }

    #[test]
    fn test_engine_must_post_request() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[]).unwrap();
        let mut engine = program(call(IDLE));
        manager.step(&mut engine).unwrap();
        assert_eq!(
            manager.step(&mut engine).unwrap_err(),
            ProtocolError::NoRequest { method: IDLE }
        );
    }

    #[test]
    fn test_stack_overflow() {
        let h = Harness::with_words(16);
        let mut manager = h.manager();
        let err = manager.start(CALLER, &[5], &[]).unwrap_err();
        assert!(matches!(err, ProtocolError::StackOverflow { .. }));
    }

    #[test]
    fn test_osr_requires_handler() {
        let h = Harness::new();
        let mut manager = h.manager();
        manager.start(CALLER, &[5], &[]).unwrap();
        let mut engine = program(call(OSR_M));
        manager.step(&mut engine).unwrap();
        assert_eq!(
            manager.step(&mut engine).unwrap_err(),
            ProtocolError::OsrUnavailable
        );
    }

    #[test]
    fn test_osr_then_compiled_return() {
        let h = Harness::new();
        let mut manager = h.manager().with_osr_handler(FixedOsr);
        manager.start(CALLER, &[5], &[]).unwrap();
        let mut engine = program(call(OSR_M));

        manager.step(&mut engine).unwrap();
        assert_eq!(
            manager.step(&mut engine).unwrap(),
            StepOutcome::OnStackReplaced { result: OSR_RESULT }
        );
        assert_eq!(manager.depth(), 1);
        let caller_fp = manager.top().unwrap().fp();
        assert_eq!(h.thread.anchor().last_java_fp, caller_fp);

        // 调用者仍在等待被替换的调用
        assert_eq!(
            manager.step(&mut engine).unwrap_err(),
            ProtocolError::NotResumed {
                pending: Message::CallMethod
            }
        );
        assert_eq!(
            manager.complete_osr(ReturnKind::Long, &[0, 42]).unwrap_err(),
            ProtocolError::ReturnKindMismatch {
                expected: ReturnKind::Int,
                found: ReturnKind::Long
            }
        );
        assert_eq!(
            manager.complete_osr(ReturnKind::Int, &[42]).unwrap(),
            StepOutcome::Resumed {
                depth: 1,
                message: Message::MethodResume
            }
        );
        assert_eq!(
            manager.complete_osr(ReturnKind::Int, &[42]).unwrap_err(),
            ProtocolError::NoOsrPending
        );
        assert_eq!(
            manager.run(&mut engine).unwrap(),
            StepOutcome::Returned {
                kind: ReturnKind::Int,
                value: smallvec![43],
            }
        );
    }

    #[test]
    fn test_push_deoptimized_needs_waiting_caller() {
        let h = Harness::new();
        let mut manager = h.manager();
        let image = DeoptimizedActivation {
            method: OSR_M,
            bci: 2,
            locals: vec![5],
            ..DeoptimizedActivation::default()
        };
        assert_eq!(
            manager.push_deoptimized(&image).unwrap_err(),
            ProtocolError::NoActivation
        );
        manager.start(CALLER, &[5], &[]).unwrap();
        assert_eq!(
            manager.push_deoptimized(&image).unwrap_err(),
            ProtocolError::IncompatibleResume {
                pending: Message::MethodEntry,
                resume: Message::DeoptResume
            }
        );
    }

    #[test]
    fn test_deoptimized_activation_resumes() {
        let mut h = Harness::new();
        h.code
            .insert(CodeBlob::new(
                "Main.hot",
                HOT_START,
                HOT_START + 0x100,
                BlobKind::Compiled(CompiledMethod::new(OSR_M, HOT_DEOPT, HOT_DEOPT + 0x20)),
            ))
            .unwrap();
        let hot = h.code.find(HOT_START).and_then(CodeBlob::as_compiled).unwrap();
        hot.set_original_pc(HOT_FRAME_ID, HOT_START + 0x40);
        let mut manager = h.manager().with_osr_handler(FixedOsr);
        manager.start(CALLER, &[5], &[]).unwrap();
        let mut engine = program(call(OSR_M));
        manager.step(&mut engine).unwrap();
        manager.step(&mut engine).unwrap();

        // 编译代码被逆优化，重建解释帧
        let image = DeoptimizedActivation {
            method: OSR_M,
            bci: 2,
            locals: vec![5],
            expressions: vec![7],
            monitors: vec![0xA000_0200],
            source: Some(DeoptSource {
                frame_id: HOT_FRAME_ID,
                pc: HOT_DEOPT,
            }),
        };
        manager.push_deoptimized(&image).unwrap();
        assert_eq!(manager.depth(), 2);
        // 被替换的编译帧不再占用原始 pc 表
        assert_eq!(hot.original_pc_count(), 0);

        let state = manager.top().unwrap();
        assert_eq!(state.msg(), Message::DeoptResume);
        assert_eq!(state.bcp(), code_of(OSR_M) + 2);
        assert_eq!(state.monitor_count(), 1);
        assert_eq!(state.peek(h.stack(), 0).unwrap(), 7);
        let monitor = state.monitor_at(0).unwrap();

        let frame = manager.top_frame().unwrap();
        assert_eq!(h.stack().read(frame.monitor_obj_addr(monitor)).unwrap(), 0xA000_0200);
        assert_eq!(frame.interpreter_frame_bci().unwrap(), 2);
        assert!(frame.is_interpreted_frame_valid(h.stack().bounds()));
        assert_eq!(
            manager.complete_osr(ReturnKind::Int, &[1]).unwrap_err(),
            ProtocolError::NoOsrPending
        );

        // 7 + 5，再由 CALLER 加一
        assert_eq!(
            manager.run(&mut engine).unwrap(),
            StepOutcome::Returned {
                kind: ReturnKind::Int,
                value: smallvec![13],
            }
        );
    }
}
