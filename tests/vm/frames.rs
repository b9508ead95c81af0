//! Walking and scanning stacks laid out by the frame manager

use vmframe::interpreter::{ReturnKind, StepOutcome};
use vmframe::runtime::gc::{RootScanner, ScanStats, ThreadRoots};
use vmframe::runtime::stack::Address;
use vmframe::runtime::thread::{ManagedThread, SafepointSynchronizer};
use vmframe::util::config::GcConfig;
use vmframe::vm::frame::{FrameKind, StackFrameStream};

use crate::support::*;

/// Start `sum(n)` and descend until the innermost activation is pushed
fn descend<'a>(
    rt: &'a Runtime,
    n: usize,
) -> vmframe::interpreter::FrameManager<'a> {
    let mut manager = rt.manager();
    manager.start(SUM, &[n], &[]).unwrap();
    for depth in 2..=n + 1 {
        assert_eq!(
            manager.step(&mut sum_engine).unwrap(),
            StepOutcome::Called { depth }
        );
    }
    manager
}

#[test]
fn test_deep_recursion_walk() {
    let rt = Runtime::new(1);
    let mut manager = descend(&rt, 31);
    assert_eq!(manager.depth(), 32);

    let bounds = rt.thread.stack().bounds();
    let frames = StackFrameStream::new(&rt.thread, rt.env(), false)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(frames.len(), 33);
    assert_eq!(frames[32].frame.kind(), FrameKind::Entry);

    for (n, walked) in frames[..32].iter().enumerate() {
        let frame = &walked.frame;
        assert_eq!(frame.kind(), FrameKind::Interpreted);
        assert!(frame.is_safe_for_sender(bounds));
        assert!(frame.is_interpreted_frame_valid(bounds));
        let local = rt.thread.stack().read(frame.interpreter_frame_locals().unwrap()).unwrap();
        assert_eq!(local, n);
    }

    let outcome = manager.run(&mut sum_engine).unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Returned {
            kind: ReturnKind::Int,
            value: smallvec::smallvec![496],
        }
    );
    assert!(!rt.thread.has_last_java_frame());
}

#[test]
fn test_scan_paused_threads() {
    let runtimes: Vec<Runtime> = (1..=3).map(Runtime::new).collect();
    let managers: Vec<_> = runtimes.iter().map(|rt| descend(rt, 7)).collect();
    assert!(managers.iter().all(|m| m.depth() == 8));

    let threads: Vec<&ManagedThread> = runtimes.iter().map(|rt| &rt.thread).collect();
    let safepoints = SafepointSynchronizer::new();
    safepoints.begin(&threads);
    let roots: Vec<ThreadRoots<'_>> = runtimes
        .iter()
        .map(|rt| ThreadRoots {
            thread: &rt.thread,
            env: rt.env(),
        })
        .collect();

    let stats = RootScanner::new(GcConfig::default(), &safepoints)
        .scan_threads(&roots, |_: &ManagedThread| |_: Address| {})
        .unwrap();
    safepoints.end();

    // Method and cache slot of every interpreted frame.
    assert_eq!(
        stats,
        ScanStats {
            threads: 3,
            frames: 27,
            compiled_frames: 0,
            oops: 48,
        }
    );
}
