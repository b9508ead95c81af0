//! Property checks of the engine / frame-manager protocol

use quickcheck::{QuickCheck, TestResult};
use vmframe::interpreter::{ReturnKind, StepOutcome};
use vmframe::vm::frame::StackFrameStream;

use crate::support::*;

fn prop_recursive_sum(n: u8) -> TestResult {
    let n = usize::from(n % 48);
    let rt = Runtime::new(1);
    let mut manager = rt.manager();
    if manager.start(SUM, &[n], &[]).is_err() {
        return TestResult::failed();
    }
    match manager.run(&mut sum_engine) {
        Ok(StepOutcome::Returned {
            kind: ReturnKind::Int,
            value,
        }) => TestResult::from_bool(
            value.as_slice() == [n * (n + 1) / 2]
                && manager.depth() == 0
                && !rt.thread.has_last_java_frame(),
        ),
        _ => TestResult::failed(),
    }
}

fn prop_walk_matches_depth(n: u8) -> TestResult {
    let n = usize::from(n % 48);
    let rt = Runtime::new(1);
    let mut manager = rt.manager();
    manager.start(SUM, &[n], &[]).unwrap();
    for _ in 0..n {
        if !matches!(manager.step(&mut sum_engine), Ok(StepOutcome::Called { .. })) {
            return TestResult::failed();
        }
    }
    let walked = StackFrameStream::new(&rt.thread, rt.env(), true)
        .unwrap()
        .collect::<Result<Vec<_>, _>>();
    match walked {
        // Interpreted activations plus the entry frame
        Ok(frames) => TestResult::from_bool(frames.len() == manager.depth() + 1),
        Err(_) => TestResult::failed(),
    }
}

#[test]
fn test_recursive_sum_property() {
    QuickCheck::new()
        .tests(64)
        .quickcheck(prop_recursive_sum as fn(u8) -> TestResult);
}

#[test]
fn test_walk_matches_depth_property() {
    QuickCheck::new()
        .tests(64)
        .quickcheck(prop_walk_matches_depth as fn(u8) -> TestResult);
}
