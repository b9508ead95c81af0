//! GC 根扫描单元测试
//!
//! 在安全点上扫描线程栈，检查访问到的引用槽和帧计数

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::runtime::gc::{RootScanner, ScanStats, ThreadRoots};
use crate::runtime::stack::Address;
use crate::runtime::thread::{ManagedThread, SafepointSynchronizer};
use crate::util::config::{DiagnosticsConfig, GcConfig};
use crate::vm::errors::FrameError;
use crate::vm::tests::fixtures::*;

const SEQUENTIAL: GcConfig = GcConfig {
    parallel_root_scan: false,
};

#[cfg(test)]
mod scan_thread_tests {
    use super::*;

    #[test]
    fn test_requires_safepoint() {
        let fx = StackFixture::new();
        let safepoints = SafepointSynchronizer::new();
        let scanner = RootScanner::new(GcConfig::default(), &safepoints);
        let err = scanner
            .scan_thread(&fx.thread, fx.env(), &mut |_: Address| {})
            .unwrap_err();
        assert_eq!(err, FrameError::NotAtSafepoint);
    }

    #[test]
    fn test_scan_whole_stack() {
        let fx = StackFixture::new();
        let safepoints = SafepointSynchronizer::new();
        safepoints.begin(&[&fx.thread]);
        let scanner = RootScanner::new(GcConfig::default(), &safepoints);

        let mut slots = Vec::new();
        let stats = scanner
            .scan_thread(&fx.thread, fx.env(), &mut |slot: Address| slots.push(slot))
            .unwrap();

        assert_eq!(
            stats,
            ScanStats {
                threads: 1,
                frames: 4,
                compiled_frames: 1,
                oops: 15,
            }
        );
        assert_eq!(slots.len(), 15);
        assert!(slots.contains(&(A_FP - 24)));
        assert!(slots.contains(&(WRAPPER + 48)));
        safepoints.end();
    }

    #[test]
    fn test_bcx_restored_after_scan() {
        let fx = StackFixture::new();
        let safepoints = SafepointSynchronizer::new();
        safepoints.begin(&[&fx.thread]);
        let scanner = RootScanner::new(GcConfig::default(), &safepoints);

        // 扫描期间 bcx 是 bci 形式
        let mut during = Vec::new();
        scanner
            .scan_thread(&fx.thread, fx.env(), &mut |_: Address| {
                during.push(fx.get(A_FP - 56));
            })
            .unwrap();
        assert!(during.iter().all(|&bcx| bcx == INVOKE_BCI as usize));
        assert_eq!(fx.get(A_FP - 56), METHOD_A_CODE + INVOKE_BCI as usize);
    }

    #[test]
    fn test_thread_without_managed_frames() {
        let fx = StackFixture::new();
        fx.thread.clear_last_java_frame();
        let safepoints = SafepointSynchronizer::new();
        safepoints.begin(&[&fx.thread]);
        let stats = RootScanner::new(GcConfig::default(), &safepoints)
            .scan_thread(&fx.thread, fx.env(), &mut |_: Address| {})
            .unwrap();
        assert_eq!(stats.frames, 0);
        assert_eq!(stats.threads, 1);
    }

    #[test]
    fn test_failure_still_restores_frames() {
        let fx = StackFixture::new();
        // 没有 oop map 的 bci
        fx.put(A_FP - 56, METHOD_A_CODE + 4);
        let safepoints = SafepointSynchronizer::new();
        safepoints.begin(&[&fx.thread]);
        let err = RootScanner::new(GcConfig::default(), &safepoints)
            .scan_thread(&fx.thread, fx.env(), &mut |_: Address| {})
            .unwrap_err();
        assert!(matches!(err, FrameError::MissingInterpreterOopMap { bci: 4, .. }));
        assert_eq!(fx.get(A_FP - 56), METHOD_A_CODE + 4);
    }

    #[test]
    fn test_failed_prologue_leaves_frame_untouched() {
        let fx = StackFixture::new();
        // 有 mdx 但方法没有 profiling 数据，bcp -> bci 转换失败
        fx.put(A_FP - 32, 0x70_0010);
        let env = fx.env().with_diagnostics(DiagnosticsConfig {
            profile_interpreter: true,
            ..DiagnosticsConfig::default()
        });
        let safepoints = SafepointSynchronizer::new();
        safepoints.begin(&[&fx.thread]);
        let mut visited = 0;
        let err = RootScanner::new(GcConfig::default(), &safepoints)
            .scan_thread(&fx.thread, env, &mut |_: Address| visited += 1)
            .unwrap_err();
        assert_eq!(
            err,
            FrameError::MissingMethodData {
                method: "A.run".to_string()
            }
        );
        assert_eq!(visited, 0);
        assert_eq!(fx.get(A_FP - 56), METHOD_A_CODE + INVOKE_BCI as usize);
        assert_eq!(fx.get(A_FP - 32), 0x70_0010);
    }
}

#[cfg(test)]
mod scan_threads_tests {
    use super::*;

    fn scan_all(config: GcConfig) -> (ScanStats, usize) {
        let fixtures: Vec<StackFixture> = (0..4).map(|_| StackFixture::new()).collect();
        let threads: Vec<&ManagedThread> = fixtures.iter().map(|fx| &fx.thread).collect();
        let safepoints = SafepointSynchronizer::new();
        safepoints.begin(&threads);

        let roots: Vec<ThreadRoots<'_>> = fixtures
            .iter()
            .map(|fx| ThreadRoots {
                thread: &fx.thread,
                env: fx.env(),
            })
            .collect();

        let seen = AtomicUsize::new(0);
        let seen_ref = &seen;
        let stats = RootScanner::new(config, &safepoints)
            .scan_threads(&roots, move |_thread: &ManagedThread| {
                move |_slot: Address| {
                    seen_ref.fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();
        (stats, seen.load(Ordering::Relaxed))
    }

    #[test]
    fn test_parallel_scan() {
        let (stats, seen) = scan_all(GcConfig::default());
        assert_eq!(stats.threads, 4);
        assert_eq!(stats.frames, 16);
        assert_eq!(stats.oops, 60);
        assert_eq!(seen, 60);
    }

    #[test]
    fn test_sequential_matches_parallel() {
        assert_eq!(scan_all(SEQUENTIAL), scan_all(GcConfig::default()));
    }

    #[test]
    fn test_first_error_is_reported() {
        let good = StackFixture::new();
        let bad = StackFixture::new();
        bad.put(A_FP - 24, 0xdead_0000);
        let safepoints = SafepointSynchronizer::new();
        safepoints.begin(&[&good.thread, &bad.thread]);

        let roots = [
            ThreadRoots {
                thread: &good.thread,
                env: good.env(),
            },
            ThreadRoots {
                thread: &bad.thread,
                env: bad.env(),
            },
        ];
        let err = RootScanner::new(SEQUENTIAL, &safepoints)
            .scan_threads(&roots, |_: &ManagedThread| |_: Address| {})
            .unwrap_err();
        assert_eq!(err, FrameError::UnknownMethod { method: 0xdead_0000 });
    }
}
