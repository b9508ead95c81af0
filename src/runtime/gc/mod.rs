//! GC root scanning over thread stacks
//!
//! At a safepoint each thread is walked with register maps. Interpreted
//! frames are switched to bci form for the duration of the scan, every frame
//! reports its reference slots, and the frames are switched back afterwards.
//! Threads are independent, so several stacks may be scanned in parallel.

use std::ops::{Add, AddAssign};

use rayon::prelude::*;

use crate::runtime::code::CodeBlob;
use crate::runtime::stack::Address;
use crate::runtime::thread::{ManagedThread, SafepointService};
use crate::util::config::GcConfig;
use crate::vm::errors::{FrameError, FrameResult};
use crate::vm::frame::{FrameEnv, OopVisitor, StackFrameStream, WalkedFrame};

/// Counters for one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub threads: usize,
    pub frames: usize,
    pub compiled_frames: usize,
    pub oops: usize,
}

impl Add for ScanStats {
    type Output = ScanStats;

    fn add(
        self,
        rhs: ScanStats,
    ) -> ScanStats {
        ScanStats {
            threads: self.threads + rhs.threads,
            frames: self.frames + rhs.frames,
            compiled_frames: self.compiled_frames + rhs.compiled_frames,
            oops: self.oops + rhs.oops,
        }
    }
}

impl AddAssign for ScanStats {
    fn add_assign(
        &mut self,
        rhs: ScanStats,
    ) {
        *self = *self + rhs;
    }
}

/// A thread together with the collaborators needed to walk it
#[derive(Debug, Clone, Copy)]
pub struct ThreadRoots<'a> {
    pub thread: &'a ManagedThread,
    pub env: FrameEnv<'a>,
}

/// Root scanner
pub struct RootScanner<'s> {
    config: GcConfig,
    safepoints: &'s dyn SafepointService,
}

impl<'s> RootScanner<'s> {
    pub fn new(
        config: GcConfig,
        safepoints: &'s dyn SafepointService,
    ) -> Self {
        Self { config, safepoints }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Report every reference slot on `thread`'s stack to `visitor`
    pub fn scan_thread(
        &self,
        thread: &ManagedThread,
        env: FrameEnv<'_>,
        visitor: &mut dyn OopVisitor,
    ) -> FrameResult<ScanStats> {
        if !self.safepoints.is_at_safepoint() {
            return Err(FrameError::NotAtSafepoint);
        }
        if !thread.has_last_java_frame() {
            // Nothing managed on this stack yet.
            return Ok(ScanStats {
                threads: 1,
                ..ScanStats::default()
            });
        }

        let frames = StackFrameStream::new(thread, env, true)?.collect::<FrameResult<Vec<_>>>()?;

        for (prologued, walked) in frames.iter().enumerate() {
            if let Err(err) = walked.frame.gc_prologue() {
                tracing::error!(thread = %thread.id(), frame = %walked.frame, "gc prologue failed: {}", err);
                // Frames converted so far go back to bcp form.
                Self::restore_frames(&frames[..prologued])?;
                return Err(err);
            }
        }
        let scanned = Self::visit_frames(&frames, visitor);
        Self::restore_frames(&frames)?;
        let stats = scanned?;

        tracing::debug!(
            thread = %thread.id(),
            frames = stats.frames,
            compiled = stats.compiled_frames,
            oops = stats.oops,
            "scanned thread roots"
        );
        Ok(stats)
    }

    /// Run `gc_epilogue` on every frame, reporting the first failure
    fn restore_frames(frames: &[WalkedFrame<'_>]) -> FrameResult<()> {
        frames
            .iter()
            .map(|walked| walked.frame.gc_epilogue())
            .fold(Ok(()), |first, restored| first.and(restored))
    }

    fn visit_frames(
        frames: &[WalkedFrame<'_>],
        visitor: &mut dyn OopVisitor,
    ) -> FrameResult<ScanStats> {
        let mut oops = 0;
        let mut compiled_frames = 0;
        let mut counting = |slot: Address| {
            oops += 1;
            visitor.do_oop(slot);
        };
        let mut blobs = |blob: &CodeBlob| {
            if blob.is_compiled() {
                compiled_frames += 1;
            }
        };
        for walked in frames {
            walked
                .frame
                .oops_do(&mut counting, Some(&mut blobs), &walked.map)?;
        }
        Ok(ScanStats {
            threads: 1,
            frames: frames.len(),
            compiled_frames,
            oops,
        })
    }

    /// Scan several threads, each with its own visitor from `make_visitor`.
    ///
    /// Threads run on the rayon pool when parallel scanning is enabled. The
    /// first failure is returned after all threads have been visited.
    pub fn scan_threads<V, F>(
        &self,
        roots: &[ThreadRoots<'_>],
        make_visitor: F,
    ) -> FrameResult<ScanStats>
    where
        V: OopVisitor,
        F: Fn(&ManagedThread) -> V + Sync,
    {
        let scan = |root: &ThreadRoots<'_>| {
            let mut visitor = make_visitor(root.thread);
            self.scan_thread(root.thread, root.env, &mut visitor)
        };

        let results: Vec<FrameResult<ScanStats>> = if self.config.parallel_root_scan {
            roots.par_iter().map(|root| scan(root)).collect()
        } else {
            roots.iter().map(|root| scan(root)).collect()
        };

        results
            .into_iter()
            .try_fold(ScanStats::default(), |total, stats| Ok(total + stats?))
    }
}

#[cfg(test)]
mod tests;
