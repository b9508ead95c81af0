//! Code space: the registry that maps a pc to the unit containing it
//!
//! Frame kind classification starts here. Each [`CodeBlob`] covers a
//! half-open address range and knows its frame size, its oop maps and,
//! for compiled methods, the deoptimization metadata.

pub mod oopmap;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use thiserror::Error;

use crate::runtime::metadata::Signature;
use crate::runtime::stack::{Address, Word};

pub use oopmap::{LiveBitmapIter, OopMap, OopMapSet};

/// Code space errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeCacheError {
    #[error("Code blob '{name}' [{start:#x}, {end:#x}) overlaps '{other}'")]
    Overlap {
        name: String,
        start: Address,
        end: Address,
        other: String,
    },

    #[error("Code blob '{name}' has an empty range")]
    EmptyRange { name: String },

    #[error("Return pc {pc:#x} in '{name}' matches more than one of deopt entry, method-handle deopt entry, method-handle return")]
    AmbiguousReturnPc { name: String, pc: Address },

    #[error("Address {pc:#x} named by '{name}' lies outside the blob")]
    OutsideBlob { name: String, pc: Address },
}

/// Lookup of code units by pc.
///
/// Must accept any address, including garbage read from a corrupt stack.
pub trait CodeRegistry: Send + Sync {
    fn find(
        &self,
        pc: Address,
    ) -> Option<&CodeBlob>;

    fn contains(
        &self,
        pc: Address,
    ) -> bool {
        self.find(pc).is_some()
    }

    /// Whether `pc` lies in interpreter code
    fn interpreter_contains(
        &self,
        pc: Address,
    ) -> bool {
        matches!(self.find(pc).map(CodeBlob::kind), Some(BlobKind::Interpreter))
    }

    /// Whether `pc` is the return address back into the call stub
    fn returns_to_call_stub(
        &self,
        pc: Address,
    ) -> bool {
        match self.find(pc).map(CodeBlob::kind) {
            Some(BlobKind::CallStub { return_pc }) => *return_pc == pc,
            _ => false,
        }
    }
}

/// Kind of code unit
#[derive(Debug)]
pub enum BlobKind {
    /// Interpreter code
    Interpreter,
    /// Boundary stub through which the VM calls into managed code
    CallStub { return_pc: Address },
    /// Compiled method, including native-method wrappers
    Compiled(CompiledMethod),
    RuntimeStub,
    Adapter,
    SafepointStub,
    /// Method-handle argument reshaping blob; only `bounce_pc` starts a ricochet frame
    Ricochet { bounce_pc: Address },
}

impl BlobKind {
    pub fn name(&self) -> &'static str {
        match self {
            BlobKind::Interpreter => "interpreter",
            BlobKind::CallStub { .. } => "call stub",
            BlobKind::Compiled(_) => "compiled",
            BlobKind::RuntimeStub => "runtime stub",
            BlobKind::Adapter => "adapter",
            BlobKind::SafepointStub => "safepoint stub",
            BlobKind::Ricochet { .. } => "ricochet",
        }
    }
}

/// One unit of generated code
#[derive(Debug)]
pub struct CodeBlob {
    name: String,
    start: Address,
    end: Address,
    code_begin: Address,
    frame_size: usize,
    frame_complete_offset: Option<usize>,
    oop_maps: Option<OopMapSet>,
    caller_must_gc_arguments: bool,
    kind: BlobKind,
}

impl CodeBlob {
    /// A blob covering `[start, end)`
    pub fn new(
        name: impl Into<String>,
        start: Address,
        end: Address,
        kind: BlobKind,
    ) -> Self {
        let frame_complete_offset = match kind {
            BlobKind::Adapter => None,
            _ => Some(0),
        };
        Self {
            name: name.into(),
            start,
            end,
            code_begin: start,
            frame_size: 0,
            frame_complete_offset,
            oop_maps: None,
            caller_must_gc_arguments: false,
            kind,
        }
    }

    /// Frame size in words, return address included
    pub fn with_frame_size(
        mut self,
        words: usize,
    ) -> Self {
        self.frame_size = words;
        self
    }

    /// Byte offset from `start` after which the frame is fully built
    pub fn with_frame_complete_offset(
        mut self,
        offset: usize,
    ) -> Self {
        self.frame_complete_offset = Some(offset);
        self
    }

    /// Byte offset of the first instruction, after the blob header
    pub fn with_header_size(
        mut self,
        bytes: usize,
    ) -> Self {
        self.code_begin = self.start + bytes;
        self
    }

    pub fn with_oop_maps(
        mut self,
        maps: OopMapSet,
    ) -> Self {
        self.oop_maps = Some(maps);
        self
    }

    pub fn with_caller_must_gc_arguments(mut self) -> Self {
        self.caller_must_gc_arguments = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn kind(&self) -> &BlobKind {
        &self.kind
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn oop_maps(&self) -> Option<&OopMapSet> {
        self.oop_maps.as_ref()
    }

    pub fn caller_must_gc_arguments(&self) -> bool {
        self.caller_must_gc_arguments
    }

    pub fn contains(
        &self,
        pc: Address,
    ) -> bool {
        pc >= self.start && pc < self.end
    }

    /// Whether `pc` lies in the instructions rather than the header
    pub fn code_contains(
        &self,
        pc: Address,
    ) -> bool {
        pc >= self.code_begin && pc < self.end
    }

    pub fn is_frame_complete_at(
        &self,
        pc: Address,
    ) -> bool {
        match self.frame_complete_offset {
            Some(offset) => self.contains(pc) && pc >= self.start + offset,
            None => false,
        }
    }

    /// Oop map recorded for return address `pc`
    pub fn oop_map_at(
        &self,
        pc: Address,
    ) -> Option<&OopMap> {
        let offset = u32::try_from(pc.checked_sub(self.start)?).ok()?;
        self.oop_maps.as_ref()?.find(offset)
    }

    pub fn as_compiled(&self) -> Option<&CompiledMethod> {
        match &self.kind {
            BlobKind::Compiled(nm) => Some(nm),
            _ => None,
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.as_compiled().is_some()
    }

    pub fn is_runtime_stub(&self) -> bool {
        matches!(self.kind, BlobKind::RuntimeStub)
    }

    pub fn is_adapter(&self) -> bool {
        matches!(self.kind, BlobKind::Adapter)
    }

    pub fn is_safepoint_stub(&self) -> bool {
        matches!(self.kind, BlobKind::SafepointStub)
    }

    fn validate(&self) -> Result<(), CodeCacheError> {
        if self.start >= self.end {
            return Err(CodeCacheError::EmptyRange {
                name: self.name.clone(),
            });
        }
        let named_pcs: SmallVec<[Address; 8]> = match &self.kind {
            BlobKind::CallStub { return_pc } => SmallVec::from_slice(&[*return_pc]),
            BlobKind::Ricochet { bounce_pc } => SmallVec::from_slice(&[*bounce_pc]),
            BlobKind::Compiled(nm) => nm.named_pcs().collect(),
            _ => SmallVec::new(),
        };
        if let Some(pc) = named_pcs.iter().find(|pc| !self.contains(**pc)) {
            return Err(CodeCacheError::OutsideBlob {
                name: self.name.clone(),
                pc: *pc,
            });
        }
        if let Some(nm) = self.as_compiled() {
            if let Some(pc) = nm.ambiguous_return_pc() {
                return Err(CodeCacheError::AmbiguousReturnPc {
                    name: self.name.clone(),
                    pc,
                });
            }
        }
        Ok(())
    }
}

/// Callee of the call whose return address is a given pc
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalleeSignature {
    pub signature: Signature,
    pub has_receiver: bool,
}

/// Compiled method metadata
#[derive(Debug)]
pub struct CompiledMethod {
    method: Word,
    is_native: bool,
    deopt_handler: Address,
    deopt_mh_handler: Address,
    poll_returns: SmallVec<[Address; 2]>,
    method_handle_returns: SmallVec<[Address; 2]>,
    call_sites: BTreeMap<Address, CalleeSignature>,
    can_be_deoptimized: bool,
    marked_for_deopt: AtomicBool,
    original_pcs: RwLock<HashMap<Address, Address>>,
}

impl CompiledMethod {
    pub fn new(
        method: Word,
        deopt_handler: Address,
        deopt_mh_handler: Address,
    ) -> Self {
        Self {
            method,
            is_native: false,
            deopt_handler,
            deopt_mh_handler,
            poll_returns: SmallVec::new(),
            method_handle_returns: SmallVec::new(),
            call_sites: BTreeMap::new(),
            can_be_deoptimized: true,
            marked_for_deopt: AtomicBool::new(false),
            original_pcs: RwLock::new(HashMap::new()),
        }
    }

    /// Native-method wrapper
    pub fn native(mut self) -> Self {
        self.is_native = true;
        self
    }

    pub fn with_poll_return(
        mut self,
        pc: Address,
    ) -> Self {
        self.poll_returns.push(pc);
        self
    }

    pub fn with_method_handle_return(
        mut self,
        pc: Address,
    ) -> Self {
        self.method_handle_returns.push(pc);
        self
    }

    /// Record the callee of the call returning to `return_pc`
    pub fn with_call_site(
        mut self,
        return_pc: Address,
        callee: CalleeSignature,
    ) -> Self {
        self.call_sites.insert(return_pc, callee);
        self
    }

    pub fn not_deoptimizable(mut self) -> Self {
        self.can_be_deoptimized = false;
        self
    }

    pub fn method(&self) -> Word {
        self.method
    }

    pub fn is_native_method(&self) -> bool {
        self.is_native
    }

    pub fn is_java_method(&self) -> bool {
        !self.is_native
    }

    pub fn deopt_handler(&self) -> Address {
        self.deopt_handler
    }

    pub fn deopt_mh_handler(&self) -> Address {
        self.deopt_mh_handler
    }

    pub fn is_deopt_entry(
        &self,
        pc: Address,
    ) -> bool {
        pc == self.deopt_handler
    }

    pub fn is_deopt_mh_entry(
        &self,
        pc: Address,
    ) -> bool {
        pc == self.deopt_mh_handler
    }

    pub fn is_deopt_pc(
        &self,
        pc: Address,
    ) -> bool {
        self.is_deopt_entry(pc) || self.is_deopt_mh_entry(pc)
    }

    pub fn is_method_handle_return(
        &self,
        pc: Address,
    ) -> bool {
        self.method_handle_returns.contains(&pc)
    }

    pub fn is_at_poll_return(
        &self,
        pc: Address,
    ) -> bool {
        self.poll_returns.contains(&pc)
    }

    pub fn can_be_deoptimized(&self) -> bool {
        self.can_be_deoptimized
    }

    pub fn is_marked_for_deoptimization(&self) -> bool {
        self.marked_for_deopt.load(Ordering::Acquire)
    }

    pub fn mark_for_deoptimization(&self) {
        self.marked_for_deopt.store(true, Ordering::Release);
    }

    /// Callee of the call returning to `pc`
    pub fn call_site_at(
        &self,
        pc: Address,
    ) -> Option<&CalleeSignature> {
        self.call_sites.get(&pc)
    }

    /// Original pc saved when the frame `frame_id` was patched
    pub fn original_pc(
        &self,
        frame_id: Address,
    ) -> Option<Address> {
        self.original_pcs.read().get(&frame_id).copied()
    }

    pub fn set_original_pc(
        &self,
        frame_id: Address,
        pc: Address,
    ) {
        self.original_pcs.write().insert(frame_id, pc);
    }

    /// Drop the saved pc once the deoptimized activation is gone
    pub fn forget_original_pc(
        &self,
        frame_id: Address,
    ) -> Option<Address> {
        self.original_pcs.write().remove(&frame_id)
    }

    pub fn original_pc_count(&self) -> usize {
        self.original_pcs.read().len()
    }

    fn named_pcs(&self) -> impl Iterator<Item = Address> + '_ {
        [self.deopt_handler, self.deopt_mh_handler]
            .into_iter()
            .chain(self.poll_returns.iter().copied())
            .chain(self.method_handle_returns.iter().copied())
    }

    /// A pc that falls in more than one return-pc category
    fn ambiguous_return_pc(&self) -> Option<Address> {
        self.named_pcs().find(|pc| {
            let hits = usize::from(self.is_deopt_entry(*pc))
                + usize::from(self.is_deopt_mh_entry(*pc))
                + usize::from(self.is_method_handle_return(*pc));
            hits > 1
        })
    }
}

/// Code space backed by an ordered map of blob start addresses
#[derive(Debug, Default)]
pub struct CodeCache {
    blobs: BTreeMap<Address, CodeBlob>,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blob; its range must not overlap any other
    pub fn insert(
        &mut self,
        blob: CodeBlob,
    ) -> Result<(), CodeCacheError> {
        blob.validate()?;
        let overlapping = self
            .blobs
            .range(..blob.end)
            .next_back()
            .filter(|(_, other)| other.end > blob.start);
        if let Some((_, other)) = overlapping {
            return Err(CodeCacheError::Overlap {
                name: blob.name.clone(),
                start: blob.start,
                end: blob.end,
                other: other.name.clone(),
            });
        }
        tracing::debug!(
            name = %blob.name,
            kind = blob.kind.name(),
            "registered code blob [{:#x}, {:#x})",
            blob.start,
            blob.end
        );
        self.blobs.insert(blob.start, blob);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodeBlob> {
        self.blobs.values()
    }
}

impl CodeRegistry for CodeCache {
    fn find(
        &self,
        pc: Address,
    ) -> Option<&CodeBlob> {
        self.blobs
            .range(..=pc)
            .next_back()
            .map(|(_, blob)| blob)
            .filter(|blob| blob.contains(pc))
    }
}

#[cfg(test)]
mod tests;
