//! Compiled-code oop maps
//!
//! An [`OopMap`] records, for one return address inside a compiled unit,
//! which registers and frame slots hold references and where callee-saved
//! registers were spilled. Maps are kept sorted by pc offset for binary
//! search.

use smallvec::SmallVec;

use crate::runtime::layout::Reg;

/// Iterator over set bits in a bitmap.
#[derive(Debug, Clone)]
pub struct LiveBitmapIter {
    bitmap: u64,
}

impl LiveBitmapIter {
    #[inline]
    fn new(bitmap: u64) -> Self {
        Self { bitmap }
    }
}

impl Iterator for LiveBitmapIter {
    type Item = u8;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.bitmap == 0 {
            return None;
        }
        let trailing = self.bitmap.trailing_zeros() as u8;
        self.bitmap &= self.bitmap - 1; // Clear lowest set bit
        Some(trailing)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let count = self.bitmap.count_ones() as usize;
        (count, Some(count))
    }
}

impl ExactSizeIterator for LiveBitmapIter {}

/// Reference layout at one pc of a compiled unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OopMap {
    /// Offset of the return address from the unit's start
    pub pc_offset: u32,
    /// Bit n set: register n holds a reference
    oop_registers: u16,
    /// Bit n set: word n above the unextended sp holds a reference
    oop_stack_slots: u64,
    /// Callee-saved registers spilled into this frame, with their slot
    callee_saved: SmallVec<[(Reg, u32); 4]>,
}

impl OopMap {
    pub fn at(pc_offset: u32) -> Self {
        Self {
            pc_offset,
            oop_registers: 0,
            oop_stack_slots: 0,
            callee_saved: SmallVec::new(),
        }
    }

    pub fn with_oop_register(
        mut self,
        reg: Reg,
    ) -> Self {
        self.oop_registers |= 1 << reg.0;
        self
    }

    pub fn with_oop_slot(
        mut self,
        slot: u8,
    ) -> Self {
        assert!(slot < 64, "oop map covers 64 frame slots");
        self.oop_stack_slots |= 1 << slot;
        self
    }

    pub fn with_callee_saved(
        mut self,
        reg: Reg,
        slot: u32,
    ) -> Self {
        self.callee_saved.push((reg, slot));
        self
    }

    /// Registers holding references
    pub fn oop_registers(&self) -> impl Iterator<Item = Reg> {
        LiveBitmapIter::new(u64::from(self.oop_registers)).map(Reg)
    }

    /// Frame slots holding references, in words above the unextended sp
    pub fn oop_slots(&self) -> LiveBitmapIter {
        LiveBitmapIter::new(self.oop_stack_slots)
    }

    pub fn callee_saved(&self) -> &[(Reg, u32)] {
        &self.callee_saved
    }

    pub fn oop_count(&self) -> u32 {
        self.oop_registers.count_ones() + self.oop_stack_slots.count_ones()
    }
}

/// All oop maps of one compiled unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OopMapSet {
    maps: Box<[OopMap]>,
}

impl OopMapSet {
    pub fn new(mut maps: Vec<OopMap>) -> Self {
        maps.sort_by_key(|m| m.pc_offset);
        maps.dedup_by_key(|m| m.pc_offset);
        Self {
            maps: maps.into_boxed_slice(),
        }
    }

    /// Map recorded for exactly `pc_offset`
    pub fn find(
        &self,
        pc_offset: u32,
    ) -> Option<&OopMap> {
        self.maps
            .binary_search_by_key(&pc_offset, |m| m.pc_offset)
            .ok()
            .map(|i| &self.maps[i])
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
