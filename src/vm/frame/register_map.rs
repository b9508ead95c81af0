//! Register location map
//!
//! Records, for one unwind step, where each caller-saved register was
//! spilled on the stack. Valid only for the step that filled it.

use crate::runtime::layout::Reg;
use crate::runtime::stack::Address;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterLocationMap {
    locations: [Address; Reg::COUNT],
    valid: u16,
    update_map: bool,
    include_argument_oops: bool,
}

impl RegisterLocationMap {
    /// Fresh map; argument oops are excluded until a step says otherwise.
    ///
    /// With `update_map` false, sender steps skip register bookkeeping.
    pub fn new(update_map: bool) -> Self {
        Self {
            locations: [0; Reg::COUNT],
            valid: 0,
            update_map,
            include_argument_oops: false,
        }
    }

    pub fn update_map(&self) -> bool {
        self.update_map
    }

    pub fn include_argument_oops(&self) -> bool {
        self.include_argument_oops
    }

    pub fn set_include_argument_oops(
        &mut self,
        include: bool,
    ) {
        self.include_argument_oops = include;
    }

    /// Stack address holding the saved value of `reg`
    pub fn location(
        &self,
        reg: Reg,
    ) -> Option<Address> {
        let bit = 1u16.checked_shl(u32::from(reg.0))?;
        (self.valid & bit != 0).then(|| self.locations[reg.index()])
    }

    pub fn set_location(
        &mut self,
        reg: Reg,
        addr: Address,
    ) {
        debug_assert!(self.update_map, "updating a map that does not track registers");
        let Some(slot) = self.locations.get_mut(reg.index()) else {
            return;
        };
        *slot = addr;
        self.valid |= 1 << reg.0;
    }

    /// Forget all locations; crossing an entry frame makes argument oops live
    pub fn clear(&mut self) {
        self.include_argument_oops = true;
        if self.update_map {
            self.valid = 0;
        }
    }

    pub fn valid_count(&self) -> u32 {
        self.valid.count_ones()
    }
}

impl Default for RegisterLocationMap {
    fn default() -> Self {
        Self::new(true)
    }
}
