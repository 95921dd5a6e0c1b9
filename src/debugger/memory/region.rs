use crate::debugger::error::Error;
use crate::debugger::CoreAddr;
use strum_macros::{Display, EnumString};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum MemAccess {
    #[strum(serialize = "rw")]
    ReadWrite,
    #[strum(serialize = "ro")]
    ReadOnly,
    #[strum(serialize = "wo")]
    WriteOnly,
    #[strum(serialize = "flash")]
    Flash,
    #[strum(serialize = "none")]
    None,
}

impl MemAccess {
    pub fn allows_read(self) -> bool {
        matches!(self, MemAccess::ReadWrite | MemAccess::ReadOnly | MemAccess::Flash)
    }

    pub fn allows_write(self) -> bool {
        matches!(self, MemAccess::ReadWrite | MemAccess::WriteOnly)
    }
}

/// Address range with access attributes. `high == 0` means unbounded above.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemRegion {
    /// User visible number, 0 for synthesized regions.
    pub number: u32,
    pub low: CoreAddr,
    pub high: CoreAddr,
    pub access: MemAccess,
    pub cacheable: bool,
    pub enabled: bool,
}

impl MemRegion {
    pub fn contains(&self, addr: CoreAddr) -> bool {
        addr >= self.low && (self.high == 0 || addr < self.high)
    }

    /// Number of bytes from `addr` to the end of region, `None` if region is unbounded.
    pub fn remaining(&self, addr: CoreAddr) -> Option<u64> {
        (self.high != 0).then(|| self.high.saturating_sub(addr))
    }

    fn overlaps(&self, low: CoreAddr, high: CoreAddr) -> bool {
        let self_high = if self.high == 0 { u64::MAX } else { self.high };
        let high = if high == 0 { u64::MAX } else { high };
        low < self_high && self.low < high
    }
}

/// User defined memory regions.
#[derive(Debug, Default)]
pub struct RegionTable {
    regions: Vec<MemRegion>,
    next_number: u32,
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region, return its number. Overlapping regions are rejected.
    pub fn add(
        &mut self,
        low: CoreAddr,
        high: CoreAddr,
        access: MemAccess,
        cacheable: bool,
    ) -> Result<u32, Error> {
        if high != 0 && low >= high {
            return Err(Error::InvalidArgument(format!(
                "invalid memory region: low address {low:#x} must be less than high address {high:#x}"
            )));
        }
        if self.regions.iter().any(|r| r.overlaps(low, high)) {
            return Err(Error::OverlappingRegion(low, high));
        }

        self.next_number += 1;
        let region = MemRegion {
            number: self.next_number,
            low,
            high,
            access,
            cacheable,
            enabled: true,
        };
        let pos = self.regions.partition_point(|r| r.low < low);
        self.regions.insert(pos, region);
        Ok(self.next_number)
    }

    pub fn delete(&mut self, number: u32) -> Result<(), Error> {
        let pos = self
            .regions
            .iter()
            .position(|r| r.number == number)
            .ok_or(Error::RegionNotFound(number))?;
        self.regions.remove(pos);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn set_enabled(&mut self, number: u32, enabled: bool) -> Result<(), Error> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.number == number)
            .ok_or(Error::RegionNotFound(number))?;
        region.enabled = enabled;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemRegion> {
        self.regions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Find the region covering `addr`.
    ///
    /// An address outside of every enabled region gets a synthesized region spanning the gap
    /// between its neighbours. Gap is inaccessible if `inaccessible_by_default` is set and some
    /// user region exists.
    pub fn lookup(&self, addr: CoreAddr, inaccessible_by_default: bool) -> MemRegion {
        let mut low = 0;
        let mut high = 0;
        let mut any_enabled = false;

        for region in self.regions.iter().filter(|r| r.enabled) {
            any_enabled = true;
            if region.contains(addr) {
                return region.clone();
            }
            if region.high != 0 && addr >= region.high && low < region.high {
                low = region.high;
            }
            if addr < region.low && (high == 0 || high > region.low) {
                high = region.low;
            }
        }

        let access = if inaccessible_by_default && any_enabled {
            MemAccess::None
        } else {
            MemAccess::ReadWrite
        };
        MemRegion {
            number: 0,
            low,
            high,
            access,
            cacheable: false,
            enabled: true,
        }
    }
}
