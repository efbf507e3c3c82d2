//! Region Table - The fixed memory regions of the 3D core
//!
//! Three regions are exported to user space: the register file (REGS) and
//! two memory windows (SMI and EBI). They are described once by platform
//! resources at probe time, mapped for driver access, and never change.
//!
//! # Offset encoding
//! User space selects a region through the mmap offset: bits 28..32 carry
//! the region id and the remaining bits the offset inside the region, which
//! must be zero.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::platform::{IoMem, MemoryMapper};
use crate::{Hw3dError, Result};

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Number of exported regions
pub const NUM_REGIONS: usize = 3;

/// Bit position of the region id inside an mmap offset
pub const REGION_SHIFT: u32 = 28;

const REGION_ID_MASK: u64 = 0xf;

// Region ids must fit the 4-bit field of the offset encoding
const_assert!(NUM_REGIONS <= (REGION_ID_MASK as usize) + 1);

/// Length of the register window handed out by the pmem grant path
pub const REGS_LEN: usize = 0x10_0000;

/// Region identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionId {
    /// GPU register file
    Regs = 0,
    /// On-chip (stacked) memory window
    Smi = 1,
    /// External bus memory window
    Ebi = 2,
}

impl RegionId {
    pub const ALL: [RegionId; NUM_REGIONS] = [RegionId::Regs, RegionId::Smi, RegionId::Ebi];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Resource name used in board descriptions
    pub fn name(self) -> &'static str {
        match self {
            RegionId::Regs => "regs",
            RegionId::Smi => "smi",
            RegionId::Ebi => "ebi",
        }
    }

    /// Offset user space passes to mmap to select this region
    pub fn map_offset(self) -> u64 {
        (self as u64) << REGION_SHIFT
    }

    /// Split an mmap offset into (region index, offset inside region)
    pub fn decode_offset(offset: u64) -> (usize, u64) {
        let index = ((offset >> REGION_SHIFT) & REGION_ID_MASK) as usize;
        let within = offset & !(REGION_ID_MASK << REGION_SHIFT);
        (index, within)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical memory resource, `end` inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub start: u64,
    pub end: u64,
}

impl Resource {
    /// Resource covering `size` bytes from `start`
    ///
    /// A zero size yields a resource that [`PlatformResources::resolve`]
    /// rejects.
    pub fn new(start: u64, size: usize) -> Self {
        Self {
            start,
            end: start.wrapping_add(size as u64).wrapping_sub(1),
        }
    }

    /// Size in bytes, or `None` if `end` is before `start` or the span
    /// does not fit a `usize`
    pub fn checked_size(&self) -> Option<usize> {
        let span = self.end.checked_sub(self.start)?.checked_add(1)?;
        usize::try_from(span).ok()
    }

    /// Size in bytes; zero for a malformed resource
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(0)
    }
}

/// Resources the board supplies for the hw3d platform device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformResources {
    pub regs: Option<Resource>,
    pub smi: Option<Resource>,
    pub ebi: Option<Resource>,
    pub irq: Option<u32>,
}

impl PlatformResources {
    /// Check that every region and the interrupt line are present and
    /// every region spans at least one byte
    ///
    /// # Errors
    /// Returns `NotFound` naming the first missing resource, or
    /// `InvalidArgument` naming the first malformed one
    pub fn resolve(&self) -> Result<([Resource; NUM_REGIONS], u32)> {
        let region = |res: Option<Resource>, id: RegionId| -> Result<Resource> {
            let res = res.ok_or_else(|| Hw3dError::NotFound {
                resource: id.name().into(),
            })?;
            if res.checked_size().is_none() {
                return Err(Hw3dError::invalid(format!(
                    "resource {} has end {:#x} before start {:#x} or is too large",
                    id, res.end, res.start
                )));
            }
            Ok(res)
        };

        let regs = region(self.regs, RegionId::Regs)?;
        let smi = region(self.smi, RegionId::Smi)?;
        let ebi = region(self.ebi, RegionId::Ebi)?;
        let irq = self.irq.ok_or_else(|| Hw3dError::NotFound {
            resource: "irq".into(),
        })?;

        Ok(([regs, smi, ebi], irq))
    }
}

/// One mapped region
#[derive(Clone)]
pub struct MemRegion {
    /// Physical base address
    pub pbase: u64,

    /// Size in bytes
    pub size: usize,

    vbase: Arc<dyn IoMem>,
}

impl MemRegion {
    /// Driver-side mapping of the region
    pub fn vbase(&self) -> &Arc<dyn IoMem> {
        &self.vbase
    }
}

impl fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRegion")
            .field("pbase", &format_args!("{:#x}", self.pbase))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

/// Region description returned by GET_REGIONS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub phys: u64,
    pub map_offset: u64,
    pub len: usize,
}

/// Table of the exported regions, immutable after construction
pub struct RegionTable {
    regions: Vec<MemRegion>,
}

impl RegionTable {
    /// Table with nothing mapped, used while probe is still acquiring
    pub(crate) fn empty() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    /// Map every region for driver access
    ///
    /// # Errors
    /// Returns the mapper's error; regions mapped before the failure are
    /// unmapped again
    pub fn map<M: MemoryMapper + ?Sized>(
        mapper: &M,
        resources: &[Resource; NUM_REGIONS],
    ) -> Result<Self> {
        let mut regions: Vec<MemRegion> = Vec::with_capacity(NUM_REGIONS);

        for (id, res) in RegionId::ALL.iter().zip(resources.iter()) {
            match mapper.ioremap(res.start, res.size()) {
                Ok(vbase) => regions.push(MemRegion {
                    pbase: res.start,
                    size: res.size(),
                    vbase,
                }),
                Err(e) => {
                    log::error!("hw3d: cannot remap region {}: {}", id, e);
                    for region in &regions {
                        mapper.iounmap(&region.vbase);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self { regions })
    }

    /// Release the driver-side mappings
    pub fn unmap_all<M: MemoryMapper + ?Sized>(&self, mapper: &M) {
        for region in &self.regions {
            mapper.iounmap(&region.vbase);
        }
    }

    /// Look up a region by raw index
    ///
    /// # Errors
    /// Returns `NotFound` if the index names no region
    pub fn lookup(&self, index: usize) -> Result<&MemRegion> {
        self.regions.get(index).ok_or_else(|| Hw3dError::NotFound {
            resource: format!("region {}", index),
        })
    }

    pub fn get(&self, id: RegionId) -> &MemRegion {
        &self.regions[id.index()]
    }

    pub fn describe(&self) -> Vec<RegionInfo> {
        RegionId::ALL
            .iter()
            .map(|&id| {
                let region = self.get(id);
                RegionInfo {
                    phys: region.pbase,
                    map_offset: id.map_offset(),
                    len: region.size,
                }
            })
            .collect()
    }
}

/// Helper to check if a size or address is page-aligned
pub fn is_page_aligned(value: u64) -> bool {
    value % PAGE_SIZE as u64 == 0
}
