//! Region Mapping - Exporting regions into user address spaces
//!
//! A region is mapped whole, uncached, at the offset returned by
//! GET_REGIONS. Each region is held by at most one handle at a time. The
//! memory windows (SMI, EBI) are zeroed before they are handed out so one
//! client never sees another's data; the register window is left alone.
//!
//! # Lock order
//! State lock first, then the handle's mapping table.

use crate::device::{Hw3d, Hw3dFile};
use crate::platform::{MappingHandle, Pid, Platform};
use crate::region::{is_page_aligned, RegionId};
use crate::state::{DeviceFlags, DeviceState};
use crate::{Hw3dError, Result};

/// A region mapped into a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub handle: MappingHandle,
    pub region: RegionId,
    /// Physical base of the region
    pub phys: u64,
    pub size: usize,
}

impl<P: Platform> Hw3d<P> {
    /// Map the region selected by `offset` into `pid`
    ///
    /// # Arguments
    /// * `offset` - region id in bits 28..32, must otherwise be zero
    /// * `size` - must equal the region size
    ///
    /// # Errors
    /// - `InvalidArgument` for an unknown region, a partial mapping or a
    ///   released handle
    /// - `PermissionDenied` if a client handle does not belong to the owner
    ///   or a revoke or suspend is in progress
    /// - `Busy` if the region is already mapped
    pub fn mmap(&self, file: &Hw3dFile, pid: Pid, offset: u64, size: usize) -> Result<Mapping> {
        file.check_live()?;

        let (index, within) = RegionId::decode_offset(offset);
        let id = RegionId::from_index(index).ok_or_else(|| {
            log::error!("hw3d: invalid region {} requested", index);
            Hw3dError::invalid(format!("invalid region {}", index))
        })?;
        let region = self.regions.get(id);

        if size != region.size || within != 0 || !is_page_aligned(size as u64) {
            log::error!(
                "hw3d: cannot map part of region {} (offset {:#x}, size {:#x})",
                id,
                within,
                size
            );
            return Err(Hw3dError::invalid(format!(
                "partial mapping of region {}",
                id
            )));
        }

        let mut state = self.lock_state();

        if !file.is_master() {
            if state.owner_pid() != Some(pid) {
                log::error!(
                    "hw3d: current({}) != client({:?})",
                    pid,
                    state.owner_pid()
                );
                return Err(Hw3dError::PermissionDenied {
                    reason: "caller does not own the gpu",
                });
            }
            if state
                .flags
                .intersects(DeviceFlags::REVOKING | DeviceFlags::SUSPENDING)
            {
                log::error!("hw3d: cannot mmap while revoking({:?})", state.flags);
                return Err(Hw3dError::PermissionDenied {
                    reason: "revoke in progress",
                });
            }
        }

        let mut vmas = file.lock_vmas();
        if state.region_holders[index].is_some() {
            log::error!("hw3d: region {} already mapped", id);
            return Err(Hw3dError::Busy {
                reason: "region already mapped",
            });
        }

        if id != RegionId::Regs {
            region.vbase().fill(0);
        }

        let handle = self
            .platform
            .map_into(pid, region.pbase, size)
            .inspect_err(|e| log::error!("hw3d: cannot remap region {}: {}", id, e))?;

        vmas[index] = Some(handle);
        state.region_holders[index] = Some(file.id());

        log::debug!(
            "hw3d: mmap region {} size {:#x} into pid {}",
            id,
            size,
            pid
        );
        Ok(Mapping {
            handle,
            region: id,
            phys: region.pbase,
            size,
        })
    }

    /// The mapping was duplicated (fork); the copy must not keep the pages
    pub fn vma_open(&self, file: &Hw3dFile, handle: MappingHandle) {
        log::debug!("hw3d: handle {} mapping duplicated, zapping", file.id());
        self.platform.zap(handle);
    }

    /// The memory subsystem closed a mapping; forget it
    pub fn vma_close(&self, file: &Hw3dFile, handle: MappingHandle) {
        let mut state = self.lock_state();
        let mut vmas = file.lock_vmas();

        match vmas.iter().position(|m| *m == Some(handle)) {
            Some(index) => {
                vmas[index] = None;
                if state.region_holders[index] == Some(file.id()) {
                    state.region_holders[index] = None;
                }
                log::debug!("hw3d: unmapped region {}", index);
            }
            None => log::warn!("hw3d: mapping {:?} not held by handle {}", handle, file.id()),
        }
    }

    /// Tear down every mapping `file` holds
    pub(crate) fn unmap_all_locked(&self, state: &mut DeviceState, file: &Hw3dFile) {
        let mut vmas = file.lock_vmas();

        for (index, slot) in vmas.iter_mut().enumerate() {
            if let Some(handle) = slot.take() {
                self.platform.unmap(handle);
                if state.region_holders[index] == Some(file.id()) {
                    state.region_holders[index] = None;
                }
            }
        }
    }
}
