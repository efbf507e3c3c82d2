//! Mock Platform - In-memory kernel collaborators
//!
//! Records every call the driver makes so tests and the simulator can check
//! clock refcounts, interrupt masking, pinned tasks, killed processes and
//! user mappings. Physical memory is backed by plain byte vectors keyed by
//! base address, so a mapping handed to a "process" can be read and written
//! through [`MockPlatform::read_mapping`] and [`MockPlatform::write_mapping`].
//!
//! Failure injection hooks let tests drive every probe error path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::Hw3dConfig;
use crate::device::Hw3d;
use crate::platform::{
    ClockControl, ClockId, DeviceNodes, InterruptController, IoMem, MappingHandle, MemoryMapper,
    NodeId, Pid, TaskControl, WakeLock,
};
use crate::region::{PlatformResources, Resource};
use crate::{Hw3dError, Result};

/// Graphics interrupt line on MSM7x01A
pub const MSM_GRAPHICS_IRQ: u32 = 17;

/// Resources of the MSM7x01A hw3d device, with 1MB memory windows
pub fn msm_resources() -> PlatformResources {
    PlatformResources {
        regs: Some(Resource::new(0xA000_0000, 0x10_0000)),
        smi: Some(Resource::new(0x0020_0000, 0x10_0000)),
        ebi: Some(Resource::new(0x1800_0000, 0x10_0000)),
        irq: Some(MSM_GRAPHICS_IRQ),
    }
}

/// Probe a device on a fresh mock with the MSM resources
///
/// # Errors
/// Whatever [`Hw3d::probe`] returns
pub fn probe_msm(config: Hw3dConfig) -> Result<(Arc<MockPlatform>, Arc<Hw3d<MockPlatform>>)> {
    let platform = Arc::new(MockPlatform::new());
    let hw3d = Hw3d::probe(Arc::clone(&platform), &msm_resources(), config)?;
    Ok((platform, hw3d))
}

/// Byte-vector backed region
pub struct MockIoMem {
    pbase: u64,
    bytes: Mutex<Vec<u8>>,
}

impl MockIoMem {
    fn new(pbase: u64, size: usize) -> Self {
        Self {
            pbase,
            bytes: Mutex::new(vec![0; size]),
        }
    }

    fn bytes(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn contains(&self, pbase: u64, size: usize) -> bool {
        pbase >= self.pbase && pbase + size as u64 <= self.pbase + self.len() as u64
    }
}

impl IoMem for MockIoMem {
    fn len(&self) -> usize {
        self.bytes().len()
    }

    fn fill(&self, byte: u8) {
        self.bytes().fill(byte);
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        let bytes = self.bytes();
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
    }

    fn write(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }
}

struct MockClock {
    name: String,
    /// Outstanding `clk_get` references
    gets: usize,
    /// Enable count
    refcount: i32,
}

/// A mapping established in a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockMapping {
    pub pid: Pid,
    pub pbase: u64,
    pub size: usize,
}

#[derive(Default)]
struct MockState {
    clocks: Vec<MockClock>,
    missing_clocks: HashSet<String>,

    irq_claimed: Option<u32>,
    irq_masked: bool,
    irq_fail: bool,
    irq_enable_calls: usize,

    memories: HashMap<u64, Arc<MockIoMem>>,
    ioremap_fail: HashSet<u64>,
    ioremapped: usize,

    mappings: HashMap<u64, MockMapping>,
    next_mapping: u64,
    zapped: Vec<MappingHandle>,
    map_fail: bool,

    pinned: HashMap<Pid, usize>,
    terminated: Vec<Pid>,
    unkillable: HashSet<Pid>,

    wake_locked: bool,
    wake_lock_count: usize,

    nodes: Vec<(NodeId, String)>,
    next_node: u32,
    node_fail: Option<String>,
}

/// Recording implementation of every platform capability
#[derive(Default)]
pub struct MockPlatform {
    inner: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `clk_get(name)` fail
    pub fn without_clock(self, name: &str) -> Self {
        self.lock().missing_clocks.insert(name.to_string());
        self
    }

    pub fn fail_ioremap(&self, pbase: u64) {
        self.lock().ioremap_fail.insert(pbase);
    }

    pub fn fail_request_irq(&self) {
        self.lock().irq_fail = true;
    }

    pub fn fail_node_registration(&self, name: &str) {
        self.lock().node_fail = Some(name.to_string());
    }

    /// Make `map_into` fail until cleared
    pub fn fail_map_into(&self, fail: bool) {
        self.lock().map_fail = fail;
    }

    /// Make `terminate(pid)` fail
    pub fn set_unkillable(&self, pid: Pid) {
        self.lock().unkillable.insert(pid);
    }

    pub fn ioremapped_count(&self) -> usize {
        self.lock().ioremapped
    }

    /// Clocks obtained and not yet put
    pub fn clocks_held(&self) -> usize {
        self.lock().clocks.iter().map(|c| c.gets).sum()
    }

    pub fn clock_refcount(&self, name: &str) -> i32 {
        self.lock()
            .clocks
            .iter()
            .find(|c| c.name == name)
            .map_or(0, |c| c.refcount)
    }

    pub fn clock_enabled(&self, name: &str) -> bool {
        self.clock_refcount(name) > 0
    }

    pub fn irq_claimed(&self) -> bool {
        self.lock().irq_claimed.is_some()
    }

    /// The line is claimed and unmasked
    pub fn irq_enabled(&self) -> bool {
        let state = self.lock();
        state.irq_claimed.is_some() && !state.irq_masked
    }

    pub fn irq_enable_calls(&self) -> usize {
        self.lock().irq_enable_calls
    }

    pub fn pinned(&self, pid: Pid) -> usize {
        self.lock().pinned.get(&pid).copied().unwrap_or(0)
    }

    pub fn terminated(&self) -> Vec<Pid> {
        self.lock().terminated.clone()
    }

    pub fn wake_locked(&self) -> bool {
        self.lock().wake_locked
    }

    pub fn wake_lock_count(&self) -> usize {
        self.lock().wake_lock_count
    }

    pub fn registered_nodes(&self) -> Vec<String> {
        self.lock().nodes.iter().map(|(_, name)| name.clone()).collect()
    }

    pub fn mapping_count(&self) -> usize {
        self.lock().mappings.len()
    }

    pub fn mapping(&self, handle: MappingHandle) -> Option<MockMapping> {
        self.lock().mappings.get(&handle.0).copied()
    }

    /// Mappings currently established in `pid`
    pub fn mappings_of(&self, pid: Pid) -> usize {
        self.lock().mappings.values().filter(|m| m.pid == pid).count()
    }

    pub fn was_zapped(&self, handle: MappingHandle) -> bool {
        self.lock().zapped.contains(&handle)
    }

    /// Read `len` bytes at `offset` through a live mapping
    pub fn read_mapping(&self, handle: MappingHandle, offset: usize, len: usize) -> Option<Vec<u8>> {
        let (mem, start) = self.resolve_mapping(handle)?;
        let mut buf = vec![0; len];
        mem.read(start + offset, &mut buf);
        Some(buf)
    }

    /// Write through a live mapping; returns false if the mapping is gone
    pub fn write_mapping(&self, handle: MappingHandle, offset: usize, data: &[u8]) -> bool {
        match self.resolve_mapping(handle) {
            Some((mem, start)) => {
                mem.write(start + offset, data);
                true
            }
            None => false,
        }
    }

    fn resolve_mapping(&self, handle: MappingHandle) -> Option<(Arc<MockIoMem>, usize)> {
        let state = self.lock();
        let mapping = state.mappings.get(&handle.0)?;
        let mem = state
            .memories
            .values()
            .find(|m| m.contains(mapping.pbase, mapping.size))?;
        Some((Arc::clone(mem), (mapping.pbase - mem.pbase) as usize))
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InterruptController for MockPlatform {
    fn request_irq(&self, irq: u32, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.irq_fail || state.irq_claimed.is_some() {
            return Err(Hw3dError::Platform(format!(
                "irq {} unavailable for {}",
                irq, name
            )));
        }
        state.irq_claimed = Some(irq);
        state.irq_masked = false;
        Ok(())
    }

    fn free_irq(&self, irq: u32) {
        let mut state = self.lock();
        if state.irq_claimed == Some(irq) {
            state.irq_claimed = None;
        }
    }

    fn enable_irq(&self, _irq: u32) {
        let mut state = self.lock();
        state.irq_masked = false;
        state.irq_enable_calls += 1;
    }

    fn disable_irq_nosync(&self, _irq: u32) {
        self.lock().irq_masked = true;
    }
}

impl ClockControl for MockPlatform {
    fn clk_get(&self, name: &str) -> Result<ClockId> {
        let mut state = self.lock();
        if state.missing_clocks.contains(name) {
            return Err(Hw3dError::NotFound {
                resource: name.to_string(),
            });
        }

        let index = match state.clocks.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                state.clocks.push(MockClock {
                    name: name.to_string(),
                    gets: 0,
                    refcount: 0,
                });
                state.clocks.len() - 1
            }
        };
        state.clocks[index].gets += 1;
        Ok(ClockId(index as u32))
    }

    fn clk_put(&self, clk: ClockId) {
        if let Some(clock) = self.lock().clocks.get_mut(clk.0 as usize) {
            clock.gets = clock.gets.saturating_sub(1);
        }
    }

    fn clk_enable(&self, clk: ClockId) {
        if let Some(clock) = self.lock().clocks.get_mut(clk.0 as usize) {
            clock.refcount += 1;
        }
    }

    fn clk_disable(&self, clk: ClockId) {
        if let Some(clock) = self.lock().clocks.get_mut(clk.0 as usize) {
            clock.refcount -= 1;
        }
    }
}

impl MemoryMapper for MockPlatform {
    fn ioremap(&self, pbase: u64, size: usize) -> Result<Arc<dyn IoMem>> {
        let mut state = self.lock();
        if state.ioremap_fail.contains(&pbase) {
            return Err(Hw3dError::Platform(format!("cannot ioremap {:#x}", pbase)));
        }

        let mem = Arc::clone(
            state
                .memories
                .entry(pbase)
                .or_insert_with(|| Arc::new(MockIoMem::new(pbase, size))),
        );
        state.ioremapped += 1;
        Ok(mem)
    }

    fn iounmap(&self, _mem: &Arc<dyn IoMem>) {
        let mut state = self.lock();
        state.ioremapped = state.ioremapped.saturating_sub(1);
    }

    fn map_into(&self, pid: Pid, pbase: u64, size: usize) -> Result<MappingHandle> {
        let mut state = self.lock();
        if state.map_fail {
            return Err(Hw3dError::Platform("remap_pfn_range failed".into()));
        }
        if !state.memories.values().any(|m| m.contains(pbase, size)) {
            return Err(Hw3dError::Platform(format!(
                "no memory at {:#x}+{:#x}",
                pbase, size
            )));
        }

        state.next_mapping += 1;
        let handle = state.next_mapping;
        state.mappings.insert(handle, MockMapping { pid, pbase, size });
        Ok(MappingHandle(handle))
    }

    fn unmap(&self, handle: MappingHandle) {
        self.lock().mappings.remove(&handle.0);
    }

    fn zap(&self, handle: MappingHandle) {
        self.lock().zapped.push(handle);
    }
}

impl TaskControl for MockPlatform {
    fn get_task(&self, pid: Pid) {
        *self.lock().pinned.entry(pid).or_insert(0) += 1;
    }

    fn put_task(&self, pid: Pid) {
        let mut state = self.lock();
        if let Some(count) = state.pinned.get_mut(&pid) {
            *count -= 1;
            if *count == 0 {
                state.pinned.remove(&pid);
            }
        }
    }

    fn terminate(&self, pid: Pid) -> Result<()> {
        let mut state = self.lock();
        if state.unkillable.contains(&pid) {
            return Err(Hw3dError::Platform(format!("no such process {}", pid)));
        }
        state.terminated.push(pid);
        Ok(())
    }
}

impl WakeLock for MockPlatform {
    fn wake_lock(&self) {
        let mut state = self.lock();
        state.wake_locked = true;
        state.wake_lock_count += 1;
    }

    fn wake_unlock(&self) {
        self.lock().wake_locked = false;
    }
}

impl DeviceNodes for MockPlatform {
    fn register_node(&self, name: &str) -> Result<NodeId> {
        let mut state = self.lock();
        if state.node_fail.as_deref() == Some(name) {
            return Err(Hw3dError::Platform(format!("cannot register {}", name)));
        }

        state.next_node += 1;
        let node = NodeId(state.next_node);
        state.nodes.push((node, name.to_string()));
        Ok(node)
    }

    fn deregister_node(&self, node: NodeId) {
        self.lock().nodes.retain(|(id, _)| *id != node);
    }
}
