//! Platform Capabilities - Interfaces to the subsystems hw3d sits on
//!
//! The driver never touches the interrupt controller, clocks, page tables or
//! process table directly. Each collaborator is a small trait, and a
//! [`Platform`] is anything that implements all of them. Production glue
//! forwards to the kernel; [`crate::mock::MockPlatform`] records calls for
//! tests and the simulator.

use core::fmt;
use std::sync::Arc;

use crate::Result;

/// Process identity (thread-group leader)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a named clock obtained with [`ClockControl::clk_get`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockId(pub u32);

/// Handle to a registered device node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Opaque handle to a mapping established in a caller's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingHandle(pub u64);

/// Driver-side view of a physical region (the `ioremap` result)
pub trait IoMem: Send + Sync {
    /// Size of the window in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill the whole window with `byte`
    fn fill(&self, byte: u8);

    /// Copy `buf.len()` bytes starting at `offset` into `buf`
    fn read(&self, offset: usize, buf: &mut [u8]);

    /// Copy `data` into the window starting at `offset`
    fn write(&self, offset: usize, data: &[u8]);
}

/// Interrupt controller operations for a numbered line
pub trait InterruptController: Send + Sync {
    /// Claim the line for hw3d
    ///
    /// # Errors
    /// Returns error if the line cannot be claimed
    fn request_irq(&self, irq: u32, name: &str) -> Result<()>;

    /// Give the line back
    fn free_irq(&self, irq: u32);

    fn enable_irq(&self, irq: u32);

    /// Mask the line without waiting for running handlers
    fn disable_irq_nosync(&self, irq: u32);
}

/// Clock gating
pub trait ClockControl: Send + Sync {
    /// Look up a clock by name
    ///
    /// # Errors
    /// Returns `NotFound` if the clock does not exist
    fn clk_get(&self, name: &str) -> Result<ClockId>;

    fn clk_put(&self, clk: ClockId);

    /// Enable (reference counted)
    fn clk_enable(&self, clk: ClockId);

    fn clk_disable(&self, clk: ClockId);
}

/// Memory mapping subsystem
pub trait MemoryMapper: Send + Sync {
    /// Map a physical region for driver access
    fn ioremap(&self, pbase: u64, size: usize) -> Result<Arc<dyn IoMem>>;

    fn iounmap(&self, mem: &Arc<dyn IoMem>);

    /// Map `size` bytes of physical memory at `pbase` uncached into the
    /// address space of `pid`
    ///
    /// # Errors
    /// Returns error if the page range cannot be remapped
    fn map_into(&self, pid: Pid, pbase: u64, size: usize) -> Result<MappingHandle>;

    /// Tear down a mapping created with [`MemoryMapper::map_into`]
    fn unmap(&self, handle: MappingHandle);

    /// Pull the pages out of a mapping, leaving the range faulting
    fn zap(&self, handle: MappingHandle);
}

/// Process registry
pub trait TaskControl: Send + Sync {
    /// Pin a reference to the process
    fn get_task(&self, pid: Pid);

    /// Drop a reference taken with [`TaskControl::get_task`]
    fn put_task(&self, pid: Pid);

    /// Send the process a kill signal
    ///
    /// # Errors
    /// Returns error if the process cannot be found or signalled
    fn terminate(&self, pid: Pid) -> Result<()>;
}

/// Suspend blocker held while a revoke is in flight
pub trait WakeLock: Send + Sync {
    fn wake_lock(&self);

    fn wake_unlock(&self);
}

/// Device node registration (the master and client endpoints)
pub trait DeviceNodes: Send + Sync {
    fn register_node(&self, name: &str) -> Result<NodeId>;

    fn deregister_node(&self, node: NodeId);
}

/// Everything hw3d needs from its environment
pub trait Platform:
    InterruptController + ClockControl + MemoryMapper + TaskControl + WakeLock + DeviceNodes + 'static
{
}

impl<T> Platform for T where
    T: InterruptController
        + ClockControl
        + MemoryMapper
        + TaskControl
        + WakeLock
        + DeviceNodes
        + 'static
{
}
