//! hw3d - Register/interrupt arbitration for the MSM 3D core
//!
//! # Purpose
//! The 3D core is driven from user space. A privileged master process and a
//! single client process share it; this crate decides who may touch the
//! registers and memory windows at any moment, relays the GPU interrupt to
//! the owner, and takes the hardware back from a client that will not let go.
//!
//! # Integration Points
//! - Depends on: interrupt controller, clock gating, memory mapping, task
//!   registry, wake lock, device nodes (all behind [`Platform`])
//! - Provides to: the user-space 3D library (master and client endpoints)
//! - Capabilities required: the REGS/SMI/EBI memory resources and one IRQ line
//!
//! # Architecture
//! One [`Hw3d`] per probed device. All arbitration state lives in a single
//! mutex-protected `DeviceState` with three condition variables
//! (interrupt, revoke requested, revoke done). Revocation is cooperative
//! first: the owner is asked to release, and a deadline timer running on its
//! own worker thread kills the owner if it does not. Both paths converge on
//! one idempotent completion routine.
//!
//! # Testing Strategy
//! - Unit tests: region table, flags, timer worker, each state transition
//! - Integration tests: hand-off, forced revoke, coalescing, suspend scenarios
//!   against [`mock::MockPlatform`]

mod config;
mod device;
mod irq;
mod mmap;
mod platform;
mod region;
mod revoke;
mod state;
mod timer;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::Hw3dConfig;
pub use device::{Hw3d, Hw3dCommand, Hw3dFile, IoctlReply, Role};
pub use mmap::Mapping;
pub use platform::{
    ClockControl, ClockId, DeviceNodes, InterruptController, IoMem, MappingHandle, MemoryMapper,
    NodeId, Pid, Platform, TaskControl, WakeLock,
};
pub use region::{
    MemRegion, PlatformResources, RegionId, RegionInfo, RegionTable, Resource, NUM_REGIONS,
    PAGE_SIZE, REGION_SHIFT, REGS_LEN,
};
pub use state::{AccessState, CompletionReason, DeviceFlags, Hw3dStatus, Signal};

use thiserror::Error;

/// Error types for hw3d operations
#[derive(Debug, Error)]
pub enum Hw3dError {
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: &'static str },

    #[error("Device busy: {reason}")]
    Busy { reason: &'static str },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Wait interrupted by signal")]
    Interrupted,

    #[error("Handle closed while waiting")]
    EndOfStream,

    #[error("Platform error: {0}")]
    Platform(String),
}

impl Hw3dError {
    /// Linux errno the driver returns for this error (positive value)
    pub fn errno(&self) -> i32 {
        match self {
            Hw3dError::InvalidArgument { .. } => 22, // EINVAL
            Hw3dError::PermissionDenied { .. } => 1, // EPERM
            Hw3dError::Busy { .. } => 16,            // EBUSY
            Hw3dError::NotFound { .. } => 19,        // ENODEV
            Hw3dError::Interrupted => 4,             // EINTR
            Hw3dError::EndOfStream => 32,            // EPIPE
            Hw3dError::Platform(_) => 11,            // EAGAIN
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Hw3dError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = core::result::Result<T, Hw3dError>;
