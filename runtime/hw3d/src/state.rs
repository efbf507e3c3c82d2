//! Device State - The single lock-protected arbitration state
//!
//! Everything the master, the client, the IRQ handler and the revoke timer
//! need to agree on lives in [`DeviceState`], behind one mutex. The
//! operations in `device`, `irq`, `revoke` and `mmap` take that lock, look
//! at these fields, and release it before blocking.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::device::{FileId, Hw3dFile};
use crate::platform::Pid;
use crate::region::NUM_REGIONS;

bitflags! {
    /// Device state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u8 {
        /// The GPU interrupt line is unmasked
        const IRQ_ENABLED = 1 << 0;
        /// An interrupt arrived and has not been consumed by a waiter
        const IRQ_PENDING = 1 << 1;
        /// The owner has been asked to release the GPU
        const REVOKING = 1 << 2;
        /// The system is entering suspend
        const SUSPENDING = 1 << 3;
        /// Clocks are on for the current owner
        const HW_ENABLED = 1 << 4;
        /// The revoke wake lock is held
        const WAKE_LOCKED = 1 << 5;
    }
}

/// Position in the ownership state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    /// No client owns the GPU
    Idle,
    /// A client owns the GPU
    Owned,
    /// A client owns the GPU and has been asked to release it
    Revoking,
}

/// Why the current owner lost the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The owner released its handle
    Cooperative,
    /// The revoke deadline expired first
    ForcedTimeout,
}

/// Cancellation delivered to a process's blocking calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Abort the next blocking call; consumed by it
    Interrupt,
    /// The process is being killed; every blocking call aborts
    Kill,
}

/// Snapshot of the device state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hw3dStatus {
    pub state: AccessState,
    pub owner: Option<Pid>,
    pub flags: DeviceFlags,
    pub open_waiters: usize,
}

impl Hw3dStatus {
    pub fn irq_enabled(&self) -> bool {
        self.flags.contains(DeviceFlags::IRQ_ENABLED)
    }

    pub fn irq_pending(&self) -> bool {
        self.flags.contains(DeviceFlags::IRQ_PENDING)
    }

    pub fn hw_enabled(&self) -> bool {
        self.flags.contains(DeviceFlags::HW_ENABLED)
    }

    pub fn suspending(&self) -> bool {
        self.flags.contains(DeviceFlags::SUSPENDING)
    }

    pub fn wake_locked(&self) -> bool {
        self.flags.contains(DeviceFlags::WAKE_LOCKED)
    }
}

/// The client currently owning the GPU
pub(crate) struct ClientRef {
    pub file: Arc<Hw3dFile>,
    pub pid: Pid,
    /// A task reference is held through `get_task`
    pub task_pinned: bool,
}

pub(crate) struct DeviceState {
    pub flags: DeviceFlags,
    pub client: Option<ClientRef>,
    /// Generation of the armed revoke deadline
    pub revoke_timer: Option<u64>,
    pub next_timer_generation: u64,
    /// Handle holding each region mapped
    pub region_holders: [Option<FileId>; NUM_REGIONS],
    pub signals: HashMap<Pid, Signal>,
    /// Handles (open or being opened) per process
    pub handles: HashMap<Pid, usize>,
    pub open_waiters: usize,
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            flags: DeviceFlags::empty(),
            client: None,
            revoke_timer: None,
            next_timer_generation: 0,
            region_holders: [None; NUM_REGIONS],
            signals: HashMap::new(),
            handles: HashMap::new(),
            open_waiters: 0,
        }
    }

    pub fn access_state(&self) -> AccessState {
        match (&self.client, self.flags.contains(DeviceFlags::REVOKING)) {
            (None, _) => AccessState::Idle,
            (Some(_), false) => AccessState::Owned,
            (Some(_), true) => AccessState::Revoking,
        }
    }

    pub fn owner_pid(&self) -> Option<Pid> {
        self.client.as_ref().map(|c| c.pid)
    }

    pub fn is_owner(&self, file: &Hw3dFile) -> bool {
        self.client.as_ref().is_some_and(|c| c.file.id() == file.id())
    }

    /// Check for a cancellation aimed at `pid`, consuming an `Interrupt`
    pub fn take_signal(&mut self, pid: Pid) -> bool {
        match self.signals.get(&pid) {
            Some(Signal::Interrupt) => {
                self.signals.remove(&pid);
                true
            }
            Some(Signal::Kill) => true,
            None => false,
        }
    }

    /// Record a signal; a pending kill is never downgraded
    pub fn post_signal(&mut self, pid: Pid, signal: Signal) {
        let entry = self.signals.entry(pid).or_insert(signal);
        if signal == Signal::Kill {
            *entry = Signal::Kill;
        }
    }

    pub fn add_handle(&mut self, pid: Pid) {
        *self.handles.entry(pid).or_insert(0) += 1;
    }

    /// Forget one handle of `pid`; its signals go with the last one
    pub fn drop_handle(&mut self, pid: Pid) {
        if let Some(count) = self.handles.get_mut(&pid) {
            *count -= 1;
            if *count == 0 {
                self.handles.remove(&pid);
                self.signals.remove(&pid);
            }
        }
    }

    pub fn arm_revoke_timer(&mut self) -> u64 {
        self.next_timer_generation += 1;
        self.revoke_timer = Some(self.next_timer_generation);
        self.next_timer_generation
    }

    pub fn status(&self) -> Hw3dStatus {
        Hw3dStatus {
            state: self.access_state(),
            owner: self.owner_pid(),
            flags: self.flags,
            open_waiters: self.open_waiters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_idle() {
        let state = DeviceState::new();
        assert_eq!(state.access_state(), AccessState::Idle);
        assert_eq!(state.owner_pid(), None);
        assert!(state.flags.is_empty());
        assert!(state.region_holders.iter().all(Option::is_none));
    }

    #[test]
    fn test_interrupt_signal_consumed_once() {
        let mut state = DeviceState::new();
        state.post_signal(Pid(7), Signal::Interrupt);

        assert!(state.take_signal(Pid(7)));
        assert!(!state.take_signal(Pid(7)));
        assert!(!state.take_signal(Pid(8)));
    }

    #[test]
    fn test_kill_signal_sticky() {
        let mut state = DeviceState::new();
        state.post_signal(Pid(7), Signal::Kill);
        state.post_signal(Pid(7), Signal::Interrupt);

        assert!(state.take_signal(Pid(7)));
        assert!(state.take_signal(Pid(7)));
        assert_eq!(state.signals.get(&Pid(7)), Some(&Signal::Kill));
    }

    #[test]
    fn test_signals_dropped_with_last_handle() {
        let mut state = DeviceState::new();
        state.add_handle(Pid(7));
        state.add_handle(Pid(7));
        state.post_signal(Pid(7), Signal::Kill);

        state.drop_handle(Pid(7));
        assert_eq!(state.signals.get(&Pid(7)), Some(&Signal::Kill));

        state.drop_handle(Pid(7));
        assert!(state.signals.is_empty());
        assert!(state.handles.is_empty());

        // Unknown pids are ignored
        state.drop_handle(Pid(8));
    }

    #[test]
    fn test_timer_generations_increase() {
        let mut state = DeviceState::new();
        let first = state.arm_revoke_timer();
        let second = state.arm_revoke_timer();

        assert!(second > first);
        assert_eq!(state.revoke_timer, Some(second));
    }

    #[test]
    fn test_status_flag_helpers() {
        let mut state = DeviceState::new();
        state.flags |= DeviceFlags::IRQ_ENABLED | DeviceFlags::SUSPENDING;

        let status = state.status();
        assert!(status.irq_enabled());
        assert!(status.suspending());
        assert!(!status.hw_enabled());
        assert!(!status.irq_pending());
    }
}
