//! IRQ Relay - Forwarding GPU interrupts to a user-space waiter
//!
//! The line is only unmasked while someone is waiting. Each interrupt masks
//! the line again and sets one pending flag, so a burst of interrupts before
//! the waiter runs is seen as a single event.
//!
//! # Flow
//! 1. Waiter takes the state lock; if nothing is pending it unmasks the line
//!    and sleeps on the IRQ queue.
//! 2. Handler masks the line, sets `IRQ_PENDING` and wakes the queue.
//! 3. Waiter consumes the flag and returns.

use crate::device::{Hw3d, Hw3dFile};
use crate::platform::{Pid, Platform};
use crate::state::{DeviceFlags, DeviceState};
use crate::{Hw3dError, Result};

impl<P: Platform> Hw3d<P> {
    /// GPU interrupt handler
    pub fn handle_irq(&self) {
        let mut state = self.lock_state();
        self.disable_irq_locked(&mut state);
        state.flags.insert(DeviceFlags::IRQ_PENDING);
        self.irq_wq.notify_all();
    }

    /// Block until the next GPU interrupt, consuming it
    ///
    /// # Errors
    /// - `Interrupted` if `pid` is signalled while waiting
    /// - `EndOfStream` if the handle is being closed
    ///
    /// The line is masked again on both error paths.
    pub fn wait_for_interrupt(&self, file: &Hw3dFile, pid: Pid) -> Result<()> {
        let mut state = self.lock_state();

        loop {
            if state.flags.contains(DeviceFlags::IRQ_PENDING) {
                state.flags.remove(DeviceFlags::IRQ_PENDING);
                return Ok(());
            }

            if state.take_signal(pid) {
                self.disable_irq_locked(&mut state);
                return Err(Hw3dError::Interrupted);
            }

            if file.is_closing() {
                self.disable_irq_locked(&mut state);
                return Err(Hw3dError::EndOfStream);
            }

            self.enable_irq_locked(&mut state);
            state = self.wait(&self.irq_wq, state);
        }
    }

    pub(crate) fn enable_irq_locked(&self, state: &mut DeviceState) {
        if !state.flags.contains(DeviceFlags::IRQ_ENABLED) {
            state.flags.insert(DeviceFlags::IRQ_ENABLED);
            self.platform.enable_irq(self.irq);
        }
    }

    pub(crate) fn disable_irq_locked(&self, state: &mut DeviceState) {
        if state.flags.contains(DeviceFlags::IRQ_ENABLED) {
            self.platform.disable_irq_nosync(self.irq);
            state.flags.remove(DeviceFlags::IRQ_ENABLED);
        }
    }
}
