//! Revoke Protocol - Taking the GPU away from its owner
//!
//! A revoke starts when another client opens the device or the system
//! suspends. The owner is woken from [`Hw3d::wait_for_revoke`], a wake lock
//! is taken and a deadline is armed. The revoke then ends one of two ways:
//!
//! - **Cooperative**: the owner releases its handle before the deadline.
//! - **Forced**: the deadline fires first. The owner is killed, its mappings
//!   are pulled and the GPU is handed back.
//!
//! Both paths end in [`Hw3d::complete_revoke_locked`], which runs under the
//! state lock and is a no-op for whichever path loses the race.

use crate::device::{Hw3d, Hw3dFile};
use crate::platform::{Pid, Platform};
use crate::state::{CompletionReason, DeviceFlags, DeviceState, Signal};
use crate::{Hw3dError, Result};

impl<P: Platform> Hw3d<P> {
    /// Block until the owner is asked to give up the GPU
    ///
    /// # Errors
    /// - `PermissionDenied` on a master handle
    /// - `EndOfStream` if the handle is being closed
    /// - `Interrupted` if `pid` is signalled while waiting
    pub fn wait_for_revoke(&self, file: &Hw3dFile, pid: Pid) -> Result<()> {
        if file.is_master() {
            log::error!("hw3d: cannot wait for revoke on master node");
            return Err(Hw3dError::PermissionDenied {
                reason: "wait for revoke on master node",
            });
        }

        let mut state = self.lock_state();
        loop {
            if file.is_closing() {
                return Err(Hw3dError::EndOfStream);
            }
            if state.flags.contains(DeviceFlags::REVOKING) {
                return Ok(());
            }
            if state.take_signal(pid) {
                return Err(Hw3dError::Interrupted);
            }
            state = self.wait(&self.revoke_wq, state);
        }
    }

    /// Ask the owner to release the GPU and (re)arm the deadline
    pub(crate) fn request_revoke_locked(&self, state: &mut DeviceState) {
        if !state.flags.contains(DeviceFlags::WAKE_LOCKED) {
            self.platform.wake_lock();
            state.flags.insert(DeviceFlags::WAKE_LOCKED);
        }

        state.flags.insert(DeviceFlags::REVOKING);
        self.revoke_wq.notify_all();

        let generation = state.arm_revoke_timer();
        self.timer.arm(generation, self.config.revoke_timeout());
        log::debug!(
            "hw3d: revoke requested, deadline {:?} (generation {})",
            self.config.revoke_timeout(),
            generation
        );
    }

    /// Deadline worker callback
    pub(crate) fn revoke_timer_expired(&self, generation: u64) {
        let mut state = self.lock_state();

        if state.revoke_timer != Some(generation) {
            log::debug!("hw3d: stale revoke deadline {} ignored", generation);
            return;
        }
        state.revoke_timer = None;

        log::debug!("hw3d: revoke deadline passed, forcing");
        self.complete_revoke_locked(&mut state, CompletionReason::ForcedTimeout);
    }

    /// Finish a revoke; idempotent
    ///
    /// Returns the device to idle: owner dropped, clocks off, line masked,
    /// deadline cancelled, wake lock released and open waiters woken.
    pub(crate) fn complete_revoke_locked(
        &self,
        state: &mut DeviceState,
        reason: CompletionReason,
    ) {
        if reason == CompletionReason::ForcedTimeout {
            self.disable_irq_locked(state);
        }

        if let Some(client) = state.client.take() {
            if reason == CompletionReason::ForcedTimeout {
                log::info!("hw3d: force revoke from pid={}", client.pid);
                if let Err(e) = self.platform.terminate(client.pid) {
                    log::warn!("hw3d: cannot kill pid {}: {}", client.pid, e);
                }
                state.post_signal(client.pid, Signal::Kill);
                self.unmap_all_locked(state, &client.file);
            }
            if client.task_pinned {
                self.platform.put_task(client.pid);
            }
        }

        if state.flags.contains(DeviceFlags::HW_ENABLED) {
            state.flags.remove(DeviceFlags::HW_ENABLED);
            self.disable_clocks();
        }

        state.flags.remove(DeviceFlags::REVOKING);
        self.disable_irq_locked(state);

        if let Some(generation) = state.revoke_timer.take() {
            self.timer.cancel(generation);
        }

        if state.flags.contains(DeviceFlags::WAKE_LOCKED) {
            state.flags.remove(DeviceFlags::WAKE_LOCKED);
            self.platform.wake_unlock();
        }

        self.revoke_done_wq.notify_all();
        if reason == CompletionReason::ForcedTimeout {
            // The killed owner may still be parked in a wait
            self.revoke_wq.notify_all();
            self.irq_wq.notify_all();
        }
    }
}
