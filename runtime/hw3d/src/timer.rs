//! Revoke Timer - Deadline worker for forced revocation
//!
//! A single worker thread owns the deadline. Callers arm and cancel it by
//! generation over a channel; the worker sleeps on whichever comes first,
//! the next command or the deadline, and calls the expiry callback with the
//! generation that fired. The callback decides whether that generation is
//! still current, so a cancel racing an expiry is harmless.

use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{after, never, unbounded, Receiver, Sender};

use crate::{Hw3dError, Result};

enum TimerCmd {
    Arm { generation: u64, deadline: Instant },
    Cancel { generation: u64 },
    Shutdown,
}

pub(crate) struct RevokeTimer {
    tx: Sender<TimerCmd>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl RevokeTimer {
    /// Start the worker thread
    ///
    /// # Errors
    /// Returns `Platform` if the thread cannot be spawned
    pub fn spawn<F>(name: &str, on_expire: F) -> Result<Self>
    where
        F: Fn(u64) + Send + 'static,
    {
        let (tx, rx) = unbounded();

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(rx, on_expire))
            .map_err(|e| Hw3dError::Platform(format!("cannot start revoke timer: {}", e)))?;
        let worker_id = worker.thread().id();

        Ok(Self {
            tx,
            worker: Some(worker),
            worker_id,
        })
    }

    /// Arm (or re-arm) the deadline for `generation`
    pub fn arm(&self, generation: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let _ = self.tx.send(TimerCmd::Arm {
            generation,
            deadline,
        });
    }

    /// Drop the deadline if it still belongs to `generation`
    pub fn cancel(&self, generation: u64) {
        let _ = self.tx.send(TimerCmd::Cancel { generation });
    }
}

impl Drop for RevokeTimer {
    fn drop(&mut self) {
        let _ = self.tx.send(TimerCmd::Shutdown);

        // The last device reference can be dropped by the expiry callback
        // itself; the worker then exits on its own.
        if let Some(worker) = self.worker.take() {
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}

fn run<F: Fn(u64)>(rx: Receiver<TimerCmd>, on_expire: F) {
    let mut pending: Option<(u64, Instant)> = None;

    loop {
        let expiry = match pending {
            Some((_, deadline)) => after(deadline.saturating_duration_since(Instant::now())),
            None => never(),
        };

        crossbeam::select! {
            recv(rx) -> cmd => match cmd {
                Ok(TimerCmd::Arm { generation, deadline }) => {
                    pending = Some((generation, deadline));
                }
                Ok(TimerCmd::Cancel { generation }) => {
                    if matches!(pending, Some((armed, _)) if armed == generation) {
                        pending = None;
                    }
                }
                Ok(TimerCmd::Shutdown) | Err(_) => break,
            },
            recv(expiry) -> _ => {
                if let Some((generation, _)) = pending.take() {
                    on_expire(generation);
                }
            }
        }
    }
}
