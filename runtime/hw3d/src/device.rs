//! Access Gate - Device lifecycle and ownership of the 3D core
//!
//! Two endpoints share one operation set. Opening the master endpoint always
//! succeeds. Opening the client endpoint makes the caller the single owner
//! of the GPU, revoking the previous owner first if there is one.
//!
//! # State machine
//! - `Idle` → `Owned`: client open with no owner
//! - `Owned` → `Revoking`: another client open, or suspend
//! - `Owned`/`Revoking` → `Idle`: owner release, or revoke deadline expiry
//!
//! A new opener always preempts the current owner instead of queueing
//! behind it. A client that keeps getting preempted can starve; that is the
//! accepted price for handing the GPU to the newest requester quickly.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::config::Hw3dConfig;
use crate::platform::{ClockId, MappingHandle, NodeId, Pid, Platform};
use crate::region::{PlatformResources, RegionId, RegionInfo, RegionTable, NUM_REGIONS, REGS_LEN};
use crate::state::{ClientRef, CompletionReason, DeviceFlags, DeviceState, Hw3dStatus, Signal};
use crate::timer::RevokeTimer;
use crate::{Hw3dError, Result};

pub(crate) type FileId = u64;

/// Which endpoint a handle was opened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Privileged path, bypasses ownership
    Master,
    /// Arbitrated single-owner path
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Control sub-commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hw3dCommand {
    /// Map the register window into the caller's pmem area and power up
    GrantGpu,
    /// Undo [`Hw3dCommand::GrantGpu`]
    RevokeGpu,
    /// Block until the owner is asked to release the GPU
    WaitForRevoke,
    /// Block until the next (coalesced) GPU interrupt
    WaitForInterrupt,
    /// Describe every region
    GetRegions,
}

/// Result of a control call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    Regions(Vec<RegionInfo>),
}

/// Per-open handle
pub struct Hw3dFile {
    id: FileId,
    role: Role,
    pid: Pid,
    closing: AtomicBool,
    released: AtomicBool,
    vmas: Mutex<[Option<MappingHandle>; NUM_REGIONS]>,
}

impl Hw3dFile {
    fn new(id: FileId, role: Role, pid: Pid) -> Self {
        Self {
            id,
            role,
            pid,
            closing: AtomicBool::new(false),
            released: AtomicBool::new(false),
            vmas: Mutex::new([None; NUM_REGIONS]),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Process that opened the handle
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Mapping this handle holds for `region`, if any
    pub fn mapped(&self, region: RegionId) -> Option<MappingHandle> {
        self.lock_vmas()[region.index()]
    }

    pub(crate) fn lock_vmas(&self) -> MutexGuard<'_, [Option<MappingHandle>; NUM_REGIONS]> {
        self.vmas.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(Hw3dError::invalid("handle already released"));
        }
        Ok(())
    }
}

impl fmt::Debug for Hw3dFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hw3dFile")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("pid", &self.pid)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// pmem grant bookkeeping, guarded separately from the arbitration state
#[derive(Default)]
struct GrantState {
    granted: bool,
    file: Option<FileId>,
    mapping: Option<MappingHandle>,
}

/// The hw3d device
pub struct Hw3d<P: Platform> {
    pub(crate) platform: Arc<P>,
    pub(crate) config: Hw3dConfig,
    pub(crate) regions: RegionTable,
    pub(crate) irq: u32,
    grp_clk: ClockId,
    imem_clk: ClockId,
    master_node: NodeId,
    client_node: NodeId,
    state: Mutex<DeviceState>,
    pub(crate) irq_wq: Condvar,
    pub(crate) revoke_wq: Condvar,
    pub(crate) revoke_done_wq: Condvar,
    grant: Mutex<GrantState>,
    pub(crate) timer: RevokeTimer,
    next_file_id: AtomicU64,
}

/// Resources acquired so far during probe, released in reverse on failure
struct ProbeGuard<'a, P: Platform> {
    platform: &'a P,
    clocks: Vec<ClockId>,
    regions: RegionTable,
    nodes: Vec<NodeId>,
    irq: Option<u32>,
}

impl<'a, P: Platform> ProbeGuard<'a, P> {
    fn new(platform: &'a P) -> Self {
        Self {
            platform,
            clocks: Vec::new(),
            regions: RegionTable::empty(),
            nodes: Vec::new(),
            irq: None,
        }
    }

    /// Keep everything acquired; hands back the region table
    fn commit(mut self) -> RegionTable {
        self.clocks.clear();
        self.nodes.clear();
        self.irq = None;
        mem::replace(&mut self.regions, RegionTable::empty())
    }
}

impl<P: Platform> Drop for ProbeGuard<'_, P> {
    fn drop(&mut self) {
        if let Some(irq) = self.irq.take() {
            self.platform.free_irq(irq);
        }
        for node in self.nodes.drain(..).rev() {
            self.platform.deregister_node(node);
        }
        self.regions.unmap_all(self.platform);
        for clk in self.clocks.drain(..).rev() {
            self.platform.clk_put(clk);
        }
    }
}

impl<P: Platform> Hw3d<P> {
    /// Probe the device: claim clocks, map regions, register both endpoints
    /// and claim the interrupt line (left masked until someone waits on it)
    ///
    /// # Errors
    /// Returns `NotFound` if a resource or clock is missing,
    /// `InvalidArgument` if a region's bounds are malformed, or the
    /// platform's error if a mapping, registration or IRQ claim fails.
    /// Nothing stays acquired on failure.
    pub fn probe(
        platform: Arc<P>,
        resources: &PlatformResources,
        config: Hw3dConfig,
    ) -> Result<Arc<Self>> {
        let (resources, irq) = resources.resolve().inspect_err(|e| {
            log::error!("hw3d: incomplete resources: {}", e);
        })?;

        let mut guard = ProbeGuard::new(&*platform);

        // 1. Clocks
        let grp_clk = platform.clk_get(&config.grp_clock).inspect_err(|_| {
            log::error!("hw3d: cannot get {}", config.grp_clock);
        })?;
        guard.clocks.push(grp_clk);

        let imem_clk = platform.clk_get(&config.imem_clock).inspect_err(|_| {
            log::error!("hw3d: cannot get {}", config.imem_clock);
        })?;
        guard.clocks.push(imem_clk);

        // 2. Region table
        guard.regions = RegionTable::map(&*platform, &resources)?;

        // 3. Device nodes
        let master_node = platform.register_node(&config.master_node).inspect_err(|_| {
            log::error!("hw3d: cannot register master device node");
        })?;
        guard.nodes.push(master_node);

        let client_node = platform.register_node(&config.client_node).inspect_err(|_| {
            log::error!("hw3d: cannot register client device node");
        })?;
        guard.nodes.push(client_node);

        // 4. Interrupt line, masked until the first waiter
        platform.request_irq(irq, &config.irq_name).inspect_err(|_| {
            log::error!("hw3d: cannot request irq {}", irq);
        })?;
        guard.irq = Some(irq);
        platform.disable_irq_nosync(irq);

        // 5. Revoke deadline worker
        let target: Arc<OnceLock<Weak<Hw3d<P>>>> = Arc::new(OnceLock::new());
        let timer_target = Arc::clone(&target);
        let timer = RevokeTimer::spawn("hw3d-revoke", move |generation| {
            if let Some(hw3d) = timer_target.get().and_then(Weak::upgrade) {
                hw3d.revoke_timer_expired(generation);
            }
        })?;

        let regions = guard.commit();

        let hw3d = Arc::new(Self {
            platform,
            config,
            regions,
            irq,
            grp_clk,
            imem_clk,
            master_node,
            client_node,
            state: Mutex::new(DeviceState::new()),
            irq_wq: Condvar::new(),
            revoke_wq: Condvar::new(),
            revoke_done_wq: Condvar::new(),
            grant: Mutex::new(GrantState::default()),
            timer,
            next_file_id: AtomicU64::new(1),
        });
        let _ = target.set(Arc::downgrade(&hw3d));

        log::info!(
            "hw3d: probed, irq {}, regions {:?}",
            irq,
            hw3d.regions.describe()
        );
        Ok(hw3d)
    }

    /// Open an endpoint on behalf of `pid`
    ///
    /// Opening the client endpoint while another client owns the GPU asks
    /// that owner to release it and blocks until it is gone.
    ///
    /// # Errors
    /// - `PermissionDenied` while the system is suspending, including a
    ///   suspend that starts while this call is waiting
    /// - `Busy` if another opener took the GPU first after the old owner left
    /// - `Interrupted` if a signal arrives while waiting, or if the caller's
    ///   own process was killed by the revoke it was waiting on; nothing
    ///   changes
    pub fn open(&self, role: Role, pid: Pid) -> Result<Arc<Hw3dFile>> {
        log::info!("hw3d: pid {} opening {} node", pid, role);

        let id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let file = Arc::new(Hw3dFile::new(id, role, pid));

        let mut state = self.lock_state();
        state.add_handle(pid);

        // Master always succeeds
        if role == Role::Master {
            return Ok(file);
        }

        let acquired = 'acquire: {
            if state.flags.contains(DeviceFlags::SUSPENDING) {
                log::warn!("hw3d: can't open client node while suspending");
                break 'acquire Err(Hw3dError::PermissionDenied {
                    reason: "system is suspending",
                });
            }

            let Some(previous) = state.client.as_ref().map(|c| c.file.id()) else {
                break 'acquire Ok(());
            };

            log::debug!("hw3d: have client, need revoke");
            self.request_revoke_locked(&mut state);

            state.open_waiters += 1;
            while state
                .client
                .as_ref()
                .is_some_and(|c| c.file.id() == previous)
            {
                if state.take_signal(pid) {
                    state.open_waiters -= 1;
                    break 'acquire Err(Hw3dError::Interrupted);
                }
                state = self.wait(&self.revoke_done_wq, state);
            }
            state.open_waiters -= 1;

            // The deadline killed our own process while we waited
            if state.signals.get(&pid) == Some(&Signal::Kill) {
                log::warn!("hw3d: pid {} was killed while opening", pid);
                break 'acquire Err(Hw3dError::Interrupted);
            }

            if state.flags.contains(DeviceFlags::SUSPENDING) {
                log::warn!("hw3d: suspend started while pid {} was opening", pid);
                break 'acquire Err(Hw3dError::PermissionDenied {
                    reason: "system is suspending",
                });
            }

            // Someone else got in between the old owner leaving and us
            // waking up; let them have it
            if state.client.is_some() {
                break 'acquire Err(Hw3dError::Busy {
                    reason: "lost race for the gpu",
                });
            }

            Ok(())
        };

        if let Err(e) = acquired {
            state.drop_handle(pid);
            return Err(e);
        }

        self.platform.get_task(pid);
        state.client = Some(ClientRef {
            file: Arc::clone(&file),
            pid,
            task_pinned: true,
        });

        self.platform.clk_enable(self.imem_clk);
        self.platform.clk_enable(self.grp_clk);
        state.flags.insert(DeviceFlags::HW_ENABLED);

        log::debug!("hw3d: pid {} owns the gpu", pid);
        Ok(file)
    }

    /// First stage of close: wake this handle's blocked calls
    pub fn flush(&self, file: &Hw3dFile) {
        if file.is_master() {
            return;
        }

        log::debug!("hw3d: closing handle {}", file.id());
        file.closing.store(true, Ordering::SeqCst);

        let _state = self.lock_state();
        self.revoke_wq.notify_all();
        self.irq_wq.notify_all();
    }

    /// Final close: drop mappings and grants, give up ownership
    pub fn release(&self, file: &Hw3dFile) {
        if file.released.swap(true, Ordering::SeqCst) {
            return;
        }

        self.release_grant(file);

        let mut state = self.lock_state();
        self.unmap_all_locked(&mut state, file);
        state.drop_handle(file.pid());

        if file.is_master() {
            return;
        }

        log::info!("hw3d: release for pid={}", file.pid());

        if state.is_owner(file) {
            log::debug!("hw3d: releasing owner handle {}", file.id());
            self.complete_revoke_locked(&mut state, CompletionReason::Cooperative);
        } else {
            log::warn!("hw3d: release without client file");
        }
    }

    /// Control call
    ///
    /// # Errors
    /// Whatever the sub-command returns; `InvalidArgument` on a released
    /// handle
    pub fn ioctl(&self, file: &Hw3dFile, pid: Pid, cmd: Hw3dCommand) -> Result<IoctlReply> {
        file.check_live()?;

        match cmd {
            Hw3dCommand::RevokeGpu => self.revoke_gpu(file).map(|_| IoctlReply::Done),
            Hw3dCommand::GrantGpu => self.grant_gpu(file, pid).map(|_| IoctlReply::Done),
            Hw3dCommand::WaitForRevoke => {
                self.wait_for_revoke(file, pid).map(|_| IoctlReply::Done)
            }
            Hw3dCommand::WaitForInterrupt => {
                self.wait_for_interrupt(file, pid).map(|_| IoctlReply::Done)
            }
            Hw3dCommand::GetRegions => Ok(IoctlReply::Regions(self.regions.describe())),
        }
    }

    /// Map the register window into the caller and power the core
    ///
    /// # Errors
    /// Returns `Busy` if the GPU is already granted, or the mapper's error
    pub fn grant_gpu(&self, file: &Hw3dFile, pid: Pid) -> Result<()> {
        let mut grant = self.lock_grant();
        if grant.granted {
            return Err(Hw3dError::Busy {
                reason: "gpu already granted",
            });
        }

        let regs = self.regions.get(RegionId::Regs);
        let mapping = self.platform.map_into(pid, regs.pbase, REGS_LEN)?;

        self.platform.clk_enable(self.grp_clk);
        self.platform.clk_enable(self.imem_clk);

        *grant = GrantState {
            granted: true,
            file: Some(file.id()),
            mapping: Some(mapping),
        };
        log::debug!("hw3d: gpu granted to handle {}", file.id());
        Ok(())
    }

    /// Pull the register window and power the core down
    pub fn revoke_gpu(&self, file: &Hw3dFile) -> Result<()> {
        let mut grant = self.lock_grant();
        if !grant.granted {
            return Ok(());
        }

        self.drop_grant_locked(&mut grant);
        log::debug!("hw3d: gpu grant revoked by handle {}", file.id());
        Ok(())
    }

    fn release_grant(&self, file: &Hw3dFile) {
        let mut grant = self.lock_grant();
        if grant.granted && grant.file == Some(file.id()) {
            self.drop_grant_locked(&mut grant);
        }
    }

    fn drop_grant_locked(&self, grant: &mut GrantState) {
        if let Some(mapping) = grant.mapping.take() {
            self.platform.unmap(mapping);
        }
        self.platform.clk_disable(self.grp_clk);
        self.platform.clk_disable(self.imem_clk);
        grant.granted = false;
        grant.file = None;
    }

    /// Suspend entry: refuse new owners and ask the current one to leave
    pub fn suspend(&self) {
        let mut state = self.lock_state();
        state.flags.insert(DeviceFlags::SUSPENDING);

        if state.client.is_some() && !state.flags.contains(DeviceFlags::REVOKING) {
            log::info!("hw3d: suspending, revoking gpu");
            self.request_revoke_locked(&mut state);
        }
    }

    pub fn resume(&self) {
        let mut state = self.lock_state();
        if state.flags.contains(DeviceFlags::SUSPENDING) {
            log::info!("hw3d: resuming");
        }
        state.flags.remove(DeviceFlags::SUSPENDING);
    }

    /// Deliver a cancellation to every blocking call made by `pid`
    ///
    /// A process holding no handle cannot be blocked here, so the signal is
    /// dropped.
    pub fn send_signal(&self, pid: Pid, signal: Signal) {
        let mut state = self.lock_state();
        if !state.handles.contains_key(&pid) {
            log::debug!("hw3d: pid {} holds no handle, {:?} dropped", pid, signal);
            return;
        }
        state.post_signal(pid, signal);
        self.irq_wq.notify_all();
        self.revoke_wq.notify_all();
        self.revoke_done_wq.notify_all();
    }

    pub fn status(&self) -> Hw3dStatus {
        self.lock_state().status()
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn config(&self) -> &Hw3dConfig {
        &self.config
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub(crate) fn disable_clocks(&self) {
        self.platform.clk_disable(self.grp_clk);
        self.platform.clk_disable(self.imem_clk);
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block on `cv`, giving up the state lock while asleep
    pub(crate) fn wait<'a>(
        &self,
        cv: &Condvar,
        state: MutexGuard<'a, DeviceState>,
    ) -> MutexGuard<'a, DeviceState> {
        cv.wait(state).unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_grant(&self) -> MutexGuard<'_, GrantState> {
        self.grant.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: Platform> Drop for Hw3d<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);

        if let Some(client) = state.client.take() {
            if client.task_pinned {
                self.platform.put_task(client.pid);
            }
        }
        if state.flags.contains(DeviceFlags::HW_ENABLED) {
            self.platform.clk_disable(self.grp_clk);
            self.platform.clk_disable(self.imem_clk);
        }
        if state.flags.contains(DeviceFlags::WAKE_LOCKED) {
            self.platform.wake_unlock();
        }
        state.flags = DeviceFlags::empty();

        let grant = self.grant.get_mut().unwrap_or_else(PoisonError::into_inner);
        if grant.granted {
            if let Some(mapping) = grant.mapping.take() {
                self.platform.unmap(mapping);
            }
            self.platform.clk_disable(self.grp_clk);
            self.platform.clk_disable(self.imem_clk);
            grant.granted = false;
        }

        self.platform.free_irq(self.irq);
        self.platform.deregister_node(self.client_node);
        self.platform.deregister_node(self.master_node);
        self.regions.unmap_all(&*self.platform);
        self.platform.clk_put(self.imem_clk);
        self.platform.clk_put(self.grp_clk);
        log::info!("hw3d: removed");
    }
}
