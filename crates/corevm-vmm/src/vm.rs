//! VM object and control plane.
//!
//! A [`Vm`] owns everything a guest needs: the hardware back end, guest
//! memory, the vCPUs, the time base, the device handler tables and the
//! optional interrupt and emulation collaborators.  It is shared as
//! `Arc<Vm>` between one control thread and one thread per vCPU.
//!
//! There is no VM-wide lock on the execution path.  Lock order, outermost
//! first:
//!
//! ```text
//!   teardown  →  vcpu.hw  →  vcpu.shared  →  { suspend | cpus | time }
//! ```
//!
//! `ports`, `mmio`, `collab` and guest memory are only ever read-locked
//! briefly and never held across another acquisition.
//!
//! Control-plane mutators hold `teardown` shared for their whole call and
//! [`Vm::destroy`] holds it exclusively, so nothing changes a VM while it is
//! being torn down and every mutator after that fails with
//! [`VmError::Destroyed`].  A vCPU thread only takes `teardown` when it
//! escalates a suspend from inside `run`, where `destroy` cannot proceed
//! because the vCPU is marked on-CPU.  No path holds two
//! vCPUs' `shared` locks except [`Vm::destroy`] and [`Vm::reinit`], which
//! take them in index order while no vCPU thread is inside `run`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{self, Backend, BackendError, BackendKind, IoDirection, Register};
use crate::exit::{EntryCommand, SuspendReason, SuspendSource, VmExit};
use crate::inject::{ExtIntSource, InjectError, LocalApic};
use crate::io::{InstructionEmulator, MmioError, MmioHandler, PortError, PortHandler, PortTable, MmioTable};
use crate::memory::{GuestMemory, MapRequest, MappingInfo, MemoryError, SegmentInfo, SegmentKind};
use crate::msr::{MtrrBank, UnhandledMsrPolicy};
use crate::stats::VcpuStats;
use crate::time::{HostClock, SystemClock, TimeBase, TimeConfig, TimeError};
use crate::vcpu::{Vcpu, VcpuError, VcpuShared, VM_MAXCPU};
use crate::verified::intinfo::{IDT_GP, IDT_PF, IDT_UD};
use crate::verified::run_state::RunState;

// ─── Configuration ───────────────────────────────────────────────────

/// Parameters fixed at VM creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub name: String,

    /// Number of vCPUs, `1..=VM_MAXCPU`.
    pub vcpus: usize,

    pub backend: BackendKind,

    pub time: TimeConfig,

    /// Suspend the VM with [`SuspendReason::Halt`] once every started vCPU
    /// has halted with interrupts disabled.
    pub halt_detection: bool,

    /// Return HLT to the caller as an exit instead of sleeping in the core.
    pub userspace_hlt: bool,

    pub msr_policy: UnhandledMsrPolicy,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "corevm".to_string(),
            vcpus: 1,
            backend: BackendKind::default(),
            time: TimeConfig::default(),
            halt_detection: true,
            userspace_hlt: false,
            msr_policy: UnhandledMsrPolicy::default(),
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum VmError {
    #[error("invalid vCPU count {0} (1..={max})", max = VM_MAXCPU)]
    InvalidVcpuCount(usize),

    #[error("vCPU {0} does not exist")]
    NoSuchVcpu(usize),

    #[error("VM is paused")]
    Paused,

    #[error("VM has been destroyed")]
    Destroyed,

    #[error("vCPU {vcpu} is being run by another thread")]
    Busy { vcpu: usize },

    #[error("vCPUs {0:?} are still inside their run loops")]
    VcpusActive(Vec<usize>),

    #[error("vCPU {vcpu} failed and cannot run until the VM is reinitialised")]
    VcpuFailed { vcpu: usize },

    #[error("VM already suspended ({reason:?} from {by:?})")]
    AlreadySuspended {
        reason: SuspendReason,
        by: SuspendSource,
    },

    #[error("VM is not suspended")]
    NotSuspended,

    #[error("entry command {command:?} does not match the pending exit")]
    BadEntry { command: EntryCommand },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Vcpu(#[from] VcpuError),

    #[error(transparent)]
    Inject(#[from] InjectError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Time(#[from] TimeError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Mmio(#[from] MmioError),
}

// ─── VM ──────────────────────────────────────────────────────────────

/// Started and halted vCPUs, for halt detection.
#[derive(Debug, Default)]
pub(crate) struct CpuSets {
    pub active: BTreeSet<usize>,
    pub halted: BTreeSet<usize>,
}

impl CpuSets {
    /// Every started vCPU is halted.
    pub fn all_halted(&self) -> bool {
        !self.active.is_empty() && self.active.is_subset(&self.halted)
    }
}

#[derive(Default, Clone)]
pub(crate) struct Collaborators {
    pub extint: Option<Arc<dyn ExtIntSource>>,
    pub lapic: Option<Arc<dyn LocalApic>>,
    pub emulator: Option<Arc<dyn InstructionEmulator>>,
}

/// A virtual machine.
pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) memory: GuestMemory,
    pub(crate) vcpus: Vec<Vcpu>,
    pub(crate) clock: Arc<dyn HostClock>,
    pub(crate) time: Mutex<TimeBase>,
    pub(crate) suspend: Mutex<Option<(SuspendReason, SuspendSource)>>,
    pub(crate) paused: AtomicBool,
    pub(crate) destroyed: AtomicBool,
    teardown: RwLock<()>,
    pub(crate) cpus: Mutex<CpuSets>,
    pub(crate) ports: RwLock<PortTable>,
    pub(crate) mmio: RwLock<MmioTable>,
    pub(crate) collab: RwLock<Collaborators>,
}

impl Vm {
    /// Create a VM on the back end named by `config.backend`, timed by the
    /// host's clocks.
    pub fn create(config: VmConfig) -> Result<Arc<Vm>, VmError> {
        let backend = backend::create(config.backend)?;
        let clock = Arc::new(SystemClock::new(config.time.host_tsc_hz));
        Self::with_backend(config, backend, clock)
    }

    /// Create a VM on an already constructed back end.
    ///
    /// Either every vCPU context is built or the call fails and everything
    /// built so far is dropped.
    pub fn with_backend(
        config: VmConfig,
        backend: Box<dyn Backend>,
        clock: Arc<dyn HostClock>,
    ) -> Result<Arc<Vm>, VmError> {
        if config.vcpus == 0 || config.vcpus > VM_MAXCPU {
            return Err(VmError::InvalidVcpuCount(config.vcpus));
        }
        let time = TimeBase::new(clock.as_ref(), backend.tsc_caps(), config.time.guest_tsc_hz)?;

        let now = clock.hrtime();
        let vcpus = (0..config.vcpus)
            .map(|id| Ok(Vcpu::new(id, backend.create_vcpu(id)?, now)))
            .collect::<Result<Vec<_>, BackendError>>()?;

        info!(
            "created VM {:?}: {} vCPUs on {}, guest TSC {} Hz",
            config.name,
            config.vcpus,
            backend.name(),
            time.guest_freq()
        );
        Ok(Arc::new(Vm {
            config,
            backend,
            memory: GuestMemory::new(),
            vcpus,
            clock,
            time: Mutex::new(time),
            suspend: Mutex::new(None),
            paused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            teardown: RwLock::new(()),
            cpus: Mutex::new(CpuSets::default()),
            ports: RwLock::new(PortTable::default()),
            mmio: RwLock::new(MmioTable::default()),
            collab: RwLock::new(Collaborators::default()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn clock(&self) -> &dyn HostClock {
        self.clock.as_ref()
    }

    pub(crate) fn vcpu(&self, id: usize) -> Result<&Vcpu, VmError> {
        self.vcpus.get(id).ok_or(VmError::NoSuchVcpu(id))
    }

    pub(crate) fn collaborators(&self) -> Collaborators {
        self.collab.read().clone()
    }

    /// Shared hold on the VM for one control-plane mutation.
    pub(crate) fn live(&self) -> Result<RwLockReadGuard<'_, ()>, VmError> {
        let guard = self.teardown.read_recursive();
        if self.is_destroyed() {
            return Err(VmError::Destroyed);
        }
        Ok(guard)
    }

    /// Lock every vCPU in index order.  Fails if any is inside `run`.
    fn lock_all_idle(&self) -> Result<Vec<MutexGuard<'_, VcpuShared>>, VmError> {
        let guards: Vec<_> = self.vcpus.iter().map(Vcpu::lock).collect();
        let busy: Vec<usize> = guards
            .iter()
            .zip(&self.vcpus)
            .filter(|(s, _)| s.on_cpu)
            .map(|(_, v)| v.id)
            .collect();
        if busy.is_empty() {
            Ok(guards)
        } else {
            Err(VmError::VcpusActive(busy))
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Tear the VM down: every mapping (IOMMU ones included) and segment is
    /// released, the vCPU hardware contexts are dropped and the handler
    /// tables and collaborators are emptied.  Fails while any vCPU thread is
    /// inside `run`.
    pub fn destroy(&self) -> Result<(), VmError> {
        let _teardown = self.teardown.write();
        {
            let _guards = self.lock_all_idle()?;
            if self.destroyed.swap(true, Ordering::SeqCst) {
                return Err(VmError::Destroyed);
            }
        }
        for vcpu in &self.vcpus {
            vcpu.release_hw();
        }
        self.memory.release_all(self.backend.as_ref());
        *self.ports.write() = PortTable::default();
        *self.mmio.write() = MmioTable::default();
        *self.collab.write() = Collaborators::default();
        info!("destroyed VM {:?}", self.config.name);
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Ask every vCPU to stop with `reason`.
    ///
    /// Returns once the reason is recorded; each vCPU observes it at its next
    /// checkpoint and returns a `Suspended` exit.  Only the first suspend is
    /// recorded.
    pub fn suspend(&self, reason: SuspendReason, source: SuspendSource) -> Result<(), VmError> {
        let _live = self.live()?;
        {
            let mut slot = self.suspend.lock();
            if let Some((reason, by)) = *slot {
                return Err(VmError::AlreadySuspended { reason, by });
            }
            *slot = Some((reason, source));
        }
        info!("VM {:?} suspending: {reason:?} from {source:?}", self.config.name);
        self.wake_all();
        Ok(())
    }

    /// Internal suspend; losing the race to an earlier one is expected.
    pub(crate) fn escalate(&self, reason: SuspendReason, source: SuspendSource) {
        if let Err(e) = self.suspend(reason, source) {
            debug!("{reason:?} from {source:?} ignored: {e}");
        }
    }

    pub fn suspend_state(&self) -> Option<(SuspendReason, SuspendSource)> {
        *self.suspend.lock()
    }

    /// Stop accepting `run` calls.  vCPUs already inside `run` return a
    /// `Bogus` exit at their next checkpoint.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("VM {:?} paused", self.config.name);
            self.wake_all();
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("VM {:?} resumed", self.config.name);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Return a suspended VM to its just-created state.
    ///
    /// Every vCPU goes back to `Init` with pending events, per-vCPU TSC
    /// offset, MTRRs and failure cleared.  Memory, handlers and the time base
    /// are kept.
    pub fn reinit(&self) -> Result<(), VmError> {
        let _live = self.live()?;
        if self.suspend.lock().is_none() {
            return Err(VmError::NotSuspended);
        }
        {
            let mut guards = self.lock_all_idle()?;
            for s in guards.iter_mut() {
                s.reset_to_init();
                s.debug_stop_req = false;
                s.terminate_req = false;
                s.failed = false;
                s.tsc_offset = 0;
                s.tsc_dirty = true;
                s.mtrr = MtrrBank::default();
            }
            let mut cpus = self.cpus.lock();
            cpus.active.clear();
            cpus.halted.clear();
        }
        *self.suspend.lock() = None;
        info!("VM {:?} reinitialised", self.config.name);
        Ok(())
    }

    /// Ring every vCPU's doorbell so each re-checks its wake condition.
    pub fn wake_all(&self) {
        for vcpu in &self.vcpus {
            vcpu.wake();
        }
    }

    // ─── Memory ──────────────────────────────────────────────────────

    pub fn alloc_segment(&self, id: usize, len: u64, kind: SegmentKind) -> Result<(), VmError> {
        let _live = self.live()?;
        Ok(self.memory.alloc_segment(id, len, kind)?)
    }

    pub fn free_segment(&self, id: usize) -> Result<(), VmError> {
        let _live = self.live()?;
        Ok(self.memory.free_segment(id)?)
    }

    pub fn segment(&self, id: usize) -> Result<SegmentInfo, VmError> {
        Ok(self.memory.segment(id)?)
    }

    pub fn map(&self, req: MapRequest) -> Result<(), VmError> {
        let _live = self.live()?;
        Ok(self.memory.map(self.backend.as_ref(), req)?)
    }

    pub fn unmap(&self, gpa: u64, len: u64) -> Result<(), VmError> {
        let _live = self.live()?;
        Ok(self.memory.unmap(self.backend.as_ref(), gpa, len)?)
    }

    pub fn mappings(&self) -> Vec<MappingInfo> {
        self.memory.mappings()
    }

    pub fn mapping_next(&self, gpa: u64) -> Option<MappingInfo> {
        self.memory.mapping_next(gpa)
    }

    pub fn lookup(&self, gpa: u64) -> Option<MappingInfo> {
        self.memory.lookup(gpa)
    }

    pub fn is_sysmem(&self, gpa: u64) -> bool {
        self.memory.is_sysmem(gpa)
    }

    pub fn sysmem_max_addr(&self) -> u64 {
        self.memory.sysmem_max_addr()
    }

    pub fn read_guest(&self, gpa: u64, buf: &mut [u8]) -> Result<(), VmError> {
        Ok(self.memory.read_gpa(gpa, buf)?)
    }

    pub fn write_guest(&self, gpa: u64, buf: &[u8]) -> Result<(), VmError> {
        let _live = self.live()?;
        Ok(self.memory.write_gpa(gpa, buf)?)
    }

    // ─── Run state ───────────────────────────────────────────────────

    /// Current run state and recorded SIPI vector.
    pub fn run_state(&self, vcpu: usize) -> Result<(RunState, u8), VmError> {
        Ok(self.vcpu(vcpu)?.run_state())
    }

    pub fn set_run_state(&self, vcpu: usize, state: RunState, sipi_vector: u8) -> Result<(), VmError> {
        let _live = self.live()?;
        self.vcpu(vcpu)?.set_run_state(state, sipi_vector)?;
        if state == RunState::Init {
            self.cpus.lock().active.remove(&vcpu);
        }
        Ok(())
    }

    /// Deliver a startup IPI.  Returns whether it was accepted.
    pub fn post_sipi(&self, vcpu: usize, vector: u8) -> Result<bool, VmError> {
        let _live = self.live()?;
        Ok(self.vcpu(vcpu)?.post_sipi(vector))
    }

    pub fn post_init(&self, vcpu: usize) -> Result<(), VmError> {
        let _live = self.live()?;
        self.vcpu(vcpu)?.post_init();
        Ok(())
    }

    pub fn request_debug_stop(&self, vcpu: usize) -> Result<(), VmError> {
        let _live = self.live()?;
        self.vcpu(vcpu)?.request_debug_stop();
        Ok(())
    }

    pub fn resume_vcpu(&self, vcpu: usize) -> Result<(), VmError> {
        let _live = self.live()?;
        Ok(self.vcpu(vcpu)?.resume()?)
    }

    /// Make the thread driving `vcpu` return from `run` at its next
    /// checkpoint, abandoning any sleep.
    pub fn terminate_vcpu(&self, vcpu: usize) -> Result<(), VmError> {
        let _live = self.live()?;
        self.vcpu(vcpu)?.terminate();
        Ok(())
    }

    pub fn wake(&self, vcpu: usize) -> Result<(), VmError> {
        self.vcpu(vcpu)?.wake();
        Ok(())
    }

    // ─── Pending events ──────────────────────────────────────────────

    pub fn inject_exception(&self, vcpu: usize, vector: u8, errcode: Option<u32>) -> Result<(), VmError> {
        let _live = self.live()?;
        Ok(self.vcpu(vcpu)?.inject_exception(vector, errcode)?)
    }

    pub fn inject_gp(&self, vcpu: usize) -> Result<(), VmError> {
        self.inject_exception(vcpu, IDT_GP, Some(0))
    }

    pub fn inject_ud(&self, vcpu: usize) -> Result<(), VmError> {
        self.inject_exception(vcpu, IDT_UD, None)
    }

    /// Queue a page fault at linear address `cr2`.  CR2 is loaded at once,
    /// so the vCPU must not be inside `run`.
    pub fn inject_pf(&self, vcpu: usize, errcode: u32, cr2: u64) -> Result<(), VmError> {
        let _live = self.live()?;
        let v = self.vcpu(vcpu)?;
        let mut hw = v.try_hw().ok_or(VmError::Busy { vcpu })?;
        {
            let mut s = v.lock();
            s.events.inject_pf(errcode)?;
            if let Err(e) = hw.set_register(Register::Cr2, cr2) {
                s.events.exc_pending = 0;
                return Err(e.into());
            }
        }
        debug!("vcpu{vcpu}: #PF({errcode:#x}) queued at {cr2:#x} (vector {IDT_PF})");
        Ok(())
    }

    pub fn set_exit_intinfo(&self, vcpu: usize, info: u64) -> Result<(), VmError> {
        let _live = self.live()?;
        Ok(self.vcpu(vcpu)?.set_exit_intinfo(info)?)
    }

    /// `(exit_intinfo, exc_pending)` of `vcpu`.
    pub fn intinfo(&self, vcpu: usize) -> Result<(u64, u64), VmError> {
        let ev = self.vcpu(vcpu)?.events();
        Ok((ev.exit_intinfo, ev.exc_pending))
    }

    pub fn inject_nmi(&self, vcpu: usize) -> Result<(), VmError> {
        let _live = self.live()?;
        self.vcpu(vcpu)?.set_nmi(true);
        Ok(())
    }

    pub fn nmi_pending(&self, vcpu: usize) -> Result<bool, VmError> {
        Ok(self.vcpu(vcpu)?.events().nmi)
    }

    pub fn clear_nmi(&self, vcpu: usize) -> Result<(), VmError> {
        let _live = self.live()?;
        self.vcpu(vcpu)?.set_nmi(false);
        Ok(())
    }

    /// Flag an external interrupt.  The vector comes from the registered
    /// [`ExtIntSource`] at delivery time.
    pub fn inject_extint(&self, vcpu: usize) -> Result<(), VmError> {
        let _live = self.live()?;
        self.vcpu(vcpu)?.set_extint(true);
        Ok(())
    }

    pub fn extint_pending(&self, vcpu: usize) -> Result<bool, VmError> {
        Ok(self.vcpu(vcpu)?.events().extint)
    }

    pub fn clear_extint(&self, vcpu: usize) -> Result<(), VmError> {
        let _live = self.live()?;
        self.vcpu(vcpu)?.set_extint(false);
        Ok(())
    }

    // ─── Registers ───────────────────────────────────────────────────

    pub fn get_register(&self, vcpu: usize, reg: Register) -> Result<u64, VmError> {
        let v = self.vcpu(vcpu)?;
        let mut hw = v.try_hw().ok_or(VmError::Busy { vcpu })?;
        Ok(hw.get_register(reg)?)
    }

    pub fn set_register(&self, vcpu: usize, reg: Register, value: u64) -> Result<(), VmError> {
        let _live = self.live()?;
        let v = self.vcpu(vcpu)?;
        let mut hw = v.try_hw().ok_or(VmError::Busy { vcpu })?;
        Ok(hw.set_register(reg, value)?)
    }

    // ─── Devices and collaborators ───────────────────────────────────

    pub fn register_port(
        &self,
        port: u16,
        direction: IoDirection,
        handler: Arc<dyn PortHandler>,
    ) -> Result<(), VmError> {
        let _live = self.live()?;
        self.ports.write().register(port, direction, handler)?;
        debug!("port {port:#x} {direction:?} handler registered");
        Ok(())
    }

    pub fn unregister_port(&self, port: u16, direction: IoDirection) -> Result<(), VmError> {
        let _live = self.live()?;
        Ok(self.ports.write().unregister(port, direction)?)
    }

    pub fn register_mmio(&self, gpa: u64, len: u64, handler: Arc<dyn MmioHandler>) -> Result<(), VmError> {
        let _live = self.live()?;
        if let Some(m) = self.memory.lookup(gpa) {
            warn!("MMIO handler at {gpa:#x} shadows part of the mapping at {:#x}", m.gpa);
        }
        self.mmio.write().register(gpa, len, handler)?;
        debug!("MMIO handler registered at {gpa:#x}+{len:#x}");
        Ok(())
    }

    pub fn unregister_mmio(&self, gpa: u64) -> Result<(), VmError> {
        let _live = self.live()?;
        Ok(self.mmio.write().unregister(gpa)?)
    }

    pub fn set_extint_source(&self, source: Option<Arc<dyn ExtIntSource>>) {
        match self.live() {
            Ok(_live) => self.collab.write().extint = source,
            Err(e) => warn!("set_extint_source ignored: {e}"),
        }
    }

    pub fn set_local_apic(&self, lapic: Option<Arc<dyn LocalApic>>) {
        match self.live() {
            Ok(_live) => self.collab.write().lapic = lapic,
            Err(e) => warn!("set_local_apic ignored: {e}"),
        }
    }

    pub fn set_instruction_emulator(&self, emulator: Option<Arc<dyn InstructionEmulator>>) {
        match self.live() {
            Ok(_live) => self.collab.write().emulator = emulator,
            Err(e) => warn!("set_instruction_emulator ignored: {e}"),
        }
    }

    // ─── Observability ───────────────────────────────────────────────

    pub fn vcpu_stats(&self, vcpu: usize) -> Result<VcpuStats, VmError> {
        let now = self.clock.hrtime();
        Ok(self.vcpu(vcpu)?.lock().acct.snapshot(now))
    }

    /// The last exit `vcpu` returned to its caller.
    pub fn last_exit(&self, vcpu: usize) -> Result<Option<VmExit>, VmError> {
        Ok(self.vcpu(vcpu)?.lock().last_exit.clone())
    }

    /// Guest TSC of `vcpu` right now.
    pub fn guest_tsc(&self, vcpu: usize) -> Result<u64, VmError> {
        let offset = self.vcpu(vcpu)?.lock().tsc_offset;
        let host_tsc = self.clock.host_tsc();
        Ok(self.time.lock().guest_tsc(host_tsc, offset))
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("name", &self.config.name)
            .field("vcpus", &self.vcpus.len())
            .field("backend", &self.backend.name())
            .field("suspend", &self.suspend_state())
            .finish_non_exhaustive()
    }
}
