//! The vCPU run loop.
//!
//! ```text
//!        ┌──────────────────────────────────────────────┐
//!        ▼                                              │
//!   checkpoint ──(suspend / debug / terminate)──▶ return exit
//!        │  park while INIT, start on SIPI              │
//!        ▼                                              │
//!   load TSC, deliver ≤ 1 event                         │
//!        ▼                                              │
//!   VcpuContext::run                                    │
//!        ▼                                              │
//!   dispatch ──(handled in core)────────────────────────┘
//!        └──(needs the caller)──▶ return exit
//! ```
//!
//! Back-end failures never propagate as `Err`: they end the call with a
//! terminal exit and mark the vCPU failed.  `Err` is reserved for calls that
//! were refused before the vCPU was touched.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::backend::{BackendError, IoDirection, RawExit, Register, TscParams, VcpuContext};
use crate::exit::{EntryCommand, ExitKind, PendingCompletion, SuspendReason, SuspendSource, VmEntry, VmExit};
use crate::inject::{self, Delivery, InjectError, Offered, PendingEvents};
use crate::io::{EmulationContext, EmulationError, MemFault, MmioTable};
use crate::memory::GuestMemory;
use crate::msr::{MsrAccess, MsrResult, UnhandledMsrPolicy};
use crate::stats::Microstate;
use crate::vcpu::{Vcpu, VcpuShared};
use crate::verified::run_state::{RunEvent, RunState};
use crate::vm::{Vm, VmError};

/// Outcome of one step of the loop.
type Step = Result<Option<ExitKind>, BackendError>;

impl Vm {
    /// Run `vcpuid` until it needs the caller.
    ///
    /// `entry.command` completes the access owed by the previous exit, if
    /// any.  Running again with the default command while a completion is
    /// owed returns the same exit without entering the guest.
    pub fn run(&self, vcpuid: usize, entry: VmEntry) -> Result<VmExit, VmError> {
        let vcpu = self.vcpu(vcpuid)?;
        if self.is_destroyed() {
            return Err(VmError::Destroyed);
        }
        if self.is_paused() {
            return Err(VmError::Paused);
        }
        let mut hw = vcpu.try_hw().ok_or(VmError::Busy { vcpu: vcpuid })?;
        {
            let mut s = vcpu.lock();
            if self.is_destroyed() {
                return Err(VmError::Destroyed);
            }
            if s.failed {
                return Err(VmError::VcpuFailed { vcpu: vcpuid });
            }
            if let Some(exit) = apply_entry(&mut s, &mut **hw, entry.command)? {
                return Ok(exit);
            }
            s.on_cpu = true;
        }
        vcpu.drain();

        let kind = self.run_loop(vcpu, &mut **hw, entry.exit_when_consistent);
        let rip = hw.get_register(Register::Rip).unwrap_or(0);

        let mut s = vcpu.lock();
        s.on_cpu = false;
        s.in_guest = false;
        if kind.is_terminal() {
            s.failed = true;
        }
        let exit = VmExit { vcpu: vcpuid, rip, kind };
        s.pending = PendingCompletion::for_exit(&exit.kind);
        s.last_exit = Some(exit.clone());
        s.acct.change(Microstate::EmuUser, self.clock.hrtime());
        s.acct.counters.exits_to_user += 1;
        debug!("vcpu{vcpuid}: exit {:?} at {rip:#x}", exit.kind);
        Ok(exit)
    }

    fn run_loop(&self, vcpu: &Vcpu, hw: &mut dyn VcpuContext, consistent: bool) -> ExitKind {
        loop {
            match self.step(vcpu, hw, consistent) {
                Ok(None) => continue,
                Ok(Some(kind)) => return kind,
                Err(e) => {
                    error!("vcpu{}: back end failed: {e}", vcpu.id);
                    return ExitKind::BackendFailure { detail: e.to_string() };
                }
            }
        }
    }

    fn step(&self, vcpu: &Vcpu, hw: &mut dyn VcpuContext, consistent: bool) -> Step {
        if let Some(kind) = self.checkpoint(vcpu, hw, consistent)? {
            return Ok(Some(kind));
        }

        let collab = self.collaborators();
        let offered = Offered::sample(vcpu.id, collab.extint.as_deref(), collab.lapic.as_deref());
        let delivery = {
            let mut s = vcpu.lock();
            if s.tsc_dirty {
                let time = *self.time.lock();
                let guest_tsc = time.guest_tsc(self.clock.host_tsc(), s.tsc_offset);
                hw.set_tsc(TscParams { guest_freq: time.guest_freq(), guest_tsc })?;
                s.tsc_dirty = false;
            }
            let VcpuShared { events, acct, .. } = &mut *s;
            let delivery = inject::deliver(vcpu.id, events, hw, offered, &mut acct.counters)?;
            if delivery != Delivery::TripleFault {
                s.in_guest = true;
                s.acct.change(Microstate::Run, self.clock.hrtime());
            }
            delivery
        };
        match delivery {
            Delivery::TripleFault => {
                self.escalate(SuspendReason::TripleFault, SuspendSource::Vcpu(vcpu.id));
                return Ok(None);
            }
            Delivery::Delivered(_, Some(accepted)) => {
                accepted.notify(vcpu.id, collab.extint.as_deref(), collab.lapic.as_deref());
            }
            _ => {}
        }

        let exit = hw.run();
        {
            let mut s = vcpu.lock();
            s.in_guest = false;
            s.acct.change(Microstate::EmuKernel, self.clock.hrtime());
            s.acct.counters.exits += 1;
        }
        self.dispatch(vcpu, hw, exit?)
    }

    /// Honour suspend and control-plane requests, and bring the vCPU to
    /// `Running`.  Parks while the vCPU waits for a SIPI.
    fn checkpoint(&self, vcpu: &Vcpu, hw: &mut dyn VcpuContext, consistent: bool) -> Step {
        let id = vcpu.id;
        loop {
            if let Some((reason, source)) = self.suspend_state() {
                return Ok(Some(ExitKind::Suspended { reason, source }));
            }
            if self.is_paused() {
                return Ok(Some(ExitKind::Bogus));
            }

            let mut s = vcpu.lock();
            if s.terminate_req {
                s.terminate_req = false;
                return Ok(Some(ExitKind::Bogus));
            }
            if s.init_req && s.run_state != RunState::DebugStopped {
                info!("vcpu{id}: INIT");
                s.reset_to_init();
                self.cpus.lock().active.remove(&id);
            }
            if s.debug_stop_req {
                s.debug_stop_req = false;
                s.apply(RunEvent::DebugStop);
            }

            match s.run_state {
                RunState::DebugStopped => return Ok(Some(ExitKind::Debug)),
                RunState::Init => {
                    if consistent {
                        return Ok(Some(ExitKind::RunState {
                            state: RunState::Init,
                            sipi_vector: s.sipi_vector,
                        }));
                    }
                    s.acct.change(Microstate::Init, self.clock.hrtime());
                    drop(s);
                    vcpu.wait();
                    continue;
                }
                RunState::InitPendingSipi => {
                    let vector = s.sipi_vector;
                    hw.reset(vector)?;
                    s.apply(RunEvent::Start);
                    s.tsc_dirty = true;
                    self.cpus.lock().active.insert(id);
                    info!("vcpu{id}: started at {:#x}", (vector as u64) << 12);
                }
                RunState::Sleeping => {
                    s.apply(RunEvent::Wake);
                }
                RunState::Running => {}
            }

            if consistent {
                return Ok(Some(ExitKind::Bogus));
            }
            return Ok(None);
        }
    }

    fn dispatch(&self, vcpu: &Vcpu, hw: &mut dyn VcpuContext, exit: RawExit) -> Step {
        let id = vcpu.id;
        match exit {
            RawExit::Hlt { interrupts_enabled } => self.handle_hlt(vcpu, interrupts_enabled),

            RawExit::IoIn { port, size } => {
                let handler = self.ports.read().get(port, IoDirection::In);
                match handler {
                    Some(h) => {
                        hw.complete_io_in(h.read(id, port, size))?;
                        vcpu.lock().acct.counters.io_handled += 1;
                        Ok(None)
                    }
                    None => Ok(Some(ExitKind::InOut {
                        port,
                        size,
                        direction: IoDirection::In,
                        value: None,
                    })),
                }
            }

            RawExit::IoOut { port, size, value } => {
                let handler = self.ports.read().get(port, IoDirection::Out);
                match handler {
                    Some(h) => {
                        h.write(id, port, size, value);
                        vcpu.lock().acct.counters.io_handled += 1;
                        Ok(None)
                    }
                    None => Ok(Some(ExitKind::InOut {
                        port,
                        size,
                        direction: IoDirection::Out,
                        value: Some(value),
                    })),
                }
            }

            RawExit::MmioRead { gpa, size } => {
                let handler = self.mmio.read().find(gpa);
                match handler {
                    Some(h) => {
                        hw.complete_mmio_read(h.read(id, gpa, size))?;
                        vcpu.lock().acct.counters.mmio_handled += 1;
                        Ok(None)
                    }
                    None => Ok(Some(ExitKind::Mmio { gpa, size, write: false, value: None })),
                }
            }

            RawExit::MmioWrite { gpa, size, value } => {
                let handler = self.mmio.read().find(gpa);
                match handler {
                    Some(h) => {
                        h.write(id, gpa, size, value);
                        vcpu.lock().acct.counters.mmio_handled += 1;
                        Ok(None)
                    }
                    None => Ok(Some(ExitKind::Mmio { gpa, size, write: true, value: Some(value) })),
                }
            }

            RawExit::Paging { gpa, write } => self.handle_paging(vcpu, hw, gpa, write),

            RawExit::Rdmsr { msr } => self.handle_msr(vcpu, hw, msr, None),
            RawExit::Wrmsr { msr, value } => self.handle_msr(vcpu, hw, msr, Some(value)),

            RawExit::Unsupported { what } => {
                warn!("vcpu{id}: guest executed {what}, injecting #UD");
                self.guest_fault(vcpu, PendingEvents::inject_ud);
                Ok(None)
            }

            RawExit::InterruptWindow => {
                hw.request_interrupt_window(false)?;
                Ok(None)
            }

            RawExit::Interrupted => Ok(None),

            RawExit::Shutdown => {
                warn!("vcpu{id}: guest shutdown");
                self.escalate(SuspendReason::TripleFault, SuspendSource::Vcpu(id));
                Ok(None)
            }

            RawExit::FailEntry { reason } => {
                error!("vcpu{id}: hardware refused entry (reason {reason:#x})");
                Ok(Some(ExitKind::FailEntry { reason }))
            }

            RawExit::Unknown { detail } => Ok(Some(ExitKind::Unhandled { detail })),
        }
    }

    /// Queue a guest-visible fault raised by the core itself.
    fn guest_fault(&self, vcpu: &Vcpu, raise: impl FnOnce(&mut PendingEvents) -> Result<(), InjectError>) {
        let mut s = vcpu.lock();
        if let Err(e) = raise(&mut s.events) {
            warn!("vcpu{}: fault dropped: {e}", vcpu.id);
        }
    }

    // ─── HLT ─────────────────────────────────────────────────────────

    /// Sleep until something could end the halt.
    ///
    /// A halt with interrupts disabled can only be ended by an NMI, INIT or
    /// an already queued exception.  Once every started vCPU sits in such a
    /// halt the VM is suspended.
    fn handle_hlt(&self, vcpu: &Vcpu, interrupts_enabled: bool) -> Step {
        let id = vcpu.id;
        vcpu.lock().acct.counters.halts += 1;
        if self.config.userspace_hlt {
            return Ok(Some(ExitKind::Hlt { interrupts_enabled }));
        }

        let lapic = self.collaborators().lapic;
        let mut counted_halted = false;
        loop {
            if self.suspend_state().is_some() || self.is_paused() {
                break;
            }
            let lapic_pending = interrupts_enabled
                && lapic.as_ref().is_some_and(|l| l.pending_intr(id).is_some());

            let mut s = vcpu.lock();
            if s.terminate_req || s.init_req || s.debug_stop_req {
                break;
            }
            if s.events.wakeup_pending(interrupts_enabled, lapic_pending) {
                break;
            }
            if !interrupts_enabled && self.config.halt_detection && !counted_halted {
                counted_halted = true;
                let all = {
                    let mut cpus = self.cpus.lock();
                    cpus.halted.insert(id);
                    cpus.all_halted()
                };
                if all {
                    drop(s);
                    info!("vcpu{id}: every vCPU halted with interrupts disabled");
                    self.escalate(SuspendReason::Halt, SuspendSource::Vm);
                    continue;
                }
            }

            s.apply(RunEvent::Halt);
            s.acct.change(Microstate::Idle, self.clock.hrtime());
            drop(s);
            debug!("vcpu{id}: sleeping");

            vcpu.wait();

            let mut s = vcpu.lock();
            s.apply(RunEvent::Wake);
            s.acct.change(Microstate::EmuKernel, self.clock.hrtime());
        }
        if counted_halted {
            self.cpus.lock().halted.remove(&id);
        }
        Ok(None)
    }

    // ─── Memory faults ───────────────────────────────────────────────

    fn handle_paging(&self, vcpu: &Vcpu, hw: &mut dyn VcpuContext, gpa: u64, write: bool) -> Step {
        let Some(emulator) = self.collaborators().emulator else {
            return Ok(Some(ExitKind::Paging { gpa, write }));
        };
        let mut ctx = FaultContext {
            vcpu: vcpu.id,
            hw,
            memory: &self.memory,
            mmio: &self.mmio,
        };
        match emulator.emulate(MemFault { gpa, write }, &mut ctx) {
            Ok(()) => {
                vcpu.lock().acct.counters.mmio_handled += 1;
                Ok(None)
            }
            Err(EmulationError::Decode { rip }) => {
                warn!("vcpu{}: undecodable instruction at {rip:#x}, injecting #UD", vcpu.id);
                self.guest_fault(vcpu, PendingEvents::inject_ud);
                Ok(None)
            }
            Err(e) => Ok(Some(ExitKind::InstEmul { gpa, detail: e.to_string() })),
        }
    }

    // ─── MSRs ────────────────────────────────────────────────────────

    fn handle_msr(&self, vcpu: &Vcpu, hw: &mut dyn VcpuContext, msr: u32, write: Option<u64>) -> Step {
        let id = vcpu.id;
        let lapic = self.collaborators().lapic;
        let time = *self.time.lock();
        let host_tsc = self.clock.host_tsc();

        // Work on copies so no collaborator runs under the vCPU lock.
        let (mut mtrr, mut tsc_offset) = {
            let s = vcpu.lock();
            (s.mtrr.clone(), s.tsc_offset)
        };
        let mut tsc_dirty = false;
        let mut access = MsrAccess {
            vcpu: id,
            mtrr: &mut mtrr,
            tsc_offset: &mut tsc_offset,
            tsc_dirty: &mut tsc_dirty,
            time: &time,
            host_tsc,
            lapic: lapic.as_deref(),
        };
        let result = match write {
            Some(value) => access.write(msr, value),
            None => access.read(msr),
        };

        match result {
            MsrResult::Value(value) => {
                hw.set_register(Register::Rax, value & 0xffff_ffff)?;
                hw.set_register(Register::Rdx, value >> 32)?;
                skip_instruction(hw, 2)?;
            }
            MsrResult::Done => {
                let mut s = vcpu.lock();
                s.mtrr = mtrr;
                s.tsc_offset = tsc_offset;
                s.tsc_dirty |= tsc_dirty;
                drop(s);
                skip_instruction(hw, 2)?;
            }
            MsrResult::Fault => {
                warn!("vcpu{id}: invalid access to MSR {msr:#x}, injecting #GP");
                self.guest_fault(vcpu, PendingEvents::inject_gp);
            }
            MsrResult::Unhandled => match self.config.msr_policy {
                UnhandledMsrPolicy::Exit => {
                    return Ok(Some(match write {
                        Some(value) => ExitKind::Wrmsr { msr, value },
                        None => ExitKind::Rdmsr { msr },
                    }));
                }
                UnhandledMsrPolicy::InjectGp => {
                    warn!("vcpu{id}: unhandled MSR {msr:#x}, injecting #GP");
                    self.guest_fault(vcpu, PendingEvents::inject_gp);
                }
            },
        }
        vcpu.lock().acct.counters.msr_handled += 1;
        Ok(None)
    }
}

/// Complete the access owed by the previous exit, as told by `command`.
///
/// Returns the previous exit again when the caller ran without completing it.
fn apply_entry(
    s: &mut VcpuShared,
    hw: &mut dyn VcpuContext,
    command: EntryCommand,
) -> Result<Option<VmExit>, VmError> {
    match (command, s.pending) {
        (EntryCommand::Default, None) => return Ok(None),
        (EntryCommand::Default, Some(_)) => return Ok(s.last_exit.clone()),
        (EntryCommand::FulfillInOut { value }, Some(PendingCompletion::PortIn)) => {
            hw.complete_io_in(value)?;
        }
        (EntryCommand::FulfillInOut { .. }, Some(PendingCompletion::PortOut)) => {}
        (EntryCommand::FulfillMmio { value }, Some(PendingCompletion::MmioRead)) => {
            hw.complete_mmio_read(value)?;
        }
        (EntryCommand::FulfillMmio { .. }, Some(PendingCompletion::MmioWrite)) => {}
        (command, _) => return Err(VmError::BadEntry { command }),
    }
    s.pending = None;
    Ok(None)
}

fn skip_instruction(hw: &mut dyn VcpuContext, len: u64) -> Result<(), BackendError> {
    let rip = hw.get_register(Register::Rip)?;
    hw.set_register(Register::Rip, rip.wrapping_add(len))
}

/// What an [`InstructionEmulator`](crate::io::InstructionEmulator) sees of a
/// faulting vCPU.
struct FaultContext<'a> {
    vcpu: usize,
    hw: &'a mut dyn VcpuContext,
    memory: &'a GuestMemory,
    mmio: &'a parking_lot::RwLock<MmioTable>,
}

impl FaultContext<'_> {
    fn handler(&self, gpa: u64) -> Result<Arc<dyn crate::io::MmioHandler>, EmulationError> {
        self.mmio.read().find(gpa).ok_or(EmulationError::Unclaimed { gpa })
    }
}

fn failed(e: impl std::fmt::Display) -> EmulationError {
    EmulationError::Failed(e.to_string())
}

impl EmulationContext for FaultContext<'_> {
    fn get_register(&mut self, reg: Register) -> Result<u64, EmulationError> {
        self.hw.get_register(reg).map_err(failed)
    }

    fn set_register(&mut self, reg: Register, value: u64) -> Result<(), EmulationError> {
        self.hw.set_register(reg, value).map_err(failed)
    }

    fn read_guest(&mut self, gpa: u64, buf: &mut [u8]) -> Result<(), EmulationError> {
        self.memory.read_gpa(gpa, buf).map_err(failed)
    }

    fn mmio_read(&mut self, gpa: u64, size: u8) -> Result<u64, EmulationError> {
        Ok(self.handler(gpa)?.read(self.vcpu, gpa, size))
    }

    fn mmio_write(&mut self, gpa: u64, size: u8, value: u64) -> Result<(), EmulationError> {
        self.handler(gpa)?.write(self.vcpu, gpa, size, value);
        Ok(())
    }
}
