//! Simulated hardware back end.
//!
//! Instead of executing guest code, each simulated vCPU pops the next
//! [`RawExit`] from a per-vCPU script every time it is entered.  Everything
//! the core does to the hardware context (entries, injected events, register
//! writes, completions, TSC loads, kicks) is appended to a shared
//! [`SimRecord`] log, so tests can assert on exact ordering, e.g. that an
//! external interrupt was injected *before* the entry that followed a wake.
//!
//! An exhausted script yields [`RawExit::Unknown`], which the run loop hands
//! back to the caller, so a test never spins forever.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::{
    Backend, BackendError, Event, Kick, RawExit, Register, TscCaps, TscParams, VcpuContext,
    RFLAGS_IF,
};

/// Fixed-point width used by the simulated TSC scaler.
pub const SIM_TSC_FRAC_SIZE: u32 = 32;

/// Largest integer guest/host frequency ratio the simulator accepts.
pub const SIM_TSC_MAX_RATIO: u64 = 255;

/// Detail string of the exit returned once a script runs dry.
pub const SCRIPT_EXHAUSTED: &str = "sim script exhausted";

/// One observable action performed on the simulated hardware.
#[derive(Debug, Clone, PartialEq)]
pub enum SimRecord {
    Entered { vcpu: usize },
    Injected { vcpu: usize, event: Event },
    WindowRequested { vcpu: usize, enable: bool },
    IoCompleted { vcpu: usize, value: u32 },
    MmioCompleted { vcpu: usize, value: u64 },
    RegisterWritten { vcpu: usize, reg: Register, value: u64 },
    TscLoaded { vcpu: usize, params: TscParams },
    Reset { vcpu: usize, vector: u8 },
    Kicked { vcpu: usize },
    Mapped { slot: u32, gpa: u64, len: u64, readonly: bool },
    Unmapped { slot: u32 },
}

#[derive(Debug, Default)]
struct SimState {
    scripts: HashMap<usize, VecDeque<RawExit>>,
    regs: HashMap<(usize, Register), u64>,
    slots: BTreeMap<u32, (u64, u64)>,
    /// Registers whose writes fail.
    refused: HashSet<(usize, Register)>,
    log: Vec<SimRecord>,
}

impl SimState {
    fn reg(&self, vcpu: usize, reg: Register) -> u64 {
        match self.regs.get(&(vcpu, reg)) {
            Some(v) => *v,
            // Bit 1 of RFLAGS is architecturally always set.
            None if reg == Register::Rflags => 0x2,
            None => 0,
        }
    }
}

/// Test-side handle onto a [`SimBackend`]: scripts exits, reads the log.
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Append `exit` to `vcpu`'s script.
    pub fn push_exit(&self, vcpu: usize, exit: RawExit) {
        self.state.lock().scripts.entry(vcpu).or_default().push_back(exit);
    }

    pub fn push_exits(&self, vcpu: usize, exits: impl IntoIterator<Item = RawExit>) {
        let mut state = self.state.lock();
        state.scripts.entry(vcpu).or_default().extend(exits);
    }

    /// Number of scripted exits not yet consumed by `vcpu`.
    pub fn remaining(&self, vcpu: usize) -> usize {
        self.state.lock().scripts.get(&vcpu).map_or(0, VecDeque::len)
    }

    pub fn records(&self) -> Vec<SimRecord> {
        self.state.lock().log.clone()
    }

    /// Records concerning `vcpu` only (memory slot records are VM-wide and dropped).
    pub fn vcpu_records(&self, vcpu: usize) -> Vec<SimRecord> {
        self.records()
            .into_iter()
            .filter(|r| record_vcpu(r) == Some(vcpu))
            .collect()
    }

    pub fn clear_records(&self) {
        self.state.lock().log.clear();
    }

    pub fn register(&self, vcpu: usize, reg: Register) -> u64 {
        self.state.lock().reg(vcpu, reg)
    }

    /// Set a register behind the core's back, as guest execution would.
    pub fn set_register(&self, vcpu: usize, reg: Register, value: u64) {
        self.state.lock().regs.insert((vcpu, reg), value);
    }

    /// Make every later write of `reg` on `vcpu` fail.
    pub fn refuse_register(&self, vcpu: usize, reg: Register) {
        self.state.lock().refused.insert((vcpu, reg));
    }

    pub fn set_interrupts_enabled(&self, vcpu: usize, enabled: bool) {
        let mut state = self.state.lock();
        let rflags = state.reg(vcpu, Register::Rflags);
        let rflags = if enabled { rflags | RFLAGS_IF } else { rflags & !RFLAGS_IF };
        state.regs.insert((vcpu, Register::Rflags), rflags);
    }

    /// Currently mapped memory slots as `slot -> (gpa, len)`.
    pub fn slots(&self) -> BTreeMap<u32, (u64, u64)> {
        self.state.lock().slots.clone()
    }
}

fn record_vcpu(record: &SimRecord) -> Option<usize> {
    match *record {
        SimRecord::Entered { vcpu }
        | SimRecord::Injected { vcpu, .. }
        | SimRecord::WindowRequested { vcpu, .. }
        | SimRecord::IoCompleted { vcpu, .. }
        | SimRecord::MmioCompleted { vcpu, .. }
        | SimRecord::RegisterWritten { vcpu, .. }
        | SimRecord::TscLoaded { vcpu, .. }
        | SimRecord::Reset { vcpu, .. }
        | SimRecord::Kicked { vcpu } => Some(vcpu),
        SimRecord::Mapped { .. } | SimRecord::Unmapped { .. } => None,
    }
}

/// Simulated per-VM hardware.
#[derive(Debug, Default)]
pub struct SimBackend {
    state: Arc<Mutex<SimState>>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Backend for SimBackend {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn create_vcpu(&self, id: usize) -> Result<Box<dyn VcpuContext>, BackendError> {
        Ok(Box::new(SimVcpu {
            id,
            state: Arc::clone(&self.state),
            pending: None,
            kick: Arc::new(SimKick {
                id,
                state: Arc::clone(&self.state),
            }),
        }))
    }

    fn map_memory(
        &self,
        slot: u32,
        gpa: u64,
        _host_addr: u64,
        len: u64,
        readonly: bool,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.slots.insert(slot, (gpa, len));
        state.log.push(SimRecord::Mapped { slot, gpa, len, readonly });
        Ok(())
    }

    fn unmap_memory(&self, slot: u32) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.slots.remove(&slot).is_none() {
            return Err(BackendError::NoSuchSlot { slot });
        }
        state.log.push(SimRecord::Unmapped { slot });
        Ok(())
    }

    fn tsc_caps(&self) -> TscCaps {
        TscCaps {
            scaling: true,
            frac_size: SIM_TSC_FRAC_SIZE,
            max_ratio: SIM_TSC_MAX_RATIO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingCompletion {
    IoIn { size: u8 },
    MmioRead,
}

struct SimVcpu {
    id: usize,
    state: Arc<Mutex<SimState>>,
    pending: Option<PendingCompletion>,
    kick: Arc<SimKick>,
}

impl VcpuContext for SimVcpu {
    fn run(&mut self) -> Result<RawExit, BackendError> {
        let mut state = self.state.lock();
        state.log.push(SimRecord::Entered { vcpu: self.id });

        let exit = state
            .scripts
            .get_mut(&self.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| RawExit::Unknown {
                detail: SCRIPT_EXHAUSTED.to_string(),
            });

        self.pending = match exit {
            RawExit::IoIn { size, .. } => Some(PendingCompletion::IoIn { size }),
            RawExit::MmioRead { .. } => Some(PendingCompletion::MmioRead),
            _ => None,
        };
        if let RawExit::Hlt { interrupts_enabled } = exit {
            let rflags = state.reg(self.id, Register::Rflags);
            let rflags = if interrupts_enabled { rflags | RFLAGS_IF } else { rflags & !RFLAGS_IF };
            state.regs.insert((self.id, Register::Rflags), rflags);
        }
        debug!("sim vcpu{}: {:?}", self.id, exit);
        Ok(exit)
    }

    fn inject(&mut self, event: Event) -> Result<(), BackendError> {
        self.state.lock().log.push(SimRecord::Injected { vcpu: self.id, event });
        Ok(())
    }

    fn request_interrupt_window(&mut self, enable: bool) -> Result<(), BackendError> {
        self.state
            .lock()
            .log
            .push(SimRecord::WindowRequested { vcpu: self.id, enable });
        Ok(())
    }

    fn interrupts_enabled(&mut self) -> Result<bool, BackendError> {
        Ok(self.state.lock().reg(self.id, Register::Rflags) & RFLAGS_IF != 0)
    }

    fn get_register(&mut self, reg: Register) -> Result<u64, BackendError> {
        Ok(self.state.lock().reg(self.id, reg))
    }

    fn set_register(&mut self, reg: Register, value: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.refused.contains(&(self.id, reg)) {
            return Err(BackendError::Unsupported("writing this register"));
        }
        state.regs.insert((self.id, reg), value);
        state.log.push(SimRecord::RegisterWritten { vcpu: self.id, reg, value });
        Ok(())
    }

    fn complete_io_in(&mut self, value: u32) -> Result<(), BackendError> {
        let Some(PendingCompletion::IoIn { size }) = self.pending.take() else {
            return Err(BackendError::NoPendingCompletion);
        };
        let mask: u64 = match size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        };
        let mut state = self.state.lock();
        let rax = state.reg(self.id, Register::Rax);
        state
            .regs
            .insert((self.id, Register::Rax), (rax & !mask) | (value as u64 & mask));
        state.log.push(SimRecord::IoCompleted { vcpu: self.id, value });
        Ok(())
    }

    fn complete_mmio_read(&mut self, value: u64) -> Result<(), BackendError> {
        if self.pending.take() != Some(PendingCompletion::MmioRead) {
            return Err(BackendError::NoPendingCompletion);
        }
        self.state
            .lock()
            .log
            .push(SimRecord::MmioCompleted { vcpu: self.id, value });
        Ok(())
    }

    fn set_tsc(&mut self, params: TscParams) -> Result<(), BackendError> {
        self.state
            .lock()
            .log
            .push(SimRecord::TscLoaded { vcpu: self.id, params });
        Ok(())
    }

    fn reset(&mut self, vector: u8) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.regs.retain(|(vcpu, _), _| *vcpu != self.id);
        state.regs.insert((self.id, Register::Rip), (vector as u64) << 12);
        state.log.push(SimRecord::Reset { vcpu: self.id, vector });
        self.pending = None;
        Ok(())
    }

    fn kicker(&self) -> Arc<dyn Kick> {
        Arc::clone(&self.kick) as Arc<dyn Kick>
    }
}

struct SimKick {
    id: usize,
    state: Arc<Mutex<SimState>>,
}

impl Kick for SimKick {
    fn kick(&self) {
        self.state.lock().log.push(SimRecord::Kicked { vcpu: self.id });
    }
}
