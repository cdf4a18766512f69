//! Per-vCPU accounting.
//!
//! Each vCPU is always in exactly one [`Microstate`].  The run loop moves it
//! between states and the time spent in each is accumulated in nanoseconds
//! of host hrtime.  Event counters are bumped alongside.

use serde::Serialize;

/// Where a vCPU's time is being spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Microstate {
    /// Not started, parked outside the run loop, or waiting for a SIPI.
    Init,
    /// Executing guest code.
    Run,
    /// Halted or parked waiting for a wake.
    Idle,
    /// Handling an exit inside the core.
    EmuKernel,
    /// An exit is out with the caller.
    EmuUser,
}

/// Nanoseconds spent in each microstate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Residency {
    pub init: u64,
    pub run: u64,
    pub idle: u64,
    pub emu_kernel: u64,
    pub emu_user: u64,
}

impl Residency {
    fn slot(&mut self, state: Microstate) -> &mut u64 {
        match state {
            Microstate::Init => &mut self.init,
            Microstate::Run => &mut self.run,
            Microstate::Idle => &mut self.idle,
            Microstate::EmuKernel => &mut self.emu_kernel,
            Microstate::EmuUser => &mut self.emu_user,
        }
    }
}

/// Exit and event counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub exits: u64,
    pub halts: u64,
    pub io_handled: u64,
    pub mmio_handled: u64,
    pub msr_handled: u64,
    pub nmis_delivered: u64,
    pub extints_delivered: u64,
    pub exceptions_delivered: u64,
    pub exits_to_user: u64,
}

/// Snapshot returned by `Vm::vcpu_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VcpuStats {
    pub microstate: Microstate,
    pub residency: Residency,
    pub counters: Counters,
}

#[derive(Debug, Clone)]
pub(crate) struct Accounting {
    state: Microstate,
    since: i64,
    residency: Residency,
    pub counters: Counters,
}

impl Accounting {
    pub fn new(now: i64) -> Self {
        Self {
            state: Microstate::Init,
            since: now,
            residency: Residency::default(),
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> Microstate {
        self.state
    }

    /// Charge time since the last change to the current state and switch.
    pub fn change(&mut self, next: Microstate, now: i64) {
        let elapsed = now.saturating_sub(self.since).max(0) as u64;
        *self.residency.slot(self.state) += elapsed;
        self.state = next;
        self.since = now;
    }

    /// Snapshot with the current state's time charged up to `now`.
    pub fn snapshot(&self, now: i64) -> VcpuStats {
        let mut residency = self.residency;
        *residency.slot(self.state) += now.saturating_sub(self.since).max(0) as u64;
        VcpuStats {
            microstate: self.state,
            residency,
            counters: self.counters,
        }
    }
}
