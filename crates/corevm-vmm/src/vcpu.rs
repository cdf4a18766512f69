//! Virtual CPUs: shared state, wake doorbell and control-plane requests.
//!
//! A vCPU is driven by exactly one host thread at a time, the one inside
//! `Vm::run` for it (its *owning* thread).  That thread holds the hardware
//! context for the duration of the call.  Everything other threads may touch
//! lives in [`VcpuShared`] behind a per-vCPU mutex; cross-vCPU operations
//! only ever take the target's lock.
//!
//! Other threads never move a vCPU into or out of `Running`/`Sleeping`.
//! They post a request (SIPI, INIT, debug stop, terminate, a pending event)
//! and ring the doorbell:
//!
//! ```text
//!   poster                              owning thread
//!   ──────                              ─────────────
//!   lock(shared)                        lock(shared)
//!   set request                         nothing to do? → state = Sleeping
//!   in_guest? kick()                    unlock
//!   doorbell.try_send(())   ─────────▶  doorbell.recv()
//!   unlock                              lock(shared), re-check
//! ```
//!
//! The doorbell is a bounded channel of capacity one, so a ring that lands
//! between the owner's check and its `recv` is latched rather than lost, and
//! extra rings collapse into one spurious wake that the re-check absorbs.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use thiserror::Error;

use crate::backend::{Kick, VcpuContext};
use crate::exit::{PendingCompletion, VmExit};
use crate::inject::{InjectError, PendingEvents};
use crate::msr::MtrrBank;
use crate::stats::Accounting;
use crate::verified::run_state::{transition, RunEvent, RunState};

/// Capacity of the vCPU array.
pub const VM_MAXCPU: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VcpuError {
    #[error("run state {0:?} cannot be set by the control plane")]
    InvalidRunState(RunState),

    #[error("vCPU {vcpu} is inside its run loop")]
    OnCpu { vcpu: usize },

    #[error("vCPU {vcpu} is not debug-stopped")]
    NotStopped { vcpu: usize },

    #[error(transparent)]
    Inject(#[from] InjectError),
}

/// vCPU state reachable from any thread.
#[derive(Debug)]
pub(crate) struct VcpuShared {
    pub run_state: RunState,
    /// State to return to when a debug stop is resumed.
    pub stopped_from: RunState,
    pub sipi_vector: u8,
    pub events: PendingEvents,

    pub init_req: bool,
    pub debug_stop_req: bool,
    pub terminate_req: bool,

    /// The owning thread is inside `Vm::run`.
    pub on_cpu: bool,
    /// The owning thread is inside the back end's `run`.
    pub in_guest: bool,
    /// A terminal exit was returned; the vCPU will not run again.
    pub failed: bool,

    pub tsc_offset: u64,
    pub tsc_dirty: bool,
    pub mtrr: MtrrBank,

    pub last_exit: Option<VmExit>,
    pub pending: Option<PendingCompletion>,
    pub acct: Accounting,
}

impl VcpuShared {
    fn new(now: i64) -> Self {
        Self {
            run_state: RunState::Init,
            stopped_from: RunState::Init,
            sipi_vector: 0,
            events: PendingEvents::default(),
            init_req: false,
            debug_stop_req: false,
            terminate_req: false,
            on_cpu: false,
            in_guest: false,
            failed: false,
            tsc_offset: 0,
            tsc_dirty: true,
            mtrr: MtrrBank::default(),
            last_exit: None,
            pending: None,
            acct: Accounting::new(now),
        }
    }

    /// Apply `event` to the run state.  Returns whether the state changed.
    pub fn apply(&mut self, event: RunEvent) -> bool {
        match transition(self.run_state, event) {
            Some(next) => {
                if event == RunEvent::DebugStop {
                    self.stopped_from = self.run_state;
                }
                self.run_state = next;
                true
            }
            None => false,
        }
    }

    /// Return to the reset state: pending events, requests and owed
    /// completions are dropped.
    pub fn reset_to_init(&mut self) {
        self.apply(RunEvent::Init);
        self.sipi_vector = 0;
        self.events.clear();
        self.init_req = false;
        self.pending = None;
        self.last_exit = None;
    }
}

/// One virtual CPU of a VM.
pub(crate) struct Vcpu {
    pub id: usize,
    shared: Mutex<VcpuShared>,
    /// `None` once the VM is destroyed.
    hw: Mutex<Option<Box<dyn VcpuContext>>>,
    kicker: Arc<dyn Kick>,
    doorbell: SyncSender<()>,
    bell: Mutex<Receiver<()>>,
}

impl Vcpu {
    pub fn new(id: usize, hw: Box<dyn VcpuContext>, now: i64) -> Self {
        let (doorbell, bell) = sync_channel(1);
        Self {
            id,
            shared: Mutex::new(VcpuShared::new(now)),
            kicker: hw.kicker(),
            hw: Mutex::new(Some(hw)),
            doorbell,
            bell: Mutex::new(bell),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, VcpuShared> {
        self.shared.lock()
    }

    /// Hardware context, unless another thread is driving the vCPU or the
    /// context has been released.
    pub fn try_hw(&self) -> Option<MappedMutexGuard<'_, Box<dyn VcpuContext>>> {
        let hw = self.hw.try_lock()?;
        MutexGuard::try_map(hw, Option::as_mut).ok()
    }

    /// Drop the hardware context.  Waits for a thread still holding it.
    pub fn release_hw(&self) {
        if self.hw.lock().take().is_some() {
            debug!("vcpu{}: hardware context released", self.id);
        }
    }

    /// Wake the owning thread so it re-examines `shared`.  Call with the
    /// vCPU lock held, after posting the request.
    pub fn notify(&self, shared: &VcpuShared) {
        if shared.in_guest {
            self.kicker.kick();
        }
        // A full doorbell already guarantees a wake.
        let _ = self.doorbell.try_send(());
    }

    /// Block until the doorbell rings.  Only the owning thread calls this,
    /// never with the vCPU lock held.
    pub fn wait(&self) {
        let bell = self.bell.lock();
        // The sender lives as long as `self`, so `recv` cannot fail.
        let _ = bell.recv();
    }

    /// Drop a stale ring left over from an earlier notification.
    pub fn drain(&self) {
        let _ = self.bell.lock().try_recv();
    }

    // ─── Control-plane requests ──────────────────────────────────────

    pub fn run_state(&self) -> (RunState, u8) {
        let s = self.lock();
        (s.run_state, s.sipi_vector)
    }

    /// Force the run state.  Only the reset states may be set, and only
    /// while no thread is driving the vCPU.
    pub fn set_run_state(&self, state: RunState, sipi_vector: u8) -> Result<(), VcpuError> {
        let mut s = self.lock();
        if s.on_cpu {
            return Err(VcpuError::OnCpu { vcpu: self.id });
        }
        match state {
            RunState::Init => s.reset_to_init(),
            RunState::InitPendingSipi => {
                s.reset_to_init();
                s.apply(RunEvent::Sipi);
                s.sipi_vector = sipi_vector;
            }
            other => return Err(VcpuError::InvalidRunState(other)),
        }
        info!("vcpu{}: run state set to {state:?} (vector {sipi_vector:#x})", self.id);
        Ok(())
    }

    /// Deliver a startup IPI.  Ignored unless the vCPU is in `Init`.
    pub fn post_sipi(&self, vector: u8) -> bool {
        let mut s = self.lock();
        if !s.apply(RunEvent::Sipi) {
            debug!("vcpu{}: SIPI ignored in {:?}", self.id, s.run_state);
            return false;
        }
        s.sipi_vector = vector;
        self.notify(&s);
        true
    }

    /// Deliver an INIT signal.  Applied at the owning thread's next
    /// checkpoint, or at once if no thread is driving the vCPU.
    pub fn post_init(&self) {
        let mut s = self.lock();
        if s.on_cpu {
            s.init_req = true;
            self.notify(&s);
        } else if s.run_state != RunState::DebugStopped {
            s.reset_to_init();
        }
    }

    pub fn request_debug_stop(&self) {
        let mut s = self.lock();
        if s.on_cpu {
            s.debug_stop_req = true;
            self.notify(&s);
        } else {
            s.apply(RunEvent::DebugStop);
        }
    }

    /// Leave a debug stop, returning to the state held before it.
    pub fn resume(&self) -> Result<(), VcpuError> {
        let mut s = self.lock();
        s.debug_stop_req = false;
        if s.run_state != RunState::DebugStopped {
            return Err(VcpuError::NotStopped { vcpu: self.id });
        }
        let back = s.stopped_from;
        s.apply(RunEvent::Resume(back));
        self.notify(&s);
        Ok(())
    }

    /// Make the owning thread abandon any wait and return to its caller.
    pub fn terminate(&self) {
        let mut s = self.lock();
        s.terminate_req = true;
        self.notify(&s);
    }

    /// Ring the doorbell without posting anything.
    pub fn wake(&self) {
        let s = self.lock();
        self.notify(&s);
    }

    // ─── Pending events ──────────────────────────────────────────────

    pub fn inject_exception(&self, vector: u8, errcode: Option<u32>) -> Result<(), VcpuError> {
        let mut s = self.lock();
        s.events.inject_exception(vector, errcode)?;
        self.notify(&s);
        Ok(())
    }

    pub fn set_exit_intinfo(&self, info: u64) -> Result<(), VcpuError> {
        let mut s = self.lock();
        s.events.set_exit_intinfo(info)?;
        Ok(())
    }

    pub fn set_nmi(&self, pending: bool) {
        let mut s = self.lock();
        s.events.nmi = pending;
        if pending {
            self.notify(&s);
        }
    }

    pub fn set_extint(&self, pending: bool) {
        let mut s = self.lock();
        s.events.extint = pending;
        if pending {
            self.notify(&s);
        }
    }

    pub fn events(&self) -> PendingEvents {
        self.lock().events
    }
}
