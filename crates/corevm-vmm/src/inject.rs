//! Interrupt and exception injection.
//!
//! Each vCPU carries four pending-event slots:
//!
//! | Slot           | Filled by                                  |
//! |----------------|--------------------------------------------|
//! | `exit_intinfo` | event interrupted by the last exit          |
//! | `exc_pending`  | [`PendingEvents::inject_exception`]         |
//! | `nmi`          | `Vm::inject_nmi`                            |
//! | `extint`       | `Vm::inject_extint` (legacy PIC delivery)   |
//!
//! Before every guest entry [`deliver`] moves at most one event into the
//! hardware context, in this order: the combination of `exit_intinfo` and
//! `exc_pending` (which may escalate to #DF or a triple fault), then NMI,
//! then the external interrupt (only if the guest can take it), then the
//! local APIC.
//!
//! Collaborators are never called with the vCPU lock held.  Their vectors are
//! sampled into an [`Offered`] before the lock is taken and the one that was
//! injected is reported through [`Accepted::notify`] after it is released,
//! so a collaborator may call back into the VM.

use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::backend::{BackendError, Event, VcpuContext};
use crate::stats::Counters;
use crate::verified::intinfo::{
    combine, hw_exception, is_injectable_exception, is_valid, is_valid_pending_event,
    vector_has_error_code, Combined, IDT_GP, IDT_PF, IDT_UD,
};

// ─── Collaborators ───────────────────────────────────────────────────

/// Legacy interrupt controller supplying vectors for external interrupts.
pub trait ExtIntSource: Send + Sync {
    /// Vector of the highest-priority pending interrupt.
    fn pending_vector(&self) -> Option<u8>;

    /// The guest accepted `vector`.
    fn accepted(&self, vector: u8);
}

/// Local APIC model.
pub trait LocalApic: Send + Sync {
    /// Highest-priority deliverable vector for `vcpu`.
    fn pending_intr(&self, vcpu: usize) -> Option<u8>;

    fn intr_accepted(&self, vcpu: usize, vector: u8);

    /// Read an APIC MSR.  `None` means the access faults.
    fn read_msr(&self, vcpu: usize, msr: u32) -> Option<u64>;

    /// Write an APIC MSR.  `false` means the access faults.
    fn write_msr(&self, vcpu: usize, msr: u32, value: u64) -> bool;
}

/// External interrupt source holding a single latched vector.
#[derive(Debug, Default)]
pub struct LatchedExtInt {
    vector: Mutex<Option<u8>>,
}

impl LatchedExtInt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, vector: u8) {
        *self.vector.lock() = Some(vector);
    }

    pub fn is_raised(&self) -> bool {
        self.vector.lock().is_some()
    }
}

impl ExtIntSource for LatchedExtInt {
    fn pending_vector(&self) -> Option<u8> {
        *self.vector.lock()
    }

    fn accepted(&self, vector: u8) {
        let mut latched = self.vector.lock();
        if *latched == Some(vector) {
            *latched = None;
        }
    }
}

// ─── Pending events ──────────────────────────────────────────────────

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectError {
    #[error("vector {0} cannot be injected as an exception")]
    InvalidVector(u8),

    #[error("vector {vector} does not take an error code")]
    UnexpectedErrorCode { vector: u8 },

    #[error("an exception is already pending ({pending:#x})")]
    Busy { pending: u64 },

    #[error("invalid event word {0:#x}")]
    InvalidIntinfo(u64),
}

/// Pending-event slots of one vCPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PendingEvents {
    pub exit_intinfo: u64,
    pub exc_pending: u64,
    pub nmi: bool,
    pub extint: bool,
}

/// What a combined entry event resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryEvent {
    None,
    Deliver(u64),
    TripleFault,
}

impl PendingEvents {
    /// Queue a hardware exception for the next entry.
    pub fn inject_exception(&mut self, vector: u8, errcode: Option<u32>) -> Result<(), InjectError> {
        if !is_injectable_exception(vector) {
            return Err(InjectError::InvalidVector(vector));
        }
        if errcode.is_some() && !vector_has_error_code(vector) {
            return Err(InjectError::UnexpectedErrorCode { vector });
        }
        if is_valid(self.exc_pending) {
            return Err(InjectError::Busy { pending: self.exc_pending });
        }
        self.exc_pending = hw_exception(vector, errcode);
        Ok(())
    }

    pub fn inject_gp(&mut self) -> Result<(), InjectError> {
        self.inject_exception(IDT_GP, Some(0))
    }

    pub fn inject_ud(&mut self) -> Result<(), InjectError> {
        self.inject_exception(IDT_UD, None)
    }

    pub fn inject_pf(&mut self, errcode: u32) -> Result<(), InjectError> {
        self.inject_exception(IDT_PF, Some(errcode))
    }

    /// Record the event that was being delivered when the vCPU exited.
    pub fn set_exit_intinfo(&mut self, info: u64) -> Result<(), InjectError> {
        if info != 0 && !is_valid_pending_event(info) {
            return Err(InjectError::InvalidIntinfo(info));
        }
        self.exit_intinfo = info;
        Ok(())
    }

    /// Combine `exit_intinfo` with `exc_pending` into the event for the next
    /// entry.  Both slots are consumed; an event that loses the combination
    /// but is not discarded goes back into `exit_intinfo`.
    pub fn entry_intinfo(&mut self) -> EntryEvent {
        let info1 = std::mem::take(&mut self.exit_intinfo);
        let info2 = std::mem::take(&mut self.exc_pending);
        match combine(info1, info2) {
            Combined::None => EntryEvent::None,
            Combined::TripleFault => EntryEvent::TripleFault,
            Combined::Deliver { deliver, requeue } => {
                if is_valid(info1) && is_valid(info2) && requeue == 0 {
                    debug!("{info1:#x} + {info2:#x} escalated to #DF");
                }
                self.exit_intinfo = requeue;
                EntryEvent::Deliver(deliver)
            }
        }
    }

    /// Whether anything could end a halt right now.
    pub fn wakeup_pending(&self, interrupts_enabled: bool, lapic_pending: bool) -> bool {
        self.nmi
            || is_valid(self.exc_pending)
            || is_valid(self.exit_intinfo)
            || (interrupts_enabled && (self.extint || lapic_pending))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ─── Delivery ────────────────────────────────────────────────────────

/// Interrupt vectors the collaborators offer for one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Offered {
    pub extint: Option<u8>,
    pub lapic: Option<u8>,
}

impl Offered {
    pub fn sample(vcpu: usize, extint: Option<&dyn ExtIntSource>, lapic: Option<&dyn LocalApic>) -> Self {
        Self {
            extint: extint.and_then(|source| source.pending_vector()),
            lapic: lapic.and_then(|l| l.pending_intr(vcpu)),
        }
    }
}

/// A collaborator's vector that went into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accepted {
    ExtInt(u8),
    Lapic(u8),
}

impl Accepted {
    /// Tell the collaborator that supplied the vector.
    pub fn notify(self, vcpu: usize, extint: Option<&dyn ExtIntSource>, lapic: Option<&dyn LocalApic>) {
        match self {
            Accepted::ExtInt(vector) => {
                if let Some(source) = extint {
                    source.accepted(vector);
                }
            }
            Accepted::Lapic(vector) => {
                if let Some(lapic) = lapic {
                    lapic.intr_accepted(vcpu, vector);
                }
            }
        }
    }
}

/// Result of one pre-entry delivery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Nothing,
    /// `event` was injected; the collaborator that supplied it, if any, is
    /// still owed the acknowledgement.
    Delivered(Event, Option<Accepted>),
    /// An interrupt is pending but masked; an interrupt-window exit was armed.
    WindowRequested,
    /// The VM must be suspended with a triple fault.
    TripleFault,
}

/// Move at most one pending event into the hardware context.
pub(crate) fn deliver(
    vcpu: usize,
    events: &mut PendingEvents,
    hw: &mut dyn VcpuContext,
    offered: Offered,
    counters: &mut Counters,
) -> Result<Delivery, BackendError> {
    match events.entry_intinfo() {
        EntryEvent::TripleFault => {
            warn!("vcpu{vcpu}: fault while delivering #DF");
            return Ok(Delivery::TripleFault);
        }
        EntryEvent::Deliver(info) => {
            if let Some(event) = Event::from_intinfo(info) {
                hw.inject(event)?;
                match event {
                    Event::Exception { .. } => counters.exceptions_delivered += 1,
                    Event::Nmi => counters.nmis_delivered += 1,
                    Event::External { .. } => counters.extints_delivered += 1,
                }
                debug!("vcpu{vcpu}: delivered {event:?}");
                if events.extint || events.nmi {
                    hw.request_interrupt_window(true)?;
                }
                return Ok(Delivery::Delivered(event, None));
            }
            warn!("vcpu{vcpu}: dropping undeliverable event {info:#x}");
        }
        EntryEvent::None => {}
    }

    if events.nmi {
        events.nmi = false;
        hw.inject(Event::Nmi)?;
        counters.nmis_delivered += 1;
        debug!("vcpu{vcpu}: delivered NMI");
        return Ok(Delivery::Delivered(Event::Nmi, None));
    }

    if !events.extint && offered.lapic.is_none() {
        return Ok(Delivery::Nothing);
    }
    if !hw.interrupts_enabled()? {
        hw.request_interrupt_window(true)?;
        return Ok(Delivery::WindowRequested);
    }

    if events.extint {
        events.extint = false;
        match offered.extint {
            Some(vector) => {
                let event = Event::External { vector };
                hw.inject(event)?;
                counters.extints_delivered += 1;
                debug!("vcpu{vcpu}: delivered extint {vector:#x}");
                return Ok(Delivery::Delivered(event, Some(Accepted::ExtInt(vector))));
            }
            None => debug!("vcpu{vcpu}: extint pending but no vector available"),
        }
    }

    if let Some(vector) = offered.lapic {
        let event = Event::External { vector };
        hw.inject(event)?;
        counters.extints_delivered += 1;
        return Ok(Delivery::Delivered(event, Some(Accepted::Lapic(vector))));
    }
    Ok(Delivery::Nothing)
}
