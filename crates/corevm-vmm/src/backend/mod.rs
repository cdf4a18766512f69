//! Hardware back ends.
//!
//! The core never talks to a hypervisor directly.  A [`Backend`] owns the
//! per-VM hardware state (guest memory slots, TSC scaling capabilities) and
//! hands out one [`VcpuContext`] per vCPU.  The run loop drives a context
//! through [`VcpuContext::run`], which enters the guest and returns a
//! [`RawExit`] describing why control came back.
//!
//! Two implementations exist, selected by [`BackendKind`] at VM creation:
//!
//! - [`kvm::KvmBackend`] runs the guest on Linux KVM.  Interrupt delivery is
//!   done from userspace (no in-kernel irqchip), so every event the core
//!   injects goes through `KVM_SET_VCPU_EVENTS`.
//! - [`sim::SimBackend`] is a software model that replays a scripted exit
//!   sequence and records everything the core does to it.  It makes the run
//!   loop, injection ordering and halt handling testable without `/dev/kvm`.

pub mod kvm;
pub mod sim;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::verified::intinfo;

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("KVM {op} failed: {source}")]
    Kvm {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("back end does not support {0}")]
    Unsupported(&'static str),

    #[error("memory slot {slot} is not mapped")]
    NoSuchSlot { slot: u32 },

    #[error("no completion is pending for this vCPU")]
    NoPendingCompletion,
}

/// Build a closure mapping a `kvm_ioctls::Error` into [`BackendError::Kvm`].
pub(crate) fn kvm_err(op: &'static str) -> impl FnOnce(kvm_ioctls::Error) -> BackendError {
    move |source| BackendError::Kvm { op, source }
}

// ─── Selection ───────────────────────────────────────────────────────

/// Which hardware back end a VM runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Kvm,
    Sim,
}

/// Construct the back end named by `kind`.
pub fn create(kind: BackendKind) -> Result<Box<dyn Backend>, BackendError> {
    match kind {
        BackendKind::Kvm => Ok(Box::new(kvm::KvmBackend::new()?)),
        BackendKind::Sim => Ok(Box::new(sim::SimBackend::new())),
    }
}

// ─── Shared types ────────────────────────────────────────────────────

/// TSC scaling capabilities of a back end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TscCaps {
    /// Whether the guest may run at a frequency other than the host's.
    pub scaling: bool,
    /// Fractional bits of the fixed-point scaling multiplier.
    pub frac_size: u32,
    /// Exclusive upper bound on the integer part of `guest_hz / host_hz`.
    pub max_ratio: u64,
}

/// TSC state to load into a hardware context before the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TscParams {
    pub guest_freq: u64,
    /// Guest TSC value as of the moment the parameters are applied.
    pub guest_tsc: u64,
}

/// Guest register addressable through the back end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rsp,
    Rip,
    Rflags,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Efer,
}

impl Register {
    pub const ALL: [Register; 23] = [
        Register::Rax,
        Register::Rbx,
        Register::Rcx,
        Register::Rdx,
        Register::Rsi,
        Register::Rdi,
        Register::Rbp,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
        Register::Rsp,
        Register::Rip,
        Register::Rflags,
        Register::Cr0,
        Register::Cr2,
        Register::Cr3,
        Register::Cr4,
        Register::Efer,
    ];

    /// Field identifier of this register in the register data class.
    pub fn ident(self) -> u32 {
        use corevm_data::*;
        match self {
            Register::Rax => REG_RAX,
            Register::Rbx => REG_RBX,
            Register::Rcx => REG_RCX,
            Register::Rdx => REG_RDX,
            Register::Rsi => REG_RSI,
            Register::Rdi => REG_RDI,
            Register::Rbp => REG_RBP,
            Register::R8 => REG_R8,
            Register::R9 => REG_R9,
            Register::R10 => REG_R10,
            Register::R11 => REG_R11,
            Register::R12 => REG_R12,
            Register::R13 => REG_R13,
            Register::R14 => REG_R14,
            Register::R15 => REG_R15,
            Register::Rsp => REG_RSP,
            Register::Rip => REG_RIP,
            Register::Rflags => REG_RFLAGS,
            Register::Cr0 => REG_CR0,
            Register::Cr2 => REG_CR2,
            Register::Cr3 => REG_CR3,
            Register::Cr4 => REG_CR4,
            Register::Efer => REG_EFER,
        }
    }

    pub fn from_ident(ident: u32) -> Option<Register> {
        Register::ALL.into_iter().find(|r| r.ident() == ident)
    }
}

/// RFLAGS.IF
pub const RFLAGS_IF: u64 = 1 << 9;

/// An event delivered into the guest on the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Event {
    Exception { vector: u8, error_code: Option<u32> },
    Nmi,
    External { vector: u8 },
}

impl Event {
    /// Decode a valid intinfo word.  Software interrupts are not injectable.
    pub(crate) fn from_intinfo(info: u64) -> Option<Event> {
        if !intinfo::is_valid(info) {
            return None;
        }
        match intinfo::event_type(info) {
            intinfo::INTINFO_HWEXCP => Some(Event::Exception {
                vector: intinfo::vector(info),
                error_code: intinfo::error_code(info),
            }),
            intinfo::INTINFO_NMI => Some(Event::Nmi),
            intinfo::INTINFO_HWINTR => Some(Event::External {
                vector: intinfo::vector(info),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoDirection {
    In,
    Out,
}

/// Exit reason reported by a hardware context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawExit {
    /// Guest executed HLT.  `interrupts_enabled` is RFLAGS.IF at the halt.
    Hlt { interrupts_enabled: bool },
    /// Port read; the result is supplied with [`VcpuContext::complete_io_in`].
    IoIn { port: u16, size: u8 },
    IoOut { port: u16, size: u8, value: u32 },
    /// Pre-decoded MMIO read; completed with [`VcpuContext::complete_mmio_read`].
    MmioRead { gpa: u64, size: u8 },
    MmioWrite { gpa: u64, size: u8, value: u64 },
    /// Nested-paging fault that needs the instruction decoded.
    Paging { gpa: u64, write: bool },
    /// RDMSR trapped with the instruction not yet retired.  Nothing loads
    /// EDX:EAX or advances RIP on the back end's behalf.
    Rdmsr { msr: u32 },
    /// WRMSR trapped with the instruction not yet retired.
    Wrmsr { msr: u32, value: u64 },
    /// Guest executed MONITOR, MWAIT or a VMX/SVM instruction.
    Unsupported { what: &'static str },
    /// The requested interrupt window opened.
    InterruptWindow,
    /// Entry was cut short by a kick.
    Interrupted,
    /// Guest triple-faulted or requested shutdown.
    Shutdown,
    /// Hardware refused to enter the guest.
    FailEntry { reason: u64 },
    Unknown { detail: String },
}

// ─── Traits ──────────────────────────────────────────────────────────

/// Forces a vCPU out of guest execution from another thread.
pub trait Kick: Send + Sync {
    fn kick(&self);
}

/// Per-vCPU hardware context.  Only the vCPU's owning thread touches it.
pub trait VcpuContext: Send {
    /// Enter the guest until the next exit.
    fn run(&mut self) -> Result<RawExit, BackendError>;

    /// Queue `event` for delivery on the next entry.
    fn inject(&mut self, event: Event) -> Result<(), BackendError>;

    /// Ask for an [`RawExit::InterruptWindow`] once the guest can take an interrupt.
    fn request_interrupt_window(&mut self, enable: bool) -> Result<(), BackendError>;

    /// Whether an external interrupt could be delivered right now.
    fn interrupts_enabled(&mut self) -> Result<bool, BackendError>;

    fn get_register(&mut self, reg: Register) -> Result<u64, BackendError>;

    fn set_register(&mut self, reg: Register, value: u64) -> Result<(), BackendError>;

    /// Supply the data for the last [`RawExit::IoIn`].
    fn complete_io_in(&mut self, value: u32) -> Result<(), BackendError>;

    /// Supply the data for the last [`RawExit::MmioRead`].
    fn complete_mmio_read(&mut self, value: u64) -> Result<(), BackendError>;

    fn set_tsc(&mut self, params: TscParams) -> Result<(), BackendError>;

    /// Reset to the startup-IPI entry point `vector << 12` in real mode.
    fn reset(&mut self, vector: u8) -> Result<(), BackendError>;

    fn kicker(&self) -> Arc<dyn Kick>;
}

/// Per-VM hardware context.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_vcpu(&self, id: usize) -> Result<Box<dyn VcpuContext>, BackendError>;

    /// Expose `len` bytes of host memory at `host_addr` to the guest at `gpa`.
    fn map_memory(
        &self,
        slot: u32,
        gpa: u64,
        host_addr: u64,
        len: u64,
        readonly: bool,
    ) -> Result<(), BackendError>;

    fn unmap_memory(&self, slot: u32) -> Result<(), BackendError>;

    fn tsc_caps(&self) -> TscCaps;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_idents_round_trip() {
        for reg in Register::ALL {
            assert_eq!(Register::from_ident(reg.ident()), Some(reg));
        }
        assert_eq!(Register::from_ident(999), None);
    }

    #[test]
    fn event_decoding() {
        let gp = intinfo::hw_exception(intinfo::IDT_GP, Some(0));
        assert_eq!(
            Event::from_intinfo(gp),
            Some(Event::Exception { vector: 13, error_code: Some(0) })
        );
        let nmi = intinfo::INTINFO_VALID | intinfo::INTINFO_NMI | 2;
        assert_eq!(Event::from_intinfo(nmi), Some(Event::Nmi));
        let ext = intinfo::INTINFO_VALID | intinfo::INTINFO_HWINTR | 0x30;
        assert_eq!(Event::from_intinfo(ext), Some(Event::External { vector: 0x30 }));
        assert_eq!(Event::from_intinfo(0), None);
    }

    #[test]
    fn sim_backend_is_always_available() {
        let backend = create(BackendKind::Sim).unwrap();
        assert_eq!(backend.name(), "sim");
    }
}
