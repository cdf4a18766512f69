//! Exit records returned to the control plane, and the entry request that
//! resumes a vCPU after one.
//!
//! An exit that needs the caller's help (an unclaimed port or MMIO access,
//! an unhandled MSR) leaves the instruction half done.  The caller finishes
//! it by passing the result back in the next [`VmEntry`]:
//!
//! ```text
//!   run(Default)               ──▶ InOut { port: 0x60, In }
//!   run(FulfillInOut { 0x1c }) ──▶ ...guest continues with AL = 0x1c
//! ```
//!
//! Running again with [`EntryCommand::Default`] while a completion is owed
//! re-emits the same exit.

use serde::Serialize;

use crate::backend::IoDirection;
use crate::verified::run_state::RunState;

/// Why the VM as a whole stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    Reset,
    Poweroff,
    /// Every active vCPU halted with interrupts disabled.
    Halt,
    TripleFault,
}

/// Who asked for the suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendSource {
    Vm,
    Vcpu(usize),
}

/// Reason-specific part of an exit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "exit", rename_all = "snake_case")]
pub enum ExitKind {
    /// Port access with no registered handler.  `value` is set for writes.
    InOut {
        port: u16,
        size: u8,
        direction: IoDirection,
        value: Option<u32>,
    },
    /// Pre-decoded MMIO access with no registered handler.
    Mmio {
        gpa: u64,
        size: u8,
        write: bool,
        value: Option<u64>,
    },
    /// Nested-paging fault outside any MMIO handler.
    Paging { gpa: u64, write: bool },
    /// MMIO fault that needs instruction emulation and could not be serviced.
    InstEmul { gpa: u64, detail: String },
    /// MSR the core does not model.  The caller finishes the instruction:
    /// loads EDX:EAX and advances RIP by 2.
    Rdmsr { msr: u32 },
    /// As [`ExitKind::Rdmsr`]; the caller advances RIP by 2.
    Wrmsr { msr: u32, value: u64 },
    Suspended {
        reason: SuspendReason,
        source: SuspendSource,
    },
    /// The vCPU is not runnable and the caller asked for consistent exits.
    RunState { state: RunState, sipi_vector: u8 },
    /// The vCPU is debug-stopped.
    Debug,
    /// Nothing for the caller to do; run again.
    Bogus,
    /// HLT surfaced to the caller (userspace halt handling).
    Hlt { interrupts_enabled: bool },
    /// The hardware refused to enter the guest.  Terminal for the vCPU.
    FailEntry { reason: u64 },
    /// The back end failed outside guest entry.  Terminal for the vCPU.
    BackendFailure { detail: String },
    /// The guest did something the core does not model.
    Unhandled { detail: String },
}

impl ExitKind {
    /// Whether the vCPU can never run again until the VM is reinitialised.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExitKind::FailEntry { .. } | ExitKind::BackendFailure { .. })
    }
}

/// Outward-facing exit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmExit {
    pub vcpu: usize,
    /// Guest RIP at the exit.  For an exit owed a completion this is still
    /// the address of the half-done instruction.
    pub rip: u64,
    #[serde(flatten)]
    pub kind: ExitKind,
}

/// What to do with the exit that is owed a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryCommand {
    #[default]
    Default,
    /// Complete the pending port access.  `value` is ignored for writes.
    FulfillInOut { value: u32 },
    /// Complete the pending MMIO access.  `value` is ignored for writes.
    FulfillMmio { value: u64 },
}

/// Parameters of one `Vm::run` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmEntry {
    pub command: EntryCommand,
    /// Return [`ExitKind::Bogus`] (or [`ExitKind::RunState`] when parked)
    /// at the next point where the vCPU state is consistent, instead of
    /// entering the guest.
    pub exit_when_consistent: bool,
}

impl VmEntry {
    pub fn fulfill_inout(value: u32) -> Self {
        Self {
            command: EntryCommand::FulfillInOut { value },
            ..Self::default()
        }
    }

    pub fn fulfill_mmio(value: u64) -> Self {
        Self {
            command: EntryCommand::FulfillMmio { value },
            ..Self::default()
        }
    }

    pub fn consistent() -> Self {
        Self {
            exit_when_consistent: true,
            ..Self::default()
        }
    }
}

/// Completion owed by the caller before the vCPU may continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingCompletion {
    PortIn,
    PortOut,
    MmioRead,
    MmioWrite,
}

impl PendingCompletion {
    pub fn for_exit(kind: &ExitKind) -> Option<Self> {
        match kind {
            ExitKind::InOut { direction: IoDirection::In, .. } => Some(Self::PortIn),
            ExitKind::InOut { direction: IoDirection::Out, .. } => Some(Self::PortOut),
            ExitKind::Mmio { write: false, .. } => Some(Self::MmioRead),
            ExitKind::Mmio { write: true, .. } => Some(Self::MmioWrite),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exits_serialize_with_exit_tag() {
        let exit = VmExit {
            vcpu: 1,
            rip: 0xfff0,
            kind: ExitKind::Suspended {
                reason: SuspendReason::TripleFault,
                source: SuspendSource::Vcpu(1),
            },
        };
        let json = serde_json::to_value(&exit).unwrap();
        assert_eq!(json["vcpu"], 1);
        assert_eq!(json["rip"], 0xfff0);
        assert_eq!(json["exit"], "suspended");
        assert_eq!(json["reason"], "triple_fault");
        assert_eq!(json["source"]["vcpu"], 1);
    }

    #[test]
    fn only_device_exits_owe_completions() {
        let io_in = ExitKind::InOut {
            port: 0x60,
            size: 1,
            direction: IoDirection::In,
            value: None,
        };
        assert_eq!(PendingCompletion::for_exit(&io_in), Some(PendingCompletion::PortIn));
        assert_eq!(PendingCompletion::for_exit(&ExitKind::Bogus), None);
        assert_eq!(PendingCompletion::for_exit(&ExitKind::Rdmsr { msr: 0x10 }), None);
    }

    #[test]
    fn terminal_exits() {
        assert!(ExitKind::FailEntry { reason: 7 }.is_terminal());
        assert!(!ExitKind::Debug.is_terminal());
    }
}
