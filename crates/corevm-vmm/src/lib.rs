//! corevm — the host-side core of a virtual machine monitor.
//!
//! The crate owns VM lifecycle, guest memory segments and mappings, the
//! per-vCPU run loop with its exit dispatch, interrupt and exception
//! injection, MSR emulation, the guest time base, and versioned state
//! import/export.  Device models, the instruction decoder and the interrupt
//! controllers are collaborators plugged in through traits.
//!
//! # Architecture
//!
//! - [`vm`] — VM object and control plane
//! - [`memory`] — memory segments and guest-physical mappings
//! - [`backend`] — hardware back ends (KVM, simulator)
//! - [`exit`] — exit records handed to the caller, entry requests
//! - [`inject`] — pending-event slots and pre-entry delivery
//! - [`msr`] — MSR and MTRR emulation
//! - [`time`] — host clocks and the guest TSC time base
//! - [`io`] — port-I/O and MMIO handler tables, emulator collaborator
//! - [`data`] — versioned state import/export
//! - [`stats`] — per-vCPU microstate accounting
//! - [`verified`] — pure decision tables and arithmetic
//!
//! # Example
//!
//! ```no_run
//! use corevm::{RunState, Vm, VmConfig, VmEntry};
//!
//! let vm = Vm::create(VmConfig::default())?;
//! vm.set_run_state(0, RunState::InitPendingSipi, 0)?;
//! let exit = vm.run(0, VmEntry::default())?;
//! println!("{}", serde_json::to_string(&exit)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod data;
pub mod exit;
pub mod inject;
pub mod io;
pub mod memory;
pub mod msr;
mod run;
pub mod stats;
pub mod time;
pub(crate) mod vcpu;
pub mod verified;
pub mod vm;

pub use backend::{BackendError, BackendKind, Event, IoDirection, RawExit, Register};
pub use data::{versions, DataError, DataRequest, DataScope};
pub use exit::{EntryCommand, ExitKind, SuspendReason, SuspendSource, VmEntry, VmExit};
pub use inject::{ExtIntSource, InjectError, LatchedExtInt, LocalApic};
pub use io::{EmulationContext, EmulationError, InstructionEmulator, MemFault, MmioHandler, PortHandler};
pub use memory::{MapRequest, MappingInfo, MemoryError, Prot, SegmentInfo, SegmentKind};
pub use msr::UnhandledMsrPolicy;
pub use stats::{Microstate, VcpuStats};
pub use time::{HostClock, ManualClock, SystemClock, TimeConfig, TimeError};
pub use vcpu::{VcpuError, VM_MAXCPU};
pub use verified::run_state::RunState;
pub use vm::{Vm, VmConfig, VmError};
