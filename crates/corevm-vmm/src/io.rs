//! Port-I/O and MMIO handler tables, and the instruction-emulation boundary.
//!
//! Devices live outside the core.  They claim ports or guest-physical ranges
//! by registering a handler; an exit that hits a claimed port or range is
//! serviced in the run loop without a round trip to the caller.
//!
//! MMIO faults that arrive undecoded (a nested-paging fault on a range that
//! is not backed by memory) go through an external [`InstructionEmulator`],
//! which decodes the faulting instruction and performs the access through an
//! [`EmulationContext`].

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::{IoDirection, Register};
use crate::verified::memory::{range_end, ranges_overlap};

// ─── Handlers ────────────────────────────────────────────────────────

/// Device side of a claimed I/O port.
pub trait PortHandler: Send + Sync {
    /// Value of a `size`-byte read from `port`.
    fn read(&self, vcpu: usize, port: u16, size: u8) -> u32;

    fn write(&self, vcpu: usize, port: u16, size: u8, value: u32);
}

/// Device side of a claimed guest-physical range.
pub trait MmioHandler: Send + Sync {
    fn read(&self, vcpu: usize, gpa: u64, size: u8) -> u64;

    fn write(&self, vcpu: usize, gpa: u64, size: u8, value: u64);
}

// ─── Port table ──────────────────────────────────────────────────────

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortError {
    #[error("port {port:#x} ({direction:?}) already has a handler")]
    AlreadyRegistered { port: u16, direction: IoDirection },

    #[error("port {port:#x} ({direction:?}) has no handler")]
    NotRegistered { port: u16, direction: IoDirection },
}

/// Port handlers keyed by `(port, direction)`.
#[derive(Default)]
pub struct PortTable {
    handlers: BTreeMap<(u16, IoDirection), Arc<dyn PortHandler>>,
}

impl PortTable {
    pub fn register(
        &mut self,
        port: u16,
        direction: IoDirection,
        handler: Arc<dyn PortHandler>,
    ) -> Result<(), PortError> {
        if self.handlers.contains_key(&(port, direction)) {
            return Err(PortError::AlreadyRegistered { port, direction });
        }
        self.handlers.insert((port, direction), handler);
        Ok(())
    }

    pub fn unregister(&mut self, port: u16, direction: IoDirection) -> Result<(), PortError> {
        self.handlers
            .remove(&(port, direction))
            .map(drop)
            .ok_or(PortError::NotRegistered { port, direction })
    }

    pub fn get(&self, port: u16, direction: IoDirection) -> Option<Arc<dyn PortHandler>> {
        self.handlers.get(&(port, direction)).cloned()
    }
}

// ─── MMIO table ──────────────────────────────────────────────────────

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MmioError {
    #[error("invalid MMIO range {gpa:#x}+{len:#x}")]
    InvalidRange { gpa: u64, len: u64 },

    #[error("MMIO range {gpa:#x}+{len:#x} overlaps the handler at {existing:#x}")]
    Overlap { gpa: u64, len: u64, existing: u64 },

    #[error("no MMIO handler registered at {gpa:#x}")]
    NotRegistered { gpa: u64 },
}

/// MMIO handlers keyed by non-overlapping guest-physical ranges.
#[derive(Default)]
pub struct MmioTable {
    ranges: BTreeMap<u64, (u64, Arc<dyn MmioHandler>)>,
}

impl MmioTable {
    pub fn register(&mut self, gpa: u64, len: u64, handler: Arc<dyn MmioHandler>) -> Result<(), MmioError> {
        if len == 0 || range_end(gpa, len).is_none() {
            return Err(MmioError::InvalidRange { gpa, len });
        }
        if let Some((&existing, _)) = self
            .ranges
            .iter()
            .find(|(&start, (l, _))| ranges_overlap(start, *l, gpa, len))
        {
            return Err(MmioError::Overlap { gpa, len, existing });
        }
        self.ranges.insert(gpa, (len, handler));
        Ok(())
    }

    /// Remove the handler whose range starts at `gpa`.
    pub fn unregister(&mut self, gpa: u64) -> Result<(), MmioError> {
        self.ranges
            .remove(&gpa)
            .map(drop)
            .ok_or(MmioError::NotRegistered { gpa })
    }

    /// Handler covering `gpa`.
    pub fn find(&self, gpa: u64) -> Option<Arc<dyn MmioHandler>> {
        let (&start, (len, handler)) = self.ranges.range(..=gpa).next_back()?;
        (gpa - start < *len).then(|| Arc::clone(handler))
    }
}

// ─── Instruction emulation ───────────────────────────────────────────

/// A nested-paging fault that needs its instruction decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault {
    pub gpa: u64,
    pub write: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmulationError {
    /// The bytes at RIP are not a supported memory instruction.  The guest
    /// receives #UD.
    #[error("cannot decode instruction at {rip:#x}")]
    Decode { rip: u64 },

    #[error("no device claims {gpa:#x}")]
    Unclaimed { gpa: u64 },

    #[error("emulation failed: {0}")]
    Failed(String),
}

/// What an emulator may touch while servicing a fault.
pub trait EmulationContext {
    fn get_register(&mut self, reg: Register) -> Result<u64, EmulationError>;

    fn set_register(&mut self, reg: Register, value: u64) -> Result<(), EmulationError>;

    /// Fetch guest memory, e.g. the instruction bytes at RIP.
    fn read_guest(&mut self, gpa: u64, buf: &mut [u8]) -> Result<(), EmulationError>;

    fn mmio_read(&mut self, gpa: u64, size: u8) -> Result<u64, EmulationError>;

    fn mmio_write(&mut self, gpa: u64, size: u8, value: u64) -> Result<(), EmulationError>;
}

/// External instruction decoder and emulator.
///
/// On success the emulator has performed the access and advanced RIP past
/// the instruction; the run loop re-enters the guest.
pub trait InstructionEmulator: Send + Sync {
    fn emulate(&self, fault: MemFault, ctx: &mut dyn EmulationContext) -> Result<(), EmulationError>;
}
