//! MSR emulation.
//!
//! Guest `RDMSR`/`WRMSR` exits land here.  The core models the time-stamp
//! counter, the machine-check globals, the MTRR bank and (when a local APIC
//! collaborator is registered) the APIC MSRs.  Anything else is
//! [`MsrResult::Unhandled`] and is either handed to the caller or turned into
//! a #GP, depending on [`UnhandledMsrPolicy`].
//!
//! Reads never have side effects.  A rejected write leaves every register
//! untouched.

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inject::LocalApic;
use crate::time::TimeBase;
use crate::verified::mtrr::{
    cap_value, decode_msr, encode_msr, write_allowed, MtrrReg, MTRR_FIXED_16K_COUNT,
    MTRR_FIXED_4K_COUNT, MTRR_VAR_MAX,
};

pub const MSR_TSC: u32 = 0x10;
pub const MSR_APICBASE: u32 = 0x1b;
pub const MSR_MCG_CAP: u32 = 0x179;
pub const MSR_MCG_STATUS: u32 = 0x17a;
pub const MSR_X2APIC_BASE: u32 = 0x800;
pub const MSR_X2APIC_MAX: u32 = 0x8ff;

fn is_apic_msr(msr: u32) -> bool {
    msr == MSR_APICBASE || (MSR_X2APIC_BASE..=MSR_X2APIC_MAX).contains(&msr)
}

/// What to do with an MSR the core does not model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledMsrPolicy {
    /// Return a `Rdmsr`/`Wrmsr` exit to the caller.
    #[default]
    Exit,
    /// Inject #GP(0) into the guest.
    InjectGp,
}

/// Outcome of an emulated MSR access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrResult {
    /// Read completed with this value.
    Value(u64),
    /// Write completed.
    Done,
    /// Architecturally invalid access; the guest gets #GP(0).
    Fault,
    /// Not an MSR the core models.
    Unhandled,
}

// ─── MTRR bank ───────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtrrError {
    #[error("MSR {0:#x} is not a configured MTRR")]
    NotMtrr(u32),

    #[error("MTRR {0:#x} is read-only")]
    ReadOnly(u32),

    #[error("value {value:#x} sets reserved bits of MTRR {msr:#x}")]
    Reserved { msr: u32, value: u64 },
}

/// Memory-type range registers of one vCPU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MtrrBank {
    def_type: u64,
    fixed64k: u64,
    fixed16k: [u64; MTRR_FIXED_16K_COUNT],
    fixed4k: [u64; MTRR_FIXED_4K_COUNT],
    var: [(u64, u64); MTRR_VAR_MAX],
}

impl MtrrBank {
    pub fn read(&self, msr: u32) -> Result<u64, MtrrError> {
        let reg = decode_msr(msr).ok_or(MtrrError::NotMtrr(msr))?;
        Ok(match reg {
            MtrrReg::Cap => cap_value(),
            MtrrReg::DefType => self.def_type,
            MtrrReg::Fixed64K => self.fixed64k,
            MtrrReg::Fixed16K(i) => self.fixed16k[i],
            MtrrReg::Fixed4K(i) => self.fixed4k[i],
            MtrrReg::VarBase(i) => self.var[i].0,
            MtrrReg::VarMask(i) => self.var[i].1,
        })
    }

    pub fn write(&mut self, msr: u32, value: u64) -> Result<(), MtrrError> {
        let reg = decode_msr(msr).ok_or(MtrrError::NotMtrr(msr))?;
        let slot = match reg {
            MtrrReg::Cap => return Err(MtrrError::ReadOnly(msr)),
            MtrrReg::DefType => &mut self.def_type,
            MtrrReg::Fixed64K => &mut self.fixed64k,
            MtrrReg::Fixed16K(i) => &mut self.fixed16k[i],
            MtrrReg::Fixed4K(i) => &mut self.fixed4k[i],
            MtrrReg::VarBase(i) => &mut self.var[i].0,
            MtrrReg::VarMask(i) => &mut self.var[i].1,
        };
        if !write_allowed(reg, value) {
            return Err(MtrrError::Reserved { msr, value });
        }
        *slot = value;
        Ok(())
    }

    /// MSR numbers of every writable register, in export order.
    pub fn writable_msrs() -> impl Iterator<Item = u32> {
        let fixed = [MtrrReg::DefType, MtrrReg::Fixed64K].into_iter();
        let f16 = (0..MTRR_FIXED_16K_COUNT).map(MtrrReg::Fixed16K);
        let f4 = (0..MTRR_FIXED_4K_COUNT).map(MtrrReg::Fixed4K);
        let var = (0..MTRR_VAR_MAX).flat_map(|i| [MtrrReg::VarBase(i), MtrrReg::VarMask(i)]);
        fixed.chain(f16).chain(f4).chain(var).map(encode_msr)
    }
}

// ─── Dispatch ────────────────────────────────────────────────────────

/// The per-vCPU and VM state an MSR access may touch.
pub(crate) struct MsrAccess<'a> {
    pub vcpu: usize,
    pub mtrr: &'a mut MtrrBank,
    pub tsc_offset: &'a mut u64,
    pub tsc_dirty: &'a mut bool,
    pub time: &'a TimeBase,
    pub host_tsc: u64,
    pub lapic: Option<&'a dyn LocalApic>,
}

impl MsrAccess<'_> {
    pub fn read(&self, msr: u32) -> MsrResult {
        match msr {
            MSR_TSC => MsrResult::Value(self.time.guest_tsc(self.host_tsc, *self.tsc_offset)),
            MSR_MCG_CAP | MSR_MCG_STATUS => MsrResult::Value(0),
            m if is_apic_msr(m) => match self.lapic {
                Some(lapic) => lapic.read_msr(self.vcpu, m).map_or(MsrResult::Fault, MsrResult::Value),
                None => MsrResult::Unhandled,
            },
            m => match self.mtrr.read(m) {
                Ok(v) => MsrResult::Value(v),
                Err(_) => MsrResult::Unhandled,
            },
        }
    }

    pub fn write(&mut self, msr: u32, value: u64) -> MsrResult {
        match msr {
            MSR_TSC => {
                *self.tsc_offset = self.time.vcpu_offset_for(self.host_tsc, value);
                *self.tsc_dirty = true;
                debug!("vcpu{}: guest TSC set to {value:#x}", self.vcpu);
                MsrResult::Done
            }
            // Machine-check state is not modelled; writes are ignored.
            MSR_MCG_CAP | MSR_MCG_STATUS => MsrResult::Done,
            m if is_apic_msr(m) => match self.lapic {
                Some(lapic) if lapic.write_msr(self.vcpu, m, value) => MsrResult::Done,
                Some(_) => MsrResult::Fault,
                None => MsrResult::Unhandled,
            },
            m => match self.mtrr.write(m, value) {
                Ok(()) => MsrResult::Done,
                Err(MtrrError::NotMtrr(_)) => MsrResult::Unhandled,
                Err(e) => {
                    debug!("vcpu{}: {e}", self.vcpu);
                    MsrResult::Fault
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TscCaps;
    use crate::time::ManualClock;
    use crate::verified::mtrr::{MSR_MTRR_CAP, MSR_MTRR_DEF_TYPE, MSR_MTRR_VAR_BASE};

    const GHZ: u64 = 1_000_000_000;

    fn time() -> TimeBase {
        let caps = TscCaps { scaling: true, frac_size: 32, max_ratio: 255 };
        TimeBase::new(&ManualClock::new(GHZ), caps, GHZ).unwrap()
    }

    struct Fixture {
        mtrr: MtrrBank,
        offset: u64,
        dirty: bool,
        time: TimeBase,
    }

    impl Fixture {
        fn new() -> Self {
            Self { mtrr: MtrrBank::default(), offset: 0, dirty: false, time: time() }
        }

        fn access(&mut self, host_tsc: u64) -> MsrAccess<'_> {
            MsrAccess {
                vcpu: 0,
                mtrr: &mut self.mtrr,
                tsc_offset: &mut self.offset,
                tsc_dirty: &mut self.dirty,
                time: &self.time,
                host_tsc,
                lapic: None,
            }
        }
    }

    #[test]
    fn mtrr_cap_is_read_only() {
        let mut bank = MtrrBank::default();
        assert_eq!(bank.read(MSR_MTRR_CAP), Ok(0x50a));
        assert_eq!(bank.write(MSR_MTRR_CAP, 0), Err(MtrrError::ReadOnly(MSR_MTRR_CAP)));
    }

    #[test]
    fn mtrr_reserved_bits_fault() {
        let mut fx = Fixture::new();
        assert_eq!(fx.access(0).write(MSR_MTRR_DEF_TYPE, 0x1000), MsrResult::Fault);
        assert_eq!(fx.access(0).write(MSR_MTRR_VAR_BASE + 1, 0x400), MsrResult::Fault);
        assert_eq!(fx.mtrr, MtrrBank::default());

        assert_eq!(fx.access(0).write(MSR_MTRR_DEF_TYPE, 0xc06), MsrResult::Done);
        assert_eq!(fx.access(0).read(MSR_MTRR_DEF_TYPE), MsrResult::Value(0xc06));
    }

    #[test]
    fn variable_mtrr_past_configured_range_is_unhandled() {
        let mut fx = Fixture::new();
        let past_end = MSR_MTRR_VAR_BASE + 2 * MTRR_VAR_MAX as u32;
        assert_eq!(fx.access(0).write(past_end, 0x6), MsrResult::Unhandled);
        assert_eq!(fx.access(0).read(past_end), MsrResult::Unhandled);
        assert_eq!(fx.mtrr, MtrrBank::default(), "bank must be unchanged");
    }

    #[test]
    fn every_writable_mtrr_round_trips() {
        let mut bank = MtrrBank::default();
        let msrs: Vec<u32> = MtrrBank::writable_msrs().collect();
        assert_eq!(msrs.len(), 2 + MTRR_FIXED_16K_COUNT + MTRR_FIXED_4K_COUNT + 2 * MTRR_VAR_MAX);
        for (i, &msr) in msrs.iter().enumerate() {
            bank.write(msr, i as u64).unwrap();
        }
        for (i, &msr) in msrs.iter().enumerate() {
            assert_eq!(bank.read(msr), Ok(i as u64), "msr {msr:#x}");
        }
    }

    #[test]
    fn tsc_write_rebases_vcpu_offset() {
        let mut fx = Fixture::new();
        assert_eq!(fx.access(1_000).read(MSR_TSC), MsrResult::Value(1_000));
        assert_eq!(fx.access(1_000).write(MSR_TSC, 50), MsrResult::Done);
        assert!(fx.dirty);
        assert_eq!(fx.access(1_500).read(MSR_TSC), MsrResult::Value(550));
    }

    #[test]
    fn machine_check_and_unknown_msrs() {
        let mut fx = Fixture::new();
        assert_eq!(fx.access(0).read(MSR_MCG_CAP), MsrResult::Value(0));
        assert_eq!(fx.access(0).write(MSR_MCG_STATUS, 5), MsrResult::Done);
        assert_eq!(fx.access(0).read(0xc000_0080), MsrResult::Unhandled);
        assert_eq!(fx.access(0).read(MSR_APICBASE), MsrResult::Unhandled, "no local APIC");
    }
}
