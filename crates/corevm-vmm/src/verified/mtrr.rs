//! Pure MTRR register decoding and write validation.

/// Number of variable-range (base, mask) pairs exposed to the guest.
pub(crate) const MTRR_VAR_MAX: usize = 10;

pub(crate) const MSR_MTRR_CAP: u32 = 0xfe;
pub(crate) const MSR_MTRR_VAR_BASE: u32 = 0x200;
pub(crate) const MSR_MTRR_64K_BASE: u32 = 0x250;
pub(crate) const MSR_MTRR_16K_BASE: u32 = 0x258;
pub(crate) const MSR_MTRR_4K_BASE: u32 = 0x268;
pub(crate) const MSR_MTRR_DEF_TYPE: u32 = 0x2ff;

pub(crate) const MTRR_FIXED_16K_COUNT: usize = 2;
pub(crate) const MTRR_FIXED_4K_COUNT: usize = 8;

/// MTRRcap: write-combining supported.
pub(crate) const MTRR_CAP_WC: u64 = 0x400;
/// MTRRcap: fixed-range registers supported.
pub(crate) const MTRR_CAP_FIXED: u64 = 0x100;

/// Writable bits of MTRRdefType: type (7:0), FE (10), E (11).
pub(crate) const MTRR_DEF_MASK: u64 = 0xcff;
/// Writable bits of a PHYSBASE register: base address plus type.
pub(crate) const MTRR_PHYSBASE_MASK: u64 = 0x000f_ffff_ffff_f000 | 0xff;
/// Writable bits of a PHYSMASK register: mask address plus valid bit.
pub(crate) const MTRR_PHYSMASK_MASK: u64 = 0x000f_ffff_ffff_f000 | 0x800;

/// One architectural MTRR register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MtrrReg {
    Cap,
    DefType,
    Fixed64K,
    Fixed16K(usize),
    Fixed4K(usize),
    VarBase(usize),
    VarMask(usize),
}

/// Map an MSR number onto a configured MTRR register.
///
/// Variable-range MSRs past the configured pair count decode to `None`.
pub(crate) fn decode_msr(msr: u32) -> Option<MtrrReg> {
    let var_end = MSR_MTRR_VAR_BASE + (MTRR_VAR_MAX as u32) * 2;
    let reg = match msr {
        MSR_MTRR_CAP => MtrrReg::Cap,
        MSR_MTRR_DEF_TYPE => MtrrReg::DefType,
        MSR_MTRR_64K_BASE => MtrrReg::Fixed64K,
        m if (MSR_MTRR_16K_BASE..MSR_MTRR_16K_BASE + MTRR_FIXED_16K_COUNT as u32).contains(&m) => {
            MtrrReg::Fixed16K((m - MSR_MTRR_16K_BASE) as usize)
        }
        m if (MSR_MTRR_4K_BASE..MSR_MTRR_4K_BASE + MTRR_FIXED_4K_COUNT as u32).contains(&m) => {
            MtrrReg::Fixed4K((m - MSR_MTRR_4K_BASE) as usize)
        }
        m if (MSR_MTRR_VAR_BASE..var_end).contains(&m) => {
            let offset = (m - MSR_MTRR_VAR_BASE) as usize;
            if offset % 2 == 0 {
                MtrrReg::VarBase(offset / 2)
            } else {
                MtrrReg::VarMask(offset / 2)
            }
        }
        _ => return None,
    };
    Some(reg)
}

/// Inverse of [`decode_msr`].
pub(crate) fn encode_msr(reg: MtrrReg) -> u32 {
    let msr = match reg {
        MtrrReg::Cap => MSR_MTRR_CAP,
        MtrrReg::DefType => MSR_MTRR_DEF_TYPE,
        MtrrReg::Fixed64K => MSR_MTRR_64K_BASE,
        MtrrReg::Fixed16K(i) => MSR_MTRR_16K_BASE + i as u32,
        MtrrReg::Fixed4K(i) => MSR_MTRR_4K_BASE + i as u32,
        MtrrReg::VarBase(i) => MSR_MTRR_VAR_BASE + 2 * i as u32,
        MtrrReg::VarMask(i) => MSR_MTRR_VAR_BASE + 2 * i as u32 + 1,
    };
    debug_assert_eq!(decode_msr(msr), Some(reg), "encode/decode must agree");
    msr
}

/// Value reported by the read-only MTRRcap register.
pub(crate) const fn cap_value() -> u64 {
    MTRR_CAP_WC | MTRR_CAP_FIXED | MTRR_VAR_MAX as u64
}

/// Whether a guest write of `val` to `reg` is architecturally allowed.
///
/// MTRRcap is read-only.  Fixed-range registers accept any value.
pub(crate) fn write_allowed(reg: MtrrReg, val: u64) -> bool {
    match reg {
        MtrrReg::Cap => false,
        MtrrReg::DefType => val & !MTRR_DEF_MASK == 0,
        MtrrReg::VarBase(_) => val & !MTRR_PHYSBASE_MASK == 0,
        MtrrReg::VarMask(_) => val & !MTRR_PHYSMASK_MASK == 0,
        MtrrReg::Fixed64K | MtrrReg::Fixed16K(_) | MtrrReg::Fixed4K(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_range_decodes_pairs() {
        assert_eq!(decode_msr(0x200), Some(MtrrReg::VarBase(0)));
        assert_eq!(decode_msr(0x201), Some(MtrrReg::VarMask(0)));
        assert_eq!(decode_msr(0x212), Some(MtrrReg::VarBase(9)));
        assert_eq!(decode_msr(0x213), Some(MtrrReg::VarMask(9)));
    }

    #[test]
    fn variable_range_past_configured_count_is_unknown() {
        for msr in 0x214..0x250 {
            assert_eq!(decode_msr(msr), None, "msr {msr:#x}");
        }
    }

    #[test]
    fn fixed_ranges_decode() {
        assert_eq!(decode_msr(0x250), Some(MtrrReg::Fixed64K));
        assert_eq!(decode_msr(0x258), Some(MtrrReg::Fixed16K(0)));
        assert_eq!(decode_msr(0x259), Some(MtrrReg::Fixed16K(1)));
        assert_eq!(decode_msr(0x25a), None);
        assert_eq!(decode_msr(0x268), Some(MtrrReg::Fixed4K(0)));
        assert_eq!(decode_msr(0x26f), Some(MtrrReg::Fixed4K(7)));
        assert_eq!(decode_msr(0x270), None);
    }

    #[test]
    fn encode_inverts_decode() {
        let msrs = [0xfe, 0x2ff, 0x250, 0x258, 0x259, 0x268, 0x26c, 0x200, 0x213];
        for msr in msrs {
            let reg = decode_msr(msr).unwrap();
            assert_eq!(encode_msr(reg), msr);
        }
    }

    #[test]
    fn cap_reports_ten_variable_ranges() {
        assert_eq!(cap_value(), 0x50a);
    }

    #[test]
    fn write_validation() {
        assert!(!write_allowed(MtrrReg::Cap, 0));
        assert!(write_allowed(MtrrReg::DefType, 0xc06));
        assert!(!write_allowed(MtrrReg::DefType, 0x100));
        assert!(write_allowed(MtrrReg::VarBase(3), 0x0000_0000_8000_0006));
        assert!(!write_allowed(MtrrReg::VarBase(3), 0x0000_0000_8000_0800));
        assert!(write_allowed(MtrrReg::VarMask(3), 0x000f_ffff_c000_0800));
        assert!(!write_allowed(MtrrReg::VarMask(3), 0x000f_ffff_c000_0006));
        assert!(!write_allowed(MtrrReg::VarMask(0), 1 << 52));
        assert!(write_allowed(MtrrReg::Fixed4K(2), u64::MAX));
    }
}
