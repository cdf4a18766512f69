//! Wire layout for the corevm versioned state import/export protocol.
//!
//! Every exportable slice of VM or vCPU state is addressed by a
//! `(class, version)` pair.  This crate defines the class identifiers, the
//! field identifiers used by field-based classes, and the fixed-layout
//! records carried in request buffers.  It is `no_std`-compatible with zero
//! dependencies so that migration tooling can link it without the VMM.
//!
//! # Buffer kinds
//!
//! Classes come in two shapes:
//!
//! 1. **Field-based**: the buffer is an array of [`FieldEntry`] records
//!    (16 bytes each).  A reader may pre-populate the `ident` of each entry
//!    to select which fields it wants; otherwise the VMM emits its full
//!    default field list.
//! 2. **Blob-based**: the buffer holds a single fixed-size struct such as
//!    [`TimeInfoV1`].
//!
//! All multi-byte integers are little-endian.

#![cfg_attr(not(feature = "std"), no_std)]

// ═══════════════════════════════════════════════════════════════════════
//  Class identifiers
// ═══════════════════════════════════════════════════════════════════════

/// Lists every `(class, version)` pair the VMM understands.
pub const CLASS_VERSION: u16 = 1;

/// Guest general-purpose and control registers (per vCPU).
pub const CLASS_REGISTER: u16 = 2;

/// Emulated MSR state, including the MTRR bank (per vCPU).
pub const CLASS_MSR: u16 = 3;

/// Guest FPU state.  Reserved; not exported by this VMM.
pub const CLASS_FPU: u16 = 4;

/// Local APIC state.  Reserved; owned by the interrupt controller model.
pub const CLASS_LAPIC: u16 = 5;

/// VMM architectural state: time base plus pending-event slots.
pub const CLASS_VMM_ARCH: u16 = 6;

/// Legacy platform device classes.  Reserved for device models.
pub const CLASS_IOAPIC: u16 = 7;
pub const CLASS_ATPIT: u16 = 8;
pub const CLASS_ATPIC: u16 = 9;
pub const CLASS_HPET: u16 = 10;
pub const CLASS_PM_TIMER: u16 = 11;
pub const CLASS_RTC: u16 = 12;

/// VM time base: guest TSC frequency and the host instant it was sampled at.
pub const CLASS_VMM_TIME: u16 = 13;

/// The only version of every class currently defined.
pub const VERSION_1: u16 = 1;

/// Selector value meaning "no particular vCPU" for wildcard-capable classes.
pub const VCPU_WILDCARD: i32 = -1;

// ═══════════════════════════════════════════════════════════════════════
//  Field identifiers: CLASS_VMM_ARCH
// ═══════════════════════════════════════════════════════════════════════

/// VM-wide: TSC offset applied at boot (guest = scaled host + offset).
pub const ARCH_TSC_BOOT_OFFSET: u32 = 1;
/// VM-wide: host hrtime (ns) corresponding to guest boot.
pub const ARCH_BOOT_HRTIME: u32 = 2;
/// VM-wide: guest TSC frequency in Hz.  Read-only here; see [`CLASS_VMM_TIME`].
pub const ARCH_TSC_FREQ: u32 = 3;
/// VM-wide: whether the instance is paused.  Read-only.
pub const ARCH_VM_IS_PAUSED: u32 = 4;

/// Per-vCPU: NMI pending (0 or 1).
pub const ARCH_PEND_NMI: u32 = 10;
/// Per-vCPU: external interrupt pending (0 or 1).
pub const ARCH_PEND_EXTINT: u32 = 11;
/// Per-vCPU: pending exception, intinfo encoded.
pub const ARCH_PEND_EXCP: u32 = 12;
/// Per-vCPU: event interrupted by the last exit, intinfo encoded.
pub const ARCH_PEND_INTINFO: u32 = 13;

// ═══════════════════════════════════════════════════════════════════════
//  Field identifiers: CLASS_REGISTER
// ═══════════════════════════════════════════════════════════════════════

pub const REG_RAX: u32 = 0;
pub const REG_RBX: u32 = 1;
pub const REG_RCX: u32 = 2;
pub const REG_RDX: u32 = 3;
pub const REG_RSI: u32 = 4;
pub const REG_RDI: u32 = 5;
pub const REG_RBP: u32 = 6;
pub const REG_R8: u32 = 7;
pub const REG_R9: u32 = 8;
pub const REG_R10: u32 = 9;
pub const REG_R11: u32 = 10;
pub const REG_R12: u32 = 11;
pub const REG_R13: u32 = 12;
pub const REG_R14: u32 = 13;
pub const REG_R15: u32 = 14;
pub const REG_CR0: u32 = 15;
pub const REG_CR3: u32 = 16;
pub const REG_CR4: u32 = 17;
pub const REG_DR7: u32 = 18;
pub const REG_RSP: u32 = 19;
pub const REG_RIP: u32 = 20;
pub const REG_RFLAGS: u32 = 21;
pub const REG_EFER: u32 = 32;
pub const REG_CR2: u32 = 33;

// ═══════════════════════════════════════════════════════════════════════
//  Field entry
// ═══════════════════════════════════════════════════════════════════════

/// Size in bytes of one encoded [`FieldEntry`].
pub const FIELD_ENTRY_SIZE: usize = 16;

/// One `(ident, value)` pair of a field-based class.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    4     ident
/// 0x04    4     (reserved, zero)
/// 0x08    8     value
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldEntry {
    pub ident: u32,
    pub value: u64,
}

impl FieldEntry {
    pub const fn new(ident: u32, value: u64) -> Self {
        Self { ident, value }
    }

    /// Encode into the first [`FIELD_ENTRY_SIZE`] bytes of `buf`.
    ///
    /// Returns the number of bytes written, or `None` if `buf` is too small.
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let out = buf.get_mut(..FIELD_ENTRY_SIZE)?;
        out[0..4].copy_from_slice(&self.ident.to_le_bytes());
        out[4..8].copy_from_slice(&[0; 4]);
        out[8..16].copy_from_slice(&self.value.to_le_bytes());
        Some(FIELD_ENTRY_SIZE)
    }

    /// Decode from the first [`FIELD_ENTRY_SIZE`] bytes of `buf`.
    ///
    /// Returns `None` if `buf` is too small or the reserved bytes are not
    /// zero.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let raw = buf.get(..FIELD_ENTRY_SIZE)?;
        if raw[4..8] != [0; 4] {
            return None;
        }
        let ident = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let mut value = [0u8; 8];
        value.copy_from_slice(&raw[8..16]);
        Some(Self {
            ident,
            value: u64::from_le_bytes(value),
        })
    }
}

/// Iterate over the complete, well-formed field entries in `buf`.
///
/// Trailing bytes that do not form a whole entry and entries with reserved
/// bytes set are skipped; callers that must reject them decode each chunk
/// with [`FieldEntry::decode`] themselves.
pub fn field_entries(buf: &[u8]) -> impl Iterator<Item = FieldEntry> + '_ {
    buf.chunks_exact(FIELD_ENTRY_SIZE)
        .filter_map(FieldEntry::decode)
}

// ═══════════════════════════════════════════════════════════════════════
//  Version entry (CLASS_VERSION payload)
// ═══════════════════════════════════════════════════════════════════════

/// Size in bytes of one encoded [`VersionEntry`].
pub const VERSION_ENTRY_SIZE: usize = 8;

/// One registry entry as reported through [`CLASS_VERSION`].
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    2     class
/// 0x02    2     version
/// 0x04    2     len_expect     (0 = variable length)
/// 0x06    2     len_per_item   (0 = not an item array)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionEntry {
    pub class: u16,
    pub version: u16,
    pub len_expect: u16,
    pub len_per_item: u16,
}

impl VersionEntry {
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let out = buf.get_mut(..VERSION_ENTRY_SIZE)?;
        out[0..2].copy_from_slice(&self.class.to_le_bytes());
        out[2..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..6].copy_from_slice(&self.len_expect.to_le_bytes());
        out[6..8].copy_from_slice(&self.len_per_item.to_le_bytes());
        Some(VERSION_ENTRY_SIZE)
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let raw = buf.get(..VERSION_ENTRY_SIZE)?;
        Some(Self {
            class: u16::from_le_bytes([raw[0], raw[1]]),
            version: u16::from_le_bytes([raw[2], raw[3]]),
            len_expect: u16::from_le_bytes([raw[4], raw[5]]),
            len_per_item: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Time info (CLASS_VMM_TIME v1 payload)
// ═══════════════════════════════════════════════════════════════════════

/// Size in bytes of an encoded [`TimeInfoV1`].
pub const TIME_INFO_V1_SIZE: usize = 48;

/// Snapshot of the VM time base, tied to a host wall-clock instant.
///
/// A reader receives the guest TSC as of `hrtime`/`hres_*`.  A writer
/// supplies the same tuple from the source host; the VMM advances the
/// guest TSC by the wall time elapsed since `hres_*` before committing.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    8     guest_freq     Hz
/// 0x08    8     guest_tsc
/// 0x10    8     boot_hrtime    ns, signed
/// 0x18    8     hrtime         ns, signed
/// 0x20    8     hres_sec       wall clock seconds
/// 0x28    4     hres_ns        wall clock nanoseconds (< 1e9)
/// 0x2C    4     (reserved)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeInfoV1 {
    pub guest_freq: u64,
    pub guest_tsc: u64,
    pub boot_hrtime: i64,
    pub hrtime: i64,
    pub hres_sec: u64,
    pub hres_ns: u32,
}

impl TimeInfoV1 {
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let out = buf.get_mut(..TIME_INFO_V1_SIZE)?;
        out[0x00..0x08].copy_from_slice(&self.guest_freq.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.guest_tsc.to_le_bytes());
        out[0x10..0x18].copy_from_slice(&self.boot_hrtime.to_le_bytes());
        out[0x18..0x20].copy_from_slice(&self.hrtime.to_le_bytes());
        out[0x20..0x28].copy_from_slice(&self.hres_sec.to_le_bytes());
        out[0x28..0x2C].copy_from_slice(&self.hres_ns.to_le_bytes());
        out[0x2C..0x30].copy_from_slice(&[0; 4]);
        Some(TIME_INFO_V1_SIZE)
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let raw = buf.get(..TIME_INFO_V1_SIZE)?;
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[off..off + 8]);
            u64::from_le_bytes(b)
        };
        Some(Self {
            guest_freq: u64_at(0x00),
            guest_tsc: u64_at(0x08),
            boot_hrtime: u64_at(0x10) as i64,
            hrtime: u64_at(0x18) as i64,
            hres_sec: u64_at(0x20),
            hres_ns: u32::from_le_bytes([raw[0x28], raw[0x29], raw[0x2A], raw[0x2B]]),
        })
    }
}
