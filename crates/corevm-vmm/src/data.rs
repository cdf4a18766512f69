//! Versioned state import/export.
//!
//! Every exportable slice of VM or vCPU state is a *class* registered at a
//! *version*.  The registry is searched front to back and the first
//! `(class, version)` match wins.  Wire layouts live in [`corevm_data`].
//!
//! Reads are side-effect free and fill the caller's buffer completely or not
//! at all: an undersized buffer yields [`DataError::Space`] naming the size
//! that would have worked.  Writes validate every field before committing
//! any of them.

use std::sync::OnceLock;

use corevm_data::{
    FieldEntry, TimeInfoV1, VersionEntry, ARCH_BOOT_HRTIME, ARCH_PEND_EXCP,
    ARCH_PEND_EXTINT, ARCH_PEND_INTINFO, ARCH_PEND_NMI, ARCH_TSC_BOOT_OFFSET, ARCH_TSC_FREQ,
    ARCH_VM_IS_PAUSED, CLASS_MSR, CLASS_REGISTER, CLASS_VERSION, CLASS_VMM_ARCH, CLASS_VMM_TIME,
    FIELD_ENTRY_SIZE, TIME_INFO_V1_SIZE, VERSION_1, VERSION_ENTRY_SIZE,
};
use log::{debug, info, warn};
use thiserror::Error;

use crate::backend::{BackendError, Register};
use crate::msr::{MtrrBank, MtrrError, MSR_TSC};
use crate::time::{TimeBase, TimeError};
use crate::verified::intinfo::is_valid_pending_event;
use crate::vm::Vm;

/// Which selectors a class accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataScope {
    /// VM-wide state; no vCPU may be named.
    Vm,
    /// Per-vCPU state; a vCPU must be named.
    Vcpu,
    /// Either: VM-wide fields without a vCPU, per-vCPU fields with one.
    Any,
}

/// Selects one class of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRequest {
    pub class: u16,
    pub version: u16,
    /// `None` is the wildcard selector.
    pub vcpu: Option<usize>,
    /// For field-based reads: read only the idents already in the buffer.
    pub read_copyin: bool,
}

impl DataRequest {
    pub fn vm(class: u16, version: u16) -> Self {
        Self {
            class,
            version,
            vcpu: None,
            read_copyin: false,
        }
    }

    pub fn vcpu(class: u16, version: u16, vcpu: usize) -> Self {
        Self {
            vcpu: Some(vcpu),
            ..Self::vm(class, version)
        }
    }

    pub fn copyin(self) -> Self {
        Self {
            read_copyin: true,
            ..self
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DataError {
    #[error("no data class {class} at version {version}")]
    NotFound { class: u16, version: u16 },

    #[error("class {class} does not accept this vCPU selector")]
    BadScope { class: u16 },

    #[error("no such vCPU: {0}")]
    NoSuchVcpu(usize),

    #[error("buffer too small: {required} bytes required")]
    Space { required: usize },

    #[error("buffer length {len} is not valid (expected {expected})")]
    BadLength { len: usize, expected: usize },

    #[error("field entry {index} has nonzero reserved bytes")]
    MalformedEntry { index: usize },

    #[error("unknown field {ident:#x}")]
    UnknownField { ident: u32 },

    #[error("field {ident:#x} is read-only")]
    ReadOnlyField { ident: u32 },

    #[error("value {value:#x} is not valid for field {ident:#x}")]
    InvalidValue { ident: u32, value: u64 },

    #[error("version list does not match this VMM")]
    VersionMismatch,

    #[error("vCPU {vcpu} is running")]
    Busy { vcpu: usize },

    #[error("VM has been destroyed")]
    Destroyed,

    #[error(transparent)]
    Time(#[from] TimeError),

    /// The back end failed while the state was being accessed.
    #[error("back end: {0}")]
    Backend(String),
}

impl From<BackendError> for DataError {
    fn from(e: BackendError) -> Self {
        DataError::Backend(e.to_string())
    }
}

// ─── Descriptors ─────────────────────────────────────────────────────

/// One registered `(class, version)`.
pub(crate) trait DataDescriptor: Send + Sync {
    fn class(&self) -> u16;
    fn version(&self) -> u16;
    fn scope(&self) -> DataScope;

    /// Exact payload length, 0 when variable.
    fn len_expect(&self) -> usize {
        0
    }

    /// Length of one item for array payloads, 0 otherwise.
    fn len_per_item(&self) -> usize {
        0
    }

    /// Fill `buf`, returning the number of bytes used.
    fn read(&self, vm: &Vm, req: &DataRequest, buf: &mut [u8]) -> Result<usize, DataError>;

    fn write(&self, vm: &Vm, req: &DataRequest, buf: &[u8]) -> Result<(), DataError>;
}

fn registry() -> &'static [Box<dyn DataDescriptor>] {
    static REGISTRY: OnceLock<Vec<Box<dyn DataDescriptor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let classes: Vec<Box<dyn DataDescriptor>> = vec![
            Box::new(VersionClass),
            Box::new(Fields(RegisterClass)),
            Box::new(Fields(MsrClass)),
            Box::new(Fields(ArchClass)),
            Box::new(TimeClass),
        ];
        classes
    })
}

fn find(class: u16, version: u16) -> Result<&'static dyn DataDescriptor, DataError> {
    registry()
        .iter()
        .find(|d| d.class() == class && d.version() == version)
        .map(Box::as_ref)
        .ok_or(DataError::NotFound { class, version })
}

/// Every `(class, version)` this VMM understands, in registry order.
pub fn versions() -> Vec<VersionEntry> {
    registry()
        .iter()
        .map(|d| VersionEntry {
            class: d.class(),
            version: d.version(),
            len_expect: d.len_expect() as u16,
            len_per_item: d.len_per_item() as u16,
        })
        .collect()
}

impl Vm {
    /// Read the state selected by `req` into `buf`.
    pub fn data_read(&self, req: &DataRequest, buf: &mut [u8]) -> Result<usize, DataError> {
        let desc = find(req.class, req.version)?;
        self.check_scope(desc, req)?;
        let n = desc.read(self, req, buf)?;
        debug!("data read: class {} v{} vcpu {:?}: {n} bytes", req.class, req.version, req.vcpu);
        Ok(n)
    }

    /// Replace the state selected by `req` with `buf`.  All or nothing.
    pub fn data_write(&self, req: &DataRequest, buf: &[u8]) -> Result<(), DataError> {
        let _live = self.live().map_err(|_| DataError::Destroyed)?;
        let desc = find(req.class, req.version)?;
        self.check_scope(desc, req)?;
        desc.write(self, req, buf)?;
        debug!("data write: class {} v{} vcpu {:?}: {} bytes", req.class, req.version, req.vcpu, buf.len());
        Ok(())
    }

    fn check_scope(&self, desc: &dyn DataDescriptor, req: &DataRequest) -> Result<(), DataError> {
        if let Some(id) = req.vcpu {
            if id >= self.vcpu_count() {
                return Err(DataError::NoSuchVcpu(id));
            }
        }
        match (desc.scope(), req.vcpu) {
            (DataScope::Vm, Some(_)) | (DataScope::Vcpu, None) => {
                Err(DataError::BadScope { class: desc.class() })
            }
            _ => Ok(()),
        }
    }

    /// Make every vCPU reload its TSC before its next entry.
    fn mark_tsc_dirty(&self) {
        for vcpu in &self.vcpus {
            vcpu.lock().tsc_dirty = true;
        }
    }
}

// ─── VERSION ─────────────────────────────────────────────────────────

struct VersionClass;

impl DataDescriptor for VersionClass {
    fn class(&self) -> u16 {
        CLASS_VERSION
    }

    fn version(&self) -> u16 {
        VERSION_1
    }

    fn scope(&self) -> DataScope {
        DataScope::Any
    }

    fn len_per_item(&self) -> usize {
        VERSION_ENTRY_SIZE
    }

    fn read(&self, _vm: &Vm, _req: &DataRequest, buf: &mut [u8]) -> Result<usize, DataError> {
        let entries = versions();
        let required = entries.len() * VERSION_ENTRY_SIZE;
        if buf.len() < required {
            return Err(DataError::Space { required });
        }
        for (entry, out) in entries.iter().zip(buf.chunks_exact_mut(VERSION_ENTRY_SIZE)) {
            entry.encode(out).ok_or(DataError::Space { required })?;
        }
        Ok(required)
    }

    /// The list is fixed; a write only checks it matches.
    fn write(&self, _vm: &Vm, _req: &DataRequest, buf: &[u8]) -> Result<(), DataError> {
        let ours = versions();
        let required = ours.len() * VERSION_ENTRY_SIZE;
        if buf.len() < required {
            return Err(DataError::Space { required });
        }
        if buf.len() > required {
            return Err(DataError::BadLength { len: buf.len(), expected: required });
        }
        let theirs: Vec<VersionEntry> = buf
            .chunks_exact(VERSION_ENTRY_SIZE)
            .filter_map(VersionEntry::decode)
            .collect();
        if theirs != ours {
            return Err(DataError::VersionMismatch);
        }
        Ok(())
    }
}

// ─── Field-based classes ─────────────────────────────────────────────

/// A class whose payload is an array of [`FieldEntry`].
trait FieldClass: Send + Sync {
    const CLASS: u16;
    const VERSION: u16;
    const SCOPE: DataScope;

    /// Current values of `idents`, or of the default field list when `None`.
    fn read_fields(&self, vm: &Vm, vcpu: Option<usize>, idents: Option<&[u32]>)
        -> Result<Vec<FieldEntry>, DataError>;

    /// Validate all of `entries`, then apply all of them.
    fn write_fields(&self, vm: &Vm, vcpu: Option<usize>, entries: &[FieldEntry]) -> Result<(), DataError>;
}

struct Fields<C>(C);

impl<C: FieldClass> DataDescriptor for Fields<C> {
    fn class(&self) -> u16 {
        C::CLASS
    }

    fn version(&self) -> u16 {
        C::VERSION
    }

    fn scope(&self) -> DataScope {
        C::SCOPE
    }

    fn len_per_item(&self) -> usize {
        FIELD_ENTRY_SIZE
    }

    fn read(&self, vm: &Vm, req: &DataRequest, buf: &mut [u8]) -> Result<usize, DataError> {
        let idents: Option<Vec<u32>> = if req.read_copyin {
            Some(decode_entries(buf)?.into_iter().map(|e| e.ident).collect())
        } else {
            None
        };
        let entries = self.0.read_fields(vm, req.vcpu, idents.as_deref())?;

        let required = entries.len() * FIELD_ENTRY_SIZE;
        if buf.len() < required {
            return Err(DataError::Space { required });
        }
        for (entry, out) in entries.iter().zip(buf.chunks_exact_mut(FIELD_ENTRY_SIZE)) {
            entry.encode(out).ok_or(DataError::Space { required })?;
        }
        Ok(required)
    }

    fn write(&self, vm: &Vm, req: &DataRequest, buf: &[u8]) -> Result<(), DataError> {
        let entries = decode_entries(buf)?;
        self.0.write_fields(vm, req.vcpu, &entries)
    }
}

fn check_entry_len(len: usize) -> Result<(), DataError> {
    if len % FIELD_ENTRY_SIZE != 0 {
        return Err(DataError::Space {
            required: len.next_multiple_of(FIELD_ENTRY_SIZE),
        });
    }
    Ok(())
}

/// Decode a whole buffer of field entries.  One malformed entry fails it.
fn decode_entries(buf: &[u8]) -> Result<Vec<FieldEntry>, DataError> {
    check_entry_len(buf.len())?;
    buf.chunks_exact(FIELD_ENTRY_SIZE)
        .enumerate()
        .map(|(index, raw)| FieldEntry::decode(raw).ok_or(DataError::MalformedEntry { index }))
        .collect()
}

/// Resolve every ident up front so an unknown one fails the whole request.
fn resolve<T>(idents: &[u32], lookup: impl Fn(u32) -> Option<T>) -> Result<Vec<T>, DataError> {
    idents
        .iter()
        .map(|&ident| lookup(ident).ok_or(DataError::UnknownField { ident }))
        .collect()
}

fn vcpu_id(class: u16, vcpu: Option<usize>) -> Result<usize, DataError> {
    vcpu.ok_or(DataError::BadScope { class })
}

// ─── REGISTER ────────────────────────────────────────────────────────

struct RegisterClass;

impl FieldClass for RegisterClass {
    const CLASS: u16 = CLASS_REGISTER;
    const VERSION: u16 = VERSION_1;
    const SCOPE: DataScope = DataScope::Vcpu;

    fn read_fields(&self, vm: &Vm, vcpu: Option<usize>, idents: Option<&[u32]>)
        -> Result<Vec<FieldEntry>, DataError> {
        let id = vcpu_id(Self::CLASS, vcpu)?;
        let regs = match idents {
            Some(idents) => resolve(idents, Register::from_ident)?,
            None => Register::ALL.to_vec(),
        };
        let v = vm.vcpu(id).map_err(|_| DataError::NoSuchVcpu(id))?;
        let mut hw = v.try_hw().ok_or(DataError::Busy { vcpu: id })?;
        regs.into_iter()
            .map(|r| -> Result<FieldEntry, DataError> { Ok(FieldEntry::new(r.ident(), hw.get_register(r)?)) })
            .collect()
    }

    fn write_fields(&self, vm: &Vm, vcpu: Option<usize>, entries: &[FieldEntry]) -> Result<(), DataError> {
        let id = vcpu_id(Self::CLASS, vcpu)?;
        let idents: Vec<u32> = entries.iter().map(|e| e.ident).collect();
        let regs = resolve(&idents, Register::from_ident)?;
        let v = vm.vcpu(id).map_err(|_| DataError::NoSuchVcpu(id))?;
        let mut hw = v.try_hw().ok_or(DataError::Busy { vcpu: id })?;
        let saved = regs
            .iter()
            .map(|&r| hw.get_register(r))
            .collect::<Result<Vec<u64>, _>>()?;
        for (i, (&reg, entry)) in regs.iter().zip(entries).enumerate() {
            if let Err(e) = hw.set_register(reg, entry.value) {
                // Put back what this request already changed, newest first.
                for (&reg, &value) in regs[..i].iter().zip(&saved[..i]).rev() {
                    if let Err(undo) = hw.set_register(reg, value) {
                        warn!("vcpu{id}: restoring {reg:?} failed: {undo}");
                    }
                }
                return Err(e.into());
            }
        }
        Ok(())
    }
}

// ─── MSR ─────────────────────────────────────────────────────────────

struct MsrClass;

impl FieldClass for MsrClass {
    const CLASS: u16 = CLASS_MSR;
    const VERSION: u16 = VERSION_1;
    const SCOPE: DataScope = DataScope::Vcpu;

    fn read_fields(&self, vm: &Vm, vcpu: Option<usize>, idents: Option<&[u32]>)
        -> Result<Vec<FieldEntry>, DataError> {
        let id = vcpu_id(Self::CLASS, vcpu)?;
        let msrs: Vec<u32> = match idents {
            Some(idents) => idents.to_vec(),
            None => std::iter::once(MSR_TSC).chain(MtrrBank::writable_msrs()).collect(),
        };
        let v = vm.vcpu(id).map_err(|_| DataError::NoSuchVcpu(id))?;
        let s = v.lock();
        if s.on_cpu {
            return Err(DataError::Busy { vcpu: id });
        }
        let time = *vm.time.lock();
        let host_tsc = vm.clock.host_tsc();
        msrs.into_iter()
            .map(|msr| -> Result<FieldEntry, DataError> {
                let value = if msr == MSR_TSC {
                    time.guest_tsc(host_tsc, s.tsc_offset)
                } else {
                    s.mtrr
                        .read(msr)
                        .map_err(|_| DataError::UnknownField { ident: msr })?
                };
                Ok(FieldEntry::new(msr, value))
            })
            .collect()
    }

    fn write_fields(&self, vm: &Vm, vcpu: Option<usize>, entries: &[FieldEntry]) -> Result<(), DataError> {
        let id = vcpu_id(Self::CLASS, vcpu)?;
        let v = vm.vcpu(id).map_err(|_| DataError::NoSuchVcpu(id))?;
        let mut s = v.lock();
        if s.on_cpu {
            return Err(DataError::Busy { vcpu: id });
        }
        let time = *vm.time.lock();
        let host_tsc = vm.clock.host_tsc();

        let mut mtrr = s.mtrr.clone();
        let mut tsc_offset = None;
        for &FieldEntry { ident, value } in entries {
            if ident == MSR_TSC {
                tsc_offset = Some(time.vcpu_offset_for(host_tsc, value));
                continue;
            }
            mtrr.write(ident, value).map_err(|e| match e {
                MtrrError::NotMtrr(_) => DataError::UnknownField { ident },
                MtrrError::ReadOnly(_) => DataError::ReadOnlyField { ident },
                MtrrError::Reserved { .. } => DataError::InvalidValue { ident, value },
            })?;
        }

        s.mtrr = mtrr;
        if let Some(offset) = tsc_offset {
            s.tsc_offset = offset;
            s.tsc_dirty = true;
        }
        Ok(())
    }
}

// ─── VMM_ARCH ────────────────────────────────────────────────────────

const ARCH_VM_FIELDS: [u32; 4] = [
    ARCH_TSC_BOOT_OFFSET,
    ARCH_BOOT_HRTIME,
    ARCH_TSC_FREQ,
    ARCH_VM_IS_PAUSED,
];

const ARCH_VCPU_FIELDS: [u32; 4] = [
    ARCH_PEND_NMI,
    ARCH_PEND_EXTINT,
    ARCH_PEND_EXCP,
    ARCH_PEND_INTINFO,
];

struct ArchClass;

impl ArchClass {
    fn vm_field(vm: &Vm, time: &TimeBase, ident: u32) -> Option<u64> {
        Some(match ident {
            ARCH_TSC_BOOT_OFFSET => time.boot_offset(),
            ARCH_BOOT_HRTIME => time.boot_hrtime() as u64,
            ARCH_TSC_FREQ => time.guest_freq(),
            ARCH_VM_IS_PAUSED => vm.is_paused() as u64,
            _ => return None,
        })
    }

    fn write_vm(vm: &Vm, entries: &[FieldEntry]) -> Result<(), DataError> {
        let mut time = vm.time.lock();
        let mut staged = *time;
        for &FieldEntry { ident, value } in entries {
            match ident {
                ARCH_TSC_BOOT_OFFSET => staged.set_boot_offset(value),
                ARCH_BOOT_HRTIME => staged.set_boot_hrtime(value as i64),
                ARCH_TSC_FREQ | ARCH_VM_IS_PAUSED => {
                    // Accepted when unchanged, so a full read can be written back.
                    if Self::vm_field(vm, &time, ident) != Some(value) {
                        return Err(DataError::ReadOnlyField { ident });
                    }
                }
                _ => return Err(DataError::UnknownField { ident }),
            }
        }
        let rebased = staged != *time;
        *time = staged;
        drop(time);

        if rebased {
            info!("VM time base rebased through VMM_ARCH");
            vm.mark_tsc_dirty();
        }
        Ok(())
    }

    fn write_vcpu(vm: &Vm, id: usize, entries: &[FieldEntry]) -> Result<(), DataError> {
        let v = vm.vcpu(id).map_err(|_| DataError::NoSuchVcpu(id))?;
        let mut s = v.lock();
        let mut events = s.events;
        for &FieldEntry { ident, value } in entries {
            let invalid = DataError::InvalidValue { ident, value };
            match ident {
                ARCH_PEND_NMI | ARCH_PEND_EXTINT => {
                    let flag = match value {
                        0 => false,
                        1 => true,
                        _ => return Err(invalid),
                    };
                    if ident == ARCH_PEND_NMI {
                        events.nmi = flag;
                    } else {
                        events.extint = flag;
                    }
                }
                ARCH_PEND_EXCP | ARCH_PEND_INTINFO => {
                    if value != 0 && !is_valid_pending_event(value) {
                        return Err(invalid);
                    }
                    if ident == ARCH_PEND_EXCP {
                        events.exc_pending = value;
                    } else {
                        events.exit_intinfo = value;
                    }
                }
                _ => return Err(DataError::UnknownField { ident }),
            }
        }
        s.events = events;
        v.notify(&s);
        Ok(())
    }
}

impl FieldClass for ArchClass {
    const CLASS: u16 = CLASS_VMM_ARCH;
    const VERSION: u16 = VERSION_1;
    const SCOPE: DataScope = DataScope::Any;

    fn read_fields(&self, vm: &Vm, vcpu: Option<usize>, idents: Option<&[u32]>)
        -> Result<Vec<FieldEntry>, DataError> {
        match vcpu {
            None => {
                let idents = idents.unwrap_or(&ARCH_VM_FIELDS);
                let time = *vm.time.lock();
                let values = resolve(idents, |ident| Self::vm_field(vm, &time, ident))?;
                Ok(idents.iter().zip(values).map(|(&i, v)| FieldEntry::new(i, v)).collect())
            }
            Some(id) => {
                let idents = idents.unwrap_or(&ARCH_VCPU_FIELDS);
                let events = vm.vcpu(id).map_err(|_| DataError::NoSuchVcpu(id))?.events();
                let values = resolve(idents, |ident| match ident {
                    ARCH_PEND_NMI => Some(events.nmi as u64),
                    ARCH_PEND_EXTINT => Some(events.extint as u64),
                    ARCH_PEND_EXCP => Some(events.exc_pending),
                    ARCH_PEND_INTINFO => Some(events.exit_intinfo),
                    _ => None,
                })?;
                Ok(idents.iter().zip(values).map(|(&i, v)| FieldEntry::new(i, v)).collect())
            }
        }
    }

    fn write_fields(&self, vm: &Vm, vcpu: Option<usize>, entries: &[FieldEntry]) -> Result<(), DataError> {
        match vcpu {
            None => Self::write_vm(vm, entries),
            Some(id) => Self::write_vcpu(vm, id, entries),
        }
    }
}

// ─── VMM_TIME ────────────────────────────────────────────────────────

/// The time base as one blob.  Writing it is how a migrated guest keeps
/// counting from where the source left off.
struct TimeClass;

impl DataDescriptor for TimeClass {
    fn class(&self) -> u16 {
        CLASS_VMM_TIME
    }

    fn version(&self) -> u16 {
        VERSION_1
    }

    fn scope(&self) -> DataScope {
        DataScope::Vm
    }

    fn len_expect(&self) -> usize {
        TIME_INFO_V1_SIZE
    }

    fn read(&self, vm: &Vm, _req: &DataRequest, buf: &mut [u8]) -> Result<usize, DataError> {
        if buf.len() < TIME_INFO_V1_SIZE {
            return Err(DataError::Space { required: TIME_INFO_V1_SIZE });
        }
        let info = vm.time.lock().export(vm.clock());
        info.encode(buf).ok_or(DataError::Space { required: TIME_INFO_V1_SIZE })?;
        Ok(TIME_INFO_V1_SIZE)
    }

    fn write(&self, vm: &Vm, _req: &DataRequest, buf: &[u8]) -> Result<(), DataError> {
        if buf.len() < TIME_INFO_V1_SIZE {
            return Err(DataError::Space { required: TIME_INFO_V1_SIZE });
        }
        if buf.len() > TIME_INFO_V1_SIZE {
            return Err(DataError::BadLength { len: buf.len(), expected: TIME_INFO_V1_SIZE });
        }
        let info = TimeInfoV1::decode(buf).ok_or(DataError::Space { required: TIME_INFO_V1_SIZE })?;
        let imported = TimeBase::import(vm.clock(), vm.backend.tsc_caps(), &info)?;
        *vm.time.lock() = imported;
        info!(
            "VM time base imported: guest TSC {} at {} Hz",
            info.guest_tsc, info.guest_freq
        );
        vm.mark_tsc_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimBackend, SimHandle};
    use crate::backend::BackendKind;
    use crate::time::{ManualClock, TimeConfig};
    use crate::verified::intinfo::{hw_exception, IDT_GP, IDT_PF};
    use crate::verified::mtrr::{MSR_MTRR_CAP, MSR_MTRR_DEF_TYPE, MSR_MTRR_VAR_BASE, MTRR_VAR_MAX};
    use crate::vm::VmConfig;
    use corevm_data::field_entries;
    use std::sync::Arc;

    const GHZ: u64 = 1_000_000_000;

    fn sim_vm(vcpus: usize) -> (Arc<Vm>, SimHandle, Arc<ManualClock>) {
        let backend = SimBackend::new();
        let handle = backend.handle();
        let clock = Arc::new(ManualClock::new(GHZ));
        clock.set_wall_ns(1_700_000_000 * 1_000_000_000);
        let config = VmConfig {
            vcpus,
            backend: BackendKind::Sim,
            time: TimeConfig { guest_tsc_hz: GHZ, host_tsc_hz: GHZ },
            ..VmConfig::default()
        };
        let vm = Vm::with_backend(config, Box::new(backend), clock.clone()).unwrap();
        (vm, handle, clock)
    }

    fn entries(buf: &[u8]) -> Vec<FieldEntry> {
        field_entries(buf).collect()
    }

    fn encode(fields: &[FieldEntry]) -> Vec<u8> {
        let mut buf = vec![0; fields.len() * FIELD_ENTRY_SIZE];
        for (f, out) in fields.iter().zip(buf.chunks_exact_mut(FIELD_ENTRY_SIZE)) {
            f.encode(out).unwrap();
        }
        buf
    }

    /// Read a class into an exactly sized buffer.
    fn read_all(vm: &Vm, req: &DataRequest) -> Vec<u8> {
        let required = match vm.data_read(req, &mut []) {
            Ok(0) => return Vec::new(),
            Err(DataError::Space { required }) => required,
            other => panic!("unexpected {other:?}"),
        };
        let mut buf = vec![0; required];
        assert_eq!(vm.data_read(req, &mut buf).unwrap(), required);
        buf
    }

    #[test]
    fn registry_lists_itself() {
        let (vm, _, _) = sim_vm(1);
        let req = DataRequest::vm(CLASS_VERSION, VERSION_1);
        let buf = read_all(&vm, &req);
        let listed: Vec<VersionEntry> =
            buf.chunks_exact(VERSION_ENTRY_SIZE).filter_map(VersionEntry::decode).collect();
        assert_eq!(listed, versions());
        assert!(listed.iter().any(|e| e.class == CLASS_VMM_TIME && e.len_expect == 48));

        vm.data_write(&req, &buf).unwrap();
        let mut wrong = buf.clone();
        wrong[2] = 9;
        assert_eq!(vm.data_write(&req, &wrong), Err(DataError::VersionMismatch));
    }

    #[test]
    fn unknown_class_and_bad_selectors() {
        let (vm, _, _) = sim_vm(2);
        let mut buf = [0u8; 64];
        assert_eq!(
            vm.data_read(&DataRequest::vm(CLASS_MSR, 2), &mut buf),
            Err(DataError::NotFound { class: CLASS_MSR, version: 2 })
        );
        assert_eq!(
            vm.data_read(&DataRequest::vm(CLASS_MSR, VERSION_1), &mut buf),
            Err(DataError::BadScope { class: CLASS_MSR })
        );
        assert_eq!(
            vm.data_read(&DataRequest::vcpu(CLASS_VMM_TIME, VERSION_1, 0), &mut buf),
            Err(DataError::BadScope { class: CLASS_VMM_TIME })
        );
        assert_eq!(
            vm.data_read(&DataRequest::vcpu(CLASS_MSR, VERSION_1, 2), &mut buf),
            Err(DataError::NoSuchVcpu(2))
        );
    }

    #[test]
    fn undersized_read_reports_size_and_leaves_buffer() {
        let (vm, _, _) = sim_vm(1);
        let req = DataRequest::vcpu(CLASS_VMM_ARCH, VERSION_1, 0);
        let mut buf = [0xa5u8; 4 * FIELD_ENTRY_SIZE - 1];
        assert_eq!(
            vm.data_read(&req, &mut buf),
            Err(DataError::Space { required: 4 * FIELD_ENTRY_SIZE })
        );
        assert!(buf.iter().all(|&b| b == 0xa5));
    }

    #[test]
    fn msr_class_round_trips_mtrrs_and_tsc() {
        let (vm, _, _) = sim_vm(1);
        let req = DataRequest::vcpu(CLASS_MSR, VERSION_1, 0);
        let update = encode(&[
            FieldEntry::new(MSR_MTRR_DEF_TYPE, 0xc06),
            FieldEntry::new(MSR_MTRR_VAR_BASE, 0x8000_0006),
            FieldEntry::new(MSR_TSC, 12_345),
        ]);
        vm.data_write(&req, &update).unwrap();

        let buf = read_all(&vm, &req);
        let fields = entries(&buf);
        assert_eq!(fields[0], FieldEntry::new(MSR_TSC, 12_345));
        assert!(fields.contains(&FieldEntry::new(MSR_MTRR_DEF_TYPE, 0xc06)));
        assert!(fields.contains(&FieldEntry::new(MSR_MTRR_VAR_BASE, 0x8000_0006)));

        // Writing back what was read changes nothing.
        vm.data_write(&req, &buf).unwrap();
        assert_eq!(read_all(&vm, &req), buf);
    }

    #[test]
    fn msr_write_is_all_or_nothing() {
        let (vm, _, _) = sim_vm(1);
        let req = DataRequest::vcpu(CLASS_MSR, VERSION_1, 0);
        let before = read_all(&vm, &req);

        let past_end = MSR_MTRR_VAR_BASE + 2 * MTRR_VAR_MAX as u32;
        let cases = [
            (FieldEntry::new(past_end, 6), DataError::UnknownField { ident: past_end }),
            (FieldEntry::new(MSR_MTRR_CAP, 0), DataError::ReadOnlyField { ident: MSR_MTRR_CAP }),
            (
                FieldEntry::new(MSR_MTRR_DEF_TYPE, 0x1000),
                DataError::InvalidValue { ident: MSR_MTRR_DEF_TYPE, value: 0x1000 },
            ),
        ];
        for (bad, err) in cases {
            let buf = encode(&[FieldEntry::new(MSR_MTRR_DEF_TYPE, 0xc06), FieldEntry::new(MSR_TSC, 1), bad]);
            assert_eq!(vm.data_write(&req, &buf), Err(err));
            assert_eq!(read_all(&vm, &req), before);
        }

        let short = &before[..before.len() - 1];
        assert_eq!(
            vm.data_write(&req, short),
            Err(DataError::Space { required: before.len() })
        );
    }

    #[test]
    fn copyin_reads_only_requested_fields() {
        let (vm, _, _) = sim_vm(1);
        let req = DataRequest::vcpu(CLASS_MSR, VERSION_1, 0).copyin();
        let mut buf = encode(&[FieldEntry::new(MSR_MTRR_CAP, 0)]);
        assert_eq!(vm.data_read(&req, &mut buf).unwrap(), FIELD_ENTRY_SIZE);
        assert_eq!(entries(&buf), vec![FieldEntry::new(MSR_MTRR_CAP, 0x50a)]);

        let mut buf = encode(&[FieldEntry::new(0xc000_0080, 0)]);
        assert_eq!(
            vm.data_read(&req, &mut buf),
            Err(DataError::UnknownField { ident: 0xc000_0080 })
        );
    }

    #[test]
    fn register_class_goes_through_the_back_end() {
        let (vm, sim, _) = sim_vm(1);
        let req = DataRequest::vcpu(CLASS_REGISTER, VERSION_1, 0);
        vm.data_write(
            &req,
            &encode(&[
                FieldEntry::new(Register::Rip.ident(), 0xfff0),
                FieldEntry::new(Register::Rbx.ident(), 7),
            ]),
        )
        .unwrap();
        assert_eq!(sim.register(0, Register::Rip), 0xfff0);

        let buf = read_all(&vm, &req);
        assert_eq!(buf.len(), Register::ALL.len() * FIELD_ENTRY_SIZE);
        assert!(entries(&buf).contains(&FieldEntry::new(Register::Rbx.ident(), 7)));

        let bad = encode(&[FieldEntry::new(Register::Rax.ident(), 1), FieldEntry::new(0xffff, 0)]);
        assert_eq!(vm.data_write(&req, &bad), Err(DataError::UnknownField { ident: 0xffff }));
        assert_eq!(sim.register(0, Register::Rax), 0);
    }

    #[test]
    fn failed_register_write_restores_earlier_fields() {
        let (vm, sim, _) = sim_vm(1);
        let req = DataRequest::vcpu(CLASS_REGISTER, VERSION_1, 0);
        sim.set_register(0, Register::Rax, 0x11);
        sim.set_register(0, Register::Rbx, 0x22);
        sim.refuse_register(0, Register::Cr3);

        let update = encode(&[
            FieldEntry::new(Register::Rax.ident(), 1),
            FieldEntry::new(Register::Rbx.ident(), 2),
            FieldEntry::new(Register::Cr3.ident(), 0x1000),
        ]);
        assert!(matches!(vm.data_write(&req, &update), Err(DataError::Backend(_))));
        assert_eq!(sim.register(0, Register::Rax), 0x11);
        assert_eq!(sim.register(0, Register::Rbx), 0x22);
    }

    #[test]
    fn entries_with_reserved_bytes_set_are_refused() {
        let (vm, sim, _) = sim_vm(1);
        let req = DataRequest::vcpu(CLASS_REGISTER, VERSION_1, 0);
        let mut update = encode(&[
            FieldEntry::new(Register::Rax.ident(), 1),
            FieldEntry::new(Register::Rbx.ident(), 2),
        ]);
        update[FIELD_ENTRY_SIZE + 5] = 0x80;
        assert_eq!(vm.data_write(&req, &update), Err(DataError::MalformedEntry { index: 1 }));
        assert_eq!(sim.register(0, Register::Rax), 0, "nothing written");

        let copyin = DataRequest { read_copyin: true, ..req };
        assert_eq!(vm.data_read(&copyin, &mut update), Err(DataError::MalformedEntry { index: 1 }));
    }

    #[test]
    fn destroyed_vm_refuses_state_writes() {
        let (vm, _, _) = sim_vm(1);
        let req = DataRequest::vm(CLASS_VMM_TIME, VERSION_1);
        let buf = read_all(&vm, &req);
        vm.destroy().unwrap();
        assert_eq!(vm.data_write(&req, &buf), Err(DataError::Destroyed));
    }

    #[test]
    fn arch_vcpu_fields_overwrite_pending_events() {
        let (vm, _, _) = sim_vm(1);
        let req = DataRequest::vcpu(CLASS_VMM_ARCH, VERSION_1, 0);
        let gp = hw_exception(IDT_GP, Some(0));
        vm.data_write(
            &req,
            &encode(&[FieldEntry::new(ARCH_PEND_NMI, 1), FieldEntry::new(ARCH_PEND_EXCP, gp)]),
        )
        .unwrap();
        assert!(vm.nmi_pending(0).unwrap());
        assert_eq!(vm.intinfo(0).unwrap(), (0, gp));

        let buf = read_all(&vm, &req);
        assert_eq!(
            entries(&buf),
            vec![
                FieldEntry::new(ARCH_PEND_NMI, 1),
                FieldEntry::new(ARCH_PEND_EXTINT, 0),
                FieldEntry::new(ARCH_PEND_EXCP, gp),
                FieldEntry::new(ARCH_PEND_INTINFO, 0),
            ]
        );

        let bad = encode(&[
            FieldEntry::new(ARCH_PEND_NMI, 0),
            FieldEntry::new(ARCH_PEND_EXTINT, 2),
        ]);
        assert_eq!(
            vm.data_write(&req, &bad),
            Err(DataError::InvalidValue { ident: ARCH_PEND_EXTINT, value: 2 })
        );
        assert!(vm.nmi_pending(0).unwrap(), "rejected write left NMI alone");

        let pf_without_valid_bit = hw_exception(IDT_PF, Some(2)) & 0xffff_ffff_7fff_ffff;
        let bad = encode(&[FieldEntry::new(ARCH_PEND_INTINFO, pf_without_valid_bit)]);
        assert!(matches!(vm.data_write(&req, &bad), Err(DataError::InvalidValue { .. })));
    }

    #[test]
    fn arch_vm_fields_rebase_the_time_base() {
        let (vm, _, _) = sim_vm(2);
        let req = DataRequest::vm(CLASS_VMM_ARCH, VERSION_1);
        let buf = read_all(&vm, &req);
        assert_eq!(entries(&buf)[2], FieldEntry::new(ARCH_TSC_FREQ, GHZ));
        vm.data_write(&req, &buf).unwrap();

        vm.data_write(&req, &encode(&[FieldEntry::new(ARCH_TSC_BOOT_OFFSET, 1_000)]))
            .unwrap();
        assert_eq!(vm.guest_tsc(0).unwrap(), 1_000);
        assert_eq!(vm.guest_tsc(1).unwrap(), 1_000);

        assert_eq!(
            vm.data_write(&req, &encode(&[FieldEntry::new(ARCH_TSC_FREQ, 2 * GHZ)])),
            Err(DataError::ReadOnlyField { ident: ARCH_TSC_FREQ })
        );
        assert_eq!(
            vm.data_write(&req, &encode(&[FieldEntry::new(ARCH_PEND_NMI, 1)])),
            Err(DataError::UnknownField { ident: ARCH_PEND_NMI })
        );
    }

    #[test]
    fn time_blob_round_trips_and_carries_elapsed_time() {
        let (vm, _, clock) = sim_vm(1);
        let req = DataRequest::vm(CLASS_VMM_TIME, VERSION_1);
        clock.advance(500);
        let buf = read_all(&vm, &req);
        assert_eq!(buf.len(), TIME_INFO_V1_SIZE);
        vm.data_write(&req, &buf).unwrap();
        assert_eq!(read_all(&vm, &req), buf);

        let exported = TimeInfoV1::decode(&buf).unwrap();
        clock.advance(1_000);
        vm.data_write(&req, &buf).unwrap();
        // The wall clock moved on by 1 µs since the snapshot was taken.
        assert_eq!(vm.guest_tsc(0).unwrap(), exported.guest_tsc + 1_000);
    }

    #[test]
    fn time_blob_length_is_exact() {
        let (vm, _, _) = sim_vm(1);
        let req = DataRequest::vm(CLASS_VMM_TIME, VERSION_1);
        let before = read_all(&vm, &req);
        assert_eq!(
            vm.data_write(&req, &before[..TIME_INFO_V1_SIZE - 1]),
            Err(DataError::Space { required: TIME_INFO_V1_SIZE })
        );
        let mut long = before.clone();
        long.push(0);
        assert_eq!(
            vm.data_write(&req, &long),
            Err(DataError::BadLength { len: TIME_INFO_V1_SIZE + 1, expected: TIME_INFO_V1_SIZE })
        );

        let mut bad = TimeInfoV1::decode(&before).unwrap();
        bad.hres_ns = 1_000_000_000;
        let mut buf = [0u8; TIME_INFO_V1_SIZE];
        bad.encode(&mut buf).unwrap();
        assert!(matches!(vm.data_write(&req, &buf), Err(DataError::Time(_))));
        assert_eq!(read_all(&vm, &req), before);
    }

    #[test]
    fn time_blob_with_overflowing_uptime_is_refused() {
        let (vm, _, _) = sim_vm(1);
        let req = DataRequest::vm(CLASS_VMM_TIME, VERSION_1);
        let before = read_all(&vm, &req);

        let mut bad = TimeInfoV1::decode(&before).unwrap();
        bad.boot_hrtime = i64::MIN;
        bad.hrtime = i64::MAX;
        let mut buf = [0u8; TIME_INFO_V1_SIZE];
        bad.encode(&mut buf).unwrap();
        assert_eq!(
            vm.data_write(&req, &buf),
            Err(DataError::Time(TimeError::UptimeOverflow { boot_hrtime: i64::MIN, hrtime: i64::MAX }))
        );
        assert_eq!(read_all(&vm, &req), before);
    }
}
