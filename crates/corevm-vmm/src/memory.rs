//! Guest memory segments and guest-physical mappings.
//!
//! A **segment** is a host allocation (anonymous, or a window of a file for
//! device memory) identified by a small integer id.  A **mapping** exposes a
//! page-aligned window of a segment at a guest-physical address.  Mappings
//! hold an `Arc` to their segment, so freeing a segment only drops the VM's
//! reference; the backing memory lives on until the last mapping of it is
//! removed.
//!
//! ```text
//!   segments (≤ 5)                     mappings (≤ 8)
//!  ┌────┬───────────────┐          ┌──────────┬─────┬────────┐
//!  │ 0  │ sysmem 1 MiB  │◀─────────│ gpa 0    │ seg │ off 0  │
//!  │ 1  │ "fb" 64 KiB   │◀──┐      ├──────────┼─────┼────────┤
//!  │ .. │               │   └──────│ gpa 0xe0…│ seg │ off 0  │
//!  └────┴───────────────┘          └──────────┴─────┴────────┘
//! ```
//!
//! Both tables sit behind one VM-wide `RwLock`.  Address lookups take the
//! read side and run concurrently across vCPUs; allocation, map and unmap
//! take the write side.  Every mutating call validates fully before it
//! touches the table or the back end, so a rejected request leaves no trace.

use std::fs::File;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use vm_memory::mmap::MmapRegionError;
use vm_memory::{FileOffset, MmapRegion, VolatileMemory, VolatileMemoryError};

use crate::backend::{Backend, BackendError};
use crate::verified::memory::{contains, is_page_aligned, range_end, range_within, ranges_overlap};

// ═══════════════════════════════════════════════════════════════════════
//  Limits and flags
// ═══════════════════════════════════════════════════════════════════════

/// Capacity of the segment table.
pub const VM_MAX_MEMSEGS: usize = 5;

/// Capacity of the mapping table.
pub const VM_MAX_MEMMAPS: usize = 8;

pub use crate::verified::memory::PAGE_SIZE;

/// Guest access permissions of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Prot(u8);

impl Prot {
    pub const READ: Prot = Prot(1);
    pub const WRITE: Prot = Prot(2);
    pub const EXEC: Prot = Prot(4);
    pub const ALL: Prot = Prot(7);

    pub const fn from_bits(bits: u8) -> Prot {
        Prot(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Prot) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Prot) -> Prot {
        Prot(self.0 | other.0)
    }
}

/// The mapping is in use by a pass-through device and can only be removed
/// by destroying the VM.
pub const MAP_FLAG_IOMMU: u32 = 1;

const MAP_FLAGS_VALID: u32 = MAP_FLAG_IOMMU;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("segment id {id} is out of range")]
    InvalidSegmentId { id: usize },

    #[error("segment {id} already exists with the requested layout")]
    SegmentExists { id: usize },

    #[error("segment slot {id} is occupied by a different segment")]
    SegmentSlotBusy { id: usize },

    #[error("segment {id} is not allocated")]
    NoSuchSegment { id: usize },

    #[error("invalid segment length {len:#x}")]
    InvalidLength { len: u64 },

    #[error("{what} {value:#x} is not page aligned")]
    Unaligned { what: &'static str, value: u64 },

    #[error("range {segoff:#x}+{len:#x} exceeds segment {segid} of {seg_len:#x} bytes")]
    OutOfSegment {
        segid: usize,
        segoff: u64,
        len: u64,
        seg_len: u64,
    },

    #[error("invalid protection {0:#x}")]
    InvalidProt(u8),

    #[error("invalid mapping flags {0:#x}")]
    InvalidFlags(u32),

    #[error("range {gpa:#x}+{len:#x} overlaps the mapping at {existing:#x}")]
    Overlap { gpa: u64, len: u64, existing: u64 },

    #[error("mapping table is full")]
    TableFull,

    #[error("no removable mapping at {gpa:#x}+{len:#x}")]
    NoSuchMapping { gpa: u64, len: u64 },

    #[error("guest-physical address {gpa:#x} is not mapped")]
    Unmapped { gpa: u64 },

    #[error("access to {gpa:#x} violates mapping protection")]
    Protection { gpa: u64 },

    #[error("failed to allocate segment backing: {0}")]
    Mmap(#[source] MmapRegionError),

    #[error("host memory access failed: {0}")]
    Access(#[source] VolatileMemoryError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

// ═══════════════════════════════════════════════════════════════════════
//  Segments
// ═══════════════════════════════════════════════════════════════════════

/// What backs a new segment.
#[derive(Debug)]
pub enum SegmentKind {
    /// Anonymous memory backing guest RAM.
    Sysmem,
    /// Device memory, optionally named and optionally backed by a file window.
    Device {
        name: Option<String>,
        file: Option<(File, u64)>,
    },
}

/// Public description of an allocated segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub id: usize,
    pub len: u64,
    pub sysmem: bool,
    pub name: Option<String>,
}

#[derive(Debug)]
struct MemSegment {
    id: usize,
    len: u64,
    sysmem: bool,
    name: Option<String>,
    region: MmapRegion,
}

impl MemSegment {
    fn info(&self) -> SegmentInfo {
        SegmentInfo {
            id: self.id,
            len: self.len,
            sysmem: self.sysmem,
            name: self.name.clone(),
        }
    }

    fn host_addr(&self, offset: u64) -> u64 {
        self.region.as_ptr() as u64 + offset
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Mappings
// ═══════════════════════════════════════════════════════════════════════

/// Parameters of a new guest-physical mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub gpa: u64,
    pub segid: usize,
    pub segoff: u64,
    pub len: u64,
    pub prot: Prot,
    pub flags: u32,
}

impl MapRequest {
    /// Read/write/exec mapping of `len` bytes of `segid` from offset 0.
    pub fn new(gpa: u64, segid: usize, len: u64) -> Self {
        Self {
            gpa,
            segid,
            segoff: 0,
            len,
            prot: Prot::ALL,
            flags: 0,
        }
    }
}

/// Public description of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingInfo {
    pub gpa: u64,
    pub len: u64,
    pub segid: usize,
    pub segoff: u64,
    pub prot: Prot,
    pub flags: u32,
    pub sysmem: bool,
}

#[derive(Debug)]
struct MemMapping {
    gpa: u64,
    len: u64,
    segoff: u64,
    prot: Prot,
    flags: u32,
    segment: Arc<MemSegment>,
}

impl MemMapping {
    fn info(&self) -> MappingInfo {
        MappingInfo {
            gpa: self.gpa,
            len: self.len,
            segid: self.segment.id,
            segoff: self.segoff,
            prot: self.prot,
            flags: self.flags,
            sysmem: self.segment.sysmem,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    segs: [Option<Arc<MemSegment>>; VM_MAX_MEMSEGS],
    maps: [Option<MemMapping>; VM_MAX_MEMMAPS],
}

impl Tables {
    fn find_map(&self, gpa: u64) -> Option<&MemMapping> {
        self.maps
            .iter()
            .flatten()
            .find(|m| contains(m.gpa, m.len, gpa))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Manager
// ═══════════════════════════════════════════════════════════════════════

/// Segment and mapping tables of one VM.
#[derive(Debug, Default)]
pub struct GuestMemory {
    tables: RwLock<Tables>,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate segment `id` of `len` bytes.
    ///
    /// Re-allocating an existing segment with the same length and kind
    /// reports [`MemoryError::SegmentExists`] so callers can treat the call
    /// as idempotent.
    pub fn alloc_segment(&self, id: usize, len: u64, kind: SegmentKind) -> Result<(), MemoryError> {
        if id >= VM_MAX_MEMSEGS {
            return Err(MemoryError::InvalidSegmentId { id });
        }
        if len == 0 || !is_page_aligned(len) || usize::try_from(len).is_err() {
            return Err(MemoryError::InvalidLength { len });
        }
        let sysmem = matches!(kind, SegmentKind::Sysmem);

        let mut tables = self.tables.write();
        if let Some(existing) = &tables.segs[id] {
            return Err(if existing.len == len && existing.sysmem == sysmem {
                MemoryError::SegmentExists { id }
            } else {
                MemoryError::SegmentSlotBusy { id }
            });
        }

        let (name, region) = match kind {
            SegmentKind::Sysmem => (None, MmapRegion::<()>::new(len as usize)),
            SegmentKind::Device { name, file: None } => (name, MmapRegion::<()>::new(len as usize)),
            SegmentKind::Device {
                name,
                file: Some((file, offset)),
            } => (
                name,
                MmapRegion::<()>::from_file(FileOffset::new(file, offset), len as usize),
            ),
        };
        let region = region.map_err(MemoryError::Mmap)?;

        info!(
            "segment {id}: {len:#x} bytes ({})",
            if sysmem { "sysmem" } else { name.as_deref().unwrap_or("device") }
        );
        tables.segs[id] = Some(Arc::new(MemSegment {
            id,
            len,
            sysmem,
            name,
            region,
        }));
        Ok(())
    }

    /// Drop the VM's reference to segment `id`.
    ///
    /// Mappings of the segment stay valid; the host memory is released once
    /// the last of them is unmapped.
    pub fn free_segment(&self, id: usize) -> Result<(), MemoryError> {
        if id >= VM_MAX_MEMSEGS {
            return Err(MemoryError::InvalidSegmentId { id });
        }
        let mut tables = self.tables.write();
        match tables.segs[id].take() {
            Some(seg) => {
                debug!("segment {id} freed ({} mapping refs remain)", Arc::strong_count(&seg) - 1);
                Ok(())
            }
            None => Err(MemoryError::NoSuchSegment { id }),
        }
    }

    pub fn segment(&self, id: usize) -> Result<SegmentInfo, MemoryError> {
        if id >= VM_MAX_MEMSEGS {
            return Err(MemoryError::InvalidSegmentId { id });
        }
        self.tables.read().segs[id]
            .as_ref()
            .map(|s| s.info())
            .ok_or(MemoryError::NoSuchSegment { id })
    }

    /// Map a window of a segment into guest-physical space.
    pub fn map(&self, backend: &dyn Backend, req: MapRequest) -> Result<(), MemoryError> {
        if req.prot.bits() == 0 || !Prot::ALL.contains(req.prot) {
            return Err(MemoryError::InvalidProt(req.prot.bits()));
        }
        if req.flags & !MAP_FLAGS_VALID != 0 {
            return Err(MemoryError::InvalidFlags(req.flags));
        }
        if req.segid >= VM_MAX_MEMSEGS {
            return Err(MemoryError::InvalidSegmentId { id: req.segid });
        }
        if req.len == 0 {
            return Err(MemoryError::InvalidLength { len: req.len });
        }
        for (what, value) in [("gpa", req.gpa), ("segment offset", req.segoff), ("length", req.len)] {
            if !is_page_aligned(value) {
                return Err(MemoryError::Unaligned { what, value });
            }
        }
        if range_end(req.gpa, req.len).is_none() {
            return Err(MemoryError::InvalidLength { len: req.len });
        }

        let mut tables = self.tables.write();
        let segment = tables.segs[req.segid]
            .clone()
            .ok_or(MemoryError::NoSuchSegment { id: req.segid })?;
        if !range_within(req.segoff, req.len, segment.len) {
            return Err(MemoryError::OutOfSegment {
                segid: req.segid,
                segoff: req.segoff,
                len: req.len,
                seg_len: segment.len,
            });
        }
        if let Some(existing) = tables
            .maps
            .iter()
            .flatten()
            .find(|m| ranges_overlap(m.gpa, m.len, req.gpa, req.len))
        {
            return Err(MemoryError::Overlap {
                gpa: req.gpa,
                len: req.len,
                existing: existing.gpa,
            });
        }
        let slot = tables
            .maps
            .iter()
            .position(Option::is_none)
            .ok_or(MemoryError::TableFull)?;

        backend.map_memory(
            slot as u32,
            req.gpa,
            segment.host_addr(req.segoff),
            req.len,
            !req.prot.contains(Prot::WRITE),
        )?;

        info!(
            "map gpa {:#x}+{:#x} -> segment {} offset {:#x} (slot {slot})",
            req.gpa, req.len, req.segid, req.segoff
        );
        tables.maps[slot] = Some(MemMapping {
            gpa: req.gpa,
            len: req.len,
            segoff: req.segoff,
            prot: req.prot,
            flags: req.flags,
            segment,
        });
        Ok(())
    }

    /// Remove the mapping that starts at `gpa` and spans exactly `len` bytes.
    ///
    /// IOMMU mappings are never removed here.
    pub fn unmap(&self, backend: &dyn Backend, gpa: u64, len: u64) -> Result<(), MemoryError> {
        let mut tables = self.tables.write();
        let slot = tables
            .maps
            .iter()
            .position(|m| {
                m.as_ref().is_some_and(|m| {
                    m.gpa == gpa && m.len == len && m.flags & MAP_FLAG_IOMMU == 0
                })
            })
            .ok_or(MemoryError::NoSuchMapping { gpa, len })?;

        backend.unmap_memory(slot as u32)?;
        tables.maps[slot] = None;
        info!("unmapped gpa {gpa:#x}+{len:#x} (slot {slot})");
        Ok(())
    }

    /// Remove every mapping and segment, IOMMU mappings included.
    pub fn release_all(&self, backend: &dyn Backend) {
        let mut tables = self.tables.write();
        for (slot, map) in tables.maps.iter_mut().enumerate() {
            if map.take().is_some() {
                if let Err(e) = backend.unmap_memory(slot as u32) {
                    log::warn!("releasing slot {slot}: {e}");
                }
            }
        }
        for seg in tables.segs.iter_mut() {
            seg.take();
        }
    }

    /// The mapping with the lowest start address at or above `gpa`.
    pub fn mapping_next(&self, gpa: u64) -> Option<MappingInfo> {
        self.tables
            .read()
            .maps
            .iter()
            .flatten()
            .filter(|m| m.gpa >= gpa)
            .min_by_key(|m| m.gpa)
            .map(MemMapping::info)
    }

    /// The mapping covering `gpa`, if any.
    pub fn lookup(&self, gpa: u64) -> Option<MappingInfo> {
        self.tables.read().find_map(gpa).map(MemMapping::info)
    }

    /// All mappings ordered by guest-physical address.
    pub fn mappings(&self) -> Vec<MappingInfo> {
        let mut out: Vec<_> = self
            .tables
            .read()
            .maps
            .iter()
            .flatten()
            .map(MemMapping::info)
            .collect();
        out.sort_by_key(|m| m.gpa);
        out
    }

    pub fn is_sysmem(&self, gpa: u64) -> bool {
        self.tables
            .read()
            .find_map(gpa)
            .is_some_and(|m| m.segment.sysmem)
    }

    /// One past the highest guest-physical byte backed by system memory.
    pub fn sysmem_max_addr(&self) -> u64 {
        self.tables
            .read()
            .maps
            .iter()
            .flatten()
            .filter(|m| m.segment.sysmem)
            .map(|m| m.gpa + m.len)
            .max()
            .unwrap_or(0)
    }

    /// Copy guest memory at `gpa` into `buf`.  May span adjacent mappings.
    pub fn read_gpa(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let tables = self.tables.read();
        let mut done = 0usize;
        for (map, off, n) in Self::chunks(&tables, gpa, buf.len(), Prot::READ)? {
            map.segment
                .region
                .get_slice(off, n)
                .map_err(MemoryError::Access)?
                .copy_to(&mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Copy `buf` into guest memory at `gpa`.  May span adjacent mappings.
    /// Nothing is written unless the whole range is writable.
    pub fn write_gpa(&self, gpa: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let tables = self.tables.read();
        let mut done = 0usize;
        for (map, off, n) in Self::chunks(&tables, gpa, buf.len(), Prot::WRITE)? {
            map.segment
                .region
                .get_slice(off, n)
                .map_err(MemoryError::Access)?
                .copy_from(&buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Split `len` bytes at `gpa` into per-mapping pieces.  Fails before
    /// anything is touched if any byte is unmapped or lacks `need`.
    fn chunks(
        tables: &Tables,
        gpa: u64,
        len: usize,
        need: Prot,
    ) -> Result<Vec<(&MemMapping, usize, usize)>, MemoryError> {
        let mut out = Vec::new();
        let mut done = 0usize;
        while done < len {
            let addr = gpa
                .checked_add(done as u64)
                .ok_or(MemoryError::Unmapped { gpa: u64::MAX })?;
            let (map, off, n) = Self::chunk(tables, addr, len - done, need)?;
            map.segment.region.get_slice(off, n).map_err(MemoryError::Access)?;
            out.push((map, off, n));
            done += n;
        }
        Ok(out)
    }

    /// Mapping covering `addr`, the segment offset of `addr`, and how many of
    /// `want` bytes fit before the mapping ends.
    fn chunk(
        tables: &Tables,
        addr: u64,
        want: usize,
        need: Prot,
    ) -> Result<(&MemMapping, usize, usize), MemoryError> {
        let map = tables
            .find_map(addr)
            .ok_or(MemoryError::Unmapped { gpa: addr })?;
        if !map.prot.contains(need) {
            return Err(MemoryError::Protection { gpa: addr });
        }
        let within = addr - map.gpa;
        let n = ((map.len - within) as usize).min(want);
        Ok((map, (map.segoff + within) as usize, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimBackend, SimRecord};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;
    use std::io::Write;

    const MIB: u64 = 1 << 20;

    fn sysmem(len: u64) -> GuestMemory {
        let mem = GuestMemory::new();
        mem.alloc_segment(0, len, SegmentKind::Sysmem).unwrap();
        mem
    }

    // ─── Segments ────────────────────────────────────────────────────

    #[test]
    fn segment_allocation_validates_id_and_length() {
        let mem = GuestMemory::new();
        assert!(matches!(
            mem.alloc_segment(VM_MAX_MEMSEGS, PAGE_SIZE, SegmentKind::Sysmem),
            Err(MemoryError::InvalidSegmentId { .. })
        ));
        assert!(matches!(
            mem.alloc_segment(0, 0, SegmentKind::Sysmem),
            Err(MemoryError::InvalidLength { len: 0 })
        ));
        assert!(matches!(
            mem.alloc_segment(0, 100, SegmentKind::Sysmem),
            Err(MemoryError::InvalidLength { len: 100 })
        ));
    }

    #[test]
    fn reallocating_a_segment() {
        let mem = sysmem(MIB);
        assert!(matches!(
            mem.alloc_segment(0, MIB, SegmentKind::Sysmem),
            Err(MemoryError::SegmentExists { id: 0 })
        ));
        assert!(matches!(
            mem.alloc_segment(0, 2 * MIB, SegmentKind::Sysmem),
            Err(MemoryError::SegmentSlotBusy { id: 0 })
        ));
        let info = mem.segment(0).unwrap();
        assert_eq!(info.len, MIB);
        assert!(info.sysmem);
    }

    #[test]
    fn file_backed_device_segment() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0x5a; 2 * PAGE_SIZE as usize]).unwrap();

        let backend = SimBackend::new();
        let mem = GuestMemory::new();
        mem.alloc_segment(
            1,
            PAGE_SIZE,
            SegmentKind::Device {
                name: Some("rom".into()),
                file: Some((file, PAGE_SIZE)),
            },
        )
        .unwrap();
        mem.map(&backend, MapRequest { prot: Prot::READ, ..MapRequest::new(0xf_0000, 1, PAGE_SIZE) })
            .unwrap();

        let mut buf = [0u8; 4];
        mem.read_gpa(0xf_0000, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; 4]);
        assert!(!mem.is_sysmem(0xf_0000));
        assert_eq!(mem.segment(1).unwrap().name.as_deref(), Some("rom"));
    }

    // ─── Mapping validation ──────────────────────────────────────────

    #[test]
    fn map_rejects_bad_requests_without_side_effects() {
        let backend = SimBackend::new();
        let handle = backend.handle();
        let mem = sysmem(MIB);

        let bad = [
            MapRequest { prot: Prot::from_bits(0), ..MapRequest::new(0, 0, PAGE_SIZE) },
            MapRequest { prot: Prot::from_bits(8), ..MapRequest::new(0, 0, PAGE_SIZE) },
            MapRequest { flags: 2, ..MapRequest::new(0, 0, PAGE_SIZE) },
            MapRequest::new(0x10, 0, PAGE_SIZE),
            MapRequest { segoff: 1, ..MapRequest::new(0, 0, PAGE_SIZE) },
            MapRequest::new(0, 0, 0),
            MapRequest::new(0, 0, 2 * MIB),
            MapRequest { segoff: MIB, ..MapRequest::new(0, 0, PAGE_SIZE) },
            MapRequest::new(0, 3, PAGE_SIZE),
            MapRequest::new(0, VM_MAX_MEMSEGS, PAGE_SIZE),
        ];
        for req in bad {
            assert!(mem.map(&backend, req).is_err(), "{req:?} accepted");
        }
        assert!(mem.mappings().is_empty());
        assert!(handle.records().is_empty(), "back end must not be touched");
    }

    #[test]
    fn overlapping_map_is_rejected_and_table_unchanged() {
        let backend = SimBackend::new();
        let mem = sysmem(MIB);
        mem.map(&backend, MapRequest::new(0, 0, MIB)).unwrap();
        let before = mem.mappings();

        let err = mem
            .map(&backend, MapRequest::new(0x8_0000, 0, 0x1_0000))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Overlap { existing: 0, .. }), "{err}");
        assert_eq!(mem.mappings(), before);
    }

    #[test]
    fn table_capacity_is_enforced() {
        let backend = SimBackend::new();
        let mem = sysmem(MIB);
        for i in 0..VM_MAX_MEMMAPS as u64 {
            mem.map(&backend, MapRequest::new(i * 0x10_0000, 0, PAGE_SIZE)).unwrap();
        }
        assert!(matches!(
            mem.map(&backend, MapRequest::new(0x1000_0000, 0, PAGE_SIZE)),
            Err(MemoryError::TableFull)
        ));
    }

    #[test]
    fn randomized_mappings_never_overlap() {
        let mut rng = ChaCha20Rng::seed_from_u64(0xc0ffee);
        let backend = SimBackend::new();
        let mem = sysmem(16 * PAGE_SIZE);

        for _ in 0..500 {
            let gpa = rng.gen_range(0..64u64) * PAGE_SIZE;
            let len = rng.gen_range(1..8u64) * PAGE_SIZE;
            let segoff = rng.gen_range(0..16u64) * PAGE_SIZE;
            let req = MapRequest { segoff, ..MapRequest::new(gpa, 0, len) };
            let _ = mem.map(&backend, req);
            if rng.gen_bool(0.3) {
                if let Some(m) = mem.mapping_next(rng.gen_range(0..64u64) * PAGE_SIZE) {
                    mem.unmap(&backend, m.gpa, m.len).unwrap();
                }
            }

            let maps = mem.mappings();
            for (i, a) in maps.iter().enumerate() {
                assert!(a.segoff + a.len <= 16 * PAGE_SIZE, "containment: {a:?}");
                for b in &maps[i + 1..] {
                    assert!(
                        !ranges_overlap(a.gpa, a.len, b.gpa, b.len),
                        "overlap: {a:?} / {b:?}"
                    );
                }
            }
        }
    }

    // ─── Unmap and lifetime ──────────────────────────────────────────

    #[test]
    fn unmap_requires_exact_range_and_skips_iommu() {
        let backend = SimBackend::new();
        let mem = sysmem(MIB);
        mem.map(&backend, MapRequest::new(0, 0, 0x8_0000)).unwrap();
        mem.map(
            &backend,
            MapRequest { flags: MAP_FLAG_IOMMU, segoff: 0x8_0000, ..MapRequest::new(0x10_0000, 0, 0x8_0000) },
        )
        .unwrap();

        assert!(mem.unmap(&backend, 0, PAGE_SIZE).is_err());
        assert!(matches!(
            mem.unmap(&backend, 0x10_0000, 0x8_0000),
            Err(MemoryError::NoSuchMapping { .. })
        ));
        mem.unmap(&backend, 0, 0x8_0000).unwrap();
        assert_eq!(mem.mappings().len(), 1);

        mem.release_all(&backend);
        assert!(mem.mappings().is_empty());
        assert!(backend.handle().slots().is_empty());
    }

    #[test]
    fn freed_segment_stays_alive_while_mapped() {
        let backend = SimBackend::new();
        let mem = sysmem(MIB);
        mem.map(&backend, MapRequest::new(0, 0, MIB)).unwrap();
        mem.write_gpa(0x100, b"alive").unwrap();

        mem.free_segment(0).unwrap();
        assert!(matches!(mem.segment(0), Err(MemoryError::NoSuchSegment { id: 0 })));

        let mut buf = [0u8; 5];
        mem.read_gpa(0x100, &mut buf).unwrap();
        assert_eq!(&buf, b"alive");
        assert!(matches!(
            mem.map(&backend, MapRequest::new(0x20_0000, 0, PAGE_SIZE)),
            Err(MemoryError::NoSuchSegment { id: 0 })
        ));
    }

    // ─── Lookup and access ───────────────────────────────────────────

    #[test]
    fn lookup_helpers() {
        let backend = SimBackend::new();
        let mem = sysmem(MIB);
        mem.alloc_segment(1, 0x1_0000, SegmentKind::Device { name: None, file: None })
            .unwrap();
        mem.map(&backend, MapRequest::new(0, 0, MIB)).unwrap();
        mem.map(&backend, MapRequest::new(0xe000_0000, 1, 0x1_0000)).unwrap();

        assert!(mem.is_sysmem(0xffff));
        assert!(!mem.is_sysmem(0xe000_0000));
        assert!(!mem.is_sysmem(0x20_0000));
        assert_eq!(mem.sysmem_max_addr(), MIB);
        assert_eq!(mem.mapping_next(1).map(|m| m.gpa), Some(0xe000_0000));
        assert_eq!(mem.mapping_next(0).map(|m| m.gpa), Some(0));
        assert_eq!(mem.mapping_next(0xe000_0001), None);
        assert_eq!(mem.lookup(0xe000_8000).map(|m| m.segid), Some(1));
    }

    #[test]
    fn access_spans_adjacent_mappings_and_honours_prot() {
        let backend = SimBackend::new();
        let mem = sysmem(2 * PAGE_SIZE);
        mem.map(&backend, MapRequest::new(0, 0, PAGE_SIZE)).unwrap();
        mem.map(
            &backend,
            MapRequest { segoff: PAGE_SIZE, ..MapRequest::new(PAGE_SIZE, 0, PAGE_SIZE) },
        )
        .unwrap();

        let data: Vec<u8> = (0..16).collect();
        mem.write_gpa(PAGE_SIZE - 8, &data).unwrap();
        let mut back = [0u8; 16];
        mem.read_gpa(PAGE_SIZE - 8, &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);
        assert!(matches!(
            mem.read_gpa(2 * PAGE_SIZE - 2, &mut [0u8; 4]),
            Err(MemoryError::Unmapped { gpa }) if gpa == 2 * PAGE_SIZE
        ));

        mem.unmap(&backend, PAGE_SIZE, PAGE_SIZE).unwrap();
        mem.map(
            &backend,
            MapRequest { segoff: PAGE_SIZE, prot: Prot::READ, ..MapRequest::new(PAGE_SIZE, 0, PAGE_SIZE) },
        )
        .unwrap();
        assert!(matches!(
            mem.write_gpa(PAGE_SIZE, &[1]),
            Err(MemoryError::Protection { .. })
        ));
        let records = backend.handle().records();
        assert!(records.contains(&SimRecord::Mapped {
            slot: 1,
            gpa: PAGE_SIZE,
            len: PAGE_SIZE,
            readonly: true
        }));
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let backend = SimBackend::new();
        let mem = sysmem(2 * PAGE_SIZE);
        mem.map(&backend, MapRequest::new(0, 0, PAGE_SIZE)).unwrap();
        mem.map(
            &backend,
            MapRequest { segoff: PAGE_SIZE, prot: Prot::READ, ..MapRequest::new(PAGE_SIZE, 0, PAGE_SIZE) },
        )
        .unwrap();

        mem.write_gpa(PAGE_SIZE - 4, &[0xaa; 4]).unwrap();
        assert!(matches!(
            mem.write_gpa(PAGE_SIZE - 4, &[0x55; 8]),
            Err(MemoryError::Protection { gpa }) if gpa == PAGE_SIZE
        ));
        assert!(matches!(
            mem.write_gpa(PAGE_SIZE - 4, &[0x55; 8 + PAGE_SIZE as usize]),
            Err(MemoryError::Protection { .. })
        ));
        let mut back = [0u8; 4];
        mem.read_gpa(PAGE_SIZE - 4, &mut back).unwrap();
        assert_eq!(back, [0xaa; 4]);

        assert!(matches!(
            mem.write_gpa(u64::MAX, &[1, 2]),
            Err(MemoryError::Unmapped { .. })
        ));
    }
}
