//! Guest time base.
//!
//! Every VM owns one [`TimeBase`] describing how guest TSC values relate to
//! the host clock:
//!
//! ```text
//!   guest_tsc(vcpu) = scale(host_tsc) + boot_offset + vcpu.tsc_offset
//! ```
//!
//! `scale` is the identity when the guest runs at the host frequency and a
//! fixed-point multiply otherwise (see [`crate::verified::tsc`]).  The
//! boot offset is chosen at creation so the guest TSC starts at zero.  It only
//! changes through a `VMM_TIME` import ([`TimeBase::import`]) or a direct
//! `VMM_ARCH` write; per-vCPU offsets change when the guest writes `IA32_TSC`.
//!
//! Host time comes from a [`HostClock`] so tests can drive it by hand.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use corevm_data::TimeInfoV1;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::TscCaps;
use crate::verified::tsc::{
    calc_guest_tsc, calc_tsc_multiplier, calc_tsc_offset, ratio_supported, ticks_for_ns,
    NANOS_PER_SEC,
};

/// Default guest TSC frequency: 3.0 GHz.
pub const DEFAULT_TSC_HZ: u64 = 3_000_000_000;

// ─── Configuration ───────────────────────────────────────────────────

/// Time configuration of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    /// TSC frequency exposed to the guest, in Hz.
    ///
    /// When it differs from the host frequency the back end must support
    /// TSC scaling for the ratio, or VM creation fails.
    pub guest_tsc_hz: u64,

    /// Nominal frequency of the host TSC model used by [`SystemClock`].
    pub host_tsc_hz: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            guest_tsc_hz: DEFAULT_TSC_HZ,
            host_tsc_hz: DEFAULT_TSC_HZ,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimeError {
    #[error("guest TSC frequency must be non-zero")]
    ZeroFrequency,

    #[error("guest TSC frequency {guest_hz} Hz is not reachable from host {host_hz} Hz")]
    UnsupportedRatio { guest_hz: u64, host_hz: u64 },

    #[error("boot hrtime {boot_hrtime} is after the export hrtime {hrtime}")]
    BootAfterExport { boot_hrtime: i64, hrtime: i64 },

    #[error("wall clock nanoseconds {0} out of range")]
    BadWallClock(u32),

    #[error("uptime from boot hrtime {boot_hrtime} to {hrtime} does not fit in 64 bits")]
    UptimeOverflow { boot_hrtime: i64, hrtime: i64 },
}

// ─── Host clock ──────────────────────────────────────────────────────

/// Source of host time.
pub trait HostClock: Send + Sync {
    /// Monotonic high-resolution time in nanoseconds.
    fn hrtime(&self) -> i64;

    /// Wall-clock time as (seconds, nanoseconds) since the UNIX epoch.
    fn wall(&self) -> (u64, u32);

    /// Current host TSC reading.
    fn host_tsc(&self) -> u64;

    /// Host TSC frequency in Hz.
    fn host_freq(&self) -> u64;
}

/// Host clock backed by the OS monotonic and real-time clocks.
///
/// The host TSC is modelled from the monotonic clock at a nominal frequency.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
    freq: u64,
}

impl SystemClock {
    pub fn new(freq: u64) -> Self {
        Self {
            origin: Instant::now(),
            freq,
        }
    }
}

impl HostClock for SystemClock {
    fn hrtime(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    fn wall(&self) -> (u64, u32) {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (d.as_secs(), d.subsec_nanos())
    }

    fn host_tsc(&self) -> u64 {
        ticks_for_ns(self.hrtime() as u64, self.freq)
    }

    fn host_freq(&self) -> u64 {
        self.freq
    }
}

/// Hand-driven clock for tests.  The host TSC advances with hrtime.
#[derive(Debug)]
pub struct ManualClock {
    hrtime: AtomicI64,
    wall_ns: AtomicU64,
    freq: u64,
}

impl ManualClock {
    pub fn new(freq: u64) -> Self {
        Self {
            hrtime: AtomicI64::new(0),
            wall_ns: AtomicU64::new(0),
            freq,
        }
    }

    /// Advance both the monotonic and the wall clock by `ns`.
    pub fn advance(&self, ns: u64) {
        self.hrtime.fetch_add(ns as i64, Ordering::SeqCst);
        self.wall_ns.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn set_hrtime(&self, ns: i64) {
        self.hrtime.store(ns, Ordering::SeqCst);
    }

    pub fn set_wall_ns(&self, ns: u64) {
        self.wall_ns.store(ns, Ordering::SeqCst);
    }
}

impl HostClock for ManualClock {
    fn hrtime(&self) -> i64 {
        self.hrtime.load(Ordering::SeqCst)
    }

    fn wall(&self) -> (u64, u32) {
        let ns = self.wall_ns.load(Ordering::SeqCst);
        (ns / NANOS_PER_SEC, (ns % NANOS_PER_SEC) as u32)
    }

    fn host_tsc(&self) -> u64 {
        ticks_for_ns(self.hrtime().max(0) as u64, self.freq)
    }

    fn host_freq(&self) -> u64 {
        self.freq
    }
}

// ─── Time base ───────────────────────────────────────────────────────

/// VM-wide relation between host and guest time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    guest_freq: u64,
    multiplier: Option<u64>,
    frac_size: u32,
    boot_offset: u64,
    boot_hrtime: i64,
}

impl TimeBase {
    /// Time base for a freshly created VM: guest TSC starts at zero now.
    pub fn new(clock: &dyn HostClock, caps: TscCaps, guest_freq: u64) -> Result<Self, TimeError> {
        let multiplier = Self::multiplier_for(clock.host_freq(), caps, guest_freq)?;
        let boot_offset = calc_tsc_offset(clock.host_tsc(), 0, multiplier, caps.frac_size);
        Ok(Self {
            guest_freq,
            multiplier,
            frac_size: caps.frac_size,
            boot_offset,
            boot_hrtime: clock.hrtime(),
        })
    }

    fn multiplier_for(host_freq: u64, caps: TscCaps, guest_freq: u64) -> Result<Option<u64>, TimeError> {
        if guest_freq == 0 {
            return Err(TimeError::ZeroFrequency);
        }
        if guest_freq == host_freq {
            return Ok(None);
        }
        if !caps.scaling || !ratio_supported(guest_freq, host_freq, caps.frac_size, caps.max_ratio) {
            return Err(TimeError::UnsupportedRatio {
                guest_hz: guest_freq,
                host_hz: host_freq,
            });
        }
        Ok(Some(calc_tsc_multiplier(guest_freq, host_freq, caps.frac_size)))
    }

    pub fn guest_freq(&self) -> u64 {
        self.guest_freq
    }

    /// Fixed-point multiplier, `None` when the guest runs at host frequency.
    pub fn multiplier(&self) -> Option<u64> {
        self.multiplier
    }

    pub fn boot_offset(&self) -> u64 {
        self.boot_offset
    }

    pub fn set_boot_offset(&mut self, offset: u64) {
        self.boot_offset = offset;
    }

    pub fn boot_hrtime(&self) -> i64 {
        self.boot_hrtime
    }

    pub fn set_boot_hrtime(&mut self, hrtime: i64) {
        self.boot_hrtime = hrtime;
    }

    /// Guest TSC of a vCPU with per-vCPU offset `vcpu_offset` at `host_tsc`.
    pub fn guest_tsc(&self, host_tsc: u64, vcpu_offset: u64) -> u64 {
        calc_guest_tsc(
            host_tsc,
            self.multiplier,
            self.frac_size,
            self.boot_offset.wrapping_add(vcpu_offset),
        )
    }

    /// Per-vCPU offset that makes the vCPU read `guest_tsc` at `host_tsc`.
    pub fn vcpu_offset_for(&self, host_tsc: u64, guest_tsc: u64) -> u64 {
        calc_tsc_offset(host_tsc, guest_tsc, self.multiplier, self.frac_size)
            .wrapping_sub(self.boot_offset)
    }

    /// Snapshot of the time base for migration.
    pub fn export(&self, clock: &dyn HostClock) -> TimeInfoV1 {
        let (hres_sec, hres_ns) = clock.wall();
        TimeInfoV1 {
            guest_freq: self.guest_freq,
            guest_tsc: self.guest_tsc(clock.host_tsc(), 0),
            boot_hrtime: self.boot_hrtime,
            hrtime: clock.hrtime(),
            hres_sec,
            hres_ns,
        }
    }

    /// Rebuild a time base from an exported snapshot.
    ///
    /// Time that passed between export and import is measured on the wall
    /// clock and added to the guest TSC.  The source's boot hrtime is
    /// translated into this host's hrtime frame.
    pub fn import(clock: &dyn HostClock, caps: TscCaps, src: &TimeInfoV1) -> Result<Self, TimeError> {
        if src.hres_ns as u64 >= NANOS_PER_SEC {
            return Err(TimeError::BadWallClock(src.hres_ns));
        }
        if src.boot_hrtime > src.hrtime {
            return Err(TimeError::BootAfterExport {
                boot_hrtime: src.boot_hrtime,
                hrtime: src.hrtime,
            });
        }
        let uptime = src
            .hrtime
            .checked_sub(src.boot_hrtime)
            .ok_or(TimeError::UptimeOverflow {
                boot_hrtime: src.boot_hrtime,
                hrtime: src.hrtime,
            })?;
        let multiplier = Self::multiplier_for(clock.host_freq(), caps, src.guest_freq)?;

        let (now_sec, now_ns) = clock.wall();
        let now_wall = now_sec as i128 * NANOS_PER_SEC as i128 + now_ns as i128;
        let src_wall = src.hres_sec as i128 * NANOS_PER_SEC as i128 + src.hres_ns as i128;
        let elapsed = match now_wall - src_wall {
            d if d < 0 => {
                warn!("time import: source wall clock is {} ns ahead, assuming no elapsed time", -d);
                0
            }
            d => u64::try_from(d).unwrap_or(u64::MAX),
        };

        let now_hr = clock.hrtime();
        let guest_tsc = src
            .guest_tsc
            .wrapping_add(ticks_for_ns(elapsed, src.guest_freq));
        let since_boot = uptime.saturating_add(i64::try_from(elapsed).unwrap_or(i64::MAX));
        let boot_offset = calc_tsc_offset(clock.host_tsc(), guest_tsc, multiplier, caps.frac_size);

        info!(
            "time import: {} Hz guest, {elapsed} ns in transit, guest TSC now {guest_tsc:#x}",
            src.guest_freq
        );
        Ok(Self {
            guest_freq: src.guest_freq,
            multiplier,
            frac_size: caps.frac_size,
            boot_offset,
            boot_hrtime: now_hr.saturating_sub(since_boot),
        })
    }
}
