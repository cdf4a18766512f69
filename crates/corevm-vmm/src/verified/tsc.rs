//! Pure TSC scaling and offset arithmetic.
//!
//! The guest TSC is derived from the host TSC as
//!
//! ```text
//!   guest_tsc = ((host_tsc × multiplier) >> frac_size) + offset     (mod 2^64)
//! ```
//!
//! where `multiplier` is a fixed-point ratio `guest_hz / host_hz` with
//! `frac_size` fractional bits.  The fractional width is a property of the
//! hardware back end (48 bits on KVM/VMX style scaling, 32 in the
//! simulator).  When the guest runs at the host frequency no scaling is
//! applied at all.

/// Nanoseconds per second.
pub(crate) const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Scale `tsc` by a fixed-point `multiplier` with `frac_size` fractional bits.
///
/// The product is formed in 128 bits; the result is truncated to 64 bits,
/// matching hardware behaviour for counters that would overflow.
pub(crate) fn scale_tsc(tsc: u64, multiplier: u64, frac_size: u32) -> u64 {
    debug_assert!(frac_size < 64, "fractional width must leave an integer part");
    ((tsc as u128 * multiplier as u128) >> frac_size) as u64
}

/// Fixed-point multiplier converting host ticks into guest ticks.
///
/// # Panics (debug only)
///
/// `host_hz` must be non-zero.
pub(crate) fn calc_tsc_multiplier(guest_hz: u64, host_hz: u64, frac_size: u32) -> u64 {
    debug_assert!(host_hz > 0, "host frequency must be non-zero");
    debug_assert!(frac_size < 64);

    let mult = (((guest_hz as u128) << frac_size) / host_hz as u128) as u64;

    // Postcondition: one second of host ticks scales to one second of guest
    // ticks, up to truncation of the multiplier.
    debug_assert!(
        ((guest_hz as u128) << frac_size) / host_hz as u128 > u64::MAX as u128
            || guest_hz.abs_diff(scale_tsc(host_hz, mult, frac_size)) <= (host_hz >> frac_size) + 1,
        "multiplier must reproduce the guest frequency"
    );
    mult
}

/// Whether `guest_hz / host_hz` fits the back end's scaling range.
///
/// The integer part of the ratio must be below `max_ratio` and the
/// multiplier must not be zero (guest slower than one host ulp).
pub(crate) fn ratio_supported(guest_hz: u64, host_hz: u64, frac_size: u32, max_ratio: u64) -> bool {
    if guest_hz == 0 || host_hz == 0 {
        return false;
    }
    if guest_hz / host_hz >= max_ratio {
        return false;
    }
    let mult = ((guest_hz as u128) << frac_size) / host_hz as u128;
    mult != 0 && mult <= u64::MAX as u128
}

/// Guest TSC for a given host TSC, optional multiplier and total offset.
pub(crate) fn calc_guest_tsc(host_tsc: u64, multiplier: Option<u64>, frac_size: u32, offset: u64) -> u64 {
    let scaled = match multiplier {
        Some(m) => scale_tsc(host_tsc, m, frac_size),
        None => host_tsc,
    };
    scaled.wrapping_add(offset)
}

/// Offset such that `calc_guest_tsc(base_host_tsc, ..) == base_guest_tsc`.
pub(crate) fn calc_tsc_offset(
    base_host_tsc: u64,
    base_guest_tsc: u64,
    multiplier: Option<u64>,
    frac_size: u32,
) -> u64 {
    let scaled = match multiplier {
        Some(m) => scale_tsc(base_host_tsc, m, frac_size),
        None => base_host_tsc,
    };
    let offset = base_guest_tsc.wrapping_sub(scaled);

    // Postcondition: the offset reproduces the requested base.
    debug_assert_eq!(
        calc_guest_tsc(base_host_tsc, multiplier, frac_size, offset),
        base_guest_tsc
    );
    offset
}

/// Ticks elapsed at `freq_hz` during `ns` nanoseconds (truncating).
pub(crate) fn ticks_for_ns(ns: u64, freq_hz: u64) -> u64 {
    ((ns as u128 * freq_hz as u128) / NANOS_PER_SEC as u128) as u64
}

/// Nanoseconds elapsed during `ticks` at `freq_hz` (truncating).
pub(crate) fn ns_for_ticks(ticks: u64, freq_hz: u64) -> u64 {
    debug_assert!(freq_hz > 0);
    ((ticks as u128 * NANOS_PER_SEC as u128) / freq_hz as u128) as u64
}
