//! Pure functions over the 64-bit event descriptor ("intinfo").
//!
//! An intinfo word describes one event to deliver to (or interrupted in)
//! the guest:
//!
//! ```text
//!  63            32 31  30   12 11   10  8 7      0
//! ┌────────────────┬───┬───────┬────┬──────┬────────┐
//! │   error code   │ V │ rsvd  │ EC │ type │ vector │
//! └────────────────┴───┴───────┴────┴──────┴────────┘
//! ```
//!
//! `V` is the valid bit and `EC` says whether the error code is delivered.
//!
//! | Function                    | Used by                                      |
//! |-----------------------------|----------------------------------------------|
//! | [`exception_class`]         | [`combine`]                                  |
//! | [`combine`]                 | `inject::PendingEvents::entry_intinfo()`     |
//! | [`hw_exception`]            | `inject::PendingEvents::inject_exception()`  |
//! | [`is_valid_pending_event`]  | `set_exit_intinfo()`, `data` writes          |

// ─── Field layout ───────────────────────────────────────────────────

pub(crate) const INTINFO_VECTOR_MASK: u64 = 0xff;
pub(crate) const INTINFO_TYPE_MASK: u64 = 0x700;
pub(crate) const INTINFO_HWINTR: u64 = 0 << 8;
pub(crate) const INTINFO_NMI: u64 = 2 << 8;
pub(crate) const INTINFO_HWEXCP: u64 = 3 << 8;
pub(crate) const INTINFO_SWINTR: u64 = 4 << 8;
pub(crate) const INTINFO_DEL_ERRCODE: u64 = 0x800;
pub(crate) const INTINFO_MASK_RSVD: u64 = 0x7fff_f000;
pub(crate) const INTINFO_VALID: u64 = 0x8000_0000;
pub(crate) const INTINFO_ERRCODE_SHIFT: u32 = 32;

// ─── Exception vectors ──────────────────────────────────────────────

pub(crate) const IDT_DE: u8 = 0;
pub(crate) const IDT_NMI: u8 = 2;
pub(crate) const IDT_UD: u8 = 6;
pub(crate) const IDT_DF: u8 = 8;
pub(crate) const IDT_TS: u8 = 10;
pub(crate) const IDT_NP: u8 = 11;
pub(crate) const IDT_SS: u8 = 12;
pub(crate) const IDT_GP: u8 = 13;
pub(crate) const IDT_PF: u8 = 14;

/// First vector above the architecturally reserved exception range.
pub(crate) const IDT_FIRST_USER: u8 = 32;

/// Severity class of an event for double-fault combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExcClass {
    Benign,
    Contributory,
    PageFault,
}

#[inline]
pub(crate) const fn is_valid(info: u64) -> bool {
    info & INTINFO_VALID != 0
}

#[inline]
pub(crate) const fn vector(info: u64) -> u8 {
    (info & INTINFO_VECTOR_MASK) as u8
}

#[inline]
pub(crate) const fn event_type(info: u64) -> u64 {
    info & INTINFO_TYPE_MASK
}

#[inline]
pub(crate) const fn error_code(info: u64) -> Option<u32> {
    if info & INTINFO_DEL_ERRCODE != 0 {
        Some((info >> INTINFO_ERRCODE_SHIFT) as u32)
    } else {
        None
    }
}

/// Classify an event for combination purposes.
///
/// Only hardware exceptions are ever non-benign.  #PF is its own class;
/// #DE, #TS, #NP, #SS and #GP are contributory.
pub(crate) fn exception_class(info: u64) -> ExcClass {
    debug_assert!(is_valid(info), "classifying an invalid event");

    if event_type(info) != INTINFO_HWEXCP {
        return ExcClass::Benign;
    }
    match vector(info) {
        IDT_PF => ExcClass::PageFault,
        IDT_DE | IDT_TS | IDT_NP | IDT_SS | IDT_GP => ExcClass::Contributory,
        _ => ExcClass::Benign,
    }
}

/// Build a valid hardware-exception intinfo word.
pub(crate) fn hw_exception(vector: u8, errcode: Option<u32>) -> u64 {
    let mut info = INTINFO_VALID | INTINFO_HWEXCP | vector as u64;
    if let Some(code) = errcode {
        info |= INTINFO_DEL_ERRCODE | (code as u64) << INTINFO_ERRCODE_SHIFT;
    }

    debug_assert!(is_valid(info));
    debug_assert_eq!(self::vector(info), vector);
    debug_assert_eq!(error_code(info), errcode);
    info
}

/// Outcome of combining the interrupted event with the pending exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Combined {
    /// Nothing to deliver.
    None,
    /// Deliver `deliver`; re-queue `requeue` (if non-zero) for the next entry.
    Deliver { deliver: u64, requeue: u64 },
    /// A fault arrived while delivering #DF.  The VM must be suspended.
    TripleFault,
}

/// Combine `info1` (event interrupted by the last exit) and `info2`
/// (exception injected since) into the single event to deliver next.
///
/// Either input may be zero / invalid.  When both are valid:
///
/// - `info1` is #DF → triple fault.
/// - contributory + contributory, or #PF + non-benign → #DF (error code 0).
/// - otherwise `info2` is delivered and `info1` stays queued.
pub(crate) fn combine(info1: u64, info2: u64) -> Combined {
    let v1 = is_valid(info1);
    let v2 = is_valid(info2);

    let result = match (v1, v2) {
        (true, true) => {
            if event_type(info1) == INTINFO_HWEXCP && vector(info1) == IDT_DF {
                Combined::TripleFault
            } else {
                let exc1 = exception_class(info1);
                let exc2 = exception_class(info2);
                if (exc1 == ExcClass::Contributory && exc2 == ExcClass::Contributory)
                    || (exc1 == ExcClass::PageFault && exc2 != ExcClass::Benign)
                {
                    Combined::Deliver {
                        deliver: INTINFO_VALID
                            | INTINFO_DEL_ERRCODE
                            | INTINFO_HWEXCP
                            | IDT_DF as u64,
                        requeue: 0,
                    }
                } else {
                    Combined::Deliver {
                        deliver: info2,
                        requeue: info1,
                    }
                }
            }
        }
        (true, false) => Combined::Deliver {
            deliver: info1,
            requeue: 0,
        },
        (false, true) => Combined::Deliver {
            deliver: info2,
            requeue: 0,
        },
        (false, false) => Combined::None,
    };

    // Postcondition: whatever is delivered is a valid event.
    if let Combined::Deliver { deliver, .. } = result {
        debug_assert!(is_valid(deliver), "combine must deliver a valid event");
    }
    result
}

/// Whether `info` may be stored in a pending-event slot.
///
/// Zero (empty) is always accepted.  Otherwise the word must be valid,
/// free of reserved bits, and of type HWINTR, NMI or HWEXCP.
pub(crate) fn is_valid_pending_event(info: u64) -> bool {
    if info == 0 {
        return true;
    }
    if !is_valid(info) || info & INTINFO_MASK_RSVD != 0 {
        return false;
    }
    matches!(
        event_type(info),
        INTINFO_HWINTR | INTINFO_NMI | INTINFO_HWEXCP
    )
}

/// Whether `vector` may be raised through `inject_exception`.
///
/// NMIs have their own path and #DF is only ever derived by [`combine`].
pub(crate) const fn is_injectable_exception(vector: u8) -> bool {
    vector < IDT_FIRST_USER && vector != IDT_NMI && vector != IDT_DF
}

/// Whether hardware pushes an error code when delivering `vector`.
pub(crate) const fn vector_has_error_code(vector: u8) -> bool {
    matches!(vector, IDT_DF | IDT_TS | IDT_NP | IDT_SS | IDT_GP | IDT_PF | 17 | 21 | 29 | 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exc(v: u8) -> u64 {
        hw_exception(v, None)
    }

    #[test]
    fn layout_constants_do_not_overlap() {
        let fields = [
            INTINFO_VECTOR_MASK,
            INTINFO_TYPE_MASK,
            INTINFO_DEL_ERRCODE,
            INTINFO_MASK_RSVD,
            INTINFO_VALID,
        ];
        for (i, a) in fields.iter().enumerate() {
            for b in &fields[i + 1..] {
                assert_eq!(a & b, 0, "{a:#x} overlaps {b:#x}");
            }
        }
        assert_eq!(fields.iter().fold(0, |acc, f| acc | f), 0xffff_ffff);
    }

    #[test]
    fn hw_exception_encodes_error_code() {
        let info = hw_exception(IDT_GP, Some(0x18));
        assert_eq!(info, 0x0000_0018_8000_0b0d);
        assert_eq!(error_code(info), Some(0x18));
        assert_eq!(error_code(exc(IDT_UD)), None);
    }

    #[test]
    fn classes_follow_vector_table() {
        assert_eq!(exception_class(exc(IDT_PF)), ExcClass::PageFault);
        for v in [IDT_DE, IDT_TS, IDT_NP, IDT_SS, IDT_GP] {
            assert_eq!(exception_class(exc(v)), ExcClass::Contributory, "vector {v}");
        }
        for v in [1, 3, 4, 5, IDT_UD, 7, IDT_DF, 16, 17, 18, 19] {
            assert_eq!(exception_class(exc(v)), ExcClass::Benign, "vector {v}");
        }
    }

    #[test]
    fn non_exception_types_are_benign() {
        // Vector 13 delivered as an external interrupt is not a #GP.
        let intr = INTINFO_VALID | INTINFO_HWINTR | IDT_GP as u64;
        assert_eq!(exception_class(intr), ExcClass::Benign);
        let nmi = INTINFO_VALID | INTINFO_NMI | IDT_NMI as u64;
        assert_eq!(exception_class(nmi), ExcClass::Benign);
    }

    #[test]
    fn combine_single_events_pass_through() {
        assert_eq!(combine(0, 0), Combined::None);
        assert_eq!(
            combine(exc(IDT_GP), 0),
            Combined::Deliver { deliver: exc(IDT_GP), requeue: 0 }
        );
        assert_eq!(
            combine(0, exc(IDT_UD)),
            Combined::Deliver { deliver: exc(IDT_UD), requeue: 0 }
        );
    }

    #[test]
    fn combine_contributory_pair_is_double_fault() {
        match combine(exc(IDT_GP), exc(IDT_NP)) {
            Combined::Deliver { deliver, requeue } => {
                assert_eq!(vector(deliver), IDT_DF);
                assert_eq!(event_type(deliver), INTINFO_HWEXCP);
                assert_eq!(error_code(deliver), Some(0));
                assert_eq!(requeue, 0, "both originals are discarded");
            }
            other => panic!("expected #DF, got {other:?}"),
        }
    }

    #[test]
    fn combine_pagefault_with_non_benign_is_double_fault() {
        for second in [IDT_PF, IDT_GP, IDT_DE] {
            match combine(exc(IDT_PF), exc(second)) {
                Combined::Deliver { deliver, .. } => assert_eq!(vector(deliver), IDT_DF),
                other => panic!("#PF + {second}: {other:?}"),
            }
        }
    }

    #[test]
    fn combine_asymmetric_cases_supersede() {
        // Contributory first, page fault second: not in the escalation table.
        assert_eq!(
            combine(exc(IDT_GP), exc(IDT_PF)),
            Combined::Deliver { deliver: exc(IDT_PF), requeue: exc(IDT_GP) }
        );
        // Page fault first, benign second.
        assert_eq!(
            combine(exc(IDT_PF), exc(IDT_UD)),
            Combined::Deliver { deliver: exc(IDT_UD), requeue: exc(IDT_PF) }
        );
    }

    #[test]
    fn fault_during_double_fault_is_triple_fault() {
        let df = hw_exception(IDT_DF, Some(0));
        assert_eq!(combine(df, exc(IDT_UD)), Combined::TripleFault);
        assert_eq!(combine(df, exc(IDT_GP)), Combined::TripleFault);
    }

    #[test]
    fn combine_is_deterministic() {
        let events = [0, exc(IDT_DE), exc(IDT_UD), exc(IDT_PF), exc(IDT_GP), exc(IDT_DF)];
        for &a in &events {
            for &b in &events {
                assert_eq!(combine(a, b), combine(a, b));
            }
        }
    }

    #[test]
    fn pending_event_validation() {
        assert!(is_valid_pending_event(0));
        assert!(is_valid_pending_event(exc(IDT_GP)));
        assert!(is_valid_pending_event(INTINFO_VALID | INTINFO_NMI | 2));
        assert!(!is_valid_pending_event(IDT_GP as u64), "missing valid bit");
        assert!(!is_valid_pending_event(exc(IDT_GP) | 0x1000), "reserved bit");
        assert!(!is_valid_pending_event(INTINFO_VALID | INTINFO_SWINTR | 0x80));
    }

    #[test]
    fn injectable_vectors() {
        assert!(is_injectable_exception(IDT_DE));
        assert!(is_injectable_exception(31));
        assert!(!is_injectable_exception(IDT_NMI));
        assert!(!is_injectable_exception(IDT_DF));
        assert!(!is_injectable_exception(IDT_FIRST_USER));
    }

    #[test]
    fn error_code_vectors() {
        assert!(vector_has_error_code(IDT_GP));
        assert!(vector_has_error_code(IDT_PF));
        assert!(!vector_has_error_code(IDT_UD));
        assert!(!vector_has_error_code(IDT_DE));
    }
}
