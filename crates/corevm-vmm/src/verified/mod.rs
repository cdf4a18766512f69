//! Pure, deterministic cores of the VMM subsystems.
//!
//! Each sub-module holds the arithmetic and decision tables of one
//! subsystem with **no I/O, no locking and no back-end access**, so they can
//! be tested exhaustively with plain `#[test]`s.  Non-trivial functions
//! carry `debug_assert!` postconditions.
//!
//! | Module        | Effectful shell            |
//! |---------------|----------------------------|
//! | [`intinfo`]   | `inject`                   |
//! | [`memory`]    | `memory`                   |
//! | [`mtrr`]      | `msr`                      |
//! | [`run_state`] | `vcpu`                     |
//! | [`tsc`]       | `time`, `msr`, `data`      |

pub mod intinfo;
pub mod memory;
pub mod mtrr;
pub mod run_state;
pub mod tsc;
