//! Pure vCPU run-state transition table.
//!
//! ```text
//!            SIPI               entry             halt
//!   INIT ──────────▶ PEND_SIPI ───────▶ RUNNING ◀──────▶ SLEEPING
//!    ▲                                    │  ▲     wake
//!    │ INIT (any but DEBUG_STOPPED)       │  │ resume
//!    └────────────────────────────        ▼  │
//!                                    DEBUG_STOPPED
//! ```

use serde::{Deserialize, Serialize};

/// Run state of a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    /// Reset state; waiting for a startup IPI.
    Init,
    /// Startup IPI received, vector recorded, not yet started.
    InitPendingSipi,
    /// Runnable and driven by its owning thread.
    Running,
    /// Halted, blocked until woken.
    Sleeping,
    /// Frozen for introspection until resumed.
    DebugStopped,
}

impl RunState {
    pub const ALL: [RunState; 5] = [
        RunState::Init,
        RunState::InitPendingSipi,
        RunState::Running,
        RunState::Sleeping,
        RunState::DebugStopped,
    ];
}

/// Inputs to the run-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunEvent {
    Sipi,
    /// Top of the run loop consumed the SIPI vector.
    Start,
    Halt,
    Wake,
    DebugStop,
    /// Resume from a debug stop back to the recorded state.
    Resume(RunState),
    Init,
}

/// Next state for `event` in `state`, or `None` if the event is ignored.
pub(crate) fn transition(state: RunState, event: RunEvent) -> Option<RunState> {
    use RunState::*;

    let next = match (state, event) {
        (Init, RunEvent::Sipi) => InitPendingSipi,
        (InitPendingSipi, RunEvent::Start) => Running,
        (Running, RunEvent::Halt) => Sleeping,
        (Sleeping, RunEvent::Wake) => Running,
        (DebugStopped, RunEvent::Resume(prev)) => match prev {
            DebugStopped => return None,
            // A halted vCPU is woken before it stops; it resumes runnable.
            Sleeping => Running,
            other => other,
        },
        (DebugStopped, _) => return None,
        (_, RunEvent::DebugStop) => DebugStopped,
        (_, RunEvent::Init) => Init,
        _ => return None,
    };
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_events() -> Vec<RunEvent> {
        let mut events = vec![
            RunEvent::Sipi,
            RunEvent::Start,
            RunEvent::Halt,
            RunEvent::Wake,
            RunEvent::DebugStop,
            RunEvent::Init,
        ];
        events.extend(RunState::ALL.iter().map(|s| RunEvent::Resume(*s)));
        events
    }

    #[test]
    fn sipi_path_reaches_running() {
        let s = transition(RunState::Init, RunEvent::Sipi).unwrap();
        assert_eq!(s, RunState::InitPendingSipi);
        assert_eq!(transition(s, RunEvent::Start), Some(RunState::Running));
    }

    #[test]
    fn sipi_outside_init_is_ignored() {
        for s in [RunState::InitPendingSipi, RunState::Running, RunState::Sleeping, RunState::DebugStopped] {
            assert_eq!(transition(s, RunEvent::Sipi), None, "{s:?}");
        }
    }

    #[test]
    fn running_is_only_reachable_from_pending_sipi_sleeping_or_debug() {
        for from in RunState::ALL {
            for ev in all_events() {
                if transition(from, ev) == Some(RunState::Running) {
                    assert!(
                        matches!(
                            (from, ev),
                            (RunState::InitPendingSipi, RunEvent::Start)
                                | (RunState::Sleeping, RunEvent::Wake)
                                | (RunState::DebugStopped, RunEvent::Resume(_))
                        ),
                        "unexpected path {from:?} --{ev:?}--> Running"
                    );
                }
            }
        }
    }

    #[test]
    fn sleeping_is_only_entered_by_halt() {
        for from in RunState::ALL {
            for ev in all_events() {
                if transition(from, ev) == Some(RunState::Sleeping) {
                    assert_eq!((from, ev), (RunState::Running, RunEvent::Halt));
                }
            }
        }
    }

    #[test]
    fn debug_stop_from_every_live_state() {
        for s in [RunState::Init, RunState::InitPendingSipi, RunState::Running, RunState::Sleeping] {
            assert_eq!(transition(s, RunEvent::DebugStop), Some(RunState::DebugStopped));
        }
    }

    #[test]
    fn debug_stopped_only_leaves_via_resume() {
        for ev in all_events() {
            let next = transition(RunState::DebugStopped, ev);
            match ev {
                RunEvent::Resume(RunState::DebugStopped) => assert_eq!(next, None),
                RunEvent::Resume(_) => assert!(next.is_some()),
                _ => assert_eq!(next, None, "{ev:?}"),
            }
        }
        assert_eq!(
            transition(RunState::DebugStopped, RunEvent::Resume(RunState::Init)),
            Some(RunState::Init)
        );
    }
}
