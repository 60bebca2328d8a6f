/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The closed set of instance states and the legality table that governs
//! transitions between them (`spec.md` §3).

/// Closed set of instance states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    New,
    Scheduling,
    ScheduleFailed,
    Creating,
    Running,
    SubHealth,
    Evicting,
    Evicted,
    Exiting,
    Exited,
    Failed,
    Fatal,
}

impl InstanceState {
    /// Terminal states: `{EXITED, EVICTED, FATAL}`. No further transitions
    /// are legal once reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Evicted | Self::Fatal)
    }

    pub fn as_wire(self) -> api::proto::functionproxy::InstanceState {
        use api::proto::functionproxy::InstanceState as W;
        match self {
            Self::New => W::New,
            Self::Scheduling => W::Scheduling,
            Self::ScheduleFailed => W::ScheduleFailed,
            Self::Creating => W::Creating,
            Self::Running => W::Running,
            Self::SubHealth => W::SubHealth,
            Self::Evicting => W::Evicting,
            Self::Evicted => W::Evicted,
            Self::Exiting => W::Exiting,
            Self::Exited => W::Exited,
            Self::Failed => W::Failed,
            Self::Fatal => W::Fatal,
        }
    }
}

/// The authoritative legality table from `spec.md` §3. Any transition not
/// covered here is illegal and must surface `ERR_STATE_MACHINE_ERROR`
/// without changing local state.
pub fn is_legal_transition(from: InstanceState, to: InstanceState) -> bool {
    use InstanceState::*;
    matches!(
        (from, to),
        (New, Scheduling) | (New, Failed) | (New, Fatal)
            | (Scheduling, Creating)
            | (Scheduling, ScheduleFailed)
            | (Scheduling, Failed)
            | (Scheduling, Fatal)
            | (Scheduling, Exiting)
            | (ScheduleFailed, Scheduling)
            | (ScheduleFailed, Fatal)
            | (Creating, Running)
            | (Creating, Failed)
            | (Creating, Fatal)
            | (Creating, Exiting)
            | (Running, SubHealth)
            | (Running, Evicting)
            | (Running, Exiting)
            | (Running, Failed)
            | (Running, Fatal)
            | (SubHealth, Running)
            | (SubHealth, Evicting)
            | (SubHealth, Exiting)
            | (SubHealth, Failed)
            | (SubHealth, Fatal)
            | (Evicting, Evicted)
            | (Evicting, Fatal)
            | (Exiting, Exited)
            | (Exiting, Fatal)
            | (Failed, Scheduling)
            | (Failed, Fatal)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceState::*;

    const ALL_STATES: [InstanceState; 12] = [
        New, Scheduling, ScheduleFailed, Creating, Running, SubHealth, Evicting, Evicted, Exiting,
        Exited, Failed, Fatal,
    ];

    #[test]
    fn terminal_states_match_spec() {
        for s in ALL_STATES {
            let expected = matches!(s, Exited | Evicted | Fatal);
            assert_eq!(s.is_terminal(), expected, "{s:?}");
        }
    }

    #[test]
    fn terminal_states_have_no_legal_outgoing_transition() {
        for from in ALL_STATES {
            if from.is_terminal() {
                for to in ALL_STATES {
                    assert!(!is_legal_transition(from, to), "{from:?} -> {to:?}");
                }
            }
        }
    }

    #[test]
    fn sub_health_is_reversible_to_running() {
        assert!(is_legal_transition(Running, SubHealth));
        assert!(is_legal_transition(SubHealth, Running));
    }

    #[test]
    fn spot_check_table_rows() {
        assert!(is_legal_transition(New, Scheduling));
        assert!(!is_legal_transition(New, Creating));
        assert!(is_legal_transition(Failed, Scheduling));
        assert!(!is_legal_transition(Evicted, Scheduling));
    }
}
