//! Deterministic next-phase decision after an agent has run.

use super::phase::Phase;
use super::phase_machine::{ErrorKind, PhaseMachine};
use super::session::{ExecutionStatus, SessionState, ValidationStatus};

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Move forward to the given phase.
    Advance(Phase),
    /// A validator rejected within budget; go back through the revision phase.
    Revise(Phase),
    /// Failure path.
    Rollback { to: Phase, kind: ErrorKind },
    /// An agent asked for a phase that is not a valid transition.
    InvalidRequest { requested: Phase },
    /// A terminal phase finished.
    Complete,
    /// No decision is possible from the current state.
    Halt { reason: String },
}

impl Transition {
    /// Phase the workflow enters next, if any. Invalid requests route to ERROR.
    pub fn target(&self) -> Option<Phase> {
        match self {
            Transition::Advance(phase) | Transition::Revise(phase) => Some(*phase),
            Transition::Rollback { to, .. } => Some(*to),
            Transition::InvalidRequest { .. } => Some(Phase::Error),
            Transition::Complete | Transition::Halt { .. } => None,
        }
    }

    /// Short label used as the checkpoint step name.
    pub fn label(&self) -> &'static str {
        match self {
            Transition::Advance(_) => "complete",
            Transition::Revise(_) => "revise",
            Transition::Rollback { .. } => "rollback",
            Transition::InvalidRequest { .. } => "invalid_transition",
            Transition::Complete => "final",
            Transition::Halt { .. } => "halt",
        }
    }
}

/// Decide the transition out of `phase` from the signals in `state`.
///
/// Critical errors in either status field roll back. Validation phases need
/// an explicit verdict: approval advances past the revision phase, rejection
/// returns to the revision phase until `max_iterations` rejections, then rolls
/// back as a validation failure. Other phases honour a valid
/// `requested_next_phase`, otherwise take the first next phase.
///
/// Rejection counts live in `state.phase_iterations` and reset whenever the
/// loop is left.
pub fn decide(machine: &PhaseMachine, phase: Phase, state: &mut SessionState) -> Transition {
    let Some(config) = machine.get_config(phase) else {
        return Transition::Halt {
            reason: format!("no configuration for phase {phase}"),
        };
    };

    if state.execution.status == ExecutionStatus::CriticalError
        || state.validation.status == ValidationStatus::CriticalError
    {
        state.phase_iterations.remove(&phase);
        return Transition::Rollback {
            to: machine.resolve_rollback(phase, ErrorKind::CriticalError),
            kind: ErrorKind::CriticalError,
        };
    }

    if phase.is_validation() {
        let status = state.validation.status;
        if status.is_approved() {
            state.phase_iterations.remove(&phase);
            return match config
                .next_phases
                .iter()
                .copied()
                .find(|next| Some(*next) != config.revision_phase)
            {
                Some(next) => Transition::Advance(next),
                None => Transition::Complete,
            };
        }
        if status.is_rejected() {
            let rejections = state.phase_iterations.get(&phase).copied().unwrap_or(0) + 1;
            if let Some(revision) = config.revision_phase
                && rejections < config.max_iterations
            {
                state.phase_iterations.insert(phase, rejections);
                return Transition::Revise(revision);
            }
            state.phase_iterations.remove(&phase);
            return Transition::Rollback {
                to: machine.resolve_rollback(phase, ErrorKind::ValidationFailure),
                kind: ErrorKind::ValidationFailure,
            };
        }
        return Transition::Halt {
            reason: format!("validator reported no verdict for {phase}"),
        };
    }

    if let Some(requested) = state.requested_next_phase {
        if machine.can_transition(phase, requested) {
            return Transition::Advance(requested);
        }
        return Transition::InvalidRequest { requested };
    }

    match config.next_phases.first() {
        Some(next) => Transition::Advance(*next),
        None => Transition::Complete,
    }
}
