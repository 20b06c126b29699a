//! Keyset lifecycle state machine.
//!
//! | from \ to            | ACTIVE    | INACTIVE | PENDING_DESTRUCTION |
//! |----------------------|-----------|----------|---------------------|
//! | ACTIVE               | no-op     | Disabled | Removed             |
//! | INACTIVE             | Activated | no-op    | Removed             |
//! | PENDING_DESTRUCTION  | Activated | blocked  | no-op               |
//! | DESTROYED            | blocked   | blocked  | blocked             |
//!
//! `DESTROYED` is never a legal target here; physical destruction goes through
//! the manager's unconditional delete.

use crate::{
    error::{KeysetError, KeysetResult},
    events::LifecycleEventKind,
    models::{KeysetId, KeysetState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Target equals the current state.
    NoOp,
    /// Accepted; apply the new state and emit the event.
    Apply {
        to: KeysetState,
        event: LifecycleEventKind,
    },
}

/// Reject targets that are never reachable through a transition request.
pub fn validate_target(to: KeysetState) -> KeysetResult<()> {
    if to == KeysetState::Destroyed {
        return Err(KeysetError::invalid(
            "DESTROYED is not a valid transition target; delete the keyset instead",
        ));
    }
    Ok(())
}

/// Decide whether `from -> to` is legal for keyset `id`.
pub fn evaluate(id: KeysetId, from: KeysetState, to: KeysetState) -> KeysetResult<Transition> {
    validate_target(to)?;
    let blocked = || KeysetError::BlockedTransition { id, from, to };
    match (from, to) {
        (KeysetState::Destroyed, _) => Err(blocked()),
        (from, to) if from == to => Ok(Transition::NoOp),
        (KeysetState::PendingDestruction, KeysetState::Inactive) => Err(blocked()),
        (KeysetState::Active, KeysetState::Inactive) => Ok(Transition::Apply {
            to,
            event: LifecycleEventKind::Disabled,
        }),
        (KeysetState::Active | KeysetState::Inactive, KeysetState::PendingDestruction) => {
            Ok(Transition::Apply {
                to,
                event: LifecycleEventKind::Removed,
            })
        }
        (KeysetState::Inactive | KeysetState::PendingDestruction, KeysetState::Active) => {
            Ok(Transition::Apply {
                to,
                event: LifecycleEventKind::Activated,
            })
        }
        _ => Err(blocked()),
    }
}
