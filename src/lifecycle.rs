//! Legal status transitions for reservations and cost proposals.
//!
//! Pure tables; privilege and conflict checks happen in the engine.

use crate::cost::ProposalStatus;
use crate::engine::EngineError;
use crate::model::ReservationStatus;

use ReservationStatus::*;

impl ReservationStatus {
    /// Holds its resource's time slot.
    pub fn is_binding(&self) -> bool {
        matches!(self, ResourceAssigned | Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Cancelled)
    }
}

pub fn reservation_transition_allowed(from: ReservationStatus, to: ReservationStatus) -> bool {
    match (from, to) {
        (Unresolved, ResourceAssigned) => true,
        (ResourceAssigned, Confirmed) => true,
        (Unresolved | ResourceAssigned | Confirmed, Cancelled) => true,
        _ => false,
    }
}

pub fn ensure_reservation_transition(
    from: ReservationStatus,
    to: ReservationStatus,
) -> Result<(), EngineError> {
    if reservation_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Rejected | ProposalStatus::Invoiced)
    }
}

pub fn proposal_transition_allowed(from: ProposalStatus, to: ProposalStatus) -> bool {
    use ProposalStatus as P;
    matches!(
        (from, to),
        (P::PendingReview, P::Approved) | (P::PendingReview, P::Rejected) | (P::Approved, P::Invoiced)
    )
}

pub fn ensure_proposal_transition(from: ProposalStatus, to: ProposalStatus) -> Result<(), EngineError> {
    if proposal_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
