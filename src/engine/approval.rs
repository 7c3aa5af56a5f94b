use ulid::Ulid;

use crate::audit::{AuditDraft, AuditOperation, AuditTarget};
use crate::cost::{validate_components, CostComponent, CostProposal, ProposalStatus};
use crate::lifecycle::ensure_proposal_transition;
use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, Guards};

impl Engine {
    /// An agent proposes a cost for a reservation. The proposal waits for a human.
    pub async fn propose_cost(
        &self,
        id: Option<Ulid>,
        reservation_id: Ulid,
        components: Vec<CostComponent>,
        agent: &Principal,
    ) -> Result<Ulid, EngineError> {
        if agent.kind != ActorKind::Agent {
            return Err(EngineError::Unauthorized(format!(
                "{} is not an agent; only agents propose costs",
                agent.id
            )));
        }
        let quota = self.begin_unit_of_work(&agent.id)?;
        let reservation = self
            .reservations
            .get(&reservation_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::not_found("reservation", reservation_id))?;
        if reservation.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "reservation {reservation_id} is cancelled"
            )));
        }
        validate_components(&components).map_err(EngineError::Validation)?;

        let id = id.unwrap_or_else(Ulid::new);
        let _row = self.lock_row(id).await;
        if self.proposals.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("proposal {id}")));
        }

        let tax_rate_bps = match &quota.config {
            AgentConfig::Revenue {
                tax_rate_bps: Some(bps),
                ..
            } => (*bps).min(MAX_TAX_RATE_BPS),
            _ => self.tax_rate_bps,
        };
        let proposal = CostProposal {
            id,
            reservation_id,
            components,
            tax_rate_bps,
            status: ProposalStatus::PendingReview,
            proposed_by: agent.id.clone(),
            proposed_at: now_ms(),
            reviewed_by: None,
            reviewed_at: None,
            review_note: None,
            invoiced_by: None,
            invoiced_at: None,
        };
        let breakdown = proposal.breakdown();

        let draft = AuditDraft::new(agent, AuditOperation::CostPropose, AuditTarget::Proposal(id))
            .meta("reservation_id", reservation_id)
            .meta("components", proposal.components.len())
            .meta("subtotal_cents", breakdown.subtotal_cents)
            .meta("tax_cents", breakdown.tax_cents)
            .meta("total_cents", breakdown.total_cents)
            .meta("agent_version", &quota.version);
        self.commit(vec![Event::ProposalCreated { proposal }], draft, &mut Guards::new())
            .await?;
        tracing::info!(%id, agent = %agent.id, total_cents = breakdown.total_cents, "cost proposed");
        Ok(id)
    }

    /// Human-in-the-loop decision on a pending proposal.
    pub async fn review_proposal(
        &self,
        id: Ulid,
        approve: bool,
        reviewer: &Principal,
        note: Option<String>,
    ) -> Result<CostProposal, EngineError> {
        let _row = self.lock_row(id).await;
        let current = self
            .proposals
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| EngineError::not_found("proposal", id))?;
        let target = if approve {
            ProposalStatus::Approved
        } else {
            ProposalStatus::Rejected
        };
        ensure_proposal_transition(current.status, target)?;
        if !reviewer.can_review_proposals() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not review proposals",
                reviewer.id
            )));
        }
        if note.as_ref().is_some_and(|n| n.len() > MAX_AUDIT_METADATA_VALUE_LEN) {
            return Err(EngineError::LimitExceeded("review note too long"));
        }

        let op = if approve {
            AuditOperation::ProposalApprove
        } else {
            AuditOperation::ProposalReject
        };
        let mut draft = AuditDraft::new(reviewer, op, AuditTarget::Proposal(id))
            .meta("proposed_by", &current.proposed_by)
            .meta("total_cents", current.total_cents())
            .authorized_by(&reviewer.id);
        if let Some(n) = &note {
            draft = draft.meta("note", n);
        }
        let event = Event::ProposalReviewed {
            id,
            approved: approve,
            reviewer: reviewer.id.clone(),
            note,
            at: now_ms(),
        };
        self.commit(vec![event], draft, &mut Guards::new()).await?;
        self.get_proposal(&id)
            .ok_or_else(|| EngineError::not_found("proposal", id))
    }

    /// Approved → invoiced. Financial effect: privileged humans only, never agents.
    pub async fn invoice_proposal(
        &self,
        id: Ulid,
        actor: &Principal,
    ) -> Result<CostProposal, EngineError> {
        let _row = self.lock_row(id).await;
        let current = self
            .proposals
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| EngineError::not_found("proposal", id))?;
        ensure_proposal_transition(current.status, ProposalStatus::Invoiced)?;
        if !actor.can_invoice() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not invoice",
                actor.id
            )));
        }

        let draft = AuditDraft::new(actor, AuditOperation::ProposalInvoice, AuditTarget::Proposal(id))
            .meta("reservation_id", current.reservation_id)
            .meta("total_cents", current.total_cents())
            .authorized_by(&actor.id);
        let event = Event::ProposalInvoiced {
            id,
            by: actor.id.clone(),
            at: now_ms(),
        };
        self.commit(vec![event], draft, &mut Guards::new()).await?;
        self.get_proposal(&id)
            .ok_or_else(|| EngineError::not_found("proposal", id))
    }

    pub fn get_proposal(&self, id: &Ulid) -> Option<CostProposal> {
        self.proposals.get(id).map(|p| p.value().clone())
    }

    /// Proposals awaiting review, oldest first, optionally only those from agents
    /// in `tier`.
    pub fn list_pending_proposals(&self, tier: Option<Tier>) -> Vec<CostProposal> {
        let mut out: Vec<CostProposal> = self
            .proposals
            .iter()
            .filter(|p| p.status == ProposalStatus::PendingReview)
            .filter(|p| {
                tier.is_none_or(|t| {
                    self.agents
                        .get(&p.proposed_by)
                        .is_some_and(|a| a.tier == t)
                })
            })
            .map(|p| p.value().clone())
            .collect();
        out.sort_by_key(|p| (p.proposed_at, p.id));
        out
    }
}
