//! Caller-facing operations. Every call resolves the acting principal, takes a
//! pool slot for the caller's tier and holds it for the duration of the call.

use std::collections::BTreeMap;
use std::sync::Arc;

use ulid::Ulid;

use crate::audit::{AuditOperation, AuditTarget};
use crate::cost::{CostComponent, CostProposal};
use crate::engine::{
    AgentRegistration, Engine, EngineError, SubmitOutcome, SubmitRequest, TransitionOutcome,
    TransitionRequest, Verdict,
};
use crate::model::*;
use crate::pool::{PoolHandle, PoolManager};

pub struct Gateway {
    engine: Arc<Engine>,
    pool: Arc<PoolManager>,
}

/// An admitted caller: who they are and the slot they hold.
pub struct Admission {
    pub principal: Principal,
    pub slot: PoolHandle,
}

impl Gateway {
    pub fn new(engine: Arc<Engine>, pool: Arc<PoolManager>) -> Self {
        Self { engine, pool }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    /// Resolve `actor_id` and acquire a slot in its tier. Humans at their cap are
    /// refused at once; agents must be enabled and back off on rejection.
    pub async fn admit(&self, actor_id: &str) -> Result<Admission, EngineError> {
        let principal = self
            .engine
            .principal(actor_id)
            .ok_or_else(|| EngineError::Unauthorized(format!("unknown principal {actor_id:?}")))?;
        let slot = match principal.kind {
            ActorKind::Human => self.pool.acquire(Tier::Interactive, actor_id).await?,
            ActorKind::System => self.pool.acquire(Tier::System, actor_id).await?,
            ActorKind::Agent => {
                let quota = self.engine.begin_unit_of_work(actor_id)?;
                self.pool.acquire_with_backoff(quota.tier, actor_id).await?
            }
        };
        Ok(Admission { principal, slot })
    }

    pub async fn submit_reservation(
        &self,
        actor_id: &str,
        req: SubmitRequest,
    ) -> Result<SubmitOutcome, EngineError> {
        let a = self.admit(actor_id).await?;
        self.engine.submit_reservation(req, &a.principal).await
    }

    pub async fn transition_reservation(
        &self,
        actor_id: &str,
        req: TransitionRequest,
    ) -> Result<TransitionOutcome, EngineError> {
        let a = self.admit(actor_id).await?;
        self.engine.transition_reservation(req, &a.principal).await
    }

    pub async fn validate(
        &self,
        actor_id: &str,
        resource_id: Option<Ulid>,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Verdict, EngineError> {
        let _a = self.admit(actor_id).await?;
        self.engine.validate(resource_id, start, end, exclude).await
    }

    /// Free resources comparable to `resource_id` (same category, enough seats
    /// for `headcount`) during the window.
    pub async fn alternatives_for(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        headcount: u32,
    ) -> Result<Vec<ResourceInfo>, EngineError> {
        let info = self
            .engine
            .resource_info(&resource_id)
            .ok_or_else(|| EngineError::NotFound(format!("resource {resource_id}")))?;
        let min_seats = info.category.seats().map(|_| headcount);
        self.engine
            .suggest_alternatives(start, end, Some(info.category.label()), min_seats, Some(resource_id))
            .await
    }

    /// An agent takes a slot in its own tier. Any other tier is refused.
    pub async fn acquire_capacity(&self, agent_id: &str, tier: Tier) -> Result<PoolHandle, EngineError> {
        let principal = self
            .engine
            .principal(agent_id)
            .ok_or_else(|| EngineError::Unauthorized(format!("unknown principal {agent_id:?}")))?;
        if principal.kind != ActorKind::Agent {
            return Err(EngineError::Unauthorized(format!("{agent_id} is not an agent")));
        }
        let quota = self.engine.begin_unit_of_work(agent_id)?;
        if quota.tier != tier {
            return Err(EngineError::Unauthorized(format!(
                "{agent_id} is assigned the {} tier, not {tier}",
                quota.tier
            )));
        }
        Ok(self.pool.acquire_with_backoff(tier, agent_id).await?)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log_action(
        &self,
        agent_id: &str,
        operation: AuditOperation,
        target: AuditTarget,
        metadata: BTreeMap<String, String>,
        success: bool,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) -> Result<Ulid, EngineError> {
        let a = self.admit(agent_id).await?;
        self.engine
            .log_action(&a.principal, operation, target, metadata, success, error, duration_ms)
            .await
    }

    pub async fn propose_cost(
        &self,
        agent_id: &str,
        id: Option<Ulid>,
        reservation_id: Ulid,
        components: Vec<CostComponent>,
    ) -> Result<Ulid, EngineError> {
        let a = self.admit(agent_id).await?;
        self.engine
            .propose_cost(id, reservation_id, components, &a.principal)
            .await
    }

    pub async fn review_proposal(
        &self,
        reviewer_id: &str,
        id: Ulid,
        approve: bool,
        note: Option<String>,
    ) -> Result<CostProposal, EngineError> {
        let a = self.admit(reviewer_id).await?;
        self.engine.review_proposal(id, approve, &a.principal, note).await
    }

    pub async fn invoice_proposal(&self, actor_id: &str, id: Ulid) -> Result<CostProposal, EngineError> {
        let a = self.admit(actor_id).await?;
        self.engine.invoice_proposal(id, &a.principal).await
    }

    pub async fn list_pending_proposals(
        &self,
        actor_id: &str,
        tier: Option<Tier>,
    ) -> Result<Vec<CostProposal>, EngineError> {
        let _a = self.admit(actor_id).await?;
        Ok(self.engine.list_pending_proposals(tier))
    }

    // ── Administration ───────────────────────────────────────

    pub async fn register_principal(
        &self,
        actor_id: &str,
        principal: Principal,
    ) -> Result<(), EngineError> {
        let a = self.admit(actor_id).await?;
        self.engine.register_principal(principal, &a.principal).await
    }

    pub async fn create_resource(
        &self,
        actor_id: &str,
        id: Ulid,
        name: String,
        category: ResourceCategory,
        parent_id: Option<Ulid>,
    ) -> Result<ResourceInfo, EngineError> {
        let a = self.admit(actor_id).await?;
        self.engine
            .create_resource(id, name, category, parent_id, &a.principal)
            .await
    }

    pub async fn set_resource_active(
        &self,
        actor_id: &str,
        id: Ulid,
        active: bool,
    ) -> Result<ResourceInfo, EngineError> {
        let a = self.admit(actor_id).await?;
        self.engine.set_resource_active(id, active, &a.principal).await
    }

    pub async fn register_agent(
        &self,
        actor_id: &str,
        reg: AgentRegistration,
    ) -> Result<AgentQuota, EngineError> {
        let a = self.admit(actor_id).await?;
        self.engine.register_agent(reg, &a.principal).await
    }
}
