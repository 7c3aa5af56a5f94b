use std::collections::BTreeSet;

use serde::Serialize;
use ulid::Ulid;

use crate::audit::{AuditDraft, AuditOperation, AuditTarget};
use crate::lifecycle::ensure_reservation_transition;
use crate::limits::*;
use crate::model::*;

use super::conflict::{capacity_warning, now_ms, resolve_policy, validate_span};
use super::{Engine, EngineError, Guards};

/// One requested time segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub id: Option<Ulid>,
    /// Bound directly when the actor may assign resources; otherwise remembered
    /// as the requested resource of an unresolved reservation.
    pub resource_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub segments: Vec<SegmentRequest>,
    /// Defaults to the first segment's id.
    pub group_id: Option<Ulid>,
    pub tenant: String,
    pub headcount: u32,
    pub payload: Option<String>,
    pub override_conflicts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentOutcome {
    pub id: Ulid,
    pub resource_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    pub group_id: Ulid,
    pub segments: Vec<SegmentOutcome>,
    pub warnings: Vec<String>,
    pub override_used: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub reservation_id: Ulid,
    pub target: ReservationStatus,
    /// Assignment only; defaults to the requested resource.
    pub resource_id: Option<Ulid>,
    pub override_conflicts: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub reservation: Reservation,
    pub warnings: Vec<String>,
    pub override_used: bool,
}

/// A validated segment ready to be written.
struct Planned {
    id: Ulid,
    span: Span,
    resource: Option<ResourceInfo>,
    binding: bool,
}

impl Engine {
    /// Submit one logical reservation of one or more segments. All-or-nothing.
    ///
    /// Segments with a resource become `ResourceAssigned` when the actor may assign
    /// resources; otherwise they are `Unresolved` and the resource is kept as the
    /// request (still conflict-checked, always hard-blocking).
    pub async fn submit_reservation(
        &self,
        req: SubmitRequest,
        actor: &Principal,
    ) -> Result<SubmitOutcome, EngineError> {
        if req.override_conflicts && !actor.can_override_conflicts() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not override conflicts",
                actor.id
            )));
        }
        if req.segments.is_empty() {
            return Err(EngineError::Validation("reservation has no segments".into()));
        }
        if req.segments.len() > MAX_SEGMENTS_PER_RESERVATION {
            return Err(EngineError::LimitExceeded("too many segments"));
        }
        let tenant = req.tenant.trim().to_string();
        if tenant.is_empty() {
            return Err(EngineError::Validation("tenant is empty".into()));
        }
        if tenant.len() > MAX_TENANT_LEN {
            return Err(EngineError::LimitExceeded("tenant too long"));
        }
        if req.payload.as_ref().is_some_and(|p| p.len() > MAX_PAYLOAD_LEN) {
            return Err(EngineError::LimitExceeded("payload too large"));
        }

        let privileged = actor.can_assign_resources();
        let mut warnings = Vec::new();
        let mut planned = Vec::with_capacity(req.segments.len());
        for seg in &req.segments {
            let span = validate_span(seg.start, seg.end)?;
            let resource = match seg.resource_id {
                Some(rid) => {
                    let info = self.ensure_bookable(rid)?;
                    warnings.extend(capacity_warning(&info, req.headcount));
                    Some(info)
                }
                None => None,
            };
            planned.push(Planned {
                id: seg.id.unwrap_or_else(Ulid::new),
                span,
                binding: privileged && resource.is_some(),
                resource,
            });
        }

        let mut seen = BTreeSet::new();
        for p in &planned {
            if !seen.insert(p.id) {
                return Err(EngineError::Validation(format!("duplicate segment id {}", p.id)));
            }
        }
        for (i, a) in planned.iter().enumerate() {
            for b in &planned[i + 1..] {
                let same = matches!((&a.resource, &b.resource), (Some(x), Some(y)) if x.id == y.id);
                if same && a.span.overlaps(&b.span) {
                    return Err(EngineError::Validation(format!(
                        "segments {} and {} overlap on the same resource",
                        a.id, b.id
                    )));
                }
            }
        }

        let group_id = req.group_id.unwrap_or(planned[0].id);

        let mut rows = Vec::with_capacity(planned.len());
        for id in &seen {
            rows.push(self.lock_row(*id).await);
        }
        for p in &planned {
            if self.reservations.contains_key(&p.id) {
                return Err(EngineError::AlreadyExists(format!("reservation {}", p.id)));
            }
        }

        let mut attempt = 0;
        let (mut guards, override_used) = loop {
            attempt += 1;

            // Pre-check without write locks. Requested (unresolved) resources are
            // hard-blocking and never re-checked: they hold nothing.
            let mut override_used = false;
            for p in &planned {
                let Some(info) = &p.resource else { continue };
                let conflicts = self.find_conflicts(info.id, &p.span, None).await;
                if p.binding {
                    override_used |= resolve_policy(&conflicts, actor, req.override_conflicts)?;
                } else {
                    resolve_policy(&conflicts, actor, false)?;
                }
            }

            let lock_ids: Vec<Ulid> = planned
                .iter()
                .filter(|p| p.binding)
                .filter_map(|p| p.resource.as_ref())
                .flat_map(|info| self.lock_set(info.id))
                .collect();
            let guards = self.lock_resources(lock_ids).await?;

            match self.recheck_locked(&guards, &planned, actor, req.override_conflicts) {
                Ok(()) => break (guards, override_used),
                Err(e) if attempt < 2 => {
                    tracing::debug!("submit lost a race, retrying: {e}");
                    metrics::counter!(crate::observability::COMMIT_RETRIES_TOTAL).increment(1);
                    drop(guards);
                }
                Err(e) => return Err(e),
            }
        };

        let now = now_ms();
        let mut events = Vec::with_capacity(planned.len());
        let mut segments = Vec::with_capacity(planned.len());
        for p in &planned {
            let resource_id = p.resource.as_ref().map(|r| r.id);
            let status = if p.binding {
                ReservationStatus::ResourceAssigned
            } else {
                ReservationStatus::Unresolved
            };
            let reservation = Reservation {
                id: p.id,
                group_id,
                resource_id: if p.binding { resource_id } else { None },
                requested_resource: if p.binding { None } else { resource_id },
                span: p.span,
                tenant: tenant.clone(),
                status,
                headcount: req.headcount,
                payload: req.payload.clone(),
                created_at: now,
                created_by: actor.id.clone(),
                updated_at: now,
            };
            segments.push(SegmentOutcome {
                id: p.id,
                resource_id: reservation.resource_id,
                start: p.span.start,
                end: p.span.end,
                status,
            });
            events.push(Event::ReservationCreated { reservation });
        }

        let mut draft = AuditDraft::new(
            actor,
            AuditOperation::ReservationSubmit,
            AuditTarget::Reservation(group_id),
        )
        .meta("segments", planned.len())
        .meta("tenant", &tenant)
        .meta("headcount", req.headcount);
        if override_used {
            draft = draft.meta("override", "related_resource").authorized_by(&actor.id);
        }
        if !warnings.is_empty() {
            draft = draft.meta("warnings", warnings.join("; "));
        }
        self.commit(events, draft, &mut guards).await?;
        drop(guards);
        drop(rows);

        tracing::debug!(%group_id, segments = segments.len(), "reservation submitted");
        Ok(SubmitOutcome {
            group_id,
            segments,
            warnings,
            override_used,
        })
    }

    /// Storage re-check of every binding segment under the write locks.
    fn recheck_locked(
        &self,
        guards: &Guards,
        planned: &[Planned],
        actor: &Principal,
        override_requested: bool,
    ) -> Result<(), EngineError> {
        for p in planned.iter().filter(|p| p.binding) {
            let Some(info) = &p.resource else { continue };
            if !guards.get(&info.id).is_some_and(|g| g.active) {
                return Err(EngineError::Validation(format!("resource {} is inactive", info.id)));
            }
            let conflicts = self.find_conflicts_locked(guards, info.id, &p.span, None);
            resolve_policy(&conflicts, actor, override_requested)?;
        }
        Ok(())
    }

    /// Move one reservation segment along its lifecycle.
    ///
    /// Checks run in order: existence, legality of the transition, privilege,
    /// then preconditions (resource, conflicts).
    pub async fn transition_reservation(
        &self,
        req: TransitionRequest,
        actor: &Principal,
    ) -> Result<TransitionOutcome, EngineError> {
        let _row = self.lock_row(req.reservation_id).await;
        let current = self
            .reservations
            .get(&req.reservation_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::not_found("reservation", req.reservation_id))?;
        ensure_reservation_transition(current.status, req.target)?;

        let privileged = match req.target {
            ReservationStatus::Cancelled => {
                current.created_by == actor.id || actor.can_administer()
            }
            _ => actor.can_assign_resources(),
        };
        if !privileged {
            return Err(EngineError::Unauthorized(format!(
                "{} may not move reservation {} to {}",
                actor.id, current.id, req.target
            )));
        }
        if req.override_conflicts && !actor.can_override_conflicts() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not override conflicts",
                actor.id
            )));
        }

        let outcome = match req.target {
            ReservationStatus::ResourceAssigned => self.assign(&current, &req, actor).await?,
            ReservationStatus::Confirmed => self.confirm(&current, &req, actor).await?,
            ReservationStatus::Cancelled => self.cancel(&current, &req, actor).await?,
            ReservationStatus::Unresolved => {
                return Err(EngineError::IllegalTransition {
                    from: current.status.to_string(),
                    to: req.target.to_string(),
                });
            }
        };
        tracing::debug!(id = %current.id, from = %current.status, to = %req.target, "reservation transition");
        Ok(outcome)
    }

    async fn assign(
        &self,
        current: &Reservation,
        req: &TransitionRequest,
        actor: &Principal,
    ) -> Result<TransitionOutcome, EngineError> {
        let resource_id = req
            .resource_id
            .or(current.requested_resource)
            .ok_or_else(|| EngineError::Validation("no resource to assign".into()))?;
        let info = self.ensure_bookable(resource_id)?;
        let warnings: Vec<String> = capacity_warning(&info, current.headcount).into_iter().collect();

        let mut attempt = 0;
        let (mut guards, override_used) = loop {
            attempt += 1;
            let conflicts = self.find_conflicts(resource_id, &current.span, Some(current.id)).await;
            let override_used = resolve_policy(&conflicts, actor, req.override_conflicts)?;

            let guards = self.lock_resources(self.lock_set(resource_id)).await?;
            let still_active = guards.get(&resource_id).is_some_and(|g| g.active);
            let conflicts = self.find_conflicts_locked(&guards, resource_id, &current.span, Some(current.id));
            let recheck = if still_active {
                resolve_policy(&conflicts, actor, req.override_conflicts).map(|_| ())
            } else {
                Err(EngineError::Validation(format!("resource {resource_id} is inactive")))
            };
            match recheck {
                Ok(()) => break (guards, override_used),
                Err(e) if attempt < 2 => {
                    tracing::debug!("assign lost a race, retrying: {e}");
                    metrics::counter!(crate::observability::COMMIT_RETRIES_TOTAL).increment(1);
                    drop(guards);
                }
                Err(e) => return Err(e),
            }
        };

        let mut draft = AuditDraft::new(
            actor,
            AuditOperation::ReservationAssign,
            AuditTarget::Reservation(current.id),
        )
        .meta("resource_id", resource_id)
        .authorized_by(&actor.id);
        if let Some(requested) = current.requested_resource
            && requested != resource_id
        {
            draft = draft.meta("requested_resource", requested);
        }
        if override_used {
            draft = draft.meta("override", "related_resource");
        }
        let event = Event::ReservationAssigned {
            id: current.id,
            resource_id,
            at: now_ms(),
        };
        self.commit(vec![event], draft, &mut guards).await?;
        drop(guards);
        self.transition_outcome(current.id, warnings, override_used)
    }

    async fn confirm(
        &self,
        current: &Reservation,
        req: &TransitionRequest,
        actor: &Principal,
    ) -> Result<TransitionOutcome, EngineError> {
        let resource_id = current
            .resource_id
            .ok_or_else(|| EngineError::Validation("assigned reservation has no resource".into()))?;
        let mut guards = self.lock_resources(self.lock_set(resource_id)).await?;
        let conflicts = self.find_conflicts_locked(&guards, resource_id, &current.span, Some(current.id));
        let override_used = resolve_policy(&conflicts, actor, req.override_conflicts)?;

        let mut draft = AuditDraft::new(
            actor,
            AuditOperation::ReservationConfirm,
            AuditTarget::Reservation(current.id),
        )
        .meta("resource_id", resource_id)
        .authorized_by(&actor.id);
        if override_used {
            draft = draft.meta("override", "related_resource");
        }
        let event = Event::ReservationConfirmed {
            id: current.id,
            resource_id,
            at: now_ms(),
        };
        self.commit(vec![event], draft, &mut guards).await?;
        drop(guards);
        self.transition_outcome(current.id, Vec::new(), override_used)
    }

    async fn cancel(
        &self,
        current: &Reservation,
        req: &TransitionRequest,
        actor: &Principal,
    ) -> Result<TransitionOutcome, EngineError> {
        // Unresolved reservations hold no slot: nothing to unlock.
        let bound = current.status.is_binding().then_some(current.resource_id).flatten();
        let mut guards = match bound {
            Some(rid) => self.lock_resources([rid]).await?,
            None => Guards::new(),
        };

        let mut draft = AuditDraft::new(
            actor,
            AuditOperation::ReservationCancel,
            AuditTarget::Reservation(current.id),
        )
        .meta("from", current.status);
        if let Some(reason) = &req.reason {
            draft = draft.meta("reason", reason);
        }
        if actor.id != current.created_by {
            draft = draft.authorized_by(&actor.id);
        }
        let event = Event::ReservationCancelled {
            id: current.id,
            resource_id: bound,
            at: now_ms(),
        };
        self.commit(vec![event], draft, &mut guards).await?;
        drop(guards);
        self.transition_outcome(current.id, Vec::new(), false)
    }

    fn transition_outcome(
        &self,
        id: Ulid,
        warnings: Vec<String>,
        override_used: bool,
    ) -> Result<TransitionOutcome, EngineError> {
        let reservation = self
            .reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::not_found("reservation", id))?;
        Ok(TransitionOutcome {
            reservation,
            warnings,
            override_used,
        })
    }
}
