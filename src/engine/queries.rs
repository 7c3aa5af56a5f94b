use ulid::Ulid;

use crate::audit::{AuditRecord, AuditTarget};
use crate::limits::*;
use crate::model::*;

use super::conflict::validate_span;
use super::{Engine, EngineError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub resource_id: Option<Ulid>,
    pub status: Option<ReservationStatus>,
    pub group_id: Option<Ulid>,
    pub tenant: Option<String>,
}

impl ReservationFilter {
    fn matches(&self, r: &Reservation) -> bool {
        self.resource_id
            .is_none_or(|id| r.resource_id == Some(id) || r.requested_resource == Some(id))
            && self.status.is_none_or(|s| r.status == s)
            && self.group_id.is_none_or(|g| r.group_id == g)
            && self.tenant.as_ref().is_none_or(|t| &r.tenant == t)
    }
}

impl Engine {
    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    /// Reservations matching `filter`, ordered by start time.
    pub fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    /// The ghost-inventory queue: unresolved reservations awaiting a resource,
    /// soonest first, then oldest request first.
    pub fn unresolved_queue(&self, limit: usize) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.status == ReservationStatus::Unresolved)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| (r.span.start, r.created_at, r.id));
        out.truncate(limit.min(MAX_UNRESOLVED_QUEUE));
        out
    }

    /// Binding reservations overlapping the window, grouped by resource name.
    pub fn occupancy(&self, start: Ms, end: Ms) -> Result<Vec<OccupancyRow>, EngineError> {
        let window = validate_span(start, end)?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let mut rows: Vec<OccupancyRow> = self
            .reservations
            .iter()
            .filter(|r| r.status.is_binding() && r.span.overlaps(&window))
            .filter_map(|r| {
                let rid = r.resource_id?;
                let name = self.catalog.get(&rid).map(|i| i.name.clone())?;
                Some(OccupancyRow {
                    resource_id: rid,
                    resource_name: name,
                    reservation_id: r.id,
                    tenant: r.tenant.clone(),
                    start: r.span.start,
                    end: r.span.end,
                    status: r.status,
                    headcount: r.headcount,
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            a.resource_name
                .cmp(&b.resource_name)
                .then(a.resource_id.cmp(&b.resource_id))
                .then(a.start.cmp(&b.start))
        });
        Ok(rows)
    }

    // ── Audit log (read side) ────────────────────────────────

    pub fn audit_len(&self) -> usize {
        self.audit.len()
    }

    pub fn audit_record(&self, id: &Ulid) -> Option<AuditRecord> {
        self.audit.get(id)
    }

    pub fn audit_by_actor(&self, actor_id: &str) -> Vec<AuditRecord> {
        self.audit.by_actor(actor_id)
    }

    pub fn audit_by_target(&self, target: &AuditTarget) -> Vec<AuditRecord> {
        self.audit.by_target(target)
    }

    pub fn audit_recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.audit.recent(limit)
    }
}
