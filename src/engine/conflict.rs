use std::collections::BTreeSet;

use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Guards};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Checked constructor for caller-supplied windows.
pub fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation(format!(
            "start ({start}) must be before end ({end})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range".into()));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::Validation("span too long".into()));
    }
    Ok(Span::new(start, end))
}

/// Outcome of a conflict check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "conflicts", rename_all = "snake_case")]
pub enum Verdict {
    Clear,
    Conflict(Vec<ConflictInfo>),
}

impl Verdict {
    pub fn from_conflicts(conflicts: Vec<ConflictInfo>) -> Self {
        if conflicts.is_empty() {
            Verdict::Clear
        } else {
            Verdict::Conflict(conflicts)
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, Verdict::Clear)
    }
}

/// Binding reservations on `rs` overlapping `span`, except `exclude`.
pub(super) fn scan_resource(
    engine: &Engine,
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
    relation: ConflictRelation,
    out: &mut Vec<ConflictInfo>,
) {
    for interval in rs.overlapping(span) {
        if Some(interval.reservation_id) == exclude {
            continue;
        }
        let Some(r) = engine.reservations.get(&interval.reservation_id) else {
            continue;
        };
        out.push(ConflictInfo {
            reservation_id: r.id,
            group_id: r.group_id,
            resource_id: rs.id,
            start: r.span.start,
            end: r.span.end,
            status: r.status,
            tenant: r.tenant.clone(),
            relation,
        });
    }
}

/// Apply the override policy. Returns whether an advisory conflict was overridden.
///
/// Same-resource conflicts can never be overridden; related-resource conflicts
/// yield only to a privileged actor who asked for it.
pub(super) fn resolve_policy(
    conflicts: &[ConflictInfo],
    actor: &Principal,
    override_requested: bool,
) -> Result<bool, EngineError> {
    if conflicts.is_empty() {
        return Ok(false);
    }
    let hard = conflicts
        .iter()
        .any(|c| c.relation == ConflictRelation::SameResource);
    if hard || !(override_requested && actor.can_override_conflicts()) {
        metrics::counter!(crate::observability::CONFLICTS_DETECTED_TOTAL).increment(1);
        return Err(EngineError::Conflict(conflicts.to_vec()));
    }
    Ok(true)
}

impl Engine {
    /// Ancestors and descendants of `id`: rooms that physically overlap it.
    pub fn related_resources(&self, id: Ulid) -> Vec<Ulid> {
        let mut related = BTreeSet::new();

        let mut cur = self.catalog.get(&id).and_then(|e| e.parent_id);
        let mut depth = 0;
        while let Some(pid) = cur {
            depth += 1;
            if depth > MAX_HIERARCHY_DEPTH || !related.insert(pid) {
                break;
            }
            cur = self.catalog.get(&pid).and_then(|e| e.parent_id);
        }

        let mut stack = vec![(id, 0usize)];
        while let Some((node, d)) = stack.pop() {
            if d >= MAX_HIERARCHY_DEPTH {
                continue;
            }
            if let Some(kids) = self.children.get(&node) {
                for kid in kids.iter() {
                    if *kid != id && related.insert(*kid) {
                        stack.push((*kid, d + 1));
                    }
                }
            }
        }

        related.remove(&id);
        related.into_iter().collect()
    }

    /// Resource must exist and be active to receive a reservation.
    pub(super) fn ensure_bookable(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let info = self
            .catalog
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::Validation(format!("unknown resource {id}")))?;
        if !info.active {
            return Err(EngineError::Validation(format!(
                "resource {} ({id}) is inactive",
                info.name
            )));
        }
        Ok(info)
    }

    /// Conflicts for `span` on `resource_id` and its related resources, read without
    /// holding more than one lock at a time.
    pub(super) async fn find_conflicts(
        &self,
        resource_id: Ulid,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Vec<ConflictInfo> {
        let mut out = Vec::new();
        if let Some(rs) = self.get_resource(&resource_id) {
            let guard = rs.read().await;
            scan_resource(self, &guard, span, exclude, ConflictRelation::SameResource, &mut out);
        }
        for rid in self.related_resources(resource_id) {
            if let Some(rs) = self.get_resource(&rid) {
                let guard = rs.read().await;
                scan_resource(self, &guard, span, exclude, ConflictRelation::RelatedResource, &mut out);
            }
        }
        out
    }

    /// Same as `find_conflicts`, against guards the caller already holds.
    pub(super) fn find_conflicts_locked(
        &self,
        guards: &Guards,
        resource_id: Ulid,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Vec<ConflictInfo> {
        let mut out = Vec::new();
        if let Some(g) = guards.get(&resource_id) {
            scan_resource(self, g, span, exclude, ConflictRelation::SameResource, &mut out);
        }
        for rid in self.related_resources(resource_id) {
            if let Some(g) = guards.get(&rid) {
                scan_resource(self, g, span, exclude, ConflictRelation::RelatedResource, &mut out);
            }
        }
        out
    }

    /// Lock set for binding `resource_id`: itself plus everything related.
    pub(super) fn lock_set(&self, resource_id: Ulid) -> Vec<Ulid> {
        let mut ids = self.related_resources(resource_id);
        ids.push(resource_id);
        ids
    }

    /// Conflict check with no writes. `resource_id = None` (ghost inventory) is always clear.
    pub async fn validate(
        &self,
        resource_id: Option<Ulid>,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Verdict, EngineError> {
        let span = validate_span(start, end)?;
        let Some(resource_id) = resource_id else {
            return Ok(Verdict::Clear);
        };
        self.ensure_bookable(resource_id)?;
        Ok(Verdict::from_conflicts(
            self.find_conflicts(resource_id, &span, exclude).await,
        ))
    }

    /// Active resources with no binding reservation on themselves or any related
    /// resource during the window, ordered by name.
    pub async fn suggest_alternatives(
        &self,
        start: Ms,
        end: Ms,
        category: Option<&str>,
        min_seats: Option<u32>,
        exclude: Option<Ulid>,
    ) -> Result<Vec<ResourceInfo>, EngineError> {
        let span = validate_span(start, end)?;
        let mut candidates: Vec<ResourceInfo> = self
            .catalog
            .iter()
            .map(|e| e.value().clone())
            .filter(|info| info.active && Some(info.id) != exclude)
            .filter(|info| category.is_none_or(|c| info.category.label() == c))
            .filter(|info| {
                min_seats.is_none_or(|n| info.category.seats().is_some_and(|s| s >= n))
            })
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

        let mut free = Vec::new();
        for info in candidates {
            if self.find_conflicts(info.id, &span, None).await.is_empty() {
                free.push(info);
            }
        }
        Ok(free)
    }
}

/// Non-blocking warning when a room is too small for the party.
pub(super) fn capacity_warning(info: &ResourceInfo, headcount: u32) -> Option<String> {
    match info.category.seats() {
        Some(seats) if headcount > seats => Some(format!(
            "headcount {headcount} exceeds {seats} seats in {}",
            info.name
        )),
        _ => None,
    }
}
