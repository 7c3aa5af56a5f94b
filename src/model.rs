use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::audit::AuditRecord;
use crate::cost::CostProposal;

/// Unix milliseconds (UTC). The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Closed–open overlap: `[9, 17)` and `[17, 18)` do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Principals ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Human,
    Agent,
    System,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Human => "human",
            ActorKind::Agent => "agent",
            ActorKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Some(ActorKind::Human),
            "agent" => Some(ActorKind::Agent),
            "system" => Some(ActorKind::System),
            _ => None,
        }
    }
}

/// Role of a human principal. Agents and the system principal have no role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Can submit reservations and cancel their own.
    Staff,
    /// "Room boss": assigns resources, confirms, may override advisory conflicts.
    Scheduler,
    /// Everything a scheduler can do, plus administration and invoicing.
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Staff => "staff",
            Role::Scheduler => "scheduler",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "staff" => Some(Role::Staff),
            "scheduler" => Some(Role::Scheduler),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

pub const SYSTEM_PRINCIPAL_ID: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: ActorKind,
    pub role: Option<Role>,
}

impl Principal {
    pub fn system() -> Self {
        Self {
            id: SYSTEM_PRINCIPAL_ID.to_string(),
            kind: ActorKind::System,
            role: None,
        }
    }

    pub fn human(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            kind: ActorKind::Human,
            role: Some(role),
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ActorKind::Agent,
            role: None,
        }
    }

    pub fn is_human(&self) -> bool {
        self.kind == ActorKind::Human
    }

    /// May pick a concrete resource for a reservation and confirm it.
    pub fn can_assign_resources(&self) -> bool {
        match self.kind {
            ActorKind::System => true,
            ActorKind::Human => matches!(self.role, Some(Role::Scheduler | Role::Admin)),
            ActorKind::Agent => false,
        }
    }

    /// May push through an advisory (related-resource) conflict.
    pub fn can_override_conflicts(&self) -> bool {
        self.can_assign_resources()
    }

    /// May manage resources, principals and agent quotas.
    pub fn can_administer(&self) -> bool {
        match self.kind {
            ActorKind::System => true,
            ActorKind::Human => self.role == Some(Role::Admin),
            ActorKind::Agent => false,
        }
    }

    /// Human-in-the-loop review of agent proposals.
    pub fn can_review_proposals(&self) -> bool {
        self.is_human()
    }

    /// Invoicing has real-world financial effect: privileged humans only.
    pub fn can_invoice(&self) -> bool {
        self.is_human() && self.role == Some(Role::Admin)
    }
}

/// Caller class for the capacity pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Interactive,
    Agent,
    System,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Interactive => "interactive",
            Tier::Agent => "agent",
            Tier::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "interactive" | "ui" => Some(Tier::Interactive),
            "agent" => Some(Tier::Agent),
            "system" => Some(Tier::System),
            _ => None,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Tier::Interactive => 0,
            Tier::Agent => 1,
            Tier::System => 2,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Resources ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    Room { seats: u32 },
    Device { device_type: String },
}

impl ResourceCategory {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceCategory::Room { .. } => "room",
            ResourceCategory::Device { .. } => "device",
        }
    }

    pub fn seats(&self) -> Option<u32> {
        match self {
            ResourceCategory::Room { seats } => Some(*seats),
            ResourceCategory::Device { .. } => None,
        }
    }
}

/// Entry in a resource's binding index: one reservation segment in a binding status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub reservation_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub category: ResourceCategory,
    pub parent_id: Option<Ulid>,
    pub active: bool,
    /// Binding reservation segments, sorted by `span.start`. Never overlapping.
    pub intervals: Vec<Interval>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, category: ResourceCategory, parent_id: Option<Ulid>) -> Self {
        Self {
            id,
            name,
            category,
            parent_id,
            active: true,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by reservation id.
    pub fn remove_interval(&mut self, reservation_id: Ulid) -> Option<Interval> {
        let pos = self
            .intervals
            .iter()
            .position(|i| i.reservation_id == reservation_id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            category: self.category.clone(),
            parent_id: self.parent_id,
            active: self.active,
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Ghost inventory: no resource assigned yet.
    Unresolved,
    ResourceAssigned,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Unresolved => "unresolved",
            ReservationStatus::ResourceAssigned => "resource_assigned",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unresolved" | "pending" => Some(ReservationStatus::Unresolved),
            "resource_assigned" | "assigned" => Some(ReservationStatus::ResourceAssigned),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reservation segment. Segments sharing a `group_id` form one logical booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub group_id: Ulid,
    /// `None` while unresolved.
    pub resource_id: Option<Ulid>,
    /// What the submitter asked for when they could not assign it themselves.
    pub requested_resource: Option<Ulid>,
    pub span: Span,
    pub tenant: String,
    pub status: ReservationStatus,
    pub headcount: u32,
    /// Attendee / line-item details. Opaque to the engine.
    pub payload: Option<String>,
    pub created_at: Ms,
    pub created_by: String,
    pub updated_at: Ms,
}

// ── Agents ───────────────────────────────────────────────────────

/// Agent configuration: known shapes are typed, anything else is kept opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentConfig {
    Auditor {
        schedule: Option<String>,
        max_discrepancy_pct: u32,
    },
    Revenue {
        schedule: Option<String>,
        tax_rate_bps: Option<u32>,
    },
    ConflictResolver {
        lookahead_days: u32,
    },
    Opaque {
        kind: String,
        /// Raw JSON document as received.
        raw: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentQuota {
    pub agent_id: String,
    pub enabled: bool,
    pub version: String,
    pub tier: Tier,
    pub config: AgentConfig,
    pub updated_at: Ms,
    pub updated_by: String,
}

// ── WAL records ──────────────────────────────────────────────────

/// Flat event types, no nesting beyond the row types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PrincipalRegistered {
        principal: Principal,
    },
    ResourceCreated {
        id: Ulid,
        name: String,
        category: ResourceCategory,
        parent_id: Option<Ulid>,
    },
    ResourceActiveSet {
        id: Ulid,
        active: bool,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationAssigned {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
    ReservationConfirmed {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Option<Ulid>,
        at: Ms,
    },
    AgentRegistered {
        quota: AgentQuota,
    },
    ProposalCreated {
        proposal: CostProposal,
    },
    ProposalReviewed {
        id: Ulid,
        approved: bool,
        reviewer: String,
        note: Option<String>,
        at: Ms,
    },
    ProposalInvoiced {
        id: Ulid,
        by: String,
        at: Ms,
    },
    Audited {
        record: AuditRecord,
    },
}

impl Event {
    /// Resource whose binding index this event touches, if any.
    pub fn bound_resource(&self) -> Option<Ulid> {
        match self {
            Event::ReservationCreated { reservation } => match reservation.status {
                ReservationStatus::ResourceAssigned | ReservationStatus::Confirmed => {
                    reservation.resource_id
                }
                _ => None,
            },
            Event::ReservationAssigned { resource_id, .. }
            | Event::ReservationConfirmed { resource_id, .. } => Some(*resource_id),
            Event::ReservationCancelled { resource_id, .. } => *resource_id,
            Event::ResourceActiveSet { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// One WAL entry. Replayed all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Txn {
    pub events: Vec<Event>,
}

impl Txn {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub category: ResourceCategory,
    pub parent_id: Option<Ulid>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRelation {
    /// Same resource: blocked by the storage constraint, never overridable.
    SameResource,
    /// Parent or child of the requested resource (split / combined rooms).
    RelatedResource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictInfo {
    pub reservation_id: Ulid,
    pub group_id: Ulid,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
    pub tenant: String,
    pub relation: ConflictRelation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccupancyRow {
    pub resource_id: Ulid,
    pub resource_name: String,
    pub reservation_id: Ulid,
    pub tenant: String,
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
    pub headcount: u32,
}
