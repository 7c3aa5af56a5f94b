use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::{ActorKind, Ms, Principal};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOperation {
    PrincipalRegister,
    ResourceCreate,
    ResourceDeactivate,
    ResourceActivate,
    AgentRegister,
    AgentConfigChange,
    ReservationSubmit,
    ReservationAssign,
    ReservationConfirm,
    ReservationCancel,
    CostPropose,
    ProposalApprove,
    ProposalReject,
    ProposalInvoice,
    // Reported by agents through `log_action`.
    InventoryAudit,
    CostCalculation,
    BookingPropose,
    Read,
    ConfigChange,
    Custom(String),
}

impl AuditOperation {
    pub fn as_str(&self) -> &str {
        match self {
            AuditOperation::PrincipalRegister => "principal_register",
            AuditOperation::ResourceCreate => "resource_create",
            AuditOperation::ResourceDeactivate => "resource_deactivate",
            AuditOperation::ResourceActivate => "resource_activate",
            AuditOperation::AgentRegister => "agent_register",
            AuditOperation::AgentConfigChange => "agent_config_change",
            AuditOperation::ReservationSubmit => "reservation_submit",
            AuditOperation::ReservationAssign => "reservation_assign",
            AuditOperation::ReservationConfirm => "reservation_confirm",
            AuditOperation::ReservationCancel => "reservation_cancel",
            AuditOperation::CostPropose => "cost_propose",
            AuditOperation::ProposalApprove => "proposal_approve",
            AuditOperation::ProposalReject => "proposal_reject",
            AuditOperation::ProposalInvoice => "proposal_invoice",
            AuditOperation::InventoryAudit => "inventory_audit",
            AuditOperation::CostCalculation => "cost_calculation",
            AuditOperation::BookingPropose => "booking_propose",
            AuditOperation::Read => "read",
            AuditOperation::ConfigChange => "config_change",
            AuditOperation::Custom(s) => s,
        }
    }

    /// Operations an agent may report about itself. Engine-owned operations are
    /// only ever written by the engine.
    pub fn parse_reported(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "inventory_audit" => Some(AuditOperation::InventoryAudit),
            "cost_calculation" => Some(AuditOperation::CostCalculation),
            "booking_propose" => Some(AuditOperation::BookingPropose),
            "read" => Some(AuditOperation::Read),
            "config_change" => Some(AuditOperation::ConfigChange),
            "" => None,
            _ if Self::is_engine_owned(&s) => None,
            _ => Some(AuditOperation::Custom(s)),
        }
    }

    fn is_engine_owned(s: &str) -> bool {
        matches!(
            s,
            "principal_register"
                | "resource_create"
                | "resource_deactivate"
                | "resource_activate"
                | "agent_register"
                | "agent_config_change"
                | "reservation_submit"
                | "reservation_assign"
                | "reservation_confirm"
                | "reservation_cancel"
                | "cost_propose"
                | "proposal_approve"
                | "proposal_reject"
                | "proposal_invoice"
        )
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an audit record is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditTarget {
    Resource(Ulid),
    Reservation(Ulid),
    Proposal(Ulid),
    Agent(String),
    Principal(String),
    External(String),
    None,
}

impl AuditTarget {
    /// Parse `kind:id`. Unknown kinds are kept verbatim as external references.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return AuditTarget::None;
        }
        let Some((kind, id)) = s.split_once(':') else {
            return AuditTarget::External(s.to_string());
        };
        let ulid = || Ulid::from_string(id).ok();
        match kind {
            "resource" => ulid().map(AuditTarget::Resource),
            "reservation" => ulid().map(AuditTarget::Reservation),
            "proposal" => ulid().map(AuditTarget::Proposal),
            "agent" => Some(AuditTarget::Agent(id.to_string())),
            "principal" => Some(AuditTarget::Principal(id.to_string())),
            "external" if !id.is_empty() => Some(AuditTarget::External(id.to_string())),
            _ => None,
        }
        .unwrap_or_else(|| AuditTarget::External(s.to_string()))
    }
}

impl fmt::Display for AuditTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditTarget::Resource(id) => write!(f, "resource:{id}"),
            AuditTarget::Reservation(id) => write!(f, "reservation:{id}"),
            AuditTarget::Proposal(id) => write!(f, "proposal:{id}"),
            AuditTarget::Agent(id) => write!(f, "agent:{id}"),
            AuditTarget::Principal(id) => write!(f, "principal:{id}"),
            AuditTarget::External(s) => f.write_str(s),
            AuditTarget::None => f.write_str("-"),
        }
    }
}

/// One immutable audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Ulid,
    pub at: Ms,
    pub actor_id: String,
    pub actor_kind: ActorKind,
    pub operation: AuditOperation,
    pub target: AuditTarget,
    pub metadata: BTreeMap<String, String>,
    pub authorized_by: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit record has no actor")]
    MissingActor,
    #[error("too many metadata entries: {0}")]
    TooManyEntries(usize),
    #[error("metadata key too long or empty: {0:?}")]
    BadKey(String),
    #[error("metadata value for {0:?} too long")]
    ValueTooLong(String),
    #[error("error detail too long")]
    ErrorTooLong,
}

/// Audit record under construction. Finalised inside the commit that applies it.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    actor_id: String,
    actor_kind: ActorKind,
    operation: AuditOperation,
    target: AuditTarget,
    metadata: BTreeMap<String, String>,
    authorized_by: Option<String>,
    success: bool,
    error: Option<String>,
    duration_ms: Option<u64>,
    started: Instant,
}

impl AuditDraft {
    pub fn new(actor: &Principal, operation: AuditOperation, target: AuditTarget) -> Self {
        Self {
            actor_id: actor.id.clone(),
            actor_kind: actor.kind,
            operation,
            target,
            metadata: BTreeMap::new(),
            authorized_by: None,
            success: true,
            error: None,
            duration_ms: None,
            started: Instant::now(),
        }
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn metadata(mut self, entries: BTreeMap<String, String>) -> Self {
        self.metadata.extend(entries);
        self
    }

    pub fn authorized_by(mut self, actor_id: impl Into<String>) -> Self {
        self.authorized_by = Some(actor_id.into());
        self
    }

    pub fn outcome(mut self, success: bool, error: Option<String>) -> Self {
        self.success = success;
        self.error = error;
        self
    }

    /// Reported duration. When unset, the draft's own elapsed time is recorded.
    pub fn duration_ms(mut self, ms: Option<u64>) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        if self.actor_id.is_empty() {
            return Err(AuditError::MissingActor);
        }
        if self.metadata.len() > MAX_AUDIT_METADATA_ENTRIES {
            return Err(AuditError::TooManyEntries(self.metadata.len()));
        }
        for (k, v) in &self.metadata {
            if k.is_empty() || k.len() > MAX_AUDIT_METADATA_KEY_LEN {
                return Err(AuditError::BadKey(k.clone()));
            }
            if v.len() > MAX_AUDIT_METADATA_VALUE_LEN {
                return Err(AuditError::ValueTooLong(k.clone()));
            }
        }
        if self.error.as_ref().is_some_and(|e| e.len() > MAX_AUDIT_ERROR_LEN) {
            return Err(AuditError::ErrorTooLong);
        }
        Ok(())
    }

    pub fn finish(self, id: Ulid, at: Ms) -> Result<AuditRecord, AuditError> {
        self.validate()?;
        let duration_ms = self
            .duration_ms
            .unwrap_or_else(|| self.started.elapsed().as_millis() as u64);
        Ok(AuditRecord {
            id,
            at,
            actor_id: self.actor_id,
            actor_kind: self.actor_kind,
            operation: self.operation,
            target: self.target,
            metadata: self.metadata,
            authorized_by: self.authorized_by,
            success: self.success,
            error: self.error,
            duration_ms: Some(duration_ms),
        })
    }
}

/// Insert-only audit ledger: rows are appended by commits and never updated or removed.
#[derive(Default)]
pub struct AuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, Vec<AuditRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn append(&self, record: AuditRecord) {
        self.rows().push(record);
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<AuditRecord> {
        self.rows().iter().find(|r| r.id == *id).cloned()
    }

    pub fn by_actor(&self, actor_id: &str) -> Vec<AuditRecord> {
        self.filtered(|r| r.actor_id == actor_id)
    }

    pub fn by_target(&self, target: &AuditTarget) -> Vec<AuditRecord> {
        self.filtered(|r| r.target == *target)
    }

    /// Most recent `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let rows = self.rows();
        let skip = rows.len().saturating_sub(limit.min(MAX_AUDIT_QUERY_ROWS));
        rows[skip..].to_vec()
    }

    pub(crate) fn snapshot(&self) -> Vec<AuditRecord> {
        self.rows().clone()
    }

    fn filtered(&self, pred: impl Fn(&AuditRecord) -> bool) -> Vec<AuditRecord> {
        let rows = self.rows();
        let mut out: Vec<AuditRecord> = rows.iter().rev().filter(|r| pred(r)).take(MAX_AUDIT_QUERY_ROWS).cloned().collect();
        out.reverse();
        out
    }
}
