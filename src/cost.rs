use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::Ms;

/// One priced line of a proposal. Amounts are in cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostComponent {
    Room {
        resource_id: Option<Ulid>,
        description: String,
        amount_cents: i64,
    },
    Device {
        resource_id: Option<Ulid>,
        description: String,
        amount_cents: i64,
    },
    Catering {
        description: String,
        headcount: u32,
        per_head_cents: i64,
    },
    Supplies {
        description: String,
        amount_cents: i64,
    },
    /// Any line type the engine does not model; kept as received.
    Opaque {
        kind: String,
        amount_cents: i64,
        detail: String,
    },
}

impl CostComponent {
    pub fn amount_cents(&self) -> i64 {
        match self {
            CostComponent::Room { amount_cents, .. }
            | CostComponent::Device { amount_cents, .. }
            | CostComponent::Supplies { amount_cents, .. }
            | CostComponent::Opaque { amount_cents, .. } => *amount_cents,
            CostComponent::Catering {
                headcount,
                per_head_cents,
                ..
            } => per_head_cents.saturating_mul(*headcount as i64),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            CostComponent::Room { .. } => "room",
            CostComponent::Device { .. } => "device",
            CostComponent::Catering { .. } => "catering",
            CostComponent::Supplies { .. } => "supplies",
            CostComponent::Opaque { kind, .. } => kind,
        }
    }

    /// Decode a `{"kind": ..., ...}` object. Unknown kinds become `Opaque`.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "cost component must be an object".to_string())?;
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "cost component missing \"kind\"".to_string())?;
        let text = |key: &str| obj.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let cents = |key: &str| {
            obj.get(key)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| format!("{kind}: missing integer \"{key}\""))
        };
        let resource = || -> Result<Option<Ulid>, String> {
            match obj.get("resource_id").and_then(|v| v.as_str()) {
                Some(s) => Ulid::from_string(s).map(Some).map_err(|e| format!("bad resource_id: {e}")),
                None => Ok(None),
            }
        };

        match kind {
            "room" => Ok(CostComponent::Room {
                resource_id: resource()?,
                description: text("description"),
                amount_cents: cents("amount_cents")?,
            }),
            "device" => Ok(CostComponent::Device {
                resource_id: resource()?,
                description: text("description"),
                amount_cents: cents("amount_cents")?,
            }),
            "catering" => Ok(CostComponent::Catering {
                description: text("description"),
                headcount: obj
                    .get("headcount")
                    .and_then(|v| v.as_u64())
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| "catering: missing \"headcount\"".to_string())?,
                per_head_cents: cents("per_head_cents")?,
            }),
            "supplies" => Ok(CostComponent::Supplies {
                description: text("description"),
                amount_cents: cents("amount_cents")?,
            }),
            other => Ok(CostComponent::Opaque {
                kind: other.to_string(),
                amount_cents: cents("amount_cents")?,
                detail: value.to_string(),
            }),
        }
    }

    /// Decode a JSON array of components.
    pub fn list_from_json(raw: &str) -> Result<Vec<Self>, String> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| format!("components: {e}"))?;
        let items = value
            .as_array()
            .ok_or_else(|| "components must be a JSON array".to_string())?;
        items.iter().map(Self::from_json).collect()
    }
}

pub fn validate_components(components: &[CostComponent]) -> Result<(), String> {
    if components.is_empty() {
        return Err("proposal has no cost components".into());
    }
    if components.len() > MAX_COST_COMPONENTS {
        return Err(format!("more than {MAX_COST_COMPONENTS} cost components"));
    }
    for c in components {
        if c.kind().is_empty() || c.kind().len() > MAX_NAME_LEN {
            return Err("cost component kind is empty or too long".into());
        }
        if let CostComponent::Catering { per_head_cents, .. } = c
            && *per_head_cents < 0
        {
            return Err("catering: negative per-head amount".into());
        }
        let amount = c.amount_cents();
        if !(0..=MAX_COMPONENT_AMOUNT_CENTS).contains(&amount) {
            return Err(format!("{}: amount {amount} out of range", c.kind()));
        }
    }
    Ok(())
}

/// `round_half_up(subtotal * bps / 10_000)` on non-negative amounts.
pub fn tax_cents(subtotal_cents: i64, tax_rate_bps: u32) -> i64 {
    let scaled = subtotal_cents as i128 * tax_rate_bps as i128;
    ((scaled + 5_000) / 10_000) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    PendingReview,
    Approved,
    Rejected,
    Invoiced,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::PendingReview => "pending_review",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Invoiced => "invoiced",
        }
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostProposal {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub components: Vec<CostComponent>,
    pub tax_rate_bps: u32,
    pub status: ProposalStatus,
    pub proposed_by: String,
    pub proposed_at: Ms,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<Ms>,
    pub review_note: Option<String>,
    pub invoiced_by: Option<String>,
    pub invoiced_at: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CostBreakdown {
    pub subtotal_cents: i64,
    pub tax_rate_bps: u32,
    pub tax_cents: i64,
    pub total_cents: i64,
}

impl CostProposal {
    pub fn subtotal_cents(&self) -> i64 {
        self.components.iter().map(CostComponent::amount_cents).sum()
    }

    pub fn tax_cents(&self) -> i64 {
        tax_cents(self.subtotal_cents(), self.tax_rate_bps)
    }

    pub fn total_cents(&self) -> i64 {
        self.subtotal_cents() + self.tax_cents()
    }

    pub fn breakdown(&self) -> CostBreakdown {
        CostBreakdown {
            subtotal_cents: self.subtotal_cents(),
            tax_rate_bps: self.tax_rate_bps,
            tax_cents: self.tax_cents(),
            total_cents: self.total_cents(),
        }
    }
}
