use std::collections::BTreeMap;

use ulid::Ulid;

use crate::audit::{AuditDraft, AuditOperation, AuditTarget};
use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, Guards};

/// Registration or reconfiguration of an agent. The version is supplied by the
/// caller; nothing is bumped implicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub version: String,
    pub tier: Tier,
    pub enabled: bool,
    pub config: AgentConfig,
}

impl AgentConfig {
    /// Decode a JSON configuration document. Known kinds are typed; anything else
    /// is kept verbatim.
    pub fn from_json(raw: &str) -> Result<Self, String> {
        if raw.len() > MAX_AGENT_CONFIG_LEN {
            return Err("agent config too large".into());
        }
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| format!("agent config: {e}"))?;
        let obj = value
            .as_object()
            .ok_or_else(|| "agent config must be an object".to_string())?;
        let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("opaque");
        let schedule = obj.get("schedule").and_then(|v| v.as_str()).map(str::to_string);
        let uint = |key: &str| {
            obj.get(key)
                .and_then(|v| v.as_u64())
                .and_then(|n| u32::try_from(n).ok())
        };

        Ok(match kind {
            "auditor" => AgentConfig::Auditor {
                schedule,
                max_discrepancy_pct: uint("max_discrepancy_pct").unwrap_or(0),
            },
            "revenue" => {
                let tax_rate_bps = uint("tax_rate_bps");
                if tax_rate_bps.is_some_and(|bps| bps > MAX_TAX_RATE_BPS) {
                    return Err("revenue: tax_rate_bps out of range".into());
                }
                AgentConfig::Revenue {
                    schedule,
                    tax_rate_bps,
                }
            }
            "conflict_resolver" => AgentConfig::ConflictResolver {
                lookahead_days: uint("lookahead_days").unwrap_or(7),
            },
            other => AgentConfig::Opaque {
                kind: other.to_string(),
                raw: raw.to_string(),
            },
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            AgentConfig::Auditor { .. } => "auditor",
            AgentConfig::Revenue { .. } => "revenue",
            AgentConfig::ConflictResolver { .. } => "conflict_resolver",
            AgentConfig::Opaque { kind, .. } => kind,
        }
    }
}

impl Engine {
    /// Create or replace an agent's quota. Admin/system only.
    pub async fn register_agent(
        &self,
        reg: AgentRegistration,
        actor: &Principal,
    ) -> Result<AgentQuota, EngineError> {
        if !actor.can_administer() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not manage agents",
                actor.id
            )));
        }
        if reg.agent_id.is_empty() || reg.agent_id.len() > MAX_ID_LEN {
            return Err(EngineError::Validation("agent id is empty or too long".into()));
        }
        if reg.version.is_empty() || reg.version.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("agent version is empty or too long".into()));
        }
        let _row = self.lock_principal(&reg.agent_id).await;
        if self.principals.contains_key(&reg.agent_id) {
            return Err(EngineError::AlreadyExists(format!(
                "principal {} is not an agent",
                reg.agent_id
            )));
        }

        let previous = self.agents.get(&reg.agent_id).map(|a| a.value().clone());
        let quota = AgentQuota {
            agent_id: reg.agent_id.clone(),
            enabled: reg.enabled,
            version: reg.version,
            tier: reg.tier,
            config: reg.config,
            updated_at: now_ms(),
            updated_by: actor.id.clone(),
        };

        let op = if previous.is_some() {
            AuditOperation::AgentConfigChange
        } else {
            AuditOperation::AgentRegister
        };
        let mut draft = AuditDraft::new(actor, op, AuditTarget::Agent(quota.agent_id.clone()))
            .meta("version", &quota.version)
            .meta("tier", quota.tier)
            .meta("enabled", quota.enabled)
            .meta("config_kind", quota.config.kind())
            .authorized_by(&actor.id);
        if let Some(prev) = &previous {
            draft = draft.meta("previous_version", &prev.version);
        }
        self.commit(
            vec![Event::AgentRegistered {
                quota: quota.clone(),
            }],
            draft,
            &mut Guards::new(),
        )
        .await?;
        tracing::info!(agent = %quota.agent_id, version = %quota.version, "agent registered");
        Ok(quota)
    }

    pub async fn set_agent_enabled(
        &self,
        agent_id: &str,
        enabled: bool,
        actor: &Principal,
    ) -> Result<AgentQuota, EngineError> {
        let _row = self.lock_principal(agent_id).await;
        let mut quota = self
            .agents
            .get(agent_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| EngineError::not_found("agent", agent_id))?;
        if !actor.can_administer() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not manage agents",
                actor.id
            )));
        }
        if quota.enabled == enabled {
            return Ok(quota);
        }
        quota.enabled = enabled;
        quota.updated_at = now_ms();
        quota.updated_by = actor.id.clone();

        let draft = AuditDraft::new(
            actor,
            AuditOperation::AgentConfigChange,
            AuditTarget::Agent(agent_id.to_string()),
        )
        .meta("enabled", enabled)
        .authorized_by(&actor.id);
        self.commit(
            vec![Event::AgentRegistered {
                quota: quota.clone(),
            }],
            draft,
            &mut Guards::new(),
        )
        .await?;
        Ok(quota)
    }

    /// Gate at the start of every agent unit of work.
    pub fn begin_unit_of_work(&self, agent_id: &str) -> Result<AgentQuota, EngineError> {
        let quota = self
            .agents
            .get(agent_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| EngineError::not_found("agent", agent_id))?;
        if !quota.enabled {
            return Err(EngineError::AgentDisabled(agent_id.to_string()));
        }
        Ok(quota)
    }

    pub fn list_agents(&self) -> Vec<AgentQuota> {
        let mut out: Vec<AgentQuota> = self.agents.iter().map(|a| a.value().clone()).collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// An agent records one of its own actions. Returns the audit record id.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_action(
        &self,
        agent: &Principal,
        operation: AuditOperation,
        target: AuditTarget,
        metadata: BTreeMap<String, String>,
        success: bool,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) -> Result<Ulid, EngineError> {
        if agent.kind != ActorKind::Agent {
            return Err(EngineError::Unauthorized(format!(
                "{} is not an agent",
                agent.id
            )));
        }
        self.begin_unit_of_work(&agent.id)?;
        let draft = AuditDraft::new(agent, operation, target)
            .metadata(metadata)
            .outcome(success, error)
            .duration_ms(duration_ms);
        self.commit(Vec::new(), draft, &mut Guards::new()).await
    }
}
