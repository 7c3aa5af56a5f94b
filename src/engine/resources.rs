use ulid::Ulid;

use crate::audit::{AuditDraft, AuditOperation, AuditTarget};
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Guards};

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: String,
        category: ResourceCategory,
        parent_id: Option<Ulid>,
        actor: &Principal,
    ) -> Result<ResourceInfo, EngineError> {
        if !actor.can_administer() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not create resources",
                actor.id
            )));
        }
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::Validation("resource name is empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        if let ResourceCategory::Device { device_type } = &category
            && (device_type.is_empty() || device_type.len() > MAX_NAME_LEN)
        {
            return Err(EngineError::Validation("device type is empty or too long".into()));
        }
        let _row = self.lock_row(id).await;
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("resource {id}")));
        }
        if let Some(pid) = parent_id {
            if pid == id {
                return Err(EngineError::Validation("resource cannot be its own parent".into()));
            }
            if !self.catalog.contains_key(&pid) {
                return Err(EngineError::not_found("parent resource", pid));
            }
            let mut depth = 1usize;
            let mut cur = self.catalog.get(&pid).and_then(|e| e.parent_id);
            while let Some(cid) = cur {
                depth += 1;
                if depth >= MAX_HIERARCHY_DEPTH {
                    return Err(EngineError::LimitExceeded("hierarchy too deep"));
                }
                cur = self.catalog.get(&cid).and_then(|e| e.parent_id);
            }
        }

        let mut draft = AuditDraft::new(actor, AuditOperation::ResourceCreate, AuditTarget::Resource(id))
            .meta("name", &name)
            .meta("category", category.label());
        match &category {
            ResourceCategory::Room { seats } => draft = draft.meta("seats", seats),
            ResourceCategory::Device { device_type } => draft = draft.meta("device_type", device_type),
        }
        if let Some(pid) = parent_id {
            draft = draft.meta("parent_id", pid);
        }

        let event = Event::ResourceCreated {
            id,
            name,
            category,
            parent_id,
        };
        self.commit(vec![event], draft, &mut Guards::new()).await?;
        tracing::debug!(%id, "resource created");
        self.resource_info(&id)
            .ok_or_else(|| EngineError::not_found("resource", id))
    }

    /// Deactivate or reactivate. Resources are never deleted: reservations keep
    /// referring to them, and existing bindings stay in force.
    pub async fn set_resource_active(
        &self,
        id: Ulid,
        active: bool,
        actor: &Principal,
    ) -> Result<ResourceInfo, EngineError> {
        if !self.resources.contains_key(&id) {
            return Err(EngineError::not_found("resource", id));
        }
        if !actor.can_administer() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not change resources",
                actor.id
            )));
        }

        let mut guards = self.lock_resources([id]).await?;
        let currently = guards.get(&id).map(|g| g.active).unwrap_or(active);
        if currently == active {
            return self
                .resource_info(&id)
                .ok_or_else(|| EngineError::not_found("resource", id));
        }

        let op = if active {
            AuditOperation::ResourceActivate
        } else {
            AuditOperation::ResourceDeactivate
        };
        let draft = AuditDraft::new(actor, op, AuditTarget::Resource(id));
        self.commit(vec![Event::ResourceActiveSet { id, active }], draft, &mut guards)
            .await?;
        drop(guards);
        self.resource_info(&id)
            .ok_or_else(|| EngineError::not_found("resource", id))
    }

    pub fn resource_info(&self, id: &Ulid) -> Option<ResourceInfo> {
        self.catalog.get(id).map(|e| e.value().clone())
    }

    /// All resources, ordered by name.
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out: Vec<ResourceInfo> = self.catalog.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Register a human or system principal. Agents go through `register_agent`.
    pub async fn register_principal(
        &self,
        principal: Principal,
        actor: &Principal,
    ) -> Result<(), EngineError> {
        if !actor.can_administer() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not register principals",
                actor.id
            )));
        }
        if principal.id.is_empty() || principal.id.len() > MAX_ID_LEN {
            return Err(EngineError::Validation("principal id is empty or too long".into()));
        }
        match (principal.kind, principal.role) {
            (ActorKind::Agent, _) => {
                return Err(EngineError::Validation(
                    "agents are registered with their quota".into(),
                ));
            }
            (ActorKind::Human, None) => {
                return Err(EngineError::Validation("a human principal needs a role".into()));
            }
            (ActorKind::System, Some(_)) => {
                return Err(EngineError::Validation("system principals have no role".into()));
            }
            _ => {}
        }
        let _row = self.lock_principal(&principal.id).await;
        if self.principals.contains_key(&principal.id) || self.agents.contains_key(&principal.id) {
            return Err(EngineError::AlreadyExists(format!("principal {}", principal.id)));
        }

        let mut draft = AuditDraft::new(
            actor,
            AuditOperation::PrincipalRegister,
            AuditTarget::Principal(principal.id.clone()),
        )
        .meta("kind", principal.kind.as_str());
        if let Some(role) = principal.role {
            draft = draft.meta("role", role.as_str());
        }
        self.commit(vec![Event::PrincipalRegistered { principal }], draft, &mut Guards::new())
            .await?;
        Ok(())
    }

    /// Resolve an acting identity: registered humans/system, or registered agents.
    pub fn principal(&self, id: &str) -> Option<Principal> {
        if let Some(p) = self.principals.get(id) {
            return Some(p.value().clone());
        }
        self.agents.get(id).map(|_| Principal::agent(id))
    }
}
