//! Line protocol: one command per line in, one JSON object per line out.
//! Notifications for LISTENed resources are interleaved as their own lines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::cost::CostProposal;
use crate::engine::{AgentRegistration, EngineError, SegmentRequest, SubmitRequest, TransitionRequest};
use crate::gateway::Gateway;
use crate::limits::{MAX_AUDIT_QUERY_ROWS, MAX_LINE_LEN, MAX_UNRESOLVED_QUEUE};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

const RECENT_AUDIT_ROWS: usize = 100;
const NOTIFY_BUFFER: usize = 1024;

/// Per-connection state.
struct Session {
    actor: Option<String>,
    listeners: HashMap<Ulid, JoinHandle<()>>,
    notify_tx: mpsc::Sender<String>,
}

impl Session {
    fn actor(&self) -> Result<&str, Failure> {
        self.actor
            .as_deref()
            .ok_or_else(|| Failure::Session("no actor set; send SET actor = '<id>' first".into()))
    }

    fn unlisten(&mut self, resource_id: &Ulid) -> bool {
        match self.listeners.remove(resource_id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, task) in self.listeners.drain() {
            task.abort();
        }
    }
}

enum Failure {
    Engine {
        error: EngineError,
        suggestions: Vec<ResourceInfo>,
    },
    Parse(SqlError),
    Session(String),
}

impl From<EngineError> for Failure {
    fn from(error: EngineError) -> Self {
        Failure::Engine {
            error,
            suggestions: Vec::new(),
        }
    }
}

impl From<SqlError> for Failure {
    fn from(e: SqlError) -> Self {
        Failure::Parse(e)
    }
}

impl Failure {
    fn kind(&self) -> &'static str {
        match self {
            Failure::Engine { error, .. } => error.kind(),
            Failure::Parse(_) => "parse",
            Failure::Session(_) => "unauthorized",
        }
    }

    fn into_json(self) -> Value {
        let kind = self.kind();
        match self {
            Failure::Engine { error, suggestions } => {
                let mut body = json!({ "kind": kind, "message": error.to_string() });
                if let EngineError::Conflict(conflicts) = &error {
                    body["conflicts"] = json!(conflicts);
                    body["suggestions"] = json!(suggestions);
                }
                if let EngineError::PoolExhausted(pool) = &error {
                    body["reason"] = json!(pool.reason());
                }
                json!({ "ok": false, "error": body })
            }
            Failure::Parse(e) => json!({ "ok": false, "error": { "kind": kind, "message": e.to_string() } }),
            Failure::Session(msg) => json!({ "ok": false, "error": { "kind": kind, "message": msg } }),
        }
    }
}

fn ok(data: Value) -> Value {
    json!({ "ok": true, "data": data })
}

pub async fn process_connection<S>(socket: S, gateway: Arc<Gateway>) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (mut sink, mut lines) = framed.split();
    let (notify_tx, mut notify_rx) = mpsc::channel::<String>(NOTIFY_BUFFER);
    let mut session = Session {
        actor: None,
        listeners: HashMap::new(),
        notify_tx,
    };

    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else { break };
                let reply = match line {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => handle_line(&gateway, &mut session, &line).await,
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        json!({ "ok": false, "error": { "kind": "limit_exceeded", "message": "line too long" } })
                    }
                    Err(e) => return Err(e),
                };
                sink.send(reply.to_string()).await?;
            }
            Some(note) = notify_rx.recv() => {
                sink.send(note).await?;
            }
        }
    }
    Ok(())
}

async fn handle_line(gateway: &Gateway, session: &mut Session, line: &str) -> Value {
    let started = Instant::now();
    let cmd = match sql::parse_sql(line) {
        Ok(cmd) => cmd,
        Err(e) => {
            metrics::counter!(observability::COMMANDS_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            return Failure::Parse(e).into_json();
        }
    };
    let label = observability::command_label(&cmd);
    let result = execute(gateway, session, cmd).await;
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => status).increment(1);
    metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => ok(data),
        Err(failure) => {
            tracing::debug!(command = label, kind = failure.kind(), "command failed");
            failure.into_json()
        }
    }
}

async fn execute(gateway: &Gateway, session: &mut Session, cmd: Command) -> Result<Value, Failure> {
    let engine = gateway.engine();

    if !matches!(cmd, Command::SetActor { .. }) {
        session.actor()?;
    }
    let actor = session.actor.clone().unwrap_or_default();

    match cmd {
        Command::SetActor { actor: next } => {
            let principal = engine
                .principal(&next)
                .ok_or_else(|| Failure::Session(format!("unknown principal {next:?}")))?;
            session.actor = Some(next);
            Ok(json!({ "actor": principal.id, "kind": principal.kind.as_str() }))
        }
        Command::InsertPrincipal { id, kind, role } => {
            gateway
                .register_principal(&actor, Principal { id: id.clone(), kind, role })
                .await?;
            Ok(json!({ "principal": id }))
        }
        Command::InsertResource {
            id,
            name,
            category,
            parent_id,
        } => Ok(json!(gateway.create_resource(&actor, id, name, category, parent_id).await?)),
        Command::DeleteResource { id } => Ok(json!(gateway.set_resource_active(&actor, id, false).await?)),
        Command::InsertActivation { resource_id } => {
            Ok(json!(gateway.set_resource_active(&actor, resource_id, true).await?))
        }
        Command::InsertReservations {
            segments,
            tenant,
            headcount,
            override_conflicts,
            group_id,
            payload,
        } => {
            let first = segments.iter().find(|s| s.resource_id.is_some()).cloned();
            let req = SubmitRequest {
                segments,
                group_id,
                tenant,
                headcount,
                payload,
                override_conflicts,
            };
            match gateway.submit_reservation(&actor, req).await {
                Ok(outcome) => Ok(json!(outcome)),
                Err(error) => Err(with_suggestions(gateway, error, first, headcount).await),
            }
        }
        Command::InsertTransition {
            reservation_id,
            status,
            resource_id,
            override_conflicts,
            reason,
        } => {
            let req = TransitionRequest {
                reservation_id,
                target: status,
                resource_id,
                override_conflicts,
                reason,
            };
            match gateway.transition_reservation(&actor, req).await {
                Ok(outcome) => Ok(json!(outcome)),
                Err(error) => {
                    let current = engine.get_reservation(&reservation_id);
                    let headcount = current.as_ref().map_or(0, |r| r.headcount);
                    let segment = current.map(|r| SegmentRequest {
                        id: Some(r.id),
                        resource_id: resource_id.or(r.resource_id).or(r.requested_resource),
                        start: r.span.start,
                        end: r.span.end,
                    });
                    Err(with_suggestions(gateway, error, segment, headcount).await)
                }
            }
        }
        Command::InsertAgent {
            id,
            version,
            tier,
            enabled,
            config,
        } => {
            let reg = AgentRegistration {
                agent_id: id,
                version,
                tier,
                enabled,
                config,
            };
            Ok(json!(gateway.register_agent(&actor, reg).await?))
        }
        Command::InsertCapacity { agent_id, tier } => {
            if agent_id != actor {
                return Err(Failure::Session(format!(
                    "{actor} may not acquire capacity on behalf of {agent_id}"
                )));
            }
            let handle = gateway.acquire_capacity(&agent_id, tier).await?;
            let borrowed = handle.borrowed();
            drop(handle);
            Ok(json!({ "tier": tier, "borrowed": borrowed, "pool": gateway.pool().stats() }))
        }
        Command::InsertProposal {
            id,
            reservation_id,
            components,
        } => {
            let id = gateway.propose_cost(&actor, id, reservation_id, components).await?;
            Ok(proposal_json(engine.get_proposal(&id)))
        }
        Command::InsertReview {
            proposal_id,
            approve,
            note,
        } => {
            let proposal = gateway.review_proposal(&actor, proposal_id, approve, note).await?;
            Ok(proposal_json(Some(proposal)))
        }
        Command::InsertInvoice { proposal_id } => {
            let proposal = gateway.invoice_proposal(&actor, proposal_id).await?;
            Ok(proposal_json(Some(proposal)))
        }
        Command::InsertAuditLog {
            operation,
            target,
            metadata,
            success,
            error,
            duration_ms,
        } => {
            let audit_id = gateway
                .log_action(&actor, operation, target, metadata, success, error, duration_ms)
                .await?;
            Ok(json!({ "audit_id": audit_id }))
        }
        Command::SelectResources => {
            let _slot = gateway.admit(&actor).await?;
            Ok(json!(engine.list_resources()))
        }
        Command::SelectReservations { filter } => {
            let _slot = gateway.admit(&actor).await?;
            Ok(json!(engine.list_reservations(&filter)))
        }
        Command::SelectUnresolved => {
            let _slot = gateway.admit(&actor).await?;
            Ok(json!(engine.unresolved_queue(MAX_UNRESOLVED_QUEUE)))
        }
        Command::SelectConflicts {
            resource_id,
            start,
            end,
            exclude,
        } => Ok(json!(
            gateway.validate(&actor, Some(resource_id), start, end, exclude).await?
        )),
        Command::SelectSuggestions {
            start,
            end,
            category,
            min_seats,
        } => {
            let _slot = gateway.admit(&actor).await?;
            Ok(json!(
                engine
                    .suggest_alternatives(start, end, category.as_deref(), min_seats, None)
                    .await?
            ))
        }
        Command::SelectPendingProposals { tier } => {
            let pending = gateway.list_pending_proposals(&actor, tier).await?;
            Ok(Value::Array(pending.into_iter().map(|p| proposal_json(Some(p))).collect()))
        }
        Command::SelectProposal { id } => {
            let _slot = gateway.admit(&actor).await?;
            let proposal = engine
                .get_proposal(&id)
                .ok_or_else(|| EngineError::NotFound(format!("proposal {id}")))?;
            Ok(proposal_json(Some(proposal)))
        }
        Command::SelectAuditLog { actor: by_actor, target } => {
            let _slot = gateway.admit(&actor).await?;
            let mut records = match (by_actor, target) {
                (Some(a), _) => engine.audit_by_actor(&a),
                (None, Some(t)) => engine.audit_by_target(&t),
                (None, None) => engine.audit_recent(RECENT_AUDIT_ROWS),
            };
            records.truncate(MAX_AUDIT_QUERY_ROWS);
            Ok(json!(records))
        }
        Command::SelectAgents => {
            let _slot = gateway.admit(&actor).await?;
            Ok(json!(engine.list_agents()))
        }
        Command::SelectPoolStats => Ok(json!(gateway.pool().stats())),
        Command::SelectOccupancy { start, end } => {
            let _slot = gateway.admit(&actor).await?;
            Ok(json!(engine.occupancy(start, end)?))
        }
        Command::Listen { channel } => {
            let resource_id = parse_channel(&channel)?;
            if engine.resource_info(&resource_id).is_none() {
                return Err(EngineError::NotFound(format!("resource {resource_id}")).into());
            }
            if !session.listeners.contains_key(&resource_id) {
                let task = spawn_forwarder(gateway, resource_id, channel.clone(), session.notify_tx.clone());
                session.listeners.insert(resource_id, task);
            }
            Ok(json!({ "listening": channel }))
        }
        Command::Unlisten { channel } => {
            let resource_id = parse_channel(&channel)?;
            let was_listening = session.unlisten(&resource_id);
            Ok(json!({ "unlistened": channel, "was_listening": was_listening }))
        }
        Command::UnlistenAll => {
            let count = session.listeners.len();
            let ids: Vec<Ulid> = session.listeners.keys().copied().collect();
            for id in ids {
                session.unlisten(&id);
            }
            Ok(json!({ "unlistened": count }))
        }
    }
}

/// Attach free alternatives to a conflict on a concrete resource.
async fn with_suggestions(
    gateway: &Gateway,
    error: EngineError,
    segment: Option<SegmentRequest>,
    headcount: u32,
) -> Failure {
    let suggestions = match (&error, segment) {
        (
            EngineError::Conflict(_),
            Some(SegmentRequest {
                resource_id: Some(rid),
                start,
                end,
                ..
            }),
        ) => gateway
            .alternatives_for(rid, start, end, headcount)
            .await
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    Failure::Engine { error, suggestions }
}

fn proposal_json(proposal: Option<CostProposal>) -> Value {
    match proposal {
        Some(p) => {
            let breakdown = p.breakdown();
            json!({ "proposal": p, "breakdown": breakdown })
        }
        None => Value::Null,
    }
}

fn parse_channel(channel: &str) -> Result<Ulid, Failure> {
    let id = channel.strip_prefix("resource_").ok_or_else(|| {
        Failure::Parse(SqlError::Parse(format!(
            "invalid channel: {channel} (expected resource_{{id}})"
        )))
    })?;
    Ulid::from_string(id)
        .map_err(|e| Failure::Parse(SqlError::Parse(format!("bad ULID in channel: {e}"))))
}

fn spawn_forwarder(
    gateway: &Gateway,
    resource_id: Ulid,
    channel: String,
    tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    let mut rx = gateway.engine().notify.subscribe(resource_id);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let line = json!({ "channel": channel, "event": event }).to_string();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(%resource_id, missed, "listener lagged, notifications dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
