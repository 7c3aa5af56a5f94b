mod agents;
mod approval;
mod conflict;
mod error;
mod queries;
mod reservations;
mod resources;
#[cfg(test)]
mod tests;

pub use agents::AgentRegistration;
pub use conflict::{now_ms, validate_span, Verdict};
pub use error::EngineError;
pub use queries::ReservationFilter;
pub use reservations::{
    SegmentOutcome, SegmentRequest, SubmitOutcome, SubmitRequest, TransitionOutcome,
    TransitionRequest,
};

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::audit::{AuditDraft, AuditLog};
use crate::cost::{CostProposal, ProposalStatus};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Write guards held by one transaction, keyed (and therefore acquired) in resource-id order.
pub(crate) type Guards = BTreeMap<Ulid, OwnedRwLockWriteGuard<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        txn: Txn,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Txn>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Txn, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { txn, response } => {
                let mut batch = vec![(txn, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { txn, response }) => batch.push((txn, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (txn, _) in batch {
        if let Err(e) = wal.append_buffered(txn) {
            append_err = Some(e);
            break;
        }
    }
    let result = match append_err {
        Some(e) => Err(e),
        None => wal.flush_sync(),
    };
    // Every caller in the batch is told it failed, so none of it may survive on disk.
    if result.is_err()
        && let Err(e) = wal.discard_unsynced()
    {
        tracing::error!("WAL rollback after failed batch also failed: {e}");
    }
    result
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { txn, response } => {
            let batch = vec![(txn, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

pub struct Engine {
    /// Per-resource state with its binding index. The write lock is the
    /// storage-level mutual-exclusion constraint.
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    /// Lock-free copy of resource metadata for listings and snapshots.
    pub(super) catalog: DashMap<Ulid, ResourceInfo>,
    pub(super) children: DashMap<Ulid, Vec<Ulid>>,
    pub(super) reservations: DashMap<Ulid, Reservation>,
    pub(super) principals: DashMap<String, Principal>,
    pub(super) agents: DashMap<String, AgentQuota>,
    pub(super) proposals: DashMap<Ulid, CostProposal>,
    pub(super) audit: AuditLog,
    /// Serialises transitions on one reservation or proposal, and creation of one resource.
    row_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Serialises registration and reconfiguration of one principal or agent id.
    principal_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Commits hold it shared across WAL append + apply; compaction takes it exclusively.
    commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) tax_rate_bps: u32,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, tax_rate_bps: u32) -> io::Result<Self> {
        let txns = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            catalog: DashMap::new(),
            children: DashMap::new(),
            reservations: DashMap::new(),
            principals: DashMap::new(),
            agents: DashMap::new(),
            proposals: DashMap::new(),
            audit: AuditLog::new(),
            row_locks: DashMap::new(),
            principal_locks: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
            tax_rate_bps,
        };
        let system = Principal::system();
        engine.principals.insert(system.id.clone(), system);

        // Sole owner of every lock during replay: `apply_event` falls back to
        // uncontended try_write, never a blocking acquire.
        let mut guards = Guards::new();
        for txn in &txns {
            for event in &txn.events {
                engine.apply_event(event, &mut guards);
            }
        }
        if !txns.is_empty() {
            tracing::info!(
                "replayed {} transactions: {} resources, {} reservations, {} audit records",
                txns.len(),
                engine.resources.len(),
                engine.reservations.len(),
                engine.audit.len()
            );
        }

        Ok(engine)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Write a transaction to the WAL via the background group-commit writer.
    async fn wal_append(&self, txn: &Txn) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                txn: txn.clone(),
                response: tx,
            })
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("WAL writer dropped response"))?
    }

    /// Finalise the audit record, make `events` + record durable as one WAL entry,
    /// then apply them in memory and notify listeners.
    ///
    /// Callers hold the write guards of every resource whose binding index the
    /// events touch. Nothing is applied unless the WAL write succeeded.
    pub(super) async fn commit(
        &self,
        mut events: Vec<Event>,
        draft: AuditDraft,
        guards: &mut Guards,
    ) -> Result<Ulid, EngineError> {
        let record = draft
            .finish(Ulid::new(), now_ms())
            .map_err(|e| EngineError::AuditWriteFailure(e.to_string()))?;
        let audit_id = record.id;
        events.push(Event::Audited { record });
        let txn = Txn::new(events);

        {
            let _gate = self.commit_gate.read().await;
            self.wal_append(&txn).await.map_err(|e| {
                tracing::error!("durable write failed, transaction discarded: {e}");
                EngineError::AuditWriteFailure(format!("durable write failed: {e}"))
            })?;
            for event in &txn.events {
                self.apply_event(event, guards);
            }
        }
        metrics::counter!(crate::observability::AUDIT_APPENDS_TOTAL).increment(1);

        for event in &txn.events {
            if let Some(rid) = notify_target(event) {
                self.notify.send(rid, event);
            }
        }
        Ok(audit_id)
    }

    /// Apply one event to in-memory state. Shared by commit and replay.
    fn apply_event(&self, event: &Event, guards: &mut Guards) {
        match event {
            Event::PrincipalRegistered { principal } => {
                self.principals.insert(principal.id.clone(), principal.clone());
            }
            Event::ResourceCreated {
                id,
                name,
                category,
                parent_id,
            } => {
                // Never replaces live state: the binding index would be lost.
                let Entry::Vacant(slot) = self.resources.entry(*id) else {
                    tracing::warn!(%id, "duplicate resource creation ignored");
                    return;
                };
                let rs = ResourceState::new(*id, name.clone(), category.clone(), *parent_id);
                self.catalog.insert(*id, rs.info());
                slot.insert(Arc::new(RwLock::new(rs)));
                if let Some(pid) = parent_id {
                    self.children.entry(*pid).or_default().push(*id);
                }
            }
            Event::ResourceActiveSet { id, active } => {
                self.with_resource(*id, guards, |rs| rs.active = *active);
                if let Some(mut info) = self.catalog.get_mut(id) {
                    info.active = *active;
                }
            }
            Event::ReservationCreated { reservation } => {
                if reservation.status.is_binding()
                    && let Some(rid) = reservation.resource_id
                {
                    let interval = Interval {
                        reservation_id: reservation.id,
                        span: reservation.span,
                    };
                    self.with_resource(rid, guards, |rs| rs.insert_interval(interval));
                }
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationAssigned { id, resource_id, at } => {
                let span = match self.reservations.get_mut(id) {
                    Some(mut r) => {
                        r.status = ReservationStatus::ResourceAssigned;
                        r.resource_id = Some(*resource_id);
                        r.updated_at = *at;
                        r.span
                    }
                    None => return,
                };
                let interval = Interval {
                    reservation_id: *id,
                    span,
                };
                self.with_resource(*resource_id, guards, |rs| rs.insert_interval(interval));
            }
            Event::ReservationConfirmed { id, at, .. } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::Confirmed;
                    r.updated_at = *at;
                }
            }
            Event::ReservationCancelled { id, resource_id, at } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::Cancelled;
                    r.updated_at = *at;
                }
                if let Some(rid) = resource_id {
                    self.with_resource(*rid, guards, |rs| {
                        rs.remove_interval(*id);
                    });
                }
            }
            Event::AgentRegistered { quota } => {
                self.agents.insert(quota.agent_id.clone(), quota.clone());
            }
            Event::ProposalCreated { proposal } => {
                self.proposals.insert(proposal.id, proposal.clone());
            }
            Event::ProposalReviewed {
                id,
                approved,
                reviewer,
                note,
                at,
            } => {
                if let Some(mut p) = self.proposals.get_mut(id) {
                    p.status = if *approved {
                        ProposalStatus::Approved
                    } else {
                        ProposalStatus::Rejected
                    };
                    p.reviewed_by = Some(reviewer.clone());
                    p.reviewed_at = Some(*at);
                    p.review_note = note.clone();
                }
            }
            Event::ProposalInvoiced { id, by, at } => {
                if let Some(mut p) = self.proposals.get_mut(id) {
                    p.status = ProposalStatus::Invoiced;
                    p.invoiced_by = Some(by.clone());
                    p.invoiced_at = Some(*at);
                }
            }
            Event::Audited { record } => self.audit.append(record.clone()),
        }
    }

    fn with_resource(&self, id: Ulid, guards: &mut Guards, f: impl FnOnce(&mut ResourceState)) {
        if let Some(guard) = guards.get_mut(&id) {
            f(guard);
            return;
        }
        let Some(rs) = self.get_resource(&id) else {
            tracing::warn!(%id, "event references unknown resource");
            return;
        };
        match rs.try_write() {
            Ok(mut guard) => f(&mut guard),
            Err(_) => tracing::error!(%id, "resource locked by another writer; event not applied in memory"),
        }
    }

    /// Acquire write guards for `ids` in sorted order (deadlock-free).
    pub(super) async fn lock_resources(
        &self,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<Guards, EngineError> {
        let sorted: std::collections::BTreeSet<Ulid> = ids.into_iter().collect();
        let mut guards = Guards::new();
        for id in sorted {
            let rs = self
                .get_resource(&id)
                .ok_or_else(|| EngineError::not_found("resource", id))?;
            guards.insert(id, rs.write_owned().await);
        }
        Ok(guards)
    }

    /// Per-row mutex for reservations and proposals. Taken before any resource lock.
    pub(super) async fn lock_row(&self, id: Ulid) -> OwnedMutexGuard<()> {
        let row = self.row_locks.entry(id).or_default().clone();
        row.lock_owned().await
    }

    /// Per-id mutex for principals and agents, which share one namespace.
    pub(super) async fn lock_principal(&self, id: &str) -> OwnedMutexGuard<()> {
        let row = self.principal_locks.entry(id.to_string()).or_default().clone();
        row.lock_owned().await
    }

    /// Drop lock entries nobody holds or waits on. Lookups clone the `Arc`
    /// under the same shard lock `retain` takes, so a count of one is final.
    pub fn prune_locks(&self) {
        self.row_locks.retain(|_, row| Arc::strong_count(row) > 1);
        self.principal_locks.retain(|_, row| Arc::strong_count(row) > 1);
    }

    /// Compact the WAL: rewrite it as a snapshot of the current state.
    /// Audit history is carried over in full.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let snapshot = self.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::AuditWriteFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::AuditWriteFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::AuditWriteFailure(format!("compaction failed: {e}")))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Minimal transactions that recreate the current state. Reads only the
    /// lock-free tables, so it never waits on a resource lock.
    fn snapshot(&self) -> Vec<Txn> {
        let mut out = Vec::new();

        let principals: Vec<Event> = self
            .principals
            .iter()
            .filter(|p| p.kind != ActorKind::System)
            .map(|p| Event::PrincipalRegistered {
                principal: p.value().clone(),
            })
            .collect();
        if !principals.is_empty() {
            out.push(Txn::new(principals));
        }

        // Parents before children.
        let mut emitted = HashSet::new();
        let mut resources = Vec::new();
        let ids: Vec<Ulid> = self.catalog.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.emit_resource(id, &mut emitted, &mut resources);
        }
        if !resources.is_empty() {
            out.push(Txn::new(resources));
        }

        let agents: Vec<Event> = self
            .agents
            .iter()
            .map(|a| Event::AgentRegistered {
                quota: a.value().clone(),
            })
            .collect();
        if !agents.is_empty() {
            out.push(Txn::new(agents));
        }

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|r| r.value().clone()).collect();
        reservations.sort_by_key(|r| (r.created_at, r.id));
        for chunk in reservations.chunks(SNAPSHOT_CHUNK) {
            out.push(Txn::new(
                chunk
                    .iter()
                    .map(|r| Event::ReservationCreated {
                        reservation: r.clone(),
                    })
                    .collect(),
            ));
        }

        let mut proposals: Vec<CostProposal> =
            self.proposals.iter().map(|p| p.value().clone()).collect();
        proposals.sort_by_key(|p| (p.proposed_at, p.id));
        for chunk in proposals.chunks(SNAPSHOT_CHUNK) {
            out.push(Txn::new(
                chunk
                    .iter()
                    .map(|p| Event::ProposalCreated {
                        proposal: p.clone(),
                    })
                    .collect(),
            ));
        }

        for chunk in self.audit.snapshot().chunks(SNAPSHOT_CHUNK) {
            out.push(Txn::new(
                chunk
                    .iter()
                    .map(|record| Event::Audited {
                        record: record.clone(),
                    })
                    .collect(),
            ));
        }

        out
    }

    fn emit_resource(&self, id: Ulid, emitted: &mut HashSet<Ulid>, out: &mut Vec<Event>) {
        if !emitted.insert(id) {
            return;
        }
        let Some(info) = self.catalog.get(&id).map(|e| e.value().clone()) else {
            return;
        };
        if let Some(pid) = info.parent_id {
            self.emit_resource(pid, emitted, out);
        }
        out.push(Event::ResourceCreated {
            id: info.id,
            name: info.name,
            category: info.category,
            parent_id: info.parent_id,
        });
        if !info.active {
            out.push(Event::ResourceActiveSet { id, active: false });
        }
    }
}

const SNAPSHOT_CHUNK: usize = 512;

/// Resource channel an event is published on.
fn notify_target(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { reservation } => {
            reservation.resource_id.or(reservation.requested_resource)
        }
        Event::ReservationAssigned { .. }
        | Event::ReservationConfirmed { .. }
        | Event::ReservationCancelled { .. } => event.bound_resource(),
        _ => None,
    }
}
