use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "slotgate_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "slotgate_command_duration_seconds";

/// Counter: conflict checks that blocked an operation.
pub const CONFLICTS_DETECTED_TOTAL: &str = "slotgate_conflicts_detected_total";

/// Counter: binding writes that lost a race and were re-validated.
pub const COMMIT_RETRIES_TOTAL: &str = "slotgate_commit_retries_total";

/// Counter: audit records made durable.
pub const AUDIT_APPENDS_TOTAL: &str = "slotgate_audit_appends_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotgate_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotgate_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotgate_connections_rejected_total";

/// Gauge: pool slots in use. Labels: tier.
pub const POOL_IN_USE: &str = "slotgate_pool_in_use";

/// Counter: pool acquisitions refused. Labels: tier, reason.
pub const POOL_REJECTIONS_TOTAL: &str = "slotgate_pool_rejections_total";

/// Counter: agent acquisitions refused by the open circuit breaker.
pub const POOL_BREAKER_TRIPS_TOTAL: &str = "slotgate_pool_breaker_trips_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotgate_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotgate_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SetActor { .. } => "set_actor",
        Command::InsertPrincipal { .. } => "insert_principal",
        Command::InsertResource { .. } => "insert_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::InsertActivation { .. } => "insert_activation",
        Command::InsertReservations { .. } => "insert_reservations",
        Command::InsertTransition { .. } => "insert_transition",
        Command::InsertAgent { .. } => "insert_agent",
        Command::InsertCapacity { .. } => "insert_capacity",
        Command::InsertProposal { .. } => "insert_proposal",
        Command::InsertReview { .. } => "insert_review",
        Command::InsertInvoice { .. } => "insert_invoice",
        Command::InsertAuditLog { .. } => "insert_audit_log",
        Command::SelectResources => "select_resources",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectUnresolved => "select_unresolved",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectSuggestions { .. } => "select_suggestions",
        Command::SelectPendingProposals { .. } => "select_pending_proposals",
        Command::SelectProposal { .. } => "select_proposal",
        Command::SelectAuditLog { .. } => "select_audit_log",
        Command::SelectAgents => "select_agents",
        Command::SelectPoolStats => "select_pool_stats",
        Command::SelectOccupancy { .. } => "select_occupancy",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
