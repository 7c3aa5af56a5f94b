use std::collections::BTreeMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::audit::{AuditOperation, AuditTarget};
use crate::cost::CostComponent;
use crate::engine::{ReservationFilter, SegmentRequest};
use crate::model::*;

/// Parsed command from one request line.
#[derive(Debug, PartialEq)]
pub enum Command {
    SetActor {
        actor: String,
    },
    InsertPrincipal {
        id: String,
        kind: ActorKind,
        role: Option<Role>,
    },
    InsertResource {
        id: Ulid,
        name: String,
        category: ResourceCategory,
        parent_id: Option<Ulid>,
    },
    /// Resources are never removed; this deactivates.
    DeleteResource {
        id: Ulid,
    },
    InsertActivation {
        resource_id: Ulid,
    },
    InsertReservations {
        segments: Vec<SegmentRequest>,
        tenant: String,
        headcount: u32,
        override_conflicts: bool,
        group_id: Option<Ulid>,
        payload: Option<String>,
    },
    InsertTransition {
        reservation_id: Ulid,
        status: ReservationStatus,
        resource_id: Option<Ulid>,
        override_conflicts: bool,
        reason: Option<String>,
    },
    InsertAgent {
        id: String,
        version: String,
        tier: Tier,
        enabled: bool,
        config: AgentConfig,
    },
    InsertCapacity {
        agent_id: String,
        tier: Tier,
    },
    InsertProposal {
        id: Option<Ulid>,
        reservation_id: Ulid,
        components: Vec<CostComponent>,
    },
    InsertReview {
        proposal_id: Ulid,
        approve: bool,
        note: Option<String>,
    },
    InsertInvoice {
        proposal_id: Ulid,
    },
    InsertAuditLog {
        operation: AuditOperation,
        target: AuditTarget,
        metadata: BTreeMap<String, String>,
        success: bool,
        error: Option<String>,
        duration_ms: Option<u64>,
    },
    SelectResources,
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectUnresolved,
    SelectConflicts {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    SelectSuggestions {
        start: Ms,
        end: Ms,
        category: Option<String>,
        min_seats: Option<u32>,
    },
    SelectPendingProposals {
        tier: Option<Tier>,
    },
    SelectProposal {
        id: Ulid,
    },
    SelectAuditLog {
        actor: Option<String>,
        target: Option<AuditTarget>,
    },
    SelectAgents,
    SelectPoolStats,
    SelectOccupancy {
        start: Ms,
        end: Ms,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN ") {
        return Ok(Command::Listen {
            channel: rest.trim().to_string(),
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN ") {
        let channel = rest.trim();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: channel.to_string(),
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "SET ") {
        return parse_set(rest.trim());
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let head = s.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword).then(|| &s[keyword.len()..])
}

/// `SET actor = 'id'` or `SET actor TO 'id'`.
fn parse_set(rest: &str) -> Result<Command, SqlError> {
    let (name, value) = rest
        .split_once('=')
        .or_else(|| {
            let lower = rest.to_ascii_lowercase();
            lower.find(" to ").map(|i| (&rest[..i], &rest[i + 4..]))
        })
        .ok_or_else(|| SqlError::Parse("expected SET name = value".into()))?;
    if !name.trim().eq_ignore_ascii_case("actor") {
        return Err(SqlError::Unsupported(format!("SET {}", name.trim())));
    }
    let actor = value.trim().trim_matches('\'').trim_matches('"').to_string();
    if actor.is_empty() {
        return Err(SqlError::Parse("empty actor".into()));
    }
    Ok(Command::SetActor { actor })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    let values = &rows[0];

    match table.as_str() {
        "principals" => {
            arity("principals", values, 2)?;
            let kind_str = parse_string(&values[1])?;
            let kind = ActorKind::parse(&kind_str)
                .ok_or_else(|| SqlError::Parse(format!("bad actor kind: {kind_str}")))?;
            let role = match values.get(2).map(parse_string_or_null).transpose()?.flatten() {
                Some(r) => Some(Role::parse(&r).ok_or_else(|| SqlError::Parse(format!("bad role: {r}")))?),
                None => None,
            };
            Ok(Command::InsertPrincipal {
                id: parse_string(&values[0])?,
                kind,
                role,
            })
        }
        "resources" => {
            arity("resources", values, 3)?;
            let category = match parse_string(&values[2])?.to_lowercase().as_str() {
                "room" => ResourceCategory::Room {
                    seats: match values.get(3) {
                        Some(v) => parse_u32(v)?,
                        None => 0,
                    },
                },
                "device" => ResourceCategory::Device {
                    device_type: values
                        .get(3)
                        .ok_or(SqlError::WrongArity("resources (device type)", 4, values.len()))
                        .and_then(parse_string)?,
                },
                other => return Err(SqlError::Parse(format!("unknown category: {other}"))),
            };
            Ok(Command::InsertResource {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                category,
                parent_id: optional(values, 4, parse_ulid_or_null)?.flatten(),
            })
        }
        "activations" => {
            arity("activations", values, 1)?;
            Ok(Command::InsertActivation {
                resource_id: parse_ulid(&values[0])?,
            })
        }
        "reservations" => parse_reservations(&rows),
        "transitions" => {
            arity("transitions", values, 2)?;
            let status_str = parse_string(&values[1])?;
            let status = ReservationStatus::parse(&status_str)
                .ok_or_else(|| SqlError::Parse(format!("bad status: {status_str}")))?;
            Ok(Command::InsertTransition {
                reservation_id: parse_ulid(&values[0])?,
                status,
                resource_id: optional(values, 2, parse_ulid_or_null)?.flatten(),
                override_conflicts: optional(values, 3, parse_bool)?.unwrap_or(false),
                reason: optional(values, 4, parse_string_or_null)?.flatten(),
            })
        }
        "agents" => {
            arity("agents", values, 5)?;
            let raw = parse_string(&values[4])?;
            let config = AgentConfig::from_json(&raw).map_err(SqlError::Parse)?;
            Ok(Command::InsertAgent {
                id: parse_string(&values[0])?,
                version: parse_string(&values[1])?,
                tier: parse_tier(&values[2])?,
                enabled: parse_bool(&values[3])?,
                config,
            })
        }
        "capacity" => {
            arity("capacity", values, 2)?;
            Ok(Command::InsertCapacity {
                agent_id: parse_string(&values[0])?,
                tier: parse_tier(&values[1])?,
            })
        }
        "proposals" => {
            arity("proposals", values, 3)?;
            let raw = parse_string(&values[2])?;
            Ok(Command::InsertProposal {
                id: parse_ulid_or_null(&values[0])?,
                reservation_id: parse_ulid(&values[1])?,
                components: CostComponent::list_from_json(&raw).map_err(SqlError::Parse)?,
            })
        }
        "reviews" => {
            arity("reviews", values, 2)?;
            let decision = parse_string(&values[1])?;
            let approve = match decision.to_lowercase().as_str() {
                "approve" | "approved" => true,
                "reject" | "rejected" => false,
                _ => return Err(SqlError::Parse(format!("bad decision: {decision}"))),
            };
            Ok(Command::InsertReview {
                proposal_id: parse_ulid(&values[0])?,
                approve,
                note: optional(values, 2, parse_string_or_null)?.flatten(),
            })
        }
        "invoices" => {
            arity("invoices", values, 1)?;
            Ok(Command::InsertInvoice {
                proposal_id: parse_ulid(&values[0])?,
            })
        }
        "audit_log" => {
            arity("audit_log", values, 2)?;
            let op = parse_string(&values[0])?;
            let operation = AuditOperation::parse_reported(&op)
                .ok_or_else(|| SqlError::Parse(format!("operation {op} cannot be reported")))?;
            let metadata = match optional(values, 2, parse_string_or_null)?.flatten() {
                Some(raw) => parse_metadata(&raw)?,
                None => BTreeMap::new(),
            };
            let duration_ms = match optional(values, 5, parse_i64_or_null)?.flatten() {
                Some(ms) => Some(
                    u64::try_from(ms).map_err(|_| SqlError::Parse(format!("bad duration: {ms}")))?,
                ),
                None => None,
            };
            Ok(Command::InsertAuditLog {
                operation,
                target: AuditTarget::parse(&parse_string(&values[1])?),
                metadata,
                success: optional(values, 3, parse_bool)?.unwrap_or(true),
                error: optional(values, 4, parse_string_or_null)?.flatten(),
                duration_ms,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Columns: `id, resource_id, start, "end", tenant, headcount, override_conflict,
/// group_id, payload`. Each row is one segment; the trailing columns describe
/// the whole reservation and must agree across rows.
fn parse_reservations(rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut segments = Vec::with_capacity(rows.len());
    let mut shared: Option<(String, u32, bool, Option<Ulid>, Option<String>)> = None;
    for (i, row) in rows.iter().enumerate() {
        let row_err = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        arity("reservations", row, 5)?;
        segments.push(SegmentRequest {
            id: parse_ulid_or_null(&row[0]).map_err(row_err)?,
            resource_id: parse_ulid_or_null(&row[1]).map_err(row_err)?,
            start: parse_i64(&row[2]).map_err(row_err)?,
            end: parse_i64(&row[3]).map_err(row_err)?,
        });
        let this = (
            parse_string(&row[4]).map_err(row_err)?,
            optional(row, 5, parse_u32).map_err(row_err)?.unwrap_or(1),
            optional(row, 6, parse_bool).map_err(row_err)?.unwrap_or(false),
            optional(row, 7, parse_ulid_or_null).map_err(row_err)?.flatten(),
            optional(row, 8, parse_string_or_null).map_err(row_err)?.flatten(),
        );
        match &shared {
            None => shared = Some(this),
            Some(first) if *first == this => {}
            Some(_) => {
                return Err(SqlError::Parse(format!(
                    "row {i}: tenant, headcount, override_conflict, group_id and payload must match row 0"
                )));
            }
        }
    }
    let (tenant, headcount, override_conflicts, group_id, payload) =
        shared.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::InsertReservations {
        segments,
        tenant,
        headcount,
        override_conflicts,
        group_id,
        payload,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let f = Filters(filters);

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "reservations" => Ok(Command::SelectReservations {
            filter: ReservationFilter {
                resource_id: f.eq("resource_id").map(parse_ulid).transpose()?,
                status: match f.eq("status").map(parse_string).transpose()? {
                    Some(s) => Some(
                        ReservationStatus::parse(&s)
                            .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                    ),
                    None => None,
                },
                group_id: f.eq("group_id").map(parse_ulid).transpose()?,
                tenant: f.eq("tenant").map(parse_string).transpose()?,
            },
        }),
        "unresolved" => Ok(Command::SelectUnresolved),
        "conflicts" => Ok(Command::SelectConflicts {
            resource_id: parse_ulid(f.eq("resource_id").ok_or(SqlError::MissingFilter("resource_id"))?)?,
            start: f.window_start()?,
            end: f.window_end()?,
            exclude: f.eq("exclude").map(parse_ulid).transpose()?,
        }),
        "suggestions" => Ok(Command::SelectSuggestions {
            start: f.window_start()?,
            end: f.window_end()?,
            category: f.eq("category").map(parse_string).transpose()?,
            min_seats: f.eq("min_seats").map(parse_u32).transpose()?,
        }),
        "pending_proposals" => Ok(Command::SelectPendingProposals {
            tier: f.eq("tier").map(parse_tier).transpose()?,
        }),
        "proposals" => Ok(Command::SelectProposal {
            id: parse_ulid(f.eq("id").ok_or(SqlError::MissingFilter("id"))?)?,
        }),
        "audit_log" => Ok(Command::SelectAuditLog {
            actor: f.eq("actor").map(parse_string).transpose()?,
            target: f
                .eq("target")
                .map(parse_string)
                .transpose()?
                .map(|t| AuditTarget::parse(&t)),
        }),
        "agents" => Ok(Command::SelectAgents),
        "pool_stats" => Ok(Command::SelectPoolStats),
        "occupancy" => Ok(Command::SelectOccupancy {
            start: f.window_start()?,
            end: f.window_end()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column <op> value` conjuncts of a WHERE clause.
struct Filters(Vec<(String, ast::BinaryOperator, Expr)>);

impl Filters {
    fn find(&self, column: &str, op: &ast::BinaryOperator) -> Option<&Expr> {
        self.0
            .iter()
            .find(|(c, o, _)| c == column && o == op)
            .map(|(_, _, e)| e)
    }

    fn eq(&self, column: &str) -> Option<&Expr> {
        self.find(column, &ast::BinaryOperator::Eq)
    }

    fn window_start(&self) -> Result<Ms, SqlError> {
        self.find("start", &ast::BinaryOperator::GtEq)
            .ok_or(SqlError::MissingFilter("start"))
            .and_then(parse_i64)
    }

    fn window_end(&self) -> Result<Ms, SqlError> {
        self.find("end", &ast::BinaryOperator::LtEq)
            .ok_or(SqlError::MissingFilter("end"))
            .and_then(parse_i64)
    }
}

fn collect_filters(expr: &Expr, out: &mut Vec<(String, ast::BinaryOperator, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)?;
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, op.clone(), right.as_ref().clone()));
        }
        Expr::Nested(inner) => collect_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

/// Parse the value at `idx` if the row has that many columns.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(idx).map(parse).transpose()
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_tier(expr: &Expr) -> Result<Tier, SqlError> {
    let s = parse_string(expr)?;
    Tier::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad tier: {s}")))
}

/// A JSON object whose values become strings (non-strings keep their JSON text).
fn parse_metadata(raw: &str) -> Result<BTreeMap<String, String>, SqlError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| SqlError::Parse(format!("metadata: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| SqlError::Parse("metadata must be a JSON object".into()))?;
    Ok(obj
        .iter()
        .map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect())
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
