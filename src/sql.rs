use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{parse_clock, BookingRequest, RecurrenceRule, SeriesMode};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProvider {
        id: Ulid,
        name: Option<String>,
        settings: ProviderSettings,
    },
    /// Unset fields keep their current value.
    UpdateProvider {
        id: Ulid,
        buffer_minutes: Option<u32>,
        auto_confirm: Option<bool>,
    },
    DeleteProvider {
        id: Ulid,
    },
    InsertService {
        id: Ulid,
        provider_id: Ulid,
        name: Option<String>,
        duration_minutes: u32,
        price_cents: i64,
        active: bool,
    },
    UpdateService {
        id: Ulid,
        duration_minutes: Option<u32>,
        price_cents: Option<i64>,
        active: Option<bool>,
    },
    UpsertDayRule {
        provider_id: Ulid,
        day: u8,
        rule: DayRule,
    },
    DeleteDayRule {
        provider_id: Ulid,
        day: u8,
    },
    InsertBlockedRange {
        id: Ulid,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
        label: Option<String>,
    },
    DeleteBlockedRange {
        id: Ulid,
    },
    InsertAppointment {
        request: BookingRequest,
        recurrence: Option<RecurrenceRule>,
        mode: SeriesMode,
    },
    UpdateAppointmentStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    RescheduleAppointment {
        id: Ulid,
        start: Ms,
    },
    DeleteAppointment {
        id: Ulid,
    },
    InsertGroupSession {
        id: Ulid,
        provider_id: Ulid,
        group_class_id: Ulid,
        start: Ms,
        end: Ms,
        max_participants: u32,
    },
    CancelGroupSession {
        id: Ulid,
    },
    InsertRegistration {
        id: Ulid,
        session_id: Ulid,
        client_id: Ulid,
    },
    UpdateRegistrationStatus {
        id: Ulid,
        status: RegistrationStatus,
    },
    SelectProviders,
    SelectServices {
        provider_id: Ulid,
    },
    SelectAppointments {
        provider_id: Ulid,
    },
    SelectBlockedRanges {
        provider_id: Ulid,
    },
    SelectDayRules {
        provider_id: Ulid,
    },
    SelectGroupSessions {
        provider_id: Ulid,
    },
    SelectRegistrations {
        session_id: Ulid,
    },
    SelectConflicts {
        provider_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    },
    SelectWorkingHours {
        provider_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectAvailability {
        provider_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectCalendar {
        provider_id: Ulid,
        start: Ms,
        end: Ms,
    },
    /// `LISTEN provider_<id>`.
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    /// `UNLISTEN *`.
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        return Ok(Command::Listen {
            channel: trimmed[7..].trim().to_string(),
        });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim();
        return Ok(if channel == "*" {
            Command::UnlistenAll
        } else {
            Command::Unlisten {
                channel: channel.to_string(),
            }
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by the INSERT column list.
struct Row<'a> {
    table: &'static str,
    cols: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.cols.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.require(col)?)
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.require(col)?)
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        parse_u32(self.require(col)?)
    }

    fn string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map_or(Ok(None), parse_string_or_null)
    }

    fn bool_or(&self, col: &str, default: bool) -> Result<bool, SqlError> {
        self.get(col).map_or(Ok(default), parse_bool)
    }

    fn u32_or(&self, col: &str, default: u32) -> Result<u32, SqlError> {
        match self.get(col) {
            Some(e) if !is_null(e) => parse_u32(e),
            _ => Ok(default),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let table = known_table(&table)?;
    let row = insert_row(insert, table)?;

    match table {
        "providers" => Ok(Command::InsertProvider {
            id: row.ulid("id")?,
            name: row.string("name")?,
            settings: ProviderSettings {
                buffer_minutes: row.u32_or("buffer_minutes", 0)?,
                auto_confirm: row.bool_or("auto_confirm", false)?,
            },
        }),
        "services" => Ok(Command::InsertService {
            id: row.ulid("id")?,
            provider_id: row.ulid("provider_id")?,
            name: row.string("name")?,
            duration_minutes: row.u32("duration_minutes")?,
            price_cents: match row.get("price_cents") {
                Some(e) if !is_null(e) => parse_i64_expr(e)?,
                _ => 0,
            },
            active: row.bool_or("active", true)?,
        }),
        "availability_rules" => Ok(Command::UpsertDayRule {
            provider_id: row.ulid("provider_id")?,
            day: parse_u8(row.require("day_of_week")?)?,
            rule: DayRule {
                start_minute: parse_clock_expr(row.require("start_time")?)?,
                end_minute: parse_clock_expr(row.require("end_time")?)?,
            },
        }),
        "blocked_ranges" => Ok(Command::InsertBlockedRange {
            id: row.ulid("id")?,
            provider_id: row.ulid("provider_id")?,
            start: row.i64("start")?,
            end: row.i64("end")?,
            label: row.string("label")?,
        }),
        "appointments" => {
            let recurrence = row
                .string("recurrence")?
                .map(|s| s.parse::<RecurrenceRule>())
                .transpose()
                .map_err(|e| SqlError::InvalidValue(e.to_string()))?;
            let mode = row
                .string("on_conflict")?
                .map(|s| s.parse::<SeriesMode>())
                .transpose()
                .map_err(|e| SqlError::InvalidValue(e.to_string()))?
                .unwrap_or_default();
            Ok(Command::InsertAppointment {
                request: BookingRequest {
                    id: row.ulid("id")?,
                    provider_id: row.ulid("provider_id")?,
                    client_id: row.ulid("client_id")?,
                    service_id: row.ulid("service_id")?,
                    start: row.i64("start")?,
                    notes: row.string("notes")?,
                },
                recurrence,
                mode,
            })
        }
        "group_sessions" => Ok(Command::InsertGroupSession {
            id: row.ulid("id")?,
            provider_id: row.ulid("provider_id")?,
            group_class_id: row.ulid("group_class_id")?,
            start: row.i64("start")?,
            end: row.i64("end")?,
            max_participants: row.u32("max_participants")?,
        }),
        "registrations" => Ok(Command::InsertRegistration {
            id: row.ulid("id")?,
            session_id: row.ulid("session_id")?,
            client_id: row.ulid("client_id")?,
        }),
        _ => Err(SqlError::Unsupported(format!("INSERT INTO {table}"))),
    }
}

fn insert_row<'a>(insert: &'a ast::Insert, table: &'static str) -> Result<Row<'a>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let [row] = values.as_slice() else {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    };
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    if insert.columns.len() != row.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), row.len()));
    }
    Ok(Row {
        table,
        cols: insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .zip(row.iter())
            .collect(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableWithJoins,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let table = known_table(&table)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((col, &a.value));
    }
    let take = |col: &str| set.iter().find(|(c, _)| c == col).map(|(_, e)| *e);
    let only = |allowed: &[&str]| -> Result<(), SqlError> {
        match set.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::Unsupported(format!("SET {c} on {table}"))),
            None => Ok(()),
        }
    };

    match table {
        "providers" => {
            only(&["buffer_minutes", "auto_confirm"])?;
            Ok(Command::UpdateProvider {
                id,
                buffer_minutes: take("buffer_minutes").map(parse_u32).transpose()?,
                auto_confirm: take("auto_confirm").map(parse_bool).transpose()?,
            })
        }
        "services" => {
            only(&["duration_minutes", "price_cents", "active"])?;
            Ok(Command::UpdateService {
                id,
                duration_minutes: take("duration_minutes").map(parse_u32).transpose()?,
                price_cents: take("price_cents").map(parse_i64_expr).transpose()?,
                active: take("active").map(parse_bool).transpose()?,
            })
        }
        "appointments" => {
            only(&["status", "start"])?;
            match (take("status"), take("start")) {
                (Some(status), None) => Ok(Command::UpdateAppointmentStatus {
                    id,
                    status: parse_status(status)?,
                }),
                (None, Some(start)) => Ok(Command::RescheduleAppointment {
                    id,
                    start: parse_i64_expr(start)?,
                }),
                _ => Err(SqlError::Unsupported(
                    "UPDATE appointments sets either status or start".into(),
                )),
            }
        }
        "group_sessions" => {
            only(&["status"])?;
            let status = take("status").ok_or(SqlError::MissingColumn("group_sessions", "status"))?;
            match parse_string(status)?.to_lowercase().as_str() {
                "cancelled" | "canceled" => Ok(Command::CancelGroupSession { id }),
                other => Err(SqlError::InvalidValue(format!(
                    "group sessions can only be cancelled, not set to {other}"
                ))),
            }
        }
        "registrations" => {
            only(&["status"])?;
            let status = take("status").ok_or(SqlError::MissingColumn("registrations", "status"))?;
            Ok(Command::UpdateRegistrationStatus {
                id,
                status: parse_status(status)?,
            })
        }
        _ => Err(SqlError::Unsupported(format!("UPDATE {table}"))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let table = known_table(&table)?;

    if table == "availability_rules" {
        let filters = Filters::from_selection(&delete.selection)?;
        return Ok(Command::DeleteDayRule {
            provider_id: filters.ulid("provider_id")?,
            day: parse_u8(filters.eq("day_of_week")?)?,
        });
    }

    let id = extract_where_id(&delete.selection)?;
    match table {
        "providers" => Ok(Command::DeleteProvider { id }),
        "blocked_ranges" => Ok(Command::DeleteBlockedRange { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let table = known_table(&table)?;
    let f = Filters::from_selection(&select.selection)?;

    match table {
        "providers" => Ok(Command::SelectProviders),
        "services" => Ok(Command::SelectServices {
            provider_id: f.ulid("provider_id")?,
        }),
        "appointments" => Ok(Command::SelectAppointments {
            provider_id: f.ulid("provider_id")?,
        }),
        "blocked_ranges" => Ok(Command::SelectBlockedRanges {
            provider_id: f.ulid("provider_id")?,
        }),
        "availability_rules" => Ok(Command::SelectDayRules {
            provider_id: f.ulid("provider_id")?,
        }),
        "group_sessions" => Ok(Command::SelectGroupSessions {
            provider_id: f.ulid("provider_id")?,
        }),
        "registrations" => Ok(Command::SelectRegistrations {
            session_id: f.ulid("session_id")?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            provider_id: f.ulid("provider_id")?,
            start: parse_i64_expr(f.eq("start")?)?,
            end: parse_i64_expr(f.eq("end")?)?,
            exclude_id: f.find(ast::BinaryOperator::Eq, "exclude_id").map(parse_ulid_expr).transpose()?,
        }),
        "working_hours" => Ok(Command::SelectWorkingHours {
            provider_id: f.ulid("provider_id")?,
            start: parse_i64_expr(f.eq("start")?)?,
            end: parse_i64_expr(f.eq("end")?)?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            provider_id: f.ulid("provider_id")?,
            start: f.window_start()?,
            end: f.window_end()?,
            min_duration: f
                .find(ast::BinaryOperator::Eq, "min_duration")
                .map(parse_i64_expr)
                .transpose()?,
        }),
        "calendar" => Ok(Command::SelectCalendar {
            provider_id: f.ulid("provider_id")?,
            start: f.window_start()?,
            end: f.window_end()?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

/// `column op value` comparisons from an AND chain.
struct Filters<'a>(Vec<(String, ast::BinaryOperator, &'a Expr)>);

impl<'a> Filters<'a> {
    fn from_selection(selection: &'a Option<Expr>) -> Result<Self, SqlError> {
        let mut out = Vec::new();
        if let Some(expr) = selection {
            collect_filters(expr, &mut out)?;
        }
        Ok(Self(out))
    }

    fn find(&self, op: ast::BinaryOperator, col: &str) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| *e)
    }

    fn eq(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.find(ast::BinaryOperator::Eq, col)
            .ok_or(SqlError::MissingFilter(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.eq(col)?)
    }

    fn window_start(&self) -> Result<Ms, SqlError> {
        let e = self
            .find(ast::BinaryOperator::GtEq, "start")
            .ok_or(SqlError::MissingFilter("start"))?;
        parse_i64_expr(e)
    }

    fn window_end(&self) -> Result<Ms, SqlError> {
        let e = self
            .find(ast::BinaryOperator::LtEq, "end")
            .ok_or(SqlError::MissingFilter("end"))?;
        parse_i64_expr(e)
    }
}

fn collect_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, ast::BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

const TABLES: &[&str] = &[
    "providers",
    "services",
    "availability_rules",
    "blocked_ranges",
    "appointments",
    "group_sessions",
    "registrations",
    "conflicts",
    "working_hours",
    "availability",
    "calendar",
];

fn known_table(name: &str) -> Result<&'static str, SqlError> {
    TABLES
        .iter()
        .find(|t| **t == name)
        .copied()
        .ok_or_else(|| SqlError::UnknownTable(name.to_string()))
}

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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// `'09:30'` or whole minutes since midnight.
fn parse_clock_expr(expr: &Expr) -> Result<u16, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            parse_clock(s).map_err(|e| SqlError::InvalidValue(e.to_string()))
        }
        _ => {
            let v = parse_i64_expr(expr)?;
            u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
        }
    }
}

fn parse_status<S>(expr: &Expr) -> Result<S, SqlError>
where
    S: std::str::FromStr,
    S::Err: std::fmt::Display,
{
    parse_string(expr)?
        .parse()
        .map_err(|e: S::Err| SqlError::InvalidValue(e.to_string()))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: {1} columns but {2} values")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the domain rejects.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
