use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::SlotdAuthSource;
use crate::engine::{format_clock, Engine, EngineError, SeriesOutcome};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

const CHANNEL_PREFIX: &str = "provider_";

/// One handler per connection: it owns the connection's LISTEN subscriptions.
pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
    listeners: Mutex<HashMap<String, broadcast::Receiver<Event>>>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, deliver pending notifications, execute, record RED metrics.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.deliver_notifications(client).await?;

        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "invalid", "status" => "error")
                    .increment(1);
                debug!("rejected query {query:?}: {e}");
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// pgwire only writes to the client while answering a query, so events
    /// that arrived since the last statement go out ahead of its response.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut listeners = self.listeners.lock().await;
        let mut closed = Vec::new();
        for (channel, rx) in listeners.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(payload) => {
                            let note = NotificationResponse::new(0, channel.clone(), payload);
                            client
                                .send(PgWireBackendMessage::NotificationResponse(note))
                                .await?;
                        }
                        Err(e) => warn!("unserializable event on {channel}: {e}"),
                    },
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        warn!("listener on {channel} lagged, {skipped} events dropped");
                    }
                    Err(broadcast::error::TryRecvError::Empty) => break,
                    Err(broadcast::error::TryRecvError::Closed) => {
                        closed.push(channel.clone());
                        break;
                    }
                }
            }
        }
        for channel in closed {
            listeners.remove(&channel);
        }
        Ok(())
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            // ── Providers & services ─────────────────────────
            Command::InsertProvider { id, name, settings } => {
                engine
                    .create_provider(id, name, settings)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateProvider {
                id,
                buffer_minutes,
                auto_confirm,
            } => {
                let current = engine
                    .get_provider(&id)
                    .ok_or_else(|| engine_err(EngineError::not_found("provider", id)))?
                    .read()
                    .await
                    .settings;
                let settings = ProviderSettings {
                    buffer_minutes: buffer_minutes.unwrap_or(current.buffer_minutes),
                    auto_confirm: auto_confirm.unwrap_or(current.auto_confirm),
                };
                engine
                    .update_provider_settings(id, settings)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteProvider { id } => {
                engine.delete_provider(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertService {
                id,
                provider_id,
                name,
                duration_minutes,
                price_cents,
                active,
            } => {
                engine
                    .create_service(id, provider_id, name, duration_minutes, price_cents, active)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateService {
                id,
                duration_minutes,
                price_cents,
                active,
            } => {
                let current = engine.get_service(id).await.map_err(engine_err)?;
                engine
                    .update_service(
                        id,
                        duration_minutes.unwrap_or(current.duration_minutes),
                        price_cents.unwrap_or(current.price_cents),
                        active.unwrap_or(current.active),
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(updated(1))
            }

            // ── Weekly hours & blocked ranges ────────────────
            Command::UpsertDayRule {
                provider_id,
                day,
                rule,
            } => {
                engine
                    .set_day_rule(provider_id, day, rule)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteDayRule { provider_id, day } => {
                engine
                    .remove_day_rule(provider_id, day)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertBlockedRange {
                id,
                provider_id,
                start,
                end,
                label,
            } => {
                let span = Span::new(start, end).map_err(engine_err)?;
                engine
                    .add_blocked_range(id, provider_id, span, label)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteBlockedRange { id } => {
                engine.remove_blocked_range(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }

            // ── Appointments ─────────────────────────────────
            Command::InsertAppointment {
                request,
                recurrence: None,
                ..
            } => {
                engine.book_appointment(request).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertAppointment {
                request,
                recurrence: Some(rule),
                mode,
            } => {
                let outcome = engine
                    .book_series(request, rule, mode, &CancellationToken::new())
                    .await
                    .map_err(engine_err)?;
                Ok(series_response(outcome))
            }
            Command::UpdateAppointmentStatus { id, status } => {
                engine
                    .update_appointment_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::RescheduleAppointment { id, start } => {
                engine
                    .reschedule_appointment(id, start)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }

            // ── Group sessions ───────────────────────────────
            Command::InsertGroupSession {
                id,
                provider_id,
                group_class_id,
                start,
                end,
                max_participants,
            } => {
                let span = Span::new(start, end).map_err(engine_err)?;
                engine
                    .create_group_session(id, provider_id, group_class_id, span, max_participants)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CancelGroupSession { id } => {
                engine.cancel_group_session(id).await.map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::InsertRegistration {
                id,
                session_id,
                client_id,
            } => {
                engine
                    .register(id, session_id, client_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateRegistrationStatus { id, status } => {
                engine
                    .update_registration_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(1))
            }

            // ── Queries ──────────────────────────────────────
            Command::SelectProviders => {
                let providers = engine.list_providers().await;
                Ok(rows(select_schema("providers"), providers, |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.name)?;
                    enc.encode_field(&i64::from(p.buffer_minutes))?;
                    enc.encode_field(&p.auto_confirm)
                }))
            }
            Command::SelectServices { provider_id } => {
                let services = engine.list_services(provider_id).await.map_err(engine_err)?;
                Ok(rows(select_schema("services"), services, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.provider_id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&i64::from(s.duration_minutes))?;
                    enc.encode_field(&s.price_cents)?;
                    enc.encode_field(&s.active)
                }))
            }
            Command::SelectDayRules { provider_id } => {
                let rules = engine.list_day_rules(provider_id).await.map_err(engine_err)?;
                Ok(rows(select_schema("availability_rules"), rules, |enc, r| {
                    enc.encode_field(&r.provider_id.to_string())?;
                    enc.encode_field(&i64::from(r.day))?;
                    enc.encode_field(&format_clock(r.rule.start_minute))?;
                    enc.encode_field(&format_clock(r.rule.end_minute))
                }))
            }
            Command::SelectBlockedRanges { provider_id } => {
                let blocked = engine
                    .list_blocked_ranges(provider_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(select_schema("blocked_ranges"), blocked, |enc, b| {
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.provider_id.to_string())?;
                    enc.encode_field(&b.span.start)?;
                    enc.encode_field(&b.span.end)?;
                    enc.encode_field(&b.label)
                }))
            }
            Command::SelectAppointments { provider_id } => {
                let appointments = engine
                    .list_appointments(provider_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(select_schema("appointments"), appointments, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.provider_id.to_string())?;
                    enc.encode_field(&a.client_id.to_string())?;
                    enc.encode_field(&a.service_id.to_string())?;
                    enc.encode_field(&a.span.start)?;
                    enc.encode_field(&a.span.end)?;
                    enc.encode_field(&a.status.as_str().to_string())?;
                    enc.encode_field(&a.series_id.map(|id| id.to_string()))?;
                    enc.encode_field(&a.notes)
                }))
            }
            Command::SelectGroupSessions { provider_id } => {
                let sessions = engine
                    .list_group_sessions(provider_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(select_schema("group_sessions"), sessions, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.provider_id.to_string())?;
                    enc.encode_field(&s.group_class_id.to_string())?;
                    enc.encode_field(&s.span.start)?;
                    enc.encode_field(&s.span.end)?;
                    enc.encode_field(&i64::from(s.max_participants))?;
                    enc.encode_field(&i64::from(s.current_participants))?;
                    enc.encode_field(&i64::from(s.remaining_spots()))?;
                    enc.encode_field(&s.status.as_str().to_string())
                }))
            }
            Command::SelectRegistrations { session_id } => {
                let registrations = engine
                    .list_registrations(session_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(select_schema("registrations"), registrations, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.session_id.to_string())?;
                    enc.encode_field(&r.client_id.to_string())?;
                    enc.encode_field(&r.status.as_str().to_string())?;
                    enc.encode_field(&r.registered_at)
                }))
            }
            Command::SelectConflicts {
                provider_id,
                start,
                end,
                exclude_id,
            } => {
                let span = Span::new(start, end).map_err(engine_err)?;
                let conflict = engine
                    .check_conflict(provider_id, span, exclude_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(select_schema("conflicts"), conflict.into_iter().collect(), |enc, c| {
                    enc.encode_field(&c.kind.as_str().to_string())?;
                    enc.encode_field(&c.id.to_string())
                }))
            }
            Command::SelectWorkingHours {
                provider_id,
                start,
                end,
            } => {
                let span = Span::new(start, end).map_err(engine_err)?;
                let within = engine
                    .is_within_working_hours(provider_id, span)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(select_schema("working_hours"), vec![within], |enc, w| {
                    enc.encode_field(&w)
                }))
            }
            Command::SelectAvailability {
                provider_id,
                start,
                end,
                min_duration,
            } => {
                let window = Span::new(start, end).map_err(engine_err)?;
                let slots = engine
                    .compute_availability(provider_id, window, min_duration)
                    .await
                    .map_err(engine_err)?;
                let pid = provider_id.to_string();
                Ok(rows(select_schema("availability"), slots, |enc, slot| {
                    enc.encode_field(&pid)?;
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)
                }))
            }
            Command::SelectCalendar {
                provider_id,
                start,
                end,
            } => {
                let window = Span::new(start, end).map_err(engine_err)?;
                let entries = engine.calendar(provider_id, window).await.map_err(engine_err)?;
                Ok(rows(select_schema("calendar"), entries, |enc, e| {
                    enc.encode_field(&e.kind.as_str().to_string())?;
                    enc.encode_field(&e.id.to_string())?;
                    enc.encode_field(&e.span.start)?;
                    enc.encode_field(&e.span.end)?;
                    enc.encode_field(&e.status.to_string())?;
                    enc.encode_field(&calendar_details(&e))
                }))
            }

            // ── LISTEN / UNLISTEN ────────────────────────────
            Command::Listen { channel } => {
                let provider_id = parse_channel(&channel)?;
                let mut listeners = self.listeners.lock().await;
                if !listeners.contains_key(&channel) {
                    listeners.insert(channel, engine.notify.subscribe(provider_id));
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.listeners.lock().await.remove(&channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listeners.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix(CHANNEL_PREFIX).ok_or_else(|| {
        user_error(
            "42000",
            format!("invalid channel: {channel} (expected {CHANNEL_PREFIX}{{id}})"),
        )
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

fn calendar_details(entry: &CalendarEntry) -> String {
    let mut details = serde_json::Map::new();
    if let Some(client_id) = entry.client_id {
        details.insert("client_id".into(), client_id.to_string().into());
    }
    if let Some(service_id) = entry.service_id {
        details.insert("service_id".into(), service_id.to_string().into());
    }
    if let Some(label) = &entry.label {
        details.insert("label".into(), label.clone().into());
    }
    if let Some((current, max)) = entry.participants {
        details.insert("current_participants".into(), current.into());
        details.insert("max_participants".into(), max.into());
    }
    serde_json::Value::Object(details).to_string()
}

/// One row per candidate: booked instances first, then rejections.
fn series_response(outcome: SeriesOutcome) -> Response {
    let created = outcome.created.into_iter().map(|a| {
        (
            Some(a.id.to_string()),
            a.span.start,
            Some(a.span.end),
            Some(a.status.as_str().to_string()),
            "created".to_string(),
            None,
        )
    });
    let rejected = outcome
        .rejected
        .into_iter()
        .map(|r| {
            (
                None,
                r.candidate_start,
                None,
                None,
                "rejected".to_string(),
                Some(r.reason.to_string()),
            )
        });
    let mut all: Vec<_> = created.chain(rejected).collect();
    all.sort_by_key(|row| row.1);
    rows(series_schema(), all, |enc, (id, start, end, status, outcome, reason)| {
        enc.encode_field(&id)?;
        enc.encode_field(&start)?;
        enc.encode_field(&end)?;
        enc.encode_field(&status)?;
        enc.encode_field(&outcome)?;
        enc.encode_field(&reason)
    })
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    mut encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn inserted(n: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(n))
}

fn updated(n: usize) -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(n))
}

fn deleted(n: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(n))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn select_schema(table: &str) -> Vec<FieldInfo> {
    use Type as T;
    match table {
        "providers" => columns(&[
            ("id", T::VARCHAR),
            ("name", T::VARCHAR),
            ("buffer_minutes", T::INT8),
            ("auto_confirm", T::BOOL),
        ]),
        "services" => columns(&[
            ("id", T::VARCHAR),
            ("provider_id", T::VARCHAR),
            ("name", T::VARCHAR),
            ("duration_minutes", T::INT8),
            ("price_cents", T::INT8),
            ("active", T::BOOL),
        ]),
        "availability_rules" => columns(&[
            ("provider_id", T::VARCHAR),
            ("day_of_week", T::INT8),
            ("start_time", T::VARCHAR),
            ("end_time", T::VARCHAR),
        ]),
        "blocked_ranges" => columns(&[
            ("id", T::VARCHAR),
            ("provider_id", T::VARCHAR),
            ("start", T::INT8),
            ("end", T::INT8),
            ("label", T::VARCHAR),
        ]),
        "appointments" => columns(&[
            ("id", T::VARCHAR),
            ("provider_id", T::VARCHAR),
            ("client_id", T::VARCHAR),
            ("service_id", T::VARCHAR),
            ("start", T::INT8),
            ("end", T::INT8),
            ("status", T::VARCHAR),
            ("series_id", T::VARCHAR),
            ("notes", T::VARCHAR),
        ]),
        "group_sessions" => columns(&[
            ("id", T::VARCHAR),
            ("provider_id", T::VARCHAR),
            ("group_class_id", T::VARCHAR),
            ("start", T::INT8),
            ("end", T::INT8),
            ("max_participants", T::INT8),
            ("current_participants", T::INT8),
            ("remaining_spots", T::INT8),
            ("status", T::VARCHAR),
        ]),
        "registrations" => columns(&[
            ("id", T::VARCHAR),
            ("session_id", T::VARCHAR),
            ("client_id", T::VARCHAR),
            ("status", T::VARCHAR),
            ("registered_at", T::INT8),
        ]),
        "conflicts" => columns(&[("kind", T::VARCHAR), ("id", T::VARCHAR)]),
        "working_hours" => columns(&[("within", T::BOOL)]),
        "availability" => columns(&[
            ("provider_id", T::VARCHAR),
            ("start", T::INT8),
            ("end", T::INT8),
        ]),
        "calendar" => columns(&[
            ("kind", T::VARCHAR),
            ("id", T::VARCHAR),
            ("start", T::INT8),
            ("end", T::INT8),
            ("status", T::VARCHAR),
            ("details", T::VARCHAR),
        ]),
        _ => vec![],
    }
}

fn columns(cols: &[(&str, Type)]) -> Vec<FieldInfo> {
    cols.iter().map(|(name, ty)| field(name, ty.clone())).collect()
}

fn series_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("outcome", Type::VARCHAR),
        field("reason", Type::VARCHAR),
    ]
}

/// Row shape a statement will produce, inferred from its text so that
/// `Describe` works before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ',' | ';' | '"'))
        .filter(|w| !w.is_empty())
        .collect();
    match words.first().copied() {
        Some("select") => words
            .iter()
            .position(|w| *w == "from")
            .and_then(|i| words.get(i + 1))
            .map(|table| select_schema(table))
            .unwrap_or_default(),
        Some("insert") if words.get(2) == Some(&"appointments") && words.contains(&"recurrence") => {
            series_schema()
        }
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, user: String, password: String) -> Self {
        let auth_source = SlotdAuthSource::new(user, password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes. Each connection gets its
/// own handler, and with it its own LISTEN set.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    user: String,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotdFactory::new(tenant_manager, user, password);
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound { .. } => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::CapacityExceeded { .. } => "23514",
        EngineError::StateTransition { .. } | EngineError::NotDeletable { .. } => "55000",
        EngineError::HasDependents(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Unavailable(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::InvalidValue(_) => "22023",
        SqlError::UnknownTable(_) => "42P01",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_index() {
        assert_eq!(count_params("SELECT * FROM providers"), 0);
        assert_eq!(
            count_params("UPDATE appointments SET start = $2 WHERE id = $1"),
            2
        );
        assert_eq!(count_params("VALUES ($1, $10, $3)"), 10);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let params: Vec<Option<&[u8]>> = vec![Some(b"O'Brien"), None, Some(b"42")];
        assert_eq!(
            substitute("VALUES ($1, $2, $3)", &params),
            "VALUES ('O''Brien', NULL, '42')"
        );
    }

    #[test]
    fn substitute_does_not_clobber_two_digit_placeholders() {
        let params: Vec<_> = (1..=10)
            .map(|i| Some(i.to_string().into_bytes()))
            .collect();
        assert_eq!(substitute("$1 $10", &params), "'1' '10'");
    }

    #[test]
    fn result_schema_follows_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names(r#"SELECT * FROM availability WHERE provider_id = $1 AND start >= $2 AND "end" <= $3"#),
            vec!["provider_id", "start", "end"]
        );
        assert_eq!(names("select * from conflicts where provider_id = $1"), vec!["kind", "id"]);
        assert_eq!(
            names("INSERT INTO appointments (id, provider_id, client_id, service_id, start, recurrence) VALUES ($1, $2, $3, $4, $5, $6)"),
            vec!["id", "start", "end", "status", "outcome", "reason"]
        );
        assert!(names("INSERT INTO appointments (id) VALUES ($1)").is_empty());
        assert!(names("DELETE FROM providers WHERE id = $1").is_empty());
    }

    #[test]
    fn channel_names_carry_provider_id() {
        let pid = Ulid::new();
        assert_eq!(parse_channel(&format!("provider_{pid}")).unwrap(), pid);
        assert!(parse_channel(&format!("resource_{pid}")).is_err());
        assert!(parse_channel("provider_nope").is_err());
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let id = Ulid::new();
        let conflict = EngineError::Conflict(EntityRef {
            kind: EntityKind::Appointment,
            id,
        });
        assert_eq!(sqlstate(&conflict), "23P01");
        assert_eq!(
            sqlstate(&EngineError::CapacityExceeded { session_id: id, max: 3 }),
            "23514"
        );
        assert_eq!(sqlstate(&EngineError::NotFound { entity: "provider", id }), "P0002");
        assert_eq!(sqlstate(&EngineError::Validation("x".into())), "22023");
        assert_eq!(sqlstate(&EngineError::Unavailable("disk".into())), "58000");
    }

    #[test]
    fn calendar_details_is_json_object() {
        let entry = CalendarEntry {
            kind: EntityKind::GroupSession,
            id: Ulid::new(),
            span: Span::new(0, 1).unwrap(),
            status: "scheduled",
            client_id: None,
            service_id: None,
            label: None,
            participants: Some((2, 5)),
        };
        let value: serde_json::Value = serde_json::from_str(&calendar_details(&entry)).unwrap();
        assert_eq!(value["current_participants"], 2);
        assert_eq!(value["max_participants"], 5);
    }
}
