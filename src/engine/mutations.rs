use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{validate_day_rule, within_working_hours};
use super::conflict::{check_batch_conflict, check_interval_room, check_no_conflict, now_ms, validate_span};
use super::lifecycle::{initial_appointment_status, next_appointment_status, AppointmentAction};
use super::{Engine, EngineError, RecurrenceRule, WalCommand};

/// A single booking request; the service's duration fixes the end time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub client_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    pub notes: Option<String>,
}

/// What to do when a series instance cannot be booked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeriesMode {
    /// Book every instance that fits and report the rest.
    #[default]
    SkipAndReport,
    /// Stop at the first rejected instance; earlier instances stay booked.
    StopOnFirst,
    /// Book every instance or none of them.
    AllOrNothing,
}

impl std::str::FromStr for SeriesMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" | "skip_and_report" => Ok(Self::SkipAndReport),
            "stop" | "stop_on_first" => Ok(Self::StopOnFirst),
            "all_or_nothing" | "atomic" => Ok(Self::AllOrNothing),
            other => Err(EngineError::Validation(format!(
                "unknown conflict mode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedInstance {
    pub candidate_start: Ms,
    pub reason: EngineError,
}

/// Per-instance result of a recurring booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesOutcome {
    pub series_id: Ulid,
    pub created: Vec<Appointment>,
    pub rejected: Vec<RejectedInstance>,
    /// Expansion ended before the rule was exhausted (cancelled or stop-on-first).
    pub stopped_early: bool,
}

fn check_name(name: &Option<String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn validate_settings(settings: &ProviderSettings) -> Result<(), EngineError> {
    if settings.buffer_minutes > MAX_BUFFER_MINUTES {
        return Err(EngineError::Validation(format!(
            "buffer_minutes must be 0-{MAX_BUFFER_MINUTES}, got {}",
            settings.buffer_minutes
        )));
    }
    Ok(())
}

fn validate_service(duration_minutes: u32, price_cents: i64) -> Result<(), EngineError> {
    if duration_minutes == 0 || duration_minutes > MAX_SERVICE_DURATION_MINUTES {
        return Err(EngineError::Validation(format!(
            "duration_minutes must be 1-{MAX_SERVICE_DURATION_MINUTES}, got {duration_minutes}"
        )));
    }
    if price_cents < 0 {
        return Err(EngineError::Validation("price_cents must not be negative".into()));
    }
    Ok(())
}

/// The bookable service and the interval it occupies from `start`.
fn service_span(ps: &ProviderState, service_id: Ulid, start: Ms) -> Result<Span, EngineError> {
    let service = ps
        .services
        .get(&service_id)
        .ok_or_else(|| EngineError::not_found("service", service_id))?;
    if !service.active {
        return Err(EngineError::Validation(format!("service {service_id} is inactive")));
    }
    let span = Span::starting_at(start, service.duration_ms())?;
    validate_span(&span)?;
    Ok(span)
}

impl Engine {
    // ── Providers ────────────────────────────────────────────

    pub async fn create_provider(
        &self,
        id: Ulid,
        name: Option<String>,
        settings: ProviderSettings,
    ) -> Result<(), EngineError> {
        check_name(&name, MAX_NAME_LEN, "provider name too long")?;
        validate_settings(&settings)?;
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if self.store.provider_count() >= MAX_PROVIDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        if self.store.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let at = now_ms();
        let event = Event::ProviderCreated {
            id,
            name: name.clone(),
            settings,
            at,
        };
        self.wal_append(&event).await?;
        self.store.insert_provider(ProviderState::new(id, name, settings, at));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Takes effect for future checks; existing commitments are not re-validated.
    pub async fn update_provider_settings(
        &self,
        id: Ulid,
        settings: ProviderSettings,
    ) -> Result<(), EngineError> {
        validate_settings(&settings)?;
        let _gate = self.commit_gate.read().await;
        let mut ps = self.provider_write(id).await?;
        let event = Event::ProviderSettingsUpdated {
            id,
            settings,
            at: now_ms(),
        };
        self.persist_and_apply(&mut ps, &event).await
    }

    pub async fn delete_provider(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        let ps = self.provider_write(id).await?;
        if ps.has_dependents() {
            return Err(EngineError::HasDependents(id));
        }

        let event = Event::ProviderDeleted { id };
        self.wal_append(&event).await?;
        self.store.remove_provider(&ps);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Services ─────────────────────────────────────────────

    pub async fn create_service(
        &self,
        id: Ulid,
        provider_id: Ulid,
        name: Option<String>,
        duration_minutes: u32,
        price_cents: i64,
        active: bool,
    ) -> Result<(), EngineError> {
        check_name(&name, MAX_NAME_LEN, "service name too long")?;
        validate_service(duration_minutes, price_cents)?;
        let _gate = self.commit_gate.read().await;
        let mut ps = self.provider_write(provider_id).await?;
        if self.store.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::ServiceCreated {
            id,
            provider_id,
            name,
            duration_minutes,
            price_cents,
            active,
            at: now_ms(),
        };
        self.persist_and_apply(&mut ps, &event).await
    }

    /// Existing appointments keep the interval they were booked with.
    pub async fn update_service(
        &self,
        id: Ulid,
        duration_minutes: u32,
        price_cents: i64,
        active: bool,
    ) -> Result<(), EngineError> {
        validate_service(duration_minutes, price_cents)?;
        let _gate = self.commit_gate.read().await;
        let mut ps = self.resolve_entity_write("service", id).await?;
        if !ps.services.contains_key(&id) {
            return Err(EngineError::not_found("service", id));
        }
        let event = Event::ServiceUpdated {
            id,
            provider_id: ps.id,
            duration_minutes,
            price_cents,
            active,
            at: now_ms(),
        };
        self.persist_and_apply(&mut ps, &event).await
    }

    // ── Weekly hours ─────────────────────────────────────────

    /// Replaces any existing rule for that day.
    pub async fn set_day_rule(&self, provider_id: Ulid, day: u8, rule: DayRule) -> Result<(), EngineError> {
        validate_day_rule(day, &rule)?;
        let _gate = self.commit_gate.read().await;
        let mut ps = self.provider_write(provider_id).await?;
        let event = Event::DayRuleSet {
            provider_id,
            day,
            rule,
        };
        self.persist_and_apply(&mut ps, &event).await
    }

    /// Marks the day closed. Removing a rule that does not exist is not an error.
    pub async fn remove_day_rule(&self, provider_id: Ulid, day: u8) -> Result<(), EngineError> {
        if day > 6 {
            return Err(EngineError::Validation(format!(
                "day_of_week must be 0-6, got {day}"
            )));
        }
        let _gate = self.commit_gate.read().await;
        let mut ps = self.provider_write(provider_id).await?;
        if ps.hours.get(day).is_none() {
            return Ok(());
        }
        let event = Event::DayRuleRemoved { provider_id, day };
        self.persist_and_apply(&mut ps, &event).await
    }

    // ── Blocked ranges ───────────────────────────────────────

    pub async fn add_blocked_range(
        &self,
        id: Ulid,
        provider_id: Ulid,
        span: Span,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        check_name(&label, MAX_LABEL_LEN, "label too long")?;
        let _gate = self.commit_gate.read().await;
        let mut ps = self.provider_write(provider_id).await?;
        if self.store.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        check_interval_room(&ps)?;
        check_no_conflict(&ps, &span, None)?;

        let event = Event::BlockedRangeAdded {
            id,
            provider_id,
            span,
            label,
            at: now_ms(),
        };
        self.persist_and_apply(&mut ps, &event).await
    }

    pub async fn remove_blocked_range(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut ps = self.resolve_entity_write("blocked range", id).await?;
        if !ps.blocked.contains_key(&id) {
            return Err(EngineError::not_found("blocked range", id));
        }
        let provider_id = ps.id;
        let event = Event::BlockedRangeRemoved { id, provider_id };
        self.persist_and_apply(&mut ps, &event).await?;
        Ok(provider_id)
    }

    // ── Appointments ─────────────────────────────────────────

    /// Book one appointment. Conflict check and commit happen under the
    /// provider write lock.
    pub async fn book_appointment(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        check_name(&req.notes, MAX_NOTES_LEN, "notes too long")?;
        let _gate = self.commit_gate.read().await;
        let mut ps = self.provider_write(req.provider_id).await?;
        if self.store.contains_entity(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let span = service_span(&ps, req.service_id, req.start)?;
        check_interval_room(&ps)?;
        check_no_conflict(&ps, &span, None)?;

        let event = appointment_created(&ps, &req, req.id, span, None)?;
        self.persist_and_apply(&mut ps, &event).await?;
        ps.appointments
            .get(&req.id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", req.id))
    }

    /// Expand `rule` from the requested start and book each instance.
    ///
    /// Instances are checked and committed one at a time, each under its own
    /// acquisition of the provider lock, so accepted instances survive later
    /// rejections (except in [`SeriesMode::AllOrNothing`]). `cancel` stops the
    /// expansion before the next instance; committed instances stay.
    ///
    /// The first booked instance takes `req.id` and carries the series record.
    pub async fn book_series(
        &self,
        req: BookingRequest,
        rule: RecurrenceRule,
        mode: SeriesMode,
        cancel: &CancellationToken,
    ) -> Result<SeriesOutcome, EngineError> {
        check_name(&req.notes, MAX_NOTES_LEN, "notes too long")?;
        let seed = {
            let shared = self
                .store
                .get_provider(&req.provider_id)
                .ok_or_else(|| EngineError::not_found("provider", req.provider_id))?;
            let ps = shared.read().await;
            service_span(&ps, req.service_id, req.start)?
        };
        if self.store.contains_entity(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let occurrences = rule.expand(seed)?;
        let series_id = Ulid::new();

        let outcome = if mode == SeriesMode::AllOrNothing {
            self.book_series_atomic(&req, rule, series_id, occurrences.collect(), cancel)
                .await?
        } else {
            let mut outcome = SeriesOutcome {
                series_id,
                created: Vec::new(),
                rejected: Vec::new(),
                stopped_early: false,
            };
            for span in occurrences {
                if cancel.is_cancelled() {
                    outcome.stopped_early = true;
                    break;
                }
                let id = if outcome.created.is_empty() { req.id } else { Ulid::new() };
                match self.book_series_instance(&req, rule, series_id, id, span).await {
                    Ok(appt) => outcome.created.push(appt),
                    // The seed id went to a concurrent booking; nothing was committed.
                    Err(EngineError::AlreadyExists(taken)) if taken == req.id => {
                        return Err(EngineError::AlreadyExists(taken));
                    }
                    Err(reason) => {
                        debug!("series {series_id}: instance at {} rejected: {reason}", span.start);
                        let fatal = !matches!(
                            reason,
                            EngineError::Conflict(_) | EngineError::LimitExceeded(_) | EngineError::Validation(_)
                        );
                        outcome.rejected.push(RejectedInstance {
                            candidate_start: span.start,
                            reason,
                        });
                        if fatal || mode == SeriesMode::StopOnFirst {
                            outcome.stopped_early = true;
                            break;
                        }
                    }
                }
            }
            outcome
        };

        metrics::counter!(observability::SERIES_INSTANCES_TOTAL, "outcome" => "created")
            .increment(outcome.created.len() as u64);
        metrics::counter!(observability::SERIES_INSTANCES_TOTAL, "outcome" => "rejected")
            .increment(outcome.rejected.len() as u64);
        info!(
            "series {series_id} ({rule}) on provider {}: {} created, {} rejected{}",
            req.provider_id,
            outcome.created.len(),
            outcome.rejected.len(),
            if outcome.stopped_early { ", stopped early" } else { "" },
        );
        Ok(outcome)
    }

    async fn book_series_instance(
        &self,
        req: &BookingRequest,
        rule: RecurrenceRule,
        series_id: Ulid,
        id: Ulid,
        span: Span,
    ) -> Result<Appointment, EngineError> {
        validate_span(&span)?;
        let _gate = self.commit_gate.read().await;
        let mut ps = self.provider_write(req.provider_id).await?;
        // Another booking may have taken the id since `book_series` checked it.
        if self.store.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        // The service may have been deactivated since the first instance.
        service_span(&ps, req.service_id, span.start)?;
        check_interval_room(&ps)?;
        check_no_conflict(&ps, &span, None)?;

        let mut events = Vec::with_capacity(2);
        if !ps.series.contains_key(&series_id) {
            events.push(Event::SeriesCreated {
                id: series_id,
                provider_id: req.provider_id,
                seed_id: id,
                rule,
                at: now_ms(),
            });
        }
        events.push(appointment_created(&ps, req, id, span, Some(series_id))?);
        self.commit_all(&mut ps, &events).await?;
        ps.appointments
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    /// All instances are validated against the calendar and against each
    /// other under one provider lock, then committed as one WAL unit.
    async fn book_series_atomic(
        &self,
        req: &BookingRequest,
        rule: RecurrenceRule,
        series_id: Ulid,
        spans: Vec<Span>,
        cancel: &CancellationToken,
    ) -> Result<SeriesOutcome, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut ps = self.provider_write(req.provider_id).await?;
        if self.store.contains_entity(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let buffer = ps.buffer_ms();

        let mut accepted: Vec<(Ulid, Span)> = Vec::with_capacity(spans.len());
        let mut rejected = Vec::new();
        for span in spans {
            let id = if accepted.is_empty() { req.id } else { Ulid::new() };
            let verdict = validate_span(&span)
                .and_then(|()| service_span(&ps, req.service_id, span.start).map(|_| ()))
                .and_then(|()| {
                    if ps.intervals.len() + accepted.len() >= MAX_INTERVALS_PER_PROVIDER {
                        return Err(EngineError::LimitExceeded("too many intervals on provider"));
                    }
                    Ok(())
                })
                .and_then(|()| check_no_conflict(&ps, &span, None))
                .and_then(|()| check_batch_conflict(&accepted, &span, buffer));
            match verdict {
                Ok(()) => accepted.push((id, span)),
                Err(reason) => rejected.push(RejectedInstance {
                    candidate_start: span.start,
                    reason,
                }),
            }
        }

        let mut outcome = SeriesOutcome {
            series_id,
            created: Vec::new(),
            rejected,
            stopped_early: false,
        };
        if cancel.is_cancelled() {
            outcome.stopped_early = true;
            return Ok(outcome);
        }
        if !outcome.rejected.is_empty() || accepted.is_empty() {
            return Ok(outcome);
        }

        let mut events = Vec::with_capacity(accepted.len() + 1);
        events.push(Event::SeriesCreated {
            id: series_id,
            provider_id: req.provider_id,
            seed_id: req.id,
            rule,
            at: now_ms(),
        });
        for &(id, span) in &accepted {
            events.push(appointment_created(&ps, req, id, span, Some(series_id))?);
        }
        self.commit_all(&mut ps, &events).await?;
        outcome.created = accepted
            .iter()
            .filter_map(|(id, _)| ps.appointments.get(id).cloned())
            .collect();
        Ok(outcome)
    }

    /// Append several provider events as one WAL unit, then apply and notify each.
    async fn commit_all(&self, ps: &mut ProviderState, events: &[Event]) -> Result<(), EngineError> {
        self.wal_append_all(events).await?;
        for event in events {
            self.store.apply_to_provider(ps, event);
            self.notify.send(ps.id, event);
        }
        Ok(())
    }

    pub async fn transition_appointment(
        &self,
        id: Ulid,
        action: AppointmentAction,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut ps = self.resolve_entity_write("appointment", id).await?;
        let current = ps
            .appointments
            .get(&id)
            .map(|a| a.status)
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        let status = next_appointment_status(id, current, action)?;

        let event = Event::AppointmentStatusChanged {
            id,
            provider_id: ps.id,
            status,
            at: now_ms(),
        };
        self.persist_and_apply(&mut ps, &event).await?;
        ps.appointments
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    pub async fn update_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        self.transition_appointment(id, AppointmentAction::toward(status)?)
            .await
    }

    /// Move a non-terminal appointment to `new_start`, keeping its duration.
    /// The appointment's current position is excluded from the conflict check.
    pub async fn reschedule_appointment(&self, id: Ulid, new_start: Ms) -> Result<Appointment, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut ps = self.resolve_entity_write("appointment", id).await?;
        let appt = ps
            .appointments
            .get(&id)
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        if appt.status.is_terminal() {
            return Err(EngineError::StateTransition {
                entity: "appointment",
                id,
                from: appt.status.as_str(),
                action: "reschedule",
            });
        }
        let span = appt.span.moved_to(new_start)?;
        validate_span(&span)?;
        check_no_conflict(&ps, &span, Some(id))?;

        let event = Event::AppointmentRescheduled {
            id,
            provider_id: ps.id,
            span,
            at: now_ms(),
        };
        self.persist_and_apply(&mut ps, &event).await?;
        ps.appointments
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    /// Hard delete. Only future, non-terminal appointments may be removed;
    /// anything else is history and must be cancelled instead.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut ps = self.resolve_entity_write("appointment", id).await?;
        let appt = ps
            .appointments
            .get(&id)
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        if appt.status.is_terminal() {
            return Err(EngineError::NotDeletable {
                id,
                reason: "it is in a terminal status; cancelled or finished appointments are history",
            });
        }
        if appt.span.start <= now_ms() {
            return Err(EngineError::NotDeletable {
                id,
                reason: "it has already started; cancel it instead",
            });
        }

        let provider_id = ps.id;
        let event = Event::AppointmentDeleted { id, provider_id };
        self.persist_and_apply(&mut ps, &event).await?;
        Ok(provider_id)
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Mutations are held off at the commit gate while the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events = Vec::new();

        for provider_id in self.store.provider_ids() {
            let Some(shared) = self.store.get_provider(&provider_id) else {
                continue;
            };
            let ps = shared.read().await;
            self.snapshot_provider(&ps, &mut events).await;
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    async fn snapshot_provider(&self, ps: &ProviderState, events: &mut Vec<Event>) {
        events.push(Event::ProviderCreated {
            id: ps.id,
            name: ps.name.clone(),
            settings: ps.settings,
            at: ps.created_at,
        });
        for (day, rule) in ps.hours.0.iter().enumerate() {
            if let Some(rule) = rule {
                events.push(Event::DayRuleSet {
                    provider_id: ps.id,
                    day: day as u8,
                    rule: *rule,
                });
            }
        }
        for service in ps.services.values() {
            events.push(Event::ServiceCreated {
                id: service.id,
                provider_id: ps.id,
                name: service.name.clone(),
                duration_minutes: service.duration_minutes,
                price_cents: service.price_cents,
                active: service.active,
                at: service.created_at,
            });
            if service.updated_at != service.created_at {
                events.push(Event::ServiceUpdated {
                    id: service.id,
                    provider_id: ps.id,
                    duration_minutes: service.duration_minutes,
                    price_cents: service.price_cents,
                    active: service.active,
                    at: service.updated_at,
                });
            }
        }
        for block in ps.blocked.values() {
            events.push(Event::BlockedRangeAdded {
                id: block.id,
                provider_id: ps.id,
                span: block.span,
                label: block.label.clone(),
                at: block.created_at,
            });
        }
        for series in ps.series.values() {
            events.push(Event::SeriesCreated {
                id: series.id,
                provider_id: ps.id,
                seed_id: series.seed_id,
                rule: series.rule,
                at: series.created_at,
            });
        }
        for appt in ps.appointments.values() {
            events.push(Event::AppointmentCreated {
                id: appt.id,
                provider_id: ps.id,
                client_id: appt.client_id,
                service_id: appt.service_id,
                span: appt.span,
                status: appt.status,
                series_id: appt.series_id,
                notes: appt.notes.clone(),
                at: appt.created_at,
            });
            if appt.updated_at != appt.created_at {
                events.push(Event::AppointmentStatusChanged {
                    id: appt.id,
                    provider_id: ps.id,
                    status: appt.status,
                    at: appt.updated_at,
                });
            }
        }
        for session_id in &ps.sessions {
            let Some(shared) = self.store.get_session(session_id) else {
                continue;
            };
            let ss = shared.lock().await;
            let session = &ss.session;
            events.push(Event::GroupSessionCreated {
                id: session.id,
                provider_id: ps.id,
                group_class_id: session.group_class_id,
                span: session.span,
                max_participants: session.max_participants,
                at: session.created_at,
            });
            for reg in &ss.registrations {
                events.push(Event::RegistrationCreated {
                    id: reg.id,
                    session_id: session.id,
                    client_id: reg.client_id,
                    at: reg.registered_at,
                });
                if reg.status != RegistrationStatus::Registered {
                    events.push(Event::RegistrationStatusChanged {
                        id: reg.id,
                        session_id: session.id,
                        status: reg.status,
                        at: reg.updated_at,
                    });
                }
            }
            if session.status == SessionStatus::Cancelled {
                events.push(Event::GroupSessionCancelled {
                    id: session.id,
                    provider_id: ps.id,
                    at: session.updated_at,
                });
            }
        }
        if ps.updated_at != ps.created_at {
            events.push(Event::ProviderSettingsUpdated {
                id: ps.id,
                settings: ps.settings,
                at: ps.updated_at,
            });
        }
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
}

/// Creation event for one booking; auto-confirms when the provider allows it
/// and the interval lies inside declared working hours.
fn appointment_created(
    ps: &ProviderState,
    req: &BookingRequest,
    id: Ulid,
    span: Span,
    series_id: Option<Ulid>,
) -> Result<Event, EngineError> {
    let auto = ps.settings.auto_confirm && within_working_hours(ps, &span);
    Ok(Event::AppointmentCreated {
        id,
        provider_id: req.provider_id,
        client_id: req.client_id,
        service_id: req.service_id,
        span,
        status: initial_appointment_status(id, auto)?,
        series_id,
        notes: req.notes.clone(),
        at: now_ms(),
    })
}
