use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{free_slots, within_working_hours};
use super::conflict::{find_conflict, validate_span};
use super::{Engine, EngineError, SharedProviderState};

fn check_window(window: &Span) -> Result<(), EngineError> {
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    fn provider(&self, provider_id: Ulid) -> Result<SharedProviderState, EngineError> {
        self.get_provider(&provider_id)
            .ok_or_else(|| EngineError::not_found("provider", provider_id))
    }

    /// Read-only conflict check: the first committed interval `span` would
    /// collide with, if any. `exclude` skips one entity (rescheduling).
    pub async fn check_conflict(
        &self,
        provider_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Option<EntityRef>, EngineError> {
        validate_span(&span)?;
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;
        Ok(find_conflict(&ps, &span, exclude))
    }

    pub async fn is_within_working_hours(&self, provider_id: Ulid, span: Span) -> Result<bool, EngineError> {
        validate_span(&span)?;
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;
        Ok(within_working_hours(&ps, &span))
    }

    /// Free slots: weekly hours minus blocked ranges minus committed
    /// intervals widened by the buffer.
    pub async fn compute_availability(
        &self,
        provider_id: Ulid,
        window: Span,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        check_window(&window)?;
        if min_duration_ms.is_some_and(|d| d < 0) {
            return Err(EngineError::Validation("min_duration must not be negative".into()));
        }
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;
        Ok(free_slots(&ps, &window, min_duration_ms.unwrap_or(0)))
    }

    /// Appointments (every status), group sessions and blocked ranges that
    /// overlap `window`, ordered by start.
    pub async fn calendar(&self, provider_id: Ulid, window: Span) -> Result<Vec<CalendarEntry>, EngineError> {
        check_window(&window)?;
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;

        let mut entries: Vec<CalendarEntry> = ps
            .appointments
            .values()
            .filter(|a| a.span.overlaps(&window))
            .map(|a| CalendarEntry {
                kind: EntityKind::Appointment,
                id: a.id,
                span: a.span,
                status: a.status.as_str(),
                client_id: Some(a.client_id),
                service_id: Some(a.service_id),
                label: a.notes.clone(),
                participants: None,
            })
            .collect();

        entries.extend(ps.blocked.values().filter(|b| b.span.overlaps(&window)).map(|b| {
            CalendarEntry {
                kind: EntityKind::BlockedRange,
                id: b.id,
                span: b.span,
                status: "blocked",
                client_id: None,
                service_id: None,
                label: b.label.clone(),
                participants: None,
            }
        }));

        for session_id in &ps.sessions {
            let Some(shared) = self.get_session(session_id) else {
                continue;
            };
            let ss = shared.lock().await;
            let session = &ss.session;
            if !session.span.overlaps(&window) {
                continue;
            }
            entries.push(CalendarEntry {
                kind: EntityKind::GroupSession,
                id: session.id,
                span: session.span,
                status: session.status.as_str(),
                client_id: None,
                service_id: None,
                label: None,
                participants: Some((session.current_participants, session.max_participants)),
            });
        }

        entries.sort_by_key(|e| (e.span.start, e.id));
        Ok(entries)
    }

    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        let mut out = Vec::with_capacity(self.store.provider_count());
        for id in self.store.provider_ids() {
            let Some(shared) = self.get_provider(&id) else {
                continue;
            };
            let ps = shared.read().await;
            out.push(ProviderInfo {
                id: ps.id,
                name: ps.name.clone(),
                buffer_minutes: ps.settings.buffer_minutes,
                auto_confirm: ps.settings.auto_confirm,
            });
        }
        out.sort_by_key(|p| p.id);
        out
    }

    pub async fn list_services(&self, provider_id: Ulid) -> Result<Vec<Service>, EngineError> {
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;
        let mut services: Vec<Service> = ps.services.values().cloned().collect();
        services.sort_by_key(|s| s.id);
        Ok(services)
    }

    pub async fn get_service(&self, id: Ulid) -> Result<Service, EngineError> {
        let provider_id = self
            .provider_for_entity(&id)
            .ok_or_else(|| EngineError::not_found("service", id))?;
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;
        ps.services
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("service", id))
    }

    pub async fn list_day_rules(&self, provider_id: Ulid) -> Result<Vec<DayRuleInfo>, EngineError> {
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;
        Ok((0..7u8)
            .filter_map(|day| {
                ps.hours.get(day).map(|rule| DayRuleInfo {
                    provider_id,
                    day,
                    rule,
                })
            })
            .collect())
    }

    pub async fn list_blocked_ranges(&self, provider_id: Ulid) -> Result<Vec<BlockedRange>, EngineError> {
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;
        let mut blocked: Vec<BlockedRange> = ps.blocked.values().cloned().collect();
        blocked.sort_by_key(|b| (b.span.start, b.id));
        Ok(blocked)
    }

    /// Every appointment, cancelled ones included.
    pub async fn list_appointments(&self, provider_id: Ulid) -> Result<Vec<Appointment>, EngineError> {
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;
        let mut appointments: Vec<Appointment> = ps.appointments.values().cloned().collect();
        appointments.sort_by_key(|a| (a.span.start, a.id));
        Ok(appointments)
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let provider_id = self
            .provider_for_entity(&id)
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;
        ps.appointments
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    pub async fn list_group_sessions(&self, provider_id: Ulid) -> Result<Vec<GroupSession>, EngineError> {
        let shared = self.provider(provider_id)?;
        let ps = shared.read().await;
        let mut sessions = Vec::with_capacity(ps.sessions.len());
        for session_id in &ps.sessions {
            if let Some(shared) = self.get_session(session_id) {
                sessions.push(shared.lock().await.session.clone());
            }
        }
        sessions.sort_by_key(|s| (s.span.start, s.id));
        Ok(sessions)
    }

    pub async fn get_group_session(&self, id: Ulid) -> Result<GroupSession, EngineError> {
        let shared = self
            .get_session(&id)
            .ok_or_else(|| EngineError::not_found("group session", id))?;
        let session = shared.lock().await.session.clone();
        Ok(session)
    }

    pub async fn list_registrations(&self, session_id: Ulid) -> Result<Vec<Registration>, EngineError> {
        let shared = self
            .get_session(&session_id)
            .ok_or_else(|| EngineError::not_found("group session", session_id))?;
        let ss = shared.lock().await;
        Ok(ss.registrations.clone())
    }
}
