use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;
pub type SharedSessionState = Arc<Mutex<SessionState>>;

/// In-memory indexes. Each provider and each group session sits behind its
/// own lock; the maps themselves only hold `Arc`s.
pub struct InMemoryStore {
    providers: DashMap<Ulid, SharedProviderState>,
    sessions: DashMap<Ulid, SharedSessionState>,
    /// Appointment, blocked range, service, series and session ids → provider id.
    entity_to_provider: DashMap<Ulid, Ulid>,
    registration_to_session: DashMap<Ulid, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            sessions: DashMap::new(),
            entity_to_provider: DashMap::new(),
            registration_to_session: DashMap::new(),
        }
    }

    // ── Providers ────────────────────────────────────────────

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn contains_provider(&self, id: &Ulid) -> bool {
        self.providers.contains_key(id)
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub fn insert_provider(&self, state: ProviderState) {
        self.providers.insert(state.id, Arc::new(RwLock::new(state)));
    }

    /// Drop the provider and the index entries of everything it owned.
    pub fn remove_provider(&self, ps: &ProviderState) {
        for id in ps.services.keys().chain(ps.blocked.keys()).chain(ps.series.keys()) {
            self.entity_to_provider.remove(id);
        }
        self.providers.remove(&ps.id);
    }

    pub fn provider_ids(&self) -> Vec<Ulid> {
        self.providers.iter().map(|e| *e.key()).collect()
    }

    // ── Sessions ─────────────────────────────────────────────

    pub fn get_session(&self, id: &Ulid) -> Option<SharedSessionState> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    // ── Entity indexes ───────────────────────────────────────

    pub fn provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    pub fn contains_entity(&self, entity_id: &Ulid) -> bool {
        self.entity_to_provider.contains_key(entity_id)
            || self.registration_to_session.contains_key(entity_id)
            || self.providers.contains_key(entity_id)
    }

    pub fn session_for_registration(&self, registration_id: &Ulid) -> Option<Ulid> {
        self.registration_to_session
            .get(registration_id)
            .map(|e| *e.value())
    }

    fn map_entity(&self, entity_id: Ulid, provider_id: Ulid) {
        self.entity_to_provider.insert(entity_id, provider_id);
    }

    fn unmap_entity(&self, entity_id: &Ulid) {
        self.entity_to_provider.remove(entity_id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply a provider-scoped event. Caller holds the provider write lock.
    /// Provider creation/deletion and registration events are not handled here.
    pub fn apply_to_provider(&self, ps: &mut ProviderState, event: &Event) {
        match event {
            Event::ProviderSettingsUpdated { settings, at, .. } => {
                ps.settings = *settings;
                ps.updated_at = *at;
            }
            Event::DayRuleSet { day, rule, .. } => {
                if let Some(slot) = ps.hours.0.get_mut(usize::from(*day)) {
                    *slot = Some(*rule);
                }
            }
            Event::DayRuleRemoved { day, .. } => {
                if let Some(slot) = ps.hours.0.get_mut(usize::from(*day)) {
                    *slot = None;
                }
            }
            Event::ServiceCreated {
                id,
                provider_id,
                name,
                duration_minutes,
                price_cents,
                active,
                at,
            } => {
                ps.services.insert(
                    *id,
                    Service {
                        id: *id,
                        provider_id: *provider_id,
                        name: name.clone(),
                        duration_minutes: *duration_minutes,
                        price_cents: *price_cents,
                        active: *active,
                        created_at: *at,
                        updated_at: *at,
                    },
                );
                self.map_entity(*id, *provider_id);
            }
            Event::ServiceUpdated {
                id,
                duration_minutes,
                price_cents,
                active,
                at,
                ..
            } => {
                if let Some(service) = ps.services.get_mut(id) {
                    service.duration_minutes = *duration_minutes;
                    service.price_cents = *price_cents;
                    service.active = *active;
                    service.updated_at = *at;
                }
            }
            Event::BlockedRangeAdded {
                id,
                provider_id,
                span,
                label,
                at,
            } => {
                ps.blocked.insert(
                    *id,
                    BlockedRange {
                        id: *id,
                        provider_id: *provider_id,
                        span: *span,
                        label: label.clone(),
                        created_at: *at,
                    },
                );
                ps.insert_interval(Interval {
                    id: *id,
                    span: *span,
                    kind: IntervalKind::Blocked,
                });
                self.map_entity(*id, *provider_id);
            }
            Event::BlockedRangeRemoved { id, .. } => {
                ps.blocked.remove(id);
                ps.remove_interval(*id);
                self.unmap_entity(id);
            }
            Event::SeriesCreated {
                id,
                provider_id,
                seed_id,
                rule,
                at,
            } => {
                ps.series.insert(
                    *id,
                    Series {
                        id: *id,
                        provider_id: *provider_id,
                        seed_id: *seed_id,
                        rule: *rule,
                        created_at: *at,
                    },
                );
                self.map_entity(*id, *provider_id);
            }
            Event::AppointmentCreated {
                id,
                provider_id,
                client_id,
                service_id,
                span,
                status,
                series_id,
                notes,
                at,
            } => {
                ps.appointments.insert(
                    *id,
                    Appointment {
                        id: *id,
                        provider_id: *provider_id,
                        client_id: *client_id,
                        service_id: *service_id,
                        span: *span,
                        status: *status,
                        series_id: *series_id,
                        notes: notes.clone(),
                        created_at: *at,
                        updated_at: *at,
                    },
                );
                if status.is_committed() {
                    ps.insert_interval(Interval {
                        id: *id,
                        span: *span,
                        kind: IntervalKind::Appointment,
                    });
                }
                self.map_entity(*id, *provider_id);
            }
            Event::AppointmentStatusChanged { id, status, at, .. } => {
                if let Some(appt) = ps.appointments.get_mut(id) {
                    appt.status = *status;
                    appt.updated_at = *at;
                    if !status.is_committed() {
                        ps.remove_interval(*id);
                    }
                }
            }
            Event::AppointmentRescheduled { id, span, at, .. } => {
                if let Some(appt) = ps.appointments.get_mut(id) {
                    appt.span = *span;
                    appt.updated_at = *at;
                    if ps.remove_interval(*id).is_some() {
                        ps.insert_interval(Interval {
                            id: *id,
                            span: *span,
                            kind: IntervalKind::Appointment,
                        });
                    }
                }
            }
            Event::AppointmentDeleted { id, .. } => {
                ps.appointments.remove(id);
                ps.remove_interval(*id);
                self.unmap_entity(id);
            }
            Event::GroupSessionCreated {
                id,
                provider_id,
                group_class_id,
                span,
                max_participants,
                at,
            } => {
                ps.sessions.push(*id);
                ps.insert_interval(Interval {
                    id: *id,
                    span: *span,
                    kind: IntervalKind::Session,
                });
                self.map_entity(*id, *provider_id);
                let session = GroupSession {
                    id: *id,
                    group_class_id: *group_class_id,
                    provider_id: *provider_id,
                    span: *span,
                    max_participants: *max_participants,
                    current_participants: 0,
                    status: SessionStatus::Scheduled,
                    created_at: *at,
                    updated_at: *at,
                };
                self.sessions
                    .insert(*id, Arc::new(Mutex::new(SessionState::new(session))));
            }
            Event::GroupSessionCancelled { id, .. } => {
                // Session stays listed on the provider; only its interval is freed.
                ps.remove_interval(*id);
            }
            Event::ProviderCreated { .. }
            | Event::ProviderDeleted { .. }
            | Event::RegistrationCreated { .. }
            | Event::RegistrationStatusChanged { .. } => {}
        }
        ps.updated_at = ps.updated_at.max(event_time(event).unwrap_or(ps.updated_at));
    }

    /// Apply a session-scoped event. Caller holds the session lock.
    /// `current_participants` is only ever changed here.
    pub fn apply_to_session(&self, ss: &mut SessionState, event: &Event) {
        match event {
            Event::GroupSessionCancelled { at, .. } => {
                ss.session.status = SessionStatus::Cancelled;
                ss.session.updated_at = *at;
                for reg in ss.registrations.iter_mut().filter(|r| r.status.is_active()) {
                    reg.status = RegistrationStatus::Cancelled;
                    reg.updated_at = *at;
                }
                ss.session.current_participants = 0;
            }
            Event::RegistrationCreated {
                id,
                session_id,
                client_id,
                at,
            } => {
                ss.registrations.push(Registration {
                    id: *id,
                    session_id: *session_id,
                    client_id: *client_id,
                    status: RegistrationStatus::Registered,
                    registered_at: *at,
                    updated_at: *at,
                });
                ss.session.current_participants += 1;
                self.registration_to_session.insert(*id, *session_id);
            }
            Event::RegistrationStatusChanged { id, status, at, .. } => {
                let mut freed = false;
                if let Some(reg) = ss.registration_mut(*id) {
                    freed = reg.status.is_active() && !status.is_active();
                    reg.status = *status;
                    reg.updated_at = *at;
                }
                if freed {
                    ss.session.current_participants -= 1;
                }
            }
            _ => {}
        }
        debug_assert_eq!(ss.session.current_participants, ss.active_count());
    }
}

fn event_time(event: &Event) -> Option<Ms> {
    match event {
        Event::ProviderSettingsUpdated { at, .. }
        | Event::ServiceCreated { at, .. }
        | Event::ServiceUpdated { at, .. }
        | Event::BlockedRangeAdded { at, .. }
        | Event::SeriesCreated { at, .. }
        | Event::AppointmentCreated { at, .. }
        | Event::AppointmentStatusChanged { at, .. }
        | Event::AppointmentRescheduled { at, .. }
        | Event::GroupSessionCreated { at, .. }
        | Event::GroupSessionCancelled { at, .. } => Some(*at),
        _ => None,
    }
}

/// Owning provider of an event, for routing during replay and notification.
/// Registration events are routed through their session instead.
pub(crate) fn event_provider_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ProviderCreated { id, .. }
        | Event::ProviderSettingsUpdated { id, .. }
        | Event::ProviderDeleted { id } => Some(*id),
        Event::DayRuleSet { provider_id, .. }
        | Event::DayRuleRemoved { provider_id, .. }
        | Event::ServiceCreated { provider_id, .. }
        | Event::ServiceUpdated { provider_id, .. }
        | Event::BlockedRangeAdded { provider_id, .. }
        | Event::BlockedRangeRemoved { provider_id, .. }
        | Event::SeriesCreated { provider_id, .. }
        | Event::AppointmentCreated { provider_id, .. }
        | Event::AppointmentStatusChanged { provider_id, .. }
        | Event::AppointmentRescheduled { provider_id, .. }
        | Event::AppointmentDeleted { provider_id, .. }
        | Event::GroupSessionCreated { provider_id, .. }
        | Event::GroupSessionCancelled { provider_id, .. } => Some(*provider_id),
        Event::RegistrationCreated { .. } | Event::RegistrationStatusChanged { .. } => None,
    }
}
