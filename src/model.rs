use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{EngineError, RecurrenceRule};

/// Unix milliseconds (UTC). The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// Zero-length and inverted intervals are rejected.
    pub fn new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if end <= start {
            return Err(EngineError::Validation(format!(
                "interval end ({end}) must be after start ({start})"
            )));
        }
        Ok(Self { start, end })
    }

    /// `duration` long from `start`. Fails instead of wrapping on huge starts.
    pub fn starting_at(start: Ms, duration: Ms) -> Result<Self, EngineError> {
        let end = start
            .checked_add(duration)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        Self::new(start, end)
    }

    /// For spans derived from already-validated ones (shifted, widened, clamped).
    pub(crate) fn from_bounds(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.overlaps_with_buffer(other, 0)
    }

    /// `a.start < b.end + buffer && b.start < a.end + buffer`.
    ///
    /// The buffer is a required gap between the two intervals, applied once
    /// (not doubled), so the predicate is symmetric in `self` and `other`.
    pub fn overlaps_with_buffer(&self, other: &Span, buffer: Ms) -> bool {
        self.start < other.end + buffer && other.start < self.end + buffer
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Extend both ends by `margin`.
    pub fn widen(&self, margin: Ms) -> Span {
        Span::from_bounds(self.start - margin, self.end + margin)
    }

    /// Same length, starting at `start`.
    pub fn moved_to(&self, start: Ms) -> Result<Span, EngineError> {
        Span::starting_at(start, self.duration_ms())
    }
}

// ── Entity references ────────────────────────────────────────────

/// Entity types that own committed intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Appointment,
    BlockedRange,
    GroupSession,
}

impl EntityKind {
    /// Wire/column form.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Appointment => "appointment",
            Self::BlockedRange => "blocked_range",
            Self::GroupSession => "group_session",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let human = match self {
            Self::Appointment => "appointment",
            Self::BlockedRange => "blocked time",
            Self::GroupSession => "group session",
        };
        f.write_str(human)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Ulid,
}

/// What a committed interval belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    Appointment,
    Blocked,
    Session,
}

/// A committed interval on a provider's calendar. Appointments (not cancelled),
/// blocked ranges and scheduled group sessions are all just intervals here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn entity(&self) -> EntityRef {
        let kind = match self.kind {
            IntervalKind::Appointment => EntityKind::Appointment,
            IntervalKind::Blocked => EntityKind::BlockedRange,
            IntervalKind::Session => EntityKind::GroupSession,
        };
        EntityRef { kind, id: self.id }
    }
}

// ── Statuses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    /// Committed appointments take part in conflict checking.
    pub const fn is_committed(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl FromStr for AppointmentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "completed" => Ok(Self::Completed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "no_show" | "noshow" | "no-show" => Ok(Self::NoShow),
            other => Err(EngineError::Validation(format!(
                "unknown appointment status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Registered,
    Confirmed,
    Cancelled,
}

impl RegistrationStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Active registrations occupy a seat.
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl FromStr for RegistrationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "registered" => Ok(Self::Registered),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(EngineError::Validation(format!(
                "unknown registration status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Scheduled,
    Cancelled,
}

impl SessionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Cancelled => "cancelled",
        }
    }
}

// ── Provider-owned records ───────────────────────────────────────

/// Open hours for one weekday, in minutes since midnight UTC. `end_minute` may be 1440.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRule {
    pub start_minute: u16,
    pub end_minute: u16,
}

/// One optional rule per weekday, indexed 0 = Sunday .. 6 = Saturday.
/// A missing rule means the provider is closed that day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeeklyHours(pub [Option<DayRule>; 7]);

impl WeeklyHours {
    pub fn get(&self, day: u8) -> Option<DayRule> {
        self.0.get(usize::from(day)).copied().flatten()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub buffer_minutes: u32,
    pub auto_confirm: bool,
}

impl ProviderSettings {
    pub fn buffer_ms(&self) -> Ms {
        Ms::from(self.buffer_minutes) * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub name: Option<String>,
    pub duration_minutes: u32,
    pub price_cents: i64,
    pub active: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_minutes) * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedRange {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub span: Span,
    pub label: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub client_id: Ulid,
    pub service_id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
    /// Set when the appointment was generated from a recurrence rule.
    pub series_id: Option<Ulid>,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// A recurrence rule owned by the seed appointment of a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub seed_id: Ulid,
    pub rule: RecurrenceRule,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    pub name: Option<String>,
    pub settings: ProviderSettings,
    pub hours: WeeklyHours,
    pub services: HashMap<Ulid, Service>,
    /// Every appointment ever created, cancelled ones included.
    pub appointments: HashMap<Ulid, Appointment>,
    pub blocked: HashMap<Ulid, BlockedRange>,
    pub series: HashMap<Ulid, Series>,
    /// Group sessions owned by this provider (state lives in the session store).
    pub sessions: Vec<Ulid>,
    /// Committed intervals, sorted by `span.start`.
    pub intervals: Vec<Interval>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl ProviderState {
    pub fn new(id: Ulid, name: Option<String>, settings: ProviderSettings, created_at: Ms) -> Self {
        Self {
            id,
            name,
            settings,
            hours: WeeklyHours::default(),
            services: HashMap::new(),
            appointments: HashMap::new(),
            blocked: HashMap::new(),
            series: HashMap::new(),
            sessions: Vec::new(),
            intervals: Vec::new(),
            created_at,
            updated_at: created_at,
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn buffer_ms(&self) -> Ms {
        self.settings.buffer_ms()
    }

    /// Whether the provider still owns history that must not be orphaned.
    pub fn has_dependents(&self) -> bool {
        !self.appointments.is_empty() || !self.sessions.is_empty()
    }
}

// ── Group sessions ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSession {
    pub id: Ulid,
    pub group_class_id: Ulid,
    pub provider_id: Ulid,
    pub span: Span,
    pub max_participants: u32,
    /// Cached count of non-cancelled registrations; written only under the session lock.
    pub current_participants: u32,
    pub status: SessionStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl GroupSession {
    pub fn remaining_spots(&self) -> u32 {
        self.max_participants.saturating_sub(self.current_participants)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: Ulid,
    pub session_id: Ulid,
    pub client_id: Ulid,
    pub status: RegistrationStatus,
    pub registered_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub session: GroupSession,
    pub registrations: Vec<Registration>,
}

impl SessionState {
    pub fn new(session: GroupSession) -> Self {
        Self {
            session,
            registrations: Vec::new(),
        }
    }

    pub fn active_count(&self) -> u32 {
        self.registrations
            .iter()
            .filter(|r| r.status.is_active())
            .count() as u32
    }

    pub fn registration_mut(&mut self, id: Ulid) -> Option<&mut Registration> {
        self.registrations.iter_mut().find(|r| r.id == id)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderCreated {
        id: Ulid,
        name: Option<String>,
        settings: ProviderSettings,
        at: Ms,
    },
    ProviderSettingsUpdated {
        id: Ulid,
        settings: ProviderSettings,
        at: Ms,
    },
    ProviderDeleted {
        id: Ulid,
    },
    DayRuleSet {
        provider_id: Ulid,
        day: u8,
        rule: DayRule,
    },
    DayRuleRemoved {
        provider_id: Ulid,
        day: u8,
    },
    ServiceCreated {
        id: Ulid,
        provider_id: Ulid,
        name: Option<String>,
        duration_minutes: u32,
        price_cents: i64,
        active: bool,
        at: Ms,
    },
    ServiceUpdated {
        id: Ulid,
        provider_id: Ulid,
        duration_minutes: u32,
        price_cents: i64,
        active: bool,
        at: Ms,
    },
    BlockedRangeAdded {
        id: Ulid,
        provider_id: Ulid,
        span: Span,
        label: Option<String>,
        at: Ms,
    },
    BlockedRangeRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    SeriesCreated {
        id: Ulid,
        provider_id: Ulid,
        seed_id: Ulid,
        rule: RecurrenceRule,
        at: Ms,
    },
    AppointmentCreated {
        id: Ulid,
        provider_id: Ulid,
        client_id: Ulid,
        service_id: Ulid,
        span: Span,
        status: AppointmentStatus,
        series_id: Option<Ulid>,
        notes: Option<String>,
        at: Ms,
    },
    AppointmentStatusChanged {
        id: Ulid,
        provider_id: Ulid,
        status: AppointmentStatus,
        at: Ms,
    },
    AppointmentRescheduled {
        id: Ulid,
        provider_id: Ulid,
        span: Span,
        at: Ms,
    },
    AppointmentDeleted {
        id: Ulid,
        provider_id: Ulid,
    },
    GroupSessionCreated {
        id: Ulid,
        provider_id: Ulid,
        group_class_id: Ulid,
        span: Span,
        max_participants: u32,
        at: Ms,
    },
    GroupSessionCancelled {
        id: Ulid,
        provider_id: Ulid,
        at: Ms,
    },
    RegistrationCreated {
        id: Ulid,
        session_id: Ulid,
        client_id: Ulid,
        at: Ms,
    },
    RegistrationStatusChanged {
        id: Ulid,
        session_id: Ulid,
        status: RegistrationStatus,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

/// One row of the merged calendar projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub kind: EntityKind,
    pub id: Ulid,
    pub span: Span,
    pub status: &'static str,
    pub client_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    pub label: Option<String>,
    /// `(current, max)` for group sessions.
    pub participants: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub buffer_minutes: u32,
    pub auto_confirm: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayRuleInfo {
    pub provider_id: Ulid,
    pub day: u8,
    pub rule: DayRule,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: Ms, end: Ms) -> Span {
        Span::new(start, end).unwrap()
    }

    fn provider() -> ProviderState {
        ProviderState::new(Ulid::new(), None, ProviderSettings::default(), 0)
    }

    fn interval(start: Ms, end: Ms, kind: IntervalKind) -> Interval {
        Interval {
            id: Ulid::new(),
            span: span(start, end),
            kind,
        }
    }

    #[test]
    fn span_basics() {
        let s = span(100, 200);
        assert_eq!(s.duration_ms(), 100);
        // Half-open: touching spans do not overlap.
        assert!(!s.overlaps(&span(200, 300)));
        assert!(s.overlaps(&span(199, 300)));
    }

    #[test]
    fn span_rejects_zero_length_and_inverted() {
        assert!(matches!(Span::new(100, 100), Err(EngineError::Validation(_))));
        assert!(matches!(Span::new(200, 100), Err(EngineError::Validation(_))));
    }

    #[test]
    fn span_overlap() {
        let a = span(100, 200);
        let b = span(150, 250);
        let c = span(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn buffer_turns_adjacency_into_overlap() {
        let a = span(14 * 60, 15 * 60);
        let b = span(15 * 60, 16 * 60);
        assert!(!a.overlaps_with_buffer(&b, 0));
        assert!(a.overlaps_with_buffer(&b, 15));
        assert!(b.overlaps_with_buffer(&a, 15));
    }

    #[test]
    fn buffer_is_not_doubled() {
        // 15-unit gap with a 15-unit buffer is exactly enough.
        let a = span(0, 100);
        let b = span(115, 200);
        assert!(!a.overlaps_with_buffer(&b, 15));
        assert!(a.overlaps_with_buffer(&b, 16));
    }

    #[test]
    fn span_contains_span() {
        let outer = span(100, 400);
        let inner = span(150, 300);
        let partial = span(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer)); // self-containment
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn widen_and_move() {
        let s = span(100, 200);
        assert_eq!(s.widen(10), span(90, 210));
        assert_eq!(s.moved_to(1000).unwrap(), span(1000, 1100));
    }

    #[test]
    fn span_end_overflow_is_rejected() {
        assert!(matches!(
            Span::starting_at(Ms::MAX - 1, 60_000),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            span(100, 200).moved_to(Ms::MAX - 50),
            Err(EngineError::LimitExceeded(_))
        ));
        assert_eq!(Span::starting_at(100, 50).unwrap(), span(100, 150));
    }

    #[test]
    fn interval_ordering() {
        let mut ps = provider();
        ps.insert_interval(interval(300, 400, IntervalKind::Appointment));
        ps.insert_interval(interval(100, 200, IntervalKind::Blocked));
        ps.insert_interval(interval(200, 300, IntervalKind::Session));
        assert_eq!(ps.intervals[0].span.start, 100);
        assert_eq!(ps.intervals[1].span.start, 200);
        assert_eq!(ps.intervals[2].span.start, 300);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut ps = provider();
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        for (i, &id) in ids.iter().enumerate() {
            ps.insert_interval(Interval {
                id,
                span: span((i as Ms) * 100, (i as Ms) * 100 + 50),
                kind: IntervalKind::Appointment,
            });
        }
        ps.remove_interval(ids[1]);
        assert_eq!(ps.intervals.len(), 2);
        assert_eq!(ps.intervals[0].id, ids[0]);
        assert_eq!(ps.intervals[1].id, ids[2]);
        assert!(ps.remove_interval(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ps = provider();
        ps.insert_interval(interval(100, 200, IntervalKind::Appointment));
        ps.insert_interval(interval(450, 600, IntervalKind::Blocked));
        ps.insert_interval(interval(1000, 1100, IntervalKind::Appointment));

        let hits: Vec<_> = ps.overlapping(&span(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, span(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ps = provider();
        ps.insert_interval(interval(100, 200, IntervalKind::Appointment));
        assert_eq!(ps.overlapping(&span(200, 300)).count(), 0);
    }

    #[test]
    fn overlapping_large_interval_spanning_query() {
        let mut ps = provider();
        ps.insert_interval(interval(0, 10_000, IntervalKind::Blocked));
        assert_eq!(ps.overlapping(&span(500, 600)).count(), 1);
    }

    #[test]
    fn interval_entity_refs() {
        let i = interval(0, 10, IntervalKind::Session);
        assert_eq!(i.entity().kind, EntityKind::GroupSession);
        assert_eq!(i.entity().id, i.id);
        assert_eq!(EntityKind::BlockedRange.to_string(), "blocked time");
        assert_eq!(EntityKind::BlockedRange.as_str(), "blocked_range");
    }

    #[test]
    fn status_parsing() {
        assert_eq!("no_show".parse::<AppointmentStatus>().unwrap(), AppointmentStatus::NoShow);
        assert_eq!("Canceled".parse::<AppointmentStatus>().unwrap(), AppointmentStatus::Cancelled);
        assert!("archived".parse::<AppointmentStatus>().is_err());
        assert_eq!(
            "confirmed".parse::<RegistrationStatus>().unwrap(),
            RegistrationStatus::Confirmed
        );
        assert!(AppointmentStatus::NoShow.is_terminal());
        assert!(AppointmentStatus::NoShow.is_committed());
        assert!(!AppointmentStatus::Cancelled.is_committed());
    }

    #[test]
    fn session_counts_only_active_registrations() {
        let session_id = Ulid::new();
        let mut ss = SessionState::new(GroupSession {
            id: session_id,
            group_class_id: Ulid::new(),
            provider_id: Ulid::new(),
            span: span(0, 100),
            max_participants: 3,
            current_participants: 0,
            status: SessionStatus::Scheduled,
            created_at: 0,
            updated_at: 0,
        });
        for status in [
            RegistrationStatus::Registered,
            RegistrationStatus::Confirmed,
            RegistrationStatus::Cancelled,
        ] {
            ss.registrations.push(Registration {
                id: Ulid::new(),
                session_id,
                client_id: Ulid::new(),
                status,
                registered_at: 0,
                updated_at: 0,
            });
        }
        assert_eq!(ss.active_count(), 2);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentCreated {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            client_id: Ulid::new(),
            service_id: Ulid::new(),
            span: span(1000, 2000),
            status: AppointmentStatus::Pending,
            series_id: None,
            notes: Some("first visit".into()),
            at: 42,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
