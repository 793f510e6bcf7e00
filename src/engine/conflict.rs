use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn check_interval_room(ps: &ProviderState) -> Result<(), EngineError> {
    if ps.intervals.len() >= MAX_INTERVALS_PER_PROVIDER {
        return Err(EngineError::LimitExceeded("too many intervals on provider"));
    }
    Ok(())
}

/// First committed interval on the provider that collides with `span` once the
/// provider's buffer is applied. `exclude` lets an entity be moved without
/// colliding with its own current position.
pub(crate) fn find_conflict(ps: &ProviderState, span: &Span, exclude: Option<Ulid>) -> Option<EntityRef> {
    let buffer = ps.buffer_ms();
    // Every interval overlapping the widened candidate is within `buffer` of it.
    ps.overlapping(&span.widen(buffer))
        .filter(|i| Some(i.id) != exclude)
        .find(|i| i.span.overlaps_with_buffer(span, buffer))
        .map(Interval::entity)
}

pub(crate) fn check_no_conflict(ps: &ProviderState, span: &Span, exclude: Option<Ulid>) -> Result<(), EngineError> {
    match find_conflict(ps, span, exclude) {
        Some(with) => {
            metrics::counter!(observability::CONFLICTS_TOTAL, "kind" => with.kind.as_str()).increment(1);
            Err(EngineError::Conflict(with))
        }
        None => Ok(()),
    }
}

/// Conflict check against candidates accepted earlier in the same batch.
pub(crate) fn check_batch_conflict(pending: &[(Ulid, Span)], span: &Span, buffer: Ms) -> Result<(), EngineError> {
    match pending.iter().find(|(_, s)| s.overlaps_with_buffer(span, buffer)) {
        Some(&(id, _)) => Err(EngineError::Conflict(EntityRef {
            kind: EntityKind::Appointment,
            id,
        })),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn span(start: Ms, end: Ms) -> Span {
        Span::new(start, end).unwrap()
    }

    fn provider_with(buffer_minutes: u32, intervals: &[(Ulid, Span, IntervalKind)]) -> ProviderState {
        let settings = ProviderSettings {
            buffer_minutes,
            auto_confirm: false,
        };
        let mut ps = ProviderState::new(Ulid::new(), None, settings, 0);
        for &(id, span, kind) in intervals {
            ps.insert_interval(Interval { id, span, kind });
        }
        ps
    }

    #[test]
    fn overlapping_booking_conflicts() {
        let appt = Ulid::new();
        let ps = provider_with(0, &[(appt, span(14 * H, 15 * H), IntervalKind::Appointment)]);
        let hit = find_conflict(&ps, &span(14 * H + 30 * M, 15 * H + 30 * M), None).unwrap();
        assert_eq!(hit.kind, EntityKind::Appointment);
        assert_eq!(hit.id, appt);
    }

    #[test]
    fn adjacent_booking_is_fine_without_buffer() {
        let ps = provider_with(0, &[(Ulid::new(), span(14 * H, 15 * H), IntervalKind::Appointment)]);
        assert!(check_no_conflict(&ps, &span(15 * H, 16 * H), None).is_ok());
        assert!(check_no_conflict(&ps, &span(13 * H, 14 * H), None).is_ok());
    }

    #[test]
    fn buffer_makes_adjacent_booking_conflict() {
        let ps = provider_with(15, &[(Ulid::new(), span(14 * H, 15 * H), IntervalKind::Appointment)]);
        assert!(matches!(
            check_no_conflict(&ps, &span(15 * H, 16 * H), None),
            Err(EngineError::Conflict(_))
        ));
        // Buffer applies before the committed interval too.
        assert!(check_no_conflict(&ps, &span(13 * H, 13 * H + 45 * M), None).is_ok());
        assert!(check_no_conflict(&ps, &span(13 * H, 13 * H + 46 * M), None).is_err());
    }

    #[test]
    fn blocked_range_and_session_are_reported_by_kind() {
        let blocked = Ulid::new();
        let session = Ulid::new();
        let ps = provider_with(
            0,
            &[
                (blocked, span(9 * H, 10 * H), IntervalKind::Blocked),
                (session, span(11 * H, 12 * H), IntervalKind::Session),
            ],
        );
        assert_eq!(
            find_conflict(&ps, &span(9 * H + 30 * M, 9 * H + 45 * M), None),
            Some(EntityRef {
                kind: EntityKind::BlockedRange,
                id: blocked
            })
        );
        assert_eq!(
            find_conflict(&ps, &span(11 * H, 11 * H + M), None).map(|e| e.kind),
            Some(EntityKind::GroupSession)
        );
    }

    #[test]
    fn excluded_interval_never_conflicts_with_itself() {
        let appt = Ulid::new();
        let ps = provider_with(30, &[(appt, span(14 * H, 15 * H), IntervalKind::Appointment)]);
        assert!(check_no_conflict(&ps, &span(14 * H, 15 * H), Some(appt)).is_ok());
        assert!(check_no_conflict(&ps, &span(14 * H + 15 * M, 15 * H + 15 * M), Some(appt)).is_ok());
        assert!(check_no_conflict(&ps, &span(14 * H, 15 * H), None).is_err());
    }

    #[test]
    fn long_interval_starting_early_still_found() {
        let ps = provider_with(0, &[(Ulid::new(), span(0, 48 * H), IntervalKind::Blocked)]);
        assert!(check_no_conflict(&ps, &span(30 * H, 31 * H), None).is_err());
    }

    #[test]
    fn batch_conflict_uses_buffer() {
        let first = Ulid::new();
        let pending = vec![(first, span(10 * H, 11 * H))];
        assert!(check_batch_conflict(&pending, &span(11 * H, 12 * H), 0).is_ok());
        assert_eq!(
            check_batch_conflict(&pending, &span(11 * H, 12 * H), 10 * M),
            Err(EngineError::Conflict(EntityRef {
                kind: EntityKind::Appointment,
                id: first
            }))
        );
    }

    #[test]
    fn span_limits() {
        assert!(validate_span(&span(0, 1000)).is_err());
        let base = MIN_VALID_TIMESTAMP_MS;
        assert!(validate_span(&span(base, base + H)).is_ok());
        assert!(validate_span(&span(base, base + MAX_SPAN_DURATION_MS + 1)).is_err());
    }
}
