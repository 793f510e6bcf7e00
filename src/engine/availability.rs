use chrono::Datelike;

use crate::model::*;

use super::recurrence::{midnight_ms, utc_date};
use super::EngineError;

// ── Weekly rules ──────────────────────────────────────────────────

pub(crate) fn validate_day_rule(day: u8, rule: &DayRule) -> Result<(), EngineError> {
    if day > 6 {
        return Err(EngineError::Validation(format!(
            "day_of_week must be 0 (Sunday) to 6 (Saturday), got {day}"
        )));
    }
    if rule.end_minute > 24 * 60 {
        return Err(EngineError::Validation("end_time must be at most 24:00".into()));
    }
    if rule.start_minute >= rule.end_minute {
        return Err(EngineError::Validation(
            "start_time must be before end_time".into(),
        ));
    }
    Ok(())
}

/// Parse `HH:MM` (or `HH:MM:SS`, seconds must be zero) to minutes since midnight.
/// `24:00` is accepted as end of day.
pub fn parse_clock(s: &str) -> Result<u16, EngineError> {
    let bad = || EngineError::Validation(format!("invalid time of day: {s:?}"));
    let mut parts = s.trim().split(':');
    let hours: u16 = parts.next().and_then(|h| h.parse().ok()).ok_or_else(bad)?;
    let minutes: u16 = parts.next().and_then(|m| m.parse().ok()).ok_or_else(bad)?;
    if let Some(seconds) = parts.next()
        && seconds.parse::<u16>().ok() != Some(0)
    {
        return Err(bad());
    }
    if parts.next().is_some() || minutes > 59 || hours > 24 || (hours == 24 && minutes != 0) {
        return Err(bad());
    }
    Ok(hours * 60 + minutes)
}

pub fn format_clock(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

// ── Working hours ─────────────────────────────────────────────────

/// Open-hours spans from the weekly rules that intersect `window`, clamped to it.
/// Sorted and merged, so 24-hour days that touch form one span.
pub fn working_spans(hours: &WeeklyHours, window: &Span) -> Vec<Span> {
    let Some((mut date, _)) = utc_date(window.start) else {
        return Vec::new();
    };
    let mut spans = Vec::new();
    loop {
        let midnight = midnight_ms(date);
        if midnight >= window.end {
            break;
        }
        let day = date.weekday().num_days_from_sunday() as u8;
        if let Some(rule) = hours.get(day) {
            let start = (midnight + Ms::from(rule.start_minute) * MINUTE_MS).max(window.start);
            let end = (midnight + Ms::from(rule.end_minute) * MINUTE_MS).min(window.end);
            if start < end {
                spans.push(Span::from_bounds(start, end));
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    merge_overlapping(&spans)
}

/// Open hours net of blocked ranges. Advisory only; booking never requires it.
pub fn open_spans(ps: &ProviderState, window: &Span) -> Vec<Span> {
    let open = working_spans(&ps.hours, window);
    let blocked: Vec<Span> = ps
        .overlapping(window)
        .filter(|i| i.kind == IntervalKind::Blocked)
        .map(|i| i.span)
        .collect();
    if blocked.is_empty() {
        return open;
    }
    subtract_intervals(&open, &merge_overlapping(&blocked))
}

/// Whether `span` lies entirely inside declared open hours, net of blocks.
pub fn within_working_hours(ps: &ProviderState, span: &Span) -> bool {
    open_spans(ps, span).iter().any(|open| open.contains_span(span))
}

/// Free, bookable time in `window`: open hours minus every committed interval
/// widened by the provider buffer. Slots shorter than `min_duration` are dropped.
pub fn free_slots(ps: &ProviderState, window: &Span, min_duration: Ms) -> Vec<Span> {
    let buffer = ps.buffer_ms();
    let open = working_spans(&ps.hours, window);
    if open.is_empty() {
        return open;
    }
    // Intervals ending up to `buffer` before the window still shade its edge.
    let search = window.widen(buffer);
    let mut taken: Vec<Span> = ps.overlapping(&search).map(|i| i.span.widen(buffer)).collect();
    taken.sort_by_key(|s| s.start);
    let free = subtract_intervals(&open, &merge_overlapping(&taken));
    free.into_iter()
        .filter(|s| s.duration_ms() >= min_duration.max(1))
        .collect()
}

// ── Interval set arithmetic ───────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::from_bounds(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::from_bounds(current_start, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::DAY_MS;
    use ulid::Ulid;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    /// 2026-03-02T00:00:00Z, a Monday.
    const MONDAY: Ms = 1_772_409_600_000;

    fn span(start: Ms, end: Ms) -> Span {
        Span::new(start, end).unwrap()
    }

    fn nine_to_five(days: &[u8]) -> WeeklyHours {
        let mut hours = WeeklyHours::default();
        for &d in days {
            hours.0[usize::from(d)] = Some(DayRule {
                start_minute: 9 * 60,
                end_minute: 17 * 60,
            });
        }
        hours
    }

    fn provider(buffer_minutes: u32, hours: WeeklyHours) -> ProviderState {
        let settings = ProviderSettings {
            buffer_minutes,
            auto_confirm: false,
        };
        let mut ps = ProviderState::new(Ulid::new(), None, settings, 0);
        ps.hours = hours;
        ps
    }

    fn add(ps: &mut ProviderState, start: Ms, end: Ms, kind: IntervalKind) {
        ps.insert_interval(Interval {
            id: Ulid::new(),
            span: span(start, end),
            kind,
        });
    }

    // ── clock parsing ─────────────────────────────────────

    #[test]
    fn clock_round_trip() {
        assert_eq!(parse_clock("09:30").unwrap(), 570);
        assert_eq!(parse_clock("24:00").unwrap(), 1440);
        assert_eq!(parse_clock("17:00:00").unwrap(), 1020);
        assert_eq!(format_clock(570), "09:30");
        assert!(parse_clock("24:01").is_err());
        assert!(parse_clock("9").is_err());
        assert!(parse_clock("10:60").is_err());
        assert!(parse_clock("10:00:30").is_err());
    }

    #[test]
    fn day_rule_validation() {
        let ok = DayRule {
            start_minute: 540,
            end_minute: 1440,
        };
        assert!(validate_day_rule(3, &ok).is_ok());
        assert!(validate_day_rule(7, &ok).is_err());
        let inverted = DayRule {
            start_minute: 600,
            end_minute: 600,
        };
        assert!(validate_day_rule(1, &inverted).is_err());
    }

    // ── working hours ─────────────────────────────────────

    #[test]
    fn working_spans_follow_weekdays() {
        // Monday and Wednesday only.
        let hours = nine_to_five(&[1, 3]);
        let week = span(MONDAY, MONDAY + 7 * DAY_MS);
        let spans = working_spans(&hours, &week);
        assert_eq!(
            spans,
            vec![
                span(MONDAY + 9 * H, MONDAY + 17 * H),
                span(MONDAY + 2 * DAY_MS + 9 * H, MONDAY + 2 * DAY_MS + 17 * H),
            ]
        );
    }

    #[test]
    fn working_spans_clamped_to_window() {
        let hours = nine_to_five(&[1]);
        let spans = working_spans(&hours, &span(MONDAY + 12 * H, MONDAY + 13 * H));
        assert_eq!(spans, vec![span(MONDAY + 12 * H, MONDAY + 13 * H)]);
    }

    #[test]
    fn within_hours_respects_rules_and_blocks() {
        let mut ps = provider(0, nine_to_five(&[1]));
        assert!(within_working_hours(&ps, &span(MONDAY + 9 * H, MONDAY + 10 * H)));
        assert!(within_working_hours(&ps, &span(MONDAY + 16 * H, MONDAY + 17 * H)));
        assert!(!within_working_hours(&ps, &span(MONDAY + 16 * H, MONDAY + 18 * H)));
        // Tuesday is closed.
        assert!(!within_working_hours(&ps, &span(MONDAY + DAY_MS + 10 * H, MONDAY + DAY_MS + 11 * H)));

        add(&mut ps, MONDAY + 12 * H, MONDAY + 13 * H, IntervalKind::Blocked);
        assert!(!within_working_hours(&ps, &span(MONDAY + 11 * H + 30 * M, MONDAY + 12 * H + 30 * M)));
        // Appointments do not affect declared hours.
        add(&mut ps, MONDAY + 10 * H, MONDAY + 11 * H, IntervalKind::Appointment);
        assert!(within_working_hours(&ps, &span(MONDAY + 10 * H, MONDAY + 11 * H)));
    }

    #[test]
    fn full_day_rules_join_across_midnight() {
        let mut hours = WeeklyHours::default();
        for d in [1, 2] {
            hours.0[d] = Some(DayRule {
                start_minute: 0,
                end_minute: 1440,
            });
        }
        let ps = provider(0, hours);
        assert!(within_working_hours(&ps, &span(MONDAY + 23 * H, MONDAY + 25 * H)));
    }

    // ── free slots ────────────────────────────────────────

    #[test]
    fn free_slots_subtract_bookings_and_blocks() {
        let mut ps = provider(0, nine_to_five(&[1]));
        add(&mut ps, MONDAY + 10 * H, MONDAY + 11 * H, IntervalKind::Appointment);
        add(&mut ps, MONDAY + 13 * H, MONDAY + 14 * H, IntervalKind::Blocked);
        let free = free_slots(&ps, &span(MONDAY, MONDAY + DAY_MS), 0);
        assert_eq!(
            free,
            vec![
                span(MONDAY + 9 * H, MONDAY + 10 * H),
                span(MONDAY + 11 * H, MONDAY + 13 * H),
                span(MONDAY + 14 * H, MONDAY + 17 * H),
            ]
        );
    }

    #[test]
    fn free_slots_apply_buffer_and_min_duration() {
        let mut ps = provider(15, nine_to_five(&[1]));
        add(&mut ps, MONDAY + 10 * H, MONDAY + 11 * H, IntervalKind::Appointment);
        let free = free_slots(&ps, &span(MONDAY, MONDAY + DAY_MS), 0);
        assert_eq!(
            free,
            vec![
                span(MONDAY + 9 * H, MONDAY + 9 * H + 45 * M),
                span(MONDAY + 11 * H + 15 * M, MONDAY + 17 * H),
            ]
        );
        let long_only = free_slots(&ps, &span(MONDAY, MONDAY + DAY_MS), H);
        assert_eq!(long_only, vec![span(MONDAY + 11 * H + 15 * M, MONDAY + 17 * H)]);
    }

    #[test]
    fn free_slots_empty_when_closed() {
        let ps = provider(0, WeeklyHours::default());
        assert!(free_slots(&ps, &span(MONDAY, MONDAY + 7 * DAY_MS), 0).is_empty());
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![span(100, 200), span(300, 400)];
        let result = subtract_intervals(&base, &[span(200, 300)]);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        assert!(subtract_intervals(&[span(100, 200)], &[span(50, 250)]).is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        assert_eq!(subtract_intervals(&[span(100, 200)], &[span(50, 150)]), vec![span(150, 200)]);
        assert_eq!(subtract_intervals(&[span(100, 200)], &[span(150, 250)]), vec![span(100, 150)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let remove = vec![span(100, 200), span(400, 500), span(800, 900)];
        assert_eq!(
            subtract_intervals(&[span(0, 1000)], &remove),
            vec![span(0, 100), span(200, 400), span(500, 800), span(900, 1000)]
        );
    }

    #[test]
    fn subtract_one_remover_spanning_two_bases() {
        let base = vec![span(0, 100), span(200, 300)];
        assert_eq!(
            subtract_intervals(&base, &[span(50, 250)]),
            vec![span(0, 50), span(250, 300)]
        );
    }

    // ── merge_overlapping ─────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![span(100, 300), span(200, 400), span(500, 600)];
        assert_eq!(merge_overlapping(&spans), vec![span(100, 400), span(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![span(100, 200), span(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![span(100, 300)]);
    }
}
