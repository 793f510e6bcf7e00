//! Property-based tests for interval arithmetic and recurrence expansion.

use chrono::{DateTime, Datelike, Weekday};
use proptest::prelude::*;

use slotd::engine::{merge_overlapping, subtract_intervals, RecurrenceRule};
use slotd::limits::{MAX_RECURRENCE_HORIZON_MS, MAX_SERIES_INSTANCES};
use slotd::model::{Ms, Span};

/// 2030-01-01T00:00:00Z.
const BASE: Ms = 1_893_456_000_000;
const MINUTE: Ms = 60_000;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Small spans on a minute grid so overlaps are common.
fn arb_span() -> impl Strategy<Value = Span> {
    (0i64..200, 1i64..40).prop_map(|(start, len)| {
        Span::new(BASE + start * MINUTE, BASE + (start + len) * MINUTE).unwrap()
    })
}

/// Sorted, disjoint spans as the engine keeps them.
fn arb_disjoint() -> impl Strategy<Value = Vec<Span>> {
    prop::collection::vec(arb_span(), 0..12).prop_map(|mut spans| {
        spans.sort_by_key(|s| (s.start, s.end));
        merge_overlapping(&spans)
    })
}

fn arb_byday() -> impl Strategy<Value = Vec<&'static str>> {
    prop::sample::subsequence(vec!["SU", "MO", "TU", "WE", "TH", "FR", "SA"], 1..=7)
}

fn arb_rule() -> impl Strategy<Value = String> {
    let termination = prop_oneof![
        (1u32..=60).prop_map(|n| format!(";COUNT={n}")),
        // Always on or after any generated seed date.
        (0u32..=400).prop_map(|days| {
            let date = DateTime::from_timestamp_millis(BASE + 731 * 86_400_000)
                .unwrap()
                .date_naive()
                + chrono::Days::new(u64::from(days));
            format!(";UNTIL={}", date.format("%Y-%m-%d"))
        }),
        Just(String::new()),
    ];
    let freq = prop_oneof![
        Just("FREQ=DAILY".to_string()),
        Just("FREQ=MONTHLY".to_string()),
        arb_byday().prop_map(|days| format!("FREQ=WEEKLY;BYDAY={}", days.join(","))),
    ];
    (freq, termination).prop_map(|(f, t)| format!("{f}{t}"))
}

/// Seed somewhere in 2031, 15-120 minutes long.
fn arb_seed() -> impl Strategy<Value = Span> {
    (0i64..365 * 24 * 4, 1i64..=8).prop_map(|(quarter_hours, len)| {
        let start = BASE + 365 * 86_400_000 + quarter_hours * 15 * MINUTE;
        Span::new(start, start + len * 15 * MINUTE).unwrap()
    })
}

fn covered(spans: &[Span], t: Ms) -> bool {
    spans.iter().any(|s| s.start <= t && t < s.end)
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Sun => "SU",
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
    }
}

// ---------------------------------------------------------------------------
// Interval arithmetic
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn merge_yields_sorted_disjoint_cover(spans in prop::collection::vec(arb_span(), 0..16)) {
        let mut sorted = spans.clone();
        sorted.sort_by_key(|s| (s.start, s.end));
        let merged = merge_overlapping(&sorted);

        for pair in merged.windows(2) {
            // Adjacent spans are folded together too.
            prop_assert!(pair[0].end < pair[1].start);
        }
        for minute in 0..260 {
            let t = BASE + minute * MINUTE;
            prop_assert_eq!(covered(&merged, t), covered(&spans, t));
        }
    }

    #[test]
    fn subtract_matches_pointwise_difference(base in arb_disjoint(), remove in arb_disjoint()) {
        let result = subtract_intervals(&base, &remove);

        for span in &result {
            prop_assert!(span.start < span.end);
        }
        for pair in result.windows(2) {
            prop_assert!(pair[0].end <= pair[1].start);
        }
        for minute in 0..260 {
            let t = BASE + minute * MINUTE;
            prop_assert_eq!(covered(&result, t), covered(&base, t) && !covered(&remove, t));
        }
    }

    #[test]
    fn subtracting_nothing_is_identity(base in arb_disjoint()) {
        prop_assert_eq!(subtract_intervals(&base, &[]), base);
    }

    #[test]
    fn buffered_overlap_is_symmetric(a in arb_span(), b in arb_span(), buffer in 0i64..120) {
        let buffer = buffer * MINUTE;
        prop_assert_eq!(a.overlaps_with_buffer(&b, buffer), b.overlaps_with_buffer(&a, buffer));
        if a.overlaps(&b) {
            prop_assert!(a.overlaps_with_buffer(&b, buffer));
        }
    }

    #[test]
    fn buffer_demands_gap(a in arb_span(), gap in 0i64..60, buffer in 0i64..60) {
        let start = a.end + gap * MINUTE;
        let b = Span::new(start, start + 30 * MINUTE).unwrap();
        prop_assert_eq!(a.overlaps_with_buffer(&b, buffer * MINUTE), gap < buffer);
    }
}

// ---------------------------------------------------------------------------
// Recurrence expansion
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn expansion_is_bounded_and_ordered(rule in arb_rule(), seed in arb_seed()) {
        let rule: RecurrenceRule = rule.parse().unwrap();
        let instances: Vec<Span> = rule.expand(seed).unwrap().collect();

        prop_assert!(instances.len() <= MAX_SERIES_INSTANCES as usize);
        for span in &instances {
            prop_assert!(span.start >= seed.start);
            prop_assert!(span.start <= seed.start + MAX_RECURRENCE_HORIZON_MS);
            prop_assert_eq!(span.duration_ms(), seed.duration_ms());
        }
        for pair in instances.windows(2) {
            prop_assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn count_is_honoured(count in 1u32..=60, seed in arb_seed()) {
        let rule: RecurrenceRule = format!("FREQ=DAILY;COUNT={count}").parse().unwrap();
        prop_assert_eq!(rule.expand(seed).unwrap().count(), count as usize);
    }

    #[test]
    fn weekly_instances_land_on_listed_days(days in arb_byday(), seed in arb_seed()) {
        let rule: RecurrenceRule = format!("FREQ=WEEKLY;BYDAY={};COUNT=20", days.join(","))
            .parse()
            .unwrap();
        for span in rule.expand(seed).unwrap() {
            let date = DateTime::from_timestamp_millis(span.start).unwrap();
            prop_assert!(days.contains(&weekday_code(date.weekday())));
            prop_assert_eq!(span.start % 86_400_000, seed.start % 86_400_000);
        }
    }

    #[test]
    fn rule_text_round_trips(rule in arb_rule()) {
        let parsed: RecurrenceRule = rule.parse().unwrap();
        let again: RecurrenceRule = parsed.to_string().parse().unwrap();
        prop_assert_eq!(parsed, again);
    }
}
