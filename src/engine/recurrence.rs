//! Recurrence expansion: seed interval + rule → ordered candidate intervals.
//!
//! Expansion is pure and bounded. [`Occurrences`] is a lazy, cloneable
//! iterator so callers can conflict-check and commit one instance at a time
//! and restart from a clone if they need to.
//!
//! Calendar arithmetic is done on UTC dates; each instance keeps the seed's
//! time of day and duration.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::limits::{DAY_MS, MAX_RECURRENCE_HORIZON_MS, MAX_SERIES_INSTANCES};
use crate::model::{Ms, Span};

use super::EngineError;

/// `NaiveDate::num_days_from_ce()` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// UTC calendar date containing `ms`, plus the offset into that day.
pub(crate) fn utc_date(ms: Ms) -> Option<(NaiveDate, Ms)> {
    let days = ms.div_euclid(DAY_MS);
    let date = i32::try_from(days + UNIX_EPOCH_DAYS_FROM_CE)
        .ok()
        .and_then(NaiveDate::from_num_days_from_ce_opt)?;
    Some((date, ms.rem_euclid(DAY_MS)))
}

/// Instant of 00:00 UTC on `date`.
pub(crate) fn midnight_ms(date: NaiveDate) -> Ms {
    (i64::from(date.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE) * DAY_MS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
        }
    }
}

/// Bit `d` set means weekday `d` is included (0 = Sunday .. 6 = Saturday).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const EMPTY: Self = Self(0);

    /// Build from day numbers, 0 = Sunday .. 6 = Saturday.
    pub fn from_days(days: &[u8]) -> Result<Self, EngineError> {
        let mut bits = 0u8;
        for &d in days {
            if d > 6 {
                return Err(EngineError::Validation(format!(
                    "day of week must be 0-6, got {d}"
                )));
            }
            bits |= 1 << d;
        }
        Ok(Self(bits))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Included weekdays, Sunday first.
    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ]
        .into_iter()
        .filter(|d| self.contains(*d))
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .fold(0u8, |bits, d| bits | 1 << d.num_days_from_sunday()),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Termination {
    /// Clamped to `MAX_SERIES_INSTANCES` at expansion time.
    Never,
    /// Last date (inclusive) on which an instance may start.
    OnDate(NaiveDate),
    /// Total instances, the seed included when it matches the rule.
    AfterCount(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub weekdays: WeekdaySet,
    pub termination: Termination,
}

impl RecurrenceRule {
    pub fn daily(termination: Termination) -> Self {
        Self {
            frequency: Frequency::Daily,
            weekdays: WeekdaySet::EMPTY,
            termination,
        }
    }

    pub fn weekly(weekdays: WeekdaySet, termination: Termination) -> Self {
        Self {
            frequency: Frequency::Weekly,
            weekdays,
            termination,
        }
    }

    pub fn monthly(termination: Termination) -> Self {
        Self {
            frequency: Frequency::Monthly,
            weekdays: WeekdaySet::EMPTY,
            termination,
        }
    }

    /// Seed-independent checks.
    pub fn validate(&self) -> Result<(), EngineError> {
        match (self.frequency, self.weekdays.is_empty()) {
            (Frequency::Weekly, true) => {
                return Err(EngineError::Validation(
                    "weekly recurrence needs at least one weekday".into(),
                ));
            }
            (Frequency::Daily | Frequency::Monthly, false) => {
                return Err(EngineError::Validation(format!(
                    "weekdays only apply to weekly recurrence, not {}",
                    self.frequency.as_str()
                )));
            }
            _ => {}
        }
        match self.termination {
            Termination::AfterCount(0) => Err(EngineError::Validation(
                "recurrence count must be at least 1".into(),
            )),
            Termination::AfterCount(n) if n > MAX_SERIES_INSTANCES => {
                Err(EngineError::LimitExceeded("too many recurrence instances"))
            }
            _ => Ok(()),
        }
    }

    /// Lazily expand the rule from `seed`.
    ///
    /// For weekly rules the seed itself is only an instance if its weekday is
    /// in the set; otherwise the first instance is the next matching day.
    pub fn expand(&self, seed: Span) -> Result<Occurrences, EngineError> {
        self.validate()?;
        let (seed_date, time_of_day) = utc_date(seed.start)
            .ok_or_else(|| EngineError::Validation("seed start out of calendar range".into()))?;

        let (limit, until) = match self.termination {
            Termination::Never => (MAX_SERIES_INSTANCES, None),
            Termination::AfterCount(n) => (n, None),
            Termination::OnDate(date) => {
                if date < seed_date {
                    return Err(EngineError::Validation(format!(
                        "recurrence end date {date} is before the seed date {seed_date}"
                    )));
                }
                (MAX_SERIES_INSTANCES, Some(date))
            }
        };

        Ok(Occurrences {
            duration: seed.duration_ms(),
            seed_date,
            time_of_day,
            frequency: self.frequency,
            weekdays: self.weekdays,
            until,
            limit,
            horizon_end: seed.start + MAX_RECURRENCE_HORIZON_MS,
            step: 0,
            emitted: 0,
            done: false,
        })
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FREQ={}", self.frequency.as_str())?;
        if !self.weekdays.is_empty() {
            let days: Vec<&str> = self.weekdays.iter().map(byday_code).collect();
            write!(f, ";BYDAY={}", days.join(","))?;
        }
        match self.termination {
            Termination::Never => Ok(()),
            Termination::AfterCount(n) => write!(f, ";COUNT={n}"),
            Termination::OnDate(date) => write!(f, ";UNTIL={}", date.format("%Y-%m-%d")),
        }
    }
}

/// `FREQ=DAILY|WEEKLY|MONTHLY[;BYDAY=MO,WE][;COUNT=n|;UNTIL=YYYY-MM-DD]`
impl FromStr for RecurrenceRule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |msg: String| EngineError::Validation(format!("recurrence {s:?}: {msg}"));

        let mut frequency = None;
        let mut weekdays = WeekdaySet::EMPTY;
        let mut count = None;
        let mut until = None;

        for part in s.trim().trim_start_matches("RRULE:").split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| bad(format!("expected KEY=VALUE, got {part:?}")))?;
            match key.trim().to_ascii_uppercase().as_str() {
                "FREQ" => {
                    frequency = Some(match value.trim().to_ascii_uppercase().as_str() {
                        "DAILY" => Frequency::Daily,
                        "WEEKLY" => Frequency::Weekly,
                        "MONTHLY" => Frequency::Monthly,
                        other => return Err(bad(format!("unsupported frequency {other}"))),
                    });
                }
                "BYDAY" => {
                    weekdays = value
                        .split(',')
                        .map(|code| parse_byday(code.trim()).ok_or_else(|| bad(format!("bad weekday {code:?}"))))
                        .collect::<Result<WeekdaySet, _>>()?;
                }
                "COUNT" => {
                    count = Some(
                        value
                            .trim()
                            .parse::<u32>()
                            .map_err(|e| bad(format!("bad COUNT: {e}")))?,
                    );
                }
                "UNTIL" => until = Some(parse_until(value.trim()).ok_or_else(|| bad(format!("bad UNTIL {value:?}")))?),
                other => return Err(bad(format!("unsupported part {other}"))),
            }
        }

        let termination = match (count, until) {
            (Some(_), Some(_)) => return Err(bad("COUNT and UNTIL are mutually exclusive".into())),
            (Some(n), None) => Termination::AfterCount(n),
            (None, Some(date)) => Termination::OnDate(date),
            (None, None) => Termination::Never,
        };
        let rule = RecurrenceRule {
            frequency: frequency.ok_or_else(|| bad("missing FREQ".into()))?,
            weekdays,
            termination,
        };
        rule.validate()?;
        Ok(rule)
    }
}

fn byday_code(day: Weekday) -> &'static str {
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

fn parse_byday(code: &str) -> Option<Weekday> {
    match code.to_ascii_uppercase().as_str() {
        "SU" => Some(Weekday::Sun),
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        _ => None,
    }
}

/// Accepts `YYYY-MM-DD` or the iCalendar `YYYYMMDD[THHMMSS[Z]]` form.
fn parse_until(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(value.get(..8)?, "%Y%m%d").ok())
}

/// Lazy, finite sequence of candidate intervals for one series.
#[derive(Debug, Clone)]
pub struct Occurrences {
    duration: Ms,
    seed_date: NaiveDate,
    time_of_day: Ms,
    frequency: Frequency,
    weekdays: WeekdaySet,
    until: Option<NaiveDate>,
    limit: u32,
    horizon_end: Ms,
    step: u32,
    emitted: u32,
    done: bool,
}

enum Step {
    Date(NaiveDate),
    /// No such calendar date (e.g. the 31st in a 30-day month).
    Skip,
    Exhausted,
}

impl Occurrences {
    fn date_for_step(&self, step: u32) -> Step {
        match self.frequency {
            Frequency::Daily | Frequency::Weekly => self
                .seed_date
                .checked_add_days(chrono::Days::new(u64::from(step)))
                .map_or(Step::Exhausted, Step::Date),
            Frequency::Monthly => {
                let Some(month_start) = self
                    .seed_date
                    .with_day(1)
                    .and_then(|d| d.checked_add_months(Months::new(step)))
                else {
                    return Step::Exhausted;
                };
                if midnight_ms(month_start) > self.horizon_end {
                    return Step::Exhausted;
                }
                NaiveDate::from_ymd_opt(month_start.year(), month_start.month(), self.seed_date.day())
                    .map_or(Step::Skip, Step::Date)
            }
        }
    }
}

impl Iterator for Occurrences {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        while !self.done {
            if self.emitted >= self.limit {
                self.done = true;
                break;
            }
            let step = self.step;
            self.step += 1;

            let date = match self.date_for_step(step) {
                Step::Date(date) => date,
                Step::Skip => continue,
                Step::Exhausted => {
                    self.done = true;
                    break;
                }
            };
            if self.until.is_some_and(|until| date > until) {
                self.done = true;
                break;
            }
            let start = midnight_ms(date) + self.time_of_day;
            if start > self.horizon_end {
                self.done = true;
                break;
            }
            if self.frequency == Frequency::Weekly && !self.weekdays.contains(date.weekday()) {
                continue;
            }
            self.emitted += 1;
            return Some(Span::from_bounds(start, start + self.duration));
        }
        None
    }
}
