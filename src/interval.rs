//! Weekly embargo intervals.
//!
//! A `WeeklyInterval` covers a closed span of the week. The invariant is
//! `from_weekday <= to_weekday`; a wrap-around interval (say Friday evening
//! to Monday morning) is stored as its complement with the coverage test
//! inverted.

use anyhow::{Context, Result, bail};
use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyInterval {
    from_weekday: Weekday,
    from_time: NaiveTime,
    to_weekday: Weekday,
    to_time: NaiveTime,
    is_complement: bool,
}

impl WeeklyInterval {
    pub fn new(
        from_weekday: Weekday,
        from_time: NaiveTime,
        to_weekday: Weekday,
        to_time: NaiveTime,
    ) -> WeeklyInterval {
        let is_complement =
            from_weekday.num_days_from_monday() > to_weekday.num_days_from_monday();
        if is_complement {
            WeeklyInterval {
                from_weekday: to_weekday,
                from_time: to_time,
                to_weekday: from_weekday,
                to_time: from_time,
                is_complement,
            }
        } else {
            WeeklyInterval {
                from_weekday,
                from_time,
                to_weekday,
                to_time,
                is_complement,
            }
        }
    }

    /// Parse `"<Day>@<HH:MM[:SS]>[ TZ]-<Day>@<HH:MM[:SS]>[ TZ]"`. Day names
    /// are case-insensitive, full or three-letter. Only the `UTC`
    /// designator is accepted; instants handed to [`WeeklyInterval::covers`]
    /// are expected in UTC as well.
    pub fn from_human(spec: &str) -> Result<WeeklyInterval> {
        let (from, to) = spec
            .split_once('-')
            .with_context(|| format!("interval {spec:?} has no `-` separator"))?;
        let (from_weekday, from_time) = parse_endpoint(from)?;
        let (to_weekday, to_time) = parse_endpoint(to)?;
        Ok(WeeklyInterval::new(
            from_weekday,
            from_time,
            to_weekday,
            to_time,
        ))
    }

    pub fn covers(&self, instant: NaiveDateTime) -> bool {
        self.stored_covers(instant) != self.is_complement
    }

    fn stored_covers(&self, instant: NaiveDateTime) -> bool {
        let weekday = instant.weekday().num_days_from_monday();
        let time = instant.time();
        let from_weekday = self.from_weekday.num_days_from_monday();
        let to_weekday = self.to_weekday.num_days_from_monday();
        // The stored span is closed; when it represents the complement, the
        // boundary instants must count as outside it, hence the non-strict
        // comparison.
        let before = |earlier: NaiveTime, later: NaiveTime| {
            if self.is_complement {
                earlier <= later
            } else {
                earlier < later
            }
        };

        if !(from_weekday <= weekday && weekday <= to_weekday) {
            return false;
        }
        if from_weekday == weekday && before(time, self.from_time) {
            return false;
        }
        if to_weekday == weekday && before(self.to_time, time) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalUnion {
    intervals: Vec<WeeklyInterval>,
}

impl IntervalUnion {
    pub fn empty() -> IntervalUnion {
        IntervalUnion::default()
    }

    /// Comma-separated list of [`WeeklyInterval::from_human`] specs.
    pub fn from_human(spec: &str) -> Result<IntervalUnion> {
        let intervals = spec
            .split(',')
            .map(WeeklyInterval::from_human)
            .collect::<Result<Vec<_>>>()?;
        Ok(IntervalUnion { intervals })
    }

    pub fn covers(&self, instant: NaiveDateTime) -> bool {
        self.intervals
            .iter()
            .any(|interval| interval.covers(instant))
    }
}

fn parse_endpoint(part: &str) -> Result<(Weekday, NaiveTime)> {
    let normalized = part.replace('@', " ");
    let mut pieces = normalized.split_whitespace();
    let day = pieces
        .next()
        .with_context(|| format!("interval endpoint {part:?} has no day"))?;
    let time = pieces
        .next()
        .with_context(|| format!("interval endpoint {part:?} has no time"))?;
    if let Some(zone) = pieces.next() {
        if !zone.eq_ignore_ascii_case("utc") {
            bail!("unsupported time zone {zone:?}; only UTC is supported");
        }
    }
    if pieces.next().is_some() {
        bail!("trailing garbage in interval endpoint {part:?}");
    }
    Ok((find_weekday(day)?, parse_time(time)?))
}

fn find_weekday(name: &str) -> Result<Weekday> {
    let lowered = name.to_ascii_lowercase();
    let days = [
        ("monday", Weekday::Mon),
        ("tuesday", Weekday::Tue),
        ("wednesday", Weekday::Wed),
        ("thursday", Weekday::Thu),
        ("friday", Weekday::Fri),
        ("saturday", Weekday::Sat),
        ("sunday", Weekday::Sun),
    ];
    days.iter()
        .find(|(full, _)| lowered == *full || lowered == full[..3])
        .map(|(_, day)| *day)
        .with_context(|| format!("not a week day: {name:?}"))
}

fn parse_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .with_context(|| format!("not a time of day: {raw:?}"))
}
