//! Five-field cron expressions (`min hour dom mon dow`).
//!
//! Supports `*`, lists (`1,15`), ranges (`9-17`), steps (`*/5`, `10-40/10`)
//! and `7` as an alias for Sunday.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike};

use crate::{Error, Result};

/// How far ahead [`CronExpr::next_after`] looks. Covers leap-day schedules.
const MAX_SEARCH_YEARS: i32 = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: Field,
    hour: Field,
    dom: Field,
    month: Field,
    dow: Field,
}

/// Set of allowed values, one bit per value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// True when the field was written as (or expands to) the full range.
    wildcard: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts = expr.split_whitespace().collect::<Vec<_>>();
        if parts.len() != 5 {
            return Err(Error::Config(format!(
                "expected 5 cron fields, got {}",
                parts.len()
            )));
        }

        Ok(Self {
            source: parts.join(" "),
            minute: Field::parse(parts[0], 0, 59, false)?,
            hour: Field::parse(parts[1], 0, 23, false)?,
            dom: Field::parse(parts[2], 1, 31, false)?,
            month: Field::parse(parts[3], 1, 12, false)?,
            dow: Field::parse(parts[4], 0, 6, true)?,
        })
    }

    pub fn matches<Tz: TimeZone>(&self, dt: &DateTime<Tz>) -> bool {
        self.matches_naive(&dt.naive_local())
    }

    fn matches_naive(&self, t: &NaiveDateTime) -> bool {
        self.minute.contains(t.minute())
            && self.hour.contains(t.hour())
            && self.month.contains(t.month())
            && self.day_matches(t.date())
    }

    fn day_matches(&self, d: NaiveDate) -> bool {
        // When both day fields are restricted, either one matching is enough.
        let dom = self.dom.contains(d.day());
        let dow = self.dow.contains(d.weekday().num_days_from_sunday());
        match (self.dom.wildcard, self.dow.wildcard) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    /// First matching minute strictly after `now`, or `None` if nothing matches
    /// within [`MAX_SEARCH_YEARS`] (e.g. `0 0 31 2 *`).
    ///
    /// Matching happens on wall-clock time in `now`'s zone. A wall time that
    /// occurs twice (DST fall-back) resolves to the first instance after `now`;
    /// one skipped by a DST gap is skipped.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = now.timezone();
        let local = now.naive_local();
        let mut t = local.date().and_hms_opt(local.hour(), local.minute(), 0)? + Duration::minutes(1);
        let horizon = local.year() + MAX_SEARCH_YEARS;

        while t.year() <= horizon {
            if !self.month.contains(t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if self.minute.contains(t.minute()) {
                let found = tz
                    .from_local_datetime(&t)
                    .earliest()
                    .into_iter()
                    .chain(tz.from_local_datetime(&t).latest())
                    .find(|c| c > now);
                if found.is_some() {
                    return found;
                }
            }
            t += Duration::minutes(1);
        }
        None
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Field {
    fn parse(raw: &str, min: u32, max: u32, sunday_alias: bool) -> Result<Self> {
        let mut bits = 0u64;

        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .trim()
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid cron step: {step}")))?;
                    if step == 0 {
                        return Err(Error::Config("cron step must be > 0".to_string()));
                    }
                    (range.trim(), Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (
                    parse_value(a, min, max, sunday_alias)?,
                    parse_value(b, min, max, sunday_alias)?,
                )
            } else {
                let v = parse_value(range, min, max, sunday_alias)?;
                // `5/15` means "from 5 to the end, every 15".
                (v, if step.is_some() { max } else { v })
            };

            if start > end {
                return Err(Error::Config(format!("invalid cron range: {range}")));
            }

            let step = step.unwrap_or(1) as usize;
            for v in (start..=end).step_by(step) {
                bits |= 1 << v;
            }
        }

        if bits == 0 {
            return Err(Error::Config(format!("empty cron field: {raw:?}")));
        }

        let full = (min..=max).fold(0u64, |acc, v| acc | (1 << v));
        Ok(Self {
            bits,
            wildcard: bits == full,
        })
    }

    fn contains(&self, v: u32) -> bool {
        v < 64 && self.bits & (1 << v) != 0
    }
}

fn parse_value(s: &str, min: u32, max: u32, sunday_alias: bool) -> Result<u32> {
    let s = s.trim();
    let mut v: u32 = s
        .parse()
        .map_err(|_| Error::Config(format!("invalid cron value: {s}")))?;
    if sunday_alias && v == 7 {
        v = 0;
    }
    if v < min || v > max {
        return Err(Error::Config(format!(
            "cron value {v} out of range {min}-{max}"
        )));
    }
    Ok(v)
}
