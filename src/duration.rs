//! ISO-8601-like durations and the scheduler's notion of "now".
//!
//! A duration is a 7-tuple `(years, months, weeks, days, hours,
//! minutes, seconds)`. The string form is
//! `P[nY][nM][nW][nD][T[nH][nM][nS]]`; mixing `W` with any other date
//! component is rejected, mirroring `duration_create_from_string` in
//! the original `signer/src/shared/duration.c`.
//!
//! Converting a duration to seconds uses fixed approximations (a month
//! is 31 days, a year is 365 days) and warns exactly once per process
//! when that approximation is used — the original warns on every call,
//! which is log spam for a value collaborators often convert
//! repeatedly; this crate deliberately fires the warning once.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, Once};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;

use crate::error::DurationParseError;

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_HOUR: i64 = 3600;
const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_WEEK: i64 = SECS_PER_DAY * 7;
const SECS_PER_MONTH_APPROX: i64 = SECS_PER_DAY * 31;
const SECS_PER_YEAR_APPROX: i64 = SECS_PER_DAY * 365;

static APPROX_WARNED: Once = Once::new();

/// An ISO-8601-like duration, kept in its component form so it can be
/// re-serialized without loss (see [`Duration::to_string`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Duration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl Duration {
    pub fn new() -> Self {
        Duration::default()
    }

    /// Parse a string of the form `P[nY][nM][nW][nD][T[nH][nM][nS]]`.
    pub fn parse(s: &str) -> Result<Self, DurationParseError> {
        let err = || DurationParseError(s.to_string());

        let p_pos = s.find('P').ok_or_else(err)?;
        let body = &s[p_pos + 1..];
        let (date_part, time_part) = match body.find('T') {
            Some(i) => (&body[..i], Some(&body[i + 1..])),
            None => (body, None),
        };

        let date_tokens = tokenize(date_part, &['Y', 'M', 'W', 'D']).ok_or_else(err)?;
        let time_tokens = match time_part {
            Some(tp) => Some(tokenize(tp, &['H', 'M', 'S']).ok_or_else(err)?),
            None => None,
        };

        let has_weeks = date_tokens.iter().any(|&(_, c)| c == 'W');
        let has_other_date = date_tokens.iter().any(|&(_, c)| c != 'W');
        if has_weeks && (has_other_date || time_tokens.is_some()) {
            return Err(err());
        }

        let mut dur = Duration::new();
        for (n, letter) in date_tokens {
            match letter {
                'Y' => dur.years = n,
                'M' => dur.months = n,
                'W' => dur.weeks = n,
                'D' => dur.days = n,
                _ => unreachable!(),
            }
        }
        if let Some(tokens) = time_tokens {
            for (n, letter) in tokens {
                match letter {
                    'H' => dur.hours = n,
                    'M' => dur.minutes = n,
                    'S' => dur.seconds = n,
                    _ => unreachable!(),
                }
            }
        }

        Ok(dur)
    }

    /// Re-serialize to the canonical `P...T...` form.
    pub fn to_string(&self) -> String {
        let mut s = String::from("P");
        if self.years > 0 {
            s.push_str(&format!("{}Y", self.years));
        }
        if self.months > 0 {
            s.push_str(&format!("{}M", self.months));
        }
        if self.weeks > 0 {
            s.push_str(&format!("{}W", self.weeks));
        }
        if self.days > 0 {
            s.push_str(&format!("{}D", self.days));
        }
        let has_time = self.hours > 0 || self.minutes > 0 || self.seconds > 0 || !self.has_date();
        if has_time {
            s.push('T');
            if self.hours > 0 {
                s.push_str(&format!("{}H", self.hours));
            }
            if self.minutes > 0 {
                s.push_str(&format!("{}M", self.minutes));
            }
            if self.seconds > 0 || (!self.has_date() && self.hours == 0 && self.minutes == 0) {
                s.push_str(&format!("{}S", self.seconds));
            }
        }
        s
    }

    fn has_date(&self) -> bool {
        self.years > 0 || self.months > 0 || self.weeks > 0 || self.days > 0
    }

    /// Convert to a number of seconds, using fixed approximations for
    /// months (31 days) and years (365 days). Warns once per process
    /// when the approximation is actually exercised.
    pub fn to_seconds(&self) -> i64 {
        let mut total: i64 = 0;
        total += self.seconds as i64;
        total += self.minutes as i64 * SECS_PER_MINUTE;
        total += self.hours as i64 * SECS_PER_HOUR;
        total += self.days as i64 * SECS_PER_DAY;
        total += self.weeks as i64 * SECS_PER_WEEK;
        total += self.months as i64 * SECS_PER_MONTH_APPROX;
        total += self.years as i64 * SECS_PER_YEAR_APPROX;

        if self.months > 0 || self.years > 0 {
            let rendered = self.to_string();
            APPROX_WARNED.call_once(|| {
                tracing::warn!(duration = %rendered, "converting duration to approximate value");
            });
        }
        total
    }
}

/// Split a run of `(digits)(letter)` pairs, e.g. `"1Y2M3D"`, into
/// `[(1, 'Y'), (2, 'M'), (3, 'D')]`. Returns `None` if the string isn't
/// entirely consumed by such pairs, or a letter outside `allowed`
/// appears. An empty string tokenizes to an empty (valid) list.
fn tokenize(s: &str, allowed: &[char]) -> Option<Vec<(u32, char)>> {
    let mut tokens = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let digit_len = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digit_len == 0 {
            return None;
        }
        let (digits, tail) = rest.split_at(digit_len);
        let mut chars = tail.chars();
        let letter = chars.next()?;
        if !allowed.contains(&letter) {
            return None;
        }
        let n: u32 = digits.parse().ok()?;
        tokens.push((n, letter));
        rest = chars.as_str();
    }
    Some(tokens)
}

pub fn time_minimum(a: i64, b: i64) -> i64 {
    a.min(b)
}

pub fn time_maximum(a: i64, b: i64) -> i64 {
    a.max(b)
}

/// Render a Unix timestamp as `YYYY-MM-DD HH:MM:SS UTC`, the
/// dependency-free equivalent of `ctime_r` used by
/// `schedule_describetask` in the original (which additionally strips
/// the trailing newline `ctime_r` leaves behind; this format has
/// none to strip).
pub fn format_unix(t: i64) -> String {
    const MDAYS: [i64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let is_leap = |y: i64| y % 4 == 0 && (y % 100 != 0 || y % 400 == 0);

    let mut days = t.div_euclid(SECS_PER_DAY);
    let mut secs_of_day = t.rem_euclid(SECS_PER_DAY);
    let hour = secs_of_day / SECS_PER_HOUR;
    secs_of_day -= hour * SECS_PER_HOUR;
    let minute = secs_of_day / SECS_PER_MINUTE;
    let second = secs_of_day - minute * SECS_PER_MINUTE;

    let mut year = 1970i64;
    loop {
        let year_days = if is_leap(year) { 366 } else { 365 };
        if days >= year_days {
            days -= year_days;
            year += 1;
        } else if days < 0 {
            year -= 1;
            days += if is_leap(year) { 366 } else { 365 };
        } else {
            break;
        }
    }
    let mut month = 0usize;
    loop {
        let mlen = MDAYS[month] + if month == 1 && is_leap(year) { 1 } else { 0 };
        if days >= mlen {
            days -= mlen;
            month += 1;
        } else {
            break;
        }
    }
    let day = days + 1;

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        year,
        month + 1,
        day,
        hour,
        minute,
        second
    )
}

const TIMESHIFT_ENV: &str = "ENFORCER_TIMESHIFT";

/// Wall-clock seconds since the epoch, unless `ENFORCER_TIMESHIFT` is
/// set to a `YYYYMMDDHHMMSS` literal, in which case that instant is
/// returned instead — deterministic tests pin the clock this way.
pub fn now() -> i64 {
    let wall = match std::env::var(TIMESHIFT_ENV) {
        Ok(val) => match parse_timeshift(&val) {
            Some(t) => t,
            None => real_now(),
        },
        Err(_) => real_now(),
    };
    record_observation(wall);
    wall
}

fn real_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse a `YYYYMMDDHHMMSS` literal into Unix seconds (UTC), matching
/// `timeshift2time`/`mktime_from_utc` in the original.
fn parse_timeshift(s: &str) -> Option<i64> {
    if s.len() != 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i64 = s[0..4].parse().ok()?;
    let month: i64 = s[4..6].parse().ok()?;
    let day: i64 = s[6..8].parse().ok()?;
    let hour: i64 = s[8..10].parse().ok()?;
    let minute: i64 = s[10..12].parse().ok()?;
    let second: i64 = s[12..14].parse().ok()?;

    const MDAYS: [i64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let is_leap = |y: i64| y % 4 == 0 && (y % 100 != 0 || y % 400 == 0);
    let leap_days = |y1: i64, y2: i64| -> i64 {
        let (y1, y2) = (y1 - 1, y2 - 1);
        (y2 / 4 - y1 / 4) - (y2 / 100 - y1 / 100) + (y2 / 400 - y1 / 400)
    };

    let mut days = 365 * (year - 1970) + leap_days(1970, year);
    for m in 0..(month - 1) {
        days += MDAYS[m as usize];
    }
    if month > 2 && is_leap(year) {
        days += 1;
    }
    days += day - 1;

    let hours = days * 24 + hour;
    let minutes = hours * 60 + minute;
    Some(minutes * 60 + second)
}

// --- clock leap detection -------------------------------------------------
//
// `time_leaped()` lets callers skip a sleep after a large clock jump
// (e.g. an NTP step, or a test flipping `ENFORCER_TIMESHIFT`). A leap
// is a discontinuity in the *wall* clock relative to the *monotonic*
// clock: we track both readings from the previous call to `now()` and
// compare how far each has advanced since. A worker that legitimately
// sleeps out a long `pop_due` timeout (up to 3600s, the common case for
// this mostly-idle daemon) advances both clocks in step and is not a
// leap; an NTP step or a test flipping `ENFORCER_TIMESHIFT` advances
// only the wall clock and is.
const LEAP_THRESHOLD_SECS: i64 = 30;

lazy_static! {
    static ref LAST_OBSERVATION: Mutex<Option<(i64, Instant)>> = Mutex::new(None);
}
static LEAP_FLAG: AtomicI64 = AtomicI64::new(0);

fn record_observation(wall: i64) {
    let mono_now = Instant::now();
    let mut last = LAST_OBSERVATION.lock().unwrap();
    if let Some((last_wall, last_mono)) = *last {
        let wall_elapsed = wall - last_wall;
        let mono_elapsed = mono_now.duration_since(last_mono).as_secs() as i64;
        if (wall_elapsed - mono_elapsed).abs() > LEAP_THRESHOLD_SECS {
            LEAP_FLAG.store(1, Ordering::SeqCst);
        }
    }
    *last = Some((wall, mono_now));
}

/// Returns true if the most recent call to [`now`] observed a clock
/// discontinuity larger than the threshold since the previous call.
/// Cleared by [`clear_leap`]; callers that react to a leap by skipping
/// exactly one wait (see `Scheduler::pop_due`) must clear it once
/// consumed, or every subsequent wait is skipped forever.
pub fn time_leaped() -> bool {
    LEAP_FLAG.load(Ordering::SeqCst) != 0
}

/// Reset the leap flag. Called by a worker (or the scheduler on its
/// behalf) once it has reacted to a leap by skipping a single wait —
/// the flag marks a one-shot discontinuity, not a standing condition.
pub fn clear_leap() {
    LEAP_FLAG.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_duration() {
        let d = Duration::parse("P1Y2M3DT4H5M6S").unwrap();
        assert_eq!(d.years, 1);
        assert_eq!(d.months, 2);
        assert_eq!(d.days, 3);
        assert_eq!(d.hours, 4);
        assert_eq!(d.minutes, 5);
        assert_eq!(d.seconds, 6);
    }

    #[test]
    fn parses_weeks_alone() {
        let d = Duration::parse("P3W").unwrap();
        assert_eq!(d.weeks, 3);
        assert_eq!(d.days, 0);
    }

    #[test]
    fn rejects_weeks_mixed_with_days() {
        assert!(Duration::parse("P3W2D").is_err());
    }

    #[test]
    fn rejects_missing_p() {
        assert!(Duration::parse("1Y2M").is_err());
    }

    #[test]
    fn round_trips_canonical_form() {
        for s in ["P1Y2M3DT4H5M6S", "P3W", "PT30S", "P1D"] {
            let d = Duration::parse(s).unwrap();
            let back = Duration::parse(&d.to_string()).unwrap();
            assert_eq!(d, back);
        }
    }

    #[test]
    fn seconds_use_fixed_approximations() {
        let d = Duration::parse("P1Y").unwrap();
        assert_eq!(d.to_seconds(), SECS_PER_YEAR_APPROX);
        let d = Duration::parse("P1M").unwrap();
        assert_eq!(d.to_seconds(), SECS_PER_MONTH_APPROX);
    }

    #[test]
    fn plain_seconds_duration() {
        let d = Duration::parse("PT45S").unwrap();
        assert_eq!(d.to_seconds(), 45);
    }
}
