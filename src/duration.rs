use std::{fmt, str::FromStr};

use crate::error::{CalendarError, Result};

pub const MILLIS_PER_SECOND: i64 = 1000;
pub const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
pub const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
pub const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;
pub const MILLIS_PER_WEEK: i64 = 7 * MILLIS_PER_DAY;

/// A signed calendar-relative offset, as found in DURATION and TRIGGER
/// values.
///
/// A duration holds either weeks, or some combination of days, hours,
/// minutes and seconds. Never both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ParsedDuration {
    negative: bool,
    weeks: u32,
    days: u32,
    hours: u32,
    minutes: u32,
    seconds: u32,
}

impl ParsedDuration {
    pub fn new(
        negative: bool,
        weeks: u32,
        days: u32,
        hours: u32,
        minutes: u32,
        seconds: u32,
    ) -> Result<ParsedDuration> {
        if weeks != 0 && (days != 0 || hours != 0 || minutes != 0 || seconds != 0) {
            return Err(CalendarError::parse(
                "duration",
                &format!("{}W{}D{}H{}M{}S", weeks, days, hours, minutes, seconds),
                "weeks can't be combined with other fields",
            ));
        }

        Ok(ParsedDuration {
            negative,
            weeks,
            days,
            hours,
            minutes,
            seconds,
        })
    }

    pub fn from_weeks(weeks: u32) -> ParsedDuration {
        ParsedDuration {
            weeks,
            ..ParsedDuration::default()
        }
    }

    pub fn from_days(days: u32) -> ParsedDuration {
        ParsedDuration {
            days,
            ..ParsedDuration::default()
        }
    }

    pub fn from_seconds(seconds: u32) -> ParsedDuration {
        ParsedDuration {
            seconds,
            ..ParsedDuration::default()
        }
    }

    /// Build a duration from a millisecond delta. Exact multiples of a week
    /// come out in the weeks form; anything else is split into days, hours,
    /// minutes and seconds. Sub-second remainders are dropped.
    pub fn from_millis(millis: i64) -> ParsedDuration {
        let negative = millis < 0;
        let abs = millis.checked_abs().unwrap_or(i64::MAX);

        if abs != 0 && abs % MILLIS_PER_WEEK == 0 {
            return ParsedDuration {
                negative,
                weeks: (abs / MILLIS_PER_WEEK) as u32,
                ..ParsedDuration::default()
            };
        }

        let days = abs / MILLIS_PER_DAY;
        let rem = abs % MILLIS_PER_DAY;

        ParsedDuration {
            negative: negative && abs >= MILLIS_PER_SECOND,
            weeks: 0,
            days: days as u32,
            hours: (rem / MILLIS_PER_HOUR) as u32,
            minutes: (rem % MILLIS_PER_HOUR / MILLIS_PER_MINUTE) as u32,
            seconds: (rem % MILLIS_PER_MINUTE / MILLIS_PER_SECOND) as u32,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn weeks(&self) -> u32 {
        self.weeks
    }

    pub fn days(&self) -> u32 {
        self.days
    }

    pub fn hours(&self) -> u32 {
        self.hours
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn is_zero(&self) -> bool {
        self.weeks == 0 && self.days == 0 && self.hours == 0 && self.minutes == 0 && self.seconds == 0
    }

    pub fn negate(&self) -> ParsedDuration {
        ParsedDuration {
            negative: !self.negative,
            ..*self
        }
    }

    /// Whole days in the duration, counting weeks as seven days.
    pub fn signed_days(&self) -> i64 {
        let days = self.weeks as i64 * 7 + self.days as i64;
        if self.negative {
            -days
        } else {
            days
        }
    }

    /// The hour/minute/second part in milliseconds, signed.
    pub fn signed_time_millis(&self) -> i64 {
        let millis = self.hours as i64 * MILLIS_PER_HOUR
            + self.minutes as i64 * MILLIS_PER_MINUTE
            + self.seconds as i64 * MILLIS_PER_SECOND;
        if self.negative {
            -millis
        } else {
            millis
        }
    }

    /// Length in milliseconds, with every day counted as 24 hours.
    pub fn as_millis(&self) -> i64 {
        self.signed_days() * MILLIS_PER_DAY + self.signed_time_millis()
    }
}

impl FromStr for ParsedDuration {
    type Err = CalendarError;

    fn from_str(value: &str) -> Result<Self> {
        let re = regex::Regex::new(
            r"^([+-])?P(?:([0-9]+)W|([0-9]+D)?(?:T([0-9]+H)?([0-9]+M)?([0-9]+S)?)?)$",
        )
        .map_err(|e| CalendarError::parse("duration", value, e))?;

        let upper = value.trim().to_ascii_uppercase();
        let captures = re
            .captures(&upper)
            .ok_or_else(|| CalendarError::parse("duration", value, "not a duration"))?;

        let number = |idx: usize| -> Result<Option<u32>> {
            match captures.get(idx) {
                Some(m) => m
                    .as_str()
                    .trim_end_matches(&['W', 'D', 'H', 'M', 'S'] as &[char])
                    .parse::<u32>()
                    .map(Some)
                    .map_err(|e| CalendarError::parse("duration", value, e)),
                None => Ok(None),
            }
        };

        let weeks = number(2)?;
        let days = number(3)?;
        let hours = number(4)?;
        let minutes = number(5)?;
        let seconds = number(6)?;

        if weeks.is_none() && days.is_none() && hours.is_none() && minutes.is_none() && seconds.is_none() {
            return Err(CalendarError::parse("duration", value, "no fields"));
        }

        if upper.contains('T') && hours.is_none() && minutes.is_none() && seconds.is_none() {
            return Err(CalendarError::parse("duration", value, "empty time part"));
        }

        ParsedDuration::new(
            captures.get(1).map(|m| m.as_str()) == Some("-"),
            weeks.unwrap_or(0),
            days.unwrap_or(0),
            hours.unwrap_or(0),
            minutes.unwrap_or(0),
            seconds.unwrap_or(0),
        )
    }
}

impl fmt::Display for ParsedDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        f.write_str("P")?;

        if self.weeks != 0 {
            return write!(f, "{}W", self.weeks);
        }

        if self.is_zero() {
            return f.write_str("T0S");
        }

        if self.days != 0 {
            write!(f, "{}D", self.days)?;
        }

        if self.hours != 0 || self.minutes != 0 || self.seconds != 0 {
            f.write_str("T")?;
            if self.hours != 0 {
                write!(f, "{}H", self.hours)?;
            }
            if self.minutes != 0 {
                write!(f, "{}M", self.minutes)?;
            }
            if self.seconds != 0 {
                write!(f, "{}S", self.seconds)?;
            }
        }

        Ok(())
    }
}
