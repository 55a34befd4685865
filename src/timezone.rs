//! Timezones with at most one standard/daylight onset pair.
//!
//! A zone is either DST-free (a single standard offset) or has one yearly
//! onset per direction. Onsets are either "the Nth (or last) weekday of a
//! month", "a weekday on or after a given day" or "a fixed day of month",
//! always at a single wall-clock time.

use std::{convert::TryFrom, fmt, str::FromStr};

use anyhow::{ensure, format_err, Context, Error};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Timelike, Utc, Weekday,
};
use tracing::warn;

use crate::{
    datetime::{days_in_month, millis_to_naive, naive_to_millis},
    duration::{MILLIS_PER_HOUR, MILLIS_PER_MINUTE, MILLIS_PER_SECOND},
    error::{CalendarError, Result},
    metadata::Metadata,
    parser::{Component, Property},
    recur::{Frequency, RecurRule},
    unescape::{escape, unescape},
};

/// Id of the built-in UTC zone.
pub const UTC_ID: &str = "Z";

/// DTSTART used for observances that have no real start.
pub const DEFAULT_DTSTART: &str = "16010101T000000";

const FN_TZ_NAME: &str = "tzid";
const FN_STD_OFFSET: &str = "so";
const FN_HAS_DAYLIGHT: &str = "hd";
const FN_DAYLIGHT_OFFSET: &str = "do";
const FN_DAYTOSTD_DTSTART: &str = "d2ss";
const FN_STDTODAY_DTSTART: &str = "s2ds";
const FN_DAYTOSTD_RULE: &str = "d2sr";
const FN_STDTODAY_RULE: &str = "s2dr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnsetDay {
    /// The `week`th `weekday` of the month; `-1` is the last one.
    Nth { week: i8, weekday: Weekday },
    DayOfMonth(u32),
    /// The first `weekday` on or after `day`.
    OnOrAfter { weekday: Weekday, day: u32 },
}

/// A yearly transition rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimpleOnset {
    pub month: u32,
    pub rule: OnsetDay,
    pub time: NaiveTime,
}

pub(crate) fn onset_time(hour: u32, minute: u32, second: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(|| {
        CalendarError::parse(
            "onset time",
            &format!("{:02}{:02}{:02}", hour, minute, second),
            "out of range",
        )
    })
}

impl SimpleOnset {
    pub fn nth(month: u32, week: i8, weekday: Weekday, time: NaiveTime) -> Result<SimpleOnset> {
        if week != -1 && !(1..=4).contains(&week) {
            return Err(CalendarError::parse(
                "onset week",
                &week.to_string(),
                "must be 1..4 or -1",
            ));
        }
        SimpleOnset::checked(month, OnsetDay::Nth { week, weekday }, time)
    }

    pub fn day_of_month(month: u32, day: u32, time: NaiveTime) -> Result<SimpleOnset> {
        if !(1..=31).contains(&day) {
            return Err(CalendarError::parse("onset day", &day.to_string(), "must be 1..31"));
        }
        SimpleOnset::checked(month, OnsetDay::DayOfMonth(day), time)
    }

    pub fn on_or_after(month: u32, weekday: Weekday, day: u32, time: NaiveTime) -> Result<SimpleOnset> {
        if !(1..=31).contains(&day) {
            return Err(CalendarError::parse("onset day", &day.to_string(), "must be 1..31"));
        }
        SimpleOnset::checked(month, OnsetDay::OnOrAfter { weekday, day }, time)
    }

    fn checked(month: u32, rule: OnsetDay, time: NaiveTime) -> Result<SimpleOnset> {
        if !(1..=12).contains(&month) {
            return Err(CalendarError::parse("onset month", &month.to_string(), "must be 1..12"));
        }
        Ok(SimpleOnset { month, rule, time })
    }

    /// The date this onset falls on in the given year.
    pub fn date_in_year(&self, year: i32) -> Option<NaiveDate> {
        let first = NaiveDate::from_ymd_opt(year, self.month, 1)?;
        let last_day = days_in_month(year, self.month);

        match self.rule {
            OnsetDay::Nth { week, weekday } => {
                let first_match = 1 + days_until(first.weekday(), weekday);
                let day = if week > 0 {
                    first_match + 7 * (week as u32 - 1)
                } else {
                    first_match + 7 * ((last_day - first_match) / 7)
                };
                NaiveDate::from_ymd_opt(year, self.month, day)
            }
            OnsetDay::DayOfMonth(day) => NaiveDate::from_ymd_opt(year, self.month, day.min(last_day)),
            OnsetDay::OnOrAfter { weekday, day } => {
                let start = NaiveDate::from_ymd_opt(year, self.month, day.min(last_day))?;
                Some(start + Duration::days(days_until(start.weekday(), weekday) as i64))
            }
        }
    }

    /// Wall-clock moment of the onset in the given year, in the offset that
    /// is in effect just before the transition.
    pub fn at(&self, year: i32) -> Option<NaiveDateTime> {
        self.date_in_year(year).map(|d| d.and_time(self.time))
    }

    /// DTSTART text used when the onset is rendered as an observance.
    pub fn dtstart_text(&self) -> String {
        let date = self
            .date_in_year(1601)
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(1601, 1, 1).unwrap_or(NaiveDate::MIN));
        date.and_time(self.time).format("%Y%m%dT%H%M%S").to_string()
    }

    pub fn to_rrule(&self) -> String {
        match self.rule {
            OnsetDay::Nth { week, weekday } => format!(
                "FREQ=YEARLY;BYMONTH={};BYDAY={}{}",
                self.month,
                week,
                weekday_code(weekday)
            ),
            OnsetDay::DayOfMonth(day) => format!("FREQ=YEARLY;BYMONTH={};BYMONTHDAY={}", self.month, day),
            OnsetDay::OnOrAfter { weekday, day } => format!(
                "FREQ=YEARLY;BYMONTH={};BYDAY={};BYMONTHDAY={}",
                self.month,
                weekday_code(weekday),
                (day..day + 7).map(|d| d.to_string()).collect::<Vec<_>>().join(",")
            ),
        }
    }

    /// Derive an onset from an observance's DTSTART and RRULE.
    pub fn from_ical(dtstart: &str, rrule: &str) -> Result<SimpleOnset> {
        let start = NaiveDateTime::parse_from_str(dtstart.trim_end_matches('Z'), "%Y%m%dT%H%M%S")
            .map_err(|e| CalendarError::parse("onset start", dtstart, e))?;
        let rule = RecurRule::from_str(rrule)?;

        if rule.frequency != Frequency::Yearly {
            return Err(CalendarError::NotRepresentable(format!(
                "onset rule must be yearly: {}",
                rrule
            )));
        }

        let month = match rule.by_month.as_slice() {
            [] => start.month(),
            [month] => *month as u32,
            _ => {
                return Err(CalendarError::NotRepresentable(format!(
                    "onset rule with several months: {}",
                    rrule
                )))
            }
        };
        let time = start.time().with_nanosecond(0).unwrap_or_else(|| start.time());

        match (rule.by_day.as_slice(), rule.by_month_day.as_slice(), rule.by_set_pos.as_slice()) {
            ([(Some(week), weekday)], [], []) => {
                // Some clients write the fifth week for "last".
                let week = if *week == 5 { -1 } else { *week };
                SimpleOnset::nth(month, week, *weekday, time)
            }
            ([(None, weekday)], [], [pos]) => {
                let week = match *pos {
                    5 => -1,
                    pos => i8::try_from(pos).map_err(|_| {
                        CalendarError::NotRepresentable(format!("onset set position {}", pos))
                    })?,
                };
                SimpleOnset::nth(month, week, *weekday, time)
            }
            ([(None, weekday)], days, []) if is_week_run(days) => {
                SimpleOnset::on_or_after(month, *weekday, days[0] as u32, time)
            }
            ([], [day], []) if *day > 0 => SimpleOnset::day_of_month(month, *day as u32, time),
            ([], [], []) => SimpleOnset::day_of_month(month, start.day(), time),
            _ => Err(CalendarError::NotRepresentable(format!(
                "unsupported onset rule: {}",
                rrule
            ))),
        }
    }
}

fn days_until(from: Weekday, to: Weekday) -> u32 {
    (7 + to.num_days_from_monday() - from.num_days_from_monday()) % 7
}

fn is_week_run(days: &[i8]) -> bool {
    days.len() == 7 && days[0] > 0 && days.windows(2).all(|w| w[1] == w[0] + 1)
}

pub(crate) fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

/// Parse a `[+-]HHMM[SS]` offset into milliseconds.
pub fn parse_offset(value: &str) -> Result<i32> {
    let bad = |reason: &str| CalendarError::parse("utc offset", value, reason);

    if !(value.len() == 5 || value.len() == 7) || !value.is_ascii() {
        return Err(bad("expected [+-]HHMM[SS]"));
    }

    let sign = match &value[0..1] {
        "+" => 1,
        "-" => -1,
        _ => return Err(bad("missing sign")),
    };

    let field = |range: std::ops::Range<usize>| -> Result<i64> {
        value[range].parse::<u32>().map(i64::from).map_err(|e| bad(&e.to_string()))
    };

    let hours = field(1..3)?;
    let minutes = field(3..5)?;
    let seconds = if value.len() == 7 { field(5..7)? } else { 0 };

    if minutes > 59 || seconds > 59 {
        return Err(bad("out of range"));
    }

    Ok(sign * (hours * MILLIS_PER_HOUR + minutes * MILLIS_PER_MINUTE + seconds * MILLIS_PER_SECOND) as i32)
}

/// Render milliseconds as `[+-]HHMM[SS]`; seconds only when non-zero.
pub fn format_offset(millis: i32) -> String {
    let sign = if millis < 0 { '-' } else { '+' };
    let total = (millis as i64).abs() / MILLIS_PER_SECOND;
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);

    if seconds > 0 {
        format!("{}{:02}{:02}{:02}", sign, hours, minutes, seconds)
    } else {
        format!("{}{:02}{:02}", sign, hours, minutes)
    }
}

/// Maps wall-clock times to absolute instants and back.
pub trait Offseter {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset>;
    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime;
}

impl Offseter for FixedOffset {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset> {
        self.from_utc_datetime(&(d - *self))
    }

    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime {
        d.naive_utc() + *self
    }
}

fn fixed(millis: i32) -> FixedOffset {
    FixedOffset::east_opt(millis / 1000).unwrap_or_else(|| Utc.fix())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ICalTimeZone {
    id: String,
    standard_offset: i32,
    daylight_offset: i32,
    standard_onset: Option<SimpleOnset>,
    daylight_onset: Option<SimpleOnset>,
    standard_dtstart: Option<String>,
    standard_rule: Option<String>,
    daylight_dtstart: Option<String>,
    daylight_rule: Option<String>,
}

impl ICalTimeZone {
    /// Build a zone from onset rules. A zone whose offsets are equal, or
    /// which lacks either onset, is DST-free.
    pub fn new(
        id: &str,
        standard_offset: i32,
        standard_onset: Option<SimpleOnset>,
        daylight_offset: i32,
        daylight_onset: Option<SimpleOnset>,
    ) -> ICalTimeZone {
        match (standard_onset, daylight_onset) {
            (Some(std), Some(dst)) if standard_offset != daylight_offset => ICalTimeZone {
                id: id.to_string(),
                standard_offset,
                daylight_offset,
                standard_onset: Some(std),
                daylight_onset: Some(dst),
                standard_dtstart: Some(std.dtstart_text()),
                standard_rule: Some(std.to_rrule()),
                daylight_dtstart: Some(dst.dtstart_text()),
                daylight_rule: Some(dst.to_rrule()),
            },
            _ => ICalTimeZone::fixed(id, standard_offset),
        }
    }

    /// A zone that never changes offset.
    pub fn fixed(id: &str, offset: i32) -> ICalTimeZone {
        ICalTimeZone {
            id: id.to_string(),
            standard_offset: offset,
            daylight_offset: offset,
            standard_onset: None,
            daylight_onset: None,
            standard_dtstart: Some(DEFAULT_DTSTART.to_string()),
            standard_rule: None,
            daylight_dtstart: Some(DEFAULT_DTSTART.to_string()),
            daylight_rule: None,
        }
    }

    /// Build a zone from the DTSTART and RRULE texts of its observances.
    ///
    /// An observance rule that can't be reduced to a [`SimpleOnset`] makes
    /// the zone DST-free; the texts are kept as given.
    pub fn from_ical_data(
        id: &str,
        standard_offset: i32,
        standard_dtstart: Option<&str>,
        standard_rule: Option<&str>,
        daylight_offset: i32,
        daylight_dtstart: Option<&str>,
        daylight_rule: Option<&str>,
    ) -> ICalTimeZone {
        let onset = |dtstart: Option<&str>, rule: Option<&str>| match (dtstart, rule) {
            (Some(dtstart), Some(rule)) => match SimpleOnset::from_ical(dtstart, rule) {
                Ok(onset) => Some(onset),
                Err(e) => {
                    warn!(tzid = id, "Ignoring onset rule {}: {}", rule, e);
                    None
                }
            },
            _ => None,
        };

        let standard_onset = onset(standard_dtstart, standard_rule);
        let daylight_onset = onset(daylight_dtstart, daylight_rule);

        ICalTimeZone {
            id: id.to_string(),
            standard_offset,
            daylight_offset,
            standard_onset,
            daylight_onset,
            standard_dtstart: standard_dtstart.map(str::to_string),
            standard_rule: standard_rule.map(str::to_string),
            daylight_dtstart: daylight_dtstart.map(str::to_string),
            daylight_rule: daylight_rule.map(str::to_string),
        }
    }

    pub fn utc() -> ICalTimeZone {
        ICalTimeZone::from_ical_data(
            UTC_ID,
            0,
            Some(DEFAULT_DTSTART),
            None,
            0,
            Some(DEFAULT_DTSTART),
            None,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_utc(&self) -> bool {
        self.id == UTC_ID
    }

    pub fn standard_offset(&self) -> i32 {
        self.standard_offset
    }

    pub fn daylight_offset(&self) -> i32 {
        self.daylight_offset
    }

    pub fn standard_onset(&self) -> Option<&SimpleOnset> {
        self.standard_onset.as_ref()
    }

    pub fn daylight_onset(&self) -> Option<&SimpleOnset> {
        self.daylight_onset.as_ref()
    }

    pub fn standard_dtstart(&self) -> Option<&str> {
        self.standard_dtstart.as_deref()
    }

    pub fn standard_rule(&self) -> Option<&str> {
        self.standard_rule.as_deref()
    }

    pub fn daylight_dtstart(&self) -> Option<&str> {
        self.daylight_dtstart.as_deref()
    }

    pub fn daylight_rule(&self) -> Option<&str> {
        self.daylight_rule.as_deref()
    }

    pub fn has_daylight(&self) -> bool {
        self.standard_offset != self.daylight_offset
            && self.standard_onset.is_some()
            && self.daylight_onset.is_some()
    }

    pub fn clone_with_id(&self, id: &str) -> ICalTimeZone {
        ICalTimeZone {
            id: id.to_string(),
            ..self.clone()
        }
    }

    fn onsets(&self) -> Option<(SimpleOnset, SimpleOnset)> {
        if !self.has_daylight() {
            return None;
        }
        Some((self.daylight_onset?, self.standard_onset?))
    }

    /// Offset in milliseconds in effect at the given UTC instant.
    pub fn offset_at_utc(&self, utc_millis: i64) -> i32 {
        let (dst, std) = match self.onsets() {
            Some(onsets) => onsets,
            None => return self.standard_offset,
        };

        let year = match millis_to_naive(utc_millis + self.standard_offset as i64) {
            Some(local) => local.year(),
            None => return self.standard_offset,
        };

        match (dst.at(year), std.at(year)) {
            (Some(dst_start), Some(std_start)) => {
                let dst_start = naive_to_millis(dst_start) - self.standard_offset as i64;
                let std_start = naive_to_millis(std_start) - self.daylight_offset as i64;
                self.pick(utc_millis, dst_start, std_start)
            }
            _ => self.standard_offset,
        }
    }

    /// Offset in milliseconds for a wall-clock time in this zone.
    ///
    /// Times repeated at the end of daylight time resolve to the daylight
    /// offset.
    pub fn offset_for_local(&self, local: NaiveDateTime) -> i32 {
        let (dst, std) = match self.onsets() {
            Some(onsets) => onsets,
            None => return self.standard_offset,
        };

        match (dst.at(local.year()), std.at(local.year())) {
            (Some(dst_start), Some(std_start)) => self.pick(
                naive_to_millis(local),
                naive_to_millis(dst_start),
                naive_to_millis(std_start),
            ),
            _ => self.standard_offset,
        }
    }

    fn pick(&self, point: i64, dst_start: i64, std_start: i64) -> i32 {
        let in_daylight = if dst_start < std_start {
            dst_start <= point && point < std_start
        } else {
            // Southern hemisphere: daylight time wraps the new year.
            point >= dst_start || point < std_start
        };

        if in_daylight {
            self.daylight_offset
        } else {
            self.standard_offset
        }
    }

    pub fn local_to_utc_millis(&self, local: NaiveDateTime) -> i64 {
        naive_to_millis(local) - self.offset_for_local(local) as i64
    }

    pub fn utc_millis_to_local(&self, utc_millis: i64) -> Option<NaiveDateTime> {
        millis_to_naive(utc_millis + self.offset_at_utc(utc_millis) as i64)
    }

    pub fn encode_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.put_str(FN_TZ_NAME, self.id.as_str())
            .put_bool(FN_HAS_DAYLIGHT, self.has_daylight())
            .put_long(FN_STD_OFFSET, self.standard_offset as i64)
            .put_opt_str(FN_DAYTOSTD_DTSTART, self.standard_dtstart.as_deref())
            .put_opt_str(FN_DAYTOSTD_RULE, self.standard_rule.as_deref())
            .put_long(FN_DAYLIGHT_OFFSET, self.daylight_offset as i64)
            .put_opt_str(FN_STDTODAY_DTSTART, self.daylight_dtstart.as_deref())
            .put_opt_str(FN_STDTODAY_RULE, self.daylight_rule.as_deref());
        meta
    }

    pub fn decode_metadata(meta: &Metadata) -> Result<ICalTimeZone> {
        let id = meta.get_opt_str(FN_TZ_NAME).unwrap_or("unknown time zone");
        let standard_offset = meta.get_long_or(FN_STD_OFFSET, 0)? as i32;
        let daylight_offset = meta.get_long_or(FN_DAYLIGHT_OFFSET, standard_offset as i64)? as i32;
        let standard_dtstart = meta.get_opt_str(FN_DAYTOSTD_DTSTART);
        let daylight_dtstart = meta.get_opt_str(FN_STDTODAY_DTSTART).or(standard_dtstart);

        Ok(ICalTimeZone::from_ical_data(
            id,
            standard_offset,
            standard_dtstart,
            meta.get_opt_str(FN_DAYTOSTD_RULE),
            daylight_offset,
            daylight_dtstart,
            meta.get_opt_str(FN_STDTODAY_RULE),
        ))
    }

    /// Render as a VTIMEZONE component.
    pub fn to_component(&self) -> Component {
        let mut vtz = Component::new("VTIMEZONE");
        vtz.push_property(Property::new("TZID", escape(&self.id)));

        let mut standard = Component::new("STANDARD");
        standard
            .push_property(Property::new(
                "DTSTART",
                self.standard_dtstart.as_deref().unwrap_or(DEFAULT_DTSTART),
            ))
            .push_property(Property::new("TZOFFSETTO", format_offset(self.standard_offset)))
            .push_property(Property::new("TZOFFSETFROM", format_offset(self.daylight_offset)));
        if let Some(rule) = &self.standard_rule {
            standard.push_property(Property::new("RRULE", rule.as_str()));
        }
        vtz.push_component(standard);

        if self.has_daylight() {
            let mut daylight = Component::new("DAYLIGHT");
            daylight
                .push_property(Property::new(
                    "DTSTART",
                    self.daylight_dtstart.as_deref().unwrap_or(DEFAULT_DTSTART),
                ))
                .push_property(Property::new("TZOFFSETTO", format_offset(self.daylight_offset)))
                .push_property(Property::new("TZOFFSETFROM", format_offset(self.standard_offset)));
            if let Some(rule) = &self.daylight_rule {
                daylight.push_property(Property::new("RRULE", rule.as_str()));
            }
            vtz.push_component(daylight);
        }

        vtz
    }

    /// Read a VTIMEZONE component. When several STANDARD or DAYLIGHT
    /// observances are present the one with the latest DTSTART is used.
    pub fn from_component(component: &Component) -> std::result::Result<ICalTimeZone, Error> {
        ensure!(component.is("VTIMEZONE"), "Expected VTIMEZONE, got {}", component.name);

        let id = unescape(
            component
                .get_property_value("TZID")
                .ok_or_else(|| format_err!("Missing TZID field in VTIMEZONE"))?,
        )?;

        let standard = Observance::latest(component, "STANDARD")
            .with_context(|| format!("parsing STANDARD of {}", id))?;
        let daylight = Observance::latest(component, "DAYLIGHT")
            .with_context(|| format!("parsing DAYLIGHT of {}", id))?;

        let tz = match (standard, daylight) {
            (Some(std), Some(dst)) => ICalTimeZone::from_ical_data(
                &id,
                std.offset_to,
                Some(&std.dtstart),
                std.rrule.as_deref(),
                dst.offset_to,
                Some(&dst.dtstart),
                dst.rrule.as_deref(),
            ),
            (Some(only), None) | (None, Some(only)) => ICalTimeZone::from_ical_data(
                &id,
                only.offset_to,
                Some(&only.dtstart),
                only.rrule.as_deref(),
                only.offset_to,
                Some(&only.dtstart),
                None,
            ),
            (None, None) => {
                return Err(format_err!(
                    "VTIMEZONE {} must have one of DAYLIGHT or STANDARD components",
                    id
                ))
            }
        };

        Ok(tz)
    }
}

impl fmt::Display for ICalTimeZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.id, format_offset(self.standard_offset))?;
        if self.has_daylight() {
            write!(f, "/{}", format_offset(self.daylight_offset))?;
        }
        f.write_str(")")
    }
}

impl Offseter for ICalTimeZone {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset> {
        let offset = fixed(self.offset_for_local(d));
        offset.from_utc_datetime(&(d - offset))
    }

    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime {
        let utc = d.naive_utc();
        utc + Duration::milliseconds(self.offset_at_utc(naive_to_millis(utc)) as i64)
    }
}

/// One STANDARD or DAYLIGHT block.
#[derive(Debug, Clone)]
pub(crate) struct Observance {
    pub dtstart: String,
    pub offset_to: i32,
    pub rrule: Option<String>,
}

impl Observance {
    fn from_component(component: &Component) -> std::result::Result<Observance, Error> {
        let dtstart = component
            .get_property_value("DTSTART")
            .ok_or_else(|| format_err!("Missing DTSTART field in {}", component.name))?;
        let offset_to = component
            .get_property_value("TZOFFSETTO")
            .ok_or_else(|| format_err!("Missing TZOFFSETTO field in {}", component.name))?;

        Ok(Observance {
            dtstart: dtstart.to_string(),
            offset_to: parse_offset(offset_to)?,
            rrule: component.get_property_value("RRULE").map(str::to_string),
        })
    }

    pub(crate) fn all(component: &Component, name: &str) -> std::result::Result<Vec<Observance>, Error> {
        component
            .components_named(name)
            .map(Observance::from_component)
            .collect()
    }

    fn latest(component: &Component, name: &str) -> std::result::Result<Option<Observance>, Error> {
        Ok(Observance::all(component, name)?
            .into_iter()
            .max_by(|a, b| a.dtstart.cmp(&b.dtstart)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_york() -> ICalTimeZone {
        let two_am = onset_time(2, 0, 0).unwrap();
        ICalTimeZone::new(
            "America/New_York",
            -5 * MILLIS_PER_HOUR as i32,
            Some(SimpleOnset::nth(11, 1, Weekday::Sun, two_am).unwrap()),
            -4 * MILLIS_PER_HOUR as i32,
            Some(SimpleOnset::nth(3, 2, Weekday::Sun, two_am).unwrap()),
        )
    }

    fn sydney() -> ICalTimeZone {
        ICalTimeZone::new(
            "Australia/Sydney",
            10 * MILLIS_PER_HOUR as i32,
            Some(SimpleOnset::nth(4, 1, Weekday::Sun, onset_time(3, 0, 0).unwrap()).unwrap()),
            11 * MILLIS_PER_HOUR as i32,
            Some(SimpleOnset::nth(10, 1, Weekday::Sun, onset_time(2, 0, 0).unwrap()).unwrap()),
        )
    }

    fn utc_millis(s: &str) -> i64 {
        DateTime::parse_from_rfc3339(s).unwrap().timestamp_millis()
    }

    fn local(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn onset_dates() {
        let t = onset_time(2, 0, 0).unwrap();
        let second_sunday = SimpleOnset::nth(3, 2, Weekday::Sun, t).unwrap();
        assert_eq!(second_sunday.date_in_year(2022), NaiveDate::from_ymd_opt(2022, 3, 13));

        let last_sunday = SimpleOnset::nth(10, -1, Weekday::Sun, t).unwrap();
        assert_eq!(last_sunday.date_in_year(2022), NaiveDate::from_ymd_opt(2022, 10, 30));

        let on_or_after = SimpleOnset::on_or_after(3, Weekday::Fri, 23, t).unwrap();
        assert_eq!(on_or_after.date_in_year(2022), NaiveDate::from_ymd_opt(2022, 3, 25));

        let leap = SimpleOnset::day_of_month(2, 29, t).unwrap();
        assert_eq!(leap.date_in_year(2023), NaiveDate::from_ymd_opt(2023, 2, 28));

        assert!(SimpleOnset::nth(3, 5, Weekday::Sun, t).is_err());
        assert!(SimpleOnset::nth(13, 1, Weekday::Sun, t).is_err());
    }

    #[test]
    fn onset_rrule_round_trip() {
        let t = onset_time(1, 30, 0).unwrap();
        for onset in &[
            SimpleOnset::nth(3, -1, Weekday::Sun, t).unwrap(),
            SimpleOnset::nth(4, 1, Weekday::Sat, t).unwrap(),
            SimpleOnset::day_of_month(9, 21, t).unwrap(),
            SimpleOnset::on_or_after(3, Weekday::Fri, 23, t).unwrap(),
        ] {
            let parsed = SimpleOnset::from_ical(&onset.dtstart_text(), &onset.to_rrule()).unwrap();
            assert_eq!(&parsed, onset);
        }
    }

    #[test]
    fn fifth_week_means_last() {
        let onset = SimpleOnset::from_ical("19701025T030000", "FREQ=YEARLY;BYDAY=5SU;BYMONTH=10").unwrap();
        assert_eq!(
            onset.rule,
            OnsetDay::Nth {
                week: -1,
                weekday: Weekday::Sun
            }
        );
    }

    #[test]
    fn set_position_onsets() {
        let last = SimpleOnset::from_ical("19701025T030000", "FREQ=YEARLY;BYMONTH=10;BYDAY=SU;BYSETPOS=5")
            .unwrap();
        assert_eq!(
            last.rule,
            OnsetDay::Nth {
                week: -1,
                weekday: Weekday::Sun
            }
        );

        let second = SimpleOnset::from_ical("19700308T020000", "FREQ=YEARLY;BYMONTH=3;BYDAY=SU;BYSETPOS=2")
            .unwrap();
        assert_eq!(
            second.rule,
            OnsetDay::Nth {
                week: 2,
                weekday: Weekday::Sun
            }
        );

        let err = SimpleOnset::from_ical("19701025T030000", "FREQ=YEARLY;BYMONTH=10;BYDAY=SU;BYSETPOS=257")
            .unwrap_err();
        assert!(matches!(err, CalendarError::NotRepresentable(_)));
    }

    #[test]
    fn northern_offsets() {
        let tz = new_york();
        assert!(tz.has_daylight());

        assert_eq!(tz.offset_at_utc(utc_millis("2022-01-15T12:00:00Z")), -5 * 3_600_000);
        assert_eq!(tz.offset_at_utc(utc_millis("2022-07-15T12:00:00Z")), -4 * 3_600_000);

        // Transitions happen at 02:00 local.
        assert_eq!(tz.offset_at_utc(utc_millis("2022-03-13T06:59:59Z")), -5 * 3_600_000);
        assert_eq!(tz.offset_at_utc(utc_millis("2022-03-13T07:00:00Z")), -4 * 3_600_000);
        assert_eq!(tz.offset_at_utc(utc_millis("2022-11-06T05:59:59Z")), -4 * 3_600_000);
        assert_eq!(tz.offset_at_utc(utc_millis("2022-11-06T06:00:00Z")), -5 * 3_600_000);

        assert_eq!(tz.offset_for_local(local("2022-07-04 09:00:00")), -4 * 3_600_000);
        assert_eq!(tz.offset_for_local(local("2022-12-25 09:00:00")), -5 * 3_600_000);
    }

    #[test]
    fn southern_offsets() {
        let tz = sydney();
        assert_eq!(tz.offset_at_utc(utc_millis("2022-01-15T00:00:00Z")), 11 * 3_600_000);
        assert_eq!(tz.offset_at_utc(utc_millis("2022-07-15T00:00:00Z")), 10 * 3_600_000);
        assert_eq!(tz.offset_for_local(local("2022-12-25 09:00:00")), 11 * 3_600_000);
    }

    #[test]
    fn equal_offsets_are_dst_free() {
        let t = onset_time(2, 0, 0).unwrap();
        let tz = ICalTimeZone::new(
            "Flat",
            3_600_000,
            Some(SimpleOnset::nth(11, 1, Weekday::Sun, t).unwrap()),
            3_600_000,
            Some(SimpleOnset::nth(3, 2, Weekday::Sun, t).unwrap()),
        );
        assert!(!tz.has_daylight());
        assert_eq!(tz.offset_at_utc(utc_millis("2022-07-15T00:00:00Z")), 3_600_000);
    }

    #[test]
    fn utc_zone() {
        let utc = ICalTimeZone::utc();
        assert_eq!(utc.id(), "Z");
        assert!(!utc.has_daylight());
        assert_eq!(utc.standard_dtstart(), Some(DEFAULT_DTSTART));
        assert_eq!(utc.offset_at_utc(0), 0);
    }

    #[test]
    fn offsets_text() {
        assert_eq!(parse_offset("-0500").unwrap(), -18_000_000);
        assert_eq!(parse_offset("+053000").unwrap(), 19_800_000);
        assert_eq!(parse_offset("+0000").unwrap(), 0);
        assert!(parse_offset("0500").is_err());
        assert!(parse_offset("+05").is_err());
        assert!(parse_offset("+0575").is_err());

        assert_eq!(format_offset(-18_000_000), "-0500");
        assert_eq!(format_offset(19_800_000), "+0530");
        assert_eq!(format_offset(3_723_000), "+010203");
        assert_eq!(format_offset(0), "+0000");
    }

    #[test]
    fn metadata_round_trip() {
        let tz = new_york();
        let meta = tz.encode_metadata();
        assert_eq!(meta.get_str("tzid").unwrap(), "America/New_York");
        assert_eq!(meta.get_long("so").unwrap(), -18_000_000);
        assert_eq!(meta.get_str("s2dr").unwrap(), "FREQ=YEARLY;BYMONTH=3;BYDAY=2SU");

        let decoded = ICalTimeZone::decode_metadata(&Metadata::from_json(&meta.to_json()).unwrap()).unwrap();
        assert_eq!(decoded, tz);
    }

    #[test]
    fn vtimezone_round_trip() {
        let tz = new_york();
        let decoded = ICalTimeZone::from_component(&tz.to_component()).unwrap();
        assert_eq!(decoded, tz);
    }

    #[test]
    fn latest_observance_wins() {
        let input = "BEGIN:VTIMEZONE\r\n\
                     TZID:America/New_York\r\n\
                     BEGIN:DAYLIGHT\r\n\
                     TZOFFSETFROM:-0500\r\n\
                     TZOFFSETTO:-0400\r\n\
                     DTSTART:19870405T020000\r\n\
                     RRULE:FREQ=YEARLY;BYMONTH=4;BYDAY=1SU;UNTIL=20060402T070000Z\r\n\
                     END:DAYLIGHT\r\n\
                     BEGIN:DAYLIGHT\r\n\
                     TZOFFSETFROM:-0500\r\n\
                     TZOFFSETTO:-0400\r\n\
                     DTSTART:20070311T020000\r\n\
                     RRULE:FREQ=YEARLY;BYMONTH=3;BYDAY=2SU\r\n\
                     END:DAYLIGHT\r\n\
                     BEGIN:STANDARD\r\n\
                     TZOFFSETFROM:-0400\r\n\
                     TZOFFSETTO:-0500\r\n\
                     DTSTART:20071104T020000\r\n\
                     RRULE:FREQ=YEARLY;BYMONTH=11;BYDAY=1SU\r\n\
                     END:STANDARD\r\n\
                     END:VTIMEZONE\r\n";

        let component = Component::from_str_to_stream(input).unwrap().remove(0);
        let tz = ICalTimeZone::from_component(&component).unwrap();

        assert!(tz.has_daylight());
        assert_eq!(tz.daylight_rule(), Some("FREQ=YEARLY;BYMONTH=3;BYDAY=2SU"));
        assert_eq!(tz.offset_at_utc(utc_millis("2022-03-20T12:00:00Z")), -4 * 3_600_000);
    }

    #[test]
    fn offseter_rfc3339() {
        let tz = new_york();
        assert_eq!(
            tz.to_instance(local("2022-07-04 09:00:00")).to_rfc3339(),
            "2022-07-04T09:00:00-04:00"
        );
        let instant = DateTime::parse_from_rfc3339("2022-01-01T17:00:00+00:00").unwrap();
        assert_eq!(tz.from_instance(instant), local("2022-01-01 12:00:00"));

        let fixed = FixedOffset::east_opt(3600).unwrap();
        assert_eq!(
            fixed.to_instance(local("2022-01-01 12:00:00")).to_rfc3339(),
            "2022-01-01T12:00:00+01:00"
        );
    }
}
