use std::{cmp::Ordering, fmt, sync::Arc};

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc,
};

use crate::{
    duration::ParsedDuration,
    error::{CalendarError, Result},
    parser::Property,
    timezone::{ICalTimeZone, Offseter},
    tzmap::TimeZoneMap,
};

pub(crate) fn naive_to_millis(d: NaiveDateTime) -> i64 {
    d.and_utc().timestamp_millis()
}

pub(crate) fn millis_to_naive(millis: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(millis).map(|d| d.naive_utc())
}

pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    for &days in &[31u32, 30, 29, 28] {
        if NaiveDate::from_ymd_opt(year, month, days).is_some() {
            return days;
        }
    }
    28
}

/// What a [`ParsedDateTime`] is relative to.
#[derive(Debug, Clone)]
pub enum DateTimeZone {
    Utc,
    Named(Arc<ICalTimeZone>),
    /// No zone; the wall clock is read as UTC.
    Floating,
}

impl DateTimeZone {
    /// Wrap a zone, mapping the built-in UTC zone to [`DateTimeZone::Utc`].
    pub fn from_zone(tz: Arc<ICalTimeZone>) -> DateTimeZone {
        if tz.is_utc() {
            DateTimeZone::Utc
        } else {
            DateTimeZone::Named(tz)
        }
    }

    pub fn tzid(&self) -> Option<&str> {
        match self {
            DateTimeZone::Named(tz) => Some(tz.id()),
            _ => None,
        }
    }

    pub fn to_utc_millis(&self, local: NaiveDateTime) -> i64 {
        match self {
            DateTimeZone::Named(tz) => tz.local_to_utc_millis(local),
            DateTimeZone::Utc | DateTimeZone::Floating => naive_to_millis(local),
        }
    }

    pub fn to_local(&self, utc_millis: i64) -> Option<NaiveDateTime> {
        match self {
            DateTimeZone::Named(tz) => tz.utc_millis_to_local(utc_millis),
            DateTimeZone::Utc | DateTimeZone::Floating => millis_to_naive(utc_millis),
        }
    }
}

impl PartialEq for DateTimeZone {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DateTimeZone::Utc, DateTimeZone::Utc) => true,
            (DateTimeZone::Floating, DateTimeZone::Floating) => true,
            (DateTimeZone::Named(a), DateTimeZone::Named(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

/// A date, or a date and time, bound to a zone. Date-only values are always
/// floating.
///
/// Equality and ordering compare the absolute instant.
#[derive(Debug, Clone)]
pub struct ParsedDateTime {
    local: NaiveDateTime,
    has_time: bool,
    zone: DateTimeZone,
}

impl ParsedDateTime {
    pub fn new(local: NaiveDateTime, zone: DateTimeZone) -> ParsedDateTime {
        ParsedDateTime {
            local,
            has_time: true,
            zone,
        }
    }

    pub fn from_date(date: NaiveDate) -> ParsedDateTime {
        ParsedDateTime {
            local: date.and_time(NaiveTime::MIN),
            has_time: false,
            zone: DateTimeZone::Floating,
        }
    }

    /// Parse `YYYYMMDD` or `YYYYMMDDTHHMMSS[Z]`.
    ///
    /// A trailing `Z` forces UTC. Otherwise `tzid` is resolved through the
    /// map (which may learn it), and without a `tzid` the map's local zone
    /// applies, or floating if it has none.
    pub fn parse(text: &str, tzid: Option<&str>, tzmap: &mut TimeZoneMap) -> Result<ParsedDateTime> {
        let zone = match tzid {
            Some(tzid) => match tzmap.lookup_and_add(tzid)? {
                Some(tz) => DateTimeZone::from_zone(tz),
                None => tzmap.local_zone(),
            },
            None => tzmap.local_zone(),
        };

        ParsedDateTime::parse_in(text, zone)
    }

    /// Parse with an already resolved zone.
    pub fn parse_in(text: &str, zone: DateTimeZone) -> Result<ParsedDateTime> {
        let value = text.trim().to_ascii_uppercase();

        if !value.contains('T') {
            let date = NaiveDate::parse_from_str(&value, "%Y%m%d")
                .map_err(|e| CalendarError::parse("date", text, e))?;
            if value.len() != 8 {
                return Err(CalendarError::parse("date", text, "expected YYYYMMDD"));
            }
            return Ok(ParsedDateTime::from_date(date));
        }

        if value.len() != 15 && value.len() != 16 {
            return Err(CalendarError::parse("date-time", text, "expected YYYYMMDDTHHMMSS[Z]"));
        }

        if let Some(stripped) = value.strip_suffix('Z') {
            let local = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S")
                .map_err(|e| CalendarError::parse("date-time", text, e))?;
            return Ok(ParsedDateTime::new(local, DateTimeZone::Utc));
        }

        let local = NaiveDateTime::parse_from_str(&value, "%Y%m%dT%H%M%S")
            .map_err(|e| CalendarError::parse("date-time", text, e))?;
        Ok(ParsedDateTime::new(local, zone))
    }

    /// Parse a value that must be in UTC (`YYYYMMDDTHHMMSSZ`).
    pub fn parse_utc(text: &str) -> Result<ParsedDateTime> {
        let parsed = ParsedDateTime::parse_in(text, DateTimeZone::Floating)?;
        if !parsed.is_utc() {
            return Err(CalendarError::parse("date-time", text, "must be in UTC"));
        }
        Ok(parsed)
    }

    pub fn from_utc_millis(utc_millis: i64, zone: DateTimeZone) -> Result<ParsedDateTime> {
        let local = zone.to_local(utc_millis).ok_or_else(|| {
            CalendarError::parse("instant", &utc_millis.to_string(), "out of range")
        })?;
        Ok(ParsedDateTime::new(local, zone))
    }

    pub fn utc_millis(&self) -> i64 {
        self.zone.to_utc_millis(self.local)
    }

    pub fn local(&self) -> NaiveDateTime {
        self.local
    }

    pub fn date(&self) -> NaiveDate {
        self.local.date()
    }

    pub fn has_time(&self) -> bool {
        self.has_time
    }

    pub fn is_utc(&self) -> bool {
        self.has_time && matches!(self.zone, DateTimeZone::Utc)
    }

    pub fn is_floating(&self) -> bool {
        matches!(self.zone, DateTimeZone::Floating)
    }

    pub fn zone(&self) -> &DateTimeZone {
        &self.zone
    }

    pub fn tzid(&self) -> Option<&str> {
        self.zone.tzid()
    }

    /// Add a duration on the wall clock. Days are calendar days and the
    /// time part is added as-is, so sub-day durations crossing a DST change
    /// land on the same wall-clock distance rather than elapsed time.
    pub fn add(&self, duration: &ParsedDuration) -> ParsedDateTime {
        let delta = Duration::days(duration.signed_days())
            + Duration::milliseconds(duration.signed_time_millis());
        let moved = self.local + delta;

        ParsedDateTime {
            local: if self.has_time {
                moved
            } else {
                moved.date().and_time(NaiveTime::MIN)
            },
            has_time: self.has_time,
            zone: self.zone.clone(),
        }
    }

    /// `self - other`, in weeks when it is a whole number of weeks.
    pub fn difference(&self, other: &ParsedDateTime) -> ParsedDuration {
        ParsedDuration::from_millis(self.utc_millis() - other.utc_millis())
    }

    pub fn date_part_text(&self) -> String {
        self.local.format("%Y%m%d").to_string()
    }

    /// The same instant expressed in UTC. Date-only values are unchanged.
    pub fn to_utc(&self) -> ParsedDateTime {
        self.with_zone(DateTimeZone::Utc)
    }

    /// The same instant expressed in another zone. Date-only values are
    /// unchanged.
    pub fn with_zone(&self, zone: DateTimeZone) -> ParsedDateTime {
        if !self.has_time {
            return self.clone();
        }

        match zone.to_local(self.utc_millis()) {
            Some(local) => ParsedDateTime::new(local, zone),
            None => self.clone(),
        }
    }

    /// Absolute end of an UNTIL value. A date-only UNTIL covers the whole
    /// day in the recurrence's zone.
    pub fn utc_until_for(&self, zone: &DateTimeZone) -> i64 {
        if self.has_time {
            self.utc_millis()
        } else {
            let end_of_day = self.date().and_hms_opt(23, 59, 59).unwrap_or(self.local);
            zone.to_utc_millis(end_of_day)
        }
    }

    pub fn to_fixed(&self) -> DateTime<FixedOffset> {
        match &self.zone {
            DateTimeZone::Named(tz) => tz.to_instance(self.local),
            DateTimeZone::Utc | DateTimeZone::Floating => Utc.fix().to_instance(self.local),
        }
    }

    pub fn to_property(&self, name: &str) -> Property {
        let prop = Property::new(name, self.to_string());
        if !self.has_time {
            prop.with_param("VALUE", "DATE")
        } else if let Some(tzid) = self.tzid() {
            prop.with_param("TZID", tzid)
        } else {
            prop
        }
    }

    pub fn from_property(prop: &Property, tzmap: &mut TimeZoneMap) -> Result<ParsedDateTime> {
        ParsedDateTime::parse(&prop.value, prop.get_param("TZID"), tzmap)
    }

    /// Persisted form: the value, prefixed with `tzid:` when bound to a
    /// named zone.
    pub fn to_meta(&self) -> String {
        match self.tzid() {
            Some(tzid) if self.has_time => format!("{}:{}", tzid, self),
            _ => self.to_string(),
        }
    }

    pub fn from_meta(text: &str, tzmap: &mut TimeZoneMap) -> Result<ParsedDateTime> {
        match text.rsplit_once(':') {
            Some((tzid, value)) => ParsedDateTime::parse(value, Some(tzid), tzmap),
            None => ParsedDateTime::parse_in(text, DateTimeZone::Floating),
        }
    }
}

impl PartialEq for ParsedDateTime {
    fn eq(&self, other: &Self) -> bool {
        self.utc_millis() == other.utc_millis()
    }
}

impl Eq for ParsedDateTime {}

impl PartialOrd for ParsedDateTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParsedDateTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.utc_millis().cmp(&other.utc_millis())
    }
}

impl fmt::Display for ParsedDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_time {
            return write!(f, "{}", self.local.format("%Y%m%d"));
        }

        write!(f, "{}", self.local.format("%Y%m%dT%H%M%S"))?;
        if let DateTimeZone::Utc = self.zone {
            f.write_str("Z")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        duration::{MILLIS_PER_DAY, MILLIS_PER_HOUR},
        well_known::StaticWellKnownZones,
    };

    fn tzmap() -> TimeZoneMap {
        TimeZoneMap::new(Arc::new(StaticWellKnownZones::new()))
    }

    #[test]
    fn parse_forms() {
        let mut map = tzmap();

        let date = ParsedDateTime::parse("20220301", None, &mut map).unwrap();
        assert!(!date.has_time());
        assert!(date.is_floating());
        assert_eq!(date.to_string(), "20220301");

        let utc = ParsedDateTime::parse("20220301T100000Z", Some("America/New_York"), &mut map).unwrap();
        assert!(utc.is_utc());
        assert_eq!(utc.to_string(), "20220301T100000Z");

        let floating = ParsedDateTime::parse("20220301T100000", None, &mut map).unwrap();
        assert!(floating.is_floating());
        assert_eq!(floating.utc_millis(), utc.utc_millis());

        let zoned = ParsedDateTime::parse("20220301T100000", Some("America/New_York"), &mut map).unwrap();
        assert_eq!(zoned.tzid(), Some("America/New_York"));
        assert_eq!(zoned.utc_millis() - utc.utc_millis(), 5 * MILLIS_PER_HOUR);

        for bad in &["2022031", "20220301T1000", "20221301", "20220301T250000Z", "garbage"] {
            assert!(ParsedDateTime::parse(bad, None, &mut map).is_err(), "{}", bad);
        }
    }

    #[test]
    fn unknown_tzid_is_an_error() {
        let mut map = tzmap();
        let err = ParsedDateTime::parse("20220301T100000", Some("Mars/Olympus_Mons"), &mut map).unwrap_err();
        assert_eq!(err, CalendarError::TimezoneLookup("Mars/Olympus_Mons".to_string()));
    }

    #[test]
    fn text_round_trip() {
        let mut map = tzmap();
        for (text, tzid) in &[
            ("20220301T100000", Some("America/New_York")),
            ("20220701T235959", Some("Europe/London")),
            ("20220301T100000Z", None),
            ("20220301", None),
        ] {
            let t = ParsedDateTime::parse(text, *tzid, &mut map).unwrap();
            let again = ParsedDateTime::parse(&t.to_string(), *tzid, &mut map).unwrap();
            assert_eq!(again, t);
            assert_eq!(again.to_string(), *text);
        }
    }

    #[test]
    fn add_and_difference() {
        let mut map = tzmap();
        let start = ParsedDateTime::parse("20220301T100000Z", None, &mut map).unwrap();

        let later = start.add(&"P1DT2H".parse().unwrap());
        assert_eq!(later.to_string(), "20220302T120000Z");
        assert_eq!(later.difference(&start).to_string(), "P1DT2H");

        let week = start.add(&"P2W".parse().unwrap());
        assert_eq!(week.difference(&start).to_string(), "P2W");
        assert_eq!(start.difference(&week).to_string(), "-P2W");

        let date = ParsedDateTime::parse("20220228", None, &mut map).unwrap();
        assert_eq!(date.add(&"P1D".parse().unwrap()).to_string(), "20220301");
    }

    #[test]
    fn add_is_wall_clock_across_dst() {
        let mut map = tzmap();
        let before = ParsedDateTime::parse("20220312T120000", Some("America/New_York"), &mut map).unwrap();
        let after = before.add(&"P1D".parse().unwrap());

        assert_eq!(after.to_string(), "20220313T120000");
        assert_eq!(after.utc_millis() - before.utc_millis(), MILLIS_PER_DAY - MILLIS_PER_HOUR);
    }

    #[test]
    fn zone_conversion() {
        let mut map = tzmap();
        let t = ParsedDateTime::parse("20220701T090000", Some("America/New_York"), &mut map).unwrap();
        assert_eq!(t.to_utc().to_string(), "20220701T130000Z");
        assert_eq!(t.to_fixed().to_rfc3339(), "2022-07-01T09:00:00-04:00");

        let back = t.to_utc().with_zone(t.zone().clone());
        assert_eq!(back.to_string(), "20220701T090000");
    }

    #[test]
    fn until_for_date_only() {
        let mut map = tzmap();
        let until = ParsedDateTime::parse("20220301", None, &mut map).unwrap();
        let zone = t_zone(&mut map, "America/New_York");

        let expected = ParsedDateTime::parse("20220302T045959Z", None, &mut map).unwrap();
        assert_eq!(until.utc_until_for(&zone), expected.utc_millis());
    }

    fn t_zone(map: &mut TimeZoneMap, id: &str) -> DateTimeZone {
        DateTimeZone::from_zone(map.lookup_and_add(id).unwrap().unwrap())
    }

    #[test]
    fn property_conversion() {
        let mut map = tzmap();
        let t = ParsedDateTime::parse("20220701T090000", Some("US/Eastern"), &mut map).unwrap();

        let prop = t.to_property("DTSTART");
        assert_eq!(prop.as_string(), "DTSTART;TZID=America/New_York:20220701T090000");
        assert_eq!(ParsedDateTime::from_property(&prop, &mut map).unwrap(), t);

        let date = ParsedDateTime::from_date(NaiveDate::from_ymd_opt(2022, 7, 1).unwrap());
        assert_eq!(date.to_property("DTSTART").as_string(), "DTSTART;VALUE=DATE:20220701");
    }
}
