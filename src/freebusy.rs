//! Free/busy partition of a time window.
//!
//! A [`FreeBusy`] always covers its window exactly with start-ordered,
//! non-overlapping intervals, and adjacent intervals never share a status.
//! Adding a busy span splits the intervals it touches at its boundaries and
//! keeps the busier status on every piece it covers.

use std::{fmt, str::FromStr};

use tracing::trace;
use url::Url;

use crate::{
    datetime::{DateTimeZone, ParsedDateTime},
    error::{CalendarError, Result},
    parser::{Component, Property},
    recurrence::{DateValue, InviteInfo},
    tzmap::TimeZoneMap,
};

pub const PRODID: &str = "-//ical_core//Calendar Core//EN";

/// An iCalendar FBTYPE value, plus the no-data marker used when a
/// calendar can't be read.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FreeBusyStatus {
    Free,
    Busy,
    Tentative,
    Unavailable,
    NoData,
    Other(String),
}

impl FreeBusyStatus {
    pub fn as_fbtype(&self) -> &str {
        match self {
            FreeBusyStatus::Free => "FREE",
            FreeBusyStatus::Busy => "BUSY",
            FreeBusyStatus::Tentative => "BUSY-TENTATIVE",
            FreeBusyStatus::Unavailable => "BUSY-UNAVAILABLE",
            FreeBusyStatus::NoData => "X-ZIMBRA-FREEBUSY-NODATA",
            FreeBusyStatus::Other(s) => s,
        }
    }

    pub fn from_fbtype(value: &str) -> FreeBusyStatus {
        match value.to_ascii_uppercase().as_str() {
            "FREE" => FreeBusyStatus::Free,
            "BUSY" => FreeBusyStatus::Busy,
            "BUSY-TENTATIVE" => FreeBusyStatus::Tentative,
            "BUSY-UNAVAILABLE" => FreeBusyStatus::Unavailable,
            "X-ZIMBRA-FREEBUSY-NODATA" => FreeBusyStatus::NoData,
            other => FreeBusyStatus::Other(other.to_string()),
        }
    }

    /// Single-letter code used in compact encodings.
    pub fn code(&self) -> Option<char> {
        match self {
            FreeBusyStatus::Free => Some('F'),
            FreeBusyStatus::Busy => Some('B'),
            FreeBusyStatus::Tentative => Some('T'),
            FreeBusyStatus::Unavailable => Some('O'),
            FreeBusyStatus::NoData => Some('N'),
            FreeBusyStatus::Other(_) => None,
        }
    }

    pub fn from_code(code: char) -> Option<FreeBusyStatus> {
        match code.to_ascii_uppercase() {
            'F' => Some(FreeBusyStatus::Free),
            'B' => Some(FreeBusyStatus::Busy),
            'T' => Some(FreeBusyStatus::Tentative),
            'O' => Some(FreeBusyStatus::Unavailable),
            'N' => Some(FreeBusyStatus::NoData),
            _ => None,
        }
    }

    /// Position in the busy order, lower is busier.
    fn rank(&self) -> Option<u8> {
        match self {
            FreeBusyStatus::Unavailable => Some(0),
            FreeBusyStatus::Busy => Some(1),
            FreeBusyStatus::Tentative => Some(2),
            FreeBusyStatus::NoData => Some(3),
            FreeBusyStatus::Free => Some(4),
            FreeBusyStatus::Other(_) => None,
        }
    }

    /// The busier of two statuses. A status outside the busy order loses to
    /// any known one, and wins over another unknown one when it comes first.
    pub fn busier(a: &FreeBusyStatus, b: &FreeBusyStatus) -> FreeBusyStatus {
        match (a.rank(), b.rank()) {
            (Some(x), Some(y)) if y < x => b.clone(),
            (None, Some(_)) => b.clone(),
            _ => a.clone(),
        }
    }
}

impl Default for FreeBusyStatus {
    fn default() -> Self {
        FreeBusyStatus::Free
    }
}

impl FromStr for FreeBusyStatus {
    type Err = CalendarError;

    fn from_str(value: &str) -> Result<Self> {
        Ok(FreeBusyStatus::from_fbtype(value))
    }
}

impl fmt::Display for FreeBusyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_fbtype())
    }
}

/// Translation of the busy states Outlook writes in
/// `X-MICROSOFT-CDO-BUSYSTATUS`.
pub trait OutlookStatusMap {
    fn to_status(&self, outlook: &str) -> Option<FreeBusyStatus>;

    fn to_outlook(&self, status: &FreeBusyStatus) -> Option<&'static str>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOutlookMap;

impl OutlookStatusMap for DefaultOutlookMap {
    fn to_status(&self, outlook: &str) -> Option<FreeBusyStatus> {
        match outlook.to_ascii_uppercase().as_str() {
            "FREE" => Some(FreeBusyStatus::Free),
            "BUSY" => Some(FreeBusyStatus::Busy),
            "TENTATIVE" => Some(FreeBusyStatus::Tentative),
            "OOF" => Some(FreeBusyStatus::Unavailable),
            _ => None,
        }
    }

    fn to_outlook(&self, status: &FreeBusyStatus) -> Option<&'static str> {
        match status {
            FreeBusyStatus::Free => Some("FREE"),
            FreeBusyStatus::Busy => Some("BUSY"),
            FreeBusyStatus::Tentative => Some("TENTATIVE"),
            FreeBusyStatus::Unavailable => Some("OOF"),
            FreeBusyStatus::NoData | FreeBusyStatus::Other(_) => None,
        }
    }
}

/// One occurrence feeding a free/busy computation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FBInstance {
    pub start: i64,
    pub end: i64,
    pub invite: InviteInfo,
    /// Original start of the occurrence, 0 for non-recurring events.
    pub recur_id: i64,
    pub status: FreeBusyStatus,
}

/// A node of the partition, with the occurrences that made it busy.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
    pub status: FreeBusyStatus,
    pub instances: Vec<FBInstance>,
}

impl Interval {
    fn new(start: i64, end: i64, status: FreeBusyStatus) -> Interval {
        Interval {
            start,
            end,
            status,
            instances: Vec::new(),
        }
    }

    fn add_instances<'a>(&mut self, instances: impl IntoIterator<Item = &'a FBInstance>) {
        for inst in instances {
            if !self.instances.contains(inst) {
                self.instances.push(inst.clone());
            }
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "start={}, end={}, status={}", self.start, self.end, self.status)
    }
}

/// iTIP method of a published VFREEBUSY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Publish,
    Request,
    Reply,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Publish => "PUBLISH",
            Method::Request => "REQUEST",
            Method::Reply => "REPLY",
        }
    }
}

fn calendar_address(address: &str) -> String {
    let lower = address.to_ascii_lowercase();
    if lower.starts_with("mailto:") || lower.starts_with("http:") || lower.starts_with("https:") {
        address.to_string()
    } else {
        format!("mailto:{}", address)
    }
}

fn utc_text(millis: i64) -> Result<String> {
    Ok(ParsedDateTime::from_utc_millis(millis, DateTimeZone::Utc)?.to_string())
}

/// Free/busy of one calendar user over `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FreeBusy {
    name: String,
    start: i64,
    end: i64,
    intervals: Vec<Interval>,
}

impl FreeBusy {
    /// Free over the whole window.
    pub fn new(name: &str, start: i64, end: i64) -> FreeBusy {
        FreeBusy::with_status(name, start, end, FreeBusyStatus::Free)
    }

    pub fn with_status(name: &str, start: i64, end: i64, status: FreeBusyStatus) -> FreeBusy {
        let end = end.max(start);
        FreeBusy {
            name: name.to_string(),
            start,
            end,
            intervals: vec![Interval::new(start, end, status)],
        }
    }

    /// Unknown over the whole window.
    pub fn nodata(name: &str, start: i64, end: i64) -> FreeBusy {
        FreeBusy::with_status(name, start, end, FreeBusyStatus::NoData)
    }

    /// The partition for a set of occurrences.
    pub fn build(
        name: &str,
        start: i64,
        end: i64,
        occurrences: impl IntoIterator<Item = FBInstance>,
    ) -> FreeBusy {
        let mut fb = FreeBusy::new(name, start, end);
        for inst in occurrences {
            let status = inst.status.clone();
            fb.add_interval(inst.start, inst.end, status, Some(inst));
        }
        fb
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Mark `[start, end)`, clipped to the window, with `status` wherever
    /// that is busier than what is there.
    pub fn add_interval(&mut self, start: i64, end: i64, status: FreeBusyStatus, instance: Option<FBInstance>) {
        let start = start.max(self.start);
        let end = end.min(self.end);
        if start >= end {
            return;
        }
        trace!(start, end, %status, "Adding free/busy interval");

        // The interval holding `start`. The partition covers the window,
        // so there always is one.
        let first = self.intervals.partition_point(|iv| iv.end <= start);
        let mut idx = first;

        if self.intervals[idx].start < start {
            let mut tail = self.intervals[idx].clone();
            tail.start = start;
            self.intervals[idx].end = start;
            idx += 1;
            self.intervals.insert(idx, tail);
        }

        let mut cursor = start;
        while cursor < end && idx < self.intervals.len() {
            if end < self.intervals[idx].end {
                let mut tail = self.intervals[idx].clone();
                tail.start = end;
                self.intervals[idx].end = end;
                self.intervals.insert(idx + 1, tail);
            }

            let cur = &mut self.intervals[idx];
            cur.status = FreeBusyStatus::busier(&cur.status, &status);
            cur.add_instances(instance.as_ref());
            cursor = cur.end;
            idx += 1;
        }

        self.coalesce(first.saturating_sub(1), idx);
    }

    /// Merge neighbours with the same status among `[from, to]`.
    fn coalesce(&mut self, from: usize, to: usize) {
        let mut last = to.min(self.intervals.len() - 1);
        let mut i = from;
        while i < last {
            if self.intervals[i].status == self.intervals[i + 1].status {
                let next = self.intervals.remove(i + 1);
                let cur = &mut self.intervals[i];
                cur.end = next.end;
                cur.add_instances(&next.instances);
                last -= 1;
            } else {
                i += 1;
            }
        }
    }

    /// The busiest status anywhere in the window.
    pub fn busiest(&self) -> FreeBusyStatus {
        self.intervals
            .iter()
            .fold(FreeBusyStatus::Free, |acc, iv| FreeBusyStatus::busier(&acc, &iv.status))
    }

    /// A VCALENDAR holding this partition as a VFREEBUSY. FREE and no-data
    /// intervals are left out. `now` is the DTSTAMP.
    pub fn to_component(
        &self,
        method: Method,
        organizer: &str,
        attendee: Option<&str>,
        url: Option<&Url>,
        now: i64,
    ) -> Result<Component> {
        let mut vfreebusy = Component::new("VFREEBUSY");
        vfreebusy.push_property(Property::new("ORGANIZER", calendar_address(organizer)));
        if let Some(attendee) = attendee {
            vfreebusy.push_property(Property::new("ATTENDEE", calendar_address(attendee)));
        }
        vfreebusy
            .push_property(Property::new("DTSTAMP", utc_text(now)?))
            .push_property(Property::new("DTSTART", utc_text(self.start)?))
            .push_property(Property::new("DTEND", utc_text(self.end)?));
        if let Some(url) = url {
            vfreebusy.push_property(Property::new("URL", url.as_str()));
        }

        for iv in &self.intervals {
            if matches!(iv.status, FreeBusyStatus::Free | FreeBusyStatus::NoData) {
                continue;
            }
            let period = format!("{}/{}", utc_text(iv.start)?, utc_text(iv.end)?);
            vfreebusy.push_property(Property::new("FREEBUSY", period).with_param("FBTYPE", iv.status.as_fbtype()));
        }

        let mut calendar = Component::new("VCALENDAR");
        calendar
            .push_property(Property::new("PRODID", PRODID))
            .push_property(Property::new("VERSION", "2.0"))
            .push_property(Property::new("METHOD", method.as_str()))
            .push_component(vfreebusy);
        Ok(calendar)
    }

    /// Read a VFREEBUSY. FREEBUSY values without FBTYPE are BUSY.
    pub fn from_component(component: &Component, tzmap: &mut TimeZoneMap) -> Result<FreeBusy> {
        let missing = |what: &str| CalendarError::parse("VFREEBUSY", &component.name, &format!("missing {}", what));

        let organizer = component.get_property_value("ORGANIZER").ok_or_else(|| missing("ORGANIZER"))?;
        let name = organizer
            .strip_prefix("mailto:")
            .or_else(|| organizer.strip_prefix("MAILTO:"))
            .unwrap_or(organizer);
        let start = component.get_property("DTSTART").ok_or_else(|| missing("DTSTART"))?;
        let end = component.get_property("DTEND").ok_or_else(|| missing("DTEND"))?;
        let start = ParsedDateTime::from_property(start, tzmap)?.utc_millis();
        let end = ParsedDateTime::from_property(end, tzmap)?.utc_millis();

        let mut fb = FreeBusy::new(name, start, end);
        for prop in component.properties_named("FREEBUSY") {
            let status = prop
                .get_param("FBTYPE")
                .map_or(FreeBusyStatus::Busy, FreeBusyStatus::from_fbtype);

            for value in DateValue::parse_list(&prop.clone().with_param("VALUE", "PERIOD"), tzmap)? {
                if let DateValue::Period { start, end } = value {
                    fb.add_interval(start.utc_millis(), end.utc_millis(), status.clone(), None);
                }
            }
        }
        Ok(fb)
    }
}

impl fmt::Display for FreeBusy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for iv in &self.intervals {
            writeln!(f, "\t{}", iv)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::well_known::StaticWellKnownZones;

    use super::FreeBusyStatus::*;

    fn partition(fb: &FreeBusy) -> Vec<(i64, i64, FreeBusyStatus)> {
        fb.intervals().iter().map(|iv| (iv.start, iv.end, iv.status.clone())).collect()
    }

    fn assert_partition_invariants(fb: &FreeBusy) {
        let ivs = fb.intervals();
        assert_eq!(ivs.first().unwrap().start, fb.start());
        assert_eq!(ivs.last().unwrap().end, fb.end());
        for pair in ivs.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert_ne!(pair[0].status, pair[1].status);
        }
        assert!(ivs.iter().all(|iv| iv.start < iv.end));
    }

    #[test]
    fn busier_wins() {
        let mut fb = FreeBusy::new("u", 0, 100);
        fb.add_interval(50, 60, Busy, None);
        fb.add_interval(10, 20, Tentative, None);
        fb.add_interval(20, 30, Unavailable, None);
        fb.add_interval(15, 35, Busy, None);

        assert_eq!(
            partition(&fb),
            vec![
                (0, 10, Free),
                (10, 15, Tentative),
                (15, 20, Busy),
                (20, 30, Unavailable),
                (30, 35, Busy),
                (35, 50, Free),
                (50, 60, Busy),
                (60, 100, Free),
            ]
        );
        assert_partition_invariants(&fb);
        assert_eq!(fb.busiest(), Unavailable);
    }

    #[test]
    fn re_adding_is_idempotent() {
        let mut fb = FreeBusy::new("u", 0, 100);
        fb.add_interval(20, 30, Busy, None);
        fb.add_interval(10, 40, Tentative, None);
        let before = partition(&fb);

        fb.add_interval(20, 30, Busy, None);
        fb.add_interval(10, 40, Tentative, None);

        assert_eq!(partition(&fb), before);
        assert_eq!(
            partition(&fb),
            vec![
                (0, 10, Free),
                (10, 20, Tentative),
                (20, 30, Busy),
                (30, 40, Tentative),
                (40, 100, Free),
            ]
        );
        assert_partition_invariants(&fb);
    }

    #[test]
    fn abutting_intervals_coalesce() {
        let mut fb = FreeBusy::new("u", 0, 100);
        fb.add_interval(10, 20, Busy, None);
        fb.add_interval(20, 30, Busy, None);
        fb.add_interval(0, 10, Busy, None);

        assert_eq!(partition(&fb), vec![(0, 30, Busy), (30, 100, Free)]);
        assert_partition_invariants(&fb);

        fb.add_interval(30, 100, Busy, None);
        assert_eq!(partition(&fb), vec![(0, 100, Busy)]);
    }

    #[test]
    fn clipped_to_window() {
        let mut fb = FreeBusy::new("u", 0, 100);
        fb.add_interval(-50, 5, Tentative, None);
        fb.add_interval(95, 500, Busy, None);
        fb.add_interval(40, 40, Busy, None);
        fb.add_interval(200, 300, Busy, None);

        assert_eq!(partition(&fb), vec![(0, 5, Tentative), (5, 95, Free), (95, 100, Busy)]);
        assert_partition_invariants(&fb);
    }

    #[test]
    fn lower_status_does_not_override() {
        let mut fb = FreeBusy::new("u", 0, 100);
        fb.add_interval(10, 50, Unavailable, None);
        fb.add_interval(20, 30, Tentative, None);
        fb.add_interval(0, 100, Free, None);

        assert_eq!(partition(&fb), vec![(0, 10, Free), (10, 50, Unavailable), (50, 100, Free)]);
    }

    #[test]
    fn busy_order() {
        assert_eq!(FreeBusyStatus::busier(&Busy, &Tentative), Busy);
        assert_eq!(FreeBusyStatus::busier(&Tentative, &Unavailable), Unavailable);
        assert_eq!(FreeBusyStatus::busier(&NoData, &Free), NoData);
        assert_eq!(FreeBusyStatus::busier(&NoData, &Tentative), Tentative);

        let odd = Other("X-WORKING-ELSEWHERE".to_string());
        assert_eq!(FreeBusyStatus::busier(&odd, &Free), Free);
        assert_eq!(FreeBusyStatus::busier(&odd, &Other("X-B".to_string())), odd);

        let mut fb = FreeBusy::new("u", 0, 10);
        fb.add_interval(0, 10, odd.clone(), None);
        assert_eq!(partition(&fb), vec![(0, 10, Free)]);
    }

    #[test]
    fn status_text_and_codes() {
        for status in &[Free, Busy, Tentative, Unavailable, NoData] {
            assert_eq!(&FreeBusyStatus::from_fbtype(status.as_fbtype()), status);
            assert_eq!(FreeBusyStatus::from_code(status.code().unwrap()).as_ref(), Some(status));
        }
        assert_eq!("busy-tentative".parse::<FreeBusyStatus>().unwrap(), Tentative);
        assert_eq!(FreeBusyStatus::from_fbtype("X-FOO"), Other("X-FOO".to_string()));

        let outlook = DefaultOutlookMap;
        assert_eq!(outlook.to_status("oof"), Some(Unavailable));
        assert_eq!(outlook.to_outlook(&Tentative), Some("TENTATIVE"));
        assert_eq!(outlook.to_status("WORKINGELSEWHERE"), None);
    }

    #[test]
    fn instances_follow_their_intervals() {
        let inst = |start, end, status: FreeBusyStatus, msg| FBInstance {
            start,
            end,
            invite: InviteInfo::new(msg, 0),
            recur_id: 0,
            status,
        };

        let fb = FreeBusy::build(
            "u",
            0,
            100,
            vec![inst(10, 30, Busy, 1), inst(20, 40, Busy, 2), inst(25, 35, Unavailable, 3)],
        );

        assert_eq!(partition(&fb), vec![(0, 10, Free), (10, 25, Busy), (25, 35, Unavailable), (35, 40, Busy), (40, 100, Free)]);
        let ids = |i: usize| -> Vec<i32> { fb.intervals()[i].instances.iter().map(|x| x.invite.msg_id).collect() };
        assert_eq!(ids(1), vec![1, 2]);
        assert_eq!(ids(2), vec![1, 2, 3]);
        assert_eq!(ids(3), vec![1, 2]);
        assert!(ids(0).is_empty());
    }

    #[test]
    fn nodata_window() {
        let mut fb = FreeBusy::nodata("u", 0, 100);
        fb.add_interval(10, 20, Free, None);
        fb.add_interval(30, 40, Busy, None);
        assert_eq!(partition(&fb), vec![(0, 30, NoData), (30, 40, Busy), (40, 100, NoData)]);
    }

    #[test]
    fn vfreebusy_round_trip() {
        let start = ParsedDateTime::parse_utc("19980313T141711Z").unwrap().utc_millis();
        let end = ParsedDateTime::parse_utc("19980410T141711Z").unwrap().utc_millis();
        let busy = ParsedDateTime::parse_utc("19980314T233000Z").unwrap().utc_millis();
        let tentative = ParsedDateTime::parse_utc("19980316T153000Z").unwrap().utc_millis();
        let hour = 3_600_000;

        let mut fb = FreeBusy::new("jsmith@example.com", start, end);
        fb.add_interval(busy, busy + hour, Busy, None);
        fb.add_interval(tentative, tentative + hour, Tentative, None);

        let url = Url::parse("http://www.example.com/calendar/busytime/jsmith.ifb").unwrap();
        let calendar = fb
            .to_component(Method::Publish, "jsmith@example.com", None, Some(&url), start)
            .unwrap();
        let text = calendar.as_string();
        assert!(text.contains("METHOD:PUBLISH\r\n"));
        assert!(text.contains("ORGANIZER:mailto:jsmith@example.com\r\n"));
        assert!(text.contains("FREEBUSY;FBTYPE=BUSY:19980314T233000Z/19980315T003000Z\r\n"));
        assert!(text.contains("FREEBUSY;FBTYPE=BUSY-TENTATIVE:19980316T153000Z/19980316T163000Z\r\n"));
        assert!(!text.contains("FBTYPE=FREE"));

        let mut map = TimeZoneMap::new(Arc::new(StaticWellKnownZones::new()));
        let parsed = Component::from_str_to_stream(&format!("{}\r\n", text)).unwrap().remove(0);
        let vfreebusy = parsed.components_named("VFREEBUSY").next().unwrap();
        let back = FreeBusy::from_component(vfreebusy, &mut map).unwrap();

        assert_eq!(back.name(), "jsmith@example.com");
        assert_eq!(partition(&back), partition(&fb));
    }

    #[test]
    fn vfreebusy_needs_organizer() {
        let mut map = TimeZoneMap::new(Arc::new(StaticWellKnownZones::new()));
        let mut comp = Component::new("VFREEBUSY");
        comp.push_property(Property::new("DTSTART", "19980313T141711Z"))
            .push_property(Property::new("DTEND", "19980410T141711Z"));

        assert!(matches!(
            FreeBusy::from_component(&comp, &mut map),
            Err(CalendarError::Parse { .. })
        ));
    }
}
