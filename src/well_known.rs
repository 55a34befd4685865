//! The table of zones every server knows about.

use std::{collections::BTreeMap, fmt, sync::Arc};

use chrono::Weekday;
use tracing::warn;

use crate::{
    duration::MILLIS_PER_MINUTE,
    error::Result,
    timezone::{onset_time, ICalTimeZone, SimpleOnset},
};

/// Source of well-known timezone definitions.
pub trait WellKnownTimeZones: fmt::Debug + Send + Sync {
    /// Zone by canonical id.
    fn get(&self, id: &str) -> Option<Arc<ICalTimeZone>>;

    /// Canonical id for an id or one of its aliases.
    fn canonical_id(&self, id: &str) -> Option<String>;

    /// All zones, in preference order for structural matching.
    fn zones(&self) -> Vec<Arc<ICalTimeZone>>;

    fn get_by_id_or_alias(&self, id: &str) -> Option<Arc<ICalTimeZone>> {
        self.canonical_id(id).and_then(|cid| self.get(&cid))
    }
}

/// A small built-in table.
#[derive(Debug, Clone)]
pub struct StaticWellKnownZones {
    zones: Vec<Arc<ICalTimeZone>>,
    /// Lower-cased id or alias to canonical id.
    ids: BTreeMap<String, String>,
}

fn minutes(m: i32) -> i32 {
    m * MILLIS_PER_MINUTE as i32
}

fn us_zone(id: &str, std_minutes: i32) -> Result<ICalTimeZone> {
    let two_am = onset_time(2, 0, 0)?;
    Ok(ICalTimeZone::new(
        id,
        minutes(std_minutes),
        Some(SimpleOnset::nth(11, 1, Weekday::Sun, two_am)?),
        minutes(std_minutes + 60),
        Some(SimpleOnset::nth(3, 2, Weekday::Sun, two_am)?),
    ))
}

fn eu_zone(id: &str, std_minutes: i32) -> Result<ICalTimeZone> {
    // Both transitions happen at 01:00 UTC.
    let dst = onset_time((1 + std_minutes / 60) as u32, 0, 0)?;
    let std = onset_time((2 + std_minutes / 60) as u32, 0, 0)?;
    Ok(ICalTimeZone::new(
        id,
        minutes(std_minutes),
        Some(SimpleOnset::nth(10, -1, Weekday::Sun, std)?),
        minutes(std_minutes + 60),
        Some(SimpleOnset::nth(3, -1, Weekday::Sun, dst)?),
    ))
}

fn builtin() -> Result<Vec<(ICalTimeZone, &'static [&'static str])>> {
    Ok(vec![
        (ICalTimeZone::fixed("UTC", 0), &["Etc/UTC", "GMT", "Etc/GMT", "UTC Standard Time"][..]),
        (
            us_zone("America/New_York", -300)?,
            &[
                "US/Eastern",
                "Eastern Standard Time",
                "(GMT-05.00) Eastern Time (US & Canada)",
                "EST5EDT",
            ][..],
        ),
        (
            us_zone("America/Chicago", -360)?,
            &[
                "US/Central",
                "Central Standard Time",
                "(GMT-06.00) Central Time (US & Canada)",
                "CST6CDT",
            ][..],
        ),
        (
            us_zone("America/Denver", -420)?,
            &[
                "US/Mountain",
                "Mountain Standard Time",
                "(GMT-07.00) Mountain Time (US & Canada)",
                "MST7MDT",
            ][..],
        ),
        (
            ICalTimeZone::fixed("America/Phoenix", minutes(-420)),
            &["US/Arizona", "US Mountain Standard Time", "(GMT-07.00) Arizona"][..],
        ),
        (
            us_zone("America/Los_Angeles", -480)?,
            &[
                "US/Pacific",
                "Pacific Standard Time",
                "(GMT-08.00) Pacific Time (US & Canada)",
                "PST8PDT",
            ][..],
        ),
        (
            us_zone("America/Anchorage", -540)?,
            &["US/Alaska", "Alaskan Standard Time", "(GMT-09.00) Alaska"][..],
        ),
        (
            eu_zone("Europe/London", 0)?,
            &[
                "GMT Standard Time",
                "Europe/Belfast",
                "(GMT) Greenwich Mean Time - Dublin / Edinburgh / Lisbon / London",
            ][..],
        ),
        (
            eu_zone("Europe/Berlin", 60)?,
            &[
                "W. Europe Standard Time",
                "(GMT+01.00) Amsterdam / Berlin / Bern / Rome / Stockholm / Vienna",
            ][..],
        ),
        (
            ICalTimeZone::fixed("Asia/Kolkata", minutes(330)),
            &["Asia/Calcutta", "India Standard Time", "(GMT+05.30) Chennai / Kolkata / Mumbai / New Delhi"][..],
        ),
        (
            ICalTimeZone::fixed("Asia/Tokyo", minutes(540)),
            &["Tokyo Standard Time", "Japan", "(GMT+09.00) Osaka / Sapporo / Tokyo"][..],
        ),
        (
            ICalTimeZone::fixed("Australia/Perth", minutes(480)),
            &["W. Australia Standard Time", "(GMT+08.00) Perth"][..],
        ),
        (
            ICalTimeZone::new(
                "Australia/Adelaide",
                minutes(570),
                Some(SimpleOnset::nth(4, 1, Weekday::Sun, onset_time(3, 0, 0)?)?),
                minutes(630),
                Some(SimpleOnset::nth(10, 1, Weekday::Sun, onset_time(2, 0, 0)?)?),
            ),
            &["Cen. Australia Standard Time", "Australia/South", "(GMT+09.30) Adelaide"][..],
        ),
        (
            ICalTimeZone::new(
                "Australia/Sydney",
                minutes(600),
                Some(SimpleOnset::nth(4, 1, Weekday::Sun, onset_time(3, 0, 0)?)?),
                minutes(660),
                Some(SimpleOnset::nth(10, 1, Weekday::Sun, onset_time(2, 0, 0)?)?),
            ),
            &[
                "AUS Eastern Standard Time",
                "Australia/NSW",
                "(GMT+10.00) Canberra / Melbourne / Sydney",
            ][..],
        ),
    ])
}

impl StaticWellKnownZones {
    pub fn new() -> StaticWellKnownZones {
        let table = builtin().unwrap_or_else(|e| {
            warn!("Built-in timezone table is broken: {}", e);
            vec![(ICalTimeZone::fixed("UTC", 0), &[][..])]
        });

        let mut zones = Vec::with_capacity(table.len());
        let mut ids = BTreeMap::new();

        for (tz, aliases) in table {
            ids.insert(tz.id().to_ascii_lowercase(), tz.id().to_string());
            for alias in aliases {
                ids.insert(alias.to_ascii_lowercase(), tz.id().to_string());
            }
            zones.push(Arc::new(tz));
        }

        StaticWellKnownZones { zones, ids }
    }
}

impl Default for StaticWellKnownZones {
    fn default() -> Self {
        StaticWellKnownZones::new()
    }
}

impl WellKnownTimeZones for StaticWellKnownZones {
    fn get(&self, id: &str) -> Option<Arc<ICalTimeZone>> {
        self.zones.iter().find(|tz| tz.id() == id).cloned()
    }

    fn canonical_id(&self, id: &str) -> Option<String> {
        self.ids.get(&id.to_ascii_lowercase()).cloned()
    }

    fn zones(&self) -> Vec<Arc<ICalTimeZone>> {
        self.zones.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_case_insensitively() {
        let table = StaticWellKnownZones::new();

        assert_eq!(table.canonical_id("America/New_York").as_deref(), Some("America/New_York"));
        assert_eq!(table.canonical_id("us/eastern").as_deref(), Some("America/New_York"));
        assert_eq!(
            table.canonical_id("(GMT-08.00) Pacific Time (US & Canada)").as_deref(),
            Some("America/Los_Angeles")
        );
        assert_eq!(table.canonical_id("Nowhere/Special"), None);

        let tz = table.get_by_id_or_alias("Eastern Standard Time").unwrap();
        assert_eq!(tz.id(), "America/New_York");
        assert!(tz.has_daylight());
    }

    #[test]
    fn european_transitions_are_simultaneous() {
        let table = StaticWellKnownZones::new();
        let london = table.get("Europe/London").unwrap();
        let berlin = table.get("Europe/Berlin").unwrap();

        // 2022-03-27T01:00:00Z
        let switch = 1_648_342_800_000;
        assert_eq!(london.offset_at_utc(switch - 1), 0);
        assert_eq!(london.offset_at_utc(switch), 3_600_000);
        assert_eq!(berlin.offset_at_utc(switch - 1), 3_600_000);
        assert_eq!(berlin.offset_at_utc(switch), 7_200_000);
    }
}
