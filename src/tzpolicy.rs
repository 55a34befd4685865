//! Structural comparison of timezone rules.
//!
//! Clients send wildly different VTIMEZONE bodies for the same real-world
//! zone. Two zones are considered the same when their offsets agree and
//! their onsets fall on the same (month, week, weekday) or (month, day),
//! ignoring the time of day of the transition.

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::Arc,
};

use chrono::Weekday;
use tracing::{debug, info};

use crate::{
    duration::MILLIS_PER_MINUTE,
    timezone::{ICalTimeZone, OnsetDay, SimpleOnset},
    tzmap::TimeZoneMap,
    well_known::WellKnownTimeZones,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PolicyOnset {
    Week { month: u32, week: i8, weekday: Weekday },
    Day { month: u32, day: u32 },
}

impl PolicyOnset {
    fn from_onset(onset: &SimpleOnset) -> PolicyOnset {
        match onset.rule {
            OnsetDay::Nth { week, weekday } => PolicyOnset::Week {
                month: onset.month,
                week,
                weekday,
            },
            OnsetDay::DayOfMonth(day) => PolicyOnset::Day {
                month: onset.month,
                day,
            },
            // "Sunday on or after the 8th" is the second Sunday.
            OnsetDay::OnOrAfter { weekday, day } if day % 7 == 1 => PolicyOnset::Week {
                month: onset.month,
                week: (day / 7 + 1) as i8,
                weekday,
            },
            OnsetDay::OnOrAfter { day, .. } => PolicyOnset::Day {
                month: onset.month,
                day,
            },
        }
    }

    fn month(&self) -> u32 {
        match *self {
            PolicyOnset::Week { month, .. } | PolicyOnset::Day { month, .. } => month,
        }
    }

    /// month (4 bits), then either week (3), weekday (3), type bit 1, or
    /// month day (5), padding, type bit 0.
    fn hash_bits(&self) -> u32 {
        let mut hash = self.month() << 7;
        match *self {
            PolicyOnset::Week { week, weekday, .. } => {
                let week = if week == -1 { 5 } else { week as u32 };
                hash |= week << 4;
                hash |= weekday.number_from_sunday() << 1;
                hash |= 1;
            }
            PolicyOnset::Day { day, .. } => {
                hash |= day << 2;
            }
        }
        hash
    }
}

/// The normalized rule shape of a timezone.
#[derive(Debug, Clone)]
pub struct TimezonePolicy {
    name: String,
    standard_offset: i64,
    standard_onset: Option<PolicyOnset>,
    daylight_offset: i64,
    daylight_onset: Option<PolicyOnset>,
}

impl TimezonePolicy {
    pub fn from_zone(tz: &ICalTimeZone) -> TimezonePolicy {
        TimezonePolicy {
            name: tz.id().to_string(),
            standard_offset: tz.standard_offset() as i64,
            standard_onset: tz.standard_onset().map(PolicyOnset::from_onset),
            daylight_offset: tz.daylight_offset() as i64,
            daylight_onset: tz.daylight_onset().map(PolicyOnset::from_onset),
        }
    }

    /// Onsets on the Nth weekday of a month. Weekdays count from Sunday = 1.
    #[allow(clippy::too_many_arguments)]
    fn by_week(
        name: &str,
        std_minutes: i64,
        std_month: u32,
        std_week: i8,
        std_weekday: Weekday,
        dst_minutes: i64,
        dst_month: u32,
        dst_week: i8,
        dst_weekday: Weekday,
    ) -> TimezonePolicy {
        TimezonePolicy {
            name: name.to_string(),
            standard_offset: std_minutes * MILLIS_PER_MINUTE,
            standard_onset: Some(PolicyOnset::Week {
                month: std_month,
                week: std_week,
                weekday: std_weekday,
            }),
            daylight_offset: dst_minutes * MILLIS_PER_MINUTE,
            daylight_onset: Some(PolicyOnset::Week {
                month: dst_month,
                week: dst_week,
                weekday: dst_weekday,
            }),
        }
    }

    fn by_month_day(
        name: &str,
        std_minutes: i64,
        std_month: u32,
        std_day: u32,
        dst_minutes: i64,
        dst_month: u32,
        dst_day: u32,
    ) -> TimezonePolicy {
        TimezonePolicy {
            name: name.to_string(),
            standard_offset: std_minutes * MILLIS_PER_MINUTE,
            standard_onset: Some(PolicyOnset::Day {
                month: std_month,
                day: std_day,
            }),
            daylight_offset: dst_minutes * MILLIS_PER_MINUTE,
            daylight_onset: Some(PolicyOnset::Day {
                month: dst_month,
                day: dst_day,
            }),
        }
    }

    fn without_daylight(name: &str, minutes: i64) -> TimezonePolicy {
        TimezonePolicy {
            name: name.to_string(),
            standard_offset: minutes * MILLIS_PER_MINUTE,
            standard_onset: None,
            daylight_offset: minutes * MILLIS_PER_MINUTE,
            daylight_onset: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Packed into 31 bits: the standard offset in quarter hours from
    /// GMT-25:00, the direction of the daylight shift, and both onsets.
    pub fn policy_hash(&self) -> u32 {
        let minutes = (self.standard_offset / MILLIS_PER_MINUTE) as i32;
        let quarters = ((minutes + 25 * 60) / 15) as u32;
        // The top bits of the offset don't survive the shift.
        let mut hash = (quarters << 2) << 24;

        let direction: u32 = if self.daylight_offset > self.standard_offset {
            1
        } else if self.daylight_offset < self.standard_offset {
            2
        } else {
            0
        };
        hash |= direction << 22;

        if self.daylight_offset != self.standard_offset {
            if let Some(onset) = &self.standard_onset {
                hash |= onset.hash_bits() << 11;
            }
            if let Some(onset) = &self.daylight_onset {
                hash |= onset.hash_bits();
            }
        }

        hash
    }

    /// Daylight time declared, but both transitions on the same day.
    pub fn has_identical_onsets(&self) -> bool {
        self.standard_offset != self.daylight_offset
            && self.standard_onset.is_some()
            && self.daylight_onset.is_some()
            && same_onset(self.standard_onset.as_ref(), self.daylight_onset.as_ref())
    }
}

fn same_onset(a: Option<&PolicyOnset>, b: Option<&PolicyOnset>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl PartialEq for TimezonePolicy {
    fn eq(&self, other: &Self) -> bool {
        self.standard_offset == other.standard_offset
            && self.daylight_offset == other.daylight_offset
            && same_onset(self.standard_onset.as_ref(), other.standard_onset.as_ref())
            && same_onset(self.daylight_onset.as_ref(), other.daylight_onset.as_ref())
    }
}

impl Eq for TimezonePolicy {}

impl Hash for TimezonePolicy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.policy_hash());
    }
}

/// Find a well-known zone with the same rules as `def`.
///
/// This is the last resort of timezone lookup, used for ids that are
/// neither known nor aliases of anything known.
pub fn best_effort_match(
    def: &ICalTimeZone,
    well_known: &dyn WellKnownTimeZones,
) -> Option<Arc<ICalTimeZone>> {
    let policy = TimezonePolicy::from_zone(def);
    let found = well_known
        .zones()
        .into_iter()
        .find(|tz| TimezonePolicy::from_zone(tz) == policy);

    if let Some(tz) = &found {
        debug!(old = def.id(), new = tz.id(), "Timezone matched structurally");
    }
    found
}

/// A DST-free copy of `tz` if it declares daylight time with both onsets on
/// the same day.
pub fn without_identical_onsets(tz: &ICalTimeZone) -> Option<ICalTimeZone> {
    if TimezonePolicy::from_zone(tz).has_identical_onsets() {
        info!(
            "Found DST timezone without onset rules: {}; converting to non-DST timezone",
            tz.id()
        );
        Some(ICalTimeZone::fixed(tz.id(), tz.standard_offset()))
    } else {
        None
    }
}

/// Replacement tables for zones carrying outdated rules.
#[derive(Debug, Clone, Default)]
pub struct TimezoneFixup {
    replacements: HashMap<TimezonePolicy, Arc<ICalTimeZone>>,
}

const US_ZONES: &[(&str, i64)] = &[
    ("(GMT-09.00) Alaska", -540),
    ("(GMT-08.00) Pacific Time (US & Canada)", -480),
    ("(GMT-07.00) Mountain Time (US & Canada)", -420),
    ("(GMT-06.00) Central Time (US & Canada)", -360),
    ("(GMT-05.00) Eastern Time (US & Canada)", -300),
];

impl TimezoneFixup {
    fn insert(&mut self, policy: TimezonePolicy, tz: &Option<Arc<ICalTimeZone>>) {
        match tz {
            Some(tz) => {
                self.replacements.insert(policy, tz.clone());
            }
            None => debug!(policy = policy.name(), "No replacement zone available"),
        }
    }

    /// Pre-2007 United States rules, including the BYMONTHDAY renderings
    /// some clients produced for them.
    pub fn world(well_known: &dyn WellKnownTimeZones) -> TimezoneFixup {
        let mut fixup = TimezoneFixup::default();

        for &(id, std) in US_ZONES {
            let tz = well_known.get_by_id_or_alias(id);
            let dst = std + 60;

            fixup.insert(
                TimezonePolicy::by_week(
                    &format!("2006 {}", id),
                    std,
                    10,
                    -1,
                    Weekday::Sun,
                    dst,
                    4,
                    1,
                    Weekday::Sun,
                ),
                &tz,
            );
            for &(label, std_month, std_day, dst_month, dst_day) in &[
                ("2006 BYMONTHDAY using 2006 rule", 10, 29, 4, 2),
                ("2006 BYMONTHDAY using 2007 rule", 11, 5, 3, 12),
                ("2007 BYMONTHDAY using 2006 rule", 10, 28, 4, 1),
                ("2007 BYMONTHDAY using 2007 rule", 11, 4, 3, 11),
                ("January 1st without rule", 1, 1, 1, 1),
            ] {
                fixup.insert(
                    TimezonePolicy::by_month_day(
                        &format!("{} {}", id, label),
                        std,
                        std_month,
                        std_day,
                        dst,
                        dst_month,
                        dst_day,
                    ),
                    &tz,
                );
            }
        }

        fixup
    }

    pub fn australia(well_known: &dyn WellKnownTimeZones) -> TimezoneFixup {
        let mut fixup = TimezoneFixup::default();

        let perth = well_known.get_by_id_or_alias("(GMT+08.00) Perth");
        fixup.insert(TimezonePolicy::without_daylight("2006 Australia/Perth", 480), &perth);
        for &(label, std_month, std_day, dst_month, dst_day) in &[
            ("2006 Australia/Perth BYMONTHDAY using 2007 rule, rev 1", 3, 26, 12, 3),
            ("2007 Australia/Perth BYMONTHDAY using 2007 rule, rev 1", 3, 25, 12, 2),
            ("2006 Australia/Perth BYMONTHDAY using 2007 rule, rev 2", 3, 26, 10, 29),
            ("2007 Australia/Perth BYMONTHDAY using 2007 rule, rev 2", 3, 25, 10, 28),
            ("Australia/Perth January 1st without rule", 1, 1, 1, 1),
        ] {
            fixup.insert(
                TimezonePolicy::by_month_day(label, 480, std_month, std_day, 540, dst_month, dst_day),
                &perth,
            );
        }

        for &(id, std) in &[("(GMT+09.30) Adelaide", 570), ("(GMT+10.00) Canberra / Melbourne / Sydney", 600)] {
            fixup.insert(
                TimezonePolicy::by_month_day(&format!("{} January 1st without rule", id), std, 1, 1, std + 60, 1, 1),
                &well_known.get_by_id_or_alias(id),
            );
        }

        fixup
    }

    /// The table for a two-letter country code; `AU` has its own.
    pub fn for_country(country: Option<&str>, well_known: &dyn WellKnownTimeZones) -> TimezoneFixup {
        match country {
            Some(c) if c.eq_ignore_ascii_case("AU") => TimezoneFixup::australia(well_known),
            _ => TimezoneFixup::world(well_known),
        }
    }

    pub fn len(&self) -> usize {
        self.replacements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }

    /// The corrected zone, keeping the old id, or `None` if `tz` is fine.
    pub fn fix_zone(&self, tz: &ICalTimeZone) -> Option<ICalTimeZone> {
        match self.replacements.get(&TimezonePolicy::from_zone(tz)) {
            Some(replacement) => {
                info!(
                    "Found replacement timezone: old={}, new={}",
                    tz.id(),
                    replacement.id()
                );
                Some(replacement.clone_with_id(tz.id()))
            }
            None => without_identical_onsets(tz),
        }
    }

    /// Fix every zone of a map, including its local zone. Returns how many
    /// were replaced.
    pub fn fix_map(&self, map: &mut TimeZoneMap) -> usize {
        let fixed: Vec<ICalTimeZone> = map.zones().filter_map(|tz| self.fix_zone(tz)).collect();
        let mut count = fixed.len();
        for tz in fixed {
            map.add(tz);
        }

        if let Some(local) = map.local().and_then(|tz| self.fix_zone(tz)) {
            map.set_local(local);
            count += 1;
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        timezone::onset_time,
        well_known::StaticWellKnownZones,
    };

    fn zone(id: &str, std: i32, std_onset: SimpleOnset, dst: i32, dst_onset: SimpleOnset) -> ICalTimeZone {
        ICalTimeZone::new(id, std * 60_000, Some(std_onset), dst * 60_000, Some(dst_onset))
    }

    #[test]
    fn hash_layout() {
        let table = StaticWellKnownZones::new();
        let ny = table.get("America/New_York").unwrap();
        assert_eq!(TimezonePolicy::from_zone(&ny).policy_hash(), 1_080_859_043);

        let utc = table.get("UTC").unwrap();
        assert_eq!(TimezonePolicy::from_zone(&utc).policy_hash(), 2_415_919_104);
    }

    #[test]
    fn onset_time_is_ignored() {
        let table = StaticWellKnownZones::new();
        let ny = table.get("America/New_York").unwrap();

        let other = zone(
            "Eastern (from some client)",
            -300,
            SimpleOnset::nth(11, 1, Weekday::Sun, onset_time(1, 0, 0).unwrap()).unwrap(),
            -240,
            SimpleOnset::on_or_after(3, Weekday::Sun, 8, onset_time(3, 0, 0).unwrap()).unwrap(),
        );

        assert_eq!(TimezonePolicy::from_zone(&other), TimezonePolicy::from_zone(&ny));
        let found = best_effort_match(&other, &table).unwrap();
        assert_eq!(found.id(), "America/New_York");
    }

    #[test]
    fn different_rules_do_not_match() {
        let table = StaticWellKnownZones::new();
        let t = onset_time(2, 0, 0).unwrap();

        let odd = zone(
            "Somewhere",
            -300,
            SimpleOnset::nth(10, -1, Weekday::Sun, t).unwrap(),
            -240,
            SimpleOnset::nth(4, 1, Weekday::Sun, t).unwrap(),
        );
        assert!(best_effort_match(&odd, &table).is_none());

        let no_dst = ICalTimeZone::fixed("Mountain no DST", -420 * 60_000);
        assert_eq!(best_effort_match(&no_dst, &table).unwrap().id(), "America/Phoenix");
    }

    #[test_log::test]
    fn identical_onsets_become_dst_free() {
        let t = onset_time(0, 0, 0).unwrap();
        let broken = zone(
            "Broken",
            60,
            SimpleOnset::day_of_month(1, 1, t).unwrap(),
            120,
            SimpleOnset::day_of_month(1, 1, t).unwrap(),
        );
        assert!(TimezonePolicy::from_zone(&broken).has_identical_onsets());

        let fixed = without_identical_onsets(&broken).unwrap();
        assert_eq!(fixed.id(), "Broken");
        assert!(!fixed.has_daylight());
        assert_eq!(fixed.standard_offset(), 3_600_000);
    }

    #[test_log::test]
    fn legacy_us_rules_are_replaced() {
        let table = StaticWellKnownZones::new();
        let fixup = TimezoneFixup::world(&table);
        assert_eq!(fixup.len(), 30);

        let t = onset_time(2, 0, 0).unwrap();
        let old_pacific = zone(
            "Pacific (2006)",
            -480,
            SimpleOnset::nth(10, -1, Weekday::Sun, t).unwrap(),
            -420,
            SimpleOnset::nth(4, 1, Weekday::Sun, t).unwrap(),
        );

        let fixed = fixup.fix_zone(&old_pacific).unwrap();
        assert_eq!(fixed.id(), "Pacific (2006)");
        assert_eq!(fixed.daylight_rule(), Some("FREQ=YEARLY;BYMONTH=3;BYDAY=2SU"));

        let current = table.get("America/Los_Angeles").unwrap();
        assert!(fixup.fix_zone(&current).is_none());
    }

    #[test]
    fn australian_table() {
        let table = StaticWellKnownZones::new();
        let fixup = TimezoneFixup::for_country(Some("au"), &table);
        assert_eq!(fixup.len(), 8);

        let perth = ICalTimeZone::fixed("Perth (2006)", 480 * 60_000);
        assert_eq!(fixup.fix_zone(&perth).unwrap().standard_offset(), 480 * 60_000);
        assert!(TimezoneFixup::for_country(None, &table).fix_zone(&perth).is_none());
    }
}
