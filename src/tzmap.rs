use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tracing::debug;

use crate::{
    datetime::DateTimeZone,
    error::{CalendarError, Result},
    metadata::{MetaValue, Metadata},
    timezone::ICalTimeZone,
    tzpolicy::{best_effort_match, without_identical_onsets},
    well_known::WellKnownTimeZones,
};

const FN_ZONES: &str = "tzs";
const FN_ALIASES: &str = "al";
const FN_LOCAL: &str = "lc";

/// The timezones referenced by one calendar object.
///
/// Ids are resolved by [`TimeZoneMap::lookup_and_add`], which learns zones
/// and aliases as it goes. Once an object is fully read,
/// [`TimeZoneMap::reduce_to`] drops everything that isn't referenced.
#[derive(Debug, Clone)]
pub struct TimeZoneMap {
    zones: BTreeMap<String, Arc<ICalTimeZone>>,
    /// Raw id to the id of a zone in `zones`.
    aliases: BTreeMap<String, String>,
    /// VTIMEZONE bodies that came with the object, not yet resolved.
    definitions: BTreeMap<String, ICalTimeZone>,
    local: Option<Arc<ICalTimeZone>>,
    well_known: Arc<dyn WellKnownTimeZones>,
}

impl TimeZoneMap {
    pub fn new(well_known: Arc<dyn WellKnownTimeZones>) -> TimeZoneMap {
        TimeZoneMap {
            zones: BTreeMap::new(),
            aliases: BTreeMap::new(),
            definitions: BTreeMap::new(),
            local: None,
            well_known,
        }
    }

    /// Use `tz` for values that carry neither a TZID nor a `Z`.
    pub fn with_local(mut self, tz: ICalTimeZone) -> TimeZoneMap {
        self.set_local(tz);
        self
    }

    pub fn set_local(&mut self, tz: ICalTimeZone) {
        self.local = Some(Arc::new(tz));
    }

    pub fn local(&self) -> Option<&ICalTimeZone> {
        self.local.as_deref()
    }

    pub fn local_zone(&self) -> DateTimeZone {
        match &self.local {
            Some(tz) => DateTimeZone::from_zone(tz.clone()),
            None => DateTimeZone::Floating,
        }
    }

    pub fn well_known(&self) -> &Arc<dyn WellKnownTimeZones> {
        &self.well_known
    }

    /// Add (or replace) a zone under its own id.
    pub fn add(&mut self, tz: ICalTimeZone) -> Arc<ICalTimeZone> {
        let tz = Arc::new(tz);
        self.zones.insert(tz.id().to_string(), tz.clone());
        tz
    }

    fn add_shared(&mut self, tz: Arc<ICalTimeZone>) -> Arc<ICalTimeZone> {
        self.zones
            .entry(tz.id().to_string())
            .or_insert(tz)
            .clone()
    }

    /// Remember a VTIMEZONE body for ids that aren't otherwise known.
    pub fn add_definition(&mut self, tz: ICalTimeZone) {
        self.definitions.insert(tz.id().to_string(), tz);
    }

    pub fn add_alias(&mut self, alias: &str, id: &str) {
        if alias != id {
            self.aliases.insert(alias.to_string(), id.to_string());
        }
    }

    /// A zone by id or alias, without consulting anything outside the map.
    pub fn get(&self, id: &str) -> Option<Arc<ICalTimeZone>> {
        self.zones.get(id).cloned().or_else(|| {
            self.aliases
                .get(id)
                .and_then(|canonical| self.zones.get(canonical))
                .cloned()
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn zones(&self) -> impl Iterator<Item = &ICalTimeZone> {
        self.zones.values().map(|tz| tz.as_ref())
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }

    /// Resolve a TZID parameter, adding what was learned to the map.
    ///
    /// Stages, in order: a zone already in the map, an alias already in
    /// the map, the well-known table (by id or alias), and finally a
    /// structural match of the object's own VTIMEZONE body against the
    /// well-known zones. An empty id resolves to `None`.
    pub fn lookup_and_add(&mut self, raw_id: &str) -> Result<Option<Arc<ICalTimeZone>>> {
        let id = raw_id.trim().trim_matches('"');
        if id.is_empty() {
            return Ok(None);
        }

        if let Some(tz) = self.zones.get(id) {
            return Ok(Some(tz.clone()));
        }

        if let Some(tz) = self.aliases.get(id).and_then(|c| self.zones.get(c)) {
            return Ok(Some(tz.clone()));
        }

        if let Some(tz) = self.well_known.get_by_id_or_alias(id) {
            if tz.id() != id {
                debug!(alias = id, tzid = tz.id(), "Canonicalized timezone id");
                self.add_alias(id, tz.id());
            }
            return Ok(Some(self.add_shared(tz)));
        }

        if let Some(def) = self.definitions.get(id).cloned() {
            let tz = match best_effort_match(&def, self.well_known.as_ref()) {
                Some(tz) => {
                    self.add_alias(id, tz.id());
                    self.add_shared(tz)
                }
                None => self.add(without_identical_onsets(&def).unwrap_or(def)),
            };
            return Ok(Some(tz));
        }

        Err(CalendarError::TimezoneLookup(id.to_string()))
    }

    /// Keep only the zones (and aliases) for the given referenced ids.
    pub fn reduce_to(&mut self, referenced: &BTreeSet<String>) {
        let aliases: BTreeMap<String, String> = std::mem::take(&mut self.aliases)
            .into_iter()
            .filter(|(alias, _)| referenced.contains(alias))
            .collect();

        let keep: BTreeSet<&str> = referenced
            .iter()
            .map(String::as_str)
            .chain(aliases.values().map(String::as_str))
            .collect();

        self.zones.retain(|id, _| keep.contains(id.as_str()));
        self.aliases = aliases;
        self.definitions.clear();
    }

    pub fn encode_metadata(&self) -> Metadata {
        let mut aliases = Metadata::new();
        for (alias, id) in &self.aliases {
            aliases.put_str(alias, id.as_str());
        }

        let mut meta = Metadata::new();
        meta.put_list(
            FN_ZONES,
            self.zones
                .values()
                .map(|tz| MetaValue::Map(tz.encode_metadata()))
                .collect(),
        )
        .put_map(FN_ALIASES, aliases);
        if let Some(local) = &self.local {
            meta.put_map(FN_LOCAL, local.encode_metadata());
        }
        meta
    }

    pub fn decode_metadata(meta: &Metadata, well_known: Arc<dyn WellKnownTimeZones>) -> Result<TimeZoneMap> {
        let mut map = TimeZoneMap::new(well_known);

        for value in meta.get_list(FN_ZONES).unwrap_or(&[]) {
            match value {
                MetaValue::Map(zone) => {
                    map.add(ICalTimeZone::decode_metadata(zone)?);
                }
                other => {
                    return Err(CalendarError::Metadata(format!(
                        "expected a timezone map, got {:?}",
                        other
                    )))
                }
            }
        }

        if let Some(aliases) = meta.get_opt_map(FN_ALIASES) {
            for alias in aliases.keys() {
                let id = aliases.get_str(alias)?.to_string();
                map.aliases.insert(alias.to_string(), id);
            }
        }

        if let Some(local) = meta.get_opt_map(FN_LOCAL) {
            map.set_local(ICalTimeZone::decode_metadata(local)?);
        }

        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        parser::Component,
        timezone::{onset_time, SimpleOnset},
        well_known::StaticWellKnownZones,
    };
    use chrono::Weekday;

    fn map() -> TimeZoneMap {
        TimeZoneMap::new(Arc::new(StaticWellKnownZones::new()))
    }

    fn vtimezone(text: &str) -> ICalTimeZone {
        let component = Component::from_str_to_stream(text).unwrap().remove(0);
        ICalTimeZone::from_component(&component).unwrap()
    }

    const OUTLOOK_EASTERN: &str = "BEGIN:VTIMEZONE\r\n\
        TZID:Eastern (Outlook)\r\n\
        BEGIN:STANDARD\r\n\
        DTSTART:16011104T020000\r\n\
        RRULE:FREQ=YEARLY;BYDAY=1SU;BYMONTH=11\r\n\
        TZOFFSETFROM:-0400\r\n\
        TZOFFSETTO:-0500\r\n\
        END:STANDARD\r\n\
        BEGIN:DAYLIGHT\r\n\
        DTSTART:16010311T020000\r\n\
        RRULE:FREQ=YEARLY;BYDAY=2SU;BYMONTH=3\r\n\
        TZOFFSETFROM:-0500\r\n\
        TZOFFSETTO:-0400\r\n\
        END:DAYLIGHT\r\n\
        END:VTIMEZONE\r\n";

    #[test]
    fn literal_then_alias() {
        let mut map = map();
        let custom = map.add(ICalTimeZone::fixed("My Zone", 7_200_000));
        map.add_alias("Other Name", "My Zone");

        assert_eq!(map.lookup_and_add("My Zone").unwrap(), Some(custom.clone()));
        assert_eq!(map.lookup_and_add("\"Other Name\"").unwrap(), Some(custom));
        assert_eq!(map.lookup_and_add("  ").unwrap(), None);
    }

    #[test]
    fn literal_wins_over_well_known() {
        let mut map = map();
        map.add(ICalTimeZone::fixed("America/New_York", 0));

        let tz = map.lookup_and_add("America/New_York").unwrap().unwrap();
        assert!(!tz.has_daylight());
    }

    #[test_log::test]
    fn well_known_alias_is_canonicalized() {
        let mut map = map();
        let tz = map.lookup_and_add("US/Eastern").unwrap().unwrap();

        assert_eq!(tz.id(), "America/New_York");
        assert!(map.contains("America/New_York"));
        assert_eq!(map.aliases().collect::<Vec<_>>(), vec![("US/Eastern", "America/New_York")]);

        let again = map.lookup_and_add("US/Eastern").unwrap().unwrap();
        assert!(Arc::ptr_eq(&tz, &again));
    }

    #[test_log::test]
    fn definitions_match_structurally() {
        let mut map = map();
        map.add_definition(vtimezone(OUTLOOK_EASTERN));

        let tz = map.lookup_and_add("Eastern (Outlook)").unwrap().unwrap();
        assert_eq!(tz.id(), "America/New_York");
        assert_eq!(map.get("Eastern (Outlook)").unwrap().id(), "America/New_York");
    }

    #[test]
    fn unmatched_definitions_are_kept() {
        let mut map = map();
        let t = onset_time(2, 0, 0).unwrap();
        map.add_definition(ICalTimeZone::new(
            "Old Eastern",
            -18_000_000,
            Some(SimpleOnset::nth(10, -1, Weekday::Sun, t).unwrap()),
            -14_400_000,
            Some(SimpleOnset::nth(4, 1, Weekday::Sun, t).unwrap()),
        ));

        let tz = map.lookup_and_add("Old Eastern").unwrap().unwrap();
        assert_eq!(tz.id(), "Old Eastern");
        assert!(tz.has_daylight());
    }

    #[test]
    fn unknown_ids_fail() {
        let mut map = map();
        assert_eq!(
            map.lookup_and_add("Nowhere").unwrap_err(),
            CalendarError::TimezoneLookup("Nowhere".to_string())
        );
    }

    #[test]
    fn reduce_to_referenced() {
        let mut map = map();
        map.lookup_and_add("US/Pacific").unwrap();
        map.lookup_and_add("Europe/London").unwrap();
        map.add(ICalTimeZone::fixed("Unused", 0));

        let referenced: BTreeSet<String> = vec!["US/Pacific".to_string()].into_iter().collect();
        map.reduce_to(&referenced);

        let ids: Vec<&str> = map.zones().map(|tz| tz.id()).collect();
        assert_eq!(ids, vec!["America/Los_Angeles"]);
        assert!(map.contains("US/Pacific"));
    }

    #[test]
    fn metadata_round_trip() {
        let mut map = map().with_local(ICalTimeZone::fixed("Local", 3_600_000));
        map.lookup_and_add("US/Central").unwrap();
        map.add(ICalTimeZone::fixed("Custom", -3_600_000));

        let json = map.encode_metadata().to_json();
        let decoded = TimeZoneMap::decode_metadata(
            &Metadata::from_json(&json).unwrap(),
            Arc::new(StaticWellKnownZones::new()),
        )
        .unwrap();

        assert_eq!(
            decoded.zones().map(|tz| tz.id()).collect::<Vec<_>>(),
            vec!["America/Chicago", "Custom"]
        );
        assert_eq!(decoded.get("US/Central").unwrap().id(), "America/Chicago");
        assert_eq!(decoded.local().unwrap().standard_offset(), 3_600_000);
    }
}
