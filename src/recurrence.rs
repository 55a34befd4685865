//! Rule trees built from an invite's RRULE, RDATE, EXRULE and EXDATE
//! properties, and from the exceptions and cancellations attached to it.
//!
//! Every tree expands to a sorted list of [`Instance`]s within a window,
//! and can be persisted as [`Metadata`] keyed by the `t` discriminant.

use std::{
    collections::{BTreeSet, HashSet},
    convert::TryFrom,
    fmt,
    str::FromStr,
};

use itertools::Itertools;
use tracing::debug;

use crate::{
    config::ExpansionLimits,
    datetime::ParsedDateTime,
    duration::ParsedDuration,
    error::{CalendarError, Result},
    metadata::{MetaValue, Metadata},
    parser::Property,
    recur::{EndCondition, RecurRule},
    tzmap::TimeZoneMap,
};

const TYPE_SIMPLE_REPEATING: i64 = 2;
const TYPE_EXCEPTION: i64 = 3;
const TYPE_RECURRENCE: i64 = 4;
const TYPE_SINGLE_INSTANCE: i64 = 5;

/// The RANGE parameter of a RECURRENCE-ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecurRange {
    None,
    ThisAndFuture,
    ThisAndPrior,
}

impl RecurRange {
    fn code(self) -> i64 {
        match self {
            RecurRange::None => 1,
            RecurRange::ThisAndFuture => 2,
            RecurRange::ThisAndPrior => 3,
        }
    }

    fn from_code(code: i64) -> Result<RecurRange> {
        match code {
            1 => Ok(RecurRange::None),
            2 => Ok(RecurRange::ThisAndFuture),
            3 => Ok(RecurRange::ThisAndPrior),
            other => Err(CalendarError::Metadata(format!("unknown range type {}", other))),
        }
    }

    pub fn as_param(self) -> Option<&'static str> {
        match self {
            RecurRange::None => None,
            RecurRange::ThisAndFuture => Some("THISANDFUTURE"),
            RecurRange::ThisAndPrior => Some("THISANDPRIOR"),
        }
    }
}

impl FromStr for RecurRange {
    type Err = CalendarError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "THISANDFUTURE" => Ok(RecurRange::ThisAndFuture),
            "THISANDPRIOR" => Ok(RecurRange::ThisAndPrior),
            _ => Err(CalendarError::parse(
                "RANGE",
                value,
                "expected THISANDFUTURE or THISANDPRIOR",
            )),
        }
    }
}

/// A RECURRENCE-ID: the original start of the instance an exception
/// replaces, optionally extended to the instances before or after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurId {
    dt: ParsedDateTime,
    range: RecurRange,
}

impl RecurId {
    pub fn new(dt: ParsedDateTime, range: RecurRange) -> RecurId {
        RecurId { dt, range }
    }

    pub fn dt(&self) -> &ParsedDateTime {
        &self.dt
    }

    pub fn range(&self) -> RecurRange {
        self.range
    }

    /// Whether an instance starting at `instant` is covered.
    pub fn within_range(&self, instant: i64) -> bool {
        let at = self.dt.utc_millis();
        match self.range {
            RecurRange::None => instant == at,
            RecurRange::ThisAndFuture => instant >= at,
            RecurRange::ThisAndPrior => instant <= at,
        }
    }

    pub fn from_property(prop: &Property, tzmap: &mut TimeZoneMap) -> Result<RecurId> {
        let range = match prop.get_param("RANGE") {
            Some(range) => range.parse()?,
            None => RecurRange::None,
        };
        Ok(RecurId::new(ParsedDateTime::from_property(prop, tzmap)?, range))
    }

    pub fn to_property(&self) -> Property {
        let prop = self.dt.to_property("RECURRENCE-ID");
        match self.range.as_param() {
            Some(range) => prop.with_param("RANGE", range),
            None => prop,
        }
    }

    pub fn encode_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.put_str("rid", self.dt.to_meta())
            .put_long("rgtyp", self.range.code());
        meta
    }

    pub fn decode_metadata(meta: &Metadata, tzmap: &mut TimeZoneMap) -> Result<RecurId> {
        let dt = ParsedDateTime::from_meta(meta.get_str("rid")?, tzmap)?;
        let range = RecurRange::from_code(meta.get_long_or("rgtyp", 1)?)?;
        Ok(RecurId::new(dt, range))
    }
}

impl fmt::Display for RecurId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_property().as_string())
    }
}

/// Identifies the stored invite an instance came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InviteInfo {
    pub msg_id: i32,
    pub comp_id: i32,
}

impl InviteInfo {
    pub fn new(msg_id: i32, comp_id: i32) -> InviteInfo {
        InviteInfo { msg_id, comp_id }
    }

    pub fn encode_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.put_long("mid", i64::from(self.msg_id))
            .put_long("cid", i64::from(self.comp_id));
        meta
    }

    pub fn decode_metadata(meta: &Metadata) -> Result<InviteInfo> {
        let id = |key: &str| -> Result<i32> {
            let value = meta.get_long_or(key, 0)?;
            i32::try_from(value)
                .map_err(|_| CalendarError::Metadata(format!("field '{}' out of range: {}", key, value)))
        };
        Ok(InviteInfo::new(id("mid")?, id("cid")?))
    }
}

impl fmt::Display for InviteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.msg_id, self.comp_id)
    }
}

/// One expanded occurrence, in UTC milliseconds. Instances order by start,
/// then end.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instance {
    pub start: i64,
    pub end: i64,
    pub invite: InviteInfo,
    pub is_exception: bool,
    pub all_day: bool,
}

impl Instance {
    pub fn new(start: i64, end: i64, invite: InviteInfo, all_day: bool) -> Instance {
        Instance {
            start,
            end,
            invite,
            is_exception: false,
            all_day,
        }
    }

    fn at(start: &ParsedDateTime, duration: &ParsedDuration, invite: InviteInfo) -> Instance {
        Instance::new(
            start.utc_millis(),
            start.add(duration).utc_millis(),
            invite,
            !start.has_time(),
        )
    }

    /// Half-open overlap with `[range_start, range_end)`. A zero-length
    /// instance counts when it starts inside the range.
    pub fn overlaps(&self, range_start: i64, range_end: i64) -> bool {
        self.start < range_end && (self.end > range_start || self.start >= range_start)
    }
}

/// Stable merge of sorted lists. Equal start and end collapse to the first
/// one seen when `remove_duplicates` is set.
fn merge_sorted(lists: Vec<Vec<Instance>>, remove_duplicates: bool) -> Vec<Instance> {
    let mut merged: Vec<Instance> = lists
        .into_iter()
        .flatten()
        .sorted_by_key(|inst| (inst.start, inst.end))
        .collect();

    if remove_duplicates {
        merged.dedup_by(|b, a| a.start == b.start && a.end == b.end);
    }
    merged
}

/// Drop every instance whose start matches an excluded start.
fn subtract_sorted(instances: Vec<Instance>, excluded: &[Instance]) -> Vec<Instance> {
    if excluded.is_empty() {
        return instances;
    }

    let starts: HashSet<i64> = excluded.iter().map(|inst| inst.start).collect();
    instances
        .into_iter()
        .filter(|inst| !starts.contains(&inst.start))
        .collect()
}

fn collect_tzid(dt: &ParsedDateTime, ids: &mut BTreeSet<String>) {
    if let Some(tzid) = dt.tzid() {
        ids.insert(tzid.to_string());
    }
}

/// An RDATE or EXDATE value.
#[derive(Debug, Clone, PartialEq)]
pub enum DateValue {
    DateTime(ParsedDateTime),
    Period {
        start: ParsedDateTime,
        end: ParsedDateTime,
    },
}

impl DateValue {
    /// Parse the comma separated values of an RDATE or EXDATE property.
    pub fn parse_list(prop: &Property, tzmap: &mut TimeZoneMap) -> Result<Vec<DateValue>> {
        let tzid = prop.get_param("TZID");
        let periods = prop
            .get_param("VALUE")
            .map_or(false, |v| v.eq_ignore_ascii_case("PERIOD"));

        let mut values = Vec::new();
        for text in prop.value.split(',').map(str::trim).filter(|v| !v.is_empty()) {
            if !periods && !text.contains('/') {
                values.push(DateValue::DateTime(ParsedDateTime::parse(text, tzid, tzmap)?));
                continue;
            }

            let (start, end) = text
                .split_once('/')
                .ok_or_else(|| CalendarError::parse("period", text, "missing '/'"))?;
            let start = ParsedDateTime::parse(start, tzid, tzmap)?;
            let end = if end.starts_with(&['P', '+', '-'][..]) {
                start.add(&end.parse()?)
            } else {
                ParsedDateTime::parse(end, tzid, tzmap)?
            };
            values.push(DateValue::Period { start, end });
        }

        Ok(values)
    }

    pub fn start(&self) -> &ParsedDateTime {
        match self {
            DateValue::DateTime(dt) => dt,
            DateValue::Period { start, .. } => start,
        }
    }

    fn instance(&self, duration: &ParsedDuration, invite: InviteInfo) -> Instance {
        match self {
            DateValue::DateTime(dt) => Instance::at(dt, duration, invite),
            DateValue::Period { start, end } => Instance::new(
                start.utc_millis(),
                end.utc_millis(),
                invite,
                !start.has_time(),
            ),
        }
    }

    fn end(&self, duration: &ParsedDuration) -> ParsedDateTime {
        match self {
            DateValue::DateTime(dt) => dt.add(duration),
            DateValue::Period { end, .. } => end.clone(),
        }
    }

    fn text(&self) -> String {
        match self {
            DateValue::DateTime(dt) => dt.to_string(),
            DateValue::Period { start, end } => format!("{}/{}", start, end),
        }
    }

    fn encode(&self) -> MetaValue {
        match self {
            DateValue::DateTime(dt) => MetaValue::Str(dt.to_meta()),
            DateValue::Period { start, end } => MetaValue::List(vec![
                MetaValue::Str(start.to_meta()),
                MetaValue::Str(end.to_meta()),
            ]),
        }
    }

    fn decode(value: &MetaValue, tzmap: &mut TimeZoneMap) -> Result<DateValue> {
        match value {
            MetaValue::Str(text) => Ok(DateValue::DateTime(ParsedDateTime::from_meta(text, tzmap)?)),
            MetaValue::List(pair) => match pair.as_slice() {
                [MetaValue::Str(start), MetaValue::Str(end)] => Ok(DateValue::Period {
                    start: ParsedDateTime::from_meta(start, tzmap)?,
                    end: ParsedDateTime::from_meta(end, tzmap)?,
                }),
                _ => Err(CalendarError::Metadata(format!("bad period: {:?}", pair))),
            },
            other => Err(CalendarError::Metadata(format!("bad date value: {:?}", other))),
        }
    }
}

/// What a [`SimpleRepeatingRule`] repeats by.
#[derive(Debug, Clone, PartialEq)]
pub enum Repeat {
    Rule(RecurRule),
    Dates(Vec<DateValue>),
}

/// One RRULE, EXRULE, RDATE or EXDATE property, anchored at the series'
/// DTSTART.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleRepeatingRule {
    dtstart: ParsedDateTime,
    duration: ParsedDuration,
    repeat: Repeat,
    exclude: bool,
    invite: InviteInfo,
}

impl SimpleRepeatingRule {
    pub fn rrule(
        dtstart: ParsedDateTime,
        duration: ParsedDuration,
        rule: RecurRule,
        invite: InviteInfo,
    ) -> SimpleRepeatingRule {
        SimpleRepeatingRule {
            dtstart,
            duration,
            repeat: Repeat::Rule(rule),
            exclude: false,
            invite,
        }
    }

    pub fn exrule(
        dtstart: ParsedDateTime,
        duration: ParsedDuration,
        rule: RecurRule,
        invite: InviteInfo,
    ) -> SimpleRepeatingRule {
        SimpleRepeatingRule {
            exclude: true,
            ..SimpleRepeatingRule::rrule(dtstart, duration, rule, invite)
        }
    }

    pub fn rdate(
        dtstart: ParsedDateTime,
        duration: ParsedDuration,
        dates: Vec<DateValue>,
        invite: InviteInfo,
    ) -> SimpleRepeatingRule {
        SimpleRepeatingRule {
            dtstart,
            duration,
            repeat: Repeat::Dates(dates),
            exclude: false,
            invite,
        }
    }

    /// Periods can't be excluded, only start times.
    pub fn exdate(
        dtstart: ParsedDateTime,
        duration: ParsedDuration,
        dates: Vec<DateValue>,
        invite: InviteInfo,
    ) -> Result<SimpleRepeatingRule> {
        if let Some(period) = dates.iter().find(|d| matches!(d, DateValue::Period { .. })) {
            return Err(CalendarError::InvalidRule(format!(
                "EXDATE can't hold the period {}",
                period.text()
            )));
        }

        Ok(SimpleRepeatingRule {
            exclude: true,
            ..SimpleRepeatingRule::rdate(dtstart, duration, dates, invite)
        })
    }

    /// Build from an RRULE, EXRULE, RDATE or EXDATE property.
    pub fn from_property(
        prop: &Property,
        dtstart: &ParsedDateTime,
        duration: ParsedDuration,
        invite: InviteInfo,
        tzmap: &mut TimeZoneMap,
    ) -> Result<SimpleRepeatingRule> {
        let dtstart = dtstart.clone();
        match prop.name.to_ascii_uppercase().as_str() {
            "RRULE" => Ok(SimpleRepeatingRule::rrule(dtstart, duration, prop.value.parse()?, invite)),
            "EXRULE" => Ok(SimpleRepeatingRule::exrule(dtstart, duration, prop.value.parse()?, invite)),
            "RDATE" => Ok(SimpleRepeatingRule::rdate(
                dtstart,
                duration,
                DateValue::parse_list(prop, tzmap)?,
                invite,
            )),
            "EXDATE" => SimpleRepeatingRule::exdate(
                dtstart,
                duration,
                DateValue::parse_list(prop, tzmap)?,
                invite,
            ),
            other => Err(CalendarError::InvalidRule(format!(
                "{} is not a recurrence property",
                other
            ))),
        }
    }

    pub fn is_exclusion(&self) -> bool {
        self.exclude
    }

    pub fn repeat(&self) -> &Repeat {
        &self.repeat
    }

    pub fn dtstart(&self) -> &ParsedDateTime {
        &self.dtstart
    }

    pub fn duration(&self) -> ParsedDuration {
        self.duration
    }

    fn expand(&self, range_start: i64, range_end: i64, limits: &ExpansionLimits) -> Vec<Instance> {
        let mut instances: Vec<Instance> = match &self.repeat {
            Repeat::Rule(rule) => {
                // Widen by one duration so instances that started earlier
                // but still overlap are found.
                let length = self.dtstart.add(&self.duration).utc_millis() - self.dtstart.utc_millis();
                let from = range_start.saturating_sub(length.max(0));

                rule.expand(&self.dtstart, from, range_end, limits)
                    .into_iter()
                    .filter_map(|start| {
                        ParsedDateTime::from_utc_millis(start, self.dtstart.zone().clone()).ok()
                    })
                    .map(|start| {
                        let mut inst = Instance::at(&start, &self.duration, self.invite);
                        inst.all_day = !self.dtstart.has_time();
                        inst
                    })
                    .collect()
            }
            Repeat::Dates(dates) => dates
                .iter()
                .map(|date| date.instance(&self.duration, self.invite))
                .collect(),
        };

        instances.retain(|inst| inst.overlaps(range_start, range_end));
        instances.sort_by_key(|inst| (inst.start, inst.end));
        instances
    }

    fn start_time(&self) -> &ParsedDateTime {
        match &self.repeat {
            Repeat::Dates(dates) => dates
                .iter()
                .map(DateValue::start)
                .min()
                .unwrap_or(&self.dtstart),
            Repeat::Rule(_) => &self.dtstart,
        }
    }

    fn end_time(&self, limits: &ExpansionLimits) -> Option<ParsedDateTime> {
        match &self.repeat {
            Repeat::Dates(dates) => dates.iter().map(|d| d.end(&self.duration)).max(),
            Repeat::Rule(rule) => match rule.end_condition {
                EndCondition::Infinite => None,
                EndCondition::Until(_) | EndCondition::Count(_) => {
                    let last = rule
                        .expand(&self.dtstart, self.dtstart.utc_millis(), i64::MAX, limits)
                        .pop()?;
                    ParsedDateTime::from_utc_millis(last, self.dtstart.zone().clone())
                        .ok()
                        .map(|start| start.add(&self.duration))
                }
            },
        }
    }

    fn to_properties(&self) -> Vec<Property> {
        match &self.repeat {
            Repeat::Rule(rule) => {
                let name = if self.exclude { "EXRULE" } else { "RRULE" };
                vec![Property::new(name, rule.to_string())]
            }
            Repeat::Dates(dates) => {
                let name = if self.exclude { "EXDATE" } else { "RDATE" };
                let groups = dates.iter().group_by(|d| {
                    let start = d.start();
                    (
                        matches!(d, DateValue::Period { .. }),
                        start.has_time(),
                        start.tzid().map(str::to_string),
                    )
                });

                let props: Vec<Property> = groups
                    .into_iter()
                    .map(|((period, has_time, tzid), values)| {
                        let mut prop = Property::new(name, values.map(DateValue::text).join(","));
                        if period {
                            prop = prop.with_param("VALUE", "PERIOD");
                        } else if !has_time {
                            prop = prop.with_param("VALUE", "DATE");
                        }
                        if let Some(tzid) = tzid {
                            prop = prop.with_param("TZID", tzid);
                        }
                        prop
                    })
                    .collect();
                props
            }
        }
    }

    fn collect_tzids(&self, ids: &mut BTreeSet<String>) {
        collect_tzid(&self.dtstart, ids);
        match &self.repeat {
            Repeat::Rule(rule) => {
                if let Some(until) = rule.until() {
                    collect_tzid(until, ids);
                }
            }
            Repeat::Dates(dates) => {
                for date in dates {
                    collect_tzid(date.start(), ids);
                }
            }
        }
    }

    fn encode_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.put_long("t", TYPE_SIMPLE_REPEATING)
            .put_str("dts", self.dtstart.to_meta())
            .put_str("dur", self.duration.to_string())
            .put_map("inv", self.invite.encode_metadata());

        match &self.repeat {
            Repeat::Rule(rule) => meta.put_str("recur", rule.to_string()),
            Repeat::Dates(dates) => meta.put_list("rdt", dates.iter().map(DateValue::encode).collect()),
        };
        if self.exclude {
            meta.put_bool("ex", true);
        }
        meta
    }

    fn decode_metadata(meta: &Metadata, tzmap: &mut TimeZoneMap) -> Result<SimpleRepeatingRule> {
        let dtstart = decode_dtstart(meta, "dts", tzmap)?;
        let duration = meta.get_str("dur")?.parse()?;
        let invite = decode_invite(meta, "inv")?;
        let exclude = meta.get_bool_or("ex", false)?;

        let repeat = match (meta.get_opt_str("recur"), meta.get_list("rdt")) {
            (Some(rule), _) => Repeat::Rule(rule.parse()?),
            (None, Some(dates)) => Repeat::Dates(
                dates
                    .iter()
                    .map(|d| DateValue::decode(d, tzmap))
                    .collect::<Result<_>>()?,
            ),
            (None, None) => {
                return Err(CalendarError::Metadata(
                    "repeating rule has neither 'recur' nor 'rdt'".to_string(),
                ))
            }
        };

        let rule = SimpleRepeatingRule {
            dtstart,
            duration,
            repeat,
            exclude: false,
            invite,
        };
        if !exclude {
            return Ok(rule);
        }
        match rule.repeat {
            Repeat::Dates(dates) => SimpleRepeatingRule::exdate(rule.dtstart, rule.duration, dates, invite),
            Repeat::Rule(_) => Ok(SimpleRepeatingRule { exclude, ..rule }),
        }
    }
}

impl fmt::Display for SimpleRepeatingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repeat {
            Repeat::Rule(rule) => write!(
                f,
                "{}(FIRST={},DUR={},{})",
                if self.exclude { "EXRULE" } else { "RRULE" },
                self.dtstart,
                self.duration,
                rule
            ),
            Repeat::Dates(dates) => write!(
                f,
                "{}(DUR={},{})",
                if self.exclude { "EXDATE" } else { "RDATE" },
                self.duration,
                dates.iter().map(DateValue::text).join(",")
            ),
        }
    }
}

fn decode_dtstart(meta: &Metadata, key: &str, tzmap: &mut TimeZoneMap) -> Result<ParsedDateTime> {
    match meta.get_opt_str(key) {
        Some(text) => ParsedDateTime::from_meta(text, tzmap),
        None => Err(CalendarError::InvalidRule("recurrence without DTSTART".to_string())),
    }
}

fn decode_invite(meta: &Metadata, key: &str) -> Result<InviteInfo> {
    match meta.get_opt_map(key) {
        Some(inv) => InviteInfo::decode_metadata(inv),
        None => Ok(InviteInfo::default()),
    }
}

/// A non-recurring occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleInstanceRule {
    dtstart: ParsedDateTime,
    dtend: Option<ParsedDateTime>,
    duration: Option<ParsedDuration>,
    invite: InviteInfo,
}

impl SingleInstanceRule {
    pub fn new(
        dtstart: ParsedDateTime,
        dtend: Option<ParsedDateTime>,
        duration: Option<ParsedDuration>,
        invite: InviteInfo,
    ) -> SingleInstanceRule {
        SingleInstanceRule {
            dtstart,
            dtend,
            duration,
            invite,
        }
    }

    pub fn end(&self) -> ParsedDateTime {
        match (&self.dtend, &self.duration) {
            (Some(end), _) => end.clone(),
            (None, Some(duration)) => self.dtstart.add(duration),
            (None, None) => self.dtstart.clone(),
        }
    }

    fn expand(&self, range_start: i64, range_end: i64) -> Vec<Instance> {
        let inst = Instance::new(
            self.dtstart.utc_millis(),
            self.end().utc_millis(),
            self.invite,
            !self.dtstart.has_time(),
        );
        if inst.overlaps(range_start, range_end) {
            vec![inst]
        } else {
            Vec::new()
        }
    }

    fn encode_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.put_long("t", TYPE_SINGLE_INSTANCE)
            .put_str("dts", self.dtstart.to_meta())
            .put_opt_str("dte", self.dtend.as_ref().map(ParsedDateTime::to_meta))
            .put_opt_str("dur", self.duration.map(|d| d.to_string()))
            .put_map("inv", self.invite.encode_metadata());
        meta
    }

    fn decode_metadata(meta: &Metadata, tzmap: &mut TimeZoneMap) -> Result<SingleInstanceRule> {
        let dtstart = decode_dtstart(meta, "dts", tzmap)?;
        let dtend = match meta.get_opt_str("dte") {
            Some(text) => Some(ParsedDateTime::from_meta(text, tzmap)?),
            None => None,
        };
        let duration = match meta.get_opt_str("dur") {
            Some(text) => Some(text.parse()?),
            None => None,
        };
        Ok(SingleInstanceRule::new(dtstart, dtend, duration, decode_invite(meta, "inv")?))
    }
}

impl fmt::Display for SingleInstanceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[DtStart={}", self.dtstart)?;
        if let Some(duration) = &self.duration {
            write!(f, " Dur={}", duration)?;
        }
        if let Some(end) = &self.dtend {
            write!(f, " DtEnd={}", end)?;
        }
        write!(f, " InvId={}]", self.invite)
    }
}

/// Rules whose instances are unioned.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleSet {
    rules: Vec<IRecurrence>,
}

impl RuleSet {
    pub fn new(rules: Vec<IRecurrence>) -> RuleSet {
        RuleSet { rules }
    }

    pub fn rules(&self) -> &[IRecurrence] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn expand(&self, range_start: i64, range_end: i64, limits: &ExpansionLimits) -> Vec<Instance> {
        let lists = self
            .rules
            .iter()
            .map(|rule| rule.expand_instances_with(range_start, range_end, limits))
            .collect();
        merge_sorted(lists, true)
    }

    fn start_time(&self) -> Option<&ParsedDateTime> {
        self.rules.iter().filter_map(IRecurrence::start_time).min()
    }

    /// None when any rule never ends.
    fn end_time(&self, limits: &ExpansionLimits) -> Option<ParsedDateTime> {
        let ends: Option<Vec<_>> = self.rules.iter().map(|r| r.end_time_with(limits)).collect();
        ends?.into_iter().max()
    }

    fn encode_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.put_long("nr", self.rules.len() as i64);
        for (i, rule) in self.rules.iter().enumerate() {
            meta.put_map(&format!("r{}", i), rule.encode_metadata());
        }
        meta
    }

    fn decode_metadata(meta: &Metadata, tzmap: &mut TimeZoneMap) -> Result<RuleSet> {
        let count = meta.get_long_or("nr", 0)?;
        let mut rules = Vec::new();
        for i in 0..count {
            let key = format!("r{}", i);
            rules.push(IRecurrence::decode_metadata(meta.get_map(&key)?, tzmap)?);
        }
        Ok(RuleSet::new(rules))
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.rules.iter().join(" "))
    }
}

/// DTSTART plus the instances added and removed by rule sets.
#[derive(Debug, Clone, PartialEq)]
struct CompoundRule {
    dtstart: ParsedDateTime,
    duration: ParsedDuration,
    invite: InviteInfo,
    add: RuleSet,
    subtract: RuleSet,
}

impl CompoundRule {
    fn new(
        dtstart: ParsedDateTime,
        duration: ParsedDuration,
        invite: InviteInfo,
        add: Vec<IRecurrence>,
        subtract: Vec<IRecurrence>,
    ) -> Result<CompoundRule> {
        if let Some(rule) = add.iter().find(|r| r.is_exclusion()) {
            return Err(CalendarError::InvalidRule(format!("{} can only remove instances", rule)));
        }

        Ok(CompoundRule {
            dtstart,
            duration,
            invite,
            add: RuleSet::new(add),
            subtract: RuleSet::new(subtract),
        })
    }

    fn first_instance(&self) -> Instance {
        Instance::at(&self.dtstart, &self.duration, self.invite)
    }

    fn expand(&self, range_start: i64, range_end: i64, limits: &ExpansionLimits) -> Vec<Instance> {
        let first = self.first_instance();
        let first_in_range = first.overlaps(range_start, range_end);

        if self.add.is_empty() {
            return if first_in_range { vec![first] } else { Vec::new() };
        }

        let added = self.add.expand(range_start, range_end, limits);
        let removed = self.subtract.expand(range_start, range_end, limits);
        let mut instances = subtract_sorted(added, &removed);

        if first_in_range && !instances.iter().any(|inst| inst.start == first.start) {
            let at = instances.partition_point(|inst| (inst.start, inst.end) < (first.start, first.end));
            instances.insert(at, first);
        }
        instances
    }

    fn end_time(&self, limits: &ExpansionLimits) -> Option<ParsedDateTime> {
        if self.add.is_empty() {
            Some(self.dtstart.add(&self.duration))
        } else {
            self.add.end_time(limits)
        }
    }

    fn to_properties(&self) -> Vec<Property> {
        self.add
            .rules
            .iter()
            .chain(self.subtract.rules.iter())
            .flat_map(IRecurrence::to_properties)
            .collect()
    }

    fn collect_tzids(&self, ids: &mut BTreeSet<String>) {
        collect_tzid(&self.dtstart, ids);
        for rule in self.add.rules.iter().chain(self.subtract.rules.iter()) {
            rule.collect_tzids(ids);
        }
    }

    fn encode_into(&self, meta: &mut Metadata) {
        meta.put_str("dts", self.dtstart.to_meta())
            .put_str("duration", self.duration.to_string())
            .put_map("invid", self.invite.encode_metadata());
        if !self.add.is_empty() {
            meta.put_map("add", self.add.encode_metadata());
        }
        if !self.subtract.is_empty() {
            meta.put_map("sub", self.subtract.encode_metadata());
        }
    }

    fn decode_metadata(meta: &Metadata, tzmap: &mut TimeZoneMap) -> Result<CompoundRule> {
        let dtstart = decode_dtstart(meta, "dts", tzmap)?;
        let duration = match meta.get_opt_str("duration") {
            Some(text) => text.parse()?,
            None => ParsedDuration::default(),
        };
        let invite = decode_invite(meta, "invid")?;
        let add = match meta.get_opt_map("add") {
            Some(set) => RuleSet::decode_metadata(set, tzmap)?.rules,
            None => Vec::new(),
        };
        let subtract = match meta.get_opt_map("sub") {
            Some(set) => RuleSet::decode_metadata(set, tzmap)?.rules,
            None => Vec::new(),
        };

        CompoundRule::new(dtstart, duration, invite, add, subtract)
    }
}

impl fmt::Display for CompoundRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FIRST={},DUR={}", self.dtstart, self.duration)?;
        if !self.add.is_empty() {
            write!(f, ",ADD[{}]", self.add)?;
        }
        if !self.subtract.is_empty() {
            write!(f, ",SUBTRACT[{}]", self.subtract)?;
        }
        Ok(())
    }
}

/// An overridden instance (or range of instances) of a recurring series.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionRule {
    recur_id: RecurId,
    base: CompoundRule,
}

impl ExceptionRule {
    pub fn new(
        recur_id: RecurId,
        dtstart: ParsedDateTime,
        duration: ParsedDuration,
        invite: InviteInfo,
        add: Vec<IRecurrence>,
        subtract: Vec<IRecurrence>,
    ) -> Result<ExceptionRule> {
        Ok(ExceptionRule {
            recur_id,
            base: CompoundRule::new(dtstart, duration, invite, add, subtract)?,
        })
    }

    pub fn recur_id(&self) -> &RecurId {
        &self.recur_id
    }

    pub fn matches(&self, instant: i64) -> bool {
        self.recur_id.within_range(instant)
    }

    pub fn dtstart(&self) -> &ParsedDateTime {
        &self.base.dtstart
    }

    fn expand(&self, range_start: i64, range_end: i64, limits: &ExpansionLimits) -> Vec<Instance> {
        let mut instances = self.base.expand(range_start, range_end, limits);
        for inst in &mut instances {
            inst.is_exception = true;
        }
        instances
    }

    fn encode_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.put_long("t", TYPE_EXCEPTION);
        self.base.encode_into(&mut meta);
        meta.put_map("recurId", self.recur_id.encode_metadata());
        meta
    }

    fn decode_metadata(meta: &Metadata, tzmap: &mut TimeZoneMap) -> Result<ExceptionRule> {
        Ok(ExceptionRule {
            recur_id: RecurId::decode_metadata(meta.get_map("recurId")?, tzmap)?,
            base: CompoundRule::decode_metadata(meta, tzmap)?,
        })
    }
}

impl fmt::Display for ExceptionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EXCEPTION({} {})", self.recur_id, self.base)
    }
}

/// A cancelled instance (or range of instances).
#[derive(Debug, Clone, PartialEq)]
pub struct CancellationRule {
    recur_id: RecurId,
}

impl CancellationRule {
    pub fn new(recur_id: RecurId) -> CancellationRule {
        CancellationRule { recur_id }
    }

    pub fn recur_id(&self) -> &RecurId {
        &self.recur_id
    }

    pub fn matches(&self, instant: i64) -> bool {
        self.recur_id.within_range(instant)
    }

    fn encode_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.put_map("recurId", self.recur_id.encode_metadata());
        meta
    }

    fn decode_metadata(meta: &Metadata, tzmap: &mut TimeZoneMap) -> Result<CancellationRule> {
        Ok(CancellationRule::new(RecurId::decode_metadata(
            meta.get_map("recurId")?,
            tzmap,
        )?))
    }
}

impl fmt::Display for CancellationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CANCELLATION({})", self.recur_id)
    }
}

/// Either kind of override a recurring series can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum RecurrenceException {
    Exception(ExceptionRule),
    Cancellation(CancellationRule),
}

impl RecurrenceException {
    pub fn recur_id(&self) -> &RecurId {
        match self {
            RecurrenceException::Exception(ex) => ex.recur_id(),
            RecurrenceException::Cancellation(ca) => ca.recur_id(),
        }
    }

    pub fn matches(&self, instant: i64) -> bool {
        self.recur_id().within_range(instant)
    }

    fn expand(&self, range_start: i64, range_end: i64, limits: &ExpansionLimits) -> Vec<Instance> {
        match self {
            RecurrenceException::Exception(ex) => ex.expand(range_start, range_end, limits),
            RecurrenceException::Cancellation(_) => Vec::new(),
        }
    }
}

impl fmt::Display for RecurrenceException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecurrenceException::Exception(ex) => fmt::Display::fmt(ex, f),
            RecurrenceException::Cancellation(ca) => fmt::Display::fmt(ca, f),
        }
    }
}

/// A recurring series with its exceptions and cancellations.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrenceRule {
    base: CompoundRule,
    exceptions: Vec<RecurrenceException>,
}

impl RecurrenceRule {
    pub fn new(
        dtstart: ParsedDateTime,
        duration: ParsedDuration,
        invite: InviteInfo,
        add: Vec<IRecurrence>,
        subtract: Vec<IRecurrence>,
    ) -> Result<RecurrenceRule> {
        Ok(RecurrenceRule {
            base: CompoundRule::new(dtstart, duration, invite, add, subtract)?,
            exceptions: Vec::new(),
        })
    }

    pub fn add_exception(&mut self, exception: ExceptionRule) {
        self.exceptions.push(RecurrenceException::Exception(exception));
    }

    pub fn add_cancellation(&mut self, cancellation: CancellationRule) {
        self.exceptions.push(RecurrenceException::Cancellation(cancellation));
    }

    pub fn exceptions(&self) -> &[RecurrenceException] {
        &self.exceptions
    }

    pub fn dtstart(&self) -> &ParsedDateTime {
        &self.base.dtstart
    }

    pub fn duration(&self) -> ParsedDuration {
        self.base.duration
    }

    /// Instances of the series itself, before exceptions apply.
    pub fn expand_standard(&self, range_start: i64, range_end: i64, limits: &ExpansionLimits) -> Vec<Instance> {
        self.base.expand(range_start, range_end, limits)
    }

    fn expand(&self, range_start: i64, range_end: i64, limits: &ExpansionLimits) -> Vec<Instance> {
        let mut standard = self.base.expand(range_start, range_end, limits);
        let mut overrides: Vec<Option<Vec<Instance>>> = vec![None; self.exceptions.len()];

        standard.retain(|inst| {
            let mut keep = true;
            for (exception, expanded) in self.exceptions.iter().zip(overrides.iter_mut()) {
                if !exception.matches(inst.start) {
                    continue;
                }
                debug!(instance = inst.start, %exception, "Instance replaced");
                keep = false;
                if expanded.is_none() {
                    *expanded = Some(exception.expand(range_start, range_end, limits));
                }
            }
            keep
        });

        let mut lists = vec![standard];
        lists.extend(overrides.into_iter().flatten());
        merge_sorted(lists, false)
    }

    fn encode_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.put_long("t", TYPE_RECURRENCE);
        self.base.encode_into(&mut meta);
        meta.put_long("numEx", self.exceptions.len() as i64);
        for (i, exception) in self.exceptions.iter().enumerate() {
            match exception {
                RecurrenceException::Exception(ex) => {
                    meta.put_map(&format!("ex{}", i), ex.encode_metadata());
                }
                RecurrenceException::Cancellation(ca) => {
                    meta.put_map(&format!("ca{}", i), ca.encode_metadata());
                }
            }
        }
        meta
    }

    fn decode_metadata(meta: &Metadata, tzmap: &mut TimeZoneMap) -> Result<RecurrenceRule> {
        let mut rule = RecurrenceRule {
            base: CompoundRule::decode_metadata(meta, tzmap)?,
            exceptions: Vec::new(),
        };

        for i in 0..meta.get_long_or("numEx", 0)? {
            if let Some(ex) = meta.get_opt_map(&format!("ex{}", i)) {
                rule.add_exception(ExceptionRule::decode_metadata(ex, tzmap)?);
            } else if let Some(ca) = meta.get_opt_map(&format!("ca{}", i)) {
                rule.add_cancellation(CancellationRule::decode_metadata(ca, tzmap)?);
            } else {
                return Err(CalendarError::Metadata(format!("missing exception {}", i)));
            }
        }
        Ok(rule)
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RECUR({}", self.base)?;
        for exception in &self.exceptions {
            write!(f, " {}", exception)?;
        }
        f.write_str(")")
    }
}

/// Any node of a rule tree.
#[derive(Debug, Clone, PartialEq)]
pub enum IRecurrence {
    Single(SingleInstanceRule),
    SimpleRepeating(SimpleRepeatingRule),
    Recurrence(RecurrenceRule),
    Exception(ExceptionRule),
    Cancellation(CancellationRule),
}

impl IRecurrence {
    /// Instances overlapping `[range_start, range_end)`, sorted by start
    /// then end, with the default expansion limits.
    pub fn expand_instances(&self, range_start: i64, range_end: i64) -> Vec<Instance> {
        self.expand_instances_with(range_start, range_end, &ExpansionLimits::default())
    }

    pub fn expand_instances_with(
        &self,
        range_start: i64,
        range_end: i64,
        limits: &ExpansionLimits,
    ) -> Vec<Instance> {
        match self {
            IRecurrence::Single(rule) => rule.expand(range_start, range_end),
            IRecurrence::SimpleRepeating(rule) => rule.expand(range_start, range_end, limits),
            IRecurrence::Recurrence(rule) => rule.expand(range_start, range_end, limits),
            IRecurrence::Exception(rule) => rule.expand(range_start, range_end, limits),
            IRecurrence::Cancellation(_) => Vec::new(),
        }
    }

    /// Earliest start. Cancellations have none.
    pub fn start_time(&self) -> Option<&ParsedDateTime> {
        match self {
            IRecurrence::Single(rule) => Some(&rule.dtstart),
            IRecurrence::SimpleRepeating(rule) => Some(rule.start_time()),
            IRecurrence::Recurrence(rule) => {
                let first = rule.base.add.start_time().map_or(&rule.base.dtstart, |add| {
                    add.min(&rule.base.dtstart)
                });
                Some(first)
            }
            IRecurrence::Exception(rule) => Some(&rule.base.dtstart),
            IRecurrence::Cancellation(_) => None,
        }
    }

    /// Latest end, or None when the rule repeats forever. Cancellations
    /// have none either.
    pub fn end_time(&self) -> Option<ParsedDateTime> {
        self.end_time_with(&ExpansionLimits::default())
    }

    pub fn end_time_with(&self, limits: &ExpansionLimits) -> Option<ParsedDateTime> {
        match self {
            IRecurrence::Single(rule) => Some(rule.end()),
            IRecurrence::SimpleRepeating(rule) => rule.end_time(limits),
            IRecurrence::Recurrence(rule) => rule.base.end_time(limits),
            IRecurrence::Exception(rule) => rule.base.end_time(limits),
            IRecurrence::Cancellation(_) => None,
        }
    }

    pub fn is_exclusion(&self) -> bool {
        matches!(self, IRecurrence::SimpleRepeating(rule) if rule.is_exclusion())
    }

    /// The rule re-rendered as properties: RRULE, RDATE, EXRULE, EXDATE and
    /// RECURRENCE-ID. DTSTART belongs to the component and isn't included.
    pub fn to_properties(&self) -> Vec<Property> {
        match self {
            IRecurrence::Single(rule) => vec![rule.dtstart.to_property("RDATE")],
            IRecurrence::SimpleRepeating(rule) => rule.to_properties(),
            IRecurrence::Recurrence(rule) => rule.base.to_properties(),
            IRecurrence::Exception(rule) => {
                let mut props = vec![rule.recur_id.to_property()];
                props.extend(rule.base.to_properties());
                props
            }
            IRecurrence::Cancellation(rule) => vec![rule.recur_id.to_property()],
        }
    }

    /// Every TZID the tree refers to.
    pub fn collect_tzids(&self, ids: &mut BTreeSet<String>) {
        match self {
            IRecurrence::Single(rule) => {
                collect_tzid(&rule.dtstart, ids);
                if let Some(end) = &rule.dtend {
                    collect_tzid(end, ids);
                }
            }
            IRecurrence::SimpleRepeating(rule) => rule.collect_tzids(ids),
            IRecurrence::Recurrence(rule) => {
                rule.base.collect_tzids(ids);
                for exception in &rule.exceptions {
                    collect_tzid(exception.recur_id().dt(), ids);
                    if let RecurrenceException::Exception(ex) = exception {
                        ex.base.collect_tzids(ids);
                    }
                }
            }
            IRecurrence::Exception(rule) => {
                collect_tzid(rule.recur_id.dt(), ids);
                rule.base.collect_tzids(ids);
            }
            IRecurrence::Cancellation(rule) => collect_tzid(rule.recur_id.dt(), ids),
        }
    }

    pub fn encode_metadata(&self) -> Metadata {
        match self {
            IRecurrence::Single(rule) => rule.encode_metadata(),
            IRecurrence::SimpleRepeating(rule) => rule.encode_metadata(),
            IRecurrence::Recurrence(rule) => rule.encode_metadata(),
            IRecurrence::Exception(rule) => rule.encode_metadata(),
            IRecurrence::Cancellation(rule) => rule.encode_metadata(),
        }
    }

    /// Decode a tree written by [`IRecurrence::encode_metadata`]. TZIDs are
    /// resolved through `tzmap`, which learns well-known zones it lacks.
    pub fn decode_metadata(meta: &Metadata, tzmap: &mut TimeZoneMap) -> Result<IRecurrence> {
        match meta.get_opt_long("t")? {
            Some(TYPE_SIMPLE_REPEATING) => Ok(IRecurrence::SimpleRepeating(
                SimpleRepeatingRule::decode_metadata(meta, tzmap)?,
            )),
            Some(TYPE_EXCEPTION) => Ok(IRecurrence::Exception(ExceptionRule::decode_metadata(meta, tzmap)?)),
            Some(TYPE_RECURRENCE) => Ok(IRecurrence::Recurrence(RecurrenceRule::decode_metadata(meta, tzmap)?)),
            Some(TYPE_SINGLE_INSTANCE) => Ok(IRecurrence::Single(SingleInstanceRule::decode_metadata(meta, tzmap)?)),
            None if meta.contains("recurId") => Ok(IRecurrence::Cancellation(
                CancellationRule::decode_metadata(meta, tzmap)?,
            )),
            Some(other) => Err(CalendarError::Metadata(format!("unknown recurrence type {}", other))),
            None => Err(CalendarError::Metadata("recurrence without a type".to_string())),
        }
    }
}

impl fmt::Display for IRecurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IRecurrence::Single(rule) => fmt::Display::fmt(rule, f),
            IRecurrence::SimpleRepeating(rule) => fmt::Display::fmt(rule, f),
            IRecurrence::Recurrence(rule) => fmt::Display::fmt(rule, f),
            IRecurrence::Exception(rule) => fmt::Display::fmt(rule, f),
            IRecurrence::Cancellation(rule) => fmt::Display::fmt(rule, f),
        }
    }
}
