use crate::{
    config::ExpansionLimits,
    datetime::ParsedDateTime,
    duration::ParsedDuration,
    error::{self, CalendarError},
    freebusy::{DefaultOutlookMap, FBInstance, FreeBusy, FreeBusyStatus, OutlookStatusMap},
    metadata::Metadata,
    parser::{self, Component, Property},
    recurrence::{
        CancellationRule, ExceptionRule, IRecurrence, Instance, InviteInfo, RecurId,
        RecurrenceRule, SimpleRepeatingRule, SingleInstanceRule,
    },
    timezone::ICalTimeZone,
    tzmap::TimeZoneMap,
    unescape::unescape,
    well_known::{StaticWellKnownZones, WellKnownTimeZones},
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, ensure, format_err, Context, Error};
use tracing::{debug, warn};

/// Item type codes stored with an invite.
const ITEM_TYPE_APPOINTMENT: i64 = 11;
const ITEM_TYPE_TASK: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Event,
    Todo,
}

impl ComponentKind {
    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Event => "VEVENT",
            ComponentKind::Todo => "VTODO",
        }
    }
}

/// The STATUS of an event or to-do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Tentative,
    Confirmed,
    Cancelled,
    NeedsAction,
    Completed,
    InProcess,
    Draft,
    Final,
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::Tentative => "TENTATIVE",
            Status::Confirmed => "CONFIRMED",
            Status::Cancelled => "CANCELLED",
            Status::NeedsAction => "NEEDS-ACTION",
            Status::Completed => "COMPLETED",
            Status::InProcess => "IN-PROCESS",
            Status::Draft => "DRAFT",
            Status::Final => "FINAL",
            Status::Other(s) => s,
        }
    }
}

impl FromStr for Status {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.trim().to_ascii_uppercase().as_str() {
            "TENTATIVE" => Status::Tentative,
            "CONFIRMED" => Status::Confirmed,
            "CANCELLED" => Status::Cancelled,
            "NEEDS-ACTION" => Status::NeedsAction,
            "COMPLETED" => Status::Completed,
            "IN-PROCESS" => Status::InProcess,
            "DRAFT" => Status::Draft,
            "FINAL" => Status::Final,
            other => Status::Other(other.to_string()),
        })
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Confirmed
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transparency {
    Opaque,
    Transparent,
}

impl Transparency {
    pub fn as_str(self) -> &'static str {
        match self {
            Transparency::Opaque => "OPAQUE",
            Transparency::Transparent => "TRANSPARENT",
        }
    }

    fn code(self) -> &'static str {
        match self {
            Transparency::Opaque => "O",
            Transparency::Transparent => "T",
        }
    }

    fn from_code(code: &str) -> Transparency {
        if code.eq_ignore_ascii_case("T") || code.eq_ignore_ascii_case("TRANSPARENT") {
            Transparency::Transparent
        } else {
            Transparency::Opaque
        }
    }
}

/// PARTSTAT of the calendar owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartStat {
    NeedsAction,
    Accepted,
    Declined,
    Tentative,
    Delegated,
    Other(String),
}

impl PartStat {
    pub fn as_str(&self) -> &str {
        match self {
            PartStat::NeedsAction => "NEEDS-ACTION",
            PartStat::Accepted => "ACCEPTED",
            PartStat::Declined => "DECLINED",
            PartStat::Tentative => "TENTATIVE",
            PartStat::Delegated => "DELEGATED",
            PartStat::Other(s) => s,
        }
    }
}

impl FromStr for PartStat {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.trim().to_ascii_uppercase().as_str() {
            "NEEDS-ACTION" => PartStat::NeedsAction,
            "ACCEPTED" => PartStat::Accepted,
            "DECLINED" => PartStat::Declined,
            "TENTATIVE" => PartStat::Tentative,
            "DELEGATED" => PartStat::Delegated,
            other => PartStat::Other(other.to_string()),
        })
    }
}

impl fmt::Display for PartStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn same_address(a: &str, b: &str) -> bool {
    fn strip(s: &str) -> &str {
        let s = s.trim();
        match s.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("mailto:") => &s[7..],
            _ => s,
        }
    }
    strip(a).eq_ignore_ascii_case(strip(b))
}

/// Shortest allowed occurrence: a second for timed values, a day for dates.
fn minimum_duration(start: &ParsedDateTime) -> ParsedDuration {
    if start.has_time() {
        ParsedDuration::from_seconds(1)
    } else {
        ParsedDuration::from_days(1)
    }
}

fn repeating_rules(
    props: &[&Property],
    dtstart: &ParsedDateTime,
    duration: ParsedDuration,
    info: InviteInfo,
    tzmap: &mut TimeZoneMap,
) -> Result<Vec<IRecurrence>, Error> {
    props
        .iter()
        .map(|prop| {
            SimpleRepeatingRule::from_property(prop, dtstart, duration, info, tzmap)
                .map(IRecurrence::SimpleRepeating)
                .with_context(|| format!("parsing {}:{}", prop.name, prop.value))
        })
        .collect()
}

/// One VEVENT or VTODO, as seen by one calendar user.
///
/// `free_busy` is the intended status of the event; what the owner
/// actually shows as is [`Invite::free_busy_actual`], which folds in their
/// participation status.
#[derive(Debug, Clone, PartialEq)]
pub struct Invite {
    pub uid: String,
    pub info: InviteInfo,
    pub kind: ComponentKind,
    pub summary: Option<String>,
    pub dtstart: Option<ParsedDateTime>,
    /// DTEND for events, DUE for to-dos.
    pub dtend: Option<ParsedDateTime>,
    pub duration: Option<ParsedDuration>,
    pub dtstamp: Option<ParsedDateTime>,
    pub all_day: bool,
    pub status: Status,
    pub transparency: Transparency,
    pub free_busy: FreeBusyStatus,
    pub partstat: PartStat,
    pub is_organizer: bool,
    pub sequence: u32,
    pub recur_id: Option<RecurId>,
    pub recurrence: Option<IRecurrence>,
}

impl Invite {
    /// Read a VEVENT or VTODO.
    ///
    /// `owner` is the address of the calendar user; their PARTSTAT comes
    /// from the matching ATTENDEE, or is ACCEPTED when they organize the
    /// event. Without an owner the invite is taken as accepted.
    pub fn from_component(
        component: &Component,
        info: InviteInfo,
        owner: Option<&str>,
        tzmap: &mut TimeZoneMap,
    ) -> Result<Invite, Error> {
        let kind = if component.is("VEVENT") {
            ComponentKind::Event
        } else if component.is("VTODO") {
            ComponentKind::Todo
        } else {
            bail!("Expected VEVENT or VTODO, got {}", component.name);
        };
        let is_event = kind == ComponentKind::Event;

        let mut uid = None;
        let mut summary = None;
        let mut dtstart = None;
        let mut dtend = None;
        let mut duration: Option<ParsedDuration> = None;
        let mut dtstamp = None;
        let mut status = Status::default();
        let mut transp = None;
        let mut intended = None;
        let mut ms_all_day = false;
        let mut sequence = 0;
        let mut recur_id = None;
        let mut organizer = None;
        let mut attendees = Vec::new();
        let mut add_props = Vec::new();
        let mut sub_props = Vec::new();

        for prop in &component.properties {
            match prop.name.to_ascii_uppercase().as_str() {
                "UID" => uid = Some(unescape(&prop.value)?),
                "SUMMARY" => {
                    summary = Some(unescape(&prop.value)?.replace("\r\n", " ").replace('\n', " "))
                }
                "DTSTART" => {
                    dtstart = Some(
                        ParsedDateTime::from_property(prop, tzmap).with_context(|| "parsing DTSTART")?,
                    )
                }
                "DTEND" if is_event => {
                    dtend = Some(ParsedDateTime::from_property(prop, tzmap).with_context(|| "parsing DTEND")?)
                }
                "DUE" if !is_event => {
                    dtend = Some(ParsedDateTime::from_property(prop, tzmap).with_context(|| "parsing DUE")?)
                }
                "DURATION" => {
                    duration = Some(
                        prop.value
                            .parse::<ParsedDuration>()
                            .with_context(|| "parsing DURATION")?,
                    )
                }
                "DTSTAMP" => {
                    dtstamp = Some(ParsedDateTime::from_property(prop, tzmap).with_context(|| "parsing DTSTAMP")?)
                }
                "RRULE" | "RDATE" => add_props.push(prop),
                "EXRULE" | "EXDATE" => sub_props.push(prop),
                "RECURRENCE-ID" => {
                    recur_id =
                        Some(RecurId::from_property(prop, tzmap).with_context(|| "parsing RECURRENCE-ID")?)
                }
                "SEQUENCE" => {
                    sequence = prop
                        .value
                        .trim()
                        .parse::<u32>()
                        .with_context(|| format!("parsing SEQUENCE {}", prop.value))?
                }
                "STATUS" => status = prop.value.parse::<Status>().unwrap_or_default(),
                "TRANSP" if is_event => {
                    transp = Some(Transparency::from_code(prop.value.trim()));
                }
                "X-MICROSOFT-CDO-INTENDEDSTATUS" if is_event => {
                    intended = DefaultOutlookMap.to_status(prop.value.trim())
                }
                "X-MICROSOFT-CDO-ALLDAYEVENT" => {
                    ms_all_day = prop.value.trim().eq_ignore_ascii_case("TRUE")
                }
                "ORGANIZER" => organizer = Some(prop.value.as_str()),
                "ATTENDEE" => attendees.push(prop),
                _ => {}
            }
        }

        let uid = uid.ok_or_else(|| format_err!("Missing UID field in {}", kind.name()))?;

        // The intended status from Outlook wins over TRANSP.
        let (free_busy, transparency) = match intended {
            Some(fb) => {
                let transparency = if fb == FreeBusyStatus::Free {
                    Transparency::Transparent
                } else {
                    Transparency::Opaque
                };
                (fb, transparency)
            }
            None => match transp {
                Some(Transparency::Transparent) => (FreeBusyStatus::Free, Transparency::Transparent),
                _ => (FreeBusyStatus::Busy, Transparency::Opaque),
            },
        };

        let (is_organizer, partstat) = match owner {
            None => (organizer.is_none(), PartStat::Accepted),
            Some(owner) if organizer.map_or(true, |o| same_address(o, owner)) => {
                (true, PartStat::Accepted)
            }
            Some(owner) => {
                let partstat = attendees
                    .iter()
                    .find(|att| same_address(&att.value, owner))
                    .and_then(|att| att.get_param("PARTSTAT"))
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(PartStat::NeedsAction);
                (false, partstat)
            }
        };

        if dtstart.is_none() && (!add_props.is_empty() || !sub_props.is_empty()) {
            match &dtend {
                Some(end) => {
                    let derived = end.add(&minimum_duration(end).negate());
                    debug!(uid = %uid, dtstart = %derived, "Derived DTSTART from the end of a recurrence");
                    dtstart = Some(derived);
                }
                None => {
                    return Err(CalendarError::InvalidRule(format!(
                        "recurrence used without DTSTART in {}",
                        uid
                    ))
                    .into())
                }
            }
        }

        let all_day = ms_all_day || dtstart.as_ref().map_or(false, |d| !d.has_time());

        let mut invite = Invite {
            uid,
            info,
            kind,
            summary,
            dtstart,
            dtend,
            duration,
            dtstamp,
            all_day,
            status,
            transparency,
            free_busy,
            partstat,
            is_organizer,
            sequence,
            recur_id,
            recurrence: None,
        };
        invite.validate_duration();

        if add_props.is_empty() {
            if !sub_props.is_empty() {
                debug!(uid = %invite.uid, "Ignoring exclusions without RRULE or RDATE");
            }
            return Ok(invite);
        }

        let dtstart = match &invite.dtstart {
            Some(dtstart) => dtstart.clone(),
            None => bail!("Missing DTSTART for recurrence in {}", invite.uid),
        };
        let rule_duration = invite.rule_duration();
        let add = repeating_rules(&add_props, &dtstart, rule_duration, info, tzmap)?;
        let subtract = repeating_rules(&sub_props, &dtstart, rule_duration, info, tzmap)?;

        invite.recurrence = Some(match &invite.recur_id {
            Some(rid) => IRecurrence::Exception(ExceptionRule::new(
                rid.clone(),
                dtstart,
                rule_duration,
                info,
                add,
                subtract,
            )?),
            None => IRecurrence::Recurrence(RecurrenceRule::new(
                dtstart,
                rule_duration,
                info,
                add,
                subtract,
            )?),
        });

        Ok(invite)
    }

    /// Force a positive length: an end at or before the start moves to one
    /// second (or one day) after it, and a non-positive DURATION becomes
    /// that minimum. To-dos are left alone.
    pub fn validate_duration(&mut self) {
        if self.kind == ComponentKind::Todo {
            return;
        }
        let start = match &self.dtstart {
            Some(start) => start,
            None => return,
        };
        let min = minimum_duration(start);

        if let Some(end) = &self.dtend {
            if end <= start {
                let fixed = start.add(&min);
                debug!(uid = %self.uid, end = %end, fixed = %fixed, "Normalized end before start");
                self.dtend = Some(fixed);
            }
        } else if let Some(duration) = &self.duration {
            if duration.is_negative() || duration.is_zero() {
                debug!(uid = %self.uid, duration = %duration, "Normalized non-positive duration");
                self.duration = Some(min);
            }
        }
    }

    /// Length of each occurrence of the invite's rules.
    fn rule_duration(&self) -> ParsedDuration {
        let start = match &self.dtstart {
            Some(start) => start,
            None => return ParsedDuration::default(),
        };
        match (&self.duration, &self.dtend) {
            (Some(duration), _) => *duration,
            (None, Some(end)) if self.kind == ComponentKind::Event => end.difference(start),
            _ => minimum_duration(start),
        }
    }

    /// DTEND, else DTSTART + DURATION, else DTSTART plus a day (dates) or
    /// a second.
    pub fn effective_end(&self) -> Option<ParsedDateTime> {
        if let Some(end) = &self.dtend {
            return Some(end.clone());
        }
        let start = self.dtstart.as_ref()?;
        Some(match &self.duration {
            Some(duration) => start.add(duration),
            None => start.add(&minimum_duration(start)),
        })
    }

    pub fn effective_duration(&self) -> Option<ParsedDuration> {
        let start = self.dtstart.as_ref()?;
        Some(self.effective_end()?.difference(start))
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    pub fn is_exception(&self) -> bool {
        self.recur_id.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == Status::Cancelled
    }

    pub fn is_transparent(&self) -> bool {
        self.transparency == Transparency::Transparent
    }

    /// What the owner shows as, given their PARTSTAT and the event STATUS.
    pub fn free_busy_actual(&self) -> FreeBusyStatus {
        if self.free_busy == FreeBusyStatus::Free {
            return FreeBusyStatus::Free;
        }
        match self.partstat {
            PartStat::Accepted => self.free_busy.clone(),
            PartStat::NeedsAction | PartStat::Tentative => FreeBusyStatus::Tentative,
            _ if self.status == Status::Tentative => FreeBusyStatus::Tentative,
            PartStat::Declined | PartStat::Delegated => FreeBusyStatus::Free,
            _ if self.status == Status::Cancelled => FreeBusyStatus::Free,
            _ => self.free_busy.clone(),
        }
    }

    /// Every TZID the invite refers to.
    pub fn referenced_tzids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        let dates = self
            .dtstart
            .iter()
            .chain(self.dtend.iter())
            .chain(self.recur_id.iter().map(RecurId::dt));
        for dt in dates {
            if let Some(tzid) = dt.tzid() {
                ids.insert(tzid.to_string());
            }
        }
        if let Some(rule) = &self.recurrence {
            rule.collect_tzids(&mut ids);
        }
        ids
    }

    /// Occurrences overlapping `[range_start, range_end)`. A non-recurring
    /// invite has one, from DTSTART to its effective end.
    pub fn expand_instances(&self, range_start: i64, range_end: i64, limits: &ExpansionLimits) -> Vec<Instance> {
        if let Some(rule) = &self.recurrence {
            return rule.expand_instances_with(range_start, range_end, limits);
        }

        match (&self.dtstart, self.effective_end()) {
            (Some(start), end) => IRecurrence::Single(SingleInstanceRule::new(start.clone(), end, None, self.info))
                .expand_instances_with(range_start, range_end, limits),
            (None, _) => Vec::new(),
        }
    }

    pub fn encode_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.put_str("u", self.uid.as_str())
            .put_long("mid", i64::from(self.info.msg_id))
            .put_long("comp", i64::from(self.info.comp_id))
            .put_long(
                "it",
                match self.kind {
                    ComponentKind::Event => ITEM_TYPE_APPOINTMENT,
                    ComponentKind::Todo => ITEM_TYPE_TASK,
                },
            )
            .put_opt_str("n", self.summary.as_deref())
            .put_str("status", self.status.as_str())
            .put_str(
                "fb",
                self.free_busy
                    .code()
                    .map(String::from)
                    .unwrap_or_else(|| self.free_busy.as_fbtype().to_string()),
            )
            .put_str("tr", self.transparency.code())
            .put_opt_str("st", self.dtstart.as_ref().map(ParsedDateTime::to_meta))
            .put_opt_str("et", self.dtend.as_ref().map(ParsedDateTime::to_meta))
            .put_opt_str("duration", self.duration.map(|d| d.to_string()))
            .put_opt_str("dts", self.dtstamp.as_ref().map(ParsedDateTime::to_meta))
            .put_bool("ad", self.all_day)
            .put_str("ptst", self.partstat.as_str())
            .put_bool("isOrg", self.is_organizer)
            .put_long("seq", i64::from(self.sequence));

        if let Some(rid) = &self.recur_id {
            meta.put_map("rid", rid.encode_metadata());
        }
        if let Some(rule) = &self.recurrence {
            meta.put_map("recurrence", rule.encode_metadata());
        }
        meta
    }

    pub fn decode_metadata(meta: &Metadata, tzmap: &mut TimeZoneMap) -> error::Result<Invite> {
        let date = |key: &str, tzmap: &mut TimeZoneMap| -> error::Result<Option<ParsedDateTime>> {
            meta.get_opt_str(key)
                .map(|text| ParsedDateTime::from_meta(text, tzmap))
                .transpose()
        };
        let small = |key: &str| -> error::Result<i32> {
            let value = meta.get_long_or(key, 0)?;
            i32::try_from(value)
                .map_err(|_| CalendarError::Metadata(format!("field '{}' out of range: {}", key, value)))
        };

        let kind = match meta.get_long_or("it", ITEM_TYPE_APPOINTMENT)? {
            ITEM_TYPE_TASK => ComponentKind::Todo,
            _ => ComponentKind::Event,
        };

        let free_busy = match meta.get_opt_str("fb") {
            None => FreeBusyStatus::Busy,
            Some(text) => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => FreeBusyStatus::from_code(c).unwrap_or(FreeBusyStatus::Busy),
                    _ => FreeBusyStatus::from_fbtype(text),
                }
            }
        };

        let recur_id = meta
            .get_opt_map("rid")
            .map(|rid| RecurId::decode_metadata(rid, tzmap))
            .transpose()?;
        let recurrence = meta
            .get_opt_map("recurrence")
            .map(|rule| IRecurrence::decode_metadata(rule, tzmap))
            .transpose()?;

        Ok(Invite {
            uid: meta.get_str("u")?.to_string(),
            info: InviteInfo::new(small("mid")?, small("comp")?),
            kind,
            summary: meta.get_opt_str("n").map(str::to_string),
            dtstart: date("st", tzmap)?,
            dtend: date("et", tzmap)?,
            duration: meta
                .get_opt_str("duration")
                .map(str::parse::<ParsedDuration>)
                .transpose()?,
            dtstamp: date("dts", tzmap)?,
            all_day: meta.get_bool_or("ad", false)?,
            status: meta.get_opt_str("status").and_then(|s| s.parse().ok()).unwrap_or_default(),
            transparency: Transparency::from_code(meta.get_opt_str("tr").unwrap_or("O")),
            free_busy,
            partstat: meta
                .get_opt_str("ptst")
                .and_then(|s| s.parse().ok())
                .unwrap_or(PartStat::Accepted),
            is_organizer: meta.get_bool_or("isOrg", false)?,
            sequence: u32::try_from(small("seq")?.max(0)).unwrap_or(0),
            recur_id,
            recurrence,
        })
    }
}

/// All the components of one UID: the series (if any) and its
/// RECURRENCE-ID overrides.
#[derive(Debug, Clone)]
pub struct EventCollection {
    pub master: Option<Invite>,
    pub exceptions: Vec<Invite>,
}

impl EventCollection {
    /// Group the invites of one UID, attaching overrides of a recurring
    /// master as exceptions, or as cancellations when they are CANCELLED.
    pub fn new(invites: Vec<Invite>) -> Result<Self, Error> {
        let (masters, exceptions): (Vec<_>, Vec<_>) =
            invites.into_iter().partition(|invite| invite.recur_id.is_none());

        ensure!(
            masters.len() <= 1,
            "{} components without RECURRENCE-ID share the UID {}",
            masters.len(),
            masters[0].uid
        );

        let mut master = masters.into_iter().next();
        if let Some(IRecurrence::Recurrence(rule)) = master.as_mut().and_then(|m| m.recurrence.as_mut()) {
            for exception in &exceptions {
                attach(rule, exception)
                    .with_context(|| format!("attaching exception to {}", exception.uid))?;
            }
        }

        Ok(EventCollection { master, exceptions })
    }

    pub fn invites(&self) -> impl Iterator<Item = &Invite> {
        self.master.iter().chain(self.exceptions.iter())
    }

    fn has_recurring_master(&self) -> bool {
        matches!(
            self.master.as_ref().and_then(|m| m.recurrence.as_ref()),
            Some(IRecurrence::Recurrence(_))
        )
    }

    /// Occurrences of the whole collection, sorted. Exceptions of a
    /// recurring master come out of the master's expansion.
    pub fn expand_instances(&self, range_start: i64, range_end: i64, limits: &ExpansionLimits) -> Vec<Instance> {
        let mut instances: Vec<Instance> = if self.has_recurring_master() {
            self.master
                .iter()
                .flat_map(|m| m.expand_instances(range_start, range_end, limits))
                .collect()
        } else {
            self.invites()
                .flat_map(|invite| invite.expand_instances(range_start, range_end, limits))
                .collect()
        };
        instances.sort();
        instances
    }
}

fn attach(rule: &mut RecurrenceRule, exception: &Invite) -> Result<(), Error> {
    let rid = match &exception.recur_id {
        Some(rid) => rid.clone(),
        None => return Ok(()),
    };

    if exception.is_cancelled() {
        debug!(uid = %exception.uid, recur_id = %rid, "Attached cancellation");
        rule.add_cancellation(CancellationRule::new(rid));
        return Ok(());
    }

    let exception_rule = match &exception.recurrence {
        Some(IRecurrence::Exception(rule)) => rule.clone(),
        _ => {
            let start = exception.dtstart.clone().unwrap_or_else(|| rid.dt().clone());
            let duration = exception
                .effective_duration()
                .unwrap_or_else(|| minimum_duration(&start));
            ExceptionRule::new(rid, start, duration, exception.info, Vec::new(), Vec::new())?
        }
    };
    rule.add_exception(exception_rule);
    Ok(())
}

/// The free/busy partition of `[start, end)` for a set of invites.
///
/// Transparent occurrences don't count. Overrides of a recurring master in
/// the same set are reached through the master's expansion, and each
/// occurrence shows as its own invite's [`Invite::free_busy_actual`].
pub fn free_busy_for<'a>(
    name: &str,
    invites: impl IntoIterator<Item = &'a Invite>,
    start: i64,
    end: i64,
    limits: &ExpansionLimits,
) -> FreeBusy {
    let invites: Vec<&Invite> = invites.into_iter().collect();
    let by_info: HashMap<InviteInfo, &Invite> = invites.iter().map(|invite| (invite.info, *invite)).collect();
    let recurring: HashSet<&str> = invites
        .iter()
        .filter(|invite| matches!(invite.recurrence, Some(IRecurrence::Recurrence(_))))
        .map(|invite| invite.uid.as_str())
        .collect();

    let mut occurrences = Vec::new();
    for &invite in &invites {
        if invite.is_exception() && recurring.contains(invite.uid.as_str()) {
            continue;
        }

        for inst in invite.expand_instances(start, end, limits) {
            let owner = by_info.get(&inst.invite).copied().unwrap_or(invite);
            if owner.is_transparent() {
                continue;
            }

            let recur_id = match &owner.recur_id {
                Some(rid) => rid.dt().utc_millis(),
                None if invite.is_recurring() => inst.start,
                None => 0,
            };
            occurrences.push(FBInstance {
                start: inst.start,
                end: inst.end,
                invite: inst.invite,
                recur_id,
                status: owner.free_busy_actual(),
            });
        }
    }

    FreeBusy::build(name, start, end, occurrences)
}

/// A VCALENDAR object with its timezones resolved.
#[derive(Debug, Clone)]
pub struct VCalendar {
    pub prodid: String,
    pub version: String,
    pub method: Option<String>,

    /// Keyed by UID.
    pub events: BTreeMap<String, EventCollection>,
    /// Only the zones the events refer to.
    pub tzmap: TimeZoneMap,

    pub properties: Vec<Property>,
}

impl VCalendar {
    /// Read a VCALENDAR, resolving TZIDs against `well_known` and the
    /// calendar's own VTIMEZONEs. With `continue_on_error` a component
    /// that fails to parse is logged and skipped.
    pub fn from_component(
        component: &Component,
        well_known: Arc<dyn WellKnownTimeZones>,
        owner: Option<&str>,
        continue_on_error: bool,
    ) -> Result<Self, Error> {
        ensure!(component.is("VCALENDAR"), "Expected VCALENDAR, got {}", component.name);

        let mut tzmap = TimeZoneMap::new(well_known);
        for vtimezone in component.components_named("VTIMEZONE") {
            match ICalTimeZone::from_component(vtimezone).with_context(|| "parsing VTIMEZONE") {
                Ok(tz) => tzmap.add_definition(tz),
                Err(e) if continue_on_error => {
                    warn!("Skipping error during ics parse/import: {:#}", e)
                }
                Err(e) => return Err(e),
            }
        }

        let mut prodid = None;
        let mut version = None;
        let mut method = None;
        let mut properties = Vec::new();
        for prop in &component.properties {
            match prop.name.to_ascii_uppercase().as_str() {
                "PRODID" => prodid = Some(prop.value.clone()),
                "VERSION" => version = Some(prop.value.clone()),
                "METHOD" => method = Some(prop.value.trim().to_ascii_uppercase()),
                _ => properties.push(prop.clone()),
            }
        }

        // Events are read after the timezones so their TZIDs resolve.
        let mut grouped: BTreeMap<String, Vec<Invite>> = BTreeMap::new();
        let items = component
            .sub_components
            .iter()
            .filter(|c| c.is("VEVENT") || c.is("VTODO"));
        for (comp_id, item) in items.enumerate() {
            let info = InviteInfo::new(0, comp_id as i32);
            match Invite::from_component(item, info, owner, &mut tzmap)
                .with_context(|| format!("parsing {}", item.name))
            {
                Ok(invite) => grouped.entry(invite.uid.clone()).or_default().push(invite),
                Err(e) if continue_on_error => {
                    warn!("Skipping error during ics parse/import: {:#}", e)
                }
                Err(e) => return Err(e),
            }
        }

        let mut events = BTreeMap::new();
        for (uid, invites) in grouped {
            match EventCollection::new(invites) {
                Ok(collection) => {
                    events.insert(uid, collection);
                }
                Err(e) if continue_on_error => {
                    warn!(uid = %uid, "Skipping error during ics parse/import: {:#}", e)
                }
                Err(e) => return Err(e),
            }
        }

        let referenced: BTreeSet<String> = events
            .values()
            .flat_map(EventCollection::invites)
            .flat_map(Invite::referenced_tzids)
            .collect();
        tzmap.reduce_to(&referenced);

        Ok(VCalendar {
            prodid: prodid.ok_or_else(|| format_err!("Missing PRODID field in VCALENDAR"))?,
            version: version.ok_or_else(|| format_err!("Missing VERSION field in VCALENDAR"))?,
            method,
            events,
            tzmap,
            properties,
        })
    }

    pub fn invites(&self) -> impl Iterator<Item = &Invite> {
        self.events.values().flat_map(EventCollection::invites)
    }

    pub fn invite(&self, info: InviteInfo) -> Option<&Invite> {
        self.invites().find(|invite| invite.info == info)
    }

    /// Occurrences of every event, sorted by start then end.
    pub fn expand_instances(&self, range_start: i64, range_end: i64, limits: &ExpansionLimits) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self
            .events
            .values()
            .flat_map(|collection| collection.expand_instances(range_start, range_end, limits))
            .collect();
        instances.sort();
        instances
    }

    pub fn free_busy(&self, name: &str, start: i64, end: i64, limits: &ExpansionLimits) -> FreeBusy {
        free_busy_for(name, self.invites(), start, end, limits)
    }
}

impl TryFrom<parser::Component> for VCalendar {
    type Error = Error;

    fn try_from(component: parser::Component) -> Result<Self, Self::Error> {
        VCalendar::from_component(&component, Arc::new(StaticWellKnownZones::new()), None, false)
    }
}
