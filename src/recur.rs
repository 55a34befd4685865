//! RRULE values and their expansion.
//!
//! Expansion walks the rule one period (hour, day, week, month or year) at a
//! time from DTSTART. A period start that fails a limiting BYxxx part is
//! moved forward to the next plausible period; one that passes is expanded
//! into candidates, cut down by BYSETPOS, and the candidates inside the
//! requested range are kept.

use std::{collections::BTreeSet, convert::TryFrom, fmt, str::FromStr};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Weekday};
use itertools::Itertools;
use regex::Regex;
use tracing::{debug, warn};

use crate::{
    config::{ExpansionLimits, MAX_DATE_MILLIS},
    datetime::{days_in_month, DateTimeZone, ParsedDateTime},
    duration::MILLIS_PER_SECOND,
    error::{CalendarError, Result},
    timezone::weekday_code,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Secondly => "SECONDLY",
            Frequency::Minutely => "MINUTELY",
            Frequency::Hourly => "HOURLY",
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        }
    }

    /// Consecutive periods without an instance after which a rule is
    /// considered broken: four years' worth, and never fewer than four.
    fn empty_period_limit(self, interval: u32) -> u32 {
        let per_four_years = match self {
            Frequency::Yearly => 4,
            Frequency::Monthly => 48,
            Frequency::Weekly => 209,
            Frequency::Daily => 1461,
            _ => 4,
        };
        (per_four_years / interval.max(1)).max(4)
    }
}

impl FromStr for Frequency {
    type Err = CalendarError;

    fn from_str(s: &str) -> Result<Frequency> {
        Ok(match &s.to_ascii_uppercase() as &str {
            "SECONDLY" => Frequency::Secondly,
            "MINUTELY" => Frequency::Minutely,
            "HOURLY" => Frequency::Hourly,
            "DAILY" => Frequency::Daily,
            "WEEKLY" => Frequency::Weekly,
            "MONTHLY" => Frequency::Monthly,
            "YEARLY" => Frequency::Yearly,
            _ => return Err(CalendarError::parse("frequency", s, "unknown frequency")),
        })
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndCondition {
    /// Total number of instances, DTSTART included. Zero means no limit.
    Count(u32),
    /// Last possible instance. Date-only and floating values are read in
    /// the zone of the DTSTART the rule is expanded from.
    Until(ParsedDateTime),
    Infinite,
}

/// A parsed RRULE (or EXRULE) value.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub end_condition: EndCondition,
    pub by_second: Vec<u8>,
    pub by_minute: Vec<u8>,
    pub by_hour: Vec<u8>,
    pub by_day: Vec<(Option<i8>, Weekday)>,
    pub by_month_day: Vec<i8>,
    pub by_year_day: Vec<i16>,
    pub by_week_number: Vec<i8>,
    pub by_month: Vec<u16>,
    pub by_set_pos: Vec<i16>,
    pub week_start: Weekday,
    /// `X-` parts, kept so they survive a round trip.
    pub x_names: Vec<(String, String)>,
}

fn parse_weekday(code: &str) -> Option<Weekday> {
    Some(match &code.to_ascii_uppercase() as &str {
        "MO" => Weekday::Mon,
        "TU" => Weekday::Tue,
        "WE" => Weekday::Wed,
        "TH" => Weekday::Thu,
        "FR" => Weekday::Fri,
        "SA" => Weekday::Sat,
        "SU" => Weekday::Sun,
        _ => return None,
    })
}

/// Parses a comma separated list of integers, skipping values outside
/// `min..=max` (and zero, for lists that count from both ends).
fn parse_list<T>(name: &str, value: &str, min: i32, max: i32) -> Result<Vec<T>>
where
    T: TryFrom<i32> + Ord,
{
    let mut values = Vec::new();

    for item in value.split(',').filter(|s| !s.is_empty()) {
        let n: i32 = item
            .strip_prefix('+')
            .unwrap_or(item)
            .parse()
            .map_err(|e| CalendarError::parse("recurrence rule part", item, e))?;

        if n < min || n > max || (min < 0 && n == 0) {
            debug!("Skipping out of range {} value {}", name, n);
            continue;
        }

        match T::try_from(n) {
            Ok(v) => values.push(v),
            Err(_) => debug!("Skipping out of range {} value {}", name, n),
        }
    }

    values.sort();
    values.dedup();
    Ok(values)
}

fn parse_day_list(value: &str) -> Result<Vec<(Option<i8>, Weekday)>> {
    let re = Regex::new(r"^([+-]?[0-9]+)?([A-Za-z]{2})$")
        .map_err(|e| CalendarError::parse("BYDAY", value, e))?;

    let mut days = Vec::new();
    for val in value.split_terminator(',') {
        let caps = re
            .captures(val)
            .ok_or_else(|| CalendarError::parse("BYDAY", val, "expected [+-]N followed by a day"))?;

        let weekday = caps
            .get(2)
            .and_then(|m| parse_weekday(m.as_str()))
            .ok_or_else(|| CalendarError::parse("BYDAY", val, "unknown day"))?;

        let num = match caps.get(1) {
            Some(m) => {
                let n: i8 = m
                    .as_str()
                    .trim_start_matches('+')
                    .parse()
                    .map_err(|e| CalendarError::parse("BYDAY", val, e))?;
                if n == 0 {
                    None
                } else {
                    Some(n)
                }
            }
            None => None,
        };

        days.push((num, weekday));
    }

    days.sort_by_key(|(_, day)| day.num_days_from_sunday());
    Ok(days)
}

impl FromStr for RecurRule {
    type Err = CalendarError;

    fn from_str(rule_value_string: &str) -> Result<RecurRule> {
        let mut frequency = None;
        let mut rule = RecurRule::new(Frequency::Yearly);

        for part in rule_value_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let split_pos = match part.find('=') {
                Some(pos) => pos,
                None => {
                    debug!("Skipping RECUR token without a value: {}", part);
                    continue;
                }
            };
            let (name, tail) = part.split_at(split_pos);
            let name = name.trim().to_ascii_uppercase();
            let value: String = tail[1..].chars().filter(|c| !c.is_whitespace()).collect();
            let value = value.as_str();

            match &name as &str {
                "FREQ" => frequency = Some(value.parse()?),
                "UNTIL" => {
                    rule.end_condition =
                        EndCondition::Until(ParsedDateTime::parse_in(value, DateTimeZone::Floating)?)
                }
                "COUNT" => {
                    rule.end_condition = EndCondition::Count(
                        value
                            .parse()
                            .map_err(|e| CalendarError::parse("COUNT", value, e))?,
                    )
                }
                "INTERVAL" => {
                    rule.interval = value
                        .parse()
                        .map_err(|e| CalendarError::parse("INTERVAL", value, e))?
                }
                "BYSECOND" => rule.by_second = parse_list(&name, value, 0, 59)?,
                "BYMINUTE" => rule.by_minute = parse_list(&name, value, 0, 59)?,
                "BYHOUR" => rule.by_hour = parse_list(&name, value, 0, 23)?,
                "BYDAY" => rule.by_day = parse_day_list(value)?,
                "BYMONTHDAY" => rule.by_month_day = parse_list(&name, value, -31, 31)?,
                "BYYEARDAY" => rule.by_year_day = parse_list(&name, value, -366, 366)?,
                "BYWEEKNO" => rule.by_week_number = parse_list(&name, value, -53, 53)?,
                "BYMONTH" => rule.by_month = parse_list(&name, value, 1, 12)?,
                "BYSETPOS" => rule.by_set_pos = parse_list(&name, value, -366, 366)?,
                "WKST" => {
                    rule.week_start = parse_weekday(value)
                        .ok_or_else(|| CalendarError::parse("WKST", value, "unknown day"))?
                }
                x if x.starts_with("X-") => rule.x_names.push((name.clone(), value.to_string())),
                _ => warn!("Skipping RECUR token: {}", part),
            }
        }

        rule.frequency = frequency
            .ok_or_else(|| CalendarError::parse("recurrence rule", rule_value_string, "missing FREQ"))?;

        Ok(rule)
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, name: &str, values: &[T]) -> fmt::Result {
    if values.is_empty() {
        return Ok(());
    }
    write!(f, ";{}={}", name, values.iter().join(","))
}

impl fmt::Display for RecurRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FREQ={}", self.frequency)?;

        match &self.end_condition {
            EndCondition::Until(until) => write!(f, ";UNTIL={}", until)?,
            EndCondition::Count(count) if *count > 0 => write!(f, ";COUNT={}", count)?,
            EndCondition::Count(_) | EndCondition::Infinite => {}
        }

        if self.interval > 1 {
            write!(f, ";INTERVAL={}", self.interval)?;
        }

        write_list(f, "BYSECOND", &self.by_second)?;
        write_list(f, "BYMINUTE", &self.by_minute)?;
        write_list(f, "BYHOUR", &self.by_hour)?;

        if !self.by_day.is_empty() {
            let days = self.by_day.iter().map(|(num, day)| match num {
                Some(num) => format!("{}{}", num, weekday_code(*day)),
                None => weekday_code(*day).to_string(),
            });
            write!(f, ";BYDAY={}", days.format(","))?;
        }

        write_list(f, "BYMONTHDAY", &self.by_month_day)?;
        write_list(f, "BYYEARDAY", &self.by_year_day)?;
        write_list(f, "BYWEEKNO", &self.by_week_number)?;
        write_list(f, "BYMONTH", &self.by_month)?;
        write_list(f, "BYSETPOS", &self.by_set_pos)?;

        if self.week_start != Weekday::Mon {
            write!(f, ";WKST={}", weekday_code(self.week_start))?;
        }

        for (name, value) in &self.x_names {
            write!(f, ";{}={}", name, value)?;
        }

        Ok(())
    }
}

impl RecurRule {
    pub fn new(frequency: Frequency) -> RecurRule {
        RecurRule {
            frequency,
            interval: 1,
            end_condition: EndCondition::Infinite,
            by_second: Vec::new(),
            by_minute: Vec::new(),
            by_hour: Vec::new(),
            by_day: Vec::new(),
            by_month_day: Vec::new(),
            by_year_day: Vec::new(),
            by_week_number: Vec::new(),
            by_month: Vec::new(),
            by_set_pos: Vec::new(),
            week_start: Weekday::Mon,
            x_names: Vec::new(),
        }
    }

    pub fn count(&self) -> Option<u32> {
        match self.end_condition {
            EndCondition::Count(count) if count > 0 => Some(count),
            _ => None,
        }
    }

    pub fn until(&self) -> Option<&ParsedDateTime> {
        match &self.end_condition {
            EndCondition::Until(until) => Some(until),
            _ => None,
        }
    }

    /// UNTIL as an absolute instant, reading floating and date-only values
    /// in `zone`.
    pub fn until_millis(&self, zone: &DateTimeZone) -> Option<i64> {
        match &self.end_condition {
            EndCondition::Until(until) if until.has_time() && until.is_floating() => {
                Some(zone.to_utc_millis(until.local()))
            }
            EndCondition::Until(until) => Some(until.utc_until_for(zone)),
            _ => None,
        }
    }

    fn is_simple(&self) -> bool {
        self.by_second.is_empty()
            && self.by_minute.is_empty()
            && self.by_hour.is_empty()
            && self.by_day.is_empty()
            && self.by_month_day.is_empty()
            && self.by_year_day.is_empty()
            && self.by_week_number.is_empty()
            && self.by_month.is_empty()
            && self.by_set_pos.is_empty()
    }

    /// Whether a yearly rule from Feb 29th only ever lands on Feb 29th, so
    /// that non-leap years have no instance at all.
    fn leap_day_only(&self) -> bool {
        self.frequency == Frequency::Yearly
            && (self.is_simple()
                || (self.by_month_day == [29]
                    && (self.by_month.is_empty() || self.by_month == [2])
                    && self.by_day.is_empty()
                    && self.by_year_day.is_empty()
                    && self.by_set_pos.is_empty()))
    }

    fn check_combinations(&self) -> std::result::Result<(), String> {
        if !self.by_week_number.is_empty() && self.frequency != Frequency::Yearly {
            return Err("BYWEEKNO is only valid with FREQ=YEARLY".to_string());
        }

        if !self.by_year_day.is_empty()
            && matches!(
                self.frequency,
                Frequency::Daily | Frequency::Weekly | Frequency::Monthly
            )
        {
            return Err(format!("BYYEARDAY is not valid with FREQ={}", self.frequency));
        }

        if !self.by_month_day.is_empty() && self.frequency == Frequency::Weekly {
            return Err("BYMONTHDAY is not valid with FREQ=WEEKLY".to_string());
        }

        if self.by_day.iter().any(|(num, _)| num.is_some())
            && !matches!(self.frequency, Frequency::Monthly | Frequency::Yearly)
        {
            return Err(format!(
                "numeric BYDAY is not valid with FREQ={}",
                self.frequency
            ));
        }

        Ok(())
    }

    /// The latest instant expansion will ever look at: UNTIL, or DTSTART
    /// plus the hard limit for the rule's frequency, whichever is earlier.
    pub fn estimated_end(&self, dtstart: &ParsedDateTime, limits: &ExpansionLimits) -> i64 {
        let local = dtstart.local();
        let positive = |n: i32| if n > 0 { Some(i64::from(n)) } else { None };

        let hard_end = match self.frequency {
            Frequency::Daily => positive(limits.max_days).map(|n| advance(local, Duration::days(n))),
            Frequency::Weekly => positive(limits.max_weeks).map(|n| advance(local, Duration::weeks(n))),
            Frequency::Monthly => positive(limits.max_months).map(|n| add_months(local, n, local.day())),
            Frequency::Yearly => {
                positive(limits.max_years).map(|n| add_months(local, 12 * n, local.day()))
            }
            Frequency::Hourly | Frequency::Minutely | Frequency::Secondly => {
                let years = i64::from(limits.max_years_other_freqs.max(1));
                Some(add_months(local, 12 * years, local.day()))
            }
        };

        let hard_end = match hard_end {
            Some(end) if end != NaiveDateTime::MAX => {
                dtstart.zone().to_utc_millis(end).min(MAX_DATE_MILLIS)
            }
            _ => MAX_DATE_MILLIS,
        };

        match self.until_millis(dtstart.zone()) {
            Some(until) => until.min(hard_end),
            None => hard_end,
        }
    }

    /// Start instants (UTC milliseconds) of the rule anchored at `dtstart`
    /// inside `[range_start, range_end)`, in order. DTSTART is always the
    /// first instance, whether or not it matches the rule.
    ///
    /// Rules that can't be expanded yield what was found so far (usually
    /// nothing) and log a warning.
    pub fn expand(
        &self,
        dtstart: &ParsedDateTime,
        range_start: i64,
        range_end: i64,
        limits: &ExpansionLimits,
    ) -> Vec<i64> {
        if let Err(reason) = self.check_combinations() {
            warn!(rule = %self, "Invalid recurrence rule: {}", reason);
            return Vec::new();
        }

        let zone = dtstart.zone();
        let start_millis = dtstart.utc_millis();
        let earliest = start_millis.max(range_start);
        let last = (range_end - MILLIS_PER_SECOND).min(self.estimated_end(dtstart, limits));
        if last < earliest {
            return Vec::new();
        }

        let max_instances = match (limits.max_instances > 0, self.count()) {
            (true, Some(count)) => i64::from(limits.max_instances).min(i64::from(count)),
            (true, None) => i64::from(limits.max_instances),
            (false, Some(count)) => i64::from(count),
            (false, None) => 0,
        };

        let mut instances = Vec::new();
        if start_millis >= earliest && start_millis <= last {
            instances.push(start_millis);
        }

        let interval = i64::from(self.interval.max(1));
        let empty_limit = self.frequency.empty_period_limit(self.interval);
        let base = dtstart.local();
        let base_day = base.day();
        let skip_non_leap_years = base.month() == 2 && base_day == 29 && self.leap_day_only();

        let mut cur = base;
        let mut num_expanded: i64 = 1;
        let mut empty_periods = 0;

        while max_instances <= 0 || num_expanded < max_instances {
            if cur == NaiveDateTime::MAX {
                break;
            }

            let cur_millis = zone.to_utc_millis(cur);
            let cur_at_or_after_earliest = cur_millis >= earliest;
            let cur_after_end = cur_millis > last;

            let candidates = match self.frequency {
                Frequency::Hourly => {
                    let matches = self.check_month(&mut cur)
                        && self.check_year_day(&mut cur)
                        && self.check_month_day(&mut cur)
                        && self.check_day(&mut cur)
                        && self.check_hour(&mut cur);
                    if !matches {
                        if cur_after_end {
                            break;
                        }
                        continue;
                    }

                    let period = vec![cur];
                    cur = advance(cur, Duration::hours(interval));
                    self.expand_seconds(self.expand_minutes(period))
                }
                Frequency::Daily => {
                    let matches = self.check_month(&mut cur)
                        && self.check_year_day(&mut cur)
                        && self.check_month_day(&mut cur)
                        && self.check_day(&mut cur);
                    if !matches {
                        if cur_after_end {
                            break;
                        }
                        continue;
                    }

                    let period = vec![cur];
                    cur = advance(cur, Duration::days(interval));
                    self.expand_times(period)
                }
                Frequency::Weekly => {
                    let matches = self.check_month(&mut cur)
                        && self.check_year_day(&mut cur)
                        && self.check_month_day(&mut cur);
                    if !matches {
                        if cur_after_end {
                            break;
                        }
                        continue;
                    }

                    let period = vec![cur];
                    cur = advance(cur, Duration::weeks(interval));
                    self.expand_times(self.expand_weekly_days(period))
                }
                Frequency::Monthly => {
                    let matches = self.check_month(&mut cur) && self.check_year_day(&mut cur);
                    if !matches {
                        if cur_after_end {
                            break;
                        }
                        continue;
                    }

                    let period = vec![cur];
                    cur = add_months(cur, interval, base_day);
                    let dates = self.expand_month_days(period);
                    self.expand_times(self.expand_days_in_period(dates))
                }
                Frequency::Yearly => {
                    if skip_non_leap_years && cur.day() != 29 {
                        cur = add_months(cur, 12 * interval, base_day);
                        Vec::new()
                    } else {
                        let period = vec![cur];
                        cur = add_months(cur, 12 * interval, base_day);
                        let dates = self.expand_months(period);
                        let dates = self.expand_year_days(dates);
                        let dates = self.expand_month_days(dates);
                        self.expand_times(self.expand_days_in_period(dates))
                    }
                }
                Frequency::Minutely | Frequency::Secondly => {
                    debug!(rule = %self, "Not expanding sub-hourly recurrence");
                    break;
                }
            };

            let mut candidates = candidates;
            candidates.sort();
            candidates.dedup();

            let mut no_instance = true;
            let mut found_past_end = false;

            for candidate in self.apply_set_pos(candidates) {
                let millis = zone.to_utc_millis(candidate);

                // DTSTART was counted before the loop.
                if millis == start_millis {
                    no_instance = false;
                    continue;
                }

                if millis > start_millis {
                    num_expanded += 1;
                }

                if millis <= last {
                    if millis >= earliest {
                        instances.push(millis);
                        no_instance = false;
                    }
                } else {
                    found_past_end = true;
                    break;
                }

                if max_instances > 0 && num_expanded >= max_instances {
                    break;
                }
            }

            if cur_at_or_after_earliest {
                if no_instance {
                    empty_periods += 1;
                } else {
                    empty_periods = 0;
                }

                if empty_periods >= empty_limit {
                    warn!(rule = %self, "Invalid recurrence rule: no instance in {} periods", empty_limit);
                    break;
                }
            }

            if found_past_end || (no_instance && cur_after_end) {
                break;
            }
        }

        instances.sort_unstable();
        instances.dedup();
        instances
    }

    /// Moves `cur` to the start of the period containing `date`.
    fn jump_to(&self, cur: &mut NaiveDateTime, date: Option<NaiveDate>) {
        let now = *cur;
        *cur = date
            .and_then(|date| match self.frequency {
                Frequency::Hourly => date.and_hms_opt(0, now.minute(), now.second()),
                Frequency::Weekly => date
                    .checked_add_signed(Duration::days(days_between(date.weekday(), now.weekday())))
                    .map(|d| d.and_time(now.time())),
                _ => Some(date.and_time(now.time())),
            })
            .unwrap_or(NaiveDateTime::MAX);
    }

    fn check_month(&self, cur: &mut NaiveDateTime) -> bool {
        let now = *cur;
        let month = now.month() as u16;
        if self.by_month.is_empty() || self.by_month.contains(&month) {
            return true;
        }

        let (year, next) = match self.by_month.iter().find(|&&m| m > month) {
            Some(&m) => (now.year(), u32::from(m)),
            None => (now.year() + 1, u32::from(self.by_month[0])),
        };
        let day = if self.frequency == Frequency::Monthly {
            now.day().min(days_in_month(year, next))
        } else {
            1
        };

        self.jump_to(cur, NaiveDate::from_ymd_opt(year, next, day));
        false
    }

    fn check_year_day(&self, cur: &mut NaiveDateTime) -> bool {
        if self.by_year_day.is_empty() {
            return true;
        }

        let now = *cur;
        let days = resolve_ordinals(&self.by_year_day, get_days_in_year(now.year()));
        let today = now.ordinal();
        if days.contains(&today) {
            return true;
        }

        let target = match days.iter().find(|&&d| d > today) {
            Some(&d) => NaiveDate::from_yo_opt(now.year(), d),
            None => NaiveDate::from_yo_opt(now.year() + 1, 1),
        };
        self.jump_to(cur, target);
        false
    }

    fn check_month_day(&self, cur: &mut NaiveDateTime) -> bool {
        if self.by_month_day.is_empty() {
            return true;
        }

        let now = *cur;
        let days = resolve_ordinals(&self.by_month_day, days_in_month(now.year(), now.month()));
        let today = now.day();
        if days.contains(&today) {
            return true;
        }

        let target = match days.iter().find(|&&d| d > today) {
            Some(&d) => now.date().with_day(d),
            None => first_of_next_month(now.date()),
        };
        self.jump_to(cur, target);
        false
    }

    fn check_day(&self, cur: &mut NaiveDateTime) -> bool {
        let now = *cur;
        if self.by_day.is_empty() || self.by_day.iter().any(|(_, day)| *day == now.weekday()) {
            return true;
        }

        let skip = self
            .by_day
            .iter()
            .map(|(_, day)| days_between(now.weekday(), *day))
            .min()
            .unwrap_or(1);
        self.jump_to(cur, now.date().checked_add_signed(Duration::days(skip)));
        false
    }

    fn check_hour(&self, cur: &mut NaiveDateTime) -> bool {
        let now = *cur;
        let hour = now.hour() as u8;
        if self.by_hour.is_empty() || self.by_hour.contains(&hour) {
            return true;
        }

        *cur = match self.by_hour.iter().find(|&&h| h > hour) {
            Some(&h) => now.date().and_hms_opt(u32::from(h), now.minute(), now.second()),
            None => now.date().succ_opt().and_then(|d| {
                d.and_hms_opt(u32::from(self.by_hour[0]), now.minute(), now.second())
            }),
        }
        .unwrap_or(NaiveDateTime::MAX);
        false
    }

    fn expand_times(&self, dates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        self.expand_seconds(self.expand_minutes(self.expand_hours(dates)))
    }

    fn expand_hours(&self, dates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.by_hour.is_empty() {
            return dates;
        }
        dates
            .iter()
            .flat_map(|d| self.by_hour.iter().filter_map(move |&h| d.with_hour(u32::from(h))))
            .collect()
    }

    fn expand_minutes(&self, dates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.by_minute.is_empty() {
            return dates;
        }
        dates
            .iter()
            .flat_map(|d| self.by_minute.iter().filter_map(move |&m| d.with_minute(u32::from(m))))
            .collect()
    }

    fn expand_seconds(&self, dates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.by_second.is_empty() {
            return dates;
        }
        dates
            .iter()
            .flat_map(|d| self.by_second.iter().filter_map(move |&s| d.with_second(u32::from(s))))
            .collect()
    }

    fn expand_weekly_days(&self, dates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.by_day.is_empty() {
            return dates;
        }
        dates
            .iter()
            .flat_map(|&d| {
                let start = get_start_of_week(self.week_start, d);
                self.by_day.iter().filter_map(move |(_, day)| {
                    start.checked_add_signed(Duration::days(days_between(start.weekday(), *day)))
                })
            })
            .collect()
    }

    /// Month days past the end of a month land on its last day, once.
    fn expand_month_days(&self, dates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.by_month_day.is_empty() {
            return dates;
        }

        let mut expanded = Vec::new();
        for d in dates {
            let last = days_in_month(d.year(), d.month());
            let mut seen_last = false;

            for &day in &self.by_month_day {
                let target = if day > 0 {
                    let day = day as u32;
                    if day < last {
                        day
                    } else if seen_last {
                        continue;
                    } else {
                        seen_last = true;
                        last
                    }
                } else {
                    let target = last as i32 + 1 + i32::from(day);
                    if target < 1 {
                        continue;
                    }
                    if day == -1 {
                        if seen_last {
                            continue;
                        }
                        seen_last = true;
                    }
                    target as u32
                };

                if let Some(date) = d.with_day(target) {
                    expanded.push(date);
                }
            }
        }
        expanded
    }

    /// BYMONTH for yearly rules. When a day part follows, the day is
    /// replaced later, so start from the 1st to keep short months.
    fn expand_months(&self, dates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.by_month.is_empty() {
            return dates;
        }

        let replaces_day = !self.by_month_day.is_empty() || !self.by_day.is_empty();
        dates
            .iter()
            .flat_map(|d| {
                let day = if replaces_day { 1 } else { d.day() };
                self.by_month.iter().filter_map(move |&m| {
                    NaiveDate::from_ymd_opt(d.year(), u32::from(m), day).map(|date| date.and_time(d.time()))
                })
            })
            .collect()
    }

    fn expand_year_days(&self, dates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.by_year_day.is_empty() {
            return dates;
        }

        dates
            .iter()
            .unique_by(|d| d.year())
            .flat_map(|d| {
                let year = d.year();
                resolve_ordinals(&self.by_year_day, get_days_in_year(year))
                    .into_iter()
                    .filter_map(move |n| NaiveDate::from_yo_opt(year, n).map(|date| date.and_time(d.time())))
            })
            .filter(|d| self.by_month.is_empty() || self.by_month.contains(&(d.month() as u16)))
            .collect()
    }

    /// BYDAY for monthly and yearly rules. Alongside BYMONTHDAY or
    /// BYYEARDAY it only keeps the candidates falling on a listed day.
    fn expand_days_in_period(&self, dates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.by_day.is_empty() {
            return dates;
        }

        let limit = !self.by_month_day.is_empty() || !self.by_year_day.is_empty();
        let mut expanded = Vec::new();

        for d in dates {
            let (start, end) = match self.period_of(d.date()) {
                Some(period) => period,
                None => continue,
            };

            for &(num, day) in &self.by_day {
                for date in get_weekdays_in_period(start, end, day, num) {
                    if !limit || date == d.date() {
                        expanded.push(date.and_time(d.time()));
                    }
                }
            }
        }
        expanded
    }

    /// The month (monthly rules, or yearly rules with BYMONTH) or year that
    /// numbered BYDAY values count within.
    fn period_of(&self, date: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
        if self.frequency == Frequency::Monthly || !self.by_month.is_empty() {
            let start = date.with_day(1)?;
            Some((start, first_of_next_month(start)?))
        } else {
            Some((
                NaiveDate::from_ymd_opt(date.year(), 1, 1)?,
                NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?,
            ))
        }
    }

    fn apply_set_pos(&self, candidates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.by_set_pos.is_empty() {
            return candidates;
        }

        let len = candidates.len() as i64;
        let positions: BTreeSet<usize> = self
            .by_set_pos
            .iter()
            .filter_map(|&pos| {
                let pos = i64::from(pos);
                let idx = if pos > 0 { pos - 1 } else { len + pos };
                if (0..len).contains(&idx) {
                    Some(idx as usize)
                } else {
                    None
                }
            })
            .collect();

        positions
            .into_iter()
            .filter_map(|i| candidates.get(i).copied())
            .collect()
    }
}

fn advance(date: NaiveDateTime, by: Duration) -> NaiveDateTime {
    date.checked_add_signed(by).unwrap_or(NaiveDateTime::MAX)
}

/// Adds whole months, using `day` (clamped to the month's length) as the
/// day of the result.
fn add_months(date: NaiveDateTime, months: i64, day: u32) -> NaiveDateTime {
    let total = i64::from(date.year()) * 12 + i64::from(date.month0()) + months;
    let month = total.rem_euclid(12) as u32 + 1;

    i32::try_from(total.div_euclid(12))
        .ok()
        .and_then(|year| NaiveDate::from_ymd_opt(year, month, day.min(days_in_month(year, month))))
        .map(|d| d.and_time(date.time()))
        .unwrap_or(NaiveDateTime::MAX)
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn days_between(from: Weekday, to: Weekday) -> i64 {
    (7 + i64::from(to.num_days_from_monday()) - i64::from(from.num_days_from_monday())) % 7
}

/// Positive values count from the start of a period of `len` units,
/// negative ones from its end. Values that fall outside are dropped.
fn resolve_ordinals<T>(values: &[T], len: u32) -> Vec<u32>
where
    T: Copy + Into<i32>,
{
    let len = len as i32;
    values
        .iter()
        .filter_map(|&v| {
            let v: i32 = v.into();
            let n = if v > 0 { v } else { len + 1 + v };
            if (1..=len).contains(&n) {
                Some(n as u32)
            } else {
                None
            }
        })
        .sorted()
        .dedup()
        .collect()
}

fn get_days_in_year(year: i32) -> u32 {
    if NaiveDate::from_yo_opt(year, 366).is_some() {
        366
    } else {
        365
    }
}

/// Dates in `[start, end)` falling on `day`; with `num`, only the
/// `num`th of them (counting from the end when negative).
fn get_weekdays_in_period(
    start: NaiveDate,
    end: NaiveDate,
    day: Weekday,
    num: Option<i8>,
) -> Vec<NaiveDate> {
    let mut potential_dates = Vec::with_capacity(5);

    let mut date = start.checked_add_signed(Duration::days(days_between(start.weekday(), day)));
    while let Some(d) = date.filter(|d| *d < end) {
        potential_dates.push(d);
        date = d.checked_add_signed(Duration::weeks(1));
    }

    match num {
        Some(num) if num > 0 => potential_dates.get(num as usize - 1).copied().into_iter().collect(),
        Some(num) => potential_dates
            .len()
            .checked_sub(i32::from(num).unsigned_abs() as usize)
            .and_then(|i| potential_dates.get(i).copied())
            .into_iter()
            .collect(),
        None => potential_dates,
    }
}

/// The start of the week containing `date`, at the same time of day.
fn get_start_of_week(week_start: Weekday, date: NaiveDateTime) -> NaiveDateTime {
    let difference = days_between(week_start, date.weekday());
    date.checked_sub_signed(Duration::days(difference)).unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datetime::millis_to_naive,
        well_known::{StaticWellKnownZones, WellKnownTimeZones},
    };

    fn utc_text(millis: i64) -> String {
        millis_to_naive(millis)
            .unwrap()
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string()
    }

    fn utc(s: &str) -> i64 {
        ParsedDateTime::parse_utc(s).unwrap().utc_millis()
    }

    macro_rules! add_rrule_test {
        ($name:ident, $date:expr; test $string:expr => $test:expr) => {
            #[test]
            fn $name() {
                let dtstart = ParsedDateTime::parse_in($date, DateTimeZone::Utc).unwrap();
                let rule = RecurRule::from_str($string).unwrap();

                $test(rule, dtstart)
            }
        };

        ($name:ident, $date:expr; display $string:expr => $expected:expr) => {
            add_rrule_test!($name, $date; test $string => |rule: RecurRule, _| {
                assert_eq!(rule.to_string(), $expected);
            });
        };

        ($name:ident, $date:expr; finite $string:expr => $expected:expr) => {
            add_rrule_test!($name, $date; test $string => |rule: RecurRule, dtstart: ParsedDateTime| {
                let dates: Vec<_> = rule
                    .expand(&dtstart, dtstart.utc_millis(), MAX_DATE_MILLIS, &ExpansionLimits::default())
                    .into_iter()
                    .map(utc_text)
                    .collect();

                let str_dates: Vec<_> = dates.iter().map(|s| s as &str).collect();

                assert_eq!(&str_dates, $expected);
            });
        };

        ($name:ident, $date:expr; infinite $string:expr => $expected:expr) => {
            add_rrule_test!($name, $date; test $string => |rule: RecurRule, dtstart: ParsedDateTime| {
                let dates: Vec<_> = rule
                    .expand(&dtstart, dtstart.utc_millis(), MAX_DATE_MILLIS, &ExpansionLimits::default())
                    .into_iter()
                    .take($expected.len())
                    .map(utc_text)
                    .collect();

                let str_dates: Vec<_> = dates.iter().map(|s| s as &str).collect();

                assert_eq!(&str_dates, $expected);
            });
        };
    }

    add_rrule_test!(display_normalizes, "20200101T000000";
        display "freq=weekly; byday=FR,MO ;wkst=SU;x-foo=bar" => "FREQ=WEEKLY;BYDAY=MO,FR;WKST=SU;X-FOO=bar");

    add_rrule_test!(display_skips_out_of_range, "20200101T000000";
        display "FREQ=MONTHLY;BYMONTHDAY=0,15,32,-31;BYHOUR=24,9" => "FREQ=MONTHLY;BYHOUR=9;BYMONTHDAY=-31,15");

    add_rrule_test!(display_part_order, "20200101T000000";
        display "BYSETPOS=-1;INTERVAL=2;BYDAY=-1SU,1SU;UNTIL=20200101T000000Z;FREQ=MONTHLY"
            => "FREQ=MONTHLY;UNTIL=20200101T000000Z;INTERVAL=2;BYDAY=-1SU,1SU;BYSETPOS=-1");

    add_rrule_test!(skips_unknown_parts, "20200101T000000";
        display "FREQ=DAILY;FOO=1;COUNT" => "FREQ=DAILY");

    #[test]
    fn malformed_rules_are_parse_errors() {
        for text in &[
            "FREQ=DAILY;COUNT=x",
            "BYDAY=MO",
            "FREQ=FORTNIGHTLY",
            "FREQ=DAILY;BYDAY=XX",
            "FREQ=DAILY;BYMONTH=one",
            "FREQ=DAILY;UNTIL=2020",
        ] {
            assert!(
                matches!(RecurRule::from_str(text), Err(CalendarError::Parse { .. })),
                "{}",
                text
            );
        }
    }

    #[test_log::test]
    fn set_positions_outside_a_year_are_dropped() {
        let rule = RecurRule::from_str("FREQ=MONTHLY;BYDAY=MO;BYSETPOS=400,-367,0,2,-1").unwrap();
        assert_eq!(rule.by_set_pos, vec![-1, 2]);

        let rule = RecurRule::from_str("FREQ=MONTHLY;BYDAY=MO;BYSETPOS=400").unwrap();
        assert!(rule.by_set_pos.is_empty());
    }

    add_rrule_test!(daily_count, "19970902T090000";
        finite "FREQ=DAILY;COUNT=5" => &[
            "1997-09-02T09:00:00",
            "1997-09-03T09:00:00",
            "1997-09-04T09:00:00",
            "1997-09-05T09:00:00",
            "1997-09-06T09:00:00",
        ]);

    add_rrule_test!(weekly_count_includes_dtstart, "20200106T100000";
        finite "FREQ=WEEKLY;BYDAY=MO;COUNT=3" => &[
            "2020-01-06T10:00:00",
            "2020-01-13T10:00:00",
            "2020-01-20T10:00:00",
        ]);

    add_rrule_test!(dtstart_off_rule_is_first_instance, "20200106T100000";
        finite "FREQ=WEEKLY;BYDAY=TU;COUNT=2" => &[
            "2020-01-06T10:00:00",
            "2020-01-07T10:00:00",
        ]);

    add_rrule_test!(weekly_until_with_wkst, "19970902T090000";
        finite "FREQ=WEEKLY;UNTIL=19971007T000000Z;WKST=SU;BYDAY=TU,TH" => &[
            "1997-09-02T09:00:00",
            "1997-09-04T09:00:00",
            "1997-09-09T09:00:00",
            "1997-09-11T09:00:00",
            "1997-09-16T09:00:00",
            "1997-09-18T09:00:00",
            "1997-09-23T09:00:00",
            "1997-09-25T09:00:00",
            "1997-09-30T09:00:00",
            "1997-10-02T09:00:00",
        ]);

    add_rrule_test!(hourly_interval_until, "19970902T090000";
        finite "FREQ=HOURLY;INTERVAL=3;UNTIL=19970902T170000Z" => &[
            "1997-09-02T09:00:00",
            "1997-09-02T12:00:00",
            "1997-09-02T15:00:00",
        ]);

    add_rrule_test!(monthly_first_friday, "19970905T090000";
        finite "FREQ=MONTHLY;COUNT=6;BYDAY=1FR" => &[
            "1997-09-05T09:00:00",
            "1997-10-03T09:00:00",
            "1997-11-07T09:00:00",
            "1997-12-05T09:00:00",
            "1998-01-02T09:00:00",
            "1998-02-06T09:00:00",
        ]);

    add_rrule_test!(monthly_first_and_last_sunday, "19970907T090000";
        finite "FREQ=MONTHLY;INTERVAL=2;COUNT=4;BYDAY=1SU,-1SU" => &[
            "1997-09-07T09:00:00",
            "1997-09-28T09:00:00",
            "1997-11-02T09:00:00",
            "1997-11-30T09:00:00",
        ]);

    add_rrule_test!(monthly_month_days, "19970902T090000";
        finite "FREQ=MONTHLY;COUNT=4;BYMONTHDAY=2,15" => &[
            "1997-09-02T09:00:00",
            "1997-09-15T09:00:00",
            "1997-10-02T09:00:00",
            "1997-10-15T09:00:00",
        ]);

    add_rrule_test!(monthly_last_day, "20200131T090000";
        finite "FREQ=MONTHLY;BYMONTHDAY=-1;COUNT=4" => &[
            "2020-01-31T09:00:00",
            "2020-02-29T09:00:00",
            "2020-03-31T09:00:00",
            "2020-04-30T09:00:00",
        ]);

    add_rrule_test!(monthly_clamps_to_month_end, "20210131T090000";
        finite "FREQ=MONTHLY;COUNT=3" => &[
            "2021-01-31T09:00:00",
            "2021-02-28T09:00:00",
            "2021-03-31T09:00:00",
        ]);

    add_rrule_test!(last_workday_of_month, "19970930T090000";
        finite "FREQ=MONTHLY;BYDAY=MO,TU,WE,TH,FR;BYSETPOS=-1;COUNT=3" => &[
            "1997-09-30T09:00:00",
            "1997-10-31T09:00:00",
            "1997-11-28T09:00:00",
        ]);

    add_rrule_test!(friday_the_thirteenth, "19980213T090000";
        finite "FREQ=MONTHLY;BYDAY=FR;BYMONTHDAY=13;COUNT=4" => &[
            "1998-02-13T09:00:00",
            "1998-03-13T09:00:00",
            "1998-11-13T09:00:00",
            "1999-08-13T09:00:00",
        ]);

    add_rrule_test!(yearly_second_sunday_of_march, "20070311T020000";
        infinite "FREQ=YEARLY;BYMONTH=3;BYDAY=2SU" => &[
            "2007-03-11T02:00:00",
            "2008-03-09T02:00:00",
            "2009-03-08T02:00:00",
        ]);

    add_rrule_test!(yearly_year_days, "19970101T090000";
        finite "FREQ=YEARLY;BYYEARDAY=1,100,200;COUNT=4" => &[
            "1997-01-01T09:00:00",
            "1997-04-10T09:00:00",
            "1997-07-19T09:00:00",
            "1998-01-01T09:00:00",
        ]);

    add_rrule_test!(yearly_leap_day, "20200229T120000";
        finite "FREQ=YEARLY;COUNT=3" => &[
            "2020-02-29T12:00:00",
            "2024-02-29T12:00:00",
            "2028-02-29T12:00:00",
        ]);

    add_rrule_test!(sub_hourly_is_only_dtstart, "20200101T000000";
        infinite "FREQ=MINUTELY;INTERVAL=15" => &["2020-01-01T00:00:00"]);

    #[test]
    fn daily_in_january_only() {
        let dtstart = ParsedDateTime::parse_in("19980101T090000", DateTimeZone::Utc).unwrap();
        let rule = RecurRule::from_str("FREQ=DAILY;UNTIL=20000131T140000Z;BYMONTH=1").unwrap();
        let limits = ExpansionLimits {
            max_days: 0,
            ..ExpansionLimits::default()
        };

        let dates = rule.expand(&dtstart, dtstart.utc_millis(), MAX_DATE_MILLIS, &limits);

        assert_eq!(dates.len(), 93);
        assert_eq!(utc_text(dates[31]), "1999-01-01T09:00:00");
        assert_eq!(utc_text(dates[92]), "2000-01-31T09:00:00");

        // The default horizon of 730 days ends at 2000-01-01T09:00:00.
        let dates = rule.expand(&dtstart, dtstart.utc_millis(), MAX_DATE_MILLIS, &ExpansionLimits::default());
        assert_eq!(dates.len(), 63);
    }

    #[test]
    fn range_is_half_open() {
        let dtstart = ParsedDateTime::parse_in("20200101T090000", DateTimeZone::Utc).unwrap();
        let rule = RecurRule::from_str("FREQ=DAILY").unwrap();

        let dates = rule.expand(
            &dtstart,
            utc("20200110T000000Z"),
            utc("20200113T090000Z"),
            &ExpansionLimits::default(),
        );

        let dates: Vec<_> = dates.into_iter().map(utc_text).collect();
        assert_eq!(
            dates,
            vec!["2020-01-10T09:00:00", "2020-01-11T09:00:00", "2020-01-12T09:00:00"]
        );
    }

    #[test]
    fn max_instances_caps_count() {
        let dtstart = ParsedDateTime::parse_in("20200101T090000", DateTimeZone::Utc).unwrap();
        let rule = RecurRule::from_str("FREQ=DAILY;COUNT=10").unwrap();
        let limits = ExpansionLimits {
            max_instances: 4,
            ..ExpansionLimits::default()
        };

        assert_eq!(rule.expand(&dtstart, 0, MAX_DATE_MILLIS, &limits).len(), 4);
    }

    #[test]
    fn wall_clock_is_kept_across_dst() {
        let table = StaticWellKnownZones::new();
        let ny = DateTimeZone::from_zone(table.get("America/New_York").unwrap());
        let dtstart = ParsedDateTime::parse_in("20200307T090000", ny).unwrap();
        let rule = RecurRule::from_str("FREQ=DAILY;COUNT=3").unwrap();

        let dates: Vec<_> = rule
            .expand(&dtstart, 0, MAX_DATE_MILLIS, &ExpansionLimits::default())
            .into_iter()
            .map(utc_text)
            .collect();

        assert_eq!(
            dates,
            vec!["2020-03-07T14:00:00", "2020-03-08T13:00:00", "2020-03-09T13:00:00"]
        );
    }

    #[test]
    fn date_only_until_covers_the_day() {
        let table = StaticWellKnownZones::new();
        let ny = DateTimeZone::from_zone(table.get("America/New_York").unwrap());
        let dtstart = ParsedDateTime::parse_in("20200101T220000", ny).unwrap();
        let rule = RecurRule::from_str("FREQ=DAILY;UNTIL=20200103").unwrap();

        assert_eq!(
            rule.expand(&dtstart, 0, MAX_DATE_MILLIS, &ExpansionLimits::default()).len(),
            3
        );
    }

    #[test]
    fn hard_end_per_frequency() {
        let dtstart = ParsedDateTime::parse_in("20200101T000000", DateTimeZone::Utc).unwrap();
        let limits = ExpansionLimits::default();

        let weekly = RecurRule::from_str("FREQ=WEEKLY").unwrap();
        assert_eq!(
            weekly.estimated_end(&dtstart, &limits),
            dtstart.utc_millis() + 520 * crate::duration::MILLIS_PER_WEEK
        );

        let until = RecurRule::from_str("FREQ=YEARLY;UNTIL=20210101T000000Z").unwrap();
        assert_eq!(until.estimated_end(&dtstart, &limits), utc("20210101T000000Z"));

        let unlimited = ExpansionLimits {
            max_months: 0,
            ..limits
        };
        let monthly = RecurRule::from_str("FREQ=MONTHLY").unwrap();
        assert_eq!(monthly.estimated_end(&dtstart, &unlimited), MAX_DATE_MILLIS);
    }

    #[test_log::test]
    fn inconsistent_rule_degrades_to_empty() {
        let dtstart = ParsedDateTime::parse_in("20200101T090000", DateTimeZone::Utc).unwrap();
        let rule = RecurRule::from_str("FREQ=WEEKLY;BYMONTHDAY=5").unwrap();

        assert!(rule
            .expand(&dtstart, 0, MAX_DATE_MILLIS, &ExpansionLimits::default())
            .is_empty());
    }

    #[test_log::test]
    fn rule_without_matches_gives_up() {
        let dtstart = ParsedDateTime::parse_in("20200106T090000", DateTimeZone::Utc).unwrap();
        let rule = RecurRule::from_str("FREQ=MONTHLY;BYDAY=6MO").unwrap();
        let limits = ExpansionLimits {
            max_months: 0,
            ..ExpansionLimits::default()
        };

        let dates = rule.expand(&dtstart, 0, MAX_DATE_MILLIS, &limits);
        assert_eq!(dates, vec![dtstart.utc_millis()]);
    }
}
