//! Conversion to and from the numeric rule structure Windows clients use
//! (`TIME_ZONE_INFORMATION`).
//!
//! Only rules that exist in both worlds convert: yearly "Nth weekday of
//! month" onsets, or no daylight time at all. Anything else is rejected
//! instead of being approximated.

use anyhow::Error;
use chrono::{Timelike, Weekday};

use crate::{
    duration::MILLIS_PER_MINUTE,
    error::{CalendarError, Result},
    parser::Component,
    timezone::{onset_time, ICalTimeZone, Observance, OnsetDay, SimpleOnset},
};

/// A `SYSTEMTIME` used as a transition rule.
///
/// With `year == 0` the date is relative: `day` is the week of the month
/// (1 to 5, where 5 means the last) and `day_of_week` counts from Sunday
/// = 0. A zero `month` means "no transition".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowsSystemTime {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub millis: u16,
}

/// Biases are in minutes, with UTC = local time + bias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowsTimeZone {
    pub bias: i32,
    pub standard_bias: i32,
    pub standard_date: WindowsSystemTime,
    pub daylight_bias: i32,
    pub daylight_date: WindowsSystemTime,
}

fn weekday_from_sunday(n: u16) -> Option<Weekday> {
    Some(match n {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        6 => Weekday::Sat,
        _ => return None,
    })
}

fn not_representable(msg: String) -> CalendarError {
    CalendarError::NotRepresentable(msg)
}

impl WindowsSystemTime {
    fn to_onset(&self) -> Result<SimpleOnset> {
        if self.year != 0 {
            return Err(not_representable(format!(
                "transition on an absolute date in {}",
                self.year
            )));
        }

        let weekday = weekday_from_sunday(self.day_of_week).ok_or_else(|| {
            CalendarError::parse("day of week", &self.day_of_week.to_string(), "must be 0..6")
        })?;
        let week = match self.day {
            1..=4 => self.day as i8,
            5 => -1,
            d => return Err(CalendarError::parse("week of month", &d.to_string(), "must be 1..5")),
        };
        let time = onset_time(self.hour as u32, self.minute as u32, self.second as u32)?;

        SimpleOnset::nth(self.month as u32, week, weekday, time)
    }

    fn from_onset(onset: &SimpleOnset) -> Result<WindowsSystemTime> {
        let (week, weekday) = match onset.rule {
            OnsetDay::Nth { week, weekday } => (week, weekday),
            // The first weekday on or after the 1st, 8th, 15th or 22nd is
            // just an Nth weekday.
            OnsetDay::OnOrAfter { weekday, day } if day % 7 == 1 && day <= 22 => {
                ((day / 7 + 1) as i8, weekday)
            }
            OnsetDay::OnOrAfter { .. } | OnsetDay::DayOfMonth(_) => {
                return Err(not_representable(format!(
                    "day-of-month onset rule {}",
                    onset.to_rrule()
                )))
            }
        };

        Ok(WindowsSystemTime {
            year: 0,
            month: onset.month as u16,
            day_of_week: weekday.num_days_from_sunday() as u16,
            day: if week == -1 { 5 } else { week as u16 },
            hour: onset.time.hour() as u16,
            minute: onset.time.minute() as u16,
            second: onset.time.second() as u16,
            millis: 0,
        })
    }
}

fn whole_minutes(millis: i32) -> Result<i32> {
    if millis as i64 % MILLIS_PER_MINUTE != 0 {
        return Err(not_representable(format!("offset of {} ms is not whole minutes", millis)));
    }
    Ok((millis as i64 / MILLIS_PER_MINUTE) as i32)
}

impl WindowsTimeZone {
    /// Build an iCalendar zone with the given id.
    pub fn from_windows(&self, id: &str) -> Result<ICalTimeZone> {
        let standard_offset = -(self.bias + self.standard_bias) * MILLIS_PER_MINUTE as i32;

        if self.standard_date.month == 0 || self.daylight_date.month == 0 {
            return Ok(ICalTimeZone::fixed(id, standard_offset));
        }

        let daylight_offset = -(self.bias + self.daylight_bias) * MILLIS_PER_MINUTE as i32;
        Ok(ICalTimeZone::new(
            id,
            standard_offset,
            Some(self.standard_date.to_onset()?),
            daylight_offset,
            Some(self.daylight_date.to_onset()?),
        ))
    }

    pub fn to_windows(tz: &ICalTimeZone) -> Result<WindowsTimeZone> {
        let standard = whole_minutes(tz.standard_offset())?;

        let (std_onset, dst_onset) = match (tz.standard_onset(), tz.daylight_onset()) {
            (Some(std), Some(dst)) if tz.has_daylight() => (std, dst),
            _ => {
                return Ok(WindowsTimeZone {
                    bias: -standard,
                    ..WindowsTimeZone::default()
                })
            }
        };

        let daylight = whole_minutes(tz.daylight_offset())?;
        Ok(WindowsTimeZone {
            bias: -standard,
            standard_bias: 0,
            standard_date: WindowsSystemTime::from_onset(std_onset)?,
            daylight_bias: standard - daylight,
            daylight_date: WindowsSystemTime::from_onset(dst_onset)?,
        })
    }

    /// Convert a VTIMEZONE body. Bodies with more than one observance per
    /// direction, or with daylight time that has no yearly rule, are
    /// rejected.
    pub fn from_vtimezone(component: &Component) -> std::result::Result<WindowsTimeZone, Error> {
        let standard = Observance::all(component, "STANDARD")?;
        let daylight = Observance::all(component, "DAYLIGHT")?;

        if standard.len() > 1 || daylight.len() > 1 {
            return Err(not_representable(format!(
                "{} STANDARD and {} DAYLIGHT observances",
                standard.len(),
                daylight.len()
            ))
            .into());
        }

        let tz = ICalTimeZone::from_component(component)?;
        if let (Some(std), Some(dst)) = (standard.first(), daylight.first()) {
            if std.offset_to != dst.offset_to && !tz.has_daylight() {
                return Err(not_representable(format!(
                    "daylight time in {} without a usable yearly rule",
                    tz.id()
                ))
                .into());
            }
        }

        Ok(WindowsTimeZone::to_windows(&tz)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::well_known::{StaticWellKnownZones, WellKnownTimeZones};

    fn eastern() -> WindowsTimeZone {
        WindowsTimeZone {
            bias: 300,
            standard_bias: 0,
            standard_date: WindowsSystemTime {
                month: 11,
                day_of_week: 0,
                day: 1,
                hour: 2,
                ..WindowsSystemTime::default()
            },
            daylight_bias: -60,
            daylight_date: WindowsSystemTime {
                month: 3,
                day_of_week: 0,
                day: 2,
                hour: 2,
                ..WindowsSystemTime::default()
            },
        }
    }

    #[test]
    fn round_trip_through_windows() {
        let table = StaticWellKnownZones::new();
        let ny = table.get("America/New_York").unwrap();

        let win = WindowsTimeZone::to_windows(&ny).unwrap();
        assert_eq!(win, eastern());
        assert_eq!(&win.from_windows("America/New_York").unwrap(), ny.as_ref());

        let london = table.get("Europe/London").unwrap();
        let win = WindowsTimeZone::to_windows(&london).unwrap();
        assert_eq!(win.standard_date.day, 5);
        assert_eq!(&win.from_windows("Europe/London").unwrap(), london.as_ref());
    }

    #[test]
    fn no_daylight() {
        let table = StaticWellKnownZones::new();
        let kolkata = table.get("Asia/Kolkata").unwrap();

        let win = WindowsTimeZone::to_windows(&kolkata).unwrap();
        assert_eq!(win.bias, -330);
        assert_eq!(win.standard_date.month, 0);

        let back = win.from_windows("Asia/Kolkata").unwrap();
        assert_eq!(back.standard_offset(), 330 * 60_000);
        assert!(!back.has_daylight());
    }

    #[test]
    fn rejects_what_windows_cannot_say() {
        let t = onset_time(2, 0, 0).unwrap();
        let by_day = ICalTimeZone::new(
            "Fixed days",
            3_600_000,
            Some(SimpleOnset::day_of_month(10, 1, t).unwrap()),
            7_200_000,
            Some(SimpleOnset::day_of_month(3, 21, t).unwrap()),
        );
        assert!(matches!(
            WindowsTimeZone::to_windows(&by_day),
            Err(CalendarError::NotRepresentable(_))
        ));

        let mut absolute = eastern();
        absolute.daylight_date.year = 2007;
        assert!(matches!(
            absolute.from_windows("x"),
            Err(CalendarError::NotRepresentable(_))
        ));
    }

    #[test]
    fn rejects_several_onset_pairs() {
        let input = "BEGIN:VTIMEZONE\r\n\
                     TZID:Two rules\r\n\
                     BEGIN:DAYLIGHT\r\n\
                     TZOFFSETFROM:-0500\r\n\
                     TZOFFSETTO:-0400\r\n\
                     DTSTART:19870405T020000\r\n\
                     RRULE:FREQ=YEARLY;BYMONTH=4;BYDAY=1SU\r\n\
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

        let err = WindowsTimeZone::from_vtimezone(&component).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CalendarError>(),
            Some(CalendarError::NotRepresentable(_))
        ));

        let single = ICalTimeZone::from_component(&component).unwrap().to_component();
        assert_eq!(WindowsTimeZone::from_vtimezone(&single).unwrap(), eastern());
    }
}
