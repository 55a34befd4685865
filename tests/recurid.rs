use std::convert::TryFrom;

use anyhow::Error;
use ical_core::{
    components::VCalendar, config::ExpansionLimits, datetime::ParsedDateTime,
    freebusy::FreeBusyStatus, parser,
};

fn utc(text: &str) -> i64 {
    ParsedDateTime::parse_utc(text).unwrap().utc_millis()
}

#[test]
fn test_recur_id_different_tz() -> Result<(), Error> {
    let vcal_raw = r#"BEGIN:VCALENDAR
PRODID:-//Google Inc//Google Calendar 70.9054//EN
VERSION:2.0
BEGIN:VTIMEZONE
TZID:Europe/London
X-LIC-LOCATION:Europe/London
BEGIN:DAYLIGHT
TZOFFSETFROM:+0000
TZOFFSETTO:+0100
TZNAME:BST
DTSTART:19700329T010000
RRULE:FREQ=YEARLY;BYMONTH=3;BYDAY=-1SU
END:DAYLIGHT
BEGIN:STANDARD
TZOFFSETFROM:+0100
TZOFFSETTO:+0000
TZNAME:GMT
DTSTART:19701025T020000
RRULE:FREQ=YEARLY;BYMONTH=10;BYDAY=-1SU
END:STANDARD
END:VTIMEZONE
BEGIN:VEVENT
DTSTART;TZID=Europe/London:20220208T153000
DTEND;TZID=Europe/London:20220208T162000
RRULE:FREQ=WEEKLY;INTERVAL=2
DTSTAMP:20220712T145025Z
ORGANIZER;CN=Foo:mailto:foo@example.org
UID:26a0c5d5-50e8-4ae0-a2fd-80968f6db384
DESCRIPTION:
SEQUENCE:2
SUMMARY:Test
END:VEVENT
BEGIN:VEVENT
DTSTART;TZID=Europe/London:20220222T153000
DTEND;TZID=Europe/London:20220222T162000
DTSTAMP:20220712T145025Z
ORGANIZER;CN=Foo:mailto:foo@example.org
UID:26a0c5d5-50e8-4ae0-a2fd-80968f6db384
RECURRENCE-ID:20220222T153000Z
DESCRIPTION:
SEQUENCE:11
SUMMARY:Test Edit
END:VEVENT
END:VCALENDAR
"#;

    let components = parser::Component::from_str_to_stream(vcal_raw)?;
    let component = components.into_iter().next().unwrap();

    let vcalendar = VCalendar::try_from(component)?;

    let collection = vcalendar
        .events
        .get("26a0c5d5-50e8-4ae0-a2fd-80968f6db384")
        .unwrap();
    assert_eq!(collection.exceptions.len(), 1);

    let instances = collection.expand_instances(
        utc("20220201T000000Z"),
        utc("20220401T000000Z"),
        &ExpansionLimits::default(),
    );

    let mut summaries = Vec::new();
    for inst in instances.iter().take(3) {
        let vevent = vcalendar.invite(inst.invite).unwrap();
        summaries.push(vevent.summary.as_deref().unwrap());
    }

    assert_eq!(&summaries, &["Test", "Test Edit", "Test"]);

    // London moves to BST on 27 March.
    assert_eq!(instances[2].start, utc("20220308T153000Z"));
    assert_eq!(instances[3].start, utc("20220322T153000Z"));
    assert_eq!(instances.len(), 4);

    assert!(vcalendar.tzmap.contains("Europe/London"));

    Ok(())
}

#[test]
fn test_this_and_future_override() -> Result<(), Error> {
    let vcal_raw = r#"BEGIN:VCALENDAR
PRODID:-//Example Corp//Calendar//EN
VERSION:2.0
BEGIN:VEVENT
UID:series@example.org
DTSTART;TZID=America/New_York:20220103T090000
DTEND;TZID=America/New_York:20220103T093000
RRULE:FREQ=WEEKLY;BYDAY=MO;COUNT=6
SUMMARY:Sync
END:VEVENT
BEGIN:VEVENT
UID:series@example.org
RECURRENCE-ID;TZID=America/New_York;RANGE=THISANDFUTURE:20220124T090000
DTSTART;TZID=America/New_York:20220124T090000
DTEND;TZID=America/New_York:20220124T093000
STATUS:CANCELLED
END:VEVENT
BEGIN:VEVENT
UID:review@example.org
DTSTART:20220105T140000Z
DTEND:20220105T150000Z
X-MICROSOFT-CDO-INTENDEDSTATUS:OOF
SUMMARY:Offsite
END:VEVENT
END:VCALENDAR
"#;

    let component = parser::Component::from_str_to_stream(vcal_raw)?.remove(0);
    let vcalendar = VCalendar::try_from(component)?;

    let instances = vcalendar.expand_instances(
        utc("20220101T000000Z"),
        utc("20220301T000000Z"),
        &ExpansionLimits::default(),
    );
    let starts: Vec<i64> = instances.iter().map(|inst| inst.start).collect();
    assert_eq!(
        starts,
        vec![
            utc("20220103T140000Z"),
            utc("20220105T140000Z"),
            utc("20220110T140000Z"),
            utc("20220117T140000Z"),
        ]
    );

    let fb = vcalendar.free_busy(
        "user@example.org",
        utc("20220103T000000Z"),
        utc("20220106T000000Z"),
        &ExpansionLimits::default(),
    );
    let busy: Vec<_> = fb
        .intervals()
        .iter()
        .filter(|iv| iv.status != FreeBusyStatus::Free)
        .map(|iv| (iv.start, iv.end, iv.status.clone()))
        .collect();
    assert_eq!(
        busy,
        vec![
            (utc("20220103T140000Z"), utc("20220103T143000Z"), FreeBusyStatus::Busy),
            (utc("20220105T140000Z"), utc("20220105T150000Z"), FreeBusyStatus::Unavailable),
        ]
    );

    Ok(())
}
