use std::{
    env,
    io::{stdin, Read},
    sync::Arc,
};

use anyhow::{bail, Context, Error};
use chrono::DateTime;
use ical_core::{
    components::VCalendar, config::ExpansionLimits, datetime::{DateTimeZone, ParsedDateTime},
    parser,
    well_known::StaticWellKnownZones,
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: expand START END [OWNER]

START and END are RFC3339 or YYYYMMDDTHHMMSSZ. The calendar is read from
stdin. Expansion limits can be overridden with a JSON file named by
ICAL_CORE_LIMITS.";

fn parse_instant(arg: &str) -> Result<i64, Error> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(arg) {
        return Ok(dt.timestamp_millis());
    }
    Ok(ParsedDateTime::parse_utc(arg)
        .with_context(|| format!("parsing time {}", arg))?
        .utc_millis())
}

fn load_limits() -> Result<ExpansionLimits, Error> {
    match env::var_os("ICAL_CORE_LIMITS") {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.to_string_lossy()))?;
            Ok(ExpansionLimits::from_json(&text)?)
        }
        None => Ok(ExpansionLimits::default()),
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 2 || args.len() > 3 {
        bail!("{}", USAGE);
    }
    let start = parse_instant(&args[0])?;
    let end = parse_instant(&args[1])?;
    let owner = args.get(2).map(String::as_str);
    let limits = load_limits()?;

    let mut data = String::new();
    stdin().read_to_string(&mut data)?;

    let well_known = Arc::new(StaticWellKnownZones::new());
    for comp in parser::Component::from_str_to_stream(&data)? {
        let calendar = VCalendar::from_component(&comp, well_known.clone(), owner, true)?;

        println!("Found {} events", calendar.events.len());
        for inst in calendar.expand_instances(start, end, &limits) {
            let summary = calendar
                .invite(inst.invite)
                .and_then(|invite| invite.summary.as_deref())
                .unwrap_or("");
            println!(
                "{} {}{} {}",
                ParsedDateTime::from_utc_millis(inst.start, DateTimeZone::Utc)?,
                ParsedDateTime::from_utc_millis(inst.end, DateTimeZone::Utc)?,
                if inst.is_exception { " *" } else { "" },
                summary
            );
        }

        let fb = calendar.free_busy(owner.unwrap_or(""), start, end, &limits);
        print!("{}", fb);
    }

    Ok(())
}
