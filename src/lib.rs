//! Calendaring core: recurrence expansion, timezone rules and free/busy
//! computation over a parsed iCalendar tree.

pub mod components;
pub mod config;
pub mod datetime;
pub mod duration;
pub mod error;
pub mod freebusy;
pub mod metadata;
pub mod parser;
pub mod recur;
pub mod recurrence;
pub mod timezone;
pub mod tzmap;
pub mod tzpolicy;
pub mod unescape;
pub mod well_known;
pub mod windows;

pub use error::{CalendarError, Result};
