use thiserror::Error;

/// Errors surfaced by the calendar core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalendarError {
    /// Malformed date, duration, offset or recurrence text.
    #[error("invalid {what} '{value}': {reason}")]
    Parse {
        what: &'static str,
        value: String,
        reason: String,
    },

    /// A rule that parses but can never be expanded, e.g. a recurrence
    /// without DTSTART.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// An unknown TZID with no matching well-known zone.
    #[error("invalid time zone \"{0}\"")]
    TimezoneLookup(String),

    /// A timezone rule that can't be expressed in the target representation.
    #[error("not representable: {0}")]
    NotRepresentable(String),

    #[error("bad metadata: {0}")]
    Metadata(String),
}

impl CalendarError {
    pub(crate) fn parse(what: &'static str, value: &str, reason: impl ToString) -> Self {
        CalendarError::Parse {
            what,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CalendarError>;
