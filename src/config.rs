use serde::{Deserialize, Serialize};

use crate::error::{CalendarError, Result};

/// Latest instant any expansion will produce (milliseconds since the epoch).
pub const MAX_DATE_MILLIS: i64 = 221_845_392_000_000;

/// Hard limits on recurrence expansion.
///
/// A limit of zero or less on the daily, weekly, monthly or yearly horizons
/// means the rule may be expanded up to [`MAX_DATE_MILLIS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionLimits {
    /// Maximum instances per rule, 0 for no limit.
    pub max_instances: i32,
    pub max_days: i32,
    pub max_weeks: i32,
    pub max_months: i32,
    pub max_years: i32,
    /// Horizon for HOURLY and finer rules, never less than one year.
    pub max_years_other_freqs: i32,
}

impl Default for ExpansionLimits {
    fn default() -> Self {
        ExpansionLimits {
            max_instances: 0,
            max_days: 730,
            max_weeks: 520,
            max_months: 360,
            max_years: 100,
            max_years_other_freqs: 1,
        }
    }
}

impl ExpansionLimits {
    /// Reads limits from a JSON document. Fields that are absent keep their
    /// default values.
    pub fn from_json(s: &str) -> Result<ExpansionLimits> {
        serde_json::from_str(s)
            .map_err(|e| CalendarError::parse("expansion limits", s, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_override() {
        let limits = ExpansionLimits::from_json(r#"{"max_instances": 50, "max_days": 10}"#).unwrap();

        assert_eq!(limits.max_instances, 50);
        assert_eq!(limits.max_days, 10);
        assert_eq!(limits.max_weeks, 520);
        assert_eq!(limits.max_years_other_freqs, 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ExpansionLimits::from_json("max_days=3").is_err());
    }
}
