//! Compact key/value maps used to persist timezones and recurrence trees.
//!
//! Keys are short (one to six characters) and chosen per entity; values are
//! strings, integers, booleans, nested maps or lists. The JSON form is what
//! gets written to storage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CalendarError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Long(i64),
    Str(String),
    List(Vec<MetaValue>),
    Map(Metadata),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    map: BTreeMap<String, MetaValue>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    pub fn put_str(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.map.insert(key.to_string(), MetaValue::Str(value.into()));
        self
    }

    /// Puts the value if there is one, otherwise leaves the key unset.
    pub fn put_opt_str(&mut self, key: &str, value: Option<impl Into<String>>) -> &mut Self {
        if let Some(value) = value {
            self.put_str(key, value);
        }
        self
    }

    pub fn put_long(&mut self, key: &str, value: i64) -> &mut Self {
        self.map.insert(key.to_string(), MetaValue::Long(value));
        self
    }

    pub fn put_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.map.insert(key.to_string(), MetaValue::Bool(value));
        self
    }

    pub fn put_map(&mut self, key: &str, value: Metadata) -> &mut Self {
        self.map.insert(key.to_string(), MetaValue::Map(value));
        self
    }

    pub fn put_list(&mut self, key: &str, value: Vec<MetaValue>) -> &mut Self {
        self.map.insert(key.to_string(), MetaValue::List(value));
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|k| k.as_str())
    }

    pub fn get_opt_str(&self, key: &str) -> Option<&str> {
        match self.map.get(key) {
            Some(MetaValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.get_opt_str(key)
            .ok_or_else(|| CalendarError::Metadata(format!("missing string field '{}'", key)))
    }

    /// Integers are also accepted in their string form, as older encoders
    /// wrote every scalar as a string.
    pub fn get_opt_long(&self, key: &str) -> Result<Option<i64>> {
        match self.map.get(key) {
            None => Ok(None),
            Some(MetaValue::Long(v)) => Ok(Some(*v)),
            Some(MetaValue::Str(s)) => s.parse().map(Some).map_err(|_| {
                CalendarError::Metadata(format!("field '{}' is not an integer: {}", key, s))
            }),
            Some(other) => Err(CalendarError::Metadata(format!(
                "field '{}' is not an integer: {:?}",
                key, other
            ))),
        }
    }

    pub fn get_long(&self, key: &str) -> Result<i64> {
        self.get_opt_long(key)?
            .ok_or_else(|| CalendarError::Metadata(format!("missing integer field '{}'", key)))
    }

    pub fn get_long_or(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self.get_opt_long(key)?.unwrap_or(default))
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.map.get(key) {
            None => Ok(default),
            Some(MetaValue::Bool(b)) => Ok(*b),
            Some(MetaValue::Str(s)) => match s.as_str() {
                "1" | "true" | "TRUE" => Ok(true),
                "0" | "false" | "FALSE" => Ok(false),
                _ => Err(CalendarError::Metadata(format!(
                    "field '{}' is not a boolean: {}",
                    key, s
                ))),
            },
            Some(other) => Err(CalendarError::Metadata(format!(
                "field '{}' is not a boolean: {:?}",
                key, other
            ))),
        }
    }

    pub fn get_opt_map(&self, key: &str) -> Option<&Metadata> {
        match self.map.get(key) {
            Some(MetaValue::Map(m)) => Some(m),
            _ => None,
        }
    }

    pub fn get_map(&self, key: &str) -> Result<&Metadata> {
        self.get_opt_map(key)
            .ok_or_else(|| CalendarError::Metadata(format!("missing map field '{}'", key)))
    }

    pub fn get_list(&self, key: &str) -> Option<&[MetaValue]> {
        match self.map.get(key) {
            Some(MetaValue::List(l)) => Some(l),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        // A map of plain values always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(s: &str) -> Result<Metadata> {
        serde_json::from_str(s).map_err(|e| CalendarError::Metadata(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_keeps_nesting() {
        let mut inner = Metadata::new();
        inner.put_long("nr", 2).put_str("r0", "x");

        let mut meta = Metadata::new();
        meta.put_long("t", 4)
            .put_bool("hd", true)
            .put_str("dts", "20200101T100000Z")
            .put_map("add", inner.clone());

        let decoded = Metadata::from_json(&meta.to_json()).unwrap();

        assert_eq!(decoded, meta);
        assert_eq!(decoded.get_long("t").unwrap(), 4);
        assert!(decoded.get_bool_or("hd", false).unwrap());
        assert_eq!(decoded.get_map("add").unwrap(), &inner);
    }

    #[test]
    fn longs_accept_string_form() {
        let mut meta = Metadata::new();
        meta.put_str("so", "-18000000");

        assert_eq!(meta.get_long("so").unwrap(), -18_000_000);
        assert_eq!(meta.get_long_or("do", 7).unwrap(), 7);
    }

    #[test]
    fn missing_fields_are_errors() {
        let meta = Metadata::new();

        assert!(matches!(meta.get_str("dts"), Err(CalendarError::Metadata(_))));
        assert!(meta.get_map("add").is_err());
        assert!(Metadata::from_json("[1, 2").is_err());
    }
}
