//! The component/property/parameter tree the calendar core consumes and
//! emits.
//!
//! The tree can be built by hand or read from iCalendar text with
//! [`Component::from_str_to_stream`].

use anyhow::{bail, Error};
use pest::{iterators::Pair, Parser};
use pest_derive::Parser;

fn strip_folds(s: &str) -> String {
    match regex::Regex::new(r"\r?\n[\t ]") {
        Ok(re) => re.replace_all(s, "").into_owned(),
        Err(_) => s.to_string(),
    }
}

#[derive(Parser)]
#[grammar = "grammar.pest"]
struct CalParser;

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub name: String,
    pub sub_components: Vec<Component>,
    pub properties: Vec<Property>,
}

impl Component {
    pub fn new(name: &str) -> Component {
        Component {
            name: name.to_string(),
            sub_components: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn from_str_to_stream(data: &str) -> Result<Vec<Component>, Error> {
        let unfolded = strip_folds(data);
        let pairs = CalParser::parse(Rule::component, &unfolded)?;

        pairs.map(Component::from_pair).collect()
    }

    fn from_pair(pair: Pair<Rule>) -> Result<Component, Error> {
        let span = pair.as_span();
        let mut name = None;
        let mut sub_components = Vec::new();
        let mut properties = Vec::new();

        for inner_pair in pair.into_inner() {
            match inner_pair.as_rule() {
                Rule::name => name = Some(inner_pair.as_str().to_string()),
                Rule::component => sub_components.push(Component::from_pair(inner_pair)?),
                Rule::property => properties.push(Property::from_pair(inner_pair)?),
                _ => bail!("Unexpected type {:?}", inner_pair.as_rule()),
            }
        }

        if let Some(name) = name {
            Ok(Component {
                name,
                sub_components,
                properties,
            })
        } else {
            bail!("No name for component: {:?}", span.as_str());
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn push_property(&mut self, property: Property) -> &mut Self {
        self.properties.push(property);
        self
    }

    pub fn push_component(&mut self, component: Component) -> &mut Self {
        self.sub_components.push(component);
        self
    }

    /// First property with the given name.
    pub fn get_property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.is(name))
    }

    pub fn get_property_value(&self, name: &str) -> Option<&str> {
        self.get_property(name).map(|p| p.value.as_str())
    }

    pub fn properties_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Property> {
        self.properties.iter().filter(move |p| p.is(name))
    }

    pub fn components_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Component> {
        self.sub_components.iter().filter(move |c| c.is(name))
    }

    pub fn as_string(&self) -> String {
        let lines = self
            .properties
            .iter()
            .map(|v| v.as_string())
            .chain(self.sub_components.iter().map(|v| v.as_string()))
            .collect::<Vec<_>>()
            .join("\r\n");

        if lines.is_empty() {
            format!("BEGIN:{}\r\nEND:{}", self.name, self.name)
        } else {
            format!("BEGIN:{}\r\n{}\r\nEND:{}", self.name, lines, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: String,
    pub parameters: Vec<Parameter>,
}

impl Property {
    pub fn new(name: &str, value: impl Into<String>) -> Property {
        Property {
            name: name.to_string(),
            value: value.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<String>) -> Property {
        self.parameters.push(Parameter {
            name: name.to_string(),
            values: vec![value.into()],
        });
        self
    }

    fn from_pair(pair: Pair<Rule>) -> Result<Property, Error> {
        let span = pair.as_span();
        let mut name = None;
        let mut value = None;
        let mut parameters = Vec::new();

        for inner_pair in pair.into_inner() {
            match inner_pair.as_rule() {
                Rule::name => name = Some(inner_pair.as_str().to_string()),
                Rule::property_value => value = Some(inner_pair.as_str().to_string()),
                Rule::param => parameters.push(Parameter::from_pair(inner_pair)?),
                _ => bail!("Unexpected type {:?}", inner_pair.as_rule()),
            }
        }

        if let (Some(name), Some(value)) = (name, value) {
            Ok(Property {
                name,
                value,
                parameters,
            })
        } else {
            bail!("No name for property: {:?}", span.as_str());
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// First value of the named parameter.
    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.values.first())
            .map(|v| v.as_str())
    }

    pub fn as_string(&self) -> String {
        if self.parameters.is_empty() {
            format!("{}:{}", self.name, self.value)
        } else {
            let params = self
                .parameters
                .iter()
                .map(|v| v.as_string())
                .collect::<Vec<_>>()
                .join(";");

            format!("{};{}:{}", self.name, params, self.value)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub values: Vec<String>,
}

impl Parameter {
    fn from_pair(pair: Pair<Rule>) -> Result<Parameter, Error> {
        let span = pair.as_span();
        let mut name = None;
        let mut values = Vec::new();
        for inner_pair in pair.into_inner() {
            match inner_pair.as_rule() {
                Rule::name => name = Some(inner_pair.as_str().to_string()),
                Rule::param_value => values.push(inner_pair.as_str().trim_matches('"').to_string()),
                _ => bail!("Unexpected type {:?}", inner_pair.as_rule()),
            }
        }

        if values.is_empty() {
            bail!("No values for param {:?}", span.as_str());
        }

        if let Some(name) = name {
            Ok(Parameter { name, values })
        } else {
            bail!("No name for parameter: {:?}", span.as_str());
        }
    }

    pub fn as_string(&self) -> String {
        // Values with separators in them have to be quoted.
        let values = self
            .values
            .iter()
            .map(|v| {
                if v.is_empty() || v.contains(&[',', ':', ';'] as &[_]) {
                    format!(r#""{}""#, v)
                } else {
                    v.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(",");

        format!("{}={}", self.name, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nested_with_folds_and_params() {
        let input = "BEGIN:VCALENDAR\r\n\
                     VERSION:2.0\r\n\
                     BEGIN:VEVENT\r\n\
                     DTSTART;TZID=\"America/New_York\":20200101T100000\r\n\
                     SUMMARY:Long\r\n  line\r\n\
                     END:VEVENT\r\n\
                     END:VCALENDAR\r\n";

        let components = Component::from_str_to_stream(input).unwrap();
        assert_eq!(components.len(), 1);

        let cal = &components[0];
        assert!(cal.is("vcalendar"));
        assert_eq!(cal.get_property_value("VERSION"), Some("2.0"));

        let event = cal.components_named("VEVENT").next().unwrap();
        let dtstart = event.get_property("dtstart").unwrap();
        assert_eq!(dtstart.get_param("TZID"), Some("America/New_York"));
        assert_eq!(dtstart.value, "20200101T100000");
        assert_eq!(event.get_property_value("SUMMARY"), Some("Long line"));
    }

    #[test]
    fn emit_and_reparse() {
        let mut event = Component::new("VEVENT");
        event
            .push_property(Property::new("DTSTART", "20200101").with_param("VALUE", "DATE"))
            .push_property(Property::new("RDATE", "20200105").with_param("X-NOTE", "a,b"));

        let text = format!("{}\r\n", event.as_string());
        let reparsed = Component::from_str_to_stream(&text).unwrap();

        assert_eq!(reparsed, vec![event]);
    }

    #[test]
    fn mismatched_end_fails() {
        let input = "BEGIN:VEVENT\nUID:1\nEND:VTODO\n";
        assert!(Component::from_str_to_stream(input).is_err());
    }
}
