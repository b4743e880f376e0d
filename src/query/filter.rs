//! Structured query and sort specification, with in-memory evaluation.

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Constraint on a single row attribute. Array attributes match when any element does.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Equals(Value),
    In(Vec<String>),
    /// Case-insensitive regular expression.
    Matches(String),
    /// Inclusive bounds; either may be absent.
    Range {
        gte: Option<DateTime<Utc>>,
        lte: Option<DateTime<Utc>>,
    },
}

/// AND of per-attribute conditions, further AND-ed with an OR group (free-text search).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructuredQuery {
    pub conditions: BTreeMap<String, Condition>,
    pub any_of: Vec<(String, Condition)>,
}

impl StructuredQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attribute: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(attribute.into(), condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.any_of.is_empty()
    }

    pub fn get(&self, attribute: &str) -> Option<&Condition> {
        self.conditions.get(attribute)
    }

    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        let all = self
            .conditions
            .iter()
            .all(|(attr, cond)| condition_matches(cond, row.get(attr)));
        let any = self.any_of.is_empty()
            || self
                .any_of
                .iter()
                .any(|(attr, cond)| condition_matches(cond, row.get(attr)));
        all && any
    }
}

fn condition_matches(cond: &Condition, value: Option<&Value>) -> bool {
    let value = value.unwrap_or(&Value::Null);
    if let Value::Array(items) = value {
        if let Condition::Equals(expected @ Value::Array(_)) = cond {
            return value == expected;
        }
        return items.iter().any(|item| scalar_matches(cond, item));
    }
    scalar_matches(cond, value)
}

fn scalar_matches(cond: &Condition, value: &Value) -> bool {
    match cond {
        Condition::Equals(expected) => value == expected,
        Condition::In(set) => match scalar_text(value) {
            Some(text) => set.iter().any(|s| *s == text),
            None => false,
        },
        Condition::Matches(pattern) => {
            let Some(text) = value.as_str() else { return false };
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => re.is_match(text),
                Err(e) => {
                    tracing::debug!(pattern = %pattern, error = %e, "unusable filter pattern");
                    false
                }
            }
        }
        Condition::Range { gte, lte } => {
            let Some(at) = value.as_str().and_then(parse_timestamp) else { return false };
            gte.map_or(true, |g| at >= g) && lte.map_or(true, |l| at <= l)
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// RFC 3339 timestamp or bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" | "1" => Some(SortDirection::Asc),
            "desc" | "descending" | "-1" => Some(SortDirection::Desc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// Ordered `{ slug: direction }` pairs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SortSpec(pub Vec<(String, SortDirection)>);

impl SortSpec {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, slug: &str) -> Option<SortDirection> {
        self.0.iter().find(|(s, _)| s == slug).map(|(_, d)| *d)
    }

    /// Compare two rows under this spec; ties fall through to the next key.
    pub fn compare(&self, a: &Map<String, Value>, b: &Map<String, Value>) -> Ordering {
        for (attr, dir) in &self.0 {
            let ord = compare_values(a.get(attr), b.get(attr));
            let ord = match dir {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Missing/null first, then booleans, numbers, strings; arrays by first element.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    let a = first_element(a.unwrap_or(&Value::Null));
    let b = first_element(b.unwrap_or(&Value::Null));
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn first_element(v: &Value) -> &Value {
    match v {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    }
}
