//! `build_query` / `build_order`: flat request payloads → structured query and sort.

use crate::config::{Field, FieldType, TableKey};
use crate::error::AppError;
use crate::materialize::build_table;
use crate::query::{normalize, parse_timestamp, Condition, SortDirection, SortSpec, StructuredQuery};
use crate::schema::TRASHED;
use crate::state::AppState;
use crate::BoxFuture;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};

pub const SEARCH_KEY: &str = "search";
pub const INITIAL_SUFFIX: &str = "-initial";
pub const FINAL_SUFFIX: &str = "-final";
pub const ORDER_PREFIX: &str = "order-";

/// Translate a flat filter payload into a structured query over `fields`.
///
/// Field-group filters (`<group-slug>-<child-slug>`) are resolved by querying the group's own
/// collection and constraining the parent to rows referencing a matching group row. Unknown
/// keys and unparsable values are ignored.
pub async fn build_query(
    state: &AppState,
    payload: &HashMap<String, String>,
    fields: &[Field],
) -> Result<StructuredQuery, AppError> {
    let mut visited = HashSet::new();
    state
        .within_resolve_timeout("query resolution", build_query_inner(state, payload, fields, &mut visited))
        .await
}

fn build_query_inner<'a>(
    state: &'a AppState,
    payload: &'a HashMap<String, String>,
    fields: &'a [Field],
    visited: &'a mut HashSet<String>,
) -> BoxFuture<'a, Result<StructuredQuery, AppError>> {
    Box::pin(async move {
        let mut query = translate_fields(payload, fields);

        for field in fields.iter().filter(|f| f.type_ == FieldType::FieldGroup) {
            let prefix = format!("{}-", field.slug);
            let sub_payload: HashMap<String, String> = payload
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
                .collect();
            if sub_payload.is_empty() {
                continue;
            }
            let Some(target) = field.group_target() else {
                tracing::warn!(field = %field.slug, "field group has no group table configured");
                continue;
            };
            if !visited.insert(target.id.clone()) {
                continue;
            }
            let group = state.meta.find_table(&TableKey::Id(target.id.clone())).await?;
            let Some(group) = group else {
                tracing::warn!(field = %field.slug, group = %target.id, "group table not found, filter skipped");
                visited.remove(&target.id);
                continue;
            };
            let group_fields = group.active_fields();
            let sub_query = build_query_inner(state, &sub_payload, &group_fields, visited).await?;
            visited.remove(&target.id);
            if sub_query.is_empty() {
                continue;
            }
            let model = build_table(state, &group).await?;
            let ids = model.distinct_ids(&sub_query).await?;
            if ids.is_empty() {
                tracing::debug!(field = %field.slug, "no group rows match, filter omitted");
                continue;
            }
            query.conditions.insert(field.slug.clone(), Condition::In(ids));
        }

        Ok(query)
    })
}

/// Everything that needs no I/O: trashed flag, per-type field filters and free-text search.
fn translate_fields(payload: &HashMap<String, String>, fields: &[Field]) -> StructuredQuery {
    let mut query = StructuredQuery::new();

    if payload.get(TRASHED).map(String::as_str) == Some("true") {
        query
            .conditions
            .insert(TRASHED.to_string(), Condition::Equals(serde_json::Value::Bool(true)));
    }

    for field in fields {
        match field.type_ {
            FieldType::TextShort | FieldType::TextLong => {
                if let Some(value) = non_empty(payload, &field.slug) {
                    query
                        .conditions
                        .insert(field.slug.clone(), Condition::Matches(normalize(value)));
                }
            }
            FieldType::Relationship | FieldType::Dropdown | FieldType::Category => {
                if let Some(value) = non_empty(payload, &field.slug) {
                    let values: Vec<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                    if !values.is_empty() {
                        query.conditions.insert(field.slug.clone(), Condition::In(values));
                    }
                }
            }
            FieldType::Date => {
                let gte = non_empty(payload, &format!("{}{}", field.slug, INITIAL_SUFFIX)).and_then(day_start);
                let lte = non_empty(payload, &format!("{}{}", field.slug, FINAL_SUFFIX)).and_then(day_end);
                if gte.is_some() || lte.is_some() {
                    query.conditions.insert(field.slug.clone(), Condition::Range { gte, lte });
                }
            }
            _ => {}
        }
    }

    if let Some(search) = non_empty(payload, SEARCH_KEY) {
        let pattern = normalize(search);
        query.any_of = fields
            .iter()
            .filter(|f| f.type_.is_text())
            .map(|f| (f.slug.clone(), Condition::Matches(pattern.clone())))
            .collect();
    }

    query
}

fn non_empty<'a>(payload: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    payload.get(key).map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn calendar_day(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(raw).map(|dt| dt.date_naive()))
}

fn day_start(raw: &str) -> Option<DateTime<Utc>> {
    calendar_day(raw)?.and_hms_milli_opt(0, 0, 0, 0).map(|d| d.and_utc())
}

fn day_end(raw: &str) -> Option<DateTime<Utc>> {
    calendar_day(raw)?.and_hms_milli_opt(23, 59, 59, 999).map(|d| d.and_utc())
}

/// Sort spec from `order-<field id>` or `order-<field slug>` keys, in field order.
pub fn build_order(query: &HashMap<String, String>, fields: &[Field]) -> SortSpec {
    if query.is_empty() {
        return SortSpec::default();
    }
    let pairs = fields
        .iter()
        .filter_map(|field| {
            let raw = query
                .get(&format!("{}{}", ORDER_PREFIX, field.id))
                .or_else(|| query.get(&format!("{}{}", ORDER_PREFIX, field.slug)))?;
            let direction = SortDirection::parse(raw)?;
            Some((field.slug.clone(), direction))
        })
        .collect();
    SortSpec(pairs)
}
