//! Expansion trees: which foreign references to resolve when rows are read, and the resolver
//! that applies a tree to fetched rows.

use crate::config::{Field, FieldType, Table, TableKey};
use crate::error::AppError;
use crate::materialize::build_table;
use crate::schema::{EVALUATION_COLLECTION, REACTION_COLLECTION, STORAGE_COLLECTION, USER_COLLECTION};
use crate::state::AppState;
use crate::store::{CollectionStore, Row, CREATOR, ID};
use crate::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Attributes of a user kept when a user reference is expanded.
pub const USER_SELECT: &[&str] = &["id", "name", "email"];

/// One expanded reference: the attribute at `path` holds ids of rows in `collection`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expansion {
    pub path: String,
    pub collection: String,
    /// Attributes kept on the expanded rows; all when None. `id` is always kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub populate: Vec<Expansion>,
}

impl Expansion {
    pub fn new(path: impl Into<String>, collection: impl Into<String>) -> Self {
        Expansion {
            path: path.into(),
            collection: collection.into(),
            select: None,
            populate: Vec::new(),
        }
    }

    fn user(path: &str) -> Self {
        Expansion {
            select: Some(USER_SELECT.iter().map(|s| s.to_string()).collect()),
            ..Expansion::new(path, USER_COLLECTION)
        }
    }
}

pub type ExpansionTree = Vec<Expansion>;

/// Fields whose values are foreign references.
pub fn get_relationship(fields: &[Field]) -> Vec<&Field> {
    fields.iter().filter(|f| f.type_.is_reference()).collect()
}

/// Expansion tree for rows described by `fields`.
///
/// Relationship and field-group targets are materialized on the way and expanded recursively
/// while they hold references of their own. A target already being expanded higher up the
/// current branch is expanded one level only. Unconfigured or missing targets are logged and
/// left out.
pub async fn build_populate(state: &AppState, fields: &[Field]) -> Result<ExpansionTree, AppError> {
    let mut visited = HashSet::new();
    state
        .within_resolve_timeout("populate resolution", populate_inner(state, fields, &mut visited))
        .await
}

/// Like [`build_populate`], with `table` itself counted as already expanded.
pub async fn build_table_populate(state: &AppState, table: &Table) -> Result<ExpansionTree, AppError> {
    let mut visited = HashSet::from([table.id.clone()]);
    let fields = table.active_fields();
    state
        .within_resolve_timeout("populate resolution", populate_inner(state, &fields, &mut visited))
        .await
}

fn populate_inner<'a>(
    state: &'a AppState,
    fields: &'a [Field],
    visited: &'a mut HashSet<String>,
) -> BoxFuture<'a, Result<ExpansionTree, AppError>> {
    Box::pin(async move {
        let mut tree = ExpansionTree::new();
        for field in get_relationship(fields) {
            let expansion = match field.type_ {
                FieldType::File => Some(Expansion::new(&field.slug, STORAGE_COLLECTION)),
                FieldType::Reaction | FieldType::Evaluation => {
                    let collection = if field.type_ == FieldType::Reaction {
                        REACTION_COLLECTION
                    } else {
                        EVALUATION_COLLECTION
                    };
                    Some(Expansion {
                        populate: vec![Expansion::user("user")],
                        ..Expansion::new(&field.slug, collection)
                    })
                }
                FieldType::Relationship | FieldType::FieldGroup => {
                    expand_target(state, field, visited).await?
                }
                _ => None,
            };
            tree.extend(expansion);
        }
        tree.push(Expansion::user(CREATOR));
        Ok(tree)
    })
}

async fn expand_target(
    state: &AppState,
    field: &Field,
    visited: &mut HashSet<String>,
) -> Result<Option<Expansion>, AppError> {
    let target = match field.type_ {
        FieldType::FieldGroup => field.group_target(),
        _ => field.relationship_target(),
    };
    let Some(target) = target.filter(|t| !t.id.is_empty()) else {
        tracing::warn!(field = %field.slug, kind = ?field.type_, "reference target not configured, expansion skipped");
        return Ok(None);
    };
    let Some(table) = state.meta.find_table(&TableKey::Id(target.id.clone())).await? else {
        tracing::warn!(field = %field.slug, target = %target.id, "referenced table not found, expansion skipped");
        return Ok(None);
    };
    let mut expansion = Expansion::new(&field.slug, &table.slug);
    if visited.contains(&table.id) {
        tracing::debug!(field = %field.slug, target = %table.slug, "reference cycle, expanding one level");
        return Ok(Some(expansion));
    }
    match build_table(state, &table).await {
        Ok(_) => {}
        Err(AppError::Config(e)) => {
            tracing::warn!(field = %field.slug, target = %table.slug, error = %e, "referenced table cannot be materialized, expansion skipped");
            return Ok(None);
        }
        Err(e) => return Err(e),
    }
    let target_fields = table.active_fields();
    if !get_relationship(&target_fields).is_empty() {
        visited.insert(table.id.clone());
        let nested = populate_inner(state, &target_fields, visited).await;
        visited.remove(&table.id);
        expansion.populate = nested?;
    }
    Ok(Some(expansion))
}

/// Replace reference ids in `rows` with the referenced rows, following `tree`.
///
/// Array attributes keep only the rows that were found; a single id becomes the row or null.
pub fn expand_rows<'a>(
    store: &'a dyn CollectionStore,
    rows: Vec<Row>,
    tree: &'a [Expansion],
) -> BoxFuture<'a, Result<Vec<Row>, AppError>> {
    Box::pin(async move {
        let mut rows = rows;
        for expansion in tree {
            let mut ids: Vec<String> = Vec::new();
            for row in &rows {
                collect_ids(row.get(&expansion.path), &mut ids);
            }
            if ids.is_empty() {
                continue;
            }
            ids.sort();
            ids.dedup();
            let found = store.find_by_ids(&expansion.collection, &ids).await?;
            let found = expand_rows(store, found, &expansion.populate).await?;
            let by_id: HashMap<String, Value> = found
                .into_iter()
                .filter_map(|doc| {
                    let id = doc.get(ID).and_then(Value::as_str)?.to_string();
                    Some((id, Value::Object(project(doc, expansion.select.as_deref()))))
                })
                .collect();
            for row in rows.iter_mut() {
                if let Some(value) = row.get_mut(&expansion.path) {
                    substitute(value, &by_id);
                }
            }
        }
        Ok(rows)
    })
}

fn collect_ids(value: Option<&Value>, out: &mut Vec<String>) {
    match value {
        Some(Value::String(id)) if !id.is_empty() => out.push(id.clone()),
        Some(Value::Array(items)) => {
            out.extend(items.iter().filter_map(Value::as_str).filter(|s| !s.is_empty()).map(String::from))
        }
        _ => {}
    }
}

fn substitute(value: &mut Value, by_id: &HashMap<String, Value>) {
    match value {
        Value::String(id) => {
            *value = by_id.get(id.as_str()).cloned().unwrap_or(Value::Null);
        }
        Value::Array(items) => {
            let expanded: Vec<Value> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(id) => by_id.get(id.as_str()).cloned(),
                    other => Some(other.clone()),
                })
                .collect();
            *items = expanded;
        }
        _ => {}
    }
}

fn project(doc: Row, select: Option<&[String]>) -> Row {
    match select {
        None => doc,
        Some(keep) => doc
            .into_iter()
            .filter(|(k, _)| k == ID || keep.iter().any(|s| s == k))
            .collect(),
    }
}
