//! Field lifecycle. Every mutation recompiles the owning table's schema and re-materializes it.

use super::tables::TableService;
use crate::config::{
    require_table, validate_new_field, Field, FieldConfiguration, FieldType, Table, TableKey, TableKind, TableRef,
};
use crate::error::AppError;
use crate::slug::slugify;
use crate::state::AppState;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Input for [`FieldService::create`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewField {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: FieldType,
    #[serde(default)]
    pub configuration: FieldConfiguration,
}

impl NewField {
    pub fn new(name: impl Into<String>, type_: FieldType) -> Self {
        NewField {
            name: name.into(),
            type_,
            configuration: FieldConfiguration::default(),
        }
    }
}

/// Changes for [`FieldService::update`]; absent parts are kept.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub configuration: Option<FieldConfiguration>,
}

pub struct FieldService;

impl FieldService {
    /// Append a field to table `table_id`.
    ///
    /// A field group reuses the group table named in its configuration, or gets a new
    /// companion `field-group` table.
    pub async fn create(state: &AppState, table_id: &str, input: NewField) -> Result<Field, AppError> {
        let mut table = load(state, table_id).await?;
        let mut field = Field::new(Uuid::new_v4().to_string(), slugify(&input.name), input.name.trim(), input.type_);
        field.configuration = input.configuration;
        validate_new_field(&table, &field)?;

        match field.type_ {
            FieldType::FieldGroup => {
                let group = companion_group(state, &table, &field).await?;
                field.configuration.group = Some(group);
            }
            FieldType::Relationship => resolve_relationship_slug(state, &mut field).await?,
            _ => {}
        }

        table.fields.push(field.clone());
        TableService::rebuild(state, &mut table).await?;
        tracing::info!(table = %table.slug, field = %field.slug, kind = ?field.type_, "field created");
        Ok(field)
    }

    /// Rename and/or reconfigure a field. A rename derives a new slug and moves the stored
    /// values of every row to it.
    pub async fn update(state: &AppState, table_id: &str, field_id: &str, changes: FieldUpdate) -> Result<Field, AppError> {
        let mut table = load(state, table_id).await?;
        let index = field_index(&table, field_id)?;
        let mut field = table.fields[index].clone();
        let old_slug = field.slug.clone();

        if let Some(name) = changes.name {
            field.name = name.trim().to_string();
            field.slug = slugify(&field.name);
            validate_new_field(&table, &field)?;
        }
        if let Some(mut configuration) = changes.configuration {
            if field.type_ == FieldType::FieldGroup && configuration.group.is_none() {
                configuration.group = field.configuration.group.take();
            }
            field.configuration = configuration;
            if field.type_ == FieldType::Relationship {
                resolve_relationship_slug(state, &mut field).await?;
            }
        }

        if field.slug != old_slug {
            let moved = state.store.rename_attribute(&table.slug, &old_slug, &field.slug).await?;
            tracing::info!(table = %table.slug, from = %old_slug, to = %field.slug, rows = moved, "field slug migrated");
        }
        table.fields[index] = field.clone();
        TableService::rebuild(state, &mut table).await?;
        Ok(field)
    }

    /// Soft-delete a field. The last active field of a table cannot be trashed.
    pub async fn trash(state: &AppState, table_id: &str, field_id: &str) -> Result<Field, AppError> {
        let mut table = load(state, table_id).await?;
        let index = field_index(&table, field_id)?;
        if table.fields[index].trashed {
            return Ok(table.fields[index].clone());
        }
        if table.fields.iter().filter(|f| !f.trashed).count() <= 1 {
            return Err(AppError::Conflict(format!(
                "'{}' is the last active field of table '{}'",
                table.fields[index].slug, table.slug
            )));
        }
        table.fields[index].trashed = true;
        table.fields[index].trashed_at = Some(Utc::now());
        let field = table.fields[index].clone();
        TableService::rebuild(state, &mut table).await?;
        tracing::info!(table = %table.slug, field = %field.slug, "field trashed");
        Ok(field)
    }

    pub async fn restore(state: &AppState, table_id: &str, field_id: &str) -> Result<Field, AppError> {
        let mut table = load(state, table_id).await?;
        let index = field_index(&table, field_id)?;
        table.fields[index].trashed = false;
        table.fields[index].trashed_at = None;
        let field = table.fields[index].clone();
        TableService::rebuild(state, &mut table).await?;
        tracing::info!(table = %table.slug, field = %field.slug, "field restored");
        Ok(field)
    }
}

async fn load(state: &AppState, table_id: &str) -> Result<Table, AppError> {
    require_table(state, &TableKey::Id(table_id.to_string())).await
}

fn field_index(table: &Table, field_id: &str) -> Result<usize, AppError> {
    table
        .fields
        .iter()
        .position(|f| f.id == field_id)
        .ok_or_else(|| AppError::NotFound(format!("field {} in table {}", field_id, table.slug)))
}

/// Group table for a new field-group field: the configured one when it exists, otherwise a
/// fresh `field-group` table named after the field.
async fn companion_group(state: &AppState, table: &Table, field: &Field) -> Result<TableRef, AppError> {
    if let Some(target) = field.group_target().filter(|t| !t.id.is_empty()) {
        match state.meta.find_table(&TableKey::Id(target.id.clone())).await? {
            Some(group) => {
                return Ok(TableRef {
                    id: group.id,
                    slug: group.slug,
                })
            }
            None => tracing::warn!(field = %field.slug, group = %target.id, "configured group table not found, creating one"),
        }
    }
    let mut group = Table::new(
        Uuid::new_v4().to_string(),
        format!("{}-{}", table.slug, field.slug),
        field.name.clone(),
    );
    group.kind = TableKind::FieldGroup;
    if state.meta.find_table(&TableKey::Slug(group.slug.clone())).await?.is_some() {
        return Err(AppError::Conflict(format!("a table with slug '{}' already exists", group.slug)));
    }
    TableService::rebuild(state, &mut group).await?;
    tracing::info!(table = %table.slug, group = %group.slug, "field group table created");
    Ok(TableRef {
        id: group.id,
        slug: group.slug,
    })
}

/// Fill in the target slug of a relationship configured by id only, so the compiled
/// reference names the target's collection.
async fn resolve_relationship_slug(state: &AppState, field: &mut Field) -> Result<(), AppError> {
    let Some(target) = field
        .configuration
        .relationship
        .as_mut()
        .and_then(|r| r.table.as_mut())
    else {
        tracing::warn!(field = %field.slug, "relationship field without a target table");
        return Ok(());
    };
    if !target.slug.is_empty() || target.id.is_empty() {
        return Ok(());
    }
    match state.meta.find_table(&TableKey::Id(target.id.clone())).await? {
        Some(found) => target.slug = found.slug,
        None => tracing::warn!(target = %target.id, "relationship target table not found"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelationshipConfig;
    use crate::email::LogEmailSender;
    use crate::schema::StorageType;
    use crate::service::tables::NewTable;
    use crate::settings::Settings;
    use crate::store::Row;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::in_memory(Arc::new(LogEmailSender), Settings::default())
    }

    #[tokio::test]
    async fn create_recompiles_schema() {
        let state = state();
        let table = TableService::create(&state, NewTable::named("Posts")).await.unwrap();
        let field = FieldService::create(&state, &table.id, NewField::new("Título", FieldType::TextShort))
            .await
            .unwrap();
        assert_eq!(field.slug, "titulo");
        let stored = TableService::get(&state, &TableKey::Id(table.id.clone())).await.unwrap();
        let schema = stored.schema.unwrap();
        assert_eq!(schema.get("titulo").map(|d| d.storage), Some(StorageType::String));
        assert!(state.registry.get("posts").unwrap().fields().iter().any(|f| f.slug == "titulo"));

        let dup = FieldService::create(&state, &table.id, NewField::new("titulo", FieldType::TextLong)).await;
        assert!(matches!(dup, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn field_group_creates_companion_table() {
        let state = state();
        let table = TableService::create(&state, NewTable::named("Orders")).await.unwrap();
        let field = FieldService::create(&state, &table.id, NewField::new("Items", FieldType::FieldGroup))
            .await
            .unwrap();
        let group = field.group_target().unwrap();
        assert_eq!(group.slug, "orders-items");
        let group_table = TableService::get(&state, &TableKey::Id(group.id.clone())).await.unwrap();
        assert_eq!(group_table.kind, TableKind::FieldGroup);
        assert!(state.registry.get("orders-items").is_some());

        let stored = TableService::get(&state, &TableKey::Id(table.id.clone())).await.unwrap();
        let def = stored.schema.unwrap();
        assert_eq!(def.get("items").and_then(|d| d.reference.clone()).as_deref(), Some("orders-items"));
    }

    #[tokio::test]
    async fn relationship_target_slug_is_filled_in() {
        let state = state();
        let authors = TableService::create(&state, NewTable::named("Authors")).await.unwrap();
        let posts = TableService::create(&state, NewTable::named("Posts")).await.unwrap();
        let mut input = NewField::new("Author", FieldType::Relationship);
        input.configuration.relationship = Some(RelationshipConfig {
            table: Some(TableRef {
                id: authors.id.clone(),
                slug: String::new(),
            }),
            ..RelationshipConfig::default()
        });
        let field = FieldService::create(&state, &posts.id, input).await.unwrap();
        assert_eq!(field.relationship_target().unwrap().slug, "authors");
    }

    #[tokio::test]
    async fn rename_migrates_stored_values() {
        let state = state();
        let table = TableService::create(&state, NewTable::named("Posts")).await.unwrap();
        let field = FieldService::create(&state, &table.id, NewField::new("Title", FieldType::TextShort))
            .await
            .unwrap();
        let model = state.registry.get("posts").unwrap();
        let mut row = Row::new();
        row.insert("title".into(), json!("hello"));
        let created = model.create(row, &Default::default()).await.unwrap();

        let renamed = FieldService::update(
            &state,
            &table.id,
            &field.id,
            FieldUpdate {
                name: Some("Headline".into()),
                configuration: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(renamed.slug, "headline");

        let model = state.registry.get("posts").unwrap();
        let id = created["id"].as_str().unwrap();
        let loaded = model.find_one(id, &Vec::new(), &Default::default()).await.unwrap().unwrap();
        assert_eq!(loaded["headline"], json!("hello"));
        assert_eq!(loaded.get("title"), None::<&Value>);
    }

    #[tokio::test]
    async fn restore_brings_field_back() {
        let state = state();
        let table = TableService::create(&state, NewTable::named("Posts")).await.unwrap();
        let a = FieldService::create(&state, &table.id, NewField::new("A", FieldType::TextShort)).await.unwrap();
        FieldService::create(&state, &table.id, NewField::new("B", FieldType::TextShort)).await.unwrap();

        FieldService::trash(&state, &table.id, &a.id).await.unwrap();
        assert!(!state.registry.get("posts").unwrap().schema().contains("a"));
        FieldService::restore(&state, &table.id, &a.id).await.unwrap();
        assert!(state.registry.get("posts").unwrap().schema().contains("a"));
    }
}
