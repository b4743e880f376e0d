//! Table lifecycle: creation, method updates, and the recompile-persist-rebuild step every
//! mutation ends with.

use crate::config::{require_table, Hook, Table, TableKey, TableKind, TableMethods};
use crate::error::AppError;
use crate::materialize::{build_table, LiveModel};
use crate::schema::build_schema;
use crate::script::ScriptSandbox;
use crate::slug::slugify;
use crate::state::AppState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Input for [`TableService::create`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewTable {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: TableKind,
}

impl NewTable {
    pub fn named(name: impl Into<String>) -> Self {
        NewTable {
            name: name.into(),
            ..NewTable::default()
        }
    }
}

pub struct TableService;

impl TableService {
    /// Create an empty table and materialize its collection.
    pub async fn create(state: &AppState, input: NewTable) -> Result<Table, AppError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("table name is required".into()));
        }
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(AppError::Validation(format!("table name '{}' produces an empty slug", name)));
        }
        if state.meta.find_table(&TableKey::Slug(slug.clone())).await?.is_some() {
            return Err(AppError::Conflict(format!("a table with slug '{}' already exists", slug)));
        }

        let mut table = Table::new(Uuid::new_v4().to_string(), slug, name);
        table.description = input.description;
        table.logo = input.logo;
        table.kind = input.kind;
        Self::rebuild(state, &mut table).await?;
        tracing::info!(table_id = %table.id, slug = %table.slug, kind = ?table.kind, "table created");
        Ok(table)
    }

    pub async fn get(state: &AppState, key: &TableKey) -> Result<Table, AppError> {
        require_table(state, key).await
    }

    /// Replace the lifecycle scripts of a table. Scripts that do not parse are rejected with
    /// the hook and line in the message; nothing is stored in that case.
    pub async fn update_methods(state: &AppState, table_id: &str, methods: TableMethods) -> Result<Table, AppError> {
        let mut table = require_table(state, &TableKey::Id(table_id.to_string())).await?;
        for hook in [Hook::OnLoad, Hook::BeforeSave, Hook::AfterSave] {
            if let Some(code) = methods.source(hook) {
                ScriptSandbox::check_syntax(code)
                    .map_err(|e| AppError::Validation(format!("{} script: {}", hook.as_str(), e)))?;
            }
        }
        table.methods = methods;
        Self::rebuild(state, &mut table).await?;
        tracing::info!(table_id = %table.id, slug = %table.slug, "table methods updated");
        Ok(table)
    }

    /// Recompile `_schema` from the active fields, persist, and re-materialize.
    pub(crate) async fn rebuild(state: &AppState, table: &mut Table) -> Result<Arc<LiveModel>, AppError> {
        table.schema = Some(build_schema(&table.active_fields()));
        let version = state.meta.save_table(table).await?;
        tracing::debug!(slug = %table.slug, version, "table stored");
        build_table(state, table).await
    }
}
