//! Table materialization: a table descriptor becomes a live model bound to its collection,
//! with the table's lifecycle scripts wired around saves and reads.

use crate::config::{validate_for_materialization, Field, Hook, Table, TableKey, TableMethods};
use crate::error::AppError;
use crate::populate::{expand_rows, ExpansionTree};
use crate::query::{Condition, SortSpec, StructuredQuery};
use crate::schema::{SchemaDefinition, TRASHED, TRASHED_AT};
use crate::script::{ExecutionMoment, ScriptContext, ScriptSandbox, UserAction};
use crate::service::validation::RowValidator;
use crate::state::AppState;
use crate::store::{now_timestamp, CollectionStore, Page, Row, CREATOR, ID};
use serde_json::Value;
use std::sync::Arc;

/// Caller identity forwarded to lifecycle scripts as `userId`.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub user_id: Option<String>,
}

impl RequestContext {
    pub fn user(id: impl Into<String>) -> Self {
        RequestContext { user_id: Some(id.into()) }
    }
}

/// Queryable collection of one materialized table.
///
/// Immutable once built: field or method changes produce a new model that replaces this one
/// in the registry.
pub struct LiveModel {
    table_id: String,
    slug: String,
    schema: SchemaDefinition,
    fields: Vec<Field>,
    field_slugs: Vec<String>,
    methods: TableMethods,
    store: Arc<dyn CollectionStore>,
    sandbox: Arc<ScriptSandbox>,
}

impl LiveModel {
    fn new(table: &Table, schema: SchemaDefinition, store: Arc<dyn CollectionStore>, sandbox: Arc<ScriptSandbox>) -> Self {
        LiveModel {
            table_id: table.id.clone(),
            slug: table.slug.clone(),
            schema,
            fields: table.active_fields(),
            field_slugs: table.active_field_slugs(),
            methods: table.methods.clone(),
            store,
            sandbox,
        }
    }

    /// Collection name, equal to the table slug.
    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    pub fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn has_hook(&self, hook: Hook) -> bool {
        self.methods.source(hook).is_some()
    }

    /// Insert a new row through the save pipeline.
    pub async fn create(&self, row: Row, ctx: &RequestContext) -> Result<Row, AppError> {
        let mut row = row;
        row.remove(ID);
        self.prepare(&mut row, UserAction::NewRecord, ctx).await?;
        if let Some(user) = &ctx.user_id {
            row.insert(CREATOR.into(), Value::String(user.clone()));
        }
        let stored = self.store.insert(&self.slug, row).await?;
        tracing::debug!(collection = %self.slug, id = ?stored.get(ID), "row created");
        Ok(self.after_save(stored, UserAction::NewRecord, ctx).await)
    }

    /// Merge `changes` over the stored row `id` and save it through the pipeline.
    pub async fn save(&self, id: &str, changes: Row, ctx: &RequestContext) -> Result<Row, AppError> {
        let mut row = self
            .fetch(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("row {} in {}", id, self.slug)))?;
        for (key, value) in changes {
            if key != ID {
                row.insert(key, value);
            }
        }
        self.prepare(&mut row, UserAction::EditRecord, ctx).await?;
        let stored = self
            .store
            .replace(&self.slug, id, row)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("row {} in {}", id, self.slug)))?;
        tracing::debug!(collection = %self.slug, id = %id, "row saved");
        Ok(self.after_save(stored, UserAction::EditRecord, ctx).await)
    }

    /// Defaults, blocking beforeSave, then schema validation.
    async fn prepare(&self, row: &mut Row, action: UserAction, ctx: &RequestContext) -> Result<(), AppError> {
        RowValidator::apply_defaults(row, &self.schema);
        if let Some(code) = self.methods.source(Hook::BeforeSave) {
            let context = self.script_context(action, ExecutionMoment::BeforeSave, ctx);
            let outcome = self
                .sandbox
                .handle(code, row, &self.slug, &self.field_slugs, &context)
                .await;
            if !outcome.success {
                let message = outcome.error.unwrap_or_default();
                tracing::error!(
                    collection = %self.slug,
                    error = %message,
                    stack = ?outcome.stack,
                    "beforeSave script failed, save aborted"
                );
                return Err(AppError::Script(format!("Erro no beforeSave: {}", message)));
            }
        }
        RowValidator::validate(row, &self.schema, &self.fields)
    }

    /// Runs afterSave on the stored row. Failures are logged; the row is already committed.
    async fn after_save(&self, mut row: Row, action: UserAction, ctx: &RequestContext) -> Row {
        if let Some(code) = self.methods.source(Hook::AfterSave) {
            let context = self.script_context(action, ExecutionMoment::AfterSave, ctx);
            let outcome = self
                .sandbox
                .handle(code, &mut row, &self.slug, &self.field_slugs, &context)
                .await;
            if !outcome.success {
                tracing::warn!(
                    collection = %self.slug,
                    error = ?outcome.error,
                    "afterSave script failed"
                );
            }
        }
        row
    }

    /// Rows matching `query`, expanded along `tree`, each passed through onLoad.
    pub async fn find(
        &self,
        query: &StructuredQuery,
        order: &SortSpec,
        page: Page,
        tree: &ExpansionTree,
        ctx: &RequestContext,
    ) -> Result<Vec<Row>, AppError> {
        let rows = self.store.find(&self.slug, query, order, page).await?;
        let mut rows = expand_rows(self.store.as_ref(), rows, tree).await?;
        for row in rows.iter_mut() {
            self.on_load(row, ctx).await;
        }
        Ok(rows)
    }

    /// One row by id, expanded and passed through onLoad.
    pub async fn find_one(&self, id: &str, tree: &ExpansionTree, ctx: &RequestContext) -> Result<Option<Row>, AppError> {
        let Some(row) = self.fetch(id).await? else {
            return Ok(None);
        };
        let mut rows = expand_rows(self.store.as_ref(), vec![row], tree).await?;
        let Some(mut row) = rows.pop() else {
            return Ok(None);
        };
        self.on_load(&mut row, ctx).await;
        Ok(Some(row))
    }

    async fn fetch(&self, id: &str) -> Result<Option<Row>, AppError> {
        let query = by_id(id);
        let mut rows = self
            .store
            .find(&self.slug, &query, &SortSpec::default(), Page::one())
            .await?;
        Ok(rows.pop())
    }

    async fn on_load(&self, row: &mut Row, ctx: &RequestContext) {
        let Some(code) = self.methods.source(Hook::OnLoad) else {
            return;
        };
        let context = self.script_context(UserAction::ViewRecord, ExecutionMoment::FormLoad, ctx);
        let outcome = self
            .sandbox
            .handle(code, row, &self.slug, &self.field_slugs, &context)
            .await;
        if !outcome.success {
            tracing::warn!(
                collection = %self.slug,
                id = ?row.get(ID),
                error = ?outcome.error,
                "onLoad script failed"
            );
        }
    }

    pub async fn distinct_ids(&self, query: &StructuredQuery) -> Result<Vec<String>, AppError> {
        self.store.distinct_ids(&self.slug, query).await
    }

    /// Merge `set` into every matching row, bypassing hooks.
    pub async fn update_many(&self, query: &StructuredQuery, set: &Row) -> Result<u64, AppError> {
        self.store.update_many(&self.slug, query, set).await
    }

    /// Soft-delete row `id`.
    pub async fn trash(&self, id: &str) -> Result<(), AppError> {
        let mut set = Row::new();
        set.insert(TRASHED.into(), Value::Bool(true));
        set.insert(TRASHED_AT.into(), Value::String(now_timestamp()));
        self.mark(id, set).await
    }

    pub async fn restore(&self, id: &str) -> Result<(), AppError> {
        let mut set = Row::new();
        set.insert(TRASHED.into(), Value::Bool(false));
        set.insert(TRASHED_AT.into(), Value::Null);
        self.mark(id, set).await
    }

    async fn mark(&self, id: &str, set: Row) -> Result<(), AppError> {
        match self.update_many(&by_id(id), &set).await? {
            0 => Err(AppError::NotFound(format!("row {} in {}", id, self.slug))),
            _ => Ok(()),
        }
    }

    fn script_context(&self, action: UserAction, moment: ExecutionMoment, ctx: &RequestContext) -> ScriptContext {
        ScriptContext {
            user_action: action,
            execution_moment: moment,
            user_id: ctx.user_id.clone(),
            table_id: self.table_id.clone(),
        }
    }
}

fn by_id(id: &str) -> StructuredQuery {
    StructuredQuery::new().with(ID, Condition::Equals(Value::String(id.to_string())))
}

/// Materialize `table`, replacing any model registered under its slug.
///
/// Fails with a configuration error when the table has no slug or no compiled schema.
pub async fn build_table(state: &AppState, table: &Table) -> Result<Arc<LiveModel>, AppError> {
    validate_for_materialization(table)?;
    let lock = state.registry.materialization_lock(&table.slug);
    let _guard = lock.lock().await;
    materialize_locked(state, table).await
}

/// Registered model for `slug`, materializing it from the meta store when missing.
pub async fn get_or_materialize(state: &AppState, slug: &str) -> Result<Arc<LiveModel>, AppError> {
    if let Some(model) = state.registry.get(slug) {
        return Ok(model);
    }
    let lock = state.registry.materialization_lock(slug);
    let _guard = lock.lock().await;
    if let Some(model) = state.registry.get(slug) {
        return Ok(model);
    }
    let table = crate::config::require_table(state, &TableKey::Slug(slug.to_string())).await?;
    materialize_locked(state, &table).await
}

async fn materialize_locked(state: &AppState, table: &Table) -> Result<Arc<LiveModel>, AppError> {
    let schema = validate_for_materialization(table)?.clone();
    state.store.ensure_collection(&table.slug).await?;
    let model = Arc::new(LiveModel::new(table, schema, state.store.clone(), state.sandbox.clone()));
    let replaced = state.registry.register(model.clone()).is_some();
    let hooks: Vec<&str> = [Hook::OnLoad, Hook::BeforeSave, Hook::AfterSave]
        .into_iter()
        .filter(|h| model.has_hook(*h))
        .map(Hook::as_str)
        .collect();
    tracing::info!(
        collection = %table.slug,
        table_id = %table.id,
        attributes = model.schema.len(),
        hooks = ?hooks,
        replaced,
        "table materialized"
    );
    Ok(model)
}
