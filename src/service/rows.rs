//! Row access for callers holding a table slug and a flat request payload.

use crate::config::{require_table, TableKey};
use crate::error::AppError;
use crate::materialize::{get_or_materialize, RequestContext};
use crate::populate::build_table_populate;
use crate::query::{build_order, build_query, Condition};
use crate::schema::TRASHED;
use crate::state::AppState;
use crate::store::{Page, Row};
use serde_json::Value;
use std::collections::HashMap;

pub struct RowService;

impl RowService {
    /// Filter, sort, page and expand rows of `slug` from a flat payload.
    ///
    /// Trashed rows are left out unless the payload asks for them with `trashed=true`.
    pub async fn list(
        state: &AppState,
        slug: &str,
        payload: &HashMap<String, String>,
        page: Page,
        ctx: &RequestContext,
    ) -> Result<Vec<Row>, AppError> {
        let table = require_table(state, &TableKey::Slug(slug.to_string())).await?;
        let model = get_or_materialize(state, slug).await?;
        let fields = model.fields();

        let mut query = build_query(state, payload, fields).await?;
        if query.get(TRASHED).is_none() {
            query = query.with(TRASHED, Condition::Equals(Value::Bool(false)));
        }
        let order = build_order(payload, fields);
        let tree = build_table_populate(state, &table).await?;
        tracing::debug!(collection = %slug, conditions = query.conditions.len(), sort = order.0.len(), "listing rows");
        model.find(&query, &order, page, &tree, ctx).await
    }

    /// One row with its references expanded.
    pub async fn get(state: &AppState, slug: &str, id: &str, ctx: &RequestContext) -> Result<Row, AppError> {
        let table = require_table(state, &TableKey::Slug(slug.to_string())).await?;
        let model = get_or_materialize(state, slug).await?;
        let tree = build_table_populate(state, &table).await?;
        model
            .find_one(id, &tree, ctx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("row {} in {}", id, slug)))
    }

    pub async fn create(state: &AppState, slug: &str, row: Row, ctx: &RequestContext) -> Result<Row, AppError> {
        get_or_materialize(state, slug).await?.create(row, ctx).await
    }

    pub async fn save(state: &AppState, slug: &str, id: &str, changes: Row, ctx: &RequestContext) -> Result<Row, AppError> {
        get_or_materialize(state, slug).await?.save(id, changes, ctx).await
    }

    pub async fn trash(state: &AppState, slug: &str, id: &str) -> Result<(), AppError> {
        get_or_materialize(state, slug).await?.trash(id).await
    }

    pub async fn restore(state: &AppState, slug: &str, id: &str) -> Result<(), AppError> {
        get_or_materialize(state, slug).await?.restore(id).await
    }
}
