//! Load table descriptors (with their fields) from the meta store.

use crate::config::{Field, Table, TableKey};
use crate::error::AppError;
use crate::state::AppState;

/// Table with its field list populated, or None when no such table exists.
pub async fn load_table(state: &AppState, key: &TableKey) -> Result<Option<Table>, AppError> {
    state.meta.find_table(key).await
}

/// Like [`load_table`] but a missing table is a `NotFound` error.
pub async fn require_table(state: &AppState, key: &TableKey) -> Result<Table, AppError> {
    load_table(state, key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("table {}", key)))
}

/// Active fields of a table, in authoring order.
pub async fn load_active_fields(state: &AppState, key: &TableKey) -> Result<Vec<Field>, AppError> {
    Ok(require_table(state, key).await?.active_fields())
}
