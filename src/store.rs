//! Storage collaborators: the meta store (tables and fields) and the collection store (rows of
//! materialized tables). Postgres and in-memory implementations live in the submodules.

mod memory;
mod postgres;

pub use memory::{MemoryCollectionStore, MemoryMetaStore};
pub use postgres::{PgCollectionStore, PgMetaStore};

use crate::config::{Field, Table, TableKey};
use crate::error::AppError;
use crate::query::{SortSpec, StructuredQuery};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::ConnectOptions;
use std::collections::HashMap;
use std::str::FromStr;

/// One record of a materialized collection: field values keyed by slug plus base attributes.
pub type Row = Map<String, Value>;

pub const ID: &str = "id";
pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";
pub const CREATOR: &str = "creator";

/// Attributes owned by the store rather than the row's data.
pub const BASE_ATTRIBUTES: &[&str] = &[ID, CREATED_AT, UPDATED_AT, CREATOR];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl Page {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Page { limit, offset }
    }

    pub fn one() -> Self {
        Page { limit: Some(1), offset: None }
    }
}

/// Table Store + Field Store.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Table with its fields populated, in authoring order.
    async fn find_table(&self, key: &TableKey) -> Result<Option<Table>, AppError>;
    /// Create or replace a table and upsert every field it lists. Returns the stored version.
    async fn save_table(&self, table: &Table) -> Result<i64, AppError>;
    async fn find_field(&self, id: &str) -> Result<Option<Field>, AppError>;
    async fn save_field(&self, table_id: &str, field: &Field) -> Result<(), AppError>;
    async fn list_tables(&self) -> Result<Vec<Table>, AppError>;
}

/// Generic collection store: one physical collection per materialized table slug.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    async fn ensure_collection(&self, collection: &str) -> Result<(), AppError>;
    /// Insert a row; an `id` is generated when absent. Returns the stored row.
    async fn insert(&self, collection: &str, row: Row) -> Result<Row, AppError>;
    /// Replace the data of row `id`. None when it does not exist.
    async fn replace(&self, collection: &str, id: &str, row: Row) -> Result<Option<Row>, AppError>;
    async fn find(
        &self,
        collection: &str,
        query: &StructuredQuery,
        order: &SortSpec,
        page: Page,
    ) -> Result<Vec<Row>, AppError>;
    async fn find_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Row>, AppError>;
    async fn distinct_ids(&self, collection: &str, query: &StructuredQuery) -> Result<Vec<String>, AppError>;
    /// Merge `set` into every matching row. Returns the number of rows touched.
    async fn update_many(&self, collection: &str, query: &StructuredQuery, set: &Row) -> Result<u64, AppError>;
    /// Move the stored value of attribute `from` to `to` in every row that has it.
    async fn rename_attribute(&self, collection: &str, from: &str, to: &str) -> Result<u64, AppError>;
}

pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Row data without store-owned attributes.
pub(crate) fn row_data(row: &Row) -> Row {
    row.iter()
        .filter(|(k, _)| !BASE_ATTRIBUTES.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Table payload as persisted: the field list is stored as ids.
pub(crate) fn table_payload(table: &Table) -> Result<Value, AppError> {
    let mut payload = serde_json::to_value(table)?;
    let ids: Vec<Value> = table.fields.iter().map(|f| Value::String(f.id.clone())).collect();
    if let Value::Object(obj) = &mut payload {
        obj.insert("fields".into(), Value::Array(ids));
    }
    Ok(payload)
}

/// Inverse of [`table_payload`]. Field ids without a stored field are dropped.
pub(crate) fn table_from_payload(mut payload: Value, fields_by_id: &HashMap<String, Field>) -> Result<Table, AppError> {
    let ids: Vec<String> = payload
        .get("fields")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    if let Value::Object(obj) = &mut payload {
        obj.insert("fields".into(), Value::Array(Vec::new()));
    }
    let mut table: Table = serde_json::from_value(payload)?;
    for id in ids {
        match fields_by_id.get(&id) {
            Some(field) => table.fields.push(field.clone()),
            None => tracing::warn!(table = %table.slug, field = %id, "table lists a field that is not stored"),
        }
    }
    Ok(table)
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| AppError::BadRequest(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        tracing::info!(database = %db_name, "creating database");
        sqlx::query(&format!("CREATE DATABASE {}", crate::sql::quoted(&db_name)))
            .execute(&mut conn)
            .await?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| AppError::BadRequest("DATABASE_URL: no path".into()))?
        + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldType;

    #[test]
    fn db_name_is_split_from_url() {
        let (admin, name) = parse_db_name_from_url("postgres://u:p@host:5432/app?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://u:p@host:5432/postgres");
        assert_eq!(name, "app");
    }

    #[test]
    fn table_payload_stores_field_ids() {
        let mut table = Table::new("t1", "posts", "Posts");
        let title = Field::new("f1", "title", "Title", FieldType::TextShort);
        table.fields.push(title.clone());
        let payload = table_payload(&table).unwrap();
        assert_eq!(payload["fields"], serde_json::json!(["f1"]));

        let fields: HashMap<String, Field> = [("f1".to_string(), title)].into_iter().collect();
        let back = table_from_payload(payload, &fields).unwrap();
        assert_eq!(back, table);
    }
}
