//! PostgreSQL meta store (`_sys_tables` / `_sys_fields`) and JSONB collection store.

use super::{row_data, table_from_payload, table_payload, CollectionStore, MetaStore, Page, Row};
use super::{CREATED_AT, CREATOR, ID, UPDATED_AT};
use crate::config::{Field, Table, TableKey};
use crate::error::AppError;
use crate::migration::{ensure_collection_table, SYS_FIELDS, SYS_TABLES};
use crate::query::{SortSpec, StructuredQuery};
use crate::sql::{self, qualified_table, QueryBuf};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

pub struct PgMetaStore {
    pool: PgPool,
    schema: String,
}

impl PgMetaStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn table(&self, name: &str) -> String {
        qualified_table(&self.schema, name)
    }

    async fn fields_by_id(&self, ids: &[String]) -> Result<HashMap<String, Field>, AppError> {
        let rows: Vec<(String, Value)> = sqlx::query_as(&format!(
            "SELECT id, payload FROM {} WHERE id = ANY($1)",
            self.table(SYS_FIELDS)
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(id, payload)| Ok((id, serde_json::from_value(payload)?)))
            .collect()
    }

    async fn assemble(&self, payload: Value) -> Result<Table, AppError> {
        let ids: Vec<String> = payload
            .get("fields")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let fields = self.fields_by_id(&ids).await?;
        table_from_payload(payload, &fields)
    }
}

/// Copy the current row to history, then upsert with the next version. Returns that version.
async fn upsert_versioned(
    tx: &mut PgConnection,
    q_table: &str,
    history_table: &str,
    id: &str,
    slug: &str,
    payload: &Value,
) -> Result<i64, AppError> {
    let current: Option<(Value, i64)> = sqlx::query_as(&format!("SELECT payload, version FROM {} WHERE id = $1", q_table))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let new_version = match &current {
        Some((old_payload, v)) if old_payload == payload => return Ok(*v),
        Some((_, v)) => v + 1,
        None => 1,
    };
    if current.is_some() {
        sqlx::query(&format!(
            "INSERT INTO {} (id, payload, version, created_at) SELECT id, payload, version, updated_at FROM {} WHERE id = $1",
            history_table, q_table
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query(&format!(
        "INSERT INTO {} (id, slug, payload, updated_at, version) VALUES ($1, $2, $3, NOW(), $4) \
         ON CONFLICT (id) DO UPDATE SET slug = EXCLUDED.slug, payload = EXCLUDED.payload, \
         updated_at = NOW(), version = EXCLUDED.version",
        q_table
    ))
    .bind(id)
    .bind(slug)
    .bind(payload)
    .bind(new_version)
    .execute(&mut *tx)
    .await?;
    Ok(new_version)
}

#[async_trait]
impl MetaStore for PgMetaStore {
    async fn find_table(&self, key: &TableKey) -> Result<Option<Table>, AppError> {
        let column = match key {
            TableKey::Id(_) => "id",
            TableKey::Slug(_) => "slug",
        };
        let value = match key {
            TableKey::Id(v) | TableKey::Slug(v) => v,
        };
        let row: Option<(Value,)> = sqlx::query_as(&format!(
            "SELECT payload FROM {} WHERE {} = $1",
            self.table(SYS_TABLES),
            column
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((payload,)) => Ok(Some(self.assemble(payload).await?)),
            None => Ok(None),
        }
    }

    async fn save_table(&self, table: &Table) -> Result<i64, AppError> {
        let q_tables = self.table(SYS_TABLES);
        let taken: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT id FROM {} WHERE slug = $1 AND id <> $2",
            q_tables
        ))
        .bind(&table.slug)
        .bind(&table.id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((other,)) = taken {
            return Err(AppError::Conflict(format!("table slug '{}' is used by '{}'", table.slug, other)));
        }

        let mut tx = self.pool.begin().await?;
        let q_fields = self.table(SYS_FIELDS);
        let h_fields = self.table(&format!("{}_history", SYS_FIELDS));
        for field in &table.fields {
            let payload = serde_json::to_value(field)?;
            upsert_versioned(&mut tx, &q_fields, &h_fields, &field.id, &field.slug, &payload).await?;
        }
        let payload = table_payload(table)?;
        let h_tables = self.table(&format!("{}_history", SYS_TABLES));
        let version = upsert_versioned(&mut tx, &q_tables, &h_tables, &table.id, &table.slug, &payload).await?;
        tx.commit().await?;
        tracing::debug!(table = %table.slug, version, "table saved");
        Ok(version)
    }

    async fn find_field(&self, id: &str) -> Result<Option<Field>, AppError> {
        let row: Option<(Value,)> = sqlx::query_as(&format!("SELECT payload FROM {} WHERE id = $1", self.table(SYS_FIELDS)))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(payload,)| serde_json::from_value(payload).map_err(AppError::from))
            .transpose()
    }

    async fn save_field(&self, table_id: &str, field: &Field) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        let payload = serde_json::to_value(field)?;
        upsert_versioned(
            &mut tx,
            &self.table(SYS_FIELDS),
            &self.table(&format!("{}_history", SYS_FIELDS)),
            &field.id,
            &field.slug,
            &payload,
        )
        .await?;
        // Append the id to the owning table's field list when it is new.
        sqlx::query(&format!(
            "UPDATE {} SET payload = jsonb_set(payload, '{{fields}}', COALESCE(payload->'fields', '[]'::jsonb) || to_jsonb($2::text)), \
             updated_at = NOW() WHERE id = $1 AND NOT COALESCE(payload->'fields', '[]'::jsonb) ? $2",
            self.table(SYS_TABLES)
        ))
        .bind(table_id)
        .bind(&field.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<Table>, AppError> {
        let rows: Vec<(Value,)> = sqlx::query_as(&format!("SELECT payload FROM {} ORDER BY slug", self.table(SYS_TABLES)))
            .fetch_all(&self.pool)
            .await?;
        let mut tables = Vec::with_capacity(rows.len());
        for (payload,) in rows {
            tables.push(self.assemble(payload).await?);
        }
        Ok(tables)
    }
}

type StoredRow = (String, Value, Option<String>, DateTime<Utc>, DateTime<Utc>);

fn into_row((id, data, creator, created_at, updated_at): StoredRow) -> Row {
    let mut row = match data {
        Value::Object(map) => map,
        _ => Row::new(),
    };
    row.insert(ID.into(), Value::String(id));
    row.insert(CREATOR.into(), creator.map_or(Value::Null, Value::String));
    row.insert(CREATED_AT.into(), Value::String(created_at.to_rfc3339_opts(SecondsFormat::Millis, true)));
    row.insert(UPDATED_AT.into(), Value::String(updated_at.to_rfc3339_opts(SecondsFormat::Millis, true)));
    row
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .map_or(false, |code| code == "23505")
}

/// Reference collections such as `Storage` or `User` may live outside this schema.
fn is_undefined_table(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .map_or(false, |code| code == "42P01")
}

pub struct PgCollectionStore {
    pool: PgPool,
    schema: String,
}

impl PgCollectionStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn table(&self, collection: &str) -> String {
        qualified_table(&self.schema, collection)
    }

    async fn fetch_rows(&self, q: QueryBuf) -> Result<Vec<Row>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query_as::<_, StoredRow>(&q.sql);
        for p in q.params {
            query = query.bind(p);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(into_row).collect())
    }

    async fn execute(&self, q: QueryBuf) -> Result<u64, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "execute");
        let mut query = sqlx::query(&q.sql);
        for p in q.params {
            query = query.bind(p);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }
}

fn creator_of(row: &Row) -> Option<&str> {
    row.get(CREATOR).and_then(Value::as_str)
}

#[async_trait]
impl CollectionStore for PgCollectionStore {
    async fn ensure_collection(&self, collection: &str) -> Result<(), AppError> {
        ensure_collection_table(&self.pool, &self.schema, collection).await
    }

    async fn insert(&self, collection: &str, row: Row) -> Result<Row, AppError> {
        let id = row
            .get(ID)
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let q = sql::insert(&self.table(collection), &id, &row_data(&row), creator_of(&row));
        match self.fetch_rows(q).await {
            Ok(mut rows) => rows
                .pop()
                .ok_or_else(|| AppError::NotFound(format!("inserted row {} not returned", id))),
            Err(AppError::Db(e)) if is_unique_violation(&e) => {
                Err(AppError::Conflict(format!("duplicate id '{}' in {}", id, collection)))
            }
            Err(e) => Err(e),
        }
    }

    async fn replace(&self, collection: &str, id: &str, row: Row) -> Result<Option<Row>, AppError> {
        let q = sql::replace(&self.table(collection), id, &row_data(&row), creator_of(&row));
        Ok(self.fetch_rows(q).await?.pop())
    }

    async fn find(
        &self,
        collection: &str,
        query: &StructuredQuery,
        order: &SortSpec,
        page: Page,
    ) -> Result<Vec<Row>, AppError> {
        self.fetch_rows(sql::select(&self.table(collection), query, order, page)).await
    }

    async fn find_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Row>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        match self.fetch_rows(sql::select_by_ids(&self.table(collection), ids)).await {
            Err(AppError::Db(e)) if is_undefined_table(&e) => {
                tracing::debug!(collection = %collection, "referenced collection does not exist");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn distinct_ids(&self, collection: &str, query: &StructuredQuery) -> Result<Vec<String>, AppError> {
        let q = sql::select_distinct_ids(&self.table(collection), query);
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query_as::<_, (String,)>(&q.sql);
        for p in q.params {
            query = query.bind(p);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn update_many(&self, collection: &str, query: &StructuredQuery, set: &Row) -> Result<u64, AppError> {
        self.execute(sql::update_many(&self.table(collection), query, &row_data(set)))
            .await
    }

    async fn rename_attribute(&self, collection: &str, from: &str, to: &str) -> Result<u64, AppError> {
        let count = self
            .execute(sql::rename_attribute(&self.table(collection), from, to))
            .await?;
        tracing::info!(collection = %collection, from = %from, to = %to, rows = count, "attribute renamed");
        Ok(count)
    }
}
