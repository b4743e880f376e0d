//! DDL for the `_sys_*` metadata tables and for materialized collection tables.

use crate::error::AppError;
use crate::settings::Settings;
use crate::sql::{qualified_table, quoted};
use sqlx::PgPool;

/// Metadata tables. Each row is a JSONB payload keyed by id, versioned, with a `_history` copy.
pub const SYS_TABLES: &str = "_sys_tables";
pub const SYS_FIELDS: &str = "_sys_fields";

/// Create the meta and data schemas if not exists, then the `_sys_*` tables.
pub async fn ensure_sys_tables(pool: &PgPool, settings: &Settings) -> Result<(), AppError> {
    for schema in [&settings.meta_schema, &settings.data_schema] {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(schema)))
            .execute(pool)
            .await?;
    }

    for table in [SYS_TABLES, SYS_FIELDS] {
        let q_table = qualified_table(&settings.meta_schema, table);
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                slug TEXT,
                payload JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                version BIGINT NOT NULL DEFAULT 1
            )
            "#,
            q_table
        );
        sqlx::query(&ddl).execute(pool).await?;

        let history_table = qualified_table(&settings.meta_schema, &format!("{}_history", table));
        let history_ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT NOT NULL,
                payload JSONB NOT NULL,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (id, version)
            )
            "#,
            history_table
        );
        sqlx::query(&history_ddl).execute(pool).await?;
    }

    let slug_index = format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (slug)",
        quoted("_sys_tables_slug_key"),
        qualified_table(&settings.meta_schema, SYS_TABLES)
    );
    sqlx::query(&slug_index).execute(pool).await?;
    tracing::debug!(schema = %settings.meta_schema, "sys tables ensured");
    Ok(())
}

/// Create the physical table backing one collection. Idempotent.
pub async fn ensure_collection_table(pool: &PgPool, schema: &str, collection: &str) -> Result<(), AppError> {
    let full_name = qualified_table(schema, collection);
    let ddl = collection_ddl(&full_name);
    sqlx::query(&ddl).execute(pool).await?;
    let index = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING gin (data)",
        quoted(&format!("{}_data_gin", collection)),
        full_name
    );
    // A missing GIN index only costs speed.
    if let Err(e) = sqlx::query(&index).execute(pool).await {
        tracing::warn!(collection = %collection, error = %e, "could not create data index");
    }
    Ok(())
}

fn collection_ddl(full_name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        full_name,
        [
            "id TEXT PRIMARY KEY",
            "data JSONB NOT NULL DEFAULT '{}'::jsonb",
            "creator TEXT",
            "created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()",
            "updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()",
        ]
        .join(",\n  ")
    )
}
