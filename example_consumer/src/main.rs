//! Example consumer: a separate Rust project that uses dyntable-sdk as a dependency.
//!
//! Bootstraps the database, defines a small "Tickets" table with a beforeSave script, stores
//! a row and lists it back through the filter translator.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Or from this directory: `cargo run`

use dyntable_sdk::config::{MethodScript, TableMethods};
use dyntable_sdk::{
    ensure_database_exists, ensure_sys_tables, AppState, FieldService, FieldType, LogEmailSender, NewField, NewTable,
    Page, PgCollectionStore, PgMetaStore, RequestContext, Row, RowService, Settings, Table, TableKey, TableService,
};
use std::collections::HashMap;
use std::sync::Arc;

const TICKETS: &str = "tickets";

const BEFORE_SAVE: &str = r#"
const priority = getFieldValue('priority')
if (!priority) {
  setFieldValue('priority', 'normal')
}
if (userAction === 'new_record') {
  tickets_subject = tickets_subject.trim()
}
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dyntable_sdk=info")),
        )
        .init();

    ensure_database_exists(&settings.database_url).await?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await?;
    ensure_sys_tables(&pool, &settings).await?;

    let state = AppState::new(
        Arc::new(PgMetaStore::new(pool.clone(), settings.meta_schema.clone())),
        Arc::new(PgCollectionStore::new(pool.clone(), settings.data_schema.clone())),
        Arc::new(LogEmailSender),
        settings,
    );

    let table = tickets_table(&state).await?;
    tracing::info!(table = %table.slug, fields = ?table.active_field_slugs(), "table ready");

    let ctx = RequestContext::user("example-consumer");
    let mut row = Row::new();
    row.insert("subject".into(), serde_json::json!("  Impressora não imprime  "));
    let stored = RowService::create(&state, TICKETS, row, &ctx).await?;
    tracing::info!(row = %serde_json::Value::Object(stored), "row stored");

    let mut payload = HashMap::new();
    payload.insert("search".to_string(), "impressora".to_string());
    let rows = RowService::list(&state, TICKETS, &payload, Page::new(Some(10), None), &ctx).await?;
    tracing::info!(matches = rows.len(), "search finished");
    Ok(())
}

/// The demo table, created with its fields and script on first run.
async fn tickets_table(state: &AppState) -> Result<Table, dyntable_sdk::AppError> {
    if let Some(table) = state.meta.find_table(&TableKey::Slug(TICKETS.into())).await? {
        dyntable_sdk::build_table(state, &table).await?;
        return Ok(table);
    }
    let table = TableService::create(state, NewTable::named("Tickets")).await?;
    FieldService::create(state, &table.id, NewField::new("Subject", FieldType::TextShort)).await?;
    FieldService::create(state, &table.id, NewField::new("Priority", FieldType::Dropdown)).await?;
    FieldService::create(state, &table.id, NewField::new("Due", FieldType::Date)).await?;
    let methods = TableMethods {
        before_save: Some(MethodScript { code: BEFORE_SAVE.into() }),
        ..TableMethods::default()
    };
    TableService::update_methods(state, &table.id, methods).await
}
