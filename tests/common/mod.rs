#![allow(dead_code)]

use async_trait::async_trait;
use dyntable_sdk::{
    AppError, AppState, EmailMessage, EmailReceipt, EmailSender, Field, FieldService, FieldType, NewField, NewTable,
    Row, Settings, Table, TableService,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Email sender that keeps every message it is handed.
#[derive(Default)]
pub struct Outbox(Mutex<Vec<EmailMessage>>);

impl Outbox {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for Outbox {
    async fn send(&self, message: EmailMessage) -> Result<EmailReceipt, AppError> {
        let accepted = message.to.clone();
        self.0.lock().unwrap().push(message);
        Ok(EmailReceipt {
            accepted,
            ..Default::default()
        })
    }
}

pub fn state() -> (AppState, Arc<Outbox>) {
    let outbox = Arc::new(Outbox::default());
    let settings = Settings {
        script_timeout: Duration::from_millis(2_000),
        script_memory_limit: 16 * 1024 * 1024,
        resolve_timeout: Duration::from_millis(2_000),
        ..Settings::default()
    };
    (AppState::in_memory(outbox.clone(), settings), outbox)
}

pub fn row(v: Value) -> Row {
    match v {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

pub async fn table(state: &AppState, name: &str) -> Table {
    TableService::create(state, NewTable::named(name)).await.unwrap()
}

pub async fn field(state: &AppState, table: &Table, name: &str, type_: FieldType) -> Field {
    FieldService::create(state, &table.id, NewField::new(name, type_)).await.unwrap()
}

pub async fn relationship(state: &AppState, table: &Table, name: &str, target: &Table) -> Field {
    let mut input = NewField::new(name, FieldType::Relationship);
    input.configuration = serde_json::from_value(serde_json::json!({
        "relationship": { "table": { "id": target.id, "slug": target.slug } }
    }))
    .unwrap();
    FieldService::create(state, &table.id, input).await.unwrap()
}

pub fn id_of(row: &Row) -> String {
    row["id"].as_str().unwrap().to_string()
}
