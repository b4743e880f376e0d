//! In-memory meta and collection stores.

use super::{now_timestamp, row_data, CollectionStore, MetaStore, Page, Row, CREATED_AT, CREATOR, ID, UPDATED_AT};
use crate::config::{Field, Table, TableKey};
use crate::error::AppError;
use crate::query::{SortSpec, StructuredQuery};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MetaData {
    /// Table descriptors with an empty field list, plus their field ids in order.
    tables: HashMap<String, (Table, Vec<String>, i64)>,
    fields: HashMap<String, Field>,
}

pub struct MemoryMetaStore {
    data: RwLock<MetaData>,
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(MetaData::default()),
        }
    }
}

fn assemble(table: &Table, field_ids: &[String], fields: &HashMap<String, Field>) -> Table {
    let mut out = table.clone();
    out.fields = field_ids.iter().filter_map(|id| fields.get(id).cloned()).collect();
    out
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn find_table(&self, key: &TableKey) -> Result<Option<Table>, AppError> {
        let data = self.data.read().await;
        let found = match key {
            TableKey::Id(id) => data.tables.get(id),
            TableKey::Slug(slug) => data.tables.values().find(|(t, _, _)| t.slug == *slug),
        };
        Ok(found.map(|(table, ids, _)| assemble(table, ids, &data.fields)))
    }

    async fn save_table(&self, table: &Table) -> Result<i64, AppError> {
        let mut data = self.data.write().await;
        if let Some((other, _, _)) = data.tables.values().find(|(t, _, _)| t.slug == table.slug && t.id != table.id) {
            return Err(AppError::Conflict(format!("table slug '{}' is used by '{}'", table.slug, other.id)));
        }
        for field in &table.fields {
            data.fields.insert(field.id.clone(), field.clone());
        }
        let ids = table.fields.iter().map(|f| f.id.clone()).collect();
        let mut stored = table.clone();
        stored.fields.clear();
        let version = data.tables.get(&table.id).map(|(_, _, v)| v + 1).unwrap_or(1);
        data.tables.insert(table.id.clone(), (stored, ids, version));
        Ok(version)
    }

    async fn find_field(&self, id: &str) -> Result<Option<Field>, AppError> {
        Ok(self.data.read().await.fields.get(id).cloned())
    }

    async fn save_field(&self, table_id: &str, field: &Field) -> Result<(), AppError> {
        let mut data = self.data.write().await;
        data.fields.insert(field.id.clone(), field.clone());
        if let Some((_, ids, _)) = data.tables.get_mut(table_id) {
            if !ids.contains(&field.id) {
                ids.push(field.id.clone());
            }
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<Table>, AppError> {
        let data = self.data.read().await;
        let mut tables: Vec<Table> = data
            .tables
            .values()
            .map(|(t, ids, _)| assemble(t, ids, &data.fields))
            .collect();
        tables.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(tables)
    }
}

/// Rows per collection, in insertion order.
pub struct MemoryCollectionStore {
    data: RwLock<HashMap<String, Vec<Row>>>,
}

impl Default for MemoryCollectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCollectionStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    pub async fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.data.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.data.read().await.get(collection).map(Vec::len).unwrap_or(0)
    }
}

fn row_id(row: &Row) -> Option<&str> {
    row.get(ID).and_then(Value::as_str)
}

#[async_trait]
impl CollectionStore for MemoryCollectionStore {
    async fn ensure_collection(&self, collection: &str) -> Result<(), AppError> {
        self.data.write().await.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn insert(&self, collection: &str, row: Row) -> Result<Row, AppError> {
        let mut data = self.data.write().await;
        let rows = data.entry(collection.to_string()).or_default();
        let id = row_id(&row)
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if rows.iter().any(|r| row_id(r) == Some(id.as_str())) {
            return Err(AppError::Conflict(format!("duplicate id '{}' in {}", id, collection)));
        }
        let now = now_timestamp();
        let mut stored = row_data(&row);
        stored.insert(ID.into(), Value::String(id));
        stored.insert(CREATOR.into(), row.get(CREATOR).cloned().unwrap_or(Value::Null));
        stored.insert(CREATED_AT.into(), Value::String(now.clone()));
        stored.insert(UPDATED_AT.into(), Value::String(now));
        rows.push(stored.clone());
        Ok(stored)
    }

    async fn replace(&self, collection: &str, id: &str, row: Row) -> Result<Option<Row>, AppError> {
        let mut data = self.data.write().await;
        let Some(existing) = data
            .get_mut(collection)
            .and_then(|rows| rows.iter_mut().find(|r| row_id(r) == Some(id)))
        else {
            return Ok(None);
        };
        let mut stored = row_data(&row);
        for key in [ID, CREATED_AT] {
            stored.insert(key.into(), existing.get(key).cloned().unwrap_or(Value::Null));
        }
        let creator = row
            .get(CREATOR)
            .cloned()
            .or_else(|| existing.get(CREATOR).cloned())
            .unwrap_or(Value::Null);
        stored.insert(CREATOR.into(), creator);
        stored.insert(UPDATED_AT.into(), Value::String(now_timestamp()));
        *existing = stored.clone();
        Ok(Some(stored))
    }

    async fn find(
        &self,
        collection: &str,
        query: &StructuredQuery,
        order: &SortSpec,
        page: Page,
    ) -> Result<Vec<Row>, AppError> {
        let data = self.data.read().await;
        let Some(rows) = data.get(collection) else { return Ok(Vec::new()) };
        let mut matched: Vec<Row> = rows.iter().filter(|r| query.matches(r)).cloned().collect();
        if !order.is_empty() {
            matched.sort_by(|a, b| order.compare(a, b));
        }
        let skip = page.offset.unwrap_or(0) as usize;
        let take = page.limit.map(|l| l.min(Page::MAX_LIMIT) as usize).unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(skip).take(take).collect())
    }

    async fn find_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Row>, AppError> {
        let data = self.data.read().await;
        let Some(rows) = data.get(collection) else { return Ok(Vec::new()) };
        Ok(rows
            .iter()
            .filter(|r| row_id(r).map_or(false, |id| ids.iter().any(|i| i == id)))
            .cloned()
            .collect())
    }

    async fn distinct_ids(&self, collection: &str, query: &StructuredQuery) -> Result<Vec<String>, AppError> {
        let data = self.data.read().await;
        let Some(rows) = data.get(collection) else { return Ok(Vec::new()) };
        let ids: BTreeSet<String> = rows
            .iter()
            .filter(|r| query.matches(r))
            .filter_map(|r| row_id(r).map(String::from))
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn update_many(&self, collection: &str, query: &StructuredQuery, set: &Row) -> Result<u64, AppError> {
        let mut data = self.data.write().await;
        let Some(rows) = data.get_mut(collection) else { return Ok(0) };
        let changes = row_data(set);
        let now = now_timestamp();
        let mut count = 0u64;
        for row in rows.iter_mut().filter(|r| query.matches(r)) {
            for (k, v) in &changes {
                row.insert(k.clone(), v.clone());
            }
            row.insert(UPDATED_AT.into(), Value::String(now.clone()));
            count += 1;
        }
        Ok(count)
    }

    async fn rename_attribute(&self, collection: &str, from: &str, to: &str) -> Result<u64, AppError> {
        let mut data = self.data.write().await;
        let Some(rows) = data.get_mut(collection) else { return Ok(0) };
        let mut count = 0u64;
        for row in rows.iter_mut() {
            if let Some(v) = row.remove(from) {
                row.insert(to.to_string(), v);
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Condition;
    use serde_json::json;

    fn row(v: Value) -> Row {
        match v {
            Value::Object(m) => m,
            _ => Row::new(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_id_and_timestamps() {
        let store = MemoryCollectionStore::new();
        let stored = store.insert("posts", row(json!({"title": "a"}))).await.unwrap();
        assert!(stored.get(ID).and_then(Value::as_str).is_some());
        assert!(stored.contains_key(CREATED_AT));
        assert_eq!(stored["title"], json!("a"));
        assert_eq!(store.count("posts").await, 1);
    }

    #[tokio::test]
    async fn replace_keeps_created_at_and_id() {
        let store = MemoryCollectionStore::new();
        let stored = store.insert("posts", row(json!({"id": "p1", "title": "a"}))).await.unwrap();
        let replaced = store
            .replace("posts", "p1", row(json!({"id": "other", "title": "b"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replaced[ID], json!("p1"));
        assert_eq!(replaced[CREATED_AT], stored[CREATED_AT]);
        assert_eq!(replaced["title"], json!("b"));
        assert!(store.replace("posts", "missing", Row::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn distinct_ids_and_rename() {
        let store = MemoryCollectionStore::new();
        store.insert("c", row(json!({"id": "1", "color": "red"}))).await.unwrap();
        store.insert("c", row(json!({"id": "2", "color": "blue"}))).await.unwrap();
        let q = StructuredQuery::new().with("color", Condition::Matches("red".into()));
        assert_eq!(store.distinct_ids("c", &q).await.unwrap(), vec!["1".to_string()]);
        assert_eq!(store.rename_attribute("c", "color", "colour").await.unwrap(), 2);
        let all = store.find("c", &StructuredQuery::new(), &SortSpec::default(), Page::default()).await.unwrap();
        assert!(all.iter().all(|r| r.contains_key("colour") && !r.contains_key("color")));
    }

    #[tokio::test]
    async fn meta_store_rejects_duplicate_slugs() {
        let meta = MemoryMetaStore::new();
        meta.save_table(&Table::new("t1", "posts", "Posts")).await.unwrap();
        let err = meta.save_table(&Table::new("t2", "posts", "Posts")).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert_eq!(meta.save_table(&Table::new("t1", "posts", "Posts 2")).await.unwrap(), 2);
    }
}
