mod common;

use async_trait::async_trait;
use common::Outbox;
use dyntable_sdk::config::MethodScript;
use dyntable_sdk::{
    build_schema, build_table, get_or_materialize, AppError, AppState, CollectionStore, Field, FieldType,
    MemoryCollectionStore, MemoryMetaStore, MetaStore, Page, Row, Settings, SortSpec, StructuredQuery, Table,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory store that counts collection setups and holds each one open long enough for
/// concurrent callers to pile up behind it.
struct SlowSetupStore {
    inner: MemoryCollectionStore,
    setups: AtomicUsize,
}

#[async_trait]
impl CollectionStore for SlowSetupStore {
    async fn ensure_collection(&self, collection: &str) -> Result<(), AppError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        self.inner.ensure_collection(collection).await
    }

    async fn insert(&self, collection: &str, row: Row) -> Result<Row, AppError> {
        self.inner.insert(collection, row).await
    }

    async fn replace(&self, collection: &str, id: &str, row: Row) -> Result<Option<Row>, AppError> {
        self.inner.replace(collection, id, row).await
    }

    async fn find(
        &self,
        collection: &str,
        query: &StructuredQuery,
        order: &SortSpec,
        page: Page,
    ) -> Result<Vec<Row>, AppError> {
        self.inner.find(collection, query, order, page).await
    }

    async fn find_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Row>, AppError> {
        self.inner.find_by_ids(collection, ids).await
    }

    async fn distinct_ids(&self, collection: &str, query: &StructuredQuery) -> Result<Vec<String>, AppError> {
        self.inner.distinct_ids(collection, query).await
    }

    async fn update_many(&self, collection: &str, query: &StructuredQuery, set: &Row) -> Result<u64, AppError> {
        self.inner.update_many(collection, query, set).await
    }

    async fn rename_attribute(&self, collection: &str, from: &str, to: &str) -> Result<u64, AppError> {
        self.inner.rename_attribute(collection, from, to).await
    }
}

fn posts() -> Table {
    let mut table = Table::new("t-posts", "posts", "Posts");
    table.fields.push(Field::new("f-title", "title", "Title", FieldType::TextShort));
    table.schema = Some(build_schema(&table.fields));
    table
}

async fn stored_posts() -> (AppState, Arc<SlowSetupStore>) {
    let store = Arc::new(SlowSetupStore {
        inner: MemoryCollectionStore::new(),
        setups: AtomicUsize::new(0),
    });
    let state = AppState::new(
        Arc::new(MemoryMetaStore::new()),
        store.clone(),
        Arc::new(Outbox::default()),
        Settings::default(),
    );
    state.meta.save_table(&posts()).await.unwrap();
    (state, store)
}

#[tokio::test]
async fn concurrent_lookups_materialize_once() {
    let (state, store) = stored_posts().await;

    let (a, b, c, d) = tokio::join!(
        get_or_materialize(&state, "posts"),
        get_or_materialize(&state, "posts"),
        get_or_materialize(&state, "posts"),
        get_or_materialize(&state, "posts"),
    );
    let (a, b, c, d) = (a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &c));
    assert!(Arc::ptr_eq(&a, &d));
    assert_eq!(store.setups.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&a, &state.registry.get("posts").unwrap()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lookups_across_threads_share_one_model() {
    let (state, store) = stored_posts().await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let state = state.clone();
            tokio::spawn(async move { get_or_materialize(&state, "posts").await })
        })
        .collect();
    let mut models = Vec::new();
    for task in tasks {
        models.push(task.await.unwrap().unwrap());
    }
    assert!(models.iter().all(|m| Arc::ptr_eq(m, &models[0])));
    assert_eq!(store.setups.load(Ordering::SeqCst), 1);
    assert_eq!(state.registry.slugs(), vec!["posts".to_string()]);
}

#[tokio::test]
async fn rebuild_racing_lookups_leaves_one_hook_set() {
    let (state, store) = stored_posts().await;
    let mut with_hook = posts();
    with_hook.methods.before_save = Some(MethodScript {
        code: "posts_title = posts_title + '!'".into(),
    });

    let (looked_up, rebuilt) = tokio::join!(get_or_materialize(&state, "posts"), build_table(&state, &with_hook));
    looked_up.unwrap();
    let rebuilt = rebuilt.unwrap();

    let registered = state.registry.get("posts").unwrap();
    assert!(Arc::ptr_eq(&registered, &rebuilt));
    assert!(registered.has_hook(dyntable_sdk::config::Hook::BeforeSave));
    assert_eq!(store.setups.load(Ordering::SeqCst), 2);
}
