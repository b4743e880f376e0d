//! Shared engine state and the live-model registry.

use crate::email::EmailSender;
use crate::error::AppError;
use crate::materialize::LiveModel;
use crate::script::ScriptSandbox;
use crate::settings::Settings;
use crate::store::{CollectionStore, MemoryCollectionStore, MemoryMetaStore, MetaStore};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    pub meta: Arc<dyn MetaStore>,
    pub store: Arc<dyn CollectionStore>,
    pub registry: Arc<ModelRegistry>,
    pub sandbox: Arc<ScriptSandbox>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        store: Arc<dyn CollectionStore>,
        email: Arc<dyn EmailSender>,
        settings: Settings,
    ) -> Self {
        let sandbox = ScriptSandbox::new(email, &settings);
        AppState {
            meta,
            store,
            registry: Arc::new(ModelRegistry::default()),
            sandbox: Arc::new(sandbox),
            settings: Arc::new(settings),
        }
    }

    /// Engine over the in-memory stores.
    pub fn in_memory(email: Arc<dyn EmailSender>, settings: Settings) -> Self {
        Self::new(
            Arc::new(MemoryMetaStore::new()),
            Arc::new(MemoryCollectionStore::new()),
            email,
            settings,
        )
    }

    /// Run a recursive resolution under the configured bound.
    pub async fn within_resolve_timeout<T, F>(&self, what: &str, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        within(self.settings.resolve_timeout, what, fut).await
    }
}

pub(crate) async fn within<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!("{} exceeded {:?}", what, limit))),
    }
}

/// Process-wide map from collection slug to its live model.
///
/// Models are immutable once built; re-materialization swaps the whole `Arc` under the write
/// lock, so a collection never has two hook sets active at once. Materialization of one slug is
/// serialized through a per-slug async mutex.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<LiveModel>>>,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelRegistry {
    pub fn get(&self, slug: &str) -> Option<Arc<LiveModel>> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(slug)
            .cloned()
    }

    /// Replace (or add) the registration for `model.slug`, returning the previous model.
    pub fn register(&self, model: Arc<LiveModel>) -> Option<Arc<LiveModel>> {
        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model.slug().to_string(), model)
    }

    pub fn remove(&self, slug: &str) -> Option<Arc<LiveModel>> {
        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(slug)
    }

    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self
            .models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        slugs.sort();
        slugs
    }

    /// Lock guarding materialization of one slug.
    pub(crate) fn materialization_lock(&self, slug: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(slug.to_string())
            .or_default()
            .clone()
    }
}
