//! Dyntable SDK: runtime materialization of admin-defined tables into live, queryable
//! collections with lifecycle scripts.

pub mod config;
pub mod email;
pub mod error;
pub mod materialize;
pub mod migration;
pub mod populate;
pub mod query;
pub mod schema;
pub mod script;
pub mod service;
pub mod settings;
pub mod slug;
pub mod sql;
pub mod state;
pub mod store;

pub use config::{Field, FieldType, Table, TableKey};
pub use email::{EmailMessage, EmailReceipt, EmailSender, LogEmailSender};
pub use error::{AppError, ConfigError};
pub use materialize::{build_table, get_or_materialize, LiveModel, RequestContext};
pub use migration::ensure_sys_tables;
pub use populate::{build_populate, build_table_populate, get_relationship, Expansion, ExpansionTree};
pub use query::{build_order, build_query, normalize, Condition, SortSpec, StructuredQuery};
pub use schema::{build_schema, SchemaDefinition};
pub use script::{ScriptContext, ScriptOutcome, ScriptSandbox};
pub use service::{FieldService, FieldUpdate, NewField, NewTable, RowService, TableService};
pub use settings::Settings;
pub use state::{AppState, ModelRegistry};
pub use store::{
    ensure_database_exists, CollectionStore, MemoryCollectionStore, MemoryMetaStore, MetaStore, Page, PgCollectionStore,
    PgMetaStore, Row,
};

use std::future::Future;
use std::pin::Pin;

/// Boxed future for the recursive resolvers.
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
