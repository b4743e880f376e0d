//! Descriptor validation: materialization preconditions and field input checks.

use crate::config::{Field, FieldType, Table};
use crate::error::ConfigError;
use crate::schema::SchemaDefinition;

/// A table can only be materialized with a slug and a compiled schema. Both failures are
/// caller bugs and are never retried.
pub fn validate_for_materialization(table: &Table) -> Result<&SchemaDefinition, ConfigError> {
    if table.slug.trim().is_empty() {
        return Err(ConfigError::SlugNotFound);
    }
    table.schema.as_ref().ok_or(ConfigError::SchemaNotFound)
}

/// Checks a field about to join `table`: non-empty name and slug, unique slug among the
/// table's fields (trashed ones included, their data is still stored under the slug).
pub fn validate_new_field(table: &Table, field: &Field) -> Result<(), ConfigError> {
    if field.name.trim().is_empty() {
        return Err(ConfigError::Validation("field name is required".into()));
    }
    if field.slug.is_empty() {
        return Err(ConfigError::Validation(format!(
            "field name '{}' produces an empty slug",
            field.name
        )));
    }
    if is_reserved_slug(&field.slug) {
        return Err(ConfigError::Validation(format!(
            "'{}' is reserved and cannot be used as a field slug",
            field.slug
        )));
    }
    if table.fields.iter().any(|f| f.id != field.id && f.slug == field.slug) {
        return Err(ConfigError::Validation(format!(
            "table '{}' already has a field with slug '{}'",
            table.slug, field.slug
        )));
    }
    if field.type_ == FieldType::Dropdown && field.configuration.dropdown.is_empty() {
        tracing::debug!(field = %field.slug, "dropdown field created without options");
    }
    Ok(())
}

/// Row attributes managed by the engine itself.
pub fn is_reserved_slug(slug: &str) -> bool {
    matches!(
        slug,
        "id" | "trashed" | "trashed-at" | "trashedAt" | "creator" | "createdAt" | "updatedAt" | "search"
    )
}
