//! Table and field descriptors as authored through the admin UI and kept in the meta store.

use crate::schema::SchemaDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    TextShort,
    TextLong,
    Dropdown,
    Date,
    Relationship,
    File,
    FieldGroup,
    Reaction,
    Evaluation,
    Category,
    /// Types added after this build; compiled as plain strings.
    #[serde(other)]
    Unknown,
}

impl FieldType {
    pub fn is_text(self) -> bool {
        matches!(self, FieldType::TextShort | FieldType::TextLong)
    }

    /// Types whose values are foreign references to rows of another collection.
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            FieldType::Relationship
                | FieldType::File
                | FieldType::FieldGroup
                | FieldType::Reaction
                | FieldType::Evaluation
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    pub id: String,
    #[serde(default)]
    pub slug: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldRef {
    pub id: String,
    #[serde(default)]
    pub slug: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipConfig {
    /// Absent when the admin never finished configuring the field.
    #[serde(default)]
    pub table: Option<TableRef>,
    /// Target field shown as the label of the related row.
    #[serde(default)]
    pub field: Option<FieldRef>,
    #[serde(default)]
    pub order: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub children: Vec<CategoryNode>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfiguration {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub listing: bool,
    #[serde(default)]
    pub filtering: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub relationship: Option<RelationshipConfig>,
    #[serde(default)]
    pub dropdown: Vec<String>,
    #[serde(default)]
    pub category: Vec<CategoryNode>,
    #[serde(default)]
    pub group: Option<TableRef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: FieldType,
    #[serde(default)]
    pub configuration: FieldConfiguration,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub trashed_at: Option<DateTime<Utc>>,
}

impl Field {
    pub fn new(id: impl Into<String>, slug: impl Into<String>, name: impl Into<String>, type_: FieldType) -> Self {
        Field {
            id: id.into(),
            slug: slug.into(),
            name: name.into(),
            type_,
            configuration: FieldConfiguration::default(),
            trashed: false,
            trashed_at: None,
        }
    }

    /// Collection slug of the relationship target, if configured.
    pub fn relationship_target(&self) -> Option<&TableRef> {
        self.configuration
            .relationship
            .as_ref()
            .and_then(|r| r.table.as_ref())
    }

    pub fn group_target(&self) -> Option<&TableRef> {
        self.configuration.group.as_ref()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    #[default]
    #[serde(rename = "table")]
    Table,
    #[serde(rename = "field-group")]
    FieldGroup,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldOrdering {
    #[serde(default)]
    pub order_list: Vec<String>,
    #[serde(default)]
    pub order_form: Vec<String>,
}

/// Presentation settings; storage ignores them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableConfiguration {
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub collaboration: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub administrators: Vec<String>,
    #[serde(default)]
    pub fields: FieldOrdering,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodScript {
    #[serde(default)]
    pub code: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    OnLoad,
    BeforeSave,
    AfterSave,
}

impl Hook {
    pub fn as_str(self) -> &'static str {
        match self {
            Hook::OnLoad => "onLoad",
            Hook::BeforeSave => "beforeSave",
            Hook::AfterSave => "afterSave",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMethods {
    #[serde(default)]
    pub on_load: Option<MethodScript>,
    #[serde(default)]
    pub before_save: Option<MethodScript>,
    #[serde(default)]
    pub after_save: Option<MethodScript>,
}

impl TableMethods {
    /// Script source for a hook, or None when it is missing or blank.
    pub fn source(&self, hook: Hook) -> Option<&str> {
        let script = match hook {
            Hook::OnLoad => self.on_load.as_ref(),
            Hook::BeforeSave => self.before_save.as_ref(),
            Hook::AfterSave => self.after_save.as_ref(),
        }?;
        let code = script.code.as_str();
        (!code.trim().is_empty()).then_some(code)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: TableKind,
    /// Compiled mirror of `fields`; regenerated on every field mutation.
    #[serde(rename = "_schema", default)]
    pub schema: Option<SchemaDefinition>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub configuration: TableConfiguration,
    #[serde(default)]
    pub methods: TableMethods,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub trashed_at: Option<DateTime<Utc>>,
}

impl Table {
    pub fn new(id: impl Into<String>, slug: impl Into<String>, name: impl Into<String>) -> Self {
        Table {
            id: id.into(),
            slug: slug.into(),
            name: name.into(),
            description: None,
            logo: None,
            kind: TableKind::Table,
            schema: None,
            fields: Vec::new(),
            configuration: TableConfiguration::default(),
            methods: TableMethods::default(),
            trashed: false,
            trashed_at: None,
        }
    }

    pub fn active_fields(&self) -> Vec<Field> {
        self.fields.iter().filter(|f| !f.trashed).cloned().collect()
    }

    pub fn active_field_slugs(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| !f.trashed)
            .map(|f| f.slug.clone())
            .collect()
    }

    pub fn field_by_id(&self, id: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }
}

/// Lookup key for tables in the meta store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableKey {
    Id(String),
    Slug(String),
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableKey::Id(id) => write!(f, "id '{}'", id),
            TableKey::Slug(slug) => write!(f, "slug '{}'", slug),
        }
    }
}
