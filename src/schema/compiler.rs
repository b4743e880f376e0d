//! `build_schema`: ordered field list → storage schema definition.
//!
//! The compiled schema is a cache of the field list and is rebuilt from scratch on every field
//! mutation, so compilation must be deterministic: the same fields always yield an equal
//! (and identically serialized) definition.

use crate::config::{Field, FieldType};
use crate::schema::{map_field_type, Arity, StorageType};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const STORAGE_COLLECTION: &str = "Storage";
pub const REACTION_COLLECTION: &str = "Reaction";
pub const EVALUATION_COLLECTION: &str = "Evaluation";
pub const USER_COLLECTION: &str = "User";

pub const TRASHED: &str = "trashed";
pub const TRASHED_AT: &str = "trashedAt";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDef {
    #[serde(rename = "type")]
    pub storage: StorageType,
    pub arity: Arity,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    /// Collection the stored ids point into. None for a reference that was never configured.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// `Some(Value::Null)` is an explicit null default, distinct from no default.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub default: Option<Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl AttributeDef {
    fn scalar(storage: StorageType) -> Self {
        AttributeDef {
            storage,
            arity: Arity::Single,
            required: false,
            reference: None,
            default: None,
        }
    }

    fn array(storage: StorageType) -> Self {
        AttributeDef {
            arity: Arity::Array,
            ..AttributeDef::scalar(storage)
        }
    }

    fn references(collection: Option<String>) -> Self {
        AttributeDef {
            reference: collection,
            ..AttributeDef::array(StorageType::Reference)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaDefinition {
    attributes: BTreeMap<String, AttributeDef>,
}

impl SchemaDefinition {
    pub fn get(&self, slug: &str) -> Option<&AttributeDef> {
        self.attributes.get(slug)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeDef)> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.attributes.contains_key(slug)
    }
}

/// Compile fields into a schema. Always contains `trashed` and `trashedAt`; one entry per
/// field keyed by slug. Missing relationship/group targets are not errors here.
pub fn build_schema(fields: &[Field]) -> SchemaDefinition {
    let mut attributes = BTreeMap::new();
    attributes.insert(
        TRASHED_AT.to_string(),
        AttributeDef {
            default: Some(Value::Null),
            ..AttributeDef::scalar(StorageType::Date)
        },
    );
    attributes.insert(
        TRASHED.to_string(),
        AttributeDef {
            default: Some(Value::Bool(false)),
            ..AttributeDef::scalar(StorageType::Boolean)
        },
    );

    for field in fields {
        attributes.insert(field.slug.clone(), compile_field(field));
    }

    SchemaDefinition { attributes }
}

fn compile_field(field: &Field) -> AttributeDef {
    let config = &field.configuration;
    let mut def = match field.type_ {
        FieldType::TextShort | FieldType::TextLong => AttributeDef {
            required: config.required,
            ..AttributeDef::scalar(StorageType::String)
        },
        FieldType::Dropdown | FieldType::Category => AttributeDef {
            required: config.required,
            ..AttributeDef::array(StorageType::String)
        },
        FieldType::File => AttributeDef {
            required: config.required,
            ..AttributeDef::references(Some(STORAGE_COLLECTION.into()))
        },
        FieldType::Reaction => AttributeDef::references(Some(REACTION_COLLECTION.into())),
        FieldType::Evaluation => AttributeDef::references(Some(EVALUATION_COLLECTION.into())),
        FieldType::Relationship => AttributeDef {
            required: config.required,
            ..AttributeDef::references(
                field
                    .relationship_target()
                    .map(|t| t.slug.clone())
                    .filter(|s| !s.is_empty()),
            )
        },
        FieldType::FieldGroup => AttributeDef {
            required: config.required,
            ..AttributeDef::references(
                field
                    .group_target()
                    .map(|t| t.slug.clone())
                    .filter(|s| !s.is_empty()),
            )
        },
        FieldType::Date | FieldType::Unknown => {
            let mapping = map_field_type(field.type_, config.multiple);
            AttributeDef {
                required: config.required,
                arity: mapping.arity,
                ..AttributeDef::scalar(mapping.storage)
            }
        }
    };
    if let Some(default) = &config.default_value {
        if !default.is_null() {
            def.default = Some(default.clone());
        }
    }
    def
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RelationshipConfig, TableRef};

    fn relationship(slug: &str, target: Option<&str>) -> Field {
        let mut f = Field::new(format!("id-{}", slug), slug, slug, FieldType::Relationship);
        f.configuration.relationship = Some(RelationshipConfig {
            table: target.map(|t| TableRef { id: format!("tid-{}", t), slug: t.into() }),
            field: None,
            order: None,
        });
        f
    }

    #[test]
    fn empty_field_list_has_only_soft_delete_attributes() {
        let schema = build_schema(&[]);
        assert_eq!(schema.len(), 2);
        let trashed = schema.get(TRASHED).unwrap();
        assert_eq!(trashed.storage, StorageType::Boolean);
        assert_eq!(trashed.default, Some(Value::Bool(false)));
        let trashed_at = schema.get(TRASHED_AT).unwrap();
        assert_eq!(trashed_at.storage, StorageType::Date);
        assert_eq!(trashed_at.default, Some(Value::Null));
    }

    #[test]
    fn compilation_is_deterministic() {
        let mut title = Field::new("f1", "title", "Title", FieldType::TextShort);
        title.configuration.required = true;
        let fields = vec![
            title,
            Field::new("f2", "tags", "Tags", FieldType::Dropdown),
            relationship("author", Some("people")),
            Field::new("f4", "photos", "Photos", FieldType::File),
        ];
        let a = build_schema(&fields);
        let b = build_schema(&fields);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn per_type_rules() {
        let mut reaction = Field::new("r", "likes", "Likes", FieldType::Reaction);
        reaction.configuration.required = true;
        let fields = vec![
            Field::new("f1", "title", "Title", FieldType::TextLong),
            Field::new("f2", "kind", "Kind", FieldType::Category),
            Field::new("f3", "photos", "Photos", FieldType::File),
            reaction,
            relationship("author", Some("people")),
        ];
        let schema = build_schema(&fields);
        assert_eq!(schema.get("title").unwrap().arity, Arity::Single);
        assert_eq!(schema.get("kind").unwrap().arity, Arity::Array);
        assert_eq!(schema.get("photos").unwrap().reference.as_deref(), Some(STORAGE_COLLECTION));
        let likes = schema.get("likes").unwrap();
        assert_eq!(likes.reference.as_deref(), Some(REACTION_COLLECTION));
        assert!(!likes.required);
        assert_eq!(schema.get("author").unwrap().reference.as_deref(), Some("people"));
    }

    #[test]
    fn misconfigured_relationship_still_compiles() {
        let schema = build_schema(&[relationship("author", None)]);
        let author = schema.get("author").unwrap();
        assert_eq!(author.storage, StorageType::Reference);
        assert_eq!(author.reference, None);
    }

    #[test]
    fn unknown_type_respects_multiple() {
        let mut f = Field::new("f1", "sig", "Signature", FieldType::Unknown);
        assert_eq!(build_schema(&[f.clone()]).get("sig").unwrap().arity, Arity::Single);
        f.configuration.multiple = true;
        assert_eq!(build_schema(&[f]).get("sig").unwrap().arity, Arity::Array);
    }

    #[test]
    fn serialized_schema_round_trips_null_default() {
        let schema = build_schema(&[]);
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["trashedAt"].get("default"), Some(&Value::Null));
        let back: SchemaDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(back, schema);
    }
}
