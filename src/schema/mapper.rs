//! Field type → primitive storage type and cardinality.

use crate::config::FieldType;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    String,
    Number,
    Boolean,
    Date,
    /// Id of a row in another collection.
    Reference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arity {
    Single,
    Array,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeMapping {
    pub storage: StorageType,
    pub arity: Arity,
}

/// Total over every field type; unknown types fall back to strings.
pub fn map_field_type(type_: FieldType, multiple: bool) -> TypeMapping {
    let storage = match type_ {
        FieldType::TextShort | FieldType::TextLong | FieldType::Dropdown | FieldType::Category => {
            StorageType::String
        }
        FieldType::Date => StorageType::Date,
        FieldType::Relationship
        | FieldType::File
        | FieldType::FieldGroup
        | FieldType::Reaction
        | FieldType::Evaluation => StorageType::Reference,
        FieldType::Unknown => StorageType::String,
    };
    let arity = if multiple || is_multi_valued(type_) {
        Arity::Array
    } else {
        Arity::Single
    };
    TypeMapping { storage, arity }
}

fn is_multi_valued(type_: FieldType) -> bool {
    matches!(
        type_,
        FieldType::Dropdown
            | FieldType::File
            | FieldType::Relationship
            | FieldType::FieldGroup
            | FieldType::Category
            | FieldType::Reaction
            | FieldType::Evaluation
    )
}
