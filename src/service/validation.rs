//! Row validation and casting against a compiled schema.

use crate::config::Field;
use crate::error::AppError;
use crate::query::parse_timestamp;
use crate::schema::{Arity, AttributeDef, SchemaDefinition, StorageType};
use crate::store::Row;
use chrono::SecondsFormat;
use serde_json::{Number, Value};

pub struct RowValidator;

impl RowValidator {
    /// Fill attributes the row does not carry with their schema default.
    pub fn apply_defaults(row: &mut Row, schema: &SchemaDefinition) {
        for (slug, def) in schema.iter() {
            if let Some(default) = &def.default {
                if !row.contains_key(slug) {
                    row.insert(slug.clone(), default.clone());
                }
            }
        }
    }

    /// Cast every schema attribute present in `row` to its storage shape, then enforce
    /// `required` and per-field formats. Attributes outside the schema pass through.
    pub fn validate(row: &mut Row, schema: &SchemaDefinition, fields: &[Field]) -> Result<(), AppError> {
        for (slug, def) in schema.iter() {
            if let Some(value) = row.get_mut(slug) {
                let cast = cast_value(slug, value.take(), def)?;
                *value = cast;
            }
            if def.required && is_blank(row.get(slug)) {
                return Err(AppError::Validation(format!("{} is required", slug)));
            }
        }
        for field in fields {
            if let (Some(format), Some(v)) = (&field.configuration.format, row.get(&field.slug)) {
                validate_format(&field.slug, v, format)?;
            }
        }
        Ok(())
    }
}

fn is_blank(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

fn cast_value(slug: &str, v: Value, def: &AttributeDef) -> Result<Value, AppError> {
    match def.arity {
        Arity::Array => match v {
            Value::Null => Ok(Value::Array(Vec::new())),
            Value::Array(items) => items
                .into_iter()
                .map(|item| cast_scalar(slug, item, def.storage))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            scalar => Ok(Value::Array(vec![cast_scalar(slug, scalar, def.storage)?])),
        },
        Arity::Single => match v {
            Value::Array(mut items) if items.len() <= 1 => match items.pop() {
                Some(item) => cast_scalar(slug, item, def.storage),
                None => Ok(Value::Null),
            },
            Value::Array(_) => Err(AppError::Validation(format!("{} accepts a single value", slug))),
            scalar => cast_scalar(slug, scalar, def.storage),
        },
    }
}

fn cast_scalar(slug: &str, v: Value, storage: StorageType) -> Result<Value, AppError> {
    if v.is_null() {
        return Ok(v);
    }
    match storage {
        StorageType::String => match v {
            Value::String(_) => Ok(v),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(AppError::Validation(format!("{} must be text", slug))),
        },
        StorageType::Reference => match v {
            Value::String(_) => Ok(v),
            Value::Object(ref obj) => match obj.get("id").and_then(Value::as_str) {
                Some(id) => Ok(Value::String(id.to_string())),
                None => Err(AppError::Validation(format!("{} must reference a row id", slug))),
            },
            _ => Err(AppError::Validation(format!("{} must reference a row id", slug))),
        },
        StorageType::Number => match v {
            Value::Number(_) => Ok(v),
            Value::String(ref s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| AppError::Validation(format!("{} must be a number", slug))),
            _ => Err(AppError::Validation(format!("{} must be a number", slug))),
        },
        StorageType::Boolean => match v {
            Value::Bool(_) => Ok(v),
            Value::String(ref s) if s == "true" => Ok(Value::Bool(true)),
            Value::String(ref s) if s == "false" => Ok(Value::Bool(false)),
            _ => Err(AppError::Validation(format!("{} must be a boolean", slug))),
        },
        StorageType::Date => match v.as_str().and_then(parse_timestamp) {
            Some(at) => Ok(Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))),
            None => Err(AppError::Validation(format!("{} must be a valid date", slug))),
        },
    }
}

fn validate_format(col: &str, v: &Value, format: &str) -> Result<(), AppError> {
    let values: Vec<&str> = match v {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    for s in values {
        match format.to_lowercase().as_str() {
            "email" => {
                if !s.contains('@') || s.len() < 3 {
                    return Err(AppError::Validation(format!("{} must be a valid email", col)));
                }
            }
            "uuid" => {
                if uuid::Uuid::parse_str(s).is_err() {
                    return Err(AppError::Validation(format!("{} must be a valid UUID", col)));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
