//! Builds parameterized SELECT, INSERT and UPDATE over JSONB collection tables.
//!
//! A collection table is `(id, data, creator, created_at, updated_at)`; field values live in
//! `data`. Identifiers come from materialized slugs; values are always parameters.

use super::params::PgBindValue;
use crate::query::{Condition, SortDirection, SortSpec, StructuredQuery};
use crate::store::{Page, Row, CREATED_AT, CREATOR, ID, UPDATED_AT};
use serde_json::Value;

/// Quote identifier for PostgreSQL.
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Full qualified table name.
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quoted(schema), quoted(table))
}

/// String literal for a JSON key.
fn key_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub const SELECT_COLUMNS: &str = "id, data, creator, created_at, updated_at";

pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<PgBindValue>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: PgBindValue) -> u32 {
        self.params.push(v);
        self.params.len() as u32
    }
}

/// Base attributes are real columns; everything else is a key of `data`.
fn base_column(attr: &str) -> Option<&'static str> {
    match attr {
        ID => Some("id"),
        CREATOR => Some("creator"),
        CREATED_AT => Some("created_at"),
        UPDATED_AT => Some("updated_at"),
        _ => None,
    }
}

fn condition_sql(q: &mut QueryBuf, attr: &str, cond: &Condition) -> String {
    if let Some(col) = base_column(attr) {
        return base_condition_sql(q, col, cond);
    }
    let doc = format!("data->{}", key_literal(attr));
    let text = format!("data->>{}", key_literal(attr));
    match cond {
        Condition::Equals(Value::Null) => format!("({doc} IS NULL OR {doc} = 'null'::jsonb)"),
        Condition::Equals(v @ Value::Array(_)) => {
            let n = q.push_param(PgBindValue::json(v.clone()));
            format!("{doc} = ${n}")
        }
        Condition::Equals(v) => {
            let n = q.push_param(PgBindValue::json(v.clone()));
            format!("({doc} = ${n} OR (jsonb_typeof({doc}) = 'array' AND {doc} @> ${n}))")
        }
        Condition::In(values) => {
            let n = q.push_param(PgBindValue::TextArray(values.clone()));
            format!("({doc} ?| ${n})")
        }
        Condition::Matches(pattern) => {
            let n = q.push_param(PgBindValue::Text(pattern.clone()));
            format!(
                "(CASE WHEN jsonb_typeof({doc}) = 'array' \
                 THEN EXISTS (SELECT 1 FROM jsonb_array_elements_text({doc}) e WHERE e ~* ${n}) \
                 ELSE {text} ~* ${n} END)"
            )
        }
        Condition::Range { gte, lte } => {
            let mut parts = vec![format!("jsonb_typeof({doc}) = 'string'")];
            if let Some(g) = gte {
                let n = q.push_param(PgBindValue::Timestamp(*g));
                parts.push(format!("({text})::timestamptz >= ${n}"));
            }
            if let Some(l) = lte {
                let n = q.push_param(PgBindValue::Timestamp(*l));
                parts.push(format!("({text})::timestamptz <= ${n}"));
            }
            format!("({})", parts.join(" AND "))
        }
    }
}

fn base_condition_sql(q: &mut QueryBuf, col: &str, cond: &Condition) -> String {
    let is_time = col == "created_at" || col == "updated_at";
    match cond {
        Condition::Equals(Value::Null) => format!("{} IS NULL", col),
        Condition::Equals(v) => {
            let bind = match (is_time, v.as_str().and_then(crate::query::parse_timestamp)) {
                (true, Some(at)) => PgBindValue::Timestamp(at),
                _ => PgBindValue::Text(v.as_str().map(String::from).unwrap_or_else(|| v.to_string())),
            };
            let n = q.push_param(bind);
            format!("{} = ${}", col, n)
        }
        Condition::In(values) => {
            let n = q.push_param(PgBindValue::TextArray(values.clone()));
            format!("{}::text = ANY(${})", col, n)
        }
        Condition::Matches(pattern) => {
            let n = q.push_param(PgBindValue::Text(pattern.clone()));
            format!("{}::text ~* ${}", col, n)
        }
        Condition::Range { gte, lte } => {
            let mut parts = Vec::new();
            if let Some(g) = gte {
                let n = q.push_param(PgBindValue::Timestamp(*g));
                parts.push(format!("{} >= ${}", col, n));
            }
            if let Some(l) = lte {
                let n = q.push_param(PgBindValue::Timestamp(*l));
                parts.push(format!("{} <= ${}", col, n));
            }
            if parts.is_empty() {
                "TRUE".to_string()
            } else {
                format!("({})", parts.join(" AND "))
            }
        }
    }
}

/// ` WHERE ...` for `query`, or empty.
fn where_clause(q: &mut QueryBuf, query: &StructuredQuery) -> String {
    let mut parts: Vec<String> = query
        .conditions
        .iter()
        .map(|(attr, cond)| condition_sql(q, attr, cond))
        .collect();
    if !query.any_of.is_empty() {
        let any: Vec<String> = query
            .any_of
            .iter()
            .map(|(attr, cond)| condition_sql(q, attr, cond))
            .collect();
        parts.push(format!("({})", any.join(" OR ")));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    }
}

fn order_clause(order: &SortSpec) -> String {
    let mut parts: Vec<String> = order
        .0
        .iter()
        .map(|(attr, dir)| {
            let expr = base_column(attr)
                .map(String::from)
                .unwrap_or_else(|| format!("data->{}", key_literal(attr)));
            let dir = match dir {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            format!("{} {}", expr, dir)
        })
        .collect();
    parts.push("created_at ASC".into());
    parts.push("id ASC".into());
    format!(" ORDER BY {}", parts.join(", "))
}

fn page_clause(page: Page) -> String {
    let limit = page
        .limit
        .map(|n| format!(" LIMIT {}", n.min(Page::MAX_LIMIT)))
        .unwrap_or_default();
    let offset = page.offset.map(|n| format!(" OFFSET {}", n)).unwrap_or_default();
    format!("{}{}", limit, offset)
}

/// SELECT matching rows with sort and paging. Ties fall back to insertion order.
pub fn select(table: &str, query: &StructuredQuery, order: &SortSpec, page: Page) -> QueryBuf {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(&mut q, query);
    q.sql = format!(
        "SELECT {} FROM {}{}{}{}",
        SELECT_COLUMNS,
        table,
        where_sql,
        order_clause(order),
        page_clause(page)
    );
    q
}

pub fn select_by_ids(table: &str, ids: &[String]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let n = q.push_param(PgBindValue::TextArray(ids.to_vec()));
    q.sql = format!(
        "SELECT {} FROM {} WHERE id = ANY(${}) ORDER BY created_at, id",
        SELECT_COLUMNS, table, n
    );
    q
}

pub fn select_distinct_ids(table: &str, query: &StructuredQuery) -> QueryBuf {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(&mut q, query);
    q.sql = format!("SELECT DISTINCT id FROM {}{} ORDER BY id", table, where_sql);
    q
}

/// INSERT one row. `data` must not carry base attributes.
pub fn insert(table: &str, id: &str, data: &Row, creator: Option<&str>) -> QueryBuf {
    let mut q = QueryBuf::new();
    let id_n = q.push_param(PgBindValue::Text(id.to_string()));
    let data_n = q.push_param(PgBindValue::json(Value::Object(data.clone())));
    let creator_n = q.push_param(creator.map_or(PgBindValue::Null, |c| PgBindValue::Text(c.to_string())));
    q.sql = format!(
        "INSERT INTO {} (id, data, creator) VALUES (${}, ${}, ${}) RETURNING {}",
        table, id_n, data_n, creator_n, SELECT_COLUMNS
    );
    q
}

/// Replace the data of one row; the creator is kept when none is given.
pub fn replace(table: &str, id: &str, data: &Row, creator: Option<&str>) -> QueryBuf {
    let mut q = QueryBuf::new();
    let data_n = q.push_param(PgBindValue::json(Value::Object(data.clone())));
    let creator_n = q.push_param(creator.map_or(PgBindValue::Null, |c| PgBindValue::Text(c.to_string())));
    let id_n = q.push_param(PgBindValue::Text(id.to_string()));
    q.sql = format!(
        "UPDATE {} SET data = ${}, creator = COALESCE(${}, creator), updated_at = NOW() WHERE id = ${} RETURNING {}",
        table, data_n, creator_n, id_n, SELECT_COLUMNS
    );
    q
}

/// Merge `set` into the data of every matching row.
pub fn update_many(table: &str, query: &StructuredQuery, set: &Row) -> QueryBuf {
    let mut q = QueryBuf::new();
    let set_n = q.push_param(PgBindValue::json(Value::Object(set.clone())));
    let where_sql = where_clause(&mut q, query);
    q.sql = format!(
        "UPDATE {} SET data = data || ${}, updated_at = NOW(){}",
        table, set_n, where_sql
    );
    q
}

/// Move `data->from` to `data->to` in every row that has `from`.
pub fn rename_attribute(table: &str, from: &str, to: &str) -> QueryBuf {
    let mut q = QueryBuf::new();
    let from_n = q.push_param(PgBindValue::Text(from.to_string()));
    let to_n = q.push_param(PgBindValue::Text(to.to_string()));
    q.sql = format!(
        "UPDATE {t} SET data = (data - ${f}::text) || jsonb_build_object(${to}::text, data->${f}::text) WHERE data ? ${f}::text",
        t = table,
        f = from_n,
        to = to_n
    );
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const T: &str = "\"collections\".\"posts\"";

    #[test]
    fn quoting_escapes_double_quotes() {
        assert_eq!(qualified_table("collections", "a\"b"), "\"collections\".\"a\"\"b\"");
    }

    #[test]
    fn select_without_filters_orders_by_insertion() {
        let q = select(T, &StructuredQuery::new(), &SortSpec::default(), Page::default());
        assert_eq!(
            q.sql,
            "SELECT id, data, creator, created_at, updated_at FROM \"collections\".\"posts\" ORDER BY created_at ASC, id ASC"
        );
        assert!(q.params.is_empty());
    }

    #[test]
    fn conditions_bind_in_order() {
        let query = StructuredQuery::new()
            .with("author", Condition::In(vec!["a".into(), "b".into()]))
            .with("title", Condition::Matches("x".into()))
            .with("trashed", Condition::Equals(json!(false)));
        let q = select(T, &query, &SortSpec::default(), Page::new(Some(5000), Some(10)));
        assert!(q.sql.contains("(data->'author' ?| $1)"));
        assert!(q.sql.contains("data->>'title' ~* $2"));
        assert!(q.sql.contains("data->'trashed' = $3"));
        assert!(q.sql.ends_with(" LIMIT 1000 OFFSET 10"));
        assert_eq!(q.params[0], PgBindValue::TextArray(vec!["a".into(), "b".into()]));
        assert_eq!(q.params[2], PgBindValue::Json(json!(false)));
    }

    #[test]
    fn search_group_is_or_joined() {
        let mut query = StructuredQuery::new();
        query.any_of = vec![
            ("title".into(), Condition::Matches("p".into())),
            ("body".into(), Condition::Matches("p".into())),
        ];
        let q = select_distinct_ids(T, &query);
        assert!(q.sql.contains(" OR "));
        assert_eq!(q.params.len(), 2);
    }

    #[test]
    fn open_ended_range_binds_one_bound() {
        let lte = Utc.with_ymd_and_hms(2024, 5, 10, 23, 59, 59).single().unwrap();
        let query = StructuredQuery::new().with("due", Condition::Range { gte: None, lte: Some(lte) });
        let q = select(T, &query, &SortSpec::default(), Page::default());
        assert!(q.sql.contains("(data->>'due')::timestamptz <= $1"));
        assert!(!q.sql.contains(">="));
        assert_eq!(q.params, vec![PgBindValue::Timestamp(lte)]);
    }

    #[test]
    fn sort_uses_columns_for_base_attributes() {
        let order = SortSpec(vec![("createdAt".into(), SortDirection::Desc), ("name".into(), SortDirection::Asc)]);
        let q = select(T, &StructuredQuery::new(), &order, Page::default());
        assert!(q.sql.contains("ORDER BY created_at DESC, data->'name' ASC, created_at ASC, id ASC"));
    }

    #[test]
    fn update_many_binds_set_before_where() {
        let mut set = Row::new();
        set.insert("trashed".into(), json!(true));
        let query = StructuredQuery::new().with("id", Condition::In(vec!["1".into()]));
        let q = update_many(T, &query, &set);
        assert!(q.sql.starts_with("UPDATE \"collections\".\"posts\" SET data = data || $1"));
        assert!(q.sql.contains("id::text = ANY($2)"));
    }

    #[test]
    fn rename_moves_key() {
        let q = rename_attribute(T, "color", "colour");
        assert!(q.sql.contains("data - $1::text"));
        assert!(q.sql.contains("WHERE data ? $1::text"));
        assert_eq!(q.params[1], PgBindValue::Text("colour".into()));
    }
}
