//! `sort` and `limit`.

use std::cmp::Ordering;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{DataOpError, compare_values, field_or_null, parse_config};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    #[serde(alias = "ascending")]
    Asc,
    #[serde(alias = "descending")]
    Desc,
}

#[derive(Debug, Deserialize)]
struct SortKey {
    field: String,
    #[serde(default, alias = "order")]
    direction: SortDirection,
}

#[derive(Debug, Deserialize)]
struct SortConfig {
    #[serde(default)]
    items: Option<Vec<Value>>,
    /// Multi-key form: `[{field, direction}, ...]`.
    #[serde(default, alias = "sortBy", alias = "keys")]
    fields: Vec<SortKey>,
    /// Single-key shorthand.
    #[serde(default)]
    field: Option<String>,
    #[serde(default, alias = "order")]
    direction: SortDirection,
}

/// Stable multi-key sort. `{items, fields | field}` -> `{items, count}`.
pub fn sort(config: &Value) -> Result<Value, DataOpError> {
    let config: SortConfig = parse_config("sort", config)?;
    let mut keys = config.fields;
    if let Some(field) = config.field {
        keys.insert(
            0,
            SortKey {
                field,
                direction: config.direction,
            },
        );
    }
    if keys.is_empty() {
        return Err(DataOpError::config("sort", "no sort field given"));
    }

    let mut items = config.items.unwrap_or_default();
    items.sort_by(|a, b| {
        keys.iter()
            .map(|key| {
                let ord = compare_values(field_or_null(a, &key.field), field_or_null(b, &key.field));
                match key.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            })
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });

    Ok(json!({ "count": items.len(), "items": items }))
}

#[derive(Debug, Deserialize)]
struct LimitConfig {
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(alias = "count")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

/// `{items, limit, offset?}` -> `{items, count, offset, total}`.
pub fn limit(config: &Value) -> Result<Value, DataOpError> {
    let config: LimitConfig = parse_config("limit", config)?;
    let items = config.items.unwrap_or_default();
    let total = items.len();
    let page: Vec<Value> = items.into_iter().skip(config.offset).take(config.limit).collect();

    Ok(json!({
        "count": page.len(),
        "offset": config.offset,
        "total": total,
        "items": page,
    }))
}
