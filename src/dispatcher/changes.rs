//! Update sub-operations
//!
//! Changes apply to a working copy of the stored data. Nothing is written
//! unless every change applies and every touched field validates.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{FieldViolation, Result, WeftError};
use crate::schema::validate::pointer;
use crate::store::StorageKind;

/// The `changes` of an update: either a plain object (set each key) or an
/// ordered list of sub-operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Changes {
    Ops(Vec<Change>),
    Fields(Map<String, Value>),
}

fn one() -> f64 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Change {
    Set {
        field: String,
        value: Value,
    },
    Increment {
        field: String,
        #[serde(default = "one")]
        by: f64,
    },
    Decrement {
        field: String,
        #[serde(default = "one")]
        by: f64,
    },
    Delete {
        field: String,
    },
    /// List ops target `field`, or the value itself when it is list-shaped.
    Push {
        #[serde(default)]
        field: Option<String>,
        value: Value,
    },
    Unshift {
        #[serde(default)]
        field: Option<String>,
        value: Value,
    },
    #[serde(alias = "set@index")]
    SetAt {
        #[serde(default)]
        field: Option<String>,
        index: usize,
        value: Value,
    },
    Splice {
        #[serde(default)]
        field: Option<String>,
        start: usize,
        #[serde(default)]
        delete_count: usize,
        #[serde(default)]
        items: Vec<Value>,
    },
    #[serde(alias = "remove-by-predicate")]
    RemoveWhere {
        #[serde(default)]
        field: Option<String>,
        predicate: Predicate,
    },
}

/// Matches list items equal to `equals`, or whose `field` equals it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub equals: Value,
}

impl Predicate {
    fn matches(&self, item: &Value) -> bool {
        match &self.field {
            Some(field) => item.get(field) == Some(&self.equals),
            None => item == &self.equals,
        }
    }
}

impl Changes {
    pub fn set(field: impl Into<String>, value: Value) -> Self {
        let mut fields = Map::new();
        fields.insert(field.into(), value);
        Changes::Fields(fields)
    }

    fn ops(&self) -> Vec<Change> {
        match self {
            Changes::Ops(ops) => ops.clone(),
            Changes::Fields(fields) => fields
                .iter()
                .map(|(field, value)| Change::Set {
                    field: field.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let ops = self.ops();
        if ops.is_empty() {
            return Err(WeftError::invalid_op("update: no changes"));
        }
        for (i, change) in ops.iter().enumerate() {
            let named = match change {
                Change::Set { field, .. }
                | Change::Increment { field, .. }
                | Change::Decrement { field, .. }
                | Change::Delete { field } => Some(field.as_str()),
                Change::Push { field, .. }
                | Change::Unshift { field, .. }
                | Change::SetAt { field, .. }
                | Change::Splice { field, .. }
                | Change::RemoveWhere { field, .. } => field.as_deref(),
            };
            if named == Some("") {
                return Err(WeftError::invalid_op(format!("changes[{i}]: empty field name")));
            }
            if let Change::Increment { by, .. } | Change::Decrement { by, .. } = change {
                if !by.is_finite() {
                    return Err(WeftError::invalid_op(format!("changes[{i}]: `by` must be finite")));
                }
            }
        }
        Ok(())
    }
}

/// Result of applying changes to a working copy.
#[derive(Debug)]
pub(crate) struct Applied {
    pub data: Value,
    /// Map fields written or removed.
    pub touched: BTreeSet<String>,
    /// A list op targeted the value itself.
    pub whole: bool,
}

pub(crate) fn apply(kind: StorageKind, current: &Value, changes: &Changes) -> Result<Applied> {
    let mut applied = Applied {
        data: current.clone(),
        touched: BTreeSet::new(),
        whole: false,
    };
    let mut violations = Vec::new();
    for change in changes.ops() {
        if let Err(v) = apply_one(kind, &mut applied, change) {
            violations.push(v);
        }
    }
    if violations.is_empty() {
        Ok(applied)
    } else {
        Err(WeftError::ValidationFailed { violations })
    }
}

fn apply_one(
    kind: StorageKind,
    applied: &mut Applied,
    change: Change,
) -> std::result::Result<(), FieldViolation> {
    match change {
        Change::Set { field, value } => {
            fields_mut(&mut applied.data)?.insert(field.clone(), value);
            applied.touched.insert(field);
        }
        Change::Increment { field, by } => add(applied, field, by)?,
        Change::Decrement { field, by } => add(applied, field, -by)?,
        Change::Delete { field } => {
            fields_mut(&mut applied.data)?.remove(&field);
            applied.touched.insert(field);
        }
        Change::Push { field, value } => {
            list_mut(kind, applied, field)?.0.push(value);
        }
        Change::Unshift { field, value } => {
            list_mut(kind, applied, field)?.0.insert(0, value);
        }
        Change::SetAt {
            field,
            index,
            value,
        } => {
            let (items, path) = list_mut(kind, applied, field)?;
            let len = items.len();
            match items.get_mut(index) {
                Some(slot) => *slot = value,
                None => {
                    return Err(FieldViolation::new(
                        pointer(&path, &index.to_string()),
                        format!("index out of range (length {len})"),
                    ))
                }
            }
        }
        Change::Splice {
            field,
            start,
            delete_count,
            items: inserted,
        } => {
            let (items, path) = list_mut(kind, applied, field)?;
            if start > items.len() {
                return Err(FieldViolation::new(
                    pointer(&path, &start.to_string()),
                    format!("splice start out of range (length {})", items.len()),
                ));
            }
            let end = start.saturating_add(delete_count).min(items.len());
            let _removed: Vec<Value> = items.splice(start..end, inserted).collect();
        }
        Change::RemoveWhere { field, predicate } => {
            list_mut(kind, applied, field)?
                .0
                .retain(|item| !predicate.matches(item));
        }
    }
    Ok(())
}

fn fields_mut(data: &mut Value) -> std::result::Result<&mut Map<String, Value>, FieldViolation> {
    data.as_object_mut()
        .ok_or_else(|| FieldViolation::new("", "field changes need a map value"))
}

/// The list a list op targets, with its pointer.
fn list_mut(
    kind: StorageKind,
    applied: &mut Applied,
    field: Option<String>,
) -> std::result::Result<(&mut Vec<Value>, String), FieldViolation> {
    match field {
        Some(field) => {
            let path = pointer("", &field);
            let slot = fields_mut(&mut applied.data)?
                .entry(field.clone())
                .or_insert(Value::Null);
            if slot.is_null() {
                *slot = Value::Array(Vec::new());
            }
            applied.touched.insert(field);
            match slot.as_array_mut() {
                Some(items) => Ok((items, path)),
                None => Err(FieldViolation::new(path, "expected list")),
            }
        }
        None => {
            if !kind.is_sequence() {
                return Err(FieldViolation::new(
                    "",
                    format!("list changes without a field need a list value, not {kind}"),
                ));
            }
            applied.whole = true;
            match applied.data.as_array_mut() {
                Some(items) => Ok((items, String::new())),
                None => Err(FieldViolation::new("", "expected list")),
            }
        }
    }
}

fn add(applied: &mut Applied, field: String, delta: f64) -> std::result::Result<(), FieldViolation> {
    let path = pointer("", &field);
    let fields = fields_mut(&mut applied.data)?;
    let current = fields.get(&field).cloned().unwrap_or(Value::Null);
    let next = match &current {
        Value::Null => number(0.0, delta),
        Value::Number(n) => match (n.as_i64(), delta.fract() == 0.0) {
            (Some(i), true) => i.checked_add(delta as i64).map(Value::from),
            _ => n.as_f64().and_then(|f| number(f, delta)),
        },
        _ => return Err(FieldViolation::new(path, "expected number")),
    };
    let next = next.ok_or_else(|| FieldViolation::new(path, "numeric overflow"))?;
    fields.insert(field.clone(), next);
    applied.touched.insert(field);
    Ok(())
}

fn number(base: f64, delta: f64) -> Option<Value> {
    let sum = base + delta;
    if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
        return Some(Value::from(sum as i64));
    }
    Number::from_f64(sum).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ops(v: Value) -> Changes {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_object_shorthand_sets_fields() {
        let changes = ops(json!({"done": true}));
        let applied = apply(
            StorageKind::Map,
            &json!({"text": "Buy milk", "done": false}),
            &changes,
        )
        .unwrap();
        assert_eq!(applied.data, json!({"text": "Buy milk", "done": true}));
        assert_eq!(applied.touched.iter().collect::<Vec<_>>(), vec!["done"]);
        assert!(!applied.whole);
    }

    #[test]
    fn test_numeric_ops() {
        let changes = ops(json!([
            {"op": "increment", "field": "count"},
            {"op": "increment", "field": "count", "by": 4},
            {"op": "decrement", "field": "score", "by": 0.5}
        ]));
        let applied = apply(StorageKind::Map, &json!({"score": 2}), &changes).unwrap();
        assert_eq!(applied.data, json!({"count": 5, "score": 1.5}));

        let err = apply(
            StorageKind::Map,
            &json!({"count": "x"}),
            &ops(json!([{"op": "increment", "field": "count"}])),
        )
        .unwrap_err();
        assert_eq!(err.violation_paths(), vec!["/count"]);
    }

    #[test]
    fn test_field_list_ops() {
        let changes = ops(json!([
            {"op": "push", "field": "tags", "value": "b"},
            {"op": "unshift", "field": "tags", "value": "a"},
            {"op": "set@index", "field": "tags", "index": 1, "value": "B"},
            {"op": "splice", "field": "tags", "start": 1, "deleteCount": 0, "items": ["x", "y"]},
            {"op": "remove-by-predicate", "field": "tags", "predicate": {"equals": "x"}}
        ]));
        let applied = apply(StorageKind::Map, &json!({}), &changes).unwrap();
        assert_eq!(applied.data, json!({"tags": ["a", "y", "B"]}));
        assert!(applied.touched.contains("tags"));
    }

    #[test]
    fn test_whole_list_ops() {
        let changes = ops(json!([
            {"op": "push", "value": {"id": 1}},
            {"op": "push", "value": {"id": 2}},
            {"op": "removeWhere", "predicate": {"field": "id", "equals": 1}}
        ]));
        let applied = apply(StorageKind::List, &json!([]), &changes).unwrap();
        assert_eq!(applied.data, json!([{"id": 2}]));
        assert!(applied.whole);

        let err = apply(
            StorageKind::Map,
            &json!({}),
            &ops(json!([{"op": "push", "value": 1}])),
        )
        .unwrap_err();
        assert_eq!(err.violation_paths(), vec![""]);
    }

    #[test]
    fn test_out_of_range_index() {
        let err = apply(
            StorageKind::Map,
            &json!({"tags": ["a"]}),
            &ops(json!([{"op": "setAt", "field": "tags", "index": 3, "value": "z"}])),
        )
        .unwrap_err();
        assert_eq!(err.violation_paths(), vec!["/tags/3"]);
    }

    #[test]
    fn test_delete_marks_field_touched() {
        let applied = apply(
            StorageKind::Map,
            &json!({"text": "a", "note": "n"}),
            &ops(json!([{"op": "delete", "field": "note"}])),
        )
        .unwrap();
        assert_eq!(applied.data, json!({"text": "a"}));
        assert!(applied.touched.contains("note"));
    }

    #[test]
    fn test_empty_changes_invalid() {
        assert!(ops(json!([])).validate().is_err());
        assert!(ops(json!({})).validate().is_err());
        assert!(ops(json!([{"op": "set", "field": "", "value": 1}]))
            .validate()
            .is_err());
    }
}
