//! Data validation against schema descriptors
//!
//! Violations are addressed by JSON pointer. Map-shaped values report
//! `/field`; list-shaped values report element indices (`/3`).

use serde_json::Value;

use super::descriptor::{FieldSpec, SchemaDescriptor, ValueType, ITEMS_FIELD};
use crate::error::FieldViolation;
use crate::store::DocId;

pub(crate) fn pointer(parent: &str, segment: &str) -> String {
    let escaped = segment.replace('~', "~0").replace('/', "~1");
    format!("{parent}/{escaped}")
}

/// Validate a complete value: shape, required fields, every declared field.
pub fn validate_full(descriptor: &SchemaDescriptor, data: &Value) -> Vec<FieldViolation> {
    if !descriptor.kind.accepts(data) {
        return vec![FieldViolation::new(
            "",
            format!("expected {} value", descriptor.kind),
        )];
    }

    if descriptor.kind.is_sequence() {
        return match descriptor.fields.get(ITEMS_FIELD) {
            Some(spec) => validate_value("", spec, data),
            None => Vec::new(),
        };
    }

    let Some(object) = data.as_object() else {
        return Vec::new();
    };

    let mut violations = Vec::new();
    for required in &descriptor.required_fields {
        match object.get(required) {
            None | Some(Value::Null) => {
                violations.push(FieldViolation::new(pointer("", required), "required"));
            }
            Some(_) => {}
        }
    }
    for (name, value) in object {
        violations.extend(validate_field(descriptor, name, value));
    }
    violations
}

/// Validate one field of a map-shaped value. Untouched fields are not
/// consulted, which is what partial updates rely on.
pub fn validate_field(descriptor: &SchemaDescriptor, name: &str, value: &Value) -> Vec<FieldViolation> {
    let path = pointer("", name);
    match descriptor.fields.get(name) {
        Some(spec) => {
            if value.is_null() {
                if descriptor.is_required(name) {
                    vec![FieldViolation::new(path, "required")]
                } else {
                    Vec::new()
                }
            } else {
                validate_value(&path, spec, value)
            }
        }
        // Schemas that declare no fields are open.
        None if descriptor.fields.is_empty() => Vec::new(),
        None => vec![FieldViolation::new(path, "unknown field")],
    }
}

/// Validate a non-null value against one field spec.
pub fn validate_value(path: &str, spec: &FieldSpec, value: &Value) -> Vec<FieldViolation> {
    let mut violations = Vec::new();
    let mut fail = |message: String| violations.push(FieldViolation::new(path, message));

    match spec.value_type {
        ValueType::String => match value.as_str() {
            Some(s) => {
                let len = s.chars().count();
                check_length(spec, len, "characters", &mut fail);
                if spec.is_reference && !DocId::is_valid(s) {
                    fail(format!("{s:?} is not a valid identifier"));
                }
            }
            None => fail("expected string".to_string()),
        },
        ValueType::Number => match value.as_f64() {
            Some(n) => check_range(spec, n, &mut fail),
            None => fail("expected number".to_string()),
        },
        ValueType::Integer => {
            if value.is_i64() || value.is_u64() {
                if let Some(n) = value.as_f64() {
                    check_range(spec, n, &mut fail);
                }
            } else {
                fail("expected integer".to_string());
            }
        }
        ValueType::Boolean => {
            if !value.is_boolean() {
                fail("expected boolean".to_string());
            }
        }
        ValueType::Map => {
            if !value.is_object() {
                fail("expected map".to_string());
            }
        }
        ValueType::List => match value.as_array() {
            Some(items) => {
                check_length(spec, items.len(), "items", &mut fail);
                if spec.is_reference {
                    for (i, item) in items.iter().enumerate() {
                        let valid = item.as_str().map_or(false, DocId::is_valid);
                        if !valid {
                            violations.push(FieldViolation::new(
                                pointer(path, &i.to_string()),
                                "expected a reference identifier",
                            ));
                        }
                    }
                }
            }
            None => fail("expected list".to_string()),
        },
        ValueType::Any => {}
    }
    violations
}

fn check_length(spec: &FieldSpec, len: usize, unit: &str, fail: &mut impl FnMut(String)) {
    if let Some(min) = spec.min_length {
        if len < min {
            fail(format!("needs at least {min} {unit}"));
        }
    }
    if let Some(max) = spec.max_length {
        if len > max {
            fail(format!("allows at most {max} {unit}"));
        }
    }
}

fn check_range(spec: &FieldSpec, n: f64, fail: &mut impl FnMut(String)) {
    if let Some(min) = spec.minimum {
        if n < min {
            fail(format!("must be >= {min}"));
        }
    }
    if let Some(max) = spec.maximum {
        if n > max {
            fail(format!("must be <= {max}"));
        }
    }
}
