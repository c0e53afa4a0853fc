//! Operation shapes
//!
//! These are the persisted contract: field names and nesting must stay
//! stable. Every shape is checked by [`Operation::validate`] before the
//! dispatcher touches the store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::changes::Changes;
use crate::error::{Result, WeftError};
use crate::resolver::ResolveTree;
use crate::schema::SchemaId;
use crate::store::DocId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: DocId,
}

impl Target {
    pub fn new(id: DocId) -> Self {
        Self { id }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    Create {
        schema_id: SchemaId,
        data: Value,
    },
    Read {
        target: Target,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolve: Option<ResolveTree>,
    },
    Update {
        target: Target,
        changes: Changes,
    },
    Delete {
        target: Target,
        #[serde(default)]
        hard: bool,
    },
    Batch {
        #[serde(default)]
        mode: BatchMode,
        #[serde(default)]
        continue_on_error: bool,
        operations: Vec<Operation>,
    },
    RegisterSchema {
        name: String,
        definition: Value,
    },
    ListSchemas,
    Inspect {
        target: Target,
    },
}

impl Operation {
    /// Parse and structurally validate an operation.
    pub fn from_json(value: Value) -> Result<Self> {
        let operation: Operation = serde_json::from_value(value)
            .map_err(|e| WeftError::invalid_op(format!("malformed operation: {e}")))?;
        operation.validate()?;
        Ok(operation)
    }

    pub fn create(schema_id: SchemaId, data: Value) -> Self {
        Operation::Create { schema_id, data }
    }

    pub fn read(id: DocId) -> Self {
        Operation::Read {
            target: Target::new(id),
            resolve: None,
        }
    }

    pub fn read_resolved(id: DocId, resolve: ResolveTree) -> Self {
        Operation::Read {
            target: Target::new(id),
            resolve: Some(resolve),
        }
    }

    pub fn update(id: DocId, changes: Changes) -> Self {
        Operation::Update {
            target: Target::new(id),
            changes,
        }
    }

    pub fn delete(id: DocId, hard: bool) -> Self {
        Operation::Delete {
            target: Target::new(id),
            hard,
        }
    }

    /// Wire name of the operation (`"registerSchema"`).
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Read { .. } => "read",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Batch { .. } => "batch",
            Operation::RegisterSchema { .. } => "registerSchema",
            Operation::ListSchemas => "listSchemas",
            Operation::Inspect { .. } => "inspect",
        }
    }

    /// Structural checks that need no store access. A batch checks every
    /// nested operation, so a bad item rejects the whole batch up front.
    pub fn validate(&self) -> Result<()> {
        match self {
            Operation::Create { schema_id, data } => {
                check_id("schemaId", schema_id)?;
                if data.is_null() {
                    return Err(WeftError::invalid_op("create: data is required"));
                }
                Ok(())
            }
            Operation::Read { target, resolve } => {
                check_id("target.id", &target.id)?;
                match resolve {
                    Some(tree) => check_tree(tree, "resolve"),
                    None => Ok(()),
                }
            }
            Operation::Update { target, changes } => {
                check_id("target.id", &target.id)?;
                changes.validate()
            }
            Operation::Delete { target, .. } | Operation::Inspect { target } => {
                check_id("target.id", &target.id)
            }
            Operation::Batch { operations, .. } => {
                for (i, op) in operations.iter().enumerate() {
                    op.validate().map_err(|e| match e {
                        WeftError::OperationInvalid(msg) => {
                            WeftError::invalid_op(format!("operations[{i}]: {msg}"))
                        }
                        other => other,
                    })?;
                }
                Ok(())
            }
            Operation::RegisterSchema { name, definition } => {
                if name.trim().is_empty() {
                    return Err(WeftError::invalid_op("registerSchema: name is empty"));
                }
                if !definition.is_object() {
                    return Err(WeftError::invalid_op(
                        "registerSchema: definition must be an object",
                    ));
                }
                Ok(())
            }
            Operation::ListSchemas => Ok(()),
        }
    }
}

fn check_id(what: &str, id: &DocId) -> Result<()> {
    if DocId::is_valid(id.as_str()) {
        Ok(())
    } else {
        Err(WeftError::invalid_op(format!("{what}: {id:?} is not a valid identifier")))
    }
}

fn check_tree(tree: &ResolveTree, at: &str) -> Result<()> {
    for (field, node) in tree {
        let here = format!("{at}.{field}");
        if field.is_empty() {
            return Err(WeftError::invalid_op(format!("{at}: empty field name")));
        }
        if node.depth == Some(0) {
            return Err(WeftError::invalid_op(format!("{here}.depth must be at least 1")));
        }
        if let Some(sub) = &node.resolve {
            check_tree(sub, &format!("{here}.resolve"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::OnError;
    use serde_json::json;

    #[test]
    fn test_parse_wire_shapes() {
        let op = Operation::from_json(json!({
            "op": "create",
            "schemaId": "val:todo",
            "data": {"text": "Buy milk", "done": false}
        }))
        .unwrap();
        assert_eq!(op.name(), "create");

        let op = Operation::from_json(json!({
            "op": "read",
            "target": {"id": "val:a"},
            "resolve": {"owner": {"onError": "null", "resolve": {"team": {}}}}
        }))
        .unwrap();
        match op {
            Operation::Read {
                resolve: Some(tree),
                ..
            } => {
                assert_eq!(tree["owner"].on_error, OnError::Null);
                assert!(tree["owner"].resolve.as_ref().unwrap().contains_key("team"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let op = Operation::from_json(json!({"op": "listSchemas"})).unwrap();
        assert_eq!(op, Operation::ListSchemas);

        let op = Operation::from_json(json!({
            "op": "batch",
            "mode": "parallel",
            "continueOnError": true,
            "operations": [{"op": "delete", "target": {"id": "val:a"}, "hard": true}]
        }))
        .unwrap();
        match op {
            Operation::Batch {
                mode,
                continue_on_error,
                operations,
            } => {
                assert_eq!(mode, BatchMode::Parallel);
                assert!(continue_on_error);
                assert_eq!(operations[0], Operation::delete(DocId::new_unchecked("val:a"), true));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_shapes_rejected() {
        for bad in [
            json!({"op": "explode"}),
            json!({"schemaId": "val:x", "data": {}}),
            json!({"op": "read"}),
            json!({"op": "read", "target": {"id": "has spaces"}}),
            json!({"op": "create", "schemaId": "val:x"}),
            json!({"op": "create", "schemaId": "val:x", "data": null}),
            json!({"op": "registerSchema", "name": " ", "definition": {}}),
            json!({"op": "registerSchema", "name": "T", "definition": []}),
            json!({"op": "read", "target": {"id": "val:a"}, "resolve": {"x": {"depth": 0}}}),
        ] {
            let err = Operation::from_json(bad.clone()).unwrap_err();
            assert!(
                matches!(err, WeftError::OperationInvalid(_)),
                "{bad} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_batch_rejects_bad_nested_operation() {
        let err = Operation::from_json(json!({
            "op": "batch",
            "operations": [
                {"op": "listSchemas"},
                {"op": "update", "target": {"id": "val:a"}, "changes": [{"op": "increment"}]}
            ]
        }))
        .unwrap_err();
        assert!(matches!(err, WeftError::OperationInvalid(_)));

        let err = Operation::Batch {
            mode: BatchMode::Sequential,
            continue_on_error: false,
            operations: vec![Operation::read(DocId::new_unchecked("bad id"))],
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("operations[0]"));
    }

    #[test]
    fn test_round_trip_keeps_camel_case() {
        let op = Operation::Batch {
            mode: BatchMode::Sequential,
            continue_on_error: true,
            operations: vec![Operation::ListSchemas],
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "batch");
        assert_eq!(json["continueOnError"], true);
        assert_eq!(json["operations"][0], json!({"op": "listSchemas"}));
    }
}
