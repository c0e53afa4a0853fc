//! Operation dispatch
//!
//! The single read/write entry point. Every operation is structurally
//! validated before anything touches the store; writes are validated against
//! the value's schema before they are persisted.
//!
//! ```text
//! execute(op)
//!   ├─ validate shape ──────────────► OperationInvalid
//!   ├─ create / update ── schema ───► ValidationFailed
//!   ├─ read ── resolver ── onError ─► ReferenceUnavailable / DepthExceeded
//!   └─ batch ── per-item outcomes
//! ```

mod changes;
mod operation;

pub use changes::{Change, Changes, Predicate};
pub use operation::{BatchMode, Operation, Target};

use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, WeftError};
use crate::multiplexer::SubscriptionMultiplexer;
use crate::resolver::{
    FieldValue, LoadState, OnError, ReferenceResolver, ResolveNode, ResolveTree, ResolvedView,
    UnavailableReason,
};
use crate::schema::validate::{pointer, validate_field, validate_full};
use crate::schema::{RegistryEntry, SchemaDescriptor, SchemaId, SchemaStore};
use crate::store::{DocId, StorageKind, StoredValue, ValueStore};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OperationResult {
    Created {
        id: DocId,
    },
    Read(ResolvedView),
    Updated {
        id: DocId,
        data: Value,
    },
    Deleted {
        id: DocId,
        hard: bool,
    },
    Batch(BatchReport),
    SchemaRegistered {
        #[serde(rename = "schemaId")]
        schema_id: SchemaId,
    },
    Schemas {
        schemas: Vec<RegistryEntry>,
    },
    Inspected(Inspection),
}

impl OperationResult {
    /// The identifier a create, update or delete acted on.
    pub fn id(&self) -> Option<&DocId> {
        match self {
            OperationResult::Created { id }
            | OperationResult::Updated { id, .. }
            | OperationResult::Deleted { id, .. } => Some(id),
            OperationResult::SchemaRegistered { schema_id } => Some(schema_id),
            OperationResult::Read(view) => Some(&view.id),
            _ => None,
        }
    }

    pub fn into_view(self) -> Option<ResolvedView> {
        match self {
            OperationResult::Read(view) => Some(view),
            _ => None,
        }
    }

    pub fn into_batch(self) -> Option<BatchReport> {
        match self {
            OperationResult::Batch(report) => Some(report),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Ok,
    Error,
    /// Not run because an earlier sequential item failed.
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

impl From<&WeftError> for ErrorInfo {
    fn from(e: &WeftError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            paths: e.violation_paths().into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<OperationResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl BatchOutcome {
    fn from_result(index: usize, result: Result<OperationResult>) -> Self {
        match result {
            Ok(result) => Self {
                index,
                status: OutcomeStatus::Ok,
                result: Some(Box::new(result)),
                error: None,
            },
            Err(e) => Self {
                index,
                status: OutcomeStatus::Error,
                result: None,
                error: Some(ErrorInfo::from(&e)),
            },
        }
    }

    fn skipped(index: usize) -> Self {
        Self {
            index,
            status: OutcomeStatus::Skipped,
            result: None,
            error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchReport {
    pub mode: BatchMode,
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.count(OutcomeStatus::Ok)
    }

    pub fn failed(&self) -> usize {
        self.count(OutcomeStatus::Error)
    }

    pub fn skipped(&self) -> usize {
        self.count(OutcomeStatus::Skipped)
    }

    pub fn all_ok(&self) -> bool {
        self.succeeded() == self.outcomes.len()
    }

    fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Raw view of one identifier for debugging.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inspection {
    pub id: DocId,
    pub stored: Option<StoredValue>,
    pub schema: Option<SchemaDescriptor>,
    pub watchers: usize,
    pub live: bool,
}

pub struct Dispatcher {
    store: Arc<dyn ValueStore>,
    schemas: Arc<SchemaStore>,
    resolver: Arc<ReferenceResolver>,
    multiplexer: Arc<SubscriptionMultiplexer>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ValueStore>,
        schemas: Arc<SchemaStore>,
        resolver: Arc<ReferenceResolver>,
        multiplexer: Arc<SubscriptionMultiplexer>,
    ) -> Self {
        Self {
            store,
            schemas,
            resolver,
            multiplexer,
        }
    }

    pub fn schemas(&self) -> &Arc<SchemaStore> {
        &self.schemas
    }

    pub fn resolver(&self) -> &Arc<ReferenceResolver> {
        &self.resolver
    }

    pub async fn execute(&self, operation: Operation) -> Result<OperationResult> {
        operation.validate()?;
        self.run(operation).await
    }

    pub async fn execute_json(&self, operation: Value) -> Result<OperationResult> {
        let operation = Operation::from_json(operation)?;
        self.run(operation).await
    }

    fn run(&self, operation: Operation) -> BoxFuture<'_, Result<OperationResult>> {
        async move {
            log::trace!("dispatching {}", operation.name());
            match operation {
                Operation::Create { schema_id, data } => {
                    let id = self.create(&schema_id, data).await?;
                    Ok(OperationResult::Created { id })
                }
                Operation::Read { target, resolve } => {
                    let view = self.read(&target.id, resolve.as_ref()).await?;
                    Ok(OperationResult::Read(view))
                }
                Operation::Update { target, changes } => {
                    let data = self.update(&target.id, &changes).await?;
                    Ok(OperationResult::Updated {
                        id: target.id,
                        data,
                    })
                }
                Operation::Delete { target, hard } => {
                    self.delete(&target.id, hard).await?;
                    Ok(OperationResult::Deleted {
                        id: target.id,
                        hard,
                    })
                }
                Operation::Batch {
                    mode,
                    continue_on_error,
                    operations,
                } => Ok(OperationResult::Batch(
                    self.batch(mode, continue_on_error, operations).await,
                )),
                Operation::RegisterSchema { name, definition } => {
                    let descriptor = SchemaDescriptor::from_definition(&name, definition)
                        .map_err(WeftError::schema_invalid)?;
                    let schema_id = self.schemas.register(&name, descriptor).await?;
                    Ok(OperationResult::SchemaRegistered { schema_id })
                }
                Operation::ListSchemas => Ok(OperationResult::Schemas {
                    schemas: self.schemas.list().await?,
                }),
                Operation::Inspect { target } => {
                    Ok(OperationResult::Inspected(self.inspect(&target.id).await?))
                }
            }
        }
        .boxed()
    }

    async fn create(&self, schema_id: &SchemaId, data: Value) -> Result<DocId> {
        let schema = self.schemas.get(schema_id).await?;
        if schema.kind() == StorageKind::Schema {
            return Err(WeftError::invalid_op(
                "create: schema values are created with registerSchema",
            ));
        }
        let violations = validate_full(&schema.descriptor, &data);
        if !violations.is_empty() {
            return Err(WeftError::ValidationFailed { violations });
        }
        let id = self.store.create(schema.kind(), Some(schema_id), data).await?;
        // The value exists from here on, so a failed append is reported in
        // the log rather than as a failed create.
        match self.schemas.add_member(schema_id, &id).await {
            // Collection schemas are not registry entries and keep no collection.
            Ok(()) | Err(WeftError::SchemaNotFound(_)) => {}
            Err(e) => log::error!("{} created but not listed in its collection: {}", id, e),
        }
        log::debug!("created {} ({})", id, schema.name());
        Ok(id)
    }

    /// Read `id`. Without a resolve tree every reference stays an id.
    ///
    /// An unavailable root is reported through its load state, not as an
    /// error; the `onError` policy applies to nested fields only.
    async fn read(&self, id: &DocId, resolve: Option<&ResolveTree>) -> Result<ResolvedView> {
        match resolve {
            Some(tree) => {
                let view = self.resolver.resolve_selected(id, tree).await;
                enforce_tree(view, tree, "", self.resolver.max_depth())
            }
            None => Ok(self.resolver.resolve_shallow(id).await),
        }
    }

    async fn load_mutable(&self, id: &DocId, op: &str) -> Result<StoredValue> {
        let stored = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| WeftError::NotFound(id.clone()))?;
        if stored.kind == StorageKind::Schema {
            return Err(WeftError::invalid_op(format!(
                "{op}: schema values are immutable; register a new version"
            )));
        }
        Ok(stored)
    }

    async fn update(&self, id: &DocId, changes: &Changes) -> Result<Value> {
        let stored = self.load_mutable(id, "update").await?;
        let applied = changes::apply(stored.kind, &stored.data, changes)?;

        if let Some(schema_id) = &stored.schema_id {
            let schema = self.schemas.get(schema_id).await?;
            let mut violations = Vec::new();
            if applied.whole {
                violations.extend(validate_full(&schema.descriptor, &applied.data));
            }
            for field in &applied.touched {
                let value = applied.data.get(field).unwrap_or(&Value::Null);
                violations.extend(validate_field(&schema.descriptor, field, value));
            }
            if !violations.is_empty() {
                return Err(WeftError::ValidationFailed { violations });
            }
        }

        if applied.data == stored.data {
            log::trace!("update of {} changed nothing", id);
            return Ok(applied.data);
        }
        self.store
            .write(id, stored.with_data(applied.data.clone()))
            .await?;
        Ok(applied.data)
    }

    async fn delete(&self, id: &DocId, hard: bool) -> Result<()> {
        let stored = self.load_mutable(id, "delete").await?;
        self.store
            .write(id, stored.with_data(stored.kind.empty_data()))
            .await?;
        if let Some(schema_id) = &stored.schema_id {
            match self.schemas.remove_member(schema_id, id).await {
                Ok(()) | Err(WeftError::SchemaNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if hard {
            self.multiplexer.evict(id);
            self.store.release(id).await;
        }
        log::debug!("deleted {} (hard: {})", id, hard);
        Ok(())
    }

    async fn batch(
        &self,
        mode: BatchMode,
        continue_on_error: bool,
        operations: Vec<Operation>,
    ) -> BatchReport {
        let outcomes = match mode {
            BatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(operations.len());
                let mut stopped = false;
                for (index, operation) in operations.into_iter().enumerate() {
                    if stopped {
                        outcomes.push(BatchOutcome::skipped(index));
                        continue;
                    }
                    let outcome = BatchOutcome::from_result(index, self.run(operation).await);
                    if outcome.status == OutcomeStatus::Error && !continue_on_error {
                        stopped = true;
                    }
                    outcomes.push(outcome);
                }
                outcomes
            }
            BatchMode::Parallel => {
                let pending = operations
                    .into_iter()
                    .enumerate()
                    .map(|(index, operation)| async move {
                        BatchOutcome::from_result(index, self.run(operation).await)
                    });
                join_all(pending).await
            }
        };
        BatchReport { mode, outcomes }
    }

    async fn inspect(&self, id: &DocId) -> Result<Inspection> {
        let stored = self.store.load(id).await?;
        let schema = match stored.as_ref().and_then(|s| s.schema_id.as_ref()) {
            Some(schema_id) => match self.schemas.get(schema_id).await {
                Ok(schema) => Some(schema.descriptor.clone()),
                Err(WeftError::SchemaNotFound(_)) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        Ok(Inspection {
            id: id.clone(),
            stored,
            schema,
            watchers: self.multiplexer.refcount(id),
            live: self.multiplexer.is_live(id),
        })
    }
}

/// Apply each resolve node's `onError` policy to the fields it names.
fn enforce_tree(
    mut view: ResolvedView,
    tree: &ResolveTree,
    path: &str,
    max_depth: usize,
) -> Result<ResolvedView> {
    for (field, node) in tree {
        let Some(value) = view.fields.remove(field) else {
            continue;
        };
        let value = enforce(value, node, &pointer(path, field), max_depth)?;
        view.fields.insert(field.clone(), value);
    }
    Ok(view)
}

fn enforce(value: FieldValue, node: &ResolveNode, path: &str, max_depth: usize) -> Result<FieldValue> {
    match value {
        FieldValue::View(child) => match child.load_state {
            LoadState::Loaded => {
                let child = match &node.resolve {
                    Some(sub) => enforce_tree(*child, sub, path, max_depth)?,
                    // Deeper levels inherit this node's policy.
                    None => {
                        let mut child = *child;
                        let fields = std::mem::take(&mut child.fields);
                        for (field, value) in fields {
                            let value = enforce(value, node, &pointer(path, &field), max_depth)?;
                            child.fields.insert(field, value);
                        }
                        child
                    }
                };
                Ok(FieldValue::View(Box::new(child)))
            }
            LoadState::Circular => Ok(FieldValue::View(child)),
            LoadState::Unavailable | LoadState::Loading => match node.on_error {
                OnError::Null => Ok(FieldValue::Value(Value::Null)),
                OnError::Throw if child.reason == Some(UnavailableReason::DepthExceeded) => {
                    Err(WeftError::DepthExceeded {
                        path: path.to_string(),
                        max_depth,
                    })
                }
                OnError::Throw => Err(WeftError::ReferenceUnavailable {
                    id: child.id.clone(),
                    path: path.to_string(),
                }),
            },
        },
        FieldValue::List(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| enforce(item, node, &pointer(path, &i.to_string()), max_depth))
            .collect::<Result<Vec<_>>>()
            .map(FieldValue::List),
        other => Ok(other),
    }
}
