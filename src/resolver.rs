//! Reference resolution
//!
//! Turns an identifier into a [`ResolvedView`]: the stored value projected
//! through its schema, with reference fields left as identifiers or expanded
//! into nested views.
//!
//! Cycles and runaway chains never fail a resolution. A target already on the
//! current path comes back as a `circular` marker; a hop past `max_depth`
//! comes back `unavailable` with reason `depthExceeded`. Every child gets its
//! own copy of the path, so siblings that share a target are not flagged.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::schema::{Cardinality, ReferenceTarget, SchemaId, SchemaStore, ITEMS_FIELD};
use crate::store::{DocId, StorageKind, StoredValue, ValueStore};

pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Field binary values are projected under.
pub const CONTENT_FIELD: &str = "content";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadState {
    Loaded,
    Loading,
    Unavailable,
    Circular,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnavailableReason {
    /// The store has no value (or cannot reach it).
    Missing,
    DepthExceeded,
    /// The value names a schema that cannot be loaded.
    SchemaUnknown,
    /// The store returned an error.
    StoreError,
}

/// What to do when a nested resolution comes back unavailable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnError {
    /// Fail the whole read.
    #[default]
    Throw,
    /// Degrade the field to null.
    Null,
}

/// One node of a `read` operation's `resolve` tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveNode {
    /// Levels to expand starting at this field (default 1). Ignored when a
    /// nested `resolve` tree is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,

    #[serde(default)]
    pub on_error: OnError,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve: Option<ResolveTree>,
}

pub type ResolveTree = BTreeMap<String, ResolveNode>;

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Plain data, or a null reference.
    Value(Value),
    /// A reference left unexpanded.
    Reference(DocId),
    View(Box<ResolvedView>),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_view(&self) -> Option<&ResolvedView> {
        match self {
            FieldValue::View(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&DocId> {
        match self {
            FieldValue::Reference(id) => Some(id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Value(v) => v.clone(),
            FieldValue::Reference(id) => Value::String(id.as_str().to_string()),
            FieldValue::View(view) => view.to_json(),
            FieldValue::List(items) => Value::Array(items.iter().map(FieldValue::to_json).collect()),
        }
    }
}

/// Read-only projection of one stored value.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedView {
    pub id: DocId,
    pub schema_id: Option<SchemaId>,
    pub kind: Option<StorageKind>,
    pub load_state: LoadState,
    pub reason: Option<UnavailableReason>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl ResolvedView {
    pub(crate) fn marker(
        id: DocId,
        schema_id: Option<SchemaId>,
        load_state: LoadState,
        reason: Option<UnavailableReason>,
    ) -> Self {
        Self {
            id,
            schema_id,
            kind: None,
            load_state,
            reason,
            fields: BTreeMap::new(),
        }
    }

    /// Project a stored value without expanding anything.
    pub fn from_stored(id: DocId, stored: &StoredValue) -> Self {
        let fields = project(stored.kind, stored.data.clone())
            .into_iter()
            .map(|(name, value)| (name, FieldValue::Value(value)))
            .collect();
        Self {
            id,
            schema_id: stored.schema_id.clone(),
            kind: Some(stored.kind),
            load_state: LoadState::Loaded,
            reason: None,
            fields,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.load_state == LoadState::Loaded
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// The value's contents in stored shape, with expansions inlined.
    pub fn data(&self) -> Value {
        if !self.is_loaded() {
            return Value::Null;
        }
        match self.kind {
            Some(StorageKind::List | StorageKind::Stream) => self
                .fields
                .get(ITEMS_FIELD)
                .map_or_else(|| Value::Array(Vec::new()), FieldValue::to_json),
            Some(StorageKind::Binary) => self
                .fields
                .get(CONTENT_FIELD)
                .map_or(Value::Null, FieldValue::to_json),
            _ => Value::Object(
                self.fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Wire form: `{id, schemaId, loadState, reason?, data}`.
    pub fn to_json(&self) -> Value {
        let mut out = serde_json::Map::new();
        out.insert("id".into(), Value::String(self.id.as_str().to_string()));
        out.insert(
            "schemaId".into(),
            self.schema_id
                .as_ref()
                .map_or(Value::Null, |s| Value::String(s.as_str().to_string())),
        );
        out.insert(
            "loadState".into(),
            serde_json::to_value(self.load_state).unwrap_or(Value::Null),
        );
        if let Some(reason) = self.reason {
            out.insert(
                "reason".into(),
                serde_json::to_value(reason).unwrap_or(Value::Null),
            );
        }
        out.insert("data".into(), self.data());
        Value::Object(out)
    }
}

impl Serialize for ResolvedView {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Split stored data into named fields.
fn project(kind: StorageKind, data: Value) -> Vec<(String, Value)> {
    match kind {
        StorageKind::List | StorageKind::Stream => vec![(ITEMS_FIELD.to_string(), data)],
        StorageKind::Binary => vec![(CONTENT_FIELD.to_string(), data)],
        StorageKind::Map | StorageKind::Schema => match data {
            Value::Object(map) => map.into_iter().collect(),
            _ => Vec::new(),
        },
    }
}

/// Which reference fields to expand below a node.
#[derive(Clone, Copy, Debug)]
enum Plan<'a> {
    /// Everything, bounded only by `max_depth`.
    All,
    /// This many more levels.
    Levels(usize),
    /// Only the fields named by the tree.
    Tree(&'a ResolveTree),
}

impl<'a> Plan<'a> {
    /// The plan for the child behind `field`, or `None` to leave it as an id.
    fn child(self, field: &str) -> Option<Plan<'a>> {
        match self {
            Plan::All => Some(Plan::All),
            Plan::Levels(0) => None,
            Plan::Levels(n) => Some(Plan::Levels(n - 1)),
            Plan::Tree(tree) => tree.get(field).map(|node| match &node.resolve {
                Some(sub) => Plan::Tree(sub),
                None => Plan::Levels(node.depth.unwrap_or(1).saturating_sub(1)),
            }),
        }
    }
}

pub struct ReferenceResolver {
    store: Arc<dyn ValueStore>,
    schemas: Arc<SchemaStore>,
    max_depth: usize,
}

impl ReferenceResolver {
    pub fn new(store: Arc<dyn ValueStore>, schemas: Arc<SchemaStore>, max_depth: usize) -> Self {
        Self {
            store,
            schemas,
            max_depth,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Resolve `id`, expanding every reference field. `depth` is the depth
    /// `id` itself sits at.
    pub async fn resolve(&self, id: &DocId, depth: usize) -> ResolvedView {
        self.resolve_node(id.clone(), None, depth, Vec::new(), Plan::All)
            .await
    }

    /// Resolve `id`, expanding only what `tree` names.
    pub async fn resolve_selected(&self, id: &DocId, tree: &ResolveTree) -> ResolvedView {
        self.resolve_node(id.clone(), None, 0, Vec::new(), Plan::Tree(tree))
            .await
    }

    /// Resolve `id` with every reference left as an identifier.
    pub async fn resolve_shallow(&self, id: &DocId) -> ResolvedView {
        self.resolve_node(id.clone(), None, 0, Vec::new(), Plan::Levels(0))
            .await
    }

    fn resolve_node<'a>(
        &'a self,
        id: DocId,
        expected: Option<SchemaId>,
        depth: usize,
        mut path: Vec<DocId>,
        plan: Plan<'a>,
    ) -> BoxFuture<'a, ResolvedView> {
        async move {
            let stored = match self.store.load(&id).await {
                Ok(Some(stored)) => stored,
                Ok(None) => {
                    return ResolvedView::marker(
                        id,
                        expected,
                        LoadState::Unavailable,
                        Some(UnavailableReason::Missing),
                    )
                }
                Err(e) => {
                    log::warn!("loading {} failed: {}", id, e);
                    return ResolvedView::marker(
                        id,
                        expected,
                        LoadState::Unavailable,
                        Some(UnavailableReason::StoreError),
                    );
                }
            };
            let StoredValue {
                schema_id,
                kind,
                data,
                ..
            } = stored;

            let schema = match &schema_id {
                Some(sid) => match self.schemas.get(sid).await {
                    Ok(schema) => Some(schema),
                    Err(e) => {
                        log::warn!("schema {} of {} unavailable: {}", sid, id, e);
                        return ResolvedView::marker(
                            id,
                            schema_id,
                            LoadState::Unavailable,
                            Some(UnavailableReason::SchemaUnknown),
                        );
                    }
                },
                None => None,
            };

            path.push(id.clone());
            let path: &[DocId] = &path;
            let pending = project(kind, data).into_iter().map(|(name, value)| {
                let target = schema.as_ref().and_then(|s| s.reference(&name).cloned());
                let child = plan.child(&name);
                async move {
                    let field = self.field_value(value, target, depth, path, child).await;
                    (name, field)
                }
            });
            let fields = join_all(pending).await.into_iter().collect();

            ResolvedView {
                id,
                schema_id,
                kind: Some(kind),
                load_state: LoadState::Loaded,
                reason: None,
                fields,
            }
        }
        .boxed()
    }

    async fn field_value(
        &self,
        value: Value,
        target: Option<ReferenceTarget>,
        depth: usize,
        path: &[DocId],
        plan: Option<Plan<'_>>,
    ) -> FieldValue {
        let Some(target) = target else {
            return FieldValue::Value(value);
        };
        match (target.cardinality, value) {
            (Cardinality::One, Value::String(raw)) => {
                self.reference(raw, &target.schema_id, depth, path, plan)
                    .await
            }
            (Cardinality::Many, Value::Array(items)) => {
                // Stored order, duplicates kept.
                let target = &target;
                let pending = items.into_iter().map(|item| async move {
                    match item {
                        Value::String(raw) => {
                            self.reference(raw, &target.schema_id, depth, path, plan)
                                .await
                        }
                        other => FieldValue::Value(other),
                    }
                });
                FieldValue::List(join_all(pending).await)
            }
            (_, other) => FieldValue::Value(other),
        }
    }

    async fn reference(
        &self,
        raw: String,
        schema_id: &SchemaId,
        depth: usize,
        path: &[DocId],
        plan: Option<Plan<'_>>,
    ) -> FieldValue {
        if !DocId::is_valid(&raw) {
            return FieldValue::Value(Value::String(raw));
        }
        let target = DocId::new_unchecked(raw);
        let Some(plan) = plan else {
            return FieldValue::Reference(target);
        };
        if path.contains(&target) {
            return FieldValue::View(Box::new(ResolvedView::marker(
                target,
                Some(schema_id.clone()),
                LoadState::Circular,
                None,
            )));
        }
        if depth >= self.max_depth {
            return FieldValue::View(Box::new(ResolvedView::marker(
                target,
                Some(schema_id.clone()),
                LoadState::Unavailable,
                Some(UnavailableReason::DepthExceeded),
            )));
        }
        let view = self
            .resolve_node(target, Some(schema_id.clone()), depth + 1, path.to_vec(), plan)
            .await;
        FieldValue::View(Box::new(view))
    }
}
