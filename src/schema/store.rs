//! The schema store: bootstrap, registration, lookup
//!
//! # Bootstrap sequence
//!
//! ```text
//! meta-schema (provisional self-reference)
//!   ↓ create
//! real identifier
//!   ↓ anchor: id, selfSchemaId and the selfSchemaId reference target
//! write back → fixed point
//!   ↓
//! registry value (bootstrap id + entries)
//! ```
//!
//! Lookup always goes by identifier. The registry is only for listing and
//! name-level idempotency.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use super::descriptor::{
    check_against_meta, meta_schema, CompiledSchema, FieldSpec, SchemaDescriptor, SchemaId,
    ValidationReport, ITEMS_FIELD, PROVISIONAL_SELF, SELF_TARGET,
};
use crate::error::{Result, WeftError};
use crate::store::{DocId, StorageKind, StoredValue, ValueStore};

/// Where a schema's instances are listed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRef {
    /// Schema of the collection value itself (a list of references).
    pub schema_id: SchemaId,
    pub id: DocId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub name: String,
    pub schema_id: SchemaId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionRef>,
}

/// Persisted form of the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryDoc {
    bootstrap_id: SchemaId,
    #[serde(default)]
    entries: Vec<RegistryEntry>,
}

struct RegistryState {
    registry_id: DocId,
    doc: RegistryDoc,
}

pub struct SchemaStore {
    store: Arc<dyn ValueStore>,
    /// `None` until bootstrapped or opened. Held across awaits so
    /// registrations are serialized.
    registry: Mutex<Option<RegistryState>>,
    compiled: RwLock<HashMap<SchemaId, Arc<CompiledSchema>>>,
}

impl SchemaStore {
    /// A store that bootstraps a fresh meta-schema on first use.
    pub fn new(store: Arc<dyn ValueStore>) -> Self {
        Self {
            store,
            registry: Mutex::new(None),
            compiled: RwLock::new(HashMap::new()),
        }
    }

    /// Reopen a registry persisted by an earlier store.
    pub async fn open(store: Arc<dyn ValueStore>, registry_id: &DocId) -> Result<Self> {
        let stored = store
            .load(registry_id)
            .await?
            .ok_or_else(|| WeftError::NotFound(registry_id.clone()))?;
        let doc: RegistryDoc = serde_json::from_value(stored.data).map_err(|e| {
            WeftError::Config(format!("{registry_id} is not a schema registry: {e}"))
        })?;
        log::debug!(
            "opened schema registry {} ({} entries)",
            registry_id,
            doc.entries.len()
        );
        let schemas = Self::new(store);
        *schemas.registry.lock().await = Some(RegistryState {
            registry_id: registry_id.clone(),
            doc,
        });
        Ok(schemas)
    }

    /// Identifier of the persisted registry value.
    pub async fn registry_id(&self) -> Result<DocId> {
        Ok(self.registry().await?.registry_id.clone())
    }

    /// Identifier of the self-validating meta-schema.
    pub async fn bootstrap_id(&self) -> Result<SchemaId> {
        Ok(self.registry().await?.doc.bootstrap_id.clone())
    }

    async fn registry(&self) -> Result<MappedMutexGuard<'_, RegistryState>> {
        let mut guard = self.registry.lock().await;
        if guard.is_none() {
            *guard = Some(self.bootstrap().await?);
        }
        MutexGuard::try_map(guard, |state| state.as_mut())
            .map_err(|_| WeftError::Config("schema registry unavailable".into()))
    }

    async fn bootstrap(&self) -> Result<RegistryState> {
        let provisional = meta_schema();
        let data = serde_json::to_value(&provisional)?;
        let id = self.store.create(StorageKind::Schema, None, data).await?;

        let meta = provisional.anchored(id.clone());
        let report = check_against_meta(&meta, &meta);
        if !report.valid {
            return Err(WeftError::SchemaInvalid {
                errors: report.errors,
            });
        }
        self.store
            .write(
                &id,
                StoredValue::new(
                    StorageKind::Schema,
                    Some(id.clone()),
                    serde_json::to_value(&meta)?,
                ),
            )
            .await?;
        self.cache(Arc::new(CompiledSchema::compile(meta)));

        let doc = RegistryDoc {
            bootstrap_id: id.clone(),
            entries: Vec::new(),
        };
        let registry_id = self
            .store
            .create(StorageKind::Map, None, serde_json::to_value(&doc)?)
            .await?;
        log::debug!("bootstrapped meta-schema {} (registry {})", id, registry_id);
        Ok(RegistryState { registry_id, doc })
    }

    fn cached(&self, id: &SchemaId) -> Option<Arc<CompiledSchema>> {
        self.compiled.read().ok()?.get(id).cloned()
    }

    fn cache(&self, schema: Arc<CompiledSchema>) {
        if let (Some(id), Ok(mut compiled)) = (schema.id().cloned(), self.compiled.write()) {
            compiled.insert(id, schema);
        }
    }

    /// Look a schema up by identifier.
    pub async fn get(&self, id: &SchemaId) -> Result<Arc<CompiledSchema>> {
        if let Some(hit) = self.cached(id) {
            return Ok(hit);
        }
        let stored = self
            .store
            .load(id)
            .await?
            .filter(|v| v.kind == StorageKind::Schema)
            .ok_or_else(|| WeftError::SchemaNotFound(id.clone()))?;
        let mut descriptor: SchemaDescriptor = serde_json::from_value(stored.data)
            .map_err(|e| WeftError::schema_invalid(format!("stored descriptor {id}: {e}")))?;
        if descriptor.id.is_none() {
            descriptor.id = Some(id.clone());
        }
        let compiled = Arc::new(CompiledSchema::compile(descriptor));
        self.cache(compiled.clone());
        Ok(compiled)
    }

    /// All registered schemas, in registration order.
    pub async fn list(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.registry().await?.doc.entries.clone())
    }

    /// Validate a candidate descriptor against the meta-schema, including
    /// that every referenced schema exists.
    pub async fn validate_against_self(&self, descriptor: &SchemaDescriptor) -> Result<ValidationReport> {
        let bootstrap_id = self.bootstrap_id().await?;
        self.validate_with(descriptor, &bootstrap_id).await
    }

    async fn validate_with(
        &self,
        descriptor: &SchemaDescriptor,
        bootstrap_id: &SchemaId,
    ) -> Result<ValidationReport> {
        let meta = self.get(bootstrap_id).await?;
        let mut report = check_against_meta(descriptor, &meta.descriptor);

        let mut targets = BTreeSet::new();
        for spec in descriptor.fields.values() {
            if let Some(target) = &spec.referenced_schema_id {
                targets.insert(target.clone());
            }
        }
        if let Some(parent) = &descriptor.self_schema_id {
            targets.insert(parent.clone());
        }
        for target in targets {
            let own = descriptor.id.as_ref() == Some(&target);
            let placeholder = matches!(target.as_str(), SELF_TARGET | PROVISIONAL_SELF);
            if own || placeholder {
                continue;
            }
            match self.get(&target).await {
                Ok(_) => {}
                Err(WeftError::SchemaNotFound(_)) => {
                    report.errors.push(format!("unknown schema {target}"));
                }
                Err(e) => return Err(e),
            }
        }
        report.valid = report.errors.is_empty();
        Ok(report)
    }

    /// Register `descriptor` under `name`.
    ///
    /// Identical re-registration returns the existing id. A new definition
    /// under an existing name registers a new version.
    pub async fn register(&self, name: &str, descriptor: SchemaDescriptor) -> Result<SchemaId> {
        let mut state = self.registry().await?;
        let bootstrap_id = state.doc.bootstrap_id.clone();

        let mut descriptor = descriptor;
        descriptor.name = name.to_string();
        descriptor.id = None;
        descriptor.self_schema_id = Some(bootstrap_id.clone());

        if descriptor.kind == StorageKind::Schema {
            return Err(WeftError::schema_invalid(
                "kind `schema` is reserved for the meta-schema",
            ));
        }
        let report = self.validate_with(&descriptor, &bootstrap_id).await?;
        if !report.valid {
            return Err(WeftError::SchemaInvalid {
                errors: report.errors,
            });
        }

        let same_name: Vec<SchemaId> = state
            .doc
            .entries
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.schema_id.clone())
            .collect();
        for existing_id in same_name.iter().rev() {
            let existing = self.get(existing_id).await?;
            if existing.descriptor.same_definition(&descriptor) {
                log::debug!("schema {} already registered as {}", name, existing_id);
                return Ok(existing_id.clone());
            }
        }
        if let Some(latest_id) = same_name.last() {
            let latest = self.get(latest_id).await?;
            if latest.kind() != descriptor.kind {
                return Err(WeftError::SchemaConflict(format!(
                    "{name} is registered as {} and cannot become {}",
                    latest.kind(),
                    descriptor.kind
                )));
            }
        }
        self.check_reference_conflicts(&descriptor, &state.doc.entries)
            .await?;

        let id = self
            .store
            .create(
                StorageKind::Schema,
                Some(&bootstrap_id),
                serde_json::to_value(&descriptor)?,
            )
            .await?;
        let descriptor = descriptor.anchored(id.clone());
        self.store
            .write(
                &id,
                StoredValue::new(
                    StorageKind::Schema,
                    Some(bootstrap_id),
                    serde_json::to_value(&descriptor)?,
                ),
            )
            .await?;
        self.cache(Arc::new(CompiledSchema::compile(descriptor)));

        state.doc.entries.push(RegistryEntry {
            name: name.to_string(),
            schema_id: id.clone(),
            collection: None,
        });
        self.persist(&state).await?;
        log::info!("registered schema {} as {}", name, id);
        Ok(id)
    }

    /// Two schemas a value could satisfy interchangeably (same kind, same
    /// field names) must agree on where each shared reference field points.
    async fn check_reference_conflicts(
        &self,
        candidate: &SchemaDescriptor,
        entries: &[RegistryEntry],
    ) -> Result<()> {
        let candidate_fields: BTreeSet<&String> = candidate.fields.keys().collect();
        for entry in entries.iter().filter(|e| e.name != candidate.name) {
            let other = self.get(&entry.schema_id).await?;
            let other_fields: BTreeSet<&String> = other.descriptor.fields.keys().collect();
            if other.kind() != candidate.kind || other_fields != candidate_fields {
                continue;
            }
            for (field, spec) in &candidate.fields {
                let Some(target) = &spec.referenced_schema_id else {
                    continue;
                };
                if let Some(existing) = other.reference(field) {
                    if &existing.schema_id != target {
                        return Err(WeftError::SchemaConflict(format!(
                            "{}.{field} references {target} but {}.{field} references {}",
                            candidate.name,
                            entry.name,
                            existing.schema_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The collection listing values of `schema_id`, created on first use.
    pub async fn collection_for(&self, schema_id: &SchemaId) -> Result<DocId> {
        let mut state = self.registry().await?;
        Ok(self.ensure_collection(&mut state, schema_id).await?.id)
    }

    async fn ensure_collection(
        &self,
        state: &mut RegistryState,
        schema_id: &SchemaId,
    ) -> Result<CollectionRef> {
        let index = state
            .doc
            .entries
            .iter()
            .position(|e| &e.schema_id == schema_id)
            .ok_or_else(|| WeftError::SchemaNotFound(schema_id.clone()))?;
        if let Some(existing) = &state.doc.entries[index].collection {
            return Ok(existing.clone());
        }

        let bootstrap_id = state.doc.bootstrap_id.clone();
        let name = format!("{}[]", state.doc.entries[index].name);
        let mut descriptor = SchemaDescriptor::new(name, StorageKind::List)
            .required(ITEMS_FIELD, FieldSpec::reference_list(schema_id.clone()));
        descriptor.self_schema_id = Some(bootstrap_id.clone());

        let collection_schema = self
            .store
            .create(
                StorageKind::Schema,
                Some(&bootstrap_id),
                serde_json::to_value(&descriptor)?,
            )
            .await?;
        let descriptor = descriptor.anchored(collection_schema.clone());
        self.store
            .write(
                &collection_schema,
                StoredValue::new(
                    StorageKind::Schema,
                    Some(bootstrap_id),
                    serde_json::to_value(&descriptor)?,
                ),
            )
            .await?;
        self.cache(Arc::new(CompiledSchema::compile(descriptor)));

        let id = self
            .store
            .create(
                StorageKind::List,
                Some(&collection_schema),
                serde_json::json!([]),
            )
            .await?;
        let collection = CollectionRef {
            schema_id: collection_schema,
            id,
        };
        state.doc.entries[index].collection = Some(collection.clone());
        self.persist(state).await?;
        log::debug!("created collection {} for {}", collection.id, schema_id);
        Ok(collection)
    }

    /// Append `id` to the collection of `schema_id`.
    pub async fn add_member(&self, schema_id: &SchemaId, id: &DocId) -> Result<()> {
        self.edit_members(schema_id, |members| members.push(id.as_str().into()))
            .await
    }

    /// Remove `id` from the collection of `schema_id`.
    pub async fn remove_member(&self, schema_id: &SchemaId, id: &DocId) -> Result<()> {
        self.edit_members(schema_id, |members| {
            members.retain(|m| m.as_str() != Some(id.as_str()))
        })
        .await
    }

    /// Load-modify-write under the registry lock so concurrent edits of one
    /// collection cannot lose each other.
    async fn edit_members(
        &self,
        schema_id: &SchemaId,
        edit: impl FnOnce(&mut Vec<serde_json::Value>),
    ) -> Result<()> {
        let mut state = self.registry().await?;
        let collection = self.ensure_collection(&mut state, schema_id).await?;
        let stored = self
            .store
            .load(&collection.id)
            .await?
            .ok_or_else(|| WeftError::NotFound(collection.id.clone()))?;
        let mut members = stored.data.as_array().cloned().unwrap_or_default();
        let before = members.clone();
        edit(&mut members);
        if members != before {
            self.store
                .write(
                    &collection.id,
                    stored.with_data(serde_json::Value::Array(members)),
                )
                .await?;
        }
        Ok(())
    }

    async fn persist(&self, state: &RegistryState) -> Result<()> {
        let stored = StoredValue::new(StorageKind::Map, None, serde_json::to_value(&state.doc)?);
        self.store.write(&state.registry_id, stored).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::descriptor::ValueType;
    use crate::store::MemoryStore;

    fn todo() -> SchemaDescriptor {
        SchemaDescriptor::new("Todo", StorageKind::Map)
            .required("text", FieldSpec::string().min_length(1))
            .required("done", FieldSpec::boolean())
    }

    fn schema_store() -> (Arc<MemoryStore>, SchemaStore) {
        let store = Arc::new(MemoryStore::new());
        let schemas = SchemaStore::new(store.clone());
        (store, schemas)
    }

    #[tokio::test]
    async fn test_bootstrap_is_a_fixed_point() {
        let (store, schemas) = schema_store();
        let meta_id = schemas.bootstrap_id().await.unwrap();

        let stored = store.load(&meta_id).await.unwrap().unwrap();
        assert_eq!(stored.kind, StorageKind::Schema);
        assert_eq!(stored.schema_id.as_ref(), Some(&meta_id));
        assert_eq!(stored.data["selfSchemaId"], meta_id.as_str());
        assert_eq!(stored.data["id"], meta_id.as_str());

        let meta = schemas.get(&meta_id).await.unwrap();
        let report = schemas
            .validate_against_self(&meta.descriptor)
            .await
            .unwrap();
        assert!(report.valid, "{:?}", report.errors);
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let (_store, schemas) = schema_store();
        let id = schemas.register("Todo", todo()).await.unwrap();

        let compiled = schemas.get(&id).await.unwrap();
        assert_eq!(compiled.name(), "Todo");
        assert_eq!(compiled.id(), Some(&id));
        assert_eq!(
            compiled.descriptor.self_schema_id,
            Some(schemas.bootstrap_id().await.unwrap())
        );
        assert_eq!(compiled.field("done").unwrap().value_type, ValueType::Boolean);
    }

    #[tokio::test]
    async fn test_identical_registration_is_idempotent() {
        let (_store, schemas) = schema_store();
        let first = schemas.register("Todo", todo()).await.unwrap();
        let second = schemas.register("Todo", todo()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(schemas.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_new_definition_is_a_new_version() {
        let (_store, schemas) = schema_store();
        let v1 = schemas.register("Todo", todo()).await.unwrap();
        let v2 = schemas
            .register("Todo", todo().field("due", FieldSpec::string()))
            .await
            .unwrap();
        assert_ne!(v1, v2);

        let names: Vec<String> = schemas
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["Todo", "Todo"]);
        // The old version stays resolvable.
        assert!(schemas.get(&v1).await.unwrap().field("due").is_none());
    }

    #[tokio::test]
    async fn test_kind_change_conflicts() {
        let (_store, schemas) = schema_store();
        schemas.register("Todo", todo()).await.unwrap();
        let err = schemas
            .register("Todo", SchemaDescriptor::new("Todo", StorageKind::List))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::SchemaConflict(_)));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_persists_nothing() {
        let (store, schemas) = schema_store();
        schemas.bootstrap_id().await.unwrap();
        let before = store.len();

        let mut spec = FieldSpec::string();
        spec.is_reference = true;
        let err = schemas
            .register("Broken", SchemaDescriptor::new("Broken", StorageKind::Map).field("x", spec))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::SchemaInvalid { .. }));
        assert_eq!(store.len(), before);
        assert!(schemas.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_reference_target_is_invalid() {
        let (_store, schemas) = schema_store();
        let err = schemas
            .register(
                "Post",
                SchemaDescriptor::new("Post", StorageKind::Map)
                    .field("author", FieldSpec::reference(DocId::new_unchecked("val:nobody"))),
            )
            .await
            .unwrap_err();
        match err {
            WeftError::SchemaInvalid { errors } => {
                assert_eq!(errors, vec!["unknown schema val:nobody".to_string()])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_self_reference_is_anchored() {
        let (_store, schemas) = schema_store();
        let node = SchemaDescriptor::new("Node", StorageKind::Map)
            .field("parent", FieldSpec::reference(DocId::new_unchecked(SELF_TARGET)));
        let id = schemas.register("Node", node.clone()).await.unwrap();

        let compiled = schemas.get(&id).await.unwrap();
        assert_eq!(compiled.reference("parent").unwrap().schema_id, id);
        assert_eq!(schemas.register("Node", node).await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_interchangeable_schemas_must_agree_on_references() {
        let (_store, schemas) = schema_store();
        let user = schemas
            .register("User", SchemaDescriptor::new("User", StorageKind::Map))
            .await
            .unwrap();
        let team = schemas
            .register("Team", SchemaDescriptor::new("Team", StorageKind::Map).field("x", FieldSpec::string()))
            .await
            .unwrap();

        schemas
            .register(
                "Note",
                SchemaDescriptor::new("Note", StorageKind::Map).field("owner", FieldSpec::reference(user.clone())),
            )
            .await
            .unwrap();
        let err = schemas
            .register(
                "Memo",
                SchemaDescriptor::new("Memo", StorageKind::Map).field("owner", FieldSpec::reference(team.clone())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::SchemaConflict(_)));

        // A structurally different schema may point the same field elsewhere.
        schemas
            .register(
                "Badge",
                SchemaDescriptor::new("Badge", StorageKind::Map)
                    .field("owner", FieldSpec::reference(team))
                    .field("label", FieldSpec::string()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collections_track_members() {
        let (store, schemas) = schema_store();
        let todo_id = schemas.register("Todo", todo()).await.unwrap();
        let collection = schemas.collection_for(&todo_id).await.unwrap();
        assert_eq!(schemas.collection_for(&todo_id).await.unwrap(), collection);

        let a = DocId::new_unchecked("val:a");
        let b = DocId::new_unchecked("val:b");
        schemas.add_member(&todo_id, &a).await.unwrap();
        schemas.add_member(&todo_id, &b).await.unwrap();
        schemas.remove_member(&todo_id, &a).await.unwrap();

        let stored = store.load(&collection).await.unwrap().unwrap();
        assert_eq!(stored.data, serde_json::json!(["val:b"]));
        assert_eq!(stored.kind, StorageKind::List);

        let entry = &schemas.list().await.unwrap()[0];
        let collection_schema = schemas
            .get(&entry.collection.as_ref().unwrap().schema_id)
            .await
            .unwrap();
        assert_eq!(collection_schema.name(), "Todo[]");
        assert_eq!(collection_schema.reference(ITEMS_FIELD).unwrap().schema_id, todo_id);
    }

    #[tokio::test]
    async fn test_reopen_registry() {
        let (store, schemas) = schema_store();
        let todo_id = schemas.register("Todo", todo()).await.unwrap();
        let registry_id = schemas.registry_id().await.unwrap();
        let bootstrap_id = schemas.bootstrap_id().await.unwrap();

        let persisted = store.load(&registry_id).await.unwrap().unwrap();
        assert_eq!(persisted.kind, StorageKind::Map);
        assert_eq!(persisted.data["bootstrapId"], serde_json::json!(bootstrap_id.as_str()));
        assert_eq!(persisted.data["entries"][0]["schemaId"], serde_json::json!(todo_id.as_str()));

        let reopened = SchemaStore::open(store.clone(), &registry_id).await.unwrap();
        assert_eq!(reopened.bootstrap_id().await.unwrap(), bootstrap_id);
        assert_eq!(reopened.register("Todo", todo()).await.unwrap(), todo_id);
        assert_eq!(reopened.get(&todo_id).await.unwrap().name(), "Todo");
    }

    #[tokio::test]
    async fn test_get_rejects_non_schema_values() {
        let (store, schemas) = schema_store();
        let id = store
            .create(StorageKind::Map, None, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(
            schemas.get(&id).await.unwrap_err(),
            WeftError::SchemaNotFound(id)
        );
    }
}
