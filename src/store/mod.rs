//! Value store adapter
//!
//! The value store is the replicated, content-addressed backend everything in
//! this crate reads from and writes to. Merge semantics, identity and sync all
//! live behind the [`ValueStore`] trait; this layer only relies on load,
//! subscribe and create (plus write/release for mutations).

mod memory;

pub use memory::MemoryStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("Value not found: {0}")]
    NotFound(DocId),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Opaque identifier naming one stored value.
///
/// Identifiers carry no type information. A string stored in a field is only
/// a reference because the owning schema says so.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    /// Longest identifier accepted by [`DocId::parse`].
    pub const MAX_LEN: usize = 256;

    /// Parse and syntax-check an identifier.
    pub fn parse(raw: impl Into<String>) -> Result<Self, StoreError> {
        let raw = raw.into();
        if Self::is_valid(&raw) {
            Ok(Self(raw))
        } else {
            Err(StoreError::InvalidId(raw))
        }
    }

    /// 1–256 characters from `[A-Za-z0-9:._-]`.
    pub fn is_valid(raw: &str) -> bool {
        !raw.is_empty()
            && raw.len() <= Self::MAX_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a string the caller has already checked (or generated).
    pub(crate) fn new_unchecked(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Storage primitive backing a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Map,
    List,
    Stream,
    Binary,
    /// Schema descriptors. Only the meta-schema describes values of this kind.
    Schema,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Map => "map",
            StorageKind::List => "list",
            StorageKind::Stream => "stream",
            StorageKind::Binary => "binary",
            StorageKind::Schema => "schema",
        }
    }

    /// Whether values of this kind hold a JSON array.
    pub fn is_sequence(&self) -> bool {
        matches!(self, StorageKind::List | StorageKind::Stream)
    }

    /// The cleared contents of a value of this kind.
    pub fn empty_data(&self) -> serde_json::Value {
        match self {
            StorageKind::Map | StorageKind::Schema => serde_json::json!({}),
            StorageKind::List | StorageKind::Stream => serde_json::json!([]),
            StorageKind::Binary => serde_json::Value::String(String::new()),
        }
    }

    /// Whether `data` has the JSON shape this kind stores.
    pub fn accepts(&self, data: &serde_json::Value) -> bool {
        match self {
            StorageKind::Map | StorageKind::Schema => data.is_object(),
            StorageKind::List | StorageKind::Stream => data.is_array(),
            StorageKind::Binary => data.is_string(),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope every stored value carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredValue {
    /// Schema validating `data`. Schema descriptors point at the meta-schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<DocId>,
    pub kind: StorageKind,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl StoredValue {
    pub fn new(kind: StorageKind, schema_id: Option<DocId>, data: serde_json::Value) -> Self {
        Self {
            schema_id,
            kind,
            data,
            updated_at: Utc::now(),
        }
    }

    /// Same envelope, new contents.
    pub fn with_data(&self, data: serde_json::Value) -> Self {
        Self {
            schema_id: self.schema_id.clone(),
            kind: self.kind,
            data,
            updated_at: Utc::now(),
        }
    }
}

/// Callback invoked with the new envelope whenever a stored value changes.
pub type ChangeCallback = Arc<dyn Fn(&StoredValue) + Send + Sync>;

/// Handle returned by [`ValueStore::subscribe`].
pub type StoreHandle = Uuid;

/// The outbound contract this layer depends on but does not implement.
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Load the current value. `Ok(None)` means the value is unavailable
    /// (never created, or unreachable from here).
    async fn load(&self, id: &DocId) -> Result<Option<StoredValue>, StoreError>;

    /// Create a new value and return its identifier.
    async fn create(
        &self,
        kind: StorageKind,
        schema_id: Option<&DocId>,
        data: serde_json::Value,
    ) -> Result<DocId, StoreError>;

    /// Replace the contents of an existing value.
    async fn write(&self, id: &DocId, value: StoredValue) -> Result<(), StoreError>;

    /// Register a change callback for one identifier.
    fn subscribe(&self, id: &DocId, on_change: ChangeCallback) -> Result<StoreHandle, StoreError>;

    /// Remove a callback registered with [`ValueStore::subscribe`].
    fn unsubscribe(&self, id: &DocId, handle: StoreHandle);

    /// Drop any locally cached state for `id`.
    async fn release(&self, _id: &DocId) {}
}
