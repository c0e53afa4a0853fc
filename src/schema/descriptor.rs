//! Schema descriptors and the meta-schema
//!
//! A descriptor is itself a stored value. Its `selfSchemaId` names the schema
//! that validates it; following that chain always ends at the bootstrap
//! meta-schema, which validates itself.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::validate;
use crate::store::{DocId, StorageKind};

pub type SchemaId = DocId;

/// Placeholder written into the meta-schema before it has an identity.
pub const PROVISIONAL_SELF: &str = "provisional:self";

/// A reference target meaning "the schema being registered".
pub const SELF_TARGET: &str = "self";

/// Name of the field list-kind schemas use to describe their elements.
pub const ITEMS_FIELD: &str = "items";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Map,
    List,
    Any,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Integer => "integer",
            ValueType::Boolean => "boolean",
            ValueType::Map => "map",
            ValueType::List => "list",
            ValueType::Any => "any",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Number | ValueType::Integer)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub value_type: ValueType,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_reference: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_schema_id: Option<SchemaId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

impl FieldSpec {
    pub fn of(value_type: ValueType) -> Self {
        Self {
            value_type,
            is_reference: false,
            referenced_schema_id: None,
            min_length: None,
            max_length: None,
            minimum: None,
            maximum: None,
        }
    }

    pub fn string() -> Self {
        Self::of(ValueType::String)
    }

    pub fn number() -> Self {
        Self::of(ValueType::Number)
    }

    pub fn integer() -> Self {
        Self::of(ValueType::Integer)
    }

    pub fn boolean() -> Self {
        Self::of(ValueType::Boolean)
    }

    pub fn map() -> Self {
        Self::of(ValueType::Map)
    }

    pub fn list() -> Self {
        Self::of(ValueType::List)
    }

    pub fn any() -> Self {
        Self::of(ValueType::Any)
    }

    /// A single reference to a value of `target`.
    pub fn reference(target: SchemaId) -> Self {
        Self {
            is_reference: true,
            referenced_schema_id: Some(target),
            ..Self::string()
        }
    }

    /// An ordered list of references to values of `target`.
    pub fn reference_list(target: SchemaId) -> Self {
        Self {
            is_reference: true,
            referenced_schema_id: Some(target),
            ..Self::list()
        }
    }

    pub fn min_length(mut self, n: usize) -> Self {
        self.min_length = Some(n);
        self
    }

    pub fn max_length(mut self, n: usize) -> Self {
        self.max_length = Some(n);
        self
    }

    pub fn minimum(mut self, n: f64) -> Self {
        self.minimum = Some(n);
        self
    }

    pub fn maximum(mut self, n: f64) -> Self {
        self.maximum = Some(n);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SchemaId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_schema_id: Option<SchemaId>,

    #[serde(default)]
    pub name: String,

    pub kind: StorageKind,

    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,

    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>, kind: StorageKind) -> Self {
        Self {
            id: None,
            self_schema_id: None,
            name: name.into(),
            kind,
            fields: BTreeMap::new(),
            required_fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn required(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();
        self.required_fields.push(name.clone());
        self.fields.insert(name, spec);
        self
    }

    /// Parse a `registerSchema` definition.
    pub fn from_definition(name: &str, definition: serde_json::Value) -> Result<Self, String> {
        let mut descriptor: SchemaDescriptor =
            serde_json::from_value(definition).map_err(|e| format!("definition: {e}"))?;
        descriptor.name = name.to_string();
        Ok(descriptor)
    }

    pub fn is_required(&self, field: &str) -> bool {
        self.required_fields.iter().any(|f| f == field)
    }

    /// Give the descriptor its storage identity, rewriting `self` targets.
    pub(crate) fn anchored(mut self, id: SchemaId) -> Self {
        for spec in self.fields.values_mut() {
            let is_self = spec
                .referenced_schema_id
                .as_ref()
                .map_or(false, |t| t.as_str() == SELF_TARGET || t.as_str() == PROVISIONAL_SELF);
            if is_self {
                spec.referenced_schema_id = Some(id.clone());
            }
        }
        if self.self_schema_id.as_ref().map_or(true, |s| s.as_str() == PROVISIONAL_SELF) {
            self.self_schema_id = Some(id.clone());
        }
        self.id = Some(id);
        self
    }

    /// Whether two descriptors describe the same shape, ignoring identity.
    pub fn same_definition(&self, other: &SchemaDescriptor) -> bool {
        let a = self.normalized();
        let b = other.normalized();
        let req_a: BTreeSet<&String> = a.required_fields.iter().collect();
        let req_b: BTreeSet<&String> = b.required_fields.iter().collect();
        a.kind == b.kind && a.fields == b.fields && req_a == req_b
    }

    /// Own-id reference targets written back as `self`.
    fn normalized(&self) -> SchemaDescriptor {
        let mut out = self.clone();
        if let Some(own) = &self.id {
            for spec in out.fields.values_mut() {
                if spec.referenced_schema_id.as_ref() == Some(own) {
                    spec.referenced_schema_id = Some(DocId::new_unchecked(SELF_TARGET));
                }
            }
        }
        out
    }
}

/// Synthesize the meta-schema. Before bootstrap it carries a provisional
/// self-reference; [`SchemaDescriptor::anchored`] patches it.
pub fn meta_schema() -> SchemaDescriptor {
    let provisional = DocId::new_unchecked(PROVISIONAL_SELF);
    SchemaDescriptor::new("Schema", StorageKind::Schema)
        .field("id", FieldSpec::string())
        .required("selfSchemaId", FieldSpec::reference(provisional))
        .required("name", FieldSpec::string().min_length(1).max_length(128))
        .required("kind", FieldSpec::string())
        .required("fields", FieldSpec::map())
        .required("requiredFields", FieldSpec::list())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Check `descriptor` against `meta`: its serialized form must satisfy the
/// meta-schema's field specs, and its field specs must be well formed.
/// Whether referenced schemas exist is checked by the schema store.
pub fn check_against_meta(descriptor: &SchemaDescriptor, meta: &SchemaDescriptor) -> ValidationReport {
    let mut errors = Vec::new();

    match serde_json::to_value(descriptor) {
        Ok(json) => {
            errors.extend(
                validate::validate_full(meta, &json)
                    .into_iter()
                    .map(|v| v.to_string()),
            );
        }
        Err(e) => errors.push(format!("descriptor does not serialize: {e}")),
    }

    for (name, spec) in &descriptor.fields {
        let path = format!("/fields/{name}");
        if name.is_empty() {
            errors.push("/fields: empty field name".to_string());
        }
        if spec.is_reference {
            if spec.referenced_schema_id.is_none() {
                errors.push(format!("{path}: reference field needs referencedSchemaId"));
            }
            if !matches!(spec.value_type, ValueType::String | ValueType::List) {
                errors.push(format!(
                    "{path}: reference field must be string or list, not {}",
                    spec.value_type.as_str()
                ));
            }
        } else if spec.referenced_schema_id.is_some() {
            errors.push(format!("{path}: referencedSchemaId set on a non-reference field"));
        }
        if (spec.min_length.is_some() || spec.max_length.is_some())
            && !matches!(spec.value_type, ValueType::String | ValueType::List)
        {
            errors.push(format!("{path}: length bounds need a string or list field"));
        }
        if let (Some(min), Some(max)) = (spec.min_length, spec.max_length) {
            if min > max {
                errors.push(format!("{path}: minLength exceeds maxLength"));
            }
        }
        if (spec.minimum.is_some() || spec.maximum.is_some()) && !spec.value_type.is_numeric() {
            errors.push(format!("{path}: numeric bounds need a number or integer field"));
        }
        if let (Some(min), Some(max)) = (spec.minimum, spec.maximum) {
            if min > max {
                errors.push(format!("{path}: minimum exceeds maximum"));
            }
        }
    }

    let mut seen = BTreeSet::new();
    for required in &descriptor.required_fields {
        if !descriptor.fields.contains_key(required) {
            errors.push(format!("/requiredFields: `{required}` is not a declared field"));
        }
        if !seen.insert(required) {
            errors.push(format!("/requiredFields: `{required}` listed twice"));
        }
    }

    if descriptor.kind.is_sequence() {
        if let Some(extra) = descriptor.fields.keys().find(|k| k.as_str() != ITEMS_FIELD) {
            errors.push(format!(
                "/fields/{extra}: {} schemas only declare `{ITEMS_FIELD}`",
                descriptor.kind
            ));
        }
        if let Some(items) = descriptor.fields.get(ITEMS_FIELD) {
            if items.value_type != ValueType::List {
                errors.push(format!("/fields/{ITEMS_FIELD}: must be a list field"));
            }
        }
    }

    if descriptor.kind == StorageKind::Binary && !descriptor.fields.is_empty() {
        errors.push("/fields: binary schemas declare no fields".to_string());
    }

    ValidationReport::from_errors(errors)
}

/// Reference cardinality of a compiled reference field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceTarget {
    pub schema_id: SchemaId,
    pub cardinality: Cardinality,
}

/// A descriptor plus its reference lookup table, built once per schema.
#[derive(Clone, Debug)]
pub struct CompiledSchema {
    pub descriptor: SchemaDescriptor,
    references: BTreeMap<String, ReferenceTarget>,
}

impl CompiledSchema {
    pub fn compile(descriptor: SchemaDescriptor) -> Self {
        let references = descriptor
            .fields
            .iter()
            .filter(|(_, spec)| spec.is_reference)
            .filter_map(|(name, spec)| {
                let schema_id = spec.referenced_schema_id.clone()?;
                let cardinality = if spec.value_type == ValueType::List {
                    Cardinality::Many
                } else {
                    Cardinality::One
                };
                Some((name.clone(), ReferenceTarget { schema_id, cardinality }))
            })
            .collect();
        Self {
            descriptor,
            references,
        }
    }

    pub fn id(&self) -> Option<&SchemaId> {
        self.descriptor.id.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn kind(&self) -> StorageKind {
        self.descriptor.kind
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.descriptor.fields.get(name)
    }

    pub fn reference(&self, field: &str) -> Option<&ReferenceTarget> {
        self.references.get(field)
    }

    pub fn references(&self) -> impl Iterator<Item = (&String, &ReferenceTarget)> {
        self.references.iter()
    }
}
