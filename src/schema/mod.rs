//! Schemas as first-class stored values
//!
//! Descriptors describe the shape of stored values and are stored values
//! themselves. A bootstrap meta-schema validates every descriptor, itself
//! included.

mod descriptor;
mod store;
pub mod validate;

pub use descriptor::{
    check_against_meta, meta_schema, Cardinality, CompiledSchema, FieldSpec, ReferenceTarget,
    SchemaDescriptor, SchemaId, ValidationReport, ValueType, ITEMS_FIELD, SELF_TARGET,
};
pub use store::{CollectionRef, RegistryEntry, SchemaStore};
