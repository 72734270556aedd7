//! Configuration-time errors.
//!
//! Everything here is fatal: a [`SchemaError`] means the declared type graph
//! cannot be turned into an executable schema and startup should abort.
//! Query-time failures are reported per-field by the executor instead and
//! never appear as a `SchemaError`.

use thiserror::Error;

/// Errors raised while declaring types or assembling the executable schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A symbolic type name was registered twice. Registration is
    /// first-write-wins-never: the second registration always fails, even if
    /// the two declarations are structurally identical.
    #[error(
        "type '{name}' is already registered (known types: {known}); \
         cannot register the same type more than once",
        known = known.join(", ")
    )]
    DuplicateType { name: String, known: Vec<String> },

    /// A field referred to a symbolic type name that was never registered.
    /// Raised at schema assembly, not at declaration time, since forward
    /// references are legal.
    #[error(
        "unknown type '{name}' (known types: {known}); \
         declare it with TypeRegistry::declare(\"{name}\") before building the schema",
        known = known.join(", ")
    )]
    UnknownType { name: String, known: Vec<String> },

    /// A type declaration mixed `TypeRef`s obtained from different
    /// registry instances.
    #[error("type '{type_name}' declares fields from more than one registry")]
    MixedRegistry { type_name: String },

    /// A filter argument named a field that is not a declared scalar field
    /// of the type.
    #[error("filter '{field}' on type '{type_name}' is not a declared scalar field")]
    InvalidFilterField { type_name: String, field: String },

    /// Two root-capable types (or an injected root field) produced the same
    /// root query field name.
    #[error("root field '{name}' is provided by more than one registered type or plugin")]
    DuplicateRootField { name: String },

    /// A plugin failed while entering the pipeline. Previously entered
    /// plugins are still torn down before this propagates.
    #[error("plugin '{plugin}' failed to apply: {message}")]
    Plugin { plugin: String, message: String },

    /// The executor rejected the assembled schema.
    #[error("invalid schema: {0}")]
    Invalid(#[from] async_graphql::dynamic::SchemaError),
}
