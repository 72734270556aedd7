//! Declarative GraphQL bindings over a relational-style backing store.
//!
//! Data-model types are declared once against a [`TypeRegistry`] (fields,
//! filter arguments, prefetch hints, custom resolvers and the binding to
//! their backing model) and compiled into an executable schema with
//! synthesized resolvers. Nested selections are turned into relation
//! prefetch paths ahead of execution, so resolving a collection costs one
//! round-trip per relation hop instead of one per record.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use graphbind::{SchemaSpec, TypeRegistry};
//! # fn binding() -> Arc<dyn graphbind::ModelBinding> { unimplemented!() }
//! # fn connection() -> graphbind::ConnectionRef { unimplemented!() }
//! # async fn demo() -> Result<(), graphbind::SchemaError> {
//! let registry = TypeRegistry::new();
//! registry
//!     .declare("Item")
//!     .field("id", registry.type_ref("Int"))
//!     .field("name", registry.type_ref("String"))
//!     .field("containers", registry.type_ref("Container").list())
//!     .prefetch("containers", ["containers"])
//!     .filterable(["id", "name"])
//!     .bind(binding())
//!     .register()?;
//! registry
//!     .declare("Container")
//!     .field("id", registry.type_ref("Int"))
//!     .field("name", registry.type_ref("String"))
//!     .register()?;
//!
//! let schema = SchemaSpec::new(registry)
//!     .connection(connection())
//!     .build()?;
//! let response = schema.execute(r#"{ item(name: "item_4") { id name } }"#).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod error;
pub mod instrument;
pub mod plugin;
pub mod prefetch;
pub mod registry;
pub mod schema;
pub mod store;

pub use async_graphql;

pub use crate::builder::{CompiledType, FieldDef, FieldResolver, GraphTypeBuilder, Resolved};
pub use crate::error::SchemaError;
pub use crate::instrument::{
    DEBUG_FIELD, InstrumentedConnection, QueryLog, QueryLogPlugin, StatementRecord,
};
pub use crate::plugin::{Plugin, PluginContext, PluginStack, ScopedTransform};
pub use crate::prefetch::{Selection, prefetch_paths};
pub use crate::registry::{RegistryEntry, SCALAR_TYPES, TypeRef, TypeRegistry};
pub use crate::schema::{BoundRecord, GraphSchema, InjectedRootField, RootScope, SchemaSpec};
pub use crate::store::{
    Connection, ConnectionRef, ConnectionSet, Filter, ModelBinding, Predicate, PrefetchPath,
    Record, RecordRef, StoreError,
};
