//! Backing-store capability contract.
//!
//! The storage engine itself is out of scope; this crate consumes it through
//! three object-safe traits:
//!
//! - [`ModelBinding`]: fetch records by predicate (`get` / `filter`) and
//!   bulk-load relations ahead of resolver execution (`prefetch_related`).
//! - [`Record`]: one fetched record, offering scalar attribute lookup plus
//!   relation traversal, which implementations answer from a prefetched
//!   cache or by falling back to a per-record round-trip.
//! - [`Connection`]: the statement-execution entry point plus backend
//!   metadata. This is the seam the query-log instrumentation wraps.

use std::fmt;
use std::sync::Arc;

use async_graphql::Value;
use serde::Serialize;
use thiserror::Error;

/// Shared handle to a fetched record.
pub type RecordRef = Arc<dyn Record>;

/// Shared handle to a backing-store connection.
pub type ConnectionRef = Arc<dyn Connection>;

/// Errors surfaced by backing-store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A single-object fetch matched more than one record. This is a broken
    /// data-model invariant, not a recoverable query error.
    #[error("expected at most one record matching [{predicate}], found {found}")]
    MultipleResults { predicate: String, found: usize },

    /// The record does not define the requested relation.
    #[error("unknown relation '{relation}' on '{record}'")]
    UnknownRelation { record: String, relation: String },

    /// No connection was registered under the alias the binding asked for.
    #[error("no connection registered under alias '{alias}'")]
    MissingConnection { alias: String },

    /// Anything else the backing store wants to report.
    #[error("backing store error: {0}")]
    Backend(String),
}

// ============================================================================
// Predicates
// ============================================================================

/// One constraint on a single field: equality or set membership.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
}

impl Filter {
    /// Equality filter, from a scalar root argument.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Membership filter, from a sequence-valued root argument.
    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In {
            field: field.into(),
            values,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Filter::Eq { field, .. } | Filter::In { field, .. } => field,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Eq { field, value } => write!(f, "{field} = {value}"),
            Filter::In { field, values } => {
                write!(f, "{field} IN [")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// ANDed set of [`Filter`]s. There is no OR.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    filters: Vec<Filter>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    pub fn with(mut self, filter: Filter) -> Self {
        self.push(filter);
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                write!(f, " AND ")?;
            }
            write!(f, "{filter}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Prefetch paths
// ============================================================================

/// A dotted relation-traversal path (`a.b.c`) describing one bulk-load
/// operation the backing store performs ahead of resolver execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PrefetchPath(String);

impl PrefetchPath {
    pub fn new(path: impl Into<String>) -> Self {
        PrefetchPath(path.into())
    }

    /// Path-join rule: `outer + "." + inner`.
    pub fn join(&self, inner: &PrefetchPath) -> PrefetchPath {
        PrefetchPath(format!("{}.{}", self.0, inner.0))
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// First relation segment.
    pub fn head(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// Everything past the first segment, if any.
    pub fn tail(&self) -> Option<PrefetchPath> {
        self.0
            .split_once('.')
            .map(|(_, rest)| PrefetchPath(rest.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrefetchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrefetchPath {
    fn from(path: &str) -> Self {
        PrefetchPath::new(path)
    }
}

// ============================================================================
// Capability traits
// ============================================================================

/// One backing-model record.
pub trait Record: Send + Sync {
    /// Scalar attribute lookup. `None` when the attribute is absent; the
    /// default field resolver renders that as null.
    fn attr(&self, name: &str) -> Option<Value>;

    /// Traverse a to-one relation.
    fn related_one(&self, name: &str) -> Result<Option<RecordRef>, StoreError>;

    /// Traverse a to-many relation. Implementations should answer from the
    /// prefetched cache when the relation was bulk-loaded; a fallback
    /// per-record round-trip is permitted for un-hinted fields.
    fn related_many(&self, name: &str) -> Result<Vec<RecordRef>, StoreError>;

    /// Escape hatch so a store implementation can recover its concrete
    /// record type (e.g. inside `prefetch_related`).
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The binding between a graph type and its backing model.
pub trait ModelBinding: Send + Sync {
    /// Single-object fetch. Returns `None` on zero matches and
    /// [`StoreError::MultipleResults`] when more than one record matches:
    /// that case is a broken invariant, not a user error.
    fn get(&self, conn: &ConnectionRef, predicate: &Predicate)
    -> Result<Option<RecordRef>, StoreError>;

    /// List fetch.
    fn filter(&self, conn: &ConnectionRef, predicate: &Predicate)
    -> Result<Vec<RecordRef>, StoreError>;

    /// Bulk-load the given relation paths for the whole collection, one
    /// round-trip per relation hop rather than one per parent record, and
    /// return the (now cache-backed) collection.
    fn prefetch_related(
        &self,
        conn: &ConnectionRef,
        records: Vec<RecordRef>,
        paths: &[PrefetchPath],
    ) -> Result<Vec<RecordRef>, StoreError>;

    /// Alias of the connection this binding wants to execute against.
    fn connection_alias(&self) -> &str {
        "default"
    }
}

/// A backing-store connection: backend metadata plus the wrappable
/// statement-execution entry point.
pub trait Connection: Send + Sync {
    /// Backend dialect/vendor name (e.g. "sqlite", "postgresql", "memory").
    fn vendor(&self) -> &str;

    /// Connection alias, used to match bindings to connections.
    fn alias(&self) -> &str;

    /// Execute one statement. Returns an implementation-defined row count.
    fn execute(&self, statement: &str, params: &[Value]) -> Result<u64, StoreError>;

    /// When this connection is an instrumentation proxy, the connection it
    /// wraps. Used to keep wrapping idempotent and unwrapping symmetric.
    fn instrumented_inner(&self) -> Option<ConnectionRef> {
        None
    }
}

/// The set of connections available to one execution, looked up by alias.
#[derive(Clone, Default)]
pub struct ConnectionSet {
    connections: Vec<ConnectionRef>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, conn: ConnectionRef) {
        self.connections.push(conn);
    }

    pub fn with(mut self, conn: ConnectionRef) -> Self {
        self.add(conn);
        self
    }

    pub fn get(&self, alias: &str) -> Option<ConnectionRef> {
        self.connections.iter().find(|c| c.alias() == alias).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRef> {
        self.connections.iter()
    }

    /// Apply `f` to every connection, producing a new set. Used by the
    /// instrumentation plugin to swap in execution-scoped proxies without
    /// touching shared state.
    pub fn map(&self, f: impl Fn(&ConnectionRef) -> ConnectionRef) -> ConnectionSet {
        ConnectionSet {
            connections: self.connections.iter().map(f).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
