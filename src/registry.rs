//! The type registry: the single source of truth mapping symbolic type names
//! to compiled graph types and their backing-model bindings.
//!
//! Field declarations refer to types through [`TypeRef`]s, which are deferred
//! symbolic keys rather than owners. Resolution happens at schema assembly,
//! so two types may reference each other regardless of declaration order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::builder::{CompiledType, GraphTypeBuilder};
use crate::error::SchemaError;

/// Scalar types every registry starts with.
pub const SCALAR_TYPES: &[&str] = &["Boolean", "Float", "ID", "Int", "String"];

static REGISTRY_IDS: AtomicU64 = AtomicU64::new(0);

/// What a registry entry points at.
#[derive(Clone)]
pub enum EntryKind {
    /// A built-in scalar.
    Scalar,
    /// A compiled user-declared object type.
    Object(Arc<CompiledType>),
}

/// A registered graph type: symbolic name plus its compiled form.
#[derive(Clone)]
pub struct RegistryEntry {
    name: String,
    kind: EntryKind,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RegistryEntry {
    pub(crate) fn scalar(name: impl Into<String>) -> Self {
        RegistryEntry {
            name: name.into(),
            kind: EntryKind::Scalar,
        }
    }

    pub(crate) fn object(name: impl Into<String>, compiled: Arc<CompiledType>) -> Self {
        RegistryEntry {
            name: name.into(),
            kind: EntryKind::Object(compiled),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, EntryKind::Scalar)
    }

    /// The compiled type, for object entries.
    pub fn compiled(&self) -> Option<&Arc<CompiledType>> {
        match &self.kind {
            EntryKind::Scalar => None,
            EntryKind::Object(compiled) => Some(compiled),
        }
    }

    /// Root-capable entries contribute root query fields: object types with
    /// a backing-model binding.
    pub fn is_root_capable(&self) -> bool {
        self.compiled().is_some_and(|c| c.is_root_capable())
    }
}

/// A deferred, symbolic pointer to a (possibly not-yet-registered) type,
/// optionally parameterized as "list of". Not an owner of the target type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    type_name: String,
    is_list: bool,
    registry_id: u64,
}

impl TypeRef {
    /// Mark this reference as "list of" its target.
    pub fn list(mut self) -> Self {
        self.is_list = true;
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_list(&self) -> bool {
        self.is_list
    }

    pub(crate) fn registry_id(&self) -> u64 {
        self.registry_id
    }
}

#[derive(Default)]
struct State {
    order: Vec<String>,
    entries: HashMap<String, RegistryEntry>,
}

struct Inner {
    id: u64,
    state: RwLock<State>,
}

/// Cloneable handle to the registry. All clones share one namespace; the
/// per-instance id is what lets the compiler detect fields declared against
/// a different registry.
#[derive(Clone)]
pub struct TypeRegistry {
    inner: Arc<Inner>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let registry = TypeRegistry {
            inner: Arc::new(Inner {
                id: REGISTRY_IDS.fetch_add(1, Ordering::Relaxed),
                state: RwLock::new(State::default()),
            }),
        };
        {
            let mut state = registry.inner.state.write();
            for scalar in SCALAR_TYPES {
                state.order.push(scalar.to_string());
                state
                    .entries
                    .insert(scalar.to_string(), RegistryEntry::scalar(*scalar));
            }
        }
        registry
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Symbolic lookup: returns a deferred reference, never an error, even
    /// for names that have not been registered yet.
    pub fn type_ref(&self, name: impl Into<String>) -> TypeRef {
        TypeRef {
            type_name: name.into(),
            is_list: false,
            registry_id: self.inner.id,
        }
    }

    /// Start declaring a new graph type. Compilation and registration happen
    /// in one explicit step when the builder's `register` is called.
    pub fn declare(&self, name: impl Into<String>) -> GraphTypeBuilder {
        GraphTypeBuilder::new(self.clone(), name.into())
    }

    pub(crate) fn insert(&self, entry: RegistryEntry) -> Result<(), SchemaError> {
        let mut state = self.inner.state.write();
        if state.entries.contains_key(entry.name()) {
            return Err(SchemaError::DuplicateType {
                name: entry.name().to_string(),
                known: state.order.clone(),
            });
        }
        tracing::debug!(type_name = entry.name(), "registered graph type");
        state.order.push(entry.name().to_string());
        state.entries.insert(entry.name().to_string(), entry);
        Ok(())
    }

    /// Resolve a symbolic name to its entry. The error carries the set of
    /// currently known names to aid debugging.
    pub fn resolve(&self, name: &str) -> Result<RegistryEntry, SchemaError> {
        let state = self.inner.state.read();
        state
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownType {
                name: name.to_string(),
                known: state.order.clone(),
            })
    }

    /// The compiled type registered under `name`, or `None` for scalars.
    pub fn compiled(&self, name: &str) -> Result<Option<Arc<CompiledType>>, SchemaError> {
        Ok(self.resolve(name)?.compiled().cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.state.read().entries.contains_key(name)
    }

    /// All registered names, in registration order.
    pub fn known_types(&self) -> Vec<String> {
        self.inner.state.read().order.clone()
    }

    /// All entries, in registration order.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let state = self.inner.state.read();
        state
            .order
            .iter()
            .filter_map(|name| state.entries.get(name).cloned())
            .collect()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
