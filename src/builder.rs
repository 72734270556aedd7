//! Declarative type compiler.
//!
//! [`GraphTypeBuilder`] turns a type declaration (fields, prefetch hints,
//! filter arguments, mutation markers, custom resolvers and the
//! backing-model binding) into a [`CompiledType`] and registers it, in one
//! explicit step. Nothing is registered as a side effect of merely creating
//! a builder.
//!
//! Resolver synthesis is a lookup-table-or-default rule: a field resolves
//! through the closure installed with [`GraphTypeBuilder::resolve_with`] when
//! one exists, and otherwise through attribute lookup (scalar fields) or
//! relation traversal (object fields) on the backing record.

use std::collections::HashMap;
use std::sync::Arc;

use async_graphql::Value;

use crate::error::SchemaError;
use crate::registry::{RegistryEntry, SCALAR_TYPES, TypeRef, TypeRegistry};
use crate::store::{ModelBinding, PrefetchPath, Record, RecordRef, StoreError};

/// What a field resolver produced.
pub enum Resolved {
    /// A scalar value. `Value::Null` renders as null.
    Value(Value),
    /// A to-one relation target.
    One(Option<RecordRef>),
    /// A to-many relation target.
    Many(Vec<RecordRef>),
}

/// A custom field resolver installed with [`GraphTypeBuilder::resolve_with`].
pub type FieldResolver = Arc<dyn Fn(&dyn Record) -> Result<Resolved, StoreError> + Send + Sync>;

/// A declared field: name plus the symbolic reference to its type.
#[derive(Clone)]
pub struct FieldDef {
    name: String,
    type_ref: TypeRef,
}

impl FieldDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_ref(&self) -> &TypeRef {
        &self.type_ref
    }
}

/// A compiled graph type, derived from one declaration. Immutable once
/// registered.
pub struct CompiledType {
    name: String,
    description: Option<String>,
    fields: Vec<FieldDef>,
    list_fields: Vec<FieldDef>,
    prefetch: HashMap<String, Vec<PrefetchPath>>,
    mutations: Vec<String>,
    filters: Vec<String>,
    resolvers: HashMap<String, FieldResolver>,
    binding: Option<Arc<dyn ModelBinding>>,
    root_field: String,
    plural_field: String,
}

impl std::fmt::Debug for CompiledType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledType")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl CompiledType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Scalar-valued and to-one object fields, in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// List-valued fields, in declaration order.
    pub fn list_fields(&self) -> &[FieldDef] {
        &self.list_fields
    }

    /// All fields, single-valued first.
    pub fn all_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().chain(self.list_fields.iter())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.all_fields().find(|f| f.name() == name)
    }

    /// Declared prefetch relation path(s) for a field; empty when the field
    /// carries no hint.
    pub fn prefetch_hints(&self, field: &str) -> &[PrefetchPath] {
        self.prefetch.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mutation markers collected from the declaration. These are exposed
    /// for inspection but not wired into the executable schema.
    pub fn mutations(&self) -> &[String] {
        &self.mutations
    }

    /// Scalar fields allowed as root filter arguments.
    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    pub fn resolver(&self, field: &str) -> Option<&FieldResolver> {
        self.resolvers.get(field)
    }

    pub fn binding(&self) -> Option<&Arc<dyn ModelBinding>> {
        self.binding.as_ref()
    }

    /// A type with a backing-model binding contributes root query fields.
    pub fn is_root_capable(&self) -> bool {
        self.binding.is_some()
    }

    /// Canonical single-object root field name ("Item" -> "item").
    pub fn root_field_name(&self) -> &str {
        &self.root_field
    }

    /// Canonical list root field name ("Item" -> "items" unless overridden).
    pub fn plural_field_name(&self) -> &str {
        &self.plural_field
    }
}

/// Builder for one graph type declaration.
pub struct GraphTypeBuilder {
    registry: TypeRegistry,
    name: String,
    description: Option<String>,
    fields: Vec<FieldDef>,
    list_fields: Vec<FieldDef>,
    prefetch: HashMap<String, Vec<PrefetchPath>>,
    mutations: Vec<String>,
    filters: Vec<String>,
    resolvers: HashMap<String, FieldResolver>,
    binding: Option<Arc<dyn ModelBinding>>,
    plural: Option<String>,
}

impl GraphTypeBuilder {
    pub(crate) fn new(registry: TypeRegistry, name: String) -> Self {
        GraphTypeBuilder {
            registry,
            name,
            description: None,
            fields: Vec::new(),
            list_fields: Vec::new(),
            prefetch: HashMap::new(),
            mutations: Vec::new(),
            filters: Vec::new(),
            resolvers: HashMap::new(),
            binding: None,
            plural: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare a field. The reference decides whether the field is
    /// scalar-valued or list-valued.
    pub fn field(mut self, name: impl Into<String>, type_ref: TypeRef) -> Self {
        let def = FieldDef {
            name: name.into(),
            type_ref,
        };
        if def.type_ref.is_list() {
            self.list_fields.push(def);
        } else {
            self.fields.push(def);
        }
        self
    }

    /// Record the relation path(s) the backing store must bulk-load before
    /// this field's subtree is resolved.
    pub fn prefetch<I, S>(mut self, field: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefetch.insert(
            field.into(),
            paths.into_iter().map(|p| PrefetchPath::new(p)).collect(),
        );
        self
    }

    /// Install a custom resolver for a field, overriding the default
    /// attribute/relation lookup.
    pub fn resolve_with(
        mut self,
        field: impl Into<String>,
        resolver: impl Fn(&dyn Record) -> Result<Resolved, StoreError> + Send + Sync + 'static,
    ) -> Self {
        self.resolvers.insert(field.into(), Arc::new(resolver));
        self
    }

    /// Collect a mutation marker. Mutation execution is not wired into the
    /// schema; markers are kept for inspection.
    pub fn mutation(mut self, name: impl Into<String>) -> Self {
        self.mutations.push(name.into());
        self
    }

    /// Mark scalar fields as allowed root filter arguments.
    pub fn filterable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Attach the backing-model binding. A bound type becomes root-capable.
    pub fn bind(mut self, binding: Arc<dyn ModelBinding>) -> Self {
        self.binding = Some(binding);
        self
    }

    /// Override the list root field name (default: single name + "s").
    pub fn plural(mut self, name: impl Into<String>) -> Self {
        self.plural = Some(name.into());
        self
    }

    /// Compile the declaration and register it. This is the single point
    /// where a declaration enters the registry.
    pub fn register(self) -> Result<Arc<CompiledType>, SchemaError> {
        for def in self.fields.iter().chain(self.list_fields.iter()) {
            if def.type_ref.registry_id() != self.registry.id() {
                return Err(SchemaError::MixedRegistry {
                    type_name: self.name,
                });
            }
        }
        for filter in &self.filters {
            let scalar = self
                .fields
                .iter()
                .find(|f| f.name() == *filter)
                .is_some_and(|f| SCALAR_TYPES.contains(&f.type_ref.type_name()));
            if !scalar {
                return Err(SchemaError::InvalidFilterField {
                    type_name: self.name,
                    field: filter.clone(),
                });
            }
        }

        let root_field = lower_first(&self.name);
        let plural_field = self.plural.unwrap_or_else(|| format!("{root_field}s"));
        tracing::debug!(
            type_name = %self.name,
            fields = self.fields.len(),
            list_fields = self.list_fields.len(),
            mutations = self.mutations.len(),
            root_capable = self.binding.is_some(),
            "compiled graph type"
        );
        let compiled = Arc::new(CompiledType {
            name: self.name.clone(),
            description: self.description,
            fields: self.fields,
            list_fields: self.list_fields,
            prefetch: self.prefetch,
            mutations: self.mutations,
            filters: self.filters,
            resolvers: self.resolvers,
            binding: self.binding,
            root_field,
            plural_field,
        });
        self.registry
            .insert(RegistryEntry::object(self.name, compiled.clone()))?;
        Ok(compiled)
    }
}

fn lower_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
