//! Schema assembly and execution.
//!
//! [`SchemaSpec`] resolves every deferred type reference in a registry,
//! synthesizes field and root resolvers for the compiled types, and builds
//! the executable schema. [`GraphSchema`] owns the built schema plus the
//! plugin pipeline and runs queries through it.
//!
//! Every root-capable type contributes two root fields: a singular field
//! (equality filters, at most one result) and a plural field (equality and
//! membership filters, list result). Splitting them keeps each root field's
//! result type fixed, which the executor's type system requires.

use std::collections::HashSet;
use std::sync::Arc;

use async_graphql::dynamic::{
    Field, FieldFuture, FieldValue, InputValue, Object, ResolverContext, Schema, SchemaBuilder,
    TypeRef,
};
use async_graphql::{Request, Response, Value};

use crate::builder::{CompiledType, Resolved};
use crate::error::SchemaError;
use crate::instrument::QueryLog;
use crate::plugin::{Plugin, PluginContext, PluginStack};
use crate::prefetch::{Selection, prefetch_paths};
use crate::registry::TypeRegistry;
use crate::store::{
    ConnectionRef, ConnectionSet, Filter, Predicate, RecordRef, StoreError,
};

/// Per-execution state root resolvers read from the request data map.
#[derive(Clone, Default)]
pub struct RootScope {
    pub connections: ConnectionSet,
    pub query_log: Option<Arc<QueryLog>>,
}

/// Concrete parent value carried between resolvers. Field resolvers
/// downcast to this to recover the backing record.
#[derive(Clone)]
pub struct BoundRecord(pub RecordRef);

/// A root query field contributed by a plugin. The installer may register
/// auxiliary types on the schema builder and must add its field to the
/// Query object.
#[derive(Clone)]
pub struct InjectedRootField {
    name: String,
    install: Arc<dyn Fn(SchemaBuilder, Object) -> (SchemaBuilder, Object) + Send + Sync>,
}

impl InjectedRootField {
    pub fn new(
        name: impl Into<String>,
        install: impl Fn(SchemaBuilder, Object) -> (SchemaBuilder, Object) + Send + Sync + 'static,
    ) -> Self {
        InjectedRootField {
            name: name.into(),
            install: Arc::new(install),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Spec
// ============================================================================

/// Everything needed to assemble one executable schema: the registry, the
/// plugin pipeline and the connections queries run against.
pub struct SchemaSpec {
    registry: TypeRegistry,
    plugins: Vec<Arc<dyn Plugin>>,
    connections: ConnectionSet,
}

impl SchemaSpec {
    pub fn new(registry: TypeRegistry) -> Self {
        SchemaSpec {
            registry,
            plugins: Vec::new(),
            connections: ConnectionSet::new(),
        }
    }

    pub fn plugin(self, plugin: impl Plugin + 'static) -> Self {
        self.plugin_shared(Arc::new(plugin))
    }

    /// Add a plugin the caller keeps a handle to (e.g. to read the query
    /// log after execution).
    pub fn plugin_shared(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn connection(mut self, conn: ConnectionRef) -> Self {
        self.connections.add(conn);
        self
    }

    /// Check that every deferred type reference resolves and that no two
    /// sources claim the same root field name. This is where forward
    /// references finally have to exist.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut root_names = HashSet::new();
        let mut claim = |name: &str| -> Result<(), SchemaError> {
            if !root_names.insert(name.to_string()) {
                return Err(SchemaError::DuplicateRootField {
                    name: name.to_string(),
                });
            }
            Ok(())
        };
        for entry in self.registry.entries() {
            let Some(compiled) = entry.compiled() else {
                continue;
            };
            for field in compiled.all_fields() {
                self.registry.resolve(field.type_ref().type_name())?;
            }
            if compiled.is_root_capable() {
                claim(compiled.root_field_name())?;
                claim(compiled.plural_field_name())?;
            }
        }
        for plugin in &self.plugins {
            for injected in plugin.root_fields() {
                claim(injected.name())?;
            }
        }
        Ok(())
    }

    /// Validate and assemble the executable schema.
    pub fn build(self) -> Result<GraphSchema, SchemaError> {
        self.validate()?;

        let mut builder = Schema::build("Query", None, None);
        let mut query = Object::new("Query");

        for entry in self.registry.entries() {
            let Some(compiled) = entry.compiled() else {
                continue;
            };
            builder = builder.register(build_object(&self.registry, compiled)?);
            if !compiled.mutations().is_empty() {
                tracing::warn!(
                    type_name = compiled.name(),
                    mutations = ?compiled.mutations(),
                    "mutation markers are collected but not wired into the schema"
                );
            }
            if compiled.is_root_capable() {
                query = query.field(root_field(&self.registry, compiled, false));
                query = query.field(root_field(&self.registry, compiled, true));
            }
        }

        for plugin in &self.plugins {
            for injected in plugin.root_fields() {
                tracing::debug!(
                    plugin = plugin.name(),
                    field = injected.name(),
                    "installing plugin root field"
                );
                (builder, query) = (injected.install)(builder, query);
            }
        }

        let executable = builder.register(query).finish()?;
        Ok(GraphSchema {
            executable,
            plugins: self.plugins,
            connections: self.connections,
        })
    }
}

// ============================================================================
// Object assembly
// ============================================================================

fn build_object(
    registry: &TypeRegistry,
    compiled: &Arc<CompiledType>,
) -> Result<Object, SchemaError> {
    let mut object = Object::new(compiled.name());
    if let Some(description) = compiled.description() {
        object = object.description(description);
    }
    for field in compiled.all_fields() {
        let target = registry.resolve(field.type_ref().type_name())?;
        let type_ref = if field.type_ref().is_list() {
            TypeRef::named_list(field.type_ref().type_name())
        } else {
            TypeRef::named(field.type_ref().type_name())
        };
        object = object.field(Field::new(
            field.name(),
            type_ref,
            graph_field_resolver(
                compiled.clone(),
                field.name().to_string(),
                target.is_scalar(),
                field.type_ref().is_list(),
            ),
        ));
    }
    Ok(object)
}

/// Synthesize the resolver for one graph field: the installed custom
/// resolver when the declaration has one, otherwise attribute lookup for
/// scalar fields and relation traversal for object fields.
fn graph_field_resolver(
    compiled: Arc<CompiledType>,
    field_name: String,
    target_is_scalar: bool,
    is_list: bool,
) -> impl for<'a> Fn(ResolverContext<'a>) -> FieldFuture<'a> + Send + Sync + 'static {
    move |ctx: ResolverContext| {
        let compiled = compiled.clone();
        let field_name = field_name.clone();
        FieldFuture::new(async move {
            let record = ctx
                .parent_value
                .downcast_ref::<BoundRecord>()
                .ok_or_else(|| async_graphql::Error::new("parent value is not a bound record"))?;
            let resolved = match compiled.resolver(&field_name) {
                Some(resolver) => resolver(record.0.as_ref()).map_err(store_err)?,
                None if target_is_scalar => {
                    Resolved::Value(record.0.attr(&field_name).unwrap_or(Value::Null))
                }
                None if is_list => {
                    Resolved::Many(record.0.related_many(&field_name).map_err(store_err)?)
                }
                None => Resolved::One(record.0.related_one(&field_name).map_err(store_err)?),
            };
            Ok(match resolved {
                Resolved::Value(Value::Null) => None,
                Resolved::Value(value) => Some(FieldValue::value(value)),
                Resolved::One(None) => None,
                Resolved::One(Some(rec)) => Some(FieldValue::owned_any(BoundRecord(rec))),
                Resolved::Many(recs) => Some(FieldValue::list(
                    recs.into_iter().map(|r| FieldValue::owned_any(BoundRecord(r))),
                )),
            })
        })
    }
}

// ============================================================================
// Root fields
// ============================================================================

fn root_field(registry: &TypeRegistry, compiled: &Arc<CompiledType>, plural: bool) -> Field {
    let name = if plural {
        compiled.plural_field_name()
    } else {
        compiled.root_field_name()
    };
    let type_ref = if plural {
        TypeRef::named_list(compiled.name())
    } else {
        TypeRef::named(compiled.name())
    };
    let mut field = Field::new(
        name,
        type_ref,
        root_resolver(registry.clone(), compiled.clone(), plural),
    );
    for filter in compiled.filters() {
        // Validated at registration: every filter names a declared scalar field.
        if let Some(def) = compiled.field(filter) {
            let scalar = def.type_ref().type_name();
            field = field.argument(InputValue::new(filter, TypeRef::named(scalar)));
            if plural {
                field = field.argument(InputValue::new(
                    format!("{filter}_in"),
                    TypeRef::named_list(scalar),
                ));
            }
        }
    }
    field
}

fn root_resolver(
    registry: TypeRegistry,
    compiled: Arc<CompiledType>,
    plural: bool,
) -> impl for<'a> Fn(ResolverContext<'a>) -> FieldFuture<'a> + Send + Sync + 'static {
    move |ctx: ResolverContext| {
        let registry = registry.clone();
        let compiled = compiled.clone();
        FieldFuture::new(async move {
            let scope = ctx.data::<RootScope>()?;
            let binding = compiled
                .binding()
                .ok_or_else(|| async_graphql::Error::new("type has no backing-model binding"))?;
            let conn = scope
                .connections
                .get(binding.connection_alias())
                .ok_or_else(|| {
                    store_err(StoreError::MissingConnection {
                        alias: binding.connection_alias().to_string(),
                    })
                })?;

            let predicate = predicate_from_args(&ctx, &compiled);
            let selection: Vec<Selection> = ctx
                .field()
                .selection_set()
                .map(Selection::from_field)
                .collect();
            let paths = prefetch_paths(&registry, &compiled, &selection)
                .map_err(|e| async_graphql::Error::new(e.to_string()))?;
            tracing::debug!(
                type_name = compiled.name(),
                predicate = %predicate,
                prefetch = ?paths,
                plural,
                "resolving root field"
            );

            if plural {
                let mut records = binding.filter(&conn, &predicate).map_err(store_err)?;
                if !paths.is_empty() {
                    records = binding
                        .prefetch_related(&conn, records, &paths)
                        .map_err(store_err)?;
                }
                Ok(Some(FieldValue::list(
                    records
                        .into_iter()
                        .map(|r| FieldValue::owned_any(BoundRecord(r))),
                )))
            } else {
                let Some(record) = binding.get(&conn, &predicate).map_err(store_err)? else {
                    return Ok(None);
                };
                let mut records = vec![record];
                if !paths.is_empty() {
                    records = binding
                        .prefetch_related(&conn, records, &paths)
                        .map_err(store_err)?;
                }
                Ok(records
                    .into_iter()
                    .next()
                    .map(|r| FieldValue::owned_any(BoundRecord(r))))
            }
        })
    }
}

/// Build the ANDed predicate from the root field's supplied arguments.
/// Null arguments are treated as absent; a `<field>_in` argument accepts a
/// list or a single value (coerced to a one-element membership set).
fn predicate_from_args(ctx: &ResolverContext<'_>, compiled: &CompiledType) -> Predicate {
    let mut predicate = Predicate::new();
    let args = ctx.args.as_index_map();
    for (name, value) in args.iter() {
        if matches!(value, Value::Null) {
            continue;
        }
        let name = name.as_str();
        if compiled.filters().iter().any(|f| f == name) {
            predicate.push(Filter::eq(name, value.clone()));
        } else if let Some(base) = name.strip_suffix("_in") {
            if compiled.filters().iter().any(|f| f == base) {
                let values = match value {
                    Value::List(items) => items.clone(),
                    other => vec![other.clone()],
                };
                predicate.push(Filter::is_in(base, values));
            }
        }
    }
    predicate
}

fn store_err(err: StoreError) -> async_graphql::Error {
    async_graphql::Error::new(err.to_string())
}

// ============================================================================
// Executable schema
// ============================================================================

/// A built schema plus its plugin pipeline. Cheap to share; execution is
/// concurrent-safe.
pub struct GraphSchema {
    executable: Schema,
    plugins: Vec<Arc<dyn Plugin>>,
    connections: ConnectionSet,
}

impl std::fmt::Debug for GraphSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSchema")
            .field("plugins", &self.plugins.len())
            .finish_non_exhaustive()
    }
}

impl GraphSchema {
    /// Run one query through the plugin pipeline.
    ///
    /// Plugins enter in registration order before the query and unwind in
    /// reverse order afterwards, on both the success and the error path.
    /// The executor runs the request text the pipeline leaves in the
    /// context, so a plugin may rewrite the query on entry. An `Err` here
    /// means a plugin refused to enter; query-level failures are reported
    /// inside the returned [`Response`].
    pub async fn execute(&self, query: &str) -> Result<Response, SchemaError> {
        let mut plugin_ctx = PluginContext::new(query, self.connections.clone());
        let stack = PluginStack::enter(&self.plugins, &mut plugin_ctx)?;
        let scope = RootScope {
            connections: plugin_ctx.connections.clone(),
            query_log: plugin_ctx.query_log.clone(),
        };
        let response = self
            .executable
            .execute(Request::new(plugin_ctx.request).data(scope))
            .await;
        stack.unwind();
        Ok(response)
    }

    /// The schema in SDL form.
    pub fn sdl(&self) -> String {
        self.executable.sdl()
    }
}
