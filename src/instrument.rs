//! Query-log instrumentation.
//!
//! [`QueryLogPlugin`] wraps every connection in an execution-scoped proxy
//! that records each executed statement (with parameters rendered into the
//! statement text) into a per-execution [`QueryLog`], and injects a `_debug`
//! root field exposing the log to the query itself.
//!
//! The proxy is swapped in through the plugin context, so the underlying
//! connections are never mutated and concurrent executions never see each
//! other's logs.

use std::sync::Arc;
use std::time::Instant;

use async_graphql::Value;
use async_graphql::dynamic::{Field, FieldFuture, FieldValue, Object, ResolverContext, TypeRef};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::SchemaError;
use crate::plugin::{Plugin, PluginContext, ScopedTransform};
use crate::schema::{InjectedRootField, RootScope};
use crate::store::{Connection, ConnectionRef, ConnectionSet, StoreError};

const PLUGIN_NAME: &str = "query-log";

/// Name of the injected root field.
pub const DEBUG_FIELD: &str = "_debug";

/// One executed statement, as recorded by the instrumented connection.
#[derive(Debug, Clone, Serialize)]
pub struct StatementRecord {
    /// Statement text with parameters rendered in.
    pub sql: String,
    /// Statement text as handed to the connection.
    pub raw_sql: String,
    pub vendor: String,
    pub alias: String,
    pub is_select: bool,
    /// Parameters as JSON, best-effort: values that do not serialize are
    /// recorded as a placeholder instead of failing the record.
    pub params: Vec<serde_json::Value>,
    pub at: DateTime<Utc>,
    pub duration_ms: f64,
    /// Call-site backtrace, captured only when the plugin asks for it.
    pub stacktrace: Option<String>,
}

/// Per-execution statement log.
#[derive(Default)]
pub struct QueryLog {
    records: Mutex<Vec<StatementRecord>>,
}

impl QueryLog {
    pub fn record(&self, record: StatementRecord) {
        self.records.lock().push(record);
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn select_count(&self) -> usize {
        self.records.lock().iter().filter(|r| r.is_select).count()
    }

    pub fn total_duration_ms(&self) -> f64 {
        self.records.lock().iter().map(|r| r.duration_ms).sum()
    }

    pub fn statements(&self) -> Vec<StatementRecord> {
        self.records.lock().clone()
    }

    /// The log as a JSON array, for dumping alongside a bug report.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.statements()).unwrap_or(serde_json::Value::Null)
    }
}

// ============================================================================
// Instrumented connection
// ============================================================================

/// Proxy that forwards to the wrapped connection and records every
/// statement into the log.
pub struct InstrumentedConnection {
    inner: ConnectionRef,
    log: Arc<QueryLog>,
    capture_stacktraces: bool,
}

impl InstrumentedConnection {
    /// Wrap a connection. Wrapping an already-instrumented connection
    /// re-wraps the underlying connection, so layering never stacks.
    pub fn wrap(
        conn: &ConnectionRef,
        log: &Arc<QueryLog>,
        capture_stacktraces: bool,
    ) -> ConnectionRef {
        let inner = conn.instrumented_inner().unwrap_or_else(|| conn.clone());
        Arc::new(InstrumentedConnection {
            inner,
            log: log.clone(),
            capture_stacktraces,
        })
    }

    /// Recover the wrapped connection; a no-op for plain connections.
    pub fn unwrap(conn: &ConnectionRef) -> ConnectionRef {
        conn.instrumented_inner().unwrap_or_else(|| conn.clone())
    }
}

impl Connection for InstrumentedConnection {
    fn vendor(&self) -> &str {
        self.inner.vendor()
    }

    fn alias(&self) -> &str {
        self.inner.alias()
    }

    fn execute(&self, statement: &str, params: &[Value]) -> Result<u64, StoreError> {
        let at = Utc::now();
        let started = Instant::now();
        let result = self.inner.execute(statement, params);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let sql = render_sql(statement, params);
        tracing::debug!(
            sql = %sql,
            vendor = self.inner.vendor(),
            alias = self.inner.alias(),
            duration_ms,
            "statement executed"
        );
        self.log.record(StatementRecord {
            sql,
            raw_sql: statement.to_string(),
            vendor: self.inner.vendor().to_string(),
            alias: self.inner.alias().to_string(),
            is_select: is_select(statement),
            params: params.iter().map(render_param).collect(),
            at,
            duration_ms,
            stacktrace: self
                .capture_stacktraces
                .then(|| std::backtrace::Backtrace::force_capture().to_string()),
        });
        result
    }

    fn instrumented_inner(&self) -> Option<ConnectionRef> {
        Some(self.inner.clone())
    }
}

/// Wrap every connection in the set with an instrumenting proxy feeding
/// `log`.
pub fn instrument_connections(
    connections: &ConnectionSet,
    log: &Arc<QueryLog>,
    capture_stacktraces: bool,
) -> ConnectionSet {
    connections.map(|conn| InstrumentedConnection::wrap(conn, log, capture_stacktraces))
}

/// Strip instrumentation proxies from every connection in the set.
pub fn uninstrument_connections(connections: &ConnectionSet) -> ConnectionSet {
    connections.map(InstrumentedConnection::unwrap)
}

/// Render positional `?` placeholders into the statement text. Surplus
/// placeholders are left as-is.
fn render_sql(statement: &str, params: &[Value]) -> String {
    if params.is_empty() {
        return statement.to_string();
    }
    let mut out = String::new();
    let mut params = params.iter();
    for (i, piece) in statement.split('?').enumerate() {
        if i > 0 {
            match params.next() {
                Some(value) => out.push_str(&quote_param(value)),
                None => out.push('?'),
            }
        }
        out.push_str(piece);
    }
    out
}

fn render_param(value: &Value) -> serde_json::Value {
    value
        .clone()
        .into_json()
        .unwrap_or_else(|_| serde_json::Value::String("(not serializable)".to_string()))
}

fn quote_param(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

fn is_select(statement: &str) -> bool {
    statement.trim_start().to_ascii_lowercase().starts_with("select")
}

// ============================================================================
// Plugin
// ============================================================================

/// Plugin wiring the instrumentation into the pipeline: a fresh log per
/// execution, proxied connections, and the `_debug` root field.
#[derive(Default)]
pub struct QueryLogPlugin {
    capture_stacktraces: bool,
    last_log: Mutex<Option<Arc<QueryLog>>>,
}

impl QueryLogPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also capture a backtrace per recorded statement. Expensive; meant
    /// for tracking down which resolver issued a statement.
    pub fn with_stacktraces(mut self) -> Self {
        self.capture_stacktraces = true;
        self
    }

    /// The log of the most recently entered execution. Root fields run
    /// concurrently, so in-query reads of the log race with sibling
    /// fields; this handle is the deterministic way to inspect a finished
    /// execution.
    pub fn last_log(&self) -> Option<Arc<QueryLog>> {
        self.last_log.lock().clone()
    }
}

impl Plugin for QueryLogPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn root_fields(&self) -> Vec<InjectedRootField> {
        vec![debug_root_field()]
    }

    fn enter(&self, ctx: &mut PluginContext) -> Result<ScopedTransform, SchemaError> {
        let log = Arc::new(QueryLog::default());
        ctx.connections = instrument_connections(&ctx.connections, &log, self.capture_stacktraces);
        ctx.query_log = Some(log.clone());
        *self.last_log.lock() = Some(log.clone());
        Ok(ScopedTransform::with_teardown(PLUGIN_NAME, move || {
            tracing::debug!(statements = log.count(), "query log closed");
        }))
    }
}

/// The `_debug` root field and its object types.
fn debug_root_field() -> InjectedRootField {
    InjectedRootField::new(DEBUG_FIELD, |builder, query| {
        let statement = Object::new("StatementRecord")
            .field(Field::new(
                "sql",
                TypeRef::named(TypeRef::STRING),
                |ctx: ResolverContext| statement_field(ctx, |r| Value::from(r.sql.clone())),
            ))
            .field(Field::new(
                "raw_sql",
                TypeRef::named(TypeRef::STRING),
                |ctx: ResolverContext| statement_field(ctx, |r| Value::from(r.raw_sql.clone())),
            ))
            .field(Field::new(
                "vendor",
                TypeRef::named(TypeRef::STRING),
                |ctx: ResolverContext| statement_field(ctx, |r| Value::from(r.vendor.clone())),
            ))
            .field(Field::new(
                "alias",
                TypeRef::named(TypeRef::STRING),
                |ctx: ResolverContext| statement_field(ctx, |r| Value::from(r.alias.clone())),
            ))
            .field(Field::new(
                "is_select",
                TypeRef::named(TypeRef::BOOLEAN),
                |ctx: ResolverContext| statement_field(ctx, |r| Value::from(r.is_select)),
            ))
            .field(Field::new(
                "params",
                TypeRef::named_list(TypeRef::STRING),
                |ctx: ResolverContext| {
                    statement_field(ctx, |r| {
                        Value::List(r.params.iter().map(|p| Value::from(p.to_string())).collect())
                    })
                },
            ))
            .field(Field::new(
                "at",
                TypeRef::named(TypeRef::STRING),
                |ctx: ResolverContext| statement_field(ctx, |r| Value::from(r.at.to_rfc3339())),
            ))
            .field(Field::new(
                "duration_ms",
                TypeRef::named(TypeRef::FLOAT),
                |ctx: ResolverContext| statement_field(ctx, |r| Value::from(r.duration_ms)),
            ))
            .field(Field::new(
                "stacktrace",
                TypeRef::named(TypeRef::STRING),
                |ctx: ResolverContext| {
                    FieldFuture::new(async move {
                        let record = downcast_statement(&ctx)?;
                        Ok(record
                            .stacktrace
                            .clone()
                            .map(|s| FieldValue::value(Value::from(s))))
                    })
                },
            ));

        let log = Object::new("QueryLog")
            .field(Field::new("count", TypeRef::named(TypeRef::INT), |ctx: ResolverContext| {
                FieldFuture::new(async move {
                    let log = downcast_log(&ctx)?;
                    Ok(Some(FieldValue::value(Value::from(log.count() as i64))))
                })
            }))
            .field(Field::new(
                "total_duration_ms",
                TypeRef::named(TypeRef::FLOAT),
                |ctx: ResolverContext| {
                    FieldFuture::new(async move {
                        let log = downcast_log(&ctx)?;
                        Ok(Some(FieldValue::value(Value::from(log.total_duration_ms()))))
                    })
                },
            ))
            .field(Field::new(
                "statements",
                TypeRef::named_list("StatementRecord"),
                |ctx: ResolverContext| {
                    FieldFuture::new(async move {
                        let log = downcast_log(&ctx)?;
                        Ok(Some(FieldValue::list(
                            log.statements().into_iter().map(FieldValue::owned_any),
                        )))
                    })
                },
            ));

        let query = query.field(Field::new(
            DEBUG_FIELD,
            TypeRef::named("QueryLog"),
            |ctx: ResolverContext| {
                FieldFuture::new(async move {
                    let scope = ctx.data::<RootScope>()?;
                    Ok(scope
                        .query_log
                        .clone()
                        .map(FieldValue::owned_any))
                })
            },
        ));
        (builder.register(statement).register(log), query)
    })
}

fn statement_field<'a>(
    ctx: ResolverContext<'a>,
    pick: impl Fn(&StatementRecord) -> Value + Send + 'a,
) -> FieldFuture<'a> {
    FieldFuture::new(async move {
        let record = downcast_statement(&ctx)?;
        Ok(Some(FieldValue::value(pick(record))))
    })
}

fn downcast_statement<'a>(
    ctx: &ResolverContext<'a>,
) -> Result<&'a StatementRecord, async_graphql::Error> {
    ctx.parent_value
        .downcast_ref::<StatementRecord>()
        .ok_or_else(|| async_graphql::Error::new("parent value is not a statement record"))
}

fn downcast_log<'a>(
    ctx: &ResolverContext<'a>,
) -> Result<&'a Arc<QueryLog>, async_graphql::Error> {
    ctx.parent_value
        .downcast_ref::<Arc<QueryLog>>()
        .ok_or_else(|| async_graphql::Error::new("parent value is not a query log"))
}
