//! Plugin pipeline.
//!
//! A plugin participates in schema assembly and query execution through two
//! hooks: a schema hook that may inject root fields, and an execution hook
//! that may transform the per-execution context and hand back a teardown to
//! run after the query finishes. Teardowns run in reverse entry order, and
//! they run on every exit path: success, execution error, and a later
//! plugin failing to enter.

use std::sync::Arc;

use crate::error::SchemaError;
use crate::instrument::QueryLog;
use crate::schema::InjectedRootField;
use crate::store::ConnectionSet;

/// Mutable per-execution state threaded through the plugin pipeline and
/// into root resolvers.
#[derive(Clone, Default)]
pub struct PluginContext {
    /// The query text the executor will run. Plugins may rewrite it; the
    /// execution uses whatever the pipeline leaves here.
    pub request: String,
    /// Connections the execution resolves against. Plugins may replace
    /// these with wrapped proxies.
    pub connections: ConnectionSet,
    /// Query log attached by the instrumentation plugin, when present.
    pub query_log: Option<Arc<QueryLog>>,
}

impl PluginContext {
    pub fn new(request: impl Into<String>, connections: ConnectionSet) -> Self {
        PluginContext {
            request: request.into(),
            connections,
            query_log: None,
        }
    }
}

/// A context transformation scoped to one execution. Dropping it without
/// calling [`ScopedTransform::teardown`] leaks nothing but skips the
/// plugin's cleanup, so the pipeline always drains its stack explicitly.
pub struct ScopedTransform {
    plugin: String,
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl ScopedTransform {
    /// A transform with no cleanup step.
    pub fn noop(plugin: impl Into<String>) -> Self {
        ScopedTransform {
            plugin: plugin.into(),
            teardown: None,
        }
    }

    /// A transform whose cleanup runs when the pipeline unwinds.
    pub fn with_teardown(plugin: impl Into<String>, teardown: impl FnOnce() + Send + 'static) -> Self {
        ScopedTransform {
            plugin: plugin.into(),
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    fn teardown(mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

/// One pipeline participant.
pub trait Plugin: Send + Sync {
    /// Stable name, used in error reports and tracing.
    fn name(&self) -> &str;

    /// Root query fields this plugin injects into the assembled schema.
    /// Defaults to none.
    fn root_fields(&self) -> Vec<InjectedRootField> {
        Vec::new()
    }

    /// Enter one execution: transform the context and return the scoped
    /// cleanup. Failure here aborts the execution before the query runs.
    fn enter(&self, ctx: &mut PluginContext) -> Result<ScopedTransform, SchemaError>;
}

/// The stack of scoped transforms for one execution in progress.
pub struct PluginStack {
    entered: Vec<ScopedTransform>,
}

impl std::fmt::Debug for PluginStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginStack")
            .field("entered", &self.entered.len())
            .finish()
    }
}

impl PluginStack {
    /// Run every plugin's entry hook in registration order. If one fails,
    /// the plugins already entered are unwound before the error propagates.
    pub fn enter(
        plugins: &[Arc<dyn Plugin>],
        ctx: &mut PluginContext,
    ) -> Result<PluginStack, SchemaError> {
        let mut entered = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            match plugin.enter(ctx) {
                Ok(transform) => {
                    tracing::debug!(plugin = plugin.name(), "plugin entered");
                    entered.push(transform);
                }
                Err(err) => {
                    tracing::warn!(
                        plugin = plugin.name(),
                        error = %err,
                        "plugin failed to enter; unwinding"
                    );
                    PluginStack { entered }.unwind();
                    return Err(err);
                }
            }
        }
        Ok(PluginStack { entered })
    }

    /// Tear down every entered transform, most recent first.
    pub fn unwind(mut self) {
        while let Some(transform) = self.entered.pop() {
            tracing::debug!(plugin = transform.plugin(), "plugin unwound");
            transform.teardown();
        }
    }
}
