//! Prefetch-path computation.
//!
//! Walks a query's selection tree against the compiled type graph and emits
//! the ordered list of relation paths the backing store must bulk-load so
//! that nested resolution reads from materialized collections instead of
//! issuing one round-trip per parent record.

use async_graphql::context::SelectionField;

use crate::builder::CompiledType;
use crate::error::SchemaError;
use crate::registry::TypeRegistry;
use crate::store::PrefetchPath;

/// One node of a selection tree, independent of the executor's AST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub name: String,
    pub children: Vec<Selection>,
}

impl Selection {
    pub fn new(name: impl Into<String>) -> Self {
        Selection {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn nested(name: impl Into<String>, children: Vec<Selection>) -> Self {
        Selection {
            name: name.into(),
            children,
        }
    }

    /// Build a selection tree from the executor's live look-ahead.
    pub fn from_field(field: SelectionField<'_>) -> Self {
        Selection {
            name: field.name().to_string(),
            children: field.selection_set().map(Self::from_field).collect(),
        }
    }
}

/// Compute the relation paths to bulk-load for `selection` resolved against
/// `ty`.
///
/// For every selected field the declared hint paths are taken as a base; if
/// the field carries a nested selection and its target (unwrapping "list of"
/// one level) is a compiled object type, the paths computed recursively for
/// the nested selection are joined onto every base path (`outer.inner`,
/// full cross product) and appended after the base paths. A field with no
/// declared hint contributes nothing; its resolution may incur extra
/// round-trips, which is the accepted cost of purely declarative hints.
pub fn prefetch_paths(
    registry: &TypeRegistry,
    ty: &CompiledType,
    selection: &[Selection],
) -> Result<Vec<PrefetchPath>, SchemaError> {
    let mut out = Vec::new();
    for sel in selection {
        let mut paths = ty.prefetch_hints(&sel.name).to_vec();
        if !sel.children.is_empty() && !paths.is_empty() {
            if let Some(field) = ty.field(&sel.name) {
                if let Some(nested_ty) = registry.compiled(field.type_ref().type_name())? {
                    let inner = prefetch_paths(registry, &nested_ty, &sel.children)?;
                    let joined: Vec<PrefetchPath> = paths
                        .iter()
                        .flat_map(|outer| inner.iter().map(|i| outer.join(i)))
                        .collect();
                    paths.extend(joined);
                }
            }
        }
        out.extend(paths);
    }
    Ok(out)
}
