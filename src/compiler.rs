//! Compiler — turns a `Cell`'s source + FX chain into a cached, executable
//! form, with invalidation on dirty.
//!
//! Grounded on `songwalker_core::compiler::CompileCtx`: a compile pass is a
//! pure function of (input, mutable context) producing an owned output;
//! here the "mutable context" is just the registry lookup, since a tracker
//! cell has no lexical scope to thread through.

use crate::error::CoreError;
use crate::event::Phrase;
use crate::model::{Cell, CellType, FxChain};
use crate::registry::{CompiledExpr, PluginRegistry, TransformFn};

/// The compiled form of one FX chain entry: its transform resolved up
/// front, so `apply_fx_chain` never re-searches the registry.
#[derive(Debug)]
pub struct CompiledFxEntry {
    pub name: String,
    pub params: Option<String>,
    pub enabled: bool,
    pub transform: TransformFn,
}

/// An FX chain with every entry's transform already resolved.
#[derive(Debug, Default)]
pub struct CompiledFxChain {
    pub entries: Vec<CompiledFxEntry>,
}

/// The compiled form of an `Expression` cell.
#[derive(Debug)]
pub struct CompiledExprCell {
    pub language_id: String,
    pub is_generator: bool,
    pub compiled_expr: Option<Box<dyn CompiledExpr>>,
    pub source: String,
    /// Populated after first evaluation for non-generators; generators
    /// never populate this.
    pub cached_phrase: Option<Phrase>,
}

#[derive(Debug)]
pub enum CompiledCellKind {
    /// `Empty`/`Continuation` cells — compile to nothing, not an error.
    None,
    /// The engine handles `NoteOff` cells directly.
    NoteOff,
    Expr(CompiledExprCell),
}

/// The engine-owned compiled form of one `Cell`.
#[derive(Debug)]
pub struct CompiledCell {
    pub kind: CompiledCellKind,
    pub fx_chain: CompiledFxChain,
}

impl CompiledCell {
    fn none() -> Self {
        CompiledCell {
            kind: CompiledCellKind::None,
            fx_chain: CompiledFxChain::default(),
        }
    }
}

/// Compile one source FX chain against the registry, resolving each entry's
/// transform. An unknown transform name fails the whole cell compile.
pub(crate) fn compile_fx_chain(chain: &FxChain, registry: &PluginRegistry) -> Result<CompiledFxChain, CoreError> {
    let mut compiled = CompiledFxChain::default();
    for entry in &chain.entries {
        let (_, transform) = registry
            .find_transform(&entry.name)
            .ok_or_else(|| CoreError::UnknownTransform {
                name: entry.name.clone(),
            })?;
        compiled.entries.push(CompiledFxEntry {
            name: entry.name.clone(),
            params: entry.params.clone(),
            enabled: entry.enabled,
            transform,
        });
    }
    Ok(compiled)
}

/// Compile a single cell against `default_language_id`, producing an owned
/// `CompiledCell` or an error.
pub fn compile_cell(
    cell: &Cell,
    default_language_id: Option<&str>,
    registry: &PluginRegistry,
) -> Result<CompiledCell, CoreError> {
    match cell.cell_type {
        CellType::Empty | CellType::Continuation => {
            let mut compiled = CompiledCell::none();
            compiled.fx_chain = compile_fx_chain(&cell.fx_chain, registry)?;
            Ok(compiled)
        }
        CellType::NoteOff => {
            let fx_chain = compile_fx_chain(&cell.fx_chain, registry)?;
            Ok(CompiledCell {
                kind: CompiledCellKind::NoteOff,
                fx_chain,
            })
        }
        CellType::Expression => {
            let requested = cell.language_id.as_deref().or(default_language_id);
            let plugin = registry.find(requested).ok_or_else(|| CoreError::UnknownLanguage {
                language_id: requested.unwrap_or_default().to_string(),
            })?;
            let language_id = plugin.language_id().to_string();

            use crate::registry::Capabilities;
            if !plugin.capabilities().contains(Capabilities::EVALUATE) {
                return Err(CoreError::CannotEvaluate { language_id });
            }

            if plugin.capabilities().contains(Capabilities::VALIDATION) {
                let result = plugin.validate(&cell.expression);
                if !result.ok {
                    return Err(CoreError::SyntaxError {
                        message: result
                            .error_msg
                            .unwrap_or_else(|| "invalid expression".to_string()),
                        position: result.error_pos,
                    });
                }
            }

            let is_generator = plugin.capabilities().contains(Capabilities::GENERATORS)
                && plugin.is_generator(&cell.expression);

            let compiled_expr = if plugin.capabilities().contains(Capabilities::COMPILATION) {
                plugin.compile(&cell.expression)?
            } else {
                None
            };

            let fx_chain = compile_fx_chain(&cell.fx_chain, registry)?;

            Ok(CompiledCell {
                kind: CompiledCellKind::Expr(CompiledExprCell {
                    language_id,
                    is_generator,
                    compiled_expr,
                    source: cell.expression.clone(),
                    cached_phrase: None,
                }),
                fx_chain,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PluginRegistry;

    #[test]
    fn empty_cell_compiles_to_none() {
        let registry = PluginRegistry::builtin();
        let cell = Cell::empty();
        let compiled = compile_cell(&cell, Some("notes"), &registry).unwrap();
        assert!(matches!(compiled.kind, CompiledCellKind::None));
    }

    #[test]
    fn note_off_cell_compiles_to_sentinel() {
        let registry = PluginRegistry::builtin();
        let cell = Cell::note_off();
        let compiled = compile_cell(&cell, Some("notes"), &registry).unwrap();
        assert!(matches!(compiled.kind, CompiledCellKind::NoteOff));
    }

    #[test]
    fn unknown_language_fails() {
        let registry = PluginRegistry::builtin();
        let cell = Cell::expression("C4");
        let err = compile_cell(&cell, Some("nope"), &registry).unwrap_err();
        assert_eq!(
            err,
            CoreError::UnknownLanguage {
                language_id: "nope".into()
            }
        );
    }

    #[test]
    fn unknown_transform_fails_whole_compile() {
        let registry = PluginRegistry::builtin();
        let mut cell = Cell::expression("C4");
        cell.fx_chain.push(crate::model::FxEntry::new("no-such-transform"));
        let err = compile_cell(&cell, Some("notes"), &registry).unwrap_err();
        assert_eq!(
            err,
            CoreError::UnknownTransform {
                name: "no-such-transform".into()
            }
        );
    }

    #[test]
    fn expression_cell_compiles_with_resolved_fx_chain() {
        let registry = PluginRegistry::builtin();
        let mut cell = Cell::expression("C4");
        cell.fx_chain.push(crate::model::FxEntry::new("transpose").with_params("7"));
        let compiled = compile_cell(&cell, Some("notes"), &registry).unwrap();
        assert_eq!(compiled.fx_chain.entries.len(), 1);
        match compiled.kind {
            CompiledCellKind::Expr(expr) => assert_eq!(expr.language_id, "notes"),
            _ => panic!("expected Expr"),
        }
    }
}
