//! Plugin registry — a process-wide-shaped mapping from `language_id` to
//! `Plugin`, with one designated default.
//!
//! Grounded on `fpsdk`'s plugin-identity-plus-bitflag-capability pattern,
//! modeled here as a Rust trait object (`Box<dyn Plugin>`) rather than a
//! void-pointer table.

use bitflags::bitflags;
use std::collections::HashMap;

use crate::error::CoreError;
use crate::evaluator::EvalContext;
use crate::event::Phrase;

bitflags! {
    /// What operations a plugin supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const EVALUATE   = 1 << 0;
        const VALIDATION = 1 << 1;
        const COMPILATION = 1 << 2;
        const TRANSFORMS  = 1 << 3;
        const GENERATORS  = 1 << 4;
    }
}

/// Result of `Plugin::validate`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidateResult {
    pub ok: bool,
    pub error_msg: Option<String>,
    pub error_pos: Option<usize>,
}

impl ValidateResult {
    pub fn ok() -> Self {
        ValidateResult {
            ok: true,
            error_msg: None,
            error_pos: None,
        }
    }

    pub fn error(msg: impl Into<String>, pos: Option<usize>) -> Self {
        ValidateResult {
            ok: false,
            error_msg: Some(msg.into()),
            error_pos: pos,
        }
    }
}

/// An opaque plugin-owned compiled form of an expression.
///
/// Plugins with the `Compilation` capability return a boxed value behind
/// this trait from `compile()`; the compiler stores it and hands it back to
/// `evaluate_compiled` unopened.
pub trait CompiledExpr: std::fmt::Debug {}

/// A transform function: `(input, raw params string, context) -> new phrase`.
///
/// A plain function pointer (not a closure) — describes plugin
/// registration as a "function-pointer record" ABI, and built-in transform
/// tables (see `plugins::notes`) are naturally `fn` items, not captures.
pub type TransformFn =
    fn(&Phrase, Option<&str>, &mut EvalContext) -> Result<Phrase, CoreError>;

/// A language back-end providing evaluate/transform capabilities.
pub trait Plugin: std::fmt::Debug {
    fn name(&self) -> &str;
    fn language_id(&self) -> &str;
    fn version(&self) -> &str;
    fn description(&self) -> &str;
    fn capabilities(&self) -> Capabilities;

    /// Higher wins when multiple plugins supply the same transform name.
    fn priority(&self) -> i32 {
        0
    }

    fn init(&mut self) -> bool {
        true
    }
    fn cleanup(&mut self) {}
    fn reset(&mut self) {}

    fn validate(&self, _expr: &str) -> ValidateResult {
        ValidateResult::ok()
    }

    /// True if the output depends on the evaluation context/RNG and must
    /// never be cached.
    fn is_generator(&self, _expr: &str) -> bool {
        false
    }

    fn evaluate(&self, expr: &str, ctx: &mut EvalContext) -> Result<Phrase, CoreError>;

    fn compile(&self, _expr: &str) -> Result<Option<Box<dyn CompiledExpr>>, CoreError> {
        Ok(None)
    }

    fn evaluate_compiled(
        &self,
        _compiled: &dyn CompiledExpr,
        _ctx: &mut EvalContext,
    ) -> Result<Phrase, CoreError> {
        Err(CoreError::CannotEvaluate {
            language_id: self.language_id().to_string(),
        })
    }

    fn get_transform(&self, _name: &str) -> Option<TransformFn> {
        None
    }

    fn list_transforms(&self) -> Vec<String> {
        Vec::new()
    }

    fn describe_transform(&self, _name: &str) -> Option<String> {
        None
    }

    fn get_transform_params_doc(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Registry storage is finite.
pub const MAX_PLUGINS: usize = 64;

/// A `language_id → Plugin` mapping, with one designated default plugin.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Box<dyn Plugin>>,
    /// Registration order, for FIFO tie-breaking in `find_transform`.
    order: Vec<String>,
    default_language: Option<String>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("languages", &self.order)
            .field("default_language", &self.default_language)
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    /// Register a plugin. Fails on duplicate `language_id`, on a full
    /// registry, or if the plugin's `init()` returns `false`.
    pub fn register(&mut self, mut plugin: Box<dyn Plugin>) -> Result<(), CoreError> {
        let language_id = plugin.language_id().to_string();
        if self.plugins.contains_key(&language_id) {
            return Err(CoreError::DuplicateLanguage { language_id });
        }
        if self.plugins.len() >= MAX_PLUGINS {
            return Err(CoreError::RegistryFull);
        }
        if !plugin.init() {
            return Err(CoreError::SyntaxError {
                message: format!("plugin '{language_id}' failed to initialize"),
                position: None,
            });
        }
        log::debug!("registered plugin '{language_id}' ({})", plugin.name());
        if self.default_language.is_none() {
            self.default_language = Some(language_id.clone());
        }
        self.order.push(language_id.clone());
        self.plugins.insert(language_id, plugin);
        Ok(())
    }

    /// Resolve `language_id`, falling back to the default plugin when `None`.
    pub fn find(&self, language_id: Option<&str>) -> Option<&dyn Plugin> {
        match language_id {
            Some(id) => self.plugins.get(id).map(|p| p.as_ref()),
            None => self
                .default_language
                .as_ref()
                .and_then(|id| self.plugins.get(id))
                .map(|p| p.as_ref()),
        }
    }

    pub fn find_mut(&mut self, language_id: &str) -> Option<&mut (dyn Plugin + 'static)> {
        self.plugins.get_mut(language_id).map(|p| p.as_mut())
    }

    pub fn default_language(&self) -> Option<&str> {
        self.default_language.as_deref()
    }

    pub fn set_default_language(&mut self, language_id: impl Into<String>) {
        self.default_language = Some(language_id.into());
    }

    /// Search all transform-capable plugins for `name`, returning the one
    /// with the highest `priority()` (ties broken by registration order).
    pub fn find_transform(&self, name: &str) -> Option<(&dyn Plugin, TransformFn)> {
        let mut best: Option<(&dyn Plugin, TransformFn)> = None;
        for lang in &self.order {
            let plugin = self.plugins.get(lang)?.as_ref();
            if !plugin.capabilities().contains(Capabilities::TRANSFORMS) {
                continue;
            }
            if let Some(transform) = plugin.get_transform(name) {
                let better = match &best {
                    None => true,
                    Some((current, _)) => plugin.priority() > current.priority(),
                };
                if better {
                    best = Some((plugin, transform));
                }
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn language_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Convenience constructor: registers the notes plugin as the default
    /// language.
    pub fn builtin() -> Self {
        let mut registry = PluginRegistry::new();
        registry
            .register(Box::new(crate::plugins::notes::NotesPlugin::new()))
            .expect("builtin notes plugin always registers cleanly");
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::notes::NotesPlugin;

    #[test]
    fn register_rejects_duplicate_language_id() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(NotesPlugin::new())).unwrap();
        let err = registry.register(Box::new(NotesPlugin::new())).unwrap_err();
        assert_eq!(
            err,
            CoreError::DuplicateLanguage {
                language_id: "notes".into()
            }
        );
    }

    #[test]
    fn first_registered_plugin_becomes_default() {
        let registry = PluginRegistry::builtin();
        assert_eq!(registry.default_language(), Some("notes"));
        assert!(registry.find(None).is_some());
    }

    #[test]
    fn find_transform_returns_none_for_unknown_name() {
        let registry = PluginRegistry::builtin();
        assert!(registry.find_transform("does-not-exist").is_none());
    }

    #[test]
    fn find_transform_resolves_known_builtin() {
        let registry = PluginRegistry::builtin();
        assert!(registry.find_transform("transpose").is_some());
        assert!(registry.find_transform("tr").is_some());
    }
}
