//! Evaluator — runs a compiled cell against a context and applies its FX
//! chain.
//!
//! Grounded on `songwalker_core::dsp::engine::AudioEngine::render`: a
//! pipeline stage that consumes one owned value and hands back the next.

use crate::compiler::{CompiledCell, CompiledCellKind};
use crate::error::CoreError;
use crate::event::Phrase;
use crate::model::{PhraseLibEntry, SpilloverMode};
use crate::registry::PluginRegistry;

/// Maximum `@name` phrase-reference recursion depth.
pub const MAX_PHRASE_RECURSION: u32 = 16;

/// A tiny xorshift32 PRNG, seeded per evaluation so replays reproduce.
#[derive(Debug, Clone, Copy)]
pub struct RandomState {
    state: u32,
}

impl RandomState {
    pub fn new(seed: u32) -> Self {
        RandomState {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Uniform integer in `[0, max)`. Returns 0 if `max == 0`.
    pub fn random(&mut self, max: u32) -> u32 {
        if max == 0 {
            0
        } else {
            self.next_u32() % max
        }
    }

    /// Uniform float in `[0, 1)`.
    pub fn random_float(&mut self) -> f64 {
        (self.next_u32() as f64) / (u32::MAX as f64 + 1.0)
    }

    pub fn reseed(&mut self, seed: u32) {
        self.state = if seed == 0 { 1 } else { seed };
    }
}

/// Evaluation context exposed to plugins.
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    pub current_pattern: usize,
    pub current_track: usize,
    pub current_row: usize,
    pub total_tracks: usize,
    pub total_rows: usize,
    pub bpm: u16,
    pub rows_per_beat: u32,
    pub ticks_per_row: u32,
    pub channel: u8,
    pub track_name: String,
    pub song_name: String,
    pub absolute_tick: i64,
    pub absolute_time_ms: f64,
    pub spillover_mode: SpilloverMode,
    pub track_muted: bool,
    pub track_solo: bool,
    pub random_seed: u32,
    pub random_state: RandomState,
    pub phrase_recursion_depth: u32,
    /// Recursion ceiling for `@name` phrase references, copied from
    /// `Engine::max_phrase_recursion` at context build time.
    pub max_phrase_recursion: u32,
    phrase_library: &'a std::collections::HashMap<String, PhraseLibEntry>,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        phrase_library: &'a std::collections::HashMap<String, PhraseLibEntry>,
        random_seed: u32,
    ) -> Self {
        EvalContext {
            current_pattern: 0,
            current_track: 0,
            current_row: 0,
            total_tracks: 1,
            total_rows: 1,
            bpm: 120,
            rows_per_beat: 4,
            ticks_per_row: 6,
            channel: 0,
            track_name: String::new(),
            song_name: String::new(),
            absolute_tick: 0,
            absolute_time_ms: 0.0,
            spillover_mode: SpilloverMode::Layer,
            track_muted: false,
            track_solo: false,
            random_seed,
            random_state: RandomState::new(random_seed),
            phrase_recursion_depth: 0,
            max_phrase_recursion: MAX_PHRASE_RECURSION,
            phrase_library,
        }
    }

    pub fn lookup_phrase(&self, name: &str) -> Option<(&str, Option<&str>)> {
        self.phrase_library
            .get(name)
            .map(|entry| (entry.expression.as_str(), entry.language_id.as_deref()))
    }

    pub fn random(&mut self, max: u32) -> u32 {
        self.random_state.random(max)
    }

    pub fn random_float(&mut self) -> f64 {
        self.random_state.random_float()
    }

    pub fn reseed(&mut self, seed: u32) {
        self.random_state.reseed(seed);
    }

    /// A sub-context for evaluating a `@name` phrase reference, with the
    /// recursion depth incremented.
    pub fn for_phrase_reference(&self) -> Self {
        let mut sub = self.clone();
        sub.phrase_recursion_depth += 1;
        sub
    }
}

/// Run a compiled cell against `ctx`, returning a freshly owned phrase.
///
/// For non-generators with a cached phrase, returns a clone of the cache.
/// For generators, always reinvokes the plugin.
pub fn evaluate_cell(
    registry: &PluginRegistry,
    compiled: &mut CompiledCell,
    ctx: &mut EvalContext,
) -> Result<Option<Phrase>, CoreError> {
    let expr = match &mut compiled.kind {
        CompiledCellKind::None => return Ok(None),
        CompiledCellKind::NoteOff => return Ok(Some(Phrase::new())),
        CompiledCellKind::Expr(expr) => expr,
    };

    let plugin = registry
        .find(Some(&expr.language_id))
        .ok_or_else(|| CoreError::UnknownLanguage {
            language_id: expr.language_id.clone(),
        })?;

    if expr.is_generator {
        return plugin.evaluate(&expr.source, ctx).map(Some);
    }

    if let Some(cached) = &expr.cached_phrase {
        return Ok(Some(cached.clone()));
    }

    let phrase = if let Some(compiled_expr) = &expr.compiled_expr {
        plugin.evaluate_compiled(compiled_expr.as_ref(), ctx)?
    } else {
        plugin.evaluate(&expr.source, ctx)?
    };
    expr.cached_phrase = Some(phrase.clone());
    Ok(Some(phrase))
}

/// Apply a compiled FX chain to a phrase, left to right.
///
/// Each enabled entry is invoked with `(current_phrase, raw_params,
/// context)`; disabled entries are skipped. If any transform errors, the
/// error propagates and the partial phrase is dropped (Rust ownership makes
/// this automatic once the `Result` unwinds).
pub fn apply_fx_chain(
    chain: &crate::compiler::CompiledFxChain,
    mut phrase: Phrase,
    ctx: &mut EvalContext,
) -> Result<Phrase, CoreError> {
    for entry in &chain.entries {
        if !entry.enabled {
            continue;
        }
        phrase = (entry.transform)(&phrase, entry.params.as_deref(), ctx)?;
    }
    Ok(phrase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn random_state_is_deterministic_for_same_seed() {
        let mut a = RandomState::new(42);
        let mut b = RandomState::new(42);
        for _ in 0..10 {
            assert_eq!(a.random(1000), b.random(1000));
        }
    }

    #[test]
    fn random_state_reseed_resets_sequence() {
        let mut a = RandomState::new(7);
        let first: Vec<u32> = (0..5).map(|_| a.random(1000)).collect();
        a.reseed(7);
        let second: Vec<u32> = (0..5).map(|_| a.random(1000)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn lookup_phrase_resolves_from_library() {
        let mut lib = HashMap::new();
        lib.insert(
            "hook".to_string(),
            PhraseLibEntry {
                expression: "C4".to_string(),
                language_id: None,
            },
        );
        let ctx = EvalContext::new(&lib, 1);
        assert_eq!(ctx.lookup_phrase("hook"), Some(("C4", None)));
        assert_eq!(ctx.lookup_phrase("missing"), None);
    }
}
