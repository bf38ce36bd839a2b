//! Trackwalker core: source expression -> compiled cell -> evaluated phrase
//! -> scheduled MIDI event.
//!
//! Audio synthesis, file I/O, undo/redo, and the terminal UI are out of
//! scope — this crate stops at an `OutputSink` the host implements.

pub mod compiler;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod model;
pub mod plugins;
pub mod registry;
pub mod sink;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Pattern, Song};
    use crate::registry::PluginRegistry;
    use crate::sink::RecordingSink;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    /// End-to-end smoke test wiring every module: song -> registry -> engine -> sink.
    #[test]
    fn full_pipeline_plays_a_chord() {
        let mut song = Song::new("demo");
        let mut pattern = Pattern::new("A", 2, 1);
        pattern.tracks[0].default_channel = 2;
        pattern.tracks[0].cells[0].set_expression("C4 E4 G4~1");
        song.add_pattern(pattern);

        let registry = PluginRegistry::builtin();
        let mut engine = engine::Engine::new(7);
        let mut sink = RecordingSink::new();
        engine.play(&mut sink);

        engine.process(125.0, &song, &registry, &mut sink);
        assert_eq!(sink.note_on_count(), 3);
    }
}
