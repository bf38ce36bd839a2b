//! Data model — songs, patterns, tracks, cells, FX chains.
//!
//! Grounded on `songwalker_core::ast` (tree-of-records) and
//! `compiler::InstrumentConfig` (plain struct with a `Default` impl) for the
//! "entities are plain records owned by their parent" style.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One entry in an FX chain — source form only; the compiler resolves it
/// against the registry into a `CompiledFxEntry` (see `compiler.rs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl FxEntry {
    pub fn new(name: impl Into<String>) -> Self {
        FxEntry {
            name: name.into(),
            params: None,
            language_id: None,
            enabled: true,
        }
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(params.into());
        self
    }
}

/// An ordered, exclusively owned chain of FX entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FxChain {
    pub entries: Vec<FxEntry>,
}

impl FxChain {
    pub fn new() -> Self {
        FxChain::default()
    }

    pub fn push(&mut self, entry: FxEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The kind of a grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Empty,
    Expression,
    NoteOff,
    Continuation,
}

/// One grid intersection of (pattern, track, row).
///
/// Invariant (enforced by `Pattern`/`Track` shape, not here):
/// `cell_type == Expression` iff `expression` is non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub cell_type: CellType,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_id: Option<String>,
    #[serde(default)]
    pub fx_chain: FxChain,
    /// Not persisted — rebuilt by the compiler on demand. Deserialized cells
    /// come back dirty, same as a freshly constructed one, so the engine
    /// recompiles rather than trusting a compile cache that never existed.
    #[serde(skip, default = "default_dirty_true")]
    pub dirty: bool,
}

fn default_dirty_true() -> bool {
    true
}

impl Default for Cell {
    fn default() -> Self {
        Cell {
            cell_type: CellType::Empty,
            expression: String::new(),
            language_id: None,
            fx_chain: FxChain::default(),
            dirty: true,
        }
    }
}

impl Cell {
    pub fn empty() -> Self {
        Cell::default()
    }

    pub fn note_off() -> Self {
        Cell {
            cell_type: CellType::NoteOff,
            ..Cell::default()
        }
    }

    pub fn continuation() -> Self {
        Cell {
            cell_type: CellType::Continuation,
            ..Cell::default()
        }
    }

    pub fn expression(expr: impl Into<String>) -> Self {
        let expr = expr.into();
        let cell_type = if expr.is_empty() {
            CellType::Empty
        } else {
            CellType::Expression
        };
        Cell {
            cell_type,
            expression: expr,
            ..Cell::default()
        }
    }

    /// Set the cell's source expression, marking it dirty so the compiled
    /// form is discarded before next use.
    pub fn set_expression(&mut self, expr: impl Into<String>) {
        let expr = expr.into();
        self.cell_type = if expr.is_empty() {
            CellType::Empty
        } else {
            CellType::Expression
        };
        self.expression = expr;
        self.dirty = true;
    }

    pub fn set_fx_chain(&mut self, chain: FxChain) {
        self.fx_chain = chain;
        self.dirty = true;
    }

    pub fn is_playable(&self) -> bool {
        matches!(self.cell_type, CellType::Expression | CellType::NoteOff)
    }
}

/// One track within a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    pub default_channel: u8,
    pub volume: u8,
    pub pan: i8,
    pub muted: bool,
    pub solo: bool,
    #[serde(default)]
    pub fx_chain: FxChain,
    pub cells: Vec<Cell>,
}

impl Track {
    pub fn new(name: impl Into<String>, num_rows: usize) -> Self {
        Track {
            name: name.into(),
            default_channel: 0,
            volume: 100,
            pan: 0,
            muted: false,
            solo: false,
            fx_chain: FxChain::default(),
            cells: (0..num_rows).map(|_| Cell::empty()).collect(),
        }
    }

    fn resize(&mut self, num_rows: usize) {
        self.cells.resize_with(num_rows, Cell::empty);
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(127);
    }

    pub fn set_pan(&mut self, pan: i8) {
        self.pan = pan.clamp(-64, 63);
    }
}

/// A grid of tracks sharing a row count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub num_rows: usize,
    pub tracks: Vec<Track>,
}

impl Pattern {
    pub fn new(name: impl Into<String>, num_rows: usize, num_tracks: usize) -> Self {
        Pattern {
            name: name.into(),
            num_rows,
            tracks: (0..num_tracks)
                .map(|i| Track::new(format!("Track {}", i + 1), num_rows))
                .collect(),
        }
    }

    /// Resize the pattern, resizing every track's cell vector in lockstep.
    pub fn resize_rows(&mut self, num_rows: usize) {
        self.num_rows = num_rows;
        for track in &mut self.tracks {
            track.resize(num_rows);
        }
    }

    pub fn add_track(&mut self, name: impl Into<String>) {
        self.tracks.push(Track::new(name, self.num_rows));
    }

    /// True iff every track's cell vector length equals `num_rows`.
    pub fn is_closed(&self) -> bool {
        self.tracks.iter().all(|t| t.cells.len() == self.num_rows)
    }
}

/// One step of the song sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub pattern_index: usize,
    pub repeat_count: u32,
}

impl SequenceEntry {
    pub fn new(pattern_index: usize) -> Self {
        SequenceEntry {
            pattern_index,
            repeat_count: 1,
        }
    }
}

/// Spillover policy governing overlap between successive phrases on the
/// same track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpilloverMode {
    Layer,
    Truncate,
    Loop,
}

/// An entry in the song's phrase library (`@name` references).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhraseLibEntry {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_id: Option<String>,
}

/// The top-level song: patterns, sequence, master FX, and the phrase library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub name: String,
    pub author: String,
    pub bpm: u16,
    pub rows_per_beat: u32,
    pub ticks_per_row: u32,
    pub patterns: Vec<Pattern>,
    pub sequence: Vec<SequenceEntry>,
    pub spillover_mode: SpilloverMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_language_id: Option<String>,
    #[serde(default)]
    pub master_fx: FxChain,
    #[serde(default)]
    pub phrase_library: HashMap<String, PhraseLibEntry>,
}

impl Default for Song {
    fn default() -> Self {
        Song {
            name: String::new(),
            author: String::new(),
            bpm: 120,
            rows_per_beat: 4,
            ticks_per_row: 6,
            patterns: Vec::new(),
            sequence: Vec::new(),
            spillover_mode: SpilloverMode::Layer,
            default_language_id: None,
            master_fx: FxChain::default(),
            phrase_library: HashMap::new(),
        }
    }
}

impl Song {
    pub fn new(name: impl Into<String>) -> Self {
        Song {
            name: name.into(),
            ..Song::default()
        }
    }

    pub fn set_bpm(&mut self, bpm: u16) {
        self.bpm = bpm.clamp(20, 300);
    }

    pub fn add_pattern(&mut self, pattern: Pattern) -> usize {
        self.patterns.push(pattern);
        self.patterns.len() - 1
    }

    /// Remove a pattern, deleting all sequence entries that reference it and
    /// decrementing the pattern_index of entries referencing higher indices.
    pub fn remove_pattern(&mut self, index: usize) {
        if index >= self.patterns.len() {
            return;
        }
        self.patterns.remove(index);
        self.sequence.retain(|entry| entry.pattern_index != index);
        for entry in &mut self.sequence {
            if entry.pattern_index > index {
                entry.pattern_index -= 1;
            }
        }
    }

    pub fn lookup_phrase(&self, name: &str) -> Option<&PhraseLibEntry> {
        self.phrase_library.get(name)
    }

    /// Milliseconds per tick at the song's current tempo.
    pub fn tick_duration_ms(&self) -> f64 {
        60_000.0 / (self.bpm as f64 * self.rows_per_beat as f64 * self.ticks_per_row as f64)
    }

    /// Milliseconds per row at the song's current tempo.
    pub fn row_duration_ms(&self) -> f64 {
        self.tick_duration_ms() * self.ticks_per_row as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_resize_keeps_tracks_in_lockstep() {
        let mut pattern = Pattern::new("A", 4, 2);
        pattern.resize_rows(8);
        assert!(pattern.is_closed());
        assert_eq!(pattern.tracks[0].cells.len(), 8);
        assert_eq!(pattern.tracks[1].cells.len(), 8);
    }

    #[test]
    fn remove_pattern_updates_sequence_indices() {
        let mut song = Song::new("s");
        song.add_pattern(Pattern::new("A", 4, 1));
        song.add_pattern(Pattern::new("B", 4, 1));
        song.add_pattern(Pattern::new("C", 4, 1));
        song.sequence.push(SequenceEntry::new(0));
        song.sequence.push(SequenceEntry::new(1));
        song.sequence.push(SequenceEntry::new(2));
        song.remove_pattern(1);
        assert_eq!(song.patterns.len(), 2);
        let indices: Vec<usize> = song.sequence.iter().map(|e| e.pattern_index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn cell_set_expression_marks_dirty() {
        let mut cell = Cell::empty();
        cell.dirty = false;
        cell.set_expression("C4");
        assert!(cell.dirty);
        assert_eq!(cell.cell_type, CellType::Expression);
    }

    #[test]
    fn track_set_volume_clamps_to_range() {
        let mut track = Track::new("A", 1);
        track.set_volume(255);
        assert_eq!(track.volume, 127);
        track.set_volume(0);
        assert_eq!(track.volume, 0);
    }

    #[test]
    fn track_set_pan_clamps_to_range() {
        let mut track = Track::new("A", 1);
        track.set_pan(127);
        assert_eq!(track.pan, 63);
        track.set_pan(-128);
        assert_eq!(track.pan, -64);
    }

    #[test]
    fn set_bpm_clamps_to_range() {
        let mut song = Song::new("s");
        song.set_bpm(1000);
        assert_eq!(song.bpm, 300);
        song.set_bpm(1);
        assert_eq!(song.bpm, 20);
    }

    #[test]
    fn song_roundtrips_through_json() {
        let mut song = Song::new("Demo");
        song.add_pattern(Pattern::new("A", 4, 2));
        let json = serde_json::to_string(&song).unwrap();
        let back: Song = serde_json::from_str(&json).unwrap();
        assert_eq!(song, back);
    }

    #[test]
    fn row_duration_matches_tempo() {
        let mut song = Song::new("s");
        song.bpm = 120;
        song.rows_per_beat = 4;
        song.ticks_per_row = 6;
        // 125ms per row at 120bpm/4 rows-per-beat.
        assert!((song.row_duration_ms() - 125.0).abs() < 1e-9);
    }
}
