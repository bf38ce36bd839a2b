//! Engine — clock, transport, scheduling, active-note tracking, spillover.
//!
//! Grounded on `songwalker_core::dsp::engine::AudioEngine`'s role as the
//! single stateful driver sitting downstream of the compiler/evaluator and
//! upstream of a sink; the pending queue is a `BinaryHeap` in the style of
//! `songwalker_core::dsp::mixer::Mixer`'s voice pool (fixed capacity, drop
//! newest on overflow, no allocator churn in the steady state).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::compiler::{compile_cell, compile_fx_chain, CompiledCell, CompiledFxChain};
use crate::error::{CoreError, LocatedError};
use crate::evaluator::{apply_fx_chain, evaluate_cell, EvalContext};
use crate::event::{Event, EventType, Phrase};
use crate::model::{Cell, CellType, FxChain, PhraseLibEntry, SpilloverMode, Song};
use crate::registry::PluginRegistry;
use crate::sink::OutputSink;

/// Default pending-queue capacity; overflow is a recorded underrun, not a panic.
pub const MAX_PENDING: usize = 4096;
/// Default active-note table capacity.
pub const MAX_ACTIVE_NOTES: usize = 1024;
/// Default scan-ahead bound, in rows, for how far past `current_tick` a
/// scheduled event's `due_tick` may land.
pub const DEFAULT_MAX_SCAN_AHEAD_ROWS: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Playing,
    Paused,
    Recording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    PatternLoop,
    SongSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Internal,
    ExternalMidi,
    ExternalLink,
}

/// Origin of a scheduled entry, carried so cancellation can target a
/// track or a specific phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSource {
    pub pattern: usize,
    pub track: Option<usize>,
    pub row: usize,
    pub phrase_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    NoteOn {
        note: u8,
        velocity: u8,
        scheduled_off_tick: Option<i64>,
    },
    NoteOff {
        note: u8,
        velocity: u8,
    },
    Cc {
        controller: u8,
        value: u8,
    },
    ProgramChange {
        program: u8,
    },
    PitchBend {
        value: i16,
    },
    Aftertouch {
        pressure: u8,
    },
    PolyAftertouch {
        note: u8,
        pressure: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEntry {
    due_tick: i64,
    seq: u64,
    channel: u8,
    kind: PendingKind,
    source: EventSource,
}

/// Min-heap by `due_tick`; among equal due ticks, lower `seq` (earlier
/// scheduling) pops first.
impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_tick
            .cmp(&self.due_tick)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A currently-sounding note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveNote {
    pub channel: u8,
    pub note: u8,
    pub track: Option<usize>,
    pub phrase_id: u64,
    pub started_tick: i64,
    pub scheduled_off_tick: Option<i64>,
}

/// Monotonic (resettable) counters plus a live snapshot of queue depth.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub events_fired: u64,
    pub events_scheduled: u64,
    pub notes_on: u64,
    pub notes_off: u64,
    pub underruns: u64,
    pub pending_events: u64,
    pub active_notes: u64,
}

#[derive(Debug)]
struct CellCacheEntry {
    compiled: CompiledCell,
    source: String,
    fx_chain: FxChain,
    language_id: Option<String>,
}

/// The playback engine. Holds no reference to `Song` or `PluginRegistry` —
/// both are passed by reference into every operation, so a host is free to
/// keep mutating the song between calls (see `DESIGN.md`, Open Question 2).
#[derive(Debug)]
pub struct Engine {
    state: EngineState,
    play_mode: PlayMode,
    sync_mode: SyncMode,
    current_tick: i64,
    ticks_into_row: i64,
    /// Whether `current_row` has already had `scan_row` run against it —
    /// guards against re-triggering a row when `process`/`step_row` are
    /// interleaved.
    row_scanned: bool,
    current_pattern: usize,
    current_row: usize,
    sequence_pos: usize,
    sequence_repeats_done: u32,
    loop_start_row: usize,
    loop_end_row: Option<usize>,
    swing_amount: u8,
    pub send_all_notes_off_on_seek: bool,
    pub send_all_notes_off_on_stop: bool,
    /// Pending-queue capacity; overflow increments `stats.underruns` and
    /// drops the newest event rather than growing unbounded.
    pub pending_capacity: usize,
    /// Active-note table capacity; beyond it, new NoteOns still sound but
    /// drop out of `all_notes_off`/`track_notes_off` bookkeeping.
    pub active_note_capacity: usize,
    /// `@name` phrase-reference recursion ceiling, copied into each
    /// `EvalContext` built by this engine.
    pub max_phrase_recursion: u32,
    /// Scan-ahead bound, in rows: no scheduled event's `due_tick` may exceed
    /// `current_tick + ticks_per_row * max_scan_ahead_rows`.
    pub max_scan_ahead_rows: u32,
    random_seed: u32,
    compile_cache: HashMap<(usize, usize, usize), CellCacheEntry>,
    track_fx_cache: HashMap<(usize, usize), (FxChain, CompiledFxChain)>,
    master_fx_cache: Option<(FxChain, CompiledFxChain)>,
    last_track_phrase: HashMap<usize, (Phrase, u8, i64)>,
    pending: BinaryHeap<PendingEntry>,
    active_notes: Vec<ActiveNote>,
    next_phrase_id: u64,
    next_seq: u64,
    stats: EngineStats,
    last_error: Option<LocatedError>,
    external_bpm_hint: Option<u16>,
    external_beat_hint: Option<f64>,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(1)
    }
}

impl Engine {
    /// Channel value the sink's `all_notes_off` treats as "every channel".
    pub const ALL_CHANNELS: u8 = 255;

    pub fn new(random_seed: u32) -> Self {
        Engine {
            state: EngineState::Stopped,
            play_mode: PlayMode::PatternLoop,
            sync_mode: SyncMode::Internal,
            current_tick: 0,
            ticks_into_row: 0,
            row_scanned: false,
            current_pattern: 0,
            current_row: 0,
            sequence_pos: 0,
            sequence_repeats_done: 0,
            loop_start_row: 0,
            loop_end_row: None,
            swing_amount: 50,
            send_all_notes_off_on_seek: false,
            send_all_notes_off_on_stop: true,
            pending_capacity: MAX_PENDING,
            active_note_capacity: MAX_ACTIVE_NOTES,
            max_phrase_recursion: crate::evaluator::MAX_PHRASE_RECURSION,
            max_scan_ahead_rows: DEFAULT_MAX_SCAN_AHEAD_ROWS,
            random_seed: if random_seed == 0 { 1 } else { random_seed },
            compile_cache: HashMap::new(),
            track_fx_cache: HashMap::new(),
            master_fx_cache: None,
            last_track_phrase: HashMap::new(),
            pending: BinaryHeap::new(),
            active_notes: Vec::new(),
            next_phrase_id: 0,
            next_seq: 0,
            stats: EngineStats::default(),
            last_error: None,
            external_bpm_hint: None,
            external_beat_hint: None,
        }
    }

    // ── Transport ────────────────────────────────────────────────

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn play(&mut self, sink: &mut dyn OutputSink) {
        if self.state == EngineState::Paused {
            sink.continue_playback();
        } else {
            sink.start();
        }
        self.state = EngineState::Playing;
    }

    pub fn record(&mut self, sink: &mut dyn OutputSink) {
        if self.state == EngineState::Paused {
            sink.continue_playback();
        } else {
            sink.start();
        }
        self.state = EngineState::Recording;
    }

    pub fn pause(&mut self) {
        self.state = EngineState::Paused;
    }

    pub fn stop(&mut self, sink: &mut dyn OutputSink) {
        self.state = EngineState::Stopped;
        self.cancel_all();
        if self.send_all_notes_off_on_stop {
            self.all_notes_off(sink);
        }
        sink.stop();
    }

    pub fn play_mode(&self) -> PlayMode {
        self.play_mode
    }

    pub fn set_play_mode(&mut self, mode: PlayMode) {
        self.play_mode = mode;
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
    }

    pub fn current_tick(&self) -> i64 {
        self.current_tick
    }

    pub fn current_pattern(&self) -> usize {
        self.current_pattern
    }

    pub fn current_row(&self) -> usize {
        self.current_row
    }

    pub fn set_loop_bounds(&mut self, start_row: usize, end_row: Option<usize>) {
        self.loop_start_row = start_row;
        self.loop_end_row = end_row;
    }

    pub fn set_swing_amount(&mut self, amount: u8) {
        self.swing_amount = amount.min(100);
    }

    pub fn last_error(&self) -> Option<&LocatedError> {
        self.last_error.as_ref()
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    pub fn stats(&self) -> EngineStats {
        let mut s = self.stats;
        s.pending_events = self.pending.len() as u64;
        s.active_notes = self.active_notes.len() as u64;
        s
    }

    pub fn reset_stats(&mut self) {
        self.stats = EngineStats::default();
    }

    pub fn active_note_count(&self) -> usize {
        self.active_notes.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ── Seek ─────────────────────────────────────────────────────

    pub fn seek(&mut self, song: &Song, pattern_index: usize, row: usize, sink: &mut dyn OutputSink) {
        self.cancel_all();
        if self.send_all_notes_off_on_seek {
            self.all_notes_off(sink);
        } else {
            self.active_notes.clear();
        }
        self.current_pattern = pattern_index;
        self.current_row = row;
        self.ticks_into_row = 0;
        self.row_scanned = false;
        self.current_tick = row as i64 * song.ticks_per_row as i64;
        self.last_track_phrase.clear();
    }

    // ── Cancellation ────────────────────────────────

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    pub fn cancel_track(&mut self, track_idx: usize) {
        let kept: Vec<PendingEntry> = self
            .pending
            .drain()
            .filter(|e| e.source.track != Some(track_idx))
            .collect();
        self.pending = kept.into_iter().collect();
    }

    pub fn cancel_phrase(&mut self, phrase_id: u64) {
        let kept: Vec<PendingEntry> = self
            .pending
            .drain()
            .filter(|e| e.source.phrase_id != phrase_id)
            .collect();
        self.pending = kept.into_iter().collect();
    }

    // ── Note-off helpers (spurious off is not an error — sink is idempotent) ─

    pub fn all_notes_off(&mut self, sink: &mut dyn OutputSink) {
        self.stats.notes_off += self.active_notes.len() as u64;
        self.active_notes.clear();
        sink.all_notes_off(Self::ALL_CHANNELS);
    }

    pub fn channel_notes_off(&mut self, channel: u8, sink: &mut dyn OutputSink) {
        let before = self.active_notes.len();
        self.active_notes.retain(|n| n.channel != channel);
        self.stats.notes_off += (before - self.active_notes.len()) as u64;
        sink.all_notes_off(channel);
    }

    pub fn track_notes_off(&mut self, track_idx: usize, sink: &mut dyn OutputSink) {
        let (matching, rest): (Vec<_>, Vec<_>) = self
            .active_notes
            .drain(..)
            .partition(|n| n.track == Some(track_idx));
        self.active_notes = rest;
        for note in matching {
            sink.note_off(note.channel, note.note, 0);
            self.stats.notes_off += 1;
        }
    }

    // ── Immediate operations ─────────────────────────────────────

    fn ensure_row_scanned(&mut self, song: &Song, registry: &PluginRegistry, sink: &mut dyn OutputSink) {
        if !self.row_scanned {
            self.scan_row(song, registry, sink);
            self.row_scanned = true;
        }
    }

    pub fn step_row(&mut self, song: &Song, registry: &PluginRegistry, sink: &mut dyn OutputSink) {
        if song.patterns.is_empty() {
            return;
        }
        self.ensure_row_scanned(song, registry, sink);
        let ticks_per_row = song.ticks_per_row as i64;
        self.drain_pending_until(self.current_tick + ticks_per_row - 1, sink);
        self.current_tick += ticks_per_row;
        self.ticks_into_row = 0;
        self.advance_row(song);
        self.ensure_row_scanned(song, registry, sink);
    }

    pub fn step_tick(&mut self, song: &Song, registry: &PluginRegistry, sink: &mut dyn OutputSink) {
        if song.patterns.is_empty() {
            return;
        }
        self.ensure_row_scanned(song, registry, sink);
        self.drain_pending_until(self.current_tick, sink);
        self.current_tick += 1;
        self.ticks_into_row += 1;
        if self.ticks_into_row >= song.ticks_per_row as i64 {
            self.ticks_into_row = 0;
            self.advance_row(song);
        }
    }

    pub fn trigger_cell(
        &mut self,
        song: &Song,
        registry: &PluginRegistry,
        pattern_idx: usize,
        track_idx: usize,
        row_idx: usize,
        sink: &mut dyn OutputSink,
    ) {
        self.trigger_cell_inner(song, registry, pattern_idx, track_idx, row_idx, sink);
    }

    pub fn eval_immediate(
        &mut self,
        song: &Song,
        registry: &PluginRegistry,
        expr: &str,
        language_id: Option<&str>,
        channel: u8,
        sink: &mut dyn OutputSink,
    ) -> Result<(), CoreError> {
        let plugin = registry.find(language_id).ok_or_else(|| CoreError::UnknownLanguage {
            language_id: language_id.unwrap_or_default().to_string(),
        })?;
        let mut ctx = self.build_context(song, &song.phrase_library, self.current_pattern, 0, self.current_row, channel, "", false, false);
        let phrase = plugin.evaluate(expr, &mut ctx)?;
        self.schedule_phrase(song, self.current_pattern, None, self.current_row, channel, phrase, sink);
        Ok(())
    }

    // ── External sync stubs ──────

    pub fn external_clock_tick(&mut self, song: &Song, registry: &PluginRegistry, sink: &mut dyn OutputSink) {
        if self.sync_mode == SyncMode::ExternalMidi {
            self.step_tick(song, registry, sink);
        }
    }

    pub fn external_start(&mut self, sink: &mut dyn OutputSink) {
        if self.sync_mode != SyncMode::Internal {
            sink.start();
            self.state = EngineState::Playing;
        }
    }

    pub fn external_stop(&mut self, sink: &mut dyn OutputSink) {
        if self.sync_mode != SyncMode::Internal {
            self.stop(sink);
        }
    }

    pub fn external_continue(&mut self, sink: &mut dyn OutputSink) {
        if self.sync_mode != SyncMode::Internal {
            sink.continue_playback();
            self.state = EngineState::Playing;
        }
    }

    pub fn link_update(&mut self, beat: f64, bpm: u16, is_playing: bool) {
        self.external_beat_hint = Some(beat);
        self.external_bpm_hint = Some(bpm);
        if self.sync_mode == SyncMode::ExternalLink {
            self.state = if is_playing { EngineState::Playing } else { EngineState::Paused };
        }
    }

    // ── Main loop ─────────────────────────────────────────────────

    /// Advance playback by `delta_ms`. A no-op unless `Playing`/`Recording`
    /// and driven internally.
    pub fn process(&mut self, delta_ms: f64, song: &Song, registry: &PluginRegistry, sink: &mut dyn OutputSink) {
        if !matches!(self.state, EngineState::Playing | EngineState::Recording) {
            return;
        }
        if self.sync_mode != SyncMode::Internal {
            return;
        }
        if song.patterns.is_empty() {
            return;
        }

        let tick_ms = song.tick_duration_ms();
        if tick_ms <= 0.0 {
            return;
        }

        // A row's events are due the instant playback reaches it, not only
        // once enough wall-clock time has passed to cross a tick boundary —
        // otherwise a short `process` call right after `play`/`seek` would
        // silently miss row 0.
        self.ensure_row_scanned(song, registry, sink);
        self.drain_pending_until(self.current_tick, sink);

        let delta_ticks = (delta_ms / tick_ms).round() as i64;
        if delta_ticks <= 0 {
            return;
        }

        let ticks_per_row = song.ticks_per_row as i64;
        let window_end = self.current_tick + delta_ticks;

        while self.current_tick < window_end {
            let step = (ticks_per_row - self.ticks_into_row).min(window_end - self.current_tick);
            self.current_tick += step;
            self.ticks_into_row += step;
            // Internal sync drives the clock; external modes never reach this
            // loop (process() returns early above when sync_mode != Internal).
            for _ in 0..step {
                sink.clock();
            }
            self.drain_pending_until(self.current_tick - 1, sink);
            if self.ticks_into_row >= ticks_per_row {
                self.ticks_into_row = 0;
                self.advance_row(song);
                if self.state == EngineState::Stopped {
                    break;
                }
                self.ensure_row_scanned(song, registry, sink);
            }
        }
        self.drain_pending_until(self.current_tick - 1, sink);
    }

    fn advance_row(&mut self, song: &Song) {
        let pattern = match song.patterns.get(self.current_pattern) {
            Some(p) => p,
            None => return,
        };
        self.row_scanned = false;
        self.current_row += 1;

        match self.play_mode {
            PlayMode::PatternLoop => {
                let effective_end = self
                    .loop_end_row
                    .map(|r| (r + 1).min(pattern.num_rows))
                    .unwrap_or(pattern.num_rows)
                    .max(1);
                if self.current_row >= effective_end {
                    self.current_row = self.loop_start_row.min(pattern.num_rows.saturating_sub(1));
                }
            }
            PlayMode::SongSequence => {
                if self.current_row >= pattern.num_rows {
                    if song.sequence.is_empty() {
                        self.state = EngineState::Stopped;
                        self.current_row = 0;
                        return;
                    }
                    self.sequence_repeats_done += 1;
                    let entry = song.sequence[self.sequence_pos];
                    if self.sequence_repeats_done >= entry.repeat_count {
                        self.sequence_repeats_done = 0;
                        self.sequence_pos += 1;
                        if self.sequence_pos >= song.sequence.len() {
                            self.sequence_pos = 0;
                        }
                    }
                    let next_entry = song.sequence[self.sequence_pos];
                    self.current_pattern = next_entry.pattern_index;
                    self.current_row = 0;
                }
            }
        }
    }

    // ── Scanning & triggering ─────────────────────────────────────

    fn scan_row(&mut self, song: &Song, registry: &PluginRegistry, sink: &mut dyn OutputSink) {
        let pattern = match song.patterns.get(self.current_pattern) {
            Some(p) => p,
            None => return,
        };
        if self.current_row >= pattern.num_rows {
            return;
        }
        let any_solo = pattern.tracks.iter().any(|t| t.solo);
        let track_count = pattern.tracks.len();
        for track_idx in 0..track_count {
            let track = &song.patterns[self.current_pattern].tracks[track_idx];
            let visible = if any_solo { track.solo } else { !track.muted };
            if !visible {
                continue;
            }
            let cell = &track.cells[self.current_row];
            if cell.is_playable() {
                self.trigger_cell_inner(song, registry, self.current_pattern, track_idx, self.current_row, sink);
            } else if matches!(song.spillover_mode, SpilloverMode::Loop) {
                self.maybe_reloop_track(song, track_idx, sink);
            }
        }
    }

    fn trigger_cell_inner(
        &mut self,
        song: &Song,
        registry: &PluginRegistry,
        pattern_idx: usize,
        track_idx: usize,
        row_idx: usize,
        sink: &mut dyn OutputSink,
    ) {
        let pattern = match song.patterns.get(pattern_idx) {
            Some(p) => p,
            None => return,
        };
        let track = match pattern.tracks.get(track_idx) {
            Some(t) => t,
            None => return,
        };
        let cell = match track.cells.get(row_idx) {
            Some(c) => c,
            None => return,
        };

        if cell.cell_type == CellType::NoteOff {
            self.track_notes_off(track_idx, sink);
            return;
        }
        if cell.cell_type != CellType::Expression {
            return;
        }

        let key = (pattern_idx, track_idx, row_idx);
        if let Err(error) = self.ensure_cell_compiled(cell, song.default_language_id.as_deref(), registry, key) {
            self.last_error = Some(LocatedError {
                error,
                pattern: pattern_idx,
                track: track_idx,
                row: row_idx,
            });
            return;
        }

        let channel = track.default_channel;
        let mut ctx = self.build_context(
            song,
            &song.phrase_library,
            pattern_idx,
            track_idx,
            row_idx,
            channel,
            &track.name,
            track.muted,
            track.solo,
        );

        let phrase = {
            let entry = self.compile_cache.get_mut(&key).expect("just compiled");
            evaluate_cell(registry, &mut entry.compiled, &mut ctx)
        };
        let phrase = match phrase {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(error) => {
                self.last_error = Some(LocatedError {
                    error,
                    pattern: pattern_idx,
                    track: track_idx,
                    row: row_idx,
                });
                return;
            }
        };

        let phrase = {
            let entry = self.compile_cache.get(&key).expect("just compiled");
            match apply_fx_chain(&entry.compiled.fx_chain, phrase, &mut ctx) {
                Ok(p) => p,
                Err(error) => {
                    self.last_error = Some(LocatedError { error, pattern: pattern_idx, track: track_idx, row: row_idx });
                    return;
                }
            }
        };

        let track_fx = track.fx_chain.clone();
        let phrase = match self.apply_cached_fx(
            (pattern_idx, track_idx),
            &track_fx,
            registry,
            phrase,
            &mut ctx,
        ) {
            Ok(p) => p,
            Err(error) => {
                self.last_error = Some(LocatedError { error, pattern: pattern_idx, track: track_idx, row: row_idx });
                return;
            }
        };

        let master_fx = song.master_fx.clone();
        let phrase = match self.apply_master_fx(&master_fx, registry, phrase, &mut ctx) {
            Ok(p) => p,
            Err(error) => {
                self.last_error = Some(LocatedError { error, pattern: pattern_idx, track: track_idx, row: row_idx });
                return;
            }
        };

        if phrase.is_empty() {
            return;
        }

        self.apply_spillover(song, track_idx, sink);
        self.last_track_phrase
            .insert(track_idx, (phrase.clone(), channel, self.current_tick));
        self.schedule_phrase(song, pattern_idx, Some(track_idx), row_idx, channel, phrase, sink);
    }

    /// Spillover=Loop: an empty/continuation cell re-triggers the previous
    /// phrase on the same track, rebased to the current tick.
    fn maybe_reloop_track(&mut self, song: &Song, track_idx: usize, sink: &mut dyn OutputSink) {
        if let Some((phrase, channel, _)) = self.last_track_phrase.get(&track_idx).cloned() {
            self.schedule_phrase(song, self.current_pattern, Some(track_idx), self.current_row, channel, phrase, sink);
        }
    }

    fn apply_spillover(&mut self, song: &Song, track_idx: usize, sink: &mut dyn OutputSink) {
        if song.spillover_mode == SpilloverMode::Truncate {
            self.cancel_track(track_idx);
            self.track_notes_off(track_idx, sink);
        }
    }

    fn ensure_cell_compiled(
        &mut self,
        cell: &Cell,
        default_language_id: Option<&str>,
        registry: &PluginRegistry,
        key: (usize, usize, usize),
    ) -> Result<(), CoreError> {
        let needs_recompile = match self.compile_cache.get(&key) {
            None => true,
            Some(entry) => {
                cell.dirty
                    || entry.source != cell.expression
                    || entry.fx_chain != cell.fx_chain
                    || entry.language_id.as_deref() != cell.language_id.as_deref()
            }
        };
        if needs_recompile {
            let compiled = compile_cell(cell, default_language_id, registry)?;
            self.compile_cache.insert(
                key,
                CellCacheEntry {
                    compiled,
                    source: cell.expression.clone(),
                    fx_chain: cell.fx_chain.clone(),
                    language_id: cell.language_id.clone(),
                },
            );
        }
        Ok(())
    }

    fn apply_cached_fx(
        &mut self,
        key: (usize, usize),
        fx_chain: &FxChain,
        registry: &PluginRegistry,
        phrase: Phrase,
        ctx: &mut EvalContext,
    ) -> Result<Phrase, CoreError> {
        let needs_recompile = match self.track_fx_cache.get(&key) {
            Some((snapshot, _)) => snapshot != fx_chain,
            None => true,
        };
        if needs_recompile {
            let compiled = compile_fx_chain(fx_chain, registry)?;
            self.track_fx_cache.insert(key, (fx_chain.clone(), compiled));
        }
        let (_, compiled) = self.track_fx_cache.get(&key).expect("just compiled");
        apply_fx_chain(compiled, phrase, ctx)
    }

    fn apply_master_fx(
        &mut self,
        fx_chain: &FxChain,
        registry: &PluginRegistry,
        phrase: Phrase,
        ctx: &mut EvalContext,
    ) -> Result<Phrase, CoreError> {
        let needs_recompile = match &self.master_fx_cache {
            Some((snapshot, _)) => snapshot != fx_chain,
            None => true,
        };
        if needs_recompile {
            let compiled = compile_fx_chain(fx_chain, registry)?;
            self.master_fx_cache = Some((fx_chain.clone(), compiled));
        }
        let (_, compiled) = self.master_fx_cache.as_ref().expect("just compiled");
        apply_fx_chain(compiled, phrase, ctx)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_context<'a>(
        &self,
        song: &Song,
        phrase_library: &'a HashMap<String, PhraseLibEntry>,
        pattern_idx: usize,
        track_idx: usize,
        row_idx: usize,
        channel: u8,
        track_name: &str,
        track_muted: bool,
        track_solo: bool,
    ) -> EvalContext<'a> {
        let seed = self
            .random_seed
            .wrapping_add((pattern_idx as u32).wrapping_mul(0x9E37_79B1))
            .wrapping_add((track_idx as u32).wrapping_mul(0x85EB_CA77))
            .wrapping_add((row_idx as u32).wrapping_mul(0xC2B2_AE3D));
        let mut ctx = EvalContext::new(phrase_library, if seed == 0 { 1 } else { seed });
        ctx.max_phrase_recursion = self.max_phrase_recursion;
        ctx.current_pattern = pattern_idx;
        ctx.current_track = track_idx;
        ctx.current_row = row_idx;
        ctx.total_tracks = song.patterns.get(pattern_idx).map(|p| p.tracks.len()).unwrap_or(0);
        ctx.total_rows = song.patterns.get(pattern_idx).map(|p| p.num_rows).unwrap_or(0);
        ctx.bpm = song.bpm;
        ctx.rows_per_beat = song.rows_per_beat;
        ctx.ticks_per_row = song.ticks_per_row;
        ctx.channel = channel;
        ctx.track_name = track_name.to_string();
        ctx.song_name = song.name.clone();
        ctx.absolute_tick = self.current_tick;
        ctx.absolute_time_ms = self.current_tick as f64 * song.tick_duration_ms();
        ctx.spillover_mode = song.spillover_mode;
        ctx.track_muted = track_muted;
        ctx.track_solo = track_solo;
        ctx
    }

    fn swing_ticks_for_row(&self, song: &Song, row_idx: usize) -> i64 {
        if self.swing_amount == 50 {
            return 0;
        }
        let rows_per_beat = song.rows_per_beat.max(1);
        if (row_idx as u32 % rows_per_beat) % 2 != 1 {
            return 0;
        }
        let row_ms = song.row_duration_ms();
        let delay_ms = (self.swing_amount as f64 - 50.0) / 50.0 * (row_ms / 2.0);
        (delay_ms / song.tick_duration_ms()).round() as i64
    }

    // ── Scheduling ──

    #[allow(clippy::too_many_arguments)]
    fn schedule_phrase(
        &mut self,
        song: &Song,
        pattern_idx: usize,
        track_idx: Option<usize>,
        row_idx: usize,
        channel_default: u8,
        phrase: Phrase,
        sink: &mut dyn OutputSink,
    ) {
        let ticks_per_row = song.ticks_per_row as i64;
        let base = self.current_tick;
        let swing = self.swing_ticks_for_row(song, row_idx);
        let phrase_id = self.next_phrase_id;
        self.next_phrase_id += 1;
        let source = EventSource {
            pattern: pattern_idx,
            track: track_idx,
            row: row_idx,
            phrase_id,
        };

        let scan_ahead_limit = base + ticks_per_row * self.max_scan_ahead_rows as i64;

        for event in phrase.into_events() {
            let channel = if event.channel != 0 { event.channel } else { channel_default };
            let due = (base + event.offset_rows * ticks_per_row + event.offset_ticks + swing)
                .max(0)
                .min(scan_ahead_limit);

            match event.event_type {
                EventType::NoteOn => {
                    let gate = event.gate_total_ticks(ticks_per_row);
                    let scheduled_off_tick = if gate > 0 { Some((due + gate).min(scan_ahead_limit)) } else { None };
                    self.push_pending(
                        due,
                        channel,
                        PendingKind::NoteOn {
                            note: event.data1,
                            velocity: event.data2,
                            scheduled_off_tick,
                        },
                        source,
                    );
                    if let Some(off_tick) = scheduled_off_tick {
                        self.push_pending(off_tick, channel, PendingKind::NoteOff { note: event.data1, velocity: 0 }, source);
                    }
                }
                EventType::NoteOff => {
                    if event.data1 == Event::ALL_NOTES_SENTINEL {
                        let notes: Vec<u8> = self
                            .active_notes
                            .iter()
                            .filter(|a| a.track == track_idx)
                            .map(|a| a.note)
                            .collect();
                        for note in notes {
                            self.push_pending(due, channel, PendingKind::NoteOff { note, velocity: 0 }, source);
                        }
                    } else {
                        self.push_pending(due, channel, PendingKind::NoteOff { note: event.data1, velocity: event.data2 }, source);
                    }
                }
                EventType::Cc => {
                    self.push_pending(due, channel, PendingKind::Cc { controller: event.data1, value: event.data2 }, source);
                }
                EventType::ProgramChange => {
                    self.push_pending(due, channel, PendingKind::ProgramChange { program: event.data1 }, source);
                }
                EventType::PitchBend => {
                    let value = (((event.data2 as i16) << 7) | event.data1 as i16) - 8192;
                    self.push_pending(due, channel, PendingKind::PitchBend { value }, source);
                }
                EventType::Aftertouch => {
                    self.push_pending(due, channel, PendingKind::Aftertouch { pressure: event.data1 }, source);
                }
                EventType::PolyAftertouch => {
                    self.push_pending(
                        due,
                        channel,
                        PendingKind::PolyAftertouch { note: event.data1, pressure: event.data2 },
                        source,
                    );
                }
            }
        }
        // Immediately drain anything already due (e.g. offset 0 at the current tick).
        self.drain_pending_until(self.current_tick, sink);
    }

    fn push_pending(&mut self, due_tick: i64, channel: u8, kind: PendingKind, source: EventSource) {
        if self.pending.len() >= self.pending_capacity {
            self.stats.underruns += 1;
            log::warn!("pending queue full ({}); dropping newest event", self.pending_capacity);
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(PendingEntry { due_tick, seq, channel, kind, source });
        self.stats.events_scheduled += 1;
    }

    fn drain_pending_until(&mut self, limit: i64, sink: &mut dyn OutputSink) {
        while let Some(top) = self.pending.peek() {
            if top.due_tick > limit {
                break;
            }
            let entry = self.pending.pop().expect("peeked Some");
            self.dispatch(entry, sink);
        }
    }

    fn dispatch(&mut self, entry: PendingEntry, sink: &mut dyn OutputSink) {
        match entry.kind {
            PendingKind::NoteOn { note, velocity, scheduled_off_tick } => {
                sink.note_on(entry.channel, note, velocity);
                if self.active_notes.len() < self.active_note_capacity {
                    self.active_notes.push(ActiveNote {
                        channel: entry.channel,
                        note,
                        track: entry.source.track,
                        phrase_id: entry.source.phrase_id,
                        started_tick: entry.due_tick,
                        scheduled_off_tick,
                    });
                }
                self.stats.notes_on += 1;
            }
            PendingKind::NoteOff { note, velocity } => {
                sink.note_off(entry.channel, note, velocity);
                if let Some(pos) = self
                    .active_notes
                    .iter()
                    .position(|a| a.channel == entry.channel && a.note == note)
                {
                    self.active_notes.remove(pos);
                }
                self.stats.notes_off += 1;
            }
            PendingKind::Cc { controller, value } => sink.cc(entry.channel, controller, value),
            PendingKind::ProgramChange { program } => sink.program_change(entry.channel, program),
            PendingKind::PitchBend { value } => sink.pitch_bend(entry.channel, value),
            PendingKind::Aftertouch { pressure } => sink.aftertouch(entry.channel, pressure),
            PendingKind::PolyAftertouch { note, pressure } => sink.poly_aftertouch(entry.channel, note, pressure),
        }
        self.stats.events_fired += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Pattern, Song};
    use crate::registry::PluginRegistry;
    use crate::sink::RecordingSink;

    fn basic_song() -> Song {
        let mut song = Song::new("basic");
        song.bpm = 120;
        song.rows_per_beat = 4;
        song.ticks_per_row = 6;
        let mut pattern = Pattern::new("A", 4, 1);
        pattern.tracks[0].default_channel = 1;
        pattern.tracks[0].cells[0].set_expression("C4~1");
        song.add_pattern(pattern);
        song
    }

    // Events scheduled at tick 0 fire, then their matching note-off fires after the gate.
    #[test]
    fn schedule_and_dispatch_fires_note_on_then_off() {
        let song = basic_song();
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        let mut sink = RecordingSink::new();
        engine.play(&mut sink);

        engine.process(250.0, &song, &registry, &mut sink);

        assert_eq!(sink.note_on_count(), 1);
        assert_eq!(sink.note_off_count(), 1);
        assert_eq!(engine.stats().events_fired, 2);
        assert!(sink.calls.contains(&crate::sink::SinkCall::NoteOn(1, 60, 80)));
    }

    // Seeking with the all-notes-off flag silences whatever was sounding.
    #[test]
    fn seek_with_flag_emits_note_offs() {
        let song = basic_song();
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        engine.send_all_notes_off_on_seek = true;
        let mut sink = RecordingSink::new();
        engine.play(&mut sink);

        engine.process(10.0, &song, &registry, &mut sink);
        assert_eq!(sink.note_on_count(), 1);
        assert_eq!(engine.active_note_count(), 1);

        engine.seek(&song, 0, 0, &mut sink);
        assert!(sink.calls.contains(&crate::sink::SinkCall::AllNotesOff(Engine::ALL_CHANNELS)));
        assert_eq!(engine.active_note_count(), 0);
    }

    // Seeking twice to the same spot is equivalent to seeking once.
    #[test]
    fn seek_twice_is_idempotent() {
        let song = basic_song();
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        let mut sink = RecordingSink::new();
        engine.play(&mut sink);
        engine.process(10.0, &song, &registry, &mut sink);

        let mut sink_a = RecordingSink::new();
        engine.seek(&song, 0, 2, &mut sink_a);
        let tick_a = engine.current_tick();
        let pending_a = engine.pending_count();

        let mut sink_b = RecordingSink::new();
        engine.seek(&song, 0, 2, &mut sink_b);
        let tick_b = engine.current_tick();
        let pending_b = engine.pending_count();

        assert_eq!(tick_a, tick_b);
        assert_eq!(pending_a, pending_b);
        assert_eq!(engine.active_note_count(), 0);
    }

    #[test]
    fn queue_full_counts_underrun_instead_of_panicking() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut song = Song::new("overflow");
        song.bpm = 120;
        let mut pattern = Pattern::new("A", 1, 1);
        pattern.tracks[0].cells[0].set_expression(
            (0..(MAX_PENDING + 10))
                .map(|i| format!("C{}", i % 5))
                .collect::<Vec<_>>()
                .join(" "),
        );
        song.add_pattern(pattern);
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        let mut sink = RecordingSink::new();
        engine.play(&mut sink);

        engine.process(1000.0, &song, &registry, &mut sink);
        assert!(engine.stats().underruns > 0);
    }

    #[test]
    fn mute_and_solo_affect_scanning() {
        let mut song = Song::new("mutesolo");
        let mut pattern = Pattern::new("A", 1, 2);
        pattern.tracks[0].cells[0].set_expression("C4");
        pattern.tracks[1].cells[0].set_expression("D4");
        pattern.tracks[1].solo = true;
        song.add_pattern(pattern);
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        let mut sink = RecordingSink::new();
        engine.play(&mut sink);

        engine.process(10.0, &song, &registry, &mut sink);
        // only the solo'd track (track 1, D4=62) should have sounded.
        assert_eq!(sink.note_on_count(), 1);
        assert!(sink
            .calls
            .iter()
            .any(|c| matches!(c, crate::sink::SinkCall::NoteOn(_, 62, _))));
    }

    #[test]
    fn note_off_cell_silences_track() {
        let mut song = Song::new("noteoff");
        let mut pattern = Pattern::new("A", 2, 1);
        pattern.tracks[0].cells[0].set_expression("C4~100");
        pattern.tracks[0].cells[1] = Cell::note_off();
        song.add_pattern(pattern);
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        let mut sink = RecordingSink::new();
        engine.play(&mut sink);

        engine.process(10.0, &song, &registry, &mut sink);
        assert_eq!(engine.active_note_count(), 1);
        engine.step_row(&song, &registry, &mut sink);
        assert_eq!(engine.active_note_count(), 0);
    }

    #[test]
    fn unknown_language_records_last_error_and_continues() {
        let mut song = Song::new("baderr");
        let mut pattern = Pattern::new("A", 1, 1);
        pattern.tracks[0].cells[0].set_expression("C4");
        pattern.tracks[0].cells[0].language_id = Some("nope".to_string());
        song.add_pattern(pattern);
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        let mut sink = RecordingSink::new();
        engine.play(&mut sink);

        engine.process(10.0, &song, &registry, &mut sink);
        assert!(engine.last_error().is_some());
        assert_eq!(sink.note_on_count(), 0);
    }

    #[test]
    fn trigger_cell_schedules_without_advancing_position() {
        let song = basic_song();
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        let mut sink = RecordingSink::new();
        engine.trigger_cell(&song, &registry, 0, 0, 0, &mut sink);
        assert_eq!(sink.note_on_count(), 1);
        assert_eq!(engine.current_row(), 0);
    }

    #[test]
    fn scan_ahead_bound_clamps_far_future_due_ticks() {
        let mut song = basic_song();
        song.patterns[0].tracks[0].cells[0].set_expression("C4~1000");
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        engine.max_scan_ahead_rows = 2;
        let mut sink = RecordingSink::new();
        engine.play(&mut sink);

        engine.process(10.0, &song, &registry, &mut sink);
        let limit = engine.current_tick() + song.ticks_per_row as i64 * engine.max_scan_ahead_rows as i64;
        assert!(engine.pending.iter().all(|e| e.due_tick <= limit));
    }

    #[test]
    fn capacity_fields_are_configurable() {
        let mut engine = Engine::new(1);
        assert_eq!(engine.pending_capacity, MAX_PENDING);
        assert_eq!(engine.active_note_capacity, MAX_ACTIVE_NOTES);
        engine.pending_capacity = 1;
        engine.active_note_capacity = 1;
        assert_eq!(engine.pending_capacity, 1);
        assert_eq!(engine.active_note_capacity, 1);
    }

    #[test]
    fn max_phrase_recursion_propagates_to_context() {
        let song = basic_song();
        let engine = Engine::new(1);
        let ctx = engine.build_context(&song, &song.phrase_library, 0, 0, 0, 1, "", false, false);
        assert_eq!(ctx.max_phrase_recursion, crate::evaluator::MAX_PHRASE_RECURSION);

        let mut engine = Engine::new(1);
        engine.max_phrase_recursion = 3;
        let ctx = engine.build_context(&song, &song.phrase_library, 0, 0, 0, 1, "", false, false);
        assert_eq!(ctx.max_phrase_recursion, 3);
    }

    #[test]
    fn transport_callbacks_fire_on_state_changes() {
        let song = basic_song();
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        let mut sink = RecordingSink::new();

        engine.play(&mut sink);
        assert_eq!(sink.calls[0], crate::sink::SinkCall::Start);

        engine.process(125.0, &song, &registry, &mut sink);
        assert!(sink.calls.contains(&crate::sink::SinkCall::Clock));

        engine.pause();
        sink.calls.clear();
        engine.play(&mut sink);
        assert_eq!(sink.calls[0], crate::sink::SinkCall::Continue);

        engine.stop(&mut sink);
        assert!(sink.calls.contains(&crate::sink::SinkCall::Stop));
    }

    #[test]
    fn eval_immediate_schedules_ad_hoc_expression() {
        let song = basic_song();
        let registry = PluginRegistry::builtin();
        let mut engine = Engine::new(1);
        let mut sink = RecordingSink::new();
        engine.eval_immediate(&song, &registry, "E4", Some("notes"), 5, &mut sink).unwrap();
        assert_eq!(sink.note_on_count(), 1);
        assert!(matches!(sink.calls[0], crate::sink::SinkCall::NoteOn(5, 64, _)));
    }
}
