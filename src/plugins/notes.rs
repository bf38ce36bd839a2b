//! The reference front-end language: note literals, rests, note-off,
//! chords, velocity, gate, phrase references, and a library of built-in FX
//! transforms.
//!
//! The tokenizer is a small hand-rolled char scanner in the style of
//! `songwalker_core::lexer::Lexer`, tracking a byte position for
//! `SyntaxError` locations rather than a full token-stream + grammar.

use std::collections::{HashMap, HashSet};

use crate::error::CoreError;
use crate::evaluator::EvalContext;
use crate::event::{Event, EventType, Phrase};
use crate::registry::{Capabilities, Plugin, TransformFn, ValidateResult};

const DEFAULT_VELOCITY: i64 = 80;
const DEFAULT_GATE_ROWS: i64 = 1;

fn clamp127(v: i64) -> u8 {
    v.clamp(0, 127) as u8
}

/// Letter base semitone, C..B: 0,2,4,5,7,9,11.
fn letter_semitone(ch: char) -> Option<i32> {
    match ch.to_ascii_uppercase() {
        'C' => Some(0),
        'D' => Some(2),
        'E' => Some(4),
        'F' => Some(5),
        'G' => Some(7),
        'A' => Some(9),
        'B' => Some(11),
        _ => None,
    }
}

/// Parse a bare note name (`C4`, `D#5`, `Bbb3`, `F#` with default octave) to
/// a MIDI note number. Used both by the grammar and by `invert`'s pivot.
fn parse_note_name(token: &str) -> Option<i32> {
    let chars: Vec<char> = token.chars().collect();
    if chars.is_empty() {
        return None;
    }
    let mut idx = 0;
    let base = letter_semitone(chars[0])?;
    idx += 1;
    let mut semitone = base;
    while idx < chars.len() {
        match chars[idx] {
            '#' => semitone += 1,
            'b' => semitone -= 1,
            _ => break,
        }
        idx += 1;
    }
    let octave: i32 = if idx < chars.len() {
        let rest: String = chars[idx..].iter().collect();
        rest.parse().ok()?
    } else {
        4
    };
    Some(((octave + 1) * 12 + semitone).clamp(0, 127))
}

struct NoteToken {
    midi: i32,
    velocity: i64,
    gate_rows: i64,
}

/// Parse one chord-member token, e.g. `"D#5@100~2"`.
fn parse_note_token(token: &str, position: usize) -> Result<NoteToken, CoreError> {
    let chars: Vec<char> = token.chars().collect();
    if chars.is_empty() {
        return Err(CoreError::SyntaxError {
            message: "empty note token".to_string(),
            position: Some(position),
        });
    }
    let mut idx = 0;
    let base = letter_semitone(chars[0]).ok_or_else(|| CoreError::SyntaxError {
        message: format!("expected note letter A-G, found '{}'", chars[0]),
        position: Some(position),
    })?;
    idx += 1;
    let mut semitone = base;
    while idx < chars.len() {
        match chars[idx] {
            '#' => semitone += 1,
            'b' => semitone -= 1,
            _ => break,
        }
        idx += 1;
    }
    let mut octave: Option<i32> = None;
    let octave_start = idx;
    while idx < chars.len() && chars[idx].is_ascii_digit() && idx - octave_start < 2 {
        idx += 1;
    }
    if idx > octave_start {
        let text: String = chars[octave_start..idx].iter().collect();
        octave = text.parse().ok();
    }
    let octave = octave.unwrap_or(4);
    let midi = ((octave + 1) * 12 + semitone).clamp(0, 127);

    let mut velocity = DEFAULT_VELOCITY;
    let mut gate_rows = DEFAULT_GATE_ROWS;

    while idx < chars.len() {
        match chars[idx] {
            '@' | 'v' | 'V' => {
                idx += 1;
                let (value, next) = parse_signed_int(&chars, idx, position)?;
                velocity = value.clamp(0, 127);
                idx = next;
            }
            '~' => {
                idx += 1;
                let (value, next) = parse_signed_int(&chars, idx, position)?;
                gate_rows = value.max(0);
                idx = next;
            }
            _ => {
                return Err(CoreError::SyntaxError {
                    message: format!("unexpected character '{}' in note token", chars[idx]),
                    position: Some(position),
                });
            }
        }
    }

    Ok(NoteToken {
        midi,
        velocity,
        gate_rows,
    })
}

fn parse_signed_int(chars: &[char], mut idx: usize, position: usize) -> Result<(i64, usize), CoreError> {
    let start = idx;
    if idx < chars.len() && (chars[idx] == '-' || chars[idx] == '+') {
        idx += 1;
    }
    let digits_start = idx;
    while idx < chars.len() && chars[idx].is_ascii_digit() {
        idx += 1;
    }
    if idx == digits_start {
        return Err(CoreError::SyntaxError {
            message: "expected an integer".to_string(),
            position: Some(position),
        });
    }
    let text: String = chars[start..idx].iter().collect();
    let value: i64 = text.parse().map_err(|_| CoreError::SyntaxError {
        message: format!("invalid integer '{text}'"),
        position: Some(position),
    })?;
    Ok((value, idx))
}

fn split_chord_tokens(expr: &str) -> Vec<&str> {
    expr.split(|c: char| c.is_whitespace() || c == ',' || c == '|')
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse and evaluate a notes-language expression into a phrase.
fn eval_notes(expr: &str, ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let trimmed = expr.trim();

    if trimmed.is_empty() || trimmed == "r" || trimmed == "-" {
        return Ok(Phrase::new());
    }

    if trimmed == "x" || trimmed == "X" || trimmed.eq_ignore_ascii_case("off") {
        let mut phrase = Phrase::new();
        phrase.push(Event::note_off(ctx.channel, Event::ALL_NOTES_SENTINEL, 0));
        return Ok(phrase);
    }

    if let Some(rest) = trimmed.strip_prefix('@') {
        let ident_len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let (name, trailing) = rest.split_at(ident_len);
        let mut phrase = Phrase::new();

        if ctx.phrase_recursion_depth < ctx.max_phrase_recursion {
            if let Some((ref_expr, _ref_lang)) = ctx.lookup_phrase(name) {
                let ref_expr = ref_expr.to_string();
                let mut sub_ctx = ctx.for_phrase_reference();
                let referenced = eval_notes(&ref_expr, &mut sub_ctx)?;
                ctx.random_state = sub_ctx.random_state;
                phrase.extend(referenced);
            }
        }
        // depth >= max_phrase_recursion: loop-break, spliced part stays empty.

        let trailing = trailing.trim();
        if !trailing.is_empty() {
            phrase.extend(eval_notes(trailing, ctx)?);
        }
        return Ok(phrase);
    }

    let mut phrase = Phrase::new();
    for token in split_chord_tokens(trimmed) {
        let note = parse_note_token(token, 0)?;
        let event = Event::note_on(ctx.channel, note.midi, note.velocity as i32)
            .with_gate(note.gate_rows, 0);
        phrase.push(event);
    }
    Ok(phrase)
}

// ── Transform parameter parsing ─────────────────────────────────

fn parse_params_map(raw: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(s) = raw {
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some(eq) = part.find('=') {
                map.insert(part[..eq].trim().to_string(), part[eq + 1..].trim().to_string());
            } else {
                map.insert("_".to_string(), part.to_string());
            }
        }
    }
    map
}

fn get_i64(map: &HashMap<String, String>, key: &str, default: i64, transform: &str) -> Result<i64, CoreError> {
    let raw = map.get(key).or_else(|| map.get("_"));
    match raw {
        Some(v) => v.trim().parse::<i64>().map_err(|_| CoreError::BadTransformParams {
            name: transform.to_string(),
            message: format!("invalid integer for '{key}': '{v}'"),
        }),
        None => Ok(default),
    }
}

fn get_i64_named(map: &HashMap<String, String>, key: &str, default: i64, transform: &str) -> Result<i64, CoreError> {
    match map.get(key) {
        Some(v) => v.trim().parse::<i64>().map_err(|_| CoreError::BadTransformParams {
            name: transform.to_string(),
            message: format!("invalid integer for '{key}': '{v}'"),
        }),
        None => Ok(default),
    }
}

// ── Built-in transforms ──────────────────────────────────────────

fn transform_transpose(input: &Phrase, params: Option<&str>, _ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let map = parse_params_map(params);
    let semitones = get_i64(&map, "semitones", 0, "transpose")?;
    Ok(input
        .iter()
        .cloned()
        .map(|mut e| {
            if matches!(e.event_type, EventType::NoteOn | EventType::NoteOff) {
                e.data1 = clamp127(e.data1 as i64 + semitones);
            }
            e
        })
        .collect())
}

fn transform_velocity(input: &Phrase, params: Option<&str>, _ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let map = parse_params_map(params);
    let v = get_i64(&map, "v", 0, "velocity")?.clamp(0, 127);
    Ok(input
        .iter()
        .cloned()
        .map(|mut e| {
            if e.event_type == EventType::NoteOn {
                e.data2 = v as u8;
            }
            e
        })
        .collect())
}

fn transform_octave(input: &Phrase, params: Option<&str>, ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let map = parse_params_map(params);
    let octaves = get_i64(&map, "octaves", 0, "octave")?;
    let semitones_str = (octaves * 12).to_string();
    transform_transpose(input, Some(&semitones_str), ctx)
}

fn transform_invert(input: &Phrase, params: Option<&str>, _ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let map = parse_params_map(params);
    let raw_pivot = map.get("pivot").or_else(|| map.get("_"));
    let pivot: i64 = match raw_pivot {
        None => 60,
        Some(v) => {
            if let Ok(n) = v.trim().parse::<i64>() {
                n
            } else if let Some(midi) = parse_note_name(v.trim()) {
                midi as i64
            } else {
                return Err(CoreError::BadTransformParams {
                    name: "invert".to_string(),
                    message: format!("invalid pivot '{v}'"),
                });
            }
        }
    };
    Ok(input
        .iter()
        .cloned()
        .map(|mut e| {
            if matches!(e.event_type, EventType::NoteOn | EventType::NoteOff) {
                e.data1 = clamp127(2 * pivot - e.data1 as i64);
            }
            e
        })
        .collect())
}

fn transform_arpeggio(input: &Phrase, params: Option<&str>, _ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let map = parse_params_map(params);
    let speed = get_i64(&map, "speed", 4, "arpeggio")?.clamp(1, 48);
    let note_on_count = input.iter().filter(|e| e.event_type == EventType::NoteOn).count();
    if note_on_count <= 1 {
        return Ok(input.clone());
    }
    let mut i = 0i64;
    Ok(input
        .iter()
        .cloned()
        .map(|mut e| {
            if e.event_type == EventType::NoteOn {
                e.offset_ticks = i * speed;
                i += 1;
            }
            e
        })
        .collect())
}

fn transform_delay(input: &Phrase, params: Option<&str>, _ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let map = parse_params_map(params);
    let time = get_i64_named(&map, "time", 6, "delay")?.max(1);
    let feedback = get_i64_named(&map, "feedback", 1, "delay")?.clamp(0, 8);
    let decay = get_i64_named(&map, "decay", 50, "delay")?.clamp(0, 100) as f64 / 100.0;

    let mut out = Phrase::new();
    for e in input.iter() {
        out.push(e.clone());
        if matches!(e.event_type, EventType::NoteOn | EventType::NoteOff) {
            for echo in 1..=feedback {
                let mut copy = e.clone();
                copy.offset_ticks += echo * time;
                let scaled = (e.data2 as f64) * decay.powi(echo as i32);
                copy.data2 = (scaled.max(1.0) as i64).clamp(0, 127) as u8;
                out.push(copy);
            }
        }
    }
    Ok(out)
}

fn transform_ratchet(input: &Phrase, params: Option<&str>, _ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let map = parse_params_map(params);
    let count = get_i64_named(&map, "count", 2, "ratchet")?.clamp(1, 16);
    let speed = get_i64_named(&map, "speed", 3, "ratchet")?.clamp(1, 24);
    let hold = (speed - 1).max(1);

    let mut out = Phrase::new();
    for e in input.iter() {
        if e.event_type != EventType::NoteOn {
            out.push(e.clone());
            continue;
        }
        for i in 0..count {
            let mut on = e.clone();
            on.offset_ticks = e.offset_ticks + i * speed;
            on.gate_rows = 0;
            on.gate_ticks = 0;
            out.push(on.clone());
            let mut off = Event::note_off(e.channel, e.data1, 0);
            off.offset_rows = e.offset_rows;
            off.offset_ticks = on.offset_ticks + hold;
            out.push(off);
        }
    }
    Ok(out)
}

fn transform_humanize(input: &Phrase, params: Option<&str>, ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let map = parse_params_map(params);
    let timing = get_i64_named(&map, "timing", 0, "humanize")?.clamp(0, 12);
    let velocity = get_i64_named(&map, "velocity", 0, "humanize")?.clamp(0, 64);

    Ok(input
        .iter()
        .map(|e| {
            let mut e = e.clone();
            if timing > 0 {
                let span = (2 * timing + 1) as u32;
                let delta = ctx.random(span) as i64 - timing;
                e.offset_ticks += delta;
            }
            if velocity > 0 && e.event_type == EventType::NoteOn {
                let span = (2 * velocity + 1) as u32;
                let delta = ctx.random(span) as i64 - velocity;
                e.data2 = (e.data2 as i64 + delta).clamp(1, 127) as u8;
            }
            e
        })
        .collect())
}

fn transform_chance(input: &Phrase, params: Option<&str>, ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let map = parse_params_map(params);
    let percent = get_i64(&map, "percent", 100, "chance")?.clamp(0, 100);

    let mut dropped: HashSet<(u8, u8)> = HashSet::new();
    let mut out = Phrase::new();
    for e in input.iter() {
        match e.event_type {
            EventType::NoteOn => {
                let keep = (ctx.random(100) as i64) < percent;
                if keep {
                    out.push(e.clone());
                } else {
                    dropped.insert((e.channel, e.data1));
                }
            }
            EventType::NoteOff => {
                if dropped.remove(&(e.channel, e.data1)) {
                    // matching NoteOn was removed; drop this NoteOff too.
                } else {
                    out.push(e.clone());
                }
            }
            _ => out.push(e.clone()),
        }
    }
    Ok(out)
}

fn transform_reverse(input: &Phrase, _params: Option<&str>, ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let ticks_per_row = ctx.ticks_per_row as i64;
    let (min, max) = match input.tick_span(ticks_per_row) {
        Some(span) => span,
        None => return Ok(input.clone()),
    };
    Ok(input
        .iter()
        .cloned()
        .map(|mut e| {
            let abs = e.offset_rows * ticks_per_row + e.offset_ticks;
            let reversed = (max + min) - abs;
            e.offset_rows = reversed.div_euclid(ticks_per_row);
            e.offset_ticks = reversed.rem_euclid(ticks_per_row);
            e
        })
        .collect())
}

fn transform_stutter(input: &Phrase, params: Option<&str>, ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
    let map = parse_params_map(params);
    let count = get_i64(&map, "count", 2, "stutter")?.clamp(1, 8);
    let decay = get_i64_named(&map, "decay", 100, "stutter")?.clamp(0, 100) as f64 / 100.0;

    let ticks_per_row = ctx.ticks_per_row as i64;
    let span = input
        .tick_span(ticks_per_row)
        .map(|(min, max)| (max - min).max(ticks_per_row))
        .unwrap_or(ticks_per_row);

    let mut out = Phrase::new();
    for rep in 0..count {
        let shift = rep * span;
        let scale = decay.powi(rep as i32);
        for e in input.iter() {
            let mut copy = e.clone();
            copy.offset_ticks += shift;
            if copy.event_type == EventType::NoteOn {
                copy.data2 = ((copy.data2 as f64) * scale).max(1.0).clamp(0.0, 127.0) as u8;
            }
            out.push(copy);
        }
    }
    Ok(out)
}

fn transform_table(name: &str) -> Option<TransformFn> {
    match name {
        "transpose" | "tr" => Some(transform_transpose),
        "velocity" | "vel" => Some(transform_velocity),
        "octave" | "oct" => Some(transform_octave),
        "invert" | "inv" => Some(transform_invert),
        "arpeggio" | "arp" => Some(transform_arpeggio),
        "delay" => Some(transform_delay),
        "ratchet" | "rat" => Some(transform_ratchet),
        "humanize" | "hum" => Some(transform_humanize),
        "chance" | "prob" => Some(transform_chance),
        "reverse" | "rev" => Some(transform_reverse),
        "stutter" | "stut" => Some(transform_stutter),
        _ => None,
    }
}

const TRANSFORM_NAMES: &[&str] = &[
    "transpose", "velocity", "octave", "invert", "arpeggio", "delay", "ratchet", "humanize",
    "chance", "reverse", "stutter",
];

/// The reference front-end language plugin.
#[derive(Debug, Default)]
pub struct NotesPlugin;

impl NotesPlugin {
    pub fn new() -> Self {
        NotesPlugin
    }
}

impl Plugin for NotesPlugin {
    fn name(&self) -> &str {
        "Notes"
    }

    fn language_id(&self) -> &str {
        "notes"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Reference note-literal language: chords, rests, note-off, phrase references"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::EVALUATE | Capabilities::VALIDATION | Capabilities::TRANSFORMS
    }

    fn priority(&self) -> i32 {
        0
    }

    fn validate(&self, expr: &str) -> ValidateResult {
        let empty_lib = HashMap::new();
        let mut ctx = EvalContext::new(&empty_lib, 1);
        match eval_notes(expr, &mut ctx) {
            Ok(_) => ValidateResult::ok(),
            Err(CoreError::SyntaxError { message, position }) => ValidateResult::error(message, position),
            Err(other) => ValidateResult::error(other.to_string(), None),
        }
    }

    fn evaluate(&self, expr: &str, ctx: &mut EvalContext) -> Result<Phrase, CoreError> {
        eval_notes(expr, ctx)
    }

    fn get_transform(&self, name: &str) -> Option<TransformFn> {
        transform_table(name)
    }

    fn list_transforms(&self) -> Vec<String> {
        TRANSFORM_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn describe_transform(&self, name: &str) -> Option<String> {
        let text = match name {
            "transpose" | "tr" => "Shift pitch by `semitones`.",
            "velocity" | "vel" => "Set velocity to `v`.",
            "octave" | "oct" => "Shift pitch by `octaves` * 12 semitones.",
            "invert" | "inv" => "Mirror pitch around `pivot` (default 60).",
            "arpeggio" | "arp" => "Spread a chord's NoteOns across ticks at `speed`.",
            "delay" => "Echo every note `feedback` times at `time` ticks, decaying by `decay`%.",
            "ratchet" | "rat" => "Replace each NoteOn with `count` short retriggers at `speed` ticks.",
            "humanize" | "hum" => "Deterministic timing/velocity jitter up to `timing`/`velocity`.",
            "chance" | "prob" => "Keep each NoteOn with probability `percent`.",
            "reverse" | "rev" => "Mirror event timing within the phrase's span.",
            "stutter" | "stut" => "Repeat the whole phrase `count` times, decaying by `decay`% each repeat.",
            _ => return None,
        };
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn ctx<'a>(lib: &'a Map<String, crate::model::PhraseLibEntry>) -> EvalContext<'a> {
        let mut c = EvalContext::new(lib, 1);
        c.channel = 3;
        c
    }

    // Parse middle C.
    #[test]
    fn parses_middle_c() {
        let lib = Map::new();
        let mut c = ctx(&lib);
        let phrase = eval_notes("C4", &mut c).unwrap();
        assert_eq!(phrase.len(), 1);
        let e = &phrase.events()[0];
        assert_eq!(e.channel, 3);
        assert_eq!(e.data1, 60);
        assert_eq!(e.data2, 80);
        assert_eq!(e.gate_rows, 1);
    }

    // Chord with velocity and gate.
    #[test]
    fn parses_velocity_and_gate() {
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        let phrase = eval_notes("D#5@100~2", &mut c).unwrap();
        assert_eq!(phrase.len(), 1);
        let e = &phrase.events()[0];
        assert_eq!(e.data1, 75);
        assert_eq!(e.data2, 100);
        assert_eq!(e.gate_rows, 2);
    }

    // Space-separated chord.
    #[test]
    fn parses_space_separated_chord() {
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        let phrase = eval_notes("C4 E4 G4", &mut c).unwrap();
        let notes: Vec<u8> = phrase.iter().map(|e| e.data1).collect();
        assert_eq!(notes, vec![60, 64, 67]);
        assert!(phrase.iter().all(|e| e.offset_ticks == 0));
    }

    #[test]
    fn rest_produces_empty_phrase() {
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        assert!(eval_notes("r", &mut c).unwrap().is_empty());
        assert!(eval_notes("-", &mut c).unwrap().is_empty());
    }

    #[test]
    fn note_off_token_produces_sentinel() {
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        let phrase = eval_notes("off", &mut c).unwrap();
        assert_eq!(phrase.len(), 1);
        assert_eq!(phrase.events()[0].event_type, EventType::NoteOff);
        assert_eq!(phrase.events()[0].data1, Event::ALL_NOTES_SENTINEL);
    }

    #[test]
    fn phrase_reference_splices_and_appends_trailing() {
        let mut lib = Map::new();
        lib.insert(
            "hook".to_string(),
            crate::model::PhraseLibEntry {
                expression: "C4".to_string(),
                language_id: None,
            },
        );
        let mut c = EvalContext::new(&lib, 1);
        let phrase = eval_notes("@hook E4", &mut c).unwrap();
        let notes: Vec<u8> = phrase.iter().map(|e| e.data1).collect();
        assert_eq!(notes, vec![60, 64]);
    }

    // A self-referencing phrase bottoms out at empty, with no stack growth past 16 levels.
    #[test]
    fn self_referencing_phrase_is_bounded() {
        let mut lib = Map::new();
        lib.insert(
            "a".to_string(),
            crate::model::PhraseLibEntry {
                expression: "@a".to_string(),
                language_id: None,
            },
        );
        let mut c = EvalContext::new(&lib, 1);
        let phrase = eval_notes("@a", &mut c).unwrap();
        assert!(phrase.is_empty());
    }

    // Transpose up a fifth.
    #[test]
    fn transpose_up_a_fifth() {
        let mut p = Phrase::new();
        p.push(Event::note_on(0, 60, 80));
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        let out = transform_transpose(&p, Some("semitones=7"), &mut c).unwrap();
        assert_eq!(out.events()[0].data1, 67);
    }

    // Clamp at the MIDI ceiling.
    #[test]
    fn transpose_clamps_at_midi_ceiling() {
        let mut p = Phrase::new();
        p.push(Event::note_on(0, 120, 80));
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        let out = transform_transpose(&p, Some("20"), &mut c).unwrap();
        assert_eq!(out.events()[0].data1, 127);
    }

    // Arpeggiate a chord.
    #[test]
    fn arpeggio_spreads_chord_notes() {
        let mut p = Phrase::new();
        p.push(Event::note_on(0, 60, 80));
        p.push(Event::note_on(0, 64, 80));
        p.push(Event::note_on(0, 67, 80));
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        let out = transform_arpeggio(&p, Some("speed=4"), &mut c).unwrap();
        let offsets: Vec<i64> = out.iter().map(|e| e.offset_ticks).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
    }

    // Each transform's identity/no-op parameters.
    #[test]
    fn transform_identity_params_are_no_ops() {
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        let mut p = Phrase::new();
        p.push(Event::note_on(0, 60, 80).with_offset(0, 3));

        let out = transform_transpose(&p, Some("0"), &mut c).unwrap();
        assert_eq!(out, p);

        let out = transform_velocity(&p, Some("80"), &mut c).unwrap();
        assert_eq!(out, p);

        let out = transform_octave(&p, Some("0"), &mut c).unwrap();
        assert_eq!(out, p);

        let once = transform_reverse(&p, None, &mut c).unwrap();
        let twice = transform_reverse(&once, None, &mut c).unwrap();
        assert_eq!(twice, p);
    }

    #[test]
    fn invert_mirrors_around_pivot() {
        let mut p = Phrase::new();
        p.push(Event::note_on(0, 67, 80));
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        let out = transform_invert(&p, Some("pivot=60"), &mut c).unwrap();
        assert_eq!(out.events()[0].data1, 53);
    }

    #[test]
    fn chance_removes_matching_note_off() {
        let mut p = Phrase::new();
        p.push(Event::note_on(0, 10, 80));
        p.push(Event::note_off(0, 10, 0));
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        let out = transform_chance(&p, Some("percent=0"), &mut c).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn humanize_is_deterministic() {
        let mut p = Phrase::new();
        p.push(Event::note_on(0, 60, 80));
        p.push(Event::note_on(0, 64, 80));
        let lib = Map::new();
        let mut c1 = EvalContext::new(&lib, 1);
        let mut c2 = EvalContext::new(&lib, 1);
        let a = transform_humanize(&p, Some("timing=5,velocity=10"), &mut c1).unwrap();
        let b = transform_humanize(&p, Some("timing=5,velocity=10"), &mut c2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn humanize_differs_with_different_seed() {
        let mut p = Phrase::new();
        p.push(Event::note_on(0, 60, 80));
        p.push(Event::note_on(0, 64, 80));
        p.push(Event::note_on(0, 67, 80));
        let lib = Map::new();
        let mut c1 = EvalContext::new(&lib, 1);
        let mut c2 = EvalContext::new(&lib, 2);
        let a = transform_humanize(&p, Some("timing=5,velocity=10"), &mut c1).unwrap();
        let b = transform_humanize(&p, Some("timing=5,velocity=10"), &mut c2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn ratchet_expands_note_on_into_pairs() {
        let mut p = Phrase::new();
        p.push(Event::note_on(0, 60, 80));
        let lib = Map::new();
        let mut c = EvalContext::new(&lib, 1);
        let out = transform_ratchet(&p, Some("count=3,speed=2"), &mut c).unwrap();
        let on_count = out.iter().filter(|e| e.event_type == EventType::NoteOn).count();
        let off_count = out.iter().filter(|e| e.event_type == EventType::NoteOff).count();
        assert_eq!(on_count, 3);
        assert_eq!(off_count, 3);
    }

    #[test]
    fn unknown_transform_name_not_found() {
        assert!(transform_table("nope").is_none());
    }

    #[test]
    fn transform_aliases_resolve_to_same_function() {
        assert!(transform_table("tr").is_some());
        assert!(transform_table("vel").is_some());
        assert!(transform_table("rev").is_some());
    }
}
