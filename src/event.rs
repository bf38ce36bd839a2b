//! Event & Phrase — typed MIDI-shaped event records and owned sequences of them.
//!
//! Grounded on `songwalker_core::compiler::{Event, EventKind}` for the
//! "typed record" shape; `EventFlags` uses a `bitflags!` set in the style of
//! `fpsdk`'s plugin flag bitsets rather than a `Vec<Flag>`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// The kind of MIDI-shaped event an `Event` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NoteOn,
    NoteOff,
    Cc,
    ProgramChange,
    PitchBend,
    Aftertouch,
    PolyAftertouch,
}

bitflags! {
    /// Bitset of optional behaviors an event carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EventFlags: u16 {
        const PROBABILITY    = 1 << 0;
        const HUMANIZE_TIME  = 1 << 1;
        const HUMANIZE_VEL   = 1 << 2;
        const ACCENT         = 1 << 3;
        const LEGATO         = 1 << 4;
        const SLIDE          = 1 << 5;
        const RETRIGGER      = 1 << 6;
        const MUTE           = 1 << 7;
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        EventFlags::empty()
    }
}

/// Extended per-event parameters, allocated only when `flags` require them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedParams {
    /// Probability percent [0, 100] that this event survives the `chance` gate.
    pub probability: Option<u8>,
    /// Timing humanize amount in ticks.
    pub humanize_time: Option<u8>,
    /// Velocity humanize amount.
    pub humanize_vel: Option<u8>,
    /// Accent velocity boost.
    pub accent_boost: Option<u8>,
    /// Retrigger repeat count.
    pub retrigger_count: Option<u8>,
    /// Retrigger rate in ticks.
    pub retrigger_rate: Option<u8>,
    /// Slide time in ticks.
    pub slide_time: Option<u32>,
}

/// A single MIDI-shaped event, relative to its phrase's anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub channel: u8,
    pub data1: u8,
    pub data2: u8,
    pub offset_rows: i64,
    pub offset_ticks: i64,
    /// Gate duration (NoteOn only): rows component.
    pub gate_rows: i64,
    /// Gate duration (NoteOn only): ticks component.
    pub gate_ticks: i64,
    pub flags: EventFlags,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ext: Option<Box<ExtendedParams>>,
}

fn clamp127(v: i32) -> u8 {
    v.clamp(0, 127) as u8
}

impl Event {
    /// Build a NoteOn at offset (0,0) with no gate. Use `with_gate` to set one.
    pub fn note_on(channel: u8, note: i32, velocity: i32) -> Self {
        Event {
            event_type: EventType::NoteOn,
            channel: channel & 0x0F,
            data1: clamp127(note),
            data2: clamp127(velocity),
            offset_rows: 0,
            offset_ticks: 0,
            gate_rows: 0,
            gate_ticks: 0,
            flags: EventFlags::empty(),
            ext: None,
        }
    }

    /// Build a NoteOff for the given note. `data1=255` (masked away by the
    /// caller before this constructor is used for real notes) is reserved as
    /// the notes-plugin's internal "all notes" convention — see
    /// `plugins::notes` and `Engine::lower_note_off_sentinel`.
    pub fn note_off(channel: u8, note: u8, release_velocity: i32) -> Self {
        Event {
            event_type: EventType::NoteOff,
            channel: channel & 0x0F,
            data1: note,
            data2: clamp127(release_velocity),
            offset_rows: 0,
            offset_ticks: 0,
            gate_rows: 0,
            gate_ticks: 0,
            flags: EventFlags::empty(),
            ext: None,
        }
    }

    /// The "all notes off" sentinel used internally by the notes plugin.
    pub const ALL_NOTES_SENTINEL: u8 = 255;

    pub fn with_offset(mut self, offset_rows: i64, offset_ticks: i64) -> Self {
        self.offset_rows = offset_rows;
        self.offset_ticks = offset_ticks;
        self
    }

    pub fn with_gate(mut self, gate_rows: i64, gate_ticks: i64) -> Self {
        self.gate_rows = gate_rows;
        self.gate_ticks = gate_ticks;
        self
    }

    /// Total gate length in ticks, given the song's `ticks_per_row`.
    pub fn gate_total_ticks(&self, ticks_per_row: i64) -> i64 {
        self.gate_rows * ticks_per_row + self.gate_ticks
    }

    pub fn ext_mut(&mut self) -> &mut ExtendedParams {
        if self.ext.is_none() {
            self.ext = Some(Box::default());
        }
        self.ext.as_mut().unwrap()
    }
}

/// An exclusively owned, ordered sequence of events — the unit returned by
/// an evaluation. Dropping a `Phrase` drops its events and their
/// `ExtendedParams`, which in Rust is simply ordinary ownership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phrase {
    events: Vec<Event>,
}

impl Phrase {
    pub fn new() -> Self {
        Phrase { events: Vec::new() }
    }

    pub fn from_events(events: Vec<Event>) -> Self {
        Phrase { events }
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn extend(&mut self, other: Phrase) {
        self.events.extend(other.events);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Event> {
        self.events.iter_mut()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Span, in ticks, from the earliest to the latest `offset_ticks` value
    /// expressed in absolute ticks (`offset_rows * ticks_per_row +
    /// offset_ticks`). Used by `reverse`/`stutter`. Returns `None` if empty.
    pub fn tick_span(&self, ticks_per_row: i64) -> Option<(i64, i64)> {
        if self.events.is_empty() {
            return None;
        }
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        for e in &self.events {
            let t = e.offset_rows * ticks_per_row + e.offset_ticks;
            min = min.min(t);
            max = max.max(t);
        }
        Some((min, max))
    }
}

impl IntoIterator for Phrase {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;
    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

impl FromIterator<Event> for Phrase {
    fn from_iter<T: IntoIterator<Item = Event>>(iter: T) -> Self {
        Phrase {
            events: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_clamps_velocity_and_note() {
        let e = Event::note_on(1, 200, -5);
        assert_eq!(e.data1, 127);
        assert_eq!(e.data2, 0);
        assert_eq!(e.channel, 1);
    }

    #[test]
    fn channel_is_masked_to_four_bits() {
        let e = Event::note_on(0x1F, 60, 80);
        assert_eq!(e.channel, 0x0F);
    }

    #[test]
    fn ext_mut_allocates_lazily() {
        let mut e = Event::note_on(0, 60, 80);
        assert!(e.ext.is_none());
        e.ext_mut().accent_boost = Some(20);
        assert!(e.ext.is_some());
    }

    #[test]
    fn phrase_clone_is_structurally_equal() {
        let mut p = Phrase::new();
        p.push(Event::note_on(0, 60, 80));
        let clone = p.clone();
        assert_eq!(p, clone);
    }

    #[test]
    fn gate_total_ticks() {
        let e = Event::note_on(0, 60, 80).with_gate(1, 2);
        assert_eq!(e.gate_total_ticks(6), 8);
    }
}
