//! Output sink — the host-implemented trait the engine dispatches MIDI-shaped
//! events to.
//!
//! Grounded on `songwalker_core::dsp::mixer::Mixer`'s role as the single
//! downstream consumer of scheduled events; here the consumer is a host
//! trait object instead of an internal mixer, since rendering audio is out
//! of scope.

/// A destination for scheduled events.
///
/// All methods default to a no-op so a host can implement only what it
/// cares about (e.g. a test harness that only records `note_on`/`note_off`).
pub trait OutputSink {
    fn note_on(&mut self, channel: u8, note: u8, velocity: u8) {
        let _ = (channel, note, velocity);
    }

    fn note_off(&mut self, channel: u8, note: u8, velocity: u8) {
        let _ = (channel, note, velocity);
    }

    fn cc(&mut self, channel: u8, controller: u8, value: u8) {
        let _ = (channel, controller, value);
    }

    fn program_change(&mut self, channel: u8, program: u8) {
        let _ = (channel, program);
    }

    fn pitch_bend(&mut self, channel: u8, value: i16) {
        let _ = (channel, value);
    }

    fn aftertouch(&mut self, channel: u8, pressure: u8) {
        let _ = (channel, pressure);
    }

    fn poly_aftertouch(&mut self, channel: u8, note: u8, pressure: u8) {
        let _ = (channel, note, pressure);
    }

    fn all_notes_off(&mut self, channel: u8) {
        let _ = channel;
    }

    fn clock(&mut self) {}
    fn start(&mut self) {}
    fn stop(&mut self) {}
    fn continue_playback(&mut self) {}
}

/// A sink that records every call, in order — used by tests and as a
/// reference implementation for hosts wiring up their own transport.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecordingSink {
    pub calls: Vec<SinkCall>,
}

/// One recorded dispatch, for assertions in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCall {
    NoteOn(u8, u8, u8),
    NoteOff(u8, u8, u8),
    Cc(u8, u8, u8),
    ProgramChange(u8, u8),
    PitchBend(u8, i16),
    Aftertouch(u8, u8),
    PolyAftertouch(u8, u8, u8),
    AllNotesOff(u8),
    Clock,
    Start,
    Stop,
    Continue,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink::default()
    }

    pub fn note_on_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, SinkCall::NoteOn(..)))
            .count()
    }

    pub fn note_off_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, SinkCall::NoteOff(..)))
            .count()
    }
}

impl OutputSink for RecordingSink {
    fn note_on(&mut self, channel: u8, note: u8, velocity: u8) {
        self.calls.push(SinkCall::NoteOn(channel, note, velocity));
    }

    fn note_off(&mut self, channel: u8, note: u8, velocity: u8) {
        self.calls.push(SinkCall::NoteOff(channel, note, velocity));
    }

    fn cc(&mut self, channel: u8, controller: u8, value: u8) {
        self.calls.push(SinkCall::Cc(channel, controller, value));
    }

    fn program_change(&mut self, channel: u8, program: u8) {
        self.calls.push(SinkCall::ProgramChange(channel, program));
    }

    fn pitch_bend(&mut self, channel: u8, value: i16) {
        self.calls.push(SinkCall::PitchBend(channel, value));
    }

    fn aftertouch(&mut self, channel: u8, pressure: u8) {
        self.calls.push(SinkCall::Aftertouch(channel, pressure));
    }

    fn poly_aftertouch(&mut self, channel: u8, note: u8, pressure: u8) {
        self.calls.push(SinkCall::PolyAftertouch(channel, note, pressure));
    }

    fn all_notes_off(&mut self, channel: u8) {
        self.calls.push(SinkCall::AllNotesOff(channel));
    }

    fn clock(&mut self) {
        self.calls.push(SinkCall::Clock);
    }

    fn start(&mut self) {
        self.calls.push(SinkCall::Start);
    }

    fn stop(&mut self) {
        self.calls.push(SinkCall::Stop);
    }

    fn continue_playback(&mut self) {
        self.calls.push(SinkCall::Continue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_counts_note_events() {
        let mut sink = RecordingSink::new();
        sink.note_on(0, 60, 80);
        sink.note_on(0, 64, 80);
        sink.note_off(0, 60, 0);
        assert_eq!(sink.note_on_count(), 2);
        assert_eq!(sink.note_off_count(), 1);
    }

    #[test]
    fn default_sink_methods_are_no_ops() {
        struct Mute;
        impl OutputSink for Mute {}
        let mut sink = Mute;
        sink.note_on(0, 60, 80);
        sink.clock();
    }
}
