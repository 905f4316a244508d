//! Note-event file -> fixed-size piano-roll grid.
//!
//! Note times are resolved through the file's tempo map and sampled at `PIANO_ROLL_FPS`.
//! Each sounding note adds its velocity to its pitch column for every frame it covers, so
//! overlapping notes on the same pitch stack. Percussion (channel 10) contributes to the
//! length of the roll but never to its values.
//!
//! A note released while its channel's sustain pedal is down keeps sounding until the pedal
//! comes up, or until the same key is struck again. Only the window that is kept is ever
//! rendered, so a file claiming hours of silence costs no more than a short one.

use std::{collections::HashMap, path::Path};

use anyhow::{anyhow, ensure, Context, Result};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use rand::Rng;
use tracing::warn;

use crate::{
    config::{DatasetConfig, FALLBACK_FRAMES, MAX_ROLL_FRAMES, PEDAL_THRESHOLD, PIANO_ROLL_FPS, PIANO_ROLL_PITCHES, SUSTAIN_PEDAL_CC},
    grid::{random_window_start, FeatureGrid},
};

const DRUM_CHANNEL: u8 = 9;
const DEFAULT_TEMPO: u32 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Note {
    start: f64,
    /// Note-off time, moved later by the sustain pedal.
    held_until: f64,
    key: u8,
    velocity: u8,
    drum: bool,
}

/// A note in ticks, before pedal and tempo are applied.
#[derive(Debug, Clone, Copy)]
struct TickNote {
    start: u64,
    end: u64,
    held_until: u64,
    channel: u8,
    key: u8,
    velocity: u8,
}

/// Converts absolute ticks to seconds.
enum Clock {
    Metrical { ticks_per_beat: f64, segments: Vec<TempoSegment> },
    Timecode { seconds_per_tick: f64 },
}

struct TempoSegment {
    tick: u64,
    seconds: f64,
    micros_per_beat: u32,
}

impl Clock {
    fn new(smf: &Smf) -> Result<Self> {
        match smf.header.timing {
            Timing::Timecode(fps, subframes) => {
                let ticks_per_second = fps.as_f32() as f64 * subframes as f64;
                if ticks_per_second <= 0.0 {
                    return Err(anyhow!("timecode division has zero ticks per second"));
                }
                Ok(Clock::Timecode { seconds_per_tick: 1.0 / ticks_per_second })
            }
            Timing::Metrical(ppq) => {
                let ticks_per_beat = ppq.as_int() as f64;
                if ticks_per_beat == 0.0 {
                    return Err(anyhow!("metrical division of zero ticks per beat"));
                }
                // Tempo changes may sit in any track; they apply to all of them.
                let mut changes = Vec::new();
                for track in &smf.tracks {
                    let mut tick = 0u64;
                    for event in track {
                        tick += event.delta.as_int() as u64;
                        if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                            changes.push((tick, tempo.as_int()));
                        }
                    }
                }
                changes.sort_by_key(|&(tick, _)| tick);

                let mut segments = vec![TempoSegment { tick: 0, seconds: 0.0, micros_per_beat: DEFAULT_TEMPO }];
                for (tick, micros_per_beat) in changes {
                    let seconds = Self::metrical_seconds(&segments, ticks_per_beat, tick);
                    segments.push(TempoSegment { tick, seconds, micros_per_beat });
                }
                Ok(Clock::Metrical { ticks_per_beat, segments })
            }
        }
    }

    fn metrical_seconds(segments: &[TempoSegment], ticks_per_beat: f64, tick: u64) -> f64 {
        let segment = segments.iter().rev().find(|s| s.tick <= tick).unwrap_or(&segments[0]);
        segment.seconds
            + (tick - segment.tick) as f64 * segment.micros_per_beat as f64 / 1e6 / ticks_per_beat
    }

    fn seconds(&self, tick: u64) -> f64 {
        match self {
            Clock::Timecode { seconds_per_tick } => tick as f64 * seconds_per_tick,
            Clock::Metrical { ticks_per_beat, segments } => {
                Self::metrical_seconds(segments, *ticks_per_beat, tick)
            }
        }
    }
}

/// Per-channel sustain pedal state over one track.
#[derive(Default)]
struct Pedal {
    down_since: HashMap<u8, u64>,
    // Closed (down, up) tick intervals. A pedal never released holds nothing.
    held: HashMap<u8, Vec<(u64, u64)>>,
}

impl Pedal {
    fn update(&mut self, channel: u8, tick: u64, down: bool) {
        match (self.down_since.get(&channel).copied(), down) {
            (None, true) => {
                self.down_since.insert(channel, tick);
            }
            (Some(since), false) => {
                self.down_since.remove(&channel);
                self.held.entry(channel).or_default().push((since, tick));
            }
            _ => {}
        }
    }

    /// Extends every note released inside a pedal interval up to the pedal release, cut short
    /// by the next onset of the same key on the same channel.
    fn sustain(&self, notes: &mut [TickNote]) {
        if self.held.is_empty() {
            return;
        }
        let mut onsets: HashMap<(u8, u8), Vec<u64>> = HashMap::new();
        for note in notes.iter() {
            onsets.entry((note.channel, note.key)).or_default().push(note.start);
        }
        for starts in onsets.values_mut() {
            starts.sort_unstable();
        }

        for note in notes.iter_mut() {
            let Some(intervals) = self.held.get(&note.channel) else {
                continue;
            };
            let Some(&(_, release)) = intervals.iter().find(|&&(down, up)| down < note.end && note.end < up) else {
                continue;
            };
            let next_onset = onsets.get(&(note.channel, note.key)).and_then(|starts| {
                let after = starts.partition_point(|&s| s <= note.start);
                starts.get(after).copied()
            });
            let until = next_onset.map_or(release, |onset| onset.min(release));
            note.held_until = until.max(note.end);
        }
    }
}

/// Notes of every track plus the time of the last note-off or controller event.
fn collect_notes(smf: &Smf) -> Result<(Vec<Note>, f64)> {
    let clock = Clock::new(smf)?;
    let mut notes = Vec::new();
    let mut last_event = 0u64;

    for track in &smf.tracks {
        let mut tick = 0u64;
        // (channel, key) -> (start tick, velocity) of notes still sounding.
        let mut open: HashMap<(u8, u8), Vec<(u64, u8)>> = HashMap::new();
        let mut track_notes = Vec::new();
        let mut pedal = Pedal::default();
        for event in track {
            tick += event.delta.as_int() as u64;
            let TrackEventKind::Midi { channel, message } = event.kind else {
                continue;
            };
            let channel = channel.as_int();
            match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                    open.entry((channel, key.as_int())).or_default().push((tick, vel.as_int()));
                }
                MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                    let key = key.as_int();
                    let Some(started) = open.remove(&(channel, key)) else {
                        continue;
                    };
                    // Notes struck on this very tick stay open for a later note-off.
                    let (same_tick, closing): (Vec<_>, Vec<_>) =
                        started.into_iter().partition(|&(start, _)| start == tick);
                    for &(start, velocity) in &closing {
                        track_notes.push(TickNote { start, end: tick, held_until: tick, channel, key, velocity });
                    }
                    if !closing.is_empty() && !same_tick.is_empty() {
                        open.insert((channel, key), same_tick);
                    }
                    last_event = last_event.max(tick);
                }
                MidiMessage::Controller { controller, value } => {
                    if controller.as_int() == SUSTAIN_PEDAL_CC {
                        pedal.update(channel, tick, value.as_int() >= PEDAL_THRESHOLD);
                    }
                    last_event = last_event.max(tick);
                }
                MidiMessage::PitchBend { .. } => last_event = last_event.max(tick),
                _ => {}
            }
        }
        // Notes never switched off are dropped.
        pedal.sustain(&mut track_notes);
        notes.extend(track_notes.into_iter().map(|n| Note {
            start: clock.seconds(n.start),
            held_until: clock.seconds(n.held_until),
            key: n.key,
            velocity: n.velocity,
            drum: n.channel == DRUM_CHANNEL,
        }));
    }

    Ok((notes, clock.seconds(last_event)))
}

fn frame_of(seconds: f64) -> usize {
    (seconds * PIANO_ROLL_FPS).max(0.0) as usize
}

/// The parsed notes of one file, ready to be rendered into any window of its roll.
#[derive(Debug, Clone)]
pub struct NoteRoll {
    notes: Vec<Note>,
    frames: usize,
}

impl NoteRoll {
    /// Parses a standard MIDI file.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let smf = Smf::parse(bytes).map_err(|e| anyhow!("MIDI parse error: {}", e))?;
        let (notes, last_event) = collect_notes(&smf)?;
        Ok(Self { notes, frames: frame_of(last_event) })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
        Self::parse(&bytes)
    }

    /// Frames in the full roll, up to the last note-off or controller event.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Renders rows `start..start + len` of the roll. Rows past its end are zero.
    pub fn render_window(&self, start: usize, len: usize) -> FeatureGrid {
        let mut roll = FeatureGrid::zeros(len, PIANO_ROLL_PITCHES);
        let end = start.saturating_add(len).min(self.frames);
        let data = roll.as_mut_slice();
        for note in self.notes.iter().filter(|n| !n.drum) {
            let from = frame_of(note.start).max(start);
            let to = frame_of(note.held_until).min(end);
            for frame in from..to {
                data[(frame - start) * PIANO_ROLL_PITCHES + note.key as usize] += note.velocity as f32;
            }
        }
        roll
    }

    /// Renders the whole roll, refusing anything longer than `MAX_ROLL_FRAMES`.
    pub fn render(&self) -> Result<FeatureGrid> {
        ensure!(
            self.frames <= MAX_ROLL_FRAMES,
            "piano roll of {} frames exceeds the {} frame limit",
            self.frames,
            MAX_ROLL_FRAMES
        );
        Ok(self.render_window(0, self.frames))
    }
}

/// Parses a standard MIDI file into an unnormalized `[frames, 128]` piano roll.
pub fn piano_roll_from_bytes(bytes: &[u8]) -> Result<FeatureGrid> {
    NoteRoll::parse(bytes)?.render()
}

pub fn load_piano_roll(path: &Path) -> Result<FeatureGrid> {
    NoteRoll::load(path)?.render()
}

#[derive(Debug, Clone)]
pub struct SymbolicExtractor {
    target_length: usize,
}

impl SymbolicExtractor {
    pub fn new(target_length: usize) -> Self {
        Self { target_length }
    }

    pub fn from_config(config: &DatasetConfig) -> Self {
        Self::new(config.target_length)
    }

    /// Returns a `[target_length, 128]` piano roll for `primary`.
    ///
    /// `_secondary` mirrors the audio extractor's signature but is not blended in: only the
    /// primary file is rendered. Longer rolls are cropped to a random window, shorter ones
    /// zero-padded. An unreadable file becomes a `[1024, 128]` placeholder first.
    pub fn extract(&self, primary: &Path, _secondary: Option<(&Path, f64)>, rng: &mut impl Rng) -> FeatureGrid {
        match NoteRoll::load(primary) {
            Ok(roll) => {
                let start = random_window_start(roll.frames(), self.target_length, rng);
                roll.render_window(start, self.target_length)
            }
            Err(e) => {
                warn!(path = %primary.display(), error = %e, "piano roll load failed, using placeholder");
                FeatureGrid::placeholder(FALLBACK_FRAMES, PIANO_ROLL_PITCHES)
                    .pad_or_random_window(self.target_length, rng)
            }
        }
    }
}
