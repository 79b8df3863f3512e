use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use strum::{Display, EnumIter, EnumString};

use crate::dtype::{ConvError, Notifier};
use crate::math::limit;

/// Closed category taxonomy. Detectors map free-form text onto these tags;
/// anything unmatched stays `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, Default)]
pub enum Category {
    Bass,
    Bell,
    Brass,
    #[strum(serialize = "Chromatic Percussion")]
    ChromaticPercussion,
    Drum,
    Ensemble,
    #[strum(serialize = "FX")]
    Fx,
    Guitar,
    Keyboard,
    Lead,
    Loop,
    Orchestral,
    Organ,
    Pad,
    Percussion,
    Piano,
    Pipe,
    Pluck,
    Strings,
    Synth,
    Vocal,
    Winds,
    World,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub creator: Option<String>,
    pub description: Option<String>,
    pub category: Category,
    pub keywords: BTreeSet<String>,
    pub creation_date: Option<NaiveDateTime>,
    pub originator: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum TriggerType {
    Attack,
    Release,
    First,
    Legato,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayLogic {
    #[default]
    Always,
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopType {
    #[default]
    Forward,
    Alternating,
    Backward,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Loop {
    pub loop_type: LoopType,
    /// Frame the loop jumps back to.
    pub start: u64,
    /// Frame one past the last looped frame.
    pub end: u64,
    pub crossfade_frames: u64,
}

impl Loop {
    pub fn is_valid(&self, frame_count: u64) -> bool {
        self.start <= self.end && self.end <= frame_count
    }
}

/// AHDSR envelope. `None` times mean the source format did not state them;
/// emitters substitute a category default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub attack: Option<f64>,
    pub hold: Option<f64>,
    pub decay: Option<f64>,
    pub sustain_level: Option<f64>,
    pub release: Option<f64>,
    pub attack_slope: f64,
    pub decay_slope: f64,
    pub release_slope: f64,
}

impl Envelope {
    pub fn is_set(&self) -> bool {
        self.attack.is_some()
            || self.hold.is_some()
            || self.decay.is_some()
            || self.sustain_level.is_some()
            || self.release.is_some()
    }

    /// Release default by category: percussive tags decay fast, sustained
    /// tags get a longer tail.
    pub fn default_release_for(category: Category) -> f64 {
        match category {
            Category::Drum | Category::Percussion | Category::ChromaticPercussion | Category::Pluck => 0.1,
            Category::Pad | Category::Strings | Category::Ensemble | Category::Organ => 0.5,
            _ => 0.2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeModulator {
    pub envelope: Envelope,
    /// Modulation depth, -1..1. Zero disables the modulator.
    pub depth: f64,
}

impl EnvelopeModulator {
    pub fn with_depth(depth: f64) -> EnvelopeModulator {
        EnvelopeModulator { envelope: Envelope::default(), depth }
    }
    pub fn is_active(&self) -> bool {
        self.depth != 0.0 && self.envelope.is_set()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
pub enum FilterType {
    #[default]
    LowPass,
    HighPass,
    BandPass,
    Notch,
    Peak,
    LowPass1p,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub filter_type: FilterType,
    /// 1, 2 or 4.
    pub poles: u8,
    pub cutoff_hz: f64,
    /// 0..1.
    pub resonance: f64,
    pub cutoff_envelope: EnvelopeModulator,
    /// Velocity to cutoff depth, -1..1.
    pub cutoff_velocity: f64,
}

impl Default for Filter {
    fn default() -> Filter {
        Filter {
            filter_type: FilterType::LowPass,
            poles: 2,
            cutoff_hz: 20000.0,
            resonance: 0.0,
            cutoff_envelope: EnvelopeModulator::default(),
            cutoff_velocity: 0.0,
        }
    }
}

/// Shape of the audio a zone points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioMetadata {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub frame_count: u64,
    /// 32-bit float PCM instead of integer.
    pub float: bool,
}

impl Default for AudioMetadata {
    fn default() -> AudioMetadata {
        AudioMetadata { channels: 1, sample_rate: 44100, bits_per_sample: 16, frame_count: 0, float: false }
    }
}

impl AudioMetadata {
    pub fn bytes_per_frame(&self) -> u64 {
        self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }
}

/// Decoded interleaved PCM, little-endian integer or 32-bit float per
/// `audio.float`.
#[derive(Debug, Clone, Default)]
pub struct PcmData {
    pub audio: AudioMetadata,
    pub pcm: Vec<u8>,
}

/// A zone's audio: decoded in memory, or a file reference that is loaded
/// lazily and can be evicted once the destination writer has consumed it.
#[derive(Debug, Clone)]
pub enum SampleData {
    Memory(PcmData),
    File { path: PathBuf, cache: Option<PcmData> },
    /// Reference that could not be resolved; the zone is kept per the
    /// error-handling contract.
    Missing(String),
}

impl SampleData {
    pub fn from_file(path: PathBuf) -> SampleData {
        SampleData::File { path, cache: None }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, SampleData::Missing(_))
    }

    pub fn file_path(&self) -> Option<&PathBuf> {
        match self {
            SampleData::File { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Decodes on first call; later calls return the cached PCM.
    pub fn ensure_loaded(&mut self) -> Result<&PcmData, ConvError> {
        match self {
            SampleData::Memory(pcm) => Ok(pcm),
            SampleData::File { path, cache } => {
                if cache.is_none() {
                    *cache = Some(crate::audio::decode_audio_file(path)?);
                }
                Ok(cache.as_ref().expect("just filled"))
            }
            SampleData::Missing(name) => Err(ConvError::SampleNotFound(name.clone())),
        }
    }

    /// Drops decoded PCM after the destination writer consumed it, keeping
    /// heap usage at one in-flight sample.
    pub fn evict(&mut self) {
        if let SampleData::File { cache, .. } = self {
            *cache = None;
        }
    }

    /// Metadata without forcing a decode if already known.
    pub fn audio_metadata(&mut self) -> Result<AudioMetadata, ConvError> {
        Ok(self.ensure_loaded()?.audio)
    }
}

/// The atomic mapping unit: one sample with its key/velocity window and
/// playback parameters.
#[derive(Debug, Clone)]
pub struct SampleZone {
    pub name: String,
    pub sample: SampleData,

    pub key_low: Option<u8>,
    pub key_high: Option<u8>,
    pub key_root: Option<u8>,
    pub vel_low: u8,
    pub vel_high: u8,

    pub xfade_lo_key: u32,
    pub xfade_hi_key: u32,
    pub xfade_lo_vel: u32,
    pub xfade_hi_vel: u32,

    /// Playback window in frames.
    pub start: u64,
    pub stop: u64,
    pub reversed: bool,
    /// 0..1; 1 is full keyboard tracking.
    pub key_tracking: f64,
    /// Fractional semitones.
    pub tune: f64,
    /// Decibels.
    pub gain: f64,
    /// -1 (hard left) .. 1 (hard right).
    pub panning: f64,
    /// Cents.
    pub bend_up: i32,
    pub bend_down: i32,

    pub loops: Vec<Loop>,

    pub amp_env: EnvelopeModulator,
    pub pitch_env: EnvelopeModulator,
    /// Velocity to volume depth, -1..1.
    pub amp_velocity: f64,
    /// Velocity to pitch depth, -1..1.
    pub pitch_velocity: f64,
    /// Per-zone filter-envelope override; the shared one lives on `Filter`.
    pub filter_env: Option<EnvelopeModulator>,

    pub play_logic: PlayLogic,
    pub rr_index: u32,
}

impl SampleZone {
    pub fn new(name: &str, sample: SampleData) -> SampleZone {
        SampleZone {
            name: name.to_string(),
            sample,
            key_low: None,
            key_high: None,
            key_root: None,
            vel_low: 0,
            vel_high: 127,
            xfade_lo_key: 0,
            xfade_hi_key: 0,
            xfade_lo_vel: 0,
            xfade_hi_vel: 0,
            start: 0,
            stop: 0,
            reversed: false,
            key_tracking: 1.0,
            tune: 0.0,
            gain: 0.0,
            panning: 0.0,
            bend_up: 200,
            bend_down: -200,
            loops: Vec::new(),
            amp_env: EnvelopeModulator::with_depth(1.0),
            pitch_env: EnvelopeModulator::default(),
            amp_velocity: 0.0,
            pitch_velocity: 0.0,
            filter_env: None,
            play_logic: PlayLogic::Always,
            rr_index: 0,
        }
    }

    pub fn key_low_or(&self, default: u8) -> u8 {
        self.key_low.unwrap_or(default)
    }
    pub fn key_high_or(&self, default: u8) -> u8 {
        self.key_high.unwrap_or(default)
    }
    pub fn key_root_or(&self, default: u8) -> u8 {
        self.key_root.unwrap_or(default)
    }

    /// Clamps every ranged field into its model range, logging once per
    /// corrected field. The zone is always usable afterwards.
    pub fn sanitize(&mut self, notifier: &dyn Notifier) {
        for key in [&mut self.key_low, &mut self.key_high, &mut self.key_root] {
            if let Some(k) = key {
                if *k > 127 {
                    notifier.warn(&format!("ValueOutOfRange: key {} clamped to 127 in zone '{}'", k, self.name));
                    *k = 127;
                }
            }
        }
        if let (Some(lo), Some(hi)) = (self.key_low, self.key_high) {
            if lo > hi {
                notifier.warn(&format!("ValueOutOfRange: key range {}..{} flipped in zone '{}'", lo, hi, self.name));
                self.key_low = Some(hi);
                self.key_high = Some(lo);
            }
        }
        if self.vel_low > self.vel_high {
            std::mem::swap(&mut self.vel_low, &mut self.vel_high);
        }
        self.vel_low = limit(self.vel_low, 0, 127);
        self.vel_high = limit(self.vel_high, 0, 127);
        self.key_tracking = limit(self.key_tracking, 0.0, 1.0);
        self.panning = limit(self.panning, -1.0, 1.0);
        self.amp_velocity = limit(self.amp_velocity, -1.0, 1.0);
        self.pitch_velocity = limit(self.pitch_velocity, -1.0, 1.0);
    }

    /// Applies the zone invariants against the actual frame count, fixing
    /// the window and dropping loops that fall outside the audio.
    pub fn conform_to_frames(&mut self, frame_count: u64) {
        if self.stop == 0 || self.stop > frame_count {
            self.stop = frame_count;
        }
        if self.start > self.stop {
            self.start = self.stop;
        }
        self.loops.retain(|l| l.is_valid(frame_count));
    }

    /// Moves the key/velocity window, loop points and playback window from
    /// sample rate `from` to `to`.
    pub fn rescale_sample_positions(&mut self, from: u32, to: u32) {
        use crate::math::rescale_position;
        self.start = rescale_position(self.start, from, to);
        self.stop = rescale_position(self.stop, from, to);
        for l in &mut self.loops {
            l.start = rescale_position(l.start, from, to);
            l.end = rescale_position(l.end, from, to);
            l.crossfade_frames = rescale_position(l.crossfade_frames, from, to);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Group {
    pub name: String,
    pub trigger: Option<TriggerType>,
    pub zones: Vec<SampleZone>,
}

impl Group {
    pub fn new(name: &str) -> Group {
        Group { name: name.to_string(), trigger: None, zones: Vec::new() }
    }
}

/// Channel structure of a group as derived from its zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneChannels {
    Mono,
    Stereo,
    Mixed,
    /// Each physical zone is one channel of a conceptually stereo zone,
    /// marked by hard panning and matching key/loop metadata.
    SplitStereo,
}

/// One playable instrument: the root of the canonical model.
#[derive(Debug, Clone, Default)]
pub struct MultiSampleSource {
    pub name: String,
    /// Path components from the source root down to the preset, used by
    /// metadata inference and folder mirroring.
    pub breadcrumbs: Vec<String>,
    pub metadata: Metadata,
    pub global_filter: Option<Filter>,
    pub global_amp_modulator: Option<EnvelopeModulator>,
    pub groups: Vec<Group>,
}

impl MultiSampleSource {
    pub fn new(name: &str) -> MultiSampleSource {
        MultiSampleSource { name: name.to_string(), ..Default::default() }
    }

    pub fn zone_count(&self) -> usize {
        self.groups.iter().map(|g| g.zones.len()).sum()
    }

    pub fn zones_mut(&mut self) -> impl Iterator<Item = &mut SampleZone> {
        self.groups.iter_mut().flat_map(|g| g.zones.iter_mut())
    }

    pub fn zones(&self) -> impl Iterator<Item = &SampleZone> {
        self.groups.iter().flat_map(|g| g.zones.iter())
    }

    /// Emission precondition: a group is non-empty when emitted.
    pub fn prune_empty_groups(&mut self) {
        self.groups.retain(|g| !g.zones.is_empty());
    }

    /// Derives the channel structure from zone audio and panning.
    pub fn zone_channels(&mut self) -> Result<ZoneChannels, ConvError> {
        let mut mono = 0usize;
        let mut stereo = 0usize;
        let mut hard_panned = 0usize;
        for group in &mut self.groups {
            for zone in &mut group.zones {
                if zone.sample.is_missing() {
                    continue;
                }
                let audio = zone.sample.audio_metadata()?;
                if audio.channels >= 2 {
                    stereo += 1;
                } else {
                    mono += 1;
                    if zone.panning <= -1.0 || zone.panning >= 1.0 {
                        hard_panned += 1;
                    }
                }
            }
        }
        Ok(match (mono, stereo) {
            (0, _) => ZoneChannels::Stereo,
            (m, 0) if m > 0 && hard_panned == m && m % 2 == 0 => ZoneChannels::SplitStereo,
            (_, 0) => ZoneChannels::Mono,
            _ => ZoneChannels::Mixed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::NullNotifier;

    fn zone_with_audio(name: &str, channels: u16, panning: f64) -> SampleZone {
        let mut z = SampleZone::new(
            name,
            SampleData::Memory(PcmData {
                audio: AudioMetadata { channels, sample_rate: 44100, bits_per_sample: 16, frame_count: 100, float: false },
                pcm: vec![0; 100 * channels as usize * 2],
            }),
        );
        z.panning = panning;
        z
    }

    #[test]
    fn sanitize_fixes_flipped_ranges() {
        let mut z = zone_with_audio("a", 1, 0.0);
        z.key_low = Some(90);
        z.key_high = Some(30);
        z.vel_low = 100;
        z.vel_high = 20;
        z.sanitize(&NullNotifier);
        assert_eq!(z.key_low, Some(30));
        assert_eq!(z.key_high, Some(90));
        assert!(z.vel_low <= z.vel_high);
    }

    #[test]
    fn conform_drops_out_of_range_loops() {
        let mut z = zone_with_audio("a", 1, 0.0);
        z.loops.push(Loop { loop_type: LoopType::Forward, start: 10, end: 90, crossfade_frames: 0 });
        z.loops.push(Loop { loop_type: LoopType::Forward, start: 10, end: 200, crossfade_frames: 0 });
        z.conform_to_frames(100);
        assert_eq!(z.loops.len(), 1);
        assert_eq!(z.stop, 100);
    }

    #[test]
    fn split_stereo_detected_from_hard_panning() {
        let mut source = MultiSampleSource::new("bass");
        let mut g = Group::new("g");
        g.zones.push(zone_with_audio("l", 1, -1.0));
        g.zones.push(zone_with_audio("r", 1, 1.0));
        source.groups.push(g);
        assert_eq!(source.zone_channels().unwrap(), ZoneChannels::SplitStereo);
    }

    #[test]
    fn rescale_moves_loops_with_the_window() {
        let mut z = zone_with_audio("a", 1, 0.0);
        z.start = 0;
        z.stop = 100;
        z.loops.push(Loop { loop_type: LoopType::Forward, start: 50, end: 100, crossfade_frames: 0 });
        z.rescale_sample_positions(44100, 88200);
        assert_eq!(z.stop, 200);
        assert_eq!(z.loops[0].start, 100);
        assert_eq!(z.loops[0].end, 200);
    }
}
