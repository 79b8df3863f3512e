use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use soundfont::data::hydra::sample::SampleLink;
use soundfont::data::{GeneratorAmount, GeneratorType};
use soundfont::SoundFont2;

use crate::dtype::{ConvError, Context};
use crate::fileutils::unique_output_path;
use crate::math::{gain, timecents_to_seconds, seconds_to_timecents, abs_cents_to_hertz, hertz_to_abs_cents};
use crate::model::{
    AudioMetadata, Envelope, EnvelopeModulator, Filter, FilterType, Group, Loop, LoopType,
    MultiSampleSource, PcmData, SampleData, SampleZone,
};
use crate::pipeline::{FormatId, PresetReader, PresetWriter};
use crate::riff::{Chunk, ChunkTree, LIST};

/// Matches the depth normalization used by the SFZ codec so the two
/// round-trip against each other.
const DEPTH_CENTS: f64 = 1200.0;
const RESONANCE_DB: f64 = 40.0;

/// Generator values of one zone after flattening the global zone into it.
#[derive(Debug, Clone, Default)]
struct FlatZone {
    values: std::collections::HashMap<u16, i16>,
    key_range: Option<(u8, u8)>,
    vel_range: Option<(u8, u8)>,
    sample_id: Option<u16>,
    instrument_id: Option<u16>,
}

/// SF2 generator operator numbers.
fn generator_id(ty: &GeneratorType) -> u16 {
    match ty {
        GeneratorType::StartAddrsOffset => 0,
        GeneratorType::EndAddrsOffset => 1,
        GeneratorType::StartloopAddrsOffset => 2,
        GeneratorType::EndloopAddrsOffset => 3,
        GeneratorType::StartAddrsCoarseOffset => 4,
        GeneratorType::ModLfoToPitch => 5,
        GeneratorType::VibLfoToPitch => 6,
        GeneratorType::ModEnvToPitch => 7,
        GeneratorType::InitialFilterFc => 8,
        GeneratorType::InitialFilterQ => 9,
        GeneratorType::ModLfoToFilterFc => 10,
        GeneratorType::ModEnvToFilterFc => 11,
        GeneratorType::EndAddrsCoarseOffset => 12,
        GeneratorType::ModLfoToVolume => 13,
        GeneratorType::ChorusEffectsSend => 15,
        GeneratorType::ReverbEffectsSend => 16,
        GeneratorType::Pan => 17,
        GeneratorType::DelayModLFO => 21,
        GeneratorType::FreqModLFO => 22,
        GeneratorType::DelayVibLFO => 23,
        GeneratorType::FreqVibLFO => 24,
        GeneratorType::DelayModEnv => 25,
        GeneratorType::AttackModEnv => 26,
        GeneratorType::HoldModEnv => 27,
        GeneratorType::DecayModEnv => 28,
        GeneratorType::SustainModEnv => 29,
        GeneratorType::ReleaseModEnv => 30,
        GeneratorType::KeynumToModEnvHold => 31,
        GeneratorType::KeynumToModEnvDecay => 32,
        GeneratorType::DelayVolEnv => 33,
        GeneratorType::AttackVolEnv => 34,
        GeneratorType::HoldVolEnv => 35,
        GeneratorType::DecayVolEnv => 36,
        GeneratorType::SustainVolEnv => 37,
        GeneratorType::ReleaseVolEnv => 38,
        GeneratorType::KeynumToVolEnvHold => 39,
        GeneratorType::KeynumToVolEnvDecay => 40,
        GeneratorType::Instrument => 41,
        GeneratorType::KeyRange => 43,
        GeneratorType::VelRange => 44,
        GeneratorType::StartloopAddrsCoarseOffset => 45,
        GeneratorType::Keynum => 46,
        GeneratorType::Velocity => 47,
        GeneratorType::InitialAttenuation => 48,
        GeneratorType::EndloopAddrsCoarseOffset => 50,
        GeneratorType::CoarseTune => 51,
        GeneratorType::FineTune => 52,
        GeneratorType::SampleID => 53,
        GeneratorType::SampleModes => 54,
        GeneratorType::ScaleTuning => 56,
        GeneratorType::ExclusiveClass => 57,
        GeneratorType::OverridingRootKey => 58,
        _ => 59,
    }
}

fn flatten_zones(zones: &[soundfont::Zone]) -> Vec<FlatZone> {
    flatten_gen_lists(zones.iter().map(|z| z.gen_list.as_slice()))
}

/// Flattens generator lists: a leading zone without a terminal generator
/// is the global zone and seeds every following one.
fn flatten_gen_lists<'a>(lists: impl Iterator<Item = &'a [soundfont::data::Generator]>) -> Vec<FlatZone> {
    let mut flattened = Vec::new();
    let mut global = FlatZone::default();
    for (index, gen_list) in lists.enumerate() {
        let mut flat = global.clone();
        let mut terminal = false;
        for generator in gen_list {
            let id = generator_id(&generator.ty);
            match (&generator.ty, &generator.amount) {
                (GeneratorType::KeyRange, GeneratorAmount::Range(r)) => {
                    flat.key_range = Some((r.low, r.high));
                }
                (GeneratorType::VelRange, GeneratorAmount::Range(r)) => {
                    flat.vel_range = Some((r.low, r.high));
                }
                (GeneratorType::SampleID, GeneratorAmount::U16(v)) => {
                    flat.sample_id = Some(*v);
                    terminal = true;
                }
                (GeneratorType::Instrument, GeneratorAmount::U16(v)) => {
                    flat.instrument_id = Some(*v);
                    terminal = true;
                }
                (_, GeneratorAmount::U16(v)) => {
                    flat.values.insert(id, *v as i16);
                }
                (_, GeneratorAmount::I16(v)) => {
                    flat.values.insert(id, *v);
                }
                _ => {}
            }
        }
        // A first zone without a terminal generator is the global zone;
        // its values seed every following zone.
        if !terminal && index == 0 {
            global = flat;
        } else {
            flattened.push(flat);
        }
    }
    flattened
}

impl FlatZone {
    fn get(&self, ty: GeneratorType) -> Option<i16> {
        self.values.get(&generator_id(&ty)).copied()
    }
    /// Preset-level generators add onto instrument-level values.
    fn add_from(&mut self, preset: &FlatZone) {
        for (id, value) in &preset.values {
            let entry = self.values.entry(*id).or_insert(0);
            *entry = entry.saturating_add(*value);
        }
        if self.key_range.is_none() {
            self.key_range = preset.key_range;
        }
        if self.vel_range.is_none() {
            self.vel_range = preset.vel_range;
        }
    }
}

pub struct Sf2Detector;

impl PresetReader for Sf2Detector {
    fn format(&self) -> FormatId {
        FormatId::Sf2
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["sf2"]
    }

    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let mut file = std::fs::File::open(path)?;
        let sf2 = SoundFont2::load(&mut file)
            .map_err(|e| ConvError::Invalid(format!("SoundFont parse of '{}': {:?}", path.display(), e)))?;
        let smpl_offset = sf2
            .sample_data
            .smpl
            .as_ref()
            .map(|chunk| chunk.offset() + 8)
            .ok_or_else(|| ConvError::Invalid(format!("'{}' has no sample data", path.display())))?;

        let mut sources = Vec::new();
        let mut presets: Vec<&soundfont::Preset> = sf2.presets.iter().collect();
        presets.sort_by_key(|p| (p.header.preset, p.header.bank));

        for preset in presets {
            ctx.cancellation.check()?;
            let mut source = MultiSampleSource::new(preset.header.name.trim_end_matches('\0'));
            if let Some(engineers) = sf2.info.engineers.as_ref() {
                source.metadata.creator = Some(engineers.clone());
            }
            if let Some(comment) = sf2.info.comments.as_ref() {
                source.metadata.description = Some(comment.clone());
            }

            for preset_zone in flatten_zones(&preset.zones) {
                let instrument_id = match preset_zone.instrument_id {
                    Some(id) => id as usize,
                    None => continue,
                };
                let instrument = match sf2.instruments.get(instrument_id) {
                    Some(i) => i,
                    None => continue,
                };
                let mut group = Group::new(instrument.header.name.trim_end_matches('\0'));
                for mut zone in flatten_zones(&instrument.zones) {
                    zone.add_from(&preset_zone);
                    match self.build_zone(ctx, &sf2, &mut file, smpl_offset, &zone)? {
                        Some((z, filter)) => {
                            if source.global_filter.is_none() {
                                source.global_filter = filter;
                            }
                            group.zones.push(z);
                        }
                        None => continue,
                    }
                }
                source.groups.push(group);
            }
            source.prune_empty_groups();
            if !source.groups.is_empty() {
                sources.push(source);
            }
        }
        Ok(sources)
    }
}

impl Sf2Detector {
    fn build_zone<R: Read + Seek>(
        &self,
        ctx: &Context,
        sf2: &SoundFont2,
        file: &mut R,
        smpl_offset: u64,
        flat: &FlatZone,
    ) -> Result<Option<(SampleZone, Option<Filter>)>, ConvError> {
        let sample_id = match flat.sample_id {
            Some(id) => id as usize,
            None => return Ok(None),
        };
        let header = match sf2.sample_headers.get(sample_id) {
            Some(h) => h,
            None => {
                ctx.notifier.warn(&format!("SampleNotFound: SF2 sample index {}", sample_id));
                return Ok(None);
            }
        };

        // Pull the raw 16-bit span out of the smpl chunk.
        let frames = (header.end.saturating_sub(header.start)) as usize;
        let mut raw = vec![0i16; frames];
        file.seek(SeekFrom::Start(smpl_offset + header.start as u64 * 2))?;
        file.read_i16_into::<LittleEndian>(&mut raw)?;
        let mut pcm_bytes = Vec::with_capacity(frames * 2);
        for v in &raw {
            pcm_bytes.extend_from_slice(&v.to_le_bytes());
        }
        let pcm = PcmData {
            audio: AudioMetadata {
                channels: 1,
                sample_rate: header.sample_rate,
                bits_per_sample: 16,
                frame_count: frames as u64,
                float: false,
            },
            pcm: pcm_bytes,
        };

        let mut zone = SampleZone::new(header.name.trim_end_matches('\0'), SampleData::Memory(pcm));
        zone.stop = frames as u64;
        if let Some((low, high)) = flat.key_range {
            zone.key_low = Some(low.min(127));
            zone.key_high = Some(high.min(127));
        }
        if let Some((low, high)) = flat.vel_range {
            zone.vel_low = low.min(127);
            zone.vel_high = high.min(127);
        }
        let root = flat
            .get(GeneratorType::OverridingRootKey)
            .filter(|v| (0..=127).contains(v))
            .map(|v| v as u8)
            .unwrap_or(if header.origpitch > 127 { 60 } else { header.origpitch });
        zone.key_root = Some(root);
        zone.tune = f64::from(flat.get(GeneratorType::CoarseTune).unwrap_or(0))
            + (f64::from(flat.get(GeneratorType::FineTune).unwrap_or(0)) + f64::from(header.pitchadj)) / 100.0;
        zone.panning = (f64::from(flat.get(GeneratorType::Pan).unwrap_or(0)) / 500.0).clamp(-1.0, 1.0);
        // initialAttenuation is centibels of attenuation.
        zone.gain = -f64::from(flat.get(GeneratorType::InitialAttenuation).unwrap_or(0)) / 10.0;
        zone.key_tracking =
            (f64::from(flat.get(GeneratorType::ScaleTuning).unwrap_or(100)) / 100.0).clamp(0.0, 1.0);
        match header.sample_type {
            SampleLink::LeftSample => zone.panning = -1.0,
            SampleLink::RightSample => zone.panning = 1.0,
            _ => {}
        }

        let sample_modes = flat.get(GeneratorType::SampleModes).unwrap_or(0);
        if sample_modes == 1 || sample_modes == 3 {
            let loop_start = i64::from(header.loop_start) - i64::from(header.start)
                + i64::from(flat.get(GeneratorType::StartloopAddrsOffset).unwrap_or(0));
            let loop_end = i64::from(header.loop_end) - i64::from(header.start)
                + i64::from(flat.get(GeneratorType::EndloopAddrsOffset).unwrap_or(0));
            if loop_end > loop_start && loop_start >= 0 {
                zone.loops.push(Loop {
                    loop_type: LoopType::Forward,
                    start: loop_start as u64,
                    end: (loop_end as u64).min(frames as u64),
                    crossfade_frames: 0,
                });
            }
        }

        zone.amp_env.envelope = Envelope {
            attack: flat.get(GeneratorType::AttackVolEnv).map(timecents_to_seconds),
            hold: flat.get(GeneratorType::HoldVolEnv).map(timecents_to_seconds),
            decay: flat.get(GeneratorType::DecayVolEnv).map(timecents_to_seconds),
            // Sustain is centibels of attenuation below full level.
            sustain_level: flat
                .get(GeneratorType::SustainVolEnv)
                .map(|cb| gain(-f64::from(cb) / 10.0).clamp(0.0, 1.0)),
            release: flat.get(GeneratorType::ReleaseVolEnv).map(timecents_to_seconds),
            ..Default::default()
        };

        let cutoff = flat.get(GeneratorType::InitialFilterFc);
        let mod_env_to_fc = flat.get(GeneratorType::ModEnvToFilterFc).unwrap_or(0);
        let mut filter_out = None;
        if cutoff.is_some() || mod_env_to_fc != 0 {
            let mod_env = Envelope {
                attack: flat.get(GeneratorType::AttackModEnv).map(timecents_to_seconds),
                hold: flat.get(GeneratorType::HoldModEnv).map(timecents_to_seconds),
                decay: flat.get(GeneratorType::DecayModEnv).map(timecents_to_seconds),
                // Mod-env sustain is 0.1% units of decrease.
                sustain_level: flat
                    .get(GeneratorType::SustainModEnv)
                    .map(|v| (1.0 - f64::from(v) / 1000.0).clamp(0.0, 1.0)),
                release: flat.get(GeneratorType::ReleaseModEnv).map(timecents_to_seconds),
                ..Default::default()
            };
            let modulator = EnvelopeModulator {
                envelope: mod_env,
                depth: (f64::from(mod_env_to_fc) / DEPTH_CENTS).clamp(-1.0, 1.0),
            };
            zone.filter_env = modulator.is_active().then(|| modulator.clone());
            filter_out = Some(Filter {
                filter_type: FilterType::LowPass,
                poles: 2,
                cutoff_hz: cutoff.map(abs_cents_to_hertz).unwrap_or(20000.0),
                resonance: (f64::from(flat.get(GeneratorType::InitialFilterQ).unwrap_or(0)) / 10.0 / RESONANCE_DB)
                    .clamp(0.0, 1.0),
                cutoff_envelope: modulator,
                cutoff_velocity: 0.0,
            });
        }

        let mod_env_to_pitch = flat.get(GeneratorType::ModEnvToPitch).unwrap_or(0);
        if mod_env_to_pitch != 0 {
            zone.pitch_env.depth = (f64::from(mod_env_to_pitch) / DEPTH_CENTS).clamp(-1.0, 1.0);
        }
        Ok(Some((zone, filter_out)))
    }
}

pub struct Sf2Creator;

impl PresetWriter for Sf2Creator {
    fn format(&self) -> FormatId {
        FormatId::Sf2
    }

    fn write(
        &self,
        ctx: &Context,
        source: &mut MultiSampleSource,
        dest_dir: &Path,
        taken: &mut HashSet<String>,
    ) -> Result<Vec<PathBuf>, ConvError> {
        let out_path = unique_output_path(dest_dir, &source.name, "sf2", taken);

        let mut sample_bytes: Vec<u8> = Vec::new();
        let mut sample_headers: Vec<ShdrRecord> = Vec::new();
        let mut instruments: Vec<(String, Vec<IgenZone>)> = Vec::new();

        for group in &mut source.groups {
            ctx.cancellation.check()?;
            let mut zones_out = Vec::new();
            for zone in &mut group.zones {
                if zone.sample.is_missing() {
                    continue;
                }
                let mut pcm = zone.sample.ensure_loaded()?.clone();
                // The format has no reverse flag; bake it into the audio.
                if zone.reversed {
                    pcm = crate::audio::reverse_frames(&pcm);
                }
                // SF2 sample data is 16-bit; stereo zones split into a
                // linked left/right pair.
                let (converted, rate_change) = crate::audio::convert_to_format(
                    &pcm,
                    &crate::audio::DestinationAudioFormat { bit_depths: vec![16], max_sample_rate: None, allow_float: false },
                )?;
                if let Some((from, to)) = rate_change {
                    zone.rescale_sample_positions(from, to);
                }
                if converted.audio.channels >= 2 {
                    let (left, right) = crate::audio::split_stereo(&converted)?;
                    let left_id = push_sample(&mut sample_bytes, &mut sample_headers, zone, &left, 0)?;
                    let right_id = push_sample(&mut sample_bytes, &mut sample_headers, zone, &right, 0)?;
                    sample_headers[left_id as usize].sample_link = right_id;
                    sample_headers[left_id as usize].sample_type = 4; // left
                    sample_headers[right_id as usize].sample_link = left_id;
                    sample_headers[right_id as usize].sample_type = 2; // right
                    zones_out.push(IgenZone::from_zone(zone, left_id, Some(-500), source.global_filter.as_ref()));
                    zones_out.push(IgenZone::from_zone(zone, right_id, Some(500), source.global_filter.as_ref()));
                } else {
                    let id = push_sample(&mut sample_bytes, &mut sample_headers, zone, &converted, 1)?;
                    zones_out.push(IgenZone::from_zone(zone, id, None, source.global_filter.as_ref()));
                }
                zone.sample.evict();
                ctx.notifier.progress();
            }
            if !zones_out.is_empty() {
                instruments.push((group.name.clone(), zones_out));
            }
        }

        if instruments.is_empty() {
            return Err(ConvError::ConstraintViolation(format!("'{}' has no playable zones", source.name)));
        }

        let tree = build_sf2_tree(source, &sample_bytes, &sample_headers, &instruments)?;
        let mut file = crate::fileutils::open_file_overwrite_rw(&out_path)?;
        tree.emit(&mut file)?;
        Ok(vec![out_path])
    }
}

#[derive(Debug, Clone, Default)]
struct ShdrRecord {
    name: String,
    start: u32,
    end: u32,
    loop_start: u32,
    loop_end: u32,
    sample_rate: u32,
    origpitch: u8,
    pitchadj: i8,
    sample_link: u16,
    sample_type: u16,
}

/// Appends mono PCM to the sample pool with the 46-frame silence guard
/// SoundFont players expect, returning the new sample's index.
fn push_sample(
    pool: &mut Vec<u8>,
    headers: &mut Vec<ShdrRecord>,
    zone: &SampleZone,
    pcm: &PcmData,
    sample_type: u16,
) -> Result<u16, ConvError> {
    let start_frame = (pool.len() / 2) as u32;
    pool.extend_from_slice(&pcm.pcm);
    let end_frame = (pool.len() / 2) as u32;
    pool.extend_from_slice(&[0u8; 92]);

    let (loop_start, loop_end) = match zone.loops.first() {
        Some(l) => (start_frame + l.start as u32, start_frame + l.end as u32),
        None => (start_frame, end_frame),
    };
    headers.push(ShdrRecord {
        name: zone.name.clone(),
        start: start_frame,
        end: end_frame,
        loop_start,
        loop_end,
        sample_rate: pcm.audio.sample_rate,
        origpitch: zone.key_root_or(60),
        // Tuning rides entirely on the fineTune/coarseTune generators so
        // readers that sum both sources do not apply it twice.
        pitchadj: 0,
        sample_link: 0,
        sample_type,
    });
    let id = headers.len() - 1;
    u16::try_from(id).map_err(|_| ConvError::ConstraintViolation("More than 65534 samples".to_string()))
}

/// One instrument zone and the generators it will emit.
#[derive(Debug, Clone)]
struct IgenZone {
    key_range: (u8, u8),
    vel_range: (u8, u8),
    generators: Vec<(u16, i16)>,
    sample_id: u16,
}

impl IgenZone {
    fn from_zone(zone: &SampleZone, sample_id: u16, pan_override: Option<i16>, filter: Option<&Filter>) -> IgenZone {
        let mut generators: Vec<(u16, i16)> = Vec::new();
        let tuning = crate::math::Tuning::from_semitones(zone.tune);
        generators.push((58, i16::from(zone.key_root_or(60)))); // overridingRootKey
        if tuning.semitones() != 0 {
            generators.push((51, tuning.semitones() as i16)); // coarseTune
        }
        // fineTune also lands in the shdr pitchadj; generators win where
        // both are read, and the values agree.
        if tuning.cents() != 0 {
            generators.push((52, i16::from(tuning.cents() as i8)));
        }
        let pan = pan_override.unwrap_or((zone.panning * 500.0) as i16);
        if pan != 0 {
            generators.push((17, pan));
        }
        if zone.gain < 0.0 {
            generators.push((48, (-zone.gain * 10.0).min(1440.0) as i16)); // initialAttenuation
        }
        if (zone.key_tracking - 1.0).abs() > f64::EPSILON {
            generators.push((56, (zone.key_tracking * 100.0) as i16)); // scaleTuning
        }
        if !zone.loops.is_empty() {
            generators.push((54, 1)); // sampleModes: continuous loop
        }
        let env = &zone.amp_env.envelope;
        if let Some(v) = env.attack {
            generators.push((34, seconds_to_timecents(v)));
        }
        if let Some(v) = env.hold {
            generators.push((35, seconds_to_timecents(v)));
        }
        if let Some(v) = env.decay {
            generators.push((36, seconds_to_timecents(v)));
        }
        if let Some(v) = env.sustain_level {
            let cb = if v <= 0.0 { 1440.0 } else { (-crate::math::decibels(v) * 10.0).clamp(0.0, 1440.0) };
            generators.push((37, cb as i16));
        }
        if let Some(v) = env.release {
            generators.push((38, seconds_to_timecents(v)));
        }
        if let Some(filter) = filter {
            generators.push((8, hertz_to_abs_cents(filter.cutoff_hz))); // initialFilterFc
            if filter.resonance > 0.0 {
                generators.push((9, (filter.resonance * RESONANCE_DB * 10.0) as i16)); // initialFilterQ
            }
            let modulator = zone.filter_env.as_ref().unwrap_or(&filter.cutoff_envelope);
            if modulator.is_active() {
                generators.push((11, (modulator.depth * DEPTH_CENTS) as i16)); // modEnvToFilterFc
                let menv = &modulator.envelope;
                if let Some(v) = menv.attack {
                    generators.push((26, seconds_to_timecents(v)));
                }
                if let Some(v) = menv.hold {
                    generators.push((27, seconds_to_timecents(v)));
                }
                if let Some(v) = menv.decay {
                    generators.push((28, seconds_to_timecents(v)));
                }
                if let Some(v) = menv.sustain_level {
                    generators.push((29, ((1.0 - v) * 1000.0).clamp(0.0, 1000.0) as i16));
                }
                if let Some(v) = menv.release {
                    generators.push((30, seconds_to_timecents(v)));
                }
            }
        }
        if zone.pitch_env.is_active() {
            generators.push((7, (zone.pitch_env.depth * DEPTH_CENTS) as i16)); // modEnvToPitch
        }
        IgenZone {
            key_range: (zone.key_low_or(0), zone.key_high_or(127)),
            vel_range: (zone.vel_low, zone.vel_high),
            generators,
            sample_id,
        }
    }
}

fn fixed_name(name: &str, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    for (i, b) in name.bytes().take(len - 1).enumerate() {
        out[i] = if b.is_ascii() { b } else { b'_' };
    }
    out
}

fn build_sf2_tree(
    source: &MultiSampleSource,
    sample_bytes: &[u8],
    sample_headers: &[ShdrRecord],
    instruments: &[(String, Vec<IgenZone>)],
) -> Result<ChunkTree, ConvError> {
    let mut tree = ChunkTree::new_riff(*b"sfbk");

    // INFO list.
    let mut info = Chunk::container(LIST, *b"INFO");
    let mut ifil = Vec::new();
    ifil.write_u16::<LittleEndian>(2)?;
    ifil.write_u16::<LittleEndian>(1)?;
    info.children.push(Chunk::leaf(*b"ifil", ifil));
    info.children.push(Chunk::leaf(*b"isng", b"EMU8000\0".to_vec()));
    info.children.push(Chunk::leaf(*b"INAM", zero_terminated(&source.name)));
    if let Some(creator) = &source.metadata.creator {
        info.children.push(Chunk::leaf(*b"IENG", zero_terminated(creator)));
    }
    if let Some(description) = &source.metadata.description {
        info.children.push(Chunk::leaf(*b"ICMT", zero_terminated(description)));
    }
    if let Some(date) = source.metadata.creation_date {
        info.children.push(Chunk::leaf(*b"ICRD", zero_terminated(&date.format("%Y-%m-%d").to_string())));
    }
    info.children.push(Chunk::leaf(*b"ISFT", zero_terminated(&format!("presetconv {}", crate::fileutils::VERSION))));
    tree.root.children.push(info);

    // sdta list: the 16-bit sample pool.
    let mut sdta = Chunk::container(LIST, *b"sdta");
    sdta.children.push(Chunk::leaf(*b"smpl", sample_bytes.to_vec()));
    tree.root.children.push(sdta);

    // pdta list: the hydra.
    let mut phdr = Vec::new();
    let mut pbag = Vec::new();
    let mut pgen = Vec::new();
    let mut inst = Vec::new();
    let mut ibag = Vec::new();
    let mut igen = Vec::new();

    // One preset referencing every instrument, one pbag zone each.
    phdr.extend_from_slice(&fixed_name(&source.name, 20));
    phdr.write_u16::<LittleEndian>(0)?; // preset number
    phdr.write_u16::<LittleEndian>(0)?; // bank
    phdr.write_u16::<LittleEndian>(0)?; // first pbag
    phdr.write_u32::<LittleEndian>(0)?;
    phdr.write_u32::<LittleEndian>(0)?;
    phdr.write_u32::<LittleEndian>(0)?;

    let mut pgen_count = 0u16;
    for (index, _) in instruments.iter().enumerate() {
        pbag.write_u16::<LittleEndian>(pgen_count)?;
        pbag.write_u16::<LittleEndian>(0)?;
        pgen.write_u16::<LittleEndian>(41)?; // instrument generator
        pgen.write_u16::<LittleEndian>(index as u16)?;
        pgen_count += 1;
    }
    // Terminal preset record.
    phdr.extend_from_slice(&fixed_name("EOP", 20));
    phdr.write_u16::<LittleEndian>(0)?;
    phdr.write_u16::<LittleEndian>(0)?;
    phdr.write_u16::<LittleEndian>(instruments.len() as u16)?;
    phdr.write_u32::<LittleEndian>(0)?;
    phdr.write_u32::<LittleEndian>(0)?;
    phdr.write_u32::<LittleEndian>(0)?;
    pbag.write_u16::<LittleEndian>(pgen_count)?;
    pbag.write_u16::<LittleEndian>(0)?;
    pgen.write_u16::<LittleEndian>(0)?;
    pgen.write_u16::<LittleEndian>(0)?;

    let mut igen_count = 0u16;
    let mut ibag_count = 0u16;
    for (name, zones) in instruments {
        inst.extend_from_slice(&fixed_name(name, 20));
        inst.write_u16::<LittleEndian>(ibag_count)?;
        for zone in zones {
            ibag.write_u16::<LittleEndian>(igen_count)?;
            ibag.write_u16::<LittleEndian>(0)?;
            ibag_count += 1;
            // keyRange must come first, velRange second, sampleID last.
            igen.write_u16::<LittleEndian>(43)?;
            igen.write_u8(zone.key_range.0)?;
            igen.write_u8(zone.key_range.1)?;
            igen.write_u16::<LittleEndian>(44)?;
            igen.write_u8(zone.vel_range.0)?;
            igen.write_u8(zone.vel_range.1)?;
            igen_count += 2;
            for (op, amount) in &zone.generators {
                igen.write_u16::<LittleEndian>(*op)?;
                igen.write_i16::<LittleEndian>(*amount)?;
                igen_count += 1;
            }
            igen.write_u16::<LittleEndian>(53)?;
            igen.write_u16::<LittleEndian>(zone.sample_id)?;
            igen_count += 1;
        }
    }
    inst.extend_from_slice(&fixed_name("EOI", 20));
    inst.write_u16::<LittleEndian>(ibag_count)?;
    ibag.write_u16::<LittleEndian>(igen_count)?;
    ibag.write_u16::<LittleEndian>(0)?;
    igen.write_u16::<LittleEndian>(0)?;
    igen.write_u16::<LittleEndian>(0)?;

    let mut shdr = Vec::new();
    for header in sample_headers {
        shdr.extend_from_slice(&fixed_name(&header.name, 20));
        shdr.write_u32::<LittleEndian>(header.start)?;
        shdr.write_u32::<LittleEndian>(header.end)?;
        shdr.write_u32::<LittleEndian>(header.loop_start)?;
        shdr.write_u32::<LittleEndian>(header.loop_end)?;
        shdr.write_u32::<LittleEndian>(header.sample_rate)?;
        shdr.write_u8(header.origpitch)?;
        shdr.write_i8(header.pitchadj)?;
        shdr.write_u16::<LittleEndian>(header.sample_link)?;
        shdr.write_u16::<LittleEndian>(header.sample_type)?;
    }
    shdr.extend_from_slice(&fixed_name("EOS", 20));
    shdr.extend_from_slice(&[0u8; 26]);

    // The terminal modulator records.
    let pmod = vec![0u8; 10];
    let imod = vec![0u8; 10];

    let mut pdta = Chunk::container(LIST, *b"pdta");
    pdta.children.push(Chunk::leaf(*b"phdr", phdr));
    pdta.children.push(Chunk::leaf(*b"pbag", pbag));
    pdta.children.push(Chunk::leaf(*b"pmod", pmod));
    pdta.children.push(Chunk::leaf(*b"pgen", pgen));
    pdta.children.push(Chunk::leaf(*b"inst", inst));
    pdta.children.push(Chunk::leaf(*b"ibag", ibag));
    pdta.children.push(Chunk::leaf(*b"imod", imod));
    pdta.children.push(Chunk::leaf(*b"igen", igen));
    pdta.children.push(Chunk::leaf(*b"shdr", shdr));
    tree.root.children.push(pdta);
    Ok(tree)
}

fn zero_terminated(text: &str) -> Vec<u8> {
    let mut out: Vec<u8> = text.bytes().filter(|b| b.is_ascii()).collect();
    out.push(0);
    if out.len() % 2 == 1 {
        out.push(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Cancellation, MapSettings, NullNotifier};

    fn tone_zone(name: &str, root: u8, frames: usize) -> SampleZone {
        let mut pcm = Vec::new();
        for i in 0..frames {
            pcm.extend_from_slice(&((i as i16) * 3).to_le_bytes());
        }
        let data = PcmData {
            audio: AudioMetadata { channels: 1, sample_rate: 44100, bits_per_sample: 16, frame_count: frames as u64, float: false },
            pcm,
        };
        let mut zone = SampleZone::new(name, SampleData::Memory(data));
        zone.key_root = Some(root);
        zone.key_low = Some(root - 1);
        zone.key_high = Some(root + 1);
        zone.stop = frames as u64;
        zone
    }

    #[test]
    fn written_sf2_parses_back_with_the_soundfont_crate() {
        let dir = std::env::temp_dir().join(format!("sf2-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);

        let mut source = MultiSampleSource::new("TestFont");
        let mut group = Group::new("Keys");
        let mut zone = tone_zone("K60", 60, 64);
        zone.amp_env.envelope.release = Some(0.5);
        zone.loops.push(Loop { loop_type: LoopType::Forward, start: 16, end: 48, crossfade_frames: 0 });
        group.zones.push(zone);
        group.zones.push(tone_zone("K64", 64, 64));
        source.groups.push(group);

        let mut taken = HashSet::new();
        let written = Sf2Creator.write(&ctx, &mut source, &dir, &mut taken).unwrap();
        assert_eq!(written.len(), 1);

        let sources = Sf2Detector.read(&ctx, &written[0]).unwrap();
        assert_eq!(sources.len(), 1);
        let back = &sources[0];
        assert_eq!(back.name, "TestFont");
        assert_eq!(back.groups.len(), 1);
        assert_eq!(back.groups[0].zones.len(), 2);
        let z = &back.groups[0].zones[0];
        assert_eq!(z.key_root, Some(60));
        assert_eq!(z.loops.len(), 1);
        assert_eq!(z.loops[0].start, 16);
        assert_eq!(z.loops[0].end, 48);
        let release = z.amp_env.envelope.release.unwrap();
        assert!((release - 0.5).abs() < 0.01, "release came back as {}", release);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn flatten_applies_global_zone_to_all() {
        use soundfont::data::{Generator, GeneratorAmountRange};
        let global = vec![Generator {
            ty: GeneratorType::ReleaseVolEnv,
            amount: GeneratorAmount::I16(-1200),
        }];
        let zone = vec![
            Generator {
                ty: GeneratorType::KeyRange,
                amount: GeneratorAmount::Range(GeneratorAmountRange { low: 10, high: 20 }),
            },
            Generator { ty: GeneratorType::SampleID, amount: GeneratorAmount::U16(0) },
        ];
        let flat = flatten_gen_lists([global.as_slice(), zone.as_slice()].into_iter());
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].key_range, Some((10, 20)));
        assert_eq!(flat[0].get(GeneratorType::ReleaseVolEnv), Some(-1200));
    }
}
