use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use crate::binutils::{read_u8_lstring, read_varint, write_u8_lstring, write_varint};
use crate::dtype::{ConvError, Context};
use crate::fileutils::{sanitize_file_name, unique_output_path};
use crate::model::{
    Envelope, EnvelopeModulator, Filter, FilterType, Group, Loop, LoopType, MultiSampleSource,
    SampleData, SampleZone,
};
use crate::pipeline::{FormatId, PresetReader, PresetWriter};

/// Maschine sounds are Boost serialization archives: the ASCII magic, a
/// version tuple, then rows of mixed scalars. Two layout generations
/// exist; every parameter offset differs between them, so both offset
/// tables are hard-coded and picked by the layout version byte.

const ARCHIVE_MAGIC: &str = "serialization::archive";
const ARCHIVE_VERSION: u64 = 17;
/// Layout generations split at this version byte.
const LAYOUT_SPLIT: u8 = 0x0D;

/// Byte offsets of the global parameters inside the globals row.
struct GlobalOffsets {
    block_len: usize,
    pitch_bend: usize,
    tuning: usize,
    attack: usize,
    hold: usize,
    decay: usize,
    sustain: usize,
    release: usize,
    filter_type: usize,
    cutoff: usize,
    resonance: usize,
    velocity_to_volume: usize,
    velocity_to_cutoff: usize,
}

const GLOBALS_PRE_0D: GlobalOffsets = GlobalOffsets {
    block_len: 48,
    pitch_bend: 0,
    tuning: 2,
    attack: 7,
    hold: 11,
    decay: 15,
    sustain: 19,
    release: 23,
    filter_type: 27,
    cutoff: 28,
    resonance: 32,
    velocity_to_volume: 36,
    velocity_to_cutoff: 40,
};

const GLOBALS_0D: GlobalOffsets = GlobalOffsets {
    block_len: 56,
    pitch_bend: 0,
    tuning: 2,
    attack: 9,
    hold: 13,
    decay: 17,
    sustain: 21,
    release: 25,
    filter_type: 31,
    cutoff: 32,
    resonance: 36,
    velocity_to_volume: 40,
    velocity_to_cutoff: 44,
};

/// Byte offsets inside one zone row. The old layout packs 59 bytes per
/// zone, the new one 80 with a longer name, loop crossfade, reverse and
/// round-robin slots.
struct ZoneOffsets {
    block_len: usize,
    name_len: usize,
    root: usize,
    key_low: usize,
    key_high: usize,
    vel_low: usize,
    vel_high: usize,
    reversed: Option<usize>,
    start: usize,
    end: usize,
    loop_start: usize,
    loop_end: usize,
    loop_crossfade: Option<usize>,
    loop_on: usize,
    tune: usize,
    gain: usize,
    pan: usize,
    sample_index: usize,
    rr_index: Option<usize>,
}

const ZONES_PRE_0D: ZoneOffsets = ZoneOffsets {
    block_len: 59,
    name_len: 16,
    root: 16,
    key_low: 17,
    key_high: 18,
    vel_low: 19,
    vel_high: 20,
    reversed: None,
    start: 21,
    end: 25,
    loop_start: 29,
    loop_end: 33,
    loop_crossfade: None,
    loop_on: 37,
    tune: 38,
    gain: 42,
    pan: 46,
    sample_index: 50,
    rr_index: None,
};

const ZONES_0D: ZoneOffsets = ZoneOffsets {
    block_len: 80,
    name_len: 24,
    root: 24,
    key_low: 25,
    key_high: 26,
    vel_low: 27,
    vel_high: 28,
    reversed: Some(29),
    start: 30,
    end: 34,
    loop_start: 38,
    loop_end: 42,
    loop_crossfade: Some(46),
    loop_on: 50,
    tune: 51,
    gain: 55,
    pan: 59,
    sample_index: 63,
    rr_index: Some(65),
};

fn read_magic<R: Read>(reader: &mut R, file_name: &str) -> Result<u8, ConvError> {
    let magic = read_u8_lstring(reader)?;
    if magic != ARCHIVE_MAGIC {
        return Err(ConvError::BadMagic {
            file: file_name.to_string(),
            expected: *b"srlz",
            found: {
                let b = magic.as_bytes();
                [
                    b.first().copied().unwrap_or(0),
                    b.get(1).copied().unwrap_or(0),
                    b.get(2).copied().unwrap_or(0),
                    b.get(3).copied().unwrap_or(0),
                ]
            },
        });
    }
    let _archive_version = read_varint(reader)?;
    let layout = reader.read_u8()?;
    Ok(layout)
}

pub struct MaschineDetector;

impl PresetReader for MaschineDetector {
    fn format(&self) -> FormatId {
        FormatId::Maschine
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["mxsnd"]
    }

    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let file_name = path.display().to_string();
        let bytes = std::fs::read(path)?;
        let mut cur = Cursor::new(bytes.as_slice());
        let layout = read_magic(&mut cur, &file_name)?;
        let (globals, zones_layout) = if layout < LAYOUT_SPLIT {
            (&GLOBALS_PRE_0D, &ZONES_PRE_0D)
        } else {
            (&GLOBALS_0D, &ZONES_0D)
        };

        let name = read_u8_lstring(&mut cur)?;
        let mut source = MultiSampleSource::new(if name.is_empty() {
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("sound")
        } else {
            &name
        });

        let mut block = vec![0u8; globals.block_len];
        cur.read_exact(&mut block)?;
        let bend = LittleEndian::read_i16(&block[globals.pitch_bend..]);
        let tuning = f64::from(LittleEndian::read_f32(&block[globals.tuning..]));
        let env = Envelope {
            attack: Some(f64::from(LittleEndian::read_f32(&block[globals.attack..]))),
            hold: Some(f64::from(LittleEndian::read_f32(&block[globals.hold..]))),
            decay: Some(f64::from(LittleEndian::read_f32(&block[globals.decay..]))),
            sustain_level: Some(f64::from(LittleEndian::read_f32(&block[globals.sustain..])).clamp(0.0, 1.0)),
            release: Some(f64::from(LittleEndian::read_f32(&block[globals.release..]))),
            ..Default::default()
        };
        let filter_type = block[globals.filter_type];
        let cutoff = f64::from(LittleEndian::read_f32(&block[globals.cutoff..]));
        let resonance = f64::from(LittleEndian::read_f32(&block[globals.resonance..]));
        let velocity_to_volume = f64::from(LittleEndian::read_f32(&block[globals.velocity_to_volume..]));
        let velocity_to_cutoff = f64::from(LittleEndian::read_f32(&block[globals.velocity_to_cutoff..]));

        if filter_type != 0xFF {
            source.global_filter = Some(Filter {
                filter_type: match filter_type {
                    1 => FilterType::HighPass,
                    2 => FilterType::BandPass,
                    _ => FilterType::LowPass,
                },
                cutoff_hz: cutoff,
                resonance: resonance.clamp(0.0, 1.0),
                cutoff_velocity: velocity_to_cutoff.clamp(-1.0, 1.0),
                ..Default::default()
            });
        }

        let zone_count = read_varint(&mut cur)? as usize;
        let mut raw_zones = Vec::with_capacity(zone_count);
        for _ in 0..zone_count {
            let mut row = vec![0u8; zones_layout.block_len];
            cur.read_exact(&mut row).map_err(|_| ConvError::Truncated {
                file: file_name.clone(),
                offset: cur.position(),
            })?;
            raw_zones.push(row);
        }

        let path_count = read_varint(&mut cur)? as usize;
        let mut sample_paths = Vec::with_capacity(path_count);
        for _ in 0..path_count {
            sample_paths.push(read_u8_lstring(&mut cur)?);
        }

        // SoundInfo block: author, vendor, comment.
        if let Ok(author) = read_u8_lstring(&mut cur) {
            if !author.is_empty() {
                source.metadata.creator = Some(author);
            }
        }
        if let Ok(vendor) = read_u8_lstring(&mut cur) {
            if !vendor.is_empty() {
                source.metadata.originator = Some(vendor);
            }
        }
        if let Ok(comment) = read_u8_lstring(&mut cur) {
            if !comment.is_empty() {
                source.metadata.description = Some(comment);
            }
        }

        let dir = path.parent().unwrap_or(Path::new("."));
        let mut group = Group::new("");
        for row in &raw_zones {
            ctx.cancellation.check()?;
            let o = zones_layout;
            let zone_name = {
                let raw = &row[..o.name_len];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                String::from_utf8_lossy(&raw[..end]).into_owned()
            };
            let reference = sample_paths
                .get(LittleEndian::read_u16(&row[o.sample_index..]) as usize)
                .cloned()
                .unwrap_or_default();
            let data = if reference.is_empty() {
                ctx.notifier.warn(&format!("SampleNotFound: zone '{}' has no sample entry", zone_name));
                SampleData::Missing(zone_name.clone())
            } else {
                match crate::locator::find_sample(&reference, dir, crate::locator::DEFAULT_SEARCH_DEPTH) {
                    Some(found) => SampleData::from_file(found),
                    None => {
                        ctx.notifier.warn(&format!("SampleNotFound: '{}'", reference));
                        SampleData::Missing(reference.clone())
                    }
                }
            };
            let mut zone = SampleZone::new(if zone_name.is_empty() { "zone" } else { &zone_name }, data);
            zone.key_root = Some(row[o.root].min(127));
            zone.key_low = Some(row[o.key_low].min(127));
            zone.key_high = Some(row[o.key_high].min(127));
            zone.vel_low = row[o.vel_low].min(127);
            zone.vel_high = row[o.vel_high].min(127);
            zone.reversed = o.reversed.map(|at| row[at] != 0).unwrap_or(false);
            zone.start = u64::from(LittleEndian::read_u32(&row[o.start..]));
            zone.stop = u64::from(LittleEndian::read_u32(&row[o.end..]));
            zone.tune = f64::from(LittleEndian::read_f32(&row[o.tune..])) + tuning;
            zone.gain = f64::from(LittleEndian::read_f32(&row[o.gain..]));
            zone.panning = f64::from(LittleEndian::read_f32(&row[o.pan..])).clamp(-1.0, 1.0);
            zone.bend_up = i32::from(bend);
            zone.bend_down = -i32::from(bend);
            zone.amp_env.envelope = env.clone();
            zone.amp_velocity = velocity_to_volume.clamp(-1.0, 1.0);
            if row[o.loop_on] != 0 {
                let start = u64::from(LittleEndian::read_u32(&row[o.loop_start..]));
                let end = u64::from(LittleEndian::read_u32(&row[o.loop_end..]));
                if end > start {
                    zone.loops.push(Loop {
                        loop_type: LoopType::Forward,
                        start,
                        end,
                        crossfade_frames: o
                            .loop_crossfade
                            .map(|at| u64::from(LittleEndian::read_u32(&row[at..])))
                            .unwrap_or(0),
                    });
                }
            }
            if let Some(at) = o.rr_index {
                let rr = LittleEndian::read_u16(&row[at..]);
                if rr > 0 {
                    zone.play_logic = crate::model::PlayLogic::RoundRobin;
                    zone.rr_index = u32::from(rr);
                }
            }
            if !zone.sample.is_missing() {
                let frames = zone.sample.ensure_loaded()?.audio.frame_count;
                zone.conform_to_frames(frames);
                zone.sample.evict();
            }
            group.zones.push(zone);
        }
        source.groups.push(group);
        source.prune_empty_groups();
        Ok(vec![source])
    }
}

pub struct MaschineCreator;

impl PresetWriter for MaschineCreator {
    fn format(&self) -> FormatId {
        FormatId::Maschine
    }

    fn wants_combined_stereo(&self) -> bool {
        true
    }

    /// Writes the 0x0D layout: the fixed rows of a fresh template with the
    /// zones spliced in and every count recomputed.
    fn write(
        &self,
        ctx: &Context,
        source: &mut MultiSampleSource,
        dest_dir: &Path,
        taken: &mut HashSet<String>,
    ) -> Result<Vec<PathBuf>, ConvError> {
        let out_path = unique_output_path(dest_dir, &source.name, "mxsnd", taken);
        let samples_dir_name = format!("{} Samples", sanitize_file_name(&source.name));
        let samples_dir = dest_dir.join(&samples_dir_name);

        let mut out = Vec::new();
        write_u8_lstring(&mut out, ARCHIVE_MAGIC)?;
        write_varint(&mut out, ARCHIVE_VERSION)?;
        out.push(LAYOUT_SPLIT);
        write_u8_lstring(&mut out, &source.name)?;

        let globals = &GLOBALS_0D;
        let mut block = vec![0u8; globals.block_len];
        let env = source
            .zones()
            .map(|z| &z.amp_env.envelope)
            .find(|e| e.is_set())
            .cloned()
            .unwrap_or_default();
        let bend = source.zones().next().map(|z| z.bend_up.clamp(0, 9600) as i16).unwrap_or(200);
        LittleEndian::write_i16(&mut block[globals.pitch_bend..], bend);
        LittleEndian::write_f32(&mut block[globals.tuning..], 0.0);
        LittleEndian::write_f32(&mut block[globals.attack..], env.attack.unwrap_or(0.0) as f32);
        LittleEndian::write_f32(&mut block[globals.hold..], env.hold.unwrap_or(0.0) as f32);
        LittleEndian::write_f32(&mut block[globals.decay..], env.decay.unwrap_or(0.0) as f32);
        LittleEndian::write_f32(&mut block[globals.sustain..], env.sustain_level.unwrap_or(1.0) as f32);
        LittleEndian::write_f32(
            &mut block[globals.release..],
            env.release.unwrap_or(Envelope::default_release_for(source.metadata.category)) as f32,
        );
        match &source.global_filter {
            Some(filter) => {
                block[globals.filter_type] = match filter.filter_type {
                    FilterType::HighPass => 1,
                    FilterType::BandPass => 2,
                    _ => 0,
                };
                LittleEndian::write_f32(&mut block[globals.cutoff..], filter.cutoff_hz as f32);
                LittleEndian::write_f32(&mut block[globals.resonance..], filter.resonance as f32);
                LittleEndian::write_f32(&mut block[globals.velocity_to_cutoff..], filter.cutoff_velocity as f32);
            }
            None => {
                block[globals.filter_type] = 0xFF;
            }
        }
        let velocity_to_volume = source.zones().next().map(|z| z.amp_velocity).unwrap_or(0.0);
        LittleEndian::write_f32(&mut block[globals.velocity_to_volume..], velocity_to_volume as f32);
        out.extend_from_slice(&block);

        // Zone rows plus their path table, written side by side.
        let o = &ZONES_0D;
        let mut rows: Vec<Vec<u8>> = Vec::new();
        let mut sample_paths: Vec<String> = Vec::new();
        let mut entry_names: HashSet<String> = HashSet::new();
        let mut written = Vec::new();

        for group in &mut source.groups {
            ctx.cancellation.check()?;
            for zone in &mut group.zones {
                if zone.sample.is_missing() {
                    continue;
                }
                let mut file_name = format!("{}.wav", sanitize_file_name(&zone.name));
                let mut counter = 1;
                while !entry_names.insert(file_name.to_lowercase()) {
                    file_name = format!("{} ({}).wav", sanitize_file_name(&zone.name), counter);
                    counter += 1;
                }
                std::fs::create_dir_all(&samples_dir)?;
                let sample_path = samples_dir.join(&file_name);
                let bytes = crate::wav::zone_wav_bytes(ctx, zone, &source.metadata)?;
                std::fs::write(&sample_path, bytes)?;
                written.push(sample_path);
                zone.sample.evict();
                ctx.notifier.progress();

                let sample_index = sample_paths.len() as u16;
                sample_paths.push(format!("{}/{}", samples_dir_name, file_name));

                let mut row = vec![0u8; o.block_len];
                for (i, b) in zone.name.bytes().take(o.name_len - 1).enumerate() {
                    row[i] = b;
                }
                row[o.root] = zone.key_root_or(60);
                row[o.key_low] = zone.key_low_or(0);
                row[o.key_high] = zone.key_high_or(127);
                row[o.vel_low] = zone.vel_low;
                row[o.vel_high] = zone.vel_high;
                if let Some(at) = o.reversed {
                    row[at] = u8::from(zone.reversed);
                }
                LittleEndian::write_u32(&mut row[o.start..], zone.start as u32);
                LittleEndian::write_u32(&mut row[o.end..], zone.stop as u32);
                if let Some(l) = zone.loops.first() {
                    LittleEndian::write_u32(&mut row[o.loop_start..], l.start as u32);
                    LittleEndian::write_u32(&mut row[o.loop_end..], l.end as u32);
                    if let Some(at) = o.loop_crossfade {
                        LittleEndian::write_u32(&mut row[at..], l.crossfade_frames as u32);
                    }
                    row[o.loop_on] = 1;
                }
                LittleEndian::write_f32(&mut row[o.tune..], zone.tune as f32);
                LittleEndian::write_f32(&mut row[o.gain..], zone.gain as f32);
                LittleEndian::write_f32(&mut row[o.pan..], zone.panning as f32);
                LittleEndian::write_u16(&mut row[o.sample_index..], sample_index);
                if let Some(at) = o.rr_index {
                    let rr = if zone.play_logic == crate::model::PlayLogic::RoundRobin { zone.rr_index.max(1) } else { 0 };
                    LittleEndian::write_u16(&mut row[at..], rr as u16);
                }
                rows.push(row);
            }
        }

        if rows.is_empty() {
            return Err(ConvError::ConstraintViolation(format!("'{}' has no playable zones", source.name)));
        }

        write_varint(&mut out, rows.len() as u64)?;
        for row in &rows {
            out.extend_from_slice(row);
        }
        write_varint(&mut out, sample_paths.len() as u64)?;
        for path in &sample_paths {
            write_u8_lstring(&mut out, path)?;
        }
        write_u8_lstring(&mut out, source.metadata.creator.as_deref().unwrap_or(""))?;
        write_u8_lstring(&mut out, source.metadata.originator.as_deref().unwrap_or(""))?;
        write_u8_lstring(&mut out, source.metadata.description.as_deref().unwrap_or(""))?;

        std::fs::write(&out_path, out)?;
        written.insert(0, out_path);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Cancellation, MapSettings, NullNotifier};
    use crate::model::{AudioMetadata, PcmData};

    fn tone_zone(name: &str, root: u8) -> SampleZone {
        let frames = 24usize;
        let pcm = PcmData {
            audio: AudioMetadata { channels: 1, sample_rate: 44100, bits_per_sample: 16, frame_count: frames as u64, float: false },
            pcm: vec![0u8; frames * 2],
        };
        let mut zone = SampleZone::new(name, SampleData::Memory(pcm));
        zone.key_root = Some(root);
        zone.key_low = Some(root - 2);
        zone.key_high = Some(root + 2);
        zone.stop = frames as u64;
        zone
    }

    #[test]
    fn maschine_write_read_round_trip() {
        let dir = std::env::temp_dir().join(format!("maschine-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);

        let mut source = MultiSampleSource::new("Kit Sound");
        source.metadata.creator = Some("someone".to_string());
        let mut group = Group::new("");
        let mut zone = tone_zone("Snare", 50);
        zone.amp_env.envelope.attack = Some(0.005);
        zone.amp_env.envelope.release = Some(0.3);
        zone.loops.push(Loop { loop_type: LoopType::Forward, start: 2, end: 20, crossfade_frames: 1 });
        group.zones.push(zone);
        source.groups.push(group);

        let mut taken = HashSet::new();
        let written = MaschineCreator.write(&ctx, &mut source, &dir, &mut taken).unwrap();
        let back = &MaschineDetector.read(&ctx, &written[0]).unwrap()[0];
        assert_eq!(back.name, "Kit Sound");
        assert_eq!(back.metadata.creator.as_deref(), Some("someone"));
        let z = &back.groups[0].zones[0];
        assert_eq!(z.key_root, Some(50));
        assert_eq!(z.loops.len(), 1);
        assert_eq!(z.loops[0].crossfade_frames, 1);
        let attack = z.amp_env.envelope.attack.unwrap();
        assert!((attack - 0.005).abs() < 1e-6);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn non_archive_bytes_are_rejected() {
        let dir = std::env::temp_dir().join(format!("maschine-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nope.mxsnd");
        std::fs::write(&path, b"\x05hello rest").unwrap();
        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
        assert!(matches!(MaschineDetector.read(&ctx, &path), Err(ConvError::BadMagic { .. })));
        std::fs::remove_dir_all(&dir).ok();
    }
}
