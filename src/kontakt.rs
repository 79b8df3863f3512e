use std::collections::HashSet;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::dtype::{ConvError, Context, ReadWrite, Settings as _};
use crate::fileutils::{sanitize_file_name, unique_output_path};
use crate::model::{
    Envelope, EnvelopeModulator, Filter, FilterType, Group, Loop, LoopType, MultiSampleSource,
    PlayLogic, SampleData, SampleZone,
};
use crate::pipeline::{FormatId, PresetReader, PresetWriter};

pub mod chunks;
pub mod k1;
pub mod k2;
pub mod monolith;

use chunks::{
    decompress_chunks, EnvelopeData, FileList, FilterData, GroupData, LoopData, PresetChunk,
    ProgramData, ZoneData, CHUNK_BANK, CHUNK_FILENAME_LIST, CHUNK_FILENAME_LIST_EX, CHUNK_FILTER,
    CHUNK_GROUP, CHUNK_GROUP_LIST, CHUNK_LOOP, CHUNK_PITCH_ENV, CHUNK_PROGRAM, CHUNK_VOLUME_ENV,
    CHUNK_ZONE, CHUNK_ZONE_LIST,
};
use monolith::Monolith;

/// Header magics of the five container generations.
const MAGIC_K1: u32 = 0xB36E_E55E;
const MAGIC_K2: u32 = 0x7FA8_9012;
const MAGIC_K42: u32 = 0x1087_4353;
const MAGIC_K5: u32 = 0xAB85_EF01;

const FLAG_ENCRYPTED: u8 = 0x01;

/// The five dialect families the reader dispatches across.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KontaktVersion {
    /// Kontakt 1.
    V1,
    /// Kontakt 1.5.
    V15,
    /// Kontakt 2 through 4.1: zlib XML.
    V2,
    /// Kontakt 4.2.2+: preset chunks with byte-string file table.
    V42,
    /// Kontakt 5 through 7: preset chunks with wide file table, monolith.
    V5,
}

struct Header {
    version: KontaktVersion,
    version_word: u16,
    encrypted: bool,
    payload_len: u32,
}

fn read_header<R: Read>(reader: &mut R, file_name: &str) -> Result<Header, ConvError> {
    let magic = reader.read_u32::<LittleEndian>()?;
    let version_word = reader.read_u16::<LittleEndian>()?;
    let flags = reader.read_u8()?;
    let payload_len = reader.read_u32::<LittleEndian>()?;
    let version = match magic {
        MAGIC_K1 if version_word < 0x0150 => KontaktVersion::V1,
        MAGIC_K1 => KontaktVersion::V15,
        MAGIC_K2 => KontaktVersion::V2,
        MAGIC_K42 => KontaktVersion::V42,
        MAGIC_K5 => KontaktVersion::V5,
        other => {
            return Err(ConvError::BadMagic {
                file: file_name.to_string(),
                expected: MAGIC_K5.to_le_bytes(),
                found: other.to_le_bytes(),
            });
        }
    };
    Ok(Header { version, version_word, encrypted: flags & FLAG_ENCRYPTED != 0, payload_len })
}

pub struct KontaktDetector;

impl PresetReader for KontaktDetector {
    fn format(&self) -> FormatId {
        FormatId::Kontakt
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["nki", "nkm"]
    }

    /// The per-file state machine: detect version, refuse encrypted,
    /// decompress, walk the program tree, resolve samples, build sources.
    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let file_name = path.display().to_string();
        let mut file = std::fs::File::open(path)?;
        let header = read_header(&mut file, &file_name)?;
        if header.encrypted {
            return Err(ConvError::EncryptedFile(file_name));
        }
        if header.version_word > 0x0700 {
            return Err(ConvError::UnsupportedVersion {
                file: file_name,
                version: format!("0x{:04X}", header.version_word),
            });
        }
        let mut compressed = vec![0u8; header.payload_len as usize];
        file.read_exact(&mut compressed).map_err(|_| ConvError::Truncated {
            file: file_name.clone(),
            offset: header.payload_len as u64,
        })?;

        match header.version {
            KontaktVersion::V1 | KontaktVersion::V15 => {
                let raw = crate::container::zlib_decompress(&compressed)?;
                let mut program = k1::K1Program::default();
                program.read_from_file(&mut Cursor::new(raw.as_slice()))?;
                Ok(vec![self.build_from_k1(ctx, &program, path)?])
            }
            KontaktVersion::V2 => {
                let raw = crate::container::zlib_decompress(&compressed)?;
                let container = k2::parse(&String::from_utf8_lossy(&raw))?;
                let mut sources = Vec::new();
                for program in &container.programs {
                    ctx.cancellation.check()?;
                    sources.push(self.build_from_k2(ctx, program, path)?);
                }
                Ok(sources)
            }
            KontaktVersion::V42 | KontaktVersion::V5 => {
                let top = decompress_chunks(&compressed)?;
                // A monolith directory may follow the compressed blob.
                let monolith = {
                    let at = file.stream_position()?;
                    match Monolith::parse(&mut file, &file_name) {
                        Ok(m) => Some(m),
                        Err(_) => {
                            file.seek(SeekFrom::Start(at))?;
                            None
                        }
                    }
                };
                let file_list = top
                    .iter()
                    .find(|c| c.id == CHUNK_FILENAME_LIST || c.id == CHUNK_FILENAME_LIST_EX)
                    .map(FileList::parse)
                    .transpose()?
                    .unwrap_or_default();

                let mut programs: Vec<&PresetChunk> = Vec::new();
                for chunk in &top {
                    if chunk.id == CHUNK_PROGRAM {
                        programs.push(chunk);
                    } else if chunk.id == CHUNK_BANK {
                        // An NKM bank nests one program per occupied slot.
                        programs.extend(chunk.find_all(CHUNK_PROGRAM));
                    }
                }
                if programs.is_empty() {
                    return Err(ConvError::UnexpectedChunk {
                        expected: format!("0x{:02X}", CHUNK_PROGRAM),
                        found: "no program chunk".to_string(),
                    });
                }
                let mut sources = Vec::new();
                for program in programs {
                    ctx.cancellation.check()?;
                    sources.push(self.build_from_chunks(ctx, program, &file_list, monolith.as_ref(), path)?);
                }
                Ok(sources)
            }
        }
    }
}

impl KontaktDetector {
    fn resolve_external(&self, ctx: &Context, reference: &str, preset_path: &Path) -> SampleData {
        let dir = preset_path.parent().unwrap_or(Path::new("."));
        let depth = ctx.settings.get_u32("kontaktSearchDepth", crate::locator::DEFAULT_SEARCH_DEPTH as u32) as usize;
        match crate::locator::find_sample(reference, dir, depth) {
            Some(found) => SampleData::from_file(found),
            None => {
                ctx.notifier.warn(&format!("SampleNotFound: '{}'", reference));
                SampleData::Missing(reference.to_string())
            }
        }
    }

    fn build_from_k1(
        &self,
        ctx: &Context,
        program: &k1::K1Program,
        path: &Path,
    ) -> Result<MultiSampleSource, ConvError> {
        let name = if program.name.is_empty() {
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("program")
        } else {
            &program.name
        };
        let mut source = MultiSampleSource::new(name);
        for k1_group in &program.groups {
            let mut group = Group::new(&k1_group.name);
            for k1_zone in &k1_group.zones {
                let data = self.resolve_external(ctx, &k1_zone.sample_path, path);
                let stem = Path::new(&k1_zone.sample_path.replace('\\', "/"))
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("zone")
                    .to_string();
                let mut zone = SampleZone::new(&stem, data);
                zone.key_low = Some(k1_zone.key_low.min(127));
                zone.key_high = Some(k1_zone.key_high.min(127));
                zone.key_root = Some(k1_zone.key_root.min(127));
                zone.vel_low = k1_zone.vel_low.min(127);
                zone.vel_high = k1_zone.vel_high.min(127);
                zone.start = u64::from(k1_zone.start);
                zone.stop = u64::from(k1_zone.end);
                zone.tune = f64::from(k1_zone.tune) + f64::from(program.tune);
                zone.gain = f64::from(k1_zone.gain_db) + f64::from(program.volume_db);
                zone.panning = f64::from(k1_zone.pan).clamp(-1.0, 1.0);
                zone.bend_up = i32::from(program.bend_up_cents);
                zone.bend_down = i32::from(program.bend_down_cents);
                zone.amp_env.envelope = Envelope {
                    attack: Some(f64::from(program.amp_env[0])),
                    hold: Some(f64::from(program.amp_env[1])),
                    decay: Some(f64::from(program.amp_env[2])),
                    sustain_level: Some(f64::from(program.amp_env[3]).clamp(0.0, 1.0)),
                    release: Some(f64::from(program.amp_env[4])),
                    ..Default::default()
                };
                if k1_group.play_mode == 1 {
                    zone.play_logic = PlayLogic::RoundRobin;
                }
                for l in &k1_zone.loops {
                    zone.loops.push(Loop {
                        loop_type: match l.mode {
                            2 => LoopType::Alternating,
                            3 => LoopType::Backward,
                            _ => LoopType::Forward,
                        },
                        start: u64::from(l.start),
                        end: u64::from(l.end),
                        crossfade_frames: u64::from(l.crossfade),
                    });
                }
                if !zone.sample.is_missing() {
                    let frames = zone.sample.ensure_loaded()?.audio.frame_count;
                    zone.conform_to_frames(frames);
                    zone.sample.evict();
                }
                group.zones.push(zone);
            }
            source.groups.push(group);
        }
        source.prune_empty_groups();
        Ok(source)
    }

    fn build_from_k2(
        &self,
        ctx: &Context,
        program: &k2::K2Program,
        path: &Path,
    ) -> Result<MultiSampleSource, ConvError> {
        let mut source = MultiSampleSource::new(&program.name);
        for k2_group in &program.groups {
            let mut group = Group::new(&k2_group.name);
            let round_robin = k2_group.play_mode == "round_robin";
            for (index, k2_zone) in k2_group.zones.iter().enumerate() {
                let data = self.resolve_external(ctx, &k2_zone.sample, path);
                let stem = Path::new(&k2_zone.sample.replace('\\', "/"))
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("zone")
                    .to_string();
                let mut zone = SampleZone::new(&stem, data);
                zone.key_low = Some(k2_zone.key_low.min(127));
                zone.key_high = Some(k2_zone.key_high.min(127));
                zone.key_root = Some(k2_zone.root.min(127));
                zone.vel_low = k2_zone.vel_low.min(127);
                zone.vel_high = k2_zone.vel_high.min(127);
                zone.start = k2_zone.start;
                zone.stop = k2_zone.end;
                zone.tune = k2_zone.tune + program.tune;
                zone.gain = k2_zone.gain_db + program.volume_db;
                zone.panning = k2_zone.pan.clamp(-1.0, 1.0);
                if round_robin {
                    zone.play_logic = PlayLogic::RoundRobin;
                    zone.rr_index = index as u32 + 1;
                }
                if let Some(env) = &program.amp_env {
                    zone.amp_env.envelope = k2_envelope(env);
                }
                if let Some(env) = &program.pitch_env {
                    zone.pitch_env = EnvelopeModulator { envelope: k2_envelope(env), depth: env.depth.clamp(-1.0, 1.0) };
                }
                for l in &k2_zone.loops {
                    zone.loops.push(Loop {
                        loop_type: match l.mode.as_str() {
                            "alternating" => LoopType::Alternating,
                            "backward" => LoopType::Backward,
                            _ => LoopType::Forward,
                        },
                        start: l.start,
                        end: l.end,
                        crossfade_frames: l.crossfade,
                    });
                }
                if !zone.sample.is_missing() {
                    let frames = zone.sample.ensure_loaded()?.audio.frame_count;
                    zone.conform_to_frames(frames);
                    zone.sample.evict();
                }
                group.zones.push(zone);
            }
            source.groups.push(group);
        }
        if let Some(f) = &program.filter {
            source.global_filter = Some(Filter {
                filter_type: match f.filter_type.as_str() {
                    "hp" => FilterType::HighPass,
                    "bp" => FilterType::BandPass,
                    "notch" => FilterType::Notch,
                    "lp1" => FilterType::LowPass1p,
                    _ => FilterType::LowPass,
                },
                cutoff_hz: f.cutoff_hz,
                resonance: f.resonance.clamp(0.0, 1.0),
                ..Default::default()
            });
        }
        source.prune_empty_groups();
        Ok(source)
    }

    fn build_from_chunks(
        &self,
        ctx: &Context,
        program: &PresetChunk,
        file_list: &FileList,
        monolith: Option<&Monolith>,
        path: &Path,
    ) -> Result<MultiSampleSource, ConvError> {
        let program_data = ProgramData::parse(&program.data)?;
        let name = if program_data.name.is_empty() {
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("program")
        } else {
            &program_data.name
        };
        let mut source = MultiSampleSource::new(name);

        let mut groups: Vec<Group> = Vec::new();
        let mut group_modes: Vec<u8> = Vec::new();
        if let Some(group_list) = program.find(CHUNK_GROUP_LIST) {
            for group_chunk in group_list.find_all(CHUNK_GROUP) {
                let data = GroupData::parse(&group_chunk.data)?;
                groups.push(Group::new(&data.name));
                group_modes.push(data.play_mode);
            }
        }
        if groups.is_empty() {
            groups.push(Group::new(""));
            group_modes.push(0);
        }

        let amp_env = program.find(CHUNK_VOLUME_ENV).map(|c| EnvelopeData::parse(&c.data)).transpose()?;
        let pitch_env = program.find(CHUNK_PITCH_ENV).map(|c| EnvelopeData::parse(&c.data)).transpose()?;
        let filter = program.find(CHUNK_FILTER).map(|c| FilterData::parse(&c.data)).transpose()?;

        if let Some(zone_list) = program.find(CHUNK_ZONE_LIST) {
            for zone_chunk in zone_list.find_all(CHUNK_ZONE) {
                ctx.cancellation.check()?;
                let zd = ZoneData::parse(&zone_chunk.data)?;
                let reference = file_list
                    .paths
                    .get(zd.sample_index.max(0) as usize)
                    .cloned()
                    .unwrap_or_default();

                // Monolith entries win over the external table.
                let data = if let Some(mono) = monolith {
                    match mono.find(&reference).cloned().or_else(|| mono.entries.get(zd.sample_index.max(0) as usize).cloned()) {
                        Some(entry) => {
                            let file = std::fs::File::open(path)?;
                            match mono.read_sample(file, &entry) {
                                Ok(pcm) => SampleData::Memory(pcm),
                                Err(e) => {
                                    ctx.notifier.warn(&format!("SampleNotFound: monolith '{}': {}", entry.name, e));
                                    SampleData::Missing(entry.name.clone())
                                }
                            }
                        }
                        None => self.resolve_external(ctx, &reference, path),
                    }
                } else if reference.is_empty() {
                    ctx.notifier.warn(&format!("SampleNotFound: zone index {} has no file entry", zd.sample_index));
                    SampleData::Missing(format!("sample #{}", zd.sample_index))
                } else {
                    self.resolve_external(ctx, &reference, path)
                };

                let stem = Path::new(&reference.replace('\\', "/"))
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("zone")
                    .to_string();
                let mut zone = SampleZone::new(&stem, data);
                zone.key_low = Some(zd.key_low.min(127));
                zone.key_high = Some(zd.key_high.min(127));
                zone.key_root = Some(zd.key_root.min(127));
                zone.vel_low = zd.vel_low.min(127);
                zone.vel_high = zd.vel_high.min(127);
                zone.start = u64::from(zd.start);
                zone.stop = u64::from(zd.end);
                zone.tune = f64::from(zd.tune) + f64::from(program_data.tune);
                zone.gain = f64::from(zd.gain_db) + f64::from(program_data.volume_db);
                zone.panning = f64::from(zd.pan).clamp(-1.0, 1.0);
                if let Some(env) = &amp_env {
                    zone.amp_env.envelope = chunk_envelope(env);
                }
                if let Some(env) = &pitch_env {
                    zone.pitch_env =
                        EnvelopeModulator { envelope: chunk_envelope(env), depth: f64::from(env.depth).clamp(-1.0, 1.0) };
                }
                if let Some(f) = &filter {
                    zone.bend_up = i32::from(f.bend_up_cents);
                    zone.bend_down = i32::from(f.bend_down_cents);
                }
                for loop_chunk in zone_chunk.find_all(CHUNK_LOOP) {
                    let ld = LoopData::parse(&loop_chunk.data)?;
                    if ld.mode == 0 {
                        continue;
                    }
                    zone.loops.push(Loop {
                        loop_type: match ld.mode {
                            2 => LoopType::Alternating,
                            3 => LoopType::Backward,
                            _ => LoopType::Forward,
                        },
                        start: u64::from(ld.start),
                        end: u64::from(ld.end),
                        crossfade_frames: u64::from(ld.crossfade),
                    });
                }
                let group_index = (zd.group_index as usize).min(groups.len() - 1);
                if group_modes[group_index] == 1 {
                    zone.play_logic = PlayLogic::RoundRobin;
                }
                if !zone.sample.is_missing() {
                    let frames = zone.sample.ensure_loaded()?.audio.frame_count;
                    zone.conform_to_frames(frames);
                    zone.sample.evict();
                }
                groups[group_index].zones.push(zone);
            }
        }

        if let Some(f) = filter {
            source.global_filter = Some(Filter {
                filter_type: match f.filter_type {
                    2 => FilterType::HighPass,
                    3 => FilterType::BandPass,
                    4 => FilterType::Notch,
                    5 => FilterType::LowPass1p,
                    _ => FilterType::LowPass,
                },
                poles: if f.filter_type == 1 { 4 } else { 2 },
                cutoff_hz: f64::from(f.cutoff_hz),
                resonance: f64::from(f.resonance).clamp(0.0, 1.0),
                ..Default::default()
            });
        }
        source.groups = groups;
        source.prune_empty_groups();
        Ok(source)
    }
}

fn chunk_envelope(env: &EnvelopeData) -> Envelope {
    Envelope {
        attack: Some(f64::from(env.attack)),
        hold: Some(f64::from(env.hold)),
        decay: Some(f64::from(env.decay)),
        sustain_level: Some(f64::from(env.sustain).clamp(0.0, 1.0)),
        release: Some(f64::from(env.release)),
        ..Default::default()
    }
}

fn k2_envelope(env: &k2::K2Envelope) -> Envelope {
    Envelope {
        attack: Some(env.attack),
        hold: Some(env.hold),
        decay: Some(env.decay),
        sustain_level: Some(env.sustain.clamp(0.0, 1.0)),
        release: Some(env.release),
        ..Default::default()
    }
}

/// Writes the Kontakt 1 dialect. The format has no metadata slot, so none
/// is written.
pub struct KontaktCreator;

impl PresetWriter for KontaktCreator {
    fn format(&self) -> FormatId {
        FormatId::Kontakt
    }

    fn write(
        &self,
        ctx: &Context,
        source: &mut MultiSampleSource,
        dest_dir: &Path,
        taken: &mut HashSet<String>,
    ) -> Result<Vec<PathBuf>, ConvError> {
        let out_path = unique_output_path(dest_dir, &source.name, "nki", taken);
        let samples_dir_name = "Samples".to_string();
        let samples_dir = dest_dir.join(&samples_dir_name);

        let shared_env = source
            .zones()
            .map(|z| &z.amp_env.envelope)
            .find(|e| e.is_set())
            .cloned()
            .unwrap_or_default();
        let mut program = k1::K1Program {
            name: source.name.clone(),
            volume_db: 0.0,
            tune: 0.0,
            amp_env: [
                shared_env.attack.unwrap_or(0.0) as f32,
                shared_env.hold.unwrap_or(0.0) as f32,
                shared_env.decay.unwrap_or(0.0) as f32,
                shared_env.sustain_level.unwrap_or(1.0) as f32,
                shared_env.release.unwrap_or(Envelope::default_release_for(source.metadata.category)) as f32,
            ],
            bend_up_cents: 200,
            bend_down_cents: -200,
            groups: Vec::new(),
        };
        if let Some(zone) = source.zones().next() {
            program.bend_up_cents = zone.bend_up.clamp(-9600, 9600) as i16;
            program.bend_down_cents = zone.bend_down.clamp(-9600, 9600) as i16;
        }

        let mut written = Vec::new();
        let mut entry_names: HashSet<String> = HashSet::new();
        for group in &mut source.groups {
            ctx.cancellation.check()?;
            let mut k1_group = k1::K1Group {
                name: group.name.clone(),
                play_mode: u8::from(group.zones.iter().any(|z| z.play_logic == PlayLogic::RoundRobin)),
                zones: Vec::new(),
            };
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

                k1_group.zones.push(k1::K1Zone {
                    sample_path: format!("{}/{}", samples_dir_name, file_name),
                    key_low: zone.key_low_or(0),
                    key_high: zone.key_high_or(127),
                    key_root: zone.key_root_or(60),
                    vel_low: zone.vel_low,
                    vel_high: zone.vel_high,
                    start: zone.start as u32,
                    end: zone.stop as u32,
                    tune: zone.tune as f32,
                    gain_db: zone.gain as f32,
                    pan: zone.panning as f32,
                    loops: zone
                        .loops
                        .iter()
                        .map(|l| k1::K1Loop {
                            mode: match l.loop_type {
                                LoopType::Forward => 1,
                                LoopType::Alternating => 2,
                                LoopType::Backward => 3,
                            },
                            start: l.start as u32,
                            end: l.end as u32,
                            crossfade: l.crossfade_frames as u32,
                        })
                        .collect(),
                });
            }
            if !k1_group.zones.is_empty() {
                program.groups.push(k1_group);
            }
        }

        if program.groups.is_empty() {
            return Err(ConvError::ConstraintViolation(format!("'{}' has no playable zones", source.name)));
        }

        let mut payload_out = Cursor::new(Vec::new());
        program.write_to_file(&mut payload_out)?;
        let payload = payload_out.into_inner();
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &payload)?;
        let compressed = encoder.finish()?;

        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(MAGIC_K1)?;
        out.write_u16::<LittleEndian>(0x0100)?;
        out.write_u8(0)?;
        out.write_u32::<LittleEndian>(compressed.len() as u32)?;
        out.extend_from_slice(&compressed);
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
        zone.key_low = Some(root - 1);
        zone.key_high = Some(root + 1);
        zone.stop = frames as u64;
        zone
    }

    #[test]
    fn kontakt1_write_read_round_trip() {
        let dir = std::env::temp_dir().join(format!("kontakt-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);

        let mut source = MultiSampleSource::new("K Piano");
        let mut group = Group::new("Main");
        let mut zone = tone_zone("C4", 60);
        zone.loops.push(Loop { loop_type: LoopType::Forward, start: 4, end: 20, crossfade_frames: 2 });
        group.zones.push(zone);
        group.zones.push(tone_zone("E4", 64));
        source.groups.push(group);

        let mut taken = HashSet::new();
        let written = KontaktCreator.write(&ctx, &mut source, &dir, &mut taken).unwrap();
        let nki = &written[0];
        assert_eq!(nki.extension().unwrap(), "nki");

        let sources = KontaktDetector.read(&ctx, nki).unwrap();
        assert_eq!(sources.len(), 1);
        let back = &sources[0];
        assert_eq!(back.name, "K Piano");
        assert_eq!(back.groups.len(), 1);
        assert_eq!(back.groups[0].zones.len(), 2);
        assert_eq!(back.groups[0].zones[0].key_root, Some(60));
        assert_eq!(back.groups[0].zones[0].loops.len(), 1);
        assert_eq!(back.groups[0].zones[0].loops[0].end, 20);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn encrypted_files_are_refused() {
        let dir = std::env::temp_dir().join(format!("kontakt-enc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC_K5.to_le_bytes());
        bytes.extend_from_slice(&0x0500u16.to_le_bytes());
        bytes.push(FLAG_ENCRYPTED);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let path = dir.join("locked.nki");
        std::fs::write(&path, bytes).unwrap();

        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
        assert!(matches!(
            KontaktDetector.read(&ctx, &path),
            Err(ConvError::EncryptedFile(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_magic_is_bad_magic() {
        let dir = std::env::temp_dir().join(format!("kontakt-magic-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("odd.nki");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
        assert!(matches!(KontaktDetector.read(&ctx, &path), Err(ConvError::BadMagic { .. })));
        std::fs::remove_dir_all(&dir).ok();
    }
}
