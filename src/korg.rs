use std::collections::HashSet;
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::binutils::{fourcc_str, read_fixed_ascii, write_fixed_ascii};
use crate::dtype::{ConvError, Context, ReadWrite};
use crate::fileutils::{dos_name, unique_output_path};
use crate::model::{
    AudioMetadata, Group, Loop, LoopType, MultiSampleSource, PcmData, SampleData, SampleZone,
};
use crate::pipeline::{FormatId, PresetReader, PresetWriter};

/// Korg workstation multisamples: a `.KMP` bank of up to 128 zones, one
/// `.KSF` sample file per zone referenced by a 12-character DOS name, and
/// a `.KSC` manifest listing the banks of a library.

pub const MAX_ZONES: usize = 128;
const KSC_HEADER: &str = "#KORG Script Version 1.0";
/// Placeholder for a zone intentionally left without its own sample.
const SKIPPED_SAMPLE: &str = "SKIPPEDSAMPL";
/// Reference to a factory ROM sample that has no file on disk.
const INTERNAL_PREFIX: &str = "INTERNAL";

bitflags! {
    /// KSF attribute byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KsfAttributes: u8 {
        /// Playback applies a +12 dB boost.
        const BOOST_12DB = 0x01;
        const REVERSE = 0x02;
        const COMPRESSED = 0x04;
    }
}

/// One RLP1 zone record: 18 bytes, fixed.
#[derive(Debug, Clone, Default)]
struct KmpZoneRecord {
    /// Bit 7 set disables key tracking; low seven bits are the root note.
    original_key: u8,
    top_key: u8,
    /// -99..99 cents.
    tune: i8,
    /// -99..99, nonlinear level (see `level_to_db`).
    level: i8,
    /// 0 center, -64..63.
    pan: i8,
    sample_name: String,
}

/// The nonlinear level scale: 0 is unity, the extremes span roughly
/// +-12 dB with finer resolution near zero.
fn db_to_level(db: f64) -> i8 {
    let level = 99.0 * (10f64.powf(db / 40.0) - 1.0);
    level.round().clamp(-99.0, 99.0) as i8
}

fn level_to_db(level: i8) -> f64 {
    40.0 * (f64::from(level) / 99.0 + 1.0).max(0.01).log10()
}

fn read_chunk_header<R: Read>(reader: &mut R) -> Result<Option<([u8; 4], u32)>, ConvError> {
    let mut id = [0u8; 4];
    match reader.read_exact(&mut id) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let size = reader.read_u32::<BigEndian>()?;
    Ok(Some((id, size)))
}

fn write_chunk<W: Write>(writer: &mut W, id: &[u8; 4], payload: &[u8]) -> Result<usize, ConvError> {
    writer.write_all(id)?;
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    Ok(8 + payload.len())
}

/// Parsed KMP bank.
#[derive(Debug, Default)]
struct KmpFile {
    name: String,
    long_name: String,
    zones: Vec<KmpZoneRecord>,
}

impl ReadWrite for KmpFile {
    fn read_from_file<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), ConvError> {
        while let Some((id, size)) = read_chunk_header(reader)? {
            let mut payload = vec![0u8; size as usize];
            reader.read_exact(&mut payload).map_err(|_| ConvError::Truncated {
                file: "KMP".to_string(),
                offset: size as u64,
            })?;
            let mut cur = Cursor::new(payload.as_slice());
            match &id {
                b"MSP1" => {
                    self.name = read_fixed_ascii(&mut cur, 16)?.trim().to_string();
                    let count = cur.read_u8()? as usize;
                    let _attributes = cur.read_u8()?;
                    if count > MAX_ZONES {
                        return Err(ConvError::ConstraintViolation(format!(
                            "KMP '{}' claims {} zones; the format caps at {}",
                            self.name, count, MAX_ZONES
                        )));
                    }
                    self.zones.reserve(count);
                }
                b"NAME" => {
                    self.long_name = read_fixed_ascii(&mut cur, payload.len().min(24))?.trim().to_string();
                }
                b"RLP1" => {
                    while (cur.position() as usize) + 18 <= payload.len() {
                        let record = KmpZoneRecord {
                            original_key: cur.read_u8()?,
                            top_key: cur.read_u8()?,
                            tune: cur.read_i8()?,
                            level: cur.read_i8()?,
                            pan: cur.read_i8()?,
                            sample_name: read_fixed_ascii(&mut cur, 12)?.trim().to_string(),
                        };
                        let _reserved = cur.read_u8()?;
                        self.zones.push(record);
                    }
                }
                // Relative-parameter blocks 2 and 3 and the number chunk
                // carry nothing the model keeps.
                b"RLP2" | b"RLP3" | b"MNO1" => {}
                other => {
                    return Err(ConvError::UnexpectedChunk {
                        expected: "MSP1/NAME/RLP1/RLP2/RLP3/MNO1".to_string(),
                        found: fourcc_str(other),
                    });
                }
            }
        }
        Ok(())
    }

    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, ConvError> {
        let mut written = 0;
        let mut msp1 = Vec::new();
        write_fixed_ascii(&mut msp1, &self.name, 16, b' ')?;
        msp1.push(self.zones.len() as u8);
        msp1.push(0);
        written += write_chunk(writer, b"MSP1", &msp1)?;

        let mut name = Vec::new();
        write_fixed_ascii(&mut name, &self.long_name, 24, b' ')?;
        written += write_chunk(writer, b"NAME", &name)?;

        let mut rlp1 = Vec::new();
        for zone in &self.zones {
            rlp1.push(zone.original_key);
            rlp1.push(zone.top_key);
            rlp1.push(zone.tune as u8);
            rlp1.push(zone.level as u8);
            rlp1.push(zone.pan as u8);
            write_fixed_ascii(&mut rlp1, &zone.sample_name, 12, b' ')?;
            rlp1.push(0);
        }
        written += write_chunk(writer, b"RLP1", &rlp1)?;
        written += write_chunk(writer, b"RLP2", &vec![0u8; 24])?;
        written += write_chunk(writer, b"RLP3", &vec![0u8; 24])?;
        let mut mno1 = Vec::new();
        mno1.write_u32::<BigEndian>(1)?;
        written += write_chunk(writer, b"MNO1", &mno1)?;
        Ok(written)
    }
}

/// One KSF sample file.
#[derive(Debug, Default)]
struct KsfFile {
    name: String,
    sample_number: u32,
    attributes: KsfAttributes,
    /// Zero start and end mean no loop.
    loop_start: u32,
    loop_end: u32,
    pcm: PcmData,
}

impl ReadWrite for KsfFile {
    fn read_from_file<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), ConvError> {
        let mut saw_data = false;
        while let Some((id, size)) = read_chunk_header(reader)? {
            let mut payload = vec![0u8; size as usize];
            reader.read_exact(&mut payload).map_err(|_| ConvError::Truncated {
                file: "KSF".to_string(),
                offset: size as u64,
            })?;
            let mut cur = Cursor::new(payload.as_slice());
            match &id {
                b"SMP1" => {
                    self.name = read_fixed_ascii(&mut cur, 16)?.trim().to_string();
                    self.attributes = KsfAttributes::from_bits_truncate(cur.read_u8()?);
                    let _reserved = cur.read_u8()?;
                    self.loop_start = cur.read_u32::<BigEndian>()?;
                    self.loop_end = cur.read_u32::<BigEndian>()?;
                    if self.attributes.contains(KsfAttributes::COMPRESSED) {
                        return Err(ConvError::FeatureNotSupported(format!(
                            "KSF '{}' is compressed",
                            self.name
                        )));
                    }
                }
                b"SMD1" => {
                    let sample_rate = cur.read_u32::<BigEndian>()?;
                    let channels = cur.read_u8()? as u16;
                    let bits = cur.read_u8()? as u16;
                    let _reserved = cur.read_u16::<BigEndian>()?;
                    let frame_count = cur.read_u32::<BigEndian>()? as u64;
                    let mut data = Vec::new();
                    cur.read_to_end(&mut data)?;
                    // Sample words are big-endian on disk; flip to the
                    // engine's little-endian layout.
                    let le = if bits == 16 {
                        data.chunks_exact(2).flat_map(|pair| [pair[1], pair[0]]).collect()
                    } else {
                        data
                    };
                    self.pcm = PcmData {
                        audio: AudioMetadata {
                            channels: channels.max(1),
                            sample_rate,
                            bits_per_sample: bits,
                            frame_count,
                            float: false,
                        },
                        pcm: le,
                    };
                    saw_data = true;
                }
                b"SNO1" => {
                    self.sample_number = cur.read_u32::<BigEndian>()?;
                }
                b"SMP2" | b"NAME" => {}
                other => {
                    return Err(ConvError::UnexpectedChunk {
                        expected: "SMP1/SMP2/SMD1/SNO1/NAME".to_string(),
                        found: fourcc_str(other),
                    });
                }
            }
        }
        if !saw_data {
            return Err(ConvError::UnexpectedChunk {
                expected: "SMD1".to_string(),
                found: "missing".to_string(),
            });
        }
        Ok(())
    }

    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, ConvError> {
        let mut written = 0;
        let mut smp1 = Vec::new();
        write_fixed_ascii(&mut smp1, &self.name, 16, b' ')?;
        smp1.push(self.attributes.bits());
        smp1.push(0);
        smp1.write_u32::<BigEndian>(self.loop_start)?;
        smp1.write_u32::<BigEndian>(self.loop_end)?;
        written += write_chunk(writer, b"SMP1", &smp1)?;

        let mut smd1 = Vec::new();
        smd1.write_u32::<BigEndian>(self.pcm.audio.sample_rate)?;
        smd1.push(self.pcm.audio.channels as u8);
        smd1.push(self.pcm.audio.bits_per_sample as u8);
        smd1.write_u16::<BigEndian>(0)?;
        smd1.write_u32::<BigEndian>(self.pcm.audio.frame_count as u32)?;
        if self.pcm.audio.bits_per_sample == 16 {
            for pair in self.pcm.pcm.chunks_exact(2) {
                smd1.push(pair[1]);
                smd1.push(pair[0]);
            }
        } else {
            smd1.extend_from_slice(&self.pcm.pcm);
        }
        written += write_chunk(writer, b"SMD1", &smd1)?;

        let mut sno1 = Vec::new();
        sno1.write_u32::<BigEndian>(self.sample_number)?;
        written += write_chunk(writer, b"SNO1", &sno1)?;

        let mut name24 = Vec::new();
        write_fixed_ascii(&mut name24, &self.name, 24, b' ')?;
        written += write_chunk(writer, b"NAME", &name24)?;
        Ok(written)
    }
}

pub struct KorgDetector;

impl PresetReader for KorgDetector {
    fn format(&self) -> FormatId {
        FormatId::Korg
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["kmp"]
    }

    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let mut file = std::fs::File::open(path)?;
        let mut kmp = KmpFile::default();
        kmp.read_from_file(&mut file)?;
        let dir = path.parent().unwrap_or(Path::new("."));

        let display_name = if kmp.long_name.is_empty() { kmp.name.clone() } else { kmp.long_name.clone() };
        let mut source = MultiSampleSource::new(&display_name);
        let mut group = Group::new("");
        let mut key_low = 0u8;

        for record in &kmp.zones {
            ctx.cancellation.check()?;
            let root = record.original_key & 0x7F;
            let key_tracking_off = record.original_key & 0x80 != 0;

            let mut zone = if record.sample_name.eq_ignore_ascii_case(SKIPPED_SAMPLE) {
                let mut z = SampleZone::new(SKIPPED_SAMPLE, SampleData::Missing(SKIPPED_SAMPLE.to_string()));
                z.gain = -96.0;
                z
            } else if record.sample_name.to_uppercase().starts_with(INTERNAL_PREFIX) {
                ctx.notifier.warn(&format!(
                    "FeatureNotSupported: '{}' references the ROM sample {}",
                    path.display(),
                    record.sample_name
                ));
                SampleZone::new(&record.sample_name, SampleData::Missing(record.sample_name.clone()))
            } else {
                let ksf_name = format!("{}.KSF", record.sample_name);
                match crate::locator::find_sample(&ksf_name, dir, 2) {
                    Some(ksf_path) => {
                        let mut ksf_file = std::fs::File::open(&ksf_path)?;
                        let mut ksf = KsfFile::default();
                        ksf.read_from_file(&mut ksf_file)?;
                        let mut z = SampleZone::new(&record.sample_name, SampleData::Memory(ksf.pcm.clone()));
                        if ksf.attributes.contains(KsfAttributes::BOOST_12DB) {
                            z.gain += 12.0;
                        }
                        z.reversed = ksf.attributes.contains(KsfAttributes::REVERSE);
                        if ksf.loop_end > ksf.loop_start {
                            z.loops.push(Loop {
                                loop_type: LoopType::Forward,
                                start: ksf.loop_start as u64,
                                end: (ksf.loop_end as u64).min(ksf.pcm.audio.frame_count),
                                crossfade_frames: 0,
                            });
                        }
                        z.conform_to_frames(ksf.pcm.audio.frame_count);
                        z
                    }
                    None => {
                        ctx.notifier.warn(&format!("SampleNotFound: '{}'", ksf_name));
                        SampleZone::new(&record.sample_name, SampleData::Missing(ksf_name))
                    }
                }
            };

            zone.key_root = Some(root);
            zone.key_low = Some(key_low);
            zone.key_high = Some(record.top_key.min(127));
            zone.key_tracking = if key_tracking_off { 0.0 } else { 1.0 };
            zone.tune = f64::from(record.tune) / 100.0;
            zone.gain += level_to_db(record.level);
            zone.panning = (f64::from(record.pan) / 64.0).clamp(-1.0, 1.0);
            key_low = record.top_key.saturating_add(1).min(127);
            group.zones.push(zone);
        }
        source.groups.push(group);
        source.prune_empty_groups();
        Ok(vec![source])
    }
}

pub struct KorgCreator;

impl PresetWriter for KorgCreator {
    fn format(&self) -> FormatId {
        FormatId::Korg
    }

    fn wants_combined_stereo(&self) -> bool {
        true
    }

    fn write(
        &self,
        ctx: &Context,
        source: &mut MultiSampleSource,
        dest_dir: &Path,
        taken: &mut HashSet<String>,
    ) -> Result<Vec<PathBuf>, ConvError> {
        let mut written = Vec::new();
        let mut kmp_names: Vec<String> = Vec::new();
        let stereo = matches!(
            source.zone_channels()?,
            crate::model::ZoneChannels::Stereo | crate::model::ZoneChannels::Mixed
        );
        let multiple_groups = source.groups.len() > 1;
        let mut dos_taken: HashSet<String> = HashSet::new();
        let mut sample_number = 0u32;

        let group_count = source.groups.len();
        for group_index in 0..group_count {
            ctx.cancellation.check()?;
            let base = if multiple_groups {
                format!("{}{}", source.name, group_index + 1)
            } else {
                source.name.clone()
            };

            // A stereo source becomes an -L and an -R bank; mono emits one.
            let sides: &[(&str, usize)] = if stereo { &[("-L", 0), ("-R", 1)] } else { &[("", 0)] };
            for (suffix, channel) in sides {
                let bank_name = format!("{}{}", base, suffix);
                let mut zones: Vec<(SampleZone, PcmData)> = Vec::new();

                for zone in &mut source.groups[group_index].zones {
                    if zone.sample.is_missing() {
                        continue;
                    }
                    let pcm = zone.sample.ensure_loaded()?.clone();
                    // The workstation accepts 8/16-bit PCM up to 48 kHz.
                    let (converted, rate_change) = crate::audio::convert_to_format(
                        &pcm,
                        &crate::audio::DestinationAudioFormat {
                            bit_depths: vec![8, 16],
                            max_sample_rate: Some(48000),
                            allow_float: false,
                        },
                    )?;
                    let mut zone_copy = zone.clone();
                    if let Some((from, to)) = rate_change {
                        zone_copy.rescale_sample_positions(from, to);
                    }
                    let mono = if converted.audio.channels >= 2 {
                        let (left, right) = crate::audio::split_stereo(&converted)?;
                        if *channel == 0 { left } else { right }
                    } else {
                        converted
                    };
                    zone_copy.conform_to_frames(mono.audio.frame_count);
                    zones.push((zone_copy, mono));
                }

                if zones.is_empty() {
                    continue;
                }
                if zones.len() > MAX_ZONES {
                    ctx.notifier.warn(&format!(
                        "ConstraintViolation: '{}' has {} zones; keeping the first {}.",
                        bank_name,
                        zones.len(),
                        MAX_ZONES
                    ));
                    zones.truncate(MAX_ZONES);
                }
                // The workstation requires ascending top keys.
                zones.sort_by_key(|(zone, _)| zone.key_high_or(127));

                let mut kmp = KmpFile {
                    name: bank_name.chars().take(16).collect(),
                    long_name: bank_name.clone(),
                    zones: Vec::new(),
                };
                for (zone, pcm) in zones {
                    ctx.cancellation.check()?;
                    let sample_name = dos_name(&zone.name, &mut dos_taken);
                    let mut attributes = KsfAttributes::default();
                    if zone.reversed {
                        attributes |= KsfAttributes::REVERSE;
                    }
                    let mut gain = zone.gain;
                    if gain >= 12.0 {
                        attributes |= KsfAttributes::BOOST_12DB;
                        gain -= 12.0;
                    }
                    let (loop_start, loop_end) = zone
                        .loops
                        .first()
                        .map(|l| (l.start as u32, l.end.min(pcm.audio.frame_count) as u32))
                        .unwrap_or((0, 0));

                    let ksf = KsfFile {
                        name: sample_name.clone(),
                        sample_number,
                        attributes,
                        loop_start,
                        loop_end,
                        pcm,
                    };
                    let ksf_path = dest_dir.join(format!("{}.KSF", sample_name));
                    let mut ksf_file = crate::fileutils::open_file_overwrite_rw(&ksf_path)?;
                    ksf.write_to_file(&mut ksf_file)?;
                    sample_number += 1;
                    written.push(ksf_path);
                    ctx.notifier.progress();

                    kmp.zones.push(KmpZoneRecord {
                        original_key: zone.key_root_or(60) | if zone.key_tracking == 0.0 { 0x80 } else { 0 },
                        top_key: zone.key_high_or(127),
                        tune: (zone.tune * 100.0).round().clamp(-99.0, 99.0) as i8,
                        level: db_to_level(gain),
                        pan: (zone.panning * 64.0).round().clamp(-64.0, 63.0) as i8,
                        sample_name,
                    });
                }

                let kmp_path = unique_output_path(dest_dir, &bank_name, "KMP", taken);
                let kmp_file_name = kmp_path.file_name().and_then(|n| n.to_str()).unwrap_or("bank.KMP").to_string();
                let mut kmp_out = crate::fileutils::open_file_overwrite_rw(&kmp_path)?;
                kmp.write_to_file(&mut kmp_out)?;
                kmp_names.push(kmp_file_name);
                written.push(kmp_path);
            }
        }

        if kmp_names.is_empty() {
            return Err(ConvError::ConstraintViolation(format!("'{}' has no playable zones", source.name)));
        }

        // The manifest ties the banks into one loadable library.
        let ksc_path = unique_output_path(dest_dir, &source.name, "KSC", taken);
        let mut ksc = String::new();
        ksc.push_str(KSC_HEADER);
        ksc.push('\n');
        for name in &kmp_names {
            ksc.push_str(name);
            ksc.push('\n');
        }
        std::fs::write(&ksc_path, ksc)?;
        written.push(ksc_path);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Cancellation, MapSettings, NullNotifier};

    fn tone_zone(name: &str, root: u8, high: u8) -> SampleZone {
        let frames = 40usize;
        let mut pcm = Vec::new();
        for i in 0..frames {
            pcm.extend_from_slice(&((i as i16) * 100).to_le_bytes());
        }
        let data = PcmData {
            audio: AudioMetadata { channels: 1, sample_rate: 44100, bits_per_sample: 16, frame_count: frames as u64, float: false },
            pcm,
        };
        let mut zone = SampleZone::new(name, SampleData::Memory(data));
        zone.key_root = Some(root);
        zone.key_high = Some(high);
        zone.stop = frames as u64;
        zone
    }

    #[test]
    fn level_scale_is_monotonic_and_centered() {
        assert_eq!(db_to_level(0.0), 0);
        assert!(db_to_level(6.0) > 0);
        assert!(db_to_level(-6.0) < 0);
        for level in [-60i8, -12, 0, 12, 60] {
            let db = level_to_db(level);
            assert_eq!(db_to_level(db), level);
        }
    }

    #[test]
    fn kmp_zones_come_back_sorted_by_top_key() {
        let dir = std::env::temp_dir().join(format!("korg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);

        let mut source = MultiSampleSource::new("Keys");
        let mut group = Group::new("");
        // Deliberately unsorted.
        group.zones.push(tone_zone("High", 84, 96));
        group.zones.push(tone_zone("Low", 48, 60));
        source.groups.push(group);

        let mut taken = HashSet::new();
        let written = KorgCreator.write(&ctx, &mut source, &dir, &mut taken).unwrap();
        let kmp_path = written.iter().find(|p| p.extension().map(|e| e == "KMP").unwrap_or(false)).unwrap();
        let ksc_path = written.iter().find(|p| p.extension().map(|e| e == "KSC").unwrap_or(false)).unwrap();

        let ksc = std::fs::read_to_string(ksc_path).unwrap();
        assert!(ksc.starts_with(KSC_HEADER));
        assert!(ksc.contains("Keys.KMP"));

        let back = &KorgDetector.read(&ctx, kmp_path).unwrap()[0];
        let tops: Vec<u8> = back.groups[0].zones.iter().map(|z| z.key_high_or(0)).collect();
        let mut sorted = tops.clone();
        sorted.sort_unstable();
        assert_eq!(tops, sorted);
        assert_eq!(back.groups[0].zones[0].key_root, Some(48));
        // Lower bounds chain from the previous zone's top key.
        assert_eq!(back.groups[0].zones[1].key_low, Some(61));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn ksf_byte_flip_round_trips() {
        let frames = 8usize;
        let mut pcm_bytes = Vec::new();
        for i in 0..frames {
            pcm_bytes.extend_from_slice(&((i as i16) - 4).to_le_bytes());
        }
        let ksf = KsfFile {
            name: "TEST".to_string(),
            sample_number: 3,
            attributes: KsfAttributes::BOOST_12DB,
            loop_start: 2,
            loop_end: 6,
            pcm: PcmData {
                audio: AudioMetadata { channels: 1, sample_rate: 32000, bits_per_sample: 16, frame_count: frames as u64, float: false },
                pcm: pcm_bytes.clone(),
            },
        };
        let mut buf = Cursor::new(Vec::new());
        ksf.write_to_file(&mut buf).unwrap();
        buf.set_position(0);
        let mut back = KsfFile::default();
        back.read_from_file(&mut buf).unwrap();
        assert_eq!(back.pcm.pcm, pcm_bytes);
        assert_eq!(back.name, "TEST");
        assert_eq!(back.sample_number, 3);
        assert!(back.attributes.contains(KsfAttributes::BOOST_12DB));
        assert_eq!((back.loop_start, back.loop_end), (2, 6));
    }

    #[test]
    fn compressed_ksf_is_rejected() {
        let ksf = KsfFile {
            name: "X".to_string(),
            attributes: KsfAttributes::COMPRESSED,
            ..Default::default()
        };
        let mut buf = Cursor::new(Vec::new());
        ksf.write_to_file(&mut buf).unwrap();
        buf.set_position(0);
        let mut back = KsfFile::default();
        assert!(matches!(
            back.read_from_file(&mut buf),
            Err(ConvError::FeatureNotSupported(_))
        ));
    }
}
