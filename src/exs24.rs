use std::io::{Cursor, Read, Seek};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

use crate::binutils::read_fixed_ascii;
use crate::dtype::{ConvError, Context};
use crate::model::{Group, Loop, LoopType, MultiSampleSource, SampleData, SampleZone};
use crate::pipeline::{FormatId, PresetReader};

/// EXS24 instruments: a flat stream of fixed-header chunks. The byte
/// order follows the magic orientation (`TBOS` reads little-endian,
/// `SOBT` big-endian) and sample chunks carry absolute paths.

const CHUNK_HEADER: u8 = 0x00;
const CHUNK_ZONE: u8 = 0x01;
const CHUNK_GROUP: u8 = 0x02;
const CHUNK_SAMPLE: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExsEndian {
    Little,
    Big,
}

struct ExsChunk {
    kind: u8,
    name: String,
    data: Vec<u8>,
}

fn read_u32_at(data: &[u8], at: usize, endian: ExsEndian) -> u32 {
    match endian {
        ExsEndian::Little => LittleEndian::read_u32(&data[at..at + 4]),
        ExsEndian::Big => BigEndian::read_u32(&data[at..at + 4]),
    }
}

fn parse_chunks<R: Read + Seek>(reader: &mut R, file_name: &str) -> Result<(Vec<ExsChunk>, ExsEndian), ConvError> {
    let total = crate::binutils::stream_len(reader)?;
    let mut chunks = Vec::new();
    let mut endian = ExsEndian::Little;
    let mut first = true;
    while reader.stream_position()? + 84 <= total {
        let mut head = [0u8; 16];
        reader.read_exact(&mut head)?;
        let magic = &head[8..12];
        if first {
            endian = match magic {
                b"TBOS" => ExsEndian::Little,
                b"SOBT" => ExsEndian::Big,
                other => {
                    return Err(ConvError::BadMagic {
                        file: file_name.to_string(),
                        expected: *b"TBOS",
                        found: [other[0], other[1], other[2], other[3]],
                    });
                }
            };
            first = false;
        }
        let signature = match endian {
            ExsEndian::Little => LittleEndian::read_u32(&head[0..4]),
            ExsEndian::Big => BigEndian::read_u32(&head[0..4]),
        };
        let data_size = match endian {
            ExsEndian::Little => LittleEndian::read_u32(&head[4..8]),
            ExsEndian::Big => BigEndian::read_u32(&head[4..8]),
        } as usize;
        let name = read_fixed_ascii(reader, 64)?.trim().to_string();
        let mut data = vec![0u8; data_size];
        reader.read_exact(&mut data).map_err(|_| ConvError::Truncated {
            file: file_name.to_string(),
            offset: data_size as u64,
        })?;
        chunks.push(ExsChunk { kind: (signature & 0xFF) as u8, name, data });
    }
    Ok((chunks, endian))
}

pub struct Exs24Detector;

impl PresetReader for Exs24Detector {
    fn format(&self) -> FormatId {
        FormatId::Exs24
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["exs"]
    }

    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let file_name = path.display().to_string();
        let mut file = std::fs::File::open(path)?;
        let (chunks, endian) = parse_chunks(&mut file, &file_name)?;

        let instrument_name = chunks
            .iter()
            .find(|c| c.kind == CHUNK_HEADER)
            .map(|c| c.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| path.file_stem().and_then(|s| s.to_str()).unwrap_or("exs").to_string());
        let mut source = MultiSampleSource::new(&instrument_name);

        // Sample chunks: path bytes after the scalar block; the path is
        // absolute on the authoring machine.
        struct ExsSample {
            path: String,
        }
        let mut samples = Vec::new();
        for chunk in chunks.iter().filter(|c| c.kind == CHUNK_SAMPLE) {
            if chunk.data.len() < 16 {
                continue;
            }
            let mut cur = Cursor::new(&chunk.data[12..]);
            let sample_path = crate::binutils::read_fixed_ascii(&mut cur, chunk.data.len() - 12)?;
            let sample_path = sample_path.trim().to_string();
            samples.push(ExsSample { path: if sample_path.is_empty() { chunk.name.clone() } else { sample_path } });
        }

        let mut groups: Vec<Group> = chunks
            .iter()
            .filter(|c| c.kind == CHUNK_GROUP)
            .map(|c| Group::new(&c.name))
            .collect();
        if groups.is_empty() {
            groups.push(Group::new(""));
        }

        let dir = path.parent().unwrap_or(Path::new("."));
        for chunk in chunks.iter().filter(|c| c.kind == CHUNK_ZONE) {
            ctx.cancellation.check()?;
            if chunk.data.len() < 40 {
                continue;
            }
            let d = &chunk.data;
            let root = d[1].min(127);
            let fine = d[2] as i8;
            let pan = d[3] as i8;
            let volume = d[4] as i8;
            let key_low = d[5].min(127);
            let key_high = d[6].min(127);
            let vel_low = d[7].min(127);
            let vel_high = d[8].min(127);
            let start = read_u32_at(d, 12, endian);
            let end = read_u32_at(d, 16, endian);
            let loop_start = read_u32_at(d, 20, endian);
            let loop_end = read_u32_at(d, 24, endian);
            let loop_on = d[28] != 0;
            let group_index = read_u32_at(d, 32, endian) as usize;
            let sample_index = read_u32_at(d, 36, endian) as usize;

            let reference = samples.get(sample_index).map(|s| s.path.clone()).unwrap_or_default();
            let data = if reference.is_empty() {
                ctx.notifier.warn(&format!("SampleNotFound: zone '{}' has no sample entry", chunk.name));
                SampleData::Missing(chunk.name.clone())
            } else {
                match crate::locator::find_sample(&reference, dir, crate::locator::DEFAULT_SEARCH_DEPTH) {
                    Some(found) => SampleData::from_file(found),
                    None => {
                        ctx.notifier.warn(&format!("SampleNotFound: '{}'", reference));
                        SampleData::Missing(reference.clone())
                    }
                }
            };

            let mut zone = SampleZone::new(if chunk.name.is_empty() { "zone" } else { &chunk.name }, data);
            zone.key_root = Some(root);
            zone.key_low = Some(key_low);
            zone.key_high = Some(key_high.max(key_low));
            zone.vel_low = vel_low;
            zone.vel_high = vel_high.max(vel_low);
            zone.tune = f64::from(fine) / 100.0;
            zone.gain = f64::from(volume);
            zone.panning = (f64::from(pan) / 64.0).clamp(-1.0, 1.0);
            zone.start = u64::from(start);
            zone.stop = u64::from(end);
            if loop_on && loop_end > loop_start {
                zone.loops.push(Loop {
                    loop_type: LoopType::Forward,
                    start: u64::from(loop_start),
                    end: u64::from(loop_end),
                    crossfade_frames: 0,
                });
            }
            if !zone.sample.is_missing() {
                let frames = zone.sample.ensure_loaded()?.audio.frame_count;
                zone.conform_to_frames(frames);
                zone.sample.evict();
            }
            let index = group_index.min(groups.len() - 1);
            groups[index].zones.push(zone);
        }
        source.groups = groups;
        source.prune_empty_groups();
        Ok(vec![source])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Cancellation, MapSettings, NullNotifier};

    fn chunk_bytes(kind: u8, name: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&u32::from(kind).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(b"TBOS");
        out.extend_from_slice(&0u32.to_le_bytes());
        let mut name_bytes = vec![0u8; 64];
        for (i, b) in name.bytes().take(63).enumerate() {
            name_bytes[i] = b;
        }
        out.extend_from_slice(&name_bytes);
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn zones_parse_with_missing_samples_kept() {
        let dir = std::env::temp_dir().join(format!("exs-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut zone_data = vec![0u8; 40];
        zone_data[1] = 60; // root
        zone_data[5] = 48; // key low
        zone_data[6] = 72; // key high
        zone_data[7] = 0;
        zone_data[8] = 127;
        zone_data[28] = 1; // loop on
        zone_data[20..24].copy_from_slice(&100u32.to_le_bytes());
        zone_data[24..28].copy_from_slice(&900u32.to_le_bytes());
        zone_data[36..40].copy_from_slice(&0u32.to_le_bytes());

        let mut sample_data = vec![0u8; 12];
        sample_data.extend_from_slice(b"/absolute/gone/Piano C3.wav");

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&chunk_bytes(CHUNK_HEADER, "My EXS", &[0u8; 4]));
        bytes.extend_from_slice(&chunk_bytes(CHUNK_SAMPLE, "Piano C3.wav", &sample_data));
        bytes.extend_from_slice(&chunk_bytes(CHUNK_ZONE, "Z1", &zone_data));
        let path = dir.join("inst.exs");
        std::fs::write(&path, bytes).unwrap();

        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
        let sources = Exs24Detector.read(&ctx, &path).unwrap();
        assert_eq!(sources.len(), 1);
        let source = &sources[0];
        assert_eq!(source.name, "My EXS");
        assert_eq!(source.zone_count(), 1);
        let zone = &source.groups[0].zones[0];
        assert_eq!(zone.key_root, Some(60));
        assert_eq!(zone.key_low, Some(48));
        assert!(zone.sample.is_missing());
        assert_eq!(zone.loops[0].start, 100);

        std::fs::remove_dir_all(&dir).ok();
    }
}
