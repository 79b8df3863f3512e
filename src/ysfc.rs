use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};

use crate::binutils::{read_fixed_ascii, read_fourcc};
use crate::dtype::{ConvError, Context};
use crate::model::{
    AudioMetadata, Group, Loop, LoopType, MultiSampleSource, PcmData, SampleData, SampleZone,
};
use crate::pipeline::{FormatId, PresetReader};

/// Yamaha workstation libraries (Montage, MODX, MOXF, Motif): a
/// big-endian catalog of blocks; the waveform block carries key banks
/// whose 16-bit PCM lives at absolute offsets in the file. Read-only.

const MAGIC: &[u8; 16] = b"YAMAHA-YSFC\0\0\0\0\0";
const BLOCK_WAVEFORMS: [u8; 4] = *b"EWFM";

/// Families by header version word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YsfcFamily {
    MotifXs,
    Moxf,
    MontageModx,
}

fn family_of(version: u32) -> YsfcFamily {
    match version {
        v if v >= 0x0004_0000 => YsfcFamily::MontageModx,
        v if v >= 0x0001_0004 => YsfcFamily::Moxf,
        _ => YsfcFamily::MotifXs,
    }
}

#[derive(Debug, Clone)]
struct KeyBank {
    root: u8,
    key_low: u8,
    key_high: u8,
    vel_low: u8,
    vel_high: u8,
    channels: u8,
    sample_rate: u32,
    loop_start: u32,
    loop_end: u32,
    loop_on: bool,
    data_offset: u64,
    data_length: u64,
}

pub struct YsfcDetector;

impl PresetReader for YsfcDetector {
    fn format(&self) -> FormatId {
        FormatId::Ysfc
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["x7l", "x7u", "x8l", "x8u", "x6w", "x0w"]
    }

    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let file_name = path.display().to_string();
        let mut file = std::fs::File::open(path)?;

        let mut magic = [0u8; 16];
        file.read_exact(&mut magic)?;
        if &magic[..11] != &MAGIC[..11] {
            return Err(ConvError::BadMagic {
                file: file_name,
                expected: *b"YAMA",
                found: [magic[0], magic[1], magic[2], magic[3]],
            });
        }
        let version = file.read_u32::<BigEndian>()?;
        let family = family_of(version);

        let catalog_count = file.read_u32::<BigEndian>()?;
        let mut waveform_offset = None;
        for _ in 0..catalog_count {
            let id = read_fourcc(&mut file)?;
            let offset = file.read_u32::<BigEndian>()?;
            if id == BLOCK_WAVEFORMS {
                waveform_offset = Some(offset as u64);
            }
        }
        let waveform_offset = waveform_offset.ok_or_else(|| ConvError::UnexpectedChunk {
            expected: "EWFM".to_string(),
            found: "no waveform block in catalog".to_string(),
        })?;

        file.seek(SeekFrom::Start(waveform_offset))?;
        let block_id = read_fourcc(&mut file)?;
        if block_id != BLOCK_WAVEFORMS {
            return Err(ConvError::UnexpectedChunk {
                expected: "EWFM".to_string(),
                found: crate::binutils::fourcc_str(&block_id),
            });
        }
        let _block_len = file.read_u32::<BigEndian>()?;
        let waveform_count = file.read_u32::<BigEndian>()?;

        let mut catalog: Vec<(String, Vec<KeyBank>)> = Vec::with_capacity(waveform_count as usize);
        for _ in 0..waveform_count {
            let name_len = file.read_u8()? as usize;
            let name = read_fixed_ascii(&mut file, name_len)?;
            let bank_count = file.read_u32::<BigEndian>()?;
            let mut banks = Vec::with_capacity(bank_count as usize);
            for _ in 0..bank_count {
                let root = file.read_u8()?;
                let key_low = file.read_u8()?;
                let key_high = file.read_u8()?;
                let vel_low = file.read_u8()?;
                let vel_high = file.read_u8()?;
                let channels = file.read_u8()?;
                let _bits = file.read_u8()?;
                let _pad = file.read_u8()?;
                let sample_rate = file.read_u32::<BigEndian>()?;
                let loop_start = file.read_u32::<BigEndian>()?;
                let loop_end = file.read_u32::<BigEndian>()?;
                let loop_on = file.read_u8()? != 0;
                let mut pad = [0u8; 3];
                file.read_exact(&mut pad)?;
                let data_offset = u64::from(file.read_u32::<BigEndian>()?);
                let data_length = u64::from(file.read_u32::<BigEndian>()?);
                banks.push(KeyBank {
                    root,
                    key_low,
                    key_high,
                    vel_low,
                    vel_high,
                    channels: channels.max(1),
                    sample_rate,
                    loop_start,
                    loop_end,
                    loop_on,
                    data_offset,
                    data_length,
                });
            }
            catalog.push((name, banks));
        }

        // Extraction pass: one instrument per waveform, one zone per key
        // bank, PCM pulled and byte-flipped on demand.
        let mut sources = Vec::new();
        for (name, banks) in catalog {
            ctx.cancellation.check()?;
            let mut source = MultiSampleSource::new(name.trim());
            source.metadata.description = Some(match family {
                YsfcFamily::MontageModx => "Montage/MODX waveform".to_string(),
                YsfcFamily::Moxf => "MOXF waveform".to_string(),
                YsfcFamily::MotifXs => "Motif waveform".to_string(),
            });
            let mut group = Group::new("");
            for (index, bank) in banks.iter().enumerate() {
                ctx.cancellation.check()?;
                file.seek(SeekFrom::Start(bank.data_offset))?;
                let mut raw = vec![0u8; bank.data_length as usize];
                file.read_exact(&mut raw).map_err(|_| ConvError::Truncated {
                    file: path.display().to_string(),
                    offset: bank.data_offset,
                })?;
                // 16-bit words are big-endian in the container.
                let pcm_bytes: Vec<u8> = raw.chunks_exact(2).flat_map(|pair| [pair[1], pair[0]]).collect();
                let frames = pcm_bytes.len() as u64 / (2 * u64::from(bank.channels));
                let pcm = PcmData {
                    audio: AudioMetadata {
                        channels: u16::from(bank.channels),
                        sample_rate: bank.sample_rate,
                        bits_per_sample: 16,
                        frame_count: frames,
                        float: false,
                    },
                    pcm: pcm_bytes,
                };
                let mut zone = SampleZone::new(&format!("{} {}", source.name, index + 1), SampleData::Memory(pcm));
                zone.key_root = Some(bank.root.min(127));
                zone.key_low = Some(bank.key_low.min(127));
                zone.key_high = Some(bank.key_high.min(127));
                zone.vel_low = bank.vel_low.min(127);
                zone.vel_high = if bank.vel_high == 0 { 127 } else { bank.vel_high.min(127) };
                zone.stop = frames;
                if bank.loop_on && bank.loop_end > bank.loop_start {
                    zone.loops.push(Loop {
                        loop_type: LoopType::Forward,
                        start: u64::from(bank.loop_start),
                        end: u64::from(bank.loop_end).min(frames),
                        crossfade_frames: 0,
                    });
                }
                zone.conform_to_frames(frames);
                group.zones.push(zone);
            }
            source.groups.push(group);
            source.prune_empty_groups();
            if !source.groups.is_empty() {
                sources.push(source);
            }
        }
        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Cancellation, MapSettings, NullNotifier};
    use byteorder::WriteBytesExt;

    #[test]
    fn waveforms_extract_with_flipped_pcm() {
        let dir = std::env::temp_dir().join(format!("ysfc-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        // One waveform, one key bank, four frames of mono PCM.
        let mut pcm_be = Vec::new();
        for v in [100i16, -100, 200, -200] {
            pcm_be.extend_from_slice(&v.to_be_bytes());
        }

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes()); // waveform count
        body.push(5);
        body.extend_from_slice(b"Brass");
        body.extend_from_slice(&1u32.to_be_bytes()); // key bank count
        body.push(60); // root
        body.push(48);
        body.push(72);
        body.push(0);
        body.push(127);
        body.push(1); // channels
        body.push(16);
        body.push(0);
        body.extend_from_slice(&44100u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // loop start
        body.extend_from_slice(&0u32.to_be_bytes()); // loop end
        body.push(0); // loop off
        body.extend_from_slice(&[0u8; 3]);
        let data_offset = (16 + 4 + 4 + 8 + 4 + 4 + body.len() + 8) as u32;
        body.extend_from_slice(&data_offset.to_be_bytes());
        body.extend_from_slice(&(pcm_be.len() as u32).to_be_bytes());

        let mut file_bytes = Vec::new();
        file_bytes.extend_from_slice(MAGIC);
        file_bytes.write_u32::<BigEndian>(0x0004_0004).unwrap(); // Montage
        file_bytes.write_u32::<BigEndian>(1).unwrap(); // catalog count
        file_bytes.extend_from_slice(b"EWFM");
        let block_offset = (file_bytes.len() + 4) as u32;
        file_bytes.write_u32::<BigEndian>(block_offset).unwrap();
        file_bytes.extend_from_slice(b"EWFM");
        file_bytes.write_u32::<BigEndian>(body.len() as u32).unwrap();
        file_bytes.extend_from_slice(&body);
        file_bytes.extend_from_slice(&pcm_be);

        let path = dir.join("lib.x7l");
        std::fs::write(&path, file_bytes).unwrap();

        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
        let sources = YsfcDetector.read(&ctx, &path).unwrap();
        assert_eq!(sources.len(), 1);
        let source = &sources[0];
        assert_eq!(source.name, "Brass");
        let zone = &source.groups[0].zones[0];
        assert_eq!(zone.key_root, Some(60));
        if let SampleData::Memory(pcm) = &zone.sample {
            assert_eq!(pcm.audio.frame_count, 4);
            assert_eq!(i16::from_le_bytes([pcm.pcm[0], pcm.pcm[1]]), 100);
            assert_eq!(i16::from_le_bytes([pcm.pcm[2], pcm.pcm[3]]), -100);
        } else {
            panic!("sample should be in memory");
        }

        std::fs::remove_dir_all(&dir).ok();
    }
}
