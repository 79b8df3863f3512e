use std::io::{Cursor, Read, Seek, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::NaiveDateTime;

use crate::dtype::{ConvError, Settings as _};
use crate::model::{AudioMetadata, Loop, LoopType, Metadata, PcmData, SampleZone};
use crate::riff::{Chunk, ChunkTree};

pub const FORMAT_PCM: u16 = 0x0001;
pub const FORMAT_IEEE_FLOAT: u16 = 0x0003;
pub const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// PCM sub-format GUID used by WAVE_FORMAT_EXTENSIBLE.
const PCM_SUBTYPE_GUID: [u8; 16] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];
const FLOAT_SUBTYPE_GUID: [u8; 16] = [
    0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];

/// `fmt ` chunk. Tolerates writers that truncate the chunk after
/// `bits_per_sample` or leave `cbSize` short of the extension they wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmtChunk {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub avg_bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    pub valid_bits: u16,
    pub channel_mask: u32,
    pub sub_format: Option<[u8; 16]>,
}

impl FmtChunk {
    pub fn new(channels: u16, sample_rate: u32, bits: u16, float: bool) -> FmtChunk {
        let block_align = channels * (bits / 8);
        FmtChunk {
            format_tag: if float { FORMAT_IEEE_FLOAT } else { FORMAT_PCM },
            channels,
            sample_rate,
            avg_bytes_per_sec: sample_rate * block_align as u32,
            block_align,
            bits_per_sample: bits,
            valid_bits: bits,
            channel_mask: 0,
            sub_format: None,
        }
    }

    pub fn is_float(&self) -> bool {
        self.format_tag == FORMAT_IEEE_FLOAT
            || (self.format_tag == FORMAT_EXTENSIBLE && self.sub_format == Some(FLOAT_SUBTYPE_GUID))
    }

    /// The effective integer/float coding, with the extensible wrapper
    /// unwrapped.
    pub fn effective_format(&self) -> Result<u16, ConvError> {
        match self.format_tag {
            FORMAT_PCM | FORMAT_IEEE_FLOAT => Ok(self.format_tag),
            FORMAT_EXTENSIBLE => match self.sub_format {
                Some(PCM_SUBTYPE_GUID) => Ok(FORMAT_PCM),
                Some(FLOAT_SUBTYPE_GUID) => Ok(FORMAT_IEEE_FLOAT),
                _ => Err(ConvError::FeatureNotSupported("Extensible WAV with a non-PCM sub-format".to_string())),
            },
            other => Err(ConvError::FeatureNotSupported(format!("WAV format tag 0x{:04X}", other))),
        }
    }

    pub fn parse(data: &[u8]) -> Result<FmtChunk, ConvError> {
        if data.len() < 16 {
            return Err(ConvError::Truncated { file: "fmt ".to_string(), offset: data.len() as u64 });
        }
        let mut cur = Cursor::new(data);
        let mut fmt = FmtChunk {
            format_tag: cur.read_u16::<LittleEndian>()?,
            channels: cur.read_u16::<LittleEndian>()?,
            sample_rate: cur.read_u32::<LittleEndian>()?,
            avg_bytes_per_sec: cur.read_u32::<LittleEndian>()?,
            block_align: cur.read_u16::<LittleEndian>()?,
            bits_per_sample: cur.read_u16::<LittleEndian>()?,
            valid_bits: 0,
            channel_mask: 0,
            sub_format: None,
        };
        fmt.valid_bits = fmt.bits_per_sample;
        // cbSize and the extensible block; short counts are tolerated as
        // long as the bytes themselves are present.
        if data.len() >= 18 + 22 && fmt.format_tag == FORMAT_EXTENSIBLE {
            let _cb_size = cur.read_u16::<LittleEndian>()?;
            fmt.valid_bits = cur.read_u16::<LittleEndian>()?;
            fmt.channel_mask = cur.read_u32::<LittleEndian>()?;
            let mut guid = [0u8; 16];
            cur.read_exact(&mut guid)?;
            fmt.sub_format = Some(guid);
        }
        Ok(fmt)
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        out.extend_from_slice(&self.format_tag.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&self.avg_bytes_per_sec.to_le_bytes());
        out.extend_from_slice(&self.block_align.to_le_bytes());
        out.extend_from_slice(&self.bits_per_sample.to_le_bytes());
        if let Some(guid) = self.sub_format {
            out.extend_from_slice(&22u16.to_le_bytes());
            out.extend_from_slice(&self.valid_bits.to_le_bytes());
            out.extend_from_slice(&self.channel_mask.to_le_bytes());
            out.extend_from_slice(&guid);
        }
        out
    }
}

/// One `smpl` loop record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmplLoop {
    pub identifier: u32,
    /// 0 forward, 1 alternating, 2 backward.
    pub loop_type: u32,
    pub start: u32,
    /// Last played frame, inclusive.
    pub end: u32,
    pub fraction: u32,
    pub play_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmplChunk {
    pub manufacturer: u32,
    pub product: u32,
    pub sample_period: u32,
    pub midi_unity_note: u32,
    /// Fraction of a semitone above the unity note; 0x80000000 is 50 cents.
    pub midi_pitch_fraction: u32,
    pub smpte_format: u32,
    pub smpte_offset: u32,
    pub loops: Vec<SmplLoop>,
    pub sampler_data: Vec<u8>,
}

impl SmplChunk {
    pub fn parse(data: &[u8]) -> Result<SmplChunk, ConvError> {
        let mut cur = Cursor::new(data);
        let mut chunk = SmplChunk {
            manufacturer: cur.read_u32::<LittleEndian>()?,
            product: cur.read_u32::<LittleEndian>()?,
            sample_period: cur.read_u32::<LittleEndian>()?,
            midi_unity_note: cur.read_u32::<LittleEndian>()?,
            midi_pitch_fraction: cur.read_u32::<LittleEndian>()?,
            smpte_format: cur.read_u32::<LittleEndian>()?,
            smpte_offset: cur.read_u32::<LittleEndian>()?,
            loops: Vec::new(),
            sampler_data: Vec::new(),
        };
        let loop_count = cur.read_u32::<LittleEndian>()?;
        let sampler_bytes = cur.read_u32::<LittleEndian>()?;
        for _ in 0..loop_count {
            chunk.loops.push(SmplLoop {
                identifier: cur.read_u32::<LittleEndian>()?,
                loop_type: cur.read_u32::<LittleEndian>()?,
                start: cur.read_u32::<LittleEndian>()?,
                end: cur.read_u32::<LittleEndian>()?,
                fraction: cur.read_u32::<LittleEndian>()?,
                play_count: cur.read_u32::<LittleEndian>()?,
            });
        }
        let mut rest = Vec::new();
        cur.read_to_end(&mut rest)?;
        rest.truncate(sampler_bytes as usize);
        chunk.sampler_data = rest;
        Ok(chunk)
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(36 + self.loops.len() * 24);
        for v in [
            self.manufacturer,
            self.product,
            self.sample_period,
            self.midi_unity_note,
            self.midi_pitch_fraction,
            self.smpte_format,
            self.smpte_offset,
            self.loops.len() as u32,
            self.sampler_data.len() as u32,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for l in &self.loops {
            for v in [l.identifier, l.loop_type, l.start, l.end, l.fraction, l.play_count] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out.extend_from_slice(&self.sampler_data);
        out
    }

    /// Splits a fractional semitone tune across unity note and fraction.
    /// The fraction always encodes 0..99 cents upward; a negative tune
    /// borrows by raising the unity note one semitone.
    pub fn set_pitch(&mut self, root_note: u8, tune_semitones: f64) {
        let cents = (tune_semitones * 100.0).round() as i64;
        let mut note = root_note as i64 - cents / 100;
        let mut frac_cents = cents % 100;
        if frac_cents < 0 {
            frac_cents += 100;
            note += 1;
        }
        self.midi_unity_note = note.clamp(0, 127) as u32;
        self.midi_pitch_fraction = ((frac_cents as f64 / 100.0) * 4294967296.0).round().min(u32::MAX as f64) as u32;
    }

    /// Inverse of `set_pitch`: unity note plus 0..99-cent fraction back to
    /// a root note and fractional-semitone tune.
    pub fn pitch(&self) -> (u8, f64) {
        let frac_cents = (self.midi_pitch_fraction as f64 / 4294967296.0 * 100.0).round();
        let note = self.midi_unity_note.min(127) as u8;
        (note, frac_cents / 100.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstChunk {
    pub unshifted_note: u8,
    /// -50..50 cents.
    pub fine_tune: i8,
    /// -127..127 dB.
    pub gain: i8,
    pub low_note: u8,
    pub high_note: u8,
    pub low_velocity: u8,
    pub high_velocity: u8,
}

impl InstChunk {
    pub fn parse(data: &[u8]) -> Result<InstChunk, ConvError> {
        if data.len() < 7 {
            return Err(ConvError::Truncated { file: "inst".to_string(), offset: data.len() as u64 });
        }
        Ok(InstChunk {
            unshifted_note: data[0],
            fine_tune: data[1] as i8,
            gain: data[2] as i8,
            low_note: data[3],
            high_note: data[4],
            low_velocity: data[5],
            high_velocity: data[6],
        })
    }
    pub fn emit(&self) -> Vec<u8> {
        vec![
            self.unshifted_note,
            self.fine_tune as u8,
            self.gain as u8,
            self.low_note,
            self.high_note,
            self.low_velocity,
            self.high_velocity,
        ]
    }
}

/// Broadcast Audio Extension chunk, the free-form producer metadata slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BextChunk {
    pub description: String,
    pub originator: String,
    pub originator_reference: String,
    pub origination_date: String,
    pub origination_time: String,
    pub time_reference: u64,
    pub version: u16,
}

impl BextChunk {
    pub fn parse(data: &[u8]) -> Result<BextChunk, ConvError> {
        if data.len() < 348 {
            return Err(ConvError::Truncated { file: "bext".to_string(), offset: data.len() as u64 });
        }
        let field = |range: std::ops::Range<usize>| -> String {
            let raw = &data[range];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[..end]).into_owned()
        };
        let mut cur = Cursor::new(&data[338..]);
        Ok(BextChunk {
            description: field(0..256),
            originator: field(256..288),
            originator_reference: field(288..320),
            origination_date: field(320..330),
            origination_time: field(330..338),
            time_reference: cur.read_u64::<LittleEndian>()?,
            version: cur.read_u16::<LittleEndian>()?,
        })
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut out = vec![0u8; 602];
        let put = |out: &mut Vec<u8>, offset: usize, len: usize, value: &str| {
            for (i, b) in value.bytes().take(len).enumerate() {
                out[offset + i] = b;
            }
        };
        put(&mut out, 0, 256, &self.description);
        put(&mut out, 256, 32, &self.originator);
        put(&mut out, 288, 32, &self.originator_reference);
        put(&mut out, 320, 10, &self.origination_date);
        put(&mut out, 330, 8, &self.origination_time);
        out[338..346].copy_from_slice(&self.time_reference.to_le_bytes());
        out[346..348].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    pub fn set_date(&mut self, when: NaiveDateTime) {
        self.origination_date = when.format("%Y-%m-%d").to_string();
        self.origination_time = when.format("%H:%M:%S").to_string();
    }
}

/// A parsed WAV file: the chunk tree plus typed accessors over the chunks
/// the conversion core interprets.
#[derive(Debug, Clone)]
pub struct WavFile {
    pub tree: ChunkTree,
    pub fmt: FmtChunk,
}

impl WavFile {
    pub fn parse<R: Read + Seek>(reader: &mut R, file_name: &str) -> Result<WavFile, ConvError> {
        let tree = ChunkTree::parse(reader, file_name)?;
        if tree.root.form != Some(*b"WAVE") {
            return Err(ConvError::BadMagic {
                file: file_name.to_string(),
                expected: *b"WAVE",
                found: tree.root.form.unwrap_or([0; 4]),
            });
        }
        let fmt_chunk = tree.root.find(*b"fmt ").ok_or_else(|| ConvError::UnexpectedChunk {
            expected: "fmt ".to_string(),
            found: "missing".to_string(),
        })?;
        let fmt = FmtChunk::parse(&fmt_chunk.data)?;
        Ok(WavFile { tree, fmt })
    }

    pub fn from_pcm(pcm: &PcmData) -> WavFile {
        let fmt = FmtChunk::new(pcm.audio.channels, pcm.audio.sample_rate, pcm.audio.bits_per_sample, pcm.audio.float);
        let mut tree = ChunkTree::new_riff(*b"WAVE");
        tree.root.children.push(Chunk::leaf(*b"fmt ", fmt.emit()));
        tree.root.children.push(Chunk::leaf(*b"data", pcm.pcm.clone()));
        WavFile { tree, fmt }
    }

    pub fn audio_metadata(&self) -> Result<AudioMetadata, ConvError> {
        let data = self.data()?;
        let bytes_per_frame = self.fmt.block_align.max(1) as u64;
        Ok(AudioMetadata {
            channels: self.fmt.channels,
            sample_rate: self.fmt.sample_rate,
            bits_per_sample: self.fmt.bits_per_sample,
            frame_count: data.len() as u64 / bytes_per_frame,
            float: self.fmt.is_float(),
        })
    }

    pub fn data(&self) -> Result<&[u8], ConvError> {
        self.tree
            .root
            .find(*b"data")
            .map(|c| c.data.as_slice())
            .ok_or_else(|| ConvError::UnexpectedChunk { expected: "data".to_string(), found: "missing".to_string() })
    }

    pub fn pcm(&self) -> Result<PcmData, ConvError> {
        self.fmt.effective_format()?;
        Ok(PcmData { audio: self.audio_metadata()?, pcm: self.data()?.to_vec() })
    }

    pub fn smpl(&self) -> Option<SmplChunk> {
        self.tree.root.find(*b"smpl").and_then(|c| SmplChunk::parse(&c.data).ok())
    }
    pub fn inst(&self) -> Option<InstChunk> {
        self.tree.root.find(*b"inst").and_then(|c| InstChunk::parse(&c.data).ok())
    }
    pub fn bext(&self) -> Option<BextChunk> {
        self.tree.root.find(*b"bext").and_then(|c| BextChunk::parse(&c.data).ok())
    }

    pub fn set_smpl(&mut self, smpl: &SmplChunk) {
        self.tree.root.replace(*b"smpl", smpl.emit());
    }
    pub fn set_inst(&mut self, inst: &InstChunk) {
        self.tree.root.replace(*b"inst", inst.emit());
    }
    pub fn set_bext(&mut self, bext: &BextChunk) {
        // bext conventionally sits before fmt.
        if self.tree.root.find(*b"bext").is_some() {
            self.tree.root.replace(*b"bext", bext.emit());
        } else {
            self.tree.root.insert_before(*b"fmt ", Chunk::leaf(*b"bext", bext.emit()));
        }
    }

    /// LIST/INFO pairs (`INAM`, `IART`, `ICMT`, `ICRD`, ...), NUL-trimmed.
    pub fn info(&self) -> Vec<([u8; 4], String)> {
        match self.tree.root.find_list(*b"INFO") {
            Some(list) => list
                .children
                .iter()
                .map(|c| {
                    let end = c.data.iter().position(|&b| b == 0).unwrap_or(c.data.len());
                    (c.id, String::from_utf8_lossy(&c.data[..end]).into_owned())
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn info_value(&self, id: [u8; 4]) -> Option<String> {
        self.info().into_iter().find(|(i, _)| *i == id).map(|(_, v)| v)
    }

    /// Replaces the LIST/INFO block with the given pairs.
    pub fn set_info(&mut self, entries: &[([u8; 4], &str)]) {
        self.tree.root.children.retain(|c| !(c.id == crate::riff::LIST && c.form == Some(*b"INFO")));
        if entries.is_empty() {
            return;
        }
        let mut list = Chunk::container(crate::riff::LIST, *b"INFO");
        for (id, value) in entries {
            let mut data: Vec<u8> = value.bytes().collect();
            data.push(0);
            list.children.push(Chunk::leaf(*id, data));
        }
        self.tree.root.children.push(list);
    }

    pub fn remove_junk(&mut self) {
        self.tree.root.remove(&[*b"JUNK", *b"junk", *b"FLLR", *b"MD5 "]);
    }

    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, ConvError> {
        self.tree.emit(writer)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ConvError> {
        self.tree.emit_to_vec()
    }
}

/// Flags for the sample rewriting path; each destination codec exposes the
/// subset it supports as user options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkUpdateOptions {
    pub add_smpl: bool,
    pub add_inst: bool,
    pub add_bext: bool,
    pub remove_junk: bool,
    pub trim_to_zone: bool,
}

/// Produces the WAV bytes for one zone, applying the rewrite path: trim to
/// the playback window, refresh smpl/inst/bext, drop padding chunks.
/// Mutates the zone so its positions match the written audio.
pub fn rewrite_zone_sample(
    zone: &mut SampleZone,
    metadata: &Metadata,
    pcm: &PcmData,
    options: ChunkUpdateOptions,
) -> Result<Vec<u8>, ConvError> {
    let mut pcm = pcm.clone();
    if options.trim_to_zone {
        let bpf = pcm.audio.bytes_per_frame();
        let start = (zone.start * bpf).min(pcm.pcm.len() as u64) as usize;
        let stop = (zone.stop * bpf).min(pcm.pcm.len() as u64) as usize;
        if start < stop {
            pcm.pcm = pcm.pcm[start..stop].to_vec();
            pcm.audio.frame_count = (stop - start) as u64 / bpf;
            let offset = zone.start;
            zone.stop -= offset;
            zone.start = 0;
            for l in &mut zone.loops {
                l.start = l.start.saturating_sub(offset);
                l.end = l.end.saturating_sub(offset);
            }
        }
    }

    let mut wav = WavFile::from_pcm(&pcm);
    if options.add_smpl {
        let mut smpl = SmplChunk {
            sample_period: if pcm.audio.sample_rate > 0 { 1_000_000_000 / pcm.audio.sample_rate } else { 0 },
            ..Default::default()
        };
        smpl.set_pitch(zone.key_root_or(60), zone.tune);
        for (i, l) in zone.loops.iter().enumerate() {
            smpl.loops.push(SmplLoop {
                identifier: i as u32,
                loop_type: loop_type_to_smpl(l.loop_type),
                start: l.start as u32,
                end: (l.end.saturating_sub(1)) as u32,
                fraction: 0,
                play_count: 0,
            });
        }
        wav.set_smpl(&smpl);
    }
    if options.add_inst {
        wav.set_inst(&InstChunk {
            unshifted_note: zone.key_root_or(60),
            fine_tune: (zone.tune.fract() * 100.0).round().clamp(-50.0, 50.0) as i8,
            gain: zone.gain.round().clamp(-127.0, 127.0) as i8,
            low_note: zone.key_low_or(0),
            high_note: zone.key_high_or(127),
            low_velocity: zone.vel_low,
            high_velocity: zone.vel_high,
        });
    }
    if options.add_bext {
        let mut bext = BextChunk {
            description: metadata.description.clone().unwrap_or_default(),
            originator: metadata.creator.clone().unwrap_or_default(),
            version: 1,
            ..Default::default()
        };
        if let Some(date) = metadata.creation_date {
            bext.set_date(date);
        }
        wav.set_bext(&bext);
    }
    if options.remove_junk {
        wav.remove_junk();
    }
    wav.to_bytes()
}

/// Builds the WAV image for one zone the way every WAV-emitting
/// destination does: through the rewrite path, honoring the shared
/// chunk-update options.
pub fn zone_wav_bytes(
    ctx: &crate::dtype::Context,
    zone: &mut SampleZone,
    metadata: &Metadata,
) -> Result<Vec<u8>, ConvError> {
    let options = ChunkUpdateOptions {
        add_smpl: ctx.settings.get_bool("addSmplChunk", false),
        add_inst: ctx.settings.get_bool("addInstChunk", false),
        add_bext: ctx.settings.get_bool("addBextChunk", false),
        remove_junk: ctx.settings.get_bool("removeJunkChunks", true),
        trim_to_zone: ctx.settings.get_bool("trimToZone", false),
    };
    let pcm = zone.sample.ensure_loaded()?.clone();
    rewrite_zone_sample(zone, metadata, &pcm, options)
}

pub fn loop_type_to_smpl(t: LoopType) -> u32 {
    match t {
        LoopType::Forward => 0,
        LoopType::Alternating => 1,
        LoopType::Backward => 2,
    }
}

pub fn loop_type_from_smpl(v: u32) -> LoopType {
    match v {
        1 => LoopType::Alternating,
        2 => LoopType::Backward,
        _ => LoopType::Forward,
    }
}

/// Projects a parsed WAV's instrument chunks onto a zone: key/velocity
/// window and tuning from `inst`, root and loops from `smpl`.
pub fn apply_wav_chunks_to_zone(wav: &WavFile, zone: &mut SampleZone) {
    if let Some(inst) = wav.inst() {
        zone.key_root = Some(inst.unshifted_note.min(127));
        zone.key_low = Some(inst.low_note.min(127));
        zone.key_high = Some(inst.high_note.min(127));
        zone.vel_low = inst.low_velocity.min(127);
        zone.vel_high = if inst.high_velocity == 0 { 127 } else { inst.high_velocity.min(127) };
        zone.tune = inst.fine_tune as f64 / 100.0;
        zone.gain = inst.gain as f64;
    }
    if let Some(smpl) = wav.smpl() {
        let (root, tune) = smpl.pitch();
        if zone.key_root.is_none() {
            zone.key_root = Some(root);
            zone.tune = tune;
        }
        for l in &smpl.loops {
            zone.loops.push(Loop {
                loop_type: loop_type_from_smpl(l.loop_type),
                start: l.start as u64,
                // smpl end is the last played frame.
                end: l.end as u64 + 1,
                crossfade_frames: 0,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SampleData;

    fn mono_pcm(frames: usize) -> PcmData {
        let mut pcm = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            pcm.extend_from_slice(&(i as i16).to_le_bytes());
        }
        PcmData {
            audio: AudioMetadata { channels: 1, sample_rate: 44100, bits_per_sample: 16, frame_count: frames as u64, float: false },
            pcm,
        }
    }

    #[test]
    fn wav_emit_parse_round_trip_preserves_audio() {
        let pcm = mono_pcm(64);
        let wav = WavFile::from_pcm(&pcm);
        let bytes = wav.to_bytes().unwrap();
        let mut cur = Cursor::new(&bytes);
        let back = WavFile::parse(&mut cur, "mem").unwrap();
        assert_eq!(back.audio_metadata().unwrap(), pcm.audio);
        assert_eq!(back.data().unwrap(), pcm.pcm.as_slice());
        // Structural idempotence: parse then emit with no flag changes.
        assert_eq!(back.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn smpl_pitch_split_handles_negative_fine_tune() {
        let mut smpl = SmplChunk::default();
        // -30 cents: the unity note borrows a semitone and the fraction
        // carries the remaining 70 cents.
        smpl.set_pitch(60, -0.30);
        assert_eq!(smpl.midi_unity_note, 61);
        let cents = (smpl.midi_pitch_fraction as f64 / 4294967296.0 * 100.0).round();
        assert_eq!(cents, 70.0);
    }

    #[test]
    fn smpl_pitch_zero_tune_is_exact() {
        let mut smpl = SmplChunk::default();
        smpl.set_pitch(48, 0.0);
        assert_eq!(smpl.midi_unity_note, 48);
        assert_eq!(smpl.midi_pitch_fraction, 0);
    }

    #[test]
    fn smpl_chunk_binary_round_trip() {
        let chunk = SmplChunk {
            manufacturer: 0,
            product: 0,
            sample_period: 22675,
            midi_unity_note: 60,
            midi_pitch_fraction: 0,
            smpte_format: 0,
            smpte_offset: 0,
            loops: vec![SmplLoop { identifier: 0, loop_type: 1, start: 100, end: 999, fraction: 0, play_count: 0 }],
            sampler_data: vec![],
        };
        let back = SmplChunk::parse(&chunk.emit()).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn inst_chunk_round_trip_with_negative_tune() {
        let inst = InstChunk {
            unshifted_note: 64,
            fine_tune: -25,
            gain: -6,
            low_note: 60,
            high_note: 72,
            low_velocity: 1,
            high_velocity: 127,
        };
        assert_eq!(InstChunk::parse(&inst.emit()).unwrap(), inst);
    }

    #[test]
    fn bext_round_trip_keeps_strings_and_date() {
        let mut bext = BextChunk {
            description: "A piano".to_string(),
            originator: "someone".to_string(),
            version: 1,
            ..Default::default()
        };
        bext.set_date(NaiveDateTime::parse_from_str("2024-03-01 10:20:30", "%Y-%m-%d %H:%M:%S").unwrap());
        let back = BextChunk::parse(&bext.emit()).unwrap();
        assert_eq!(back.description, "A piano");
        assert_eq!(back.origination_date, "2024-03-01");
        assert_eq!(back.origination_time, "10:20:30");
    }

    #[test]
    fn list_info_round_trips() {
        let mut wav = WavFile::from_pcm(&mono_pcm(8));
        wav.set_info(&[(*b"INAM", "Warm Keys"), (*b"IART", "someone")]);
        let bytes = wav.to_bytes().unwrap();
        let back = WavFile::parse(&mut Cursor::new(&bytes), "mem").unwrap();
        assert_eq!(back.info_value(*b"INAM").as_deref(), Some("Warm Keys"));
        assert_eq!(back.info_value(*b"IART").as_deref(), Some("someone"));
        assert_eq!(back.info_value(*b"ICMT"), None);
    }

    #[test]
    fn trim_to_zone_shifts_positions() {
        let pcm = mono_pcm(100);
        let mut zone = SampleZone::new("z", SampleData::Memory(pcm.clone()));
        zone.start = 10;
        zone.stop = 60;
        zone.loops.push(Loop { loop_type: LoopType::Forward, start: 20, end: 60, crossfade_frames: 0 });
        let options = ChunkUpdateOptions { trim_to_zone: true, ..Default::default() };
        let bytes = rewrite_zone_sample(&mut zone, &Metadata::default(), &pcm, options).unwrap();
        assert_eq!(zone.start, 0);
        assert_eq!(zone.stop, 50);
        assert_eq!(zone.loops[0].start, 10);
        assert_eq!(zone.loops[0].end, 50);
        let mut cur = Cursor::new(&bytes);
        let wav = WavFile::parse(&mut cur, "mem").unwrap();
        assert_eq!(wav.audio_metadata().unwrap().frame_count, 50);
    }

    #[test]
    fn zone_projection_reads_inst_and_smpl() {
        let pcm = mono_pcm(100);
        let mut wav = WavFile::from_pcm(&pcm);
        wav.set_inst(&InstChunk {
            unshifted_note: 62,
            fine_tune: 10,
            gain: 0,
            low_note: 60,
            high_note: 64,
            low_velocity: 0,
            high_velocity: 127,
        });
        let mut smpl = SmplChunk::default();
        smpl.loops.push(SmplLoop { identifier: 0, loop_type: 0, start: 10, end: 89, fraction: 0, play_count: 0 });
        wav.set_smpl(&smpl);
        let mut zone = SampleZone::new("z", SampleData::Memory(pcm));
        apply_wav_chunks_to_zone(&wav, &mut zone);
        assert_eq!(zone.key_root, Some(62));
        assert_eq!(zone.key_low, Some(60));
        assert_eq!(zone.loops.len(), 1);
        assert_eq!(zone.loops[0].end, 90);
    }
}
