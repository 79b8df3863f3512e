//! The Preset Chunk tree: the id-tagged, version-tagged, length-prefixed
//! records inside the zlib blob of 4.2.2+ and 5+ containers.

use std::io::{Cursor, Read, Seek, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::binutils::{read_u8_lstring, read_utf16_lstring, write_u8_lstring, write_utf16_lstring};
use crate::dtype::ConvError;

pub const CHUNK_PROGRAM: u16 = 0x28;
pub const CHUNK_BANK: u16 = 0x29;
pub const CHUNK_GROUP_LIST: u16 = 0x32;
pub const CHUNK_GROUP: u16 = 0x04;
pub const CHUNK_ZONE_LIST: u16 = 0x34;
pub const CHUNK_ZONE: u16 = 0x24;
pub const CHUNK_VOLUME_ENV: u16 = 0x0A;
pub const CHUNK_PITCH_ENV: u16 = 0x0B;
pub const CHUNK_FILTER: u16 = 0x14;
pub const CHUNK_FILENAME_LIST: u16 = 0x3D;
pub const CHUNK_FILENAME_LIST_EX: u16 = 0x4B;
pub const CHUNK_LOOP: u16 = 0x21;

/// One preset chunk: 2-byte id, 4-byte length, then a 2-byte payload
/// version followed by the payload proper. Container ids nest further
/// chunks after their version tag.
#[derive(Debug, Clone, Default)]
pub struct PresetChunk {
    pub id: u16,
    pub version: u16,
    pub data: Vec<u8>,
    pub children: Vec<PresetChunk>,
}

fn is_container(id: u16) -> bool {
    matches!(
        id,
        CHUNK_PROGRAM | CHUNK_BANK | CHUNK_GROUP_LIST | CHUNK_ZONE_LIST | CHUNK_GROUP | CHUNK_ZONE
    )
}

impl PresetChunk {
    pub fn new(id: u16, version: u16) -> PresetChunk {
        PresetChunk { id, version, data: Vec::new(), children: Vec::new() }
    }

    /// Parses consecutive chunks until the input runs out.
    pub fn parse_all(data: &[u8]) -> Result<Vec<PresetChunk>, ConvError> {
        let mut cursor = Cursor::new(data);
        let mut chunks = Vec::new();
        while (cursor.position() as usize) + 6 <= data.len() {
            chunks.push(Self::parse_one(&mut cursor, data.len())?);
        }
        Ok(chunks)
    }

    fn parse_one(cursor: &mut Cursor<&[u8]>, total: usize) -> Result<PresetChunk, ConvError> {
        let id = cursor.read_u16::<LittleEndian>()?;
        let length = cursor.read_u32::<LittleEndian>()? as usize;
        let at = cursor.position() as usize;
        if at + length > total {
            return Err(ConvError::ChunkTooLarge {
                id: format!("0x{:02X}", id),
                size: length as u64,
                remaining: (total - at) as u64,
            });
        }
        let body = &cursor.get_ref()[at..at + length];
        cursor.set_position((at + length) as u64);

        let mut inner = Cursor::new(body);
        let version = inner.read_u16::<LittleEndian>()?;
        let mut chunk = PresetChunk::new(id, version);
        if is_container(id) {
            // A container's own scalar payload is a nested length-prefixed
            // block, followed by its child chunks.
            let own = inner.read_u32::<LittleEndian>()? as usize;
            let own_at = inner.position() as usize;
            if own_at + own > body.len() {
                return Err(ConvError::ChunkTooLarge {
                    id: format!("0x{:02X}", id),
                    size: own as u64,
                    remaining: (body.len() - own_at) as u64,
                });
            }
            chunk.data = body[own_at..own_at + own].to_vec();
            chunk.children = Self::parse_all(&body[own_at + own..])?;
        } else {
            chunk.data = body[2..].to_vec();
        }
        Ok(chunk)
    }

    pub fn emit(&self, out: &mut Vec<u8>) -> Result<(), ConvError> {
        let mut body = Vec::new();
        body.write_u16::<LittleEndian>(self.version)?;
        if is_container(self.id) {
            body.write_u32::<LittleEndian>(self.data.len() as u32)?;
            body.extend_from_slice(&self.data);
            for child in &self.children {
                child.emit(&mut body)?;
            }
        } else {
            body.extend_from_slice(&self.data);
        }
        out.write_u16::<LittleEndian>(self.id)?;
        out.write_u32::<LittleEndian>(body.len() as u32)?;
        out.extend_from_slice(&body);
        Ok(())
    }

    pub fn find(&self, id: u16) -> Option<&PresetChunk> {
        self.children.iter().find(|c| c.id == id)
    }
    pub fn find_all(&self, id: u16) -> impl Iterator<Item = &PresetChunk> {
        self.children.iter().filter(move |c| c.id == id)
    }
}

/// The external-sample path table. 4.2.2 stores byte segments
/// (FILENAME_LIST); 5+ stores UTF-16 segments (FILENAME_LIST_EX). Each
/// entry is a segment count followed by path segments, joined on read.
#[derive(Debug, Clone, Default)]
pub struct FileList {
    pub paths: Vec<String>,
    pub wide: bool,
}

impl FileList {
    pub fn parse(chunk: &PresetChunk) -> Result<FileList, ConvError> {
        let wide = chunk.id == CHUNK_FILENAME_LIST_EX;
        let mut cursor = Cursor::new(chunk.data.as_slice());
        let count = cursor.read_u32::<LittleEndian>()?;
        let mut paths = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let segments = cursor.read_u16::<LittleEndian>()?;
            let mut parts = Vec::with_capacity(segments as usize);
            for _ in 0..segments {
                let part = if wide {
                    read_utf16_lstring(&mut cursor)?
                } else {
                    read_u8_lstring(&mut cursor)?
                };
                parts.push(part);
            }
            paths.push(parts.join("/"));
        }
        Ok(FileList { paths, wide })
    }

    pub fn emit(&self) -> Result<PresetChunk, ConvError> {
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(self.paths.len() as u32)?;
        for path in &self.paths {
            let parts: Vec<&str> = path.split(['/', '\\']).collect();
            data.write_u16::<LittleEndian>(parts.len() as u16)?;
            for part in parts {
                if self.wide {
                    write_utf16_lstring(&mut data, part)?;
                } else {
                    write_u8_lstring(&mut data, part)?;
                }
            }
        }
        let mut chunk = PresetChunk::new(
            if self.wide { CHUNK_FILENAME_LIST_EX } else { CHUNK_FILENAME_LIST },
            0,
        );
        chunk.data = data;
        Ok(chunk)
    }
}

/// Scalar payload of a zone chunk.
#[derive(Debug, Clone, Default)]
pub struct ZoneData {
    pub sample_index: i32,
    pub group_index: u16,
    pub key_low: u8,
    pub key_high: u8,
    pub key_root: u8,
    pub vel_low: u8,
    pub vel_high: u8,
    pub start: u32,
    pub end: u32,
    pub tune: f32,
    pub gain_db: f32,
    pub pan: f32,
}

impl ZoneData {
    pub fn parse(data: &[u8]) -> Result<ZoneData, ConvError> {
        let mut cur = Cursor::new(data);
        Ok(ZoneData {
            sample_index: cur.read_i32::<LittleEndian>()?,
            group_index: cur.read_u16::<LittleEndian>()?,
            key_low: cur.read_u8()?,
            key_high: cur.read_u8()?,
            key_root: cur.read_u8()?,
            vel_low: cur.read_u8()?,
            vel_high: cur.read_u8()?,
            start: {
                let _pad = cur.read_u8()?;
                cur.read_u32::<LittleEndian>()?
            },
            end: cur.read_u32::<LittleEndian>()?,
            tune: cur.read_f32::<LittleEndian>()?,
            gain_db: cur.read_f32::<LittleEndian>()?,
            pan: cur.read_f32::<LittleEndian>()?,
        })
    }

    pub fn emit(&self) -> Result<Vec<u8>, ConvError> {
        let mut out = Vec::with_capacity(32);
        out.write_i32::<LittleEndian>(self.sample_index)?;
        out.write_u16::<LittleEndian>(self.group_index)?;
        out.write_u8(self.key_low)?;
        out.write_u8(self.key_high)?;
        out.write_u8(self.key_root)?;
        out.write_u8(self.vel_low)?;
        out.write_u8(self.vel_high)?;
        out.write_u8(0)?;
        out.write_u32::<LittleEndian>(self.start)?;
        out.write_u32::<LittleEndian>(self.end)?;
        out.write_f32::<LittleEndian>(self.tune)?;
        out.write_f32::<LittleEndian>(self.gain_db)?;
        out.write_f32::<LittleEndian>(self.pan)?;
        Ok(out)
    }
}

/// Loop record nested under a zone.
#[derive(Debug, Clone, Default)]
pub struct LoopData {
    /// 0 off, 1 forward, 2 alternating, 3 backward.
    pub mode: u8,
    pub start: u32,
    pub end: u32,
    pub crossfade: u32,
}

impl LoopData {
    pub fn parse(data: &[u8]) -> Result<LoopData, ConvError> {
        let mut cur = Cursor::new(data);
        Ok(LoopData {
            mode: cur.read_u8()?,
            start: cur.read_u32::<LittleEndian>()?,
            end: cur.read_u32::<LittleEndian>()?,
            crossfade: cur.read_u32::<LittleEndian>()?,
        })
    }
    pub fn emit(&self) -> Result<Vec<u8>, ConvError> {
        let mut out = Vec::with_capacity(13);
        out.write_u8(self.mode)?;
        out.write_u32::<LittleEndian>(self.start)?;
        out.write_u32::<LittleEndian>(self.end)?;
        out.write_u32::<LittleEndian>(self.crossfade)?;
        Ok(out)
    }
}

/// AHDSR payload shared by the volume, pitch and filter envelopes.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeData {
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    pub depth: f32,
}

impl EnvelopeData {
    pub fn parse(data: &[u8]) -> Result<EnvelopeData, ConvError> {
        let mut cur = Cursor::new(data);
        Ok(EnvelopeData {
            attack: cur.read_f32::<LittleEndian>()?,
            hold: cur.read_f32::<LittleEndian>()?,
            decay: cur.read_f32::<LittleEndian>()?,
            sustain: cur.read_f32::<LittleEndian>()?,
            release: cur.read_f32::<LittleEndian>()?,
            depth: cur.read_f32::<LittleEndian>()?,
        })
    }
    pub fn emit(&self) -> Result<Vec<u8>, ConvError> {
        let mut out = Vec::with_capacity(24);
        for v in [self.attack, self.hold, self.decay, self.sustain, self.release, self.depth] {
            out.write_f32::<LittleEndian>(v)?;
        }
        Ok(out)
    }
}

/// Filter payload: type, cutoff and resonance plus bend range, which
/// Kontakt keeps beside the filter block.
#[derive(Debug, Clone)]
pub struct FilterData {
    pub filter_type: u8,
    pub cutoff_hz: f32,
    pub resonance: f32,
    pub bend_up_cents: i16,
    pub bend_down_cents: i16,
}

impl Default for FilterData {
    fn default() -> FilterData {
        FilterData { filter_type: 0, cutoff_hz: 20000.0, resonance: 0.0, bend_up_cents: 200, bend_down_cents: -200 }
    }
}

impl FilterData {
    pub fn parse(data: &[u8]) -> Result<FilterData, ConvError> {
        let mut cur = Cursor::new(data);
        Ok(FilterData {
            filter_type: cur.read_u8()?,
            cutoff_hz: cur.read_f32::<LittleEndian>()?,
            resonance: cur.read_f32::<LittleEndian>()?,
            bend_up_cents: cur.read_i16::<LittleEndian>()?,
            bend_down_cents: cur.read_i16::<LittleEndian>()?,
        })
    }
    pub fn emit(&self) -> Result<Vec<u8>, ConvError> {
        let mut out = Vec::with_capacity(13);
        out.write_u8(self.filter_type)?;
        out.write_f32::<LittleEndian>(self.cutoff_hz)?;
        out.write_f32::<LittleEndian>(self.resonance)?;
        out.write_i16::<LittleEndian>(self.bend_up_cents)?;
        out.write_i16::<LittleEndian>(self.bend_down_cents)?;
        Ok(out)
    }
}

/// Program scalar payload: name plus master volume/tune/pan.
#[derive(Debug, Clone, Default)]
pub struct ProgramData {
    pub name: String,
    pub volume_db: f32,
    pub tune: f32,
    pub pan: f32,
}

impl ProgramData {
    pub fn parse(data: &[u8]) -> Result<ProgramData, ConvError> {
        let mut cur = Cursor::new(data);
        Ok(ProgramData {
            name: read_u8_lstring(&mut cur)?,
            volume_db: cur.read_f32::<LittleEndian>()?,
            tune: cur.read_f32::<LittleEndian>()?,
            pan: cur.read_f32::<LittleEndian>()?,
        })
    }
    pub fn emit(&self) -> Result<Vec<u8>, ConvError> {
        let mut out = Vec::new();
        write_u8_lstring(&mut out, &self.name)?;
        out.write_f32::<LittleEndian>(self.volume_db)?;
        out.write_f32::<LittleEndian>(self.tune)?;
        out.write_f32::<LittleEndian>(self.pan)?;
        Ok(out)
    }
}

/// Group scalar payload.
#[derive(Debug, Clone, Default)]
pub struct GroupData {
    pub name: String,
    /// 0 always, 1 round robin.
    pub play_mode: u8,
}

impl GroupData {
    pub fn parse(data: &[u8]) -> Result<GroupData, ConvError> {
        let mut cur = Cursor::new(data);
        Ok(GroupData { name: read_u8_lstring(&mut cur)?, play_mode: cur.read_u8()? })
    }
    pub fn emit(&self) -> Result<Vec<u8>, ConvError> {
        let mut out = Vec::new();
        write_u8_lstring(&mut out, &self.name)?;
        out.push(self.play_mode);
        Ok(out)
    }
}

/// Reads a zlib-compressed preset blob into its chunk list.
pub fn decompress_chunks(compressed: &[u8]) -> Result<Vec<PresetChunk>, ConvError> {
    let raw = crate::container::zlib_decompress(compressed)?;
    PresetChunk::parse_all(&raw)
}

/// Compresses a chunk list back into a zlib blob.
pub fn compress_chunks(chunks: &[PresetChunk]) -> Result<Vec<u8>, ConvError> {
    let mut raw = Vec::new();
    for chunk in chunks {
        chunk.emit(&mut raw)?;
    }
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

/// A windowed reader over a monolith region, so embedded sample decode
/// never sees bytes past its slice.
pub struct WindowedReader<R: Read + Seek> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> WindowedReader<R> {
    pub fn new(mut inner: R, start: u64, len: u64) -> Result<WindowedReader<R>, ConvError> {
        inner.seek(std::io::SeekFrom::Start(start))?;
        Ok(WindowedReader { inner, start, len, pos: 0 })
    }
}

impl<R: Read + Seek> Read for WindowedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = (self.len - self.pos) as usize;
        let take = buf.len().min(remaining);
        if take == 0 {
            return Ok(0);
        }
        let n = self.inner.read(&mut buf[..take])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for WindowedReader<R> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            std::io::SeekFrom::Start(v) => v as i64,
            std::io::SeekFrom::Current(v) => self.pos as i64 + v,
            std::io::SeekFrom::End(v) => self.len as i64 + v,
        };
        if target < 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before window"));
        }
        self.pos = (target as u64).min(self.len);
        self.inner.seek(std::io::SeekFrom::Start(self.start + self.pos))?;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_tree_round_trips_through_zlib() {
        let mut program = PresetChunk::new(CHUNK_PROGRAM, 1);
        program.data = ProgramData { name: "Test".to_string(), volume_db: -3.0, tune: 0.5, pan: 0.0 }
            .emit()
            .unwrap();
        let mut zone_list = PresetChunk::new(CHUNK_ZONE_LIST, 0);
        let mut zone = PresetChunk::new(CHUNK_ZONE, 1);
        zone.data = ZoneData { sample_index: 2, key_low: 10, key_high: 20, key_root: 15, ..Default::default() }
            .emit()
            .unwrap();
        zone_list.children.push(zone);
        program.children.push(zone_list);

        let blob = compress_chunks(&[program]).unwrap();
        let back = decompress_chunks(&blob).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].id, CHUNK_PROGRAM);
        let pdata = ProgramData::parse(&back[0].data).unwrap();
        assert_eq!(pdata.name, "Test");
        let zl = back[0].find(CHUNK_ZONE_LIST).unwrap();
        let z = ZoneData::parse(&zl.children[0].data).unwrap();
        assert_eq!(z.sample_index, 2);
        assert_eq!(z.key_root, 15);
    }

    #[test]
    fn filename_lists_round_trip_both_widths() {
        for wide in [false, true] {
            let list = FileList {
                paths: vec!["Samples/Piano/C3.wav".to_string(), "D3.ncw".to_string()],
                wide,
            };
            let chunk = list.emit().unwrap();
            let back = FileList::parse(&chunk).unwrap();
            assert_eq!(back.paths, list.paths);
            assert_eq!(back.wide, wide);
        }
    }

    #[test]
    fn windowed_reader_stays_in_bounds() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut window = WindowedReader::new(Cursor::new(data), 10, 20).unwrap();
        let mut buf = Vec::new();
        window.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 20);
        assert_eq!(buf[0], 10);
        assert_eq!(buf[19], 29);
    }
}
