use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::dtype::ConvError;
use crate::model::{AudioMetadata, PcmData};

/// NCW files open with these six bytes; the seventh distinguishes the two
/// container revisions seen in the wild.
const FILE_MAGIC: [u8; 4] = [0x01, 0xA8, 0x9E, 0xD6];
const BLOCK_MAGIC: u32 = 0x3E9A_0C16;
/// Frames per compression block, fixed by the format.
const BLOCK_FRAMES: usize = 512;

#[derive(Debug, Clone, Copy)]
struct NcwHeader {
    channels: u16,
    bits: u16,
    sample_rate: u32,
    frame_count: u32,
    blocks_offset: u32,
}

/// Decodes a complete NCW stream to interleaved PCM. The decode is
/// one-shot: all intermediate block buffers die with this call so a preset
/// referencing thousands of NCWs never holds more than one result.
pub fn decode_ncw<R: Read + Seek>(reader: &mut R, file_name: &str) -> Result<PcmData, ConvError> {
    let header = read_header(reader, file_name)?;
    reader.seek(SeekFrom::Start(header.blocks_offset as u64))?;

    let channels = header.channels as usize;
    let frames = header.frame_count as usize;
    let float = header.bits == 32 && probe_float(reader)?;
    let mut channel_data: Vec<Vec<i64>> = vec![Vec::with_capacity(frames); channels];

    let mut decoded = 0usize;
    while decoded < frames {
        let mut window: Vec<Vec<i64>> = Vec::with_capacity(channels);
        let mut mid_side = false;
        for _ in 0..channels {
            let (samples, ms) = read_block(reader, header.bits, file_name)?;
            mid_side |= ms;
            window.push(samples);
        }
        if mid_side && channels == 2 {
            let (mid, side) = (window[0].clone(), window[1].clone());
            for i in 0..BLOCK_FRAMES {
                window[0][i] = mid[i] + side[i];
                window[1][i] = mid[i] - side[i];
            }
        }
        let take = BLOCK_FRAMES.min(frames - decoded);
        for (ch, samples) in window.iter().enumerate() {
            channel_data[ch].extend_from_slice(&samples[..take]);
        }
        decoded += take;
    }

    let bytes_per_sample = (header.bits / 8) as usize;
    let mut pcm = Vec::with_capacity(frames * channels * bytes_per_sample);
    for frame in 0..frames {
        for ch in channel_data.iter() {
            let v = ch[frame];
            match header.bits {
                16 => pcm.extend_from_slice(&(v as i16).to_le_bytes()),
                24 => pcm.extend_from_slice(&(v as i32).to_le_bytes()[..3]),
                32 => pcm.extend_from_slice(&(v as i32).to_le_bytes()),
                other => {
                    return Err(ConvError::FeatureNotSupported(format!("NCW bit depth {}", other)));
                }
            }
        }
    }

    Ok(PcmData {
        audio: AudioMetadata {
            channels: header.channels,
            sample_rate: header.sample_rate,
            bits_per_sample: header.bits,
            frame_count: header.frame_count as u64,
            float,
        },
        pcm,
    })
}

fn read_header<R: Read + Seek>(reader: &mut R, file_name: &str) -> Result<NcwHeader, ConvError> {
    let magic = crate::read_n_bytes!(reader, 8)?;
    if magic[..4] != FILE_MAGIC {
        return Err(ConvError::BadMagic {
            file: file_name.to_string(),
            expected: FILE_MAGIC,
            found: [magic[0], magic[1], magic[2], magic[3]],
        });
    }
    let channels = reader.read_u16::<LittleEndian>()?;
    let bits = reader.read_u16::<LittleEndian>()?;
    let sample_rate = reader.read_u32::<LittleEndian>()?;
    let frame_count = reader.read_u32::<LittleEndian>()?;
    let _block_def_offset = reader.read_u32::<LittleEndian>()?;
    let blocks_offset = reader.read_u32::<LittleEndian>()?;
    let _blocks_size = reader.read_u32::<LittleEndian>()?;
    if channels == 0 || channels > 2 || !matches!(bits, 16 | 24 | 32) {
        return Err(ConvError::FeatureNotSupported(format!("NCW with {} channels at {} bits", channels, bits)));
    }
    Ok(NcwHeader { channels, bits, sample_rate, frame_count, blocks_offset })
}

/// 32-bit NCW can hold float samples; the block headers look identical, so
/// peek at the first block's bits field: float blocks store raw data.
fn probe_float<R: Read + Seek>(reader: &mut R) -> Result<bool, ConvError> {
    let pos = reader.stream_position()?;
    let mut head = [0u8; 16];
    let is_float = if reader.read_exact(&mut head).is_ok() {
        let bits = i16::from_le_bytes([head[8], head[9]]);
        let flags = u16::from_le_bytes([head[10], head[11]]);
        bits == 0 && flags & 2 != 0
    } else {
        false
    };
    reader.seek(SeekFrom::Start(pos))?;
    Ok(is_float)
}

/// One 512-frame block for one channel. Returns the samples and whether
/// the block is flagged as the mid or side of an M/S pair.
fn read_block<R: Read + Seek>(reader: &mut R, sample_bits: u16, file_name: &str) -> Result<(Vec<i64>, bool), ConvError> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != BLOCK_MAGIC {
        return Err(ConvError::BadMagic {
            file: file_name.to_string(),
            expected: BLOCK_MAGIC.to_le_bytes(),
            found: magic.to_le_bytes(),
        });
    }
    let base = reader.read_i32::<LittleEndian>()? as i64;
    let bits = reader.read_i16::<LittleEndian>()?;
    let flags = reader.read_u16::<LittleEndian>()?;
    let _reserved = reader.read_u32::<LittleEndian>()?;
    let mid_side = flags & 1 != 0;

    let width = if bits == 0 { sample_bits as u32 } else { bits.unsigned_abs() as u32 };
    let mut packed = vec![0u8; BLOCK_FRAMES * width as usize / 8];
    reader.read_exact(&mut packed)?;

    let mut samples = Vec::with_capacity(BLOCK_FRAMES);
    if bits > 0 {
        // Delta coding: the base value is the running start, each packed
        // value is a signed delta from its predecessor.
        let mut current = base;
        for i in 0..BLOCK_FRAMES {
            samples.push(current);
            if i + 1 < BLOCK_FRAMES {
                current += unpack_signed(&packed, i, width);
            }
        }
    } else if bits < 0 {
        // Absolute values at reduced width.
        for i in 0..BLOCK_FRAMES {
            samples.push(unpack_signed(&packed, i, width));
        }
    } else {
        // Raw samples at full width.
        for i in 0..BLOCK_FRAMES {
            samples.push(unpack_signed(&packed, i, width));
        }
    }
    Ok((samples, mid_side))
}

/// Reads the `index`th value of `width` bits from an LSB-first bitstream
/// and sign-extends it.
fn unpack_signed(packed: &[u8], index: usize, width: u32) -> i64 {
    let mut value: u64 = 0;
    let base_bit = index * width as usize;
    for bit in 0..width as usize {
        let pos = base_bit + bit;
        if packed[pos / 8] >> (pos % 8) & 1 == 1 {
            value |= 1 << bit;
        }
    }
    // Sign extend from `width` bits.
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pack_signed(values: &[i64], width: u32) -> Vec<u8> {
        let mut out = vec![0u8; values.len() * width as usize / 8 + 1];
        for (index, &v) in values.iter().enumerate() {
            let raw = (v as u64) & ((1u64 << width) - 1);
            let base_bit = index * width as usize;
            for bit in 0..width as usize {
                if raw >> bit & 1 == 1 {
                    let pos = base_bit + bit;
                    out[pos / 8] |= 1 << (pos % 8);
                }
            }
        }
        out.truncate(values.len() * width as usize / 8);
        out
    }

    fn block_bytes(base: i32, bits: i16, flags: u16, packed: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&BLOCK_MAGIC.to_le_bytes());
        out.extend_from_slice(&base.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(packed);
        out
    }

    fn file_bytes(channels: u16, bits: u16, frames: u32, blocks: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&FILE_MAGIC);
        out.extend_from_slice(&[0x31, 0x01, 0x00, 0x00]);
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(&44100u32.to_le_bytes());
        out.extend_from_slice(&frames.to_le_bytes());
        out.extend_from_slice(&120u32.to_le_bytes()); // block index offset
        let blocks_offset = 120u32;
        out.extend_from_slice(&blocks_offset.to_le_bytes());
        out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
        out.resize(blocks_offset as usize, 0);
        out.extend_from_slice(blocks);
        out
    }

    #[test]
    fn decodes_mono_delta_block() {
        // Ramp 1000, 1002, 1004... as base + constant deltas of 2.
        let deltas = vec![2i64; BLOCK_FRAMES];
        let packed = pack_signed(&deltas, 9);
        let blocks = block_bytes(1000, 9, 0, &packed);
        let bytes = file_bytes(1, 16, 100, &blocks);
        let pcm = decode_ncw(&mut Cursor::new(bytes), "test.ncw").unwrap();
        assert_eq!(pcm.audio.frame_count, 100);
        assert_eq!(pcm.audio.channels, 1);
        let s0 = i16::from_le_bytes([pcm.pcm[0], pcm.pcm[1]]);
        let s1 = i16::from_le_bytes([pcm.pcm[2], pcm.pcm[3]]);
        let s99 = i16::from_le_bytes([pcm.pcm[198], pcm.pcm[199]]);
        assert_eq!(s0, 1000);
        assert_eq!(s1, 1002);
        assert_eq!(s99, 1000 + 99 * 2);
    }

    #[test]
    fn reconstructs_mid_side_stereo() {
        // L = 300, R = 100 everywhere: mid = 200, side = 100.
        let zero_deltas = vec![0i64; BLOCK_FRAMES];
        let packed = pack_signed(&zero_deltas, 8);
        let mut blocks = block_bytes(200, 8, 1, &packed);
        blocks.extend_from_slice(&block_bytes(100, 8, 1, &packed));
        let bytes = file_bytes(2, 16, 16, &blocks);
        let pcm = decode_ncw(&mut Cursor::new(bytes), "test.ncw").unwrap();
        assert_eq!(pcm.audio.channels, 2);
        let l = i16::from_le_bytes([pcm.pcm[0], pcm.pcm[1]]);
        let r = i16::from_le_bytes([pcm.pcm[2], pcm.pcm[3]]);
        assert_eq!(l, 300);
        assert_eq!(r, 100);
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = vec![0u8; 128];
        assert!(matches!(
            decode_ncw(&mut Cursor::new(bytes), "bad.ncw"),
            Err(ConvError::BadMagic { .. })
        ));
    }

    #[test]
    fn absolute_coded_block_round_trips_negative_values() {
        let values: Vec<i64> = (0..BLOCK_FRAMES as i64).map(|i| -(i % 100)).collect();
        let packed = pack_signed(&values, 12);
        let blocks = block_bytes(0, -12, 0, &packed);
        let bytes = file_bytes(1, 16, BLOCK_FRAMES as u32, &blocks);
        let pcm = decode_ncw(&mut Cursor::new(bytes), "test.ncw").unwrap();
        let s99 = i16::from_le_bytes([pcm.pcm[198], pcm.pcm[199]]);
        assert_eq!(s99, -99);
    }
}
