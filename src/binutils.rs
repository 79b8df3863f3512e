use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::dtype::ConvError;

#[macro_export]
macro_rules! read_n_bytes {
    ($file:ident, $n:literal) => {{
        let mut buf: [u8; $n] = [0; $n];
        $file.read_exact(&mut buf).map(|_| buf)
    }};
}

#[macro_export]
macro_rules! peek_magic {
    ($file:ident) => {{
        let mut buf: [u8; 4] = [0; 4];
        $file.read_exact(&mut buf).and_then(|_| {
            $file.seek(SeekFrom::Current(-4))
        }).map(move |_| buf)
    }};
}

/// Reads a 4-byte chunk id.
pub fn read_fourcc<R: Read>(reader: &mut R) -> Result<[u8; 4], ConvError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn fourcc_str(id: &[u8; 4]) -> String {
    id.iter().map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '.' }).collect()
}

pub fn read_bytes<R: Read>(reader: &mut R, n: usize) -> Result<Vec<u8>, ConvError> {
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads exactly `n` bytes and decodes the run up to the first NUL as ASCII,
/// replacing anything non-printable. Fixed-width name fields (Korg, EXS)
/// are stored this way.
pub fn read_fixed_ascii<R: Read>(reader: &mut R, n: usize) -> Result<String, ConvError> {
    let buf = read_bytes(reader, n)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(buf[..end].iter().map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '_' }).collect())
}

/// Writes `value` into a fixed-width field, truncated or padded with `pad`.
pub fn write_fixed_ascii<W: Write>(writer: &mut W, value: &str, n: usize, pad: u8) -> Result<(), ConvError> {
    let mut buf = vec![pad; n];
    for (i, b) in value.bytes().take(n).enumerate() {
        buf[i] = if b.is_ascii() { b } else { b'_' };
    }
    writer.write_all(&buf)?;
    Ok(())
}

/// Reads a NUL-terminated byte run without a known length.
pub fn read_cstring<R: Read>(reader: &mut R) -> Result<String, ConvError> {
    let mut out = Vec::new();
    loop {
        let b = reader.read_u8()?;
        if b == 0 {
            break;
        }
        out.push(b);
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// u32 length followed by that many UTF-16LE code units. Kontakt file
/// tables store path segments this way.
pub fn read_utf16_lstring<R: Read>(reader: &mut R) -> Result<String, ConvError> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut units = Vec::with_capacity(len);
    for _ in 0..len {
        units.push(reader.read_u16::<LittleEndian>()?);
    }
    Ok(String::from_utf16_lossy(&units))
}

pub fn write_utf16_lstring<W: Write>(writer: &mut W, value: &str) -> Result<usize, ConvError> {
    let units: Vec<u16> = value.encode_utf16().collect();
    writer.write_u32::<LittleEndian>(units.len() as u32)?;
    for u in &units {
        writer.write_u16::<LittleEndian>(*u)?;
    }
    Ok(4 + units.len() * 2)
}

/// u8 length followed by that many bytes of UTF-8.
pub fn read_u8_lstring<R: Read>(reader: &mut R) -> Result<String, ConvError> {
    let len = reader.read_u8()? as usize;
    let buf = read_bytes(reader, len)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn write_u8_lstring<W: Write>(writer: &mut W, value: &str) -> Result<usize, ConvError> {
    let bytes = value.as_bytes();
    if bytes.len() > 255 {
        return Err(ConvError::Invalid(format!("String too long for a length byte: {} bytes", bytes.len())));
    }
    writer.write_u8(bytes.len() as u8)?;
    writer.write_all(bytes)?;
    Ok(1 + bytes.len())
}

/// Boost-archive style variable-length unsigned number: values below 0x80
/// occupy one byte; larger values set the high bit and continue into the
/// next byte, little-endian, 7 bits at a time.
pub fn read_varint<R: Read>(reader: &mut R) -> Result<u64, ConvError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let b = reader.read_u8()?;
        value |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(ConvError::Invalid("Variable-length number does not terminate!".to_string()));
        }
    }
}

pub fn write_varint<W: Write>(writer: &mut W, mut value: u64) -> Result<usize, ConvError> {
    let mut written = 0;
    loop {
        let b = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            writer.write_u8(b)?;
            return Ok(written + 1);
        }
        writer.write_u8(b | 0x80)?;
        written += 1;
    }
}

/// 80-bit IEEE 754 extended float, as AIFF stores its sample rate.
pub fn read_extended80<R: Read>(reader: &mut R) -> Result<f64, ConvError> {
    let raw = reader.read_u16::<BigEndian>()?;
    let mantissa = reader.read_u64::<BigEndian>()?;
    let sign = if raw & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = i32::from(raw & 0x7FFF);
    if exponent == 0 && mantissa == 0 {
        return Ok(0.0);
    }
    Ok(sign * (mantissa as f64) * 2f64.powi(exponent - 16383 - 63))
}

pub fn write_extended80<W: Write>(writer: &mut W, value: f64) -> Result<(), ConvError> {
    if value <= 0.0 {
        writer.write_u16::<BigEndian>(0)?;
        writer.write_u64::<BigEndian>(0)?;
        return Ok(());
    }
    let exponent = value.log2().floor() as i32;
    let mantissa = (value / 2f64.powi(exponent - 63)) as u64;
    writer.write_u16::<BigEndian>((exponent + 16383) as u16)?;
    writer.write_u64::<BigEndian>(mantissa)?;
    Ok(())
}

/// Skips forward, tolerating streams that do not implement efficient seek.
pub fn skip<R: Read + Seek>(reader: &mut R, n: u64) -> Result<(), ConvError> {
    reader.seek(SeekFrom::Current(n as i64))?;
    Ok(())
}

pub fn stream_len<R: Seek>(reader: &mut R) -> Result<u64, ConvError> {
    let pos = reader.stream_position()?;
    let end = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(pos))?;
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fixed_ascii_round_trip_pads_and_truncates() {
        let mut buf = Vec::new();
        write_fixed_ascii(&mut buf, "PIANO", 12, 0x20).unwrap();
        assert_eq!(buf.len(), 12);
        let mut cur = Cursor::new(buf);
        assert_eq!(read_fixed_ascii(&mut cur, 12).unwrap(), "PIANO       ");
    }

    #[test]
    fn varint_round_trip() {
        for v in [0u64, 1, 0x7F, 0x80, 0x3FFF, 0x4000, 123_456_789] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v).unwrap();
            let mut cur = Cursor::new(buf);
            assert_eq!(read_varint(&mut cur).unwrap(), v);
        }
    }

    #[test]
    fn utf16_lstring_round_trip() {
        let mut buf = Vec::new();
        write_utf16_lstring(&mut buf, "Grand Piano ƒ").unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_utf16_lstring(&mut cur).unwrap(), "Grand Piano ƒ");
    }

    #[test]
    fn extended80_carries_common_sample_rates() {
        for rate in [8000.0, 22050.0, 44100.0, 48000.0, 96000.0] {
            let mut buf = Vec::new();
            write_extended80(&mut buf, rate).unwrap();
            let mut cur = Cursor::new(buf);
            let back = read_extended80(&mut cur).unwrap();
            assert!((back - rate).abs() < 0.001, "{} came back as {}", rate, back);
        }
    }
}
