//! Monolith support: presets that append their samples inline. The
//! preset's zones index a directory of (name, offset, length) records;
//! the payloads are ordinary WAV or NCW images inside the file.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::binutils::read_u8_lstring;
use crate::dtype::ConvError;
use crate::model::PcmData;
use crate::wav::WavFile;

use super::chunks::WindowedReader;

pub const MONOLITH_MAGIC: [u8; 4] = *b"MNLT";

#[derive(Debug, Clone)]
pub struct MonolithEntry {
    pub name: String,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Monolith {
    pub entries: Vec<MonolithEntry>,
}

impl Monolith {
    /// Parses the directory at the reader's current position.
    pub fn parse<R: Read + Seek>(reader: &mut R, file_name: &str) -> Result<Monolith, ConvError> {
        let magic = crate::binutils::read_fourcc(reader)?;
        if magic != MONOLITH_MAGIC {
            return Err(ConvError::BadMagic { file: file_name.to_string(), expected: MONOLITH_MAGIC, found: magic });
        }
        let count = reader.read_u32::<LittleEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = read_u8_lstring(reader)?;
            let offset = reader.read_u64::<LittleEndian>()?;
            let length = reader.read_u64::<LittleEndian>()?;
            entries.push(MonolithEntry { name, offset, length });
        }
        Ok(Monolith { entries })
    }

    pub fn find(&self, name: &str) -> Option<&MonolithEntry> {
        let wanted = name.replace('\\', "/").to_lowercase();
        self.entries
            .iter()
            .find(|e| e.name.replace('\\', "/").to_lowercase().ends_with(&wanted) || wanted.ends_with(&e.name.to_lowercase()))
    }

    /// Decodes one embedded sample through a windowed reader, so a preset
    /// with thousands of entries never maps more than one at a time.
    pub fn read_sample<R: Read + Seek>(&self, file: R, entry: &MonolithEntry) -> Result<PcmData, ConvError> {
        let mut window = WindowedReader::new(file, entry.offset, entry.length)?;
        let magic = crate::peek_magic!(window)?;
        if magic == *b"RIFF" {
            WavFile::parse(&mut window, &entry.name)?.pcm()
        } else {
            crate::ncw::decode_ncw(&mut window, &entry.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn directory_parses_and_windows_into_wav() {
        // Assemble: [dir][wav image]
        let pcm = crate::model::PcmData {
            audio: crate::model::AudioMetadata {
                channels: 1,
                sample_rate: 44100,
                bits_per_sample: 16,
                frame_count: 4,
                float: false,
            },
            pcm: vec![1, 0, 2, 0, 3, 0, 4, 0],
        };
        let wav_bytes = WavFile::from_pcm(&pcm).to_bytes().unwrap();

        let mut file = Vec::new();
        file.extend_from_slice(&MONOLITH_MAGIC);
        file.extend_from_slice(&1u32.to_le_bytes());
        file.push(6);
        file.extend_from_slice(b"C3.wav");
        let header_len = file.len() + 16;
        file.extend_from_slice(&(header_len as u64).to_le_bytes());
        file.extend_from_slice(&(wav_bytes.len() as u64).to_le_bytes());
        file.extend_from_slice(&wav_bytes);

        let mut cursor = Cursor::new(file.clone());
        let monolith = Monolith::parse(&mut cursor, "mem.nki").unwrap();
        assert_eq!(monolith.entries.len(), 1);
        let entry = monolith.find("Samples/C3.wav").unwrap().clone();
        let decoded = monolith.read_sample(Cursor::new(file), &entry).unwrap();
        assert_eq!(decoded.audio.frame_count, 4);
        assert_eq!(decoded.pcm, pcm.pcm);
    }
}
