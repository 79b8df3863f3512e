use std::io::{Read, Seek, Write};

use chrono::{Datelike, NaiveDateTime, Timelike};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::GzEncoder;
use flate2::Compression;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::dtype::ConvError;

/// Archive writer for the ZIP-based preset bundles. Bitwig multisamples
/// use STORED entries (the crate computes each entry's CRC-32 up front);
/// DecentSampler libraries compress.
pub struct ArchiveWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    method: CompressionMethod,
    timestamp: Option<NaiveDateTime>,
}

impl<W: Write + Seek> ArchiveWriter<W> {
    pub fn new_stored(writer: W, timestamp: Option<NaiveDateTime>) -> ArchiveWriter<W> {
        ArchiveWriter { zip: ZipWriter::new(writer), method: CompressionMethod::Stored, timestamp }
    }

    pub fn new_deflated(writer: W, timestamp: Option<NaiveDateTime>) -> ArchiveWriter<W> {
        ArchiveWriter { zip: ZipWriter::new(writer), method: CompressionMethod::Deflated, timestamp }
    }

    fn options(&self) -> FileOptions {
        let mut options = FileOptions::default().compression_method(self.method);
        if let Some(ts) = self.timestamp {
            if let Ok(dt) = zip::DateTime::from_date_and_time(
                ts.year().clamp(1980, 2107) as u16,
                ts.month() as u8,
                ts.day() as u8,
                ts.hour() as u8,
                ts.minute() as u8,
                ts.second() as u8,
            ) {
                options = options.last_modified_time(dt);
            }
        }
        options
    }

    pub fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<(), ConvError> {
        // Archive entries always use forward slashes, whatever the host.
        let name = name.replace('\\', "/");
        self.zip.start_file(name, self.options().large_file(data.len() as u64 > 0xFFFF_FFFF))?;
        self.zip.write_all(data)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, ConvError> {
        Ok(self.zip.finish()?)
    }
}

/// Read-side view of a preset bundle.
pub struct ArchiveReader<R: Read + Seek> {
    zip: ZipArchive<R>,
}

impl<R: Read + Seek> ArchiveReader<R> {
    pub fn open(reader: R) -> Result<ArchiveReader<R>, ConvError> {
        Ok(ArchiveReader { zip: ZipArchive::new(reader)? })
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.zip.file_names().map(|n| n.to_string()).collect()
    }

    /// Extracts one entry by name, tolerating the backslashed names some
    /// Windows tools produce.
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, ConvError> {
        let wanted = name.replace('\\', "/");
        let index = (0..self.zip.len()).find(|&i| {
            self.zip
                .by_index_raw(i)
                .map(|f| f.name().replace('\\', "/").eq_ignore_ascii_case(&wanted))
                .unwrap_or(false)
        });
        let index = index.ok_or_else(|| ConvError::Zip(format!("Archive has no entry '{}'", name)))?;
        let mut file = self.zip.by_index(index)?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// First entry whose name ends with the given suffix, for bundles
    /// where the descriptor name varies.
    pub fn find_entry(&mut self, suffix: &str) -> Option<String> {
        let lower = suffix.to_lowercase();
        self.entry_names().into_iter().find(|n| n.to_lowercase().ends_with(&lower))
    }
}

pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, ConvError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, ConvError> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Raw zlib stream, as found inside Kontakt containers.
pub fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>, ConvError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn stored_archive_round_trips_entries() {
        let buffer = Cursor::new(Vec::new());
        let ts = NaiveDateTime::parse_from_str("2023-06-05 12:00:00", "%Y-%m-%d %H:%M:%S").ok();
        let mut writer = ArchiveWriter::new_stored(buffer, ts);
        writer.add_entry("multisample.xml", b"<xml/>").unwrap();
        writer.add_entry("samples\\a.wav", b"RIFFdata").unwrap();
        let buffer = writer.finish().unwrap();

        let mut reader = ArchiveReader::open(Cursor::new(buffer.into_inner())).unwrap();
        assert_eq!(reader.read_entry("multisample.xml").unwrap(), b"<xml/>");
        // Backslash was normalized on write and tolerated on read.
        assert_eq!(reader.read_entry("samples/a.wav").unwrap(), b"RIFFdata");
        assert_eq!(reader.find_entry(".xml"), Some("multisample.xml".to_string()));
    }

    #[test]
    fn gzip_round_trip() {
        let data = b"some preset xml".repeat(50);
        let packed = gzip_compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(gzip_decompress(&packed).unwrap(), data);
    }
}
