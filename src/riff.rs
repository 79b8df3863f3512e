use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::binutils::{fourcc_str, read_fourcc};
use crate::dtype::ConvError;

pub const RIFF: [u8; 4] = *b"RIFF";
pub const FORM: [u8; 4] = *b"FORM";
pub const LIST: [u8; 4] = *b"LIST";

/// Byte order of chunk sizes. RIFF-family files are little-endian, AIFF
/// `FORM` files big-endian; the top-level id decides for the whole tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEndian {
    Little,
    Big,
}

/// One TLV record. Containers (`RIFF`, `FORM`, `LIST`) carry a form type
/// and children; leaves carry payload bytes.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub id: [u8; 4],
    pub form: Option<[u8; 4]>,
    pub children: Vec<Chunk>,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn leaf(id: [u8; 4], data: Vec<u8>) -> Chunk {
        Chunk { id, form: None, children: Vec::new(), data }
    }
    pub fn container(id: [u8; 4], form: [u8; 4]) -> Chunk {
        Chunk { id, form: Some(form), children: Vec::new(), data: Vec::new() }
    }
    pub fn is_container(&self) -> bool {
        self.form.is_some()
    }

    /// First direct child with the given id.
    pub fn find(&self, id: [u8; 4]) -> Option<&Chunk> {
        self.children.iter().find(|c| c.id == id)
    }
    pub fn find_mut(&mut self, id: [u8; 4]) -> Option<&mut Chunk> {
        self.children.iter_mut().find(|c| c.id == id)
    }
    /// First `LIST` child announcing the given form type.
    pub fn find_list(&self, form: [u8; 4]) -> Option<&Chunk> {
        self.children.iter().find(|c| c.id == LIST && c.form == Some(form))
    }

    /// Replaces the payload of the first chunk with this id, appending a
    /// new leaf if none exists yet.
    pub fn replace(&mut self, id: [u8; 4], payload: Vec<u8>) {
        match self.find_mut(id) {
            Some(chunk) => chunk.data = payload,
            None => self.children.push(Chunk::leaf(id, payload)),
        }
    }

    pub fn remove(&mut self, ids: &[[u8; 4]]) {
        self.children.retain(|c| !ids.contains(&c.id));
    }

    pub fn insert_before(&mut self, before: [u8; 4], chunk: Chunk) {
        let pos = self.children.iter().position(|c| c.id == before).unwrap_or(self.children.len());
        self.children.insert(pos, chunk);
    }

    /// Payload length on disk, excluding the 8-byte header, including the
    /// form type for containers.
    fn body_len(&self) -> u64 {
        if self.is_container() {
            4 + self.children.iter().map(|c| 8 + c.body_len() + (c.body_len() & 1)).sum::<u64>()
        } else {
            self.data.len() as u64
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkTree {
    pub endian: ChunkEndian,
    pub root: Chunk,
}

impl ChunkTree {
    pub fn new_riff(form: [u8; 4]) -> ChunkTree {
        ChunkTree { endian: ChunkEndian::Little, root: Chunk::container(RIFF, form) }
    }
    pub fn new_form(form: [u8; 4]) -> ChunkTree {
        ChunkTree { endian: ChunkEndian::Big, root: Chunk::container(FORM, form) }
    }

    /// Parses a complete chunk file. The top-level id picks the byte order;
    /// anything after the root chunk is tolerated and dropped.
    pub fn parse<R: Read + Seek>(reader: &mut R, file_name: &str) -> Result<ChunkTree, ConvError> {
        let total = crate::binutils::stream_len(reader)?;
        let id = read_fourcc(reader)?;
        let endian = match &id {
            b"RIFF" | b"RF64" | b"riff" => ChunkEndian::Little,
            b"FORM" => ChunkEndian::Big,
            _ => {
                return Err(ConvError::BadMagic { file: file_name.to_string(), expected: RIFF, found: id });
            }
        };
        let size = read_size(reader, endian)?;
        let remaining = total.saturating_sub(8);
        // Some writers leave the root size short or zero; the payload still
        // runs to the end of the file.
        let body = if size as u64 > remaining || size == 0 { remaining } else { size as u64 };
        let root = parse_container(reader, id, body, endian, file_name)?;
        Ok(ChunkTree { endian, root })
    }

    /// Writes the tree with freshly computed sizes, padding every chunk to
    /// an even byte boundary even when the parsed input was misaligned.
    pub fn emit<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, ConvError> {
        emit_chunk(&self.root, self.endian, writer)
    }

    pub fn emit_to_vec(&self) -> Result<Vec<u8>, ConvError> {
        let mut cursor = Cursor::new(Vec::new());
        self.emit(&mut cursor)?;
        Ok(cursor.into_inner())
    }
}

fn read_size<R: Read>(reader: &mut R, endian: ChunkEndian) -> Result<u32, ConvError> {
    Ok(match endian {
        ChunkEndian::Little => reader.read_u32::<LittleEndian>()?,
        ChunkEndian::Big => reader.read_u32::<BigEndian>()?,
    })
}

fn write_size<W: Write>(writer: &mut W, endian: ChunkEndian, size: u32) -> Result<(), ConvError> {
    match endian {
        ChunkEndian::Little => writer.write_u32::<LittleEndian>(size)?,
        ChunkEndian::Big => writer.write_u32::<BigEndian>(size)?,
    }
    Ok(())
}

fn plausible_id(id: &[u8; 4]) -> bool {
    id.iter().all(|&b| (0x20..0x7F).contains(&b))
}

/// Parses the children of a container whose form type has not been read
/// yet. `body` is the container payload length including the form type.
fn parse_container<R: Read + Seek>(
    reader: &mut R,
    id: [u8; 4],
    body: u64,
    endian: ChunkEndian,
    file_name: &str,
) -> Result<Chunk, ConvError> {
    if body < 4 {
        return Err(ConvError::Truncated { file: file_name.to_string(), offset: reader.stream_position()? });
    }
    let form = read_fourcc(reader)?;
    let mut container = Chunk::container(id, form);
    let end = reader.stream_position()? + (body - 4);

    while reader.stream_position()? + 8 <= end {
        let child_start = reader.stream_position()?;
        let child_id = read_fourcc(reader)?;
        if !plausible_id(&child_id) {
            // A broken pad byte threw us off; resync by scanning for the
            // next printable id on an even boundary.
            if !resync(reader, child_start, end)? {
                break;
            }
            continue;
        }
        let child_size = read_size(reader, endian)?;
        let remaining = end.saturating_sub(reader.stream_position()?);
        // A data chunk written before its size was known carries zero (or
        // an overrun) in the size field; its payload runs to the end of
        // the container.
        let effective = if child_id == *b"data" && (child_size == 0 || child_size as u64 > remaining) {
            remaining
        } else if child_size as u64 > remaining {
            return Err(ConvError::ChunkTooLarge {
                id: fourcc_str(&child_id),
                size: child_size as u64,
                remaining,
            });
        } else {
            child_size as u64
        };

        if child_id == LIST || (child_id == RIFF && child_start != 0) {
            container.children.push(parse_container(reader, child_id, effective, endian, file_name)?);
        } else {
            let mut data = vec![0u8; effective as usize];
            reader.read_exact(&mut data).map_err(|_| ConvError::Truncated {
                file: file_name.to_string(),
                offset: child_start,
            })?;
            container.children.push(Chunk::leaf(child_id, data));
        }
        // Word alignment pad; tolerate its absence at the end of the file.
        if effective & 1 == 1 && reader.stream_position()? < end {
            reader.seek(SeekFrom::Current(1))?;
        }
    }
    reader.seek(SeekFrom::Start(end))?;
    Ok(container)
}

/// Scans forward from a misread header for the next plausible chunk id.
/// Returns false when only trailing garbage remains.
fn resync<R: Read + Seek>(reader: &mut R, from: u64, end: u64) -> Result<bool, ConvError> {
    let mut pos = from + 1;
    while pos + 8 <= end {
        reader.seek(SeekFrom::Start(pos))?;
        let id = read_fourcc(reader)?;
        if plausible_id(&id) {
            reader.seek(SeekFrom::Start(pos))?;
            return Ok(true);
        }
        pos += 1;
    }
    reader.seek(SeekFrom::Start(end))?;
    Ok(false)
}

fn emit_chunk<W: Write + Seek>(chunk: &Chunk, endian: ChunkEndian, writer: &mut W) -> Result<usize, ConvError> {
    writer.write_all(&chunk.id)?;
    let body = chunk.body_len();
    if body > u32::MAX as u64 {
        return Err(ConvError::ChunkTooLarge { id: fourcc_str(&chunk.id), size: body, remaining: u32::MAX as u64 });
    }
    write_size(writer, endian, body as u32)?;
    let mut written = 8;
    if let Some(form) = chunk.form {
        writer.write_all(&form)?;
        written += 4;
        for child in &chunk.children {
            written += emit_chunk(child, endian, writer)?;
        }
    } else {
        writer.write_all(&chunk.data)?;
        written += chunk.data.len();
        if chunk.data.len() & 1 == 1 {
            writer.write_u8(0)?;
            written += 1;
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ChunkTree {
        let mut tree = ChunkTree::new_riff(*b"WAVE");
        tree.root.children.push(Chunk::leaf(*b"fmt ", vec![1, 0, 2, 0]));
        tree.root.children.push(Chunk::leaf(*b"data", vec![9, 9, 9]));
        tree
    }

    #[test]
    fn emit_then_parse_is_stable() {
        let tree = sample_tree();
        let bytes = tree.emit_to_vec().unwrap();
        let mut cur = Cursor::new(&bytes);
        let back = ChunkTree::parse(&mut cur, "mem").unwrap();
        assert_eq!(back.root.form, Some(*b"WAVE"));
        assert_eq!(back.root.children.len(), 2);
        assert_eq!(back.root.find(*b"data").unwrap().data, vec![9, 9, 9]);
        // Odd-size data chunk is padded; re-emitting is byte identical.
        assert_eq!(back.emit_to_vec().unwrap(), bytes);
    }

    #[test]
    fn replace_and_remove_edit_in_place() {
        let mut tree = sample_tree();
        tree.root.replace(*b"data", vec![1]);
        tree.root.replace(*b"smpl", vec![2, 2]);
        assert_eq!(tree.root.find(*b"data").unwrap().data, vec![1]);
        assert_eq!(tree.root.children.len(), 3);
        tree.root.remove(&[*b"smpl", *b"fmt "]);
        assert_eq!(tree.root.children.len(), 1);
    }

    #[test]
    fn insert_before_places_ahead_of_anchor() {
        let mut tree = sample_tree();
        tree.root.insert_before(*b"data", Chunk::leaf(*b"smpl", vec![0]));
        let ids: Vec<[u8; 4]> = tree.root.children.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![*b"fmt ", *b"smpl", *b"data"]);
    }

    #[test]
    fn oversized_data_chunk_is_clamped_to_remaining() {
        let tree = sample_tree();
        let mut bytes = tree.emit_to_vec().unwrap();
        // Corrupt the data chunk size to something absurd.
        let data_pos = bytes.windows(4).position(|w| w == b"data").unwrap();
        bytes[data_pos + 4..data_pos + 8].copy_from_slice(&0xFFFF_u32.to_le_bytes());
        let mut cur = Cursor::new(&bytes);
        let back = ChunkTree::parse(&mut cur, "mem").unwrap();
        assert_eq!(back.root.find(*b"data").unwrap().data.len(), 3 + 1); // payload + pad byte
    }

    #[test]
    fn junk_chunks_are_kept_and_removable() {
        let mut tree = sample_tree();
        tree.root.insert_before(*b"fmt ", Chunk::leaf(*b"JUNK", vec![0; 16]));
        let bytes = tree.emit_to_vec().unwrap();
        let mut cur = Cursor::new(&bytes);
        let mut back = ChunkTree::parse(&mut cur, "mem").unwrap();
        assert!(back.root.find(*b"JUNK").is_some());
        back.root.remove(&[*b"JUNK"]);
        assert!(back.root.find(*b"JUNK").is_none());
    }

    #[test]
    fn big_endian_form_tree_round_trips() {
        let mut tree = ChunkTree::new_form(*b"AIFF");
        tree.root.children.push(Chunk::leaf(*b"COMM", vec![0; 18]));
        let bytes = tree.emit_to_vec().unwrap();
        assert_eq!(&bytes[0..4], b"FORM");
        // Size field is big-endian: 4 (form) + 8 + 18.
        assert_eq!(&bytes[4..8], &30u32.to_be_bytes());
        let mut cur = Cursor::new(&bytes);
        let back = ChunkTree::parse(&mut cur, "mem").unwrap();
        assert_eq!(back.endian, ChunkEndian::Big);
        assert_eq!(back.root.find(*b"COMM").unwrap().data.len(), 18);
    }
}
