//! The early-generation layout: a string table followed by nested
//! program/group/zone records. Version 1 and 1.5 differ only in the
//! header version word. This dialect is also the write side for the
//! whole family.

use std::io::{Cursor, Read, Seek, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::binutils::{read_u8_lstring, write_u8_lstring};
use crate::dtype::{ConvError, ReadWrite};

#[derive(Debug, Clone, Default)]
pub struct K1Zone {
    pub sample_path: String,
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
    pub loops: Vec<K1Loop>,
}

#[derive(Debug, Clone, Default)]
pub struct K1Loop {
    /// 1 forward, 2 alternating, 3 backward.
    pub mode: u8,
    pub start: u32,
    pub end: u32,
    pub crossfade: u32,
}

#[derive(Debug, Clone, Default)]
pub struct K1Group {
    pub name: String,
    /// 0 always, 1 round robin.
    pub play_mode: u8,
    pub zones: Vec<K1Zone>,
}

#[derive(Debug, Clone, Default)]
pub struct K1Program {
    pub name: String,
    pub volume_db: f32,
    pub tune: f32,
    pub amp_env: [f32; 5],
    pub bend_up_cents: i16,
    pub bend_down_cents: i16,
    pub groups: Vec<K1Group>,
}

impl ReadWrite for K1Program {
    /// Parses the decompressed payload. Strings live in a table up front;
    /// records reference them by index.
    fn read_from_file<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), ConvError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let mut cur = Cursor::new(data.as_slice());
        let string_count = cur.read_u16::<LittleEndian>()? as usize;
        let mut strings = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            strings.push(read_u8_lstring(&mut cur)?);
        }
        let lookup = |index: u16| -> Result<String, ConvError> {
            strings
                .get(index as usize)
                .cloned()
                .ok_or_else(|| ConvError::Invalid(format!("String index {} outside the table", index)))
        };

        self.name = lookup(cur.read_u16::<LittleEndian>()?)?;
        self.volume_db = cur.read_f32::<LittleEndian>()?;
        self.tune = cur.read_f32::<LittleEndian>()?;
        for slot in &mut self.amp_env {
            *slot = cur.read_f32::<LittleEndian>()?;
        }
        self.bend_up_cents = cur.read_i16::<LittleEndian>()?;
        self.bend_down_cents = cur.read_i16::<LittleEndian>()?;

        self.groups.clear();
        let group_count = cur.read_u16::<LittleEndian>()?;
        for _ in 0..group_count {
            let mut group = K1Group {
                name: lookup(cur.read_u16::<LittleEndian>()?)?,
                play_mode: cur.read_u8()?,
                zones: Vec::new(),
            };
            let zone_count = cur.read_u16::<LittleEndian>()?;
            for _ in 0..zone_count {
                let mut zone = K1Zone {
                    sample_path: lookup(cur.read_u16::<LittleEndian>()?)?,
                    key_low: cur.read_u8()?,
                    key_high: cur.read_u8()?,
                    key_root: cur.read_u8()?,
                    vel_low: cur.read_u8()?,
                    vel_high: cur.read_u8()?,
                    start: cur.read_u32::<LittleEndian>()?,
                    end: cur.read_u32::<LittleEndian>()?,
                    tune: cur.read_f32::<LittleEndian>()?,
                    gain_db: cur.read_f32::<LittleEndian>()?,
                    pan: cur.read_f32::<LittleEndian>()?,
                    loops: Vec::new(),
                };
                let loop_count = cur.read_u8()?;
                for _ in 0..loop_count {
                    zone.loops.push(K1Loop {
                        mode: cur.read_u8()?,
                        start: cur.read_u32::<LittleEndian>()?,
                        end: cur.read_u32::<LittleEndian>()?,
                        crossfade: cur.read_u32::<LittleEndian>()?,
                    });
                }
                group.zones.push(zone);
            }
            self.groups.push(group);
        }
        Ok(())
    }

    /// Emits the payload. Sample paths are written with backslashes, the
    /// way the original player resolves them.
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, ConvError> {
        let mut strings: Vec<String> = Vec::new();
        let mut intern = |s: &str, strings: &mut Vec<String>| -> u16 {
            if let Some(at) = strings.iter().position(|e| e == s) {
                return at as u16;
            }
            strings.push(s.to_string());
            (strings.len() - 1) as u16
        };

        let program_name = intern(&self.name, &mut strings);
        let mut group_refs = Vec::new();
        for group in &self.groups {
            let name_ref = intern(&group.name, &mut strings);
            let zone_refs: Vec<u16> = group
                .zones
                .iter()
                .map(|z| intern(&z.sample_path.replace('/', "\\"), &mut strings))
                .collect();
            group_refs.push((name_ref, zone_refs));
        }

        let mut out = Vec::new();
        out.write_u16::<LittleEndian>(strings.len() as u16)?;
        for s in &strings {
            write_u8_lstring(&mut out, s)?;
        }
        out.write_u16::<LittleEndian>(program_name)?;
        out.write_f32::<LittleEndian>(self.volume_db)?;
        out.write_f32::<LittleEndian>(self.tune)?;
        for v in self.amp_env {
            out.write_f32::<LittleEndian>(v)?;
        }
        out.write_i16::<LittleEndian>(self.bend_up_cents)?;
        out.write_i16::<LittleEndian>(self.bend_down_cents)?;

        out.write_u16::<LittleEndian>(self.groups.len() as u16)?;
        for (group, (name_ref, zone_refs)) in self.groups.iter().zip(&group_refs) {
            out.write_u16::<LittleEndian>(*name_ref)?;
            out.write_u8(group.play_mode)?;
            out.write_u16::<LittleEndian>(group.zones.len() as u16)?;
            for (zone, path_ref) in group.zones.iter().zip(zone_refs) {
                out.write_u16::<LittleEndian>(*path_ref)?;
                out.write_u8(zone.key_low)?;
                out.write_u8(zone.key_high)?;
                out.write_u8(zone.key_root)?;
                out.write_u8(zone.vel_low)?;
                out.write_u8(zone.vel_high)?;
                out.write_u32::<LittleEndian>(zone.start)?;
                out.write_u32::<LittleEndian>(zone.end)?;
                out.write_f32::<LittleEndian>(zone.tune)?;
                out.write_f32::<LittleEndian>(zone.gain_db)?;
                out.write_f32::<LittleEndian>(zone.pan)?;
                out.write_u8(zone.loops.len() as u8)?;
                for l in &zone.loops {
                    out.write_u8(l.mode)?;
                    out.write_u32::<LittleEndian>(l.start)?;
                    out.write_u32::<LittleEndian>(l.end)?;
                    out.write_u32::<LittleEndian>(l.crossfade)?;
                }
            }
        }
        writer.write_all(&out)?;
        Ok(out.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_round_trips_with_interned_strings() {
        let program = K1Program {
            name: "Piano".to_string(),
            volume_db: -1.5,
            tune: 0.0,
            amp_env: [0.01, 0.0, 0.3, 0.8, 0.25],
            bend_up_cents: 200,
            bend_down_cents: -200,
            groups: vec![K1Group {
                name: "Soft".to_string(),
                play_mode: 0,
                zones: vec![K1Zone {
                    sample_path: "Samples/C3.wav".to_string(),
                    key_low: 40,
                    key_high: 60,
                    key_root: 48,
                    vel_low: 0,
                    vel_high: 127,
                    start: 0,
                    end: 44100,
                    tune: 0.02,
                    gain_db: -3.0,
                    pan: 0.25,
                    loops: vec![K1Loop { mode: 1, start: 100, end: 44000, crossfade: 50 }],
                }],
            }],
        };
        let mut buf = Cursor::new(Vec::new());
        program.write_to_file(&mut buf).unwrap();
        buf.set_position(0);
        let mut back = K1Program::default();
        back.read_from_file(&mut buf).unwrap();
        assert_eq!(back.name, "Piano");
        assert_eq!(back.groups.len(), 1);
        let zone = &back.groups[0].zones[0];
        // Emission flips separators to backslashes.
        assert_eq!(zone.sample_path, "Samples\\C3.wav");
        assert_eq!(zone.key_root, 48);
        assert_eq!(zone.loops[0].end, 44000);
        assert_eq!(back.bend_up_cents, 200);
    }
}
