use std::path::Path;

use crate::dtype::{ConvError, Context};
use crate::model::{Group, MultiSampleSource, SampleData, SampleZone};
use crate::pipeline::{FormatId, PresetReader};
use crate::tags::{find_note_in_name, find_velocity_in_name};
use crate::wav::{apply_wav_chunks_to_zone, WavFile};

/// Treats a folder of loose WAV files as one instrument: the folder name
/// becomes the preset name, roots come from `inst`/`smpl` chunks or
/// filename tokens, velocity layers from `v64`-style tokens, and key
/// ranges are filled in from the midpoints between neighboring roots.
pub struct WavFolderDetector;

impl PresetReader for WavFolderDetector {
    fn format(&self) -> FormatId {
        FormatId::Wav
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["wav"]
    }

    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut wav_paths: Vec<std::path::PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| crate::fileutils::valid_file_of_type(p, &["wav"]))
            .collect();
        wav_paths.sort();
        if wav_paths.is_empty() {
            return Ok(Vec::new());
        }

        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_else(|| path.file_stem().and_then(|s| s.to_str()).unwrap_or("wav"));
        let mut source = MultiSampleSource::new(name);
        let mut metadata_taken = false;

        let mut zones: Vec<(Option<u8>, SampleZone)> = Vec::new();
        for wav_path in &wav_paths {
            ctx.cancellation.check()?;
            let mut file = std::fs::File::open(wav_path)?;
            let wav = match WavFile::parse(&mut file, &wav_path.display().to_string()) {
                Ok(w) => w,
                Err(e) => {
                    ctx.notifier.warn(&format!("{}: {}", wav_path.display(), e));
                    continue;
                }
            };
            // The first file carrying producer metadata names the set.
            if !metadata_taken {
                if let Some(bext) = wav.bext() {
                    if !bext.originator.is_empty() {
                        source.metadata.creator = Some(bext.originator.clone());
                    }
                    if !bext.description.is_empty() {
                        source.metadata.description = Some(bext.description.clone());
                    }
                    metadata_taken = true;
                } else if let Some(artist) = wav.info_value(*b"IART") {
                    source.metadata.creator = Some(artist);
                    source.metadata.description = wav.info_value(*b"ICMT");
                    metadata_taken = true;
                }
            }
            let stem = wav_path.file_stem().and_then(|s| s.to_str()).unwrap_or("sample");
            let mut zone = SampleZone::new(stem, SampleData::from_file(wav_path.clone()));
            let frames = wav.audio_metadata()?.frame_count;
            zone.stop = frames;
            apply_wav_chunks_to_zone(&wav, &mut zone);
            if zone.key_root.is_none() {
                zone.key_root = find_note_in_name(stem);
            }
            zone.conform_to_frames(frames);
            let velocity_token = find_velocity_in_name(stem);
            zones.push((velocity_token, zone));
        }
        if zones.is_empty() {
            return Ok(Vec::new());
        }

        // Velocity layers: each distinct token becomes a layer topped at
        // its own velocity, the last stretched to 127.
        let mut layer_tops: Vec<u8> = zones.iter().filter_map(|(v, _)| *v).collect();
        layer_tops.sort_unstable();
        layer_tops.dedup();

        if layer_tops.len() > 1 {
            for (index, &top) in layer_tops.iter().enumerate() {
                let low = if index == 0 { 0 } else { layer_tops[index - 1] };
                let high = if index == layer_tops.len() - 1 { 127 } else { top - 1 };
                let mut group = Group::new(&format!("Velocity {}-{}", low, high));
                for (_, zone) in zones.iter().filter(|(v, _)| *v == Some(top)) {
                    let mut zone = zone.clone();
                    zone.vel_low = low;
                    zone.vel_high = high;
                    group.zones.push(zone);
                }
                source.groups.push(group);
            }
            // Files with no velocity token fall into the widest layer.
            let orphans: Vec<SampleZone> = zones
                .iter()
                .filter(|(v, _)| v.is_none())
                .map(|(_, z)| z.clone())
                .collect();
            if !orphans.is_empty() {
                let mut group = Group::new("Other");
                group.zones = orphans;
                source.groups.push(group);
            }
        } else {
            let mut group = Group::new("");
            group.zones = zones.into_iter().map(|(_, z)| z).collect();
            source.groups.push(group);
        }

        for group in &mut source.groups {
            spread_key_ranges(&mut group.zones);
        }
        source.prune_empty_groups();
        Ok(vec![source])
    }
}

/// Fills unset key ranges from the midpoints between neighboring roots:
/// the lowest zone reaches down to 0, the highest up to 127.
pub fn spread_key_ranges(zones: &mut [SampleZone]) {
    let mut order: Vec<usize> = (0..zones.len()).collect();
    order.sort_by_key(|&i| zones[i].key_root_or(60));
    for position in 0..order.len() {
        let index = order[position];
        if zones[index].key_low.is_some() || zones[index].key_high.is_some() {
            continue;
        }
        let root = zones[index].key_root_or(60);
        let low = if position == 0 {
            0
        } else {
            let previous = zones[order[position - 1]].key_root_or(60);
            (u16::from(previous) + u16::from(root)).div_euclid(2) as u8 + 1
        };
        let high = if position == order.len() - 1 {
            127
        } else {
            let next = zones[order[position + 1]].key_root_or(60);
            (u16::from(root) + u16::from(next)).div_euclid(2) as u8
        };
        zones[index].key_low = Some(low.min(root));
        zones[index].key_high = Some(high.max(root));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Cancellation, MapSettings, NullNotifier};
    use crate::model::{AudioMetadata, PcmData};

    fn write_wav(dir: &Path, name: &str, frames: usize) {
        let pcm = PcmData {
            audio: AudioMetadata { channels: 1, sample_rate: 44100, bits_per_sample: 16, frame_count: frames as u64, float: false },
            pcm: vec![0u8; frames * 2],
        };
        let bytes = WavFile::from_pcm(&pcm).to_bytes().unwrap();
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn folder_of_waves_becomes_velocity_layered_instrument() {
        let root = std::env::temp_dir().join(format!("wavfolder-{}", std::process::id()));
        let dir = root.join("piano");
        std::fs::create_dir_all(&dir).unwrap();
        for note in ["C3", "C4", "C5"] {
            for vel in ["v64", "v127"] {
                write_wav(&dir, &format!("Piano_{}_{}.wav", note, vel), 16);
            }
        }

        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
        let sources = WavFolderDetector.read(&ctx, &dir.join("Piano_C3_v64.wav")).unwrap();
        assert_eq!(sources.len(), 1);
        let source = &sources[0];
        assert_eq!(source.name, "piano");
        assert_eq!(source.groups.len(), 2);
        assert_eq!(source.zone_count(), 6);

        let soft = &source.groups[0];
        assert_eq!((soft.zones[0].vel_low, soft.zones[0].vel_high), (0, 63));
        let loud = &source.groups[1];
        assert_eq!((loud.zones[0].vel_low, loud.zones[0].vel_high), (64, 127));

        // Key ranges spread around the roots without gaps or overlap.
        let mut zones: Vec<&SampleZone> = soft.zones.iter().collect();
        zones.sort_by_key(|z| z.key_root_or(0));
        assert_eq!(zones[0].key_low, Some(0));
        assert_eq!(zones[2].key_high, Some(127));
        assert_eq!(zones[0].key_high.map(|h| h + 1), zones[1].key_low);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn midpoint_spread_keeps_roots_inside_ranges() {
        let pcm = PcmData {
            audio: AudioMetadata { channels: 1, sample_rate: 44100, bits_per_sample: 16, frame_count: 4, float: false },
            pcm: vec![0u8; 8],
        };
        let mut zones: Vec<SampleZone> = [48u8, 60, 72]
            .iter()
            .map(|&root| {
                let mut z = SampleZone::new("z", SampleData::Memory(pcm.clone()));
                z.key_root = Some(root);
                z
            })
            .collect();
        spread_key_ranges(&mut zones);
        assert_eq!(zones[0].key_low, Some(0));
        assert_eq!(zones[0].key_high, Some(54));
        assert_eq!(zones[1].key_low, Some(55));
        assert_eq!(zones[1].key_high, Some(66));
        assert_eq!(zones[2].key_low, Some(67));
        assert_eq!(zones[2].key_high, Some(127));
    }
}
