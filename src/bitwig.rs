use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::container::{ArchiveReader, ArchiveWriter};
use crate::dtype::{ConvError, Context};
use crate::fileutils::{sanitize_file_name, unique_output_path};
use crate::model::{
    Category, Group, Loop, LoopType, MultiSampleSource, PlayLogic, SampleData, SampleZone,
};
use crate::pipeline::{FormatId, PresetReader, PresetWriter};
use crate::wav::WavFile;

/// One Bitwig `.multisample` bundle: an uncompressed ZIP holding
/// `multisample.xml` plus the samples at the archive root.

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename = "multisample")]
struct XmlMultisample {
    #[serde(rename = "@name")]
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    generator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    creator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keywords: Option<XmlKeywords>,
    filter: Option<XmlFilter>,
    #[serde(rename = "group", default)]
    groups: Vec<XmlGroup>,
    #[serde(rename = "sample", default)]
    samples: Vec<XmlSample>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlFilter {
    #[serde(rename = "@type")]
    filter_type: String,
    #[serde(rename = "@cutoff", default)]
    cutoff: f64,
    #[serde(rename = "@resonance", default)]
    resonance: f64,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlKeywords {
    #[serde(rename = "keyword", default)]
    keywords: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlGroup {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@color", skip_serializing_if = "Option::is_none")]
    color: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlSample {
    #[serde(rename = "@file")]
    file: String,
    #[serde(rename = "@gain", default)]
    gain: f64,
    #[serde(rename = "@sample-start", default)]
    sample_start: f64,
    #[serde(rename = "@sample-stop", default)]
    sample_stop: f64,
    /// Index into the group list; -1 means ungrouped.
    #[serde(rename = "@group", default = "default_group_index")]
    group: i32,
    #[serde(rename = "@tune", default)]
    tune: f64,
    #[serde(rename = "@reverse", default)]
    reverse: bool,
    #[serde(rename = "@zone-logic", skip_serializing_if = "Option::is_none")]
    zone_logic: Option<String>,
    key: Option<XmlKey>,
    velocity: Option<XmlVelocity>,
    ahdsr: Option<XmlAhdsr>,
    #[serde(rename = "loop")]
    sample_loop: Option<XmlLoop>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlAhdsr {
    #[serde(rename = "@attack", skip_serializing_if = "Option::is_none")]
    attack: Option<f64>,
    #[serde(rename = "@hold", skip_serializing_if = "Option::is_none")]
    hold: Option<f64>,
    #[serde(rename = "@decay", skip_serializing_if = "Option::is_none")]
    decay: Option<f64>,
    #[serde(rename = "@sustain", skip_serializing_if = "Option::is_none")]
    sustain: Option<f64>,
    #[serde(rename = "@release", skip_serializing_if = "Option::is_none")]
    release: Option<f64>,
}

fn default_group_index() -> i32 {
    -1
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlKey {
    #[serde(rename = "@root", default = "default_root")]
    root: u8,
    #[serde(rename = "@track", default = "default_track")]
    track: f64,
    #[serde(rename = "@low", default)]
    low: u8,
    #[serde(rename = "@high", default = "default_high")]
    high: u8,
    #[serde(rename = "@low-fade", default)]
    low_fade: u32,
    #[serde(rename = "@high-fade", default)]
    high_fade: u32,
}

fn default_root() -> u8 {
    60
}
fn default_track() -> f64 {
    1.0
}
fn default_high() -> u8 {
    127
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlVelocity {
    #[serde(rename = "@low", default)]
    low: u8,
    #[serde(rename = "@high", default = "default_high")]
    high: u8,
    #[serde(rename = "@low-fade", default)]
    low_fade: u32,
    #[serde(rename = "@high-fade", default)]
    high_fade: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlLoop {
    #[serde(rename = "@mode")]
    mode: String,
    #[serde(rename = "@start", default)]
    start: f64,
    #[serde(rename = "@stop", default)]
    stop: f64,
    /// Crossfade as a fraction of the loop length.
    #[serde(rename = "@fade", default)]
    fade: f64,
}

pub struct BitwigDetector;

impl PresetReader for BitwigDetector {
    fn format(&self) -> FormatId {
        FormatId::Bitwig
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["multisample"]
    }

    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let file = std::fs::File::open(path)?;
        let mut archive = ArchiveReader::open(file)?;
        let xml_bytes = archive.read_entry("multisample.xml")?;
        let xml: XmlMultisample = quick_xml::de::from_str(&String::from_utf8_lossy(&xml_bytes))?;

        let mut source = MultiSampleSource::new(if xml.name.is_empty() {
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("multisample")
        } else {
            &xml.name
        });
        source.metadata.creator = xml.creator.clone();
        source.metadata.description = xml.description.clone();
        if let Some(cat) = &xml.category {
            source.metadata.category = Category::from_str(cat).unwrap_or(Category::Unknown);
        }
        if let Some(kw) = &xml.keywords {
            source.metadata.keywords = kw.keywords.iter().cloned().collect();
        }
        if let Some(f) = &xml.filter {
            source.global_filter = Some(crate::model::Filter {
                filter_type: crate::model::FilterType::from_str(&f.filter_type)
                    .unwrap_or(crate::model::FilterType::LowPass),
                cutoff_hz: f.cutoff,
                resonance: f.resonance.clamp(0.0, 1.0),
                ..Default::default()
            });
        }

        let mut groups: Vec<Group> = xml.groups.iter().map(|g| Group::new(&g.name)).collect();
        let mut ungrouped = Group::new("");

        for sample in &xml.samples {
            ctx.cancellation.check()?;
            let data = archive.read_entry(&sample.file)?;
            let wav = WavFile::parse(&mut Cursor::new(&data), &sample.file)?;
            let pcm = wav.pcm()?;
            let frames = pcm.audio.frame_count;
            let stem = Path::new(&sample.file).file_stem().and_then(|s| s.to_str()).unwrap_or(&sample.file);
            let mut zone = SampleZone::new(stem, SampleData::Memory(pcm));
            zone.gain = sample.gain;
            zone.tune = sample.tune;
            zone.reversed = sample.reverse;
            zone.start = sample.sample_start.max(0.0) as u64;
            zone.stop = if sample.sample_stop > 0.0 { sample.sample_stop as u64 } else { frames };
            if sample.zone_logic.as_deref() == Some("round-robin") {
                zone.play_logic = PlayLogic::RoundRobin;
            }
            if let Some(key) = &sample.key {
                zone.key_root = Some(key.root.min(127));
                zone.key_low = Some(key.low.min(127));
                zone.key_high = Some(key.high.min(127));
                zone.key_tracking = key.track.clamp(0.0, 1.0);
                zone.xfade_lo_key = key.low_fade;
                zone.xfade_hi_key = key.high_fade;
            }
            if let Some(vel) = &sample.velocity {
                zone.vel_low = vel.low.min(127);
                zone.vel_high = vel.high.min(127);
                zone.xfade_lo_vel = vel.low_fade;
                zone.xfade_hi_vel = vel.high_fade;
            }
            if let Some(env) = &sample.ahdsr {
                zone.amp_env.envelope = crate::model::Envelope {
                    attack: env.attack,
                    hold: env.hold,
                    decay: env.decay,
                    sustain_level: env.sustain,
                    release: env.release,
                    ..Default::default()
                };
            }
            if let Some(l) = &sample.sample_loop {
                if l.mode != "off" {
                    let start = l.start.max(0.0) as u64;
                    let stop = l.stop.max(0.0) as u64;
                    zone.loops.push(Loop {
                        loop_type: if l.mode == "ping-pong" { LoopType::Alternating } else { LoopType::Forward },
                        start,
                        end: stop,
                        crossfade_frames: (l.fade.clamp(0.0, 1.0) * (stop.saturating_sub(start)) as f64) as u64,
                    });
                }
            }
            zone.conform_to_frames(frames);

            let target = usize::try_from(sample.group).ok().filter(|&g| g < groups.len());
            match target {
                Some(index) => groups[index].zones.push(zone),
                None => ungrouped.zones.push(zone),
            }
        }
        if !ungrouped.zones.is_empty() {
            groups.push(ungrouped);
        }
        source.groups = groups;
        source.prune_empty_groups();
        Ok(vec![source])
    }
}

pub struct BitwigCreator;

impl PresetWriter for BitwigCreator {
    fn format(&self) -> FormatId {
        FormatId::Bitwig
    }

    fn write(
        &self,
        ctx: &Context,
        source: &mut MultiSampleSource,
        dest_dir: &Path,
        taken: &mut HashSet<String>,
    ) -> Result<Vec<PathBuf>, ConvError> {
        let out_path = unique_output_path(dest_dir, &source.name, "multisample", taken);
        let file = crate::fileutils::open_file_overwrite_rw(&out_path)?;
        let mut archive = ArchiveWriter::new_stored(file, source.metadata.creation_date);

        let mut xml = XmlMultisample {
            name: source.name.clone(),
            generator: Some(format!("presetconv {}", crate::fileutils::VERSION)),
            category: (source.metadata.category != Category::Unknown).then(|| source.metadata.category.to_string()),
            creator: source.metadata.creator.clone(),
            description: source.metadata.description.clone(),
            keywords: (!source.metadata.keywords.is_empty()).then(|| XmlKeywords {
                keywords: source.metadata.keywords.iter().cloned().collect(),
            }),
            filter: source.global_filter.as_ref().map(|f| XmlFilter {
                filter_type: f.filter_type.to_string(),
                cutoff: f.cutoff_hz,
                resonance: f.resonance,
            }),
            groups: source.groups.iter().map(|g| XmlGroup { name: g.name.clone(), color: None }).collect(),
            samples: Vec::new(),
        };

        let mut entry_names: HashSet<String> = HashSet::new();
        let mut pending: Vec<(String, Vec<u8>)> = Vec::new();
        for (group_index, group) in source.groups.iter_mut().enumerate() {
            ctx.cancellation.check()?;
            for zone in &mut group.zones {
                if zone.sample.is_missing() {
                    continue;
                }
                let mut file_name = format!("{}.wav", sanitize_file_name(&zone.name));
                let mut counter = 1;
                while !entry_names.insert(file_name.to_lowercase()) {
                    file_name = format!("{} ({}).wav", sanitize_file_name(&zone.name), counter);
                    counter += 1;
                }
                let wav_bytes = crate::wav::zone_wav_bytes(ctx, zone, &source.metadata)?;
                pending.push((file_name.clone(), wav_bytes));
                zone.sample.evict();

                xml.samples.push(XmlSample {
                    file: file_name,
                    gain: zone.gain,
                    sample_start: zone.start as f64,
                    sample_stop: zone.stop as f64,
                    group: group_index as i32,
                    tune: zone.tune,
                    reverse: zone.reversed,
                    zone_logic: match zone.play_logic {
                        PlayLogic::RoundRobin => Some("round-robin".to_string()),
                        PlayLogic::Always => None,
                    },
                    key: Some(XmlKey {
                        root: zone.key_root_or(60),
                        track: zone.key_tracking,
                        low: zone.key_low_or(0),
                        high: zone.key_high_or(127),
                        low_fade: zone.xfade_lo_key,
                        high_fade: zone.xfade_hi_key,
                    }),
                    velocity: Some(XmlVelocity {
                        low: zone.vel_low,
                        high: zone.vel_high,
                        low_fade: zone.xfade_lo_vel,
                        high_fade: zone.xfade_hi_vel,
                    }),
                    ahdsr: zone.amp_env.envelope.is_set().then(|| XmlAhdsr {
                        attack: zone.amp_env.envelope.attack,
                        hold: zone.amp_env.envelope.hold,
                        decay: zone.amp_env.envelope.decay,
                        sustain: zone.amp_env.envelope.sustain_level,
                        release: zone.amp_env.envelope.release,
                    }),
                    sample_loop: zone.loops.first().map(|l| XmlLoop {
                        mode: match l.loop_type {
                            LoopType::Alternating => "ping-pong".to_string(),
                            _ => "loop".to_string(),
                        },
                        start: l.start as f64,
                        stop: l.end as f64,
                        fade: if l.end > l.start {
                            (l.crossfade_frames as f64 / (l.end - l.start) as f64).clamp(0.0, 1.0)
                        } else {
                            0.0
                        },
                    }),
                });
                ctx.notifier.progress();
            }
        }

        let body = quick_xml::se::to_string(&xml).map_err(|e| ConvError::Xml(e.to_string()))?;
        let document = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", body);
        archive.add_entry("multisample.xml", document.as_bytes())?;
        for (name, bytes) in pending {
            ctx.cancellation.check()?;
            archive.add_entry(&name, &bytes)?;
        }
        archive.finish()?;
        Ok(vec![out_path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Cancellation, MapSettings, NullNotifier};
    use crate::model::{AudioMetadata, PcmData};

    fn test_ctx<'a>(settings: &'a MapSettings) -> Context<'a> {
        Context::new(&NullNotifier, Cancellation::new(), settings)
    }

    fn tone_zone(name: &str, root: u8) -> SampleZone {
        let frames = 32usize;
        let pcm = PcmData {
            audio: AudioMetadata { channels: 1, sample_rate: 44100, bits_per_sample: 16, frame_count: frames as u64, float: false },
            pcm: vec![0u8; frames * 2],
        };
        let mut zone = SampleZone::new(name, SampleData::Memory(pcm));
        zone.key_root = Some(root);
        zone.key_low = Some(root.saturating_sub(2));
        zone.key_high = Some((root + 2).min(127));
        zone.stop = frames as u64;
        zone
    }

    #[test]
    fn write_then_read_preserves_zones() {
        let dir = std::env::temp_dir().join(format!("bitwig-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = MapSettings::new();
        let ctx = test_ctx(&settings);

        let mut source = MultiSampleSource::new("Test Piano");
        source.metadata.creator = Some("someone".to_string());
        source.metadata.category = Category::Piano;
        let mut group = Group::new("Layer 1");
        group.zones.push(tone_zone("A", 57));
        group.zones.push(tone_zone("B", 60));
        source.groups.push(group);

        let mut taken = HashSet::new();
        let written = BitwigCreator.write(&ctx, &mut source, &dir, &mut taken).unwrap();
        assert_eq!(written.len(), 1);

        let back = BitwigDetector.read(&ctx, &written[0]).unwrap();
        assert_eq!(back.len(), 1);
        let back = &back[0];
        assert_eq!(back.name, "Test Piano");
        assert_eq!(back.metadata.category, Category::Piano);
        assert_eq!(back.groups.len(), 1);
        assert_eq!(back.groups[0].name, "Layer 1");
        assert_eq!(back.groups[0].zones.len(), 2);
        assert_eq!(back.groups[0].zones[0].key_root, Some(57));
        assert_eq!(back.groups[0].zones[1].key_root, Some(60));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn loop_fade_is_a_fraction_of_loop_length() {
        let dir = std::env::temp_dir().join(format!("bitwig-loop-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = MapSettings::new();
        let ctx = test_ctx(&settings);

        let mut source = MultiSampleSource::new("Looped");
        let mut group = Group::new("g");
        let mut zone = tone_zone("Z", 60);
        zone.loops.push(Loop { loop_type: LoopType::Forward, start: 8, end: 24, crossfade_frames: 4 });
        group.zones.push(zone);
        source.groups.push(group);

        let mut taken = HashSet::new();
        let written = BitwigCreator.write(&ctx, &mut source, &dir, &mut taken).unwrap();
        let back = &BitwigDetector.read(&ctx, &written[0]).unwrap()[0];
        let l = &back.groups[0].zones[0].loops[0];
        assert_eq!(l.start, 8);
        assert_eq!(l.end, 24);
        assert_eq!(l.crossfade_frames, 4);

        std::fs::remove_dir_all(&dir).ok();
    }
}
