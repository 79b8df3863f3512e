use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::container::{gzip_compress, gzip_decompress};
use crate::dtype::{ConvError, Context};
use crate::fileutils::{sanitize_file_name, unique_output_path};
use crate::model::{Envelope, Group, Loop, LoopType, MultiSampleSource, SampleData, SampleZone};
use crate::pipeline::{FormatId, PresetReader, PresetWriter};
use crate::wav::WavFile;

/// Ableton device presets are gzip-compressed XML where nearly every
/// scalar sits in a `Value` attribute of its own element.
#[derive(Debug, Serialize, Deserialize, Default)]
struct Val<T> {
    #[serde(rename = "@Value")]
    value: T,
}

impl<T> Val<T> {
    fn of(value: T) -> Val<T> {
        Val { value }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename = "Ableton")]
struct XmlAbleton {
    #[serde(rename = "@MajorVersion", skip_serializing_if = "Option::is_none")]
    major_version: Option<String>,
    #[serde(rename = "@Creator", skip_serializing_if = "Option::is_none")]
    creator: Option<String>,
    #[serde(rename = "MultiSampler")]
    sampler: XmlMultiSampler,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlMultiSampler {
    #[serde(rename = "Player")]
    player: XmlPlayer,
    #[serde(rename = "VolumeEnvelope", skip_serializing_if = "Option::is_none")]
    volume_envelope: Option<XmlEnvelope>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlEnvelope {
    #[serde(rename = "AttackTime", skip_serializing_if = "Option::is_none")]
    attack_time: Option<Val<f64>>,
    #[serde(rename = "DecayTime", skip_serializing_if = "Option::is_none")]
    decay_time: Option<Val<f64>>,
    #[serde(rename = "SustainLevel", skip_serializing_if = "Option::is_none")]
    sustain_level: Option<Val<f64>>,
    #[serde(rename = "ReleaseTime", skip_serializing_if = "Option::is_none")]
    release_time: Option<Val<f64>>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlPlayer {
    #[serde(rename = "MultiSampleMap")]
    map: XmlMultiSampleMap,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlMultiSampleMap {
    #[serde(rename = "SampleParts")]
    parts: XmlSampleParts,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlSampleParts {
    #[serde(rename = "MultiSamplePart", default)]
    parts: Vec<XmlSamplePart>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlSamplePart {
    #[serde(rename = "@Id")]
    id: u32,
    #[serde(rename = "Name")]
    name: Val<String>,
    #[serde(rename = "KeyRange")]
    key_range: XmlRange,
    #[serde(rename = "VelocityRange")]
    velocity_range: XmlRange,
    #[serde(rename = "RootKey")]
    root_key: Val<u8>,
    /// Cents.
    #[serde(rename = "Detune")]
    detune: Val<f64>,
    /// Percent; 100 is full keyboard tracking.
    #[serde(rename = "TuneScale")]
    tune_scale: Val<f64>,
    /// -1..1.
    #[serde(rename = "Panorama")]
    panorama: Val<f64>,
    /// Linear gain.
    #[serde(rename = "Volume")]
    volume: Val<f64>,
    #[serde(rename = "SampleStart")]
    sample_start: Val<u64>,
    #[serde(rename = "SampleEnd")]
    sample_end: Val<u64>,
    #[serde(rename = "SustainLoop", skip_serializing_if = "Option::is_none")]
    sustain_loop: Option<XmlSustainLoop>,
    #[serde(rename = "SampleRef")]
    sample_ref: XmlSampleRef,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlRange {
    #[serde(rename = "Min")]
    min: Val<u8>,
    #[serde(rename = "Max")]
    max: Val<u8>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlSustainLoop {
    #[serde(rename = "Start")]
    start: Val<u64>,
    #[serde(rename = "End")]
    end: Val<u64>,
    /// 0 off, 1 forward, 2 back-and-forth.
    #[serde(rename = "Mode")]
    mode: Val<u8>,
    #[serde(rename = "Crossfade")]
    crossfade: Val<u64>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlSampleRef {
    #[serde(rename = "FileRef")]
    file_ref: XmlFileRef,
    #[serde(rename = "DefaultDuration")]
    default_duration: Val<u64>,
    #[serde(rename = "DefaultSampleRate")]
    default_sample_rate: Val<u32>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlFileRef {
    #[serde(rename = "RelativePath")]
    relative_path: Val<String>,
    #[serde(rename = "Path", skip_serializing_if = "Option::is_none")]
    path: Option<Val<String>>,
    /// Seconds since the epoch. Live 12 rejects millisecond values here.
    #[serde(rename = "LastModDate", skip_serializing_if = "Option::is_none")]
    last_mod_date: Option<Val<i64>>,
}

fn parse_gzip_xml<T: DeserializeOwned>(path: &Path) -> Result<T, ConvError> {
    let raw = std::fs::read(path)?;
    let xml_bytes = if raw.starts_with(&[0x1F, 0x8B]) { gzip_decompress(&raw)? } else { raw };
    Ok(quick_xml::de::from_str(&String::from_utf8_lossy(&xml_bytes))?)
}

pub struct AbletonDetector;

impl PresetReader for AbletonDetector {
    fn format(&self) -> FormatId {
        FormatId::Ableton
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["adv"]
    }

    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let xml: XmlAbleton = parse_gzip_xml(path)?;
        let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("preset");
        let dir = path.parent().unwrap_or(Path::new("."));

        let mut source = MultiSampleSource::new(name);
        source.metadata.creator = xml.creator.clone();
        let mut group = Group::new("");

        for part in &xml.sampler.player.map.parts.parts {
            ctx.cancellation.check()?;
            let reference = part
                .sample_ref
                .file_ref
                .path
                .as_ref()
                .map(|p| p.value.clone())
                .filter(|p| Path::new(p).is_file())
                .unwrap_or_else(|| part.sample_ref.file_ref.relative_path.value.clone());
            let data = match crate::locator::find_sample(&reference, dir, crate::locator::DEFAULT_SEARCH_DEPTH) {
                Some(found) => SampleData::from_file(found),
                None => {
                    ctx.notifier.warn(&format!("SampleNotFound: '{}'", reference));
                    SampleData::Missing(reference.clone())
                }
            };
            let mut zone = SampleZone::new(&part.name.value, data);
            zone.key_low = Some(part.key_range.min.value.min(127));
            zone.key_high = Some(part.key_range.max.value.min(127));
            zone.key_root = Some(part.root_key.value.min(127));
            zone.vel_low = part.velocity_range.min.value.min(127);
            zone.vel_high = part.velocity_range.max.value.min(127);
            zone.tune = part.detune.value / 100.0;
            zone.key_tracking = (part.tune_scale.value / 100.0).clamp(0.0, 1.0);
            zone.panning = part.panorama.value.clamp(-1.0, 1.0);
            zone.gain = if part.volume.value > 0.0 { crate::math::decibels(part.volume.value) } else { 0.0 };
            zone.start = part.sample_start.value;
            zone.stop = part.sample_end.value;
            if let Some(l) = &part.sustain_loop {
                if l.mode.value > 0 && l.end.value > l.start.value {
                    zone.loops.push(Loop {
                        loop_type: if l.mode.value == 2 { LoopType::Alternating } else { LoopType::Forward },
                        start: l.start.value,
                        end: l.end.value,
                        crossfade_frames: l.crossfade.value,
                    });
                }
            }
            if let Some(env) = &xml.sampler.volume_envelope {
                zone.amp_env.envelope = Envelope {
                    attack: env.attack_time.as_ref().map(|v| v.value / 1000.0),
                    decay: env.decay_time.as_ref().map(|v| v.value / 1000.0),
                    sustain_level: env.sustain_level.as_ref().map(|v| v.value),
                    release: env.release_time.as_ref().map(|v| v.value / 1000.0),
                    ..Default::default()
                };
            }
            if !zone.sample.is_missing() {
                let frames = zone.sample.ensure_loaded()?.audio.frame_count;
                zone.conform_to_frames(frames);
            }
            group.zones.push(zone);
        }
        source.groups.push(group);
        source.prune_empty_groups();
        Ok(vec![source])
    }
}

pub struct AbletonCreator;

impl PresetWriter for AbletonCreator {
    fn format(&self) -> FormatId {
        FormatId::Ableton
    }

    fn wants_combined_stereo(&self) -> bool {
        true
    }

    fn write(
        &self,
        ctx: &Context,
        source: &mut MultiSampleSource,
        dest_dir: &Path,
        taken: &mut HashSet<String>,
    ) -> Result<Vec<PathBuf>, ConvError> {
        let out_path = unique_output_path(dest_dir, &source.name, "adv", taken);
        let samples_dir_name = format!("{} Samples", sanitize_file_name(&source.name));
        let samples_dir = dest_dir.join(&samples_dir_name);

        let shared_env = source.zones().map(|z| &z.amp_env.envelope).find(|e| e.is_set()).cloned();
        let mut xml = XmlAbleton {
            major_version: Some("5".to_string()),
            creator: Some(format!("presetconv {}", crate::fileutils::VERSION)),
            sampler: XmlMultiSampler {
                player: XmlPlayer::default(),
                volume_envelope: shared_env.map(|env| XmlEnvelope {
                    attack_time: env.attack.map(|v| Val::of(v * 1000.0)),
                    decay_time: env.decay.map(|v| Val::of(v * 1000.0)),
                    sustain_level: env.sustain_level.map(Val::of),
                    release_time: env.release.map(|v| Val::of(v * 1000.0)),
                }),
            },
        };

        let mut written = Vec::new();
        let mut entry_names: HashSet<String> = HashSet::new();
        let mut id = 0u32;
        // The date field is seconds since the epoch; Live 12 rejects the
        // millisecond values some exporters wrote.
        let last_mod = source
            .metadata
            .creation_date
            .map(|d| d.and_utc().timestamp())
            .unwrap_or(0);

        for group in &mut source.groups {
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
                std::fs::create_dir_all(&samples_dir)?;
                let sample_path = samples_dir.join(&file_name);
                let bytes = crate::wav::zone_wav_bytes(ctx, zone, &source.metadata)?;
                // The rewrite path may have trimmed; take the shape of
                // what was actually written.
                let audio = WavFile::parse(&mut std::io::Cursor::new(&bytes), &file_name)?.audio_metadata()?;
                std::fs::write(&sample_path, bytes)?;
                written.push(sample_path);
                zone.sample.evict();
                ctx.notifier.progress();

                xml.sampler.player.map.parts.parts.push(XmlSamplePart {
                    id,
                    name: Val::of(zone.name.clone()),
                    key_range: XmlRange { min: Val::of(zone.key_low_or(0)), max: Val::of(zone.key_high_or(127)) },
                    velocity_range: XmlRange { min: Val::of(zone.vel_low), max: Val::of(zone.vel_high) },
                    root_key: Val::of(zone.key_root_or(60)),
                    detune: Val::of(zone.tune * 100.0),
                    tune_scale: Val::of(zone.key_tracking * 100.0),
                    panorama: Val::of(zone.panning),
                    volume: Val::of(crate::math::gain(zone.gain)),
                    sample_start: Val::of(zone.start),
                    sample_end: Val::of(zone.stop),
                    sustain_loop: zone.loops.first().map(|l| XmlSustainLoop {
                        start: Val::of(l.start),
                        end: Val::of(l.end),
                        mode: Val::of(if l.loop_type == LoopType::Alternating { 2 } else { 1 }),
                        crossfade: Val::of(l.crossfade_frames),
                    }),
                    sample_ref: XmlSampleRef {
                        file_ref: XmlFileRef {
                            relative_path: Val::of(format!("{}/{}", samples_dir_name, file_name)),
                            path: None,
                            last_mod_date: Some(Val::of(last_mod)),
                        },
                        default_duration: Val::of(audio.frame_count),
                        default_sample_rate: Val::of(audio.sample_rate),
                    },
                });
                id += 1;
            }
        }

        let body = quick_xml::se::to_string(&xml).map_err(|e| ConvError::Xml(e.to_string()))?;
        let document = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", body);
        std::fs::write(&out_path, gzip_compress(document.as_bytes())?)?;
        written.insert(0, out_path);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Cancellation, MapSettings, NullNotifier};
    use crate::model::{AudioMetadata, PcmData};

    #[test]
    fn adv_round_trip_through_gzip() {
        let dir = std::env::temp_dir().join(format!("ableton-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);

        let frames = 16usize;
        let pcm = PcmData {
            audio: AudioMetadata { channels: 1, sample_rate: 44100, bits_per_sample: 16, frame_count: frames as u64, float: false },
            pcm: vec![0u8; frames * 2],
        };
        let mut source = MultiSampleSource::new("Lead");
        source.metadata.creation_date =
            chrono::NaiveDateTime::parse_from_str("2024-01-02 03:04:05", "%Y-%m-%d %H:%M:%S").ok();
        let mut group = Group::new("");
        let mut zone = SampleZone::new("L1", SampleData::Memory(pcm));
        zone.key_root = Some(64);
        zone.key_low = Some(60);
        zone.key_high = Some(68);
        zone.stop = frames as u64;
        zone.amp_env.envelope.attack = Some(0.25);
        group.zones.push(zone);
        source.groups.push(group);

        let mut taken = HashSet::new();
        let written = AbletonCreator.write(&ctx, &mut source, &dir, &mut taken).unwrap();
        let back = &AbletonDetector.read(&ctx, &written[0]).unwrap()[0];
        assert_eq!(back.groups[0].zones.len(), 1);
        let z = &back.groups[0].zones[0];
        assert_eq!(z.key_root, Some(64));
        assert_eq!(z.amp_env.envelope.attack, Some(0.25));

        // The written date is in seconds, not milliseconds.
        let raw = std::fs::read(&written[0]).unwrap();
        let xml = String::from_utf8(gzip_decompress(&raw).unwrap()).unwrap();
        let date_at = xml.find("LastModDate").unwrap();
        let value: String = xml[date_at..]
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        assert!(value.len() <= 10, "date '{}' looks like milliseconds", value);

        std::fs::remove_dir_all(&dir).ok();
    }
}
