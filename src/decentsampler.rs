use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::container::{ArchiveReader, ArchiveWriter};
use crate::dtype::{ConvError, Context, Settings as _};
use crate::fileutils::{sanitize_file_name, unique_output_path};
use crate::math::decibels;
use crate::model::{
    Envelope, Filter, FilterType, Group, Loop, LoopType, MultiSampleSource, PlayLogic, SampleData,
    SampleZone, TriggerType,
};
use crate::pipeline::{FormatId, PresetReader, PresetWriter};
use crate::tags::parse_note_name;
use crate::wav::WavFile;

/// DecentSampler presets: `.dspreset` XML next to its samples, or a
/// `.dslibrary` compressed archive bundling several presets with theirs.

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename = "DecentSampler")]
struct XmlDecentSampler {
    #[serde(rename = "@minVersion", skip_serializing_if = "Option::is_none")]
    min_version: Option<String>,
    groups: Option<XmlGroups>,
    effects: Option<XmlEffects>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlGroups {
    #[serde(rename = "@attack", skip_serializing_if = "Option::is_none")]
    attack: Option<f64>,
    #[serde(rename = "@decay", skip_serializing_if = "Option::is_none")]
    decay: Option<f64>,
    #[serde(rename = "@sustain", skip_serializing_if = "Option::is_none")]
    sustain: Option<f64>,
    #[serde(rename = "@release", skip_serializing_if = "Option::is_none")]
    release: Option<f64>,
    #[serde(rename = "@volume", skip_serializing_if = "Option::is_none")]
    volume: Option<String>,
    #[serde(rename = "group", default)]
    groups: Vec<XmlGroup>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlGroup {
    #[serde(rename = "@name", skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "@trigger", skip_serializing_if = "Option::is_none")]
    trigger: Option<String>,
    #[serde(rename = "@seqMode", skip_serializing_if = "Option::is_none")]
    seq_mode: Option<String>,
    #[serde(rename = "@attack", skip_serializing_if = "Option::is_none")]
    attack: Option<f64>,
    #[serde(rename = "@decay", skip_serializing_if = "Option::is_none")]
    decay: Option<f64>,
    #[serde(rename = "@sustain", skip_serializing_if = "Option::is_none")]
    sustain: Option<f64>,
    #[serde(rename = "@release", skip_serializing_if = "Option::is_none")]
    release: Option<f64>,
    #[serde(rename = "sample", default)]
    samples: Vec<XmlSample>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlSample {
    #[serde(rename = "@path")]
    path: String,
    /// MIDI number or note name, flats included.
    #[serde(rename = "@rootNote", skip_serializing_if = "Option::is_none")]
    root_note: Option<String>,
    #[serde(rename = "@loNote", skip_serializing_if = "Option::is_none")]
    lo_note: Option<String>,
    #[serde(rename = "@hiNote", skip_serializing_if = "Option::is_none")]
    hi_note: Option<String>,
    #[serde(rename = "@loVel", skip_serializing_if = "Option::is_none")]
    lo_vel: Option<u8>,
    #[serde(rename = "@hiVel", skip_serializing_if = "Option::is_none")]
    hi_vel: Option<u8>,
    #[serde(rename = "@start", skip_serializing_if = "Option::is_none")]
    start: Option<u64>,
    #[serde(rename = "@end", skip_serializing_if = "Option::is_none")]
    end: Option<u64>,
    #[serde(rename = "@tuning", skip_serializing_if = "Option::is_none")]
    tuning: Option<f64>,
    #[serde(rename = "@volume", skip_serializing_if = "Option::is_none")]
    volume: Option<String>,
    /// -100..100.
    #[serde(rename = "@pan", skip_serializing_if = "Option::is_none")]
    pan: Option<f64>,
    #[serde(rename = "@loopStart", skip_serializing_if = "Option::is_none")]
    loop_start: Option<u64>,
    #[serde(rename = "@loopEnd", skip_serializing_if = "Option::is_none")]
    loop_end: Option<u64>,
    #[serde(rename = "@loopCrossfade", skip_serializing_if = "Option::is_none")]
    loop_crossfade: Option<u64>,
    #[serde(rename = "@loopEnabled", skip_serializing_if = "Option::is_none")]
    loop_enabled: Option<bool>,
    #[serde(rename = "@seqPosition", skip_serializing_if = "Option::is_none")]
    seq_position: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlEffects {
    #[serde(rename = "effect", default)]
    effects: Vec<XmlEffect>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct XmlEffect {
    #[serde(rename = "@type")]
    effect_type: String,
    #[serde(rename = "@frequency", skip_serializing_if = "Option::is_none")]
    frequency: Option<f64>,
    #[serde(rename = "@resonance", skip_serializing_if = "Option::is_none")]
    resonance: Option<f64>,
}

/// MIDI number or note name with flats, e.g. `62` or `Eb2`.
fn parse_note_value(text: &str) -> Option<u8> {
    if let Ok(v) = text.trim().parse::<i32>() {
        return (0..=127).contains(&v).then_some(v as u8);
    }
    parse_note_name(text.trim())
}

/// `3dB` style or a plain linear gain.
fn parse_volume(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if let Some(db) = trimmed.strip_suffix("dB").or_else(|| trimmed.strip_suffix("db")) {
        return db.trim().parse().ok();
    }
    trimmed.parse::<f64>().ok().map(|linear| if linear > 0.0 { decibels(linear) } else { -96.0 })
}

/// Some in-the-wild presets open with comments before the declaration;
/// cut straight to the first `<` that starts real markup.
fn strip_leading_junk(text: &str) -> &str {
    if let Some(at) = text.find("<?xml") {
        return &text[at..];
    }
    match text.find('<') {
        Some(at) => &text[at..],
        None => text,
    }
}

pub struct DecentSamplerDetector;

impl PresetReader for DecentSamplerDetector {
    fn format(&self) -> FormatId {
        FormatId::DecentSampler
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["dspreset", "dslibrary"]
    }

    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
        if extension == "dslibrary" {
            self.read_library(ctx, path)
        } else {
            let text = std::fs::read_to_string(path)?;
            let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("preset");
            let dir = path.parent().unwrap_or(Path::new("."));
            let source = parse_preset(ctx, &text, name, &mut |sample_path| {
                crate::locator::find_sample(sample_path, dir, crate::locator::DEFAULT_SEARCH_DEPTH)
                    .map(SampleData::from_file)
            })?;
            Ok(vec![source])
        }
    }
}

impl DecentSamplerDetector {
    fn read_library(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let file = std::fs::File::open(path)?;
        let mut archive = ArchiveReader::open(file)?;
        let preset_entries: Vec<String> = archive
            .entry_names()
            .into_iter()
            .filter(|n| n.to_lowercase().ends_with(".dspreset"))
            .collect();
        let mut sources = Vec::new();
        for entry in preset_entries {
            ctx.cancellation.check()?;
            let text = String::from_utf8_lossy(&archive.read_entry(&entry)?).into_owned();
            let stem = Path::new(&entry).file_stem().and_then(|s| s.to_str()).unwrap_or("preset").to_string();
            let entry_dir = Path::new(&entry).parent().map(|p| p.to_path_buf()).unwrap_or_default();
            let source = parse_preset(ctx, &text, &stem, &mut |sample_path| {
                // Paths are forward-slashed relative to the preset entry;
                // absolute paths degrade to a name lookup in the archive.
                let normalized = sample_path.replace('\\', "/");
                let candidates = [
                    entry_dir.join(&normalized).to_string_lossy().into_owned(),
                    normalized.clone(),
                    Path::new(&normalized).file_name()?.to_str()?.to_string(),
                ];
                for candidate in &candidates {
                    if let Ok(bytes) = archive.read_entry(candidate) {
                        if let Ok(wav) = WavFile::parse(&mut Cursor::new(&bytes), candidate) {
                            if let Ok(pcm) = wav.pcm() {
                                return Some(SampleData::Memory(pcm));
                            }
                        }
                    }
                }
                None
            })?;
            sources.push(source);
        }
        Ok(sources)
    }
}

fn parse_preset(
    ctx: &Context,
    text: &str,
    name: &str,
    resolve: &mut dyn FnMut(&str) -> Option<SampleData>,
) -> Result<MultiSampleSource, ConvError> {
    let xml: XmlDecentSampler = quick_xml::de::from_str(strip_leading_junk(text))?;
    let mut source = MultiSampleSource::new(name);

    let groups_node = xml.groups.unwrap_or_default();
    let shared_env = envelope_from_attrs(groups_node.attack, groups_node.decay, groups_node.sustain, groups_node.release);

    for (index, xml_group) in groups_node.groups.iter().enumerate() {
        ctx.cancellation.check()?;
        let mut group = Group::new(xml_group.name.clone().unwrap_or_else(|| format!("Group {}", index + 1)).as_str());
        group.trigger = match xml_group.trigger.as_deref() {
            Some("release") => Some(TriggerType::Release),
            Some("first") => Some(TriggerType::First),
            Some("legato") => Some(TriggerType::Legato),
            Some("attack") => Some(TriggerType::Attack),
            _ => None,
        };
        let group_env = envelope_from_attrs(xml_group.attack, xml_group.decay, xml_group.sustain, xml_group.release);
        let round_robin = xml_group.seq_mode.as_deref() == Some("round_robin");

        for sample in &xml_group.samples {
            let data = match resolve(&sample.path) {
                Some(d) => d,
                None => {
                    ctx.notifier.warn(&format!("SampleNotFound: '{}'", sample.path));
                    SampleData::Missing(sample.path.clone())
                }
            };
            let stem = Path::new(&sample.path).file_stem().and_then(|s| s.to_str()).unwrap_or(&sample.path);
            let mut zone = SampleZone::new(stem, data);
            zone.key_root = sample.root_note.as_deref().and_then(parse_note_value);
            zone.key_low = sample.lo_note.as_deref().and_then(parse_note_value);
            zone.key_high = sample.hi_note.as_deref().and_then(parse_note_value);
            zone.vel_low = sample.lo_vel.unwrap_or(0).min(127);
            zone.vel_high = sample.hi_vel.unwrap_or(127).min(127);
            zone.start = sample.start.unwrap_or(0);
            zone.stop = sample.end.unwrap_or(0);
            zone.tune = sample.tuning.unwrap_or(0.0);
            zone.gain = sample.volume.as_deref().and_then(parse_volume).unwrap_or(0.0);
            zone.panning = (sample.pan.unwrap_or(0.0) / 100.0).clamp(-1.0, 1.0);
            if round_robin {
                zone.play_logic = PlayLogic::RoundRobin;
                zone.rr_index = sample.seq_position.unwrap_or(0);
            }
            if let (Some(start), Some(end)) = (sample.loop_start, sample.loop_end) {
                if sample.loop_enabled.unwrap_or(true) && end > start {
                    zone.loops.push(Loop {
                        loop_type: LoopType::Forward,
                        start,
                        end,
                        crossfade_frames: sample.loop_crossfade.unwrap_or(0),
                    });
                }
            }
            let env = if group_env.is_set() { group_env.clone() } else { shared_env.clone() };
            if env.is_set() {
                zone.amp_env.envelope = env;
                zone.amp_env.depth = 1.0;
            }
            if !zone.sample.is_missing() {
                let frames = zone.sample.ensure_loaded()?.audio.frame_count;
                zone.conform_to_frames(frames);
            }
            group.zones.push(zone);
        }
        source.groups.push(group);
    }

    if let Some(effects) = &xml.effects {
        if let Some(effect) = effects.effects.iter().find(|e| {
            matches!(e.effect_type.as_str(), "lowpass" | "highpass" | "bandpass" | "notch")
        }) {
            source.global_filter = Some(Filter {
                filter_type: match effect.effect_type.as_str() {
                    "highpass" => FilterType::HighPass,
                    "bandpass" => FilterType::BandPass,
                    "notch" => FilterType::Notch,
                    _ => FilterType::LowPass,
                },
                cutoff_hz: effect.frequency.unwrap_or(22000.0),
                resonance: effect.resonance.unwrap_or(0.0).clamp(0.0, 1.0),
                ..Default::default()
            });
        }
    }

    source.prune_empty_groups();
    Ok(source)
}

fn envelope_from_attrs(attack: Option<f64>, decay: Option<f64>, sustain: Option<f64>, release: Option<f64>) -> Envelope {
    Envelope { attack, decay, sustain_level: sustain, release, ..Default::default() }
}

pub struct DecentSamplerCreator;

impl PresetWriter for DecentSamplerCreator {
    fn format(&self) -> FormatId {
        FormatId::DecentSampler
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
        let as_library = ctx.settings.get_bool("dsLibrary", false);
        let (xml, samples) = build_preset(ctx, source)?;
        let body = quick_xml::se::to_string(&xml).map_err(|e| ConvError::Xml(e.to_string()))?;
        let document = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", body);

        if as_library {
            let out_path = unique_output_path(dest_dir, &source.name, "dslibrary", taken);
            let file = crate::fileutils::open_file_overwrite_rw(&out_path)?;
            let mut archive = ArchiveWriter::new_deflated(file, source.metadata.creation_date);
            archive.add_entry(&format!("{}.dspreset", sanitize_file_name(&source.name)), document.as_bytes())?;
            for (name, bytes) in samples {
                ctx.cancellation.check()?;
                archive.add_entry(&name, &bytes)?;
                ctx.notifier.progress();
            }
            archive.finish()?;
            Ok(vec![out_path])
        } else {
            let out_path = unique_output_path(dest_dir, &source.name, "dspreset", taken);
            let mut written = vec![out_path.clone()];
            std::fs::write(&out_path, document)?;
            for (name, bytes) in samples {
                ctx.cancellation.check()?;
                let sample_path = dest_dir.join(&name);
                if let Some(parent) = sample_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&sample_path, bytes)?;
                written.push(sample_path);
                ctx.notifier.progress();
            }
            Ok(written)
        }
    }
}

/// Builds the preset XML and the sample files it references, named
/// `Samples/<zone>.wav` relative to the preset.
fn build_preset(ctx: &Context, source: &mut MultiSampleSource) -> Result<(XmlDecentSampler, Vec<(String, Vec<u8>)>), ConvError> {
    let mut samples_out: Vec<(String, Vec<u8>)> = Vec::new();
    let mut entry_names: HashSet<String> = HashSet::new();
    let mut groups = XmlGroups::default();

    // The shared envelope comes from the first zone that has one.
    if let Some(env) = source.zones().map(|z| &z.amp_env.envelope).find(|e| e.is_set()) {
        groups.attack = env.attack;
        groups.decay = env.decay;
        groups.sustain = env.sustain_level;
        groups.release = env.release;
    }

    for group in &mut source.groups {
        ctx.cancellation.check()?;
        let mut xml_group = XmlGroup {
            name: (!group.name.is_empty()).then(|| group.name.clone()),
            trigger: group.trigger.map(|t| match t {
                TriggerType::Attack => "attack".to_string(),
                TriggerType::Release => "release".to_string(),
                TriggerType::First => "first".to_string(),
                TriggerType::Legato => "legato".to_string(),
            }),
            seq_mode: group.zones.iter().any(|z| z.play_logic == PlayLogic::RoundRobin).then(|| "round_robin".to_string()),
            ..Default::default()
        };

        for zone in &mut group.zones {
            if zone.sample.is_missing() {
                continue;
            }
            // Samples ship as WAV by default; `dsSampleFormat=flac`
            // compresses them instead.
            let use_flac = ctx.settings.get_str("dsSampleFormat", "wav").eq_ignore_ascii_case("flac");
            let extension = if use_flac { "flac" } else { "wav" };
            let mut file_name = format!("Samples/{}.{}", sanitize_file_name(&zone.name), extension);
            let mut counter = 1;
            while !entry_names.insert(file_name.to_lowercase()) {
                file_name = format!("Samples/{} ({}).{}", sanitize_file_name(&zone.name), counter, extension);
                counter += 1;
            }
            let bytes = if use_flac {
                let pcm = zone.sample.ensure_loaded()?.clone();
                crate::audio::encode_flac(&pcm)?
            } else {
                crate::wav::zone_wav_bytes(ctx, zone, &source.metadata)?
            };
            samples_out.push((file_name.clone(), bytes));
            zone.sample.evict();

            xml_group.samples.push(XmlSample {
                path: file_name,
                root_note: zone.key_root.map(|n| n.to_string()),
                lo_note: zone.key_low.map(|n| n.to_string()),
                hi_note: zone.key_high.map(|n| n.to_string()),
                lo_vel: Some(zone.vel_low),
                hi_vel: Some(zone.vel_high),
                start: Some(zone.start),
                end: (zone.stop > 0).then_some(zone.stop),
                tuning: (zone.tune != 0.0).then_some(zone.tune),
                volume: (zone.gain != 0.0).then(|| format!("{}dB", zone.gain)),
                pan: (zone.panning != 0.0).then_some(zone.panning * 100.0),
                loop_start: zone.loops.first().map(|l| l.start),
                loop_end: zone.loops.first().map(|l| l.end),
                loop_crossfade: zone.loops.first().and_then(|l| (l.crossfade_frames > 0).then_some(l.crossfade_frames)),
                loop_enabled: zone.loops.first().map(|_| true),
                seq_position: (zone.play_logic == PlayLogic::RoundRobin).then_some(zone.rr_index),
            });
        }
        groups.groups.push(xml_group);
    }

    let effects = source.global_filter.as_ref().map(|filter| XmlEffects {
        effects: vec![XmlEffect {
            effect_type: match filter.filter_type {
                FilterType::HighPass => "highpass".to_string(),
                FilterType::BandPass => "bandpass".to_string(),
                FilterType::Notch => "notch".to_string(),
                _ => "lowpass".to_string(),
            },
            frequency: Some(filter.cutoff_hz),
            resonance: Some(filter.resonance),
        }],
    });

    Ok((
        XmlDecentSampler { min_version: Some("1.0.0".to_string()), groups: Some(groups), effects },
        samples_out,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Cancellation, MapSettings, NullNotifier};

    #[test]
    fn note_values_accept_numbers_and_flats() {
        assert_eq!(parse_note_value("62"), Some(62));
        assert_eq!(parse_note_value("Eb2"), Some(39));
        assert_eq!(parse_note_value("300"), None);
    }

    #[test]
    fn volume_strings_parse_db_and_linear() {
        assert_eq!(parse_volume("3dB"), Some(3.0));
        assert_eq!(parse_volume("-6.5 dB".replace(' ', "").as_str()), Some(-6.5));
        let linear = parse_volume("0.5").unwrap();
        assert!((linear - decibels(0.5)).abs() < 1e-9);
    }

    #[test]
    fn preset_with_comment_prefix_and_note_names_parses() {
        let text = r#"<!-- exported by hand -->
<?xml version="1.0" encoding="UTF-8"?>
<DecentSampler minVersion="1.0.0">
  <groups attack="0.01" release="0.4">
    <group name="Main" seqMode="round_robin">
      <sample path="Samples/a.wav" rootNote="Eb2" loNote="36" hiNote="43" loVel="0" hiVel="127"
              loopStart="10" loopEnd="90" seqPosition="1"/>
    </group>
  </groups>
</DecentSampler>"#;
        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
        let source = parse_preset(&ctx, text, "test", &mut |_| None).unwrap();
        assert_eq!(source.groups.len(), 1);
        let zone = &source.groups[0].zones[0];
        assert_eq!(zone.key_root, Some(39));
        assert_eq!(zone.key_low, Some(36));
        assert!(zone.sample.is_missing());
        assert_eq!(zone.loops.len(), 1);
        assert_eq!(zone.play_logic, PlayLogic::RoundRobin);
        assert_eq!(zone.amp_env.envelope.attack, Some(0.01));
        assert_eq!(zone.amp_env.envelope.release, Some(0.4));
    }

    #[test]
    fn missing_sample_keeps_zone_per_error_contract() {
        let text = r#"<DecentSampler><groups><group><sample path="gone.wav" rootNote="60"/></group></groups></DecentSampler>"#;
        let settings = MapSettings::new();
        let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
        let source = parse_preset(&ctx, text, "test", &mut |_| None).unwrap();
        assert_eq!(source.zone_count(), 1);
        assert!(source.groups[0].zones[0].sample.is_missing());
    }
}
