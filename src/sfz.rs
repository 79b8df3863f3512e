use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::dtype::{ConvError, Context, Settings as _};
use crate::fileutils::{sanitize_file_name, unique_output_path};
use crate::model::{
    Envelope, EnvelopeModulator, Filter, FilterType, Group, Loop, LoopType, MultiSampleSource,
    PlayLogic, SampleData, SampleZone, TriggerType,
};
use crate::pipeline::{FormatId, PresetReader, PresetWriter};
use crate::tags::parse_note_name;

/// Pitch/filter envelope depths are carried as a fraction of one octave,
/// so `pitcheg_depth=1200` becomes 1.0.
const DEPTH_CENTS: f64 = 1200.0;
/// SFZ resonance is decibels; the model wants 0..1.
const RESONANCE_DB: f64 = 40.0;

/// Opcodes the reader interprets; anything else is reported when the
/// unsupported-opcode toggle is on.
const KNOWN_OPCODES: &[&str] = &[
    "sample", "key", "lokey", "hikey", "pitch_keycenter", "lovel", "hivel",
    "xfin_lokey", "xfin_hikey", "xfout_lokey", "xfout_hikey",
    "xfin_lovel", "xfin_hivel", "xfout_lovel", "xfout_hivel",
    "offset", "end", "direction", "loop_mode", "loop_start", "loop_end",
    "loopstart", "loopend", "pan", "volume", "tune", "transpose",
    "pitch_keytrack", "bend_up", "bend_down", "seq_length", "seq_position",
    "trigger", "default_path", "group_label",
    "ampeg_attack", "ampeg_hold", "ampeg_decay", "ampeg_sustain", "ampeg_release",
    "ampeg_attack_slope", "ampeg_decay_slope", "ampeg_release_slope",
    "pitcheg_attack", "pitcheg_hold", "pitcheg_decay", "pitcheg_sustain", "pitcheg_release",
    "pitcheg_attack_slope", "pitcheg_decay_slope", "pitcheg_release_slope", "pitcheg_depth",
    "fileg_attack", "fileg_hold", "fileg_decay", "fileg_sustain", "fileg_release",
    "fileg_attack_slope", "fileg_decay_slope", "fileg_release_slope", "fileg_depth",
    "fil_type", "cutoff", "resonance",
];

#[derive(Debug, Clone, PartialEq)]
enum SfzToken {
    Header(String),
    Opcode(String, String),
}

/// Tokenizes SFZ text. `//` comments run to end of line; a value extends
/// to the start of the next `name=` assignment on the same line, so sample
/// paths with spaces survive.
fn tokenize(text: &str, tokens: &mut Vec<SfzToken>) {
    for line in text.lines() {
        let line = match line.find("//") {
            Some(at) => &line[..at],
            None => line,
        };
        let mut rest = line.trim();
        while !rest.is_empty() {
            if let Some(stripped) = rest.strip_prefix('<') {
                match stripped.find('>') {
                    Some(end) => {
                        tokens.push(SfzToken::Header(stripped[..end].trim().to_lowercase()));
                        rest = stripped[end + 1..].trim_start();
                    }
                    None => break,
                }
                continue;
            }
            let eq = match rest.find('=') {
                Some(at) => at,
                None => break,
            };
            let name = rest[..eq].trim().to_lowercase();
            let value_part = &rest[eq + 1..];
            // The value ends where the next assignment's name begins.
            let mut value_end = value_part.len();
            if let Some(next_eq) = value_part.find('=') {
                let before = &value_part[..next_eq];
                if let Some(ws) = before.rfind(char::is_whitespace) {
                    value_end = ws;
                }
            }
            tokens.push(SfzToken::Opcode(name, value_part[..value_end].trim().to_string()));
            rest = value_part[value_end..].trim_start();
        }
    }
}

/// Loads a file and expands `#include "path"` directives recursively,
/// resolving each include relative to the file containing it. A file
/// including itself, directly or not, is a cycle.
fn load_with_includes(path: &Path, visited: &mut Vec<PathBuf>, tokens: &mut Vec<SfzToken>) -> Result<(), ConvError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if visited.contains(&canonical) {
        return Err(ConvError::CycleDetected(canonical));
    }
    visited.push(canonical);
    let text = std::fs::read_to_string(path)?;
    let dir = path.parent().unwrap_or(Path::new("."));

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("#include") {
            let rest = rest.trim();
            let included = rest.trim_matches('"');
            if included.is_empty() {
                return Err(ConvError::Invalid(format!("Malformed #include in '{}'", path.display())));
            }
            load_with_includes(&dir.join(included.replace('\\', "/")), visited, tokens)?;
        } else {
            tokenize(line, tokens);
        }
    }
    visited.pop();
    Ok(())
}

#[derive(Debug, Default, Clone)]
struct Scope {
    opcodes: IndexMap<String, String>,
}

impl Scope {
    fn get(&self, name: &str) -> Option<&str> {
        self.opcodes.get(name).map(|s| s.as_str())
    }
    fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.parse().ok())
    }
    fn u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.parse().ok())
    }
    fn note(&self, name: &str) -> Option<u8> {
        let v = self.get(name)?;
        if let Ok(n) = v.parse::<i32>() {
            return (0..=127).contains(&n).then_some(n as u8);
        }
        parse_note_name(v)
    }
}

pub struct SfzDetector;

impl PresetReader for SfzDetector {
    fn format(&self) -> FormatId {
        FormatId::Sfz
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["sfz"]
    }

    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError> {
        let mut tokens = Vec::new();
        load_with_includes(path, &mut Vec::new(), &mut tokens)?;

        let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("sfz");
        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let log_unsupported = ctx.settings.get_bool("sfzLogUnsupported", false);

        let mut source = MultiSampleSource::new(name);
        let mut global = Scope::default();
        let mut master = Scope::default();
        let mut master_seen = false;
        let mut group_scope = Scope::default();
        let mut current = None::<Scope>;
        let mut default_path = String::new();
        let mut regions: Vec<(usize, Scope)> = Vec::new();
        let mut group_count = 0usize;
        let mut group_names: Vec<String> = Vec::new();

        // The scope a token belongs to is decided by the last header seen.
        let mut target = "global".to_string();
        for token in tokens {
            match token {
                SfzToken::Header(h) => {
                    if let Some(scope) = current.take() {
                        regions.push((group_count.saturating_sub(1), scope));
                    }
                    match h.as_str() {
                        "global" | "control" => target = h,
                        "master" => {
                            master = Scope { opcodes: global.opcodes.clone() };
                            master_seen = true;
                            target = h;
                        }
                        "group" => {
                            // A group inherits from the nearest enclosing
                            // master, or straight from global without one.
                            let parent = if master_seen { &master } else { &global };
                            group_scope = Scope { opcodes: parent.opcodes.clone() };
                            group_count += 1;
                            group_names.push(String::new());
                            target = h;
                        }
                        "region" => {
                            let parent = if group_count > 0 {
                                &group_scope
                            } else if master_seen {
                                &master
                            } else {
                                &global
                            };
                            current = Some(Scope { opcodes: parent.opcodes.clone() });
                            target = h;
                        }
                        other => {
                            if log_unsupported {
                                ctx.notifier.warn(&format!("FeatureNotSupported: SFZ header <{}>", other));
                            }
                            target = "ignored".to_string();
                        }
                    }
                }
                SfzToken::Opcode(opcode_name, value) => {
                    if opcode_name == "default_path" {
                        default_path = value.replace('\\', "/");
                        continue;
                    }
                    if opcode_name == "group_label" && target == "group" {
                        if let Some(last) = group_names.last_mut() {
                            *last = value.clone();
                        }
                        continue;
                    }
                    match target.as_str() {
                        "global" | "control" => {
                            global.opcodes.insert(opcode_name, value);
                        }
                        "master" => {
                            master.opcodes.insert(opcode_name, value);
                        }
                        "group" => {
                            group_scope.opcodes.insert(opcode_name, value);
                        }
                        "region" => {
                            if let Some(scope) = current.as_mut() {
                                scope.opcodes.insert(opcode_name, value);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        if let Some(scope) = current.take() {
            regions.push((group_count.saturating_sub(1), scope));
        }
        if group_count == 0 {
            group_count = 1;
            group_names.push(String::new());
        }

        let mut groups: Vec<Group> = (0..group_count)
            .map(|i| Group::new(group_names.get(i).map(|s| s.as_str()).unwrap_or("")))
            .collect();

        for (group_index, scope) in regions {
            ctx.cancellation.check()?;
            let (zone, trigger, filter) = self.build_zone(ctx, &scope, &default_path, &dir, log_unsupported)?;
            if source.global_filter.is_none() {
                source.global_filter = filter;
            }
            let group = &mut groups[group_index.min(group_count - 1)];
            if group.trigger.is_none() {
                group.trigger = trigger;
            }
            group.zones.push(zone);
        }
        source.groups = groups;
        source.prune_empty_groups();
        Ok(vec![source])
    }
}

impl SfzDetector {
    fn build_zone(
        &self,
        ctx: &Context,
        scope: &Scope,
        default_path: &str,
        dir: &Path,
        log_unsupported: bool,
    ) -> Result<(SampleZone, Option<TriggerType>, Option<Filter>), ConvError> {
        if log_unsupported {
            for name in scope.opcodes.keys() {
                if !KNOWN_OPCODES.contains(&name.as_str()) {
                    ctx.notifier.warn(&format!("FeatureNotSupported: SFZ opcode '{}'", name));
                }
            }
        }
        let sample_ref = scope.get("sample").unwrap_or("").replace('\\', "/");
        let full_ref = if default_path.is_empty() {
            sample_ref.clone()
        } else {
            format!("{}/{}", default_path.trim_end_matches('/'), sample_ref)
        };
        let data = match crate::locator::find_sample(&full_ref, dir, crate::locator::DEFAULT_SEARCH_DEPTH) {
            Some(found) => SampleData::from_file(found),
            None => {
                ctx.notifier.warn(&format!("SampleNotFound: '{}'", full_ref));
                SampleData::Missing(full_ref.clone())
            }
        };
        let stem = Path::new(&sample_ref).file_stem().and_then(|s| s.to_str()).unwrap_or("region");
        let mut zone = SampleZone::new(stem, data);

        if let Some(key) = scope.note("key") {
            zone.key_low = Some(key);
            zone.key_high = Some(key);
            zone.key_root = Some(key);
        }
        if let Some(v) = scope.note("lokey") {
            zone.key_low = Some(v);
        }
        if let Some(v) = scope.note("hikey") {
            zone.key_high = Some(v);
        }
        if let Some(v) = scope.note("pitch_keycenter") {
            zone.key_root = Some(v);
        }
        if let Some(v) = scope.f64("lovel") {
            zone.vel_low = v.clamp(0.0, 127.0) as u8;
        }
        if let Some(v) = scope.f64("hivel") {
            zone.vel_high = v.clamp(0.0, 127.0) as u8;
        }
        zone.xfade_lo_key = crossfade_width(scope, "xfin_lokey", "xfin_hikey");
        zone.xfade_hi_key = crossfade_width(scope, "xfout_lokey", "xfout_hikey");
        zone.xfade_lo_vel = crossfade_width(scope, "xfin_lovel", "xfin_hivel");
        zone.xfade_hi_vel = crossfade_width(scope, "xfout_lovel", "xfout_hivel");

        zone.start = scope.u64("offset").unwrap_or(0);
        zone.stop = scope.u64("end").map(|e| e + 1).unwrap_or(0);
        if scope.get("direction") == Some("reverse") {
            zone.reversed = true;
        }
        zone.panning = (scope.f64("pan").unwrap_or(0.0) / 100.0).clamp(-1.0, 1.0);
        zone.gain = scope.f64("volume").unwrap_or(0.0);
        zone.tune = scope.f64("tune").unwrap_or(0.0) / 100.0 + scope.f64("transpose").unwrap_or(0.0);
        zone.key_tracking = (scope.f64("pitch_keytrack").unwrap_or(100.0) / 100.0).clamp(0.0, 1.0);
        zone.bend_up = scope.f64("bend_up").unwrap_or(200.0) as i32;
        zone.bend_down = scope.f64("bend_down").unwrap_or(-200.0) as i32;

        let loop_mode = scope.get("loop_mode").unwrap_or("");
        let loop_start = scope.u64("loop_start").or_else(|| scope.u64("loopstart"));
        let loop_end = scope.u64("loop_end").or_else(|| scope.u64("loopend"));
        let looping = matches!(loop_mode, "loop_continuous" | "loop_sustain")
            || (loop_mode.is_empty() && loop_start.is_some() && loop_end.is_some());
        if looping {
            if let (Some(start), Some(end)) = (loop_start, loop_end) {
                if end >= start {
                    zone.loops.push(Loop {
                        loop_type: LoopType::Forward,
                        start,
                        // loop_end is the last played frame.
                        end: end + 1,
                        crossfade_frames: 0,
                    });
                }
            }
        }

        zone.amp_env.envelope = read_envelope(scope, "ampeg");
        zone.amp_env.depth = 1.0;
        let pitch_env = read_envelope(scope, "pitcheg");
        if pitch_env.is_set() {
            zone.pitch_env = EnvelopeModulator {
                envelope: pitch_env,
                depth: (scope.f64("pitcheg_depth").unwrap_or(0.0) / DEPTH_CENTS).clamp(-1.0, 1.0),
            };
        }
        let file_env = read_envelope(scope, "fileg");
        let mut region_filter = None;
        let has_filter = scope.get("fil_type").is_some() || scope.get("cutoff").is_some();
        if has_filter {
            let (filter_type, poles) = match scope.get("fil_type").unwrap_or("lpf_2p") {
                "lpf_1p" => (FilterType::LowPass1p, 1),
                "lpf_4p" => (FilterType::LowPass, 4),
                "hpf_1p" | "hpf_2p" => (FilterType::HighPass, 2),
                "hpf_4p" => (FilterType::HighPass, 4),
                "bpf_1p" | "bpf_2p" => (FilterType::BandPass, 2),
                "brf_1p" | "brf_2p" => (FilterType::Notch, 2),
                "peq" => (FilterType::Peak, 2),
                _ => (FilterType::LowPass, 2),
            };
            let mut filter = Filter {
                filter_type,
                poles,
                cutoff_hz: scope.f64("cutoff").unwrap_or(20000.0),
                resonance: (scope.f64("resonance").unwrap_or(0.0) / RESONANCE_DB).clamp(0.0, 1.0),
                ..Default::default()
            };
            if file_env.is_set() {
                filter.cutoff_envelope = EnvelopeModulator {
                    envelope: file_env,
                    depth: (scope.f64("fileg_depth").unwrap_or(0.0) / DEPTH_CENTS).clamp(-1.0, 1.0),
                };
                zone.filter_env = Some(filter.cutoff_envelope.clone());
            }
            region_filter = Some(filter);
        }

        let seq_length = scope.u64("seq_length").unwrap_or(1);
        if seq_length > 1 {
            zone.play_logic = PlayLogic::RoundRobin;
            zone.rr_index = scope.u64("seq_position").unwrap_or(1) as u32;
        }

        let trigger = match scope.get("trigger") {
            Some("release") => Some(TriggerType::Release),
            Some("first") => Some(TriggerType::First),
            Some("legato") => Some(TriggerType::Legato),
            Some("attack") => Some(TriggerType::Attack),
            Some(other) => {
                if log_unsupported {
                    ctx.notifier.warn(&format!("FeatureNotSupported: trigger={}", other));
                }
                None
            }
            None => None,
        };

        if !zone.sample.is_missing() {
            let frames = zone.sample.ensure_loaded()?.audio.frame_count;
            zone.conform_to_frames(frames);
        }
        Ok((zone, trigger, region_filter))
    }
}

/// A crossfade window's width in notes or velocity steps.
fn crossfade_width(scope: &Scope, low: &str, high: &str) -> u32 {
    match (scope.f64(low), scope.f64(high)) {
        (Some(lo), Some(hi)) if hi >= lo => (hi - lo) as u32,
        _ => 0,
    }
}

fn read_envelope(scope: &Scope, prefix: &str) -> Envelope {
    Envelope {
        attack: scope.f64(&format!("{}_attack", prefix)),
        hold: scope.f64(&format!("{}_hold", prefix)),
        decay: scope.f64(&format!("{}_decay", prefix)),
        sustain_level: scope.f64(&format!("{}_sustain", prefix)).map(|v| (v / 100.0).clamp(0.0, 1.0)),
        release: scope.f64(&format!("{}_release", prefix)),
        attack_slope: scope.f64(&format!("{}_attack_slope", prefix)).unwrap_or(0.0).clamp(-1.0, 1.0),
        decay_slope: scope.f64(&format!("{}_decay_slope", prefix)).unwrap_or(0.0).clamp(-1.0, 1.0),
        release_slope: scope.f64(&format!("{}_release_slope", prefix)).unwrap_or(0.0).clamp(-1.0, 1.0),
    }
}

pub struct SfzCreator;

impl PresetWriter for SfzCreator {
    fn format(&self) -> FormatId {
        FormatId::Sfz
    }

    fn write(
        &self,
        ctx: &Context,
        source: &mut MultiSampleSource,
        dest_dir: &Path,
        taken: &mut HashSet<String>,
    ) -> Result<Vec<PathBuf>, ConvError> {
        let out_path = unique_output_path(dest_dir, &source.name, "sfz", taken);
        let samples_dir_name = sanitize_file_name(&source.name);
        let samples_dir = dest_dir.join(&samples_dir_name);

        let mut text = String::new();
        let _ = writeln!(text, "// {}", source.name);
        if let Some(creator) = &source.metadata.creator {
            let _ = writeln!(text, "// Creator: {}", creator);
        }

        // SFZ has no global filter slot once emission is restricted to
        // group and region headers, so the shared filter becomes a group
        // line repeated per group.
        let filter_lines = source.global_filter.as_ref().map(|filter| {
            let fil_type = match (filter.filter_type, filter.poles) {
                (FilterType::LowPass1p, _) => "lpf_1p",
                (FilterType::LowPass, 4) => "lpf_4p",
                (FilterType::LowPass, _) => "lpf_2p",
                (FilterType::HighPass, 4) => "hpf_4p",
                (FilterType::HighPass, _) => "hpf_2p",
                (FilterType::BandPass, _) => "bpf_2p",
                (FilterType::Notch, _) => "brf_2p",
                (FilterType::Peak, _) => "peq",
            };
            let mut lines = format!("fil_type={} cutoff={}\n", fil_type, filter.cutoff_hz.round());
            if filter.resonance > 0.0 {
                let _ = writeln!(lines, "resonance={}", (filter.resonance * RESONANCE_DB).round());
            }
            if filter.cutoff_envelope.is_active() {
                write_envelope(
                    &mut lines,
                    "fileg",
                    &filter.cutoff_envelope.envelope,
                    Some(filter.cutoff_envelope.depth * DEPTH_CENTS),
                );
            }
            lines
        });

        let mut written = Vec::new();
        let mut entry_names: HashSet<String> = HashSet::new();
        for group in &mut source.groups {
            ctx.cancellation.check()?;
            let _ = writeln!(text);
            let _ = writeln!(text, "<group>");
            if !group.name.is_empty() {
                let _ = writeln!(text, "group_label={}", group.name);
            }
            if let Some(lines) = &filter_lines {
                text.push_str(lines);
            }
            if let Some(trigger) = group.trigger {
                let _ = writeln!(text, "trigger={}", match trigger {
                    TriggerType::Attack => "attack",
                    TriggerType::Release => "release",
                    TriggerType::First => "first",
                    TriggerType::Legato => "legato",
                });
            }
            let round_robin_count = group
                .zones
                .iter()
                .filter(|z| z.play_logic == PlayLogic::RoundRobin)
                .count();
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
                std::fs::write(&sample_path, bytes)?;
                written.push(sample_path);
                zone.sample.evict();
                ctx.notifier.progress();

                let _ = writeln!(text, "<region>");
                let _ = writeln!(text, "sample={}/{}", samples_dir_name, file_name);
                if let Some(root) = zone.key_root {
                    let _ = writeln!(text, "pitch_keycenter={}", root);
                }
                if let Some(low) = zone.key_low {
                    let _ = writeln!(text, "lokey={}", low);
                }
                if let Some(high) = zone.key_high {
                    let _ = writeln!(text, "hikey={}", high);
                }
                let _ = writeln!(text, "lovel={} hivel={}", zone.vel_low, zone.vel_high);
                if zone.start > 0 {
                    let _ = writeln!(text, "offset={}", zone.start);
                }
                if zone.stop > 0 {
                    let _ = writeln!(text, "end={}", zone.stop - 1);
                }
                if zone.reversed {
                    let _ = writeln!(text, "direction=reverse");
                }
                if zone.tune != 0.0 {
                    let semitones = zone.tune.trunc() as i64;
                    let cents = (zone.tune.fract() * 100.0).round() as i64;
                    if semitones != 0 {
                        let _ = writeln!(text, "transpose={}", semitones);
                    }
                    if cents != 0 {
                        let _ = writeln!(text, "tune={}", cents);
                    }
                }
                if zone.gain != 0.0 {
                    let _ = writeln!(text, "volume={}", zone.gain);
                }
                if zone.panning != 0.0 {
                    let _ = writeln!(text, "pan={}", (zone.panning * 100.0).round());
                }
                if (zone.key_tracking - 1.0).abs() > f64::EPSILON {
                    let _ = writeln!(text, "pitch_keytrack={}", (zone.key_tracking * 100.0).round());
                }
                if zone.bend_up != 200 || zone.bend_down != -200 {
                    let _ = writeln!(text, "bend_up={} bend_down={}", zone.bend_up, zone.bend_down);
                }
                if let Some(l) = zone.loops.first() {
                    let _ = writeln!(text, "loop_mode=loop_continuous");
                    let _ = writeln!(text, "loop_start={} loop_end={}", l.start, l.end.saturating_sub(1));
                }
                write_envelope(&mut text, "ampeg", &zone.amp_env.envelope, None);
                if zone.pitch_env.is_active() {
                    write_envelope(
                        &mut text,
                        "pitcheg",
                        &zone.pitch_env.envelope,
                        Some(zone.pitch_env.depth * DEPTH_CENTS),
                    );
                }
                if zone.play_logic == PlayLogic::RoundRobin {
                    let _ = writeln!(text, "seq_length={} seq_position={}", round_robin_count.max(1), zone.rr_index.max(1));
                }
            }
        }

        std::fs::write(&out_path, text)?;
        written.insert(0, out_path);
        Ok(written)
    }
}

fn write_envelope(text: &mut String, prefix: &str, env: &Envelope, depth_cents: Option<f64>) {
    if !env.is_set() {
        return;
    }
    if let Some(v) = env.attack {
        let _ = writeln!(text, "{}_attack={}", prefix, v);
    }
    if let Some(v) = env.hold {
        let _ = writeln!(text, "{}_hold={}", prefix, v);
    }
    if let Some(v) = env.decay {
        let _ = writeln!(text, "{}_decay={}", prefix, v);
    }
    if let Some(v) = env.sustain_level {
        let _ = writeln!(text, "{}_sustain={}", prefix, v * 100.0);
    }
    if let Some(v) = env.release {
        let _ = writeln!(text, "{}_release={}", prefix, v);
    }
    if let Some(depth) = depth_cents {
        if depth != 0.0 {
            let _ = writeln!(text, "{}_depth={}", prefix, depth.round());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_keeps_spaces_in_sample_paths() {
        let mut tokens = Vec::new();
        tokenize("<region> sample=My Piano C3.wav lokey=48 hikey=60 // comment", &mut tokens);
        assert_eq!(tokens[0], SfzToken::Header("region".to_string()));
        assert_eq!(tokens[1], SfzToken::Opcode("sample".to_string(), "My Piano C3.wav".to_string()));
        assert_eq!(tokens[2], SfzToken::Opcode("lokey".to_string(), "48".to_string()));
        assert_eq!(tokens[3], SfzToken::Opcode("hikey".to_string(), "60".to_string()));
    }

    #[test]
    fn include_cycle_is_detected() {
        let dir = std::env::temp_dir().join(format!("sfz-cycle-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.sfz"), "#include \"b.sfz\"\n").unwrap();
        std::fs::write(dir.join("b.sfz"), "#include \"a.sfz\"\n").unwrap();
        let mut tokens = Vec::new();
        let result = load_with_includes(&dir.join("a.sfz"), &mut Vec::new(), &mut tokens);
        assert!(matches!(result, Err(ConvError::CycleDetected(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn include_tree_is_fully_expanded() {
        let dir = std::env::temp_dir().join(format!("sfz-include-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("common.sfz"), "ampeg_attack=0.02\nampeg_release=0.5\n").unwrap();
        std::fs::write(
            dir.join("main.sfz"),
            "<global>\n#include \"common.sfz\"\n<group>\n<region> sample=a.wav key=60\n",
        )
        .unwrap();
        let mut tokens = Vec::new();
        load_with_includes(&dir.join("main.sfz"), &mut Vec::new(), &mut tokens).unwrap();
        assert!(tokens.contains(&SfzToken::Opcode("ampeg_attack".to_string(), "0.02".to_string())));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn envelope_cascades_from_global_to_region() {
        let dir = std::env::temp_dir().join(format!("sfz-scope-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("inst.sfz"),
            "<global>\nampeg_release=0.7\n<group>\nlovel=0 hivel=63\n<region> sample=a.wav key=Eb2\n",
        )
        .unwrap();
        let settings = crate::dtype::MapSettings::new();
        let ctx = Context::new(&crate::dtype::NullNotifier, crate::dtype::Cancellation::new(), &settings);
        let source = &SfzDetector.read(&ctx, &dir.join("inst.sfz")).unwrap()[0];
        assert_eq!(source.groups.len(), 1);
        let zone = &source.groups[0].zones[0];
        assert_eq!(zone.key_root, Some(39));
        assert_eq!(zone.vel_high, 63);
        assert_eq!(zone.amp_env.envelope.release, Some(0.7));
        std::fs::remove_dir_all(&dir).ok();
    }
}
