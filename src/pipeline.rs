use std::collections::HashSet;
use std::path::{Path, PathBuf};

use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use walkdir::WalkDir;

use crate::dtype::{ConvError, Context};
use crate::model::{MultiSampleSource, ZoneChannels};

/// Identifiers for every codec the pipeline can dispatch to, as accepted
/// by `--source` and `--target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum FormatId {
    Wav,
    Sfz,
    Sf2,
    Bitwig,
    DecentSampler,
    Ableton,
    Korg,
    Exs24,
    Kontakt,
    Maschine,
    Ysfc,
}

/// Read capability: turn one preset file into canonical sources, or
/// decline by returning an empty list.
pub trait PresetReader {
    fn format(&self) -> FormatId;
    /// Lowercase extensions this reader claims.
    fn extensions(&self) -> &'static [&'static str];
    fn read(&self, ctx: &Context, path: &Path) -> Result<Vec<MultiSampleSource>, ConvError>;
}

/// Write capability: emit one canonical source into the destination
/// folder. Returns the files written.
pub trait PresetWriter {
    fn format(&self) -> FormatId;
    fn write(
        &self,
        ctx: &Context,
        source: &mut MultiSampleSource,
        dest_dir: &Path,
        taken: &mut HashSet<String>,
    ) -> Result<Vec<PathBuf>, ConvError>;
    /// True when the destination cannot express split-stereo zones and
    /// wants them combined up front.
    fn wants_combined_stereo(&self) -> bool {
        false
    }
}

pub fn reader_for(format: FormatId) -> Box<dyn PresetReader> {
    match format {
        FormatId::Wav => Box::new(crate::wavfolder::WavFolderDetector),
        FormatId::Sfz => Box::new(crate::sfz::SfzDetector),
        FormatId::Sf2 => Box::new(crate::sf2::Sf2Detector),
        FormatId::Bitwig => Box::new(crate::bitwig::BitwigDetector),
        FormatId::DecentSampler => Box::new(crate::decentsampler::DecentSamplerDetector),
        FormatId::Ableton => Box::new(crate::ableton::AbletonDetector),
        FormatId::Korg => Box::new(crate::korg::KorgDetector),
        FormatId::Exs24 => Box::new(crate::exs24::Exs24Detector),
        FormatId::Kontakt => Box::new(crate::kontakt::KontaktDetector),
        FormatId::Maschine => Box::new(crate::maschine::MaschineDetector),
        FormatId::Ysfc => Box::new(crate::ysfc::YsfcDetector),
    }
}

pub fn writer_for(format: FormatId) -> Result<Box<dyn PresetWriter>, ConvError> {
    Ok(match format {
        FormatId::Sfz => Box::new(crate::sfz::SfzCreator),
        FormatId::Sf2 => Box::new(crate::sf2::Sf2Creator),
        FormatId::Bitwig => Box::new(crate::bitwig::BitwigCreator),
        FormatId::DecentSampler => Box::new(crate::decentsampler::DecentSamplerCreator),
        FormatId::Ableton => Box::new(crate::ableton::AbletonCreator),
        FormatId::Korg => Box::new(crate::korg::KorgCreator),
        FormatId::Kontakt => Box::new(crate::kontakt::KontaktCreator),
        FormatId::Maschine => Box::new(crate::maschine::MaschineCreator),
        other => {
            return Err(ConvError::FeatureNotSupported(format!("'{}' is a source-only format", other)));
        }
    })
}

/// Options governing one conversion run, the CLI surface minus argv
/// parsing.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub source_formats: Vec<FormatId>,
    pub target_format: FormatId,
    /// Parse only, write nothing.
    pub analyze_only: bool,
    /// Mirror the source directory layout below the destination root.
    pub create_folder_structure: bool,
    /// Skip sources whose first output file already exists.
    pub add_new_files: bool,
    /// Preset rename mapping, already loaded from the mapping file.
    pub renames: Vec<(String, String)>,
    /// Crossfade width in notes injected at zone key borders; zero leaves
    /// zones untouched.
    pub inject_key_crossfade: u32,
    /// Crossfade width in velocity steps injected at layer borders.
    pub inject_velocity_crossfade: u32,
}

impl Default for PipelineOptions {
    fn default() -> PipelineOptions {
        PipelineOptions {
            source_formats: FormatId::iter().collect(),
            target_format: FormatId::Bitwig,
            analyze_only: false,
            create_folder_structure: false,
            add_new_files: false,
            renames: Vec::new(),
            inject_key_crossfade: 0,
            inject_velocity_crossfade: 0,
        }
    }
}

/// Outcome counters for the exit code: 0 clean, errors and cancellation
/// reported separately.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineReport {
    pub converted: usize,
    pub errors: usize,
    pub cancelled: bool,
}

/// Loads a rename mapping file: UTF-8, one pair per line, delimiter is the
/// first `,` or `;`, `#` lines and blanks ignored.
pub fn load_rename_file(path: &Path) -> Result<Vec<(String, String)>, ConvError> {
    let text = std::fs::read_to_string(path)?;
    let mut pairs = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim_start_matches('\u{FEFF}').trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let split_at = line.find([',', ';']).ok_or_else(|| {
            ConvError::Invalid(format!("Rename file line {} has no ',' or ';' delimiter", line_no + 1))
        })?;
        let (old, new) = line.split_at(split_at);
        pairs.push((old.trim().to_string(), new[1..].trim().to_string()));
    }
    Ok(pairs)
}

/// Walks the source tree and converts everything that matches. This is the
/// single entry point the CLI calls.
pub fn run(ctx: &Context, source_root: &Path, dest_root: &Path, options: &PipelineOptions) -> PipelineReport {
    let mut report = PipelineReport::default();
    let readers: Vec<Box<dyn PresetReader>> = options.source_formats.iter().map(|f| reader_for(*f)).collect();
    let writer = match writer_for(options.target_format) {
        Ok(w) => w,
        Err(e) => {
            ctx.notifier.error(&e.to_string());
            report.errors += 1;
            return report;
        }
    };
    let mut taken: HashSet<String> = HashSet::new();
    // WAV folders are detected once per directory, not once per file.
    let mut claimed_dirs: HashSet<PathBuf> = HashSet::new();

    for entry in WalkDir::new(source_root).follow_links(false).sort_by_file_name() {
        if ctx.cancellation.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                ctx.notifier.warn(&format!("IoError: {}", e));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let extension = match path.extension().and_then(|e| e.to_str()) {
            Some(e) => e.to_lowercase(),
            None => continue,
        };

        for reader in &readers {
            if !reader.extensions().contains(&extension.as_str()) {
                continue;
            }
            if reader.format() == FormatId::Wav {
                let dir = path.parent().unwrap_or(source_root).to_path_buf();
                if !claimed_dirs.insert(dir) {
                    break;
                }
            }
            match convert_one(ctx, path, source_root, dest_root, reader.as_ref(), writer.as_ref(), options, &mut taken) {
                Ok(count) => {
                    report.converted += count;
                    if count > 0 {
                        break;
                    }
                }
                Err(ConvError::Cancelled) => {
                    report.cancelled = true;
                    return report;
                }
                Err(e) => {
                    ctx.notifier.error(&format!("{}: {}", path.display(), e));
                    report.errors += 1;
                    break;
                }
            }
        }
    }
    ctx.notifier.progress_done();
    report
}

#[allow(clippy::too_many_arguments)]
fn convert_one(
    ctx: &Context,
    path: &Path,
    source_root: &Path,
    dest_root: &Path,
    reader: &dyn PresetReader,
    writer: &dyn PresetWriter,
    options: &PipelineOptions,
    taken: &mut HashSet<String>,
) -> Result<usize, ConvError> {
    let mut sources = reader.read(ctx, path)?;
    if sources.is_empty() {
        return Ok(0);
    }

    let dest_dir = if options.create_folder_structure {
        let relative = path.parent().and_then(|p| p.strip_prefix(source_root).ok()).unwrap_or(Path::new(""));
        dest_root.join(relative)
    } else {
        dest_root.to_path_buf()
    };

    let mut converted = 0;
    for source in &mut sources {
        ctx.cancellation.check()?;
        apply_renames(source, &options.renames);
        fill_breadcrumbs(source, path, source_root);
        let name = source.name.clone();
        let breadcrumbs = source.breadcrumbs.clone();
        crate::tags::enrich_metadata(&mut source.metadata, &name, &breadcrumbs);
        source.prune_empty_groups();
        for zone in source.zones_mut() {
            zone.sanitize(ctx.notifier);
        }
        inject_crossfades(source, options.inject_key_crossfade, options.inject_velocity_crossfade);
        if writer.wants_combined_stereo() && source.zone_channels()? == ZoneChannels::SplitStereo {
            combine_split_stereo(ctx, source)?;
        }
        if options.analyze_only {
            ctx.notifier.log(&format!(
                "{}: '{}' with {} groups, {} zones",
                reader.format(),
                source.name,
                source.groups.len(),
                source.zone_count()
            ));
            converted += 1;
            continue;
        }
        if options.add_new_files {
            let probe = dest_dir.join(crate::fileutils::sanitize_file_name(&source.name));
            if probe.exists() {
                ctx.notifier.log(&format!("Skipping '{}', output already present.", source.name));
                continue;
            }
        }
        std::fs::create_dir_all(&dest_dir)?;
        let written = writer.write(ctx, source, &dest_dir, taken)?;
        ctx.notifier.log(&format!("Wrote '{}' ({} files).", source.name, written.len()));
        converted += 1;
    }
    Ok(converted)
}

/// Widens zone borders into crossfades. Only borders that touch another
/// zone get a fade; outer edges stay hard.
fn inject_crossfades(source: &mut MultiSampleSource, key_width: u32, velocity_width: u32) {
    if key_width == 0 && velocity_width == 0 {
        return;
    }
    for zone in source.zones_mut() {
        if key_width > 0 {
            if zone.key_low_or(0) > 0 && zone.xfade_lo_key == 0 {
                zone.xfade_lo_key = key_width;
            }
            if zone.key_high_or(127) < 127 && zone.xfade_hi_key == 0 {
                zone.xfade_hi_key = key_width;
            }
        }
        if velocity_width > 0 {
            if zone.vel_low > 0 && zone.xfade_lo_vel == 0 {
                zone.xfade_lo_vel = velocity_width;
            }
            if zone.vel_high < 127 && zone.xfade_hi_vel == 0 {
                zone.xfade_hi_vel = velocity_width;
            }
        }
    }
}

fn apply_renames(source: &mut MultiSampleSource, renames: &[(String, String)]) {
    if let Some((_, new)) = renames.iter().find(|(old, _)| old == &source.name) {
        source.name = new.clone();
    }
}

fn fill_breadcrumbs(source: &mut MultiSampleSource, path: &Path, source_root: &Path) {
    if !source.breadcrumbs.is_empty() {
        return;
    }
    let mut crumbs = Vec::new();
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d.strip_prefix(source_root).map(|r| r.as_os_str().is_empty()).unwrap_or(true) {
            break;
        }
        if let Some(name) = d.file_name().and_then(|n| n.to_str()) {
            crumbs.push(name.to_string());
        }
        dir = d.parent();
    }
    source.breadcrumbs = crumbs;
}

/// Pairs hard-panned mono zones by root note and interleaves each pair
/// into one stereo zone. Pairing failures keep the left half and warn.
pub fn combine_split_stereo(ctx: &Context, source: &mut MultiSampleSource) -> Result<(), ConvError> {
    for group in &mut source.groups {
        let mut merged = Vec::new();
        let mut zones = std::mem::take(&mut group.zones);
        while !zones.is_empty() {
            let mut left = zones.remove(0);
            ctx.cancellation.check()?;
            // Prefer a partner by the `_L`/`_R` naming convention, then
            // fall back to matching zone metadata with opposite panning.
            let by_name = partner_name(&left.name).and_then(|wanted| {
                zones.iter().position(|z| z.name.eq_ignore_ascii_case(&wanted))
            });
            let partner = by_name.or_else(|| {
                zones.iter().position(|z| {
                    z.key_root == left.key_root
                        && z.vel_low == left.vel_low
                        && z.vel_high == left.vel_high
                        && z.panning * left.panning <= -1.0
                })
            });
            match partner {
                Some(at) => {
                    let mut right = zones.remove(at);
                    // The left half is whichever is panned left.
                    if left.panning > right.panning {
                        std::mem::swap(&mut left, &mut right);
                    }
                    let left_pcm = left.sample.ensure_loaded()?.clone();
                    let right_pcm = right.sample.ensure_loaded()?.clone();
                    match crate::audio::merge_split_stereo(&left_pcm, &right_pcm) {
                        Ok((stereo, truncated)) => {
                            if truncated {
                                ctx.notifier.warn(&format!(
                                    "Split-stereo halves of '{}' differ in length; truncated to the shorter.",
                                    left.name
                                ));
                            }
                            left.name = common_stem(&left.name, &right.name);
                            left.panning = 0.0;
                            let frames = stereo.audio.frame_count;
                            left.sample = crate::model::SampleData::Memory(stereo);
                            left.conform_to_frames(frames);
                            merged.push(left);
                        }
                        Err(e) => {
                            ctx.notifier.warn(&format!("SplitStereoMergeFailed: {}; keeping the left channel.", e));
                            left.panning = 0.0;
                            merged.push(left);
                        }
                    }
                }
                None => {
                    ctx.notifier.warn(&format!("SplitStereoMergeFailed: no partner for '{}'.", left.name));
                    left.panning = 0.0;
                    merged.push(left);
                }
            }
        }
        group.zones = merged;
    }
    Ok(())
}

/// Strips the `_L`/`_R` style suffix shared by a split pair.
fn common_stem(left: &str, right: &str) -> String {
    let shared: String = left
        .chars()
        .zip(right.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a)
        .collect();
    let trimmed = shared.trim_end_matches(['_', '-', ' ', '.']);
    if trimmed.is_empty() { left.to_string() } else { trimmed.to_string() }
}

/// Suffix pairs recognized as the two halves of a split-stereo recording.
pub const SPLIT_SUFFIXES: [(&str, &str); 4] = [("_L", "_R"), ("-L", "-R"), (" L", " R"), (".L", ".R")];

/// The opposite half's name for a suffix-convention split file, if the
/// name follows one.
fn partner_name(name: &str) -> Option<String> {
    for (left, right) in SPLIT_SUFFIXES {
        if let Some(stem) = name.strip_suffix(left) {
            return Some(format!("{}{}", stem, right));
        }
        if let Some(stem) = name.strip_suffix(right) {
            return Some(format!("{}{}", stem, left));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_file_accepts_both_delimiters() {
        let dir = std::env::temp_dir().join(format!("renames-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("map.csv");
        std::fs::write(&path, "# comment\nOld Piano,New Piano\nPad 1;Pad One\n\n").unwrap();
        let pairs = load_rename_file(&path).unwrap();
        assert_eq!(pairs, vec![
            ("Old Piano".to_string(), "New Piano".to_string()),
            ("Pad 1".to_string(), "Pad One".to_string()),
        ]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn common_stem_strips_pair_suffix() {
        assert_eq!(common_stem("Bass_L", "Bass_R"), "Bass");
        assert_eq!(common_stem("Keys L", "Keys R"), "Keys");
        assert_eq!(common_stem("x", "y"), "x");
    }

    #[test]
    fn format_ids_parse_from_cli_strings() {
        use std::str::FromStr;
        assert_eq!(FormatId::from_str("bitwig").unwrap(), FormatId::Bitwig);
        assert_eq!(FormatId::from_str("decentsampler").unwrap(), FormatId::DecentSampler);
        assert!(FormatId::from_str("nope").is_err());
    }

    #[test]
    fn every_bidirectional_format_has_a_writer() {
        for format in [
            FormatId::Sfz,
            FormatId::Sf2,
            FormatId::Bitwig,
            FormatId::DecentSampler,
            FormatId::Ableton,
            FormatId::Korg,
            FormatId::Kontakt,
            FormatId::Maschine,
        ] {
            assert!(writer_for(format).is_ok(), "'{}' should dispatch to a writer", format);
        }
        for format in [FormatId::Wav, FormatId::Exs24, FormatId::Ysfc] {
            assert!(writer_for(format).is_err(), "'{}' is read-only", format);
        }
    }
}
