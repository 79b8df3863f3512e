use std::collections::BTreeSet;

use phf::phf_map;

use crate::model::{Category, Metadata};

/// Synonym table mapping lowercase tokens found in names and paths onto
/// the closed category taxonomy. Longest hit wins so "synth bass" lands on
/// Bass rather than Synth.
static CATEGORY_SYNONYMS: phf::Map<&'static str, Category> = phf_map! {
    "bass" => Category::Bass,
    "sub" => Category::Bass,
    "808" => Category::Bass,
    "bell" => Category::Bell,
    "glocken" => Category::Bell,
    "tubular" => Category::Bell,
    "brass" => Category::Brass,
    "trumpet" => Category::Brass,
    "trombone" => Category::Brass,
    "horn" => Category::Brass,
    "tuba" => Category::Brass,
    "marimba" => Category::ChromaticPercussion,
    "vibraphone" => Category::ChromaticPercussion,
    "xylophone" => Category::ChromaticPercussion,
    "kalimba" => Category::ChromaticPercussion,
    "drum" => Category::Drum,
    "kick" => Category::Drum,
    "snare" => Category::Drum,
    "tom" => Category::Drum,
    "hihat" => Category::Drum,
    "hi-hat" => Category::Drum,
    "cymbal" => Category::Drum,
    "kit" => Category::Drum,
    "ensemble" => Category::Ensemble,
    "fx" => Category::Fx,
    "effect" => Category::Fx,
    "riser" => Category::Fx,
    "impact" => Category::Fx,
    "guitar" => Category::Guitar,
    "nylon" => Category::Guitar,
    "strat" => Category::Guitar,
    "banjo" => Category::Guitar,
    "keyboard" => Category::Keyboard,
    "clav" => Category::Keyboard,
    "harpsichord" => Category::Keyboard,
    "rhodes" => Category::Keyboard,
    "wurlitzer" => Category::Keyboard,
    "epiano" => Category::Keyboard,
    "e-piano" => Category::Keyboard,
    "lead" => Category::Lead,
    "loop" => Category::Loop,
    "break" => Category::Loop,
    "orchestra" => Category::Orchestral,
    "orchestral" => Category::Orchestral,
    "organ" => Category::Organ,
    "hammond" => Category::Organ,
    "pad" => Category::Pad,
    "atmosphere" => Category::Pad,
    "percussion" => Category::Percussion,
    "conga" => Category::Percussion,
    "bongo" => Category::Percussion,
    "shaker" => Category::Percussion,
    "tabla" => Category::Percussion,
    "piano" => Category::Piano,
    "grand" => Category::Piano,
    "upright" => Category::Piano,
    "flute" => Category::Pipe,
    "recorder" => Category::Pipe,
    "whistle" => Category::Pipe,
    "pluck" => Category::Pluck,
    "harp" => Category::Pluck,
    "mandolin" => Category::Pluck,
    "pizzicato" => Category::Pluck,
    "string" => Category::Strings,
    "strings" => Category::Strings,
    "violin" => Category::Strings,
    "viola" => Category::Strings,
    "cello" => Category::Strings,
    "contrabass" => Category::Strings,
    "synth" => Category::Synth,
    "saw" => Category::Synth,
    "analog" => Category::Synth,
    "vocal" => Category::Vocal,
    "voice" => Category::Vocal,
    "choir" => Category::Vocal,
    "vox" => Category::Vocal,
    "sax" => Category::Winds,
    "saxophone" => Category::Winds,
    "clarinet" => Category::Winds,
    "oboe" => Category::Winds,
    "bassoon" => Category::Winds,
    "wind" => Category::Winds,
    "sitar" => Category::World,
    "koto" => Category::World,
    "shamisen" => Category::World,
    "didgeridoo" => Category::World,
};

/// Tokens that never carry meaning for naming, stripped before keyword
/// collection.
static STOP_WORDS: phf::Map<&'static str, ()> = phf_map! {
    "the" => (), "and" => (), "of" => (), "samples" => (), "sample" => (),
    "multisample" => (), "multi" => (), "patch" => (), "preset" => (),
    "instrument" => (), "sounds" => (), "sound" => (),
};

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Picks a category from the given texts, most specific text first.
/// Within a text, tokens are scanned right to left because the instrument
/// noun usually ends the name ("Analog Synth Bass" is a bass); the longest
/// synonym inside the winning token decides.
pub fn detect_category(texts: &[&str]) -> Category {
    for text in texts {
        let lower = text.to_lowercase();
        for token in tokens(&lower).iter().rev() {
            let mut best: Option<(usize, Category)> = None;
            for (syn, cat) in CATEGORY_SYNONYMS.entries() {
                if token.contains(syn) && best.map_or(true, |(len, _)| syn.len() > len) {
                    best = Some((syn.len(), *cat));
                }
            }
            if let Some((_, cat)) = best {
                return cat;
            }
        }
    }
    Category::Unknown
}

/// Collects keywords from name and path parts: alphabetic tokens that are
/// not stop words, not note names and not pure numbers.
pub fn detect_keywords(texts: &[&str]) -> BTreeSet<String> {
    let mut keywords = BTreeSet::new();
    for text in texts {
        for token in tokens(text) {
            if token.len() < 3
                || STOP_WORDS.contains_key(token.as_str())
                || parse_note_name(&token).is_some()
                || token.chars().all(|c| c.is_ascii_digit())
            {
                continue;
            }
            keywords.insert(token);
        }
    }
    keywords
}

/// Fills only the metadata gaps: existing values are the source format's
/// own and always win over inference.
pub fn enrich_metadata(metadata: &mut Metadata, name: &str, breadcrumbs: &[String]) {
    let crumb_refs: Vec<&str> = std::iter::once(name).chain(breadcrumbs.iter().map(|s| s.as_str())).collect();
    if metadata.category == Category::Unknown {
        metadata.category = detect_category(&crumb_refs);
    }
    if metadata.keywords.is_empty() {
        metadata.keywords = detect_keywords(&crumb_refs);
    }
    if metadata.creator.is_none() {
        // The library vendor usually names the top-level folder.
        if let Some(top) = breadcrumbs.last() {
            if detect_category(&[top]) == Category::Unknown && !top.is_empty() {
                metadata.creator = Some(top.clone());
            }
        }
    }
}

/// Note name to MIDI number with C4 = 60. Accepts sharps (`#`, `s`),
/// flats (`b`), and octaves -2..8, upper or lower case.
pub fn parse_note_name(text: &str) -> Option<u8> {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    let letter = bytes[0].to_ascii_uppercase();
    let mut semitone: i32 = match letter {
        b'C' => 0,
        b'D' => 2,
        b'E' => 4,
        b'F' => 5,
        b'G' => 7,
        b'A' => 9,
        b'B' => 11,
        _ => return None,
    };
    let mut at = 1;
    match bytes.get(at) {
        Some(b'#') => {
            semitone += 1;
            at += 1;
        }
        Some(b'b') => {
            semitone -= 1;
            at += 1;
        }
        Some(b's') | Some(b'S') => {
            semitone += 1;
            at += 1;
        }
        _ => {}
    }
    let octave: i32 = text.get(at..)?.parse().ok()?;
    if !(-2..=8).contains(&octave) {
        return None;
    }
    let midi = (octave + 1) * 12 + semitone;
    if (0..=127).contains(&midi) {
        Some(midi as u8)
    } else {
        None
    }
}

/// MIDI number back to a display note name, sharps only.
pub fn note_name(midi: u8) -> String {
    const NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    format!("{}{}", NAMES[midi as usize % 12], midi as i32 / 12 - 1)
}

/// Scans a file stem for a note token, e.g. `Piano_C3_v64` finds C3.
/// Later tokens win so `Grand-A_Db2` resolves to Db2, not A.
pub fn find_note_in_name(stem: &str) -> Option<u8> {
    let mut found = None;
    for token in stem.split(|c: char| c == '_' || c == '-' || c == ' ' || c == '.') {
        if let Some(note) = parse_note_name(token) {
            found = Some(note);
        } else if let Ok(value) = token.parse::<u8>() {
            // Bare MIDI numbers also appear in sample names.
            if value <= 127 && token.len() <= 3 && found.is_none() {
                found = Some(value);
            }
        }
    }
    found
}

/// Scans a file stem for a velocity token like `v64` or `vel127`.
pub fn find_velocity_in_name(stem: &str) -> Option<u8> {
    for token in stem.split(|c: char| c == '_' || c == '-' || c == ' ' || c == '.') {
        let lower = token.to_lowercase();
        let digits = match lower.strip_prefix("vel").or_else(|| lower.strip_prefix('v')) {
            Some(d) if !d.is_empty() => d,
            _ => continue,
        };
        if let Ok(value) = digits.parse::<u8>() {
            if value <= 127 {
                return Some(value);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_reads_the_trailing_noun() {
        assert_eq!(detect_category(&["Analog Synth Bass 01"]), Category::Bass);
        assert_eq!(detect_category(&["Bass Synth"]), Category::Synth);
    }

    #[test]
    fn category_from_path_fallback() {
        assert_eq!(detect_category(&["Untitled 12", "Upright Pianos"]), Category::Piano);
        assert_eq!(detect_category(&["zzz"]), Category::Unknown);
    }

    #[test]
    fn note_names_with_flats_follow_c4_60() {
        assert_eq!(parse_note_name("C4"), Some(60));
        assert_eq!(parse_note_name("Eb2"), Some(39));
        assert_eq!(parse_note_name("F#3"), Some(54));
        assert_eq!(parse_note_name("Db-1"), Some(1));
        assert_eq!(parse_note_name("H2"), None);
        assert_eq!(note_name(39), "D#2");
    }

    #[test]
    fn filename_tokens_yield_note_and_velocity() {
        assert_eq!(find_note_in_name("Piano_C3_v64"), Some(48));
        assert_eq!(find_velocity_in_name("Piano_C3_v64"), Some(64));
        assert_eq!(find_velocity_in_name("Piano_C3"), None);
    }

    #[test]
    fn keywords_skip_noise() {
        let kw = detect_keywords(&["Warm Grand Piano C3 001"]);
        assert!(kw.contains("warm"));
        assert!(kw.contains("grand"));
        assert!(!kw.contains("c3"));
        assert!(!kw.contains("001"));
    }
}
