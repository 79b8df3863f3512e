use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::Seek,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, NaiveDateTime};

use crate::dtype::ConvError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Creation (or, failing that, modification) time of a file as local
/// naive date-time, used for metadata and archive entry timestamps.
pub fn file_creation_date<P: AsRef<Path>>(path: P) -> Option<NaiveDateTime> {
    let meta = std::fs::metadata(&path).ok()?;
    let time = meta.created().or_else(|_| meta.modified()).ok()?;
    let dt: DateTime<Local> = time.into();
    Some(dt.naive_local())
}

pub fn open_file_overwrite_rw<P: AsRef<Path>>(path: P) -> Result<File, ConvError> {
    let mut file = OpenOptions::new().append(false).create(true).read(true).write(true).open(path)?;
    file.set_len(0)?;
    file.seek(std::io::SeekFrom::Start(0))?;
    Ok(file)
}

pub fn valid_file_of_type<P: AsRef<Path>>(path: P, extensions: &[&str]) -> bool {
    if let Ok(file_metadata) = std::fs::metadata(&path) {
        let is_file = file_metadata.is_file();
        if let Some(extension) = path.as_ref().extension().and_then(|e| e.to_str()) {
            let lower = extension.to_lowercase();
            return is_file && extensions.iter().any(|e| e.eq_ignore_ascii_case(&lower));
        }
    }
    false
}

/// Strips characters that the common target filesystems reject.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.');
    if trimmed.is_empty() { "untitled".to_string() } else { trimmed.to_string() }
}

/// Returns a path in `dir` that does not collide with anything on disk or
/// anything produced earlier in this run, adding a ` (n)` tail on clash.
pub fn unique_output_path(dir: &Path, stem: &str, extension: &str, taken: &mut HashSet<String>) -> PathBuf {
    let stem = sanitize_file_name(stem);
    let mut candidate = format!("{}.{}", stem, extension);
    let mut counter = 1;
    while taken.contains(&candidate.to_lowercase()) || dir.join(&candidate).exists() {
        candidate = format!("{} ({}).{}", stem, counter, extension);
        counter += 1;
    }
    taken.insert(candidate.to_lowercase());
    dir.join(candidate)
}

/// DOS 8.3 name from a free-form stem: uppercase, at most eight
/// characters, alphanumerics only. Collisions get a numeric tail.
pub fn dos_name(stem: &str, taken: &mut HashSet<String>) -> String {
    let mut base: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_uppercase();
    if base.is_empty() {
        base = "SAMPLE".to_string();
    }
    if !taken.contains(&base) {
        taken.insert(base.clone());
        return base;
    }
    for counter in 1.. {
        let tail = counter.to_string();
        let keep = 8usize.saturating_sub(tail.len());
        let candidate = format!("{}{}", &base[..keep.min(base.len())], tail);
        if !taken.contains(&candidate) {
            taken.insert(candidate.clone());
            return candidate;
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_reserved_characters() {
        assert_eq!(sanitize_file_name("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize_file_name("  ."), "untitled");
    }

    #[test]
    fn unique_paths_get_numeric_tails() {
        let mut taken = HashSet::new();
        let dir = Path::new("/nonexistent-for-test");
        let first = unique_output_path(dir, "Piano", "kmp", &mut taken);
        let second = unique_output_path(dir, "Piano", "kmp", &mut taken);
        assert_eq!(first.file_name().unwrap(), "Piano.kmp");
        assert_eq!(second.file_name().unwrap(), "Piano (1).kmp");
    }

    #[test]
    fn dos_names_stay_unique_in_eight_chars() {
        let mut taken = HashSet::new();
        assert_eq!(dos_name("Grand Piano Soft", &mut taken), "GRANDPIA");
        let second = dos_name("Grand Piano Loud", &mut taken);
        assert_eq!(second, "GRANDPI1");
        assert_ne!(dos_name("Grand Piano Hard", &mut taken), second);
    }
}
