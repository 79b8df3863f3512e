use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Default bound for the recursive search: how many parent directories to
/// climb and how many levels to descend from each.
pub const DEFAULT_SEARCH_DEPTH: usize = 6;

/// Resolves a sample reference from a preset file. References come in with
/// the source platform's separators and are often stale, so resolution is
/// a ladder: absolute path, path relative to the preset, then a bounded
/// recursive search by file name.
pub fn find_sample(reference: &str, preset_dir: &Path, search_depth: usize) -> Option<PathBuf> {
    let normalized = reference.replace('\\', "/");
    let as_path = Path::new(&normalized);

    if as_path.is_absolute() && as_path.is_file() {
        return Some(as_path.to_path_buf());
    }

    let relative = preset_dir.join(as_path);
    if relative.is_file() {
        return Some(relative);
    }

    // The reference may carry folders that no longer exist; from here on
    // only the file name matters.
    let file_name = as_path.file_name()?.to_str()?.to_string();
    let mut dir = preset_dir.to_path_buf();
    for _ in 0..=search_depth {
        if let Some(hit) = search_below(&dir, &file_name, search_depth) {
            return Some(hit);
        }
        dir = dir.parent()?.to_path_buf();
    }
    None
}

/// Case-insensitive file-name search below `dir`, bounded in depth.
fn search_below(dir: &Path, file_name: &str, depth: usize) -> Option<PathBuf> {
    let wanted = file_name.to_lowercase();
    for entry in WalkDir::new(dir)
        .max_depth(depth)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file()
            && entry.file_name().to_str().map(|n| n.to_lowercase()) == Some(wanted.clone())
        {
            return Some(entry.into_path());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_relative_and_renamed_locations() {
        let root = std::env::temp_dir().join(format!("locator-test-{}", std::process::id()));
        let deep = root.join("a/b");
        std::fs::create_dir_all(&deep).unwrap();
        let sample = deep.join("Tone.wav");
        std::fs::write(&sample, b"x").unwrap();

        // Relative reference with backslashes, resolved from the root.
        assert_eq!(find_sample("a\\b\\Tone.wav", &root, 2), Some(sample.clone()));
        // Stale folder components: the search by name still finds it.
        assert_eq!(find_sample("gone/elsewhere/tone.WAV", &root, 3), Some(sample.clone()));
        // Missing entirely.
        assert_eq!(find_sample("nope.wav", &root, 2), None);

        std::fs::remove_dir_all(&root).ok();
    }
}
