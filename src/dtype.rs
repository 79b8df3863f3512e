use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use colored::Colorize;
use indexmap::IndexMap;
use thiserror::Error;

/// Crate-wide error type. Parsers attach the offending file, chunk id and
/// offset where they are known so the pipeline can log one line per failure
/// and move on to the next file.
#[derive(Debug, Error)]
pub enum ConvError {
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Truncated: {file} ended early at offset 0x{offset:X}")]
    Truncated { file: String, offset: u64 },
    #[error("BadMagic: {file} expected {expected:?}, found {found:?}")]
    BadMagic { file: String, expected: [u8; 4], found: [u8; 4] },
    #[error("ChunkTooLarge: chunk '{id}' claims {size} bytes but only {remaining} remain")]
    ChunkTooLarge { id: String, size: u64, remaining: u64 },
    #[error("AlignmentBroken: chunk '{id}' at offset 0x{offset:X} is not word aligned")]
    AlignmentBroken { id: String, offset: u64 },
    #[error("UnexpectedChunk: found '{found}' where '{expected}' was required")]
    UnexpectedChunk { expected: String, found: String },
    #[error("UnsupportedVersion: {file} is version {version}, which is not supported")]
    UnsupportedVersion { file: String, version: String },
    #[error("EncryptedFile: {0} is encrypted and cannot be read")]
    EncryptedFile(String),
    #[error("CycleDetected: '{0}' is included from inside itself")]
    CycleDetected(PathBuf),
    #[error("SampleNotFound: '{0}'")]
    SampleNotFound(String),
    #[error("ValueOutOfRange: {name} = {value} outside [{low}, {high}]")]
    ValueOutOfRange { name: &'static str, value: f64, low: f64, high: f64 },
    #[error("FeatureNotSupported: {0}")]
    FeatureNotSupported(String),
    #[error("ConstraintViolation: {0}")]
    ConstraintViolation(String),
    #[error("Invalid: {0}")]
    Invalid(String),
    #[error("Xml: {0}")]
    Xml(String),
    #[error("Zip: {0}")]
    Zip(String),
    #[error("Cancelled")]
    Cancelled,
}

impl From<quick_xml::DeError> for ConvError {
    fn from(e: quick_xml::DeError) -> Self {
        ConvError::Xml(e.to_string())
    }
}
impl From<zip::result::ZipError> for ConvError {
    fn from(e: zip::result::ZipError) -> Self {
        ConvError::Zip(e.to_string())
    }
}

impl ConvError {
    /// True for errors that abort the current file but not the run.
    pub fn is_per_file(&self) -> bool {
        !matches!(self, ConvError::Cancelled)
    }
}

/// Progress and log sink. The conversion core never prints directly; the
/// embedding shell decides where the lines go.
pub trait Notifier {
    fn log(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
    /// One tick per written sample.
    fn progress(&self);
    /// Called when a logical unit (file, library) finishes, to terminate a
    /// running tick line.
    fn progress_done(&self);
}

/// Console implementation used by the CLI. Ticks print a dot per sample
/// with a line break every 80 so long bundles stay readable.
pub struct ConsoleNotifier {
    ticks: AtomicUsize,
}

impl ConsoleNotifier {
    pub fn new() -> ConsoleNotifier {
        ConsoleNotifier { ticks: AtomicUsize::new(0) }
    }

    fn break_ticks(&self) {
        if self.ticks.swap(0, Ordering::Relaxed) > 0 {
            println!();
        }
    }
}

impl Default for ConsoleNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for ConsoleNotifier {
    fn log(&self, message: &str) {
        self.break_ticks();
        println!("{}", message);
    }
    fn warn(&self, message: &str) {
        self.break_ticks();
        println!("{}{}", "Warning: ".yellow(), message);
    }
    fn error(&self, message: &str) {
        self.break_ticks();
        println!("{}{}", "Error: ".red(), message);
    }
    fn progress(&self) {
        print!(".");
        use std::io::Write as _;
        let _ = std::io::stdout().flush();
        if self.ticks.fetch_add(1, Ordering::Relaxed) + 1 >= 80 {
            self.ticks.store(0, Ordering::Relaxed);
            println!();
        }
    }
    fn progress_done(&self) {
        self.break_ticks();
    }
}

/// Sink that swallows everything, for tests and `--analyze` dry runs where
/// the caller only wants the error summary.
pub struct NullNotifier;
impl Notifier for NullNotifier {
    fn log(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn progress(&self) {}
    fn progress_done(&self) {}
}

/// Cooperative cancellation flag, polled at file/zone/library boundaries.
/// Cloning shares the flag.
#[derive(Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Cancellation {
        Cancellation::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
    /// Poll point. Returns `ConvError::Cancelled` once the flag is set.
    pub fn check(&self) -> Result<(), ConvError> {
        if self.is_cancelled() {
            Err(ConvError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-codec options as string pairs with typed accessors. The CLI fills
/// this from `--output-format-option key=value`.
pub trait Settings {
    fn get(&self, key: &str) -> Option<&str>;

    fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some("1") | Some("true") | Some("on") => true,
            Some("0") | Some("false") | Some("off") => false,
            _ => default,
        }
    }
    fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
    fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

/// Insertion-ordered key/value settings store.
#[derive(Debug, Clone, Default)]
pub struct MapSettings {
    values: IndexMap<String, String>,
}

impl MapSettings {
    pub fn new() -> MapSettings {
        MapSettings::default()
    }
    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
    /// Parses one `key=value` pair as passed on the command line.
    pub fn set_pair(&mut self, pair: &str) -> Result<(), ConvError> {
        match pair.split_once('=') {
            Some((k, v)) => {
                self.set(k.trim(), v.trim());
                Ok(())
            }
            None => Err(ConvError::Invalid(format!("Option '{}' is not of the form key=value!", pair))),
        }
    }
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl Settings for MapSettings {
    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }
}

/// Everything a codec call needs from its surroundings, passed explicitly
/// so the core holds no global state.
pub struct Context<'a> {
    pub notifier: &'a dyn Notifier,
    pub cancellation: Cancellation,
    pub settings: &'a dyn Settings,
}

impl<'a> Context<'a> {
    pub fn new(notifier: &'a dyn Notifier, cancellation: Cancellation, settings: &'a dyn Settings) -> Context<'a> {
        Context { notifier, cancellation, settings }
    }
}

/// Binary structure seam: structs that mirror an on-disk layout implement
/// both directions over seekable streams.
pub trait ReadWrite {
    fn read_from_file<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), ConvError>;
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, ConvError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_pairs_parse_and_read_back() {
        let mut s = MapSettings::new();
        s.set_pair("trimToZone=1").unwrap();
        s.set_pair("maxSampleRate = 48000").unwrap();
        assert!(s.get_bool("trimToZone", false));
        assert_eq!(s.get_u32("maxSampleRate", 0), 48000);
        assert_eq!(s.get_i64("missing", -3), -3);
        assert!(s.set_pair("justakey").is_err());
    }

    #[test]
    fn cancellation_trips_once_set() {
        let c = Cancellation::new();
        assert!(c.check().is_ok());
        let c2 = c.clone();
        c2.cancel();
        assert!(matches!(c.check(), Err(ConvError::Cancelled)));
    }
}
