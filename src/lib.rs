//! presetconv converts multi-sample instrument presets between sampler
//! formats. Every source format is parsed into one canonical model
//! ([`model::MultiSampleSource`]) and emitted from it, so adding a format
//! means writing one codec, not a conversion matrix.

pub mod ableton;
pub mod audio;
pub mod binutils;
pub mod bitwig;
pub mod container;
pub mod decentsampler;
pub mod dtype;
pub mod exs24;
pub mod fileutils;
pub mod kontakt;
pub mod korg;
pub mod locator;
pub mod maschine;
pub mod math;
pub mod model;
pub mod ncw;
pub mod pipeline;
pub mod riff;
pub mod sf2;
pub mod sfz;
pub mod tags;
pub mod wav;
pub mod wavfolder;
pub mod ysfc;
