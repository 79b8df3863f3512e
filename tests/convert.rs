//! End-to-end pipeline runs over small generated source trees.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use presetconv::container::ArchiveReader;
use presetconv::dtype::{Cancellation, Context, MapSettings, NullNotifier};
use presetconv::model::{AudioMetadata, PcmData};
use presetconv::pipeline::{self, FormatId, PipelineOptions, PresetReader, PresetWriter};
use presetconv::wav::WavFile;

fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("presetconv-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&root);
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn write_tone_wav(path: &Path, frames: usize, channels: u16, value: i16) {
    let mut pcm = Vec::new();
    for _ in 0..frames {
        for _ in 0..channels {
            pcm.extend_from_slice(&value.to_le_bytes());
        }
    }
    let data = PcmData {
        audio: AudioMetadata {
            channels,
            sample_rate: 44100,
            bits_per_sample: 16,
            frame_count: frames as u64,
            float: false,
        },
        pcm,
    };
    std::fs::write(path, WavFile::from_pcm(&data).to_bytes().unwrap()).unwrap();
}

#[test]
fn wav_folder_to_bitwig_end_to_end() {
    let root = temp_root("wav2bitwig");
    let source = root.join("in/piano");
    let dest = root.join("out");
    std::fs::create_dir_all(&source).unwrap();
    for note in ["C3", "C4", "C5"] {
        for vel in ["v64", "v127"] {
            write_tone_wav(&source.join(format!("Piano_{}_{}.wav", note, vel)), 32, 1, 100);
        }
    }

    let settings = MapSettings::new();
    let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
    let options = PipelineOptions {
        source_formats: vec![FormatId::Wav],
        target_format: FormatId::Bitwig,
        ..Default::default()
    };
    let report = pipeline::run(&ctx, &root.join("in"), &dest, &options);
    assert_eq!(report.errors, 0);
    assert_eq!(report.converted, 1);

    let bundle = dest.join("piano.multisample");
    assert!(bundle.is_file());
    let mut archive = ArchiveReader::open(std::fs::File::open(&bundle).unwrap()).unwrap();
    let names = archive.entry_names();
    assert!(names.contains(&"multisample.xml".to_string()));
    // Six samples plus the descriptor.
    assert_eq!(names.len(), 7);
    let xml = String::from_utf8(archive.read_entry("multisample.xml").unwrap()).unwrap();
    // Metadata inference tagged the folder name.
    assert!(xml.contains("Piano"), "category missing from: {}", xml);

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn sfz_with_include_to_bitwig_keeps_envelope_and_stores_entries() {
    let root = temp_root("sfz2bitwig");
    let source = root.join("in");
    let dest = root.join("out");
    std::fs::create_dir_all(&source).unwrap();
    for name in ["a", "b", "c", "d"] {
        write_tone_wav(&source.join(format!("{}.wav", name)), 16, 1, 50);
    }
    std::fs::write(source.join("common.sfz"), "ampeg_attack=0.01\nampeg_release=0.5\n").unwrap();
    let mut sfz = String::from("<global>\n#include \"common.sfz\"\n<group>\n");
    for (index, name) in ["a", "b", "c", "d"].iter().enumerate() {
        sfz.push_str(&format!("<region> sample={}.wav key={}\n", name, 60 + index));
    }
    std::fs::write(source.join("inst.sfz"), sfz).unwrap();

    let settings = MapSettings::new();
    let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
    let options = PipelineOptions {
        source_formats: vec![FormatId::Sfz],
        target_format: FormatId::Bitwig,
        ..Default::default()
    };
    let report = pipeline::run(&ctx, &source, &dest, &options);
    assert_eq!(report.errors, 0);
    assert_eq!(report.converted, 1);

    let bundle = dest.join("inst.multisample");
    let back = presetconv::bitwig::BitwigDetector.read(&ctx, &bundle).unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].groups.len(), 1);
    assert_eq!(back[0].groups[0].zones.len(), 4);
    for zone in &back[0].groups[0].zones {
        // The envelope from the included file traveled along.
        assert_eq!(zone.amp_env.envelope.attack, Some(0.01));
    }

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn split_stereo_pair_merges_for_decentsampler() {
    let root = temp_root("split2ds");
    let source = root.join("in");
    let dest = root.join("out");
    std::fs::create_dir_all(&source).unwrap();
    // Right half one frame shorter: merge truncates and warns.
    write_tone_wav(&source.join("Bass_L.wav"), 32, 1, 100);
    write_tone_wav(&source.join("Bass_R.wav"), 31, 1, -100);
    std::fs::write(
        source.join("bass.sfz"),
        "<group>\n<region> sample=Bass_L.wav key=36 pan=-100\n<region> sample=Bass_R.wav key=36 pan=100\n",
    )
    .unwrap();

    let settings = MapSettings::new();
    let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
    let options = PipelineOptions {
        source_formats: vec![FormatId::Sfz],
        target_format: FormatId::DecentSampler,
        ..Default::default()
    };
    let report = pipeline::run(&ctx, &source, &dest, &options);
    assert_eq!(report.errors, 0);

    let preset = dest.join("bass.dspreset");
    assert!(preset.is_file());
    let back = presetconv::decentsampler::DecentSamplerDetector.read(&ctx, &preset).unwrap();
    assert_eq!(back[0].zone_count(), 1);
    let mut zone = back[0].groups[0].zones[0].clone();
    let audio = zone.sample.audio_metadata().unwrap();
    assert_eq!(audio.channels, 2);
    assert_eq!(audio.frame_count, 31);

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn canonical_projection_is_stable_across_a_second_round_trip() {
    let root = temp_root("stability");
    std::fs::create_dir_all(&root).unwrap();
    let settings = MapSettings::new();
    let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);

    // Seed: a WAV folder instrument.
    let seed = root.join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    for note in ["C3", "G3", "C4"] {
        write_tone_wav(&seed.join(format!("Tone_{}.wav", note)), 24, 1, 10);
    }
    let first = presetconv::wavfolder::WavFolderDetector
        .read(&ctx, &seed.join("Tone_C3.wav"))
        .unwrap()
        .remove(0);

    // Emit to Bitwig, parse, emit again, parse again.
    let mut taken = HashSet::new();
    let out1 = root.join("pass1");
    std::fs::create_dir_all(&out1).unwrap();
    let mut source = first;
    let written1 = presetconv::bitwig::BitwigCreator.write(&ctx, &mut source, &out1, &mut taken).unwrap();
    let mut pass1 = presetconv::bitwig::BitwigDetector.read(&ctx, &written1[0]).unwrap().remove(0);

    let out2 = root.join("pass2");
    std::fs::create_dir_all(&out2).unwrap();
    let mut taken2 = HashSet::new();
    let written2 = presetconv::bitwig::BitwigCreator.write(&ctx, &mut pass1, &out2, &mut taken2).unwrap();
    let pass2 = presetconv::bitwig::BitwigDetector.read(&ctx, &written2[0]).unwrap().remove(0);

    let snapshot = |s: &presetconv::model::MultiSampleSource| {
        s.zones()
            .map(|z| {
                (
                    z.name.clone(),
                    z.key_low,
                    z.key_high,
                    z.key_root,
                    z.vel_low,
                    z.vel_high,
                    z.start,
                    z.stop,
                    z.loops.len(),
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(snapshot(&pass1), snapshot(&pass2));

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn cancellation_stops_between_files_and_reports() {
    let root = temp_root("cancel");
    let source = root.join("in");
    let dest = root.join("out");
    std::fs::create_dir_all(&source).unwrap();
    write_tone_wav(&source.join("One_C3.wav"), 8, 1, 1);

    let settings = MapSettings::new();
    let cancellation = Cancellation::new();
    cancellation.cancel();
    let ctx = Context::new(&NullNotifier, cancellation, &settings);
    let options = PipelineOptions {
        source_formats: vec![FormatId::Wav],
        target_format: FormatId::Bitwig,
        ..Default::default()
    };
    let report = pipeline::run(&ctx, &source, &dest, &options);
    assert!(report.cancelled);
    assert_eq!(report.converted, 0);

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn korg_target_writes_banks_ksfs_and_manifest() {
    let root = temp_root("korg");
    let source = root.join("in");
    let dest = root.join("out");
    std::fs::create_dir_all(&source).unwrap();
    for note in ["C3", "C4"] {
        write_tone_wav(&source.join(format!("Keys_{}_v127.wav", note)), 16, 1, 77);
    }

    let settings = MapSettings::new();
    let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
    let options = PipelineOptions {
        source_formats: vec![FormatId::Wav],
        target_format: FormatId::Korg,
        ..Default::default()
    };
    let report = pipeline::run(&ctx, &source, &dest, &options);
    assert_eq!(report.errors, 0);

    let entries: Vec<String> = std::fs::read_dir(&dest)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(entries.iter().any(|e| e.ends_with(".KMP")), "no KMP in {:?}", entries);
    assert!(entries.iter().any(|e| e.ends_with(".KSC")), "no KSC in {:?}", entries);
    assert_eq!(entries.iter().filter(|e| e.ends_with(".KSF")).count(), 2);

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn maschine_target_converts_through_the_dispatcher() {
    let root = temp_root("maschine");
    let source = root.join("in");
    let dest = root.join("out");
    std::fs::create_dir_all(&source).unwrap();
    for note in ["C3", "C4"] {
        write_tone_wav(&source.join(format!("Pad_{}.wav", note)), 16, 1, 42);
    }

    let settings = MapSettings::new();
    let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
    let options = PipelineOptions {
        source_formats: vec![FormatId::Wav],
        target_format: FormatId::Maschine,
        ..Default::default()
    };
    let report = pipeline::run(&ctx, &source, &dest, &options);
    assert_eq!(report.errors, 0);
    assert_eq!(report.converted, 1);

    let preset = dest.join("in.mxsnd");
    assert!(preset.is_file(), "missing preset in {:?}", std::fs::read_dir(&dest).unwrap().collect::<Vec<_>>());
    let back = presetconv::maschine::MaschineDetector.read(&ctx, &preset).unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].zone_count(), 2);

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn unreadable_file_is_reported_and_the_run_continues() {
    let root = temp_root("errors");
    let source = root.join("in");
    let dest = root.join("out");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("broken.sfz"), "<region> sample=gone.wav key=60\n").unwrap();
    let good = source.join("good");
    std::fs::create_dir_all(&good).unwrap();
    write_tone_wav(&good.join("Tone_C4.wav"), 8, 1, 5);

    let settings = MapSettings::new();
    let ctx = Context::new(&NullNotifier, Cancellation::new(), &settings);
    let options = PipelineOptions {
        source_formats: vec![FormatId::Sfz, FormatId::Wav],
        target_format: FormatId::Bitwig,
        ..Default::default()
    };
    let report = pipeline::run(&ctx, &source, &dest, &options);
    // The SFZ has a missing sample (kept as a zone, then skipped at write
    // time because nothing is playable); the WAV folder still converts.
    assert!(report.converted >= 1);

    std::fs::remove_dir_all(&root).ok();
}
