use std::io::{Read, Seek};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};

use crate::dtype::ConvError;
use crate::model::{AudioMetadata, PcmData};
use crate::riff::ChunkTree;
use crate::wav::WavFile;

/// Destination constraints a codec imposes on sample audio. Empty
/// `bit_depths` keeps the source depth.
#[derive(Debug, Clone, Default)]
pub struct DestinationAudioFormat {
    pub bit_depths: Vec<u16>,
    pub max_sample_rate: Option<u32>,
    /// Destination understands 32-bit float; otherwise floats are
    /// converted to the nearest allowed integer depth.
    pub allow_float: bool,
}

/// Decodes any sample file the conversion core can reference, dispatching
/// on the extension: WAV, AIFF, FLAC or NCW.
pub fn decode_audio_file(path: &Path) -> Result<PcmData, ConvError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
    let mut file = std::fs::File::open(path)
        .map_err(|_| ConvError::SampleNotFound(path.display().to_string()))?;
    let name = path.display().to_string();
    match ext.as_str() {
        "wav" => WavFile::parse(&mut file, &name)?.pcm(),
        "aif" | "aiff" | "aifc" => decode_aiff(&mut file, &name),
        "flac" => decode_flac(path),
        "ncw" => crate::ncw::decode_ncw(&mut file, &name),
        other => Err(ConvError::FeatureNotSupported(format!("Sample file type '{}'", other))),
    }
}

/// AIFF FORM parse: COMM carries the shape, SSND the big-endian PCM which
/// is flipped to the little-endian layout the rest of the engine uses.
pub fn decode_aiff<R: Read + Seek>(reader: &mut R, file_name: &str) -> Result<PcmData, ConvError> {
    let tree = ChunkTree::parse(reader, file_name)?;
    if !matches!(tree.root.form, Some(f) if &f == b"AIFF" || &f == b"AIFC") {
        return Err(ConvError::BadMagic {
            file: file_name.to_string(),
            expected: *b"AIFF",
            found: tree.root.form.unwrap_or([0; 4]),
        });
    }
    let comm = tree.root.find(*b"COMM").ok_or_else(|| ConvError::UnexpectedChunk {
        expected: "COMM".to_string(),
        found: "missing".to_string(),
    })?;
    let mut cur = std::io::Cursor::new(&comm.data);
    let channels = cur.read_u16::<BigEndian>()?;
    let frame_count = cur.read_u32::<BigEndian>()?;
    let bits = cur.read_u16::<BigEndian>()?;
    let sample_rate = crate::binutils::read_extended80(&mut cur)?.round() as u32;

    let ssnd = tree.root.find(*b"SSND").ok_or_else(|| ConvError::UnexpectedChunk {
        expected: "SSND".to_string(),
        found: "missing".to_string(),
    })?;
    if ssnd.data.len() < 8 {
        return Err(ConvError::Truncated { file: file_name.to_string(), offset: ssnd.data.len() as u64 });
    }
    let offset = u32::from_be_bytes([ssnd.data[0], ssnd.data[1], ssnd.data[2], ssnd.data[3]]) as usize;
    let bytes_per_sample = (bits / 8).max(1) as usize;
    let payload = ssnd
        .data
        .get(8 + offset..)
        .ok_or_else(|| ConvError::Truncated { file: file_name.to_string(), offset: offset as u64 })?;
    let mut pcm = Vec::with_capacity(payload.len());
    for sample in payload.chunks_exact(bytes_per_sample) {
        pcm.extend(sample.iter().rev());
    }
    Ok(PcmData {
        audio: AudioMetadata { channels, sample_rate, bits_per_sample: bits, frame_count: frame_count as u64, float: false },
        pcm,
    })
}

/// FLAC decode through symphonia into the engine's interleaved layout.
pub fn decode_flac(path: &Path) -> Result<PcmData, ConvError> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("flac");
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| ConvError::Invalid(format!("FLAC probe of '{}': {}", path.display(), e)))?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| ConvError::Invalid(format!("'{}' has no audio track", path.display())))?;
    let track_id = track.id;
    let params = track.codec_params.clone();
    let channels = params.channels.map(|c| c.count()).unwrap_or(1) as u16;
    let sample_rate = params.sample_rate.unwrap_or(44100);
    let bits = params.bits_per_sample.unwrap_or(16).clamp(16, 24) as u16;
    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| ConvError::Invalid(format!("FLAC decoder: {}", e)))?;

    let mut planes: Vec<Vec<f32>> = vec![Vec::new(); channels as usize];
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymError::ResetRequired) => break,
            Err(e) => return Err(ConvError::Invalid(format!("FLAC read: {}", e))),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = decoder
            .decode(&packet)
            .map_err(|e| ConvError::Invalid(format!("FLAC decode: {}", e)))?;
        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        for (i, s) in buf.samples().iter().enumerate() {
            planes[i % channels as usize].push(*s);
        }
    }
    Ok(planes_to_pcm(&planes, sample_rate, bits, false))
}

/// FLAC encode through libFLAC for destinations that ship compressed
/// samples. Returns the encoded image.
pub fn encode_flac(pcm: &PcmData) -> Result<Vec<u8>, ConvError> {
    use flac_bound::{FlacEncoder, WriteWrapper};

    let bits = pcm.audio.bits_per_sample.clamp(16, 24) as u32;
    let mut out: Vec<u8> = Vec::new();
    {
        let mut wrapper = WriteWrapper(&mut out);
        let enc = FlacEncoder::new().ok_or_else(|| ConvError::Invalid("FLAC encoder allocation failed".to_string()))?;
        let mut enc = enc
            .channels(pcm.audio.channels as u32)
            .bits_per_sample(bits)
            .sample_rate(pcm.audio.sample_rate)
            .compression_level(5)
            .init_write(&mut wrapper)
            .map_err(|e| ConvError::Invalid(format!("FLAC encoder init: {:?}", e)))?;
        let planes = pcm_planes(pcm);
        let frames = pcm.audio.frame_count as usize;
        let scale = (1u32 << (bits - 1)) as f32;
        let mut interleaved = Vec::with_capacity(frames * planes.len());
        for frame in 0..frames {
            for plane in &planes {
                let v = (plane[frame] * scale).round().clamp(-scale, scale - 1.0) as i32;
                interleaved.push(v);
            }
        }
        enc.process_interleaved(&interleaved, frames as u32)
            .map_err(|_| ConvError::Invalid("FLAC encode failed".to_string()))?;
        let _ = enc.finish();
    }
    Ok(out)
}

/// Interleaved PCM bytes to per-channel f32 planes in [-1, 1].
pub fn pcm_planes(pcm: &PcmData) -> Vec<Vec<f32>> {
    let channels = pcm.audio.channels.max(1) as usize;
    let bytes = (pcm.audio.bits_per_sample / 8).max(1) as usize;
    let frames = pcm.pcm.len() / (channels * bytes);
    let mut planes = vec![Vec::with_capacity(frames); channels];
    for frame in 0..frames {
        for (ch, plane) in planes.iter_mut().enumerate() {
            let at = (frame * channels + ch) * bytes;
            let raw = &pcm.pcm[at..at + bytes];
            let v = if pcm.audio.float {
                f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
            } else {
                match bytes {
                    1 => (raw[0] as i8 as f32) / 128.0,
                    2 => i16::from_le_bytes([raw[0], raw[1]]) as f32 / 32768.0,
                    3 => {
                        let v = i32::from_le_bytes([0, raw[0], raw[1], raw[2]]) >> 8;
                        v as f32 / 8_388_608.0
                    }
                    _ => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f32 / 2_147_483_648.0,
                }
            };
            plane.push(v);
        }
    }
    planes
}

/// Per-channel f32 planes back to interleaved PCM at the given depth.
pub fn planes_to_pcm(planes: &[Vec<f32>], sample_rate: u32, bits: u16, float: bool) -> PcmData {
    let channels = planes.len().max(1) as u16;
    let frames = planes.first().map(|p| p.len()).unwrap_or(0);
    let bytes = (bits / 8) as usize;
    let mut pcm = Vec::with_capacity(frames * channels as usize * bytes);
    for frame in 0..frames {
        for plane in planes {
            let s = plane.get(frame).copied().unwrap_or(0.0);
            if float {
                pcm.extend_from_slice(&s.to_le_bytes());
            } else {
                match bits {
                    8 => pcm.push(((s * 128.0).round().clamp(-128.0, 127.0) as i8) as u8),
                    16 => pcm.extend_from_slice(&((s * 32768.0).round().clamp(-32768.0, 32767.0) as i16).to_le_bytes()),
                    24 => {
                        let v = (s * 8_388_608.0).round().clamp(-8_388_608.0, 8_388_607.0) as i32;
                        pcm.extend_from_slice(&v.to_le_bytes()[..3]);
                    }
                    _ => {
                        let v = (s as f64 * 2_147_483_648.0).round().clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
                        pcm.extend_from_slice(&v.to_le_bytes());
                    }
                }
            }
        }
    }
    PcmData {
        audio: AudioMetadata { channels, sample_rate, bits_per_sample: bits, frame_count: frames as u64, float },
        pcm,
    }
}

/// Converts PCM to the destination's constraints. Returns the converted
/// audio plus the rate change when one happened, so the caller can rescale
/// zone positions in step.
pub fn convert_to_format(pcm: &PcmData, format: &DestinationAudioFormat) -> Result<(PcmData, Option<(u32, u32)>), ConvError> {
    let mut bits = pcm.audio.bits_per_sample;
    let mut float = pcm.audio.float;
    if float && !format.allow_float {
        float = false;
        bits = 24;
    }
    if !format.bit_depths.is_empty() && !format.bit_depths.contains(&bits) {
        // Nearest allowed depth, preferring not to lose resolution.
        bits = *format
            .bit_depths
            .iter()
            .min_by_key(|&&d| (d as i32 - bits as i32).unsigned_abs() * 2 + u32::from(d < bits))
            .expect("non-empty");
    }
    let target_rate = match format.max_sample_rate {
        Some(max) if pcm.audio.sample_rate > max => max,
        _ => pcm.audio.sample_rate,
    };

    if bits == pcm.audio.bits_per_sample && float == pcm.audio.float && target_rate == pcm.audio.sample_rate {
        return Ok((pcm.clone(), None));
    }

    let mut planes = pcm_planes(pcm);
    let rate_change = if target_rate != pcm.audio.sample_rate {
        planes = resample_planes(planes, pcm.audio.sample_rate, target_rate)?;
        Some((pcm.audio.sample_rate, target_rate))
    } else {
        None
    };
    Ok((planes_to_pcm(&planes, target_rate, bits, float), rate_change))
}

/// Sinc resampling of whole planes. Offline: the full input is available,
/// so the resampler is fed fixed chunks and flushed, and the output is
/// trimmed of the filter delay.
pub fn resample_planes(planes: Vec<Vec<f32>>, from: u32, to: u32) -> Result<Vec<Vec<f32>>, ConvError> {
    use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

    if from == to || planes.is_empty() || planes[0].is_empty() {
        return Ok(planes);
    }
    let channels = planes.len();
    let frames = planes[0].len();
    let ratio = to as f64 / from as f64;
    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    const CHUNK: usize = 1024;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.1, params, CHUNK, channels)
        .map_err(|e| ConvError::Invalid(format!("Resampler setup: {}", e)))?;
    let delay = resampler.output_delay();
    let expected = (frames as f64 * ratio).round() as usize;
    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + CHUNK); channels];

    let mut pos = 0usize;
    while pos < frames {
        let end = (pos + CHUNK).min(frames);
        let chunk: Vec<&[f32]> = planes.iter().map(|p| &p[pos..end]).collect();
        let blocks = resampler
            .process_partial(Some(&chunk), None)
            .map_err(|e| ConvError::Invalid(format!("Resampling: {}", e)))?;
        for (ch, block) in blocks.into_iter().enumerate() {
            out[ch].extend(block);
        }
        pos = end;
    }
    for _ in 0..2 {
        let blocks = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| ConvError::Invalid(format!("Resampling: {}", e)))?;
        for (ch, block) in blocks.into_iter().enumerate() {
            out[ch].extend(block);
        }
    }
    for ch in &mut out {
        if ch.len() > delay {
            ch.drain(..delay);
        }
        ch.resize(expected, 0.0);
    }
    Ok(out)
}

/// Interleaves a left/right pair of mono buffers into one stereo buffer.
/// Frame counts may differ between sloppily exported halves; the shorter
/// one wins and the caller is told so it can warn.
pub fn merge_split_stereo(left: &PcmData, right: &PcmData) -> Result<(PcmData, bool), ConvError> {
    if left.audio.channels != 1 || right.audio.channels != 1 {
        return Err(ConvError::Invalid("Split-stereo merge needs two mono inputs".to_string()));
    }
    if left.audio.sample_rate != right.audio.sample_rate {
        return Err(ConvError::Invalid("Split-stereo halves disagree on sample rate".to_string()));
    }
    let lp = pcm_planes(left);
    let rp = pcm_planes(right);
    let frames = lp[0].len().min(rp[0].len());
    let truncated = lp[0].len() != rp[0].len();
    let planes = vec![lp[0][..frames].to_vec(), rp[0][..frames].to_vec()];
    let bits = left.audio.bits_per_sample.max(right.audio.bits_per_sample);
    Ok((planes_to_pcm(&planes, left.audio.sample_rate, bits, left.audio.float && right.audio.float), truncated))
}

/// Splits interleaved stereo into its two mono halves.
pub fn split_stereo(pcm: &PcmData) -> Result<(PcmData, PcmData), ConvError> {
    if pcm.audio.channels != 2 {
        return Err(ConvError::Invalid(format!("Cannot split {} channels into a stereo pair", pcm.audio.channels)));
    }
    let planes = pcm_planes(pcm);
    let left = planes_to_pcm(&planes[0..1], pcm.audio.sample_rate, pcm.audio.bits_per_sample, pcm.audio.float);
    let right = planes_to_pcm(&planes[1..2], pcm.audio.sample_rate, pcm.audio.bits_per_sample, pcm.audio.float);
    Ok((left, right))
}

/// Reverses the frame order, for zones flagged as reversed playback when
/// the destination cannot express the flag.
pub fn reverse_frames(pcm: &PcmData) -> PcmData {
    let planes: Vec<Vec<f32>> = pcm_planes(pcm)
        .into_iter()
        .map(|mut p| {
            p.reverse();
            p
        })
        .collect();
    planes_to_pcm(&planes, pcm.audio.sample_rate, pcm.audio.bits_per_sample, pcm.audio.float)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(frames: usize, value: i16) -> PcmData {
        let mut pcm = Vec::new();
        for _ in 0..frames {
            pcm.extend_from_slice(&value.to_le_bytes());
        }
        PcmData {
            audio: AudioMetadata { channels: 1, sample_rate: 44100, bits_per_sample: 16, frame_count: frames as u64, float: false },
            pcm,
        }
    }

    #[test]
    fn merge_then_split_restores_channels() {
        let left = mono(100, 1000);
        let right = mono(100, -2000);
        let (stereo, truncated) = merge_split_stereo(&left, &right).unwrap();
        assert!(!truncated);
        assert_eq!(stereo.audio.channels, 2);
        assert_eq!(stereo.audio.frame_count, 100);
        let (l2, r2) = split_stereo(&stereo).unwrap();
        assert_eq!(l2.pcm, left.pcm);
        assert_eq!(r2.pcm, right.pcm);
    }

    #[test]
    fn merge_with_unequal_lengths_truncates_and_reports() {
        let left = mono(100, 0);
        let right = mono(90, 0);
        let (stereo, truncated) = merge_split_stereo(&left, &right).unwrap();
        assert!(truncated);
        assert_eq!(stereo.audio.frame_count, 90);
    }

    #[test]
    fn bit_depth_conversion_rescales_values() {
        let pcm = mono(4, 16384); // half scale at 16 bits
        let format = DestinationAudioFormat { bit_depths: vec![24], ..Default::default() };
        let (converted, rate_change) = convert_to_format(&pcm, &format).unwrap();
        assert!(rate_change.is_none());
        assert_eq!(converted.audio.bits_per_sample, 24);
        let v = i32::from_le_bytes([0, converted.pcm[0], converted.pcm[1], converted.pcm[2]]) >> 8;
        assert_eq!(v, 4_194_304); // half scale at 24 bits
    }

    #[test]
    fn resample_halving_rate_halves_length() {
        let planes = vec![vec![0.5f32; 8000]];
        let out = resample_planes(planes, 44100, 22050).unwrap();
        assert_eq!(out[0].len(), 4000);
        // Away from the edges the constant signal survives.
        assert!((out[0][2000] - 0.5).abs() < 0.01);
    }

    #[test]
    fn aiff_decode_flips_endianness() {
        use crate::riff::Chunk;
        let mut tree = ChunkTree::new_form(*b"AIFF");
        let mut comm = Vec::new();
        comm.extend_from_slice(&1u16.to_be_bytes()); // channels
        comm.extend_from_slice(&2u32.to_be_bytes()); // frames
        comm.extend_from_slice(&16u16.to_be_bytes()); // bits
        crate::binutils::write_extended80(&mut comm, 44100.0).unwrap();
        tree.root.children.push(Chunk::leaf(*b"COMM", comm));
        let mut ssnd = vec![0u8; 8];
        ssnd.extend_from_slice(&1000i16.to_be_bytes());
        ssnd.extend_from_slice(&(-1000i16).to_be_bytes());
        tree.root.children.push(Chunk::leaf(*b"SSND", ssnd));
        let bytes = tree.emit_to_vec().unwrap();
        let pcm = decode_aiff(&mut std::io::Cursor::new(bytes), "mem").unwrap();
        assert_eq!(pcm.audio.sample_rate, 44100);
        assert_eq!(i16::from_le_bytes([pcm.pcm[0], pcm.pcm[1]]), 1000);
        assert_eq!(i16::from_le_bytes([pcm.pcm[2], pcm.pcm[3]]), -1000);
    }

    #[test]
    fn reverse_frames_mirrors_audio() {
        let mut pcm = mono(3, 0);
        pcm.pcm = [1i16, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        let rev = reverse_frames(&pcm);
        let v: Vec<i16> = rev.pcm.chunks(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
        assert_eq!(v, vec![3, 2, 1]);
    }
}
