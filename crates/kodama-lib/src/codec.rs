//! WAV to MP3 transcoding and container sniffing.
//!
//! The engine produces WAV; the cache stores MP3. Decoding goes through
//! symphonia, encoding through LAME. Codec setup happens per call; there
//! is no process-wide codec state to initialize on any supported platform.

use std::io::Cursor;

use symphonia::core::audio::{AudioBuffer, Signal};
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::io::MediaSourceStream;
use tracing::trace;

use kodama_core::AppError;

/// Container format of an audio byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    Unknown,
}

/// Sniff the container from the first 12 bytes.
///
/// `RIFF….WAVE` is WAV; an MPEG frame sync (`0xFF` with the top three
/// bits of the next byte set) is MP3; anything else is unknown and the
/// caller should try MP3 first, then WAV.
pub fn detect_format(bytes: &[u8]) -> AudioFormat {
    if is_wav(bytes) {
        AudioFormat::Wav
    } else if is_mp3(bytes) {
        AudioFormat::Mp3
    } else {
        AudioFormat::Unknown
    }
}

pub fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

pub fn is_mp3(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0
}

/// Transcode a WAV buffer to mono MP3 at the source sample rate.
pub fn wav_to_mp3(wav: &[u8]) -> Result<Vec<u8>, AppError> {
    let (samples, sample_rate) = decode_first_channel(wav)?;
    if samples.is_empty() {
        return Err(AppError::AudioGenerationFailed {
            message: "no audio frames decoded".into(),
        });
    }
    trace!(frames = samples.len(), sample_rate, "encoding mp3");
    encode_mono_mp3(&samples, sample_rate)
}

/// Decode the first channel of a WAV buffer into f32 samples.
fn decode_first_channel(wav: &[u8]) -> Result<(Vec<f32>, u32), AppError> {
    fn decode_err(what: &str, detail: impl std::fmt::Debug) -> AppError {
        AppError::AudioGenerationFailed {
            message: format!("{what}: {detail:?}"),
        }
    }

    let mss = MediaSourceStream::new(Box::new(Cursor::new(wav.to_vec())), Default::default());
    let probed = symphonia::default::get_probe()
        .format(&Default::default(), mss, &Default::default(), &Default::default())
        .map_err(|e| decode_err("unsupported audio container", e))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .first()
        .ok_or_else(|| decode_err("audio has no tracks", ""))?;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| decode_err("audio has no sample rate", ""))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| decode_err("failed to create decoder", e))?;

    let mut samples: Vec<f32> = Vec::new();
    while let Ok(packet) = format.next_packet() {
        if let Ok(decoded) = decoder.decode(&packet) {
            let mut converted =
                AudioBuffer::<f32>::new(decoded.capacity() as u64, decoded.spec().clone());
            decoded.convert(&mut converted);
            samples.extend(converted.chan(0));
        }
    }

    Ok((samples, sample_rate))
}

/// Encode mono f32 samples as 192 kbps MP3.
fn encode_mono_mp3(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, AppError> {
    fn init_err(what: &str, detail: impl std::fmt::Debug) -> AppError {
        AppError::MediaFoundationInitFailed {
            message: format!("{what}: {detail:?}"),
        }
    }
    fn encode_err(detail: impl std::fmt::Debug) -> AppError {
        AppError::AudioGenerationFailed {
            message: format!("mp3 encoding failed: {detail:?}"),
        }
    }

    let mut builder = mp3lame_encoder::Builder::new()
        .ok_or_else(|| init_err("LAME builder allocation failed", ""))?;
    builder
        .set_num_channels(1)
        .map_err(|e| init_err("set channels", e))?;
    builder
        .set_sample_rate(sample_rate)
        .map_err(|e| init_err("set sample rate", e))?;
    builder
        .set_brate(mp3lame_encoder::Bitrate::Kbps192)
        .map_err(|e| init_err("set bitrate", e))?;
    builder
        .set_quality(mp3lame_encoder::Quality::Best)
        .map_err(|e| init_err("set quality", e))?;
    let mut encoder = builder.build().map_err(|e| init_err("build encoder", e))?;

    let input = mp3lame_encoder::MonoPcm(samples);
    let mut out = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(samples.len()));

    let written = encoder
        .encode(input, out.spare_capacity_mut())
        .map_err(encode_err)?;
    unsafe {
        out.set_len(out.len().wrapping_add(written));
    }
    let written = encoder
        .flush::<mp3lame_encoder::FlushNoGap>(out.spare_capacity_mut())
        .map_err(encode_err)?;
    unsafe {
        out.set_len(out.len().wrapping_add(written));
    }

    Ok(out)
}
