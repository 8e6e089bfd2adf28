//! # Audio Decoding
//!
//! Turns an uploaded audio file into what Whisper wants: mono `f32` samples at 16 kHz.
//!
//! ## Steps:
//! 1. **Identify** the container (WAV, MP3, M4A/AAC, FLAC, Ogg Vorbis) with symphonia,
//!    using the file extension as a hint
//! 2. **Decode** every packet of the first audio track to interleaved `f32`
//! 3. **Downmix** interleaved channels by averaging
//! 4. **Resample** with a windowed-sinc filter (rubato) if the source rate differs
//!
//! A packet that fails to decode is logged and skipped.

use anyhow::{bail, Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Sample rate every model input is converted to.
pub const SAMPLE_RATE: u32 = 16_000;

/// Input frames fed to the resampler per call.
const RESAMPLE_CHUNK: usize = 1024;

/// Decoded, model-ready audio.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Mono samples at `SAMPLE_RATE`
    pub samples: Vec<f32>,
    pub source_rate: u32,
    pub source_channels: u16,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }
}

/// Decode any supported audio stream.
///
/// `extension` (with or without the leading dot) only steers format detection;
/// the container is still recognised from its content.
pub fn decode_audio(source: Box<dyn MediaSource>, extension: Option<&str>) -> Result<DecodedAudio> {
    let stream = MediaSourceStream::new(source, Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext.trim_start_matches('.'));
    }

    let detected = symphonia::default::get_probe()
        .format(&hint, stream, &FormatOptions::default(), &MetadataOptions::default())
        .context("not a recognised audio file")?;
    let mut format = detected.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("file contains no audio track")?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("unsupported audio codec")?;

    let mut mono = Vec::new();
    let mut source_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut source_channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);
    let mut skipped = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(err) => return Err(err).context("failed to read audio packet"),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                warn!(reason, "Skipping undecodable audio packet");
                skipped += 1;
                continue;
            }
            Err(err) => return Err(err).context("failed to decode audio"),
        };

        let spec = *decoded.spec();
        source_rate = spec.rate;
        source_channels = spec.channels.count() as u16;
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        mono.extend(downmix(buffer.samples(), spec.channels.count()));
    }

    if mono.is_empty() {
        bail!("file contains no audio data");
    }
    if source_rate == 0 {
        bail!("audio stream declares a zero sample rate");
    }

    debug!(
        frames = mono.len(),
        source_rate,
        source_channels,
        skipped,
        "Decoded audio"
    );
    let samples = resample(&mono, source_rate, SAMPLE_RATE)?;
    Ok(DecodedAudio {
        samples,
        source_rate,
        source_channels,
    })
}

/// Average interleaved frames down to one channel. A trailing partial frame is dropped.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Sinc resampler for mono audio.
///
/// The output is aligned with the input (the filter delay is trimmed) and holds
/// `round(len * to / from)` samples.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to as f64 / from as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .context("failed to create resampler")?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let block = resampler.process(&[chunk], None).context("resampling failed")?;
        output.extend_from_slice(&block[0]);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let block = resampler
            .process_partial(Some(&[tail][..]), None)
            .context("resampling failed")?;
        output.extend_from_slice(&block[0]);
    }
    // Flush what is still inside the filter.
    while output.len() < expected + delay {
        let block = resampler
            .process_partial::<&[f32]>(None, None)
            .context("resampling failed")?;
        if block[0].is_empty() {
            break;
        }
        output.extend_from_slice(&block[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}
