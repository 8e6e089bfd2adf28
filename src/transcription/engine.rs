//! # Transcription Engine Interface
//!
//! The seam between the job pipeline and whatever actually turns audio into text.
//!
//! ## Key Types:
//! - **SpeechEngine**: loads one model instance onto a device (async, may download weights)
//! - **SpeechModel**: a loaded instance; `transcribe` is blocking and runs on a
//!   `spawn_blocking` thread
//! - **AbortSignal**: cooperative stop flag checked by models between decoding steps
//! - **TranscriptionOptions**: per-job knobs validated at upload time
//! - **TranscriptResult**: what clients finally receive
//!
//! The production implementation lives in `whisper.rs`; tests use the scripted
//! engine in `testing.rs`.

use crate::device::DeviceSpec;
use crate::pipeline::error::PipelineError;
use crate::pipeline::job::JobId;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Language codes the multilingual Whisper checkpoints understand.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su", "yue",
];

/// Whether the model should transcribe in the spoken language or translate to English.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    #[default]
    Transcribe,
    Translate,
}

impl FromStr for TaskMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "transcribe" => Ok(TaskMode::Transcribe),
            "translate" => Ok(TaskMode::Translate),
            other => Err(PipelineError::InvalidOptions(format!(
                "task must be 'transcribe' or 'translate', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskMode::Transcribe => f.write_str("transcribe"),
            TaskMode::Translate => f.write_str("translate"),
        }
    }
}

/// Per-job transcription options.
///
/// ## Validation:
/// Options arrive as loose multipart text fields. `from_fields` is the only way
/// the HTTP layer builds them, so anything reaching a worker is already known-good:
/// unknown field names, duplicate fields and unsupported languages are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionOptions {
    /// ISO 639-1 language hint. `None` means auto-detect.
    pub language: Option<String>,
    pub task: TaskMode,
}

impl TranscriptionOptions {
    pub const FIELDS: &'static [&'static str] = &["language", "task"];

    /// Build options from `(name, value)` pairs collected from a form.
    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, PipelineError> {
        let mut options = Self::default();
        let mut seen: Vec<&str> = Vec::new();

        for (name, value) in fields {
            if seen.contains(&name.as_str()) {
                return Err(PipelineError::InvalidOptions(format!(
                    "field '{}' given more than once",
                    name
                )));
            }
            match name.as_str() {
                "language" => options.language = parse_language(value)?,
                "task" => options.task = value.parse()?,
                _ => {
                    return Err(PipelineError::InvalidOptions(format!(
                        "unknown field '{}' (expected one of: {})",
                        name,
                        Self::FIELDS.join(", ")
                    )))
                }
            }
            seen.push(name.as_str());
        }
        Ok(options)
    }
}

fn parse_language(value: &str) -> Result<Option<String>, PipelineError> {
    let code = value.trim().to_lowercase();
    if code.is_empty() || code == "auto" {
        return Ok(None);
    }
    if SUPPORTED_LANGUAGES.contains(&code.as_str()) {
        Ok(Some(code))
    } else {
        Err(PipelineError::InvalidOptions(format!(
            "unsupported language '{}'",
            value.trim()
        )))
    }
}

/// Cooperative cancellation flag shared between a worker and a running model.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Returned by models that noticed a raised `AbortSignal`.
#[derive(Debug, thiserror::Error)]
#[error("inference aborted")]
pub struct InferenceAborted;

/// A timed piece of transcribed text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptSegment {
    /// Start offset in seconds
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// exp(mean token log-probability), when the model reports it
    pub confidence: Option<f32>,
}

/// What a model hands back before the pipeline adds bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RawTranscript {
    pub segments: Vec<TranscriptSegment>,
    /// Language the model decoded in (hint or detected)
    pub language: Option<String>,
}

/// Final result stored for a successful job.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptResult {
    pub job_id: JobId,
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub language: Option<String>,
    pub task: TaskMode,
    /// Duration-weighted mean of segment confidences
    pub confidence: Option<f32>,
    pub audio_duration: f64,
    pub processing_time_ms: u64,
    pub model: String,
    pub device: String,
    pub completed_at: DateTime<Utc>,
}

impl TranscriptResult {
    pub fn assemble(
        job_id: JobId,
        raw: RawTranscript,
        task: TaskMode,
        audio_duration: f64,
        processing: Duration,
        model: &str,
        device: &DeviceSpec,
    ) -> Self {
        let text = raw
            .segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            job_id,
            text,
            confidence: overall_confidence(&raw.segments),
            segments: raw.segments,
            language: raw.language,
            task,
            audio_duration,
            processing_time_ms: processing.as_millis() as u64,
            model: model.to_string(),
            device: device.to_string(),
            completed_at: Utc::now(),
        }
    }
}

fn overall_confidence(segments: &[TranscriptSegment]) -> Option<f32> {
    let (weighted, total) = segments
        .iter()
        .filter_map(|s| s.confidence.map(|c| (c as f64, (s.end - s.start).max(0.0))))
        .fold((0.0, 0.0), |(w, t), (c, d)| (w + c * d, t + d));
    if total > 0.0 {
        Some((weighted / total) as f32)
    } else {
        let scored: Vec<f32> = segments.iter().filter_map(|s| s.confidence).collect();
        if scored.is_empty() {
            None
        } else {
            Some(scored.iter().sum::<f32>() / scored.len() as f32)
        }
    }
}

/// A loaded model instance. Exactly one job uses it at a time.
pub trait SpeechModel: Send {
    /// Transcribe 16 kHz mono samples. Blocking.
    ///
    /// Implementations should check `abort` between decoding steps and return
    /// `InferenceAborted` promptly once it is raised.
    fn transcribe(
        &mut self,
        samples: &[f32],
        options: &TranscriptionOptions,
        abort: &AbortSignal,
    ) -> Result<RawTranscript>;
}

/// Factory for model instances.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Identifier reported in results, e.g. `openai/whisper-small`.
    fn model_id(&self) -> String;

    /// Load one instance for registry slot `slot` on `device`.
    async fn load(&self, slot: usize, device: &DeviceSpec) -> Result<Box<dyn SpeechModel>>;
}
