//! # Whisper Backend
//!
//! Loads Whisper checkpoints from HuggingFace with Candle and runs greedy decoding.
//!
//! ## Model Loading Process:
//! 1. Download `config.json`, `tokenizer.json` and `model.safetensors` once per process
//!    (hf-hub caches them on disk as well)
//! 2. Per slot: open the device, mmap the weights and build the model on a blocking thread
//! 3. Validate with one second of silence so a broken device fails the load, not the first job
//!
//! ## Decoding:
//! - Audio is split into 30 second mel windows
//! - Each window is decoded greedily with `<|notimestamps|>`, so a window becomes one segment
//! - Windows the model scores as silence are dropped
//! - The abort signal is checked before every decoder step

use crate::device::DeviceSpec;
use crate::transcription::engine::{
    AbortSignal, InferenceAborted, RawTranscript, SpeechEngine, SpeechModel, TaskMode,
    TranscriptSegment, TranscriptionOptions, SUPPORTED_LANGUAGES,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::path::PathBuf;
use tokenizers::Tokenizer;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const NO_SPEECH_THRESHOLD: f64 = 0.6;
const LOGPROB_THRESHOLD: f64 = -1.0;
const N_FFT: usize = 400;

/// Available Whisper model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub const ALL: [ModelSize; 5] = [
        ModelSize::Tiny,
        ModelSize::Base,
        ModelSize::Small,
        ModelSize::Medium,
        ModelSize::Large,
    ];

    /// HuggingFace repository holding the checkpoint.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    /// Approximate checkpoint size in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::Large => 1550,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "Fastest, basic accuracy",
            ModelSize::Base => "Fast, good for testing",
            ModelSize::Small => "Balanced speed and accuracy",
            ModelSize::Medium => "Good accuracy, handles technical vocabulary",
            ModelSize::Large => "Best accuracy, slower processing",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" | "large-v2" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Where hf-hub should authenticate and cache.
#[derive(Debug, Clone, Default)]
pub struct HubSettings {
    pub token: Option<String>,
    pub cache_dir: Option<PathBuf>,
}

impl HubSettings {
    /// Read `HF_TOKEN`, `HF_HUB_CACHE` and `HF_HOME`.
    pub fn from_env() -> Self {
        let cache_dir = std::env::var("HF_HUB_CACHE")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                std::env::var("HF_HOME")
                    .ok()
                    .map(|home| PathBuf::from(home).join("hub"))
            });
        Self {
            token: std::env::var("HF_TOKEN").ok(),
            cache_dir,
        }
    }
}

#[derive(Debug, Clone)]
struct ModelFiles {
    config: Config,
    tokenizer: PathBuf,
    weights: PathBuf,
}

/// `SpeechEngine` backed by Candle's Whisper implementation.
pub struct WhisperEngine {
    size: ModelSize,
    hub: HubSettings,
    files: OnceCell<ModelFiles>,
}

impl WhisperEngine {
    pub fn new(size: ModelSize, hub: HubSettings) -> Self {
        Self {
            size,
            hub,
            files: OnceCell::new(),
        }
    }

    async fn fetch(&self) -> Result<ModelFiles> {
        use hf_hub::api::tokio::ApiBuilder;

        let repo_name = self.size.repo_name();
        info!("Fetching Whisper {} files from {}", self.size, repo_name);

        let mut builder = ApiBuilder::new()
            .with_token(self.hub.token.clone())
            .with_progress(false);
        if let Some(cache_dir) = &self.hub.cache_dir {
            debug!("Using hf-hub cache dir {:?}", cache_dir);
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        let api = builder.build().context("failed to create HuggingFace API client")?;
        let repo = api.model(repo_name.to_string());

        let config_path = repo
            .get("config.json")
            .await
            .with_context(|| format!("failed to download config.json from {}", repo_name))?;
        let tokenizer = repo
            .get("tokenizer.json")
            .await
            .with_context(|| format!("failed to download tokenizer.json from {}", repo_name))?;
        let weights = repo
            .get("model.safetensors")
            .await
            .with_context(|| format!("failed to download model.safetensors from {}", repo_name))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(&config_path)?)
            .context("invalid Whisper config.json")?;
        Ok(ModelFiles {
            config,
            tokenizer,
            weights,
        })
    }
}

#[async_trait]
impl SpeechEngine for WhisperEngine {
    fn model_id(&self) -> String {
        self.size.repo_name().to_string()
    }

    async fn load(&self, slot: usize, device: &DeviceSpec) -> Result<Box<dyn SpeechModel>> {
        let files = self.files.get_or_try_init(|| self.fetch()).await?.clone();
        let size = self.size;
        let device = *device;
        let model = tokio::task::spawn_blocking(move || WhisperModel::load(size, files, device))
            .await
            .map_err(|e| anyhow!("model load task for slot {} failed: {}", slot, e))??;
        Ok(Box::new(model))
    }
}

struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    translate: u32,
    no_timestamps: u32,
    no_speech: Option<u32>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        Ok(Self {
            sot: token_id(tokenizer, m::SOT_TOKEN)?,
            eot: token_id(tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(tokenizer, m::TRANSCRIBE_TOKEN)?,
            translate: token_id(tokenizer, m::TRANSLATE_TOKEN)?,
            no_timestamps: token_id(tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| tokenizer.token_to_id(token)),
        })
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("tokenizer has no token {}", token))
}

struct DecodedWindow {
    tokens: Vec<u32>,
    avg_logprob: f64,
    no_speech_prob: f64,
}

/// One loaded Whisper instance on one device.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    tokens: SpecialTokens,
    language_tokens: Vec<(&'static str, u32)>,
    suppress: Vec<u32>,
}

impl WhisperModel {
    fn load(size: ModelSize, files: ModelFiles, spec: DeviceSpec) -> Result<Self> {
        let started = std::time::Instant::now();
        let device = spec
            .to_candle()
            .with_context(|| format!("device {} is not available", spec))?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;
        let language_tokens = SUPPORTED_LANGUAGES
            .iter()
            .filter_map(|lang| {
                tokenizer
                    .token_to_id(&format!("<|{}|>", lang))
                    .map(|id| (*lang, id))
            })
            .collect();

        let mut suppress = files.config.suppress_tokens.clone();
        suppress.push(tokens.no_timestamps);

        // Safety: the weights file is owned by the hf-hub cache and not modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.weights.as_path()], m::DTYPE, &device)?
        };
        let model = m::model::Whisper::load(&vb, files.config.clone())?;
        let mel_filters = mel_filter_bank(m::SAMPLE_RATE, N_FFT, files.config.num_mel_bins);

        let mut whisper = Self {
            model,
            config: files.config,
            device,
            tokenizer,
            mel_filters,
            tokens,
            language_tokens,
            suppress,
        };
        whisper.validate()?;
        info!(
            "Whisper {} loaded on {} in {:.2}s",
            size,
            spec,
            started.elapsed().as_secs_f64()
        );
        Ok(whisper)
    }

    /// Transcribe one second of silence.
    fn validate(&mut self) -> Result<()> {
        let silence = vec![0.0f32; m::SAMPLE_RATE];
        let options = TranscriptionOptions {
            language: Some("en".to_string()),
            task: TaskMode::Transcribe,
        };
        let result = self.run(&silence, &options, &AbortSignal::new())?;
        debug!("Model validation successful, {} segment(s)", result.segments.len());
        Ok(())
    }

    fn run(
        &mut self,
        samples: &[f32],
        options: &TranscriptionOptions,
        abort: &AbortSignal,
    ) -> Result<RawTranscript> {
        if samples.is_empty() {
            return Ok(RawTranscript {
                segments: Vec::new(),
                language: options.language.clone(),
            });
        }

        let n_mels = self.config.num_mel_bins;
        let mel = audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_len / n_mels), &self.device)?;
        let (_, _, content_frames) = mel.dims3()?;

        let language = match &options.language {
            Some(lang) => lang.clone(),
            None => self.detect_language(&mel)?,
        };
        let language_token = token_id(&self.tokenizer, &format!("<|{}|>", language))?;
        let task_token = match options.task {
            TaskMode::Transcribe => self.tokens.transcribe,
            TaskMode::Translate => self.tokens.translate,
        };

        let mut segments = Vec::new();
        let mut seek = 0;
        while seek < content_frames {
            if abort.is_raised() {
                return Err(InferenceAborted.into());
            }
            let window = usize::min(content_frames - seek, m::N_FRAMES);
            let start = (seek * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            let duration = (window * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            let mel_window = mel.narrow(2, seek, window)?;
            seek += window;

            let decoded = self.decode_window(&mel_window, language_token, task_token, abort)?;
            if decoded.no_speech_prob > NO_SPEECH_THRESHOLD && decoded.avg_logprob < LOGPROB_THRESHOLD {
                debug!("Skipping silent window at {:.1}s", start);
                continue;
            }
            let text = self.decode_tokens(&decoded.tokens)?;
            if text.is_empty() {
                continue;
            }
            segments.push(TranscriptSegment {
                start,
                end: start + duration,
                text,
                confidence: Some(decoded.avg_logprob.exp() as f32),
            });
        }

        Ok(RawTranscript {
            segments,
            language: Some(language),
        })
    }

    fn detect_language(&mut self, mel: &Tensor) -> Result<String> {
        let frames = usize::min(mel.dim(2)?, m::N_FRAMES);
        let features = self.model.encoder.forward(&mel.narrow(2, 0, frames)?, true)?;
        let tokens = Tensor::new(&[self.tokens.sot], &self.device)?.unsqueeze(0)?;
        let ys = self.model.decoder.forward(&tokens, &features, true)?;
        let logits = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
        let logits: Vec<f32> = logits.to_dtype(DType::F32)?.to_vec1()?;

        let (language, _) = self
            .language_tokens
            .iter()
            .filter_map(|(lang, id)| logits.get(*id as usize).map(|l| (*lang, *l)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| anyhow!("model has no language tokens"))?;
        debug!("Detected language: {}", language);
        Ok(language.to_string())
    }

    fn decode_window(
        &mut self,
        mel: &Tensor,
        language_token: u32,
        task_token: u32,
        abort: &AbortSignal,
    ) -> Result<DecodedWindow> {
        let audio_features = self.model.encoder.forward(mel, true)?;
        let mut tokens = vec![
            self.tokens.sot,
            language_token,
            task_token,
            self.tokens.no_timestamps,
        ];
        let prompt_len = tokens.len();
        let sample_len = self.config.max_target_positions / 2;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = 0f64;

        for i in 0..sample_len {
            if abort.is_raised() {
                return Err(InferenceAborted.into());
            }
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, i == 0)?;

            if i == 0 {
                if let Some(no_speech) = self.tokens.no_speech {
                    let first = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                    let first: Vec<f32> = first.to_dtype(DType::F32)?.to_vec1()?;
                    no_speech_prob = log_softmax_at(&first, no_speech as usize).exp();
                }
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let mut logits: Vec<f32> = logits.to_dtype(DType::F32)?.to_vec1()?;
            for &token in &self.suppress {
                if let Some(logit) = logits.get_mut(token as usize) {
                    *logit = f32::NEG_INFINITY;
                }
            }

            let next = argmax(&logits);
            if next == self.tokens.eot || tokens.len() >= self.config.max_target_positions {
                break;
            }
            if is_repetitive(&tokens[prompt_len..], next) {
                debug!("Stopping decode on repeated tokens");
                break;
            }
            sum_logprob += log_softmax_at(&logits, next as usize);
            tokens.push(next);
        }

        let generated = tokens.split_off(prompt_len);
        let avg_logprob = if generated.is_empty() {
            f64::NEG_INFINITY
        } else {
            sum_logprob / generated.len() as f64
        };
        Ok(DecodedWindow {
            tokens: generated,
            avg_logprob,
            no_speech_prob,
        })
    }

    fn decode_tokens(&self, tokens: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(text.trim().to_string())
    }
}

impl SpeechModel for WhisperModel {
    fn transcribe(
        &mut self,
        samples: &[f32],
        options: &TranscriptionOptions,
        abort: &AbortSignal,
    ) -> Result<RawTranscript> {
        self.run(samples, options, abort)
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx as u32)
        .unwrap_or(0)
}

fn log_softmax_at(logits: &[f32], idx: usize) -> f64 {
    let max = logits
        .iter()
        .copied()
        .filter(|l| l.is_finite())
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    let sum: f64 = logits.iter().map(|&l| (l as f64 - max).exp()).sum();
    logits.get(idx).map(|&l| l as f64 - max - sum.ln()).unwrap_or(f64::NEG_INFINITY)
}

/// True when `next` would extend a token loop: the same token four times in a row,
/// or the last three tokens repeating the three before them.
fn is_repetitive(output: &[u32], next: u32) -> bool {
    let n = output.len();
    if n >= 3 && output[n - 3..].iter().all(|&t| t == next) {
        return true;
    }
    if n >= 5 {
        let prev = &output[n - 5..n - 2];
        let last = [output[n - 2], output[n - 1], next];
        if prev == last {
            return true;
        }
    }
    false
}

fn hz_to_mel(hz: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f64).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f64).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}

/// Slaney-normalised triangular mel filters, laid out `[n_mels][n_fft / 2 + 1]`.
fn mel_filter_bank(sample_rate: usize, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate as f64 / 2.0);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for i in 0..n_mels {
        let (lower, center, upper) = (mel_points[i], mel_points[i + 1], mel_points[i + 2]);
        let norm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[i * n_freqs + k] = (weight * norm) as f32;
        }
    }
    filters
}
