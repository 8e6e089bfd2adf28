//! Scripted speech engine for tests: fixed latency, per-slot load failures and a
//! recorder that notes every load and inference run.

use crate::device::DeviceSpec;
use crate::pipeline::lock;
use crate::audio::SAMPLE_RATE;
use crate::transcription::engine::{
    AbortSignal, InferenceAborted, RawTranscript, SpeechEngine, SpeechModel, TranscriptSegment,
    TranscriptionOptions,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One completed (or aborted) inference call.
#[derive(Debug, Clone)]
pub struct Run {
    pub slot: usize,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
pub struct Recorder {
    loads: AtomicUsize,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_parallel: AtomicUsize,
    overlaps: AtomicUsize,
    active: Mutex<HashMap<usize, usize>>,
    runs: Mutex<Vec<Run>>,
}

impl Recorder {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Times two inferences ran on the same slot at once.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> Vec<Run> {
        let mut runs = lock(&self.runs).clone();
        runs.sort_by_key(|r| r.started);
        runs
    }

    fn enter(&self, slot: usize) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut active = lock(&self.active);
        let count = active.entry(slot).or_insert(0);
        if *count > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        *count += 1;
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_parallel.fetch_max(running, Ordering::SeqCst);
    }

    fn exit(&self, slot: usize, started: Instant) {
        if let Some(count) = lock(&self.active).get_mut(&slot) {
            *count -= 1;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        lock(&self.runs).push(Run {
            slot,
            started,
            finished: Instant::now(),
        });
    }
}

#[derive(Clone)]
pub struct ScriptedEngine {
    latency: Duration,
    load_delay: Duration,
    failing_slots: Vec<usize>,
    ignore_abort: bool,
    fail_inference: bool,
    text: String,
    recorder: Arc<Recorder>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(20),
            load_delay: Duration::ZERO,
            failing_slots: Vec::new(),
            ignore_abort: false,
            fail_inference: false,
            text: "scripted transcript".to_string(),
            recorder: Arc::new(Recorder::default()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every model load takes this long before it succeeds or fails.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn failing_slot(mut self, slot: usize) -> Self {
        self.failing_slots.push(slot);
        self
    }

    /// Models keep running after the abort signal is raised.
    pub fn ignoring_abort(mut self) -> Self {
        self.ignore_abort = true;
        self
    }

    pub fn failing_inference(mut self) -> Self {
        self.fail_inference = true;
        self
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        self.recorder.clone()
    }
}

#[async_trait]
impl SpeechEngine for ScriptedEngine {
    fn model_id(&self) -> String {
        "scripted".to_string()
    }

    async fn load(&self, slot: usize, _device: &DeviceSpec) -> Result<Box<dyn SpeechModel>> {
        self.recorder.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.failing_slots.contains(&slot) {
            return Err(anyhow!("scripted load failure on slot {}", slot));
        }
        Ok(Box::new(ScriptedModel {
            slot,
            engine: self.clone(),
        }))
    }
}

struct ScriptedModel {
    slot: usize,
    engine: ScriptedEngine,
}

impl SpeechModel for ScriptedModel {
    fn transcribe(
        &mut self,
        samples: &[f32],
        options: &TranscriptionOptions,
        abort: &AbortSignal,
    ) -> Result<RawTranscript> {
        let recorder = &self.engine.recorder;
        let started = Instant::now();
        recorder.enter(self.slot);

        while started.elapsed() < self.engine.latency {
            if !self.engine.ignore_abort && abort.is_raised() {
                recorder.exit(self.slot, started);
                return Err(InferenceAborted.into());
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        recorder.exit(self.slot, started);

        if self.engine.fail_inference {
            return Err(anyhow!("scripted inference failure"));
        }
        let duration = samples.len() as f64 / SAMPLE_RATE as f64;
        Ok(RawTranscript {
            segments: vec![TranscriptSegment {
                start: 0.0,
                end: duration,
                text: self.engine.text.clone(),
                confidence: Some(0.9),
            }],
            language: options.language.clone().or_else(|| Some("en".to_string())),
        })
    }
}

/// A 16-bit mono WAV of `seconds` of silence at `rate`.
pub fn wav_bytes(seconds: f64, rate: u32) -> Vec<u8> {
    let samples = vec![0i16; (seconds * rate as f64) as usize];
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, rate, 16);
    let mut cursor = std::io::Cursor::new(Vec::new());
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut cursor).expect("in-memory wav");
    cursor.into_inner()
}
