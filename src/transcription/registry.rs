//! # Model Registry
//!
//! A fixed set of model slots, one per configured device entry. Workers check a
//! slot out for the duration of one job and give it back afterwards.
//!
//! ## Key Features:
//! - **Lazy loading**: a slot loads its model the first time it is needed. The load
//!   runs as its own task, so a checkout never waits on it past its deadline
//! - **Warm preference**: checkout takes an already-loaded idle slot before loading a new one
//! - **Mutual exclusion**: a slot is handed to at most one worker at a time
//! - **Degraded capacity**: a slot whose load fails is marked `Failed` and skipped;
//!   checkout only reports `NoCapacity` once every slot has failed
//! - **Reclaim**: the sweeper can take a slot back from a lost worker; the lost
//!   worker's lease is recognised as stale by its generation number and discarded
//!
//! ## Slot States:
//! ```text
//! Unloaded → Loading → Busy ⇄ Idle
//!               └────→ Failed
//! ```

use crate::device::DeviceSpec;
use crate::pipeline::error::PipelineError;
use crate::pipeline::job::JobId;
use crate::pipeline::lock;
use crate::transcription::engine::{
    AbortSignal, RawTranscript, SpeechEngine, SpeechModel, TranscriptionOptions,
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Current status of a model slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotStatus {
    /// Nothing loaded yet (or the previous model was discarded)
    Unloaded,

    Loading { started_at: DateTime<Utc> },

    /// Loaded and free
    Idle,

    /// Checked out by a worker
    Busy {
        worker: usize,
        job_id: JobId,
        since: DateTime<Utc>,
    },

    /// Load failed; this slot is permanently out of rotation
    Failed {
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

impl SlotStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, SlotStatus::Idle | SlotStatus::Busy { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SlotStatus::Failed { .. })
    }

    pub fn description(&self) -> String {
        match self {
            SlotStatus::Unloaded => "Not loaded".to_string(),
            SlotStatus::Loading { .. } => "Loading into memory".to_string(),
            SlotStatus::Idle => "Ready for inference".to_string(),
            SlotStatus::Busy { job_id, .. } => format!("Transcribing job {}", job_id),
            SlotStatus::Failed { reason, .. } => format!("Error: {}", reason),
        }
    }
}

/// Usage metrics for a slot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelMetrics {
    pub total_requests: u64,
    /// Seconds of audio processed
    pub total_audio_duration: f64,
    /// Milliseconds spent in inference
    pub total_processing_time: u64,
    /// Mean over successful requests that reported a confidence
    pub average_confidence: f32,
    pub failed_requests: u64,
    /// Successful requests that reported a confidence
    pub scored_requests: u64,
}

impl ModelMetrics {
    pub fn success_rate(&self) -> f32 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_requests - self.failed_requests) as f32 / self.total_requests as f32
        }
    }

    /// Audio seconds per processing second.
    pub fn processing_speed_factor(&self) -> f64 {
        if self.total_processing_time == 0 {
            0.0
        } else {
            (self.total_audio_duration * 1000.0) / self.total_processing_time as f64
        }
    }

    pub fn update(
        &mut self,
        audio_duration: f64,
        processing_time_ms: u64,
        confidence: Option<f32>,
        success: bool,
    ) {
        self.total_requests += 1;
        self.total_audio_duration += audio_duration;
        self.total_processing_time += processing_time_ms;

        if !success {
            self.failed_requests += 1;
        } else if let Some(confidence) = confidence {
            self.scored_requests += 1;
            let scored = self.scored_requests as f32;
            self.average_confidence =
                (self.average_confidence * (scored - 1.0) + confidence) / scored;
        }
    }
}

struct Slot {
    device: DeviceSpec,
    status: SlotStatus,
    model: Option<Box<dyn SpeechModel>>,
    /// Bumped whenever the slot is taken away from its holder
    generation: u64,
    loaded_at: Option<DateTime<Utc>>,
    last_used: Option<DateTime<Utc>>,
    metrics: ModelMetrics,
}

struct Shared {
    engine: Arc<dyn SpeechEngine>,
    model_id: String,
    slots: Mutex<Vec<Slot>>,
    changed: Notify,
}

impl Shared {
    /// Return a model to its slot, or discard it if the lease is stale or the holder panicked.
    fn give_back(&self, slot: usize, generation: u64, model: Box<dyn SpeechModel>, discard: bool) {
        let leftover = {
            let mut slots = lock(&self.slots);
            let entry = &mut slots[slot];
            if entry.generation != generation {
                debug!(slot, "Dropping model from a reclaimed lease");
                Some(model)
            } else if discard {
                warn!(slot, device = %entry.device, "Discarding model instance after a panic");
                entry.status = SlotStatus::Unloaded;
                entry.generation += 1;
                entry.loaded_at = None;
                Some(model)
            } else {
                entry.model = Some(model);
                entry.status = SlotStatus::Idle;
                entry.last_used = Some(Utc::now());
                None
            }
        };
        // Model teardown can be slow on GPU; keep it outside the lock.
        drop(leftover);
        self.changed.notify_waiters();
    }
}

/// A checked-out model instance.
///
/// Hand it back with `ModelRegistry::release`. If it is dropped instead, the model
/// still goes back to its slot; if the drop happens while unwinding from a panic
/// the model is discarded and the slot reloads on next use.
pub struct ModelInstance {
    shared: Arc<Shared>,
    slot: usize,
    generation: u64,
    device: DeviceSpec,
    model: Option<Box<dyn SpeechModel>>,
}

impl ModelInstance {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn device(&self) -> DeviceSpec {
        self.device
    }

    pub fn model_id(&self) -> &str {
        &self.shared.model_id
    }

    /// Run inference on this instance. Blocking.
    pub fn transcribe(
        &mut self,
        samples: &[f32],
        options: &TranscriptionOptions,
        abort: &AbortSignal,
    ) -> anyhow::Result<RawTranscript> {
        match self.model.as_mut() {
            Some(model) => model.transcribe(samples, options, abort),
            None => Err(anyhow!("model instance on slot {} was already released", self.slot)),
        }
    }
}

impl Drop for ModelInstance {
    fn drop(&mut self) {
        if let Some(model) = self.model.take() {
            self.shared
                .give_back(self.slot, self.generation, model, std::thread::panicking());
        }
    }
}

/// Resets a slot stuck in `Loading` if the load task is dropped mid-load.
struct LoadGuard {
    shared: Arc<Shared>,
    slot: usize,
    armed: bool,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut slots = lock(&self.shared.slots);
            let entry = &mut slots[self.slot];
            if matches!(entry.status, SlotStatus::Loading { .. }) {
                entry.status = SlotStatus::Unloaded;
            }
        }
        self.shared.changed.notify_waiters();
    }
}

enum Claim {
    Ready(ModelInstance),
    Load { slot: usize, device: DeviceSpec },
    Wait,
}

/// Per-slot view for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub slot: usize,
    pub device: DeviceSpec,
    pub status: SlotStatus,
    pub description: String,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub metrics: ModelMetrics,
    pub success_rate: f32,
    pub speed_factor: f64,
}

/// Registry-wide counts.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub model_id: String,
    pub total: usize,
    pub loaded: usize,
    pub busy: usize,
    pub loading: usize,
    pub failed: usize,
    /// Slots a checkout could take right now without waiting (idle or unloaded)
    pub available: usize,
    pub slots: Vec<SlotSnapshot>,
}

/// Pool of model slots shared by all workers.
#[derive(Clone)]
pub struct ModelRegistry {
    shared: Arc<Shared>,
}

impl ModelRegistry {
    /// One slot per device entry. Nothing is loaded until first checkout (or `preload`).
    pub fn new(engine: Arc<dyn SpeechEngine>, devices: &[DeviceSpec]) -> Self {
        let slots = devices
            .iter()
            .map(|device| Slot {
                device: *device,
                status: SlotStatus::Unloaded,
                model: None,
                generation: 0,
                loaded_at: None,
                last_used: None,
                metrics: ModelMetrics::default(),
            })
            .collect();
        let model_id = engine.model_id();
        Self {
            shared: Arc::new(Shared {
                engine,
                model_id,
                slots: Mutex::new(slots),
                changed: Notify::new(),
            }),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.shared.model_id
    }

    pub fn size(&self) -> usize {
        lock(&self.shared.slots).len()
    }

    /// Check out a model instance for `job_id`, waiting until `deadline` if every
    /// loaded slot is busy.
    ///
    /// ## Returns:
    /// - **Ok(instance)**: exclusive use of one slot until released
    /// - **CheckoutTimeout**: all usable slots stayed busy past the deadline
    /// - **NoCapacity**: every slot failed to load
    ///
    /// A slot that needs loading is loaded by a background task. If the deadline
    /// passes first the checkout fails; the load carries on and parks the model
    /// `Idle` for the next caller.
    pub async fn checkout(
        &self,
        worker: usize,
        job_id: JobId,
        deadline: Instant,
    ) -> Result<ModelInstance, PipelineError> {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.claim(worker, job_id)? {
                Claim::Ready(instance) => return Ok(instance),
                Claim::Load { slot, device } => {
                    self.spawn_load(slot, device);
                    // The load notifies when it parks the model or fails.
                    if tokio::time::timeout_at(deadline, changed).await.is_err() {
                        return Err(PipelineError::CheckoutTimeout);
                    }
                }
                Claim::Wait => {
                    if tokio::time::timeout_at(deadline, changed).await.is_err() {
                        return Err(PipelineError::CheckoutTimeout);
                    }
                }
            }
        }
    }

    fn spawn_load(&self, slot: usize, device: DeviceSpec) {
        let registry = self.clone();
        tokio::spawn(async move {
            if let Err(err) = registry.load_slot(slot, device).await {
                warn!(slot, error = %err, "Slot unavailable, trying remaining capacity");
            }
        });
    }

    fn claim(&self, worker: usize, job_id: JobId) -> Result<Claim, PipelineError> {
        let mut slots = lock(&self.shared.slots);
        if slots.iter().all(|s| s.status.is_failed()) {
            return Err(PipelineError::NoCapacity);
        }

        if let Some(idx) = slots
            .iter()
            .position(|s| s.status == SlotStatus::Idle && s.model.is_some())
        {
            let entry = &mut slots[idx];
            entry.status = SlotStatus::Busy {
                worker,
                job_id,
                since: Utc::now(),
            };
            return Ok(Claim::Ready(ModelInstance {
                shared: self.shared.clone(),
                slot: idx,
                generation: entry.generation,
                device: entry.device,
                model: entry.model.take(),
            }));
        }

        if let Some(idx) = slots.iter().position(|s| s.status == SlotStatus::Unloaded) {
            let entry = &mut slots[idx];
            entry.status = SlotStatus::Loading {
                started_at: Utc::now(),
            };
            return Ok(Claim::Load {
                slot: idx,
                device: entry.device,
            });
        }

        Ok(Claim::Wait)
    }

    /// Load a model into a slot already marked `Loading` and park it as `Idle`.
    async fn load_slot(&self, slot: usize, device: DeviceSpec) -> Result<(), PipelineError> {
        let mut guard = LoadGuard {
            shared: self.shared.clone(),
            slot,
            armed: true,
        };
        info!(slot, device = %device, model = %self.shared.model_id, "Loading model instance");
        let started = std::time::Instant::now();
        let loaded = self.shared.engine.load(slot, &device).await;
        guard.armed = false;

        let mut slots = lock(&self.shared.slots);
        let entry = &mut slots[slot];
        match loaded {
            Ok(model) => {
                entry.loaded_at = Some(Utc::now());
                entry.model = Some(model);
                entry.status = SlotStatus::Idle;
                drop(slots);
                info!(
                    slot,
                    device = %device,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model instance loaded"
                );
                self.shared.changed.notify_waiters();
                Ok(())
            }
            Err(err) => {
                let reason = format!("{:#}", err);
                error!(slot, device = %device, "Model load failed: {}", reason);
                entry.status = SlotStatus::Failed {
                    reason: reason.clone(),
                    failed_at: Utc::now(),
                };
                drop(slots);
                // Waiters must re-check: capacity may have dropped to zero.
                self.shared.changed.notify_waiters();
                Err(PipelineError::ModelLoadFailure { slot, reason })
            }
        }
    }

    /// Load every unloaded slot up front. Failures degrade capacity but are not fatal.
    pub async fn preload(&self) -> usize {
        let mut loaded = 0;
        loop {
            let next = {
                let mut slots = lock(&self.shared.slots);
                slots
                    .iter()
                    .position(|s| s.status == SlotStatus::Unloaded)
                    .map(|idx| {
                        slots[idx].status = SlotStatus::Loading {
                            started_at: Utc::now(),
                        };
                        (idx, slots[idx].device)
                    })
            };
            let Some((slot, device)) = next else { break };
            if self.load_slot(slot, device).await.is_ok() {
                loaded += 1;
            }
        }
        loaded
    }

    /// Return a checked-out instance to the pool.
    pub fn release(&self, mut instance: ModelInstance) {
        if let Some(model) = instance.model.take() {
            debug!(slot = instance.slot, "Releasing model instance");
            self.shared
                .give_back(instance.slot, instance.generation, model, false);
        }
    }

    /// Take back the slot held for `job_id` from a worker presumed lost.
    pub fn reclaim(&self, job_id: JobId) -> bool {
        let reclaimed = {
            let mut slots = lock(&self.shared.slots);
            match slots.iter_mut().find(|s| {
                matches!(&s.status, SlotStatus::Busy { job_id: held, .. } if *held == job_id)
            }) {
                Some(entry) => {
                    warn!(device = %entry.device, job_id = %job_id, "Reclaiming model slot from lost worker");
                    entry.status = SlotStatus::Unloaded;
                    entry.generation += 1;
                    entry.loaded_at = None;
                    true
                }
                None => false,
            }
        };
        if reclaimed {
            self.shared.changed.notify_waiters();
        }
        reclaimed
    }

    pub fn record_usage(
        &self,
        slot: usize,
        audio_duration: f64,
        processing_time_ms: u64,
        confidence: Option<f32>,
        success: bool,
    ) {
        if let Some(entry) = lock(&self.shared.slots).get_mut(slot) {
            entry
                .metrics
                .update(audio_duration, processing_time_ms, confidence, success);
        }
    }

    /// Drop models from idle slots. Busy slots are left to their holders.
    pub fn unload_idle(&self) -> usize {
        let models: Vec<Box<dyn SpeechModel>> = {
            let mut slots = lock(&self.shared.slots);
            slots
                .iter_mut()
                .filter(|s| s.status == SlotStatus::Idle)
                .filter_map(|s| {
                    s.status = SlotStatus::Unloaded;
                    s.loaded_at = None;
                    s.model.take()
                })
                .collect()
        };
        let count = models.len();
        drop(models);
        if count > 0 {
            info!(count, "Unloaded idle model instances");
        }
        count
    }

    pub fn summary(&self) -> RegistrySummary {
        let slots = lock(&self.shared.slots);
        let snapshots: Vec<SlotSnapshot> = slots
            .iter()
            .enumerate()
            .map(|(idx, s)| SlotSnapshot {
                slot: idx,
                device: s.device,
                status: s.status.clone(),
                description: s.status.description(),
                loaded_at: s.loaded_at,
                last_used: s.last_used,
                success_rate: s.metrics.success_rate(),
                speed_factor: s.metrics.processing_speed_factor(),
                metrics: s.metrics.clone(),
            })
            .collect();

        let count = |f: fn(&SlotStatus) -> bool| slots.iter().filter(|s| f(&s.status)).count();
        RegistrySummary {
            model_id: self.shared.model_id.clone(),
            total: slots.len(),
            loaded: count(SlotStatus::is_loaded),
            busy: count(|s| matches!(s, SlotStatus::Busy { .. })),
            loading: count(|s| matches!(s, SlotStatus::Loading { .. })),
            failed: count(SlotStatus::is_failed),
            available: count(|s| matches!(s, SlotStatus::Idle | SlotStatus::Unloaded)),
            slots: snapshots,
        }
    }
}
