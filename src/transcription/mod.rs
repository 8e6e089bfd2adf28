//! # Transcription Module
//!
//! Speech-to-text models and the pool that shares them between workers.
//!
//! ## Key Components:
//! - **Engine interface**: `SpeechEngine` / `SpeechModel` traits, options and result types
//! - **Whisper backend**: Candle-rs Whisper, downloaded from HuggingFace
//! - **Model Registry**: one lazily loaded model slot per configured device
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, the default
//! - **medium**: ~769MB, good technical vocabulary
//! - **large**: ~1550MB, best accuracy but slowest

pub mod engine;      // Engine traits, options, transcript types
pub mod registry;    // Model slots, checkout and release
pub mod whisper;     // Candle Whisper backend

#[cfg(test)]
pub mod testing;

pub use engine::SpeechEngine;
