//! # Audio
//!
//! Decoding uploaded audio files into model-ready samples.

pub mod decode;

pub use decode::{decode_audio, SAMPLE_RATE};
