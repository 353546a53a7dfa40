// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Telepress - Template-based telemetry compression
//!
//! An online, adaptive, lossy compressor for per-device scalar sensor
//! streams.
//!
//! ## Key Features
//!
//! - **Windowed templates**: each run of `W` samples is stored once as a
//!   template or as a reference to a similar one
//! - **Bounded dictionaries**: at most `K` active templates per device, with
//!   LFU-with-aging eviction
//! - **Self-tuning threshold**: the similarity bound τ follows a target
//!   match-rate band and an error budget
//! - **Lossless bookkeeping**: evicted templates stay readable, so every
//!   record can always be reconstructed
//!
//! ## Quick Start
//!
//! ```rust
//! use telepress::{CodecConfig, Decompressor, DeviceCompressor, MemoryStore, Sample, Store};
//!
//! let store = MemoryStore::new();
//! let config = CodecConfig::with_window(4, 8);
//! let mut compressor = DeviceCompressor::new("d1".into(), config).unwrap();
//!
//! for i in 0..10u64 {
//!     let outcome = compressor.push(Sample::new("d1", i * 1000, 20.0)).unwrap();
//!     for emission in &outcome.emissions {
//!         store.apply(&emission.store_ops()).unwrap();
//!     }
//! }
//! if let Some(emission) = compressor.flush().unwrap() {
//!     store.apply(&emission.store_ops()).unwrap();
//! }
//!
//! let samples = Decompressor::new(&store).collect(&"d1".into(), None).unwrap();
//! assert_eq!(samples.len(), 10);
//! ```
//!
//! ## Modules
//!
//! - [`sample`]: Samples, device ids, time spans and windows
//! - [`distance`]: Window dissimilarity
//! - [`dictionary`]: Bounded template dictionary and eviction policies
//! - [`threshold`]: Adaptive similarity threshold
//! - [`compressor`]: Per-device compression state machine
//! - [`decompressor`]: Stream reconstruction and JSON export
//! - [`store`]: Persistence adapter and snapshot files
//! - [`engine`]: Multi-device routing with persistence
//! - [`metrics`]: Compression statistics

// Modules
pub mod compressor;
pub mod config;
pub mod decompressor;
pub mod dictionary;
pub mod distance;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod record;
pub mod recovery;
pub mod sample;
pub mod store;
pub mod threshold;

// Re-exports for convenient access
pub use compressor::{CompressorState, DeviceCompressor, Emission, PushOutcome};
pub use config::{CodecConfig, ConfigSet, ThresholdConfig};
pub use decompressor::{export_json, Decompressor, Reconstruction};
pub use dictionary::{Admission, EvictionPolicy, TemplateDictionary};
pub use distance::{distance, DistanceMetric};
pub use engine::Engine;
pub use error::{
    ConfigError, DecodeError, DictionaryError, DistanceError, Result, SampleError, StoreError,
    TelepressError,
};
pub use metrics::{CompressionMetrics, CostWeights};
pub use record::{CompactRecord, ReconstructedSample, RecordKind, Residual, Template};
pub use recovery::{apply_with_retry, RetryStrategy};
pub use sample::{DeviceId, Sample, TemplateId, TimeSpan, Window};
pub use store::{MemoryStore, Store, StoreOp};
pub use threshold::ThresholdState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
