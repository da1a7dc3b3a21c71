//! warp-infer: Warm inference session cache
//!
//! Loads machine-learning inference sessions on demand, keeps them warm for
//! reuse and reclaims sessions that have gone idle. Each session runs on one
//! execution backend picked from a ranked list of candidates.
//!
//! # Features
//!
//! - **Session Cache**: Keyed sessions with per-key access clocks
//! - **Idle Eviction**: Background sweeper with a configurable TTL
//! - **Backend Selection**: Ranked provider preferences with CPU/GPU/NPU classes
//! - **Encrypted Models**: XOR-encoded model files decoded in memory
//! - **Device Runs**: Explicit IO binding for GPU and NPU backends
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warp_infer::{ModelConfig, OnnxEngine, ProviderPreference, SessionManager, Tensor};
//!
//! let manager = SessionManager::new(Arc::new(OnnxEngine::new()?));
//! manager.set_timeout(60).await?;
//!
//! let config = ModelConfig::new("models/detector.onnx.enc")
//!     .encrypted()
//!     .with_provider(ProviderPreference::new("CUDAExecutionProvider"));
//!
//! let session = manager.get_or_create("detector", &config)?;
//! let input = Tensor::from_f32(vec![1, 3, 224, 224], pixels)?;
//! let outputs = session.run(vec![input], None)?;
//! manager.update_session_clock("detector");
//! ```
//!
//! # Eviction
//!
//! The TTL follows a small integer protocol:
//!
//! - `-1`: eviction disabled, sessions live until deleted
//! - `0`: every session that has run is flushed immediately
//! - `n > 0`: sessions idle for more than `n` seconds are evicted
//!
//! Sessions with a run in flight are never evicted.
//!
//! # Feature Flags
//!
//! - `onnx`: ONNX Runtime engine
//! - `cuda`: CUDA execution provider (implies `onnx`)
//! - `tensorrt`: TensorRT execution provider (implies `cuda`)
//! - `openvino`: OpenVINO execution provider (implies `onnx`)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod logging;
pub mod manager;
pub mod options;
pub mod session;
mod sweeper;

// Re-export main types at crate root
pub use backend::{BackendRegistry, ClassRule, ProcessorClass, ProviderPreference, ResolvedBackend};
pub use config::{ConfigLoader, EvictionConfig, ManagerConfig, ModelConfig};
pub use engine::{
    DeviceAllocator, DeviceTensor, ElementType, EngineError, EngineSession, InferenceEngine, IoBinding,
    MemoryLocation, NamedTensor, SessionSpec, Tensor, TensorData,
};
pub use error::{Error, Result};
pub use loader::{ModelSource, MODEL_KEY};
pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
pub use manager::{EvictionPolicy, SessionManager, MIN_POLL_INTERVAL};
pub use options::{GraphOptimization, OptionValue, SessionTuning, TuningOptions};
pub use session::Session;

#[cfg(feature = "onnx")]
pub use engine::onnx::OnnxEngine;

/// Get the crate version
#[must_use]
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
