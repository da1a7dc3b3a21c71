//! Runnable model sessions
//!
//! A [`Session`] owns one engine session together with its resolved backend
//! and I/O names. Runs on the same session are serialized; runs on different
//! sessions proceed in parallel.
//!
//! Every run holds a usage guard. A session marked released refuses new
//! runs, and if a run is in flight when the release happens the engine
//! handle is dropped by the last guard instead of under the caller's feet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendRegistry, ProcessorClass, ResolvedBackend};
use crate::config::ModelConfig;
use crate::engine::{
    guarded, DeviceAllocator, EngineResult, EngineSession, InferenceEngine, IoBinding, NamedTensor, SessionSpec,
    Tensor,
};
use crate::error::{Error, Result};
use crate::loader;
use crate::options::SessionTuning;

struct Loaded {
    // Dropped before the session it was created from
    allocator: Option<Box<dyn DeviceAllocator>>,
    engine: Box<dyn EngineSession>,
}

#[derive(Debug, Default)]
struct Usage {
    in_flight: usize,
    released: bool,
}

/// One loaded, runnable model
pub struct Session {
    key: String,
    input_names: Vec<String>,
    output_names: Vec<String>,
    backend: ResolvedBackend,
    has_run: AtomicBool,
    usage: Mutex<Usage>,
    loaded: Mutex<Option<Loaded>>,
}

impl Session {
    /// Build a session from a model config
    ///
    /// Loads (and if needed decrypts) the model, resolves a backend against
    /// what `engine` offers, then asks the engine for a session. Device
    /// backends also get a device allocator.
    pub fn open(
        engine: &dyn InferenceEngine,
        key: impl Into<String>,
        config: &ModelConfig,
        registry: &BackendRegistry,
    ) -> Result<Self> {
        let key = key.into();

        let source = loader::load(&config.path, config.encrypted)?;
        let backend = registry.resolve(&config.providers, &engine.available_backends())?;
        let spec = SessionSpec {
            backend,
            tuning: SessionTuning::from_options(&config.options),
        };

        let opened = guarded(|| engine.open_session(&source, &spec));
        // Decoded model bytes are wiped here
        drop(source);
        let engine_session = opened.map_err(|e| {
            error!(key = %key, engine = engine.name(), error = %e, "Failed to create session");
            Error::engine(&key, e)
        })?;

        let input_names = engine_session.input_names();
        let output_names = engine_session.output_names();
        let backend = spec.backend;

        let allocator = if backend.class.is_host() {
            None
        } else {
            let allocator = guarded(|| engine_session.device_allocator(&backend)).map_err(|e| {
                error!(key = %key, backend = %backend.name, error = %e, "Failed to create device allocator");
                Error::engine(&key, e)
            })?;
            Some(allocator)
        };

        info!(
            key = %key,
            backend = %backend.name,
            class = %backend.class,
            inputs = input_names.len(),
            outputs = output_names.len(),
            "Session created"
        );

        Ok(Self {
            key,
            input_names,
            output_names,
            backend,
            has_run: AtomicBool::new(false),
            usage: Mutex::new(Usage::default()),
            loaded: Mutex::new(Some(Loaded {
                allocator,
                engine: engine_session,
            })),
        })
    }

    /// Run the model synchronously
    ///
    /// Inputs bind to the model's input names by position. With `output`
    /// naming a known output only that output is collected, for this call
    /// only; an unknown name is ignored and every output is returned.
    pub fn run(&self, inputs: Vec<Tensor>, output: Option<&str>) -> Result<Vec<NamedTensor>> {
        if inputs.len() != self.input_names.len() {
            return Err(Error::InputCountMismatch {
                expected: self.input_names.len(),
                actual: inputs.len(),
            });
        }

        let _guard = self.acquire()?;
        let outputs = self.selected_outputs(output);

        let result = {
            let mut loaded = self.loaded.lock();
            let Some(loaded) = loaded.as_mut() else {
                return Err(Error::SessionReleased { key: self.key.clone() });
            };
            guarded(|| self.dispatch(loaded, inputs, &outputs))
        };

        match result {
            Ok(tensors) => {
                self.has_run.store(true, Ordering::Release);
                Ok(tensors)
            }
            Err(e) => {
                error!(key = %self.key, backend = %self.backend.name, error = %e, "Session run failed");
                Err(Error::engine(&self.key, e))
            }
        }
    }

    /// Run the model on tokio's blocking pool
    ///
    /// The returned handle resolves to the same result as [`Session::run`].
    /// Dropping the handle does not cancel the run.
    pub fn run_async(
        self: &Arc<Self>,
        inputs: Vec<Tensor>,
        output: Option<String>,
    ) -> Result<JoinHandle<Result<Vec<NamedTensor>>>> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let session = Arc::clone(self);
        Ok(handle.spawn_blocking(move || session.run(inputs, output.as_deref())))
    }

    /// Run on the blocking pool, giving up after `deadline`
    ///
    /// On expiry the engine call keeps running in the background and its
    /// result is discarded.
    pub async fn run_with_timeout(
        self: &Arc<Self>,
        inputs: Vec<Tensor>,
        output: Option<String>,
        deadline: Duration,
    ) -> Result<Vec<NamedTensor>> {
        let handle = self.run_async(inputs, output)?;
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::Join(e.to_string())),
            Err(_) => {
                warn!(key = %self.key, deadline = ?deadline, "Run exceeded deadline, abandoning");
                Err(Error::DeadlineExceeded(deadline))
            }
        }
    }

    fn selected_outputs(&self, output: Option<&str>) -> Vec<String> {
        match output {
            Some(name) if self.output_names.iter().any(|n| n == name) => vec![name.to_string()],
            Some(name) => {
                warn!(key = %self.key, output = %name, "Unknown output requested, collecting all outputs");
                self.output_names.clone()
            }
            None => self.output_names.clone(),
        }
    }

    fn dispatch(&self, loaded: &mut Loaded, inputs: Vec<Tensor>, outputs: &[String]) -> EngineResult<Vec<NamedTensor>> {
        let named: Vec<NamedTensor> = self
            .input_names
            .iter()
            .zip(inputs)
            .map(|(name, tensor)| NamedTensor::new(name.clone(), tensor))
            .collect();

        let allocator = match (&self.backend.class, &loaded.allocator) {
            (ProcessorClass::Cpu, _) | (_, None) => return loaded.engine.run(named, outputs),
            (_, Some(allocator)) => allocator,
        };

        let mut binding = IoBinding::new(allocator.location().clone());
        for input in named {
            let device = allocator.upload(&input.tensor)?;
            binding.bind_input(input.name, device);
        }
        for name in outputs {
            binding.bind_output(name.clone());
        }

        loaded
            .engine
            .run_binding(binding)?
            .into_iter()
            .map(|(name, device)| -> EngineResult<NamedTensor> {
                Ok(NamedTensor::new(name, allocator.download(device)?))
            })
            .collect()
    }

    fn acquire(&self) -> Result<RunGuard<'_>> {
        let mut usage = self.usage.lock();
        if usage.released {
            return Err(Error::SessionReleased { key: self.key.clone() });
        }
        usage.in_flight += 1;
        Ok(RunGuard { session: self })
    }

    /// Release now if idle
    ///
    /// Marks the session released and hands back its engine handle so the
    /// caller decides where it is dropped. Returns `None`, leaving the
    /// session untouched, while a run is in flight.
    pub(crate) fn try_release(&self) -> Option<Detached> {
        let mut usage = self.usage.lock();
        if usage.in_flight > 0 {
            return None;
        }
        usage.released = true;
        drop(usage);
        Some(Detached {
            key: self.key.clone(),
            loaded: self.loaded.lock().take(),
        })
    }

    /// Refuse new runs and release once the last run finishes
    pub(crate) fn mark_released(&self) {
        let mut usage = self.usage.lock();
        usage.released = true;
        if usage.in_flight > 0 {
            debug!(key = %self.key, in_flight = usage.in_flight, "Release deferred until runs finish");
            return;
        }
        drop(usage);
        self.release_engine();
    }

    fn release_engine(&self) {
        if self.loaded.lock().take().is_some() {
            debug!(key = %self.key, "Engine session released");
        }
    }

    /// Registry key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Model input names in index order
    #[must_use]
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Model output names in index order
    #[must_use]
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Resolved backend
    #[must_use]
    pub fn backend(&self) -> &ResolvedBackend {
        &self.backend
    }

    /// Processor class of the resolved backend
    #[must_use]
    pub fn processor_class(&self) -> ProcessorClass {
        self.backend.class
    }

    /// Whether at least one run has completed successfully
    #[must_use]
    pub fn has_run(&self) -> bool {
        self.has_run.load(Ordering::Acquire)
    }

    /// Number of runs currently executing
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.usage.lock().in_flight
    }

    /// Whether the session was evicted or deleted
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.usage.lock().released
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("backend", &self.backend.name)
            .field("class", &self.backend.class)
            .field("inputs", &self.input_names)
            .field("outputs", &self.output_names)
            .field("has_run", &self.has_run())
            .finish_non_exhaustive()
    }
}

/// Engine handle taken out of a released session
///
/// The engine session and its allocator are torn down when this is dropped.
pub(crate) struct Detached {
    key: String,
    loaded: Option<Loaded>,
}

impl Drop for Detached {
    fn drop(&mut self) {
        if self.loaded.take().is_some() {
            debug!(key = %self.key, "Engine session released");
        }
    }
}

struct RunGuard<'a> {
    session: &'a Session,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut usage = self.session.usage.lock();
        usage.in_flight -= 1;
        let release = usage.released && usage.in_flight == 0;
        drop(usage);
        if release {
            self.session.release_engine();
        }
    }
}
