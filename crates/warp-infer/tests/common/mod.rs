//! Scripted inference engine for integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use warp_infer::backend::{CPU_PROVIDER, CUDA_PROVIDER};
use warp_infer::engine::{EngineResult, SessionSpec};
use warp_infer::loader::ModelSource;
use warp_infer::{
    DeviceAllocator, DeviceTensor, EngineError, EngineSession, InferenceEngine, IoBinding, MemoryLocation,
    ModelConfig, NamedTensor, ResolvedBackend, Tensor, TensorData,
};

/// Counters and switches shared by the engine and every session it opens
#[derive(Default)]
pub struct FakeState {
    pub opened: AtomicUsize,
    pub sessions_dropped: AtomicUsize,
    pub allocators_dropped: AtomicUsize,
    pub host_runs: AtomicUsize,
    pub binding_runs: AtomicUsize,
    pub uploads: AtomicUsize,
    pub downloads: AtomicUsize,
    pub fail_runs: AtomicBool,
    pub panic_runs: AtomicBool,
    pub fail_open: AtomicBool,
    pub run_delay: Mutex<Duration>,
    pub last_model: Mutex<Vec<u8>>,
    pub last_spec: Mutex<Option<SessionSpec>>,
    pub last_outputs: Mutex<Vec<String>>,
    drop_hook: Mutex<Option<DropHook>>,
    gate: Mutex<Gate>,
    gate_cv: Condvar,
}

type DropHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Gate {
    closed: bool,
    waiting: usize,
}

impl FakeState {
    /// Call `hook` whenever an engine session is dropped
    pub fn on_session_drop(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.drop_hook.lock() = Some(Box::new(hook));
    }

    /// Make runs block until [`FakeState::open_gate`]
    pub fn close_gate(&self) {
        self.gate.lock().closed = true;
    }

    pub fn open_gate(&self) {
        self.gate.lock().closed = false;
        self.gate_cv.notify_all();
    }

    /// Block until `n` runs are parked at the gate
    pub fn wait_for_parked(&self, n: usize) {
        let mut gate = self.gate.lock();
        while gate.waiting < n {
            self.gate_cv.wait_for(&mut gate, Duration::from_millis(10));
        }
    }

    fn pass_gate(&self) {
        let mut gate = self.gate.lock();
        if !gate.closed {
            return;
        }
        gate.waiting += 1;
        self.gate_cv.notify_all();
        while gate.closed {
            self.gate_cv.wait(&mut gate);
        }
        gate.waiting -= 1;
    }

    fn before_run(&self) -> EngineResult<()> {
        self.pass_gate();
        let delay = *self.run_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.panic_runs.load(Ordering::SeqCst) {
            panic!("fake kernel fault");
        }
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(EngineError::Execution("scripted failure".to_string()));
        }
        Ok(())
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Engine returning, for every requested output, the sum of all f32 inputs
pub struct FakeEngine {
    pub state: Arc<FakeState>,
    backends: Vec<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeState::default()),
            backends: vec![CPU_PROVIDER.to_string()],
            inputs: vec!["x".to_string()],
            outputs: vec!["y".to_string()],
        }
    }

    pub fn with_backends(mut self, backends: &[&str]) -> Self {
        self.backends = backends.iter().map(|b| b.to_string()).collect();
        self
    }

    pub fn with_gpu(self) -> Self {
        self.with_backends(&[CPU_PROVIDER, CUDA_PROVIDER])
    }

    pub fn with_io(mut self, inputs: &[&str], outputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }
}

impl InferenceEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn available_backends(&self) -> Vec<String> {
        self.backends.clone()
    }

    fn open_session(&self, source: &ModelSource, spec: &SessionSpec) -> EngineResult<Box<dyn EngineSession>> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(EngineError::Construction("scripted open failure".to_string()));
        }
        let bytes = match source {
            ModelSource::File(path) => std::fs::read(path).map_err(|e| EngineError::Construction(e.to_string()))?,
            ModelSource::Memory(bytes) => bytes.to_vec(),
        };
        *self.state.last_model.lock() = bytes;
        *self.state.last_spec.lock() = Some(spec.clone());
        self.state.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }))
    }
}

struct FakeSession {
    state: Arc<FakeState>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

fn sum(tensors: impl IntoIterator<Item = Tensor>) -> f32 {
    tensors
        .into_iter()
        .map(|t| match t.data() {
            TensorData::F32(v) => v.iter().sum::<f32>(),
            _ => 0.0,
        })
        .sum()
}

fn scalar(value: f32) -> Tensor {
    Tensor::from_f32(vec![1], vec![value]).unwrap()
}

/// Buffer type "living" on the fake device
struct FakeBuffer(Tensor);

impl EngineSession for FakeSession {
    fn input_names(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn run(&mut self, inputs: Vec<NamedTensor>, outputs: &[String]) -> EngineResult<Vec<NamedTensor>> {
        self.state.before_run()?;
        self.state.host_runs.fetch_add(1, Ordering::SeqCst);
        *self.state.last_outputs.lock() = outputs.to_vec();

        let total = sum(inputs.into_iter().map(|n| n.tensor));
        Ok(outputs.iter().map(|name| NamedTensor::new(name.clone(), scalar(total))).collect())
    }

    fn run_binding(&mut self, binding: IoBinding) -> EngineResult<Vec<(String, DeviceTensor)>> {
        self.state.before_run()?;
        self.state.binding_runs.fetch_add(1, Ordering::SeqCst);

        let (inputs, outputs, location) = binding.into_parts();
        *self.state.last_outputs.lock() = outputs.clone();

        let mut host = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            if tensor.location().is_host() {
                return Err(EngineError::Transfer(format!("input {name} is in host memory")));
            }
            let FakeBuffer(t) = tensor
                .into_buffer::<FakeBuffer>()
                .map_err(|_| EngineError::Transfer(format!("foreign buffer for {name}")))?;
            host.push(t);
        }
        let total = sum(host);

        Ok(outputs
            .into_iter()
            .map(|name| {
                let t = scalar(total);
                let device = DeviceTensor::new(t.shape().to_vec(), t.element_type(), location.clone(), FakeBuffer(t));
                (name, device)
            })
            .collect())
    }

    fn device_allocator(&self, backend: &ResolvedBackend) -> EngineResult<Box<dyn DeviceAllocator>> {
        let device = backend.device.clone().unwrap_or_else(|| "fake".to_string());
        Ok(Box::new(FakeAllocator {
            state: Arc::clone(&self.state),
            location: MemoryLocation::device(device, 0),
        }))
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.state.sessions_dropped.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.state.drop_hook.lock().as_ref() {
            hook();
        }
    }
}

struct FakeAllocator {
    state: Arc<FakeState>,
    location: MemoryLocation,
}

impl DeviceAllocator for FakeAllocator {
    fn location(&self) -> &MemoryLocation {
        &self.location
    }

    fn upload(&self, tensor: &Tensor) -> EngineResult<DeviceTensor> {
        self.state.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceTensor::new(
            tensor.shape().to_vec(),
            tensor.element_type(),
            self.location.clone(),
            FakeBuffer(tensor.clone()),
        ))
    }

    fn download(&self, tensor: DeviceTensor) -> EngineResult<Tensor> {
        self.state.downloads.fetch_add(1, Ordering::SeqCst);
        tensor
            .into_buffer::<FakeBuffer>()
            .map(|FakeBuffer(t)| t)
            .map_err(|_| EngineError::Transfer("foreign buffer".to_string()))
    }
}

impl Drop for FakeAllocator {
    fn drop(&mut self) {
        self.state.allocators_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Write a small model file and return its config
pub fn model_file(dir: &Path, name: &str) -> ModelConfig {
    let path: PathBuf = dir.join(name);
    std::fs::write(&path, b"fake-onnx-graph").unwrap();
    ModelConfig::new(path)
}

/// Single-element f32 input
pub fn input(value: f32) -> Tensor {
    scalar(value)
}

/// Value of a single-element f32 output
pub fn value(output: &NamedTensor) -> f32 {
    output.tensor.as_f32().unwrap()[0]
}
