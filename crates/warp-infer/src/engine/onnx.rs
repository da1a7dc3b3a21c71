//! ONNX Runtime engine
//!
//! Implements the engine traits on top of the `ort` crate. The runtime
//! environment is initialised once per process and shared by every session.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
    OpenVINOExecutionProvider, TensorRTExecutionProvider,
};
use ort::memory::{AllocationDevice, Allocator, AllocatorType, MemoryInfo, MemoryType};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::tensor::{PrimitiveTensorElementType, TensorElementType};
use ort::value::{DynValue, Tensor as OrtTensor, ValueType};
use tracing::{debug, info, warn};

use super::{
    DeviceAllocator, DeviceTensor, ElementType, EngineError, EngineResult, EngineSession, InferenceEngine, IoBinding,
    MemoryLocation, NamedTensor, SessionSpec, Tensor, TensorData,
};
use crate::backend::{
    ResolvedBackend, CPU_PROVIDER, CUDA_PROVIDER, DEVICE_TYPE_OPTION, OPENVINO_PROVIDER, TENSORRT_PROVIDER,
};
use crate::loader::ModelSource;
use crate::options::{GraphOptimization, SessionTuning};

/// Global ONNX Runtime environment
static ORT_ENVIRONMENT: Lazy<Result<(), String>> = Lazy::new(|| match ort::init().with_name("warp-infer").commit() {
    Ok(_) => Ok(()),
    Err(e) => Err(format!("Failed to initialize ONNX Runtime: {e}")),
});

fn ensure_environment() -> EngineResult<()> {
    ORT_ENVIRONMENT
        .as_ref()
        .map(|_| ())
        .map_err(|e| EngineError::BackendUnavailable(e.clone()))
}

fn construction(e: ort::Error) -> EngineError {
    EngineError::Construction(e.to_string())
}

fn execution(e: ort::Error) -> EngineError {
    EngineError::Execution(e.to_string())
}

fn transfer(e: ort::Error) -> EngineError {
    EngineError::Transfer(e.to_string())
}

/// ONNX Runtime inference engine
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxEngine;

impl OnnxEngine {
    /// Create the engine, initialising the runtime environment if needed
    pub fn new() -> EngineResult<Self> {
        ensure_environment()?;
        Ok(Self)
    }
}

impl InferenceEngine for OnnxEngine {
    fn name(&self) -> &str {
        "onnxruntime"
    }

    fn available_backends(&self) -> Vec<String> {
        let mut available = Vec::new();
        let probes: [(&str, bool); 3] = [
            (
                TENSORRT_PROVIDER,
                TensorRTExecutionProvider::default().is_available().unwrap_or(false),
            ),
            (CUDA_PROVIDER, CUDAExecutionProvider::default().is_available().unwrap_or(false)),
            (
                OPENVINO_PROVIDER,
                OpenVINOExecutionProvider::default().is_available().unwrap_or(false),
            ),
        ];
        for (name, ok) in probes {
            if ok {
                available.push(name.to_string());
            }
        }
        // CPU is always compiled in, and last so accelerators win the fallback
        available.push(CPU_PROVIDER.to_string());
        available
    }

    fn open_session(&self, source: &ModelSource, spec: &SessionSpec) -> EngineResult<Box<dyn EngineSession>> {
        ensure_environment()?;

        let builder = Session::builder().map_err(construction)?;
        let builder = apply_tuning(builder, &spec.tuning)?;
        let builder = builder
            .with_execution_providers([execution_provider(&spec.backend)])
            .map_err(construction)?;

        let session = match source {
            ModelSource::File(path) => {
                info!(path = %path.display(), backend = %spec.backend.name, "Loading ONNX model");
                builder.commit_from_file(path).map_err(construction)?
            }
            ModelSource::Memory(bytes) => {
                info!(size = bytes.len(), backend = %spec.backend.name, "Loading ONNX model from memory");
                builder.commit_from_memory(bytes).map_err(construction)?
            }
        };

        let input_names = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();

        Ok(Box::new(OnnxSession {
            session,
            input_names,
            output_names,
        }))
    }
}

fn apply_tuning(mut builder: SessionBuilder, tuning: &SessionTuning) -> EngineResult<SessionBuilder> {
    if let Some(level) = tuning.optimization {
        let level = match level {
            GraphOptimization::Disabled => GraphOptimizationLevel::Disable,
            GraphOptimization::Basic => GraphOptimizationLevel::Level1,
            GraphOptimization::Extended => GraphOptimizationLevel::Level2,
            GraphOptimization::All => GraphOptimizationLevel::Level3,
        };
        builder = builder.with_optimization_level(level).map_err(construction)?;
    }
    if let Some(parallel) = tuning.parallel {
        builder = builder.with_parallel_execution(parallel).map_err(construction)?;
    }
    if let Some(threads) = tuning.inter_op_threads {
        builder = builder.with_inter_threads(threads).map_err(construction)?;
    }
    if let Some(threads) = tuning.intra_op_threads {
        builder = builder.with_intra_threads(threads).map_err(construction)?;
    }
    Ok(builder)
}

fn parse_option<T: std::str::FromStr>(options: &BTreeMap<String, String>, key: &str) -> Option<T> {
    let raw = options.get(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(option = %key, value = %raw, "Invalid provider option ignored");
            None
        }
    }
}

fn execution_provider(backend: &ResolvedBackend) -> ExecutionProviderDispatch {
    let options = &backend.options;
    match backend.name.as_str() {
        CUDA_PROVIDER => {
            let mut ep = CUDAExecutionProvider::default();
            if let Some(id) = parse_option::<i32>(options, "device_id") {
                ep = ep.with_device_id(id);
            }
            if let Some(limit) = parse_option::<usize>(options, "gpu_mem_limit") {
                ep = ep.with_memory_limit(limit);
            }
            ep.build()
        }
        TENSORRT_PROVIDER => {
            let mut ep = TensorRTExecutionProvider::default();
            if let Some(id) = parse_option::<i32>(options, "device_id") {
                ep = ep.with_device_id(id);
            }
            if let Some(fp16) = parse_option::<bool>(options, "trt_fp16_enable") {
                ep = ep.with_fp16(fp16);
            }
            ep.build()
        }
        OPENVINO_PROVIDER => {
            let mut ep = OpenVINOExecutionProvider::default();
            if let Some(device_type) = backend.option(DEVICE_TYPE_OPTION) {
                ep = ep.with_device_type(device_type);
            }
            if let Some(threads) = parse_option::<usize>(options, "num_of_threads") {
                ep = ep.with_num_threads(threads);
            }
            ep.build()
        }
        other => {
            if other != CPU_PROVIDER {
                warn!(backend = %other, "Unknown execution provider, using CPU");
            }
            CPUExecutionProvider::default().build()
        }
    }
}

fn device_ordinal(backend: &ResolvedBackend) -> i32 {
    backend
        .option("device_id")
        .and_then(|id| id.parse().ok())
        .unwrap_or(0)
}

fn to_value(tensor: &Tensor) -> EngineResult<DynValue> {
    let shape = tensor.shape().to_vec();
    let value = match tensor.data() {
        TensorData::F32(v) => OrtTensor::from_array((shape, v.clone())).map(OrtTensor::into_dyn),
        TensorData::F64(v) => OrtTensor::from_array((shape, v.clone())).map(OrtTensor::into_dyn),
        TensorData::I32(v) => OrtTensor::from_array((shape, v.clone())).map(OrtTensor::into_dyn),
        TensorData::I64(v) => OrtTensor::from_array((shape, v.clone())).map(OrtTensor::into_dyn),
        TensorData::U8(v) => OrtTensor::from_array((shape, v.clone())).map(OrtTensor::into_dyn),
        TensorData::Bool(v) => OrtTensor::from_array((shape, v.clone())).map(OrtTensor::into_dyn),
    };
    value.map_err(transfer)
}

fn from_value(value: &DynValue) -> EngineResult<Tensor> {
    macro_rules! extract {
        ($ty:ty, $variant:ident) => {
            if let Ok((shape, data)) = value.try_extract_raw_tensor::<$ty>() {
                return Tensor::new(shape, TensorData::$variant(data.to_vec()));
            }
        };
    }
    extract!(f32, F32);
    extract!(f64, F64);
    extract!(i64, I64);
    extract!(i32, I32);
    extract!(u8, U8);
    extract!(bool, Bool);
    Err(EngineError::Transfer("unsupported output element type".to_string()))
}

struct OnnxSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl EngineSession for OnnxSession {
    fn input_names(&self) -> Vec<String> {
        self.input_names.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.output_names.clone()
    }

    fn run(&mut self, inputs: Vec<NamedTensor>, outputs: &[String]) -> EngineResult<Vec<NamedTensor>> {
        let mut values: Vec<(String, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
        for input in &inputs {
            values.push((input.name.clone(), to_value(&input.tensor)?.into()));
        }

        let mut results = self.session.run(values).map_err(execution)?;

        outputs
            .iter()
            .map(|name| -> EngineResult<NamedTensor> {
                let value = results
                    .remove(name.as_str())
                    .ok_or_else(|| EngineError::Execution(format!("missing output {name}")))?;
                Ok(NamedTensor::new(name.clone(), from_value(&value)?))
            })
            .collect()
    }

    fn run_binding(&mut self, binding: IoBinding) -> EngineResult<Vec<(String, DeviceTensor)>> {
        let (inputs, outputs, location) = binding.into_parts();
        let memory = output_memory(&location).map_err(execution)?;

        let mut bound: Vec<(String, DynValue)> = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            let value = tensor
                .into_buffer::<DynValue>()
                .map_err(|t| EngineError::Transfer(format!("input {name} on {} was not made by this engine", t.location())))?;
            bound.push((name, value));
        }

        let mut io = self.session.create_binding().map_err(execution)?;
        for (name, value) in &bound {
            io.bind_input(name.as_str(), value).map_err(execution)?;
        }
        for name in &outputs {
            io.bind_output_to_device(name.as_str(), &memory).map_err(execution)?;
        }

        let mut results = io.run().map_err(execution)?;
        debug!(outputs = outputs.len(), location = %location, "Bound run complete");

        outputs
            .into_iter()
            .map(|name| -> EngineResult<(String, DeviceTensor)> {
                let value = results
                    .remove(name.as_str())
                    .ok_or_else(|| EngineError::Execution(format!("missing output {name}")))?;
                let (shape, element_type) = tensor_info(&value)?;
                let tensor = DeviceTensor::new(shape, element_type, location.clone(), value);
                Ok((name, tensor))
            })
            .collect()
    }

    fn device_allocator(&self, backend: &ResolvedBackend) -> EngineResult<Box<dyn DeviceAllocator>> {
        if backend.device.is_none() {
            return Err(EngineError::BackendUnavailable(format!("{} has no device memory", backend.name)));
        }
        if !pins_inputs(backend) {
            debug!(backend = %backend.name, "Inputs staged in host memory");
            return Ok(Box::new(OnnxAllocator::host()));
        }

        let id = device_ordinal(backend);
        let pinned = MemoryInfo::new(AllocationDevice::CUDA_PINNED, id, AllocatorType::Device, MemoryType::CPUInput)
            .and_then(|info| Allocator::new(&self.session, info));
        match pinned {
            Ok(allocator) => Ok(Box::new(OnnxAllocator {
                location: MemoryLocation::device(CUDA_PINNED_LABEL, id),
                staging: Staging::Pinned(SessionAllocator(allocator)),
            })),
            Err(e) => {
                warn!(backend = %backend.name, error = %e, "No pinned allocator on session, staging inputs in host memory");
                Ok(Box::new(OnnxAllocator::host()))
            }
        }
    }
}

/// Shape and element type from a value's type info, without copying it
fn tensor_info(value: &DynValue) -> EngineResult<(Vec<i64>, ElementType)> {
    match value.dtype() {
        ValueType::Tensor { ty, dimensions, .. } => Ok((dimensions.clone(), element_type(*ty)?)),
        other => Err(EngineError::Transfer(format!("expected a tensor, got {other:?}"))),
    }
}

fn element_type(ty: TensorElementType) -> EngineResult<ElementType> {
    match ty {
        TensorElementType::Float32 => Ok(ElementType::F32),
        TensorElementType::Float64 => Ok(ElementType::F64),
        TensorElementType::Int32 => Ok(ElementType::I32),
        TensorElementType::Int64 => Ok(ElementType::I64),
        TensorElementType::Uint8 => Ok(ElementType::U8),
        TensorElementType::Bool => Ok(ElementType::Bool),
        other => Err(EngineError::Transfer(format!("unsupported element type {other:?}"))),
    }
}

/// Label of CUDA pinned host memory
const CUDA_PINNED_LABEL: &str = "CudaPinned";

/// Whether inputs for `backend` go through a CUDA pinned allocator
///
/// OpenVINO registers no allocator a caller can reach, so its GPU and NPU
/// inputs are staged in host memory and copied by the provider.
fn pins_inputs(backend: &ResolvedBackend) -> bool {
    matches!(backend.name.as_str(), CUDA_PROVIDER | TENSORRT_PROVIDER)
}

/// Memory outputs are bound to
///
/// CUDA outputs land in pinned host memory so they can be read back without
/// a separate copy; everything else writes to plain CPU memory.
fn output_memory(location: &MemoryLocation) -> ort::Result<MemoryInfo> {
    match location.device.as_str() {
        CUDA_PINNED_LABEL => MemoryInfo::new(
            AllocationDevice::CUDA_PINNED,
            location.device_id,
            AllocatorType::Device,
            MemoryType::CPUOutput,
        ),
        _ => MemoryInfo::new(AllocationDevice::CPU, 0, AllocatorType::Device, MemoryType::Default),
    }
}

/// Allocator obtained from a session
struct SessionAllocator(Allocator);

// SAFETY: only used behind the owning session's lock, and dropped before the
// session it was created from.
unsafe impl Send for SessionAllocator {}

enum Staging {
    /// Page-locked buffers from the session's CUDA pinned allocator
    Pinned(SessionAllocator),
    /// Ordinary host buffers
    Host,
}

/// Input staging for bound runs
///
/// The location reports where staged inputs really live: pinned memory for
/// CUDA and TensorRT, host memory otherwise.
struct OnnxAllocator {
    location: MemoryLocation,
    staging: Staging,
}

impl OnnxAllocator {
    fn host() -> Self {
        Self {
            location: MemoryLocation::host(),
            staging: Staging::Host,
        }
    }
}

fn stage_slice<T>(allocator: &Allocator, shape: &[i64], data: &[T]) -> EngineResult<DynValue>
where
    T: PrimitiveTensorElementType + Copy + std::fmt::Debug + 'static,
{
    let mut value = OrtTensor::<T>::new(allocator, shape.to_vec()).map_err(transfer)?.into_dyn();
    let (_, slot) = value.try_extract_raw_tensor_mut::<T>().map_err(transfer)?;
    if slot.len() != data.len() {
        return Err(EngineError::Transfer(format!(
            "staging buffer holds {} elements, tensor has {}",
            slot.len(),
            data.len()
        )));
    }
    slot.copy_from_slice(data);
    Ok(value)
}

fn stage(allocator: &Allocator, tensor: &Tensor) -> EngineResult<DynValue> {
    let shape = tensor.shape();
    match tensor.data() {
        TensorData::F32(v) => stage_slice(allocator, shape, v),
        TensorData::F64(v) => stage_slice(allocator, shape, v),
        TensorData::I32(v) => stage_slice(allocator, shape, v),
        TensorData::I64(v) => stage_slice(allocator, shape, v),
        TensorData::U8(v) => stage_slice(allocator, shape, v),
        TensorData::Bool(v) => stage_slice(allocator, shape, v),
    }
}

impl DeviceAllocator for OnnxAllocator {
    fn location(&self) -> &MemoryLocation {
        &self.location
    }

    fn upload(&self, tensor: &Tensor) -> EngineResult<DeviceTensor> {
        let value = match &self.staging {
            Staging::Pinned(SessionAllocator(allocator)) => stage(allocator, tensor)?,
            Staging::Host => to_value(tensor)?,
        };
        Ok(DeviceTensor::new(
            tensor.shape().to_vec(),
            tensor.element_type(),
            self.location.clone(),
            value,
        ))
    }

    fn download(&self, tensor: DeviceTensor) -> EngineResult<Tensor> {
        let value = tensor
            .into_buffer::<DynValue>()
            .map_err(|t| EngineError::Transfer(format!("tensor on {} was not made by this engine", t.location())))?;
        from_value(&value)
    }
}
