//! Inference engine boundary
//!
//! The session cache never does tensor math itself. Everything numeric is
//! delegated to an [`InferenceEngine`]; this module defines the traits an
//! engine implements and the host/device tensor values that cross the
//! boundary.
//!
//! # Memory spaces
//!
//! Host tensors ([`Tensor`]) live in ordinary process memory. Device tensors
//! ([`DeviceTensor`]) are opaque values created by a [`DeviceAllocator`]
//! scoped to a backend; only the engine that produced one can read its
//! buffer. Runs on GPU/NPU backends move inputs to the device, bind every
//! input and output through an [`IoBinding`], and copy outputs back so
//! callers only ever see host tensors.
//!
//! # Feature Flags
//!
//! - `onnx`: ONNX Runtime adapter (`onnx::OnnxEngine`)

#[cfg(feature = "onnx")]
pub mod onnx;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::backend::ResolvedBackend;
use crate::loader::ModelSource;
use crate::options::SessionTuning;

/// Failure reported by an inference engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Backend could not be initialised on this host
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Session could not be built from the model
    #[error("Session construction failed: {0}")]
    Construction(String),

    /// Graph execution failed
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Copy between host and device memory failed
    #[error("Memory transfer failed: {0}")]
    Transfer(String),

    /// Tensor shape does not match its data
    #[error("Invalid tensor: {0}")]
    InvalidTensor(String),

    /// The engine panicked instead of returning an error
    #[error("Engine panicked: {0}")]
    Panicked(String),
}

/// Result type for engine calls
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// Unsigned byte
    U8,
    /// Boolean
    Bool,
}

impl ElementType {
    /// Size of one element in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
            Self::U8 | Self::Bool => 1,
        }
    }
}

/// Host tensor storage
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// 32-bit floats
    F32(Vec<f32>),
    /// 64-bit floats
    F64(Vec<f64>),
    /// 32-bit integers
    I32(Vec<i32>),
    /// 64-bit integers
    I64(Vec<i64>),
    /// Bytes
    U8(Vec<u8>),
    /// Booleans
    Bool(Vec<bool>),
}

impl TensorData {
    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    /// Whether there are no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type
    #[must_use]
    pub const fn element_type(&self) -> ElementType {
        match self {
            Self::F32(_) => ElementType::F32,
            Self::F64(_) => ElementType::F64,
            Self::I32(_) => ElementType::I32,
            Self::I64(_) => ElementType::I64,
            Self::U8(_) => ElementType::U8,
            Self::Bool(_) => ElementType::Bool,
        }
    }
}

/// Host-resident tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<i64>,
    data: TensorData,
}

impl Tensor {
    /// Build a tensor, checking the shape against the element count
    ///
    /// Every dimension must be non-negative and their product must equal
    /// the number of elements.
    pub fn new(shape: Vec<i64>, data: TensorData) -> EngineResult<Self> {
        let expected = element_count(&shape).ok_or_else(|| {
            EngineError::InvalidTensor(format!("shape {shape:?} has a negative or overflowing dimension"))
        })?;
        if expected != data.len() {
            return Err(EngineError::InvalidTensor(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Float tensor
    pub fn from_f32(shape: Vec<i64>, data: Vec<f32>) -> EngineResult<Self> {
        Self::new(shape, TensorData::F32(data))
    }

    /// 64-bit integer tensor
    pub fn from_i64(shape: Vec<i64>, data: Vec<i64>) -> EngineResult<Self> {
        Self::new(shape, TensorData::I64(data))
    }

    /// Tensor shape
    #[must_use]
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Tensor storage
    #[must_use]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Split into shape and storage
    #[must_use]
    pub fn into_parts(self) -> (Vec<i64>, TensorData) {
        (self.shape, self.data)
    }

    /// Element type
    #[must_use]
    pub const fn element_type(&self) -> ElementType {
        self.data.element_type()
    }

    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the payload in bytes
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.len() * self.element_type().size()
    }

    /// Float view, if this is an `F32` tensor
    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Integer view, if this is an `I64` tensor
    #[must_use]
    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }
}

fn element_count(shape: &[i64]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        let dim = usize::try_from(dim).ok()?;
        acc.checked_mul(dim)
    })
}

/// Tensor paired with its graph input or output name
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    /// Graph input/output name
    pub name: String,
    /// Host tensor
    pub tensor: Tensor,
}

impl NamedTensor {
    /// Pair a tensor with a name
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            name: name.into(),
            tensor,
        }
    }
}

/// Memory space a device tensor lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryLocation {
    /// Device label, e.g. "Cpu", "Cuda", "OpenVINO"
    pub device: String,
    /// Device ordinal
    pub device_id: i32,
}

impl MemoryLocation {
    /// Host memory
    #[must_use]
    pub fn host() -> Self {
        Self {
            device: "Cpu".to_string(),
            device_id: 0,
        }
    }

    /// Device memory for the given label and ordinal
    pub fn device(device: impl Into<String>, device_id: i32) -> Self {
        Self {
            device: device.into(),
            device_id,
        }
    }

    /// Whether this is host memory
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.device == "Cpu"
    }
}

impl fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.device_id)
    }
}

/// Device-resident tensor
///
/// Wraps an engine-specific buffer. Only the engine (or allocator) that
/// created it knows the concrete buffer type.
pub struct DeviceTensor {
    shape: Vec<i64>,
    element_type: ElementType,
    location: MemoryLocation,
    buffer: Box<dyn Any + Send>,
}

impl DeviceTensor {
    /// Wrap an engine buffer
    pub fn new<B: Any + Send>(
        shape: Vec<i64>,
        element_type: ElementType,
        location: MemoryLocation,
        buffer: B,
    ) -> Self {
        Self {
            shape,
            element_type,
            location,
            buffer: Box::new(buffer),
        }
    }

    /// Tensor shape
    #[must_use]
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Element type
    #[must_use]
    pub const fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Where the buffer lives
    #[must_use]
    pub fn location(&self) -> &MemoryLocation {
        &self.location
    }

    /// Borrow the engine buffer as `B`
    #[must_use]
    pub fn buffer<B: Any>(&self) -> Option<&B> {
        self.buffer.downcast_ref::<B>()
    }

    /// Take the engine buffer as `B`, or get the tensor back
    pub fn into_buffer<B: Any>(self) -> std::result::Result<B, Self> {
        let Self {
            shape,
            element_type,
            location,
            buffer,
        } = self;
        buffer.downcast::<B>().map(|b| *b).map_err(|buffer| Self {
            shape,
            element_type,
            location,
            buffer,
        })
    }
}

impl fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("shape", &self.shape)
            .field("element_type", &self.element_type)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Explicit input/output binding for device runs
///
/// Names every input with its device tensor and every output to collect.
/// Outputs are produced in `output_location`.
#[derive(Debug)]
pub struct IoBinding {
    inputs: Vec<(String, DeviceTensor)>,
    outputs: Vec<String>,
    output_location: MemoryLocation,
}

impl IoBinding {
    /// Empty binding producing outputs in `output_location`
    #[must_use]
    pub fn new(output_location: MemoryLocation) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_location,
        }
    }

    /// Bind a device tensor to a graph input
    pub fn bind_input(&mut self, name: impl Into<String>, tensor: DeviceTensor) {
        self.inputs.push((name.into(), tensor));
    }

    /// Request a graph output
    pub fn bind_output(&mut self, name: impl Into<String>) {
        self.outputs.push(name.into());
    }

    /// Bound inputs in bind order
    #[must_use]
    pub fn inputs(&self) -> &[(String, DeviceTensor)] {
        &self.inputs
    }

    /// Requested outputs in bind order
    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Memory space for outputs
    #[must_use]
    pub fn output_location(&self) -> &MemoryLocation {
        &self.output_location
    }

    /// Split into inputs, outputs and output location
    #[must_use]
    pub fn into_parts(self) -> (Vec<(String, DeviceTensor)>, Vec<String>, MemoryLocation) {
        (self.inputs, self.outputs, self.output_location)
    }
}

/// Options an engine needs to open a session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Backend the session must run on
    pub backend: ResolvedBackend,
    /// Session tuning
    pub tuning: SessionTuning,
}

/// Inference engine
///
/// Shared by every session of a manager; implementations keep their
/// process-wide environment here.
pub trait InferenceEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Execution providers usable on this host, in engine preference order
    fn available_backends(&self) -> Vec<String>;

    /// Build a session from a model
    fn open_session(&self, source: &ModelSource, spec: &SessionSpec) -> EngineResult<Box<dyn EngineSession>>;
}

/// One engine session
///
/// Not assumed reentrant: callers serialize access.
pub trait EngineSession: Send {
    /// Graph input names in index order
    fn input_names(&self) -> Vec<String>;

    /// Graph output names in index order
    fn output_names(&self) -> Vec<String>;

    /// Run with host tensors, collecting `outputs` in order
    fn run(&mut self, inputs: Vec<NamedTensor>, outputs: &[String]) -> EngineResult<Vec<NamedTensor>>;

    /// Run an explicit binding, returning outputs in bind order
    fn run_binding(&mut self, binding: IoBinding) -> EngineResult<Vec<(String, DeviceTensor)>>;

    /// Allocator for the backend's device memory
    fn device_allocator(&self, backend: &ResolvedBackend) -> EngineResult<Box<dyn DeviceAllocator>>;
}

/// Allocator scoped to one backend's device memory
pub trait DeviceAllocator: Send {
    /// Memory space of tensors this allocator creates
    fn location(&self) -> &MemoryLocation;

    /// Copy a host tensor into device memory
    fn upload(&self, tensor: &Tensor) -> EngineResult<DeviceTensor>;

    /// Copy a device tensor back into host memory
    fn download(&self, tensor: DeviceTensor) -> EngineResult<Tensor>;
}

/// Run an engine call, turning a panic into [`EngineError::Panicked`]
pub(crate) fn guarded<T>(call: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => Err(EngineError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_validation() {
        let tensor = Tensor::from_f32(vec![2, 3], vec![0.0; 6]).unwrap();
        assert_eq!(tensor.shape(), &[2, 3]);
        assert_eq!(tensor.len(), 6);
        assert_eq!(tensor.byte_len(), 24);
        assert_eq!(tensor.element_type(), ElementType::F32);

        let err = Tensor::from_f32(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTensor(_)));

        let err = Tensor::from_i64(vec![-1, 3], vec![0; 3]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTensor(_)));

        // Scalars have an empty shape and one element
        let scalar = Tensor::from_i64(vec![], vec![7]).unwrap();
        assert_eq!(scalar.as_i64(), Some(&[7][..]));
    }

    #[test]
    fn test_device_tensor_buffer() {
        let tensor = DeviceTensor::new(
            vec![4],
            ElementType::U8,
            MemoryLocation::device("Cuda", 0),
            vec![1u8, 2, 3, 4],
        );
        assert_eq!(tensor.buffer::<Vec<u8>>().map(Vec::len), Some(4));
        assert!(tensor.buffer::<String>().is_none());
        assert_eq!(tensor.location().to_string(), "Cuda:0");

        let tensor = tensor.into_buffer::<String>().unwrap_err();
        let buffer = tensor.into_buffer::<Vec<u8>>().unwrap();
        assert_eq!(buffer, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_binding_keeps_order() {
        let mut binding = IoBinding::new(MemoryLocation::device("Cuda", 0));
        for name in ["b", "a"] {
            binding.bind_input(
                name,
                DeviceTensor::new(vec![1], ElementType::F32, MemoryLocation::device("Cuda", 0), 0f32),
            );
        }
        binding.bind_output("y");

        let names: Vec<_> = binding.inputs().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(binding.outputs(), ["y"]);
        assert!(!binding.output_location().is_host());
    }

    #[test]
    fn test_guarded_catches_panics() {
        let result: EngineResult<()> = guarded(|| panic!("kernel exploded"));
        match result {
            Err(EngineError::Panicked(msg)) => assert_eq!(msg, "kernel exploded"),
            other => panic!("unexpected {other:?}"),
        }

        let result = guarded(|| Ok(5));
        assert_eq!(result.unwrap(), 5);
    }
}
