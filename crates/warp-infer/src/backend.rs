//! Execution backend resolution
//!
//! Picks one execution provider per session from a ranked list of
//! preferences and the providers the engine reports as available, then
//! classifies it into a [`ProcessorClass`] that decides how tensors move
//! between host and device memory during a run.
//!
//! Classification goes through an injected [`BackendRegistry`] so callers
//! (and tests) can describe arbitrary backend sets.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// ONNX Runtime CPU provider name
pub const CPU_PROVIDER: &str = "CPUExecutionProvider";
/// ONNX Runtime CUDA provider name
pub const CUDA_PROVIDER: &str = "CUDAExecutionProvider";
/// ONNX Runtime TensorRT provider name
pub const TENSORRT_PROVIDER: &str = "TensorrtExecutionProvider";
/// ONNX Runtime OpenVINO provider name
pub const OPENVINO_PROVIDER: &str = "OpenVINOExecutionProvider";

/// Provider option inspected by [`ClassRule::FromDeviceType`]
pub const DEVICE_TYPE_OPTION: &str = "device_type";

/// Coarse processor category of a resolved backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorClass {
    /// Host CPU, tensors stay in host memory
    #[default]
    Cpu,
    /// Discrete or integrated GPU
    Gpu,
    /// Neural processing unit
    Npu,
}

impl ProcessorClass {
    /// Whether runs on this class use host memory directly
    #[must_use]
    pub const fn is_host(&self) -> bool {
        matches!(self, Self::Cpu)
    }
}

impl fmt::Display for ProcessorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "CPU"),
            Self::Gpu => write!(f, "GPU"),
            Self::Npu => write!(f, "NPU"),
        }
    }
}

/// One entry of a caller's ranked backend preference list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPreference {
    /// Provider name as reported by the engine
    pub name: String,

    /// Provider tuning options, `None` means engine defaults
    #[serde(default)]
    pub options: Option<BTreeMap<String, String>>,
}

impl ProviderPreference {
    /// Preference with default options
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: None,
        }
    }

    /// Add a provider option
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// How a backend maps onto a processor class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassRule {
    /// Always the given class
    Fixed(ProcessorClass),
    /// Derived from the `device_type` provider option: "GPU" wins over
    /// "NPU", anything else is CPU
    FromDeviceType,
}

#[derive(Debug, Clone)]
struct BackendEntry {
    rule: ClassRule,
    device: Option<String>,
}

/// Backend name to processor class table
///
/// Names missing from the table classify as [`ProcessorClass::Cpu`].
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    entries: HashMap<String, BackendEntry>,
}

impl BackendRegistry {
    /// Registry with no known backends
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry describing the ONNX Runtime providers
    #[must_use]
    pub fn onnx_runtime() -> Self {
        Self::empty()
            .with_backend(CPU_PROVIDER, ClassRule::Fixed(ProcessorClass::Cpu), None)
            .with_backend(
                CUDA_PROVIDER,
                ClassRule::Fixed(ProcessorClass::Gpu),
                Some("Cuda"),
            )
            .with_backend(
                TENSORRT_PROVIDER,
                ClassRule::Fixed(ProcessorClass::Gpu),
                Some("Cuda"),
            )
            .with_backend(OPENVINO_PROVIDER, ClassRule::FromDeviceType, Some("OpenVINO"))
    }

    /// Register or replace a backend
    ///
    /// `device` names the memory space device allocators are scoped to.
    #[must_use]
    pub fn with_backend(mut self, name: impl Into<String>, rule: ClassRule, device: Option<&str>) -> Self {
        self.entries.insert(
            name.into(),
            BackendEntry {
                rule,
                device: device.map(str::to_string),
            },
        );
        self
    }

    /// Whether the registry knows this backend
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Device memory label for a backend
    #[must_use]
    pub fn device_label(&self, name: &str) -> Option<&str> {
        self.entries.get(name)?.device.as_deref()
    }

    /// Classify a backend given its provider options
    #[must_use]
    pub fn classify(&self, name: &str, options: Option<&BTreeMap<String, String>>) -> ProcessorClass {
        match self.entries.get(name).map(|e| e.rule) {
            Some(ClassRule::Fixed(class)) => class,
            Some(ClassRule::FromDeviceType) => {
                let device_type = options
                    .and_then(|o| o.get(DEVICE_TYPE_OPTION))
                    .map(String::as_str)
                    .unwrap_or_default();
                if device_type.contains("GPU") {
                    ProcessorClass::Gpu
                } else if device_type.contains("NPU") {
                    ProcessorClass::Npu
                } else {
                    ProcessorClass::Cpu
                }
            }
            None => ProcessorClass::Cpu,
        }
    }

    /// Pick a backend
    ///
    /// Returns the first `requested` name present in `available`. With no
    /// match (or no preferences) the first available backend is used.
    pub fn resolve(&self, requested: &[ProviderPreference], available: &[String]) -> Result<ResolvedBackend> {
        let matched = requested
            .iter()
            .find(|pref| available.iter().any(|name| *name == pref.name));

        let (name, options, fallback) = match matched {
            Some(pref) => (pref.name.clone(), pref.options.clone(), false),
            None => {
                let first = available.first().ok_or(Error::NoBackendAvailable)?;
                if requested.is_empty() {
                    debug!(backend = %first, "No backend preference given, using engine default");
                } else {
                    warn!(
                        requested = ?requested.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
                        backend = %first,
                        "No requested backend is available, falling back to engine default"
                    );
                }
                // Fallback keeps options only if the caller happened to list it
                let options = requested
                    .iter()
                    .find(|pref| pref.name == *first)
                    .and_then(|pref| pref.options.clone());
                (first.clone(), options, true)
            }
        };

        let class = self.classify(&name, options.as_ref());
        let device = self.device_label(&name).map(str::to_string);

        debug!(backend = %name, class = %class, fallback, "Resolved execution backend");

        Ok(ResolvedBackend {
            name,
            class,
            device,
            options: options.unwrap_or_default(),
            fallback,
        })
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::onnx_runtime()
    }
}

/// Outcome of backend resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBackend {
    /// Chosen provider name
    pub name: String,

    /// Derived processor class
    pub class: ProcessorClass,

    /// Device memory label for allocators, if the backend has one
    pub device: Option<String>,

    /// Provider options to hand to the engine
    pub options: BTreeMap<String, String>,

    /// True when no preference matched and the engine default was used
    pub fallback: bool,
}

impl ResolvedBackend {
    /// Plain CPU backend with no options
    #[must_use]
    pub fn cpu() -> Self {
        Self {
            name: CPU_PROVIDER.to_string(),
            class: ProcessorClass::Cpu,
            device: None,
            options: BTreeMap::new(),
            fallback: false,
        }
    }

    /// Look up a provider option
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// Resolve a backend against an explicit registry
///
/// Free-function form of [`BackendRegistry::resolve`].
pub fn resolve(
    requested: &[ProviderPreference],
    available: &[String],
    registry: &BackendRegistry,
) -> Result<ResolvedBackend> {
    registry.resolve(requested, available)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_available_preference_wins() {
        let registry = BackendRegistry::onnx_runtime();
        let available = names(&[CPU_PROVIDER, CUDA_PROVIDER]);
        let requested = vec![
            ProviderPreference::new(OPENVINO_PROVIDER).with_option(DEVICE_TYPE_OPTION, "NPU"),
            ProviderPreference::new(CUDA_PROVIDER),
        ];

        let resolved = registry.resolve(&requested, &available).unwrap();
        assert_eq!(resolved.name, CUDA_PROVIDER);
        assert_eq!(resolved.class, ProcessorClass::Gpu);
        assert_eq!(resolved.device.as_deref(), Some("Cuda"));
        assert!(!resolved.fallback);
    }

    #[test]
    fn test_preference_order_not_availability_order() {
        let registry = BackendRegistry::onnx_runtime();
        let available = names(&[CUDA_PROVIDER, CPU_PROVIDER]);
        let requested = vec![
            ProviderPreference::new(CPU_PROVIDER),
            ProviderPreference::new(CUDA_PROVIDER),
        ];

        let resolved = registry.resolve(&requested, &available).unwrap();
        assert_eq!(resolved.name, CPU_PROVIDER);
    }

    #[test]
    fn test_fallback_to_first_available() {
        let registry = BackendRegistry::onnx_runtime();
        let available = names(&[CPU_PROVIDER]);

        let resolved = registry
            .resolve(&[ProviderPreference::new(CUDA_PROVIDER)], &available)
            .unwrap();
        assert_eq!(resolved.name, CPU_PROVIDER);
        assert_eq!(resolved.class, ProcessorClass::Cpu);
        assert!(resolved.fallback);

        let resolved = registry.resolve(&[], &available).unwrap();
        assert_eq!(resolved.name, CPU_PROVIDER);
        assert!(resolved.fallback);
    }

    #[test]
    fn test_nothing_available() {
        let registry = BackendRegistry::onnx_runtime();
        let err = registry
            .resolve(&[ProviderPreference::new(CPU_PROVIDER)], &[])
            .unwrap_err();
        assert!(matches!(err, Error::NoBackendAvailable));
    }

    #[test]
    fn test_openvino_device_type_classification() {
        let registry = BackendRegistry::onnx_runtime();
        let available = names(&[OPENVINO_PROVIDER, CPU_PROVIDER]);

        let cases = [
            (Some("GPU.0"), ProcessorClass::Gpu),
            (Some("NPU"), ProcessorClass::Npu),
            (Some("HETERO:GPU,NPU"), ProcessorClass::Gpu),
            (Some("CPU"), ProcessorClass::Cpu),
            (None, ProcessorClass::Cpu),
        ];

        for (device_type, expected) in cases {
            let mut pref = ProviderPreference::new(OPENVINO_PROVIDER);
            if let Some(device_type) = device_type {
                pref = pref.with_option(DEVICE_TYPE_OPTION, device_type);
            }
            let resolved = registry.resolve(&[pref], &available).unwrap();
            assert_eq!(resolved.class, expected, "device_type {device_type:?}");
        }
    }

    #[test]
    fn test_injected_registry() {
        let registry = BackendRegistry::empty()
            .with_backend("fake-cpu", ClassRule::Fixed(ProcessorClass::Cpu), None)
            .with_backend("fake-npu", ClassRule::Fixed(ProcessorClass::Npu), Some("npu"));
        let available = names(&["fake-cpu", "fake-npu"]);

        let resolved = resolve(&[ProviderPreference::new("fake-npu")], &available, &registry).unwrap();
        assert_eq!(resolved.class, ProcessorClass::Npu);
        assert_eq!(resolved.device.as_deref(), Some("npu"));

        // Unknown to the registry: CPU
        assert_eq!(registry.classify("mystery", None), ProcessorClass::Cpu);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let registry = BackendRegistry::onnx_runtime();
        let available = names(&[CPU_PROVIDER, CUDA_PROVIDER, OPENVINO_PROVIDER]);
        let requested = vec![
            ProviderPreference::new(TENSORRT_PROVIDER),
            ProviderPreference::new(OPENVINO_PROVIDER).with_option(DEVICE_TYPE_OPTION, "GPU"),
            ProviderPreference::new(CUDA_PROVIDER),
        ];

        let first = registry.resolve(&requested, &available).unwrap();
        for _ in 0..10 {
            assert_eq!(registry.resolve(&requested, &available).unwrap(), first);
        }
        assert_eq!(first.name, OPENVINO_PROVIDER);
        assert_eq!(first.option(DEVICE_TYPE_OPTION), Some("GPU"));
    }
}
