//! Session tuning options
//!
//! Model configs carry a loosely typed option map. Only a handful of keys
//! mean anything to the engine; everything else, and every value of the
//! wrong type or range, is skipped with a warning so a bad config never
//! stops a model from loading.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Execution mode key (`bool`)
pub const PARALLEL: &str = "parallel";
/// Inter-op thread count key (`int > 0`)
pub const INTER_OPS_THREADS: &str = "inter_ops_threads";
/// Intra-op thread count key (`int > 0`)
pub const INTRA_OPS_THREADS: &str = "intra_ops_threads";
/// Graph optimization level key (`int in 0..=3`)
pub const GRAPH_OPTIMIZATION_LEVEL: &str = "graph_optimization_level";

/// Untyped option value as parsed from a config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// String
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Option map attached to a model config
pub type TuningOptions = BTreeMap<String, OptionValue>;

/// Graph optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphOptimization {
    /// No graph rewrites
    Disabled,
    /// Basic, provider-independent rewrites
    Basic,
    /// Basic plus extended fusions
    Extended,
    /// Everything, including layout optimizations
    #[default]
    All,
}

impl GraphOptimization {
    /// Map the numeric config level (0..=3)
    #[must_use]
    pub const fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Self::Disabled),
            1 => Some(Self::Basic),
            2 => Some(Self::Extended),
            3 => Some(Self::All),
            _ => None,
        }
    }

    /// Numeric level
    #[must_use]
    pub const fn level(&self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Basic => 1,
            Self::Extended => 2,
            Self::All => 3,
        }
    }
}

/// Typed engine session options
///
/// `None` fields leave the engine default in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTuning {
    /// Parallel (true) or sequential (false) graph execution
    pub parallel: Option<bool>,

    /// Threads used to run independent graph nodes
    pub inter_op_threads: Option<usize>,

    /// Threads used inside a single node
    pub intra_op_threads: Option<usize>,

    /// Graph optimization level
    pub optimization: Option<GraphOptimization>,
}

impl SessionTuning {
    /// Parse an option map, skipping anything invalid
    pub fn from_options(options: &TuningOptions) -> Self {
        let mut tuning = Self::default();

        for (key, value) in options {
            match key.as_str() {
                PARALLEL => match value {
                    OptionValue::Bool(parallel) => tuning.parallel = Some(*parallel),
                    other => invalid(key, other, "expected a boolean"),
                },
                INTER_OPS_THREADS => tuning.inter_op_threads = thread_count(key, value),
                INTRA_OPS_THREADS => tuning.intra_op_threads = thread_count(key, value),
                GRAPH_OPTIMIZATION_LEVEL => match value {
                    OptionValue::Int(level) => match GraphOptimization::from_level(*level) {
                        Some(level) => tuning.optimization = Some(level),
                        None => invalid(key, value, "expected a level between 0 and 3"),
                    },
                    other => invalid(key, other, "expected an integer"),
                },
                _ => warn!(option = %key, "Unknown session option ignored"),
            }
        }

        tuning
    }

    /// Whether every field is left at the engine default
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

fn thread_count(key: &str, value: &OptionValue) -> Option<usize> {
    match value {
        OptionValue::Int(n) if *n > 0 => usize::try_from(*n).ok(),
        OptionValue::Int(_) => {
            invalid(key, value, "expected a positive thread count");
            None
        }
        other => {
            invalid(key, other, "expected an integer");
            None
        }
    }
}

fn invalid(key: &str, value: &OptionValue, reason: &str) {
    warn!(option = %key, value = %value, reason, "Invalid session option, using default");
}
