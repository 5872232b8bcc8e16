//! Error taxonomy surfaced through `compile` and `run`.
//!
//! Every failure is returned as a structured value; the engine performs no
//! internal retries and never falls back to a different kernel variant.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The accelerator reported insufficient memory. Surfaced immediately;
    /// retrying without freeing something is assumed futile.
    #[error(
        "accelerator out of memory: requested {requested} bytes with {in_use} of {capacity} bytes in use"
    )]
    OutOfMemory {
        requested: usize,
        in_use: usize,
        capacity: usize,
    },

    /// A layer's declared input shape does not match the incoming tensor
    /// shape. `layer` is the zero-based index in the graph's layer list.
    #[error("layer {layer}: expected input shape {expected}, got {actual}")]
    ShapeMismatch {
        layer: usize,
        expected: String,
        actual: String,
    },

    /// Aggregate of shape/allocation failures during compile. A failed
    /// compile never produces a partially usable graph.
    #[error("graph compile failed: {message}")]
    GraphCompile {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// `run` was invoked without a successful prior `compile`, or with a
    /// context other than the one the graph was compiled against.
    #[error("run() called before a successful compile()")]
    NotCompiled,

    /// The accelerator runtime reported a launch or execution fault. Fatal
    /// for the current run; the compiled graph stays valid and the caller
    /// may retry.
    #[error("kernel launch failed in `{kernel}`: {message}")]
    KernelLaunch { kernel: String, message: String },
}

impl Error {
    pub(crate) fn launch(kernel: impl Into<String>, message: impl Into<String>) -> Error {
        Error::KernelLaunch {
            kernel: kernel.into(),
            message: message.into(),
        }
    }

    pub(crate) fn compile_msg(message: impl Into<String>) -> Error {
        Error::GraphCompile {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps a lower-level failure into the compile aggregate, preserving it
    /// as the error source while keeping its text in the message.
    pub(crate) fn compile_from(source: Error) -> Error {
        Error::GraphCompile {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Shape conflict reported by a layer before the graph knows the layer's
/// position. The graph attaches the layer index when surfacing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatchInfo {
    pub expected: String,
    pub actual: String,
}

impl ShapeMismatchInfo {
    pub fn new(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub(crate) fn at_layer(self, layer: usize) -> Error {
        Error::ShapeMismatch {
            layer,
            expected: self.expected,
            actual: self.actual,
        }
    }
}
