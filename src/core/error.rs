// This module defines the error taxonomy for kernel-reflect using the thiserror crate.
// ReflectError is the single error type returned by every stage extractor, the machine-code
// backend adapter, the hook session controller and the introspection front-ends. Validation
// failures (no matching method, ambiguous dispatch, value-returning kernels, machine code for
// non-kernels) are grouped in ValidationError and always surface before the pipeline runs.
// Toolchain failures distinguish a tool that cannot be resolved from a tool that ran and
// exited non-zero. Session failures cover nesting and sessions that observed no kernels.
// Pipeline failures carry the stage at which the external compiler gave up.

//! Error types for kernel-reflect.

use std::fmt;
use std::process::ExitStatus;
use thiserror::Error;

/// Boxed error produced by an external collaborator (pipeline or user code).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Pipeline checkpoint at which an artifact can be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Lowered,
    Typed,
    NativeIr,
    Assembly,
    MachineCode,
}

impl Stage {
    /// All stages, in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Lowered,
        Stage::Typed,
        Stage::NativeIr,
        Stage::Assembly,
        Stage::MachineCode,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Lowered => "lowered",
            Stage::Typed => "typed",
            Stage::NativeIr => "llvm",
            Stage::Assembly => "ptx",
            Stage::MachineCode => "sass",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// External toolchain binaries used for machine-code extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// Assembles PTX into a cubin (`ptxas`).
    Assembler,
    /// Disassembles a cubin into SASS text (`nvdisasm`).
    Disassembler,
}

impl Tool {
    pub fn binary_name(self) -> &'static str {
        match self {
            Tool::Assembler => "ptxas",
            Tool::Disassembler => "nvdisasm",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// A (function, signature) pair that is not a legal compile target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no method of {function} matches the argument types ({signature})")]
    NoMatchingMethod { function: String, signature: String },

    #[error("{count} methods of {function} match the argument types ({signature}); the call is ambiguous")]
    AmbiguousMethod {
        function: String,
        signature: String,
        count: usize,
    },

    #[error("kernel {function}({signature}) returns a value of type {return_type}; kernels must not return a value")]
    KernelReturnsValue {
        function: String,
        signature: String,
        return_type: String,
    },

    #[error("can only generate machine code for kernel functions")]
    NotAKernel,
}

/// Main error type for introspection.
#[derive(Error, Debug)]
pub enum ReflectError {
    #[error("invalid compile target: {0}")]
    Validation(#[from] ValidationError),

    #[error("{tool} is not available; machine code extraction requires both ptxas and nvdisasm")]
    ToolchainUnavailable { tool: Tool },

    #[error("{tool} failed ({status}): {stderr}")]
    ToolchainExecution {
        tool: Tool,
        status: ExitStatus,
        stderr: String,
    },

    #[error("failed to run {tool}: {source}")]
    ToolchainSpawn {
        tool: Tool,
        #[source]
        source: std::io::Error,
    },

    #[error("could not create scratch file for machine code translation: {0}")]
    ScratchFile(#[source] std::io::Error),

    #[error("chaining multiple introspection sessions is unsupported")]
    SessionConflict,

    #[error("no kernels executed while evaluating the given expression")]
    EmptyResult,

    #[error("introspection callback failed; the error is reported when the session ends")]
    CallbackFailed,

    #[error("the pipeline does not support any target capability")]
    NoCapabilities,

    #[error("pipeline failed at the {stage} stage: {source}")]
    Pipeline {
        stage: Stage,
        #[source]
        source: BoxError,
    },

    #[error("evaluated expression failed: {0}")]
    Evaluation(#[source] BoxError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

impl ReflectError {
    /// Wrap a pipeline error, tagging it with the stage that failed.
    pub fn pipeline<E>(stage: Stage, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        ReflectError::Pipeline {
            stage,
            source: source.into(),
        }
    }
}

/// Result type alias for introspection operations.
pub type ReflectResult<T> = Result<T, ReflectError>;
