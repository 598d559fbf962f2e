// This module is the hub of kernel-reflect's shared infrastructure. It exports the
// pipeline adaptor (the CompilerPipeline trait through which every stage is requested from
// the external JIT compiler), capability resolution (active device or lowest supported
// target), compile-target validation, the hook session controller that owns the pipeline's
// single compile-hook slot, and the error taxonomy used by every other module.

//! Core kernel-reflect infrastructure.
//!
//! # Key Components
//!
//! ## Pipeline Adaptor (`adaptor`)
//! - [`CompilerPipeline`]: the compiler consumed as an opaque service
//! - [`TargetSignature`] and [`CompileEvent`] value types
//!
//! ## Capability Resolution (`capability`)
//! - Active device capability, or the lowest supported one
//!
//! ## Validation (`validate`)
//! - Unique dispatch for concrete signatures, no return value for kernels
//!
//! ## Hook Sessions (`session`)
//! - One process-wide interception of the compile hook at a time
//! - Slot cleared on every exit path

pub mod adaptor;
pub mod capability;
pub mod error;
pub mod session;
pub mod validate;

pub use adaptor::{
    compile_hook, AssemblyMetadata, CompileEvent, CompileHook, CompilerPipeline, KernelOptions,
    MethodMatch, NativeModule, PipelineEvent, PipelineTarget, TargetSignature,
};

pub use capability::{fallback_capability, resolve_capability, Capability, ParseCapabilityError};

pub use error::{BoxError, ReflectError, ReflectResult, Stage, Tool, ValidationError};

pub use session::{session_active, with_introspection, HookSession};

pub use validate::validate;
