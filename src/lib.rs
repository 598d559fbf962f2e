//! kernel-reflect - compilation introspection for JIT-compiled GPU kernels.
//!
//! kernel-reflect drives a kernel compiler's pipeline up to a chosen stage
//! and hands back the artifact: lowered code, type-inferred code, native LLVM
//! IR, PTX assembly, or SASS machine code produced by round-tripping the PTX
//! through `ptxas` and `nvdisasm`. It can also intercept every kernel the
//! compiler builds while some code runs.
//!
//! # Primary Usage
//!
//! ```ignore
//! use kernel_reflect::introspect::device_code_ptx;
//! use kernel_reflect::reflect::{code_ptx, PtxOptions};
//!
//! // One target, one stage
//! code_ptx(&mut std::io::stdout(), &pipeline, &target, &PtxOptions::default())?;
//!
//! // Every kernel compiled while the body runs
//! device_code_ptx(std::io::stdout(), &pipeline, &PtxOptions::default(), || {
//!     pipeline.launch(&add, &args)
//! })?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Pipeline adaptor, capabilities, validation, hook sessions
//! - [`reflect`] - Stage extractors
//! - [`toolchain`] - `ptxas`/`nvdisasm` discovery and invocation
//! - [`introspect`] - Session-scoped front-ends
//! - [`test_pipeline`] - Deterministic in-memory pipeline
//! - `llvm` - inkwell integration (feature `llvm`)

pub mod core;
pub mod introspect;
pub mod reflect;
pub mod test_pipeline;
pub mod toolchain;

#[cfg(feature = "llvm")]
pub mod llvm;

pub use self::core::{
    // Pipeline adaptor
    CompileEvent, CompileHook, CompilerPipeline, NativeModule, TargetSignature,
    // Capabilities
    resolve_capability, Capability,
    // Sessions
    session_active, with_introspection, HookSession,
    // Errors
    ReflectError, ReflectResult, Stage, ValidationError,
};
pub use toolchain::Toolchain;
