// This module defines CompilerPipeline, the bridge between kernel-reflect and the JIT
// GPU compiler whose stages are being inspected. The pipeline is an opaque service: it
// resolves method signatures, lowers and infers host functions, generates a native-IR module
// with a designated entry, promotes kernel entries to invocation wrappers, optimizes modules,
// emits PTX assembly, and exposes a single compile-hook slot plus a compilation cache.
// TargetSignature pairs a function reference with an ordered argument-type tuple, and
// CompileEvent is what the pipeline reports through the hook each time it compiles a kernel.
// NativeModule abstracts over the module representation so that either the whole module or
// only its entry artifact can be rendered.

//! Pipeline adaptor.
//!
//! The adaptor is the glue between kernel-reflect and the compiler that
//! actually produces GPU code. Nothing in this crate compiles anything by
//! itself; every stage is requested from a [`CompilerPipeline`].
//!
//! The contract assumes:
//! - Functions and argument types are cheap, comparable handles.
//! - Method lookup is deterministic for a given signature.
//! - The pipeline calls the installed [`CompileHook`] once per kernel it
//!   compiles, and never re-enters the hook for compilations requested from
//!   inside the hook itself.
//! - Clearing the compilation cache forces every later kernel launch to go
//!   through the pipeline again.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use super::capability::Capability;
use super::error::{ReflectError, Stage};

/// A function together with the argument types it is compiled for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetSignature<F, T> {
    function: F,
    arg_types: Vec<T>,
}

impl<F, T> TargetSignature<F, T> {
    pub fn new(function: F, arg_types: impl IntoIterator<Item = T>) -> Self {
        Self {
            function,
            arg_types: arg_types.into_iter().collect(),
        }
    }

    pub fn function(&self) -> &F {
        &self.function
    }

    pub fn arg_types(&self) -> &[T] {
        &self.arg_types
    }

    /// Same argument types, different function.
    pub fn with_function(&self, function: F) -> Self
    where
        T: Clone,
    {
        Self {
            function,
            arg_types: self.arg_types.clone(),
        }
    }
}

impl<F: fmt::Display, T: fmt::Display> TargetSignature<F, T> {
    /// The argument types rendered as a comma separated list.
    pub fn types_string(&self) -> String {
        self.arg_types
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl<F: fmt::Display, T: fmt::Display> fmt::Display for TargetSignature<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.function, self.types_string())
    }
}

/// One method applicable to a signature, as reported by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodMatch<T> {
    /// Declared parameter types of the method.
    pub params: Vec<T>,
    /// Inferred return type, `None` when the method returns no value.
    pub return_type: Option<T>,
}

/// Metadata returned alongside assembly text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyMetadata {
    /// Name of the entry symbol inside the assembly.
    pub entry: String,
}

/// Options forwarded unchanged to kernel-wrapper promotion and assembly
/// emission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelOptions {
    pub max_threads: Option<u32>,
    pub min_threads: Option<u32>,
    pub blocks_per_sm: Option<u32>,
    pub max_registers: Option<u32>,
}

/// A kernel compilation observed through the compile hook.
#[derive(Debug, Clone)]
pub struct CompileEvent<F, T> {
    /// What was compiled. For kernels this is the generated wrapper.
    pub target: TargetSignature<F, T>,
    /// The user's original function when `target` is a generated wrapper.
    pub inner: Option<F>,
    /// Capability the kernel was compiled for.
    pub capability: Capability,
    /// Whether the compiled function is a kernel entry point.
    pub kernel: bool,
}

impl<F: Clone, T: Clone> CompileEvent<F, T> {
    /// Target with the wrapper replaced by the user's original function.
    pub fn unwrapped_target(&self) -> TargetSignature<F, T> {
        match &self.inner {
            Some(inner) => self.target.with_function(inner.clone()),
            None => self.target.clone(),
        }
    }
}

/// Signature type of pipeline `P`.
pub type PipelineTarget<P> =
    TargetSignature<<P as CompilerPipeline>::Function, <P as CompilerPipeline>::Type>;

/// Compile event type of pipeline `P`.
pub type PipelineEvent<P> =
    CompileEvent<<P as CompilerPipeline>::Function, <P as CompilerPipeline>::Type>;

/// Interception function stored in the pipeline's compile-hook slot.
pub type CompileHook<P> =
    Arc<dyn Fn(&P, &PipelineEvent<P>) -> Result<(), ReflectError> + Send + Sync>;

/// Wrap `hook` for installation in the compile-hook slot.
pub fn compile_hook<P, F>(hook: F) -> CompileHook<P>
where
    P: CompilerPipeline,
    F: Fn(&P, &PipelineEvent<P>) -> Result<(), ReflectError> + Send + Sync + 'static,
{
    Arc::new(hook)
}

/// A native-IR module with a designated entry artifact.
pub trait NativeModule {
    type Entry;

    /// Textual form of a single entry artifact.
    fn render_entry(&self, entry: &Self::Entry) -> String;

    /// Textual form of every artifact in the module: definitions,
    /// declarations and metadata.
    fn render_module(&self) -> String;
}

/// The JIT compiler pipeline, consumed as an opaque service.
pub trait CompilerPipeline: Sized + 'static {
    type Function: Clone + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type Type: Clone + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type Lowered: fmt::Debug + fmt::Display + Send + 'static;
    type Typed: fmt::Debug + fmt::Display + Send + 'static;
    type Module: NativeModule;
    type Error: Into<Box<dyn std::error::Error + Send + Sync + 'static>>;

    /// Capability of the active device, `None` when the runtime is not
    /// initialized or no device context is current.
    fn active_device_capability(&self) -> Option<Capability>;

    /// Every capability the pipeline can generate code for.
    fn supported_capabilities(&self) -> &[Capability];

    /// Methods applicable to the signature.
    fn lookup_methods(
        &self,
        target: &TargetSignature<Self::Function, Self::Type>,
    ) -> Vec<MethodMatch<Self::Type>>;

    /// Whether `ty` is a concrete (leaf) type.
    fn is_concrete(&self, ty: &Self::Type) -> bool;

    fn lower(
        &self,
        target: &TargetSignature<Self::Function, Self::Type>,
    ) -> Result<Vec<Self::Lowered>, Self::Error>;

    fn infer(
        &self,
        target: &TargetSignature<Self::Function, Self::Type>,
    ) -> Result<Vec<Self::Typed>, Self::Error>;

    /// Render a typed body highlighting non-concrete types.
    fn render_warntype(&self, typed: &Self::Typed, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "{}", typed)
    }

    fn generate_native_ir(
        &self,
        target: &TargetSignature<Self::Function, Self::Type>,
        capability: Capability,
        kernel: bool,
    ) -> Result<(Self::Module, <Self::Module as NativeModule>::Entry), Self::Error>;

    /// Wrap a kernel entry so it can be invoked uniformly; returns the
    /// wrapper's entry artifact.
    fn promote_kernel_wrapper(
        &self,
        module: &mut Self::Module,
        entry: <Self::Module as NativeModule>::Entry,
        target: &TargetSignature<Self::Function, Self::Type>,
        options: &KernelOptions,
    ) -> Result<<Self::Module as NativeModule>::Entry, Self::Error>;

    /// Run the optimization passes over `module` in place.
    fn optimize(
        &self,
        module: &mut Self::Module,
        entry: &<Self::Module as NativeModule>::Entry,
        capability: Capability,
    ) -> Result<(), Self::Error>;

    fn compile_to_assembly(
        &self,
        target: &TargetSignature<Self::Function, Self::Type>,
        capability: Capability,
        kernel: bool,
        options: &KernelOptions,
    ) -> Result<(String, AssemblyMetadata), Self::Error>;

    /// Replace the contents of the compile-hook slot.
    ///
    /// While a hook is installed, every kernel invocation must reach it, even
    /// one the pipeline would otherwise serve from its cache.
    fn install_compile_hook(&self, hook: Option<CompileHook<Self>>);

    /// Drop every cached kernel so later launches recompile.
    fn clear_compile_cache(&self);
}

/// Map a pipeline error into [`ReflectError`] for the given stage.
pub(crate) fn stage_error<P: CompilerPipeline>(stage: Stage) -> impl FnOnce(P::Error) -> ReflectError {
    move |err| ReflectError::pipeline(stage, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_display() {
        let sig = TargetSignature::new("add", ["IntRef", "Int", "Int"]);
        assert_eq!(sig.to_string(), "add(IntRef, Int, Int)");
        assert_eq!(sig.types_string(), "IntRef, Int, Int");
    }

    #[test]
    fn test_unwrapped_target() {
        let event = CompileEvent {
            target: TargetSignature::new("add#kernel", ["Int"]),
            inner: Some("add"),
            capability: Capability::new(7, 0),
            kernel: true,
        };
        assert_eq!(event.unwrapped_target(), TargetSignature::new("add", ["Int"]));

        let plain = CompileEvent {
            inner: None,
            ..event.clone()
        };
        assert_eq!(plain.unwrapped_target(), event.target);
    }
}
