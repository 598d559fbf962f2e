// This module implements the introspection front-ends. Each front-end builds a callback for
// the hook session controller and evaluates a caller-supplied body with that callback live,
// so every kernel the pipeline compiles while the body runs is adapted to one stage
// extractor. The lowered and typed front-ends accumulate artifacts and return them; the
// warntype, LLVM, PTX and SASS front-ends render each artifact to a caller-specified writer
// as it is observed. All front-ends except LLVM and SASS substitute the user's original
// function for the invocation wrapper the pipeline generates around kernels.

//! Introspection front-ends.
//!
//! ```ignore
//! use kernel_reflect::introspect::device_code_ptx;
//!
//! device_code_ptx(std::io::stdout(), &pipeline, &PtxOptions::default(), || {
//!     pipeline.launch(&add, &[IntRef, Int, Int])
//! })?;
//! ```
//!
//! Options passed to a front-end are forwarded to the extractor for every
//! observed kernel. A capability set in the options overrides the one the
//! kernel was compiled for; the kernel flag always comes from the observed
//! compilation.

pub mod dump;

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::{
    compile_hook, with_introspection, BoxError, Capability, CompileEvent, CompilerPipeline,
    PipelineEvent, PipelineTarget, ReflectResult, ValidationError,
};
use crate::reflect::{self, LlvmOptions, PtxOptions, ReflectOptions, SassOptions};
use crate::toolchain::Toolchain;

pub use dump::device_code_dump;

/// One-line description of an observed kernel.
fn event_header<P: CompilerPipeline>(
    target: &PipelineTarget<P>,
    capability: Capability,
) -> String {
    format!("{} for {}", target, capability.target_id())
}

fn event_capability<F, T>(
    requested: Option<Capability>,
    event: &CompileEvent<F, T>,
) -> Option<Capability> {
    Some(requested.unwrap_or(event.capability))
}

fn reflect_options<F, T>(options: &ReflectOptions, event: &CompileEvent<F, T>) -> ReflectOptions {
    ReflectOptions {
        capability: event_capability(options.capability, event),
        kernel: event.kernel,
    }
}

fn take_all<T>(results: &Mutex<Vec<T>>) -> Vec<T> {
    std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Evaluate `body`, returning the lowered bodies of every kernel it compiled.
pub fn device_code_lowered<P, R, E>(
    pipeline: &P,
    options: &ReflectOptions,
    body: impl FnOnce() -> Result<R, E>,
) -> ReflectResult<Vec<P::Lowered>>
where
    P: CompilerPipeline,
    E: Into<BoxError>,
{
    let results: Arc<Mutex<Vec<P::Lowered>>> = Arc::default();
    let sink = Arc::clone(&results);
    let options = options.clone();

    let callback = compile_hook(move |pipeline: &P, event: &PipelineEvent<P>| {
        let target = event.unwrapped_target();
        let lowered = reflect::code_lowered(pipeline, &target, &reflect_options(&options, event))?;
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(lowered);
        Ok(())
    });

    with_introspection(pipeline, callback, body)?;
    Ok(take_all(&results))
}

/// Evaluate `body`, returning the typed bodies of every kernel it compiled.
pub fn device_code_typed<P, R, E>(
    pipeline: &P,
    options: &ReflectOptions,
    body: impl FnOnce() -> Result<R, E>,
) -> ReflectResult<Vec<P::Typed>>
where
    P: CompilerPipeline,
    E: Into<BoxError>,
{
    let results: Arc<Mutex<Vec<P::Typed>>> = Arc::default();
    let sink = Arc::clone(&results);
    let options = options.clone();

    let callback = compile_hook(move |pipeline: &P, event: &PipelineEvent<P>| {
        let target = event.unwrapped_target();
        let typed = reflect::code_typed(pipeline, &target, &reflect_options(&options, event))?;
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(typed);
        Ok(())
    });

    with_introspection(pipeline, callback, body)?;
    Ok(take_all(&results))
}

/// Evaluate `body`, rendering the warntype form of every kernel it compiled
/// to `out`.
pub fn device_code_warntype<P, W, R, E>(
    out: W,
    pipeline: &P,
    options: &ReflectOptions,
    body: impl FnOnce() -> Result<R, E>,
) -> ReflectResult<()>
where
    P: CompilerPipeline,
    W: Write + Send + 'static,
    E: Into<BoxError>,
{
    let out = Mutex::new(out);
    let options = options.clone();

    let callback = compile_hook(move |pipeline: &P, event: &PipelineEvent<P>| {
        let target = event.unwrapped_target();
        let mut out = out.lock().unwrap_or_else(PoisonError::into_inner);
        reflect::code_warntype(&mut *out, pipeline, &target, &reflect_options(&options, event))?;
        out.flush()?;
        Ok(())
    });

    with_introspection(pipeline, callback, body)?;
    Ok(())
}

/// Evaluate `body`, rendering the native IR of every kernel it compiled to
/// `out`.
///
/// The IR is that of the generated wrapper: at this stage the user's function
/// is inlined into it.
pub fn device_code_llvm<P, W, R, E>(
    out: W,
    pipeline: &P,
    options: &LlvmOptions,
    body: impl FnOnce() -> Result<R, E>,
) -> ReflectResult<()>
where
    P: CompilerPipeline,
    W: Write + Send + 'static,
    E: Into<BoxError>,
{
    let out = Mutex::new(out);
    let options = options.clone();

    let callback = compile_hook(move |pipeline: &P, event: &PipelineEvent<P>| {
        let options = LlvmOptions {
            capability: event_capability(options.capability, event),
            kernel: event.kernel,
            ..options.clone()
        };
        let ir = reflect::native_ir(pipeline, &event.target, &options)?;

        let mut out = out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "; {}", event_header::<P>(&event.target, event.capability))?;
        writeln!(out, "{}", ir.trim_end())?;
        writeln!(out)?;
        out.flush()?;
        Ok(())
    });

    with_introspection(pipeline, callback, body)?;
    Ok(())
}

/// Evaluate `body`, rendering the PTX assembly of every kernel it compiled
/// to `out`.
pub fn device_code_ptx<P, W, R, E>(
    out: W,
    pipeline: &P,
    options: &PtxOptions,
    body: impl FnOnce() -> Result<R, E>,
) -> ReflectResult<()>
where
    P: CompilerPipeline,
    W: Write + Send + 'static,
    E: Into<BoxError>,
{
    let out = Mutex::new(out);
    let options = options.clone();

    let callback = compile_hook(move |pipeline: &P, event: &PipelineEvent<P>| {
        let options = PtxOptions {
            capability: event_capability(options.capability, event),
            kernel: event.kernel,
            kernel_options: options.kernel_options.clone(),
        };
        let target = event.unwrapped_target();
        let asm = reflect::assembly(pipeline, &target, &options)?;

        let mut out = out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "// {}", event_header::<P>(&target, event.capability))?;
        writeln!(out)?;
        out.write_all(asm.as_bytes())?;
        writeln!(out)?;
        out.flush()?;
        Ok(())
    });

    with_introspection(pipeline, callback, body)?;
    Ok(())
}

/// Evaluate `body`, rendering the SASS machine code of every kernel it
/// compiled to `out`.
///
/// Every observed compilation must be a kernel.
pub fn device_code_sass<P, W, R, E>(
    out: W,
    pipeline: &P,
    toolchain: &Toolchain,
    options: &SassOptions,
    body: impl FnOnce() -> Result<R, E>,
) -> ReflectResult<()>
where
    P: CompilerPipeline,
    W: Write + Send + 'static,
    E: Into<BoxError>,
{
    let out = Mutex::new(out);
    let options = options.clone();
    let toolchain = toolchain.clone();

    let callback = compile_hook(move |pipeline: &P, event: &PipelineEvent<P>| {
        if !event.kernel {
            return Err(ValidationError::NotAKernel.into());
        }
        let options = SassOptions {
            capability: event_capability(options.capability, event),
            kernel: true,
            kernel_options: options.kernel_options.clone(),
        };
        let sass = reflect::machine_code(pipeline, &toolchain, &event.target, &options)?;

        let mut out = out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "// {}", event_header::<P>(&event.target, event.capability))?;
        writeln!(out)?;
        out.write_all(sass.as_bytes())?;
        writeln!(out)?;
        out.flush()?;
        Ok(())
    });

    with_introspection(pipeline, callback, body)?;
    Ok(())
}
