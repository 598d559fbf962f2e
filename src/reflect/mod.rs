// This module implements the stage extractors. Each one validates the (function,
// signature) pair, resolves the target capability unless the caller overrides it, drives the
// pipeline up to one stage and either returns that stage's artifact or renders it to a
// writer: lowered bodies, typed bodies (plain or warntype rendering), native IR (entry only
// or whole module, optionally kernel-promoted and optimized), PTX assembly, and SASS machine
// code obtained by round-tripping the PTX through the external toolchain.

//! Stage extractors.
//!
//! | Stage        | Returns              | Renders          |
//! |--------------|----------------------|------------------|
//! | lowered      | [`code_lowered`]     |                  |
//! | typed        | [`code_typed`]       | [`code_warntype`]|
//! | native IR    | [`native_ir`]        | [`code_llvm`]    |
//! | PTX assembly | [`assembly`]         | [`code_ptx`]     |
//! | SASS         | [`machine_code`]     | [`code_sass`]    |
//!
//! None of the stages before machine code touch the external toolchain.

pub mod options;

use std::io::Write;

use crate::core::adaptor::stage_error;
use crate::core::capability::capability_or_resolve;
use crate::core::{
    validate, Capability, CompilerPipeline, KernelOptions, NativeModule, PipelineTarget,
    ReflectResult, Stage, Tool, ValidationError,
};
use crate::toolchain::{self, Toolchain};

pub use options::{LlvmOptions, PtxOptions, ReflectOptions, SassOptions};

/// Lowered bodies of every method matching `target`.
pub fn code_lowered<P: CompilerPipeline>(
    pipeline: &P,
    target: &PipelineTarget<P>,
    options: &ReflectOptions,
) -> ReflectResult<Vec<P::Lowered>> {
    validate(pipeline, target, options.kernel)?;
    log::trace!("Lowering {}", target);
    pipeline.lower(target).map_err(stage_error::<P>(Stage::Lowered))
}

/// Type-inferred bodies of every method matching `target`.
pub fn code_typed<P: CompilerPipeline>(
    pipeline: &P,
    target: &PipelineTarget<P>,
    options: &ReflectOptions,
) -> ReflectResult<Vec<P::Typed>> {
    validate(pipeline, target, options.kernel)?;
    log::trace!("Inferring {}", target);
    pipeline.infer(target).map_err(stage_error::<P>(Stage::Typed))
}

/// Render the typed bodies of `target` with non-concrete types highlighted.
pub fn code_warntype<P: CompilerPipeline>(
    out: &mut dyn Write,
    pipeline: &P,
    target: &PipelineTarget<P>,
    options: &ReflectOptions,
) -> ReflectResult<()> {
    for typed in code_typed(pipeline, target, options)? {
        writeln!(out, "Typed body of {}", target)?;
        pipeline.render_warntype(&typed, out)?;
    }
    Ok(())
}

/// Native IR of `target`, rendered as text.
pub fn native_ir<P: CompilerPipeline>(
    pipeline: &P,
    target: &PipelineTarget<P>,
    options: &LlvmOptions,
) -> ReflectResult<String> {
    validate(pipeline, target, options.kernel)?;
    let cap = capability_or_resolve(pipeline, options.capability)?;
    let to_err = || stage_error::<P>(Stage::NativeIr);

    log::trace!("Generating native IR for {} at capability {}", target, cap);
    let (mut module, mut entry) = pipeline
        .generate_native_ir(target, cap, options.kernel)
        .map_err(to_err())?;

    if options.kernel {
        entry = pipeline
            .promote_kernel_wrapper(&mut module, entry, target, &options.kernel_options)
            .map_err(to_err())?;
    }

    if options.optimize {
        log::trace!("Optimizing module for capability {}", cap);
        pipeline.optimize(&mut module, &entry, cap).map_err(to_err())?;
    }

    Ok(if options.dump_module {
        module.render_module()
    } else {
        module.render_entry(&entry)
    })
}

/// Render the native IR of `target` to `out`.
pub fn code_llvm<P: CompilerPipeline>(
    out: &mut dyn Write,
    pipeline: &P,
    target: &PipelineTarget<P>,
    options: &LlvmOptions,
) -> ReflectResult<()> {
    let ir = native_ir(pipeline, target, options)?;
    writeln!(out, "{}", ir.trim_end())?;
    Ok(())
}

/// PTX assembly of `target`.
///
/// The assembly already contains every function the entry calls, so there is
/// no whole-module variant.
pub fn assembly<P: CompilerPipeline>(
    pipeline: &P,
    target: &PipelineTarget<P>,
    options: &PtxOptions,
) -> ReflectResult<String> {
    validate(pipeline, target, options.kernel)?;
    let cap = capability_or_resolve(pipeline, options.capability)?;
    compile_assembly(pipeline, target, cap, options.kernel, &options.kernel_options)
}

/// Compile an already validated `target` to PTX.
fn compile_assembly<P: CompilerPipeline>(
    pipeline: &P,
    target: &PipelineTarget<P>,
    cap: Capability,
    kernel: bool,
    kernel_options: &KernelOptions,
) -> ReflectResult<String> {
    log::trace!("Compiling {} to PTX for capability {}", target, cap);
    let (asm, metadata) = pipeline
        .compile_to_assembly(target, cap, kernel, kernel_options)
        .map_err(stage_error::<P>(Stage::Assembly))?;
    log::trace!("PTX entry symbol: {}", metadata.entry);
    Ok(asm)
}

/// Render the PTX assembly of `target` to `out`, verbatim.
pub fn code_ptx<P: CompilerPipeline>(
    out: &mut dyn Write,
    pipeline: &P,
    target: &PipelineTarget<P>,
    options: &PtxOptions,
) -> ReflectResult<()> {
    let asm = assembly(pipeline, target, options)?;
    out.write_all(asm.as_bytes())?;
    Ok(())
}

/// SASS machine code of kernel `target`.
///
/// Fails before compiling anything if `options.kernel` is unset or either
/// toolchain binary is missing. See [`toolchain::sass`] for how closely the
/// result matches what the driver would load.
pub fn machine_code<P: CompilerPipeline>(
    pipeline: &P,
    toolchain: &Toolchain,
    target: &PipelineTarget<P>,
    options: &SassOptions,
) -> ReflectResult<String> {
    if !options.kernel {
        return Err(ValidationError::NotAKernel.into());
    }
    validate(pipeline, target, true)?;
    for tool in [Tool::Assembler, Tool::Disassembler] {
        toolchain.require(tool)?;
    }

    let cap = capability_or_resolve(pipeline, options.capability)?;
    let asm = compile_assembly(pipeline, target, cap, true, &options.kernel_options)?;

    toolchain::assemble_and_disassemble(toolchain, &asm, cap)
}

/// Render the SASS machine code of kernel `target` to `out`.
pub fn code_sass<P: CompilerPipeline>(
    out: &mut dyn Write,
    pipeline: &P,
    toolchain: &Toolchain,
    target: &PipelineTarget<P>,
    options: &SassOptions,
) -> ReflectResult<()> {
    let sass = machine_code(pipeline, toolchain, target, options)?;
    out.write_all(sass.as_bytes())?;
    Ok(())
}
