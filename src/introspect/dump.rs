//! Dump every stage of every observed kernel into a directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::{
    compile_hook, with_introspection, BoxError, CompilerPipeline, PipelineEvent, ReflectResult,
    Stage,
};
use crate::reflect::{self, LlvmOptions, PtxOptions, ReflectOptions, SassOptions};
use crate::toolchain::Toolchain;

/// File-name stem for the `n`th observed kernel.
fn file_stem(function: &str, n: usize) -> String {
    let name: String = function
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{}_{}", name, n)
}

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| format!("{}\n", item))
        .collect::<Vec<_>>()
        .join("\n")
}

fn dump_event<P: CompilerPipeline>(
    pipeline: &P,
    toolchain: &Toolchain,
    dir: &Path,
    n: usize,
    event: &PipelineEvent<P>,
) -> ReflectResult<Vec<PathBuf>> {
    let unwrapped = event.unwrapped_target();
    let stem = file_stem(&unwrapped.function().to_string(), n);
    let cap = Some(event.capability);
    let mut written = Vec::new();

    let mut write = |extension: &str, contents: String| -> ReflectResult<()> {
        let path = dir.join(format!("{}.{}", stem, extension));
        fs::write(&path, contents)?;
        log::debug!("Wrote {}", path.display());
        written.push(path);
        Ok(())
    };

    let reflect_options = ReflectOptions {
        capability: cap,
        kernel: event.kernel,
    };
    let lowered = reflect::code_lowered(pipeline, &unwrapped, &reflect_options)?;
    write(Stage::Lowered.name(), join_display(&lowered))?;
    let typed = reflect::code_typed(pipeline, &unwrapped, &reflect_options)?;
    write(Stage::Typed.name(), join_display(&typed))?;

    for (extension, optimize) in [("unopt.ll", false), ("opt.ll", true)] {
        let options = LlvmOptions {
            capability: cap,
            kernel: event.kernel,
            optimize,
            dump_module: true,
            ..LlvmOptions::default()
        };
        write(extension, reflect::native_ir(pipeline, &event.target, &options)?)?;
    }

    let ptx_options = PtxOptions {
        capability: cap,
        kernel: event.kernel,
        ..PtxOptions::default()
    };
    write(Stage::Assembly.name(), reflect::assembly(pipeline, &unwrapped, &ptx_options)?)?;

    if event.kernel && toolchain.is_complete() {
        let sass_options = SassOptions {
            capability: cap,
            ..SassOptions::default()
        };
        let sass = reflect::machine_code(pipeline, toolchain, &event.target, &sass_options)?;
        write(Stage::MachineCode.name(), sass)?;
    } else {
        log::debug!("Skipping machine code for {}", event.target);
    }

    Ok(written)
}

/// Evaluate `body`, writing every stage of every kernel it compiled into
/// `dir`.
///
/// Files are named `<function>_<n>.<stage>`, with `n` counting observed
/// kernels from 1. Machine code is only written for kernels, and only when
/// both toolchain binaries are available. Returns the written paths.
pub fn device_code_dump<P, R, E>(
    dir: impl AsRef<Path>,
    pipeline: &P,
    toolchain: &Toolchain,
    body: impl FnOnce() -> Result<R, E>,
) -> ReflectResult<Vec<PathBuf>>
where
    P: CompilerPipeline,
    E: Into<BoxError>,
{
    let dir = dir.as_ref().to_path_buf();
    fs::create_dir_all(&dir)?;

    let written: Arc<Mutex<Vec<PathBuf>>> = Arc::default();
    let sink = Arc::clone(&written);
    let toolchain = toolchain.clone();
    let seen = AtomicUsize::new(0);

    let callback = compile_hook(move |pipeline: &P, event: &PipelineEvent<P>| {
        let n = seen.fetch_add(1, Ordering::AcqRel) + 1;
        let paths = dump_event(pipeline, &toolchain, &dir, n, event)?;
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(paths);
        Ok(())
    });

    with_introspection(pipeline, callback, body)?;
    let paths = std::mem::take(&mut *written.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_sanitizes() {
        assert_eq!(file_stem("add", 1), "add_1");
        assert_eq!(file_stem("add#kernel", 2), "add_kernel_2");
        assert_eq!(file_stem("Main.vadd!", 3), "Main_vadd__3");
    }
}
