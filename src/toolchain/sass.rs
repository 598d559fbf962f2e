//! PTX to SASS translation through `ptxas` and `nvdisasm`.
//!
//! The PTX is assembled into a scratch cubin which is then disassembled. The
//! scratch file is removed on every exit path.
//!
//! The result may not match what the driver produces when it loads the same
//! PTX: the standalone assembler and the driver's embedded translator are not
//! guaranteed to be identical.

use std::process::{Command, Output, Stdio};

use crate::core::{Capability, ReflectError, ReflectResult, Tool};

use super::Toolchain;

/// Assemble `assembly` for `capability` and return the disassembled machine
/// code.
pub fn assemble_and_disassemble(
    toolchain: &Toolchain,
    assembly: &str,
    capability: Capability,
) -> ReflectResult<String> {
    let ptxas = toolchain.require(Tool::Assembler)?;
    let nvdisasm = toolchain.require(Tool::Disassembler)?;
    let target = capability.target_id();

    let scratch = tempfile::Builder::new()
        .prefix("kernel-reflect-")
        .suffix(".cubin")
        .tempfile()
        .map_err(ReflectError::ScratchFile)?;
    log::debug!("Assembling PTX for {} into {}", target, scratch.path().display());

    run_tool(
        Tool::Assembler,
        Command::new(ptxas)
            .arg("--target")
            .arg(&target)
            .arg("--output-file")
            .arg(scratch.path())
            .arg("--input-as-string")
            .arg(assembly),
    )?;

    let output = run_tool(
        Tool::Disassembler,
        Command::new(nvdisasm).arg("--dump").arg(scratch.path()),
    )?;

    scratch.close().map_err(ReflectError::ScratchFile)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn run_tool(tool: Tool, command: &mut Command) -> ReflectResult<Output> {
    log::trace!("Running {:?}", command);
    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|source| ReflectError::ToolchainSpawn { tool, source })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        log::warn!("{} exited with {}", tool, output.status);
        return Err(ReflectError::ToolchainExecution {
            tool,
            status: output.status,
            stderr,
        });
    }
    Ok(output)
}
