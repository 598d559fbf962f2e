//! External CUDA toolchain.
//!
//! Machine-code extraction shells out to `ptxas` and `nvdisasm`. Both are
//! optional: a missing tool is only reported when machine code is actually
//! requested.

pub mod sass;

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::{ReflectError, ReflectResult, Tool};

pub use sass::assemble_and_disassemble;

/// Environment variables naming a CUDA installation root.
const CUDA_ROOT_VARS: [&str; 2] = ["CUDA_HOME", "CUDA_PATH"];

/// Environment variable that overrides the location of `tool`.
pub fn override_var(tool: Tool) -> &'static str {
    match tool {
        Tool::Assembler => "KERNEL_REFLECT_PTXAS",
        Tool::Disassembler => "KERNEL_REFLECT_NVDISASM",
    }
}

/// Resolved locations of the assembler and disassembler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toolchain {
    pub ptxas: Option<PathBuf>,
    pub nvdisasm: Option<PathBuf>,
}

impl Toolchain {
    pub fn new(ptxas: Option<PathBuf>, nvdisasm: Option<PathBuf>) -> Self {
        Self { ptxas, nvdisasm }
    }

    /// Resolve both tools from the process environment.
    pub fn discover() -> Self {
        Self::discover_with(|name| env::var_os(name))
    }

    /// Resolve both tools using `lookup` to read environment variables.
    ///
    /// Each tool is taken from its override variable, then from the `bin`
    /// directory of `CUDA_HOME` or `CUDA_PATH`, then from `PATH`.
    pub fn discover_with(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let toolchain = Self {
            ptxas: find_tool(Tool::Assembler, &lookup),
            nvdisasm: find_tool(Tool::Disassembler, &lookup),
        };
        log::debug!("Discovered toolchain: {}", toolchain);
        toolchain
    }

    pub fn path(&self, tool: Tool) -> Option<&Path> {
        match tool {
            Tool::Assembler => self.ptxas.as_deref(),
            Tool::Disassembler => self.nvdisasm.as_deref(),
        }
    }

    /// Path of `tool`, or [`ReflectError::ToolchainUnavailable`].
    pub fn require(&self, tool: Tool) -> ReflectResult<&Path> {
        self.path(tool)
            .ok_or(ReflectError::ToolchainUnavailable { tool })
    }

    /// Whether both tools are resolved.
    pub fn is_complete(&self) -> bool {
        self.ptxas.is_some() && self.nvdisasm.is_some()
    }
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tool) in [Tool::Assembler, Tool::Disassembler].into_iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match self.path(tool) {
                Some(path) => write!(f, "{} = {}", tool, path.display())?,
                None => write!(f, "{} = <not found>", tool)?,
            }
        }
        Ok(())
    }
}

fn executable_name(tool: Tool) -> String {
    format!("{}{}", tool.binary_name(), env::consts::EXE_SUFFIX)
}

fn find_tool(tool: Tool, lookup: &impl Fn(&str) -> Option<OsString>) -> Option<PathBuf> {
    let var = override_var(tool);
    if let Some(path) = lookup(var).map(PathBuf::from) {
        if path.is_file() {
            return Some(path);
        }
        log::warn!("{} points at {}, which is not a file; ignoring", var, path.display());
    }

    let name = executable_name(tool);
    let cuda_bins = CUDA_ROOT_VARS
        .iter()
        .filter_map(|var| lookup(var))
        .map(|root| PathBuf::from(root).join("bin"));
    let path_dirs: Vec<PathBuf> = lookup("PATH")
        .map(|paths| env::split_paths(&paths).collect())
        .unwrap_or_default();

    cuda_bins
        .chain(path_dirs)
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn lookup_from(vars: HashMap<&'static str, OsString>) -> impl Fn(&str) -> Option<OsString> {
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_missing_tools() {
        let toolchain = Toolchain::discover_with(|_| None);
        assert_eq!(toolchain, Toolchain::default());
        assert!(!toolchain.is_complete());
        assert!(matches!(
            toolchain.require(Tool::Assembler),
            Err(ReflectError::ToolchainUnavailable {
                tool: Tool::Assembler
            })
        ));
    }

    #[test]
    fn test_cuda_home_bin() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        fs::create_dir(&bin).unwrap();
        fs::write(bin.join(executable_name(Tool::Assembler)), "").unwrap();

        let mut vars = HashMap::new();
        vars.insert("CUDA_HOME", root.path().as_os_str().to_owned());
        let toolchain = Toolchain::discover_with(lookup_from(vars));

        assert_eq!(
            toolchain.ptxas,
            Some(bin.join(executable_name(Tool::Assembler)))
        );
        assert_eq!(toolchain.nvdisasm, None);
    }

    #[test]
    fn test_override_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("my-nvdisasm");
        fs::write(&custom, "").unwrap();
        let on_path = dir.path().join(executable_name(Tool::Disassembler));
        fs::write(&on_path, "").unwrap();

        let mut vars = HashMap::new();
        vars.insert("KERNEL_REFLECT_NVDISASM", custom.as_os_str().to_owned());
        vars.insert("PATH", dir.path().as_os_str().to_owned());
        let toolchain = Toolchain::discover_with(lookup_from(vars));

        assert_eq!(toolchain.nvdisasm, Some(custom));
    }

    #[test]
    fn test_display() {
        let toolchain = Toolchain::new(Some(PathBuf::from("/opt/cuda/bin/ptxas")), None);
        assert_eq!(
            toolchain.to_string(),
            "ptxas = /opt/cuda/bin/ptxas, nvdisasm = <not found>"
        );
    }
}
