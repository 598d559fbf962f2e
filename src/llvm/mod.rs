//! Native IR support for pipelines built on inkwell.
//!
//! Enabled with the `llvm` feature. Provides [`NativeModule`] for inkwell
//! modules and [`NvptxTarget`], which a pipeline can use to implement the
//! optimization and assembly stages of
//! [`CompilerPipeline`](crate::core::CompilerPipeline):
//!
//! ```ignore
//! let nvptx = NvptxTarget::new()?;
//! nvptx.optimize(&module, capability)?;
//! let ptx = nvptx.emit_ptx(&module, capability)?;
//! ```

use inkwell::module::Module;
use inkwell::passes::PassBuilderOptions;
use inkwell::targets::{
    CodeModel, FileType, InitializationConfig, RelocMode, Target, TargetMachine, TargetTriple,
};
use inkwell::values::FunctionValue;
use inkwell::OptimizationLevel;

use crate::core::{Capability, NativeModule};

/// Target triple for 64-bit PTX.
pub const NVPTX_TRIPLE: &str = "nvptx64-nvidia-cuda";

#[derive(Debug, thiserror::Error)]
pub enum LlvmError {
    #[error("NVPTX target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("cannot create a target machine for {0}")]
    TargetMachine(Capability),

    #[error("optimization passes failed: {0}")]
    Passes(String),

    #[error("PTX emission failed: {0}")]
    Emission(String),
}

impl<'ctx> NativeModule for Module<'ctx> {
    type Entry = FunctionValue<'ctx>;

    fn render_entry(&self, entry: &FunctionValue<'ctx>) -> String {
        entry.print_to_string().to_string()
    }

    fn render_module(&self) -> String {
        self.print_to_string().to_string()
    }
}

/// Code generation for the NVPTX backend.
#[derive(Debug)]
pub struct NvptxTarget {
    triple: TargetTriple,
    target: Target,
}

impl NvptxTarget {
    pub fn new() -> Result<Self, LlvmError> {
        Target::initialize_nvptx(&InitializationConfig::default());
        let triple = TargetTriple::create(NVPTX_TRIPLE);
        let target = Target::from_triple(&triple)
            .map_err(|e| LlvmError::TargetUnavailable(e.to_string()))?;
        Ok(Self { triple, target })
    }

    /// Target machine generating code for `capability`.
    pub fn machine(&self, capability: Capability) -> Result<TargetMachine, LlvmError> {
        self.target
            .create_target_machine(
                &self.triple,
                &capability.target_id(),
                "",
                OptimizationLevel::Aggressive,
                RelocMode::Default,
                CodeModel::Default,
            )
            .ok_or(LlvmError::TargetMachine(capability))
    }

    /// Point `module` at the NVPTX target.
    pub fn configure(&self, module: &Module<'_>, capability: Capability) -> Result<(), LlvmError> {
        let machine = self.machine(capability)?;
        module.set_triple(&self.triple);
        module.set_data_layout(&machine.get_target_data().get_data_layout());
        Ok(())
    }

    /// Run the default O2 pipeline over `module`.
    pub fn optimize(&self, module: &Module<'_>, capability: Capability) -> Result<(), LlvmError> {
        let machine = self.machine(capability)?;
        log::debug!("Running default<O2> for {}", capability.target_id());
        module
            .run_passes("default<O2>", &machine, PassBuilderOptions::create())
            .map_err(|e| LlvmError::Passes(e.to_string()))
    }

    /// PTX assembly for `module`.
    pub fn emit_ptx(&self, module: &Module<'_>, capability: Capability) -> Result<String, LlvmError> {
        let machine = self.machine(capability)?;
        let buffer = machine
            .write_to_memory_buffer(module, FileType::Assembly)
            .map_err(|e| LlvmError::Emission(e.to_string()))?;
        Ok(String::from_utf8_lossy(buffer.as_slice()).into_owned())
    }
}
