//! Per-stage extraction options.

use crate::core::{Capability, KernelOptions};

/// Options for the lowered, typed and warntype stages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReflectOptions {
    /// Target capability. These stages run before code generation, so the
    /// capability only matters to front-ends that forward it.
    pub capability: Option<Capability>,
    /// Validate the target as a kernel entry point.
    pub kernel: bool,
}

/// Options for native-IR extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlvmOptions {
    pub capability: Option<Capability>,
    /// Compile as a kernel, promoting the entry to its invocation wrapper.
    pub kernel: bool,
    /// Run the pipeline's optimization passes before rendering.
    pub optimize: bool,
    /// Render the whole module instead of only the entry function.
    pub dump_module: bool,
    pub kernel_options: KernelOptions,
}

impl Default for LlvmOptions {
    fn default() -> Self {
        Self {
            capability: None,
            kernel: false,
            optimize: true,
            dump_module: false,
            kernel_options: KernelOptions::default(),
        }
    }
}

/// Options for PTX assembly extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtxOptions {
    pub capability: Option<Capability>,
    pub kernel: bool,
    pub kernel_options: KernelOptions,
}

/// Options for SASS machine-code extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SassOptions {
    pub capability: Option<Capability>,
    /// Must be set; machine code only exists for kernels.
    pub kernel: bool,
    pub kernel_options: KernelOptions,
}

impl Default for SassOptions {
    fn default() -> Self {
        Self {
            capability: None,
            kernel: true,
            kernel_options: KernelOptions::default(),
        }
    }
}

macro_rules! common_setters {
    ($($options:ty),*) => {$(
        impl $options {
            pub fn with_capability(mut self, capability: Capability) -> Self {
                self.capability = Some(capability);
                self
            }

            pub fn with_kernel(mut self, kernel: bool) -> Self {
                self.kernel = kernel;
                self
            }
        }
    )*};
}

common_setters!(ReflectOptions, LlvmOptions, PtxOptions, SassOptions);

impl LlvmOptions {
    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_dump_module(mut self, dump_module: bool) -> Self {
        self.dump_module = dump_module;
        self
    }
}
