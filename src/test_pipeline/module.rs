//! Textual native-IR module produced by the test pipeline.

use crate::core::{Capability, KernelOptions, NativeModule};

use super::TestType;

/// LLVM type used for values of `ty`.
pub fn llvm_type(ty: TestType) -> &'static str {
    match ty {
        TestType::Int => "i64",
        TestType::Float => "double",
        TestType::IntRef | TestType::FloatRef | TestType::Any => "ptr",
    }
}

/// A function definition or declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrFunction {
    pub name: String,
    pub declaration: bool,
    pub params: Vec<TestType>,
    pub returns: Option<TestType>,
    pub lines: Vec<String>,
}

impl IrFunction {
    fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("{} %{}", llvm_type(*ty), i))
            .collect();
        let ret = self.returns.map_or("void", llvm_type);
        format!("{} @{}({})", ret, self.name, params.join(", "))
    }

    fn render(&self) -> String {
        if self.declaration {
            return format!("declare {}\n", self.signature());
        }
        let mut out = format!("define {} {{\n", self.signature());
        out.push_str("top:\n");
        for line in &self.lines {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("}\n");
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestModule {
    pub name: String,
    pub capability: Capability,
    pub functions: Vec<IrFunction>,
    pub metadata: Vec<String>,
    /// Capability the module was optimized for, if it was.
    pub optimized_for: Option<Capability>,
}

impl TestModule {
    pub fn new(name: &str, capability: Capability) -> Self {
        Self {
            name: name.to_string(),
            capability,
            functions: Vec::new(),
            metadata: Vec::new(),
            optimized_for: None,
        }
    }

    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Names of every function in the module, declarations included.
    pub fn function_names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }

    /// Lower the module to PTX with `entry` as the visible symbol.
    pub fn to_ptx(&self, entry: &str, kernel: bool, options: &KernelOptions) -> String {
        let mut lines = vec![
            "//".to_string(),
            "// Generated by the kernel-reflect test pipeline".to_string(),
            "//".to_string(),
            String::new(),
            ".version 7.8".to_string(),
            format!(".target {}", self.capability.target_id()),
            ".address_size 64".to_string(),
            String::new(),
        ];

        let params = self
            .function(entry)
            .map(|f| f.params.clone())
            .unwrap_or_default();
        let directive = if kernel { ".visible .entry" } else { ".visible .func" };
        lines.push(format!("{} {}(", directive, entry));
        let count = params.len();
        for (i, ty) in params.into_iter().enumerate() {
            let sep = if i + 1 < count { "," } else { "" };
            lines.push(format!("\t.param {} {}_param_{}{}", ty.ptx_type(), entry, i, sep));
        }
        lines.push(")".to_string());

        if kernel {
            if let Some(n) = options.max_threads {
                lines.push(format!(".maxntid {}, 1, 1", n));
            }
            if let Some(n) = options.min_threads {
                lines.push(format!(".reqntid {}, 1, 1", n));
            }
            if let Some(n) = options.blocks_per_sm {
                lines.push(format!(".minnctapersm {}", n));
            }
            if let Some(n) = options.max_registers {
                lines.push(format!(".maxnreg {}", n));
            }
        }

        lines.push("{".to_string());
        for function in self.functions.iter().filter(|f| !f.declaration) {
            for line in &function.lines {
                lines.push(format!("\t// {}", line));
            }
        }
        lines.push("\tret;".to_string());
        lines.push("}".to_string());

        let mut ptx = lines.join("\n");
        ptx.push('\n');
        ptx
    }
}

impl NativeModule for TestModule {
    type Entry = String;

    fn render_entry(&self, entry: &String) -> String {
        self.function(entry)
            .map(IrFunction::render)
            .unwrap_or_default()
    }

    fn render_module(&self) -> String {
        let mut out = format!("; ModuleID = '{}'\n", self.name);
        out.push_str("target triple = \"nvptx64-nvidia-cuda\"\n");
        if let Some(cap) = self.optimized_for {
            out.push_str(&format!("; optimized for {}\n", cap.target_id()));
        }
        for function in &self.functions {
            out.push('\n');
            out.push_str(&function.render());
        }
        if !self.metadata.is_empty() {
            out.push('\n');
            for line in &self.metadata {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> TestModule {
        let mut module = TestModule::new("add", Capability::new(7, 5));
        module.functions.push(IrFunction {
            name: "device_add".to_string(),
            declaration: false,
            params: vec![TestType::IntRef, TestType::Int],
            returns: None,
            lines: vec!["ret void".to_string()],
        });
        module.functions.push(IrFunction {
            name: "llvm.nvvm.read.ptx.sreg.tid.x".to_string(),
            declaration: true,
            params: Vec::new(),
            returns: Some(TestType::Int),
            lines: Vec::new(),
        });
        module
    }

    #[test]
    fn test_render_entry_only() {
        let module = module();
        let entry = module.render_entry(&"device_add".to_string());
        assert!(entry.starts_with("define void @device_add(ptr %0, i64 %1) {"));
        assert!(!entry.contains("declare"));
    }

    #[test]
    fn test_render_module_includes_declarations() {
        let rendered = module().render_module();
        assert!(rendered.contains("define void @device_add"));
        assert!(rendered.contains("declare i64 @llvm.nvvm.read.ptx.sreg.tid.x()"));
        assert!(rendered.contains("nvptx64-nvidia-cuda"));
    }

    #[test]
    fn test_ptx_kernel_bounds() {
        let options = KernelOptions {
            max_threads: Some(128),
            max_registers: Some(32),
            ..KernelOptions::default()
        };
        let ptx = module().to_ptx("device_add", true, &options);
        assert!(ptx.contains(".target sm_75"));
        assert!(ptx.contains(".visible .entry device_add("));
        assert!(ptx.contains(".maxntid 128, 1, 1"));
        assert!(ptx.contains(".maxnreg 32"));
        assert!(!ptx.contains(".minnctapersm"));

        let func = module().to_ptx("device_add", false, &options);
        assert!(func.contains(".visible .func device_add("));
        assert!(!func.contains(".maxntid"));
    }
}
