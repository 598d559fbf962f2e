//! CompilerPipeline implementation for the test pipeline.

use std::io::{self, Write};

use super::module::{llvm_type, IrFunction, TestModule};
use super::{
    lock, LoweredBody, TestFunction, TestMethod, TestPipeline, TestPipelineError, TestTarget,
    TestType, TypedBody,
};
use crate::core::{
    AssemblyMetadata, Capability, CompileHook, CompilerPipeline, KernelOptions, MethodMatch,
    Stage, ValidationError,
};

fn argument_names(count: usize) -> Vec<(String, TestType)> {
    (0..count).map(|i| (format!("arg{}", i), TestType::Any)).collect()
}

fn lowered_statements(method: &TestMethod) -> Vec<String> {
    let mut statements = method.body.clone();
    if method.returns.is_none() {
        statements.push("return".to_string());
    }
    statements
}

impl TestPipeline {
    fn first_method(&self, target: &TestTarget) -> Result<&TestMethod, TestPipelineError> {
        self.matching_methods(target).into_iter().next().ok_or_else(|| {
            ValidationError::NoMatchingMethod {
                function: target.function().to_string(),
                signature: target.types_string(),
            }
            .into()
        })
    }

    /// Body of the invocation wrapper: forward every argument to the kernel.
    fn wrapper_statements(target: &TestTarget) -> Vec<String> {
        let args: Vec<String> = (0..target.arg_types().len())
            .map(|i| format!("arg{}", i))
            .collect();
        vec![
            format!("%1 = invoke {}({})", target.function().base_name(), args.join(", ")),
            "return".to_string(),
        ]
    }
}

impl CompilerPipeline for TestPipeline {
    type Function = TestFunction;
    type Type = TestType;
    type Lowered = LoweredBody;
    type Typed = TypedBody;
    type Module = TestModule;
    type Error = TestPipelineError;

    fn active_device_capability(&self) -> Option<Capability> {
        *lock(&self.device)
    }

    fn supported_capabilities(&self) -> &[Capability] {
        &self.supported
    }

    fn lookup_methods(&self, target: &TestTarget) -> Vec<MethodMatch<TestType>> {
        lock(&self.stats).lookups += 1;
        let methods = self.matching_methods(target);
        if target.function().is_wrapper() {
            // One wrapper per kernel, whatever the kernel returns is dropped.
            return methods
                .first()
                .map(|m| MethodMatch {
                    params: m.param_types(),
                    return_type: None,
                })
                .into_iter()
                .collect();
        }

        methods
            .into_iter()
            .map(|m| MethodMatch {
                params: m.param_types(),
                return_type: m.returns,
            })
            .collect()
    }

    fn is_concrete(&self, ty: &TestType) -> bool {
        ty.is_concrete()
    }

    fn lower(&self, target: &TestTarget) -> Result<Vec<LoweredBody>, TestPipelineError> {
        self.check_failure(Stage::Lowered)?;
        lock(&self.stats).lowered += 1;

        if target.function().is_wrapper() {
            return Ok(vec![LoweredBody {
                function: target.function().clone(),
                params: argument_names(target.arg_types().len()),
                statements: Self::wrapper_statements(target),
            }]);
        }

        Ok(self
            .matching_methods(target)
            .into_iter()
            .map(|m| LoweredBody {
                function: target.function().clone(),
                params: m.params.clone(),
                statements: lowered_statements(m),
            })
            .collect())
    }

    fn infer(&self, target: &TestTarget) -> Result<Vec<TypedBody>, TestPipelineError> {
        self.check_failure(Stage::Typed)?;
        lock(&self.stats).inferred += 1;

        if target.function().is_wrapper() {
            let params = argument_names(target.arg_types().len())
                .into_iter()
                .zip(target.arg_types())
                .map(|((name, _), ty)| (name, *ty))
                .collect();
            return Ok(vec![TypedBody {
                function: target.function().clone(),
                params,
                statements: Self::wrapper_statements(target),
                return_type: None,
            }]);
        }

        Ok(self
            .matching_methods(target)
            .into_iter()
            .map(|m| {
                // Specialize declared parameter types on concrete arguments.
                let params = m
                    .params
                    .iter()
                    .zip(target.arg_types())
                    .map(|((name, declared), arg)| {
                        let ty = if arg.is_concrete() { *arg } else { *declared };
                        (name.clone(), ty)
                    })
                    .collect();
                TypedBody {
                    function: target.function().clone(),
                    params,
                    statements: lowered_statements(m),
                    return_type: m.returns,
                }
            })
            .collect())
    }

    fn render_warntype(&self, typed: &TypedBody, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Arguments")?;
        for (name, ty) in &typed.params {
            if ty.is_concrete() {
                writeln!(out, "  {}::{}", name, ty)?;
            } else {
                writeln!(out, "  {}::{}", name, ty.name().to_uppercase())?;
            }
        }
        writeln!(out, "Body::{}", typed.return_name())?;
        for (i, stmt) in typed.statements.iter().enumerate() {
            writeln!(out, "{} ─ {}", i + 1, stmt)?;
        }
        Ok(())
    }

    fn generate_native_ir(
        &self,
        target: &TestTarget,
        capability: Capability,
        _kernel: bool,
    ) -> Result<(TestModule, String), TestPipelineError> {
        self.check_failure(Stage::NativeIr)?;
        let method = self.first_method(target)?;
        lock(&self.stats).native_ir += 1;

        let entry = format!("device_{}", method.name);
        let params: Vec<TestType> = method
            .params
            .iter()
            .zip(target.arg_types())
            .map(|((_, declared), arg)| if arg.is_concrete() { *arg } else { *declared })
            .collect();

        let mut lines: Vec<String> = method
            .params
            .iter()
            .zip(&params)
            .map(|((name, _), ty)| format!("%{}.addr = alloca {}", name, llvm_type(*ty)))
            .collect();
        lines.extend(method.body.iter().map(|stmt| format!("; {}", stmt)));
        lines.push(match method.returns {
            Some(ty) => format!("ret {} undef", llvm_type(ty)),
            None => "ret void".to_string(),
        });

        let mut module = TestModule::new(&method.name, capability);
        module.functions.push(IrFunction {
            name: entry.clone(),
            declaration: false,
            params,
            returns: method.returns,
            lines,
        });
        module.functions.push(IrFunction {
            name: "llvm.nvvm.read.ptx.sreg.tid.x".to_string(),
            declaration: true,
            params: Vec::new(),
            returns: Some(TestType::Int),
            lines: Vec::new(),
        });
        module.metadata.push("!llvm.module.flags = !{!0}".to_string());
        module
            .metadata
            .push("!0 = !{i32 2, !\"Debug Info Version\", i32 3}".to_string());

        Ok((module, entry))
    }

    fn promote_kernel_wrapper(
        &self,
        module: &mut TestModule,
        entry: String,
        target: &TestTarget,
        options: &KernelOptions,
    ) -> Result<String, TestPipelineError> {
        let kernel = module
            .function(&entry)
            .ok_or_else(|| TestPipelineError::MissingEntry(entry.clone()))?;
        let params = kernel.params.clone();
        lock(&self.stats).wrappers += 1;

        let wrapper = format!("kernel_{}", target.function().base_name());
        let args: Vec<String> = params
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("{} %{}", llvm_type(*ty), i))
            .collect();
        module.functions.push(IrFunction {
            name: wrapper.clone(),
            declaration: false,
            params,
            returns: None,
            lines: vec![
                format!("call void @{}({})", entry, args.join(", ")),
                "ret void".to_string(),
            ],
        });

        let mut annotations = vec![format!("!{{ptr @{}, !\"kernel\", i32 1}}", wrapper)];
        let bounds = [
            ("maxntidx", options.max_threads),
            ("reqntidx", options.min_threads),
            ("minctasm", options.blocks_per_sm),
            ("maxnreg", options.max_registers),
        ];
        for (key, value) in bounds {
            if let Some(value) = value {
                annotations.push(format!("!{{ptr @{}, !\"{}\", i32 {}}}", wrapper, key, value));
            }
        }
        module
            .metadata
            .push(format!("!nvvm.annotations = !{{{}}}", annotations.join(", ")));

        Ok(wrapper)
    }

    fn optimize(
        &self,
        module: &mut TestModule,
        entry: &String,
        capability: Capability,
    ) -> Result<(), TestPipelineError> {
        if module.function(entry).is_none() {
            return Err(TestPipelineError::MissingEntry(entry.clone()));
        }
        lock(&self.stats).optimized += 1;

        for function in module.functions.iter_mut().filter(|f| !f.declaration) {
            function.lines.retain(|line| !line.contains("= alloca"));
        }
        module.optimized_for = Some(capability);
        Ok(())
    }

    fn compile_to_assembly(
        &self,
        target: &TestTarget,
        capability: Capability,
        kernel: bool,
        options: &KernelOptions,
    ) -> Result<(String, AssemblyMetadata), TestPipelineError> {
        self.check_failure(Stage::Assembly)?;
        let (mut module, mut entry) = self.generate_native_ir(target, capability, kernel)?;
        if kernel {
            entry = self.promote_kernel_wrapper(&mut module, entry, target, options)?;
        }
        self.optimize(&mut module, &entry, capability)?;
        lock(&self.stats).assembled += 1;

        let ptx = module.to_ptx(&entry, kernel, options);
        Ok((ptx, AssemblyMetadata { entry }))
    }

    fn install_compile_hook(&self, hook: Option<CompileHook<Self>>) {
        *lock(&self.hook) = hook;
    }

    fn clear_compile_cache(&self) {
        lock(&self.cache).clear();
        lock(&self.stats).cache_clears += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NativeModule, TargetSignature};

    fn pipeline() -> TestPipeline {
        TestPipeline::from_source(
            "
            kernel add(a::IntRef, b::Int, c::Int) {
                a[] = b + c
            }
            function scale(x::Float, y::Float)::Float {
                x * y
            }
            function scale(x::Int, y::Int)::Int {
                x * y
            }
            ",
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_counts_methods() {
        let pipeline = pipeline();
        let abstract_sig =
            TargetSignature::new(TestFunction::user("scale"), [TestType::Any, TestType::Any]);
        assert_eq!(pipeline.lookup_methods(&abstract_sig).len(), 2);

        let concrete = TargetSignature::new(
            TestFunction::user("scale"),
            [TestType::Int, TestType::Int],
        );
        let methods = pipeline.lookup_methods(&concrete);
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].return_type, Some(TestType::Int));
    }

    #[test]
    fn test_wrapper_lowering_forwards_arguments() {
        let pipeline = pipeline();
        let target = TargetSignature::new(
            TestFunction::user("add").wrapper(),
            [TestType::IntRef, TestType::Int, TestType::Int],
        );
        let lowered = pipeline.lower(&target).unwrap();
        assert_eq!(lowered.len(), 1);
        assert_eq!(lowered[0].statements[0], "%1 = invoke add(arg0, arg1, arg2)");
    }

    #[test]
    fn test_promotion_adds_wrapper() {
        let pipeline = pipeline();
        let target = TargetSignature::new(
            TestFunction::user("add"),
            [TestType::IntRef, TestType::Int, TestType::Int],
        );
        let cap = Capability::new(7, 0);
        let (mut module, entry) = pipeline.generate_native_ir(&target, cap, true).unwrap();
        let options = KernelOptions {
            max_threads: Some(256),
            ..KernelOptions::default()
        };
        let wrapper = pipeline
            .promote_kernel_wrapper(&mut module, entry, &target, &options)
            .unwrap();

        assert_eq!(wrapper, "kernel_add");
        let rendered = module.render_entry(&wrapper);
        assert!(rendered.contains("call void @device_add(ptr %0, i64 %1, i64 %2)"));
        assert!(module.render_module().contains("!\"maxntidx\", i32 256"));
    }

    #[test]
    fn test_optimize_strips_allocas() {
        let pipeline = pipeline();
        let target = TargetSignature::new(
            TestFunction::user("add"),
            [TestType::IntRef, TestType::Int, TestType::Int],
        );
        let cap = Capability::new(7, 0);
        let (mut module, entry) = pipeline.generate_native_ir(&target, cap, false).unwrap();
        assert!(module.render_entry(&entry).contains("alloca"));

        pipeline.optimize(&mut module, &entry, cap).unwrap();
        assert!(!module.render_entry(&entry).contains("alloca"));
        assert_eq!(pipeline.stats().optimized, 1);
    }

    #[test]
    fn test_injected_failure() {
        let pipeline = pipeline();
        pipeline.fail_at(Some(Stage::Typed));
        let target = TargetSignature::new(TestFunction::user("scale"), [TestType::Int, TestType::Int]);
        assert!(matches!(
            pipeline.infer(&target),
            Err(TestPipelineError::Injected(Stage::Typed))
        ));
        assert!(pipeline.lower(&target).is_ok());
    }
}
