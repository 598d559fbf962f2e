//! In-memory compiler pipeline for testing kernel-reflect.
//!
//! [`TestPipeline`] implements [`CompilerPipeline`](crate::core::CompilerPipeline)
//! without a real compiler behind it. Methods are declared in a small text
//! format, every stage produces deterministic text, and kernel launches go
//! through a compilation cache and the compile hook exactly like a JIT would.
//!
//! # Method Format
//!
//! ```text
//! ; Comments start with semicolon
//! kernel add(a::IntRef, b::Int, c::Int) {
//!     a[] = b + c
//! }
//! function scale(x::Float, y::Any)::Float {
//!     x * y
//! }
//! ```
//!
//! `kernel` methods return nothing; `function` methods may declare a return
//! type after the parameter list.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::{HashMap, HashSet};

use crate::core::{
    validate, Capability, CompileEvent, CompileHook, CompilerPipeline, KernelOptions, ReflectError,
    Stage, TargetSignature, ValidationError,
};

pub mod adaptor;
pub mod module;
pub mod parser;

pub use module::{IrFunction, TestModule};
pub use parser::parse_methods;

/// Argument and return types understood by the test pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestType {
    Int,
    Float,
    IntRef,
    FloatRef,
    /// The abstract top type; matches anything and is never concrete.
    Any,
}

impl TestType {
    pub fn is_concrete(self) -> bool {
        self != TestType::Any
    }

    /// Whether a parameter declared as `self` accepts an argument of `arg`.
    pub fn accepts(self, arg: TestType) -> bool {
        self == TestType::Any || arg == TestType::Any || self == arg
    }

    /// PTX parameter type used for arguments of this type.
    pub fn ptx_type(self) -> &'static str {
        match self {
            TestType::Int => ".s64",
            TestType::Float => ".f64",
            TestType::IntRef | TestType::FloatRef | TestType::Any => ".u64",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TestType::Int => "Int",
            TestType::Float => "Float",
            TestType::IntRef => "IntRef",
            TestType::FloatRef => "FloatRef",
            TestType::Any => "Any",
        }
    }

    pub fn parse(name: &str) -> Option<TestType> {
        match name {
            "Int" => Some(TestType::Int),
            "Float" => Some(TestType::Float),
            "IntRef" => Some(TestType::IntRef),
            "FloatRef" => Some(TestType::FloatRef),
            "Any" => Some(TestType::Any),
            _ => None,
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Function reference: either a user function or the invocation wrapper the
/// pipeline generates around a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TestFunction {
    User(String),
    Wrapper(String),
}

impl TestFunction {
    pub fn user(name: &str) -> Self {
        TestFunction::User(name.to_string())
    }

    /// Name of the user function, for wrappers the wrapped one.
    pub fn base_name(&self) -> &str {
        match self {
            TestFunction::User(name) | TestFunction::Wrapper(name) => name,
        }
    }

    pub fn is_wrapper(&self) -> bool {
        matches!(self, TestFunction::Wrapper(_))
    }

    /// Wrapper generated around this function when launched as a kernel.
    pub fn wrapper(&self) -> Self {
        TestFunction::Wrapper(self.base_name().to_string())
    }
}

impl fmt::Display for TestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestFunction::User(name) => f.write_str(name),
            TestFunction::Wrapper(name) => write!(f, "#kernel_wrapper#{}", name),
        }
    }
}

/// A declared method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMethod {
    pub name: String,
    pub params: Vec<(String, TestType)>,
    pub returns: Option<TestType>,
    pub body: Vec<String>,
}

impl TestMethod {
    pub fn param_types(&self) -> Vec<TestType> {
        self.params.iter().map(|(_, ty)| *ty).collect()
    }

    fn applicable(&self, args: &[TestType]) -> bool {
        self.params.len() == args.len()
            && self
                .params
                .iter()
                .zip(args)
                .all(|((_, param), arg)| param.accepts(*arg))
    }
}

pub type TestTarget = TargetSignature<TestFunction, TestType>;

/// Lowered form of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweredBody {
    pub function: TestFunction,
    pub params: Vec<(String, TestType)>,
    pub statements: Vec<String>,
}

impl fmt::Display for LoweredBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|(name, _)| name.clone()).collect();
        writeln!(f, "Body({}({})", self.function, params.join(", "))?;
        for (i, stmt) in self.statements.iter().enumerate() {
            writeln!(f, "  {} ─ {}", i + 1, stmt)?;
        }
        write!(f, ")")
    }
}

/// Typed form of one method, specialized for a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedBody {
    pub function: TestFunction,
    pub params: Vec<(String, TestType)>,
    pub statements: Vec<String>,
    pub return_type: Option<TestType>,
}

impl TypedBody {
    fn return_name(&self) -> &'static str {
        self.return_type.map_or("Void", TestType::name)
    }
}

impl fmt::Display for TypedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(name, ty)| format!("{}::{}", name, ty))
            .collect();
        writeln!(f, "Body({}({})", self.function, params.join(", "))?;
        for (i, stmt) in self.statements.iter().enumerate() {
            writeln!(f, "  {} ─ {}", i + 1, stmt)?;
        }
        write!(f, ") => {}", self.return_name())
    }
}

/// Errors raised by the test pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TestPipelineError {
    #[error("invalid method definitions: {0}")]
    Parse(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("entry {0} not found in module")]
    MissingEntry(String),

    #[error("compilation aborted by the compile hook: {0}")]
    HookAborted(#[source] ReflectError),

    #[error("injected failure at the {0} stage")]
    Injected(Stage),
}

/// Counters for the work the pipeline performed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    /// Method table lookups.
    pub lookups: usize,
    pub lowered: usize,
    pub inferred: usize,
    pub native_ir: usize,
    pub wrappers: usize,
    pub optimized: usize,
    pub assembled: usize,
    /// Kernel launches that missed the cache and were compiled.
    pub compilations: usize,
    pub cache_hits: usize,
    pub cache_clears: usize,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Test Pipeline Statistics:")?;
        writeln!(f, "  Method lookups: {}", self.lookups)?;
        writeln!(f, "  Lowered: {}", self.lowered)?;
        writeln!(f, "  Inferred: {}", self.inferred)?;
        writeln!(f, "  Native IR modules: {}", self.native_ir)?;
        writeln!(f, "  Kernel wrappers: {}", self.wrappers)?;
        writeln!(f, "  Optimized modules: {}", self.optimized)?;
        writeln!(f, "  Assembled: {}", self.assembled)?;
        writeln!(f, "  Kernel compilations: {}", self.compilations)?;
        writeln!(f, "  Cache hits: {}", self.cache_hits)?;
        writeln!(f, "  Cache clears: {}", self.cache_clears)
    }
}

type CacheKey = (TestFunction, Vec<TestType>);

/// In-memory JIT pipeline.
pub struct TestPipeline {
    methods: HashMap<String, Vec<TestMethod>>,
    supported: Vec<Capability>,
    device: Mutex<Option<Capability>>,
    cache: Mutex<HashSet<CacheKey>>,
    hook: Mutex<Option<CompileHook<TestPipeline>>>,
    hook_running: AtomicBool,
    stats: Mutex<PipelineStats>,
    fail_at: Mutex<Option<Stage>>,
}

impl Default for TestPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPipeline {
    /// Capabilities the test pipeline can target.
    pub const SUPPORTED: [Capability; 7] = [
        Capability::new(3, 5),
        Capability::new(5, 0),
        Capability::new(6, 0),
        Capability::new(7, 0),
        Capability::new(7, 5),
        Capability::new(8, 0),
        Capability::new(9, 0),
    ];

    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            supported: Self::SUPPORTED.to_vec(),
            device: Mutex::new(None),
            cache: Mutex::new(HashSet::new()),
            hook: Mutex::new(None),
            hook_running: AtomicBool::new(false),
            stats: Mutex::new(PipelineStats::default()),
            fail_at: Mutex::new(None),
        }
    }

    /// Create a pipeline with the methods declared in `source`.
    pub fn from_source(source: &str) -> Result<Self, TestPipelineError> {
        let mut pipeline = Self::new();
        for method in parse_methods(source).map_err(TestPipelineError::Parse)? {
            pipeline.define(method);
        }
        Ok(pipeline)
    }

    /// Replace the capabilities the pipeline reports as supported.
    pub fn with_supported(mut self, supported: Vec<Capability>) -> Self {
        self.supported = supported;
        self
    }

    pub fn define(&mut self, method: TestMethod) {
        self.methods
            .entry(method.name.clone())
            .or_default()
            .push(method);
    }

    /// Make `capability` the active device, or deactivate the device.
    pub fn set_active_device(&self, capability: Option<Capability>) {
        *lock(&self.device) = capability;
    }

    /// Make the given stage fail on its next and every later use.
    pub fn fail_at(&self, stage: Option<Stage>) {
        *lock(&self.fail_at) = stage;
    }

    pub fn stats(&self) -> PipelineStats {
        lock(&self.stats).clone()
    }

    /// Whether something is installed in the compile-hook slot.
    pub fn has_compile_hook(&self) -> bool {
        lock(&self.hook).is_some()
    }

    /// Number of cached kernels.
    pub fn cached_kernels(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Launch `function` as a kernel, compiling it on a cache miss.
    pub fn launch(&self, function: &TestFunction, args: &[TestType]) -> Result<(), TestPipelineError> {
        self.compile_cached(function, args, true)
    }

    /// Compile `function` as a device function callable from kernels.
    pub fn compile_device_function(
        &self,
        function: &TestFunction,
        args: &[TestType],
    ) -> Result<(), TestPipelineError> {
        self.compile_cached(function, args, false)
    }

    fn compile_cached(
        &self,
        function: &TestFunction,
        args: &[TestType],
        kernel: bool,
    ) -> Result<(), TestPipelineError> {
        let key: CacheKey = (function.clone(), args.to_vec());
        // An installed hook observes every invocation, cached or not.
        if !self.has_compile_hook() && lock(&self.cache).contains(&key) {
            lock(&self.stats).cache_hits += 1;
            return Ok(());
        }

        let target = TargetSignature::new(function.clone(), args.iter().copied());
        validate(self, &target, kernel)?;
        let capability = self.current_capability();
        self.compile_to_assembly(&target, capability, kernel, &KernelOptions::default())?;
        lock(&self.stats).compilations += 1;

        let event = if kernel {
            CompileEvent {
                target: target.with_function(function.wrapper()),
                inner: Some(function.clone()),
                capability,
                kernel,
            }
        } else {
            CompileEvent {
                target,
                inner: None,
                capability,
                kernel,
            }
        };
        self.fire_hook(&event)?;

        lock(&self.cache).insert(key);
        Ok(())
    }

    fn current_capability(&self) -> Capability {
        let device = *lock(&self.device);
        device
            .or_else(|| self.supported.iter().copied().min())
            .unwrap_or(Capability::new(3, 5))
    }

    /// Call the installed hook, unless this compilation was requested from
    /// inside the hook.
    fn fire_hook(&self, event: &CompileEvent<TestFunction, TestType>) -> Result<(), TestPipelineError> {
        let hook = lock(&self.hook).clone();
        let Some(hook) = hook else {
            return Ok(());
        };
        if self.hook_running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = hook(self, event);
        self.hook_running.store(false, Ordering::Release);
        result.map_err(TestPipelineError::HookAborted)
    }

    fn check_failure(&self, stage: Stage) -> Result<(), TestPipelineError> {
        match *lock(&self.fail_at) {
            Some(failing) if failing == stage => Err(TestPipelineError::Injected(stage)),
            _ => Ok(()),
        }
    }

    fn matching_methods(&self, target: &TestTarget) -> Vec<&TestMethod> {
        self.methods
            .get(target.function().base_name())
            .map(|methods| {
                methods
                    .iter()
                    .filter(|m| m.applicable(target.arg_types()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable in-memory writer, for capturing front-end output.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
