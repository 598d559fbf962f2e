//! Machine-code extraction tests.
//!
//! `ptxas` and `nvdisasm` are replaced by shell scripts that record how they
//! were invoked. The assembler writes the scratch file path it was given to a
//! log so tests can check the file is gone afterwards.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use kernel_reflect::core::{Capability, ReflectError, TargetSignature, Tool, ValidationError};
use kernel_reflect::introspect::{device_code_dump, device_code_sass};
use kernel_reflect::reflect::{code_sass, machine_code, SassOptions};
use kernel_reflect::session_active;
use kernel_reflect::test_pipeline::{
    CaptureBuffer, TestFunction, TestPipeline, TestTarget, TestType,
};
use kernel_reflect::toolchain::{assemble_and_disassemble, Toolchain};
use tempfile::TempDir;

// Also keeps script creation and execution from racing with forks in other
// test threads.
static SERIAL: Mutex<()> = Mutex::new(());

const SOURCE: &str = "
    kernel add(a::IntRef, b::Int, c::Int) {
        a[] = b + c
    }
    function helper(x::Int)::Int {
        x
    }
";

const ADD_ARGS: [TestType; 3] = [TestType::IntRef, TestType::Int, TestType::Int];

const PTXAS: &str = r#"#!/bin/sh
out=""
target=""
while [ $# -gt 0 ]; do
    case "$1" in
        --target) target="$2"; shift 2 ;;
        --output-file) out="$2"; shift 2 ;;
        --input-as-string) shift 2 ;;
        *) shift ;;
    esac
done
echo "$out" >> "@LOG@"
printf 'cubin for %s\n' "$target" > "$out"
"#;

const FAILING_PTXAS: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    case "$1" in
        --output-file) echo "$2" >> "@LOG@"; shift 2 ;;
        *) shift ;;
    esac
done
echo "ptxas fatal : Unresolved extern function" >&2
exit 255
"#;

const NVDISASM: &str = r#"#!/bin/sh
[ "$1" = "--dump" ] || exit 2
echo "// $(cat "$2")"
echo "        /*0000*/                   MOV R1, c[0x0][0x28] ;"
echo "        /*0010*/                   EXIT ;"
"#;

struct FakeToolchain {
    dir: TempDir,
    toolchain: Toolchain,
}

impl FakeToolchain {
    fn new(ptxas: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("ptxas.log");
        let script = ptxas.replace("@LOG@", &log.to_string_lossy());
        let ptxas = write_script(dir.path(), "ptxas", &script);
        let nvdisasm = write_script(dir.path(), "nvdisasm", NVDISASM);
        Self {
            dir,
            toolchain: Toolchain::new(Some(ptxas), Some(nvdisasm)),
        }
    }

    /// Scratch paths the assembler was invoked with.
    fn scratch_paths(&self) -> Vec<PathBuf> {
        fs::read_to_string(self.dir.path().join("ptxas.log"))
            .unwrap_or_default()
            .lines()
            .map(PathBuf::from)
            .collect()
    }
}

fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn init() -> (MutexGuard<'static, ()>, TestPipeline) {
    let guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    let _ = env_logger::builder().is_test(true).try_init();
    let pipeline = TestPipeline::from_source(SOURCE).expect("test source parses");
    (guard, pipeline)
}

fn add() -> TestTarget {
    TargetSignature::new(TestFunction::user("add"), ADD_ARGS)
}

#[test]
fn test_machine_code_round_trip() {
    let (_guard, pipeline) = init();
    let fake = FakeToolchain::new(PTXAS);
    let options = SassOptions {
        capability: Some(Capability::new(7, 5)),
        ..SassOptions::default()
    };

    let sass = machine_code(&pipeline, &fake.toolchain, &add(), &options).unwrap();
    assert!(sass.starts_with("// cubin for sm_75\n"));
    assert!(sass.contains("MOV R1, c[0x0][0x28]"));

    let scratch = fake.scratch_paths();
    assert_eq!(scratch.len(), 1);
    assert!(!scratch[0].exists(), "scratch file {} left behind", scratch[0].display());

    // Validated once, compiled once.
    let stats = pipeline.stats();
    assert_eq!(stats.lookups, 1);
    assert_eq!(stats.assembled, 1);
}

#[test]
fn test_scratch_removed_on_failure() {
    let (_guard, pipeline) = init();
    let fake = FakeToolchain::new(FAILING_PTXAS);

    let err = machine_code(&pipeline, &fake.toolchain, &add(), &SassOptions::default()).unwrap_err();
    match err {
        ReflectError::ToolchainExecution { tool, status, stderr } => {
            assert_eq!(tool, Tool::Assembler);
            assert_eq!(status.code(), Some(255));
            assert!(stderr.contains("Unresolved extern function"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let scratch = fake.scratch_paths();
    assert_eq!(scratch.len(), 1);
    assert!(!scratch[0].exists());
}

#[test]
fn test_non_kernel_never_reaches_toolchain() {
    let (_guard, pipeline) = init();
    let fake = FakeToolchain::new(PTXAS);
    let options = SassOptions {
        kernel: false,
        ..SassOptions::default()
    };

    let err = machine_code(&pipeline, &fake.toolchain, &add(), &options).unwrap_err();
    assert!(matches!(
        err,
        ReflectError::Validation(ValidationError::NotAKernel)
    ));
    assert!(fake.scratch_paths().is_empty());
    assert_eq!(pipeline.stats().assembled, 0);
}

#[test]
fn test_returning_function_is_not_a_kernel() {
    let (_guard, pipeline) = init();
    let fake = FakeToolchain::new(PTXAS);
    let helper = TargetSignature::new(TestFunction::user("helper"), [TestType::Int]);

    let mut out = Vec::new();
    let err = code_sass(&mut out, &pipeline, &fake.toolchain, &helper, &SassOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ReflectError::Validation(ValidationError::KernelReturnsValue { .. })
    ));
    assert!(out.is_empty());
    assert!(fake.scratch_paths().is_empty());
}

#[test]
fn test_missing_tool_fails_before_compiling() {
    let (_guard, pipeline) = init();
    let fake = FakeToolchain::new(PTXAS);
    let toolchain = Toolchain::new(fake.toolchain.ptxas.clone(), None);

    let err = machine_code(&pipeline, &toolchain, &add(), &SassOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        ReflectError::ToolchainUnavailable {
            tool: Tool::Disassembler
        }
    ));
    assert!(fake.scratch_paths().is_empty());
    assert_eq!(pipeline.stats().assembled, 0);
}

#[test]
fn test_spawn_failure() {
    let (_guard, _pipeline) = init();
    let dir = tempfile::tempdir().unwrap();
    let toolchain = Toolchain::new(
        Some(dir.path().join("no-such-ptxas")),
        Some(dir.path().join("no-such-nvdisasm")),
    );

    let err = assemble_and_disassemble(&toolchain, "", Capability::new(7, 0)).unwrap_err();
    assert!(matches!(
        err,
        ReflectError::ToolchainSpawn {
            tool: Tool::Assembler,
            ..
        }
    ));
}

#[test]
fn test_sass_front_end() {
    let (_guard, pipeline) = init();
    let fake = FakeToolchain::new(PTXAS);
    let buffer = CaptureBuffer::new();

    device_code_sass(
        buffer.clone(),
        &pipeline,
        &fake.toolchain,
        &SassOptions::default(),
        || pipeline.launch(&TestFunction::user("add"), &ADD_ARGS),
    )
    .unwrap();

    let text = buffer.contents();
    assert!(text.starts_with("// #kernel_wrapper#add(IntRef, Int, Int) for sm_35\n"));
    assert!(text.contains("// cubin for sm_35"));
    assert!(text.contains("EXIT ;"));
    assert!(fake.scratch_paths().iter().all(|path| !path.exists()));
}

#[test]
fn test_sass_front_end_rejects_device_functions() {
    let (_guard, pipeline) = init();
    let fake = FakeToolchain::new(PTXAS);
    let buffer = CaptureBuffer::new();

    let err = device_code_sass(
        buffer.clone(),
        &pipeline,
        &fake.toolchain,
        &SassOptions::default(),
        || pipeline.compile_device_function(&TestFunction::user("helper"), &[TestType::Int]),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        ReflectError::Validation(ValidationError::NotAKernel)
    ));
    assert!(buffer.contents().is_empty());
    assert!(fake.scratch_paths().is_empty());
    assert!(!session_active());
    assert!(!pipeline.has_compile_hook());
}

#[test]
fn test_dump_includes_machine_code() {
    let (_guard, pipeline) = init();
    let fake = FakeToolchain::new(PTXAS);
    let out = tempfile::tempdir().unwrap();

    let written = device_code_dump(out.path(), &pipeline, &fake.toolchain, || {
        pipeline.launch(&TestFunction::user("add"), &ADD_ARGS)
    })
    .unwrap();

    let sass = out.path().join("add_1.sass");
    assert!(written.contains(&sass));
    assert!(fs::read_to_string(&sass).unwrap().contains("MOV R1"));
}
