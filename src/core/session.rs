// This module implements the hook session controller. A HookSession owns the pipeline's
// single compile-hook slot for the duration of one introspection: begin() rejects nesting,
// clears the pipeline's compilation cache so every kernel is recompiled and observed, and
// installs a counting hook that forwards each compile event to the user callback. Dropping
// the session clears the slot and releases the process-wide active flag, so release happens
// on every exit path including unwinding. finish() then reports the first callback failure,
// or an error when no kernel was observed at all.

//! Hook session management.
//!
//! At most one session may be active in the process. The slot is cleared when
//! the [`HookSession`] is dropped, before any result of the session is
//! inspected.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::adaptor::{compile_hook, CompileHook, CompilerPipeline, PipelineEvent};
use super::error::{BoxError, ReflectError, ReflectResult};

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Whether an introspection session is currently active in this process.
pub fn session_active() -> bool {
    SESSION_ACTIVE.load(Ordering::Acquire)
}

/// State shared between the session and the hook installed in the pipeline.
#[derive(Default)]
struct SessionState {
    kernels: AtomicUsize,
    failure: Mutex<Option<ReflectError>>,
}

impl SessionState {
    fn record_failure(&self, err: ReflectError) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        // Later failures are usually consequences of the first one.
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn take_failure(&self) -> Option<ReflectError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Hook that counts kernels and forwards each event to `callback`.
fn counting_hook<P: CompilerPipeline>(
    state: Arc<SessionState>,
    callback: CompileHook<P>,
) -> CompileHook<P> {
    compile_hook(move |pipeline: &P, event: &PipelineEvent<P>| {
        let seen = state.kernels.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!(
            "Kernel #{} compiled: {} for capability {}",
            seen,
            event.target,
            event.capability
        );

        match callback(pipeline, event) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::debug!("Introspection callback failed: {}", err);
                state.record_failure(err);
                Err(ReflectError::CallbackFailed)
            }
        }
    })
}

/// An active interception of the pipeline's compile hook.
pub struct HookSession<'p, P: CompilerPipeline> {
    pipeline: &'p P,
    state: Arc<SessionState>,
}

impl<'p, P: CompilerPipeline> HookSession<'p, P> {
    /// Start intercepting every kernel `pipeline` compiles.
    ///
    /// Fails with [`ReflectError::SessionConflict`] if a session is already
    /// active; the active session is left untouched.
    pub fn begin(pipeline: &'p P, callback: CompileHook<P>) -> ReflectResult<Self> {
        if SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ReflectError::SessionConflict);
        }

        pipeline.clear_compile_cache();
        let state = Arc::new(SessionState::default());
        pipeline.install_compile_hook(Some(counting_hook(Arc::clone(&state), callback)));
        log::debug!("Introspection session started");

        Ok(Self { pipeline, state })
    }

    /// Kernels observed so far.
    pub fn kernel_count(&self) -> usize {
        self.state.kernels.load(Ordering::Acquire)
    }

    /// End the session and report its outcome.
    ///
    /// The hook slot is cleared first. Returns the first callback failure if
    /// there was one, [`ReflectError::EmptyResult`] if no kernel was
    /// observed, and the kernel count otherwise.
    pub fn finish(self) -> ReflectResult<usize> {
        let state = Arc::clone(&self.state);
        drop(self);

        if let Some(err) = state.take_failure() {
            return Err(err);
        }

        match state.kernels.load(Ordering::Acquire) {
            0 => {
                log::warn!("Introspection session ended without compiling any kernel");
                Err(ReflectError::EmptyResult)
            }
            n => Ok(n),
        }
    }
}

impl<P: CompilerPipeline> Drop for HookSession<'_, P> {
    fn drop(&mut self) {
        self.pipeline.install_compile_hook(None);
        SESSION_ACTIVE.store(false, Ordering::Release);
        log::debug!(
            "Introspection session ended after {} kernel(s)",
            self.kernel_count()
        );
    }
}

/// Evaluate `body` while every kernel compiled by `pipeline` is passed to
/// `callback`.
///
/// The hook slot is cleared before any error is reported. A failure inside
/// `callback` takes precedence over a failure of `body`, since the callback
/// failure aborts the compilation `body` was waiting on.
pub fn with_introspection<P, R, E>(
    pipeline: &P,
    callback: CompileHook<P>,
    body: impl FnOnce() -> Result<R, E>,
) -> ReflectResult<R>
where
    P: CompilerPipeline,
    E: Into<BoxError>,
{
    let session = HookSession::begin(pipeline, callback)?;
    let value = body();

    match (session.finish(), value) {
        (Ok(_), Ok(value)) => Ok(value),
        (Ok(_) | Err(ReflectError::EmptyResult), Err(err)) => {
            Err(ReflectError::Evaluation(err.into()))
        }
        (Err(err), _) => Err(err),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::ValidationError;
    use crate::test_pipeline::{TestFunction, TestPipeline, TestPipelineError, TestType};
    use std::sync::MutexGuard;

    static SERIAL: Mutex<()> = Mutex::new(());

    /// Serialize tests that start sessions.
    pub(crate) fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
    }

    const ARGS: [TestType; 3] = [TestType::IntRef, TestType::Int, TestType::Int];

    fn add_pipeline() -> TestPipeline {
        TestPipeline::from_source("kernel add(a::IntRef, b::Int, c::Int) {\n  a[] = b + c\n}\n")
            .unwrap()
    }

    fn noop<P: CompilerPipeline>() -> CompileHook<P> {
        compile_hook(|_: &P, _: &PipelineEvent<P>| Ok(()))
    }

    #[test]
    fn test_session_counts_and_clears_slot() {
        let _guard = serial();
        let pipeline = add_pipeline();
        let add = TestFunction::user("add");

        let session = HookSession::begin(&pipeline, noop()).unwrap();
        assert!(session_active());
        assert!(pipeline.has_compile_hook());
        pipeline.launch(&add, &ARGS).unwrap();
        assert_eq!(session.kernel_count(), 1);

        assert_eq!(session.finish().unwrap(), 1);
        assert!(!session_active());
        assert!(!pipeline.has_compile_hook());
    }

    #[test]
    fn test_session_recompiles_cached_kernels() {
        let _guard = serial();
        let pipeline = add_pipeline();
        let add = TestFunction::user("add");
        pipeline.launch(&add, &ARGS).unwrap();

        with_introspection(&pipeline, noop(), || pipeline.launch(&add, &ARGS)).unwrap();
        assert_eq!(pipeline.stats().compilations, 2);
    }

    #[test]
    fn test_empty_session() {
        let _guard = serial();
        let pipeline = add_pipeline();

        let session = HookSession::begin(&pipeline, noop()).unwrap();
        assert!(matches!(session.finish(), Err(ReflectError::EmptyResult)));
        assert!(!pipeline.has_compile_hook());
        assert!(!session_active());
    }

    #[test]
    fn test_nested_session_conflict() {
        let _guard = serial();
        let pipeline = add_pipeline();
        let other = add_pipeline();
        let add = TestFunction::user("add");

        let session = HookSession::begin(&pipeline, noop()).unwrap();
        pipeline.launch(&add, &ARGS).unwrap();

        let nested = HookSession::begin(&other, noop());
        assert!(matches!(nested, Err(ReflectError::SessionConflict)));
        assert!(!other.has_compile_hook());

        // The outer session is untouched.
        assert!(pipeline.has_compile_hook());
        assert!(session_active());
        assert_eq!(session.kernel_count(), 1);
        assert_eq!(session.finish().unwrap(), 1);
    }

    #[test]
    fn test_callback_failure_takes_precedence() {
        let _guard = serial();
        let pipeline = add_pipeline();
        let add = TestFunction::user("add");
        let failing = compile_hook(|_: &TestPipeline, _: &PipelineEvent<TestPipeline>| {
            Err(ValidationError::NotAKernel.into())
        });

        let err = with_introspection(&pipeline, failing, || {
            let result = pipeline.launch(&add, &ARGS);
            // The pipeline only sees the marker error.
            assert!(matches!(
                result,
                Err(TestPipelineError::HookAborted(ReflectError::CallbackFailed))
            ));
            result
        })
        .unwrap_err();

        assert!(matches!(
            err,
            ReflectError::Validation(ValidationError::NotAKernel)
        ));
        assert!(!pipeline.has_compile_hook());
    }

    #[test]
    fn test_body_failure_is_evaluation_error() {
        let _guard = serial();
        let pipeline = add_pipeline();

        let err = with_introspection(&pipeline, noop(), || {
            pipeline.launch(&TestFunction::user("missing"), &ARGS)
        })
        .unwrap_err();

        assert!(matches!(err, ReflectError::Evaluation(_)));
        assert!(!session_active());
    }

    #[test]
    fn test_slot_cleared_on_panic() {
        let _guard = serial();
        let pipeline = add_pipeline();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = with_introspection(&pipeline, noop(), || -> Result<(), BoxError> {
                panic!("body panicked")
            });
        }));

        assert!(result.is_err());
        assert!(!pipeline.has_compile_hook());
        assert!(!session_active());
    }
}
