//! Compile-target validation.
//!
//! Runs before any stage touches the pipeline. A concrete signature must
//! dispatch to exactly one method; a signature containing abstract types may
//! match several (the lowered and typed stages report all of them). Kernels
//! must not return a value.

use super::adaptor::{CompilerPipeline, PipelineTarget};
use super::error::ValidationError;

/// Check that `target` is a legal compile target.
pub fn validate<P: CompilerPipeline>(
    pipeline: &P,
    target: &PipelineTarget<P>,
    kernel: bool,
) -> Result<(), ValidationError> {
    let methods = pipeline.lookup_methods(target);
    let function = || target.function().to_string();
    let signature = || target.types_string();

    if methods.is_empty() {
        return Err(ValidationError::NoMatchingMethod {
            function: function(),
            signature: signature(),
        });
    }

    let concrete = target.arg_types().iter().all(|ty| pipeline.is_concrete(ty));
    if concrete && methods.len() > 1 {
        return Err(ValidationError::AmbiguousMethod {
            function: function(),
            signature: signature(),
            count: methods.len(),
        });
    }

    if kernel {
        if let Some(return_type) = methods.iter().find_map(|m| m.return_type.as_ref()) {
            return Err(ValidationError::KernelReturnsValue {
                function: function(),
                signature: signature(),
                return_type: return_type.to_string(),
            });
        }
    }

    log::trace!("Validated {} (kernel: {})", target, kernel);
    Ok(())
}
