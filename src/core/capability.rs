//! Target capability (compute capability) values and their resolution.
//!
//! A [`Capability`] is a `major.minor` pair naming a GPU hardware generation.
//! When the caller does not pick one explicitly, [`resolve_capability`] asks
//! the pipeline for the active device and falls back to the lowest capability
//! the pipeline can target when no device context is active.

use std::fmt;
use std::str::FromStr;

use super::adaptor::CompilerPipeline;
use super::error::{ReflectError, ReflectResult};

/// Hardware-family prefix of toolchain target identifiers.
pub const TARGET_PREFIX: &str = "sm_";

/// Compute capability of a target device.
///
/// Ordered lexicographically by `(major, minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capability {
    pub major: u32,
    pub minor: u32,
}

impl Capability {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Toolchain target identifier, e.g. `sm_75` for capability 7.5.
    pub fn target_id(&self) -> String {
        format!("{}{}{}", TARGET_PREFIX, self.major, self.minor)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Error returned when a capability string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid capability `{0}`; expected `7.5`, `75` or `sm_75`")]
pub struct ParseCapabilityError(String);

impl FromStr for Capability {
    type Err = ParseCapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseCapabilityError(s.to_string());
        let text = s.trim();
        let text = text.strip_prefix(TARGET_PREFIX).unwrap_or(text);

        let (major, minor) = match text.split_once('.') {
            Some((major, minor)) => (major, minor),
            // `75` style: the last digit is the minor revision.
            None if text.len() >= 2 && text.bytes().all(|b| b.is_ascii_digit()) => {
                text.split_at(text.len() - 1)
            }
            None => return Err(err()),
        };

        let major = major.parse::<u32>().map_err(|_| err())?;
        let minor = minor.parse::<u32>().map_err(|_| err())?;
        Ok(Capability::new(major, minor))
    }
}

/// Lowest capability in `supported`, used when no device context is active.
pub fn fallback_capability(supported: &[Capability]) -> Option<Capability> {
    supported.iter().copied().min()
}

/// Capability to compile for when the caller did not pick one.
///
/// Returns the active device's capability, or the fallback capability if the
/// runtime has no active device context.
pub fn resolve_capability<P: CompilerPipeline>(pipeline: &P) -> ReflectResult<Capability> {
    if let Some(cap) = pipeline.active_device_capability() {
        log::debug!("Using capability {} of the active device", cap);
        return Ok(cap);
    }

    let cap = fallback_capability(pipeline.supported_capabilities())
        .ok_or(ReflectError::NoCapabilities)?;
    log::debug!("No active device context, falling back to capability {}", cap);
    Ok(cap)
}

/// The explicit override if given, otherwise [`resolve_capability`].
pub(crate) fn capability_or_resolve<P: CompilerPipeline>(
    pipeline: &P,
    requested: Option<Capability>,
) -> ReflectResult<Capability> {
    match requested {
        Some(cap) => Ok(cap),
        None => resolve_capability(pipeline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pipeline::TestPipeline;

    #[test]
    fn test_ordering() {
        assert!(Capability::new(7, 5) > Capability::new(7, 0));
        assert!(Capability::new(8, 0) > Capability::new(7, 5));
        assert!(Capability::new(3, 5) < Capability::new(5, 0));
    }

    #[test]
    fn test_target_id() {
        assert_eq!(Capability::new(7, 5).target_id(), "sm_75");
        assert_eq!(Capability::new(9, 0).target_id(), "sm_90");
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!("7.5".parse::<Capability>(), Ok(Capability::new(7, 5)));
        assert_eq!("86".parse::<Capability>(), Ok(Capability::new(8, 6)));
        assert_eq!("sm_70".parse::<Capability>(), Ok(Capability::new(7, 0)));
        assert_eq!("sm_100".parse::<Capability>(), Ok(Capability::new(10, 0)));
        assert!("7".parse::<Capability>().is_err());
        assert!("sm_x5".parse::<Capability>().is_err());
        assert!("".parse::<Capability>().is_err());
        assert!("7é".parse::<Capability>().is_err());
        assert!("sm_8€".parse::<Capability>().is_err());
    }

    #[test]
    fn test_fallback_is_minimum() {
        let supported = [
            Capability::new(7, 0),
            Capability::new(5, 0),
            Capability::new(6, 1),
        ];
        assert_eq!(fallback_capability(&supported), Some(Capability::new(5, 0)));
        assert_eq!(fallback_capability(&[]), None);
    }

    #[test]
    fn test_resolve_prefers_active_device() {
        let pipeline = TestPipeline::new();
        assert_eq!(resolve_capability(&pipeline).unwrap(), Capability::new(3, 5));

        pipeline.set_active_device(Some(Capability::new(8, 6)));
        assert_eq!(resolve_capability(&pipeline).unwrap(), Capability::new(8, 6));
        assert_eq!(
            capability_or_resolve(&pipeline, Some(Capability::new(7, 0))).unwrap(),
            Capability::new(7, 0)
        );
    }

    #[test]
    fn test_resolve_without_capabilities() {
        let pipeline = TestPipeline::new().with_supported(Vec::new());
        assert!(matches!(
            resolve_capability(&pipeline),
            Err(ReflectError::NoCapabilities)
        ));
    }
}
