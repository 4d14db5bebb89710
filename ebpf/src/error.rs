//! Loader error types

use crate::linker::LinkError;
use bpf_asm::AsmError;
use bpf_features::UnsupportedFeature;
use bpf_sys::Errno;
use thiserror::Error;

/// Why an operation is not available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotSupported {
    /// A feature test found the feature missing
    #[error(transparent)]
    Feature(#[from] UnsupportedFeature),

    /// The kernel answered with its internal `ENOTSUPP`
    #[error("operation not supported by the kernel: {0}")]
    Kernel(Errno),
}

/// Errors that can occur when linking, loading or probing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The feature or operation is missing from the running kernel
    #[error("{0}")]
    NotSupported(NotSupported),

    /// The requested map element does not exist
    #[error("entry not found: {0}")]
    EntryNotFound(Errno),

    /// A map element that must not exist already does
    #[error("entry already exists: {0}")]
    EntryAlreadyExists(Errno),

    /// The key or batch is too large for the map
    #[error("key too big for map: {0}")]
    KeyTooBig(Errno),

    /// Linking failed
    #[error("link failed: {0}")]
    Link(#[from] LinkError),

    /// Encoding bytecode failed
    #[error("encoding failed: {0}")]
    Asm(#[from] AsmError),

    /// A feature test could not decide
    #[error("can't detect support for {feature}: {source}")]
    FeatureProbe {
        feature: &'static str,
        source: Box<Error>,
    },

    /// The license string contains a NUL byte
    #[error("invalid license {0:?}")]
    InvalidLicense(String),

    /// A program is not part of the collection
    #[error("unknown program: {0}")]
    UnknownProgram(String),

    /// Any other kernel error, unchanged
    #[error("kernel request failed: {0}")]
    Sys(Errno),
}

impl Error {
    /// Returns the raw error code behind this error, if there is one
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::NotSupported(NotSupported::Kernel(errno))
            | Error::EntryNotFound(errno)
            | Error::EntryAlreadyExists(errno)
            | Error::KeyTooBig(errno)
            | Error::Sys(errno) => Some(*errno),
            Error::FeatureProbe { source, .. } => source.errno(),
            _ => None,
        }
    }

    /// Whether the operation failed because the kernel lacks something
    ///
    /// Callers use this to fall back to an older way of doing things.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported(_))
    }
}

impl From<UnsupportedFeature> for Error {
    fn from(feature: UnsupportedFeature) -> Self {
        Error::NotSupported(NotSupported::Feature(feature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_is_preserved() {
        assert_eq!(Error::KeyTooBig(Errno::E2BIG).errno(), Some(Errno::E2BIG));
        assert_eq!(Error::UnknownProgram("x".into()).errno(), None);

        let probe = Error::FeatureProbe {
            feature: "map batch api",
            source: Box::new(Error::Sys(Errno::ENOMEM)),
        };
        assert_eq!(probe.errno(), Some(Errno::ENOMEM));
        assert!(!probe.is_not_supported());
    }

    #[test]
    fn test_feature_error_message() {
        let err = Error::from(UnsupportedFeature {
            name: "inner maps",
            minimum_version: "5.10",
        });
        assert!(err.is_not_supported());
        assert_eq!(err.errno(), None);
        assert_eq!(err.to_string(), "inner maps not supported (requires >= 5.10)");
    }

    #[test]
    fn test_probe_error_message() {
        let err = Error::FeatureProbe {
            feature: "object names",
            source: Box::new(Error::Sys(Errno::EPERM)),
        };
        assert_eq!(
            err.to_string(),
            "can't detect support for object names: kernel request failed: \
             operation not permitted (errno 1)"
        );
    }
}
