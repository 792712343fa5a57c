use std::fmt;
use std::io;

/// Errors raised by the codec engine.
#[derive(Debug)]
pub enum CodecError {
    /// Key material does not match the cipher suite's key length.
    KeyLengthMismatch { expected: usize, actual: usize },
    /// Page size and reserved bytes are incompatible with the cipher suite.
    InvalidPageGeometry {
        page_size: usize,
        reserved: usize,
        reason: &'static str,
    },
    /// Tag verification failed on decrypt: wrong key, corruption or tampering.
    AuthenticationFailure { page: u32 },
    /// Bad key derivation input or parameters.
    DerivationFailure(String),
    /// Rekey migration failed; the original key is still in force.
    RekeyAborted {
        page: Option<u32>,
        source: Box<CodecError>,
    },
    UnknownCipher(String),
    InvalidHeader(String),
    PageSizeMismatch { expected: usize, actual: usize },
    InvalidPageNumber(u32),
    /// The codec context was already freed.
    Released,
    /// No codec is attached to the pager.
    NoCodec,
    /// A rekey was cancelled through its abort handle.
    Cancelled,
    /// The OS random generator is unavailable.
    Entropy,
    InvalidConfig(String),
    Io(io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::KeyLengthMismatch { expected, actual } => {
                write!(f, "key length mismatch: expected {expected} bytes, got {actual}")
            }
            CodecError::InvalidPageGeometry {
                page_size,
                reserved,
                reason,
            } => write!(
                f,
                "invalid page geometry (page size {page_size}, reserved {reserved}): {reason}"
            ),
            CodecError::AuthenticationFailure { page } => {
                write!(f, "authentication failed on page {page}: wrong key or corrupted data")
            }
            CodecError::DerivationFailure(msg) => write!(f, "key derivation failed: {msg}"),
            CodecError::RekeyAborted {
                page: Some(page),
                source,
            } => write!(f, "rekey aborted at page {page}: {source}"),
            CodecError::RekeyAborted { page: None, source } => {
                write!(f, "rekey aborted: {source}")
            }
            CodecError::UnknownCipher(name) => write!(f, "unknown cipher suite '{name}'"),
            CodecError::InvalidHeader(msg) => write!(f, "invalid codec header: {msg}"),
            CodecError::PageSizeMismatch { expected, actual } => {
                write!(f, "page buffer is {actual} bytes, expected {expected}")
            }
            CodecError::InvalidPageNumber(n) => write!(f, "invalid page number {n}"),
            CodecError::Released => f.write_str("codec context already released"),
            CodecError::NoCodec => f.write_str("no codec attached"),
            CodecError::Cancelled => f.write_str("cancelled"),
            CodecError::Entropy => f.write_str("OS random generator unavailable"),
            CodecError::InvalidConfig(msg) => write!(f, "invalid codec configuration: {msg}"),
            CodecError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::RekeyAborted { source, .. } => Some(source.as_ref()),
            CodecError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

pub type Result<T, E = CodecError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn rekey_aborted_exposes_cause() {
        let err = CodecError::RekeyAborted {
            page: Some(7),
            source: Box::new(CodecError::AuthenticationFailure { page: 7 }),
        };
        assert_eq!(
            err.to_string(),
            "rekey aborted at page 7: authentication failed on page 7: wrong key or corrupted data"
        );
        assert!(matches!(
            err.source()
                .and_then(|e| e.downcast_ref::<CodecError>()),
            Some(CodecError::AuthenticationFailure { page: 7 })
        ));
    }

    #[test]
    fn io_errors_convert() {
        let err: CodecError = io::Error::new(io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, CodecError::Io(_)));
        assert!(err.to_string().contains("disk gone"));
    }
}
