//! ## NI framing and SAP-style application-server protocol headers
//!
//! Every message on the wire is preceded by a 4-byte big-endian length of
//! the payload that follows ("NI framing"). This crate decodes that outer
//! frame and the router/dispatcher/admin headers carried inside it. It does
//! not attempt to be a faithful, complete implementation of the real SAP
//! wire formats -- only the fields the honeypot needs to classify and
//! respond to a message.

pub mod dispatcher;
pub mod niframe;
pub mod router;

use std::array::TryFromSliceError;
use std::str::Utf8Error;

#[derive(Debug)]
pub enum Error {
    Truncated,
    FrameTooLarge { len: usize, max: usize },
    InvalidHeader,
    UnknownOpcode(u8),
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated message"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame length {len} exceeds maximum {max}")
            }
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
            Self::Utf8Error(e) => write!(f, "{e}"),
            Self::TryFromSliceError(e) => write!(f, "{e}"),
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// Default maximum frame length, matching the upstream protocol's historic
/// limit.
pub const DEFAULT_MAX_FRAME: usize = 65_535;

/// Generate a context id: 32 uppercase hex characters from a cryptographic
/// RNG.
pub fn generate_context_id() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);

    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_id_shape() {
        let id = generate_context_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn context_id_varies() {
        let a = generate_context_id();
        let b = generate_context_id();
        assert_ne!(a, b);
    }
}
