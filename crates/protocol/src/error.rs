use thiserror::Error;

/// Errors produced by the protocol types library.
#[derive(Debug, Error)]
pub enum Error {
    /// Byte buffer does not have the expected length.
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected number of bytes.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// Error decoding a hexadecimal string.
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}
