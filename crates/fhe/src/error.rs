//! Error types for encrypted operations.

use clearing_types::{FheType, Handle};
use thiserror::Error;

/// Errors that can occur while operating on ciphertext handles.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FheError {
    #[error("Unknown ciphertext handle {0}")]
    UnknownHandle(Handle),

    #[error("Type mismatch for handle {handle}: expected {expected:?}, got {got:?}")]
    TypeMismatch {
        handle: Handle,
        expected: FheType,
        got: FheType,
    },

    #[error("Input proof does not match inputs, contract or sender")]
    InvalidInputProof,

    #[error("Handle {0} is not marked for public decryption")]
    NotDecryptable(Handle),

    #[error("Account is not allowed to view handle {0}")]
    AccessDenied(Handle),
}
