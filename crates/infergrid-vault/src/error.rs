//! Error types for the credential vault.
//!
//! Messages never carry plaintext or key material.

use infergrid_state::StateError;
use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("unsupported provider: {0}")]
    UnknownProvider(String),

    #[error("{provider} credentials missing required fields: {}", fields.join(", "))]
    MissingFields {
        provider: &'static str,
        fields: Vec<&'static str>,
    },

    #[error("invalid {provider} credentials: {reason}")]
    InvalidCredentials {
        provider: &'static str,
        reason: String,
    },

    #[error("master secret must not be empty")]
    EmptyMasterSecret,

    #[error("invalid key parameters: {0}")]
    InvalidKeyParameters(String),

    #[error("no key registered with id {0:?}")]
    UnknownKey(String),

    #[error("ciphertext too short")]
    Truncated,

    #[error("ciphertext failed authentication")]
    AuthenticationFailed,

    #[error("encryption failed")]
    Encrypt,

    #[error("decrypted payload is malformed")]
    MalformedPlaintext,

    #[error(transparent)]
    Store(#[from] StateError),
}

impl VaultError {
    /// Errors caused by the submitted credentials rather than the vault.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            VaultError::UnknownProvider(_)
                | VaultError::MissingFields { .. }
                | VaultError::InvalidCredentials { .. }
        )
    }
}
