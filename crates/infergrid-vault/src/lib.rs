//! infergrid-vault: per-tenant cloud credentials, sealed at rest.
//!
//! # Architecture
//!
//! ```text
//!   JSON credentials ─> ProviderCredentials::parse (schema check)
//!                              │
//!                              ▼
//!   master secret ─PBKDF2─> VaultKey ──AES-256-GCM──> nonce || ct || tag
//!                              ▲                            │
//!                     Vault key ring (active + retired)     ▼
//!                                                      StateStore
//! ```
//!
//! Plaintext exists only in `Zeroizing` buffers during seal/open and is
//! never written to the store or to logs.

pub mod cipher;
pub mod error;
pub mod providers;
pub mod vault;

pub use cipher::{VaultKey, rotate_key};
pub use error::{VaultError, VaultResult};
pub use providers::{Provider, ProviderCredentials};
pub use vault::{CredentialMetadata, CredentialService, RotationReport, Vault};
