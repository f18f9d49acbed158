//! AES-256-GCM sealing under a PBKDF2-derived key.
//!
//! Sealed format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! Opening fails closed: a short buffer, a flipped bit or a wrong key all
//! return an error and no plaintext.

use std::fmt;
use std::num::NonZeroU32;

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{VaultError, VaultResult};
use crate::providers::ProviderCredentials;

const KEY_LEN: usize = 32;

/// A versioned symmetric key.
pub struct VaultKey {
    id: String,
    key: LessSafeKey,
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultKey").field("id", &self.id).finish_non_exhaustive()
    }
}

impl VaultKey {
    /// Stretch `master_secret` into an AES-256 key with PBKDF2-HMAC-SHA256.
    pub fn derive(
        id: impl Into<String>,
        master_secret: &str,
        salt: &[u8],
        iterations: u32,
    ) -> VaultResult<Self> {
        if master_secret.is_empty() {
            return Err(VaultError::EmptyMasterSecret);
        }
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| VaultError::InvalidKeyParameters("iterations must be positive".into()))?;

        let mut raw = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            master_secret.as_bytes(),
            &mut raw[..],
        );
        let unbound = UnboundKey::new(&AES_256_GCM, &raw[..])
            .map_err(|_| VaultError::InvalidKeyParameters("bad key length".into()))?;

        Ok(Self {
            id: id.into(),
            key: LessSafeKey::new(unbound),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Seal raw bytes with a fresh random nonce.
    pub fn seal(&self, rng: &dyn SecureRandom, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes).map_err(|_| VaultError::Encrypt)?;

        let mut body = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut body)
            .map_err(|_| VaultError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + body.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&body);
        Ok(sealed)
    }

    /// Open a sealed buffer. The returned plaintext is wiped on drop.
    pub fn open(&self, sealed: &[u8]) -> VaultResult<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(VaultError::Truncated);
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| VaultError::Truncated)?;

        let mut buf = Zeroizing::new(body.to_vec());
        let plain_len = self
            .key
            .open_in_place(nonce, Aad::empty(), buf.as_mut_slice())
            .map_err(|_| VaultError::AuthenticationFailed)?
            .len();
        buf.truncate(plain_len);
        Ok(buf)
    }

    /// Serialize and seal validated credentials.
    pub fn encrypt(&self, rng: &dyn SecureRandom, creds: &ProviderCredentials) -> VaultResult<Vec<u8>> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(creds).map_err(|_| VaultError::MalformedPlaintext)?,
        );
        self.seal(rng, &plaintext)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> VaultResult<ProviderCredentials> {
        let plaintext = self.open(sealed)?;
        serde_json::from_slice(&plaintext).map_err(|_| VaultError::MalformedPlaintext)
    }
}

/// Re-seal `ciphertext` from `old` to `new`. The intermediate plaintext
/// lives only in a zeroized buffer.
pub fn rotate_key(old: &VaultKey, new: &VaultKey, ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
    let plaintext = old.open(ciphertext)?;
    new.seal(&SystemRandom::new(), &plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SALT: &[u8] = b"test-salt";

    fn key(id: &str, secret: &str) -> VaultKey {
        VaultKey::derive(id, secret, SALT, 1_000).unwrap()
    }

    fn sample() -> ProviderCredentials {
        ProviderCredentials::parse(
            "aws",
            json!({"access_key_id": "AKIA", "secret_access_key": "s3cr3t"}),
        )
        .unwrap()
    }

    #[test]
    fn seal_and_open() {
        let k = key("v1", "master");
        let rng = SystemRandom::new();
        let sealed = k.seal(&rng, b"hello").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 5 + 16);
        assert_eq!(k.open(&sealed).unwrap().as_slice(), b"hello");
    }

    #[test]
    fn nonces_are_fresh() {
        let k = key("v1", "master");
        let rng = SystemRandom::new();
        let a = k.seal(&rng, b"same").unwrap();
        let b = k.seal(&rng, b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn every_bit_flip_fails_closed() {
        let k = key("v1", "master");
        let sealed = k.encrypt(&SystemRandom::new(), &sample()).unwrap();
        for byte in 0..sealed.len() {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered[byte] ^= 1 << bit;
                assert!(k.decrypt(&tampered).is_err(), "flip at {byte}:{bit} was accepted");
            }
        }
    }

    #[test]
    fn truncation_fails_closed() {
        let k = key("v1", "master");
        let sealed = k.seal(&SystemRandom::new(), b"payload").unwrap();
        assert!(matches!(k.open(&sealed[..NONCE_LEN + 3]), Err(VaultError::Truncated)));
        assert!(matches!(k.open(&[]), Err(VaultError::Truncated)));
        assert!(matches!(
            k.open(&sealed[..sealed.len() - 1]),
            Err(VaultError::AuthenticationFailed)
        ));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = key("v1", "master").encrypt(&SystemRandom::new(), &sample()).unwrap();
        let err = key("v1", "other").decrypt(&sealed).unwrap_err();
        assert!(matches!(err, VaultError::AuthenticationFailed));
    }

    #[test]
    fn rotation_moves_ciphertext_to_new_key() {
        let old = key("v1", "old-master");
        let new = key("v2", "new-master");
        let sealed = old.encrypt(&SystemRandom::new(), &sample()).unwrap();

        let rotated = rotate_key(&old, &new, &sealed).unwrap();
        assert_eq!(new.decrypt(&rotated).unwrap(), sample());
        assert!(old.decrypt(&rotated).is_err());
    }

    #[test]
    fn rejects_empty_secret_and_zero_iterations() {
        assert!(matches!(
            VaultKey::derive("v1", "", SALT, 10),
            Err(VaultError::EmptyMasterSecret)
        ));
        assert!(matches!(
            VaultKey::derive("v1", "m", SALT, 0),
            Err(VaultError::InvalidKeyParameters(_))
        ));
    }

    #[test]
    fn debug_shows_only_id() {
        assert_eq!(format!("{:?}", key("v7", "m")), "VaultKey { id: \"v7\", .. }");
    }
}
