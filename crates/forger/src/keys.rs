//! Encrypted delegate passphrases.
//!
//! Passphrases rest encrypted with AES-256-GCM under a key derived from the
//! operator password and a per-delegate salt. Decryption happens only on
//! `update_forging_status`; the resulting keypair lives in the forger's
//! memory and is wiped when forging is disabled.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use forgeline_types::Address;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors around delegate key material.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Delegate {0} is not configured on this node")]
    UnknownDelegate(Address),

    #[error("Password does not decrypt the passphrase of delegate {0}")]
    WrongPassword(Address),

    #[error("Decrypted passphrase does not derive the configured address {0}")]
    AddressMismatch(Address),

    #[error("Hash onion layer {index} at or below the highest used index {used}")]
    OnionLayerUsed { index: u32, used: u32 },

    #[error("Hash onion exhausted for delegate {0}")]
    OnionExhausted(Address),
}

/// An AES-256-GCM encrypted passphrase.
///
/// The ciphertext carries the GCM authentication tag, so a wrong password
/// fails decryption instead of yielding garbage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPassphrase {
    pub salt: [u8; 16],
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

fn derive_key(password: &str, salt: &[u8; 16]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    hasher.finalize().into()
}

impl EncryptedPassphrase {
    /// Encrypt a passphrase under a password with fresh salt and nonce.
    pub fn encrypt(passphrase: &str, password: &str) -> Self {
        let mut salt = [0u8; 16];
        let mut nonce = [0u8; 12];
        rand::Rng::fill(&mut rand::thread_rng(), &mut salt);
        rand::Rng::fill(&mut rand::thread_rng(), &mut nonce);

        let key = derive_key(password, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), passphrase.as_bytes())
            .expect("AES-GCM encryption over in-memory buffers cannot fail");
        Self { salt, nonce, ciphertext }
    }

    /// Decrypt with the operator password.
    pub fn decrypt(&self, password: &str, delegate: Address) -> Result<String, KeyError> {
        let key = derive_key(password, &self.salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_ref())
            .map_err(|_| KeyError::WrongPassword(delegate))?;
        String::from_utf8(plaintext).map_err(|_| KeyError::WrongPassword(delegate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeline_types::test_utils::test_address;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let encrypted = EncryptedPassphrase::encrypt("robust canvas lobster", "hunter2");
        let decrypted = encrypted.decrypt("hunter2", test_address(1)).unwrap();
        assert_eq!(decrypted, "robust canvas lobster");
    }

    #[test]
    fn wrong_password_is_rejected() {
        let encrypted = EncryptedPassphrase::encrypt("robust canvas lobster", "hunter2");
        assert_eq!(
            encrypted.decrypt("hunter3", test_address(1)),
            Err(KeyError::WrongPassword(test_address(1)))
        );
    }

    #[test]
    fn fresh_salt_and_nonce_per_encryption() {
        let a = EncryptedPassphrase::encrypt("same passphrase", "same password");
        let b = EncryptedPassphrase::encrypt("same passphrase", "same password");
        assert_ne!(a, b);
    }
}
