//! Password → user key → master key unlock protocol (spec.md §4.4).
//!
//! Grounded in the PBKDF2/AES stack declared (and used for the same
//! purpose) in the sibling example repos' manifests
//! (`hambosto-sweetbyte-rs` pairs `argon2`/`chacha20poly1305`/`sha2`;
//! this crate keeps the cheaper, spec-mandated PBKDF2-HMAC-SHA256 path
//! and reserves the Argon2id id without implementing it, per spec.md
//! §4.4's "a KDF-algorithm field allows Argon2id in future").

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use hmac::Hmac;
use pbkdf2::pbkdf2;
use sha2::Sha256;

use crate::algorithms::KdfAlgorithm;
use crate::error::{Error, Result};

/// `locked` / `unlocked` state plus the in-memory master key, encapsulated
/// per opened handle rather than in a process global (spec.md §9's
/// "Global mutable state" note).
pub struct KeyManager {
    enabled: bool,
    unlocked: bool,
    master_key: [u8; 32],
}

impl KeyManager {
    /// A non-encrypted filesystem has no key state at all; `unlocked`
    /// reports true so file I/O never takes the locked branch.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            unlocked: true,
            master_key: [0u8; 32],
        }
    }

    /// An encrypted filesystem just opened from disk: locked until
    /// `unlock` succeeds.
    pub fn locked() -> Self {
        Self {
            enabled: true,
            unlocked: false,
            master_key: [0u8; 32],
        }
    }

    /// An encrypted filesystem just formatted by its own creator: the
    /// creator is implicitly unlocked (spec.md §4.4).
    pub fn unlocked_with(master_key: [u8; 32]) -> Self {
        Self {
            enabled: true,
            unlocked: true,
            master_key,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Re-derives the master key from `password` every time it is called,
    /// even if already unlocked, so a wrong attempt can be corrected by a
    /// later correct one. A wrong password is never detected here: it
    /// derives *some* key and unwraps to garbage, which only shows up as
    /// garbled reads (spec.md §4.4/§7).
    pub fn unlock(
        &mut self,
        password: &str,
        kdf_algo: KdfAlgorithm,
        kdf_iterations: u32,
        salt: &[u8; 32],
        wrapped_master_key: &[u8; 32],
    ) -> Result<()> {
        if !matches!(kdf_algo, KdfAlgorithm::Pbkdf2) {
            return Err(Error::auth_failure(
                "Argon2id KDF is recognized but not implemented".to_string(),
            ));
        }
        let user_key = derive_user_key(password, salt, kdf_iterations);
        self.master_key = unwrap_master_key(&user_key, wrapped_master_key);
        self.unlocked = true;
        Ok(())
    }

    /// Zeros the in-memory key and returns to the locked state.
    pub fn lock(&mut self) {
        self.master_key = [0u8; 32];
        self.unlocked = false;
    }

    pub fn master_key(&self) -> Result<&[u8; 32]> {
        if self.enabled && !self.unlocked {
            return Err(Error::permission_denied(
                "filesystem is locked".to_string(),
            ));
        }
        Ok(&self.master_key)
    }
}

pub fn derive_user_key(password: &str, salt: &[u8; 32], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations.max(1), &mut out);
    out
}

/// Wraps a 32-byte master key under a 32-byte user key via AES-256-ECB
/// applied independently to each 16-byte half, per spec.md §4.4.
pub fn wrap_master_key(user_key: &[u8; 32], master_key: &[u8; 32]) -> [u8; 32] {
    ecb_transform(user_key, master_key, true)
}

pub fn unwrap_master_key(user_key: &[u8; 32], wrapped: &[u8; 32]) -> [u8; 32] {
    ecb_transform(user_key, wrapped, false)
}

fn ecb_transform(key: &[u8; 32], data: &[u8; 32], encrypt: bool) -> [u8; 32] {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut out = [0u8; 32];
    for half in 0..2 {
        let mut block = GenericArray::clone_from_slice(&data[half * 16..half * 16 + 16]);
        if encrypt {
            cipher.encrypt_block(&mut block);
        } else {
            cipher.decrypt_block(&mut block);
        }
        out[half * 16..half * 16 + 16].copy_from_slice(block.as_slice());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_unwrap_round_trips() {
        let user_key = [7u8; 32];
        let master_key = [9u8; 32];
        let wrapped = wrap_master_key(&user_key, &master_key);
        assert_ne!(wrapped, master_key);
        let unwrapped = unwrap_master_key(&user_key, &wrapped);
        assert_eq!(unwrapped, master_key);
    }

    #[test]
    fn wrong_password_unwraps_to_garbage() {
        let salt = [1u8; 32];
        let right_key = derive_user_key("correct horse", &salt, 1000);
        let wrong_key = derive_user_key("incorrect horse", &salt, 1000);
        let master_key = [42u8; 32];
        let wrapped = wrap_master_key(&right_key, &master_key);
        let recovered = unwrap_master_key(&wrong_key, &wrapped);
        assert_ne!(recovered, master_key);
    }

    #[test]
    fn disabled_manager_reports_unlocked() {
        let km = KeyManager::disabled();
        assert!(!km.is_enabled());
        assert!(km.is_unlocked());
        assert!(km.master_key().is_ok());
    }

    #[test]
    fn locked_manager_rejects_key_access() {
        let km = KeyManager::locked();
        assert!(km.is_enabled());
        assert!(!km.is_unlocked());
        assert!(km.master_key().is_err());
    }

    #[test]
    fn unlock_with_correct_password_succeeds() {
        let salt = [3u8; 32];
        let master_key = [5u8; 32];
        let user_key = derive_user_key("hunter2", &salt, 1000);
        let wrapped = wrap_master_key(&user_key, &master_key);

        let mut km = KeyManager::locked();
        km.unlock("hunter2", KdfAlgorithm::Pbkdf2, 1000, &salt, &wrapped)
            .unwrap();
        assert!(km.is_unlocked());
        assert_eq!(km.master_key().unwrap(), &master_key);
    }

    #[test]
    fn lock_zeros_the_key() {
        let salt = [3u8; 32];
        let master_key = [5u8; 32];
        let user_key = derive_user_key("hunter2", &salt, 1000);
        let wrapped = wrap_master_key(&user_key, &master_key);

        let mut km = KeyManager::locked();
        km.unlock("hunter2", KdfAlgorithm::Pbkdf2, 1000, &salt, &wrapped)
            .unwrap();
        km.lock();
        assert!(!km.is_unlocked());
        assert!(km.master_key().is_err());
    }
}
