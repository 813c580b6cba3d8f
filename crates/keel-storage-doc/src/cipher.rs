//! Passphrase-derived field cipher
//!
//! Turns pre-hashed passphrase material into a reusable AES-256-CTR key bound
//! to one installation identity, and ciphers/deciphers individual string
//! values. While no key is set every operation is a pass-through, so callers
//! never special-case the encryption state.

use std::sync::Arc;

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// AES-256 in counter mode with a big-endian 128-bit counter.
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Required length of the passphrase key material, in bytes.
pub const KEY_MATERIAL_LEN: usize = 64;

/// Length of the derived AES key, in bytes.
const KEY_LEN: usize = 32;

/// Length of the hex identity tag appended to every plaintext, in bytes.
const IDENTITY_TAG_LEN: usize = 64;

/// Fixed counter seed. Reproducible on purpose: the same key and plaintext
/// must produce the same ciphertext so a rebuild round trip is stable.
const COUNTER_SEED: u128 = 5;

/// Shared, mutable cipher context injected into each store at construction.
pub type SharedCipher = Arc<RwLock<PassphraseCipher>>;

/// Stateful symmetric-encryption helper bound to one installation identity.
pub struct PassphraseCipher {
    identity_tag: String,
    key: Zeroizing<[u8; KEY_LEN]>,
    active: bool,
}

impl PassphraseCipher {
    /// Create a cipher for the given stable installation identifier.
    ///
    /// The identity tag is a keyed hash of the identifier and stays constant
    /// for the installation's life. Fails with [`Error::IdentityMissing`] when
    /// the identifier is absent or empty.
    pub fn new(installation_id: Option<&str>) -> Result<Self> {
        let id = match installation_id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(Error::IdentityMissing),
        };

        let mac = Hmac::<Sha256>::new_from_slice(id.as_bytes())
            .map_err(|e| Error::Storage(format!("identity tag derivation failed: {e}")))?;
        let identity_tag = hex::encode(mac.finalize().into_bytes());

        Ok(Self {
            identity_tag,
            key: Zeroizing::new([0u8; KEY_LEN]),
            active: false,
        })
    }

    /// Wrap a cipher in the shared handle stores expect.
    pub fn into_shared(self) -> SharedCipher {
        Arc::new(RwLock::new(self))
    }

    /// Set or clear the active key.
    ///
    /// `None` or empty material clears the key and disables encryption; that
    /// is pass-through mode, not an error. Otherwise the material must be
    /// exactly [`KEY_MATERIAL_LEN`] bytes and its trailing 32 bytes become the
    /// active key.
    pub fn set_key_material(&mut self, material: Option<&str>) -> Result<()> {
        let material = match material {
            Some(m) if !m.is_empty() => m,
            _ => {
                self.destroy();
                return Ok(());
            }
        };

        let bytes = material.as_bytes();
        if bytes.len() != KEY_MATERIAL_LEN {
            return Err(Error::InvalidKeyLength(bytes.len()));
        }

        self.key.copy_from_slice(&bytes[KEY_MATERIAL_LEN - KEY_LEN..]);
        self.active = true;
        Ok(())
    }

    /// Whether a key is currently set.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Identity tag of this installation (64 hex characters).
    pub fn identity_tag(&self) -> &str {
        &self.identity_tag
    }

    /// A cipher with the same identity tag but independent key material.
    ///
    /// Key rotation holds one fork per key epoch while records stream through
    /// a rebuild.
    pub fn fork(&self, material: Option<&str>) -> Result<Self> {
        let mut forked = Self {
            identity_tag: self.identity_tag.clone(),
            key: Zeroizing::new([0u8; KEY_LEN]),
            active: false,
        };
        forked.set_key_material(material)?;
        Ok(forked)
    }

    /// Encrypt a single string value.
    ///
    /// With no active key the input is returned unchanged. Otherwise the
    /// identity tag is appended and the concatenation enciphered under the
    /// active key; the result is hex.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if !self.active {
            return Ok(plaintext.to_owned());
        }

        let mut data = Vec::with_capacity(plaintext.len() + IDENTITY_TAG_LEN);
        data.extend_from_slice(plaintext.as_bytes());
        data.extend_from_slice(self.identity_tag.as_bytes());
        self.apply_keystream(&mut data);
        Ok(hex::encode(data))
    }

    /// Decrypt a single string value.
    ///
    /// With no active key the input is returned unchanged. Otherwise the hex
    /// ciphertext is deciphered and its trailing identity tag verified; any
    /// mismatch fails with [`Error::DecryptionFailed`]. The tag check is the
    /// only integrity check: tampering that preserves the tag bytes is not
    /// detectable here.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        if !self.active {
            return Ok(ciphertext.to_owned());
        }

        let mut data = hex::decode(ciphertext).map_err(|_| Error::DecryptionFailed)?;
        self.apply_keystream(&mut data);
        let text = String::from_utf8(data).map_err(|_| Error::DecryptionFailed)?;

        if text.len() < IDENTITY_TAG_LEN || !text.is_char_boundary(text.len() - IDENTITY_TAG_LEN) {
            return Err(Error::DecryptionFailed);
        }
        let (plaintext, tag) = text.split_at(text.len() - IDENTITY_TAG_LEN);
        if tag != self.identity_tag {
            return Err(Error::DecryptionFailed);
        }
        Ok(plaintext.to_owned())
    }

    /// Zero the key material and disable encryption. Idempotent.
    pub fn destroy(&mut self) {
        self.key.fill(0);
        self.active = false;
    }

    fn apply_keystream(&self, data: &mut [u8]) {
        let seed: [u8; 16] = COUNTER_SEED.to_be_bytes();
        let mut cipher = Aes256Ctr::new(self.key.as_ref().into(), &seed.into());
        cipher.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MATERIAL_A: &str =
        "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa0123456789abcdef0123456789abcdef";
    const MATERIAL_B: &str =
        "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbfedcba9876543210fedcba9876543210";

    fn cipher_with(material: &str) -> PassphraseCipher {
        let mut cipher = PassphraseCipher::new(Some("install-1")).unwrap();
        cipher.set_key_material(Some(material)).unwrap();
        cipher
    }

    #[test]
    fn test_missing_identity_rejected() {
        assert!(matches!(
            PassphraseCipher::new(None),
            Err(Error::IdentityMissing)
        ));
        assert!(matches!(
            PassphraseCipher::new(Some("")),
            Err(Error::IdentityMissing)
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        let mut cipher = PassphraseCipher::new(Some("install-1")).unwrap();
        assert!(matches!(
            cipher.set_key_material(Some("short")),
            Err(Error::InvalidKeyLength(5))
        ));
        assert!(!cipher.is_active());
    }

    #[test]
    fn test_empty_material_clears_key() {
        let mut cipher = cipher_with(MATERIAL_A);
        assert!(cipher.is_active());
        cipher.set_key_material(None).unwrap();
        assert!(!cipher.is_active());
    }

    #[test]
    fn test_roundtrip() {
        let cipher = cipher_with(MATERIAL_A);
        let ciphertext = cipher.encrypt("xpub6DTest").unwrap();
        assert_ne!(ciphertext, "xpub6DTest");
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), "xpub6DTest");
    }

    #[test]
    fn test_empty_string_roundtrip() {
        // Tag-only ciphertext: the split lands at offset zero and the full
        // tag is still verified.
        let cipher = cipher_with(MATERIAL_A);
        let ciphertext = cipher.encrypt("").unwrap();
        assert_eq!(ciphertext.len(), IDENTITY_TAG_LEN * 2);
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), "");
    }

    #[test]
    fn test_passthrough_without_key() {
        let cipher = PassphraseCipher::new(Some("install-1")).unwrap();
        assert_eq!(cipher.encrypt("plain").unwrap(), "plain");
        assert_eq!(cipher.decrypt("plain").unwrap(), "plain");
    }

    #[test]
    fn test_wrong_installation_rejected() {
        let cipher_a = cipher_with(MATERIAL_A);
        let mut cipher_b = PassphraseCipher::new(Some("install-2")).unwrap();
        cipher_b.set_key_material(Some(MATERIAL_A)).unwrap();

        let ciphertext = cipher_a.encrypt("secret").unwrap();
        assert!(matches!(
            cipher_b.decrypt(&ciphertext),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let cipher_a = cipher_with(MATERIAL_A);
        let cipher_b = cipher_with(MATERIAL_B);

        let ciphertext = cipher_a.encrypt("secret").unwrap();
        assert!(matches!(
            cipher_b.decrypt(&ciphertext),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tag_tampering_detected() {
        let cipher = cipher_with(MATERIAL_A);
        let ciphertext = cipher.encrypt("secret").unwrap();

        // Corrupt the region carrying the identity tag (the trailing bytes).
        let mut bytes = hex::decode(&ciphertext).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = hex::encode(bytes);

        assert!(matches!(
            cipher.decrypt(&tampered),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_body_tampering_not_detected() {
        // The trailing tag is the only integrity check; a bit flip in the
        // body region survives decryption with garbled plaintext.
        let cipher = cipher_with(MATERIAL_A);
        let ciphertext = cipher.encrypt("1234567890").unwrap();

        let mut bytes = hex::decode(&ciphertext).unwrap();
        bytes[0] ^= 0x01;
        let tampered = hex::encode(bytes);

        let garbled = cipher.decrypt(&tampered).unwrap();
        assert_ne!(garbled, "1234567890");
        assert_eq!(garbled.len(), "1234567890".len());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut cipher = cipher_with(MATERIAL_A);
        cipher.destroy();
        cipher.destroy();
        assert!(!cipher.is_active());
        assert_eq!(cipher.encrypt("plain").unwrap(), "plain");
    }

    #[test]
    fn test_fork_shares_identity() {
        let cipher = cipher_with(MATERIAL_A);
        let fork = cipher.fork(Some(MATERIAL_A)).unwrap();
        let ciphertext = cipher.encrypt("secret").unwrap();
        assert_eq!(fork.decrypt(&ciphertext).unwrap(), "secret");

        let inactive = cipher.fork(None).unwrap();
        assert!(!inactive.is_active());
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_string(s in "\\PC*") {
            let cipher = cipher_with(MATERIAL_A);
            let ciphertext = cipher.encrypt(&s).unwrap();
            prop_assert_eq!(cipher.decrypt(&ciphertext).unwrap(), s);
        }
    }
}
