use super::error::VaultError;
use super::types::{IV_LEN, Iv};
use aes::Aes256;
use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHasher, SaltString},
};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use secrecy::{ExposeSecret, SecretBox};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

// Plaintext sealed into the key check value.
const KEY_CHECK_MARKER: &[u8] = b"file-vault key check v1";

/// The vault's AES-256 key. Built once at startup and owned by the `Vault`.
#[derive(Debug)]
pub struct KeyMaterial(SecretBox<[u8; KEY_LEN]>);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(SecretBox::new(Box::new(bytes)))
    }

    /// Parses a 64 character hex string.
    pub fn from_hex(encoded: &str) -> Result<Self, VaultError> {
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(encoded.trim(), &mut bytes).map_err(|e| {
            VaultError::InvalidKey(format!("expected {} hex characters: {e}", KEY_LEN * 2))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Derives the key from a passphrase and the vault salt with Argon2id.
    pub fn derive(passphrase: &str, salt: &[u8; 16]) -> Result<Self, VaultError> {
        let params = Params::new(65536, 3, 4, Some(KEY_LEN))
            .map_err(|e| VaultError::Argon2(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let salt_str =
            SaltString::encode_b64(salt).map_err(|e| VaultError::Argon2(e.to_string()))?;

        let password_hash = argon2
            .hash_password(passphrase.as_bytes(), &salt_str)
            .map_err(|e| VaultError::Argon2(e.to_string()))?;

        let hash_output = password_hash
            .hash
            .ok_or_else(|| VaultError::Argon2("No hash output".into()))?;

        if hash_output.as_bytes().len() < KEY_LEN {
            return Err(VaultError::Argon2("Hash output too short".into()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&hash_output.as_bytes()[..KEY_LEN]);

        Ok(Self::from_bytes(key))
    }

    #[cfg(test)]
    pub fn generate() -> Self {
        Self::from_bytes(rand::random::<[u8; KEY_LEN]>())
    }

    fn expose(&self) -> &[u8; KEY_LEN] {
        self.0.expose_secret()
    }
}

/// Encrypts under a fresh random IV with PKCS#7 padding.
pub fn encrypt(key: &KeyMaterial, plaintext: &[u8]) -> (Iv, Vec<u8>) {
    let iv = Iv::generate();
    let ciphertext = Aes256CbcEnc::new(key.expose().into(), iv.as_bytes().into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    (iv, ciphertext)
}

pub fn decrypt(key: &KeyMaterial, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, VaultError> {
    if iv.len() != IV_LEN {
        return Err(VaultError::Decryption(format!(
            "IV must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(VaultError::Decryption(format!(
            "ciphertext length {} is not a positive multiple of {BLOCK_LEN}",
            ciphertext.len()
        )));
    }

    let decryptor = Aes256CbcDec::new_from_slices(key.expose(), iv)
        .map_err(|_| VaultError::Decryption("invalid key or IV length".into()))?;

    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| VaultError::Decryption("invalid padding".into()))
}

/// Produces the value persisted on first open: IV followed by the sealed marker.
pub fn key_check(key: &KeyMaterial) -> Vec<u8> {
    let (iv, ciphertext) = encrypt(key, KEY_CHECK_MARKER);
    let mut combined = iv.as_bytes().to_vec();
    combined.extend_from_slice(&ciphertext);
    combined
}

pub fn verify_key_check(key: &KeyMaterial, stored: &[u8]) -> Result<(), VaultError> {
    if stored.len() < IV_LEN {
        return Err(VaultError::Corruption("Key check too short".into()));
    }
    let (iv, ciphertext) = stored.split_at(IV_LEN);

    // A wrong key usually fails on padding; the comparison catches the rest.
    match decrypt(key, iv, ciphertext) {
        Ok(marker) if marker == KEY_CHECK_MARKER => Ok(()),
        _ => Err(VaultError::KeyMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::block_padding::NoPadding;

    #[test]
    fn test_round_trip() {
        let key = KeyMaterial::generate();
        for len in [0usize, 1, 15, 16, 17, 4096, 100_003] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let (iv, ciphertext) = encrypt(&key, &plaintext);
            assert_eq!(ciphertext.len() % BLOCK_LEN, 0);
            assert!(ciphertext.len() > plaintext.len());
            let decrypted = decrypt(&key, iv.as_bytes(), &ciphertext).unwrap();
            assert_eq!(decrypted, plaintext, "round trip failed for {len} bytes");
        }
    }

    // NIST SP 800-38A, F.2.5 CBC-AES256.Encrypt
    const NIST_KEY: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";
    const NIST_IV: &str = "000102030405060708090a0b0c0d0e0f";
    const NIST_PLAINTEXT: &str = "6bc1bee22e409f96e93d7e117393172a\
                                  ae2d8a571e03ac9c9eb76fac45af8e51\
                                  30c81c46a35ce411e5fbc1191a0a52ef\
                                  f69f2445df4f9b17ad2b417be66c3710";
    const NIST_CIPHERTEXT: &str = "f58c4c04d6e5f1ba779eabfb5f7bfbd6\
                                   9cfc4e967edb808d679f777bc6702c7d\
                                   39f23369a9d9bacfa530e26304231461\
                                   b2eb05e2c39be9fcda6c19078c6a9d1b";

    #[test]
    fn test_matches_nist_cbc_aes256_vector() {
        let key = KeyMaterial::from_hex(NIST_KEY).unwrap();
        let iv = hex::decode(NIST_IV).unwrap();
        let plaintext = hex::decode(NIST_PLAINTEXT).unwrap();
        let expected = hex::decode(NIST_CIPHERTEXT).unwrap();

        let raw = Aes256CbcEnc::new_from_slices(key.expose(), &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<NoPadding>(&plaintext);
        assert_eq!(raw, expected);

        // With PKCS#7 the vector blocks come first, then one full padding block
        let padded = Aes256CbcEnc::new_from_slices(key.expose(), &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);
        assert_eq!(padded.len(), expected.len() + BLOCK_LEN);
        assert_eq!(&padded[..expected.len()], &expected[..]);

        assert_eq!(decrypt(&key, &iv, &padded).unwrap(), plaintext);
    }

    #[test]
    fn test_same_plaintext_gets_fresh_iv() {
        let key = KeyMaterial::generate();
        let (iv_a, ct_a) = encrypt(&key, b"identical");
        let (iv_b, ct_b) = encrypt(&key, b"identical");
        assert_ne!(iv_a, iv_b);
        assert_ne!(ct_a, ct_b);
    }

    #[test]
    fn test_decrypt_rejects_bad_iv_length() {
        let key = KeyMaterial::generate();
        let (_, ciphertext) = encrypt(&key, b"hello");
        let err = decrypt(&key, &[0u8; 12], &ciphertext).unwrap_err();
        assert!(matches!(err, VaultError::Decryption(_)));
    }

    #[test]
    fn test_decrypt_rejects_partial_block() {
        let key = KeyMaterial::generate();
        let (iv, ciphertext) = encrypt(&key, b"hello world");
        let err = decrypt(&key, iv.as_bytes(), &ciphertext[..ciphertext.len() - 1]).unwrap_err();
        assert!(matches!(err, VaultError::Decryption(_)));

        let err = decrypt(&key, iv.as_bytes(), &[]).unwrap_err();
        assert!(matches!(err, VaultError::Decryption(_)));
    }

    #[test]
    fn test_decrypt_rejects_invalid_padding() {
        let key = KeyMaterial::from_bytes([7u8; KEY_LEN]);
        let iv = [9u8; IV_LEN];
        // A final plaintext byte of zero is never valid PKCS#7.
        let ciphertext = Aes256CbcEnc::new((&[7u8; KEY_LEN]).into(), (&iv).into())
            .encrypt_padded_vec_mut::<NoPadding>(&[0u8; BLOCK_LEN]);

        let err = decrypt(&key, &iv, &ciphertext).unwrap_err();
        assert!(matches!(err, VaultError::Decryption(ref msg) if msg.contains("padding")));
    }

    #[test]
    fn test_from_hex() {
        let key = KeyMaterial::from_hex(&"11".repeat(KEY_LEN)).unwrap();
        assert_eq!(key.expose(), &[0x11u8; KEY_LEN]);

        assert!(matches!(
            KeyMaterial::from_hex("abcd"),
            Err(VaultError::InvalidKey(_))
        ));
        assert!(matches!(
            KeyMaterial::from_hex(&"zz".repeat(KEY_LEN)),
            Err(VaultError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_derive_is_deterministic_per_salt() {
        let salt = [3u8; 16];
        let a = KeyMaterial::derive("correct horse", &salt).unwrap();
        let b = KeyMaterial::derive("correct horse", &salt).unwrap();
        let c = KeyMaterial::derive("correct horse", &[4u8; 16]).unwrap();
        assert_eq!(a.expose(), b.expose());
        assert_ne!(a.expose(), c.expose());
    }

    #[test]
    fn test_key_check() {
        let key = KeyMaterial::generate();
        let stored = key_check(&key);
        assert!(verify_key_check(&key, &stored).is_ok());

        let other = KeyMaterial::generate();
        assert!(matches!(
            verify_key_check(&other, &stored),
            Err(VaultError::KeyMismatch)
        ));

        assert!(matches!(
            verify_key_check(&key, &stored[..4]),
            Err(VaultError::Corruption(_))
        ));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let key = KeyMaterial::from_bytes([0x42; KEY_LEN]);
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("66"));
    }
}
