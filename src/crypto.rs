// src/crypto.rs

use crate::opreturn::{HASH_LENGTH, SECRET_KEY_LENGTH};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use bitcoin_hashes::{hash160, Hash};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;

const NONCE_LENGTH: usize = 12;

pub type SecretKey = [u8; SECRET_KEY_LENGTH];

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,
    #[error("Decryption failed: wrong key or corrupted ciphertext")]
    Decryption,
    #[error("Ciphertext too short: {0} bytes")]
    TooShort(usize),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// SHA-256 followed by RIPEMD-160.
pub fn hash160(data: &[u8]) -> [u8; HASH_LENGTH] {
    hash160::Hash::hash(data).to_byte_array()
}

/// `hash160` over the bincode encoding of `value`.
pub fn hash_of_serialized<T: Serialize + ?Sized>(value: &T) -> Result<[u8; HASH_LENGTH], CryptoError> {
    Ok(hash160(&bincode::serialize(value)?))
}

pub fn generate_secret_key() -> SecretKey {
    let mut key = [0u8; SECRET_KEY_LENGTH];
    OsRng.fill_bytes(&mut key);
    key
}

/// Output layout is `nonce || ciphertext`.
pub fn encrypt(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(key: &SecretKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LENGTH {
        return Err(CryptoError::TooShort(data.len()));
    }
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::Decryption)?;
    let (nonce, ciphertext) = data.split_at(NONCE_LENGTH);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}
