use std::fs;
use std::path::Path;

use blake2::{Blake2s256, Digest};
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn hash(data: &[u8]) -> [u8; 32] {
    Blake2s256::digest(data).into()
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.public.to_bytes()),
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    keypair_from_hex(&stored.secret_key, &stored.public_key)
}

pub fn keypair_from_hex(secret_hex: &str, public_hex: &str) -> ChainResult<Keypair> {
    let secret_bytes = hex::decode(secret_hex)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    let public_bytes = hex::decode(public_hex)
        .map_err(|err| ChainError::Config(format!("invalid public key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from_bytes(&public_bytes)
        .map_err(|err| ChainError::Config(format!("invalid public key bytes: {err}")))?;
    Ok(Keypair { secret, public })
}

pub fn keypair_from_secret(secret_bytes: &[u8]) -> ChainResult<Keypair> {
    let secret = SecretKey::from_bytes(secret_bytes)
        .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from(&secret);
    Ok(Keypair { secret, public })
}

pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> ChainResult<()> {
    public_key
        .verify(message, signature)
        .map_err(|err| ChainError::Consensus(format!("signature verification failed: {err}")))
}

pub fn address_from_public_key(public_key: &PublicKey) -> String {
    hex::encode(hash(public_key.as_bytes()))
}

pub fn address_from_public_key_hex(public_key_hex: &str) -> ChainResult<String> {
    let public = public_key_from_hex(public_key_hex)?;
    Ok(address_from_public_key(&public))
}

pub fn public_key_from_hex(data: &str) -> ChainResult<PublicKey> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Validation(format!("invalid public key encoding: {err}")))?;
    PublicKey::from_bytes(&bytes)
        .map_err(|err| ChainError::Validation(format!("invalid public key bytes: {err}")))
}

pub fn signature_from_hex(data: &str) -> ChainResult<Signature> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Validation(format!("invalid signature encoding: {err}")))?;
    Signature::from_bytes(&bytes)
        .map_err(|err| ChainError::Validation(format!("invalid signature bytes: {err}")))
}

pub fn signature_to_hex(signature: &Signature) -> String {
    hex::encode(signature.to_bytes())
}

const KEYSTORE_MAC_DOMAIN: &[u8] = b"dpos-keystore-mac";
const KEYSTORE_STREAM_DOMAIN: &[u8] = b"dpos-keystore-stream";

fn keystream(password: &str, salt: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u32;
    while out.len() < len {
        let mut data = Vec::with_capacity(
            KEYSTORE_STREAM_DOMAIN.len() + salt.len() + password.len() + 4,
        );
        data.extend_from_slice(KEYSTORE_STREAM_DOMAIN);
        data.extend_from_slice(salt);
        data.extend_from_slice(password.as_bytes());
        data.extend_from_slice(&counter.to_le_bytes());
        out.extend_from_slice(&hash(&data));
        counter += 1;
    }
    out.truncate(len);
    out
}

fn keystore_mac(password: &str, salt: &[u8], ciphertext: &[u8]) -> [u8; 32] {
    let mut data =
        Vec::with_capacity(KEYSTORE_MAC_DOMAIN.len() + salt.len() + password.len() + ciphertext.len());
    data.extend_from_slice(KEYSTORE_MAC_DOMAIN);
    data.extend_from_slice(salt);
    data.extend_from_slice(password.as_bytes());
    data.extend_from_slice(ciphertext);
    hash(&data)
}

/// Encrypt a delegate secret key under a password. Output layout:
/// 16-byte salt, ciphertext, 32-byte MAC, hex-encoded.
pub fn encrypt_secret(secret: &[u8], password: &str) -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let stream = keystream(password, &salt, secret.len());
    let ciphertext: Vec<u8> = secret
        .iter()
        .zip(stream.iter())
        .map(|(byte, key)| byte ^ key)
        .collect();
    let mac = keystore_mac(password, &salt, &ciphertext);
    let mut encoded = Vec::with_capacity(16 + ciphertext.len() + 32);
    encoded.extend_from_slice(&salt);
    encoded.extend_from_slice(&ciphertext);
    encoded.extend_from_slice(&mac);
    hex::encode(encoded)
}

pub fn decrypt_secret(encrypted_hex: &str, password: &str) -> ChainResult<Vec<u8>> {
    let encoded = hex::decode(encrypted_hex)
        .map_err(|err| ChainError::Config(format!("invalid keystore encoding: {err}")))?;
    if encoded.len() < 16 + 32 {
        return Err(ChainError::Config("keystore payload too short".into()));
    }
    let (salt, rest) = encoded.split_at(16);
    let (ciphertext, mac) = rest.split_at(rest.len() - 32);
    if keystore_mac(password, salt, ciphertext) != mac {
        return Err(ChainError::Config("invalid keystore password".into()));
    }
    let stream = keystream(password, salt, ciphertext.len());
    Ok(ciphertext
        .iter()
        .zip(stream.iter())
        .map(|(byte, key)| byte ^ key)
        .collect())
}
