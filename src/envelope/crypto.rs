//! Asymmetric payload encryption.
//!
//! The agent encrypts with the server's public key, the server decrypts
//! with the matching private key; both are PKCS#1 v1.5 RSA keys loaded
//! from PEM files. A missing or malformed key file is a startup failure
//! for whichever side is configured to use it, never a per-request one.

use crate::error::Error;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
    LineEnding,
};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::fs;
use std::path::Path;

/// Modulus size for generated key pairs.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Load a PKCS#1 PEM public key.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, Error> {
    let pem = fs::read_to_string(path)
        .map_err(|e| Error::Encryption(format!("reading {:?}: {}", path, e)))?;
    RsaPublicKey::from_pkcs1_pem(&pem)
        .map_err(|e| Error::Encryption(format!("parsing {:?}: {}", path, e)))
}

/// Load a PKCS#1 PEM private key.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, Error> {
    let pem = fs::read_to_string(path)
        .map_err(|e| Error::Encryption(format!("reading {:?}: {}", path, e)))?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .map_err(|e| Error::Encryption(format!("parsing {:?}: {}", path, e)))
}

/// Encrypt `data` for the holder of `key`'s private half.
///
/// PKCS#1 v1.5 bounds the plaintext at modulus size minus padding; ingot
/// payloads are one-element batches and stay far under it.
pub fn encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut rng = rand::thread_rng();
    key.encrypt(&mut rng, Pkcs1v15Encrypt, data)
        .map_err(|e| Error::Encryption(e.to_string()))
}

/// Decrypt `data` with the private key.
pub fn decrypt(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, Error> {
    key.decrypt(Pkcs1v15Encrypt, data)
        .map_err(|e| Error::Encryption(e.to_string()))
}

/// Generate a fresh key pair and write both halves as PKCS#1 PEM files.
pub fn generate_key_pair(
    bits: usize,
    private_path: &Path,
    public_path: &Path,
) -> Result<(), Error> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| Error::Encryption(e.to_string()))?;
    let public = RsaPublicKey::from(&private);

    let private_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::Encryption(e.to_string()))?;
    fs::write(private_path, private_pem.as_bytes())
        .map_err(|e| Error::Encryption(format!("writing {:?}: {}", private_path, e)))?;

    let public_pem = public
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::Encryption(e.to_string()))?;
    fs::write(public_path, public_pem.as_bytes())
        .map_err(|e| Error::Encryption(format!("writing {:?}: {}", public_path, e)))?;
    Ok(())
}
