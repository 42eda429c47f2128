//! The wire envelope: compression, optional asymmetric encryption and an
//! integrity tag layered over every payload between agent and server.
//!
//! Sender layering, innermost first: serialize, encrypt when a public key
//! is configured, gzip last. The integrity tag is computed over the final
//! wire bytes, so the receiver verifies it before unwrapping anything, then
//! gunzips, then decrypts.

pub mod crypto;
pub mod hash;

use crate::error::Error;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::io::{Read, Write};
use std::path::Path;

/// `Content-Encoding` token for gzip.
pub const ENCODING_GZIP: &str = "gzip";
/// `Content-Encoding` token for RSA encryption.
pub const ENCODING_ENCRYPTED: &str = "encrypted";

/// Gzip `data`.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::Payload(e.to_string()))?;
    encoder.finish().map_err(|e| Error::Payload(e.to_string()))
}

/// Reverse `gzip`.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Payload(e.to_string()))?;
    Ok(out)
}

/// A sealed payload ready to go on the wire.
#[derive(Debug)]
pub struct Sealed {
    /// The wire body.
    pub body: Vec<u8>,
    /// Value for the `Content-Encoding` header.
    pub content_encoding: String,
    /// Integrity tag for the `HashSHA256` header, when a shared key is
    /// configured.
    pub hash: Option<String>,
}

/// Sender half of the envelope.
pub struct Sealer {
    public_key: Option<RsaPublicKey>,
    shared_key: Option<String>,
}

impl Sealer {
    /// Build a sealer. Loading or parsing the public key fails here, at
    /// startup, not per request.
    pub fn new(
        public_key_path: Option<&Path>,
        shared_key: Option<String>,
    ) -> Result<Sealer, Error> {
        let public_key = match public_key_path {
            Some(path) => Some(crypto::load_public_key(path)?),
            None => None,
        };
        Ok(Sealer {
            public_key,
            shared_key: shared_key.filter(|k| !k.is_empty()),
        })
    }

    /// Wrap `payload` for the wire.
    pub fn seal(&self, payload: &[u8]) -> Result<Sealed, Error> {
        let mut encoding = String::from(ENCODING_GZIP);
        let inner = match self.public_key {
            Some(ref key) => {
                encoding.push(',');
                encoding.push_str(ENCODING_ENCRYPTED);
                crypto::encrypt(key, payload)?
            }
            None => payload.to_vec(),
        };
        let body = gzip(&inner)?;
        let hash = self
            .shared_key
            .as_ref()
            .map(|key| hash::tag(&body, key));
        Ok(Sealed {
            body,
            content_encoding: encoding,
            hash,
        })
    }
}

/// Receiver half of the envelope.
pub struct Opener {
    private_key: Option<RsaPrivateKey>,
    shared_key: Option<String>,
}

impl Opener {
    /// Build an opener. Loading or parsing the private key fails here, at
    /// startup, not per request.
    pub fn new(
        private_key_path: Option<&Path>,
        shared_key: Option<String>,
    ) -> Result<Opener, Error> {
        let private_key = match private_key_path {
            Some(path) => Some(crypto::load_private_key(path)?),
            None => None,
        };
        Ok(Opener {
            private_key,
            shared_key: shared_key.filter(|k| !k.is_empty()),
        })
    }

    /// Unwrap a received body.
    ///
    /// Verification order matters: the integrity tag covers the bytes as
    /// they travelled, so it is checked before any decoding. A configured
    /// shared key makes the tag mandatory -- an absent header fails the
    /// same way a wrong one does.
    pub fn open(
        &self,
        body: &[u8],
        content_encoding: Option<&str>,
        received_hash: Option<&str>,
    ) -> Result<Vec<u8>, Error> {
        if let Some(ref key) = self.shared_key {
            let received = received_hash.unwrap_or("");
            if !hash::verify(body, received, key) {
                return Err(Error::Integrity);
            }
        }

        let tokens: Vec<&str> = content_encoding
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .collect();

        let mut data = body.to_vec();
        if tokens.contains(&ENCODING_GZIP) {
            data = gunzip(&data)?;
        }
        if tokens.contains(&ENCODING_ENCRYPTED) {
            match self.private_key {
                Some(ref key) => data = crypto::decrypt(key, &data)?,
                None => {
                    return Err(Error::Encryption(
                        "encrypted payload but no private key configured".to_string(),
                    ))
                }
            }
        }
        Ok(data)
    }
}
