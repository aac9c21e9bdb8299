//! Node identity
//!
//! Nodes prove cluster membership by sending their advertised address in the
//! `x-litebase-node` header, sealed with ChaCha20-Poly1305 under a key
//! derived from the cluster shared key. The header value is
//! `base64(nonce || ciphertext)` and the plaintext is `address|issued_at_ms`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Header carrying the sealed node identity
pub const NODE_HEADER: &str = "x-litebase-node";

const NONCE_LEN: usize = 12;

/// Tokens older than this are refused
const MAX_TOKEN_AGE_MS: i64 = 5 * 60 * 1000;

/// Seals and opens node identity tokens
#[derive(Clone)]
pub struct NodeIdentity {
    cipher: ChaCha20Poly1305,
    address: String,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl NodeIdentity {
    /// Derive the cipher from the shared key
    pub fn new(shared_key: &str, address: impl Into<String>) -> Self {
        let digest = Sha256::digest(shared_key.as_bytes());
        let key = Key::from_slice(&digest);
        Self {
            cipher: ChaCha20Poly1305::new(key),
            address: address.into(),
        }
    }

    /// The local advertised address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Produce a header value for the local node
    pub fn seal(&self) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = format!("{}|{}", self.address, chrono::Utc::now().timestamp_millis());
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| Error::Internal("node identity encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Open a header value and return the caller's address
    pub fn open(&self, header: &str) -> Result<String> {
        let sealed = BASE64
            .decode(header.trim())
            .map_err(|_| Error::Unauthorized("malformed node identity".into()))?;
        if sealed.len() <= NONCE_LEN {
            return Err(Error::Unauthorized("malformed node identity".into()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Unauthorized("invalid node identity".into()))?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| Error::Unauthorized("invalid node identity".into()))?;

        let (address, issued_at) = plaintext
            .rsplit_once('|')
            .ok_or_else(|| Error::Unauthorized("invalid node identity".into()))?;
        let issued_at: i64 = issued_at
            .parse()
            .map_err(|_| Error::Unauthorized("invalid node identity".into()))?;

        let age = chrono::Utc::now().timestamp_millis() - issued_at;
        if age.abs() > MAX_TOKEN_AGE_MS {
            return Err(Error::Unauthorized("expired node identity".into()));
        }

        Ok(address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123";

    #[test]
    fn test_seal_and_open() {
        let a = NodeIdentity::new(KEY, "10.0.0.1:8080");
        let b = NodeIdentity::new(KEY, "10.0.0.2:8080");

        let header = a.seal().unwrap();
        assert_eq!(b.open(&header).unwrap(), "10.0.0.1:8080");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let a = NodeIdentity::new(KEY, "10.0.0.1:8080");
        let other = NodeIdentity::new("a-completely-different-key", "10.0.0.2:8080");

        let header = a.seal().unwrap();
        assert!(matches!(other.open(&header), Err(Error::Unauthorized(_))));
        assert!(other.open("not base64!").is_err());
        assert!(other.open("").is_err());
    }

    #[test]
    fn test_nonce_is_fresh() {
        let a = NodeIdentity::new(KEY, "10.0.0.1:8080");
        assert_ne!(a.seal().unwrap(), a.seal().unwrap());
    }
}
