//! Per-handshake RSA key material.
//!
//! A fresh 2048-bit keypair is generated for every handshake attempt and
//! never leaves process memory. The public half travels to the server as
//! base64-encoded SPKI; everything the server sends back encrypted is
//! OAEP-SHA256 against that keypair.

use {
    base64::{
        engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
        Engine as _,
    },
    rand_core::OsRng,
    rsa::{pkcs8::EncodePublicKey, Oaep, RsaPrivateKey, RsaPublicKey},
    sha2::Sha256,
};

const KEY_BITS: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(#[source] rsa::Error),
    #[error("public key export failed: {0}")]
    KeyExport(#[from] rsa::pkcs8::spki::Error),
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("decryption failed")]
    DecryptionFailed(#[source] rsa::Error),
    #[error("decrypted token is empty")]
    EmptyToken,
    #[error("decrypted token is not valid utf-8")]
    NotUtf8,
}

/// One handshake's RSA keypair.
pub struct DeviceKey {
    private: RsaPrivateKey,
    public_spki_b64: String,
}

impl DeviceKey {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(CryptoError::KeyGeneration)?;
        let public = RsaPublicKey::from(&private);
        let spki = public.to_public_key_der()?;
        Ok(Self {
            public_spki_b64: STANDARD.encode(spki.as_bytes()),
            private,
        })
    }

    /// Base64 SPKI form of the public key, as sent in `init`.
    pub fn encoded_public_key(&self) -> &str {
        &self.public_spki_b64
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(CryptoError::DecryptionFailed)
    }

    pub fn decrypt_base64(&self, encoded: &str) -> Result<Vec<u8>, CryptoError> {
        self.decrypt(&STANDARD.decode(encoded)?)
    }

    /// Decrypts the server's nonce challenge and re-encodes it the way the
    /// proof must appear on the wire: URL-safe base64, no padding.
    pub fn nonce_proof(&self, encrypted_nonce: &str) -> Result<String, CryptoError> {
        Ok(URL_SAFE_NO_PAD.encode(self.decrypt_base64(encrypted_nonce)?))
    }

    /// Decrypts an `encrypted_token` into the final auth token. Whitespace is
    /// trimmed; an empty or non-UTF-8 result is an error.
    pub fn decrypt_token(&self, encrypted_token: &str) -> Result<String, CryptoError> {
        let plain = self.decrypt_base64(encrypted_token)?;
        let token = String::from_utf8(plain).map_err(|_| CryptoError::NotUtf8)?;
        let token = token.trim();
        if token.is_empty() {
            return Err(CryptoError::EmptyToken);
        }
        Ok(token.to_string())
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKey").finish_non_exhaustive()
    }
}
