use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use hmac::{Hmac, Mac};
use log::trace;
use p256::{
    ecdsa::{signature::Signer, Signature, SigningKey},
    elliptic_curve::{sec1::ToEncodedPoint, JwkEcKey},
    PublicKey, SecretKey,
};
use rand_core::OsRng;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::{AcmeError, PEM_REGEX, TIP_REGEX_FAILED};

pub fn base64(s: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(s)
}

pub fn base64_decode(s: &str) -> Result<Vec<u8>, AcmeError> {
    URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|e| AcmeError::Tip(format!("Invalid base64url: {}", e)))
}

pub fn sha256_bytes(p: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(p.as_bytes());
    hasher.finalize().to_vec()
}

pub fn base64_sha256(p: &str) -> String {
    let b64_hash = base64(&sha256_bytes(p));
    trace!("sha2 sha256 base64: {}", b64_hash);
    b64_hash
}

pub fn sha256(p: &str) -> String {
    let hex_hash = hex::encode(sha256_bytes(p));
    trace!("sha2 sha256 hex: {}", hex_hash);
    hex_hash
}

pub fn hmac256(key: &[u8], s: &str) -> Result<Vec<u8>, AcmeError> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| AcmeError::Signing(e.to_string()))?;
    mac.update(s.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

// eab hmac key is handed out base64url encoded
pub fn base64_hmac256(key: &str, s: &str) -> Result<String, AcmeError> {
    Ok(base64(&hmac256(&base64_decode(key)?, s)?))
}

/// Turns a PEM block (CSR or certificate) into base64url DER, as ACME wants it.
/// Input that is not PEM is assumed to already be base64url and passed through.
pub fn pem_to_base64(text: &str) -> Result<String, AcmeError> {
    let text = text.trim();
    if !text.starts_with("-----BEGIN") {
        return Ok(text.to_string());
    }
    let body: String = regx1(text, PEM_REGEX)?.chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD
        .decode(body)
        .map_err(|e| AcmeError::Tip(format!("Invalid PEM body: {}", e)))?;
    Ok(base64(&der))
}

pub fn regx1(text: &str, reg: &str) -> Result<String, AcmeError> {
    let re = Regex::new(reg)?;
    match re.captures(text) {
        Some(cap) => Ok(cap.get(1).map_or("", |m| m.as_str()).to_string()),
        None => AcmeError::tip(TIP_REGEX_FAILED),
    }
}

/// A P-256 signing key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public_key()).finish()
    }
}

impl KeyPair {
    pub fn generate() -> Result<Self, AcmeError> {
        let secret = SecretKey::random(&mut OsRng);
        // sanity check: the provider must give back a usable point
        if secret.public_key().to_encoded_point(false).x().is_none() {
            return Err(AcmeError::KeyGeneration("P-256 key without affine coordinates".to_string()));
        }
        Ok(KeyPair { secret })
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Base64url affine coordinates (x, y) of the public point.
    pub fn coordinates(&self) -> Result<(String, String), AcmeError> {
        let point = self.public_key().to_encoded_point(false);
        match (point.x(), point.y()) {
            (Some(x), Some(y)) => Ok((base64(x), base64(y))),
            _ => Err(AcmeError::Signing("Public key is the identity point".to_string())),
        }
    }

    /// ECDSA P-256 / SHA-256 over `message`; JWS wants the raw `r || s` form, not DER.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, AcmeError> {
        let signing_key = SigningKey::from(&self.secret);
        let signature: Signature = signing_key
            .try_sign(message)
            .map_err(|e| AcmeError::Signing(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }

    pub fn export(&self) -> (JwkEcKey, JwkEcKey) {
        (self.secret.to_jwk(), self.public_key().to_jwk())
    }

    pub fn import(private: &JwkEcKey, public: &JwkEcKey) -> Result<Self, AcmeError> {
        let secret = SecretKey::from_jwk(private)
            .map_err(|_| AcmeError::KeyGeneration("Stored private key is not a P-256 JWK".to_string()))?;
        let stored_public = PublicKey::from_jwk(public)
            .map_err(|_| AcmeError::KeyGeneration("Stored public key is not a P-256 JWK".to_string()))?;
        if stored_public != secret.public_key() {
            return Err(AcmeError::KeyGeneration("Stored public key does not match private key".to_string()));
        }
        Ok(KeyPair { secret })
    }
}
