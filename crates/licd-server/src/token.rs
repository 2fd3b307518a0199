//! RS256 activation tokens.
//!
//! A token is a JWT over `{license, hwid, iat}` (plus `exp` when a TTL is
//! configured), signed with the service's RSA private key. Anyone holding the
//! public key can verify it offline.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::unix_now;

pub const ALGORITHM: Algorithm = Algorithm::RS256;

/// A successful activation, alive only until it is signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub license_id: String,
    pub device_id: String,
    /// Unix seconds.
    pub issued_at: i64,
}

/// Token payload as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub license: String,
    pub hwid: String,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Signs assertions with a private key held in memory.
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_key_pem: String,
    key_id: String,
    ttl: Option<Duration>,
}

impl TokenIssuer {
    /// Build an issuer from PEM key material. Fails unless the private key
    /// produces signatures the public key accepts.
    pub fn from_pem(private_pem: &[u8], public_pem: &[u8], ttl: Option<Duration>) -> Result<Self> {
        let encoding_key =
            EncodingKey::from_rsa_pem(private_pem).context("parse RSA private key PEM")?;
        let decoding_key =
            DecodingKey::from_rsa_pem(public_pem).context("parse RSA public key PEM")?;
        let public_key_pem = String::from_utf8(public_pem.to_vec())
            .context("public key PEM is not valid UTF-8")?;

        let issuer = Self {
            encoding_key,
            decoding_key,
            key_id: key_id(public_pem),
            public_key_pem,
            ttl,
        };

        let probe = Assertion {
            license_id: "probe".into(),
            device_id: "probe".into(),
            issued_at: unix_now(),
        };
        let token = issuer.sign(&probe).context("sign probe token")?;
        issuer
            .verify(&token)
            .context("private key does not pair with the public key")?;

        Ok(issuer)
    }

    /// Load both PEM files from disk.
    pub fn load(private_path: &Path, public_path: &Path, ttl: Option<Duration>) -> Result<Self> {
        let private_pem = Zeroizing::new(
            std::fs::read(private_path)
                .with_context(|| format!("read private key: {}", private_path.display()))?,
        );
        let public_pem = std::fs::read(public_path)
            .with_context(|| format!("read public key: {}", public_path.display()))?;
        Self::from_pem(&private_pem, &public_pem, ttl)
    }

    pub fn sign(&self, assertion: &Assertion) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            license: assertion.license_id.clone(),
            hwid: assertion.device_id.clone(),
            iat: assertion.issued_at,
            exp: self
                .ttl
                .map(|ttl| assertion.issued_at + ttl.as_secs() as i64),
        };
        let mut header = Header::new(ALGORITHM);
        header.kid = Some(self.key_id.clone());
        jsonwebtoken::encode(&header, &claims, &self.encoding_key)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode_with(token, &self.decoding_key)
    }

    /// The verification key, as provisioned.
    pub fn public_key(&self) -> &str {
        &self.public_key_pem
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// Verify `token` against a PEM public key, without contacting the server.
pub fn verify_token(token: &str, public_pem: &[u8]) -> Result<Claims, jsonwebtoken::errors::Error> {
    let key = DecodingKey::from_rsa_pem(public_pem)?;
    decode_with(token, &key)
}

fn decode_with(token: &str, key: &DecodingKey) -> Result<Claims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(ALGORITHM);
    // `exp` is optional; when present it is still enforced.
    validation.required_spec_claims.clear();
    jsonwebtoken::decode::<Claims>(token, key, &validation).map(|data| data.claims)
}

/// Stable 16-hex-char key id derived from the public key PEM.
pub fn key_id(public_pem: &[u8]) -> String {
    let hash = Sha256::digest(trim_ascii(public_pem));
    hex::encode(&hash[..8])
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
