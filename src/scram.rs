//! SCRAM-SHA-256 authentication.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) as used by
//! PostgreSQL's SASL exchange. Channel binding is not offered (`n,,`).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::PgError;

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name sent in SASLInitialResponse.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// SCRAM authentication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Missing {0} in server message")]
    Missing(&'static str),
    #[error("Server nonce verification failed")]
    NonceMismatch,
    #[error("Invalid server signature")]
    InvalidServerSignature,
    #[error("Server signature verification failed")]
    SignatureMismatch,
    #[error("Invalid SCRAM state")]
    InvalidState,
    #[error("Key derivation failed")]
    Crypto,
}

impl From<ScramError> for PgError {
    fn from(e: ScramError) -> Self {
        PgError::Auth(format!("SCRAM-SHA-256: {}", e))
    }
}

/// Values derived in the server-first step and needed to check server-final.
struct Exchange {
    auth_message: String,
    salted_password: [u8; 32],
}

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    exchange: Option<Exchange>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes encode to 24 base64 characters
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            exchange: None,
        }
    }

    fn client_first_bare(&self) -> String {
        // PostgreSQL takes the user from the startup packet and ignores this one
        format!("n={},r={}", self.username.replace('=', "=3D").replace(',', "=2C"), self.client_nonce)
    }

    /// `n,,n=<user>,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume `r=<nonce>,s=<salt>,i=<iterations>` and produce client-final.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first = std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(value.parse::<u32>().map_err(|_| ScramError::InvalidIterations)?);
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::Missing("nonce"))?;
        let salt = salt.ok_or(ScramError::Missing("salt"))?;
        let iterations = iterations.ok_or(ScramError::Missing("iterations"))?;
        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }
        if !combined_nonce.starts_with(&self.client_nonce) || combined_nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare(), server_first, without_proof);

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof = xor_bytes(&client_key, &client_signature);

        self.exchange = Some(Exchange {
            auth_message,
            salted_password,
        });
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `v=<server-signature>`.
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_final = std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;
        let exchange = self.exchange.as_ref().ok_or(ScramError::InvalidState)?;

        // A trailing extension list is allowed after the verifier
        let verifier = server_final
            .split(',')
            .next()
            .and_then(|p| p.strip_prefix("v="))
            .ok_or(ScramError::InvalidServerSignature)?;
        let signature = BASE64.decode(verifier).map_err(|_| ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(&exchange.salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, exchange.auth_message.as_bytes())?;
        if signature != expected {
            return Err(ScramError::SignatureMismatch);
        }
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi(): PBKDF2 with HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::Crypto)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::Crypto)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
        *o = x ^ y;
    }
    out
}

/// Server half of the exchange, for the in-process test backend.
#[cfg(test)]
pub(crate) struct ScramServer {
    password: String,
    salt: Vec<u8>,
    iterations: u32,
    server_first: String,
    client_first_bare: String,
    nonce: String,
}

#[cfg(test)]
impl ScramServer {
    pub(crate) fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            salt: b"pgdirect-test-salt".to_vec(),
            iterations: 4096,
            server_first: String::new(),
            client_first_bare: String::new(),
            nonce: String::new(),
        }
    }

    /// Returns server-first for the given client-first message.
    pub(crate) fn first(&mut self, client_first: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(client_first).ok()?;
        let bare = text.strip_prefix("n,,")?;
        let client_nonce = bare.split(',').find_map(|p| p.strip_prefix("r="))?;
        self.client_first_bare = bare.to_string();
        self.nonce = format!("{}srv", client_nonce);
        self.server_first = format!("r={},s={},i={}", self.nonce, BASE64.encode(&self.salt), self.iterations);
        Some(self.server_first.clone())
    }

    /// Verifies client-final and returns server-final, or `None` on a bad proof.
    pub(crate) fn finish(&self, client_final: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(client_final).ok()?;
        let (without_proof, proof) = text.rsplit_once(",p=")?;
        let proof = BASE64.decode(proof).ok()?;
        let auth_message = format!("{},{},{}", self.client_first_bare, self.server_first, without_proof);

        let salted = hi(&self.password, &self.salt, self.iterations).ok()?;
        let client_key = hmac_sha256(&salted, b"Client Key").ok()?;
        let stored_key = sha256(&client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes()).ok()?;
        let recovered: Vec<u8> = proof.iter().zip(client_signature).map(|(p, s)| p ^ s).collect();
        if sha256(&recovered) != stored_key {
            return None;
        }

        let server_key = hmac_sha256(&salted, b"Server Key").ok()?;
        let signature = hmac_sha256(&server_key, auth_message.as_bytes()).ok()?;
        Some(format!("v={}", BASE64.encode(signature)))
    }
}
