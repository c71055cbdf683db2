//! SCRAM-SHA-256 client (RFC 5802, RFC 7677) without channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// GS2 header for "no channel binding, no authzid", and its base64 form
/// as echoed in the client-final message.
const GS2_HEADER: &str = "n,,";
const CHANNEL_BINDING: &str = "biws";

/// SCRAM authentication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("invalid server message")]
    InvalidServerMessage,
    #[error("invalid salt encoding")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("missing nonce in server message")]
    MissingNonce,
    #[error("missing salt in server message")]
    MissingSalt,
    #[error("missing iterations in server message")]
    MissingIterations,
    #[error("server nonce verification failed")]
    NonceVerificationFailed,
    #[error("invalid server signature")]
    InvalidServerSignature,
    #[error("server signature verification failed")]
    ServerSignatureVerificationFailed,
    #[error("invalid SCRAM state")]
    InvalidState,
    #[error("key derivation failed")]
    KeyDerivation,
}

enum Exchange {
    /// client-first sent, waiting for server-first
    Started,
    /// client-final sent; what the server signature is checked against
    Proved {
        salted_password: [u8; 32],
        auth_message: String,
    },
}

/// One SCRAM-SHA-256 exchange.
pub struct ScramClient {
    user: String,
    password: String,
    nonce: String,
    exchange: Exchange,
}

impl ScramClient {
    pub fn new(user: &str, password: &str) -> Self {
        // 18 random bytes give a 24-character nonce.
        let raw: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(user, password, BASE64.encode(raw))
    }

    fn with_nonce(user: &str, password: &str, nonce: String) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            nonce,
            exchange: Exchange::Started,
        }
    }

    /// `n,,n=<user>,r=<nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("{}{}", GS2_HEADER, self.client_first_bare()).into_bytes()
    }

    /// Answer server-first with client-final (`c=biws,r=<nonce>,p=<proof>`).
    pub fn process_server_first(&mut self, message: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(message).map_err(|_| ScramError::InvalidServerMessage)?;
        let challenge = Challenge::parse(server_first)?;
        if !challenge.nonce.starts_with(&self.nonce) {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password = hi(&self.password, &challenge.salt, challenge.iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, challenge.nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.exchange = Exchange::Proved {
            salted_password,
            auth_message,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check server-final (`v=<signature>`) against the proved exchange.
    pub fn verify_server_final(&self, message: &[u8]) -> Result<(), ScramError> {
        let Exchange::Proved {
            salted_password,
            auth_message,
        } = &self.exchange
        else {
            return Err(ScramError::InvalidState);
        };

        let server_final =
            std::str::from_utf8(message).map_err(|_| ScramError::InvalidServerMessage)?;
        let received = server_final
            .strip_prefix("v=")
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or(ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;
        if received != expected {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }
        Ok(())
    }

    // PostgreSQL takes the user from the startup message and does not
    // require SASLprep here.
    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.user, self.nonce)
    }
}

/// Parsed server-first message.
struct Challenge {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl Challenge {
    fn parse(message: &str) -> Result<Self, ScramError> {
        let (mut nonce, mut salt, mut iterations) = (None, None, None);
        for attribute in message.split(',') {
            match attribute.split_once('=') {
                Some(("r", value)) => nonce = Some(value.to_string()),
                Some(("s", value)) => {
                    salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?)
                }
                Some(("i", value)) => {
                    let count = value.parse::<u32>().map_err(|_| ScramError::InvalidIterations)?;
                    iterations = Some(count);
                }
                _ => {}
            }
        }
        Ok(Self {
            nonce: nonce.ok_or(ScramError::MissingNonce)?,
            salt: salt.ok_or(ScramError::MissingSalt)?,
            iterations: iterations.ok_or(ScramError::MissingIterations)?,
        })
    }
}

/// Hi(): PBKDF2 with HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::KeyDerivation)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
