//! SCRAM-SHA-256 client exchange (RFC 5802 / RFC 7677).
//!
//! The handshake drives this state machine: `client_first` opens the
//! exchange, `client_final` answers the server challenge, and
//! `verify_server` checks the server signature that proves the server
//! also knows the password.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const CHANNEL_BINDING: &str = "n,,";

pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    // populated after the server-first message
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: BASE64.encode(nonce_bytes),
            auth_message: None,
            salted_password: None,
        }
    }

    fn first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// `client-first-message`: gs2 header plus name and nonce.
    pub fn client_first(&self) -> Vec<u8> {
        format!("{}{}", CHANNEL_BINDING, self.first_bare()).into_bytes()
    }

    /// Consume the `server-first-message` and produce the
    /// `client-final-message` carrying the proof.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| Error::authentication("server challenge is not UTF-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(v)
                        .map_err(|_| Error::authentication("invalid salt encoding"))?,
                );
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = Some(
                    v.parse::<u32>()
                        .map_err(|_| Error::authentication("invalid iteration count"))?,
                );
            }
        }
        let nonce = nonce.ok_or_else(|| Error::authentication("server omitted nonce"))?;
        let salt = salt.ok_or_else(|| Error::authentication("server omitted salt"))?;
        let iterations =
            iterations.ok_or_else(|| Error::authentication("server omitted iterations"))?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err(Error::authentication(
                "server nonce does not extend the client nonce",
            ));
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.first_bare(),
            server_first,
            without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Verify the `server-final-message` signature.
    pub fn verify_server(&self, server_final: &[u8]) -> Result<()> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| Error::authentication("server signature is not UTF-8"))?;
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::authentication("server omitted verifier"))?;
        let signature = BASE64
            .decode(verifier)
            .map_err(|_| Error::authentication("invalid verifier encoding"))?;

        let salted_password = self
            .salted_password
            .ok_or_else(|| Error::authentication("verifier received before challenge"))?;
        let auth_message = self
            .auth_message
            .as_ref()
            .ok_or_else(|| Error::authentication("verifier received before challenge"))?;

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());
        if signature != expected {
            return Err(Error::authentication(
                "server signature verification failed",
            ));
        }
        Ok(())
    }
}

/// Hi(): PBKDF2 with HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("valid output length");
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compute the verifier the way a server holding the same password
    /// would.
    fn server_signature(password: &str, salt: &[u8], iterations: u32, auth: &str) -> String {
        let salted = hi(password, salt, iterations);
        let server_key = hmac_sha256(&salted, b"Server Key");
        BASE64.encode(hmac_sha256(&server_key, auth.as_bytes()))
    }

    #[test]
    fn full_exchange_against_simulated_server() {
        let mut client = ScramClient::new("ada", "pencil");

        let first = String::from_utf8(client.client_first()).unwrap();
        assert!(first.starts_with("n,,n=ada,r="));
        let client_nonce = first.rsplit("r=").next().unwrap().to_string();

        let salt = b"0123456789abcdef";
        let server_first = format!(
            "r={}SRVNONCE,s={},i=4096",
            client_nonce,
            BASE64.encode(salt)
        );
        let final_msg =
            String::from_utf8(client.client_final(server_first.as_bytes()).unwrap()).unwrap();
        assert!(final_msg.starts_with("c=biws,r="));
        assert!(final_msg.contains(",p="));

        let without_proof = final_msg.split(",p=").next().unwrap();
        let auth = format!(
            "n=ada,r={},{},{}",
            client_nonce, server_first, without_proof
        );
        let verifier = format!("v={}", server_signature("pencil", salt, 4096, &auth));
        client.verify_server(verifier.as_bytes()).unwrap();
    }

    #[test]
    fn tampered_nonce_is_rejected() {
        let mut client = ScramClient::new("ada", "pencil");
        let server_first = format!("r=NOTOURNONCE,s={},i=4096", BASE64.encode(b"salt"));
        let err = client.client_final(server_first.as_bytes()).unwrap_err();
        assert!(err.is(crate::errors::ErrorCode::AUTHENTICATION));
    }

    #[test]
    fn wrong_server_signature_is_rejected() {
        let mut client = ScramClient::new("ada", "pencil");
        let first = String::from_utf8(client.client_first()).unwrap();
        let client_nonce = first.rsplit("r=").next().unwrap().to_string();
        let server_first = format!(
            "r={}X,s={},i=4096",
            client_nonce,
            BASE64.encode(b"0123456789abcdef")
        );
        client.client_final(server_first.as_bytes()).unwrap();

        let bogus = format!("v={}", BASE64.encode([0u8; 32]));
        assert!(client.verify_server(bogus.as_bytes()).is_err());
    }
}
