//! Authentication messages and the MD5 / SCRAM-SHA-256 primitives.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::codec::{MessageBuilder, expect_end, read_bytes, read_cstr, read_i32};

/// SASL mechanism implemented by [`ScramClient`].
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// GS2 header for "client does not support channel binding".
const GS2_HEADER: &str = "n,,";

/// Largest PBKDF2 iteration count accepted from a server.
pub const MAX_SCRAM_ITERATIONS: u32 = 10_000_000;

/// Write a PasswordMessage (cleartext or MD5 hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish();
}

/// Read the password out of a PasswordMessage payload.
pub fn parse_password(payload: &[u8]) -> Result<&str> {
    let (password, rest) = read_cstr(payload)?;
    expect_end(rest, "PasswordMessage")?;
    Ok(password)
}

/// Compute MD5 password hash.
///
/// PostgreSQL MD5 password format: "md5" + md5(md5(password + username) + salt)
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::Md5;

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let first_hash_hex = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(first_hash_hex.as_bytes());
    hasher.update(salt);

    format!("md5{:x}", hasher.finalize())
}

/// Write a SASLInitialResponse message.
pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, initial_response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(mechanism);
    msg.write_i32(initial_response.len() as i32);
    msg.write_bytes(initial_response);
    msg.finish();
}

/// Split a SASLInitialResponse payload into mechanism and initial response.
///
/// A length of -1 means no initial response.
pub fn parse_sasl_initial_response(payload: &[u8]) -> Result<(&str, Option<&[u8]>)> {
    let (mechanism, rest) = read_cstr(payload)?;
    let (len, rest) = read_i32(rest)?;
    if len == -1 {
        expect_end(rest, "SASLInitialResponse")?;
        return Ok((mechanism, None));
    }
    if len < 0 {
        return Err(Error::Protocol(format!("SASLInitialResponse: invalid length {len}")));
    }
    let (data, rest) = read_bytes(rest, len as usize)?;
    expect_end(rest, "SASLInitialResponse")?;
    Ok((mechanism, Some(data)))
}

/// Write a SASLResponse message.
pub fn write_sasl_response(buf: &mut Vec<u8>, response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_bytes(response);
    msg.finish();
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| Error::Auth(format!("HMAC error: {e}")))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Derive SaltedPassword = PBKDF2-HMAC-SHA-256(password, salt, iterations).
pub fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

/// Parsed server-first-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFirst<'a> {
    pub nonce: &'a str,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl<'a> ServerFirst<'a> {
    /// Parse `r=<nonce>,s=<salt>,i=<iterations>`.
    pub fn parse(message: &'a str) -> Result<Self> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in message.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = value.parse::<u32>().ok();
            } else if part.starts_with("m=") {
                return Err(Error::Auth("SCRAM: mandatory extension not supported".into()));
            }
        }

        let nonce = nonce.ok_or_else(|| Error::Auth("SCRAM: missing nonce".into()))?;
        let salt = salt.ok_or_else(|| Error::Auth("SCRAM: missing salt".into()))?;
        let iterations = iterations
            .filter(|&i| i > 0)
            .ok_or_else(|| Error::Auth("SCRAM: missing or invalid iteration count".into()))?;
        if iterations > MAX_SCRAM_ITERATIONS {
            return Err(Error::Auth(format!(
                "SCRAM: iteration count {iterations} exceeds {MAX_SCRAM_ITERATIONS}"
            )));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|e| Error::Auth(format!("SCRAM: invalid salt: {e}")))?;

        Ok(Self {
            nonce,
            salt,
            iterations,
        })
    }
}

/// SCRAM-SHA-256 client without channel binding.
///
/// Drive it with [`client_first_message`](Self::client_first_message),
/// [`process_server_first`](Self::process_server_first) and
/// [`verify_server_final`](Self::verify_server_final), in that order.
pub struct ScramClient {
    username: String,
    nonce: String,
    password: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    /// Create a new SCRAM client with a random 18-byte nonce.
    ///
    /// The username is left empty; PostgreSQL takes it from the startup packet.
    pub fn new(password: &str) -> Self {
        use rand::Rng;

        let mut nonce_bytes = [0u8; 18];
        rand::rng().fill(&mut nonce_bytes);
        Self::with_nonce("", password, &BASE64.encode(nonce_bytes))
    }

    /// Create a client with a fixed username and nonce.
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            nonce: nonce.to_string(),
            password: password.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    fn client_first_message_bare(&self) -> String {
        format!("n={},r={}", self.username, self.nonce)
    }

    /// Generate the client-first-message.
    pub fn client_first_message(&self) -> String {
        format!("{}{}", GS2_HEADER, self.client_first_message_bare())
    }

    /// Process server-first-message and generate client-final-message.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String> {
        let parsed = ServerFirst::parse(server_first)?;

        if !parsed.nonce.starts_with(&self.nonce) || parsed.nonce.len() <= self.nonce.len() {
            return Err(Error::Auth(
                "SCRAM: server nonce does not extend client nonce".into(),
            ));
        }

        let salted = salted_password(&self.password, &parsed.salt, parsed.iterations);
        let client_key = hmac_sha256(&salted, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);

        let client_final_without_proof =
            format!("c={},r={}", BASE64.encode(GS2_HEADER), parsed.nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let mut proof = [0u8; 32];
        for (out, (key, sig)) in proof
            .iter_mut()
            .zip(client_key.iter().zip(client_signature.iter()))
        {
            *out = key ^ sig;
        }

        self.salted_password = Some(salted);
        self.auth_message = Some(auth_message);

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(proof)
        ))
    }

    /// Verify server-final-message.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(Error::Auth(format!("SCRAM: server reported error: {err}")));
        }
        let signature_b64 = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| Error::Auth("SCRAM: invalid server-final-message".into()))?;
        let signature = BASE64
            .decode(signature_b64)
            .map_err(|e| Error::Auth(format!("SCRAM: invalid server signature: {e}")))?;

        let (Some(salted), Some(auth_message)) = (&self.salted_password, &self.auth_message)
        else {
            return Err(Error::Auth(
                "SCRAM: server-final-message before server-first-message".into(),
            ));
        };

        let server_key = hmac_sha256(salted, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if signature.as_slice() != expected.as_slice() {
            return Err(Error::Auth("SCRAM: server signature mismatch".into()));
        }
        Ok(())
    }
}

/// Server half of SCRAM-SHA-256, for checking the client against a known
/// password in tests. Returns the server-final-message (`v=...`).
#[cfg(test)]
pub(crate) fn scram_server_final(
    password: &str,
    salt: &[u8],
    iterations: u32,
    client_first_bare: &str,
    server_first: &str,
    client_final: &str,
) -> Result<String> {
    let (without_proof, proof_b64) = client_final
        .rsplit_once(",p=")
        .ok_or_else(|| Error::Auth("SCRAM: client-final-message without proof".into()))?;
    let proof = BASE64
        .decode(proof_b64)
        .map_err(|e| Error::Auth(format!("SCRAM: invalid proof: {e}")))?;

    let salted = salted_password(password, salt, iterations);
    let client_key = hmac_sha256(&salted, b"Client Key")?;
    let stored_key = Sha256::digest(client_key);
    let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;

    let recovered: Vec<u8> = proof
        .iter()
        .zip(client_signature.iter())
        .map(|(p, s)| p ^ s)
        .collect();
    if proof.len() != 32 || Sha256::digest(&recovered).as_slice() != stored_key.as_slice() {
        return Err(Error::Auth("SCRAM: client proof mismatch".into()));
    }

    let server_key = hmac_sha256(&salted, b"Server Key")?;
    let signature = hmac_sha256(&server_key, auth_message.as_bytes())?;
    Ok(format!("v={}", BASE64.encode(signature)))
}
