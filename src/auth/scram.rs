//! SCRAM SASL mechanisms (RFC 5802, RFC 7677).
//!
//! Server side of SCRAM-SHA-1 and SCRAM-SHA-256, each with a `-PLUS`
//! channel-binding variant. Two round trips:
//!
//! 1. client-first-message `gs2,n=user,r=cnonce` → server-first-message
//!    `r=nonce,s=salt,i=iterations`
//! 2. client-final-message `c=channel,r=nonce,p=proof` → verification and
//!    server signature, delivered in the SASL success payload

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use hmac::{Hmac, Mac};
use minidom::Element;
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::auth::{decode_payload, is_abort, Authenticator, SaslStep};
use crate::error::SaslErrorKind;
use crate::storage::Storage;

/// PBKDF2 iteration count announced in the server-first-message.
/// RFC 7677 recommends at least 4096.
pub const DEFAULT_ITERATIONS: u32 = 4096;

/// Length of the generated server nonce in bytes (base64 encoded on wire).
const NONCE_LENGTH: usize = 24;

/// Hash function backing the mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScramState {
    Initial,
    WaitingClientFinal,
}

/// Server-side SCRAM state machine.
pub struct Scram {
    storage: Arc<dyn Storage>,
    hash: ScramHash,
    /// Channel binding material; `Some` makes this a `-PLUS` variant
    channel_binding: Option<Vec<u8>>,
    /// Whether any `-PLUS` variant is offered on this stream
    server_supports_cb: bool,
    state: ScramState,
    username: String,
    authenticated: bool,
    gs2_header: String,
    client_first_bare: String,
    server_first: String,
    combined_nonce: String,
    stored_key: Vec<u8>,
    server_key: Vec<u8>,
}

impl Scram {
    pub fn new(
        storage: Arc<dyn Storage>,
        hash: ScramHash,
        channel_binding: Option<Vec<u8>>,
        server_supports_cb: bool,
    ) -> Self {
        Self {
            storage,
            hash,
            channel_binding,
            server_supports_cb,
            state: ScramState::Initial,
            username: String::new(),
            authenticated: false,
            gs2_header: String::new(),
            client_first_bare: String::new(),
            server_first: String::new(),
            combined_nonce: String::new(),
            stored_key: Vec::new(),
            server_key: Vec::new(),
        }
    }

    fn is_plus(&self) -> bool {
        self.channel_binding.is_some()
    }

    async fn process_client_first(
        &mut self,
        element: &Element,
    ) -> Result<SaslStep, SaslErrorKind> {
        let payload = decode_payload(element)?;
        let client_first =
            String::from_utf8(payload).map_err(|_| SaslErrorKind::IncorrectEncoding)?;
        let parsed = parse_client_first(&client_first)?;

        match parsed.gs2_cbind_flag {
            'p' => {
                if !self.is_plus() {
                    return Err(SaslErrorKind::MalformedRequest);
                }
                // only TLS-derived bindings are supported
                let name = parsed.cbind_name.as_deref().unwrap_or("");
                if name != "tls-exporter" && name != "tls-unique" {
                    return Err(SaslErrorKind::MalformedRequest);
                }
            }
            'n' => {
                if self.is_plus() {
                    return Err(SaslErrorKind::MalformedRequest);
                }
            }
            'y' => {
                // the client believes we do not support channel binding;
                // reject if we advertised a -PLUS variant
                if self.is_plus() || self.server_supports_cb {
                    return Err(SaslErrorKind::NotAuthorized);
                }
            }
            _ => return Err(SaslErrorKind::MalformedRequest),
        }

        let user = self
            .storage
            .fetch_user(&parsed.username)
            .await
            .map_err(|_| SaslErrorKind::TemporaryAuthFailure)?
            .ok_or(SaslErrorKind::NotAuthorized)?;

        let mut salt = [0u8; 16];
        rand::rng().fill(&mut salt[..]);
        let (stored_key, server_key) =
            derive_keys(self.hash, &user.password, &salt, DEFAULT_ITERATIONS);
        self.stored_key = stored_key;
        self.server_key = server_key;

        self.username = parsed.username;
        self.gs2_header = parsed.gs2_header;
        self.client_first_bare = parsed.bare;

        let mut server_nonce = [0u8; NONCE_LENGTH];
        rand::rng().fill(&mut server_nonce[..]);
        self.combined_nonce = format!(
            "{}{}",
            parsed.client_nonce,
            BASE64_STANDARD.encode(server_nonce)
        );
        self.server_first = format!(
            "r={},s={},i={}",
            self.combined_nonce,
            BASE64_STANDARD.encode(salt),
            DEFAULT_ITERATIONS
        );

        self.state = ScramState::WaitingClientFinal;
        Ok(SaslStep::Challenge(
            BASE64_STANDARD.encode(&self.server_first),
        ))
    }

    fn process_client_final(&mut self, element: &Element) -> Result<SaslStep, SaslErrorKind> {
        let payload = decode_payload(element)?;
        let client_final =
            String::from_utf8(payload).map_err(|_| SaslErrorKind::IncorrectEncoding)?;
        let parsed = parse_client_final(&client_final)?;

        if parsed.nonce != self.combined_nonce {
            return Err(SaslErrorKind::NotAuthorized);
        }

        // the c= value must carry the gs2 header, plus the binding data on
        // a -PLUS exchange; a mismatch means a downgrade or MITM attempt
        let mut expected_cbind = self.gs2_header.clone().into_bytes();
        if let Some(cb) = &self.channel_binding {
            expected_cbind.extend_from_slice(cb);
        }
        if parsed.channel_binding != BASE64_STANDARD.encode(&expected_cbind) {
            return Err(SaslErrorKind::NotAuthorized);
        }

        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, parsed.without_proof
        );

        let client_signature = hmac(self.hash, &self.stored_key, auth_message.as_bytes());
        let client_proof = BASE64_STANDARD
            .decode(&parsed.proof)
            .map_err(|_| SaslErrorKind::IncorrectEncoding)?;
        if client_proof.len() != client_signature.len() {
            return Err(SaslErrorKind::NotAuthorized);
        }
        let client_key: Vec<u8> = client_proof
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        if hash(self.hash, &client_key) != self.stored_key {
            return Err(SaslErrorKind::NotAuthorized);
        }

        let server_signature = hmac(self.hash, &self.server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64_STANDARD.encode(server_signature));

        self.authenticated = true;
        Ok(SaslStep::Success {
            payload: Some(BASE64_STANDARD.encode(server_final)),
        })
    }
}

#[async_trait]
impl Authenticator for Scram {
    fn mechanism(&self) -> &'static str {
        match (self.hash, self.is_plus()) {
            (ScramHash::Sha1, false) => "SCRAM-SHA-1",
            (ScramHash::Sha1, true) => "SCRAM-SHA-1-PLUS",
            (ScramHash::Sha256, false) => "SCRAM-SHA-256",
            (ScramHash::Sha256, true) => "SCRAM-SHA-256-PLUS",
        }
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    async fn process(&mut self, element: &Element) -> Result<SaslStep, SaslErrorKind> {
        if is_abort(element) {
            return Err(SaslErrorKind::Aborted);
        }
        match self.state {
            ScramState::Initial => self.process_client_first(element).await,
            ScramState::WaitingClientFinal => self.process_client_final(element),
        }
    }

    fn reset(&mut self) {
        self.state = ScramState::Initial;
        self.username.clear();
        self.authenticated = false;
        self.gs2_header.clear();
        self.client_first_bare.clear();
        self.server_first.clear();
        self.combined_nonce.clear();
        self.stored_key.clear();
        self.server_key.clear();
    }
}

/// Derive `(StoredKey, ServerKey)` from a password per RFC 5802.
pub fn derive_keys(
    scram_hash: ScramHash,
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> (Vec<u8>, Vec<u8>) {
    let salted_password = hi(scram_hash, password.as_bytes(), salt, iterations);
    let client_key = hmac(scram_hash, &salted_password, b"Client Key");
    let stored_key = hash(scram_hash, &client_key);
    let server_key = hmac(scram_hash, &salted_password, b"Server Key");
    (stored_key, server_key)
}

/// Hi() from RFC 5802: PBKDF2 over the mechanism hash.
fn hi(scram_hash: ScramHash, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    match scram_hash {
        ScramHash::Sha1 => {
            let mut output = vec![0u8; 20];
            pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut output);
            output
        }
        ScramHash::Sha256 => {
            let mut output = vec![0u8; 32];
            pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
            output
        }
    }
}

fn hmac(scram_hash: ScramHash, key: &[u8], data: &[u8]) -> Vec<u8> {
    match scram_hash {
        ScramHash::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        ScramHash::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn hash(scram_hash: ScramHash, data: &[u8]) -> Vec<u8> {
    match scram_hash {
        ScramHash::Sha1 => {
            let mut hasher = Sha1::new();
            sha1::Digest::update(&mut hasher, data);
            sha1::Digest::finalize(hasher).to_vec()
        }
        ScramHash::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hasher.finalize().to_vec()
        }
    }
}

/// Parsed client-first-message components.
#[derive(Debug, Clone)]
struct ClientFirstMessage {
    gs2_cbind_flag: char,
    /// Channel binding name when the flag is 'p'
    cbind_name: Option<String>,
    /// The raw gs2 header including trailing comma, e.g. `n,,`
    gs2_header: String,
    username: String,
    client_nonce: String,
    /// client-first-message-bare, for auth message computation
    bare: String,
}

/// Parsed client-final-message components.
#[derive(Debug, Clone)]
struct ClientFinalMessage {
    channel_binding: String,
    nonce: String,
    proof: String,
    without_proof: String,
}

/// Parse `gs2-header client-first-message-bare`.
fn parse_client_first(message: &str) -> Result<ClientFirstMessage, SaslErrorKind> {
    let parts: Vec<&str> = message.splitn(3, ',').collect();
    if parts.len() < 3 {
        return Err(SaslErrorKind::MalformedRequest);
    }

    let gs2_cbind_flag = parts[0]
        .chars()
        .next()
        .ok_or(SaslErrorKind::MalformedRequest)?;
    let cbind_name = parts[0].strip_prefix("p=").map(str::to_string);
    let gs2_header = format!("{},{},", parts[0], parts[1]);
    let bare = parts[2].to_string();

    let mut username = None;
    let mut client_nonce = None;
    for attr in bare.split(',') {
        if let Some(val) = attr.strip_prefix("n=") {
            username = Some(decode_sasl_name(val)?);
        } else if let Some(val) = attr.strip_prefix("r=") {
            client_nonce = Some(val.to_string());
        }
    }

    Ok(ClientFirstMessage {
        gs2_cbind_flag,
        cbind_name,
        gs2_header,
        username: username.ok_or(SaslErrorKind::MalformedRequest)?,
        client_nonce: client_nonce.ok_or(SaslErrorKind::MalformedRequest)?,
        bare,
    })
}

/// Parse `c=channel-binding,r=nonce,p=proof`.
fn parse_client_final(message: &str) -> Result<ClientFinalMessage, SaslErrorKind> {
    let proof_idx = message
        .rfind(",p=")
        .ok_or(SaslErrorKind::MalformedRequest)?;
    let without_proof = message[..proof_idx].to_string();

    let mut channel_binding = None;
    let mut nonce = None;
    let mut proof = None;
    for attr in message.split(',') {
        if let Some(val) = attr.strip_prefix("c=") {
            channel_binding = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("r=") {
            nonce = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("p=") {
            proof = Some(val.to_string());
        }
    }

    Ok(ClientFinalMessage {
        channel_binding: channel_binding.ok_or(SaslErrorKind::MalformedRequest)?,
        nonce: nonce.ok_or(SaslErrorKind::MalformedRequest)?,
        proof: proof.ok_or(SaslErrorKind::MalformedRequest)?,
        without_proof,
    })
}

/// Decode a SASL name (RFC 5802 escaping): `=2C` → `,` and `=3D` → `=`.
fn decode_sasl_name(name: &str) -> Result<String, SaslErrorKind> {
    let mut result = String::new();
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '=' {
            let escape: String = chars.by_ref().take(2).collect();
            match escape.as_str() {
                "2C" => result.push(','),
                "3D" => result.push('='),
                _ => return Err(SaslErrorKind::MalformedRequest),
            }
        } else {
            result.push(c);
        }
    }
    Ok(result)
}
