//! SASL DIGEST-MD5 mechanism (RFC 2831, md5-sess).
//!
//! Three round trips: server challenge, client digest response verified
//! against the stored password, then an rspauth challenge the client
//! acknowledges with an empty response.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use md5::{Digest, Md5};
use minidom::Element;
use rand::Rng;

use crate::auth::{decode_payload, is_abort, Authenticator, SaslStep};
use crate::error::SaslErrorKind;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestState {
    Start,
    Challenged,
    WaitingAck,
}

pub struct DigestMd5 {
    storage: Arc<dyn Storage>,
    realm: String,
    state: DigestState,
    nonce: String,
    username: String,
    authenticated: bool,
}

impl DigestMd5 {
    pub fn new(storage: Arc<dyn Storage>, realm: String) -> Self {
        Self {
            storage,
            realm,
            state: DigestState::Start,
            nonce: String::new(),
            username: String::new(),
            authenticated: false,
        }
    }

    fn initial_challenge(&mut self) -> String {
        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill(&mut nonce_bytes[..]);
        self.nonce = BASE64_STANDARD.encode(nonce_bytes);
        format!(
            "realm=\"{}\",nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
            self.realm, self.nonce
        )
    }

    async fn verify_response(
        &mut self,
        element: &Element,
    ) -> Result<SaslStep, SaslErrorKind> {
        let payload = decode_payload(element)?;
        let response = String::from_utf8(payload)
            .map_err(|_| SaslErrorKind::IncorrectEncoding)?;
        let params = parse_digest_pairs(&response);

        let username = params
            .get("username")
            .ok_or(SaslErrorKind::MalformedRequest)?
            .clone();
        let realm = params.get("realm").cloned().unwrap_or_default();
        let nonce = params.get("nonce").ok_or(SaslErrorKind::MalformedRequest)?;
        let cnonce = params.get("cnonce").ok_or(SaslErrorKind::MalformedRequest)?;
        let nc = params.get("nc").ok_or(SaslErrorKind::MalformedRequest)?;
        let digest_uri = params
            .get("digest-uri")
            .ok_or(SaslErrorKind::MalformedRequest)?;
        let proof = params
            .get("response")
            .ok_or(SaslErrorKind::MalformedRequest)?;
        let qop = params.get("qop").map(String::as_str).unwrap_or("auth");

        if nonce != &self.nonce {
            return Err(SaslErrorKind::NotAuthorized);
        }
        if nc != "00000001" || qop != "auth" {
            return Err(SaslErrorKind::MalformedRequest);
        }
        if !digest_uri.starts_with("xmpp/") {
            return Err(SaslErrorKind::NotAuthorized);
        }

        let user = self
            .storage
            .fetch_user(&username)
            .await
            .map_err(|_| SaslErrorKind::TemporaryAuthFailure)?
            .ok_or(SaslErrorKind::NotAuthorized)?;

        let expected = digest_response(
            &username,
            &realm,
            &user.password,
            &self.nonce,
            cnonce,
            nc,
            qop,
            digest_uri,
            "AUTHENTICATE",
        );
        if !expected.eq_ignore_ascii_case(proof) {
            return Err(SaslErrorKind::NotAuthorized);
        }

        let rspauth = digest_response(
            &username,
            &realm,
            &user.password,
            &self.nonce,
            cnonce,
            nc,
            qop,
            digest_uri,
            "",
        );
        self.username = username;
        self.state = DigestState::WaitingAck;
        Ok(SaslStep::Challenge(
            BASE64_STANDARD.encode(format!("rspauth={}", rspauth)),
        ))
    }
}

#[async_trait]
impl Authenticator for DigestMd5 {
    fn mechanism(&self) -> &'static str {
        "DIGEST-MD5"
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
            DigestState::Start => {
                let challenge = self.initial_challenge();
                self.state = DigestState::Challenged;
                Ok(SaslStep::Challenge(BASE64_STANDARD.encode(challenge)))
            }
            DigestState::Challenged => self.verify_response(element).await,
            DigestState::WaitingAck => {
                self.authenticated = true;
                Ok(SaslStep::Success { payload: None })
            }
        }
    }

    fn reset(&mut self) {
        self.state = DigestState::Start;
        self.nonce.clear();
        self.username.clear();
        self.authenticated = false;
    }
}

/// Compute a DIGEST-MD5 response value (RFC 2831 Section 2.1.2.1,
/// md5-sess). An empty `a2_prefix` yields the rspauth value.
#[allow(clippy::too_many_arguments)]
fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    qop: &str,
    digest_uri: &str,
    a2_prefix: &str,
) -> String {
    let x = format!("{}:{}:{}", username, realm, password);
    let y = md5_raw(x.as_bytes());

    let mut a1 = y.to_vec();
    a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
    let ha1 = hex::encode(md5_raw(&a1));

    let a2 = format!("{}:{}", a2_prefix, digest_uri);
    let ha2 = hex::encode(md5_raw(a2.as_bytes()));

    let kd = format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2);
    hex::encode(md5_raw(kd.as_bytes()))
}

fn md5_raw(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Split a digest response into key/value pairs, honoring quoted values.
fn parse_digest_pairs(response: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    let mut rest = response.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(close) = stripped.find('"') else { break };
            value = stripped[..close].to_string();
            rest = stripped[close + 1..].trim_start_matches(',').trim_start();
        } else {
            match rest.find(',') {
                Some(comma) => {
                    value = rest[..comma].trim().to_string();
                    rest = rest[comma + 1..].trim_start();
                }
                None => {
                    value = rest.trim().to_string();
                    rest = "";
                }
            }
        }
        pairs.insert(key, value);
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, User};

    fn sasl_element(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    async fn storage_with_alice() -> Arc<dyn Storage> {
        let storage = MemoryStorage::new();
        storage
            .insert_or_update_user(&User::new("alice", "s3cret"))
            .await
            .unwrap();
        Arc::new(storage)
    }

    #[test]
    fn test_parse_digest_pairs() {
        let parsed = parse_digest_pairs(
            "username=\"alice\",realm=\"localhost\",nonce=\"abc,def\",nc=00000001,qop=auth",
        );
        assert_eq!(parsed.get("username").unwrap(), "alice");
        assert_eq!(parsed.get("nonce").unwrap(), "abc,def");
        assert_eq!(parsed.get("nc").unwrap(), "00000001");
        assert_eq!(parsed.get("qop").unwrap(), "auth");
    }

    #[tokio::test]
    async fn test_digest_md5_full_exchange() {
        let mut mech = DigestMd5::new(storage_with_alice().await, "localhost".to_string());

        // step 1: empty auth, server challenges
        let auth = sasl_element(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='DIGEST-MD5'/>",
        );
        let step = mech.process(&auth).await.unwrap();
        let challenge = match step {
            SaslStep::Challenge(data) => {
                String::from_utf8(BASE64_STANDARD.decode(data).unwrap()).unwrap()
            }
            other => panic!("expected challenge, got {:?}", other),
        };
        let params = parse_digest_pairs(&challenge);
        let nonce = params.get("nonce").unwrap().clone();
        assert_eq!(params.get("qop").unwrap(), "auth");

        // step 2: client computes its digest response
        let cnonce = "client-nonce";
        let digest_uri = "xmpp/localhost";
        let response_value = digest_response(
            "alice",
            "localhost",
            "s3cret",
            &nonce,
            cnonce,
            "00000001",
            "auth",
            digest_uri,
            "AUTHENTICATE",
        );
        let client_response = format!(
            "username=\"alice\",realm=\"localhost\",nonce=\"{}\",cnonce=\"{}\",nc=00000001,qop=auth,digest-uri=\"{}\",response={}",
            nonce, cnonce, digest_uri, response_value
        );
        let response = sasl_element(&format!(
            "<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{}</response>",
            BASE64_STANDARD.encode(client_response)
        ));

        let step = mech.process(&response).await.unwrap();
        let rspauth = match step {
            SaslStep::Challenge(data) => {
                String::from_utf8(BASE64_STANDARD.decode(data).unwrap()).unwrap()
            }
            other => panic!("expected rspauth challenge, got {:?}", other),
        };
        assert!(rspauth.starts_with("rspauth="));
        assert!(!mech.authenticated());

        // step 3: client acknowledges
        let ack = sasl_element("<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        let step = mech.process(&ack).await.unwrap();
        assert!(matches!(step, SaslStep::Success { payload: None }));
        assert!(mech.authenticated());
        assert_eq!(mech.username(), "alice");
    }

    #[tokio::test]
    async fn test_digest_md5_wrong_password() {
        let mut mech = DigestMd5::new(storage_with_alice().await, "localhost".to_string());

        let auth = sasl_element(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='DIGEST-MD5'/>",
        );
        let step = mech.process(&auth).await.unwrap();
        let challenge = match step {
            SaslStep::Challenge(data) => {
                String::from_utf8(BASE64_STANDARD.decode(data).unwrap()).unwrap()
            }
            other => panic!("expected challenge, got {:?}", other),
        };
        let nonce = parse_digest_pairs(&challenge).get("nonce").unwrap().clone();

        let bad_value = digest_response(
            "alice",
            "localhost",
            "wrong-password",
            &nonce,
            "cnonce",
            "00000001",
            "auth",
            "xmpp/localhost",
            "AUTHENTICATE",
        );
        let client_response = format!(
            "username=\"alice\",realm=\"localhost\",nonce=\"{}\",cnonce=\"cnonce\",nc=00000001,qop=auth,digest-uri=\"xmpp/localhost\",response={}",
            nonce, bad_value
        );
        let response = sasl_element(&format!(
            "<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{}</response>",
            BASE64_STANDARD.encode(client_response)
        ));

        let err = mech.process(&response).await.unwrap_err();
        assert_eq!(err, SaslErrorKind::NotAuthorized);
    }

    #[tokio::test]
    async fn test_digest_md5_stale_nonce() {
        let mut mech = DigestMd5::new(storage_with_alice().await, "localhost".to_string());
        let auth = sasl_element(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='DIGEST-MD5'/>",
        );
        mech.process(&auth).await.unwrap();

        let client_response = "username=\"alice\",realm=\"localhost\",nonce=\"stale\",cnonce=\"c\",nc=00000001,qop=auth,digest-uri=\"xmpp/localhost\",response=0000";
        let response = sasl_element(&format!(
            "<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{}</response>",
            BASE64_STANDARD.encode(client_response)
        ));
        let err = mech.process(&response).await.unwrap_err();
        assert_eq!(err, SaslErrorKind::NotAuthorized);
    }
}
