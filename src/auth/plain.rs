//! SASL PLAIN mechanism (RFC 4616).
//!
//! Single round trip: `authzid NUL authcid NUL password`. Only offered
//! over secured streams.

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;

use crate::auth::{decode_payload, is_abort, Authenticator, SaslStep};
use crate::error::SaslErrorKind;
use crate::storage::Storage;

pub struct Plain {
    storage: Arc<dyn Storage>,
    username: String,
    authenticated: bool,
}

impl Plain {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            username: String::new(),
            authenticated: false,
        }
    }
}

#[async_trait]
impl Authenticator for Plain {
    fn mechanism(&self) -> &'static str {
        "PLAIN"
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
        let payload = decode_payload(element)?;
        if payload.is_empty() {
            return Err(SaslErrorKind::MalformedRequest);
        }

        let parts: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
        if parts.len() != 3 {
            return Err(SaslErrorKind::MalformedRequest);
        }
        let authcid = String::from_utf8(parts[1].to_vec())
            .map_err(|_| SaslErrorKind::IncorrectEncoding)?;
        let password = String::from_utf8(parts[2].to_vec())
            .map_err(|_| SaslErrorKind::IncorrectEncoding)?;
        if authcid.is_empty() || password.is_empty() {
            return Err(SaslErrorKind::MalformedRequest);
        }

        // accept a bare JID as authcid, using its node part
        let username = match authcid.split_once('@') {
            Some((node, _)) => node.to_string(),
            None => authcid,
        };

        let user = self
            .storage
            .fetch_user(&username)
            .await
            .map_err(|_| SaslErrorKind::TemporaryAuthFailure)?;
        match user {
            Some(user) if user.password == password => {
                self.username = username;
                self.authenticated = true;
                Ok(SaslStep::Success { payload: None })
            }
            _ => Err(SaslErrorKind::NotAuthorized),
        }
    }

    fn reset(&mut self) {
        self.username.clear();
        self.authenticated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, User};
    use base64::prelude::*;

    fn auth_element(payload: &str) -> Element {
        format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            BASE64_STANDARD.encode(payload)
        )
        .parse()
        .unwrap()
    }

    async fn storage_with_alice() -> Arc<dyn Storage> {
        let storage = MemoryStorage::new();
        storage
            .insert_or_update_user(&User::new("alice", "s3cret"))
            .await
            .unwrap();
        Arc::new(storage)
    }

    #[tokio::test]
    async fn test_plain_success() {
        let mut plain = Plain::new(storage_with_alice().await);
        let step = plain.process(&auth_element("\0alice\0s3cret")).await.unwrap();

        assert!(matches!(step, SaslStep::Success { payload: None }));
        assert!(plain.authenticated());
        assert_eq!(plain.username(), "alice");
    }

    #[tokio::test]
    async fn test_plain_accepts_bare_jid_authcid() {
        let mut plain = Plain::new(storage_with_alice().await);
        let step = plain
            .process(&auth_element("\0alice@localhost\0s3cret"))
            .await
            .unwrap();

        assert!(matches!(step, SaslStep::Success { .. }));
        assert_eq!(plain.username(), "alice");
    }

    #[tokio::test]
    async fn test_plain_wrong_password() {
        let mut plain = Plain::new(storage_with_alice().await);
        let err = plain
            .process(&auth_element("\0alice\0wrong"))
            .await
            .unwrap_err();
        assert_eq!(err, SaslErrorKind::NotAuthorized);
        assert!(!plain.authenticated());
    }

    #[tokio::test]
    async fn test_plain_unknown_user() {
        let mut plain = Plain::new(storage_with_alice().await);
        let err = plain
            .process(&auth_element("\0mallory\0s3cret"))
            .await
            .unwrap_err();
        assert_eq!(err, SaslErrorKind::NotAuthorized);
    }

    #[tokio::test]
    async fn test_plain_malformed_payload() {
        let mut plain = Plain::new(storage_with_alice().await);
        let err = plain
            .process(&auth_element("no-separators"))
            .await
            .unwrap_err();
        assert_eq!(err, SaslErrorKind::MalformedRequest);
    }

    #[tokio::test]
    async fn test_plain_reset_clears_state() {
        let mut plain = Plain::new(storage_with_alice().await);
        plain.process(&auth_element("\0alice\0s3cret")).await.unwrap();
        plain.reset();
        assert!(!plain.authenticated());
        assert!(plain.username().is_empty());
    }
}
