//! SASL authentication mechanisms.
//!
//! Each mechanism is a small state machine driven by the `<auth>`,
//! `<response>` and `<abort>` elements of the SASL exchange. The stream
//! owns the mechanism set for its current generation and keeps the active
//! one across `authenticating` round trips.

mod digest_md5;
mod plain;
mod scram;

pub use digest_md5::DigestMd5;
pub use plain::Plain;
pub use scram::{Scram, ScramHash};

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use minidom::Element;
use tracing::warn;

use crate::error::SaslErrorKind;
use crate::storage::Storage;

/// Result of feeding one element into a mechanism.
#[derive(Debug, Clone)]
pub enum SaslStep {
    /// The exchange finished; reply `<success/>`, carrying the additional
    /// data (already base64) when present, and restart the stream.
    Success {
        payload: Option<String>,
    },
    /// More round trips required; reply `<challenge>` with the base64 data.
    Challenge(String),
}

/// One SASL mechanism instance, scoped to a single stream generation.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Mechanism name as advertised in the stream features.
    fn mechanism(&self) -> &'static str;

    /// Authenticated username; empty until the exchange succeeds.
    fn username(&self) -> &str;

    /// Whether the exchange completed successfully.
    fn authenticated(&self) -> bool;

    /// Advance the exchange with one client element.
    async fn process(&mut self, element: &Element) -> Result<SaslStep, SaslErrorKind>;

    /// Destroy any partial exchange state.
    fn reset(&mut self);
}

/// Build the mechanism set for one stream generation, in configuration
/// order. PLAIN is only usable over a secured stream; the SCRAM `-PLUS`
/// variants are offered only when the transport can provide channel
/// binding material.
pub fn build_authenticators(
    names: &[String],
    storage: &Arc<dyn Storage>,
    domain: &str,
    secured: bool,
    channel_binding: Option<Vec<u8>>,
) -> Vec<Box<dyn Authenticator>> {
    let server_supports_cb = channel_binding.is_some();
    let mut authenticators: Vec<Box<dyn Authenticator>> = Vec::new();

    for name in names {
        match name.as_str() {
            "plain" => {
                if secured {
                    authenticators.push(Box::new(Plain::new(Arc::clone(storage))));
                }
            }
            "digest_md5" => {
                authenticators.push(Box::new(DigestMd5::new(
                    Arc::clone(storage),
                    domain.to_string(),
                )));
            }
            "scram_sha_1" => {
                authenticators.push(Box::new(Scram::new(
                    Arc::clone(storage),
                    ScramHash::Sha1,
                    None,
                    server_supports_cb,
                )));
                if let Some(cb) = &channel_binding {
                    authenticators.push(Box::new(Scram::new(
                        Arc::clone(storage),
                        ScramHash::Sha1,
                        Some(cb.clone()),
                        true,
                    )));
                }
            }
            "scram_sha_256" => {
                authenticators.push(Box::new(Scram::new(
                    Arc::clone(storage),
                    ScramHash::Sha256,
                    None,
                    server_supports_cb,
                )));
                if let Some(cb) = &channel_binding {
                    authenticators.push(Box::new(Scram::new(
                        Arc::clone(storage),
                        ScramHash::Sha256,
                        Some(cb.clone()),
                        true,
                    )));
                }
            }
            other => warn!(mechanism = %other, "Unknown SASL mechanism in configuration"),
        }
    }
    authenticators
}

/// Decode the base64 text payload of a SASL element. An empty payload and
/// the `=` placeholder both decode to no data.
pub(crate) fn decode_payload(element: &Element) -> Result<Vec<u8>, SaslErrorKind> {
    let text = element.text();
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(trimmed)
        .map_err(|_| SaslErrorKind::IncorrectEncoding)
}

/// Whether the element aborts the exchange.
pub(crate) fn is_abort(element: &Element) -> bool {
    element.name() == "abort"
}
