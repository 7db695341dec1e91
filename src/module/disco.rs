//! XEP-0030: Service Discovery.
//!
//! Answers disco#info and disco#items queries addressed to the server or
//! to the account's bare JID. Other modules register their features here
//! at session start.

use std::sync::Mutex;

use async_trait::async_trait;
use minidom::Element;

use crate::error::XmppError;
use crate::module::{HandlerContext, IqHandler};
use crate::parser::ns;
use crate::stanza::Iq;

pub struct Disco {
    features: Mutex<Vec<String>>,
}

impl Disco {
    pub fn new() -> Self {
        Self {
            features: Mutex::new(Vec::new()),
        }
    }

    /// Register a feature var for the info response. Insertion order is
    /// preserved in the reply.
    pub fn register_feature(&self, feature: &str) {
        let mut features = self.features.lock().expect("disco lock poisoned");
        if !features.iter().any(|f| f == feature) {
            features.push(feature.to_string());
        }
    }

    pub fn features(&self) -> Vec<String> {
        self.features.lock().expect("disco lock poisoned").clone()
    }
}

impl Default for Disco {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IqHandler for Disco {
    fn matches(&self, iq: &Iq) -> bool {
        iq.is_get()
            && (iq.matches_payload("query", ns::DISCO_INFO)
                || iq.matches_payload("query", ns::DISCO_ITEMS))
    }

    async fn process(&self, iq: &Iq, _ctx: &HandlerContext) -> Result<Vec<Element>, XmppError> {
        if iq.matches_payload("query", ns::DISCO_INFO) {
            let mut query = Element::builder("query", ns::DISCO_INFO)
                .append(
                    Element::builder("identity", ns::DISCO_INFO)
                        .attr("category", "server")
                        .attr("type", "im")
                        .attr("name", env!("CARGO_PKG_NAME"))
                        .build(),
                )
                .build();
            for feature in self.features() {
                query.append_child(
                    Element::builder("feature", ns::DISCO_INFO)
                        .attr("var", feature)
                        .build(),
                );
            }
            return Ok(vec![iq.result_with_payload(query)]);
        }

        // no discoverable items below the server JID
        let query = Element::builder("query", ns::DISCO_ITEMS).build();
        Ok(vec![iq.result_with_payload(query)])
    }
}
