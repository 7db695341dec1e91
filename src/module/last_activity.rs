//! XEP-0012: Last Activity.
//!
//! Reports the seconds since a user's last logout, with the status string
//! of their final unavailable presence when one was recorded.

use async_trait::async_trait;
use chrono::Utc;
use minidom::Element;

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::module::{HandlerContext, IqHandler};
use crate::parser::ns;
use crate::stanza::{Iq, JidExt};

pub struct LastActivity;

impl LastActivity {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LastActivity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IqHandler for LastActivity {
    fn matches(&self, iq: &Iq) -> bool {
        iq.is_get() && iq.matches_payload("query", ns::LAST_ACTIVITY)
    }

    async fn process(&self, iq: &Iq, ctx: &HandlerContext) -> Result<Vec<Element>, XmppError> {
        let to = iq.to_jid();

        // a server query reports zero idle time
        if to.is_server() {
            let query = Element::builder("query", ns::LAST_ACTIVITY)
                .attr("seconds", "0")
                .build();
            return Ok(vec![iq.result_with_payload(query)]);
        }

        let username = match to.node() {
            Some(node) => node.as_str().to_string(),
            None => {
                return Ok(vec![iq.error_reply(
                    StanzaErrorType::Modify,
                    StanzaErrorCondition::BadRequest,
                )])
            }
        };
        let user = match ctx.storage.fetch_user(&username).await? {
            Some(user) => user,
            None => {
                return Ok(vec![iq.error_reply(
                    StanzaErrorType::Cancel,
                    StanzaErrorCondition::ItemNotFound,
                )])
            }
        };

        let seconds = user
            .logged_out_at
            .map(|at| (Utc::now() - at).num_seconds().max(0))
            .unwrap_or(0);
        let mut builder = Element::builder("query", ns::LAST_ACTIVITY)
            .attr("seconds", seconds.to_string());
        if let Some(status) = user.logged_out_status {
            builder = builder.append(status);
        }
        Ok(vec![iq.result_with_payload(builder.build())])
    }
}
