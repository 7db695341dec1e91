//! XEP-0191: Blocking Command.
//!
//! Blocklist retrieval and block/unblock sets. Changes invalidate the
//! router's blocklist cache and are pushed to the user's other bound
//! streams.

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use uuid::Uuid;

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::module::{HandlerContext, IqHandler};
use crate::parser::ns;
use crate::stanza::Iq;

pub struct Blocking;

impl Blocking {
    pub fn new() -> Self {
        Self
    }

    fn item_jids(payload: &Element) -> Result<Vec<String>, ()> {
        let mut jids = Vec::new();
        for item in payload.children().filter(|c| c.name() == "item") {
            let Some(jid) = item.attr("jid") else { return Err(()) };
            if jid.parse::<Jid>().is_err() {
                return Err(());
            }
            jids.push(jid.to_string());
        }
        Ok(jids)
    }

    /// Push the change to every bound stream of the account.
    async fn push_to_streams(&self, ctx: &HandlerContext, payload: Element) {
        let bare = ctx.jid.to_bare();
        for stream in ctx.router.streams_matching_jid(&bare) {
            let push = Element::builder("iq", ns::JABBER_CLIENT)
                .attr("type", "set")
                .attr("id", format!("push-{}", Uuid::new_v4()))
                .attr("to", stream.jid().to_string())
                .append(payload.clone())
                .build();
            stream.handle().send_element(push).await;
        }
    }
}

impl Default for Blocking {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IqHandler for Blocking {
    fn matches(&self, iq: &Iq) -> bool {
        (iq.is_get() && iq.matches_payload("blocklist", ns::BLOCKING))
            || (iq.is_set()
                && (iq.matches_payload("block", ns::BLOCKING)
                    || iq.matches_payload("unblock", ns::BLOCKING)))
    }

    async fn process(&self, iq: &Iq, ctx: &HandlerContext) -> Result<Vec<Element>, XmppError> {
        if iq.is_get() {
            let items = ctx.storage.fetch_blocklist_items(&ctx.username).await?;
            let mut blocklist = Element::builder("blocklist", ns::BLOCKING).build();
            for jid in items {
                blocklist.append_child(
                    Element::builder("item", ns::BLOCKING).attr("jid", jid).build(),
                );
            }
            return Ok(vec![iq.result_with_payload(blocklist)]);
        }

        if let Some(block) = iq.payload_named("block", ns::BLOCKING) {
            let jids = match Self::item_jids(block) {
                Ok(jids) if !jids.is_empty() => jids,
                // a block set must name at least one valid JID
                _ => {
                    return Ok(vec![iq.error_reply(
                        StanzaErrorType::Modify,
                        StanzaErrorCondition::BadRequest,
                    )])
                }
            };
            ctx.storage
                .insert_blocklist_items(&ctx.username, &jids)
                .await?;
            ctx.router.reload_blocklist(&ctx.username);
            self.push_to_streams(ctx, block.clone()).await;
            return Ok(vec![iq.result()]);
        }

        if let Some(unblock) = iq.payload_named("unblock", ns::BLOCKING) {
            let jids = match Self::item_jids(unblock) {
                Ok(jids) => jids,
                Err(()) => {
                    return Ok(vec![iq.error_reply(
                        StanzaErrorType::Modify,
                        StanzaErrorCondition::BadRequest,
                    )])
                }
            };
            // an empty unblock clears the whole list
            ctx.storage
                .delete_blocklist_items(&ctx.username, &jids)
                .await?;
            ctx.router.reload_blocklist(&ctx.username);
            self.push_to_streams(ctx, unblock.clone()).await;
            return Ok(vec![iq.result()]);
        }

        Ok(vec![iq.error_reply(
            StanzaErrorType::Modify,
            StanzaErrorCondition::BadRequest,
        )])
    }
}
