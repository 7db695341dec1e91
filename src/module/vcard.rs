//! XEP-0054: vcard-temp.

use async_trait::async_trait;
use minidom::Element;

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::module::{HandlerContext, IqHandler};
use crate::parser::ns;
use crate::stanza::{Iq, JidExt};

pub struct Vcard;

impl Vcard {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Vcard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IqHandler for Vcard {
    fn matches(&self, iq: &Iq) -> bool {
        (iq.is_get() || iq.is_set()) && iq.matches_payload("vCard", ns::VCARD)
    }

    async fn process(&self, iq: &Iq, ctx: &HandlerContext) -> Result<Vec<Element>, XmppError> {
        let to = iq.to_jid();
        // a vCard query without a node addresses the requester's own card
        let target = match to.node() {
            Some(node) => node.as_str().to_string(),
            None => ctx.username.clone(),
        };

        if iq.is_set() {
            if target != ctx.username {
                return Ok(vec![iq.error_reply(
                    StanzaErrorType::Cancel,
                    StanzaErrorCondition::NotAllowed,
                )]);
            }
            let Some(vcard) = iq.payload_named("vCard", ns::VCARD) else {
                return Ok(vec![iq.error_reply(
                    StanzaErrorType::Modify,
                    StanzaErrorCondition::BadRequest,
                )]);
            };
            ctx.storage
                .insert_or_update_vcard(&ctx.username, vcard)
                .await?;
            return Ok(vec![iq.result()]);
        }

        if !to.is_server() && to.node().is_some() {
            // reading another account's card requires it to exist
            if !ctx.storage.user_exists(&target).await? {
                return Ok(vec![iq.error_reply(
                    StanzaErrorType::Cancel,
                    StanzaErrorCondition::ItemNotFound,
                )]);
            }
        }

        match ctx.storage.fetch_vcard(&target).await? {
            Some(vcard) => Ok(vec![iq.result_with_payload(vcard)]),
            None => Ok(vec![
                iq.result_with_payload(Element::builder("vCard", ns::VCARD).build()),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::tests_support::{context, iq_get, iq_set};
    use crate::stanza::Iq;

    #[tokio::test]
    async fn test_vcard_set_then_get_own() {
        let ctx = context().await;
        let vcard = Vcard::new();

        let set = iq_set(
            "v1",
            "<vCard xmlns='vcard-temp'><FN>Alice</FN></vCard>",
        );
        assert!(vcard.matches(&set));
        let replies = vcard.process(&set, &ctx).await.unwrap();
        assert_eq!(replies[0].attr("type"), Some("result"));

        let get = iq_get("v2", "<vCard xmlns='vcard-temp'/>");
        let replies = vcard.process(&get, &ctx).await.unwrap();
        let card = replies[0].get_child("vCard", ns::VCARD).unwrap();
        assert_eq!(card.get_child("FN", ns::VCARD).unwrap().text(), "Alice");
    }

    #[tokio::test]
    async fn test_vcard_get_without_card_returns_empty() {
        let ctx = context().await;
        let vcard = Vcard::new();
        let get = iq_get("v3", "<vCard xmlns='vcard-temp'/>");
        let replies = vcard.process(&get, &ctx).await.unwrap();
        let card = replies[0].get_child("vCard", ns::VCARD).unwrap();
        assert_eq!(card.children().count(), 0);
    }

    #[tokio::test]
    async fn test_vcard_set_other_is_not_allowed() {
        let ctx = context().await;
        let vcard = Vcard::new();

        let elem: Element = "<iq xmlns='jabber:client' id='v4' type='set' from='alice@localhost/home' to='bob@localhost'><vCard xmlns='vcard-temp'><FN>Bob</FN></vCard></iq>".parse().unwrap();
        let iq = Iq::from_element(
            elem,
            "alice@localhost/home".parse().unwrap(),
            "bob@localhost".parse().unwrap(),
        )
        .unwrap();

        let replies = vcard.process(&iq, &ctx).await.unwrap();
        assert_eq!(replies[0].attr("type"), Some("error"));
        let error = replies[0].get_child("error", ns::JABBER_CLIENT).unwrap();
        assert!(error.get_child("not-allowed", ns::STANZAS).is_some());
    }

    #[tokio::test]
    async fn test_vcard_get_unknown_user_is_item_not_found() {
        let ctx = context().await;
        let vcard = Vcard::new();

        let elem: Element = "<iq xmlns='jabber:client' id='v5' type='get' from='alice@localhost/home' to='ghost@localhost'><vCard xmlns='vcard-temp'/></iq>".parse().unwrap();
        let iq = Iq::from_element(
            elem,
            "alice@localhost/home".parse().unwrap(),
            "ghost@localhost".parse().unwrap(),
        )
        .unwrap();

        let replies = vcard.process(&iq, &ctx).await.unwrap();
        let error = replies[0].get_child("error", ns::JABBER_CLIENT).unwrap();
        assert!(error.get_child("item-not-found", ns::STANZAS).is_some());
    }
}
