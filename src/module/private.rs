//! XEP-0049: Private XML Storage.

use async_trait::async_trait;
use minidom::Element;

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::module::{HandlerContext, IqHandler};
use crate::parser::ns;
use crate::stanza::Iq;

pub struct Private;

impl Private {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Private {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IqHandler for Private {
    fn matches(&self, iq: &Iq) -> bool {
        (iq.is_get() || iq.is_set()) && iq.matches_payload("query", ns::PRIVATE)
    }

    async fn process(&self, iq: &Iq, ctx: &HandlerContext) -> Result<Vec<Element>, XmppError> {
        let Some(query) = iq.payload_named("query", ns::PRIVATE) else {
            return Ok(vec![iq.error_reply(
                StanzaErrorType::Modify,
                StanzaErrorCondition::BadRequest,
            )]);
        };

        // private storage is scoped to the owner; the wrapped elements
        // select the namespace being read or written
        let children: Vec<&Element> = query.children().collect();
        if children.is_empty() {
            return Ok(vec![iq.error_reply(
                StanzaErrorType::Modify,
                StanzaErrorCondition::BadRequest,
            )]);
        }

        if iq.is_get() {
            let keyed = children[0];
            let stored = ctx
                .storage
                .fetch_private_xml(&ctx.username, &keyed.ns())
                .await?;
            let mut reply_query = Element::builder("query", ns::PRIVATE).build();
            if stored.is_empty() {
                // echo the empty keying element back
                reply_query.append_child(keyed.clone());
            } else {
                for element in stored {
                    reply_query.append_child(element);
                }
            }
            return Ok(vec![iq.result_with_payload(reply_query)]);
        }

        for child in &children {
            ctx.storage
                .insert_or_update_private_xml(&ctx.username, &child.ns(), &[(*child).clone()])
                .await?;
        }
        Ok(vec![iq.result()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::tests_support::{context, iq_get, iq_set};

    #[tokio::test]
    async fn test_private_set_then_get() {
        let ctx = context().await;
        let private = Private::new();

        let set = iq_set(
            "pr1",
            "<query xmlns='jabber:iq:private'><exodus xmlns='exodus:prefs'><defaultnick>Hamlet</defaultnick></exodus></query>",
        );
        assert!(private.matches(&set));
        let replies = private.process(&set, &ctx).await.unwrap();
        assert_eq!(replies[0].attr("type"), Some("result"));

        let get = iq_get(
            "pr2",
            "<query xmlns='jabber:iq:private'><exodus xmlns='exodus:prefs'/></query>",
        );
        let replies = private.process(&get, &ctx).await.unwrap();
        let query = replies[0].get_child("query", ns::PRIVATE).unwrap();
        let exodus = query.get_child("exodus", "exodus:prefs").unwrap();
        assert_eq!(
            exodus.get_child("defaultnick", "exodus:prefs").unwrap().text(),
            "Hamlet"
        );
    }

    #[tokio::test]
    async fn test_private_get_unset_namespace_echoes_key() {
        let ctx = context().await;
        let private = Private::new();

        let get = iq_get(
            "pr3",
            "<query xmlns='jabber:iq:private'><storage xmlns='storage:bookmarks'/></query>",
        );
        let replies = private.process(&get, &ctx).await.unwrap();
        let query = replies[0].get_child("query", ns::PRIVATE).unwrap();
        assert!(query.get_child("storage", "storage:bookmarks").is_some());
    }

    #[tokio::test]
    async fn test_private_empty_query_is_bad_request() {
        let ctx = context().await;
        let private = Private::new();

        let get = iq_get("pr4", "<query xmlns='jabber:iq:private'/>");
        let replies = private.process(&get, &ctx).await.unwrap();
        assert_eq!(replies[0].attr("type"), Some("error"));
    }
}
