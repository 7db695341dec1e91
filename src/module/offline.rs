//! XEP-0160: Offline message storage.
//!
//! Not an IQ handler: the stream calls [`Offline::archive_message`] when
//! the router reports an offline recipient, and
//! [`Offline::deliver_messages`] once per stream lifetime when the first
//! non-negative-priority presence arrives.

use chrono::Utc;
use minidom::Element;
use tracing::debug;

use crate::config::OfflineConfig;
use crate::error::XmppError;
use crate::module::HandlerContext;
use crate::parser::ns;
use crate::stanza::{Message, Stanza};

pub struct Offline {
    cfg: OfflineConfig,
}

impl Offline {
    pub fn new(cfg: OfflineConfig) -> Self {
        Self { cfg }
    }

    /// Whether this message should be archived at all. Chat and groupchat
    /// messages with a body follow the configured policy.
    pub fn should_archive(&self, message: &Message) -> bool {
        if (message.is_chat() || message.is_groupchat()) && message.has_body() {
            return self.cfg.archive_chat;
        }
        true
    }

    /// Queue a message for an offline recipient, stamped with a delay
    /// marker. Returns the error reply to send when the queue is full.
    pub async fn archive_message(
        &self,
        message: &Message,
        ctx: &HandlerContext,
    ) -> Result<Option<Element>, XmppError> {
        let username = match message.to_jid().node() {
            Some(node) => node.as_str().to_string(),
            None => return Ok(None),
        };

        let queued = ctx.storage.count_offline_messages(&username).await?;
        if queued >= self.cfg.queue_size {
            debug!(user = %username, queued, "Offline queue full");
            return Ok(Some(
                Stanza::Message(message.clone()).service_unavailable_error(),
            ));
        }

        let mut archived = message.element().clone();
        archived.append_child(
            Element::builder("delay", ns::DELAY)
                .attr("from", ctx.domain.clone())
                .attr("stamp", Utc::now().to_rfc3339())
                .build(),
        );
        ctx.storage
            .insert_offline_message(&username, &archived)
            .await?;
        debug!(user = %username, "Message archived for offline delivery");
        Ok(None)
    }

    /// Drain the queue for delivery to the newly available stream.
    pub async fn deliver_messages(
        &self,
        ctx: &HandlerContext,
    ) -> Result<Vec<Element>, XmppError> {
        let messages = ctx.storage.fetch_offline_messages(&ctx.username).await?;
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        ctx.storage.delete_offline_messages(&ctx.username).await?;
        debug!(user = %ctx.username, count = messages.len(), "Delivering offline messages");
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::tests_support::context;

    fn chat_message(to: &str, body: Option<&str>) -> Message {
        let body_xml = body
            .map(|b| format!("<body>{}</body>", b))
            .unwrap_or_default();
        let element: Element = format!(
            "<message xmlns='jabber:client' from='alice@localhost/home' to='{}' type='chat'>{}</message>",
            to, body_xml
        )
        .parse()
        .unwrap();
        Message::from_element(
            element,
            "alice@localhost/home".parse().unwrap(),
            to.parse().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_archive_stamps_delay() {
        let ctx = context().await;
        let offline = Offline::new(OfflineConfig::default());
        let message = chat_message("bob@localhost", Some("hi"));

        assert!(offline.should_archive(&message));
        let reply = offline.archive_message(&message, &ctx).await.unwrap();
        assert!(reply.is_none());

        let stored = ctx.storage.fetch_offline_messages("bob").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].get_child("delay", ns::DELAY).is_some());
    }

    #[tokio::test]
    async fn test_chat_policy_disables_archiving() {
        let ctx = context().await;
        let offline = Offline::new(OfflineConfig {
            queue_size: 10,
            archive_chat: false,
        });

        let with_body = chat_message("bob@localhost", Some("hi"));
        assert!(!offline.should_archive(&with_body));

        // a bodyless chat state update is still archived
        let without_body = chat_message("bob@localhost", None);
        assert!(offline.should_archive(&without_body));
        let _ = ctx;
    }

    #[tokio::test]
    async fn test_queue_full_returns_error_reply() {
        let ctx = context().await;
        let offline = Offline::new(OfflineConfig {
            queue_size: 1,
            archive_chat: true,
        });
        let message = chat_message("bob@localhost", Some("hi"));

        assert!(offline
            .archive_message(&message, &ctx)
            .await
            .unwrap()
            .is_none());
        let reply = offline.archive_message(&message, &ctx).await.unwrap();
        let reply = reply.expect("queue full should produce an error reply");
        assert_eq!(reply.attr("type"), Some("error"));
    }

    #[tokio::test]
    async fn test_deliver_drains_queue() {
        let ctx = context().await;
        let offline = Offline::new(OfflineConfig::default());

        // queue two messages for alice herself
        let message = chat_message("alice@localhost", Some("hello"));
        offline.archive_message(&message, &ctx).await.unwrap();
        offline.archive_message(&message, &ctx).await.unwrap();

        let delivered = offline.deliver_messages(&ctx).await.unwrap();
        assert_eq!(delivered.len(), 2);
        assert!(offline.deliver_messages(&ctx).await.unwrap().is_empty());
    }
}
