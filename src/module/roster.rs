//! Roster management and presence subscription handling (RFC 6121).
//!
//! Beyond the `jabber:iq:roster` get/set surface, the stream drives four
//! hooks: subscription stanzas addressed to other bare JIDs, the one-shot
//! delivery of pending approval notifications, the one-shot backfill of
//! contact presences, and presence broadcast to subscribers.

use async_trait::async_trait;
use jid::{BareJid, Jid};
use minidom::Element;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::config::RosterConfig;
use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::module::{HandlerContext, IqHandler};
use crate::parser::ns;
use crate::stanza::{Iq, Presence, PresenceKind};
use crate::storage::{RosterItem, Subscription};

pub struct Roster {
    cfg: RosterConfig,
}

impl Roster {
    pub fn new(cfg: RosterConfig) -> Self {
        Self { cfg }
    }

    pub fn versioning_enabled(&self) -> bool {
        self.cfg.versioning
    }

    /// Handle a subscription-related presence addressed to another bare
    /// JID. Returns the elements to write back on the sender's stream.
    pub async fn process_presence(
        &self,
        presence: &Presence,
        ctx: &HandlerContext,
    ) -> Result<Vec<Element>, XmppError> {
        let peer_bare = presence.to_jid().to_bare();
        match presence.kind() {
            PresenceKind::Subscribe => {
                self.update_own_item(ctx, &peer_bare, |item| item.ask = true)
                    .await?;
                self.forward(ctx, &peer_bare, presence.element(), true).await?;
            }
            PresenceKind::Subscribed => {
                self.update_own_item(ctx, &peer_bare, |item| {
                    item.subscription =
                        Subscription::from_flags(item.subscription.is_to(), true);
                })
                .await?;
                self.update_peer_item(ctx, &peer_bare, |item| {
                    item.ask = false;
                    item.subscription =
                        Subscription::from_flags(true, item.subscription.is_from());
                })
                .await?;
                self.forward(ctx, &peer_bare, presence.element(), true).await?;
            }
            PresenceKind::Unsubscribe => {
                self.update_own_item(ctx, &peer_bare, |item| {
                    item.ask = false;
                    item.subscription =
                        Subscription::from_flags(false, item.subscription.is_from());
                })
                .await?;
                self.update_peer_item(ctx, &peer_bare, |item| {
                    item.subscription =
                        Subscription::from_flags(item.subscription.is_to(), false);
                })
                .await?;
                self.forward(ctx, &peer_bare, presence.element(), true).await?;
            }
            PresenceKind::Unsubscribed => {
                self.update_own_item(ctx, &peer_bare, |item| {
                    item.subscription =
                        Subscription::from_flags(item.subscription.is_to(), false);
                })
                .await?;
                self.update_peer_item(ctx, &peer_bare, |item| {
                    item.ask = false;
                    item.subscription =
                        Subscription::from_flags(false, item.subscription.is_from());
                })
                .await?;
                self.forward(ctx, &peer_bare, presence.element(), true).await?;
            }
            // directed presence and probes go straight to the peer
            _ => {
                self.forward(ctx, &peer_bare, presence.element(), false).await?;
            }
        }
        Ok(Vec::new())
    }

    /// Deliver subscription requests that arrived while the user was
    /// offline. Invoked once per stream lifetime.
    pub async fn deliver_pending_approval_notifications(
        &self,
        ctx: &HandlerContext,
    ) -> Result<Vec<Element>, XmppError> {
        let pending = ctx.storage.fetch_pending_notifications(&ctx.username).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        ctx.storage.delete_pending_notifications(&ctx.username).await?;
        debug!(user = %ctx.username, count = pending.len(), "Delivering pending approval notifications");
        Ok(pending)
    }

    /// Backfill the presences of subscribed contacts that are currently
    /// online. Invoked once per stream lifetime.
    pub async fn receive_presences(
        &self,
        ctx: &HandlerContext,
    ) -> Result<Vec<Element>, XmppError> {
        let mut presences = Vec::new();
        for item in ctx.storage.fetch_roster_items(&ctx.username).await? {
            if !item.subscription.is_to() {
                continue;
            }
            let Ok(contact) = item.jid.parse::<BareJid>() else { continue };
            for stream in ctx.router.streams_matching_jid(&contact) {
                if !stream.is_available() {
                    continue;
                }
                if let Some(mut presence) = stream.last_presence() {
                    presence.set_attr("from", stream.jid().to_string());
                    presence.set_attr("to", ctx.jid.to_string());
                    presences.push(presence);
                }
            }
        }
        Ok(presences)
    }

    /// Broadcast a self-presence to every contact subscribed to the user.
    pub async fn broadcast_presence(
        &self,
        presence: &Element,
        ctx: &HandlerContext,
    ) -> Result<(), XmppError> {
        for item in ctx.storage.fetch_roster_items(&ctx.username).await? {
            if !item.subscription.is_from() {
                continue;
            }
            let Ok(contact) = item.jid.parse::<BareJid>() else { continue };
            for stream in ctx.router.streams_matching_jid(&contact) {
                let mut copy = presence.clone();
                copy.set_attr("from", ctx.jid.to_string());
                copy.set_attr("to", stream.jid().to_string());
                stream.handle().send_element(copy).await;
            }
        }
        Ok(())
    }

    async fn update_own_item<F>(
        &self,
        ctx: &HandlerContext,
        peer: &BareJid,
        apply: F,
    ) -> Result<(), XmppError>
    where
        F: FnOnce(&mut RosterItem),
    {
        let mut item = ctx
            .storage
            .fetch_roster_item(&ctx.username, &peer.to_string())
            .await?
            .unwrap_or_else(|| RosterItem {
                username: ctx.username.clone(),
                jid: peer.to_string(),
                name: None,
                subscription: Subscription::None,
                ask: false,
                groups: Vec::new(),
            });
        apply(&mut item);
        ctx.storage.insert_or_update_roster_item(&item).await?;
        self.push_item(ctx, &item).await;
        Ok(())
    }

    /// Mirror a subscription change on a local peer's roster.
    async fn update_peer_item<F>(
        &self,
        ctx: &HandlerContext,
        peer: &BareJid,
        apply: F,
    ) -> Result<(), XmppError>
    where
        F: FnOnce(&mut RosterItem),
    {
        if !ctx.router.is_local_domain(peer.domain().as_str()) {
            return Ok(());
        }
        let Some(peer_username) = peer.node().map(|n| n.as_str().to_string()) else {
            return Ok(());
        };
        if !ctx.storage.user_exists(&peer_username).await? {
            return Ok(());
        }
        let own_bare = ctx.jid.to_bare().to_string();
        let mut item = ctx
            .storage
            .fetch_roster_item(&peer_username, &own_bare)
            .await?
            .unwrap_or_else(|| RosterItem {
                username: peer_username.clone(),
                jid: own_bare,
                name: None,
                subscription: Subscription::None,
                ask: false,
                groups: Vec::new(),
            });
        apply(&mut item);
        ctx.storage.insert_or_update_roster_item(&item).await?;

        // push to the peer's bound streams as well
        let peer_ctx = HandlerContext {
            username: peer_username,
            jid: Jid::from(peer.clone()),
            ..ctx.clone()
        };
        self.push_item(&peer_ctx, &item).await;
        Ok(())
    }

    /// Forward a presence to a peer's bound streams, stamped from the
    /// sender's bare JID. Subscription stanzas to an offline local account
    /// are queued as pending notifications.
    async fn forward(
        &self,
        ctx: &HandlerContext,
        peer: &BareJid,
        presence: &Element,
        queue_if_offline: bool,
    ) -> Result<(), XmppError> {
        if !ctx.router.is_local_domain(peer.domain().as_str()) {
            // federation is not wired up; dropped like any remote stanza
            return Ok(());
        }
        let Some(peer_username) = peer.node().map(|n| n.as_str().to_string()) else {
            return Ok(());
        };
        if !ctx.storage.user_exists(&peer_username).await? {
            return Ok(());
        }

        let mut copy = presence.clone();
        copy.set_attr("from", ctx.jid.to_bare().to_string());
        copy.set_attr("to", peer.to_string());

        let streams = ctx.router.streams_matching_jid(peer);
        if streams.is_empty() {
            if queue_if_offline {
                ctx.storage
                    .insert_pending_notification(&peer_username, &copy)
                    .await?;
            }
            return Ok(());
        }
        for stream in streams {
            stream.handle().send_element(copy.clone()).await;
        }
        Ok(())
    }

    /// Roster push to every bound stream of the item's owner.
    async fn push_item(&self, ctx: &HandlerContext, item: &RosterItem) {
        let bare = ctx.jid.to_bare();
        for stream in ctx.router.streams_matching_jid(&bare) {
            let push = Element::builder("iq", ns::JABBER_CLIENT)
                .attr("type", "set")
                .attr("id", format!("push-{}", Uuid::new_v4()))
                .attr("to", stream.jid().to_string())
                .append(
                    Element::builder("query", ns::ROSTER)
                        .append(item_element(item))
                        .build(),
                )
                .build();
            stream.handle().send_element(push).await;
        }
    }
}

#[async_trait]
impl IqHandler for Roster {
    fn matches(&self, iq: &Iq) -> bool {
        (iq.is_get() || iq.is_set()) && iq.matches_payload("query", ns::ROSTER)
    }

    async fn process(&self, iq: &Iq, ctx: &HandlerContext) -> Result<Vec<Element>, XmppError> {
        if iq.is_get() {
            let items = ctx.storage.fetch_roster_items(&ctx.username).await?;
            let mut builder = Element::builder("query", ns::ROSTER);
            if self.cfg.versioning {
                builder = builder.attr("ver", roster_version(&items));
            }
            let mut query = builder.build();
            for item in &items {
                query.append_child(item_element(item));
            }
            return Ok(vec![iq.result_with_payload(query)]);
        }

        // roster set: exactly one item
        let query = match iq.payload_named("query", ns::ROSTER) {
            Some(query) => query,
            None => {
                return Ok(vec![iq.error_reply(
                    StanzaErrorType::Modify,
                    StanzaErrorCondition::BadRequest,
                )])
            }
        };
        let items: Vec<&Element> = query
            .children()
            .filter(|c| c.name() == "item")
            .collect();
        let [item_elem] = items.as_slice() else {
            return Ok(vec![iq.error_reply(
                StanzaErrorType::Modify,
                StanzaErrorCondition::BadRequest,
            )]);
        };
        let Some(jid_attr) = item_elem.attr("jid") else {
            return Ok(vec![iq.error_reply(
                StanzaErrorType::Modify,
                StanzaErrorCondition::BadRequest,
            )]);
        };
        let Ok(contact) = jid_attr.parse::<BareJid>() else {
            return Ok(vec![iq.error_reply(
                StanzaErrorType::Modify,
                StanzaErrorCondition::JidMalformed,
            )]);
        };

        if item_elem.attr("subscription") == Some("remove") {
            ctx.storage
                .delete_roster_item(&ctx.username, &contact.to_string())
                .await?;
            let removed = RosterItem {
                username: ctx.username.clone(),
                jid: contact.to_string(),
                name: None,
                subscription: Subscription::None,
                ask: false,
                groups: Vec::new(),
            };
            let mut removal = item_element(&removed);
            removal.set_attr("subscription", "remove");
            self.push_raw(ctx, removal).await;
            return Ok(vec![iq.result()]);
        }

        let name = item_elem.attr("name").map(str::to_string);
        let groups: Vec<String> = item_elem
            .children()
            .filter(|c| c.name() == "group")
            .map(|g| g.text())
            .collect();
        self.update_own_item(ctx, &contact, |item| {
            item.name = name;
            item.groups = groups;
        })
        .await?;
        Ok(vec![iq.result()])
    }
}

impl Roster {
    async fn push_raw(&self, ctx: &HandlerContext, item: Element) {
        let bare = ctx.jid.to_bare();
        for stream in ctx.router.streams_matching_jid(&bare) {
            let push = Element::builder("iq", ns::JABBER_CLIENT)
                .attr("type", "set")
                .attr("id", format!("push-{}", Uuid::new_v4()))
                .attr("to", stream.jid().to_string())
                .append(
                    Element::builder("query", ns::ROSTER)
                        .append(item.clone())
                        .build(),
                )
                .build();
            stream.handle().send_element(push).await;
        }
    }
}

fn item_element(item: &RosterItem) -> Element {
    let mut builder = Element::builder("item", ns::ROSTER)
        .attr("jid", item.jid.as_str())
        .attr("subscription", item.subscription.as_str());
    if let Some(name) = &item.name {
        builder = builder.attr("name", name.as_str());
    }
    if item.ask {
        builder = builder.attr("ask", "subscribe");
    }
    let mut element = builder.build();
    for group in &item.groups {
        element.append_child(
            Element::builder("group", ns::ROSTER)
                .append(group.clone())
                .build(),
        );
    }
    element
}

/// Deterministic roster version tag over the item set.
fn roster_version(items: &[RosterItem]) -> String {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(item.jid.as_bytes());
        hasher.update([0]);
        hasher.update(item.subscription.as_str().as_bytes());
        hasher.update([if item.ask { 1 } else { 0 }]);
    }
    hex::encode(&hasher.finalize()[..8])
}
