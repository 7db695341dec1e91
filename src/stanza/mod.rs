//! Stanza model: typed views over top-level stream elements.
//!
//! A stanza is a `minidom::Element` plus the addressing the stream resolved
//! for it (`from` is always the bound JID, `to` defaults to the account's
//! bare JID). The three concrete kinds carry a parsed type enum and the
//! accessors the dispatch logic needs; everything else stays in the raw
//! element.

mod iq;
mod message;
mod presence;

pub use iq::{Iq, IqKind};
pub use message::{Message, MessageKind};
pub use presence::{Presence, PresenceKind};

use jid::Jid;
use minidom::Element;

use crate::error::{StanzaErrorCondition, StanzaErrorType};
use crate::parser::ns;

/// Extra JID predicates used by the dispatch rules.
pub trait JidExt {
    /// A server JID has neither node nor resource.
    fn is_server(&self) -> bool;
    /// A full JID addressing a user account: node and resource both present.
    fn is_full_with_user(&self) -> bool;
    /// Whether the JID carries no resource.
    fn is_bare(&self) -> bool;
}

impl JidExt for Jid {
    fn is_server(&self) -> bool {
        self.node().is_none() && self.resource().is_none()
    }

    fn is_full_with_user(&self) -> bool {
        self.node().is_some() && self.resource().is_some()
    }

    fn is_bare(&self) -> bool {
        self.resource().is_none()
    }
}

/// A top-level stanza: IQ, presence or message.
#[derive(Debug, Clone)]
pub enum Stanza {
    Iq(Iq),
    Presence(Presence),
    Message(Message),
}

impl Stanza {
    /// The element name ("iq", "presence" or "message").
    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Iq(_) => "iq",
            Stanza::Presence(_) => "presence",
            Stanza::Message(_) => "message",
        }
    }

    /// The raw element.
    pub fn element(&self) -> &Element {
        match self {
            Stanza::Iq(iq) => iq.element(),
            Stanza::Presence(p) => p.element(),
            Stanza::Message(m) => m.element(),
        }
    }

    /// The resolved sender JID.
    pub fn from_jid(&self) -> &Jid {
        match self {
            Stanza::Iq(iq) => iq.from_jid(),
            Stanza::Presence(p) => p.from_jid(),
            Stanza::Message(m) => m.from_jid(),
        }
    }

    /// The resolved recipient JID.
    pub fn to_jid(&self) -> &Jid {
        match self {
            Stanza::Iq(iq) => iq.to_jid(),
            Stanza::Presence(p) => p.to_jid(),
            Stanza::Message(m) => m.to_jid(),
        }
    }

    /// Build an errored copy of this stanza (see [`error_reply`]).
    pub fn error_reply(
        &self,
        error_type: StanzaErrorType,
        condition: StanzaErrorCondition,
        extra: Vec<Element>,
    ) -> Element {
        error_reply(self.element(), error_type, condition, extra)
    }

    /// Shorthand for the `service-unavailable` errored copy.
    pub fn service_unavailable_error(&self) -> Element {
        self.error_reply(
            StanzaErrorType::Cancel,
            StanzaErrorCondition::ServiceUnavailable,
            Vec::new(),
        )
    }
}

/// Build an errored copy of `original` per RFC 6120 Section 8.3.1: same
/// element with `type='error'`, addresses swapped, the original payload
/// preserved, and an `<error/>` child appended.
pub fn error_reply(
    original: &Element,
    error_type: StanzaErrorType,
    condition: StanzaErrorCondition,
    extra: Vec<Element>,
) -> Element {
    let mut builder = Element::builder(original.name(), ns::JABBER_CLIENT).attr("type", "error");
    if let Some(id) = original.attr("id") {
        builder = builder.attr("id", id);
    }
    // swap addresses on the reply
    if let Some(from) = original.attr("from") {
        builder = builder.attr("to", from);
    }
    if let Some(to) = original.attr("to") {
        builder = builder.attr("from", to);
    }

    let mut reply = builder.build();
    for child in original.children() {
        if child.name() == "error" {
            continue;
        }
        reply.append_child(child.clone());
    }

    let mut error = Element::builder("error", ns::JABBER_CLIENT)
        .attr("type", error_type.as_str())
        .append(Element::builder(condition.as_str(), ns::STANZAS).build());
    for payload in extra {
        error = error.append(payload);
    }
    reply.append_child(error.build());
    reply
}
