//! Message stanza wrapper.

use jid::Jid;
use minidom::Element;

use crate::error::XmppError;
use crate::parser::ns;

/// Message type attribute values (RFC 6121 Section 5.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Absent type attribute defaults to normal
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Chat => "chat",
            Self::Groupchat => "groupchat",
            Self::Headline => "headline",
            Self::Error => "error",
        }
    }
}

/// A message stanza.
#[derive(Debug, Clone)]
pub struct Message {
    element: Element,
    from: Jid,
    to: Jid,
    kind: MessageKind,
}

impl Message {
    /// Build a message view over a parsed element with resolved addressing.
    pub fn from_element(element: Element, from: Jid, to: Jid) -> Result<Self, XmppError> {
        let kind = match element.attr("type") {
            None | Some("") | Some("normal") => MessageKind::Normal,
            Some("chat") => MessageKind::Chat,
            Some("groupchat") => MessageKind::Groupchat,
            Some("headline") => MessageKind::Headline,
            Some("error") => MessageKind::Error,
            Some(other) => {
                return Err(XmppError::xml_parse(format!(
                    "invalid message type '{}'",
                    other
                )))
            }
        };
        Ok(Self {
            element,
            from,
            to,
            kind,
        })
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn from_jid(&self) -> &Jid {
        &self.from
    }

    pub fn to_jid(&self) -> &Jid {
        &self.to
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn has_body(&self) -> bool {
        self.element.get_child("body", ns::JABBER_CLIENT).is_some()
    }

    pub fn is_chat(&self) -> bool {
        self.kind == MessageKind::Chat
    }

    pub fn is_groupchat(&self) -> bool {
        self.kind == MessageKind::Groupchat
    }

    /// Copy of this message addressed to the recipient's bare JID.
    ///
    /// Used for the single delivery retry after a resource lookup miss.
    pub fn to_bare_recipient(&self) -> Message {
        let mut copy = self.clone();
        copy.to = Jid::from(self.to.to_bare());
        copy
    }
}
