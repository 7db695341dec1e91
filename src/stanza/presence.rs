//! Presence stanza wrapper.

use jid::Jid;
use minidom::Element;

use crate::error::XmppError;
use crate::parser::ns;

/// Presence type attribute values (RFC 6121 Section 4.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    /// Empty type attribute: the entity is available
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceKind {
    /// The type attribute value, `None` for available.
    pub fn as_attr(&self) -> Option<&'static str> {
        match self {
            Self::Available => None,
            Self::Unavailable => Some("unavailable"),
            Self::Subscribe => Some("subscribe"),
            Self::Subscribed => Some("subscribed"),
            Self::Unsubscribe => Some("unsubscribe"),
            Self::Unsubscribed => Some("unsubscribed"),
            Self::Probe => Some("probe"),
            Self::Error => Some("error"),
        }
    }
}

/// A presence stanza.
#[derive(Debug, Clone)]
pub struct Presence {
    element: Element,
    from: Jid,
    to: Jid,
    kind: PresenceKind,
    priority: i8,
}

impl Presence {
    /// Build a presence view over a parsed element with resolved addressing.
    pub fn from_element(element: Element, from: Jid, to: Jid) -> Result<Self, XmppError> {
        let kind = match element.attr("type") {
            None | Some("") => PresenceKind::Available,
            Some("unavailable") => PresenceKind::Unavailable,
            Some("subscribe") => PresenceKind::Subscribe,
            Some("subscribed") => PresenceKind::Subscribed,
            Some("unsubscribe") => PresenceKind::Unsubscribe,
            Some("unsubscribed") => PresenceKind::Unsubscribed,
            Some("probe") => PresenceKind::Probe,
            Some("error") => PresenceKind::Error,
            Some(other) => {
                return Err(XmppError::xml_parse(format!(
                    "invalid presence type '{}'",
                    other
                )))
            }
        };
        let priority = match element.get_child("priority", ns::JABBER_CLIENT) {
            Some(child) => child
                .text()
                .trim()
                .parse::<i8>()
                .map_err(|_| XmppError::xml_parse("invalid presence priority"))?,
            None => 0,
        };
        Ok(Self {
            element,
            from,
            to,
            kind,
            priority,
        })
    }

    /// Build a bare unavailable presence between two JIDs.
    pub fn unavailable(from: &Jid, to: &Jid) -> Presence {
        let element = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("from", from.to_string())
            .attr("to", to.to_string())
            .attr("type", "unavailable")
            .build();
        Presence {
            element,
            from: from.clone(),
            to: to.clone(),
            kind: PresenceKind::Unavailable,
            priority: 0,
        }
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

    pub fn kind(&self) -> PresenceKind {
        self.kind
    }

    pub fn priority(&self) -> i8 {
        self.priority
    }

    pub fn is_available(&self) -> bool {
        self.kind == PresenceKind::Available
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == PresenceKind::Unavailable
    }

    /// The first `<status/>` child text, if any.
    pub fn status(&self) -> Option<String> {
        self.element
            .get_child("status", ns::JABBER_CLIENT)
            .map(|s| s.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    fn parse(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    #[test]
    fn test_empty_type_is_available() {
        let elem = parse("<presence xmlns='jabber:client'/>");
        let p = Presence::from_element(elem, jid("a@l/h"), jid("a@l")).unwrap();
        assert!(p.is_available());
        assert_eq!(p.priority(), 0);
    }

    #[test]
    fn test_priority_and_status() {
        let elem = parse(
            "<presence xmlns='jabber:client'><priority>-1</priority><status>gone fishing</status></presence>",
        );
        let p = Presence::from_element(elem, jid("a@l/h"), jid("a@l")).unwrap();
        assert_eq!(p.priority(), -1);
        assert_eq!(p.status().as_deref(), Some("gone fishing"));
    }

    #[test]
    fn test_subscription_kinds() {
        for (attr, kind) in [
            ("subscribe", PresenceKind::Subscribe),
            ("subscribed", PresenceKind::Subscribed),
            ("unsubscribe", PresenceKind::Unsubscribe),
            ("unsubscribed", PresenceKind::Unsubscribed),
            ("probe", PresenceKind::Probe),
        ] {
            let elem = parse(&format!("<presence xmlns='jabber:client' type='{}'/>", attr));
            let p = Presence::from_element(elem, jid("a@l/h"), jid("b@l")).unwrap();
            assert_eq!(p.kind(), kind);
            assert_eq!(p.kind().as_attr(), Some(attr));
        }
    }

    #[test]
    fn test_invalid_priority_is_rejected() {
        let elem = parse("<presence xmlns='jabber:client'><priority>300</priority></presence>");
        assert!(Presence::from_element(elem, jid("a@l/h"), jid("a@l")).is_err());
    }

    #[test]
    fn test_invalid_type_is_rejected() {
        let elem = parse("<presence xmlns='jabber:client' type='dancing'/>");
        assert!(Presence::from_element(elem, jid("a@l/h"), jid("a@l")).is_err());
    }

    #[test]
    fn test_unavailable_constructor() {
        let from = jid("alice@localhost/home");
        let p = Presence::unavailable(&from, &from);
        assert!(p.is_unavailable());
        assert_eq!(p.element().attr("type"), Some("unavailable"));
        assert_eq!(p.element().attr("from"), Some("alice@localhost/home"));
    }
}
