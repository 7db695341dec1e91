//! IQ stanza wrapper.

use jid::Jid;
use minidom::Element;

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::parser::ns;
use crate::stanza::error_reply;

/// IQ type attribute values (RFC 6120 Section 8.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
    Get,
    Set,
    Result,
    Error,
}

impl IqKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

/// An info/query stanza.
#[derive(Debug, Clone)]
pub struct Iq {
    element: Element,
    from: Jid,
    to: Jid,
    id: String,
    kind: IqKind,
}

impl Iq {
    /// Build an IQ view over a parsed element with resolved addressing.
    ///
    /// Enforces the RFC 6120 payload rules: an id and a type are required,
    /// and a get/set must carry exactly one child payload.
    pub fn from_element(element: Element, from: Jid, to: Jid) -> Result<Self, XmppError> {
        let id = element.attr("id").unwrap_or_default().to_string();
        if id.is_empty() {
            return Err(XmppError::xml_parse("iq requires an 'id' attribute"));
        }
        let kind = match element.attr("type") {
            Some("get") => IqKind::Get,
            Some("set") => IqKind::Set,
            Some("result") => IqKind::Result,
            Some("error") => IqKind::Error,
            other => {
                return Err(XmppError::xml_parse(format!(
                    "invalid iq type {:?}",
                    other
                )))
            }
        };
        let payload_count = element.children().count();
        match kind {
            IqKind::Get | IqKind::Set if payload_count != 1 => {
                return Err(XmppError::xml_parse(
                    "iq get/set requires exactly one child payload",
                ));
            }
            IqKind::Result if payload_count > 1 => {
                return Err(XmppError::xml_parse(
                    "iq result admits at most one child payload",
                ));
            }
            _ => {}
        }
        Ok(Self {
            element,
            from,
            to,
            id,
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

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> IqKind {
        self.kind
    }

    pub fn is_get(&self) -> bool {
        self.kind == IqKind::Get
    }

    pub fn is_set(&self) -> bool {
        self.kind == IqKind::Set
    }

    /// The single child payload of a get/set.
    pub fn payload(&self) -> Option<&Element> {
        self.element.children().next()
    }

    /// Look up a payload child by name and namespace.
    pub fn payload_named(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.element.get_child(name, namespace)
    }

    /// Whether the payload matches the given name and namespace.
    pub fn matches_payload(&self, name: &str, namespace: &str) -> bool {
        self.payload_named(name, namespace).is_some()
    }

    /// Build an empty result for this IQ, addresses swapped.
    pub fn result(&self) -> Element {
        self.result_inner(None)
    }

    /// Build a result for this IQ carrying one payload element.
    pub fn result_with_payload(&self, payload: Element) -> Element {
        self.result_inner(Some(payload))
    }

    fn result_inner(&self, payload: Option<Element>) -> Element {
        let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "result")
            .attr("id", self.id.as_str());
        if let Some(from) = self.element.attr("from") {
            builder = builder.attr("to", from);
        }
        if let Some(to) = self.element.attr("to") {
            builder = builder.attr("from", to);
        }
        let mut result = builder.build();
        if let Some(payload) = payload {
            result.append_child(payload);
        }
        result
    }

    pub fn error_reply(
        &self,
        error_type: StanzaErrorType,
        condition: StanzaErrorCondition,
    ) -> Element {
        error_reply(&self.element, error_type, condition, Vec::new())
    }

    pub fn service_unavailable_error(&self) -> Element {
        self.error_reply(StanzaErrorType::Cancel, StanzaErrorCondition::ServiceUnavailable)
    }

    pub fn not_allowed_error(&self) -> Element {
        self.error_reply(StanzaErrorType::Cancel, StanzaErrorCondition::NotAllowed)
    }

    pub fn conflict_error(&self) -> Element {
        self.error_reply(StanzaErrorType::Cancel, StanzaErrorCondition::Conflict)
    }

    pub fn bad_request_error(&self) -> Element {
        self.error_reply(StanzaErrorType::Modify, StanzaErrorCondition::BadRequest)
    }

    pub fn item_not_found_error(&self) -> Element {
        self.error_reply(StanzaErrorType::Cancel, StanzaErrorCondition::ItemNotFound)
    }
}
