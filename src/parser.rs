//! Incremental XML parsing for XMPP streams.
//!
//! XMPP uses a single long-lived XML document per session, so the parser
//! accumulates bytes and emits complete top-level elements as they become
//! available. Stream framing (the unclosed `<stream:stream>` open on
//! sockets, `<open/>`/`<close/>` on WebSocket) is handled here as well;
//! everything below the root is parsed into a `minidom::Element`.
//!
//! A parser instance is tied to one stream generation: the stream replaces
//! it with a fresh one on every restart so that the declarations following
//! TLS or compression negotiation are parsed from scratch.

use minidom::Element;
use thiserror::Error;

/// Namespace URIs used in XMPP.
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// WebSocket framing namespace (RFC 7395)
    pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session establishment namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Stream compression protocol namespace (XEP-0138)
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
    /// Stream compression feature namespace
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
    /// In-band registration feature namespace
    pub const REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";
    /// Roster versioning feature namespace
    pub const ROSTER_VER: &str = "urn:xmpp:features:rosterver";
    /// Blocking error namespace
    pub const BLOCKED_ERRORS: &str = "urn:xmpp:blocking:errors";
    /// Blocking command namespace (XEP-0191)
    pub const BLOCKING: &str = "urn:xmpp:blocking";
    /// Roster management namespace
    pub const ROSTER: &str = "jabber:iq:roster";
    /// Legacy (pre-SASL) authentication namespace
    pub const AUTH_LEGACY: &str = "jabber:iq:auth";
    /// Service discovery info namespace (XEP-0030)
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Service discovery items namespace (XEP-0030)
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Ping namespace (XEP-0199)
    pub const PING: &str = "urn:xmpp:ping";
    /// Software version namespace (XEP-0092)
    pub const VERSION: &str = "jabber:iq:version";
    /// Last activity namespace (XEP-0012)
    pub const LAST_ACTIVITY: &str = "jabber:iq:last";
    /// Private XML storage namespace (XEP-0049)
    pub const PRIVATE: &str = "jabber:iq:private";
    /// vcard-temp namespace (XEP-0054)
    pub const VCARD: &str = "vcard-temp";
    /// In-band registration namespace (XEP-0077)
    pub const REGISTER: &str = "jabber:iq:register";
    /// Delayed delivery namespace (XEP-0203)
    pub const DELAY: &str = "urn:xmpp:delay";
}

/// Parse faults surfaced to the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A top-level element exceeded the configured size limit
    #[error("stanza exceeds maximum allowed size")]
    TooLargeStanza,
    /// The byte stream is not well-formed XML
    #[error("malformed XML: {0}")]
    Malformed(String),
}

/// Events produced by the parser.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    /// A stream open tag (`<stream:stream>` or framed `<open/>`)
    StreamOpen(StreamHeader),
    /// The peer closed the stream (`</stream:stream>` on sockets)
    StreamClosed,
    /// A complete top-level element
    Element(Element),
}

/// Parsed stream open information.
///
/// The socket open tag is intentionally unclosed XML (its close arrives at
/// session end), so its attributes are extracted textually rather than
/// through the element parser.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// Tag name: "stream:stream" for sockets, "open" for WebSocket framing
    pub name: String,
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source JID)
    pub from: Option<String>,
    /// The 'version' attribute (must be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
    /// The default namespace declaration
    pub xmlns: Option<String>,
    /// The 'xmlns:stream' declaration
    pub stream_ns: Option<String>,
}

impl StreamHeader {
    fn parse(tag: &str) -> Self {
        let name_end = tag[1..]
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .map(|i| i + 1)
            .unwrap_or(tag.len());

        Self {
            name: tag[1..name_end].to_string(),
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
            xmlns: extract_attribute(tag, "xmlns"),
            stream_ns: extract_attribute(tag, "xmlns:stream"),
        }
    }
}

/// Extract an attribute value from an XML tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let pattern = format!("{}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            // guard against matching the suffix of a longer attribute name
            let preceding = tag[..start].chars().last();
            if !matches!(preceding, Some(c) if c.is_whitespace()) {
                continue;
            }
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

/// Incremental XML parser for one stream generation.
pub struct XmlParser {
    /// Accumulated data buffer
    buffer: Vec<u8>,
    /// Whether the stream open has been consumed
    stream_opened: bool,
    /// Maximum size of a single top-level element (0 = unlimited)
    max_stanza_size: usize,
}

impl XmlParser {
    /// Create a new parser enforcing the given stanza size limit.
    pub fn new(max_stanza_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            stream_opened: false,
            max_stanza_size,
        }
    }

    /// Feed raw bytes into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pull the next complete event out of the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<ParsedEvent>, ParseError> {
        loop {
            self.skip_whitespace();
            if self.buffer.is_empty() {
                return Ok(None);
            }
            if self.buffer[0] != b'<' {
                return Err(ParseError::Malformed("text at stream level".into()));
            }

            // XML prolog and other processing instructions are skipped.
            if self.buffer.get(1) == Some(&b'?') {
                match find_subslice(&self.buffer, b"?>") {
                    Some(end) => {
                        self.buffer.drain(..end + 2);
                        continue;
                    }
                    None => return self.need_more(),
                }
            }

            // A top-level close tag ends the stream.
            if self.buffer.get(1) == Some(&b'/') {
                let tag = match scan_tag(&self.buffer) {
                    Some(tag) => tag,
                    None => return self.need_more(),
                };
                let name = tag_name(&self.buffer[..tag.len]);
                if name == "stream:stream" {
                    self.buffer.drain(..tag.len);
                    return Ok(Some(ParsedEvent::StreamClosed));
                }
                return Err(ParseError::Malformed(format!(
                    "unexpected close tag </{}>",
                    name
                )));
            }

            if !self.stream_opened {
                return self.next_stream_open();
            }
            return self.next_element();
        }
    }

    /// Parse the stream open tag at the front of the buffer.
    fn next_stream_open(&mut self) -> Result<Option<ParsedEvent>, ParseError> {
        let tag = match scan_tag(&self.buffer) {
            Some(tag) => tag,
            None => return self.need_more(),
        };
        let raw = std::str::from_utf8(&self.buffer[..tag.len])
            .map_err(|_| ParseError::Malformed("invalid UTF-8 in stream open".into()))?;
        let header = StreamHeader::parse(raw);

        match (header.name.as_str(), tag.kind) {
            ("stream:stream", TagKind::Open) | ("open", TagKind::SelfClosing) => {
                self.buffer.drain(..tag.len);
                self.stream_opened = true;
                Ok(Some(ParsedEvent::StreamOpen(header)))
            }
            // a framed client may close before ever opening
            ("close", TagKind::SelfClosing) => {
                self.buffer.drain(..tag.len);
                Ok(Some(ParsedEvent::StreamClosed))
            }
            _ => Err(ParseError::Malformed(format!(
                "expected stream open, got <{}>",
                header.name
            ))),
        }
    }

    /// Parse a complete top-level element at the front of the buffer.
    fn next_element(&mut self) -> Result<Option<ParsedEvent>, ParseError> {
        let end = match scan_element(&self.buffer)? {
            Some(end) => end,
            None => return self.need_more(),
        };
        if self.max_stanza_size > 0 && end > self.max_stanza_size {
            return Err(ParseError::TooLargeStanza);
        }
        let slice = std::str::from_utf8(&self.buffer[..end])
            .map_err(|_| ParseError::Malformed("invalid UTF-8 in element".into()))?;
        let element = parse_fragment(slice)?;
        self.buffer.drain(..end);
        Ok(Some(ParsedEvent::Element(element)))
    }

    /// Signal that more bytes are required, enforcing the size limit on the
    /// pending data first.
    fn need_more(&self) -> Result<Option<ParsedEvent>, ParseError> {
        if self.max_stanza_size > 0 && self.buffer.len() > self.max_stanza_size {
            return Err(ParseError::TooLargeStanza);
        }
        Ok(None)
    }

    fn skip_whitespace(&mut self) {
        let skip = self
            .buffer
            .iter()
            .take_while(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
            .count();
        if skip > 0 {
            self.buffer.drain(..skip);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Open,
    Close,
    SelfClosing,
    Special,
}

#[derive(Debug, Clone, Copy)]
struct TagInfo {
    /// Byte length of the tag, '<' through '>' inclusive
    len: usize,
    kind: TagKind,
}

/// Scan one tag starting at `buf[0] == '<'`, respecting quoted attribute
/// values. Returns `None` if the tag is not yet complete.
fn scan_tag(buf: &[u8]) -> Option<TagInfo> {
    debug_assert_eq!(buf.first(), Some(&b'<'));
    let special = matches!(buf.get(1), Some(b'?') | Some(b'!'));
    let closing = buf.get(1) == Some(&b'/');

    let mut quote: Option<u8> = None;
    let mut i = 1;
    while i < buf.len() {
        let b = buf[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'>' => {
                    let kind = if special {
                        TagKind::Special
                    } else if closing {
                        TagKind::Close
                    } else if buf[i - 1] == b'/' {
                        TagKind::SelfClosing
                    } else {
                        TagKind::Open
                    };
                    return Some(TagInfo { len: i + 1, kind });
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Extract the tag name from a raw tag slice (`<name ...>` or `</name>`).
fn tag_name(tag: &[u8]) -> String {
    let start = if tag.get(1) == Some(&b'/') { 2 } else { 1 };
    let name: Vec<u8> = tag[start..]
        .iter()
        .take_while(|b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'/' | b'>'))
        .copied()
        .collect();
    String::from_utf8_lossy(&name).to_string()
}

/// Find the end of the complete element starting at `buf[0] == '<'`.
///
/// Returns `Ok(Some(end))` with the index one past the final '>', or
/// `Ok(None)` if the element is still incomplete.
fn scan_element(buf: &[u8]) -> Result<Option<usize>, ParseError> {
    let mut depth: isize = 0;
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != b'<' {
            i += 1;
            continue;
        }
        let tag = match scan_tag(&buf[i..]) {
            Some(tag) => tag,
            None => return Ok(None),
        };
        match tag.kind {
            TagKind::Open => depth += 1,
            TagKind::Close => {
                depth -= 1;
                if depth < 0 {
                    return Err(ParseError::Malformed("unbalanced close tag".into()));
                }
                if depth == 0 {
                    return Ok(Some(i + tag.len));
                }
            }
            TagKind::SelfClosing => {
                if depth == 0 {
                    return Ok(Some(i + tag.len));
                }
            }
            TagKind::Special => {}
        }
        i += tag.len;
    }
    Ok(None)
}

/// Parse a stanza fragment into an element.
///
/// Client stanzas typically omit the `jabber:client` declaration (it is
/// inherited from the stream root), so the fragment is parsed inside a
/// synthetic root carrying the stream namespaces.
fn parse_fragment(slice: &str) -> Result<Element, ParseError> {
    let wrapped = format!(
        "<stream:stream xmlns='{}' xmlns:stream='{}'>{}</stream:stream>",
        ns::JABBER_CLIENT,
        ns::STREAM,
        slice
    );
    let root: Element = wrapped
        .parse()
        .map_err(|e| ParseError::Malformed(format!("{}", e)))?;
    root.children()
        .next()
        .cloned()
        .ok_or_else(|| ParseError::Malformed("empty element".into()))
}

/// Serialize an element to its XML string form.
pub fn element_to_string(element: &Element) -> String {
    String::from(element)
}

impl std::fmt::Debug for XmlParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlParser")
            .field("buffered", &self.buffer.len())
            .field("stream_opened", &self.stream_opened)
            .finish()
    }
}


/// Find the first occurrence of `needle` in `haystack`.
fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
