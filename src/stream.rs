//! C2S stream actor: the RFC 6120 connection state machine.
//!
//! One `Stream` is spawned per accepted connection. A single task owns the
//! transport, the parser and all stream state; it multiplexes between the
//! transport read side and a bounded command mailbox, so every mutation is
//! serialized and the transport is only ever written from this task.
//! External callers (router, other streams, timers) interact through the
//! cloneable [`StreamHandle`].
//!
//! The reader pulls exactly one element per loop turn and does not touch
//! the transport again until that element is fully handled, which gives
//! cooperative backpressure against slow handlers.
//!
//! State transitions follow RFC 6120 §4–§7: `connecting` → `connected` →
//! (`authenticating`) → `authenticated` → `session_started`, with a
//! restart back to `connecting` after TLS, compression and SASL success.
//! `disconnected` is terminal.

use std::sync::Arc;
use std::time::Duration;

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::{build_authenticators, Authenticator, SaslStep};
use crate::config::{C2sConfig, ResourceConflictPolicy};
use crate::error::{SaslErrorKind, StanzaErrorCondition, StanzaErrorType, StreamErrorKind, XmppError};
use crate::module::{HandlerContext, ModuleSet, Register};
use crate::parser::{element_to_string, ns, ParseError, ParsedEvent, StreamHeader, XmlParser};
use crate::router::{BoundStream, RouteError, Router};
use crate::stanza::{error_reply, Iq, JidExt, Message, Presence, Stanza};
use crate::storage::Storage;
use crate::transport::{CompressionLevel, Transport, TransportKind};

/// Size of the per-stream command mailbox.
const MAILBOX_SIZE: usize = 64;

/// How long an external caller may block on a full mailbox before the
/// element is dropped and logged.
const MAILBOX_PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for a stream open (initial, or after a restart)
    Connecting,
    /// Stream open accepted, pre-authentication features sent
    Connected,
    /// A SASL exchange is in flight
    Authenticating,
    /// SASL succeeded, awaiting bind and session
    Authenticated,
    /// Session established; stanzas are routed
    SessionStarted,
    /// Terminal
    Disconnected,
}

/// Commands posted to the stream actor.
#[derive(Debug)]
pub enum StreamCmd {
    /// Write an element to the client
    SendElement(Element),
    /// Tear the stream down, with a stream error when given
    Disconnect(Option<StreamErrorKind>),
    /// The connect timer fired
    ConnectTimeout,
}

/// Cloneable reference to a running stream.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: String,
    tx: mpsc::Sender<StreamCmd>,
}

impl StreamHandle {
    pub(crate) fn new(id: String, tx: mpsc::Sender<StreamCmd>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue an element for delivery. Returns false when the stream is
    /// gone or its mailbox stayed full past the push timeout.
    pub async fn send_element(&self, element: Element) -> bool {
        match self
            .tx
            .send_timeout(StreamCmd::SendElement(element), MAILBOX_PUSH_TIMEOUT)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!(stream = %self.id, error = %e, "Dropping element for unreachable stream");
                false
            }
        }
    }

    /// Request a disconnect; a no-op once the stream terminated.
    pub async fn disconnect(&self, error: Option<StreamErrorKind>) {
        let _ = self
            .tx
            .send_timeout(StreamCmd::Disconnect(error), MAILBOX_PUSH_TIMEOUT)
            .await;
    }
}

/// Per-stream mutable context. Written only from the stream's own task;
/// snapshots cross task boundaries through [`HandlerContext`] and the
/// router registry.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub username: String,
    pub domain: String,
    pub resource: String,
    /// Account JID: domain at accept, bare after SASL, full after bind
    pub jid: Jid,
    pub secured: bool,
    pub authenticated: bool,
    pub compressed: bool,
    /// Last self-presence sent on this stream
    pub presence: Option<Presence>,
    /// One-shot latch for pending-roster-notification delivery
    pub roster_delivered: bool,
    /// One-shot latch for offline message delivery
    pub offline_delivered: bool,
    pub terminated: bool,
}

enum ReadOutcome {
    Event(ParsedEvent),
    Eof,
    Fault(ParseError),
    Io(XmppError),
}

/// Fate of an element that could not be turned into a stanza.
enum ElementFate {
    StreamError(StreamErrorKind),
    Reply(Element),
}

/// One client-to-server stream.
pub struct Stream {
    id: String,
    cfg: C2sConfig,
    state: StreamState,
    transport: Box<dyn Transport>,
    parser: XmlParser,
    router: Arc<Router>,
    storage: Arc<dyn Storage>,
    ctx: StreamContext,
    authenticators: Vec<Box<dyn Authenticator>>,
    active_auth: Option<usize>,
    modules: Option<ModuleSet>,
    register: Option<Arc<Register>>,
    bound_jid: Option<FullJid>,
    handle: StreamHandle,
    cmd_rx: Option<mpsc::Receiver<StreamCmd>>,
    connect_timer: Option<JoinHandle<()>>,
    saw_first_open: bool,
}

impl Stream {
    /// Spawn the actor for an accepted connection and return its handle.
    pub fn spawn(
        transport: Box<dyn Transport>,
        router: Arc<Router>,
        storage: Arc<dyn Storage>,
        cfg: C2sConfig,
    ) -> StreamHandle {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
        let handle = StreamHandle::new(id.clone(), tx);

        let domain = router.default_local_domain().to_string();
        let jid: Jid = domain.parse().expect("local domain must form a valid JID");
        // message-framed transports arrive through an already-secured layer
        let secured = transport.kind() != TransportKind::Socket;

        let register = if cfg.modules.is_enabled("registration") {
            Some(Arc::new(Register::new(cfg.modules.registration.clone())))
        } else {
            None
        };

        let parser = XmlParser::new(cfg.max_stanza_size);
        let stream = Stream {
            id: id.clone(),
            cfg,
            state: StreamState::Connecting,
            transport,
            parser,
            router,
            storage,
            ctx: StreamContext {
                username: String::new(),
                domain,
                resource: String::new(),
                jid,
                secured,
                authenticated: false,
                compressed: false,
                presence: None,
                roster_delivered: false,
                offline_delivered: false,
                terminated: false,
            },
            authenticators: Vec::new(),
            active_auth: None,
            modules: None,
            register,
            bound_jid: None,
            handle: handle.clone(),
            cmd_rx: Some(rx),
            connect_timer: None,
            saw_first_open: false,
        };

        tokio::spawn(
            stream
                .run()
                .instrument(info_span!("xmpp.stream", id = %id)),
        );
        handle
    }

    async fn run(mut self) {
        let mut rx = self.cmd_rx.take().expect("run consumes the receiver");

        if self.cfg.connect_timeout > 0 {
            let tx = self.handle.tx.clone();
            let timeout = Duration::from_secs(self.cfg.connect_timeout);
            self.connect_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(StreamCmd::ConnectTimeout).await;
            }));
        }

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(StreamCmd::SendElement(element)) => {
                        self.write_element(&element).await;
                    }
                    Some(StreamCmd::Disconnect(error)) => {
                        self.disconnect(error).await;
                    }
                    Some(StreamCmd::ConnectTimeout) => {
                        if !self.saw_first_open {
                            debug!("No stream open within the connect timeout");
                            self.disconnect(Some(StreamErrorKind::ConnectionTimeout)).await;
                        }
                    }
                    None => break,
                },
                outcome = Self::read_event(self.transport.as_mut(), &mut self.parser) => {
                    self.handle_read(outcome).await;
                }
            }
            if self.state == StreamState::Disconnected {
                break;
            }
        }

        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
    }

    /// Pull the next parser event, reading from the transport as needed.
    async fn read_event(
        transport: &mut dyn Transport,
        parser: &mut XmlParser,
    ) -> ReadOutcome {
        let mut buf = [0u8; 4096];
        loop {
            match parser.next_event() {
                Ok(Some(event)) => return ReadOutcome::Event(event),
                Ok(None) => {}
                Err(fault) => return ReadOutcome::Fault(fault),
            }
            match transport.read_bytes(&mut buf).await {
                Ok(0) => return ReadOutcome::Eof,
                Ok(n) => parser.feed(&buf[..n]),
                Err(e) => return ReadOutcome::Io(e),
            }
        }
    }

    async fn handle_read(&mut self, outcome: ReadOutcome) {
        match outcome {
            ReadOutcome::Event(ParsedEvent::StreamOpen(header)) => {
                self.handle_stream_open(header).await;
            }
            ReadOutcome::Event(ParsedEvent::StreamClosed) => {
                debug!("Peer closed the stream");
                self.disconnect(None).await;
            }
            ReadOutcome::Event(ParsedEvent::Element(element)) => {
                debug!(xml = %element_to_string(&element), "RECV");
                self.handle_element(element).await;
            }
            ReadOutcome::Eof => {
                debug!("Transport EOF");
                self.disconnect_closing_stream(false).await;
            }
            ReadOutcome::Fault(ParseError::TooLargeStanza) => {
                self.disconnect(Some(StreamErrorKind::PolicyViolation)).await;
            }
            ReadOutcome::Fault(ParseError::Malformed(reason)) => {
                debug!(reason = %reason, "Malformed XML from peer");
                self.disconnect(Some(StreamErrorKind::InvalidXml)).await;
            }
            ReadOutcome::Io(e) => {
                debug!(error = %e, "Transport read failed");
                self.disconnect_closing_stream(false).await;
            }
        }
    }

    // ---- stream negotiation -------------------------------------------

    async fn handle_stream_open(&mut self, header: StreamHeader) {
        self.saw_first_open = true;
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
        if self.state != StreamState::Connecting {
            self.disconnect(Some(StreamErrorKind::InvalidXml)).await;
            return;
        }
        if let Err(kind) = self.validate_stream_header(&header) {
            self.disconnect(Some(kind)).await;
            return;
        }

        if let Some(to) = header.to.as_deref().filter(|to| !to.is_empty()) {
            self.ctx.domain = to.to_string();
            if self.ctx.username.is_empty() {
                if let Ok(jid) = self.ctx.domain.parse() {
                    self.ctx.jid = jid;
                }
            }
        }

        self.open_stream().await;

        // the mechanism set depends on flags that change across restarts
        self.authenticators = build_authenticators(
            &self.cfg.sasl,
            &self.storage,
            &self.ctx.domain,
            self.ctx.secured,
            self.transport.channel_binding_data(),
        );
        self.active_auth = None;

        let features = if self.ctx.authenticated {
            self.state = StreamState::Authenticated;
            self.authenticated_features()
        } else {
            self.state = StreamState::Connected;
            self.unauthenticated_features()
        };
        self.write_raw(&features).await;
    }

    fn validate_stream_header(&self, header: &StreamHeader) -> Result<(), StreamErrorKind> {
        match self.transport.kind() {
            TransportKind::Socket => {
                if header.name != "stream:stream" {
                    return Err(StreamErrorKind::UnsupportedStanzaType);
                }
                if header.xmlns.as_deref() != Some(ns::JABBER_CLIENT)
                    || header.stream_ns.as_deref() != Some(ns::STREAM)
                {
                    return Err(StreamErrorKind::InvalidNamespace);
                }
            }
            TransportKind::WebSocket => {
                if header.name != "open" {
                    return Err(StreamErrorKind::UnsupportedStanzaType);
                }
                if header.xmlns.as_deref() != Some(ns::FRAMING) {
                    return Err(StreamErrorKind::InvalidNamespace);
                }
            }
        }
        if let Some(to) = header.to.as_deref().filter(|to| !to.is_empty()) {
            if !self.router.is_local_domain(to) {
                return Err(StreamErrorKind::HostUnknown);
            }
        }
        if header.version.as_deref() != Some("1.0") {
            return Err(StreamErrorKind::UnsupportedVersion);
        }
        Ok(())
    }

    async fn open_stream(&mut self) {
        let id = Uuid::new_v4();
        let open = match self.transport.kind() {
            TransportKind::Socket => format!(
                "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' id='{}' from='{}' version='1.0'>",
                ns::JABBER_CLIENT,
                ns::STREAM,
                id,
                self.ctx.domain
            ),
            TransportKind::WebSocket => format!(
                "<open xmlns='{}' id='{}' from='{}' version='1.0'/>",
                ns::FRAMING,
                id,
                self.ctx.domain
            ),
        };
        self.write_raw(&open).await;
    }

    fn unauthenticated_features(&self) -> String {
        let mut features = format!("<stream:features xmlns:stream='{}'>", ns::STREAM);
        let is_socket = self.transport.kind() == TransportKind::Socket;

        if is_socket && !self.ctx.secured {
            features.push_str(&format!(
                "<starttls xmlns='{}'><required/></starttls>",
                ns::TLS
            ));
        }

        let offer_sasl = !is_socket || self.ctx.secured;
        if offer_sasl && !self.authenticators.is_empty() {
            features.push_str(&format!("<mechanisms xmlns='{}'>", ns::SASL));
            for authenticator in &self.authenticators {
                features.push_str(&format!(
                    "<mechanism>{}</mechanism>",
                    authenticator.mechanism()
                ));
            }
            features.push_str("</mechanisms>");
        }

        // in-band registration over encrypted streams only
        if self.register.is_some() && self.ctx.secured {
            features.push_str(&format!("<register xmlns='{}'/>", ns::REGISTER_FEATURE));
        }
        features.push_str("</stream:features>");
        features
    }

    fn authenticated_features(&self) -> String {
        let mut features = format!("<stream:features xmlns:stream='{}'>", ns::STREAM);
        let is_socket = self.transport.kind() == TransportKind::Socket;

        let compression_available =
            is_socket && self.cfg.compression.level != CompressionLevel::No;
        if compression_available && !self.ctx.compressed {
            features.push_str(&format!(
                "<compression xmlns='{}'><method>zlib</method></compression>",
                ns::COMPRESS_FEATURE
            ));
        }

        features.push_str(&format!("<bind xmlns='{}'><required/></bind>", ns::BIND));
        features.push_str(&format!("<session xmlns='{}'/>", ns::SESSION));
        if self.cfg.modules.roster.versioning {
            features.push_str(&format!("<ver xmlns='{}'/>", ns::ROSTER_VER));
        }
        features.push_str("</stream:features>");
        features
    }

    // ---- element dispatch ---------------------------------------------

    async fn handle_element(&mut self, element: Element) {
        if self.transport.kind() == TransportKind::WebSocket
            && element.name() == "close"
            && element.ns() == ns::FRAMING
        {
            self.disconnect(None).await;
            return;
        }
        match self.state {
            StreamState::Connecting => {
                // a stanza before the stream open
                self.disconnect(Some(StreamErrorKind::UnsupportedStanzaType))
                    .await;
            }
            StreamState::Connected => self.handle_connected(element).await,
            StreamState::Authenticating => self.handle_authenticating(element).await,
            StreamState::Authenticated => self.handle_authenticated(element).await,
            StreamState::SessionStarted => self.handle_session_started(element).await,
            StreamState::Disconnected => {}
        }
    }

    async fn handle_connected(&mut self, element: Element) {
        match element.name() {
            "starttls" => {
                if element.ns() != ns::TLS && element.ns() != ns::JABBER_CLIENT {
                    self.disconnect(Some(StreamErrorKind::InvalidNamespace)).await;
                    return;
                }
                self.proceed_starttls().await;
            }
            "auth" => {
                if element.ns() != ns::SASL {
                    self.disconnect(Some(StreamErrorKind::InvalidNamespace)).await;
                    return;
                }
                self.start_authentication(element).await;
            }
            "iq" => {
                let iq = match self.build_stanza(element, false) {
                    Ok(Stanza::Iq(iq)) => iq,
                    Ok(_) => unreachable!("iq element builds an iq stanza"),
                    Err(fate) => {
                        self.handle_element_fate(fate).await;
                        return;
                    }
                };

                // in-band registration is reachable pre-auth over a
                // secured stream
                let register = self.register.clone();
                if let Some(register) = register {
                    if self.ctx.secured && crate::module::IqHandler::matches(&*register, &iq) {
                        let ctx = self.handler_context();
                        match crate::module::IqHandler::process(&*register, &iq, &ctx).await {
                            Ok(replies) => {
                                for reply in replies {
                                    self.write_element(&reply).await;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Registration failed");
                                self.write_element(&iq.service_unavailable_error()).await;
                            }
                        }
                        return;
                    }
                }

                // pre-SASL legacy authentication is not supported
                if iq.payload_named("query", ns::AUTH_LEGACY).is_some() {
                    self.write_element(&iq.service_unavailable_error()).await;
                    return;
                }

                self.disconnect(Some(StreamErrorKind::NotAuthorized)).await;
            }
            "message" | "presence" => {
                self.disconnect(Some(StreamErrorKind::NotAuthorized)).await;
            }
            _ => {
                self.disconnect(Some(StreamErrorKind::UnsupportedStanzaType))
                    .await;
            }
        }
    }

    async fn handle_authenticating(&mut self, element: Element) {
        if element.ns() != ns::SASL {
            self.disconnect(Some(StreamErrorKind::InvalidNamespace)).await;
            return;
        }
        match self.active_auth {
            Some(index) => self.continue_authentication(element, index).await,
            None => {
                self.fail_authentication(SaslErrorKind::TemporaryAuthFailure, None)
                    .await;
            }
        }
    }

    async fn handle_authenticated(&mut self, element: Element) {
        match element.name() {
            "compress" => {
                if element.ns() != ns::COMPRESS {
                    self.disconnect(Some(StreamErrorKind::UnsupportedStanzaType))
                        .await;
                    return;
                }
                self.compress(element).await;
            }
            "iq" => {
                let iq = match self.build_stanza(element, true) {
                    Ok(Stanza::Iq(iq)) => iq,
                    Ok(_) => unreachable!("iq element builds an iq stanza"),
                    Err(fate) => {
                        self.handle_element_fate(fate).await;
                        return;
                    }
                };
                if self.ctx.resource.is_empty() {
                    self.bind_resource(iq).await;
                } else {
                    self.start_session(iq).await;
                }
            }
            _ => {
                self.disconnect(Some(StreamErrorKind::UnsupportedStanzaType))
                    .await;
            }
        }
    }

    async fn handle_session_started(&mut self, element: Element) {
        if let Some(ping) = self.modules.as_ref().and_then(|m| m.ping.clone()) {
            ping.reset_deadline();
        }
        let stanza = match self.build_stanza(element, true) {
            Ok(stanza) => stanza,
            Err(fate) => {
                self.handle_element_fate(fate).await;
                return;
            }
        };
        if self.is_component_domain(stanza.to_jid().domain().as_str()) {
            self.process_component_stanza(&stanza);
            return;
        }
        self.process_stanza(stanza).await;
    }

    async fn handle_element_fate(&mut self, fate: ElementFate) {
        match fate {
            ElementFate::StreamError(kind) => self.disconnect(Some(kind)).await,
            ElementFate::Reply(element) => self.write_element(&element).await,
        }
    }

    // ---- TLS and compression ------------------------------------------

    async fn proceed_starttls(&mut self) {
        if self.ctx.secured || self.transport.kind() != TransportKind::Socket {
            self.disconnect(Some(StreamErrorKind::NotAuthorized)).await;
            return;
        }
        self.write_element(&Element::builder("proceed", ns::TLS).build())
            .await;

        match self.transport.start_tls().await {
            Ok(()) => {
                self.ctx.secured = true;
                info!("Stream secured");
                self.restart();
            }
            Err(e) => {
                warn!(error = %e, "TLS handshake failed");
                self.disconnect_closing_stream(false).await;
            }
        }
    }

    async fn compress(&mut self, element: Element) {
        if self.ctx.compressed {
            self.disconnect(Some(StreamErrorKind::UnsupportedStanzaType))
                .await;
            return;
        }
        let method = element
            .get_child("method", ns::COMPRESS)
            .map(|m| m.text())
            .unwrap_or_default();
        if method.is_empty() {
            self.write_raw(&format!(
                "<failure xmlns='{}'><setup-failed/></failure>",
                ns::COMPRESS
            ))
            .await;
            return;
        }
        if method != "zlib" {
            self.write_raw(&format!(
                "<failure xmlns='{}'><unsupported-method/></failure>",
                ns::COMPRESS
            ))
            .await;
            return;
        }
        if self.transport.kind() != TransportKind::Socket
            || self.cfg.compression.level == CompressionLevel::No
        {
            self.write_raw(&format!(
                "<failure xmlns='{}'><setup-failed/></failure>",
                ns::COMPRESS
            ))
            .await;
            return;
        }

        self.ctx.compressed = true;
        // the acknowledgment must leave uncompressed
        self.write_element(&Element::builder("compressed", ns::COMPRESS).build())
            .await;
        if let Err(e) = self.transport.enable_compression(self.cfg.compression.level) {
            warn!(error = %e, "Failed to enable compression");
            self.disconnect_closing_stream(false).await;
            return;
        }
        info!("Stream compressed");
        self.restart();
    }

    // ---- SASL ---------------------------------------------------------

    async fn start_authentication(&mut self, element: Element) {
        let mechanism = element.attr("mechanism").unwrap_or_default().to_string();
        let index = self
            .authenticators
            .iter()
            .position(|a| a.mechanism() == mechanism);
        match index {
            Some(index) => self.continue_authentication(element, index).await,
            None => {
                debug!(mechanism = %mechanism, "Unknown SASL mechanism requested");
                self.write_raw(&format!(
                    "<failure xmlns='{}'><invalid-mechanism/></failure>",
                    ns::SASL
                ))
                .await;
            }
        }
    }

    async fn continue_authentication(&mut self, element: Element, index: usize) {
        match self.authenticators[index].process(&element).await {
            Ok(SaslStep::Success { payload }) => {
                let success = match payload {
                    Some(data) => format!("<success xmlns='{}'>{}</success>", ns::SASL, data),
                    None => format!("<success xmlns='{}'/>", ns::SASL),
                };
                self.write_raw(&success).await;
                self.finish_authentication(index);
            }
            Ok(SaslStep::Challenge(data)) => {
                self.write_raw(&format!(
                    "<challenge xmlns='{}'>{}</challenge>",
                    ns::SASL,
                    data
                ))
                .await;
                self.active_auth = Some(index);
                self.state = StreamState::Authenticating;
            }
            Err(kind) => self.fail_authentication(kind, Some(index)).await,
        }
    }

    fn finish_authentication(&mut self, index: usize) {
        let username = self.authenticators[index].username().to_string();
        self.authenticators[index].reset();
        self.active_auth = None;

        self.ctx.username = username.clone();
        self.ctx.authenticated = true;
        match format!("{}@{}", username, self.ctx.domain).parse::<Jid>() {
            Ok(jid) => self.ctx.jid = jid,
            Err(e) => warn!(error = %e, "Authenticated username does not form a JID"),
        }
        info!(user = %username, "Authentication successful");
        self.restart();
    }

    async fn fail_authentication(&mut self, kind: SaslErrorKind, index: Option<usize>) {
        self.write_raw(&format!(
            "<failure xmlns='{}'><{}/></failure>",
            ns::SASL,
            kind.as_str()
        ))
        .await;
        let active = self.active_auth.take().or(index);
        if let Some(index) = active {
            self.authenticators[index].reset();
        }
        self.state = StreamState::Connected;
    }

    // ---- bind and session ---------------------------------------------

    async fn bind_resource(&mut self, iq: Iq) {
        let Some(bind) = iq.payload_named("bind", ns::BIND) else {
            self.write_element(&iq.not_allowed_error()).await;
            return;
        };
        let mut resource = bind
            .get_child("resource", ns::BIND)
            .map(|r| r.text())
            .unwrap_or_default();
        if resource.is_empty() {
            resource = Uuid::new_v4().to_string();
        }

        let bare: BareJid = match format!("{}@{}", self.ctx.username, self.ctx.domain).parse() {
            Ok(bare) => bare,
            Err(e) => {
                warn!(error = %e, "Account does not form a bare JID");
                self.write_element(&iq.bad_request_error()).await;
                return;
            }
        };

        let conflicting = self
            .router
            .streams_matching_jid(&bare)
            .into_iter()
            .find(|s| s.resource() == resource);
        if let Some(existing) = conflicting {
            match self.cfg.resource_conflict {
                ResourceConflictPolicy::Override => {
                    // deterministic server-minted replacement
                    resource = hex::encode(Sha256::digest(self.id.as_bytes()));
                }
                ResourceConflictPolicy::Replace => {
                    existing
                        .handle()
                        .disconnect(Some(StreamErrorKind::ResourceConstraint))
                        .await;
                }
                ResourceConflictPolicy::Disallow => {
                    self.write_element(&iq.conflict_error()).await;
                    return;
                }
            }
        }

        let full = match bare.with_resource_str(&resource) {
            Ok(full) => full,
            Err(e) => {
                debug!(error = %e, "Invalid resource in bind request");
                self.write_element(&iq.bad_request_error()).await;
                return;
            }
        };

        self.ctx.resource = resource;
        self.ctx.jid = Jid::from(full.clone());
        self.bound_jid = Some(full.clone());
        info!(jid = %full, "Resource bound");

        let payload = Element::builder("bind", ns::BIND)
            .append(
                Element::builder("jid", ns::BIND)
                    .append(full.to_string())
                    .build(),
            )
            .build();
        self.write_element(&iq.result_with_payload(payload)).await;

        let entry = BoundStream::new(self.id.clone(), full.clone(), self.handle.clone());
        self.router.register_stream(entry);
        self.router.authenticate_stream(&full);
    }

    async fn start_session(&mut self, iq: Iq) {
        if self.ctx.resource.is_empty() {
            self.disconnect(Some(StreamErrorKind::NotAuthorized)).await;
            return;
        }
        if iq.payload_named("session", ns::SESSION).is_none() {
            self.write_element(&iq.not_allowed_error()).await;
            return;
        }
        self.write_element(&iq.result()).await;

        let modules = ModuleSet::new(&self.cfg.modules, self.register.clone());
        if let Some(ping) = &modules.ping {
            ping.start_pinging(
                self.handle.clone(),
                self.ctx.domain.clone(),
                self.ctx.jid.clone(),
            );
        }
        self.modules = Some(modules);
        self.state = StreamState::SessionStarted;
        info!(jid = %self.ctx.jid, "Session started");
    }

    // ---- stanza processing --------------------------------------------

    fn build_stanza(&self, element: Element, validate_from: bool) -> Result<Stanza, ElementFate> {
        if element.ns() != ns::JABBER_CLIENT {
            return Err(ElementFate::StreamError(StreamErrorKind::InvalidNamespace));
        }
        if validate_from {
            if let Some(from) = element.attr("from") {
                if !is_valid_from(&self.ctx.jid, from) {
                    return Err(ElementFate::StreamError(StreamErrorKind::InvalidFrom));
                }
            }
        }

        let from = self.ctx.jid.clone();
        let to = match element.attr("to").filter(|to| !to.is_empty()) {
            Some(to) => match to.parse::<Jid>() {
                Ok(jid) => jid,
                Err(_) => {
                    return Err(ElementFate::Reply(error_reply(
                        &element,
                        StanzaErrorType::Modify,
                        StanzaErrorCondition::JidMalformed,
                        Vec::new(),
                    )))
                }
            },
            // the account's bare JID is the default destination
            None => Jid::from(self.ctx.jid.to_bare()),
        };

        let raw = element.clone();
        let mut element = element;
        element.set_attr("from", from.to_string());
        element.set_attr("to", to.to_string());

        let built = match element.name() {
            "iq" => Iq::from_element(element, from, to).map(Stanza::Iq),
            "presence" => Presence::from_element(element, from, to).map(Stanza::Presence),
            "message" => Message::from_element(element, from, to).map(Stanza::Message),
            _ => {
                return Err(ElementFate::StreamError(
                    StreamErrorKind::UnsupportedStanzaType,
                ))
            }
        };
        built.map_err(|e| {
            debug!(error = %e, "Malformed stanza");
            ElementFate::Reply(error_reply(
                &raw,
                StanzaErrorType::Modify,
                StanzaErrorCondition::BadRequest,
                Vec::new(),
            ))
        })
    }

    async fn process_stanza(&mut self, stanza: Stanza) {
        let to = stanza.to_jid().clone();
        if self.is_blocked_jid(&to).await {
            let blocked = Element::builder("blocked", ns::BLOCKED_ERRORS).build();
            let reply = stanza.error_reply(
                StanzaErrorType::Cancel,
                StanzaErrorCondition::NotAcceptable,
                vec![blocked],
            );
            self.write_element(&reply).await;
            return;
        }
        match stanza {
            Stanza::Presence(presence) => self.process_presence(presence).await,
            Stanza::Iq(iq) => self.process_iq(iq).await,
            Stanza::Message(message) => self.process_message(message).await,
        }
    }

    async fn process_iq(&mut self, iq: Iq) {
        let to = iq.to_jid().clone();
        if !self.router.is_local_domain(to.domain().as_str()) {
            // federation is not implemented; non-local IQs are dropped
            debug!(to = %to, "Dropping IQ to non-local domain");
            return;
        }
        if let Some(node) = to.node() {
            if self
                .router
                .is_blocked_jid(&self.ctx.jid, node.as_str())
                .await
            {
                // destination user blocks this stream's JID
                if iq.is_get() || iq.is_set() {
                    self.write_element(&iq.service_unavailable_error()).await;
                }
                return;
            }
        }
        if to.is_full_with_user() {
            match self.router.route(&Stanza::Iq(iq.clone())).await {
                Ok(()) => {}
                Err(RouteError::ResourceNotFound) => {
                    self.write_element(&iq.service_unavailable_error()).await;
                }
                Err(e) => debug!(error = ?e, "IQ routing failed"),
            }
            return;
        }

        let handler = self
            .modules
            .as_ref()
            .and_then(|m| m.handlers.iter().find(|h| h.matches(&iq)).cloned());
        match handler {
            Some(handler) => {
                let ctx = self.handler_context();
                match handler.process(&iq, &ctx).await {
                    Ok(replies) => {
                        for reply in replies {
                            self.write_element(&reply).await;
                        }
                    }
                    Err(e) => {
                        // internal detail stays server-side
                        warn!(error = %e, "IQ handler failed");
                        if iq.is_get() || iq.is_set() {
                            self.write_element(&iq.service_unavailable_error()).await;
                        }
                    }
                }
            }
            None => {
                if iq.is_get() || iq.is_set() {
                    self.write_element(&iq.service_unavailable_error()).await;
                }
            }
        }
    }

    async fn process_presence(&mut self, presence: Presence) {
        let to = presence.to_jid().clone();
        if !self.router.is_local_domain(to.domain().as_str()) {
            debug!(to = %to, "Dropping presence to non-local domain");
            return;
        }

        let own_bare = Jid::from(self.ctx.jid.to_bare());
        if to.is_bare() && to != own_bare {
            // subscription traffic goes through the roster
            let roster = self.modules.as_ref().map(|m| m.roster.clone());
            if let Some(roster) = roster {
                let ctx = self.handler_context();
                match roster.process_presence(&presence, &ctx).await {
                    Ok(replies) => {
                        for reply in replies {
                            self.write_element(&reply).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "Roster presence handling failed"),
                }
            }
            return;
        }
        if to.is_full_with_user() {
            if let Err(e) = self.router.route(&Stanza::Presence(presence.clone())).await {
                debug!(error = ?e, "Presence routing failed");
            }
            return;
        }

        // self-presence: record it and run the one-shot deliveries
        self.ctx.presence = Some(presence.clone());
        if let Some(full) = &self.bound_jid {
            self.router.update_presence(
                full,
                presence.is_available(),
                presence.priority(),
                Some(presence.element().clone()),
            );
        }

        let ctx = self.handler_context();
        let (roster, offline) = match &self.modules {
            Some(m) => (Some(m.roster.clone()), m.offline.clone()),
            None => (None, None),
        };

        if let Some(roster) = &roster {
            if !self.ctx.roster_delivered {
                self.ctx.roster_delivered = true;
                match roster.deliver_pending_approval_notifications(&ctx).await {
                    Ok(pending) => {
                        for element in pending {
                            self.write_element(&element).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "Pending notification delivery failed"),
                }
                match roster.receive_presences(&ctx).await {
                    Ok(presences) => {
                        for element in presences {
                            self.write_element(&element).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "Contact presence backfill failed"),
                }
            }
            if let Err(e) = roster.broadcast_presence(presence.element(), &ctx).await {
                warn!(error = %e, "Presence broadcast failed");
            }
        }

        if let Some(offline) = offline {
            if presence.priority() >= 0 && !self.ctx.offline_delivered {
                self.ctx.offline_delivered = true;
                match offline.deliver_messages(&ctx).await {
                    Ok(messages) => {
                        for element in messages {
                            self.write_element(&element).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "Offline delivery failed"),
                }
            }
        }
    }

    async fn process_message(&mut self, message: Message) {
        if !self
            .router
            .is_local_domain(message.to_jid().domain().as_str())
        {
            debug!(to = %message.to_jid(), "Dropping message to non-local domain");
            return;
        }

        let mut attempt = message;
        let mut retried = false;
        loop {
            match self.router.route(&Stanza::Message(attempt.clone())).await {
                Ok(()) => return,
                Err(RouteError::NotAuthenticated) => {
                    // recipient offline
                    let offline = self.modules.as_ref().and_then(|m| m.offline.clone());
                    if let Some(offline) = offline {
                        if offline.should_archive(&attempt) {
                            let ctx = self.handler_context();
                            match offline.archive_message(&attempt, &ctx).await {
                                Ok(Some(reply)) => self.write_element(&reply).await,
                                Ok(None) => {}
                                Err(e) => warn!(error = %e, "Offline archiving failed"),
                            }
                        }
                    }
                    return;
                }
                Err(RouteError::ResourceNotFound) if !retried => {
                    // one retry addressed to the bare JID, never a loop
                    retried = true;
                    attempt = attempt.to_bare_recipient();
                }
                Err(RouteError::NotExistingAccount) | Err(RouteError::BlockedJid) => {
                    self.write_element(
                        &Stanza::Message(attempt).service_unavailable_error(),
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    debug!(error = ?e, "Message routing failed");
                    return;
                }
            }
        }
    }

    /// Server JIDs on local domains are never blocked.
    async fn is_blocked_jid(&self, jid: &Jid) -> bool {
        if jid.is_server() && self.router.is_local_domain(jid.domain().as_str()) {
            return false;
        }
        self.router.is_blocked_jid(jid, &self.ctx.username).await
    }

    /// Component routing hook; no component domains are configured yet.
    fn is_component_domain(&self, _domain: &str) -> bool {
        false
    }

    fn process_component_stanza(&self, _stanza: &Stanza) {}

    fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            stream_id: self.id.clone(),
            username: self.ctx.username.clone(),
            domain: self.ctx.domain.clone(),
            jid: self.ctx.jid.clone(),
            router: Arc::clone(&self.router),
            storage: Arc::clone(&self.storage),
        }
    }

    // ---- teardown -----------------------------------------------------

    async fn disconnect(&mut self, error: Option<StreamErrorKind>) {
        if self.state == StreamState::Disconnected {
            return;
        }
        match error {
            Some(kind) => {
                // an error during negotiation still needs a stream envelope
                if self.state == StreamState::Connecting {
                    self.open_stream().await;
                }
                self.write_raw(&kind.to_xml()).await;
                self.disconnect_closing_stream(true).await;
            }
            None => self.disconnect_closing_stream(true).await,
        }
    }

    async fn disconnect_closing_stream(&mut self, close_stream: bool) {
        if self.state == StreamState::Disconnected {
            return;
        }
        if let Err(e) = self.update_logout_info().await {
            warn!(error = %e, "Failed to persist logout info");
        }

        // peers must see the unavailable transition before teardown
        let broadcast_unavailable = self
            .ctx
            .presence
            .as_ref()
            .map(|p| p.is_available())
            .unwrap_or(false);
        if broadcast_unavailable {
            if let Some(modules) = &self.modules {
                let unavailable = Presence::unavailable(&self.ctx.jid, &self.ctx.jid);
                let ctx = self.handler_context();
                if let Err(e) = modules
                    .roster
                    .broadcast_presence(unavailable.element(), &ctx)
                    .await
                {
                    warn!(error = %e, "Unavailable broadcast failed");
                }
            }
        }

        if close_stream {
            let closing = match self.transport.kind() {
                TransportKind::Socket => "</stream:stream>".to_string(),
                TransportKind::WebSocket => format!("<close xmlns='{}'/>", ns::FRAMING),
            };
            self.write_raw(&closing).await;
        }

        self.ctx.terminated = true;
        if let Some(full) = self.bound_jid.take() {
            self.router.unregister_stream(&full, &self.id);
        }
        self.state = StreamState::Disconnected;
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "Transport close failed");
        }
        info!("Stream closed");
    }

    async fn update_logout_info(&self) -> Result<(), XmppError> {
        let Some(presence) = &self.ctx.presence else {
            return Ok(());
        };
        let Some(mut user) = self.storage.fetch_user(&self.ctx.username).await? else {
            return Ok(());
        };
        user.logged_out_at = Some(chrono::Utc::now());
        if presence.is_unavailable() {
            user.logged_out_status = presence.status();
        }
        self.storage.insert_or_update_user(&user).await
    }

    /// Stream restart after TLS, compression or SASL success: fresh
    /// parser, back to `connecting`, awaiting a new stream open.
    fn restart(&mut self) {
        self.parser = XmlParser::new(self.cfg.max_stanza_size);
        self.state = StreamState::Connecting;
    }

    // ---- writes -------------------------------------------------------

    async fn write_element(&mut self, element: &Element) {
        debug!(xml = %element_to_string(element), "SEND");
        if let Err(e) = self.transport.write_element(element).await {
            debug!(error = %e, "Transport write failed");
        }
    }

    async fn write_raw(&mut self, xml: &str) {
        debug!(xml = %xml, "SEND");
        if let Err(e) = self.transport.write_bytes(xml.as_bytes()).await {
            debug!(error = %e, "Transport write failed");
        }
    }
}

/// A stanza 'from' override is only accepted when it matches the bound
/// JID's node and domain, and its resource when one is given.
fn is_valid_from(bound: &Jid, from: &str) -> bool {
    let Ok(jid) = from.parse::<Jid>() else {
        return false;
    };
    let mut valid = jid.node() == bound.node() && jid.domain() == bound.domain();
    if let Some(resource) = jid.resource() {
        valid = valid && Some(resource) == bound.resource();
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_from() {
        let bound: Jid = "alice@localhost/home".parse().unwrap();

        assert!(is_valid_from(&bound, "alice@localhost"));
        assert!(is_valid_from(&bound, "alice@localhost/home"));
        assert!(!is_valid_from(&bound, "alice@localhost/other"));
        assert!(!is_valid_from(&bound, "bob@localhost"));
        assert!(!is_valid_from(&bound, "alice@jabber.org"));
        assert!(!is_valid_from(&bound, "not a jid"));
    }

    #[test]
    fn test_stream_states_are_distinct() {
        assert_ne!(StreamState::Connecting, StreamState::Connected);
        assert_ne!(StreamState::SessionStarted, StreamState::Disconnected);
    }
}
