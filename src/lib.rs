//! # heron-xmpp
//!
//! Client-to-server XMPP stream engine implementing RFC 6120/6121.
//!
//! The engine owns the lifecycle of one client connection from accept
//! through TLS upgrade, SASL authentication, resource binding, session
//! establishment, stanza routing and teardown.
//!
//! ## Architecture
//!
//! - **Stream**: one actor per connection driving the protocol state
//!   machine; all mutation is serialized on its task
//! - **Transport**: abstract connection capability (TCP/TLS/zlib in-tree,
//!   WebSocket pluggable)
//! - **Router**: process-wide registry of bound streams, injected per
//!   stream so tests can run isolated instances
//! - **Storage**: backend capability for users, rosters, blocklists,
//!   offline queues, vCards and private XML
//! - **Modules**: feature plugins dispatched as IQ handlers (disco,
//!   roster, last activity, private storage, vCard, registration,
//!   version, blocking, ping) plus offline message storage

pub mod auth;
pub mod config;
pub mod module;
pub mod parser;
pub mod router;
pub mod server;
pub mod stanza;
pub mod storage;
pub mod stream;
pub mod transport;

mod error;

pub use config::{C2sConfig, ModulesConfig, ResourceConflictPolicy};
pub use error::{
    SaslErrorKind, StanzaErrorCondition, StanzaErrorType, StreamErrorKind, XmppError,
};
pub use parser::{ns, ParsedEvent, StreamHeader, XmlParser};
pub use router::{BoundStream, RouteError, Router};
pub use server::{Server, ServerConfig};
pub use stanza::{Iq, IqKind, JidExt, Message, MessageKind, Presence, PresenceKind, Stanza};
pub use storage::{MemoryStorage, RosterItem, Storage, Subscription, User};
pub use stream::{Stream, StreamContext, StreamHandle, StreamState};
pub use transport::{CompressionLevel, SocketTransport, Transport, TransportKind};
