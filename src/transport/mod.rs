//! Transport capability consumed by the stream engine.
//!
//! The engine never touches a socket directly: it drives a [`Transport`],
//! which hides the physical connection and any adapters (TLS, zlib)
//! layered onto it mid-stream. One concrete implementation ships in-tree
//! ([`SocketTransport`]); tests substitute an in-memory transport.

mod socket;

pub use socket::SocketTransport;

use async_trait::async_trait;
use minidom::Element;
use serde::{Deserialize, Serialize};

use crate::error::XmppError;
use crate::parser::element_to_string;

/// Transport flavor, observable by the state machine.
///
/// Socket transports start unsecured and negotiate STARTTLS and optional
/// compression in-band; message-framed transports (WebSocket) arrive
/// already secured by their outer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Socket,
    WebSocket,
}

/// zlib compression levels (XEP-0138).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionLevel {
    /// Compression disabled; the feature is not advertised
    No,
    #[default]
    Default,
    BestSpeed,
    BestCompression,
}

/// Abstract bidirectional connection to one client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The transport flavor tag.
    fn kind(&self) -> TransportKind;

    /// Read available bytes; returns 0 on EOF.
    async fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, XmppError>;

    /// Write and flush raw bytes.
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), XmppError>;

    /// Serialize an element and write it.
    async fn write_element(&mut self, element: &Element) -> Result<(), XmppError> {
        let xml = element_to_string(element);
        self.write_bytes(xml.as_bytes()).await
    }

    /// Perform the server-side TLS handshake, replacing the raw connection.
    async fn start_tls(&mut self) -> Result<(), XmppError>;

    /// Wrap the connection in a zlib codec.
    fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), XmppError>;

    /// TLS channel binding material for SCRAM `-PLUS` mechanisms, when the
    /// connection can provide it.
    fn channel_binding_data(&self) -> Option<Vec<u8>>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), XmppError>;
}
