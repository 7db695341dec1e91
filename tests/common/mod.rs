//! Test utilities: an in-memory scripted transport and a harness that
//! spawns streams against an isolated router/storage pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use heron_xmpp::{
    C2sConfig, CompressionLevel, MemoryStorage, Router, Storage, Stream, StreamHandle,
    Transport, TransportKind, User, XmppError,
};

/// Default timeout for expected server output.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// In-memory transport driven by the test.
///
/// TLS upgrade and compression are modeled as flag flips so the full
/// negotiation sequence can run without a real handshake.
pub struct MockTransport {
    kind: TransportKind,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    written: Arc<Mutex<Vec<u8>>>,
    secured: Arc<AtomicBool>,
    compressed: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    channel_binding: Option<Vec<u8>>,
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        if self.pending.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0), // peer hung up
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), XmppError> {
        self.written
            .lock()
            .expect("written lock poisoned")
            .extend_from_slice(bytes);
        Ok(())
    }

    async fn start_tls(&mut self) -> Result<(), XmppError> {
        if self.secured.swap(true, Ordering::SeqCst) {
            return Err(XmppError::stream("already using TLS"));
        }
        Ok(())
    }

    fn enable_compression(&mut self, _level: CompressionLevel) -> Result<(), XmppError> {
        if self.compressed.swap(true, Ordering::SeqCst) {
            return Err(XmppError::stream("compression already enabled"));
        }
        Ok(())
    }

    fn channel_binding_data(&self) -> Option<Vec<u8>> {
        if self.secured.load(Ordering::SeqCst) {
            self.channel_binding.clone()
        } else {
            None
        }
    }

    async fn close(&mut self) -> Result<(), XmppError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The client side of a mock transport.
pub struct TestClient {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    written: Arc<Mutex<Vec<u8>>>,
    secured: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    cursor: usize,
    pub handle: StreamHandle,
}

impl TestClient {
    /// Send raw XML to the server.
    pub fn send(&self, xml: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(xml.as_bytes().to_vec());
        }
    }

    /// Simulate the peer dropping the connection (EOF).
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Everything the server has written so far, with attribute quoting
    /// normalized to single quotes so expectations are writer-agnostic.
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().expect("written lock poisoned"))
            .replace('"', "'")
    }

    pub fn is_secured(&self) -> bool {
        self.secured.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the server writes `needle` past the read cursor and
    /// return the newly consumed output segment.
    pub async fn expect(&mut self, needle: &str) -> String {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            {
                let output = self.output();
                if let Some(pos) = output[self.cursor..].find(needle) {
                    let end = self.cursor + pos + needle.len();
                    let segment = output[self.cursor..end].to_string();
                    self.cursor = end;
                    return segment;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for {:?}; output after cursor: {:?}",
                    needle,
                    &self.output()[self.cursor..]
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until all needles appear past the cursor, in any order
    /// (attribute order on serialized elements is not guaranteed), then
    /// advance the cursor past the furthest match.
    pub async fn expect_all(&mut self, needles: &[&str]) -> String {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            {
                let output = self.output();
                let tail = &output[self.cursor..];
                let positions: Vec<Option<usize>> =
                    needles.iter().map(|n| tail.find(n)).collect();
                if positions.iter().all(Option::is_some) {
                    let end = positions
                        .iter()
                        .zip(needles)
                        .map(|(pos, n)| pos.unwrap() + n.len())
                        .max()
                        .unwrap_or(0);
                    let segment = tail[..end].to_string();
                    self.cursor += end;
                    return segment;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for {:?}; output after cursor: {:?}",
                    needles,
                    &self.output()[self.cursor..]
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait for the transport to be closed by the server.
    pub async fn expect_closed(&self) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while !self.is_closed() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for transport close");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Assert that nothing matching `needle` was written past the cursor.
    pub fn assert_absent(&self, needle: &str) {
        let output = self.output();
        assert!(
            !output[self.cursor.min(output.len())..].contains(needle),
            "unexpected {:?} in output",
            needle
        );
    }
}

/// An isolated server environment: one router, one storage, a config.
pub struct TestServer {
    pub router: Arc<Router>,
    pub storage: Arc<MemoryStorage>,
    pub cfg: C2sConfig,
}

impl TestServer {
    /// Environment with the given config and the users alice and bob.
    pub async fn with_config(cfg: C2sConfig) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert_or_update_user(&User::new("alice", "s3cret"))
            .await
            .unwrap();
        storage
            .insert_or_update_user(&User::new("bob", "hunter2"))
            .await
            .unwrap();
        let dyn_storage: Arc<dyn Storage> = storage.clone();
        let router = Arc::new(Router::new(vec!["localhost".to_string()], dyn_storage));
        Self {
            router,
            storage,
            cfg,
        }
    }

    pub async fn new() -> Self {
        Self::with_config(C2sConfig::default()).await
    }

    /// Accept a new socket connection.
    pub fn connect(&self) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let secured = Arc::new(AtomicBool::new(false));
        let compressed = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let transport = MockTransport {
            kind: TransportKind::Socket,
            rx,
            pending: Vec::new(),
            written: Arc::clone(&written),
            secured: Arc::clone(&secured),
            compressed: Arc::clone(&compressed),
            closed: Arc::clone(&closed),
            channel_binding: None,
        };

        let storage: Arc<dyn Storage> = self.storage.clone();
        let handle = Stream::spawn(
            Box::new(transport),
            Arc::clone(&self.router),
            storage,
            self.cfg.clone(),
        );

        TestClient {
            tx: Some(tx),
            written,
            secured,
            closed,
            cursor: 0,
            handle,
        }
    }
}

/// Standard socket stream open.
pub const STREAM_OPEN: &str = "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='localhost' version='1.0'>";

/// Base64 of `\0user\0password`.
pub fn plain_credentials(user: &str, password: &str) -> String {
    use base64::prelude::*;
    BASE64_STANDARD.encode(format!("\0{}\0{}", user, password))
}

/// Drive the full negotiation through session establishment and return
/// the bound full JID.
pub async fn login(
    client: &mut TestClient,
    user: &str,
    password: &str,
    resource: Option<&str>,
) -> String {
    client.send(STREAM_OPEN);
    client.expect("<starttls").await;

    client.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    client.expect("<proceed").await;

    client.send(STREAM_OPEN);
    client.expect("PLAIN").await;

    client.send(&format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
        plain_credentials(user, password)
    ));
    client.expect("<success").await;

    client.send(STREAM_OPEN);
    client.expect("<bind").await;

    let resource_xml = resource
        .map(|r| format!("<resource>{}</resource>", r))
        .unwrap_or_default();
    client.send(&format!(
        "<iq id='bind-1' type='set'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>{}</bind></iq>",
        resource_xml
    ));
    let bind_result = client.expect("</jid>").await;
    let jid = bind_result
        .rsplit_once("<jid>")
        .map(|(_, tail)| tail.trim_end_matches("</jid>").to_string())
        .expect("bind result carries the bound JID");

    client.send(
        "<iq id='sess-1' type='set'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
    );
    client.expect_all(&["id='sess-1'", "type='result'"]).await;

    jid
}
