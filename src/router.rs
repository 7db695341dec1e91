//! Process-wide registry of bound streams and stanza routing.
//!
//! The router is an explicit value injected into every stream at creation,
//! so tests can instantiate isolated routers. Reads are concurrent,
//! writes serialized per map shard; the router never calls into a stream
//! while holding a shard guard — target handles are collected first and
//! stanzas are delivered through each stream's mailbox afterwards.

use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tracing::{debug, warn};

use crate::error::XmppError;
use crate::stanza::Stanza;
use crate::storage::Storage;
use crate::stream::StreamHandle;

/// Routing failures surfaced to callers; transport-level send problems
/// are logged, not surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// The account exists but has no authenticated bound streams
    NotAuthenticated,
    /// The addressed resource is not bound
    ResourceNotFound,
    /// No such account on the local domain
    NotExistingAccount,
    /// The recipient blocks the sender
    BlockedJid,
}

/// Registry entry for one bound stream.
#[derive(Clone)]
pub struct BoundStream {
    id: String,
    username: String,
    resource: String,
    jid: FullJid,
    handle: StreamHandle,
    authenticated: Arc<AtomicBool>,
    available: Arc<AtomicBool>,
    priority: Arc<AtomicI8>,
    last_presence: Arc<Mutex<Option<Element>>>,
}

impl BoundStream {
    /// Create an entry for a freshly bound stream.
    pub fn new(id: impl Into<String>, jid: FullJid, handle: StreamHandle) -> Self {
        let username = jid
            .node()
            .map(|n| n.as_str().to_string())
            .unwrap_or_default();
        let resource = jid.resource().as_str().to_string();
        Self {
            id: id.into(),
            username,
            resource,
            jid,
            handle,
            authenticated: Arc::new(AtomicBool::new(false)),
            available: Arc::new(AtomicBool::new(false)),
            priority: Arc::new(AtomicI8::new(0)),
            last_presence: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn jid(&self) -> &FullJid {
        &self.jid
    }

    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Whether the stream sent an available presence.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn priority(&self) -> i8 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Last self-presence element sent on this stream.
    pub fn last_presence(&self) -> Option<Element> {
        self.last_presence.lock().expect("presence lock poisoned").clone()
    }
}

/// Registry of bound C2S streams, keyed by bare JID.
pub struct Router {
    /// Served domains; the first is the default
    local_domains: Vec<String>,
    storage: Arc<dyn Storage>,
    /// bare JID string → bound streams for that account
    streams: DashMap<String, Vec<BoundStream>>,
    /// Per-user blocklist cache, loaded lazily from storage
    blocklists: DashMap<String, Vec<Jid>>,
}

impl Router {
    /// Create a router serving the given domains.
    pub fn new(local_domains: Vec<String>, storage: Arc<dyn Storage>) -> Self {
        assert!(
            !local_domains.is_empty(),
            "router requires at least one local domain"
        );
        Self {
            local_domains,
            storage,
            streams: DashMap::new(),
            blocklists: DashMap::new(),
        }
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.local_domains.iter().any(|d| d == domain)
    }

    pub fn default_local_domain(&self) -> &str {
        &self.local_domains[0]
    }

    /// Register a stream under its full JID after a successful bind.
    pub fn register_stream(&self, stream: BoundStream) {
        let bare = stream.jid().to_bare().to_string();
        debug!(jid = %stream.jid(), "Registering stream");
        self.streams.entry(bare).or_default().push(stream);
    }

    /// Mark a registered stream as routable.
    pub fn authenticate_stream(&self, jid: &FullJid) {
        let bare = jid.to_bare().to_string();
        if let Some(entries) = self.streams.get(&bare) {
            for entry in entries.iter() {
                if entry.jid() == jid {
                    entry.authenticated.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// Drop a stream registration on disconnect.
    pub fn unregister_stream(&self, jid: &FullJid, stream_id: &str) {
        let bare = jid.to_bare().to_string();
        let mut remove_key = false;
        if let Some(mut entries) = self.streams.get_mut(&bare) {
            entries.retain(|s| !(s.jid() == jid && s.id() == stream_id));
            remove_key = entries.is_empty();
        }
        if remove_key {
            self.streams.remove_if(&bare, |_, entries| entries.is_empty());
        }
        debug!(jid = %jid, "Unregistered stream");
    }

    /// All bound streams for a bare JID.
    pub fn streams_matching_jid(&self, bare: &BareJid) -> Vec<BoundStream> {
        self.streams
            .get(&bare.to_string())
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Record the latest self-presence of a bound stream.
    pub fn update_presence(
        &self,
        jid: &FullJid,
        available: bool,
        priority: i8,
        element: Option<Element>,
    ) -> bool {
        let bare = jid.to_bare().to_string();
        if let Some(entries) = self.streams.get(&bare) {
            for entry in entries.iter() {
                if entry.jid() == jid {
                    entry.available.store(available, Ordering::Relaxed);
                    entry.priority.store(priority, Ordering::Relaxed);
                    *entry.last_presence.lock().expect("presence lock poisoned") =
                        element.clone();
                    return true;
                }
            }
        }
        false
    }

    /// Route a stanza to its local recipient.
    ///
    /// Full recipient JIDs address exactly one bound resource; bare JIDs
    /// fan out to every authenticated stream of the account.
    pub async fn route(&self, stanza: &Stanza) -> Result<(), RouteError> {
        let to = stanza.to_jid();
        if !self.is_local_domain(to.domain().as_str()) {
            return Err(RouteError::NotExistingAccount);
        }
        let username = match to.node() {
            Some(node) => node.as_str().to_string(),
            None => return Err(RouteError::NotExistingAccount),
        };

        if self.is_blocked_jid(stanza.from_jid(), &username).await {
            return Err(RouteError::BlockedJid);
        }

        match self.storage.user_exists(&username).await {
            Ok(true) => {}
            Ok(false) => return Err(RouteError::NotExistingAccount),
            Err(e) => {
                warn!(error = %e, user = %username, "Storage failure during routing");
                return Err(RouteError::NotExistingAccount);
            }
        }

        let targets: Vec<BoundStream> = self
            .streams
            .get(&to.to_bare().to_string())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|s| s.is_authenticated())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if targets.is_empty() {
            return Err(RouteError::NotAuthenticated);
        }

        match to.resource() {
            Some(resource) => {
                let target = targets
                    .iter()
                    .find(|s| s.resource() == resource.as_str())
                    .ok_or(RouteError::ResourceNotFound)?;
                target.handle().send_element(stanza.element().clone()).await;
            }
            None => {
                for target in &targets {
                    target.handle().send_element(stanza.element().clone()).await;
                }
            }
        }
        Ok(())
    }

    /// Whether `username` blocks stanzas from `peer`.
    pub async fn is_blocked_jid(&self, peer: &Jid, username: &str) -> bool {
        match self.blocklist_items(username).await {
            Ok(items) => items.iter().any(|item| jid_matches(item, peer)),
            Err(e) => {
                warn!(error = %e, user = %username, "Failed to load blocklist");
                false
            }
        }
    }

    /// Invalidate the cached blocklist after a blocking-command change.
    pub fn reload_blocklist(&self, username: &str) {
        self.blocklists.remove(username);
    }

    async fn blocklist_items(&self, username: &str) -> Result<Vec<Jid>, XmppError> {
        if let Some(cached) = self.blocklists.get(username) {
            return Ok(cached.clone());
        }
        let raw = self.storage.fetch_blocklist_items(username).await?;
        let parsed: Vec<Jid> = raw.iter().filter_map(|s| s.parse().ok()).collect();
        self.blocklists.insert(username.to_string(), parsed.clone());
        Ok(parsed)
    }
}

/// Blocklist match rule: every part present on the list item must equal
/// the corresponding part of the peer JID.
fn jid_matches(item: &Jid, peer: &Jid) -> bool {
    if item.domain() != peer.domain() {
        return false;
    }
    if let Some(node) = item.node() {
        if peer.node() != Some(node) {
            return false;
        }
    }
    if let Some(resource) = item.resource() {
        if peer.resource() != Some(resource) {
            return false;
        }
    }
    true
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local_domains", &self.local_domains)
            .field("accounts", &self.streams.len())
            .finish()
    }
}
