//! Storage capability consumed by the engine and its feature modules.
//!
//! The stream core only writes the logout bookkeeping fields of the user
//! record; everything else on this trait exists for the feature modules
//! (roster, blocklist, offline queue, vCard, private XML). Backends are
//! assumed concurrency-safe by contract.

mod memory;

pub use memory::MemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minidom::Element;

use crate::error::XmppError;

/// A user account record.
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub password: String,
    /// When the last session for this user ended
    pub logged_out_at: Option<DateTime<Utc>>,
    /// Status string of the final unavailable presence, if one was sent
    pub logged_out_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a fresh user record.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            username: username.into(),
            password: password.into(),
            logged_out_at: None,
            logged_out_status: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Roster subscription states (RFC 6121 Section 2.1.2.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::To => "to",
            Self::From => "from",
            Self::Both => "both",
        }
    }

    /// Whether the owner receives the contact's presence.
    pub fn is_to(&self) -> bool {
        matches!(self, Self::To | Self::Both)
    }

    /// Whether the contact receives the owner's presence.
    pub fn is_from(&self) -> bool {
        matches!(self, Self::From | Self::Both)
    }

    /// Compose a state from its two directional flags.
    pub fn from_flags(to: bool, from: bool) -> Self {
        match (to, from) {
            (false, false) => Self::None,
            (true, false) => Self::To,
            (false, true) => Self::From,
            (true, true) => Self::Both,
        }
    }
}

/// One roster entry.
#[derive(Debug, Clone)]
pub struct RosterItem {
    /// Owner of the roster
    pub username: String,
    /// Contact bare JID
    pub jid: String,
    pub name: Option<String>,
    pub subscription: Subscription,
    /// Pending outbound subscription request
    pub ask: bool,
    pub groups: Vec<String>,
}

/// Storage backend contract.
#[async_trait]
pub trait Storage: Send + Sync {
    // users
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, XmppError>;
    async fn insert_or_update_user(&self, user: &User) -> Result<(), XmppError>;
    async fn user_exists(&self, username: &str) -> Result<bool, XmppError>;
    async fn delete_user(&self, username: &str) -> Result<(), XmppError>;

    // roster
    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, XmppError>;
    async fn fetch_roster_item(
        &self,
        username: &str,
        jid: &str,
    ) -> Result<Option<RosterItem>, XmppError>;
    async fn insert_or_update_roster_item(&self, item: &RosterItem) -> Result<(), XmppError>;
    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<(), XmppError>;

    // pending subscription approval notifications
    async fn fetch_pending_notifications(
        &self,
        username: &str,
    ) -> Result<Vec<Element>, XmppError>;
    async fn insert_pending_notification(
        &self,
        username: &str,
        presence: &Element,
    ) -> Result<(), XmppError>;
    async fn delete_pending_notifications(&self, username: &str) -> Result<(), XmppError>;

    // blocklist
    async fn fetch_blocklist_items(&self, username: &str) -> Result<Vec<String>, XmppError>;
    async fn insert_blocklist_items(
        &self,
        username: &str,
        jids: &[String],
    ) -> Result<(), XmppError>;
    /// Remove the given items; an empty slice clears the whole list.
    async fn delete_blocklist_items(
        &self,
        username: &str,
        jids: &[String],
    ) -> Result<(), XmppError>;

    // offline queue
    async fn insert_offline_message(
        &self,
        username: &str,
        message: &Element,
    ) -> Result<(), XmppError>;
    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, XmppError>;
    async fn delete_offline_messages(&self, username: &str) -> Result<(), XmppError>;
    async fn count_offline_messages(&self, username: &str) -> Result<usize, XmppError>;

    // vcard
    async fn fetch_vcard(&self, username: &str) -> Result<Option<Element>, XmppError>;
    async fn insert_or_update_vcard(
        &self,
        username: &str,
        vcard: &Element,
    ) -> Result<(), XmppError>;

    // private XML storage
    async fn fetch_private_xml(
        &self,
        username: &str,
        namespace: &str,
    ) -> Result<Vec<Element>, XmppError>;
    async fn insert_or_update_private_xml(
        &self,
        username: &str,
        namespace: &str,
        elements: &[Element],
    ) -> Result<(), XmppError>;
}
