//! In-memory storage backend.
//!
//! The default backend for tests and single-node setups. All maps are
//! keyed by username; element payloads are stored as owned trees.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use minidom::Element;

use crate::error::XmppError;
use crate::storage::{RosterItem, Storage, User};

/// DashMap-backed storage.
#[derive(Default)]
pub struct MemoryStorage {
    users: DashMap<String, User>,
    rosters: DashMap<String, Vec<RosterItem>>,
    pending_notifications: DashMap<String, Vec<Element>>,
    blocklists: DashMap<String, Vec<String>>,
    offline: DashMap<String, Vec<Element>>,
    vcards: DashMap<String, Element>,
    private_xml: DashMap<(String, String), Vec<Element>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, XmppError> {
        Ok(self.users.get(username).map(|u| u.value().clone()))
    }

    async fn insert_or_update_user(&self, user: &User) -> Result<(), XmppError> {
        let mut user = user.clone();
        user.updated_at = Utc::now();
        self.users.insert(user.username.clone(), user);
        Ok(())
    }

    async fn user_exists(&self, username: &str) -> Result<bool, XmppError> {
        Ok(self.users.contains_key(username))
    }

    async fn delete_user(&self, username: &str) -> Result<(), XmppError> {
        self.users.remove(username);
        self.rosters.remove(username);
        self.blocklists.remove(username);
        self.offline.remove(username);
        self.vcards.remove(username);
        Ok(())
    }

    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, XmppError> {
        Ok(self
            .rosters
            .get(username)
            .map(|items| items.value().clone())
            .unwrap_or_default())
    }

    async fn fetch_roster_item(
        &self,
        username: &str,
        jid: &str,
    ) -> Result<Option<RosterItem>, XmppError> {
        Ok(self
            .rosters
            .get(username)
            .and_then(|items| items.iter().find(|i| i.jid == jid).cloned()))
    }

    async fn insert_or_update_roster_item(&self, item: &RosterItem) -> Result<(), XmppError> {
        let mut items = self.rosters.entry(item.username.clone()).or_default();
        match items.iter_mut().find(|i| i.jid == item.jid) {
            Some(existing) => *existing = item.clone(),
            None => items.push(item.clone()),
        }
        Ok(())
    }

    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<(), XmppError> {
        if let Some(mut items) = self.rosters.get_mut(username) {
            items.retain(|i| i.jid != jid);
        }
        Ok(())
    }

    async fn fetch_pending_notifications(
        &self,
        username: &str,
    ) -> Result<Vec<Element>, XmppError> {
        Ok(self
            .pending_notifications
            .get(username)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn insert_pending_notification(
        &self,
        username: &str,
        presence: &Element,
    ) -> Result<(), XmppError> {
        self.pending_notifications
            .entry(username.to_string())
            .or_default()
            .push(presence.clone());
        Ok(())
    }

    async fn delete_pending_notifications(&self, username: &str) -> Result<(), XmppError> {
        self.pending_notifications.remove(username);
        Ok(())
    }

    async fn fetch_blocklist_items(&self, username: &str) -> Result<Vec<String>, XmppError> {
        Ok(self
            .blocklists
            .get(username)
            .map(|b| b.value().clone())
            .unwrap_or_default())
    }

    async fn insert_blocklist_items(
        &self,
        username: &str,
        jids: &[String],
    ) -> Result<(), XmppError> {
        let mut items = self.blocklists.entry(username.to_string()).or_default();
        for jid in jids {
            if !items.contains(jid) {
                items.push(jid.clone());
            }
        }
        Ok(())
    }

    async fn delete_blocklist_items(
        &self,
        username: &str,
        jids: &[String],
    ) -> Result<(), XmppError> {
        if jids.is_empty() {
            self.blocklists.remove(username);
        } else if let Some(mut items) = self.blocklists.get_mut(username) {
            items.retain(|i| !jids.contains(i));
        }
        Ok(())
    }

    async fn insert_offline_message(
        &self,
        username: &str,
        message: &Element,
    ) -> Result<(), XmppError> {
        self.offline
            .entry(username.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, XmppError> {
        Ok(self
            .offline
            .get(username)
            .map(|m| m.value().clone())
            .unwrap_or_default())
    }

    async fn delete_offline_messages(&self, username: &str) -> Result<(), XmppError> {
        self.offline.remove(username);
        Ok(())
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, XmppError> {
        Ok(self.offline.get(username).map(|m| m.value().len()).unwrap_or(0))
    }

    async fn fetch_vcard(&self, username: &str) -> Result<Option<Element>, XmppError> {
        Ok(self.vcards.get(username).map(|v| v.value().clone()))
    }

    async fn insert_or_update_vcard(
        &self,
        username: &str,
        vcard: &Element,
    ) -> Result<(), XmppError> {
        self.vcards.insert(username.to_string(), vcard.clone());
        Ok(())
    }

    async fn fetch_private_xml(
        &self,
        username: &str,
        namespace: &str,
    ) -> Result<Vec<Element>, XmppError> {
        Ok(self
            .private_xml
            .get(&(username.to_string(), namespace.to_string()))
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn insert_or_update_private_xml(
        &self,
        username: &str,
        namespace: &str,
        elements: &[Element],
    ) -> Result<(), XmppError> {
        self.private_xml.insert(
            (username.to_string(), namespace.to_string()),
            elements.to_vec(),
        );
        Ok(())
    }
}
