//! XEP-0199: XMPP Ping.
//!
//! Answers client pings and, when probing is enabled, watches a deadline
//! the stream resets on every inbound element. An idle client gets one
//! server ping; a client that stays silent past a second interval is
//! disconnected with `connection-timeout`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::PingConfig;
use crate::error::{StreamErrorKind, XmppError};
use crate::module::{HandlerContext, IqHandler};
use crate::parser::ns;
use crate::stanza::Iq;
use crate::stream::StreamHandle;

pub struct Ping {
    cfg: PingConfig,
    last_activity: Mutex<Instant>,
    awaiting_pong: AtomicBool,
}

impl Ping {
    pub fn new(cfg: PingConfig) -> Self {
        Self {
            cfg,
            last_activity: Mutex::new(Instant::now()),
            awaiting_pong: AtomicBool::new(false),
        }
    }

    /// Reset the idle deadline; called for every inbound element once the
    /// session is established.
    pub fn reset_deadline(&self) {
        *self.last_activity.lock().expect("ping lock poisoned") = Instant::now();
        self.awaiting_pong.store(false, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("ping lock poisoned")
            .elapsed()
    }

    /// Start probing the client. The task ends when the stream's mailbox
    /// closes or the deadline expires twice.
    pub fn start_pinging(self: &Arc<Self>, handle: StreamHandle, domain: String, jid: Jid) {
        if !self.cfg.send || self.cfg.send_interval == 0 {
            return;
        }
        let ping = Arc::clone(self);
        let interval = Duration::from_secs(self.cfg.send_interval);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if ping.idle_for() < interval {
                    continue;
                }
                if ping.awaiting_pong.swap(true, Ordering::Relaxed) {
                    debug!(jid = %jid, "Ping deadline expired, disconnecting");
                    handle
                        .disconnect(Some(StreamErrorKind::ConnectionTimeout))
                        .await;
                    return;
                }
                let probe = Element::builder("iq", ns::JABBER_CLIENT)
                    .attr("type", "get")
                    .attr("id", format!("ping-{}", Uuid::new_v4()))
                    .attr("from", domain.clone())
                    .attr("to", jid.to_string())
                    .append(Element::builder("ping", ns::PING).build())
                    .build();
                if !handle.send_element(probe).await {
                    return; // stream gone
                }
            }
        });
    }
}

#[async_trait]
impl IqHandler for Ping {
    fn matches(&self, iq: &Iq) -> bool {
        iq.is_get() && iq.matches_payload("ping", ns::PING)
    }

    async fn process(&self, iq: &Iq, _ctx: &HandlerContext) -> Result<Vec<Element>, XmppError> {
        Ok(vec![iq.result()])
    }
}
