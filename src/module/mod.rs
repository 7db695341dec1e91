//! Feature modules and IQ dispatch glue.
//!
//! Each module is an [`IqHandler`] matched by payload name + namespace.
//! Handlers are registered in a fixed order at session start (service
//! discovery first, so later modules can register their disco features
//! into it) and the dispatcher walks them linearly, first match wins.
//!
//! Handlers return the elements to write back on the current stream;
//! side effects on other streams go through the router.

mod blocking;
mod disco;
mod last_activity;
mod offline;
mod ping;
mod private;
mod register;
mod roster;
mod vcard;
mod version;

pub use blocking::Blocking;
pub use disco::Disco;
pub use last_activity::LastActivity;
pub use offline::Offline;
pub use ping::Ping;
pub use private::Private;
pub use register::Register;
pub use roster::Roster;
pub use vcard::Vcard;
pub use version::Version;

use std::sync::Arc;

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;

use crate::config::ModulesConfig;
use crate::error::XmppError;
use crate::parser::ns;
use crate::router::Router;
use crate::stanza::Iq;
use crate::storage::Storage;

/// Per-dispatch context handed to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub stream_id: String,
    pub username: String,
    pub domain: String,
    /// The stream's bound full JID
    pub jid: Jid,
    pub router: Arc<Router>,
    pub storage: Arc<dyn Storage>,
}

/// One feature module's IQ surface.
#[async_trait]
pub trait IqHandler: Send + Sync {
    /// Whether this handler services the IQ.
    fn matches(&self, iq: &Iq) -> bool;

    /// Service the IQ, returning the elements to write to the client.
    async fn process(&self, iq: &Iq, ctx: &HandlerContext) -> Result<Vec<Element>, XmppError>;
}

/// The modules wired up for one established session.
pub struct ModuleSet {
    /// IQ handlers in registration order
    pub handlers: Vec<Arc<dyn IqHandler>>,
    pub roster: Arc<Roster>,
    pub offline: Option<Arc<Offline>>,
    pub ping: Option<Arc<Ping>>,
}

impl ModuleSet {
    /// Build the module set per configuration. The registration module is
    /// created at stream construction (it is reachable before
    /// authentication) and joins the handler list here.
    pub fn new(cfg: &ModulesConfig, register: Option<Arc<Register>>) -> Self {
        let disco = Arc::new(Disco::new());
        let roster = Arc::new(Roster::new(cfg.roster.clone()));

        let mut handlers: Vec<Arc<dyn IqHandler>> = Vec::new();
        handlers.push(disco.clone());
        disco.register_feature(ns::DISCO_INFO);
        disco.register_feature(ns::DISCO_ITEMS);

        handlers.push(roster.clone());
        disco.register_feature(ns::ROSTER);

        if cfg.is_enabled("last_activity") {
            handlers.push(Arc::new(LastActivity::new()));
            disco.register_feature(ns::LAST_ACTIVITY);
        }
        if cfg.is_enabled("private") {
            handlers.push(Arc::new(Private::new()));
            disco.register_feature(ns::PRIVATE);
        }
        if cfg.is_enabled("vcard") {
            handlers.push(Arc::new(Vcard::new()));
            disco.register_feature(ns::VCARD);
        }
        if let Some(register) = register {
            handlers.push(register);
            disco.register_feature(ns::REGISTER);
        }
        if cfg.is_enabled("version") {
            handlers.push(Arc::new(Version::new(cfg.version.clone())));
            disco.register_feature(ns::VERSION);
        }
        if cfg.is_enabled("blocking_command") {
            handlers.push(Arc::new(Blocking::new()));
            disco.register_feature(ns::BLOCKING);
        }

        let ping = if cfg.is_enabled("ping") {
            let ping = Arc::new(Ping::new(cfg.ping.clone()));
            handlers.push(ping.clone());
            disco.register_feature(ns::PING);
            Some(ping)
        } else {
            None
        };

        let offline = if cfg.is_enabled("offline") {
            disco.register_feature("msgoffline");
            Some(Arc::new(Offline::new(cfg.offline.clone())))
        } else {
            None
        };

        Self {
            handlers,
            roster,
            offline,
            ping,
        }
    }
}
