//! XEP-0092: Software Version.

use async_trait::async_trait;
use minidom::Element;

use crate::config::VersionConfig;
use crate::error::XmppError;
use crate::module::{HandlerContext, IqHandler};
use crate::parser::ns;
use crate::stanza::Iq;

pub struct Version {
    cfg: VersionConfig,
}

impl Version {
    pub fn new(cfg: VersionConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl IqHandler for Version {
    fn matches(&self, iq: &Iq) -> bool {
        iq.is_get() && iq.matches_payload("query", ns::VERSION)
    }

    async fn process(&self, iq: &Iq, _ctx: &HandlerContext) -> Result<Vec<Element>, XmppError> {
        let mut query = Element::builder("query", ns::VERSION)
            .append(
                Element::builder("name", ns::VERSION)
                    .append(env!("CARGO_PKG_NAME").to_string())
                    .build(),
            )
            .append(
                Element::builder("version", ns::VERSION)
                    .append(env!("CARGO_PKG_VERSION").to_string())
                    .build(),
            )
            .build();
        if self.cfg.show_os {
            query.append_child(
                Element::builder("os", ns::VERSION)
                    .append(std::env::consts::OS.to_string())
                    .build(),
            );
        }
        Ok(vec![iq.result_with_payload(query)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::tests_support::{context, iq_get};

    #[tokio::test]
    async fn test_version_reply() {
        let version = Version::new(VersionConfig::default());
        let iq = iq_get("v1", "<query xmlns='jabber:iq:version'/>");
        assert!(version.matches(&iq));

        let replies = version.process(&iq, &context().await).await.unwrap();
        let query = replies[0].get_child("query", ns::VERSION).unwrap();
        assert!(query.get_child("name", ns::VERSION).is_some());
        assert!(query.get_child("version", ns::VERSION).is_some());
        assert!(query.get_child("os", ns::VERSION).is_none());
    }

    #[tokio::test]
    async fn test_version_with_os() {
        let version = Version::new(VersionConfig { show_os: true });
        let iq = iq_get("v2", "<query xmlns='jabber:iq:version'/>");
        let replies = version.process(&iq, &context().await).await.unwrap();
        let query = replies[0].get_child("query", ns::VERSION).unwrap();
        assert!(query.get_child("os", ns::VERSION).is_some());
    }
}
