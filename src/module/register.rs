//! XEP-0077: In-Band Registration.
//!
//! Reachable before authentication (over a secured stream only, the
//! stream enforces that) to create accounts, and in-session to cancel a
//! registration when cancellation is allowed.

use async_trait::async_trait;
use minidom::Element;
use tracing::info;

use crate::config::RegistrationConfig;
use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::module::{HandlerContext, IqHandler};
use crate::parser::ns;
use crate::stanza::Iq;
use crate::storage::User;

pub struct Register {
    cfg: RegistrationConfig,
}

impl Register {
    pub fn new(cfg: RegistrationConfig) -> Self {
        Self { cfg }
    }

    async fn process_form(&self, iq: &Iq, ctx: &HandlerContext) -> Result<Vec<Element>, XmppError> {
        let query = Element::builder("query", ns::REGISTER)
            .append(Element::builder("username", ns::REGISTER).build())
            .append(Element::builder("password", ns::REGISTER).build())
            .build();
        let _ = ctx;
        Ok(vec![iq.result_with_payload(query)])
    }

    async fn process_submit(
        &self,
        iq: &Iq,
        ctx: &HandlerContext,
    ) -> Result<Vec<Element>, XmppError> {
        let Some(query) = iq.payload_named("query", ns::REGISTER) else {
            return Ok(vec![iq.error_reply(
                StanzaErrorType::Modify,
                StanzaErrorCondition::BadRequest,
            )]);
        };

        // <remove/> cancels an existing registration (in-session only)
        if query.get_child("remove", ns::REGISTER).is_some() {
            if !self.cfg.allow_cancellation || ctx.username.is_empty() {
                return Ok(vec![iq.error_reply(
                    StanzaErrorType::Cancel,
                    StanzaErrorCondition::NotAllowed,
                )]);
            }
            ctx.storage.delete_user(&ctx.username).await?;
            info!(user = %ctx.username, "Registration cancelled");
            return Ok(vec![iq.result()]);
        }

        if !self.cfg.allow_registration {
            return Ok(vec![iq.error_reply(
                StanzaErrorType::Cancel,
                StanzaErrorCondition::NotAllowed,
            )]);
        }

        let username = query
            .get_child("username", ns::REGISTER)
            .map(|u| u.text())
            .unwrap_or_default();
        let password = query
            .get_child("password", ns::REGISTER)
            .map(|p| p.text())
            .unwrap_or_default();
        if username.is_empty() || password.is_empty() {
            return Ok(vec![iq.error_reply(
                StanzaErrorType::Modify,
                StanzaErrorCondition::BadRequest,
            )]);
        }

        if ctx.storage.user_exists(&username).await? {
            return Ok(vec![iq.error_reply(
                StanzaErrorType::Cancel,
                StanzaErrorCondition::Conflict,
            )]);
        }

        ctx.storage
            .insert_or_update_user(&User::new(username.clone(), password))
            .await?;
        info!(user = %username, "Registered new account");
        Ok(vec![iq.result()])
    }
}

#[async_trait]
impl IqHandler for Register {
    fn matches(&self, iq: &Iq) -> bool {
        (iq.is_get() || iq.is_set()) && iq.matches_payload("query", ns::REGISTER)
    }

    async fn process(&self, iq: &Iq, ctx: &HandlerContext) -> Result<Vec<Element>, XmppError> {
        if iq.is_get() {
            self.process_form(iq, ctx).await
        } else {
            self.process_submit(iq, ctx).await
        }
    }
}
