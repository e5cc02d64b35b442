//! Assembled request banning pipeline.

use std::sync::Arc;

use tracing::info;

use crate::chain::{Chain, ChainHandler};
use crate::clock::{Clock, SystemClock};
use crate::config::{Fail2BanConfig, Rules};
use crate::engine::BanEngine;
use crate::error::Fail2BanResult;
use crate::handlers::{AllowList, BanCheck, DenyList};
use crate::interceptor::StatusCodeHandler;
use crate::response::{Handler, Request, ResponseWriter};

/// Deny list, allow list and ban accounting in front of a handler.
///
/// Without status codes every request counts towards a ban and is checked
/// before `next` runs. With status codes only responses in those ranges count,
/// and they are held back until the engine has decided.
#[derive(Debug)]
pub struct Fail2Ban {
    /// Shared ban state.
    engine: Arc<BanEngine>,
    /// Decision chain ending in the protected handler.
    chain: Chain,
}

impl Fail2Ban {
    /// Build a pipeline driven by the system clock.
    #[must_use]
    pub fn new(rules: Rules, next: Arc<dyn Handler>) -> Self {
        Self::with_clock(rules, next, Arc::new(SystemClock))
    }

    /// Build a pipeline driven by `clock`.
    #[must_use]
    pub fn with_clock(rules: Rules, next: Arc<dyn Handler>, clock: Arc<dyn Clock>) -> Self {
        let engine = Arc::new(BanEngine::with_clock(rules.ban, clock));

        let mut handlers: Vec<Box<dyn ChainHandler>> = vec![
            Box::new(DenyList::new(rules.ip_deny, rules.url_deny)),
            Box::new(AllowList::new(rules.ip_allow, rules.url_allow)),
        ];

        let watch_codes = rules.enabled && !rules.status_codes.is_empty();
        if rules.enabled && !watch_codes {
            handlers.push(Box::new(BanCheck::new(Arc::clone(&engine))));
        }

        let mut chain = Chain::new(Arc::clone(&next), handlers)
            .with_remote_ip_header(rules.remote_ip_header);
        if watch_codes {
            let status = StatusCodeHandler::new(next, Arc::clone(&engine), rules.status_codes);
            chain = chain.with_status_handler(Arc::new(status));
        }

        info!(
            enabled = rules.enabled,
            status_code_mode = watch_codes,
            links = chain.len(),
            "Fail2ban pipeline ready"
        );

        Self { engine, chain }
    }

    /// Compile `config` and build a pipeline driven by the system clock.
    ///
    /// # Errors
    ///
    /// Returns any error found while compiling the configuration.
    pub fn from_config(config: &Fail2BanConfig, next: Arc<dyn Handler>) -> Fail2BanResult<Self> {
        Ok(Self::new(config.compile()?, next))
    }

    /// Handle one request.
    pub fn serve(&self, w: &mut dyn ResponseWriter, req: Request) {
        self.chain.serve(w, req);
    }

    /// The shared ban engine, for reporting collaborators.
    #[must_use]
    pub const fn engine(&self) -> &Arc<BanEngine> {
        &self.engine
    }
}

impl Handler for Fail2Ban {
    fn serve(&self, w: &mut dyn ResponseWriter, req: &Request) {
        Handler::serve(&self.chain, w, req);
    }
}
