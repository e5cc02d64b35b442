//! Built-in chain links: static allow/deny lists and the ban check.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::address::IpSet;
use crate::chain::{ChainHandler, ChainStatus};
use crate::engine::BanEngine;
use crate::error::Fail2BanResult;
use crate::response::Request;

/// Addresses and URL patterns matched by a static list.
#[derive(Debug, Clone, Default)]
struct StaticList {
    ips: IpSet,
    urls: Vec<Regex>,
}

impl StaticList {
    fn matches(&self, client: &str, req: &Request) -> Option<String> {
        if self.ips.contains(client) {
            return Some(format!("ip {client}"));
        }
        if self.urls.is_empty() {
            return None;
        }
        let target = req.uri().to_string();
        self.urls
            .iter()
            .find(|re| re.is_match(&target))
            .map(|re| format!("url pattern {}", re.as_str()))
    }
}

/// Lets matching requests through without consulting later links.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    list: StaticList,
}

impl AllowList {
    /// Create an allow list.
    #[must_use]
    pub const fn new(ips: IpSet, urls: Vec<Regex>) -> Self {
        Self {
            list: StaticList { ips, urls },
        }
    }
}

impl ChainHandler for AllowList {
    fn name(&self) -> &str {
        "allowlist"
    }

    fn check(&self, client: &str, req: &Request) -> Fail2BanResult<ChainStatus> {
        Ok(match self.list.matches(client, req) {
            Some(reason) => {
                debug!(ip = %client, matched = %reason, "Allow list match");
                ChainStatus::ShortCircuitAllow
            }
            None => ChainStatus::Continue,
        })
    }
}

/// Rejects matching requests.
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    list: StaticList,
}

impl DenyList {
    /// Create a deny list.
    #[must_use]
    pub const fn new(ips: IpSet, urls: Vec<Regex>) -> Self {
        Self {
            list: StaticList { ips, urls },
        }
    }
}

impl ChainHandler for DenyList {
    fn name(&self) -> &str {
        "denylist"
    }

    fn check(&self, client: &str, req: &Request) -> Fail2BanResult<ChainStatus> {
        Ok(match self.list.matches(client, req) {
            Some(reason) => {
                debug!(ip = %client, matched = %reason, "Deny list match");
                ChainStatus::ShortCircuitDeny
            }
            None => ChainStatus::Continue,
        })
    }
}

/// Counts every request against the ban engine.
#[derive(Debug, Clone)]
pub struct BanCheck {
    engine: Arc<BanEngine>,
}

impl BanCheck {
    /// Create a ban check backed by `engine`.
    #[must_use]
    pub const fn new(engine: Arc<BanEngine>) -> Self {
        Self { engine }
    }
}

impl ChainHandler for BanCheck {
    fn name(&self) -> &str {
        "fail2ban"
    }

    fn check(&self, client: &str, _req: &Request) -> Fail2BanResult<ChainStatus> {
        if self.engine.should_allow(client) {
            Ok(ChainStatus::Continue)
        } else {
            Ok(ChainStatus::ShortCircuitDeny)
        }
    }
}
