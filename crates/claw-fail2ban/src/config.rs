//! Rule configuration and its compilation into runtime values.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::address::IpSet;
use crate::codes::HttpCodeRanges;
use crate::engine::BanConfig;
use crate::error::{Fail2BanError, Fail2BanResult};

/// What a URL pattern does when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlMode {
    /// Serve the request without further checks.
    Allow,
    /// Reject the request.
    Block,
}

/// A URL pattern with its action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRegexp {
    /// Regular expression matched against the request URI.
    pub regexp: String,
    /// Action on match.
    pub mode: UrlMode,
}

/// Ban thresholds and triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Whether ban accounting is active. Static lists apply either way.
    pub enabled: bool,
    /// How long a ban lasts (e.g. `"3h"`).
    #[serde(alias = "bantime")]
    pub ban_time: String,
    /// Detection window (e.g. `"10m"`).
    #[serde(alias = "findtime")]
    pub find_time: String,
    /// Requests inside the window that trigger a ban.
    #[serde(alias = "maxretry")]
    pub max_retry: u32,
    /// Status codes (`"400-499"`, `"404"`) that count towards a ban. When
    /// empty, every request counts.
    #[serde(alias = "statuscode")]
    pub status_codes: Vec<String>,
    /// URL patterns.
    #[serde(alias = "urlregexps")]
    pub url_regexps: Vec<UrlRegexp>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ban_time: "3h".into(),
            find_time: "10m".into(),
            max_retry: 4,
            status_codes: Vec::new(),
            url_regexps: Vec::new(),
        }
    }
}

/// A list of addresses and networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpListConfig {
    /// Addresses or CIDRs.
    pub ip: Vec<String>,
}

/// Complete rule document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fail2BanConfig {
    /// Ban rules.
    pub rules: RulesConfig,
    /// Addresses that are always served.
    pub allowlist: IpListConfig,
    /// Addresses that are always rejected.
    pub denylist: IpListConfig,
    /// Header carrying the client address (empty = use the peer address).
    #[serde(alias = "remoteipheader")]
    pub remote_ip_header: String,
}

impl Fail2BanConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> Fail2BanConfigBuilder {
        Fail2BanConfigBuilder::default()
    }

    /// Parse a JSON rule document.
    ///
    /// # Errors
    ///
    /// Returns `Fail2BanError::Config` if the document is malformed.
    pub fn from_json(json: &str) -> Fail2BanResult<Self> {
        serde_json::from_str(json).map_err(|e| Fail2BanError::Config(e.to_string()))
    }

    /// Validate the document and build runtime values.
    ///
    /// # Errors
    ///
    /// Returns the first invalid duration, status code range, URL pattern or
    /// address.
    pub fn compile(&self) -> Fail2BanResult<Rules> {
        if self.rules.max_retry == 0 {
            return Err(Fail2BanError::Config("max_retry must be at least 1".into()));
        }

        let ban = BanConfig {
            max_retry: self.rules.max_retry,
            find_time: parse_duration(&self.rules.find_time)?,
            ban_time: parse_duration(&self.rules.ban_time)?,
        };
        let status_codes = HttpCodeRanges::parse(&self.rules.status_codes)?;

        let mut url_allow = Vec::new();
        let mut url_deny = Vec::new();
        for entry in &self.rules.url_regexps {
            let re = Regex::new(&entry.regexp).map_err(|source| Fail2BanError::InvalidPattern {
                pattern: entry.regexp.clone(),
                source,
            })?;
            match entry.mode {
                UrlMode::Allow => url_allow.push(re),
                UrlMode::Block => url_deny.push(re),
            }
        }

        let rules = Rules {
            enabled: self.rules.enabled,
            ban,
            status_codes,
            url_allow,
            url_deny,
            ip_allow: IpSet::parse(&self.allowlist.ip)?,
            ip_deny: IpSet::parse(&self.denylist.ip)?,
            remote_ip_header: self.remote_ip_header.clone(),
        };

        info!(
            enabled = rules.enabled,
            max_retry = rules.ban.max_retry,
            find_time_secs = rules.ban.find_time.as_secs(),
            ban_time_secs = rules.ban.ban_time.as_secs(),
            status_ranges = rules.status_codes.ranges().len(),
            allow_ips = rules.ip_allow.len(),
            deny_ips = rules.ip_deny.len(),
            "Compiled fail2ban rules"
        );

        Ok(rules)
    }
}

/// Validated runtime values consumed by [`crate::Fail2Ban`].
#[derive(Debug, Clone)]
pub struct Rules {
    /// Whether ban accounting is active.
    pub enabled: bool,
    /// Engine thresholds.
    pub ban: BanConfig,
    /// Status codes that count towards a ban; empty means every request counts.
    pub status_codes: HttpCodeRanges,
    /// URL patterns that are always served.
    pub url_allow: Vec<Regex>,
    /// URL patterns that are always rejected.
    pub url_deny: Vec<Regex>,
    /// Addresses that are always served.
    pub ip_allow: IpSet,
    /// Addresses that are always rejected.
    pub ip_deny: IpSet,
    /// Header carrying the client address.
    pub remote_ip_header: String,
}

impl Rules {
    /// Rules with the given thresholds and no lists.
    #[must_use]
    pub fn new(ban: BanConfig) -> Self {
        Self {
            enabled: true,
            ban,
            status_codes: HttpCodeRanges::default(),
            url_allow: Vec::new(),
            url_deny: Vec::new(),
            ip_allow: IpSet::new(),
            ip_deny: IpSet::new(),
            remote_ip_header: String::new(),
        }
    }
}

/// Builder for `Fail2BanConfig`.
#[derive(Debug, Clone, Default)]
pub struct Fail2BanConfigBuilder {
    config: Fail2BanConfig,
}

impl Fail2BanConfigBuilder {
    /// Enable or disable ban accounting.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.rules.enabled = enabled;
        self
    }

    /// Set the ban duration.
    #[must_use]
    pub fn ban_time(mut self, ban_time: impl Into<String>) -> Self {
        self.config.rules.ban_time = ban_time.into();
        self
    }

    /// Set the detection window.
    #[must_use]
    pub fn find_time(mut self, find_time: impl Into<String>) -> Self {
        self.config.rules.find_time = find_time.into();
        self
    }

    /// Set the ban threshold.
    #[must_use]
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.config.rules.max_retry = max_retry;
        self
    }

    /// Add a status code range.
    #[must_use]
    pub fn status_code(mut self, range: impl Into<String>) -> Self {
        self.config.rules.status_codes.push(range.into());
        self
    }

    /// Add a URL pattern that is always served.
    #[must_use]
    pub fn allow_url(mut self, regexp: impl Into<String>) -> Self {
        self.config.rules.url_regexps.push(UrlRegexp {
            regexp: regexp.into(),
            mode: UrlMode::Allow,
        });
        self
    }

    /// Add a URL pattern that is always rejected.
    #[must_use]
    pub fn block_url(mut self, regexp: impl Into<String>) -> Self {
        self.config.rules.url_regexps.push(UrlRegexp {
            regexp: regexp.into(),
            mode: UrlMode::Block,
        });
        self
    }

    /// Add an address or network to the allow list.
    #[must_use]
    pub fn allow_ip(mut self, ip: impl Into<String>) -> Self {
        self.config.allowlist.ip.push(ip.into());
        self
    }

    /// Add an address or network to the deny list.
    #[must_use]
    pub fn deny_ip(mut self, ip: impl Into<String>) -> Self {
        self.config.denylist.ip.push(ip.into());
        self
    }

    /// Read the client address from `header`.
    #[must_use]
    pub fn remote_ip_header(mut self, header: impl Into<String>) -> Self {
        self.config.remote_ip_header = header.into();
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> Fail2BanConfig {
        self.config
    }
}

/// Parse durations like `"500ms"`, `"30s"`, `"10m"`, `"3h"`, `"1d"` or
/// combinations such as `"1h30m"`. A bare `"0"` is zero.
///
/// # Errors
///
/// Returns `Fail2BanError::InvalidDuration` on malformed input or overflow.
pub fn parse_duration(text: &str) -> Fail2BanResult<Duration> {
    let invalid = || Fail2BanError::InvalidDuration(text.to_string());
    let s = text.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u32 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(1),
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            "d" => Duration::from_secs(86400),
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        let part = unit.checked_mul(value).ok_or_else(invalid)?;
        total = total.checked_add(part).ok_or_else(invalid)?;
    }
    Ok(total)
}
