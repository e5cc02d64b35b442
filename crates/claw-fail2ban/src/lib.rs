//! # claw-fail2ban
//!
//! Adaptive, in-process request banning for Clawbernetes HTTP services.
//!
//! Requests pass through an ordered decision chain before they reach the
//! protected handler:
//!
//! - [`DenyList`] rejects listed addresses and URL patterns
//! - [`AllowList`] serves listed addresses and URL patterns without further checks
//! - [`BanCheck`] counts every request against the [`BanEngine`]
//!
//! When status code ranges are configured, [`StatusCodeHandler`] replaces the
//! ban check: only responses in those ranges count, and they are held back
//! until the engine has decided whether the client still gets them.
//!
//! ## Ban state machine
//!
//! [`BanEngine`] tracks one [`IpState`] per client address. `max_retry`
//! requests inside `find_time` ban the address for `ban_time`. Neither
//! window slides with later requests.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use claw_fail2ban::{
//!     handler_fn, write_all, BufferedResponse, Fail2Ban, Fail2BanConfig, PeerAddr, Request,
//!     ResponseWriter,
//! };
//!
//! let config = Fail2BanConfig::builder().max_retry(2).build();
//! let app = handler_fn(|w: &mut dyn ResponseWriter, _req: &Request| {
//!     let _ = write_all(w, b"hello");
//! });
//! let f2b = Fail2Ban::from_config(&config, Arc::new(app)).unwrap();
//!
//! let mut req = http::Request::new(Bytes::new());
//! req.extensions_mut().insert(PeerAddr("192.0.2.1:40000".parse().unwrap()));
//!
//! let mut w = BufferedResponse::new();
//! f2b.serve(&mut w, req);
//! assert_eq!(w.body(), b"hello");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod chain;
pub mod clock;
pub mod codes;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod interceptor;
pub mod pipeline;
pub mod response;

// Re-export main types
pub use address::{IpEntry, IpSet};
pub use chain::{Chain, ChainHandler, ChainStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codes::{HttpCodeRange, HttpCodeRanges};
pub use config::{
    parse_duration, Fail2BanConfig, Fail2BanConfigBuilder, IpListConfig, Rules, RulesConfig,
    UrlMode, UrlRegexp,
};
pub use context::{attach, client_addr, ClientAddr, PeerAddr};
pub use engine::{BanConfig, BanEngine, IpState};
pub use error::{Fail2BanError, Fail2BanResult};
pub use handlers::{AllowList, BanCheck, DenyList};
pub use interceptor::{InterceptOutcome, InterceptedResponse, StatusCodeHandler};
pub use pipeline::Fail2Ban;
pub use response::{
    handler_fn, reject, write_all, BufferedResponse, Connection, Handler, HandlerFn, Hijack,
    Request, ResponseWriter,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::address::IpSet;
    pub use crate::chain::{Chain, ChainHandler, ChainStatus};
    pub use crate::config::{Fail2BanConfig, Rules};
    pub use crate::engine::{BanConfig, BanEngine};
    pub use crate::error::{Fail2BanError, Fail2BanResult};
    pub use crate::pipeline::Fail2Ban;
    pub use crate::response::{Handler, Request, ResponseWriter};
}
