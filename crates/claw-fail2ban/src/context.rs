//! Per-request client address resolution.
//!
//! The transport stores the peer socket address as a [`PeerAddr`] request
//! extension. [`attach`] turns it (or a configured header) into the effective
//! client address, stored as a [`ClientAddr`] extension for the rest of the
//! request.

use std::net::{IpAddr, SocketAddr};

use http::header::HeaderName;
use tracing::debug;

use crate::error::{Fail2BanError, Fail2BanResult};
use crate::response::Request;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Transport-level address of the connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Effective client address of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr(pub String);

/// Resolve and store the effective client address of `req`.
///
/// Starts from the peer address with the port stripped. When `header` is
/// non-empty and present on the request with a non-empty value, that value
/// wins; for `X-Forwarded-For` only the first comma separated entry is used.
/// IPv4-mapped IPv6 addresses are stored in their IPv4 form.
///
/// # Errors
///
/// Returns `Fail2BanError::MissingPeerAddr` if the transport did not record
/// the peer address.
pub fn attach(req: &mut Request, header: &str) -> Fail2BanResult<()> {
    let peer = req
        .extensions()
        .get::<PeerAddr>()
        .ok_or(Fail2BanError::MissingPeerAddr)?;
    let mut addr = peer.0.ip().to_canonical().to_string();

    if let Some(value) = header_value(req, header) {
        addr = value;
    }

    debug!(ip = %addr, "Resolved client address");
    req.extensions_mut().insert(ClientAddr(addr));
    Ok(())
}

/// The client address stored by [`attach`], if any.
#[must_use]
pub fn client_addr(req: &Request) -> Option<&str> {
    req.extensions().get::<ClientAddr>().map(|c| c.0.as_str())
}

fn header_value(req: &Request, header: &str) -> Option<String> {
    if header.is_empty() {
        return None;
    }
    let name = HeaderName::from_bytes(header.as_bytes()).ok()?;
    let raw = req.headers().get(&name)?;
    let Ok(value) = raw.to_str() else {
        debug!(header = %name, "Ignoring non-text client address header");
        return None;
    };

    let value = if name == X_FORWARDED_FOR {
        value.split(',').next().unwrap_or_default().trim()
    } else {
        value
    };
    if value.is_empty() {
        debug!(header = %name, "Empty client address header, using peer address");
        return None;
    }

    Some(match value.parse::<IpAddr>() {
        Ok(ip) => ip.to_canonical().to_string(),
        Err(_) => value.to_string(),
    })
}
