//! Status-code driven ban accounting.
//!
//! [`InterceptedResponse`] sits between a terminal handler and the real
//! response writer. Responses whose final status falls in a watched range are
//! held back entirely (head and body) until the handler returns; the ban
//! engine then decides whether the client gets the original response or a
//! `403 Forbidden`. Everything else streams straight through.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use http::{HeaderMap, StatusCode};
use tracing::{debug, warn};

use crate::codes::HttpCodeRanges;
use crate::context;
use crate::engine::BanEngine;
use crate::error::{Fail2BanError, Fail2BanResult};
use crate::response::{
    reject, write_all, Connection, Handler, Hijack, Request, ResponseWriter,
};

/// How an intercepted response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptOutcome {
    /// The status was not watched; the response was streamed as written.
    PassedThrough,
    /// The status was watched and the client was still allowed.
    Released,
    /// The status was watched and the client is banned; a 403 was sent.
    Rejected,
    /// The handler took over the connection.
    Hijacked,
}

/// Response writer wrapper for a single request.
pub struct InterceptedResponse<'a> {
    inner: &'a mut dyn ResponseWriter,
    ranges: &'a HttpCodeRanges,
    headers: HeaderMap,
    status: StatusCode,
    body: BytesMut,
    /// A final (non-1xx) head was written, explicitly or implicitly.
    decided: bool,
    /// The final status is watched; nothing past informational heads has been forwarded.
    caught: bool,
    /// A flush was requested while the response was held.
    flush_held: bool,
    hijacked: bool,
}

impl<'a> InterceptedResponse<'a> {
    /// Wrap `inner`, watching `ranges`.
    pub fn new(inner: &'a mut dyn ResponseWriter, ranges: &'a HttpCodeRanges) -> Self {
        Self {
            inner,
            ranges,
            headers: HeaderMap::new(),
            status: StatusCode::OK,
            body: BytesMut::new(),
            decided: false,
            caught: false,
            flush_held: false,
            hijacked: false,
        }
    }

    /// Status of the response so far (`200 OK` until a head is written).
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Whether the response is being held for a ban decision.
    #[must_use]
    pub const fn is_caught(&self) -> bool {
        self.caught
    }

    /// Whether the final head has been forwarded to the client.
    #[must_use]
    pub const fn headers_sent(&self) -> bool {
        self.decided && !self.caught && !self.hijacked
    }

    /// Complete the response once the handler has returned.
    ///
    /// A held response is released verbatim if `engine` still allows
    /// `client`, and replaced by `403 Forbidden` otherwise.
    pub fn finish(mut self, engine: &BanEngine, client: &str) -> InterceptOutcome {
        if self.hijacked {
            return InterceptOutcome::Hijacked;
        }
        if !self.decided {
            self.write_head(StatusCode::OK);
        }
        if !self.caught {
            return InterceptOutcome::PassedThrough;
        }

        if !engine.should_allow(client) {
            debug!(ip = %client, status = %self.status, "Withholding response from banned client");
            self.drop_forwarded_headers();
            reject(self.inner);
            return InterceptOutcome::Rejected;
        }

        self.forward_headers();
        self.inner.write_head(self.status);
        if let Err(e) = write_all(self.inner, &self.body) {
            warn!(ip = %client, error = %e, "Failed to release held response body");
        } else if self.flush_held {
            if let Err(e) = self.inner.flush() {
                warn!(ip = %client, error = %e, "Failed to flush released response");
            }
        }
        InterceptOutcome::Released
    }

    fn forward_headers(&mut self) {
        self.inner.headers_mut().extend(self.headers.clone());
    }

    /// Headers copied out for informational heads must not reach a rejection.
    fn drop_forwarded_headers(&mut self) {
        let pending = self.inner.headers_mut();
        for name in self.headers.keys() {
            pending.remove(name);
        }
    }
}

impl ResponseWriter for InterceptedResponse<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, status: StatusCode) {
        if self.hijacked {
            return;
        }
        if self.decided {
            debug!(status = %status, current = %self.status, "Ignoring superfluous response head");
            return;
        }
        if status.is_informational() {
            self.forward_headers();
            self.inner.write_head(status);
            return;
        }

        self.decided = true;
        self.status = status;
        if self.ranges.contains(status) {
            debug!(status = %status, "Holding response for ban decision");
            self.caught = true;
        } else {
            self.forward_headers();
            self.inner.write_head(status);
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.hijacked {
            return Err(io::Error::other("connection hijacked"));
        }
        if !self.decided {
            self.write_head(StatusCode::OK);
        }
        if self.caught {
            self.body.extend_from_slice(buf);
            Ok(buf.len())
        } else {
            self.inner.write(buf)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.hijacked {
            return Err(io::Error::other("connection hijacked"));
        }
        if !self.decided {
            self.write_head(StatusCode::OK);
        }
        if self.caught {
            self.flush_held = true;
            return Ok(());
        }
        self.inner.flush()
    }

    fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
        Some(self)
    }
}

impl Hijack for InterceptedResponse<'_> {
    fn hijack(&mut self) -> Fail2BanResult<Box<dyn Connection>> {
        if self.caught {
            return Err(Fail2BanError::HijackWhileCaught);
        }
        let connection = self
            .inner
            .hijacker()
            .ok_or(Fail2BanError::HijackUnsupported)?
            .hijack()?;
        self.hijacked = true;
        Ok(connection)
    }
}

/// Terminal-stage wrapper that bans clients based on response status codes.
pub struct StatusCodeHandler {
    next: Arc<dyn Handler>,
    engine: Arc<BanEngine>,
    ranges: HttpCodeRanges,
}

impl StatusCodeHandler {
    /// Wrap `next`, feeding responses with a status in `ranges` to `engine`.
    #[must_use]
    pub fn new(next: Arc<dyn Handler>, engine: Arc<BanEngine>, ranges: HttpCodeRanges) -> Self {
        Self {
            next,
            engine,
            ranges,
        }
    }
}

impl Handler for StatusCodeHandler {
    fn serve(&self, w: &mut dyn ResponseWriter, req: &Request) {
        let Some(client) = context::client_addr(req) else {
            warn!(uri = %req.uri(), "No client address, serving without status code accounting");
            self.next.serve(w, req);
            return;
        };

        let mut intercepted = InterceptedResponse::new(w, &self.ranges);
        self.next.serve(&mut intercepted, req);
        let outcome = intercepted.finish(&self.engine, client);
        debug!(ip = %client, outcome = ?outcome, "Status code accounting done");
    }
}

impl std::fmt::Debug for StatusCodeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusCodeHandler")
            .field("engine", &self.engine)
            .field("ranges", &self.ranges)
            .finish_non_exhaustive()
    }
}
