//! Response writing contract shared by the chain, the interceptor and hosts.
//!
//! Handlers stream a response through a [`ResponseWriter`]: optional
//! informational (1xx) heads, one final head, then body bytes. Taking over the
//! raw connection is an optional capability discovered at runtime through
//! [`ResponseWriter::hijacker`].

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tracing::debug;

use crate::error::{Fail2BanError, Fail2BanResult};

/// Requests as seen by the pipeline. Bodies are carried but never inspected.
pub type Request = http::Request<Bytes>;

/// A raw, bidirectional client connection.
pub trait Connection: io::Read + io::Write + Send {}

impl<T: io::Read + io::Write + Send> Connection for T {}

/// Capability to take over the underlying connection.
pub trait Hijack {
    /// Detach the raw connection from the HTTP response.
    ///
    /// # Errors
    ///
    /// Fails when the connection cannot (or can no longer) be taken over.
    fn hijack(&mut self) -> Fail2BanResult<Box<dyn Connection>>;
}

/// The outbound half of one HTTP exchange.
pub trait ResponseWriter {
    /// Headers that will be sent with the next head.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Send a response head. Informational codes may be sent repeatedly
    /// before the final one; later final heads are ignored.
    fn write_head(&mut self, status: StatusCode);

    /// Write body bytes, sending an implicit `200 OK` head first if needed.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Push buffered bytes towards the client.
    fn flush(&mut self) -> io::Result<()>;

    /// Connection takeover, if the transport supports it.
    fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
        None
    }
}

/// Writes the whole buffer, retrying short writes.
///
/// # Errors
///
/// Propagates the writer's I/O error.
pub fn write_all(w: &mut dyn ResponseWriter, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match w.write(buf)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}

/// Reply with `403 Forbidden`.
pub fn reject(w: &mut dyn ResponseWriter) {
    w.write_head(StatusCode::FORBIDDEN);
    if let Err(e) = w.flush() {
        debug!(error = %e, "Failed to flush rejection");
    }
}

/// A terminal HTTP handler.
pub trait Handler: Send + Sync {
    /// Produce the response for `req`.
    fn serve(&self, w: &mut dyn ResponseWriter, req: &Request);
}

/// Adapter turning a closure into a [`Handler`].
pub struct HandlerFn<F>(F);

/// Wrap a closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut dyn ResponseWriter, &Request) + Send + Sync,
{
    HandlerFn(f)
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(&mut dyn ResponseWriter, &Request) + Send + Sync,
{
    fn serve(&self, w: &mut dyn ResponseWriter, req: &Request) {
        (self.0)(w, req);
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFn")
    }
}

/// In-memory [`ResponseWriter`] that records everything written to it.
///
/// Hosts that build responses as values convert it with
/// [`BufferedResponse::into_response`].
#[derive(Default)]
pub struct BufferedResponse {
    pending: HeaderMap,
    sent: HeaderMap,
    status: Option<StatusCode>,
    informational: Vec<(StatusCode, HeaderMap)>,
    body: BytesMut,
    flushes: usize,
    connection: Option<Box<dyn Connection>>,
    hijackable: bool,
    hijacked: bool,
}

impl BufferedResponse {
    /// Create an empty recorder without hijack support.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a recorder whose connection can be hijacked.
    #[must_use]
    pub fn with_connection(connection: impl Connection + 'static) -> Self {
        Self {
            connection: Some(Box::new(connection)),
            hijackable: true,
            ..Self::default()
        }
    }

    /// Final status, if a head has been written.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Headers sent with the final head.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.sent
    }

    /// Informational heads in the order they were sent.
    #[must_use]
    pub fn informational(&self) -> &[(StatusCode, HeaderMap)] {
        &self.informational
    }

    /// Body bytes written so far.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of flushes that reached this writer.
    #[must_use]
    pub const fn flushes(&self) -> usize {
        self.flushes
    }

    /// Whether the connection was taken over.
    #[must_use]
    pub const fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// Convert into an `http::Response`; an untouched recorder becomes `200 OK`.
    #[must_use]
    pub fn into_response(self) -> http::Response<Bytes> {
        let headers = if self.status.is_some() {
            self.sent
        } else {
            self.pending
        };
        let mut response = http::Response::new(self.body.freeze());
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = headers;
        response
    }
}

impl ResponseWriter for BufferedResponse {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.pending
    }

    fn write_head(&mut self, status: StatusCode) {
        if self.status.is_some() || self.hijacked {
            debug!(status = %status, "Ignoring superfluous response head");
            return;
        }
        if status.is_informational() {
            self.informational.push((status, self.pending.clone()));
            return;
        }
        self.status = Some(status);
        self.sent = self.pending.clone();
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.hijacked {
            return Err(io::Error::other("connection hijacked"));
        }
        if self.status.is_none() {
            self.write_head(StatusCode::OK);
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.hijacked {
            return Err(io::Error::other("connection hijacked"));
        }
        if self.status.is_none() {
            self.write_head(StatusCode::OK);
        }
        self.flushes += 1;
        Ok(())
    }

    fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
        if self.hijackable {
            Some(self)
        } else {
            None
        }
    }
}

impl Hijack for BufferedResponse {
    fn hijack(&mut self) -> Fail2BanResult<Box<dyn Connection>> {
        let connection = self.connection.take().ok_or(Fail2BanError::AlreadyHijacked)?;
        self.hijacked = true;
        Ok(connection)
    }
}

impl fmt::Debug for BufferedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedResponse")
            .field("status", &self.status)
            .field("headers", &self.sent)
            .field("informational", &self.informational)
            .field("body_len", &self.body.len())
            .field("flushes", &self.flushes)
            .field("hijackable", &self.hijackable)
            .field("hijacked", &self.hijacked)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;
    use std::io::{Cursor, Read};

    #[test]
    fn test_implicit_ok_on_write() {
        let mut w = BufferedResponse::new();
        write_all(&mut w, b"hello").unwrap();

        assert_eq!(w.status(), Some(StatusCode::OK));
        assert_eq!(w.body(), b"hello");
    }

    #[test]
    fn test_headers_captured_at_head() {
        let mut w = BufferedResponse::new();
        w.headers_mut().insert(CONTENT_TYPE, "text/plain".parse().unwrap());
        w.write_head(StatusCode::NOT_FOUND);
        w.headers_mut().insert("x-late", "1".parse().unwrap());

        assert_eq!(w.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(w.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
        assert!(w.headers().get("x-late").is_none());
    }

    #[test]
    fn test_informational_then_final() {
        let mut w = BufferedResponse::new();
        w.headers_mut().insert("link", "</style.css>; rel=preload".parse().unwrap());
        w.write_head(StatusCode::from_u16(103).unwrap());
        w.write_head(StatusCode::from_u16(103).unwrap());
        w.write_head(StatusCode::CREATED);
        w.write_head(StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(w.informational().len(), 2);
        assert!(w.informational()[0].1.contains_key("link"));
        assert_eq!(w.status(), Some(StatusCode::CREATED));
    }

    #[test]
    fn test_reject_writes_forbidden() {
        let mut w = BufferedResponse::new();
        reject(&mut w);

        assert_eq!(w.status(), Some(StatusCode::FORBIDDEN));
        assert!(w.body().is_empty());
        assert_eq!(w.flushes(), 1);
    }

    #[test]
    fn test_not_hijackable_by_default() {
        let mut w = BufferedResponse::new();
        assert!(w.hijacker().is_none());
    }

    #[test]
    fn test_hijack_once() {
        let mut w = BufferedResponse::with_connection(Cursor::new(b"raw".to_vec()));
        let mut conn = w.hijacker().unwrap().hijack().unwrap();

        let mut buf = String::new();
        conn.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "raw");
        assert!(w.is_hijacked());
        assert!(w.write(b"x").is_err());
        assert!(matches!(
            w.hijacker().unwrap().hijack(),
            Err(Fail2BanError::AlreadyHijacked)
        ));
    }

    #[test]
    fn test_into_response() {
        let mut w = BufferedResponse::new();
        w.headers_mut().insert("x-test", "yes".parse().unwrap());
        w.write_head(StatusCode::ACCEPTED);
        write_all(&mut w, b"body").unwrap();

        let response = w.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get("x-test").unwrap(), "yes");
        assert_eq!(response.body().as_ref(), b"body");
    }

    #[test]
    fn test_untouched_into_response_is_ok() {
        let response = BufferedResponse::new().into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.body().is_empty());
    }

    #[test]
    fn test_handler_fn() {
        let handler = handler_fn(|w: &mut dyn ResponseWriter, req: &Request| {
            w.write_head(StatusCode::IM_A_TEAPOT);
            let _ = write_all(w, req.uri().path().as_bytes());
        });

        let req = http::Request::builder().uri("/brew").body(Bytes::new()).unwrap();
        let mut w = BufferedResponse::new();
        handler.serve(&mut w, &req);

        assert_eq!(w.status(), Some(StatusCode::IM_A_TEAPOT));
        assert_eq!(w.body(), b"/brew");
    }
}
