//! Ordered decision chain in front of a terminal handler.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context;
use crate::error::Fail2BanResult;
use crate::response::{reject, Handler, Request, ResponseWriter};

/// Opinion of one chain link about a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// No opinion; ask the next link.
    Continue,
    /// Reject the request now; the terminal handler is not called.
    ShortCircuitDeny,
    /// Stop asking links and serve the request.
    ShortCircuitAllow,
}

/// One decision stage of a [`Chain`].
pub trait ChainHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Decide on a request from `client`.
    ///
    /// # Errors
    ///
    /// An error stops the chain from consulting further links; the request is
    /// still served.
    fn check(&self, client: &str, req: &Request) -> Fail2BanResult<ChainStatus>;
}

/// Decision handlers run in order before a terminal handler.
pub struct Chain {
    handlers: Vec<Box<dyn ChainHandler>>,
    terminal: Arc<dyn Handler>,
    status_handler: Option<Arc<dyn Handler>>,
    remote_ip_header: String,
}

impl Chain {
    /// Create a chain ending in `terminal`.
    #[must_use]
    pub fn new(terminal: Arc<dyn Handler>, handlers: Vec<Box<dyn ChainHandler>>) -> Self {
        Self {
            handlers,
            terminal,
            status_handler: None,
            remote_ip_header: String::new(),
        }
    }

    /// Replace the terminal stage with `handler`.
    #[must_use]
    pub fn with_status_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.status_handler = Some(handler);
        self
    }

    /// Read the client address from `header` when present.
    #[must_use]
    pub fn with_remote_ip_header(mut self, header: impl Into<String>) -> Self {
        self.remote_ip_header = header.into();
        self
    }

    /// Append a decision handler.
    #[must_use]
    pub fn handler(mut self, handler: Box<dyn ChainHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Number of decision handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the chain has no decision handlers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the chain for one request.
    pub fn serve(&self, w: &mut dyn ResponseWriter, mut req: Request) {
        if let Err(e) = context::attach(&mut req, &self.remote_ip_header) {
            warn!(error = %e, uri = %req.uri(), "Cannot resolve client address, dropping request");
            return;
        }
        let client = context::client_addr(&req).unwrap_or_default().to_string();

        for handler in &self.handlers {
            match handler.check(&client, &req) {
                Err(e) => {
                    warn!(
                        handler = handler.name(),
                        ip = %client,
                        error = %e,
                        "Chain handler failed, skipping remaining handlers"
                    );
                    break;
                }
                Ok(ChainStatus::ShortCircuitDeny) => {
                    debug!(handler = handler.name(), ip = %client, "Request denied");
                    reject(w);
                    return;
                }
                Ok(ChainStatus::ShortCircuitAllow) => {
                    debug!(handler = handler.name(), ip = %client, "Request allowed early");
                    break;
                }
                Ok(ChainStatus::Continue) => {}
            }
        }

        let terminal = self.status_handler.as_ref().unwrap_or(&self.terminal);
        terminal.serve(w, &req);
    }
}

impl Handler for Chain {
    fn serve(&self, w: &mut dyn ResponseWriter, req: &Request) {
        let mut owned = http::Request::new(req.body().clone());
        *owned.method_mut() = req.method().clone();
        *owned.uri_mut() = req.uri().clone();
        *owned.version_mut() = req.version();
        *owned.headers_mut() = req.headers().clone();
        *owned.extensions_mut() = req.extensions().clone();
        Self::serve(self, w, owned);
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field(
                "handlers",
                &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .field("status_handler", &self.status_handler.is_some())
            .field("remote_ip_header", &self.remote_ip_header)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PeerAddr;
    use crate::error::Fail2BanError;
    use crate::response::{handler_fn, write_all, BufferedResponse};
    use bytes::Bytes;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        result: fn() -> Fail2BanResult<ChainStatus>,
        calls: Arc<AtomicUsize>,
    }

    impl ChainHandler for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn check(&self, _client: &str, _req: &Request) -> Fail2BanResult<ChainStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn link(
        name: &'static str,
        result: fn() -> Fail2BanResult<ChainStatus>,
    ) -> (Box<dyn ChainHandler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Fixed {
            name,
            result,
            calls: Arc::clone(&calls),
        };
        (Box::new(handler), calls)
    }

    fn terminal() -> (Arc<dyn Handler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |w: &mut dyn ResponseWriter, _req: &Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = write_all(w, b"served");
        });
        (Arc::new(handler), calls)
    }

    fn request() -> Request {
        let mut req = http::Request::builder()
            .uri("/index.html")
            .body(Bytes::new())
            .unwrap();
        req.extensions_mut()
            .insert(PeerAddr("192.0.2.1:4000".parse().unwrap()));
        req
    }

    #[test]
    fn test_all_continue_reaches_terminal() {
        let (a, a_calls) = link("a", || Ok(ChainStatus::Continue));
        let (b, b_calls) = link("b", || Ok(ChainStatus::Continue));
        let (term, term_calls) = terminal();

        let chain = Chain::new(term, vec![a, b]);
        let mut w = BufferedResponse::new();
        chain.serve(&mut w, request());

        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(term_calls.load(Ordering::SeqCst), 1);
        assert_eq!(w.status(), Some(StatusCode::OK));
        assert_eq!(w.body(), b"served");
    }

    #[test]
    fn test_deny_short_circuits() {
        let (a, _) = link("deny", || Ok(ChainStatus::ShortCircuitDeny));
        let (b, b_calls) = link("b", || Ok(ChainStatus::Continue));
        let (term, term_calls) = terminal();

        let chain = Chain::new(term, vec![a, b]);
        let mut w = BufferedResponse::new();
        chain.serve(&mut w, request());

        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert_eq!(term_calls.load(Ordering::SeqCst), 0);
        assert_eq!(w.status(), Some(StatusCode::FORBIDDEN));
        assert!(w.body().is_empty());
    }

    #[test]
    fn test_allow_skips_remaining_links() {
        let (a, _) = link("allow", || Ok(ChainStatus::ShortCircuitAllow));
        let (b, b_calls) = link("deny", || Ok(ChainStatus::ShortCircuitDeny));
        let (term, term_calls) = terminal();

        let chain = Chain::new(term, vec![a, b]);
        let mut w = BufferedResponse::new();
        chain.serve(&mut w, request());

        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert_eq!(term_calls.load(Ordering::SeqCst), 1);
        assert_eq!(w.status(), Some(StatusCode::OK));
    }

    #[test]
    fn test_handler_error_fails_open() {
        let (a, a_calls) = link("broken", || Err(Fail2BanError::Handler("boom".into())));
        let (b, b_calls) = link("deny", || Ok(ChainStatus::ShortCircuitDeny));
        let (term, term_calls) = terminal();

        let chain = Chain::new(term, vec![a, b]);
        let mut w = BufferedResponse::new();
        chain.serve(&mut w, request());

        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert_eq!(term_calls.load(Ordering::SeqCst), 1);
        assert_eq!(w.body(), b"served");
    }

    #[test]
    fn test_status_handler_replaces_terminal() {
        let (term, term_calls) = terminal();
        let (status, status_calls) = terminal();

        let chain = Chain::new(term, Vec::new()).with_status_handler(status);
        let mut w = BufferedResponse::new();
        chain.serve(&mut w, request());

        assert_eq!(term_calls.load(Ordering::SeqCst), 0);
        assert_eq!(status_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_peer_aborts_chain() {
        let (a, a_calls) = link("a", || Ok(ChainStatus::Continue));
        let (term, term_calls) = terminal();

        let chain = Chain::new(term, vec![a]);
        let mut w = BufferedResponse::new();
        let req = http::Request::builder().uri("/").body(Bytes::new()).unwrap();
        chain.serve(&mut w, req);

        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(term_calls.load(Ordering::SeqCst), 0);
        assert_eq!(w.status(), None);
    }

    #[test]
    fn test_links_receive_client_address() {
        struct Expect;
        impl ChainHandler for Expect {
            fn name(&self) -> &str {
                "expect"
            }
            fn check(&self, client: &str, req: &Request) -> Fail2BanResult<ChainStatus> {
                assert_eq!(Some(client), context::client_addr(req));
                if client == "203.0.113.5" {
                    Ok(ChainStatus::ShortCircuitDeny)
                } else {
                    Ok(ChainStatus::Continue)
                }
            }
        }

        let (term, _) = terminal();
        let chain = Chain::new(term, Vec::new())
            .handler(Box::new(Expect))
            .with_remote_ip_header("X-Forwarded-For");

        let mut req = request();
        req.headers_mut()
            .insert("x-forwarded-for", "203.0.113.5, 10.0.0.1".parse().unwrap());
        let mut w = BufferedResponse::new();
        chain.serve(&mut w, req);
        assert_eq!(w.status(), Some(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_chain_as_handler() {
        let (term, term_calls) = terminal();
        let chain: Arc<dyn Handler> = Arc::new(Chain::new(term, Vec::new()));

        let mut w = BufferedResponse::new();
        chain.serve(&mut w, &request());
        assert_eq!(term_calls.load(Ordering::SeqCst), 1);
    }
}
