//! Dispatch registry
//!
//! Routes a completed HTTP request or WebSocket message to user-registered
//! handlers keyed by a string extracted from the message (default: the
//! HTTP path, or the raw WS payload). Handlers run in registration order
//! and the chain short-circuits on the first non-`Ok` outcome, using a
//! small tagged variant rather than magic integers for the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::HttpRequestContext;
use crate::parser::status::Status;
use crate::ws::Opcode;

/// Result of running one handler (or a full chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Continue normal processing (or, at the end of a chain, the
    /// request was handled successfully).
    Ok,
    /// The connection stays open but this request failed; no further
    /// handlers run.
    FailKeep,
    /// The connection must be closed; no further handlers run.
    FailClose,
    /// Hand this message to the worker pool and suspend dispatch on this
    /// connection until a completion arrives.
    Deferred,
}

/// The message a handler inspects, built by [`Connection::poll_read`] and
/// handed to the registry either inline (on the reactor thread) or copied
/// into a worker [`Task`](crate::worker::Task).
#[derive(Debug, Clone)]
pub enum DispatchContext {
    /// A complete HTTP request.
    Http(HttpRequestContext),
    /// A complete WebSocket message (control frames never reach here).
    Ws(Opcode, Vec<u8>),
}

impl DispatchContext {
    /// The default dispatch key: the HTTP path, or the WS payload
    /// interpreted lossily as UTF-8.
    pub fn default_key(&self) -> String {
        match self {
            Self::Http(req) => req.path().to_string(),
            Self::Ws(_, payload) => String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

/// What a handler wants written back to the peer.
#[derive(Debug, Clone)]
pub enum HandlerReply {
    /// No reply (the handler deferred, failed, or otherwise has nothing
    /// to send).
    None,
    /// An HTTP response.
    Http {
        /// Status line code.
        status: Status,
        /// Extra response headers (`Content-Length` is computed by the
        /// connection when the response is queued).
        headers: Vec<(String, String)>,
        /// Response body.
        body: Vec<u8>,
    },
    /// A WebSocket text/binary echo, sent with the given opcode.
    Ws(Opcode, Vec<u8>),
}

/// A user-registered handler: inspects the context, returns an outcome
/// and (for `Ok`) the reply to queue.
pub type Handler = Arc<dyn Fn(&DispatchContext) -> (Outcome, HandlerReply) + Send + Sync>;

/// A user-registered key extractor, overriding [`DispatchContext::default_key`].
pub type KeyExtractor = Arc<dyn Fn(&DispatchContext) -> String + Send + Sync>;

/// Per-key handler chains plus a global fallback chain.
#[derive(Clone)]
pub struct DispatchRegistry {
    key_fn: Option<KeyExtractor>,
    handlers: HashMap<String, Vec<Handler>>,
    fallback: Vec<Handler>,
}

impl Default for DispatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchRegistry {
    /// An empty registry: every message falls through to the fallback
    /// chain (itself empty, so every request gets `FailKeep`) until
    /// handlers are registered.
    pub fn new() -> Self {
        Self {
            key_fn: None,
            handlers: HashMap::new(),
            fallback: Vec::new(),
        }
    }

    /// Overrides the default key extractor.
    pub fn set_key_function(&mut self, key_fn: KeyExtractor) {
        self.key_fn = Some(key_fn);
    }

    /// Registers a handler under `key`, appended after any already there.
    pub fn set_function(&mut self, key: impl Into<String>, handler: Handler) {
        self.handlers.entry(key.into()).or_default().push(handler);
    }

    /// Registers a fallback handler, run when no key-specific chain
    /// matches (or matched but was empty).
    pub fn set_global_solve_function(&mut self, handler: Handler) {
        self.fallback.push(handler);
    }

    /// The key this context would dispatch under.
    pub fn key_for(&self, ctx: &DispatchContext) -> String {
        match &self.key_fn {
            Some(f) => f(ctx),
            None => ctx.default_key(),
        }
    }

    /// Runs the handler chain for `ctx`'s key, falling back to the
    /// global chain if the key is unregistered. Stops at the first
    /// non-`Ok` outcome and returns it with that handler's reply; if
    /// every handler in the chosen chain returns `Ok`, returns `Ok` with
    /// the last handler's reply (or `HandlerReply::None` if the chain was
    /// empty).
    pub fn dispatch(&self, ctx: &DispatchContext) -> (Outcome, HandlerReply) {
        let key = self.key_for(ctx);
        let chain = self.handlers.get(&key).filter(|h| !h.is_empty()).unwrap_or(&self.fallback);
        Self::run_chain(chain, ctx)
    }

    fn run_chain(chain: &[Handler], ctx: &DispatchContext) -> (Outcome, HandlerReply) {
        let mut last = (Outcome::Ok, HandlerReply::None);
        for handler in chain {
            last = handler(ctx);
            if last.0 != Outcome::Ok {
                return last;
            }
        }
        last
    }

    /// Re-runs the chain for a message a worker picked up after it was
    /// deferred. A second `Deferred` here is treated as `FailKeep` —
    /// there is no second worker pass to hand it to.
    pub fn dispatch_deferred(&self, ctx: &DispatchContext) -> (Outcome, HandlerReply) {
        match self.dispatch(ctx) {
            (Outcome::Deferred, _) => (Outcome::FailKeep, HandlerReply::None),
            other => other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser::{Method, Version};

    fn http_ctx(path: &str) -> DispatchContext {
        DispatchContext::Http(HttpRequestContext {
            method: Method::Get,
            target: path.to_string(),
            version: Version::H1_1,
            headers: Vec::new(),
            body: Vec::new(),
            key: None,
        })
    }

    fn ok_reply(body: &'static str) -> Handler {
        Arc::new(move |_ctx| {
            (
                Outcome::Ok,
                HandlerReply::Http {
                    status: Status::r#Ok,
                    headers: Vec::new(),
                    body: body.as_bytes().to_vec(),
                },
            )
        })
    }

    #[test]
    fn dispatches_to_registered_key() {
        let mut registry = DispatchRegistry::new();
        registry.set_function("/ping", ok_reply("pong"));

        let (outcome, reply) = registry.dispatch(&http_ctx("/ping"));
        assert_eq!(Outcome::Ok, outcome);
        match reply {
            HandlerReply::Http { body, .. } => assert_eq!(b"pong".to_vec(), body),
            _ => panic!("expected an HTTP reply"),
        }
    }

    #[test]
    fn falls_back_when_key_is_unregistered() {
        let mut registry = DispatchRegistry::new();
        registry.set_global_solve_function(ok_reply("fallback"));

        let (outcome, reply) = registry.dispatch(&http_ctx("/missing"));
        assert_eq!(Outcome::Ok, outcome);
        match reply {
            HandlerReply::Http { body, .. } => assert_eq!(b"fallback".to_vec(), body),
            _ => panic!("expected an HTTP reply"),
        }
    }

    #[test]
    fn short_circuits_on_first_failure() {
        let mut registry = DispatchRegistry::new();
        registry.set_function(
            "/fail",
            Arc::new(|_ctx| (Outcome::FailClose, HandlerReply::None)),
        );
        registry.set_function("/fail", ok_reply("unreachable"));

        let (outcome, _) = registry.dispatch(&http_ctx("/fail"));
        assert_eq!(Outcome::FailClose, outcome);
    }

    #[test]
    fn key_extractor_can_be_overridden() {
        let mut registry = DispatchRegistry::new();
        registry.set_key_function(Arc::new(|_ctx| "always-this".to_string()));
        registry.set_function("always-this", ok_reply("hi"));

        let (outcome, _) = registry.dispatch(&http_ctx("/anything"));
        assert_eq!(Outcome::Ok, outcome);
    }

    #[test]
    fn redeferring_from_a_worker_pass_becomes_fail_keep() {
        let mut registry = DispatchRegistry::new();
        registry.set_function("/slow", Arc::new(|_ctx| (Outcome::Deferred, HandlerReply::None)));

        let (outcome, _) = registry.dispatch_deferred(&http_ctx("/slow"));
        assert_eq!(Outcome::FailKeep, outcome);
    }
}
