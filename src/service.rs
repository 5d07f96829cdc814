//! Remote exchange over an injected RPC primitive.
//!
//! - [`ExchangeTransport`] is the only thing a network layer has to provide:
//!   deliver request bytes to a peer and hand back its reply bytes (or a
//!   transport error), once.
//! - [`ExchangeService`] is the receiving side. It is a registry of sink
//!   handlers keyed by exchange id, and it answers serialized fetch requests
//!   against them.
//! - [`RemoteExchangeSink`] is the sending side. It implements
//!   [`RemoteSink`] by encoding the request and decoding the reply, so a
//!   source handler treats a remote peer exactly like a local one.
//! - [`InMemoryTransport`] connects services inside one process, with
//!   simulated disconnects for failure testing.

use crate::codec::{FetchRequest, decode_reply, decode_request, encode_reply, encode_request};
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::page::PageTracker;
use crate::remote_sink::{RemoteSink, ResponseListener};
use crate::response::ExchangeResponse;
use crate::sink::ExchangeSinkHandler;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Receives the serialized reply for one request, exactly once.
pub type ReplyListener = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

/// Reliable asynchronous request/response primitive between nodes.
///
/// Implementations report unreachable peers and timeouts as
/// [`ExchangeError::Transport`]; they never retry on the exchange's behalf.
pub trait ExchangeTransport: Send + Sync {
    fn send(&self, peer: &str, request: Vec<u8>, reply: ReplyListener);
}

/// Per-node registry answering fetch requests for local sink handlers.
pub struct ExchangeService {
    node: String,
    config: ExchangeConfig,
    sinks: Mutex<HashMap<String, ExchangeSinkHandler>>,
    me: Weak<ExchangeService>,
}

impl ExchangeService {
    pub fn new(node: impl Into<String>, config: ExchangeConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            node: node.into(),
            config,
            sinks: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Create a sink handler with this service's config and register it.
    ///
    /// # Errors
    ///
    /// Fails if the id is already registered or the config is invalid.
    pub fn create_sink_handler(&self, exchange_id: impl Into<String>) -> Result<ExchangeSinkHandler> {
        let handler = ExchangeSinkHandler::new(exchange_id, &self.config)?;
        self.register_sink(handler.clone())?;
        Ok(handler)
    }

    /// Make `handler` reachable by remote fetchers. It is deregistered when
    /// it completes successfully; a failed sink stays so that later fetches
    /// still see its error, until [`reap_inactive`](Self::reap_inactive) drops it.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::ProtocolViolation`] if the id is already registered.
    pub fn register_sink(&self, handler: ExchangeSinkHandler) -> Result<()> {
        let id = handler.exchange_id().to_string();
        {
            let mut sinks = self.sinks.lock();
            if sinks.contains_key(&id) {
                return Err(ExchangeError::protocol(format!(
                    "exchange {id} already registered on {}",
                    self.node
                )));
            }
            sinks.insert(id.clone(), handler.clone());
        }
        debug!(node = %self.node, exchange_id = %id, "exchange sink registered");
        let me = self.me.clone();
        handler.add_completion_listener(Box::new(move |outcome| {
            if outcome.is_ok()
                && let Some(service) = me.upgrade()
            {
                service.sinks.lock().remove(&id);
                debug!(node = %service.node, exchange_id = %id, "exchange sink deregistered");
            }
        }));
        Ok(())
    }

    #[must_use]
    pub fn sink(&self, exchange_id: &str) -> Option<ExchangeSinkHandler> {
        self.sinks.lock().get(exchange_id).cloned()
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Answer one serialized [`FetchRequest`].
    ///
    /// A close request for an unknown exchange is answered `finished`, since the
    /// sink already released itself; a normal fetch for one is an error.
    pub fn handle_request(&self, request: &[u8], reply: ReplyListener) {
        let req = match decode_request(request) {
            Ok(req) => req,
            Err(err) => {
                reply(encode_reply(Err(err)));
                return;
            }
        };
        trace!(node = %self.node, exchange_id = %req.exchange_id, all_sources_finished = req.all_sources_finished, "fetch request");
        match self.sink(&req.exchange_id) {
            Some(handler) => handler.fetch_page_async(
                req.all_sources_finished,
                Box::new(move |res| reply(encode_reply(res))),
            ),
            None if req.all_sources_finished => reply(encode_reply(Ok(ExchangeResponse::finished()))),
            None => reply(encode_reply(Err(ExchangeError::UnknownExchange(req.exchange_id)))),
        }
    }

    /// Early-terminate sinks nobody fetched from within the configured
    /// inactivity window, and drop failed sinks that went idle. Sinks with a
    /// parked fetch are still being consumed and are kept. Returns how
    /// many sinks were removed.
    pub fn reap_inactive(&self, now: Instant) -> usize {
        let timeout = self.config.inactive_sink_timeout;
        let stale: Vec<(String, ExchangeSinkHandler)> = self
            .sinks
            .lock()
            .iter()
            .filter(|(_, h)| h.pending_fetches() == 0 && h.idle_for(now) >= timeout)
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();
        for (id, handler) in &stale {
            debug!(node = %self.node, exchange_id = %id, idle = ?handler.idle_for(now), "reaping inactive exchange sink");
            handler.on_failure(ExchangeError::Cancelled(format!(
                "exchange sink {id} inactive for {timeout:?}"
            )));
            self.sinks.lock().remove(id);
        }
        stale.len()
    }
}

/// A [`RemoteSink`] that reaches a peer's [`ExchangeService`] through a transport.
pub struct RemoteExchangeSink {
    exchange_id: String,
    peer: String,
    transport: Arc<dyn ExchangeTransport>,
    tracker: Option<Arc<PageTracker>>,
}

impl RemoteExchangeSink {
    pub fn new(
        exchange_id: impl Into<String>,
        peer: impl Into<String>,
        transport: Arc<dyn ExchangeTransport>,
    ) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            peer: peer.into(),
            transport,
            tracker: None,
        }
    }

    /// Account received pages against `tracker`.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<PageTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

impl RemoteSink for RemoteExchangeSink {
    fn fetch_page_async(&self, all_sources_finished: bool, listener: ResponseListener) {
        let request = FetchRequest {
            exchange_id: self.exchange_id.clone(),
            all_sources_finished,
        };
        let bytes = match encode_request(&request) {
            Ok(bytes) => bytes,
            Err(err) => {
                listener(Err(err));
                return;
            }
        };
        let tracker = self.tracker.clone();
        self.transport.send(
            &self.peer,
            bytes,
            Box::new(move |res| match res {
                Ok(reply) => listener(decode_reply(&reply, tracker.as_ref())),
                Err(err) => listener(Err(err)),
            }),
        );
    }

    fn peer(&self) -> String {
        format!("{}/{}", self.peer, self.exchange_id)
    }
}

/// In-process transport routing requests to registered services on the rayon pool.
#[derive(Default)]
pub struct InMemoryTransport {
    nodes: Mutex<HashMap<String, Arc<ExchangeService>>>,
    disconnected: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl InMemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_node(&self, service: Arc<ExchangeService>) {
        self.nodes.lock().insert(service.node().to_string(), service);
    }

    /// Every request to `node` fails with a transport error until reconnected.
    pub fn disconnect(&self, node: &str) {
        self.disconnected.lock().insert(node.to_string());
    }

    pub fn reconnect(&self, node: &str) {
        self.disconnected.lock().remove(node);
    }

    /// Delay every request by `delay` before it reaches the service.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }
}

impl ExchangeTransport for InMemoryTransport {
    fn send(&self, peer: &str, request: Vec<u8>, reply: ReplyListener) {
        let target = if self.disconnected.lock().contains(peer) {
            Err(ExchangeError::transport(peer, "peer disconnected"))
        } else {
            self.nodes
                .lock()
                .get(peer)
                .cloned()
                .ok_or_else(|| ExchangeError::transport(peer, "unknown node"))
        };
        let delay = *self.delay.lock();
        rayon::spawn(move || {
            if let Some(d) = delay {
                std::thread::sleep(d);
            }
            match target {
                Ok(service) => service.handle_request(&request, reply),
                Err(err) => reply(Err(err)),
            }
        });
    }
}
