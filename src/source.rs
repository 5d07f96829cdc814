//! Consumer-side endpoint of an exchange.
//!
//! An [`ExchangeSourceHandler`] fans pages in from any number of peers into
//! one local [`ExchangeBuffer`]. Each peer is driven by a [`Fetcher`] that
//! keeps at most one request in flight:
//!
//! ```text
//!            has space            page, !finished
//!   Idle ───────────────▶ Requesting ────────────────▶ Delivering ──▶ Idle
//!    │  no space               │  finished / error          │ buffer full
//!    ▼                         ▼                            ▼
//! WaitingForSpace          Closing ──close ack──▶ Finished  Blocked(page)
//! ```
//!
//! A fetcher only asks for more data while the local buffer has room. A page
//! that arrives after the buffer filled up is parked in the fetcher (not in
//! the buffer) until room returns, so the buffer never exceeds its capacity.
//! Every fetcher ends with a close handshake so the peer can release its
//! resources. The buffer is finished once sink registration is closed and
//! every fetcher is `Finished`.
//!
//! Re-arming goes through the rayon pool, so a transport that answers
//! synchronously never recurses into the fetch loop.

use crate::buffer::{AddPage, ExchangeBuffer, PageListener};
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::metrics::{Counter, ExchangeSourceStatus};
use crate::page::Page;
use crate::remote_sink::{RemoteSink, RemoteSinkExt};
use crate::response::ExchangeResponse;
use crate::sink::{Completion, CompletionListener};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Where a single fetcher is in its request cycle.
#[derive(Debug)]
enum FetcherState {
    Idle,
    WaitingForSpace,
    Requesting,
    Delivering,
    Blocked { page: Page, finished: bool },
    /// Close sent. A request that was in flight when the fetcher was aborted
    /// still has to be answered; the close ack is held until it is.
    Closing {
        reply_pending: bool,
        ack: Option<Result<()>>,
    },
    Finished,
}

impl FetcherState {
    fn closing() -> Self {
        FetcherState::Closing {
            reply_pending: false,
            ack: None,
        }
    }
}

impl FetcherState {
    fn name(&self) -> &'static str {
        match self {
            FetcherState::Idle => "idle",
            FetcherState::WaitingForSpace => "waiting_for_space",
            FetcherState::Requesting => "requesting",
            FetcherState::Delivering => "delivering",
            FetcherState::Blocked { .. } => "blocked",
            FetcherState::Closing { .. } => "closing",
            FetcherState::Finished => "finished",
        }
    }
}

/// Per-peer state machine driving fetch requests against one [`RemoteSink`].
pub(crate) struct Fetcher {
    id: usize,
    sink: Arc<dyn RemoteSink>,
    source: Weak<SourceInner>,
    state: Mutex<FetcherState>,
}

impl Fetcher {
    fn schedule(self: &Arc<Self>) {
        let me = Arc::clone(self);
        rayon::spawn(move || me.run());
    }

    fn run(self: &Arc<Self>) {
        let Some(source) = self.source.upgrade() else {
            self.abandon();
            return;
        };
        let mut st = self.state.lock();
        if !matches!(*st, FetcherState::Idle) {
            return;
        }
        if source.aborted.load(Ordering::Acquire) {
            *st = FetcherState::closing();
            drop(st);
            self.close_peer();
            return;
        }
        if !source.buffer.has_space() {
            *st = FetcherState::WaitingForSpace;
            drop(st);
            let me = Arc::clone(self);
            source.buffer.on_space_available(Box::new(move || me.resume()));
            return;
        }
        *st = FetcherState::Requesting;
        drop(st);
        source.fetch_requests.incr();
        let me = Arc::clone(self);
        self.sink
            .fetch_page_async(false, Box::new(move |res| me.on_response(res)));
    }

    fn resume(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if matches!(*st, FetcherState::WaitingForSpace) {
            *st = FetcherState::Idle;
            drop(st);
            self.schedule();
        }
    }

    fn on_response(self: &Arc<Self>, res: Result<ExchangeResponse>) {
        let mut st = self.state.lock();
        if let FetcherState::Closing { reply_pending, ack } = &mut *st
            && *reply_pending
        {
            // the request raced with an abort; whatever it carries is released
            *reply_pending = false;
            let ack = ack.take();
            if ack.is_some() {
                *st = FetcherState::Finished;
            }
            drop(st);
            drop(res);
            if let Some(ack) = ack {
                self.report_finished(ack);
            }
            return;
        }
        if !matches!(*st, FetcherState::Requesting) {
            let state = st.name();
            drop(st);
            drop(res);
            if let Some(source) = self.source.upgrade() {
                source.fail(ExchangeError::protocol(format!(
                    "fetcher {} received a response while {state}",
                    self.id
                )));
            }
            return;
        }
        let Some(source) = self.source.upgrade() else {
            *st = FetcherState::closing();
            drop(st);
            drop(res);
            self.close_peer();
            return;
        };
        let resp = match res {
            Ok(resp) => resp,
            Err(err) => {
                *st = FetcherState::Finished;
                drop(st);
                debug!(exchange_id = %source.exchange_id, fetcher = self.id, peer = %self.sink.peer(), error = %err, "fetcher failed");
                source.on_fetcher_finished(self.id, Some(err));
                return;
            }
        };
        let (page, finished) = resp.into_parts();
        if let Some(p) = &page {
            source.pages_received.incr();
            source.rows_received.add(p.row_count() as u64);
            trace!(exchange_id = %source.exchange_id, fetcher = self.id, rows = p.row_count(), finished, "page received");
        }
        if source.aborted.load(Ordering::Acquire) {
            *st = FetcherState::closing();
            drop(st);
            if page.is_some() {
                warn!(exchange_id = %source.exchange_id, fetcher = self.id, "releasing page that raced with cancellation");
            }
            drop(page);
            self.close_peer();
            return;
        }
        *st = FetcherState::Delivering;
        drop(st);
        self.deliver(&source, page, finished);
    }

    fn deliver(self: &Arc<Self>, source: &Arc<SourceInner>, page: Option<Page>, finished: bool) {
        if let Some(page) = page {
            match source.buffer.add_page(page) {
                Ok(AddPage::Accepted) => {}
                Ok(AddPage::Full(page)) => {
                    *self.state.lock() = FetcherState::Blocked { page, finished };
                    let me = Arc::clone(self);
                    source
                        .buffer
                        .on_space_available(Box::new(move || me.schedule_retry()));
                    return;
                }
                Err(ExchangeError::Closed) => {
                    self.stop();
                    return;
                }
                Err(err) => {
                    source.fail(err);
                    self.stop();
                    return;
                }
            }
        }
        if finished {
            self.stop();
        } else {
            let mut st = self.state.lock();
            if matches!(*st, FetcherState::Delivering) {
                *st = FetcherState::Idle;
                drop(st);
                self.schedule();
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let me = Arc::clone(self);
        rayon::spawn(move || me.retry_blocked());
    }

    fn retry_blocked(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if !matches!(*st, FetcherState::Blocked { .. }) {
            // abort() already took the page
            return;
        }
        let FetcherState::Blocked { page, finished } =
            std::mem::replace(&mut *st, FetcherState::Delivering)
        else {
            return;
        };
        drop(st);
        let Some(source) = self.source.upgrade() else {
            drop(page);
            self.stop();
            return;
        };
        if source.aborted.load(Ordering::Acquire) {
            drop(page);
            self.stop();
            return;
        }
        self.deliver(&source, Some(page), finished);
    }

    /// Move to `Closing` and run the close handshake, unless already closing.
    fn stop(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if matches!(*st, FetcherState::Closing { .. } | FetcherState::Finished) {
            return;
        }
        *st = FetcherState::closing();
        drop(st);
        self.close_peer();
    }

    /// Called by the handler on cancellation or when all consumers are done.
    fn abort(self: &Arc<Self>) {
        let mut st = self.state.lock();
        match std::mem::replace(&mut *st, FetcherState::closing()) {
            FetcherState::Idle | FetcherState::WaitingForSpace => {
                drop(st);
                self.close_peer();
            }
            FetcherState::Blocked { page, .. } => {
                drop(st);
                drop(page);
                self.close_peer();
            }
            // a parked request may never be answered unless the peer is closed
            FetcherState::Requesting => {
                *st = FetcherState::Closing {
                    reply_pending: true,
                    ack: None,
                };
                drop(st);
                self.close_peer();
            }
            // the delivery step observes the abort
            other @ (FetcherState::Delivering
            | FetcherState::Closing { .. }
            | FetcherState::Finished) => *st = other,
        }
    }

    fn abandon(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if matches!(*st, FetcherState::Idle | FetcherState::WaitingForSpace) {
            *st = FetcherState::closing();
            drop(st);
            self.close_peer();
        }
    }

    fn close_peer(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.sink.close(Box::new(move |res| me.on_closed(res)));
    }

    fn on_closed(self: &Arc<Self>, res: Result<()>) {
        let mut st = self.state.lock();
        match &mut *st {
            FetcherState::Closing {
                reply_pending: true,
                ack: ack @ None,
            } => {
                *ack = Some(res);
                return;
            }
            FetcherState::Closing {
                reply_pending: false,
                ack: None,
            } => {}
            other => {
                let state = other.name();
                drop(st);
                if let Some(source) = self.source.upgrade() {
                    source.fail(ExchangeError::protocol(format!(
                        "fetcher {} received a close acknowledgement while {state}",
                        self.id
                    )));
                }
                return;
            }
        }
        *st = FetcherState::Finished;
        drop(st);
        self.report_finished(res);
    }

    fn report_finished(&self, res: Result<()>) {
        if let Some(source) = self.source.upgrade() {
            debug!(exchange_id = %source.exchange_id, fetcher = self.id, peer = %self.sink.peer(), "fetcher finished");
            source.on_fetcher_finished(self.id, res.err());
        }
    }

    fn is_finished(&self) -> bool {
        matches!(*self.state.lock(), FetcherState::Finished)
    }
}

struct SourceState {
    fetchers: Vec<Arc<Fetcher>>,
    active_fetchers: usize,
    no_more_sinks: bool,
    consumers_created: u64,
    consumers_finished: u64,
    failure: Option<ExchangeError>,
}

pub(crate) struct SourceInner {
    exchange_id: String,
    buffer: ExchangeBuffer,
    state: Mutex<SourceState>,
    aborted: AtomicBool,
    completion: Completion,
    fetch_requests: Counter,
    pages_received: Counter,
    rows_received: Counter,
}

impl SourceInner {
    fn on_fetcher_finished(&self, id: usize, err: Option<ExchangeError>) {
        if let Some(err) = err {
            self.fail(err);
        }
        let done = {
            let mut st = self.state.lock();
            st.active_fetchers = st.active_fetchers.saturating_sub(1);
            trace!(exchange_id = %self.exchange_id, fetcher = id, active = st.active_fetchers, "fetcher done");
            st.active_fetchers == 0 && (st.no_more_sinks || self.aborted.load(Ordering::Acquire))
        };
        if done {
            self.complete_if_drained();
        }
    }

    fn complete_if_drained(&self) {
        let failure = self.state.lock().failure.clone();
        match failure {
            Some(err) => {
                self.completion.complete(Err(err));
            }
            None => {
                self.buffer.finish();
                if self.completion.complete(Ok(())) {
                    debug!(exchange_id = %self.exchange_id, "exchange source completed");
                }
            }
        }
    }

    /// Stop every fetcher; each one still runs its close handshake.
    fn abort(&self) -> bool {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return false;
        }
        let (fetchers, idle) = {
            let st = self.state.lock();
            (st.fetchers.clone(), st.active_fetchers == 0)
        };
        debug!(exchange_id = %self.exchange_id, fetchers = fetchers.len(), "aborting exchange source");
        for f in &fetchers {
            f.abort();
        }
        if idle {
            self.complete_if_drained();
        }
        true
    }

    /// Terminal failure: pages are released, consumers see `err`, peers are closed.
    fn fail(&self, err: ExchangeError) {
        {
            let mut st = self.state.lock();
            if st.failure.is_some() {
                return;
            }
            st.failure = Some(err.clone());
        }
        debug!(exchange_id = %self.exchange_id, error = %err, "exchange source failed");
        self.buffer.fail(err.clone());
        self.completion.complete(Err(err));
        self.abort();
    }

    fn on_consumer_finished(&self) {
        let all_done = {
            let mut st = self.state.lock();
            st.consumers_finished += 1;
            st.consumers_finished == st.consumers_created
        };
        if all_done {
            let released = self.buffer.close();
            debug!(exchange_id = %self.exchange_id, released, "all exchange consumers finished");
            self.abort();
        }
    }
}

/// Pulls pages from registered peers into a local buffer.
///
/// Cloning yields another handle to the same handler.
#[derive(Clone)]
pub struct ExchangeSourceHandler {
    inner: Arc<SourceInner>,
}

impl ExchangeSourceHandler {
    /// Create a handler whose buffer is bounded by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::InvalidConfig`] if `config` does not validate.
    pub fn new(exchange_id: impl Into<String>, config: &ExchangeConfig) -> Result<Self> {
        let exchange_id = exchange_id.into();
        let buffer = ExchangeBuffer::new(format!("source:{exchange_id}"), config)?;
        Ok(Self {
            inner: Arc::new(SourceInner {
                exchange_id,
                buffer,
                state: Mutex::new(SourceState {
                    fetchers: Vec::new(),
                    active_fetchers: 0,
                    no_more_sinks: false,
                    consumers_created: 0,
                    consumers_finished: 0,
                    failure: None,
                }),
                aborted: AtomicBool::new(false),
                completion: Completion::new(),
                fetch_requests: Counter::default(),
                pages_received: Counter::default(),
                rows_received: Counter::default(),
            }),
        })
    }

    pub fn exchange_id(&self) -> &str {
        &self.inner.exchange_id
    }

    /// Register a peer. Fetching starts right away. A sink added after the
    /// handler stopped is closed immediately without being fetched from.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::ProtocolViolation`] if sink registration was already
    /// closed by [`no_more_sinks`](Self::no_more_sinks) and the handler is still running.
    pub fn add_remote_sink(&self, sink: Arc<dyn RemoteSink>) -> Result<()> {
        let aborted = self.inner.aborted.load(Ordering::Acquire);
        let fetcher = {
            let mut st = self.inner.state.lock();
            if st.no_more_sinks && !aborted {
                return Err(ExchangeError::protocol(format!(
                    "remote sink added to exchange {} after no_more_sinks",
                    self.inner.exchange_id
                )));
            }
            let fetcher = Arc::new(Fetcher {
                id: st.fetchers.len(),
                sink,
                source: Arc::downgrade(&self.inner),
                state: Mutex::new(FetcherState::Idle),
            });
            st.fetchers.push(Arc::clone(&fetcher));
            st.active_fetchers += 1;
            fetcher
        };
        debug!(exchange_id = %self.inner.exchange_id, fetcher = fetcher.id, peer = %fetcher.sink.peer(), "remote sink added");
        if self.inner.aborted.load(Ordering::Acquire) {
            fetcher.abort();
        } else {
            fetcher.schedule();
        }
        Ok(())
    }

    /// Declare that no further peers will be registered. The buffer finishes
    /// once every registered fetcher has finished.
    pub fn no_more_sinks(&self) {
        let idle = {
            let mut st = self.inner.state.lock();
            st.no_more_sinks = true;
            st.active_fetchers == 0
        };
        if idle {
            self.inner.complete_if_drained();
        }
    }

    /// Register one more local consumer. When every consumer created here
    /// has finished, the handler stops all fetchers and discards buffered pages.
    #[must_use]
    pub fn create_exchange_source(&self) -> ExchangeSource {
        self.inner.state.lock().consumers_created += 1;
        ExchangeSource {
            inner: Arc::clone(&self.inner),
            finished: AtomicBool::new(false),
        }
    }

    /// Cancel the consuming pipeline: release buffered pages, tell every peer to
    /// stop, and complete with [`ExchangeError::Cancelled`].
    pub fn cancel(&self, reason: impl Into<String>) {
        self.inner.fail(ExchangeError::Cancelled(reason.into()));
    }

    /// Run `listener` once with the exchange's final outcome.
    pub fn add_completion_listener(&self, listener: CompletionListener) {
        self.inner.completion.add_listener(listener);
    }

    #[must_use]
    pub fn outcome(&self) -> Option<Result<()>> {
        self.inner.completion.outcome()
    }

    /// Finished and drained.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.buffer.is_finished()
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer.size()
    }

    #[must_use]
    pub fn outstanding_rows(&self) -> usize {
        self.inner.buffer.outstanding_rows()
    }

    #[must_use]
    pub fn status(&self) -> ExchangeSourceStatus {
        let st = self.inner.state.lock();
        ExchangeSourceStatus {
            exchange_id: self.inner.exchange_id.clone(),
            buffer: self.inner.buffer.stats(),
            fetchers: st.fetchers.len() as u64,
            finished_fetchers: st.fetchers.iter().filter(|f| f.is_finished()).count() as u64,
            fetch_requests: self.inner.fetch_requests.get(),
            pages_received: self.inner.pages_received.get(),
            rows_received: self.inner.rows_received.get(),
            consumers: st.consumers_created,
            completed: self.inner.completion.outcome().is_some(),
        }
    }
}

/// A consumer's handle on a source handler's buffer.
///
/// Dropping an unfinished handle finishes it.
pub struct ExchangeSource {
    inner: Arc<SourceInner>,
    finished: AtomicBool,
}

impl ExchangeSource {
    /// Take the next page without blocking.
    ///
    /// # Errors
    ///
    /// Returns the exchange's failure once it failed or was cancelled.
    pub fn poll_page(&self) -> Result<Option<Page>> {
        self.inner.buffer.poll_page()
    }

    /// Wait up to `timeout` for the next page. `None` means finished or timed out.
    ///
    /// # Errors
    ///
    /// Returns the exchange's failure once it failed or was cancelled.
    pub fn wait_for_page(&self, timeout: Duration) -> Result<Option<Page>> {
        self.inner.buffer.wait_for_page(timeout)
    }

    /// Deliver the next page, completion, or failure to `listener`.
    pub fn poll_or_listen(&self, listener: PageListener) {
        self.inner.buffer.poll_or_listen(listener);
    }

    /// No page will ever be returned again.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.inner.buffer.is_finished()
    }

    /// This consumer needs no more pages. Idempotent.
    pub fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.inner.on_consumer_finished();
        }
    }
}

impl Drop for ExchangeSource {
    fn drop(&mut self) {
        self.finish();
    }
}
