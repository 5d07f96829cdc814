//! Producer-side endpoint of an exchange.
//!
//! An [`ExchangeSinkHandler`] owns one [`ExchangeBuffer`] that local producer
//! pipelines fill through [`ExchangeSink`] handles. Consumers, whether local
//! or remote, drain it through the [`RemoteSink`] contract. Fetches that find
//! the buffer empty are parked inside the buffer and answered in arrival order
//! when a page arrives or the buffer finishes.
//!
//! ```
//! use ironexchange::config::ExchangeConfig;
//! use ironexchange::page::{Block, Page};
//! use ironexchange::remote_sink::RemoteSink;
//! use ironexchange::sink::ExchangeSinkHandler;
//!
//! let handler = ExchangeSinkHandler::new("ex-1", &ExchangeConfig::with_row_capacity(8)).unwrap();
//! let sink = handler.create_exchange_sink();
//! let _ = sink.add_page(Page::new(vec![Block::Int64(vec![1, 2])]).unwrap()).unwrap();
//! sink.finish();
//!
//! handler.fetch_page_async(false, Box::new(|res| {
//!     let resp = res.unwrap();
//!     assert_eq!(resp.page().map(|p| p.row_count()), Some(2));
//!     assert!(resp.is_finished());
//! }));
//! ```

use crate::buffer::{AddPage, Delivery, ExchangeBuffer, SpaceListener};
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::metrics::{Counter, ExchangeSinkStatus};
use crate::page::Page;
use crate::remote_sink::{RemoteSink, ResponseListener};
use crate::response::ExchangeResponse;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Invoked once when an exchange endpoint reaches its terminal state.
pub type CompletionListener = Box<dyn FnOnce(Result<()>) + Send>;

/// Exactly-once completion latch shared by sink and source handlers.
pub(crate) struct Completion {
    state: Mutex<CompletionState>,
}

struct CompletionState {
    outcome: Option<Result<()>>,
    listeners: Vec<CompletionListener>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState {
                outcome: None,
                listeners: Vec::new(),
            }),
        }
    }

    /// Record the outcome; returns false if one was already recorded.
    pub(crate) fn complete(&self, outcome: Result<()>) -> bool {
        let mut st = self.state.lock();
        if st.outcome.is_some() {
            return false;
        }
        st.outcome = Some(outcome.clone());
        let listeners = std::mem::take(&mut st.listeners);
        drop(st);
        for l in listeners {
            l(outcome.clone());
        }
        true
    }

    pub(crate) fn add_listener(&self, listener: CompletionListener) {
        let mut st = self.state.lock();
        match st.outcome.clone() {
            Some(outcome) => {
                drop(st);
                listener(outcome);
            }
            None => st.listeners.push(listener),
        }
    }

    pub(crate) fn outcome(&self) -> Option<Result<()>> {
        self.state.lock().outcome.clone()
    }
}

struct SinkInner {
    exchange_id: String,
    buffer: ExchangeBuffer,
    producers: Mutex<ProducerCount>,
    reported_finished: AtomicBool,
    completion: Completion,
    last_updated: Mutex<Instant>,
    fetch_requests: Counter,
    early_terminations: Counter,
}

#[derive(Default)]
struct ProducerCount {
    created: u64,
    finished: u64,
}

impl SinkInner {
    fn touch(&self) {
        *self.last_updated.lock() = Instant::now();
    }

    fn on_reported_finished(&self) {
        if !self.reported_finished.swap(true, Ordering::AcqRel) {
            debug!(exchange_id = %self.exchange_id, "exchange sink reported finished");
        }
        self.completion.complete(Ok(()));
    }

    fn on_producer_finished(&self) {
        let all_done = {
            let mut p = self.producers.lock();
            p.finished += 1;
            p.finished == p.created
        };
        if all_done {
            self.buffer.finish();
        }
    }
}

/// Serves pages from a local buffer to any number of fetch requests.
///
/// Cloning yields another handle to the same handler.
#[derive(Clone)]
pub struct ExchangeSinkHandler {
    inner: Arc<SinkInner>,
}

impl std::fmt::Debug for ExchangeSinkHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeSinkHandler")
            .field("exchange_id", &self.inner.exchange_id)
            .finish_non_exhaustive()
    }
}

impl ExchangeSinkHandler {
    /// Create a handler whose buffer is bounded by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::InvalidConfig`] if `config` does not validate.
    pub fn new(exchange_id: impl Into<String>, config: &ExchangeConfig) -> Result<Self> {
        let exchange_id = exchange_id.into();
        let buffer = ExchangeBuffer::new(format!("sink:{exchange_id}"), config)?;
        Ok(Self {
            inner: Arc::new(SinkInner {
                exchange_id,
                buffer,
                producers: Mutex::new(ProducerCount::default()),
                reported_finished: AtomicBool::new(false),
                completion: Completion::new(),
                last_updated: Mutex::new(Instant::now()),
                fetch_requests: Counter::default(),
                early_terminations: Counter::default(),
            }),
        })
    }

    pub fn exchange_id(&self) -> &str {
        &self.inner.exchange_id
    }

    /// Register one more local producer. The buffer finishes once every
    /// producer created here has finished.
    #[must_use]
    pub fn create_exchange_sink(&self) -> ExchangeSink {
        self.inner.producers.lock().created += 1;
        ExchangeSink {
            inner: Arc::clone(&self.inner),
            finished: AtomicBool::new(false),
        }
    }

    /// Mark the buffer finished regardless of outstanding producers.
    pub fn finish(&self) {
        self.inner.buffer.finish();
    }

    /// Record a producer fault. Buffered pages are released, and every
    /// pending and future fetch receives `err`.
    pub fn on_failure(&self, err: ExchangeError) {
        if self.inner.buffer.fail(err.clone()) {
            self.inner.completion.complete(Err(err));
        }
    }

    /// Cancel the producing side: buffered pages are released now and every
    /// pending and future fetch is answered `finished` with no page.
    pub fn cancel(&self) {
        let released = self.inner.buffer.close();
        debug!(exchange_id = %self.inner.exchange_id, released, "exchange sink cancelled");
    }

    /// Parked fetches waiting for a page.
    #[must_use]
    pub fn pending_fetches(&self) -> usize {
        self.inner.buffer.pending_listeners()
    }

    /// Run `listener` once this sink has answered `finished`, was terminated
    /// early, or failed.
    pub fn add_completion_listener(&self, listener: CompletionListener) {
        self.inner.completion.add_listener(listener);
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.completion.outcome().is_some()
    }

    /// Finished and drained.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.buffer.is_finished()
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.inner.buffer.size() > 0
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer.size()
    }

    /// Time since a fetch request last arrived or was answered.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.inner.last_updated.lock())
    }

    #[must_use]
    pub fn status(&self) -> ExchangeSinkStatus {
        let p = self.inner.producers.lock();
        ExchangeSinkStatus {
            exchange_id: self.inner.exchange_id.clone(),
            buffer: self.inner.buffer.stats(),
            fetch_requests: self.inner.fetch_requests.get(),
            early_terminations: self.inner.early_terminations.get(),
            pending_fetches: self.pending_fetches() as u64,
            producers: p.created,
            finished_producers: p.finished,
            completed: self.is_completed(),
        }
    }

    fn terminate_early(&self, listener: ResponseListener) {
        let inner = &self.inner;
        inner.early_terminations.incr();
        let released = inner.buffer.close();
        debug!(exchange_id = %inner.exchange_id, released, "exchange sink terminated early");
        inner.on_reported_finished();
        listener(Ok(ExchangeResponse::finished()));
    }
}

impl RemoteSink for ExchangeSinkHandler {
    fn fetch_page_async(&self, all_sources_finished: bool, listener: ResponseListener) {
        let inner = &self.inner;
        inner.touch();
        inner.fetch_requests.incr();
        if all_sources_finished {
            self.terminate_early(listener);
            return;
        }
        let shared = Arc::clone(inner);
        // answering a parked fetch counts as activity too
        inner.buffer.poll_or_listen(Box::new(move |delivery| {
            shared.touch();
            match delivery {
                Delivery::Page { page, finished } => {
                    trace!(exchange_id = %shared.exchange_id, rows = page.row_count(), finished, "serving page");
                    if finished {
                        shared.on_reported_finished();
                    }
                    listener(Ok(ExchangeResponse::with_page(page, finished)));
                }
                Delivery::Finished => {
                    shared.on_reported_finished();
                    listener(Ok(ExchangeResponse::finished()));
                }
                Delivery::Failed(err) => listener(Err(err)),
            }
        }));
    }

    fn peer(&self) -> String {
        format!("local:{}", self.inner.exchange_id)
    }
}

/// A producer's handle on a sink handler's buffer.
///
/// Dropping an unfinished handle finishes it normally and leaves buffered
/// pages to be drained. A cancelled producer calls [`cancel`](Self::cancel)
/// or [`fail`](Self::fail) instead, which release them.
pub struct ExchangeSink {
    inner: Arc<SinkInner>,
    finished: AtomicBool,
}

impl ExchangeSink {
    /// Offer a page; see [`ExchangeBuffer::add_page`].
    ///
    /// # Errors
    ///
    /// [`ExchangeError::Closed`] once the exchange stopped accepting pages,
    /// [`ExchangeError::PageTooLarge`] if the page can never fit.
    pub fn add_page(&self, page: Page) -> Result<AddPage> {
        self.inner.buffer.add_page(page)
    }

    /// Offer a page, suspending this thread while the buffer is throttled.
    ///
    /// # Errors
    ///
    /// Same as [`add_page`](Self::add_page).
    pub fn add_page_blocking(&self, page: Page) -> Result<()> {
        self.inner.buffer.add_page_blocking(page)
    }

    /// Offer a page, waiting at most `timeout` for room.
    ///
    /// # Errors
    ///
    /// Same as [`add_page`](Self::add_page).
    pub fn add_page_timeout(&self, page: Page, timeout: Duration) -> Result<AddPage> {
        self.inner.buffer.add_page_timeout(page, timeout)
    }

    /// Run `listener` when the buffer can take pages again.
    pub fn on_space_available(&self, listener: SpaceListener) {
        self.inner.buffer.on_space_available(listener);
    }

    /// True once producing is pointless: every consumer is gone or the exchange failed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.inner.buffer.no_more_inputs()
    }

    /// Declare this producer done. Idempotent.
    pub fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.inner.on_producer_finished();
        }
    }

    /// Cancel the whole exchange from the producing side; see
    /// [`ExchangeSinkHandler::cancel`].
    pub fn cancel(&self) {
        ExchangeSinkHandler {
            inner: Arc::clone(&self.inner),
        }
        .cancel();
        self.finish();
    }

    /// Record a producer fault on the whole exchange.
    pub fn fail(&self, err: ExchangeError) {
        ExchangeSinkHandler {
            inner: Arc::clone(&self.inner),
        }
        .on_failure(err);
        self.finish();
    }
}

impl Drop for ExchangeSink {
    fn drop(&mut self) {
        self.finish();
    }
}
