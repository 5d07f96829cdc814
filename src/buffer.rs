//! Bounded FIFO of pages shared by producers and consumers.
//!
//! All state (queue, outstanding size, finished/closed/failed flags and both
//! listener queues) sits behind one mutex, so enqueue, dequeue, finish and
//! close are serialized and page references are only dropped under that lock.
//! Listeners are always invoked after the lock is released, possibly on the
//! caller's thread, so they may re-enter the buffer.
//!
//! Capacity uses hysteresis. The buffer becomes *throttled* when a page does
//! not fit, or when someone registers for space while it is full. It stays
//! throttled until outstanding rows and bytes fall to the low-water mark. An
//! empty buffer is always below the mark, so a throttled producer is always
//! woken eventually.

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::metrics::BufferStats;
use crate::page::Page;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Outcome of offering a page.
#[derive(Debug)]
#[must_use]
pub enum AddPage {
    /// The page is owned by the buffer (or was handed straight to a waiting listener).
    Accepted,
    /// The buffer is at capacity; the page is handed back so it is never dropped silently.
    Full(Page),
}

impl AddPage {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, AddPage::Accepted)
    }
}

/// What a registered page listener eventually receives.
#[derive(Debug)]
pub enum Delivery {
    /// Head page; `finished` is true when the buffer is now drained and finished.
    Page { page: Page, finished: bool },
    /// Drained and finished: no page now or ever.
    Finished,
    /// The buffer was failed by its producer.
    Failed(ExchangeError),
}

pub type PageListener = Box<dyn FnOnce(Delivery) + Send>;
pub type SpaceListener = Box<dyn FnOnce() + Send>;

struct BufferState {
    pages: VecDeque<Page>,
    rows: usize,
    bytes: usize,
    finished: bool,
    closed: bool,
    failure: Option<ExchangeError>,
    throttled: bool,
    page_listeners: VecDeque<PageListener>,
    space_listeners: VecDeque<SpaceListener>,
    stats: BufferStats,
}

enum Offer {
    Queued,
    Handoff(PageListener, Page),
    Full(Page),
}

/// A bounded, thread-safe page queue.
pub struct ExchangeBuffer {
    label: String,
    max_rows: Option<usize>,
    max_bytes: Option<usize>,
    low_rows: Option<usize>,
    low_bytes: Option<usize>,
    state: Mutex<BufferState>,
    data_cv: Condvar,
    space_cv: Condvar,
}

impl ExchangeBuffer {
    /// Create a buffer with the capacity from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::InvalidConfig`] if `config` does not validate.
    pub fn new(label: impl Into<String>, config: &ExchangeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            label: label.into(),
            max_rows: config.max_buffer_rows,
            max_bytes: config.max_buffer_bytes,
            low_rows: config.low_water_rows(),
            low_bytes: config.low_water_bytes(),
            state: Mutex::new(BufferState {
                pages: VecDeque::new(),
                rows: 0,
                bytes: 0,
                finished: false,
                closed: false,
                failure: None,
                throttled: false,
                page_listeners: VecDeque::new(),
                space_listeners: VecDeque::new(),
                stats: BufferStats::default(),
            }),
            data_cv: Condvar::new(),
            space_cv: Condvar::new(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn too_large(&self, page: &Page) -> bool {
        self.max_rows.is_some_and(|m| page.row_count() > m)
            || self.max_bytes.is_some_and(|m| page.estimated_bytes() > m)
    }

    fn fits(&self, st: &BufferState, page: &Page) -> bool {
        self.max_rows.is_none_or(|m| st.rows + page.row_count() <= m)
            && self.max_bytes.is_none_or(|m| st.bytes + page.estimated_bytes() <= m)
    }

    fn at_capacity(&self, st: &BufferState) -> bool {
        self.max_rows.is_some_and(|m| st.rows >= m) || self.max_bytes.is_some_and(|m| st.bytes >= m)
    }

    fn below_low_water(&self, st: &BufferState) -> bool {
        self.low_rows.is_none_or(|m| st.rows <= m) && self.low_bytes.is_none_or(|m| st.bytes <= m)
    }

    fn offer(&self, st: &mut BufferState, page: Page) -> Result<Offer> {
        if st.finished || st.closed || st.failure.is_some() {
            return Err(ExchangeError::Closed);
        }
        if self.too_large(&page) {
            return Err(ExchangeError::PageTooLarge {
                rows: page.row_count(),
                bytes: page.estimated_bytes(),
            });
        }
        // listeners only wait on an empty buffer, so a handoff never bypasses queued pages
        if let Some(listener) = st.page_listeners.pop_front() {
            st.stats.pages_added += 1;
            st.stats.rows_added += page.row_count() as u64;
            st.stats.pages_emitted += 1;
            return Ok(Offer::Handoff(listener, page));
        }
        if st.throttled || !self.fits(st, &page) {
            if !st.throttled {
                st.stats.backpressure_events += 1;
            }
            st.throttled = true;
            return Ok(Offer::Full(page));
        }
        st.stats.pages_added += 1;
        st.stats.rows_added += page.row_count() as u64;
        st.rows += page.row_count();
        st.bytes += page.estimated_bytes();
        st.stats.peak_rows = st.stats.peak_rows.max(st.rows as u64);
        st.pages.push_back(page);
        self.data_cv.notify_one();
        Ok(Offer::Queued)
    }

    /// Append `page` at the tail.
    ///
    /// Wakes the oldest waiting page listener, if any, by handing it the page
    /// directly. Returns [`AddPage::Full`] with the page when the buffer is
    /// throttled; the caller must pause and retry, for example from
    /// [`on_space_available`](Self::on_space_available).
    ///
    /// # Errors
    ///
    /// [`ExchangeError::Closed`] if the buffer was finished, failed or closed
    /// (the page is released), [`ExchangeError::PageTooLarge`] if it can never fit.
    pub fn add_page(&self, page: Page) -> Result<AddPage> {
        let mut st = self.state.lock();
        match self.offer(&mut st, page)? {
            Offer::Queued => {
                trace!(buffer = %self.label, rows = st.rows, "page queued");
                Ok(AddPage::Accepted)
            }
            Offer::Handoff(listener, page) => {
                drop(st);
                listener(Delivery::Page { page, finished: false });
                Ok(AddPage::Accepted)
            }
            Offer::Full(page) => Ok(AddPage::Full(page)),
        }
    }

    /// Like [`add_page`](Self::add_page) but suspends the calling thread while
    /// the buffer is throttled, up to `timeout`. Returns [`AddPage::Full`] only
    /// if the timeout elapses.
    ///
    /// # Errors
    ///
    /// Same as [`add_page`](Self::add_page).
    pub fn add_page_timeout(&self, page: Page, timeout: Duration) -> Result<AddPage> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        let mut page = page;
        loop {
            match self.offer(&mut st, page)? {
                Offer::Queued => return Ok(AddPage::Accepted),
                Offer::Handoff(listener, p) => {
                    drop(st);
                    listener(Delivery::Page { page: p, finished: false });
                    return Ok(AddPage::Accepted);
                }
                Offer::Full(p) => {
                    page = p;
                    if self.space_cv.wait_until(&mut st, deadline).timed_out() {
                        return match self.offer(&mut st, page)? {
                            Offer::Queued => Ok(AddPage::Accepted),
                            Offer::Handoff(listener, p) => {
                                drop(st);
                                listener(Delivery::Page { page: p, finished: false });
                                Ok(AddPage::Accepted)
                            }
                            Offer::Full(p) => Ok(AddPage::Full(p)),
                        };
                    }
                }
            }
        }
    }

    /// Block until the page is accepted or the buffer stops accepting pages.
    ///
    /// # Errors
    ///
    /// Same as [`add_page`](Self::add_page).
    pub fn add_page_blocking(&self, page: Page) -> Result<()> {
        let mut st = self.state.lock();
        let mut page = page;
        loop {
            match self.offer(&mut st, page)? {
                Offer::Queued => return Ok(()),
                Offer::Handoff(listener, p) => {
                    drop(st);
                    listener(Delivery::Page { page: p, finished: false });
                    return Ok(());
                }
                Offer::Full(p) => {
                    page = p;
                    self.space_cv.wait(&mut st);
                }
            }
        }
    }

    fn take_head(&self, st: &mut BufferState) -> Option<(Page, Vec<SpaceListener>)> {
        let page = st.pages.pop_front()?;
        st.rows -= page.row_count();
        st.bytes -= page.estimated_bytes();
        st.stats.pages_emitted += 1;
        let mut woken = Vec::new();
        if st.throttled && self.below_low_water(st) {
            st.throttled = false;
            woken.extend(st.space_listeners.drain(..));
            self.space_cv.notify_all();
        }
        Some((page, woken))
    }

    /// Remove and return the head page, or `None` when empty. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns the producer's error once the buffer has been failed.
    pub fn poll_page(&self) -> Result<Option<Page>> {
        let mut st = self.state.lock();
        if let Some(err) = &st.failure {
            return Err(err.clone());
        }
        let Some((page, woken)) = self.take_head(&mut st) else {
            return Ok(None);
        };
        drop(st);
        woken.into_iter().for_each(|l| l());
        Ok(Some(page))
    }

    /// Wait up to `timeout` for a page. `None` means finished or timed out;
    /// check [`is_finished`](Self::is_finished) to tell them apart.
    ///
    /// # Errors
    ///
    /// Returns the producer's error once the buffer has been failed.
    pub fn wait_for_page(&self, timeout: Duration) -> Result<Option<Page>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if let Some(err) = &st.failure {
                return Err(err.clone());
            }
            if let Some((page, woken)) = self.take_head(&mut st) {
                drop(st);
                woken.into_iter().for_each(|l| l());
                return Ok(Some(page));
            }
            if st.finished || self.data_cv.wait_until(&mut st, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    /// Deliver the head page to `listener`, or queue the listener until a page
    /// arrives or the buffer finishes. Listeners are served in registration order.
    pub fn poll_or_listen(&self, listener: PageListener) {
        let mut st = self.state.lock();
        if let Some(err) = st.failure.clone() {
            drop(st);
            listener(Delivery::Failed(err));
            return;
        }
        if let Some((page, woken)) = self.take_head(&mut st) {
            let finished = st.finished && st.pages.is_empty();
            drop(st);
            woken.into_iter().for_each(|l| l());
            listener(Delivery::Page { page, finished });
            return;
        }
        if st.finished {
            drop(st);
            listener(Delivery::Finished);
            return;
        }
        st.page_listeners.push_back(listener);
    }

    /// Run `listener` once the buffer has room again, or immediately if it has
    /// room now or no longer accepts pages.
    pub fn on_space_available(&self, listener: SpaceListener) {
        let mut st = self.state.lock();
        if st.finished || st.closed || (!st.throttled && !self.at_capacity(&st)) {
            drop(st);
            listener();
            return;
        }
        st.throttled = true;
        st.space_listeners.push_back(listener);
    }

    /// Mark that no more pages will be added. Idempotent: only the first call
    /// wakes waiters; returns whether this call made the transition.
    pub fn finish(&self) -> bool {
        let mut st = self.state.lock();
        if st.finished {
            return false;
        }
        st.finished = true;
        debug!(buffer = %self.label, buffered = st.pages.len(), "exchange buffer finished");
        self.wake_terminal(st);
        true
    }

    /// Record a producer failure: buffered pages are released and every
    /// pending and future listener receives `err`. Returns false if the buffer
    /// was already failed or closed.
    pub fn fail(&self, err: ExchangeError) -> bool {
        let mut st = self.state.lock();
        if st.closed || st.failure.is_some() {
            return false;
        }
        debug!(buffer = %self.label, error = %err, released = st.pages.len(), "exchange buffer failed");
        st.failure = Some(err);
        st.finished = true;
        Self::discard_locked(&mut st);
        self.wake_terminal(st);
        true
    }

    /// Release every buffered page and enter the terminal closed state.
    /// Returns how many pages this call released; a second close releases none.
    pub fn close(&self) -> usize {
        let mut st = self.state.lock();
        if st.closed {
            return 0;
        }
        st.closed = true;
        st.finished = true;
        let released = Self::discard_locked(&mut st);
        debug!(buffer = %self.label, released, "exchange buffer closed");
        self.wake_terminal(st);
        released
    }

    fn discard_locked(st: &mut BufferState) -> usize {
        let n = st.pages.len();
        st.pages.clear();
        st.rows = 0;
        st.bytes = 0;
        st.stats.pages_discarded += n as u64;
        n
    }

    fn wake_terminal(&self, mut st: MutexGuard<'_, BufferState>) {
        let listeners: Vec<PageListener> = if st.pages.is_empty() {
            st.page_listeners.drain(..).collect()
        } else {
            Vec::new()
        };
        let spaces: Vec<SpaceListener> = st.space_listeners.drain(..).collect();
        st.throttled = false;
        let failure = st.failure.clone();
        self.data_cv.notify_all();
        self.space_cv.notify_all();
        drop(st);
        for l in listeners {
            match &failure {
                Some(err) => l(Delivery::Failed(err.clone())),
                None => l(Delivery::Finished),
            }
        }
        spaces.into_iter().for_each(|l| l());
    }

    /// Finished and drained: no page will ever be returned again.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let st = self.state.lock();
        st.finished && st.pages.is_empty()
    }

    /// True once [`finish`](Self::finish), [`fail`](Self::fail) or
    /// [`close`](Self::close) ran, even if pages remain to drain.
    #[must_use]
    pub fn no_more_inputs(&self) -> bool {
        self.state.lock().finished
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn failure(&self) -> Option<ExchangeError> {
        self.state.lock().failure.clone()
    }

    /// Whether a fetcher may request more data without overrunning the buffer.
    #[must_use]
    pub fn has_space(&self) -> bool {
        let st = self.state.lock();
        !st.throttled && !self.at_capacity(&st)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.state.lock().pages.len()
    }

    #[must_use]
    pub fn outstanding_rows(&self) -> usize {
        self.state.lock().rows
    }

    #[must_use]
    pub fn outstanding_bytes(&self) -> usize {
        self.state.lock().bytes
    }

    #[must_use]
    pub fn pending_listeners(&self) -> usize {
        self.state.lock().page_listeners.len()
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let st = self.state.lock();
        BufferStats {
            buffered_pages: st.pages.len() as u64,
            ..st.stats.clone()
        }
    }
}
