//! Testing utilities for exchange pipelines.
//!
//! Fixtures and assertions used by this crate's own tests, exported so that
//! callers wiring exchanges into their operators can test the same way:
//!
//! - **Page builders**: [`int_page`] and [`page_values`]
//! - **Listener capture**: [`ResponseCollector`] records fetch replies from any thread
//! - **Scripted peers**: [`ScriptedRemoteSink`] answers fetches from a fixed script
//! - **Draining and waiting**: [`drain_source`], [`wait_until`]
//! - **Leak checks**: [`assert_all_released`]
//!
//! ```
//! use ironexchange::page::PageTracker;
//! use ironexchange::testing::*;
//!
//! let tracker = PageTracker::new("doc");
//! let page = int_page(&tracker, 0..4);
//! assert_eq!(page_values(&page), vec![0, 1, 2, 3]);
//! drop(page);
//! assert_all_released(&tracker, std::time::Duration::from_millis(10));
//! ```

use crate::error::{ExchangeError, Result};
use crate::page::{Block, Page, PageTracker};
use crate::remote_sink::{RemoteSink, ResponseListener};
use crate::response::ExchangeResponse;
use crate::source::ExchangeSource;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Build a tracked single-column `Int64` page holding `values`.
///
/// # Panics
///
/// Panics if `values` is empty.
pub fn int_page(tracker: &Arc<PageTracker>, values: impl IntoIterator<Item = i64>) -> Page {
    let values: Vec<i64> = values.into_iter().collect();
    Page::tracked(vec![Block::Int64(values)], tracker)
        .unwrap_or_else(|e| panic!("fixture page rejected: {e}"))
}

/// The first column of `page` as `i64`s; empty if it is not an `Int64` block.
#[must_use]
pub fn page_values(page: &Page) -> Vec<i64> {
    match page.block(0) {
        Some(Block::Int64(v)) => v.clone(),
        _ => Vec::new(),
    }
}

/// Poll `cond` until it holds or `timeout` elapses. Returns the last result.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Assert that every page allocated through `tracker` was released, waiting
/// up to `timeout` for in-flight handoffs to settle.
///
/// # Panics
///
/// Panics if pages are still alive after `timeout`.
pub fn assert_all_released(tracker: &PageTracker, timeout: Duration) {
    let settled = wait_until(timeout, || tracker.live_pages() == 0);
    assert!(
        settled,
        "page leak in {}:\n  allocated: {}\n  released: {}\n  live: {}",
        tracker.label(),
        tracker.allocated_pages(),
        tracker.released_pages(),
        tracker.live_pages()
    );
}

/// Consume every page from `source` until it finishes.
///
/// # Errors
///
/// Returns the exchange's failure, or [`ExchangeError::Cancelled`] if the
/// source did not finish within `timeout`.
pub fn drain_source(source: &ExchangeSource, timeout: Duration) -> Result<Vec<Page>> {
    let deadline = Instant::now() + timeout;
    let mut pages = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Some(page) = source.wait_for_page(remaining.min(Duration::from_millis(50)))? {
            pages.push(page);
            continue;
        }
        if source.is_finished() {
            return Ok(pages);
        }
        if remaining.is_zero() {
            return Err(ExchangeError::Cancelled(format!(
                "source not finished after {timeout:?} ({} pages drained)",
                pages.len()
            )));
        }
    }
}

/// Captures fetch replies delivered on any thread.
#[derive(Clone, Default)]
pub struct ResponseCollector {
    inner: Arc<(Mutex<Vec<Result<ExchangeResponse>>>, Condvar)>,
}

impl ResponseCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener that appends its reply to this collector.
    #[must_use]
    pub fn listener(&self) -> ResponseListener {
        let inner = Arc::clone(&self.inner);
        Box::new(move |res| {
            let (lock, cv) = &*inner;
            lock.lock().push(res);
            cv.notify_all();
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.0.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until at least `n` replies arrived; false on timeout.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cv) = &*self.inner;
        let mut replies = lock.lock();
        while replies.len() < n {
            if cv.wait_until(&mut replies, deadline).timed_out() {
                return replies.len() >= n;
            }
        }
        true
    }

    /// Remove and return everything captured so far, in arrival order.
    pub fn take(&self) -> Vec<Result<ExchangeResponse>> {
        std::mem::take(&mut *self.inner.0.lock())
    }
}

/// A peer that answers normal fetches from a fixed script, then `finished`.
///
/// Close requests (`all_sources_finished == true`) are counted and answered
/// `finished` unless [`fail_close`](Self::fail_close) is set. Useful to
/// inject transport faults and protocol edge cases into a source handler.
pub struct ScriptedRemoteSink {
    script: Mutex<VecDeque<Result<ExchangeResponse>>>,
    fetches: AtomicUsize,
    closes: AtomicUsize,
    close_error: Mutex<Option<ExchangeError>>,
}

impl ScriptedRemoteSink {
    pub fn new(script: impl IntoIterator<Item = Result<ExchangeResponse>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fetches: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            close_error: Mutex::new(None),
        })
    }

    /// A peer with nothing to send: the first fetch is answered `finished`.
    pub fn finished() -> Arc<Self> {
        Self::new(Vec::<Result<ExchangeResponse>>::new())
    }

    /// Answer every close request with `err`.
    pub fn fail_close(&self, err: ExchangeError) {
        *self.close_error.lock() = Some(err);
    }

    /// Normal fetch requests received.
    #[must_use]
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Acquire)
    }

    /// Close requests received.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    /// Script entries not yet served.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

impl RemoteSink for ScriptedRemoteSink {
    fn fetch_page_async(&self, all_sources_finished: bool, listener: ResponseListener) {
        if all_sources_finished {
            self.closes.fetch_add(1, Ordering::AcqRel);
            let reply = match self.close_error.lock().clone() {
                Some(err) => Err(err),
                None => Ok(ExchangeResponse::finished()),
            };
            listener(reply);
            return;
        }
        self.fetches.fetch_add(1, Ordering::AcqRel);
        let next = self.script.lock().pop_front();
        listener(next.unwrap_or_else(|| Ok(ExchangeResponse::finished())));
    }

    fn peer(&self) -> String {
        "scripted".to_string()
    }
}
