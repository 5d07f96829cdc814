//! Reply envelope for a single fetch request.

use crate::page::Page;

/// An optional page plus the sink's `finished` flag.
///
/// `finished == true` means the sink has no more pages and never will. A
/// response without a page and with `finished == false` is never produced by
/// [`ExchangeSinkHandler`](crate::sink::ExchangeSinkHandler) (such requests are
/// parked until data or completion), but transports may send one.
#[derive(Debug)]
#[must_use]
pub struct ExchangeResponse {
    page: Option<Page>,
    finished: bool,
}

impl ExchangeResponse {
    pub fn new(page: Option<Page>, finished: bool) -> Self {
        Self { page, finished }
    }

    pub fn with_page(page: Page, finished: bool) -> Self {
        Self::new(Some(page), finished)
    }

    /// A terminal response carrying no page.
    pub fn finished() -> Self {
        Self::new(None, true)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn has_page(&self) -> bool {
        self.page.is_some()
    }

    #[must_use]
    pub fn page(&self) -> Option<&Page> {
        self.page.as_ref()
    }

    /// Move the page out; the caller now owns its reference.
    pub fn take_page(&mut self) -> Option<Page> {
        self.page.take()
    }

    /// Split into owned parts.
    pub fn into_parts(self) -> (Option<Page>, bool) {
        (self.page, self.finished)
    }

    /// Release the carried page, if any.
    pub fn close(self) {
        drop(self.page);
    }
}
