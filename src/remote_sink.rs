//! The one-method transport contract.
//!
//! Anything that can answer "give me the next page, and here is whether I may
//! stop early" asynchronously can feed a source handler. An in-process
//! [`ExchangeSinkHandler`](crate::sink::ExchangeSinkHandler) implements it by
//! direct call, and [`RemoteExchangeSink`](crate::service::RemoteExchangeSink)
//! implements it as an RPC round trip. Both share the fetcher state machine
//! in [`source`](crate::source).
//!
//! `close` is not part of the trait. It is provided for every implementor by
//! [`RemoteSinkExt`] and is built purely on `fetch_page_async(true, ..)`.

use crate::error::Result;
use crate::response::ExchangeResponse;
use std::sync::Arc;

/// Receives exactly one reply per fetch request, on any thread.
pub type ResponseListener = Box<dyn FnOnce(Result<ExchangeResponse>) + Send>;

/// Receives the acknowledgement of a close handshake.
pub type CloseListener = Box<dyn FnOnce(Result<()>) + Send>;

/// Asynchronous page fetch contract between a fetcher and one peer sink.
pub trait RemoteSink: Send + Sync {
    /// Request the next page.
    ///
    /// With `all_sources_finished == true` the caller declares it needs no more
    /// data; the sink must terminate, release what it buffers, and answer with
    /// `finished == true`. Implementations may invoke `listener` before
    /// returning, or later from another thread, but exactly once.
    fn fetch_page_async(&self, all_sources_finished: bool, listener: ResponseListener);

    /// Human-readable peer name used in logs and transport errors.
    fn peer(&self) -> String {
        "local".to_string()
    }
}

impl<T: RemoteSink + ?Sized> RemoteSink for Arc<T> {
    fn fetch_page_async(&self, all_sources_finished: bool, listener: ResponseListener) {
        (**self).fetch_page_async(all_sources_finished, listener);
    }

    fn peer(&self) -> String {
        (**self).peer()
    }
}

/// Provided operations layered on [`RemoteSink`]; implemented for every sink.
pub trait RemoteSinkExt: RemoteSink {
    /// Terminate the peer sink and release any page it answers with.
    ///
    /// The page (if any) is released before `listener` is invoked.
    fn close(&self, listener: CloseListener) {
        self.fetch_page_async(
            true,
            Box::new(move |res| match res {
                Ok(resp) => {
                    resp.close();
                    listener(Ok(()));
                }
                Err(e) => listener(Err(e)),
            }),
        );
    }
}

impl<T: RemoteSink + ?Sized> RemoteSinkExt for T {}
