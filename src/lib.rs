//! # Ironexchange
//!
//! The **exchange layer** of a distributed query engine: bounded, pull-based
//! movement of column pages from producer pipelines to consumer pipelines,
//! either inside one process or across nodes.
//!
//! ## Key Features
//!
//! - **Bounded buffers** - capacity in rows and/or bytes, with low-water hysteresis
//! - **Backpressure without loss** - a full buffer hands the page back instead of dropping it
//! - **Pull-based fetching** - at most one request in flight per peer, only while there is room
//! - **Early termination** - a consumer that needs no more data releases every upstream buffer
//! - **Exactly-once release** - every page reference is freed once, on every path
//! - **Pluggable transport** - one-method [`RemoteSink`] contract; in-process and RPC sinks share it
//!
//! ## Quick Start
//!
//! ```
//! use ironexchange::*;
//! use ironexchange::testing::{drain_source, int_page};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ExchangeConfig::with_row_capacity(64);
//! let tracker = PageTracker::new("quick-start");
//!
//! // producer side
//! let sink_handler = ExchangeSinkHandler::new("stage-1", &config)?;
//! let sink = sink_handler.create_exchange_sink();
//!
//! // consumer side, pulling from the sink handler directly
//! let source_handler = ExchangeSourceHandler::new("stage-1", &config)?;
//! source_handler.add_remote_sink(Arc::new(sink_handler.clone()))?;
//! source_handler.no_more_sinks();
//! let source = source_handler.create_exchange_source();
//!
//! for chunk in 0..4 {
//!     sink.add_page_blocking(int_page(&tracker, chunk * 8..(chunk + 1) * 8))?;
//! }
//! sink.finish();
//!
//! let pages = drain_source(&source, Duration::from_secs(5))?;
//! assert_eq!(pages.iter().map(Page::row_count).sum::<usize>(), 32);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Page
//!
//! A [`Page`] is an immutable, reference-counted batch of columns. Moving a
//! page transfers its reference; a [`PageTracker`] proves each page was freed
//! exactly once.
//!
//! ### Exchange Buffer
//!
//! An [`ExchangeBuffer`] is the bounded FIFO between producers and consumers.
//! It signals "has room" and "has data" through one-shot listeners, and
//! supports finish, fail and close.
//!
//! ### Sink and Source Handlers
//!
//! - [`ExchangeSinkHandler`] - producer side; answers fetch requests from its buffer
//! - [`ExchangeSourceHandler`] - consumer side; runs one fetcher per registered peer
//!
//! ### Remote Exchange (feature: `remote`)
//!
//! [`codec`] defines the wire form of requests, pages and replies.
//! [`service::ExchangeService`] serves local sinks to remote fetchers, and
//! [`service::RemoteExchangeSink`] reaches them over any
//! [`service::ExchangeTransport`].
//!
//! ## Logging
//!
//! Lifecycle transitions (finish, close, early termination, failure) are
//! logged at `debug` through [`tracing`]; per-page events at `trace`. The
//! crate never installs a subscriber.
//!
//! ## Module Overview
//!
//! - [`page`] - pages, blocks and release tracking
//! - [`buffer`] - the bounded exchange buffer
//! - [`response`] - the fetch reply envelope
//! - [`remote_sink`] - the fetch contract and its close handshake
//! - [`sink`] - producer-side handler
//! - [`source`] - consumer-side handler and fetchers
//! - [`config`] - capacity and lifecycle settings
//! - [`error`] - error taxonomy
//! - [`metrics`] - counters and status snapshots
//! - [`testing`] - fixtures for tests

pub mod buffer;
#[cfg(feature = "remote")]
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod page;
pub mod remote_sink;
pub mod response;
#[cfg(feature = "remote")]
pub mod service;
pub mod sink;
pub mod source;
pub mod testing;

// General re-exports
pub use buffer::{AddPage, Delivery, ExchangeBuffer};
pub use config::ExchangeConfig;
pub use error::{ExchangeError, Result};
pub use metrics::{BufferStats, ExchangeSinkStatus, ExchangeSourceStatus, StatusReport};
pub use page::{Block, Page, PageTracker};
pub use remote_sink::{RemoteSink, RemoteSinkExt};
pub use response::ExchangeResponse;
pub use sink::{ExchangeSink, ExchangeSinkHandler};
pub use source::{ExchangeSource, ExchangeSourceHandler};

// Gated re-exports
#[cfg(feature = "remote")]
pub use service::{ExchangeService, ExchangeTransport, InMemoryTransport, RemoteExchangeSink};
