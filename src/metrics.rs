//! Counters and status snapshots for buffers and handlers.
//!
//! Handlers keep their counters in atomics (or under the buffer lock) and
//! expose an owned, serializable snapshot. Snapshots can be rendered as JSON,
//! printed, or written to a file for a collaborator to pick up.
//!
//! ```
//! use ironexchange::config::ExchangeConfig;
//! use ironexchange::metrics::StatusReport;
//! use ironexchange::sink::ExchangeSinkHandler;
//!
//! let handler = ExchangeSinkHandler::new("ex-1", &ExchangeConfig::with_row_capacity(16)).unwrap();
//! let status = handler.status();
//! assert_eq!(status.to_json()["exchange_id"], "ex-1");
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by an [`ExchangeBuffer`](crate::buffer::ExchangeBuffer).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    pub pages_added: u64,
    pub rows_added: u64,
    pub pages_emitted: u64,
    /// Pages released without being consumed (close, fail, early termination).
    pub pages_discarded: u64,
    /// Transitions into the throttled state.
    pub backpressure_events: u64,
    pub peak_rows: u64,
    pub buffered_pages: u64,
}

/// Snapshot of a sink handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSinkStatus {
    pub exchange_id: String,
    pub buffer: BufferStats,
    pub fetch_requests: u64,
    pub early_terminations: u64,
    pub pending_fetches: u64,
    pub producers: u64,
    pub finished_producers: u64,
    pub completed: bool,
}

/// Snapshot of a source handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSourceStatus {
    pub exchange_id: String,
    pub buffer: BufferStats,
    pub fetchers: u64,
    pub finished_fetchers: u64,
    pub fetch_requests: u64,
    pub pages_received: u64,
    pub rows_received: u64,
    pub consumers: u64,
    pub completed: bool,
}

/// Rendering shared by every status snapshot.
pub trait StatusReport: Serialize {
    /// Title used by [`print`](Self::print).
    fn title(&self) -> String;

    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn print(&self) {
        println!("\n========== {} ==========", self.title());
        if let Value::Object(map) = self.to_json() {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            for k in keys {
                println!("{k}: {}", map[&k]);
            }
        }
        println!("======================================\n");
    }

    /// Write the snapshot as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written to.
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()>
    where
        Self: Sized,
    {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

impl StatusReport for ExchangeSinkStatus {
    fn title(&self) -> String {
        format!("Exchange Sink {}", self.exchange_id)
    }
}

impl StatusReport for ExchangeSourceStatus {
    fn title(&self) -> String {
        format!("Exchange Source {}", self.exchange_id)
    }
}

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn incr(&self) {
        self.add(1);
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
