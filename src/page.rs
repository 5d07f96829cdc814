//! Immutable, reference-counted batches of columnar rows.
//!
//! A [`Page`] is a cheap handle over shared column storage. Cloning a page
//! retains one more reference; dropping a handle releases it. The storage is
//! freed, and its [`PageTracker`] credited, exactly once: when the last
//! handle goes away. Moving a page into a buffer, a response or a listener is
//! an ownership transfer, so every handoff either keeps or gives away its
//! reference and can never do both.

use crate::error::{ExchangeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One column of a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Block {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Boolean(Vec<bool>),
    Utf8(Vec<String>),
}

impl Block {
    /// Number of positions in this column.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Block::Int64(v) => v.len(),
            Block::Float64(v) => v.len(),
            Block::Boolean(v) => v.len(),
            Block::Utf8(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rough in-memory footprint used for byte-based buffer budgets.
    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        match self {
            Block::Int64(v) => v.len() * size_of::<i64>(),
            Block::Float64(v) => v.len() * size_of::<f64>(),
            Block::Boolean(v) => v.len(),
            // payload plus one 4-byte offset per value
            Block::Utf8(v) => v.iter().map(|s| s.len() + 4).sum(),
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Block::Int64(_) => "int64",
            Block::Float64(_) => "float64",
            Block::Boolean(_) => "boolean",
            Block::Utf8(_) => "utf8",
        }
    }
}

/// Accounts for page allocations and releases.
///
/// Handlers on both sides of an exchange share one tracker per memory pool.
/// Tests use it to prove that every page was released exactly once.
#[derive(Debug)]
pub struct PageTracker {
    label: String,
    allocated_pages: AtomicU64,
    released_pages: AtomicU64,
    allocated_bytes: AtomicU64,
    released_bytes: AtomicU64,
}

impl PageTracker {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            allocated_pages: AtomicU64::new(0),
            released_pages: AtomicU64::new(0),
            allocated_bytes: AtomicU64::new(0),
            released_bytes: AtomicU64::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn on_allocate(&self, bytes: usize) {
        self.allocated_pages.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn on_release(&self, bytes: usize) {
        self.released_pages.fetch_add(1, Ordering::AcqRel);
        self.released_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn allocated_pages(&self) -> u64 {
        self.allocated_pages.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn released_pages(&self) -> u64 {
        self.released_pages.load(Ordering::Acquire)
    }

    /// Pages allocated through this tracker that are still alive.
    #[must_use]
    pub fn live_pages(&self) -> u64 {
        self.allocated_pages()
            .saturating_sub(self.released_pages())
    }

    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.allocated_bytes
            .load(Ordering::Acquire)
            .saturating_sub(self.released_bytes.load(Ordering::Acquire))
    }
}

struct PageData {
    blocks: Vec<Block>,
    row_count: usize,
    bytes: usize,
    tracker: Option<Arc<PageTracker>>,
}

impl Drop for PageData {
    fn drop(&mut self) {
        if let Some(tracker) = &self.tracker {
            tracker.on_release(self.bytes);
        }
    }
}

/// An immutable batch of column data with a positive row count.
#[derive(Clone)]
pub struct Page {
    data: Arc<PageData>,
}

impl Page {
    /// Build an untracked page. All blocks must share one positive length.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::InvalidPage`] for an empty block list, empty
    /// blocks, or blocks of mismatched length.
    pub fn new(blocks: Vec<Block>) -> Result<Self> {
        Self::build(blocks, None)
    }

    /// Build a page whose release is credited to `tracker`.
    ///
    /// # Errors
    ///
    /// Same as [`Page::new`].
    pub fn tracked(blocks: Vec<Block>, tracker: &Arc<PageTracker>) -> Result<Self> {
        Self::build(blocks, Some(Arc::clone(tracker)))
    }

    fn build(blocks: Vec<Block>, tracker: Option<Arc<PageTracker>>) -> Result<Self> {
        let Some(first) = blocks.first() else {
            return Err(ExchangeError::InvalidPage("page has no blocks".into()));
        };
        let row_count = first.len();
        if row_count == 0 {
            return Err(ExchangeError::InvalidPage("page has zero rows".into()));
        }
        if let Some((idx, b)) = blocks.iter().enumerate().find(|(_, b)| b.len() != row_count) {
            return Err(ExchangeError::InvalidPage(format!(
                "block {idx} ({}) has {} positions, expected {row_count}",
                b.type_name(),
                b.len()
            )));
        }
        let bytes = blocks.iter().map(Block::estimated_bytes).sum();
        if let Some(t) = &tracker {
            t.on_allocate(bytes);
        }
        Ok(Self {
            data: Arc::new(PageData {
                blocks,
                row_count,
                bytes,
                tracker,
            }),
        })
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.data.row_count
    }

    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        self.data.bytes
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.data.blocks.len()
    }

    #[must_use]
    pub fn block(&self, idx: usize) -> Option<&Block> {
        self.data.blocks.get(idx)
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.data.blocks
    }

    /// Live handles sharing this page's storage.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Give up this handle's reference.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("rows", &self.data.row_count)
            .field("blocks", &self.data.blocks.len())
            .field("bytes", &self.data.bytes)
            .finish()
    }
}

impl PartialEq for Page {
    fn eq(&self, other: &Self) -> bool {
        self.data.blocks == other.data.blocks
    }
}
