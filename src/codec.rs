//! Wire form of fetch requests, pages and replies.
//!
//! Encoding is `postcard`. A page travels as its row count, the encoded
//! blocks, and a SHA-256 digest of those bytes. Decoding verifies the digest
//! and the row count, then builds a fresh page that shares no storage with
//! the sender's.
//!
//! Ownership across the boundary: [`encode_reply`] consumes the response, so
//! the sender's page reference is released once its bytes exist. The
//! receiver's page is allocated by [`decode_reply`].

use crate::error::{ExchangeError, Result};
use crate::page::{Block, Page, PageTracker};
use crate::response::ExchangeResponse;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Bumped whenever the envelope layout changes.
pub const WIRE_VERSION: u8 = 1;

/// One fetch request as sent to an [`ExchangeService`](crate::service::ExchangeService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub exchange_id: String,
    pub all_sources_finished: bool,
}

#[derive(Serialize, Deserialize)]
struct WirePage {
    row_count: u64,
    payload: Vec<u8>,
    checksum: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
enum WireReply {
    Response { finished: bool, page: Option<WirePage> },
    Error(ExchangeError),
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u8,
    body: T,
}

fn codec_err(what: &str, e: impl std::fmt::Display) -> ExchangeError {
    ExchangeError::Codec(format!("{what}: {e}"))
}

fn checksum(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

fn to_bytes<T: Serialize>(what: &str, body: T) -> Result<Vec<u8>> {
    postcard::to_allocvec(&Envelope {
        version: WIRE_VERSION,
        body,
    })
    .map_err(|e| codec_err(what, e))
}

fn from_bytes<'a, T: Deserialize<'a>>(what: &str, bytes: &'a [u8]) -> Result<T> {
    let env: Envelope<T> = postcard::from_bytes(bytes).map_err(|e| codec_err(what, e))?;
    if env.version != WIRE_VERSION {
        return Err(ExchangeError::Codec(format!(
            "{what}: wire version {} not supported (expected {WIRE_VERSION})",
            env.version
        )));
    }
    Ok(env.body)
}

fn encode_wire_page(page: &Page) -> Result<WirePage> {
    let payload = postcard::to_allocvec(page.blocks()).map_err(|e| codec_err("encode page", e))?;
    Ok(WirePage {
        row_count: page.row_count() as u64,
        checksum: checksum(&payload),
        payload,
    })
}

fn decode_wire_page(wire: &WirePage, tracker: Option<&Arc<PageTracker>>) -> Result<Page> {
    if checksum(&wire.payload) != wire.checksum {
        return Err(ExchangeError::Codec("page checksum mismatch".into()));
    }
    let blocks: Vec<Block> =
        postcard::from_bytes(&wire.payload).map_err(|e| codec_err("decode page", e))?;
    let page = match tracker {
        Some(t) => Page::tracked(blocks, t)?,
        None => Page::new(blocks)?,
    };
    if page.row_count() as u64 != wire.row_count {
        return Err(ExchangeError::Codec(format!(
            "page row count {} does not match header {}",
            page.row_count(),
            wire.row_count
        )));
    }
    Ok(page)
}

/// Serialize a single page.
///
/// # Errors
///
/// Returns [`ExchangeError::Codec`] if encoding fails.
pub fn encode_page(page: &Page) -> Result<Vec<u8>> {
    to_bytes("encode page", encode_wire_page(page)?)
}

/// Deserialize a page into fresh storage.
///
/// # Errors
///
/// Returns [`ExchangeError::Codec`] on malformed bytes or a checksum mismatch.
pub fn decode_page(bytes: &[u8], tracker: Option<&Arc<PageTracker>>) -> Result<Page> {
    let wire: WirePage = from_bytes("decode page", bytes)?;
    decode_wire_page(&wire, tracker)
}

/// # Errors
///
/// Returns [`ExchangeError::Codec`] if encoding fails.
pub fn encode_request(req: &FetchRequest) -> Result<Vec<u8>> {
    to_bytes("encode request", req)
}

/// # Errors
///
/// Returns [`ExchangeError::Codec`] on malformed bytes.
pub fn decode_request(bytes: &[u8]) -> Result<FetchRequest> {
    from_bytes("decode request", bytes)
}

/// Serialize the outcome of a fetch, consuming (and so releasing) its page.
///
/// # Errors
///
/// Returns [`ExchangeError::Codec`] if encoding fails; the page is released either way.
pub fn encode_reply(reply: Result<ExchangeResponse>) -> Result<Vec<u8>> {
    let wire = match reply {
        Ok(resp) => {
            let (page, finished) = resp.into_parts();
            let page = page.as_ref().map(encode_wire_page).transpose()?;
            WireReply::Response { finished, page }
        }
        Err(err) => WireReply::Error(err),
    };
    to_bytes("encode reply", wire)
}

/// Rebuild a fetch outcome; a remote error comes back as `Err`.
///
/// # Errors
///
/// Returns the sink's error, or [`ExchangeError::Codec`] on malformed bytes.
pub fn decode_reply(bytes: &[u8], tracker: Option<&Arc<PageTracker>>) -> Result<ExchangeResponse> {
    let reply: WireReply = from_bytes("decode reply", bytes)?;
    match reply {
        WireReply::Response { finished, page } => {
            let page = page.as_ref().map(|w| decode_wire_page(w, tracker)).transpose()?;
            Ok(ExchangeResponse::new(page, finished))
        }
        WireReply::Error(err) => Err(err),
    }
}
