//! Page lists moved alongside a request.
//!
//! A [`BulkDesc`] is attached to a [`Request`](crate::Request) with
//! [`attach_bulk`](crate::Request::attach_bulk) and holds the request's
//! connection for as long as it lives. Pages can be stamped with their file
//! offset and an object id so corruption in transit is caught at the other
//! end.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tracing::{debug, error};

use crate::connection::Connection;

/// Size of one bulk page.
pub const PAGE_SIZE: usize = 4096;

const STAMP_LEN: usize = 2 * std::mem::size_of::<u64>();

/// Errors from bulk descriptor operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BulkError {
    /// Page length is zero or larger than [`PAGE_SIZE`].
    #[error("invalid page length {0}")]
    InvalidLength(usize),

    /// No page at the index.
    #[error("page index {index} out of range ({count} pages)")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Pages in the descriptor.
        count: usize,
    },

    /// Buffer cannot hold a stamp at both ends.
    #[error("buffer of {0} bytes too small for debug stamps")]
    BufferTooSmall(usize),

    /// A debug stamp does not carry the expected offset and id.
    #[error("{who}: page stamp mismatch for offset {off} id {id}")]
    StampMismatch {
        /// Who ran the check.
        who: String,
        /// Expected offset.
        off: u64,
        /// Expected id.
        id: u64,
    },
}

/// One page of a bulk transfer.
#[derive(Debug, Clone)]
pub struct BulkPage {
    /// File offset of the page data.
    pub offset: u64,
    /// Page contents.
    pub buf: BytesMut,
}

/// Ordered pages for one request.
#[derive(Debug)]
pub struct BulkDesc {
    conn: Arc<Connection>,
    pages: Vec<BulkPage>,
}

impl BulkDesc {
    /// Create an empty descriptor on `conn`.
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            pages: Vec::new(),
        }
    }

    /// Append a zeroed page of `len` bytes at `offset`.
    pub fn add_page(&mut self, offset: u64, len: usize) -> Result<&mut BulkPage, BulkError> {
        if len == 0 || len > PAGE_SIZE {
            return Err(BulkError::InvalidLength(len));
        }
        self.pages.push(BulkPage {
            offset,
            buf: BytesMut::zeroed(len),
        });
        debug!(peer = %self.conn.peer(), offset, len, pages = self.pages.len(), "bulk page added");

        let last = self.pages.len() - 1;
        Ok(&mut self.pages[last])
    }

    /// Remove and return the page at `index`.
    pub fn remove_page(&mut self, index: usize) -> Result<BulkPage, BulkError> {
        if index >= self.pages.len() {
            return Err(BulkError::IndexOutOfRange {
                index,
                count: self.pages.len(),
            });
        }
        Ok(self.pages.remove(index))
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Pages in order.
    pub fn pages(&self) -> &[BulkPage] {
        &self.pages
    }

    /// Mutable pages in order.
    pub fn pages_mut(&mut self) -> &mut [BulkPage] {
        &mut self.pages
    }

    /// Connection the transfer runs on.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

/// Write `off` and `id` little-endian at the start and end of `buf`.
pub fn page_debug_setup(buf: &mut [u8], off: u64, id: u64) -> Result<(), BulkError> {
    let len = buf.len();
    if len < 2 * STAMP_LEN {
        return Err(BulkError::BufferTooSmall(len));
    }

    for start in [0, len - STAMP_LEN] {
        let mut stamp = &mut buf[start..start + STAMP_LEN];
        stamp.put_u64_le(off);
        stamp.put_u64_le(id);
    }
    Ok(())
}

/// Verify stamps written by [`page_debug_setup`].
///
/// Every mismatching field is logged before the error is returned.
pub fn page_debug_check(who: &str, buf: &[u8], off: u64, id: u64) -> Result<(), BulkError> {
    let len = buf.len();
    if len < 2 * STAMP_LEN {
        return Err(BulkError::BufferTooSmall(len));
    }

    let mut ok = true;
    for (start, end) in [(0, "start"), (len - STAMP_LEN, "end")] {
        let mut stamp = &buf[start..start + STAMP_LEN];
        let found_off = stamp.get_u64_le();
        let found_id = stamp.get_u64_le();
        if found_off != off {
            error!(who, id, off, found = found_off, end, "page offset stamp mismatch");
            ok = false;
        }
        if found_id != id {
            error!(who, id, off, found = found_id, end, "page id stamp mismatch");
            ok = false;
        }
    }

    if ok {
        Ok(())
    } else {
        Err(BulkError::StampMismatch {
            who: who.to_string(),
            off,
            id,
        })
    }
}
