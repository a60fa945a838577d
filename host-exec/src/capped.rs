// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Ceiling on captured command output unless configured otherwise.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;

struct Inner {
    buf: Vec<u8>,
    max_bytes: usize,
    dropped: usize,
}

/// An in-memory output sink that stops growing at a fixed ceiling.
///
/// Writes past the ceiling are counted and discarded rather than rejected,
/// so that a chatty process never blocks on a full pipe.  Clones share the
/// same underlying buffer, which is how stdout and stderr end up merged.
#[derive(Clone)]
pub struct CappedBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl CappedBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buf: Vec::new(),
                max_bytes,
                dropped: 0,
            })),
        }
    }

    /// Appends as much of `bytes` as fits, returning how many were kept.
    pub fn push(&self, bytes: &[u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let room = inner.max_bytes.saturating_sub(inner.buf.len());
        let kept = room.min(bytes.len());
        inner.buf.extend_from_slice(&bytes[..kept]);
        inner.dropped += bytes.len() - kept;
        kept
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes discarded because the ceiling was reached.
    pub fn dropped(&self) -> usize {
        self.inner.lock().unwrap().dropped
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped() > 0
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().unwrap().buf.clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().unwrap().buf).into_owned()
    }

    /// Copies `reader` into the buffer until EOF.
    pub async fn fill_from<R>(&self, mut reader: R) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            self.push(&chunk[..n]);
        }
    }
}

impl std::io::Write for CappedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for CappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("CappedBuffer")
            .field("len", &inner.buf.len())
            .field("max_bytes", &inner.max_bytes)
            .field("dropped", &inner.dropped)
            .finish()
    }
}
