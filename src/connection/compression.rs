//! Stream-level deflate for `Content-Encoding: deflate` links.
//!
//! Both directions are one continuous zlib stream for the life of the
//! connection. Every write is sync-flushed so the peer can decode each
//! message as soon as it arrives. After [`Deflater::release`] or
//! [`Inflater::release`] the codec state is gone and further calls return
//! empty output instead of an error, since the socket may be torn down
//! concurrently with an in-flight read or write.

use std::io;
use std::sync::{Mutex, PoisonError};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{GnutellaError, Result};

const CHUNK: usize = 4096;

/// Outbound compressor.
#[derive(Debug)]
pub struct Deflater {
    inner: Mutex<Option<Compress>>,
}

impl Default for Deflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Deflater {
    /// Fresh zlib stream at the default level.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Some(Compress::new(Compression::default(), true))),
        }
    }

    /// Compress `data` and sync-flush.
    pub fn deflate(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(compress) = guard.as_mut() else {
            return Ok(Vec::new());
        };

        let start = compress.total_in();
        let mut out = Vec::with_capacity(data.len() / 2 + CHUNK);
        loop {
            if out.len() == out.capacity() {
                out.reserve(CHUNK);
            }
            let consumed = (compress.total_in() - start) as usize;
            compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| codec_error("deflate", e))?;
            let consumed = (compress.total_in() - start) as usize;
            if consumed == data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }

    /// Drop the codec state; idempotent.
    pub fn release(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Whether [`Deflater::release`] has run.
    pub fn is_released(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

/// Inbound decompressor.
#[derive(Debug)]
pub struct Inflater {
    inner: Mutex<Option<Decompress>>,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    /// Fresh zlib stream.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Some(Decompress::new(true))),
        }
    }

    /// Decompress whatever `data` yields; partial blocks are kept for the
    /// next call.
    pub fn inflate(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(decompress) = guard.as_mut() else {
            return Ok(Vec::new());
        };

        let start = decompress.total_in();
        let mut out = Vec::with_capacity(data.len() * 2 + CHUNK);
        loop {
            if out.len() == out.capacity() {
                out.reserve(CHUNK);
            }
            let consumed = (decompress.total_in() - start) as usize;
            let status = decompress
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| codec_error("inflate", e))?;
            let consumed = (decompress.total_in() - start) as usize;
            let drained = consumed == data.len() && out.len() < out.capacity();
            if drained || status == Status::StreamEnd {
                return Ok(out);
            }
        }
    }

    /// Drop the codec state; idempotent.
    pub fn release(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Whether [`Inflater::release`] has run.
    pub fn is_released(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

fn codec_error(what: &str, e: impl std::fmt::Display) -> GnutellaError {
    GnutellaError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{what} failed: {e}"),
    ))
}
