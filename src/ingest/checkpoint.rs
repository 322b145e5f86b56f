//! Streaming progress tracking and resume support (spec.md §4.5).
//!
//! Input streams are read once, without seeking; resuming after a crash
//! means re-opening the blob and fast-forwarding by byte count rather than
//! `seek`ing, since the decompressed stream generally isn't seekable.

use std::io::{BufRead, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Wraps a reader and counts bytes consumed through it, so the ingestion
/// loop can report `bytes_consumed` for `progress = floor(100 *
/// bytes_consumed / bytes_total)` (spec.md §4.5) and for checkpointing.
///
/// The counter is a shared `Arc` rather than a plain field, because the
/// reader is typically handed off to e.g. a `noodles` VCF reader that takes
/// ownership of it; `counter()` lets the caller keep reading the running
/// total after that handoff.
pub struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            consumed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// A cloneable handle to the running byte count, valid after `self` is
    /// moved into a downstream reader.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.consumed.clone()
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.consumed.fetch_add(amt as u64, Ordering::Relaxed);
    }
}

/// Discards `offset` bytes from `reader`, used to fast-forward a freshly
/// re-opened stream back to a task's checkpoint on resume.
pub fn skip_to_offset(reader: &mut impl Read, offset: u64) -> std::io::Result<()> {
    let mut remaining = offset;
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
    }
    Ok(())
}

/// Bounds batch size for the default flush cadence (spec.md §4.5: "bounded
/// batch (default 5 000)").
pub const DEFAULT_BATCH_SIZE: usize = 5_000;

/// Write a Task checkpoint every this many batch flushes.
pub const CHECKPOINT_EVERY_N_FLUSHES: u32 = 4;

pub fn progress_percent(bytes_consumed: u64, bytes_total: u64) -> u8 {
    if bytes_total == 0 {
        return 100;
    }
    ((bytes_consumed as f64 / bytes_total as f64) * 100.0).floor().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn counting_reader_tracks_bytes() {
        let mut reader = CountingReader::new(Cursor::new(b"hello world".to_vec()));
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.bytes_consumed(), 5);
    }

    #[test]
    fn skip_to_offset_discards_bytes() {
        let mut reader = Cursor::new(b"0123456789".to_vec());
        skip_to_offset(&mut reader, 4).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"456789");
    }

    #[test]
    fn progress_percent_bounds_to_100() {
        assert_eq!(progress_percent(50, 100), 50);
        assert_eq!(progress_percent(100, 100), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }
}
