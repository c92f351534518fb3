//! Transaction adaptor
//!
//! The tree does not write a log itself; it reports every byte range it
//! dirties to an external transaction through a [`CaptureSink`]. A [`Tx`]
//! wraps one sink invocation: the operation layer feeds it the spans the
//! format primitives returned, the sink receives `(address, offset,
//! bytes)` triples, and every touched node descriptor stays pinned
//! (transaction refcount) until the post-commit callback runs.
//!
//! [`Credit`] is the up-front estimate: callers size their external
//! transaction from [`Btree::credit`](crate::Btree::credit) before
//! starting an operation.

use crate::cache::NodeDesc;
use crate::error::Result;
use crate::format::Span;
use heddle_seg::{Addr, MemorySegment};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

/// Upper-bound estimate of bytes an operation will dirty
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credit {
    /// Number of distinct captured regions
    pub regions: u32,
    /// Total captured bytes
    pub bytes: u64,
}

impl Credit {
    /// Accumulate another estimate into this one
    pub fn add(&mut self, regions: u32, bytes: u64) {
        self.regions += regions;
        self.bytes += bytes;
    }
}

/// Where dirtied byte ranges go
///
/// Implementations forward to the external write-ahead log. `capture` is a
/// suspension point: a slow log parks the operation state machine.
#[trait_variant::make(Send)]
pub trait CaptureSink: Clone {
    /// Record that `bytes` now live at `offset` within the frame at `addr`
    async fn capture(&self, addr: Addr, offset: u32, bytes: &[u8]) -> Result<()>;
}

/// Sink for read-only operations; captures nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl CaptureSink for NullSink {
    async fn capture(&self, _addr: Addr, _offset: u32, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TxPins {
    pinned: Vec<Arc<NodeDesc>>,
    seen: HashSet<u32>,
}

/// One open transaction against a capture sink
///
/// Dropping an uncommitted transaction unpins every descriptor, standing
/// in for the abort path of the external transaction.
#[derive(Debug)]
pub struct Tx<C: CaptureSink> {
    sink: C,
    pins: Mutex<TxPins>,
}

impl<C: CaptureSink> Tx<C> {
    /// Open a transaction over a sink
    pub fn new(sink: C) -> Tx<C> {
        Tx {
            sink,
            pins: Mutex::new(TxPins::default()),
        }
    }

    /// Forward the spans a mutation dirtied in `desc`'s frame
    ///
    /// Bytes are read from the frame at capture time, so overlapping spans
    /// replay to the final frame contents. The descriptor is pinned on
    /// first capture and stays pinned until commit.
    pub(crate) async fn capture_spans(&self, desc: &Arc<NodeDesc>, spans: &[Span]) -> Result<()> {
        {
            let mut pins = self.pins.lock().unwrap();
            if pins.seen.insert(desc.slot()) {
                desc.pin_tx();
                pins.pinned.push(Arc::clone(desc));
            }
        }
        let addr = desc.addr();
        for span in spans {
            let bytes = {
                let buf = desc.frame().bytes();
                buf[span.offset as usize..(span.offset + span.len) as usize].to_vec()
            };
            self.sink.capture(addr, span.offset, &bytes).await?;
        }
        Ok(())
    }

    /// Post-commit callback: unpin every descriptor this tx touched
    pub fn commit(self) {
        self.unpin_all();
    }

    /// Abort: identical bookkeeping; the external log discards the data
    pub fn abort(self) {
        self.unpin_all();
    }

    fn unpin_all(&self) {
        let mut pins = self.pins.lock().unwrap();
        for desc in pins.pinned.drain(..) {
            desc.unpin_tx();
        }
        pins.seen.clear();
    }
}

impl<C: CaptureSink> Drop for Tx<C> {
    fn drop(&mut self) {
        self.unpin_all();
    }
}

/// One captured region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    /// Frame address
    pub addr: Addr,
    /// Byte offset within the frame
    pub offset: u32,
    /// The captured bytes
    pub bytes: Vec<u8>,
}

/// Capture sink that records every region in memory
///
/// Replaying the records against a blank segment reproduces the frame
/// contents the live operations built, which is exactly the
/// crash-consistency contract the external log relies on.
#[derive(Debug, Clone, Default)]
pub struct MemoryCaptureSink {
    log: Arc<RwLock<Vec<CaptureRecord>>>,
}

impl MemoryCaptureSink {
    /// Create an empty sink
    pub fn new() -> MemoryCaptureSink {
        MemoryCaptureSink::default()
    }

    /// Number of captured regions
    pub fn len(&self) -> usize {
        self.log.read().unwrap().len()
    }

    /// Whether nothing was captured
    pub fn is_empty(&self) -> bool {
        self.log.read().unwrap().is_empty()
    }

    /// Snapshot the captured regions in capture order
    pub fn records(&self) -> Vec<CaptureRecord> {
        self.log.read().unwrap().clone()
    }

    /// Apply every captured region to a segment, materializing frames as
    /// needed
    pub fn replay(&self, seg: &MemorySegment) -> Result<()> {
        for rec in self.log.read().unwrap().iter() {
            let frame = seg.ensure(rec.addr)?;
            let mut buf = frame.bytes_mut();
            let start = rec.offset as usize;
            buf[start..start + rec.bytes.len()].copy_from_slice(&rec.bytes);
        }
        Ok(())
    }
}

impl CaptureSink for MemoryCaptureSink {
    async fn capture(&self, addr: Addr, offset: u32, bytes: &[u8]) -> Result<()> {
        self.log.write().unwrap().push(CaptureRecord {
            addr,
            offset,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heddle_seg::Segment;

    #[tokio::test]
    async fn replay_reproduces_frame_bytes() {
        let sink = MemoryCaptureSink::new();
        let live = MemorySegment::new();
        let addr = live.alloc(9).await.unwrap();
        {
            let frame = live.map(addr).await.unwrap();
            frame.bytes_mut()[64..68].copy_from_slice(&[9, 9, 9, 9]);
        }
        sink.capture(addr, 64, &[9, 9, 9, 9]).await.unwrap();

        let blank = MemorySegment::new();
        sink.replay(&blank).unwrap();
        let frame = blank.map(addr).await.unwrap();
        assert_eq!(&frame.bytes()[64..68], &[9, 9, 9, 9]);
    }

    #[tokio::test]
    async fn later_captures_win_on_replay() {
        let sink = MemoryCaptureSink::new();
        let addr = heddle_seg::Addr::build(0x2000, 9).unwrap();
        sink.capture(addr, 0, &[1, 1]).await.unwrap();
        sink.capture(addr, 0, &[2, 2]).await.unwrap();

        let blank = MemorySegment::new();
        sink.replay(&blank).unwrap();
        let frame = blank.ensure(addr).unwrap();
        assert_eq!(&frame.bytes()[0..2], &[2, 2]);
    }
}
