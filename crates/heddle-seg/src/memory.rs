//! In-memory segment implementation

use crate::addr::Addr;
use crate::error::{Result, SegError};
use crate::frame::Frame;
use crate::segment::Segment;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Maximum in-memory segment extent (1 GB of frame space)
const SEG_EXTENT: u64 = 1 << 30;

/// First allocatable pointer; pointer zero stays unmapped so that a zeroed
/// child slot can never alias a real frame.
const SEG_BASE: u64 = 1 << 12;

#[derive(Debug)]
struct SegInner {
    frames: HashMap<u64, Arc<Frame>>,
    cursor: u64,
}

/// In-memory segment backed by a frame map and a bump allocator
///
/// Useful for:
/// - Testing
/// - Capture replay (rebuilding a segment from transaction captures)
/// - Small trees that never touch persistent media
///
/// Frames are kept alive by the map even when no pin is outstanding, so an
/// unpinned node revives with its bytes intact, the way a pager would
/// fault it back in.
#[derive(Debug, Clone)]
pub struct MemorySegment {
    inner: Arc<RwLock<SegInner>>,
}

impl MemorySegment {
    /// Create a new empty segment
    pub fn new() -> MemorySegment {
        MemorySegment {
            inner: Arc::new(RwLock::new(SegInner {
                frames: HashMap::new(),
                cursor: SEG_BASE,
            })),
        }
    }

    /// Number of allocated frames
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().frames.len()
    }

    /// Whether no frame is allocated
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().frames.is_empty()
    }

    /// Materialize a frame at an exact address
    ///
    /// Capture replay needs to recreate frames at the addresses the
    /// original run allocated; this installs (or returns) the frame for
    /// `addr` without going through the bump allocator.
    pub fn ensure(&self, addr: Addr) -> Result<Arc<Frame>> {
        if !addr.is_valid() {
            return Err(SegError::InvalidAddress { addr: addr.raw() });
        }
        let mut inner = self.inner.write().unwrap();
        let frame = inner
            .frames
            .entry(addr.ptr())
            .or_insert_with(|| Arc::new(Frame::new(addr)));
        Ok(Arc::clone(frame))
    }
}

impl Default for MemorySegment {
    fn default() -> Self {
        Self::new()
    }
}

impl Segment for MemorySegment {
    async fn alloc(&self, shift: u8) -> Result<Addr> {
        if !(crate::MIN_SHIFT..=crate::MAX_SHIFT).contains(&shift) {
            return Err(SegError::BadShift { shift });
        }
        let size = 1u64 << shift;
        let mut inner = self.inner.write().unwrap();
        // Frames are aligned to their own size, not just 512 bytes.
        let ptr = inner.cursor.next_multiple_of(size);
        if ptr + size > SEG_EXTENT {
            return Err(SegError::Exhausted {
                size: size as usize,
            });
        }
        inner.cursor = ptr + size;
        let addr = Addr::build(ptr, shift)?;
        inner.frames.insert(ptr, Arc::new(Frame::new(addr)));
        tracing::trace!(addr = %addr, size, "allocated frame");
        Ok(addr)
    }

    async fn free(&self, addr: Addr) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.frames.remove(&addr.ptr()) {
            Some(_) => {
                tracing::trace!(addr = %addr, "freed frame");
                Ok(())
            }
            None => Err(SegError::Unmapped { addr: addr.raw() }),
        }
    }

    async fn map(&self, addr: Addr) -> Result<Arc<Frame>> {
        let inner = self.inner.read().unwrap();
        inner
            .frames
            .get(&addr.ptr())
            .cloned()
            .ok_or(SegError::Unmapped { addr: addr.raw() })
    }

    fn contains(&self, addr: Addr) -> bool {
        addr.is_valid() && self.inner.read().unwrap().frames.contains_key(&addr.ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alloc_map_free() {
        let seg = MemorySegment::new();
        let addr = seg.alloc(10).await.unwrap();
        assert_eq!(addr.size(), 1024);
        assert!(seg.contains(addr));

        let frame = seg.map(addr).await.unwrap();
        assert_eq!(frame.addr(), addr);

        seg.free(addr).await.unwrap();
        assert!(!seg.contains(addr));
        assert!(seg.map(addr).await.is_err());
    }

    #[tokio::test]
    async fn frames_are_size_aligned() {
        let seg = MemorySegment::new();
        let small = seg.alloc(9).await.unwrap();
        let big = seg.alloc(14).await.unwrap();
        assert_eq!(small.ptr() % 512, 0);
        assert_eq!(big.ptr() % (1 << 14), 0);
        assert_ne!(small.ptr(), big.ptr());
    }

    #[tokio::test]
    async fn bytes_survive_unpin() {
        let seg = MemorySegment::new();
        let addr = seg.alloc(9).await.unwrap();
        {
            let frame = seg.map(addr).await.unwrap();
            frame.bytes_mut()[100] = 0xab;
        }
        let frame = seg.map(addr).await.unwrap();
        assert_eq!(frame.bytes()[100], 0xab);
    }

    #[tokio::test]
    async fn ensure_installs_exact_address() {
        let seg = MemorySegment::new();
        let addr = Addr::build(0x8000, 9).unwrap();
        assert!(!seg.contains(addr));
        seg.ensure(addr).unwrap();
        assert!(seg.contains(addr));
        assert_eq!(seg.map(addr).await.unwrap().addr(), addr);
    }

    #[tokio::test]
    async fn free_of_unmapped_fails() {
        let seg = MemorySegment::new();
        let addr = Addr::build(0x2000, 9).unwrap();
        assert!(seg.free(addr).await.is_err());
    }
}
