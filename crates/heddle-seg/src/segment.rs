//! The pager interface consumed by the tree core

use crate::addr::Addr;
use crate::error::Result;
use crate::frame::Frame;
use std::sync::Arc;

/// Async frame allocation and pinning within a persistent segment
///
/// This is the surface the tree core sees of the segment allocator and its
/// pager. Implementations might be:
/// - An in-memory map ([`MemorySegment`](crate::MemorySegment))
/// - A memory-mapped file region (user-provided)
/// - A remote paged store (user-provided)
///
/// Clone is required so the tree can share the segment across concurrent
/// operations; implementations are expected to be cheap handles over
/// shared state.
///
/// Every async method is a suspension point for the tree's cooperative
/// operation state machine: a pending frame load or allocation parks the
/// operation without blocking the tree lock.
#[trait_variant::make(Send)]
pub trait Segment: Clone {
    /// Allocate an aligned frame of `2^shift` bytes
    ///
    /// The returned address carries the size class; its pointer is aligned
    /// to the frame size.
    async fn alloc(&self, shift: u8) -> Result<Addr>;

    /// Return a frame to the allocator
    ///
    /// The caller guarantees no live pin remains. Freeing an unmapped
    /// address is an error.
    async fn free(&self, addr: Addr) -> Result<()>;

    /// Pin the frame at `addr` into memory
    ///
    /// Returns a shared handle; the frame stays resident while any handle
    /// lives. Fails with `Unmapped` when the address does not name an
    /// allocated frame.
    async fn map(&self, addr: Addr) -> Result<Arc<Frame>>;

    /// Whether `addr` names an allocated frame in this segment
    ///
    /// Used to reject garbage child pointers read out of frames before any
    /// dereference happens.
    fn contains(&self, addr: Addr) -> bool;
}
