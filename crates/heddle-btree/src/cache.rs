//! Node descriptor cache
//!
//! Every on-segment node that is currently in use has exactly one
//! in-memory [`NodeDesc`]. The frame's opaque back-pointer slot caches the
//! descriptor's arena index so a descriptor can be found from an address
//! without a map lookup; installation happens under the cache lock with a
//! re-check, so a raced install never produces two descriptors for one
//! frame.
//!
//! A descriptor's reference count tracks outstanding descent holders. At
//! zero the descriptor leaves its tree's active list for the global LRU,
//! where [`NodeCache::purge`] can reclaim it; a later access revives it
//! and rebinds its tree. Descriptors pinned by an open transaction
//! (`txrefs > 0`) are never purged, and a descriptor whose frame free has
//! been delayed refuses new references until the free happens.

use crate::error::{BtreeError, Result};
use crate::format::{frame_backptr, set_frame_backptr};
use crate::registry::TreeDesc;
use heddle_seg::{Addr, Frame, Segment};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Soft cap on cached descriptors; past it, acquire evicts from the LRU.
const NODE_CACHE_CAP: usize = 4096;

/// Where a live descriptor is linked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Place {
    /// Not on any list yet (being installed or torn down)
    Detached,
    /// On its owning tree's active list
    Active,
    /// On the global LRU
    Lru,
}

#[derive(Debug)]
pub(crate) struct NodeState {
    /// Owning tree's pool slot; `None` while on the LRU
    pub tree: Option<u8>,
    /// Outstanding descent holders
    pub refs: u32,
    /// Open transactions holding this node
    pub txrefs: u32,
    /// Frame free deferred until `refs` drops to zero
    pub delayed_free: bool,
    place: Place,
}

/// In-memory handle for a live on-segment node
#[derive(Debug)]
pub(crate) struct NodeDesc {
    addr: Addr,
    frame: Arc<Frame>,
    slot: u32,
    seq: AtomicU64,
    state: RwLock<NodeState>,
}

impl NodeDesc {
    fn new(frame: Arc<Frame>, slot: u32) -> NodeDesc {
        NodeDesc {
            addr: frame.addr(),
            frame,
            slot,
            seq: AtomicU64::new(1),
            state: RwLock::new(NodeState {
                tree: None,
                refs: 0,
                txrefs: 0,
                delayed_free: false,
                place: Place::Detached,
            }),
        }
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Current sequence counter
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Bump the sequence counter after a mutation
    pub fn bump_seq(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether the frame free has been delayed
    pub fn is_delayed_free(&self) -> bool {
        self.state.read().unwrap().delayed_free
    }

    /// Defer the frame free until the last reference drops
    pub fn set_delayed_free(&self) {
        self.state.write().unwrap().delayed_free = true;
    }

    /// Pin for an open transaction; returns false if already pinned-once
    /// semantics are the caller's concern
    pub fn pin_tx(&self) {
        self.state.write().unwrap().txrefs += 1;
    }

    /// Post-commit unpin
    pub fn unpin_tx(&self) {
        let mut st = self.state.write().unwrap();
        debug_assert!(st.txrefs > 0);
        st.txrefs -= 1;
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    slots: Vec<Option<Arc<NodeDesc>>>,
    free: Vec<u32>,
    lru: VecDeque<u32>,
}

impl CacheInner {
    fn alloc_slot(&mut self) -> Option<u32> {
        if let Some(s) = self.free.pop() {
            return Some(s);
        }
        if self.slots.len() >= NODE_CACHE_CAP {
            return None;
        }
        self.slots.push(None);
        Some((self.slots.len() - 1) as u32)
    }

    fn retire_slot(&mut self, slot: u32) {
        self.slots[slot as usize] = None;
        self.free.push(slot);
    }
}

/// The process-wide descriptor arena and LRU
///
/// The single mutex doubles as the LRU lock: it guards the arena, the LRU
/// list, and back-pointer installation.
#[derive(Debug, Default)]
pub(crate) struct NodeCache {
    inner: Mutex<CacheInner>,
}

impl NodeCache {
    pub fn new() -> NodeCache {
        NodeCache::default()
    }

    fn lookup(&self, slot: u64) -> Option<Arc<NodeDesc>> {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(slot as usize).and_then(Clone::clone)
    }

    /// Find or create the descriptor for a pinned frame and take a
    /// reference on it, linking it into `tree`'s active list.
    pub fn acquire(&self, tree: &Arc<TreeDesc>, frame: &Arc<Frame>) -> Result<Arc<NodeDesc>> {
        loop {
            let raw = frame_backptr(&frame.bytes());
            if raw != 0 {
                if let Some(desc) = self.lookup(raw - 1) {
                    if desc.addr() == frame.addr() {
                        self.ref_node(&desc, tree)?;
                        return Ok(desc);
                    }
                }
            }

            // Install path, re-checked under the cache lock.
            let desc = {
                let mut inner = self.inner.lock().unwrap();
                let mut fb = frame.bytes_mut();
                if frame_backptr(&fb) != raw {
                    continue; // lost an install race; retry the fast path
                }
                let slot = match inner.alloc_slot() {
                    Some(s) => s,
                    None => {
                        // Arena full: evict the oldest unpinned LRU entry
                        // and retry, the way a pager would shed cache.
                        if !Self::evict_one(&mut inner) {
                            tracing::warn!(
                                cap = NODE_CACHE_CAP,
                                lru = inner.lru.len(),
                                "descriptor arena exhausted and LRU eviction stalled"
                            );
                            return Err(BtreeError::no_memory("node descriptor"));
                        }
                        continue;
                    }
                };
                let desc = Arc::new(NodeDesc::new(Arc::clone(frame), slot));
                inner.slots[slot as usize] = Some(Arc::clone(&desc));
                set_frame_backptr(&mut fb, u64::from(slot) + 1);
                desc
            };
            self.ref_node(&desc, tree)?;
            return Ok(desc);
        }
    }

    /// Bump the reference count, reviving the descriptor from the LRU and
    /// rebinding its tree when this is the first holder.
    fn ref_node(&self, desc: &Arc<NodeDesc>, tree: &Arc<TreeDesc>) -> Result<()> {
        let mut st = desc.state.write().unwrap();
        if st.delayed_free {
            return Err(BtreeError::node_busy(desc.addr().raw()));
        }
        st.refs += 1;
        if st.refs == 1 {
            if st.place == Place::Lru {
                let mut inner = self.inner.lock().unwrap();
                inner.lru.retain(|&s| s != desc.slot());
            }
            st.place = Place::Active;
            st.tree = Some(tree.slot());
            tree.push_active(desc.slot());
        } else {
            debug_assert_eq!(st.tree, Some(tree.slot()));
        }
        Ok(())
    }

    /// Drop a reference; at zero the descriptor moves to the LRU, or, when
    /// a delayed free is pending, the frame is returned to the segment.
    pub async fn release<S: Segment>(
        &self,
        desc: &Arc<NodeDesc>,
        tree: &Arc<TreeDesc>,
        seg: &S,
    ) -> Result<()> {
        let free_now = {
            let mut st = desc.state.write().unwrap();
            debug_assert!(st.refs > 0);
            st.refs -= 1;
            if st.refs > 0 {
                false
            } else {
                let free_now = if st.delayed_free {
                    st.place = Place::Detached;
                    let mut inner = self.inner.lock().unwrap();
                    inner.retire_slot(desc.slot());
                    true
                } else {
                    st.place = Place::Lru;
                    let mut inner = self.inner.lock().unwrap();
                    inner.lru.push_back(desc.slot());
                    false
                };
                if st.tree.take().is_some() {
                    tree.drop_active(desc.slot());
                }
                free_now
            }
        };
        if free_now {
            set_frame_backptr(&mut desc.frame().bytes_mut(), 0);
            seg.free(desc.addr()).await.map_err(BtreeError::from)?;
            tracing::trace!(addr = %desc.addr(), "delayed frame free completed");
        }
        Ok(())
    }

    /// Evict up to `n` of the oldest zero-reference descriptors
    ///
    /// Descriptors pinned by an open transaction are skipped. Returns the
    /// number evicted.
    pub fn purge(&self, n: usize) -> usize {
        let candidates: Vec<Arc<NodeDesc>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .lru
                .iter()
                .filter_map(|&s| inner.slots.get(s as usize).and_then(Clone::clone))
                .collect()
        };

        let mut evicted = 0;
        let mut pinned = 0;
        for desc in candidates {
            if evicted >= n {
                break;
            }
            let mut st = desc.state.write().unwrap();
            if st.place != Place::Lru || st.refs != 0 {
                continue;
            }
            if st.txrefs != 0 {
                pinned += 1;
                continue;
            }
            st.place = Place::Detached;
            {
                let mut inner = self.inner.lock().unwrap();
                inner.lru.retain(|&s| s != desc.slot());
                inner.retire_slot(desc.slot());
            }
            set_frame_backptr(&mut desc.frame().bytes_mut(), 0);
            evicted += 1;
            tracing::trace!(addr = %desc.addr(), "purged node descriptor");
        }
        if pinned > 0 && evicted < n {
            tracing::warn!(
                evicted,
                pinned,
                requested = n,
                "purge pressure: transaction pins held back LRU reclaim"
            );
        } else if evicted > 0 {
            tracing::debug!(evicted, requested = n, "LRU purge");
        }
        evicted
    }

    /// Inline single eviction used when the arena hits its cap
    ///
    /// Runs under the cache lock, so the descriptor lock can only be tried:
    /// the lock order everywhere else is descriptor before cache.
    fn evict_one(inner: &mut CacheInner) -> bool {
        while let Some(slot) = inner.lru.pop_front() {
            let Some(desc) = inner.slots.get(slot as usize).and_then(Clone::clone) else {
                continue;
            };
            let Ok(mut st) = desc.state.try_write() else {
                inner.lru.push_back(slot);
                return false;
            };
            if st.place != Place::Lru || st.refs != 0 || st.txrefs != 0 {
                continue;
            }
            st.place = Place::Detached;
            inner.retire_slot(slot);
            set_frame_backptr(&mut desc.frame().bytes_mut(), 0);
            return true;
        }
        false
    }

    /// Number of descriptors currently on the LRU (zero-reference)
    pub fn lru_len(&self) -> usize {
        self.inner.lock().unwrap().lru.len()
    }
}
