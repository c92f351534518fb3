//! Tree descriptor registry
//!
//! Opened trees are tracked in a fixed pool of descriptor slots keyed by
//! root address, with a bitmap over free slots. Opening an address that is
//! already registered shares the existing descriptor (reference counted);
//! claiming past the pool size is a hard error. The pool size is a
//! deployment constant sized for the handful of metadata trees a back-end
//! keeps open at once.

use crate::cache::NodeDesc;
use crate::error::{BtreeError, Result};
use heddle_seg::Addr;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Maximum number of simultaneously open trees
pub const TREE_POOL_SIZE: usize = 20;

/// Immutable per-tree geometry, read from the root header at open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeGeom {
    pub shift: u8,
    pub ksize: u16,
    pub vsize: u16,
    pub ttype: u32,
    pub ntype: u32,
}

#[derive(Debug)]
pub(crate) struct TreeMut {
    /// Root node descriptor, held for the lifetime of the open tree
    pub root: Option<Arc<NodeDesc>>,
    /// Tree height; leaves sit at level 0, so height = root level + 1
    pub height: u32,
    /// Open handles on this descriptor
    pub refs: u32,
    /// Arena slots of descriptors on this tree's active list
    pub active: Vec<u32>,
    /// When the tree was opened; close timeouts measure from here
    pub opened: Instant,
}

/// In-memory handle representing an opened tree
#[derive(Debug)]
pub(crate) struct TreeDesc {
    slot: u8,
    root_addr: Addr,
    geom: TreeGeom,
    /// The per-tree lock; write-exclusive at every commit point
    lock: Arc<tokio::sync::RwLock<()>>,
    state: RwLock<TreeMut>,
}

impl TreeDesc {
    pub fn new(slot: u8, root_addr: Addr, geom: TreeGeom, height: u32) -> TreeDesc {
        TreeDesc {
            slot,
            root_addr,
            geom,
            lock: Arc::new(tokio::sync::RwLock::new(())),
            state: RwLock::new(TreeMut {
                root: None,
                height,
                refs: 1,
                active: Vec::new(),
                opened: Instant::now(),
            }),
        }
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn root_addr(&self) -> Addr {
        self.root_addr
    }

    pub fn geom(&self) -> TreeGeom {
        self.geom
    }

    pub fn lock(&self) -> Arc<tokio::sync::RwLock<()>> {
        Arc::clone(&self.lock)
    }

    pub fn height(&self) -> u32 {
        self.state.read().unwrap().height
    }

    pub fn set_height(&self, h: u32) {
        self.state.write().unwrap().height = h;
    }

    pub fn set_root(&self, root: Arc<NodeDesc>) {
        self.state.write().unwrap().root = Some(root);
    }

    pub fn take_root(&self) -> Option<Arc<NodeDesc>> {
        self.state.write().unwrap().root.take()
    }

    pub fn root_desc(&self) -> Option<Arc<NodeDesc>> {
        self.state.read().unwrap().root.clone()
    }

    pub fn active_len(&self) -> usize {
        self.state.read().unwrap().active.len()
    }

    pub fn opened_at(&self) -> Instant {
        self.state.read().unwrap().opened
    }

    pub fn push_active(&self, slot: u32) {
        self.state.write().unwrap().active.push(slot);
    }

    pub fn drop_active(&self, slot: u32) {
        let mut st = self.state.write().unwrap();
        if let Some(pos) = st.active.iter().position(|&s| s == slot) {
            st.active.swap_remove(pos);
        }
    }

    pub fn add_ref(&self) {
        self.state.write().unwrap().refs += 1;
    }

    /// Drop a handle reference; returns true when this was the last
    pub fn drop_ref(&self) -> bool {
        let mut st = self.state.write().unwrap();
        debug_assert!(st.refs > 0);
        st.refs -= 1;
        st.refs == 0
    }

    pub fn refs(&self) -> u32 {
        self.state.read().unwrap().refs
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    bitmap: u32,
    slots: Vec<Option<Arc<TreeDesc>>>,
    /// Root addresses mid-open, to serialize concurrent opens of one tree
    pending: HashSet<u64>,
}

/// What the pool hands back for an open request
#[derive(Debug)]
pub(crate) enum PoolClaim {
    /// The address is already registered; its refcount was bumped
    Existing(Arc<TreeDesc>),
    /// A fresh slot was reserved; finish with `install` or `abandon`
    New(u8),
    /// Another task is opening the same address; retry shortly
    Busy,
}

/// Fixed pool of tree descriptors
#[derive(Debug)]
pub(crate) struct TreePool {
    inner: RwLock<PoolInner>,
}

impl TreePool {
    pub fn new() -> TreePool {
        TreePool {
            inner: RwLock::new(PoolInner {
                bitmap: 0,
                slots: vec![None; TREE_POOL_SIZE],
                pending: HashSet::new(),
            }),
        }
    }

    /// Find an existing descriptor for `root_addr` or reserve a slot
    pub fn claim(&self, root_addr: Addr) -> Result<PoolClaim> {
        let mut inner = self.inner.write().unwrap();
        for td in inner.slots.iter().flatten() {
            if td.root_addr() == root_addr {
                td.add_ref();
                return Ok(PoolClaim::Existing(Arc::clone(td)));
            }
        }
        if inner.pending.contains(&root_addr.raw()) {
            return Ok(PoolClaim::Busy);
        }
        let free = (!inner.bitmap).trailing_zeros();
        if free as usize >= TREE_POOL_SIZE {
            return Err(BtreeError::pool_full(TREE_POOL_SIZE));
        }
        inner.bitmap |= 1 << free;
        inner.pending.insert(root_addr.raw());
        Ok(PoolClaim::New(free as u8))
    }

    /// Publish a descriptor into its reserved slot
    pub fn install(&self, td: Arc<TreeDesc>) {
        let mut inner = self.inner.write().unwrap();
        inner.pending.remove(&td.root_addr().raw());
        let slot = td.slot() as usize;
        inner.slots[slot] = Some(td);
    }

    /// Give back a reserved slot after a failed open
    pub fn abandon(&self, slot: u8, root_addr: Addr) {
        let mut inner = self.inner.write().unwrap();
        inner.pending.remove(&root_addr.raw());
        inner.bitmap &= !(1 << slot);
    }

    /// Return a slot whose descriptor dropped its last reference
    ///
    /// The caller has already emptied the active list and released the
    /// root; the slot simply goes back to the bitmap.
    pub fn retire(&self, td: &Arc<TreeDesc>) {
        debug_assert_eq!(td.active_len(), 0);
        let mut inner = self.inner.write().unwrap();
        inner.slots[td.slot() as usize] = None;
        inner.bitmap &= !(1 << td.slot());
    }

    /// Number of claimed slots
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().bitmap.count_ones() as usize
    }
}

impl Default for TreePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> Addr {
        Addr::build(n * 0x1000, 9).unwrap()
    }

    fn geom() -> TreeGeom {
        TreeGeom {
            shift: 9,
            ksize: 8,
            vsize: 8,
            ttype: 1,
            ntype: 1,
        }
    }

    #[test]
    fn claim_install_share_retire() {
        let pool = TreePool::new();
        let PoolClaim::New(slot) = pool.claim(addr(1)).unwrap() else {
            panic!("expected fresh slot");
        };
        let td = Arc::new(TreeDesc::new(slot, addr(1), geom(), 1));
        pool.install(Arc::clone(&td));
        assert_eq!(pool.len(), 1);

        let PoolClaim::Existing(shared) = pool.claim(addr(1)).unwrap() else {
            panic!("expected shared descriptor");
        };
        assert_eq!(shared.slot(), slot);
        assert_eq!(shared.refs(), 2);

        assert!(!shared.drop_ref());
        assert!(td.drop_ref());
        pool.retire(&td);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn pool_exhaustion_is_hard_error() {
        let pool = TreePool::new();
        for i in 0..TREE_POOL_SIZE as u64 {
            let PoolClaim::New(slot) = pool.claim(addr(i + 1)).unwrap() else {
                panic!("expected fresh slot");
            };
            pool.install(Arc::new(TreeDesc::new(slot, addr(i + 1), geom(), 1)));
        }
        let err = pool.claim(addr(100)).unwrap_err();
        assert_eq!(err.kind(), crate::error::BtreeErrorKind::PoolFull);
    }

    #[test]
    fn concurrent_open_of_same_root_serializes() {
        let pool = TreePool::new();
        let PoolClaim::New(_) = pool.claim(addr(1)).unwrap() else {
            panic!("expected fresh slot");
        };
        assert!(matches!(pool.claim(addr(1)).unwrap(), PoolClaim::Busy));
    }
}
