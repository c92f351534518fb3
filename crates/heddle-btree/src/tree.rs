//! Public tree handles and the process-wide domain
//!
//! A [`BtreeDomain`] owns the shared state every tree in the process uses:
//! the format registry, the tree descriptor pool and the node descriptor
//! cache with its LRU. Handles ([`Btree`]) are cheap clones sharing one
//! tree descriptor; every public operation initializes a per-operation
//! context and runs the state machine in [`crate::op`].

use crate::cache::NodeCache;
use crate::error::{BtreeError, BtreeErrorKind, FormatError, Result};
use crate::format::{frame_ntype, FormatRegistry, NodeFormat, DATA_OFF, FIXED_NTYPE};
use crate::op::{CbResult, Cookie, OpExec, OpFlags, Opcode, OpStatus, RecSlot, Record, SlotVal};
use crate::registry::{PoolClaim, TreeDesc, TreeGeom, TreePool};
use crate::txn::{CaptureSink, Credit, NullSink, Tx};
use bytes::Bytes;
use heddle_seg::{Addr, Segment};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Grace period a close waits for straggling active nodes
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

const ADDR_VSIZE: usize = 8;

/// Geometry and typing of a tree being created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeOpts {
    /// Node size class; every node spans `2^shift` bytes
    pub shift: u8,
    /// Fixed key length in bytes
    pub ksize: u16,
    /// Fixed leaf value length in bytes
    pub vsize: u16,
    /// Tree-type id stamped into every node
    pub ttype: u32,
    /// Node-type id selecting the format vtable
    pub ntype: u32,
}

impl TreeOpts {
    /// Options for a fixed-format tree of the given geometry
    pub fn new(shift: u8, ksize: u16, vsize: u16) -> TreeOpts {
        TreeOpts {
            shift,
            ksize,
            vsize,
            ttype: 1,
            ntype: FIXED_NTYPE,
        }
    }

    /// Override the tree-type id
    pub fn with_ttype(mut self, ttype: u32) -> TreeOpts {
        self.ttype = ttype;
        self
    }

    fn validate(&self) -> Result<()> {
        let size = 1usize
            .checked_shl(u32::from(self.shift))
            .unwrap_or(0);
        let leaf_unit = self.ksize as usize + self.vsize as usize;
        let internal_unit = self.ksize as usize + ADDR_VSIZE;
        let usable = size.saturating_sub(DATA_OFF);
        if !(heddle_seg::MIN_SHIFT..=heddle_seg::MAX_SHIFT).contains(&self.shift)
            || self.ksize == 0
            || self.vsize == 0
            || usable < 2 * leaf_unit
            || usable < 3 * internal_unit
        {
            return Err(FormatError::Unusable {
                ksize: self.ksize,
                vsize: self.vsize,
                size,
            }
            .into());
        }
        Ok(())
    }
}

/// Process-wide tree state: formats, tree pool, descriptor cache
///
/// Create one per process (or per test) and share it via `Arc`. All
/// mutation of the shared structures goes through the domain's locks.
#[derive(Debug)]
pub struct BtreeDomain {
    formats: FormatRegistry,
    pool: TreePool,
    cache: NodeCache,
}

impl BtreeDomain {
    /// Create a domain with the built-in formats registered
    pub fn new() -> Arc<BtreeDomain> {
        Arc::new(BtreeDomain {
            formats: FormatRegistry::new(),
            pool: TreePool::new(),
            cache: NodeCache::new(),
        })
    }

    /// The format registry, for registering additional node formats
    pub fn formats(&self) -> &FormatRegistry {
        &self.formats
    }

    pub(crate) fn cache(&self) -> &NodeCache {
        &self.cache
    }

    /// Evict up to `n` of the oldest idle node descriptors
    ///
    /// Descriptors pinned by open transactions are skipped. Returns the
    /// number evicted. This is the daemon-style reclaim entry point.
    pub fn purge_lru(&self, n: usize) -> usize {
        self.cache.purge(n)
    }

    /// Number of descriptors currently idle on the LRU
    pub fn lru_len(&self) -> usize {
        self.cache.lru_len()
    }

    /// Number of currently open trees
    pub fn open_trees(&self) -> usize {
        self.pool.len()
    }
}

/// Handle to an open tree
///
/// Clones share one tree descriptor and bump its reference count; close
/// each handle (or let the last `close` tear the descriptor down). A
/// handle dropped without `close` keeps the tree registered until the
/// process exits.
pub struct Btree<S: Segment> {
    domain: Arc<BtreeDomain>,
    seg: S,
    td: Arc<TreeDesc>,
    fmt: Arc<dyn NodeFormat>,
}

impl<S: Segment> Clone for Btree<S> {
    fn clone(&self) -> Self {
        self.td.add_ref();
        Btree {
            domain: Arc::clone(&self.domain),
            seg: self.seg.clone(),
            td: Arc::clone(&self.td),
            fmt: Arc::clone(&self.fmt),
        }
    }
}

impl<S: Segment + Sync + 'static> Btree<S> {
    pub(crate) fn domain(&self) -> &BtreeDomain {
        &self.domain
    }

    pub(crate) fn seg(&self) -> &S {
        &self.seg
    }

    pub(crate) fn td(&self) -> &Arc<TreeDesc> {
        &self.td
    }

    pub(crate) fn fmt(&self) -> &Arc<dyn NodeFormat> {
        &self.fmt
    }

    /// Allocate a root frame and register a fresh tree
    pub async fn create(
        domain: Arc<BtreeDomain>,
        seg: S,
        opts: TreeOpts,
    ) -> Result<Btree<S>> {
        let (tree, _spans) = Self::create_raw(domain, seg, opts).await?;
        Ok(tree)
    }

    /// Create a tree, capturing the root initialization into `tx`
    ///
    /// Use this when the tree's birth must be crash-consistent along with
    /// the operations that follow it.
    pub async fn create_in<C: CaptureSink + Sync>(
        domain: Arc<BtreeDomain>,
        seg: S,
        opts: TreeOpts,
        tx: &Tx<C>,
    ) -> Result<Btree<S>> {
        let (tree, spans) = Self::create_raw(domain, seg, opts).await?;
        if let Some(root) = tree.td.root_desc() {
            tx.capture_spans(&root, &spans).await?;
        }
        Ok(tree)
    }

    async fn create_raw(
        domain: Arc<BtreeDomain>,
        seg: S,
        opts: TreeOpts,
    ) -> Result<(Btree<S>, Vec<crate::format::Span>)> {
        opts.validate()?;
        let fmt = domain.formats.get(opts.ntype)?;
        let addr = seg.alloc(opts.shift).await?;
        let frame = seg.map(addr).await?;
        let spans = {
            let mut buf = frame.bytes_mut();
            fmt.init(
                &mut buf[..],
                opts.shift,
                0,
                opts.ksize,
                opts.vsize,
                opts.ttype,
            )
        };
        let geom = TreeGeom {
            shift: opts.shift,
            ksize: opts.ksize,
            vsize: opts.vsize,
            ttype: opts.ttype,
            ntype: opts.ntype,
        };
        tracing::debug!(root = %addr, "created tree");
        let tree = Self::register(domain, seg, addr, geom, 1).await?;
        Ok((tree, spans))
    }

    /// Open the tree rooted at an existing address
    ///
    /// Geometry and height are read out of the root header; opening an
    /// address that is already open shares the registered descriptor.
    pub async fn open(domain: Arc<BtreeDomain>, seg: S, root: Addr) -> Result<Btree<S>> {
        if !root.is_valid() || !seg.contains(root) {
            return Err(BtreeError::bad_address(root.raw()));
        }
        let frame = seg.map(root).await?;
        let (geom, height) = {
            let buf = frame.bytes();
            let ntype = frame_ntype(&buf);
            let fmt = domain.formats.get(ntype)?;
            if let Err(fe) = fmt.validate(&buf) {
                return Err(BtreeError::from(fe)
                    .with_context(format!("root at {:#018x} failed validation", root.raw())));
            }
            if fmt.shift(&buf) != root.shift() {
                return Err(BtreeError::bad_format(root.raw()));
            }
            let geom = TreeGeom {
                shift: fmt.shift(&buf),
                ksize: fmt.ksize(&buf),
                vsize: fmt.vsize(&buf),
                ttype: crate::format::frame_ttype(&buf),
                ntype,
            };
            (geom, u32::from(fmt.level(&buf)) + 1)
        };
        Self::register(domain, seg, root, geom, height).await
    }

    async fn register(
        domain: Arc<BtreeDomain>,
        seg: S,
        root: Addr,
        geom: TreeGeom,
        height: u32,
    ) -> Result<Btree<S>> {
        let fmt = domain.formats.get(geom.ntype)?;
        loop {
            match domain.pool.claim(root)? {
                PoolClaim::Existing(td) => {
                    return Ok(Btree {
                        domain,
                        seg,
                        td,
                        fmt,
                    });
                }
                PoolClaim::Busy => {
                    // Another task is mid-open on the same root; let it
                    // finish and share its descriptor.
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                PoolClaim::New(slot) => {
                    let td = Arc::new(TreeDesc::new(slot, root, geom, height));
                    let frame = match seg.map(root).await {
                        Ok(f) => f,
                        Err(e) => {
                            domain.pool.abandon(slot, root);
                            return Err(e.into());
                        }
                    };
                    match domain.cache.acquire(&td, &frame) {
                        Ok(desc) => {
                            td.set_root(desc);
                            domain.pool.install(Arc::clone(&td));
                            return Ok(Btree {
                                domain,
                                seg,
                                td,
                                fmt,
                            });
                        }
                        Err(e) => {
                            domain.pool.abandon(slot, root);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Close this handle
    ///
    /// Waits up to [`CLOSE_GRACE`] for in-flight operations to release
    /// their nodes; if stragglers remain the close fails and the tree
    /// stays open. The last handle tears the descriptor down.
    pub async fn close(self) -> Result<()> {
        let start = Instant::now();
        while self.td.active_len() > 1 {
            if start.elapsed() >= CLOSE_GRACE {
                let active = self.td.active_len();
                tracing::warn!(
                    active,
                    opened_secs = self.td.opened_at().elapsed().as_secs(),
                    "close timed out with active nodes"
                );
                return Err(BtreeError::close_timeout(active));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.td.drop_ref() {
            if let Some(root) = self.td.take_root() {
                self.domain.cache.release(&root, &self.td, &self.seg).await?;
            }
            self.domain.pool.retire(&self.td);
            tracing::debug!(root = %self.td.root_addr(), "closed tree");
        }
        Ok(())
    }

    /// Destroy an empty tree, returning its root frame to the segment
    ///
    /// Fails (releasing only this handle's reference) when other handles
    /// are open or the root still holds records.
    pub async fn destroy(self) -> Result<()> {
        if self.td.refs() > 1 {
            self.td.drop_ref();
            return Err(BtreeError::new(BtreeErrorKind::NotEmpty, None)
                .with_context("other handles still open"));
        }
        let stats = async {
            let root = self.td.root_addr();
            let frame = self.seg.map(root).await?;
            let buf = frame.bytes();
            Ok::<_, BtreeError>((self.fmt.count(&buf), u32::from(self.fmt.level(&buf)) + 1))
        }
        .await;
        let (used, height) = match stats {
            Ok(s) => s,
            Err(e) => {
                self.td.drop_ref();
                return Err(e);
            }
        };
        if height != 1 || used != 0 {
            self.td.drop_ref();
            return Err(BtreeError::not_empty(u64::from(used)));
        }
        if let Some(root) = self.td.take_root() {
            {
                let frame = Arc::clone(root.frame());
                let mut buf = frame.bytes_mut();
                self.fmt.fini(&mut buf[..]);
            }
            root.set_delayed_free();
            self.domain.cache.release(&root, &self.td, &self.seg).await?;
        }
        self.td.drop_ref();
        self.domain.pool.retire(&self.td);
        tracing::debug!(root = %self.td.root_addr(), "destroyed tree");
        Ok(())
    }

    // ---- operations -----------------------------------------------------

    async fn exec<C: CaptureSink + Sync>(
        &self,
        op: Opcode,
        key: &[u8],
        flags: OpFlags,
        cookie: Option<Cookie>,
        tx: Option<&Tx<C>>,
        cb: &mut (dyn FnMut(&mut RecSlot<'_>) -> CbResult + Send),
    ) -> Result<Record> {
        OpExec::new(
            self,
            op,
            flags,
            Bytes::copy_from_slice(key),
            cookie,
            tx,
            cb,
        )
        .run()
        .await
    }

    /// Insert a record; the callback fills the value bytes in place
    ///
    /// If the key exists the callback sees the live record with status
    /// [`OpStatus::KeyExists`] and nothing is mutated. A callback error
    /// aborts with full undo.
    pub async fn put<C: CaptureSink + Sync>(
        &self,
        key: &[u8],
        mut cb: impl FnMut(&mut RecSlot<'_>) -> CbResult + Send,
        flags: OpFlags,
        cookie: Option<Cookie>,
        tx: &Tx<C>,
    ) -> Result<Record> {
        self.exec(Opcode::Put, key, flags, cookie, Some(tx), &mut cb)
            .await
    }

    /// Look a key up; the callback reads the record in place
    pub async fn get(
        &self,
        key: &[u8],
        mut cb: impl FnMut(&mut RecSlot<'_>) -> CbResult + Send,
        flags: OpFlags,
        cookie: Option<Cookie>,
    ) -> Result<Record> {
        self.exec::<NullSink>(Opcode::Get, key, flags, cookie, None, &mut cb)
            .await
    }

    /// Fetch the neighbor of a key in the direction given by
    /// [`OpFlags::NEXT`] or [`OpFlags::PREV`]
    pub async fn iter(
        &self,
        key: &[u8],
        mut cb: impl FnMut(&mut RecSlot<'_>) -> CbResult + Send,
        flags: OpFlags,
    ) -> Result<Record> {
        self.exec::<NullSink>(Opcode::Iter, key, flags, None, None, &mut cb)
            .await
    }

    /// Delete a key; the callback reads the record before it goes
    pub async fn del<C: CaptureSink + Sync>(
        &self,
        key: &[u8],
        mut cb: impl FnMut(&mut RecSlot<'_>) -> CbResult + Send,
        flags: OpFlags,
        cookie: Option<Cookie>,
        tx: &Tx<C>,
    ) -> Result<Record> {
        self.exec(Opcode::Del, key, flags, cookie, Some(tx), &mut cb)
            .await
    }

    // ---- convenience wrappers -------------------------------------------

    /// Insert `key → val`; returns the record with `KeyExists` when the
    /// key is already present
    pub async fn insert<C: CaptureSink + Sync>(
        &self,
        key: &[u8],
        val: &[u8],
        tx: &Tx<C>,
    ) -> Result<Record> {
        let want = self.td.geom().vsize as usize;
        if val.len() != want {
            return Err(BtreeError::invalid_key(val.len(), want));
        }
        self.put(
            key,
            |slot| {
                if let SlotVal::Write(buf) = &mut slot.val {
                    buf.copy_from_slice(val);
                }
                Ok(())
            },
            OpFlags::NONE,
            None,
            tx,
        )
        .await
    }

    /// Fetch the value stored under `key`, if any
    pub async fn lookup(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let rec = self.get(key, |_| Ok(()), OpFlags::EQUAL, None).await?;
        Ok(match rec.status {
            OpStatus::Success => Some(rec.val),
            _ => None,
        })
    }

    /// The smallest record with key strictly greater than `key`
    pub async fn next(&self, key: &[u8]) -> Result<Option<(Bytes, Bytes)>> {
        let rec = self.iter(key, |_| Ok(()), OpFlags::NEXT).await?;
        Ok(match rec.status {
            OpStatus::Success => Some((rec.key, rec.val)),
            _ => None,
        })
    }

    /// The greatest record with key strictly less than `key`
    pub async fn prev(&self, key: &[u8]) -> Result<Option<(Bytes, Bytes)>> {
        let rec = self.iter(key, |_| Ok(()), OpFlags::PREV).await?;
        Ok(match rec.status {
            OpStatus::Success => Some((rec.key, rec.val)),
            _ => None,
        })
    }

    /// Delete `key`, ignoring the record contents
    pub async fn remove<C: CaptureSink + Sync>(&self, key: &[u8], tx: &Tx<C>) -> Result<Record> {
        self.del(key, |_| Ok(()), OpFlags::NONE, None, tx).await
    }

    // ---- introspection --------------------------------------------------

    /// Current tree height; a lone (possibly empty) root leaf is height 1
    pub fn height(&self) -> u32 {
        self.td.height()
    }

    /// The tree's root address; stable for the tree's whole life
    pub fn root_addr(&self) -> Addr {
        self.td.root_addr()
    }

    /// Estimate the bytes `op` will dirty, for sizing the external
    /// transaction
    pub fn credit(&self, op: Opcode, acc: &mut Credit) {
        let node = 1u64 << self.td.geom().shift;
        let h = u64::from(self.td.height());
        match op {
            // Worst case every level splits plus the root pair.
            Opcode::Put => acc.add((h as u32 + 2) * 2, (h + 2) * 2 * node),
            // Worst case the whole path collapses and the root demotes.
            Opcode::Del => acc.add(h as u32 + 1, (h + 1) * node),
            Opcode::Get | Opcode::Iter => {}
        }
    }

    /// Walk the whole tree checking the structural invariants
    ///
    /// Every leaf must sit at level 0 with uniform depth, keys must be
    /// strictly ascending within a node, and every key in subtree `i`
    /// must be below delimiting key `i` and at or above key `i - 1`.
    pub async fn verify(&self) -> Result<()> {
        let height = self.td.height();
        self.verify_node(self.td.root_addr(), height - 1, None, None)
            .await
    }

    fn verify_node<'v>(
        &'v self,
        addr: Addr,
        level: u32,
        low: Option<Vec<u8>>,
        high: Option<Vec<u8>>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'v>> {
        Box::pin(async move {
            let frame = self.seg.map(addr).await?;
            let children = {
                let buf = frame.bytes();
                let fmt = &self.fmt;
                if !fmt.verify(&buf) || u32::from(fmt.level(&buf)) != level {
                    return Err(BtreeError::bad_format(addr.raw()));
                }
                let used = fmt.count(&buf);
                for i in 0..used {
                    let k = fmt.key(&buf, i);
                    let below_high = high.as_deref().is_none_or(|h| k < h);
                    let above_low = low.as_deref().is_none_or(|l| k >= l);
                    if !below_high || !above_low {
                        return Err(BtreeError::bad_format(addr.raw()));
                    }
                }
                if level == 0 {
                    Vec::new()
                } else {
                    let mut children = Vec::with_capacity(usize::from(used) + 1);
                    for i in 0..=used {
                        let child = Addr::from_raw(fmt.child(&buf, i));
                        let lo = if i == 0 {
                            low.clone()
                        } else {
                            Some(fmt.key(&buf, i - 1).to_vec())
                        };
                        let hi = if i == used {
                            high.clone()
                        } else {
                            Some(fmt.key(&buf, i).to_vec())
                        };
                        children.push((child, lo, hi));
                    }
                    children
                }
            };
            for (child, lo, hi) in children {
                if !child.is_valid() || !self.seg.contains(child) {
                    return Err(BtreeError::bad_address(child.raw()));
                }
                self.verify_node(child, level - 1, lo, hi).await?;
            }
            Ok(())
        })
    }
}
