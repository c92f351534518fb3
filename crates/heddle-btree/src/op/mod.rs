//! The operation state machine
//!
//! Every public operation runs as a cooperative state machine advancing
//! one phase per tick. A tick never blocks: frame loads, frame allocation
//! and capture are `.await` suspension points that park the operation
//! without holding the tree lock.
//!
//! ```text
//! Init → Cookie → Setup → Lockall → Down → Nextdown* →
//!   { Alloc* (PUT) | Sibling* (ITER/slant) | StoreChild (DEL) | Lock }
//!   → Check → { Makespace (PUT) | Act } → Freenode* (DEL) → Cleanup
//! ```
//!
//! Descent is optimistic: each traversed node's sequence counter is
//! snapshotted, and `Check` re-validates every snapshot under the tree
//! write lock. A failed validation restarts the descent; after
//! [`MAX_TRIALS`] failures the operation escalates to whole-tree locking,
//! which guarantees forward progress at the cost of concurrency.

mod del;
mod iter;
mod put;

use crate::cache::NodeDesc;
use crate::error::{BoxError, BtreeError, BtreeErrorKind, FormatError, Result};
use crate::format::{frame_ttype, NodeFormat, Span};
use crate::tree::Btree;
use crate::txn::{CaptureSink, Tx};
use bytes::Bytes;
use heddle_seg::{Addr, Segment};
use std::ops::BitOr;
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;

/// Optimistic validation failures tolerated before escalating to
/// whole-tree locking
pub const MAX_TRIALS: u32 = 3;

/// Operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Point lookup
    Get,
    /// Insert
    Put,
    /// Delete
    Del,
    /// Neighbor lookup
    Iter,
}

/// Operation flags
///
/// Combine with `|`: `OpFlags::SLANT | OpFlags::LOCKALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpFlags(u32);

impl OpFlags {
    /// No flags
    pub const NONE: OpFlags = OpFlags(0);
    /// Try the fast-path cookie before descending
    pub const COOKIE: OpFlags = OpFlags(1 << 0);
    /// Take the whole-tree write lock before descent
    pub const LOCKALL: OpFlags = OpFlags(1 << 1);
    /// GET: exact match only (the default behavior, named for symmetry)
    pub const EQUAL: OpFlags = OpFlags(1 << 2);
    /// GET: return the key or its successor
    pub const SLANT: OpFlags = OpFlags(1 << 3);
    /// ITER: ascending neighbor
    pub const NEXT: OpFlags = OpFlags(1 << 4);
    /// ITER: descending neighbor
    pub const PREV: OpFlags = OpFlags(1 << 5);

    /// Whether every flag in `other` is set
    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpFlags {
    type Output = OpFlags;

    fn bitor(self, rhs: OpFlags) -> OpFlags {
        OpFlags(self.0 | rhs.0)
    }
}

/// Status of a completed operation, reported through the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpStatus {
    /// The operation found or placed its record
    #[default]
    Success,
    /// PUT found the key already present; nothing was mutated
    KeyExists,
    /// GET/DEL did not find the key
    KeyNotFound,
    /// ITER/SLANT ran off the edge of the tree
    KeyBtreeBoundary,
}

/// Fast-path hint returned by a previous operation
///
/// Carries the leaf's address and sequence snapshot; a later operation on
/// a nearby key can validate it and skip the descent entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie {
    pub(crate) addr: Addr,
    pub(crate) seq: u64,
}

/// Result of one operation
#[derive(Debug, Clone)]
pub struct Record {
    /// The key the operation settled on (for ITER/SLANT, the neighbor)
    pub key: Bytes,
    /// The value read or written; empty when no record was touched
    pub val: Bytes,
    /// Outcome status
    pub status: OpStatus,
    /// Fast-path hint for a follow-up operation, when one is available
    pub cookie: Option<Cookie>,
    /// Optimistic restarts this operation went through
    pub restarts: u32,
}

/// How a callback sees the record's value buffer
pub enum SlotVal<'a> {
    /// Read-only view (GET, ITER, DEL, PUT of an existing key)
    Read(&'a [u8]),
    /// Fill buffer (PUT of a new key)
    Write(&'a mut [u8]),
}

/// The record slot handed to an operation callback
///
/// Key and value alias the node frame; the callback must not retain them
/// past its return and must not reenter the tree.
pub struct RecSlot<'a> {
    /// Key bytes in the frame
    pub key: &'a [u8],
    /// Value bytes in the frame
    pub val: SlotVal<'a>,
    /// Status at callback time
    pub status: OpStatus,
}

/// Callback result; an error aborts the operation with full undo
pub type CbResult = std::result::Result<(), BoxError>;

/// Phases of the operation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Cookie,
    Setup,
    Lockall,
    Down,
    Nextdown,
    Alloc,
    Sibling,
    StoreChild,
    Lock,
    Check,
    Makespace,
    Act,
    Freenode,
    Cleanup,
}

/// One entry of the per-operation level stack
#[derive(Default)]
struct Level {
    /// Node bound at this level during descent
    node: Option<Arc<NodeDesc>>,
    /// Sequence snapshot taken when the node was bound
    seq: u64,
    /// At internal levels the child index taken; at the leaf the record
    /// index `find` returned
    idx: u16,
    /// Whether `find` was an exact match
    found: bool,
    /// Spare node reserved for a split at this level (PUT)
    alloc: Option<Arc<NodeDesc>>,
    /// Sibling-path node at this level (ITER/SLANT)
    sib: Option<Arc<NodeDesc>>,
    /// Sibling's sequence snapshot
    sib_seq: u64,
    /// Frame marked for free by underflow resolution (DEL)
    freenode: bool,
}

/// Undo plan for a callback failure after MAKESPACE
enum UndoPlan {
    /// A plain hole was opened at (node, index)
    Make(Arc<NodeDesc>, u16),
    /// A leaf split happened; reverse the move and close the hole
    Split {
        leaf: Arc<NodeDesc>,
        spare: Arc<NodeDesc>,
        inserted: (Arc<NodeDesc>, u16),
    },
    /// The root itself split; reverse both moves and restore the root
    RootSplit {
        root: Arc<NodeDesc>,
        extra: Arc<NodeDesc>,
        spare: Arc<NodeDesc>,
        inserted: (Arc<NodeDesc>, u16),
    },
}

/// Per-operation context plus the tick driver
pub(crate) struct OpExec<'a, S: Segment, C: CaptureSink> {
    tree: &'a Btree<S>,
    op: Opcode,
    flags: OpFlags,
    key: Bytes,
    cb: &'a mut (dyn FnMut(&mut RecSlot<'_>) -> CbResult + Send),
    tx: Option<&'a Tx<C>>,

    levels: Vec<Level>,
    height: u32,
    cur: usize,
    root_used: u16,

    trials: u32,
    restarts: u32,
    lockall: bool,
    cookie_only: bool,

    extra: Option<Arc<NodeDesc>>,
    spare_pool: Vec<Arc<NodeDesc>>,
    consumed: Vec<Arc<NodeDesc>>,

    other_child: Option<Arc<NodeDesc>>,
    other_seq: u64,
    free_other: bool,

    pivot: Option<usize>,
    sib_done: usize,

    guard: Option<OwnedRwLockWriteGuard<()>>,
    dirty: Vec<(Arc<NodeDesc>, Vec<Span>)>,
    promote: Option<(Vec<u8>, Addr)>,
    act_slot: Option<(Arc<NodeDesc>, u16)>,
    undo: Option<UndoPlan>,
    free_cursor: usize,

    status: OpStatus,
    out_key: Bytes,
    out_val: Bytes,
    cookie_in: Option<Cookie>,
    cookie_out: Option<Cookie>,
}

impl<'a, S, C> OpExec<'a, S, C>
where
    S: Segment + Sync + 'static,
    C: CaptureSink + Sync,
{
    pub fn new(
        tree: &'a Btree<S>,
        op: Opcode,
        flags: OpFlags,
        key: Bytes,
        cookie: Option<Cookie>,
        tx: Option<&'a Tx<C>>,
        cb: &'a mut (dyn FnMut(&mut RecSlot<'_>) -> CbResult + Send),
    ) -> OpExec<'a, S, C> {
        OpExec {
            tree,
            op,
            flags,
            key,
            cb,
            tx,
            levels: Vec::new(),
            height: 0,
            cur: 0,
            root_used: 0,
            trials: 0,
            restarts: 0,
            lockall: flags.contains(OpFlags::LOCKALL),
            cookie_only: false,
            extra: None,
            spare_pool: Vec::new(),
            consumed: Vec::new(),
            other_child: None,
            other_seq: 0,
            free_other: false,
            pivot: None,
            sib_done: 0,
            guard: None,
            dirty: Vec::new(),
            promote: None,
            act_slot: None,
            undo: None,
            free_cursor: 0,
            status: OpStatus::Success,
            out_key: Bytes::new(),
            out_val: Bytes::new(),
            cookie_in: cookie,
            cookie_out: None,
        }
    }

    /// Run the operation to completion
    pub async fn run(mut self) -> Result<Record> {
        let driven = self.drive().await;
        let cleaned = self.cleanup_all().await;
        driven?;
        cleaned?;
        Ok(Record {
            key: std::mem::take(&mut self.out_key),
            val: std::mem::take(&mut self.out_val),
            status: self.status,
            cookie: self.cookie_out,
            restarts: self.restarts,
        })
    }

    async fn drive(&mut self) -> Result<()> {
        let mut phase = Phase::Init;
        loop {
            tracing::trace!(?phase, op = ?self.op, "tick");
            phase = match phase {
                Phase::Init => self.init()?,
                Phase::Cookie => self.cookie().await?,
                Phase::Setup => self.setup().await?,
                Phase::Lockall => self.lockall().await?,
                Phase::Down => self.down().await?,
                Phase::Nextdown => self.nextdown().await?,
                Phase::Alloc => self.alloc().await?,
                Phase::Sibling => self.sibling().await?,
                Phase::StoreChild => self.store_child().await?,
                Phase::Lock => self.lock().await?,
                Phase::Check => self.check()?,
                Phase::Makespace => self.makespace()?,
                Phase::Act => self.act().await?,
                Phase::Freenode => self.freenode().await?,
                Phase::Cleanup => return Ok(()),
            };
        }
    }

    // ---- common helpers -------------------------------------------------

    fn fmt(&self) -> &Arc<dyn NodeFormat> {
        self.tree.fmt()
    }

    fn leaf_index(&self) -> usize {
        if self.cookie_only {
            0
        } else {
            self.height as usize - 1
        }
    }

    /// Whether the operation walks toward larger keys
    fn dir_next(&self) -> bool {
        !self.flags.contains(OpFlags::PREV)
    }

    /// Whether this operation may need a sibling descent
    fn wants_pivot(&self) -> bool {
        self.op == Opcode::Iter || (self.op == Opcode::Get && self.flags.contains(OpFlags::SLANT))
    }

    /// Record a validation failure and pick the restart target
    ///
    /// Escalates to whole-tree locking after [`MAX_TRIALS`] failures; a
    /// failure while the whole-tree lock is already held is fatal.
    fn restart(&mut self) -> Result<Phase> {
        if self.guard.is_some() && (self.lockall || self.flags.contains(OpFlags::LOCKALL)) {
            return Err(BtreeError::retry_exhausted(self.trials));
        }
        self.trials += 1;
        self.restarts += 1;
        if self.trials >= MAX_TRIALS && !self.lockall {
            self.lockall = true;
            tracing::debug!(op = ?self.op, trials = self.trials, "escalating to whole-tree lock");
        } else {
            tracing::trace!(op = ?self.op, trials = self.trials, "restarting descent");
        }
        self.guard = None;
        Ok(Phase::Setup)
    }

    /// A node failed format validation during descent
    ///
    /// Restart-triggering like any lost race, but once the whole-tree
    /// lock is held a bad frame cannot be a race: the specific failed
    /// check (magic, checksum, geometry) surfaces as the operation error.
    fn restart_bad_format(&mut self, raw: u64, fe: FormatError) -> Result<Phase> {
        if self.guard.is_some() && (self.lockall || self.flags.contains(OpFlags::LOCKALL)) {
            return Err(BtreeError::from(fe)
                .with_context(format!("node at {:#018x} failed validation", raw)));
        }
        tracing::debug!(addr = raw, error = %fe, "node failed format validation");
        self.restart()
    }

    /// Validate and bind a child address read out of a frame
    ///
    /// A garbage pointer is fatal. A pointer whose frame vanished is a
    /// lost race with a concurrent free and surfaces as `NodeBusy`, which
    /// every load site treats as a restart trigger.
    async fn load_node(&mut self, raw: u64) -> Result<Arc<NodeDesc>> {
        let addr = Addr::from_raw(raw);
        if !addr.is_valid() {
            return Err(BtreeError::bad_address(raw));
        }
        if !self.tree.seg().contains(addr) {
            return Err(BtreeError::node_busy(raw));
        }
        let frame = match self.tree.seg().map(addr).await {
            Ok(f) => f,
            Err(heddle_seg::SegError::Unmapped { .. }) => {
                return Err(BtreeError::node_busy(raw));
            }
            Err(e) => return Err(e.into()),
        };
        self.tree.domain().cache().acquire(self.tree.td(), &frame)
    }

    /// Allocate (or reuse) a spare node frame of the tree's size class
    async fn alloc_spare(&mut self) -> Result<Arc<NodeDesc>> {
        if let Some(d) = self.spare_pool.pop() {
            return Ok(d);
        }
        let addr = self.tree.seg().alloc(self.tree.td().geom().shift).await?;
        let frame = self.tree.seg().map(addr).await?;
        self.tree.domain().cache().acquire(self.tree.td(), &frame)
    }

    /// Record dirtied spans and bump the node's sequence counter
    fn mark_dirty(&mut self, desc: &Arc<NodeDesc>, spans: Vec<Span>) {
        desc.bump_seq();
        self.dirty.push((Arc::clone(desc), spans));
    }

    /// Forward every recorded span to the transaction adaptor
    async fn flush_captures(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let dirty = std::mem::take(&mut self.dirty);
        if let Some(tx) = self.tx {
            for (desc, spans) in &dirty {
                tx.capture_spans(desc, spans).await?;
            }
        }
        Ok(())
    }

    async fn release_node(&mut self, desc: Arc<NodeDesc>) -> Result<()> {
        self.tree
            .domain()
            .cache()
            .release(&desc, self.tree.td(), self.tree.seg())
            .await
    }

    /// Release every node bound by the descent, keeping spares for reuse
    async fn release_descent(&mut self) -> Result<()> {
        let mut held = Vec::new();
        for lvl in &mut self.levels {
            if let Some(n) = lvl.node.take() {
                held.push(n);
            }
            if let Some(s) = lvl.sib.take() {
                held.push(s);
            }
            if let Some(a) = lvl.alloc.take() {
                self.spare_pool.push(a);
            }
            lvl.freenode = false;
        }
        if let Some(o) = self.other_child.take() {
            held.push(o);
        }
        for desc in held {
            self.release_node(desc).await?;
        }
        self.pivot = None;
        self.sib_done = 0;
        self.free_other = false;
        self.promote = None;
        self.act_slot = None;
        self.undo = None;
        self.dirty.clear();
        Ok(())
    }

    /// The Cleanup/Fini phases: drop every held resource
    async fn cleanup_all(&mut self) -> Result<()> {
        self.guard = None;
        let mut first_err: Option<BtreeError> = None;
        if let Err(e) = self.release_descent().await {
            first_err.get_or_insert(e);
        }
        // Nodes wired into the tree by this operation: plain release.
        let consumed = std::mem::take(&mut self.consumed);
        for desc in consumed {
            if let Err(e) = self.release_node(desc).await {
                first_err.get_or_insert(e);
            }
        }
        // Unused spares never became tree nodes; give their frames back.
        let mut spares = std::mem::take(&mut self.spare_pool);
        if let Some(extra) = self.extra.take() {
            spares.push(extra);
        }
        for desc in spares {
            desc.set_delayed_free();
            if let Err(e) = self.release_node(desc).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---- common phases --------------------------------------------------

    fn init(&mut self) -> Result<Phase> {
        let want = self.tree.td().geom().ksize as usize;
        if self.key.len() != want {
            return Err(BtreeError::invalid_key(self.key.len(), want));
        }
        if self.flags.contains(OpFlags::COOKIE)
            && self.cookie_in.is_some()
            && self.op != Opcode::Iter
        {
            Ok(Phase::Cookie)
        } else {
            Ok(Phase::Setup)
        }
    }

    /// Validate the caller's leaf hint; on success skip straight to Lock
    async fn cookie(&mut self) -> Result<Phase> {
        let ck = self.cookie_in.take().unwrap();
        if !ck.addr.is_valid() || !self.tree.seg().contains(ck.addr) {
            return Ok(Phase::Setup);
        }
        let Ok(frame) = self.tree.seg().map(ck.addr).await else {
            return Ok(Phase::Setup);
        };
        let Ok(desc) = self.tree.domain().cache().acquire(self.tree.td(), &frame) else {
            return Ok(Phase::Setup);
        };

        let verdict = {
            let buf = desc.frame().bytes();
            let fmt = self.fmt();
            if desc.seq() != ck.seq
                || !fmt.isvalid(&buf)
                || fmt.level(&buf) != 0
                || frame_ttype(&buf) != self.tree.td().geom().ttype
            {
                None
            } else {
                let (idx, found) = fmt.find(&buf, &self.key);
                let used = fmt.count(&buf);
                let usable = match self.op {
                    Opcode::Get => found,
                    Opcode::Del => found && used >= 2,
                    Opcode::Put => {
                        found || (idx > 0 && idx < used && !fmt.isoverflow(&buf))
                    }
                    Opcode::Iter => false,
                };
                usable.then_some((idx, found))
            }
        };

        match verdict {
            Some((idx, found)) => {
                tracing::trace!(op = ?self.op, "cookie hit; skipping descent");
                self.levels = vec![Level {
                    node: Some(desc),
                    seq: ck.seq,
                    idx,
                    found,
                    ..Level::default()
                }];
                self.cookie_only = true;
                Ok(Phase::Lock)
            }
            None => {
                self.release_node(desc).await?;
                Ok(Phase::Setup)
            }
        }
    }

    async fn setup(&mut self) -> Result<Phase> {
        self.release_descent().await?;
        self.cookie_only = false;
        self.cur = 0;
        self.root_used = 0;
        self.height = self.tree.td().height();
        debug_assert!(self.height >= 1);
        self.levels = std::iter::repeat_with(Level::default)
            .take(self.height as usize)
            .collect();
        Ok(Phase::Lockall)
    }

    async fn lockall(&mut self) -> Result<Phase> {
        if (self.lockall || self.flags.contains(OpFlags::LOCKALL)) && self.guard.is_none() {
            self.guard = Some(self.tree.td().lock().write_owned().await);
        }
        Ok(Phase::Down)
    }

    async fn down(&mut self) -> Result<Phase> {
        let root_addr = self.tree.td().root_addr();
        let frame = self.tree.seg().map(root_addr).await?;
        match self.tree.domain().cache().acquire(self.tree.td(), &frame) {
            Ok(desc) => {
                self.levels[0].seq = desc.seq();
                self.levels[0].node = Some(desc);
                self.cur = 0;
                Ok(Phase::Nextdown)
            }
            Err(e) if e.kind() == BtreeErrorKind::NodeBusy => self.restart(),
            Err(e) => Err(e),
        }
    }

    /// One step of the descent: bind, search, follow a child
    async fn nextdown(&mut self) -> Result<Phase> {
        let desc = Arc::clone(self.levels[self.cur].node.as_ref().unwrap());
        let fmt = Arc::clone(self.fmt());
        let step = {
            let buf = desc.frame().bytes();
            let geom = self.tree.td().geom();
            match fmt.validate(&buf) {
                Err(fe) => Err(fe),
                Ok(())
                    if fmt.shift(&buf) != desc.addr().shift()
                        || frame_ttype(&buf) != geom.ttype =>
                {
                    Ok(None)
                }
                Ok(()) => {
                    let level = fmt.level(&buf);
                    let expect = self.height - 1 - self.cur as u32;
                    if u32::from(level) != expect {
                        Ok(None)
                    } else {
                        if self.cur == 0 {
                            self.root_used = fmt.count(&buf);
                        }
                        let (idx, found) = fmt.find(&buf, &self.key);
                        if level > 0 {
                            let child_idx = if found { idx + 1 } else { idx };
                            let nrec = fmt.count_rec(&buf);
                            if self.wants_pivot() {
                                let has_neighbor = if self.dir_next() {
                                    child_idx + 1 < nrec
                                } else {
                                    child_idx > 0
                                };
                                if has_neighbor {
                                    self.pivot = Some(self.cur);
                                }
                            }
                            Ok(Some((child_idx, found, Some(fmt.child(&buf, child_idx)))))
                        } else {
                            Ok(Some((idx, found, None)))
                        }
                    }
                }
            }
        };

        let (idx, found, child) = match step {
            Err(fe) => return self.restart_bad_format(desc.addr().raw(), fe),
            Ok(None) => return self.restart(),
            Ok(Some(step)) => step,
        };
        self.levels[self.cur].idx = idx;
        self.levels[self.cur].found = found;

        match child {
            Some(raw) => match self.load_node(raw).await {
                Ok(desc) => {
                    self.cur += 1;
                    self.levels[self.cur].seq = desc.seq();
                    self.levels[self.cur].node = Some(desc);
                    Ok(Phase::Nextdown)
                }
                Err(e) if e.kind() == BtreeErrorKind::NodeBusy => self.restart(),
                Err(e) => Err(e),
            },
            None => self.dispatch_leaf(idx, found),
        }
    }

    /// Route from the bound leaf to the op-specific pre-lock phase
    fn dispatch_leaf(&mut self, idx: u16, found: bool) -> Result<Phase> {
        let leaf = self.levels[self.cur].node.as_ref().unwrap();
        let used = {
            let buf = leaf.frame().bytes();
            self.fmt().count(&buf)
        };
        Ok(match self.op {
            Opcode::Put => {
                if found {
                    Phase::Lock
                } else {
                    Phase::Alloc
                }
            }
            Opcode::Del => {
                if self.height >= 2 && self.root_used == 1 {
                    Phase::StoreChild
                } else {
                    Phase::Lock
                }
            }
            Opcode::Get => {
                let slant = self.flags.contains(OpFlags::SLANT);
                if slant && !found && idx == used && self.pivot.is_some() {
                    Phase::Sibling
                } else {
                    Phase::Lock
                }
            }
            Opcode::Iter => {
                let need_sib = if self.dir_next() {
                    idx + u16::from(found) >= used
                } else {
                    idx == 0
                };
                if need_sib && self.pivot.is_some() {
                    Phase::Sibling
                } else {
                    Phase::Lock
                }
            }
        })
    }

    /// Reserve spare frames for every level a PUT would overflow
    ///
    /// One allocation per tick so that a suspended allocator never blocks
    /// the tree lock. Advisory at this point; Check revalidates the whole
    /// path before the spares are used.
    async fn alloc(&mut self) -> Result<Phase> {
        let leaf_i = self.height as usize - 1;
        let mut i = leaf_i as isize;
        while i >= 0 {
            let lvl = i as usize;
            let overflow = {
                let desc = self.levels[lvl].node.as_ref().unwrap();
                let buf = desc.frame().bytes();
                if !self.fmt().isvalid(&buf) {
                    None
                } else {
                    Some(self.fmt().isoverflow(&buf))
                }
            };
            let Some(overflow) = overflow else {
                return self.restart();
            };
            if !overflow {
                break;
            }
            if self.levels[lvl].alloc.is_none() {
                let d = self.alloc_spare().await?;
                self.levels[lvl].alloc = Some(d);
                return Ok(Phase::Alloc);
            }
            if lvl == 0 && self.extra.is_none() {
                let d = self.alloc_spare().await?;
                self.extra = Some(d);
                return Ok(Phase::Alloc);
            }
            i -= 1;
        }
        Ok(Phase::Lock)
    }

    /// Load one node of the sibling path (ITER/SLANT)
    async fn sibling(&mut self) -> Result<Phase> {
        let p = self.pivot.unwrap();
        let next = self.dir_next();
        let parent = if self.sib_done == 0 {
            Arc::clone(self.levels[p].node.as_ref().unwrap())
        } else {
            Arc::clone(self.levels[p + self.sib_done].sib.as_ref().unwrap())
        };

        let raw = {
            let buf = parent.frame().bytes();
            let fmt = self.fmt();
            if !fmt.isvalid(&buf) || fmt.level(&buf) == 0 {
                None
            } else {
                let nrec = fmt.count_rec(&buf);
                let child_idx = if self.sib_done == 0 {
                    let taken = self.levels[p].idx;
                    if next {
                        taken.checked_add(1).filter(|&c| c < nrec)
                    } else {
                        taken.checked_sub(1)
                    }
                } else if next {
                    Some(0)
                } else {
                    Some(nrec - 1)
                };
                child_idx.map(|ci| fmt.child(&buf, ci))
            }
        };
        let Some(raw) = raw else {
            return self.restart();
        };

        match self.load_node(raw).await {
            Ok(desc) => {
                let tgt = p + self.sib_done + 1;
                self.levels[tgt].sib_seq = desc.seq();
                self.levels[tgt].sib = Some(desc);
                self.sib_done += 1;
                if tgt == self.height as usize - 1 {
                    Ok(Phase::Lock)
                } else {
                    Ok(Phase::Sibling)
                }
            }
            Err(e) if e.kind() == BtreeErrorKind::NodeBusy => self.restart(),
            Err(e) => Err(e),
        }
    }

    /// DEL: when the root holds exactly two children, bind the one the
    /// descent did not take so a root demotion can happen under one lock
    async fn store_child(&mut self) -> Result<Phase> {
        let root = Arc::clone(self.levels[0].node.as_ref().unwrap());
        let raw = {
            let buf = root.frame().bytes();
            let fmt = self.fmt();
            if !fmt.isvalid(&buf) || fmt.level(&buf) == 0 || fmt.count(&buf) != 1 {
                None
            } else {
                let other_idx = 1 - self.levels[0].idx;
                Some(fmt.child(&buf, other_idx))
            }
        };
        let Some(raw) = raw else {
            // The two-children condition evaporated; a plain delete is fine.
            return Ok(Phase::Lock);
        };
        match self.load_node(raw).await {
            Ok(desc) => {
                self.other_seq = desc.seq();
                self.other_child = Some(desc);
                Ok(Phase::Lock)
            }
            Err(e) if e.kind() == BtreeErrorKind::NodeBusy => self.restart(),
            Err(e) => Err(e),
        }
    }

    async fn lock(&mut self) -> Result<Phase> {
        if self.guard.is_none() {
            self.guard = Some(self.tree.td().lock().write_owned().await);
        }
        Ok(Phase::Check)
    }

    /// Optimistic validation under the tree write lock
    fn check(&mut self) -> Result<Phase> {
        if !self.cookie_only && self.tree.td().height() != self.height {
            tracing::trace!("height changed during descent");
            return self.restart();
        }
        let fmt = Arc::clone(self.fmt());
        let mut ok = true;
        for lvl in &self.levels {
            if let Some(d) = &lvl.node {
                if d.is_delayed_free()
                    || d.seq() != lvl.seq
                    || !fmt.isvalid(&d.frame().bytes())
                {
                    ok = false;
                    break;
                }
            }
            if let Some(d) = &lvl.sib {
                if d.is_delayed_free()
                    || d.seq() != lvl.sib_seq
                    || !fmt.isvalid(&d.frame().bytes())
                {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            if let Some(d) = &self.other_child {
                if d.is_delayed_free() || d.seq() != self.other_seq {
                    ok = false;
                }
            }
        }
        if !ok {
            return self.restart();
        }

        let leaf_found = self.levels[self.leaf_index()].found;
        if self.op == Opcode::Put && !leaf_found {
            Ok(Phase::Makespace)
        } else {
            Ok(Phase::Act)
        }
    }

    async fn act(&mut self) -> Result<Phase> {
        match self.op {
            Opcode::Put => self.act_put().await,
            Opcode::Del => self.act_del().await,
            Opcode::Get | Opcode::Iter => self.act_fetch().await,
        }
    }
}
