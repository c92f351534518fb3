//! Node formats
//!
//! A node format owns the persistent layout of one node kind: how records
//! pack into a frame, how the header and footer validate, and how records
//! move during splits and merges. The tree core drives formats entirely
//! through the [`NodeFormat`] vtable, selected by the node-type id stored
//! in every frame, so new layouts can register without touching the
//! operation engine.
//!
//! Every mutating primitive returns the exact byte [`Span`]s it dirtied.
//! The operation layer forwards those spans to the transaction adaptor;
//! the format itself never sees the capture API.

use crate::error::{FormatError, Result};

mod fixed;

pub use fixed::{FixedFormat, DATA_OFF, FIXED_NTYPE, HDR_MAGIC};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A dirtied byte range within a node frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Byte offset from the frame start
    pub offset: u32,
    /// Length in bytes
    pub len: u32,
}

impl Span {
    /// Build a span from a frame-relative range
    pub fn new(offset: usize, len: usize) -> Span {
        Span {
            offset: offset as u32,
            len: len as u32,
        }
    }
}

/// Which end of the source node `move_recs` drains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveEnd {
    /// Take the source's first record, append after the target's last
    Front,
    /// Take the source's last record, insert before the target's first
    Back,
}

/// How many records `move_recs` transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveQuota {
    /// Exactly this many records (or until the source drains)
    Count(u16),
    /// Until free space in the target no longer exceeds the source's
    Even,
    /// Until the source has no keyed records left
    Max,
}

/// Result of moving records between two nodes
#[derive(Debug)]
pub struct MoveOutcome {
    /// Spans dirtied in the source frame
    pub src_spans: Vec<Span>,
    /// Spans dirtied in the target frame
    pub tgt_spans: Vec<Span>,
    /// Number of records transferred
    pub moved: u16,
}

/// The per-node-type vtable
///
/// All methods operate on a raw frame buffer; callers hold the frame lock
/// and, for mutators, the tree write lock. Indices address record slots:
/// keyed records run `0..count`, and internal nodes carry one extra
/// sentinel slot at index `count` whose key region is unused and whose
/// value is the rightmost child.
pub trait NodeFormat: Send + Sync {
    /// The node-type id frames of this format carry
    fn ntype(&self) -> u32;

    /// Format a fresh frame: header, zero records, sealed footer
    ///
    /// The opaque back-pointer slot is left untouched so that an existing
    /// descriptor binding survives reformatting.
    fn init(
        &self,
        buf: &mut [u8],
        shift: u8,
        level: u8,
        ksize: u16,
        vsize: u16,
        ttype: u32,
    ) -> Vec<Span>;

    /// Invalidate the header so the frame no longer parses as a node
    fn fini(&self, buf: &mut [u8]) -> Vec<Span>;

    /// Header and footer validation, reporting which check failed
    ///
    /// Cheap enough to run on every load. The distinction matters on the
    /// fatal path: a restart-exhausted operation surfaces the specific
    /// failure instead of a generic one.
    fn validate(&self, buf: &[u8]) -> std::result::Result<(), FormatError>;

    /// Header and footer validation as a plain predicate
    fn isvalid(&self, buf: &[u8]) -> bool {
        self.validate(buf).is_ok()
    }

    /// Number of keyed records
    fn count(&self, buf: &[u8]) -> u16;

    /// Number of record slots including the internal-node sentinel
    fn count_rec(&self, buf: &[u8]) -> u16;

    /// Free bytes remaining after all occupied slots
    fn space(&self, buf: &[u8]) -> usize;

    /// Node level; 0 at leaves
    fn level(&self, buf: &[u8]) -> u8;

    /// Size class recorded in the header
    fn shift(&self, buf: &[u8]) -> u8;

    /// Key size recorded in the header
    fn ksize(&self, buf: &[u8]) -> u16;

    /// The tree's value size recorded in the header
    fn vsize(&self, buf: &[u8]) -> u16;

    /// Effective value length of this node's slots
    ///
    /// Equals `vsize` at leaves and the segment-address width in internal
    /// nodes.
    fn valsize(&self, buf: &[u8]) -> u16;

    /// Whether the record count is (or, predictively, would become) zero
    fn isunderflow(&self, buf: &[u8], predict: bool) -> bool;

    /// Whether one more record slot would not fit
    fn isoverflow(&self, buf: &[u8]) -> bool;

    /// Whether a record of this tree's geometry still fits
    fn isfit(&self, buf: &[u8]) -> bool;

    /// Binary search over the keyed records
    ///
    /// Returns the first index whose key is `>=` the target, and whether
    /// that index is an exact match.
    fn find(&self, buf: &[u8], key: &[u8]) -> (u16, bool);

    /// Key bytes of slot `idx`
    fn key<'a>(&self, buf: &'a [u8], idx: u16) -> &'a [u8];

    /// Value bytes of slot `idx`
    fn val<'a>(&self, buf: &'a [u8], idx: u16) -> &'a [u8];

    /// Mutable value bytes of slot `idx`; the caller reports the span
    fn val_mut<'a>(&self, buf: &'a mut [u8], idx: u16) -> &'a mut [u8];

    /// Split borrow of slot `idx`: shared key bytes, mutable value bytes
    ///
    /// This is the shape a fill callback sees during PUT.
    fn rec_mut<'a>(&self, buf: &'a mut [u8], idx: u16) -> (&'a [u8], &'a mut [u8]);

    /// Child address (raw) stored in slot `idx` of an internal node
    fn child(&self, buf: &[u8], idx: u16) -> u64;

    /// Store a child address in slot `idx` of an internal node
    fn set_child(&self, buf: &mut [u8], idx: u16, raw: u64) -> Vec<Span>;

    /// Open a hole at slot `idx`, shifting later slots right
    fn make(&self, buf: &mut [u8], idx: u16) -> Vec<Span>;

    /// Delete slot `idx`, shifting later slots left
    fn del(&self, buf: &mut [u8], idx: u16) -> Vec<Span>;

    /// Write a record into slot `idx` (the slot must already exist)
    fn set_rec(&self, buf: &mut [u8], idx: u16, key: &[u8], val: &[u8]) -> Vec<Span>;

    /// Change the node level
    fn set_level(&self, buf: &mut [u8], level: u8) -> Vec<Span>;

    /// Recompute and write the footer over the current header
    fn seal(&self, buf: &mut [u8]) -> Vec<Span>;

    /// Move keyed records between two same-level nodes
    fn move_recs(
        &self,
        src: &mut [u8],
        tgt: &mut [u8],
        end: MoveEnd,
        quota: MoveQuota,
    ) -> MoveOutcome;

    /// Structural check: keys strictly ascending, counts within capacity
    fn verify(&self, buf: &[u8]) -> bool;
}

// The leading header fields are a common contract across formats: the
// descriptor cache has to read them before it can pick a vtable.

/// Node-type id stored in a raw frame, readable without a format
pub fn frame_ntype(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[8..12].try_into().unwrap())
}

/// Tree-type id stored in a raw frame
pub fn frame_ttype(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[12..16].try_into().unwrap())
}

/// The opaque back-pointer slot of a raw frame (meaningful only in memory)
pub fn frame_backptr(buf: &[u8]) -> u64 {
    u64::from_le_bytes(buf[16..24].try_into().unwrap())
}

/// Store the opaque back-pointer slot; never captured
pub fn set_frame_backptr(buf: &mut [u8], v: u64) {
    buf[16..24].copy_from_slice(&v.to_le_bytes());
}

/// Registered node formats, keyed by node-type id
///
/// One registry lives in the tree domain; [`FixedFormat`] is registered by
/// default.
pub struct FormatRegistry {
    formats: RwLock<HashMap<u32, Arc<dyn NodeFormat>>>,
}

impl FormatRegistry {
    /// Create a registry holding the built-in formats
    pub fn new() -> FormatRegistry {
        let reg = FormatRegistry {
            formats: RwLock::new(HashMap::new()),
        };
        reg.register(Arc::new(FixedFormat::new()));
        reg
    }

    /// Register a format under its node-type id
    pub fn register(&self, fmt: Arc<dyn NodeFormat>) {
        self.formats.write().unwrap().insert(fmt.ntype(), fmt);
    }

    /// Look up the format for a node-type id
    pub fn get(&self, ntype: u32) -> Result<Arc<dyn NodeFormat>> {
        self.formats
            .read()
            .unwrap()
            .get(&ntype)
            .cloned()
            .ok_or_else(|| FormatError::UnknownType { ntype }.into())
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<u32> = self.formats.read().unwrap().keys().copied().collect();
        f.debug_struct("FormatRegistry").field("ntypes", &ids).finish()
    }
}
